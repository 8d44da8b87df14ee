pub mod client;
pub mod error;
pub mod fetcher;

pub use crate::error::FetcherError;
pub use crate::fetcher::HttpFetcher;
