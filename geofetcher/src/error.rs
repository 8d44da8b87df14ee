use geostore::errors::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetcherError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("upstream returned HTTP {0}")]
    Status(u16),

    #[error("invalid header value: {0}")]
    InvalidHeader(String),

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

pub type Result<T> = std::result::Result<T, FetcherError>;

impl From<FetcherError> for StorageError {
    fn from(err: FetcherError) -> Self {
        match err {
            FetcherError::Status(code) => StorageError::Status(code),
            other => StorageError::Fetch(other.to_string()),
        }
    }
}
