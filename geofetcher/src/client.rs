use std::time::Duration;

use crate::error::{FetcherError, Result};

/// Builds the shared HTTP client. Redirects are followed, and the timeout
/// covers the whole request including the body.
pub fn build_client(user_agent: &str, timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .build()
        .map_err(|err| FetcherError::Client(err.to_string()))
}
