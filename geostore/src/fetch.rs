use crate::errors::Result;
use crate::models::ChangeToken;
use async_trait::async_trait;

/// A conditional download request.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub url: &'a str,
    /// Sent as a cache validator when present; `None` means an unconditional request.
    pub validator: Option<&'a ChangeToken>,
}

/// The two successful results of a conditional download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The server confirmed the validator is still current.
    NotModified,
    /// A full body, with the server's modification marker if it sent one.
    Modified {
        payload: Vec<u8>,
        token: Option<ChangeToken>,
    },
}

/// Downloads source payloads. Statuses other than success and "not
/// modified" are returned as `StorageError::Status`.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    fn name(&self) -> &'static str;
    async fn fetch(&self, request: FetchRequest<'_>) -> Result<FetchOutcome>;
}
