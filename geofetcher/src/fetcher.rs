use async_trait::async_trait;
use geostore::{
    config::Settings,
    errors::Result as StorageResult,
    fetch::{FetchOutcome, FetchRequest, SourceFetcher},
    models::ChangeToken,
};
use reqwest::header::{HeaderValue, IF_MODIFIED_SINCE, LAST_MODIFIED};
use reqwest::StatusCode;
use std::time::Duration;

use crate::client::build_client;
use crate::error::{FetcherError, Result};

/// Conditional HTTP(S) downloads keyed on `Last-Modified`.
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(user_agent, timeout)?,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(&settings.user_agent, settings.fetch_timeout())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn download(&self, request: FetchRequest<'_>) -> Result<FetchOutcome> {
        let mut builder = self.client.get(request.url);
        if let Some(validator) = request.validator {
            let value = HeaderValue::from_str(validator.as_str())
                .map_err(|_| FetcherError::InvalidHeader(validator.to_string()))?;
            builder = builder.header(IF_MODIFIED_SINCE, value);
        }

        let response = builder.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            // Without a validator a 304 cannot be trusted to mean "unchanged".
            return match request.validator {
                Some(_) => Ok(FetchOutcome::NotModified),
                None => Err(FetcherError::Status(status.as_u16())),
            };
        }
        if !status.is_success() {
            return Err(FetcherError::Status(status.as_u16()));
        }

        let token = match response.headers().get(LAST_MODIFIED) {
            Some(value) => match value.to_str() {
                Ok(text) => Some(ChangeToken::new(text)),
                Err(_) => {
                    log::warn!("Ignoring non-ASCII Last-Modified header from {}", request.url);
                    None
                }
            },
            None => None,
        };
        let payload = response.bytes().await?.to_vec();
        Ok(FetchOutcome::Modified { payload, token })
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn fetch(&self, request: FetchRequest<'_>) -> StorageResult<FetchOutcome> {
        match self.download(request).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                log::debug!("Fetching {} failed: {}", request.url, err);
                Err(err.into())
            }
        }
    }
}
