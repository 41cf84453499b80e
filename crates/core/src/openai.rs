//! Minimal async client for OpenAI-compatible HTTP APIs.
//!
//! Shared by the embedding provider and the LLM reranker. Requests that
//! fail with HTTP 429, a 5xx status or a transport error are retried with
//! exponential backoff; any other failure is returned immediately.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ProviderCallError {
    #[error("missing api key")]
    MissingApiKey,

    #[error("invalid api key header")]
    InvalidApiKey,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned {status}: {body}")]
    Status { status: StatusCode, body: String },
}

#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    max_retries: u32,
}

impl OpenAiClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self, ProviderCallError> {
        if api_key.trim().is_empty() {
            return Err(ProviderCallError::MissingApiKey);
        }

        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).map_err(|_| ProviderCallError::InvalidApiKey)?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_retries,
        })
    }

    pub async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R, ProviderCallError>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut attempt = 0u32;

        loop {
            match self.client.post(&url).json(body).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.json::<R>().await?);
                    }

                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    if should_retry(status) && attempt < self.max_retries {
                        attempt += 1;
                        warn!(%url, %status, attempt, "retrying provider request");
                        tokio::time::sleep(retry_backoff(attempt)).await;
                        continue;
                    }
                    return Err(ProviderCallError::Status { status, body });
                }
                Err(error) => {
                    if is_retryable(&error) && attempt < self.max_retries {
                        attempt += 1;
                        warn!(%url, %error, attempt, "retrying provider request");
                        tokio::time::sleep(retry_backoff(attempt)).await;
                        continue;
                    }
                    return Err(error.into());
                }
            }
        }
    }
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

fn retry_backoff(attempt: u32) -> Duration {
    Duration::from_millis(500 * (1 << attempt.min(5)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_throttling_and_server_errors_are_retried() {
        assert!(should_retry(StatusCode::TOO_MANY_REQUESTS));
        assert!(should_retry(StatusCode::BAD_GATEWAY));
        assert!(!should_retry(StatusCode::UNAUTHORIZED));
        assert!(!should_retry(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(retry_backoff(1), Duration::from_millis(1_000));
        assert_eq!(retry_backoff(5), retry_backoff(9));
    }

    #[test]
    fn empty_api_key_is_rejected() {
        let result = OpenAiClient::new("http://localhost", "  ", Duration::from_secs(1), 0);
        assert!(matches!(result, Err(ProviderCallError::MissingApiKey)));
    }
}
