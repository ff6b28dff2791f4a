//! REST API client for the remote generation cluster.
//!
//! Wraps the submission, status-check, result and image-download
//! endpoints using [`reqwest`]. The orchestrator only sees the
//! [`GenerationApi`] trait, so tests substitute a scripted fake.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;

use crate::messages::{CheckResponse, ErrorResponse, StatusResponse, SubmitOutcome, SubmitResponse};
use crate::payload::GenerationPayload;

/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(25);

/// Key used for anonymous access.
pub const ANONYMOUS_API_KEY: &str = "0000000000";

/// Errors from the remote API layer.
#[derive(Debug, thiserror::Error)]
pub enum HordeApiError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The remote cluster does not know the job (HTTP 404).
    #[error("Remote job not found")]
    NotFound,

    /// The remote cluster throttled us (HTTP 429).
    #[error("Rate limited by remote API")]
    RateLimited,

    /// Any other non-2xx status.
    #[error("Remote API error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Message from the error envelope, or the raw body.
        message: String,
    },

    /// The response body was null or did not have the expected shape.
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// The client could not be built from its configuration.
    #[error("Invalid client configuration: {0}")]
    Config(String),
}

impl HordeApiError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Request(e) if e.is_timeout())
    }
}

/// Operations the orchestrator consumes from the remote cluster.
#[async_trait]
pub trait GenerationApi: Send + Sync {
    /// Submit a job. Structured refusals come back as
    /// [`SubmitOutcome::Rejected`]; unreadable responses as errors.
    async fn submit(&self, payload: &GenerationPayload) -> Result<SubmitOutcome, HordeApiError>;

    /// Cheap progress check for a remote job.
    async fn check_status(&self, remote_id: &str) -> Result<CheckResponse, HordeApiError>;

    /// Full result list for a remote job.
    async fn fetch_results(&self, remote_id: &str) -> Result<StatusResponse, HordeApiError>;

    /// Download one image payload.
    async fn download_image(&self, image_ref: &str) -> Result<Vec<u8>, HordeApiError>;
}

/// Connection settings for [`HordeClient`].
#[derive(Debug, Clone)]
pub struct HordeClientConfig {
    /// Base URL, e.g. `https://aihorde.net/api`.
    pub api_url: String,
    pub api_key: String,
    /// Sent as `Client-Agent`, formatted `name:version:contact`.
    pub client_agent: String,
    pub timeout: Duration,
}

impl HordeClientConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            api_key: ANONYMOUS_API_KEY.to_string(),
            client_agent: concat!("pixelq:", env!("CARGO_PKG_VERSION")).to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// HTTP client for the remote cluster.
pub struct HordeClient {
    client: reqwest::Client,
    api_url: String,
}

impl HordeClient {
    /// Build a client with auth headers and the per-call timeout baked in.
    pub fn new(config: &HordeClientConfig) -> Result<Self, HordeApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "apikey",
            HeaderValue::from_str(&config.api_key)
                .map_err(|e| HordeApiError::Config(format!("api key: {e}")))?,
        );
        headers.insert(
            "Client-Agent",
            HeaderValue::from_str(&config.client_agent)
                .map_err(|e| HordeApiError::Config(format!("client agent: {e}")))?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
        })
    }

    // ---- private helpers ----

    /// Map a non-2xx response onto the error taxonomy of the client.
    fn classify_failure(status: StatusCode, body: &str) -> HordeApiError {
        match status {
            StatusCode::NOT_FOUND => HordeApiError::NotFound,
            StatusCode::TOO_MANY_REQUESTS => HordeApiError::RateLimited,
            _ => {
                let message = serde_json::from_str::<ErrorResponse>(body)
                    .ok()
                    .and_then(|e| e.message)
                    .unwrap_or_else(|| body.to_string());
                HordeApiError::Api {
                    status: status.as_u16(),
                    message,
                }
            }
        }
    }

    /// Read the body and decode it as `T`, classifying failures.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, HordeApiError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Self::classify_failure(status, &body));
        }
        serde_json::from_str(&body).map_err(|e| HordeApiError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl GenerationApi for HordeClient {
    async fn submit(&self, payload: &GenerationPayload) -> Result<SubmitOutcome, HordeApiError> {
        let response = self
            .client
            .post(format!("{}/v2/generate/async", self.api_url))
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            let accepted: SubmitResponse = serde_json::from_str(&body)
                .map_err(|e| HordeApiError::Malformed(format!("{e}: {body}")))?;
            if accepted.id.trim().is_empty() {
                return Err(HordeApiError::Malformed("response carried no job id".into()));
            }
            tracing::debug!(
                remote_id = %accepted.id,
                kudos = accepted.kudos,
                "Submission accepted",
            );
            return Ok(SubmitOutcome::Accepted(accepted));
        }

        match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(error) if !error.is_empty() => {
                tracing::debug!(
                    status = status.as_u16(),
                    rc = error.rc.as_deref().unwrap_or(""),
                    "Submission rejected",
                );
                Ok(SubmitOutcome::Rejected {
                    status: status.as_u16(),
                    error,
                })
            }
            _ => Err(HordeApiError::Malformed(format!(
                "HTTP {} with unreadable body: {body}",
                status.as_u16()
            ))),
        }
    }

    async fn check_status(&self, remote_id: &str) -> Result<CheckResponse, HordeApiError> {
        let response = self
            .client
            .get(format!("{}/v2/generate/check/{}", self.api_url, remote_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    async fn fetch_results(&self, remote_id: &str) -> Result<StatusResponse, HordeApiError> {
        let response = self
            .client
            .get(format!("{}/v2/generate/status/{}", self.api_url, remote_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    async fn download_image(&self, image_ref: &str) -> Result<Vec<u8>, HordeApiError> {
        let response = self.client.get(image_ref).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_failure(status, &body));
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(HordeApiError::Malformed("empty image payload".into()));
        }
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_special_statuses() {
        assert!(matches!(
            HordeClient::classify_failure(StatusCode::NOT_FOUND, ""),
            HordeApiError::NotFound
        ));
        assert!(matches!(
            HordeClient::classify_failure(StatusCode::TOO_MANY_REQUESTS, ""),
            HordeApiError::RateLimited
        ));
    }

    #[test]
    fn classify_extracts_envelope_message() {
        let err = HordeClient::classify_failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"message": "Database busy"}"#,
        );
        match err {
            HordeApiError::Api { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "Database busy");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn config_defaults_to_anonymous() {
        let config = HordeClientConfig::new("http://localhost");
        assert_eq!(config.api_key, ANONYMOUS_API_KEY);
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert!(HordeClient::new(&config).is_ok());
    }
}
