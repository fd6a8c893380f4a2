//! HTTP client for a JSON text-generation endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::GenerationService;
use crate::config::Config;
use crate::error::GenerationError;

/// Longest upstream error body kept in an error message.
const MAX_ERROR_BODY: usize = 300;

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(alias = "content", alias = "output")]
    text: String,
}

/// Generation service reached over HTTP.
///
/// Posts `{"model": ..., "prompt": ...}` to the configured endpoint and expects
/// `{"text": ...}` back.
pub struct HttpGenerationService {
    endpoint: String,
    api_key: Option<String>,
    model: String,
    http_client: Client,
}

impl HttpGenerationService {
    /// Creates a client for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns `GenerationError::Upstream` if the HTTP client cannot be built.
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GenerationError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerationError::Upstream(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            endpoint: endpoint.into(),
            api_key,
            model: model.into(),
            http_client,
        })
    }

    /// Creates a client from the generation settings of `config`.
    ///
    /// Returns `Ok(None)` when no endpoint is configured.
    pub fn from_config(config: &Config) -> Result<Option<Self>, GenerationError> {
        let Some(endpoint) = config.generation_api_url.as_deref() else {
            return Ok(None);
        };
        Self::new(
            endpoint,
            config.generation_api_key.clone(),
            config.generation_model.clone(),
            config.generation_timeout,
        )
        .map(Some)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

/// Maps a non-success status to an error, classifying it for retry.
fn status_error(status: StatusCode, body: &str) -> GenerationError {
    let message: String = body.trim().chars().take(MAX_ERROR_BODY).collect();
    let message = if message.is_empty() {
        status.to_string()
    } else {
        message
    };

    if status == StatusCode::TOO_MANY_REQUESTS {
        GenerationError::RateLimited(message)
    } else if status.is_server_error() {
        GenerationError::Upstream(format!("{}: {}", status.as_u16(), message))
    } else {
        GenerationError::Rejected {
            code: status.as_u16(),
            message,
        }
    }
}

#[async_trait]
impl GenerationService for HttpGenerationService {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(GenerationError::MissingApiKey)?;

        let request = ApiRequest {
            model: &self.model,
            prompt,
        };

        let response = self
            .http_client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| GenerationError::Upstream(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let parsed: ApiResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::InvalidResponse(e.to_string()))?;

        if parsed.text.trim().is_empty() {
            return Err(GenerationError::InvalidResponse(
                "upstream returned empty text".to_string(),
            ));
        }

        Ok(parsed.text)
    }
}
