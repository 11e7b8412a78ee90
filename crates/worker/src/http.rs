//! HTTP content generator.
//!
//! Each provider is reached at `POST {endpoint}/generate` with the job payload as
//! the JSON body. An API key, when set in `<PROVIDER>_API_KEY`, is sent as a
//! bearer token. Error messages use the wording the retry classifier keys on.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use tracing::debug;

use conductor_core::ProviderDescriptor;
use conductor_engine::{ContentGenerator, GenerationError, GenerationOutput};

#[derive(Debug, Clone)]
pub struct HttpGenerator {
    client: reqwest::Client,
}

impl Default for HttpGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpGenerator {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// Environment variable holding the API key for `provider`.
pub fn api_key_var(provider: &ProviderDescriptor) -> String {
    let id: String = provider
        .id
        .as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("{id}_API_KEY")
}

/// Error message for a non-success response.
pub fn status_error(provider: &ProviderDescriptor, status: StatusCode, body: &str) -> String {
    let body = body.trim();
    match status {
        StatusCode::TOO_MANY_REQUESTS => format!("{}: rate limit reached ({status})", provider.id),
        StatusCode::UNAUTHORIZED => format!("{}: authentication failed", provider.id),
        StatusCode::FORBIDDEN => format!("{}: insufficient permissions", provider.id),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            format!("{}: validation error: {body}", provider.id)
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            format!("{}: upstream timeout ({status})", provider.id)
        }
        _ => format!("{}: provider returned {status}: {body}", provider.id),
    }
}

#[async_trait]
impl ContentGenerator for HttpGenerator {
    async fn generate(
        &self,
        provider: &ProviderDescriptor,
        payload: &JsonValue,
    ) -> Result<GenerationOutput, GenerationError> {
        let Some(endpoint) = provider.endpoint.as_deref() else {
            return Err(GenerationError::new(format!(
                "{}: validation error: no endpoint configured",
                provider.id
            )));
        };
        let url = format!("{}/generate", endpoint.trim_end_matches('/'));

        let mut request = self.client.post(&url).json(payload);
        if let Ok(key) = std::env::var(api_key_var(provider)) {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            let kind = if e.is_timeout() { "timeout" } else { "network error" };
            GenerationError::new(format!("{}: {kind}: {e}", provider.id))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::new(status_error(provider, status, &body)));
        }

        debug!(provider = %provider.id, %status, "generation response");
        response.json::<GenerationOutput>().await.map_err(|e| {
            GenerationError::new(format!("{}: malformed response: {e}", provider.id))
        })
    }
}
