//! OpenRouter completion client.
//!
//! [`CompletionClient`] is the seam between the enrichment resilience logic
//! (retry, backoff, model fallback) and the network. [`OpenRouterClient`] is
//! the production implementation: one `POST /chat/completions` per call,
//! with every failure classified into an [`EnrichmentFailure`].

mod failure;
mod protocol;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use tgkb_shared::{OpenRouterConfig, Result, TgkbError};
use tracing::{debug, instrument};
use url::Url;

pub use failure::EnrichmentFailure;
use protocol::{ChatMessage, ChatRequest, ChatResponse};

/// User-Agent string for API requests.
const USER_AGENT: &str = concat!("tgkb/", env!("CARGO_PKG_VERSION"));

/// Longest error body kept in an [`EnrichmentFailure::Http`].
const MAX_ERROR_BODY: usize = 200;

/// A single-shot text completion against a named model.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Send `prompt` to `model` and return the raw completion text.
    async fn complete(
        &self,
        model: &str,
        prompt: &str,
    ) -> std::result::Result<String, EnrichmentFailure>;
}

// ---------------------------------------------------------------------------
// OpenRouterClient
// ---------------------------------------------------------------------------

/// HTTP client for OpenRouter's OpenAI-compatible chat endpoint.
#[derive(Debug, Clone)]
pub struct OpenRouterClient {
    client: Client,
    endpoint: Url,
    api_key: String,
    referer: String,
    app_title: String,
    max_tokens: u32,
    temperature: f32,
    timeout: Duration,
}

impl OpenRouterClient {
    /// Build a client from config. `timeout` bounds each request.
    pub fn new(
        config: &OpenRouterConfig,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let endpoint = endpoint_url(&config.base_url)?;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| TgkbError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            api_key: api_key.into(),
            referer: config.referer.clone(),
            app_title: config.app_title.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            timeout,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl CompletionClient for OpenRouterClient {
    #[instrument(skip_all, fields(model = %model))]
    async fn complete(
        &self,
        model: &str,
        prompt: &str,
    ) -> std::result::Result<String, EnrichmentFailure> {
        let body = ChatRequest {
            model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.app_title)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        debug!(status = status.as_u16(), "completion response");

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(EnrichmentFailure::RateLimited {
                retry_after: parse_retry_after(response.headers()),
            });
        }

        let text = response.text().await.map_err(|e| self.classify(e))?;

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(EnrichmentFailure::Unauthorized {
                status: status.as_u16(),
                body: snippet(&text),
            });
        }

        if !status.is_success() {
            return Err(EnrichmentFailure::Http {
                status: status.as_u16(),
                body: snippet(&text),
            });
        }

        parse_completion(&text)
    }
}

impl OpenRouterClient {
    fn classify(&self, err: reqwest::Error) -> EnrichmentFailure {
        if err.is_timeout() {
            EnrichmentFailure::Timeout(self.timeout)
        } else {
            EnrichmentFailure::Transport(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `<base_url>/chat/completions`, tolerating a trailing slash on the base.
fn endpoint_url(base_url: &str) -> Result<Url> {
    let base = format!("{}/", base_url.trim_end_matches('/'));
    Url::parse(&base)
        .and_then(|u| u.join("chat/completions"))
        .map_err(|e| TgkbError::config(format!("invalid OpenRouter base URL '{base_url}': {e}")))
}

/// Extract the completion text from a 2xx body.
fn parse_completion(body: &str) -> std::result::Result<String, EnrichmentFailure> {
    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|e| EnrichmentFailure::MalformedResponse(format!("invalid JSON: {e}")))?;

    if let Some(err) = parsed.error.as_ref() {
        return Err(match err.code {
            Some(429) => EnrichmentFailure::RateLimited { retry_after: None },
            Some(code @ (401 | 403)) => EnrichmentFailure::Unauthorized {
                status: code,
                body: snippet(&err.message),
            },
            Some(code) => EnrichmentFailure::Http {
                status: code,
                body: snippet(&err.message),
            },
            None => EnrichmentFailure::MalformedResponse(snippet(&err.message)),
        });
    }

    parsed
        .first_content()
        .map(str::to_string)
        .ok_or_else(|| EnrichmentFailure::MalformedResponse("no completion content".into()))
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn parse_retry_after(headers: &header::HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn snippet(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
