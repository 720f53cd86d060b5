//! Generation service client
//!
//! One call = one chat-completions request. The client applies a hard
//! wall-clock timeout and classifies the result; it holds no per-call state
//! and never retries on its own (see [`crate::services::retry`]).
//!
//! Classification:
//! - timeout / connection failure → `Transient`
//! - 408, 429, 500, 502, 503, 504 → `Transient`
//! - any other non-2xx status → `Fatal`
//! - 2xx with missing, blank or too-short content → `Transient(EmptyResponse)`
//! - otherwise → `Ok` with the message content as body
//! - attachment file unreadable → `Fatal`, no request sent

use crate::models::{Attempt, Payload, RawResult, RawStatus, TransientKind, Usage};
use async_trait::async_trait;
use base64::Engine;
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Status codes worth retrying (timeout, rate limit, overload, gateway)
pub const RETRYABLE_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Default minimum non-whitespace characters for a meaningful body
pub const DEFAULT_MIN_CONTENT_CHARS: usize = 10;

const USER_AGENT: &str = concat!("cityrules-analyzer/", env!("CARGO_PKG_VERSION"));

/// Fallback MIME type when magic-byte detection finds no image type
const FALLBACK_IMAGE_MIME: &str = "image/png";

/// Generation service abstraction
///
/// The scheduler only depends on this trait; tests substitute stubs.
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Send one request and classify the result
    ///
    /// Must return within roughly `timeout`; never panics on service errors.
    async fn call(&self, attempt: Attempt, payload: &Payload, timeout: Duration) -> RawResult;
}

/// Client construction errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to build HTTP client: {0}")]
    Build(String),

    #[error("Invalid client configuration: {0}")]
    InvalidConfig(String),
}

/// Settings for [`OpenRouterClient`]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Full chat-completions endpoint URL
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub min_content_chars: usize,
    /// Client-side request rate limit; `None` or 0 disables it
    pub requests_per_second: Option<u32>,
}

type DirectRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// OpenRouter chat-completions client
pub struct OpenRouterClient {
    http_client: reqwest::Client,
    config: ClientConfig,
    rate_limiter: Option<DirectRateLimiter>,
}

impl OpenRouterClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        if config.base_url.trim().is_empty() {
            return Err(ClientError::InvalidConfig("base_url is empty".to_string()));
        }

        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ClientError::Build(e.to_string()))?;

        let rate_limiter = config
            .requests_per_second
            .and_then(NonZeroU32::new)
            .map(|rps| RateLimiter::direct(Quota::per_second(rps)));

        Ok(Self {
            http_client,
            config,
            rate_limiter,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn send(
        &self,
        request: &ChatRequest<'_>,
        timeout: Duration,
    ) -> Result<(u16, String), reqwest::Error> {
        let response = self
            .http_client
            .post(&self.config.base_url)
            .bearer_auth(&self.config.api_key)
            .timeout(timeout)
            .json(request)
            .send()
            .await?;

        let status = response.status().as_u16();
        let text = response.text().await?;
        Ok((status, text))
    }
}

#[async_trait]
impl GenerationService for OpenRouterClient {
    async fn call(&self, attempt: Attempt, payload: &Payload, timeout: Duration) -> RawResult {
        if let Some(limiter) = &self.rate_limiter {
            limiter.until_ready().await;
        }

        let image_url = match &payload.attachment {
            None => None,
            Some(attachment) => match attachment.load().await {
                Ok(bytes) => Some(image_data_url(&bytes)),
                Err(e) => {
                    tracing::error!(
                        task_id = %attempt.task_id,
                        path = %attachment.path().display(),
                        error = %e,
                        "Failed to read attachment"
                    );
                    return RawResult {
                        attempt,
                        status: RawStatus::Fatal,
                        http_status: None,
                        body: format!("failed to read {}: {}", attachment.file_name(), e),
                        usage: None,
                        response_time: Duration::ZERO,
                    };
                }
            },
        };

        let request = build_request(&self.config, &payload.prompt, image_url);
        tracing::debug!(
            task_id = %attempt.task_id,
            attempt = attempt.number,
            model = %self.config.model,
            has_attachment = payload.attachment.is_some(),
            "Sending generation request"
        );

        let started = Instant::now();
        let sent = tokio::time::timeout(timeout, self.send(&request, timeout)).await;
        let response_time = started.elapsed();

        let (status, http_status, body, usage) = match sent {
            Err(_) => (
                RawStatus::Transient(TransientKind::Timeout),
                None,
                format!("no response within {:.0}s", timeout.as_secs_f64()),
                None,
            ),
            Ok(Err(e)) => {
                let kind = if e.is_timeout() {
                    TransientKind::Timeout
                } else {
                    TransientKind::Connection
                };
                (RawStatus::Transient(kind), None, e.to_string(), None)
            }
            Ok(Ok((code, text))) => {
                let classified = classify_response(code, &text, self.config.min_content_chars);
                (classified.status, Some(code), classified.body, classified.usage)
            }
        };

        tracing::debug!(
            task_id = %attempt.task_id,
            attempt = attempt.number,
            status = status.label(),
            elapsed_ms = response_time.as_millis() as u64,
            "Generation request finished"
        );

        RawResult {
            attempt,
            status,
            http_status,
            body,
            usage,
            response_time,
        }
    }
}

/// Result of classifying one HTTP response
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedResponse {
    pub status: RawStatus,
    /// Message content on success, response text otherwise
    pub body: String,
    pub usage: Option<Usage>,
}

/// Classify an HTTP status plus response text
pub fn classify_response(
    http_status: u16,
    text: &str,
    min_content_chars: usize,
) -> ClassifiedResponse {
    if !(200..300).contains(&http_status) {
        let status = if RETRYABLE_STATUS_CODES.contains(&http_status) {
            RawStatus::Transient(TransientKind::RetryableStatus)
        } else {
            RawStatus::Fatal
        };
        return ClassifiedResponse {
            status,
            body: text.to_string(),
            usage: None,
        };
    }

    let envelope: Option<ChatResponse> = serde_json::from_str(text).ok();
    let usage = envelope
        .as_ref()
        .and_then(|e| e.usage.as_ref())
        .map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        });
    let content = envelope
        .and_then(|e| e.choices.into_iter().next())
        .and_then(|c| c.message)
        .and_then(|m| m.content)
        .unwrap_or_default();

    if has_meaningful_content(&content, min_content_chars) {
        ClassifiedResponse {
            status: RawStatus::Ok,
            body: content,
            usage,
        }
    } else {
        ClassifiedResponse {
            status: RawStatus::Transient(TransientKind::EmptyResponse),
            body: content,
            usage,
        }
    }
}

/// At least `min_chars` non-whitespace characters (and never zero)
pub fn has_meaningful_content(content: &str, min_chars: usize) -> bool {
    let visible = content.chars().filter(|c| !c.is_whitespace()).count();
    visible > 0 && visible >= min_chars
}

/// `data:` URL for an image attachment
pub fn image_data_url(bytes: &[u8]) -> String {
    let mime = infer::get(bytes)
        .map(|kind| kind.mime_type())
        .filter(|mime| mime.starts_with("image/"))
        .unwrap_or(FALLBACK_IMAGE_MIME);
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    format!("data:{};base64,{}", mime, encoded)
}

fn build_request<'a>(
    config: &'a ClientConfig,
    prompt: &str,
    image_url: Option<String>,
) -> ChatRequest<'a> {
    let content = match image_url {
        None => MessageContent::Text(prompt.to_string()),
        Some(url) => MessageContent::Parts(vec![
            ContentPart::Text {
                text: prompt.to_string(),
            },
            ContentPart::ImageUrl {
                image_url: ImageUrl { url },
            },
        ]),
    };

    ChatRequest {
        model: &config.model,
        messages: vec![ChatMessage {
            role: "user",
            content,
        }],
        temperature: config.temperature,
        max_tokens: config.max_tokens,
    }
}

// Wire types

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: MessageContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}
