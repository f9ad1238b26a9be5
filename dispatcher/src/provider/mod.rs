//! Provider client - issues generation requests against an OpenAI-style
//! endpoint and streams the response text to a delta sink.
//!
//! Retries cover network failures, per-attempt timeouts and 429/503
//! responses. Rate hints from 429/503 responses are forwarded to a
//! [`RateHintSink`] (the scheduler) and used as the wait before the retry.

mod body;
mod hints;
mod sse;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::StatusCode;
use serde_json::Value;
use shared_types::{BodyMode, ServerRateHint};
use tokio_util::sync::CancellationToken;

pub use body::{build_body, extract_model_ids, extract_text, resolve_body_mode, BodySettings};
pub use hints::{parse_rate_hint, parse_retry_after};
pub use sse::{extract_delta, SseDecoder, SseEvent};

use crate::backoff::{retry_with_backoff, sleep_or_cancel, Canceled, RetryPolicy};

const ERROR_BODY_LIMIT: usize = 500;

/// Receives server rate hints as they are observed.
pub trait RateHintSink: Send + Sync {
    fn on_rate_hint(&self, hint: ServerRateHint);
}

/// Receives streamed text fragments in order. The next chunk is not read
/// until `on_delta` returns.
#[async_trait]
pub trait DeltaSink: Send + Sync {
    async fn on_delta(&self, delta: &str);
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum GenerateError {
    #[error("request canceled")]
    Canceled,

    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("provider returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed provider response: {0}")]
    Decode(String),
}

impl From<Canceled> for GenerateError {
    fn from(_: Canceled) -> Self {
        GenerateError::Canceled
    }
}

impl GenerateError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, GenerateError::HttpStatus { status, .. } if *status == 429 || *status == 503)
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            GenerateError::Network(_) | GenerateError::Timeout { .. } => true,
            GenerateError::HttpStatus { .. } => self.is_rate_limited(),
            GenerateError::Canceled | GenerateError::Decode(_) => false,
        }
    }

    fn transport(e: reqwest::Error) -> Self {
        GenerateError::Network(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub request_path: String,
    pub models_path: String,
    pub body_mode: BodyMode,
    pub body: BodySettings,
    pub stream: bool,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    pub auth_scheme: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            request_path: "/v1/chat/completions".to_string(),
            models_path: "/v1/models".to_string(),
            body_mode: BodyMode::Auto,
            body: BodySettings::default(),
            stream: true,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(120),
            auth_scheme: "Bearer".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Default)]
pub struct Generation {
    pub text: String,
    /// Parsed response document for non-streamed replies.
    pub raw: Option<Value>,
}

#[derive(Debug, Default)]
struct AttemptProgress {
    delivered: bool,
    hint: Option<ServerRateHint>,
}

pub struct ProviderClient {
    http: reqwest::Client,
    config: ProviderConfig,
    credential: Option<String>,
    hint_sink: Option<Arc<dyn RateHintSink>>,
}

impl ProviderClient {
    pub fn new(config: ProviderConfig, credential: Option<String>) -> Result<Self, GenerateError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(GenerateError::transport)?;
        Ok(Self {
            http,
            config,
            credential: credential.filter(|c| !c.trim().is_empty()),
            hint_sink: None,
        })
    }

    pub fn with_hint_sink(mut self, sink: Arc<dyn RateHintSink>) -> Self {
        self.hint_sink = Some(sink);
        self
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header(USER_AGENT, concat!("dispatcher/", env!("CARGO_PKG_VERSION")));
        match &self.credential {
            Some(token) => request.header(
                AUTHORIZATION,
                format!("{} {}", self.config.auth_scheme, token),
            ),
            None => request,
        }
    }

    /// Runs one generation. With a sink, every text fragment is delivered to
    /// it as it arrives (a non-streamed reply arrives as a single fragment).
    ///
    /// An attempt that already delivered text is never retried.
    pub async fn generate(
        &self,
        request: GenerateRequest,
        sink: Option<&dyn DeltaSink>,
    ) -> Result<Generation, GenerateError> {
        let cancel = request.cancel;
        if cancel.is_cancelled() {
            return Err(GenerateError::Canceled);
        }

        let mode = resolve_body_mode(self.config.body_mode, &self.config.request_path);
        let body = build_body(&self.config.body, mode, &request.prompt, self.config.stream);
        let policy = self.config.retry;
        let timeout = self.config.request_timeout;

        let mut attempt = 1u32;
        loop {
            let mut progress = AttemptProgress::default();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(GenerateError::Canceled),
                result = tokio::time::timeout(timeout, self.attempt(&body, sink, &mut progress)) => {
                    result.unwrap_or(Err(GenerateError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    }))
                }
            };

            let err = match outcome {
                Ok(generation) => {
                    tracing::debug!(
                        attempt,
                        chars = generation.text.chars().count(),
                        "Generation completed"
                    );
                    return Ok(generation);
                }
                Err(err) => err,
            };

            if progress.delivered && err != GenerateError::Canceled {
                tracing::warn!(
                    attempt,
                    error = %err,
                    "Generation failed after streaming output; not retrying"
                );
                return Err(err);
            }
            if !err.is_retryable() || attempt > policy.max_retries {
                return Err(err);
            }

            let delay = progress
                .hint
                .and_then(|hint| hint.retry_after_ms)
                .map(Duration::from_millis)
                .unwrap_or_else(|| policy.delay_for_attempt(attempt));
            tracing::warn!(
                attempt,
                max_retries = policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                rate_limited = err.is_rate_limited(),
                error = %err,
                "Generation attempt failed; retrying"
            );
            sleep_or_cancel(delay, &cancel).await?;
            attempt += 1;
        }
    }

    async fn attempt(
        &self,
        body: &Value,
        sink: Option<&dyn DeltaSink>,
        progress: &mut AttemptProgress,
    ) -> Result<Generation, GenerateError> {
        let mut request = self
            .authorize(self.http.post(self.endpoint(&self.config.request_path)))
            .json(body);
        if self.config.stream {
            request = request.header(ACCEPT, "text/event-stream");
        }

        let response = request.send().await.map_err(GenerateError::transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(self.status_error(response, progress).await);
        }

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("application/json"));

        if self.config.stream && !is_json {
            self.read_stream(response, sink, progress).await
        } else {
            let raw = response.text().await.map_err(GenerateError::transport)?;
            let parsed: Value =
                serde_json::from_str(&raw).map_err(|e| GenerateError::Decode(e.to_string()))?;
            let text = extract_text(&parsed).unwrap_or_default().to_string();
            if let Some(sink) = sink.filter(|_| !text.is_empty()) {
                progress.delivered = true;
                sink.on_delta(&text).await;
            }
            Ok(Generation {
                text,
                raw: Some(parsed),
            })
        }
    }

    async fn status_error(
        &self,
        response: reqwest::Response,
        progress: &mut AttemptProgress,
    ) -> GenerateError {
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
            let hint = parse_rate_hint(response.headers(), Utc::now());
            if !hint.is_empty() {
                progress.hint = Some(hint);
                if let Some(sink) = &self.hint_sink {
                    sink.on_rate_hint(hint);
                }
            }
        }
        let body = response.text().await.unwrap_or_default();
        GenerateError::HttpStatus {
            status: status.as_u16(),
            body: body.chars().take(ERROR_BODY_LIMIT).collect(),
        }
    }

    async fn read_stream(
        &self,
        response: reqwest::Response,
        sink: Option<&dyn DeltaSink>,
        progress: &mut AttemptProgress,
    ) -> Result<Generation, GenerateError> {
        let mut decoder = SseDecoder::default();
        let mut text = String::new();
        let mut chunks = response.bytes_stream();

        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(GenerateError::transport)?;
            for event in decoder.push(&chunk) {
                if !Self::apply_event(event, sink, &mut text, progress).await {
                    return Ok(Generation { text, raw: None });
                }
            }
        }
        if let Some(event) = decoder.finish() {
            Self::apply_event(event, sink, &mut text, progress).await;
        }
        Ok(Generation { text, raw: None })
    }

    /// Returns false once the stream signalled completion.
    async fn apply_event(
        event: SseEvent,
        sink: Option<&dyn DeltaSink>,
        text: &mut String,
        progress: &mut AttemptProgress,
    ) -> bool {
        let data = match event {
            SseEvent::Done => return false,
            SseEvent::Data(data) => data,
        };
        let chunk: Value = match serde_json::from_str(&data) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!(error = %e, line = %data, "Skipping unparseable stream line");
                return true;
            }
        };
        let Some(delta) = extract_delta(&chunk).filter(|d| !d.is_empty()) else {
            return true;
        };
        text.push_str(delta);
        if let Some(sink) = sink {
            progress.delivered = true;
            sink.on_delta(delta).await;
        }
        true
    }

    /// Lists model ids advertised by the provider.
    /// Lists the provider's model ids, sorted. Network failures and timeouts
    /// are retried under the configured policy.
    pub async fn list_models(&self) -> Result<Vec<String>, GenerateError> {
        let cancel = CancellationToken::new();
        retry_with_backoff(
            self.config.retry,
            &cancel,
            GenerateError::is_retryable,
            |attempt, err, delay| {
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Model listing failed; retrying"
                );
            },
            |_, _| self.fetch_models(),
        )
        .await
    }

    async fn fetch_models(&self) -> Result<Vec<String>, GenerateError> {
        let request = self.authorize(self.http.get(self.endpoint(&self.config.models_path)));
        let timeout = self.config.request_timeout;
        let response = tokio::time::timeout(timeout, request.send())
            .await
            .map_err(|_| GenerateError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            })?
            .map_err(GenerateError::transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerateError::HttpStatus {
                status: status.as_u16(),
                body: body.chars().take(ERROR_BODY_LIMIT).collect(),
            });
        }
        let listing: Value = response
            .json()
            .await
            .map_err(|e| GenerateError::Decode(e.to_string()))?;
        Ok(extract_model_ids(&listing))
    }
}
