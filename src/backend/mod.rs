//! Backend trait, normalized request/response types and failure taxonomy.
//!
//! ```text
//! RecordLoop ──► FallbackChain ──► with_backoff() ──► Backend::complete()
//!                      │                                   │
//!                ChainCursor                 ┌─────────────┼─────────────┐
//!              (per record)            OllamaBackend  OpenAiBackend  MockBackend
//! ```
//!
//! Backends return [`GenerationError`]; the loop only ever sees the
//! [`BackendError`] it classifies to.

pub mod backoff;
pub mod fallback;
pub mod mock;
pub mod ollama;
#[cfg(feature = "openai")]
pub mod openai;

pub use backoff::BackoffConfig;
pub use fallback::{BackendEntry, BackendTier, ChainCursor, FallbackChain, ModelPriority};
pub use mock::{MockBackend, MockReply};
pub use ollama::OllamaBackend;
#[cfg(feature = "openai")]
pub use openai::OpenAiBackend;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::LlmConfig;
use crate::error::{GenerationError, Result};

/// Invoked before each transport retry with `(retry_number, delay, reason)`.
pub type RetryCallback<'a> = Option<&'a mut (dyn FnMut(u32, Duration, &str) + Send)>;

/// A provider-agnostic completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    pub model: String,
    /// Chat-style call when set, plain completion otherwise.
    pub system_prompt: Option<String>,
    pub prompt: String,
    pub config: LlmConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmResponse {
    pub text: String,
    pub status: u16,
    /// Provider-specific extras (token counts, timings), as returned.
    pub metadata: Option<serde_json::Value>,
}

/// A text-completion provider.
///
/// Object-safe; used as `Arc<dyn Backend>`.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse>;

    /// Short provider name for logs.
    fn name(&self) -> &'static str;
}

/// Why a backend call produced no usable text.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendError {
    #[error("timed out")]
    Timeout,
    #[error("rate limited")]
    RateLimited,
    #[error("unavailable")]
    Unavailable,
    #[error("malformed response")]
    Malformed,
}

impl BackendError {
    /// Map any transport failure onto the taxonomy.
    pub fn classify(error: &GenerationError) -> Self {
        match error {
            GenerationError::Backend(kind) => *kind,
            GenerationError::Request(e) if e.is_timeout() => BackendError::Timeout,
            GenerationError::Request(e) if e.is_decode() => BackendError::Malformed,
            GenerationError::Request(_) => BackendError::Unavailable,
            GenerationError::HttpError { status: 429, .. } => BackendError::RateLimited,
            GenerationError::HttpError {
                status: 408 | 504, ..
            } => BackendError::Timeout,
            GenerationError::HttpError { .. } => BackendError::Unavailable,
            GenerationError::Json(_) | GenerationError::MalformedResponse { .. } => {
                BackendError::Malformed
            }
            _ => BackendError::Unavailable,
        }
    }
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Send a prepared request and decode a JSON body. Non-2xx statuses become
/// [`GenerationError::HttpError`] carrying any `Retry-After` hint.
pub(crate) async fn send_json(builder: reqwest::RequestBuilder) -> Result<(serde_json::Value, u16)> {
    let resp = builder.send().await?;
    let status = resp.status().as_u16();

    if !resp.status().is_success() {
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = resp.text().await.unwrap_or_default();
        return Err(GenerationError::HttpError {
            status,
            body,
            retry_after,
        });
    }

    Ok((resp.json().await?, status))
}

/// Whether `error` is worth repeating against the same backend.
pub fn is_retryable(error: &GenerationError, config: &BackoffConfig) -> bool {
    match error {
        GenerationError::Cancelled
        | GenerationError::DeadlineReached
        | GenerationError::InvalidConfig(_)
        | GenerationError::InvalidRequest(_) => false,
        other => config.retries(BackendError::classify(other)),
    }
}

/// Why a call sequence stopped before its next backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interrupt {
    Cancelled,
    DeadlineReached,
}

impl Interrupt {
    fn into_error(self) -> GenerationError {
        match self {
            Interrupt::Cancelled => GenerationError::Cancelled,
            Interrupt::DeadlineReached => GenerationError::DeadlineReached,
        }
    }
}

/// Stop conditions checked before every backend call and after every
/// backoff sleep. A call already in flight always runs to completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallGuard<'a> {
    pub cancel: Option<&'a AtomicBool>,
    pub deadline: Option<Instant>,
}

impl<'a> CallGuard<'a> {
    pub fn new(cancel: Option<&'a AtomicBool>, deadline: Option<Instant>) -> Self {
        Self { cancel, deadline }
    }

    pub fn check(&self) -> Option<Interrupt> {
        if self.cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
            return Some(Interrupt::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Interrupt::DeadlineReached),
            _ => None,
        }
    }

    /// Time left before the deadline, `None` without one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// What a backend call sequence produced.
#[derive(Debug)]
pub struct Completion {
    /// The response, or the last error the backend returned. When the guard
    /// fired before any call, the matching `Cancelled`/`DeadlineReached`
    /// error.
    pub response: Result<LlmResponse>,
    pub transport_retries: u32,
    /// Set when the guard stopped the sequence.
    pub interrupted: Option<Interrupt>,
}

impl Completion {
    fn finished(response: Result<LlmResponse>, transport_retries: u32) -> Self {
        Self {
            response,
            transport_retries,
            interrupted: None,
        }
    }

    fn interrupted(error: GenerationError, transport_retries: u32, interrupt: Interrupt) -> Self {
        Self {
            response: Err(error),
            transport_retries,
            interrupted: Some(interrupt),
        }
    }
}

/// Call `backend`, repeating retryable failures per `config`.
///
/// `guard` is checked before every call and again after every backoff
/// sleep. A retry whose delay would run past the deadline is not waited
/// for. Returns the first success, or the last error once retries run out
/// or the guard fires.
pub async fn with_backoff(
    backend: &Arc<dyn Backend>,
    client: &Client,
    base_url: &str,
    request: &LlmRequest,
    config: &BackoffConfig,
    guard: CallGuard<'_>,
    mut on_retry: RetryCallback<'_>,
) -> Completion {
    let mut retry = 0;
    let mut last_error: Option<GenerationError> = None;
    loop {
        if let Some(interrupt) = guard.check() {
            debug!(backend = backend.name(), retry, ?interrupt, "call sequence interrupted");
            let error = last_error.unwrap_or_else(|| interrupt.into_error());
            return Completion::interrupted(error, retry, interrupt);
        }

        let error = match backend.complete(client, base_url, request).await {
            Ok(response) => return Completion::finished(Ok(response), retry),
            Err(e) => e,
        };
        if retry >= config.max_retries || !is_retryable(&error, config) {
            return Completion::finished(Err(error), retry);
        }

        let hint = match &error {
            GenerationError::HttpError { retry_after, .. } => *retry_after,
            _ => None,
        };
        let delay = config.delay_with_hint(retry, hint);
        if guard.remaining().is_some_and(|left| delay >= left) {
            debug!(
                backend = backend.name(),
                retry,
                delay_ms = delay.as_millis() as u64,
                "deadline falls within backoff delay"
            );
            return Completion::interrupted(error, retry, Interrupt::DeadlineReached);
        }

        let reason = error.to_string();
        retry += 1;
        debug!(
            backend = backend.name(),
            retry,
            delay_ms = delay.as_millis() as u64,
            %reason,
            "transport retry"
        );
        if let Some(ref mut cb) = on_retry {
            cb(retry, delay, &reason);
        }
        tokio::time::sleep(delay).await;
        last_error = Some(error);
    }
}
