//! Scripted backend for tests and demos.
//!
//! ```
//! use llm_jsongen::backend::{BackendError, MockBackend, MockReply};
//!
//! let mock = MockBackend::new(vec![
//!     MockReply::Fail(BackendError::RateLimited),
//!     MockReply::text(r#"{"name": "Ada"}"#),
//! ]);
//! assert_eq!(mock.calls(), 0);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;

use super::{Backend, BackendError, LlmRequest, LlmResponse};
use crate::error::{GenerationError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum MockReply {
    Text(String),
    Fail(BackendError),
    /// Sleep, then answer.
    Delayed(Duration, String),
}

impl MockReply {
    pub fn text(text: impl Into<String>) -> Self {
        MockReply::Text(text.into())
    }
}

/// Plays its replies in order. Once the script runs out the last reply
/// repeats, unless built with [`cycling`](MockBackend::cycling).
#[derive(Debug)]
pub struct MockBackend {
    replies: Vec<MockReply>,
    cycle: bool,
    index: AtomicUsize,
    prompts: Mutex<Vec<LlmRequest>>,
}

impl MockBackend {
    /// An empty script behaves as an unreachable backend.
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies,
            cycle: false,
            index: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn fixed(text: impl Into<String>) -> Self {
        Self::new(vec![MockReply::text(text)])
    }

    pub fn failing(kind: BackendError) -> Self {
        Self::new(vec![MockReply::Fail(kind)])
    }

    pub fn cycling(mut self) -> Self {
        self.cycle = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.index.load(Ordering::SeqCst)
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.prompts.lock().clone()
    }

    fn next_reply(&self) -> Option<MockReply> {
        let n = self.index.fetch_add(1, Ordering::SeqCst);
        let len = self.replies.len();
        if len == 0 {
            return None;
        }
        let idx = if self.cycle { n % len } else { n.min(len - 1) };
        self.replies.get(idx).cloned()
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn complete(
        &self,
        _client: &Client,
        _base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse> {
        self.prompts.lock().push(request.clone());
        let text = match self.next_reply() {
            Some(MockReply::Text(text)) => text,
            Some(MockReply::Delayed(delay, text)) => {
                tokio::time::sleep(delay).await;
                text
            }
            Some(MockReply::Fail(kind)) => return Err(GenerationError::Backend(kind)),
            None => return Err(GenerationError::Backend(BackendError::Unavailable)),
        };
        Ok(LlmResponse {
            text,
            status: 200,
            metadata: None,
        })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmConfig;

    fn request(prompt: &str) -> LlmRequest {
        LlmRequest {
            model: "m".into(),
            system_prompt: None,
            prompt: prompt.into(),
            config: LlmConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_script_then_repeat_last() {
        let mock = MockBackend::new(vec![MockReply::text("a"), MockReply::text("b")]);
        let client = Client::new();
        let mut texts = Vec::new();
        for _ in 0..3 {
            texts.push(mock.complete(&client, "", &request("p")).await.unwrap().text);
        }
        assert_eq!(texts, ["a", "b", "b"]);
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn test_cycling() {
        let mock = MockBackend::new(vec![MockReply::text("a"), MockReply::text("b")]).cycling();
        let client = Client::new();
        let mut texts = Vec::new();
        for _ in 0..3 {
            texts.push(mock.complete(&client, "", &request("p")).await.unwrap().text);
        }
        assert_eq!(texts, ["a", "b", "a"]);
    }

    #[tokio::test]
    async fn test_failures_and_recording() {
        let mock = MockBackend::failing(BackendError::Timeout);
        let err = mock
            .complete(&Client::new(), "", &request("first"))
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Backend(BackendError::Timeout)));
        assert_eq!(mock.requests()[0].prompt, "first");

        let empty = MockBackend::new(Vec::new());
        assert!(empty.complete(&Client::new(), "", &request("x")).await.is_err());
    }
}
