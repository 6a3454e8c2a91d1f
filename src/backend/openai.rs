//! Hosted OpenAI-compatible adapter (`/v1/chat/completions`).
//!
//! Works with any server speaking the chat-completions dialect. Provider
//! `options` from [`LlmConfig`](crate::config::LlmConfig) are Ollama-specific
//! and are not forwarded.

use std::fmt;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Map, Value};

use super::{send_json, Backend, LlmRequest, LlmResponse};
use crate::error::{GenerationError, Result};

#[derive(Clone, Default)]
pub struct OpenAiBackend {
    api_key: Option<String>,
    organization: Option<String>,
}

impl fmt::Debug for OpenAiBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = self
            .api_key
            .as_ref()
            .map(|k| format!("{}***", k.chars().take(6).collect::<String>()));
        f.debug_struct("OpenAiBackend")
            .field("api_key", &redacted)
            .field("organization", &self.organization)
            .finish()
    }
}

impl OpenAiBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sent as `Authorization: Bearer {key}`.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_organization(mut self, org: impl Into<String>) -> Self {
        self.organization = Some(org.into());
        self
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn build_body(request: &LlmRequest) -> Value {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system_prompt.as_deref().filter(|s| !s.trim().is_empty()) {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "temperature": request.config.temperature,
            "max_tokens": request.config.max_tokens,
        });
        if request.config.json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }
        body
    }

    fn build_http_request(&self, client: &Client, url: &str, body: &Value) -> reqwest::RequestBuilder {
        let mut req = client.post(url).json(body);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        if let Some(ref org) = self.organization {
            req = req.header("OpenAI-Organization", org.as_str());
        }
        req
    }

    fn metadata(resp: &Value) -> Option<Value> {
        let meta: Map<String, Value> = ["id", "model", "usage"]
            .iter()
            .filter_map(|&k| resp.get(k).map(|v| (k.to_string(), v.clone())))
            .collect();
        (!meta.is_empty()).then_some(Value::Object(meta))
    }
}

#[async_trait]
impl Backend for OpenAiBackend {
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse> {
        let url = format!("{}/v1/chat/completions", base_url.trim_end_matches('/'));
        let body = Self::build_body(request);
        let (resp, status) = send_json(self.build_http_request(client, &url, &body)).await?;

        let text = resp
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| GenerationError::MalformedResponse {
                backend: self.name().into(),
                reason: "no message content in first choice".into(),
            })?
            .to_string();

        Ok(LlmResponse {
            text,
            status,
            metadata: Self::metadata(&resp),
        })
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}
