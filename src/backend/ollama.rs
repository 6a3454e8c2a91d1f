//! Ollama daemon adapter.
//!
//! `/api/chat` when a system prompt is present, `/api/generate` otherwise.
//! Always non-streaming.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Map, Value};

use super::{send_json, Backend, LlmRequest, LlmResponse};
use crate::error::{GenerationError, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct OllamaBackend;

impl OllamaBackend {
    fn options(request: &LlmRequest) -> Value {
        let mut opts = json!({
            "temperature": request.config.temperature,
            "num_predict": request.config.max_tokens,
        });
        if let (Some(base), Some(extra)) = (
            opts.as_object_mut(),
            request.config.options.as_ref().and_then(Value::as_object),
        ) {
            base.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        opts
    }

    fn use_chat(request: &LlmRequest) -> bool {
        request
            .system_prompt
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty())
    }

    /// Endpoint path and request body.
    fn build_body(request: &LlmRequest) -> (&'static str, Value) {
        let mut body = if Self::use_chat(request) {
            let system = request.system_prompt.as_deref().unwrap_or_default();
            (
                "/api/chat",
                json!({
                    "model": request.model,
                    "messages": [
                        {"role": "system", "content": system},
                        {"role": "user", "content": request.prompt},
                    ],
                    "stream": false,
                    "options": Self::options(request),
                }),
            )
        } else {
            (
                "/api/generate",
                json!({
                    "model": request.model,
                    "prompt": request.prompt,
                    "stream": false,
                    "options": Self::options(request),
                }),
            )
        };
        if request.config.json_mode {
            body.1["format"] = json!("json");
        }
        body
    }

    fn response_text(path: &str, resp: &Value) -> Option<String> {
        let text = if path == "/api/chat" {
            resp.pointer("/message/content")
        } else {
            resp.get("response")
        };
        text.and_then(Value::as_str).map(str::to_string)
    }

    fn metadata(resp: &Value) -> Option<Value> {
        let keys = [
            "model",
            "total_duration",
            "eval_count",
            "eval_duration",
            "prompt_eval_count",
        ];
        let meta: Map<String, Value> = keys
            .iter()
            .filter_map(|&k| resp.get(k).map(|v| (k.to_string(), v.clone())))
            .collect();
        (!meta.is_empty()).then_some(Value::Object(meta))
    }
}

#[async_trait]
impl Backend for OllamaBackend {
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse> {
        let (path, body) = Self::build_body(request);
        let url = format!("{}{}", base_url.trim_end_matches('/'), path);
        let (resp, status) = send_json(client.post(&url).json(&body)).await?;

        let text = Self::response_text(path, &resp)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| GenerationError::MalformedResponse {
                backend: self.name().into(),
                reason: format!("no text in {path} response"),
            })?;

        Ok(LlmResponse {
            text,
            status,
            metadata: Self::metadata(&resp),
        })
    }

    fn name(&self) -> &'static str {
        "ollama"
    }
}
