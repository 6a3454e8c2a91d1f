//! Ordered backend chain and per-record position in it.
//!
//! The chain itself is shared and immutable while a request runs. Each
//! record owns a [`ChainCursor`], so one record failing over never moves
//! another record off its backend.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    with_backoff, Backend, BackoffConfig, CallGuard, Completion, LlmRequest, OllamaBackend,
    RetryCallback,
};
use crate::config::{GeneratorSettings, LlmConfig};
use crate::error::{GenerationError, Result};
use crate::prompt::RenderedPrompt;

/// What the chain order optimizes for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelPriority {
    Quality,
    Speed,
    Cost,
    #[default]
    Balanced,
}

impl FromStr for ModelPriority {
    type Err = GenerationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "quality" => Ok(ModelPriority::Quality),
            "speed" => Ok(ModelPriority::Speed),
            "cost" => Ok(ModelPriority::Cost),
            "balanced" => Ok(ModelPriority::Balanced),
            other => Err(GenerationError::InvalidConfig(format!(
                "unknown model priority '{other}'"
            ))),
        }
    }
}

/// Where a backend runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendTier {
    /// Remote paid API.
    Hosted,
    /// A model server on this machine or network, such as Ollama.
    Daemon,
    /// In-process or embedded model.
    Local,
}

impl BackendTier {
    /// Lower sorts earlier.
    fn rank(self, priority: ModelPriority) -> u8 {
        use BackendTier::*;
        let order: [BackendTier; 3] = match priority {
            ModelPriority::Quality => [Hosted, Daemon, Local],
            ModelPriority::Speed | ModelPriority::Cost => [Local, Daemon, Hosted],
            ModelPriority::Balanced => [Daemon, Local, Hosted],
        };
        order.iter().position(|&t| t == self).unwrap_or(order.len()) as u8
    }
}

/// One backend plus the model and endpoint to call it with.
#[derive(Clone)]
pub struct BackendEntry {
    pub label: String,
    pub model: String,
    pub base_url: String,
    pub tier: BackendTier,
    pub backend: Arc<dyn Backend>,
}

impl BackendEntry {
    pub fn new(
        label: impl Into<String>,
        backend: Arc<dyn Backend>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            label: label.into(),
            model: model.into(),
            base_url: base_url.into(),
            tier: BackendTier::Daemon,
            backend,
        }
    }

    pub fn with_tier(mut self, tier: BackendTier) -> Self {
        self.tier = tier;
        self
    }
}

impl fmt::Debug for BackendEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendEntry")
            .field("label", &self.label)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("tier", &self.tier)
            .field("backend", &self.backend.name())
            .finish()
    }
}

/// Backends in preference order.
#[derive(Debug, Clone)]
pub struct FallbackChain {
    client: Client,
    entries: Vec<BackendEntry>,
    backoff: BackoffConfig,
}

impl Default for FallbackChain {
    fn default() -> Self {
        Self::new()
    }
}

impl FallbackChain {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            entries: Vec::new(),
            backoff: BackoffConfig::none(),
        }
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn push(mut self, entry: BackendEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Stable re-order by tier preference for `priority`.
    pub fn ranked(mut self, priority: ModelPriority) -> Self {
        self.entries.sort_by_key(|e| e.tier.rank(priority));
        self
    }

    /// Ollama always; the OpenAI-compatible backend too when compiled in and
    /// a key is configured.
    pub fn from_settings(settings: &GeneratorSettings) -> Result<Self> {
        let client = Client::builder().timeout(settings.request_timeout).build()?;
        #[allow(unused_mut)]
        let mut chain = Self::new().with_client(client).push(BackendEntry::new(
            "ollama",
            Arc::new(OllamaBackend),
            settings.ollama_host.clone(),
            settings.ollama_model.clone(),
        ));

        #[cfg(feature = "openai")]
        if let Some(ref key) = settings.openai_api_key {
            chain = chain.push(
                BackendEntry::new(
                    "openai",
                    Arc::new(super::OpenAiBackend::new().with_api_key(key.clone())),
                    settings.openai_base_url.clone(),
                    settings.openai_model.clone(),
                )
                .with_tier(BackendTier::Hosted),
            );
        }

        Ok(chain.ranked(settings.priority))
    }

    pub fn entries(&self) -> &[BackendEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cursor(&self) -> ChainCursor {
        ChainCursor::default()
    }

    pub fn current(&self, cursor: &ChainCursor) -> Option<&BackendEntry> {
        self.entries.get(cursor.position)
    }

    /// Call `entry` with transport backoff. `guard` stops the retry
    /// sequence before its next call.
    pub async fn complete(
        &self,
        entry: &BackendEntry,
        prompt: &RenderedPrompt,
        config: &LlmConfig,
        guard: CallGuard<'_>,
        on_retry: RetryCallback<'_>,
    ) -> Completion {
        let request = LlmRequest {
            model: entry.model.clone(),
            system_prompt: prompt.system.clone(),
            prompt: prompt.user.clone(),
            config: config.clone(),
        };
        debug!(
            backend = %entry.label,
            model = %entry.model,
            temperature = config.temperature,
            json_mode = config.json_mode,
            "backend call"
        );
        with_backoff(
            &entry.backend,
            &self.client,
            &entry.base_url,
            &request,
            &self.backoff,
            guard,
            on_retry,
        )
        .await
    }
}

/// A record's position in the chain. Only ever moves forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainCursor {
    position: usize,
}

impl ChainCursor {
    pub fn position(&self) -> usize {
        self.position
    }

    /// Step to the next backend. `false` once the chain is exhausted.
    pub fn advance(&mut self, chain: &FallbackChain) -> bool {
        if self.position + 1 < chain.len() {
            self.position += 1;
            true
        } else {
            self.position = chain.len();
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, MockBackend, MockReply};

    fn entry(label: &str, tier: BackendTier) -> BackendEntry {
        BackendEntry::new(label, Arc::new(MockBackend::fixed("{}")), "mock://", "m").with_tier(tier)
    }

    fn three_tier() -> FallbackChain {
        FallbackChain::new()
            .push(entry("local", BackendTier::Local))
            .push(entry("hosted", BackendTier::Hosted))
            .push(entry("daemon", BackendTier::Daemon))
    }

    fn labels(chain: &FallbackChain) -> Vec<&str> {
        chain.entries().iter().map(|e| e.label.as_str()).collect()
    }

    #[test]
    fn test_ranking() {
        assert_eq!(
            labels(&three_tier().ranked(ModelPriority::Quality)),
            ["hosted", "daemon", "local"]
        );
        assert_eq!(
            labels(&three_tier().ranked(ModelPriority::Speed)),
            ["local", "daemon", "hosted"]
        );
        assert_eq!(
            labels(&three_tier().ranked(ModelPriority::Cost)),
            ["local", "daemon", "hosted"]
        );
        assert_eq!(
            labels(&three_tier().ranked(ModelPriority::Balanced)),
            ["daemon", "local", "hosted"]
        );
    }

    #[test]
    fn test_ranking_is_stable_within_tier() {
        let chain = FallbackChain::new()
            .push(entry("a", BackendTier::Daemon))
            .push(entry("b", BackendTier::Daemon))
            .ranked(ModelPriority::Quality);
        assert_eq!(labels(&chain), ["a", "b"]);
    }

    #[test]
    fn test_cursor_walks_forward_once() {
        let chain = three_tier();
        let mut cursor = chain.cursor();
        assert_eq!(chain.current(&cursor).unwrap().label, "local");
        assert!(cursor.advance(&chain));
        assert!(cursor.advance(&chain));
        assert_eq!(chain.current(&cursor).unwrap().label, "daemon");
        assert!(!cursor.advance(&chain));
        assert!(chain.current(&cursor).is_none());
        assert!(!cursor.advance(&chain));
    }

    #[test]
    fn test_priority_parsing() {
        assert_eq!("Quality".parse::<ModelPriority>().unwrap(), ModelPriority::Quality);
        assert_eq!("cost".parse::<ModelPriority>().unwrap(), ModelPriority::Cost);
        assert!("cheap".parse::<ModelPriority>().is_err());
    }

    #[test]
    fn test_from_settings_starts_with_ollama() {
        let settings = GeneratorSettings::default();
        let chain = FallbackChain::from_settings(&settings).unwrap();
        let first = &chain.entries()[0];
        assert_eq!(first.label, "ollama");
        assert_eq!(first.model, "llama3.1:8b");
        assert_eq!(first.backend.name(), "ollama");
    }

    #[tokio::test]
    async fn test_complete_uses_entry_model_and_prompt() {
        let mock = Arc::new(MockBackend::new(vec![
            MockReply::Fail(BackendError::RateLimited),
            MockReply::text("{\"a\": 1}"),
        ]));
        let chain = FallbackChain::new()
            .with_backoff(BackoffConfig {
                max_retries: 1,
                initial_delay: std::time::Duration::from_millis(1),
                ..BackoffConfig::standard()
            })
            .push(BackendEntry::new("mock", mock.clone(), "mock://", "tiny-model"));
        let prompt = RenderedPrompt {
            system: Some("sys".into()),
            user: "make json".into(),
        };
        let entry = chain.current(&chain.cursor()).unwrap();
        let completion = chain
            .complete(entry, &prompt, &LlmConfig::default(), CallGuard::default(), None)
            .await;

        assert_eq!(completion.response.unwrap().text, "{\"a\": 1}");
        assert_eq!(completion.transport_retries, 1);
        assert_eq!(completion.interrupted, None);
        let seen = mock.requests();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].model, "tiny-model");
        assert_eq!(seen[0].system_prompt.as_deref(), Some("sys"));
        assert_eq!(seen[0].prompt, "make json");
    }
}
