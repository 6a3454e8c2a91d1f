//! Sampling configuration and environment-driven settings.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::backend::fallback::ModelPriority;
use crate::validator::ValidationLevel;

/// Per-call sampling configuration handed to a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Temperature (0.0 = deterministic, 1.0 = creative).
    pub temperature: f64,

    /// Maximum tokens to generate.
    pub max_tokens: u32,

    /// Ask the provider for JSON-constrained output.
    pub json_mode: bool,

    /// Custom options merged into the Ollama options object.
    pub options: Option<Value>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2000,
            json_mode: false,
            options: None,
        }
    }
}

impl LlmConfig {
    pub fn with_temperature(mut self, temp: f64) -> Self {
        self.temperature = temp;
        self
    }

    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = tokens;
        self
    }

    pub fn with_json_mode(mut self, enabled: bool) -> Self {
        self.json_mode = enabled;
        self
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = Some(options);
        self
    }
}

/// Provider and loop settings, usually loaded from the environment.
#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    pub ollama_host: String,
    pub ollama_model: String,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub openai_model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub validation_level: ValidationLevel,
    pub priority: ModelPriority,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl GeneratorSettings {
    /// Load settings from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings from an arbitrary key lookup. Missing or unparseable
    /// values fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let openai_api_key = lookup("OPENAI_API_KEY")
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());

        Self {
            ollama_host: var_or(&lookup, "OLLAMA_HOST", "http://localhost:11434".to_string()),
            ollama_model: var_or(&lookup, "OLLAMA_MODEL", "llama3.1:8b".to_string()),
            openai_api_key,
            openai_base_url: var_or(&lookup, "OPENAI_BASE_URL", "https://api.openai.com".to_string()),
            openai_model: var_or(&lookup, "OPENAI_MODEL", "gpt-3.5-turbo".to_string()),
            temperature: var_or(&lookup, "JSONGEN_TEMPERATURE", 0.7),
            max_tokens: var_or(&lookup, "JSONGEN_MAX_TOKENS", 2000),
            request_timeout: Duration::from_secs(var_or(&lookup, "JSONGEN_TIMEOUT_SECS", 120)),
            max_retries: var_or(&lookup, "JSONGEN_MAX_RETRIES", 3),
            validation_level: var_or(&lookup, "JSONGEN_VALIDATION_LEVEL", ValidationLevel::Moderate),
            priority: var_or(&lookup, "JSONGEN_PRIORITY", ModelPriority::Balanced),
        }
    }

    /// The base sampling configuration implied by these settings.
    pub fn llm_config(&self) -> LlmConfig {
        LlmConfig::default()
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens)
    }
}

fn var_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    // Allow trailing `# comment` the way .env files are often written.
    let clean = raw.split('#').next().unwrap_or("").trim();
    match clean.parse::<T>() {
        Ok(parsed) => parsed,
        Err(_) => {
            warn!(key, value = %raw, "unparseable setting, using default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = GeneratorSettings::default();
        assert_eq!(settings.ollama_host, "http://localhost:11434");
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.validation_level, ValidationLevel::Moderate);
        assert_eq!(settings.priority, ModelPriority::Balanced);
        assert!(settings.openai_api_key.is_none());
        assert_eq!(settings.request_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_overrides_and_comments() {
        let settings = GeneratorSettings::from_lookup(lookup_from(&[
            ("OLLAMA_MODEL", "qwen2.5:7b"),
            ("JSONGEN_MAX_RETRIES", "5 # be patient"),
            ("JSONGEN_VALIDATION_LEVEL", "strict"),
            ("JSONGEN_PRIORITY", "quality"),
            ("OPENAI_API_KEY", "sk-test"),
        ]));
        assert_eq!(settings.ollama_model, "qwen2.5:7b");
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.validation_level, ValidationLevel::Strict);
        assert_eq!(settings.priority, ModelPriority::Quality);
        assert_eq!(settings.openai_api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn test_unparseable_falls_back() {
        let settings = GeneratorSettings::from_lookup(lookup_from(&[
            ("JSONGEN_TEMPERATURE", "warm"),
            ("JSONGEN_VALIDATION_LEVEL", "pedantic"),
        ]));
        assert_eq!(settings.temperature, 0.7);
        assert_eq!(settings.validation_level, ValidationLevel::Moderate);
    }

    #[test]
    fn test_llm_config_from_settings() {
        let settings = GeneratorSettings::from_lookup(lookup_from(&[
            ("JSONGEN_TEMPERATURE", "0.3"),
            ("JSONGEN_MAX_TOKENS", "512"),
        ]));
        let config = settings.llm_config();
        assert_eq!(config.temperature, 0.3);
        assert_eq!(config.max_tokens, 512);
        assert!(!config.json_mode);
    }
}
