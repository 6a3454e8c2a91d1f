//! What a caller asks for.

use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::GeneratorSettings;
use crate::error::{GenerationError, Result};
use crate::schema::{PatternKind, SchemaDescriptor};
use crate::strategy::Strategy;
use crate::validator::ValidationLevel;

/// How the records of one request are scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GenerationMode {
    /// One record at a time.
    Single,
    /// All records concurrently; results come back in request order.
    #[default]
    Batch,
    /// One at a time, each accepted record becoming a few-shot example for
    /// the records after it.
    Progressive,
}

/// A generation request. Build with [`new`](GenerationRequest::new) and the
/// `with_*` setters; the generator never modifies it.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub schema: SchemaDescriptor,
    pub count: usize,
    pub context: String,
    pub mode: GenerationMode,
    /// Validated attempts per record beyond the first.
    pub max_retries: u32,
    pub validation_level: ValidationLevel,
    /// No new backend call starts after this instant.
    pub deadline: Option<Instant>,
    /// First strategy to try instead of the complexity-based choice.
    pub strategy: Option<Strategy>,
    /// Example records shown to few-shot prompts.
    pub examples: Vec<Value>,
    /// Rewrite string numbers, numeric strings and similar before
    /// validation instead of reporting them as type mismatches.
    pub coerce_types: bool,
}

impl GenerationRequest {
    pub fn new(schema: SchemaDescriptor, count: usize) -> Self {
        Self {
            schema,
            count,
            context: String::new(),
            mode: GenerationMode::default(),
            max_retries: 3,
            validation_level: ValidationLevel::default(),
            deadline: None,
            strategy: None,
            examples: Vec::new(),
            coerce_types: false,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_mode(mut self, mode: GenerationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_validation_level(mut self, level: ValidationLevel) -> Self {
        self.validation_level = level;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline relative to now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_examples(mut self, examples: Vec<Value>) -> Self {
        self.examples = examples;
        self
    }

    pub fn with_type_coercion(mut self, coerce: bool) -> Self {
        self.coerce_types = coerce;
        self
    }

    /// Retry budget and validation level from environment settings.
    pub fn with_settings(self, settings: &GeneratorSettings) -> Self {
        self.with_max_retries(settings.max_retries)
            .with_validation_level(settings.validation_level)
    }

    /// Check the caller contract. Runs before any backend call.
    pub fn validate(&self) -> Result<()> {
        if self.count < 1 {
            return Err(GenerationError::InvalidRequest(
                "count must be at least 1".into(),
            ));
        }
        if self.schema.is_empty() {
            return Err(GenerationError::InvalidRequest(
                "schema has no fields".into(),
            ));
        }
        for (path, kind) in self.schema.patterns() {
            if let PatternKind::Custom(ref source) = kind {
                Regex::new(source).map_err(|e| {
                    GenerationError::InvalidRequest(format!("pattern for '{path}' is invalid: {e}"))
                })?;
            }
        }
        if let Some(bad) = self.examples.iter().position(|e| !e.is_object()) {
            return Err(GenerationError::InvalidRequest(format!(
                "example {bad} is not a JSON object"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldSpec;
    use serde_json::json;

    fn schema() -> SchemaDescriptor {
        SchemaDescriptor::new(vec![FieldSpec::string("name")])
    }

    #[test]
    fn test_defaults() {
        let req = GenerationRequest::new(schema(), 2);
        assert_eq!(req.mode, GenerationMode::Batch);
        assert_eq!(req.max_retries, 3);
        assert_eq!(req.validation_level, ValidationLevel::Moderate);
        assert!(!req.coerce_types);
        assert!(req.validate().is_ok());
        assert!(req.with_type_coercion(true).coerce_types);
    }

    #[test]
    fn test_rejects_zero_count() {
        let err = GenerationRequest::new(schema(), 0).validate().unwrap_err();
        assert!(matches!(err, GenerationError::InvalidRequest(ref m) if m.contains("count")));
    }

    #[test]
    fn test_rejects_empty_schema() {
        let req = GenerationRequest::new(SchemaDescriptor::new(vec![]), 1);
        assert!(matches!(req.validate(), Err(GenerationError::InvalidRequest(_))));
    }

    #[test]
    fn test_rejects_bad_custom_pattern() {
        let bad = SchemaDescriptor::new(vec![
            FieldSpec::pattern("code", PatternKind::Custom("[a-z".into())),
        ]);
        let err = GenerationRequest::new(bad, 1).validate().unwrap_err();
        assert!(err.to_string().contains("code"));
    }

    #[test]
    fn test_rejects_non_object_examples() {
        let req = GenerationRequest::new(schema(), 1).with_examples(vec![json!({"name": "a"}), json!(3)]);
        assert!(req.validate().unwrap_err().to_string().contains("example 1"));
    }
}
