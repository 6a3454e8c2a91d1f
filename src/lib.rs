//! # LLM JSON Generation
//!
//! Schema-driven generation of JSON records from unreliable LLM backends.
//!
//! Models drift from a requested schema: they wrap JSON in prose, leave out
//! fields, invent formats, or stop answering. This crate closes the loop
//! around them. Each record is generated by a small state machine that picks
//! a prompting strategy, calls a backend, validates and scores the output,
//! and then accepts it, retries with feedback, escalates to a more
//! constrained strategy, or falls back to the next backend.
//!
//! ## Core Concepts
//!
//! - **[`SchemaDescriptor`]**: the fields a record must have, with types,
//!   named patterns and ranges. Its complexity score drives the first
//!   strategy choice.
//! - **[`Strategy`]**: zero-shot, few-shot, chain-of-thought, structured,
//!   or several at once. The [`StrategySelector`](strategy::StrategySelector)
//!   escalates on structural failures and caps reuse.
//! - **[`FallbackChain`](backend::FallbackChain)**: ordered
//!   [`Backend`](backend::Backend)s with transport backoff. A failing backend
//!   hands the record to the next one without spending its retry budget.
//! - **[`validator`]**: defensive JSON extraction plus a weighted quality
//!   score, accepted per [`ValidationLevel`].
//! - **[`GenerationResult`]**: accepted records in request order, the best
//!   partial output of every failed record, and the full attempt history.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use llm_jsongen::backend::{BackendEntry, OllamaBackend};
//! use llm_jsongen::schema::{FieldSpec, PatternKind, SchemaDescriptor};
//! use llm_jsongen::{GenerationMode, GenerationRequest, Generator, ValidationLevel};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let generator = Generator::builder()
//!         .backend(BackendEntry::new(
//!             "ollama",
//!             Arc::new(OllamaBackend),
//!             "http://localhost:11434",
//!             "llama3.2:3b",
//!         ))
//!         .build()?;
//!
//!     let schema = SchemaDescriptor::new(vec![
//!         FieldSpec::pattern("id", PatternKind::Uuid),
//!         FieldSpec::string("name"),
//!         FieldSpec::pattern("email", PatternKind::Email),
//!         FieldSpec::integer("age").with_range(Some(18.0), Some(99.0)),
//!     ]);
//!     let request = GenerationRequest::new(schema, 10)
//!         .with_context("customer accounts for a bookshop")
//!         .with_mode(GenerationMode::Batch)
//!         .with_validation_level(ValidationLevel::Strict);
//!
//!     let result = generator.run(&request).await?;
//!     for record in &result.records {
//!         println!("{record}");
//!     }
//!     println!("{:?}", result.stats());
//!     Ok(())
//! }
//! ```

pub mod aggregator;
pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod generator;
pub mod output_parser;
pub mod prompt;
pub mod request;
pub mod result;
pub mod schema;
pub mod strategy;
pub mod validator;

pub use backend::{BackendEntry, BackendError, BackoffConfig, FallbackChain, MockBackend, OllamaBackend};
#[cfg(feature = "openai")]
pub use backend::OpenAiBackend;
pub use config::{GeneratorSettings, LlmConfig};
pub use error::{GenerationError, Result};
pub use events::{Event, EventHandler, FnEventHandler, LoopState};
pub use generator::{Generator, GeneratorBuilder};
pub use request::{GenerationMode, GenerationRequest};
pub use result::{
    AttemptOutcome, ExhaustionReason, FinalStatus, GenerationAttempt, GenerationResult,
    GenerationStats, RecordOutcome, RecordReport,
};
pub use schema::{FieldSpec, FieldType, PatternKind, SchemaDescriptor};
pub use strategy::{Strategy, StrategySelector};
pub use validator::{Coercion, ValidationLevel, Violation, ViolationKind};
