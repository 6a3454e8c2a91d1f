//! Generating records against scripted backends, no live LLM needed.
//!
//! The first backend is down, so every record falls back to the second,
//! which answers with the usual mix of prose-wrapped, incomplete and
//! sloppy JSON.
//!
//! Run with: `RUST_LOG=llm_jsongen=debug cargo run --example mock_generation`

use std::sync::Arc;

use llm_jsongen::backend::{BackendError, BackendTier, MockReply};
use llm_jsongen::{
    BackendEntry, BackoffConfig, Event, FieldSpec, FnEventHandler, GenerationMode,
    GenerationRequest, Generator, MockBackend, PatternKind, SchemaDescriptor, ValidationLevel,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let down = MockBackend::failing(BackendError::Unavailable);
    let flaky = MockBackend::new(vec![
        MockReply::text(
            "Sure! Here is the customer:\n```json\n{\"id\": \"0b9e4a0e-3c1f-4a53-9f61-2d5d3f7c8a11\", \"name\": \"Ada Byron\"}\n```",
        ),
        MockReply::text(
            r#"{"id": "0b9e4a0e-3c1f-4a53-9f61-2d5d3f7c8a11", "name": "Ada Byron", "email": "ada@example.com", "age": 36}"#,
        ),
        MockReply::text("{id: '7f1c2d3e-4b5a-4c6d-8e7f-9a0b1c2d3e4f', name: 'Alan', email: 'alan@example.com', age: 41,}"),
        MockReply::text(
            r#"{"id": "c56a4180-65aa-42ec-a945-5fd21dec0538", "name": "Grace", "email": "grace@example.com", "age": 85}"#,
        ),
    ])
    .cycling();

    let generator = Generator::builder()
        .backend(BackendEntry::new("primary", Arc::new(down), "mock://primary", "big-model"))
        .backend(
            BackendEntry::new("secondary", Arc::new(flaky), "mock://secondary", "small-model")
                .with_tier(BackendTier::Local),
        )
        .backoff(BackoffConfig::none())
        .event_handler(Arc::new(FnEventHandler(|event: Event| match event {
            Event::BackendSwitched { record, from, to, error } => {
                println!("  record {record}: {from} failed ({error}), now {to:?}")
            }
            Event::RecordEnd { record, outcome, attempts } => {
                println!("  record {record}: {outcome:?} after {attempts} attempt(s)")
            }
            _ => {}
        })))
        .build()?;

    let schema = SchemaDescriptor::new(vec![
        FieldSpec::pattern("id", PatternKind::Uuid),
        FieldSpec::string("name"),
        FieldSpec::pattern("email", PatternKind::Email),
        FieldSpec::integer("age").with_range(Some(18.0), Some(99.0)),
    ]);

    for level in [ValidationLevel::Lenient, ValidationLevel::Strict] {
        println!("=== {level:?} ===");
        let request = GenerationRequest::new(schema.clone(), 3)
            .with_context("bookshop customers")
            .with_mode(GenerationMode::Progressive)
            .with_validation_level(level);
        let result = generator.run(&request).await?;

        println!("status: {:?}", result.final_status);
        for record in &result.records {
            println!("  accepted: {record}");
        }
        for (index, partial) in result.partials() {
            println!("  best partial for record {index}: {partial}");
        }
        let stats = result.stats();
        println!(
            "attempts: {} ({} accepted, {} rejected, {} backend failures), mean quality {:.2}",
            stats.attempts, stats.accepted, stats.rejected, stats.backend_failures, stats.mean_quality
        );
        for (strategy, s) in &stats.by_strategy {
            println!("  {strategy}: {} attempts, {} accepted", s.attempts, s.accepted);
        }
    }

    Ok(())
}
