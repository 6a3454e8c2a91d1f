//! Request entry point.
//!
//! A [`Generator`] owns the fallback chain, the shared validator cache and
//! the sampling defaults. It is built once and reused across requests.
//!
//! ```no_run
//! use llm_jsongen::config::GeneratorSettings;
//! use llm_jsongen::schema::{FieldSpec, PatternKind, SchemaDescriptor};
//! use llm_jsongen::{GenerationRequest, Generator};
//!
//! # async fn demo() -> llm_jsongen::Result<()> {
//! let settings = GeneratorSettings::from_env();
//! let generator = Generator::from_settings(&settings)?;
//! let schema = SchemaDescriptor::new(vec![
//!     FieldSpec::string("name"),
//!     FieldSpec::pattern("email", PatternKind::Email),
//! ]);
//! let result = generator
//!     .run(&GenerationRequest::new(schema, 5).with_settings(&settings))
//!     .await?;
//! println!("{:?}: {} records", result.final_status, result.records.len());
//! # Ok(())
//! # }
//! ```

mod record;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::info;

use crate::aggregator::{aggregate, RecordRun};
use crate::backend::{BackendEntry, BackoffConfig, FallbackChain};
use crate::config::{GeneratorSettings, LlmConfig};
use crate::error::{GenerationError, Result};
use crate::events::{emit, Event, EventHandler};
use crate::request::{GenerationMode, GenerationRequest};
use crate::result::GenerationResult;
use crate::strategy::StrategySelector;
use crate::validator::ValidatorCache;

use record::{RecordLoop, Shared};

/// Progressive mode shows at most this many of the latest accepted records.
const PROGRESSIVE_EXAMPLES: usize = 3;

pub struct Generator {
    chain: FallbackChain,
    cache: Arc<ValidatorCache>,
    selector: StrategySelector,
    base_config: LlmConfig,
    event_handler: Option<Arc<dyn EventHandler>>,
    cancellation: Option<Arc<AtomicBool>>,
}

impl fmt::Debug for Generator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generator")
            .field("chain", &self.chain)
            .field("cached_schemas", &self.cache.len())
            .field("selector", &self.selector)
            .field("base_config", &self.base_config)
            .field("has_event_handler", &self.event_handler.is_some())
            .field("has_cancellation", &self.cancellation.is_some())
            .finish()
    }
}

impl Generator {
    pub fn builder() -> GeneratorBuilder {
        GeneratorBuilder::default()
    }

    /// Chain and sampling defaults from environment settings.
    pub fn from_settings(settings: &GeneratorSettings) -> Result<Self> {
        Self::builder()
            .chain(FallbackChain::from_settings(settings)?)
            .config(settings.llm_config())
            .build()
    }

    pub fn chain(&self) -> &FallbackChain {
        &self.chain
    }

    pub fn validator_cache(&self) -> &Arc<ValidatorCache> {
        &self.cache
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(|c| c.load(Ordering::Relaxed))
    }

    /// Generate `request.count` records.
    ///
    /// Fails only when the request itself is malformed. Backend failures,
    /// rejected outputs, exhausted budgets, a passed deadline and
    /// cancellation all come back inside the [`GenerationResult`].
    pub async fn run(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        request.validate()?;

        let compiled = self.cache.get_or_compile(&request.schema);
        let shared = Shared {
            request,
            compiled: &compiled,
            chain: &self.chain,
            selector: &self.selector,
            base_config: &self.base_config,
            events: &self.event_handler,
            cancellation: self.cancellation.as_deref(),
        };

        info!(
            count = request.count,
            mode = ?request.mode,
            fields = request.schema.field_count(),
            complexity = request.schema.complexity_score(),
            "generation request"
        );
        emit(
            &self.event_handler,
            Event::RequestStart {
                count: request.count,
                mode: request.mode,
            },
        );

        let runs = match request.mode {
            GenerationMode::Single => {
                let mut runs = Vec::with_capacity(request.count);
                for index in 0..request.count {
                    runs.push(RecordLoop::new(index, &shared, &request.examples).run().await);
                }
                runs
            }
            GenerationMode::Batch => {
                let mut pending: FuturesUnordered<_> = (0..request.count)
                    .map(|index| RecordLoop::new(index, &shared, &request.examples).run())
                    .collect();
                let mut runs = Vec::with_capacity(request.count);
                while let Some(run) = pending.next().await {
                    runs.push(run);
                }
                runs
            }
            GenerationMode::Progressive => self.run_progressive(&shared).await,
        };

        let result = aggregate(runs);
        info!(
            status = ?result.final_status,
            accepted = result.records.len(),
            attempts = result.attempts.len(),
            "generation finished"
        );
        emit(
            &self.event_handler,
            Event::RequestEnd {
                status: result.final_status,
                accepted: result.records.len(),
                requested: request.count,
            },
        );
        Ok(result)
    }

    async fn run_progressive(&self, shared: &Shared<'_>) -> Vec<RecordRun> {
        let request = shared.request;
        let mut examples = request.examples.clone();
        let mut runs = Vec::with_capacity(request.count);
        for index in 0..request.count {
            let recent = &examples[examples.len().saturating_sub(PROGRESSIVE_EXAMPLES)..];
            let run = RecordLoop::new(index, shared, recent).run().await;
            if let Some(record) = run.accepted_record() {
                examples.push(record.clone());
            }
            runs.push(run);
        }
        runs
    }
}

#[derive(Default)]
pub struct GeneratorBuilder {
    chain: FallbackChain,
    cache: Option<Arc<ValidatorCache>>,
    selector: StrategySelector,
    config: LlmConfig,
    event_handler: Option<Arc<dyn EventHandler>>,
    cancellation: Option<Arc<AtomicBool>>,
}

impl GeneratorBuilder {
    /// Replace the whole chain.
    pub fn chain(mut self, chain: FallbackChain) -> Self {
        self.chain = chain;
        self
    }

    /// Append one backend to the chain.
    pub fn backend(mut self, entry: BackendEntry) -> Self {
        self.chain = self.chain.push(entry);
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.chain = self.chain.with_backoff(backoff);
        self
    }

    /// Share a validator cache between generators.
    pub fn validator_cache(mut self, cache: Arc<ValidatorCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn selector(mut self, selector: StrategySelector) -> Self {
        self.selector = selector;
        self
    }

    /// Base sampling config; strategies tune it per attempt.
    pub fn config(mut self, config: LlmConfig) -> Self {
        self.config = config;
        self
    }

    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Setting the flag stops every record before its next backend call.
    pub fn cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancellation = Some(flag);
        self
    }

    pub fn build(self) -> Result<Generator> {
        if self.chain.is_empty() {
            return Err(GenerationError::InvalidConfig(
                "fallback chain has no backends".into(),
            ));
        }
        Ok(Generator {
            chain: self.chain,
            cache: self.cache.unwrap_or_default(),
            selector: self.selector,
            base_config: self.config,
            event_handler: self.event_handler,
            cancellation: self.cancellation,
        })
    }
}
