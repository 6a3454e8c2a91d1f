//! The adaptive loop for a single record.
//!
//! ```text
//! SelectingStrategy ──► Invoking ──► Validating ──► Accepted
//!        ▲                │  ▲            │
//!        │   backend fail └──┘            ├──► Retrying ──► (Escalating) ──┐
//!        │   (next in chain)              │                                │
//!        └────────────────────────────────┼────────────────────────────────┘
//!                                         └──► Exhausted
//! ```
//!
//! The only suspension point is the backend call inside `Invoking`.
//! Cancellation and the deadline are checked before every backend call,
//! transport retries included, and again after every backoff sleep.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::aggregator::RecordRun;
use crate::backend::{
    BackendEntry, BackendError, CallGuard, ChainCursor, Completion, FallbackChain, Interrupt,
};
use crate::config::LlmConfig;
use crate::error::GenerationError;
use crate::events::{emit, Event, EventHandler, LoopState};
use crate::prompt::{build_prompt, multi_strategy_variants, PromptContext};
use crate::request::GenerationRequest;
use crate::result::{AttemptOutcome, ExhaustionReason, GenerationAttempt, RecordOutcome};
use crate::strategy::{should_escalate, Selection, Strategy, StrategySelector};
use crate::validator::{CompiledSchema, Validation, Violation};

/// Borrowed, read-only collaborators shared by every record of a request.
pub(crate) struct Shared<'a> {
    pub request: &'a GenerationRequest,
    pub compiled: &'a CompiledSchema,
    pub chain: &'a FallbackChain,
    pub selector: &'a StrategySelector,
    pub base_config: &'a LlmConfig,
    pub events: &'a Option<Arc<dyn EventHandler>>,
    pub cancellation: Option<&'a AtomicBool>,
}

impl Shared<'_> {
    fn guard(&self) -> CallGuard<'_> {
        CallGuard::new(self.cancellation, self.request.deadline)
    }
}

/// Raw text a backend produced, tagged with the template that asked for it.
struct Output {
    template: Strategy,
    raw: String,
}

/// Bookkeeping for one pass through `Invoking`.
struct Call<'e> {
    entry: &'e BackendEntry,
    strategy: Strategy,
    started_at: chrono::DateTime<Utc>,
    started: Instant,
    transport_retries: u32,
}

/// A template whose call failed while its siblings produced output.
struct TemplateError {
    template: Strategy,
    kind: BackendError,
    message: String,
}

enum Invoked<'e> {
    Produced(Call<'e>, Vec<Output>, Vec<TemplateError>),
    Failed(Call<'e>, BackendError, String),
    /// Stopped by cancellation or the deadline, with the backend error seen
    /// before that, if any.
    Interrupted(Call<'e>, Interrupt, Option<(BackendError, String)>),
}

pub(crate) struct RecordLoop<'a> {
    index: usize,
    shared: &'a Shared<'a>,
    examples: &'a [Value],
    state: LoopState,
    cursor: ChainCursor,
    attempts: Vec<GenerationAttempt>,
}

impl<'a> RecordLoop<'a> {
    pub fn new(index: usize, shared: &'a Shared<'a>, examples: &'a [Value]) -> Self {
        Self {
            index,
            shared,
            examples,
            state: LoopState::SelectingStrategy,
            cursor: shared.chain.cursor(),
            attempts: Vec::new(),
        }
    }

    pub async fn run(mut self) -> RecordRun {
        let outcome = self.drive().await;
        info!(
            record = self.index,
            ?outcome,
            attempts = self.attempts.len(),
            "record finished"
        );
        emit(
            self.shared.events,
            Event::RecordEnd {
                record: self.index,
                outcome,
                attempts: self.attempts.len(),
            },
        );
        RecordRun {
            index: self.index,
            outcome,
            attempts: self.attempts,
        }
    }

    async fn drive(&mut self) -> RecordOutcome {
        let chain = self.shared.chain;
        loop {
            let strategy = match self.select() {
                Selection::Use(strategy) => strategy,
                Selection::Exhausted => return self.exhaust(ExhaustionReason::StrategiesExhausted),
            };
            self.transition(LoopState::Invoking);

            let (call, outputs, template_errors) = loop {
                if let Some(reason) = self.interruption() {
                    return self.exhaust(reason);
                }
                let Some(entry) = chain.current(&self.cursor) else {
                    return self.exhaust(ExhaustionReason::BackendsExhausted);
                };
                match self.invoke(entry, strategy).await {
                    Invoked::Produced(call, outputs, errors) => break (call, outputs, errors),
                    Invoked::Interrupted(call, interrupt, error) => {
                        if let Some((kind, message)) = error {
                            warn!(
                                record = self.index,
                                backend = %call.entry.label,
                                error = %kind,
                                %message,
                                ?interrupt,
                                "backend failed, not retrying"
                            );
                            let attempt = self.failed_attempt(call, kind, message);
                            self.record(attempt);
                        }
                        return self.exhaust(interrupt.into());
                    }
                    Invoked::Failed(call, kind, message) => {
                        warn!(
                            record = self.index,
                            backend = %call.entry.label,
                            error = %kind,
                            %message,
                            "backend failed"
                        );
                        let from = call.entry.label.clone();
                        let attempt = self.failed_attempt(call, kind, message);
                        self.record(attempt);
                        let advanced = self.cursor.advance(chain);
                        let to = chain.current(&self.cursor).map(|e| e.label.clone());
                        emit(
                            self.shared.events,
                            Event::BackendSwitched {
                                record: self.index,
                                from,
                                to,
                                error: kind,
                            },
                        );
                        if !advanced {
                            return self.exhaust(ExhaustionReason::BackendsExhausted);
                        }
                    }
                }
            };

            for e in &template_errors {
                warn!(
                    record = self.index,
                    backend = %call.entry.label,
                    template = %e.template,
                    error = %e.kind,
                    message = %e.message,
                    "template call failed"
                );
            }
            self.transition(LoopState::Validating);
            let attempt = self.validated_attempt(call, outputs, template_errors);
            let accepted = attempt.outcome == AttemptOutcome::Accepted;
            let escalate = should_escalate(&attempt);
            self.record(attempt);

            if accepted {
                self.transition(LoopState::Accepted);
                return RecordOutcome::Accepted;
            }
            if self.validated() > self.shared.request.max_retries as usize {
                return self.exhaust(ExhaustionReason::RetryBudget);
            }
            self.transition(LoopState::Retrying);
            if escalate {
                self.transition(LoopState::Escalating);
            }
            self.transition(LoopState::SelectingStrategy);
        }
    }

    fn select(&self) -> Selection {
        let request = self.shared.request;
        match request.strategy {
            Some(first) if self.attempts.is_empty() => self.shared.selector.resolve(first, &[]),
            _ => self.shared.selector.select(&request.schema, &self.attempts),
        }
    }

    fn interruption(&self) -> Option<ExhaustionReason> {
        self.shared.guard().check().map(ExhaustionReason::from)
    }

    fn validated(&self) -> usize {
        self.attempts.iter().filter(|a| a.is_validated()).count()
    }

    /// Violations of the latest validated attempt, quoted back on retry.
    fn feedback(&self) -> &[Violation] {
        self.attempts
            .iter()
            .rev()
            .find(|a| a.is_validated())
            .map(|a| a.violations.as_slice())
            .unwrap_or(&[])
    }

    async fn invoke<'e>(&self, entry: &'e BackendEntry, strategy: Strategy) -> Invoked<'e> {
        let shared = self.shared;
        let ctx = PromptContext::new(&shared.request.schema, &shared.request.context)
            .with_examples(self.examples)
            .with_feedback(self.feedback());
        let retry = self.validated() as u32;

        let templates = match strategy {
            Strategy::MultiStrategy => {
                multi_strategy_variants(&shared.request.schema, !self.examples.is_empty())
            }
            single => vec![single],
        };
        debug!(
            record = self.index,
            %strategy,
            backend = %entry.label,
            templates = templates.len(),
            "invoking"
        );

        let started_at = Utc::now();
        let started = Instant::now();
        let calls = templates.iter().map(|&template| {
            let prompt = build_prompt(template, &ctx);
            let config = template.tune(shared.base_config, retry);
            async move {
                let mut on_retry = |attempt: u32, delay: Duration, reason: &str| {
                    emit(
                        shared.events,
                        Event::TransportRetry {
                            record: self.index,
                            backend: entry.label.clone(),
                            attempt,
                            delay_ms: delay.as_millis() as u64,
                            reason: reason.to_string(),
                        },
                    );
                };
                let completion = shared
                    .chain
                    .complete(entry, &prompt, &config, shared.guard(), Some(&mut on_retry))
                    .await;
                (template, completion)
            }
        });
        let completions: Vec<(Strategy, Completion)> = join_all(calls).await;

        let mut call = Call {
            entry,
            strategy,
            started_at,
            started,
            transport_retries: 0,
        };
        let mut outputs = Vec::new();
        let mut errors = Vec::new();
        let mut interrupted = None;
        for (template, completion) in completions {
            let Completion {
                response,
                transport_retries,
                interrupted: stopped,
            } = completion;
            call.transport_retries += transport_retries;
            interrupted = interrupted.or(stopped);
            match response {
                Ok(response) => outputs.push(Output {
                    template,
                    raw: response.text,
                }),
                // stopped before its first call; nothing failed
                Err(GenerationError::Cancelled | GenerationError::DeadlineReached) if stopped.is_some() => {}
                Err(e) => errors.push(TemplateError {
                    template,
                    kind: BackendError::classify(&e),
                    message: e.to_string(),
                }),
            }
        }

        if !outputs.is_empty() {
            return Invoked::Produced(call, outputs, errors);
        }
        let first = errors.into_iter().next().map(|e| (e.kind, e.message));
        match (interrupted, first) {
            (Some(interrupt), first) => Invoked::Interrupted(call, interrupt, first),
            (None, Some((kind, message))) => Invoked::Failed(call, kind, message),
            (None, None) => Invoked::Produced(call, outputs, Vec::new()),
        }
    }

    fn failed_attempt(&self, call: Call<'_>, kind: BackendError, message: String) -> GenerationAttempt {
        GenerationAttempt {
            record_index: self.index,
            sequence: self.attempts.len() as u32 + 1,
            strategy: call.strategy,
            template: call.strategy,
            backend: call.entry.label.clone(),
            model_id: call.entry.model.clone(),
            raw_output: None,
            parsed: None,
            violations: Vec::new(),
            quality_score: 0.0,
            outcome: AttemptOutcome::BackendFailed,
            backend_error: Some(kind),
            error_message: Some(message),
            extraction: None,
            coercions: Vec::new(),
            transport_retries: call.transport_retries,
            started_at: call.started_at,
            elapsed_ms: call.started.elapsed().as_millis() as u64,
        }
    }

    /// Validate every output and keep the best. Ties go to the earliest
    /// template in submission order. Failed sibling templates are noted on
    /// the attempt without changing its outcome.
    fn validated_attempt(
        &self,
        call: Call<'_>,
        outputs: Vec<Output>,
        template_errors: Vec<TemplateError>,
    ) -> GenerationAttempt {
        let mut best: Option<(Output, Validation)> = None;
        for output in outputs {
            let validation = self.validate(&output.raw);
            let better = best
                .as_ref()
                .map_or(true, |(_, b)| validation.quality_score > b.quality_score);
            if better {
                best = Some((output, validation));
            }
        }

        let (output, validation) = match best {
            Some(pair) => pair,
            // a multi-strategy call where every template produced nothing
            None => (
                Output {
                    template: call.strategy,
                    raw: String::new(),
                },
                self.validate(""),
            ),
        };

        let error_message = (!template_errors.is_empty()).then(|| {
            template_errors
                .iter()
                .map(|e| format!("{}: {}", e.template, e.message))
                .collect::<Vec<_>>()
                .join("; ")
        });

        GenerationAttempt {
            record_index: self.index,
            sequence: self.attempts.len() as u32 + 1,
            strategy: call.strategy,
            template: output.template,
            backend: call.entry.label.clone(),
            model_id: call.entry.model.clone(),
            raw_output: Some(output.raw),
            parsed: validation.parsed,
            violations: validation.violations,
            quality_score: validation.quality_score,
            outcome: if validation.accepted {
                AttemptOutcome::Accepted
            } else {
                AttemptOutcome::Rejected
            },
            backend_error: template_errors.first().map(|e| e.kind),
            error_message,
            extraction: validation.extraction,
            coercions: validation.coercions,
            transport_retries: call.transport_retries,
            started_at: call.started_at,
            elapsed_ms: call.started.elapsed().as_millis() as u64,
        }
    }

    fn validate(&self, raw: &str) -> Validation {
        let request = self.shared.request;
        if request.coerce_types {
            self.shared.compiled.validate_coerced(raw, request.validation_level)
        } else {
            self.shared.compiled.validate(raw, request.validation_level)
        }
    }

    fn record(&mut self, attempt: GenerationAttempt) {
        debug!(
            record = self.index,
            sequence = attempt.sequence,
            strategy = %attempt.strategy,
            outcome = ?attempt.outcome,
            score = attempt.quality_score,
            violations = attempt.violations.len(),
            "attempt recorded"
        );
        emit(
            self.shared.events,
            Event::AttemptRecorded {
                record: self.index,
                sequence: attempt.sequence,
                strategy: attempt.strategy,
                backend: attempt.backend.clone(),
                outcome: attempt.outcome,
                quality_score: attempt.quality_score,
            },
        );
        self.attempts.push(attempt);
    }

    fn transition(&mut self, to: LoopState) {
        let from = std::mem::replace(&mut self.state, to);
        debug!(record = self.index, ?from, ?to, "phase");
        emit(
            self.shared.events,
            Event::PhaseTransition {
                record: self.index,
                from,
                to,
                at: Utc::now(),
            },
        );
    }

    fn exhaust(&mut self, reason: ExhaustionReason) -> RecordOutcome {
        self.transition(LoopState::Exhausted);
        RecordOutcome::Exhausted(reason)
    }
}
