//! Optional observer for generation progress.
//!
//! A [`Generator`](crate::Generator) without a handler behaves identically;
//! events are never needed for correctness. Handlers run inline on the
//! generating task, so they should return quickly.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::backend::BackendError;
use crate::request::GenerationMode;
use crate::result::{AttemptOutcome, FinalStatus, RecordOutcome};
use crate::strategy::Strategy;

/// States of a record's generation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LoopState {
    SelectingStrategy,
    Invoking,
    Validating,
    Retrying,
    Escalating,
    Accepted,
    Exhausted,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LoopState::Accepted | LoopState::Exhausted)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Event {
    RequestStart {
        count: usize,
        mode: GenerationMode,
    },
    PhaseTransition {
        record: usize,
        from: LoopState,
        to: LoopState,
        at: DateTime<Utc>,
    },
    AttemptRecorded {
        record: usize,
        sequence: u32,
        strategy: Strategy,
        backend: String,
        outcome: AttemptOutcome,
        quality_score: f64,
    },
    /// A record moved down the fallback chain. `to` is `None` once the
    /// chain is exhausted.
    BackendSwitched {
        record: usize,
        from: String,
        to: Option<String>,
        error: BackendError,
    },
    TransportRetry {
        record: usize,
        backend: String,
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
    RecordEnd {
        record: usize,
        outcome: RecordOutcome,
        attempts: usize,
    },
    RequestEnd {
        status: FinalStatus,
        accepted: usize,
        requested: usize,
    },
}

/// Receives [`Event`]s.
///
/// ```
/// use llm_jsongen::events::{Event, EventHandler};
///
/// struct Progress;
///
/// impl EventHandler for Progress {
///     fn on_event(&self, event: Event) {
///         if let Event::RecordEnd { record, outcome, .. } = event {
///             println!("record {record}: {outcome:?}");
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: Event);
}

pub(crate) fn emit(handler: &Option<Arc<dyn EventHandler>>, event: Event) {
    if let Some(ref h) = handler {
        h.on_event(event);
    }
}

/// An [`EventHandler`] backed by a closure.
pub struct FnEventHandler<F: Fn(Event) + Send + Sync>(pub F);

impl<F: Fn(Event) + Send + Sync> EventHandler for FnEventHandler<F> {
    fn on_event(&self, event: Event) {
        (self.0)(event);
    }
}
