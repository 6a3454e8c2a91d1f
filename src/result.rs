//! Attempt history and the final result handed back to callers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::backend::{BackendError, Interrupt};
use crate::output_parser::ExtractionMethod;
use crate::strategy::Strategy;
use crate::validator::{Coercion, Violation, ViolationKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AttemptOutcome {
    Accepted,
    Rejected,
    BackendFailed,
}

/// One iteration of a record's generation loop. Never modified once recorded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationAttempt {
    pub record_index: usize,
    /// 1-based position in the record's history.
    pub sequence: u32,
    pub strategy: Strategy,
    /// Prompt template that produced the kept output. Differs from
    /// `strategy` only for multi-strategy attempts.
    pub template: Strategy,
    pub backend: String,
    pub model_id: String,
    pub raw_output: Option<String>,
    pub parsed: Option<Value>,
    pub violations: Vec<Violation>,
    pub quality_score: f64,
    pub outcome: AttemptOutcome,
    pub backend_error: Option<BackendError>,
    pub error_message: Option<String>,
    pub extraction: Option<ExtractionMethod>,
    /// Values rewritten to their declared type before validation.
    pub coercions: Vec<Coercion>,
    /// Transport-level retries spent on the backend before this attempt
    /// returned or failed.
    pub transport_retries: u32,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl GenerationAttempt {
    /// Whether the output reached the validator.
    pub fn is_validated(&self) -> bool {
        self.outcome != AttemptOutcome::BackendFailed
    }
}

/// Why a record stopped without an accepted output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ExhaustionReason {
    RetryBudget,
    StrategiesExhausted,
    BackendsExhausted,
    DeadlineReached,
    Cancelled,
}

impl From<Interrupt> for ExhaustionReason {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Cancelled => ExhaustionReason::Cancelled,
            Interrupt::DeadlineReached => ExhaustionReason::DeadlineReached,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecordOutcome {
    Accepted,
    Exhausted(ExhaustionReason),
}

/// Per-record summary with provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordReport {
    pub index: usize,
    pub outcome: RecordOutcome,
    /// The accepted record, or the best-scoring parsed output when exhausted.
    pub record: Option<Value>,
    pub quality_score: f64,
    pub strategy: Option<Strategy>,
    pub backend: Option<String>,
    pub model_id: Option<String>,
    pub attempts: usize,
    pub backend_failures: u32,
}

impl RecordReport {
    pub fn is_accepted(&self) -> bool {
        self.outcome == RecordOutcome::Accepted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FinalStatus {
    Success,
    PartialSuccess,
    Failure,
}

/// Everything a generation request produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResult {
    /// Accepted records in request order.
    pub records: Vec<Value>,
    /// One report per requested record, in request order.
    pub reports: Vec<RecordReport>,
    /// Full history, grouped by record in request order.
    pub attempts: Vec<GenerationAttempt>,
    pub final_status: FinalStatus,
}

impl GenerationResult {
    pub fn is_success(&self) -> bool {
        self.final_status == FinalStatus::Success
    }

    pub fn attempts_for(&self, index: usize) -> impl Iterator<Item = &GenerationAttempt> {
        self.attempts.iter().filter(move |a| a.record_index == index)
    }

    /// Best-effort outputs of records that were never accepted.
    pub fn partials(&self) -> impl Iterator<Item = (usize, &Value)> {
        self.reports
            .iter()
            .filter(|r| !r.is_accepted())
            .filter_map(|r| r.record.as_ref().map(|v| (r.index, v)))
    }

    /// Categorized counters over the attempt history.
    pub fn stats(&self) -> GenerationStats {
        let mut stats = GenerationStats {
            records_requested: self.reports.len(),
            records_accepted: self.records.len(),
            attempts: self.attempts.len(),
            ..Default::default()
        };

        let mut quality_sum = 0.0;
        let mut quality_n = 0usize;
        for attempt in &self.attempts {
            match attempt.outcome {
                AttemptOutcome::Accepted => stats.accepted += 1,
                AttemptOutcome::Rejected => stats.rejected += 1,
                AttemptOutcome::BackendFailed => {
                    stats.backend_failures += 1;
                    continue;
                }
            }
            quality_sum += attempt.quality_score;
            quality_n += 1;
            if attempt.extraction == Some(ExtractionMethod::Repaired) {
                stats.repaired_outputs += 1;
            }
            stats.coerced_values += attempt.coercions.len();

            let entry = stats.by_strategy.entry(attempt.strategy).or_default();
            entry.mean_quality = (entry.mean_quality * entry.attempts as f64 + attempt.quality_score)
                / (entry.attempts + 1) as f64;
            entry.attempts += 1;
            if attempt.outcome == AttemptOutcome::Accepted {
                entry.accepted += 1;
            }

            for violation in &attempt.violations {
                *stats.violations_by_kind.entry(violation.kind).or_default() += 1;
            }
        }
        if quality_n > 0 {
            stats.mean_quality = quality_sum / quality_n as f64;
        }
        stats
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GenerationStats {
    pub records_requested: usize,
    pub records_accepted: usize,
    pub attempts: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub backend_failures: usize,
    pub repaired_outputs: usize,
    pub coerced_values: usize,
    /// Over validated attempts only.
    pub mean_quality: f64,
    pub by_strategy: BTreeMap<Strategy, StrategyStats>,
    pub violations_by_kind: BTreeMap<ViolationKind, usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StrategyStats {
    pub attempts: usize,
    pub accepted: usize,
    pub mean_quality: f64,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn attempt(
        record_index: usize,
        strategy: Strategy,
        outcome: AttemptOutcome,
        quality_score: f64,
        violations: Vec<Violation>,
    ) -> GenerationAttempt {
        GenerationAttempt {
            record_index,
            sequence: 1,
            strategy,
            template: strategy,
            backend: "mock".into(),
            model_id: "test-model".into(),
            raw_output: None,
            parsed: None,
            violations,
            quality_score,
            outcome,
            backend_error: (outcome == AttemptOutcome::BackendFailed).then_some(BackendError::Timeout),
            error_message: None,
            extraction: None,
            coercions: Vec::new(),
            transport_retries: 0,
            started_at: Utc::now(),
            elapsed_ms: 0,
        }
    }

    #[test]
    fn test_stats_counts() {
        let missing = Violation::new("email", ViolationKind::MissingField, "missing");
        let result = GenerationResult {
            records: vec![json!({"a": 1})],
            reports: vec![],
            attempts: vec![
                attempt(0, Strategy::ZeroShot, AttemptOutcome::BackendFailed, 0.0, vec![]),
                attempt(0, Strategy::ZeroShot, AttemptOutcome::Rejected, 0.5, vec![missing]),
                attempt(0, Strategy::ChainOfThought, AttemptOutcome::Accepted, 1.0, vec![]),
            ],
            final_status: FinalStatus::Success,
        };
        let stats = result.stats();
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.backend_failures, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.mean_quality, 0.75);
        assert_eq!(stats.by_strategy[&Strategy::ZeroShot].attempts, 1);
        assert_eq!(stats.by_strategy[&Strategy::ChainOfThought].accepted, 1);
        assert_eq!(stats.violations_by_kind[&ViolationKind::MissingField], 1);
    }

    #[test]
    fn test_interrupt_maps_to_exhaustion() {
        assert_eq!(ExhaustionReason::from(Interrupt::Cancelled), ExhaustionReason::Cancelled);
        assert_eq!(
            ExhaustionReason::from(Interrupt::DeadlineReached),
            ExhaustionReason::DeadlineReached
        );
    }

    #[test]
    fn test_attempt_queries() {
        let report = |index, outcome, record| RecordReport {
            index,
            outcome,
            record,
            quality_score: 0.4,
            strategy: None,
            backend: None,
            model_id: None,
            attempts: 1,
            backend_failures: 0,
        };
        let result = GenerationResult {
            records: vec![],
            reports: vec![
                report(0, RecordOutcome::Exhausted(ExhaustionReason::RetryBudget), Some(json!({"x": 1}))),
                report(1, RecordOutcome::Exhausted(ExhaustionReason::BackendsExhausted), None),
            ],
            attempts: vec![
                attempt(0, Strategy::FewShot, AttemptOutcome::Rejected, 0.4, vec![]),
                attempt(1, Strategy::FewShot, AttemptOutcome::BackendFailed, 0.0, vec![]),
            ],
            final_status: FinalStatus::Failure,
        };
        assert_eq!(result.attempts_for(1).count(), 1);
        let partials: Vec<_> = result.partials().collect();
        assert_eq!(partials, vec![(0, &json!({"x": 1}))]);
        assert!(!result.is_success());
    }
}
