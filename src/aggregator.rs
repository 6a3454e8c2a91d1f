//! Merge per-record loop outcomes into one [`GenerationResult`].

use crate::result::{
    AttemptOutcome, FinalStatus, GenerationAttempt, GenerationResult, RecordOutcome, RecordReport,
};

/// Everything one record's loop produced.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordRun {
    pub index: usize,
    pub outcome: RecordOutcome,
    pub attempts: Vec<GenerationAttempt>,
}

impl RecordRun {
    pub fn accepted_record(&self) -> Option<&serde_json::Value> {
        self.attempts
            .iter()
            .rev()
            .find(|a| a.outcome == AttemptOutcome::Accepted)
            .and_then(|a| a.parsed.as_ref())
    }
}

/// Restore request order and compute the final status. Runs may arrive in
/// any order.
pub fn aggregate(mut runs: Vec<RecordRun>) -> GenerationResult {
    runs.sort_by_key(|r| r.index);

    let mut records = Vec::new();
    let mut reports = Vec::with_capacity(runs.len());
    let mut attempts = Vec::new();
    for run in runs {
        let report = report_for(&run);
        if report.is_accepted() {
            if let Some(ref record) = report.record {
                records.push(record.clone());
            }
        }
        reports.push(report);
        attempts.extend(run.attempts);
    }

    let accepted = reports.iter().filter(|r| r.is_accepted()).count();
    let final_status = if accepted > 0 && accepted == reports.len() && records.len() == accepted {
        FinalStatus::Success
    } else if accepted > 0 {
        FinalStatus::PartialSuccess
    } else {
        FinalStatus::Failure
    };

    GenerationResult {
        records,
        reports,
        attempts,
        final_status,
    }
}

fn report_for(run: &RecordRun) -> RecordReport {
    let chosen = match run.outcome {
        RecordOutcome::Accepted => run
            .attempts
            .iter()
            .rev()
            .find(|a| a.outcome == AttemptOutcome::Accepted),
        RecordOutcome::Exhausted(_) => best_partial(&run.attempts),
    };

    RecordReport {
        index: run.index,
        outcome: run.outcome,
        record: chosen.and_then(|a| a.parsed.clone()),
        quality_score: chosen.map_or(0.0, |a| a.quality_score),
        strategy: chosen.map(|a| a.strategy),
        backend: chosen.map(|a| a.backend.clone()),
        model_id: chosen.map(|a| a.model_id.clone()),
        attempts: run.attempts.len(),
        backend_failures: run
            .attempts
            .iter()
            .filter(|a| a.outcome == AttemptOutcome::BackendFailed)
            .count() as u32,
    }
}

/// Highest-scoring attempt that parsed; the earliest wins a tie.
pub fn best_partial(attempts: &[GenerationAttempt]) -> Option<&GenerationAttempt> {
    attempts
        .iter()
        .filter(|a| a.parsed.is_some())
        .fold(None, |best: Option<&GenerationAttempt>, a| match best {
            Some(b) if b.quality_score >= a.quality_score => Some(b),
            _ => Some(a),
        })
}
