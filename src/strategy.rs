//! Prompting strategies and the selector that picks and escalates them.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::result::{AttemptOutcome, GenerationAttempt};
use crate::schema::SchemaDescriptor;
use crate::validator::ViolationKind;

/// How a prompt is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Strategy {
    /// Schema and instructions only.
    ZeroShot,
    /// Schema plus example records.
    FewShot,
    /// Asks the model to reason about each field before answering.
    ChainOfThought,
    /// Field-by-field specification with explicit format rules.
    Structured,
    /// Several templates at once; the best-scoring output wins.
    MultiStrategy,
}

impl Strategy {
    pub const ALL: [Strategy; 5] = [
        Strategy::ZeroShot,
        Strategy::FewShot,
        Strategy::ChainOfThought,
        Strategy::Structured,
        Strategy::MultiStrategy,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::ZeroShot => "zero_shot",
            Strategy::FewShot => "few_shot",
            Strategy::ChainOfThought => "chain_of_thought",
            Strategy::Structured => "structured",
            Strategy::MultiStrategy => "multi_strategy",
        }
    }

    /// The next strictly more constrained strategy.
    pub fn escalation(self) -> Option<Strategy> {
        match self {
            Strategy::ZeroShot => Some(Strategy::ChainOfThought),
            Strategy::FewShot => Some(Strategy::Structured),
            Strategy::ChainOfThought => Some(Strategy::Structured),
            Strategy::Structured => Some(Strategy::MultiStrategy),
            Strategy::MultiStrategy => None,
        }
    }

    /// Sampling config for this strategy. `retry` is the number of validated
    /// attempts already made; each one cools the temperature by 0.2.
    pub fn tune(self, base: &LlmConfig, retry: u32) -> LlmConfig {
        let cooled = (base.temperature - 0.2 * retry as f64).max(0.0);
        let mut config = base.clone().with_temperature(cooled);
        match self {
            Strategy::ZeroShot | Strategy::FewShot => {}
            // reasoning comes before the JSON, so the output is not pure JSON
            Strategy::ChainOfThought | Strategy::MultiStrategy => config.json_mode = false,
            Strategy::Structured => {
                config.temperature = cooled.min(0.4);
                config.json_mode = true;
            }
        }
        config
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Complexity cut-offs for the initial strategy. A score below `few_shot`
/// starts zero-shot, below `chain_of_thought` few-shot, and so on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrategyThresholds {
    pub few_shot: f64,
    pub chain_of_thought: f64,
    pub structured: f64,
    pub multi_strategy: f64,
}

impl Default for StrategyThresholds {
    fn default() -> Self {
        Self {
            few_shot: 0.2,
            chain_of_thought: 0.45,
            structured: 0.7,
            multi_strategy: 0.85,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Use(Strategy),
    /// Every strategy has been tried the maximum number of times.
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct StrategySelector {
    thresholds: StrategyThresholds,
    max_uses: usize,
}

impl Default for StrategySelector {
    fn default() -> Self {
        Self {
            thresholds: StrategyThresholds::default(),
            max_uses: 2,
        }
    }
}

impl StrategySelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thresholds(mut self, thresholds: StrategyThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn thresholds(&self) -> &StrategyThresholds {
        &self.thresholds
    }

    /// Strategy for a first attempt at a schema of the given complexity.
    pub fn initial(&self, complexity: f64) -> Strategy {
        let t = &self.thresholds;
        if complexity < t.few_shot {
            Strategy::ZeroShot
        } else if complexity < t.chain_of_thought {
            Strategy::FewShot
        } else if complexity < t.structured {
            Strategy::ChainOfThought
        } else if complexity < t.multi_strategy {
            Strategy::Structured
        } else {
            Strategy::MultiStrategy
        }
    }

    /// Pick the strategy for the next attempt given the record's history.
    ///
    /// A backend failure keeps the strategy, since it says nothing about the
    /// prompt. A rejection escalates when it points at the prompt's shape
    /// (see [`should_escalate`]). No strategy is used more than twice;
    /// backend failures do not count as a use.
    pub fn select(&self, schema: &SchemaDescriptor, prior: &[GenerationAttempt]) -> Selection {
        let candidate = match prior.last() {
            None => self.initial(schema.complexity_score()),
            Some(last) => match last.outcome {
                AttemptOutcome::Rejected if should_escalate(last) => {
                    last.strategy.escalation().unwrap_or(last.strategy)
                }
                _ => last.strategy,
            },
        };
        self.resolve(candidate, prior)
    }

    /// `candidate` if it still has uses left, else the nearest more
    /// constrained strategy that does, else any strategy that does.
    pub fn resolve(&self, candidate: Strategy, prior: &[GenerationAttempt]) -> Selection {
        let available = |s: Strategy| {
            prior
                .iter()
                .filter(|a| a.is_validated() && a.strategy == s)
                .count()
                < self.max_uses
        };

        let mut next = Some(candidate);
        while let Some(s) = next {
            if available(s) {
                return Selection::Use(s);
            }
            next = s.escalation();
        }
        Strategy::ALL
            .into_iter()
            .find(|&s| available(s))
            .map_or(Selection::Exhausted, Selection::Use)
    }
}

/// A rejection escalates when the model could not produce parseable JSON,
/// left out required fields, or got the type or format of more than one
/// distinct field wrong.
pub fn should_escalate(attempt: &GenerationAttempt) -> bool {
    let structural = attempt
        .violations
        .iter()
        .any(|v| matches!(v.kind, ViolationKind::ParsingError | ViolationKind::MissingField));
    let mismatched: HashSet<&str> = attempt
        .violations
        .iter()
        .filter(|v| v.kind.is_shape_mismatch())
        .map(|v| v.field_path.as_str())
        .collect();
    structural || mismatched.len() > 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::tests::attempt;
    use crate::schema::{FieldSpec, PatternKind};
    use crate::validator::Violation;

    fn flat_schema() -> SchemaDescriptor {
        SchemaDescriptor::new(vec![
            FieldSpec::pattern("id", PatternKind::Uuid),
            FieldSpec::string("name"),
        ])
    }

    fn violation(path: &str, kind: ViolationKind) -> Violation {
        Violation::new(path, kind, "bad")
    }

    #[test]
    fn test_initial_thresholds() {
        let selector = StrategySelector::new();
        assert_eq!(selector.initial(0.0), Strategy::ZeroShot);
        assert_eq!(selector.initial(0.19), Strategy::ZeroShot);
        assert_eq!(selector.initial(0.2), Strategy::FewShot);
        assert_eq!(selector.initial(0.5), Strategy::ChainOfThought);
        assert_eq!(selector.initial(0.75), Strategy::Structured);
        assert_eq!(selector.initial(0.85), Strategy::MultiStrategy);
        assert_eq!(selector.initial(1.0), Strategy::MultiStrategy);
    }

    #[test]
    fn test_first_selection_uses_complexity() {
        let selector = StrategySelector::new();
        assert_eq!(selector.select(&flat_schema(), &[]), Selection::Use(Strategy::ZeroShot));
    }

    #[test]
    fn test_missing_field_escalates() {
        let selector = StrategySelector::new();
        let prior = vec![attempt(
            0,
            Strategy::ZeroShot,
            AttemptOutcome::Rejected,
            0.67,
            vec![violation("email", ViolationKind::MissingField)],
        )];
        assert_eq!(
            selector.select(&flat_schema(), &prior),
            Selection::Use(Strategy::ChainOfThought)
        );
    }

    #[test]
    fn test_mismatch_on_one_field_keeps_strategy() {
        let selector = StrategySelector::new();
        let prior = vec![attempt(
            0,
            Strategy::FewShot,
            AttemptOutcome::Rejected,
            0.7,
            vec![
                violation("id", ViolationKind::PatternMismatch),
                violation("id", ViolationKind::TypeMismatch),
            ],
        )];
        assert_eq!(selector.select(&flat_schema(), &prior), Selection::Use(Strategy::FewShot));
    }

    #[test]
    fn test_mismatch_on_two_fields_escalates() {
        let selector = StrategySelector::new();
        let prior = vec![attempt(
            0,
            Strategy::FewShot,
            AttemptOutcome::Rejected,
            0.4,
            vec![
                violation("id", ViolationKind::PatternMismatch),
                violation("name", ViolationKind::TypeMismatch),
            ],
        )];
        assert_eq!(selector.select(&flat_schema(), &prior), Selection::Use(Strategy::Structured));
    }

    #[test]
    fn test_backend_failure_keeps_strategy_without_using_it() {
        let selector = StrategySelector::new();
        let prior = vec![
            attempt(0, Strategy::Structured, AttemptOutcome::Rejected, 0.9, vec![]),
            attempt(0, Strategy::Structured, AttemptOutcome::BackendFailed, 0.0, vec![]),
            attempt(0, Strategy::Structured, AttemptOutcome::BackendFailed, 0.0, vec![]),
        ];
        assert_eq!(selector.select(&flat_schema(), &prior), Selection::Use(Strategy::Structured));
    }

    #[test]
    fn test_strategy_used_twice_is_skipped() {
        let selector = StrategySelector::new();
        let prior = vec![
            attempt(0, Strategy::ZeroShot, AttemptOutcome::Rejected, 0.9, vec![]),
            attempt(0, Strategy::ZeroShot, AttemptOutcome::Rejected, 0.9, vec![]),
        ];
        assert_eq!(
            selector.select(&flat_schema(), &prior),
            Selection::Use(Strategy::ChainOfThought)
        );
    }

    #[test]
    fn test_exhaustion() {
        let selector = StrategySelector::new();
        let prior: Vec<_> = Strategy::ALL
            .iter()
            .flat_map(|&s| {
                [
                    attempt(0, s, AttemptOutcome::Rejected, 0.1, vec![]),
                    attempt(0, s, AttemptOutcome::Rejected, 0.1, vec![]),
                ]
            })
            .collect();
        assert_eq!(selector.select(&flat_schema(), &prior), Selection::Exhausted);
    }

    #[test]
    fn test_falls_back_below_when_ladder_above_is_spent() {
        let selector = StrategySelector::new();
        let prior = vec![
            attempt(0, Strategy::MultiStrategy, AttemptOutcome::Rejected, 0.1, vec![]),
            attempt(0, Strategy::MultiStrategy, AttemptOutcome::Rejected, 0.1, vec![]),
        ];
        assert_eq!(selector.select(&flat_schema(), &prior), Selection::Use(Strategy::ZeroShot));
    }

    #[test]
    fn test_no_strategy_used_more_than_twice() {
        let selector = StrategySelector::new();
        let parse_error = || vec![violation("$", ViolationKind::ParsingError)];
        let mut history = Vec::new();
        while let Selection::Use(s) = selector.select(&flat_schema(), &history) {
            history.push(attempt(0, s, AttemptOutcome::Rejected, 0.0, parse_error()));
            assert!(history.len() <= 10);
        }
        for s in Strategy::ALL {
            assert_eq!(history.iter().filter(|a| a.strategy == s).count(), 2, "{s}");
        }
    }

    #[test]
    fn test_tune_cools_and_constrains() {
        let base = LlmConfig::default().with_temperature(0.7);
        let zero = Strategy::ZeroShot.tune(&base, 0);
        assert_eq!(zero.temperature, 0.7);

        let retry = Strategy::ZeroShot.tune(&base, 2);
        assert!((retry.temperature - 0.3).abs() < 1e-9);
        assert_eq!(Strategy::ZeroShot.tune(&base, 10).temperature, 0.0);

        let structured = Strategy::Structured.tune(&base, 0);
        assert_eq!(structured.temperature, 0.4);
        assert!(structured.json_mode);

        let cot = Strategy::ChainOfThought.tune(&base.clone().with_json_mode(true), 0);
        assert!(!cot.json_mode);
    }
}
