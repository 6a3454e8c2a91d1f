//! Schema validation and quality scoring of raw model output.
//!
//! Detection is independent of [`ValidationLevel`]: the level only decides
//! whether a scored result is accepted.
//!
//! ```
//! use llm_jsongen::schema::{FieldSpec, PatternKind, SchemaDescriptor};
//! use llm_jsongen::validator::{validate, ValidationLevel, ViolationKind};
//!
//! let schema = SchemaDescriptor::new(vec![
//!     FieldSpec::string("name"),
//!     FieldSpec::pattern("email", PatternKind::Email),
//! ]);
//! let v = validate(r#"{"name": "Ada"}"#, &schema, ValidationLevel::Moderate);
//! assert_eq!(v.violations[0].kind, ViolationKind::MissingField);
//! assert_eq!(v.quality_score, 0.5);
//! assert!(!v.accepted);
//! ```

pub mod cache;

pub use cache::{CompiledSchema, ValidatorCache};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GenerationError;
use crate::output_parser::{ExtractionMethod, RepairPass};
use crate::schema::SchemaDescriptor;

/// How strict acceptance is.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum ValidationLevel {
    /// Perfect score and no blocking violations.
    Strict,
    /// Score of at least [`MODERATE_THRESHOLD`].
    #[default]
    Moderate,
    /// Anything that parses.
    Lenient,
}

/// Minimum quality score accepted at [`ValidationLevel::Moderate`].
pub const MODERATE_THRESHOLD: f64 = 0.7;

impl ValidationLevel {
    /// Whether a validated output passes at this level.
    pub fn accepts(self, parsed: bool, quality_score: f64, violations: &[Violation]) -> bool {
        if !parsed {
            return false;
        }
        match self {
            ValidationLevel::Strict => {
                quality_score >= 1.0 && !violations.iter().any(|v| v.kind.is_blocking())
            }
            ValidationLevel::Moderate => quality_score >= MODERATE_THRESHOLD,
            ValidationLevel::Lenient => true,
        }
    }
}

impl FromStr for ValidationLevel {
    type Err = GenerationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "strict" => Ok(ValidationLevel::Strict),
            "moderate" => Ok(ValidationLevel::Moderate),
            "lenient" => Ok(ValidationLevel::Lenient),
            other => Err(GenerationError::InvalidConfig(format!(
                "unknown validation level '{other}'"
            ))),
        }
    }
}

/// What went wrong with one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ViolationKind {
    MissingField,
    TypeMismatch,
    PatternMismatch,
    OutOfRange,
    ExtraField,
    /// No JSON could be extracted at all.
    ParsingError,
}

impl ViolationKind {
    /// Contribution to the weighted violation count.
    pub fn weight(self) -> f64 {
        match self {
            ViolationKind::MissingField | ViolationKind::TypeMismatch => 1.0,
            ViolationKind::PatternMismatch | ViolationKind::OutOfRange => 0.6,
            ViolationKind::ExtraField => 0.1,
            ViolationKind::ParsingError => 1.0,
        }
    }

    /// Unexpected fields are reported but never block acceptance on their own.
    pub fn is_blocking(self) -> bool {
        self != ViolationKind::ExtraField
    }

    /// Mismatches a more constrained prompt is likely to fix.
    pub fn is_shape_mismatch(self) -> bool {
        matches!(self, ViolationKind::TypeMismatch | ViolationKind::PatternMismatch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Dotted path, `items[2].sku` style. `$` is the document root.
    pub field_path: String,
    pub kind: ViolationKind,
    pub message: String,
}

impl Violation {
    pub fn new(field_path: impl Into<String>, kind: ViolationKind, message: impl Into<String>) -> Self {
        Self {
            field_path: field_path.into(),
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field_path, self.message)
    }
}

/// The outcome of validating one raw response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Validation {
    pub parsed: Option<Value>,
    pub violations: Vec<Violation>,
    /// In `[0, 1]`.
    pub quality_score: f64,
    pub accepted: bool,
    pub extraction: Option<ExtractionMethod>,
    pub repairs: Vec<RepairPass>,
    /// Values rewritten to their declared type before checking. Empty
    /// unless coercion was asked for.
    pub coercions: Vec<Coercion>,
}

/// One value rewritten to the type its field declares, e.g. `"42"` to `42`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coercion {
    pub field_path: String,
    pub from: Value,
    pub to: Value,
}

impl fmt::Display for Coercion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} -> {}", self.field_path, self.from, self.to)
    }
}

/// `1 - weighted violations / field count`, clamped to `[0, 1]`.
pub fn quality_score(violations: &[Violation], field_count: usize) -> f64 {
    if violations.iter().any(|v| v.kind == ViolationKind::ParsingError) {
        return 0.0;
    }
    let weighted: f64 = violations.iter().map(|v| v.kind.weight()).sum();
    (1.0 - weighted / field_count.max(1) as f64).clamp(0.0, 1.0)
}

/// Validate without a cache. Prefer [`ValidatorCache::validate`] when the
/// same schema is checked repeatedly.
pub fn validate(raw: &str, schema: &SchemaDescriptor, level: ValidationLevel) -> Validation {
    CompiledSchema::compile(schema).validate(raw, level)
}
