//! # LLM Output Parser
//!
//! Defensive JSON extraction from model responses. Handles think blocks,
//! markdown fences, prose around the payload, and the usual malformed-JSON
//! habits of smaller models, without another model call.
//!
//! | Function | Purpose |
//! |----------|---------|
//! | [`extract_json`] | Fence, direct, then repaired extraction |
//! | [`repair_json`] | Bounded textual repair of almost-JSON |
//! | [`strip_think_tags`] | Remove `<think>` blocks from text |

pub mod error;
pub mod extract;
pub mod json;
pub mod repair;

pub use error::ParseError;
pub use extract::{preprocess, strip_think_tags};
pub use json::{extract_json, ExtractionMethod, Extracted};
pub use repair::{repair_json, RepairPass, Repaired};
