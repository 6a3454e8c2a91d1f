//! Pull a JSON value out of a raw model response.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{truncate, ParseError};
use super::extract::{find_bracketed, json_fence_bodies, preprocess, unterminated_tail};
use super::repair::{repair_json, RepairPass};

/// Which extraction step produced the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtractionMethod {
    /// Parsed from a markdown code fence.
    FencedBlock,
    /// Parsed from the response text, or a bracketed region of it.
    Direct,
    /// Parsed after textual repair.
    Repaired,
}

/// A value extracted from a response, with how it was found.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub value: Value,
    pub method: ExtractionMethod,
    /// Repair passes applied; empty unless `method` is `Repaired`.
    pub repairs: Vec<RepairPass>,
}

impl Extracted {
    fn plain(value: Value, method: ExtractionMethod) -> Self {
        Self {
            value,
            method,
            repairs: Vec::new(),
        }
    }
}

/// Extract a JSON value, stopping at the first step that succeeds:
///
/// 1. the content of a code fence (`json`-tagged first)
/// 2. the whole response, then the last balanced `{...}` or `[...]` in it
/// 3. bounded repair of the same candidates, plus a cut-off tail
///
/// ```
/// use llm_jsongen::output_parser::{extract_json, ExtractionMethod};
///
/// let raw = "<think>easy</think>Here you go:\n```json\n{\"id\": 7}\n```";
/// let extracted = extract_json(raw).unwrap();
/// assert_eq!(extracted.value["id"], 7);
/// assert_eq!(extracted.method, ExtractionMethod::FencedBlock);
/// ```
pub fn extract_json(response: &str) -> Result<Extracted, ParseError> {
    let cleaned = preprocess(response);
    if cleaned.is_empty() {
        return Err(ParseError::EmptyResponse);
    }

    let fences = json_fence_bodies(&cleaned);
    for body in &fences {
        if let Ok(value) = serde_json::from_str(body) {
            return Ok(Extracted::plain(value, ExtractionMethod::FencedBlock));
        }
    }

    if let Ok(value) = serde_json::from_str(&cleaned) {
        return Ok(Extracted::plain(value, ExtractionMethod::Direct));
    }
    let bracketed = [
        find_bracketed(&cleaned, '{', '}'),
        find_bracketed(&cleaned, '[', ']'),
    ];
    for candidate in bracketed.iter().flatten() {
        if let Ok(value) = serde_json::from_str(candidate) {
            return Ok(Extracted::plain(value, ExtractionMethod::Direct));
        }
    }

    let repair_candidates = fences
        .iter()
        .copied()
        .chain(bracketed.iter().flatten().copied())
        .chain(unterminated_tail(&cleaned))
        .chain(std::iter::once(cleaned.as_str()));
    for candidate in repair_candidates {
        if let Some(repaired) = repair_json(candidate) {
            if let Ok(value) = serde_json::from_str(&repaired.text) {
                return Ok(Extracted {
                    value,
                    method: ExtractionMethod::Repaired,
                    repairs: repaired.passes,
                });
            }
        }
    }

    Err(ParseError::Unparseable {
        text: truncate(&cleaned, 200),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_direct_parse() {
        let e = extract_json(r#"  {"a": 1}  "#).unwrap();
        assert_eq!(e.value, json!({"a": 1}));
        assert_eq!(e.method, ExtractionMethod::Direct);
    }

    #[test]
    fn test_fence_wins_over_prose() {
        let raw = "I considered {\"a\": 0} first.\n```json\n{\"a\": 1}\n```";
        let e = extract_json(raw).unwrap();
        assert_eq!(e.value, json!({"a": 1}));
        assert_eq!(e.method, ExtractionMethod::FencedBlock);
    }

    #[test]
    fn test_object_embedded_in_prose() {
        let raw = "Sure! Here is the record: {\"name\": \"Ada\"} Let me know.";
        let e = extract_json(raw).unwrap();
        assert_eq!(e.value, json!({"name": "Ada"}));
        assert_eq!(e.method, ExtractionMethod::Direct);
    }

    #[test]
    fn test_repair_of_fenced_block() {
        let raw = "```json\n{\"a\": 1, \"b\": [1, 2,],}\n```";
        let e = extract_json(raw).unwrap();
        assert_eq!(e.value, json!({"a": 1, "b": [1, 2]}));
        assert_eq!(e.method, ExtractionMethod::Repaired);
        assert_eq!(e.repairs, vec![RepairPass::TrailingCommas]);
    }

    #[test]
    fn test_repair_of_cut_off_tail() {
        let raw = "Output: {\"id\": \"abc\", \"tags\": [\"x\"";
        let e = extract_json(raw).unwrap();
        assert_eq!(e.value, json!({"id": "abc", "tags": ["x"]}));
        assert_eq!(e.method, ExtractionMethod::Repaired);
    }

    #[test]
    fn test_python_style_dict() {
        let e = extract_json("{id: 1, name: 'x'}").unwrap();
        assert_eq!(e.value, json!({"id": 1, "name": "x"}));
    }

    #[test]
    fn test_empty_and_think_only() {
        assert_eq!(extract_json("   ").unwrap_err(), ParseError::EmptyResponse);
        assert_eq!(
            extract_json("<think>still thinking").unwrap_err(),
            ParseError::EmptyResponse
        );
    }

    #[test]
    fn test_unparseable() {
        let err = extract_json("I cannot help with that.").unwrap_err();
        assert!(matches!(err, ParseError::Unparseable { .. }));
    }
}
