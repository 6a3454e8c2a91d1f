//! Error type for JSON extraction.

/// Why no JSON value could be pulled out of a model response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The response was empty, whitespace-only, or only a think block.
    #[error("empty LLM response")]
    EmptyResponse,

    /// Fenced blocks, direct parsing and repair all failed.
    #[error("could not extract JSON from LLM response: {text}")]
    Unparseable {
        /// A truncated copy of the cleaned response (max 200 chars).
        text: String,
    },
}

/// Truncate to at most `max_chars` characters, appending "..." if truncated.
pub(crate) fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &s[..cut]),
        None => s.to_string(),
    }
}
