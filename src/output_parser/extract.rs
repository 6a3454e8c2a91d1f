//! Locating JSON inside free-form model output.
//!
//! Reasoning models wrap answers in `<think>` blocks, chatty ones add prose
//! around the payload, and most like markdown fences. These helpers peel
//! those layers off without interpreting the JSON itself.

/// Strip think blocks and surrounding whitespace.
pub fn preprocess(text: &str) -> String {
    strip_think_tags(text).trim().to_string()
}

/// Remove every `<think>...</think>` and `<thinking>...</thinking>` block.
///
/// An unclosed block swallows the rest of the text, since a truncated
/// reasoning trace never contains the answer.
///
/// ```
/// use llm_jsongen::output_parser::strip_think_tags;
///
/// assert_eq!(strip_think_tags("<think>hmm</think>{}"), "{}");
/// assert_eq!(strip_think_tags("{}<thinking>cut off"), "{}");
/// ```
pub fn strip_think_tags(text: &str) -> String {
    let mut out = text.to_string();
    for (open, close) in [("<think>", "</think>"), ("<thinking>", "</thinking>")] {
        while let Some(start) = out.find(open) {
            match out[start..].find(close) {
                Some(offset) => out.replace_range(start..start + offset + close.len(), ""),
                None => out.truncate(start),
            }
        }
    }
    out
}

/// A markdown code fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fence<'a> {
    /// Language tag after the opening backticks, if any.
    pub lang: Option<&'a str>,
    /// Trimmed content between the fences.
    pub body: &'a str,
}

/// All closed code fences in order of appearance.
pub fn fenced_blocks(text: &str) -> Vec<Fence<'_>> {
    let mut fences = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        let Some(line_end) = after.find('\n') else {
            break;
        };
        let tag = after[..line_end].trim();
        let body_start = &after[line_end + 1..];
        let Some(close) = body_start.find("```") else {
            break;
        };
        fences.push(Fence {
            lang: (!tag.is_empty()).then_some(tag),
            body: body_start[..close].trim(),
        });
        rest = &body_start[close + 3..];
    }
    fences
}

/// Fence bodies worth trying as JSON: `json`-tagged fences first, then any
/// other fence whose body starts like a JSON container.
pub fn json_fence_bodies(text: &str) -> Vec<&str> {
    let fences = fenced_blocks(text);
    let tagged = fences
        .iter()
        .filter(|f| f.lang.is_some_and(|l| l.eq_ignore_ascii_case("json")));
    let others = fences.iter().filter(|f| {
        !f.lang.is_some_and(|l| l.eq_ignore_ascii_case("json"))
            && (f.body.starts_with('{') || f.body.starts_with('['))
    });
    tagged.chain(others).map(|f| f.body).collect()
}

/// The last balanced `open`...`close` region, skipping delimiters inside
/// double-quoted strings.
///
/// ```
/// use llm_jsongen::output_parser::extract::find_bracketed;
///
/// let text = r#"draft {"a": 1} final {"a": "}", "b": [2]} done"#;
/// assert_eq!(find_bracketed(text, '{', '}'), Some(r#"{"a": "}", "b": [2]}"#));
/// ```
pub fn find_bracketed(text: &str, open: char, close: char) -> Option<&str> {
    let mut last = None;
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        if ch == '"' && depth > 0 {
            in_string = true;
        } else if ch == open {
            if depth == 0 {
                start = i;
            }
            depth += 1;
        } else if ch == close && depth > 0 {
            depth -= 1;
            if depth == 0 {
                last = Some(&text[start..i + ch.len_utf8()]);
            }
        }
    }
    last
}

/// Everything from the first JSON container opener to the end, for output
/// that was cut off before its closing brackets.
pub fn unterminated_tail(text: &str) -> Option<&str> {
    text.find(['{', '[']).map(|i| &text[i..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_multiple_think_blocks() {
        let text = "<think>a</think>x<thinking>b</thinking>y<think>c</think>z";
        assert_eq!(strip_think_tags(text), "xyz");
    }

    #[test]
    fn test_preprocess_trims() {
        assert_eq!(preprocess("  <think>plan</think>\n {\"a\":1} \n"), "{\"a\":1}");
        assert_eq!(preprocess("<think>never finished"), "");
    }

    #[test]
    fn test_fenced_blocks_with_and_without_tags() {
        let text = "intro\n```json\n{\"a\": 1}\n```\nmid\n```\n[1]\n```\n";
        let fences = fenced_blocks(text);
        assert_eq!(fences.len(), 2);
        assert_eq!(fences[0].lang, Some("json"));
        assert_eq!(fences[0].body, "{\"a\": 1}");
        assert_eq!(fences[1].lang, None);
        assert_eq!(fences[1].body, "[1]");
    }

    #[test]
    fn test_unclosed_fence_is_ignored() {
        assert!(fenced_blocks("```json\n{\"a\": 1}").is_empty());
    }

    #[test]
    fn test_json_fence_bodies_order() {
        let text = "```python\nprint(1)\n```\n```\n{\"b\": 2}\n```\n```JSON\n{\"a\": 1}\n```";
        assert_eq!(json_fence_bodies(text), vec!["{\"a\": 1}", "{\"b\": 2}"]);
    }

    #[test]
    fn test_find_bracketed_prefers_last() {
        let text = "first [1, 2] then [3, [4]]";
        assert_eq!(find_bracketed(text, '[', ']'), Some("[3, [4]]"));
    }

    #[test]
    fn test_find_bracketed_unbalanced() {
        assert_eq!(find_bracketed("{\"a\": {\"b\": 1}", '{', '}'), None);
        assert_eq!(find_bracketed("no json here", '{', '}'), None);
    }

    #[test]
    fn test_find_bracketed_escaped_quote_in_string() {
        let text = r#"{"q": "say \"}\" now"}"#;
        assert_eq!(find_bracketed(text, '{', '}'), Some(text));
    }

    #[test]
    fn test_unterminated_tail() {
        assert_eq!(unterminated_tail("Sure: {\"a\": 1"), Some("{\"a\": 1"));
        assert_eq!(unterminated_tail("nothing"), None);
    }
}
