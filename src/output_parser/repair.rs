//! Bounded, deterministic repair of almost-JSON.
//!
//! The input is split once into code, string, and comment segments; every
//! pass then rewrites only the segments it is allowed to touch, so a fix can
//! never corrupt the inside of a string literal. Each pass runs exactly once.

use serde::{Deserialize, Serialize};

/// Inputs longer than this are not repaired.
pub const MAX_REPAIR_INPUT: usize = 256 * 1024;

/// One textual rewrite applied during repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RepairPass {
    /// `//` and `/* */` comments removed.
    StripComments,
    /// `'single'` strings turned into `"double"` ones.
    SingleQuotes,
    /// `True`/`False`/`None` turned into `true`/`false`/`null`.
    PythonLiterals,
    /// `{key: 1}` turned into `{"key": 1}`.
    BareKeys,
    /// Literal newlines and tabs inside strings escaped.
    RawNewlines,
    /// Unterminated strings and containers closed.
    CloseBrackets,
    /// `,` before `}` or `]` removed.
    TrailingCommas,
}

/// The result of a successful repair.
#[derive(Debug, Clone, PartialEq)]
pub struct Repaired {
    pub text: String,
    pub passes: Vec<RepairPass>,
}

/// Rewrite `broken` into valid JSON, if a fixed sequence of passes can.
///
/// Returns `None` when the input already parses, is too large, or is still
/// invalid after every pass.
///
/// ```
/// use llm_jsongen::output_parser::repair_json;
///
/// let fixed = repair_json("{id: 1, name: 'x', tags: ['a',],}").unwrap();
/// assert_eq!(fixed.text, r#"{"id": 1, "name": "x", "tags": ["a"]}"#);
/// ```
pub fn repair_json(broken: &str) -> Option<Repaired> {
    if broken.len() > MAX_REPAIR_INPUT || is_json(broken) {
        return None;
    }

    let mut segments = tokenize(broken);
    let mut passes = Vec::new();

    let steps: [(RepairPass, fn(&mut Vec<Segment>) -> bool); 7] = [
        (RepairPass::StripComments, strip_comments),
        (RepairPass::SingleQuotes, single_quotes),
        (RepairPass::PythonLiterals, python_literals),
        (RepairPass::BareKeys, bare_keys),
        (RepairPass::RawNewlines, raw_newlines),
        (RepairPass::CloseBrackets, close_brackets),
        (RepairPass::TrailingCommas, trailing_commas),
    ];
    for (pass, apply) in steps {
        if apply(&mut segments) {
            passes.push(pass);
            merge_code(&mut segments);
        }
    }

    let text = render(&segments);
    (!passes.is_empty() && is_json(&text)).then_some(Repaired { text, passes })
}

fn is_json(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text).is_ok()
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Code(String),
    /// Double-quoted string body, escapes kept verbatim.
    Str { body: String, closed: bool },
    /// Single-quoted string body, escapes kept verbatim.
    Single(String),
    Comment,
}

fn tokenize(input: &str) -> Vec<Segment> {
    let chars: Vec<char> = input.chars().collect();
    let mut segments = Vec::new();
    let mut code = String::new();
    let mut i = 0;

    let flush = |code: &mut String, segments: &mut Vec<Segment>| {
        if !code.is_empty() {
            segments.push(Segment::Code(std::mem::take(code)));
        }
    };

    while i < chars.len() {
        let ch = chars[i];
        let next = chars.get(i + 1).copied();

        if ch == '"' {
            flush(&mut code, &mut segments);
            let (body, end, closed) = scan_string(&chars, i + 1, '"');
            segments.push(Segment::Str { body, closed });
            i = end;
        } else if ch == '/' && next == Some('/') {
            flush(&mut code, &mut segments);
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            segments.push(Segment::Comment);
        } else if ch == '/' && next == Some('*') {
            flush(&mut code, &mut segments);
            i += 2;
            while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                i += 1;
            }
            i = (i + 2).min(chars.len());
            segments.push(Segment::Comment);
        } else if ch == '\'' && opens_value(&code) {
            match closing_single_quote(&chars, i + 1) {
                Some(close) => {
                    flush(&mut code, &mut segments);
                    segments.push(Segment::Single(chars[i + 1..close].iter().collect()));
                    i = close + 1;
                }
                None => {
                    code.push(ch);
                    i += 1;
                }
            }
        } else {
            code.push(ch);
            i += 1;
        }
    }
    flush(&mut code, &mut segments);
    segments
}

/// Scan a string body starting after its opening quote. Returns the body,
/// the index after the closing quote, and whether a closing quote was found.
fn scan_string(chars: &[char], from: usize, quote: char) -> (String, usize, bool) {
    let mut body = String::new();
    let mut i = from;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                body.push('\\');
                if let Some(&escaped) = chars.get(i + 1) {
                    body.push(escaped);
                }
                i += 2;
            }
            c if c == quote => return (body, i + 1, true),
            c => {
                body.push(c);
                i += 1;
            }
        }
    }
    (body, chars.len(), false)
}

/// A quote opens a value or key only after `{ [ : ,` or at the very start.
fn opens_value(code_before: &str) -> bool {
    match code_before.trim_end().chars().last() {
        None => true,
        Some(c) => matches!(c, '{' | '[' | ':' | ','),
    }
}

/// The closing `'` is the first one followed by a structural character.
fn closing_single_quote(chars: &[char], from: usize) -> Option<usize> {
    let mut i = from;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            '\n' => return None,
            '\'' => {
                let after = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if matches!(after, None | Some(',' | '}' | ']' | ':')) {
                    return Some(i);
                }
                i += 1;
            }
            _ => i += 1,
        }
    }
    None
}

fn render(segments: &[Segment]) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Code(code) => out.push_str(code),
            Segment::Str { body, closed } => {
                out.push('"');
                out.push_str(body);
                if *closed {
                    out.push('"');
                }
            }
            Segment::Single(body) => {
                out.push('\'');
                out.push_str(body);
                out.push('\'');
            }
            Segment::Comment => {}
        }
    }
    out
}

fn merge_code(segments: &mut Vec<Segment>) {
    let mut merged: Vec<Segment> = Vec::with_capacity(segments.len());
    for segment in segments.drain(..) {
        if let (Some(Segment::Code(prev)), Segment::Code(next)) = (merged.last_mut(), &segment) {
            prev.push_str(next);
            continue;
        }
        merged.push(segment);
    }
    *segments = merged;
}

fn strip_comments(segments: &mut Vec<Segment>) -> bool {
    let before = segments.len();
    segments.retain(|s| *s != Segment::Comment);
    segments.len() != before
}

fn single_quotes(segments: &mut Vec<Segment>) -> bool {
    let mut changed = false;
    for segment in segments.iter_mut() {
        if let Segment::Single(body) = segment {
            let mut converted = String::with_capacity(body.len());
            let mut chars = body.chars();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some('\'') => converted.push('\''),
                        Some(other) => {
                            converted.push('\\');
                            converted.push(other);
                        }
                        None => {}
                    },
                    '"' => converted.push_str("\\\""),
                    other => converted.push(other),
                }
            }
            *segment = Segment::Str {
                body: converted,
                closed: true,
            };
            changed = true;
        }
    }
    changed
}

fn map_code(segments: &mut [Segment], rewrite: impl Fn(&str) -> String) -> bool {
    let mut changed = false;
    for segment in segments.iter_mut() {
        if let Segment::Code(code) = segment {
            let rewritten = rewrite(code);
            if rewritten != *code {
                *code = rewritten;
                changed = true;
            }
        }
    }
    changed
}

fn python_literals(segments: &mut Vec<Segment>) -> bool {
    map_code(segments, |code| {
        let mut out = String::with_capacity(code.len());
        let mut word = String::new();
        let flush = |word: &mut String, out: &mut String| {
            out.push_str(match word.as_str() {
                "True" => "true",
                "False" => "false",
                "None" => "null",
                other => other,
            });
            word.clear();
        };
        for c in code.chars() {
            if c.is_alphanumeric() || c == '_' {
                word.push(c);
            } else {
                flush(&mut word, &mut out);
                out.push(c);
            }
        }
        flush(&mut word, &mut out);
        out
    })
}

fn bare_keys(segments: &mut Vec<Segment>) -> bool {
    map_code(segments, |code| {
        let chars: Vec<char> = code.chars().collect();
        let mut out = String::with_capacity(code.len() + 8);
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            let starts_ident = (c.is_alphabetic() || c == '_' || c == '$')
                && (i == 0 || !is_ident_char(chars[i - 1]));
            if starts_ident {
                let end = (i..chars.len())
                    .find(|&j| !is_ident_char(chars[j]))
                    .unwrap_or(chars.len());
                let prev = chars[..i].iter().rev().find(|c| !c.is_whitespace());
                let next = chars[end..].iter().find(|c| !c.is_whitespace());
                let ident: String = chars[i..end].iter().collect();
                if matches!(prev, None | Some('{' | ',')) && next == Some(&':') {
                    out.push('"');
                    out.push_str(&ident);
                    out.push('"');
                } else {
                    out.push_str(&ident);
                }
                i = end;
            } else {
                out.push(c);
                i += 1;
            }
        }
        out
    })
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-' || c == '$'
}

fn raw_newlines(segments: &mut Vec<Segment>) -> bool {
    let mut changed = false;
    for segment in segments.iter_mut() {
        if let Segment::Str { body, .. } = segment {
            if body.contains(['\n', '\r', '\t']) {
                *body = body
                    .replace('\n', "\\n")
                    .replace('\r', "\\r")
                    .replace('\t', "\\t");
                changed = true;
            }
        }
    }
    changed
}

fn close_brackets(segments: &mut Vec<Segment>) -> bool {
    let mut changed = false;
    let mut stack = Vec::new();
    for segment in segments.iter_mut() {
        match segment {
            Segment::Code(code) => {
                for c in code.chars() {
                    match c {
                        '{' => stack.push('}'),
                        '[' => stack.push(']'),
                        '}' | ']' if stack.last() == Some(&c) => {
                            stack.pop();
                        }
                        _ => {}
                    }
                }
            }
            Segment::Str { body, closed } if !*closed => {
                // A dangling backslash would escape the quote we add.
                if body.ends_with('\\') && !body.ends_with("\\\\") {
                    body.pop();
                }
                *closed = true;
                changed = true;
            }
            _ => {}
        }
    }
    if !stack.is_empty() {
        let closers: String = stack.iter().rev().collect();
        segments.push(Segment::Code(closers));
        changed = true;
    }
    changed
}

fn trailing_commas(segments: &mut Vec<Segment>) -> bool {
    map_code(segments, |code| {
        let chars: Vec<char> = code.chars().collect();
        let mut out = String::with_capacity(code.len());
        for (i, &c) in chars.iter().enumerate() {
            if c == ',' {
                let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if matches!(next, Some('}' | ']')) {
                    continue;
                }
            }
            out.push(c);
        }
        out
    })
}
