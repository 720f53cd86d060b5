//! Structured-output salvage
//!
//! The generation service is asked for one JSON value but often wraps it in
//! prose or code fences, stops mid-object at its output-length limit, writes
//! fractions as `1/2`, or leaves trailing commas. [`sanitize`] recovers as
//! much as it can and never fails: the worst case is
//! [`StructuredResult::Failed`] carrying the raw body.
//!
//! Steps, short-circuiting on the first successful parse:
//! 1. Strip code fences
//! 2. Slice the first balanced `{...}` / `[...]` span (Parsed)
//! 3. Truncation repair: drop the incomplete trailing field, close an
//!    unterminated string, close open structures innermost-first (Salvaged)
//! 4. Replace fraction tokens with decimals (Salvaged)
//! 5. Remove trailing commas (Salvaged)
//!
//! Salvaged values are best-effort. Deeply nested truncations can still be
//! closed at the wrong level; treat them as lower confidence.

use crate::models::StructuredResult;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use std::borrow::Cow;
use tracing::debug;

/// Fraction tokens emitted in place of numbers (`1/8`, `3/4`, ...)
static FRACTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d)\s*/\s*(\d)\b").expect("valid regex"));

/// Comma directly (modulo whitespace) before a closing bracket or brace
static TRAILING_COMMA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r",(\s*[}\]])").expect("valid regex"));

/// Recover a structured value from a raw response body
pub fn sanitize(raw_body: &str) -> StructuredResult {
    let trimmed = raw_body.trim();

    // Well-formed input passes through untouched
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return StructuredResult::Parsed { value };
    }

    let unfenced = strip_fences(trimmed);
    let start = match unfenced.find(['{', '[']) {
        Some(idx) => idx,
        None => {
            debug!("Sanitizer: no JSON structure in response");
            return StructuredResult::failed(
                "no JSON object or array found in response",
                raw_body,
            );
        }
    };
    let body = &unfenced[start..];

    let mut notes: Vec<String> = Vec::new();
    let mut candidate: String;
    let mut last_error: String;

    match find_matching_close(body) {
        Some(end) => {
            let span = &body[..=end];
            match serde_json::from_str::<Value>(span) {
                Ok(value) => return StructuredResult::Parsed { value },
                Err(e) => {
                    last_error = e.to_string();
                    candidate = span.to_string();
                }
            }
        }
        None => {
            let (repaired, note) = repair_truncation(body);
            debug!(note = %note, "Sanitizer: applied truncation repair");
            notes.push(note);
            match serde_json::from_str::<Value>(&repaired) {
                Ok(value) => return StructuredResult::Salvaged { value, notes },
                Err(e) => {
                    last_error = e.to_string();
                    candidate = repaired;
                }
            }
        }
    }

    if let Cow::Owned(normalized) = normalize_fractions(&candidate) {
        notes.push("replaced fraction tokens with decimals".to_string());
        match serde_json::from_str::<Value>(&normalized) {
            Ok(value) => return StructuredResult::Salvaged { value, notes },
            Err(e) => {
                last_error = e.to_string();
                candidate = normalized;
            }
        }
    }

    if let Cow::Owned(cleaned) = remove_trailing_commas(&candidate) {
        notes.push("removed trailing commas".to_string());
        match serde_json::from_str::<Value>(&cleaned) {
            Ok(value) => return StructuredResult::Salvaged { value, notes },
            Err(e) => last_error = e.to_string(),
        }
    }

    debug!(error = %last_error, "Sanitizer: all salvage steps failed");
    StructuredResult::failed(last_error, raw_body)
}

/// Content of the first code fence, or the input unchanged
///
/// An unclosed fence (truncated response) yields everything after it.
fn strip_fences(text: &str) -> &str {
    let Some(open) = text.find("```") else {
        return text;
    };
    let after = &text[open + 3..];
    let tag_len = after
        .bytes()
        .take_while(|b| b.is_ascii_alphanumeric())
        .count();
    let content = &after[tag_len..];
    match content.find("```") {
        Some(close) => content[..close].trim(),
        None => content.trim(),
    }
}

/// Byte index of the bracket closing the opener at `body[0]`
///
/// Brackets inside string literals are ignored. `None` means the structure
/// never closes (truncated output).
fn find_matching_close(body: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in body.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Close a truncated structure
///
/// First the line heuristic: a last line holding a key separator that does
/// not end in a quote, comma or closing bracket is a value cut off
/// mid-stream and is dropped. If that does not parse (single-line output,
/// cut inside a nested value), fall back to cutting after the last complete
/// element found by a structure-aware scan.
fn repair_truncation(body: &str) -> (String, String) {
    let (line_repaired, closed) = drop_incomplete_line(body);
    if serde_json::from_str::<Value>(&line_repaired).is_ok() {
        return (
            line_repaired,
            format!(
                "truncation repair: dropped incomplete trailing line, closed {} structure(s)",
                closed
            ),
        );
    }

    match last_complete_prefix(body) {
        Some((cut, closers)) => {
            let mut repaired = body[..cut].trim_end().to_string();
            repaired.extend(closers.iter());
            (
                repaired,
                format!(
                    "truncation repair: dropped incomplete trailing field, closed {} structure(s)",
                    closers.len()
                ),
            )
        }
        None => (
            line_repaired,
            format!("truncation repair: closed {} structure(s)", closed),
        ),
    }
}

fn drop_incomplete_line(body: &str) -> (String, usize) {
    let trimmed = body.trim_end();
    let (head, last) = match trimmed.rfind('\n') {
        Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
        None => ("", trimmed),
    };

    let last = last.trim();
    let complete = last.ends_with(['"', ',', '}', ']']);
    let mut text = if last.contains(':') && !complete {
        head.to_string()
    } else {
        trimmed.to_string()
    };

    if unescaped_quote_count(&text) % 2 == 1 {
        text.push('"');
    }
    close_open_structures(&text)
}

fn unescaped_quote_count(text: &str) -> usize {
    let mut count = 0;
    let mut escaped = false;
    for c in text.chars() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            count += 1;
        }
    }
    count
}

/// Append the closers for every unclosed opener, innermost first
fn close_open_structures(text: &str) -> (String, usize) {
    let mut out = text.trim_end().to_string();
    while out.ends_with(',') {
        out.pop();
        let len = out.trim_end().len();
        out.truncate(len);
    }

    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in out.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    let closed = stack.len();
    out.extend(stack.iter().rev());
    (out, closed)
}

struct Frame {
    close: char,
    expecting_key: bool,
}

fn pending_closers(stack: &[Frame]) -> Vec<char> {
    stack.iter().rev().map(|f| f.close).collect()
}

/// Longest prefix ending on a complete element, with the closers it needs
///
/// Cut points: after the outermost opener, before a separator comma, after
/// a closing bracket, after a complete value string. Numbers and literals
/// only count once a comma or bracket follows, since the last one may have
/// been cut short.
fn last_complete_prefix(body: &str) -> Option<(usize, Vec<char>)> {
    let mut stack: Vec<Frame> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut string_is_key = false;
    let mut last_cut: Option<(usize, Vec<char>)> = None;

    for (i, c) in body.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
                if !string_is_key && !stack.is_empty() {
                    last_cut = Some((i + 1, pending_closers(&stack)));
                }
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                string_is_key = stack.last().is_some_and(|f| f.expecting_key);
            }
            '{' | '[' => {
                stack.push(Frame {
                    close: if c == '{' { '}' } else { ']' },
                    expecting_key: c == '{',
                });
                if stack.len() == 1 {
                    last_cut = Some((i + 1, pending_closers(&stack)));
                }
            }
            '}' | ']' => {
                if stack.last().is_some_and(|f| f.close == c) {
                    stack.pop();
                }
                if stack.is_empty() {
                    break;
                }
                last_cut = Some((i + 1, pending_closers(&stack)));
            }
            ':' => {
                if let Some(frame) = stack.last_mut() {
                    frame.expecting_key = false;
                }
            }
            ',' if !stack.is_empty() => {
                last_cut = Some((i, pending_closers(&stack)));
                if let Some(frame) = stack.last_mut() {
                    frame.expecting_key = frame.close == '}';
                }
            }
            _ => {}
        }
    }

    last_cut
}

fn normalize_fractions(text: &str) -> Cow<'_, str> {
    if !FRACTION_RE.is_match(text) {
        return Cow::Borrowed(text);
    }

    let replaced = FRACTION_RE.replace_all(text, |caps: &Captures| {
        let decimal = match (&caps[1], &caps[2]) {
            ("1", "8") => Some("0.125"),
            ("1", "4") => Some("0.25"),
            ("3", "8") => Some("0.375"),
            ("1", "2") => Some("0.5"),
            ("5", "8") => Some("0.625"),
            ("3", "4") => Some("0.75"),
            ("7", "8") => Some("0.875"),
            _ => None,
        };
        decimal.map_or_else(|| caps[0].to_string(), str::to_string)
    });

    if replaced == text {
        Cow::Borrowed(text)
    } else {
        Cow::Owned(replaced.into_owned())
    }
}

fn remove_trailing_commas(text: &str) -> Cow<'_, str> {
    TRAILING_COMMA_RE.replace_all(text, "$1")
}
