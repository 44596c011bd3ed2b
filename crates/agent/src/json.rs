//! Structured-output extraction from model text.
//!
//! Models wrap JSON in prose, fences, or emit near-JSON (trailing commas,
//! single quotes, bare keys). `safe_parse_json` tries a fixed sequence of
//! strategies and only ever yields a JSON object; it never panics on any
//! input.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// How many `{` positions are tried before giving up on embedded objects.
const MAX_OBJECT_CANDIDATES: usize = 16;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("model output is empty")]
    Empty,
    #[error("no JSON object found in model output ({length} chars)")]
    NoObject { length: usize },
}

/// Extracts the first JSON object from `text`.
///
/// Strategies, in order: an embedded balanced `{...}` block, the same block
/// after repairing common model mistakes, the whole text, then the contents
/// of a fenced code block.
pub fn safe_parse_json(text: &str) -> Result<Value, ParseError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Empty);
    }

    let candidates = balanced_objects(trimmed);
    if let Some(value) = candidates.iter().find_map(|candidate| parse_object(candidate)) {
        return Ok(value);
    }

    if let Some(value) = candidates.iter().find_map(|candidate| parse_object(&repair(candidate)))
    {
        return Ok(value);
    }

    if let Some(value) = parse_object(trimmed).or_else(|| parse_object(&repair(trimmed))) {
        return Ok(value);
    }

    if let Some(block) = fenced_block(trimmed) {
        if let Some(value) = parse_object(block).or_else(|| parse_object(&repair(block))) {
            return Ok(value);
        }
    }

    Err(ParseError::NoObject { length: trimmed.chars().count() })
}

fn parse_object(candidate: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(candidate.trim()) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

/// Every balanced `{...}` span, scanning left to right, skipping braces that
/// appear inside double-quoted strings.
fn balanced_objects(text: &str) -> Vec<&str> {
    text.char_indices()
        .filter(|(_, ch)| *ch == '{')
        .take(MAX_OBJECT_CANDIDATES)
        .filter_map(|(start, _)| balanced_from(text, start))
        .collect()
}

fn balanced_from(text: &str, start: usize) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    let end = start + offset + ch.len_utf8();
                    return Some(&text[start..end]);
                }
            }
            _ => {}
        }
    }

    None
}

fn fenced_block(text: &str) -> Option<&str> {
    fence_pattern()?.captures(text)?.get(1).map(|capture| capture.as_str())
}

/// Trailing commas, single-quoted strings and bare object keys.
fn repair(candidate: &str) -> String {
    let Some((trailing_commas, bare_keys)) = repair_patterns() else {
        return candidate.to_string();
    };

    let without_commas = trailing_commas.replace_all(candidate, "$1");
    let quoted = if without_commas.contains('"') {
        without_commas.into_owned()
    } else {
        without_commas.replace('\'', "\"")
    };
    bare_keys.replace_all(&quoted, "$1\"$2\":").into_owned()
}

fn fence_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"```(?:json)?\s*\n?([\s\S]*?)\n?```").ok()).as_ref()
}

fn repair_patterns() -> Option<(&'static Regex, &'static Regex)> {
    static PATTERNS: OnceLock<Option<(Regex, Regex)>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            let trailing_commas = Regex::new(r",\s*([}\]])").ok()?;
            let bare_keys = Regex::new(r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:"#).ok()?;
            Some((trailing_commas, bare_keys))
        })
        .as_ref()
        .map(|(trailing_commas, bare_keys)| (trailing_commas, bare_keys))
}
