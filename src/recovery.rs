//! Best-effort recovery of structured payloads from raw model output.
//!
//! The interviewer model is instructed to reply with a JSON object, but real
//! output is routinely wrapped in markdown fences, carries trailing commas,
//! mixes quote styles, or arrives truncated. Recovery runs a fixed ladder of
//! strategies, stopping at the first success:
//! 1. Candidate extraction (last fenced block, or the whole brace-delimited text)
//! 2. Strict parse
//! 3. Syntax repair, then strict parse
//! 4. Lenient grammar (json5) on the original candidate
//! 5. Lenient grammar on the repaired candidate with unbalanced delimiters closed
//! 6. Escaping-aware single-field extraction against the raw text
//! 7. Caller fallback, or the raw text unchanged
//!
//! Recovery is total: no tier throws outward.

use regex_lite::Regex;
use serde_json::{Map, Value};

use crate::progress::{objective_map_from_value, ObjectiveMap};

/// Field carrying the text shown to the candidate.
pub const ANSWER_FIELD: &str = "response";
/// Field carrying the inline objective map, when the model reports one.
pub const OBJECTIVES_FIELD: &str = "currentObjectives";

const FENCE: &str = "```";
const JSON_FENCE: &str = "```json";

/// One turn's worth of recovered structure.
#[derive(Debug, Clone)]
pub struct RecoveredTurn {
    pub answer_text: String,
    pub objectives: Option<ObjectiveMap>,
    pub auxiliary: Map<String, Value>,
}

/// Recover a single named field from raw model output.
///
/// Returns the field value when any tier succeeds, the caller's fallback when
/// the field is absent or empty, and the raw text when no fallback was given.
pub fn recover(raw: &str, field: &str, fallback: Option<&str>) -> String {
    if raw.trim().is_empty() {
        return fallback.unwrap_or(raw).to_string();
    }
    // Plain conversational replies must not be mangled by the repair
    // heuristics.
    if !looks_structured(raw) {
        return raw.to_string();
    }

    if let Some(doc) = parse_lenient(raw) {
        if let Some(value) = doc.get(field) {
            match value {
                Value::String(s) if !s.trim().is_empty() => return s.clone(),
                // Empty-after-trim counts as absent; the fallback wins.
                Value::String(_) | Value::Null => {}
                other => return other.to_string(),
            }
        }
    }

    if let Some(value) = extract_field(raw, field) {
        return value;
    }

    match fallback {
        Some(text) => text.to_string(),
        None => raw.to_string(),
    }
}

/// Recover the full structured record for one turn: answer text, inline
/// objective map (if any), and whatever auxiliary fields the model added.
pub fn recover_structured(raw: &str) -> RecoveredTurn {
    if raw.trim().is_empty() || !looks_structured(raw) {
        return RecoveredTurn {
            answer_text: raw.to_string(),
            objectives: None,
            auxiliary: Map::new(),
        };
    }

    if let Some(Value::Object(doc)) = parse_lenient(raw) {
        let answer_text = match doc.get(ANSWER_FIELD) {
            Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
            Some(Value::String(_)) | Some(Value::Null) | None => extract_field(raw, ANSWER_FIELD)
                .unwrap_or_else(|| raw.to_string()),
            Some(other) => other.to_string(),
        };
        let objectives = doc.get(OBJECTIVES_FIELD).and_then(objective_map_from_value);
        let auxiliary: Map<String, Value> = doc
            .into_iter()
            .filter(|(key, _)| key != ANSWER_FIELD && key != OBJECTIVES_FIELD)
            .collect();
        return RecoveredTurn {
            answer_text,
            objectives,
            auxiliary,
        };
    }

    // Every full-document tier failed; field extraction against the raw text
    // is the last structured hope.
    let answer_text = extract_field(raw, ANSWER_FIELD).unwrap_or_else(|| raw.to_string());
    RecoveredTurn {
        answer_text,
        objectives: None,
        auxiliary: Map::new(),
    }
}

/// Stringify a payload that is not plain text. String values pass through
/// untouched; anything else is rendered without any parsing attempt.
pub fn coerce_raw_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Run the full-document parse ladder (tiers 1-5). Returns `None` only when
/// no candidate could be extracted or every tier failed.
pub fn parse_lenient(raw: &str) -> Option<Value> {
    let had_fence = raw.contains(FENCE);
    let candidate = extract_candidate(raw)?;
    let had_trailing_comma = strip_trailing_commas(&candidate) != candidate;

    match serde_json::from_str::<Value>(&candidate) {
        Ok(doc) => return Some(doc),
        Err(e) => {
            tracing::debug!(
                had_fence,
                had_trailing_comma,
                preview = %preview(&candidate),
                "strict parse failed: {e}"
            );
        }
    }

    let repaired = repair_candidate(&candidate);
    match serde_json::from_str::<Value>(&repaired) {
        Ok(doc) => return Some(doc),
        Err(e) => {
            tracing::debug!(
                had_fence,
                had_trailing_comma,
                preview = %preview(&repaired),
                "repaired parse failed: {e}"
            );
        }
    }

    match json5::from_str::<Value>(&candidate) {
        Ok(doc) => return Some(doc),
        Err(e) => {
            tracing::debug!(
                had_fence,
                had_trailing_comma,
                preview = %preview(&candidate),
                "lenient parse failed: {e}"
            );
        }
    }

    let completed = close_unbalanced(&repaired);
    match json5::from_str::<Value>(&completed) {
        Ok(doc) => Some(doc),
        Err(e) => {
            tracing::warn!(
                had_fence,
                had_trailing_comma,
                preview = %preview(raw),
                "all document parse tiers failed: {e}"
            );
            None
        }
    }
}

/// Escaping-aware extraction of `"<field>": "<value>"` from otherwise
/// unparseable text. An empty-after-trim value counts as absent.
pub fn extract_field(raw: &str, field: &str) -> Option<String> {
    let pattern = format!(r#""{}"\s*:\s*"((?:[^"\\]|\\.)*)""#, escape_for_regex(field));
    let re = Regex::new(&pattern).ok()?;
    let captured = re.captures(raw)?.get(1)?.as_str();
    let value = unescape_fragment(captured);
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Superficial shape check: anything without a fence marker that is not
/// brace- or bracket-delimited is treated as plain prose.
fn looks_structured(raw: &str) -> bool {
    if raw.contains(FENCE) {
        return true;
    }
    let trimmed = raw.trim();
    trimmed.starts_with('{')
        || trimmed.starts_with('[')
        || trimmed.ends_with('}')
        || trimmed.ends_with(']')
}

/// Pull the candidate document out of the raw text. Models sometimes emit
/// explanatory prose before the payload, so the *last* json fence wins.
fn extract_candidate(raw: &str) -> Option<String> {
    if let Some(start) = raw.rfind(JSON_FENCE) {
        let body = &raw[start + JSON_FENCE.len()..];
        return Some(match body.find(FENCE) {
            Some(end) => body[..end].trim().to_string(),
            // Unterminated fence: the payload was cut off mid-stream.
            None => body.trim().to_string(),
        });
    }

    if let Some(start) = raw.find(FENCE) {
        let body = &raw[start + FENCE.len()..];
        let body = match body.find('\n') {
            Some(nl) => &body[nl + 1..],
            None => body,
        };
        if let Some(end) = body.find(FENCE) {
            let content = body[..end].trim();
            if content.starts_with('{') || content.starts_with('[') {
                return Some(content.to_string());
            }
        }
    }

    let trimmed = raw.trim();
    if (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'))
    {
        return Some(trimmed.to_string());
    }
    // Truncated documents open a brace but never close it; let the later
    // tiers try to complete them.
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Some(trimmed.to_string());
    }
    None
}

/// Apply the syntax repairs in one pass: quote style, bare keys, raw
/// newlines inside strings, trailing commas.
fn repair_candidate(candidate: &str) -> String {
    let step = convert_single_quotes(candidate);
    let step = quote_bare_keys(&step);
    let step = escape_raw_newlines(&step);
    strip_trailing_commas(&step)
}

/// Convert single-quoted strings (keys and values) to double-quoted ones,
/// escaping any embedded double quotes.
fn convert_single_quotes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_double = false;
    let mut in_single = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_double {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_double = false;
            }
            continue;
        }
        if in_single {
            if escaped {
                // \' becomes a plain apostrophe; everything else keeps its
                // backslash.
                if c == '\'' {
                    out.push('\'');
                } else {
                    out.push('\\');
                    out.push(c);
                }
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '\'' {
                out.push('"');
                in_single = false;
            } else if c == '"' {
                out.push_str("\\\"");
            } else {
                out.push(c);
            }
            continue;
        }
        match c {
            '"' => {
                in_double = true;
                out.push(c);
            }
            '\'' => {
                in_single = true;
                out.push('"');
            }
            _ => out.push(c),
        }
    }
    out
}

/// Quote bare object keys: `{response: 1}` becomes `{"response": 1}`.
/// Only identifiers directly following `{` or `,` and followed by `:` are
/// touched, so string contents are safe.
fn quote_bare_keys(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 16);
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
                i += 1;
            }
            '{' | ',' => {
                out.push(c);
                i += 1;
                // Emit any whitespace, then test for a bare identifier key.
                while i < chars.len() && chars[i].is_whitespace() {
                    out.push(chars[i]);
                    i += 1;
                }
                let ident_start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let ident_end = i;
                let mut lookahead = i;
                while lookahead < chars.len() && chars[lookahead].is_whitespace() {
                    lookahead += 1;
                }
                let is_key = ident_end > ident_start
                    && chars[ident_start].is_ascii_alphabetic()
                    && lookahead < chars.len()
                    && chars[lookahead] == ':';
                if is_key {
                    out.push('"');
                    out.extend(&chars[ident_start..ident_end]);
                    out.push('"');
                } else {
                    out.extend(&chars[ident_start..ident_end]);
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Escape raw control characters inside string values so the strict parser
/// accepts them. The decoded value keeps the original newline.
fn escape_raw_newlines(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;

    for c in input.chars() {
        if in_string {
            if escaped {
                out.push(c);
                escaped = false;
                continue;
            }
            match c {
                '\\' => {
                    out.push(c);
                    escaped = true;
                }
                '"' => {
                    out.push(c);
                    in_string = false;
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                _ => out.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
        }
    }
    out
}

/// Remove trailing commas before a closing brace or bracket.
fn strip_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        if c == '"' {
            in_string = true;
            out.push(c);
            continue;
        }
        if c == ',' {
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Close unterminated strings and unbalanced braces/brackets so a truncated
/// document still parses as a prefix of itself.
fn close_unbalanced(input: &str) -> String {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in input.chars() {
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
                stack.pop();
            }
            _ => {}
        }
    }

    let mut out = input.trim_end().to_string();
    if in_string {
        out.push('"');
    }
    if out.trim_end().ends_with(':') {
        out.push_str(" null");
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

/// Decode the escapes the extraction regex may have captured.
fn unescape_fragment(fragment: &str) -> String {
    let mut out = String::with_capacity(fragment.len());
    let mut chars = fragment.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('b') => out.push('\u{0008}'),
            Some('f') => out.push('\u{000C}'),
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    Some(decoded) => out.push(decoded),
                    None => {
                        out.push_str("\\u");
                        out.push_str(&hex);
                    }
                }
            }
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

fn escape_for_regex(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        if !c.is_ascii_alphanumeric() && c != '_' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn preview(text: &str) -> String {
    text.chars().take(120).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ObjectiveStatus;

    #[test]
    fn strict_input_returns_field_unmodified() {
        let raw = r#"{"response": "Tell me about your last role.", "mood": "neutral"}"#;
        assert_eq!(
            recover(raw, "response", None),
            "Tell me about your last role."
        );
    }

    #[test]
    fn plain_prose_passes_through_verbatim() {
        let raw = "Thanks! Could you expand on that a little?";
        assert_eq!(recover(raw, "response", Some("fallback")), raw);
    }

    #[test]
    fn empty_input_returns_fallback() {
        assert_eq!(recover("", "response", Some("sorry")), "sorry");
        assert_eq!(recover("", "response", None), "");
    }

    #[test]
    fn repairs_trailing_comma() {
        assert_eq!(recover(r#"{"response": "ok",}"#, "response", None), "ok");
    }

    #[test]
    fn extracts_fenced_block() {
        let raw = "```json\n{\"response\":\"x\"}\n```";
        assert_eq!(recover(raw, "response", None), "x");
    }

    #[test]
    fn last_fenced_block_is_authoritative() {
        let raw = "Here is a draft:\n```json\n{\"response\":\"draft\"}\n```\nFinal:\n```json\n{\"response\":\"final\"}\n```";
        assert_eq!(recover(raw, "response", None), "final");
    }

    #[test]
    fn repairs_single_quotes() {
        assert_eq!(
            recover(r#"{'response': 'single'}"#, "response", None),
            "single"
        );
    }

    #[test]
    fn repairs_bare_keys() {
        assert_eq!(
            recover(r#"{response: "no quotes"}"#, "response", None),
            "no quotes"
        );
    }

    #[test]
    fn preserves_embedded_raw_newline() {
        let raw = "{\"response\": \"line one\nline two\"}";
        assert_eq!(recover(raw, "response", None), "line one\nline two");
    }

    #[test]
    fn completes_truncated_document() {
        let raw = r#"{"response": "the stream cut off he"#;
        assert_eq!(recover(raw, "response", None), "the stream cut off he");
    }

    #[test]
    fn fallback_wins_over_missing_field() {
        let raw = r#"{"other": "value"}"#;
        assert_eq!(recover(raw, "response", Some("sorry")), "sorry");
    }

    #[test]
    fn fallback_wins_over_empty_field() {
        let raw = r#"{"response": "   "}"#;
        assert_eq!(recover(raw, "response", Some("sorry")), "sorry");
    }

    #[test]
    fn field_extraction_survives_broken_document() {
        // The document around the field is irreparable, the field is not.
        let raw = r#"{{{ net rubbish "response": "still here" %% }"#;
        assert_eq!(recover(raw, "response", None), "still here");
    }

    #[test]
    fn field_extraction_decodes_escapes() {
        let raw = r#"broken { "response": "a \"quoted\" word\nnext" ]"#;
        assert_eq!(recover(raw, "response", None), "a \"quoted\" word\nnext");
    }

    #[test]
    fn total_recovery_on_garbage() {
        for raw in ["", "\u{0}\u{1}\u{2}", "{{{{", "]", "``` ???", "{:::}"] {
            let out = recover(raw, "response", Some("fallback"));
            assert!(!out.is_empty() || raw.is_empty());
        }
    }

    #[test]
    fn non_string_field_is_stringified() {
        let raw = r#"{"response": 42}"#;
        assert_eq!(recover(raw, "response", None), "42");
    }

    #[test]
    fn coerce_passes_strings_and_stringifies_the_rest() {
        assert_eq!(coerce_raw_text(&Value::String("hi".into())), "hi");
        assert_eq!(
            coerce_raw_text(&serde_json::json!({"a": 1})),
            "{\"a\":1}"
        );
    }

    #[test]
    fn structured_recovery_splits_answer_objectives_auxiliary() {
        let raw = r#"```json
{
  "response": "Great, let's move on.",
  "currentObjectives": {
    "objective01": {"status": "done", "count": 3, "target": 3, "guidance": ""},
    "objective02": {"status": "current", "count": 1, "target": 2, "guidance": "dig deeper"}
  },
  "reasoning": "first objective satisfied",
}
```"#;
        let turn = recover_structured(raw);
        assert_eq!(turn.answer_text, "Great, let's move on.");
        let objectives = turn.objectives.expect("objectives recovered");
        assert_eq!(
            objectives["objective01"].status,
            ObjectiveStatus::Done
        );
        assert_eq!(objectives["objective02"].count, 1);
        assert_eq!(turn.auxiliary.get("reasoning").unwrap(), "first objective satisfied");
    }

    #[test]
    fn structured_recovery_of_prose_keeps_text() {
        let turn = recover_structured("Nice to meet you!");
        assert_eq!(turn.answer_text, "Nice to meet you!");
        assert!(turn.objectives.is_none());
        assert!(turn.auxiliary.is_empty());
    }

    #[test]
    fn structured_recovery_falls_back_to_field_extraction() {
        let raw = r#"{ "response": "salvaged", "currentObjectives": { broken"#;
        let turn = recover_structured(raw);
        assert_eq!(turn.answer_text, "salvaged");
    }
}
