// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde_json::Value;
use tracing::warn;

/// Parse a raw tool-argument string into a JSON value, repairing common
/// model-side damage before giving up.
///
/// Always resolves to a value: an empty buffer becomes `{}`, and a buffer
/// that defeats every repair strategy also becomes `{}` (with a warning) so
/// the tool call can still be dispatched and rejected by schema validation
/// rather than corrupting the conversation.
pub fn parse_arguments(tool_name: &str, raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(parse_err) => match repair_arguments(raw) {
            Some(v) => {
                warn!(tool_name, "repaired damaged JSON arguments from model");
                v
            }
            None => {
                warn!(
                    tool_name,
                    error = %parse_err,
                    "tool call arguments are unparseable JSON; substituting {{}}"
                );
                Value::Object(Default::default())
            }
        },
    }
}

/// Attempt to recover a parseable value from damaged argument JSON.
///
/// One sanitizing scan fixes bad escape sequences and records what is still
/// open; the recorded state then closes truncated output, and a final pass
/// re-inserts commas the model dropped between members.
fn repair_arguments(raw: &str) -> Option<Value> {
    let scan = sanitize_scan(raw);
    if let Ok(v) = serde_json::from_str(&scan.text) {
        return Some(v);
    }

    // Truncated output: terminate the dangling string and close every
    // container the scan saw opened but never closed.
    let mut completed = scan.text.clone();
    if scan.in_string {
        completed.push('"');
    }
    for opener in scan.open.iter().rev() {
        completed.push(if *opener == '{' { '}' } else { ']' });
    }
    if let Ok(v) = serde_json::from_str(&completed) {
        return Some(v);
    }

    serde_json::from_str(&insert_missing_commas(&completed)).ok()
}

struct ScanOutcome {
    text: String,
    /// Containers opened but not closed, in nesting order.
    open: Vec<char>,
    /// The input ended inside a string literal.
    in_string: bool,
}

/// Single pass over the raw text: escape sequences JSON does not allow
/// (`\c`, `\(`, a lone trailing `\`) get their backslash doubled into a
/// literal one, and container/string state is tracked for the truncation
/// repair.
fn sanitize_scan(raw: &str) -> ScanOutcome {
    let mut text = String::with_capacity(raw.len() + 8);
    let mut open = Vec::new();
    let mut in_string = false;
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => match chars.peek() {
                    Some('"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') => {
                        text.push('\\');
                        text.push(chars.next().unwrap());
                    }
                    // Invalid escape: keep the next char, make the
                    // backslash literal.
                    _ => text.push_str("\\\\"),
                },
                '"' => {
                    in_string = false;
                    text.push('"');
                }
                _ => text.push(c),
            }
        } else {
            match c {
                '"' => {
                    in_string = true;
                    text.push('"');
                }
                '{' | '[' => {
                    open.push(c);
                    text.push(c);
                }
                '}' | ']' => {
                    open.pop();
                    text.push(c);
                }
                _ => text.push(c),
            }
        }
    }
    ScanOutcome { text, open, in_string }
}

/// Insert a comma wherever a new string opens right after a finished value
/// (`"a": 1 "b": 2`, `"x" "y": …`) with only whitespace in between.
fn insert_missing_commas(json: &str) -> String {
    let mut out = String::with_capacity(json.len() + 8);
    let mut in_string = false;
    let mut escaped = false;
    // Last significant (non-whitespace) char seen outside a string.
    let mut last = ' ';

    for c in json.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
                last = '"';
            }
            continue;
        }
        match c {
            '"' => {
                if matches!(last, '"' | '}' | ']') || last.is_ascii_alphanumeric() {
                    out.push_str(", ");
                }
                in_string = true;
                out.push('"');
            }
            c if c.is_whitespace() => out.push(c),
            _ => {
                last = c;
                out.push(c);
            }
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_arguments_become_empty_object() {
        assert_eq!(parse_arguments("t", ""), serde_json::json!({}));
        assert_eq!(parse_arguments("t", "   "), serde_json::json!({}));
    }

    #[test]
    fn well_formed_json_passes_through() {
        let v = parse_arguments("t", r#"{"path": "src/main.rs", "limit": 5}"#);
        assert_eq!(v["path"], "src/main.rs");
        assert_eq!(v["limit"], 5);
    }

    #[test]
    fn invalid_escape_becomes_literal_backslash() {
        let v = parse_arguments("t", r#"{"pattern": "\d+"}"#);
        assert_eq!(v["pattern"], "\\d+");
    }

    #[test]
    fn valid_escapes_are_untouched() {
        let v = parse_arguments("t", r#"{"a": "line\nbreak \"quoted\""}"#);
        assert_eq!(v["a"], "line\nbreak \"quoted\"");
    }

    #[test]
    fn truncated_string_and_object_are_closed() {
        let v = repair_arguments(r#"{"command": "ls"#).unwrap();
        assert_eq!(v["command"], "ls");
    }

    #[test]
    fn truncated_nested_containers_are_closed_in_order() {
        let v = repair_arguments(r#"{"files": ["a.rs", "b.rs"#).unwrap();
        assert_eq!(v["files"][1], "b.rs");
    }

    #[test]
    fn missing_comma_between_members_is_inserted() {
        let v = parse_arguments("t", r#"{"a": "x" "b": "y"}"#);
        assert_eq!(v["a"], "x");
        assert_eq!(v["b"], "y");
    }

    #[test]
    fn missing_comma_after_number_is_inserted() {
        let v = parse_arguments("t", r#"{"a": 1 "b": 2}"#);
        assert_eq!(v["b"], 2);
    }

    #[test]
    fn trailing_lone_backslash_is_made_literal() {
        let v = repair_arguments(r#"{"path": "C:\"#).unwrap();
        assert_eq!(v["path"], "C:\\");
    }

    #[test]
    fn hopeless_input_falls_back_to_empty_object() {
        let v = parse_arguments("t", "not json at all ][");
        assert_eq!(v, serde_json::json!({}));
    }
}
