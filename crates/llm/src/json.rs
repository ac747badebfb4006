//! Salvaging JSON from model output.
//!
//! Models wrap payloads in Markdown fences, prepend commentary, leave
//! trailing commas, or quote with single quotes. `parse_lenient` works
//! through those failure modes in order: direct parse, fence/brace
//! extraction, then repair.

use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::OnceLock;

fn fence_pattern() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| Regex::new(r"```(?:json)?\s*([\s\S]*?)```").unwrap())
}

/// Extract the most plausible JSON payload from a free-form response.
///
/// Order of preference: first fenced block, then the outermost
/// `{…}` object, then the outermost `[…]` array.
pub fn extract_payload(response: &str) -> Option<String> {
    let trimmed = response.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(captures) = fence_pattern().captures(trimmed) {
        let inner = captures[1].trim();
        if !inner.is_empty() {
            return Some(inner.to_string());
        }
    }

    // Whichever bracket opens first wins, so a prose-wrapped array is
    // not truncated to its first object.
    let object_span = trimmed.find('{').zip(trimmed.rfind('}'));
    let array_span = trimmed.find('[').zip(trimmed.rfind(']'));
    let span = match (object_span, array_span) {
        (Some(object), Some(array)) => Some(if array.0 < object.0 { array } else { object }),
        (Some(object), None) => Some(object),
        (None, Some(array)) => Some(array),
        (None, None) => None,
    };

    span.filter(|(start, end)| end > start)
        .map(|(start, end)| trimmed[start..=end].to_string())
}

/// Best-effort structural repair: trailing commas before a closing
/// bracket are removed and single-quoted strings become double-quoted.
/// The output is not guaranteed to parse; callers try and fall back.
pub fn repair(payload: &str) -> String {
    let mut out = String::with_capacity(payload.len());
    let mut chars = payload.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(ch) = chars.next() {
        if in_string {
            match ch {
                '\\' if !escaped => {
                    escaped = true;
                    out.push(ch);
                    continue;
                }
                '"' if !escaped => in_string = false,
                _ => {}
            }
            escaped = false;
            out.push(ch);
            continue;
        }

        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            '\'' => {
                // Re-quote a single-quoted string.
                out.push('"');
                for inner in chars.by_ref() {
                    if inner == '\'' {
                        break;
                    }
                    if inner == '"' {
                        out.push('\\');
                    }
                    out.push(inner);
                }
                out.push('"');
            }
            ',' => {
                // Drop the comma when the next non-space char closes a scope.
                let mut lookahead = chars.clone();
                let next = loop {
                    match lookahead.next() {
                        Some(c) if c.is_whitespace() => continue,
                        other => break other,
                    }
                };
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(ch);
                }
            }
            _ => out.push(ch),
        }
    }

    out
}

/// Parse a typed value from raw model output, tolerating fences,
/// leading commentary, trailing commas, and single quotes.
pub fn parse_lenient<T: DeserializeOwned>(response: &str) -> Option<T> {
    if let Ok(value) = serde_json::from_str::<T>(response.trim()) {
        return Some(value);
    }

    let payload = extract_payload(response)?;
    if let Ok(value) = serde_json::from_str::<T>(&payload) {
        return Some(value);
    }

    serde_json::from_str::<T>(&repair(&payload)).ok()
}

/// Like [`parse_lenient`] but untyped.
pub fn parse_lenient_value(response: &str) -> Option<Value> {
    parse_lenient::<Value>(response)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{extract_payload, parse_lenient_value, repair};

    #[test]
    fn extracts_fenced_block() {
        let response = "Sure, here you go:\n```json\n{\"a\": 1}\n```\nanything else?";
        assert_eq!(extract_payload(response).as_deref(), Some("{\"a\": 1}"));
    }

    #[test]
    fn extracts_outermost_braces_without_fence() {
        let response = "the answer is {\"a\": {\"b\": 2}} thanks";
        assert_eq!(
            extract_payload(response).as_deref(),
            Some("{\"a\": {\"b\": 2}}")
        );
    }

    #[test]
    fn prose_wrapped_array_is_extracted_whole() {
        let response = "here are both: [{\"a\": 1}, {\"a\": 2}] done";
        let payload = extract_payload(response).unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value.as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn repairs_trailing_commas_and_single_quotes() {
        let broken = "{'items': [1, 2, 3,], 'name': 'mu', }";
        let fixed = repair(broken);
        let value: serde_json::Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(value["items"], json!([1, 2, 3]));
        assert_eq!(value["name"], json!("mu"));
    }

    #[test]
    fn repair_leaves_commas_inside_strings_alone() {
        let payload = r#"{"text": "a, b, }"}"#;
        let value: serde_json::Value = serde_json::from_str(&repair(payload)).unwrap();
        assert_eq!(value["text"], json!("a, b, }"));
    }

    #[test]
    fn lenient_parse_handles_prose_wrapped_json() {
        let response = "I think this works:\n```\n{\"value_score\": 0.8,}\n```";
        let value = parse_lenient_value(response).unwrap();
        assert_eq!(value["value_score"], json!(0.8));
    }

    #[test]
    fn lenient_parse_rejects_hopeless_input() {
        assert!(parse_lenient_value("no json here at all").is_none());
    }
}
