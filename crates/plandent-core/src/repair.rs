//! Structural repair of truncated model output
//!
//! Repair is deliberately shallow: close whatever is still open (an
//! unterminated string, then brackets and braces in nesting order) and try a
//! strict parse once. No guessing of missing values.

use serde_json::Value;

use crate::error::UnrepairableJson;

/// Unwrap a ```json fenced block if the model wrapped its answer in one.
///
/// An opening fence without a closing one (truncated answer) is stripped too.
/// Backticks after the first `{` or `[` belong to the JSON and are left alone.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(fence_start) = trimmed.find("```") else {
        return trimmed;
    };
    if trimmed.find(['{', '[']).is_some_and(|open| open < fence_start) {
        return trimmed;
    }

    let after_fence = &trimmed[fence_start + 3..];
    // Skip the info string ("json") up to the end of the fence line
    let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(after_fence.len());
    let body = &after_fence[body_start..];
    // JSON strings cannot hold a raw newline, so a closing fence starts a line
    match body.find("\n```") {
        Some(end) => body[..end].trim(),
        None => body.trim().trim_end_matches("```").trim_end(),
    }
}

/// Strict parse after fence stripping.
pub fn parse_strict(text: &str) -> Result<Value, serde_json::Error> {
    serde_json::from_str(strip_code_fences(text))
}

/// Balance unclosed structures and parse, at most once.
///
/// Valid input parses unchanged. On failure the original buffer is attached
/// to the error for diagnostics.
pub fn repair(buffer: &str) -> Result<Value, UnrepairableJson> {
    let body = strip_code_fences(buffer);
    if let Ok(value) = serde_json::from_str(body) {
        return Ok(value);
    }

    let candidate = close_open_structures(body);
    serde_json::from_str(&candidate).map_err(|e| {
        tracing::debug!(
            buffer_len = buffer.len(),
            error = %e,
            "Repair attempt did not produce valid JSON"
        );
        UnrepairableJson {
            reason: e.to_string(),
            buffer: buffer.to_string(),
        }
    })
}

/// Append the minimum closing tokens for every structure still open.
fn close_open_structures(body: &str) -> String {
    // Drop any prose before the first structure
    let start = body.find(['{', '[']).unwrap_or(0);
    let body = &body[start..];

    let mut closers: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in body.chars() {
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
            '{' => closers.push('}'),
            '[' => closers.push(']'),
            '}' | ']' => {
                if closers.last() == Some(&c) {
                    closers.pop();
                }
            }
            _ => {}
        }
    }

    let mut repaired = body.to_string();
    if in_string {
        if escaped {
            repaired.pop();
        }
        repaired.push('"');
    }

    let trimmed_len = repaired.trim_end().len();
    repaired.truncate(trimmed_len);
    if repaired.ends_with(',') {
        repaired.pop();
    }

    repaired.extend(closers.iter().rev());
    repaired
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_valid_json_is_unchanged() {
        let text = r#"{"patient":"Jean","phases":[{"numero":1,"groupes_actes":[]}]}"#;
        let expected: Value = serde_json::from_str(text).unwrap();
        assert_eq!(repair(text).unwrap(), expected);
    }

    #[test]
    fn test_closes_nested_structures_in_order() {
        let repaired = repair(r#"{"phases":[{"numero":1,"groupes_actes":[{"type":"soins""#).unwrap();
        assert_eq!(
            repaired,
            json!({"phases": [{"numero": 1, "groupes_actes": [{"type": "soins"}]}]})
        );
    }

    #[test]
    fn test_closes_unterminated_string() {
        assert_eq!(repair(r#"{"patient":"Jea"#).unwrap(), json!({"patient": "Jea"}));
    }

    #[test]
    fn test_ignores_delimiters_inside_strings() {
        let repaired = repair(r#"{"note":"dents {11} [12]","a":[1,2"#).unwrap();
        assert_eq!(repaired, json!({"note": "dents {11} [12]", "a": [1, 2]}));
    }

    #[test]
    fn test_drops_trailing_comma() {
        assert_eq!(repair(r#"{"a":1,"#).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_unrepairable_keeps_original_buffer() {
        let buffer = r#"{"patient":"#;
        let err = repair(buffer).unwrap_err();
        assert_eq!(err.buffer, buffer);
        assert!(!err.reason.is_empty());
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```\nmerci"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n{\"a\":1"), "{\"a\":1");
        assert_eq!(strip_code_fences("  {\"a\":1}  "), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n{\"a\":1}```"), "{\"a\":1}");
    }

    #[test]
    fn test_backticks_inside_json_strings_are_kept() {
        let text = r#"{"patient":"Jean","resume_langage_clair":"voir ```note``` ci-dessous","phases":[]}"#;
        assert_eq!(strip_code_fences(text), text);
        assert_eq!(repair(text).unwrap()["resume_langage_clair"], "voir ```note``` ci-dessous");

        let fenced = "```json\n{\"note\":\"a ```b``` c\"}\n```";
        assert_eq!(repair(fenced).unwrap(), json!({"note": "a ```b``` c"}));
    }

    #[test]
    fn test_repair_handles_fenced_truncated_output() {
        let repaired = repair("```json\n{\"taches\":[{\"id\":\"T1\"").unwrap();
        assert_eq!(repaired, json!({"taches": [{"id": "T1"}]}));
    }
}
