//! Value shrinking used by compaction
//!
//! Every helper returns a value whose serialized size is at most the size of
//! its input, so a compacted context can never grow.

use serde_json::{Map, Value};

use super::{estimate_tokens, CHARS_PER_TOKEN};

/// Appended to text cut down to its front slice
pub const TRUNCATION_MARKER: &str = "\n[...truncated...]";

/// Placed between the head and tail windows of an oversized code file
pub const MIDDLE_MARKER: &str = "\n# [...middle truncated...]\n";

/// Per-file token allotment for code files
pub const CODE_FILE_MAX_TOKENS: usize = 2000;

/// Lines kept at each end of an oversized code file
const CODE_WINDOW_LINES: usize = 50;

/// Sub-fields kept from a test outcome
pub const TEST_RESULT_FIELDS: &[&str] = &[
    "passed",
    "error_message",
    "error_type",
    "failed_tests",
    "total",
];

/// Characters of the test error message kept, including the ellipsis
const TEST_ERROR_MAX_CHARS: usize = 500;

pub(crate) fn json_len(value: &Value) -> usize {
    value.to_string().chars().count()
}

/// Tokens a field value contributes: a string's own text, otherwise its JSON
pub fn value_tokens(value: &Value) -> usize {
    match value {
        Value::String(text) => estimate_tokens(text),
        other => estimate_tokens(&other.to_string()),
    }
}

/// Keep `candidate` only if it serializes no larger than `original`
fn no_larger(original: &Value, candidate: Value) -> Value {
    if json_len(&candidate) <= json_len(original) {
        candidate
    } else {
        original.clone()
    }
}

/// Front slice of `text` plus the truncation marker, within `max_tokens`
pub fn truncate_text(text: &str, max_tokens: usize) -> String {
    let max_chars = max_tokens.saturating_mul(CHARS_PER_TOKEN);
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(TRUNCATION_MARKER.chars().count());
    let mut truncated: String = text.chars().take(keep).collect();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

/// Shrink an arbitrary field value to roughly `max_tokens`
///
/// Strings keep their front slice. Arrays keep their most recent elements.
/// Objects keep their leading entries.
pub fn shrink_value(value: &Value, max_tokens: usize) -> Value {
    if value_tokens(value) <= max_tokens {
        return value.clone();
    }

    let candidate = match value {
        Value::String(text) => Value::String(truncate_text(text, max_tokens)),
        Value::Array(items) => {
            let mut kept = Vec::new();
            for item in items.iter().rev() {
                kept.insert(0, item.clone());
                if value_tokens(&Value::Array(kept.clone())) > max_tokens {
                    kept.remove(0);
                    break;
                }
            }
            Value::Array(kept)
        }
        Value::Object(entries) => {
            let mut kept = Map::new();
            for (key, item) in entries {
                kept.insert(key.clone(), item.clone());
                if value_tokens(&Value::Object(kept.clone())) > max_tokens {
                    kept.shift_remove(key);
                    break;
                }
            }
            Value::Object(kept)
        }
        other => other.clone(),
    };

    no_larger(value, candidate)
}

/// Head and tail of one oversized file
pub fn truncate_code(content: &str, max_tokens: usize) -> String {
    let max_chars = max_tokens.saturating_mul(CHARS_PER_TOKEN);
    if content.chars().count() <= max_chars {
        return content.to_string();
    }

    let lines: Vec<&str> = content.split('\n').collect();
    if lines.len() > CODE_WINDOW_LINES * 2 {
        let head = lines[..CODE_WINDOW_LINES].join("\n");
        let tail = lines[lines.len() - CODE_WINDOW_LINES..].join("\n");
        let windowed = format!("{}{}{}", head, MIDDLE_MARKER, tail);
        if windowed.chars().count() <= max_chars {
            return windowed;
        }
    }

    // Leave room for the marker plus its escaped newlines
    let budget = max_chars.saturating_sub(MIDDLE_MARKER.chars().count() + 2);
    let head_len = budget / 2;
    let tail_len = budget - head_len;
    let chars: Vec<char> = content.chars().collect();
    let head: String = chars[..head_len].iter().collect();
    let tail: String = chars[chars.len() - tail_len..].iter().collect();
    format!("{}{}{}", head, MIDDLE_MARKER, tail)
}

/// Apply the per-file cap to a `{filename: content}` object
pub fn compact_code_files(value: &Value) -> Value {
    let Value::Object(files) = value else {
        return value.clone();
    };

    let compacted: Map<String, Value> = files
        .iter()
        .map(|(name, content)| {
            let shrunk = match content {
                Value::String(text) => no_larger(
                    content,
                    Value::String(truncate_code(text, CODE_FILE_MAX_TOKENS)),
                ),
                other => other.clone(),
            };
            (name.clone(), shrunk)
        })
        .collect();

    Value::Object(compacted)
}

/// Keep only the allow-listed sub-fields of a test outcome
pub fn compact_test_results(value: &Value) -> Value {
    let Value::Object(outcome) = value else {
        return value.clone();
    };

    let mut kept = Map::new();
    for field in TEST_RESULT_FIELDS {
        if let Some(item) = outcome.get(*field) {
            let item = match (*field, item) {
                ("error_message", Value::String(message))
                    if message.chars().count() > TEST_ERROR_MAX_CHARS =>
                {
                    let mut short: String = message.chars().take(TEST_ERROR_MAX_CHARS - 3).collect();
                    short.push_str("...");
                    Value::String(short)
                }
                _ => item.clone(),
            };
            kept.insert((*field).to_string(), item);
        }
    }

    no_larger(value, Value::Object(kept))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truncate_text_fits_cap() {
        let text = "a".repeat(1000);
        let truncated = truncate_text(&text, 100);
        assert!(truncated.ends_with(TRUNCATION_MARKER));
        assert!(truncated.chars().count() <= 400);
        assert!(truncated.starts_with("aaaa"));

        assert_eq!(truncate_text("short", 100), "short");
    }

    #[test]
    fn test_code_line_windows() {
        let content: String = (0..300)
            .map(|i| format!("line_{:03} = {}", i, i))
            .collect::<Vec<_>>()
            .join("\n");
        let truncated = truncate_code(&content, 1000);

        assert!(truncated.starts_with("line_000"));
        assert!(truncated.ends_with("line_299 = 299"));
        assert!(truncated.contains(MIDDLE_MARKER));
        assert!(!truncated.contains("line_150"));
    }

    #[test]
    fn test_code_char_windows_for_long_lines() {
        let content = "x".repeat(20_000);
        let truncated = truncate_code(&content, CODE_FILE_MAX_TOKENS);
        assert!(truncated.contains(MIDDLE_MARKER));
        assert!(truncated.chars().count() <= CODE_FILE_MAX_TOKENS * CHARS_PER_TOKEN);
    }

    #[test]
    fn test_small_files_copied_verbatim() {
        let files = json!({"a.py": "print(1)\n", "b.py": "x = 2\n"});
        assert_eq!(compact_code_files(&files), files);
    }

    #[test]
    fn test_test_results_allow_list() {
        let outcome = json!({
            "passed": false,
            "error_message": "e".repeat(800),
            "error_type": "AssertionError",
            "failed_tests": ["test_a"],
            "total": 3,
            "stdout": "noise",
            "raw_output": "more noise",
        });
        let compacted = compact_test_results(&outcome);
        let map = compacted.as_object().unwrap();

        assert_eq!(map.len(), 5);
        assert!(!map.contains_key("stdout"));
        let message = map["error_message"].as_str().unwrap();
        assert_eq!(message.chars().count(), 500);
        assert!(message.ends_with("..."));
    }

    #[test]
    fn test_array_keeps_most_recent() {
        let errors = json!(["a".repeat(100), "b".repeat(100), "c".repeat(100)]);
        let shrunk = shrink_value(&errors, 60);
        let kept = shrunk.as_array().unwrap();
        assert_eq!(kept.len(), 2);
        assert!(kept[1].as_str().unwrap().starts_with('c'));
    }

    #[test]
    fn test_shrink_never_grows() {
        let value = json!("\"\"\"\"\"\"\"\"\"\"\"\"\"\"\"\"\"\"\"\"\"\"\"\"\"\"\"\"\"\"\"\"");
        let shrunk = shrink_value(&value, 2);
        assert!(json_len(&shrunk) <= json_len(&value));
    }
}
