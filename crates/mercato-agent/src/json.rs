//! Permissive JSON extraction from LLM output: bare object, fenced code
//! block, or the first balanced `{…}` substring.

use regex::Regex;
use std::sync::OnceLock;

fn fenced_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```(?:json)?\s*(\{[\s\S]*?\})\s*```").expect("valid regex"))
}

/// Extract a JSON object from free-form model output. Returns `None` when
/// nothing parseable is found.
pub fn extract_object(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();

    // Bare JSON object.
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if value.is_object() {
            return Some(value);
        }
    }

    // First fenced code block.
    if let Some(caps) = fenced_block_re().captures(trimmed) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&caps[1]) {
            if value.is_object() {
                return Some(value);
            }
        }
    }

    // First balanced {…} substring.
    if let Some(candidate) = first_balanced_object(trimmed) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(candidate) {
            if value.is_object() {
                return Some(value);
            }
        }
    }

    None
}

fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_object() {
        let v = extract_object(r#"{"intents": []}"#).unwrap();
        assert!(v["intents"].is_array());
    }

    #[test]
    fn fenced_block() {
        let text = "Here you go:\n```json\n{\"intents\": [{\"intent\": \"GREETING\"}]}\n```\nDone.";
        let v = extract_object(text).unwrap();
        assert_eq!(v["intents"][0]["intent"], "GREETING");
    }

    #[test]
    fn embedded_object() {
        let text = "The result is {\"a\": {\"b\": 1}} as requested.";
        let v = extract_object(text).unwrap();
        assert_eq!(v["a"]["b"], 1);
    }

    #[test]
    fn braces_inside_strings_do_not_confuse() {
        let text = r#"prefix {"note": "open { brace", "n": 2} suffix"#;
        let v = extract_object(text).unwrap();
        assert_eq!(v["n"], 2);
    }

    #[test]
    fn garbage_yields_none() {
        assert!(extract_object("no json here at all").is_none());
        assert!(extract_object("{broken").is_none());
    }
}
