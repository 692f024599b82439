//! JSON recovery from free-form provider output.
//!
//! Tries, in order: the whole response, a fenced code block, then the first
//! balanced `{...}` span found by a string-aware brace scan.

use serde_json::Value;

/// Extract the first JSON value a provider response carries.
pub fn extract_json(response: &str) -> Option<Value> {
    let trimmed = response.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() || value.is_array() {
            return Some(value);
        }
    }

    if let Some(block) = fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(block) {
            return Some(value);
        }
    }

    balanced_object(trimmed).and_then(|span| serde_json::from_str::<Value>(span).ok())
}

/// Like [`extract_json`] but only accepts an object.
pub fn extract_json_object(response: &str) -> Option<Value> {
    extract_json(response).filter(Value::is_object)
}

fn fenced_block(response: &str) -> Option<&str> {
    let (open, skip) = match response.find("```json") {
        Some(pos) => (pos, 7),
        None => (response.find("```")?, 3),
    };
    let content_start = open + skip;
    let rest = &response[content_start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim())
}

fn balanced_object(response: &str) -> Option<&str> {
    let start = response.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in response[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&response[start..start + offset + ch.len_utf8()]);
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
    fn parses_bare_object() {
        let v = extract_json(r#"  {"criteria": []} "#).unwrap();
        assert!(v["criteria"].is_array());
    }

    #[test]
    fn parses_fenced_json_block() {
        let response = "Here you go:\n```json\n{\"a\": 1}\n```\nThanks.";
        assert_eq!(extract_json(response).unwrap()["a"], 1);
    }

    #[test]
    fn parses_unlabelled_fence() {
        let response = "```\n{\"a\": 2}\n```";
        assert_eq!(extract_json(response).unwrap()["a"], 2);
    }

    #[test]
    fn scans_braces_in_prose() {
        let response = r#"The result is {"note": "uses } and { inside", "n": {"x": 3}} as requested."#;
        let v = extract_json(response).unwrap();
        assert_eq!(v["n"]["x"], 3);
        assert_eq!(v["note"], "uses } and { inside");
    }

    #[test]
    fn handles_escaped_quotes() {
        let response = r#"prefix {"q": "say \"hi\" }"} suffix"#;
        assert_eq!(extract_json(response).unwrap()["q"], "say \"hi\" }");
    }

    #[test]
    fn rejects_non_json() {
        assert!(extract_json("no json here").is_none());
        assert!(extract_json("").is_none());
        assert!(extract_json("{ unterminated").is_none());
    }

    #[test]
    fn object_only_filter() {
        assert!(extract_json_object("[1, 2]").is_none());
        assert!(extract_json_object("{}").is_some());
    }
}
