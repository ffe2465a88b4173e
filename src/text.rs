//! Small text helpers shared by scenarios and judges.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static RE_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+").expect("static regex"));

static RE_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-?\d[\d,]*(?:\.\d+)?").expect("static regex"));

/// Lowercased word tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    RE_WORD
        .find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Every number in `text`, thousands separators stripped.
pub fn extract_numbers(text: &str) -> Vec<f64> {
    RE_NUMBER
        .find_iter(text)
        .filter_map(|m| m.as_str().replace(',', "").parse::<f64>().ok())
        .collect()
}

/// Parses `content` as JSON, falling back to a fenced block and then to the
/// last balanced top-level object embedded in prose.
pub fn extract_json(content: &str) -> Option<Value> {
    let trimmed = content.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    if let Some(block) = extract_json_from_fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(&block) {
            return Some(value);
        }
    }
    extract_json_from_mixed_content(trimmed).and_then(|raw| serde_json::from_str(&raw).ok())
}

fn extract_json_from_fenced_block(content: &str) -> Option<String> {
    let start = content.find("```json").or_else(|| content.find("```"))?;
    let remainder = &content[start..];
    let after_language = remainder.find('\n')?;
    let body = &remainder[after_language + 1..];
    let end = body.find("```")?;
    Some(body[..end].trim().to_string())
}

// Quote/escape-aware: last complete top-level object.
fn extract_json_from_mixed_content(content: &str) -> Option<String> {
    let bytes = content.as_bytes();
    let mut start_pos = None;
    let mut last = None;
    let mut depth: i32 = 0;
    let mut in_str = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_str {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_str = false;
            }
            continue;
        }
        match b {
            b'"' => in_str = true,
            b'{' => {
                if depth == 0 {
                    start_pos = Some(i);
                }
                depth += 1;
            }
            b'}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(start) = start_pos {
                        last = Some((start, i));
                    }
                }
            }
            _ => {}
        }
    }

    last.map(|(start, end)| content[start..=end].to_string())
}
