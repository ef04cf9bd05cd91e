//! Tolerant JSON extraction from model output.
//!
//! Models wrap JSON in prose or code fences; these helpers recover the
//! object without failing the pipeline.

/// Strip a leading/trailing markdown code fence (```json ... ```).
pub fn strip_code_fences(text: &str) -> String {
    let mut out = text.trim();
    if out.starts_with("```") {
        out = out.trim_start_matches("```");
        out = out.strip_prefix("json").unwrap_or(out);
        out = out.trim_start();
    }
    if let Some(idx) = out.rfind("```") {
        out = out[..idx].trim_end();
    }
    out.trim().to_string()
}

/// Extract the first balanced `{...}` object from free text.
pub fn extract_json_object(text: &str) -> Option<String> {
    let text = text.trim();
    let start = text.find('{')?;
    let mut balance = 0i32;
    for (offset, ch) in text[start..].char_indices() {
        match ch {
            '{' => balance += 1,
            '}' => {
                balance -= 1;
                if balance == 0 {
                    return Some(text[start..start + offset + ch.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Fences stripped, then balanced-brace extraction, then a raw parse
/// attempt. Returns the parsed value or None.
pub fn parse_loose_json(text: &str) -> Option<serde_json::Value> {
    let cleaned = strip_code_fences(text);
    if cleaned.is_empty() {
        return None;
    }
    if let Some(candidate) = extract_json_object(&cleaned) {
        if let Ok(value) = serde_json::from_str(&candidate) {
            return Some(value);
        }
    }
    serde_json::from_str(&cleaned).ok()
}
