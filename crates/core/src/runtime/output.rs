//! Parsing script stdout into JSON.

use lavs_shared::{LavsError, LavsResult};
use serde_json::Value;

/// Parse a script's stdout.
///
/// Empty output is `null`. Otherwise the whole text is parsed strictly, and
/// failing that the first balanced `{...}` or `[...]` that parses is returned,
/// so scripts that log to stdout stay usable. The fallback is a heuristic: a
/// log line that itself contains valid JSON wins over the real payload.
pub fn parse_output(stdout: &str) -> LavsResult<Value> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Value::Null);
    }

    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    extract_embedded_json(trimmed).ok_or_else(|| {
        LavsError::handler("Script output is not valid JSON").with_data(serde_json::json!({
            "stdout": preview(trimmed, 512),
        }))
    })
}

fn extract_embedded_json(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    for (start, &b) in bytes.iter().enumerate() {
        if b != b'{' && b != b'[' {
            continue;
        }
        if let Some(end) = balanced_end(bytes, start) {
            if let Ok(value) = serde_json::from_str(&text[start..end]) {
                return Some(value);
            }
        }
    }
    None
}

/// Byte offset one past the bracket closing the one at `start`, skipping
/// brackets inside string literals. Bracket kinds are not matched against each
/// other; the parse attempt rejects mismatches.
fn balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth: usize = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(start + offset + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// At most `max` bytes of `s`, cut on a char boundary.
pub(crate) fn preview(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
