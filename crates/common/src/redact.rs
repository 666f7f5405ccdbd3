//! Secret redaction for logs and run snapshots

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

/// Replacement for every redacted value
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Normalised substrings that mark a key as secret
const SECRET_KEY_PATTERNS: &[&str] = &[
    "password",
    "token",
    "secret",
    "apikey",
    "credential",
    "bearer",
    "auth",
    "jwt",
];

static BEARER_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(\bbearer\s+)[A-Za-z0-9\-._~+/]+=*").ok());

static KEY_VALUE_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b([A-Za-z0-9_\-]*(?:password|passwd|token|secret|api[_\-]?key|credential|auth|jwt)[A-Za-z0-9_\-]*)(\s*[=:]\s*)("[^"]*"|'[^']*'|[^\s&,;"']+)"#,
    )
    .ok()
});

/// Whether a key names a secret (case-insensitive substring match)
pub fn is_secret_key(key: &str) -> bool {
    let normalized: String = key
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    SECRET_KEY_PATTERNS.iter().any(|p| normalized.contains(p))
}

/// Replace the value of every secret-named key, at any depth
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(redact_map(map)),
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        other => other.clone(),
    }
}

/// Map form of [`redact_value`]
pub fn redact_map(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(k, v)| {
            let redacted = if is_secret_key(k) {
                Value::String(REDACTION_MARKER.to_string())
            } else {
                redact_value(v)
            };
            (k.clone(), redacted)
        })
        .collect()
}

/// Mask `Bearer <token>` and `key=value` secrets embedded in free text
///
/// Text is replaced wholesale if the patterns are unavailable.
pub fn scrub_text(text: &str) -> String {
    let (Some(bearer), Some(key_value)) = (BEARER_RE.as_ref(), KEY_VALUE_RE.as_ref()) else {
        return REDACTION_MARKER.to_string();
    };
    let bearer_masked = bearer.replace_all(text, format!("${{1}}{}", REDACTION_MARKER));
    key_value
        .replace_all(&bearer_masked, format!("${{1}}${{2}}{}", REDACTION_MARKER))
        .into_owned()
}

/// Key-based redaction plus free-text scrubbing of every string leaf
pub fn sanitize_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let clean = if is_secret_key(k) {
                        Value::String(REDACTION_MARKER.to_string())
                    } else {
                        sanitize_value(v)
                    };
                    (k.clone(), clean)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_value).collect()),
        Value::String(s) => Value::String(scrub_text(s)),
        other => other.clone(),
    }
}
