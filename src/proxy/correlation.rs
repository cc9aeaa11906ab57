//! Correlation identifiers for proxied exchanges.
//!
//! Format: `{METHOD}_{path}_{yyyyMMddTHHmmss}_{8 hex}`, where `path` is the
//! request path with separators replaced, trimmed and cut to 30 characters.

use chrono::Utc;
use uuid::Uuid;

const MAX_PATH_CHARS: usize = 30;

/// Generate a correlation id for one exchange.
pub fn correlation_id(method: &str, path: &str) -> String {
    let timestamp = Utc::now().format("%Y%m%dT%H%M%S");
    let random = Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}_{}", method, sanitize_path(path), timestamp, &random[..8])
}

/// Flatten a path into an identifier-safe fragment.
pub fn sanitize_path(path: &str) -> String {
    let flattened: String = path
        .chars()
        .filter(|c| *c != ':')
        .map(|c| match c {
            '/' | '\\' | '.' => '-',
            '?' | '&' | '=' | ' ' => '_',
            other => other,
        })
        .collect();

    flattened
        .trim_matches(|c| c == '-' || c == '_')
        .chars()
        .take(MAX_PATH_CHARS)
        .collect()
}

/// The random suffix of a correlation id.
pub fn suffix(correlation_id: &str) -> &str {
    correlation_id.rsplit('_').next().unwrap_or(correlation_id)
}
