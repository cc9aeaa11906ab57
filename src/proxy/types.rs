//! Request and response values exchanged with the forwarding engine.

use axum::http::{Method, StatusCode};
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::proxy::stream::LineStream;

/// Ordered header list with case-insensitive lookup.
///
/// Names keep the case they were inserted with. Inserting an existing name
/// replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderFields(Vec<(String, String)>);

impl HeaderFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `name`.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&name)) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }

    /// Insert `name`, joining with any existing value as `a, b`.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&name)) {
            Some(slot) => {
                slot.1.push_str(", ");
                slot.1.push_str(&value);
            }
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HeaderFields {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut fields = HeaderFields::new();
        for (k, v) in iter {
            fields.insert(k, v);
        }
        fields
    }
}

impl Serialize for HeaderFields {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// A device call in canonical form, ready to be sent upstream.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Upstream path, e.g. `/nest/transport`.
    pub path: String,
    /// Device headers with hop-by-hop headers removed.
    pub headers: HeaderFields,
    /// Request body. Blank bodies are `None`.
    pub body: Option<String>,
    pub content_type: Option<String>,
    pub device_serial: Option<String>,
    /// Raw query string without the leading `?`.
    pub query_string: Option<String>,
}

impl ProxyRequest {
    /// A bare request with no headers or body.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderFields::new(),
            body: None,
            content_type: None,
            device_serial: None,
            query_string: None,
        }
    }
}

/// Buffered outcome of a forwarded call.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub body: Option<String>,
    pub content_type: Option<String>,
    /// All upstream response headers, flattened.
    pub headers: HeaderFields,
    /// Failure detail when the call never produced an upstream response.
    pub error: Option<String>,
    /// The body bytes were not text and `body` holds a placeholder.
    pub binary: bool,
}

impl ProxyResponse {
    /// 502 response describing an unreachable upstream.
    pub fn upstream_unavailable(message: impl Into<String>) -> Self {
        let message = message.into();
        let body = serde_json::json!({
            "error": "Upstream unavailable",
            "message": message,
        });
        Self {
            status: StatusCode::BAD_GATEWAY,
            body: Some(body.to_string()),
            content_type: Some("application/json".to_string()),
            headers: HeaderFields::new(),
            error: Some(message),
            binary: false,
        }
    }
}

/// Outcome of opening a streaming upstream call.
///
/// On success `lines` yields the decompressed body line by line. On
/// initiation failure `lines` is `None` and `error` is set. When upstream
/// answers with a non-success status its body is captured in
/// `upstream_body` instead of being streamed.
pub struct StreamingProxyResponse {
    pub correlation_id: String,
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub headers: HeaderFields,
    pub lines: Option<LineStream>,
    pub upstream_body: Option<String>,
    pub error: Option<String>,
}

impl StreamingProxyResponse {
    /// Failed initiation with a 502 status.
    pub fn failed(correlation_id: String, message: impl Into<String>) -> Self {
        Self {
            correlation_id,
            status: StatusCode::BAD_GATEWAY,
            content_type: None,
            headers: HeaderFields::new(),
            lines: None,
            upstream_body: None,
            error: Some(message.into()),
        }
    }

    /// Payload written once to the device when the relay cannot stream.
    pub fn error_payload(&self) -> Option<String> {
        if let Some(body) = self.upstream_body.as_deref().filter(|b| !b.is_empty()) {
            return Some(body.to_string());
        }
        let message = self.error.as_deref()?;
        Some(
            serde_json::json!({
                "error": "upstream_unavailable",
                "status": self.status.as_u16(),
                "message": message,
            })
            .to_string(),
        )
    }
}

impl std::fmt::Debug for StreamingProxyResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingProxyResponse")
            .field("correlation_id", &self.correlation_id)
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("streaming", &self.lines.is_some())
            .field("error", &self.error)
            .finish()
    }
}
