//! Inbound device call handling.
//!
//! A [`DeviceCall`] captures everything the handlers need from one request:
//! the resolved device serial, the caller's network identity, the headers
//! with hop-by-hop entries removed, the raw query and the body read once.

use std::net::SocketAddr;

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, FromRequest, Request},
    http::{header, HeaderMap, Method},
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::proxy::types::{HeaderFields, ProxyRequest};
use crate::security::headers::is_request_hop_by_hop;

/// Header carrying the device serial explicitly.
pub const DEVICE_SERIAL_HEADER: &str = "x-nl-device-serial";

const BASIC_PREFIX: &str = "basic ";
const NEST_USER_PREFIX: &str = "nest.";

/// Serial from the explicit header, else from Basic auth.
///
/// Malformed credentials resolve to `None`.
pub fn resolve_device_serial(headers: &HeaderMap) -> Option<String> {
    let explicit = headers
        .get(DEVICE_SERIAL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(serial) = explicit {
        return Some(serial.to_string());
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(serial_from_basic_auth)
}

fn serial_from_basic_auth(value: &str) -> Option<String> {
    let prefix = value.get(..BASIC_PREFIX.len())?;
    if !prefix.eq_ignore_ascii_case(BASIC_PREFIX) {
        return None;
    }

    let decoded = STANDARD.decode(value[BASIC_PREFIX.len()..].trim()).ok()?;
    let credentials = String::from_utf8(decoded).ok()?;
    let username = credentials.split(':').next().filter(|u| !u.is_empty())?;

    let serial = match username.get(..NEST_USER_PREFIX.len()) {
        Some(p) if p.eq_ignore_ascii_case(NEST_USER_PREFIX) => &username[NEST_USER_PREFIX.len()..],
        _ => username,
    };
    Some(serial).filter(|s| !s.is_empty()).map(str::to_string)
}

/// Copy inbound headers, dropping connection-management headers.
///
/// Repeated headers are joined into one comma-separated value.
pub fn sanitize_headers(headers: &HeaderMap) -> HeaderFields {
    let mut fields = HeaderFields::new();
    for (name, value) in headers {
        if is_request_hop_by_hop(name.as_str()) {
            continue;
        }
        fields.append(name.as_str(), String::from_utf8_lossy(value.as_bytes()));
    }
    fields
}

/// Body text, or `None` when the body is empty or whitespace.
pub fn normalize_body(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes);
    if text.trim().is_empty() {
        None
    } else {
        Some(text.into_owned())
    }
}

/// Raw query string without a leading `?`; empty becomes `None`.
pub fn normalize_query(query: Option<&str>) -> Option<String> {
    query
        .map(|q| q.strip_prefix('?').unwrap_or(q))
        .filter(|q| !q.is_empty())
        .map(str::to_string)
}

/// One device request, body already buffered.
#[derive(Debug, Clone)]
pub struct DeviceCall {
    pub method: Method,
    pub headers: HeaderMap,
    pub query: Option<String>,
    pub body: Option<String>,
    pub serial: Option<String>,
    /// Caller's network address, `unknown` when the transport has none.
    pub client: String,
}

impl DeviceCall {
    pub fn serial_or_unknown(&self) -> &str {
        self.serial.as_deref().unwrap_or("unknown")
    }

    /// Canonical upstream request for `path`.
    pub fn to_proxy_request(&self, path: impl Into<String>, query: Option<String>) -> ProxyRequest {
        ProxyRequest {
            method: self.method.clone(),
            path: path.into(),
            headers: sanitize_headers(&self.headers),
            body: self.body.clone(),
            content_type: self
                .headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            device_serial: self.serial.clone(),
            query_string: query,
        }
    }
}

impl<S> FromRequest<S> for DeviceCall
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(request: Request<Body>, state: &S) -> Result<Self, Self::Rejection> {
        let client = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let method = request.method().clone();
        let headers = request.headers().clone();
        let query = normalize_query(request.uri().query());
        let serial = resolve_device_serial(&headers);

        let bytes = Bytes::from_request(request, state)
            .await
            .map_err(IntoResponse::into_response)?;

        Ok(Self {
            method,
            headers,
            query,
            body: normalize_body(&bytes),
            serial,
            client,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn basic(credentials: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let value = format!("Basic {}", STANDARD.encode(credentials));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(&value).unwrap());
        headers
    }

    #[test]
    fn test_explicit_header_wins() {
        let mut headers = basic("nest.OTHER:pw");
        headers.insert(DEVICE_SERIAL_HEADER, HeaderValue::from_static("02AA01AC"));
        assert_eq!(resolve_device_serial(&headers).as_deref(), Some("02AA01AC"));
    }

    #[test]
    fn test_basic_auth_serial() {
        assert_eq!(resolve_device_serial(&basic("nest.02AA01AC:secret")).as_deref(), Some("02AA01AC"));
        assert_eq!(resolve_device_serial(&basic("NEST.02AA01AC:secret")).as_deref(), Some("02AA01AC"));
        assert_eq!(resolve_device_serial(&basic("02AA01AC:secret")).as_deref(), Some("02AA01AC"));
        assert_eq!(resolve_device_serial(&basic("02AA01AC")).as_deref(), Some("02AA01AC"));
    }

    #[test]
    fn test_malformed_basic_auth_is_absent() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic !!!not-base64"));
        assert_eq!(resolve_device_serial(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(resolve_device_serial(&headers), None);

        assert_eq!(resolve_device_serial(&basic(":password")), None);
        assert_eq!(resolve_device_serial(&basic("nest.:password")), None);
        assert_eq!(resolve_device_serial(&HeaderMap::new()), None);
    }

    #[test]
    fn test_sanitize_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("proxy.local"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("12"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("x-nl-protocol-version", HeaderValue::from_static("1"));

        let fields = sanitize_headers(&headers);
        assert_eq!(fields.len(), 2);
        assert!(!fields.contains("host"));
        assert_eq!(fields.get("Content-Type"), Some("application/json"));
        assert_eq!(fields.get("X-NL-Protocol-Version"), Some("1"));
    }

    #[test]
    fn test_normalize_body_and_query() {
        assert_eq!(normalize_body(b""), None);
        assert_eq!(normalize_body(b"  \r\n\t"), None);
        assert_eq!(normalize_body(b"{\"a\":1}").as_deref(), Some("{\"a\":1}"));

        assert_eq!(normalize_query(Some("?a=1")).as_deref(), Some("a=1"));
        assert_eq!(normalize_query(Some("a=%20b")).as_deref(), Some("a=%20b"));
        assert_eq!(normalize_query(Some("")), None);
        assert_eq!(normalize_query(None), None);
    }
}
