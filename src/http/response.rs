//! Device-facing responses.
//!
//! Upstream headers are copied except hop-by-hop headers and
//! `Content-Encoding`: bodies are always relayed decoded.

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, HeaderValue},
    response::Response,
};

use crate::proxy::relay::{RelayHead, SubscriptionRelay};
use crate::proxy::types::{HeaderFields, ProxyResponse};
use crate::security::headers::is_response_hop_by_hop;

const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Hint for reverse proxies in front of us not to buffer the body.
pub const X_ACCEL_BUFFERING: &str = "x-accel-buffering";

/// Buffered upstream response as an axum response.
pub fn proxy_response(response: ProxyResponse) -> Response {
    let mut out = Response::new(Body::from(response.body.unwrap_or_default()));
    *out.status_mut() = response.status;

    let headers = out.headers_mut();
    copy_upstream_headers(headers, &response.headers);
    let content_type = response.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE);
    insert(headers, header::CONTENT_TYPE, content_type);
    out
}

/// Streaming subscription response. Headers go out before any body bytes.
pub fn streaming_response(head: RelayHead, relay: SubscriptionRelay) -> Response {
    let mut out = Response::new(Body::from_stream(relay.into_stream()));
    *out.status_mut() = head.status;

    let headers = out.headers_mut();
    copy_upstream_headers(headers, &head.headers);
    if let Some(content_type) = head.content_type.as_deref() {
        insert(headers, header::CONTENT_TYPE, content_type);
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    disable_buffering(headers);
    out
}

pub fn disable_buffering(headers: &mut HeaderMap) {
    headers.insert(
        HeaderName::from_static(X_ACCEL_BUFFERING),
        HeaderValue::from_static("no"),
    );
}

fn copy_upstream_headers(target: &mut HeaderMap, fields: &HeaderFields) {
    for (name, value) in fields.iter() {
        if is_response_hop_by_hop(name) || name.eq_ignore_ascii_case("content-encoding") {
            continue;
        }
        match HeaderName::from_bytes(name.as_bytes()) {
            Ok(name) => insert(target, name, value),
            Err(_) => tracing::debug!(header = name, "Dropping invalid upstream header"),
        }
    }
}

fn insert(target: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            target.insert(name, value);
        }
        Err(_) => tracing::debug!(header = %name, "Dropping invalid header value"),
    }
}
