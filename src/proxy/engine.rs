//! Forwarding engine.
//!
//! Sends a [`ProxyRequest`] upstream and turns whatever happens into a
//! [`ProxyResponse`] or [`StreamingProxyResponse`]. Upstream failures never
//! escape as errors: they become 502 responses.

use std::time::{Duration, Instant};

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use chrono::Utc;
use thiserror::Error;
use tokio::time;

use crate::config::ProxySettings;
use crate::observability::metrics;
use crate::observability::traffic::{
    truncate_body, RequestRecord, ResponseRecord, TrafficLogger, TrafficRecord,
};
use crate::proxy::codec::{self, ContentEncoding};
use crate::proxy::correlation::correlation_id;
use crate::proxy::stream::LineStream;
use crate::proxy::types::{HeaderFields, ProxyRequest, ProxyResponse, StreamingProxyResponse};
use crate::security::headers::is_request_hop_by_hop;

/// Largest upstream error body captured when a subscription is refused.
const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Failure to complete an upstream exchange.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream did not respond within {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Transport(reqwest::Error),

    #[error("failed to decompress upstream body: {0}")]
    Decompression(std::io::Error),

    #[error("invalid upstream request: {0}")]
    InvalidRequest(reqwest::Error),
}

impl UpstreamError {
    /// Metric label for the failure.
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamError::Timeout(_) => "timeout",
            UpstreamError::Transport(_) => "transport",
            UpstreamError::Decompression(_) => "decompression",
            UpstreamError::InvalidRequest(_) => "invalid_request",
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            UpstreamError::InvalidRequest(e)
        } else {
            UpstreamError::Transport(e)
        }
    }
}

/// Sends device calls to the upstream service.
#[derive(Clone)]
pub struct ForwardingEngine {
    client: reqwest::Client,
    traffic: TrafficLogger,
}

impl ForwardingEngine {
    pub fn new(traffic: TrafficLogger) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;
        Ok(Self::with_client(client, traffic))
    }

    pub fn with_client(client: reqwest::Client, traffic: TrafficLogger) -> Self {
        Self { client, traffic }
    }

    /// Forward one buffered call.
    pub async fn proxy(&self, request: &ProxyRequest, settings: &ProxySettings) -> ProxyResponse {
        let correlation_id = correlation_id(request.method.as_str(), &request.path);
        let start = Instant::now();

        tracing::info!(
            correlation_id = %correlation_id,
            method = %request.method,
            path = %request.path,
            query = request.query_string.as_deref().unwrap_or("(none)"),
            "Proxying to upstream"
        );

        let response = match time::timeout(settings.timeout(), self.round_trip(request, settings))
            .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => self.failure(&correlation_id, e),
            Err(_) => self.failure(&correlation_id, UpstreamError::Timeout(settings.timeout())),
        };

        self.record_exchange(&correlation_id, request, &response, settings);

        tracing::info!(
            correlation_id = %correlation_id,
            method = %request.method,
            path = %request.path,
            status = response.status.as_u16(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Upstream call completed"
        );

        response
    }

    /// Open a streaming call. Only the response head is awaited; the body
    /// is read lazily through the returned line stream.
    pub async fn open_stream(
        &self,
        request: &ProxyRequest,
        settings: &ProxySettings,
    ) -> StreamingProxyResponse {
        let correlation_id = correlation_id(request.method.as_str(), &request.path);

        tracing::info!(
            correlation_id = %correlation_id,
            method = %request.method,
            path = %request.path,
            "Initiating streaming call"
        );

        let sent = time::timeout(settings.timeout(), self.build(request, settings).send()).await;
        let upstream = match sent {
            Ok(Ok(upstream)) => upstream,
            Ok(Err(e)) => return self.stream_failure(correlation_id, request, settings, e.into()),
            Err(_) => {
                let e = UpstreamError::Timeout(settings.timeout());
                return self.stream_failure(correlation_id, request, settings, e);
            }
        };

        let status = upstream.status();
        let headers = collect_headers(upstream.headers());
        let content_type = content_type(upstream.headers());
        let encoding = ContentEncoding::from_header(headers.get("content-encoding"));

        tracing::info!(
            correlation_id = %correlation_id,
            status = status.as_u16(),
            encoding = %encoding,
            "Streaming response initiated"
        );

        let mut response = StreamingProxyResponse {
            correlation_id,
            status,
            content_type,
            headers,
            lines: None,
            upstream_body: None,
            error: None,
        };

        if status.is_success() {
            response.lines = Some(LineStream::new(upstream.bytes_stream(), encoding));
        } else {
            response.upstream_body = read_error_body(upstream, encoding, settings.timeout()).await;
        }

        self.record(
            &response.correlation_id,
            request,
            status,
            &response.headers,
            response.upstream_body.as_deref(),
            settings,
        );
        response
    }

    async fn round_trip(
        &self,
        request: &ProxyRequest,
        settings: &ProxySettings,
    ) -> Result<ProxyResponse, UpstreamError> {
        let upstream = self.build(request, settings).send().await?;

        let status = upstream.status();
        let headers = collect_headers(upstream.headers());
        let content_type = content_type(upstream.headers());
        let encoding = ContentEncoding::from_header(headers.get("content-encoding"));

        let raw = upstream.bytes().await?;
        let plain = codec::decompress(&raw, encoding).map_err(UpstreamError::Decompression)?;
        let decoded = codec::decode_text(&plain);

        Ok(ProxyResponse {
            status,
            body: Some(decoded.text).filter(|b| !b.is_empty()),
            content_type,
            headers,
            error: None,
            binary: decoded.binary,
        })
    }

    fn build(&self, request: &ProxyRequest, settings: &ProxySettings) -> reqwest::RequestBuilder {
        let url = upstream_url(
            &settings.upstream_base_url,
            &request.path,
            request.query_string.as_deref(),
        );

        let mut headers = HeaderMap::new();
        for (name, value) in request.headers.iter() {
            if is_request_hop_by_hop(name) || name.eq_ignore_ascii_case("content-type") {
                continue;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => tracing::debug!(header = name, "Skipping header that cannot be forwarded"),
            }
        }

        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .headers(headers);

        if let Some(body) = &request.body {
            let content_type = request.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE);
            builder = builder
                .header(header::CONTENT_TYPE, content_type)
                .body(body.clone());
        }
        builder
    }

    fn failure(&self, correlation_id: &str, error: UpstreamError) -> ProxyResponse {
        tracing::error!(
            correlation_id = %correlation_id,
            kind = error.kind(),
            error = %error,
            "Upstream call failed"
        );
        metrics::record_upstream_error(error.kind());
        ProxyResponse::upstream_unavailable(error.to_string())
    }

    fn stream_failure(
        &self,
        correlation_id: String,
        request: &ProxyRequest,
        settings: &ProxySettings,
        error: UpstreamError,
    ) -> StreamingProxyResponse {
        tracing::error!(
            correlation_id = %correlation_id,
            kind = error.kind(),
            error = %error,
            "Failed to initiate streaming call"
        );
        metrics::record_upstream_error(error.kind());

        let response = StreamingProxyResponse::failed(correlation_id, error.to_string());
        let payload = response.error_payload();
        self.record(
            &response.correlation_id,
            request,
            response.status,
            &response.headers,
            payload.as_deref(),
            settings,
        );
        response
    }

    fn record_exchange(
        &self,
        correlation_id: &str,
        request: &ProxyRequest,
        response: &ProxyResponse,
        settings: &ProxySettings,
    ) {
        self.record(
            correlation_id,
            request,
            response.status,
            &response.headers,
            response.body.as_deref(),
            settings,
        );
    }

    /// Hand an exchange to the traffic log. Never waits.
    fn record(
        &self,
        correlation_id: &str,
        request: &ProxyRequest,
        status: StatusCode,
        response_headers: &HeaderFields,
        response_body: Option<&str>,
        settings: &ProxySettings,
    ) {
        if !settings.is_logging_enabled() {
            return;
        }

        if settings.log_to_console {
            tracing::info!(
                target: "nest_proxy::traffic",
                correlation_id = %correlation_id,
                serial = request.device_serial.as_deref().unwrap_or("unknown"),
                method = %request.method,
                path = %request.path,
                status = status.as_u16(),
                "Device exchange"
            );
        }

        if settings.log_to_file {
            let body = |b: Option<&str>| {
                b.filter(|_| settings.log_body)
                    .map(|b| truncate_body(b, settings.max_log_body_size))
            };
            self.traffic.submit(TrafficRecord {
                correlation_id: correlation_id.to_string(),
                timestamp: Utc::now(),
                request: RequestRecord {
                    method: request.method.to_string(),
                    path: request.path.clone(),
                    headers: request.headers.clone(),
                    body: body(request.body.as_deref()),
                },
                response: ResponseRecord {
                    status_code: status.as_u16(),
                    headers: response_headers.clone(),
                    body: body(response_body),
                },
            });
        }
    }
}

/// `{base without trailing slash}{path with leading slash}{?query}`.
pub fn upstream_url(base: &str, path: &str, query: Option<&str>) -> String {
    let base = base.trim_end_matches('/');
    let slash = if path.starts_with('/') { "" } else { "/" };
    match query.filter(|q| !q.is_empty()) {
        Some(query) => format!("{base}{slash}{path}?{query}"),
        None => format!("{base}{slash}{path}"),
    }
}

/// Flatten upstream headers; repeated names are joined with `, `.
fn collect_headers(headers: &HeaderMap) -> HeaderFields {
    let mut fields = HeaderFields::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        fields.append(name.as_str(), value);
    }
    fields
}

fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Read a refused subscription's body, up to [`MAX_ERROR_BODY_BYTES`].
async fn read_error_body(
    mut upstream: reqwest::Response,
    encoding: ContentEncoding,
    timeout: Duration,
) -> Option<String> {
    let read = async {
        let mut raw = Vec::new();
        while let Some(chunk) = upstream.chunk().await? {
            raw.extend_from_slice(&chunk);
            if raw.len() >= MAX_ERROR_BODY_BYTES {
                raw.truncate(MAX_ERROR_BODY_BYTES);
                break;
            }
        }
        Ok::<_, reqwest::Error>(raw)
    };

    let raw = match time::timeout(timeout, read).await {
        Ok(Ok(raw)) => raw,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Failed to read upstream error body");
            return None;
        }
        Err(_) => return None,
    };

    let plain = codec::decompress(&raw, encoding).ok()?;
    Some(codec::decode_text(&plain).text).filter(|b| !b.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;

    #[test]
    fn test_upstream_url() {
        assert_eq!(
            upstream_url("https://up.example/", "/nest/ping", None),
            "https://up.example/nest/ping"
        );
        assert_eq!(
            upstream_url("https://up.example", "nest/weather/v1", Some("query=94105,US")),
            "https://up.example/nest/weather/v1?query=94105,US"
        );
        assert_eq!(
            upstream_url("https://up.example//", "/a", Some("")),
            "https://up.example/a"
        );
    }

    #[test]
    fn test_collect_headers_joins_repeats() {
        let mut map = HeaderMap::new();
        map.append("set-cookie", HeaderValue::from_static("a=1"));
        map.append("set-cookie", HeaderValue::from_static("b=2"));
        map.insert("x-one", HeaderValue::from_static("1"));

        let fields = collect_headers(&map);
        assert_eq!(fields.get("Set-Cookie"), Some("a=1, b=2"));
        assert_eq!(fields.get("x-one"), Some("1"));
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_502() {
        let engine = ForwardingEngine::new(TrafficLogger::disabled()).unwrap();
        // Nothing listens on port 9 of the loopback interface.
        let settings = ProxySettings {
            upstream_base_url: "http://127.0.0.1:9".into(),
            timeout_secs: 5,
            ..ProxySettings::default()
        };

        let response = engine
            .proxy(&ProxyRequest::new(Method::GET, "/nest/ping"), &settings)
            .await;
        assert_eq!(response.status, StatusCode::BAD_GATEWAY);
        assert!(response.error.is_some());
        assert_eq!(response.content_type.as_deref(), Some("application/json"));

        let streaming = engine
            .open_stream(&ProxyRequest::new(Method::POST, "/nest/transport"), &settings)
            .await;
        assert_eq!(streaming.status, StatusCode::BAD_GATEWAY);
        assert!(streaming.lines.is_none());
        assert!(streaming.error.is_some());
    }
}
