//! Device endpoint handlers.

use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Serialize;
use url::{form_urlencoded, Url};

use crate::config::{EndpointLimits, ProxySettings};
use crate::http::request::DeviceCall;
use crate::http::response::{disable_buffering, proxy_response, streaming_response};
use crate::http::server::AppState;
use crate::observability::metrics;
use crate::proxy::SubscriptionRelay;
use crate::security::AccessDenied;

/// Device endpoints, each with its own rate limit budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Entry,
    Ping,
    Passphrase,
    ProInfo,
    Upload,
    Weather,
    TransportDevice,
    TransportSubscribe,
    TransportPut,
}

impl Endpoint {
    pub fn name(&self) -> &'static str {
        match self {
            Endpoint::Entry => "entry",
            Endpoint::Ping => "ping",
            Endpoint::Passphrase => "passphrase",
            Endpoint::ProInfo => "pro_info",
            Endpoint::Upload => "upload",
            Endpoint::Weather => "weather",
            Endpoint::TransportDevice => "transport_device",
            Endpoint::TransportSubscribe => "transport_subscribe",
            Endpoint::TransportPut => "transport_put",
        }
    }

    pub fn budget(&self, limits: &EndpointLimits) -> u32 {
        match self {
            Endpoint::Entry => limits.entry,
            Endpoint::Ping => limits.ping,
            Endpoint::Passphrase => limits.passphrase,
            Endpoint::ProInfo => limits.pro_info,
            Endpoint::Upload => limits.upload,
            Endpoint::Weather => limits.weather,
            Endpoint::TransportDevice => limits.transport_device,
            Endpoint::TransportSubscribe => limits.transport_subscribe,
            Endpoint::TransportPut => limits.transport_put,
        }
    }
}

impl AppState {
    fn admit(
        &self,
        settings: &ProxySettings,
        call: &DeviceCall,
        endpoint: Endpoint,
    ) -> Result<(), AccessDenied> {
        self.access.check(
            settings,
            call.serial.as_deref(),
            &call.client,
            endpoint.name(),
            endpoint.budget(&self.config.rate_limit.endpoints),
        )
    }

    fn upstream_path(&self, suffix: &str) -> String {
        format!("{}{}", self.config.api.route_prefix, suffix)
    }

    /// `{prefix}{suffix}/{segment}` with `segment` escaped as one path
    /// segment, or a 400 when the value cannot be one.
    fn segment_path(
        &self,
        suffix: &str,
        segment: &str,
        endpoint: Endpoint,
        start: Instant,
    ) -> Result<String, Response> {
        match encode_segment(segment) {
            Some(encoded) => Ok(self.upstream_path(&format!("{suffix}/{encoded}"))),
            None => {
                tracing::warn!(endpoint = endpoint.name(), segment, "Rejected path segment");
                metrics::record_request(endpoint.name(), 400, start);
                Err(invalid_segment())
            }
        }
    }

    /// Admission control followed by one buffered upstream call.
    async fn forward(
        &self,
        call: DeviceCall,
        endpoint: Endpoint,
        path: String,
        query: Option<String>,
    ) -> Response {
        let start = Instant::now();
        let settings = self.settings.snapshot();

        if let Err(denied) = self.admit(&settings, &call, endpoint) {
            metrics::record_request(endpoint.name(), denied.status().as_u16(), start);
            return denied.into_response();
        }

        let request = call.to_proxy_request(path, query);
        let response = self.engine.proxy(&request, &settings).await;
        metrics::record_request(endpoint.name(), response.status.as_u16(), start);
        proxy_response(response)
    }
}

/// Discovery document returned by the entry endpoint.
#[derive(Debug, Serialize)]
pub struct EntryLinks {
    pub czfe_url: String,
    pub transport_url: String,
    pub direct_transport_url: String,
    pub passphrase_url: String,
    pub ping_url: String,
    pub pro_info_url: String,
    pub weather_url: String,
    pub upload_url: String,
    pub software_update_url: String,
    pub server_version: String,
    pub tier_name: String,
}

impl EntryLinks {
    pub fn new(origin: &str, prefix: &str, server_version: &str, tier_name: &str) -> Self {
        let base = format!("{}{}", origin.trim_end_matches('/'), prefix);
        let transport = format!("{base}/transport");
        Self {
            czfe_url: transport.clone(),
            transport_url: transport.clone(),
            direct_transport_url: transport,
            passphrase_url: format!("{base}/passphrase"),
            ping_url: format!("{base}/ping"),
            pro_info_url: format!("{base}/pro_info"),
            weather_url: format!("{base}/weather/v1?query="),
            upload_url: String::new(),
            software_update_url: String::new(),
            server_version: server_version.to_string(),
            tier_name: tier_name.to_string(),
        }
    }
}

pub async fn entry(State(state): State<AppState>, call: DeviceCall) -> Response {
    let start = Instant::now();
    let api = &state.config.api;

    if api.guard_entry {
        let settings = state.settings.snapshot();
        if let Err(denied) = state.admit(&settings, &call, Endpoint::Entry) {
            metrics::record_request(Endpoint::Entry.name(), denied.status().as_u16(), start);
            return denied.into_response();
        }
    }

    tracing::info!(
        method = %call.method,
        serial = call.serial_or_unknown(),
        "Entry discovery"
    );

    let links = EntryLinks::new(&api.origin, &api.route_prefix, &api.server_version, &api.tier_name);
    metrics::record_request(Endpoint::Entry.name(), 200, start);
    Json(links).into_response()
}

pub async fn ping(State(state): State<AppState>, call: DeviceCall) -> Response {
    tracing::info!(serial = call.serial_or_unknown(), "Ping");
    let query = call.query.clone();
    let path = state.upstream_path("/ping");
    state.forward(call, Endpoint::Ping, path, query).await
}

pub async fn passphrase(State(state): State<AppState>, call: DeviceCall) -> Response {
    tracing::info!(serial = call.serial_or_unknown(), "Passphrase request");
    let query = call.query.clone();
    let path = state.upstream_path("/passphrase");
    state.forward(call, Endpoint::Passphrase, path, query).await
}

pub async fn pro_info(State(state): State<AppState>, call: DeviceCall) -> Response {
    pro_info_for(state, None, call).await
}

pub async fn pro_info_code(
    State(state): State<AppState>,
    Path(code): Path<String>,
    call: DeviceCall,
) -> Response {
    pro_info_for(state, Some(code), call).await
}

async fn pro_info_for(state: AppState, route_code: Option<String>, call: DeviceCall) -> Response {
    let start = Instant::now();
    let code = resolve_pro_info_code(route_code.as_deref(), call.query.as_deref());
    tracing::info!(
        serial = call.serial_or_unknown(),
        code = code.as_deref().unwrap_or("none"),
        "Pro info request"
    );

    let path = match &code {
        Some(code) => match state.segment_path("/pro_info", code, Endpoint::ProInfo, start) {
            Ok(path) => path,
            Err(rejected) => return rejected,
        },
        None => state.upstream_path("/pro_info"),
    };
    let query = call.query.clone();
    state.forward(call, Endpoint::ProInfo, path, query).await
}

/// Route code, then `code`, then `entry_code` query parameters.
pub fn resolve_pro_info_code(route_code: Option<&str>, query: Option<&str>) -> Option<String> {
    let nonblank = |v: &str| !v.trim().is_empty();
    if let Some(code) = route_code.filter(|c| nonblank(c)) {
        return Some(code.to_string());
    }
    let query = query?;
    ["code", "entry_code"]
        .into_iter()
        .find_map(|key| query_param(query, key).filter(|v| nonblank(v)))
}

pub async fn upload(State(state): State<AppState>, call: DeviceCall) -> Response {
    tracing::info!(serial = call.serial_or_unknown(), "Upload");
    let query = call.query.clone();
    let path = state.upstream_path("/upload");
    state.forward(call, Endpoint::Upload, path, query).await
}

pub async fn weather(State(state): State<AppState>, call: DeviceCall) -> Response {
    let query = weather_query(call.query.as_deref());
    tracing::info!(
        serial = call.serial_or_unknown(),
        query = query.as_deref().unwrap_or("none"),
        "Weather request"
    );
    let path = state.upstream_path("/weather/v1");
    state.forward(call, Endpoint::Weather, path, query).await
}

/// Upstream query for the weather endpoint.
///
/// A present `query` parameter is kept as is. Otherwise one is derived from
/// `location`, or from `zip` with `,US` appended, and added to the original
/// parameters.
pub fn weather_query(raw: Option<&str>) -> Option<String> {
    let raw = raw.unwrap_or_default();
    if query_param(raw, "query").is_some_and(|q| !q.is_empty()) {
        return Some(raw.to_string());
    }

    let derived = query_param(raw, "location")
        .filter(|l| !l.trim().is_empty())
        .or_else(|| {
            query_param(raw, "zip")
                .filter(|z| !z.trim().is_empty())
                .map(|zip| format!("{zip},US"))
        });

    match derived {
        Some(value) => {
            let encoded: String = form_urlencoded::byte_serialize(value.as_bytes()).collect();
            let separator = if raw.is_empty() { "" } else { "&" };
            Some(format!("{raw}{separator}query={encoded}"))
        }
        None => Some(raw.to_string()).filter(|q| !q.is_empty()),
    }
}

/// Percent-encode `value` as a single path segment.
///
/// Separators and `%` are escaped so the value cannot leave its segment.
/// Empty values and the dot segments are refused.
pub fn encode_segment(value: &str) -> Option<String> {
    if matches!(value, "" | "." | "..") {
        return None;
    }
    let mut url = Url::parse("http://segment.invalid/").ok()?;
    url.path_segments_mut().ok()?.clear().push(value);
    url.path()
        .strip_prefix('/')
        .map(|segment| segment.replace('\\', "%5C"))
}

fn invalid_segment() -> Response {
    let body = serde_json::json!({
        "error": "Invalid path segment",
        "code": "INVALID_PATH_SEGMENT",
    });
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

fn query_param(query: &str, key: &str) -> Option<String> {
    form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

pub async fn transport_device(
    State(state): State<AppState>,
    Path(serial): Path<String>,
    call: DeviceCall,
) -> Response {
    tracing::info!(
        serial = call.serial_or_unknown(),
        device = %serial,
        "Transport device fetch"
    );
    let path = match state.segment_path(
        "/transport/device",
        &serial,
        Endpoint::TransportDevice,
        Instant::now(),
    ) {
        Ok(path) => path,
        Err(rejected) => return rejected,
    };
    let query = call.query.clone();
    state.forward(call, Endpoint::TransportDevice, path, query).await
}

pub async fn transport_put(State(state): State<AppState>, call: DeviceCall) -> Response {
    tracing::info!(serial = call.serial_or_unknown(), "Transport put");
    let query = call.query.clone();
    let path = state.upstream_path("/transport/put");
    state.forward(call, Endpoint::TransportPut, path, query).await
}

/// Subscribe. Streams when the body asks for `"chunked": true`.
pub async fn transport_subscribe(State(state): State<AppState>, call: DeviceCall) -> Response {
    let start = Instant::now();
    let endpoint = Endpoint::TransportSubscribe;
    let settings = state.settings.snapshot();

    if let Err(denied) = state.admit(&settings, &call, endpoint) {
        metrics::record_request(endpoint.name(), denied.status().as_u16(), start);
        return denied.into_response();
    }

    let chunked = is_chunked(call.body.as_deref());
    tracing::info!(
        serial = call.serial_or_unknown(),
        chunked,
        "Transport subscribe"
    );

    let request = call.to_proxy_request(state.upstream_path("/transport"), call.query.clone());

    if !chunked {
        let response = state.engine.proxy(&request, &settings).await;
        metrics::record_request(endpoint.name(), response.status.as_u16(), start);
        let mut response = proxy_response(response);
        disable_buffering(response.headers_mut());
        return response;
    }

    let opened = state.engine.open_stream(&request, &settings).await;
    metrics::record_request(endpoint.name(), opened.status.as_u16(), start);
    let (head, relay) = SubscriptionRelay::new(opened, state.closing.subscribe());
    streaming_response(head, relay)
}

/// `chunked` flag of a subscribe body. Anything unreadable is `false`.
pub fn is_chunked(body: Option<&str>) -> bool {
    body.and_then(|b| serde_json::from_str::<serde_json::Value>(b).ok())
        .and_then(|v| v.get("chunked").and_then(serde_json::Value::as_bool))
        .unwrap_or(false)
}

#[derive(Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub timestamp: String,
}

pub async fn health() -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "healthy",
        timestamp: Utc::now().to_rfc3339(),
    })
}

#[derive(Serialize)]
pub struct ServiceInfo {
    pub service: &'static str,
    pub version: &'static str,
    pub endpoints: Vec<String>,
}

pub async fn root(State(state): State<AppState>) -> Json<ServiceInfo> {
    let prefix = &state.config.api.route_prefix;
    let endpoints = [
        "/entry",
        "/ping",
        "/passphrase",
        "/pro_info",
        "/upload",
        "/weather/v1",
        "/transport",
        "/transport/put",
        "/transport/device/{serial}",
    ]
    .iter()
    .map(|path| format!("{prefix}{path}"))
    .chain(["/health".to_string()])
    .collect();

    Json(ServiceInfo {
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        endpoints,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pro_info_code_resolution() {
        assert_eq!(resolve_pro_info_code(Some("R1"), Some("code=Q1")).as_deref(), Some("R1"));
        assert_eq!(resolve_pro_info_code(None, Some("code=Q1&entry_code=E1")).as_deref(), Some("Q1"));
        assert_eq!(resolve_pro_info_code(None, Some("entry_code=E1")).as_deref(), Some("E1"));
        assert_eq!(resolve_pro_info_code(Some(" "), Some("code=")).as_deref(), None);
        assert_eq!(resolve_pro_info_code(None, None), None);
    }

    #[test]
    fn test_encode_segment() {
        assert_eq!(encode_segment("02AA01AB").as_deref(), Some("02AA01AB"));
        assert_eq!(encode_segment("ABC?evil=1#x").as_deref(), Some("ABC%3Fevil=1%23x"));
        assert_eq!(
            encode_segment("../../passphrase").as_deref(),
            Some("..%2F..%2Fpassphrase")
        );
        assert_eq!(encode_segment("50%").as_deref(), Some("50%25"));
        assert_eq!(encode_segment("a\\b").as_deref(), Some("a%5Cb"));
        assert_eq!(encode_segment(".."), None);
        assert_eq!(encode_segment("."), None);
        assert_eq!(encode_segment(""), None);
    }

    #[test]
    fn test_weather_query() {
        assert_eq!(weather_query(Some("query=94105")).as_deref(), Some("query=94105"));
        assert_eq!(
            weather_query(Some("zip=94105")).as_deref(),
            Some("zip=94105&query=94105%2CUS")
        );
        assert_eq!(
            weather_query(Some("location=Palo%20Alto&zip=94105")).as_deref(),
            Some("location=Palo%20Alto&zip=94105&query=Palo+Alto")
        );
        assert_eq!(weather_query(Some("units=c")).as_deref(), Some("units=c"));
        assert_eq!(weather_query(None), None);
    }

    #[test]
    fn test_is_chunked() {
        assert!(is_chunked(Some(r#"{"chunked":true,"objects":[]}"#)));
        assert!(!is_chunked(Some(r#"{"chunked":false}"#)));
        assert!(!is_chunked(Some(r#"{"objects":[]}"#)));
        assert!(!is_chunked(Some(r#"{"chunked":"yes"}"#)));
        assert!(!is_chunked(Some("{not json")));
        assert!(!is_chunked(None));
    }

    #[test]
    fn test_entry_links() {
        let links = EntryLinks::new("https://nest.example/", "/nest", "1.0.0", "local");
        assert_eq!(links.transport_url, "https://nest.example/nest/transport");
        assert_eq!(links.czfe_url, links.direct_transport_url);
        assert_eq!(links.weather_url, "https://nest.example/nest/weather/v1?query=");
        assert_eq!(links.upload_url, "");
        assert_eq!(links.tier_name, "local");
    }
}
