//! Admission control for device calls.
//!
//! Checks run in a fixed order: kill switch, serial allow-list, rate limit.
//! A request rejected by an earlier check never touches the rate limit
//! counters.

use std::sync::Arc;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::config::{ProxySettings, RateLimitConfig, SettingsHandle};
use crate::observability::metrics;
use crate::security::rate_limit::{RateDecision, RateLimit, RateLimiter};

/// Reason a device call was refused before any upstream work.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessDenied {
    #[error("proxy disabled")]
    ProxyDisabled,

    #[error("serial not allowed")]
    SerialNotAllowed,

    #[error("rate limited, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },
}

impl AccessDenied {
    pub fn status(&self) -> StatusCode {
        match self {
            AccessDenied::ProxyDisabled => StatusCode::SERVICE_UNAVAILABLE,
            AccessDenied::SerialNotAllowed => StatusCode::FORBIDDEN,
            AccessDenied::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AccessDenied::ProxyDisabled => "PROXY_DISABLED",
            AccessDenied::SerialNotAllowed => "SERIAL_NOT_ALLOWED",
            AccessDenied::RateLimited { .. } => "RATE_LIMITED",
        }
    }

    fn message(&self) -> &'static str {
        match self {
            AccessDenied::ProxyDisabled => "Service temporarily unavailable",
            AccessDenied::SerialNotAllowed => "Device not authorized",
            AccessDenied::RateLimited { .. } => "Too many requests",
        }
    }
}

#[derive(Serialize)]
struct DeniedBody {
    error: &'static str,
    code: &'static str,
    #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

impl IntoResponse for AccessDenied {
    fn into_response(self) -> Response {
        let retry_after = match self {
            AccessDenied::RateLimited { retry_after } => Some(retry_after),
            _ => None,
        };
        let body = DeniedBody {
            error: self.message(),
            code: self.code(),
            retry_after,
        };

        let mut response = (self.status(), Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Admission control shared by every device endpoint.
pub struct AccessControl {
    settings: Arc<SettingsHandle>,
    limiter: Arc<RateLimiter>,
    rate_limit: RateLimitConfig,
}

impl AccessControl {
    pub fn new(
        settings: Arc<SettingsHandle>,
        limiter: Arc<RateLimiter>,
        rate_limit: RateLimitConfig,
    ) -> Self {
        Self {
            settings,
            limiter,
            rate_limit,
        }
    }

    /// Decide whether a call may proceed.
    ///
    /// `settings` is the request's snapshot, `client` the caller's network
    /// identity, `endpoint` the endpoint identity and `max_requests` its
    /// budget per window.
    pub fn check(
        &self,
        settings: &ProxySettings,
        serial: Option<&str>,
        client: &str,
        endpoint: &'static str,
        max_requests: u32,
    ) -> Result<(), AccessDenied> {
        let result = self.evaluate(settings, serial, client, endpoint, max_requests);
        if let Err(denied) = &result {
            tracing::warn!(
                serial = serial.unwrap_or("unknown"),
                client = %client,
                endpoint,
                code = denied.code(),
                "Device call denied"
            );
            metrics::record_denied(denied.code());
        }
        result
    }

    fn evaluate(
        &self,
        settings: &ProxySettings,
        serial: Option<&str>,
        client: &str,
        endpoint: &'static str,
        max_requests: u32,
    ) -> Result<(), AccessDenied> {
        if !settings.enabled {
            return Err(AccessDenied::ProxyDisabled);
        }

        if !self.settings.is_serial_allowed(settings, serial) {
            return Err(AccessDenied::SerialNotAllowed);
        }

        if self.rate_limit.enabled {
            let limit = RateLimit {
                max_requests,
                window_secs: self.rate_limit.window_secs,
            };
            if let RateDecision::Limited { retry_after } =
                self.limiter
                    .check(&self.rate_limit.policy, client, endpoint, limit)
            {
                return Err(AccessDenied::RateLimited { retry_after });
            }
        }

        Ok(())
    }
}
