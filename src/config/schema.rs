//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the device gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, TLS, body cap).
    pub listener: ListenerConfig,

    /// Device-facing API surface (discovery origin, route prefix).
    pub api: ApiConfig,

    /// Live-reloadable proxy settings.
    pub proxy: ProxySettings,

    /// Per-endpoint rate limiting.
    pub rate_limit: RateLimitConfig,

    /// Traffic log sink.
    pub traffic_log: TrafficLogConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,

    /// Maximum accepted request body in bytes.
    pub max_body_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            tls: None,
            max_body_bytes: 2 * 1024 * 1024,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Device-facing API settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    /// Public origin advertised in entry discovery responses.
    pub origin: String,

    /// Mount point for device routes. Also prefixed to upstream paths.
    pub route_prefix: String,

    /// Server version returned by entry discovery.
    pub server_version: String,

    /// Tier name returned by entry discovery.
    pub tier_name: String,

    /// Run admission control on the discovery endpoint.
    pub guard_entry: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            origin: "https://localhost:5001".to_string(),
            route_prefix: "/nest".to_string(),
            server_version: "1.0.0".to_string(),
            tier_name: "local".to_string(),
            guard_entry: true,
        }
    }
}

/// Proxy settings, swapped atomically on config reload.
///
/// Handlers load one snapshot per request; a reload never changes a
/// request that is already in flight.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ProxySettings {
    /// Kill switch. When false every device call gets 503.
    pub enabled: bool,

    /// Base URL of the upstream device service.
    pub upstream_base_url: String,

    /// Upstream timeout in seconds.
    pub timeout_secs: u64,

    /// Master switch for traffic logging.
    pub enable_logging: bool,

    /// Hand traffic records to the file sink.
    pub log_to_file: bool,

    /// Emit a one-line summary per exchange through tracing.
    pub log_to_console: bool,

    /// Include request/response bodies in traffic records.
    pub log_body: bool,

    /// Maximum logged body length in characters.
    pub max_log_body_size: usize,

    /// Comma-separated serial allow-list. Absent, blank or `*` allows all.
    pub allowed_serials: Option<String>,
}

impl ProxySettings {
    /// Upstream timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// True when any traffic logging output is active.
    pub fn is_logging_enabled(&self) -> bool {
        self.enable_logging && (self.log_to_file || self.log_to_console)
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            upstream_base_url: "https://frontdoor.nest.com".to_string(),
            timeout_secs: 120,
            enable_logging: true,
            log_to_file: true,
            log_to_console: false,
            log_body: false,
            max_log_body_size: 100_000,
            allowed_serials: None,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Policy name, part of every counter key.
    pub policy: String,

    /// Fixed window length in seconds.
    pub window_secs: u64,

    /// How often expired window entries are evicted.
    pub sweep_interval_secs: u64,

    /// Per-endpoint request budgets for one window.
    pub endpoints: EndpointLimits,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            policy: "nest-device".to_string(),
            window_secs: 60,
            sweep_interval_secs: 30,
            endpoints: EndpointLimits::default(),
        }
    }
}

/// Maximum requests per window for each device endpoint.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct EndpointLimits {
    pub entry: u32,
    pub ping: u32,
    pub passphrase: u32,
    pub pro_info: u32,
    pub upload: u32,
    pub weather: u32,
    pub transport_device: u32,
    pub transport_subscribe: u32,
    pub transport_put: u32,
}

impl Default for EndpointLimits {
    fn default() -> Self {
        Self {
            entry: 60,
            ping: 120,
            passphrase: 30,
            pro_info: 60,
            upload: 30,
            weather: 60,
            transport_device: 60,
            transport_subscribe: 30,
            transport_put: 60,
        }
    }
}

/// Traffic log configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TrafficLogConfig {
    /// Root directory for traffic records.
    pub directory: String,

    /// Records buffered before new ones are dropped.
    pub queue_capacity: usize,
}

impl Default for TrafficLogConfig {
    fn default() -> Self {
        Self {
            directory: "logs".to_string(),
            queue_capacity: 1024,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines instead of the human readable format.
    pub json: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
