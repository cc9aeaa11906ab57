//! Nest device gateway.
//!
//! Sits between legacy thermostats and the upstream device service:
//! admits or rejects each device call, forwards it upstream, decodes the
//! response, and relays long-lived transport subscriptions line by line.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod proxy;
pub mod security;

pub use config::schema::ProxyConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
