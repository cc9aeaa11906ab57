//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → settings.rs swaps the [proxy] snapshot atomically
//!     → next request observes new settings
//! ```
//!
//! # Design Decisions
//! - Only `ProxySettings` is live; other sections need a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod settings;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{
    ApiConfig, EndpointLimits, ListenerConfig, ObservabilityConfig, ProxyConfig, ProxySettings,
    RateLimitConfig, TlsConfig, TrafficLogConfig,
};
pub use settings::SettingsHandle;
