//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Request handlers produce:
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (counters, gauges, histograms)
//!     → traffic.rs (per-exchange records, queued)
//!
//! Consumers:
//!     → stdout (pretty or JSON)
//!     → Prometheus scrape endpoint
//!     → traffic log directory
//! ```

pub mod logging;
pub mod metrics;
pub mod traffic;

pub use traffic::{FileTrafficSink, TrafficLogger, TrafficRecord, TrafficSink};
