//! Upstream forwarding subsystem.
//!
//! # Data Flow
//! ```text
//! ProxyRequest
//!     → engine.rs (build upstream call, timeout, 502 mapping)
//!     → codec.rs (Content-Encoding, text decoding)
//!     → ProxyResponse
//!
//! Streaming:
//!     engine.rs (headers only)
//!     → stream.rs (incremental decompression, line splitting)
//!     → relay.rs (per-line writes, cancellation)
//! ```

pub mod codec;
pub mod correlation;
pub mod engine;
pub mod relay;
pub mod stream;
pub mod types;

pub use engine::{ForwardingEngine, UpstreamError};
pub use relay::{RelayHead, RelayState, SubscriptionRelay};
pub use types::{HeaderFields, ProxyRequest, ProxyResponse, StreamingProxyResponse};
