//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming device call:
//!     → access_control.rs (kill switch → allow-list → rate limit)
//!     → headers.rs (strip hop-by-hop headers both ways)
//!     → Pass to the forwarding engine
//! ```
//!
//! # Design Decisions
//! - Fail closed: reject on any admission check failure
//! - Rejections are decided before any upstream work
//! - Shared state (allow-list cache, rate windows) is lock-free on read

pub mod access_control;
pub mod allow_list;
pub mod headers;
pub mod rate_limit;

pub use access_control::{AccessControl, AccessDenied};
pub use rate_limit::{RateDecision, RateLimit, RateLimiter};
