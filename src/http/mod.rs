//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (Axum setup, middleware, graceful shutdown)
//!     → request.rs (device serial, header sanitizing, body read once)
//!     → handlers.rs (admission control, endpoint → upstream path)
//!     → [proxy engine or subscription relay]
//!     → response.rs (header filtering, streaming headers)
//!     → Send to device
//! ```

pub mod handlers;
pub mod request;
pub mod response;
pub mod server;

pub use request::DeviceCall;
pub use server::{AppState, HttpServer, ServerError};
