//! Network layer subsystem.
//!
//! The device listener is a plain tokio `TcpListener` handed to the HTTP
//! server. With `[listener.tls]` configured, connections are terminated with
//! rustls through `axum-server`.

pub mod tls;
