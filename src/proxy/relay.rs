//! Subscription relay.
//!
//! Turns a [`StreamingProxyResponse`] into a device-facing body that writes
//! each upstream line as soon as it is read.
//!
//! ```text
//! Initiating ──▶ HeadersSent ──▶ Relaying ──▶ Completed
//!      │               │             │
//!      └───────────────┴─────────────┴──────▶ Aborted
//! ```
//!
//! A client disconnect drops the body stream. The relay's `Drop` then
//! records `Aborted` and the upstream connection and decoder are released
//! along with it. Server shutdown ends the relay between two lines the
//! same way.

use std::io;

use axum::http::StatusCode;
use bytes::Bytes;
use futures_util::Stream;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::observability::metrics;
use crate::proxy::stream::LineStream;
use crate::proxy::types::{HeaderFields, StreamingProxyResponse};

/// Lifecycle of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Initiating,
    HeadersSent,
    Relaying,
    Completed,
    Aborted,
}

impl RelayState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RelayState::Completed | RelayState::Aborted)
    }

    /// Metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayState::Initiating => "initiating",
            RelayState::HeadersSent => "headers_sent",
            RelayState::Relaying => "relaying",
            RelayState::Completed => "completed",
            RelayState::Aborted => "aborted",
        }
    }
}

/// Status line and headers of a relayed subscription.
#[derive(Debug, Clone)]
pub struct RelayHead {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub headers: HeaderFields,
}

/// Body side of a subscription.
pub struct SubscriptionRelay {
    correlation_id: String,
    state: RelayState,
    lines: Option<LineStream>,
    payload: Option<String>,
    closing: broadcast::Receiver<()>,
    relayed: u64,
    counted: bool,
}

impl SubscriptionRelay {
    /// Split an opened subscription into its head and a relay for the body.
    ///
    /// A message on `closing` ends the relay before its next line.
    pub fn new(
        response: StreamingProxyResponse,
        closing: broadcast::Receiver<()>,
    ) -> (RelayHead, Self) {
        let payload = response.error_payload();

        let StreamingProxyResponse {
            correlation_id,
            status,
            content_type,
            headers,
            lines,
            error,
            ..
        } = response;

        let head = RelayHead {
            status,
            content_type,
            headers,
        };

        let counted = lines.is_some();
        if counted {
            metrics::stream_opened();
        }

        let state = if error.is_some() {
            RelayState::Aborted
        } else {
            RelayState::HeadersSent
        };

        let relay = Self {
            correlation_id,
            state,
            lines,
            payload,
            closing,
            relayed: 0,
            counted,
        };

        (head, relay)
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Next body chunk for the device, one line per chunk.
    ///
    /// Returns `None` once the relay has reached a terminal state.
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        if let Some(payload) = self.payload.take() {
            return Some(Bytes::from(payload));
        }

        if self.lines.is_none() {
            if !self.state.is_terminal() {
                self.finish(RelayState::Completed);
            }
            return None;
        }

        if self.state == RelayState::HeadersSent {
            self.state = RelayState::Relaying;
        }

        let next = {
            let lines = self.lines.as_mut()?;
            tokio::select! {
                line = lines.next_line() => Some(line),
                _ = closed(&mut self.closing) => None,
            }
        };

        match next {
            Some(Some(Ok(mut line))) => {
                self.relayed += 1;
                line.push('\n');
                Some(Bytes::from(line))
            }
            Some(Some(Err(e))) => {
                tracing::warn!(
                    correlation_id = %self.correlation_id,
                    error = %e,
                    "Upstream stream failed, closing subscription"
                );
                self.finish(RelayState::Aborted);
                None
            }
            Some(None) => {
                self.finish(RelayState::Completed);
                None
            }
            None => {
                tracing::info!(
                    correlation_id = %self.correlation_id,
                    "Server shutting down, closing subscription"
                );
                self.finish(RelayState::Aborted);
                None
            }
        }
    }

    /// Body stream for the device-facing response.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
        futures_util::stream::unfold(self, |mut relay| async move {
            relay
                .next_chunk()
                .await
                .map(|chunk| (Ok::<_, io::Error>(chunk), relay))
        })
    }

    fn finish(&mut self, state: RelayState) {
        self.lines = None;
        self.state = state;
        if self.counted {
            self.counted = false;
            metrics::stream_closed(state.as_str());
        }

        match state {
            RelayState::Completed => tracing::info!(
                correlation_id = %self.correlation_id,
                lines = self.relayed,
                "Subscription completed"
            ),
            _ => tracing::debug!(
                correlation_id = %self.correlation_id,
                lines = self.relayed,
                state = state.as_str(),
                "Subscription closed"
            ),
        }
    }
}

impl Drop for SubscriptionRelay {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            tracing::info!(
                correlation_id = %self.correlation_id,
                lines = self.relayed,
                "Subscription cancelled by client"
            );
            self.finish(RelayState::Aborted);
        }
    }
}

/// Resolves on a shutdown notice. A dropped sender means no shutdown will
/// ever be announced, so that case never resolves.
async fn closed(closing: &mut broadcast::Receiver<()>) {
    match closing.recv().await {
        Ok(()) | Err(RecvError::Lagged(_)) => {}
        Err(RecvError::Closed) => std::future::pending().await,
    }
}
