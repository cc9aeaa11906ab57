//! Traffic log for proxied exchanges.
//!
//! Request handlers hand a [`TrafficRecord`] to a [`TrafficLogger`], which
//! queues it without waiting. A background consumer drains the queue into a
//! [`TrafficSink`]. A full queue drops the record; the proxied response is
//! never delayed by logging.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::observability::metrics;
use crate::proxy::correlation;
use crate::proxy::types::HeaderFields;

#[derive(Debug, Error)]
pub enum TrafficLogError {
    #[error("failed to write traffic record: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode traffic record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One logged exchange.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficRecord {
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub request: RequestRecord,
    pub response: ResponseRecord,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub method: String,
    pub path: String,
    pub headers: HeaderFields,
    pub body: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRecord {
    pub status_code: u16,
    pub headers: HeaderFields,
    pub body: Option<String>,
}

/// Cut a logged body to at most `max_chars` characters.
pub fn truncate_body(body: &str, max_chars: usize) -> String {
    match body.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}... [truncated]", &body[..end]),
        None => body.to_string(),
    }
}

/// Destination for traffic records.
#[async_trait]
pub trait TrafficSink: Send + Sync {
    async fn write(&self, record: &TrafficRecord) -> Result<(), TrafficLogError>;
}

/// Writes each record as pretty JSON under
/// `{root}/proxy/{YYYY-MM-DD}/{method}_{path}_{HHMMSS}_{suffix}.json`.
pub struct FileTrafficSink {
    root: PathBuf,
}

impl FileTrafficSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path a record is written to.
    pub fn record_path(&self, record: &TrafficRecord) -> PathBuf {
        let date = record.timestamp.format("%Y-%m-%d").to_string();
        let file_name = format!(
            "{}_{}_{}_{}.json",
            record.request.method,
            correlation::sanitize_path(&record.request.path),
            record.timestamp.format("%H%M%S"),
            correlation::suffix(&record.correlation_id),
        );
        self.root.join("proxy").join(date).join(file_name)
    }
}

#[async_trait]
impl TrafficSink for FileTrafficSink {
    async fn write(&self, record: &TrafficRecord) -> Result<(), TrafficLogError> {
        let path = self.record_path(record);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let json = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&path, json).await?;
        tracing::debug!(path = %path.display(), "Traffic record written");
        Ok(())
    }
}

/// Non-blocking handle for submitting traffic records.
#[derive(Clone, Default)]
pub struct TrafficLogger {
    tx: Option<mpsc::Sender<TrafficRecord>>,
}

impl TrafficLogger {
    /// Create a logger and the receiving end for [`run_consumer`].
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<TrafficRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    /// A logger that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Queue a record. Never waits.
    pub fn submit(&self, record: TrafficRecord) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(e) = tx.try_send(record) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "consumer stopped",
            };
            tracing::warn!(reason, "Traffic record dropped");
            metrics::record_traffic_dropped();
        }
    }
}

/// Drain queued records into `sink` until shutdown or until every logger
/// is gone. Records still queued at shutdown are written first.
pub async fn run_consumer(
    mut rx: mpsc::Receiver<TrafficRecord>,
    sink: impl TrafficSink,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            record = rx.recv() => match record {
                Some(record) => write_record(&sink, &record).await,
                None => break,
            },
            _ = shutdown.recv() => {
                rx.close();
                while let Some(record) = rx.recv().await {
                    write_record(&sink, &record).await;
                }
                break;
            }
        }
    }
    tracing::debug!("Traffic log consumer stopped");
}

async fn write_record(sink: &impl TrafficSink, record: &TrafficRecord) {
    if let Err(e) = sink.write(record).await {
        tracing::error!(
            correlation_id = %record.correlation_id,
            error = %e,
            "Failed to write traffic record"
        );
    }
}
