//! Configuration file watcher for hot reload.
//!
//! Only the `[proxy]` section is applied to a running server. A reload that
//! changes any other section is logged with the section names and otherwise
//! ignored until the next restart.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::{ProxyConfig, ProxySettings};

/// Watches the configuration file and forwards changed `[proxy]` sections.
#[derive(Clone)]
pub struct ConfigWatcher {
    path: PathBuf,
    current: Arc<ArcSwap<ProxyConfig>>,
    update_tx: mpsc::UnboundedSender<ProxySettings>,
}

impl ConfigWatcher {
    /// Create a watcher for `path`, with `initial` as the running config.
    ///
    /// Returns the watcher and a receiver for changed `[proxy]` sections.
    pub fn new(
        path: &Path,
        initial: ProxyConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ProxySettings>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        (
            Self {
                path: path.to_path_buf(),
                current: Arc::new(ArcSwap::from_pointee(initial)),
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching the file. The returned watcher must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let reloader = self.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        reloader.reload();
                    }
                }
                Err(e) => tracing::error!(error = ?e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "Config watcher started");
        Ok(watcher)
    }

    /// Re-read the file and forward its `[proxy]` section if it changed.
    ///
    /// An unreadable or invalid file keeps the current configuration.
    pub fn reload(&self) {
        tracing::info!(path = ?self.path, "Config file change detected, reloading");

        let next = match load_config(&self.path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, "Failed to reload config, keeping current configuration");
                return;
            }
        };

        let current = self.current.load();
        let pending = restart_sections(&current, &next);
        if !pending.is_empty() {
            tracing::warn!(
                sections = ?pending,
                "Changed sections are only applied on restart"
            );
        }

        if current.proxy != next.proxy {
            tracing::info!(enabled = next.proxy.enabled, "Applying new [proxy] settings");
            let _ = self.update_tx.send(next.proxy.clone());
        }

        self.current.store(Arc::new(next));
    }
}

/// Sections that differ between `current` and `next` and are not reloaded
/// live.
pub fn restart_sections(current: &ProxyConfig, next: &ProxyConfig) -> Vec<&'static str> {
    let mut changed = Vec::new();
    if current.listener != next.listener {
        changed.push("listener");
    }
    if current.api != next.api {
        changed.push("api");
    }
    if current.rate_limit != next.rate_limit {
        changed.push("rate_limit");
    }
    if current.traffic_log != next.traffic_log {
        changed.push("traffic_log");
    }
    if current.observability != next.observability {
        changed.push("observability");
    }
    changed
}
