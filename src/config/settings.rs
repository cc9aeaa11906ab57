//! Live proxy settings.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::schema::ProxySettings;
use crate::security::allow_list::AllowListCache;

/// Shared handle to the current [`ProxySettings`] snapshot.
///
/// Readers call [`SettingsHandle::snapshot`] once per request and keep the
/// returned `Arc` for the rest of it. Reloads replace the whole snapshot.
pub struct SettingsHandle {
    current: ArcSwap<ProxySettings>,
    allow_list: AllowListCache,
}

impl SettingsHandle {
    pub fn new(settings: ProxySettings) -> Self {
        Self {
            current: ArcSwap::from_pointee(settings),
            allow_list: AllowListCache::new(),
        }
    }

    /// Current settings snapshot.
    pub fn snapshot(&self) -> Arc<ProxySettings> {
        self.current.load_full()
    }

    /// Replace the settings. In-flight requests keep their old snapshot.
    pub fn update(&self, settings: ProxySettings) {
        let previous = self.current.swap(Arc::new(settings));
        let current = self.current.load();
        if *previous != **current {
            tracing::info!(
                enabled = current.enabled,
                upstream = %current.upstream_base_url,
                allowed_serials = current.allowed_serials.as_deref().unwrap_or("*"),
                "Proxy settings reloaded"
            );
        }
    }

    /// Check a device serial against the allow-list of `settings`.
    pub fn is_serial_allowed(&self, settings: &ProxySettings, serial: Option<&str>) -> bool {
        self.allow_list
            .is_allowed(settings.allowed_serials.as_deref(), serial)
    }
}

impl Default for SettingsHandle {
    fn default() -> Self {
        Self::new(ProxySettings::default())
    }
}
