//! Fixed-window request counting per client, endpoint and policy.
//!
//! Each counter is keyed by `(policy, client, endpoint, bucket)` where
//! `bucket = now / window_secs`. Counters live in a `DashMap`; the entry
//! guard holds the shard lock, so compare-and-increment is atomic for
//! concurrent requests in the same bucket. Idle counters are evicted by a
//! background sweep, never on the request path.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time;

/// Budget for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max_requests: u32,
    pub window_secs: u64,
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Limited { retry_after: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    policy: String,
    client: String,
    endpoint: &'static str,
    bucket: u64,
}

#[derive(Debug)]
struct WindowEntry {
    count: u32,
    window_secs: u64,
    last_seen: u64,
}

/// Shared table of window counters.
#[derive(Default)]
pub struct RateLimiter {
    windows: DashMap<WindowKey, WindowEntry>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request against `limit` using the current wall clock.
    pub fn check(
        &self,
        policy: &str,
        client: &str,
        endpoint: &'static str,
        limit: RateLimit,
    ) -> RateDecision {
        self.check_at(policy, client, endpoint, limit, unix_now())
    }

    /// Count a request against `limit` at `now` (seconds since epoch).
    pub fn check_at(
        &self,
        policy: &str,
        client: &str,
        endpoint: &'static str,
        limit: RateLimit,
        now: u64,
    ) -> RateDecision {
        let window_secs = limit.window_secs.max(1);
        let key = WindowKey {
            policy: policy.to_string(),
            client: client.to_string(),
            endpoint,
            bucket: now / window_secs,
        };

        let mut entry = self.windows.entry(key).or_insert(WindowEntry {
            count: 0,
            window_secs,
            last_seen: now,
        });
        entry.last_seen = now;

        if entry.count >= limit.max_requests {
            RateDecision::Limited {
                retry_after: window_secs,
            }
        } else {
            entry.count += 1;
            RateDecision::Allowed {
                remaining: limit.max_requests - entry.count,
            }
        }
    }

    /// Drop counters idle for at least their window length.
    pub fn sweep_at(&self, now: u64) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, entry| now.saturating_sub(entry.last_seen) < entry.window_secs);
        before.saturating_sub(self.windows.len())
    }

    /// Number of live counters.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Periodically evict idle counters until shutdown.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = self.sweep_at(unix_now());
                    if evicted > 0 {
                        tracing::debug!(evicted, remaining = self.len(), "Rate limit windows swept");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("Rate limit sweeper stopping");
                    break;
                }
            }
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: RateLimit = RateLimit {
        max_requests: 3,
        window_secs: 60,
    };

    #[test]
    fn test_fourth_request_is_limited() {
        let limiter = RateLimiter::new();
        let now = 6_000;

        for expected_remaining in [2, 1, 0] {
            assert_eq!(
                limiter.check_at("nest-device", "10.0.0.1", "ping", LIMIT, now),
                RateDecision::Allowed {
                    remaining: expected_remaining
                }
            );
        }
        assert_eq!(
            limiter.check_at("nest-device", "10.0.0.1", "ping", LIMIT, now + 10),
            RateDecision::Limited { retry_after: 60 }
        );
    }

    #[test]
    fn test_next_bucket_is_fresh() {
        let limiter = RateLimiter::new();
        let now = 6_000;
        for _ in 0..4 {
            limiter.check_at("p", "ip", "ping", LIMIT, now);
        }
        assert!(matches!(
            limiter.check_at("p", "ip", "ping", LIMIT, now + 60),
            RateDecision::Allowed { .. }
        ));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new();
        let now = 6_000;
        for _ in 0..3 {
            limiter.check_at("p", "ip-a", "ping", LIMIT, now);
        }
        assert!(matches!(
            limiter.check_at("p", "ip-a", "ping", LIMIT, now),
            RateDecision::Limited { .. }
        ));
        assert!(matches!(
            limiter.check_at("p", "ip-b", "ping", LIMIT, now),
            RateDecision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check_at("p", "ip-a", "upload", LIMIT, now),
            RateDecision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check_at("other", "ip-a", "ping", LIMIT, now),
            RateDecision::Allowed { .. }
        ));
    }

    #[test]
    fn test_sweep_evicts_idle_windows() {
        let limiter = RateLimiter::new();
        limiter.check_at("p", "ip", "ping", LIMIT, 6_000);
        limiter.check_at("p", "ip", "upload", LIMIT, 6_030);

        assert_eq!(limiter.sweep_at(6_059), 0);
        assert_eq!(limiter.sweep_at(6_060), 1);
        assert_eq!(limiter.len(), 1);
        assert_eq!(limiter.sweep_at(6_090), 1);
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_concurrent_requests_do_not_lose_updates() {
        let limiter = Arc::new(RateLimiter::new());
        let limit = RateLimit {
            max_requests: 100,
            window_secs: 60,
        };

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .filter(|_| {
                            matches!(
                                limiter.check_at("p", "ip", "ping", limit, 6_000),
                                RateDecision::Allowed { .. }
                            )
                        })
                        .count()
                })
            })
            .collect();

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 100);
    }
}
