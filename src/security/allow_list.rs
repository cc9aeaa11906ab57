//! Device serial allow-list with a value-versioned parse cache.
//!
//! The raw `allowed_serials` string is parsed only when its value changes.
//! The parsed set lives behind an `ArcSwap`, so the read path never locks.
//! A compare-and-swap flag admits one recompute at a time; readers that lose
//! the race use the previous set until the new one is published.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

/// A parsed allow-list together with the raw value it was built from.
#[derive(Debug, Default)]
pub struct ParsedAllowList {
    raw: Option<String>,
    allow_all: bool,
    serials: HashSet<String>,
}

impl ParsedAllowList {
    /// Parse a comma-separated list. Blank or `*` allows every serial.
    pub fn parse(raw: Option<&str>) -> Self {
        let allow_all = is_unrestricted(raw);
        let serials = if allow_all {
            HashSet::new()
        } else {
            raw.unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_lowercase)
                .collect()
        };

        Self {
            raw: raw.map(str::to_string),
            allow_all,
            serials,
        }
    }

    /// Case-insensitive membership. A missing serial never matches a
    /// restrictive list.
    pub fn contains(&self, serial: Option<&str>) -> bool {
        if self.allow_all {
            return true;
        }
        match serial.map(str::trim).filter(|s| !s.is_empty()) {
            Some(serial) => self.serials.contains(&serial.to_lowercase()),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.serials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.serials.is_empty()
    }
}

fn is_unrestricted(raw: Option<&str>) -> bool {
    match raw.map(str::trim) {
        None => true,
        Some(s) => s.is_empty() || s == "*",
    }
}

/// Concurrent cache of the parsed allow-list.
pub struct AllowListCache {
    current: ArcSwap<ParsedAllowList>,
    recomputing: AtomicBool,
}

impl AllowListCache {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(ParsedAllowList::parse(None)),
            recomputing: AtomicBool::new(false),
        }
    }

    /// Check `serial` against the list described by `raw`.
    pub fn is_allowed(&self, raw: Option<&str>, serial: Option<&str>) -> bool {
        if is_unrestricted(raw) {
            return true;
        }
        self.resolve(raw).contains(serial)
    }

    /// The parsed list for `raw`, recomputing it if the value changed.
    pub fn resolve(&self, raw: Option<&str>) -> Arc<ParsedAllowList> {
        let cached = self.current.load_full();
        if cached.raw.as_deref() == raw {
            return cached;
        }

        if self
            .recomputing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another reader is already parsing this change.
            return cached;
        }

        let parsed = Arc::new(ParsedAllowList::parse(raw));
        self.current.store(parsed.clone());
        self.recomputing.store(false, Ordering::Release);

        tracing::debug!(serials = parsed.len(), "Serial allow-list recomputed");
        parsed
    }
}

impl Default for AllowListCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_membership() {
        let cache = AllowListCache::new();
        assert!(cache.is_allowed(Some("AAA,BBB"), Some("bbb")));
        assert!(cache.is_allowed(Some("AAA,BBB"), Some("AAA")));
        assert!(!cache.is_allowed(Some("AAA,BBB"), Some("CCC")));
    }

    #[test]
    fn test_missing_serial() {
        let cache = AllowListCache::new();
        assert!(!cache.is_allowed(Some("AAA,BBB"), None));
        assert!(!cache.is_allowed(Some("AAA,BBB"), Some("  ")));
        assert!(cache.is_allowed(Some(""), None));
        assert!(cache.is_allowed(Some(" * "), None));
        assert!(cache.is_allowed(None, None));
    }

    #[test]
    fn test_entries_are_trimmed() {
        let list = ParsedAllowList::parse(Some(" AAA , ,bbb,"));
        assert_eq!(list.len(), 2);
        assert!(list.contains(Some("aaa")));
        assert!(list.contains(Some("BBB")));
    }

    #[test]
    fn test_recompute_only_on_value_change() {
        let cache = AllowListCache::new();
        let first = cache.resolve(Some("AAA"));
        let owned = String::from("AAA");
        let second = cache.resolve(Some(owned.as_str()));
        assert!(Arc::ptr_eq(&first, &second));

        let third = cache.resolve(Some("AAA,BBB"));
        assert!(!Arc::ptr_eq(&second, &third));
        assert!(third.contains(Some("bbb")));
    }

    #[test]
    fn test_reader_during_recompute_uses_previous_value() {
        let cache = AllowListCache::new();
        cache.resolve(Some("AAA"));

        cache.recomputing.store(true, Ordering::Release);
        let seen = cache.resolve(Some("BBB"));
        assert!(seen.contains(Some("AAA")));
        assert!(!seen.contains(Some("BBB")));

        cache.recomputing.store(false, Ordering::Release);
        assert!(cache.resolve(Some("BBB")).contains(Some("BBB")));
    }

    #[test]
    fn test_concurrent_readers() {
        let cache = Arc::new(AllowListCache::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    let raw = if i % 2 == 0 { "AAA,BBB" } else { "AAA" };
                    for _ in 0..1000 {
                        let list = cache.resolve(Some(raw));
                        assert!(list.contains(Some("AAA")));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
