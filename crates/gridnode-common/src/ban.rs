//! Request-flood ban list.
//!
//! Tracks source addresses that keep hitting unmapped GET endpoints. After
//! `count_to_ban` strikes inside the window, further GETs from that address
//! are answered 429 until the window expires. Entries expire on their own, so
//! a well-behaved address is forgotten.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

/// Default number of 404s before a source is banned.
pub const DEFAULT_COUNT_TO_BAN: u32 = 5;

/// Default ban/tracking window.
pub const DEFAULT_BAN_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct BanEntry {
    count: u32,
    stamp: Instant,
}

/// Per-source-address strike list.
///
/// Thread-safe; shared between the HTTP connection tasks.
pub struct BanList {
    count_to_ban: u32,
    window: Duration,
    entries: Mutex<HashMap<String, BanEntry>>,
}

impl BanList {
    pub fn new(count_to_ban: u32, window: Duration) -> Self {
        Self {
            count_to_ban,
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Whether requests from this source should currently be refused.
    ///
    /// Expired entries are dropped here, so an address that went quiet for a
    /// full window starts clean.
    pub fn is_banned(&self, source: &str) -> bool {
        let mut entries = self.entries.lock().expect("ban list lock poisoned");
        let Some(entry) = entries.get_mut(source) else {
            return false;
        };

        if entry.stamp.elapsed() > self.window {
            entries.remove(source);
            tracing::debug!("ban list entry expired: {}", source);
            return false;
        }

        // first refusal of this ban period: restamp so the ban lasts a full
        // window from the point of banning
        if entry.count == self.count_to_ban {
            tracing::debug!("ban list banning: {}", source);
            entry.count += 1;
            entry.stamp = Instant::now();
        }

        entry.count >= self.count_to_ban
    }

    /// Records one strike against a source address.
    pub fn track(&self, source: &str) {
        let mut entries = self.entries.lock().expect("ban list lock poisoned");
        entries
            .entry(source.to_string())
            .and_modify(|e| {
                e.count += 1;
                e.stamp = Instant::now();
            })
            .or_insert_with(|| {
                tracing::debug!("ban list tracking: {}", source);
                BanEntry {
                    count: 1,
                    stamp: Instant::now(),
                }
            });
    }

    /// Drops all expired entries.
    pub fn cleanup(&self) {
        let mut entries = self.entries.lock().expect("ban list lock poisoned");
        entries.retain(|_, e| e.stamp.elapsed() <= self.window);
    }

    /// Banned and tracked addresses as a JSON summary for the status
    /// endpoint.
    pub fn summary(&self) -> Value {
        self.cleanup();
        let entries = self.entries.lock().expect("ban list lock poisoned");
        let mut banned = Vec::new();
        let mut tracked = Vec::new();
        for (addr, entry) in entries.iter() {
            if entry.count >= self.count_to_ban {
                banned.push(addr.clone());
            } else {
                tracked.push(addr.clone());
            }
        }
        banned.sort();
        tracked.sort();
        json!({ "banned": banned, "tracked": tracked })
    }
}

impl Default for BanList {
    fn default() -> Self {
        Self::new(DEFAULT_COUNT_TO_BAN, DEFAULT_BAN_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untracked_source_not_banned() {
        let bans = BanList::default();
        assert!(!bans.is_banned("10.0.0.1"));
    }

    #[test]
    fn test_ban_after_strikes() {
        let bans = BanList::default();
        for _ in 0..4 {
            bans.track("10.0.0.1");
        }
        assert!(!bans.is_banned("10.0.0.1"));
        bans.track("10.0.0.1");
        assert!(bans.is_banned("10.0.0.1"));
        // stays banned on subsequent checks
        assert!(bans.is_banned("10.0.0.1"));
    }

    #[test]
    fn test_sources_tracked_independently() {
        let bans = BanList::default();
        for _ in 0..5 {
            bans.track("10.0.0.1");
        }
        assert!(bans.is_banned("10.0.0.1"));
        assert!(!bans.is_banned("10.0.0.2"));
    }

    #[test]
    fn test_expiry_unbans() {
        let bans = BanList::new(2, Duration::from_millis(10));
        bans.track("10.0.0.9");
        bans.track("10.0.0.9");
        assert!(bans.is_banned("10.0.0.9"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!bans.is_banned("10.0.0.9"));
    }

    #[test]
    fn test_summary_shape() {
        let bans = BanList::default();
        for _ in 0..5 {
            bans.track("10.0.0.1");
        }
        bans.track("10.0.0.2");
        // trip the banned flag
        assert!(bans.is_banned("10.0.0.1"));

        let summary = bans.summary();
        assert_eq!(summary["banned"], serde_json::json!(["10.0.0.1"]));
        assert_eq!(summary["tracked"], serde_json::json!(["10.0.0.2"]));
    }
}
