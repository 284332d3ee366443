//! Rule-result cache
//!
//! Caches per-event rule outcomes keyed `rule_id:event_id:source` with a
//! TTL. Entries are swept lazily on read plus a full sweep every 1,000
//! processed events. Writers are last-writer-wins with a timestamp
//! guard, and the whole cache is replaced when a rule snapshot reloads.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

pub const DEFAULT_CACHE_EXPIRATION_MS: i64 = 5 * 60 * 1000;
const SWEEP_EVERY_EVENTS: u64 = 1_000;

#[derive(Debug, Clone, Copy)]
pub struct CachedRuleResult {
    pub matched: bool,
    pub confidence: f64,
    pub ts: DateTime<Utc>,
}

pub struct RuleCache {
    entries: DashMap<String, CachedRuleResult>,
    ttl: Duration,
    processed: AtomicU64,
}

impl RuleCache {
    pub fn new(ttl_ms: i64) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Duration::milliseconds(ttl_ms.max(1)),
            processed: AtomicU64::new(0),
        }
    }

    pub fn key(rule_id: Uuid, event_id: &str, source: &str) -> String {
        format!("{}:{}:{}", rule_id, event_id, source)
    }

    /// Fresh cached outcome, or None. Expired entries are removed on the
    /// way out so a stale result is never served past its TTL.
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<CachedRuleResult> {
        let hit = self.entries.get(key).map(|entry| *entry)?;
        if now - hit.ts >= self.ttl {
            self.entries.remove_if(key, |_, entry| now - entry.ts >= self.ttl);
            return None;
        }
        Some(hit)
    }

    /// Last-writer-wins insert: an entry with an older timestamp never
    /// replaces a newer one.
    pub fn insert(&self, key: String, result: CachedRuleResult) {
        match self.entries.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().ts <= result.ts {
                    occupied.insert(result);
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(result);
            }
        }
    }

    /// Called once per processed event; performs the periodic full sweep
    pub fn note_processed(&self, now: DateTime<Utc>) {
        let count = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
        if count % SWEEP_EVERY_EVENTS == 0 {
            self.sweep(now);
        }
    }

    /// Drop every expired entry
    pub fn sweep(&self, now: DateTime<Utc>) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| now - entry.ts < self.ttl);
        let swept = before.saturating_sub(self.entries.len());
        if swept > 0 {
            tracing::debug!("Rule cache sweep removed {} expired entries", swept);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_and_expiry() {
        let cache = RuleCache::new(1_000);
        let key = RuleCache::key(Uuid::new_v4(), "4625", "windows_event");
        let now = Utc::now();

        cache.insert(
            key.clone(),
            CachedRuleResult { matched: true, confidence: 0.8, ts: now },
        );

        let hit = cache.get(&key, now + Duration::milliseconds(500)).unwrap();
        assert!(hit.matched);

        // One millisecond past the TTL the entry is gone
        assert!(cache.get(&key, now + Duration::milliseconds(1_001)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_timestamp_guard_ignores_older_writers() {
        let cache = RuleCache::new(60_000);
        let key = "k".to_string();
        let now = Utc::now();

        cache.insert(
            key.clone(),
            CachedRuleResult { matched: true, confidence: 0.9, ts: now },
        );
        cache.insert(
            key.clone(),
            CachedRuleResult {
                matched: false,
                confidence: 0.1,
                ts: now - Duration::seconds(10),
            },
        );

        let hit = cache.get(&key, now).unwrap();
        assert!(hit.matched);
        assert!((hit.confidence - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn test_full_sweep_every_thousand_events() {
        let cache = RuleCache::new(10);
        let now = Utc::now();
        for i in 0..5 {
            cache.insert(
                format!("k{}", i),
                CachedRuleResult { matched: false, confidence: 0.0, ts: now },
            );
        }
        assert_eq!(cache.len(), 5);

        let later = now + Duration::seconds(1);
        for _ in 0..999 {
            cache.note_processed(later);
        }
        assert_eq!(cache.len(), 5);
        cache.note_processed(later);
        assert_eq!(cache.len(), 0);
    }
}
