//! Query result cache
//!
//! Keyed by a stable hash of the optimized SQL plus the time range and
//! parameter bindings. Entries live for a short TTL; oversized results
//! are returned to the caller but never memoized. A schema version bump
//! (external signal) invalidates everything; data changes do not.

use crate::query::analyzer::TimeRange;
use crate::query::executor::QueryResult;
use crate::query::planner::stable_hash;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub const DEFAULT_RESULT_TTL_SECS: u64 = 300;

struct CachedEntry {
    result: Arc<QueryResult>,
    cached_at: DateTime<Utc>,
}

pub struct ResultCache {
    entries: DashMap<String, CachedEntry>,
    ttl: Duration,
    /// Results above this row count are not memoized
    max_rows: usize,
    schema_version: AtomicU64,
    pub hits: AtomicU64,
    pub misses: AtomicU64,
}

impl ResultCache {
    pub fn new(ttl_secs: u64, max_rows: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Duration::seconds(ttl_secs.max(1) as i64),
            max_rows,
            schema_version: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Build the cache key. Parameters are folded in sorted order so
    /// binding order does not fragment the cache.
    pub fn key(
        &self,
        sql_cache_key: &str,
        time_range: &TimeRange,
        parameters: &BTreeMap<String, Value>,
    ) -> String {
        let mut material = String::with_capacity(64);
        material.push_str(sql_cache_key);
        material.push('|');
        material.push_str(&time_range.start.timestamp_millis().to_string());
        material.push('|');
        material.push_str(&time_range.end.timestamp_millis().to_string());
        for (name, value) in parameters {
            material.push('|');
            material.push_str(name);
            material.push('=');
            material.push_str(&value.to_string());
        }
        format!(
            "v{}:{:016x}",
            self.schema_version.load(Ordering::Acquire),
            stable_hash(&material)
        )
    }

    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<Arc<QueryResult>> {
        let hit = {
            let entry = self.entries.get(key)?;
            if now - entry.cached_at >= self.ttl {
                None
            } else {
                Some(Arc::clone(&entry.result))
            }
        };
        match hit {
            Some(result) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(result)
            }
            None => {
                self.entries
                    .remove_if(key, |_, entry| now - entry.cached_at >= self.ttl);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Memoize a result unless it exceeds the row ceiling
    pub fn put(&self, key: String, result: Arc<QueryResult>, now: DateTime<Utc>) -> bool {
        if result.row_count > self.max_rows {
            tracing::debug!(
                "Result with {} rows exceeds cache ceiling {}, not memoized",
                result.row_count,
                self.max_rows
            );
            return false;
        }
        self.entries.insert(key, CachedEntry { result, cached_at: now });
        true
    }

    /// External schema-version signal: all existing keys become
    /// unreachable and the map is cleared.
    pub fn invalidate_schema(&self, version: u64) {
        self.schema_version.store(version, Ordering::Release);
        self.entries.clear();
        tracing::info!("Result cache invalidated for schema version {}", version);
    }

    /// Drop expired entries (periodic housekeeping)
    pub fn sweep(&self, now: DateTime<Utc>) {
        self.entries.retain(|_, entry| now - entry.cached_at < self.ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
