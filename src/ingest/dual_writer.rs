//! Dual-write engine
//!
//! Every event is written to both the relational store and the search
//! backend with independent accounting: `pg_ok + pg_fail == 1` and
//! `os_ok + os_fail == 1` per event. A write call succeeds when either
//! backend accepts the event; it fails only when both reject it.

use crate::models::NormalizedEvent;
use crate::utils::backoff::Backoff;
use crate::utils::error::{EngineError, EngineResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use super::relational::LogStore;
use super::search::{BulkIndexer, to_search_document};

/// Per-backend write counters, bumped exactly once per event per backend
#[derive(Debug, Default)]
pub struct WriteCounters {
    pub pg_ok: AtomicU64,
    pub pg_fail: AtomicU64,
    pub os_ok: AtomicU64,
    pub os_fail: AtomicU64,
}

impl WriteCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            pg_ok: self.pg_ok.load(Ordering::Relaxed),
            pg_fail: self.pg_fail.load(Ordering::Relaxed),
            os_ok: self.os_ok.load(Ordering::Relaxed),
            os_fail: self.os_fail.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub pg_ok: u64,
    pub pg_fail: u64,
    pub os_ok: u64,
    pub os_fail: u64,
}

/// Health of a single backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

const DEGRADED_AFTER_FAILURES: u32 = 3;
const UNHEALTHY_AFTER_FAILURES: u32 = 10;

/// Consecutive-failure health tracker. Fatal errors go straight to
/// unhealthy; any success resets the counter.
#[derive(Debug)]
pub struct BackendHealth {
    backend: &'static str,
    consecutive_failures: AtomicU32,
    fatal: std::sync::atomic::AtomicBool,
}

impl BackendHealth {
    pub fn new(backend: &'static str) -> Self {
        Self {
            backend,
            consecutive_failures: AtomicU32::new(0),
            fatal: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn record_success(&self) {
        let previous = self.consecutive_failures.swap(0, Ordering::Relaxed);
        let was_fatal = self.fatal.swap(false, Ordering::Relaxed);
        if previous >= DEGRADED_AFTER_FAILURES || was_fatal {
            tracing::info!("{} backend recovered", self.backend);
        }
    }

    pub fn record_failure(&self, err: &EngineError) {
        if matches!(err, EngineError::BackendFatal { .. }) {
            self.fatal.store(true, Ordering::Relaxed);
            tracing::error!("{} backend marked unhealthy: {}", self.backend, err);
            return;
        }
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures == DEGRADED_AFTER_FAILURES {
            tracing::warn!("{} backend degraded after {} consecutive failures", self.backend, failures);
        }
    }

    pub fn state(&self) -> HealthState {
        if self.fatal.load(Ordering::Relaxed) {
            return HealthState::Unhealthy;
        }
        let failures = self.consecutive_failures.load(Ordering::Relaxed);
        if failures >= UNHEALTHY_AFTER_FAILURES {
            HealthState::Unhealthy
        } else if failures >= DEGRADED_AFTER_FAILURES {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }
}

/// Combined health of the ingest path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestHealth {
    pub relational: HealthState,
    pub search: HealthState,
}

impl IngestHealth {
    pub fn overall(&self) -> HealthState {
        match (self.relational, self.search) {
            (HealthState::Healthy, HealthState::Healthy) => HealthState::Healthy,
            (HealthState::Unhealthy, HealthState::Unhealthy) => HealthState::Unhealthy,
            _ => HealthState::Degraded,
        }
    }
}

/// Receipt for a single event write
#[derive(Debug, Clone, Copy)]
pub struct WriteReceipt {
    pub relational_ok: bool,
    pub search_accepted: bool,
}

pub struct DualWriteEngine {
    log_store: Arc<dyn LogStore>,
    indexer: Arc<BulkIndexer>,
    counters: Arc<WriteCounters>,
    relational_health: Arc<BackendHealth>,
    search_health: Arc<BackendHealth>,
    write_backoff: Backoff,
}

impl DualWriteEngine {
    pub fn new(
        log_store: Arc<dyn LogStore>,
        indexer: Arc<BulkIndexer>,
        counters: Arc<WriteCounters>,
        relational_health: Arc<BackendHealth>,
        search_health: Arc<BackendHealth>,
    ) -> Self {
        Self {
            log_store,
            indexer,
            counters,
            relational_health,
            search_health,
            // Short retry budget: a dead backend must not block the
            // pipeline for more than one flush interval.
            write_backoff: Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 2),
        }
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub fn health(&self) -> IngestHealth {
        IngestHealth {
            relational: self.relational_health.state(),
            search: self.search_health.state(),
        }
    }

    /// Write one event to both backends. The search document is buffered
    /// for the next bulk flush; the relational row is written inline.
    pub async fn write_log(&self, event: &NormalizedEvent) -> EngineResult<WriteReceipt> {
        let doc = to_search_document(event);

        let (relational_ok, search_accepted) =
            tokio::join!(self.write_relational_one(event), self.indexer.push(doc));

        if relational_ok || search_accepted {
            Ok(WriteReceipt { relational_ok, search_accepted })
        } else {
            Err(EngineError::transient("relational", "both backends rejected the write"))
        }
    }

    /// Write a batch: the relational side runs in a single transaction
    /// and settles all-or-nothing, the search side buffers per document.
    pub async fn write_batch(&self, events: &[NormalizedEvent]) -> EngineResult<WriteReceipt> {
        if events.is_empty() {
            return Ok(WriteReceipt { relational_ok: true, search_accepted: true });
        }

        let relational = async {
            let result = self
                .write_backoff
                .retry("relational batch write", || self.log_store.write_batch(events))
                .await;
            match result {
                Ok(()) => {
                    self.counters.pg_ok.fetch_add(events.len() as u64, Ordering::Relaxed);
                    self.relational_health.record_success();
                    true
                }
                Err(err) => {
                    self.counters.pg_fail.fetch_add(events.len() as u64, Ordering::Relaxed);
                    self.relational_health.record_failure(&err);
                    tracing::warn!("Relational batch write of {} rows failed: {}", events.len(), err);
                    false
                }
            }
        };

        let search = async {
            let mut all_accepted = true;
            for event in events {
                if !self.indexer.push(to_search_document(event)).await {
                    all_accepted = false;
                }
            }
            all_accepted
        };

        let (relational_ok, search_accepted) = tokio::join!(relational, search);

        if relational_ok || search_accepted {
            Ok(WriteReceipt { relational_ok, search_accepted })
        } else {
            Err(EngineError::transient("relational", "both backends rejected the batch"))
        }
    }

    /// Flush any buffered search documents now
    pub async fn flush_search(&self) {
        self.indexer.flush().await;
    }

    async fn write_relational_one(&self, event: &NormalizedEvent) -> bool {
        let result = self
            .write_backoff
            .retry("relational write", || self.log_store.write(event))
            .await;
        match result {
            Ok(()) => {
                self.counters.pg_ok.fetch_add(1, Ordering::Relaxed);
                self.relational_health.record_success();
                true
            }
            Err(err) => {
                self.counters.pg_fail.fetch_add(1, Ordering::Relaxed);
                self.relational_health.record_failure(&err);
                tracing::debug!("Relational write failed for event {}: {}", event.id, err);
                false
            }
        }
    }
}
