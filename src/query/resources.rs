//! Resource manager
//!
//! Admission control for query execution: a global concurrency
//! semaphore plus a memory budget. Admitted queries hold a
//! `ResourceLease` for their lifetime; dropping the lease releases the
//! permit and the reserved memory. A degraded ingest path shrinks
//! admission to high-priority work.

use crate::ingest::dual_writer::HealthState;
use crate::utils::error::{EngineError, EngineResult};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryPriority {
    High,
    Normal,
    Low,
}

impl Default for QueryPriority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Admission handle held for the lifetime of a query.
///
/// Dropping the lease releases the semaphore permit and the reserved
/// memory, and removes the query from the active set.
#[derive(Debug)]
pub struct ResourceLease {
    pub query_id: Uuid,
    pub reserved_memory: u64,
    pub priority: QueryPriority,
    pub deadline: DateTime<Utc>,
    pub cancel_token: CancellationToken,
    _permit: OwnedSemaphorePermit,
    manager: Arc<ResourceManagerInner>,
}

impl ResourceLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        self.manager.memory_used.fetch_sub(self.reserved_memory, Ordering::Relaxed);
        self.manager.active.remove(&self.query_id);
        tracing::debug!("Released lease for query {}", self.query_id);
    }
}

#[derive(Debug)]
struct ActiveQuery {
    cancel_token: CancellationToken,
    priority: QueryPriority,
    deadline: DateTime<Utc>,
}

#[derive(Debug)]
struct ResourceManagerInner {
    semaphore: Arc<Semaphore>,
    memory_used: AtomicU64,
    max_memory_bytes: u64,
    active: DashMap<Uuid, ActiveQuery>,
    /// Ingest health, updated by the runtime's health relay
    ingest_health: std::sync::atomic::AtomicU8,
}

const HEALTH_HEALTHY: u8 = 0;
const HEALTH_DEGRADED: u8 = 1;
const HEALTH_UNHEALTHY: u8 = 2;

pub struct ResourceManager {
    inner: Arc<ResourceManagerInner>,
    default_timeout_ms: u64,
}

impl ResourceManager {
    pub fn new(max_concurrent: usize, max_memory_bytes: u64, default_timeout_ms: u64) -> Self {
        Self {
            inner: Arc::new(ResourceManagerInner {
                semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
                memory_used: AtomicU64::new(0),
                max_memory_bytes,
                active: DashMap::new(),
                ingest_health: std::sync::atomic::AtomicU8::new(HEALTH_HEALTHY),
            }),
            default_timeout_ms,
        }
    }

    /// Relay of the ingest health signal: a degraded backend keeps
    /// low-priority analytics out of the way of the write path.
    pub fn set_ingest_health(&self, health: HealthState) {
        let encoded = match health {
            HealthState::Healthy => HEALTH_HEALTHY,
            HealthState::Degraded => HEALTH_DEGRADED,
            HealthState::Unhealthy => HEALTH_UNHEALTHY,
        };
        self.inner.ingest_health.store(encoded, Ordering::Relaxed);
    }

    /// Request admission for a query. Fails with a capacity error
    /// (`RESOURCE_EXHAUSTED`) when the concurrency or memory budget is
    /// spent.
    pub fn request(
        &self,
        query_id: Uuid,
        priority: QueryPriority,
        est_memory: u64,
        timeout_ms: Option<u64>,
    ) -> EngineResult<ResourceLease> {
        let health = self.inner.ingest_health.load(Ordering::Relaxed);
        if health == HEALTH_DEGRADED && priority == QueryPriority::Low {
            return Err(EngineError::capacity(
                "RESOURCE_EXHAUSTED: ingest degraded, low-priority queries deferred",
                Some(30),
            ));
        }
        if health == HEALTH_UNHEALTHY && priority != QueryPriority::High {
            return Err(EngineError::capacity(
                "RESOURCE_EXHAUSTED: ingest unhealthy, only high-priority queries admitted",
                Some(60),
            ));
        }

        let permit = Arc::clone(&self.inner.semaphore)
            .try_acquire_owned()
            .map_err(|_| {
                EngineError::capacity("RESOURCE_EXHAUSTED: too many concurrent queries", Some(5))
            })?;

        let used = self.inner.memory_used.fetch_add(est_memory, Ordering::Relaxed) + est_memory;
        if used > self.inner.max_memory_bytes {
            self.inner.memory_used.fetch_sub(est_memory, Ordering::Relaxed);
            return Err(EngineError::capacity(
                "RESOURCE_EXHAUSTED: query memory budget exceeded",
                Some(10),
            ));
        }

        let timeout = timeout_ms.unwrap_or(self.default_timeout_ms);
        let deadline = Utc::now() + Duration::milliseconds(timeout as i64);
        let cancel_token = CancellationToken::new();

        self.inner.active.insert(
            query_id,
            ActiveQuery { cancel_token: cancel_token.clone(), priority, deadline },
        );

        Ok(ResourceLease {
            query_id,
            reserved_memory: est_memory,
            priority,
            deadline,
            cancel_token,
            _permit: permit,
            manager: Arc::clone(&self.inner),
        })
    }

    /// Cancel a running query by id
    pub fn cancel(&self, query_id: Uuid) -> bool {
        if let Some(entry) = self.inner.active.get(&query_id) {
            entry.cancel_token.cancel();
            true
        } else {
            false
        }
    }

    /// Cancel every query past its deadline (periodic sweep backstop;
    /// the executor also enforces deadlines inline)
    pub fn cancel_expired(&self, now: DateTime<Utc>) -> usize {
        let mut cancelled = 0;
        for entry in self.inner.active.iter() {
            if now >= entry.deadline && !entry.cancel_token.is_cancelled() {
                entry.cancel_token.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn active_queries(&self) -> usize {
        self.inner.active.len()
    }

    pub fn memory_used(&self) -> u64 {
        self.inner.memory_used.load(Ordering::Relaxed)
    }

    pub fn available_permits(&self) -> usize {
        self.inner.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_and_release() {
        let manager = ResourceManager::new(2, 1_000_000, 60_000);

        let lease1 = manager
            .request(Uuid::new_v4(), QueryPriority::Normal, 1_000, None)
            .unwrap();
        let _lease2 = manager
            .request(Uuid::new_v4(), QueryPriority::Normal, 1_000, None)
            .unwrap();
        assert_eq!(manager.active_queries(), 2);
        assert_eq!(manager.memory_used(), 2_000);

        let denied = manager.request(Uuid::new_v4(), QueryPriority::Normal, 1_000, None);
        assert_eq!(denied.unwrap_err().class(), "CAPACITY");

        drop(lease1);
        assert_eq!(manager.active_queries(), 1);
        assert_eq!(manager.memory_used(), 1_000);
        assert!(manager
            .request(Uuid::new_v4(), QueryPriority::Normal, 1_000, None)
            .is_ok());
    }

    #[test]
    fn test_memory_budget_enforced() {
        let manager = ResourceManager::new(10, 1_000, 60_000);
        let denied = manager.request(Uuid::new_v4(), QueryPriority::Normal, 2_000, None);
        let err = denied.unwrap_err();
        assert_eq!(err.class(), "CAPACITY");
        assert_eq!(manager.memory_used(), 0);
        // The failed admission did not leak a permit
        assert_eq!(manager.available_permits(), 10);
    }

    #[test]
    fn test_cancel_by_query_id() {
        let manager = ResourceManager::new(2, 1_000_000, 60_000);
        let query_id = Uuid::new_v4();
        let lease = manager
            .request(query_id, QueryPriority::Normal, 100, None)
            .unwrap();

        assert!(!lease.cancel_token.is_cancelled());
        assert!(manager.cancel(query_id));
        assert!(lease.cancel_token.is_cancelled());
        assert!(!manager.cancel(Uuid::new_v4()));
    }

    #[test]
    fn test_deadline_sweep_cancels_expired() {
        let manager = ResourceManager::new(2, 1_000_000, 50);
        let lease = manager
            .request(Uuid::new_v4(), QueryPriority::Normal, 100, Some(50))
            .unwrap();

        assert_eq!(manager.cancel_expired(Utc::now()), 0);
        let later = Utc::now() + Duration::seconds(1);
        assert_eq!(manager.cancel_expired(later), 1);
        assert!(lease.cancel_token.is_cancelled());
        assert!(lease.is_expired(later));
    }

    #[test]
    fn test_degraded_health_defers_low_priority() {
        let manager = ResourceManager::new(4, 1_000_000, 60_000);
        manager.set_ingest_health(HealthState::Degraded);

        let low = manager.request(Uuid::new_v4(), QueryPriority::Low, 100, None);
        assert_eq!(low.unwrap_err().class(), "CAPACITY");
        assert!(manager
            .request(Uuid::new_v4(), QueryPriority::Normal, 100, None)
            .is_ok());

        manager.set_ingest_health(HealthState::Unhealthy);
        let normal = manager.request(Uuid::new_v4(), QueryPriority::Normal, 100, None);
        assert_eq!(normal.unwrap_err().class(), "CAPACITY");
        assert!(manager
            .request(Uuid::new_v4(), QueryPriority::High, 100, None)
            .is_ok());

        manager.set_ingest_health(HealthState::Healthy);
        assert!(manager
            .request(Uuid::new_v4(), QueryPriority::Low, 100, None)
            .is_ok());
    }
}
