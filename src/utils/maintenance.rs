//! Background maintenance scheduler
//!
//! The pipeline runs six periodic jobs: search bulk flush, rule
//! snapshot polling, event buffer GC, incident window expiry, rule
//! metrics flush, and query-cache housekeeping. Each one implements
//! `MaintenanceTask`; the scheduler drives them on their intervals,
//! keeps per-task run and failure counters for the health surface, and
//! stops them all through one cancellation token at shutdown.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// One periodic pipeline job
#[async_trait]
pub trait MaintenanceTask: Send + Sync + 'static {
    /// Stable task name, used as the stats key and in logs
    fn name(&self) -> &'static str;

    /// Run one tick of the task
    async fn tick(&self) -> Result<(), anyhow::Error>;
}

/// Run and failure accounting for one task
#[derive(Debug, Clone, Default)]
pub struct TaskStats {
    pub runs: u64,
    pub failures: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Owns every spawned maintenance loop. Dropping the scheduler does not
/// stop the loops; call `shutdown()`.
pub struct MaintenanceScheduler {
    shutdown: CancellationToken,
    stats: Arc<DashMap<&'static str, TaskStats>>,
}

impl Default for MaintenanceScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl MaintenanceScheduler {
    pub fn new() -> Self {
        Self { shutdown: CancellationToken::new(), stats: Arc::new(DashMap::new()) }
    }

    /// Spawn a task loop firing every `every`, starting one interval
    /// from now. A failing tick is counted and logged, never fatal; a
    /// tick that overruns its interval delays the next one instead of
    /// bursting to catch up.
    pub fn spawn(&self, task: Arc<dyn MaintenanceTask>, every: Duration) {
        let name = task.name();
        self.stats.entry(name).or_default();

        let shutdown = self.shutdown.child_token();
        let stats = Arc::clone(&self.stats);
        tokio::spawn(async move {
            tracing::info!("Maintenance task '{}' scheduled every {:?}", name, every);
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately;
            // swallow it so the task waits a full interval before its
            // first run.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let result = task.tick().await;
                        if let Some(mut entry) = stats.get_mut(name) {
                            entry.runs += 1;
                            entry.last_run_at = Some(Utc::now());
                            match &result {
                                Ok(()) => entry.last_error = None,
                                Err(err) => {
                                    entry.failures += 1;
                                    entry.last_error = Some(err.to_string());
                                }
                            }
                        }
                        if let Err(err) = result {
                            tracing::error!("Maintenance task '{}' failed: {}", name, err);
                        }
                    }
                }
            }
            tracing::info!("Maintenance task '{}' stopped", name);
        });
    }

    /// Stop every spawned loop
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn task_count(&self) -> usize {
        self.stats.len()
    }

    /// Per-task accounting snapshot for the health surface
    pub fn stats(&self) -> Vec<(&'static str, TaskStats)> {
        self.stats
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingTask {
        ticks: AtomicU32,
        fail_on: Option<u32>,
    }

    #[async_trait]
    impl MaintenanceTask for CountingTask {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn tick(&self) -> Result<(), anyhow::Error> {
            let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
            if self.fail_on == Some(tick) {
                anyhow::bail!("tick {} failed", tick);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_runs_on_interval_until_shutdown() {
        let scheduler = MaintenanceScheduler::new();
        let task = Arc::new(CountingTask { ticks: AtomicU32::new(0), fail_on: None });
        scheduler.spawn(Arc::clone(&task) as Arc<dyn MaintenanceTask>, Duration::from_millis(10));
        assert_eq!(scheduler.task_count(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.shutdown();
        let ran = task.ticks.load(Ordering::Relaxed);
        assert!(ran >= 2, "only ran {} times", ran);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(task.ticks.load(Ordering::Relaxed), ran, "kept running after shutdown");
    }

    #[tokio::test]
    async fn test_failures_are_counted_not_fatal() {
        let scheduler = MaintenanceScheduler::new();
        let task = Arc::new(CountingTask { ticks: AtomicU32::new(0), fail_on: Some(1) });
        scheduler.spawn(Arc::clone(&task) as Arc<dyn MaintenanceTask>, Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.shutdown();

        // The loop survived the first-tick failure
        assert!(task.ticks.load(Ordering::Relaxed) >= 2);
        let stats = scheduler.stats();
        let (_, counting) = stats.iter().find(|(name, _)| *name == "counting").unwrap();
        assert_eq!(counting.failures, 1);
        assert!(counting.runs >= 2);
        // The error text is replaced by the next successful run
        assert!(counting.last_error.is_none());
    }
}
