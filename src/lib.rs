//! SecureWatch Core
//!
//! SIEM pipeline engines: ingestion with dual-write persistence, the
//! real-time correlation engine, and the LQL query engine.

use sqlx::PgPool;
use std::sync::Arc;

pub mod config;
pub mod correlation;
pub mod db;
pub mod ingest;
pub mod models;
pub mod query;
pub mod utils;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use config::Config;
pub use correlation::{CorrelationEngine, CorrelationHandle, IncidentManager, RuleStore};
pub use ingest::DualWriteEngine;
pub use query::QueryService;
pub use utils::{EngineError, EngineResult};

use correlation::{
    EventBuffer, InMemoryIncidentRepository, IncidentRepository, LoggingActionExecutor,
    PatternMatcher, PostgresIncidentRepository, start_workers,
};
use ingest::{
    BackendHealth, BulkIndexer, OpenSearchStore, PostgresLogStore, WriteCounters,
};
use query::{ExecutionEngine, ResourceManager, SqlxQueryBackend, TableSchema};
use utils::{MaintenanceScheduler, MaintenanceTask};

/// Columns of the `logs` table, used for semantic validation of LQL
fn logs_schema() -> TableSchema {
    TableSchema::default().with_table(
        "logs",
        vec![
            "id",
            "timestamp",
            "ingested_at",
            "source_type",
            "event_id",
            "severity",
            "category",
            "subcategory",
            "raw_message",
            "hostname",
            "user_name",
            "user_id",
            "user_domain",
            "process_name",
            "process_id",
            "process_command_line",
            "source_ip",
            "source_port",
            "destination_ip",
            "destination_port",
            "risk_score",
            "mitre_techniques",
            "metadata",
            "tags",
        ],
    )
}

/// Wired application components.
///
/// Every engine is constructor-injected; there is no module-level
/// mutable state. All components are Arc-wrapped for cheap cloning and
/// thread safety.
pub struct Runtime {
    pub config: Config,
    pub db: PgPool,

    pub dual_writer: Arc<DualWriteEngine>,
    pub bulk_indexer: Arc<BulkIndexer>,

    pub event_buffer: Arc<EventBuffer>,
    pub rule_store: Arc<RuleStore>,
    pub pattern_matcher: Arc<PatternMatcher>,
    pub incident_manager: Arc<IncidentManager>,
    pub correlation: Arc<CorrelationEngine>,
    pub correlation_handle: CorrelationHandle,

    pub resource_manager: Arc<ResourceManager>,
    pub query_service: Arc<QueryService>,
}

impl Runtime {
    /// Wire every engine from configuration and the shared pool. Rules
    /// are loaded once here; the poll task keeps them fresh afterwards.
    pub async fn new(config: Config, db: PgPool) -> Result<Self, anyhow::Error> {
        Self::build(config, db, false).await
    }

    /// Wiring variant with an in-memory incident repository, used when
    /// no durable incident storage is wanted (tests, dry runs).
    pub async fn new_ephemeral(config: Config, db: PgPool) -> Result<Self, anyhow::Error> {
        Self::build(config, db, true).await
    }

    async fn build(
        config: Config,
        db: PgPool,
        ephemeral_incidents: bool,
    ) -> Result<Self, anyhow::Error> {
        // Ingest path
        let counters = Arc::new(WriteCounters::default());
        let relational_health = Arc::new(BackendHealth::new("relational"));
        let search_health = Arc::new(BackendHealth::new("search"));
        let search_store = Arc::new(OpenSearchStore::new(config.stores.search_url.clone()));
        let bulk_indexer = Arc::new(BulkIndexer::new(
            search_store,
            config.ingest.bulk_size,
            Arc::clone(&counters),
            Arc::clone(&search_health),
        ));
        let dual_writer = Arc::new(DualWriteEngine::new(
            Arc::new(PostgresLogStore::new(db.clone())),
            Arc::clone(&bulk_indexer),
            counters,
            relational_health,
            search_health,
        ));

        // Correlation path
        let event_buffer = Arc::new(EventBuffer::new(config.correlation.memory_buffer_size_limit));
        let rule_store = Arc::new(RuleStore::new());
        match rule_store.reload_from_db(&db).await {
            Ok(count) => tracing::info!("Loaded {} correlation rules", count),
            Err(err) => tracing::warn!("Initial rule load failed, starting empty: {}", err),
        }
        let pattern_matcher = Arc::new(PatternMatcher::new());
        let incident_repo: Arc<dyn IncidentRepository> = if ephemeral_incidents {
            Arc::new(InMemoryIncidentRepository::new())
        } else {
            Arc::new(PostgresIncidentRepository::new(db.clone()))
        };
        let incident_manager = Arc::new(IncidentManager::new(
            incident_repo,
            Arc::new(LoggingActionExecutor),
        ));
        let correlation = Arc::new(CorrelationEngine::new(
            config.correlation.clone(),
            Arc::clone(&event_buffer),
            Arc::clone(&rule_store),
            Arc::clone(&pattern_matcher),
            Arc::clone(&incident_manager),
        ));
        let (correlation_handle, _workers) =
            start_workers(Arc::clone(&correlation), &config.correlation);

        // Query path
        let resource_manager = Arc::new(ResourceManager::new(
            config.resources.max_concurrent,
            config.resources.max_memory_bytes,
            config.query.max_timeout_ms,
        ));
        let execution_engine = ExecutionEngine::new(
            Arc::new(SqlxQueryBackend::new(db.clone())),
            config.query.result_cache_max_rows,
        );
        let query_service = Arc::new(QueryService::new(
            config.query.clone(),
            Some(logs_schema()),
            Arc::clone(&resource_manager),
            execution_engine,
        ));

        Ok(Self {
            config,
            db,
            dual_writer,
            bulk_indexer,
            event_buffer,
            rule_store,
            pattern_matcher,
            incident_manager,
            correlation,
            correlation_handle,
            resource_manager,
            query_service,
        })
    }

    /// Register the periodic maintenance tasks on a scheduler and
    /// start them. The caller keeps the scheduler for its stats surface
    /// and stops everything through it at shutdown.
    pub fn spawn_background_tasks(&self) -> MaintenanceScheduler {
        let secs = std::time::Duration::from_secs;
        let scheduler = MaintenanceScheduler::new();

        scheduler.spawn(
            Arc::clone(&self.bulk_indexer) as Arc<dyn MaintenanceTask>,
            secs(self.config.ingest.flush_interval_secs.max(1)),
        );
        scheduler.spawn(
            Arc::new(correlation::RulePollTask::new(
                Arc::clone(&self.rule_store),
                self.db.clone(),
            )),
            secs(self.config.correlation.rule_poll_interval_secs.max(1)),
        );
        scheduler.spawn(
            Arc::clone(&self.event_buffer) as Arc<dyn MaintenanceTask>,
            secs(60),
        );
        scheduler.spawn(
            Arc::new(correlation::IncidentExpiryTask::new(Arc::clone(
                &self.incident_manager,
            ))),
            secs(60),
        );
        scheduler.spawn(
            Arc::new(correlation::RuleMetricsFlushTask::new(
                Arc::clone(&self.correlation),
                self.db.clone(),
            )),
            secs(60),
        );
        scheduler.spawn(
            Arc::new(QuerySweepTask {
                query_service: Arc::clone(&self.query_service),
                resource_manager: Arc::clone(&self.resource_manager),
            }),
            secs(60),
        );

        scheduler
    }

    /// Relay ingest health into query admission. Returns true while the
    /// process can keep running; false means both backends are lost.
    pub fn relay_health(&self) -> bool {
        let health = self.dual_writer.health();
        self.resource_manager.set_ingest_health(health.overall());
        !(health.relational == ingest::HealthState::Unhealthy
            && health.search == ingest::HealthState::Unhealthy)
    }
}

/// Result-cache and rate-limiter housekeeping plus the deadline sweep
struct QuerySweepTask {
    query_service: Arc<QueryService>,
    resource_manager: Arc<ResourceManager>,
}

#[async_trait::async_trait]
impl MaintenanceTask for QuerySweepTask {
    fn name(&self) -> &'static str {
        "query-sweep"
    }

    async fn tick(&self) -> Result<(), anyhow::Error> {
        self.query_service.sweep();
        let cancelled = self.resource_manager.cancel_expired(chrono::Utc::now());
        if cancelled > 0 {
            tracing::warn!("Deadline sweep cancelled {} queries", cancelled);
        }
        Ok(())
    }
}
