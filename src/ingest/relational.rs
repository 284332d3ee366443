//! Relational time-series log store
//!
//! Flattens common ECS-style fields into nullable columns of the
//! time-partitioned `logs` table and keeps everything else in a JSON
//! metadata bag. Batch writes run inside a single transaction and roll
//! back on any per-row failure.

use crate::models::{EventSeverity, NormalizedEvent};
use crate::utils::error::EngineResult;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;

/// Store abstraction over the relational backend, kept narrow so the
/// dual-write engine is testable with an in-memory fake.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn write(&self, event: &NormalizedEvent) -> EngineResult<()>;

    /// All-or-nothing batch write
    async fn write_batch(&self, events: &[NormalizedEvent]) -> EngineResult<()>;
}

/// Flattened row shape for the `logs` table
#[derive(Debug, Clone)]
pub struct LogRow {
    pub id: uuid::Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub ingested_at: chrono::DateTime<chrono::Utc>,
    pub source_type: String,
    pub event_id: String,
    pub severity: String,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub raw_message: String,
    pub hostname: String,
    pub user_name: Option<String>,
    pub user_id: Option<String>,
    pub user_domain: Option<String>,
    pub process_name: Option<String>,
    pub process_id: Option<i64>,
    pub process_command_line: Option<String>,
    pub source_ip: Option<String>,
    pub source_port: Option<i32>,
    pub destination_ip: Option<String>,
    pub destination_port: Option<i32>,
    pub risk_score: i32,
    pub mitre_techniques: Vec<String>,
    pub metadata: Value,
    pub tags: Vec<String>,
}

impl LogRow {
    pub fn from_event(event: &NormalizedEvent) -> Self {
        let user = event.user.as_ref();
        let process = event.process.as_ref();
        let network = event.network.as_ref();

        let mitre_techniques = event
            .tags
            .iter()
            .filter(|tag| tag.starts_with("attack.t") || tag.starts_with("T1"))
            .cloned()
            .collect();

        Self {
            id: event.id,
            timestamp: event.timestamp,
            ingested_at: event.ingested_at,
            source_type: event.source.as_str().to_string(),
            event_id: event.event_id.clone(),
            severity: event.severity.as_str().to_string(),
            category: event.category.clone(),
            subcategory: event
                .fields
                .get("subcategory")
                .and_then(|value| value.as_str())
                .map(str::to_string),
            raw_message: event.message.clone(),
            hostname: event.host.hostname.clone(),
            user_name: user.map(|u| u.name.clone()),
            user_id: user.and_then(|u| u.id.clone()),
            user_domain: user.and_then(|u| u.domain.clone()),
            process_name: process.map(|p| p.name.clone()),
            process_id: process.and_then(|p| p.pid),
            process_command_line: process.and_then(|p| p.command_line.clone()),
            source_ip: network.and_then(|n| n.source_ip.clone()),
            source_port: network.and_then(|n| n.source_port).map(i32::from),
            destination_ip: network.and_then(|n| n.destination_ip.clone()),
            destination_port: network.and_then(|n| n.destination_port).map(i32::from),
            risk_score: risk_score_for(event.severity),
            mitre_techniques,
            metadata: Value::Object(event.fields.clone()),
            tags: event.tags.iter().cloned().collect(),
        }
    }
}

fn risk_score_for(severity: EventSeverity) -> i32 {
    match severity {
        EventSeverity::Critical => 90,
        EventSeverity::High => 70,
        EventSeverity::Medium => 50,
        EventSeverity::Low => 30,
        EventSeverity::Info => 10,
    }
}

const INSERT_LOG: &str = r#"
INSERT INTO logs (
    id, timestamp, ingested_at, source_type, event_id, severity,
    category, subcategory, raw_message, hostname,
    user_name, user_id, user_domain,
    process_name, process_id, process_command_line,
    source_ip, source_port, destination_ip, destination_port,
    risk_score, mitre_techniques, metadata, tags
) VALUES (
    $1, $2, $3, $4, $5, $6,
    $7, $8, $9, $10,
    $11, $12, $13,
    $14, $15, $16,
    $17, $18, $19, $20,
    $21, $22, $23, $24
)
"#;

/// Postgres-backed implementation used in production
pub struct PostgresLogStore {
    pool: PgPool,
}

impl PostgresLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn bind_row<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    row: LogRow,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(row.id)
        .bind(row.timestamp)
        .bind(row.ingested_at)
        .bind(row.source_type)
        .bind(row.event_id)
        .bind(row.severity)
        .bind(row.category)
        .bind(row.subcategory)
        .bind(row.raw_message)
        .bind(row.hostname)
        .bind(row.user_name)
        .bind(row.user_id)
        .bind(row.user_domain)
        .bind(row.process_name)
        .bind(row.process_id)
        .bind(row.process_command_line)
        .bind(row.source_ip)
        .bind(row.source_port)
        .bind(row.destination_ip)
        .bind(row.destination_port)
        .bind(row.risk_score)
        .bind(row.mitre_techniques)
        .bind(row.metadata)
        .bind(row.tags)
}

#[async_trait]
impl LogStore for PostgresLogStore {
    async fn write(&self, event: &NormalizedEvent) -> EngineResult<()> {
        let row = LogRow::from_event(event);
        bind_row(sqlx::query(INSERT_LOG), row).execute(&self.pool).await?;
        Ok(())
    }

    async fn write_batch(&self, events: &[NormalizedEvent]) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        for event in events {
            let row = LogRow::from_event(event);
            if let Err(err) = bind_row(sqlx::query(INSERT_LOG), row).execute(&mut *tx).await {
                tx.rollback().await.ok();
                return Err(err.into());
            }
        }
        tx.commit().await?;
        tracing::debug!("Wrote batch of {} log rows", events.len());
        Ok(())
    }
}
