//! Execution engine
//!
//! Runs emitted SQL against the relational store through a pooled
//! backend, materializes columnar result batches, enforces the lease
//! deadline through the cancel token, and emits progress events at
//! start, plan-step boundaries, and completion. Results beyond the
//! in-memory row limit spill to an intermediate file and are returned
//! as a pointer.

use crate::query::planner::ExecutionPlan;
use crate::query::resources::ResourceLease;
use crate::utils::error::{EngineError, EngineResult};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use sqlx::{Column, PgPool, Row};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Columnar result batch
#[derive(Debug, Clone, Default, Serialize, serde::Deserialize)]
pub struct ResultBatch {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// Final result returned to the caller. Either `batch` is populated or
/// `spill_path` points at the materialized result file.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub query_id: Uuid,
    pub batch: Option<ResultBatch>,
    pub row_count: usize,
    pub execution_time_ms: u64,
    pub cached: bool,
    pub spill_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub query_id: Uuid,
    pub progress_pct: u8,
    pub message: String,
}

/// Backend seam: executes SQL and supports backend-level cancellation
#[async_trait]
pub trait QueryBackend: Send + Sync {
    async fn execute(
        &self,
        query_id: Uuid,
        sql: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<ResultBatch>;

    /// Best-effort cancel of the backend statement for a running query
    async fn cancel(&self, query_id: Uuid) -> EngineResult<()>;
}

pub struct ExecutionEngine {
    backend: Arc<dyn QueryBackend>,
    /// Results above this row count spill to disk
    max_buffer_rows: usize,
    spill_dir: PathBuf,
}

impl ExecutionEngine {
    pub fn new(backend: Arc<dyn QueryBackend>, max_buffer_rows: usize) -> Self {
        Self {
            backend,
            max_buffer_rows: max_buffer_rows.max(1),
            spill_dir: std::env::temp_dir().join("securewatch-spill"),
        }
    }

    pub fn with_spill_dir(mut self, dir: PathBuf) -> Self {
        self.spill_dir = dir;
        self
    }

    /// Execute a plan under a lease. Cancellation (explicit or via
    /// deadline) attempts a backend-level cancel, releases nothing
    /// itself (the lease is the caller's to drop), and surfaces as
    /// `QUERY_CANCELLED`.
    pub async fn execute_plan(
        &self,
        plan: &ExecutionPlan,
        lease: &ResourceLease,
        progress: Option<&UnboundedSender<ProgressEvent>>,
    ) -> EngineResult<QueryResult> {
        let query_id = lease.query_id;
        let started = Instant::now();

        emit_progress(progress, query_id, 0, "execution started");
        let total_steps = plan.steps.len().max(1);
        for (index, step) in plan.steps.iter().enumerate() {
            let pct = ((index + 1) * 90 / (total_steps + 1)) as u8;
            emit_progress(
                progress,
                query_id,
                pct,
                &format!("step {}: {}", step.id, step.kind),
            );
        }

        let remaining = (lease.deadline - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);

        let batch = tokio::select! {
            _ = tokio::time::sleep(remaining) => {
                self.backend.cancel(query_id).await.ok();
                lease.cancel_token.cancel();
                tracing::warn!("Query {} hit its deadline and was cancelled", query_id);
                return Err(EngineError::Cancelled { query_id });
            }
            _ = lease.cancel_token.cancelled() => {
                self.backend.cancel(query_id).await.ok();
                tracing::info!("Query {} cancelled", query_id);
                return Err(EngineError::Cancelled { query_id });
            }
            result = self.backend.execute(query_id, &plan.sql, &lease.cancel_token) => result?
        };

        let row_count = batch.rows.len();
        let execution_time_ms = started.elapsed().as_millis() as u64;

        let result = if row_count > self.max_buffer_rows {
            let path = self.spill(query_id, &batch)?;
            tracing::info!(
                "Query {} returned {} rows, spilled to {}",
                query_id,
                row_count,
                path
            );
            QueryResult {
                query_id,
                batch: None,
                row_count,
                execution_time_ms,
                cached: false,
                spill_path: Some(path),
            }
        } else {
            QueryResult {
                query_id,
                batch: Some(batch),
                row_count,
                execution_time_ms,
                cached: false,
                spill_path: None,
            }
        };

        emit_progress(progress, query_id, 100, "execution complete");
        Ok(result)
    }

    fn spill(&self, query_id: Uuid, batch: &ResultBatch) -> EngineResult<String> {
        std::fs::create_dir_all(&self.spill_dir)
            .map_err(|err| EngineError::internal(format!("spill dir: {}", err)))?;
        let path = self.spill_dir.join(format!("{}.json", query_id));
        let file = std::fs::File::create(&path)
            .map_err(|err| EngineError::internal(format!("spill create: {}", err)))?;
        serde_json::to_writer(file, batch)
            .map_err(|err| EngineError::internal(format!("spill write: {}", err)))?;
        Ok(path.to_string_lossy().into_owned())
    }
}

fn emit_progress(
    sender: Option<&UnboundedSender<ProgressEvent>>,
    query_id: Uuid,
    progress_pct: u8,
    message: &str,
) {
    if let Some(sender) = sender {
        sender
            .send(ProgressEvent { query_id, progress_pct, message: message.to_string() })
            .ok();
    }
}

// ---------------------------------------------------------------------------
// Postgres backend
// ---------------------------------------------------------------------------

/// sqlx-backed implementation. Each running query registers its
/// backend pid so `cancel` can issue `pg_cancel_backend` from another
/// connection.
pub struct SqlxQueryBackend {
    pool: PgPool,
    session_pids: DashMap<Uuid, i32>,
}

impl SqlxQueryBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, session_pids: DashMap::new() }
    }
}

#[async_trait]
impl QueryBackend for SqlxQueryBackend {
    async fn execute(
        &self,
        query_id: Uuid,
        sql: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<ResultBatch> {
        let mut conn = self.pool.acquire().await?;

        let pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut *conn)
            .await?;
        self.session_pids.insert(query_id, pid);

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled { query_id }),
            rows = sqlx::query(sql).fetch_all(&mut *conn) => {
                rows.map_err(EngineError::from)
            }
        };
        self.session_pids.remove(&query_id);
        let rows = result?;

        let columns: Vec<String> = rows
            .first()
            .map(|row| row.columns().iter().map(|col| col.name().to_string()).collect())
            .unwrap_or_default();

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut values = Vec::with_capacity(columns.len());
            for index in 0..columns.len() {
                values.push(decode_column(row, index));
            }
            out.push(values);
        }

        Ok(ResultBatch { columns, rows: out })
    }

    async fn cancel(&self, query_id: Uuid) -> EngineResult<()> {
        let Some(pid) = self.session_pids.get(&query_id).map(|entry| *entry) else {
            return Ok(());
        };
        sqlx::query("SELECT pg_cancel_backend($1)")
            .bind(pid)
            .execute(&self.pool)
            .await?;
        tracing::debug!("Sent pg_cancel_backend for query {} (pid {})", query_id, pid);
        Ok(())
    }
}

/// Best-effort decode of an arbitrary column into JSON
fn decode_column(row: &sqlx::postgres::PgRow, index: usize) -> Value {
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return value.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<i32>, _>(index) {
        return value.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
        return value.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<bool>, _>(index) {
        return value.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<Uuid>, _>(index) {
        return value
            .map(|uuid| Value::String(uuid.to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<chrono::DateTime<Utc>>, _>(index) {
        return value
            .map(|ts| Value::String(ts.to_rfc3339()))
            .unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<Value>, _>(index) {
        return value.unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return value.map(Value::String).unwrap_or(Value::Null);
    }
    Value::Null
}
