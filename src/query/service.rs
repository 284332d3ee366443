//! Query service facade
//!
//! The logical query API: `execute`, `validate`, and `plan`. Wires the
//! parser, complexity analyzer, rate limiter, result cache, resource
//! manager, and execution engine into the admission pipeline:
//! parse -> analyze -> rate-limit -> cache probe -> admit -> run -> fill.

use crate::config::QueryConfig;
use crate::query::analyzer::{ComplexityAnalyzer, ComplexityReport, TimeRange};
use crate::query::executor::{ExecutionEngine, ProgressEvent, QueryResult};
use crate::query::parser::{QueryDiagnostic, TableSchema, parse, validate_semantics};
use crate::query::planner::{ExecutionPlan, plan as build_plan};
use crate::query::rate_limiter::RateLimiter;
use crate::query::resources::{QueryPriority, ResourceManager};
use crate::query::result_cache::ResultCache;
use crate::utils::error::{EngineError, EngineResult};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub priority: QueryPriority,
    pub timeout_ms: Option<u64>,
    pub cache: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self { priority: QueryPriority::Normal, timeout_ms: None, cache: true }
    }
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub lql: String,
    pub time_range: TimeRange,
    pub parameters: BTreeMap<String, Value>,
    pub options: QueryOptions,
}

impl QueryRequest {
    pub fn new(lql: impl Into<String>, time_range: TimeRange) -> Self {
        Self {
            lql: lql.into(),
            time_range,
            parameters: BTreeMap::new(),
            options: QueryOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<QueryDiagnostic>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub plan: ExecutionPlan,
    pub est_cost: f64,
    pub est_rows: u64,
    pub optimizations: Vec<String>,
}

pub struct QueryService {
    schema: Option<TableSchema>,
    analyzer: ComplexityAnalyzer,
    limiter: RateLimiter,
    resources: Arc<ResourceManager>,
    executor: ExecutionEngine,
    cache: Arc<ResultCache>,
}

impl QueryService {
    pub fn new(
        config: QueryConfig,
        schema: Option<TableSchema>,
        resources: Arc<ResourceManager>,
        executor: ExecutionEngine,
    ) -> Self {
        let cache = Arc::new(ResultCache::new(
            config.result_cache_ttl_secs,
            config.result_cache_max_rows,
        ));
        let limiter = RateLimiter::new(
            config.max_queries_per_minute,
            config.max_complex_queries_per_hour,
            config.complexity_threshold,
        );
        Self {
            analyzer: ComplexityAnalyzer::new(config),
            schema,
            limiter,
            resources,
            executor,
            cache,
        }
    }

    pub fn result_cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Execute a query for a user, enforcing the full admission
    /// pipeline. The result cache is consulted only after the query has
    /// passed complexity analysis and rate limiting.
    pub async fn execute(
        &self,
        request: &QueryRequest,
        user: &str,
        progress: Option<&UnboundedSender<ProgressEvent>>,
    ) -> EngineResult<Arc<QueryResult>> {
        let query = self.parse_checked(&request.lql)?;

        let report =
            self.analyzer
                .analyze(&query, &request.time_range, request.options.timeout_ms);
        if !report.valid {
            return Err(EngineError::policy(
                format!("query rejected with complexity score {}", report.score),
                report.violations,
            ));
        }

        let decision = self.limiter.check(user, report.score, Utc::now());
        if !decision.allowed {
            return Err(EngineError::capacity(
                decision.reason.unwrap_or_else(|| "rate limited".to_string()),
                decision.retry_after_secs,
            ));
        }

        let plan = build_plan(&query)?;
        let cache_key = self
            .cache
            .key(&plan.cache_key, &request.time_range, &request.parameters);

        if request.options.cache {
            if let Some(hit) = self.cache.get(&cache_key, Utc::now()) {
                tracing::debug!("Result cache hit for query '{}'", request.lql);
                return Ok(hit);
            }
        }

        let query_id = Uuid::new_v4();
        let lease = self.resources.request(
            query_id,
            request.options.priority,
            report.estimate.memory_bytes,
            request.options.timeout_ms,
        )?;

        let result = Arc::new(self.executor.execute_plan(&plan, &lease, progress).await?);
        drop(lease);

        if request.options.cache {
            self.cache.put(cache_key, Arc::clone(&result), Utc::now());
        }
        Ok(result)
    }

    /// Validate a query without executing it
    pub fn validate(&self, lql: &str) -> ValidationReport {
        let query = match parse(lql) {
            Ok(query) => query,
            Err(errors) => {
                return ValidationReport {
                    valid: false,
                    errors,
                    warnings: Vec::new(),
                    suggestions: vec!["check the query syntax near the reported position".to_string()],
                };
            }
        };

        let mut errors = Vec::new();
        if let Some(schema) = &self.schema {
            errors.extend(validate_semantics(&query, schema));
        }

        let report = self.analyzer.analyze(&query, &TimeRange::last_hours(24), None);
        let suggestions = Self::suggestions_for(&report);

        ValidationReport {
            valid: errors.is_empty() && report.valid,
            errors,
            warnings: report.warnings,
            suggestions,
        }
    }

    /// Plan a query without executing it
    pub fn plan(&self, lql: &str) -> EngineResult<PlanReport> {
        let query = self.parse_checked(lql)?;
        let plan = build_plan(&query)?;
        Ok(PlanReport {
            est_cost: plan.est_cost,
            est_rows: plan.est_rows,
            optimizations: plan.optimizations.clone(),
            plan,
        })
    }

    /// External schema-change signal; invalidates cached results
    pub fn on_schema_version(&self, version: u64) {
        self.cache.invalidate_schema(version);
    }

    /// Periodic housekeeping for the cache and rate-limit windows
    pub fn sweep(&self) {
        let now = Utc::now();
        self.cache.sweep(now);
        self.limiter.sweep(now);
    }

    fn parse_checked(&self, lql: &str) -> EngineResult<crate::query::ast::LqlQuery> {
        let query = parse(lql).map_err(|errors| {
            let first = errors
                .first()
                .map(|diag| format!("{} (line {}, col {})", diag.message, diag.line, diag.col))
                .unwrap_or_else(|| "invalid query".to_string());
            EngineError::validation(first)
                .with_suggestions(vec!["check the query syntax".to_string()])
        })?;

        if let Some(schema) = &self.schema {
            let semantic = validate_semantics(&query, schema);
            if let Some(first) = semantic.first() {
                return Err(EngineError::validation(first.message.clone())
                    .with_suggestions(vec!["check column names against the table schema".to_string()]));
            }
        }
        Ok(query)
    }

    fn suggestions_for(report: &ComplexityReport) -> Vec<String> {
        let mut suggestions = Vec::new();
        for violation in &report.violations {
            if violation.contains("neither a filter") {
                suggestions.push("add a where clause".to_string());
            } else if violation.contains("Time range") {
                suggestions.push("reduce the time range".to_string());
            } else if violation.contains("Timeout") {
                suggestions.push("reduce the timeout".to_string());
            } else if violation.contains("joins") {
                suggestions.push("reduce the number of joins".to_string());
            } else if violation.contains("Wildcard") {
                suggestions.push("add a row limit with top".to_string());
            }
        }
        suggestions
    }
}
