//! Correlation engine orchestrator
//!
//! Drives the per-event pipeline: classify, buffer, select rules,
//! evaluate (cache-first, parallel above the priority threshold), match
//! patterns, and hand results to the incident manager. A bounded worker
//! pool with a backpressure-bearing input channel feeds the engine;
//! adaptive throttling reacts to sustained latency over target.

use crate::config::CorrelationConfig;
use crate::correlation::buffer::EventBuffer;
use crate::correlation::classifier::{EventPriority, PriorityClassifier};
use crate::correlation::evaluator::{EvalOutcome, RuleEvaluator};
use crate::correlation::incidents::IncidentManager;
use crate::correlation::patterns::PatternMatcher;
use crate::correlation::rule_cache::{CachedRuleResult, RuleCache};
use crate::correlation::rule_store::RuleStore;
use crate::models::{NormalizedEvent, Rule};
use crate::utils::error::{EngineError, EngineResult};
use crate::utils::maintenance::MaintenanceTask;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use uuid::Uuid;

/// Result of processing one event through the pipeline
#[derive(Debug)]
pub struct ProcessOutcome {
    pub priority: EventPriority,
    pub matched_rules: Vec<Uuid>,
    pub incident_ids: Vec<Uuid>,
    pub pattern_matches: usize,
    pub duration_ms: f64,
}

/// Adaptive throttle switches; process-local, reset on rule reload
struct AdaptiveThrottle {
    parallel_disabled: AtomicBool,
    batch_size: AtomicUsize,
}

impl AdaptiveThrottle {
    fn new(batch_size: usize) -> Self {
        Self {
            parallel_disabled: AtomicBool::new(false),
            batch_size: AtomicUsize::new(batch_size),
        }
    }

    fn reset(&self, batch_size: usize) {
        self.parallel_disabled.store(false, Ordering::Relaxed);
        self.batch_size.store(batch_size, Ordering::Relaxed);
    }
}

/// Per-rule evaluation accounting, flushed periodically to the
/// `rule_performance_metrics` table
#[derive(Debug, Default, Clone)]
pub struct RulePerfAccum {
    pub evaluations: u64,
    pub matches: u64,
    pub total_exec_ms: f64,
    pub last_triggered: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub processed: AtomicU64,
    pub rule_matches: AtomicU64,
    pub incidents_raised: AtomicU64,
    /// Microseconds, to keep latency samples in an atomic
    pub last_processing_us: AtomicU64,
}

pub struct CorrelationEngine {
    config: CorrelationConfig,
    buffer: Arc<EventBuffer>,
    rules: Arc<RuleStore>,
    evaluator: Arc<RuleEvaluator>,
    patterns: Arc<PatternMatcher>,
    incidents: Arc<IncidentManager>,
    cache: RwLock<Arc<RuleCache>>,
    /// Snapshot version the current cache was built for
    cache_version: AtomicU64,
    throttle: AdaptiveThrottle,
    pub metrics: EngineMetrics,
    rule_perf: DashMap<Uuid, RulePerfAccum>,
}

impl CorrelationEngine {
    pub fn new(
        config: CorrelationConfig,
        buffer: Arc<EventBuffer>,
        rules: Arc<RuleStore>,
        patterns: Arc<PatternMatcher>,
        incidents: Arc<IncidentManager>,
    ) -> Self {
        let cache = RuleCache::new(config.cache_expiration_ms);
        let batch_size = config.batch_size;
        Self {
            config,
            buffer,
            rules,
            evaluator: Arc::new(RuleEvaluator::new()),
            patterns,
            incidents,
            cache: RwLock::new(Arc::new(cache)),
            cache_version: AtomicU64::new(0),
            throttle: AdaptiveThrottle::new(batch_size),
            metrics: EngineMetrics::default(),
            rule_perf: DashMap::new(),
        }
    }

    pub fn buffer(&self) -> &Arc<EventBuffer> {
        &self.buffer
    }

    pub fn cache_len(&self) -> usize {
        self.cache().len()
    }

    fn cache(&self) -> Arc<RuleCache> {
        match self.cache.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Install a fresh cache when the rule snapshot changed since the
    /// current cache was built. Replacement is atomic alongside the new
    /// snapshot; throttle switches reset with it.
    fn sync_cache_with_snapshot(&self, snapshot_version: u64) {
        if self.cache_version.load(Ordering::Acquire) == snapshot_version {
            return;
        }
        if let Ok(mut guard) = self.cache.write() {
            if self.cache_version.load(Ordering::Acquire) != snapshot_version {
                *guard = Arc::new(RuleCache::new(self.config.cache_expiration_ms));
                self.cache_version.store(snapshot_version, Ordering::Release);
                self.throttle.reset(self.config.batch_size);
                tracing::info!(
                    "Rule cache replaced for snapshot v{}, throttle reset",
                    snapshot_version
                );
            }
        }
    }

    /// Run one event through the full pipeline
    pub async fn process_event(&self, event: NormalizedEvent) -> EngineResult<ProcessOutcome> {
        let started = Instant::now();
        let now = Utc::now();

        let snapshot = self.rules.snapshot();
        self.sync_cache_with_snapshot(snapshot.version);
        let cache = self.cache();

        let priority = PriorityClassifier::classify(&event);
        let event = Arc::new(event);
        self.buffer.insert(Arc::clone(&event));

        // Critical events evaluate the union of critical and active
        // rules; the active set already includes the critical rules, so
        // the union is the full snapshot either way.
        let selected: &[Arc<Rule>] = &snapshot.rules;

        let parallel = self.config.parallel_rule_evaluation
            && selected.len() > self.config.priority_rule_threshold
            && !self.throttle.parallel_disabled.load(Ordering::Relaxed);

        let results = if parallel {
            self.evaluate_parallel(selected, &event, &cache, now).await
        } else {
            self.evaluate_sequential(selected, &event, &cache, now)
        };

        let mut matched_rules = Vec::new();
        let mut incident_ids = Vec::new();
        for (rule, outcome) in &results {
            if outcome.matched {
                matched_rules.push(rule.id);
                let incident_id = self
                    .incidents
                    .handle_rule_match(rule, &event, outcome)
                    .await?;
                incident_ids.push(incident_id);
            }
        }

        // Fast path: only critical events pay for pattern matching
        let mut pattern_matches = 0;
        if !self.config.fast_path_enabled || priority == EventPriority::Critical {
            let found = self.patterns.matches(&event, &self.buffer, now);
            pattern_matches = found.len();
            for matched in &found {
                let incident_id = self
                    .incidents
                    .handle_pattern_match(&matched.pattern, &matched.events)
                    .await?;
                incident_ids.push(incident_id);
            }
        }

        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.record_processing(&results, &matched_rules, &incident_ids, duration_ms);
        cache.note_processed(now);

        if self.config.adaptive_throttling {
            self.adapt(duration_ms);
        }

        Ok(ProcessOutcome {
            priority,
            matched_rules,
            incident_ids,
            pattern_matches,
            duration_ms,
        })
    }

    fn evaluate_sequential(
        &self,
        rules: &[Arc<Rule>],
        event: &Arc<NormalizedEvent>,
        cache: &Arc<RuleCache>,
        now: DateTime<Utc>,
    ) -> Vec<(Arc<Rule>, EvalOutcome)> {
        rules
            .iter()
            .map(|rule| {
                let outcome =
                    evaluate_one(&self.evaluator, rule, event, &self.buffer, cache, now);
                (Arc::clone(rule), outcome)
            })
            .collect()
    }

    /// Parallel evaluation. Results are collected unordered; rule
    /// outcomes for a single event are commutative so downstream
    /// handling does not depend on completion order.
    async fn evaluate_parallel(
        &self,
        rules: &[Arc<Rule>],
        event: &Arc<NormalizedEvent>,
        cache: &Arc<RuleCache>,
        now: DateTime<Utc>,
    ) -> Vec<(Arc<Rule>, EvalOutcome)> {
        let mut join_set = JoinSet::new();
        for rule in rules {
            let evaluator = Arc::clone(&self.evaluator);
            let rule = Arc::clone(rule);
            let event = Arc::clone(event);
            let buffer = Arc::clone(&self.buffer);
            let cache = Arc::clone(cache);
            join_set.spawn(async move {
                let outcome = evaluate_one(&evaluator, &rule, &event, &buffer, &cache, now);
                (rule, outcome)
            });
        }

        let mut results = Vec::with_capacity(rules.len());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => {
                    tracing::error!("Rule evaluation task panicked: {}", err);
                }
            }
        }
        results
    }

    fn record_processing(
        &self,
        results: &[(Arc<Rule>, EvalOutcome)],
        matched_rules: &[Uuid],
        incident_ids: &[Uuid],
        duration_ms: f64,
    ) {
        self.metrics.processed.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .rule_matches
            .fetch_add(matched_rules.len() as u64, Ordering::Relaxed);
        self.metrics
            .incidents_raised
            .fetch_add(incident_ids.len() as u64, Ordering::Relaxed);
        self.metrics
            .last_processing_us
            .store((duration_ms * 1000.0) as u64, Ordering::Relaxed);

        let per_rule_ms = if results.is_empty() {
            0.0
        } else {
            duration_ms / results.len() as f64
        };
        for (rule, outcome) in results {
            let mut accum = self.rule_perf.entry(rule.id).or_default();
            accum.evaluations += 1;
            accum.total_exec_ms += per_rule_ms;
            if outcome.matched {
                accum.matches += 1;
                accum.last_triggered = Some(Utc::now());
            }
        }
    }

    /// Adaptive throttling: over 2x the latency target disables parallel
    /// evaluation, over 1.5x doubles the batch size up to 100.
    fn adapt(&self, duration_ms: f64) {
        let target = self.config.max_processing_time_ms as f64;
        if duration_ms > target * 2.0 {
            if !self.throttle.parallel_disabled.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    "Processing latency {:.1}ms over 2x target, disabling parallel evaluation",
                    duration_ms
                );
            }
        } else if duration_ms > target * 1.5 {
            let current = self.throttle.batch_size.load(Ordering::Relaxed);
            let grown = (current * 2).clamp(1, 100);
            if grown != current {
                self.throttle.batch_size.store(grown, Ordering::Relaxed);
                tracing::info!(
                    "Processing latency {:.1}ms over 1.5x target, batch size {} -> {}",
                    duration_ms,
                    current,
                    grown
                );
            }
        }
    }

    pub fn current_batch_size(&self) -> usize {
        self.throttle.batch_size.load(Ordering::Relaxed)
    }

    pub fn parallel_evaluation_active(&self) -> bool {
        self.config.parallel_rule_evaluation
            && !self.throttle.parallel_disabled.load(Ordering::Relaxed)
    }

    /// Drain the per-rule accounting accumulated since the last call
    pub fn drain_rule_perf(&self) -> Vec<(Uuid, RulePerfAccum)> {
        let keys: Vec<Uuid> = self.rule_perf.iter().map(|entry| *entry.key()).collect();
        keys.into_iter()
            .filter_map(|key| self.rule_perf.remove(&key))
            .collect()
    }
}

/// Cache-first evaluation of one rule against one event.
///
/// Aggregation rules bypass the cache: their outcome depends on the
/// buffer window, not just the `(rule, event_id, source)` key, and a
/// cached miss would freeze the window count for the TTL.
fn evaluate_one(
    evaluator: &RuleEvaluator,
    rule: &Rule,
    event: &Arc<NormalizedEvent>,
    buffer: &EventBuffer,
    cache: &RuleCache,
    now: DateTime<Utc>,
) -> EvalOutcome {
    if rule.aggregation.is_some() {
        return evaluator.evaluate(rule, event, buffer, now);
    }

    let key = RuleCache::key(rule.id, &event.event_id, event.source.as_str());
    if let Some(hit) = cache.get(&key, now) {
        return EvalOutcome {
            matched: hit.matched,
            confidence: hit.confidence,
            contributing: if hit.matched { vec![Arc::clone(event)] } else { Vec::new() },
        };
    }

    let outcome = evaluator.evaluate(rule, event, buffer, now);
    cache.insert(
        key,
        CachedRuleResult { matched: outcome.matched, confidence: outcome.confidence, ts: now },
    );
    outcome
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

/// Submission handle for the correlation worker pool
#[derive(Clone)]
pub struct CorrelationHandle {
    tx: mpsc::Sender<NormalizedEvent>,
}

impl CorrelationHandle {
    /// Non-blocking submit; a full input queue is a capacity error with
    /// a retry hint.
    pub fn submit(&self, event: NormalizedEvent) -> EngineResult<()> {
        self.tx.try_send(event).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => {
                EngineError::capacity("correlation input queue full", Some(1))
            }
            mpsc::error::TrySendError::Closed(_) => {
                EngineError::internal("correlation worker pool stopped")
            }
        })
    }

    /// Backpressure-bearing submit that waits for queue space
    pub async fn submit_wait(&self, event: NormalizedEvent) -> EngineResult<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| EngineError::internal("correlation worker pool stopped"))
    }
}

/// Spawn the worker pool. Stream mode removes the in-flight cap by
/// widening the input queue instead of adding a second code path.
pub fn start_workers(
    engine: Arc<CorrelationEngine>,
    config: &CorrelationConfig,
) -> (CorrelationHandle, Vec<tokio::task::JoinHandle<()>>) {
    let queue_size = if config.stream_processing_mode {
        65_536
    } else {
        config.input_queue_size.max(1)
    };
    let (tx, rx) = mpsc::channel::<NormalizedEvent>(queue_size);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    let mut handles = Vec::with_capacity(config.concurrency);
    for worker_id in 0..config.concurrency.max(1) {
        let engine = Arc::clone(&engine);
        let rx = Arc::clone(&rx);
        handles.push(tokio::spawn(async move {
            loop {
                let event = { rx.lock().await.recv().await };
                match event {
                    Some(event) => {
                        if let Err(err) = engine.process_event(event).await {
                            tracing::error!("Worker {} failed to process event: {}", worker_id, err);
                        }
                    }
                    None => break,
                }
            }
            tracing::debug!("Correlation worker {} stopped", worker_id);
        }));
    }

    (CorrelationHandle { tx }, handles)
}

/// Flushes per-rule evaluation metrics into the relational store
pub struct RuleMetricsFlushTask {
    engine: Arc<CorrelationEngine>,
    pool: PgPool,
}

impl RuleMetricsFlushTask {
    pub fn new(engine: Arc<CorrelationEngine>, pool: PgPool) -> Self {
        Self { engine, pool }
    }
}

#[async_trait]
impl MaintenanceTask for RuleMetricsFlushTask {
    fn name(&self) -> &'static str {
        "rule-metrics-flush"
    }

    async fn tick(&self) -> Result<(), anyhow::Error> {
        let drained = self.engine.drain_rule_perf();
        for (rule_id, accum) in drained {
            let avg_ms = if accum.evaluations > 0 {
                accum.total_exec_ms / accum.evaluations as f64
            } else {
                0.0
            };
            sqlx::query(
                r#"
                INSERT INTO rule_performance_metrics
                    (rule_id, evaluation_date, total_evaluations, true_positives,
                     false_positives, average_execution_time_ms, last_triggered)
                VALUES ($1, CURRENT_DATE, $2, $3, 0, $4, $5)
                ON CONFLICT (rule_id, evaluation_date) DO UPDATE SET
                    total_evaluations = rule_performance_metrics.total_evaluations + EXCLUDED.total_evaluations,
                    true_positives = rule_performance_metrics.true_positives + EXCLUDED.true_positives,
                    average_execution_time_ms = EXCLUDED.average_execution_time_ms,
                    last_triggered = COALESCE(EXCLUDED.last_triggered, rule_performance_metrics.last_triggered)
                "#,
            )
            .bind(rule_id)
            .bind(accum.evaluations as i64)
            .bind(accum.matches as i64)
            .bind(avg_ms)
            .bind(accum.last_triggered)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}
