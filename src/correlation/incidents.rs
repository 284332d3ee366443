//! Incident manager
//!
//! Creates and updates incidents from rule and pattern matches. Repeated
//! matches inside a rule's time window collapse into one open incident
//! per `(rule_id, dedup_key)`; updates for the same key are serialized
//! through a per-key mutex. Actions run after the incident is committed
//! and never roll it back.

use crate::correlation::evaluator::EvalOutcome;
use crate::models::{
    EventLink, Incident, IncidentStatus, NormalizedEvent, Pattern, Rule, RuleAction,
};
use crate::utils::backoff::Backoff;
use crate::utils::error::{EngineError, EngineResult};
use crate::utils::maintenance::MaintenanceTask;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use uuid::Uuid;

const WINDOW_METADATA_KEY: &str = "time_window_minutes";

/// Persistence seam for incidents; the engine core stays testable with
/// the in-memory implementation.
#[async_trait]
pub trait IncidentRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> EngineResult<Option<Incident>>;

    /// The open (or investigating) incident for `(rule_id, dedup_key)`
    /// with `last_seen >= since`, if any
    async fn find_open(
        &self,
        rule_id: Uuid,
        dedup_key: &str,
        since: DateTime<Utc>,
    ) -> EngineResult<Option<Incident>>;

    async fn insert(&self, incident: &Incident) -> EngineResult<()>;

    async fn update(&self, incident: &Incident) -> EngineResult<()>;

    /// Close every non-closed incident whose window has expired.
    /// Returns the number of incidents closed.
    async fn close_expired(&self, now: DateTime<Utc>) -> EngineResult<u64>;
}

/// External action executor seam (webhook, ticket, email)
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &RuleAction, incident: &Incident) -> EngineResult<()>;
}

/// Default executor: records the action in the log. Real integrations
/// are wired in by the embedding process.
pub struct LoggingActionExecutor;

#[async_trait]
impl ActionExecutor for LoggingActionExecutor {
    async fn execute(&self, action: &RuleAction, incident: &Incident) -> EngineResult<()> {
        tracing::info!(
            "Action '{}' -> '{}' for incident {} ({})",
            action.action_type,
            action.target,
            incident.id,
            incident.title
        );
        Ok(())
    }
}

pub struct IncidentManager {
    repo: Arc<dyn IncidentRepository>,
    actions: Arc<dyn ActionExecutor>,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    action_backoff: Backoff,
}

impl IncidentManager {
    pub fn new(repo: Arc<dyn IncidentRepository>, actions: Arc<dyn ActionExecutor>) -> Self {
        Self {
            repo,
            actions,
            locks: DashMap::new(),
            action_backoff: Backoff::new(
                StdDuration::from_millis(500),
                StdDuration::from_secs(30),
                4,
            ),
        }
    }

    /// Dedup key for a rule match: the rule's `dedup_field` value when
    /// set, otherwise the affected-assets signature of the event.
    pub fn dedup_key(rule: &Rule, event: &NormalizedEvent) -> String {
        if let Some(field) = &rule.dedup_field {
            if let Some(value) = event.field(field) {
                match value {
                    Value::String(text) => return text,
                    other => return other.to_string(),
                }
            }
        }
        let assets = event.affected_assets();
        if assets.is_empty() {
            event.buffer_key()
        } else {
            assets.into_iter().collect::<Vec<_>>().join("|")
        }
    }

    /// Handle a rule match: update the open incident in the window or
    /// create a new one, link the contributing events, then fire the
    /// rule's actions.
    pub async fn handle_rule_match(
        &self,
        rule: &Rule,
        event: &NormalizedEvent,
        outcome: &EvalOutcome,
    ) -> EngineResult<Uuid> {
        let dedup_key = Self::dedup_key(rule, event);
        let lock = self.lock_for(&format!("{}:{}", rule.id, dedup_key));
        let _guard = lock.lock().await;

        let now = Utc::now();
        let since = now - rule.time_window();

        let incident = match self.repo.find_open(rule.id, &dedup_key, since).await? {
            Some(mut existing) => {
                existing.last_seen = now;
                self.merge_match(&mut existing, event, outcome);
                self.repo.update(&existing).await?;
                tracing::debug!(
                    "Updated incident {} for rule '{}' (events: {})",
                    existing.id,
                    rule.name,
                    existing.event_count
                );
                existing
            }
            None => {
                let mut created = self.build_rule_incident(rule, event, &dedup_key, now);
                self.merge_match(&mut created, event, outcome);
                self.repo.insert(&created).await?;
                tracing::info!(
                    "Created incident {} '{}' for rule '{}'",
                    created.id,
                    created.title,
                    rule.name
                );
                created
            }
        };

        self.fire_actions(&rule.actions, &incident);
        Ok(incident.id)
    }

    /// Pattern matches always create a fresh incident linking every
    /// matched event at the pattern's relevance score.
    pub async fn handle_pattern_match(
        &self,
        pattern: &Pattern,
        events: &[Arc<NormalizedEvent>],
    ) -> EngineResult<Uuid> {
        let now = Utc::now();
        let first_seen = events
            .iter()
            .map(|event| event.timestamp)
            .min()
            .unwrap_or(now);

        let mut assets = BTreeSet::new();
        for event in events {
            assets.extend(event.affected_assets());
        }

        let mut metadata = serde_json::Map::new();
        metadata.insert("pattern_type".to_string(), Value::String(pattern.pattern_type.clone()));
        metadata.insert(WINDOW_METADATA_KEY.to_string(), Value::from(60));

        let mut incident = Incident {
            id: Uuid::new_v4(),
            rule_id: None,
            pattern_id: Some(pattern.id),
            severity: pattern.severity,
            title: format!("Pattern detected: {}", pattern.name),
            description: format!(
                "Pattern '{}' ({}) matched {} events between {} and {}",
                pattern.name,
                pattern.pattern_type,
                events.len(),
                first_seen.to_rfc3339(),
                now.to_rfc3339()
            ),
            first_seen,
            last_seen: now,
            event_count: 0,
            affected_assets: assets,
            metadata,
            status: IncidentStatus::Open,
            dedup_key: format!("pattern:{}", pattern.id),
            events: Vec::new(),
        };
        for event in events {
            incident.link_event(EventLink {
                event_id: event.id,
                timestamp: event.timestamp,
                confidence: pattern.relevance_score,
            });
        }

        self.repo.insert(&incident).await?;
        tracing::info!(
            "Created pattern incident {} '{}' linking {} events",
            incident.id,
            incident.title,
            incident.event_count
        );
        Ok(incident.id)
    }

    /// Explicit status transition; invalid transitions are validation
    /// errors.
    pub async fn set_status(&self, id: Uuid, next: IncidentStatus) -> EngineResult<()> {
        let mut incident = self
            .repo
            .get(id)
            .await?
            .ok_or_else(|| EngineError::validation_field("incident not found", "id"))?;
        if !incident.status.can_transition_to(next) {
            return Err(EngineError::validation(format!(
                "invalid incident transition {} -> {}",
                incident.status.as_str(),
                next.as_str()
            )));
        }
        incident.status = next;
        self.repo.update(&incident).await
    }

    /// Close incidents whose window expired
    pub async fn close_expired(&self, now: DateTime<Utc>) -> EngineResult<u64> {
        self.repo.close_expired(now).await
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn merge_match(&self, incident: &mut Incident, event: &NormalizedEvent, outcome: &EvalOutcome) {
        incident.affected_assets.extend(event.affected_assets());
        if outcome.contributing.is_empty() {
            incident.link_event(EventLink {
                event_id: event.id,
                timestamp: event.timestamp,
                confidence: outcome.confidence,
            });
        } else {
            for contributing in &outcome.contributing {
                incident.affected_assets.extend(contributing.affected_assets());
                incident.link_event(EventLink {
                    event_id: contributing.id,
                    timestamp: contributing.timestamp,
                    confidence: outcome.confidence,
                });
            }
        }
    }

    fn build_rule_incident(
        &self,
        rule: &Rule,
        event: &NormalizedEvent,
        dedup_key: &str,
        now: DateTime<Utc>,
    ) -> Incident {
        let mut metadata = serde_json::Map::new();
        metadata.insert("rule_name".to_string(), Value::String(rule.name.clone()));
        metadata.insert(
            WINDOW_METADATA_KEY.to_string(),
            Value::from(rule.time_window_minutes),
        );

        Incident {
            id: Uuid::new_v4(),
            rule_id: Some(rule.id),
            pattern_id: None,
            severity: rule.severity,
            title: format!("{}: {}", rule.rule_type.incident_title_prefix(), rule.name),
            description: format!(
                "Rule '{}' matched event {} from {} at {}",
                rule.name,
                event.id,
                event.source.as_str(),
                event.timestamp.to_rfc3339()
            ),
            first_seen: event.timestamp,
            last_seen: now,
            event_count: 0,
            affected_assets: BTreeSet::new(),
            metadata,
            status: IncidentStatus::Open,
            dedup_key: dedup_key.to_string(),
            events: Vec::new(),
        }
    }

    /// Actions run detached after commit, with retries. A permanently
    /// failing action is logged and dropped.
    fn fire_actions(&self, actions: &[RuleAction], incident: &Incident) {
        for action in actions {
            let executor = Arc::clone(&self.actions);
            let action = action.clone();
            let incident = incident.clone();
            let backoff = self.action_backoff.clone();
            tokio::spawn(async move {
                let result = backoff
                    .retry("incident action", || executor.execute(&action, &incident))
                    .await;
                if let Err(err) = result {
                    tracing::error!(
                        "Action '{}' for incident {} failed permanently: {}",
                        action.action_type,
                        incident.id,
                        err
                    );
                }
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Repositories
// ---------------------------------------------------------------------------

/// In-memory repository, used by tests and by deployments that do not
/// persist incidents
#[derive(Default)]
pub struct InMemoryIncidentRepository {
    incidents: DashMap<Uuid, Incident>,
}

impl InMemoryIncidentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.incidents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.incidents.is_empty()
    }

    pub fn all(&self) -> Vec<Incident> {
        self.incidents.iter().map(|entry| entry.value().clone()).collect()
    }
}

#[async_trait]
impl IncidentRepository for InMemoryIncidentRepository {
    async fn get(&self, id: Uuid) -> EngineResult<Option<Incident>> {
        Ok(self.incidents.get(&id).map(|entry| entry.value().clone()))
    }

    async fn find_open(
        &self,
        rule_id: Uuid,
        dedup_key: &str,
        since: DateTime<Utc>,
    ) -> EngineResult<Option<Incident>> {
        Ok(self
            .incidents
            .iter()
            .find(|entry| {
                let incident = entry.value();
                incident.rule_id == Some(rule_id)
                    && incident.dedup_key == dedup_key
                    && incident.status != IncidentStatus::Closed
                    && incident.last_seen >= since
            })
            .map(|entry| entry.value().clone()))
    }

    async fn insert(&self, incident: &Incident) -> EngineResult<()> {
        self.incidents.insert(incident.id, incident.clone());
        Ok(())
    }

    async fn update(&self, incident: &Incident) -> EngineResult<()> {
        self.incidents.insert(incident.id, incident.clone());
        Ok(())
    }

    async fn close_expired(&self, now: DateTime<Utc>) -> EngineResult<u64> {
        let mut closed = 0;
        for mut entry in self.incidents.iter_mut() {
            let incident = entry.value_mut();
            if incident.status == IncidentStatus::Closed {
                continue;
            }
            let window_minutes = incident
                .metadata
                .get(WINDOW_METADATA_KEY)
                .and_then(Value::as_i64)
                .unwrap_or(60);
            if incident.last_seen + Duration::minutes(window_minutes) < now {
                incident.status = IncidentStatus::Closed;
                closed += 1;
            }
        }
        Ok(closed)
    }
}

/// Postgres-backed repository
pub struct PostgresIncidentRepository {
    pool: PgPool,
}

impl PostgresIncidentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_incident(row: &sqlx::postgres::PgRow) -> EngineResult<Incident> {
        let assets: Vec<String> = row.try_get("affected_assets").map_err(EngineError::from)?;
        let metadata: Value = row.try_get("metadata").map_err(EngineError::from)?;
        let events: Value = row.try_get("events").map_err(EngineError::from)?;
        let status: String = row.try_get("status").map_err(EngineError::from)?;
        let severity: String = row.try_get("severity").map_err(EngineError::from)?;

        Ok(Incident {
            id: row.try_get("id").map_err(EngineError::from)?,
            rule_id: row.try_get("rule_id").map_err(EngineError::from)?,
            pattern_id: row.try_get("pattern_id").map_err(EngineError::from)?,
            severity: crate::models::RuleSeverity::from_str_loose(&severity),
            title: row.try_get("title").map_err(EngineError::from)?,
            description: row.try_get("description").map_err(EngineError::from)?,
            first_seen: row.try_get("first_seen").map_err(EngineError::from)?,
            last_seen: row.try_get("last_seen").map_err(EngineError::from)?,
            event_count: row.try_get("event_count").map_err(EngineError::from)?,
            affected_assets: assets.into_iter().collect(),
            metadata: metadata.as_object().cloned().unwrap_or_default(),
            status: IncidentStatus::from_str_loose(&status),
            dedup_key: row.try_get("dedup_key").map_err(EngineError::from)?,
            events: serde_json::from_value(events).unwrap_or_default(),
        })
    }
}

const INCIDENT_COLUMNS: &str = "id, rule_id, pattern_id, severity, title, description, \
     first_seen, last_seen, event_count, affected_assets, metadata, status, dedup_key, events";

#[async_trait]
impl IncidentRepository for PostgresIncidentRepository {
    async fn get(&self, id: Uuid) -> EngineResult<Option<Incident>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM incidents WHERE id = $1",
            INCIDENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_incident).transpose()
    }

    async fn find_open(
        &self,
        rule_id: Uuid,
        dedup_key: &str,
        since: DateTime<Utc>,
    ) -> EngineResult<Option<Incident>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM incidents \
             WHERE rule_id = $1 AND dedup_key = $2 AND status <> 'closed' AND last_seen >= $3 \
             ORDER BY last_seen DESC LIMIT 1",
            INCIDENT_COLUMNS
        ))
        .bind(rule_id)
        .bind(dedup_key)
        .bind(since)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_incident).transpose()
    }

    async fn insert(&self, incident: &Incident) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO incidents (id, rule_id, pattern_id, severity, title, description, \
             first_seen, last_seen, event_count, affected_assets, metadata, status, dedup_key, events) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(incident.id)
        .bind(incident.rule_id)
        .bind(incident.pattern_id)
        .bind(incident.severity.as_str())
        .bind(&incident.title)
        .bind(&incident.description)
        .bind(incident.first_seen)
        .bind(incident.last_seen)
        .bind(incident.event_count)
        .bind(incident.affected_assets.iter().cloned().collect::<Vec<String>>())
        .bind(Value::Object(incident.metadata.clone()))
        .bind(incident.status.as_str())
        .bind(&incident.dedup_key)
        .bind(serde_json::to_value(&incident.events).unwrap_or(Value::Null))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, incident: &Incident) -> EngineResult<()> {
        sqlx::query(
            "UPDATE incidents SET last_seen = $2, event_count = $3, affected_assets = $4, \
             metadata = $5, status = $6, events = $7 WHERE id = $1",
        )
        .bind(incident.id)
        .bind(incident.last_seen)
        .bind(incident.event_count)
        .bind(incident.affected_assets.iter().cloned().collect::<Vec<String>>())
        .bind(Value::Object(incident.metadata.clone()))
        .bind(incident.status.as_str())
        .bind(serde_json::to_value(&incident.events).unwrap_or(Value::Null))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn close_expired(&self, now: DateTime<Utc>) -> EngineResult<u64> {
        let result = sqlx::query(
            "UPDATE incidents SET status = 'closed' \
             WHERE status <> 'closed' \
             AND last_seen + make_interval(mins => COALESCE((metadata->>'time_window_minutes')::int, 60)) < $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Periodic window-expiry sweep
pub struct IncidentExpiryTask {
    manager: Arc<IncidentManager>,
}

impl IncidentExpiryTask {
    pub fn new(manager: Arc<IncidentManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl MaintenanceTask for IncidentExpiryTask {
    fn name(&self) -> &'static str {
        "incident-expiry"
    }

    async fn tick(&self) -> Result<(), anyhow::Error> {
        let closed = self.manager.close_expired(Utc::now()).await?;
        if closed > 0 {
            tracing::info!("Closed {} expired incidents", closed);
        }
        Ok(())
    }
}
