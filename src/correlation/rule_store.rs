//! Rule store
//!
//! Holds the in-memory snapshot of enabled rules with compiled condition
//! trees. Snapshots load from the relational store (the rule importer
//! writes them there) and are swapped atomically: a reload either
//! installs a complete new snapshot or leaves the old one untouched.

use crate::models::{
    AggregateOp, Aggregation, ConditionOperator, Rule, RuleAction, RuleCondition, RulePriority,
    RuleSeverity, RuleType,
};
use crate::utils::error::{EngineError, EngineResult};
use crate::utils::maintenance::MaintenanceTask;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Immutable view of the active rule set
pub struct RuleSnapshot {
    pub rules: Vec<Arc<Rule>>,
    /// Rules that are always evaluated, even for batched events
    pub critical: Vec<Arc<Rule>>,
    pub version: u64,
    pub loaded_at: DateTime<Utc>,
}

impl RuleSnapshot {
    fn empty() -> Self {
        Self { rules: Vec::new(), critical: Vec::new(), version: 0, loaded_at: Utc::now() }
    }
}

pub struct RuleStore {
    snapshot: RwLock<Arc<RuleSnapshot>>,
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleStore {
    pub fn new() -> Self {
        Self { snapshot: RwLock::new(Arc::new(RuleSnapshot::empty())) }
    }

    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        match self.snapshot.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Atomically replace the snapshot with a new rule set
    pub fn install(&self, rules: Vec<Rule>) -> Arc<RuleSnapshot> {
        let rules: Vec<Arc<Rule>> = rules
            .into_iter()
            .filter(|rule| rule.enabled)
            .map(Arc::new)
            .collect();
        let critical = rules
            .iter()
            .filter(|rule| rule.is_critical())
            .map(Arc::clone)
            .collect();

        let next_version = self.snapshot().version + 1;
        let snapshot = Arc::new(RuleSnapshot {
            rules,
            critical,
            version: next_version,
            loaded_at: Utc::now(),
        });

        if let Ok(mut guard) = self.snapshot.write() {
            *guard = Arc::clone(&snapshot);
        }
        tracing::info!(
            "Installed rule snapshot v{} with {} rules ({} critical)",
            snapshot.version,
            snapshot.rules.len(),
            snapshot.critical.len()
        );
        snapshot
    }

    /// Load enabled rules and their conditions from the relational
    /// store. Any malformed row fails the whole reload; the previous
    /// snapshot stays installed.
    pub async fn reload_from_db(&self, pool: &PgPool) -> EngineResult<usize> {
        let rule_rows = sqlx::query(
            r#"
            SELECT id, name, rule_type, severity, priority, time_window_minutes,
                   aggregation_field, aggregation_op, aggregation_threshold,
                   aggregation_operator, actions, dedup_field, enabled
            FROM correlation_rules
            WHERE enabled = TRUE
            ORDER BY id
            "#,
        )
        .fetch_all(pool)
        .await?;

        let condition_rows = sqlx::query(
            r#"
            SELECT rule_id, condition_type, field_name, operator, value,
                   condition_order, is_required, case_sensitive
            FROM rule_conditions
            ORDER BY rule_id, condition_order
            "#,
        )
        .fetch_all(pool)
        .await?;

        let mut conditions_by_rule: HashMap<Uuid, Vec<RuleCondition>> = HashMap::new();
        for row in condition_rows {
            let rule_id: Uuid = row.try_get("rule_id").map_err(EngineError::from)?;
            let condition = parse_condition_row(&row)?;
            conditions_by_rule.entry(rule_id).or_default().push(condition);
        }

        let mut rules = Vec::with_capacity(rule_rows.len());
        for row in rule_rows {
            rules.push(parse_rule_row(&row, &mut conditions_by_rule)?);
        }

        let count = rules.len();
        self.install(rules);
        Ok(count)
    }
}

fn parse_condition_row(row: &sqlx::postgres::PgRow) -> EngineResult<RuleCondition> {
    let field: String = row.try_get("field_name").map_err(EngineError::from)?;
    let operator_raw: String = row.try_get("operator").map_err(EngineError::from)?;
    let operator = ConditionOperator::from_str_loose(&operator_raw).ok_or_else(|| {
        EngineError::validation_field(
            format!("unknown condition operator '{}'", operator_raw),
            "operator",
        )
    })?;

    let condition_type: String = row.try_get("condition_type").map_err(EngineError::from)?;
    let raw_value: Option<String> = row.try_get("value").map_err(EngineError::from)?;
    let value = match (condition_type.as_str(), raw_value) {
        (_, None) => serde_json::Value::Null,
        ("json", Some(raw)) => serde_json::from_str(&raw).map_err(|err| {
            EngineError::validation_field(format!("bad condition value JSON: {}", err), "value")
        })?,
        (_, Some(raw)) => serde_json::Value::String(raw),
    };

    Ok(RuleCondition {
        field,
        operator,
        value,
        case_sensitive: row.try_get("case_sensitive").unwrap_or(false),
        is_required: row.try_get("is_required").unwrap_or(true),
    })
}

fn parse_rule_row(
    row: &sqlx::postgres::PgRow,
    conditions_by_rule: &mut HashMap<Uuid, Vec<RuleCondition>>,
) -> EngineResult<Rule> {
    let id: Uuid = row.try_get("id").map_err(EngineError::from)?;
    let name: String = row.try_get("name").map_err(EngineError::from)?;
    let rule_type: String = row.try_get("rule_type").map_err(EngineError::from)?;
    let severity: String = row.try_get("severity").map_err(EngineError::from)?;
    let priority: String = row.try_get("priority").map_err(EngineError::from)?;
    let time_window_minutes: i64 = row.try_get("time_window_minutes").map_err(EngineError::from)?;

    let conditions = conditions_by_rule.remove(&id).unwrap_or_default();
    let mut rule = Rule::new(
        id,
        name,
        RuleType::from_str_loose(&rule_type),
        RuleSeverity::from_str_loose(&severity),
        RulePriority::from_str_loose(&priority),
        time_window_minutes,
        conditions,
    );

    let agg_op: Option<String> = row.try_get("aggregation_op").map_err(EngineError::from)?;
    if let Some(agg_op_raw) = agg_op {
        let op = AggregateOp::from_str_loose(&agg_op_raw).ok_or_else(|| {
            EngineError::validation_field(
                format!("unknown aggregation op '{}'", agg_op_raw),
                "aggregation_op",
            )
        })?;
        let threshold: f64 = row.try_get("aggregation_threshold").map_err(EngineError::from)?;
        let operator_raw: Option<String> =
            row.try_get("aggregation_operator").map_err(EngineError::from)?;
        let operator = match operator_raw {
            Some(raw) => ConditionOperator::from_str_loose(&raw).ok_or_else(|| {
                EngineError::validation_field(
                    format!("unknown aggregation operator '{}'", raw),
                    "aggregation_operator",
                )
            })?,
            None => ConditionOperator::Gt,
        };
        rule.aggregation = Some(Aggregation {
            field: row.try_get("aggregation_field").map_err(EngineError::from)?,
            op,
            threshold,
            operator,
        });
    }

    let actions: Option<serde_json::Value> = row.try_get("actions").map_err(EngineError::from)?;
    if let Some(actions) = actions {
        rule.actions = serde_json::from_value::<Vec<RuleAction>>(actions).map_err(|err| {
            EngineError::validation_field(format!("bad rule actions JSON: {}", err), "actions")
        })?;
    }

    rule.dedup_field = row.try_get("dedup_field").map_err(EngineError::from)?;
    rule.enabled = row.try_get("enabled").map_err(EngineError::from)?;
    Ok(rule)
}

/// Periodic snapshot reload from the relational store
pub struct RulePollTask {
    store: Arc<RuleStore>,
    pool: PgPool,
}

impl RulePollTask {
    pub fn new(store: Arc<RuleStore>, pool: PgPool) -> Self {
        Self { store, pool }
    }
}

#[async_trait]
impl MaintenanceTask for RulePollTask {
    fn name(&self) -> &'static str {
        "rule-poll"
    }

    async fn tick(&self) -> Result<(), anyhow::Error> {
        let count = self.store.reload_from_db(&self.pool).await?;
        tracing::debug!("Rule poll loaded {} rules", count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(name: &str, severity: RuleSeverity, priority: RulePriority) -> Rule {
        Rule::new(
            Uuid::new_v4(),
            name,
            RuleType::Network,
            severity,
            priority,
            5,
            vec![RuleCondition {
                field: "event_id".to_string(),
                operator: ConditionOperator::Eq,
                value: json!("deny"),
                case_sensitive: false,
                is_required: true,
            }],
        )
    }

    #[test]
    fn test_install_partitions_critical_rules() {
        let store = RuleStore::new();
        store.install(vec![
            rule("normal", RuleSeverity::Medium, RulePriority::Normal),
            rule("hot", RuleSeverity::Critical, RulePriority::Normal),
            rule("priority", RuleSeverity::Low, RulePriority::High),
        ]);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.rules.len(), 3);
        assert_eq!(snapshot.critical.len(), 2);
        assert_eq!(snapshot.version, 1);
    }

    #[test]
    fn test_install_is_atomic_replacement() {
        let store = RuleStore::new();
        store.install(vec![rule("a", RuleSeverity::Medium, RulePriority::Normal)]);
        let first = store.snapshot();

        store.install(vec![
            rule("b", RuleSeverity::Medium, RulePriority::Normal),
            rule("c", RuleSeverity::Medium, RulePriority::Normal),
        ]);
        let second = store.snapshot();

        // The first snapshot is untouched by the second install
        assert_eq!(first.rules.len(), 1);
        assert_eq!(second.rules.len(), 2);
        assert_eq!(second.version, 2);
    }

    #[test]
    fn test_disabled_rules_are_dropped_at_install() {
        let store = RuleStore::new();
        let mut disabled = rule("off", RuleSeverity::Medium, RulePriority::Normal);
        disabled.enabled = false;
        store.install(vec![disabled, rule("on", RuleSeverity::Medium, RulePriority::Normal)]);
        assert_eq!(store.snapshot().rules.len(), 1);
    }
}
