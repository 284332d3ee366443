//! Rule evaluator
//!
//! Evaluates a rule's condition tree against a single event, computes
//! threshold aggregations over the event buffer window, and derives the
//! confidence carried onto incidents.
//!
//! String comparisons are case-insensitive unless the condition says
//! otherwise. A regex that fails to compile disables that condition
//! with a warning instead of failing the rule.

use crate::correlation::buffer::EventBuffer;
use crate::models::{
    AggregateOp, Aggregation, ConditionNode, ConditionOperator, NormalizedEvent, Rule,
    RuleCondition,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;

/// Outcome of evaluating one rule against one event
#[derive(Debug, Clone)]
pub struct EvalOutcome {
    pub matched: bool,
    pub confidence: f64,
    /// Events that satisfied the rule within the window. For plain rules
    /// this is just the triggering event; for aggregation rules it is
    /// every contributing window event.
    pub contributing: Vec<Arc<NormalizedEvent>>,
}

impl EvalOutcome {
    fn miss() -> Self {
        Self { matched: false, confidence: 0.0, contributing: Vec::new() }
    }
}

pub struct RuleEvaluator {
    /// Compiled regexes by pattern; `None` marks a pattern that failed
    /// to compile and disabled its condition.
    regex_cache: DashMap<String, Option<Arc<Regex>>>,
}

impl Default for RuleEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleEvaluator {
    pub fn new() -> Self {
        Self { regex_cache: DashMap::new() }
    }

    pub fn evaluate(
        &self,
        rule: &Rule,
        event: &Arc<NormalizedEvent>,
        buffer: &EventBuffer,
        now: DateTime<Utc>,
    ) -> EvalOutcome {
        let Some(matched) = self.eval_node(&rule.condition_tree, event) else {
            // Every condition disabled; the rule cannot assert anything.
            return EvalOutcome::miss();
        };
        if !matched {
            return EvalOutcome::miss();
        }

        let (required_hits, optional_hits) = self.count_hits(&rule.conditions, event);
        let confidence = confidence_for(required_hits, optional_hits);

        if let Some(aggregation) = &rule.aggregation {
            let since = now - rule.time_window();
            let window = buffer.window(&event.buffer_key(), since);
            let contributing: Vec<Arc<NormalizedEvent>> = window
                .into_iter()
                .filter(|candidate| {
                    self.eval_node(&rule.condition_tree, candidate).unwrap_or(false)
                })
                .collect();

            let Some(aggregate) = compute_aggregate(aggregation, &contributing) else {
                return EvalOutcome::miss();
            };
            if !compare_threshold(aggregate, aggregation.operator, aggregation.threshold) {
                return EvalOutcome::miss();
            }
            return EvalOutcome { matched: true, confidence, contributing };
        }

        EvalOutcome { matched: true, confidence, contributing: vec![Arc::clone(event)] }
    }

    /// Tri-state tree evaluation: `None` means the node is disabled
    /// (e.g. a broken regex) and must not constrain the result. Also
    /// used by the pattern matcher for per-step condition sets.
    pub fn eval_tree(&self, node: &ConditionNode, event: &NormalizedEvent) -> Option<bool> {
        self.eval_node(node, event)
    }

    fn eval_node(&self, node: &ConditionNode, event: &NormalizedEvent) -> Option<bool> {
        match node {
            ConditionNode::And { children } => {
                let mut any_active = false;
                for child in children {
                    match self.eval_node(child, event) {
                        Some(false) => return Some(false),
                        Some(true) => any_active = true,
                        None => {}
                    }
                }
                if any_active || children.is_empty() { Some(true) } else { None }
            }
            ConditionNode::Or { children } => {
                let mut any_active = false;
                for child in children {
                    match self.eval_node(child, event) {
                        Some(true) => return Some(true),
                        Some(false) => any_active = true,
                        None => {}
                    }
                }
                if any_active { Some(false) } else { None }
            }
            ConditionNode::Not { child } => self.eval_node(child, event).map(|value| !value),
            ConditionNode::Cond(condition) => self.eval_condition(condition, event),
        }
    }

    fn count_hits(&self, conditions: &[RuleCondition], event: &NormalizedEvent) -> (u32, u32) {
        let mut required = 0;
        let mut optional = 0;
        for condition in conditions {
            if self.eval_condition(condition, event) == Some(true) {
                if condition.is_required {
                    required += 1;
                } else {
                    optional += 1;
                }
            }
        }
        (required, optional)
    }

    /// `None` when the condition is disabled (broken regex)
    fn eval_condition(&self, condition: &RuleCondition, event: &NormalizedEvent) -> Option<bool> {
        let actual = event.field(&condition.field);

        match condition.operator {
            ConditionOperator::IsNull => {
                return Some(matches!(actual, None | Some(Value::Null)));
            }
            ConditionOperator::IsNotNull => {
                return Some(!matches!(actual, None | Some(Value::Null)));
            }
            _ => {}
        }

        let Some(actual) = actual else {
            return Some(false);
        };
        if actual.is_null() {
            return Some(false);
        }

        match condition.operator {
            ConditionOperator::Eq => Some(values_equal(&actual, &condition.value, condition.case_sensitive)),
            ConditionOperator::Neq => {
                Some(!values_equal(&actual, &condition.value, condition.case_sensitive))
            }
            ConditionOperator::Lt => compare_ordered(&actual, &condition.value).map(|ord| ord.is_lt()),
            ConditionOperator::Lte => compare_ordered(&actual, &condition.value).map(|ord| ord.is_le()),
            ConditionOperator::Gt => compare_ordered(&actual, &condition.value).map(|ord| ord.is_gt()),
            ConditionOperator::Gte => compare_ordered(&actual, &condition.value).map(|ord| ord.is_ge()),
            ConditionOperator::Contains => Some(string_test(&actual, &condition.value, condition.case_sensitive, |a, b| a.contains(b))),
            ConditionOperator::StartsWith => Some(string_test(&actual, &condition.value, condition.case_sensitive, |a, b| a.starts_with(b))),
            ConditionOperator::EndsWith => Some(string_test(&actual, &condition.value, condition.case_sensitive, |a, b| a.ends_with(b))),
            ConditionOperator::Regex => self.eval_regex(condition, &actual),
            ConditionOperator::In => Some(list_test(&actual, &condition.value, condition.case_sensitive)),
            ConditionOperator::NotIn => Some(!list_test(&actual, &condition.value, condition.case_sensitive)),
            ConditionOperator::IsNull | ConditionOperator::IsNotNull => unreachable!(),
        }
    }

    fn eval_regex(&self, condition: &RuleCondition, actual: &Value) -> Option<bool> {
        let pattern = condition.value.as_str()?.to_string();
        let compiled = self
            .regex_cache
            .entry(pattern.clone())
            .or_insert_with(|| match Regex::new(&pattern) {
                Ok(regex) => Some(Arc::new(regex)),
                Err(err) => {
                    tracing::warn!(
                        "Disabling condition on '{}': regex '{}' failed to compile: {}",
                        condition.field,
                        pattern,
                        err
                    );
                    None
                }
            })
            .clone();

        let regex = compiled?;
        let text = value_to_string(actual)?;
        Some(regex.is_match(&text))
    }
}

/// Confidence: `min(1.0, 0.5 + 0.1 * required + 0.05 * optional)`
pub fn confidence_for(required_hits: u32, optional_hits: u32) -> f64 {
    (0.5 + 0.1 * f64::from(required_hits) + 0.05 * f64::from(optional_hits)).min(1.0)
}

fn compute_aggregate(aggregation: &Aggregation, events: &[Arc<NormalizedEvent>]) -> Option<f64> {
    if aggregation.op == AggregateOp::Count {
        return Some(events.len() as f64);
    }

    let field = aggregation.field.as_deref()?;
    let values: Vec<f64> = events
        .iter()
        .filter_map(|event| event.field(field).as_ref().and_then(value_to_f64))
        .collect();
    if values.is_empty() {
        return None;
    }

    Some(match aggregation.op {
        AggregateOp::Count => values.len() as f64,
        AggregateOp::Sum => values.iter().sum(),
        AggregateOp::Avg => values.iter().sum::<f64>() / values.len() as f64,
        AggregateOp::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
        AggregateOp::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
    })
}

fn compare_threshold(aggregate: f64, operator: ConditionOperator, threshold: f64) -> bool {
    match operator {
        ConditionOperator::Eq => (aggregate - threshold).abs() < f64::EPSILON,
        ConditionOperator::Neq => (aggregate - threshold).abs() >= f64::EPSILON,
        ConditionOperator::Lt => aggregate < threshold,
        ConditionOperator::Lte => aggregate <= threshold,
        ConditionOperator::Gte => aggregate >= threshold,
        // Gt is the default and the fallback for non-ordering operators
        _ => aggregate > threshold,
    }
}

fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn values_equal(actual: &Value, expected: &Value, case_sensitive: bool) -> bool {
    if let (Some(a), Some(b)) = (value_to_f64(actual), value_to_f64(expected)) {
        return (a - b).abs() < f64::EPSILON;
    }
    match (value_to_string(actual), value_to_string(expected)) {
        (Some(a), Some(b)) => {
            if case_sensitive {
                a == b
            } else {
                a.eq_ignore_ascii_case(&b)
            }
        }
        _ => actual == expected,
    }
}

fn compare_ordered(actual: &Value, expected: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (value_to_f64(actual), value_to_f64(expected)) {
        return a.partial_cmp(&b);
    }
    let a = value_to_string(actual)?;
    let b = value_to_string(expected)?;
    Some(a.to_lowercase().cmp(&b.to_lowercase()))
}

fn string_test(
    actual: &Value,
    expected: &Value,
    case_sensitive: bool,
    test: impl Fn(&str, &str) -> bool,
) -> bool {
    let (Some(a), Some(b)) = (value_to_string(actual), value_to_string(expected)) else {
        return false;
    };
    if case_sensitive {
        test(&a, &b)
    } else {
        test(&a.to_lowercase(), &b.to_lowercase())
    }
}

fn list_test(actual: &Value, expected: &Value, case_sensitive: bool) -> bool {
    let Some(list) = expected.as_array() else {
        return false;
    };
    list.iter().any(|candidate| values_equal(actual, candidate, case_sensitive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        EventSeverity, EventSource, HostInfo, RulePriority, RuleSeverity, RuleType, UserInfo,
    };
    use serde_json::json;
    use uuid::Uuid;

    fn event_for(user: &str) -> Arc<NormalizedEvent> {
        let mut event = NormalizedEvent::new(
            EventSource::WindowsEvent,
            "4625",
            EventSeverity::High,
            "An account failed to log on",
            HostInfo { hostname: "DC01".to_string(), ips: vec![] },
        );
        event.user = Some(UserInfo { name: user.to_string(), id: None, domain: None });
        Arc::new(event)
    }

    fn condition(field: &str, operator: ConditionOperator, value: Value) -> RuleCondition {
        RuleCondition {
            field: field.to_string(),
            operator,
            value,
            case_sensitive: false,
            is_required: true,
        }
    }

    fn rule_with(conditions: Vec<RuleCondition>) -> Rule {
        Rule::new(
            Uuid::new_v4(),
            "test rule",
            RuleType::Authentication,
            RuleSeverity::High,
            RulePriority::Normal,
            5,
            conditions,
        )
    }

    #[test]
    fn test_simple_match_and_confidence() {
        let evaluator = RuleEvaluator::new();
        let buffer = EventBuffer::new(100);
        let event = event_for("alice");
        buffer.insert(Arc::clone(&event));

        let rule = rule_with(vec![
            condition("event_id", ConditionOperator::Eq, json!("4625")),
            condition("user.name", ConditionOperator::Eq, json!("ALICE")),
        ]);

        let outcome = evaluator.evaluate(&rule, &event, &buffer, Utc::now());
        assert!(outcome.matched);
        // 0.5 + 2 * 0.1 required
        assert!((outcome.confidence - 0.7).abs() < 1e-9);
        assert_eq!(outcome.contributing.len(), 1);
    }

    #[test]
    fn test_case_sensitive_comparison() {
        let evaluator = RuleEvaluator::new();
        let buffer = EventBuffer::new(100);
        let event = event_for("alice");

        let mut cond = condition("user.name", ConditionOperator::Eq, json!("ALICE"));
        cond.case_sensitive = true;
        let rule = rule_with(vec![cond]);

        let outcome = evaluator.evaluate(&rule, &event, &buffer, Utc::now());
        assert!(!outcome.matched);
    }

    #[test]
    fn test_optional_only_rule_needs_a_hit() {
        let evaluator = RuleEvaluator::new();
        let buffer = EventBuffer::new(100);
        let event = event_for("alice");

        let mut miss = condition("user.name", ConditionOperator::Eq, json!("bob"));
        miss.is_required = false;
        let mut other_miss = condition("event_id", ConditionOperator::Eq, json!("4624"));
        other_miss.is_required = false;
        let rule = rule_with(vec![miss, other_miss]);

        let outcome = evaluator.evaluate(&rule, &event, &buffer, Utc::now());
        assert!(!outcome.matched);

        let mut hit = condition("user.name", ConditionOperator::Eq, json!("alice"));
        hit.is_required = false;
        let mut miss2 = condition("event_id", ConditionOperator::Eq, json!("4624"));
        miss2.is_required = false;
        let rule = rule_with(vec![hit, miss2]);

        let outcome = evaluator.evaluate(&rule, &event, &buffer, Utc::now());
        assert!(outcome.matched);
        // 0.5 + 1 * 0.05 optional
        assert!((outcome.confidence - 0.55).abs() < 1e-9);
    }

    #[test]
    fn test_broken_regex_disables_condition() {
        let evaluator = RuleEvaluator::new();
        let buffer = EventBuffer::new(100);
        let event = event_for("alice");

        let broken = condition("message", ConditionOperator::Regex, json!("(unclosed"));
        let good = condition("event_id", ConditionOperator::Eq, json!("4625"));
        let rule = rule_with(vec![broken, good]);

        // The broken regex is neutral, the remaining condition decides.
        let outcome = evaluator.evaluate(&rule, &event, &buffer, Utc::now());
        assert!(outcome.matched);
    }

    #[test]
    fn test_regex_operator() {
        let evaluator = RuleEvaluator::new();
        let buffer = EventBuffer::new(100);
        let event = event_for("alice");

        let rule = rule_with(vec![condition(
            "message",
            ConditionOperator::Regex,
            json!("failed to log"),
        )]);
        assert!(evaluator.evaluate(&rule, &event, &buffer, Utc::now()).matched);
    }

    #[test]
    fn test_in_and_not_in() {
        let evaluator = RuleEvaluator::new();
        let buffer = EventBuffer::new(100);
        let event = event_for("alice");

        let rule = rule_with(vec![condition(
            "event_id",
            ConditionOperator::In,
            json!(["4624", "4625"]),
        )]);
        assert!(evaluator.evaluate(&rule, &event, &buffer, Utc::now()).matched);

        let rule = rule_with(vec![condition(
            "event_id",
            ConditionOperator::NotIn,
            json!(["4624", "4625"]),
        )]);
        assert!(!evaluator.evaluate(&rule, &event, &buffer, Utc::now()).matched);
    }

    #[test]
    fn test_count_aggregation_over_window() {
        let evaluator = RuleEvaluator::new();
        let buffer = EventBuffer::new(100);

        let mut rule = rule_with(vec![
            condition("event_id", ConditionOperator::Eq, json!("4625")),
            condition("user.name", ConditionOperator::Eq, json!("alice")),
        ]);
        rule.aggregation = Some(Aggregation {
            field: None,
            op: AggregateOp::Count,
            threshold: 5.0,
            operator: ConditionOperator::Gt,
        });

        // Five matching events: count == 5, not > 5
        let mut last = event_for("alice");
        for _ in 0..5 {
            last = event_for("alice");
            buffer.insert(Arc::clone(&last));
        }
        let outcome = evaluator.evaluate(&rule, &last, &buffer, Utc::now());
        assert!(!outcome.matched);

        // The sixth pushes the window count past the threshold
        let sixth = event_for("alice");
        buffer.insert(Arc::clone(&sixth));
        let outcome = evaluator.evaluate(&rule, &sixth, &buffer, Utc::now());
        assert!(outcome.matched);
        assert_eq!(outcome.contributing.len(), 6);
    }

    #[test]
    fn test_numeric_comparisons() {
        let evaluator = RuleEvaluator::new();
        let buffer = EventBuffer::new(100);
        let mut event = NormalizedEvent::new(
            EventSource::Firewall,
            "deny",
            EventSeverity::Medium,
            "blocked",
            HostInfo::default(),
        );
        event.fields.insert("bytes".to_string(), json!(4096));
        let event = Arc::new(event);

        let rule = rule_with(vec![condition("bytes", ConditionOperator::Gte, json!(1024))]);
        assert!(evaluator.evaluate(&rule, &event, &buffer, Utc::now()).matched);

        let rule = rule_with(vec![condition("bytes", ConditionOperator::Lt, json!(1024))]);
        assert!(!evaluator.evaluate(&rule, &event, &buffer, Utc::now()).matched);
    }

    #[test]
    fn test_null_checks() {
        let evaluator = RuleEvaluator::new();
        let buffer = EventBuffer::new(100);
        let event = event_for("alice");

        let rule = rule_with(vec![condition(
            "process.name",
            ConditionOperator::IsNull,
            Value::Null,
        )]);
        assert!(evaluator.evaluate(&rule, &event, &buffer, Utc::now()).matched);

        let rule = rule_with(vec![condition(
            "user.name",
            ConditionOperator::IsNotNull,
            Value::Null,
        )]);
        assert!(evaluator.evaluate(&rule, &event, &buffer, Utc::now()).matched);
    }
}
