//! Correlation rule model
//!
//! Rules are loaded from the relational store as flat condition rows and
//! compiled into a typed condition tree at snapshot load time. The rule
//! set is only ever mutated by atomic snapshot replacement.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Authentication,
    Network,
    Malware,
    Exfiltration,
    Persistence,
    PrivilegeEscalation,
    Anomaly,
    Compliance,
    Other,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::Network => "network",
            Self::Malware => "malware",
            Self::Exfiltration => "exfiltration",
            Self::Persistence => "persistence",
            Self::PrivilegeEscalation => "privilege_escalation",
            Self::Anomaly => "anomaly",
            Self::Compliance => "compliance",
            Self::Other => "other",
        }
    }

    pub fn from_str_loose(value: &str) -> Self {
        match value {
            "authentication" => Self::Authentication,
            "network" => Self::Network,
            "malware" => Self::Malware,
            "exfiltration" => Self::Exfiltration,
            "persistence" => Self::Persistence,
            "privilege_escalation" => Self::PrivilegeEscalation,
            "anomaly" => Self::Anomaly,
            "compliance" => Self::Compliance,
            _ => Self::Other,
        }
    }

    /// Title prefix used by the incident manager's per-type templates
    pub fn incident_title_prefix(&self) -> &'static str {
        match self {
            Self::Authentication => "Authentication attack",
            Self::Network => "Suspicious network activity",
            Self::Malware => "Malware detection",
            Self::Exfiltration => "Possible data exfiltration",
            Self::Persistence => "Persistence mechanism",
            Self::PrivilegeEscalation => "Privilege escalation",
            Self::Anomaly => "Anomalous behavior",
            Self::Compliance => "Compliance violation",
            Self::Other => "Security incident",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSeverity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl RuleSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Info => "info",
        }
    }

    pub fn from_str_loose(value: &str) -> Self {
        match value {
            "critical" => Self::Critical,
            "high" => Self::High,
            "medium" => Self::Medium,
            "low" => Self::Low,
            _ => Self::Info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RulePriority {
    High,
    Normal,
    Low,
}

impl RulePriority {
    pub fn from_str_loose(value: &str) -> Self {
        match value {
            "high" => Self::High,
            "low" => Self::Low,
            _ => Self::Normal,
        }
    }
}

/// Operators a condition can apply to an event field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    Contains,
    #[serde(rename = "startswith")]
    StartsWith,
    #[serde(rename = "endswith")]
    EndsWith,
    Regex,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

impl ConditionOperator {
    pub fn from_str_loose(value: &str) -> Option<Self> {
        Some(match value {
            "eq" | "==" => Self::Eq,
            "neq" | "!=" => Self::Neq,
            "lt" | "<" => Self::Lt,
            "lte" | "<=" => Self::Lte,
            "gt" | ">" => Self::Gt,
            "gte" | ">=" => Self::Gte,
            "contains" => Self::Contains,
            "startswith" => Self::StartsWith,
            "endswith" => Self::EndsWith,
            "regex" => Self::Regex,
            "in" => Self::In,
            "not_in" => Self::NotIn,
            "is_null" => Self::IsNull,
            "is_not_null" => Self::IsNotNull,
            _ => return None,
        })
    }
}

/// A single field test. String comparisons are case-insensitive unless
/// `case_sensitive` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCondition {
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default = "default_true")]
    pub is_required: bool,
}

fn default_true() -> bool {
    true
}

/// Condition tree. Serialized as a tagged union so rule snapshots can
/// carry arbitrary and/or/not nesting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ConditionNode {
    And { children: Vec<ConditionNode> },
    Or { children: Vec<ConditionNode> },
    Not { child: Box<ConditionNode> },
    Cond(RuleCondition),
}

impl ConditionNode {
    /// Compile the flat ordered condition list into the evaluation tree:
    /// required conditions are AND'd into the root, optional conditions
    /// fold into a single OR subtree.
    pub fn compile(conditions: &[RuleCondition]) -> Self {
        let mut required: Vec<ConditionNode> = Vec::new();
        let mut optional: Vec<ConditionNode> = Vec::new();
        for condition in conditions {
            let node = ConditionNode::Cond(condition.clone());
            if condition.is_required {
                required.push(node);
            } else {
                optional.push(node);
            }
        }
        if !optional.is_empty() {
            required.push(ConditionNode::Or { children: optional });
        }
        ConditionNode::And { children: required }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateOp {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateOp {
    pub fn from_str_loose(value: &str) -> Option<Self> {
        Some(match value {
            "count" => Self::Count,
            "sum" => Self::Sum,
            "avg" => Self::Avg,
            "min" => Self::Min,
            "max" => Self::Max,
            _ => return None,
        })
    }
}

/// Threshold aggregation over the event buffer window.
///
/// `field: None` means the aggregate applies to the events themselves
/// (the `*` form), which only makes sense for `count`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aggregation {
    pub field: Option<String>,
    pub op: AggregateOp,
    pub threshold: f64,
    /// Comparison applied as `aggregate <operator> threshold`
    #[serde(default = "default_agg_operator")]
    pub operator: ConditionOperator,
}

fn default_agg_operator() -> ConditionOperator {
    ConditionOperator::Gt
}

/// Action executed after an incident commit. The executor itself is an
/// external collaborator; failures are retried and never roll back the
/// incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleAction {
    pub action_type: String,
    pub target: String,
    #[serde(default)]
    pub payload: Value,
}

/// A correlation rule, versioned and replaced wholesale on reload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    pub name: String,
    pub rule_type: RuleType,
    pub severity: RuleSeverity,
    pub priority: RulePriority,
    pub time_window_minutes: i64,
    /// Ordered flat conditions as stored; compiled into `condition_tree`
    pub conditions: Vec<RuleCondition>,
    pub condition_tree: ConditionNode,
    pub aggregation: Option<Aggregation>,
    #[serde(default)]
    pub actions: Vec<RuleAction>,
    /// Field path whose value overrides the incident dedup key
    pub dedup_field: Option<String>,
    pub enabled: bool,
}

impl Rule {
    pub fn new(
        id: Uuid,
        name: impl Into<String>,
        rule_type: RuleType,
        severity: RuleSeverity,
        priority: RulePriority,
        time_window_minutes: i64,
        conditions: Vec<RuleCondition>,
    ) -> Self {
        let condition_tree = ConditionNode::compile(&conditions);
        Self {
            id,
            name: name.into(),
            rule_type,
            severity,
            priority,
            time_window_minutes,
            conditions,
            condition_tree,
            aggregation: None,
            actions: Vec::new(),
            dedup_field: None,
            enabled: true,
        }
    }

    /// Critical rules are always evaluated, even for batched events
    pub fn is_critical(&self) -> bool {
        self.severity == RuleSeverity::Critical
            || self.priority == RulePriority::High
            || matches!(self.rule_type, RuleType::Authentication | RuleType::Malware)
    }

    pub fn time_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.time_window_minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(field: &str, required: bool) -> RuleCondition {
        RuleCondition {
            field: field.to_string(),
            operator: ConditionOperator::Eq,
            value: Value::String("x".to_string()),
            case_sensitive: false,
            is_required: required,
        }
    }

    #[test]
    fn test_compile_splits_required_and_optional() {
        let tree = ConditionNode::compile(&[
            condition("a", true),
            condition("b", false),
            condition("c", false),
        ]);
        match tree {
            ConditionNode::And { children } => {
                assert_eq!(children.len(), 2);
                assert!(matches!(children[0], ConditionNode::Cond(_)));
                match &children[1] {
                    ConditionNode::Or { children } => assert_eq!(children.len(), 2),
                    other => panic!("expected Or subtree, got {:?}", other),
                }
            }
            other => panic!("expected And root, got {:?}", other),
        }
    }

    #[test]
    fn test_condition_tree_round_trips_through_json() {
        let tree = ConditionNode::compile(&[condition("a", true), condition("b", false)]);
        let json = serde_json::to_string(&tree).unwrap();
        let parsed: ConditionNode = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, ConditionNode::And { .. }));
    }

    #[test]
    fn test_critical_rule_detection() {
        let mut rule = Rule::new(
            Uuid::new_v4(),
            "test",
            RuleType::Network,
            RuleSeverity::Medium,
            RulePriority::Normal,
            5,
            vec![],
        );
        assert!(!rule.is_critical());

        rule.severity = RuleSeverity::Critical;
        assert!(rule.is_critical());

        rule.severity = RuleSeverity::Medium;
        rule.rule_type = RuleType::Authentication;
        assert!(rule.is_critical());
    }

    #[test]
    fn test_operator_parsing() {
        assert_eq!(ConditionOperator::from_str_loose("eq"), Some(ConditionOperator::Eq));
        assert_eq!(
            ConditionOperator::from_str_loose("startswith"),
            Some(ConditionOperator::StartsWith)
        );
        assert_eq!(
            ConditionOperator::from_str_loose("not_in"),
            Some(ConditionOperator::NotIn)
        );
        assert_eq!(ConditionOperator::from_str_loose("bogus"), None);
    }
}
