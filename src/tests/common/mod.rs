//! Shared helpers for the pipeline tests

use crate::config::CorrelationConfig;
use crate::correlation::{
    CorrelationEngine, EventBuffer, IncidentManager, IncidentRepository,
    InMemoryIncidentRepository, LoggingActionExecutor, PatternMatcher, RuleStore,
};
use crate::models::{
    AggregateOp, Aggregation, ConditionOperator, EventSeverity, EventSource, HostInfo,
    NormalizedEvent, Rule, RuleCondition, RulePriority, RuleSeverity, RuleType, UserInfo,
};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

pub fn windows_event(event_id: &str, user: &str, host: &str) -> NormalizedEvent {
    let mut event = NormalizedEvent::new(
        EventSource::WindowsEvent,
        event_id,
        EventSeverity::High,
        format!("event {} for {}", event_id, user),
        HostInfo { hostname: host.to_string(), ips: vec![] },
    );
    event.user = Some(UserInfo { name: user.to_string(), id: None, domain: None });
    event
}

pub fn eq_condition(field: &str, value: &str) -> RuleCondition {
    RuleCondition {
        field: field.to_string(),
        operator: ConditionOperator::Eq,
        value: json!(value),
        case_sensitive: false,
        is_required: true,
    }
}

pub fn simple_rule(name: &str, event_id: &str) -> Rule {
    Rule::new(
        Uuid::new_v4(),
        name,
        RuleType::Network,
        RuleSeverity::Medium,
        RulePriority::Normal,
        5,
        vec![eq_condition("event_id", event_id)],
    )
}

/// The scenario rule: five failed logons for one user inside five
/// minutes
pub fn auth_burst_rule(user: &str) -> Rule {
    let mut rule = Rule::new(
        Uuid::new_v4(),
        "auth failure burst",
        RuleType::Authentication,
        RuleSeverity::High,
        RulePriority::Normal,
        5,
        vec![eq_condition("event_id", "4625"), eq_condition("user.name", user)],
    );
    rule.aggregation = Some(Aggregation {
        field: None,
        op: AggregateOp::Count,
        threshold: 5.0,
        operator: ConditionOperator::Gt,
    });
    rule
}

pub struct TestPipeline {
    pub engine: Arc<CorrelationEngine>,
    pub repo: Arc<InMemoryIncidentRepository>,
    pub store: Arc<RuleStore>,
}

pub fn pipeline(config: CorrelationConfig, rules: Vec<Rule>) -> TestPipeline {
    let repo = Arc::new(InMemoryIncidentRepository::new());
    let incidents = Arc::new(IncidentManager::new(
        Arc::clone(&repo) as Arc<dyn IncidentRepository>,
        Arc::new(LoggingActionExecutor),
    ));
    let store = Arc::new(RuleStore::new());
    store.install(rules);
    let buffer = Arc::new(EventBuffer::new(config.memory_buffer_size_limit));
    let engine = Arc::new(CorrelationEngine::new(
        config,
        buffer,
        Arc::clone(&store),
        Arc::new(PatternMatcher::new()),
        incidents,
    ));
    TestPipeline { engine, repo, store }
}
