//! End-to-end correlation scenarios over the in-memory stores

use super::common::{auth_burst_rule, pipeline, simple_rule, windows_event};
use crate::config::CorrelationConfig;
use crate::correlation::EventPriority;
use crate::models::{RulePriority, RuleSeverity, RuleType};
use std::sync::atomic::Ordering;

#[tokio::test]
async fn test_auth_failure_burst_raises_one_incident() {
    let rule = auth_burst_rule("alice");
    let rule_severity = rule.severity;
    let setup = pipeline(CorrelationConfig::default(), vec![rule]);

    // Six failed logons for alice on DC01 inside the window
    for i in 0..6 {
        let outcome = setup
            .engine
            .process_event(windows_event("4625", "alice", "DC01"))
            .await
            .unwrap();
        // The aggregation threshold (count > 5) only trips on the sixth
        if i < 5 {
            assert!(outcome.matched_rules.is_empty(), "matched too early at event {}", i);
        } else {
            assert_eq!(outcome.matched_rules.len(), 1);
        }
    }

    let incidents = setup.repo.all();
    assert_eq!(incidents.len(), 1, "expected exactly one incident");
    let incident = &incidents[0];
    assert_eq!(incident.event_count, 6);
    assert_eq!(incident.severity, rule_severity);
    assert!(incident.affected_assets.contains("DC01"));
    assert!(incident.affected_assets.contains("user:alice"));

    // A seventh failure updates the same incident instead of raising a
    // second one
    setup
        .engine
        .process_event(windows_event("4625", "alice", "DC01"))
        .await
        .unwrap();
    let incidents = setup.repo.all();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].event_count, 7);
}

#[tokio::test]
async fn test_burst_for_other_user_does_not_match() {
    let setup = pipeline(CorrelationConfig::default(), vec![auth_burst_rule("alice")]);

    for _ in 0..6 {
        let outcome = setup
            .engine
            .process_event(windows_event("4625", "mallory", "DC01"))
            .await
            .unwrap();
        assert!(outcome.matched_rules.is_empty());
    }
    assert!(setup.repo.is_empty());
}

#[tokio::test]
async fn test_critical_event_with_large_rule_set() {
    // 200 active rules plus 10 critical ones
    let mut rules = Vec::new();
    for i in 0..200 {
        rules.push(simple_rule(&format!("rule {}", i), &format!("id{}", i)));
    }
    for i in 0..10 {
        let mut rule = simple_rule(&format!("critical {}", i), "4648");
        rule.rule_type = RuleType::Authentication;
        rule.severity = RuleSeverity::Critical;
        rule.priority = RulePriority::High;
        rules.push(rule);
    }

    let config = CorrelationConfig::default();
    assert!(config.parallel_rule_evaluation);
    let setup = pipeline(config, vec![]);
    setup.store.install(rules);

    let outcome = setup
        .engine
        .process_event(windows_event("4648", "svc", "WS9"))
        .await
        .unwrap();

    assert_eq!(outcome.priority, EventPriority::Critical);
    // All ten critical rules match the explicit-credential event
    assert_eq!(outcome.matched_rules.len(), 10);
    // One cache entry per evaluated rule, at most
    assert!(setup.engine.cache_len() <= 210, "cache grew to {}", setup.engine.cache_len());
    // Exactly one processing-time sample was recorded
    assert_eq!(setup.engine.metrics.processed.load(Ordering::Relaxed), 1);
    assert!(outcome.duration_ms >= 0.0);
}

#[tokio::test]
async fn test_buffer_bound_holds_under_load() {
    let mut config = CorrelationConfig::default();
    config.memory_buffer_size_limit = 50;
    let setup = pipeline(config, vec![]);

    for i in 0..500 {
        setup
            .engine
            .process_event(windows_event(&format!("id{}", i % 7), "u", "h"))
            .await
            .unwrap();
    }
    assert!(setup.engine.buffer().len() <= 50);
}

#[tokio::test]
async fn test_incident_dedup_is_per_host() {
    let mut rule = simple_rule("per-host", "4625");
    rule.dedup_field = Some("host.hostname".to_string());
    let setup = pipeline(CorrelationConfig::default(), vec![rule]);

    for host in ["DC01", "DC01", "DC02"] {
        setup
            .engine
            .process_event(windows_event("4625", "alice", host))
            .await
            .unwrap();
    }

    let incidents = setup.repo.all();
    assert_eq!(incidents.len(), 2);
}
