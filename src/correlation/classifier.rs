//! Event priority classifier
//!
//! Maps an event to a processing priority from static event-id sets.
//! Critical and high priority events bypass batching, and only critical
//! events run the pattern matcher when the fast path is enabled.

use crate::models::NormalizedEvent;
use once_cell::sync::Lazy;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    Low,
    Normal,
    High,
    Critical,
}

/// Event codes that always take the critical path: explicit credential
/// use, privileged logon, account creation, audit log tampering,
/// scheduled task creation, security service changes.
static CRITICAL_EVENT_IDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "4648", "4672", "4720", "1102", "4698", "4697", "7045", "4719",
    ])
});

/// Codes worth immediate evaluation but not the full critical path:
/// failed logons, process creation, service installs, group changes.
static HIGH_EVENT_IDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "4625", "4688", "4728", "4732", "4756", "4740", "AUTHFAIL", "ConsoleLogin",
    ])
});

/// Routine security telemetry
static NORMAL_EVENT_IDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from(["4624", "4634", "4647", "4768", "4769", "5140"])
});

pub struct PriorityClassifier;

impl PriorityClassifier {
    pub fn classify(event: &NormalizedEvent) -> EventPriority {
        let code = event.event_id.as_str();
        if CRITICAL_EVENT_IDS.contains(code) {
            EventPriority::Critical
        } else if HIGH_EVENT_IDS.contains(code) {
            EventPriority::High
        } else if NORMAL_EVENT_IDS.contains(code) {
            EventPriority::Normal
        } else {
            EventPriority::Low
        }
    }
}
