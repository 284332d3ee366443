//! Incident model and status state machine
//!
//! An incident is a deduplicated, aggregating record of one or more
//! events that satisfied a rule or pattern. Created and mutated only by
//! the incident manager; `closed` is terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::models::rule::RuleSeverity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Open,
    Investigating,
    Closed,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Investigating => "investigating",
            Self::Closed => "closed",
        }
    }

    pub fn from_str_loose(value: &str) -> Self {
        match value {
            "investigating" => Self::Investigating,
            "closed" => Self::Closed,
            _ => Self::Open,
        }
    }

    /// Valid transitions: open -> investigating -> closed, and either
    /// non-terminal state may close directly.
    pub fn can_transition_to(&self, next: IncidentStatus) -> bool {
        matches!(
            (self, next),
            (Self::Open, Self::Investigating)
                | (Self::Open, Self::Closed)
                | (Self::Investigating, Self::Closed)
        )
    }
}

/// Link from an incident to a matched event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLink {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Rule confidence or pattern relevance score at link time
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    /// Exactly one of `rule_id` / `pattern_id` is set
    pub rule_id: Option<Uuid>,
    pub pattern_id: Option<Uuid>,
    pub severity: RuleSeverity,
    pub title: String,
    pub description: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub event_count: i64,
    pub affected_assets: BTreeSet<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    pub status: IncidentStatus,
    /// The incident's dedup key, stable for its lifetime
    pub dedup_key: String,
    #[serde(default)]
    pub events: Vec<EventLink>,
}

impl Incident {
    /// Append an event link unless the event is already linked, keeping
    /// `event_count` equal to the number of distinct linked events.
    pub fn link_event(&mut self, link: EventLink) -> bool {
        if self.events.iter().any(|existing| existing.event_id == link.event_id) {
            return false;
        }
        self.events.push(link);
        self.event_count = self.events.len() as i64;
        true
    }
}
