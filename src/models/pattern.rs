//! Multi-event pattern model
//!
//! Patterns describe sequences or co-occurrences evaluated over the
//! time-windowed event buffer. They originate from the external rule
//! importer, like rules, and are installed alongside rule snapshots.

use crate::models::event::EventSource;
use crate::models::rule::{RuleCondition, RuleSeverity};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One step of a pattern: a condition set, optionally pinned to a
/// buffer key, with an optional maximum gap from the previous step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternStep {
    /// Restrict candidates to this source (buffer key scoping)
    pub source: Option<EventSource>,
    /// Restrict candidates to this event code (buffer key scoping)
    pub event_id: Option<String>,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    /// Maximum seconds between this step and the previous one
    pub max_gap_secs: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub id: Uuid,
    pub name: String,
    pub pattern_type: String,
    pub severity: RuleSeverity,
    /// Confidence carried onto the incident links, in `[0, 1]`
    pub relevance_score: f64,
    pub steps: Vec<PatternStep>,
}

impl Pattern {
    /// Buffer keys this pattern can possibly involve. An unscoped step
    /// returns `None`, meaning the matcher must scan all keys.
    pub fn scoped_keys(&self) -> Option<Vec<String>> {
        let mut keys = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            match (&step.source, &step.event_id) {
                (Some(source), Some(event_id)) => {
                    keys.push(format!("{}:{}", source.as_str(), event_id));
                }
                _ => return None,
            }
        }
        Some(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_keys_require_full_scoping() {
        let scoped = Pattern {
            id: Uuid::new_v4(),
            name: "lateral".to_string(),
            pattern_type: "sequence".to_string(),
            severity: RuleSeverity::High,
            relevance_score: 0.8,
            steps: vec![
                PatternStep {
                    source: Some(EventSource::WindowsEvent),
                    event_id: Some("4624".to_string()),
                    conditions: vec![],
                    max_gap_secs: None,
                },
                PatternStep {
                    source: Some(EventSource::WindowsEvent),
                    event_id: Some("4688".to_string()),
                    conditions: vec![],
                    max_gap_secs: Some(300),
                },
            ],
        };
        assert_eq!(
            scoped.scoped_keys(),
            Some(vec![
                "windows_event:4624".to_string(),
                "windows_event:4688".to_string()
            ])
        );

        let mut unscoped = scoped.clone();
        unscoped.steps[1].event_id = None;
        assert_eq!(unscoped.scoped_keys(), None);
    }
}
