//! Multi-event pattern matcher
//!
//! Matches pattern step sequences against the event buffer. The final
//! step must be satisfied by the incoming event; earlier steps are
//! searched backwards through the buffer windows, honoring each step's
//! maximum inter-step gap. Non-critical events skip pattern matching
//! entirely when the fast path is enabled.

use crate::correlation::buffer::EventBuffer;
use crate::correlation::evaluator::RuleEvaluator;
use crate::models::{ConditionNode, NormalizedEvent, Pattern, PatternStep};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use std::sync::RwLock;

/// A pattern that fired, with the chain of events that satisfied it in
/// step order
#[derive(Debug, Clone)]
pub struct PatternMatch {
    pub pattern: Arc<Pattern>,
    pub events: Vec<Arc<NormalizedEvent>>,
}

pub struct PatternMatcher {
    patterns: RwLock<Arc<Vec<Arc<Pattern>>>>,
    evaluator: RuleEvaluator,
    /// Lookback horizon for the first step of a pattern
    lookback: Duration,
}

impl Default for PatternMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternMatcher {
    pub fn new() -> Self {
        Self {
            patterns: RwLock::new(Arc::new(Vec::new())),
            evaluator: RuleEvaluator::new(),
            lookback: Duration::hours(2),
        }
    }

    /// Atomically replace the installed pattern set
    pub fn install(&self, patterns: Vec<Pattern>) {
        let patterns: Vec<Arc<Pattern>> = patterns.into_iter().map(Arc::new).collect();
        if let Ok(mut guard) = self.patterns.write() {
            tracing::info!("Installed {} correlation patterns", patterns.len());
            *guard = Arc::new(patterns);
        }
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.read().map(|guard| guard.len()).unwrap_or(0)
    }

    /// Find every installed pattern whose final step is satisfied by
    /// `event` and whose earlier steps can be anchored in the buffer.
    pub fn matches(
        &self,
        event: &Arc<NormalizedEvent>,
        buffer: &EventBuffer,
        now: DateTime<Utc>,
    ) -> Vec<PatternMatch> {
        let patterns = match self.patterns.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(_) => return Vec::new(),
        };

        let mut matches = Vec::new();
        for pattern in patterns.iter() {
            if pattern.steps.is_empty() {
                continue;
            }
            let last_step = &pattern.steps[pattern.steps.len() - 1];
            if !self.step_accepts(last_step, event) {
                continue;
            }
            if let Some(mut chain) = self.anchor_prefix(
                &pattern.steps[..pattern.steps.len() - 1],
                event,
                last_step.max_gap_secs,
                buffer,
                now,
            ) {
                chain.push(Arc::clone(event));
                matches.push(PatternMatch { pattern: Arc::clone(pattern), events: chain });
            }
        }
        matches
    }

    /// Walk the prefix steps from the back, finding for each one the
    /// latest buffer event that satisfies it and precedes its successor
    /// within the allowed gap. Returns the chain in step order.
    fn anchor_prefix(
        &self,
        prefix: &[PatternStep],
        tail_event: &Arc<NormalizedEvent>,
        tail_gap_secs: Option<i64>,
        buffer: &EventBuffer,
        now: DateTime<Utc>,
    ) -> Option<Vec<Arc<NormalizedEvent>>> {
        let mut chain: Vec<Arc<NormalizedEvent>> = Vec::with_capacity(prefix.len());
        let mut successor_ts = tail_event.timestamp;
        let mut successor_gap = tail_gap_secs;

        for step in prefix.iter().rev() {
            let earliest = match successor_gap {
                Some(gap) => successor_ts - Duration::seconds(gap),
                None => now - self.lookback,
            };

            let candidate = self
                .candidates(step, buffer, earliest)
                .into_iter()
                .filter(|candidate| {
                    candidate.timestamp <= successor_ts
                        && candidate.id != tail_event.id
                        && !chain.iter().any(|picked| picked.id == candidate.id)
                })
                .max_by_key(|candidate| candidate.timestamp);

            let candidate = candidate?;
            successor_ts = candidate.timestamp;
            successor_gap = step.max_gap_secs;
            chain.push(candidate);
        }

        chain.reverse();
        Some(chain)
    }

    fn candidates(
        &self,
        step: &PatternStep,
        buffer: &EventBuffer,
        since: DateTime<Utc>,
    ) -> Vec<Arc<NormalizedEvent>> {
        let keys: Vec<String> = match (&step.source, &step.event_id) {
            (Some(source), Some(event_id)) => {
                vec![format!("{}:{}", source.as_str(), event_id)]
            }
            _ => buffer.keys(),
        };

        let mut out = Vec::new();
        for key in keys {
            for event in buffer.window(&key, since) {
                if self.step_accepts(step, &event) {
                    out.push(event);
                }
            }
        }
        out
    }

    fn step_accepts(&self, step: &PatternStep, event: &Arc<NormalizedEvent>) -> bool {
        if let Some(source) = step.source {
            if event.source != source {
                return false;
            }
        }
        if let Some(event_id) = &step.event_id {
            if &event.event_id != event_id {
                return false;
            }
        }
        if step.conditions.is_empty() {
            return true;
        }
        let tree = ConditionNode::compile(&step.conditions);
        self.evaluator.eval_tree(&tree, event).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        EventSeverity, EventSource, HostInfo, RuleSeverity,
    };
    use uuid::Uuid;

    fn buffered_event(event_id: &str, minutes_ago: i64) -> Arc<NormalizedEvent> {
        let mut event = NormalizedEvent::new(
            EventSource::WindowsEvent,
            event_id,
            EventSeverity::High,
            "m",
            HostInfo { hostname: "WS7".to_string(), ips: vec![] },
        );
        event.timestamp = Utc::now() - Duration::minutes(minutes_ago);
        Arc::new(event)
    }

    fn two_step_pattern(max_gap_secs: Option<i64>) -> Pattern {
        Pattern {
            id: Uuid::new_v4(),
            name: "logon then process".to_string(),
            pattern_type: "sequence".to_string(),
            severity: RuleSeverity::High,
            relevance_score: 0.85,
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
                    max_gap_secs,
                },
            ],
        }
    }

    #[test]
    fn test_sequence_matches_in_order() {
        let matcher = PatternMatcher::new();
        matcher.install(vec![two_step_pattern(Some(600))]);

        let buffer = EventBuffer::new(100);
        let logon = buffered_event("4624", 5);
        buffer.insert(Arc::clone(&logon));

        let spawn = buffered_event("4688", 0);
        buffer.insert(Arc::clone(&spawn));

        let matches = matcher.matches(&spawn, &buffer, Utc::now());
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].events.len(), 2);
        assert_eq!(matches[0].events[0].id, logon.id);
        assert_eq!(matches[0].events[1].id, spawn.id);
    }

    #[test]
    fn test_gap_constraint_rejects_stale_prefix() {
        let matcher = PatternMatcher::new();
        matcher.install(vec![two_step_pattern(Some(60))]);

        let buffer = EventBuffer::new(100);
        // Logon 5 minutes before the process event, gap allows 60 s
        buffer.insert(buffered_event("4624", 5));
        let spawn = buffered_event("4688", 0);
        buffer.insert(Arc::clone(&spawn));

        let matches = matcher.matches(&spawn, &buffer, Utc::now());
        assert!(matches.is_empty());
    }

    #[test]
    fn test_event_not_matching_final_step_is_ignored() {
        let matcher = PatternMatcher::new();
        matcher.install(vec![two_step_pattern(None)]);

        let buffer = EventBuffer::new(100);
        let logon = buffered_event("4624", 1);
        buffer.insert(Arc::clone(&logon));

        let matches = matcher.matches(&logon, &buffer, Utc::now());
        assert!(matches.is_empty());
    }

    #[test]
    fn test_install_replaces_pattern_set() {
        let matcher = PatternMatcher::new();
        matcher.install(vec![two_step_pattern(None)]);
        assert_eq!(matcher.pattern_count(), 1);
        matcher.install(vec![]);
        assert_eq!(matcher.pattern_count(), 0);
    }
}
