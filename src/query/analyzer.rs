//! Query complexity analyzer
//!
//! Scores a parsed query against fixed limits before admission. A query
//! is valid only when no limit is violated and the total score stays
//! under the configured ceiling. The analyzer also produces an advisory
//! resource estimate consumed by the resource manager.

use crate::config::QueryConfig;
use crate::query::ast::{LqlQuery, Stage};
use crate::query::planner::estimate_rows;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Inclusive time range of a query request
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn hours(&self) -> f64 {
        (self.end - self.start).num_milliseconds() as f64 / 3_600_000.0
    }

    pub fn last_hours(hours: i64) -> Self {
        let end = Utc::now();
        Self { start: end - chrono::Duration::hours(hours), end }
    }
}

/// Advisory resource estimate derived from rows, range, and score
#[derive(Debug, Clone, Serialize)]
pub struct ResourceEstimate {
    pub memory_bytes: u64,
    pub cpu_percent: u32,
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComplexityReport {
    pub score: u32,
    pub violations: Vec<String>,
    pub warnings: Vec<String>,
    pub valid: bool,
    pub estimate: ResourceEstimate,
}

pub struct ComplexityAnalyzer {
    config: QueryConfig,
}

impl ComplexityAnalyzer {
    pub fn new(config: QueryConfig) -> Self {
        Self { config }
    }

    pub fn analyze(
        &self,
        query: &LqlQuery,
        time_range: &TimeRange,
        timeout_ms: Option<u64>,
    ) -> ComplexityReport {
        let mut score: u32 = 0;
        let mut violations = Vec::new();
        let mut warnings = Vec::new();

        let stats = QueryStats::collect(query);

        // Requested row limit
        if let Some(limit) = stats.row_limit {
            if limit > self.config.max_rows {
                violations.push(format!(
                    "Row limit {} exceeds maximum {}",
                    limit, self.config.max_rows
                ));
                score += 30;
            }
        }

        // Requested timeout
        if let Some(timeout) = timeout_ms {
            if timeout > self.config.max_timeout_ms {
                violations.push(format!(
                    "Timeout {}ms exceeds maximum {}ms",
                    timeout, self.config.max_timeout_ms
                ));
                score += 20;
            }
        }

        // Time range: the boundary itself is accepted, anything beyond
        // is rejected
        let hours = time_range.hours();
        let max_hours = self.config.max_time_range_hours as f64;
        if hours > max_hours {
            violations.push(format!(
                "Time range exceeds maximum of {} hours",
                self.config.max_time_range_hours
            ));
            score += 25;
        }
        if hours > 168.0 {
            score += 20;
        } else if hours > 24.0 {
            score += 10;
        }
        if hours > 24.0 && hours <= max_hours {
            warnings.push(format!("Time range of {:.0} hours may be slow", hours));
        }

        // Joins
        if stats.joins > self.config.max_joins {
            violations.push(format!(
                "Too many joins: {} (maximum {})",
                stats.joins, self.config.max_joins
            ));
        }
        score += (5 * stats.joins) as u32;

        // Aggregations
        if stats.aggregations > self.config.max_aggregations {
            violations.push(format!(
                "Too many aggregations: {} (maximum {})",
                stats.aggregations, self.config.max_aggregations
            ));
        }
        score += (3 * stats.aggregations) as u32;

        // Nested queries (join right sides with their own stages)
        if stats.nested_queries > self.config.max_nested_queries {
            violations.push(format!(
                "Too many nested queries: {} (maximum {})",
                stats.nested_queries, self.config.max_nested_queries
            ));
        }
        score += (8 * stats.nested_queries) as u32;

        if stats.uses_regex {
            score += 10;
        }

        if stats.has_sort && stats.row_limit.is_none() {
            score += 15;
            warnings.push("sort without a row limit sorts the full result".to_string());
        }

        if stats.has_wildcard && stats.row_limit.is_none() {
            score += 20;
            violations.push("Wildcard search without a row limit".to_string());
        }

        if !stats.has_where && stats.row_limit.is_none() {
            score += 25;
            violations.push("Query has neither a filter nor a row limit".to_string());
        }

        let valid = violations.is_empty() && score <= self.config.complexity_score_limit;

        let est_rows = stats.row_limit.unwrap_or_else(|| estimate_rows(query));
        let estimate = ResourceEstimate {
            memory_bytes: est_rows.saturating_mul(1024),
            cpu_percent: score.min(100),
            execution_time_ms: (u64::from(score) * 50) + (hours.max(0.0) as u64) * 10,
        };

        if !valid {
            warnings.push("consider adding a where clause or lowering the time range".to_string());
        }

        ComplexityReport { score, violations, warnings, valid, estimate }
    }
}

#[derive(Debug, Default)]
struct QueryStats {
    joins: usize,
    aggregations: usize,
    nested_queries: usize,
    uses_regex: bool,
    has_sort: bool,
    has_where: bool,
    has_wildcard: bool,
    row_limit: Option<u64>,
}

impl QueryStats {
    fn collect(query: &LqlQuery) -> Self {
        let mut stats = QueryStats::default();
        stats.walk(query);
        stats
    }

    fn walk(&mut self, query: &LqlQuery) {
        for stage in &query.stages {
            match stage {
                Stage::Where { filter } => {
                    self.has_where = true;
                    self.uses_regex |= filter.uses_regex();
                    self.has_wildcard |= filter.has_wildcard();
                }
                Stage::Project { .. } => {}
                Stage::Summarize { aggs, .. } => self.aggregations += aggs.len(),
                Stage::Sort { .. } => self.has_sort = true,
                Stage::Top { n, .. } => {
                    self.row_limit = Some(self.row_limit.map_or(*n, |limit| limit.min(*n)));
                }
                Stage::Join { right, on, .. } => {
                    self.joins += 1;
                    self.uses_regex |= on.uses_regex();
                    if !right.stages.is_empty() {
                        self.nested_queries += 1;
                    }
                    self.walk(right);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parser::parse;

    fn analyzer() -> ComplexityAnalyzer {
        ComplexityAnalyzer::new(QueryConfig::default())
    }

    #[test]
    fn test_simple_query_is_valid() {
        let query = parse("logs | where severity == \"high\" | top 100 by timestamp desc").unwrap();
        let report = analyzer().analyze(&query, &TimeRange::last_hours(1), None);
        assert!(report.valid, "violations: {:?}", report.violations);
        assert!(report.score <= 100);
    }

    #[test]
    fn test_many_joins_and_long_range_rejected() {
        let mut lql = String::from("logs ");
        for i in 0..6 {
            lql.push_str(&format!(
                "| join kind=inner (t{} | where x == {}) on event_id == event_id ",
                i, i
            ));
        }
        let query = parse(&lql).unwrap();
        let report = analyzer().analyze(&query, &TimeRange::last_hours(200), None);

        assert!(!report.valid);
        assert!(report.violations.iter().any(|v| v.contains("Too many joins")));
        assert!(report
            .violations
            .iter()
            .any(|v| v.contains("Time range exceeds maximum")));
        assert!(report.score > 100, "score was {}", report.score);
    }

    #[test]
    fn test_time_range_boundary_accepted() {
        let query = parse("logs | where severity == \"high\" | top 10 by timestamp desc").unwrap();
        // Exactly the maximum is fine
        let report = analyzer().analyze(&query, &TimeRange::last_hours(168), None);
        assert!(
            !report.violations.iter().any(|v| v.contains("Time range")),
            "violations: {:?}",
            report.violations
        );

        // A hair beyond the maximum is rejected
        let end = Utc::now();
        let range = TimeRange {
            start: end - chrono::Duration::hours(168) - chrono::Duration::milliseconds(1),
            end,
        };
        let report = analyzer().analyze(&query, &range, None);
        assert!(report.violations.iter().any(|v| v.contains("Time range")));
    }

    #[test]
    fn test_unbounded_scan_is_violation() {
        let query = parse("logs | project event_id").unwrap();
        let report = analyzer().analyze(&query, &TimeRange::last_hours(1), None);
        assert!(!report.valid);
        assert!(report
            .violations
            .iter()
            .any(|v| v.contains("neither a filter nor a row limit")));
    }

    #[test]
    fn test_wildcard_without_limit_is_violation() {
        let query = parse("logs | where message contains \"*\"").unwrap();
        let report = analyzer().analyze(&query, &TimeRange::last_hours(1), None);
        assert!(report.violations.iter().any(|v| v.contains("Wildcard")));

        let bounded = parse("logs | where message contains \"*\" | top 10 by timestamp desc").unwrap();
        let report = analyzer().analyze(&bounded, &TimeRange::last_hours(1), None);
        assert!(!report.violations.iter().any(|v| v.contains("Wildcard")));
    }

    #[test]
    fn test_regex_and_unlimited_sort_add_score() {
        let plain = parse("logs | where a == 1 | top 10 by a desc").unwrap();
        let base = analyzer().analyze(&plain, &TimeRange::last_hours(1), None).score;

        let regex = parse("logs | where a matches \"fail.*\" | top 10 by a desc").unwrap();
        let with_regex = analyzer().analyze(&regex, &TimeRange::last_hours(1), None).score;
        assert_eq!(with_regex, base + 10);

        let sorted = parse("logs | where a == 1 | sort by a desc").unwrap();
        let with_sort = analyzer().analyze(&sorted, &TimeRange::last_hours(1), None).score;
        assert_eq!(with_sort, base + 15);
    }

    #[test]
    fn test_timeout_over_limit_is_violation() {
        let query = parse("logs | where a == 1 | top 10 by a desc").unwrap();
        let report = analyzer().analyze(&query, &TimeRange::last_hours(1), Some(300_000));
        assert!(report.violations.iter().any(|v| v.contains("Timeout")));
    }

    #[test]
    fn test_estimate_is_populated() {
        let query = parse("logs | where a == 1 | top 500 by a desc").unwrap();
        let report = analyzer().analyze(&query, &TimeRange::last_hours(48), None);
        assert_eq!(report.estimate.memory_bytes, 500 * 1024);
        assert!(report.estimate.execution_time_ms > 0);
    }
}
