//! End-to-end query engine checks against the documented SQL shapes

use crate::query::{TimeRange, emit, optimize, parse, plan, validate_semantics};

#[test]
fn test_lql_to_sql_fidelity() {
    let query = parse(
        "logs | where severity == \"high\" and source_ip contains \"10.0.\" \
         | summarize count() by event_id | top 5 by count_ desc",
    )
    .unwrap();
    let (optimized, _) = optimize(&query);
    let sql = emit(&optimized).unwrap();

    assert_eq!(
        sql,
        "SELECT \"event_id\", COUNT(*) AS \"count_\" FROM \"logs\" \
         WHERE \"severity\" = 'high' AND \"source_ip\" ILIKE '%' || '10.0.' || '%' \
         GROUP BY \"event_id\" ORDER BY \"count_\" DESC LIMIT 5"
    );
}

#[test]
fn test_optimized_emission_is_stable() {
    let inputs = [
        "logs | where severity == \"high\" | summarize count() by event_id | top 5 by count_ desc",
        "logs | sort by timestamp desc | where a == 1 | where b == 2",
        "logs | project a, b | project a | where a == 1",
        "logs | join kind=inner (alerts | where severity == \"high\") on event_id == event_id | where a == 1",
    ];
    for input in inputs {
        let query = parse(input).unwrap();
        let (once, _) = optimize(&query);
        let (twice, _) = optimize(&once);
        assert_eq!(emit(&once).unwrap(), emit(&twice).unwrap(), "input: {}", input);
    }
}

#[test]
fn test_canonical_round_trip_over_pipeline_shapes() {
    let inputs = [
        "logs | where severity == \"high\"",
        "logs | summarize count(), sum(risk_score) by event_id, hostname",
        "logs | where a in (\"x\", \"y\") or not (b == 2) | top 3 by a desc",
        "logs | where ts > datetime(2024-05-01T00:00:00Z) and span < 2h",
    ];
    for input in inputs {
        let query = parse(input).unwrap();
        assert_eq!(query, parse(&query.render()).unwrap(), "input: {}", input);
    }
}

#[test]
fn test_schema_validation_over_logs_table() {
    let schema = crate::logs_schema();

    let good = parse(
        "logs | where severity == \"high\" and source_ip contains \"10.\" \
         | summarize count() by event_id | top 5 by count_ desc",
    )
    .unwrap();
    assert!(validate_semantics(&good, &schema).is_empty());

    let bad = parse("logs | where sverity == \"high\"").unwrap();
    assert_eq!(validate_semantics(&bad, &schema).len(), 1);
}

#[test]
fn test_plan_costs_follow_fixed_heuristics() {
    let query = parse(
        "logs | where severity == \"high\" | summarize count() by event_id \
         | sort by count_ desc",
    )
    .unwrap();
    let plan = plan(&query).unwrap();

    let costs: Vec<f64> = plan.steps.iter().map(|step| step.est_cost).collect();
    assert_eq!(costs, vec![100.0, 50.0, 200.0, 150.0]);
    let rows: Vec<u64> = plan.steps.iter().map(|step| step.est_rows).collect();
    assert_eq!(rows, vec![10_000, 1_000, 100, 100]);
}

#[test]
fn test_time_range_hours() {
    let range = TimeRange::last_hours(168);
    assert!((range.hours() - 168.0).abs() < 0.01);
}
