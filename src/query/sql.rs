//! SQL expression emitter
//!
//! Pure string-building module shared by the planner and any caller
//! that needs filter-to-SQL conversion. Quoting rules are strict:
//! identifiers are double-quoted with interior quotes doubled, string
//! literals are single-quoted with interior quotes doubled, and no raw
//! user string is ever interpolated unquoted.

use crate::query::ast::{FilterExpr, FilterOp, LqlValue};

/// Double-quote an identifier, doubling interior quotes. Dotted paths
/// quote each segment.
pub fn quote_ident(ident: &str) -> String {
    ident
        .split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

/// Single-quote a string literal, doubling interior quotes
pub fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Render a literal value for SQL
pub fn render_value(value: &LqlValue) -> String {
    match value {
        LqlValue::Null => "NULL".to_string(),
        LqlValue::Bool(flag) => {
            if *flag { "TRUE".to_string() } else { "FALSE".to_string() }
        }
        LqlValue::Int(number) => number.to_string(),
        LqlValue::Float(number) => number.to_string(),
        LqlValue::String(text) => quote_literal(text),
        LqlValue::Datetime(ts) => {
            format!("TIMESTAMP {}", quote_literal(&ts.format("%Y-%m-%d %H:%M:%S%.f+00").to_string()))
        }
        LqlValue::Timespan(seconds) => {
            format!("INTERVAL {}", quote_literal(&format!("{} seconds", seconds)))
        }
        LqlValue::List(items) => {
            let rendered: Vec<String> = items.iter().map(render_value).collect();
            format!("({})", rendered.join(", "))
        }
    }
}

/// Render a filter expression tree into a SQL boolean expression
pub fn render_filter(expr: &FilterExpr) -> String {
    render_filter_prec(expr, 0)
}

// Precedence: 0 = OR context, 1 = AND context, 2 = NOT context
fn render_filter_prec(expr: &FilterExpr, parent: u8) -> String {
    match expr {
        FilterExpr::And { and } => {
            let body = and
                .iter()
                .map(|child| render_filter_prec(child, 1))
                .collect::<Vec<_>>()
                .join(" AND ");
            if parent > 1 { format!("({})", body) } else { body }
        }
        FilterExpr::Or { or } => {
            let body = or
                .iter()
                .map(|child| render_filter_prec(child, 0))
                .collect::<Vec<_>>()
                .join(" OR ");
            if parent > 0 { format!("({})", body) } else { body }
        }
        FilterExpr::Not { not } => format!("NOT ({})", render_filter_prec(not, 0)),
        FilterExpr::Cmp { column, op, value } => render_comparison(column, *op, value),
    }
}

fn render_comparison(column: &str, op: FilterOp, value: &LqlValue) -> String {
    let ident = quote_ident(column);
    match op {
        FilterOp::Eq => match value {
            LqlValue::Null => format!("{} IS NULL", ident),
            other => format!("{} = {}", ident, render_value(other)),
        },
        FilterOp::Neq => match value {
            LqlValue::Null => format!("{} IS NOT NULL", ident),
            other => format!("{} <> {}", ident, render_value(other)),
        },
        FilterOp::Lt => format!("{} < {}", ident, render_value(value)),
        FilterOp::Lte => format!("{} <= {}", ident, render_value(value)),
        FilterOp::Gt => format!("{} > {}", ident, render_value(value)),
        FilterOp::Gte => format!("{} >= {}", ident, render_value(value)),
        FilterOp::Contains => {
            format!("{} ILIKE '%' || {} || '%'", ident, render_text_operand(value))
        }
        FilterOp::StartsWith => format!("{} ILIKE {} || '%'", ident, render_text_operand(value)),
        FilterOp::EndsWith => format!("{} ILIKE '%' || {}", ident, render_text_operand(value)),
        FilterOp::Matches => format!("{} ~ {}", ident, render_text_operand(value)),
        FilterOp::In => format!("{} IN {}", ident, render_list_operand(value)),
        FilterOp::NotIn => format!("{} NOT IN {}", ident, render_list_operand(value)),
    }
}

fn render_text_operand(value: &LqlValue) -> String {
    match value {
        LqlValue::String(text) => quote_literal(text),
        other => render_value(other),
    }
}

fn render_list_operand(value: &LqlValue) -> String {
    match value {
        LqlValue::List(_) => render_value(value),
        single => format!("({})", render_value(single)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_quoting() {
        assert_eq!(quote_ident("event_id"), "\"event_id\"");
        assert_eq!(quote_ident("weird\"name"), "\"weird\"\"name\"");
        assert_eq!(quote_ident("user.name"), "\"user\".\"name\"");
    }

    #[test]
    fn test_literal_quoting_doubles_interior_quotes() {
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
        assert_eq!(quote_literal("plain"), "'plain'");
    }

    #[test]
    fn test_injection_is_neutralized() {
        let rendered = render_comparison(
            "name",
            FilterOp::Eq,
            &LqlValue::String("x'; DROP TABLE logs; --".to_string()),
        );
        assert_eq!(rendered, "\"name\" = 'x''; DROP TABLE logs; --'");
    }

    #[test]
    fn test_contains_emits_ilike_concatenation() {
        let rendered = render_comparison(
            "source_ip",
            FilterOp::Contains,
            &LqlValue::String("10.0.".to_string()),
        );
        assert_eq!(rendered, "\"source_ip\" ILIKE '%' || '10.0.' || '%'");
    }

    #[test]
    fn test_startswith_and_endswith() {
        assert_eq!(
            render_comparison("a", FilterOp::StartsWith, &LqlValue::String("pre".to_string())),
            "\"a\" ILIKE 'pre' || '%'"
        );
        assert_eq!(
            render_comparison("a", FilterOp::EndsWith, &LqlValue::String("suf".to_string())),
            "\"a\" ILIKE '%' || 'suf'"
        );
    }

    #[test]
    fn test_regex_and_lists() {
        assert_eq!(
            render_comparison("msg", FilterOp::Matches, &LqlValue::String("fail.*".to_string())),
            "\"msg\" ~ 'fail.*'"
        );
        assert_eq!(
            render_comparison(
                "event_id",
                FilterOp::In,
                &LqlValue::List(vec![
                    LqlValue::String("4624".to_string()),
                    LqlValue::String("4625".to_string()),
                ])
            ),
            "\"event_id\" IN ('4624', '4625')"
        );
    }

    #[test]
    fn test_null_comparisons() {
        assert_eq!(
            render_comparison("user_name", FilterOp::Eq, &LqlValue::Null),
            "\"user_name\" IS NULL"
        );
        assert_eq!(
            render_comparison("user_name", FilterOp::Neq, &LqlValue::Null),
            "\"user_name\" IS NOT NULL"
        );
    }

    #[test]
    fn test_filter_tree_precedence() {
        let expr = FilterExpr::And {
            and: vec![
                FilterExpr::Or {
                    or: vec![
                        FilterExpr::Cmp {
                            column: "a".to_string(),
                            op: FilterOp::Eq,
                            value: LqlValue::Int(1),
                        },
                        FilterExpr::Cmp {
                            column: "b".to_string(),
                            op: FilterOp::Eq,
                            value: LqlValue::Int(2),
                        },
                    ],
                },
                FilterExpr::Cmp {
                    column: "c".to_string(),
                    op: FilterOp::Eq,
                    value: LqlValue::Int(3),
                },
            ],
        };
        assert_eq!(
            render_filter(&expr),
            "(\"a\" = 1 OR \"b\" = 2) AND \"c\" = 3"
        );
    }
}
