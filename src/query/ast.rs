//! LQL abstract syntax tree
//!
//! A query is a source table piped through stages. The canonical
//! renderer round-trips with the parser: `parse(render(ast)) == ast`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LqlQuery {
    pub table: String,
    pub stages: Vec<Stage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage_kind", rename_all = "snake_case")]
pub enum Stage {
    Where { filter: FilterExpr },
    Project { columns: Vec<ProjectCol> },
    Summarize { aggs: Vec<AggExpr>, by: Vec<String> },
    Sort { by: Vec<SortCol> },
    Top { n: u64, by: Vec<SortCol> },
    Join { kind: JoinKind, right: Box<LqlQuery>, on: FilterExpr },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectCol {
    pub column: String,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggFunc {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
        }
    }

    pub fn sql_name(&self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
        }
    }

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

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggExpr {
    pub func: AggFunc,
    /// `None` is the bare form, e.g. `count()`
    pub column: Option<String>,
    pub alias: String,
}

impl AggExpr {
    /// Default alias: `count_` for bare count, `<func>_<col>` otherwise
    pub fn default_alias(func: AggFunc, column: Option<&str>) -> String {
        match column {
            Some(column) => format!("{}_{}", func.as_str(), column.replace('.', "_")),
            None => format!("{}_", func.as_str()),
        }
    }

    pub fn new(func: AggFunc, column: Option<String>, alias: Option<String>) -> Self {
        let alias =
            alias.unwrap_or_else(|| Self::default_alias(func, column.as_deref()));
        Self { func, column, alias }
    }

    fn has_default_alias(&self) -> bool {
        self.alias == Self::default_alias(self.func, self.column.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortCol {
    pub column: String,
    pub descending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
}

impl JoinKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inner => "inner",
            Self::Left => "left",
            Self::Right => "right",
            Self::Full => "full",
        }
    }

    pub fn sql_name(&self) -> &'static str {
        match self {
            Self::Inner => "INNER JOIN",
            Self::Left => "LEFT JOIN",
            Self::Right => "RIGHT JOIN",
            Self::Full => "FULL JOIN",
        }
    }

    pub fn from_str_loose(value: &str) -> Option<Self> {
        Some(match value {
            "inner" => Self::Inner,
            "left" | "leftouter" => Self::Left,
            "right" | "rightouter" => Self::Right,
            "full" | "fullouter" => Self::Full,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterExpr {
    And { and: Vec<FilterExpr> },
    Or { or: Vec<FilterExpr> },
    Not { not: Box<FilterExpr> },
    Cmp { column: String, op: FilterOp, value: LqlValue },
}

impl FilterExpr {
    pub fn and(left: FilterExpr, right: FilterExpr) -> Self {
        match left {
            FilterExpr::And { mut and } => {
                and.push(right);
                FilterExpr::And { and }
            }
            other => FilterExpr::And { and: vec![other, right] },
        }
    }

    pub fn or(left: FilterExpr, right: FilterExpr) -> Self {
        match left {
            FilterExpr::Or { mut or } => {
                or.push(right);
                FilterExpr::Or { or }
            }
            other => FilterExpr::Or { or: vec![other, right] },
        }
    }

    /// Every column referenced in the expression
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            FilterExpr::And { and } => and.iter().for_each(|child| child.collect_columns(out)),
            FilterExpr::Or { or } => or.iter().for_each(|child| child.collect_columns(out)),
            FilterExpr::Not { not } => not.collect_columns(out),
            FilterExpr::Cmp { column, .. } => out.push(column),
        }
    }

    /// True if any comparison uses the regex operator
    pub fn uses_regex(&self) -> bool {
        match self {
            FilterExpr::And { and } => and.iter().any(FilterExpr::uses_regex),
            FilterExpr::Or { or } => or.iter().any(FilterExpr::uses_regex),
            FilterExpr::Not { not } => not.uses_regex(),
            FilterExpr::Cmp { op, .. } => *op == FilterOp::Matches,
        }
    }

    /// True if any comparison is a bare wildcard search
    pub fn has_wildcard(&self) -> bool {
        match self {
            FilterExpr::And { and } => and.iter().any(FilterExpr::has_wildcard),
            FilterExpr::Or { or } => or.iter().any(FilterExpr::has_wildcard),
            FilterExpr::Not { not } => not.has_wildcard(),
            FilterExpr::Cmp { value, .. } => {
                matches!(value, LqlValue::String(text) if text == "*")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
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
    Matches,
    In,
    NotIn,
}

impl FilterOp {
    pub fn as_lql(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Neq => "!=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Contains => "contains",
            Self::StartsWith => "startswith",
            Self::EndsWith => "endswith",
            Self::Matches => "matches",
            Self::In => "in",
            Self::NotIn => "not_in",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Datetime(DateTime<Utc>),
    /// Seconds
    Timespan(i64),
    List(Vec<LqlValue>),
}

impl LqlValue {
    fn render(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Bool(value) => value.to_string(),
            Self::Int(value) => value.to_string(),
            Self::Float(value) => {
                let text = format!("{}", value);
                if text.contains('.') || text.contains('e') {
                    text
                } else {
                    format!("{}.0", text)
                }
            }
            Self::String(value) => {
                format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
            }
            Self::Datetime(value) => {
                format!("datetime({})", value.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
            }
            Self::Timespan(seconds) => render_timespan(*seconds),
            Self::List(items) => {
                let rendered: Vec<String> = items.iter().map(LqlValue::render).collect();
                format!("({})", rendered.join(", "))
            }
        }
    }
}

fn render_timespan(seconds: i64) -> String {
    if seconds % 86_400 == 0 && seconds != 0 {
        format!("{}d", seconds / 86_400)
    } else if seconds % 3_600 == 0 && seconds != 0 {
        format!("{}h", seconds / 3_600)
    } else if seconds % 60 == 0 && seconds != 0 {
        format!("{}m", seconds / 60)
    } else {
        format!("{}s", seconds)
    }
}

// ---------------------------------------------------------------------------
// Canonical rendering
// ---------------------------------------------------------------------------

impl LqlQuery {
    /// Canonical text form; `parse(render(q)) == q`
    pub fn render(&self) -> String {
        let mut out = self.table.clone();
        for stage in &self.stages {
            out.push_str(" | ");
            out.push_str(&stage.render());
        }
        out
    }
}

impl Stage {
    pub fn render(&self) -> String {
        match self {
            Stage::Where { filter } => format!("where {}", render_filter(filter, Prec::Or)),
            Stage::Project { columns } => {
                let cols: Vec<String> = columns
                    .iter()
                    .map(|col| match &col.alias {
                        Some(alias) => format!("{} as {}", col.column, alias),
                        None => col.column.clone(),
                    })
                    .collect();
                format!("project {}", cols.join(", "))
            }
            Stage::Summarize { aggs, by } => {
                let rendered: Vec<String> = aggs
                    .iter()
                    .map(|agg| {
                        let call = match &agg.column {
                            Some(column) => format!("{}({})", agg.func.as_str(), column),
                            None => format!("{}()", agg.func.as_str()),
                        };
                        if agg.has_default_alias() {
                            call
                        } else {
                            format!("{} as {}", call, agg.alias)
                        }
                    })
                    .collect();
                let mut out = format!("summarize {}", rendered.join(", "));
                if !by.is_empty() {
                    out.push_str(" by ");
                    out.push_str(&by.join(", "));
                }
                out
            }
            Stage::Sort { by } => format!("sort by {}", render_sort_cols(by)),
            Stage::Top { n, by } => format!("top {} by {}", n, render_sort_cols(by)),
            Stage::Join { kind, right, on } => {
                format!(
                    "join kind={} ({}) on {}",
                    kind.as_str(),
                    right.render(),
                    render_filter(on, Prec::Or)
                )
            }
        }
    }
}

fn render_sort_cols(cols: &[SortCol]) -> String {
    cols.iter()
        .map(|col| {
            if col.descending {
                format!("{} desc", col.column)
            } else {
                col.column.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Clone, Copy, PartialEq, PartialOrd)]
enum Prec {
    Or,
    And,
    Not,
}

fn render_filter(expr: &FilterExpr, parent: Prec) -> String {
    match expr {
        FilterExpr::And { and } => {
            let body = and
                .iter()
                .map(|child| render_filter(child, Prec::And))
                .collect::<Vec<_>>()
                .join(" and ");
            if parent > Prec::Or { format!("({})", body) } else { body }
        }
        FilterExpr::Or { or } => {
            let body = or
                .iter()
                .map(|child| render_filter(child, Prec::Or))
                .collect::<Vec<_>>()
                .join(" or ");
            if parent > Prec::Or { format!("({})", body) } else { body }
        }
        FilterExpr::Not { not } => format!("not ({})", render_filter(not, Prec::Or)),
        FilterExpr::Cmp { column, op, value } => {
            format!("{} {} {}", column, op.as_lql(), value.render())
        }
    }
}
