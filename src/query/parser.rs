//! LQL parser
//!
//! Recursive-descent parser over the token stream. Errors are returned
//! as a diagnostics list with line and column; no AST is produced for a
//! query with syntax errors. Semantic validation against a table schema
//! is a separate pass so callers can parse without one.

use crate::query::ast::{
    AggExpr, AggFunc, FilterExpr, FilterOp, JoinKind, LqlQuery, ProjectCol, SortCol, Stage,
};
use crate::query::lexer::{Token, TokenKind, tokenize};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::collections::HashSet;

use super::ast::LqlValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    SyntaxError,
    SemanticError,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryDiagnostic {
    pub kind: DiagnosticKind,
    pub line: u32,
    pub col: u32,
    pub message: String,
}

impl QueryDiagnostic {
    fn syntax(line: u32, col: u32, message: impl Into<String>) -> Self {
        Self { kind: DiagnosticKind::SyntaxError, line, col, message: message.into() }
    }

    fn semantic(message: impl Into<String>) -> Self {
        Self { kind: DiagnosticKind::SemanticError, line: 0, col: 0, message: message.into() }
    }
}

/// Column schema used for semantic validation
#[derive(Debug, Clone, Default)]
pub struct TableSchema {
    pub tables: HashMap<String, Vec<String>>,
}

impl TableSchema {
    pub fn with_table(mut self, name: impl Into<String>, columns: Vec<&str>) -> Self {
        self.tables
            .insert(name.into(), columns.into_iter().map(str::to_string).collect());
        self
    }
}

pub fn parse(input: &str) -> Result<LqlQuery, Vec<QueryDiagnostic>> {
    let tokens = match tokenize(input) {
        Ok(tokens) => tokens,
        Err(err) => {
            return Err(vec![QueryDiagnostic::syntax(err.line, err.col, err.message)]);
        }
    };
    let mut parser = Parser { tokens, pos: 0 };
    match parser.parse_query() {
        Ok(query) => {
            if let Some(extra) = parser.peek() {
                return Err(vec![QueryDiagnostic::syntax(
                    extra.line,
                    extra.col,
                    format!("unexpected trailing {}", extra.kind.describe()),
                )]);
            }
            Ok(query)
        }
        Err(diagnostic) => Err(vec![diagnostic]),
    }
}

/// Validate column references against a schema. Projections and
/// summarize stages rebind the visible column set; `by` columns are
/// implicitly part of the output scope.
pub fn validate_semantics(query: &LqlQuery, schema: &TableSchema) -> Vec<QueryDiagnostic> {
    let mut diagnostics = Vec::new();

    let Some(table_columns) = schema.tables.get(&query.table) else {
        diagnostics.push(QueryDiagnostic::semantic(format!(
            "unknown table '{}'",
            query.table
        )));
        return diagnostics;
    };
    let mut scope: HashSet<String> = table_columns.iter().cloned().collect();

    for stage in &query.stages {
        match stage {
            Stage::Where { filter } => {
                for column in filter.columns() {
                    if !scope.contains(column) {
                        diagnostics.push(QueryDiagnostic::semantic(format!(
                            "unknown column '{}'",
                            column
                        )));
                    }
                }
            }
            Stage::Project { columns } => {
                let mut next = HashSet::new();
                for col in columns {
                    if !scope.contains(&col.column) {
                        diagnostics.push(QueryDiagnostic::semantic(format!(
                            "unknown column '{}'",
                            col.column
                        )));
                    }
                    next.insert(col.alias.clone().unwrap_or_else(|| col.column.clone()));
                }
                scope = next;
            }
            Stage::Summarize { aggs, by } => {
                for agg in aggs {
                    if let Some(column) = &agg.column {
                        if !scope.contains(column) {
                            diagnostics.push(QueryDiagnostic::semantic(format!(
                                "unknown column '{}'",
                                column
                            )));
                        }
                    }
                }
                let mut next: HashSet<String> = by.iter().cloned().collect();
                for column in by {
                    if !scope.contains(column) {
                        diagnostics.push(QueryDiagnostic::semantic(format!(
                            "unknown column '{}'",
                            column
                        )));
                    }
                }
                next.extend(aggs.iter().map(|agg| agg.alias.clone()));
                scope = next;
            }
            Stage::Sort { by } | Stage::Top { by, .. } => {
                for col in by {
                    if !scope.contains(&col.column) {
                        diagnostics.push(QueryDiagnostic::semantic(format!(
                            "unknown column '{}'",
                            col.column
                        )));
                    }
                }
            }
            Stage::Join { right, on, .. } => {
                let right_diags = validate_semantics(right, schema);
                diagnostics.extend(right_diags);
                if let Some(right_columns) = schema.tables.get(&right.table) {
                    let mut joined = scope.clone();
                    joined.extend(right_columns.iter().cloned());
                    for column in on.columns() {
                        if !joined.contains(column) {
                            diagnostics.push(QueryDiagnostic::semantic(format!(
                                "unknown column '{}'",
                                column
                            )));
                        }
                    }
                    scope = joined;
                }
            }
        }
    }

    diagnostics
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

type ParseResult<T> = Result<T, QueryDiagnostic>;

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eof_error(&self, expected: &str) -> QueryDiagnostic {
        let (line, col) = self
            .tokens
            .last()
            .map(|token| (token.line, token.col))
            .unwrap_or((1, 1));
        QueryDiagnostic::syntax(line, col, format!("expected {}, found end of query", expected))
    }

    fn expect_ident(&mut self, expected: &str) -> ParseResult<String> {
        match self.next() {
            Some(Token { kind: TokenKind::Ident(text), .. }) => Ok(text),
            Some(token) => Err(QueryDiagnostic::syntax(
                token.line,
                token.col,
                format!("expected {}, found {}", expected, token.kind.describe()),
            )),
            None => Err(self.eof_error(expected)),
        }
    }

    fn expect_kind(&mut self, kind: TokenKind, expected: &str) -> ParseResult<()> {
        match self.next() {
            Some(token) if token.kind == kind => Ok(()),
            Some(token) => Err(QueryDiagnostic::syntax(
                token.line,
                token.col,
                format!("expected {}, found {}", expected, token.kind.describe()),
            )),
            None => Err(self.eof_error(expected)),
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if let Some(Token { kind: TokenKind::Ident(text), .. }) = self.peek() {
            if text == keyword {
                self.pos += 1;
                return true;
            }
        }
        false
    }

    fn parse_query(&mut self) -> ParseResult<LqlQuery> {
        let table = self.expect_ident("table name")?;
        let mut stages = Vec::new();
        while let Some(Token { kind: TokenKind::Pipe, .. }) = self.peek() {
            self.pos += 1;
            stages.push(self.parse_stage()?);
        }
        Ok(LqlQuery { table, stages })
    }

    fn parse_stage(&mut self) -> ParseResult<Stage> {
        let keyword_token = self.next().ok_or_else(|| self.eof_error("stage keyword"))?;
        let TokenKind::Ident(keyword) = &keyword_token.kind else {
            return Err(QueryDiagnostic::syntax(
                keyword_token.line,
                keyword_token.col,
                format!("expected stage keyword, found {}", keyword_token.kind.describe()),
            ));
        };

        match keyword.as_str() {
            "where" => Ok(Stage::Where { filter: self.parse_or_expr()? }),
            "project" => self.parse_project(),
            "summarize" => self.parse_summarize(),
            "sort" => self.parse_sort(),
            "top" => self.parse_top(),
            "join" => self.parse_join(),
            other => Err(QueryDiagnostic::syntax(
                keyword_token.line,
                keyword_token.col,
                format!("unknown stage '{}'", other),
            )),
        }
    }

    fn parse_project(&mut self) -> ParseResult<Stage> {
        let mut columns = Vec::new();
        loop {
            let column = self.expect_ident("column name")?;
            let alias = if self.eat_keyword("as") {
                Some(self.expect_ident("alias")?)
            } else {
                None
            };
            columns.push(ProjectCol { column, alias });
            if !self.eat_comma() {
                break;
            }
        }
        Ok(Stage::Project { columns })
    }

    fn parse_summarize(&mut self) -> ParseResult<Stage> {
        let mut aggs = Vec::new();
        loop {
            aggs.push(self.parse_agg()?);
            if !self.eat_comma() {
                break;
            }
        }
        let mut by = Vec::new();
        if self.eat_keyword("by") {
            loop {
                by.push(self.expect_ident("group-by column")?);
                if !self.eat_comma() {
                    break;
                }
            }
        }
        Ok(Stage::Summarize { aggs, by })
    }

    fn parse_agg(&mut self) -> ParseResult<AggExpr> {
        let func_token = self.next().ok_or_else(|| self.eof_error("aggregation"))?;
        let TokenKind::Ident(func_name) = &func_token.kind else {
            return Err(QueryDiagnostic::syntax(
                func_token.line,
                func_token.col,
                format!("expected aggregation, found {}", func_token.kind.describe()),
            ));
        };
        let func = AggFunc::from_str_loose(func_name).ok_or_else(|| {
            QueryDiagnostic::syntax(
                func_token.line,
                func_token.col,
                format!("unknown aggregation '{}'", func_name),
            )
        })?;

        self.expect_kind(TokenKind::LParen, "'('")?;
        let column = match self.peek() {
            Some(Token { kind: TokenKind::RParen, .. }) => None,
            Some(Token { kind: TokenKind::Star, .. }) => {
                self.pos += 1;
                None
            }
            _ => Some(self.expect_ident("aggregation column")?),
        };
        self.expect_kind(TokenKind::RParen, "')'")?;

        let alias = if self.eat_keyword("as") {
            Some(self.expect_ident("alias")?)
        } else {
            None
        };
        Ok(AggExpr::new(func, column, alias))
    }

    fn parse_sort(&mut self) -> ParseResult<Stage> {
        if !self.eat_keyword("by") {
            let (line, col) = self.position();
            return Err(QueryDiagnostic::syntax(line, col, "expected 'by' after 'sort'"));
        }
        Ok(Stage::Sort { by: self.parse_sort_cols()? })
    }

    fn parse_top(&mut self) -> ParseResult<Stage> {
        let n = match self.next() {
            Some(Token { kind: TokenKind::Int(n), .. }) if n > 0 => n as u64,
            Some(token) => {
                return Err(QueryDiagnostic::syntax(
                    token.line,
                    token.col,
                    "expected positive row count after 'top'",
                ));
            }
            None => return Err(self.eof_error("row count")),
        };
        if !self.eat_keyword("by") {
            let (line, col) = self.position();
            return Err(QueryDiagnostic::syntax(line, col, "expected 'by' after 'top N'"));
        }
        Ok(Stage::Top { n, by: self.parse_sort_cols()? })
    }

    fn parse_sort_cols(&mut self) -> ParseResult<Vec<SortCol>> {
        let mut cols = Vec::new();
        loop {
            let column = self.expect_ident("sort column")?;
            let descending = if self.eat_keyword("desc") {
                true
            } else {
                self.eat_keyword("asc");
                false
            };
            cols.push(SortCol { column, descending });
            if !self.eat_comma() {
                break;
            }
        }
        Ok(cols)
    }

    fn parse_join(&mut self) -> ParseResult<Stage> {
        let kind = if self.eat_keyword("kind") {
            self.expect_kind(TokenKind::Assign, "'='")?;
            let kind_token = self.next().ok_or_else(|| self.eof_error("join kind"))?;
            let TokenKind::Ident(kind_name) = &kind_token.kind else {
                return Err(QueryDiagnostic::syntax(
                    kind_token.line,
                    kind_token.col,
                    "expected join kind",
                ));
            };
            JoinKind::from_str_loose(kind_name).ok_or_else(|| {
                QueryDiagnostic::syntax(
                    kind_token.line,
                    kind_token.col,
                    format!("unknown join kind '{}'", kind_name),
                )
            })?
        } else {
            JoinKind::Inner
        };

        self.expect_kind(TokenKind::LParen, "'('")?;
        let right = self.parse_query()?;
        self.expect_kind(TokenKind::RParen, "')'")?;

        if !self.eat_keyword("on") {
            let (line, col) = self.position();
            return Err(QueryDiagnostic::syntax(line, col, "expected 'on' after join table"));
        }
        let on = self.parse_or_expr()?;
        Ok(Stage::Join { kind, right: Box::new(right), on })
    }

    // -- filter expressions --------------------------------------------

    fn parse_or_expr(&mut self) -> ParseResult<FilterExpr> {
        let mut expr = self.parse_and_expr()?;
        while self.eat_keyword("or") {
            let right = self.parse_and_expr()?;
            expr = FilterExpr::or(expr, right);
        }
        Ok(expr)
    }

    fn parse_and_expr(&mut self) -> ParseResult<FilterExpr> {
        let mut expr = self.parse_not_expr()?;
        while self.eat_keyword("and") {
            let right = self.parse_not_expr()?;
            expr = FilterExpr::and(expr, right);
        }
        Ok(expr)
    }

    fn parse_not_expr(&mut self) -> ParseResult<FilterExpr> {
        if self.eat_keyword("not") {
            let inner = self.parse_not_expr()?;
            return Ok(FilterExpr::Not { not: Box::new(inner) });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> ParseResult<FilterExpr> {
        if let Some(Token { kind: TokenKind::LParen, .. }) = self.peek() {
            self.pos += 1;
            let inner = self.parse_or_expr()?;
            self.expect_kind(TokenKind::RParen, "')'")?;
            return Ok(inner);
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> ParseResult<FilterExpr> {
        let column = self.expect_ident("column name")?;
        let op_token = self.next().ok_or_else(|| self.eof_error("operator"))?;

        let op = match &op_token.kind {
            TokenKind::EqEq => FilterOp::Eq,
            TokenKind::Neq => FilterOp::Neq,
            TokenKind::Lt => FilterOp::Lt,
            TokenKind::Lte => FilterOp::Lte,
            TokenKind::Gt => FilterOp::Gt,
            TokenKind::Gte => FilterOp::Gte,
            TokenKind::Ident(word) => match word.as_str() {
                "contains" => FilterOp::Contains,
                "startswith" => FilterOp::StartsWith,
                "endswith" => FilterOp::EndsWith,
                "matches" => {
                    // Kusto sugar: `matches regex "..."`
                    self.eat_keyword("regex");
                    FilterOp::Matches
                }
                "in" => FilterOp::In,
                "not_in" => FilterOp::NotIn,
                other => {
                    return Err(QueryDiagnostic::syntax(
                        op_token.line,
                        op_token.col,
                        format!("unknown operator '{}'", other),
                    ));
                }
            },
            other => {
                return Err(QueryDiagnostic::syntax(
                    op_token.line,
                    op_token.col,
                    format!("expected operator, found {}", other.describe()),
                ));
            }
        };

        let value = if matches!(op, FilterOp::In | FilterOp::NotIn) {
            self.parse_value_list()?
        } else {
            self.parse_value()?
        };
        Ok(FilterExpr::Cmp { column, op, value })
    }

    fn parse_value_list(&mut self) -> ParseResult<LqlValue> {
        self.expect_kind(TokenKind::LParen, "'('")?;
        let mut items = Vec::new();
        if !matches!(self.peek(), Some(Token { kind: TokenKind::RParen, .. })) {
            loop {
                items.push(self.parse_value()?);
                if !self.eat_comma() {
                    break;
                }
            }
        }
        self.expect_kind(TokenKind::RParen, "')'")?;
        Ok(LqlValue::List(items))
    }

    fn parse_value(&mut self) -> ParseResult<LqlValue> {
        let token = self.next().ok_or_else(|| self.eof_error("value"))?;
        match token.kind {
            TokenKind::Str(text) => Ok(LqlValue::String(text)),
            TokenKind::Int(value) => Ok(LqlValue::Int(value)),
            TokenKind::Float(value) => Ok(LqlValue::Float(value)),
            TokenKind::Timespan(seconds) => Ok(LqlValue::Timespan(seconds)),
            TokenKind::Star => Ok(LqlValue::String("*".to_string())),
            TokenKind::Ident(word) if word == "true" => Ok(LqlValue::Bool(true)),
            TokenKind::Ident(word) if word == "false" => Ok(LqlValue::Bool(false)),
            TokenKind::Ident(word) if word == "null" => Ok(LqlValue::Null),
            TokenKind::Datetime(raw) => {
                parse_datetime(&raw).map(LqlValue::Datetime).ok_or_else(|| {
                    QueryDiagnostic::syntax(
                        token.line,
                        token.col,
                        format!("invalid datetime '{}'", raw),
                    )
                })
            }
            other => Err(QueryDiagnostic::syntax(
                token.line,
                token.col,
                format!("expected value, found {}", other.describe()),
            )),
        }
    }

    fn eat_comma(&mut self) -> bool {
        if matches!(self.peek(), Some(Token { kind: TokenKind::Comma, .. })) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn position(&self) -> (u32, u32) {
        self.peek()
            .map(|token| (token.line, token.col))
            .or_else(|| self.tokens.last().map(|token| (token.line, token.col)))
            .unwrap_or((1, 1))
    }
}

fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }
    None
}
