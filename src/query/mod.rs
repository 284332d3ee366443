//! LQL query engine
//!
//! Pipelined log-query language front end (lexer, parser, AST), the
//! planner/optimizer with SQL emission, complexity analysis and per-user
//! rate limiting, admission control with cooperative cancellation, the
//! execution engine, and the result cache.

pub mod analyzer;
pub mod ast;
pub mod executor;
pub mod lexer;
pub mod parser;
pub mod planner;
pub mod rate_limiter;
pub mod resources;
pub mod result_cache;
pub mod service;
pub mod sql;

pub use analyzer::{ComplexityAnalyzer, ComplexityReport, ResourceEstimate, TimeRange};
pub use ast::{
    AggExpr, AggFunc, FilterExpr, FilterOp, JoinKind, LqlQuery, LqlValue, ProjectCol, SortCol,
    Stage,
};
pub use executor::{
    ExecutionEngine, ProgressEvent, QueryBackend, QueryResult, ResultBatch, SqlxQueryBackend,
};
pub use parser::{DiagnosticKind, QueryDiagnostic, TableSchema, parse, validate_semantics};
pub use planner::{ExecutionPlan, PlanStep, emit, optimize, plan, stable_hash};
pub use rate_limiter::{RateDecision, RateLimiter};
pub use resources::{QueryPriority, ResourceLease, ResourceManager};
pub use result_cache::ResultCache;
pub use service::{PlanReport, QueryOptions, QueryRequest, QueryService, ValidationReport};
