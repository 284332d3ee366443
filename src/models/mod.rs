pub mod event;
pub mod incident;
pub mod pattern;
pub mod rule;

pub use event::{
    EventSeverity, EventSource, FileInfo, HostInfo, NetworkInfo, NormalizedEvent, ProcessInfo,
    RegistryInfo, UserInfo,
};
pub use incident::{EventLink, Incident, IncidentStatus};
pub use pattern::{Pattern, PatternStep};
pub use rule::{
    AggregateOp, Aggregation, ConditionNode, ConditionOperator, Rule, RuleAction, RuleCondition,
    RulePriority, RuleSeverity, RuleType,
};
