//! Ingestion and dual-write engine
//!
//! Raw records enter through source adapters, get normalized, and are
//! written to both the relational time-series store and the search
//! backend with independent failure accounting.

pub mod adapters;
pub mod dual_writer;
pub mod relational;
pub mod search;

pub use adapters::{CloudTrailAdapter, LogAdapter, SyslogAdapter, WindowsEventAdapter};
pub use dual_writer::{
    BackendHealth, CounterSnapshot, DualWriteEngine, HealthState, IngestHealth, WriteCounters,
    WriteReceipt,
};
pub use relational::{LogRow, LogStore, PostgresLogStore};
pub use search::{BulkIndexer, OpenSearchStore, SearchStore, to_search_document};
