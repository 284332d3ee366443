//! Search backend client and bulk indexer
//!
//! Talks to an OpenSearch-compatible backend over HTTP. Daily indices
//! `securewatch-logs-<yyyy.MM.dd>` are created if missing with a fixed
//! mapping; documents carry the nested objects plus a synthesized
//! `_search_text` concatenation and a `_normalized_timestamp` epoch
//! millis field. Writes are buffered and flushed on size or on a timer.

use crate::models::NormalizedEvent;
use crate::utils::error::{EngineError, EngineResult};
use crate::utils::maintenance::MaintenanceTask;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use super::dual_writer::{BackendHealth, WriteCounters};

pub const DEFAULT_BULK_SIZE: usize = 100;
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 5;
const MAX_BUFFERED_DOCS: usize = 10_000;

/// Store abstraction over the search backend
#[async_trait]
pub trait SearchStore: Send + Sync {
    /// Create the target index with the fixed mapping if it is missing
    async fn ensure_index(&self) -> EngineResult<()>;

    /// Bulk-write documents; returns the number of accepted docs
    async fn bulk(&self, docs: &[Value]) -> EngineResult<usize>;
}

/// Build the search document for an event
pub fn to_search_document(event: &NormalizedEvent) -> Value {
    let mut search_text = String::with_capacity(event.message.len() + 64);
    search_text.push_str(&event.message);
    if !event.host.hostname.is_empty() {
        search_text.push(' ');
        search_text.push_str(&event.host.hostname);
    }
    if let Some(user) = &event.user {
        search_text.push(' ');
        search_text.push_str(&user.name);
    }
    if let Some(process) = &event.process {
        search_text.push(' ');
        search_text.push_str(&process.name);
        if let Some(cmd) = &process.command_line {
            search_text.push(' ');
            search_text.push_str(cmd);
        }
    }
    for tag in &event.tags {
        search_text.push(' ');
        search_text.push_str(tag);
    }

    json!({
        "id": event.id,
        "timestamp": event.timestamp.to_rfc3339(),
        "ingested_at": event.ingested_at.to_rfc3339(),
        "source_type": event.source.as_str(),
        "event_id": event.event_id,
        "severity": event.severity.as_str(),
        "category": event.category,
        "message": event.message,
        "host": { "hostname": event.host.hostname, "ip": event.host.ips },
        "user": event.user,
        "process": event.process,
        "network": event.network,
        "security": { "file": event.file, "registry": event.registry },
        "fields": Value::Object(event.fields.clone()),
        "tags": event.tags,
        "_search_text": search_text,
        "_normalized_timestamp": event.timestamp.timestamp_millis(),
    })
}

/// Fixed index mapping (3 shards, 1 replica, 5 s refresh)
pub fn index_mapping() -> Value {
    json!({
        "settings": {
            "number_of_shards": 3,
            "number_of_replicas": 1,
            "refresh_interval": "5s"
        },
        "mappings": {
            "properties": {
                "id": { "type": "keyword" },
                "timestamp": { "type": "date" },
                "ingested_at": { "type": "date" },
                "source_type": { "type": "keyword" },
                "event_id": { "type": "keyword" },
                "severity": { "type": "keyword" },
                "category": { "type": "keyword" },
                "message": {
                    "type": "text",
                    "fields": { "keyword": { "type": "keyword", "ignore_above": 1024 } }
                },
                "host": {
                    "properties": {
                        "hostname": { "type": "keyword" },
                        "ip": { "type": "ip" }
                    }
                },
                "user": {
                    "type": "nested",
                    "properties": {
                        "name": { "type": "keyword" },
                        "id": { "type": "keyword" },
                        "domain": { "type": "keyword" }
                    }
                },
                "process": {
                    "type": "nested",
                    "properties": {
                        "name": { "type": "keyword" },
                        "pid": { "type": "long" },
                        "command_line": {
                            "type": "text",
                            "fields": { "keyword": { "type": "keyword", "ignore_above": 2048 } }
                        }
                    }
                },
                "network": {
                    "type": "nested",
                    "properties": {
                        "source_ip": { "type": "ip" },
                        "source_port": { "type": "long" },
                        "destination_ip": { "type": "ip" },
                        "destination_port": { "type": "long" },
                        "protocol": { "type": "keyword" },
                        "bytes_sent": { "type": "long" },
                        "bytes_received": { "type": "long" }
                    }
                },
                "security": { "type": "nested" },
                "tags": { "type": "keyword" },
                "_search_text": { "type": "text" },
                "_normalized_timestamp": { "type": "long" }
            }
        }
    })
}

/// OpenSearch-compatible HTTP implementation
pub struct OpenSearchStore {
    http: reqwest::Client,
    base_url: String,
    index_prefix: String,
    index_ready: AtomicBool,
}

impl OpenSearchStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            index_prefix: "securewatch-logs".to_string(),
            index_ready: AtomicBool::new(false),
        }
    }

    fn index_name(&self) -> String {
        format!("{}-{}", self.index_prefix, chrono::Utc::now().format("%Y.%m.%d"))
    }
}

#[async_trait]
impl SearchStore for OpenSearchStore {
    async fn ensure_index(&self) -> EngineResult<()> {
        if self.index_ready.load(Ordering::Relaxed) {
            return Ok(());
        }
        let index = self.index_name();
        let url = format!("{}/{}", self.base_url, index);

        let head = self.http.head(&url).send().await?;
        if head.status().is_success() {
            self.index_ready.store(true, Ordering::Relaxed);
            return Ok(());
        }

        let response = self.http.put(&url).json(&index_mapping()).send().await?;
        if response.status().is_success() {
            tracing::info!("Created search index '{}'", index);
            self.index_ready.store(true, Ordering::Relaxed);
            Ok(())
        } else if response.status().as_u16() == 400 {
            // Lost the create race, or the mapping already exists
            self.index_ready.store(true, Ordering::Relaxed);
            Ok(())
        } else {
            Err(EngineError::transient(
                "search",
                format!("index create failed with status {}", response.status()),
            ))
        }
    }

    async fn bulk(&self, docs: &[Value]) -> EngineResult<usize> {
        if docs.is_empty() {
            return Ok(0);
        }
        self.ensure_index().await?;

        let index = self.index_name();
        let mut body = String::with_capacity(docs.len() * 512);
        for doc in docs {
            body.push_str(&json!({ "index": { "_index": index } }).to_string());
            body.push('\n');
            body.push_str(&doc.to_string());
            body.push('\n');
        }

        let url = format!("{}/_bulk", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EngineError::transient(
                "search",
                format!("bulk write failed with status {}", response.status()),
            ));
        }

        let payload: Value = response.json().await?;
        let mut accepted = docs.len();
        if payload.get("errors").and_then(Value::as_bool).unwrap_or(false) {
            let failed = payload
                .get("items")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter(|item| {
                            item.get("index")
                                .and_then(|op| op.get("status"))
                                .and_then(Value::as_u64)
                                .is_some_and(|status| status >= 300)
                        })
                        .count()
                })
                .unwrap_or(0);
            accepted = docs.len().saturating_sub(failed);
            tracing::warn!("Bulk write rejected {} of {} documents", failed, docs.len());
        }
        Ok(accepted)
    }
}

/// Buffers search documents and flushes on size or on a timer.
///
/// Per-event search counters are bumped exactly once, at flush time,
/// one per buffered document.
pub struct BulkIndexer {
    store: Arc<dyn SearchStore>,
    buffer: Mutex<Vec<Value>>,
    bulk_size: usize,
    counters: Arc<WriteCounters>,
    health: Arc<BackendHealth>,
}

impl BulkIndexer {
    pub fn new(
        store: Arc<dyn SearchStore>,
        bulk_size: usize,
        counters: Arc<WriteCounters>,
        health: Arc<BackendHealth>,
    ) -> Self {
        Self {
            store,
            buffer: Mutex::new(Vec::with_capacity(bulk_size)),
            bulk_size: bulk_size.max(1),
            counters,
            health,
        }
    }

    /// Enqueue a document. Returns false when the buffer is saturated,
    /// in which case the document is dropped and accounted as failed.
    pub async fn push(&self, doc: Value) -> bool {
        let should_flush;
        {
            let mut buffer = self.buffer.lock().await;
            if buffer.len() >= MAX_BUFFERED_DOCS {
                drop(buffer);
                self.counters.os_fail.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Search bulk buffer saturated, dropping document");
                return false;
            }
            buffer.push(doc);
            should_flush = buffer.len() >= self.bulk_size;
        }
        if should_flush {
            self.flush().await;
        }
        true
    }

    pub async fn pending(&self) -> usize {
        self.buffer.lock().await.len()
    }

    /// Drain the buffer and write one bulk request. A failed flush marks
    /// every drained document as failed; the buffer is not re-queued so a
    /// dead backend cannot stall the pipeline beyond one flush interval.
    pub async fn flush(&self) {
        let docs: Vec<Value> = {
            let mut buffer = self.buffer.lock().await;
            if buffer.is_empty() {
                return;
            }
            std::mem::take(&mut *buffer)
        };

        match self.store.bulk(&docs).await {
            Ok(accepted) => {
                let rejected = docs.len().saturating_sub(accepted);
                self.counters.os_ok.fetch_add(accepted as u64, Ordering::Relaxed);
                if rejected > 0 {
                    self.counters.os_fail.fetch_add(rejected as u64, Ordering::Relaxed);
                }
                self.health.record_success();
                tracing::debug!("Flushed {} search documents", accepted);
            }
            Err(err) => {
                self.counters.os_fail.fetch_add(docs.len() as u64, Ordering::Relaxed);
                self.health.record_failure(&err);
                tracing::warn!("Search flush of {} documents failed: {}", docs.len(), err);
            }
        }
    }
}

/// Timer-driven flush, run by the maintenance scheduler
#[async_trait]
impl MaintenanceTask for BulkIndexer {
    fn name(&self) -> &'static str {
        "search-bulk-flush"
    }

    async fn tick(&self) -> Result<(), anyhow::Error> {
        self.flush().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventSeverity, EventSource, HostInfo, UserInfo};
    use std::sync::atomic::AtomicUsize;

    struct RecordingStore {
        bulks: AtomicUsize,
        docs: Mutex<Vec<Value>>,
        fail: AtomicBool,
    }

    impl RecordingStore {
        fn new() -> Self {
            Self {
                bulks: AtomicUsize::new(0),
                docs: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl SearchStore for RecordingStore {
        async fn ensure_index(&self) -> EngineResult<()> {
            Ok(())
        }

        async fn bulk(&self, docs: &[Value]) -> EngineResult<usize> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(EngineError::transient("search", "down"));
            }
            self.bulks.fetch_add(1, Ordering::Relaxed);
            self.docs.lock().await.extend(docs.iter().cloned());
            Ok(docs.len())
        }
    }

    fn sample_event() -> NormalizedEvent {
        let mut event = NormalizedEvent::new(
            EventSource::Syslog,
            "auth_fail",
            EventSeverity::Medium,
            "authentication failure",
            HostInfo { hostname: "web01".to_string(), ips: vec![] },
        );
        event.user = Some(UserInfo { name: "bob".to_string(), id: None, domain: None });
        event
    }

    #[test]
    fn test_document_synthesis() {
        let event = sample_event();
        let doc = to_search_document(&event);
        let text = doc["_search_text"].as_str().unwrap();
        assert!(text.contains("authentication failure"));
        assert!(text.contains("web01"));
        assert!(text.contains("bob"));
        assert_eq!(
            doc["_normalized_timestamp"].as_i64().unwrap(),
            event.timestamp.timestamp_millis()
        );
        assert_eq!(doc["source_type"], "syslog");
    }

    #[tokio::test]
    async fn test_flush_on_bulk_size() {
        let store = Arc::new(RecordingStore::new());
        let counters = Arc::new(WriteCounters::default());
        let health = Arc::new(BackendHealth::new("search"));
        let indexer =
            BulkIndexer::new(Arc::clone(&store) as Arc<dyn SearchStore>, 3, counters.clone(), health);

        for _ in 0..2 {
            indexer.push(to_search_document(&sample_event())).await;
        }
        assert_eq!(store.bulks.load(Ordering::Relaxed), 0);
        assert_eq!(indexer.pending().await, 2);

        indexer.push(to_search_document(&sample_event())).await;
        assert_eq!(store.bulks.load(Ordering::Relaxed), 1);
        assert_eq!(indexer.pending().await, 0);
        assert_eq!(counters.os_ok.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_failed_flush_accounts_every_document() {
        let store = Arc::new(RecordingStore::new());
        store.fail.store(true, Ordering::Relaxed);
        let counters = Arc::new(WriteCounters::default());
        let health = Arc::new(BackendHealth::new("search"));
        let indexer = BulkIndexer::new(
            Arc::clone(&store) as Arc<dyn SearchStore>,
            100,
            counters.clone(),
            health,
        );

        for _ in 0..5 {
            indexer.push(to_search_document(&sample_event())).await;
        }
        indexer.flush().await;

        assert_eq!(counters.os_fail.load(Ordering::Relaxed), 5);
        assert_eq!(counters.os_ok.load(Ordering::Relaxed), 0);
    }
}
