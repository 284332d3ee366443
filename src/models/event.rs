//! Normalized security event model
//!
//! Events are immutable after ingest. Source adapters produce this shape
//! from raw Windows Event, Syslog, CloudTrail and similar records; the
//! dual-write engine persists it and the correlation engine evaluates
//! rules against it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Log source type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    WindowsEvent,
    Syslog,
    CloudTrail,
    AzureActivity,
    GcpAudit,
    Firewall,
    Ids,
    Edr,
    Other,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WindowsEvent => "windows_event",
            Self::Syslog => "syslog",
            Self::CloudTrail => "cloudtrail",
            Self::AzureActivity => "azure_activity",
            Self::GcpAudit => "gcp_audit",
            Self::Firewall => "firewall",
            Self::Ids => "ids",
            Self::Edr => "edr",
            Self::Other => "other",
        }
    }

    pub fn from_str_loose(value: &str) -> Self {
        match value {
            "windows_event" => Self::WindowsEvent,
            "syslog" => Self::Syslog,
            "cloudtrail" => Self::CloudTrail,
            "azure_activity" => Self::AzureActivity,
            "gcp_audit" => Self::GcpAudit,
            "firewall" => Self::Firewall,
            "ids" => Self::Ids,
            "edr" => Self::Edr,
            _ => Self::Other,
        }
    }
}

/// Event severity as reported by the source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl EventSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Info => "info",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostInfo {
    pub hostname: String,
    #[serde(default)]
    pub ips: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    pub id: Option<String>,
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub name: String,
    pub pid: Option<i64>,
    pub command_line: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub source_ip: Option<String>,
    pub source_port: Option<u16>,
    pub destination_ip: Option<String>,
    pub destination_port: Option<u16>,
    pub protocol: Option<String>,
    pub bytes_sent: Option<u64>,
    pub bytes_received: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    pub hash: Option<String>,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryInfo {
    pub key: String,
    pub value_name: Option<String>,
    pub value_data: Option<String>,
}

/// The normalized event flowing through the whole pipeline.
///
/// Invariants: `timestamp <= ingested_at`, `id` is unique and
/// time-sortable (UUIDv7), `(source, event_id)` is the buffer key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
    pub source: EventSource,
    /// Source-specific event code, e.g. "4625"
    pub event_id: String,
    pub severity: EventSeverity,
    pub category: Option<String>,
    pub message: String,
    pub host: HostInfo,
    pub user: Option<UserInfo>,
    pub process: Option<ProcessInfo>,
    pub network: Option<NetworkInfo>,
    pub file: Option<FileInfo>,
    pub registry: Option<RegistryInfo>,
    /// Schemaless bag for fields that have no normalized slot
    #[serde(default)]
    pub fields: serde_json::Map<String, Value>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl NormalizedEvent {
    /// Minimal constructor used by adapters and tests. The id is a
    /// UUIDv7 so ids sort by creation time.
    pub fn new(
        source: EventSource,
        event_id: impl Into<String>,
        severity: EventSeverity,
        message: impl Into<String>,
        host: HostInfo,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            timestamp: now,
            ingested_at: now,
            source,
            event_id: event_id.into(),
            severity,
            category: None,
            message: message.into(),
            host,
            user: None,
            process: None,
            network: None,
            file: None,
            registry: None,
            fields: serde_json::Map::new(),
            tags: BTreeSet::new(),
        }
    }

    /// The `(source, event_id)` tuple as a single buffer key
    pub fn buffer_key(&self) -> String {
        format!("{}:{}", self.source.as_str(), self.event_id)
    }

    /// Resolve a dotted field path against the typed blocks first, then
    /// the schemaless bag. Rule conditions and dedup keys address event
    /// data exclusively through this lookup.
    pub fn field(&self, path: &str) -> Option<Value> {
        match path {
            "id" => return Some(Value::String(self.id.to_string())),
            "event_id" => return Some(Value::String(self.event_id.clone())),
            "source" => return Some(Value::String(self.source.as_str().to_string())),
            "severity" => return Some(Value::String(self.severity.as_str().to_string())),
            "category" => return self.category.clone().map(Value::String),
            "message" => return Some(Value::String(self.message.clone())),
            "timestamp" => return Some(Value::String(self.timestamp.to_rfc3339())),
            "host.hostname" | "hostname" => {
                return Some(Value::String(self.host.hostname.clone()));
            }
            _ => {}
        }

        if let Some(rest) = path.strip_prefix("user.") {
            let user = self.user.as_ref()?;
            return match rest {
                "name" => Some(Value::String(user.name.clone())),
                "id" => user.id.clone().map(Value::String),
                "domain" => user.domain.clone().map(Value::String),
                _ => None,
            };
        }
        if let Some(rest) = path.strip_prefix("process.") {
            let process = self.process.as_ref()?;
            return match rest {
                "name" => Some(Value::String(process.name.clone())),
                "pid" => process.pid.map(Value::from),
                "command_line" => process.command_line.clone().map(Value::String),
                _ => None,
            };
        }
        if let Some(rest) = path.strip_prefix("network.") {
            let network = self.network.as_ref()?;
            return match rest {
                "source_ip" => network.source_ip.clone().map(Value::String),
                "source_port" => network.source_port.map(Value::from),
                "destination_ip" => network.destination_ip.clone().map(Value::String),
                "destination_port" => network.destination_port.map(Value::from),
                "protocol" => network.protocol.clone().map(Value::String),
                "bytes_sent" => network.bytes_sent.map(Value::from),
                "bytes_received" => network.bytes_received.map(Value::from),
                _ => None,
            };
        }
        if let Some(rest) = path.strip_prefix("file.") {
            let file = self.file.as_ref()?;
            return match rest {
                "path" => Some(Value::String(file.path.clone())),
                "hash" => file.hash.clone().map(Value::String),
                "size" => file.size.map(Value::from),
                _ => None,
            };
        }
        if let Some(rest) = path.strip_prefix("registry.") {
            let registry = self.registry.as_ref()?;
            return match rest {
                "key" => Some(Value::String(registry.key.clone())),
                "value_name" => registry.value_name.clone().map(Value::String),
                "value_data" => registry.value_data.clone().map(Value::String),
                _ => None,
            };
        }
        if path == "tags" {
            return Some(Value::Array(
                self.tags.iter().cloned().map(Value::String).collect(),
            ));
        }

        // Schemaless bag, with dotted descent into nested objects
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.fields.get(first)?;
        for part in parts {
            current = current.get(part)?;
        }
        Some(current.clone())
    }

    /// Asset identifiers this event touches: hostname, `user:<name>`,
    /// and `ip:<addr>` entries. Feeds incident `affected_assets`.
    pub fn affected_assets(&self) -> BTreeSet<String> {
        let mut assets = BTreeSet::new();
        if !self.host.hostname.is_empty() {
            assets.insert(self.host.hostname.clone());
        }
        if let Some(user) = &self.user {
            if !user.name.is_empty() {
                assets.insert(format!("user:{}", user.name));
            }
        }
        for ip in &self.host.ips {
            assets.insert(format!("ip:{}", ip));
        }
        if let Some(network) = &self.network {
            if let Some(ip) = &network.source_ip {
                assets.insert(format!("ip:{}", ip));
            }
            if let Some(ip) = &network.destination_ip {
                assets.insert(format!("ip:{}", ip));
            }
        }
        assets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> NormalizedEvent {
        let mut event = NormalizedEvent::new(
            EventSource::WindowsEvent,
            "4625",
            EventSeverity::High,
            "An account failed to log on",
            HostInfo { hostname: "DC01".to_string(), ips: vec!["10.0.0.5".to_string()] },
        );
        event.user = Some(UserInfo { name: "alice".to_string(), id: None, domain: None });
        event.fields.insert(
            "logon".to_string(),
            serde_json::json!({ "type": 3, "failure_reason": "bad password" }),
        );
        event
    }

    #[test]
    fn test_buffer_key() {
        let event = sample_event();
        assert_eq!(event.buffer_key(), "windows_event:4625");
    }

    #[test]
    fn test_field_lookup_typed_blocks() {
        let event = sample_event();
        assert_eq!(event.field("event_id"), Some(Value::String("4625".to_string())));
        assert_eq!(event.field("user.name"), Some(Value::String("alice".to_string())));
        assert_eq!(event.field("host.hostname"), Some(Value::String("DC01".to_string())));
        assert_eq!(event.field("process.name"), None);
    }

    #[test]
    fn test_field_lookup_bag_descent() {
        let event = sample_event();
        assert_eq!(event.field("logon.type"), Some(serde_json::json!(3)));
        assert_eq!(
            event.field("logon.failure_reason"),
            Some(Value::String("bad password".to_string()))
        );
        assert_eq!(event.field("logon.missing"), None);
    }

    #[test]
    fn test_affected_assets() {
        let event = sample_event();
        let assets = event.affected_assets();
        assert!(assets.contains("DC01"));
        assert!(assets.contains("user:alice"));
        assert!(assets.contains("ip:10.0.0.5"));
    }

    #[test]
    fn test_event_ids_are_unique() {
        let a = NormalizedEvent::new(
            EventSource::Syslog,
            "100",
            EventSeverity::Info,
            "a",
            HostInfo::default(),
        );
        let b = NormalizedEvent::new(
            EventSource::Syslog,
            "100",
            EventSeverity::Info,
            "b",
            HostInfo::default(),
        );
        assert_ne!(a.id, b.id);
        assert!(a.timestamp <= a.ingested_at);
    }
}
