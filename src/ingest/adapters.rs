//! Source adapters
//!
//! One adapter per source type converts raw payloads into the
//! `NormalizedEvent` shape. Anything without a normalized slot lands in
//! the schemaless `fields` bag.

use crate::models::{
    EventSeverity, EventSource, HostInfo, NetworkInfo, NormalizedEvent, ProcessInfo, UserInfo,
};
use crate::utils::error::{EngineError, EngineResult};
use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Converts one raw record into a normalized event
pub trait LogAdapter: Send + Sync {
    fn source(&self) -> EventSource;

    fn parse(&self, raw: &str) -> EngineResult<NormalizedEvent>;
}

// ---------------------------------------------------------------------------
// Syslog (RFC 3164 and RFC 5424)
// ---------------------------------------------------------------------------

// "<34>Oct 11 22:14:15 mymachine su: 'su root' failed for lonvick on /dev/pts/8"
static RFC3164_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^<(?P<pri>\d{1,3})>(?P<ts>[A-Z][a-z]{2}\s+\d{1,2} \d{2}:\d{2}:\d{2}) (?P<host>\S+) (?P<tag>[^:\[\s]+)(?:\[(?P<pid>\d+)\])?:?\s*(?P<msg>.*)$",
    )
    .unwrap()
});

// "<165>1 2003-10-11T22:14:15.003Z mymachine.example.com evntslog 1234 ID47 - message"
static RFC5424_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^<(?P<pri>\d{1,3})>1 (?P<ts>\S+) (?P<host>\S+) (?P<app>\S+) (?P<pid>\S+) (?P<msgid>\S+) (?:-|\[[^\]]*\])\s*(?P<msg>.*)$",
    )
    .unwrap()
});

pub struct SyslogAdapter;

impl SyslogAdapter {
    fn severity_from_pri(pri: u32) -> EventSeverity {
        match pri % 8 {
            0 | 1 | 2 => EventSeverity::Critical,
            3 => EventSeverity::High,
            4 => EventSeverity::Medium,
            5 => EventSeverity::Low,
            _ => EventSeverity::Info,
        }
    }

    fn parse_rfc3164_timestamp(raw: &str) -> Option<DateTime<Utc>> {
        // The RFC 3164 timestamp has no year; assume the current one.
        let with_year = format!("{} {}", Utc::now().year(), raw);
        NaiveDateTime::parse_from_str(&with_year, "%Y %b %e %H:%M:%S")
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive))
    }
}

impl LogAdapter for SyslogAdapter {
    fn source(&self) -> EventSource {
        EventSource::Syslog
    }

    fn parse(&self, raw: &str) -> EngineResult<NormalizedEvent> {
        let line = raw.trim();

        if let Some(cap) = RFC5424_REGEX.captures(line) {
            let pri: u32 = cap["pri"].parse().unwrap_or(13);
            let severity = Self::severity_from_pri(pri);
            let timestamp = DateTime::parse_from_rfc3339(&cap["ts"])
                .map(|ts| ts.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());

            let mut event = NormalizedEvent::new(
                EventSource::Syslog,
                cap["msgid"].to_string(),
                severity,
                cap["msg"].to_string(),
                HostInfo { hostname: cap["host"].to_string(), ips: vec![] },
            );
            event.timestamp = timestamp.min(event.ingested_at);
            let app = cap["app"].to_string();
            let pid = cap["pid"].parse::<i64>().ok();
            if app != "-" {
                event.process = Some(ProcessInfo { name: app, pid, command_line: None });
            }
            event.fields.insert("facility".to_string(), Value::from(pri / 8));
            return Ok(event);
        }

        if let Some(cap) = RFC3164_REGEX.captures(line) {
            let pri: u32 = cap["pri"].parse().unwrap_or(13);
            let severity = Self::severity_from_pri(pri);

            let mut event = NormalizedEvent::new(
                EventSource::Syslog,
                cap["tag"].to_string(),
                severity,
                cap["msg"].to_string(),
                HostInfo { hostname: cap["host"].to_string(), ips: vec![] },
            );
            if let Some(ts) = Self::parse_rfc3164_timestamp(&cap["ts"]) {
                event.timestamp = ts.min(event.ingested_at);
            }
            event.process = Some(ProcessInfo {
                name: cap["tag"].to_string(),
                pid: cap.name("pid").and_then(|m| m.as_str().parse().ok()),
                command_line: None,
            });
            event.fields.insert("facility".to_string(), Value::from(pri / 8));
            return Ok(event);
        }

        Err(EngineError::validation_field("unrecognized syslog line", "raw"))
    }
}

// ---------------------------------------------------------------------------
// Windows Event Log (JSON export shape)
// ---------------------------------------------------------------------------

pub struct WindowsEventAdapter;

impl WindowsEventAdapter {
    fn severity_from_level(level: i64) -> EventSeverity {
        match level {
            1 => EventSeverity::Critical,
            2 => EventSeverity::High,
            3 => EventSeverity::Medium,
            4 => EventSeverity::Info,
            _ => EventSeverity::Low,
        }
    }
}

impl LogAdapter for WindowsEventAdapter {
    fn source(&self) -> EventSource {
        EventSource::WindowsEvent
    }

    fn parse(&self, raw: &str) -> EngineResult<NormalizedEvent> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|err| EngineError::validation_field(format!("invalid JSON: {}", err), "raw"))?;

        let event_id = value
            .get("EventID")
            .map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .ok_or_else(|| EngineError::validation_field("missing EventID", "EventID"))?;

        let level = value.get("Level").and_then(Value::as_i64).unwrap_or(4);
        let hostname = value
            .get("Computer")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let message = value
            .get("Message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut event = NormalizedEvent::new(
            EventSource::WindowsEvent,
            event_id,
            Self::severity_from_level(level),
            message,
            HostInfo { hostname, ips: vec![] },
        );

        if let Some(ts) = value
            .get("TimeCreated")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        {
            event.timestamp = ts.with_timezone(&Utc).min(event.ingested_at);
        }
        event.category = value
            .get("Channel")
            .and_then(Value::as_str)
            .map(str::to_string);

        if let Some(data) = value.get("EventData").and_then(Value::as_object) {
            if let Some(user) = data.get("TargetUserName").and_then(Value::as_str) {
                event.user = Some(UserInfo {
                    name: user.to_string(),
                    id: data.get("TargetUserSid").and_then(Value::as_str).map(str::to_string),
                    domain: data
                        .get("TargetDomainName")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                });
            }
            if let Some(ip) = data.get("IpAddress").and_then(Value::as_str) {
                if ip != "-" {
                    event.network = Some(NetworkInfo {
                        source_ip: Some(ip.to_string()),
                        source_port: data
                            .get("IpPort")
                            .and_then(Value::as_str)
                            .and_then(|p| p.parse().ok()),
                        ..Default::default()
                    });
                }
            }
            if let Some(process) = data.get("ProcessName").and_then(Value::as_str) {
                event.process = Some(ProcessInfo {
                    name: process.to_string(),
                    pid: None,
                    command_line: data
                        .get("CommandLine")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                });
            }
            for (key, val) in data {
                event.fields.insert(key.clone(), val.clone());
            }
        }

        Ok(event)
    }
}

// ---------------------------------------------------------------------------
// AWS CloudTrail
// ---------------------------------------------------------------------------

pub struct CloudTrailAdapter;

impl LogAdapter for CloudTrailAdapter {
    fn source(&self) -> EventSource {
        EventSource::CloudTrail
    }

    fn parse(&self, raw: &str) -> EngineResult<NormalizedEvent> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|err| EngineError::validation_field(format!("invalid JSON: {}", err), "raw"))?;

        let event_name = value
            .get("eventName")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::validation_field("missing eventName", "eventName"))?
            .to_string();

        let error_code = value.get("errorCode").and_then(Value::as_str);
        let severity = match error_code {
            Some("AccessDenied") | Some("UnauthorizedOperation") => EventSeverity::High,
            Some(_) => EventSeverity::Medium,
            None => EventSeverity::Info,
        };

        let message = match error_code {
            Some(code) => format!("{} failed: {}", event_name, code),
            None => event_name.clone(),
        };

        let mut event = NormalizedEvent::new(
            EventSource::CloudTrail,
            event_name,
            severity,
            message,
            HostInfo {
                hostname: value
                    .get("eventSource")
                    .and_then(Value::as_str)
                    .unwrap_or("aws")
                    .to_string(),
                ips: vec![],
            },
        );

        if let Some(ts) = value
            .get("eventTime")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        {
            event.timestamp = ts.with_timezone(&Utc).min(event.ingested_at);
        }
        event.category = value
            .get("eventCategory")
            .and_then(Value::as_str)
            .map(str::to_string);

        if let Some(identity) = value.get("userIdentity") {
            let name = identity
                .get("userName")
                .or_else(|| identity.get("arn"))
                .and_then(Value::as_str);
            if let Some(name) = name {
                event.user = Some(UserInfo {
                    name: name.to_string(),
                    id: identity
                        .get("principalId")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    domain: identity
                        .get("accountId")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                });
            }
        }
        if let Some(ip) = value.get("sourceIPAddress").and_then(Value::as_str) {
            event.network = Some(NetworkInfo {
                source_ip: Some(ip.to_string()),
                ..Default::default()
            });
        }
        if let Some(region) = value.get("awsRegion") {
            event.fields.insert("aws_region".to_string(), region.clone());
        }
        if let Some(params) = value.get("requestParameters") {
            event.fields.insert("request_parameters".to_string(), params.clone());
        }

        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc3164_line() {
        let adapter = SyslogAdapter;
        let event = adapter
            .parse("<34>Oct 11 22:14:15 mymachine su: 'su root' failed for lonvick")
            .unwrap();
        assert_eq!(event.source, EventSource::Syslog);
        assert_eq!(event.host.hostname, "mymachine");
        assert_eq!(event.event_id, "su");
        assert_eq!(event.severity, EventSeverity::Critical);
        assert!(event.message.contains("failed for lonvick"));
    }

    #[test]
    fn test_rfc5424_line() {
        let adapter = SyslogAdapter;
        let event = adapter
            .parse("<165>1 2023-10-11T22:14:15.003Z edge01 sshd 4321 AUTHFAIL - invalid password")
            .unwrap();
        assert_eq!(event.host.hostname, "edge01");
        assert_eq!(event.event_id, "AUTHFAIL");
        assert_eq!(event.process.as_ref().map(|p| p.name.as_str()), Some("sshd"));
        assert_eq!(event.severity, EventSeverity::Low);
    }

    #[test]
    fn test_garbage_syslog_is_validation_error() {
        let adapter = SyslogAdapter;
        let err = adapter.parse("not syslog at all").unwrap_err();
        assert_eq!(err.class(), "VALIDATION");
    }

    #[test]
    fn test_windows_event_json() {
        let adapter = WindowsEventAdapter;
        let raw = serde_json::json!({
            "EventID": "4625",
            "Level": 2,
            "Computer": "DC01",
            "Channel": "Security",
            "Message": "An account failed to log on.",
            "TimeCreated": "2024-05-01T10:00:00Z",
            "EventData": {
                "TargetUserName": "alice",
                "TargetDomainName": "CORP",
                "IpAddress": "10.0.0.9",
                "IpPort": "49923"
            }
        })
        .to_string();

        let event = adapter.parse(&raw).unwrap();
        assert_eq!(event.event_id, "4625");
        assert_eq!(event.severity, EventSeverity::High);
        assert_eq!(event.user.as_ref().map(|u| u.name.as_str()), Some("alice"));
        assert_eq!(
            event.network.as_ref().and_then(|n| n.source_ip.as_deref()),
            Some("10.0.0.9")
        );
        assert_eq!(event.buffer_key(), "windows_event:4625");
    }

    #[test]
    fn test_cloudtrail_record() {
        let adapter = CloudTrailAdapter;
        let raw = serde_json::json!({
            "eventName": "ConsoleLogin",
            "eventTime": "2024-05-01T10:00:00Z",
            "eventSource": "signin.amazonaws.com",
            "awsRegion": "us-east-1",
            "errorCode": "AccessDenied",
            "sourceIPAddress": "203.0.113.7",
            "userIdentity": { "userName": "bob", "accountId": "123456789012" }
        })
        .to_string();

        let event = adapter.parse(&raw).unwrap();
        assert_eq!(event.event_id, "ConsoleLogin");
        assert_eq!(event.severity, EventSeverity::High);
        assert_eq!(event.user.as_ref().map(|u| u.name.as_str()), Some("bob"));
        assert!(event.message.contains("AccessDenied"));
        assert_eq!(event.fields.get("aws_region"), Some(&Value::from("us-east-1")));
    }
}
