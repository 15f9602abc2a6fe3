//! Registry records: Lease, StatusRecord, ResourceMapping.
//!
//! Design:
//! - Each record has a stable JSON schema; readers ignore unknown fields so that
//!   writers can add fields without breaking older readers.
//! - Timestamps are unix epoch milliseconds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::ids::{ResourceId, SessionId};

/// Liveness state reported in a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseStatus {
    Running,
    /// Written by a newer worker version; treated as a live lease.
    #[serde(other)]
    Unknown,
}

/// Short-TTL liveness record, renewed by the worker on every heartbeat.
///
/// `started_at` is fixed when the reporter starts and survives renewals:
/// it anchors the wall-clock budget the reaper enforces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub resource_id: ResourceId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub started_at: DateTime<Utc>,
    pub status: LeaseStatus,
}

impl Lease {
    pub fn running(resource_id: ResourceId, started_at: DateTime<Utc>) -> Self {
        Self {
            resource_id,
            started_at,
            status: LeaseStatus::Running,
        }
    }

    /// How long this worker has been running as of `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.started_at)
    }
}

/// Terminal outcome written once by the worker.
///
/// Wire form: the bare string `"done"`, or `{"status":"error","message":...}`.
/// Readers also accept `{"status":"done"}` and a bare `"error"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusRecord {
    Done,
    Error { message: String },
}

impl StatusRecord {
    pub fn error(message: impl Into<String>) -> Self {
        StatusRecord::Error {
            message: message.into(),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, StatusRecord::Done)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusRecord::Done => "done",
            StatusRecord::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum TerminalKind {
    Done,
    Error,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StatusWire {
    Bare(TerminalKind),
    Tagged {
        status: TerminalKind,
        #[serde(default)]
        message: Option<String>,
    },
}

#[derive(Serialize)]
struct ErrorWire<'a> {
    status: TerminalKind,
    message: &'a str,
}

impl Serialize for StatusRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            StatusRecord::Done => TerminalKind::Done.serialize(serializer),
            StatusRecord::Error { message } => ErrorWire {
                status: TerminalKind::Error,
                message,
            }
            .serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for StatusRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (kind, message) = match StatusWire::deserialize(deserializer)? {
            StatusWire::Bare(kind) => (kind, None),
            StatusWire::Tagged { status, message } => (status, message),
        };
        Ok(match kind {
            TerminalKind::Done => StatusRecord::Done,
            TerminalKind::Error => StatusRecord::Error {
                message: message.unwrap_or_default(),
            },
        })
    }
}

/// Dedup record binding a session to its provisioned resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMapping {
    pub session_id: SessionId,
    pub resource_id: ResourceId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn status_done_is_a_bare_string() {
        assert_eq!(serde_json::to_value(StatusRecord::Done).unwrap(), json!("done"));
    }

    #[test]
    fn status_error_is_tagged_object() {
        let value = serde_json::to_value(StatusRecord::error("boom")).unwrap();
        assert_eq!(value, json!({"status": "error", "message": "boom"}));
    }

    #[test]
    fn status_reader_accepts_alternate_forms() {
        let tagged_done: StatusRecord =
            serde_json::from_value(json!({"status": "done", "exit_code": 0})).unwrap();
        assert_eq!(tagged_done, StatusRecord::Done);

        let bare_error: StatusRecord = serde_json::from_value(json!("error")).unwrap();
        assert_eq!(bare_error, StatusRecord::error(""));

        let unknown: Result<StatusRecord, _> = serde_json::from_value(json!("paused"));
        assert!(unknown.is_err());
    }

    #[test]
    fn lease_tolerates_extra_fields_and_unknown_status() {
        let lease: Lease = serde_json::from_value(json!({
            "resource_id": "m-1",
            "started_at": 1_700_000_000_000_i64,
            "status": "draining",
            "hostname": "worker-7",
        }))
        .unwrap();

        assert_eq!(lease.resource_id.as_str(), "m-1");
        assert_eq!(lease.status, LeaseStatus::Unknown);
        assert_eq!(lease.started_at.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn lease_age_is_measured_from_start() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let lease = Lease::running(ResourceId::new("m-1").unwrap(), start);
        let now = start + chrono::Duration::seconds(601);
        assert_eq!(lease.age(now).num_seconds(), 601);
    }

    #[test]
    fn mapping_schema_is_stable() {
        let mapping = ResourceMapping {
            session_id: SessionId::new("s1").unwrap(),
            resource_id: ResourceId::new("m-1").unwrap(),
            created_at: Utc.timestamp_millis_opt(1_000).unwrap(),
        };
        assert_eq!(
            serde_json::to_value(&mapping).unwrap(),
            json!({"session_id": "s1", "resource_id": "m-1", "created_at": 1000})
        );
    }
}
