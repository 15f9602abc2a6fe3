//! Session - 論理的な作業単位とその状態機械
//!
//! # 状態遷移
//! - pending → running → {done, error} → destroyed
//! - destroyed は非終端状態のどこからでも到達可能（destroy_session / Reaper）
//! - done / error は running からのみ（Worker 自身の終端書き込み）

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ResourceId, SessionId};
use super::records::{Lease, ResourceMapping, StatusRecord};

/// SessionStatus はセッションの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Done,
    Error,
    Destroyed,
}

impl SessionStatus {
    /// Worker の終端書き込みが済んでいるか
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Done | SessionStatus::Error | SessionStatus::Destroyed
        )
    }

    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            (Running, Done | Error) => true,
            (Done | Error, Destroyed) => true,
            (Pending | Running, Destroyed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Done => "done",
            SessionStatus::Error => "error",
            SessionStatus::Destroyed => "destroyed",
        }
    }
}

impl From<&StatusRecord> for SessionStatus {
    fn from(record: &StatusRecord) -> Self {
        match record {
            StatusRecord::Done => SessionStatus::Done,
            StatusRecord::Error { .. } => SessionStatus::Error,
        }
    }
}

/// Session はレジストリの状態から組み立てたビュー
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub resource_id: Option<ResourceId>,
    pub created_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub error_message: Option<String>,
}

impl Session {
    /// 3 つのレコードからセッションを組み立てる
    ///
    /// 優先順位は Reaper と同じ: status record > lease > mapping。
    /// どれもなければ None（未知のセッション）。
    pub fn from_records(
        id: SessionId,
        mapping: Option<ResourceMapping>,
        lease: Option<Lease>,
        status: Option<StatusRecord>,
    ) -> Option<Self> {
        if mapping.is_none() && lease.is_none() && status.is_none() {
            return None;
        }

        let resource_id = mapping
            .as_ref()
            .map(|m| m.resource_id.clone())
            .or_else(|| lease.as_ref().map(|l| l.resource_id.clone()));
        let created_at = mapping.as_ref().map(|m| m.created_at);

        let (status, error_message) = match (&status, &lease) {
            (Some(record @ StatusRecord::Error { message }), _) => {
                (SessionStatus::from(record), Some(message.clone()))
            }
            (Some(record), _) => (SessionStatus::from(record), None),
            (None, Some(_)) => (SessionStatus::Running, None),
            (None, None) => (SessionStatus::Pending, None),
        };

        Some(Self {
            id,
            resource_id,
            created_at,
            status,
            error_message,
        })
    }
}
