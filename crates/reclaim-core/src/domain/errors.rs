//! Errors - エラー型と分類
//!
//! # 方針
//! - 失敗は必ず session_id / resource_id / 操作名を持つ（構造化ログ用）
//! - Provisioner の失敗は `ErrorKind` で「次の sweep で再試行してよいか」を判定する
//!   （Reaper の retry-next-sweep と Orchestrator の fail-fast が同じ値を使う）

use std::time::Duration;

use thiserror::Error;

use super::ids::{IdError, ResourceId, SessionId};

/// ErrorKind は実行エラーの分類
///
/// - Transient: 一時的なエラー（リトライ推奨）
/// - Permanent: 恒久的なエラー（リトライ無意味）
/// - Infrastructure: インフラエラー（レジストリ・Provisioner API の到達不能）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::Infrastructure)
    }
}

/// RegistryError はレジストリ（TTL 付き KV ストア）の失敗
#[derive(Debug, Error)]
pub enum RegistryError {
    /// ストアに到達できない。呼び出し側が再試行方針を決める。
    #[error("registry unavailable during {op} on {key}: {message}")]
    Unavailable {
        op: &'static str,
        key: String,
        message: String,
    },

    /// 値が期待するレコード型として読めない
    #[error("malformed record at {key}: {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl RegistryError {
    pub fn unavailable(op: &'static str, key: impl Into<String>, message: impl Into<String>) -> Self {
        RegistryError::Unavailable {
            op,
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::Unavailable { .. } => ErrorKind::Infrastructure,
            RegistryError::Codec { .. } => ErrorKind::Permanent,
        }
    }
}

/// ProvisionError は Provisioner（create / list / stop / destroy）の失敗
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// API に到達できない・5xx
    #[error("provisioner unavailable during {op}: {message}")]
    Unavailable { op: &'static str, message: String },

    /// レート制限
    #[error("provisioner rate limited during {op}")]
    RateLimited {
        op: &'static str,
        retry_after: Option<Duration>,
    },

    /// 対象リソースが存在しない
    #[error("resource {resource_id} not found during {op}")]
    NotFound {
        op: &'static str,
        resource_id: ResourceId,
    },

    /// 同名のリソースがすでに存在する（並行 create の負け側）
    #[error("resource named {name} already exists")]
    Conflict { name: String },

    /// 設定不備など、再試行しても直らない失敗
    #[error("invalid provisioner request during {op}: {message}")]
    InvalidConfig { op: &'static str, message: String },

    #[error("provisioner returned malformed resource: {0}")]
    MalformedResource(#[from] IdError),
}

impl ProvisionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProvisionError::Unavailable { .. } => ErrorKind::Infrastructure,
            ProvisionError::RateLimited { .. } => ErrorKind::Transient,
            ProvisionError::Conflict { .. } => ErrorKind::Transient,
            ProvisionError::NotFound { .. }
            | ProvisionError::InvalidConfig { .. }
            | ProvisionError::MalformedResource(_) => ErrorKind::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProvisionError::NotFound { .. })
    }
}

/// LeaseError は Worker 側 LeaseReporter の失敗
#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("lease reporter for session {0} already started")]
    AlreadyStarted(SessionId),

    #[error("lease reporter for session {0} is closed")]
    Closed(SessionId),

    #[error("lease write for session {session_id} failed: {source}")]
    Registry {
        session_id: SessionId,
        #[source]
        source: RegistryError,
    },
}

/// SessionError は Orchestrator の失敗
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("registry error for session {session_id}: {source}")]
    Registry {
        session_id: SessionId,
        #[source]
        source: RegistryError,
    },

    #[error("provisioning failed for session {session_id}: {source}")]
    Provision {
        session_id: SessionId,
        #[source]
        source: ProvisionError,
    },

    /// wait_for_session の期限切れ。セッション自体は後で完了しうる。
    #[error("session {session_id} did not finish within {waited:?}")]
    Timeout {
        session_id: SessionId,
        waited: Duration,
    },

    #[error("session {0} not found")]
    NotFound(SessionId),
}

impl SessionError {
    pub fn session_id(&self) -> &SessionId {
        match self {
            SessionError::Registry { session_id, .. }
            | SessionError::Provision { session_id, .. }
            | SessionError::Timeout { session_id, .. }
            | SessionError::NotFound(session_id) => session_id,
        }
    }

    /// 呼び出し側がそのまま再試行してよいか
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::Registry { source, .. } => source.kind().is_retryable(),
            SessionError::Provision { source, .. } => source.is_retryable(),
            SessionError::Timeout { .. } | SessionError::NotFound(_) => false,
        }
    }
}
