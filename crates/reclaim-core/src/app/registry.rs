//! Registry - KvStore 上の型付きアクセサ
//!
//! # キー空間
//! | キー | 値 | TTL |
//! |---|---|---|
//! | `{prefix}heartbeat:{session_id}` | `Lease` | heartbeat_ttl（更新ごとにリセット） |
//! | `{prefix}status:{session_id}` | `StatusRecord` | status_ttl（長め） |
//! | `{prefix}resource:{session_id}` | `ResourceMapping` | max_turn_timeout + grace |
//!
//! すべてセッション単位のキーで、セッションをまたぐキーは存在しない。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{Lease, RegistryError, ResourceMapping, SessionId, StatusRecord};
use crate::ports::KvStore;

/// KeySpace はレジストリのキー命名規約
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub const DEFAULT_PREFIX: &'static str = "agent:";

    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn heartbeat(&self, session_id: &SessionId) -> String {
        format!("{}heartbeat:{session_id}", self.prefix)
    }

    pub fn status(&self, session_id: &SessionId) -> String {
        format!("{}status:{session_id}", self.prefix)
    }

    pub fn resource(&self, session_id: &SessionId) -> String {
        format!("{}resource:{session_id}", self.prefix)
    }

    /// セッションに属する全キー
    pub fn all(&self, session_id: &SessionId) -> [String; 3] {
        [
            self.heartbeat(session_id),
            self.status(session_id),
            self.resource(session_id),
        ]
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PREFIX)
    }
}

/// Registry はレジストリクライアント
///
/// 接続エラーはそのまま返す。再試行するかどうかは呼び出し側
/// （LeaseReporter は次の tick、Reaper は次の sweep）が決める。
#[derive(Clone)]
pub struct Registry {
    store: Arc<dyn KvStore>,
    keys: KeySpace,
}

impl Registry {
    pub fn new(store: Arc<dyn KvStore>, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub async fn write_lease(
        &self,
        session_id: &SessionId,
        lease: &Lease,
        ttl: Duration,
    ) -> Result<(), RegistryError> {
        self.put(self.keys.heartbeat(session_id), lease, ttl).await
    }

    pub async fn read_lease(&self, session_id: &SessionId) -> Result<Option<Lease>, RegistryError> {
        self.fetch(&self.keys.heartbeat(session_id)).await
    }

    pub async fn write_status(
        &self,
        session_id: &SessionId,
        status: &StatusRecord,
        ttl: Duration,
    ) -> Result<(), RegistryError> {
        self.put(self.keys.status(session_id), status, ttl).await
    }

    pub async fn read_status(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<StatusRecord>, RegistryError> {
        self.fetch(&self.keys.status(session_id)).await
    }

    pub async fn write_mapping(
        &self,
        mapping: &ResourceMapping,
        ttl: Duration,
    ) -> Result<(), RegistryError> {
        self.put(self.keys.resource(&mapping.session_id), mapping, ttl)
            .await
    }

    pub async fn read_mapping(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<ResourceMapping>, RegistryError> {
        self.fetch(&self.keys.resource(session_id)).await
    }

    /// lease を消してから終端 status を書く
    ///
    /// 2 キーにまたがるが順序だけが重要で、トランザクションは不要。
    /// 途中で失敗しても status がない状態は Reaper から見て heartbeat_lost になる。
    pub async fn retire(
        &self,
        session_id: &SessionId,
        status: &StatusRecord,
        ttl: Duration,
    ) -> Result<(), RegistryError> {
        self.store.delete(&[self.keys.heartbeat(session_id)]).await?;
        self.write_status(session_id, status, ttl).await
    }

    /// セッションの lease / status / mapping を一括削除し、消えた数を返す
    pub async fn clear_session(&self, session_id: &SessionId) -> Result<usize, RegistryError> {
        self.store.delete(&self.keys.all(session_id)).await
    }

    async fn put<T: Serialize>(
        &self,
        key: String,
        value: &T,
        ttl: Duration,
    ) -> Result<(), RegistryError> {
        let json = serde_json::to_string(value).map_err(|source| RegistryError::Codec {
            key: key.clone(),
            source,
        })?;
        self.store.set_with_ttl(&key, json, ttl).await
    }

    async fn fetch<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, RegistryError> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| RegistryError::Codec {
                key: key.to_string(),
                source,
            })
    }
}
