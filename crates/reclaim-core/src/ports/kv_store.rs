//! KvStore port - TTL 付き KV ストア（Redis / Upstash など）
//!
//! レジストリの最下層。キー単位の操作だけを要求し、複数キーのトランザクションは使わない。
//!
//! # 実装
//! - **InMemoryKvStore**: 開発・テスト用（impls/memory_store.rs）

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::RegistryError;

/// KvStore は per-key TTL と atomic な set / delete を持つストア
///
/// # 設計原則
/// - 各操作はキー単位で atomic
/// - 接続エラーは `RegistryError::Unavailable` として呼び出し側へ返す
/// - ローカルのバッファリングや再試行キューは持たない（再試行方針は呼び出し側が決める）
#[async_trait]
pub trait KvStore: Send + Sync {
    /// 値を書き込み、TTL をリセットする（last-write-wins）
    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration)
    -> Result<(), RegistryError>;

    /// 値を読む。存在しない・期限切れなら None
    async fn get(&self, key: &str) -> Result<Option<String>, RegistryError>;

    /// キーを削除し、実際に消えた数を返す。存在しないキーはエラーではない。
    async fn delete(&self, keys: &[String]) -> Result<usize, RegistryError>;
}
