//! IdGenerator port - ID 生成の抽象化
//!
//! 呼び出し側がセッション ID を持っていない場合（CLI のデモ、バッチ投入など）や、
//! InMemoryProvisioner がリソース ID を払い出す場合に使う。
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use crate::domain::{ResourceId, SessionId};
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator は分散システムで使える ID を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（複数タスクから使える）
pub trait IdGenerator: Send + Sync {
    /// Session ID を生成
    fn generate_session_id(&self) -> SessionId;

    /// Resource ID を生成
    fn generate_resource_id(&self) -> ResourceId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// Clock を使って現在時刻ベースの ULID を生成します。
/// ID は小文字化する（リソース名 `session-<id>` がホスト名として使われることがあるため）。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    /// 新しい UlidGenerator を作成
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_session_id(&self) -> SessionId {
        SessionId::from_ulid(self.next_ulid())
    }

    fn generate_resource_id(&self) -> ResourceId {
        ResourceId::from_ulid(self.next_ulid())
    }
}
