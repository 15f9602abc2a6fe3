//! Provisioner port - 計算リソースの作成・列挙・停止・破棄
//!
//! Fly Machines 風 API やサンドボックスコンテナ基盤の契約だけを表す。
//! バックエンドの内部実装はこのクレートの外にある。
//!
//! # 実装
//! - **InMemoryProvisioner**: 開発・テスト用（impls/memory_provisioner.rs）

use async_trait::async_trait;

use crate::domain::{MachineConfig, ProvisionError, Resource, ResourceFilter, ResourceId};

/// Provisioner はリソースのライフサイクルを管理する外部コラボレータ
///
/// # 契約
/// - `create`: 同名の live なリソースがあれば `ProvisionError::Conflict`
/// - `stop` / `destroy`: 冪等。停止済み・破棄済みへの再要求は成功扱い
/// - 失敗は `ProvisionError::kind()` で retryable / fatal を区別できること
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn create(&self, name: &str, config: &MachineConfig) -> Result<Resource, ProvisionError>;

    async fn list(&self, filter: &ResourceFilter) -> Result<Vec<Resource>, ProvisionError>;

    async fn stop(&self, id: &ResourceId) -> Result<(), ProvisionError>;

    async fn destroy(&self, id: &ResourceId) -> Result<(), ProvisionError>;
}
