//! ControlPlaneBuilder - コンポーネントの構築とワイヤリング
//!
//! # 方針
//! - 依存（KvStore, Provisioner, Clock）は明示的に注入する。グローバルな接続は持たない
//! - 起動時検証（Fail-fast）: ストアや Provisioner の指定漏れ、設定の矛盾は build() で弾く

use std::sync::Arc;

use crate::app::lease_reporter::LeaseReporter;
use crate::app::orchestrator::SessionOrchestrator;
use crate::app::reaper::Reaper;
use crate::app::registry::Registry;
use crate::config::{ConfigError, ReclaimConfig};
use crate::domain::{ResourceId, SessionId};
use crate::ports::{Clock, KvStore, Provisioner, SystemClock};

/// ControlPlaneBuilder はコントロールプレーンを構築
///
/// # 使用例
/// ```ignore
/// let plane = ControlPlaneBuilder::new(config)
///     .store(Arc::new(InMemoryKvStore::new()))
///     .provisioner(Arc::new(InMemoryProvisioner::new()))
///     .build()?;
/// let handle = plane.reaper.clone().spawn(cancel.clone());
/// ```
pub struct ControlPlaneBuilder {
    config: ReclaimConfig,
    store: Option<Arc<dyn KvStore>>,
    provisioner: Option<Arc<dyn Provisioner>>,
    clock: Option<Arc<dyn Clock>>,
}

/// BuildError は構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no registry store configured")]
    MissingStore,

    #[error("no provisioner configured")]
    MissingProvisioner,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ControlPlaneBuilder {
    pub fn new(config: ReclaimConfig) -> Self {
        Self {
            config,
            store: None,
            provisioner: None,
            clock: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// 省略時は SystemClock
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<ControlPlane, BuildError> {
        self.config.validate()?;
        let store = self.store.ok_or(BuildError::MissingStore)?;
        let provisioner = self.provisioner.ok_or(BuildError::MissingProvisioner)?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let registry = Registry::new(store, self.config.key_space());
        let reaper = Reaper::new(
            registry.clone(),
            Arc::clone(&provisioner),
            Arc::clone(&clock),
            self.config.reaper_settings(),
        );
        let orchestrator = Arc::new(SessionOrchestrator::new(
            registry.clone(),
            provisioner,
            self.config.orchestrator_settings(),
        ));

        Ok(ControlPlane {
            config: self.config,
            registry,
            clock,
            reaper,
            orchestrator,
        })
    }
}

/// ControlPlane は構築済みのコンポーネント一式
pub struct ControlPlane {
    pub config: ReclaimConfig,
    pub registry: Registry,
    pub clock: Arc<dyn Clock>,
    pub reaper: Reaper,
    pub orchestrator: Arc<SessionOrchestrator>,
}

impl ControlPlane {
    /// 同じレジストリと設定を使う Worker 用の LeaseReporter
    pub fn lease_reporter(&self, session_id: SessionId, resource_id: ResourceId) -> LeaseReporter {
        LeaseReporter::new(
            self.registry.clone(),
            Arc::clone(&self.clock),
            session_id,
            resource_id,
            self.config.heartbeat_settings(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{InMemoryKvStore, InMemoryProvisioner};

    #[test]
    fn build_success() {
        let plane = ControlPlaneBuilder::new(ReclaimConfig::default())
            .store(Arc::new(InMemoryKvStore::new()))
            .provisioner(Arc::new(InMemoryProvisioner::new()))
            .build()
            .unwrap();
        assert_eq!(plane.registry.keys().prefix(), "agent:");
        assert_eq!(plane.reaper.settings().interval.as_secs(), 30);
    }

    #[test]
    fn build_without_store_fails() {
        let result = ControlPlaneBuilder::new(ReclaimConfig::default())
            .provisioner(Arc::new(InMemoryProvisioner::new()))
            .build();
        assert!(matches!(result, Err(BuildError::MissingStore)));
    }

    #[test]
    fn build_without_provisioner_fails() {
        let result = ControlPlaneBuilder::new(ReclaimConfig::default())
            .store(Arc::new(InMemoryKvStore::new()))
            .build();
        assert!(matches!(result, Err(BuildError::MissingProvisioner)));
    }

    #[test]
    fn build_rejects_invalid_config() {
        let config = ReclaimConfig {
            heartbeat_ttl_seconds: 5,
            ..ReclaimConfig::default()
        };
        let result = ControlPlaneBuilder::new(config)
            .store(Arc::new(InMemoryKvStore::new()))
            .provisioner(Arc::new(InMemoryProvisioner::new()))
            .build();
        assert!(matches!(result, Err(BuildError::Config(_))));
    }

    #[tokio::test]
    async fn reporters_share_the_plane_registry() {
        let store = Arc::new(InMemoryKvStore::new());
        let plane = ControlPlaneBuilder::new(ReclaimConfig::default())
            .store(store.clone())
            .provisioner(Arc::new(InMemoryProvisioner::new()))
            .build()
            .unwrap();
        let reporter = plane.lease_reporter(
            SessionId::new("s1").unwrap(),
            ResourceId::new("m-1").unwrap(),
        );
        reporter.start().await.unwrap();
        reporter.close().await;
        assert_eq!(store.keys().await, vec!["agent:heartbeat:s1".to_string()]);
    }
}
