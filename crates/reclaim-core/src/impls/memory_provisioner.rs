//! InMemoryProvisioner - 開発・テスト用のリソース基盤
//!
//! # 振る舞い
//! - create: 同名の非終端リソースがあれば `Conflict`（名前による冪等化を再現）
//! - create 直後のリソースは `Started`
//! - stop: `auto_destroy` なら `Destroyed`、そうでなければ `Stopped`。停止済みへの stop は成功
//! - destroy: 破棄済みへの destroy は成功、未知の ID は `NotFound`
//! - 障害注入: `fail_next_creates(n)` / `fail_next_stops(n)` は retryable な `Unavailable` を返す

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{
    MachineConfig, ProvisionError, Resource, ResourceFilter, ResourceId, ResourceState,
};
use crate::ports::{Clock, IdGenerator, Provisioner, SystemClock, UlidGenerator};

#[derive(Debug, Clone)]
struct Machine {
    resource: Resource,
    config: MachineConfig,
}

/// InMemoryProvisioner は開発用の Provisioner
pub struct InMemoryProvisioner {
    machines: Mutex<HashMap<ResourceId, Machine>>,
    clock: Arc<dyn Clock>,
    ids: UlidGenerator<Arc<dyn Clock>>,
    failing_creates: AtomicUsize,
    failing_stops: AtomicUsize,
    creates: AtomicUsize,
    stops: AtomicUsize,
    destroys: AtomicUsize,
}

impl InMemoryProvisioner {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            machines: Mutex::new(HashMap::new()),
            ids: UlidGenerator::new(Arc::clone(&clock)),
            clock,
            failing_creates: AtomicUsize::new(0),
            failing_stops: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            destroys: AtomicUsize::new(0),
        }
    }

    /// 次の `n` 回の create を失敗させる
    pub fn fail_next_creates(&self, n: usize) {
        self.failing_creates.store(n, Ordering::SeqCst);
    }

    /// 次の `n` 回の stop を失敗させる
    pub fn fail_next_stops(&self, n: usize) {
        self.failing_stops.store(n, Ordering::SeqCst);
    }

    /// このシステム以外が作ったリソースなどを直接登録する
    pub async fn insert(&self, resource: Resource) {
        let mut machines = self.machines.lock().await;
        machines.insert(
            resource.id.clone(),
            Machine {
                resource,
                config: MachineConfig::default(),
            },
        );
    }

    pub async fn get(&self, id: &ResourceId) -> Option<Resource> {
        let machines = self.machines.lock().await;
        machines.get(id).map(|m| m.resource.clone())
    }

    pub async fn config_of(&self, id: &ResourceId) -> Option<MachineConfig> {
        let machines = self.machines.lock().await;
        machines.get(id).map(|m| m.config.clone())
    }

    /// 基盤側の都合で状態を変える（idle-stop やクラッシュの再現）
    pub async fn set_state(&self, id: &ResourceId, state: ResourceState) {
        let mut machines = self.machines.lock().await;
        if let Some(machine) = machines.get_mut(id) {
            machine.resource.state = state;
        }
    }

    /// 成功した create の回数
    pub fn created_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// stop の呼び出し回数（失敗も含む）
    pub fn stop_calls(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// destroy の呼び出し回数
    pub fn destroy_calls(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for InMemoryProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provisioner for InMemoryProvisioner {
    async fn create(&self, name: &str, config: &MachineConfig) -> Result<Resource, ProvisionError> {
        if Self::take_failure(&self.failing_creates) {
            return Err(ProvisionError::Unavailable {
                op: "create",
                message: "injected create failure".to_string(),
            });
        }

        let mut machines = self.machines.lock().await;
        let taken = machines
            .values()
            .any(|m| m.resource.name == name && !m.resource.state.is_terminal());
        if taken {
            return Err(ProvisionError::Conflict {
                name: name.to_string(),
            });
        }

        let resource = Resource {
            id: self.ids.generate_resource_id(),
            name: name.to_string(),
            state: ResourceState::Started,
            created_at: self.clock.now(),
        };
        machines.insert(
            resource.id.clone(),
            Machine {
                resource: resource.clone(),
                config: config.clone(),
            },
        );
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(resource)
    }

    async fn list(&self, filter: &ResourceFilter) -> Result<Vec<Resource>, ProvisionError> {
        let machines = self.machines.lock().await;
        let mut resources: Vec<Resource> = machines
            .values()
            .map(|m| m.resource.clone())
            .filter(|r| filter.matches(r))
            .collect();
        resources.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(resources)
    }

    async fn stop(&self, id: &ResourceId) -> Result<(), ProvisionError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_stops) {
            return Err(ProvisionError::Unavailable {
                op: "stop",
                message: "injected stop failure".to_string(),
            });
        }

        let mut machines = self.machines.lock().await;
        let Some(machine) = machines.get_mut(id) else {
            return Err(ProvisionError::NotFound {
                op: "stop",
                resource_id: id.clone(),
            });
        };
        if !machine.resource.state.is_terminal() {
            machine.resource.state = if machine.config.auto_destroy {
                ResourceState::Destroyed
            } else {
                ResourceState::Stopped
            };
        }
        Ok(())
    }

    async fn destroy(&self, id: &ResourceId) -> Result<(), ProvisionError> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        let mut machines = self.machines.lock().await;
        let Some(machine) = machines.get_mut(id) else {
            return Err(ProvisionError::NotFound {
                op: "destroy",
                resource_id: id.clone(),
            });
        };
        machine.resource.state = ResourceState::Destroyed;
        Ok(())
    }
}
