//! SessionOrchestrator - 呼び出し側から見たセッション操作
//!
//! # 重複排除
//! リソース名は `session-<id>` で決まる。同時に 2 つの呼び出しが mapping なしを観測しても、
//! Provisioner 側で同名の live リソースは 1 つしか作れない（`Conflict`）。
//! 負けた側は勝った側のリソースを採用し、同じ mapping を書く。ロックは使わない。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::app::registry::Registry;
use crate::domain::{
    MachineConfig, ProvisionError, Resource, ResourceFilter, ResourceId, ResourceMapping, Session,
    SessionError, SessionId, StatusRecord, resource_name,
};
use crate::ports::Provisioner;

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// `max_turn_timeout + grace`
    pub mapping_ttl: Duration,
    /// Base create-time config; per-session params are merged on top.
    pub machine: MachineConfig,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            mapping_ttl: Duration::from_secs(660),
            machine: MachineConfig::default(),
        }
    }
}

/// Per-session create parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionParams {
    pub image: Option<String>,
    pub env: HashMap<String, String>,
    pub metadata: HashMap<String, String>,
}

/// Backoff for completion polling.
///
/// delay(n) = initial * multiplier^n, capped at `cap`.
#[derive(Debug, Clone, PartialEq)]
pub struct PollBackoff {
    pub initial: Duration,
    pub multiplier: f64,
    pub cap: Duration,
}

impl PollBackoff {
    /// 固定間隔
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial: interval,
            multiplier: 1.0,
            cap: interval,
        }
    }

    /// `attempt` 回目（0 始まり）の待ち時間
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        if !secs.is_finite() || secs >= self.cap.as_secs_f64() {
            return self.cap;
        }
        Duration::from_secs_f64(secs)
    }
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            multiplier: 2.0,
            cap: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WaitOptions {
    /// 期限。これを過ぎたら `SessionError::Timeout`
    pub timeout: Duration,
    pub backoff: PollBackoff,
}

impl WaitOptions {
    pub fn within(timeout: Duration) -> Self {
        Self {
            timeout,
            backoff: PollBackoff::default(),
        }
    }
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self::within(Duration::from_secs(600))
    }
}

/// SessionOrchestrator はセッションの作成・待機・破棄を行う
pub struct SessionOrchestrator {
    registry: Registry,
    provisioner: Arc<dyn Provisioner>,
    settings: OrchestratorSettings,
}

impl SessionOrchestrator {
    pub fn new(
        registry: Registry,
        provisioner: Arc<dyn Provisioner>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            registry,
            provisioner,
            settings,
        }
    }

    /// mapping があればそのまま返し、なければリソースを用意して mapping を書く
    pub async fn get_or_create_session(
        &self,
        session_id: &SessionId,
        params: SessionParams,
    ) -> Result<ResourceMapping, SessionError> {
        if let Some(mapping) = self
            .registry
            .read_mapping(session_id)
            .await
            .map_err(|source| registry_error(session_id, source))?
        {
            debug!(%session_id, resource_id = %mapping.resource_id, "reusing existing session");
            return Ok(mapping);
        }

        let name = resource_name(session_id);
        let config = self.machine_config(session_id, params);
        let resource = match self.provisioner.create(&name, &config).await {
            Ok(resource) => {
                info!(%session_id, resource_id = %resource.id, "resource created");
                resource
            }
            Err(ProvisionError::Conflict { .. }) => {
                let resource = self.adopt(session_id, &name).await?;
                debug!(%session_id, resource_id = %resource.id, "adopted concurrently created resource");
                resource
            }
            Err(source) => {
                warn!(%session_id, error = %source, "resource create failed");
                return Err(provision_error(session_id, source));
            }
        };

        // 作成時刻はリソース側の値を使うので、同時に書いた mapping はすべて同じ内容になる
        let mapping = ResourceMapping {
            session_id: session_id.clone(),
            resource_id: resource.id,
            created_at: resource.created_at,
        };
        self.registry
            .write_mapping(&mapping, self.settings.mapping_ttl)
            .await
            .map_err(|source| registry_error(session_id, source))?;
        Ok(mapping)
    }

    async fn adopt(&self, session_id: &SessionId, name: &str) -> Result<Resource, SessionError> {
        let live = self
            .provisioner
            .list(&ResourceFilter::live_named(name))
            .await
            .map_err(|source| provision_error(session_id, source))?;
        live.into_iter().next().ok_or_else(|| {
            provision_error(
                session_id,
                ProvisionError::Conflict {
                    name: name.to_string(),
                },
            )
        })
    }

    fn machine_config(&self, session_id: &SessionId, params: SessionParams) -> MachineConfig {
        let mut config = self.settings.machine.clone();
        if params.image.is_some() {
            config.image = params.image;
        }
        config.env.extend(params.env);
        config.metadata.extend(params.metadata);
        config
            .env
            .insert("RECLAIM_SESSION_ID".to_string(), session_id.to_string());
        config
            .metadata
            .insert("session_id".to_string(), session_id.to_string());
        config
    }

    /// 終端 status が現れるまで待つ
    ///
    /// 「まだ終わっていない」（mapping か lease が残っている）は待ち続ける。
    /// 3 つのレコードがどれもなければ、未知か回収済みなので `NotFound` を返す。
    /// レジストリのエラーはそのまま返す。
    pub async fn wait_for_session(
        &self,
        session_id: &SessionId,
        options: WaitOptions,
    ) -> Result<StatusRecord, SessionError> {
        let poll = async {
            let mut attempt = 0u32;
            loop {
                let status = self
                    .registry
                    .read_status(session_id)
                    .await
                    .map_err(|source| registry_error(session_id, source))?;
                if let Some(status) = status {
                    return Ok(status);
                }
                let (mapping, lease) = tokio::try_join!(
                    self.registry.read_mapping(session_id),
                    self.registry.read_lease(session_id),
                )
                .map_err(|source| registry_error(session_id, source))?;
                if mapping.is_none() && lease.is_none() {
                    return Err(SessionError::NotFound(session_id.clone()));
                }
                tokio::time::sleep(options.backoff.delay(attempt)).await;
                attempt = attempt.saturating_add(1);
            }
        };

        match tokio::time::timeout(options.timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout {
                session_id: session_id.clone(),
                waited: options.timeout,
            }),
        }
    }

    /// リソースを破棄してキーを消す。未知・破棄済みのセッションは何もしない。
    pub async fn destroy_session(&self, session_id: &SessionId) -> Result<(), SessionError> {
        let mapping = self
            .registry
            .read_mapping(session_id)
            .await
            .map_err(|source| registry_error(session_id, source))?;

        let targets: Vec<ResourceId> = match mapping {
            Some(mapping) => vec![mapping.resource_id],
            None => self
                .provisioner
                .list(&ResourceFilter::live_named(resource_name(session_id)))
                .await
                .map_err(|source| provision_error(session_id, source))?
                .into_iter()
                .map(|resource| resource.id)
                .collect(),
        };

        for resource_id in &targets {
            match self.provisioner.destroy(resource_id).await {
                Ok(()) => info!(%session_id, %resource_id, "resource destroyed"),
                Err(error) if error.is_not_found() => {
                    debug!(%session_id, %resource_id, "resource already gone")
                }
                Err(source) => return Err(provision_error(session_id, source)),
            }
        }

        self.registry
            .clear_session(session_id)
            .await
            .map_err(|source| registry_error(session_id, source))?;
        Ok(())
    }

    /// レジストリから見たセッションの状態
    pub async fn session(&self, session_id: &SessionId) -> Result<Session, SessionError> {
        let (mapping, lease, status) = tokio::try_join!(
            self.registry.read_mapping(session_id),
            self.registry.read_lease(session_id),
            self.registry.read_status(session_id),
        )
        .map_err(|source| registry_error(session_id, source))?;

        Session::from_records(session_id.clone(), mapping, lease, status)
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))
    }
}

fn registry_error(session_id: &SessionId, source: crate::domain::RegistryError) -> SessionError {
    SessionError::Registry {
        session_id: session_id.clone(),
        source,
    }
}

fn provision_error(session_id: &SessionId, source: ProvisionError) -> SessionError {
    SessionError::Provision {
        session_id: session_id.clone(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::registry::KeySpace;
    use crate::domain::{Lease, ResourceState, SessionStatus};
    use crate::impls::{InMemoryKvStore, InMemoryProvisioner};
    use crate::ports::{Clock, FixedClock};
    use chrono::{TimeZone, Utc};
    use futures_util::future::join_all;
    use rstest::rstest;

    struct Fixture {
        clock: Arc<FixedClock>,
        store: Arc<InMemoryKvStore>,
        provisioner: Arc<InMemoryProvisioner>,
        registry: Registry,
        orchestrator: Arc<SessionOrchestrator>,
    }

    fn fixture() -> Fixture {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(t0));
        let store = Arc::new(InMemoryKvStore::with_clock(clock.clone()));
        let provisioner = Arc::new(InMemoryProvisioner::with_clock(clock.clone()));
        let registry = Registry::new(store.clone(), KeySpace::default());
        let orchestrator = Arc::new(SessionOrchestrator::new(
            registry.clone(),
            provisioner.clone(),
            OrchestratorSettings::default(),
        ));
        Fixture {
            clock,
            store,
            provisioner,
            registry,
            orchestrator,
        }
    }

    fn sid(raw: &str) -> SessionId {
        SessionId::new(raw).unwrap()
    }

    #[tokio::test]
    async fn creates_resource_and_mapping() {
        let f = fixture();
        let params = SessionParams {
            env: HashMap::from([("MODEL".to_string(), "large".to_string())]),
            ..SessionParams::default()
        };
        let mapping = f
            .orchestrator
            .get_or_create_session(&sid("s1"), params)
            .await
            .unwrap();

        assert_eq!(mapping.session_id, sid("s1"));
        let resource = f.provisioner.get(&mapping.resource_id).await.unwrap();
        assert_eq!(resource.name, "session-s1");
        assert_eq!(mapping.created_at, resource.created_at);

        let config = f.provisioner.config_of(&mapping.resource_id).await.unwrap();
        assert_eq!(config.env.get("MODEL").map(String::as_str), Some("large"));
        assert_eq!(config.env.get("RECLAIM_SESSION_ID").map(String::as_str), Some("s1"));
        assert_eq!(config.metadata.get("session_id").map(String::as_str), Some("s1"));
        assert_eq!(
            f.store.ttl("agent:resource:s1").await,
            Some(Duration::from_secs(660))
        );
    }

    #[tokio::test]
    async fn existing_mapping_is_returned_unchanged() {
        let f = fixture();
        let first = f
            .orchestrator
            .get_or_create_session(&sid("s1"), SessionParams::default())
            .await
            .unwrap();
        f.clock.advance(Duration::from_secs(5));
        let second = f
            .orchestrator
            .get_or_create_session(&sid("s1"), SessionParams::default())
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(f.provisioner.created_count(), 1);
    }

    #[rstest]
    #[case(2)]
    #[case(8)]
    #[case(32)]
    #[tokio::test]
    async fn concurrent_callers_share_one_resource(#[case] callers: usize) {
        let f = fixture();
        let calls = (0..callers).map(|_| {
            let orchestrator = f.orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .get_or_create_session(&sid("s1"), SessionParams::default())
                    .await
            })
        });
        let mappings: Vec<ResourceMapping> = join_all(calls)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(f.provisioner.created_count(), 1);
        assert!(mappings.iter().all(|m| *m == mappings[0]));
        assert_eq!(
            f.registry.read_mapping(&sid("s1")).await.unwrap(),
            Some(mappings[0].clone())
        );
    }

    #[tokio::test]
    async fn create_failure_surfaces_without_mapping() {
        let f = fixture();
        f.provisioner.fail_next_creates(1);

        let err = f
            .orchestrator
            .get_or_create_session(&sid("s1"), SessionParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Provision { .. }));
        assert!(err.is_retryable());
        assert_eq!(f.registry.read_mapping(&sid("s1")).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_terminal_status() {
        let f = fixture();
        f.orchestrator
            .get_or_create_session(&sid("s1"), SessionParams::default())
            .await
            .unwrap();
        let registry = f.registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            registry
                .write_status(&sid("s1"), &StatusRecord::error("oom"), Duration::from_secs(3600))
                .await
                .unwrap();
        });

        let status = f
            .orchestrator
            .wait_for_session(&sid("s1"), WaitOptions::within(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(status, StatusRecord::error("oom"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_gives_up_at_deadline() {
        let f = fixture();
        f.orchestrator
            .get_or_create_session(&sid("s1"), SessionParams::default())
            .await
            .unwrap();
        let started = tokio::time::Instant::now();

        let err = f
            .orchestrator
            .wait_for_session(&sid("s1"), WaitOptions::within(Duration::from_secs(5)))
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Timeout { waited, .. } if waited == Duration::from_secs(5)));
        assert!(!err.is_retryable());
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_on_unknown_session_is_not_found() {
        let f = fixture();
        let started = tokio::time::Instant::now();

        let err = f
            .orchestrator
            .wait_for_session(&sid("ghost"), WaitOptions::within(Duration::from_secs(60)))
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::NotFound(id) if id == sid("ghost")));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_on_reclaimed_session_is_not_found() {
        let f = fixture();
        let s1 = sid("s1");
        f.orchestrator
            .get_or_create_session(&s1, SessionParams::default())
            .await
            .unwrap();
        f.registry
            .retire(&s1, &StatusRecord::Done, Duration::from_secs(3600))
            .await
            .unwrap();
        // Reaper が task_done として回収し、キーを消した後
        f.registry.clear_session(&s1).await.unwrap();

        let started = tokio::time::Instant::now();
        let err = f
            .orchestrator
            .wait_for_session(&s1, WaitOptions::within(Duration::from_secs(60)))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_keeps_polling_while_worker_heartbeats() {
        let f = fixture();
        let s1 = sid("s1");
        let registry = f.registry.clone();
        let lease = Lease::running(ResourceId::new("m-1").unwrap(), f.clock.now());
        registry
            .write_lease(&s1, &lease, Duration::from_secs(30))
            .await
            .unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            registry
                .retire(&sid("s1"), &StatusRecord::Done, Duration::from_secs(3600))
                .await
                .unwrap();
        });

        let status = f
            .orchestrator
            .wait_for_session(&s1, WaitOptions::within(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(status, StatusRecord::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_surfaces_registry_outage() {
        let f = fixture();
        f.store.set_available(false);
        let err = f
            .orchestrator
            .wait_for_session(&sid("s1"), WaitOptions::within(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Registry { .. }));
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let f = fixture();
        let mapping = f
            .orchestrator
            .get_or_create_session(&sid("s1"), SessionParams::default())
            .await
            .unwrap();

        f.orchestrator.destroy_session(&sid("s1")).await.unwrap();
        assert_eq!(
            f.provisioner.get(&mapping.resource_id).await.unwrap().state,
            ResourceState::Destroyed
        );
        assert!(f.store.keys().await.is_empty());

        f.orchestrator.destroy_session(&sid("s1")).await.unwrap();
        f.orchestrator.destroy_session(&sid("never-seen")).await.unwrap();
        assert_eq!(f.provisioner.destroy_calls(), 1);
    }

    #[tokio::test]
    async fn destroy_without_mapping_finds_resource_by_name() {
        let f = fixture();
        let resource = f
            .provisioner
            .create("session-s1", &MachineConfig::default())
            .await
            .unwrap();

        f.orchestrator.destroy_session(&sid("s1")).await.unwrap();
        assert_eq!(
            f.provisioner.get(&resource.id).await.unwrap().state,
            ResourceState::Destroyed
        );
    }

    #[tokio::test]
    async fn session_view_follows_registry() {
        let f = fixture();
        let s1 = sid("s1");
        assert!(matches!(
            f.orchestrator.session(&s1).await,
            Err(SessionError::NotFound(_))
        ));

        let mapping = f
            .orchestrator
            .get_or_create_session(&s1, SessionParams::default())
            .await
            .unwrap();
        assert_eq!(
            f.orchestrator.session(&s1).await.unwrap().status,
            SessionStatus::Pending
        );

        f.registry
            .write_lease(
                &s1,
                &Lease::running(mapping.resource_id.clone(), f.clock.now()),
                Duration::from_secs(30),
            )
            .await
            .unwrap();
        assert_eq!(
            f.orchestrator.session(&s1).await.unwrap().status,
            SessionStatus::Running
        );

        f.registry
            .retire(&s1, &StatusRecord::Done, Duration::from_secs(3600))
            .await
            .unwrap();
        let session = f.orchestrator.session(&s1).await.unwrap();
        assert_eq!(session.status, SessionStatus::Done);
        assert_eq!(session.resource_id, Some(mapping.resource_id));
    }

    #[rstest]
    #[case(0, 250)]
    #[case(1, 500)]
    #[case(3, 2000)]
    #[case(5, 5000)]
    #[case(40, 5000)]
    fn backoff_grows_to_cap(#[case] attempt: u32, #[case] millis: u64) {
        assert_eq!(
            PollBackoff::default().delay(attempt),
            Duration::from_millis(millis)
        );
    }

    #[test]
    fn fixed_backoff_never_changes() {
        let backoff = PollBackoff::fixed(Duration::from_secs(1));
        assert_eq!(backoff.delay(0), backoff.delay(100));
    }
}
