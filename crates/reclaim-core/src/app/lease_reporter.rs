//! LeaseReporter - Worker 側の生存報告と終端報告
//!
//! # フロー
//! 1. `start()`: lease を即時に書き込み、`interval` ごとに TTL 付きで書き直すタスクを起動
//! 2. タスク終了時に `mark_done()` / `mark_error()`:
//!    - **まず更新タスクを止めて、実行中の書き込みが終わるのを待つ**
//!    - lease を削除し、終端 status を長い TTL で書く
//! 3. `close()`: タイマー停止とレジストリハンドルの解放（冪等）
//!
//! 更新タスクを待たずに削除すると、遅れて届いた更新が lease を復活させ、
//! 終わったはずの Worker が次の sweep まで生きているように見える。
//!
//! 更新の失敗は warn ログを出して次の tick で再試行する。TTL > interval なので
//! 1 回の失敗では lease は切れない。

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::app::registry::Registry;
use crate::domain::{IdError, Lease, LeaseError, ResourceId, SessionId, StatusRecord};
use crate::ports::Clock;

/// Heartbeat timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatSettings {
    /// Renewal period.
    pub interval: Duration,
    /// Lease TTL; must exceed `interval` so one missed tick is tolerated.
    pub ttl: Duration,
    /// TTL of the terminal status record.
    pub status_ttl: Duration,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            ttl: Duration::from_secs(30),
            status_ttl: Duration::from_secs(3600),
        }
    }
}

enum Phase {
    /// `start()` 前
    Idle,
    /// 更新タスクが動いている
    Renewing {
        cancel: CancellationToken,
        task: JoinHandle<()>,
    },
    /// 更新タスクは止まっている（終端書き込みの失敗後など）
    Stopped,
}

struct Inner {
    phase: Phase,
    /// `close()` で None になる
    registry: Option<Registry>,
    /// 書き込み済みの終端 status
    terminal: Option<StatusRecord>,
}

/// LeaseReporter は 1 つの Worker（= 1 セッション）に 1 つ
pub struct LeaseReporter {
    session_id: SessionId,
    resource_id: ResourceId,
    settings: HeartbeatSettings,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl LeaseReporter {
    pub fn new(
        registry: Registry,
        clock: Arc<dyn Clock>,
        session_id: SessionId,
        resource_id: ResourceId,
        settings: HeartbeatSettings,
    ) -> Self {
        Self {
            session_id,
            resource_id,
            settings,
            clock,
            inner: Mutex::new(Inner {
                phase: Phase::Idle,
                registry: Some(registry),
                terminal: None,
            }),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// lease を即時に書き、更新タスクを起動する
    ///
    /// 初回の書き込み失敗は呼び出し側に返す（この時点ではまだ何も始まっていない）。
    pub async fn start(&self) -> Result<(), LeaseError> {
        let mut inner = self.inner.lock().await;
        let Some(registry) = inner.registry.clone() else {
            return Err(LeaseError::Closed(self.session_id.clone()));
        };
        if !matches!(inner.phase, Phase::Idle) || inner.terminal.is_some() {
            return Err(LeaseError::AlreadyStarted(self.session_id.clone()));
        }

        let lease = Lease::running(self.resource_id.clone(), self.clock.now());
        registry
            .write_lease(&self.session_id, &lease, self.settings.ttl)
            .await
            .map_err(|source| LeaseError::Registry {
                session_id: self.session_id.clone(),
                source,
            })?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            renew_loop(
                registry,
                self.session_id.clone(),
                lease,
                self.settings.clone(),
                cancel.clone(),
            )
            .instrument(info_span!(
                "lease_reporter",
                session_id = %self.session_id,
                resource_id = %self.resource_id
            )),
        );
        inner.phase = Phase::Renewing { cancel, task };
        info!(
            session_id = %self.session_id,
            resource_id = %self.resource_id,
            interval = ?self.settings.interval,
            "lease reporter started"
        );
        Ok(())
    }

    /// 正常終了を報告する
    pub async fn mark_done(&self) -> Result<StatusRecord, LeaseError> {
        self.retire(StatusRecord::Done).await
    }

    /// 異常終了を報告する
    pub async fn mark_error(&self, message: impl Into<String>) -> Result<StatusRecord, LeaseError> {
        self.retire(StatusRecord::error(message)).await
    }

    async fn retire(&self, status: StatusRecord) -> Result<StatusRecord, LeaseError> {
        let mut inner = self.inner.lock().await;

        // 終端 status は 1 回だけ書く
        if let Some(existing) = &inner.terminal {
            if *existing != status {
                warn!(
                    session_id = %self.session_id,
                    written = existing.as_str(),
                    requested = status.as_str(),
                    "terminal status already written; ignoring"
                );
            }
            return Ok(existing.clone());
        }
        let Some(registry) = inner.registry.clone() else {
            return Err(LeaseError::Closed(self.session_id.clone()));
        };

        stop_renewal(&mut inner.phase).await;

        registry
            .retire(&self.session_id, &status, self.settings.status_ttl)
            .await
            .map_err(|source| LeaseError::Registry {
                session_id: self.session_id.clone(),
                source,
            })?;

        info!(
            session_id = %self.session_id,
            resource_id = %self.resource_id,
            status = status.as_str(),
            "terminal status written"
        );
        inner.terminal = Some(status.clone());
        Ok(status)
    }

    /// タイマーを止めてレジストリハンドルを手放す。何度呼んでもよい。
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        stop_renewal(&mut inner.phase).await;
        if inner.registry.take().is_some() {
            debug!(session_id = %self.session_id, "lease reporter closed");
        }
    }

    /// `task` を lease 付きで実行する
    ///
    /// start → task → mark_done / mark_error → close の順で進み、task の結果を返す。
    pub async fn run<F, T, E>(&self, task: F) -> Result<Result<T, E>, LeaseError>
    where
        F: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.start().await?;
        let outcome = task.await;
        let marked = match &outcome {
            Ok(_) => self.mark_done().await,
            Err(err) => self.mark_error(err.to_string()).await,
        };
        self.close().await;
        marked?;
        Ok(outcome)
    }
}

impl Drop for LeaseReporter {
    fn drop(&mut self) {
        if let Phase::Renewing { cancel, .. } = &self.inner.get_mut().phase {
            cancel.cancel();
        }
    }
}

/// 更新タスクを止め、実行中の書き込みが終わるまで待つ
async fn stop_renewal(phase: &mut Phase) {
    if let Phase::Renewing { cancel, task } = std::mem::replace(phase, Phase::Stopped) {
        cancel.cancel();
        if let Err(err) = task.await
            && err.is_panic()
        {
            warn!(error = %err, "lease renewal task panicked");
        }
    }
}

async fn renew_loop(
    registry: Registry,
    session_id: SessionId,
    lease: Lease,
    settings: HeartbeatSettings,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + settings.interval, settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // started_at は書き換えない（timeout 判定の基準）
        match registry.write_lease(&session_id, &lease, settings.ttl).await {
            Ok(()) => debug!("lease renewed"),
            Err(error) => warn!(%error, "lease renewal failed; retrying on next tick"),
        }
    }
    debug!("lease renewal stopped");
}

/// Worker 環境変数からの自己識別
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub session_id: SessionId,
    pub resource_id: ResourceId,
}

#[derive(Debug, Error)]
pub enum WorkerIdentityError {
    #[error("environment variable {0} is not set")]
    Missing(&'static str),

    #[error(transparent)]
    Invalid(#[from] IdError),
}

impl WorkerIdentity {
    pub const SESSION_VAR: &'static str = "RECLAIM_SESSION_ID";
    pub const RESOURCE_VAR: &'static str = "RECLAIM_RESOURCE_ID";
    /// Fly Machines が注入するマシン ID
    pub const FLY_MACHINE_VAR: &'static str = "FLY_MACHINE_ID";

    pub fn from_env() -> Result<Self, WorkerIdentityError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, WorkerIdentityError> {
        let session = lookup(Self::SESSION_VAR).ok_or(WorkerIdentityError::Missing(Self::SESSION_VAR))?;
        let resource = lookup(Self::RESOURCE_VAR)
            .or_else(|| lookup(Self::FLY_MACHINE_VAR))
            .ok_or(WorkerIdentityError::Missing(Self::RESOURCE_VAR))?;
        Ok(Self {
            session_id: SessionId::new(session)?,
            resource_id: ResourceId::new(resource)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::registry::KeySpace;
    use crate::impls::InMemoryKvStore;
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};

    struct Fixture {
        clock: Arc<FixedClock>,
        store: Arc<InMemoryKvStore>,
        registry: Registry,
        reporter: LeaseReporter,
    }

    fn fixture() -> Fixture {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(t0));
        let store = Arc::new(InMemoryKvStore::with_clock(clock.clone()));
        let registry = Registry::new(store.clone(), KeySpace::default());
        let reporter = LeaseReporter::new(
            registry.clone(),
            clock.clone(),
            SessionId::new("s1").unwrap(),
            ResourceId::new("m-1").unwrap(),
            HeartbeatSettings::default(),
        );
        Fixture {
            clock,
            store,
            registry,
            reporter,
        }
    }

    fn session() -> SessionId {
        SessionId::new("s1").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn start_writes_lease_immediately() {
        let f = fixture();
        f.reporter.start().await.unwrap();

        let lease = f.registry.read_lease(&session()).await.unwrap().unwrap();
        assert_eq!(lease.resource_id.as_str(), "m-1");
        assert_eq!(lease.started_at, f.clock.now());
        assert_eq!(f.store.write_count(), 1);
        assert_eq!(
            f.store.ttl("agent:heartbeat:s1").await,
            Some(Duration::from_secs(30))
        );
        f.reporter.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn renews_every_interval_and_keeps_start_time() {
        let f = fixture();
        let started = f.clock.now();
        f.reporter.start().await.unwrap();

        for _ in 0..3 {
            f.clock.advance(Duration::from_secs(10));
            tokio::time::sleep(Duration::from_millis(10_001)).await;
        }

        // 初回 + 3 回の更新。TTL 30s を 3 回分またいでも lease は残っている
        assert_eq!(f.store.write_count(), 4);
        let lease = f.registry.read_lease(&session()).await.unwrap().unwrap();
        assert_eq!(lease.started_at, started);
        f.reporter.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_renewal_is_retried_on_next_tick() {
        let f = fixture();
        f.reporter.start().await.unwrap();
        f.store.fail_next_writes(1);

        tokio::time::sleep(Duration::from_secs(25)).await;

        assert_eq!(f.store.write_count(), 2);
        assert!(f.registry.read_lease(&session()).await.unwrap().is_some());
        f.reporter.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn silence_after_crash_expires_lease() {
        let f = fixture();
        f.reporter.start().await.unwrap();
        // プロセスが落ちた相当: 更新タスクだけ消える
        drop(f.reporter);

        tokio::time::sleep(Duration::from_secs(60)).await;
        f.clock.advance(Duration::from_secs(31));
        assert_eq!(f.registry.read_lease(&session()).await.unwrap(), None);
        assert_eq!(f.store.write_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn mark_done_stops_renewal_and_writes_status() {
        let f = fixture();
        f.reporter.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let status = f.reporter.mark_done().await.unwrap();
        assert_eq!(status, StatusRecord::Done);
        let writes = f.store.write_count();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.store.write_count(), writes);
        assert_eq!(f.registry.read_lease(&session()).await.unwrap(), None);
        assert_eq!(
            f.registry.read_status(&session()).await.unwrap(),
            Some(StatusRecord::Done)
        );
        assert_eq!(
            f.store.ttl("agent:status:s1").await,
            Some(Duration::from_secs(3600))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_renewal_cannot_resurrect_lease() {
        let f = fixture();
        f.reporter.start().await.unwrap();

        // 次の更新（t=10s）が 5s かかる
        f.store.set_write_delay(Some(Duration::from_secs(5)));
        tokio::time::sleep(Duration::from_secs(12)).await;
        f.store.set_write_delay(None);

        // 更新が in-flight のまま終端処理に入る
        f.reporter.mark_done().await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(f.registry.read_lease(&session()).await.unwrap(), None);
        assert_eq!(
            f.registry.read_status(&session()).await.unwrap(),
            Some(StatusRecord::Done)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn mark_done_twice_is_idempotent() {
        let f = fixture();
        f.reporter.start().await.unwrap();
        f.reporter.mark_done().await.unwrap();
        let writes = f.store.write_count();

        let again = f.reporter.mark_done().await.unwrap();
        assert_eq!(again, StatusRecord::Done);
        assert_eq!(f.store.write_count(), writes);

        // 別の終端を要求しても最初の結果が残る
        let other = f.reporter.mark_error("late").await.unwrap();
        assert_eq!(other, StatusRecord::Done);
        assert_eq!(f.store.write_count(), writes);
    }

    #[tokio::test(start_paused = true)]
    async fn mark_error_records_message() {
        let f = fixture();
        f.reporter.start().await.unwrap();
        f.reporter.mark_error("model call failed").await.unwrap();

        assert_eq!(
            f.registry.read_status(&session()).await.unwrap(),
            Some(StatusRecord::error("model call failed"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_terminal_write_can_be_retried() {
        let f = fixture();
        f.reporter.start().await.unwrap();
        f.store.fail_next_writes(1);

        assert!(matches!(
            f.reporter.mark_done().await,
            Err(LeaseError::Registry { .. })
        ));
        f.reporter.mark_done().await.unwrap();
        assert_eq!(
            f.registry.read_status(&session()).await.unwrap(),
            Some(StatusRecord::Done)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent_and_final() {
        let f = fixture();
        f.reporter.start().await.unwrap();
        f.reporter.mark_done().await.unwrap();
        f.reporter.close().await;
        f.reporter.close().await;

        // 書き込み済みの終端は close 後も返せる
        assert_eq!(f.reporter.mark_done().await.unwrap(), StatusRecord::Done);
        assert!(matches!(
            f.reporter.start().await,
            Err(LeaseError::Closed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_write_after_close_fails() {
        let f = fixture();
        f.reporter.start().await.unwrap();
        f.reporter.close().await;
        assert!(matches!(
            f.reporter.mark_error("x").await,
            Err(LeaseError::Closed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn start_twice_is_rejected() {
        let f = fixture();
        f.reporter.start().await.unwrap();
        assert!(matches!(
            f.reporter.start().await,
            Err(LeaseError::AlreadyStarted(_))
        ));
        f.reporter.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn run_maps_task_result_to_status() {
        let f = fixture();
        let outcome = f
            .reporter
            .run(async { Err::<(), _>("rate limited by upstream") })
            .await
            .unwrap();

        assert!(outcome.is_err());
        assert_eq!(
            f.registry.read_status(&session()).await.unwrap(),
            Some(StatusRecord::error("rate limited by upstream"))
        );
        assert_eq!(f.registry.read_lease(&session()).await.unwrap(), None);
    }

    #[test]
    fn identity_falls_back_to_platform_machine_id() {
        let identity = WorkerIdentity::from_lookup(|var| match var {
            "RECLAIM_SESSION_ID" => Some("s1".to_string()),
            "FLY_MACHINE_ID" => Some("e784079b".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(identity.resource_id.as_str(), "e784079b");

        let missing = WorkerIdentity::from_lookup(|_| None).unwrap_err();
        assert!(matches!(missing, WorkerIdentityError::Missing("RECLAIM_SESSION_ID")));
    }
}
