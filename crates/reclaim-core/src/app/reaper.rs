//! Reaper - リソース回収ループ
//!
//! # 1 回の sweep
//! 1. Provisioner から live なリソースを列挙（失敗したら sweep 全体が失敗、次回に再試行）
//! 2. 名前が `session-<id>` でないものは無視
//! 3. 各セッションの status / lease を並行に読み、[`evaluate`] で判定
//!    （lease がなくても作成から `heartbeat_ttl` 以内なら起動中とみなして残す）
//! 4. 回収対象は stop（`explicit_destroy` なら続けて destroy）し、レジストリのキーを消す
//!
//! stop が失敗してもキーは消す。以降の sweep では status も lease もないので
//! 起動猶予を過ぎたリソースは `heartbeat_lost` として拾い直され、stop が再試行される。
//!
//! 健全なセッションしかない sweep はレジストリに何も書かない（読み取りのみ）。

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::app::registry::Registry;
use crate::domain::{
    Limits, ProvisionError, ReclaimReason, RegistryError, Resource, ResourceFilter, ResourceId,
    SessionId, evaluate,
};
use crate::ports::{Clock, Provisioner};

/// Sweep timing and stop behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaperSettings {
    pub interval: Duration,
    /// Boot window: a resource without a lease is spared until it is this old.
    pub heartbeat_ttl: Duration,
    /// Wall-clock budget measured from `Lease::started_at`.
    pub max_turn_timeout: Duration,
    pub explicit_destroy: bool,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            heartbeat_ttl: Duration::from_secs(30),
            max_turn_timeout: Duration::from_secs(600),
            explicit_destroy: false,
        }
    }
}

/// 回収した 1 リソース
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reclamation {
    pub session_id: SessionId,
    pub resource_id: ResourceId,
    pub reason: ReclaimReason,
    /// stop が成功した（または既に存在しなかった）か
    pub stopped: bool,
}

/// sweep の結果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// 評価したセッションリソースの数
    pub examined: usize,
    /// 命名規約に合わず無視したリソースの数
    pub ignored: usize,
    pub reclaimed: Vec<Reclamation>,
    pub stop_failures: usize,
    /// レジストリが読めず判定を見送った数
    pub read_failures: usize,
}

/// Reaper は回収ループの本体
#[derive(Clone)]
pub struct Reaper {
    registry: Registry,
    provisioner: Arc<dyn Provisioner>,
    clock: Arc<dyn Clock>,
    settings: ReaperSettings,
}

impl Reaper {
    pub fn new(
        registry: Registry,
        provisioner: Arc<dyn Provisioner>,
        clock: Arc<dyn Clock>,
        settings: ReaperSettings,
    ) -> Self {
        Self {
            registry,
            provisioner,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &ReaperSettings {
        &self.settings
    }

    /// 1 回分の sweep
    pub async fn sweep(&self) -> Result<SweepReport, ProvisionError> {
        let resources = self.provisioner.list(&ResourceFilter::live()).await?;

        let mut report = SweepReport::default();
        let mut candidates = Vec::with_capacity(resources.len());
        for resource in resources {
            match resource.session_id() {
                Some(session_id) => candidates.push((session_id, resource)),
                None => report.ignored += 1,
            }
        }
        report.examined = candidates.len();

        // 全セッションで同じ時刻を基準にする
        let now = self.clock.now();
        let limits = Limits {
            heartbeat_ttl: self.settings.heartbeat_ttl,
            max_turn_timeout: self.settings.max_turn_timeout,
        };
        let verdicts = join_all(candidates.iter().map(|(session_id, resource)| async move {
            let (status, lease) = tokio::try_join!(
                self.registry.read_status(session_id),
                self.registry.read_lease(session_id),
            )?;
            Ok::<_, RegistryError>(evaluate(
                status.as_ref(),
                lease.as_ref(),
                resource.created_at,
                now,
                limits,
            ))
        }))
        .await;

        let mut doomed = Vec::new();
        for ((session_id, resource), verdict) in candidates.into_iter().zip(verdicts) {
            match verdict {
                Ok(Some(reason)) => doomed.push((session_id, resource, reason)),
                Ok(None) => {}
                Err(error) => {
                    warn!(%session_id, resource_id = %resource.id, %error, "registry read failed; skipping");
                    report.read_failures += 1;
                }
            }
        }

        let reclaimed = join_all(
            doomed
                .into_iter()
                .map(|(session_id, resource, reason)| self.reclaim(session_id, resource, reason)),
        )
        .await;
        report.stop_failures = reclaimed.iter().filter(|r| !r.stopped).count();
        report.reclaimed = reclaimed;
        Ok(report)
    }

    async fn reclaim(
        &self,
        session_id: SessionId,
        resource: Resource,
        reason: ReclaimReason,
    ) -> Reclamation {
        info!(%session_id, resource_id = %resource.id, %reason, "reclaiming resource");

        let stopped = match self.provisioner.stop(&resource.id).await {
            Ok(()) => true,
            Err(error) if error.is_not_found() => true,
            Err(error) => {
                warn!(%session_id, resource_id = %resource.id, %error, "stop failed; retrying next sweep");
                false
            }
        };

        if stopped && self.settings.explicit_destroy {
            match self.provisioner.destroy(&resource.id).await {
                Ok(()) => {}
                Err(error) if error.is_not_found() => {}
                Err(error) => {
                    warn!(%session_id, resource_id = %resource.id, %error, "destroy failed")
                }
            }
        }

        // stop の成否に関係なく消す
        if let Err(error) = self.registry.clear_session(&session_id).await {
            warn!(%session_id, %error, "failed to clear registry keys");
        }

        Reclamation {
            session_id,
            resource_id: resource.id,
            reason,
            stopped,
        }
    }

    /// 定期 sweep をバックグラウンドで開始する
    ///
    /// sweep の後に `interval` だけ待つ（固定周期ではない）ので、遅い sweep が重なることはない。
    /// キャンセルは待機中にだけ効き、実行中の sweep は最後まで進む。
    pub fn spawn(self, cancel: CancellationToken) -> ReaperHandle {
        let token = cancel.clone();
        let task = tokio::spawn(self.run(token).instrument(info_span!("reaper")));
        ReaperHandle { cancel, task }
    }

    async fn run(self, cancel: CancellationToken) {
        info!(interval = ?self.settings.interval, "reaper started");
        loop {
            match self.sweep().await {
                Ok(report) if report.reclaimed.is_empty() => {
                    debug!(examined = report.examined, "sweep finished; nothing to reclaim")
                }
                Ok(report) => info!(
                    examined = report.examined,
                    reclaimed = report.reclaimed.len(),
                    stop_failures = report.stop_failures,
                    "sweep finished"
                ),
                Err(error) => warn!(%error, "sweep failed; retrying next interval"),
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.settings.interval) => {}
            }
        }
        info!("reaper stopped");
    }
}

/// 実行中の Reaper ループ
pub struct ReaperHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// ループを止めて終了を待つ
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await
            && err.is_panic()
        {
            warn!(error = %err, "reaper task panicked");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
