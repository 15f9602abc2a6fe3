//! `reclaim` - worker recycling control plane (demo binary).
//!
//! サブコマンド:
//! - `demo`: in-memory のストアと Provisioner で Reaper / Orchestrator / Worker を動かす
//! - `check-config`: 設定を読み込み、検証して表示する

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};
use tracing_subscriber::{EnvFilter, fmt};

use reclaim_core::app::{
    BuildError, ControlPlane, ControlPlaneBuilder, LeaseReporter, SessionParams, WaitOptions,
};
use reclaim_core::config::{ConfigError, ReclaimConfig};
use reclaim_core::domain::{LeaseError, ResourceFilter, ResourceId, SessionError, SessionId};
use reclaim_core::impls::{InMemoryKvStore, InMemoryProvisioner};
use reclaim_core::ports::{IdGenerator, Provisioner, SystemClock, UlidGenerator};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error("failed to init tracing: {0}")]
    Tracing(String),

    #[error("failed to build tokio runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "reclaim", about = "Dual-layer recycling of short-lived workers", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a self-contained simulation against in-memory adapters.
    Demo {
        /// Number of simulated sessions (cycles through done / crash / hang).
        #[arg(long, default_value_t = 3)]
        sessions: usize,

        /// Keep the configured timings instead of compressing them to seconds.
        #[arg(long)]
        real_timings: bool,
    },
    /// Load, validate and print the effective configuration.
    CheckConfig,
}

fn main() -> Result<(), CliError> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<(), CliError> {
    let config = ReclaimConfig::load(args.config.as_deref())?;
    match args.command {
        Command::CheckConfig => {
            let mut shown = config.clone();
            if shown.provisioner.api_token.is_some() {
                shown.provisioner.api_token = Some("<redacted>".to_string());
            }
            println!("{shown:#?}");
            Ok(())
        }
        Command::Demo {
            sessions,
            real_timings,
        } => {
            let config = if real_timings {
                config
            } else {
                compressed(config)
            };
            demo(config, sessions).await
        }
    }
}

/// デモ用に時間を縮める
fn compressed(config: ReclaimConfig) -> ReclaimConfig {
    ReclaimConfig {
        heartbeat_interval_seconds: 1,
        heartbeat_ttl_seconds: 3,
        reaper_interval_seconds: 2,
        max_turn_timeout_seconds: 8,
        ..config
    }
}

#[derive(Debug, Clone, Copy)]
enum Behaviour {
    /// 仕事を終えて mark_done
    Finish,
    /// heartbeat の途中でプロセスが落ちる
    Crash,
    /// heartbeat は続けるが終わらない
    Hang,
}

async fn demo(config: ReclaimConfig, sessions: usize) -> Result<(), CliError> {
    if config.registry.url.is_some() {
        warn!("registry.url is set but this binary only ships the in-memory store");
    }

    let provisioner = Arc::new(InMemoryProvisioner::new());
    let plane = Arc::new(
        ControlPlaneBuilder::new(config)
            .store(Arc::new(InMemoryKvStore::new()))
            .provisioner(provisioner.clone())
            .build()?,
    );

    let cancel = CancellationToken::new();
    let reaper = plane.reaper.clone().spawn(cancel.clone());

    let ids = UlidGenerator::new(SystemClock);
    let behaviours = [Behaviour::Finish, Behaviour::Crash, Behaviour::Hang];
    let mut launched = Vec::with_capacity(sessions);
    for n in 0..sessions {
        let session_id = ids.generate_session_id();
        let behaviour = behaviours[n % behaviours.len()];
        let mapping = plane
            .orchestrator
            .get_or_create_session(&session_id, SessionParams::default())
            .await?;
        info!(%session_id, resource_id = %mapping.resource_id, ?behaviour, "session created");

        let reporter = plane.lease_reporter(session_id.clone(), mapping.resource_id.clone());
        tokio::spawn(
            machine(provisioner.clone(), mapping.resource_id, reporter, behaviour)
                .instrument(info_span!("worker", %session_id)),
        );
        launched.push((session_id, behaviour));
    }

    // 同じセッションを再要求しても新しいリソースは作られない
    if let Some((first, _)) = launched.first() {
        plane
            .orchestrator
            .get_or_create_session(first, SessionParams::default())
            .await?;
        info!(created = provisioner.created_count(), "duplicate request deduplicated");
    }

    for (session_id, behaviour) in &launched {
        if matches!(behaviour, Behaviour::Finish) {
            let options = WaitOptions::within(Duration::from_secs(10));
            match plane.orchestrator.wait_for_session(session_id, options).await {
                Ok(status) => info!(%session_id, status = status.as_str(), "session finished"),
                Err(SessionError::NotFound(_)) => info!(%session_id, "session already reclaimed"),
                Err(err) => warn!(%err, "no terminal status observed"),
            }
        }
    }

    let drained = wait_until_drained(&plane, provisioner.as_ref(), cancel.clone());
    tokio::select! {
        () = drained => info!("all sessions reclaimed"),
        () = shutdown_signal() => info!("shutdown signal received"),
    }

    cancel.cancel();
    reaper.shutdown().await;

    for (session_id, _) in &launched {
        plane.orchestrator.destroy_session(session_id).await?;
    }
    info!(
        created = provisioner.created_count(),
        stops = provisioner.stop_calls(),
        "demo finished"
    );
    Ok(())
}

/// live なリソースがなくなるまで待つ
async fn wait_until_drained(
    plane: &ControlPlane,
    provisioner: &InMemoryProvisioner,
    cancel: CancellationToken,
) {
    let poll = plane.config.reaper_interval() / 2;
    loop {
        match provisioner.list(&ResourceFilter::live()).await {
            Ok(live) if live.is_empty() => return,
            Ok(live) => info!(live = live.len(), "waiting for reaper"),
            Err(err) => error!(%err, "list failed"),
        }
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(poll) => {}
        }
    }
}

/// 1 台の Worker マシン。リソースが止まったらプロセスも終わる。
async fn machine(
    provisioner: Arc<InMemoryProvisioner>,
    resource_id: ResourceId,
    reporter: LeaseReporter,
    behaviour: Behaviour,
) {
    tokio::select! {
        result = work(&reporter, behaviour) => {
            if let Err(err) = result {
                error!(%err, "worker failed");
            }
        }
        () = stopped(&provisioner, &resource_id) => info!("machine stopped by platform"),
    }
    // Drop が更新タスクを止める（Crash ではこれがプロセス終了の代わり）
    drop(reporter);
}

async fn work(reporter: &LeaseReporter, behaviour: Behaviour) -> Result<(), LeaseError> {
    let session_id: &SessionId = reporter.session_id();
    match behaviour {
        Behaviour::Finish => {
            let outcome = reporter
                .run(async {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    Ok::<_, std::convert::Infallible>(())
                })
                .await?;
            info!(%session_id, ok = outcome.is_ok(), "turn complete");
        }
        Behaviour::Crash => {
            reporter.start().await?;
            tokio::time::sleep(Duration::from_secs(2)).await;
            warn!(%session_id, "simulated crash");
        }
        Behaviour::Hang => {
            reporter.start().await?;
            std::future::pending::<()>().await;
        }
    }
    Ok(())
}

async fn stopped(provisioner: &InMemoryProvisioner, resource_id: &ResourceId) {
    loop {
        match provisioner.get(resource_id).await {
            Some(resource) if resource.state.is_live() => {}
            _ => return,
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<(), CliError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| CliError::Tracing(err.to_string()))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| CliError::Tracing(err.to_string()))?,
    }

    Ok(())
}
