//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **Registry**: KvStore 上の型付きレジストリクライアント
//! - **LeaseReporter**: Worker 側の heartbeat と終端報告
//! - **Reaper**: live リソースとレジストリの突き合わせ・回収ループ
//! - **SessionOrchestrator**: セッションの作成（重複排除）・待機・破棄
//! - **ControlPlaneBuilder**: 依存の注入と起動時検証

pub mod builder;
pub mod lease_reporter;
pub mod orchestrator;
pub mod reaper;
pub mod registry;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, ControlPlane, ControlPlaneBuilder};
pub use self::lease_reporter::{HeartbeatSettings, LeaseReporter, WorkerIdentity, WorkerIdentityError};
pub use self::orchestrator::{
    OrchestratorSettings, PollBackoff, SessionOrchestrator, SessionParams, WaitOptions,
};
pub use self::reaper::{Reaper, ReaperHandle, ReaperSettings, Reclamation, SweepReport};
pub use self::registry::{KeySpace, Registry};
