//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（TTL 付き KV ストア、リソース基盤、時計）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - レジストリ（KvStore）が唯一の共有可変状態
//! - リソースの実際の状態は Provisioner が正本
//! - 時刻は Clock 経由で取得（テストで差し替え可能）

pub mod clock;
pub mod id_generator;
pub mod kv_store;
pub mod provisioner;

// 主要な trait を再エクスポート
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::kv_store::KvStore;
pub use self::provisioner::Provisioner;
