//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の実装を含めます。
//!
//! # 含まれる実装
//! - **InMemoryKvStore**: TTL 付き KV ストア（Clock 駆動、障害注入つき）
//! - **InMemoryProvisioner**: 名前で冪等な create を持つリソース基盤
//!
//! # 本番用実装
//! Redis 互換ストアや Fly Machines API のアダプタは別クレートに配置し、
//! `KvStore` / `Provisioner` を実装して注入します。

pub mod memory_provisioner;
pub mod memory_store;

// 主要な型を再エクスポート
pub use self::memory_provisioner::InMemoryProvisioner;
pub use self::memory_store::InMemoryKvStore;
