//! reclaim-core
//!
//! Core building blocks for recycling short-lived workers.
//!
//! 二重の回収:
//! - Worker 自身が lease（heartbeat）と終端 status をレジストリに書く
//! - Reaper が live リソースとレジストリを突き合わせ、終了・死亡・超過したものを止める
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, records, session, resource, verdict, errors）
//! - **ports**: 抽象化レイヤー（KvStore, Provisioner, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（registry, lease_reporter, reaper, orchestrator, builder）
//! - **impls**: 実装（InMemoryKvStore, InMemoryProvisioner）
//! - **config**: 設定（TOML + 環境変数）

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
