//! syncstore-core
//!
//! Local-first な同期エンジンの中核。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, scope, record, change, state, errors）
//! - **ports**: 抽象化レイヤー（PersistentStore, RemoteFetch, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（Environment, UseCase, Store, RefreshScope, builder, config）
//! - **impls**: 実装（InMemoryPersistentStore, ScriptedRemote など開発用）
//!
//! # 流れ
//! 1. フィーチャーは `Environment::subscribe(use_case, on_change)` で Store を得る
//! 2. Store は永続ストアの内容で即座に埋まり、以後の変更通知を差分で反映する
//! 3. `Store::refresh` はリモートから取得し、1 トランザクションで書き込む
//!    → 同じ CacheKey の取得は RefreshScope が 1 本にまとめる

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;

#[cfg(test)]
mod test_support;

pub use app::{Environment, RefreshTicket, Store, SyncConfig, UseCase, WritePolicy};
pub use domain::{CacheKey, PageToken, Record, RefreshOutcome, Scope, SyncError};
