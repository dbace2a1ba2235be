//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の実装を含めます。
//!
//! # 含まれる実装
//! - **InMemoryPersistentStore**: 開発用の永続ストア（ChangeBus で変更通知）
//! - **ScriptedRemote**: 台本どおりに応答する RemoteFetch
//!
//! # 本番用実装
//! SQLite などのストアや HTTP クライアントは別クレートで ports を実装します。

pub mod change_bus;
pub mod inmem_store;
pub mod scripted_remote;

// 主要な型を再エクスポート
pub use self::change_bus::ChangeBus;
pub use self::inmem_store::InMemoryPersistentStore;
pub use self::scripted_remote::ScriptedRemote;
