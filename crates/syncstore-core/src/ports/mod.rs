//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 同期エンジンが外部コラボレーター（オンデバイスのストア、HTTP トランスポート、時計）に
//! 要求するインターフェースだけを置き、実装の詳細は `impls` に隠蔽します。

pub mod clock;
pub mod id_generator;
pub mod persistent_store;
pub mod remote_fetch;

// 主要な trait を再エクスポート
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::persistent_store::{
    ChangeStream, PersistentStore, PersistentStoreExt, Transaction, TransactionExt, WriteBlock,
};
pub use self::remote_fetch::{Method, RemoteFetch, RemotePayload, RequestDescriptor};
