//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせて同期エンジンを実装します。
//!
//! # 主要コンポーネント
//! - **EnvironmentBuilder**: Environment の構築とワイヤリング
//! - **Environment**: ports + RefreshScope + 設定。Store の入り口
//! - **UseCase**: リモートクエリ + Scope + 書き込みポリシー
//! - **Store**: Scope のライブなコレクション（refresh / next_page）
//! - **RefreshScope**: CacheKey 単位の取得の重複排除とキャンセル

pub mod builder;
pub mod config;
pub mod environment;
mod fetch;
pub mod refresh_scope;
pub mod store;
pub mod use_case;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, EnvironmentBuilder};
pub use self::config::{ConfigError, SyncConfig};
pub use self::environment::Environment;
pub use self::refresh_scope::{CancelSignal, RefreshHandle, RefreshScope};
pub use self::store::{RefreshTicket, Section, Store};
pub use self::use_case::{Freshness, UseCase, WriteMode, WritePolicy, WriteSummary};
