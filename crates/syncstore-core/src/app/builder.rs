//! EnvironmentBuilder - 同期エンジンの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 開発体験の改善（明確なエラーメッセージ）

use std::sync::Arc;

use crate::app::config::{ConfigError, SyncConfig};
use crate::app::environment::Environment;
use crate::app::refresh_scope::RefreshScope;
use crate::ports::{Clock, PersistentStore, RemoteFetch, SystemClock, UlidGenerator};

/// EnvironmentBuilder は Environment を構築
///
/// # 使用例
/// ```ignore
/// let env = Environment::builder()
///     .persistent(Arc::new(InMemoryPersistentStore::new()))
///     .remote(Arc::new(http_client))
///     .config(SyncConfig::from_env()?)
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - PersistentStore と RemoteFetch は必須。なければ build() で BuildError
/// - SyncConfig は build() 時に検証
#[derive(Default)]
pub struct EnvironmentBuilder {
    persistent: Option<Arc<dyn PersistentStore>>,
    remote: Option<Arc<dyn RemoteFetch>>,
    clock: Option<Arc<dyn Clock>>,
    refresh_scope: Option<RefreshScope>,
    config: SyncConfig,
}

/// BuildError は Environment 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing persistent store. Call .persistent() before .build().")]
    MissingPersistentStore,

    #[error("Missing remote fetch. Call .remote() before .build().")]
    MissingRemote,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

impl EnvironmentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn persistent(mut self, persistent: Arc<dyn PersistentStore>) -> Self {
        self.persistent = Some(persistent);
        self
    }

    pub fn remote(mut self, remote: Arc<dyn RemoteFetch>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// 省略時は SystemClock
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// 複数の Environment で重複排除を共有したいときに渡す
    pub fn refresh_scope(mut self, refresh_scope: RefreshScope) -> Self {
        self.refresh_scope = Some(refresh_scope);
        self
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// EnvironmentBuilder を検証して Environment を生成
    pub fn build(self) -> Result<Environment, BuildError> {
        let persistent = self.persistent.ok_or(BuildError::MissingPersistentStore)?;
        let remote = self.remote.ok_or(BuildError::MissingRemote)?;
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let refresh_scope = self
            .refresh_scope
            .unwrap_or_else(|| RefreshScope::new(Arc::new(UlidGenerator::new(clock.clone()))));

        Ok(Environment::new(
            persistent,
            remote,
            refresh_scope,
            clock,
            self.config,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{InMemoryPersistentStore, ScriptedRemote};

    #[test]
    fn test_build_success() {
        let env = EnvironmentBuilder::new()
            .persistent(Arc::new(InMemoryPersistentStore::new()))
            .remote(Arc::new(ScriptedRemote::new()))
            .build();
        assert!(env.is_ok());
    }

    #[test]
    fn test_build_missing_persistent_store() {
        let env = EnvironmentBuilder::new()
            .remote(Arc::new(ScriptedRemote::new()))
            .build();
        assert!(matches!(env, Err(BuildError::MissingPersistentStore)));
    }

    #[test]
    fn test_build_missing_remote() {
        let env = EnvironmentBuilder::new()
            .persistent(Arc::new(InMemoryPersistentStore::new()))
            .build();
        assert!(matches!(env, Err(BuildError::MissingRemote)));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let env = EnvironmentBuilder::new()
            .persistent(Arc::new(InMemoryPersistentStore::new()))
            .remote(Arc::new(ScriptedRemote::new()))
            .config(SyncConfig::default().with_max_pages(0))
            .build();
        assert!(matches!(
            env,
            Err(BuildError::InvalidConfig(ConfigError::ZeroMaxPages))
        ));
    }

    #[test]
    fn test_shared_refresh_scope() {
        let shared = RefreshScope::default();
        let build = || {
            EnvironmentBuilder::new()
                .persistent(Arc::new(InMemoryPersistentStore::new()))
                .remote(Arc::new(ScriptedRemote::new()))
                .refresh_scope(shared.clone())
                .build()
                .unwrap()
        };
        let (a, b) = (build(), build());
        assert!(a.refresh_scope().ptr_eq(b.refresh_scope()));
    }
}
