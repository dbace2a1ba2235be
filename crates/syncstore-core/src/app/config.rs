//! SyncConfig - エンジン全体の設定
//!
//! # 学習ポイント
//! - `Default` + `with_*` ビルダー
//! - 環境変数は `config` クレートで読む: デフォルト値 → `SYNCSTORE_*` の順に重ね、`try_deserialize`
//! - テストではプロセスの環境変数ではなく `from_vars` に map を渡す

use config::{Config, Environment, Map};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 環境変数のプレフィックス（`SYNCSTORE_DEFAULT_TTL_SECS` → `default_ttl_secs`）
pub const ENV_PREFIX: &str = "SYNCSTORE";

/// エンジン全体の設定
///
/// # デフォルト
/// - `default_ttl_secs`: None（TTL なし。明示的な refresh は常にネットワークへ）
/// - `offline`: false
/// - `max_pages`: 50（全ページ取得時の上限）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub default_ttl_secs: Option<u64>,
    pub offline: bool,
    pub max_pages: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: None,
            offline: false,
            max_pages: 50,
        }
    }
}

/// ConfigError は設定値の読み込み・検証エラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(String),

    #[error("max_pages must be at least 1")]
    ZeroMaxPages,
}

impl From<config::ConfigError> for ConfigError {
    fn from(error: config::ConfigError) -> Self {
        ConfigError::Load(error.to_string())
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl_secs = Some(ttl.as_secs());
        self
    }

    pub fn without_default_ttl(mut self) -> Self {
        self.default_ttl_secs = None;
        self
    }

    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_pages == 0 {
            return Err(ConfigError::ZeroMaxPages);
        }
        Ok(())
    }

    /// プロセスの環境変数から読み込む（未設定の項目はデフォルト値）
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// 与えた変数だけから読み込む
    pub fn from_vars<K, V>(vars: impl IntoIterator<Item = (K, V)>) -> Result<Self, ConfigError>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let vars: Map<String, String> = vars
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        Self::load(Some(vars))
    }

    fn load(vars: Option<Map<String, String>>) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(Config::try_from(&SyncConfig::default())?)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .try_parsing(true)
                    .source(vars),
            )
            .build()?;

        let sync_config: SyncConfig = config.try_deserialize()?;
        sync_config.validate()?;
        Ok(sync_config)
    }
}
