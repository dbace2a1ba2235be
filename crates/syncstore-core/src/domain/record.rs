//! Record - 永続化されるエンティティ
//!
//! # 学習ポイント
//! - 関連定数（`const ENTITY`）でエンティティ名を型に結びつける
//! - 保存形式は JSON（`serde_json::Value`）。Scope の評価もこの形に対して行う

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::PersistError;
use super::ids::CacheKey;

/// ローカルに保存されるレコード
///
/// `id()` はエンティティ内で一意。同じ id の put は上書き（upsert）になる。
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// エンティティ名（テーブル名に相当）
    const ENTITY: &'static str;

    fn id(&self) -> &str;
}

pub fn to_document<R: Record>(record: &R) -> Result<Value, PersistError> {
    serde_json::to_value(record).map_err(|e| PersistError::Serde(format!("{}: {e}", R::ENTITY)))
}

pub fn from_document<R: Record>(doc: Value) -> Result<R, PersistError> {
    serde_json::from_value(doc).map_err(|e| PersistError::Serde(format!("{}: {e}", R::ENTITY)))
}

/// CacheKey ごとの最終リフレッシュ時刻
///
/// 取得したレコードと同じトランザクションで更新されるので、
/// 「データはあるのに時刻がない」状態は起きない。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub last_refresh: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: CacheKey, last_refresh: DateTime<Utc>) -> Self {
        Self { key, last_refresh }
    }

    /// `last_refresh + ttl` を過ぎていれば期限切れ
    pub fn is_expired(&self, ttl: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.last_refresh
            .checked_add_signed(ttl)
            .is_some_and(|deadline| deadline < now)
    }
}

impl Record for CacheEntry {
    const ENTITY: &'static str = "syncstore.cache_entry";

    fn id(&self) -> &str {
        self.key.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn cache_entry_expires_after_ttl() {
        let refreshed = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let entry = CacheEntry::new(CacheKey::new("get-courses"), refreshed);
        let ttl = chrono::Duration::hours(2);

        assert!(!entry.is_expired(ttl, refreshed + chrono::Duration::hours(1)));
        assert!(!entry.is_expired(ttl, refreshed + ttl));
        assert!(entry.is_expired(ttl, refreshed + ttl + chrono::Duration::seconds(1)));
    }

    #[test]
    fn cache_entry_round_trips_through_document() {
        let refreshed = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let entry = CacheEntry::new(CacheKey::new("get-courses"), refreshed);

        let doc = to_document(&entry).unwrap();
        assert_eq!(doc["key"], "get-courses");
        assert_eq!(from_document::<CacheEntry>(doc).unwrap(), entry);
    }

    #[test]
    fn malformed_document_is_a_serde_error() {
        let err = from_document::<CacheEntry>(serde_json::json!({ "key": 1 })).unwrap_err();
        assert!(matches!(err, PersistError::Serde(msg) if msg.starts_with("syncstore.cache_entry")));
    }
}
