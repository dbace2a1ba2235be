//! ドメイン ID（型安全な識別子）
//!
//! # 学習ポイント
//! - **CacheKey**: リモートクエリの論理的な識別子。実行をまたいで安定している必要があるため、ただの文字列
//! - **Id<T>**: 実行時に生成する ID（observer, 共有オペレーション）。ULID + PhantomData で
//!   `ObserverId` と `OperationId` の取り違えをコンパイル時に防ぐ

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

use super::page::PageToken;

/// リモートクエリ 1 件の識別子（例: `"get-dashboard-cards"`, `"get-courses-42"`）
///
/// パラメータはキー文字列に埋め込む。同じクエリ・同じパラメータなら常に同じキーになる。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        debug_assert!(!key.is_empty(), "cache key must not be empty");
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 特定ページの取得を重複排除するためのキー
    pub fn page(&self, token: &PageToken) -> CacheKey {
        CacheKey(format!("{}#page:{}", self.0, token.as_str()))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

/// ID 種別ごとのマーカー trait
///
/// `Display` で使うプレフィックス（"observer-", "op-"）を提供
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ULID ベースの汎用 ID
///
/// `T` はコンパイル時にのみ存在する（PhantomData）ので、サイズは `Ulid` と同じ
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// 変更通知の購読者
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Observer {}

impl IdMarker for Observer {
    fn prefix() -> &'static str {
        "observer-"
    }
}

/// 共有されるリフレッシュ操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operation {}

impl IdMarker for Operation {
    fn prefix() -> &'static str {
        "op-"
    }
}

/// 変更通知の登録 1 件の ID
pub type ObserverId = Id<Observer>;

/// 実行中の（fetch + write）操作 1 件の ID
pub type OperationId = Id<Operation>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types_with_prefixes() {
        let observer = ObserverId::from_ulid(Ulid::new());
        let operation = OperationId::from_ulid(Ulid::new());

        assert!(observer.to_string().starts_with("observer-"));
        assert!(operation.to_string().starts_with("op-"));
        // let _: ObserverId = operation; // <- コンパイルエラー
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;
        assert_eq!(size_of::<ObserverId>(), size_of::<Ulid>());
        assert_eq!(size_of::<OperationId>(), size_of::<Ulid>());
    }

    #[test]
    fn cache_key_is_transparent_in_json() {
        let key = CacheKey::new("get-courses");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"get-courses\"");
    }

    #[test]
    fn page_keys_are_distinct_per_token() {
        let key = CacheKey::new("get-courses");
        let first = key.page(&PageToken::new("2"));
        let second = key.page(&PageToken::new("3"));

        assert_ne!(first, second);
        assert_ne!(first, key);
        assert_eq!(first.as_str(), "get-courses#page:2");
    }
}
