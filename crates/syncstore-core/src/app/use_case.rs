//! UseCase - リモートクエリ + Scope + 書き込みポリシー
//!
//! # 学習ポイント
//! - 書き込みポリシーは閉じた enum（継承によるオーバーライドの代わり）
//! - UseCase 自体はパラメータを持つだけでステートレス
//! - `write` は渡されたトランザクションしか触らない（Store の状態は通知経由で変わる）

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::{CacheEntry, CacheKey, PersistError, Record, Scope, SyncError};
use crate::ports::{PersistentStore, PersistentStoreExt, RequestDescriptor, Transaction, TransactionExt};

/// レスポンスを永続ストアにどうマージするか
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WritePolicy {
    /// 全件 upsert + Scope 内でレスポンスにないものを削除（stale GC）
    ReplaceCollection,
    /// upsert のみ（並び順付きリストなど、削除を自分で計算するもの）
    AppendCollection,
    /// 単一エンティティの upsert
    UpsertEntity,
    /// Scope 内をすべて削除
    DeleteScope,
    NoOp,
}

/// どの取得による書き込みか
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteMode {
    /// 1 ページ目（または全ページ）。stale GC と TTL 更新を行う
    Refresh,
    /// 続きのページ。upsert のみ
    NextPage,
}

/// TTL の扱い
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Freshness {
    /// `SyncConfig::default_ttl` に従う
    #[default]
    Default,
    /// 常にネットワークへ
    AlwaysFetch,
    For(Duration),
}

/// 1 回の write で何件保存・削除したか
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub saved: usize,
    pub removed: usize,
}

type Decoder<M> = Arc<dyn Fn(Value) -> Result<Vec<M>, serde_json::Error> + Send + Sync>;

/// UseCase はリモートクエリ 1 件の定義
///
/// # 使用例
/// ```ignore
/// let use_case = UseCase::<Course>::collection(
///     "get-courses",
///     RequestDescriptor::get("/api/v1/courses"),
///     Scope::all("name"),
/// );
/// ```
pub struct UseCase<M: Record> {
    cache_key: Option<CacheKey>,
    request: Option<RequestDescriptor>,
    scope: Scope,
    policy: WritePolicy,
    freshness: Freshness,
    load_all_pages: bool,
    decode: Decoder<M>,
}

impl<M: Record> Clone for UseCase<M> {
    fn clone(&self) -> Self {
        Self {
            cache_key: self.cache_key.clone(),
            request: self.request.clone(),
            scope: self.scope.clone(),
            policy: self.policy,
            freshness: self.freshness,
            load_all_pages: self.load_all_pages,
            decode: self.decode.clone(),
        }
    }
}

impl<M: Record> fmt::Debug for UseCase<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UseCase")
            .field("entity", &M::ENTITY)
            .field("cache_key", &self.cache_key)
            .field("request", &self.request)
            .field("scope", &self.scope)
            .field("policy", &self.policy)
            .field("freshness", &self.freshness)
            .field("load_all_pages", &self.load_all_pages)
            .finish()
    }
}

fn decode_list<M: DeserializeOwned>(body: Value) -> Result<Vec<M>, serde_json::Error> {
    serde_json::from_value(body)
}

fn decode_one<M: DeserializeOwned>(body: Value) -> Result<Vec<M>, serde_json::Error> {
    serde_json::from_value(body).map(|one| vec![one])
}

fn decode_nothing<M>(_: Value) -> Result<Vec<M>, serde_json::Error> {
    Ok(Vec::new())
}

impl<M: Record> UseCase<M> {
    /// レスポンスは `Vec<M>`。全件置き換え（stale GC あり）
    pub fn collection(
        key: impl Into<CacheKey>,
        request: RequestDescriptor,
        scope: Scope,
    ) -> Self {
        Self::custom(
            Some(key.into()),
            Some(request),
            scope,
            WritePolicy::ReplaceCollection,
            decode_list::<M>,
        )
    }

    /// レスポンスは `Vec<M>`。upsert のみ（stale GC なし）
    pub fn ordered_collection(
        key: impl Into<CacheKey>,
        request: RequestDescriptor,
        scope: Scope,
    ) -> Self {
        Self::custom(
            Some(key.into()),
            Some(request),
            scope,
            WritePolicy::AppendCollection,
            decode_list::<M>,
        )
    }

    /// レスポンスは `M` 1 件
    pub fn entity(key: impl Into<CacheKey>, request: RequestDescriptor, scope: Scope) -> Self {
        Self::custom(
            Some(key.into()),
            Some(request),
            scope,
            WritePolicy::UpsertEntity,
            decode_one::<M>,
        )
    }

    /// キャッシュされない変更系リクエスト。レスポンスの `M` を upsert
    pub fn mutation(request: RequestDescriptor, scope: Scope) -> Self {
        Self::custom(None, Some(request), scope, WritePolicy::UpsertEntity, decode_one::<M>)
    }

    /// リモートでの削除が成功したら Scope 内のレコードを消す
    pub fn delete(request: RequestDescriptor, scope: Scope) -> Self {
        Self::custom(None, Some(request), scope, WritePolicy::DeleteScope, decode_nothing::<M>)
    }

    /// リモートを持たない。ローカルのレコードを見るだけ
    pub fn local(scope: Scope) -> Self {
        Self::custom(None, None, scope, WritePolicy::NoOp, decode_nothing::<M>)
    }

    /// リモートを持たない。refresh で Scope 内のレコードを消す
    pub fn delete_local(scope: Scope) -> Self {
        Self::custom(None, None, scope, WritePolicy::DeleteScope, decode_nothing::<M>)
    }

    /// 任意のレスポンス形に対応する UseCase
    pub fn custom(
        cache_key: Option<CacheKey>,
        request: Option<RequestDescriptor>,
        scope: Scope,
        policy: WritePolicy,
        decode: impl Fn(Value) -> Result<Vec<M>, serde_json::Error> + Send + Sync + 'static,
    ) -> Self {
        Self {
            cache_key,
            request,
            scope,
            policy,
            freshness: Freshness::Default,
            load_all_pages: false,
            decode: Arc::new(decode),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.freshness = Freshness::For(ttl);
        self
    }

    pub fn without_ttl(mut self) -> Self {
        self.freshness = Freshness::AlwaysFetch;
        self
    }

    pub fn with_policy(mut self, policy: WritePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// refresh で全ページをたどり、1 トランザクションで書き込む
    pub fn with_all_pages(mut self) -> Self {
        self.load_all_pages = true;
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn cache_key(&self) -> Option<&CacheKey> {
        self.cache_key.as_ref()
    }

    pub fn request(&self) -> Option<&RequestDescriptor> {
        self.request.as_ref()
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn policy(&self) -> WritePolicy {
        self.policy
    }

    pub fn freshness(&self) -> Freshness {
        self.freshness
    }

    pub fn load_all_pages(&self) -> bool {
        self.load_all_pages
    }

    pub fn is_local(&self) -> bool {
        self.request.is_none()
    }

    pub(crate) fn set_scope(&mut self, scope: Scope) {
        self.scope = scope;
    }

    /// この UseCase に効く TTL（None なら常にネットワークへ）
    pub fn ttl(&self, default_ttl: Option<Duration>) -> Option<Duration> {
        match self.freshness {
            Freshness::Default => default_ttl,
            Freshness::AlwaysFetch => None,
            Freshness::For(ttl) => Some(ttl),
        }
    }

    pub fn decode_payload(&self, body: Value) -> Result<Vec<M>, SyncError> {
        (self.decode)(body).map_err(|e| SyncError::decode(M::ENTITY, e))
    }

    /// 書き込みポリシーを適用
    ///
    /// # ReplaceCollection + Refresh
    /// 1. Scope 内の既存レコードのうち、レスポンスにない id を削除
    /// 2. レスポンスの全件を upsert
    ///
    /// Scope 外のレコードには触れない。
    pub fn write(
        &self,
        records: &[M],
        tx: &mut dyn Transaction,
        mode: WriteMode,
    ) -> Result<WriteSummary, PersistError> {
        let mut summary = WriteSummary::default();
        match self.policy {
            WritePolicy::ReplaceCollection if mode == WriteMode::Refresh => {
                let keep: HashSet<&str> = records.iter().map(|r| r.id()).collect();
                for doc in tx.fetch(M::ENTITY, &self.scope)? {
                    if !keep.contains(doc.id.as_str()) && tx.remove(M::ENTITY, &doc.id)? {
                        summary.removed += 1;
                    }
                }
                summary.saved = tx.save_all(records)?;
            }
            WritePolicy::ReplaceCollection
            | WritePolicy::AppendCollection
            | WritePolicy::UpsertEntity => {
                summary.saved = tx.save_all(records)?;
            }
            WritePolicy::DeleteScope => {
                summary.removed = tx.delete_matching(M::ENTITY, &self.scope)?;
            }
            WritePolicy::NoOp => {}
        }
        Ok(summary)
    }

    /// CacheKey の最終リフレッシュ時刻を更新（write と同じトランザクションで呼ぶ）
    pub fn touch(&self, tx: &mut dyn Transaction, now: DateTime<Utc>) -> Result<(), PersistError> {
        if let Some(key) = &self.cache_key {
            tx.upsert(
                key.as_str(),
                || CacheEntry::new(key.clone(), now),
                |entry: &mut CacheEntry| entry.last_refresh = now,
            )?;
        }
        Ok(())
    }

    /// キャッシュが期限切れか
    ///
    /// CacheKey がない、TTL がない、一度も取得していない、`last_refresh + ttl < now` のいずれかなら true。
    pub fn is_expired(
        &self,
        store: &dyn PersistentStore,
        now: DateTime<Utc>,
        default_ttl: Option<Duration>,
    ) -> Result<bool, PersistError> {
        let (Some(key), Some(ttl)) = (&self.cache_key, self.ttl(default_ttl)) else {
            return Ok(true);
        };
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Ok(match store.find::<CacheEntry>(key.as_str())? {
            Some(entry) => entry.is_expired(ttl, now),
            None => true,
        })
    }
}
