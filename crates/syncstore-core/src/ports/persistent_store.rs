//! PersistentStore port - オンデバイスのトランザクショナルなストア
//!
//! PersistentStore は以下を提供します：
//! - 読み取り（query / get）: 同期的で安価
//! - 書き込み（perform_write）: 非同期・トランザクショナル。ブロック全体が 1 コミット
//! - 変更通知（observe_changes）: コミット後に、Scope に関係する変更だけを配送
//!
//! # 設計原則
//! - レコードを変更してよいのは UseCase の write policy だけ
//! - 書き込みブロックが Err を返したらロールバック（部分的な upsert は残らない）
//! - 通知はコミット後にのみ発行される

use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc;

use crate::domain::record::{from_document, to_document};
use crate::domain::{ChangeSet, Commit, Document, ObserverId, PersistError, Record, Scope};

/// 書き込みトランザクション
///
/// `put` は upsert（find-or-create してから全フィールドを上書き）。
/// 読み取りは同じトランザクション内の未コミットの変更も見える。
pub trait Transaction: Send {
    fn get(&self, entity: &str, id: &str) -> Result<Option<Value>, PersistError>;

    /// Scope にマッチするレコードを Scope の順序で返す
    fn fetch(&self, entity: &str, scope: &Scope) -> Result<Vec<Document>, PersistError>;

    fn put(&mut self, entity: &str, id: &str, body: Value) -> Result<(), PersistError>;

    /// 削除した場合 true
    fn remove(&mut self, entity: &str, id: &str) -> Result<bool, PersistError>;
}

/// Record 型付きのヘルパー
pub trait TransactionExt: Transaction {
    fn save<R: Record>(&mut self, record: &R) -> Result<(), PersistError> {
        let body = to_document(record)?;
        self.put(R::ENTITY, record.id(), body)
    }

    fn save_all<R: Record>(&mut self, records: &[R]) -> Result<usize, PersistError> {
        for record in records {
            self.save(record)?;
        }
        Ok(records.len())
    }

    fn find<R: Record>(&self, id: &str) -> Result<Option<R>, PersistError> {
        self.get(R::ENTITY, id)?.map(from_document).transpose()
    }

    /// 自然キーで find-or-create し、`update` を適用して保存
    fn upsert<R: Record>(
        &mut self,
        id: &str,
        create: impl FnOnce() -> R,
        update: impl FnOnce(&mut R),
    ) -> Result<R, PersistError> {
        let mut record = self.find::<R>(id)?.unwrap_or_else(create);
        update(&mut record);
        self.save(&record)?;
        Ok(record)
    }

    fn fetch_records<R: Record>(&self, scope: &Scope) -> Result<Vec<R>, PersistError> {
        self.fetch(R::ENTITY, scope)?
            .into_iter()
            .map(|doc| from_document(doc.body))
            .collect()
    }

    /// Scope にマッチするレコードをすべて削除し、件数を返す
    fn delete_matching(&mut self, entity: &str, scope: &Scope) -> Result<usize, PersistError> {
        let doomed = self.fetch(entity, scope)?;
        for doc in &doomed {
            self.remove(entity, &doc.id)?;
        }
        Ok(doomed.len())
    }

    fn delete_record<R: Record>(&mut self, id: &str) -> Result<bool, PersistError> {
        self.remove(R::ENTITY, id)
    }
}

impl<T: Transaction + ?Sized> TransactionExt for T {}

/// 書き込みブロック（spawn_blocking 上で実行される）
pub type WriteBlock = Box<dyn FnOnce(&mut dyn Transaction) -> Result<(), PersistError> + Send>;

/// PersistentStore はレコードの正本
#[async_trait::async_trait]
pub trait PersistentStore: Send + Sync {
    /// Scope にマッチするコミット済みレコードを Scope の順序で返す
    fn query(&self, entity: &str, scope: &Scope) -> Result<Vec<Document>, PersistError>;

    fn get(&self, entity: &str, id: &str) -> Result<Option<Value>, PersistError>;

    /// ブロックを 1 トランザクションとして実行する
    ///
    /// 成功時はコミットされた変更を返す。通知はこのメソッドが返る前に発行済み。
    async fn perform_write(&self, block: WriteBlock) -> Result<Commit, PersistError>;

    /// `(entity, scope)` に関係する変更の購読を開始
    fn observe_changes(&self, entity: &str, scope: Scope) -> ChangeStream;
}

/// Record 型付きの読み取りヘルパー
pub trait PersistentStoreExt: PersistentStore {
    fn query_records<R: Record>(&self, scope: &Scope) -> Result<Vec<R>, PersistError> {
        self.query(R::ENTITY, scope)?
            .into_iter()
            .map(|doc| from_document(doc.body))
            .collect()
    }

    fn find<R: Record>(&self, id: &str) -> Result<Option<R>, PersistError> {
        self.get(R::ENTITY, id)?.map(from_document).transpose()
    }
}

impl<S: PersistentStore + ?Sized> PersistentStoreExt for S {}

/// 変更通知のストリーム
///
/// Drop すると購読が解除される。
pub struct ChangeStream {
    observer: ObserverId,
    receiver: mpsc::UnboundedReceiver<ChangeSet>,
    on_drop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ChangeStream {
    pub fn new(
        observer: ObserverId,
        receiver: mpsc::UnboundedReceiver<ChangeSet>,
        on_drop: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            observer,
            receiver,
            on_drop: Some(Box::new(on_drop)),
        }
    }

    pub fn observer(&self) -> ObserverId {
        self.observer
    }

    /// 次の変更を待つ。ストアが破棄されたら None
    pub async fn recv(&mut self) -> Option<ChangeSet> {
        self.receiver.recv().await
    }

    /// 溜まっている変更を待たずに取り出す
    pub fn try_recv(&mut self) -> Option<ChangeSet> {
        self.receiver.try_recv().ok()
    }
}

impl fmt::Debug for ChangeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeStream")
            .field("observer", &self.observer)
            .finish_non_exhaustive()
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}
