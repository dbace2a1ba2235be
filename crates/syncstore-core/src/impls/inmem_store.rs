//! InMemoryPersistentStore - 開発・テスト用の永続ストア
//!
//! # 学習ポイント
//! - RwLock で「読み取りは並行、書き込みは排他」
//! - 書き込みは tokio::sync::Mutex のゲートで直列化し、spawn_blocking 上で実行
//! - ステージング（未コミットの変更）に対してブロックを走らせ、Ok なら一括適用、Err なら破棄
//! - 通知はコミット後、ゲートを握ったまま発行（通知順 = コミット順）

use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, warn};

use crate::domain::{Commit, Document, PersistError, RecordChange, Scope};
use crate::impls::ChangeBus;
use crate::ports::{
    ChangeStream, IdGenerator, PersistentStore, SystemClock, Transaction, UlidGenerator,
    WriteBlock,
};

type Table = BTreeMap<String, Value>;
type Tables = HashMap<String, Table>;

/// InMemoryPersistentStore はエンティティごとの BTreeMap<id, JSON> を持つ
///
/// # 使用例
/// ```ignore
/// let store = InMemoryPersistentStore::new();
/// let commit = store
///     .perform_write(Box::new(|tx| tx.put("course", "1", json!({ "id": "1" }))))
///     .await?;
/// ```
pub struct InMemoryPersistentStore {
    tables: Arc<RwLock<Tables>>,
    /// 書き込みの直列化
    write_gate: tokio::sync::Mutex<()>,
    bus: ChangeBus,
    /// 次の書き込みで返す失敗（テスト用）
    injected_failures: Mutex<VecDeque<PersistError>>,
}

impl InMemoryPersistentStore {
    pub fn new() -> Self {
        Self::with_id_generator(Arc::new(UlidGenerator::new(SystemClock)))
    }

    pub fn with_id_generator(ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            tables: Arc::new(RwLock::new(HashMap::new())),
            write_gate: tokio::sync::Mutex::new(()),
            bus: ChangeBus::new(ids),
            injected_failures: Mutex::new(VecDeque::new()),
        }
    }

    /// 次の `perform_write` をブロックを実行せずに失敗させる
    pub fn inject_write_failure(&self, error: PersistError) {
        self.injected_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(error);
    }

    /// エンティティの全件数
    pub fn count(&self, entity: &str) -> Result<usize, PersistError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        Ok(tables.get(entity).map_or(0, BTreeMap::len))
    }

    pub fn observer_count(&self) -> usize {
        self.bus.observer_count()
    }

    fn take_injected_failure(&self) -> Option<PersistError> {
        self.injected_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

impl Default for InMemoryPersistentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PersistentStore for InMemoryPersistentStore {
    fn query(&self, entity: &str, scope: &Scope) -> Result<Vec<Document>, PersistError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        let docs = tables
            .get(entity)
            .into_iter()
            .flatten()
            .filter(|(_, body)| scope.matches(body))
            .map(|(id, body)| Document::new(id, body.clone()))
            .collect();
        Ok(sorted(scope, docs))
    }

    fn get(&self, entity: &str, id: &str) -> Result<Option<Value>, PersistError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        Ok(tables.get(entity).and_then(|table| table.get(id)).cloned())
    }

    /// ブロックを 1 トランザクションとして実行
    ///
    /// # 実装
    /// 1. 書き込みゲートを取得（他の書き込みを待つ）
    /// 2. spawn_blocking でステージング上にブロックを実行
    /// 3. Ok なら write lock を取ってステージングを適用し、実際に変わったものを Commit にする
    /// 4. ゲートを握ったまま ChangeBus に publish
    async fn perform_write(&self, block: WriteBlock) -> Result<Commit, PersistError> {
        let _gate = self.write_gate.lock().await;

        if let Some(error) = self.take_injected_failure() {
            warn!(error = %error, "injected write failure");
            return Err(error);
        }

        let tables = self.tables.clone();
        let commit = tokio::task::spawn_blocking(move || -> Result<Commit, PersistError> {
            let staged = {
                let base = tables.read().map_err(|_| poisoned())?;
                let mut tx = StagedTransaction {
                    base: &base,
                    staged: BTreeMap::new(),
                };
                // Err ならステージングごと捨てる（ロールバック）
                block(&mut tx)?;
                tx.staged
            };

            let mut tables = tables.write().map_err(|_| poisoned())?;
            let mut changes = Vec::new();
            for ((entity, id), after) in staged {
                let table = tables.entry(entity.clone()).or_default();
                let before = match &after {
                    Some(body) => {
                        let before = table.insert(id.clone(), body.clone());
                        if before.as_ref() == Some(body) {
                            continue;
                        }
                        before
                    }
                    None => match table.remove(&id) {
                        Some(before) => Some(before),
                        None => continue,
                    },
                };
                changes.push(RecordChange {
                    entity,
                    id,
                    before,
                    after,
                });
            }
            Ok(Commit { changes })
        })
        .await
        .map_err(|e| PersistError::Storage(format!("write task failed: {e}")))??;

        let delivered = self.bus.publish(&commit);
        debug!(changes = commit.len(), delivered, "write committed");
        Ok(commit)
    }

    fn observe_changes(&self, entity: &str, scope: Scope) -> ChangeStream {
        self.bus.subscribe(entity, scope)
    }
}

/// コミット前の変更を重ねて見せるトランザクション
///
/// `staged` の None は削除を表す。
struct StagedTransaction<'a> {
    base: &'a Tables,
    staged: BTreeMap<(String, String), Option<Value>>,
}

impl StagedTransaction<'_> {
    fn key(entity: &str, id: &str) -> (String, String) {
        (entity.to_string(), id.to_string())
    }
}

impl Transaction for StagedTransaction<'_> {
    fn get(&self, entity: &str, id: &str) -> Result<Option<Value>, PersistError> {
        if let Some(staged) = self.staged.get(&Self::key(entity, id)) {
            return Ok(staged.clone());
        }
        Ok(self.base.get(entity).and_then(|t| t.get(id)).cloned())
    }

    fn fetch(&self, entity: &str, scope: &Scope) -> Result<Vec<Document>, PersistError> {
        let mut visible: BTreeMap<&str, &Value> = self
            .base
            .get(entity)
            .into_iter()
            .flatten()
            .map(|(id, body)| (id.as_str(), body))
            .collect();
        for ((staged_entity, id), body) in &self.staged {
            if staged_entity != entity {
                continue;
            }
            match body {
                Some(body) => {
                    visible.insert(id.as_str(), body);
                }
                None => {
                    visible.remove(id.as_str());
                }
            }
        }
        let docs = visible
            .into_iter()
            .filter(|(_, body)| scope.matches(body))
            .map(|(id, body)| Document::new(id, body.clone()))
            .collect();
        Ok(sorted(scope, docs))
    }

    fn put(&mut self, entity: &str, id: &str, body: Value) -> Result<(), PersistError> {
        if id.is_empty() {
            return Err(PersistError::Constraint {
                entity: entity.to_string(),
                id: id.to_string(),
                message: "id must not be empty".into(),
            });
        }
        self.staged.insert(Self::key(entity, id), Some(body));
        Ok(())
    }

    fn remove(&mut self, entity: &str, id: &str) -> Result<bool, PersistError> {
        let existed = self.get(entity, id)?.is_some();
        if existed {
            self.staged.insert(Self::key(entity, id), None);
        }
        Ok(existed)
    }
}

fn sorted(scope: &Scope, mut docs: Vec<Document>) -> Vec<Document> {
    docs.sort_by(|a, b| scope.compare_entries(&a.id, &a.body, &b.id, &b.body));
    docs
}

fn poisoned() -> PersistError {
    PersistError::Storage("store lock poisoned".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::TransactionExt;
    use serde_json::json;

    async fn seed(store: &InMemoryPersistentStore, rows: &[(&str, &str)]) {
        let rows: Vec<(String, String)> = rows
            .iter()
            .map(|(id, name)| (id.to_string(), name.to_string()))
            .collect();
        store
            .perform_write(Box::new(move |tx| {
                for (id, name) in rows {
                    tx.put("course", &id, json!({ "id": id, "name": name }))?;
                }
                Ok(())
            }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn query_filters_and_sorts() {
        let store = InMemoryPersistentStore::new();
        seed(&store, &[("1", "Zebra"), ("2", "Apple"), ("3", "Mango")]).await;

        let scope = Scope::new(
            crate::domain::Predicate::ne("name", "Mango"),
            vec!["name".into()],
        );
        let ids: Vec<String> = store
            .query("course", &scope)
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, ["2", "1"]);
    }

    #[tokio::test]
    async fn failing_block_rolls_back_everything() {
        let store = InMemoryPersistentStore::new();
        seed(&store, &[("1", "Algebra")]).await;

        let result = store
            .perform_write(Box::new(|tx| {
                tx.put("course", "2", json!({ "id": "2", "name": "Biology" }))?;
                tx.remove("course", "1")?;
                Err(PersistError::Constraint {
                    entity: "course".into(),
                    id: "3".into(),
                    message: "duplicate".into(),
                })
            }))
            .await;

        assert!(matches!(result, Err(PersistError::Constraint { .. })));
        let ids: Vec<String> = store
            .query("course", &Scope::default())
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, ["1"]);
    }

    #[tokio::test]
    async fn unchanged_puts_are_not_reported() {
        let store = InMemoryPersistentStore::new();
        seed(&store, &[("1", "Algebra")]).await;

        let commit = store
            .perform_write(Box::new(|tx| {
                tx.put("course", "1", json!({ "id": "1", "name": "Algebra" }))?;
                tx.put("course", "2", json!({ "id": "2", "name": "Biology" }))
            }))
            .await
            .unwrap();

        let ids: Vec<&str> = commit.changes.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["2"]);
    }

    #[tokio::test]
    async fn transaction_reads_its_own_writes() {
        let store = InMemoryPersistentStore::new();
        seed(&store, &[("1", "Algebra"), ("2", "Biology")]).await;

        store
            .perform_write(Box::new(|tx| {
                tx.put("course", "3", json!({ "id": "3", "name": "Chemistry" }))?;
                tx.remove("course", "1")?;
                let ids: Vec<String> = tx
                    .fetch("course", &Scope::default())?
                    .into_iter()
                    .map(|d| d.id)
                    .collect();
                assert_eq!(ids, ["2", "3"]);
                assert_eq!(tx.delete_matching("course", &Scope::default())?, 2);
                Ok(())
            }))
            .await
            .unwrap();

        assert_eq!(store.count("course").unwrap(), 0);
    }

    #[tokio::test]
    async fn observers_are_notified_after_commit() {
        let store = InMemoryPersistentStore::new();
        let mut stream = store.observe_changes("course", Scope::all("name"));

        seed(&store, &[("1", "Algebra")]).await;

        let set = stream.try_recv().expect("notification is published before perform_write returns");
        assert_eq!(set.inserted.len(), 1);
        assert_eq!(set.inserted[0].id, "1");
        assert_eq!(store.get("course", "1").unwrap().unwrap()["name"], "Algebra");
    }

    #[tokio::test]
    async fn injected_failure_skips_the_block() {
        let store = InMemoryPersistentStore::new();
        store.inject_write_failure(PersistError::Storage("disk full".into()));

        let result = store
            .perform_write(Box::new(|tx| tx.put("course", "1", json!({ "id": "1" }))))
            .await;

        assert_eq!(result, Err(PersistError::Storage("disk full".into())));
        assert_eq!(store.count("course").unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_id_violates_constraint() {
        let store = InMemoryPersistentStore::new();
        let result = store
            .perform_write(Box::new(|tx| tx.put("course", "", json!({}))))
            .await;
        assert!(matches!(result, Err(PersistError::Constraint { .. })));
    }
}
