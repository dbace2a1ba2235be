//! ChangeBus - コミット後の変更を Scope ごとに振り分ける
//!
//! # 学習ポイント
//! - 購読者リスト（ObserverId → (entity, Scope, sender)）を Mutex で保護
//! - before / after イメージを Scope で評価して inserted / updated / deleted に分類
//! - ChangeStream の drop で Weak 経由で登録解除（バスが先に消えても安全）

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

use crate::domain::{ChangeSet, Commit, Document, ObserverId, Scope};
use crate::ports::{ChangeStream, IdGenerator};

struct Observer {
    entity: String,
    scope: Scope,
    sender: mpsc::UnboundedSender<ChangeSet>,
}

/// ChangeBus はコミットされた変更を関係する購読者に配送する
pub struct ChangeBus {
    observers: Arc<Mutex<HashMap<ObserverId, Observer>>>,
    ids: Arc<dyn IdGenerator>,
}

impl ChangeBus {
    pub fn new(ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            observers: Arc::new(Mutex::new(HashMap::new())),
            ids,
        }
    }

    pub fn subscribe(&self, entity: &str, scope: Scope) -> ChangeStream {
        let id = self.ids.generate_observer_id();
        let (sender, receiver) = mpsc::unbounded_channel();
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                Observer {
                    entity: entity.to_string(),
                    scope,
                    sender,
                },
            );
        debug!(observer = %id, entity, "change observer registered");

        let registry = Arc::downgrade(&self.observers);
        ChangeStream::new(id, receiver, move || {
            if let Some(registry) = registry.upgrade() {
                registry
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
                debug!(observer = %id, "change observer removed");
            }
        })
    }

    /// コミットを購読者ごとに分類して配送し、配送数を返す
    pub fn publish(&self, commit: &Commit) -> usize {
        if commit.is_empty() {
            return 0;
        }
        let mut delivered = 0;
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        observers.retain(|id, observer| {
            let set = classify(&observer.entity, &observer.scope, commit);
            if set.is_empty() {
                return !observer.sender.is_closed();
            }
            match observer.sender.send(set) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => {
                    debug!(observer = %id, "dropping closed change observer");
                    false
                }
            }
        });
        delivered
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Scope から見た変更の分類
///
/// - before も after もマッチ: updated
/// - after だけマッチ: inserted（新規、または Scope に入ってきた）
/// - before だけマッチ: deleted（削除、または Scope から出ていった）
pub fn classify(entity: &str, scope: &Scope, commit: &Commit) -> ChangeSet {
    let mut set = ChangeSet::new(entity);
    for change in commit.for_entity(entity) {
        let was_visible = change.before.as_ref().is_some_and(|doc| scope.matches(doc));
        let now_visible = change.after.as_ref().filter(|doc| scope.matches(doc));
        match (was_visible, now_visible) {
            (true, Some(after)) => set.updated.push(Document::new(&change.id, after.clone())),
            (false, Some(after)) => set.inserted.push(Document::new(&change.id, after.clone())),
            (true, None) => set.deleted.push(change.id.clone()),
            (false, None) => {}
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RecordChange;
    use crate::ports::{SystemClock, UlidGenerator};
    use serde_json::{Value, json};

    fn bus() -> ChangeBus {
        ChangeBus::new(Arc::new(UlidGenerator::new(SystemClock)))
    }

    fn change(id: &str, before: Option<Value>, after: Option<Value>) -> RecordChange {
        RecordChange {
            entity: "course".into(),
            id: id.into(),
            before,
            after,
        }
    }

    #[tokio::test]
    async fn classifies_changes_against_observer_scope() {
        let bus = bus();
        let mut stream = bus.subscribe("course", Scope::where_eq("term", 1, "name"));

        let commit = Commit {
            changes: vec![
                change("new", None, Some(json!({ "term": 1 }))),
                change("edited", Some(json!({ "term": 1 })), Some(json!({ "term": 1, "x": 2 }))),
                change("moved-out", Some(json!({ "term": 1 })), Some(json!({ "term": 2 }))),
                change("moved-in", Some(json!({ "term": 2 })), Some(json!({ "term": 1 }))),
                change("unrelated", None, Some(json!({ "term": 3 }))),
            ],
        };
        assert_eq!(bus.publish(&commit), 1);

        let set = stream.recv().await.unwrap();
        let inserted: Vec<&str> = set.inserted.iter().map(|d| d.id.as_str()).collect();
        let updated: Vec<&str> = set.updated.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(inserted, ["new", "moved-in"]);
        assert_eq!(updated, ["edited"]);
        assert_eq!(set.deleted, ["moved-out"]);
    }

    #[tokio::test]
    async fn other_entities_are_not_delivered() {
        let bus = bus();
        let mut stream = bus.subscribe("assignment", Scope::default());

        let commit = Commit {
            changes: vec![change("1", None, Some(json!({})))],
        };
        assert_eq!(bus.publish(&commit), 0);
        assert!(stream.try_recv().is_none());
    }

    #[test]
    fn dropping_stream_deregisters_observer() {
        let bus = bus();
        let stream = bus.subscribe("course", Scope::default());
        assert_eq!(bus.observer_count(), 1);

        drop(stream);
        assert_eq!(bus.observer_count(), 0);
    }

    #[test]
    fn stream_outliving_bus_is_harmless() {
        let bus = bus();
        let stream = bus.subscribe("course", Scope::default());
        drop(bus);
        drop(stream);
    }
}
