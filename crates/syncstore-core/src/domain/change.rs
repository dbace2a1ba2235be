//! 変更通知の単位
//!
//! # 学習ポイント
//! - `RecordChange`: 1 レコードの before / after イメージ（コミット時に確定）
//! - `Document`: 保存されている形（id + JSON 本体）
//! - `ChangeSet`: 購読者の Scope から見た分類（inserted / updated / deleted）
//! - `Commit`: 1 トランザクション分の変更

use serde_json::Value;

/// 保存済みレコード 1 件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: String,
    pub body: Value,
}

impl Document {
    pub fn new(id: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            body,
        }
    }
}

/// 1 レコードの変更（before が None なら新規、after が None なら削除）
#[derive(Debug, Clone, PartialEq)]
pub struct RecordChange {
    pub entity: String,
    pub id: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

impl RecordChange {
    pub fn is_delete(&self) -> bool {
        self.after.is_none()
    }
}

/// 購読者の Scope に対して分類された変更
///
/// inserted / updated はコミット後の本体を持つので、受け取った側は再クエリせずに反映できる。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub entity: String,
    pub inserted: Vec<Document>,
    pub updated: Vec<Document>,
    pub deleted: Vec<String>,
}

impl ChangeSet {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.touched().any(|touched| touched == id)
    }

    /// 変更された id をすべて列挙
    pub fn touched(&self) -> impl Iterator<Item = &str> {
        self.inserted
            .iter()
            .chain(&self.updated)
            .map(|doc| doc.id.as_str())
            .chain(self.deleted.iter().map(String::as_str))
    }

    pub fn len(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }
}

/// 1 回の書き込みトランザクションでコミットされた変更
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Commit {
    pub changes: Vec<RecordChange>,
}

impl Commit {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn for_entity<'a>(&'a self, entity: &'a str) -> impl Iterator<Item = &'a RecordChange> {
        self.changes.iter().filter(move |c| c.entity == entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn change_set_tracks_touched_ids() {
        let mut set = ChangeSet::new("course");
        assert!(set.is_empty());

        set.inserted.push(Document::new("1", json!({ "id": "1" })));
        set.deleted.push("2".into());

        assert!(set.contains("1"));
        assert!(set.contains("2"));
        assert!(!set.contains("3"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn commit_filters_by_entity() {
        let commit = Commit {
            changes: vec![
                RecordChange {
                    entity: "course".into(),
                    id: "1".into(),
                    before: None,
                    after: Some(json!({ "id": "1" })),
                },
                RecordChange {
                    entity: "syncstore.cache_entry".into(),
                    id: "get-courses".into(),
                    before: None,
                    after: Some(json!({})),
                },
            ],
        };

        let ids: Vec<&str> = commit.for_entity("course").map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["1"]);
    }
}
