//! Scope - 永続レコードの「どれを・どの順で」
//!
//! # 学習ポイント
//! - レコードの JSON 表現に対して評価する（`serde_json::Value`）
//! - フィールドパスはドット区切り（`"course.id"`, `"tags.0"`）。解決できなければ `null` として読む
//! - 順序は全順序: ソートキー → レコード id。同じデータなら何度クエリしても同じ並びになる

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// レコード JSON へのドット区切りパス
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldPath(String);

impl FieldPath {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        debug_assert!(
            !path.is_empty() && !path.split('.').any(str::is_empty),
            "malformed field path: {path:?}"
        );
        Self(path)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// object はキー、array はインデックスで辿る
    pub fn resolve<'a>(&self, doc: &'a Value) -> Option<&'a Value> {
        self.0.split('.').try_fold(doc, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }

    fn read<'a>(&self, doc: &'a Value) -> &'a Value {
        self.resolve(doc).unwrap_or(&Value::Null)
    }
}

impl From<&str> for FieldPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for FieldPath {
    fn from(path: String) -> Self {
        Self::new(path)
    }
}

/// レコードのフィールドに対する述語
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// 全件にマッチ
    All,
    Eq(FieldPath, Value),
    Ne(FieldPath, Value),
    Lt(FieldPath, Value),
    Le(FieldPath, Value),
    Gt(FieldPath, Value),
    Ge(FieldPath, Value),
    In(FieldPath, Vec<Value>),
    IsNull(FieldPath),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn eq(field: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Predicate::Eq(field.into(), value.into())
    }

    pub fn ne(field: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Predicate::Ne(field.into(), value.into())
    }

    pub fn lt(field: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Predicate::Lt(field.into(), value.into())
    }

    pub fn le(field: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Predicate::Le(field.into(), value.into())
    }

    pub fn gt(field: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Predicate::Gt(field.into(), value.into())
    }

    pub fn ge(field: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Predicate::Ge(field.into(), value.into())
    }

    pub fn one_of<V: Into<Value>>(
        field: impl Into<FieldPath>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Predicate::In(field.into(), values.into_iter().map(Into::into).collect())
    }

    pub fn is_null(field: impl Into<FieldPath>) -> Self {
        Predicate::IsNull(field.into())
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::All => other,
            Predicate::And(mut all) => {
                all.push(other);
                Predicate::And(all)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match self {
            Predicate::Or(mut any) => {
                any.push(other);
                Predicate::Or(any)
            }
            first => Predicate::Or(vec![first, other]),
        }
    }

    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    pub fn evaluate(&self, doc: &Value) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Eq(field, value) => values_equal(field.read(doc), value),
            Predicate::Ne(field, value) => !values_equal(field.read(doc), value),
            Predicate::Lt(field, value) => ordered(field.read(doc), value, Ordering::is_lt),
            Predicate::Le(field, value) => ordered(field.read(doc), value, Ordering::is_le),
            Predicate::Gt(field, value) => ordered(field.read(doc), value, Ordering::is_gt),
            Predicate::Ge(field, value) => ordered(field.read(doc), value, Ordering::is_ge),
            Predicate::In(field, values) => {
                let actual = field.read(doc);
                values.iter().any(|v| values_equal(actual, v))
            }
            Predicate::IsNull(field) => field.read(doc).is_null(),
            Predicate::And(all) => all.iter().all(|p| p.evaluate(doc)),
            Predicate::Or(any) => any.iter().any(|p| p.evaluate(doc)),
            Predicate::Not(inner) => !inner.evaluate(doc),
        }
    }
}

/// ソート条件 1 つ
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SortKey {
    pub field: FieldPath,
    pub ascending: bool,
}

impl SortKey {
    pub fn asc(field: impl Into<FieldPath>) -> Self {
        Self {
            field: field.into(),
            ascending: true,
        }
    }

    pub fn desc(field: impl Into<FieldPath>) -> Self {
        Self {
            field: field.into(),
            ascending: false,
        }
    }

    fn compare(&self, a: &Value, b: &Value) -> Ordering {
        let ordering = compare_values(self.field.read(a), self.field.read(b));
        if self.ascending {
            ordering
        } else {
            ordering.reverse()
        }
    }
}

impl From<&str> for SortKey {
    fn from(field: &str) -> Self {
        SortKey::asc(field)
    }
}

/// 不変のクエリ記述子（述語 + 並び順 + セクション）
///
/// 同一性は構造的。等しい Scope は交換可能で、`Store` は異なる Scope を渡されたときだけ再クエリする。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    predicate: Predicate,
    order: Vec<SortKey>,
    section_key: Option<FieldPath>,
}

impl Default for Scope {
    /// 全件、id 順
    fn default() -> Self {
        Self::new(Predicate::All, Vec::new())
    }
}

impl Scope {
    pub fn new(predicate: Predicate, order: Vec<SortKey>) -> Self {
        Self {
            predicate,
            order,
            section_key: None,
        }
    }

    /// エンティティの全件を 1 キーで並べる
    pub fn all(order_by: impl Into<SortKey>) -> Self {
        Self::new(Predicate::All, vec![order_by.into()])
    }

    pub fn all_by(order: Vec<SortKey>) -> Self {
        Self::new(Predicate::All, order)
    }

    /// `key == value` のレコードを 1 キーで並べる
    pub fn where_eq(
        key: impl Into<FieldPath>,
        value: impl Into<Value>,
        order_by: impl Into<SortKey>,
    ) -> Self {
        Self::new(Predicate::eq(key, value), vec![order_by.into()])
    }

    /// 連続するレコードをこのフィールドでグループ化する。
    /// 先頭のソートキーと揃えないと同じセクションが複数回現れる。
    pub fn with_section_key(mut self, field: impl Into<FieldPath>) -> Self {
        self.section_key = Some(field.into());
        self
    }

    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    pub fn order(&self) -> &[SortKey] {
        &self.order
    }

    pub fn section_key(&self) -> Option<&FieldPath> {
        self.section_key.as_ref()
    }

    pub fn matches(&self, doc: &Value) -> bool {
        self.predicate.evaluate(doc)
    }

    /// ソートキーのみで比較
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        self.order
            .iter()
            .map(|key| key.compare(a, b))
            .find(|ordering| ordering.is_ne())
            .unwrap_or(Ordering::Equal)
    }

    /// 全順序: ソートキー → id
    pub fn compare_entries(&self, a_id: &str, a: &Value, b_id: &str, b: &Value) -> Ordering {
        self.compare(a, b).then_with(|| a_id.cmp(b_id))
    }

    pub fn section_of(&self, doc: &Value) -> Option<Value> {
        self.section_key.as_ref().map(|key| key.read(doc).clone())
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        _ => a == b,
    }
}

fn ordered(actual: &Value, expected: &Value, accept: fn(Ordering) -> bool) -> bool {
    if actual.is_null() || expected.is_null() || rank(actual) != rank(expected) {
        return false;
    }
    accept(compare_values(actual, expected))
}

fn rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// JSON 値の全順序: null < bool < number < string < array < object
///
/// 文字列は大文字小文字を無視して比較し、同順位ならバイト列で決める。
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(f64::NAN);
                let y = y.as_f64().unwrap_or(f64::NAN);
                x.total_cmp(&y)
            }
        },
        (Value::String(x), Value::String(y)) => x
            .to_lowercase()
            .cmp(&y.to_lowercase())
            .then_with(|| x.cmp(y)),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y)
            .map(|(l, r)| compare_values(l, r))
            .find(|ordering| ordering.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Value::Object(x), Value::Object(y)) => x.len().cmp(&y.len()).then_with(|| {
            Value::Object(x.clone())
                .to_string()
                .cmp(&Value::Object(y.clone()).to_string())
        }),
        _ => rank(a).cmp(&rank(b)),
    }
}
