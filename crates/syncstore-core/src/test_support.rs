//! テスト用のレコード型と組み立てヘルパー

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::app::{Environment, Store, SyncConfig};
use crate::domain::Record;
use crate::impls::{InMemoryPersistentStore, ScriptedRemote};
use crate::ports::{FixedClock, PersistentStore, TransactionExt};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Course {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub term: Option<i64>,
}

impl Record for Course {
    const ENTITY: &'static str = "course";

    fn id(&self) -> &str {
        &self.id
    }
}

pub fn course(id: &str, name: &str, term: i64) -> Course {
    Course {
        id: id.to_string(),
        name: name.to_string(),
        term: Some(term),
    }
}

/// `[{ "id": .., "name": .. }, ...]`
pub fn payload(rows: &[(&str, &str)]) -> Value {
    Value::Array(
        rows.iter()
            .map(|(id, name)| json!({ "id": id, "name": name }))
            .collect(),
    )
}

pub async fn seed(store: &InMemoryPersistentStore, records: Vec<Course>) {
    store
        .perform_write(Box::new(move |tx| tx.save_all(&records).map(|_| ())))
        .await
        .expect("seed write");
}

pub struct Harness {
    pub env: Environment,
    pub persistent: Arc<InMemoryPersistentStore>,
    pub remote: Arc<ScriptedRemote>,
    pub clock: Arc<FixedClock>,
}

pub fn harness() -> Harness {
    harness_with(SyncConfig::default())
}

pub fn harness_with(config: SyncConfig) -> Harness {
    let persistent = Arc::new(InMemoryPersistentStore::new());
    let remote = Arc::new(ScriptedRemote::new());
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
    ));
    let env = Environment::builder()
        .persistent(persistent.clone())
        .remote(remote.clone())
        .clock(clock.clone())
        .config(config)
        .build()
        .expect("environment");
    Harness {
        env,
        persistent,
        remote,
        clock,
    }
}

/// on_change の呼び出し回数を数える
pub fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let hook = {
        let count = count.clone();
        move || {
            count.fetch_add(1, Ordering::SeqCst);
        }
    };
    (count, hook)
}

pub fn names<M: Record>(store: &Store<M>, name: impl Fn(&M) -> String) -> Vec<String> {
    store.records().iter().map(name).collect()
}

/// 条件が成り立つまで待つ（最大 1 秒）
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
