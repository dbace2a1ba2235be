//! RefreshScope - CacheKey ごとの in-flight 操作の重複排除
//!
//! # 学習ポイント
//! - DashMap の entry API で「確認して登録」をアトミックに行う（Leader / Follower）
//! - 結果は watch チャネルで全リスナーに同じものを配る
//! - リスナー数を数え、最後のリスナーが離れたらキャンセル信号を送る
//! - グローバル変数ではなく、注入できるコーディネーター
//!
//! # 状態遷移（CacheKey ごと）
//! - Idle → InFlight: 最初の `run`
//! - InFlight + `run`: リスナーとして参加（ネットワークは 1 回）
//! - InFlight → Idle: 完了（成功・失敗とも）、またはリスナー全員の離脱によるキャンセル

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::debug;

use crate::domain::{CacheKey, OperationId, RefreshResult, SyncError};
use crate::ports::{IdGenerator, SystemClock, UlidGenerator};

/// 共有される（fetch + write）操作 1 件
#[derive(Clone)]
struct SharedOperation {
    id: OperationId,
    listeners: Arc<AtomicUsize>,
    cancel: Arc<watch::Sender<bool>>,
    outcome: watch::Receiver<Option<RefreshResult>>,
}

struct Inner {
    in_flight: DashMap<CacheKey, SharedOperation>,
    ids: Arc<dyn IdGenerator>,
}

/// RefreshScope は in-flight 操作のレジストリ
///
/// clone しても同じレジストリを指す。
#[derive(Clone)]
pub struct RefreshScope {
    inner: Arc<Inner>,
}

impl RefreshScope {
    pub fn new(ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            inner: Arc::new(Inner {
                in_flight: DashMap::new(),
                ids,
            }),
        }
    }

    /// `key` の操作に参加する。なければ `job` を起動する
    ///
    /// `key` が None の操作は登録されない（重複排除なし）。
    /// `job` は参加した場合は呼ばれずに捨てられる。
    pub fn run<F, Fut>(&self, key: Option<CacheKey>, job: F) -> RefreshHandle
    where
        F: FnOnce(CancelSignal) -> Fut,
        Fut: Future<Output = RefreshResult> + Send + 'static,
    {
        let Some(key) = key else {
            let (op, launch) = self.prepare();
            debug!(op = %op.id, "starting unkeyed refresh");
            self.spawn(None, &op, launch, job);
            return self.handle(op, None);
        };

        let (op, launch) = match self.inner.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => {
                let op = entry.get().clone();
                op.listeners.fetch_add(1, Ordering::SeqCst);
                debug!(cache_key = %key, op = %op.id, "joined in-flight refresh");
                return self.handle(op, Some(key));
            }
            Entry::Vacant(entry) => {
                let (op, launch) = self.prepare();
                entry.insert(op.clone());
                (op, launch)
            }
        };

        debug!(cache_key = %key, op = %op.id, "starting refresh");
        self.spawn(Some(key.clone()), &op, launch, job);
        self.handle(op, Some(key))
    }

    pub fn in_flight(&self, key: &CacheKey) -> bool {
        self.inner.in_flight.contains_key(key)
    }

    /// 参加中のリスナー数（in-flight でなければ None）
    pub fn listeners(&self, key: &CacheKey) -> Option<usize> {
        self.inner
            .in_flight
            .get(key)
            .map(|op| op.listeners.load(Ordering::SeqCst))
    }

    pub fn len(&self) -> usize {
        self.inner.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.in_flight.is_empty()
    }

    /// 同じレジストリを指しているか
    pub fn ptr_eq(&self, other: &RefreshScope) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn prepare(&self) -> (SharedOperation, Launch) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let op = SharedOperation {
            id: self.inner.ids.generate_operation_id(),
            listeners: Arc::new(AtomicUsize::new(1)),
            cancel: Arc::new(cancel_tx),
            outcome: outcome_rx,
        };
        (
            op,
            Launch {
                cancel: CancelSignal { rx: cancel_rx },
                outcome: outcome_tx,
            },
        )
    }

    fn spawn<F, Fut>(&self, key: Option<CacheKey>, op: &SharedOperation, launch: Launch, job: F)
    where
        F: FnOnce(CancelSignal) -> Fut,
        Fut: Future<Output = RefreshResult> + Send + 'static,
    {
        let future = job(launch.cancel);
        let inner = self.inner.clone();
        let id = op.id;
        tokio::spawn(async move {
            let result = future.await;
            // 後から来た別の操作を消さないよう id で確認する
            if let Some(key) = &key {
                inner.in_flight.remove_if(key, |_, current| current.id == id);
            }
            debug!(op = %id, ok = result.is_ok(), "refresh finished");
            launch.outcome.send_replace(Some(result));
        });
    }

    fn handle(&self, op: SharedOperation, key: Option<CacheKey>) -> RefreshHandle {
        RefreshHandle {
            op,
            key,
            scope: Arc::downgrade(&self.inner),
        }
    }
}

impl Default for RefreshScope {
    fn default() -> Self {
        Self::new(Arc::new(UlidGenerator::new(SystemClock)))
    }
}

struct Launch {
    cancel: CancelSignal,
    outcome: watch::Sender<Option<RefreshResult>>,
}

/// 操作へのリスナー 1 人分
///
/// 完了前に drop すると離脱。最後のリスナーが離脱すると操作はキャンセルされる。
pub struct RefreshHandle {
    op: SharedOperation,
    key: Option<CacheKey>,
    scope: Weak<Inner>,
}

impl RefreshHandle {
    pub fn operation_id(&self) -> OperationId {
        self.op.id
    }

    /// 終端結果を待つ（全リスナーが同じ結果を受け取る）
    pub async fn wait(mut self) -> RefreshResult {
        match self.op.outcome.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone().unwrap_or(Err(SyncError::Cancelled)),
            // 結果を送らずにタスクが消えた（ランタイム停止など）
            Err(_) => Err(SyncError::Cancelled),
        }
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        if self.op.outcome.borrow().is_some() {
            return;
        }
        if self.op.listeners.fetch_sub(1, Ordering::SeqCst) > 1 {
            return;
        }

        // 参加と離脱が競合しても、remove_if がシャードのロック下でリスナー数を確認する
        let cancel = match (&self.key, self.scope.upgrade()) {
            (Some(key), Some(inner)) => inner
                .in_flight
                .remove_if(key, |_, current| {
                    current.id == self.op.id && current.listeners.load(Ordering::SeqCst) == 0
                })
                .is_some(),
            _ => true,
        };
        if cancel {
            debug!(op = %self.op.id, "last listener left, cancelling refresh");
            self.op.cancel.send_replace(true);
        }
    }
}

/// キャンセル信号の受け手（job 側）
#[derive(Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// キャンセルされるまで待つ
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            // 送信側がいない = もうキャンセルされることはない
            std::future::pending::<()>().await;
        }
    }

    /// `future` をキャンセル可能にする
    pub async fn guard<F: Future>(&self, future: F) -> Result<F::Output, SyncError> {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(SyncError::Cancelled),
            output = future => Ok(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FetchError, RefreshOutcome};
    use std::time::Duration;
    use tokio::sync::{Notify, oneshot};

    fn key(name: &str) -> Option<CacheKey> {
        Some(CacheKey::new(name))
    }

    #[tokio::test]
    async fn concurrent_runs_share_one_job() {
        let scope = RefreshScope::default();
        let started = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let job = |started: Arc<AtomicUsize>, gate: Arc<Notify>| {
            move |_cancel: CancelSignal| async move {
                started.fetch_add(1, Ordering::SeqCst);
                gate.notified().await;
                Ok(RefreshOutcome::Fresh)
            }
        };

        let first = scope.run(key("get-courses"), job(started.clone(), gate.clone()));
        let second = scope.run(key("get-courses"), job(started.clone(), gate.clone()));

        assert_eq!(first.operation_id(), second.operation_id());
        assert_eq!(scope.listeners(&CacheKey::new("get-courses")), Some(2));

        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.notify_one();

        assert_eq!(first.wait().await, Ok(RefreshOutcome::Fresh));
        assert_eq!(second.wait().await, Ok(RefreshOutcome::Fresh));
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert!(scope.is_empty());
    }

    #[tokio::test]
    async fn failures_are_shared_too() {
        let scope = RefreshScope::default();
        let gate = Arc::new(Notify::new());

        let first = scope.run(key("k"), {
            let gate = gate.clone();
            move |_| async move {
                gate.notified().await;
                Err(SyncError::Network(FetchError::Offline))
            }
        });
        let second = scope.run(key("k"), |_| async { Ok(RefreshOutcome::Fresh) });
        gate.notify_one();

        let expected = Err(SyncError::Network(FetchError::Offline));
        assert_eq!(first.wait().await, expected);
        assert_eq!(second.wait().await, expected);
    }

    #[tokio::test]
    async fn unkeyed_runs_are_never_shared() {
        let scope = RefreshScope::default();
        let started = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let started = started.clone();
                scope.run(None, move |_| async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    Ok(RefreshOutcome::Fresh)
                })
            })
            .collect();
        for handle in handles {
            handle.wait().await.unwrap();
        }

        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert!(scope.is_empty());
    }

    #[tokio::test]
    async fn completed_key_starts_a_new_operation() {
        let scope = RefreshScope::default();
        let first = scope.run(key("k"), |_| async { Ok(RefreshOutcome::Fresh) });
        let first_id = first.operation_id();
        first.wait().await.unwrap();
        assert!(!scope.in_flight(&CacheKey::new("k")));

        let second = scope.run(key("k"), |_| async { Ok(RefreshOutcome::Offline) });
        assert_ne!(second.operation_id(), first_id);
        assert_eq!(second.wait().await, Ok(RefreshOutcome::Offline));
    }

    #[tokio::test]
    async fn last_listener_leaving_cancels_the_job() {
        let scope = RefreshScope::default();
        let (tx, rx) = oneshot::channel();

        let handle = scope.run(key("k"), move |cancel| async move {
            let result = cancel.guard(std::future::pending::<()>()).await;
            let _ = tx.send(result.is_err());
            Err(SyncError::Cancelled)
        });
        tokio::task::yield_now().await;

        drop(handle);

        assert!(rx.await.unwrap(), "job observed cancellation");
        assert!(!scope.in_flight(&CacheKey::new("k")));
    }

    #[tokio::test]
    async fn remaining_listener_keeps_the_job_alive() {
        let scope = RefreshScope::default();
        let gate = Arc::new(Notify::new());

        let first = scope.run(key("k"), {
            let gate = gate.clone();
            move |cancel| async move {
                match cancel.guard(gate.notified()).await {
                    Ok(()) => Ok(RefreshOutcome::Fresh),
                    Err(error) => Err(error),
                }
            }
        });
        let second = scope.run(key("k"), |_| async { Ok(RefreshOutcome::Offline) });

        drop(first);
        assert_eq!(scope.listeners(&CacheKey::new("k")), Some(1));

        gate.notify_one();
        assert_eq!(second.wait().await, Ok(RefreshOutcome::Fresh));
    }

    #[tokio::test]
    async fn cancel_signal_guard_passes_output_through() {
        let (_tx, rx) = watch::channel(false);
        let signal = CancelSignal { rx };
        assert!(!signal.is_cancelled());
        assert_eq!(signal.guard(async { 7 }).await, Ok(7));
    }
}
