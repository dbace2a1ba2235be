//! Store - UseCase の Scope を永続ストア上で「生きた」コレクションにしたもの
//!
//! # 学習ポイント
//! - 購読 → クエリの順で始める（間に入ったコミットを取りこぼさない）
//! - 変更通知は別タスクで受け、Weak 参照で Store の寿命に従う
//! - 差分適用: 変更された id を取り除き、マッチするものを `partition_point` でソート位置に挿入
//!   → 観測者がソートされていない途中状態を見ることはない
//! - refresh の完了時は Commit の after イメージではなく、永続ストアの現在値で触れた id を反映する
//!   （間に別の書き込みがあっても古い値で上書きしない）
//! - 通知タスクには世代番号を付け、Scope を差し替えたら古い世代の ChangeSet は捨てる
//! - Store の drop で通知タスクと完了待ちタスクを abort（最後のリスナーなら取得もキャンセル）

use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::app::environment::Environment;
use crate::app::refresh_scope::RefreshHandle;
use crate::app::use_case::{UseCase, WriteMode};
use crate::domain::record::from_document;
use crate::domain::{
    ChangeSet, Commit, Document, PageToken, Record, RefreshOutcome, RefreshResult, Scope,
    SyncError,
};
use crate::ports::PersistentStore;

type ChangeHook = Box<dyn Fn() + Send + Sync>;

struct Entry<M> {
    id: String,
    body: Value,
    record: M,
}

struct StoreState<M> {
    entries: Vec<Entry<M>>,
    /// entries を並べている Scope
    scope: Scope,
    /// 通知タスクの世代（Scope の差し替えごとに増える）
    generation: u64,
    /// 実行中の refresh / next_page の数
    pending: usize,
    error: Option<SyncError>,
    next_page: Option<PageToken>,
}

struct Shared<M: Record> {
    env: Environment,
    use_case: RwLock<UseCase<M>>,
    state: RwLock<StoreState<M>>,
    on_change: ChangeHook,
    revision: watch::Sender<u64>,
}

/// Store はフィーチャーが見るライブなコレクション
///
/// `Environment::subscribe` で作る。tokio ランタイム上で使うこと。
pub struct Store<M: Record> {
    shared: Arc<Shared<M>>,
    watcher: Mutex<JoinHandle<()>>,
    completions: Mutex<Vec<JoinHandle<()>>>,
}

/// セクション 1 つ（`Scope::with_section_key` の値が等しい連続したレコード）
#[derive(Debug, Clone, PartialEq)]
pub struct Section<M> {
    pub key: Value,
    pub records: Vec<M>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fetch {
    Refresh,
    NextPage,
}

impl<M: Record> Store<M> {
    pub(crate) fn subscribe(
        env: Environment,
        use_case: UseCase<M>,
        on_change: ChangeHook,
    ) -> Result<Self, SyncError> {
        let (revision, _) = watch::channel(0);
        let scope = use_case.scope().clone();
        let shared = Arc::new(Shared {
            env,
            use_case: RwLock::new(use_case),
            state: RwLock::new(StoreState {
                entries: Vec::new(),
                scope,
                generation: 0,
                pending: 0,
                error: None,
                next_page: None,
            }),
            on_change,
            revision,
        });
        let watcher = shared.observe()?;
        shared.notify();
        Ok(Self {
            shared,
            watcher: Mutex::new(watcher),
            completions: Mutex::new(Vec::new()),
        })
    }

    /// リモートから取り直す
    ///
    /// 次の場合はネットワークに出ない:
    /// - オフラインモード（`Offline`）。ローカル UseCase はオフラインでも書き込む
    /// - `force == false` で TTL 内（`Fresh`）
    ///
    /// 同じ CacheKey の取得が実行中なら、それに参加する（`force` でも重複排除は外れない）。
    pub fn refresh(&self, force: bool) -> RefreshTicket {
        let env = &self.shared.env;
        let use_case = self.shared.use_case().clone();
        if env.config().offline && !use_case.is_local() {
            debug!(entity = M::ENTITY, "offline, serving local data");
            return RefreshTicket::ready(Ok(RefreshOutcome::Offline));
        }

        if !force && !use_case.is_local() {
            let expired = use_case.is_expired(
                env.persistent(),
                env.clock().now(),
                env.config().default_ttl(),
            );
            match expired {
                Ok(true) => {}
                Ok(false) => {
                    debug!(
                        cache_key = use_case.cache_key().map(|k| k.as_str()),
                        "cache is fresh, skipping fetch"
                    );
                    return RefreshTicket::ready(Ok(RefreshOutcome::Fresh));
                }
                Err(error) => {
                    let error = SyncError::from(error);
                    self.shared.fail(&error);
                    return RefreshTicket::ready(Err(error));
                }
            }
        }

        let key = use_case.cache_key().cloned();
        let handle = env.launch(use_case, WriteMode::Refresh, None, key);
        self.track(handle, Fetch::Refresh)
    }

    /// 前回の取得が返した次ページを取得して追記する（stale GC も TTL 更新もしない）
    ///
    /// カーソルがなければ何もしない（`Exhausted`）。
    pub fn next_page(&self) -> RefreshTicket {
        let Some(token) = self.next_page_token() else {
            return RefreshTicket::ready(Ok(RefreshOutcome::Exhausted));
        };
        let env = &self.shared.env;
        if env.config().offline {
            return RefreshTicket::ready(Ok(RefreshOutcome::Offline));
        }

        let use_case = self.shared.use_case().clone();
        let key = use_case.cache_key().map(|key| key.page(&token));
        let handle = env.launch(use_case, WriteMode::NextPage, Some(token), key);
        self.track(handle, Fetch::NextPage)
    }

    fn track(&self, handle: RefreshHandle, kind: Fetch) -> RefreshTicket {
        self.shared.state_mut().pending += 1;
        self.shared.notify();

        let (tx, rx) = oneshot::channel();
        let shared = Arc::downgrade(&self.shared);
        let task = tokio::spawn(async move {
            let result = handle.wait().await;
            if let Some(shared) = shared.upgrade() {
                shared.complete(kind, &result);
            }
            let _ = tx.send(result);
        });

        let mut completions = self
            .completions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        completions.retain(|task| !task.is_finished());
        completions.push(task);

        RefreshTicket {
            inner: Ticket::Waiting(rx),
        }
    }

    /// Scope を差し替える。等しい Scope なら何もしない
    pub fn set_scope(&self, scope: Scope) -> Result<(), SyncError> {
        if *self.shared.use_case().scope() == scope {
            return Ok(());
        }
        self.shared
            .use_case
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_scope(scope);

        let watcher = self.shared.observe()?;
        let previous = std::mem::replace(
            &mut *self.watcher.lock().unwrap_or_else(PoisonError::into_inner),
            watcher,
        );
        previous.abort();
        self.shared.notify();
        Ok(())
    }

    pub fn scope(&self) -> Scope {
        self.shared.use_case().scope().clone()
    }

    pub fn use_case(&self) -> UseCase<M> {
        self.shared.use_case().clone()
    }

    /// refresh / next_page の取得中か
    pub fn pending(&self) -> bool {
        self.shared.state().pending > 0
    }

    /// 直近の失敗（次に取得が成功するとクリアされる）
    pub fn error(&self) -> Option<SyncError> {
        self.shared.state().error.clone()
    }

    pub fn next_page_token(&self) -> Option<PageToken> {
        self.shared.state().next_page.clone()
    }

    pub fn has_next_page(&self) -> bool {
        self.shared.state().next_page.is_some()
    }

    pub fn len(&self) -> usize {
        self.shared.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.state().entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<M> {
        self.shared
            .state()
            .entries
            .get(index)
            .map(|entry| entry.record.clone())
    }

    pub fn first(&self) -> Option<M> {
        self.get(0)
    }

    pub fn last(&self) -> Option<M> {
        self.shared
            .state()
            .entries
            .last()
            .map(|entry| entry.record.clone())
    }

    pub fn records(&self) -> Vec<M> {
        self.shared
            .state()
            .entries
            .iter()
            .map(|entry| entry.record.clone())
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.shared
            .state()
            .entries
            .iter()
            .map(|entry| entry.id.clone())
            .collect()
    }

    /// セクションキーの値が等しい連続したレコードをまとめる
    ///
    /// セクションキーがない Scope では全体が 1 セクション（キーは null）。
    pub fn sections(&self) -> Vec<Section<M>> {
        let state = self.shared.state();
        let mut sections: Vec<Section<M>> = Vec::new();
        for entry in &state.entries {
            let key = state.scope.section_of(&entry.body).unwrap_or(Value::Null);
            match sections.last_mut() {
                Some(section) if section.key == key => section.records.push(entry.record.clone()),
                _ => sections.push(Section {
                    key,
                    records: vec![entry.record.clone()],
                }),
            }
        }
        sections
    }

    /// 変化のたびに増えるリビジョン（非同期で待つ観測者向け）
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    pub fn is_expired(&self) -> Result<bool, SyncError> {
        let env = &self.shared.env;
        Ok(self.shared.use_case().is_expired(
            env.persistent(),
            env.clock().now(),
            env.config().default_ttl(),
        )?)
    }
}

impl<M: Record> Drop for Store<M> {
    fn drop(&mut self) {
        self.watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .abort();
        for task in self
            .completions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

impl<M: Record> fmt::Debug for Store<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state();
        f.debug_struct("Store")
            .field("entity", &M::ENTITY)
            .field("len", &state.entries.len())
            .field("pending", &state.pending)
            .field("error", &state.error)
            .field("next_page", &state.next_page)
            .finish()
    }
}

impl<M: Record> Shared<M> {
    fn use_case(&self) -> RwLockReadGuard<'_, UseCase<M>> {
        self.use_case.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> RwLockReadGuard<'_, StoreState<M>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, StoreState<M>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// 通知の購読を始め、現在の内容で entries を埋め、通知タスクを起動する
    fn observe(self: &Arc<Self>) -> Result<JoinHandle<()>, SyncError> {
        let scope = self.use_case().scope().clone();
        let persistent = self.env.persistent();

        let mut stream = persistent.observe_changes(M::ENTITY, scope.clone());
        let entries = persistent
            .query(M::ENTITY, &scope)?
            .into_iter()
            .map(decode_entry)
            .collect::<Result<Vec<_>, SyncError>>()?;
        debug!(entity = M::ENTITY, len = entries.len(), "store populated");
        let generation = {
            let mut state = self.state_mut();
            state.entries = entries;
            state.scope = scope;
            state.generation += 1;
            state.generation
        };

        let shared = Arc::downgrade(self);
        Ok(tokio::spawn(async move {
            while let Some(set) = stream.recv().await {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                shared.apply(&set, generation);
            }
        }))
    }

    fn apply(&self, set: &ChangeSet, generation: u64) {
        if set.is_empty() {
            return;
        }
        {
            let mut state = self.state_mut();
            if state.generation != generation {
                debug!(entity = M::ENTITY, generation, "dropping changes for a replaced scope");
                return;
            }
            let scope = state.scope.clone();
            apply_change_set(&mut state, &scope, set);
        }
        debug!(entity = M::ENTITY, changed = set.len(), "store applied changes");
        self.notify();
    }

    fn complete(&self, kind: Fetch, result: &RefreshResult) {
        {
            let mut state = self.state_mut();
            state.pending = state.pending.saturating_sub(1);
            match result {
                Ok(outcome) => {
                    if let Some(commit) = outcome.changes() {
                        match current_values(self.env.persistent(), M::ENTITY, commit) {
                            Ok(set) => {
                                let scope = state.scope.clone();
                                apply_change_set(&mut state, &scope, &set);
                                state.error = None;
                            }
                            Err(error) => {
                                warn!(entity = M::ENTITY, ?kind, error = %error, "re-read failed");
                                state.error = Some(error);
                            }
                        }
                    }
                    if let RefreshOutcome::Fetched { next_page, .. } = outcome {
                        state.next_page = next_page.clone();
                    }
                }
                Err(error) => {
                    warn!(entity = M::ENTITY, ?kind, error = %error, "refresh failed");
                    state.error = Some(error.clone());
                }
            }
        }
        self.notify();
    }

    fn fail(&self, error: &SyncError) {
        warn!(entity = M::ENTITY, error = %error, "refresh failed");
        self.state_mut().error = Some(error.clone());
        self.notify();
    }

    fn notify(&self) {
        self.revision.send_modify(|revision| *revision += 1);
        (self.on_change)();
    }
}

/// Commit が触れた id の「今の」値を読み直す
///
/// state の書き込みロックを持ったまま呼ぶ。読んだ後のコミットは通知タスクが後から反映する。
fn current_values(
    persistent: &dyn PersistentStore,
    entity: &str,
    commit: &Commit,
) -> Result<ChangeSet, SyncError> {
    let mut set = ChangeSet::new(entity);
    let mut seen = HashSet::new();
    for change in commit.for_entity(entity) {
        if !seen.insert(change.id.as_str()) {
            continue;
        }
        match persistent.get(entity, &change.id)? {
            Some(body) => set.updated.push(Document::new(change.id.clone(), body)),
            None => set.deleted.push(change.id.clone()),
        }
    }
    Ok(set)
}

fn decode_entry<M: Record>(doc: Document) -> Result<Entry<M>, SyncError> {
    let record = from_document(doc.body.clone())?;
    Ok(Entry {
        id: doc.id,
        body: doc.body,
        record,
    })
}

/// 変更を取り除いてから、マッチするものをソート位置に入れ直す
fn apply_change_set<M: Record>(state: &mut StoreState<M>, scope: &Scope, set: &ChangeSet) {
    let touched: HashSet<&str> = set.touched().collect();
    state
        .entries
        .retain(|entry| !touched.contains(entry.id.as_str()));

    for doc in set.inserted.iter().chain(&set.updated) {
        if !scope.matches(&doc.body) {
            continue;
        }
        match decode_entry::<M>(doc.clone()) {
            Ok(entry) => {
                let at = state.entries.partition_point(|existing| {
                    scope
                        .compare_entries(&existing.id, &existing.body, &entry.id, &entry.body)
                        .is_lt()
                });
                state.entries.insert(at, entry);
            }
            Err(error) => {
                warn!(entity = M::ENTITY, id = %doc.id, error = %error, "skipping undecodable record");
                state.error = Some(error);
            }
        }
    }
}

enum Ticket {
    Ready(RefreshResult),
    Waiting(oneshot::Receiver<RefreshResult>),
}

/// refresh / next_page の結果を受け取るチケット
///
/// 解決した時点で Store の状態には結果が反映済み。drop しても取得はキャンセルされない。
pub struct RefreshTicket {
    inner: Ticket,
}

impl RefreshTicket {
    fn ready(result: RefreshResult) -> Self {
        Self {
            inner: Ticket::Ready(result),
        }
    }

    pub async fn outcome(self) -> RefreshResult {
        match self.inner {
            Ticket::Ready(result) => result,
            Ticket::Waiting(rx) => rx.await.unwrap_or(Err(SyncError::Cancelled)),
        }
    }
}
