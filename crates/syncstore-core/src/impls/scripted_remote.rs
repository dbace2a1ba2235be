//! ScriptedRemote - 台本どおりに応答する RemoteFetch
//!
//! # 学習ポイント
//! - (path, page) ごとに「固定の応答」と「1 回限りの応答キュー」を持つ
//! - watch チャネルのゲートで応答を保留できる（hold / release）
//!   → 「同じキーで 2 回 refresh しても fetch は 1 回」を決定的にテストできる
//! - 呼び出し回数とリクエストを記録

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use crate::domain::{FetchError, PageToken};
use crate::ports::{RemoteFetch, RemotePayload, RequestDescriptor};

type Reply = Result<RemotePayload, FetchError>;
type RouteKey = (String, Option<String>);

#[derive(Default)]
struct Route {
    sticky: Option<Reply>,
    queued: VecDeque<Reply>,
}

impl Route {
    fn next(&mut self) -> Option<Reply> {
        self.queued.pop_front().or_else(|| self.sticky.clone())
    }
}

/// ScriptedRemote はテストとデモ用の RemoteFetch 実装
///
/// # 使用例
/// ```ignore
/// let remote = ScriptedRemote::new();
/// remote.respond_page("/courses", None, json!([...]), Some("2"));
/// remote.respond_page("/courses", Some("2"), json!([...]), None);
/// ```
pub struct ScriptedRemote {
    routes: Mutex<HashMap<RouteKey, Route>>,
    requests: Mutex<Vec<(RequestDescriptor, Option<PageToken>)>>,
    gate: watch::Sender<bool>,
    latency: Mutex<Option<Duration>>,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            routes: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            gate,
            latency: Mutex::new(None),
        }
    }

    /// 1 ページ目に常に `body` を返す
    pub fn respond(&self, path: &str, body: Value) {
        self.respond_page(path, None, body, None);
    }

    /// `page` に対して常に `body` を返し、`next` を次ページとして伝える
    pub fn respond_page(&self, path: &str, page: Option<&str>, body: Value, next: Option<&str>) {
        let payload = RemotePayload {
            body,
            next_page: next.map(PageToken::from),
        };
        self.route(path, page, |route| route.sticky = Some(Ok(payload)));
    }

    /// 1 ページ目に常に失敗する
    pub fn fail(&self, path: &str, error: FetchError) {
        self.route(path, None, |route| route.sticky = Some(Err(error)));
    }

    /// 固定の応答より先に 1 回だけ返す応答を積む
    pub fn enqueue(&self, path: &str, page: Option<&str>, reply: Reply) {
        self.route(path, page, |route| route.queued.push_back(reply));
    }

    /// release されるまで応答を保留する
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// 受け付けたリクエストの総数（保留中のものも含む）
    pub fn calls(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn calls_for(&self, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(request, _)| request.path == path)
            .count()
    }

    pub fn requests(&self) -> Vec<(RequestDescriptor, Option<PageToken>)> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn route(&self, path: &str, page: Option<&str>, edit: impl FnOnce(&mut Route)) {
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (path.to_string(), page.map(str::to_string));
        edit(routes.entry(key).or_default());
    }
}

impl Default for ScriptedRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RemoteFetch for ScriptedRemote {
    async fn execute(
        &self,
        request: &RequestDescriptor,
        page: Option<&PageToken>,
    ) -> Result<RemotePayload, FetchError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((request.clone(), page.cloned()));
        debug!(request = %request, page = ?page.map(PageToken::as_str), "scripted request");

        let mut gate = self.gate.subscribe();
        gate.wait_for(|open| *open)
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let key = (request.path.clone(), page.map(|p| p.as_str().to_string()));
        let reply = self
            .routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&key)
            .and_then(Route::next);
        reply.unwrap_or_else(|| {
            Err(FetchError::Status {
                status: 404,
                message: format!("no scripted response for {request}"),
            })
        })
    }
}
