//! Environment - ports と RefreshScope と設定の束
//!
//! フィーチャー側の入り口は `subscribe` だけ。Store はここから生まれる。

use std::sync::Arc;
use tracing::debug;

use crate::app::builder::EnvironmentBuilder;
use crate::app::config::SyncConfig;
use crate::app::fetch::FetchJob;
use crate::app::refresh_scope::{RefreshHandle, RefreshScope};
use crate::app::store::Store;
use crate::app::use_case::{UseCase, WriteMode};
use crate::domain::{CacheKey, PageToken, Record, SyncError};
use crate::ports::{Clock, PersistentStore, PersistentStoreExt, RemoteFetch};

struct EnvironmentInner {
    persistent: Arc<dyn PersistentStore>,
    remote: Arc<dyn RemoteFetch>,
    refresh_scope: RefreshScope,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
}

/// Environment は同期エンジンのコンテキスト（clone は安価）
#[derive(Clone)]
pub struct Environment {
    inner: Arc<EnvironmentInner>,
}

impl Environment {
    pub(crate) fn new(
        persistent: Arc<dyn PersistentStore>,
        remote: Arc<dyn RemoteFetch>,
        refresh_scope: RefreshScope,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EnvironmentInner {
                persistent,
                remote,
                refresh_scope,
                clock,
                config,
            }),
        }
    }

    pub fn builder() -> EnvironmentBuilder {
        EnvironmentBuilder::new()
    }

    pub fn persistent(&self) -> &dyn PersistentStore {
        self.inner.persistent.as_ref()
    }

    pub fn remote(&self) -> &dyn RemoteFetch {
        self.inner.remote.as_ref()
    }

    pub fn refresh_scope(&self) -> &RefreshScope {
        &self.inner.refresh_scope
    }

    pub fn clock(&self) -> &dyn Clock {
        self.inner.clock.as_ref()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// UseCase を購読して Store を作る
    ///
    /// Store は永続ストアの現在の内容で即座に埋まる。`on_change` は以後のすべての変化で呼ばれる。
    pub fn subscribe<M: Record>(
        &self,
        use_case: UseCase<M>,
        on_change: impl Fn() + Send + Sync + 'static,
    ) -> Result<Store<M>, SyncError> {
        Store::subscribe(self.clone(), use_case, Box::new(on_change))
    }

    /// コールバックなしで購読（`Store::changes` で待つ場合）
    pub fn observe<M: Record>(&self, use_case: UseCase<M>) -> Result<Store<M>, SyncError> {
        Store::subscribe(self.clone(), use_case, Box::new(|| {}))
    }

    /// キャッシュが期限切れ（またはキャッシュ無視）なら取得してから、Scope 内のレコードを返す
    ///
    /// 取得は Store と同じ RefreshScope を通るので、同じキーの refresh と重複しない。
    /// オフラインモードとローカル UseCase はネットワークに出ない。
    /// `load_all_pages` なら UseCase の設定に関係なく全ページをたどる。
    pub async fn fetch_entities<M: Record>(
        &self,
        use_case: UseCase<M>,
        ignore_cache: bool,
        load_all_pages: bool,
    ) -> Result<Vec<M>, SyncError> {
        let use_case = if load_all_pages {
            use_case.with_all_pages()
        } else {
            use_case
        };
        if !self.config().offline && !use_case.is_local() {
            let expired = use_case.is_expired(
                self.persistent(),
                self.clock().now(),
                self.config().default_ttl(),
            )?;
            if ignore_cache || expired {
                let key = use_case.cache_key().cloned();
                self.launch(use_case.clone(), WriteMode::Refresh, None, key)
                    .wait()
                    .await?;
            } else {
                debug!(entity = M::ENTITY, "serving fresh cache");
            }
        }
        self.entities_from_database(&use_case)
    }

    /// 永続ストアだけを読む
    pub fn entities_from_database<M: Record>(
        &self,
        use_case: &UseCase<M>,
    ) -> Result<Vec<M>, SyncError> {
        Ok(self.persistent().query_records::<M>(use_case.scope())?)
    }

    pub(crate) fn launch<M: Record>(
        &self,
        use_case: UseCase<M>,
        mode: WriteMode,
        page: Option<PageToken>,
        key: Option<CacheKey>,
    ) -> RefreshHandle {
        let job = FetchJob::new(self.clone(), use_case, mode, page);
        self.refresh_scope().run(key, move |cancel| job.run(cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FetchError;
    use crate::ports::RequestDescriptor;
    use crate::domain::Scope;
    use crate::test_support::{Course, course, harness, harness_with, payload, seed};
    use std::time::Duration;

    fn get_courses() -> UseCase<Course> {
        UseCase::collection(
            "get-courses",
            RequestDescriptor::get("/courses"),
            Scope::all("name"),
        )
    }

    #[tokio::test]
    async fn fetch_entities_loads_then_reads_back() {
        let h = harness();
        h.remote
            .respond("/courses", payload(&[("2", "Biology"), ("1", "Algebra")]));

        let courses = h.env.fetch_entities(get_courses(), false, false).await.unwrap();

        let names: Vec<&str> = courses.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["Algebra", "Biology"]);
        assert_eq!(h.remote.calls(), 1);
    }

    #[tokio::test]
    async fn fetch_entities_respects_ttl_unless_ignoring_cache() {
        let h = harness();
        h.remote.respond("/courses", payload(&[("1", "Algebra")]));
        let use_case = get_courses().with_ttl(Duration::from_secs(3600));

        h.env.fetch_entities(use_case.clone(), false, false).await.unwrap();
        h.env.fetch_entities(use_case.clone(), false, false).await.unwrap();
        assert_eq!(h.remote.calls(), 1);

        h.env.fetch_entities(use_case.clone(), true, false).await.unwrap();
        assert_eq!(h.remote.calls(), 2);

        h.clock.advance(chrono::Duration::hours(2));
        h.env.fetch_entities(use_case, false, false).await.unwrap();
        assert_eq!(h.remote.calls(), 3);
    }

    #[tokio::test]
    async fn fetch_entities_can_follow_every_page() {
        let h = harness();
        h.remote
            .respond_page("/courses", None, payload(&[("1", "Algebra")]), Some("2"));
        h.remote
            .respond_page("/courses", Some("2"), payload(&[("2", "Biology")]), None);

        let first_page = h.env.fetch_entities(get_courses(), true, false).await.unwrap();
        assert_eq!(first_page.len(), 1);

        let every_page = h.env.fetch_entities(get_courses(), true, true).await.unwrap();
        let names: Vec<&str> = every_page.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["Algebra", "Biology"]);
        assert_eq!(h.remote.calls(), 3);
    }

    #[tokio::test]
    async fn fetch_entities_surfaces_network_errors() {
        let h = harness();
        h.remote.fail("/courses", FetchError::Timeout(Duration::from_secs(30)));

        let err = h.env.fetch_entities(get_courses(), false, false).await.unwrap_err();
        assert!(matches!(err, SyncError::Network(FetchError::Timeout(_))));
    }

    #[tokio::test]
    async fn offline_mode_reads_database_only() {
        let h = harness_with(SyncConfig::default().with_offline(true));
        seed(&h.persistent, vec![course("1", "Algebra", 1)]).await;

        let courses = h.env.fetch_entities(get_courses(), true, true).await.unwrap();

        assert_eq!(courses.len(), 1);
        assert_eq!(h.remote.calls(), 0);
    }
}
