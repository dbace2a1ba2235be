//! FetchJob - 1 回分の（fetch → decode → write）
//!
//! # 実行順序
//! 1. リモート取得（CancelSignal でキャンセル可能）
//! 2. 全ページ取得なら next_page をたどる（`SyncConfig::max_pages` まで）
//! 3. 1 トランザクションで write（+ Refresh なら TTL 更新）。ここからはキャンセルしない

use tracing::{debug, info};

use crate::app::environment::Environment;
use crate::app::refresh_scope::CancelSignal;
use crate::app::use_case::{UseCase, WriteMode};
use crate::domain::{PageToken, Record, RefreshOutcome, RefreshResult};

pub(crate) struct FetchJob<M: Record> {
    env: Environment,
    use_case: UseCase<M>,
    mode: WriteMode,
    page: Option<PageToken>,
}

impl<M: Record> FetchJob<M> {
    pub(crate) fn new(
        env: Environment,
        use_case: UseCase<M>,
        mode: WriteMode,
        page: Option<PageToken>,
    ) -> Self {
        Self {
            env,
            use_case,
            mode,
            page,
        }
    }

    pub(crate) async fn run(self, cancel: CancelSignal) -> RefreshResult {
        let Some(request) = self.use_case.request().cloned() else {
            return self.write_local().await;
        };

        let max_pages = self.env.config().max_pages;
        let mut records = Vec::new();
        let mut page = self.page.clone();
        let mut fetched_pages = 0;
        let next_page = loop {
            let payload = cancel
                .guard(self.env.remote().execute(&request, page.as_ref()))
                .await??;
            fetched_pages += 1;
            records.extend(self.use_case.decode_payload(payload.body)?);

            match payload.next_page {
                Some(next) if self.use_case.load_all_pages() && fetched_pages < max_pages => {
                    debug!(request = %request, page = %next, "following next page");
                    page = Some(next);
                }
                next => break next,
            }
        };

        let saved = records.len();
        let use_case = self.use_case.clone();
        let mode = self.mode;
        let now = self.env.clock().now();
        let changes = self
            .env
            .persistent()
            .perform_write(Box::new(move |tx| {
                use_case.write(&records, tx, mode)?;
                if mode == WriteMode::Refresh {
                    use_case.touch(tx, now)?;
                }
                Ok(())
            }))
            .await?;

        let removed = changes
            .for_entity(M::ENTITY)
            .filter(|change| change.is_delete())
            .count();
        info!(
            cache_key = self.use_case.cache_key().map(|k| k.as_str()),
            entity = M::ENTITY,
            pages = fetched_pages,
            saved,
            removed,
            "refresh committed"
        );
        Ok(RefreshOutcome::Fetched {
            saved,
            removed,
            next_page,
            changes,
        })
    }

    async fn write_local(self) -> RefreshResult {
        let use_case = self.use_case.clone();
        let changes = self
            .env
            .persistent()
            .perform_write(Box::new(move |tx| {
                use_case.write(&[], tx, WriteMode::Refresh).map(|_| ())
            }))
            .await?;
        debug!(entity = M::ENTITY, changes = changes.len(), "local use case written");
        Ok(RefreshOutcome::Local { changes })
    }
}
