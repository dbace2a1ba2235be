//! syncstore デモ
//!
//! 台本どおりに応答するリモートとインメモリストアで、同期エンジンの流れを一通り動かす。
//!
//! ```bash
//! cargo run -p syncstore-cli -- --pages 3 --latency-ms 200
//! RUST_LOG=syncstore_core=debug cargo run -p syncstore-cli -- --offline
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use syncstore_core::app::{Environment, Store, SyncConfig, UseCase};
use syncstore_core::domain::{FetchError, PageToken, Record, RefreshOutcome, Scope};
use syncstore_core::impls::{InMemoryPersistentStore, ScriptedRemote};
use syncstore_core::ports::{
    PersistentStore, RemoteFetch, RemotePayload, RequestDescriptor, TransactionExt,
};

const SUBJECTS: &[&str] = &[
    "Zoology", "Algebra", "Music", "Biology", "Latin", "Chemistry", "Drama", "Economics",
    "French", "Geometry", "History", "Ethics",
];
const PAGE_SIZE: usize = 4;

/// syncstore demo: two stores share one refresh, then page through the collection
#[derive(Parser, Debug)]
#[command(name = "syncstore")]
#[command(version, about, long_about = None)]
struct Args {
    /// Serve local data only (overrides SYNCSTORE_OFFLINE)
    #[arg(long)]
    offline: bool,

    /// Default cache TTL in seconds (overrides SYNCSTORE_DEFAULT_TTL_SECS)
    #[arg(long)]
    ttl_secs: Option<u64>,

    /// Number of pages the scripted server returns
    #[arg(long, default_value_t = 3)]
    pages: usize,

    /// Simulated network latency per request
    #[arg(long, default_value_t = 100)]
    latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Course {
    id: String,
    name: String,
}

impl Record for Course {
    const ENTITY: &'static str = "course";

    fn id(&self) -> &str {
        &self.id
    }
}

/// リクエストごとにログを出す RemoteFetch
struct LoggingRemote<R> {
    inner: R,
}

#[async_trait]
impl<R: RemoteFetch> RemoteFetch for LoggingRemote<R> {
    async fn execute(
        &self,
        request: &RequestDescriptor,
        page: Option<&PageToken>,
    ) -> Result<RemotePayload, FetchError> {
        info!(%request, page = page.map(PageToken::as_str), "-> remote");
        let result = self.inner.execute(request, page).await;
        match &result {
            Ok(payload) => info!(
                next_page = payload.next_page.as_ref().map(PageToken::as_str),
                "<- remote ok"
            ),
            Err(error) => info!(%error, "<- remote failed"),
        }
        result
    }
}

fn script(remote: &ScriptedRemote, pages: usize, latency: Duration) {
    remote.set_latency(Some(latency));
    let chunks: Vec<_> = SUBJECTS.chunks(PAGE_SIZE).take(pages.max(1)).collect();
    for (index, chunk) in chunks.iter().enumerate() {
        let body = Value::Array(
            chunk
                .iter()
                .enumerate()
                .map(|(offset, name)| {
                    json!({
                        "id": format!("course-{}", index * PAGE_SIZE + offset),
                        "name": name,
                    })
                })
                .collect(),
        );
        let page = (index > 0).then(|| (index + 1).to_string());
        let next = (index + 1 < chunks.len()).then(|| (index + 2).to_string());
        remote.respond_page("/courses", page.as_deref(), body, next.as_deref());
    }
}

fn print_store(label: &str, store: &Store<Course>) {
    let names: Vec<String> = store.records().into_iter().map(|c| c.name).collect();
    println!(
        "{label}: {} courses (next page: {}) {:?}",
        names.len(),
        store
            .next_page_token()
            .map_or_else(|| "-".to_string(), |token| token.to_string()),
        names
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    let mut config = SyncConfig::from_env().context("reading SYNCSTORE_* environment")?;
    if args.offline {
        config = config.with_offline(true);
    }
    if let Some(ttl) = args.ttl_secs {
        config = config.with_default_ttl(Duration::from_secs(ttl));
    }
    info!(?config, "starting");

    let remote = ScriptedRemote::new();
    script(&remote, args.pages, Duration::from_millis(args.latency_ms));

    // 前回のセッションで保存された（今はもうサーバーにない）レコード
    let persistent = Arc::new(InMemoryPersistentStore::new());
    persistent
        .perform_write(Box::new(|tx| {
            tx.save(&Course {
                id: "course-legacy".into(),
                name: "Astronomy".into(),
            })
        }))
        .await?;

    let env = Environment::builder()
        .persistent(persistent)
        .remote(Arc::new(LoggingRemote { inner: remote }))
        .config(config)
        .build()?;

    let use_case = UseCase::<Course>::collection(
        "get-courses",
        RequestDescriptor::get("/courses"),
        Scope::all("name"),
    );
    let list = env.subscribe(use_case.clone(), || {})?;
    let badge = env.observe(use_case)?;
    print_store("cached", &list);

    // 同じキーの refresh は 1 回の取得にまとまる
    let (first, second) = tokio::join!(list.refresh(false).outcome(), badge.refresh(false).outcome());
    info!(list = ?first.as_ref().map(outcome_label), badge = ?second.as_ref().map(outcome_label), "refreshed");
    first?;
    second?;
    print_store("page 1", &list);

    let mut page = 1;
    loop {
        match list.next_page().outcome().await? {
            RefreshOutcome::Exhausted | RefreshOutcome::Offline => break,
            _ => {
                page += 1;
                print_store(&format!("page {page}"), &list);
            }
        }
    }

    let again = list.refresh(false).outcome().await?;
    println!("refresh again: {}", outcome_label(&again));
    print_store("final", &badge);
    Ok(())
}

fn outcome_label(outcome: &RefreshOutcome) -> &'static str {
    match outcome {
        RefreshOutcome::Fetched { .. } => "fetched",
        RefreshOutcome::Fresh => "fresh",
        RefreshOutcome::Offline => "offline",
        RefreshOutcome::Local { .. } => "local",
        RefreshOutcome::Exhausted => "exhausted",
    }
}
