use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{DefaultBodyLimit, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use tracing::{info, warn};

use common::{Envelope, IdGenerator, UuidGenerator};
use metastore::MetaStore;

mod files;
mod report;


#[derive(Debug, Parser)]
#[command(name = "flockfs-storage")]
#[command(about = "Storage node for the flockfs distributed file store")]
struct Cli {
    #[arg(long, default_value = "127.0.0.1:7801")]
    bind: String,
    #[arg(long, default_value = "http")]
    scheme: String,
    /// Replication group this node belongs to.
    #[arg(long)]
    group: String,
    /// Root directory for stored file bytes.
    #[arg(long, default_value = "./data/storage/files")]
    storage_dir: PathBuf,
    /// Directory holding the file metadata store.
    #[arg(long, default_value = "./data/storage/meta")]
    data_dir: PathBuf,
    /// Tracker base urls, comma separated, e.g. http://127.0.0.1:7700.
    #[arg(long, value_delimiter = ',')]
    trackers: Vec<String>,
    /// Maximum accepted upload size in bytes, 0 means unlimited.
    #[arg(long, default_value_t = 0)]
    file_size_limit: u64,
    #[arg(long, default_value_t = 5)]
    report_interval_secs: u64,
}

#[derive(Clone)]
pub(crate) struct NodeState {
    pub(crate) group: String,
    pub(crate) scheme: String,
    /// host:port other nodes reach this one at; reported to trackers and
    /// embedded in generated file urls.
    pub(crate) advertised_addr: String,
    pub(crate) storage_dir: PathBuf,
    pub(crate) meta: MetaStore,
    pub(crate) trackers: Arc<Vec<String>>,
    pub(crate) file_size_limit: u64,
    pub(crate) http: reqwest::Client,
    pub(crate) ids: Arc<dyn IdGenerator>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    std::fs::create_dir_all(&cli.storage_dir)
        .with_context(|| format!("failed to create storage root {}", cli.storage_dir.display()))?;
    let meta = MetaStore::open(&cli.data_dir).context("failed to open file metadata store")?;

    if cli.trackers.is_empty() {
        warn!("no trackers configured, this node will not join a cluster");
    }

    let state = NodeState {
        group: cli.group.clone(),
        scheme: cli.scheme,
        advertised_addr: cli.bind.clone(),
        storage_dir: cli.storage_dir,
        meta,
        trackers: Arc::new(cli.trackers),
        file_size_limit: cli.file_size_limit,
        http: reqwest::Client::new(),
        ids: Arc::new(UuidGenerator),
    };

    report::spawn_report_task(state.clone(), cli.report_interval_secs);

    let app = router(state);

    let bind_addr: SocketAddr = cli.bind.parse().context("invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .context("failed to bind storage port")?;
    info!(%bind_addr, group = %cli.group, "storage node listening");

    axum::serve(listener, app).await?;

    Ok(())
}

pub(crate) fn router(state: NodeState) -> Router {
    // The storage root is served under the group name so replicas can fetch
    // replicated files from each other with plain GETs.
    let group_route = format!("/{}/{{*path}}", state.group);

    Router::new()
        .route("/hello", get(hello))
        .route("/v1/upload", post(files::quick_upload))
        .route("/sync", post(files::apply_sync))
        .route("/download", get(files::download))
        .route(&group_route, get(files::serve_group_file))
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

async fn hello(State(state): State<NodeState>) -> Json<Envelope> {
    Json(Envelope::ok_empty(format!(
        "hello flockfs storage, group {}",
        state.group
    )))
}
