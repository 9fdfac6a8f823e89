use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{ConnectInfo, DefaultBodyLimit, Query, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::Deserialize;
use tracing::{error, info, warn};

use common::{
    crc32, header, split_file_path, ApiCode, Envelope, IdGenerator, IpHash, NodeErrorReport,
    StatusReport, SyncAction, SyncCommand, UuidGenerator,
};
use metastore::MetaStore;

mod cluster;
mod proxy;
mod replication;
mod selector;

#[cfg(test)]
mod main_tests;

use cluster::{unix_ts, ClusterState, GroupRegistry, StorageReplica};
use replication::ReplicationClient;
use selector::{select_group_for_upload, select_replica};

#[derive(Debug, Parser)]
#[command(name = "flockfs-tracker")]
#[command(about = "Tracker node for the flockfs distributed file store")]
struct Cli {
    #[arg(long, default_value = "127.0.0.1:7700")]
    bind: String,
    /// Directory holding the replication retry log.
    #[arg(long, default_value = "./data/tracker")]
    data_dir: PathBuf,
    /// Replicas reporting at or below this free space stop receiving uploads.
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    min_free_bytes: u64,
    #[arg(long, default_value_t = 5)]
    sweep_interval_secs: u64,
    /// Silence threshold before a replica is considered offline, ten report
    /// periods by default.
    #[arg(long, default_value_t = 50)]
    offline_after_secs: u64,
    #[arg(long, default_value_t = 512 * 1024 * 1024)]
    max_upload_bytes: usize,
}

#[derive(Clone)]
struct TrackerState {
    cluster: Arc<ClusterState>,
    replication: Arc<ReplicationClient>,
    ids: Arc<dyn IdGenerator>,
    http: reqwest::Client,
    ip_hash: IpHash,
    min_free_bytes: u64,
    max_upload_bytes: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    let retry_log = MetaStore::open(cli.data_dir.join("sync-err"))
        .context("failed to open replication retry log")?;

    let state = TrackerState {
        cluster: Arc::new(ClusterState::new()),
        replication: Arc::new(ReplicationClient::new(reqwest::Client::new(), retry_log)),
        ids: Arc::new(UuidGenerator),
        http: reqwest::Client::new(),
        ip_hash: crc32,
        min_free_bytes: cli.min_free_bytes,
        max_upload_bytes: cli.max_upload_bytes,
    };

    spawn_sweep_task(
        state.cluster.clone(),
        cli.sweep_interval_secs,
        cli.offline_after_secs,
    );

    let app = router(state);

    let bind_addr: SocketAddr = cli.bind.parse().context("invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .context("failed to bind tracker port")?;
    info!(%bind_addr, "tracker listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

fn router(state: TrackerState) -> Router {
    Router::new()
        .route("/status", post(status_report))
        .route("/v1/upload", post(quick_upload))
        .route("/delete", post(delete_file))
        .route("/g/status", get(group_status))
        .route("/err/log", post(node_error_log))
        .route("/sync/pending", get(sync_pending))
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

/// Demotes silent replicas on the report cadence so a storage node that
/// stops reporting drops out of upload rotation.
fn spawn_sweep_task(cluster: Arc<ClusterState>, interval_secs: u64, offline_after_secs: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            interval.tick().await;
            cluster.sweep(unix_ts(), offline_after_secs);
        }
    });
}

async fn status_report(
    State(state): State<TrackerState>,
    Json(report): Json<StatusReport>,
) -> Response {
    if report.group.is_empty() || report.host.is_empty() || report.port == 0 {
        warn!(group = %report.group, host = %report.host, "rejecting malformed status report");
        return fail_response(ApiCode::ParamBindFail, "group and address are required");
    }

    let replica = StorageReplica::from_report(&report, state.min_free_bytes, unix_ts());
    match state.cluster.apply_report(replica) {
        Ok(_) => StatusCode::OK.into_response(),
        Err(err) => {
            warn!(error = %err, group = %report.group, "failed to apply status report");
            fail_response(ApiCode::Fail, err.to_string())
        }
    }
}

/// Upload orchestration: select a group, select a replica by client ip,
/// attach a fresh file id and proxy the multipart body through. On success
/// the stored file is replicated asynchronously to the rest of the group;
/// on transport failure the replica is marked offline and the client gets a
/// bad-gateway envelope. No second replica is tried.
async fn quick_upload(
    State(state): State<TrackerState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let group = match select_group_for_upload(&state.cluster) {
        Ok(group) => group,
        Err(err) => {
            warn!(error = %err, "upload rejected");
            return fail_response(ApiCode::NoAvailableGroup, err.to_string());
        }
    };

    let client_ip = peer.ip().to_string();
    let replica = match select_replica(&client_ip, &group, state.ip_hash) {
        Ok(replica) => replica,
        Err(err) => {
            warn!(error = %err, group = group.name(), "upload rejected");
            return fail_response(ApiCode::NoAvailableStorage, err.to_string());
        }
    };

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, state.max_upload_bytes).await {
        Ok(body) => body,
        Err(err) => {
            return fail_response(
                ApiCode::FileSizeExceeded,
                format!("failed to read upload body: {err}"),
            )
        }
    };

    let file_id = state.ids.new_id();
    let mut headers = parts.headers;
    if let Ok(value) = HeaderValue::from_str(&file_id) {
        headers.insert(header::FILE_ID, value);
    }

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/v1/upload");

    match proxy::forward(
        &state.http,
        parts.method,
        &replica.base_url(),
        path_and_query,
        headers,
        body,
    )
    .await
    {
        Ok(proxied) => {
            if upload_succeeded(&proxied.headers) {
                dispatch_replication(&state, &group, &replica, &file_id, &proxied.headers);
            }
            proxied.into_response()
        }
        Err(err) => {
            warn!(error = %err, addr = %replica.addr, "proxy to storage failed, marking replica offline");
            group.mark_offline(&replica.addr);
            fail_response(ApiCode::ProxyBadGateway, err.to_string())
        }
    }
}

fn upload_succeeded(headers: &HeaderMap) -> bool {
    let expected = ApiCode::Success.as_u32().to_string();
    header_str(headers, header::UPLOAD_RES)
        .map(|value| value == expected)
        .unwrap_or(false)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Fans out add commands to every other replica in the group as detached
/// tasks: the client's upload response never waits on replication.
fn dispatch_replication(
    state: &TrackerState,
    group: &Arc<GroupRegistry>,
    source: &StorageReplica,
    file_id: &str,
    response_headers: &HeaderMap,
) {
    let Some(full_path) = header_str(response_headers, header::FILE_PATH) else {
        warn!("upload response missing stored file path, skipping replication");
        return;
    };
    let file_hash = header_str(response_headers, header::FILE_HASH)
        .unwrap_or_default()
        .to_string();
    let (file_path, file_name) = split_file_path(full_path);

    for dest in group.list_replicas() {
        if dest.addr == source.addr {
            continue;
        }

        let command = SyncCommand {
            src: source.base_url(),
            dst: dest.base_url(),
            file_id: file_id.to_string(),
            file_path: file_path.clone(),
            file_name: file_name.clone(),
            file_hash: file_hash.clone(),
            action: SyncAction::Add,
            group: group.name().to_string(),
        };
        info!(file = %command.file_name, dst = %command.dst, "dispatching file sync");

        let client = state.replication.clone();
        tokio::spawn(async move {
            client.replicate(&dest, command).await;
        });
    }
}

#[derive(Debug, Deserialize)]
struct DeleteRequest {
    #[serde(default)]
    file_id: Option<String>,
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    file: Option<String>,
}

fn validate_delete_request(request: &DeleteRequest) -> Result<(&str, &str), &'static str> {
    let group = match request.group.as_deref() {
        Some(group) if !group.is_empty() => group,
        _ => return Err("group is required"),
    };
    let file = match request.file.as_deref() {
        Some(file) if !file.is_empty() => file,
        _ => return Err("file path is required"),
    };
    Ok((group, file))
}

/// Fans delete commands out to every replica in the group and answers as
/// soon as they are dispatched, not once the replicas confirm.
async fn delete_file(
    State(state): State<TrackerState>,
    Json(request): Json<DeleteRequest>,
) -> Response {
    let (group_name, file) = match validate_delete_request(&request) {
        Ok(pair) => pair,
        Err(message) => return fail_response(ApiCode::ParamBindFail, message),
    };

    let Some(group) = state.cluster.get_group(group_name) else {
        return fail_response(ApiCode::Fail, "no such group");
    };

    info!(group = %group_name, file = %file, "dispatching delete");
    let (file_path, file_name) = split_file_path(file);

    for dest in group.list_replicas() {
        let command = SyncCommand {
            src: String::new(),
            dst: dest.base_url(),
            file_id: request.file_id.clone().unwrap_or_default(),
            file_path: file_path.clone(),
            file_name: file_name.clone(),
            file_hash: request.hash.clone().unwrap_or_default(),
            action: SyncAction::Delete,
            group: group.name().to_string(),
        };

        let client = state.replication.clone();
        tokio::spawn(async move {
            client.replicate(&dest, command).await;
        });
    }

    Json(Envelope::<serde_json::Value>::ok_empty(
        "delete dispatched to all replicas",
    ))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct GroupStatusQuery {
    group: Option<String>,
}

async fn group_status(
    State(state): State<TrackerState>,
    Query(query): Query<GroupStatusQuery>,
) -> Response {
    match query.group.as_deref().filter(|name| !name.is_empty()) {
        Some(name) => match state.cluster.get_group(name) {
            Some(group) => Json(Envelope::ok(group.snapshot())).into_response(),
            None => fail_response(ApiCode::Fail, "no such group"),
        },
        None => Json(Envelope::ok(state.cluster.snapshot())).into_response(),
    }
}

/// Accepts a storage node's error report for operator visibility. Log-only,
/// no state change.
async fn node_error_log(Json(report): Json<NodeErrorReport>) -> Response {
    if !report.message.is_empty() {
        error!(
            code = report.code.as_u32(),
            group = %report.group,
            host = %report.host,
            port = report.port,
            message = %report.message,
            "storage node reported an error"
        );
    }
    StatusCode::OK.into_response()
}

async fn sync_pending(State(state): State<TrackerState>) -> Response {
    Json(Envelope::ok(state.replication.pending())).into_response()
}

fn fail_response(status: ApiCode, message: impl Into<String>) -> Response {
    Json(Envelope::<serde_json::Value>::fail(status, message)).into_response()
}
