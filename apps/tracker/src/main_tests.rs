use super::*;

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Body;
use parking_lot::Mutex;

use super::cluster::ReplicaStatus;

fn fresh_test_dir(name: &str) -> PathBuf {
    let unique = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let path = std::env::temp_dir().join(format!("flockfs-{name}-{unique}"));
    let _ = std::fs::remove_dir_all(&path);
    path
}

fn test_state(name: &str) -> (TrackerState, PathBuf) {
    let dir = fresh_test_dir(name);
    let retry_log = MetaStore::open(dir.join("sync-err")).unwrap();

    let state = TrackerState {
        cluster: Arc::new(ClusterState::new()),
        replication: Arc::new(ReplicationClient::new(reqwest::Client::new(), retry_log)),
        ids: Arc::new(UuidGenerator),
        http: reqwest::Client::new(),
        ip_hash: crc32,
        min_free_bytes: 64,
        max_upload_bytes: 16 * 1024 * 1024,
    };
    (state, dir)
}

fn register_replica(state: &TrackerState, group: &str, addr: &str, free: u64) {
    state
        .cluster
        .apply_report(StorageReplica {
            group: group.to_string(),
            addr: addr.to_string(),
            scheme: "http".to_string(),
            status: ReplicaStatus::Active,
            free_bytes: free,
            last_report_unix: unix_ts(),
        })
        .unwrap();
}

async fn read_envelope(response: Response) -> Envelope {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[derive(Clone, Default)]
struct StubStorage {
    uploads: Arc<Mutex<usize>>,
    syncs: Arc<Mutex<Vec<SyncCommand>>>,
}

async fn stub_upload(State(stub): State<StubStorage>) -> Response {
    *stub.uploads.lock() += 1;

    let mut response =
        Json(Envelope::<serde_json::Value>::ok_empty("file stored")).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::UPLOAD_RES,
        HeaderValue::from_str(&ApiCode::Success.as_u32().to_string()).unwrap(),
    );
    headers.insert(
        header::FILE_PATH,
        HeaderValue::from_static("2024/1/1/file-1.png"),
    );
    headers.insert(header::FILE_HASH, HeaderValue::from_static("abc123"));
    response
}

async fn stub_sync(
    State(stub): State<StubStorage>,
    Json(command): Json<SyncCommand>,
) -> Json<Envelope> {
    stub.syncs.lock().push(command);
    Json(Envelope::ok_empty("applied"))
}

async fn spawn_stub_storage() -> (SocketAddr, StubStorage) {
    let stub = StubStorage::default();
    let app = Router::new()
        .route("/v1/upload", post(stub_upload))
        .route("/sync", post(stub_sync))
        .with_state(stub.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, stub)
}

async fn wait_until(condition: impl Fn() -> bool) -> bool {
    for _ in 0..40 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}

fn upload_request() -> Request {
    axum::http::Request::builder()
        .method("POST")
        .uri("/v1/upload")
        .header("content-type", "multipart/form-data; boundary=xyz")
        .body(Body::from("--xyz--fake-multipart-payload"))
        .unwrap()
}

fn peer(ip: &str) -> ConnectInfo<SocketAddr> {
    ConnectInfo(format!("{ip}:50000").parse().unwrap())
}

#[tokio::test]
async fn status_report_registers_replica_and_capacity() {
    let (state, dir) = test_state("status-report");

    let report = StatusReport {
        group: "g1".to_string(),
        scheme: "http".to_string(),
        host: "127.0.0.1".to_string(),
        port: 7801,
        free: 500,
    };
    let response = status_report(State(state.clone()), Json(report)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let group = state.cluster.get_group("g1").unwrap();
    assert_eq!(group.capacity(), 500);
    assert_eq!(group.list_replicas()[0].addr, "127.0.0.1:7801");

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn status_report_rejects_missing_group() {
    let (state, dir) = test_state("status-report-invalid");

    let report = StatusReport {
        group: String::new(),
        scheme: "http".to_string(),
        host: "127.0.0.1".to_string(),
        port: 7801,
        free: 500,
    };
    let response = status_report(State(state.clone()), Json(report)).await;
    let envelope = read_envelope(response).await;
    assert_eq!(envelope.status, ApiCode::ParamBindFail);
    assert!(state.cluster.list_groups().is_empty());

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn upload_without_groups_returns_no_available_group() {
    let (state, dir) = test_state("upload-no-group");

    let response = quick_upload(State(state), peer("10.0.0.1"), upload_request()).await;
    let envelope = read_envelope(response).await;
    assert_eq!(envelope.status, ApiCode::NoAvailableGroup);

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn upload_proxies_to_one_replica_and_fans_out_to_the_rest() {
    let (state, dir) = test_state("upload-fan-out");
    let (addr_a, stub_a) = spawn_stub_storage().await;
    let (addr_b, stub_b) = spawn_stub_storage().await;

    register_replica(&state, "g1", &addr_a.to_string(), 500);
    register_replica(&state, "g1", &addr_b.to_string(), 300);

    let response = quick_upload(State(state.clone()), peer("10.0.0.1"), upload_request()).await;

    assert!(upload_succeeded(response.headers()));
    let envelope = read_envelope(response).await;
    assert!(envelope.is_success());

    // Exactly one replica served the proxied upload, the other one received
    // the asynchronous add command.
    let uploads_a = stub_a.uploads.clone();
    let uploads_b = stub_b.uploads.clone();
    assert!(wait_until(|| *uploads_a.lock() + *uploads_b.lock() == 1).await);

    let syncs_a = stub_a.syncs.clone();
    let syncs_b = stub_b.syncs.clone();
    assert!(wait_until(|| syncs_a.lock().len() + syncs_b.lock().len() == 1).await);

    let command = {
        let a = stub_a.syncs.lock();
        let b = stub_b.syncs.lock();
        a.first().or(b.first()).cloned().unwrap()
    };
    assert_eq!(command.action, SyncAction::Add);
    assert_eq!(command.file_name, "file-1.png");
    assert_eq!(command.file_path, "2024/1/1");
    assert_eq!(command.file_hash, "abc123");
    assert_eq!(command.group, "g1");

    // The replica that served the upload must be the sync source, not the
    // destination.
    let uploaded_to_a = *stub_a.uploads.lock() == 1;
    let expected_src = if uploaded_to_a { addr_a } else { addr_b };
    assert_eq!(command.src, format!("http://{expected_src}"));

    assert!(state.replication.pending().is_empty());

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn upload_marks_replica_offline_when_proxy_fails() {
    let (state, dir) = test_state("upload-bad-gateway");
    register_replica(&state, "g1", "127.0.0.1:9", 500);

    let response = quick_upload(State(state.clone()), peer("10.0.0.1"), upload_request()).await;
    let envelope = read_envelope(response).await;
    assert_eq!(envelope.status, ApiCode::ProxyBadGateway);

    let group = state.cluster.get_group("g1").unwrap();
    assert_eq!(
        group.get_replica("127.0.0.1:9").unwrap().status,
        ReplicaStatus::Offline
    );
    assert_eq!(group.status(), cluster::GroupStatus::Unavailable);

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn delete_fans_out_to_every_replica_in_the_group() {
    let (state, dir) = test_state("delete-fan-out");
    let (addr_a, stub_a) = spawn_stub_storage().await;
    let (addr_b, stub_b) = spawn_stub_storage().await;

    register_replica(&state, "g1", &addr_a.to_string(), 500);
    register_replica(&state, "g1", &addr_b.to_string(), 300);

    let request = DeleteRequest {
        file_id: Some("id-1".to_string()),
        group: Some("g1".to_string()),
        hash: Some("abc123".to_string()),
        file: Some("2024/1/1/id-1.png".to_string()),
    };
    let response = delete_file(State(state.clone()), Json(request)).await;
    let envelope = read_envelope(response).await;
    assert!(envelope.is_success());

    let syncs_a = stub_a.syncs.clone();
    let syncs_b = stub_b.syncs.clone();
    assert!(wait_until(|| syncs_a.lock().len() == 1 && syncs_b.lock().len() == 1).await);

    for stub in [&stub_a, &stub_b] {
        let command = stub.syncs.lock().first().cloned().unwrap();
        assert_eq!(command.action, SyncAction::Delete);
        assert_eq!(command.file_name, "id-1.png");
        assert_eq!(command.file_path, "2024/1/1");
    }

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn delete_requires_group_and_file() {
    let request = DeleteRequest {
        file_id: None,
        group: None,
        hash: None,
        file: Some("2024/1/1/id-1.png".to_string()),
    };
    assert!(validate_delete_request(&request).is_err());

    let request = DeleteRequest {
        file_id: None,
        group: Some("g1".to_string()),
        hash: None,
        file: None,
    };
    assert!(validate_delete_request(&request).is_err());

    let request = DeleteRequest {
        file_id: None,
        group: Some("g1".to_string()),
        hash: None,
        file: Some("2024/1/1/id-1.png".to_string()),
    };
    assert_eq!(
        validate_delete_request(&request).unwrap(),
        ("g1", "2024/1/1/id-1.png")
    );
}

#[tokio::test]
async fn group_status_returns_one_group_or_all() {
    let (state, dir) = test_state("group-status");
    register_replica(&state, "g1", "127.0.0.1:7801", 500);
    register_replica(&state, "g2", "127.0.0.1:7802", 300);

    let response = group_status(
        State(state.clone()),
        Query(GroupStatusQuery {
            group: Some("g1".to_string()),
        }),
    )
    .await;
    let envelope = read_envelope(response).await;
    assert!(envelope.is_success());
    let data = envelope.data.unwrap();
    assert_eq!(data["name"], "g1");
    assert_eq!(data["capacity"], 500);

    let response = group_status(State(state.clone()), Query(GroupStatusQuery { group: None })).await;
    let envelope = read_envelope(response).await;
    let data = envelope.data.unwrap();
    assert_eq!(data.as_array().map(Vec::len), Some(2));

    let response = group_status(
        State(state.clone()),
        Query(GroupStatusQuery {
            group: Some("missing".to_string()),
        }),
    )
    .await;
    let envelope = read_envelope(response).await;
    assert_eq!(envelope.status, ApiCode::Fail);

    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn upload_success_header_check_requires_exact_code() {
    let mut headers = HeaderMap::new();
    assert!(!upload_succeeded(&headers));

    headers.insert(header::UPLOAD_RES, HeaderValue::from_static("40000"));
    assert!(!upload_succeeded(&headers));

    headers.insert(header::UPLOAD_RES, HeaderValue::from_static("20000"));
    assert!(upload_succeeded(&headers));
}
