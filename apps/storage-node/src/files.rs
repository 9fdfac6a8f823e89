//! File handling for the storage role: content-addressable quick upload,
//! add/delete sync application and plain file serving.

use std::path::Path;
use std::time::Duration;

use axum::extract::multipart::Field;
use axum::extract::{Multipart, Path as UrlPath, Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use common::{
    content_type_for, date_partition_path, header, stored_file_name, ApiCode, Envelope,
    FileRecord, SyncAction, SyncCommand,
};

use crate::report;
use crate::NodeState;

pub(crate) const SYNC_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Quick upload: dedup on a caller-supplied content hash, then stream the
/// multipart `file` field to a date-partitioned path while hashing. The
/// stored path and hash go back in response headers so the tracker can drive
/// replication without touching the body.
pub(crate) async fn quick_upload(
    State(state): State<NodeState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    if let Some(hash) = header_str(&headers, header::FILE_HASH) {
        if let Some(record) = lookup_record(&state, hash) {
            info!(hash = %hash, "content already stored, skipping upload");
            return upload_response("file already uploaded", record);
        }
    }

    let custom_dir = header_str(&headers, header::FILE_DIR).map(str::to_string);
    let rel_dir = date_partition_path(custom_dir.as_deref());
    let base_dir = state.storage_dir.join(&rel_dir);
    if let Err(err) = tokio::fs::create_dir_all(&base_dir).await {
        error!(error = %err, dir = %base_dir.display(), "failed to create upload directory");
        report::notify_trackers(
            &state,
            ApiCode::DirCreateFail,
            format!("failed to create upload directory {}: {err}", base_dir.display()),
        );
        return fail(ApiCode::DirCreateFail, "failed to create upload directory");
    }

    let mut stored = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "multipart read error");
                break;
            }
        };
        if field.name() != Some("file") {
            continue;
        }
        stored = Some(consume_file_field(&state, &headers, field, &base_dir, &rel_dir).await);
        break;
    }

    match stored {
        Some(Ok(record)) => upload_response("file stored", record),
        Some(Err((code, message))) => fail(code, message),
        None => fail(ApiCode::FormFileNotFound, "missing multipart file field"),
    }
}

async fn consume_file_field(
    state: &NodeState,
    headers: &HeaderMap,
    mut field: Field<'_>,
    base_dir: &Path,
    rel_dir: &str,
) -> Result<FileRecord, (ApiCode, String)> {
    let original_name = field.file_name().unwrap_or_default().to_string();
    let declared_hash = header_str(headers, header::FILE_HASH).map(str::to_string);
    let file_id = header_str(headers, header::FILE_ID)
        .map(str::to_string)
        .unwrap_or_else(|| state.ids.new_id());
    let file_name = stored_file_name(&file_id, &original_name);
    let final_path = base_dir.join(&file_name);
    let part_path = base_dir.join(format!("{file_name}.part"));

    let mut file = match tokio::fs::File::create(&part_path).await {
        Ok(file) => file,
        Err(err) => {
            error!(error = %err, path = %part_path.display(), "failed to create upload file");
            report::notify_trackers(
                state,
                ApiCode::FileSaveFail,
                format!("failed to create upload file: {err}"),
            );
            return Err((ApiCode::FileSaveFail, format!("failed to save file: {err}")));
        }
    };

    let mut hasher = blake3::Hasher::new();
    let mut size: u64 = 0;

    loop {
        match field.chunk().await {
            Ok(Some(chunk)) => {
                size += chunk.len() as u64;
                if state.file_size_limit > 0 && size > state.file_size_limit {
                    drop(file);
                    let _ = tokio::fs::remove_file(&part_path).await;
                    warn!(file = %original_name, size, "upload exceeds size limit");
                    return Err((
                        ApiCode::FileSizeExceeded,
                        "file size exceeds the configured limit".to_string(),
                    ));
                }
                hasher.update(&chunk);
                if let Err(err) = file.write_all(&chunk).await {
                    drop(file);
                    let _ = tokio::fs::remove_file(&part_path).await;
                    return Err((ApiCode::FileSaveFail, format!("failed to write file: {err}")));
                }
            }
            Ok(None) => break,
            Err(err) => {
                drop(file);
                let _ = tokio::fs::remove_file(&part_path).await;
                return Err((
                    ApiCode::FileSaveFail,
                    format!("failed to read upload body: {err}"),
                ));
            }
        }
    }

    if let Err(err) = file.flush().await {
        drop(file);
        let _ = tokio::fs::remove_file(&part_path).await;
        return Err((ApiCode::FileSaveFail, format!("failed to flush file: {err}")));
    }
    drop(file);

    let computed_hash = hasher.finalize().to_hex().to_string();
    if let Some(declared) = declared_hash {
        // Integrity gate: a declared hash that does not match the bytes we
        // received means the file was damaged in transit.
        if !declared.is_empty() && declared != computed_hash {
            let _ = tokio::fs::remove_file(&part_path).await;
            warn!(
                file = %original_name,
                declared = %declared,
                computed = %computed_hash,
                "checksum mismatch, rejecting upload"
            );
            return Err((ApiCode::FileChecksumFail, "file is damaged".to_string()));
        }
    }

    if let Err(err) = tokio::fs::rename(&part_path, &final_path).await {
        let _ = tokio::fs::remove_file(&part_path).await;
        return Err((ApiCode::FileSaveFail, format!("failed to save file: {err}")));
    }

    let rel_path = format!("{rel_dir}/{file_name}");
    let record = FileRecord {
        file_id,
        name: original_name,
        stored_name: file_name,
        url: static_url(state, &rel_path),
        path: rel_path,
        hash: computed_hash,
        size,
        group: state.group.clone(),
    };
    persist_record(state, &record);

    Ok(record)
}

/// Applies one replication command from the tracker.
pub(crate) async fn apply_sync(
    State(state): State<NodeState>,
    Json(command): Json<SyncCommand>,
) -> Json<Envelope<FileRecord>> {
    info!(
        action = command.action.as_str(),
        file = %command.file_name,
        group = %command.group,
        "applying sync command"
    );

    match command.action {
        SyncAction::Add => sync_add(&state, command).await,
        SyncAction::Delete => sync_delete(&state, command).await,
    }
}

async fn sync_add(state: &NodeState, command: SyncCommand) -> Json<Envelope<FileRecord>> {
    let base_dir = state.storage_dir.join(&command.file_path);
    if let Err(err) = tokio::fs::create_dir_all(&base_dir).await {
        error!(error = %err, dir = %base_dir.display(), "failed to create sync directory");
        return Json(Envelope::fail(
            ApiCode::DirCreateFail,
            "failed to create sync directory",
        ));
    }

    let url = format!(
        "{}/{}/{}/{}",
        command.src.trim_end_matches('/'),
        command.group,
        command.file_path,
        command.file_name
    );

    let response = match state
        .http
        .get(&url)
        .timeout(SYNC_FETCH_TIMEOUT)
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) => return sync_fetch_failed(&url, err),
    };
    let response = match response.error_for_status() {
        Ok(response) => response,
        Err(err) => return sync_fetch_failed(&url, err),
    };
    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => return sync_fetch_failed(&url, err),
    };

    let full_path = base_dir.join(&command.file_name);
    if let Err(err) = write_atomic(&full_path, &bytes).await {
        error!(error = %err, path = %full_path.display(), "failed to write replicated file");
        return Json(Envelope::fail(
            ApiCode::FileSaveFail,
            "failed to write replicated file",
        ));
    }

    let rel_path = format!("{}/{}", command.file_path, command.file_name);
    let record = FileRecord {
        file_id: command.file_id,
        name: command.file_name.clone(),
        stored_name: command.file_name,
        url: static_url(state, &rel_path),
        path: rel_path,
        hash: command.file_hash,
        size: bytes.len() as u64,
        group: command.group,
    };
    if !record.hash.is_empty() {
        persist_record(state, &record);
    }

    Json(Envelope::ok_with("file replicated", record))
}

fn sync_fetch_failed(url: &str, err: reqwest::Error) -> Json<Envelope<FileRecord>> {
    warn!(url = %url, error = %err, "failed to fetch file from source replica");
    Json(Envelope::fail(
        ApiCode::Fail,
        format!("failed to fetch file from source: {err}"),
    ))
}

async fn sync_delete(state: &NodeState, command: SyncCommand) -> Json<Envelope<FileRecord>> {
    let full_path = state
        .storage_dir
        .join(&command.file_path)
        .join(&command.file_name);

    match tokio::fs::remove_file(&full_path).await {
        Ok(()) => {}
        // Already absent counts as deleted.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            error!(error = %err, path = %full_path.display(), "failed to delete file");
            return Json(Envelope::fail(ApiCode::Fail, "failed to delete file"));
        }
    }

    if !command.file_hash.is_empty() {
        if let Err(err) = state.meta.delete(&command.file_hash) {
            error!(error = %err, hash = %command.file_hash, "failed to delete file record");
        }
    }

    Json(Envelope::ok_empty("file deleted"))
}

#[derive(Debug, Deserialize)]
pub(crate) struct DownloadQuery {
    path: String,
}

pub(crate) async fn download(
    State(state): State<NodeState>,
    Query(query): Query<DownloadQuery>,
) -> Response {
    serve_file(&state, &query.path, true).await
}

pub(crate) async fn serve_group_file(
    State(state): State<NodeState>,
    UrlPath(path): UrlPath<String>,
) -> Response {
    serve_file(&state, &path, false).await
}

async fn serve_file(state: &NodeState, rel_path: &str, attachment: bool) -> Response {
    if rel_path.split('/').any(|part| part == "..") {
        return StatusCode::NOT_FOUND.into_response();
    }

    let full_path = state.storage_dir.join(rel_path);
    let bytes = match tokio::fs::read(&full_path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return StatusCode::NOT_FOUND.into_response()
        }
        Err(err) => {
            error!(error = %err, path = %full_path.display(), "failed to read file");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let file_name = rel_path.rsplit('/').next().unwrap_or(rel_path);
    let mut response = (StatusCode::OK, bytes).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(content_type_for(file_name)) {
        headers.insert(CONTENT_TYPE, value);
    }
    if attachment {
        if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename={file_name}")) {
            headers.insert(CONTENT_DISPOSITION, value);
        }
    }
    response
}

pub(crate) fn static_url(state: &NodeState, rel_path: &str) -> String {
    format!(
        "{}://{}/{}/{}",
        state.scheme, state.advertised_addr, state.group, rel_path
    )
}

fn lookup_record(state: &NodeState, hash: &str) -> Option<FileRecord> {
    match state.meta.get(hash) {
        Ok(Some(payload)) => match serde_json::from_slice(&payload) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(hash = %hash, error = %err, "undecodable file record in metadata store");
                None
            }
        },
        Ok(None) => None,
        Err(err) => {
            error!(error = %err, hash = %hash, "metadata lookup failed");
            None
        }
    }
}

fn persist_record(state: &NodeState, record: &FileRecord) {
    match serde_json::to_vec(record) {
        Ok(payload) => {
            if let Err(err) = state.meta.put(&record.hash, &payload) {
                error!(error = %err, hash = %record.hash, "failed to persist file record");
            }
        }
        Err(err) => error!(error = %err, "failed to encode file record"),
    }
}

async fn write_atomic(path: &Path, payload: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension(format!("part-{}", std::process::id()));
    tokio::fs::write(&tmp, payload).await?;
    tokio::fs::rename(&tmp, path).await
}

fn upload_response(message: &str, record: FileRecord) -> Response {
    let mut response = Json(Envelope::ok_with(message, record.clone())).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&ApiCode::Success.as_u32().to_string()) {
        headers.insert(header::UPLOAD_RES, value);
    }
    if let Ok(value) = HeaderValue::from_str(&record.hash) {
        headers.insert(header::FILE_HASH, value);
    }
    if let Ok(value) = HeaderValue::from_str(&record.path) {
        headers.insert(header::FILE_PATH, value);
    }
    response
}

fn fail(status: ApiCode, message: impl Into<String>) -> Response {
    Json(Envelope::<FileRecord>::fail(status, message)).into_response()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
