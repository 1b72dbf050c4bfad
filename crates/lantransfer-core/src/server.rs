//! HTTP server that receives chunked, resumable, integrity-verified uploads.
//!
//! Bytes land in a hidden `.{id}_{filename}.part` staging file under the
//! download directory and are renamed into place only after the declared
//! SHA-256 matches. Chunks must arrive in strict append order; a chunk whose
//! range start differs from the current `received_bytes` is rejected.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path as UrlPath, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc::UnboundedSender, watch};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::archive;
use crate::error::Result;
use crate::events::ServerEvent;
use crate::util::{self, CHUNK_SIZE, DEFAULT_PORT};

/// An upload in flight on the receiver.
pub struct IncomingTransfer {
    pub transfer_id: String,
    pub filename: String,
    pub total_size: u64,
    pub expected_hash: String,
    pub received_bytes: u64,
    pub temp_path: PathBuf,
    pub final_path: PathBuf,
    hasher: Sha256,
    pub completed: bool,
    pub error: Option<String>,
}

impl IncomingTransfer {
    pub fn snapshot(&self) -> IncomingSnapshot {
        IncomingSnapshot {
            transfer_id: self.transfer_id.clone(),
            filename: self.filename.clone(),
            total_size: self.total_size,
            expected_hash: self.expected_hash.clone(),
            received_bytes: self.received_bytes,
            completed: self.completed,
            error: self.error.clone(),
        }
    }
}

/// Observable state of an incoming transfer, published with every event.
#[derive(Debug, Clone, Serialize)]
pub struct IncomingSnapshot {
    pub transfer_id: String,
    pub filename: String,
    pub total_size: u64,
    pub expected_hash: String,
    pub received_bytes: u64,
    pub completed: bool,
    pub error: Option<String>,
}

#[derive(Clone)]
struct AppState {
    transfers: Arc<Mutex<HashMap<String, IncomingTransfer>>>,
    download_dir: PathBuf,
    events: UnboundedSender<ServerEvent>,
}

// ── Request/response types ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct InitRequest {
    filename: String,
    size: u64,
    #[serde(default)]
    hash: String,
    resume_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct InitResponse {
    transfer_id: String,
    resume_offset: u64,
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct CompleteRequest {
    transfer_id: String,
}

// ── Handlers ────────────────────────────────────────────────────────────

/// GET /status — liveness check with the live transfer count.
async fn handle_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let active = state.transfers.lock().await.len();
    Json(json!({"status": "ok", "active_transfers": active}))
}

/// POST /transfer/init — start a new transfer or resume an existing one.
async fn handle_init(
    State(state): State<AppState>,
    payload: std::result::Result<Json<InitRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(req)) = payload else {
        return json_error(
            StatusCode::BAD_REQUEST,
            json!({"error": "Missing required fields: filename, size"}),
        );
    };
    if req.filename.is_empty() {
        return json_error(
            StatusCode::BAD_REQUEST,
            json!({"error": "Missing required fields: filename, size"}),
        );
    }

    // strip any path components from the declared filename
    let filename = Path::new(&req.filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| req.filename.clone());

    let mut transfers = state.transfers.lock().await;

    if let Some(resume_id) = &req.resume_id {
        if let Some(existing) = transfers.get(resume_id) {
            if existing.filename == filename && existing.total_size == req.size {
                info!(
                    "resuming transfer {} at offset {}",
                    resume_id, existing.received_bytes
                );
                return (
                    StatusCode::OK,
                    Json(InitResponse {
                        transfer_id: resume_id.clone(),
                        resume_offset: existing.received_bytes,
                        status: "resuming",
                    }),
                )
                    .into_response();
            }
        }
    }

    let transfer_id = util::generate_transfer_id();
    let temp_path = state
        .download_dir
        .join(format!(".{transfer_id}_{filename}.part"));
    let final_path = resolve_conflict(&state.download_dir, &filename);

    if let Err(e) = fs::File::create(&temp_path).await {
        warn!("failed to create {}: {}", temp_path.display(), e);
        return json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"error": format!("Failed to create temp file: {e}")}),
        );
    }

    let transfer = IncomingTransfer {
        transfer_id: transfer_id.clone(),
        filename,
        total_size: req.size,
        expected_hash: req.hash,
        received_bytes: 0,
        temp_path,
        final_path,
        hasher: Sha256::new(),
        completed: false,
        error: None,
    };
    let snapshot = transfer.snapshot();
    transfers.insert(transfer_id.clone(), transfer);
    drop(transfers);

    info!(
        "transfer {} started: {} ({})",
        transfer_id,
        snapshot.filename,
        util::format_size(snapshot.total_size)
    );
    let _ = state.events.send(ServerEvent::Started(snapshot));

    (
        StatusCode::OK,
        Json(InitResponse {
            transfer_id,
            resume_offset: 0,
            status: "ready",
        }),
    )
        .into_response()
}

/// POST /transfer/chunk — append one chunk at the declared offset.
async fn handle_chunk(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let Some(transfer_id) = headers.get("X-Transfer-ID").and_then(|v| v.to_str().ok()) else {
        return json_error(StatusCode::BAD_REQUEST, json!({"error": "Invalid transfer ID"}));
    };

    let mut transfers = state.transfers.lock().await;
    let Some(transfer) = transfers.get_mut(transfer_id) else {
        return json_error(StatusCode::BAD_REQUEST, json!({"error": "Invalid transfer ID"}));
    };

    let start = headers
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range_start)
        .unwrap_or(0);

    if start != transfer.received_bytes {
        return json_error(
            StatusCode::BAD_REQUEST,
            json!({
                "error": "Invalid chunk position",
                "expected": transfer.received_bytes,
                "received": start,
            }),
        );
    }

    if let Err(e) = append_chunk(&transfer.temp_path, &body).await {
        let message = e.to_string();
        transfer.error = Some(message.clone());
        let snapshot = transfer.snapshot();
        drop(transfers);
        warn!("chunk write failed for {}: {}", transfer_id, message);
        let _ = state.events.send(ServerEvent::Failed {
            transfer: snapshot,
            error: message.clone(),
        });
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, json!({"error": message}));
    }

    transfer.received_bytes += body.len() as u64;
    transfer.hasher.update(&body);
    let snapshot = transfer.snapshot();
    let (received, total) = (transfer.received_bytes, transfer.total_size);
    drop(transfers);

    let _ = state.events.send(ServerEvent::Progress(snapshot));

    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "received": received,
            "total": total,
            "progress": if total > 0 { received as f64 / total as f64 } else { 1.0 },
        })),
    )
        .into_response()
}

/// POST /transfer/complete — verify the digest and move the file into place.
async fn handle_complete(
    State(state): State<AppState>,
    payload: std::result::Result<Json<CompleteRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(req)) = payload else {
        return json_error(StatusCode::BAD_REQUEST, json!({"error": "Invalid JSON"}));
    };

    let finished = {
        let mut transfers = state.transfers.lock().await;
        let Some(transfer) = transfers.get_mut(&req.transfer_id) else {
            return json_error(StatusCode::BAD_REQUEST, json!({"error": "Invalid transfer ID"}));
        };

        if transfer.received_bytes != transfer.total_size {
            return json_error(
                StatusCode::BAD_REQUEST,
                json!({
                    "error": "Incomplete transfer",
                    "received": transfer.received_bytes,
                    "expected": transfer.total_size,
                }),
            );
        }

        let computed = hex::encode(transfer.hasher.clone().finalize());
        if !transfer.expected_hash.is_empty() && computed != transfer.expected_hash {
            let message = "Hash mismatch - file may be corrupted".to_string();
            transfer.error = Some(message.clone());
            let expected = transfer.expected_hash.clone();
            let snapshot = transfer.snapshot();
            let _ = fs::remove_file(&transfer.temp_path).await;
            drop(transfers);
            warn!(
                "transfer {} failed verification: expected {}, computed {}",
                req.transfer_id, expected, computed
            );
            let _ = state.events.send(ServerEvent::Failed {
                transfer: snapshot,
                error: message.clone(),
            });
            return json_error(
                StatusCode::BAD_REQUEST,
                json!({
                    "error": message,
                    "expected_hash": expected,
                    "computed_hash": computed,
                }),
            );
        }

        if let Err(e) = move_into_place(&transfer.temp_path, &transfer.final_path).await {
            warn!("failed to finalize {}: {}", transfer.final_path.display(), e);
            return json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": format!("Failed to finalize transfer: {e}")}),
            );
        }

        let mut transfer = transfers.remove(&req.transfer_id).unwrap();
        transfer.completed = true;
        transfer
    };

    // Folder transfers arrive as a tarball; extract off the transfer lock.
    let mut extracted: Option<PathBuf> = None;
    if file_name_of(&finished.final_path).ends_with(".tar.gz") {
        match archive::unpack(&finished.final_path).await {
            Ok(dir) => extracted = Some(dir),
            Err(e) => warn!("extraction failed, keeping archive: {}", e),
        }
    }

    info!(
        "transfer {} completed: {} ({})",
        finished.transfer_id,
        finished.final_path.display(),
        util::format_size(finished.total_size)
    );
    let _ = state.events.send(ServerEvent::Completed(finished.snapshot()));

    let path = extracted.clone().unwrap_or_else(|| finished.final_path.clone());
    (
        StatusCode::OK,
        Json(json!({
            "status": "completed",
            "path": path.display().to_string(),
            "size": util::format_size(finished.total_size),
            "hash_verified": !finished.expected_hash.is_empty(),
            "extracted": extracted.is_some(),
        })),
    )
        .into_response()
}

/// GET /transfer/{id}/status — progress snapshot.
async fn handle_transfer_status(
    State(state): State<AppState>,
    UrlPath(transfer_id): UrlPath<String>,
) -> Response {
    let transfers = state.transfers.lock().await;
    let Some(transfer) = transfers.get(&transfer_id) else {
        return json_error(StatusCode::NOT_FOUND, json!({"error": "Transfer not found"}));
    };

    (
        StatusCode::OK,
        Json(json!({
            "transfer_id": transfer_id,
            "filename": transfer.filename,
            "received_bytes": transfer.received_bytes,
            "total_size": transfer.total_size,
            "progress": if transfer.total_size > 0 {
                transfer.received_bytes as f64 / transfer.total_size as f64
            } else {
                0.0
            },
            "completed": transfer.completed,
            "error": transfer.error,
        })),
    )
        .into_response()
}

/// DELETE /transfer/{id} — drop the transfer and its staging file.
async fn handle_cancel(
    State(state): State<AppState>,
    UrlPath(transfer_id): UrlPath<String>,
) -> Response {
    let mut transfers = state.transfers.lock().await;
    let Some(transfer) = transfers.remove(&transfer_id) else {
        return json_error(StatusCode::NOT_FOUND, json!({"error": "Transfer not found"}));
    };
    drop(transfers);

    let _ = fs::remove_file(&transfer.temp_path).await;
    info!("transfer {} cancelled by sender", transfer_id);
    (StatusCode::OK, Json(json!({"status": "cancelled"}))).into_response()
}

// ── Helpers ─────────────────────────────────────────────────────────────

fn json_error(status: StatusCode, body: serde_json::Value) -> Response {
    (status, Json(body)).into_response()
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Parse the start offset out of `bytes <start>-<end>/<total>`.
fn parse_range_start(value: &str) -> Option<u64> {
    let rest = value.strip_prefix("bytes ")?;
    let range = rest.split('/').next()?;
    range.split('-').next()?.parse().ok()
}

/// Pick an unused destination name, suffixing `_1`, `_2`, … before the
/// extension until one is free.
fn resolve_conflict(dir: &Path, filename: &str) -> PathBuf {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }

    let path = Path::new(filename);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| filename.to_string());
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());

    for counter in 1u32.. {
        let name = match &extension {
            Some(ext) => format!("{stem}_{counter}.{ext}"),
            None => format!("{stem}_{counter}"),
        };
        let candidate = dir.join(name);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!()
}

async fn append_chunk(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new().append(true).open(path).await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}

/// Rename the staging file into place. On a cross-device rename failure,
/// copy to a sibling in the destination directory first so the final rename
/// stays atomic within one filesystem.
async fn move_into_place(temp: &Path, final_path: &Path) -> std::io::Result<()> {
    match fs::rename(temp, final_path).await {
        Ok(()) => Ok(()),
        Err(_) => {
            let staged = final_path.with_file_name(format!("{}.tmp", file_name_of(final_path)));
            fs::copy(temp, &staged).await?;
            fs::rename(&staged, final_path).await?;
            fs::remove_file(temp).await?;
            Ok(())
        }
    }
}

// ── Server ──────────────────────────────────────────────────────────────

/// HTTP server accepting file transfers from peers.
pub struct TransferServer {
    port: u16,
    download_dir: PathBuf,
    events: UnboundedSender<ServerEvent>,
    transfers: Arc<Mutex<HashMap<String, IncomingTransfer>>>,
    shutdown: Option<watch::Sender<()>>,
    serve_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl TransferServer {
    pub fn new(port: u16, download_dir: PathBuf, events: UnboundedSender<ServerEvent>) -> Self {
        Self {
            port,
            download_dir,
            events,
            transfers: Arc::new(Mutex::new(HashMap::new())),
            shutdown: None,
            serve_task: None,
            local_addr: None,
        }
    }

    /// Default server on the standard port and downloads directory.
    pub fn with_defaults(events: UnboundedSender<ServerEvent>) -> Self {
        Self::new(DEFAULT_PORT, util::default_downloads_dir(), events)
    }

    pub fn is_running(&self) -> bool {
        self.serve_task.is_some()
    }

    /// Bound address once the server is running; the port is meaningful when
    /// the server was constructed with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub async fn active_transfers(&self) -> usize {
        self.transfers.lock().await.len()
    }

    /// Bind `0.0.0.0:<port>` and start serving.
    pub async fn start(&mut self) -> Result<()> {
        if self.serve_task.is_some() {
            return Ok(());
        }

        fs::create_dir_all(&self.download_dir).await?;

        let state = AppState {
            transfers: self.transfers.clone(),
            download_dir: self.download_dir.clone(),
            events: self.events.clone(),
        };

        let app = Router::new()
            .route("/status", get(handle_status))
            .route("/transfer/init", post(handle_init))
            .route("/transfer/chunk", post(handle_chunk))
            .route("/transfer/complete", post(handle_complete))
            .route("/transfer/{transfer_id}/status", get(handle_transfer_status))
            .route("/transfer/{transfer_id}", delete(handle_cancel))
            // one request carries at most one chunk
            .layer(DefaultBodyLimit::max(CHUNK_SIZE * 2))
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr).await?;
        self.local_addr = Some(listener.local_addr()?);

        let (tx, mut rx) = watch::channel(());
        self.shutdown = Some(tx);

        info!("transfer server listening on {}", self.local_addr.unwrap());
        self.serve_task = Some(tokio::spawn(async move {
            let shutdown = async move {
                let _ = rx.changed().await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!("transfer server error: {}", e);
            }
        }));

        Ok(())
    }

    /// Stop serving and remove the staging files of unfinished transfers.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.serve_task.take() {
            let _ = task.await;
        }
        self.local_addr = None;

        let mut transfers = self.transfers.lock().await;
        for transfer in transfers.values() {
            let _ = fs::remove_file(&transfer.temp_path).await;
        }
        transfers.clear();
        info!("transfer server stopped");
    }
}
