//! HTTP client that sends files and folders to peers.
//!
//! Files are hashed up front, registered with the peer via `/transfer/init`,
//! then streamed as 1 MiB chunks with `Content-Range` headers. Failed chunks
//! are retried with exponential backoff; the same bytes and the same range
//! are resent, which is safe because the receiver only accepts a chunk whose
//! start equals its current offset. Folders are packed into a tarball first
//! and the archive is removed after the send.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::archive;
use crate::error::{Result, TransferError};
use crate::events::ClientEvent;
use crate::util::{
    self, CHUNK_SIZE, CONNECTION_TIMEOUT, INITIAL_RETRY_DELAY, MAX_RETRIES, MAX_RETRY_DELAY,
};

/// Status of an outgoing transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Connecting,
    Transferring,
    Retrying,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Connecting => "connecting",
            TransferStatus::Transferring => "transferring",
            TransferStatus::Retrying => "retrying",
            TransferStatus::Verifying => "verifying",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
            TransferStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outgoing transfer as observed by event listeners.
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingTransfer {
    /// File actually being sent; for folder sends this is the tarball until
    /// the send finishes, after which the folder path is surfaced.
    pub file_path: PathBuf,
    pub peer_url: String,
    /// Receiver-assigned id; empty until init succeeds.
    pub transfer_id: String,
    pub total_size: u64,
    pub sent_bytes: u64,
    pub file_hash: String,
    pub status: TransferStatus,
    pub error: Option<String>,
    pub retry_count: u32,
    /// Instantaneous speed in bytes per second.
    pub speed: f64,
    /// Path the user asked to send; the folder itself for archive sends.
    /// Cancellation is keyed on this path.
    pub original_path: PathBuf,
}

impl OutgoingTransfer {
    /// Progress as a percentage (0–100).
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        (self.sent_bytes as f64 / self.total_size as f64) * 100.0
    }

    pub fn filename(&self) -> String {
        self.file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Cancellation and active-transfer keys: `{peer_url}:{original_path}`.
pub fn transfer_key(peer_url: &str, path: &Path) -> String {
    format!("{}:{}", peer_url.trim_end_matches('/'), path.display())
}

#[derive(Debug, Deserialize)]
struct InitReply {
    transfer_id: String,
    #[serde(default)]
    resume_offset: u64,
}

/// Client for sending files to peers.
pub struct TransferClient {
    http: reqwest::Client,
    chunk_size: usize,
    max_retries: u32,
    cancel_flags: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
    events: UnboundedSender<ClientEvent>,
}

impl TransferClient {
    pub fn new(events: UnboundedSender<ClientEvent>) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(CONNECTION_TIMEOUT)
                .build()?,
            chunk_size: CHUNK_SIZE,
            max_retries: MAX_RETRIES,
            cancel_flags: Arc::new(Mutex::new(HashMap::new())),
            events,
        })
    }

    /// Override the chunk size (mainly for tests).
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Send a file or folder to a peer. Folders are packed into a tarball
    /// which is deleted after the send; the returned record surfaces the
    /// folder path, not the archive.
    pub async fn send_path(
        &self,
        path: &Path,
        peer_url: &str,
        resume_id: Option<&str>,
    ) -> Result<OutgoingTransfer> {
        if !path.exists() {
            return Err(TransferError::NotFound(path.to_path_buf()));
        }
        if path.is_dir() {
            self.send_folder(path, peer_url).await
        } else {
            self.send_file(path, peer_url, resume_id, None).await
        }
    }

    async fn send_folder(&self, folder: &Path, peer_url: &str) -> Result<OutgoingTransfer> {
        let staging = tempfile::tempdir()?;
        let archive_path = archive::pack(folder, staging.path()).await?;
        let mut transfer = self
            .send_file(&archive_path, peer_url, None, Some(folder))
            .await?;
        transfer.file_path = folder.to_path_buf();
        Ok(transfer)
        // staging dropped here, removing the archive
    }

    /// Send a single file. `original_path` is the user-visible path for
    /// folder sends so cancellation can find the in-flight archive send.
    pub async fn send_file(
        &self,
        file_path: &Path,
        peer_url: &str,
        resume_id: Option<&str>,
        original_path: Option<&Path>,
    ) -> Result<OutgoingTransfer> {
        if !file_path.is_file() {
            return Err(TransferError::NotFound(file_path.to_path_buf()));
        }

        let peer_url = peer_url.trim_end_matches('/').to_string();
        let total_size = fs::metadata(file_path).await?.len();
        let key_path = original_path.unwrap_or(file_path);
        let key = transfer_key(&peer_url, key_path);

        let mut transfer = OutgoingTransfer {
            file_path: file_path.to_path_buf(),
            peer_url,
            transfer_id: String::new(),
            total_size,
            sent_bytes: 0,
            file_hash: String::new(),
            status: TransferStatus::Pending,
            error: None,
            retry_count: 0,
            speed: 0.0,
            original_path: key_path.to_path_buf(),
        };

        let cancel = Arc::new(AtomicBool::new(false));
        self.cancel_flags
            .lock()
            .unwrap()
            .insert(key.clone(), cancel.clone());

        let result = self.run_transfer(&mut transfer, &cancel, resume_id).await;
        self.cancel_flags.lock().unwrap().remove(&key);

        if let Err(e) = result {
            if !transfer.status.is_terminal() {
                let message = e.to_string();
                transfer.status = TransferStatus::Failed;
                transfer.error = Some(message.clone());
                self.emit(ClientEvent::Failed {
                    transfer: transfer.clone(),
                    error: message,
                });
            }
        }

        Ok(transfer)
    }

    /// Mark the transfer for `path` at `peer_url` as cancelled. Takes effect
    /// at the next chunk boundary; no `/complete` is posted.
    pub fn cancel(&self, path: &Path, peer_url: &str) -> bool {
        self.cancel_by_key(&transfer_key(peer_url, path))
    }

    pub fn cancel_by_key(&self, key: &str) -> bool {
        match self.cancel_flags.lock().unwrap().get(key) {
            Some(flag) => {
                flag.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    async fn run_transfer(
        &self,
        transfer: &mut OutgoingTransfer,
        cancel: &AtomicBool,
        resume_id: Option<&str>,
    ) -> Result<()> {
        if cancel.load(Ordering::Relaxed) {
            transfer.status = TransferStatus::Cancelled;
            self.emit(ClientEvent::Cancelled(transfer.clone()));
            return Ok(());
        }

        transfer.status = TransferStatus::Connecting;
        transfer.file_hash = util::file_sha256(&transfer.file_path).await?;
        self.emit(ClientEvent::Started(transfer.clone()));

        let Some(reply) = self.init_transfer(transfer, resume_id).await? else {
            return Ok(());
        };
        transfer.transfer_id = reply.transfer_id;
        transfer.sent_bytes = reply.resume_offset;
        if reply.resume_offset > 0 {
            info!(
                "resuming {} from offset {}",
                transfer.filename(),
                reply.resume_offset
            );
        }

        self.send_chunks(transfer, cancel).await?;

        match transfer.status {
            TransferStatus::Transferring => self.complete_transfer(transfer).await?,
            TransferStatus::Cancelled => {
                info!("transfer of {} cancelled", transfer.filename());
                self.emit(ClientEvent::Cancelled(transfer.clone()));
            }
            _ => {}
        }
        Ok(())
    }

    async fn init_transfer(
        &self,
        transfer: &mut OutgoingTransfer,
        resume_id: Option<&str>,
    ) -> Result<Option<InitReply>> {
        let url = format!("{}/transfer/init", transfer.peer_url);
        let mut body = json!({
            "filename": transfer.filename(),
            "size": transfer.total_size,
            "hash": transfer.file_hash,
        });
        if let Some(id) = resume_id {
            body["resume_id"] = json!(id);
        }

        let response = match self.http.post(&url).json(&body).send().await {
            Ok(response) => response,
            Err(e) => {
                let message = format!("Connection error: {e}");
                transfer.status = TransferStatus::Failed;
                transfer.error = Some(message.clone());
                self.emit(ClientEvent::Failed {
                    transfer: transfer.clone(),
                    error: message,
                });
                return Ok(None);
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let message = error_message(response)
                .await
                .unwrap_or_else(|| format!("Server error ({status})"));
            transfer.status = TransferStatus::Failed;
            transfer.error = Some(message.clone());
            self.emit(ClientEvent::Failed {
                transfer: transfer.clone(),
                error: message,
            });
            return Ok(None);
        }

        Ok(Some(response.json::<InitReply>().await?))
    }

    async fn send_chunks(&self, transfer: &mut OutgoingTransfer, cancel: &AtomicBool) -> Result<()> {
        transfer.status = TransferStatus::Transferring;
        let url = format!("{}/transfer/chunk", transfer.peer_url);

        let mut file = fs::File::open(&transfer.file_path).await?;
        file.seek(SeekFrom::Start(transfer.sent_bytes)).await?;

        let mut retry_delay = INITIAL_RETRY_DELAY;
        let mut last_tick = Instant::now();
        let mut last_sent = transfer.sent_bytes;
        let mut buf = vec![0u8; self.chunk_size];

        while transfer.sent_bytes < transfer.total_size {
            // cancellation is observable only at chunk boundaries
            if cancel.load(Ordering::Relaxed) {
                transfer.status = TransferStatus::Cancelled;
                return Ok(());
            }

            let remaining = (transfer.total_size - transfer.sent_bytes) as usize;
            let want = remaining.min(self.chunk_size);
            let n = read_full(&mut file, &mut buf[..want]).await?;
            if n == 0 {
                break;
            }
            let chunk_start = transfer.sent_bytes;
            let chunk_end = chunk_start + n as u64 - 1;

            let mut attempt = 0u32;
            loop {
                match self
                    .post_chunk(&url, transfer, chunk_start, chunk_end, &buf[..n])
                    .await
                {
                    Ok(()) => {
                        transfer.retry_count = 0;
                        retry_delay = INITIAL_RETRY_DELAY;
                        transfer.sent_bytes += n as u64;

                        let elapsed = last_tick.elapsed();
                        if elapsed.as_secs_f64() >= 0.5 {
                            transfer.speed =
                                (transfer.sent_bytes - last_sent) as f64 / elapsed.as_secs_f64();
                            last_tick = Instant::now();
                            last_sent = transfer.sent_bytes;
                        }

                        self.emit(ClientEvent::Progress(transfer.clone()));
                        break;
                    }
                    Err(message) => {
                        attempt += 1;
                        transfer.retry_count = attempt;
                        transfer.status = TransferStatus::Retrying;

                        if attempt > self.max_retries {
                            let error = format!("Max retries exceeded: {message}");
                            transfer.status = TransferStatus::Failed;
                            transfer.error = Some(error.clone());
                            self.emit(ClientEvent::Failed {
                                transfer: transfer.clone(),
                                error,
                            });
                            return Ok(());
                        }

                        warn!(
                            "chunk at {} rejected ({}); retry {}/{} in {:?}",
                            chunk_start, message, attempt, self.max_retries, retry_delay
                        );
                        tokio::time::sleep(retry_delay).await;
                        retry_delay = std::cmp::min(retry_delay * 2, MAX_RETRY_DELAY);

                        // resend the same bytes with the same range
                        file.seek(SeekFrom::Start(chunk_start)).await?;
                        read_full(&mut file, &mut buf[..n]).await?;
                    }
                }
            }

            transfer.status = TransferStatus::Transferring;
        }
        Ok(())
    }

    async fn post_chunk(
        &self,
        url: &str,
        transfer: &OutgoingTransfer,
        start: u64,
        end: u64,
        data: &[u8],
    ) -> std::result::Result<(), String> {
        let response = self
            .http
            .post(url)
            .header("X-Transfer-ID", &transfer.transfer_id)
            .header(
                CONTENT_RANGE,
                format!("bytes {start}-{end}/{}", transfer.total_size),
            )
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status();
        Err(error_message(response)
            .await
            .unwrap_or_else(|| format!("Server error: {status}")))
    }

    async fn complete_transfer(&self, transfer: &mut OutgoingTransfer) -> Result<()> {
        transfer.status = TransferStatus::Verifying;
        let url = format!("{}/transfer/complete", transfer.peer_url);
        let body = json!({"transfer_id": transfer.transfer_id});

        match self.http.post(&url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                transfer.status = TransferStatus::Completed;
                transfer.speed = 0.0;
                info!(
                    "sent {} ({}) to {}",
                    transfer.filename(),
                    util::format_size(transfer.total_size),
                    transfer.peer_url
                );
                self.emit(ClientEvent::Completed(transfer.clone()));
            }
            Ok(response) => {
                let message = error_message(response)
                    .await
                    .unwrap_or_else(|| "Transfer verification failed".to_string());
                transfer.status = TransferStatus::Failed;
                transfer.error = Some(message.clone());
                self.emit(ClientEvent::Failed {
                    transfer: transfer.clone(),
                    error: message,
                });
            }
            Err(e) => {
                let message = format!("Failed to complete transfer: {e}");
                transfer.status = TransferStatus::Failed;
                transfer.error = Some(message.clone());
                self.emit(ClientEvent::Failed {
                    transfer: transfer.clone(),
                    error: message,
                });
            }
        }
        Ok(())
    }
}

/// Pull the `error` field out of a JSON error body, if there is one.
async fn error_message(response: reqwest::Response) -> Option<String> {
    response
        .json::<serde_json::Value>()
        .await
        .ok()?
        .get("error")?
        .as_str()
        .map(String::from)
}

/// Read until `buf` is full or EOF; a single `read` may return short.
async fn read_full(file: &mut fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = file.read(&mut buf[total..]).await?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}
