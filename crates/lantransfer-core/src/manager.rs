//! Queue of outgoing and incoming transfers.
//!
//! The manager owns a [`TransferServer`] and a [`TransferClient`], wires
//! their event streams into a unified queue model, and republishes a
//! consolidated [`AppEvent`] stream for the front-end. Outgoing sends are
//! serialized through a single background worker consuming a FIFO job
//! channel; concurrent sends would only need more workers, the per-transfer
//! contract stays the same.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::client::{transfer_key, OutgoingTransfer, TransferClient, TransferStatus};
use crate::discovery::Peer;
use crate::error::{Result, TransferError};
use crate::events::{AppEvent, ClientEvent, ServerEvent};
use crate::server::{IncomingSnapshot, TransferServer};
use crate::state::{PersistedTransfer, StateStore, TransferDirection};
use crate::util::{self, DEFAULT_PORT};

/// Manager configuration; defaults match the on-disk layout in
/// `~/.lantransfer`.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub port: u16,
    pub download_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            download_dir: util::default_downloads_dir(),
            data_dir: util::default_data_dir(),
        }
    }
}

/// Front-end-facing view of one transfer, outgoing or incoming.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedTransfer {
    /// Manager-assigned 8-hex id for outgoing transfers; equals the
    /// receiver's transfer-id for incoming ones.
    pub id: String,
    pub direction: TransferDirection,
    /// Filename shown to the user; folders carry a trailing `/`.
    pub filename: String,
    pub total_size: u64,
    pub transferred_bytes: u64,
    pub status: TransferStatus,
    pub peer_name: String,
    pub peer_address: String,
    pub error: Option<String>,
    pub speed: f64,

    #[serde(skip)]
    pub(crate) file_path: Option<PathBuf>,
    #[serde(skip)]
    pub(crate) peer_url: Option<String>,
    #[serde(skip)]
    pub(crate) outgoing_key: Option<String>,
    #[serde(skip)]
    pub(crate) transfer_id: Option<String>,
}

impl QueuedTransfer {
    /// Progress as a percentage (0–100).
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        (self.transferred_bytes as f64 / self.total_size as f64) * 100.0
    }

    /// Human-readable progress, e.g. `"1.0 MB / 3.0 MB (33.3%)"`.
    pub fn progress_text(&self) -> String {
        format!(
            "{} / {} ({:.1}%)",
            util::format_size(self.transferred_bytes),
            util::format_size(self.total_size),
            self.progress()
        )
    }

    pub fn speed_text(&self) -> String {
        if self.speed <= 0.0 {
            return String::new();
        }
        util::format_speed(self.speed)
    }

    /// Estimated time remaining, empty when the speed is unknown.
    pub fn eta_text(&self) -> String {
        if self.speed <= 0.0 || self.transferred_bytes >= self.total_size {
            return String::new();
        }
        let remaining = (self.total_size - self.transferred_bytes) as f64;
        util::format_time(remaining / self.speed)
    }

    pub fn direction_label(&self) -> &'static str {
        match self.direction {
            TransferDirection::Outgoing => "outgoing",
            TransferDirection::Incoming => "incoming",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            TransferStatus::Connecting
                | TransferStatus::Transferring
                | TransferStatus::Retrying
                | TransferStatus::Verifying
        )
    }
}

struct SendJob {
    queue_id: String,
    path: PathBuf,
    peer_url: String,
}

struct Shared {
    queue: Mutex<HashMap<String, QueuedTransfer>>,
    events: UnboundedSender<AppEvent>,
    state: StateStore,
}

impl Shared {
    fn notify_queue_updated(&self) {
        let _ = self.events.send(AppEvent::QueueUpdated);
    }
}

/// Coordinates all transfers and surfaces them as one queue.
pub struct TransferManager {
    server: TransferServer,
    client: Arc<TransferClient>,
    shared: Arc<Shared>,
    jobs: UnboundedSender<SendJob>,
    jobs_rx: Option<UnboundedReceiver<SendJob>>,
    server_events: Option<UnboundedReceiver<ServerEvent>>,
    client_events: Option<UnboundedReceiver<ClientEvent>>,
    tasks: Vec<JoinHandle<()>>,
    running: bool,
}

impl TransferManager {
    pub fn new(config: ManagerConfig, app_events: UnboundedSender<AppEvent>) -> Result<Self> {
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            queue: Mutex::new(HashMap::new()),
            events: app_events,
            state: StateStore::load(&config.data_dir),
        });

        Ok(Self {
            server: TransferServer::new(config.port, config.download_dir, server_tx),
            client: Arc::new(TransferClient::new(client_tx)?),
            shared,
            jobs: jobs_tx,
            jobs_rx: Some(jobs_rx),
            server_events: Some(server_rx),
            client_events: Some(client_rx),
            tasks: Vec::new(),
            running: false,
        })
    }

    /// Port the receiver is bound to once running.
    pub fn port(&self) -> Option<u16> {
        self.server.local_addr().map(|addr| addr.port())
    }

    pub fn download_dir(&self) -> &Path {
        self.server.download_dir()
    }

    /// Start the receiver, the event wiring, and the send worker. A stopped
    /// manager is not restartable; build a new one instead.
    pub async fn start(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }

        self.server.start().await?;

        let server_rx = self.server_events.take();
        let client_rx = self.client_events.take();
        let jobs_rx = self.jobs_rx.take();
        let (Some(server_rx), Some(client_rx), Some(jobs_rx)) = (server_rx, client_rx, jobs_rx)
        else {
            return Err(TransferError::Internal(
                "manager cannot be restarted after stop".into(),
            ));
        };

        self.tasks.push(tokio::spawn(run_server_events(
            self.shared.clone(),
            server_rx,
        )));
        self.tasks.push(tokio::spawn(run_client_events(
            self.shared.clone(),
            client_rx,
        )));
        self.tasks.push(tokio::spawn(run_send_worker(
            self.shared.clone(),
            self.client.clone(),
            jobs_rx,
        )));

        self.running = true;
        info!("transfer manager started");
        Ok(())
    }

    /// Stop the worker and the receiver.
    pub async fn stop(&mut self) {
        if !self.running {
            return;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.server.stop().await;
        self.running = false;
        info!("transfer manager stopped");
    }

    /// Queue a file or folder for sending. Returns the queue-id.
    pub fn queue_send(&self, path: &Path, peer: &Peer) -> Result<String> {
        if !path.exists() {
            return Err(TransferError::NotFound(path.to_path_buf()));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (total_size, filename) = if path.is_dir() {
            (util::folder_size(path), format!("{name}/"))
        } else {
            (std::fs::metadata(path)?.len(), name)
        };

        let queue_id = util::generate_transfer_id();
        let queued = QueuedTransfer {
            id: queue_id.clone(),
            direction: TransferDirection::Outgoing,
            filename,
            total_size,
            transferred_bytes: 0,
            status: TransferStatus::Pending,
            peer_name: peer.name.clone(),
            peer_address: peer.address.to_string(),
            error: None,
            speed: 0.0,
            file_path: Some(path.to_path_buf()),
            peer_url: Some(peer.url()),
            outgoing_key: None,
            transfer_id: None,
        };

        self.shared
            .queue
            .lock()
            .unwrap()
            .insert(queue_id.clone(), queued);
        let _ = self.jobs.send(SendJob {
            queue_id: queue_id.clone(),
            path: path.to_path_buf(),
            peer_url: peer.url(),
        });

        info!("queued {} for {}", path.display(), peer.name);
        self.shared.notify_queue_updated();
        Ok(queue_id)
    }

    /// Cancel a queued or active transfer. Returns false for unknown ids and
    /// for transfers that already completed.
    pub fn cancel_transfer(&self, queue_id: &str) -> bool {
        let (cancel_args, transfer_id) = {
            let mut queue = self.shared.queue.lock().unwrap();
            let Some(entry) = queue.get_mut(queue_id) else {
                return false;
            };
            if entry.status == TransferStatus::Completed {
                return false;
            }
            entry.status = TransferStatus::Cancelled;
            (
                entry.file_path.clone().zip(entry.peer_url.clone()),
                entry.transfer_id.clone(),
            )
        };

        // The flag is set synchronously so the sender's next chunk-boundary
        // check observes it.
        if let Some((path, url)) = cancel_args {
            self.client.cancel(&path, &url);
        }
        if let Some(id) = transfer_id {
            self.shared.state.remove(&id);
        }

        self.shared.notify_queue_updated();
        true
    }

    /// Drop all terminal entries from the queue.
    pub fn clear_completed(&self) {
        self.shared
            .queue
            .lock()
            .unwrap()
            .retain(|_, entry| !entry.status.is_terminal());
        self.shared.notify_queue_updated();
    }

    /// All transfers currently in the queue.
    pub fn queue(&self) -> Vec<QueuedTransfer> {
        self.shared.queue.lock().unwrap().values().cloned().collect()
    }

    pub fn get(&self, queue_id: &str) -> Option<QueuedTransfer> {
        self.shared.queue.lock().unwrap().get(queue_id).cloned()
    }

    pub fn active_transfers(&self) -> Vec<QueuedTransfer> {
        self.queue().into_iter().filter(|t| t.is_active()).collect()
    }

    pub fn completed_transfers(&self) -> Vec<QueuedTransfer> {
        self.queue()
            .into_iter()
            .filter(|t| t.status == TransferStatus::Completed)
            .collect()
    }

    /// Persisted transfers that could be resumed in this run.
    pub fn resumable_transfers(&self) -> Vec<PersistedTransfer> {
        self.shared.state.get_resumable()
    }
}

// ── Background tasks ────────────────────────────────────────────────────

/// Consume the send-job channel, one transfer at a time in FIFO order.
async fn run_send_worker(
    shared: Arc<Shared>,
    client: Arc<TransferClient>,
    mut jobs: UnboundedReceiver<SendJob>,
) {
    while let Some(job) = jobs.recv().await {
        let skip = {
            let queue = shared.queue.lock().unwrap();
            match queue.get(&job.queue_id) {
                None => true,
                Some(entry) => entry.status == TransferStatus::Cancelled,
            }
        };
        if skip {
            continue;
        }

        if let Err(e) = client.send_path(&job.path, &job.peer_url, None).await {
            // keep the worker alive; surface the failure on the queue entry
            warn!("send worker error for {}: {}", job.path.display(), e);
            let failed = {
                let mut queue = shared.queue.lock().unwrap();
                queue.get_mut(&job.queue_id).and_then(|entry| {
                    if entry.status.is_terminal() {
                        return None;
                    }
                    entry.status = TransferStatus::Failed;
                    entry.error = Some(e.to_string());
                    Some(entry.clone())
                })
            };
            if let Some(failed) = failed {
                shared.notify_queue_updated();
                let _ = shared.events.send(AppEvent::TransferFailed(failed));
            }
        }
    }
}

/// Mirror receiver events into the queue.
async fn run_server_events(shared: Arc<Shared>, mut events: UnboundedReceiver<ServerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ServerEvent::Started(snapshot) => {
                let queued = incoming_entry(&snapshot);
                shared.state.save_incoming(
                    &snapshot.transfer_id,
                    &snapshot.filename,
                    snapshot.total_size,
                    snapshot.received_bytes,
                    &snapshot.expected_hash,
                );
                shared
                    .queue
                    .lock()
                    .unwrap()
                    .insert(snapshot.transfer_id.clone(), queued);
                shared.notify_queue_updated();
            }
            ServerEvent::Progress(snapshot) => {
                let matched = {
                    let mut queue = shared.queue.lock().unwrap();
                    queue
                        .get_mut(&snapshot.transfer_id)
                        .map(|entry| {
                            entry.transferred_bytes =
                                snapshot.received_bytes.min(entry.total_size);
                        })
                        .is_some()
                };
                if matched {
                    shared.state.save_incoming(
                        &snapshot.transfer_id,
                        &snapshot.filename,
                        snapshot.total_size,
                        snapshot.received_bytes,
                        &snapshot.expected_hash,
                    );
                    shared.notify_queue_updated();
                }
            }
            ServerEvent::Completed(snapshot) => {
                let completed = {
                    let mut queue = shared.queue.lock().unwrap();
                    queue.get_mut(&snapshot.transfer_id).map(|entry| {
                        entry.status = TransferStatus::Completed;
                        entry.transferred_bytes = entry.total_size;
                        entry.clone()
                    })
                };
                shared.state.complete(&snapshot.transfer_id);
                if let Some(completed) = completed {
                    shared.notify_queue_updated();
                    let _ = shared.events.send(AppEvent::TransferCompleted(completed));
                }
            }
            ServerEvent::Failed { transfer, error } => {
                let failed = {
                    let mut queue = shared.queue.lock().unwrap();
                    queue.get_mut(&transfer.transfer_id).map(|entry| {
                        entry.status = TransferStatus::Failed;
                        entry.error = Some(error.clone());
                        entry.clone()
                    })
                };
                shared.state.fail(&transfer.transfer_id);
                if let Some(failed) = failed {
                    shared.notify_queue_updated();
                    let _ = shared.events.send(AppEvent::TransferFailed(failed));
                }
            }
        }
    }
}

fn incoming_entry(snapshot: &IncomingSnapshot) -> QueuedTransfer {
    QueuedTransfer {
        id: snapshot.transfer_id.clone(),
        direction: TransferDirection::Incoming,
        filename: snapshot.filename.clone(),
        total_size: snapshot.total_size,
        transferred_bytes: snapshot.received_bytes,
        status: TransferStatus::Transferring,
        peer_name: String::new(),
        peer_address: String::new(),
        error: None,
        speed: 0.0,
        file_path: None,
        peer_url: None,
        outgoing_key: None,
        transfer_id: Some(snapshot.transfer_id.clone()),
    }
}

/// Mirror sender events into the queue.
async fn run_client_events(shared: Arc<Shared>, mut events: UnboundedReceiver<ClientEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Started(transfer) => {
                let key = transfer_key(&transfer.peer_url, &transfer.original_path);
                let matched = {
                    let mut queue = shared.queue.lock().unwrap();
                    queue
                        .values_mut()
                        .find(|entry| {
                            entry.direction == TransferDirection::Outgoing
                                && entry.outgoing_key.is_none()
                                && !entry.status.is_terminal()
                                && entry.file_path.as_deref()
                                    == Some(transfer.original_path.as_path())
                        })
                        .map(|entry| {
                            entry.outgoing_key = Some(key);
                            entry.status = TransferStatus::Connecting;
                        })
                        .is_some()
                };
                if matched {
                    shared.notify_queue_updated();
                }
            }
            ClientEvent::Progress(transfer) => {
                let (matched, peer_name) = {
                    let mut queue = shared.queue.lock().unwrap();
                    match find_outgoing(&mut queue, &transfer) {
                        Some(entry) => {
                            entry.transferred_bytes = transfer.sent_bytes.min(entry.total_size);
                            entry.status = transfer.status;
                            entry.speed = transfer.speed;
                            if !transfer.transfer_id.is_empty() {
                                entry.transfer_id = Some(transfer.transfer_id.clone());
                            }
                            (true, entry.peer_name.clone())
                        }
                        None => (false, String::new()),
                    }
                };
                if matched {
                    persist_outgoing(&shared, &transfer, &peer_name);
                    shared.notify_queue_updated();
                }
            }
            ClientEvent::Completed(transfer) => {
                let completed = {
                    let mut queue = shared.queue.lock().unwrap();
                    find_outgoing(&mut queue, &transfer).map(|entry| {
                        entry.status = TransferStatus::Completed;
                        entry.transferred_bytes = entry.total_size;
                        entry.speed = 0.0;
                        entry.clone()
                    })
                };
                if !transfer.transfer_id.is_empty() {
                    shared.state.complete(&transfer.transfer_id);
                }
                if let Some(completed) = completed {
                    shared.notify_queue_updated();
                    let _ = shared.events.send(AppEvent::TransferCompleted(completed));
                }
            }
            ClientEvent::Failed { transfer, error } => {
                let failed = {
                    let mut queue = shared.queue.lock().unwrap();
                    find_outgoing(&mut queue, &transfer).map(|entry| {
                        entry.status = TransferStatus::Failed;
                        entry.error = Some(error.clone());
                        entry.clone()
                    })
                };
                if !transfer.transfer_id.is_empty() {
                    shared.state.fail(&transfer.transfer_id);
                }
                if let Some(failed) = failed {
                    shared.notify_queue_updated();
                    let _ = shared.events.send(AppEvent::TransferFailed(failed));
                }
            }
            ClientEvent::Cancelled(transfer) => {
                let matched = {
                    let mut queue = shared.queue.lock().unwrap();
                    find_outgoing(&mut queue, &transfer)
                        .map(|entry| entry.status = TransferStatus::Cancelled)
                        .is_some()
                };
                if !transfer.transfer_id.is_empty() {
                    shared.state.remove(&transfer.transfer_id);
                }
                if matched {
                    shared.notify_queue_updated();
                }
            }
        }
    }
}

fn find_outgoing<'q>(
    queue: &'q mut HashMap<String, QueuedTransfer>,
    transfer: &OutgoingTransfer,
) -> Option<&'q mut QueuedTransfer> {
    let key = transfer_key(&transfer.peer_url, &transfer.original_path);
    queue.values_mut().find(|entry| {
        entry.outgoing_key.as_deref() == Some(key.as_str()) && !entry.status.is_terminal()
    })
}

/// Persist resumable state for plain-file sends. Archive sends are skipped:
/// the tarball is rebuilt per send, so its hash and offsets do not survive
/// the staging directory.
fn persist_outgoing(shared: &Shared, transfer: &OutgoingTransfer, peer_name: &str) {
    if transfer.transfer_id.is_empty() || transfer.original_path != transfer.file_path {
        return;
    }
    shared.state.save_outgoing(
        &transfer.transfer_id,
        &transfer.file_path,
        &transfer.peer_url,
        peer_name,
        transfer.total_size,
        transfer.sent_bytes,
        &transfer.file_hash,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn test_peer() -> Peer {
        Peer {
            name: "Beta Laptop".into(),
            address: "192.168.1.20".parse().unwrap(),
            port: 8765,
            device_id: "beta._lantransfer._tcp.local.".into(),
        }
    }

    fn sample_entry() -> QueuedTransfer {
        QueuedTransfer {
            id: "a1b2c3d4".into(),
            direction: TransferDirection::Outgoing,
            filename: "movie.mkv".into(),
            total_size: 3_145_728,
            transferred_bytes: 1_048_576,
            status: TransferStatus::Transferring,
            peer_name: "Beta Laptop".into(),
            peer_address: "192.168.1.20".into(),
            error: None,
            speed: 1_048_576.0,
            file_path: None,
            peer_url: None,
            outgoing_key: None,
            transfer_id: None,
        }
    }

    #[test]
    fn progress_and_texts() {
        let entry = sample_entry();
        assert_eq!(entry.progress_text(), "1.0 MB / 3.0 MB (33.3%)");
        assert_eq!(entry.speed_text(), "1.0 MB/s");
        assert_eq!(entry.eta_text(), "2s");
        assert!(entry.is_active());
    }

    #[test]
    fn idle_entry_has_no_speed_or_eta() {
        let mut entry = sample_entry();
        entry.speed = 0.0;
        entry.status = TransferStatus::Pending;
        assert_eq!(entry.speed_text(), "");
        assert_eq!(entry.eta_text(), "");
        assert!(!entry.is_active());
    }

    #[tokio::test]
    async fn queue_send_then_cancel_then_clear() {
        let downloads = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        let file = source.path().join("notes.txt");
        std::fs::write(&file, b"some notes").unwrap();

        let (app_tx, mut app_rx) = mpsc::unbounded_channel();
        let manager = TransferManager::new(
            ManagerConfig {
                port: 0,
                download_dir: downloads.path().to_path_buf(),
                data_dir: data.path().to_path_buf(),
            },
            app_tx,
        )
        .unwrap();

        let queue_id = manager.queue_send(&file, &test_peer()).unwrap();
        assert!(matches!(app_rx.try_recv().unwrap(), AppEvent::QueueUpdated));

        let entry = manager.get(&queue_id).unwrap();
        assert_eq!(entry.status, TransferStatus::Pending);
        assert_eq!(entry.filename, "notes.txt");
        assert_eq!(entry.total_size, 10);

        assert!(manager.cancel_transfer(&queue_id));
        assert_eq!(manager.get(&queue_id).unwrap().status, TransferStatus::Cancelled);

        // a second cancel still reports true; only completed refuses
        assert!(manager.cancel_transfer(&queue_id));
        assert!(!manager.cancel_transfer("unknown1"));

        manager.clear_completed();
        assert!(manager.queue().is_empty());
    }

    #[tokio::test]
    async fn queue_send_folder_uses_trailing_slash_and_recursive_size() {
        let downloads = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        let folder = source.path().join("album");
        std::fs::create_dir_all(folder.join("sub")).unwrap();
        std::fs::write(folder.join("one.txt"), vec![1u8; 100]).unwrap();
        std::fs::write(folder.join("sub/two.txt"), vec![2u8; 150]).unwrap();

        let (app_tx, _app_rx) = mpsc::unbounded_channel();
        let manager = TransferManager::new(
            ManagerConfig {
                port: 0,
                download_dir: downloads.path().to_path_buf(),
                data_dir: data.path().to_path_buf(),
            },
            app_tx,
        )
        .unwrap();

        let queue_id = manager.queue_send(&folder, &test_peer()).unwrap();
        let entry = manager.get(&queue_id).unwrap();
        assert_eq!(entry.filename, "album/");
        assert_eq!(entry.total_size, 250);
    }

    #[tokio::test]
    async fn queue_send_missing_path_errors() {
        let downloads = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let (app_tx, _app_rx) = mpsc::unbounded_channel();
        let manager = TransferManager::new(
            ManagerConfig {
                port: 0,
                download_dir: downloads.path().to_path_buf(),
                data_dir: data.path().to_path_buf(),
            },
            app_tx,
        )
        .unwrap();

        let err = manager
            .queue_send(Path::new("/tmp/does-not-exist.bin"), &test_peer())
            .unwrap_err();
        assert!(matches!(err, TransferError::NotFound(_)));
    }
}
