//! Durable transfer state for cross-run resumption.
//!
//! A single JSON document (`transfers.json` under the data directory) holds
//! one record per in-flight transfer. Entries expire 24 hours after their
//! last update; the sweep runs on load and before every save. A corrupted
//! document resets the store to empty rather than failing startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const STATE_FILE: &str = "transfers.json";

/// Seconds after which an untouched record is discarded.
pub const STATE_EXPIRY_SECS: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Outgoing,
    Incoming,
}

/// Persisted record of a transfer, enough to offer resumption later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedTransfer {
    pub transfer_id: String,
    /// Source path for outgoing transfers; empty for incoming.
    pub file_path: String,
    pub filename: String,
    /// Peer base URL for outgoing transfers; empty for incoming.
    pub peer_url: String,
    pub peer_name: String,
    pub total_size: u64,
    pub transferred_bytes: u64,
    pub file_hash: String,
    pub direction: TransferDirection,
    pub created_at: i64,
    pub updated_at: i64,
}

impl PersistedTransfer {
    fn is_expired(&self, now: i64) -> bool {
        now - self.updated_at > STATE_EXPIRY_SECS
    }

    /// Whether the transfer still has bytes to move and, for outgoing
    /// transfers, whether the source file is still present.
    pub fn can_resume(&self) -> bool {
        if self.transferred_bytes >= self.total_size {
            return false;
        }
        match self.direction {
            TransferDirection::Outgoing => Path::new(&self.file_path).exists(),
            TransferDirection::Incoming => true,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StateDocument {
    version: u32,
    transfers: Vec<PersistedTransfer>,
}

/// On-disk store of in-flight transfer state.
pub struct StateStore {
    path: PathBuf,
    states: Mutex<HashMap<String, PersistedTransfer>>,
}

impl StateStore {
    /// Load the store from `<data_dir>/transfers.json`, dropping expired
    /// entries and recovering from corruption by starting empty.
    pub fn load(data_dir: &Path) -> Self {
        let path = data_dir.join(STATE_FILE);
        let mut states = HashMap::new();

        match std::fs::read(&path) {
            Ok(raw) => match serde_json::from_slice::<StateDocument>(&raw) {
                Ok(doc) => {
                    let now = now_secs();
                    for state in doc.transfers {
                        if !state.is_expired(now) {
                            states.insert(state.transfer_id.clone(), state);
                        }
                    }
                }
                Err(e) => {
                    warn!("corrupted state file {}, starting fresh: {}", path.display(), e);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("failed to read state file {}: {}", path.display(), e);
            }
        }

        Self {
            path,
            states: Mutex::new(states),
        }
    }

    /// Save or update an outgoing transfer record.
    #[allow(clippy::too_many_arguments)]
    pub fn save_outgoing(
        &self,
        transfer_id: &str,
        file_path: &Path,
        peer_url: &str,
        peer_name: &str,
        total_size: u64,
        sent_bytes: u64,
        file_hash: &str,
    ) {
        let now = now_secs();
        let mut states = self.states.lock().unwrap();
        states
            .entry(transfer_id.to_string())
            .and_modify(|state| {
                state.transferred_bytes = sent_bytes;
                state.updated_at = now;
            })
            .or_insert_with(|| PersistedTransfer {
                transfer_id: transfer_id.to_string(),
                file_path: file_path.display().to_string(),
                filename: file_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                peer_url: peer_url.to_string(),
                peer_name: peer_name.to_string(),
                total_size,
                transferred_bytes: sent_bytes,
                file_hash: file_hash.to_string(),
                direction: TransferDirection::Outgoing,
                created_at: now,
                updated_at: now,
            });
        self.write(&mut states);
    }

    /// Save or update an incoming transfer record.
    pub fn save_incoming(
        &self,
        transfer_id: &str,
        filename: &str,
        total_size: u64,
        received_bytes: u64,
        expected_hash: &str,
    ) {
        let now = now_secs();
        let mut states = self.states.lock().unwrap();
        states
            .entry(transfer_id.to_string())
            .and_modify(|state| {
                state.transferred_bytes = received_bytes;
                state.updated_at = now;
            })
            .or_insert_with(|| PersistedTransfer {
                transfer_id: transfer_id.to_string(),
                file_path: String::new(),
                filename: filename.to_string(),
                peer_url: String::new(),
                peer_name: String::new(),
                total_size,
                transferred_bytes: received_bytes,
                file_hash: expected_hash.to_string(),
                direction: TransferDirection::Incoming,
                created_at: now,
                updated_at: now,
            });
        self.write(&mut states);
    }

    pub fn get(&self, transfer_id: &str) -> Option<PersistedTransfer> {
        self.states.lock().unwrap().get(transfer_id).cloned()
    }

    /// Records that still have bytes to move and a usable source.
    pub fn get_resumable(&self) -> Vec<PersistedTransfer> {
        self.states
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.can_resume())
            .cloned()
            .collect()
    }

    /// Find a resumable outgoing record for a source file and peer.
    pub fn get_outgoing_by_file(&self, file_path: &Path, peer_url: &str) -> Option<PersistedTransfer> {
        let wanted = file_path.display().to_string();
        self.states
            .lock()
            .unwrap()
            .values()
            .find(|s| {
                s.direction == TransferDirection::Outgoing
                    && s.file_path == wanted
                    && s.peer_url == peer_url
                    && s.can_resume()
            })
            .cloned()
    }

    /// Records that still have bytes left to move, regardless of direction.
    pub fn pending_transfers(&self) -> Vec<PersistedTransfer> {
        self.states
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.transferred_bytes < s.total_size)
            .cloned()
            .collect()
    }

    pub fn outgoing_transfers(&self) -> Vec<PersistedTransfer> {
        self.filtered_by_direction(TransferDirection::Outgoing)
    }

    pub fn incoming_transfers(&self) -> Vec<PersistedTransfer> {
        self.filtered_by_direction(TransferDirection::Incoming)
    }

    fn filtered_by_direction(&self, direction: TransferDirection) -> Vec<PersistedTransfer> {
        self.states
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.direction == direction)
            .cloned()
            .collect()
    }

    /// Transfer finished; drop its record.
    pub fn complete(&self, transfer_id: &str) {
        let mut states = self.states.lock().unwrap();
        if states.remove(transfer_id).is_some() {
            self.write(&mut states);
        }
    }

    /// Transfer failed; keep the record for a later retry but refresh its
    /// timestamp so expiry counts from the failure.
    pub fn fail(&self, transfer_id: &str) {
        let mut states = self.states.lock().unwrap();
        if let Some(state) = states.get_mut(transfer_id) {
            state.updated_at = now_secs();
            self.write(&mut states);
        }
    }

    pub fn remove(&self, transfer_id: &str) {
        let mut states = self.states.lock().unwrap();
        if states.remove(transfer_id).is_some() {
            self.write(&mut states);
        }
    }

    pub fn clear_all(&self) {
        let mut states = self.states.lock().unwrap();
        states.clear();
        self.write(&mut states);
    }

    fn write(&self, states: &mut HashMap<String, PersistedTransfer>) {
        let now = now_secs();
        states.retain(|_, state| !state.is_expired(now));

        if let Some(parent) = self.path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("failed to create data dir {}: {}", parent.display(), e);
                return;
            }
        }

        let doc = StateDocument {
            version: 1,
            transfers: states.values().cloned().collect(),
        };
        match serde_json::to_vec_pretty(&doc) {
            Ok(raw) => {
                if let Err(e) = std::fs::write(&self.path, raw) {
                    warn!("failed to write state file {}: {}", self.path.display(), e);
                } else {
                    debug!("persisted {} transfer state(s)", states.len());
                }
            }
            Err(e) => warn!("failed to serialize transfer state: {}", e),
        }
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("report.pdf");
        std::fs::write(&source, b"data").unwrap();

        let store = StateStore::load(dir.path());
        store.save_outgoing(
            "a1b2c3d4",
            &source,
            "http://192.168.1.20:8765",
            "Beta Laptop",
            4096,
            1024,
            "deadbeef",
        );

        let reloaded = StateStore::load(dir.path());
        let state = reloaded.get("a1b2c3d4").unwrap();
        assert_eq!(state.filename, "report.pdf");
        assert_eq!(state.transferred_bytes, 1024);
        assert_eq!(state.direction, TransferDirection::Outgoing);
        assert!(state.can_resume());
    }

    #[test]
    fn update_preserves_created_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::load(dir.path());
        store.save_incoming("feedc0de", "movie.mkv", 100, 10, "");
        let first = store.get("feedc0de").unwrap();

        store.save_incoming("feedc0de", "movie.mkv", 100, 60, "");
        let second = store.get("feedc0de").unwrap();
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.transferred_bytes, 60);
    }

    #[test]
    fn complete_removes_and_fail_keeps() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::load(dir.path());
        store.save_incoming("11111111", "a.bin", 100, 10, "");
        store.save_incoming("22222222", "b.bin", 100, 10, "");

        store.complete("11111111");
        assert!(store.get("11111111").is_none());

        store.fail("22222222");
        assert!(store.get("22222222").is_some());
    }

    #[test]
    fn expired_entries_are_dropped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let doc = serde_json::json!({
            "version": 1,
            "transfers": [{
                "transfer_id": "00000000",
                "file_path": "",
                "filename": "old.bin",
                "peer_url": "",
                "peer_name": "",
                "total_size": 100,
                "transferred_bytes": 10,
                "file_hash": "",
                "direction": "incoming",
                "created_at": 0,
                "updated_at": 0,
            }],
        });
        std::fs::write(dir.path().join(STATE_FILE), doc.to_string()).unwrap();

        let store = StateStore::load(dir.path());
        assert!(store.get("00000000").is_none());
    }

    #[test]
    fn corrupted_document_resets_store() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(STATE_FILE), b"{not json").unwrap();

        let store = StateStore::load(dir.path());
        assert!(store.get_resumable().is_empty());

        // the store still accepts writes afterwards
        store.save_incoming("abcdef01", "x.bin", 10, 0, "");
        assert!(store.get("abcdef01").is_some());
    }

    #[test]
    fn resumable_requires_existing_source_for_outgoing() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::load(dir.path());
        store.save_outgoing(
            "deadbee1",
            &dir.path().join("gone.bin"),
            "http://192.168.1.20:8765",
            "Beta",
            100,
            10,
            "",
        );
        assert!(store.get_resumable().is_empty());
    }

    #[test]
    fn filtered_views_split_by_direction_and_progress() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("send.bin");
        std::fs::write(&source, b"payload").unwrap();

        let store = StateStore::load(dir.path());
        store.save_outgoing(
            "0000aaaa",
            &source,
            "http://10.0.0.2:8765",
            "Beta",
            100,
            40,
            "",
        );
        store.save_incoming("0000bbbb", "recv.bin", 100, 100, "");
        store.save_incoming("0000cccc", "half.bin", 100, 50, "");

        let outgoing = store.outgoing_transfers();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].transfer_id, "0000aaaa");

        assert_eq!(store.incoming_transfers().len(), 2);

        let mut pending: Vec<String> = store
            .pending_transfers()
            .into_iter()
            .map(|s| s.transfer_id)
            .collect();
        pending.sort();
        assert_eq!(pending, ["0000aaaa", "0000cccc"]);
    }

    #[test]
    fn outgoing_lookup_by_file_and_peer() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("big.iso");
        std::fs::write(&source, b"iso").unwrap();

        let store = StateStore::load(dir.path());
        store.save_outgoing("cafebabe", &source, "http://10.0.0.2:8765", "Gamma", 100, 10, "");

        assert!(store.get_outgoing_by_file(&source, "http://10.0.0.2:8765").is_some());
        assert!(store.get_outgoing_by_file(&source, "http://10.0.0.3:8765").is_none());

        store.clear_all();
        assert!(store.get_outgoing_by_file(&source, "http://10.0.0.2:8765").is_none());
    }
}
