//! Event types published by the discovery, server, client, and manager
//! layers.
//!
//! Each service pushes snapshots into an unbounded channel; the manager
//! consumes the server and client streams and republishes a consolidated
//! [`AppEvent`] stream that a front-end can drive its UI from.

use crate::client::OutgoingTransfer;
use crate::discovery::Peer;
use crate::manager::QueuedTransfer;
use crate::server::IncomingSnapshot;

/// Peer table changes reported by the mDNS browser.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    PeerAdded(Peer),
    PeerRemoved(Peer),
}

/// Receiver-side transfer lifecycle.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Started(IncomingSnapshot),
    Progress(IncomingSnapshot),
    Completed(IncomingSnapshot),
    Failed {
        transfer: IncomingSnapshot,
        error: String,
    },
}

/// Sender-side transfer lifecycle.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Started(OutgoingTransfer),
    Progress(OutgoingTransfer),
    Completed(OutgoingTransfer),
    Failed {
        transfer: OutgoingTransfer,
        error: String,
    },
    Cancelled(OutgoingTransfer),
}

/// Consolidated events delivered to the front-end.
#[derive(Debug, Clone)]
pub enum AppEvent {
    PeerAdded(Peer),
    PeerRemoved(Peer),
    QueueUpdated,
    TransferCompleted(QueuedTransfer),
    TransferFailed(QueuedTransfer),
}
