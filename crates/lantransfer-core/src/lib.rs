//! Zero-configuration LAN file transfer engine.
//!
//! Peers advertise themselves over mDNS, discover each other automatically,
//! and exchange files over HTTP with chunked, resumable, integrity-verified
//! uploads. Folders travel as a single compressed archive. The
//! [`manager::TransferManager`] ties the receiver, sender, state store, and
//! queue together behind an event/command interface any front-end can drive.

pub mod archive;
pub mod client;
pub mod discovery;
pub mod error;
pub mod events;
pub mod manager;
pub mod server;
pub mod state;
pub mod util;

pub use client::{OutgoingTransfer, TransferClient, TransferStatus};
pub use discovery::{DiscoveryService, Peer};
pub use error::{Result, TransferError};
pub use events::{AppEvent, ClientEvent, DiscoveryEvent, ServerEvent};
pub use manager::{ManagerConfig, QueuedTransfer, TransferManager};
pub use server::{IncomingSnapshot, TransferServer};
pub use state::{PersistedTransfer, StateStore, TransferDirection};
