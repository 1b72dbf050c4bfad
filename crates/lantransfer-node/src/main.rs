//! Headless LAN-transfer node.
//!
//! Starts the transfer manager and mDNS discovery, then logs peer and
//! transfer activity until shut down. Any graphical front-end would drive
//! the same event and command surface this binary does.

use std::path::PathBuf;

use tokio::sync::mpsc;
use tracing::{info, warn};

use lantransfer_core::{
    util, AppEvent, DiscoveryEvent, DiscoveryService, ManagerConfig, TransferManager,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lantransfer_core=info,lantransfer_node=info,tower_http=warn".into()),
        )
        .init();

    // Config
    let port: u16 = std::env::var("LANTRANSFER_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(util::DEFAULT_PORT);
    let device_name = std::env::var("LANTRANSFER_DEVICE_NAME").unwrap_or_else(|_| util::device_name());
    let download_dir: PathBuf = std::env::var("LANTRANSFER_DOWNLOAD_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| util::default_downloads_dir());
    let data_dir: PathBuf = std::env::var("LANTRANSFER_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| util::default_data_dir());

    let (app_tx, mut app_rx) = mpsc::unbounded_channel();
    let mut manager = TransferManager::new(
        ManagerConfig {
            port,
            download_dir: download_dir.clone(),
            data_dir,
        },
        app_tx.clone(),
    )?;
    manager.start().await?;

    let bound_port = manager.port().unwrap_or(port);
    info!("{} receiving into {}", device_name, download_dir.display());

    for resumable in manager.resumable_transfers() {
        info!(
            "resumable transfer from a previous run: {} ({} of {} bytes)",
            resumable.filename, resumable.transferred_bytes, resumable.total_size
        );
    }

    let (discovery_tx, mut discovery_rx) = mpsc::unbounded_channel();
    let mut discovery = DiscoveryService::new(bound_port, device_name, discovery_tx);
    discovery.start().await?;

    // fold discovery events into the app event stream
    tokio::spawn(async move {
        while let Some(event) = discovery_rx.recv().await {
            let forwarded = match event {
                DiscoveryEvent::PeerAdded(peer) => AppEvent::PeerAdded(peer),
                DiscoveryEvent::PeerRemoved(peer) => AppEvent::PeerRemoved(peer),
            };
            if app_tx.send(forwarded).is_err() {
                break;
            }
        }
    });

    let events = tokio::spawn(async move {
        while let Some(event) = app_rx.recv().await {
            match event {
                AppEvent::PeerAdded(peer) => {
                    info!("peer online: {} ({})", peer.name, peer.url());
                }
                AppEvent::PeerRemoved(peer) => {
                    info!("peer offline: {} ({})", peer.name, peer.url());
                }
                AppEvent::QueueUpdated => {}
                AppEvent::TransferCompleted(transfer) => {
                    info!(
                        "{} transfer completed: {} ({})",
                        transfer.direction_label(),
                        transfer.filename,
                        transfer.progress_text()
                    );
                }
                AppEvent::TransferFailed(transfer) => {
                    warn!(
                        "{} transfer failed: {} ({})",
                        transfer.direction_label(),
                        transfer.filename,
                        transfer.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
        }
    });

    shutdown_signal().await;

    events.abort();
    discovery.stop().await;
    manager.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
