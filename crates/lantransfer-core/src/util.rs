//! Shared constants and small helpers used across the transfer engine.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncReadExt;
use uuid::Uuid;
use walkdir::WalkDir;

/// Chunk size for file transfers (1 MiB).
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Default TCP port for the transfer server and mDNS advertisement.
pub const DEFAULT_PORT: u16 = 8765;

/// mDNS service type advertised and browsed on the local network.
pub const SERVICE_TYPE: &str = "_lantransfer._tcp.local.";

/// Timeout applied to every HTTP call made by the sender.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// First delay between chunk retries.
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Cap on the exponential retry delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Retries allowed per chunk before the transfer is failed.
pub const MAX_RETRIES: u32 = 5;

/// Compute the SHA-256 of a file, reading it in chunk-sized pieces.
pub async fn file_sha256(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Format a byte count for humans, e.g. `3145728` -> `"3.0 MB"`.
pub fn format_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} PB")
}

/// Format a transfer speed, e.g. `"3.0 MB/s"`.
pub fn format_speed(bytes_per_second: f64) -> String {
    format!("{}/s", format_size(bytes_per_second as u64))
}

/// Format a duration in seconds, e.g. `"2m 5s"`.
pub fn format_time(seconds: f64) -> String {
    let secs = seconds as u64;
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

/// Local IPv4 address of this machine, falling back to loopback.
pub fn local_ip() -> Ipv4Addr {
    match local_ip_address::local_ip() {
        Ok(IpAddr::V4(v4)) => v4,
        _ => Ipv4Addr::LOCALHOST,
    }
}

/// Friendly device name, derived from the hostname.
pub fn device_name() -> String {
    let name = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "lantransfer".into());
    name.strip_suffix(".local").unwrap_or(&name).to_string()
}

/// Mint an 8-hex-character transfer or queue id.
pub fn generate_transfer_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Total size of all regular files under a directory.
pub fn folder_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

/// Application data directory (`~/.lantransfer`).
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".lantransfer")
}

/// Default directory for received files (`~/.lantransfer/downloads`).
pub fn default_downloads_dir() -> PathBuf {
    default_data_dir().join("downloads")
}
