//! Folder packing and unpacking for archive-based folder transfers.
//!
//! Folders travel as a single `.tar.gz` with the folder name as the sole
//! top-level entry. Both operations run on the blocking pool so archive I/O
//! never stalls the transfer executor.

use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};
use tracing::info;

use crate::error::{Result, TransferError};

/// Pack `dir` into `{staging}/{dir_name}.tar.gz` and return the archive
/// path. The caller owns the staging directory and deletes the archive after
/// the send.
pub async fn pack(dir: &Path, staging: &Path) -> Result<PathBuf> {
    let dir = dir.to_path_buf();
    let staging = staging.to_path_buf();
    tokio::task::spawn_blocking(move || pack_blocking(&dir, &staging))
        .await
        .map_err(|e| TransferError::Archive(format!("pack task failed: {e}")))?
}

fn pack_blocking(dir: &Path, staging: &Path) -> Result<PathBuf> {
    let name = dir
        .file_name()
        .ok_or_else(|| TransferError::Archive(format!("directory has no name: {}", dir.display())))?
        .to_string_lossy()
        .into_owned();

    let archive_path = staging.join(format!("{name}.tar.gz"));
    let file = std::fs::File::create(&archive_path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = Builder::new(encoder);
    builder.append_dir_all(&name, dir)?;
    builder.into_inner()?.finish()?;

    info!("packed {} into {}", dir.display(), archive_path.display());
    Ok(archive_path)
}

/// Extract an archive into its parent directory, delete the archive, and
/// return the path of the extracted top-level entry. On failure the archive
/// is left in place.
pub async fn unpack(archive_path: &Path) -> Result<PathBuf> {
    let archive_path = archive_path.to_path_buf();
    tokio::task::spawn_blocking(move || unpack_blocking(&archive_path))
        .await
        .map_err(|e| TransferError::Archive(format!("unpack task failed: {e}")))?
}

fn unpack_blocking(archive_path: &Path) -> Result<PathBuf> {
    let parent = archive_path
        .parent()
        .ok_or_else(|| {
            TransferError::Archive(format!("archive has no parent: {}", archive_path.display()))
        })?
        .to_path_buf();

    let top_name = first_member_top_level(archive_path)?;

    let file = std::fs::File::open(archive_path)?;
    let mut archive = Archive::new(GzDecoder::new(file));
    archive.unpack(&parent)?;

    std::fs::remove_file(archive_path)?;
    let extracted = parent.join(top_name);
    info!("extracted archive into {}", extracted.display());
    Ok(extracted)
}

/// Top-level name of the archive's first member.
fn first_member_top_level(archive_path: &Path) -> Result<std::ffi::OsString> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive = Archive::new(GzDecoder::new(file));
    let mut entries = archive.entries()?;
    let first = entries
        .next()
        .ok_or_else(|| TransferError::Archive("empty archive".into()))??;
    let path = first.path()?;
    match path.components().next() {
        Some(Component::Normal(name)) => Ok(name.to_os_string()),
        _ => Err(TransferError::Archive(format!(
            "unexpected member path: {}",
            path.display()
        ))),
    }
}
