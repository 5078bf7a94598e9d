//! Write-temp-then-rename helpers shared by the file-backed stores.
//!
//! A reader racing a write sees either the old file or the complete new one.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Atomically replace `path` with `bytes`.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = tmp_path(path);
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    sync_dir(path.parent()).await;
    Ok(())
}

/// Best-effort fsync of a directory so the rename itself is durable.
async fn sync_dir(dir: Option<&Path>) {
    let Some(dir) = dir else { return };
    if let Ok(handle) = tokio::fs::File::open(dir).await {
        if let Err(e) = handle.sync_all().await {
            tracing::debug!(dir = %dir.display(), error = %e, "directory fsync failed");
        }
    }
}

/// Append one line to a JSONL file.
pub async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await
}
