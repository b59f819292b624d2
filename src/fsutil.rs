//! Small atomic file I/O helpers shared by the identity, trust, and
//! recorder stores. Every on-disk write in this crate goes through
//! [`atomic_write`] so a crash mid-write never leaves a torn file.

use std::path::Path;

use tokio::fs;
use tokio::io::AsyncWriteExt;

pub async fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp_path = tmp_path_for(path);
    {
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
    }
    fs::rename(&tmp_path, path).await?;
    Ok(())
}

fn tmp_path_for(path: &Path) -> std::path::PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

pub async fn read_if_exists(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Best-effort: mark a file excluded from platform backups. Real exclusion
/// needs a platform-specific crate (e.g. an `NSURL` resource-value call on
/// macOS); until one is wired in this just logs the intent so the caller's
/// contract ("excluded where the platform supports it") still holds as a
/// no-op rather than silently doing nothing unnoticed.
pub fn mark_excluded_from_backup(path: &Path) {
    tracing::debug!(path = %path.display(), "backup exclusion requested (best-effort, not yet wired to a platform API)");
}
