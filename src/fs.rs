//! Small filesystem helpers.

use std::path::Path;

use tokio::io::AsyncWriteExt;

use crate::error::Result;

/// Write `content` to `path` through a temp file in the same directory and a
/// rename, so readers see either the old file or the complete new one. The
/// temp file is synced before the rename and the directory after it, so a
/// power loss cannot leave an empty file under the final name.
pub async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => Path::new(".").to_path_buf(),
    };
    tokio::fs::create_dir_all(&parent).await?;

    let temp_path = parent.join(format!(".tmp_{}", uuid::Uuid::new_v4()));
    if let Err(e) = write_synced(&temp_path, content).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e.into());
    }
    sync_dir(&parent).await;
    Ok(())
}

async fn write_synced(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(content).await?;
    file.sync_all().await
}

/// Persist the rename itself. Not every platform can open a directory for
/// syncing, so failure only costs durability of the rename.
async fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    if let Ok(handle) = tokio::fs::File::open(dir).await {
        if let Err(e) = handle.sync_all().await {
            tracing::debug!(dir = %dir.display(), "directory sync failed: {e}");
        }
    }
    #[cfg(not(unix))]
    let _ = dir;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replaces_existing_file_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out/summary.json");

        write_atomic(&target, b"first").await.unwrap();
        write_atomic(&target, b"second").await.unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"second");
        let leftovers: Vec<_> = std::fs::read_dir(target.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp_"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn synced_write_holds_the_full_content() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("transcript.txt");
        let body = vec![b'x'; 256 * 1024];

        write_synced(&target, &body).await.unwrap();
        assert_eq!(std::fs::metadata(&target).unwrap().len(), body.len() as u64);
        write_atomic(&target, b"short").await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"short");
    }
}
