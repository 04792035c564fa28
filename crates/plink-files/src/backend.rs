//! Physical I/O seam.
//!
//! The in-memory tree is authoritative for listings; everything that touches
//! real bytes goes through [`StorageBackend`] so tests and exotic media can
//! substitute their own implementation.

use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpaceInfo {
    pub free: u64,
    pub total: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryStat {
    pub is_dir: bool,
    pub size: u64,
    pub m_timestamp: i64,
    pub read_only: bool,
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn open_read(&self, path: &Path) -> io::Result<BoxedReader>;
    async fn open_write(&self, path: &Path) -> io::Result<BoxedWriter>;
    async fn stat(&self, path: &Path) -> io::Result<EntryStat>;
    async fn unlink(&self, path: &Path) -> io::Result<()>;
    async fn mkdir(&self, path: &Path) -> io::Result<()>;
    /// Remove a folder; with `recursive` its contents go too.
    async fn rmdir(&self, path: &Path, recursive: bool) -> io::Result<()>;
    async fn listdir(&self, path: &Path) -> io::Result<Vec<(String, EntryStat)>>;
    async fn statvfs(&self, path: &Path) -> io::Result<SpaceInfo>;
    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    /// Flush file contents to stable storage, then resync the parent folder.
    async fn sync_path(&self, path: &Path) -> io::Result<()>;
}

pub type BoxedBackend = std::sync::Arc<dyn StorageBackend>;

/// Backend for ordinary local directories.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalStorage;

fn stat_from_std(meta: &std::fs::Metadata) -> EntryStat {
    let m_timestamp = meta
        .modified()
        .ok()
        .and_then(|t| match t.duration_since(UNIX_EPOCH) {
            Ok(d) => i64::try_from(d.as_secs()).ok(),
            Err(_) => None,
        })
        .unwrap_or(0);
    EntryStat {
        is_dir: meta.is_dir(),
        size: if meta.is_dir() { 0 } else { meta.len() },
        m_timestamp,
        read_only: meta.permissions().readonly(),
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn open_read(&self, path: &Path) -> io::Result<BoxedReader> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Box::new(file))
    }

    async fn open_write(&self, path: &Path) -> io::Result<BoxedWriter> {
        let file = tokio::fs::File::create(path).await?;
        Ok(Box::new(file))
    }

    async fn stat(&self, path: &Path) -> io::Result<EntryStat> {
        let meta = tokio::fs::metadata(path).await?;
        Ok(stat_from_std(&meta))
    }

    async fn unlink(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }

    async fn mkdir(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn rmdir(&self, path: &Path, recursive: bool) -> io::Result<()> {
        if recursive {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_dir(path).await
        }
    }

    async fn listdir(&self, path: &Path) -> io::Result<Vec<(String, EntryStat)>> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(path).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = entry.metadata().await?;
            entries.push((name, stat_from_std(&meta)));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    async fn statvfs(&self, path: &Path) -> io::Result<SpaceInfo> {
        let path = PathBuf::from(path);
        tokio::task::spawn_blocking(move || {
            let free = fs2::available_space(&path)?;
            let total = fs2::total_space(&path)?;
            Ok(SpaceInfo { free, total })
        })
        .await
        .map_err(|e| io::Error::other(e.to_string()))?
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        tokio::fs::rename(from, to).await
    }

    async fn sync_path(&self, path: &Path) -> io::Result<()> {
        let file = tokio::fs::File::open(path).await?;
        file.sync_all().await?;
        if let Some(parent) = path.parent() {
            // Folder handles cannot always be synced (notably on some
            // filesystems); a failure here is not fatal for the data itself.
            if let Ok(dir) = tokio::fs::File::open(parent).await {
                let _ = dir.sync_all().await;
            }
        }
        Ok(())
    }
}
