//! Local disk backend.

use super::backend::{Backend, BackendReader, BackendWriter, DirEntry, DiskUsage, FileStat};
use async_trait::async_trait;
use std::io::{self, SeekFrom};
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncSeekExt;

/// Backend for paths on a locally mounted filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

impl LocalFs {
    /// Create a local disk backend
    pub const fn new() -> Self {
        Self
    }
}

fn to_stat(metadata: &std::fs::Metadata) -> FileStat {
    FileStat {
        size: if metadata.is_dir() { 0 } else { metadata.len() },
        is_dir: metadata.is_dir(),
        modified: metadata.modified().ok(),
    }
}

#[async_trait]
impl Backend for LocalFs {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let metadata = fs::metadata(path).await?;
        Ok(to_stat(&metadata))
    }

    async fn open_read(&self, path: &Path, offset: u64) -> io::Result<BackendReader> {
        let mut file = fs::File::open(path).await?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }
        Ok(Box::new(file))
    }

    async fn open_write(&self, path: &Path) -> io::Result<BackendWriter> {
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await?;
        Ok(Box::new(file))
    }

    async fn list(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(path).await?;
        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                stat: to_stat(&metadata),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to).await
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        let metadata = fs::symlink_metadata(path).await?;
        if metadata.is_dir() {
            fs::remove_dir(path).await
        } else {
            fs::remove_file(path).await
        }
    }

    async fn mkdir(&self, path: &Path) -> io::Result<()> {
        fs::create_dir(path).await
    }

    #[cfg(unix)]
    async fn disk_usage(&self, path: &Path) -> io::Result<DiskUsage> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let stat = nix::sys::statvfs::statvfs(&path).map_err(io::Error::from)?;
            let fragment = u64::from(stat.fragment_size());
            Ok(DiskUsage {
                total: u64::from(stat.blocks()).saturating_mul(fragment),
                free: u64::from(stat.blocks_available()).saturating_mul(fragment),
            })
        })
        .await
        .map_err(io::Error::other)?
    }

    #[cfg(not(unix))]
    async fn disk_usage(&self, _path: &Path) -> io::Result<DiskUsage> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "disk usage is not available on this platform",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_write_then_read_from_offset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file.txt");
        let backend = LocalFs::new();

        let mut writer = backend.open_write(&path).await.unwrap();
        writer.write_all(b"hello world").await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);

        let mut reader = backend.open_read(&path, 6).await.unwrap();
        let mut content = String::new();
        reader.read_to_string(&mut content).await.unwrap();
        assert_eq!(content, "world");

        assert_eq!(backend.stat(&path).await.unwrap().size, 11);
    }

    #[tokio::test]
    async fn test_directory_operations() {
        let dir = TempDir::new().unwrap();
        let backend = LocalFs::new();
        let sub = dir.path().join("sub");

        backend.mkdir(&sub).await.unwrap();
        assert!(backend.stat(&sub).await.unwrap().is_dir);

        tokio::fs::write(sub.join("b.txt"), b"b").await.unwrap();
        tokio::fs::write(sub.join("a.txt"), b"aa").await.unwrap();
        let names: Vec<_> = backend
            .list(&sub)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);

        backend
            .rename(&sub.join("a.txt"), &sub.join("c.txt"))
            .await
            .unwrap();
        backend.remove(&sub.join("c.txt")).await.unwrap();
        backend.remove(&sub.join("b.txt")).await.unwrap();
        backend.remove(&sub).await.unwrap();
        assert!(backend.stat(&sub).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_disk_usage_reports_space() {
        let dir = TempDir::new().unwrap();
        let usage = LocalFs::new().disk_usage(dir.path()).await.unwrap();
        assert!(usage.total >= usage.free);
        assert!(usage.total > 0);
    }
}
