//! Storage backend capability set
//!
//! A backend operates on physical paths that the resolver has already
//! checked for containment. Concrete backends (local disk, object stores,
//! remote filesystems) are supplied by the deployment.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncWrite};

/// Boxed reader returned by [`Backend::open_read`]
pub type BackendReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed writer returned by [`Backend::open_write`]
pub type BackendWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Metadata about a file or directory
#[derive(Debug, Clone)]
pub struct FileStat {
    /// Size in bytes (0 for directories)
    pub size: u64,
    /// True if this is a directory
    pub is_dir: bool,
    /// Last modification time, if the backend knows it
    pub modified: Option<SystemTime>,
}

/// A directory entry returned by [`Backend::list`]
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Name of the entry (not full path)
    pub name: String,
    /// Entry metadata
    pub stat: FileStat,
}

/// Space available on the volume holding a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    /// Total bytes on the volume
    pub total: u64,
    /// Bytes still available
    pub free: u64,
}

/// Uniform storage capability set
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short backend kind for logs (`local`, `s3`, ...)
    fn kind(&self) -> &'static str;

    /// Get metadata for a path
    async fn stat(&self, path: &Path) -> io::Result<FileStat>;

    /// Open a file for reading, starting at `offset`
    async fn open_read(&self, path: &Path, offset: u64) -> io::Result<BackendReader>;

    /// Open a file for writing, creating or truncating it
    async fn open_write(&self, path: &Path) -> io::Result<BackendWriter>;

    /// List entries in a directory
    async fn list(&self, path: &Path) -> io::Result<Vec<DirEntry>>;

    /// Rename a file or directory
    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Remove a file or empty directory
    async fn remove(&self, path: &Path) -> io::Result<()>;

    /// Create a directory
    async fn mkdir(&self, path: &Path) -> io::Result<()>;

    /// Report disk usage for the volume holding `path`
    async fn disk_usage(&self, path: &Path) -> io::Result<DiskUsage>;
}

/// Opaque handle binding a backend to its physical root
///
/// Two handles are the same backend when their ids match.
#[derive(Clone)]
pub struct BackendHandle {
    id: String,
    root: PathBuf,
    backend: Arc<dyn Backend>,
}

impl BackendHandle {
    /// Create a handle for `backend` rooted at `root`
    pub fn new(id: impl Into<String>, root: impl Into<PathBuf>, backend: Arc<dyn Backend>) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
            backend,
        }
    }

    /// Handle identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Physical root every resolved path must stay under
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The backend itself
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }
}

impl fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendHandle")
            .field("id", &self.id)
            .field("kind", &self.backend.kind())
            .field("root", &self.root)
            .finish()
    }
}

impl PartialEq for BackendHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for BackendHandle {}
