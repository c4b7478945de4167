//! Transfer lifecycle and quota accounting
//!
//! A `Transfer` wraps one upload or download against a resolved path. The
//! front end owning it drives reads and writes one at a time; the registry
//! can abort it from outside through the shared `TransferState`. Closing an
//! upload charges `final_size - initial_size` to the quota owner exactly
//! once, whether the transfer is closed explicitly or dropped.
//!
//! A quota overrun is never rolled back: the bytes are already stored, so
//! the overrun is recorded and the next open is refused by the pre-flight
//! check.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::audit::AuditEvent;
use crate::config::TransfersConfig;
use crate::metrics::Metrics;
use crate::quota::{QuotaOwner, QuotaTracker};
use crate::registry::Connection;
use crate::user::{Permission, QuotaLimits};
use crate::vfs::{BackendReader, BackendWriter, ResolvedPath};
use crate::{Error, Result};

/// Direction of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    /// Client to server
    Upload,
    /// Server to client
    Download,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => f.write_str("UPLOAD"),
            Self::Download => f.write_str("DOWNLOAD"),
        }
    }
}

/// Flags a front end passes when opening a file for writing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    /// Append to an existing file
    pub append: bool,
    /// Truncate an existing file
    pub truncate: bool,
}

impl OpenFlags {
    /// Plain open
    pub const NONE: Self = Self {
        append: false,
        truncate: false,
    };
    /// Open with truncation
    pub const TRUNCATE: Self = Self {
        append: false,
        truncate: true,
    };
    /// Open for append
    pub const APPEND: Self = Self {
        append: true,
        truncate: false,
    };
}

/// Progress of an open transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferStatus {
    /// Transfer identifier
    pub id: Uuid,
    /// Direction
    pub kind: TransferKind,
    /// Virtual path
    pub virtual_path: String,
    /// Bytes moved so far
    pub bytes: u64,
    /// Open time
    pub started_at: DateTime<Utc>,
}

/// Transfer state shared with the owning connection
#[derive(Debug)]
pub(crate) struct TransferState {
    id: Uuid,
    kind: TransferKind,
    virtual_path: String,
    started_at: DateTime<Utc>,
    bytes: AtomicU64,
    last_progress: StdMutex<Instant>,
    abort: CancellationToken,
    abort_reason: StdMutex<Option<String>>,
}

impl TransferState {
    pub(crate) fn new(kind: TransferKind, virtual_path: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            virtual_path: virtual_path.to_string(),
            started_at: Utc::now(),
            bytes: AtomicU64::new(0),
            last_progress: StdMutex::new(Instant::now()),
            abort: CancellationToken::new(),
            abort_reason: StdMutex::new(None),
        }
    }

    pub(crate) const fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }

    fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::AcqRel);
        *self
            .last_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub(crate) fn stalled_for(&self) -> Duration {
        self.last_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// First reason wins; later aborts only cancel again.
    pub(crate) fn abort(&self, reason: &str) {
        {
            let mut current = self
                .abort_reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if current.is_none() {
                *current = Some(reason.to_string());
            }
        }
        self.abort.cancel();
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    fn abort_reason(&self) -> Option<String> {
        self.abort_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn status(&self) -> TransferStatus {
        TransferStatus {
            id: self.id,
            kind: self.kind,
            virtual_path: self.virtual_path.clone(),
            bytes: self.bytes(),
            started_at: self.started_at,
        }
    }
}

/// Opens transfers and owns the quota table
#[derive(Debug)]
pub struct Transfers {
    quota: Arc<QuotaTracker>,
    metrics: Metrics,
    timeout: Option<Duration>,
}

impl Transfers {
    /// Create a transfer manager charging usage to `quota`
    pub fn new(quota: Arc<QuotaTracker>, config: &TransfersConfig) -> Self {
        Self {
            quota,
            metrics: Metrics::new(),
            timeout: config.timeout(),
        }
    }

    /// Report into shared metrics, builder style
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Quota table
    pub const fn quota(&self) -> &Arc<QuotaTracker> {
        &self.quota
    }

    /// Open a transfer on a resolved path
    ///
    /// Downloads need `download` permission. Uploads need `upload`, and
    /// `overwrite` as well when the file exists. Appending to an existing
    /// file is refused; any other upload over an existing file replaces it
    /// and remembers the old size for quota accounting.
    ///
    /// # Errors
    ///
    /// `PermissionDenied`, `OpUnsupported`, `QuotaExceeded`,
    /// `BackendUnavailable`, `Timeout`, or `TransferAborted` when the
    /// connection has already been removed.
    pub async fn open(
        &self,
        connection: &Arc<Connection>,
        resolved: ResolvedPath,
        kind: TransferKind,
        flags: OpenFlags,
    ) -> Result<Transfer> {
        if connection.is_closed() {
            return Err(Error::TransferAborted("connection closed".into()));
        }

        let user = Arc::clone(connection.user());
        let virtual_path = resolved.virtual_path().to_string();
        let backend = Arc::clone(resolved.backend().backend());
        let physical = resolved.physical_path().to_path_buf();
        let (owner, limits) = QuotaOwner::for_path(&user, &resolved);

        let mut initial_size = 0;
        let mut is_new_file = false;
        let mut writer = None;

        match kind {
            TransferKind::Download => {
                user.require(&virtual_path, Permission::Download)?;
                let stat = with_timeout(self.timeout, "stat", backend.stat(&physical)).await?;
                if stat.is_dir {
                    return Err(Error::OpUnsupported(format!(
                        "{} is a directory",
                        virtual_path
                    )));
                }
                initial_size = stat.size;
            }
            TransferKind::Upload => {
                user.require(&virtual_path, Permission::Upload)?;
                match timed(self.timeout, "stat", backend.stat(&physical)).await? {
                    Ok(stat) if stat.is_dir => {
                        return Err(Error::OpUnsupported(format!(
                            "{} is a directory",
                            virtual_path
                        )));
                    }
                    Ok(stat) => {
                        if flags.append {
                            return Err(Error::OpUnsupported(
                                "append to an existing file".into(),
                            ));
                        }
                        user.require(&virtual_path, Permission::Overwrite)?;
                        initial_size = stat.size;
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => is_new_file = true,
                    Err(e) => return Err(Error::backend("stat", e)),
                }

                if let Err(e) = self.quota.check(&owner, &limits, is_new_file) {
                    self.metrics.record_quota_rejection();
                    AuditEvent::QuotaExceeded {
                        username: user.username.clone(),
                        owner: owner.to_string(),
                        path: virtual_path,
                        timestamp: Utc::now(),
                    }
                    .log();
                    return Err(e);
                }

                // Opening truncates, so nothing may be touched once the
                // connection is gone.
                if connection.is_closed() {
                    return Err(Error::TransferAborted("connection closed".into()));
                }
                writer = Some(
                    with_timeout(self.timeout, "open for write", backend.open_write(&physical))
                        .await?,
                );
            }
        }

        let state = Arc::new(TransferState::new(kind, &virtual_path));
        connection.register_transfer(Arc::clone(&state));
        self.metrics.record_transfer_open();

        let transfer = Transfer {
            state,
            connection: Arc::clone(connection),
            resolved,
            owner,
            limits,
            kind,
            initial_size,
            is_new_file,
            offset: 0,
            reader: None,
            writer,
            closed: false,
            timeout: self.timeout,
            quota: Arc::clone(&self.quota),
            metrics: self.metrics.clone(),
            opened_at: Instant::now(),
        };

        if connection.is_closed() {
            // The file may already be truncated; dropping the aborted
            // transfer settles quota against what is on disk now.
            transfer.state.abort("connection closed");
            drop(transfer);
            return Err(Error::TransferAborted("connection closed".into()));
        }
        connection.touch();

        debug!(
            connection_id = %connection.id(),
            transfer_id = %transfer.state.id(),
            kind = %kind,
            path = %transfer.state.virtual_path,
            backend = transfer.resolved.backend().id(),
            initial_size,
            "Transfer opened"
        );
        Ok(transfer)
    }

    /// Bytes an upload to `resolved` may still write
    ///
    /// The lesser of the remaining quota and the backend's free space;
    /// `None` when neither is bounded.
    ///
    /// # Errors
    ///
    /// `BackendUnavailable` if the backend cannot report disk usage
    pub async fn available_space(
        &self,
        connection: &Connection,
        resolved: &ResolvedPath,
    ) -> Result<Option<u64>> {
        let (owner, limits) = QuotaOwner::for_path(connection.user(), resolved);
        let quota_left = self.quota.usage(&owner).remaining_size(&limits);

        let disk = match resolved
            .backend()
            .backend()
            .disk_usage(resolved.physical_path())
            .await
        {
            Ok(usage) => Some(usage.free),
            Err(e) if e.kind() == io::ErrorKind::Unsupported => None,
            Err(e) => return Err(Error::backend("disk usage", e)),
        };

        Ok(match (quota_left, disk) {
            (Some(q), Some(d)) => Some(q.min(d)),
            (q, d) => q.or(d),
        })
    }
}

/// One open upload or download
pub struct Transfer {
    state: Arc<TransferState>,
    connection: Arc<Connection>,
    resolved: ResolvedPath,
    owner: QuotaOwner,
    limits: QuotaLimits,
    kind: TransferKind,
    initial_size: u64,
    is_new_file: bool,
    offset: u64,
    reader: Option<BackendReader>,
    writer: Option<BackendWriter>,
    closed: bool,
    timeout: Option<Duration>,
    quota: Arc<QuotaTracker>,
    metrics: Metrics,
    opened_at: Instant,
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("id", &self.state.id)
            .field("kind", &self.kind)
            .field("virtual_path", &self.state.virtual_path)
            .field("bytes", &self.state.bytes())
            .field("initial_size", &self.initial_size)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Transfer {
    /// Transfer identifier
    pub fn id(&self) -> Uuid {
        self.state.id
    }

    /// Direction
    pub const fn kind(&self) -> TransferKind {
        self.kind
    }

    /// Resolved path the transfer was opened on
    pub const fn resolved(&self) -> &ResolvedPath {
        &self.resolved
    }

    /// Quota owner charged by this transfer
    pub const fn quota_owner(&self) -> &QuotaOwner {
        &self.owner
    }

    /// Bytes moved so far
    pub fn bytes_transferred(&self) -> u64 {
        self.state.bytes()
    }

    /// Size of the file before the transfer (its full size for downloads)
    pub const fn initial_size(&self) -> u64 {
        self.initial_size
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.closed {
            return Err(Error::TransferAlreadyClosed);
        }
        if let Some(reason) = self.state.abort_reason() {
            return Err(Error::TransferAborted(reason));
        }
        Ok(())
    }

    /// Abort on backend failure or timeout, releasing the backend stream.
    fn fail(&mut self, error: Error) -> Error {
        match &error {
            Error::TransferAborted(_) => {}
            other => self.state.abort(&other.to_string()),
        }
        self.reader = None;
        self.writer = None;
        error
    }

    /// Move the read position of a download
    ///
    /// Only allowed before the first byte has been read. Uploads are
    /// sequential and accept only their current position.
    ///
    /// # Errors
    ///
    /// `OpUnsupported` when the stream can no longer seek
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        self.ensure_usable()?;
        match self.kind {
            TransferKind::Download => {
                if self.reader.is_some() {
                    return Err(Error::OpUnsupported(
                        "seek after the download has started".into(),
                    ));
                }
                self.offset = offset;
                Ok(())
            }
            TransferKind::Upload => {
                if offset == self.state.bytes() {
                    Ok(())
                } else {
                    Err(Error::OpUnsupported(
                        "upload streams are not seekable".into(),
                    ))
                }
            }
        }
    }

    /// Read up to `max` bytes from a download
    ///
    /// An empty buffer means end of file.
    ///
    /// # Errors
    ///
    /// `OpUnsupported` on uploads; `TransferAborted`, `Timeout` or
    /// `BackendUnavailable` abort the transfer.
    pub async fn read(&mut self, max: usize) -> Result<Bytes> {
        self.ensure_usable()?;
        if self.kind != TransferKind::Download {
            return Err(Error::OpUnsupported("read on an upload".into()));
        }

        if self.reader.is_none() {
            let backend = Arc::clone(self.resolved.backend().backend());
            let opened = guarded(
                &self.state.abort,
                self.timeout,
                "open for read",
                backend.open_read(self.resolved.physical_path(), self.offset),
            )
            .await;
            match opened {
                Ok(reader) => self.reader = Some(reader),
                Err(e) => return Err(self.fail(e)),
            }
        }

        let mut buf = vec![0u8; max];
        let read = match self.reader.as_mut() {
            Some(reader) => {
                guarded(&self.state.abort, self.timeout, "read", reader.read(&mut buf)).await
            }
            None => return Err(Error::TransferAborted("reader released".into())),
        };
        let n = match read {
            Ok(n) => n,
            Err(e) => return Err(self.fail(e)),
        };

        buf.truncate(n);
        self.state.add_bytes(n as u64);
        self.metrics.record_bytes_downloaded(n as u64);
        self.connection.touch();
        Ok(Bytes::from(buf))
    }

    /// Append `data` to an upload
    ///
    /// # Errors
    ///
    /// `OpUnsupported` on downloads; `TransferAborted`, `Timeout` or
    /// `BackendUnavailable` abort the transfer.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_usable()?;
        if self.kind != TransferKind::Upload {
            return Err(Error::OpUnsupported("write on a download".into()));
        }

        let written = match self.writer.as_mut() {
            Some(writer) => {
                guarded(&self.state.abort, self.timeout, "write", writer.write_all(data)).await
            }
            None => return Err(Error::TransferAborted("writer released".into())),
        };
        if let Err(e) = written {
            return Err(self.fail(e));
        }

        self.state.add_bytes(data.len() as u64);
        self.metrics.record_bytes_uploaded(data.len() as u64);
        self.connection.touch();
        Ok(())
    }

    /// Finish the transfer and settle quota
    ///
    /// # Errors
    ///
    /// `TransferAlreadyClosed` on the second call. `TransferAborted` if
    /// the transfer was aborted earlier; its partial bytes are still
    /// accounted. A failing final flush is reported as well.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::TransferAlreadyClosed);
        }
        self.closed = true;

        let mut result = Ok(());
        if self.state.abort_reason().is_none() {
            if let Some(writer) = self.writer.as_mut() {
                if let Err(e) =
                    guarded(&self.state.abort, self.timeout, "flush", writer.shutdown()).await
                {
                    result = Err(self.fail(e));
                }
            }
        }
        self.reader = None;
        self.writer = None;

        let aborted = self.state.abort_reason();
        self.settle(aborted.as_deref());

        match aborted {
            Some(reason) => Err(Error::TransferAborted(reason)),
            None => result,
        }
    }

    /// Charge quota, detach from the connection and report the outcome.
    fn settle(&self, aborted: Option<&str>) {
        let bytes = self.state.bytes();
        self.connection.unregister_transfer(self.state.id);
        self.metrics.record_transfer_close(aborted.is_some());

        if self.kind == TransferKind::Upload {
            let delta_size = i64::try_from(bytes)
                .unwrap_or(i64::MAX)
                .saturating_sub(i64::try_from(self.initial_size).unwrap_or(i64::MAX));
            let delta_files = i64::from(self.is_new_file);
            let usage = self.quota.update(&self.owner, delta_size, delta_files);

            if usage.exceeds(&self.limits) {
                warn!(
                    owner = %self.owner,
                    used_size = usage.used_size,
                    used_files = usage.used_files,
                    "Upload committed past quota, further uploads will be refused"
                );
                AuditEvent::QuotaExceeded {
                    username: self.connection.user().username.clone(),
                    owner: self.owner.to_string(),
                    path: self.state.virtual_path.clone(),
                    timestamp: Utc::now(),
                }
                .log();
            }
        }

        let event = match aborted {
            Some(reason) => AuditEvent::TransferAborted {
                connection_id: self.connection.id().to_string(),
                username: self.connection.user().username.clone(),
                operation: self.kind.to_string(),
                path: self.state.virtual_path.clone(),
                bytes,
                error: reason.to_string(),
                timestamp: Utc::now(),
            },
            None => AuditEvent::TransferCompleted {
                connection_id: self.connection.id().to_string(),
                username: self.connection.user().username.clone(),
                operation: self.kind.to_string(),
                path: self.state.virtual_path.clone(),
                bytes,
                elapsed_ms: i64::try_from(self.opened_at.elapsed().as_millis())
                    .unwrap_or(i64::MAX),
                timestamp: Utc::now(),
            },
        };
        event.log();
    }
}

impl Drop for Transfer {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.abort("transfer dropped without close");
            let reason = self.state.abort_reason();
            self.settle(reason.as_deref());
        }
    }
}

async fn timed<T>(
    timeout: Option<Duration>,
    context: &str,
    fut: impl Future<Output = T>,
) -> Result<T> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| Error::Timeout(context.to_string())),
        None => Ok(fut.await),
    }
}

async fn with_timeout<T>(
    timeout: Option<Duration>,
    context: &str,
    fut: impl Future<Output = io::Result<T>>,
) -> Result<T> {
    timed(timeout, context, fut)
        .await?
        .map_err(|e| Error::backend(context, e))
}

async fn guarded<T>(
    abort: &CancellationToken,
    timeout: Option<Duration>,
    context: &str,
    fut: impl Future<Output = io::Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        () = abort.cancelled() => Err(Error::TransferAborted(format!("{} cancelled", context))),
        result = with_timeout(timeout, context, fut) => result,
    }
}
