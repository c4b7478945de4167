//! Runtime counters
//!
//! Cheap atomic counters shared by the registry, transfers and defender,
//! with a serializable snapshot for operators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Process-wide metrics, cloned into every service
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    connections_admitted: AtomicU64,
    connections_rejected: AtomicU64,
    connections_closed: AtomicU64,
    active_connections: AtomicUsize,
    idle_evictions: AtomicU64,

    transfers_opened: AtomicU64,
    transfers_completed: AtomicU64,
    transfers_aborted: AtomicU64,
    bytes_uploaded: AtomicU64,
    bytes_downloaded: AtomicU64,
    quota_rejections: AtomicU64,

    auth_failures: AtomicU64,
    hosts_banned: AtomicU64,

    start_time: DateTime<Utc>,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,
    /// Seconds since the metrics were created
    pub uptime_seconds: i64,
    /// Connections admitted by the registry
    pub connections_admitted: u64,
    /// Connections refused at admission
    pub connections_rejected: u64,
    /// Connections removed from the registry
    pub connections_closed: u64,
    /// Connections currently registered
    pub active_connections: usize,
    /// Connections removed by the idle sweeper
    pub idle_evictions: u64,
    /// Transfers opened
    pub transfers_opened: u64,
    /// Transfers closed normally
    pub transfers_completed: u64,
    /// Transfers aborted
    pub transfers_aborted: u64,
    /// Bytes written by uploads
    pub bytes_uploaded: u64,
    /// Bytes read by downloads
    pub bytes_downloaded: u64,
    /// Opens refused by the quota pre-flight
    pub quota_rejections: u64,
    /// Authentication failures reported to the defender
    pub auth_failures: u64,
    /// Bans issued by the defender
    pub hosts_banned: u64,
}

impl Metrics {
    /// Create a zeroed metrics instance
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                connections_admitted: AtomicU64::new(0),
                connections_rejected: AtomicU64::new(0),
                connections_closed: AtomicU64::new(0),
                active_connections: AtomicUsize::new(0),
                idle_evictions: AtomicU64::new(0),
                transfers_opened: AtomicU64::new(0),
                transfers_completed: AtomicU64::new(0),
                transfers_aborted: AtomicU64::new(0),
                bytes_uploaded: AtomicU64::new(0),
                bytes_downloaded: AtomicU64::new(0),
                quota_rejections: AtomicU64::new(0),
                auth_failures: AtomicU64::new(0),
                hosts_banned: AtomicU64::new(0),
                start_time: Utc::now(),
            }),
        }
    }

    /// Record an admitted connection
    pub fn record_connection(&self) {
        self.inner
            .connections_admitted
            .fetch_add(1, Ordering::Relaxed);
        self.inner.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a refused admission
    pub fn record_rejected_connection(&self) {
        self.inner
            .connections_rejected
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection leaving the registry
    pub fn record_connection_close(&self) {
        self.inner.connections_closed.fetch_add(1, Ordering::Relaxed);
        self.inner.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record an idle eviction
    pub fn record_idle_eviction(&self) {
        self.inner.idle_evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an opened transfer
    pub fn record_transfer_open(&self) {
        self.inner.transfers_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a transfer outcome
    pub fn record_transfer_close(&self, aborted: bool) {
        if aborted {
            self.inner.transfers_aborted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner
                .transfers_completed
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record bytes written by an upload
    pub fn record_bytes_uploaded(&self, bytes: u64) {
        self.inner.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record bytes read by a download
    pub fn record_bytes_downloaded(&self, bytes: u64) {
        self.inner
            .bytes_downloaded
            .fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record an open refused by the quota pre-flight
    pub fn record_quota_rejection(&self) {
        self.inner.quota_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an authentication failure
    pub fn record_auth_failure(&self) {
        self.inner.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a ban
    pub fn record_ban(&self) {
        self.inner.hosts_banned.fetch_add(1, Ordering::Relaxed);
    }

    /// Connections currently registered
    pub fn active_connections(&self) -> usize {
        self.inner.active_connections.load(Ordering::Relaxed)
    }

    /// Copy every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = Utc::now();
        let inner = &self.inner;
        MetricsSnapshot {
            timestamp: now,
            uptime_seconds: (now - inner.start_time).num_seconds(),
            connections_admitted: inner.connections_admitted.load(Ordering::Relaxed),
            connections_rejected: inner.connections_rejected.load(Ordering::Relaxed),
            connections_closed: inner.connections_closed.load(Ordering::Relaxed),
            active_connections: inner.active_connections.load(Ordering::Relaxed),
            idle_evictions: inner.idle_evictions.load(Ordering::Relaxed),
            transfers_opened: inner.transfers_opened.load(Ordering::Relaxed),
            transfers_completed: inner.transfers_completed.load(Ordering::Relaxed),
            transfers_aborted: inner.transfers_aborted.load(Ordering::Relaxed),
            bytes_uploaded: inner.bytes_uploaded.load(Ordering::Relaxed),
            bytes_downloaded: inner.bytes_downloaded.load(Ordering::Relaxed),
            quota_rejections: inner.quota_rejections.load(Ordering::Relaxed),
            auth_failures: inner.auth_failures.load(Ordering::Relaxed),
            hosts_banned: inner.hosts_banned.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
