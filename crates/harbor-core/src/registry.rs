//! Connection registry
//!
//! Process-wide table of authenticated sessions from every protocol front
//! end. Admission checks and insertion happen under one lock, so concurrent
//! logins can never push the table past its limits. Removal is idempotent:
//! a session kicked by an operator, evicted as idle and closed by its own
//! task is removed exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::AuditEvent;
use crate::config::ConnectionsConfig;
use crate::defender::{Defender, HostEvent};
use crate::metrics::Metrics;
use crate::transfer::{TransferState, TransferStatus};
use crate::user::User;
use crate::{Error, Result};

/// Front-end protocol that produced a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// SSH file transfer
    Sftp,
    /// SSH secure copy
    Scp,
    /// FTP, plain or over TLS
    Ftp,
    /// WebDAV
    WebDav,
    /// Browser-based HTTP access
    Http,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sftp => "SFTP",
            Self::Scp => "SCP",
            Self::Ftp => "FTP",
            Self::WebDav => "DAV",
            Self::Http => "HTTP",
        };
        f.write_str(name)
    }
}

/// Why a connection left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client logged out or its task ended
    Logout,
    /// No activity within the idle timeout
    IdleTimeout,
    /// Removed by an operator
    Kicked,
    /// Remote host was banned by the defender
    HostBanned,
    /// Registry drained at shutdown
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::Logout => "logout",
            Self::IdleTimeout => "idle timeout",
            Self::Kicked => "kicked",
            Self::HostBanned => "host banned",
            Self::Shutdown => "shutdown",
        };
        f.write_str(reason)
    }
}

/// Underlying network transport of a connection
///
/// Implemented by each front end so the registry can drop a session it
/// evicts without knowing the protocol.
pub trait Transport: Send + Sync {
    /// Close the transport; must be safe to call more than once
    fn close(&self);
}

/// One authenticated session
pub struct Connection {
    id: Uuid,
    protocol: Protocol,
    user: Arc<User>,
    remote_addr: SocketAddr,
    started_at: DateTime<Utc>,
    last_activity: StdMutex<Instant>,
    transfers: StdMutex<HashMap<Uuid, Arc<TransferState>>>,
    cancel: CancellationToken,
    transport: Option<Box<dyn Transport>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("username", &self.user.username)
            .field("remote_addr", &self.remote_addr)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create a session for an authenticated user
    pub fn new(protocol: Protocol, user: Arc<User>, remote_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            protocol,
            user,
            remote_addr,
            started_at: Utc::now(),
            last_activity: StdMutex::new(Instant::now()),
            transfers: StdMutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            transport: None,
        }
    }

    /// Attach the transport closed on eviction, builder style
    #[must_use]
    pub fn with_transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Connection identifier
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Front-end protocol
    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// User snapshot for the lifetime of the session
    pub fn user(&self) -> &Arc<User> {
        &self.user
    }

    /// Remote socket address
    pub const fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Admission time
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Refresh the activity timestamp
    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time since the last activity
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Number of open transfers
    pub fn transfer_count(&self) -> usize {
        self.lock_transfers().len()
    }

    /// True once the registry has removed the session
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the registry removes the session
    ///
    /// Front ends select on this to stop serving an evicted client.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    /// Progress of every open transfer
    pub fn transfer_statuses(&self) -> Vec<TransferStatus> {
        self.lock_transfers()
            .values()
            .map(|state| state.status())
            .collect()
    }

    /// Operator view of the session
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            id: self.id,
            protocol: self.protocol,
            username: self.user.username.clone(),
            remote_addr: self.remote_addr,
            started_at: self.started_at,
            idle_secs: self.idle_for().as_secs(),
            transfers: self.transfer_statuses(),
        }
    }

    pub(crate) fn register_transfer(&self, state: Arc<TransferState>) {
        self.lock_transfers().insert(state.id(), state);
    }

    pub(crate) fn unregister_transfer(&self, id: Uuid) {
        self.lock_transfers().remove(&id);
    }

    fn lock_transfers(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<TransferState>>> {
        self.transfers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn abort_stalled_transfers(&self, timeout: Duration) -> usize {
        let transfers = self.lock_transfers();
        let mut aborted = 0;
        for state in transfers.values() {
            if !state.is_aborted() && state.stalled_for() > timeout {
                state.abort("no progress within the transfer timeout");
                aborted += 1;
            }
        }
        aborted
    }

    fn close(&self, reason: CloseReason) {
        self.cancel.cancel();
        let transfers: Vec<_> = self.lock_transfers().drain().map(|(_, state)| state).collect();
        for state in &transfers {
            state.abort(&format!("connection closed: {}", reason));
        }
        if let Some(transport) = &self.transport {
            transport.close();
        }
        debug!(
            connection_id = %self.id,
            aborted_transfers = transfers.len(),
            reason = %reason,
            "Connection closed"
        );
    }
}

/// Serializable snapshot of a connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Connection identifier
    pub id: Uuid,
    /// Front-end protocol
    pub protocol: Protocol,
    /// Authenticated username
    pub username: String,
    /// Remote socket address
    pub remote_addr: SocketAddr,
    /// Admission time
    pub started_at: DateTime<Utc>,
    /// Seconds since the last activity
    pub idle_secs: u64,
    /// Open transfers
    pub transfers: Vec<TransferStatus>,
}

#[derive(Debug, Default)]
struct RegistryState {
    connections: HashMap<Uuid, Arc<Connection>>,
    per_user: HashMap<String, usize>,
}

/// Process-wide table of active connections
pub struct Registry {
    config: ConnectionsConfig,
    transfer_timeout: Option<Duration>,
    defender: Arc<Defender>,
    metrics: Metrics,
    state: Mutex<RegistryState>,
}

impl Registry {
    /// Create a registry consulting `defender` at admission
    pub fn new(config: ConnectionsConfig, defender: Arc<Defender>) -> Self {
        Self {
            config,
            transfer_timeout: None,
            defender,
            metrics: Metrics::new(),
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Report into shared metrics, builder style
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Abort transfers with no progress for this long, builder style
    #[must_use]
    pub const fn with_transfer_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    /// Defender consulted at admission
    pub const fn defender(&self) -> &Arc<Defender> {
        &self.defender
    }

    /// Fail if the host may not authenticate
    ///
    /// # Errors
    ///
    /// `Error::HostBanned` while the defender bans the host
    pub fn check_host(&self, ip: IpAddr) -> Result<()> {
        if self.defender.is_banned(ip) {
            debug!(client_ip = %ip, "Refusing banned host");
            return Err(Error::HostBanned(ip));
        }
        Ok(())
    }

    /// Admit a connection
    ///
    /// The ban check, both limit checks and the insertion are one step with
    /// respect to other admissions.
    ///
    /// # Errors
    ///
    /// `HostBanned`, `TooManyConnections` or `TooManyConnectionsFromUser`
    pub async fn add(&self, connection: Connection) -> Result<Arc<Connection>> {
        let ip = connection.remote_addr.ip();
        let protocol = connection.protocol;
        let username = connection.user.username.clone();

        let admitted = match self.check_host(ip) {
            Ok(()) => self.insert(connection).await,
            Err(e) => Err(e),
        };

        match admitted {
            Ok(connection) => {
                self.metrics.record_connection();
                AuditEvent::ConnectionAdmitted {
                    connection_id: connection.id.to_string(),
                    protocol: protocol.to_string(),
                    username,
                    client_ip: ip,
                    timestamp: Utc::now(),
                }
                .log();
                Ok(connection)
            }
            Err(e) => {
                self.metrics.record_rejected_connection();
                AuditEvent::ConnectionRejected {
                    protocol: protocol.to_string(),
                    username,
                    client_ip: ip,
                    reason: e.to_string(),
                    timestamp: Utc::now(),
                }
                .log();
                if matches!(
                    e,
                    Error::TooManyConnections(_) | Error::TooManyConnectionsFromUser { .. }
                ) && self.defender.add_event(ip, HostEvent::LimitExceeded)
                {
                    self.kick_address_with(ip, CloseReason::HostBanned).await;
                }
                Err(e)
            }
        }
    }

    async fn insert(&self, connection: Connection) -> Result<Arc<Connection>> {
        let mut state = self.state.lock().await;

        let max = self.config.max_connections;
        if max > 0 && state.connections.len() >= max {
            warn!(
                event = "connection_limit",
                limit = max,
                "Too many open connections"
            );
            return Err(Error::TooManyConnections(max));
        }

        let per_user_limit = if connection.user.max_sessions > 0 {
            connection.user.max_sessions
        } else {
            self.config.max_connections_per_user
        };
        let username = connection.user.username.clone();
        let current = state.per_user.get(&username).copied().unwrap_or(0);
        if per_user_limit > 0 && current >= per_user_limit {
            warn!(
                event = "user_connection_limit",
                username = %username,
                limit = per_user_limit,
                "Too many open connections for user"
            );
            return Err(Error::TooManyConnectionsFromUser {
                user: username,
                limit: per_user_limit,
            });
        }

        let connection = Arc::new(connection);
        state
            .connections
            .insert(connection.id, Arc::clone(&connection));
        *state.per_user.entry(username).or_insert(0) += 1;
        Ok(connection)
    }

    /// Remove a connection after a normal logout
    ///
    /// Returns `false` if the id is not registered, which is not an error.
    pub async fn remove(&self, id: Uuid) -> bool {
        self.remove_with(id, CloseReason::Logout).await
    }

    /// Remove a connection on operator request
    pub async fn kick(&self, id: Uuid) -> bool {
        self.remove_with(id, CloseReason::Kicked).await
    }

    /// Remove every connection from a host
    ///
    /// Returns the number of connections removed.
    pub async fn kick_address(&self, ip: IpAddr) -> usize {
        self.kick_address_with(ip, CloseReason::Kicked).await
    }

    async fn kick_address_with(&self, ip: IpAddr, reason: CloseReason) -> usize {
        let ids: Vec<Uuid> = {
            let state = self.state.lock().await;
            state
                .connections
                .values()
                .filter(|c| c.remote_addr.ip() == ip)
                .map(|c| c.id)
                .collect()
        };
        let mut removed = 0;
        for id in ids {
            if self.remove_with(id, reason).await {
                removed += 1;
            }
        }
        removed
    }

    /// Report a failed authentication
    ///
    /// Scores the host and, when this failure bans it, drops every session
    /// it still holds. Returns `true` if the host was banned.
    pub async fn record_auth_failure(&self, ip: IpAddr, event: HostEvent) -> bool {
        self.metrics.record_auth_failure();
        if !self.defender.add_event(ip, event) {
            return false;
        }
        let kicked = self.kick_address_with(ip, CloseReason::HostBanned).await;
        if kicked > 0 {
            info!(client_ip = %ip, kicked, "Dropped connections from banned host");
        }
        true
    }

    async fn remove_with(&self, id: Uuid, reason: CloseReason) -> bool {
        let connection = {
            let mut state = self.state.lock().await;
            let Some(connection) = state.connections.remove(&id) else {
                return false;
            };
            let username = &connection.user.username;
            if let Some(count) = state.per_user.get_mut(username) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.per_user.remove(username);
                }
            }
            connection
        };

        connection.close(reason);
        self.metrics.record_connection_close();
        AuditEvent::ConnectionClosed {
            connection_id: connection.id.to_string(),
            username: connection.user.username.clone(),
            client_ip: connection.remote_addr.ip(),
            reason: reason.to_string(),
            duration_secs: (Utc::now() - connection.started_at).num_seconds(),
            timestamp: Utc::now(),
        }
        .log();
        true
    }

    /// Look up a connection
    pub async fn get(&self, id: Uuid) -> Option<Arc<Connection>> {
        self.state.lock().await.connections.get(&id).cloned()
    }

    /// Every registered connection
    pub async fn list(&self) -> Vec<Arc<Connection>> {
        self.state
            .lock()
            .await
            .connections
            .values()
            .cloned()
            .collect()
    }

    /// Serializable snapshots of every connection, oldest first
    pub async fn list_status(&self) -> Vec<ConnectionStatus> {
        let mut statuses: Vec<ConnectionStatus> =
            self.list().await.iter().map(|c| c.status()).collect();
        statuses.sort_by_key(|s| s.started_at);
        statuses
    }

    /// Number of registered connections
    pub async fn count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    /// Number of connections held by a user
    pub async fn count_for_user(&self, username: &str) -> usize {
        self.state
            .lock()
            .await
            .per_user
            .get(username)
            .copied()
            .unwrap_or(0)
    }

    /// Evict idle connections and abort stalled transfers
    ///
    /// A connection with an open transfer is never idle. Returns the number
    /// of connections evicted.
    pub async fn sweep_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout();
        let mut idle = Vec::new();
        {
            let state = self.state.lock().await;
            for connection in state.connections.values() {
                if let Some(timeout) = self.transfer_timeout {
                    let stalled = connection.abort_stalled_transfers(timeout);
                    if stalled > 0 {
                        warn!(
                            connection_id = %connection.id,
                            stalled,
                            "Aborted stalled transfers"
                        );
                    }
                }
                let expired = idle_timeout.is_some_and(|timeout| {
                    connection.transfer_count() == 0 && connection.idle_for() > timeout
                });
                if expired {
                    idle.push(connection.id);
                }
            }
        }

        let mut evicted = 0;
        for id in idle {
            if self.remove_with(id, CloseReason::IdleTimeout).await {
                self.metrics.record_idle_eviction();
                evicted += 1;
            }
        }
        evicted
    }

    /// Run `sweep_idle` on the configured interval until `shutdown` fires
    pub fn spawn_idle_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let period = Duration::from_secs(self.config.idle_check_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = registry.sweep_idle().await;
                        if evicted > 0 {
                            info!(event = "idle_sweep", evicted, "Evicted idle connections");
                        }
                    }
                }
            }
            debug!("Idle sweeper stopped");
        })
    }

    /// Remove every connection, aborting their transfers
    ///
    /// Returns the number of connections drained.
    pub async fn shutdown(&self) -> usize {
        let ids: Vec<Uuid> = self.state.lock().await.connections.keys().copied().collect();
        let mut drained = 0;
        for id in ids {
            if self.remove_with(id, CloseReason::Shutdown).await {
                drained += 1;
            }
        }
        info!(drained, "Connection registry drained");
        drained
    }
}
