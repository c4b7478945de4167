//! Error types for the shared connection and transfer runtime
//!
//! Every protocol front end maps these onto its own reply codes. Messages
//! carry enough context for operators; `sanitized_message` is what a
//! client may see.

use std::net::IpAddr;
use thiserror::Error;

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Runtime error taxonomy
#[derive(Error, Debug)]
pub enum Error {
    /// Virtual path escapes the subtree of the mount that serves it
    #[error("Path outside root: {0}")]
    PathOutsideRoot(String),

    /// Path could not be interpreted at all (empty, NUL bytes)
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Mount table rejected (duplicate or root-level virtual path)
    #[error("Invalid mount: {0}")]
    InvalidMount(String),

    /// User lacks the permission for this operation on this path
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Process-wide connection limit reached
    #[error("Too many open connections, limit {0} reached")]
    TooManyConnections(usize),

    /// Per-user connection limit reached
    #[error("Too many open connections for user {user}, limit {limit} reached")]
    TooManyConnectionsFromUser {
        /// Username that hit the limit
        user: String,
        /// Effective limit for that user
        limit: usize,
    },

    /// Remote host is currently banned by the defender
    #[error("Host {0} is banned")]
    HostBanned(IpAddr),

    /// Operation is not supported for this transfer or backend
    #[error("Operation not supported: {0}")]
    OpUnsupported(String),

    /// Quota or disk-usage limit reached
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// `close` called on a transfer that was already closed
    #[error("Transfer already closed")]
    TransferAlreadyClosed,

    /// Transfer was aborted (connection removed, backend failure, stall)
    #[error("Transfer aborted: {0}")]
    TransferAborted(String),

    /// Operation exceeded its time limit
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Peer certificate found in a loaded revocation list
    #[error("Certificate revoked: {0}")]
    CertificateRevoked(String),

    /// TLS handshake produced no verified chain to check
    #[error("TLS connection cannot be verified: no verified certificate chain")]
    NoVerifiedChain,

    /// Certificate, key or revocation list could not be loaded
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Storage backend reported a failure
    #[error("Backend unavailable: {context}")]
    BackendUnavailable {
        /// What the runtime was doing when the backend failed
        context: String,
        /// Failure reported by the backend
        #[source]
        source: std::io::Error,
    },

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Wrap a backend I/O failure with context
    pub fn backend(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::BackendUnavailable {
            context: context.into(),
            source,
        }
    }

    /// Check if error was caused by what the client asked for
    ///
    /// # Returns
    ///
    /// `true` for path, permission, limit and unsupported-operation errors
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::PathOutsideRoot(_)
                | Self::InvalidPath(_)
                | Self::PermissionDenied(_)
                | Self::OpUnsupported(_)
                | Self::QuotaExceeded(_)
                | Self::TransferAlreadyClosed
        )
    }

    /// Check if error has security implications and belongs in the audit trail
    pub const fn is_security_event(&self) -> bool {
        matches!(
            self,
            Self::PathOutsideRoot(_)
                | Self::PermissionDenied(_)
                | Self::HostBanned(_)
                | Self::CertificateRevoked(_)
                | Self::NoVerifiedChain
        )
    }

    /// Get an error message that is safe to send to a client
    ///
    /// Physical paths, backend details and certificate locations never
    /// leave the server.
    pub fn sanitized_message(&self) -> String {
        match self {
            Self::PathOutsideRoot(_) | Self::InvalidPath(_) => "Invalid path".to_string(),
            Self::PermissionDenied(_) => "Permission denied".to_string(),
            Self::BackendUnavailable { .. } => "Storage backend unavailable".to_string(),
            Self::Certificate(_) | Self::Config(_) => "Server configuration error".to_string(),
            Self::CertificateRevoked(_) => "Certificate revoked".to_string(),
            Self::TooManyConnections(_) | Self::TooManyConnectionsFromUser { .. } => {
                "Too many open connections".to_string()
            }
            Self::HostBanned(_) => "Access denied".to_string(),
            Self::InvalidMount(_) => "Server configuration error".to_string(),
            _ => self.to_string(),
        }
    }
}
