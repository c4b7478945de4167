//! Audit trail
//!
//! Security-relevant events are logged as structured records so a log
//! aggregator can pick them out by `event` field, and can be exported as
//! JSON on their own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracing::{info, warn};

/// Audit event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum AuditEvent {
    /// Connection admitted by the registry
    ConnectionAdmitted {
        /// Connection identifier
        connection_id: String,
        /// Front-end protocol
        protocol: String,
        /// Authenticated username
        username: String,
        /// Client IP address
        client_ip: IpAddr,
        /// Event timestamp
        timestamp: DateTime<Utc>,
    },
    /// Connection refused at admission
    ConnectionRejected {
        /// Front-end protocol
        protocol: String,
        /// Username that tried to connect
        username: String,
        /// Client IP address
        client_ip: IpAddr,
        /// Why admission failed
        reason: String,
        /// Event timestamp
        timestamp: DateTime<Utc>,
    },
    /// Connection removed from the registry
    ConnectionClosed {
        /// Connection identifier
        connection_id: String,
        /// Authenticated username
        username: String,
        /// Client IP address
        client_ip: IpAddr,
        /// Why the connection ended
        reason: String,
        /// Session duration in seconds
        duration_secs: i64,
        /// Event timestamp
        timestamp: DateTime<Utc>,
    },
    /// Transfer closed normally
    TransferCompleted {
        /// Owning connection
        connection_id: String,
        /// Authenticated username
        username: String,
        /// UPLOAD or DOWNLOAD
        operation: String,
        /// Virtual path
        path: String,
        /// Bytes moved
        bytes: u64,
        /// Transfer duration in milliseconds
        elapsed_ms: i64,
        /// Event timestamp
        timestamp: DateTime<Utc>,
    },
    /// Transfer aborted
    TransferAborted {
        /// Owning connection
        connection_id: String,
        /// Authenticated username
        username: String,
        /// UPLOAD or DOWNLOAD
        operation: String,
        /// Virtual path
        path: String,
        /// Bytes moved before the abort
        bytes: u64,
        /// Abort reason
        error: String,
        /// Event timestamp
        timestamp: DateTime<Utc>,
    },
    /// Upload refused or committed past a quota limit
    QuotaExceeded {
        /// Authenticated username
        username: String,
        /// Quota owner (user or folder)
        owner: String,
        /// Virtual path
        path: String,
        /// Event timestamp
        timestamp: DateTime<Utc>,
    },
    /// Host banned by the defender
    HostBanned {
        /// Banned host
        client_ip: IpAddr,
        /// Score when the ban triggered
        score: u32,
        /// Ban duration in seconds
        duration_secs: u64,
        /// Event timestamp
        timestamp: DateTime<Utc>,
    },
    /// Host removed from the defender table by an operator
    HostUnbanned {
        /// Unbanned host
        client_ip: IpAddr,
        /// Event timestamp
        timestamp: DateTime<Utc>,
    },
    /// Certificate or revocation-list reload attempt
    CertificatesReloaded {
        /// Key pairs in the attempted generation
        key_pairs: usize,
        /// Revocation lists in the attempted generation
        revocation_lists: usize,
        /// Whether the new generation was installed
        success: bool,
        /// First error when the reload failed
        error: Option<String>,
        /// Event timestamp
        timestamp: DateTime<Utc>,
    },
    /// Client certificate refused after the handshake
    CertificateRejected {
        /// Peer certificate subject, when known
        subject: Option<String>,
        /// Rejection reason
        reason: String,
        /// Event timestamp
        timestamp: DateTime<Utc>,
    },
}

impl AuditEvent {
    /// Log the audit event
    pub fn log(&self) {
        match self {
            Self::ConnectionAdmitted {
                connection_id,
                protocol,
                username,
                client_ip,
                ..
            } => {
                info!(
                    event = "connection_admitted",
                    connection_id,
                    protocol,
                    username,
                    client_ip = %client_ip,
                    "Connection admitted"
                );
            }
            Self::ConnectionRejected {
                protocol,
                username,
                client_ip,
                reason,
                ..
            } => {
                warn!(
                    event = "connection_rejected",
                    protocol,
                    username,
                    client_ip = %client_ip,
                    reason,
                    "Connection rejected"
                );
            }
            Self::ConnectionClosed {
                connection_id,
                username,
                reason,
                duration_secs,
                ..
            } => {
                info!(
                    event = "connection_closed",
                    connection_id,
                    username,
                    reason,
                    duration_secs,
                    "Connection closed"
                );
            }
            Self::TransferCompleted {
                connection_id,
                operation,
                path,
                bytes,
                elapsed_ms,
                ..
            } => {
                info!(
                    event = "transfer_completed",
                    connection_id,
                    operation,
                    path,
                    bytes,
                    elapsed_ms,
                    "Transfer completed"
                );
            }
            Self::TransferAborted {
                connection_id,
                operation,
                path,
                bytes,
                error,
                ..
            } => {
                warn!(
                    event = "transfer_aborted",
                    connection_id,
                    operation,
                    path,
                    bytes,
                    error,
                    "Transfer aborted"
                );
            }
            Self::QuotaExceeded {
                username,
                owner,
                path,
                ..
            } => {
                warn!(
                    event = "quota_exceeded",
                    username,
                    owner,
                    path,
                    "Quota exceeded"
                );
            }
            Self::HostBanned {
                client_ip,
                score,
                duration_secs,
                ..
            } => {
                warn!(
                    event = "host_banned",
                    client_ip = %client_ip,
                    score,
                    duration_secs,
                    "Host banned"
                );
            }
            Self::HostUnbanned { client_ip, .. } => {
                info!(event = "host_unbanned", client_ip = %client_ip, "Host unbanned");
            }
            Self::CertificatesReloaded {
                key_pairs,
                revocation_lists,
                success,
                error,
                ..
            } => {
                if *success {
                    info!(
                        event = "certificates_reloaded",
                        key_pairs,
                        revocation_lists,
                        "Certificates reloaded"
                    );
                } else {
                    warn!(
                        event = "certificates_reload_failed",
                        key_pairs,
                        revocation_lists,
                        error = ?error,
                        "Certificate reload failed, previous generation kept"
                    );
                }
            }
            Self::CertificateRejected {
                subject, reason, ..
            } => {
                warn!(
                    event = "certificate_rejected",
                    subject = ?subject,
                    reason,
                    "Client certificate rejected"
                );
            }
        }
    }

    /// Export as JSON
    ///
    /// # Errors
    ///
    /// Returns the serializer error, which cannot happen for these variants
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
