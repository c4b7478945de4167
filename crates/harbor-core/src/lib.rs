//! # Harbor Core
//!
//! Shared connection and transfer runtime for a multi-protocol file
//! transfer server. Every protocol front end (SFTP, SCP, FTP/S, WebDAV,
//! HTTP) builds on the same pieces:
//!
//! - [`vfs`]: storage backends, path normalization and per-user mount
//!   resolution
//! - [`registry`]: admission limits, idle eviction and forced kicks
//! - [`transfer`] and [`quota`]: upload/download lifecycle with exact
//!   quota accounting
//! - [`defender`]: host scoring and automatic bans
//! - [`certs`]: hot-reloadable TLS key pairs and revocation checks
//!
//! [`Runtime`] owns one instance of each process-wide service.

pub mod audit;
pub mod certs;
pub mod config;
pub mod defender;
pub mod error;
pub mod metrics;
pub mod quota;
pub mod registry;
pub mod runtime;
pub mod transfer;
pub mod user;
pub mod vfs;

pub use certs::CertManager;
pub use config::Config;
pub use defender::{Defender, HostEvent};
pub use error::{Error, Result};
pub use quota::{QuotaOwner, QuotaTracker};
pub use registry::{Connection, Protocol, Registry};
pub use runtime::Runtime;
pub use transfer::{OpenFlags, Transfer, TransferKind, Transfers};
pub use user::{Permission, User};
