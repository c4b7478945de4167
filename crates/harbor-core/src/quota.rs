//! Per-owner usage accounting
//!
//! Usage is keyed by quota owner: a user, or a folder whose mount carries
//! its own quota. Each owner's counters sit behind their own shard entry,
//! so updates for one owner are totally ordered while different owners
//! never contend on a single lock.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::user::{QuotaLimits, User};
use crate::vfs::ResolvedPath;
use crate::{Error, Result};

/// Who a transfer's bytes are charged to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum QuotaOwner {
    /// A user's own quota
    User(String),
    /// A mounted folder with a quota override
    Folder(String),
}

impl QuotaOwner {
    /// Owner charged for a resolved path, with the limits that apply
    pub fn for_path(user: &User, resolved: &ResolvedPath) -> (Self, QuotaLimits) {
        match resolved.folder_quota() {
            Some(folder) => (Self::Folder(folder.name.clone()), folder.limits),
            None => (Self::User(user.username.clone()), user.quota),
        }
    }
}

impl fmt::Display for QuotaOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(name) => write!(f, "user:{}", name),
            Self::Folder(name) => write!(f, "folder:{}", name),
        }
    }
}

/// Bytes and files charged to an owner
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Bytes used
    pub used_size: u64,
    /// Files stored
    pub used_files: u64,
}

impl Usage {
    /// Whether usage has reached either limit
    pub const fn exceeds(&self, limits: &QuotaLimits) -> bool {
        (limits.max_size > 0 && self.used_size > limits.max_size)
            || (limits.max_files > 0 && self.used_files > limits.max_files)
    }

    /// Bytes left before the size limit, `None` when unlimited
    pub const fn remaining_size(&self, limits: &QuotaLimits) -> Option<u64> {
        if limits.max_size == 0 {
            None
        } else {
            Some(limits.max_size.saturating_sub(self.used_size))
        }
    }
}

/// Usage table shared by every transfer
#[derive(Debug, Default)]
pub struct QuotaTracker {
    usage: DashMap<QuotaOwner, Usage>,
}

impl QuotaTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an owner's usage, as computed by the account store
    pub fn seed(&self, owner: QuotaOwner, usage: Usage) {
        self.usage.insert(owner, usage);
    }

    /// Current usage for an owner
    pub fn usage(&self, owner: &QuotaOwner) -> Usage {
        self.usage.get(owner).map(|u| *u).unwrap_or_default()
    }

    /// Apply a signed delta and return the new usage
    ///
    /// Counters saturate at zero.
    pub fn update(&self, owner: &QuotaOwner, delta_size: i64, delta_files: i64) -> Usage {
        let mut usage = self.usage.entry(owner.clone()).or_default();
        usage.used_size = apply_delta(usage.used_size, delta_size);
        usage.used_files = apply_delta(usage.used_files, delta_files);
        *usage
    }

    /// Pre-flight check before opening an upload
    ///
    /// Rejects when the size limit is already reached, or when a new file
    /// would go past the file-count limit. A limit of zero is unlimited.
    ///
    /// # Errors
    ///
    /// `Error::QuotaExceeded` naming the owner
    pub fn check(&self, owner: &QuotaOwner, limits: &QuotaLimits, new_file: bool) -> Result<()> {
        if limits.is_unlimited() {
            return Ok(());
        }
        let usage = self.usage(owner);
        if limits.max_size > 0 && usage.used_size >= limits.max_size {
            return Err(Error::QuotaExceeded(format!(
                "{} uses {} of {} bytes",
                owner, usage.used_size, limits.max_size
            )));
        }
        if new_file && limits.max_files > 0 && usage.used_files >= limits.max_files {
            return Err(Error::QuotaExceeded(format!(
                "{} stores {} of {} files",
                owner, usage.used_files, limits.max_files
            )));
        }
        Ok(())
    }
}

fn apply_delta(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta.unsigned_abs())
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}
