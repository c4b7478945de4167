//! User snapshot handed to the runtime by the account store
//!
//! The runtime never loads or persists users; a `User` is a value valid for
//! the lifetime of one connection.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::vfs::{self, BackendHandle};
use crate::{Error, Result};

/// Operation a user may be granted on a path prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Every permission
    #[serde(rename = "*")]
    Any,
    /// List directory contents
    List,
    /// Read files
    Download,
    /// Create new files
    Upload,
    /// Replace existing files
    Overwrite,
    /// Remove files and directories
    Delete,
    /// Rename files and directories
    Rename,
    /// Create directories
    CreateDirs,
}

/// Quota limits; zero means unlimited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    /// Maximum total bytes
    pub max_size: u64,
    /// Maximum number of files
    pub max_files: u64,
}

impl QuotaLimits {
    /// Both limits disabled
    pub const fn is_unlimited(&self) -> bool {
        self.max_size == 0 && self.max_files == 0
    }
}

/// Quota tracked separately for a mounted folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderQuota {
    /// Folder name, shared by every user mounting the same folder
    pub name: String,
    /// Folder limits
    pub limits: QuotaLimits,
}

/// A virtual path prefix bound to one storage backend
#[derive(Debug, Clone)]
pub struct VirtualFolderMount {
    /// Virtual path the folder is mounted at
    pub virtual_path: String,
    /// Backend serving the folder
    pub backend: BackendHandle,
    /// Folder-level quota, replacing the user's for paths below the mount
    pub quota_override: Option<FolderQuota>,
}

/// Authenticated user, as seen by the runtime
#[derive(Debug, Clone)]
pub struct User {
    /// Login name
    pub username: String,
    /// Backend serving the implicit `/` mount
    pub home: BackendHandle,
    /// Permission rules keyed by virtual path prefix
    pub permissions: BTreeMap<String, Vec<Permission>>,
    /// User quota
    pub quota: QuotaLimits,
    /// Per-user session limit overriding the configured one (0 = use config)
    pub max_sessions: usize,
    /// Additional mounts
    pub mounts: Vec<VirtualFolderMount>,
}

impl User {
    /// Create a user with full permissions on `/` and no mounts
    pub fn new(username: impl Into<String>, home: BackendHandle) -> Self {
        let mut permissions = BTreeMap::new();
        permissions.insert("/".to_string(), vec![Permission::Any]);
        Self {
            username: username.into(),
            home,
            permissions,
            quota: QuotaLimits::default(),
            max_sessions: 0,
            mounts: Vec::new(),
        }
    }

    /// Add a mount, builder style
    #[must_use]
    pub fn with_mount(mut self, mount: VirtualFolderMount) -> Self {
        self.mounts.push(mount);
        self
    }

    /// Replace the permissions for a prefix, builder style
    #[must_use]
    pub fn with_permissions(mut self, prefix: impl Into<String>, perms: Vec<Permission>) -> Self {
        self.permissions.insert(prefix.into(), perms);
        self
    }

    /// Set user quota limits, builder style
    #[must_use]
    pub const fn with_quota(mut self, quota: QuotaLimits) -> Self {
        self.quota = quota;
        self
    }

    /// Permissions applying to a normalized virtual path
    ///
    /// The deepest configured prefix wins; without any match nothing is
    /// granted.
    pub fn permissions_for(&self, virtual_path: &str) -> &[Permission] {
        self.permissions
            .iter()
            .filter(|(prefix, _)| {
                vfs::normalize(prefix).is_ok_and(|p| vfs::is_within(&p, virtual_path))
            })
            .max_by_key(|(prefix, _)| prefix.trim_end_matches('/').len())
            .map_or(&[], |(_, perms)| perms.as_slice())
    }

    /// Check a single permission on a normalized virtual path
    pub fn has_permission(&self, virtual_path: &str, permission: Permission) -> bool {
        let perms = self.permissions_for(virtual_path);
        perms.contains(&Permission::Any) || perms.contains(&permission)
    }

    /// Fail with `PermissionDenied` unless the permission is granted
    ///
    /// # Errors
    ///
    /// `Error::PermissionDenied` naming the missing permission
    pub fn require(&self, virtual_path: &str, permission: Permission) -> Result<()> {
        if self.has_permission(virtual_path, permission) {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!(
                "{:?} not granted on {}",
                permission, virtual_path
            )))
        }
    }
}
