//! Virtual path resolution
//!
//! Maps a user's logical tree onto the backends mounted in it. The user's
//! home backend is the implicit mount at `/`; every other mount is matched
//! by longest prefix, compared segment by segment.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::backend::BackendHandle;
use super::path::{is_within, normalize};
use crate::user::{FolderQuota, User, VirtualFolderMount};
use crate::{Error, Result};

/// Output of a resolution, valid for the single operation it serves
#[derive(Debug, Clone)]
pub struct ResolvedPath {
    backend: BackendHandle,
    physical_path: PathBuf,
    virtual_path: String,
    mount_path: String,
    folder_quota: Option<FolderQuota>,
}

impl ResolvedPath {
    /// Backend serving the path
    pub const fn backend(&self) -> &BackendHandle {
        &self.backend
    }

    /// Physical path inside the backend
    pub fn physical_path(&self) -> &Path {
        &self.physical_path
    }

    /// Normalized virtual path
    pub fn virtual_path(&self) -> &str {
        &self.virtual_path
    }

    /// Virtual path of the mount that matched (`/` for the home)
    pub fn mount_path(&self) -> &str {
        &self.mount_path
    }

    /// Folder quota of the matched mount, if it overrides the user's
    pub const fn folder_quota(&self) -> Option<&FolderQuota> {
        self.folder_quota.as_ref()
    }
}

/// Resolves virtual paths against a user's mount table
#[derive(Debug, Clone, Copy, Default)]
pub struct Resolver;

impl Resolver {
    /// Create a resolver
    pub const fn new() -> Self {
        Self
    }

    /// Check a user's mount table
    ///
    /// Mount paths must be valid, must not be `/` (the home owns it) and
    /// must be unique once normalized. Nesting is allowed: the deepest
    /// mount wins at resolution time.
    ///
    /// # Errors
    ///
    /// `Error::InvalidMount` for the first offending mount
    pub fn validate_mounts(&self, user: &User) -> Result<()> {
        let mut seen = HashSet::new();
        for mount in &user.mounts {
            let normalized = normalize(&mount.virtual_path).map_err(|_| {
                Error::InvalidMount(format!("invalid virtual path {:?}", mount.virtual_path))
            })?;
            if normalized == "/" {
                return Err(Error::InvalidMount(
                    "a folder cannot be mounted at /".to_string(),
                ));
            }
            if !seen.insert(normalized.clone()) {
                return Err(Error::InvalidMount(format!(
                    "virtual path {} is mounted more than once",
                    normalized
                )));
            }
        }
        Ok(())
    }

    /// Resolve a virtual path for a user
    ///
    /// # Errors
    ///
    /// `PathOutsideRoot` when the path escapes its mount, `InvalidPath` for
    /// malformed input, `InvalidMount` for a broken mount table.
    pub fn resolve(&self, user: &User, virtual_path: &str) -> Result<ResolvedPath> {
        let normalized = normalize(virtual_path).inspect_err(|e| {
            if matches!(e, Error::PathOutsideRoot(_)) {
                warn!(
                    event = "path_traversal_attempt",
                    username = %user.username,
                    path = virtual_path,
                    "Path escapes the user's root"
                );
            }
        })?;
        // The whole table is checked so a broken one fails for every path.
        self.validate_mounts(user)?;

        let mut best: Option<(&VirtualFolderMount, String)> = None;
        for mount in &user.mounts {
            let mount_path = normalize(&mount.virtual_path).map_err(|_| {
                Error::InvalidMount(format!("invalid virtual path {:?}", mount.virtual_path))
            })?;
            if !is_within(&mount_path, &normalized) {
                continue;
            }
            match &best {
                Some((_, current)) if current.len() >= mount_path.len() => {}
                _ => best = Some((mount, mount_path)),
            }
        }

        let (backend, mount_path, folder_quota) = match best {
            Some((mount, mount_path)) => (
                &mount.backend,
                mount_path,
                mount.quota_override.clone(),
            ),
            None => (&user.home, "/".to_string(), None),
        };

        let relative = normalized
            .strip_prefix(mount_path.as_str())
            .unwrap_or_default()
            .trim_start_matches('/');
        let root = backend.root();
        let physical_path = relative
            .split('/')
            .filter(|segment| !segment.is_empty())
            .fold(root.to_path_buf(), |path, segment| path.join(segment));

        if !physical_path.starts_with(root) {
            warn!(
                event = "path_traversal_attempt",
                username = %user.username,
                path = virtual_path,
                "Resolved path leaves the mount root"
            );
            return Err(Error::PathOutsideRoot(virtual_path.to_string()));
        }

        debug!(
            username = %user.username,
            virtual_path = %normalized,
            mount = %mount_path,
            backend = backend.id(),
            "Resolved virtual path"
        );

        Ok(ResolvedPath {
            backend: backend.clone(),
            physical_path,
            virtual_path: normalized,
            mount_path,
            folder_quota,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::QuotaLimits;
    use crate::vfs::LocalFs;
    use std::sync::Arc;

    fn handle(id: &str, root: &str) -> BackendHandle {
        BackendHandle::new(id, root, Arc::new(LocalFs::new()))
    }

    fn mount(path: &str, backend: BackendHandle) -> VirtualFolderMount {
        VirtualFolderMount {
            virtual_path: path.to_string(),
            backend,
            quota_override: None,
        }
    }

    fn bob() -> User {
        User::new("bob", handle("localA", "/data/a"))
            .with_mount(mount("/shared", handle("localB", "/data/b")))
    }

    #[test]
    fn test_resolve_into_mount() {
        let resolved = Resolver::new().resolve(&bob(), "/shared/report.pdf").unwrap();
        assert_eq!(resolved.backend().id(), "localB");
        assert_eq!(resolved.physical_path(), Path::new("/data/b/report.pdf"));
        assert_eq!(resolved.virtual_path(), "/shared/report.pdf");
        assert_eq!(resolved.mount_path(), "/shared");
    }

    #[test]
    fn test_resolve_home() {
        let resolved = Resolver::new().resolve(&bob(), "docs/../notes.txt").unwrap();
        assert_eq!(resolved.backend().id(), "localA");
        assert_eq!(resolved.physical_path(), Path::new("/data/a/notes.txt"));
    }

    #[test]
    fn test_mount_path_resolves_to_root() {
        let resolver = Resolver::new();
        let user = bob();
        assert_eq!(
            resolver.resolve(&user, "/shared").unwrap().physical_path(),
            Path::new("/data/b")
        );
        assert_eq!(
            resolver.resolve(&user, "/shared/").unwrap().physical_path(),
            Path::new("/data/b")
        );
        assert_eq!(
            resolver.resolve(&user, "/").unwrap().physical_path(),
            Path::new("/data/a")
        );
    }

    #[test]
    fn test_escape_is_rejected() {
        let err = Resolver::new()
            .resolve(&bob(), "/shared/../../etc/passwd")
            .unwrap_err();
        assert!(matches!(err, Error::PathOutsideRoot(_)));
    }

    #[test]
    fn test_sibling_prefix_is_not_a_match() {
        let resolved = Resolver::new().resolve(&bob(), "/shared2/x").unwrap();
        assert_eq!(resolved.backend().id(), "localA");
    }

    #[test]
    fn test_deepest_mount_wins() {
        let user = bob().with_mount(mount("/shared/deep", handle("localC", "/data/c")));
        let resolver = Resolver::new();
        assert_eq!(
            resolver.resolve(&user, "/shared/deep/x").unwrap().backend().id(),
            "localC"
        );
        assert_eq!(
            resolver.resolve(&user, "/shared/x").unwrap().backend().id(),
            "localB"
        );
    }

    #[test]
    fn test_folder_quota_travels_with_resolution() {
        let mut shared = mount("/shared", handle("localB", "/data/b"));
        shared.quota_override = Some(FolderQuota {
            name: "team".into(),
            limits: QuotaLimits {
                max_size: 10,
                max_files: 1,
            },
        });
        let user = User::new("bob", handle("localA", "/data/a")).with_mount(shared);
        let resolved = Resolver::new().resolve(&user, "/shared/a").unwrap();
        assert_eq!(resolved.folder_quota().unwrap().name, "team");
    }

    #[test]
    fn test_duplicate_mounts_are_rejected() {
        let user = bob().with_mount(mount("/shared/", handle("localC", "/data/c")));
        let resolver = Resolver::new();
        assert!(matches!(
            resolver.validate_mounts(&user),
            Err(Error::InvalidMount(_))
        ));
        assert!(matches!(
            resolver.resolve(&user, "/shared/a"),
            Err(Error::InvalidMount(_))
        ));
    }

    #[test]
    fn test_duplicate_mounts_fail_regardless_of_order() {
        let user = User::new("bob", handle("localA", "/data/a"))
            .with_mount(mount("/shared", handle("localB", "/data/b")))
            .with_mount(mount("/shared/deep", handle("localD", "/data/d")))
            .with_mount(mount("/shared/", handle("localC", "/data/c")));
        let resolver = Resolver::new();

        for path in ["/shared/deep/x", "/shared/x", "/elsewhere"] {
            assert!(
                matches!(resolver.resolve(&user, path), Err(Error::InvalidMount(_))),
                "{path} resolved against a duplicated mount table"
            );
        }
    }

    #[test]
    fn test_root_mount_is_rejected() {
        let user = bob().with_mount(mount("/", handle("localC", "/data/c")));
        assert!(Resolver::new().validate_mounts(&user).is_err());
        assert!(Resolver::new().validate_mounts(&bob()).is_ok());
    }
}
