//! End-to-end flows through a shared runtime with local storage

use harbor_core::config::Config;
use harbor_core::defender::{HostOverride, write_overrides};
use harbor_core::quota::Usage;
use harbor_core::user::{FolderQuota, QuotaLimits, VirtualFolderMount};
use harbor_core::vfs::{BackendHandle, LocalFs, join, relativize};
use harbor_core::{
    Connection, Error, HostEvent, OpenFlags, Protocol, QuotaOwner, Runtime, TransferKind, User,
};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

struct Fixture {
    _home: tempfile::TempDir,
    _shared: tempfile::TempDir,
    user: Arc<User>,
}

fn fixture(folder_limits: QuotaLimits) -> Fixture {
    let home = tempfile::tempdir().unwrap();
    let shared = tempfile::tempdir().unwrap();
    let backend = Arc::new(LocalFs::new());

    let user = User::new(
        "bob",
        BackendHandle::new("localA", home.path(), backend.clone()),
    )
    .with_mount(VirtualFolderMount {
        virtual_path: "/shared".to_string(),
        backend: BackendHandle::new("localB", shared.path(), backend),
        quota_override: Some(FolderQuota {
            name: "shared".to_string(),
            limits: folder_limits,
        }),
    })
    .with_quota(QuotaLimits {
        max_size: 1_000,
        max_files: 0,
    });

    Fixture {
        _home: home,
        _shared: shared,
        user: Arc::new(user),
    }
}

fn addr(last: u8) -> SocketAddr {
    SocketAddr::from(([198, 51, 100, last], 2222))
}

#[tokio::test]
async fn test_upload_then_download_across_mounts() {
    let fx = fixture(QuotaLimits::default());
    let runtime = Runtime::new(Config::default()).unwrap();
    let conn = runtime
        .registry()
        .add(Connection::new(Protocol::Sftp, Arc::clone(&fx.user), addr(1)))
        .await
        .unwrap();

    let resolved = runtime
        .resolver()
        .resolve(&fx.user, "/shared/reports/../q3.csv")
        .unwrap();
    assert_eq!(resolved.virtual_path(), "/shared/q3.csv");
    assert_eq!(resolved.backend().id(), "localB");

    let mut upload = runtime
        .transfers()
        .open(&conn, resolved.clone(), TransferKind::Upload, OpenFlags::NONE)
        .await
        .unwrap();
    upload.write(b"region,total\n").await.unwrap();
    upload.write(b"emea,42\n").await.unwrap();
    upload.close().await.unwrap();

    let quota = runtime.transfers().quota();
    assert_eq!(
        quota.usage(&QuotaOwner::Folder("shared".into())),
        Usage {
            used_size: 21,
            used_files: 1
        }
    );
    assert_eq!(quota.usage(&QuotaOwner::User("bob".into())), Usage::default());

    let mut download = runtime
        .transfers()
        .open(&conn, resolved, TransferKind::Download, OpenFlags::NONE)
        .await
        .unwrap();
    assert_eq!(download.initial_size(), 21);
    let mut content = Vec::new();
    loop {
        let chunk = download.read(8).await.unwrap();
        if chunk.is_empty() {
            break;
        }
        content.extend_from_slice(&chunk);
    }
    download.close().await.unwrap();
    assert_eq!(content, b"region,total\nemea,42\n");

    let snapshot = runtime.metrics().snapshot();
    assert_eq!(snapshot.transfers_completed, 2);
    assert_eq!(snapshot.bytes_uploaded, 21);
    assert_eq!(snapshot.bytes_downloaded, 21);

    assert_eq!(runtime.shutdown().await, 1);
}

#[tokio::test]
async fn test_home_quota_blocks_after_overrun() {
    let fx = fixture(QuotaLimits::default());
    let runtime = Runtime::new(Config::default()).unwrap();
    let conn = runtime
        .registry()
        .add(Connection::new(Protocol::Ftp, Arc::clone(&fx.user), addr(2)))
        .await
        .unwrap();

    let resolved = runtime.resolver().resolve(&fx.user, "/big.bin").unwrap();
    let mut upload = runtime
        .transfers()
        .open(&conn, resolved, TransferKind::Upload, OpenFlags::NONE)
        .await
        .unwrap();
    upload.write(&[7u8; 1_200]).await.unwrap();
    upload.close().await.unwrap();

    let next = runtime.resolver().resolve(&fx.user, "/small.bin").unwrap();
    let err = runtime
        .transfers()
        .open(&conn, next, TransferKind::Upload, OpenFlags::NONE)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QuotaExceeded(_)));

    // The folder has its own, unlimited quota.
    let shared = runtime.resolver().resolve(&fx.user, "/shared/ok.bin").unwrap();
    let mut upload = runtime
        .transfers()
        .open(&conn, shared, TransferKind::Upload, OpenFlags::NONE)
        .await
        .unwrap();
    upload.write(b"fine").await.unwrap();
    upload.close().await.unwrap();

    assert_eq!(runtime.metrics().snapshot().quota_rejections, 1);
}

#[tokio::test]
async fn test_failed_logins_ban_and_kick_host() {
    let fx = fixture(QuotaLimits::default());
    let mut config = Config::default();
    config.defender.ban_threshold = 5;
    let runtime = Runtime::new(config).unwrap();

    let conn = runtime
        .registry()
        .add(Connection::new(Protocol::WebDav, Arc::clone(&fx.user), addr(3)))
        .await
        .unwrap();
    let ip = addr(3).ip();

    for _ in 0..4 {
        assert!(!runtime.registry().record_auth_failure(ip, HostEvent::LoginFailed).await);
    }
    assert!(!conn.is_closed());

    assert!(runtime.registry().record_auth_failure(ip, HostEvent::LoginFailed).await);
    assert!(conn.is_closed());
    assert_eq!(runtime.registry().count().await, 0);

    let err = runtime
        .registry()
        .add(Connection::new(Protocol::WebDav, Arc::clone(&fx.user), addr(3)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::HostBanned(host) if host == ip));

    // Other hosts are unaffected.
    runtime
        .registry()
        .add(Connection::new(Protocol::WebDav, Arc::clone(&fx.user), addr(4)))
        .await
        .unwrap();
    assert_eq!(runtime.metrics().snapshot().hosts_banned, 1);
}

#[tokio::test]
async fn test_overrides_file_is_applied_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bans.json");
    let banned: IpAddr = "203.0.113.9".parse().unwrap();
    write_overrides(
        &path,
        &[HostOverride {
            host: banned,
            banned_until: Some(chrono::Utc::now() + chrono::Duration::hours(1)),
            issued_at: chrono::Utc::now(),
        }],
    )
    .unwrap();

    let mut config = Config::default();
    config.defender.overrides_file = Some(path);
    let runtime = Runtime::new(config).unwrap();

    assert!(runtime.defender().is_banned(banned));
    assert!(runtime.registry().check_host(banned).is_err());
}

#[test]
fn test_relativize_inverts_resolution_paths() {
    let fx = fixture(QuotaLimits::default());
    let runtime = Runtime::new(Config::default()).unwrap();

    for (base, target) in [
        ("/shared/a", "/shared/b/c.txt"),
        ("/", "/shared/x"),
        ("/docs/2024", "/docs"),
        ("/shared", "/shared"),
    ] {
        let relative = relativize(base, target);
        let rejoined = join(base, &relative).unwrap();
        assert_eq!(rejoined, target, "{} -> {} via {}", base, target, relative);

        let resolved = runtime.resolver().resolve(&fx.user, &rejoined).unwrap();
        assert_eq!(resolved.virtual_path(), target);
    }
}

#[test]
fn test_physical_paths_stay_under_mount_roots() {
    let fx = fixture(QuotaLimits::default());
    let runtime = Runtime::new(Config::default()).unwrap();

    for path in ["/shared/../../etc/passwd", "/../x", "../../.."] {
        assert!(matches!(
            runtime.resolver().resolve(&fx.user, path),
            Err(Error::PathOutsideRoot(_))
        ));
    }

    let resolved = runtime.resolver().resolve(&fx.user, "/shared/a/b").unwrap();
    let root: &Path = resolved.backend().root();
    assert!(resolved.physical_path().starts_with(root));
}
