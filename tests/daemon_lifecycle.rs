#![forbid(unsafe_code)]

//! Daemon startup/shutdown ordering, registry-to-announcer synchronization
//! and lifecycle idempotence.

mod common;

use common::ScriptedDht;
use libreseed::core::config::DaemonConfig;
use libreseed::daemon::state::DaemonStatus;
use libreseed::daemon::{Daemon, DaemonError};
use libreseed::networking::dht::DhtService;
use libreseed::registry::packages::PackageInfo;
use std::sync::Arc;

const VALID_ID: &str = "c61349fb2b5f2b3a1d8f8e9c3b8a4f5e6d7c8b9a0f1e2d3c4b5a6978695a4b3c";

fn test_config(dir: &std::path::Path) -> DaemonConfig {
    let mut cfg = DaemonConfig::default();
    cfg.storage_dir = dir.to_path_buf();
    cfg.listen_addr = "127.0.0.1:0".to_string();
    cfg.dht_bootstrap_nodes = vec!["127.0.0.1:1".to_string()];
    cfg
}

fn catalog_entry(dir: &std::path::Path, package_id: &str, name: &str) -> PackageInfo {
    PackageInfo {
        package_id: package_id.to_string(),
        name: name.to_string(),
        version: "1.0.0".to_string(),
        description: String::new(),
        file_path: dir.join("packages").join(format!("{name}.yaml")),
        file_hash: hex::encode([0x11u8; 32]),
        file_size: 64,
        created_at: chrono::Utc::now(),
        creator_fingerprint: "0123456789abcdef".to_string(),
        manifest_signature: hex::encode([1u8; 64]),
        maintainer_fingerprint: "fedcba9876543210".to_string(),
        maintainer_manifest_signature: hex::encode([2u8; 64]),
        announced_to_dht: false,
        last_announced: None,
    }
}

fn seed_catalog(dir: &std::path::Path, entries: &[PackageInfo]) {
    let yaml = serde_yaml::to_string(entries).unwrap();
    std::fs::write(dir.join("packages.yaml"), yaml).unwrap();
}

#[tokio::test]
async fn malformed_catalog_ids_are_skipped_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    seed_catalog(
        dir.path(),
        &[
            catalog_entry(dir.path(), VALID_ID, "good"),
            catalog_entry(dir.path(), "INVALID_HEX_STRING", "bad-hex"),
            catalog_entry(dir.path(), "abc123", "too-short"),
        ],
    );

    let dht = Arc::new(ScriptedDht::new());
    let daemon = Arc::new(
        Daemon::with_dht_backend(test_config(dir.path()), Some(dht as Arc<dyn DhtService>))
            .unwrap(),
    );
    daemon.start().await.unwrap();

    assert_eq!(daemon.state().status(), DaemonStatus::Running);
    let announcer = daemon.announcer().expect("announcer up");
    let tracked = announcer.get_packages();
    assert_eq!(tracked.len(), 1, "only the well-formed id is announced");
    assert_eq!(tracked[0].info_hash, &VALID_ID[..40]);

    daemon.stop().await;
    assert_eq!(daemon.state().status(), DaemonStatus::Stopped);
}

#[tokio::test]
async fn start_twice_fails_stop_twice_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let dht = Arc::new(ScriptedDht::new());
    let daemon = Arc::new(
        Daemon::with_dht_backend(test_config(dir.path()), Some(dht as Arc<dyn DhtService>))
            .unwrap(),
    );

    daemon.start().await.unwrap();
    assert!(matches!(daemon.start().await.unwrap_err(), DaemonError::AlreadyRunning));

    daemon.stop().await;
    daemon.stop().await;
    assert_eq!(daemon.state().status(), DaemonStatus::Stopped);

    // A stopped daemon can come back up.
    daemon.start().await.unwrap();
    assert_eq!(daemon.state().status(), DaemonStatus::Running);
    daemon.stop().await;
}

#[tokio::test]
async fn dht_disabled_means_no_announcer_or_discovery() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.enable_dht = false;
    cfg.dht_bootstrap_nodes.clear();

    let daemon = Arc::new(Daemon::new(cfg).unwrap());
    daemon.start().await.unwrap();

    assert!(daemon.dht().is_none());
    assert!(daemon.announcer().is_none());
    assert!(daemon.discovery().is_none());
    assert_eq!(daemon.state().status(), DaemonStatus::Running);

    daemon.stop().await;
}

#[tokio::test]
async fn pid_file_written_and_removed() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.enable_dht = false;
    cfg.dht_bootstrap_nodes.clear();
    let pid_path = cfg.pid_path();

    let daemon = Arc::new(Daemon::new(cfg).unwrap());
    daemon.start().await.unwrap();

    let contents = std::fs::read_to_string(&pid_path).unwrap();
    assert!(contents.starts_with(&format!("{}:", std::process::id())));
    assert!(contents.ends_with('\n'));

    daemon.stop().await;
    assert!(!pid_path.exists());
}

#[tokio::test]
async fn storage_layout_is_created_with_modes() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.enable_dht = false;
    cfg.dht_bootstrap_nodes.clear();

    let _daemon = Daemon::new(cfg.clone()).unwrap();
    assert!(cfg.packages_dir().is_dir());
    assert!(cfg.keys_dir().is_dir());
    assert!(cfg.keys_dir().join("host.key").is_file());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let keys_mode =
            std::fs::metadata(cfg.keys_dir()).unwrap().permissions().mode() & 0o777;
        assert_eq!(keys_mode, 0o700);
    }
}

#[tokio::test]
async fn corrupt_catalog_fails_daemon_construction() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("packages.yaml"), "][ not yaml").unwrap();

    let mut cfg = test_config(dir.path());
    cfg.enable_dht = false;
    cfg.dht_bootstrap_nodes.clear();
    let err = match Daemon::new(cfg) {
        Ok(_) => panic!("a corrupt catalog must fail construction"),
        Err(e) => e,
    };
    assert!(matches!(err, DaemonError::Registry(_)));
}
