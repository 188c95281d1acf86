#![forbid(unsafe_code)]

//! Catalog persistence across manager lifetimes: every mutation is durable
//! before the call returns, and reloads see exactly the committed state.

mod common;

use common::signed_container_bytes;
use libreseed::core::crypto::sha256_hex;
use libreseed::registry::packages::{PackageInfo, PackageManager, RegistryError};

fn manager(dir: &std::path::Path) -> PackageManager {
    PackageManager::new(dir.join("packages.yaml"), dir.join("packages"))
}

fn info_for(dir: &std::path::Path, container: &[u8], pkg: &libreseed::core::package::Package) -> PackageInfo {
    PackageInfo {
        package_id: pkg.package_id.clone(),
        name: pkg.manifest.package_name.clone(),
        version: pkg.manifest.version.clone(),
        description: pkg.manifest.description.clone(),
        file_path: dir.join("packages").join(format!("{}.yaml", pkg.manifest.package_name)),
        file_hash: sha256_hex(container),
        file_size: container.len() as u64,
        created_at: pkg.manifest.created_at,
        creator_fingerprint: pkg.manifest.creator_pub_key.fingerprint(),
        manifest_signature: pkg.manifest_signature.to_hex(),
        maintainer_fingerprint: pkg.manifest.maintainer_pub_key.fingerprint(),
        maintainer_manifest_signature: pkg.maintainer_manifest_signature.to_hex(),
        announced_to_dht: false,
        last_announced: None,
    }
}

#[test]
fn every_mutation_is_visible_after_reload() {
    let dir = tempfile::tempdir().unwrap();
    let (container_a, pkg_a) = signed_container_bytes("pkg-a", "1.0.0");
    let (container_b, pkg_b) = signed_container_bytes("pkg-b", "2.0.0");

    {
        let mgr = manager(dir.path());
        mgr.load_state().unwrap();
        mgr.add_package(info_for(dir.path(), &container_a, &pkg_a)).unwrap();
        mgr.add_package(info_for(dir.path(), &container_b, &pkg_b)).unwrap();
        mgr.update_announcement_status(&pkg_a.package_id, true).unwrap();
    }

    // A fresh manager (as after a crash) sees the committed state.
    let mgr = manager(dir.path());
    mgr.load_state().unwrap();
    assert_eq!(mgr.len(), 2);
    assert!(mgr.get_package(&pkg_a.package_id).unwrap().announced_to_dht);
    assert!(!mgr.get_package(&pkg_b.package_id).unwrap().announced_to_dht);

    mgr.remove_package(&pkg_b.package_id).unwrap();

    let mgr = manager(dir.path());
    mgr.load_state().unwrap();
    assert_eq!(mgr.len(), 1);
    assert!(mgr.package_exists(&pkg_a.package_id));
}

#[test]
fn no_temp_file_survives_a_save() {
    let dir = tempfile::tempdir().unwrap();
    let (container, pkg) = signed_container_bytes("pkg-tmp", "1.0.0");

    let mgr = manager(dir.path());
    mgr.add_package(info_for(dir.path(), &container, &pkg)).unwrap();

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
        .collect();
    assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
}

#[test]
fn stored_files_live_under_packages_dir_and_are_removed_with_the_entry() {
    let dir = tempfile::tempdir().unwrap();
    let (container, pkg) = signed_container_bytes("pkg-file", "1.0.0");

    let mgr = manager(dir.path());
    let path = mgr.store_package_file("pkg-file-1.0.0.yaml", &container).unwrap();
    assert!(path.is_file());

    let mut info = info_for(dir.path(), &container, &pkg);
    info.file_path = path.clone();
    mgr.add_package(info).unwrap();

    mgr.remove_package(&pkg.package_id).unwrap();
    assert!(!path.exists(), "container file must be deleted with the entry");
}

#[test]
fn duplicate_is_a_client_error_and_leaves_one_entry() {
    let dir = tempfile::tempdir().unwrap();
    let (container, pkg) = signed_container_bytes("pkg-dup", "1.0.0");

    let mgr = manager(dir.path());
    mgr.add_package(info_for(dir.path(), &container, &pkg)).unwrap();
    let err = mgr.add_package(info_for(dir.path(), &container, &pkg)).unwrap_err();
    assert!(matches!(err, RegistryError::DuplicatePackage(_)));

    let mgr = manager(dir.path());
    mgr.load_state().unwrap();
    assert_eq!(mgr.len(), 1);
}
