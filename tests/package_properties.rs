#![forbid(unsafe_code)]

//! Container format properties: identifier determinism and round-tripping
//! across arbitrary manifests.

mod common;

use common::{keypair, signed_package};
use libreseed::core::crypto::sign;
use libreseed::core::package::{
    info_hash_from_package_id, parse_package, ContentEntry, Manifest, Package,
};
use proptest::prelude::*;
use ring::signature::KeyPair;
use std::collections::BTreeMap;

fn name_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,30}"
}

fn version_strategy() -> impl Strategy<Value = String> {
    (0u32..100, 0u32..100, 0u32..100).prop_map(|(a, b, c)| format!("{a}.{b}.{c}"))
}

fn entries_strategy() -> impl Strategy<Value = Vec<ContentEntry>> {
    prop::collection::vec(
        ("[a-z/]{1,20}", prop::array::uniform32(any::<u8>()), 1u64..1_000_000, 0u32..0o1000),
        0..5,
    )
    .prop_map(|raw| {
        raw.into_iter()
            .map(|(path, hash, size, mode)| ContentEntry {
                path,
                hash: hex::encode(hash),
                size,
                mode,
            })
            .collect()
    })
}

fn build_package(name: &str, version: &str, description: String, entries: Vec<ContentEntry>) -> Package {
    let creator = keypair();
    let maintainer = keypair();
    let manifest = Manifest {
        package_name: name.to_string(),
        version: version.to_string(),
        description,
        content_hash: Manifest::compute_content_hash(&entries),
        content_list: entries,
        creator_pub_key: libreseed::core::crypto::PublicKey::new(
            creator.public_key().as_ref(),
        )
        .unwrap(),
        maintainer_pub_key: libreseed::core::crypto::PublicKey::new(
            maintainer.public_key().as_ref(),
        )
        .unwrap(),
        created_at: chrono::Utc::now(),
        extra: BTreeMap::new(),
    };
    let payload = manifest.canonical_bytes().unwrap();
    let mut pkg = Package {
        package_id: String::new(),
        format_version: "1.1".to_string(),
        manifest_signature: sign(&creator, &payload).unwrap(),
        maintainer_manifest_signature: sign(&maintainer, &payload).unwrap(),
        size_bytes: 1,
        manifest,
    };
    pkg.seal().unwrap();
    pkg
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn package_id_deterministic_and_round_trips(
        name in name_strategy(),
        version in version_strategy(),
        description in ".{0,64}",
        entries in entries_strategy(),
    ) {
        let pkg = build_package(&name, &version, description, entries);

        // Identifier is reproducible from the canonical bytes.
        prop_assert_eq!(&pkg.package_id, &pkg.compute_package_id().unwrap());

        // Serialize/parse preserves the package exactly.
        let bytes = pkg.to_bytes().unwrap();
        let parsed = parse_package(&bytes, true).unwrap();
        prop_assert_eq!(&parsed, &pkg);

        // Re-serializing the parsed package yields identical bytes.
        prop_assert_eq!(parsed.to_bytes().unwrap(), bytes);

        // The infohash is the first 20 bytes of the id.
        let ih = info_hash_from_package_id(&pkg.package_id).unwrap();
        prop_assert_eq!(hex::encode(ih), pkg.package_id[..40].to_string());
    }

    #[test]
    fn signatures_bind_the_manifest(
        name in name_strategy(),
        version in version_strategy(),
    ) {
        let pkg = build_package(&name, &version, String::new(), Vec::new());
        pkg.verify_signatures().unwrap();

        let mut tampered = pkg;
        tampered.manifest.version.push('0');
        tampered.seal().unwrap();
        prop_assert!(tampered.verify_signatures().is_err());
    }
}

#[test]
fn distinct_packages_get_distinct_ids() {
    let creator = keypair();
    let maintainer = keypair();
    let a = signed_package("pkg-a", "1.0.0", &creator, &maintainer);
    let b = signed_package("pkg-b", "1.0.0", &creator, &maintainer);
    assert_ne!(a.package_id, b.package_id);
}
