#![forbid(unsafe_code)]
#![allow(dead_code)]

//! Shared test fixtures: signed container builders and a scripted DHT.

use async_trait::async_trait;
use chrono::Utc;
use libreseed::core::crypto::{sign, PublicKey};
use libreseed::core::package::{ContentEntry, Manifest, Package};
use libreseed::networking::dht::{DhtError, DhtService, DhtStats};
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};
use std::collections::{BTreeMap, HashMap};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Generate a fresh Ed25519 keypair.
pub fn keypair() -> Ed25519KeyPair {
    let rng = SystemRandom::new();
    let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).expect("generate keypair");
    Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).expect("parse keypair")
}

/// Build a sealed, dual-signed package container.
pub fn signed_package(
    name: &str,
    version: &str,
    creator: &Ed25519KeyPair,
    maintainer: &Ed25519KeyPair,
) -> Package {
    let entries = vec![ContentEntry {
        path: format!("bin/{name}"),
        hash: libreseed::core::crypto::sha256_hex(name.as_bytes()),
        size: name.len() as u64,
        mode: 0o755,
    }];
    let manifest = Manifest {
        package_name: name.to_string(),
        version: version.to_string(),
        description: format!("{name} test package"),
        content_hash: Manifest::compute_content_hash(&entries),
        content_list: entries,
        creator_pub_key: PublicKey::new(creator.public_key().as_ref()).expect("creator key"),
        maintainer_pub_key: PublicKey::new(maintainer.public_key().as_ref())
            .expect("maintainer key"),
        created_at: Utc::now(),
        extra: BTreeMap::new(),
    };
    let payload = manifest.canonical_bytes().expect("manifest bytes");
    let mut pkg = Package {
        package_id: String::new(),
        format_version: "1.0".to_string(),
        manifest_signature: sign(creator, &payload).expect("creator sign"),
        maintainer_manifest_signature: sign(maintainer, &payload).expect("maintainer sign"),
        size_bytes: 64,
        manifest,
    };
    pkg.seal().expect("seal");
    pkg
}

/// Serialized container bytes for a fresh dual-signed package.
pub fn signed_container_bytes(name: &str, version: &str) -> (Vec<u8>, Package) {
    let creator = keypair();
    let maintainer = keypair();
    let pkg = signed_package(name, version, &creator, &maintainer);
    (pkg.to_bytes().expect("container bytes"), pkg)
}

/// A DHT backend that records calls and replies from a script.
#[derive(Default)]
pub struct ScriptedDht {
    /// Every `(info_hash, port)` announce observed, in order.
    pub announces: Mutex<Vec<([u8; 20], u16)>>,
    /// Peers returned per infohash from `get_peers`.
    pub peers_script: Mutex<HashMap<[u8; 20], Vec<SocketAddrV4>>>,
    /// When set, `announce` fails with a timeout.
    pub fail_announces: AtomicBool,
    /// Number of `get_peers` calls.
    pub lookups: AtomicU64,
}

impl ScriptedDht {
    /// Empty scripted backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script `get_peers(info_hash)` to return `peers`.
    pub fn script_peers(&self, info_hash: [u8; 20], peers: Vec<SocketAddrV4>) {
        self.peers_script.lock().unwrap().insert(info_hash, peers);
    }

    /// Announced infohashes observed so far.
    pub fn announced(&self) -> Vec<([u8; 20], u16)> {
        self.announces.lock().unwrap().clone()
    }
}

#[async_trait]
impl DhtService for ScriptedDht {
    async fn announce(&self, info_hash: [u8; 20], local_port: u16) -> Result<usize, DhtError> {
        if self.fail_announces.load(Ordering::SeqCst) {
            return Err(DhtError::Timeout);
        }
        self.announces.lock().unwrap().push((info_hash, local_port));
        Ok(3)
    }

    async fn get_peers(
        &self,
        info_hash: [u8; 20],
        _timeout: Duration,
    ) -> Result<Vec<SocketAddrV4>, DhtError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.peers_script.lock().unwrap().get(&info_hash).cloned().unwrap_or_default())
    }

    async fn ping(&self, _addr: SocketAddr) -> Result<(), DhtError> {
        Ok(())
    }

    fn stats(&self) -> DhtStats {
        DhtStats {
            nodes: 5,
            good_nodes: 5,
            queries_sent: self.lookups.load(Ordering::SeqCst),
            ..Default::default()
        }
    }
}

/// Wait until `predicate` holds or `deadline` elapses.
pub async fn wait_for(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}
