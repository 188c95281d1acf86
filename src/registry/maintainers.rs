// Copyright (c) 2026 LibreSeed
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! Registry of trusted co-signers and pending co-signature requests.
//!
//! Maintainers are keyed by fingerprint. Pending requests carry a TTL;
//! expired entries are excluded from listings and swept periodically.
//! State persists to `maintainers.yaml` at mode 0600.

use crate::core::crypto::{is_hex_of_len, PublicKey};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;
use thiserror::Error;
use tracing::debug;

/// Maintainer registry errors.
#[derive(Debug, Error)]
pub enum MaintainerError {
    /// A maintainer with this fingerprint is already registered.
    #[error("maintainer already registered: {0}")]
    MaintainerExists(String),
    /// No maintainer with this fingerprint.
    #[error("maintainer not found: {0}")]
    MaintainerNotFound(String),
    /// The maintainer is deactivated.
    #[error("maintainer inactive: {0}")]
    MaintainerInactive(String),
    /// The pending request exists but its TTL has elapsed.
    #[error("pending signature expired for {0}")]
    PendingExpired(String),
    /// No pending request for this package.
    #[error("no pending signature for {0}")]
    PendingNotFound(String),
    /// A field failed invariant validation.
    #[error("invalid maintainer record: {0}")]
    InvalidRecord(String),
    /// Registry file exists but cannot be parsed.
    #[error("corrupt maintainer registry: {0}")]
    Corrupt(String),
    /// Underlying filesystem failure; in-memory state was rolled back.
    #[error("registry io: {0}")]
    Io(#[from] std::io::Error),
}

/// One trusted co-signer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaintainerInfo {
    /// Key fingerprint, 16 hex chars.
    pub fingerprint: String,
    /// Display name; non-empty.
    pub name: String,
    /// Ed25519 public key, 64 hex chars.
    pub public_key: String,
    /// Contact address.
    #[serde(default)]
    pub email: Option<String>,
    /// Registration time.
    pub registered_at: DateTime<Utc>,
    /// Whether the maintainer may co-sign.
    pub active: bool,
    /// Number of packages co-signed so far.
    #[serde(default)]
    pub packages_signed: u64,
    /// Time of the most recent co-signature.
    #[serde(default)]
    pub last_signed_at: Option<DateTime<Utc>>,
}

/// A co-signature request awaiting a maintainer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingSignature {
    /// Package awaiting co-signature.
    pub package_id: String,
    /// Its name, for display.
    pub package_name: String,
    /// Its version, for display.
    pub package_version: String,
    /// Fingerprint of the creator requesting the co-signature.
    pub creator_fingerprint: String,
    /// SHA-256 hex of the canonical manifest bytes to be signed.
    pub manifest_hash: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry time; strictly after `created_at`.
    pub expires_at: DateTime<Utc>,
}

impl PendingSignature {
    /// True once the TTL has elapsed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryState {
    #[serde(default)]
    maintainers: BTreeMap<String, MaintainerInfo>,
    #[serde(default)]
    pending: BTreeMap<String, PendingSignature>,
}

/// Registry of maintainers with crash-safe persistence.
pub struct MaintainerRegistry {
    path: PathBuf,
    state: RwLock<RegistryState>,
}

impl MaintainerRegistry {
    /// Create a registry persisted at `path`.
    pub fn new(path: PathBuf) -> Self {
        Self { path, state: RwLock::new(RegistryState::default()) }
    }

    /// Read the registry from disk. A missing file yields an empty registry.
    pub fn load_state(&self) -> Result<(), MaintainerError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no maintainer registry yet");
                return Ok(());
            }
            Err(e) => return Err(MaintainerError::Io(e)),
        };
        let loaded: RegistryState =
            serde_yaml::from_str(&raw).map_err(|e| MaintainerError::Corrupt(e.to_string()))?;
        let mut guard = self.state.write().expect("maintainer lock poisoned");
        *guard = loaded;
        Ok(())
    }

    /// Persist the registry atomically (mode 0600).
    pub fn save_state(&self) -> Result<(), MaintainerError> {
        let raw = {
            let guard = self.state.read().expect("maintainer lock poisoned");
            serde_yaml::to_string(&*guard).map_err(|e| MaintainerError::Corrupt(e.to_string()))?
        };
        super::atomic_write(&self.path, raw.as_bytes(), 0o600)?;
        Ok(())
    }

    /// Register a new maintainer from a 64-hex public key. The fingerprint
    /// is derived from the key.
    pub fn register(
        &self,
        public_key_hex: &str,
        name: &str,
        email: Option<String>,
    ) -> Result<MaintainerInfo, MaintainerError> {
        if name.trim().is_empty() {
            return Err(MaintainerError::InvalidRecord("empty name".into()));
        }
        if !is_hex_of_len(public_key_hex, 64) {
            return Err(MaintainerError::InvalidRecord("public_key is not 64 hex chars".into()));
        }
        let key = PublicKey::from_hex(public_key_hex)
            .map_err(|_| MaintainerError::InvalidRecord("undecodable public key".into()))?;

        let info = MaintainerInfo {
            fingerprint: key.fingerprint(),
            name: name.trim().to_string(),
            public_key: public_key_hex.to_string(),
            email,
            registered_at: Utc::now(),
            active: true,
            packages_signed: 0,
            last_signed_at: None,
        };

        {
            let mut guard = self.state.write().expect("maintainer lock poisoned");
            if guard.maintainers.contains_key(&info.fingerprint) {
                return Err(MaintainerError::MaintainerExists(info.fingerprint.clone()));
            }
            guard.maintainers.insert(info.fingerprint.clone(), info.clone());
        }

        if let Err(e) = self.save_state() {
            let mut guard = self.state.write().expect("maintainer lock poisoned");
            guard.maintainers.remove(&info.fingerprint);
            return Err(e);
        }
        Ok(info)
    }

    /// Look up one maintainer.
    pub fn get(&self, fingerprint: &str) -> Result<MaintainerInfo, MaintainerError> {
        let guard = self.state.read().expect("maintainer lock poisoned");
        guard
            .maintainers
            .get(fingerprint)
            .cloned()
            .ok_or_else(|| MaintainerError::MaintainerNotFound(fingerprint.to_string()))
    }

    /// Snapshot of all maintainers.
    pub fn list(&self) -> Vec<MaintainerInfo> {
        let guard = self.state.read().expect("maintainer lock poisoned");
        guard.maintainers.values().cloned().collect()
    }

    /// Snapshot of active maintainers only.
    pub fn list_active(&self) -> Vec<MaintainerInfo> {
        let guard = self.state.read().expect("maintainer lock poisoned");
        guard.maintainers.values().filter(|m| m.active).cloned().collect()
    }

    fn set_active(&self, fingerprint: &str, active: bool) -> Result<(), MaintainerError> {
        let previous = {
            let mut guard = self.state.write().expect("maintainer lock poisoned");
            let info = guard
                .maintainers
                .get_mut(fingerprint)
                .ok_or_else(|| MaintainerError::MaintainerNotFound(fingerprint.to_string()))?;
            let previous = info.active;
            info.active = active;
            previous
        };

        if let Err(e) = self.save_state() {
            let mut guard = self.state.write().expect("maintainer lock poisoned");
            if let Some(info) = guard.maintainers.get_mut(fingerprint) {
                info.active = previous;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Allow a maintainer to co-sign again.
    pub fn activate(&self, fingerprint: &str) -> Result<(), MaintainerError> {
        self.set_active(fingerprint, true)
    }

    /// Bar a maintainer from co-signing.
    pub fn deactivate(&self, fingerprint: &str) -> Result<(), MaintainerError> {
        self.set_active(fingerprint, false)
    }

    /// Bump a maintainer's co-signature counter and stamp the time.
    pub fn increment_sign_count(&self, fingerprint: &str) -> Result<(), MaintainerError> {
        let previous = {
            let mut guard = self.state.write().expect("maintainer lock poisoned");
            let info = guard
                .maintainers
                .get_mut(fingerprint)
                .ok_or_else(|| MaintainerError::MaintainerNotFound(fingerprint.to_string()))?;
            let previous = (info.packages_signed, info.last_signed_at);
            info.packages_signed += 1;
            info.last_signed_at = Some(Utc::now());
            previous
        };

        if let Err(e) = self.save_state() {
            let mut guard = self.state.write().expect("maintainer lock poisoned");
            if let Some(info) = guard.maintainers.get_mut(fingerprint) {
                info.packages_signed = previous.0;
                info.last_signed_at = previous.1;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Record a co-signature request. A request for a package that already
    /// has one replaces it (newest wins).
    #[allow(clippy::too_many_arguments)]
    pub fn add_pending(
        &self,
        package_id: &str,
        package_name: &str,
        package_version: &str,
        creator_fingerprint: &str,
        manifest_hash: &str,
        ttl: std::time::Duration,
    ) -> Result<PendingSignature, MaintainerError> {
        if !is_hex_of_len(creator_fingerprint, 16) {
            return Err(MaintainerError::InvalidRecord(
                "creator_fingerprint is not 16 hex chars".into(),
            ));
        }
        let now = Utc::now();
        let ttl = ChronoDuration::from_std(ttl)
            .map_err(|_| MaintainerError::InvalidRecord("ttl out of range".into()))?;
        if ttl <= ChronoDuration::zero() {
            return Err(MaintainerError::InvalidRecord("ttl must be positive".into()));
        }
        let entry = PendingSignature {
            package_id: package_id.to_string(),
            package_name: package_name.to_string(),
            package_version: package_version.to_string(),
            creator_fingerprint: creator_fingerprint.to_string(),
            manifest_hash: manifest_hash.to_string(),
            created_at: now,
            expires_at: now + ttl,
        };

        let previous = {
            let mut guard = self.state.write().expect("maintainer lock poisoned");
            guard.pending.insert(package_id.to_string(), entry.clone())
        };

        if let Err(e) = self.save_state() {
            let mut guard = self.state.write().expect("maintainer lock poisoned");
            match previous {
                Some(old) => {
                    guard.pending.insert(package_id.to_string(), old);
                }
                None => {
                    guard.pending.remove(package_id);
                }
            }
            return Err(e);
        }
        Ok(entry)
    }

    /// Look up the pending request for a package.
    pub fn get_pending(&self, package_id: &str) -> Result<PendingSignature, MaintainerError> {
        let guard = self.state.read().expect("maintainer lock poisoned");
        let entry = guard
            .pending
            .get(package_id)
            .ok_or_else(|| MaintainerError::PendingNotFound(package_id.to_string()))?;
        if entry.is_expired(Utc::now()) {
            return Err(MaintainerError::PendingExpired(package_id.to_string()));
        }
        Ok(entry.clone())
    }

    /// Snapshot of pending requests, excluding expired entries.
    pub fn list_pending(&self) -> Vec<PendingSignature> {
        let now = Utc::now();
        let guard = self.state.read().expect("maintainer lock poisoned");
        guard.pending.values().filter(|p| !p.is_expired(now)).cloned().collect()
    }

    /// Drop the pending request for a package.
    pub fn remove_pending(&self, package_id: &str) -> Result<(), MaintainerError> {
        let removed = {
            let mut guard = self.state.write().expect("maintainer lock poisoned");
            guard
                .pending
                .remove(package_id)
                .ok_or_else(|| MaintainerError::PendingNotFound(package_id.to_string()))?
        };

        if let Err(e) = self.save_state() {
            let mut guard = self.state.write().expect("maintainer lock poisoned");
            guard.pending.insert(package_id.to_string(), removed);
            return Err(e);
        }
        Ok(())
    }

    /// Sweep expired pending requests; returns how many were dropped.
    pub fn cleanup_expired(&self) -> Result<usize, MaintainerError> {
        let now = Utc::now();
        let dropped = {
            let mut guard = self.state.write().expect("maintainer lock poisoned");
            let before = guard.pending.len();
            guard.pending.retain(|_, p| !p.is_expired(now));
            before - guard.pending.len()
        };
        if dropped > 0 {
            self.save_state()?;
        }
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring::rand::SystemRandom;
    use ring::signature::{Ed25519KeyPair, KeyPair};
    use std::time::Duration;

    fn pubkey_hex() -> String {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let kp = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap();
        hex::encode(kp.public_key().as_ref())
    }

    fn registry(dir: &std::path::Path) -> MaintainerRegistry {
        MaintainerRegistry::new(dir.join("maintainers.yaml"))
    }

    #[test]
    fn register_derives_fingerprint_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let key = pubkey_hex();
        let info = reg.register(&key, "alice", Some("alice@example.org".into())).unwrap();
        assert_eq!(info.fingerprint.len(), 16);
        assert!(info.active);

        let fresh = registry(dir.path());
        fresh.load_state().unwrap();
        assert_eq!(fresh.get(&info.fingerprint).unwrap().name, "alice");
    }

    #[test]
    fn duplicate_registration_fails() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let key = pubkey_hex();
        reg.register(&key, "alice", None).unwrap();
        assert!(matches!(
            reg.register(&key, "alice again", None).unwrap_err(),
            MaintainerError::MaintainerExists(_)
        ));
    }

    #[test]
    fn activation_toggles() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let info = reg.register(&pubkey_hex(), "bob", None).unwrap();

        reg.deactivate(&info.fingerprint).unwrap();
        assert!(!reg.get(&info.fingerprint).unwrap().active);
        assert!(reg.list_active().is_empty());

        reg.activate(&info.fingerprint).unwrap();
        assert!(reg.get(&info.fingerprint).unwrap().active);
    }

    #[test]
    fn pending_expiry_honored() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let id = hex::encode([7u8; 32]);
        reg.add_pending(&id, "pkg", "1.0.0", "0123456789abcdef", &hex::encode([9u8; 32]), Duration::from_millis(10))
            .unwrap();

        std::thread::sleep(Duration::from_millis(30));
        assert!(matches!(reg.get_pending(&id).unwrap_err(), MaintainerError::PendingExpired(_)));
        assert!(reg.list_pending().is_empty());

        assert_eq!(reg.cleanup_expired().unwrap(), 1);
        assert!(matches!(reg.get_pending(&id).unwrap_err(), MaintainerError::PendingNotFound(_)));
    }

    #[test]
    fn newest_pending_wins() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let id = hex::encode([8u8; 32]);
        reg.add_pending(&id, "pkg", "1.0.0", "0123456789abcdef", &hex::encode([1u8; 32]), Duration::from_secs(60))
            .unwrap();
        reg.add_pending(&id, "pkg", "1.0.1", "0123456789abcdef", &hex::encode([2u8; 32]), Duration::from_secs(60))
            .unwrap();

        let got = reg.get_pending(&id).unwrap();
        assert_eq!(got.package_version, "1.0.1");
        assert_eq!(reg.list_pending().len(), 1);
    }

    #[test]
    fn sign_count_increments() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let info = reg.register(&pubkey_hex(), "carol", None).unwrap();
        reg.increment_sign_count(&info.fingerprint).unwrap();
        reg.increment_sign_count(&info.fingerprint).unwrap();
        let got = reg.get(&info.fingerprint).unwrap();
        assert_eq!(got.packages_signed, 2);
        assert!(got.last_signed_at.is_some());
    }
}
