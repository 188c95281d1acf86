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

//! Authoritative catalog of installed packages.
//!
//! The catalog file (`packages.yaml`) and the container files under
//! `packages/` are owned exclusively by this manager; no other component
//! may write to or delete them. A crash leaves either the previous valid
//! catalog or the new one on disk, never a truncated file.

use crate::core::crypto::is_hex_of_len;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

/// Package registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Catalog file exists but cannot be parsed. Fatal at load time.
    #[error("corrupt package catalog: {0}")]
    Corrupt(String),
    /// Underlying filesystem failure; in-memory state was rolled back.
    #[error("registry io: {0}")]
    Io(#[from] std::io::Error),
    /// A package with this id is already registered.
    #[error("duplicate package {0}")]
    DuplicatePackage(String),
    /// No package with this id.
    #[error("package not found: {0}")]
    PackageNotFound(String),
    /// A record failed invariant validation.
    #[error("invalid package record: {0}")]
    InvalidRecord(String),
}

/// One catalog record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PackageInfo {
    /// Content-addressed identifier, 64 hex chars.
    pub package_id: String,
    /// Package name.
    pub name: String,
    /// Package version.
    pub version: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Absolute path of the stored container file.
    pub file_path: PathBuf,
    /// SHA-256 of the container file, 64 hex chars.
    pub file_hash: String,
    /// Container file size; always positive.
    pub file_size: u64,
    /// Manifest creation time.
    pub created_at: DateTime<Utc>,
    /// Creator key fingerprint, 16 hex chars.
    pub creator_fingerprint: String,
    /// Creator signature, hex.
    pub manifest_signature: String,
    /// Maintainer key fingerprint, 16 hex chars.
    pub maintainer_fingerprint: String,
    /// Maintainer signature, hex; empty while a co-signature is pending.
    #[serde(default)]
    pub maintainer_manifest_signature: String,
    /// Whether the package has been announced on the DHT.
    #[serde(default)]
    pub announced_to_dht: bool,
    /// Time of the most recent successful announce.
    #[serde(default)]
    pub last_announced: Option<DateTime<Utc>>,
}

impl PackageInfo {
    fn validate(&self) -> Result<(), RegistryError> {
        if !is_hex_of_len(&self.package_id, 64) {
            return Err(RegistryError::InvalidRecord("package_id is not 64 hex chars".into()));
        }
        if self.name.is_empty() || self.version.is_empty() {
            return Err(RegistryError::InvalidRecord("empty name or version".into()));
        }
        if !self.file_path.is_absolute() {
            return Err(RegistryError::InvalidRecord("file_path is not absolute".into()));
        }
        if !is_hex_of_len(&self.file_hash, 64) {
            return Err(RegistryError::InvalidRecord("file_hash is not 64 hex chars".into()));
        }
        if self.file_size == 0 {
            return Err(RegistryError::InvalidRecord("file_size is zero".into()));
        }
        if !is_hex_of_len(&self.creator_fingerprint, 16) {
            return Err(RegistryError::InvalidRecord(
                "creator_fingerprint is not 16 hex chars".into(),
            ));
        }
        if !is_hex_of_len(&self.maintainer_fingerprint, 16) {
            return Err(RegistryError::InvalidRecord(
                "maintainer_fingerprint is not 16 hex chars".into(),
            ));
        }
        Ok(())
    }
}

/// Catalog of installed packages with crash-safe persistence.
pub struct PackageManager {
    catalog_path: PathBuf,
    packages_dir: PathBuf,
    packages: RwLock<BTreeMap<String, PackageInfo>>,
}

impl PackageManager {
    /// Create a manager over `catalog_path` and the `packages/` directory.
    /// Call [`PackageManager::load_state`] before first use.
    pub fn new(catalog_path: PathBuf, packages_dir: PathBuf) -> Self {
        Self { catalog_path, packages_dir, packages: RwLock::new(BTreeMap::new()) }
    }

    /// Directory holding the stored container files.
    pub fn packages_dir(&self) -> &Path {
        &self.packages_dir
    }

    /// Read the catalog from disk. A missing file yields an empty catalog;
    /// a parse error is fatal.
    pub fn load_state(&self) -> Result<(), RegistryError> {
        let raw = match std::fs::read_to_string(&self.catalog_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.catalog_path.display(), "no package catalog yet");
                return Ok(());
            }
            Err(e) => return Err(RegistryError::Io(e)),
        };
        let records: Vec<PackageInfo> =
            serde_yaml::from_str(&raw).map_err(|e| RegistryError::Corrupt(e.to_string()))?;

        let mut map = BTreeMap::new();
        for info in records {
            map.insert(info.package_id.clone(), info);
        }
        let mut guard = self.packages.write().expect("package lock poisoned");
        *guard = map;
        Ok(())
    }

    /// Persist the catalog atomically (mode 0644).
    pub fn save_state(&self) -> Result<(), RegistryError> {
        let records: Vec<PackageInfo> = {
            let guard = self.packages.read().expect("package lock poisoned");
            guard.values().cloned().collect()
        };
        let raw = serde_yaml::to_string(&records)
            .map_err(|e| RegistryError::Corrupt(e.to_string()))?;
        super::atomic_write(&self.catalog_path, raw.as_bytes(), 0o644)?;
        Ok(())
    }

    /// Store a container file under `packages/`, returning its absolute path.
    /// The original filename is preserved after path-component sanitization.
    pub fn store_package_file(
        &self,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, RegistryError> {
        std::fs::create_dir_all(&self.packages_dir)?;

        let name = Path::new(file_name)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty() && *n != "." && *n != "..")
            .ok_or_else(|| RegistryError::InvalidRecord("unusable file name".into()))?;

        let path = self.packages_dir.join(name);
        super::atomic_write(&path, bytes, 0o644)?;
        path.canonicalize().map_err(RegistryError::Io)
    }

    /// Delete a stored container file. Used to undo a failed ingest.
    pub fn delete_stored_file(&self, path: &Path) -> Result<(), RegistryError> {
        let dir =
            self.packages_dir.canonicalize().unwrap_or_else(|_| self.packages_dir.clone());
        if path.starts_with(&dir) {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Insert a validated record and persist. Rolls the insert back if the
    /// catalog cannot be written.
    pub fn add_package(&self, info: PackageInfo) -> Result<(), RegistryError> {
        info.validate()?;
        let id = info.package_id.clone();
        {
            let mut guard = self.packages.write().expect("package lock poisoned");
            if guard.contains_key(&id) {
                return Err(RegistryError::DuplicatePackage(id));
            }
            guard.insert(id.clone(), info);
        }

        if let Err(e) = self.save_state() {
            let mut guard = self.packages.write().expect("package lock poisoned");
            guard.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    /// Remove a record and its on-disk file, then persist. A file that is
    /// already gone is logged, not an error.
    pub fn remove_package(&self, package_id: &str) -> Result<PackageInfo, RegistryError> {
        let removed = {
            let mut guard = self.packages.write().expect("package lock poisoned");
            guard
                .remove(package_id)
                .ok_or_else(|| RegistryError::PackageNotFound(package_id.to_string()))?
        };

        match std::fs::remove_file(&removed.file_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %removed.file_path.display(), "package file already gone");
            }
            Err(e) => {
                warn!(path = %removed.file_path.display(), err = %e, "package file removal failed");
            }
        }

        if let Err(e) = self.save_state() {
            warn!(package_id, "catalog persist failed after removal; restoring entry");
            let mut guard = self.packages.write().expect("package lock poisoned");
            guard.insert(removed.package_id.clone(), removed);
            return Err(e);
        }
        Ok(removed)
    }

    /// Look up one record.
    pub fn get_package(&self, package_id: &str) -> Option<PackageInfo> {
        let guard = self.packages.read().expect("package lock poisoned");
        guard.get(package_id).cloned()
    }

    /// Snapshot of all records.
    pub fn list_packages(&self) -> Vec<PackageInfo> {
        let guard = self.packages.read().expect("package lock poisoned");
        guard.values().cloned().collect()
    }

    /// True if a record with this id exists.
    pub fn package_exists(&self, package_id: &str) -> bool {
        let guard = self.packages.read().expect("package lock poisoned");
        guard.contains_key(package_id)
    }

    /// Number of registered packages.
    pub fn len(&self) -> usize {
        let guard = self.packages.read().expect("package lock poisoned");
        guard.len()
    }

    /// True if the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record an announcement-status change and persist.
    pub fn update_announcement_status(
        &self,
        package_id: &str,
        announced: bool,
    ) -> Result<(), RegistryError> {
        let previous = {
            let mut guard = self.packages.write().expect("package lock poisoned");
            let info = guard
                .get_mut(package_id)
                .ok_or_else(|| RegistryError::PackageNotFound(package_id.to_string()))?;
            let previous = (info.announced_to_dht, info.last_announced);
            info.announced_to_dht = announced;
            if announced {
                info.last_announced = Some(Utc::now());
            }
            previous
        };

        if let Err(e) = self.save_state() {
            let mut guard = self.packages.write().expect("package lock poisoned");
            if let Some(info) = guard.get_mut(package_id) {
                info.announced_to_dht = previous.0;
                info.last_announced = previous.1;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Record a maintainer co-signature on an existing package and persist.
    pub fn update_maintainer_signature(
        &self,
        package_id: &str,
        maintainer_fingerprint: &str,
        signature_hex: &str,
    ) -> Result<(), RegistryError> {
        if !is_hex_of_len(maintainer_fingerprint, 16) {
            return Err(RegistryError::InvalidRecord(
                "maintainer_fingerprint is not 16 hex chars".into(),
            ));
        }
        let previous = {
            let mut guard = self.packages.write().expect("package lock poisoned");
            let info = guard
                .get_mut(package_id)
                .ok_or_else(|| RegistryError::PackageNotFound(package_id.to_string()))?;
            let previous =
                (info.maintainer_fingerprint.clone(), info.maintainer_manifest_signature.clone());
            info.maintainer_fingerprint = maintainer_fingerprint.to_string();
            info.maintainer_manifest_signature = signature_hex.to_string();
            previous
        };

        if let Err(e) = self.save_state() {
            let mut guard = self.packages.write().expect("package lock poisoned");
            if let Some(info) = guard.get_mut(package_id) {
                info.maintainer_fingerprint = previous.0;
                info.maintainer_manifest_signature = previous.1;
            }
            return Err(e);
        }
        Ok(())
    }
}
