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

//! Signed package container: canonical YAML encoding, parsing and the
//! content-addressed package identifier.
//!
//! ## Canonical form
//! The container is YAML with keys emitted in struct-declaration order;
//! timestamps are RFC3339 UTC; signatures ride inline next to the manifest
//! so a consumer can verify without a side channel. `package_id` is the
//! lowercase hex SHA-256 of the canonical serialization with the
//! `package_id` field emptied.
//!
//! Unknown fields inside the manifest are preserved across re-serialization.
//! Unknown top-level fields are rejected only in strict mode. Duplicate
//! keys always fail to parse.

use crate::core::crypto::{self, is_hex_of_len, CryptoError, PublicKey, SignatureRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// Length of a DHT infohash in bytes.
pub const INFO_HASH_LEN: usize = 20;
/// Container format versions this implementation understands.
pub const SUPPORTED_FORMAT_VERSIONS: [&str; 2] = ["1.0", "1.1"];

const TOP_LEVEL_FIELDS: [&str; 6] = [
    "package_id",
    "format_version",
    "manifest",
    "manifest_signature",
    "maintainer_manifest_signature",
    "size_bytes",
];

/// Package format errors.
#[derive(Debug, Error)]
pub enum PackageError {
    /// Container failed structural validation.
    #[error("malformed package: {0}")]
    Malformed(String),
    /// Serialization of the canonical form failed.
    #[error("package encoding failed")]
    Encode,
    /// `package_id` does not match the canonical content hash.
    #[error("package id mismatch")]
    IdMismatch,
    /// `package_id` is not valid hex or is too short for an infohash.
    #[error("invalid package id")]
    InvalidId,
}

/// One file inside a package, as listed by the manifest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContentEntry {
    /// Path relative to the package root.
    pub path: String,
    /// SHA-256 of the file contents, lowercase hex.
    pub hash: String,
    /// File size in bytes.
    pub size: u64,
    /// Unix permission bits.
    pub mode: u32,
}

/// The authoritative metadata of a package. Its canonical bytes are the
/// payload both the creator and the maintainer sign.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Package name; non-empty.
    pub package_name: String,
    /// Package version; non-empty.
    pub version: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// SHA-256 over the concatenation of entry hashes in `content_list` order.
    pub content_hash: String,
    /// Ordered file listing.
    #[serde(default)]
    pub content_list: Vec<ContentEntry>,
    /// Key of the package creator.
    pub creator_pub_key: PublicKey,
    /// Key of the co-signing maintainer (may equal the creator's).
    pub maintainer_pub_key: PublicKey,
    /// Manifest creation time.
    pub created_at: DateTime<Utc>,
    /// Fields from newer format revisions, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl Manifest {
    /// Canonical encoding of the manifest alone. This is the signing payload.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, PackageError> {
        serde_yaml::to_string(self)
            .map(String::into_bytes)
            .map_err(|_| PackageError::Encode)
    }

    /// SHA-256 hex of the canonical manifest bytes.
    pub fn hash(&self) -> Result<String, PackageError> {
        Ok(crypto::sha256_hex(&self.canonical_bytes()?))
    }

    /// Compute the content hash over an ordered entry list.
    pub fn compute_content_hash(entries: &[ContentEntry]) -> String {
        let mut concat = Vec::with_capacity(entries.len() * 64);
        for e in entries {
            concat.extend_from_slice(e.hash.as_bytes());
        }
        crypto::sha256_hex(&concat)
    }

    fn validate(&self) -> Result<(), PackageError> {
        if self.package_name.is_empty() {
            return Err(PackageError::Malformed("empty package_name".into()));
        }
        if self.version.is_empty() {
            return Err(PackageError::Malformed("empty version".into()));
        }
        if !is_hex_of_len(&self.content_hash, 64) {
            return Err(PackageError::Malformed("content_hash is not 64 hex chars".into()));
        }
        for e in &self.content_list {
            if !is_hex_of_len(&e.hash, 64) {
                return Err(PackageError::Malformed(format!(
                    "content entry {} has a malformed hash",
                    e.path
                )));
            }
        }
        Ok(())
    }
}

/// The on-disk container: manifest plus both inline signatures.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Package {
    /// Content-addressed identifier (64 hex chars); empty while unsealed.
    #[serde(default)]
    pub package_id: String,
    /// Container format revision.
    pub format_version: String,
    /// Authoritative metadata.
    pub manifest: Manifest,
    /// Creator signature over the canonical manifest bytes.
    pub manifest_signature: SignatureRecord,
    /// Maintainer signature over the same canonical manifest bytes.
    pub maintainer_manifest_signature: SignatureRecord,
    /// Total content size in bytes.
    pub size_bytes: u64,
}

impl Package {
    /// Canonical encoding of the full container.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PackageError> {
        serde_yaml::to_string(self)
            .map(String::into_bytes)
            .map_err(|_| PackageError::Encode)
    }

    /// Compute the package identifier: SHA-256 hex of the canonical
    /// serialization with `package_id` emptied.
    pub fn compute_package_id(&self) -> Result<String, PackageError> {
        let mut unsealed = self.clone();
        unsealed.package_id = String::new();
        Ok(crypto::sha256_hex(&unsealed.to_bytes()?))
    }

    /// Fill in `package_id` from the canonical content.
    pub fn seal(&mut self) -> Result<(), PackageError> {
        self.package_id = self.compute_package_id()?;
        Ok(())
    }

    /// Verify both inline signatures over the canonical manifest bytes.
    pub fn verify_signatures(&self) -> Result<(), CryptoError> {
        let manifest_bytes = self
            .manifest
            .canonical_bytes()
            .map_err(|_| CryptoError::SignatureInvalid)?;
        crypto::verify_dual(
            &manifest_bytes,
            &self.manifest.creator_pub_key,
            &self.manifest_signature,
            &self.manifest.maintainer_pub_key,
            &self.maintainer_manifest_signature,
        )
    }

    /// DHT infohash: the first 20 bytes of the hex-decoded `package_id`.
    pub fn info_hash(&self) -> Result<[u8; INFO_HASH_LEN], PackageError> {
        info_hash_from_package_id(&self.package_id)
    }

    fn validate(&self) -> Result<(), PackageError> {
        if !SUPPORTED_FORMAT_VERSIONS.contains(&self.format_version.as_str()) {
            return Err(PackageError::Malformed(format!(
                "unknown format_version {:?}",
                self.format_version
            )));
        }
        if !self.package_id.is_empty() && !is_hex_of_len(&self.package_id, 64) {
            return Err(PackageError::Malformed("package_id is not 64 hex chars".into()));
        }
        self.manifest.validate()
    }
}

/// Marker deserialized purely to walk a document and fail on any mapping
/// that repeats a key. YAML parsers otherwise keep the last occurrence of
/// a repeated key without reporting it.
struct UniqueKeys;

impl<'de> serde::Deserialize<'de> for UniqueKeys {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_any(UniqueKeysVisitor)
    }
}

struct UniqueKeysVisitor;

impl<'de> serde::de::Visitor<'de> for UniqueKeysVisitor {
    type Value = UniqueKeys;

    fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("a yaml document without repeated mapping keys")
    }

    fn visit_bool<E: serde::de::Error>(self, _: bool) -> Result<UniqueKeys, E> {
        Ok(UniqueKeys)
    }

    fn visit_i64<E: serde::de::Error>(self, _: i64) -> Result<UniqueKeys, E> {
        Ok(UniqueKeys)
    }

    fn visit_u64<E: serde::de::Error>(self, _: u64) -> Result<UniqueKeys, E> {
        Ok(UniqueKeys)
    }

    fn visit_f64<E: serde::de::Error>(self, _: f64) -> Result<UniqueKeys, E> {
        Ok(UniqueKeys)
    }

    fn visit_str<E: serde::de::Error>(self, _: &str) -> Result<UniqueKeys, E> {
        Ok(UniqueKeys)
    }

    fn visit_unit<E: serde::de::Error>(self) -> Result<UniqueKeys, E> {
        Ok(UniqueKeys)
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<UniqueKeys, A::Error>
    where
        A: serde::de::SeqAccess<'de>,
    {
        while seq.next_element::<UniqueKeys>()?.is_some() {}
        Ok(UniqueKeys)
    }

    fn visit_map<A>(self, mut map: A) -> Result<UniqueKeys, A::Error>
    where
        A: serde::de::MapAccess<'de>,
    {
        let mut seen: HashSet<serde_yaml::Value> = HashSet::new();
        while let Some(key) = map.next_key::<serde_yaml::Value>()? {
            if !seen.insert(key) {
                return Err(serde::de::Error::custom("duplicate mapping key"));
            }
            map.next_value::<UniqueKeys>()?;
        }
        Ok(UniqueKeys)
    }
}

fn reject_duplicate_keys(bytes: &[u8]) -> Result<(), PackageError> {
    serde_yaml::from_slice::<UniqueKeys>(bytes)
        .map(|_| ())
        .map_err(|e| PackageError::Malformed(e.to_string()))
}

/// Parse a container from its serialized bytes.
///
/// Structural shape, field lengths and `format_version` are checked here;
/// signatures are not. A non-empty `package_id` must match the recomputed
/// canonical hash. With `strict`, unknown top-level keys are rejected.
/// Duplicate keys fail at any nesting depth.
pub fn parse_package(bytes: &[u8], strict: bool) -> Result<Package, PackageError> {
    reject_duplicate_keys(bytes)?;
    let value: serde_yaml::Value =
        serde_yaml::from_slice(bytes).map_err(|e| PackageError::Malformed(e.to_string()))?;

    if strict {
        let mapping = value
            .as_mapping()
            .ok_or_else(|| PackageError::Malformed("container is not a mapping".into()))?;
        for key in mapping.keys() {
            let k = key
                .as_str()
                .ok_or_else(|| PackageError::Malformed("non-string top-level key".into()))?;
            if !TOP_LEVEL_FIELDS.contains(&k) {
                return Err(PackageError::Malformed(format!("unknown top-level field {k:?}")));
            }
        }
    }

    let pkg: Package =
        serde_yaml::from_value(value).map_err(|e| PackageError::Malformed(e.to_string()))?;
    pkg.validate()?;

    if !pkg.package_id.is_empty() && pkg.package_id != pkg.compute_package_id()? {
        return Err(PackageError::IdMismatch);
    }
    Ok(pkg)
}

/// Derive a DHT infohash from a package identifier.
pub fn info_hash_from_package_id(package_id: &str) -> Result<[u8; INFO_HASH_LEN], PackageError> {
    let raw = hex::decode(package_id).map_err(|_| PackageError::InvalidId)?;
    if raw.len() < INFO_HASH_LEN {
        return Err(PackageError::InvalidId);
    }
    let mut out = [0u8; INFO_HASH_LEN];
    out.copy_from_slice(&raw[..INFO_HASH_LEN]);
    Ok(out)
}
