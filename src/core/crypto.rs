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

//! Ed25519 keys, fingerprints and the dual-signature trust model.
//!
//! A package carries two detached signatures over the same canonical
//! manifest bytes: one by the creator and one by a maintainer. Both are
//! plain Ed25519; keys are identified by a 16-hex fingerprint derived
//! from SHA-256 of the raw public key bytes.

use chrono::{DateTime, Utc};
use ring::signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raw Ed25519 public key length.
pub const PUBLIC_KEY_LEN: usize = 32;
/// Raw Ed25519 signature length.
pub const SIGNATURE_LEN: usize = 64;
/// Fingerprint length in hex characters.
pub const FINGERPRINT_LEN: usize = 16;

/// Crypto errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Public key bytes are not a valid Ed25519 key encoding.
    #[error("invalid public key")]
    InvalidKey,
    /// Signature bytes are not 64 bytes of valid hex.
    #[error("invalid signature encoding")]
    InvalidSignature,
    /// Signature did not verify over the supplied message.
    #[error("signature verification failed")]
    SignatureInvalid,
    /// The creator signature of a dual-signed payload failed.
    #[error("creator signature verification failed")]
    InvalidCreatorSignature,
    /// The maintainer signature of a dual-signed payload failed.
    #[error("maintainer signature verification failed")]
    InvalidMaintainerSignature,
}

/// SHA-256 of `bytes` as lowercase hex (64 chars).
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, bytes);
    hex::encode(digest.as_ref())
}

/// SHA-256 of `bytes` as raw 32 bytes.
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let digest = ring::digest::digest(&ring::digest::SHA256, bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_ref());
    out
}

mod hex_key {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let raw = hex::decode(s.trim()).map_err(serde::de::Error::custom)?;
        if raw.len() != 32 {
            return Err(serde::de::Error::custom("expected 32 bytes of hex"));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&raw);
        Ok(out)
    }
}

mod hex_sig {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        let raw = hex::decode(s.trim()).map_err(serde::de::Error::custom)?;
        if raw.len() != super::SIGNATURE_LEN {
            return Err(serde::de::Error::custom("expected 64 bytes of hex"));
        }
        Ok(raw)
    }
}

/// An Ed25519 public key as carried inside manifests and registries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    /// Always `"ed25519"`.
    pub algorithm: String,
    #[serde(with = "hex_key")]
    key_bytes: [u8; 32],
}

impl PublicKey {
    /// Construct from raw key bytes; fails unless exactly 32 bytes.
    pub fn new(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != PUBLIC_KEY_LEN {
            return Err(CryptoError::InvalidKey);
        }
        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { algorithm: "ed25519".to_string(), key_bytes })
    }

    /// Construct from 64 hex characters.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let raw = hex::decode(s.trim()).map_err(|_| CryptoError::InvalidKey)?;
        Self::new(&raw)
    }

    /// Raw key bytes.
    pub fn key_bytes(&self) -> &[u8; 32] {
        &self.key_bytes
    }

    /// Lowercase hex of the raw key bytes (64 chars).
    pub fn to_hex(&self) -> String {
        hex::encode(self.key_bytes)
    }

    /// Fingerprint: lowercase hex of the first 8 bytes of SHA-256(key_bytes).
    pub fn fingerprint(&self) -> String {
        let digest = sha256(&self.key_bytes);
        hex::encode(&digest[..8])
    }
}

/// A recorded signature: who signed, the raw signature, and when.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignatureRecord {
    /// Always `"ed25519"`.
    pub algorithm: String,
    /// Key the signature claims to be from.
    pub signed_by: PublicKey,
    #[serde(with = "hex_sig")]
    signed_data: Vec<u8>,
    /// Wall-clock time recorded at signing.
    pub signed_at: DateTime<Utc>,
}

impl SignatureRecord {
    /// Construct from an existing 64-byte signature.
    pub fn new(
        signed_by: PublicKey,
        signed_data: Vec<u8>,
        signed_at: DateTime<Utc>,
    ) -> Result<Self, CryptoError> {
        if signed_data.len() != SIGNATURE_LEN {
            return Err(CryptoError::InvalidSignature);
        }
        Ok(Self { algorithm: "ed25519".to_string(), signed_by, signed_data, signed_at })
    }

    /// Raw signature bytes (64).
    pub fn signature_bytes(&self) -> &[u8] {
        &self.signed_data
    }

    /// Lowercase hex of the raw signature (128 chars).
    pub fn to_hex(&self) -> String {
        hex::encode(&self.signed_data)
    }
}

/// Sign `message` with `keypair`, recording the signer and the current time.
pub fn sign(keypair: &Ed25519KeyPair, message: &[u8]) -> Result<SignatureRecord, CryptoError> {
    let public = PublicKey::new(keypair.public_key().as_ref())?;
    let sig = keypair.sign(message);
    SignatureRecord::new(public, sig.as_ref().to_vec(), Utc::now())
}

/// Verify `sig` over `message` against the key recorded in `signed_by`.
pub fn verify(sig: &SignatureRecord, message: &[u8]) -> Result<(), CryptoError> {
    verify_raw(sig.signed_by.key_bytes(), message, &sig.signed_data)
}

/// Verify a raw 64-byte Ed25519 signature against raw 32-byte key bytes.
pub fn verify_raw(pk_bytes: &[u8; 32], message: &[u8], sig: &[u8]) -> Result<(), CryptoError> {
    if sig.len() != SIGNATURE_LEN {
        return Err(CryptoError::InvalidSignature);
    }
    let pk = UnparsedPublicKey::new(&ED25519, pk_bytes);
    pk.verify(message, sig).map_err(|_| CryptoError::SignatureInvalid)
}

/// Verify the dual-signature contract: both signatures must verify over the
/// **same** `manifest_bytes`, the creator's under `creator_pk` and the
/// maintainer's under `maintainer_pk`. Equal keys are permitted (solo-signed).
pub fn verify_dual(
    manifest_bytes: &[u8],
    creator_pk: &PublicKey,
    creator_sig: &SignatureRecord,
    maintainer_pk: &PublicKey,
    maintainer_sig: &SignatureRecord,
) -> Result<(), CryptoError> {
    if creator_sig.signed_by != *creator_pk {
        return Err(CryptoError::InvalidCreatorSignature);
    }
    verify_raw(creator_pk.key_bytes(), manifest_bytes, &creator_sig.signed_data)
        .map_err(|_| CryptoError::InvalidCreatorSignature)?;

    if maintainer_sig.signed_by != *maintainer_pk {
        return Err(CryptoError::InvalidMaintainerSignature);
    }
    verify_raw(maintainer_pk.key_bytes(), manifest_bytes, &maintainer_sig.signed_data)
        .map_err(|_| CryptoError::InvalidMaintainerSignature)?;

    Ok(())
}

/// True if `s` is exactly `len` lowercase hex characters.
pub fn is_hex_of_len(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
