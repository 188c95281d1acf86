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

//! Host keypair manager: Ed25519 identity created on first run.
//!
//! ## At-rest protection
//! - **Atomic writes** for private key material (tmp + fsync + rename).
//! - **0700** on `keys/`, **0600** on key files.
//! - **Optional key-at-rest encryption** via `LIBRESEED_KEY_PASSPHRASE`:
//!   the key file becomes `MAGIC(8) || SALT(16) || NONCE(12) || CIPHERTEXT+TAG`
//!   where the ciphertext is AES-256-GCM over the Ed25519 PKCS#8 bytes and
//!   the key is PBKDF2-HMAC-SHA256 derived.

use crate::core::crypto::{self, CryptoError, PublicKey, SignatureRecord};
use ring::{
    aead, pbkdf2,
    rand::{SecureRandom, SystemRandom},
    signature::{Ed25519KeyPair, KeyPair},
};
use std::{
    fs,
    io::Write,
    num::NonZeroU32,
    path::{Path, PathBuf},
};
use thiserror::Error;
use zeroize::Zeroize;

const KEY_FILE_MAGIC: &[u8] = b"LSEEDKY1"; // 8 bytes
const KEY_SALT_LEN: usize = 16;
const KEY_NONCE_LEN: usize = 12;
const PBKDF2_ITERS: u32 = 100_000;

/// Host key errors.
#[derive(Debug, Error)]
pub enum HostKeyError {
    /// Key file could not be read or written.
    #[error("io")]
    Io,
    /// Key bytes are not valid PKCS#8 Ed25519 material.
    #[error("invalid key encoding")]
    InvalidKey,
    /// Key is encrypted but no passphrase is available.
    #[error("missing passphrase (set LIBRESEED_KEY_PASSPHRASE)")]
    MissingPassphrase,
    /// Encryption or decryption of the key file failed.
    #[error("crypto")]
    Crypto,
}

impl From<CryptoError> for HostKeyError {
    fn from(_: CryptoError) -> Self {
        HostKeyError::InvalidKey
    }
}

fn passphrase() -> Option<String> {
    std::env::var("LIBRESEED_KEY_PASSPHRASE").ok().filter(|v| !v.trim().is_empty())
}

fn set_private_perms_best_effort(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    }
}

fn set_dir_perms_best_effort(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o700));
    }
}

/// Atomic write to disk (best-effort fsync, then rename).
fn atomic_write_private(path: &Path, bytes: &[u8]) -> Result<(), HostKeyError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|_| HostKeyError::Io)?;
        set_dir_perms_best_effort(parent);
    }

    let mut tmp = path.to_path_buf();
    tmp.set_extension("tmp");

    {
        let mut f = fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)
            .map_err(|_| HostKeyError::Io)?;
        f.write_all(bytes).map_err(|_| HostKeyError::Io)?;
        let _ = f.sync_all();
    }

    set_private_perms_best_effort(&tmp);
    fs::rename(&tmp, path).map_err(|_| HostKeyError::Io)?;
    set_private_perms_best_effort(path);
    Ok(())
}

fn derive_aes256gcm_key(pass: &[u8], salt: &[u8; KEY_SALT_LEN]) -> [u8; 32] {
    let mut out = [0u8; 32];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        NonZeroU32::new(PBKDF2_ITERS).expect("nonzero"),
        salt,
        pass,
        &mut out,
    );
    out
}

fn encrypt_pkcs8(pass: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, HostKeyError> {
    let rng = SystemRandom::new();

    let mut salt = [0u8; KEY_SALT_LEN];
    rng.fill(&mut salt).map_err(|_| HostKeyError::Crypto)?;
    let mut nonce_bytes = [0u8; KEY_NONCE_LEN];
    rng.fill(&mut nonce_bytes).map_err(|_| HostKeyError::Crypto)?;
    let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);

    let mut key = derive_aes256gcm_key(pass, &salt);
    let unbound =
        aead::UnboundKey::new(&aead::AES_256_GCM, &key).map_err(|_| HostKeyError::Crypto)?;
    let sealing = aead::LessSafeKey::new(unbound);

    let mut in_out = plaintext.to_vec();
    sealing
        .seal_in_place_append_tag(nonce, aead::Aad::empty(), &mut in_out)
        .map_err(|_| HostKeyError::Crypto)?;
    key.zeroize();

    let mut out =
        Vec::with_capacity(KEY_FILE_MAGIC.len() + KEY_SALT_LEN + KEY_NONCE_LEN + in_out.len());
    out.extend_from_slice(KEY_FILE_MAGIC);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&in_out);
    Ok(out)
}

fn decrypt_pkcs8(pass: &[u8], bytes: &[u8]) -> Result<Vec<u8>, HostKeyError> {
    if bytes.len() < KEY_FILE_MAGIC.len() + KEY_SALT_LEN + KEY_NONCE_LEN + 16 {
        return Err(HostKeyError::InvalidKey);
    }

    let mut salt = [0u8; KEY_SALT_LEN];
    salt.copy_from_slice(&bytes[KEY_FILE_MAGIC.len()..KEY_FILE_MAGIC.len() + KEY_SALT_LEN]);
    let mut nonce_bytes = [0u8; KEY_NONCE_LEN];
    nonce_bytes.copy_from_slice(
        &bytes[KEY_FILE_MAGIC.len() + KEY_SALT_LEN
            ..KEY_FILE_MAGIC.len() + KEY_SALT_LEN + KEY_NONCE_LEN],
    );
    let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);

    let mut key = derive_aes256gcm_key(pass, &salt);
    let unbound =
        aead::UnboundKey::new(&aead::AES_256_GCM, &key).map_err(|_| HostKeyError::Crypto)?;
    let opening = aead::LessSafeKey::new(unbound);

    let mut in_out = bytes[KEY_FILE_MAGIC.len() + KEY_SALT_LEN + KEY_NONCE_LEN..].to_vec();
    let plain = opening
        .open_in_place(nonce, aead::Aad::empty(), &mut in_out)
        .map_err(|_| HostKeyError::Crypto)?;

    key.zeroize();
    Ok(plain.to_vec())
}

/// The host's Ed25519 identity, loaded from or created in `keys/host.key`.
pub struct HostKeyManager {
    keypair: Ed25519KeyPair,
    public: PublicKey,
    key_path: PathBuf,
}

impl HostKeyManager {
    /// Load the host keypair, generating one on first run.
    pub fn open(keys_dir: &Path) -> Result<Self, HostKeyError> {
        let key_path = keys_dir.join("host.key");
        let pass = passphrase();

        if key_path.exists() {
            let bytes = fs::read(&key_path).map_err(|_| HostKeyError::Io)?;
            let pkcs8 = if bytes.starts_with(KEY_FILE_MAGIC) {
                let Some(p) = pass.as_deref() else {
                    return Err(HostKeyError::MissingPassphrase);
                };
                decrypt_pkcs8(p.as_bytes(), &bytes)?
            } else {
                bytes
            };
            let keypair =
                Ed25519KeyPair::from_pkcs8(&pkcs8).map_err(|_| HostKeyError::InvalidKey)?;
            let public = PublicKey::new(keypair.public_key().as_ref())?;
            return Ok(Self { keypair, public, key_path });
        }

        let rng = SystemRandom::new();
        let pkcs8 =
            Ed25519KeyPair::generate_pkcs8(&rng).map_err(|_| HostKeyError::InvalidKey)?;

        let mut buf = pkcs8.as_ref().to_vec();
        let on_disk = if let Some(p) = pass.as_deref() {
            let enc = encrypt_pkcs8(p.as_bytes(), &buf)?;
            buf.zeroize();
            enc
        } else {
            buf.clone()
        };
        atomic_write_private(&key_path, &on_disk)?;
        buf.zeroize();

        let keypair =
            Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).map_err(|_| HostKeyError::InvalidKey)?;
        let public = PublicKey::new(keypair.public_key().as_ref())?;
        Ok(Self { keypair, public, key_path })
    }

    /// Host public key.
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Host key fingerprint (16 hex chars).
    pub fn fingerprint(&self) -> String {
        self.public.fingerprint()
    }

    /// Path of the on-disk key file.
    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Sign `message` with the host key.
    pub fn sign(&self, message: &[u8]) -> Result<SignatureRecord, HostKeyError> {
        crypto::sign(&self.keypair, message).map_err(HostKeyError::from)
    }
}
