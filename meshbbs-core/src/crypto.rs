//! Key derivation, AEAD encryption, and key wrapping.
//!
//! Key hierarchy: operator passphrase + persistent master salt → master
//! key (memory-only) → per-user / per-board keys, randomly generated and
//! wrapped under the master key → per-message ciphertext, associated-data
//! bound to `message_uuid || created_at_us` so ciphertext rows cannot be
//! swapped across each other and still authenticate.

use argon2::Argon2;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::config::KdfConfig;
use crate::error::{CoreError, Result};

pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;

/// A 32-byte symmetric key, zeroized on drop.
#[derive(Clone)]
pub struct Key(Zeroizing<[u8; KEY_LEN]>);

impl Key {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

/// Derive a key from a passphrase and salt using Argon2id.
pub fn derive_key(passphrase: &str, salt: &[u8; SALT_LEN], kdf: &KdfConfig) -> Result<Key> {
    let params = argon2::Params::new(kdf.memory_kib, kdf.iterations, kdf.parallelism, Some(KEY_LEN))
        .map_err(|_| CoreError::WrongPassphrase)?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);
    let mut out = [0u8; KEY_LEN];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut out)
        .map_err(|_| CoreError::WrongPassphrase)?;
    Ok(Key::from_bytes(out))
}

pub fn random_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Encrypt `plaintext` under `key`, binding `message_uuid` and
/// `created_at_us` as associated data. Returns `nonce || ciphertext`.
pub fn encrypt(key: &Key, message_uuid: &Uuid, created_at_us: i64, plaintext: &[u8]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes()).expect("32-byte key");
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let aad = associated_data(message_uuid, created_at_us);
    let ciphertext = cipher
        .encrypt(
            nonce,
            chacha20poly1305::aead::Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .expect("encryption under a fresh nonce cannot fail");
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    out
}

/// Decrypt a `nonce || ciphertext` blob produced by [`encrypt`]. Fails
/// with [`CoreError::AuthTagInvalid`] if the ciphertext was tampered with
/// or the `(message_uuid, created_at_us)` binding does not match.
pub fn decrypt(key: &Key, message_uuid: &Uuid, created_at_us: i64, blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < NONCE_LEN {
        return Err(CoreError::AuthTagInvalid);
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes()).expect("32-byte key");
    let nonce = Nonce::from_slice(nonce_bytes);
    let aad = associated_data(message_uuid, created_at_us);
    cipher
        .decrypt(
            nonce,
            chacha20poly1305::aead::Payload {
                msg: ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| CoreError::AuthTagInvalid)
}

fn associated_data(message_uuid: &Uuid, created_at_us: i64) -> Vec<u8> {
    let mut aad = Vec::with_capacity(16 + 8);
    aad.extend_from_slice(message_uuid.as_bytes());
    aad.extend_from_slice(&created_at_us.to_be_bytes());
    aad
}

/// Wrap a raw key under a parent key (master key, or a grantee's user key
/// for restricted boards). The wrapping itself is a plain AEAD encryption
/// keyed by a fixed nil UUID and zero timestamp, since wrapped keys have
/// no natural (uuid, timestamp) pair of their own.
pub fn wrap_key(parent: &Key, child: &Key) -> Vec<u8> {
    encrypt(parent, &Uuid::nil(), 0, child.as_bytes())
}

/// Unwrap a key previously produced by [`wrap_key`].
pub fn unwrap_key(parent: &Key, wrapped: &[u8]) -> Result<Key> {
    let raw = decrypt(parent, &Uuid::nil(), 0, wrapped)?;
    let bytes: [u8; KEY_LEN] = raw.try_into().map_err(|_| CoreError::AuthTagInvalid)?;
    Ok(Key::from_bytes(bytes))
}

/// The instance-wide master key, held only in memory for the process
/// lifetime.
pub struct MasterKey(Key);

impl MasterKey {
    /// Derive the master key from the operator passphrase and the
    /// store's immutable `master_key_salt`.
    pub fn derive(passphrase: &str, salt: &[u8; SALT_LEN], kdf: &KdfConfig) -> Result<Self> {
        Ok(Self(derive_key(passphrase, salt, kdf)?))
    }

    pub fn key(&self) -> &Key {
        &self.0
    }

    /// Wrap a freshly generated user or board key under the master key.
    pub fn wrap(&self, child: &Key) -> Vec<u8> {
        wrap_key(&self.0, child)
    }

    /// Unwrap a previously wrapped user or board key. Fails with
    /// [`CoreError::WrongPassphrase`] when the current passphrase does not
    /// match the one the key was wrapped under.
    pub fn unwrap(&self, wrapped: &[u8]) -> Result<Key> {
        unwrap_key(&self.0, wrapped).map_err(|_| CoreError::WrongPassphrase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = Key::random();
        let uuid = Uuid::new_v4();
        let blob = encrypt(&key, &uuid, 1234, b"hello mesh");
        let plain = decrypt(&key, &uuid, 1234, &blob).unwrap();
        assert_eq!(plain, b"hello mesh");
    }

    #[test]
    fn swapping_associated_data_fails_auth() {
        let key = Key::random();
        let uuid = Uuid::new_v4();
        let blob = encrypt(&key, &uuid, 1234, b"hello mesh");
        assert!(decrypt(&key, &uuid, 9999, &blob).is_err());
        assert!(decrypt(&key, &Uuid::new_v4(), 1234, &blob).is_err());
    }

    #[test]
    fn wrong_passphrase_fails_to_unwrap() {
        let kdf = KdfConfig::default();
        let salt = random_salt();
        let master = MasterKey::derive("correct horse", &salt, &kdf).unwrap();
        let user_key = Key::random();
        let wrapped = master.wrap(&user_key);

        let other = MasterKey::derive("wrong horse", &salt, &kdf).unwrap();
        assert!(other.unwrap(&wrapped).is_err());
        assert!(master.unwrap(&wrapped).is_ok());
    }

    #[test]
    fn derive_key_is_deterministic_for_same_salt() {
        let kdf = KdfConfig::default();
        let salt = random_salt();
        let a = derive_key("hunter2", &salt, &kdf).unwrap();
        let b = derive_key("hunter2", &salt, &kdf).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }
}
