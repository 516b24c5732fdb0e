//! Whole-file content encryption
//!
//! Every regular file under the mirrored root is stored as one
//! self-describing blob:
//!
//! ```text
//! +-------+------------+-------------+----------------------------+
//! | magic | KDF salt   | AEAD nonce  | AES-256-GCM ciphertext+tag |
//! | 4 B   | 16 B       | 12 B        | len(plaintext) + 16 B      |
//! +-------+------------+-------------+----------------------------+
//! ```
//!
//! The salt travels inside the blob, so opening needs nothing but the
//! password. Derived keys are cached per salt; Argon2 runs once per salt,
//! not once per operation.

use crate::config::EncryptionConfig;
use crate::crypto::{derive_key, generate_salt, KEY_SIZE, NONCE_SIZE, SALT_SIZE};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use std::collections::HashMap;
use zeroize::Zeroizing;

/// Blob magic; bump when the on-disk format changes.
pub const BLOB_MAGIC: &[u8; 4] = b"CMV1";

/// Bytes preceding the ciphertext in a blob.
pub const HEADER_SIZE: usize = BLOB_MAGIC.len() + SALT_SIZE + NONCE_SIZE;

/// Authentication tag appended by AES-256-GCM.
pub const TAG_SIZE: usize = 16;

/// Seals plaintext into blobs and opens them back, keyed by the mount
/// password. Read-only after construction; shared across all file handles.
pub struct ContentCipher {
    secret: Zeroizing<Vec<u8>>,
    params: EncryptionConfig,
    /// Salt used when sealing new blobs during this mount
    seal_salt: [u8; SALT_SIZE],
    /// Derived keys per salt seen in blobs
    keys: RwLock<HashMap<[u8; SALT_SIZE], Zeroizing<[u8; KEY_SIZE]>>>,
}

impl ContentCipher {
    /// Build a cipher for `secret`, paying the Argon2 cost for this mount's
    /// seal salt up front.
    pub fn new(secret: &[u8], params: EncryptionConfig) -> Result<Self> {
        let cipher = Self {
            secret: Zeroizing::new(secret.to_vec()),
            params,
            seal_salt: generate_salt(),
            keys: RwLock::new(HashMap::new()),
        };
        cipher.key_for(&cipher.seal_salt)?;
        Ok(cipher)
    }

    fn key_for(&self, salt: &[u8; SALT_SIZE]) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
        if let Some(key) = self.keys.read().get(salt) {
            return Ok(key.clone());
        }
        let derived = derive_key(&self.secret, Some(salt), &self.params)?;
        let key = Zeroizing::new(*derived.key());
        self.keys.write().insert(*salt, key.clone());
        Ok(key)
    }

    /// Encrypt a full plaintext into a self-describing blob.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self.key_for(&self.seal_salt)?;
        let unbound = UnboundKey::new(&AES_256_GCM, key.as_slice())
            .map_err(|_| Error::Encryption("invalid key material".to_string()))?;
        let sealing = LessSafeKey::new(unbound);

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.to_vec();
        sealing
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| Error::Encryption("AEAD seal failed".to_string()))?;

        let mut blob = Vec::with_capacity(HEADER_SIZE + in_out.len());
        blob.extend_from_slice(BLOB_MAGIC);
        blob.extend_from_slice(&self.seal_salt);
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&in_out);
        Ok(blob)
    }

    /// Decrypt a blob produced by [`seal`](Self::seal) under the same
    /// password. Fails on a wrong password, a corrupted or truncated blob,
    /// or a foreign format.
    pub fn open(&self, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < HEADER_SIZE + TAG_SIZE {
            return Err(Error::Decryption(format!(
                "blob too short: {} bytes",
                blob.len()
            )));
        }

        let (magic, rest) = blob.split_at(BLOB_MAGIC.len());
        if magic != BLOB_MAGIC {
            return Err(Error::Decryption("unrecognized blob magic".to_string()));
        }
        let (salt_bytes, rest) = rest.split_at(SALT_SIZE);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_SIZE);

        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(salt_bytes);
        let key = self.key_for(&salt)?;

        let unbound = UnboundKey::new(&AES_256_GCM, key.as_slice())
            .map_err(|_| Error::Decryption("invalid key material".to_string()))?;
        let opening = LessSafeKey::new(unbound);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| Error::Decryption("malformed nonce".to_string()))?;

        let mut in_out = ciphertext.to_vec();
        let plaintext = opening
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| {
                Error::Decryption("authentication failed (wrong password or corrupted blob)".to_string())
            })?;

        Ok(plaintext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_params() -> EncryptionConfig {
        EncryptionConfig {
            argon2_memory_kib: 1024,
            argon2_iterations: 1,
            argon2_parallelism: 1,
        }
    }

    fn test_cipher(secret: &[u8]) -> ContentCipher {
        ContentCipher::new(secret, test_params()).unwrap()
    }

    #[test]
    fn test_seal_open_round_trip() {
        let cipher = test_cipher(b"hunter2");
        let plaintext = b"the quick brown fox";

        let blob = cipher.seal(plaintext).unwrap();
        assert_ne!(&blob[HEADER_SIZE..], plaintext.as_slice());
        assert_eq!(cipher.open(&blob).unwrap(), plaintext);
    }

    #[test]
    fn test_empty_plaintext_round_trip() {
        let cipher = test_cipher(b"hunter2");
        let blob = cipher.seal(b"").unwrap();
        assert_eq!(blob.len(), HEADER_SIZE + TAG_SIZE);
        assert_eq!(cipher.open(&blob).unwrap(), b"");
    }

    #[test]
    fn test_blob_is_self_describing() {
        // A fresh cipher with nothing but the same password can open it
        let blob = test_cipher(b"shared secret").seal(b"payload").unwrap();
        let other = test_cipher(b"shared secret");
        assert_eq!(other.open(&blob).unwrap(), b"payload");
    }

    #[test]
    fn test_wrong_password_fails() {
        let blob = test_cipher(b"password one").seal(b"payload").unwrap();
        let result = test_cipher(b"password two").open(&blob);
        assert!(matches!(result, Err(Error::Decryption(_))));
    }

    #[test]
    fn test_corrupted_blob_fails() {
        let cipher = test_cipher(b"hunter2");
        let mut blob = cipher.seal(b"payload").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        assert!(matches!(cipher.open(&blob), Err(Error::Decryption(_))));
    }

    #[test]
    fn test_truncated_blob_fails() {
        let cipher = test_cipher(b"hunter2");
        let blob = cipher.seal(b"payload").unwrap();
        assert!(matches!(
            cipher.open(&blob[..HEADER_SIZE]),
            Err(Error::Decryption(_))
        ));
        assert!(matches!(cipher.open(b""), Err(Error::Decryption(_))));
    }

    #[test]
    fn test_foreign_magic_rejected() {
        let cipher = test_cipher(b"hunter2");
        let mut blob = cipher.seal(b"payload").unwrap();
        blob[0] = b'X';
        assert!(matches!(cipher.open(&blob), Err(Error::Decryption(_))));
    }
}
