//! Cryptographic primitives for cryptmirror
//!
//! A password is stretched into an AES-256 key with Argon2id; file contents
//! are sealed whole-file with AES-256-GCM into self-describing blobs.

pub mod kdf;
pub mod vault;

/// AES-256 key size in bytes
pub const KEY_SIZE: usize = 32;

/// KDF salt size in bytes
pub const SALT_SIZE: usize = 16;

/// AES-GCM nonce size in bytes
pub const NONCE_SIZE: usize = 12;

pub use kdf::{derive_key, generate_salt, DerivedKey};
pub use vault::ContentCipher;
