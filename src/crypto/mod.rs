//! Cryptography module for symmetric-encryption
//!
//! Provides the block-cipher engine (AES-CBC with PKCS#7 padding, AES-GCM),
//! data encryption keys and the key-encrypting keys that wrap them.
//! Application data is only ever encrypted with a symmetric [`Key`].

mod engine;
mod kek;
mod key;

pub use engine::{random_bytes, CipherAlgorithm, CipherEngine, Finished};
pub use kek::{KeyEncryptionKey, KeyWrapper, DEFAULT_RSA_BITS};
pub use key::{Key, SealOptions};

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// Size of a GCM nonce in bytes
pub const GCM_NONCE_SIZE: usize = 12;

/// Size of a GCM authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Default cipher used when a configuration does not name one
pub const DEFAULT_CIPHER: CipherAlgorithm = CipherAlgorithm::Aes256Cbc;
