//! Key-encrypting keys
//!
//! Anything that can wrap and unwrap a data key implements [`KeyWrapper`].
//! A symmetric [`crate::crypto::Key`] does, which is how nested keystore
//! hierarchies are built; [`KeyEncryptionKey`] wraps with RSA.

use crate::error::{Error, Result};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, LineEnding};
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use std::fmt;
use tracing::debug;
use zeroize::Zeroizing;

/// Default RSA modulus size for generated key-encrypting keys
pub const DEFAULT_RSA_BITS: usize = 2048;

/// Wraps raw data-key bytes for storage
pub trait KeyWrapper: Send + Sync {
    /// Encrypt a data key
    fn wrap_key(&self, key: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt a data key
    fn unwrap_key(&self, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>>;
}

/// RSA key used only to wrap data keys, never application data
pub struct KeyEncryptionKey {
    private_key: RsaPrivateKey,
}

impl KeyEncryptionKey {
    /// Generate a new RSA key pair
    pub fn generate(bits: usize) -> Result<Self> {
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
            .map_err(|e| Error::Encryption(format!("RSA key generation failed: {}", e)))?;
        debug!(bits, "Generated RSA key-encrypting key");
        Ok(KeyEncryptionKey { private_key })
    }

    /// Load a PEM private key (PKCS#1 or PKCS#8)
    pub fn from_pem(pem: &str) -> Result<Self> {
        let private_key = RsaPrivateKey::from_pkcs1_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
            .map_err(|e| Error::Config(format!("Invalid RSA private key: {}", e)))?;
        Ok(KeyEncryptionKey { private_key })
    }

    /// Export the private key as PKCS#1 PEM
    pub fn to_pem(&self) -> Result<Zeroizing<String>> {
        self.private_key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| Error::Serialization(format!("Failed to encode RSA key: {}", e)))
    }

    /// Encrypt with the public half
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let public_key = RsaPublicKey::from(&self.private_key);
        public_key
            .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, data)
            .map_err(|e| Error::Encryption(format!("RSA encryption failed: {}", e)))
    }

    /// Decrypt with the private half
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.private_key
            .decrypt(Pkcs1v15Encrypt, data)
            .map_err(|e| Error::Decryption(format!("RSA decryption failed: {}", e)))
    }
}

impl KeyWrapper for KeyEncryptionKey {
    fn wrap_key(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.encrypt(key)
    }

    fn unwrap_key(&self, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        Ok(Zeroizing::new(self.decrypt(wrapped)?))
    }
}

impl fmt::Debug for KeyEncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyEncryptionKey").finish_non_exhaustive()
    }
}
