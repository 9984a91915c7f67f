//! Versioned cipher registry
//!
//! The first cipher is the primary and encrypts all new data. The rest are
//! secondaries kept so data encrypted under older key versions can still be
//! decrypted after a rotation.

use super::{Cipher, EncryptOptions, Plaintext};
use crate::config::EnvironmentConfig;
use crate::crypto::Key;
use crate::error::{Error, Result};
use crate::header::{CipherSource, Header};
use crate::keystore::KeystoreContext;
use std::fmt;
use tracing::debug;

/// Picks a version for ciphertext that has no header
///
/// Receives the encoded value and its decoded bytes.
pub type CipherSelector = Box<dyn Fn(&[u8], &[u8]) -> Option<u8> + Send + Sync>;

/// Ordered set of ciphers, primary first
pub struct CipherRegistry {
    primary: Cipher,
    secondaries: Vec<Cipher>,
    selector: Option<CipherSelector>,
}

impl CipherRegistry {
    /// Create a registry; the first cipher becomes the primary
    pub fn new(ciphers: Vec<Cipher>) -> Result<Self> {
        let mut ciphers = ciphers.into_iter();
        let primary = ciphers
            .next()
            .ok_or_else(|| Error::Config("At least one cipher must be configured".to_string()))?;

        Ok(CipherRegistry {
            primary,
            secondaries: ciphers.collect(),
            selector: None,
        })
    }

    /// Build a registry from one environment's configuration
    ///
    /// Every key source is resolved here, so misconfiguration fails now
    /// rather than on first use.
    pub fn from_config(env: &EnvironmentConfig, ctx: &KeystoreContext) -> Result<Self> {
        let ciphers = env
            .ciphers
            .iter()
            .map(|config| Cipher::from_config(config, ctx))
            .collect::<Result<Vec<_>>>()?;
        let registry = CipherRegistry::new(ciphers)?;
        debug!(
            primary = registry.primary.version(),
            secondaries = registry.secondaries.len(),
            "Cipher registry ready"
        );
        Ok(registry)
    }

    /// Register a rule that picks a version for header-less ciphertext
    pub fn with_cipher_selector<F>(mut self, selector: F) -> Self
    where
        F: Fn(&[u8], &[u8]) -> Option<u8> + Send + Sync + 'static,
    {
        self.selector = Some(Box::new(selector));
        self
    }

    /// Cipher used for all new encryption
    pub fn primary(&self) -> &Cipher {
        &self.primary
    }

    pub fn secondaries(&self) -> &[Cipher] {
        &self.secondaries
    }

    /// All ciphers, primary first
    pub fn ciphers(&self) -> impl Iterator<Item = &Cipher> {
        std::iter::once(&self.primary).chain(self.secondaries.iter())
    }

    /// Look up a cipher by version
    ///
    /// `None` returns the primary. An unknown version returns `None`, except
    /// version 0 which falls back to the primary.
    pub fn cipher(&self, version: Option<u8>) -> Option<&Cipher> {
        let Some(version) = version else {
            return Some(&self.primary);
        };

        self.ciphers()
            .find(|c| c.version() == version)
            .or(if version == 0 { Some(&self.primary) } else { None })
    }

    /// Like [`CipherRegistry::cipher`] but a missing version is an error
    pub fn require_cipher(&self, version: Option<u8>) -> Result<&Cipher> {
        self.cipher(version).ok_or_else(|| {
            Error::Cipher(format!(
                "Cipher with version:{} not found in any of the configured ciphers",
                version.unwrap_or_default()
            ))
        })
    }

    /// Encrypt with the primary cipher
    pub fn encrypt(&self, plaintext: &[u8], options: &EncryptOptions) -> Result<Vec<u8>> {
        self.primary.encrypt_with(plaintext, options)
    }

    /// Encrypt a string with the primary cipher
    pub fn encrypt_str(&self, plaintext: &str, options: &EncryptOptions) -> Result<String> {
        self.primary.encrypt_str(plaintext, options)
    }

    /// Decode and decrypt a value produced by any configured cipher
    ///
    /// A header selects the cipher by its version. Without a header the
    /// cipher is chosen by `version`, then by the registered selector, then
    /// the version 0 default applies.
    pub fn decrypt(&self, encoded: &[u8], version: Option<u8>) -> Result<Plaintext> {
        if encoded.is_empty() {
            return Ok(Plaintext::Text(String::new()));
        }

        let decoded = self.primary.encoding().decode(encoded)?;
        Ok(Plaintext::from_bytes(self.binary_decrypt_selected(
            encoded, &decoded, version,
        )?))
    }

    /// Decrypt raw ciphertext produced by any configured cipher
    pub fn binary_decrypt(&self, ciphertext: &[u8], version: Option<u8>) -> Result<Vec<u8>> {
        self.binary_decrypt_selected(ciphertext, ciphertext, version)
    }

    fn binary_decrypt_selected(
        &self,
        encoded: &[u8],
        decoded: &[u8],
        version: Option<u8>,
    ) -> Result<Vec<u8>> {
        if decoded.is_empty() {
            return Ok(Vec::new());
        }

        let cipher = if Header::present(decoded) {
            &self.primary
        } else {
            let version = version
                .or_else(|| self.selector.as_ref().and_then(|select| select(encoded, decoded)))
                .unwrap_or(0);
            self.require_cipher(Some(version))?
        };

        cipher.binary_decrypt_with(decoded, self)
    }

    /// Decrypt, treating decryption and decoding failures as "not decryptable"
    ///
    /// Without a header and an authenticated cipher, decrypting with the
    /// wrong key can still succeed and return garbage. A `Some` result is
    /// therefore not proof that the right key was used.
    pub fn try_decrypt(&self, encoded: &[u8], version: Option<u8>) -> Result<Option<Plaintext>> {
        match self.decrypt(encoded, version) {
            Ok(plaintext) => Ok(Some(plaintext)),
            Err(e @ (Error::Decryption(_) | Error::Encoding(_))) => {
                debug!(error = %e, "Value could not be decrypted");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Whether an encoded value looks like output of the primary cipher
    ///
    /// Values carrying a header are recognised by their encoded magic
    /// prefix. Header-less values are only considered encrypted when they
    /// decrypt, which is subject to the same caveat as
    /// [`CipherRegistry::try_decrypt`].
    pub fn is_encrypted(&self, encoded: &[u8]) -> bool {
        if encoded.is_empty() {
            return false;
        }
        if encoded.starts_with(self.primary.encoded_magic_header().as_bytes()) {
            return true;
        }
        matches!(self.try_decrypt(encoded, None), Ok(Some(_)))
    }

    /// Whether decoded ciphertext starts with a header
    pub fn header_present(&self, encoded: &[u8]) -> bool {
        self.primary
            .encoding()
            .decode(encoded)
            .map(|decoded| Header::present(&decoded))
            .unwrap_or(false)
    }
}

impl CipherSource for CipherRegistry {
    fn key_for(&self, version: u8) -> Option<&Key> {
        self.cipher(Some(version)).map(|c| c.key())
    }
}

impl fmt::Debug for CipherRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherRegistry")
            .field("primary", &self.primary)
            .field("secondaries", &self.secondaries)
            .field("selector", &self.selector.as_ref().map(|_| "<fn>"))
            .finish()
    }
}
