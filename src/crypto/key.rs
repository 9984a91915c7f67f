//! Data encryption keys
//!
//! A [`Key`] is an immutable (key bytes, IV, algorithm, version) tuple. It
//! never holds a live cipher context: every call builds a fresh
//! [`CipherEngine`], so one `Key` can be shared freely across threads.

use crate::compression;
use crate::crypto::engine::{CipherAlgorithm, CipherEngine};
use crate::crypto::kek::KeyWrapper;
use crate::error::{Error, Result};
use crate::header::Header;
use std::fmt;
use tracing::debug;
use zeroize::Zeroizing;

/// Per-call options for [`Key::encrypt_with_header`]
#[derive(Debug, Clone, Default)]
pub struct SealOptions {
    /// Generate a fresh IV for this message and record it in the header
    pub random_iv: bool,
    /// Deflate the plaintext before encrypting
    pub compress: bool,
    /// Additional authenticated data (authenticated ciphers only)
    pub auth_data: Vec<u8>,
}

/// Symmetric data encryption key
#[derive(Clone)]
pub struct Key {
    key: Zeroizing<Vec<u8>>,
    iv: Option<Vec<u8>>,
    algorithm: CipherAlgorithm,
    version: u8,
}

impl Key {
    /// Create a key from raw material, validating lengths for `cipher_name`
    pub fn new(key: &[u8], iv: Option<&[u8]>, cipher_name: &str, version: u8) -> Result<Self> {
        Key::with_algorithm(key, iv, CipherAlgorithm::from_name(cipher_name)?, version)
    }

    /// Create a key for an already-resolved algorithm
    pub fn with_algorithm(
        key: &[u8],
        iv: Option<&[u8]>,
        algorithm: CipherAlgorithm,
        version: u8,
    ) -> Result<Self> {
        if key.len() != algorithm.key_len() {
            return Err(Error::InvalidKeyLength {
                cipher: algorithm.name().to_string(),
                expected: algorithm.key_len(),
                got: key.len(),
            });
        }
        if let Some(iv) = iv {
            if iv.len() != algorithm.iv_len() {
                return Err(Error::InvalidIvLength {
                    cipher: algorithm.name().to_string(),
                    expected: algorithm.iv_len(),
                    got: iv.len(),
                });
            }
        }

        Ok(Key {
            key: Zeroizing::new(key.to_vec()),
            iv: iv.map(|iv| iv.to_vec()),
            algorithm,
            version,
        })
    }

    /// Generate a new random key and IV
    pub fn random(algorithm: CipherAlgorithm, version: u8) -> Self {
        Key {
            key: algorithm.random_key(),
            iv: Some(algorithm.random_iv()),
            algorithm,
            version,
        }
    }

    /// Raw key bytes
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Configured IV, if any
    pub fn iv(&self) -> Option<&[u8]> {
        self.iv.as_deref()
    }

    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    pub fn cipher_name(&self) -> &'static str {
        self.algorithm.name()
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Fresh encryptor for this key, using `iv` or else the key's own IV
    pub fn encryptor(&self, iv: Option<&[u8]>, auth_data: &[u8]) -> Result<CipherEngine> {
        CipherEngine::encryptor(self.algorithm, &self.key, iv.or(self.iv()), auth_data)
    }

    /// Fresh decryptor for this key, using `iv` or else the key's own IV
    pub fn decryptor(
        &self,
        iv: Option<&[u8]>,
        auth_data: &[u8],
        auth_tag: Option<&[u8]>,
    ) -> Result<CipherEngine> {
        CipherEngine::decryptor(self.algorithm, &self.key, iv.or(self.iv()), auth_data, auth_tag)
    }

    /// Encrypt raw bytes with the key's own IV. No header, no encoding.
    ///
    /// Authenticated ciphers append the tag to the returned ciphertext.
    pub fn encrypt(&self, plaintext: &[u8], auth_data: &[u8]) -> Result<Vec<u8>> {
        let finished = self.encryptor(None, auth_data)?.run(plaintext)?;
        let mut out = finished.data;
        if let Some(tag) = finished.auth_tag {
            out.extend_from_slice(&tag);
        }
        Ok(out)
    }

    /// Decrypt raw bytes produced by [`Key::encrypt`]
    pub fn decrypt(&self, ciphertext: &[u8], auth_data: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.decryptor(None, auth_data, None)?.run(ciphertext)?.data)
    }

    /// Compress (optionally), encrypt, and prepend a header describing how
    ///
    /// Authenticated ciphers always get a random IV and carry their tag in
    /// the header.
    pub fn encrypt_with_header(&self, plaintext: &[u8], options: &SealOptions) -> Result<Vec<u8>> {
        let compressed;
        let data = if options.compress {
            compressed = compression::compress(plaintext)?;
            &compressed[..]
        } else {
            plaintext
        };

        let random_iv = options.random_iv || self.algorithm.is_authenticated();
        let iv = if random_iv {
            Some(self.algorithm.random_iv())
        } else {
            None
        };

        let finished = self.encryptor(iv.as_deref(), &options.auth_data)?.run(data)?;

        let header = Header {
            version: self.version,
            compressed: options.compress,
            iv,
            auth_tag: finished.auth_tag,
            ..Header::default()
        };

        let mut out = header.write(None)?;
        out.extend_from_slice(&finished.data);
        debug!(
            version = self.version,
            cipher = self.cipher_name(),
            len = out.len(),
            "Encrypted with header"
        );
        Ok(out)
    }

    /// Decrypt the payload that follows a parsed header
    ///
    /// Any IV, key, or cipher name carried by the header overrides this
    /// key's own. The result is inflated when the header says so.
    pub fn decrypt_payload(
        &self,
        payload: &[u8],
        header: &Header,
        auth_data: &[u8],
    ) -> Result<Vec<u8>> {
        let algorithm = match &header.cipher_name {
            Some(name) => CipherAlgorithm::from_name(name)?,
            None => self.algorithm,
        };
        let key: &[u8] = header.key.as_deref().map(|k| &k[..]).unwrap_or(&self.key[..]);
        let iv = header.iv.as_deref().or(self.iv());

        let plaintext = if payload.is_empty() && !algorithm.is_authenticated() {
            Vec::new()
        } else {
            CipherEngine::decryptor(algorithm, key, iv, auth_data, header.auth_tag.as_deref())?
                .run(payload)?
                .data
        };

        if header.compressed {
            compression::decompress(&plaintext)
        } else {
            Ok(plaintext)
        }
    }
}

impl Key {
    /// Fail unless this key may encrypt other keys under its fixed IV
    ///
    /// GCM must never see the same nonce twice, so authenticated keys are
    /// refused for wrapping and for keys embedded in headers.
    pub fn check_wrapping(&self) -> Result<()> {
        if self.algorithm.is_authenticated() {
            return Err(Error::Cipher(format!(
                "{} cannot wrap keys: authenticated ciphers need a unique nonce per message",
                self.cipher_name()
            )));
        }
        Ok(())
    }
}

impl KeyWrapper for Key {
    fn wrap_key(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.check_wrapping()?;
        self.encrypt(key, b"")
    }

    fn unwrap_key(&self, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        self.check_wrapping()?;
        Ok(Zeroizing::new(self.decrypt(wrapped, b"")?))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("cipher_name", &self.cipher_name())
            .field("version", &self.version)
            .field("key", &"[REDACTED]")
            .field("iv", &self.iv.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}
