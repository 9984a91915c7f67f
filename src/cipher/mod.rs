//! Cipher façade
//!
//! A [`Cipher`] binds one versioned [`Key`] to an [`Encoding`] and header
//! defaults. It is the entry point for encrypting and decrypting values;
//! [`CipherRegistry`] holds several of them for key rotation.

mod registry;

pub use registry::{CipherRegistry, CipherSelector};

use crate::config::CipherConfig;
use crate::crypto::{CipherAlgorithm, Key, SealOptions};
use crate::encoding::Encoding;
use crate::error::{Error, Result};
use crate::header::{CipherSource, Header, MAGIC_HEADER};
use crate::keystore::{self, KeystoreContext};
use std::fmt;
use tracing::debug;

/// Per-call encryption options
#[derive(Debug, Clone, Copy, Default)]
pub struct EncryptOptions {
    /// Use a fresh IV for this value (forces a header)
    pub random_iv: bool,
    /// Deflate before encrypting (forces a header)
    pub compress: bool,
    /// Override the cipher's `always_add_header` default
    pub header: Option<bool>,
}

impl EncryptOptions {
    /// Options with a random IV
    pub fn random_iv() -> Self {
        EncryptOptions {
            random_iv: true,
            ..EncryptOptions::default()
        }
    }
}

/// Result of a decryption
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plaintext {
    /// The decrypted bytes were valid UTF-8
    Text(String),
    /// The decrypted bytes were not valid UTF-8
    Binary(Vec<u8>),
}

impl Plaintext {
    /// Tag decrypted bytes as text when they are valid UTF-8
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => Plaintext::Text(text),
            Err(e) => Plaintext::Binary(e.into_bytes()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Plaintext::Text(text) => text.as_bytes(),
            Plaintext::Binary(bytes) => bytes,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Plaintext::Text(text) => text.into_bytes(),
            Plaintext::Binary(bytes) => bytes,
        }
    }

    /// Text content, if the plaintext was valid UTF-8
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Plaintext::Text(text) => Some(text),
            Plaintext::Binary(_) => None,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Plaintext::Text(_))
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl fmt::Display for Plaintext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Plaintext::Text(text) => f.write_str(text),
            Plaintext::Binary(bytes) => write!(f, "<{} binary bytes>", bytes.len()),
        }
    }
}

/// A versioned key with its encoding and header defaults
#[derive(Debug, Clone)]
pub struct Cipher {
    key: Key,
    encoding: Encoding,
    always_add_header: bool,
}

impl Cipher {
    pub fn new(key: Key, encoding: Encoding, always_add_header: bool) -> Self {
        Cipher {
            key,
            encoding,
            always_add_header,
        }
    }

    /// Build a cipher from configuration, resolving its key source
    pub fn from_config(config: &CipherConfig, ctx: &KeystoreContext) -> Result<Self> {
        let key = keystore::read_key(config, ctx)?;
        debug!(
            version = key.version(),
            cipher = key.cipher_name(),
            encoding = %config.encoding,
            "Loaded cipher"
        );
        Ok(Cipher::new(key, config.encoding, config.always_add_header))
    }

    /// Cipher with a freshly generated key, default encoding, and headers on
    pub fn random(algorithm: CipherAlgorithm, version: u8) -> Self {
        Cipher::new(Key::random(algorithm, version), Encoding::default(), true)
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn version(&self) -> u8 {
        self.key.version()
    }

    pub fn cipher_name(&self) -> &'static str {
        self.key.cipher_name()
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn always_add_header(&self) -> bool {
        self.always_add_header
    }

    /// Encrypt and encode with default options
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.encrypt_with(plaintext, &EncryptOptions::default())
    }

    /// Encrypt and encode
    ///
    /// Empty input returns empty output without touching the cipher.
    pub fn encrypt_with(&self, plaintext: &[u8], options: &EncryptOptions) -> Result<Vec<u8>> {
        if plaintext.is_empty() {
            return Ok(Vec::new());
        }
        let encrypted = self.binary_encrypt(plaintext, options)?;
        Ok(self.encoding.encode(&encrypted))
    }

    /// Encrypt a string into encoded text
    ///
    /// Fails when the encoding is not text-safe.
    pub fn encrypt_str(&self, plaintext: &str, options: &EncryptOptions) -> Result<String> {
        if !self.encoding.is_text() {
            return Err(Error::Encoding(format!(
                "Encoding '{}' does not produce text",
                self.encoding
            )));
        }
        let encoded = self.encrypt_with(plaintext.as_bytes(), options)?;
        String::from_utf8(encoded).map_err(|e| Error::Encoding(e.to_string()))
    }

    /// Encrypt an optional value, passing `None` through
    pub fn encrypt_opt(
        &self,
        plaintext: Option<&[u8]>,
        options: &EncryptOptions,
    ) -> Result<Option<Vec<u8>>> {
        plaintext.map(|p| self.encrypt_with(p, options)).transpose()
    }

    /// Encrypt without encoding
    ///
    /// A header is written when requested, when the cipher always adds one,
    /// and whenever a random IV, compression, or an authenticated cipher is
    /// used, since the header is the only place those are recorded.
    pub fn binary_encrypt(&self, plaintext: &[u8], options: &EncryptOptions) -> Result<Vec<u8>> {
        if plaintext.is_empty() {
            return Ok(Vec::new());
        }

        let add_header = options.header.unwrap_or(self.always_add_header)
            || options.random_iv
            || options.compress
            || self.key.algorithm().is_authenticated();

        if add_header {
            let seal = SealOptions {
                random_iv: options.random_iv,
                compress: options.compress,
                ..SealOptions::default()
            };
            self.key.encrypt_with_header(plaintext, &seal)
        } else {
            self.key.encrypt(plaintext, b"")
        }
    }

    /// Decode and decrypt
    pub fn decrypt(&self, encoded: &[u8]) -> Result<Plaintext> {
        self.decrypt_with(encoded, self)
    }

    /// Decode and decrypt an optional value, passing `None` through
    pub fn decrypt_opt(&self, encoded: Option<&[u8]>) -> Result<Option<Plaintext>> {
        encoded.map(|e| self.decrypt(e)).transpose()
    }

    /// Decode and decrypt, resolving header versions through `keys`
    pub fn decrypt_with(&self, encoded: &[u8], keys: &dyn CipherSource) -> Result<Plaintext> {
        if encoded.is_empty() {
            return Ok(Plaintext::Text(String::new()));
        }
        let decoded = self.encoding.decode(encoded)?;
        Ok(Plaintext::from_bytes(
            self.binary_decrypt_with(&decoded, keys)?,
        ))
    }

    /// Decrypt raw ciphertext (no decoding)
    pub fn binary_decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.binary_decrypt_with(ciphertext, self)
    }

    /// Decrypt raw ciphertext, resolving header versions through `keys`
    ///
    /// With a header, the header's version selects the key and any IV, key,
    /// or cipher name it carries is used. Without one, this cipher's own key
    /// and IV are used.
    pub fn binary_decrypt_with(&self, ciphertext: &[u8], keys: &dyn CipherSource) -> Result<Vec<u8>> {
        if ciphertext.is_empty() {
            return Ok(Vec::new());
        }

        let mut header = Header::default();
        let consumed = header.parse(ciphertext, keys)?;
        if consumed == 0 {
            return self.key.decrypt(ciphertext, b"");
        }

        let key = keys.key_for(header.version).ok_or_else(|| {
            Error::Cipher(format!(
                "Cipher with version:{} not found in any of the configured ciphers",
                header.version
            ))
        })?;
        key.decrypt_payload(&ciphertext[consumed..], &header, b"")
    }

    /// Encoded form of the header magic, without padding
    ///
    /// Every encoded value that carries a header starts with this string.
    pub fn encoded_magic_header(&self) -> String {
        let encoded = self.encoding.encode(MAGIC_HEADER);
        String::from_utf8_lossy(&encoded)
            .trim()
            .trim_end_matches('=')
            .to_string()
    }
}

impl CipherSource for Cipher {
    fn key_for(&self, version: u8) -> Option<&Key> {
        self.key.key_for(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn dev_cipher(always_add_header: bool) -> Cipher {
        let key = Key::new(
            b"1234567890ABCDEF",
            Some(b"1234567890ABCDEF"),
            "aes-128-cbc",
            1,
        )
        .unwrap();
        Cipher::new(key, Encoding::Base64Strict, always_add_header)
    }

    #[test]
    fn test_known_vector_without_header() {
        let key = Key::new(b"ABCDEF1234567890", Some(b"ABCDEF1234567890"), "aes-128-cbc", 1).unwrap();
        let cipher = Cipher::new(key, Encoding::Base64Strict, false);
        let encrypted = cipher.encrypt_str("987654321", &EncryptOptions::default()).unwrap();
        assert_eq!(encrypted, "yTeLjsHTa8ykoO95K0KQmg==");

        let dev = dev_cipher(false).encrypt_str("987654321", &EncryptOptions::default()).unwrap();
        assert_eq!(dev, "PUgvP1n1Zy/WKGXXa8QiWg==");
        assert_eq!(
            cipher.decrypt(encrypted.as_bytes()).unwrap(),
            Plaintext::Text("987654321".to_string())
        );
    }

    #[test]
    fn test_empty_and_none_identity() {
        let cipher = dev_cipher(true);
        assert!(cipher.encrypt(b"").unwrap().is_empty());
        assert_eq!(cipher.encrypt_str("", &EncryptOptions::default()).unwrap(), "");
        assert_eq!(cipher.decrypt(b"").unwrap(), Plaintext::Text(String::new()));
        assert_eq!(cipher.encrypt_opt(None, &EncryptOptions::default()).unwrap(), None);
        assert_eq!(cipher.decrypt_opt(None).unwrap(), None);
        assert!(cipher.binary_decrypt(b"").unwrap().is_empty());
    }

    #[test]
    fn test_header_default_applies() {
        let with = dev_cipher(true).encrypt(b"hello").unwrap();
        assert!(with.starts_with(dev_cipher(true).encoded_magic_header().as_bytes()));

        let without = dev_cipher(false).encrypt(b"hello").unwrap();
        assert!(!without.starts_with(b"QEVuQw"));

        let forced = dev_cipher(false)
            .encrypt_with(
                b"hello",
                &EncryptOptions {
                    header: Some(true),
                    ..EncryptOptions::default()
                },
            )
            .unwrap();
        assert!(forced.starts_with(b"QEVuQw"));
    }

    #[test]
    fn test_random_iv_unique_and_forces_header() {
        let cipher = dev_cipher(false);
        let a = cipher.encrypt_with(b"same input", &EncryptOptions::random_iv()).unwrap();
        let b = cipher.encrypt_with(b"same input", &EncryptOptions::random_iv()).unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with(b"QEVuQw"));
        assert_eq!(cipher.decrypt(&a).unwrap().as_bytes(), b"same input");
        assert_eq!(cipher.decrypt(&b).unwrap().as_bytes(), b"same input");
    }

    #[test]
    fn test_compression_round_trip() {
        let cipher = dev_cipher(false);
        let options = EncryptOptions {
            compress: true,
            ..EncryptOptions::default()
        };
        let text = "repetitive ".repeat(200);
        let encrypted = cipher.encrypt_with(text.as_bytes(), &options).unwrap();
        assert!(encrypted.len() < text.len());
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), Plaintext::Text(text));
    }

    #[test]
    fn test_binary_plaintext_is_tagged_binary() {
        let cipher = dev_cipher(true);
        let data = vec![0xFF, 0xFE, 0x00, 0x80];
        let encrypted = cipher.encrypt(&data).unwrap();
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), Plaintext::Binary(data));
    }

    #[test]
    fn test_encrypt_str_requires_text_encoding() {
        let cipher = Cipher::new(dev_cipher(true).key().clone(), Encoding::None, true);
        assert!(cipher.encrypt_str("x", &EncryptOptions::default()).is_err());
        let raw = cipher.encrypt(b"x").unwrap();
        assert!(raw.starts_with(MAGIC_HEADER));
    }

    #[test]
    fn test_header_version_mismatch_is_cipher_error() {
        let v1 = dev_cipher(true);
        let v2 = Cipher::random(CipherAlgorithm::Aes256Cbc, 2);
        let encrypted = v2.encrypt(b"secret").unwrap();
        assert!(matches!(v1.decrypt(&encrypted), Err(Error::Cipher(_))));
    }

    #[test]
    fn test_gcm_always_has_header() {
        let cipher = Cipher::new(
            Key::random(CipherAlgorithm::Aes128Gcm, 4),
            Encoding::Base64UrlSafe,
            false,
        );
        let encrypted = cipher.encrypt(b"aead").unwrap();
        assert!(encrypted.starts_with(cipher.encoded_magic_header().as_bytes()));
        assert_eq!(cipher.decrypt(&encrypted).unwrap().as_bytes(), b"aead");
    }

    #[test]
    fn test_encoded_magic_header() {
        assert_eq!(dev_cipher(true).encoded_magic_header(), "QEVuQw");
        let hex = Cipher::new(dev_cipher(true).key().clone(), Encoding::Base16, true);
        assert_eq!(hex.encoded_magic_header(), "40456e43");
    }

    fn algorithms() -> impl Strategy<Value = CipherAlgorithm> {
        prop_oneof![
            Just(CipherAlgorithm::Aes128Cbc),
            Just(CipherAlgorithm::Aes192Cbc),
            Just(CipherAlgorithm::Aes256Cbc),
            Just(CipherAlgorithm::Aes128Gcm),
            Just(CipherAlgorithm::Aes256Gcm),
        ]
    }

    fn encodings() -> impl Strategy<Value = Encoding> {
        prop_oneof![
            Just(Encoding::None),
            Just(Encoding::Base64),
            Just(Encoding::Base64Strict),
            Just(Encoding::Base64UrlSafe),
            Just(Encoding::Base16),
        ]
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            data in proptest::collection::vec(any::<u8>(), 0..600),
            algorithm in algorithms(),
            encoding in encodings(),
            header in any::<bool>(),
            random_iv in any::<bool>(),
            compress in any::<bool>(),
        ) {
            let cipher = Cipher::new(Key::random(algorithm, 7), encoding, header);
            let options = EncryptOptions { random_iv, compress, header: None };
            let encrypted = cipher.encrypt_with(&data, &options).unwrap();
            let decrypted = cipher.decrypt(&encrypted).unwrap();
            prop_assert_eq!(decrypted.into_bytes(), data);
        }
    }
}
