//! Error types for symmetric-encryption

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for symmetric-encryption
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors: missing key material, missing files or env vars,
    // wrong permissions. Raised at keystore resolution time.
    #[error("Configuration error: {0}")]
    Config(String),

    // Header references an unconfigured cipher version, or framing is malformed
    #[error("Cipher error: {0}")]
    Cipher(String),

    // Crypto errors
    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Invalid key length for {cipher}: expected {expected}, got {got}")]
    InvalidKeyLength {
        cipher: String,
        expected: usize,
        got: usize,
    },

    #[error("Invalid IV length for {cipher}: expected {expected}, got {got}")]
    InvalidIvLength {
        cipher: String,
        expected: usize,
        got: usize,
    },

    // Text encoding errors
    #[error("Encoding error: {0}")]
    Encoding(String),

    // Cloud KMS errors
    #[error("KMS error: {0}")]
    Kms(String),

    #[error("KMS master key not found: {0}")]
    KmsNotFound(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Whether this error came out of the cipher engine while decrypting.
    ///
    /// Callers probing whether a value is decryptable treat these as
    /// "not decryptable" rather than as hard failures.
    pub fn is_decryption_failure(&self) -> bool {
        matches!(self, Error::Decryption(_))
    }

    /// Recover a crate error that was carried through an `io::Error`
    ///
    /// Stream adapters implement `std::io::Read`/`Write` and have to wrap
    /// decryption failures in `io::Error`; this unwraps them again.
    pub fn from_io(e: io::Error) -> Self {
        if e.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            if let Some(inner) = e.into_inner() {
                if let Ok(err) = inner.downcast::<Error>() {
                    return *err;
                }
            }
            return Error::Io(io::Error::new(io::ErrorKind::Other, "stream error"));
        }
        Error::Io(e)
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(inner) => inner,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Error::Encoding(format!("Invalid base64: {}", e))
    }
}

impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        Error::Encoding(format!("Invalid hex: {}", e))
    }
}
