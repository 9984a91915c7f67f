//! symmetric-encryption - Symmetric encryption with envelope key management
//!
//! Values are encrypted with versioned data keys. Each data key is stored
//! wrapped by a key-encrypting key in a keystore (file, environment
//! variable, configuration, AWS KMS or Google Cloud KMS), so keys can be
//! rotated while data encrypted under older versions stays readable.
//! Large data is handled by the streaming [`stream::Reader`] and
//! [`stream::Writer`].

pub mod cipher;
pub mod compression;
pub mod config;
pub mod crypto;
pub mod encoding;
pub mod error;
pub mod header;
pub mod keystore;
pub mod stream;

pub use cipher::{Cipher, CipherRegistry, EncryptOptions, Plaintext};
pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cipher::{Cipher, CipherRegistry, EncryptOptions, Plaintext};
    pub use crate::config::Config;
    pub use crate::crypto::{CipherAlgorithm, Key};
    pub use crate::encoding::Encoding;
    pub use crate::error::{Error, Result};
    pub use crate::keystore::KeystoreContext;
    pub use crate::stream::{Reader, ReaderOptions, Writer, WriterOptions};
}
