//! In-memory keystore for wrapped keys held directly in configuration

use super::{cipher_config, inline_kek, GenerateOptions, Keystore};
use crate::config::{CipherConfig, KeySource};
use crate::crypto::{Key, KeyWrapper};
use crate::encoding::Encoding;
use crate::error::{Error, Result};
use std::sync::{Arc, Mutex};
use zeroize::Zeroizing;

/// Keystore over a base64 wrapped key string
pub struct MemoryKeystore {
    encrypted_key: Mutex<String>,
    key_encrypting_key: Arc<dyn KeyWrapper>,
}

impl MemoryKeystore {
    pub fn new(encrypted_key: &str, key_encrypting_key: Arc<dyn KeyWrapper>) -> Self {
        MemoryKeystore {
            encrypted_key: Mutex::new(encrypted_key.to_string()),
            key_encrypting_key,
        }
    }

    /// Current base64 wrapped key
    pub fn encrypted_key(&self) -> Result<String> {
        Ok(self.lock()?.clone())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, String>> {
        self.encrypted_key
            .lock()
            .map_err(|_| Error::Config("Memory keystore lock poisoned".to_string()))
    }

    /// Generate a data key wrapped by an inline key-encrypting key
    pub fn generate_data_key(options: &GenerateOptions) -> Result<CipherConfig> {
        let algorithm = options.algorithm()?;
        let version = options.version();
        let dek = options.data_key()?;
        let kek = Key::random(algorithm.wrapping_algorithm(), 0);

        let store = MemoryKeystore::new("", Arc::new(kek.clone()));
        store.write(dek.key())?;

        let dek = Key::with_algorithm(dek.key(), dek.iv(), algorithm, version)?;
        Ok(cipher_config(
            &dek,
            KeySource::Memory {
                encrypted_key: store.encrypted_key()?,
                key_encrypting_key: inline_kek(&kek),
            },
        ))
    }
}

impl Keystore for MemoryKeystore {
    fn read(&self) -> Result<Zeroizing<Vec<u8>>> {
        let encoded = self.encrypted_key()?;
        if encoded.trim().is_empty() {
            return Err(Error::Config(
                "Memory keystore has no encrypted key".to_string(),
            ));
        }
        let wrapped = Encoding::Base64Strict.decode(encoded.trim().as_bytes())?;
        self.key_encrypting_key.unwrap_key(&wrapped)
    }

    fn write(&self, key: &[u8]) -> Result<()> {
        let wrapped = self.key_encrypting_key.wrap_key(key)?;
        let encoded = String::from_utf8_lossy(&Encoding::Base64Strict.encode(&wrapped)).into_owned();
        *self.lock()? = encoded;
        Ok(())
    }
}
