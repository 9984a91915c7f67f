//! Environment variable keystore

use super::{cipher_config, inline_kek, GenerateOptions, Keystore};
use crate::config::{CipherConfig, KeySource};
use crate::crypto::{Key, KeyWrapper};
use crate::encoding::Encoding;
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::info;
use zeroize::Zeroizing;

/// Keystore reading a base64 wrapped key from an environment variable
///
/// The process cannot set variables for its parent, so `write` only logs
/// the `export` line for the operator to apply.
pub struct EnvironmentKeystore {
    key_env_var: String,
    key_encrypting_key: Arc<dyn KeyWrapper>,
}

impl EnvironmentKeystore {
    pub fn new(key_env_var: &str, key_encrypting_key: Arc<dyn KeyWrapper>) -> Self {
        EnvironmentKeystore {
            key_env_var: key_env_var.to_string(),
            key_encrypting_key,
        }
    }

    pub fn key_env_var(&self) -> &str {
        &self.key_env_var
    }

    /// Shell line that publishes `key` in wrapped form
    pub fn export_line(&self, key: &[u8]) -> Result<String> {
        let wrapped = self.key_encrypting_key.wrap_key(key)?;
        let encoded = Encoding::Base64Strict.encode(&wrapped);
        Ok(format!(
            "export {}=\"{}\"",
            self.key_env_var,
            String::from_utf8_lossy(&encoded)
        ))
    }

    /// Variable name for a key version, e.g. `MY_APP_PRODUCTION_V3`
    pub fn env_var_name(app_name: &str, environment: &str, version: u8) -> String {
        format!("{}_{}_v{}", app_name, environment, version)
            .replace('-', "_")
            .to_uppercase()
    }

    /// Generate a data key wrapped by an inline key-encrypting key
    pub fn generate_data_key(options: &GenerateOptions) -> Result<CipherConfig> {
        let algorithm = options.algorithm()?;
        let version = options.version();
        let dek = options.data_key()?;
        let kek = Key::random(algorithm.wrapping_algorithm(), 0);

        let key_env_var =
            EnvironmentKeystore::env_var_name(&options.app_name, &options.environment, version);
        EnvironmentKeystore::new(&key_env_var, Arc::new(kek.clone())).write(dek.key())?;

        let dek = Key::with_algorithm(dek.key(), dek.iv(), algorithm, version)?;
        Ok(cipher_config(
            &dek,
            KeySource::Environment {
                key_env_var,
                key_encrypting_key: inline_kek(&kek),
            },
        ))
    }
}

impl Keystore for EnvironmentKeystore {
    fn read(&self) -> Result<Zeroizing<Vec<u8>>> {
        let value = std::env::var(&self.key_env_var).map_err(|_| {
            Error::Config(format!(
                "The environment variable '{}' must be set with the encrypted encryption key.",
                self.key_env_var
            ))
        })?;
        let wrapped = Encoding::Base64Strict.decode(value.trim().as_bytes())?;
        self.key_encrypting_key.unwrap_key(&wrapped)
    }

    fn write(&self, key: &[u8]) -> Result<()> {
        info!(
            "Set this environment variable to deploy the key: {}",
            self.export_line(key)?
        );
        Ok(())
    }
}
