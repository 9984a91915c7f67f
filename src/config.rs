//! Configuration management for symmetric-encryption
//!
//! A configuration file maps environment names to an ordered cipher list.
//! The first cipher of an environment is its primary. Files may be YAML or
//! JSON (chosen by extension) and support `${VAR}` substitution.

use crate::crypto::{CipherAlgorithm, DEFAULT_CIPHER};
use crate::encoding::Encoding;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

/// Environment variable selecting the active environment
pub const ENVIRONMENT_VAR: &str = "SYMMETRIC_ENCRYPTION_ENV";

/// Environment used when none is selected
pub const DEFAULT_ENVIRONMENT: &str = "development";

/// Default name of the configuration file
pub const DEFAULT_CONFIG_FILE: &str = "symmetric-encryption.yml";

/// Complete configuration: environment name to cipher list
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Config {
    pub environments: BTreeMap<String, EnvironmentConfig>,
}

/// Ciphers configured for one environment, primary first
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EnvironmentConfig {
    pub ciphers: Vec<CipherConfig>,
}

/// One versioned cipher
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CipherConfig {
    /// Cipher name, e.g. `aes-256-cbc`
    #[serde(default = "default_cipher_name")]
    pub cipher_name: String,

    /// Key version written into headers
    #[serde(default)]
    pub version: u8,

    /// Write a header even when no per-value option requires one
    #[serde(default = "default_true")]
    pub always_add_header: bool,

    /// Encoding applied to ciphertext
    #[serde(default)]
    pub encoding: Encoding,

    /// Base64 IV; omitted for ciphers that always use random IVs
    #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
    pub iv: Option<Vec<u8>>,

    /// Where the data key comes from
    pub key_source: KeySource,
}

/// Location of a data key and how to unwrap it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeySource {
    /// Unwrapped key held directly in configuration
    Inline {
        #[serde(with = "base64_bytes")]
        key: Vec<u8>,
    },

    /// Wrapped key in a local file
    File {
        key_filename: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key_encrypting_key: Option<Box<KeyEncryptingKeyConfig>>,
    },

    /// Base64 wrapped key in an environment variable
    Environment {
        key_env_var: String,
        key_encrypting_key: Box<KeyEncryptingKeyConfig>,
    },

    /// Base64 wrapped key held in configuration
    Memory {
        encrypted_key: String,
        key_encrypting_key: Box<KeyEncryptingKeyConfig>,
    },

    /// Key wrapped by an AWS KMS master key, one file per region
    Aws {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
        master_key_alias: String,
        key_files: Vec<AwsKeyFile>,
        #[serde(default = "default_true")]
        auto_create_master_key: bool,
    },

    /// Key wrapped by a Google Cloud KMS crypto key
    Gcp {
        key_filename: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        crypto_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        location_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        app_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        environment: Option<String>,
        #[serde(default)]
        auto_create_master_key: bool,
    },
}

impl KeySource {
    /// Short name of the backend
    pub fn kind(&self) -> &'static str {
        match self {
            KeySource::Inline { .. } => "inline",
            KeySource::File { .. } => "file",
            KeySource::Environment { .. } => "environment",
            KeySource::Memory { .. } => "memory",
            KeySource::Aws { .. } => "aws",
            KeySource::Gcp { .. } => "gcp",
        }
    }
}

/// Encrypted data key file for one AWS region
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AwsKeyFile {
    pub region: String,
    pub file_name: String,
}

/// Key that wraps a data key
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyEncryptingKeyConfig {
    /// Symmetric key, itself resolved from another key source
    Symmetric {
        #[serde(default = "default_cipher_name")]
        cipher_name: String,
        #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
        iv: Option<Vec<u8>>,
        source: KeySource,
    },

    /// RSA private key in PEM form
    Rsa { private_rsa_key: String },
}

fn default_cipher_name() -> String {
    DEFAULT_CIPHER.name().to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a file (YAML or JSON), with environment variable substitution
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let content = fs::read_to_string(path_ref).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file {}: {}",
                path_ref.display(),
                e
            ))
        })?;

        let content = Self::substitute_env_vars(&content);

        let config: Config = if is_yaml(path_ref) {
            serde_yaml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse YAML config: {}", e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse JSON config: {}", e)))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Substitute environment variables in config content
    /// Supports ${VAR_NAME} syntax; unset variables are left as-is
    fn substitute_env_vars(content: &str) -> String {
        let re = match regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}") {
            Ok(re) => re,
            Err(_) => return content.to_string(),
        };

        re.replace_all(content, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
    }

    /// Save configuration to a file (format determined by extension)
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path_ref = path.as_ref();

        let content = if is_yaml(path_ref) {
            serde_yaml::to_string(self).map_err(|e| {
                Error::Config(format!("Failed to serialize config to YAML: {}", e))
            })?
        } else {
            serde_json::to_string_pretty(self).map_err(|e| {
                Error::Config(format!("Failed to serialize config to JSON: {}", e))
            })?
        };

        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        write_private(path_ref, content.as_bytes())
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        for (name, env) in &self.environments {
            env.validate()
                .map_err(|e| Error::Config(format!("Environment '{}': {}", name, e)))?;
        }
        Ok(())
    }

    /// Configuration for one environment
    pub fn environment(&self, name: &str) -> Result<&EnvironmentConfig> {
        self.environments.get(name).ok_or_else(|| {
            Error::Config(format!(
                "No configuration for environment '{}' (available: {})",
                name,
                self.environment_names().join(", ")
            ))
        })
    }

    pub fn environment_names(&self) -> Vec<&str> {
        self.environments.keys().map(String::as_str).collect()
    }

    /// Active environment name from `SYMMETRIC_ENCRYPTION_ENV`
    pub fn current_environment() -> String {
        std::env::var(ENVIRONMENT_VAR)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string())
    }
}

impl EnvironmentConfig {
    /// Validate one environment's cipher list
    pub fn validate(&self) -> Result<()> {
        if self.ciphers.is_empty() {
            return Err(Error::Config("At least one cipher is required".to_string()));
        }

        let mut versions = HashSet::new();
        for cipher in &self.ciphers {
            CipherAlgorithm::from_name(&cipher.cipher_name)
                .map_err(|e| Error::Config(e.to_string()))?;
            if !versions.insert(cipher.version) {
                return Err(Error::Config(format!(
                    "Duplicate cipher version {}",
                    cipher.version
                )));
            }
        }

        Ok(())
    }

    /// The primary cipher
    pub fn primary(&self) -> Option<&CipherConfig> {
        self.ciphers.first()
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Base64 serialization for byte vectors
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(s.trim())
            .map_err(serde::de::Error::custom)
    }
}

/// Base64 serialization for optional byte vectors
mod base64_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        match s {
            Some(s) if !s.trim().is_empty() => STANDARD
                .decode(s.trim())
                .map(Some)
                .map_err(serde::de::Error::custom),
            _ => Ok(None),
        }
    }
}

/// Configuration may hold inline keys, so only the owner can read it
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    file.write_all(data)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    const YAML: &str = r#"
development:
  ciphers:
    - cipher_name: aes-128-cbc
      version: 1
      always_add_header: false
      iv: MTIzNDU2Nzg5MEFCQ0RFRg==
      key_source:
        type: inline
        key: MTIzNDU2Nzg5MEFCQ0RFRg==
production:
  ciphers:
    - version: 2
      iv: MTIzNDU2Nzg5MEFCQ0RFRg==
      key_source:
        type: file
        key_filename: /etc/app/app_production_v2.encrypted_key
        key_encrypting_key:
          type: symmetric
          iv: MTIzNDU2Nzg5MEFCQ0RFRg==
          source:
            type: memory
            encrypted_key: c2VjcmV0
            key_encrypting_key:
              type: symmetric
              source:
                type: file
                key_filename: /etc/app/app_production_v2.kekek
    - version: 1
      encoding: base16
      key_source:
        type: aws
        master_key_alias: alias/symmetric-encryption/app/production
        key_files:
          - region: us-east-1
            file_name: app_production_us-east-1_v1.encrypted_key
"#;

    fn write_yaml(dir: &TempDir, content: &str) -> std::path::PathBuf {
        let path = dir.path().join("config.yml");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_load_yaml() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(write_yaml(&dir, YAML)).unwrap();

        assert_eq!(config.environment_names(), vec!["development", "production"]);

        let dev = config.environment("development").unwrap();
        let cipher = &dev.ciphers[0];
        assert_eq!(cipher.cipher_name, "aes-128-cbc");
        assert!(!cipher.always_add_header);
        assert_eq!(cipher.encoding, Encoding::Base64Strict);
        assert_eq!(cipher.iv.as_deref(), Some(&b"1234567890ABCDEF"[..]));
        assert_eq!(
            cipher.key_source,
            KeySource::Inline {
                key: b"1234567890ABCDEF".to_vec()
            }
        );

        let prod = config.environment("production").unwrap();
        assert_eq!(prod.primary().unwrap().cipher_name, "aes-256-cbc");
        assert!(prod.primary().unwrap().always_add_header);
        assert_eq!(prod.ciphers[1].encoding, Encoding::Base16);
        match &prod.ciphers[1].key_source {
            KeySource::Aws {
                auto_create_master_key,
                key_files,
                ..
            } => {
                assert!(*auto_create_master_key);
                assert_eq!(key_files[0].region, "us-east-1");
            }
            other => panic!("unexpected key source {:?}", other),
        }
        match &prod.ciphers[0].key_source {
            KeySource::File {
                key_encrypting_key: Some(kek),
                ..
            } => match kek.as_ref() {
                KeyEncryptingKeyConfig::Symmetric { source, .. } => {
                    assert_eq!(source.kind(), "memory")
                }
                other => panic!("unexpected kek {:?}", other),
            },
            other => panic!("unexpected key source {:?}", other),
        }
    }

    #[test]
    fn test_missing_environment() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(write_yaml(&dir, YAML)).unwrap();
        assert!(matches!(config.environment("staging"), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let mut env = EnvironmentConfig::default();
        assert!(env.validate().is_err());

        let cipher = CipherConfig {
            cipher_name: "aes-256-cbc".to_string(),
            version: 1,
            always_add_header: true,
            encoding: Encoding::Base64Strict,
            iv: None,
            key_source: KeySource::Inline { key: vec![0; 32] },
        };
        env.ciphers = vec![cipher.clone(), cipher.clone()];
        assert!(env.validate().is_err());

        env.ciphers = vec![CipherConfig {
            cipher_name: "blowfish".to_string(),
            ..cipher
        }];
        assert!(env.validate().is_err());
    }

    #[test]
    fn test_save_and_reload_json_and_yaml() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(write_yaml(&dir, YAML)).unwrap();

        for name in ["out.json", "out.yaml"] {
            let path = dir.path().join("nested").join(name);
            config.save(&path).unwrap();
            assert_eq!(Config::load(&path).unwrap(), config);
        }
    }

    #[test]
    fn test_save_is_owner_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.yml");
        std::fs::write(&path, "").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        Config::load(write_yaml(&dir, YAML)).unwrap().save(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    #[serial]
    fn test_env_var_substitution() {
        std::env::set_var("SE_TEST_KEY_PATH", "/var/keys/test.key");
        let content = r#"
test:
  ciphers:
    - key_source:
        type: file
        key_filename: ${SE_TEST_KEY_PATH}
"#;
        let dir = TempDir::new().unwrap();
        let config = Config::load(write_yaml(&dir, content)).unwrap();
        std::env::remove_var("SE_TEST_KEY_PATH");

        match &config.environment("test").unwrap().ciphers[0].key_source {
            KeySource::File { key_filename, .. } => {
                assert_eq!(key_filename, "/var/keys/test.key")
            }
            other => panic!("unexpected key source {:?}", other),
        }
    }

    #[test]
    #[serial]
    fn test_current_environment() {
        std::env::remove_var(ENVIRONMENT_VAR);
        assert_eq!(Config::current_environment(), "development");
        std::env::set_var(ENVIRONMENT_VAR, "production");
        assert_eq!(Config::current_environment(), "production");
        std::env::remove_var(ENVIRONMENT_VAR);
    }
}
