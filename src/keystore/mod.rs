//! Keystores for data encryption keys
//!
//! A keystore persists a wrapped data key and unwraps it on read. Wrapping
//! is done by a local key-encrypting key (file, environment, memory) or by a
//! cloud KMS (AWS, GCP). Key sources nest: the key-encrypting key of one
//! keystore can itself come from another keystore, to any depth. Everything
//! is resolved once, when configuration is loaded.
//!
//! Key rotation mints a new version through [`generate_data_key`] and puts
//! it in front of the existing ciphers with [`rotate_keys`].

mod aws;
mod environment;
mod file;
mod gcp;
mod kms;
mod memory;

pub use aws::{AwsKeystore, AwsKmsClient, AwsKmsConnector, DEFAULT_AWS_REGIONS};
pub use environment::EnvironmentKeystore;
pub use file::FileKeystore;
pub use gcp::{crypto_key_path, GcpKeystore, GcpKmsClient, GcpKmsConnector};
pub use kms::{with_master_key, DataKey, KmsClient, KmsConnector};
pub use memory::MemoryKeystore;

use crate::config::{
    CipherConfig, Config, EnvironmentConfig, KeyEncryptingKeyConfig, KeySource,
};
use crate::crypto::{CipherAlgorithm, Key, KeyEncryptionKey, KeyWrapper, DEFAULT_CIPHER};
use crate::encoding::Encoding;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Environments that get the fixed development configuration
pub const DEV_ENVIRONMENTS: [&str; 2] = ["development", "test"];

/// Environments generated when none are named
pub const DEFAULT_ENVIRONMENTS: [&str; 4] = ["development", "test", "release", "production"];

/// Storage for one wrapped data key
pub trait Keystore {
    /// Read and unwrap the data key
    fn read(&self) -> Result<Zeroizing<Vec<u8>>>;

    /// Wrap and persist a data key
    fn write(&self, key: &[u8]) -> Result<()>;
}

/// Cloud connectors used when resolving or generating keys
#[derive(Clone)]
pub struct KeystoreContext {
    pub aws: Arc<dyn KmsConnector>,
    pub gcp: Arc<dyn KmsConnector>,
}

impl Default for KeystoreContext {
    fn default() -> Self {
        KeystoreContext {
            aws: Arc::new(AwsKmsConnector),
            gcp: Arc::new(GcpKmsConnector::default()),
        }
    }
}

/// Backend used when generating new keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeystoreKind {
    File,
    Environment,
    Memory,
    Aws {
        regions: Vec<String>,
        auto_create_master_key: bool,
    },
    Gcp {
        project_id: Option<String>,
        location_id: Option<String>,
    },
}

impl KeystoreKind {
    /// Backend that produced an existing key source
    ///
    /// Inline keys have no backend and return `None`.
    pub fn of(source: &KeySource) -> Option<Self> {
        match source {
            KeySource::Inline { .. } => None,
            KeySource::File { .. } => Some(KeystoreKind::File),
            KeySource::Environment { .. } => Some(KeystoreKind::Environment),
            KeySource::Memory { .. } => Some(KeystoreKind::Memory),
            KeySource::Aws {
                key_files,
                auto_create_master_key,
                ..
            } => Some(KeystoreKind::Aws {
                regions: key_files.iter().map(|f| f.region.clone()).collect(),
                auto_create_master_key: *auto_create_master_key,
            }),
            KeySource::Gcp {
                project_id,
                location_id,
                ..
            } => Some(KeystoreKind::Gcp {
                project_id: project_id.clone(),
                location_id: location_id.clone(),
            }),
        }
    }
}

/// Options for generating one new data key
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub app_name: String,
    pub environment: String,
    pub cipher_name: String,
    /// Directory for key files
    pub key_path: PathBuf,
    /// Version being superseded; the new key gets the next one
    pub previous_version: u8,
    /// Use this key instead of generating one
    pub dek: Option<Key>,
}

impl GenerateOptions {
    pub fn new(app_name: &str, environment: &str) -> Self {
        GenerateOptions {
            app_name: app_name.to_string(),
            environment: environment.to_string(),
            cipher_name: DEFAULT_CIPHER.name().to_string(),
            key_path: default_key_path(),
            previous_version: 0,
            dek: None,
        }
    }

    pub(crate) fn algorithm(&self) -> Result<CipherAlgorithm> {
        CipherAlgorithm::from_name(&self.cipher_name)
    }

    pub(crate) fn version(&self) -> u8 {
        next_version(self.previous_version)
    }

    /// The supplied data key, or a new random one
    pub(crate) fn data_key(&self) -> Result<Key> {
        match &self.dek {
            Some(dek) => Ok(dek.clone()),
            None => Ok(Key::random(self.algorithm()?, self.version())),
        }
    }
}

/// Options for [`rotate_keys`]
#[derive(Debug, Clone, Default)]
pub struct RotateOptions {
    /// Environments to rotate; empty means all
    pub environments: Vec<String>,
    pub app_name: String,
    /// Insert the new key second so it can be deployed before it is used
    pub rolling_deploy: bool,
    /// Backend for the new keys; defaults to the current primary's backend
    pub keystore: Option<KeystoreKind>,
    /// Directory for key files; defaults to the current key file's directory
    pub key_path: Option<PathBuf>,
}

/// Default directory for key files
pub fn default_key_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".symmetric-encryption")
}

/// Version that follows `version`, wrapping from 255 to 1
pub fn next_version(version: u8) -> u8 {
    if version >= u8::MAX {
        1
    } else {
        version + 1
    }
}

/// Resolve a cipher configuration to a key
pub fn read_key(config: &CipherConfig, ctx: &KeystoreContext) -> Result<Key> {
    let algorithm = CipherAlgorithm::from_name(&config.cipher_name)?;
    let material = read_source(&config.key_source, ctx)?;
    debug!(
        version = config.version,
        source = config.key_source.kind(),
        "Resolved data key"
    );
    Key::with_algorithm(&material, config.iv.as_deref(), algorithm, config.version)
}

/// Read the raw key bytes a key source points to
pub fn read_source(source: &KeySource, ctx: &KeystoreContext) -> Result<Zeroizing<Vec<u8>>> {
    match source {
        KeySource::Inline { key } => Ok(Zeroizing::new(key.clone())),
        other => keystore_for(other, ctx)?.read(),
    }
}

/// Build the keystore a key source describes
pub fn keystore_for(source: &KeySource, ctx: &KeystoreContext) -> Result<Box<dyn Keystore>> {
    let keystore: Box<dyn Keystore> = match source {
        KeySource::Inline { .. } => {
            return Err(Error::Config(
                "Inline keys are not held in a keystore".to_string(),
            ))
        }
        KeySource::File {
            key_filename,
            key_encrypting_key,
        } => {
            let kek = key_encrypting_key
                .as_deref()
                .map(|kek| key_wrapper(kek, ctx))
                .transpose()?;
            Box::new(FileKeystore::new(key_filename, kek))
        }
        KeySource::Environment {
            key_env_var,
            key_encrypting_key,
        } => Box::new(EnvironmentKeystore::new(
            key_env_var,
            key_wrapper(key_encrypting_key, ctx)?,
        )),
        KeySource::Memory {
            encrypted_key,
            key_encrypting_key,
        } => Box::new(MemoryKeystore::new(
            encrypted_key,
            key_wrapper(key_encrypting_key, ctx)?,
        )),
        KeySource::Aws {
            region,
            master_key_alias,
            key_files,
            auto_create_master_key,
        } => Box::new(AwsKeystore::new(
            aws::resolve_region(region.as_deref())?,
            key_files.clone(),
            master_key_alias,
            *auto_create_master_key,
            ctx.aws.clone(),
        )),
        KeySource::Gcp {
            key_filename,
            crypto_key,
            project_id,
            location_id,
            app_name,
            environment,
            auto_create_master_key,
        } => {
            let crypto_key = match crypto_key {
                Some(key) => key.clone(),
                None => gcp::resolve_crypto_key(
                    project_id.as_deref(),
                    location_id.as_deref(),
                    app_name.as_deref(),
                    environment.as_deref(),
                )?,
            };
            Box::new(GcpKeystore::new(
                key_filename,
                crypto_key,
                *auto_create_master_key,
                ctx.gcp.clone(),
            ))
        }
    };
    Ok(keystore)
}

/// Build the wrapper a key-encrypting key configuration describes
pub fn key_wrapper(
    config: &KeyEncryptingKeyConfig,
    ctx: &KeystoreContext,
) -> Result<Arc<dyn KeyWrapper>> {
    match config {
        KeyEncryptingKeyConfig::Symmetric {
            cipher_name,
            iv,
            source,
        } => {
            let material = read_source(source, ctx)?;
            let key = Key::new(&material, iv.as_deref(), cipher_name, 0)?;
            key.check_wrapping()?;
            Ok(Arc::new(key))
        }
        KeyEncryptingKeyConfig::Rsa { private_rsa_key } => {
            Ok(Arc::new(KeyEncryptionKey::from_pem(private_rsa_key)?))
        }
    }
}

/// Configuration fragment for a symmetric key-encrypting key held inline
pub(crate) fn inline_kek(kek: &Key) -> Box<KeyEncryptingKeyConfig> {
    Box::new(KeyEncryptingKeyConfig::Symmetric {
        cipher_name: kek.cipher_name().to_string(),
        iv: kek.iv().map(|iv| iv.to_vec()),
        source: KeySource::Inline {
            key: kek.key().to_vec(),
        },
    })
}

/// Cipher configuration for a newly generated key
pub(crate) fn cipher_config(dek: &Key, key_source: KeySource) -> CipherConfig {
    CipherConfig {
        cipher_name: dek.cipher_name().to_string(),
        version: dek.version(),
        always_add_header: true,
        encoding: Encoding::Base64Strict,
        iv: dek.iv().map(|iv| iv.to_vec()),
        key_source,
    }
}

/// Generate, wrap and persist a new data key
///
/// Returns the cipher configuration that reads it back.
pub fn generate_data_key(
    kind: &KeystoreKind,
    options: &GenerateOptions,
    ctx: &KeystoreContext,
) -> Result<CipherConfig> {
    let config = match kind {
        KeystoreKind::File => FileKeystore::generate_data_key(options)?,
        KeystoreKind::Environment => EnvironmentKeystore::generate_data_key(options)?,
        KeystoreKind::Memory => MemoryKeystore::generate_data_key(options)?,
        KeystoreKind::Aws {
            regions,
            auto_create_master_key,
        } => AwsKeystore::generate_data_key(
            options,
            regions,
            *auto_create_master_key,
            ctx.aws.clone(),
        )?,
        KeystoreKind::Gcp {
            project_id,
            location_id,
        } => GcpKeystore::generate_data_key(
            options,
            project_id.as_deref(),
            location_id.as_deref(),
            ctx.gcp.clone(),
        )?,
    };

    info!(
        app = %options.app_name,
        environment = %options.environment,
        version = config.version,
        keystore = config.key_source.kind(),
        "Generated data key"
    );
    Ok(config)
}

/// Fixed configuration used by development and test environments
pub fn dev_config() -> EnvironmentConfig {
    EnvironmentConfig {
        ciphers: vec![CipherConfig {
            cipher_name: "aes-128-cbc".to_string(),
            version: 1,
            always_add_header: true,
            encoding: Encoding::Base64Strict,
            iv: Some(b"1234567890ABCDEF".to_vec()),
            key_source: KeySource::Inline {
                key: b"1234567890ABCDEF".to_vec(),
            },
        }],
    }
}

/// Generate a complete configuration for several environments
///
/// Development and test get [`dev_config`]; every other environment gets a
/// freshly generated key in `kind`.
pub fn generate_data_keys(
    kind: &KeystoreKind,
    environments: &[String],
    template: &GenerateOptions,
    ctx: &KeystoreContext,
) -> Result<Config> {
    let mut config = Config::default();
    let defaults: Vec<String>;
    let environments = if environments.is_empty() {
        defaults = DEFAULT_ENVIRONMENTS.iter().map(|e| e.to_string()).collect();
        &defaults[..]
    } else {
        environments
    };

    for environment in environments {
        let env_config = if DEV_ENVIRONMENTS.contains(&environment.as_str()) {
            dev_config()
        } else {
            let options = GenerateOptions {
                environment: environment.clone(),
                ..template.clone()
            };
            EnvironmentConfig {
                ciphers: vec![generate_data_key(kind, &options, ctx)?],
            }
        };
        config.environments.insert(environment.clone(), env_config);
    }

    Ok(config)
}

/// Add a new key version to each environment
///
/// Environments whose primary key is held inline are skipped. The new
/// cipher becomes the primary, or the first secondary for a rolling deploy.
/// Returns the names of the rotated environments.
pub fn rotate_keys(
    config: &mut Config,
    options: &RotateOptions,
    ctx: &KeystoreContext,
) -> Result<Vec<String>> {
    let names: Vec<String> = if options.environments.is_empty() {
        config.environments.keys().cloned().collect()
    } else {
        options.environments.clone()
    };

    let mut rotated = Vec::new();
    for name in names {
        let env = config
            .environments
            .get_mut(&name)
            .ok_or_else(|| Error::Config(format!("No configuration for environment '{}'", name)))?;
        let primary = env
            .ciphers
            .first()
            .ok_or_else(|| Error::Config(format!("Environment '{}' has no ciphers", name)))?;

        let Some(current_kind) = KeystoreKind::of(&primary.key_source) else {
            info!(environment = %name, "Skipping rotation of inline key");
            continue;
        };

        let kind = options.keystore.clone().unwrap_or(current_kind);
        let key_path = options
            .key_path
            .clone()
            .or_else(|| key_directory(&primary.key_source))
            .unwrap_or_else(default_key_path);
        let used: Vec<u8> = env.ciphers.iter().map(|c| c.version).collect();
        let version = unused_version(&used).ok_or_else(|| {
            Error::Config(format!("Environment '{}' has no free key versions", name))
        })?;
        let previous_version = version - 1;

        let generate = GenerateOptions {
            app_name: options.app_name.clone(),
            environment: name.clone(),
            cipher_name: primary.cipher_name.clone(),
            key_path,
            previous_version,
            dek: None,
        };
        let new_cipher = generate_data_key(&kind, &generate, ctx)?;
        info!(
            environment = %name,
            version = new_cipher.version,
            rolling_deploy = options.rolling_deploy,
            "Rotated data key"
        );

        let position = if options.rolling_deploy { 1 } else { 0 };
        env.ciphers.insert(position, new_cipher);
        rotated.push(name);
    }

    Ok(rotated)
}

/// Version after the highest one in use, skipping any still held after wrapping past 255
fn unused_version(used: &[u8]) -> Option<u8> {
    let mut version = next_version(used.iter().copied().max().unwrap_or(0));
    for _ in 0..u8::MAX {
        if !used.contains(&version) {
            return Some(version);
        }
        version = next_version(version);
    }
    None
}

fn key_directory(source: &KeySource) -> Option<PathBuf> {
    let file = match source {
        KeySource::File { key_filename, .. } | KeySource::Gcp { key_filename, .. } => key_filename,
        KeySource::Aws { key_files, .. } => &key_files.first()?.file_name,
        _ => return None,
    };
    Path::new(file).parent().map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::kms::testing::{context, FakeKms};
    use super::*;
    use crate::cipher::{CipherRegistry, EncryptOptions};
    use tempfile::TempDir;

    fn options(dir: &TempDir, environment: &str) -> GenerateOptions {
        GenerateOptions {
            key_path: dir.path().to_path_buf(),
            ..GenerateOptions::new("my_app", environment)
        }
    }

    #[test]
    fn test_next_version_wraps() {
        assert_eq!(next_version(0), 1);
        assert_eq!(next_version(41), 42);
        assert_eq!(next_version(254), 255);
        assert_eq!(next_version(255), 1);
    }

    #[test]
    fn test_read_inline_key() {
        let key = read_key(&dev_config().ciphers[0], &KeystoreContext::default()).unwrap();
        assert_eq!(key.key(), b"1234567890ABCDEF");
        assert_eq!(key.version(), 1);
        assert_eq!(key.cipher_name(), "aes-128-cbc");
    }

    #[test]
    fn test_generated_file_key_resolves() {
        let dir = TempDir::new().unwrap();
        let ctx = KeystoreContext::default();
        let config = generate_data_key(&KeystoreKind::File, &options(&dir, "production"), &ctx)
            .unwrap();
        assert_eq!(config.version, 1);

        let key = read_key(&config, &ctx).unwrap();
        assert_eq!(key.algorithm(), CipherAlgorithm::Aes256Cbc);
        assert_eq!(key.version(), 1);
    }

    #[test]
    fn test_rsa_kek() {
        let dir = TempDir::new().unwrap();
        let rsa = KeyEncryptionKey::generate(1024).unwrap();
        let dek = Key::random(CipherAlgorithm::Aes128Cbc, 3);
        let path = dir.path().join("rsa.key");

        let store = FileKeystore::new(&path, Some(Arc::new(rsa) as Arc<dyn KeyWrapper>));
        store.write(dek.key()).unwrap();

        // A different RSA key cannot unwrap it
        let other_kek = KeyEncryptionKey::generate(1024).unwrap();
        let other = FileKeystore::new(&path, Some(Arc::new(other_kek) as Arc<dyn KeyWrapper>));
        assert!(other.read().is_err());
        assert_eq!(&store.read().unwrap()[..], dek.key());
    }

    #[test]
    fn test_generate_data_keys_uses_dev_config() {
        let dir = TempDir::new().unwrap();
        let ctx = KeystoreContext::default();
        let config = generate_data_keys(
            &KeystoreKind::Memory,
            &[],
            &options(&dir, "unused"),
            &ctx,
        )
        .unwrap();

        assert_eq!(
            config.environment_names(),
            vec!["development", "production", "release", "test"]
        );
        assert_eq!(config.environment("test").unwrap(), &dev_config());
        let prod = config.environment("production").unwrap();
        assert_eq!(prod.ciphers[0].key_source.kind(), "memory");
        config.validate().unwrap();

        let registry = CipherRegistry::from_config(prod, &ctx).unwrap();
        let encrypted = registry.encrypt_str("hello", &EncryptOptions::default()).unwrap();
        assert_eq!(registry.decrypt(encrypted.as_bytes(), None).unwrap().as_bytes(), b"hello");
    }

    #[test]
    fn test_rotate_keys() {
        let dir = TempDir::new().unwrap();
        let ctx = KeystoreContext::default();
        let mut config = generate_data_keys(
            &KeystoreKind::File,
            &["development".to_string(), "production".to_string()],
            &options(&dir, "unused"),
            &ctx,
        )
        .unwrap();

        let old_registry =
            CipherRegistry::from_config(config.environment("production").unwrap(), &ctx).unwrap();
        let old = old_registry.encrypt_str("before rotation", &EncryptOptions::default()).unwrap();

        let rotated = rotate_keys(
            &mut config,
            &RotateOptions {
                app_name: "my_app".to_string(),
                ..RotateOptions::default()
            },
            &ctx,
        )
        .unwrap();
        assert_eq!(rotated, vec!["production".to_string()]);
        assert_eq!(config.environment("development").unwrap(), &dev_config());

        let prod = config.environment("production").unwrap();
        assert_eq!(
            prod.ciphers.iter().map(|c| c.version).collect::<Vec<_>>(),
            vec![2, 1]
        );

        let registry = CipherRegistry::from_config(prod, &ctx).unwrap();
        assert_eq!(registry.primary().version(), 2);
        assert_eq!(
            registry.decrypt(old.as_bytes(), None).unwrap().as_bytes(),
            b"before rotation"
        );

        // Rolling deploy keeps the current primary in front
        rotate_keys(
            &mut config,
            &RotateOptions {
                app_name: "my_app".to_string(),
                rolling_deploy: true,
                environments: vec!["production".to_string()],
                ..RotateOptions::default()
            },
            &ctx,
        )
        .unwrap();
        let prod = config.environment("production").unwrap();
        assert_eq!(
            prod.ciphers.iter().map(|c| c.version).collect::<Vec<_>>(),
            vec![2, 3, 1]
        );
    }

    #[test]
    fn test_rotate_after_version_wrap_skips_used_versions() {
        let dir = TempDir::new().unwrap();
        let ctx = KeystoreContext::default();
        let mut config = generate_data_keys(
            &KeystoreKind::Memory,
            &["production".to_string()],
            &options(&dir, "unused"),
            &ctx,
        )
        .unwrap();
        config.environments.get_mut("production").unwrap().ciphers[0].version = 255;

        let rotate = RotateOptions {
            app_name: "my_app".to_string(),
            ..RotateOptions::default()
        };
        rotate_keys(&mut config, &rotate, &ctx).unwrap();
        rotate_keys(&mut config, &rotate, &ctx).unwrap();

        let prod = config.environment("production").unwrap();
        assert_eq!(
            prod.ciphers.iter().map(|c| c.version).collect::<Vec<_>>(),
            vec![2, 1, 255]
        );
        let registry = CipherRegistry::from_config(prod, &ctx).unwrap();
        assert_eq!(registry.primary().version(), 2);
    }

    #[test]
    fn test_unused_version() {
        assert_eq!(unused_version(&[]), Some(1));
        assert_eq!(unused_version(&[3, 1]), Some(4));
        assert_eq!(unused_version(&[1, 255]), Some(2));
        assert_eq!(unused_version(&[255, 2, 1]), Some(3));
        let all: Vec<u8> = (1..=255).collect();
        assert_eq!(unused_version(&all), None);
    }

    #[test]
    fn test_rotate_unknown_environment() {
        let mut config = Config::default();
        let result = rotate_keys(
            &mut config,
            &RotateOptions {
                environments: vec!["staging".to_string()],
                ..RotateOptions::default()
            },
            &KeystoreContext::default(),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_aws_generate_and_read_through_fake_kms() {
        let dir = TempDir::new().unwrap();
        let kms = FakeKms::new();
        let ctx = context(&kms);
        let kind = KeystoreKind::Aws {
            regions: vec!["us-east-1".to_string(), "eu-west-1".to_string()],
            auto_create_master_key: true,
        };

        let config = generate_data_key(&kind, &options(&dir, "production"), &ctx).unwrap();
        assert_eq!(kms.create_count(), 1);
        assert_eq!(KeystoreKind::of(&config.key_source), Some(kind));

        let key = read_key(&config, &ctx).unwrap();
        assert_eq!(key.key().len(), 32);
    }
}
