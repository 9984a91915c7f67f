//! AWS KMS keystore
//!
//! The data key is encrypted by a KMS master key (CMK) addressed by alias,
//! once per region, and each region's ciphertext is stored base64 encoded in
//! its own file. Reading only needs the file for the current region, so
//! data stays readable when a region's KMS is unavailable elsewhere.

use super::file::{read_encoded_key_file, write_encoded_key_file};
use super::kms::{not_found_is_config, with_master_key, DataKey, KmsClient, KmsConnector};
use super::{cipher_config, GenerateOptions, Keystore};
use crate::config::{AwsKeyFile, CipherConfig, KeySource};
use crate::crypto::Key;
use crate::error::{Error, Result};
use aws_config::BehaviorVersion;
use aws_sdk_kms::config::Region;
use aws_sdk_kms::primitives::Blob;
use std::path::Path;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Regions a new key is replicated to when none are given
pub const DEFAULT_AWS_REGIONS: [&str; 4] = ["us-east-1", "us-east-2", "us-west-1", "us-west-2"];

/// Alias of the master key for an application environment
pub fn master_key_alias(app_name: &str, environment: &str) -> String {
    format!("alias/symmetric-encryption/{}/{}", app_name, environment)
}

/// Region from configuration, else `AWS_REGION`, else `AWS_DEFAULT_REGION`
pub(crate) fn resolve_region(configured: Option<&str>) -> Result<String> {
    configured
        .map(str::to_string)
        .or_else(|| std::env::var("AWS_REGION").ok())
        .or_else(|| std::env::var("AWS_DEFAULT_REGION").ok())
        .filter(|r| !r.trim().is_empty())
        .ok_or_else(|| {
            Error::Config(
                "AWS region is not configured. Set region or the AWS_REGION environment variable."
                    .to_string(),
            )
        })
}

/// Keystore backed by AWS KMS
pub struct AwsKeystore {
    region: String,
    key_files: Vec<AwsKeyFile>,
    master_key_alias: String,
    auto_create_master_key: bool,
    connector: Arc<dyn KmsConnector>,
}

impl AwsKeystore {
    pub fn new(
        region: String,
        key_files: Vec<AwsKeyFile>,
        master_key_alias: &str,
        auto_create_master_key: bool,
        connector: Arc<dyn KmsConnector>,
    ) -> Self {
        AwsKeystore {
            region,
            key_files,
            master_key_alias: master_key_alias.to_string(),
            auto_create_master_key,
            connector,
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn master_key_alias(&self) -> &str {
        &self.master_key_alias
    }

    /// Generate a data key in KMS and store it for every region
    ///
    /// A missing master key is created only when `auto_create_master_key`
    /// is set; the flag is also recorded in the returned configuration.
    pub fn generate_data_key(
        options: &GenerateOptions,
        regions: &[String],
        auto_create_master_key: bool,
        connector: Arc<dyn KmsConnector>,
    ) -> Result<CipherConfig> {
        let algorithm = options.algorithm()?;
        let version = options.version();
        let regions: Vec<String> = if regions.is_empty() {
            DEFAULT_AWS_REGIONS.iter().map(|r| r.to_string()).collect()
        } else {
            regions.to_vec()
        };

        let key_files: Vec<AwsKeyFile> = regions
            .iter()
            .map(|region| AwsKeyFile {
                region: region.clone(),
                file_name: options
                    .key_path
                    .join(format!(
                        "{}_{}_{}_v{}.encrypted_key",
                        options.app_name, options.environment, region, version
                    ))
                    .to_string_lossy()
                    .into_owned(),
            })
            .collect();

        let alias = master_key_alias(&options.app_name, &options.environment);
        let keystore = AwsKeystore::new(
            regions[0].clone(),
            key_files.clone(),
            &alias,
            auto_create_master_key,
            connector,
        );

        let dek = match &options.dek {
            Some(dek) => Key::with_algorithm(dek.key(), dek.iv(), algorithm, version)?,
            None => {
                let client = keystore.client(&keystore.region)?;
                let DataKey { plaintext, .. } =
                    with_master_key(client.as_ref(), &alias, auto_create_master_key, |c| {
                        c.generate_data_key(&alias, algorithm.key_len())
                    })?;
                Key::with_algorithm(&plaintext, Some(&algorithm.random_iv()), algorithm, version)?
            }
        };
        keystore.write(dek.key())?;

        Ok(cipher_config(
            &dek,
            KeySource::Aws {
                region: Some(keystore.region.clone()),
                master_key_alias: alias,
                key_files,
                auto_create_master_key,
            },
        ))
    }

    fn client(&self, region: &str) -> Result<Arc<dyn KmsClient>> {
        self.connector.connect(Some(region))
    }
}

impl Keystore for AwsKeystore {
    fn read(&self) -> Result<Zeroizing<Vec<u8>>> {
        let key_file = self
            .key_files
            .iter()
            .find(|f| f.region == self.region)
            .ok_or_else(|| {
                Error::Config(format!(
                    "No AWS key file configured for region '{}'",
                    self.region
                ))
            })?;

        let encrypted = read_encoded_key_file(Path::new(&key_file.file_name))?;
        debug!(region = %self.region, alias = %self.master_key_alias, "Decrypting data key with KMS");
        self.client(&self.region)?
            .decrypt(&self.master_key_alias, &encrypted)
            .map_err(not_found_is_config)
    }

    fn write(&self, key: &[u8]) -> Result<()> {
        for key_file in &self.key_files {
            let client = self.client(&key_file.region)?;
            let encrypted = with_master_key(
                client.as_ref(),
                &self.master_key_alias,
                self.auto_create_master_key,
                |c| c.encrypt(&self.master_key_alias, key),
            )?;
            write_encoded_key_file(Path::new(&key_file.file_name), &encrypted)?;
            info!(region = %key_file.region, path = %key_file.file_name, "Wrote KMS encrypted key file");
        }
        Ok(())
    }
}

/// Connects to AWS KMS with the default credential chain
#[derive(Debug, Clone, Copy, Default)]
pub struct AwsKmsConnector;

impl KmsConnector for AwsKmsConnector {
    fn connect(&self, location: Option<&str>) -> Result<Arc<dyn KmsClient>> {
        Ok(Arc::new(AwsKmsClient::new(location)?))
    }
}

/// Blocking AWS KMS client
///
/// Drives the async SDK on a private current-thread runtime, so it must not
/// be called from inside another Tokio runtime.
pub struct AwsKmsClient {
    runtime: Runtime,
    client: aws_sdk_kms::Client,
}

impl AwsKmsClient {
    pub fn new(region: Option<&str>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region.to_string()));
        }
        let sdk_config = runtime.block_on(loader.load());

        Ok(AwsKmsClient {
            client: aws_sdk_kms::Client::new(&sdk_config),
            runtime,
        })
    }
}

impl KmsClient for AwsKmsClient {
    fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let output = self
            .runtime
            .block_on(
                self.client
                    .encrypt()
                    .key_id(key_id)
                    .plaintext(Blob::new(plaintext))
                    .send(),
            )
            .map_err(|e| {
                let e = e.into_service_error();
                if e.is_not_found_exception() {
                    Error::KmsNotFound(key_id.to_string())
                } else {
                    Error::Kms(format!("encrypt failed: {}", e))
                }
            })?;

        output
            .ciphertext_blob()
            .map(|blob| blob.as_ref().to_vec())
            .ok_or_else(|| Error::Kms("encrypt returned no ciphertext".to_string()))
    }

    fn decrypt(&self, key_id: &str, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let output = self
            .runtime
            .block_on(
                self.client
                    .decrypt()
                    .key_id(key_id)
                    .ciphertext_blob(Blob::new(ciphertext))
                    .send(),
            )
            .map_err(|e| {
                let e = e.into_service_error();
                if e.is_not_found_exception() {
                    Error::KmsNotFound(key_id.to_string())
                } else {
                    Error::Kms(format!("decrypt failed: {}", e))
                }
            })?;

        output
            .plaintext()
            .map(|blob| Zeroizing::new(blob.as_ref().to_vec()))
            .ok_or_else(|| Error::Kms("decrypt returned no plaintext".to_string()))
    }

    fn generate_data_key(&self, key_id: &str, key_len: usize) -> Result<DataKey> {
        let output = self
            .runtime
            .block_on(
                self.client
                    .generate_data_key()
                    .key_id(key_id)
                    .number_of_bytes(key_len as i32)
                    .send(),
            )
            .map_err(|e| {
                let e = e.into_service_error();
                if e.is_not_found_exception() {
                    Error::KmsNotFound(key_id.to_string())
                } else {
                    Error::Kms(format!("generate_data_key failed: {}", e))
                }
            })?;

        let plaintext = output
            .plaintext()
            .map(|blob| Zeroizing::new(blob.as_ref().to_vec()))
            .ok_or_else(|| Error::Kms("generate_data_key returned no plaintext".to_string()))?;
        let ciphertext = output
            .ciphertext_blob()
            .map(|blob| blob.as_ref().to_vec())
            .ok_or_else(|| Error::Kms("generate_data_key returned no ciphertext".to_string()))?;

        Ok(DataKey {
            plaintext,
            ciphertext,
        })
    }

    fn create_master_key(&self, key_id: &str, description: &str) -> Result<()> {
        let created = self
            .runtime
            .block_on(self.client.create_key().description(description).send())
            .map_err(|e| Error::Kms(format!("create_key failed: {}", e.into_service_error())))?;

        let target = created
            .key_metadata()
            .map(|m| m.key_id().to_string())
            .ok_or_else(|| Error::Kms("create_key returned no key metadata".to_string()))?;

        self.runtime
            .block_on(
                self.client
                    .create_alias()
                    .alias_name(key_id)
                    .target_key_id(&target)
                    .send(),
            )
            .map_err(|e| Error::Kms(format!("create_alias failed: {}", e.into_service_error())))?;

        info!(alias = key_id, key = %target, "Created KMS master key");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::kms::testing::{FakeConnector, FakeKms};
    use serial_test::serial;
    use tempfile::TempDir;

    fn options(dir: &TempDir) -> GenerateOptions {
        GenerateOptions {
            key_path: dir.path().to_path_buf(),
            ..GenerateOptions::new("my_app", "production")
        }
    }

    #[test]
    fn test_alias() {
        assert_eq!(
            master_key_alias("my_app", "production"),
            "alias/symmetric-encryption/my_app/production"
        );
    }

    #[test]
    #[serial]
    fn test_resolve_region() {
        std::env::remove_var("AWS_REGION");
        std::env::remove_var("AWS_DEFAULT_REGION");
        assert!(resolve_region(None).is_err());
        assert_eq!(resolve_region(Some("eu-west-1")).unwrap(), "eu-west-1");

        std::env::set_var("AWS_DEFAULT_REGION", "ap-south-1");
        assert_eq!(resolve_region(None).unwrap(), "ap-south-1");
        std::env::set_var("AWS_REGION", "us-west-2");
        assert_eq!(resolve_region(None).unwrap(), "us-west-2");
        std::env::remove_var("AWS_REGION");
        std::env::remove_var("AWS_DEFAULT_REGION");
    }

    #[test]
    fn test_generate_writes_one_file_per_default_region() {
        let dir = TempDir::new().unwrap();
        let kms = FakeKms::new();
        let config =
            AwsKeystore::generate_data_key(&options(&dir), &[], true, Arc::new(FakeConnector(kms.clone())))
                .unwrap();

        for region in DEFAULT_AWS_REGIONS {
            let name = format!("my_app_production_{}_v1.encrypted_key", region);
            assert!(dir.path().join(name).exists());
        }
        match &config.key_source {
            KeySource::Aws {
                master_key_alias,
                key_files,
                region,
                ..
            } => {
                assert_eq!(master_key_alias, "alias/symmetric-encryption/my_app/production");
                assert_eq!(key_files.len(), 4);
                assert_eq!(region.as_deref(), Some("us-east-1"));
            }
            other => panic!("unexpected key source {:?}", other),
        }
        assert_eq!(kms.create_count(), 1);
    }

    #[test]
    fn test_read_uses_current_region_file() {
        let dir = TempDir::new().unwrap();
        let kms = FakeKms::new();
        let connector: Arc<dyn KmsConnector> = Arc::new(FakeConnector(kms.clone()));
        let regions = vec!["us-east-1".to_string(), "eu-west-1".to_string()];
        let config = AwsKeystore::generate_data_key(&options(&dir), &regions, true, connector.clone())
            .unwrap();

        let key_files = match config.key_source {
            KeySource::Aws { key_files, .. } => key_files,
            other => panic!("unexpected key source {:?}", other),
        };
        let alias = master_key_alias("my_app", "production");

        let east = AwsKeystore::new("us-east-1".into(), key_files.clone(), &alias, false, connector.clone());
        let west = AwsKeystore::new("eu-west-1".into(), key_files.clone(), &alias, false, connector.clone());
        assert_eq!(east.read().unwrap(), west.read().unwrap());

        let nowhere = AwsKeystore::new("sa-east-1".into(), key_files, &alias, false, connector);
        assert!(matches!(nowhere.read(), Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_master_key_without_auto_create() {
        let dir = TempDir::new().unwrap();
        let kms = FakeKms::new();
        let store = AwsKeystore::new(
            "us-east-1".into(),
            vec![AwsKeyFile {
                region: "us-east-1".into(),
                file_name: dir.path().join("k").to_string_lossy().into_owned(),
            }],
            "alias/symmetric-encryption/app/env",
            false,
            Arc::new(FakeConnector(kms.clone())),
        );
        assert!(matches!(store.write(&[1u8; 32]), Err(Error::Config(_))));
        assert_eq!(kms.create_count(), 0);
    }

    #[test]
    fn test_generate_without_auto_create() {
        let dir = TempDir::new().unwrap();
        let regions = vec!["us-east-1".to_string()];
        let alias = master_key_alias("my_app", "production");

        let kms = FakeKms::new();
        let connector: Arc<dyn KmsConnector> = Arc::new(FakeConnector(kms.clone()));
        let result = AwsKeystore::generate_data_key(&options(&dir), &regions, false, connector);
        assert!(matches!(result, Err(Error::Config(_))));
        assert_eq!(kms.create_count(), 0);

        let kms = FakeKms::with_master_key(&alias);
        let connector: Arc<dyn KmsConnector> = Arc::new(FakeConnector(kms.clone()));
        let config =
            AwsKeystore::generate_data_key(&options(&dir), &regions, false, connector).unwrap();
        assert_eq!(kms.create_count(), 0);
        match config.key_source {
            KeySource::Aws {
                auto_create_master_key,
                ..
            } => assert!(!auto_create_master_key),
            other => panic!("unexpected key source {:?}", other),
        }
    }
}
