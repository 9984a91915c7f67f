//! Google Cloud KMS keystore
//!
//! The data key is encrypted by a Cloud KMS crypto key and stored base64
//! encoded in a local file. The crypto key path defaults to a key ring named
//! after the application holding one crypto key per environment.

use super::file::{read_encoded_key_file, write_encoded_key_file};
use super::kms::{not_found_is_config, with_master_key, DataKey, KmsClient, KmsConnector};
use super::{cipher_config, GenerateOptions, Keystore};
use crate::config::{CipherConfig, KeySource};
use crate::crypto::{random_bytes, Key};
use crate::encoding::Encoding;
use crate::error::{Error, Result};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Public Cloud KMS REST endpoint
pub const DEFAULT_ENDPOINT: &str = "https://cloudkms.googleapis.com/v1";

/// Environment variable holding an OAuth2 access token for Cloud KMS
pub const ACCESS_TOKEN_VAR: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

const DEFAULT_LOCATION: &str = "global";

/// Full resource name of a crypto key
pub fn crypto_key_path(project_id: &str, location_id: &str, key_ring: &str, crypto_key: &str) -> String {
    format!(
        "projects/{}/locations/{}/keyRings/{}/cryptoKeys/{}",
        project_id, location_id, key_ring, crypto_key
    )
}

/// Build the crypto key path from configuration and the environment
///
/// The project comes from `GOOGLE_CLOUD_PROJECT` and the location from
/// `GOOGLE_CLOUD_LOCATION` (default `global`) when not configured.
pub(crate) fn resolve_crypto_key(
    project_id: Option<&str>,
    location_id: Option<&str>,
    app_name: Option<&str>,
    environment: Option<&str>,
) -> Result<String> {
    let project_id = project_id
        .map(str::to_string)
        .or_else(|| std::env::var("GOOGLE_CLOUD_PROJECT").ok())
        .ok_or_else(|| {
            Error::Config(
                "GCP project is not configured. Set project_id or GOOGLE_CLOUD_PROJECT."
                    .to_string(),
            )
        })?;
    let location_id = location_id
        .map(str::to_string)
        .or_else(|| std::env::var("GOOGLE_CLOUD_LOCATION").ok())
        .unwrap_or_else(|| DEFAULT_LOCATION.to_string());
    let app_name = app_name
        .ok_or_else(|| Error::Config("GCP keystore requires crypto_key or app_name".to_string()))?;
    let environment = environment.ok_or_else(|| {
        Error::Config("GCP keystore requires crypto_key or environment".to_string())
    })?;

    Ok(crypto_key_path(&project_id, &location_id, app_name, environment))
}

/// Keystore backed by Google Cloud KMS
pub struct GcpKeystore {
    key_filename: PathBuf,
    crypto_key: String,
    auto_create_master_key: bool,
    connector: Arc<dyn KmsConnector>,
}

impl GcpKeystore {
    pub fn new<P: AsRef<Path>>(
        key_filename: P,
        crypto_key: String,
        auto_create_master_key: bool,
        connector: Arc<dyn KmsConnector>,
    ) -> Self {
        GcpKeystore {
            key_filename: key_filename.as_ref().to_path_buf(),
            crypto_key,
            auto_create_master_key,
            connector,
        }
    }

    pub fn crypto_key(&self) -> &str {
        &self.crypto_key
    }

    /// Generate a data key and store it encrypted by Cloud KMS
    pub fn generate_data_key(
        options: &GenerateOptions,
        project_id: Option<&str>,
        location_id: Option<&str>,
        connector: Arc<dyn KmsConnector>,
    ) -> Result<CipherConfig> {
        let algorithm = options.algorithm()?;
        let version = options.version();
        let dek = options.data_key()?;
        let dek = Key::with_algorithm(dek.key(), dek.iv(), algorithm, version)?;

        let key_filename = options.key_path.join(format!(
            "{}_{}_v{}.encrypted_key",
            options.app_name, options.environment, version
        ));
        let crypto_key = resolve_crypto_key(
            project_id,
            location_id,
            Some(&options.app_name),
            Some(&options.environment),
        )?;

        GcpKeystore::new(&key_filename, crypto_key.clone(), true, connector).write(dek.key())?;

        Ok(cipher_config(
            &dek,
            KeySource::Gcp {
                key_filename: key_filename.to_string_lossy().into_owned(),
                crypto_key: Some(crypto_key),
                project_id: project_id.map(str::to_string),
                location_id: location_id.map(str::to_string),
                app_name: Some(options.app_name.clone()),
                environment: Some(options.environment.clone()),
                auto_create_master_key: false,
            },
        ))
    }
}

impl Keystore for GcpKeystore {
    fn read(&self) -> Result<Zeroizing<Vec<u8>>> {
        let encrypted = read_encoded_key_file(&self.key_filename)?;
        debug!(crypto_key = %self.crypto_key, "Decrypting data key with Cloud KMS");
        self.connector
            .connect(None)?
            .decrypt(&self.crypto_key, &encrypted)
            .map_err(not_found_is_config)
    }

    fn write(&self, key: &[u8]) -> Result<()> {
        let client = self.connector.connect(None)?;
        let encrypted = with_master_key(
            client.as_ref(),
            &self.crypto_key,
            self.auto_create_master_key,
            |c| c.encrypt(&self.crypto_key, key),
        )?;
        write_encoded_key_file(&self.key_filename, &encrypted)?;
        info!(path = %self.key_filename.display(), "Wrote Cloud KMS encrypted key file");
        Ok(())
    }
}

/// Connects to Cloud KMS using a bearer token from the environment
#[derive(Debug, Clone)]
pub struct GcpKmsConnector {
    endpoint: String,
}

impl Default for GcpKmsConnector {
    fn default() -> Self {
        GcpKmsConnector {
            endpoint: DEFAULT_ENDPOINT.to_string(),
        }
    }
}

impl GcpKmsConnector {
    pub fn with_endpoint(endpoint: &str) -> Self {
        GcpKmsConnector {
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }
}

impl KmsConnector for GcpKmsConnector {
    fn connect(&self, _location: Option<&str>) -> Result<Arc<dyn KmsClient>> {
        let token = std::env::var(ACCESS_TOKEN_VAR).map_err(|_| {
            Error::Config(format!(
                "Cloud KMS access requires the {} environment variable",
                ACCESS_TOKEN_VAR
            ))
        })?;
        Ok(Arc::new(GcpKmsClient::new(&self.endpoint, &token)?))
    }
}

#[derive(Serialize)]
struct EncryptRequest {
    plaintext: String,
}

#[derive(Deserialize)]
struct EncryptResponse {
    ciphertext: String,
}

#[derive(Serialize)]
struct DecryptRequest {
    ciphertext: String,
}

#[derive(Deserialize)]
struct DecryptResponse {
    #[serde(default)]
    plaintext: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateCryptoKeyRequest {
    purpose: &'static str,
}

/// Blocking Cloud KMS REST client
///
/// Runs requests on a private current-thread runtime, so it must not be
/// called from inside another Tokio runtime.
pub struct GcpKmsClient {
    runtime: Runtime,
    http: reqwest::Client,
    endpoint: String,
    token: String,
}

impl GcpKmsClient {
    pub fn new(endpoint: &str, token: &str) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Kms(format!("Failed to build HTTP client: {}", e)))?;

        Ok(GcpKmsClient {
            runtime,
            http,
            endpoint: endpoint.to_string(),
            token: token.to_string(),
        })
    }

    fn post<Req, Resp>(&self, url: String, key_id: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: for<'de> Deserialize<'de>,
    {
        self.runtime.block_on(async {
            let response = self
                .http
                .post(&url)
                .bearer_auth(&self.token)
                .json(body)
                .send()
                .await
                .map_err(|e| Error::Kms(format!("Cloud KMS request failed: {}", e)))?;

            match response.status() {
                StatusCode::NOT_FOUND => Err(Error::KmsNotFound(key_id.to_string())),
                status if status.is_success() => response
                    .json::<Resp>()
                    .await
                    .map_err(|e| Error::Kms(format!("Invalid Cloud KMS response: {}", e))),
                status => {
                    let text = response.text().await.unwrap_or_default();
                    Err(Error::Kms(format!("Cloud KMS returned {}: {}", status, text)))
                }
            }
        })
    }

    /// POST a create request; an existing resource is not an error
    fn create(&self, url: String, body: serde_json::Value) -> Result<()> {
        self.runtime.block_on(async {
            let response = self
                .http
                .post(&url)
                .bearer_auth(&self.token)
                .json(&body)
                .send()
                .await
                .map_err(|e| Error::Kms(format!("Cloud KMS request failed: {}", e)))?;

            let status = response.status();
            if status.is_success() || status == StatusCode::CONFLICT {
                Ok(())
            } else {
                let text = response.text().await.unwrap_or_default();
                Err(Error::Kms(format!("Cloud KMS returned {}: {}", status, text)))
            }
        })
    }
}

impl KmsClient for GcpKmsClient {
    fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let request = EncryptRequest {
            plaintext: encode(plaintext),
        };
        let response: EncryptResponse =
            self.post(format!("{}/{}:encrypt", self.endpoint, key_id), key_id, &request)?;
        Encoding::Base64Strict.decode(response.ciphertext.as_bytes())
    }

    fn decrypt(&self, key_id: &str, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let request = DecryptRequest {
            ciphertext: encode(ciphertext),
        };
        let response: DecryptResponse =
            self.post(format!("{}/{}:decrypt", self.endpoint, key_id), key_id, &request)?;
        let plaintext = Zeroizing::new(response.plaintext);
        Ok(Zeroizing::new(Encoding::Base64Strict.decode(plaintext.as_bytes())?))
    }

    fn generate_data_key(&self, key_id: &str, key_len: usize) -> Result<DataKey> {
        let plaintext = Zeroizing::new(random_bytes(key_len));
        let ciphertext = self.encrypt(key_id, &plaintext)?;
        Ok(DataKey {
            plaintext,
            ciphertext,
        })
    }

    fn create_master_key(&self, key_id: &str, _description: &str) -> Result<()> {
        let parts: Vec<&str> = key_id.split('/').collect();
        let [
            "projects", project, "locations", location, "keyRings", key_ring, "cryptoKeys", crypto_key,
        ] = parts.as_slice()
        else {
            return Err(Error::Config(format!("Invalid crypto key path: {}", key_id)));
        };

        let parent = format!("projects/{}/locations/{}", project, location);
        self.create(
            format!("{}/{}/keyRings?keyRingId={}", self.endpoint, parent, key_ring),
            serde_json::json!({}),
        )?;
        self.create(
            format!(
                "{}/{}/keyRings/{}/cryptoKeys?cryptoKeyId={}",
                self.endpoint, parent, key_ring, crypto_key
            ),
            serde_json::to_value(CreateCryptoKeyRequest {
                purpose: "ENCRYPT_DECRYPT",
            })?,
        )?;

        info!(crypto_key = key_id, "Created Cloud KMS crypto key");
        Ok(())
    }
}

fn encode(data: &[u8]) -> String {
    String::from_utf8_lossy(&Encoding::Base64Strict.encode(data)).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::kms::testing::{FakeConnector, FakeKms};
    use crate::keystore::{read_key, KeystoreContext};
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_crypto_key_path() {
        assert_eq!(
            crypto_key_path("proj", "global", "my_app", "production"),
            "projects/proj/locations/global/keyRings/my_app/cryptoKeys/production"
        );
    }

    #[test]
    #[serial]
    fn test_resolve_crypto_key_from_environment() {
        std::env::set_var("GOOGLE_CLOUD_PROJECT", "env-project");
        std::env::remove_var("GOOGLE_CLOUD_LOCATION");
        let key = resolve_crypto_key(None, None, Some("app"), Some("prod")).unwrap();
        assert_eq!(
            key,
            "projects/env-project/locations/global/keyRings/app/cryptoKeys/prod"
        );

        std::env::set_var("GOOGLE_CLOUD_LOCATION", "europe-west1");
        let key = resolve_crypto_key(Some("p"), None, Some("app"), Some("prod")).unwrap();
        assert_eq!(key, "projects/p/locations/europe-west1/keyRings/app/cryptoKeys/prod");

        std::env::remove_var("GOOGLE_CLOUD_PROJECT");
        std::env::remove_var("GOOGLE_CLOUD_LOCATION");
        assert!(resolve_crypto_key(None, None, Some("app"), Some("prod")).is_err());
        assert!(resolve_crypto_key(Some("p"), None, None, Some("prod")).is_err());
    }

    #[test]
    fn test_generate_and_read_with_fake_kms() {
        let dir = TempDir::new().unwrap();
        let kms = FakeKms::new();
        let options = GenerateOptions {
            key_path: dir.path().to_path_buf(),
            ..GenerateOptions::new("my_app", "production")
        };
        let config = GcpKeystore::generate_data_key(
            &options,
            Some("proj"),
            Some("global"),
            Arc::new(FakeConnector(kms.clone())),
        )
        .unwrap();

        assert!(dir.path().join("my_app_production_v1.encrypted_key").exists());
        assert_eq!(kms.create_count(), 1);

        let ctx = KeystoreContext {
            aws: Arc::new(FakeConnector(kms.clone())),
            gcp: Arc::new(FakeConnector(kms)),
        };
        let key = read_key(&config, &ctx).unwrap();
        assert_eq!(key.version(), 1);
    }

    #[test]
    fn test_read_missing_crypto_key_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("k.encrypted_key");
        let kms = FakeKms::with_master_key("projects/p/locations/global/keyRings/a/cryptoKeys/e");
        let store = GcpKeystore::new(
            &path,
            "projects/p/locations/global/keyRings/a/cryptoKeys/e".to_string(),
            false,
            Arc::new(FakeConnector(kms)),
        );
        store.write(&[3u8; 32]).unwrap();

        let other = GcpKeystore::new(
            &path,
            "projects/p/locations/global/keyRings/a/cryptoKeys/missing".to_string(),
            false,
            Arc::new(FakeConnector(FakeKms::new())),
        );
        assert!(matches!(other.read(), Err(Error::Config(_))));
    }

    #[test]
    #[serial]
    fn test_connector_requires_token() {
        std::env::remove_var(ACCESS_TOKEN_VAR);
        assert!(matches!(
            GcpKmsConnector::default().connect(None),
            Err(Error::Config(_))
        ));
    }
}
