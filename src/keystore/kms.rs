//! Cloud KMS client seam
//!
//! The AWS and GCP keystores talk to their key management service through
//! [`KmsClient`], obtained per region or location from a [`KmsConnector`].
//! Both calls are blocking.

use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::warn;
use zeroize::Zeroizing;

/// Data key returned by a KMS, in plaintext and wrapped form
pub struct DataKey {
    pub plaintext: Zeroizing<Vec<u8>>,
    pub ciphertext: Vec<u8>,
}

/// Operations the keystores need from a cloud KMS
///
/// A missing master key must be reported as [`Error::KmsNotFound`].
pub trait KmsClient: Send + Sync {
    /// Encrypt `plaintext` under the master key `key_id`
    fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt a ciphertext produced under `key_id`
    fn decrypt(&self, key_id: &str, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>>;

    /// Generate a fresh data key of `key_len` bytes under `key_id`
    fn generate_data_key(&self, key_id: &str, key_len: usize) -> Result<DataKey>;

    /// Provision the master key `key_id`
    fn create_master_key(&self, key_id: &str, description: &str) -> Result<()>;
}

/// Builds a [`KmsClient`] for a region (AWS) or location (GCP)
pub trait KmsConnector: Send + Sync {
    fn connect(&self, location: Option<&str>) -> Result<Arc<dyn KmsClient>>;
}

/// Run `op` against the master key `key_id`
///
/// When the key does not exist and `auto_create` is set, the key is created
/// and `op` is retried exactly once. A key that is still missing is a
/// configuration error.
pub fn with_master_key<T, F>(
    client: &dyn KmsClient,
    key_id: &str,
    auto_create: bool,
    op: F,
) -> Result<T>
where
    F: Fn(&dyn KmsClient) -> Result<T>,
{
    match op(client) {
        Err(Error::KmsNotFound(_)) if auto_create => {
            warn!(key_id, "KMS master key not found, creating it");
            client.create_master_key(key_id, "Symmetric Encryption master key")?;
            op(client).map_err(not_found_is_config)
        }
        other => other.map_err(not_found_is_config),
    }
}

/// Map a missing master key to a configuration error
pub fn not_found_is_config(e: Error) -> Error {
    match e {
        Error::KmsNotFound(key_id) => {
            Error::Config(format!("KMS master key '{}' does not exist", key_id))
        }
        other => other,
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeKms;
    use super::*;

    #[test]
    fn test_auto_create_retries_once() {
        let kms = FakeKms::new();
        let ct = with_master_key(kms.as_ref(), "alias/app", true, |c| {
            c.encrypt("alias/app", b"data key")
        })
        .unwrap();
        assert_eq!(kms.create_count(), 1);
        assert_eq!(&kms.decrypt("alias/app", &ct).unwrap()[..], b"data key");

        // Already exists now: no further creation
        with_master_key(kms.as_ref(), "alias/app", true, |c| c.encrypt("alias/app", b"x")).unwrap();
        assert_eq!(kms.create_count(), 1);
    }

    #[test]
    fn test_no_auto_create_is_config_error() {
        let kms = FakeKms::new();
        let result = with_master_key(kms.as_ref(), "alias/app", false, |c| {
            c.encrypt("alias/app", b"data key")
        });
        assert!(matches!(result, Err(Error::Config(_))));
        assert_eq!(kms.create_count(), 0);
    }

    #[test]
    fn test_create_failure_propagates() {
        let kms = FakeKms::failing_create();
        let result = with_master_key(kms.as_ref(), "alias/app", true, |c| {
            c.encrypt("alias/app", b"data key")
        });
        assert!(matches!(result, Err(Error::Kms(_))));
    }
}
