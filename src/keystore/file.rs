//! Key file keystore
//!
//! The wrapped key lives in a file that only its owner may read. Files with
//! any group or world permission bits, or owned by another user, are
//! rejected rather than read.

use super::{cipher_config, GenerateOptions, Keystore};
use crate::config::{CipherConfig, KeyEncryptingKeyConfig, KeySource};
use crate::crypto::{Key, KeyWrapper};
use crate::encoding::Encoding;
use crate::error::{Error, Result};
use std::fs;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Only owner read/write, or owner read-only
const ALLOWED_MODES: [u32; 2] = [0o600, 0o400];

/// Keystore backed by a local file
pub struct FileKeystore {
    key_filename: PathBuf,
    key_encrypting_key: Option<Arc<dyn KeyWrapper>>,
}

impl FileKeystore {
    /// Without a key-encrypting key the file holds the raw key, protected
    /// only by its permissions.
    pub fn new<P: AsRef<Path>>(
        key_filename: P,
        key_encrypting_key: Option<Arc<dyn KeyWrapper>>,
    ) -> Self {
        FileKeystore {
            key_filename: key_filename.as_ref().to_path_buf(),
            key_encrypting_key,
        }
    }

    pub fn key_filename(&self) -> &Path {
        &self.key_filename
    }

    /// Generate a data key in a three-level hierarchy
    ///
    /// The data key file is wrapped by a key-encrypting key, held in the
    /// returned configuration wrapped by a second key whose raw bytes go to
    /// a `.kekek` file next to the data key.
    pub fn generate_data_key(options: &GenerateOptions) -> Result<CipherConfig> {
        let algorithm = options.algorithm()?;
        let version = options.version();
        let dek = options.data_key()?;
        let kek = Key::random(algorithm.wrapping_algorithm(), 0);
        let kekek = Key::random(algorithm.wrapping_algorithm(), 0);

        let base = format!(
            "{}_{}_v{}",
            options.app_name, options.environment, version
        );
        let dek_file = options.key_path.join(format!("{}.encrypted_key", base));
        let kekek_file = options.key_path.join(format!("{}.kekek", base));

        FileKeystore::new(&kekek_file, None).write(kekek.key())?;
        let encrypted_kek = Encoding::Base64Strict.encode(&kekek.wrap_key(kek.key())?);
        FileKeystore::new(&dek_file, Some(Arc::new(kek.clone()))).write(dek.key())?;

        let kekek_config = KeyEncryptingKeyConfig::Symmetric {
            cipher_name: kekek.cipher_name().to_string(),
            iv: kekek.iv().map(|iv| iv.to_vec()),
            source: KeySource::File {
                key_filename: kekek_file.to_string_lossy().into_owned(),
                key_encrypting_key: None,
            },
        };
        let kek_config = KeyEncryptingKeyConfig::Symmetric {
            cipher_name: kek.cipher_name().to_string(),
            iv: kek.iv().map(|iv| iv.to_vec()),
            source: KeySource::Memory {
                encrypted_key: String::from_utf8_lossy(&encrypted_kek).into_owned(),
                key_encrypting_key: Box::new(kekek_config),
            },
        };

        let dek = Key::with_algorithm(dek.key(), dek.iv(), algorithm, version)?;
        Ok(cipher_config(
            &dek,
            KeySource::File {
                key_filename: dek_file.to_string_lossy().into_owned(),
                key_encrypting_key: Some(Box::new(kek_config)),
            },
        ))
    }
}

impl Keystore for FileKeystore {
    fn read(&self) -> Result<Zeroizing<Vec<u8>>> {
        let data = read_key_file(&self.key_filename)?;
        match &self.key_encrypting_key {
            Some(kek) => kek.unwrap_key(&data),
            None => Ok(data),
        }
    }

    fn write(&self, key: &[u8]) -> Result<()> {
        let data = match &self.key_encrypting_key {
            Some(kek) => Zeroizing::new(kek.wrap_key(key)?),
            None => Zeroizing::new(key.to_vec()),
        };
        backup_existing(&self.key_filename)?;
        write_key_file(&self.key_filename, &data)?;
        info!(path = %self.key_filename.display(), "Wrote key file");
        Ok(())
    }
}

/// Read a key file after checking its ownership and permissions
pub(crate) fn read_key_file(path: &Path) -> Result<Zeroizing<Vec<u8>>> {
    if !path.exists() {
        return Err(Error::Config(format!(
            "Symmetric Encryption key file: '{}' not found",
            path.display()
        )));
    }
    check_permissions(path)?;
    debug!(path = %path.display(), "Reading key file");
    Ok(Zeroizing::new(fs::read(path)?))
}

/// Read a key file holding base64 text
pub(crate) fn read_encoded_key_file(path: &Path) -> Result<Zeroizing<Vec<u8>>> {
    let text = read_key_file(path)?;
    Ok(Zeroizing::new(Encoding::Base64.decode(&text)?))
}

/// Write a key file with owner-only permissions, creating parent directories
pub(crate) fn write_key_file(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // An existing file keeps its old mode, so set it explicitly
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

/// Write base64 text to a key file
pub(crate) fn write_encoded_key_file(path: &Path, data: &[u8]) -> Result<()> {
    write_key_file(path, &Encoding::Base64Strict.encode(data))
}

fn check_permissions(path: &Path) -> Result<()> {
    let stat = nix::sys::stat::stat(path).map_err(|e| Error::Io(e.into()))?;
    let mode = stat.st_mode as u32 & 0o777;

    if !ALLOWED_MODES.contains(&mode) {
        return Err(Error::Config(format!(
            "Symmetric Encryption key file '{}' has the wrong permissions: {:o}. Expected 600 or 400.",
            path.display(),
            mode
        )));
    }

    if stat.st_uid != nix::unistd::getuid().as_raw() {
        return Err(Error::Config(format!(
            "Symmetric Encryption key file '{}' is not owned by the current user",
            path.display()
        )));
    }

    Ok(())
}

fn backup_existing(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let stamp = chrono::Local::now().format("%Y%m%d%H%M%S%3f");
    let mut backup = path.as_os_str().to_owned();
    backup.push(format!(".{}", stamp));
    fs::rename(path, &backup)?;
    warn!(
        path = %path.display(),
        backup = %Path::new(&backup).display(),
        "Backed up existing key file"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CipherAlgorithm;
    use crate::keystore::read_key;
    use crate::keystore::KeystoreContext;
    use tempfile::TempDir;

    fn kek() -> Arc<dyn KeyWrapper> {
        Arc::new(Key::random(CipherAlgorithm::Aes256Cbc, 0))
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("app.key");
        let store = FileKeystore::new(&path, Some(kek()));

        store.write(b"0123456789abcdef0123456789abcdef").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        // Stored wrapped, not raw
        assert_ne!(fs::read(&path).unwrap(), b"0123456789abcdef0123456789abcdef");
        assert_eq!(&store.read().unwrap()[..], b"0123456789abcdef0123456789abcdef");
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let store = FileKeystore::new(dir.path().join("nope.key"), None);
        assert!(matches!(store.read(), Err(Error::Config(_))));
    }

    #[test]
    fn test_broad_permissions_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("open.key");
        let store = FileKeystore::new(&path, None);
        store.write(b"raw key bytes").unwrap();

        for mode in [0o644, 0o640, 0o604, 0o660, 0o700] {
            fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
            match store.read() {
                Err(Error::Config(msg)) => assert!(msg.contains("wrong permissions")),
                other => panic!("mode {:o} should be rejected, got {:?}", mode, other.map(|_| ())),
            }
        }

        fs::set_permissions(&path, fs::Permissions::from_mode(0o400)).unwrap();
        assert_eq!(&store.read().unwrap()[..], b"raw key bytes");
    }

    #[test]
    fn test_write_backs_up_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.key");
        let store = FileKeystore::new(&path, None);
        store.write(b"first").unwrap();
        store.write(b"second").unwrap();

        let backups: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("app.key."))
            .collect();
        assert_eq!(backups.len(), 1);
        assert_eq!(fs::read(dir.path().join(&backups[0])).unwrap(), b"first");
        assert_eq!(&store.read().unwrap()[..], b"second");
    }

    #[test]
    fn test_generate_three_level_hierarchy() {
        let dir = TempDir::new().unwrap();
        let options = GenerateOptions {
            key_path: dir.path().to_path_buf(),
            previous_version: 4,
            ..GenerateOptions::new("my_app", "production")
        };
        let config = FileKeystore::generate_data_key(&options).unwrap();

        assert_eq!(config.version, 5);
        assert!(dir.path().join("my_app_production_v5.encrypted_key").exists());
        assert!(dir.path().join("my_app_production_v5.kekek").exists());

        match &config.key_source {
            KeySource::File {
                key_encrypting_key: Some(kek),
                ..
            } => match kek.as_ref() {
                KeyEncryptingKeyConfig::Symmetric {
                    source: KeySource::Memory {
                        key_encrypting_key, ..
                    },
                    ..
                } => match key_encrypting_key.as_ref() {
                    KeyEncryptingKeyConfig::Symmetric {
                        source: KeySource::File { .. },
                        ..
                    } => {}
                    other => panic!("unexpected kekek {:?}", other),
                },
                other => panic!("unexpected kek {:?}", other),
            },
            other => panic!("unexpected key source {:?}", other),
        }

        let key = read_key(&config, &KeystoreContext::default()).unwrap();
        assert_eq!(key.version(), 5);
        assert_eq!(key.key().len(), 32);
    }

    #[test]
    fn test_generate_uses_supplied_dek() {
        let dir = TempDir::new().unwrap();
        let dek = Key::random(CipherAlgorithm::Aes256Cbc, 0);
        let options = GenerateOptions {
            key_path: dir.path().to_path_buf(),
            dek: Some(dek.clone()),
            ..GenerateOptions::new("my_app", "release")
        };
        let config = FileKeystore::generate_data_key(&options).unwrap();
        let key = read_key(&config, &KeystoreContext::default()).unwrap();
        assert_eq!(key.key(), dek.key());
        assert_eq!(key.version(), 1);
    }
}
