//! Binary header framing
//!
//! Layout (all lengths are u16 little-endian):
//!
//! ```text
//! "@EnC" | version: u8 | flags: u8 | [len iv] | [len key] | [len cipher_name] | [len auth_tag]
//! ```
//!
//! Flag bits, high to low: compressed, iv, key, cipher name, auth tag. The
//! remaining three bits are reserved and ignored on read. An embedded key is
//! always stored encrypted under the key whose version the header names.

use crate::crypto::Key;
use crate::error::{Error, Result};
use std::fmt;
use zeroize::Zeroizing;

/// Magic prefix identifying a header
pub const MAGIC_HEADER: &[u8; 4] = b"@EnC";

/// Length of [`MAGIC_HEADER`]
pub const MAGIC_HEADER_SIZE: usize = MAGIC_HEADER.len();

const FLAG_COMPRESSED: u8 = 0b1000_0000;
const FLAG_IV: u8 = 0b0100_0000;
const FLAG_KEY: u8 = 0b0010_0000;
const FLAG_CIPHER_NAME: u8 = 0b0001_0000;
const FLAG_AUTH_TAG: u8 = 0b0000_1000;

/// Looks up the key configured for a version number
///
/// Used to validate header versions and to protect keys embedded in headers.
pub trait CipherSource {
    fn key_for(&self, version: u8) -> Option<&Key>;
}

impl CipherSource for Key {
    fn key_for(&self, version: u8) -> Option<&Key> {
        (self.version() == version).then_some(self)
    }
}

/// Header prefixed to ciphertext
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Header {
    /// Version of the key that encrypted the payload
    pub version: u8,
    /// Whether the plaintext was deflated before encryption
    pub compressed: bool,
    /// IV used for this payload instead of the key's configured one
    pub iv: Option<Vec<u8>>,
    /// Plaintext data key used for this payload instead of the versioned key
    pub key: Option<Zeroizing<Vec<u8>>>,
    /// Cipher used for this payload instead of the versioned key's cipher
    pub cipher_name: Option<String>,
    /// Authentication tag for authenticated ciphers
    pub auth_tag: Option<Vec<u8>>,
}

impl Header {
    /// Whether `buffer` starts with the magic prefix
    pub fn present(buffer: &[u8]) -> bool {
        buffer.starts_with(MAGIC_HEADER)
    }

    /// Parse a header from the start of `buffer`
    ///
    /// Returns the number of bytes consumed, or 0 when there is no header.
    /// A header naming a version that `keys` does not know is an error.
    pub fn parse(&mut self, buffer: &[u8], keys: &dyn CipherSource) -> Result<usize> {
        if buffer.len() < MAGIC_HEADER_SIZE + 2 || !Header::present(buffer) {
            return Ok(0);
        }

        let mut offset = MAGIC_HEADER_SIZE;
        let version = buffer[offset];
        let flags = buffer[offset + 1];
        offset += 2;

        let key = keys.key_for(version).ok_or_else(|| {
            Error::Cipher(format!(
                "Cipher with version:{} not found in any of the configured ciphers",
                version
            ))
        })?;

        self.version = version;
        self.compressed = flags & FLAG_COMPRESSED != 0;

        self.iv = if flags & FLAG_IV != 0 {
            Some(read_field(buffer, &mut offset, "iv")?.to_vec())
        } else {
            None
        };

        self.key = if flags & FLAG_KEY != 0 {
            let encrypted = read_field(buffer, &mut offset, "key")?;
            key.check_wrapping()?;
            Some(Zeroizing::new(key.decrypt(encrypted, b"")?))
        } else {
            None
        };

        self.cipher_name = if flags & FLAG_CIPHER_NAME != 0 {
            let name = read_field(buffer, &mut offset, "cipher_name")?;
            Some(
                String::from_utf8(name.to_vec())
                    .map_err(|_| Error::Cipher("Header cipher name is not UTF-8".to_string()))?,
            )
        } else {
            None
        };

        self.auth_tag = if flags & FLAG_AUTH_TAG != 0 {
            Some(read_field(buffer, &mut offset, "auth_tag")?.to_vec())
        } else {
            None
        };

        Ok(offset)
    }

    /// Parse and remove the header from the front of `buffer`
    pub fn parse_and_strip(&mut self, buffer: &mut Vec<u8>, keys: &dyn CipherSource) -> Result<usize> {
        let consumed = self.parse(buffer, keys)?;
        buffer.drain(..consumed);
        Ok(consumed)
    }

    /// Serialize the header
    ///
    /// `keys` is only needed when the header embeds a key, which is
    /// encrypted with the key for `self.version` before framing.
    pub fn write(&self, keys: Option<&dyn CipherSource>) -> Result<Vec<u8>> {
        let mut flags = 0u8;
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(MAGIC_HEADER);
        out.push(self.version);
        out.push(0);

        if self.compressed {
            flags |= FLAG_COMPRESSED;
        }

        if let Some(iv) = &self.iv {
            flags |= FLAG_IV;
            write_field(&mut out, iv)?;
        }

        if let Some(key) = &self.key {
            flags |= FLAG_KEY;
            let versioned = keys
                .and_then(|k| k.key_for(self.version))
                .ok_or_else(|| {
                    Error::Cipher(format!(
                        "Cannot embed a key in a header: no cipher configured for version {}",
                        self.version
                    ))
                })?;
            versioned.check_wrapping()?;
            write_field(&mut out, &versioned.encrypt(key, b"")?)?;
        }

        if let Some(name) = &self.cipher_name {
            flags |= FLAG_CIPHER_NAME;
            write_field(&mut out, name.as_bytes())?;
        }

        if let Some(tag) = &self.auth_tag {
            flags |= FLAG_AUTH_TAG;
            write_field(&mut out, tag)?;
        }

        out[MAGIC_HEADER_SIZE + 1] = flags;
        Ok(out)
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("version", &self.version)
            .field("compressed", &self.compressed)
            .field("iv", &self.iv.as_ref().map(hex::encode))
            .field("key", &self.key.as_ref().map(|_| "[REDACTED]"))
            .field("cipher_name", &self.cipher_name)
            .field("auth_tag", &self.auth_tag.as_ref().map(hex::encode))
            .finish()
    }
}

fn read_field<'a>(buffer: &'a [u8], offset: &mut usize, name: &str) -> Result<&'a [u8]> {
    let truncated = || Error::Cipher(format!("Header truncated while reading {}", name));

    let len_bytes = buffer.get(*offset..*offset + 2).ok_or_else(truncated)?;
    let len = u16::from_le_bytes([len_bytes[0], len_bytes[1]]) as usize;
    *offset += 2;

    let field = buffer.get(*offset..*offset + len).ok_or_else(truncated)?;
    *offset += len;
    Ok(field)
}

fn write_field(out: &mut Vec<u8>, data: &[u8]) -> Result<()> {
    let len = u16::try_from(data.len())
        .map_err(|_| Error::Cipher(format!("Header field too long: {} bytes", data.len())))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(data);
    Ok(())
}
