//! Text-safe encodings for ciphertext
//!
//! Converts between raw binary ciphertext and a representation that can be
//! stored in text columns, config files or environment variables. No
//! cryptography happens here.

use crate::error::{Error, Result};
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD, URL_SAFE};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Line width used by the line-wrapped base64 encoding
const BASE64_LINE_WIDTH: usize = 60;

/// Decoder that accepts input with or without trailing padding
const LENIENT_STANDARD: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const LENIENT_URL_SAFE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Encoding applied to ciphertext after encryption
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Raw binary, returned as a copy of the input
    None,
    /// RFC 4648 base64, wrapped at 60 columns with a trailing newline
    Base64,
    /// RFC 4648 base64 without line breaks
    #[default]
    Base64Strict,
    /// URL and filename safe base64 alphabet, padded
    Base64UrlSafe,
    /// Lowercase hex
    Base16,
}

impl Encoding {
    /// Encode binary data
    ///
    /// Empty input returns empty output without touching the codec.
    pub fn encode(&self, data: &[u8]) -> Vec<u8> {
        if data.is_empty() {
            return Vec::new();
        }

        match self {
            Encoding::None => data.to_vec(),
            Encoding::Base64 => wrap_lines(&STANDARD.encode(data)).into_bytes(),
            Encoding::Base64Strict => STANDARD.encode(data).into_bytes(),
            Encoding::Base64UrlSafe => URL_SAFE.encode(data).into_bytes(),
            Encoding::Base16 => hex::encode(data).into_bytes(),
        }
    }

    /// Decode previously encoded data back to binary
    pub fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }

        let decoded = match self {
            Encoding::None => data.to_vec(),
            Encoding::Base64 => {
                let compact: Vec<u8> = data
                    .iter()
                    .copied()
                    .filter(|b| !b.is_ascii_whitespace())
                    .collect();
                LENIENT_STANDARD.decode(compact)?
            }
            Encoding::Base64Strict => STANDARD.decode(data)?,
            Encoding::Base64UrlSafe => LENIENT_URL_SAFE.decode(trim_ascii(data))?,
            Encoding::Base16 => hex::decode(trim_ascii(data))?,
        };

        Ok(decoded)
    }

    /// Encode an optional value, passing `None` straight through
    pub fn encode_opt(&self, data: Option<&[u8]>) -> Option<Vec<u8>> {
        data.map(|d| self.encode(d))
    }

    /// Decode an optional value, passing `None` straight through
    pub fn decode_opt(&self, data: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        data.map(|d| self.decode(d)).transpose()
    }

    /// Whether the encoded output is always printable ASCII
    pub fn is_text(&self) -> bool {
        !matches!(self, Encoding::None)
    }

    /// Configuration name of this encoding
    pub fn name(&self) -> &'static str {
        match self {
            Encoding::None => "none",
            Encoding::Base64 => "base64",
            Encoding::Base64Strict => "base64strict",
            Encoding::Base64UrlSafe => "base64urlsafe",
            Encoding::Base16 => "base16",
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Encoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Encoding::None),
            "base64" => Ok(Encoding::Base64),
            "base64strict" => Ok(Encoding::Base64Strict),
            "base64urlsafe" => Ok(Encoding::Base64UrlSafe),
            "base16" => Ok(Encoding::Base16),
            other => Err(Error::Config(format!("Unknown encoding: {}", other))),
        }
    }
}

/// Break base64 text into newline-terminated lines
fn wrap_lines(encoded: &str) -> String {
    let mut out = String::with_capacity(encoded.len() + encoded.len() / BASE64_LINE_WIDTH + 1);
    for line in encoded.as_bytes().chunks(BASE64_LINE_WIDTH) {
        // base64 output is ASCII, so every chunk boundary is a char boundary
        out.push_str(&String::from_utf8_lossy(line));
        out.push('\n');
    }
    out
}

fn trim_ascii(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(data.len());
    let end = data
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|p| p + 1)
        .unwrap_or(start);
    &data[start..end]
}
