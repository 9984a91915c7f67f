//! Block cipher engine
//!
//! A [`CipherEngine`] is a single-use encryptor or decryptor built from raw
//! key bytes. It follows the update/finish model: `update` may be called any
//! number of times with arbitrary slice sizes, `finish` flushes the final
//! (padded) block exactly once. Engines are never shared; callers construct
//! a fresh one per operation, which is what makes [`crate::crypto::Key`]
//! safe to use from many threads at once.

use crate::crypto::{BLOCK_SIZE, GCM_NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};
use cbc::cipher::block_padding::{Padding, Pkcs7};
use cbc::cipher::consts::U16;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, AES_256_GCM};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

/// Supported symmetric ciphers, named the way OpenSSL names them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CipherAlgorithm {
    Aes128Cbc,
    Aes192Cbc,
    Aes256Cbc,
    Aes128Gcm,
    Aes256Gcm,
}

impl CipherAlgorithm {
    /// Look up an algorithm by its cipher name, e.g. `aes-256-cbc`
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "aes-128-cbc" => Ok(CipherAlgorithm::Aes128Cbc),
            "aes-192-cbc" => Ok(CipherAlgorithm::Aes192Cbc),
            "aes-256-cbc" => Ok(CipherAlgorithm::Aes256Cbc),
            "aes-128-gcm" => Ok(CipherAlgorithm::Aes128Gcm),
            "aes-256-gcm" => Ok(CipherAlgorithm::Aes256Gcm),
            other => Err(Error::Cipher(format!("Unsupported cipher: {}", other))),
        }
    }

    /// Cipher name as written to headers and configuration
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::Aes128Cbc => "aes-128-cbc",
            CipherAlgorithm::Aes192Cbc => "aes-192-cbc",
            CipherAlgorithm::Aes256Cbc => "aes-256-cbc",
            CipherAlgorithm::Aes128Gcm => "aes-128-gcm",
            CipherAlgorithm::Aes256Gcm => "aes-256-gcm",
        }
    }

    /// Key length in bytes
    pub fn key_len(&self) -> usize {
        match self {
            CipherAlgorithm::Aes128Cbc | CipherAlgorithm::Aes128Gcm => 16,
            CipherAlgorithm::Aes192Cbc => 24,
            CipherAlgorithm::Aes256Cbc | CipherAlgorithm::Aes256Gcm => 32,
        }
    }

    /// IV (nonce) length in bytes
    pub fn iv_len(&self) -> usize {
        if self.is_authenticated() {
            GCM_NONCE_SIZE
        } else {
            BLOCK_SIZE
        }
    }

    /// Whether this is an AEAD mode that produces an authentication tag
    pub fn is_authenticated(&self) -> bool {
        matches!(self, CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm)
    }

    /// Same-strength CBC algorithm, used when generating key-encrypting keys
    pub fn wrapping_algorithm(&self) -> CipherAlgorithm {
        match self {
            CipherAlgorithm::Aes128Gcm => CipherAlgorithm::Aes128Cbc,
            CipherAlgorithm::Aes256Gcm => CipherAlgorithm::Aes256Cbc,
            other => *other,
        }
    }

    /// Whether the engine can process input incrementally in bounded memory
    pub fn supports_streaming(&self) -> bool {
        !self.is_authenticated()
    }

    /// Generate a random key for this algorithm
    pub fn random_key(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(random_bytes(self.key_len()))
    }

    /// Generate a random IV for this algorithm
    pub fn random_iv(&self) -> Vec<u8> {
        random_bytes(self.iv_len())
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.key_len() {
            return Err(Error::InvalidKeyLength {
                cipher: self.name().to_string(),
                expected: self.key_len(),
                got: key.len(),
            });
        }
        Ok(())
    }

    fn check_iv(&self, iv: &[u8]) -> Result<()> {
        if iv.len() != self.iv_len() {
            return Err(Error::InvalidIvLength {
                cipher: self.name().to_string(),
                expected: self.iv_len(),
                got: iv.len(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for CipherAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CipherAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        CipherAlgorithm::from_name(s)
    }
}

impl TryFrom<String> for CipherAlgorithm {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        CipherAlgorithm::from_name(&value)
    }
}

impl From<CipherAlgorithm> for String {
    fn from(value: CipherAlgorithm) -> Self {
        value.name().to_string()
    }
}

/// Fill a new buffer with cryptographically secure random bytes
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Output of [`CipherEngine::finish`]
#[derive(Debug)]
pub struct Finished {
    /// Remaining output bytes (final block, or the whole message for GCM)
    pub data: Vec<u8>,
    /// Authentication tag, produced only by authenticated encryption
    pub auth_tag: Option<Vec<u8>>,
}

/// Concrete CBC cipher state, one variant per key size and direction
enum CbcCore {
    Enc128(cbc::Encryptor<aes::Aes128>),
    Enc192(cbc::Encryptor<aes::Aes192>),
    Enc256(cbc::Encryptor<aes::Aes256>),
    Dec128(cbc::Decryptor<aes::Aes128>),
    Dec192(cbc::Decryptor<aes::Aes192>),
    Dec256(cbc::Decryptor<aes::Aes256>),
}

impl CbcCore {
    fn new(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8], encrypt: bool) -> Result<Self> {
        let invalid = |_| Error::Cipher(format!("Invalid key or IV for {}", algorithm));
        let core = match (algorithm, encrypt) {
            (CipherAlgorithm::Aes128Cbc, true) => {
                CbcCore::Enc128(cbc::Encryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            (CipherAlgorithm::Aes192Cbc, true) => {
                CbcCore::Enc192(cbc::Encryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            (CipherAlgorithm::Aes256Cbc, true) => {
                CbcCore::Enc256(cbc::Encryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            (CipherAlgorithm::Aes128Cbc, false) => {
                CbcCore::Dec128(cbc::Decryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            (CipherAlgorithm::Aes192Cbc, false) => {
                CbcCore::Dec192(cbc::Decryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            (CipherAlgorithm::Aes256Cbc, false) => {
                CbcCore::Dec256(cbc::Decryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            (other, _) => {
                return Err(Error::Cipher(format!("{} is not a CBC cipher", other)));
            }
        };
        Ok(core)
    }

    fn process(&mut self, block: &mut aes::Block) {
        match self {
            CbcCore::Enc128(c) => c.encrypt_block_mut(block),
            CbcCore::Enc192(c) => c.encrypt_block_mut(block),
            CbcCore::Enc256(c) => c.encrypt_block_mut(block),
            CbcCore::Dec128(c) => c.decrypt_block_mut(block),
            CbcCore::Dec192(c) => c.decrypt_block_mut(block),
            CbcCore::Dec256(c) => c.decrypt_block_mut(block),
        }
    }

    fn is_encryptor(&self) -> bool {
        matches!(
            self,
            CbcCore::Enc128(_) | CbcCore::Enc192(_) | CbcCore::Enc256(_)
        )
    }
}

struct CbcState {
    core: CbcCore,
    /// Input not yet processed because it does not fill a block, or, when
    /// decrypting, the held-back last block that carries the padding
    pending: Vec<u8>,
    /// Whether any input was ever supplied
    seen_input: bool,
}

impl CbcState {
    fn update(&mut self, input: &[u8]) -> Vec<u8> {
        if !input.is_empty() {
            self.seen_input = true;
        }
        self.pending.extend_from_slice(input);

        let len = self.pending.len();
        let ready = if self.core.is_encryptor() || len % BLOCK_SIZE != 0 {
            len - len % BLOCK_SIZE
        } else {
            len.saturating_sub(BLOCK_SIZE)
        };

        let mut out: Vec<u8> = self.pending.drain(..ready).collect();
        for chunk in out.chunks_exact_mut(BLOCK_SIZE) {
            self.core.process(aes::Block::from_mut_slice(chunk));
        }
        out
    }

    fn finish(mut self) -> Result<Vec<u8>> {
        if self.core.is_encryptor() {
            let pos = self.pending.len();
            let mut block = aes::Block::default();
            block[..pos].copy_from_slice(&self.pending);
            <Pkcs7 as Padding<U16>>::pad(&mut block, pos);
            self.core.process(&mut block);
            return Ok(block.to_vec());
        }

        if !self.seen_input {
            return Ok(Vec::new());
        }

        if self.pending.len() != BLOCK_SIZE {
            return Err(Error::Decryption(
                "wrong final block length - ciphertext truncated or not encrypted".to_string(),
            ));
        }

        let mut block = aes::Block::default();
        block.copy_from_slice(&self.pending);
        self.core.process(&mut block);
        let unpadded = <Pkcs7 as Padding<U16>>::unpad(&block)
            .map_err(|_| Error::Decryption("bad decrypt - wrong key or corrupted data".to_string()))?;
        Ok(unpadded.to_vec())
    }
}

struct GcmState {
    algorithm: CipherAlgorithm,
    key: Zeroizing<Vec<u8>>,
    nonce: [u8; GCM_NONCE_SIZE],
    aad: Vec<u8>,
    buffer: Vec<u8>,
    encrypt: bool,
    auth_tag: Option<Vec<u8>>,
}

impl GcmState {
    fn sealing_key(&self) -> Result<LessSafeKey> {
        let alg = match self.algorithm {
            CipherAlgorithm::Aes128Gcm => &AES_128_GCM,
            _ => &AES_256_GCM,
        };
        let unbound = UnboundKey::new(alg, &self.key)
            .map_err(|_| Error::Cipher(format!("Failed to create {} key", self.algorithm)))?;
        Ok(LessSafeKey::new(unbound))
    }

    fn finish(mut self) -> Result<Finished> {
        let key = self.sealing_key()?;
        let nonce = Nonce::assume_unique_for_key(self.nonce);

        if self.encrypt {
            let tag = key
                .seal_in_place_separate_tag(nonce, Aad::from(&self.aad), &mut self.buffer)
                .map_err(|_| Error::Encryption("Encryption failed".to_string()))?;
            return Ok(Finished {
                data: self.buffer,
                auth_tag: Some(tag.as_ref().to_vec()),
            });
        }

        if let Some(tag) = self.auth_tag.take() {
            self.buffer.extend_from_slice(&tag);
        }
        if self.buffer.len() < TAG_SIZE {
            return Err(Error::Decryption("Ciphertext too short".to_string()));
        }

        let plain_len = key
            .open_in_place(nonce, Aad::from(&self.aad), &mut self.buffer)
            .map_err(|_| {
                Error::Decryption("Decryption failed - data corrupted or wrong key".to_string())
            })?
            .len();
        self.buffer.truncate(plain_len);

        Ok(Finished {
            data: self.buffer,
            auth_tag: None,
        })
    }
}

enum EngineState {
    Cbc(CbcState),
    Gcm(GcmState),
}

/// Single-use encryptor or decryptor
pub struct CipherEngine {
    algorithm: CipherAlgorithm,
    state: EngineState,
}

impl CipherEngine {
    /// Create an encryptor
    ///
    /// A missing IV means an all-zero IV for CBC modes; GCM requires one.
    pub fn encryptor(
        algorithm: CipherAlgorithm,
        key: &[u8],
        iv: Option<&[u8]>,
        auth_data: &[u8],
    ) -> Result<Self> {
        CipherEngine::build(algorithm, key, iv, auth_data, None, true)
    }

    /// Create a decryptor
    ///
    /// For GCM, `auth_tag` is the detached tag; when absent the tag is
    /// expected at the end of the ciphertext.
    pub fn decryptor(
        algorithm: CipherAlgorithm,
        key: &[u8],
        iv: Option<&[u8]>,
        auth_data: &[u8],
        auth_tag: Option<&[u8]>,
    ) -> Result<Self> {
        CipherEngine::build(algorithm, key, iv, auth_data, auth_tag, false)
    }

    fn build(
        algorithm: CipherAlgorithm,
        key: &[u8],
        iv: Option<&[u8]>,
        auth_data: &[u8],
        auth_tag: Option<&[u8]>,
        encrypt: bool,
    ) -> Result<Self> {
        algorithm.check_key(key)?;
        if let Some(iv) = iv {
            algorithm.check_iv(iv)?;
        }

        let state = if algorithm.is_authenticated() {
            let iv = iv.ok_or_else(|| {
                Error::Cipher(format!("{} requires an IV for every message", algorithm))
            })?;
            let mut nonce = [0u8; GCM_NONCE_SIZE];
            nonce.copy_from_slice(iv);
            EngineState::Gcm(GcmState {
                algorithm,
                key: Zeroizing::new(key.to_vec()),
                nonce,
                aad: auth_data.to_vec(),
                buffer: Vec::new(),
                encrypt,
                auth_tag: auth_tag.map(|t| t.to_vec()),
            })
        } else {
            let zero_iv = [0u8; BLOCK_SIZE];
            let iv = iv.unwrap_or(&zero_iv);
            EngineState::Cbc(CbcState {
                core: CbcCore::new(algorithm, key, iv, encrypt)?,
                pending: Vec::with_capacity(BLOCK_SIZE * 2),
                seen_input: false,
            })
        };

        Ok(CipherEngine { algorithm, state })
    }

    /// Algorithm this engine was built for
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    /// Feed more input, returning whatever output is ready
    ///
    /// Authenticated modes buffer everything until [`CipherEngine::finish`].
    pub fn update(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        match &mut self.state {
            EngineState::Cbc(state) => Ok(state.update(input)),
            EngineState::Gcm(state) => {
                state.buffer.extend_from_slice(input);
                Ok(Vec::new())
            }
        }
    }

    /// Flush the final block and consume the engine
    pub fn finish(self) -> Result<Finished> {
        match self.state {
            EngineState::Cbc(state) => Ok(Finished {
                data: state.finish()?,
                auth_tag: None,
            }),
            EngineState::Gcm(state) => state.finish(),
        }
    }

    /// Run a complete message through a fresh engine
    pub fn run(mut self, input: &[u8]) -> Result<Finished> {
        let mut out = self.update(input)?;
        let finished = self.finish()?;
        out.extend_from_slice(&finished.data);
        Ok(Finished {
            data: out,
            auth_tag: finished.auth_tag,
        })
    }
}
