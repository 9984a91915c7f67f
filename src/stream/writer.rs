//! Streaming encryption
//!
//! [`Writer`] encrypts everything written to it block by block and passes
//! the ciphertext to the wrapped stream, so memory use does not grow with
//! the size of the data.

use crate::cipher::CipherRegistry;
use crate::crypto::{CipherAlgorithm, CipherEngine, Key};
use crate::error::{Error, Result};
use crate::header::Header;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Options for [`Writer::new`]
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Cipher version to use; the primary when `None`
    pub version: Option<u8>,
    /// Override the cipher's algorithm (recorded in the header)
    pub cipher_name: Option<String>,
    /// Write a header; forced on by any of the options below
    pub header: bool,
    /// Encrypt with a fresh key, stored in the header under the cipher's key
    pub random_key: bool,
    /// Encrypt with a fresh IV, stored in the header
    pub random_iv: bool,
    /// Deflate before encrypting
    pub compress: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        WriterOptions {
            version: None,
            cipher_name: None,
            header: true,
            random_key: true,
            random_iv: true,
            compress: false,
        }
    }
}

/// Encrypts written bytes into the inner stream
struct EncryptSink<W: Write> {
    inner: W,
    engine: Option<CipherEngine>,
}

impl<W: Write> EncryptSink<W> {
    /// Write the final padded block
    fn finish(&mut self) -> io::Result<()> {
        if let Some(engine) = self.engine.take() {
            let finished = engine.finish()?;
            self.inner.write_all(&finished.data)?;
        }
        self.inner.flush()
    }
}

impl<W: Write> Write for EncryptSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let engine = self
            .engine
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "stream already closed"))?;
        let out = engine.update(buf)?;
        self.inner.write_all(&out)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

enum Stage<W: Write> {
    Plain(EncryptSink<W>),
    Compressed(ZlibEncoder<EncryptSink<W>>),
}

impl<W: Write> Stage<W> {
    fn finish(self) -> io::Result<W> {
        let mut sink = match self {
            Stage::Plain(sink) => sink,
            Stage::Compressed(encoder) => encoder.finish()?,
        };
        sink.finish()?;
        Ok(sink.inner)
    }
}

/// Encrypting stream adapter
///
/// Call [`Writer::close`] when done: it writes the final block and returns
/// the inner stream. Dropping an unclosed writer finalizes it on a best
/// effort basis and can only log errors.
pub struct Writer<W: Write> {
    stage: Option<Stage<W>>,
    size: u64,
}

impl<W: Write> Writer<W> {
    /// Start an encrypted stream, writing the header immediately
    pub fn new(mut ios: W, registry: &CipherRegistry, options: WriterOptions) -> Result<Self> {
        let cipher = registry.require_cipher(options.version)?;
        let algorithm = match &options.cipher_name {
            Some(name) => CipherAlgorithm::from_name(name)?,
            None => cipher.key().algorithm(),
        };
        if !algorithm.supports_streaming() {
            return Err(Error::Cipher(format!(
                "{} is not supported for streaming",
                algorithm
            )));
        }

        let header_required = options.header
            || options.compress
            || options.random_key
            || options.random_iv;

        let key_bytes = if options.random_key {
            algorithm.random_key()
        } else {
            Zeroizing::new(cipher.key().key().to_vec())
        };
        let iv = if options.random_iv || options.random_key {
            Some(algorithm.random_iv())
        } else {
            cipher.key().iv().map(|iv| iv.to_vec())
        };
        let stream_key = Key::with_algorithm(&key_bytes, iv.as_deref(), algorithm, cipher.version())?;

        if header_required {
            let header = Header {
                version: cipher.version(),
                compressed: options.compress,
                iv: if options.random_iv || options.random_key {
                    iv.clone()
                } else {
                    None
                },
                key: options.random_key.then(|| key_bytes.clone()),
                cipher_name: options.cipher_name.as_ref().map(|_| algorithm.name().to_string()),
                auth_tag: None,
            };
            ios.write_all(&header.write(Some(registry))?)?;
        }

        debug!(
            version = cipher.version(),
            cipher = algorithm.name(),
            header = header_required,
            compress = options.compress,
            "Opened encrypting writer"
        );

        let sink = EncryptSink {
            inner: ios,
            engine: Some(stream_key.encryptor(None, b"")?),
        };
        let stage = if options.compress {
            Stage::Compressed(ZlibEncoder::new(sink, Compression::default()))
        } else {
            Stage::Plain(sink)
        };

        Ok(Writer {
            stage: Some(stage),
            size: 0,
        })
    }

    /// Plaintext bytes written so far
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Write the final block and return the inner stream
    pub fn close(mut self) -> Result<W> {
        let stage = self
            .stage
            .take()
            .ok_or_else(|| Error::Cipher("Writer already closed".to_string()))?;
        let inner = stage.finish().map_err(Error::from_io)?;
        debug!(size = self.size, "Closed encrypting writer");
        Ok(inner)
    }

    /// Encrypt everything from `source` into `target`
    ///
    /// Returns the number of plaintext bytes copied.
    pub fn encrypt_stream<S: Read>(
        source: &mut S,
        target: W,
        registry: &CipherRegistry,
        options: WriterOptions,
        block_size: usize,
    ) -> Result<u64> {
        let mut writer = Writer::new(target, registry, options)?;
        let mut buffer = vec![0u8; block_size.max(1)];
        let copied = loop {
            let n = match source.read(&mut buffer) {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(Error::from_io(e)),
            };
            if let Err(e) = writer.write_all(&buffer[..n]) {
                break Err(Error::from_io(e));
            }
        };
        if let Err(e) = copied {
            writer.abandon();
            return Err(e);
        }
        let size = writer.size();
        writer.close()?;
        Ok(size)
    }

    /// Discard the stream without writing the final block
    ///
    /// The inner stream keeps whatever was already written, so a truncated
    /// stream fails to decrypt instead of passing for a complete one.
    fn abandon(&mut self) {
        if let Some(Stage::Compressed(mut encoder)) = self.stage.take() {
            // The encoder flushes on drop; a sink without an engine refuses it
            encoder.get_mut().engine = None;
        }
        warn!(size = self.size, "Abandoned encrypting writer after an error");
    }
}

impl Writer<BufWriter<File>> {
    /// Create (or truncate) an encrypted file
    pub fn create<P: AsRef<Path>>(
        path: P,
        registry: &CipherRegistry,
        options: WriterOptions,
    ) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        Writer::new(BufWriter::new(file), registry, options)
    }
}

impl<W: Write> Write for Writer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match self.stage.as_mut() {
            Some(Stage::Plain(sink)) => sink.write(buf)?,
            Some(Stage::Compressed(encoder)) => encoder.write(buf)?,
            None => {
                return Err(io::Error::new(io::ErrorKind::Other, "stream already closed"));
            }
        };
        self.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.stage.as_mut() {
            Some(Stage::Plain(sink)) => sink.flush(),
            Some(Stage::Compressed(encoder)) => encoder.flush(),
            None => Ok(()),
        }
    }
}

impl<W: Write> Drop for Writer<W> {
    fn drop(&mut self) {
        if let Some(stage) = self.stage.take() {
            warn!(size = self.size, "Encrypting writer dropped without close");
            if let Err(e) = stage.finish() {
                warn!(error = %e, "Failed to finalize dropped writer");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::Cipher;
    use crate::encoding::Encoding;
    use crate::header::MAGIC_HEADER;

    fn registry() -> CipherRegistry {
        let key = Key::new(b"1234567890ABCDEF", Some(b"1234567890ABCDEF"), "aes-128-cbc", 1).unwrap();
        CipherRegistry::new(vec![Cipher::new(key, Encoding::Base64Strict, true)]).unwrap()
    }

    #[test]
    fn test_write_returns_plaintext_length() {
        let registry = registry();
        let mut writer = Writer::new(Vec::new(), &registry, WriterOptions::default()).unwrap();
        assert_eq!(writer.write(b"hello").unwrap(), 5);
        assert_eq!(writer.write(b" world!").unwrap(), 7);
        assert_eq!(writer.size(), 12);

        let out = writer.close().unwrap();
        assert!(out.starts_with(MAGIC_HEADER));
        assert_eq!(registry.binary_decrypt(&out, None).unwrap(), b"hello world!");
    }

    #[test]
    fn test_no_header_matches_single_shot() {
        let registry = registry();
        let options = WriterOptions {
            header: false,
            random_key: false,
            random_iv: false,
            ..WriterOptions::default()
        };
        let mut writer = Writer::new(Vec::new(), &registry, options).unwrap();
        writer.write_all(b"987654321").unwrap();
        let out = writer.close().unwrap();

        let single = registry.primary().key().encrypt(b"987654321", b"").unwrap();
        assert_eq!(out, single);
    }

    #[test]
    fn test_compress_forces_header() {
        let registry = registry();
        let options = WriterOptions {
            header: false,
            random_key: false,
            random_iv: false,
            compress: true,
            ..WriterOptions::default()
        };
        let data = b"squash ".repeat(1000);
        let mut writer = Writer::new(Vec::new(), &registry, options).unwrap();
        writer.write_all(&data).unwrap();
        let out = writer.close().unwrap();

        assert!(out.starts_with(MAGIC_HEADER));
        assert!(out.len() < data.len() / 4);
        assert_eq!(registry.binary_decrypt(&out, None).unwrap(), data);
    }

    #[test]
    fn test_random_key_streams_differ() {
        let registry = registry();
        let encrypt = || {
            let mut writer = Writer::new(Vec::new(), &registry, WriterOptions::default()).unwrap();
            writer.write_all(b"same data").unwrap();
            writer.close().unwrap()
        };
        assert_ne!(encrypt(), encrypt());
    }

    #[test]
    fn test_authenticated_cipher_rejected() {
        let registry = registry();
        let options = WriterOptions {
            cipher_name: Some("aes-256-gcm".to_string()),
            ..WriterOptions::default()
        };
        assert!(matches!(
            Writer::new(Vec::new(), &registry, options),
            Err(Error::Cipher(_))
        ));
    }

    #[test]
    fn test_cipher_name_override() {
        let registry = registry();
        let options = WriterOptions {
            cipher_name: Some("aes-256-cbc".to_string()),
            ..WriterOptions::default()
        };
        let mut writer = Writer::new(Vec::new(), &registry, options).unwrap();
        writer.write_all(b"bigger key").unwrap();
        let out = writer.close().unwrap();
        assert_eq!(registry.binary_decrypt(&out, None).unwrap(), b"bigger key");
    }

    #[test]
    fn test_unknown_version_rejected() {
        let registry = registry();
        let options = WriterOptions {
            version: Some(9),
            ..WriterOptions::default()
        };
        assert!(Writer::new(Vec::new(), &registry, options).is_err());
    }

    #[test]
    fn test_encrypt_stream() {
        let registry = registry();
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();
        let mut target = Vec::new();
        let copied = Writer::encrypt_stream(
            &mut &data[..],
            &mut target,
            &registry,
            WriterOptions::default(),
            333,
        )
        .unwrap();
        assert_eq!(copied, 5000);
        assert_eq!(registry.binary_decrypt(&target, None).unwrap(), data);
    }

    #[test]
    fn test_drop_finalizes() {
        let registry = registry();
        let mut out = Vec::new();
        {
            let mut writer = Writer::new(&mut out, &registry, WriterOptions::default()).unwrap();
            writer.write_all(b"dropped, not closed").unwrap();
        }
        assert_eq!(registry.binary_decrypt(&out, None).unwrap(), b"dropped, not closed");
    }

    struct FailAfter {
        data: Vec<u8>,
    }

    impl Read for FailAfter {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.data.is_empty() {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "source went away"));
            }
            let n = buf.len().min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data.drain(..n);
            Ok(n)
        }
    }

    #[test]
    fn test_encrypt_stream_source_error_leaves_no_final_block() {
        let registry = registry();
        for compress in [false, true] {
            let mut target = Vec::new();
            let options = WriterOptions {
                compress,
                ..WriterOptions::default()
            };
            let mut source = FailAfter { data: b"12345".to_vec() };
            let result = Writer::encrypt_stream(&mut source, &mut target, &registry, options, 64);
            assert!(matches!(result, Err(Error::Io(_))));

            let header_len = Header::default().parse(&target, &registry).unwrap();
            assert!(header_len > 0);
            assert_eq!(target.len(), header_len);
        }
    }
}
