//! Streaming decryption
//!
//! [`Reader`] decrypts a stream written by [`super::Writer`] (or any
//! single-shot ciphertext) a buffer at a time.

use super::{DEFAULT_BUFFER_SIZE, MIN_BUFFER_SIZE};
use crate::cipher::CipherRegistry;
use crate::crypto::{CipherEngine, Key};
use crate::error::{Error, Result};
use crate::header::{Header, MAGIC_HEADER_SIZE};
use flate2::read::ZlibDecoder;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::debug;

/// Options for [`Reader::new`]
#[derive(Debug, Clone, Copy)]
pub struct ReaderOptions {
    /// Bytes read from the inner stream at a time
    pub buffer_size: usize,
    /// Cipher version for streams without a header; the primary when `None`
    pub version: Option<u8>,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        ReaderOptions {
            buffer_size: DEFAULT_BUFFER_SIZE,
            version: None,
        }
    }
}

/// Decrypts the inner stream
struct DecryptSource<R: Read> {
    inner: R,
    engine: Option<CipherEngine>,
    /// Ciphertext already read while looking for the header
    prefix: Vec<u8>,
    out: Vec<u8>,
    out_pos: usize,
    buffer_size: usize,
}

impl<R: Read> DecryptSource<R> {
    fn fill(&mut self) -> io::Result<()> {
        let chunk = if self.prefix.is_empty() {
            let mut chunk = vec![0u8; self.buffer_size];
            let n = self.inner.read(&mut chunk)?;
            chunk.truncate(n);
            chunk
        } else {
            std::mem::take(&mut self.prefix)
        };

        self.out_pos = 0;
        self.out = if chunk.is_empty() {
            match self.engine.take() {
                Some(engine) => engine.finish()?.data,
                None => Vec::new(),
            }
        } else {
            match self.engine.as_mut() {
                Some(engine) => engine.update(&chunk)?,
                None => {
                    return Err(Error::Decryption(
                        "Data found after the final block".to_string(),
                    )
                    .into());
                }
            }
        };
        Ok(())
    }
}

impl<R: Read> Read for DecryptSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.out_pos >= self.out.len() {
            if self.engine.is_none() {
                return Ok(0);
            }
            self.fill()?;
        }
        let n = buf.len().min(self.out.len() - self.out_pos);
        buf[..n].copy_from_slice(&self.out[self.out_pos..self.out_pos + n]);
        self.out_pos += n;
        Ok(n)
    }
}

enum Source<R: Read> {
    Plain(DecryptSource<R>),
    Inflate(ZlibDecoder<DecryptSource<R>>),
}

impl<R: Read> Source<R> {
    fn into_inner(self) -> R {
        match self {
            Source::Plain(source) => source.inner,
            Source::Inflate(decoder) => decoder.into_inner().inner,
        }
    }
}

impl<R: Read> Read for Source<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Source::Plain(source) => source.read(buf),
            Source::Inflate(decoder) => decoder.read(buf),
        }
    }
}

/// Decrypting stream adapter
///
/// The header, when present, decides the version, key, IV, cipher and
/// compression. Without one, the cipher for [`ReaderOptions::version`] is
/// used with its own key and IV.
pub struct Reader<'a, R: Read> {
    registry: &'a CipherRegistry,
    options: ReaderOptions,
    source: Option<Source<R>>,
    /// Plaintext read ahead by line reads and `eof`
    pending: Vec<u8>,
    header_present: bool,
    version: u8,
    compressed: bool,
    pos: u64,
}

impl<'a, R: Read> Reader<'a, R> {
    /// Start decrypting `ios`, reading and parsing the header immediately
    pub fn new(ios: R, registry: &'a CipherRegistry, options: ReaderOptions) -> Result<Self> {
        if options.buffer_size < MIN_BUFFER_SIZE {
            return Err(Error::Config(format!(
                "Buffer size cannot be smaller than {}",
                MIN_BUFFER_SIZE
            )));
        }

        let mut reader = Reader {
            registry,
            options,
            source: None,
            pending: Vec::new(),
            header_present: false,
            version: 0,
            compressed: false,
            pos: 0,
        };
        reader.open(ios)?;
        Ok(reader)
    }

    fn open(&mut self, mut ios: R) -> Result<()> {
        let mut first = vec![0u8; self.options.buffer_size];
        let n = read_full(&mut ios, &mut first)?;
        first.truncate(n);

        let mut header = Header::default();
        let consumed = header.parse(&first, self.registry)?;
        self.header_present = consumed > 0;

        let key = if self.header_present {
            let cipher = self.registry.require_cipher(Some(header.version))?;
            let algorithm = match &header.cipher_name {
                Some(name) => name.parse()?,
                None => cipher.key().algorithm(),
            };
            let key_bytes = header.key.as_deref().map_or(cipher.key().key(), |k| &k[..]);
            let iv = header.iv.as_deref().or(cipher.key().iv());
            Key::with_algorithm(key_bytes, iv, algorithm, header.version)?
        } else {
            self.registry.require_cipher(self.options.version)?.key().clone()
        };

        if !key.algorithm().supports_streaming() {
            return Err(Error::Cipher(format!(
                "{} is not supported for streaming",
                key.algorithm()
            )));
        }

        self.version = key.version();
        self.compressed = self.header_present && header.compressed;

        debug!(
            version = self.version,
            cipher = key.cipher_name(),
            header = self.header_present,
            compressed = self.compressed,
            "Opened decrypting reader"
        );

        let source = DecryptSource {
            inner: ios,
            engine: Some(key.decryptor(None, b"", None)?),
            prefix: first.split_off(consumed),
            out: Vec::new(),
            out_pos: 0,
            buffer_size: self.options.buffer_size,
        };
        self.source = Some(if self.compressed {
            Source::Inflate(ZlibDecoder::new(source))
        } else {
            Source::Plain(source)
        });
        self.pending.clear();
        self.pos = 0;
        Ok(())
    }

    fn source(&mut self) -> io::Result<&mut Source<R>> {
        self.source
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "stream is closed"))
    }

    /// Read up to `len` bytes, fewer only at the end of the stream
    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        (&mut *self)
            .take(len as u64)
            .read_to_end(&mut out)
            .map_err(Error::from_io)?;
        Ok(out)
    }

    /// Read the rest of the stream
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.read_to_end(&mut out).map_err(Error::from_io)?;
        Ok(out)
    }

    /// Read through the next `delimiter`, or `limit` bytes, or the end
    ///
    /// The delimiter is included in the returned line. Returns `None` once
    /// the stream is exhausted.
    pub fn read_line(&mut self, delimiter: &[u8], limit: Option<usize>) -> Result<Option<Vec<u8>>> {
        if delimiter.is_empty() {
            return Err(Error::Config("Line delimiter cannot be empty".to_string()));
        }

        let mut scanned: usize = 0;
        loop {
            let start = scanned.saturating_sub(delimiter.len() - 1);
            if let Some(i) = find(&self.pending[start..], delimiter) {
                let end = start + i + delimiter.len();
                return Ok(Some(self.take_pending(end, limit)));
            }
            if let Some(limit) = limit {
                if self.pending.len() >= limit {
                    return Ok(Some(self.take_pending(limit, None)));
                }
            }
            scanned = self.pending.len();

            if self.fill_pending()? == 0 {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                let len = self.pending.len();
                return Ok(Some(self.take_pending(len, limit)));
            }
        }
    }

    /// Iterate over lines ending in `delimiter`
    pub fn lines<'r>(&'r mut self, delimiter: &[u8]) -> Lines<'r, 'a, R> {
        Lines {
            reader: self,
            delimiter: delimiter.to_vec(),
        }
    }

    /// Whether all plaintext has been read
    pub fn eof(&mut self) -> Result<bool> {
        if !self.pending.is_empty() {
            return Ok(false);
        }
        Ok(self.fill_pending()? == 0)
    }

    /// Plaintext bytes returned so far
    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn header_present(&self) -> bool {
        self.header_present
    }

    /// Version of the cipher decrypting this stream
    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Give back the inner stream, positioned wherever decryption stopped
    pub fn into_inner(mut self) -> Result<R> {
        self.source
            .take()
            .map(Source::into_inner)
            .ok_or_else(|| Error::Cipher("Reader already closed".to_string()))
    }

    fn take_pending(&mut self, end: usize, limit: Option<usize>) -> Vec<u8> {
        let end = limit.map_or(end, |limit| end.min(limit));
        let rest = self.pending.split_off(end);
        let line = std::mem::replace(&mut self.pending, rest);
        self.pos += line.len() as u64;
        line
    }

    fn fill_pending(&mut self) -> Result<usize> {
        let mut chunk = vec![0u8; self.options.buffer_size];
        let n = self
            .source()
            .and_then(|source| source.read(&mut chunk))
            .map_err(Error::from_io)?;
        self.pending.extend_from_slice(&chunk[..n]);
        Ok(n)
    }
}

impl<'a, R: Read + Seek> Reader<'a, R> {
    /// Restart decryption from the beginning of the stream
    pub fn rewind(&mut self) -> Result<()> {
        let mut inner = self
            .source
            .take()
            .map(Source::into_inner)
            .ok_or_else(|| Error::Cipher("Reader already closed".to_string()))?;
        inner.seek(SeekFrom::Start(0))?;
        self.open(inner)
    }

    fn seek_plaintext(&mut self, target: SeekFrom) -> Result<u64> {
        let target = match target {
            SeekFrom::Start(offset) => offset,
            SeekFrom::Current(delta) => offset_by(self.pos, delta)?,
            SeekFrom::End(delta) => {
                // Length is unknown until the stream has been decrypted
                io::copy(self, &mut io::sink()).map_err(Error::from_io)?;
                offset_by(self.pos, delta)?
            }
        };

        if target < self.pos {
            self.rewind()?;
        }
        let skip = target - self.pos;
        io::copy(&mut (&mut *self).take(skip), &mut io::sink()).map_err(Error::from_io)?;
        Ok(self.pos)
    }
}

impl<R: Read> Read for Reader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = if self.pending.is_empty() {
            self.source()?.read(buf)?
        } else {
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            n
        };
        self.pos += n as u64;
        Ok(n)
    }
}

/// Seeking decrypts forward from the current position, or from the start
/// for backward and end-relative seeks.
impl<R: Read + Seek> Seek for Reader<'_, R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.seek_plaintext(pos).map_err(io::Error::from)
    }
}

/// Iterator returned by [`Reader::lines`]
pub struct Lines<'r, 'a, R: Read> {
    reader: &'r mut Reader<'a, R>,
    delimiter: Vec<u8>,
}

impl<R: Read> Iterator for Lines<'_, '_, R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.reader.read_line(&self.delimiter, None).transpose()
    }
}

impl<'a> Reader<'a, BufReader<File>> {
    /// Open an encrypted file
    pub fn open_file<P: AsRef<Path>>(
        path: P,
        registry: &'a CipherRegistry,
        options: ReaderOptions,
    ) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Reader::new(BufReader::new(file), registry, options)
    }
}

/// Decrypt a whole file into memory
pub fn read_file<P: AsRef<Path>>(path: P, registry: &CipherRegistry) -> Result<Vec<u8>> {
    Reader::open_file(path, registry, ReaderOptions::default())?.read_all()
}

/// Decrypt everything from `source` into `target`
///
/// Returns the number of plaintext bytes written.
pub fn decrypt_stream<R: Read, W: Write>(
    source: R,
    target: &mut W,
    registry: &CipherRegistry,
    options: ReaderOptions,
) -> Result<u64> {
    let mut reader = Reader::new(source, registry, options)?;
    let copied = io::copy(&mut reader, target).map_err(Error::from_io)?;
    Ok(copied)
}

/// Whether an encrypted file holds no plaintext
///
/// Missing and zero length files count as empty.
pub fn is_empty_file<P: AsRef<Path>>(path: P, registry: &CipherRegistry) -> Result<bool> {
    let path = path.as_ref();
    match std::fs::metadata(path) {
        Ok(meta) if meta.len() == 0 => return Ok(true),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    }
    Reader::open_file(path, registry, ReaderOptions::default())?.eof()
}

/// Whether a file starts with an encryption header
pub fn header_present_in<P: AsRef<Path>>(path: P) -> Result<bool> {
    let mut file = File::open(path.as_ref())?;
    let mut start = [0u8; MAGIC_HEADER_SIZE + 2];
    let n = read_full(&mut file, &mut start)?;
    Ok(Header::present(&start[..n]))
}

fn read_full<R: Read>(ios: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match ios.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(Error::from_io(e)),
        }
    }
    Ok(filled)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn offset_by(pos: u64, delta: i64) -> Result<u64> {
    pos.checked_add_signed(delta)
        .ok_or_else(|| Error::Config(format!("Invalid seek offset {} from {}", delta, pos)))
}
