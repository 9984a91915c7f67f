//! Streaming encryption and decryption of arbitrarily large data
//!
//! Streams always use a block cipher in CBC mode; authenticated ciphers
//! need the whole message before the tag can be checked and are rejected.

mod reader;
mod writer;

pub use reader::{
    decrypt_stream, header_present_in, is_empty_file, read_file, Lines, Reader, ReaderOptions,
};
pub use writer::{Writer, WriterOptions};

/// Default bytes read from the inner stream at a time
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Smallest buffer that still holds any header
pub const MIN_BUFFER_SIZE: usize = 128;
