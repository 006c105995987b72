//! Fixed-window chunking with content-addressed ids.
//!
//! Files are split into fixed-size windows (the server uses 1 MiB). Each
//! window's id is the hex SHA-256 of its bytes, so identical windows across
//! files share an id. The `Chunker` accumulates a byte stream and yields
//! complete windows as they fill, which lets the upload pipeline hash and
//! place chunks without ever buffering the whole file.

use sha2::{Digest, Sha256};

/// Hex SHA-256 of the given bytes, i.e. the content address of a chunk.
pub fn chunk_id(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Incremental whole-file hasher.
///
/// Feed it the same bytes that go through the chunker; `finish()` yields the
/// file-level hash stored on the file row.
pub struct FileHasher {
    inner: Sha256,
}

impl Default for FileHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl FileHasher {
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finish(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

/// Accumulates streamed bytes into fixed-size windows.
pub struct Chunker {
    window: usize,
    buf: Vec<u8>,
}

impl Chunker {
    /// `window` must be non-zero; the chunker panics on a zero window because
    /// that is a programming error, not an input error.
    pub fn new(window: usize) -> Self {
        assert!(window > 0, "chunk window must be non-zero");
        Self {
            window,
            buf: Vec::with_capacity(window),
        }
    }

    /// Append bytes and return every complete window now available, in order.
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();
        while self.buf.len() >= self.window {
            let rest = self.buf.split_off(self.window);
            out.push(std::mem::replace(&mut self.buf, rest));
        }
        out
    }

    /// Flush the trailing partial window, if any. Ends the stream.
    pub fn finish(mut self) -> Option<Vec<u8>> {
        if self.buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }
}
