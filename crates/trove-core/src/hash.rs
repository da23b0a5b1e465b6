//! Content identity.
//!
//! A file's hash is always computed from the bytes we actually read.
//! We never derive it from size, mtime or anything else cheap.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::str::FromStr;

const READ_CHUNK: usize = 64 * 1024;

/// A BLAKE3 digest of a file's content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hashes an in-memory buffer.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    /// Hashes everything a reader yields.
    pub fn of_reader<R: Read>(reader: R) -> std::io::Result<Self> {
        let mut hasher = ContentHasher::new();
        hasher.consume(reader)?;
        Ok(hasher.finish())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable
        write!(f, "ContentHash({})", &self.to_hex()[..12])
    }
}

impl FromStr for ContentHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        blake3::Hash::from_hex(s)
            .map(|h| Self(*h.as_bytes()))
            .map_err(|e| e.to_string())
    }
}

/// Incremental hasher for streamed content.
pub struct ContentHasher {
    inner: blake3::Hasher,
    bytes: u64,
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentHasher {
    pub fn new() -> Self {
        Self {
            inner: blake3::Hasher::new(),
            bytes: 0,
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.bytes += chunk.len() as u64;
        self.inner.update(chunk);
    }

    /// Reads `reader` to the end in fixed-size chunks.
    pub fn consume<R: Read>(&mut self, mut reader: R) -> std::io::Result<()> {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            self.update(&buf[..n]);
        }
    }

    /// Number of bytes fed so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes
    }

    pub fn finish(self) -> ContentHash {
        ContentHash(*self.inner.finalize().as_bytes())
    }
}
