//! Integrity: SHA-256 content hashes, lowercase hex, verified before anything is trusted.

use std::io::{self, Read};

use sha2::{Digest, Sha256};

/// Buffer size for hashing readers (64 KiB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Incremental SHA-256 over a byte stream.
#[derive(Default)]
pub struct ContentHasher {
    inner: Sha256,
    len: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
        self.len += bytes.len() as u64;
    }

    /// Bytes hashed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finalize_hex(self) -> String {
        format!("{:x}", self.inner.finalize())
    }
}

/// Hash a payload. Returns the lowercase hex digest.
pub fn hash_bytes(payload: &[u8]) -> String {
    let mut hasher = ContentHasher::new();
    hasher.update(payload);
    hasher.finalize_hex()
}

/// Hash everything a reader yields. Returns (digest, byte count).
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<(String, u64)> {
    let mut hasher = ContentHasher::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    let len = hasher.len();
    Ok((hasher.finalize_hex(), len))
}
