//! Digests stored in the manifest of an artifact.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

/// Digest over the archived content, independent of the compression.
///
/// Every entry contributes its relative path and size, followed by its
/// content (or link target for symlinks). Restoring an archive and backing
/// up the restored tree again therefore yields the same digest.
#[derive(Clone, Default)]
pub struct ContentDigest {
    hasher: Sha256,
    entries: u64,
}

impl ContentDigest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a regular file entry; its content follows through [update](Self::update).
    pub fn file(&mut self, rel_path: &str, size: u64) {
        self.entries += 1;
        self.hasher.update(b"F");
        self.hasher.update(rel_path.as_bytes());
        self.hasher.update([0]);
        self.hasher.update(size.to_le_bytes());
    }

    pub fn symlink(&mut self, rel_path: &str, target: &str) {
        self.entries += 1;
        self.hasher.update(b"L");
        self.hasher.update(rel_path.as_bytes());
        self.hasher.update([0]);
        self.hasher.update(target.as_bytes());
        self.hasher.update([0]);
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Number of entries added so far.
    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Reader feeding everything read into a [ContentDigest].
pub struct DigestReader<'a, R> {
    inner: R,
    digest: &'a mut ContentDigest,
}

impl<'a, R: Read> DigestReader<'a, R> {
    pub fn new(inner: R, digest: &'a mut ContentDigest) -> Self {
        Self { inner, digest }
    }
}

impl<R: Read> Read for DigestReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }
}

/// SHA-256 of a whole file, hex encoded.
pub fn file_digest(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;

    Ok(hex::encode(hasher.finalize()))
}
