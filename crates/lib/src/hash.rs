//! Streaming digests used to fingerprint build inputs.
//!
//! Unlike a one-shot digest, a [`Hasher`] can be snapshotted mid-stream with
//! [`Hasher::sum`]: the freezer reads a source file exactly once, tees its
//! bytes into the cache while hashing them, and only afterwards asks the
//! hasher for the digest that names the cache entry. Construction goes through
//! zero-argument factory closures so each freezing step gets a fresh hasher at
//! a well-defined point; tests substitute a deterministic recorder.

use std::io::{self, Write};

use sha2::{Digest, Sha256};

/// A streaming digest with a non-finalising snapshot.
pub trait Hasher {
  /// Absorb bytes into the digest state.
  fn write(&mut self, bytes: &[u8]);

  /// Snapshot the digest over everything absorbed so far. Further writes
  /// remain possible; `sum` does not finalise.
  fn sum(&self) -> Vec<u8>;
}

/// Zero-argument hasher factory, injected wherever fresh hashers are needed.
pub type NewHasher = dyn Fn() -> Box<dyn Hasher>;

/// SHA-256 [`Hasher`]. Snapshots clone the inner state, so `sum` is cheap
/// relative to the streamed content and never disturbs the running digest.
#[derive(Default)]
pub struct Sha256Hasher(Sha256);

impl Sha256Hasher {
  pub fn new() -> Self {
    Self(Sha256::new())
  }
}

impl Hasher for Sha256Hasher {
  fn write(&mut self, bytes: &[u8]) {
    self.0.update(bytes);
  }

  fn sum(&self) -> Vec<u8> {
    self.0.clone().finalize().to_vec()
  }
}

/// Factory for the production hasher, shaped to match [`NewHasher`].
pub fn new_sha256() -> Box<dyn Hasher> {
  Box::new(Sha256Hasher::new())
}

/// An [`io::Write`] tee: forwards every byte to the inner sink and absorbs
/// the bytes actually written into the hasher. Lets file ingestion stream
/// content into the cache and the digest in a single pass.
pub struct HashWriter<'a> {
  pub hasher: &'a mut dyn Hasher,
  pub inner: &'a mut dyn Write,
}

impl Write for HashWriter<'_> {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    let written = self.inner.write(buf)?;
    self.hasher.write(&buf[..written]);
    Ok(written)
  }

  fn flush(&mut self) -> io::Result<()> {
    self.inner.flush()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sum_is_deterministic() {
    let mut a = Sha256Hasher::new();
    let mut b = Sha256Hasher::new();
    a.write(b"hello");
    b.write(b"hello");
    assert_eq!(a.sum(), b.sum());
  }

  #[test]
  fn sum_does_not_finalise() {
    let mut hasher = Sha256Hasher::new();
    hasher.write(b"hello");
    let first = hasher.sum();
    assert_eq!(first, hasher.sum(), "snapshot must not disturb the state");

    hasher.write(b" world");
    assert_ne!(first, hasher.sum(), "later writes must change the digest");
  }

  #[test]
  fn incremental_writes_match_one_shot() {
    let mut incremental = Sha256Hasher::new();
    incremental.write(b"foo");
    incremental.write(b"bar");

    let mut one_shot = Sha256Hasher::new();
    one_shot.write(b"foobar");

    assert_eq!(incremental.sum(), one_shot.sum());
  }

  #[test]
  fn hash_writer_tees_into_both() {
    let mut hasher = Sha256Hasher::new();
    let mut sink = Vec::new();

    io::copy(
      &mut &b"stream me"[..],
      &mut HashWriter {
        hasher: &mut hasher,
        inner: &mut sink,
      },
    )
    .unwrap();

    assert_eq!(sink, b"stream me");

    let mut direct = Sha256Hasher::new();
    direct.write(b"stream me");
    assert_eq!(hasher.sum(), direct.sum());
  }
}
