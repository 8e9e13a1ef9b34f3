//! Freezing: targets -> derivations.
//!
//! The freezer walks a target and all of its argument sub-expressions,
//! streams referenced source files into the cache while hashing them, and
//! produces a [`Derivation`] whose identity is a hash of every literal byte
//! that can influence the build.
//!
//! Each argument variant hashes with its own fresh hasher and parents absorb
//! the child *hash*, not the child content. That keeps sibling inputs
//! independent and makes the whole algorithm tree-hashable: a file changes,
//! its entry hash changes, and the change ripples up through exactly the
//! targets that depend on it.
//!
//! File ingestion absorbs the relative path, the three permission octets, and
//! the content bytes, so a fingerprint is sensitive to everything a builder
//! can observe about an input: name, executability, content.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use thiserror::Error;

use crate::derivation::Derivation;
use crate::hash::{HashWriter, Hasher, NewHasher};
use crate::store::{Cache, StoreError};
use crate::target::{Arg, Sub, Target};

#[derive(Debug, Error)]
pub enum FreezeError {
  #[error("invalid glob pattern '{pattern}': {source}")]
  Pattern {
    pattern: String,
    source: glob::PatternError,
  },

  #[error("matching pattern '{pattern}': {source}")]
  Expand {
    pattern: String,
    source: glob::GlobError,
  },

  #[error("glob match '{}' escapes the package root", .path.display())]
  OutsideRoot { path: PathBuf },

  #[error("no substitution for placeholder '${{{key}}}'")]
  UnresolvedPlaceholder { key: String },

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("freezing argument {index} of target '{target}': {source}")]
  Arg {
    target: String,
    index: usize,
    #[source]
    source: Box<FreezeError>,
  },

  #[error("freezing substitution '{key}': {source}")]
  Substitution {
    key: String,
    #[source]
    source: Box<FreezeError>,
  },
}

/// The frozen form of a single argument.
struct ArgValue {
  /// The string handed to the builder in this argument's slot.
  value: String,
  /// Contributes to the parent target's hash.
  hash: Vec<u8>,
  /// Derivations that must be built before the consuming target.
  derivations: Vec<Rc<Derivation>>,
}

/// Freeze `target` against `package_root`, ingesting referenced source files
/// into `cache` along the way.
pub fn freeze<C: Cache>(
  package_root: &Path,
  new_hasher: &NewHasher,
  cache: &C,
  target: &Target,
) -> Result<Rc<Derivation>, FreezeError> {
  let freezer = Freezer {
    package_root,
    new_hasher,
    cache,
  };
  let (derivation, _) = freezer.freeze_target(target)?;
  Ok(derivation)
}

struct Freezer<'a, C> {
  package_root: &'a Path,
  new_hasher: &'a NewHasher,
  cache: &'a C,
}

impl<C: Cache> Freezer<'_, C> {
  fn freeze_target(&self, target: &Target) -> Result<(Rc<Derivation>, Vec<u8>), FreezeError> {
    let mut hasher = (self.new_hasher)();
    hasher.write(target.name.as_bytes());
    hasher.write(target.builder.as_bytes());
    for entry in &target.env {
      hasher.write(entry.as_bytes());
    }

    let mut dependencies = Vec::new();
    let mut args = Vec::with_capacity(target.args.len());
    for (index, arg) in target.args.iter().enumerate() {
      let frozen = self.freeze_arg(arg).map_err(|source| FreezeError::Arg {
        target: target.name.clone(),
        index,
        source: Box::new(source),
      })?;

      dependencies.extend(frozen.derivations);
      // The arg's hash feeds the target hash, so any change to the arg
      // invalidates the target.
      hasher.write(&frozen.hash);
      args.push(frozen.value);
    }

    let hash = hasher.sum();
    let derivation = Rc::new(Derivation {
      id: format!("{}-{}", hex::encode(&hash), target.name),
      hash: hash.clone(),
      dependencies,
      builder: target.builder.clone(),
      args,
      env: target.env.clone(),
    });
    Ok((derivation, hash))
  }

  fn freeze_arg(&self, arg: &Arg) -> Result<ArgValue, FreezeError> {
    match arg {
      Arg::Str(text) => {
        let mut hasher = (self.new_hasher)();
        hasher.write(text.as_bytes());
        Ok(ArgValue {
          value: text.clone(),
          hash: hasher.sum(),
          derivations: Vec::new(),
        })
      }
      Arg::Target(target) => {
        let (child, hash) = self.freeze_target(target)?;
        Ok(ArgValue {
          value: child.id.clone(),
          hash,
          derivations: vec![child],
        })
      }
      Arg::Path(relpath) => self.freeze_path(relpath),
      Arg::Glob(patterns) => self.freeze_glob(patterns),
      Arg::Sub(sub) => self.freeze_sub(sub),
    }
  }

  /// Ingest one source file. The entry key depends on the content hash,
  /// which is only known once the body has streamed through, so the name
  /// callback snapshots the hasher after ingestion.
  fn freeze_path(&self, relpath: &str) -> Result<ArgValue, FreezeError> {
    let hasher = RefCell::new((self.new_hasher)());
    self.cache.put_file(
      |sink| ingest_file(self.package_root, relpath, &mut **hasher.borrow_mut(), sink),
      || format!("{}/{}", hex::encode(hasher.borrow().sum()), relpath),
    )?;

    let hash = hasher.borrow().sum();
    Ok(ArgValue {
      value: format!("{}/{}", hex::encode(&hash), relpath),
      hash,
      derivations: Vec::new(),
    })
  }

  /// Ingest a glob set as a single directory entry. One hasher spans every
  /// matched file; the sort makes the result independent of filesystem
  /// enumeration order.
  fn freeze_glob(&self, patterns: &[String]) -> Result<ArgValue, FreezeError> {
    let relpaths = self.glob_matches(patterns)?;

    let hasher = RefCell::new((self.new_hasher)());
    self.cache.put_dir(
      |dir| {
        for relpath in &relpaths {
          dir.register(relpath, &mut |sink| {
            ingest_file(self.package_root, relpath, &mut **hasher.borrow_mut(), sink)
          })?;
        }
        Ok(())
      },
      || hex::encode(hasher.borrow().sum()),
    )?;

    let hash = hasher.borrow().sum();
    Ok(ArgValue {
      value: hex::encode(&hash),
      hash,
      derivations: Vec::new(),
    })
  }

  /// Expand `patterns` against the package root: deduplicate patterns,
  /// deduplicate resolved paths (two patterns may match the same file), sort
  /// the result for stable hashing.
  fn glob_matches(&self, patterns: &[String]) -> Result<Vec<String>, FreezeError> {
    let mut seen_patterns = HashSet::new();
    let mut seen_paths = HashSet::new();
    let mut relpaths = Vec::new();

    for pattern in patterns {
      if !seen_patterns.insert(pattern.as_str()) {
        continue;
      }

      let full = self.package_root.join(pattern);
      let matches = glob::glob(&full.to_string_lossy()).map_err(|source| FreezeError::Pattern {
        pattern: pattern.clone(),
        source,
      })?;
      for entry in matches {
        let path = entry.map_err(|source| FreezeError::Expand {
          pattern: pattern.clone(),
          source,
        })?;
        let relpath = path
          .strip_prefix(self.package_root)
          .map_err(|_| FreezeError::OutsideRoot { path: path.clone() })?
          .to_string_lossy()
          .into_owned();
        if seen_paths.insert(relpath.clone()) {
          relpaths.push(relpath);
        }
      }
    }

    relpaths.sort();
    Ok(relpaths)
  }

  fn freeze_sub(&self, sub: &Sub) -> Result<ArgValue, FreezeError> {
    let mut hasher = (self.new_hasher)();
    hasher.write(sub.format.as_bytes());

    let mut message = sub.format.clone();
    let mut derivations = Vec::new();
    for substitution in &sub.substitutions {
      let frozen = self
        .freeze_arg(&substitution.value)
        .map_err(|source| FreezeError::Substitution {
          key: substitution.key.clone(),
          source: Box::new(source),
        })?;

      derivations.extend(frozen.derivations);
      hasher.write(substitution.key.as_bytes());
      hasher.write(&frozen.hash);
      // Later substitutions see the output of earlier ones.
      message = message.replace(&format!("${{{}}}", substitution.key), &frozen.value);
    }

    // A leftover `${Key}` is valid shell syntax, so letting it through would
    // surface as a confusing builder-time failure at best.
    if let Some(key) = unresolved_placeholder(&message) {
      return Err(FreezeError::UnresolvedPlaceholder { key });
    }

    Ok(ArgValue {
      value: message,
      hash: hasher.sum(),
      derivations,
    })
  }
}

/// Stream one source file into `sink` while absorbing its relative path,
/// permission octets, and content into `hasher`. Returns the file's mode.
fn ingest_file(root: &Path, relpath: &str, hasher: &mut dyn Hasher, sink: &mut dyn Write) -> io::Result<u32> {
  let mut file = File::open(root.join(relpath))?;
  let mode = source_mode(&file)?;

  hasher.write(relpath.as_bytes());
  hasher.write(&[
    ((mode >> 6) & 0o7) as u8,
    ((mode >> 3) & 0o7) as u8,
    (mode & 0o7) as u8,
  ]);
  io::copy(
    &mut file,
    &mut HashWriter {
      hasher,
      inner: sink,
    },
  )?;
  Ok(mode)
}

#[cfg(unix)]
fn source_mode(file: &File) -> io::Result<u32> {
  use std::os::unix::fs::PermissionsExt;
  Ok(file.metadata()?.permissions().mode())
}

#[cfg(not(unix))]
fn source_mode(file: &File) -> io::Result<u32> {
  let _ = file;
  Ok(0o644)
}

/// Find the first `${Word}` placeholder left in `message`, if any.
fn unresolved_placeholder(message: &str) -> Option<String> {
  let mut rest = message;
  while let Some(start) = rest.find("${") {
    let tail = &rest[start + 2..];
    let end = tail.find('}')?;
    let key = &tail[..end];
    if !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
      return Some(key.to_string());
    }
    rest = &tail[end + 1..];
  }
  None
}
