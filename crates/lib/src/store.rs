//! The content-addressed build cache.
//!
//! The store keeps opaque file or directory entries under caller-chosen keys
//! (relative paths below the store root). Entries are append-only and
//! immutable once committed: every insertion is staged inside a sibling
//! staging directory on the same filesystem and then renamed into place, so
//! an entry either exists fully or not at all.
//!
//! # Deferred names
//!
//! [`Store::put_file`] and [`Store::put_dir`] take the final key as a
//! callback rather than a string because the key frequently depends on the
//! content hash, which is only known after the body has been written. The
//! thunk lets the producer finalise its hasher and name the entry without the
//! store reading the staged content a second time.
//!
//! # Commit protocol
//!
//! Rename from the staging area into the root is atomic on a single
//! filesystem. On a rename collision the existing destination is removed and
//! the rename retried once: keys are content-derived, so concurrent writers
//! committed byte-identical content and last-writer-wins is harmless. Failed
//! stagings are removed; cleanup failures are logged, never surfaced.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

/// Errors surfaced by the store. Each carries the key or path being worked
/// on; internal recoveries (rename collisions, cross-filesystem moves) are
/// not errors.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("creating store directory '{}': {}", .path.display(), .source)]
  Init { path: PathBuf, source: io::Error },

  #[error("checking for entry '{key}': {source}")]
  Stat { key: String, source: io::Error },

  #[error("staging entry: {0}")]
  Stage(#[source] io::Error),

  #[error("writing entry body: {0}")]
  Produce(#[source] io::Error),

  #[error("entry already contains '{relpath}'")]
  Duplicate { relpath: String },

  #[error("committing entry '{key}': {source}")]
  Commit { key: String, source: io::Error },

  #[error("removing moved source '{}': {}", .path.display(), .source)]
  RemoveSource { path: PathBuf, source: io::Error },
}

/// The insertion half of the store, factored out so the freezer can be
/// exercised against an in-memory cache in tests.
pub trait Cache {
  /// Stage a single file: `produce` writes the body into the provided sink
  /// and returns the file mode to apply; `name`, invoked only after
  /// `produce` succeeded, yields the final key.
  fn put_file(
    &self,
    produce: impl FnOnce(&mut dyn Write) -> io::Result<u32>,
    name: impl FnOnce() -> String,
  ) -> Result<(), StoreError>;

  /// Stage a directory entry: `populate` registers any number of files
  /// through the provided [`DirSink`]; `name` yields the final key once
  /// population succeeded.
  fn put_dir(
    &self,
    populate: impl FnOnce(&mut dyn DirSink) -> Result<(), StoreError>,
    name: impl FnOnce() -> String,
  ) -> Result<(), StoreError>;
}

/// Receiver for the files of one directory entry while it is being staged.
pub trait DirSink {
  /// Add one file under `relpath`, creating intermediate directories as
  /// needed. Registering the same relpath twice is an error.
  fn register(
    &mut self,
    relpath: &str,
    produce: &mut dyn FnMut(&mut dyn Write) -> io::Result<u32>,
  ) -> Result<(), StoreError>;
}

/// Filesystem store rooted at a single directory, with a sibling staging
/// area (`<root>.tmp`) guaranteed to be on the same filesystem.
pub struct Store {
  root: PathBuf,
  staging: PathBuf,
}

impl Store {
  /// Open (creating if necessary, mode 0755) the store at `root` and its
  /// sibling staging directory.
  pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
    let root = root.into();
    let mut staging = root.clone().into_os_string();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);

    create_dir_0755(&root)?;
    create_dir_0755(&staging)?;

    Ok(Self { root, staging })
  }

  /// The store root. Builder scripts receive this as `$cachePath` so they can
  /// reference sibling entries.
  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Whether an entry exists under `key`. Only "not found" maps to `false`;
  /// any other I/O error surfaces.
  pub fn has(&self, key: &str) -> Result<bool, StoreError> {
    match fs::symlink_metadata(self.root.join(key)) {
      Ok(_) => Ok(true),
      Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
      Err(source) => Err(StoreError::Stat {
        key: key.to_string(),
        source,
      }),
    }
  }

  /// Move `src` (typically a builder output on the same filesystem) to
  /// `root/dst`. When the rename fails -- cross-filesystem moves being the
  /// common case -- fall back to streaming `src` into a new file entry and
  /// removing the original.
  pub fn move_file(&self, src: &Path, dst: &str) -> Result<(), StoreError> {
    let dest = self.root.join(dst);
    ensure_parent(&dest, dst)?;

    match fs::rename(src, &dest) {
      Ok(()) => Ok(()),
      Err(err) if dest.symlink_metadata().is_ok() => {
        // Collision: the key is content-derived, so replace and retry once.
        debug!(key = %dst, "replacing colliding cache entry");
        remove_entry(&dest).map_err(|source| StoreError::Commit {
          key: dst.to_string(),
          source,
        })?;
        match fs::rename(src, &dest) {
          Ok(()) => Ok(()),
          Err(_) => self.copy_then_remove(src, dst, err),
        }
      }
      Err(err) => self.copy_then_remove(src, dst, err),
    }
  }

  fn copy_then_remove(&self, src: &Path, dst: &str, rename_err: io::Error) -> Result<(), StoreError> {
    debug!(
      src = %src.display(),
      key = %dst,
      error = %rename_err,
      "rename into cache failed, falling back to copy"
    );
    self.put_file(
      |sink| {
        let mut file = File::open(src)?;
        let mode = file_mode(&file)?;
        io::copy(&mut file, sink)?;
        Ok(mode)
      },
      || dst.to_string(),
    )?;
    fs::remove_file(src).map_err(|source| StoreError::RemoveSource {
      path: src.to_path_buf(),
      source,
    })
  }

  fn stage_path(&self) -> PathBuf {
    self.staging.join(hex::encode(rand::random::<[u8; 8]>()))
  }

  /// Commit a staged artifact under `key`, creating intermediate directories
  /// below the root. On collision the destination is removed and the rename
  /// retried once.
  fn commit(&self, staged: &Path, key: &str) -> Result<(), StoreError> {
    let dest = self.root.join(key);
    ensure_parent(&dest, key)?;

    match fs::rename(staged, &dest) {
      Ok(()) => Ok(()),
      Err(err) if dest.symlink_metadata().is_ok() => {
        debug!(key = %key, "replacing colliding cache entry");
        remove_entry(&dest)
          .and_then(|()| fs::rename(staged, &dest))
          .map_err(|source| StoreError::Commit {
            key: key.to_string(),
            source,
          })
      }
      Err(source) => Err(StoreError::Commit {
        key: key.to_string(),
        source,
      }),
    }
  }
}

impl Cache for Store {
  fn put_file(
    &self,
    produce: impl FnOnce(&mut dyn Write) -> io::Result<u32>,
    name: impl FnOnce() -> String,
  ) -> Result<(), StoreError> {
    let staged = self.stage_path();

    let result = (|| {
      let mut file = File::create(&staged).map_err(StoreError::Stage)?;
      let mode = produce(&mut file).map_err(StoreError::Produce)?;
      file.flush().map_err(StoreError::Produce)?;
      drop(file);
      set_mode(&staged, mode)?;
      Ok(())
    })()
    .and_then(|()| self.commit(&staged, &name()));

    if result.is_err() {
      remove_staged(&staged);
    }
    result
  }

  fn put_dir(
    &self,
    populate: impl FnOnce(&mut dyn DirSink) -> Result<(), StoreError>,
    name: impl FnOnce() -> String,
  ) -> Result<(), StoreError> {
    let staged = self.stage_path();

    let result = fs::create_dir_all(&staged)
      .map_err(StoreError::Stage)
      .and_then(|()| {
        let mut sink = FsDirSink { dir: &staged };
        populate(&mut sink)
      })
      .and_then(|()| self.commit(&staged, &name()));

    if result.is_err() {
      remove_staged(&staged);
    }
    result
  }
}

struct FsDirSink<'a> {
  dir: &'a Path,
}

impl DirSink for FsDirSink<'_> {
  fn register(
    &mut self,
    relpath: &str,
    produce: &mut dyn FnMut(&mut dyn Write) -> io::Result<u32>,
  ) -> Result<(), StoreError> {
    let path = self.dir.join(relpath);
    if path.symlink_metadata().is_ok() {
      return Err(StoreError::Duplicate {
        relpath: relpath.to_string(),
      });
    }
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).map_err(StoreError::Stage)?;
    }

    let mut file = File::create(&path).map_err(StoreError::Stage)?;
    let mode = produce(&mut file).map_err(StoreError::Produce)?;
    file.flush().map_err(StoreError::Produce)?;
    drop(file);
    set_mode(&path, mode)
  }
}

fn ensure_parent(dest: &Path, key: &str) -> Result<(), StoreError> {
  if let Some(parent) = dest.parent() {
    fs::create_dir_all(parent).map_err(|source| StoreError::Commit {
      key: key.to_string(),
      source,
    })?;
  }
  Ok(())
}

fn remove_entry(path: &Path) -> io::Result<()> {
  let metadata = fs::symlink_metadata(path)?;
  if metadata.is_dir() {
    fs::remove_dir_all(path)
  } else {
    fs::remove_file(path)
  }
}

fn remove_staged(path: &Path) {
  let result = match fs::symlink_metadata(path) {
    Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
    Ok(_) => fs::remove_file(path),
    Err(err) if err.kind() == io::ErrorKind::NotFound => return,
    Err(err) => Err(err),
  };
  if let Err(err) = result {
    warn!(path = %path.display(), error = %err, "failed to remove staged artifact");
  }
}

fn create_dir_0755(path: &Path) -> Result<(), StoreError> {
  let mut builder = fs::DirBuilder::new();
  builder.recursive(true);
  #[cfg(unix)]
  {
    use std::os::unix::fs::DirBuilderExt;
    builder.mode(0o755);
  }
  builder.create(path).map_err(|source| StoreError::Init {
    path: path.to_path_buf(),
    source,
  })
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), StoreError> {
  use std::os::unix::fs::PermissionsExt;
  fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o777)).map_err(StoreError::Stage)
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), StoreError> {
  Ok(())
}

#[cfg(unix)]
fn file_mode(file: &File) -> io::Result<u32> {
  use std::os::unix::fs::PermissionsExt;
  Ok(file.metadata()?.permissions().mode())
}

#[cfg(not(unix))]
fn file_mode(_file: &File) -> io::Result<u32> {
  Ok(0o644)
}
