//! Workspace discovery.
//!
//! The workspace root is the nearest ancestor of the starting directory that
//! contains a `WORKSPACE` marker file. External packages live under
//! `<root>/.vendor/<name>`: a subdirectory is a package iff it carries its
//! own `WORKSPACE` file, and the resulting `{name -> path}` map is what the
//! Lua adapter resolves `"pkg:module"` addresses against.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::consts::{VENDOR_DIR, WORKSPACE_FILE};

#[derive(Debug, Error)]
pub enum WorkspaceError {
  #[error("'{}' isn't inside of a workspace (WORKSPACE file not found in any parent directory)", .start.display())]
  NotFound { start: PathBuf },

  #[error("resolving current directory: {0}")]
  CurrentDir(#[source] io::Error),

  #[error("checking '{}': {}", .path.display(), .source)]
  Stat { path: PathBuf, source: io::Error },

  #[error("reading vendor directory '{}': {}", .path.display(), .source)]
  Vendor { path: PathBuf, source: io::Error },
}

/// Walk up from `start` (with `"."` meaning the current directory) until a
/// directory containing `WORKSPACE` is found.
pub fn find_root(start: &Path) -> Result<PathBuf, WorkspaceError> {
  let start = if start == Path::new(".") {
    std::env::current_dir().map_err(WorkspaceError::CurrentDir)?
  } else {
    start.to_path_buf()
  };

  let mut dir = start.as_path();
  loop {
    let marker = dir.join(WORKSPACE_FILE);
    match std::fs::symlink_metadata(&marker) {
      Ok(_) => return Ok(dir.to_path_buf()),
      Err(err) if err.kind() == io::ErrorKind::NotFound => match dir.parent() {
        Some(parent) => dir = parent,
        None => return Err(WorkspaceError::NotFound { start }),
      },
      Err(source) => return Err(WorkspaceError::Stat { path: marker, source }),
    }
  }
}

/// Scan `<root>/.vendor` for external packages. A missing vendor directory
/// simply yields an empty map.
pub fn load_packages(root: &Path) -> Result<HashMap<String, PathBuf>, WorkspaceError> {
  let vendor = root.join(VENDOR_DIR);
  let entries = match std::fs::read_dir(&vendor) {
    Ok(entries) => entries,
    Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
    Err(source) => return Err(WorkspaceError::Vendor { path: vendor, source }),
  };

  let mut packages = HashMap::new();
  for entry in entries {
    let entry = entry.map_err(|source| WorkspaceError::Vendor {
      path: vendor.clone(),
      source,
    })?;
    let package_dir = entry.path();
    if !package_dir.is_dir() {
      continue;
    }

    let marker = package_dir.join(WORKSPACE_FILE);
    match std::fs::symlink_metadata(&marker) {
      Ok(_) => {
        packages.insert(entry.file_name().to_string_lossy().into_owned(), package_dir);
      }
      Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
      Err(source) => return Err(WorkspaceError::Stat { path: marker, source }),
    }
  }

  Ok(packages)
}
