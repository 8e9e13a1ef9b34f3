//! Derivation execution.
//!
//! [`build`] realises a single derivation: it runs the builder in a fresh
//! temp directory with a controlled environment, freezes the output's
//! permissions, and commits it into the cache under the derivation id.
//! [`build_recursive`] walks a derivation graph leaves-first, skipping
//! anything already present in the cache.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::derivation::Derivation;
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum BuildError {
  #[error("creating temporary build directory: {0}")]
  TempDir(#[source] io::Error),

  #[error("capturing builder output: {0}")]
  Capture(#[source] io::Error),

  #[error("spawning builder '{builder}': {source}")]
  Spawn { builder: String, source: io::Error },

  #[error("builder '{builder}' failed ({status}); output:\n{output}")]
  BuilderFailed {
    builder: String,
    status: ExitStatus,
    output: String,
  },

  #[error("builder succeeded but didn't create output file")]
  NoOutput,

  #[error("walking output artifact: {0}")]
  Walk(#[from] walkdir::Error),

  #[error("chmodding output artifact '{}': {}", .path.display(), .source)]
  Chmod { path: PathBuf, source: io::Error },

  #[error("checking cache for key '{id}': {source}")]
  CacheCheck { id: String, source: StoreError },

  #[error("moving output file into cache: {0}")]
  Store(#[from] StoreError),

  #[error("building '{id}': {source}")]
  Derivation {
    id: String,
    #[source]
    source: Box<BuildError>,
  },
}

/// Build a derivation's dependencies recursively, leaves first, then the
/// derivation itself. Every step consults the cache before doing any work,
/// so a second run over the same graph is a no-op. Dependencies shared
/// between targets are not deduplicated here; the cache-hit check in the
/// repeated visits is what keeps them from rebuilding.
pub fn build_recursive(store: &Store, derivation: &Derivation, tmp_base: &Path) -> Result<(), BuildError> {
  let exists = store.has(&derivation.id).map_err(|source| BuildError::CacheCheck {
    id: derivation.id.clone(),
    source,
  })?;
  if exists {
    info!(id = %derivation.id, "already built");
    return Ok(());
  }

  for dependency in &derivation.dependencies {
    build_recursive(store, dependency, tmp_base)?;
  }

  info!(id = %derivation.id, "rebuilding");
  build(store, derivation, tmp_base).map_err(|source| BuildError::Derivation {
    id: derivation.id.clone(),
    source: Box::new(source),
  })
}

/// Build one derivation, unconditionally, and commit its output under
/// `derivation.id`. Dependencies must already be in the cache.
///
/// `tmp_base` must be on the same filesystem as the cache root: the commit
/// is a rename. (The usual choice is the cache root itself; system temp
/// directories are often on a separate tmpfs.)
pub fn build(store: &Store, derivation: &Derivation, tmp_base: &Path) -> Result<(), BuildError> {
  let tmp = tempfile::tempdir_in(tmp_base).map_err(BuildError::TempDir)?;
  let out_path = tmp.path().join(hex::encode(rand::random::<[u8; 8]>()));

  // stdout and stderr share one capture so the two streams interleave the
  // way they would on a terminal.
  let capture = tempfile::tempfile().map_err(BuildError::Capture)?;

  let mut command = Command::new(&derivation.builder);
  command
    .args(&derivation.args)
    .current_dir(tmp.path())
    .stdin(Stdio::null())
    .stdout(clone_capture(&capture)?)
    .stderr(clone_capture(&capture)?)
    .env_clear();
  for entry in &derivation.env {
    match entry.split_once('=') {
      Some((key, value)) => command.env(key, value),
      None => command.env(entry, ""),
    };
  }
  // Applied after the declared env so the tool's values always win.
  command.env("cachePath", store.root()).env("out", &out_path);

  debug!(builder = %derivation.builder, dir = %tmp.path().display(), "spawning builder");
  let status = command.status().map_err(|source| BuildError::Spawn {
    builder: derivation.builder.clone(),
    source,
  })?;
  if !status.success() {
    return Err(BuildError::BuilderFailed {
      builder: derivation.builder.clone(),
      status,
      output: read_capture(capture),
    });
  }

  if fs::symlink_metadata(&out_path).is_err() {
    return Err(BuildError::NoOutput);
  }

  // Freeze the artifact against in-place mutation before it enters the
  // cache. Not a security boundary.
  make_immutable(&out_path)?;
  store.move_file(&out_path, &derivation.id)?;

  if let Err(err) = tmp.close() {
    warn!(error = %err, "failed to remove temporary build directory");
  }
  Ok(())
}

fn clone_capture(capture: &File) -> Result<Stdio, BuildError> {
  Ok(Stdio::from(capture.try_clone().map_err(BuildError::Capture)?))
}

fn read_capture(mut capture: File) -> String {
  let mut output = String::new();
  if capture.seek(SeekFrom::Start(0)).is_ok() {
    let _ = capture.read_to_string(&mut output);
  }
  output
}

/// Recursively clear every write bit under `path` while ensuring read and
/// execute stay set: each entry's mode becomes `(old & !0o777) | 0o555`,
/// preserving the type and any high bits. Contents are processed before
/// their directories so the chmod itself never locks us out.
fn make_immutable(path: &Path) -> Result<(), BuildError> {
  for entry in WalkDir::new(path).contents_first(true) {
    let entry = entry?;
    if entry.file_type().is_symlink() {
      continue;
    }
    squash_write_bits(entry.path())?;
  }
  Ok(())
}

#[cfg(unix)]
fn squash_write_bits(path: &Path) -> Result<(), BuildError> {
  use std::os::unix::fs::PermissionsExt;

  let with_chmod_context = |source: io::Error| BuildError::Chmod {
    path: path.to_path_buf(),
    source,
  };
  let metadata = fs::symlink_metadata(path).map_err(with_chmod_context)?;
  let mode = (metadata.permissions().mode() & !0o777) | 0o555;
  fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(with_chmod_context)
}

#[cfg(not(unix))]
fn squash_write_bits(_path: &Path) -> Result<(), BuildError> {
  Ok(())
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;

  use std::os::unix::fs::PermissionsExt;
  use std::rc::Rc;

  fn test_store() -> (tempfile::TempDir, Store) {
    let temp = tempfile::tempdir().unwrap();
    let store = Store::open(temp.path().join("cache")).unwrap();
    (temp, store)
  }

  fn bash_derivation(id: &str, script: &str) -> Derivation {
    Derivation {
      id: id.to_string(),
      hash: id.as_bytes().to_vec(),
      dependencies: Vec::new(),
      builder: "/bin/bash".to_string(),
      args: vec!["-c".to_string(), script.to_string()],
      env: Vec::new(),
    }
  }

  fn mode_of(path: &Path) -> u32 {
    fs::metadata(path).unwrap().permissions().mode() & 0o777
  }

  #[test]
  fn build_commits_the_artifact() {
    let (_temp, store) = test_store();
    let derivation = bash_derivation("echo-drv", "echo hi > $out");

    build(&store, &derivation, store.root()).unwrap();

    let artifact = store.root().join("echo-drv");
    assert_eq!(fs::read(&artifact).unwrap(), b"hi\n");
  }

  #[test]
  fn artifact_is_immutable_after_build() {
    let (_temp, store) = test_store();
    let derivation = bash_derivation("locked-drv", "echo hi > $out");

    build(&store, &derivation, store.root()).unwrap();

    let mode = mode_of(&store.root().join("locked-drv"));
    assert_eq!(mode & 0o222, 0, "write bits must be cleared, got {mode:o}");
    assert_eq!(mode & 0o555, 0o555, "read+execute must be set, got {mode:o}");
  }

  #[test]
  fn directory_artifacts_are_frozen_recursively() {
    let (_temp, store) = test_store();
    let derivation = bash_derivation("tree-drv", "/bin/mkdir -p $out/sub && echo data > $out/sub/file");

    build(&store, &derivation, store.root()).unwrap();

    let root = store.root().join("tree-drv");
    for path in [root.clone(), root.join("sub"), root.join("sub/file")] {
      assert_eq!(mode_of(&path) & 0o222, 0, "write bits left on {}", path.display());
    }
    assert_eq!(fs::read(root.join("sub/file")).unwrap(), b"data\n");
  }

  #[test]
  fn nonzero_exit_carries_captured_output() {
    let (_temp, store) = test_store();
    let derivation = bash_derivation("failing-drv", "echo to-stdout; echo to-stderr >&2; exit 3");

    let err = build(&store, &derivation, store.root()).unwrap_err();
    match err {
      BuildError::BuilderFailed { output, .. } => {
        assert!(output.contains("to-stdout"), "stdout missing from capture: {output}");
        assert!(output.contains("to-stderr"), "stderr missing from capture: {output}");
      }
      other => panic!("expected BuilderFailed, got {other}"),
    }
    assert!(!store.has("failing-drv").unwrap());
  }

  #[test]
  fn zero_exit_without_output_is_a_distinct_error() {
    let (_temp, store) = test_store();
    let derivation = bash_derivation("silent-drv", "true");

    let err = build(&store, &derivation, store.root()).unwrap_err();
    assert!(matches!(err, BuildError::NoOutput), "got {err}");
  }

  #[test]
  fn reserved_env_names_override_user_entries() {
    let (_temp, store) = test_store();
    let mut derivation = bash_derivation("env-drv", r#"printf '%s' "$cachePath" > $out"#);
    derivation.env = vec![
      "out=/prohibited/elsewhere".to_string(),
      "cachePath=/prohibited/cache".to_string(),
    ];

    build(&store, &derivation, store.root()).unwrap();

    // The artifact landed under the real id (so $out was the tool's path)
    // and recorded the real cache root (so $cachePath was too).
    let body = fs::read_to_string(store.root().join("env-drv")).unwrap();
    assert_eq!(body, store.root().to_string_lossy());
  }

  #[test]
  fn declared_env_reaches_the_builder() {
    let (_temp, store) = test_store();
    let mut derivation = bash_derivation("greeting-drv", r#"printf '%s' "$GREETING" > $out"#);
    derivation.env = vec!["GREETING=hello from env".to_string()];

    build(&store, &derivation, store.root()).unwrap();

    let body = fs::read_to_string(store.root().join("greeting-drv")).unwrap();
    assert_eq!(body, "hello from env");
  }

  #[test]
  fn build_cleans_up_its_temp_directory() {
    let (temp, store) = test_store();
    let tmp_base = temp.path().join("scratch");
    fs::create_dir(&tmp_base).unwrap();

    let derivation = bash_derivation("tidy-drv", "echo hi > $out");
    build(&store, &derivation, &tmp_base).unwrap();

    assert_eq!(fs::read_dir(&tmp_base).unwrap().count(), 0);
  }

  #[test]
  fn recursive_build_runs_dependencies_first() {
    let (_temp, store) = test_store();

    let child = Rc::new(bash_derivation("child-drv", "echo child > $out"));
    let parent = Derivation {
      id: "parent-drv".to_string(),
      hash: b"parent".to_vec(),
      dependencies: vec![child],
      builder: "/bin/bash".to_string(),
      // The parent reads its dependency out of the cache, which only works
      // if the child was committed before the parent ran.
      args: vec!["-c".to_string(), "/bin/cat $cachePath/child-drv > $out".to_string()],
      env: Vec::new(),
    };

    build_recursive(&store, &parent, store.root()).unwrap();

    assert_eq!(fs::read(store.root().join("parent-drv")).unwrap(), b"child\n");
  }

  #[test]
  fn rebuild_is_idempotent() {
    let (temp, store) = test_store();
    let log = temp.path().join("invocations");

    let derivation = bash_derivation(
      "counted-drv",
      &format!("echo ran >> {} && echo hi > $out", log.display()),
    );

    build_recursive(&store, &derivation, store.root()).unwrap();
    build_recursive(&store, &derivation, store.root()).unwrap();

    let invocations = fs::read_to_string(&log).unwrap();
    assert_eq!(invocations.lines().count(), 1, "builder must run exactly once");
  }

  #[test]
  fn cache_hit_short_circuits_without_spawning() {
    let (_temp, store) = test_store();

    // Pre-populate the cache under the derivation's id; the builder binary
    // doesn't exist, so any spawn attempt would fail loudly.
    fs::write(store.root().join("prebuilt-drv"), b"already here").unwrap();
    let derivation = Derivation {
      id: "prebuilt-drv".to_string(),
      hash: b"prebuilt".to_vec(),
      dependencies: Vec::new(),
      builder: "/no/such/builder".to_string(),
      args: Vec::new(),
      env: Vec::new(),
    };

    build_recursive(&store, &derivation, store.root()).unwrap();

    assert_eq!(fs::read(store.root().join("prebuilt-drv")).unwrap(), b"already here");
  }
}
