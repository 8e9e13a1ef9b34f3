//! CLI smoke tests for g8r.
//!
//! Each test runs the real binary inside an isolated workspace with `HOME`
//! pointed at a scratch directory, so the cache never touches the host.

#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

struct TestWorkspace {
  temp: TempDir,
  root: PathBuf,
}

impl TestWorkspace {
  fn new() -> Self {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("workspace");
    fs::create_dir(&root).unwrap();
    fs::write(root.join("WORKSPACE"), b"").unwrap();
    fs::create_dir(temp.path().join("home")).unwrap();
    Self { temp, root }
  }

  fn write(&self, relpath: &str, body: &str) {
    let path = self.root.join(relpath);
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, body).unwrap();
  }

  fn cache_dir(&self) -> PathBuf {
    self.temp.path().join("home").join(".cache").join("gubernator")
  }

  fn cmd(&self) -> Command {
    let mut cmd = Command::cargo_bin("g8r").unwrap();
    cmd.current_dir(&self.root);
    cmd.env("HOME", self.temp.path().join("home"));
    cmd
  }
}

const HELLO_MODULE: &str = r#"
  __DEFAULT__ = target {
    name = "hello",
    builder = "/bin/bash",
    args = { "-c", "echo hello from g8r > $out" },
  }

  other = target {
    name = "other",
    builder = "/bin/bash",
    args = { "-c", "echo other artifact > $out" },
  }
"#;

#[test]
fn builds_the_default_target_and_prints_its_cache_path() {
  let workspace = TestWorkspace::new();
  workspace.write("default.lua", HELLO_MODULE);

  let output = workspace.cmd().assert().success();
  let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();

  let artifact = Path::new(stdout.trim());
  assert!(artifact.is_absolute(), "expected an absolute path, got {stdout}");
  assert!(artifact.starts_with(workspace.cache_dir()), "unexpected path {stdout}");
  assert_eq!(fs::read_to_string(artifact).unwrap(), "hello from g8r\n");
}

#[test]
fn builds_a_named_target() {
  let workspace = TestWorkspace::new();
  workspace.write("default.lua", HELLO_MODULE);

  let output = workspace.cmd().args([".", "other"]).assert().success();
  let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();

  assert!(stdout.trim().ends_with("-other"), "unexpected path {stdout}");
  assert_eq!(fs::read_to_string(stdout.trim()).unwrap(), "other artifact\n");
}

#[test]
fn second_run_is_a_cache_hit() {
  let workspace = TestWorkspace::new();
  workspace.write("default.lua", HELLO_MODULE);

  let first = workspace.cmd().assert().success();
  let first_path = String::from_utf8(first.get_output().stdout.clone()).unwrap();

  workspace
    .cmd()
    .assert()
    .success()
    .stdout(predicate::eq(first_path))
    .stderr(predicate::str::contains("already built"));
}

#[test]
fn fails_outside_a_workspace() {
  let temp = TempDir::new().unwrap();
  let mut cmd = Command::cargo_bin("g8r").unwrap();
  cmd.current_dir(temp.path());
  cmd.env("HOME", temp.path());

  cmd
    .assert()
    .failure()
    .stderr(predicate::str::contains("WORKSPACE"));
}

#[test]
fn fails_on_a_missing_target_symbol() {
  let workspace = TestWorkspace::new();
  workspace.write("default.lua", HELLO_MODULE);

  workspace
    .cmd()
    .args([".", "no_such_target"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("no_such_target"));
}

#[test]
fn surfaces_script_errors() {
  let workspace = TestWorkspace::new();
  workspace.write("default.lua", r#"error("config exploded")"#);

  workspace
    .cmd()
    .assert()
    .failure()
    .stderr(predicate::str::contains("config exploded"));
}

#[test]
fn builder_failures_include_the_captured_output() {
  let workspace = TestWorkspace::new();
  workspace.write(
    "default.lua",
    r#"
      __DEFAULT__ = target {
        name = "doomed",
        builder = "/bin/bash",
        args = { "-c", "echo diagnostic goes here >&2; exit 1" },
      }
    "#,
  );

  workspace
    .cmd()
    .assert()
    .failure()
    .stderr(predicate::str::contains("diagnostic goes here"));
}
