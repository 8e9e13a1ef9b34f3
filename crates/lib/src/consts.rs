//! Shared constants.

/// Marker file whose nearest ancestor directory is the workspace root.
pub const WORKSPACE_FILE: &str = "WORKSPACE";

/// Directory under the workspace root holding external packages.
pub const VENDOR_DIR: &str = ".vendor";

/// Module address built when the CLI is invoked without arguments.
pub const DEFAULT_MODULE: &str = ".";

/// Top-level symbol built when no target name is given.
pub const DEFAULT_TARGET: &str = "__DEFAULT__";

/// File loaded when a module address names a directory.
pub const DEFAULT_MODULE_FILE: &str = "default.lua";

/// Suffix that marks a module address as an explicit file.
pub const MODULE_SUFFIX: &str = ".lua";

/// Cache directory name under `$HOME/.cache`.
pub const CACHE_DIR_NAME: &str = "gubernator";
