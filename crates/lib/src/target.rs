//! The declarative target model.
//!
//! A [`Target`] is what the Lua adapter hands to the freezer: a builder
//! command plus ordered arguments and environment entries. Arguments are a
//! closed set of [`Arg`] variants; the adapter rejects anything else. Targets
//! are immutable once constructed.

use std::fmt;
use std::rc::Rc;

use serde::Serialize;

/// A user-authored description of how to produce one artifact.
#[derive(Debug, Clone, Serialize)]
pub struct Target {
  pub name: String,
  /// Command to execute; resolved by the OS at build time.
  pub builder: String,
  /// Ordered arguments; order is significant for the derivation hash.
  pub args: Vec<Arg>,
  /// Ordered `KEY=VALUE` entries; order is significant for the derivation hash.
  pub env: Vec<String>,
}

/// One target argument. The set is closed: the adapter only ever produces
/// these variants, and the freezer dispatches exhaustively over them.
#[derive(Debug, Clone, Serialize)]
pub enum Arg {
  /// A literal passed through verbatim.
  Str(String),
  /// A single source file, relative to the package root of the target that
  /// constructed it. Ingested into the cache by content during freezing.
  Path(String),
  /// A set of source files matched by glob patterns against the package
  /// root. Ingested as one cache directory entry.
  Glob(Vec<String>),
  /// Another target whose output artifact becomes this argument's value.
  Target(Rc<Target>),
  /// A templated string with `${Key}` placeholders.
  Sub(Sub),
}

/// A templated string argument. Substitutions are an ordered list: later
/// substitutions see the output of earlier ones, and the order feeds the
/// hash.
#[derive(Debug, Clone, Serialize)]
pub struct Sub {
  pub format: String,
  pub substitutions: Vec<Substitution>,
}

/// One `(key, value)` pair of a [`Sub`].
#[derive(Debug, Clone, Serialize)]
pub struct Substitution {
  pub key: String,
  pub value: Arg,
}

fn json_pretty<T: Serialize>(value: &T) -> String {
  serde_json::to_string_pretty(value).unwrap_or_else(|_| String::from("<unprintable>"))
}

impl fmt::Display for Target {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&json_pretty(self))
  }
}

impl fmt::Display for Sub {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&json_pretty(self))
  }
}

impl fmt::Display for Arg {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Arg::Str(text) => f.write_str(text),
      Arg::Path(relpath) => f.write_str(relpath),
      Arg::Glob(globs) => f.write_str(&json_pretty(&serde_json::json!({ "globs": globs }))),
      Arg::Target(target) => target.fmt(f),
      Arg::Sub(sub) => sub.fmt(f),
    }
  }
}
