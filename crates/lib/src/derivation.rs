//! A frozen target: directly executable, identified by a content hash.

use std::fmt;
use std::rc::Rc;

use serde::Serialize;

/// The imperative form of a target, produced by freezing.
///
/// The `id` is `"{hex(hash)}-{name}"` where the hash covers the target name,
/// builder, env entries, and the hash of every argument after freezing. Two
/// targets with identical observable inputs produce identical ids.
///
/// `dependencies` lists, in freezer emission order, every derivation that
/// must exist in the cache before this one's builder may run. Shared
/// sub-derivations are shared by reference, so the graph is a DAG.
#[derive(Debug, Clone, Serialize)]
pub struct Derivation {
  pub id: String,
  pub hash: Vec<u8>,
  pub dependencies: Vec<Rc<Derivation>>,
  pub builder: String,
  /// Arguments with every input resolved to a plain string.
  pub args: Vec<String>,
  pub env: Vec<String>,
}

impl fmt::Display for Derivation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match serde_json::to_string_pretty(self) {
      Ok(json) => f.write_str(&json),
      Err(_) => write!(f, "<derivation {}>", self.id),
    }
  }
}
