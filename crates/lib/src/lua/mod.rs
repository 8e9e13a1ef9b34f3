//! The embedded configuration language.
//!
//! Targets are declared in Lua 5.4. Scripts see a small set of globals that
//! mirror the argument variants -- `target`, `sub`, `path`, `glob` -- plus a
//! `load` builtin for cross-module references:
//!
//! ```lua
//! local tool = load("tools.lua", "tool")
//!
//! hello = target {
//!   name = "hello",
//!   builder = "/bin/bash",
//!   args = { "-c", sub("${Tool} ${Config} > $out", { { "Tool", tool }, { "Config", path("hello.cfg") } }) },
//!   env = { "LANG=C" },
//! }
//!
//! __DEFAULT__ = hello
//! ```
//!
//! Each module executes in its own environment table (falling back to the
//! shared globals for reads), so its top-level assignments become the module
//! bindings that `load` and the build front end look up. Substitutions in
//! `sub` are written as an ordered array of `{key, value}` pairs because Lua
//! string-keyed tables have no defined iteration order, and substitution
//! order is significant.

mod eval;
mod globals;
mod loader;
mod value;

pub use eval::{EvalError, Evaluator};
