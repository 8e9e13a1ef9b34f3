//! gubernator: reproducible, incremental builds driven by Lua target declarations.
//!
//! A user declares targets in Lua; each names a builder executable, its
//! arguments, an environment, and a set of inputs. The library compiles that
//! declaration graph into a content-addressed graph of derivations
//! ([`freeze::freeze`]), then realises each derivation by invoking its builder
//! in a private working directory and committing the artifact into a local
//! filesystem cache ([`build::build_recursive`]). Because a derivation's
//! identity is a hash of every byte that can influence the build, a target is
//! rebuilt only when something it actually depends on has changed.
//!
//! The modules involved:
//! - [`target`]: the declarative model produced by the Lua adapter
//! - [`freeze`]: targets -> derivations, ingesting source files as it goes
//! - [`store`]: the content-addressed cache with atomic commits
//! - [`build`]: derivation execution and the leaves-first driver
//! - [`lua`]: the embedded configuration language
//! - [`workspace`]: `WORKSPACE` discovery and `.vendor` package scanning

pub mod build;
pub mod consts;
pub mod derivation;
pub mod freeze;
pub mod hash;
pub mod lua;
pub mod store;
pub mod target;
pub mod workspace;

pub use build::{BuildError, build, build_recursive};
pub use derivation::Derivation;
pub use freeze::{FreezeError, freeze};
pub use store::{Cache, DirSink, Store, StoreError};
pub use target::{Arg, Sub, Substitution, Target};
