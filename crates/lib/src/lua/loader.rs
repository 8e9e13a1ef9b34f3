//! Module loading with memoisation and cycle detection.
//!
//! A module address is `"pkg:module"` or just `"module"`; the empty package
//! means "the package of the calling module". A module that doesn't end in
//! `.lua` names a directory and resolves to its `default.lua`.
//!
//! Loads are memoised per address with a three-state slot: absent (never
//! loaded), in-progress (placeholder inserted before execution), and loaded
//! (bindings or error, both cached). Hitting an in-progress slot means the
//! load graph has a cycle. Package roots are tracked as a stack so that
//! relative loads made from inside an external package resolve against that
//! package, not the workspace root.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use mlua::prelude::*;

use crate::consts::{DEFAULT_MODULE_FILE, MODULE_SUFFIX};

enum ModuleSlot {
  /// Placeholder distinguishing "load in progress" from "never loaded".
  InProgress,
  Loaded(LuaResult<LuaTable>),
}

pub struct LoaderState {
  workspace_root: PathBuf,
  packages: HashMap<String, PathBuf>,
  modules: HashMap<String, ModuleSlot>,
  /// Stack of package roots; the top is the root of the module currently
  /// executing.
  roots: Vec<PathBuf>,
}

impl LoaderState {
  pub fn new(workspace_root: PathBuf, packages: HashMap<String, PathBuf>) -> Self {
    Self {
      workspace_root,
      packages,
      modules: HashMap::new(),
      roots: Vec::new(),
    }
  }

  fn current_root(&self) -> &Path {
    self.roots.last().map(PathBuf::as_path).unwrap_or(&self.workspace_root)
  }
}

/// Register the `load` builtin: `load(addr, name, ...)` loads the module and
/// returns the named bindings, in order, as multiple values.
pub fn register_load(lua: &Lua, state: Rc<RefCell<LoaderState>>) -> LuaResult<()> {
  let load = lua.create_function(move |lua, (addr, names): (String, LuaMultiValue)| {
    let bindings = load_module(lua, &state, &addr)?;

    let mut values = Vec::with_capacity(names.len());
    for name in names {
      let name = match name {
        LuaValue::String(name) => name.to_str()?.to_string(),
        other => {
          return Err(LuaError::external(format!(
            "load(): symbol names must be strings, got {}",
            other.type_name()
          )));
        }
      };
      let value: LuaValue = bindings.raw_get(name.as_str())?;
      if value.is_nil() {
        return Err(LuaError::external(format!(
          "module '{addr}' has no symbol '{name}'"
        )));
      }
      values.push(value);
    }
    Ok(LuaMultiValue::from_iter(values))
  })?;

  lua.globals().set("load", load)?;
  Ok(())
}

/// Load a module by address, memoised. Returns the module's bindings table.
pub fn load_module(lua: &Lua, state: &Rc<RefCell<LoaderState>>, addr: &str) -> LuaResult<LuaTable> {
  {
    let guard = state.borrow();
    match guard.modules.get(addr) {
      Some(ModuleSlot::InProgress) => {
        return Err(LuaError::external("cycle in load graph"));
      }
      Some(ModuleSlot::Loaded(result)) => return result.clone(),
      None => {}
    }
  }

  state
    .borrow_mut()
    .modules
    .insert(addr.to_string(), ModuleSlot::InProgress);

  let result = exec_module(lua, state, addr);

  state
    .borrow_mut()
    .modules
    .insert(addr.to_string(), ModuleSlot::Loaded(result.clone()));
  result
}

fn exec_module(lua: &Lua, state: &Rc<RefCell<LoaderState>>, addr: &str) -> LuaResult<LuaTable> {
  let (pkg, module) = parse_address(addr);
  let (package_root, file_path) = {
    let guard = state.borrow();
    resolve_module(guard.current_root(), &guard.packages, pkg, module)?
  };

  let source = fs::read_to_string(&file_path).map_err(|err| {
    if err.kind() == io::ErrorKind::NotFound {
      LuaError::external(format!("module '{module}' not found in package '{pkg}'"))
    } else {
      LuaError::external(format!("loading module '{module}': {err}"))
    }
  })?;

  // Fresh environment: reads fall back to the shared globals, top-level
  // assignments stay here and become the module's bindings.
  let env = lua.create_table()?;
  let mt = lua.create_table()?;
  mt.set("__index", lua.globals())?;
  env.set_metatable(Some(mt));

  state.borrow_mut().roots.push(package_root);
  let result = lua
    .load(&source)
    .set_name(format!("@{}", file_path.display()))
    .set_environment(env.clone())
    .exec();
  state.borrow_mut().roots.pop();
  result?;

  Ok(env)
}

/// Split `"pkg:module"`; no colon means the caller's own package.
fn parse_address(addr: &str) -> (&str, &str) {
  match addr.split_once(':') {
    Some((pkg, module)) => (pkg, module),
    None => ("", addr),
  }
}

/// Resolve `(pkg, module)` to the package root and the module file path.
fn resolve_module(
  current_root: &Path,
  packages: &HashMap<String, PathBuf>,
  pkg: &str,
  module: &str,
) -> LuaResult<(PathBuf, PathBuf)> {
  let root = if pkg.is_empty() {
    current_root.to_path_buf()
  } else {
    packages
      .get(pkg)
      .cloned()
      .ok_or_else(|| LuaError::external(format!("package not found: {pkg}")))?
  };

  // Keep modules from escaping their package root.
  if module.contains("..") {
    return Err(LuaError::external(format!(
      "module '{module}' not found in package '{pkg}'"
    )));
  }

  let mut path = root.join(module);
  if !module.ends_with(MODULE_SUFFIX) {
    path = path.join(DEFAULT_MODULE_FILE);
  }
  Ok((root, path))
}
