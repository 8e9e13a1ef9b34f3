//! The adapter's entry point: evaluate a module, fetch a target.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use mlua::prelude::*;
use thiserror::Error;

use crate::target::Target;

use super::loader::{self, LoaderState};
use super::value::TargetValue;
use super::globals;

#[derive(Debug, Error)]
pub enum EvalError {
  #[error("initializing Lua runtime: {0}")]
  Init(#[source] LuaError),

  #[error("evaluating module '{module}': {source}")]
  Module { module: String, source: LuaError },

  #[error("missing target '{symbol}' in module '{module}'")]
  MissingTarget { module: String, symbol: String },

  #[error("'{symbol}' must be a target; found {type_name}")]
  NotATarget { symbol: String, type_name: String },
}

/// A Lua runtime wired up with the constructor builtins and the module
/// loader. One evaluator serves one invocation: its module memoisation table
/// lives as long as the evaluator does.
pub struct Evaluator {
  lua: Lua,
  state: Rc<RefCell<LoaderState>>,
}

impl Evaluator {
  pub fn new(workspace_root: PathBuf, packages: HashMap<String, PathBuf>) -> Result<Self, EvalError> {
    let lua = Lua::new();
    globals::register_builtins(&lua).map_err(EvalError::Init)?;

    let state = Rc::new(RefCell::new(LoaderState::new(workspace_root, packages)));
    loader::register_load(&lua, state.clone()).map_err(EvalError::Init)?;

    Ok(Self { lua, state })
  }

  /// Evaluate `module` (memoised) and return its binding `symbol` as a
  /// [`Target`].
  pub fn target(&self, module: &str, symbol: &str) -> Result<Target, EvalError> {
    let with_module_context = |source: LuaError| EvalError::Module {
      module: module.to_string(),
      source,
    };

    let bindings = loader::load_module(&self.lua, &self.state, module).map_err(with_module_context)?;
    let value: LuaValue = bindings.raw_get(symbol).map_err(with_module_context)?;

    match value {
      LuaValue::Nil => Err(EvalError::MissingTarget {
        module: module.to_string(),
        symbol: symbol.to_string(),
      }),
      LuaValue::UserData(userdata) => match userdata.borrow::<TargetValue>() {
        Ok(target) => Ok((*target.0).clone()),
        Err(_) => Err(EvalError::NotATarget {
          symbol: symbol.to_string(),
          type_name: "userdata".to_string(),
        }),
      },
      other => Err(EvalError::NotATarget {
        symbol: symbol.to_string(),
        type_name: other.type_name().to_string(),
      }),
    }
  }
}
