//! Userdata wrappers for constructed argument values.
//!
//! The constructors hand these to scripts; they flow back into `target{}`
//! (or into `sub` substitutions) where [`arg_from_lua`] converts them into
//! the closed [`Arg`] variant set. Plain Lua strings convert to [`Arg::Str`];
//! anything else is a type error.

use std::rc::Rc;

use mlua::prelude::*;

use crate::target::{Arg, Sub, Target};

#[derive(Clone)]
pub struct PathValue(pub String);

#[derive(Clone)]
pub struct GlobValue(pub Vec<String>);

#[derive(Clone)]
pub struct SubValue(pub Sub);

/// A constructed target. Shared by `Rc` so the same target can feed several
/// consumers without re-evaluation, and always truthy in Lua like any other
/// userdata.
#[derive(Clone)]
pub struct TargetValue(pub Rc<Target>);

impl LuaUserData for PathValue {
  fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
    methods.add_meta_method(LuaMetaMethod::ToString, |_, this, ()| Ok(this.0.clone()));
  }
}

impl LuaUserData for GlobValue {
  fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
    methods.add_meta_method(LuaMetaMethod::ToString, |_, this, ()| {
      Ok(Arg::Glob(this.0.clone()).to_string())
    });
  }
}

impl LuaUserData for SubValue {
  fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
    methods.add_meta_method(LuaMetaMethod::ToString, |_, this, ()| Ok(this.0.to_string()));
  }
}

impl LuaUserData for TargetValue {
  fn add_fields<F: LuaUserDataFields<Self>>(fields: &mut F) {
    fields.add_field_method_get("name", |_, this| Ok(this.0.name.clone()));
  }

  fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
    methods.add_meta_method(LuaMetaMethod::ToString, |_, this, ()| Ok(this.0.to_string()));
  }
}

/// Convert a script value into an [`Arg`].
pub fn arg_from_lua(value: &LuaValue) -> LuaResult<Arg> {
  match value {
    LuaValue::String(text) => Ok(Arg::Str(text.to_str()?.to_string())),
    LuaValue::UserData(userdata) => {
      if let Ok(path) = userdata.borrow::<PathValue>() {
        return Ok(Arg::Path(path.0.clone()));
      }
      if let Ok(glob) = userdata.borrow::<GlobValue>() {
        return Ok(Arg::Glob(glob.0.clone()));
      }
      if let Ok(sub) = userdata.borrow::<SubValue>() {
        return Ok(Arg::Sub(sub.0.clone()));
      }
      if let Ok(target) = userdata.borrow::<TargetValue>() {
        return Ok(Arg::Target(target.0.clone()));
      }
      Err(LuaError::external("cannot convert userdata into a target argument"))
    }
    other => Err(LuaError::external(format!(
      "cannot convert {} into a target argument",
      other.type_name()
    ))),
  }
}
