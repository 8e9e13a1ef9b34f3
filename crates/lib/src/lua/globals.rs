//! The script-visible constructor builtins.
//!
//! `target`, `sub`, `path`, and `glob` mirror the argument variants. They
//! validate eagerly -- scripts should fail at declaration time, not when the
//! freezer later trips over a malformed value.

use std::rc::Rc;

use mlua::prelude::*;

use crate::target::{Sub, Substitution, Target};

use super::value::{GlobValue, PathValue, SubValue, TargetValue, arg_from_lua};

/// Register the constructor builtins as globals.
pub fn register_builtins(lua: &Lua) -> LuaResult<()> {
  let globals = lua.globals();
  globals.set("target", lua.create_function(lua_target)?)?;
  globals.set("sub", lua.create_function(lua_sub)?)?;
  globals.set("path", lua.create_function(lua_path)?)?;
  globals.set("glob", lua.create_function(lua_glob)?)?;
  Ok(())
}

/// `target{ name = ..., builder = ..., args = {...}, env = {...} }`
fn lua_target(_lua: &Lua, spec: LuaTable) -> LuaResult<TargetValue> {
  let mut name = None;
  let mut builder = None;
  let mut args_table: Option<LuaTable> = None;
  let mut env_table: Option<LuaTable> = None;

  for pair in spec.pairs::<String, LuaValue>() {
    let (key, value) = pair.map_err(|_| LuaError::external("target(): field names must be strings"))?;
    match key.as_str() {
      "name" => name = Some(expect_string(value, "name")?),
      "builder" => builder = Some(expect_string(value, "builder")?),
      "args" => args_table = Some(expect_table(value, "args")?),
      "env" => env_table = Some(expect_table(value, "env")?),
      other => {
        return Err(LuaError::external(format!("target(): unexpected field '{other}'")));
      }
    }
  }

  let name = name.ok_or_else(|| LuaError::external("target(): missing required field 'name'"))?;
  let builder = builder.ok_or_else(|| LuaError::external("target(): missing required field 'builder'"))?;

  let mut args = Vec::new();
  if let Some(table) = args_table {
    for (index, value) in table.sequence_values::<LuaValue>().enumerate() {
      let value = value?;
      let arg = arg_from_lua(&value)
        .map_err(|err| LuaError::external(format!("target(): args[{}]: {err}", index + 1)))?;
      args.push(arg);
    }
  }

  let mut env = Vec::new();
  if let Some(table) = env_table {
    for (index, value) in table.sequence_values::<LuaValue>().enumerate() {
      match value? {
        LuaValue::String(entry) => env.push(entry.to_str()?.to_string()),
        other => {
          return Err(LuaError::external(format!(
            "target(): env[{}]: expected a string, got {}",
            index + 1,
            other.type_name()
          )));
        }
      }
    }
  }

  Ok(TargetValue(Rc::new(Target {
    name,
    builder,
    args,
    env,
  })))
}

/// `sub(format, { {key, value}, ... })`
fn lua_sub(_lua: &Lua, (format, subs): (String, Option<LuaTable>)) -> LuaResult<SubValue> {
  let mut substitutions = Vec::new();
  if let Some(table) = subs {
    for (index, entry) in table.sequence_values::<LuaValue>().enumerate() {
      let entry = match entry? {
        LuaValue::Table(pair) => pair,
        other => {
          return Err(LuaError::external(format!(
            "sub(): substitution {} must be a {{key, value}} pair, got {}",
            index + 1,
            other.type_name()
          )));
        }
      };
      let key: String = entry
        .get(1)
        .map_err(|_| LuaError::external(format!("sub(): substitution {} is missing its key", index + 1)))?;
      let value: LuaValue = entry.get(2)?;
      let value = arg_from_lua(&value)
        .map_err(|err| LuaError::external(format!("sub(): substitution '{key}': {err}")))?;
      substitutions.push(Substitution { key, value });
    }
  }

  Ok(SubValue(Sub { format, substitutions }))
}

/// `path(relpath)`
fn lua_path(_lua: &Lua, relpath: String) -> LuaResult<PathValue> {
  Ok(PathValue(relpath))
}

/// `glob(pattern, ...)`
fn lua_glob(_lua: &Lua, patterns: LuaMultiValue) -> LuaResult<GlobValue> {
  if patterns.is_empty() {
    return Err(LuaError::external("glob(): expected at least one pattern"));
  }

  let mut globs = Vec::with_capacity(patterns.len());
  for (index, value) in patterns.into_iter().enumerate() {
    match value {
      LuaValue::String(pattern) => globs.push(pattern.to_str()?.to_string()),
      other => {
        return Err(LuaError::external(format!(
          "glob(): argument {} must be a string, got {}",
          index + 1,
          other.type_name()
        )));
      }
    }
  }
  Ok(GlobValue(globs))
}

fn expect_string(value: LuaValue, field: &str) -> LuaResult<String> {
  match value {
    LuaValue::String(text) => Ok(text.to_str()?.to_string()),
    other => Err(LuaError::external(format!(
      "target(): field '{field}': expected a string, got {}",
      other.type_name()
    ))),
  }
}

fn expect_table(value: LuaValue, field: &str) -> LuaResult<LuaTable> {
  match value {
    LuaValue::Table(table) => Ok(table),
    other => Err(LuaError::external(format!(
      "target(): field '{field}': expected a list, got {}",
      other.type_name()
    ))),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  use crate::target::Arg;

  fn test_lua() -> Lua {
    let lua = Lua::new();
    register_builtins(&lua).unwrap();
    lua
  }

  fn eval_target(lua: &Lua, code: &str) -> Target {
    let value: LuaValue = lua.load(code).eval().unwrap();
    match value {
      LuaValue::UserData(userdata) => (*userdata.borrow::<TargetValue>().unwrap().0).clone(),
      other => panic!("expected a target userdata, got {}", other.type_name()),
    }
  }

  #[test]
  fn target_constructor_builds_the_full_shape() {
    let lua = test_lua();
    let target = eval_target(
      &lua,
      r#"
        return target {
          name = "hello",
          builder = "/bin/bash",
          args = { "-c", "echo hi > $out" },
          env = { "LANG=C" },
        }
      "#,
    );

    assert_eq!(target.name, "hello");
    assert_eq!(target.builder, "/bin/bash");
    assert_eq!(target.args.len(), 2);
    assert!(matches!(&target.args[0], Arg::Str(flag) if flag == "-c"));
    assert_eq!(target.env, vec!["LANG=C"]);
  }

  #[test]
  fn args_and_env_default_to_empty() {
    let lua = test_lua();
    let target = eval_target(&lua, r#"return target { name = "t", builder = "b" }"#);
    assert!(target.args.is_empty());
    assert!(target.env.is_empty());
  }

  #[test]
  fn target_rejects_unknown_fields() {
    let lua = test_lua();
    let err = lua
      .load(r#"return target { name = "t", builder = "b", outputs = {} }"#)
      .eval::<LuaValue>()
      .unwrap_err();
    assert!(err.to_string().contains("outputs"), "unexpected error: {err}");
  }

  #[test]
  fn target_requires_name_and_builder() {
    let lua = test_lua();
    let err = lua
      .load(r#"return target { builder = "b" }"#)
      .eval::<LuaValue>()
      .unwrap_err();
    assert!(err.to_string().contains("name"), "unexpected error: {err}");
  }

  #[test]
  fn constructed_values_round_trip_through_args() {
    let lua = test_lua();
    let target = eval_target(
      &lua,
      r#"
        return target {
          name = "t",
          builder = "b",
          args = {
            path("src/config.yml"),
            glob("src/**/*.c", "include/*.h"),
            sub("flag ${Value}", { { "Value", "yes" } }),
          },
        }
      "#,
    );

    assert!(matches!(&target.args[0], Arg::Path(p) if p == "src/config.yml"));
    assert!(matches!(&target.args[1], Arg::Glob(globs) if globs.len() == 2));
    match &target.args[2] {
      Arg::Sub(sub) => {
        assert_eq!(sub.format, "flag ${Value}");
        assert_eq!(sub.substitutions.len(), 1);
        assert_eq!(sub.substitutions[0].key, "Value");
      }
      other => panic!("expected a sub argument, got {other:?}"),
    }
  }

  #[test]
  fn nested_targets_become_target_args() {
    let lua = test_lua();
    let target = eval_target(
      &lua,
      r#"
        local dep = target { name = "dep", builder = "b" }
        return target { name = "top", builder = "b", args = { dep } }
      "#,
    );

    match &target.args[0] {
      Arg::Target(dep) => assert_eq!(dep.name, "dep"),
      other => panic!("expected a target argument, got {other:?}"),
    }
  }

  #[test]
  fn targets_are_truthy() {
    let lua = test_lua();
    let truthy: bool = lua
      .load(r#"local t = target { name = "t", builder = "b" }; return (t and true) or false"#)
      .eval()
      .unwrap();
    assert!(truthy);
  }

  #[test]
  fn sub_substitutions_preserve_order() {
    let lua = test_lua();
    let target = eval_target(
      &lua,
      r#"
        return target {
          name = "t",
          builder = "b",
          args = { sub("${A}${B}", { { "A", "1" }, { "B", "2" } }) },
        }
      "#,
    );

    match &target.args[0] {
      Arg::Sub(sub) => {
        let keys: Vec<_> = sub.substitutions.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["A", "B"]);
      }
      other => panic!("expected a sub argument, got {other:?}"),
    }
  }

  #[test]
  fn non_arg_values_are_rejected() {
    let lua = test_lua();
    let err = lua
      .load(r#"return target { name = "t", builder = "b", args = { 42 } }"#)
      .eval::<LuaValue>()
      .unwrap_err();
    assert!(err.to_string().contains("number"), "unexpected error: {err}");
  }

  #[test]
  fn glob_requires_string_patterns() {
    let lua = test_lua();
    let err = lua.load(r#"return glob()"#).eval::<LuaValue>().unwrap_err();
    assert!(err.to_string().contains("at least one"), "unexpected error: {err}");

    let err = lua.load(r#"return glob(1)"#).eval::<LuaValue>().unwrap_err();
    assert!(err.to_string().contains("must be a string"), "unexpected error: {err}");
  }
}
