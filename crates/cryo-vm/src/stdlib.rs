//! Baseline global bindings.
//!
//! The engine itself needs nothing from here; these are the handful of
//! primitives the driver installs so ordinary scripts have `print` and
//! friends. Hosts extend the same globals table with their own callables.

use cryo_core::{LuaError, LuaValue, NativeFn};

/// A fresh globals table with the baseline functions bound.
pub fn default_globals() -> LuaValue {
    let globals = LuaValue::new_table();
    register(&globals);
    globals
}

/// Bind the baseline functions into an existing globals table.
pub fn register(globals: &LuaValue) {
    for (name, f) in natives() {
        bind(globals, name, f);
    }
}

/// Name/function pairs for the baseline bindings. Snapshot registries use
/// this to round-trip the default globals.
pub fn natives() -> [(&'static str, NativeFn); 6] {
    [
        ("print", lua_print),
        ("type", lua_type),
        ("tostring", lua_tostring),
        ("tonumber", lua_tonumber),
        ("assert", lua_assert),
        ("error", lua_error),
    ]
}

/// Insert one native function under `name`.
pub fn bind(globals: &LuaValue, name: &str, f: NativeFn) {
    if let LuaValue::Table(t) = globals {
        t.write().unwrap().set(
            LuaValue::LuaString(name.into()),
            LuaValue::NativeFunction(f),
        );
    }
}

// ── Basic functions ───────────────────────────────────────────────────────────

fn lua_print(args: Vec<LuaValue>) -> Result<Vec<LuaValue>, LuaError> {
    let parts: Vec<String> = args.iter().map(|v| v.to_string()).collect();
    println!("{}", parts.join("\t"));
    Ok(vec![])
}

fn lua_type(args: Vec<LuaValue>) -> Result<Vec<LuaValue>, LuaError> {
    let v = args.into_iter().next().unwrap_or(LuaValue::Nil);
    Ok(vec![LuaValue::LuaString(v.type_name().into())])
}

fn lua_tostring(args: Vec<LuaValue>) -> Result<Vec<LuaValue>, LuaError> {
    let v = args.into_iter().next().unwrap_or(LuaValue::Nil);
    Ok(vec![LuaValue::LuaString(v.to_string())])
}

fn lua_tonumber(args: Vec<LuaValue>) -> Result<Vec<LuaValue>, LuaError> {
    let v = args.into_iter().next().unwrap_or(LuaValue::Nil);
    Ok(vec![v.coerce_number().unwrap_or(LuaValue::Nil)])
}

fn lua_assert(args: Vec<LuaValue>) -> Result<Vec<LuaValue>, LuaError> {
    let mut it = args.into_iter();
    let v = it.next().unwrap_or(LuaValue::Nil);
    if v.is_truthy() {
        Ok(std::iter::once(v).chain(it).collect())
    } else {
        let msg = it
            .next()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "assertion failed!".into());
        Err(LuaError::runtime(msg))
    }
}

fn lua_error(args: Vec<LuaValue>) -> Result<Vec<LuaValue>, LuaError> {
    let msg = args.into_iter().next().unwrap_or(LuaValue::Nil).to_string();
    Err(LuaError::runtime(msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_names_are_bound() {
        let g = default_globals();
        let LuaValue::Table(t) = &g else { panic!() };
        for name in ["print", "type", "tostring", "tonumber", "assert", "error"] {
            let v = t.read().unwrap().get(&LuaValue::LuaString(name.into()));
            assert!(matches!(v, LuaValue::NativeFunction(_)), "{name} missing");
        }
    }

    #[test]
    fn tonumber_parses_strings() {
        let out = lua_tonumber(vec![LuaValue::LuaString(" 42 ".into())]).unwrap();
        assert_eq!(out[0], LuaValue::Integer(42));
        let out = lua_tonumber(vec![LuaValue::Boolean(true)]).unwrap();
        assert_eq!(out[0], LuaValue::Nil);
    }

    #[test]
    fn assert_passes_its_arguments_through() {
        let out = lua_assert(vec![LuaValue::Integer(1), LuaValue::Integer(2)]).unwrap();
        assert_eq!(out.len(), 2);
        assert!(lua_assert(vec![LuaValue::Boolean(false)]).is_err());
    }
}
