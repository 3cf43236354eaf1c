//! The eight primitives themselves, each a plain [`NativeFn`] registered
//! into the globals table by [`super::install`].
//!
//! Argument/result plumbing follows spec §6's native-function contract: a
//! native only ever sees its own frame (args already copied in at
//! positions `1..=n`), and returns how many of the values now on top of
//! that frame are its results.

use crate::error::{ErrorKind, LuaError, LuaResult};
use crate::value::{raw_tostring, LuaValue};
use crate::vm::LuaState;

pub fn install(state: &mut LuaState) {
    state.register("print", lua_print);
    state.register("pairs", lua_pairs);
    state.register("ipairs", lua_ipairs);
    state.register("next", lua_next);
    state.register("getmetatable", lua_getmetatable);
    state.register("setmetatable", lua_setmetatable);
    state.register("error", lua_error);
    state.register("pcall", lua_pcall);
}

/// `print(...)`: tab-separated raw string conversion of every argument,
/// terminated with a newline.
fn lua_print(state: &mut LuaState) -> LuaResult<usize> {
    let top = state.get_top();
    let mut line = String::new();
    for i in 1..=top {
        if i > 1 {
            line.push('\t');
        }
        line.push_str(&raw_tostring(&state.get(i)));
    }
    println!("{line}");
    Ok(0)
}

fn bad_argument(n: i32, fname: &str, expected: &str) -> LuaError {
    LuaError::new(
        ErrorKind::IndexError,
        format!("bad argument #{n} to '{fname}' ({expected} expected)"),
    )
}

/// `pairs(t)`: returns `next, t, nil` so a generic `for` drives [`lua_next`]
/// over the whole table.
fn lua_pairs(state: &mut LuaState) -> LuaResult<usize> {
    if !state.is_table(1) {
        return Err(bad_argument(1, "pairs", "table"));
    }
    let t = state.get(1);
    state.push_native_function("next", lua_next);
    state.push(t);
    state.push_nil();
    Ok(3)
}

/// `next(t[, key])`: raw stateless iteration, per spec §6 built on the
/// table's own iteration order.
fn lua_next(state: &mut LuaState) -> LuaResult<usize> {
    if !state.is_table(1) {
        return Err(bad_argument(1, "next", "table"));
    }
    let key = if state.get_top() >= 2 { state.get(2) } else { LuaValue::Nil };
    state.set_top(1);
    state.push(key);
    if state.next(1)? {
        Ok(2)
    } else {
        state.push_nil();
        Ok(1)
    }
}

/// `ipairs(t)`: returns a stateless iterator over the 1.. integer keys,
/// stopping at the first nil — raw access, no `__index` (5.3 semantics).
fn lua_ipairs(state: &mut LuaState) -> LuaResult<usize> {
    if !state.is_table(1) {
        return Err(bad_argument(1, "ipairs", "table"));
    }
    let t = state.get(1);
    state.push_native_function("ipairs_iterator", ipairs_iterator);
    state.push(t);
    state.push_integer(0);
    Ok(3)
}

fn ipairs_iterator(state: &mut LuaState) -> LuaResult<usize> {
    let i = state.to_integer(2) + 1;
    state.push_integer(i);
    state.raw_get_i(1, i);
    if state.is_nil(-1) {
        state.pop(2);
        state.push_nil();
        Ok(1)
    } else {
        Ok(2)
    }
}

/// `getmetatable(t)`: `nil` for anything without one (no `__metatable`
/// field support — the spec doesn't ask for masking).
fn lua_getmetatable(state: &mut LuaState) -> LuaResult<usize> {
    match state.get_metatable(1) {
        Some(mt) => state.push(LuaValue::Table(mt)),
        None => state.push_nil(),
    }
    Ok(1)
}

/// `setmetatable(t, mt)`: `mt` must be a table or nil; returns `t`.
fn lua_setmetatable(state: &mut LuaState) -> LuaResult<usize> {
    if !state.is_table(1) {
        return Err(bad_argument(1, "setmetatable", "table"));
    }
    if !(state.is_nil(2) || state.is_table(2)) {
        return Err(bad_argument(2, "setmetatable", "nil or table"));
    }
    state.set_top(2);
    state.set_metatable(1);
    Ok(1)
}

/// `error(message[, level])`: raises `message` as-is. `level` is accepted
/// but ignored — natives don't have access to the caller's source
/// position to prefix onto a string message.
fn lua_error(state: &mut LuaState) -> LuaResult<usize> {
    Err(LuaError::raised(state.get(1)))
}

/// `pcall(f, ...)`: calls `f` with the remaining arguments in protected
/// mode, returning `true` plus `f`'s results, or `false` plus the error
/// object. Mirrors `luaB_pcall`'s own `true`-then-`insert` shape layered
/// over the host's lower-level [`LuaState::pcall`].
fn lua_pcall(state: &mut LuaState) -> LuaResult<usize> {
    let top = state.get_top();
    if top < 1 {
        return Err(bad_argument(1, "pcall", "value"));
    }
    let n_args = top - 1;
    if state.pcall(n_args, -1, 0) == 0 {
        let n_results = state.get_top();
        state.push_boolean(true);
        state.insert(1);
        Ok(n_results as usize + 1)
    } else {
        let err = state.get(1);
        state.set_top(0);
        state.push_boolean(false);
        state.push(err);
        Ok(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> LuaState {
        let mut state = LuaState::new();
        install(&mut state);
        state
    }

    #[test]
    fn pcall_reports_success_with_leading_true() {
        let mut state = fresh();
        state.load_source("return pcall(function(a, b) return a + b end, 1, 2)", "t").unwrap();
        state.call(0, -1).unwrap();
        assert_eq!(state.get_top(), 2);
        assert!(state.to_boolean(1));
        assert_eq!(state.to_integer(2), 3);
    }

    #[test]
    fn pcall_reports_failure_with_leading_false() {
        let mut state = fresh();
        state.load_source("return pcall(function() error('boom') end)", "t").unwrap();
        state.call(0, -1).unwrap();
        assert_eq!(state.get_top(), 2);
        assert!(!state.to_boolean(1));
        assert_eq!(raw_tostring(&state.get(2)), "boom");
    }

    #[test]
    fn ipairs_stops_at_first_hole() {
        let mut state = fresh();
        state
            .load_source("local t = {10, 20, 30} local n = 0 for i, v in ipairs(t) do n = n + v end return n", "t")
            .unwrap();
        state.call(0, 1).unwrap();
        assert_eq!(state.to_integer(-1), 60);
    }

    #[test]
    fn setmetatable_returns_the_table_and_index_chains_through() {
        let mut state = fresh();
        state
            .load_source(
                "local base = {greet = function() return 'hi' end} local t = setmetatable({}, {__index = base}) return t:greet()",
                "t",
            )
            .unwrap();
        state.call(0, 1).unwrap();
        assert_eq!(raw_tostring(&state.get(-1)), "hi");
    }
}
