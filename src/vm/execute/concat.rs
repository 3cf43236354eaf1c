//! String concatenation (spec §4.6 `..`, §4.10 `__concat`).
//!
//! Grounded on the teacher's `lua_vm/execute/concat.rs` value-to-string
//! fast path, narrowed to Lua's actual coercion rule: only strings and
//! numbers concatenate directly, not booleans/nil (those fall to
//! `__concat` or error, per spec §4.6).

use crate::error::{ErrorKind, LuaError, LuaResult};
use crate::value::{raw_tostring, LuaValue};
use crate::vm::state::LuaState;

fn concatenable(v: &LuaValue) -> bool {
    matches!(v, LuaValue::Str(_) | LuaValue::Int(_) | LuaValue::Float(_))
}

/// Concatenates `values` right-to-left the way `luaV_concat` folds a
/// CONCAT run (spec §4.8 CONCAT: `R[A] := R[B] .. ... .. R[C]`), so that a
/// single non-concatenable operand anywhere in the run still reports the
/// correct adjacent pair to `__concat`.
pub fn concat_values(state: &mut LuaState, values: &mut [LuaValue]) -> LuaResult<LuaValue> {
    if values.is_empty() {
        return Ok(LuaValue::from_string(""));
    }
    let mut acc = values[values.len() - 1].clone();
    for v in values[..values.len() - 1].iter().rev() {
        acc = concat_pair(state, v, &acc)?;
    }
    Ok(acc)
}

fn concat_pair(state: &mut LuaState, a: &LuaValue, b: &LuaValue) -> LuaResult<LuaValue> {
    if concatenable(a) && concatenable(b) {
        let mut s = raw_tostring(a).into_bytes();
        s.extend_from_slice(raw_tostring(b).as_bytes());
        return Ok(LuaValue::from_string(s));
    }

    let handler = metamethod(state, a, "__concat").or_else(|| metamethod(state, b, "__concat"));
    if let Some(handler) = handler {
        state.push(handler);
        state.push(a.clone());
        state.push(b.clone());
        state.call(2, 1)?;
        let result = state.get(-1);
        state.pop(1);
        return Ok(result);
    }

    let offender = if concatenable(a) { b } else { a };
    Err(LuaError::new(
        ErrorKind::ConcatenationError,
        format!("attempt to concatenate a {} value", offender.type_name()),
    ))
}

fn metamethod(state: &LuaState, v: &LuaValue, name: &str) -> Option<LuaValue> {
    let mt = state.metatable_of_value(v)?;
    let handler = mt.borrow().get(&LuaValue::from_string(name));
    if handler.is_nil() {
        None
    } else {
        Some(handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_and_strings_concatenate_directly() {
        let mut s = LuaState::new();
        let mut vals = vec![LuaValue::from_string("x="), LuaValue::Int(5)];
        let result = concat_values(&mut s, &mut vals).unwrap();
        assert_eq!(result.as_str_bytes(), Some(&b"x=5"[..]));
    }

    #[test]
    fn boolean_operand_errors_without_metatable() {
        let mut s = LuaState::new();
        let mut vals = vec![LuaValue::Bool(true), LuaValue::from_string("x")];
        let err = concat_values(&mut s, &mut vals).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConcatenationError);
    }
}
