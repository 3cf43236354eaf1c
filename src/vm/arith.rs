//! Arithmetic, comparison and length operators (spec §4.3, §4.6, §4.10):
//! numeric fast paths, numeric-string coercion, and metamethod fallback.
//!
//! Grounded on the teacher's `lua_vm/execute/arithmetic_instructions.rs` and
//! `comparison_ops.rs` for the int-fast-path/float-fallback shape, replacing
//! the teacher's separate `MmBin` follow-up opcode (a Lua 5.4/5.5 dispatch
//! optimization) with an inline metamethod fallback, since Lua 5.3's ADD/SUB
//! etc. trap to `luaT_trybinTM` directly.

use crate::error::{ErrorKind, LuaError, LuaResult};
use crate::number;
use crate::value::LuaValue;
use crate::vm::state::LuaState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Unm,
    BNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Lt,
    Le,
}

impl ArithOp {
    fn is_unary(self) -> bool {
        matches!(self, ArithOp::Unm | ArithOp::BNot)
    }

    fn is_bitwise(self) -> bool {
        matches!(
            self,
            ArithOp::BAnd | ArithOp::BOr | ArithOp::BXor | ArithOp::Shl | ArithOp::Shr | ArithOp::BNot
        )
    }

    fn metamethod_name(self) -> &'static str {
        match self {
            ArithOp::Add => "__add",
            ArithOp::Sub => "__sub",
            ArithOp::Mul => "__mul",
            ArithOp::Mod => "__mod",
            ArithOp::Pow => "__pow",
            ArithOp::Div => "__div",
            ArithOp::IDiv => "__idiv",
            ArithOp::BAnd => "__band",
            ArithOp::BOr => "__bor",
            ArithOp::BXor => "__bxor",
            ArithOp::Shl => "__shl",
            ArithOp::Shr => "__shr",
            ArithOp::Unm => "__unm",
            ArithOp::BNot => "__bnot",
        }
    }
}

/// Stack-API entry point (spec §6 `Arith`): pops 1 or 2 operands, pushes 1
/// result.
pub fn arith(state: &mut LuaState, op: ArithOp) -> LuaResult<()> {
    let result = if op.is_unary() {
        let a = state.get(-1);
        state.pop(1);
        arith_values(state, op, &a, &a)?
    } else {
        let b = state.get(-1);
        let a = state.get(-2);
        state.pop(2);
        arith_values(state, op, &a, &b)?
    };
    state.push(result);
    Ok(())
}

/// Looks up `name` on `v`'s metatable: a table's own, or — per spec.md's
/// "the registry holds default metatables for non-table, non-nil values
/// keyed by type" — the registry's shared per-type default for anything
/// else.
fn metamethod_of(state: &LuaState, v: &LuaValue, name: &str) -> Option<LuaValue> {
    let mt = state.metatable_of_value(v)?;
    let handler = mt.borrow().get(&LuaValue::from_string(name));
    if handler.is_nil() {
        None
    } else {
        Some(handler)
    }
}

/// The core binary/unary arithmetic evaluator shared by the VM dispatcher
/// (register operands) and the stack API (popped operands).
pub fn arith_values(state: &mut LuaState, op: ArithOp, a: &LuaValue, b: &LuaValue) -> LuaResult<LuaValue> {
    if op.is_bitwise() {
        return bitwise(state, op, a, b);
    }

    let an = coerce_number(a);
    let bn = coerce_number(b);
    if let (Some(an), Some(bn)) = (an, bn) {
        if matches!(op, ArithOp::IDiv | ArithOp::Mod) && matches!((an, bn), (Num::Int(_), Num::Int(_))) {
            if let (Num::Int(x), Num::Int(y)) = (an, bn) {
                if y == 0 {
                    return Err(LuaError::new(ErrorKind::ArithmeticError, "attempt to perform 'n//0'"));
                }
                let _ = x;
            }
        }
        return Ok(numeric(op, an, bn));
    }

    if let Some(handler) = metamethod_of(state, a, op.metamethod_name()).or_else(|| metamethod_of(state, b, op.metamethod_name())) {
        return call_metamethod(state, handler, a.clone(), b.clone());
    }

    let offender = if an.is_none() { a } else { b };
    Err(LuaError::new(
        ErrorKind::ArithmeticError,
        format!("attempt to perform arithmetic on a {} value", offender.type_name()),
    ))
}

#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

fn coerce_number(v: &LuaValue) -> Option<Num> {
    match v {
        LuaValue::Int(i) => Some(Num::Int(*i)),
        LuaValue::Float(f) => Some(Num::Float(*f)),
        LuaValue::Str(s) => {
            let text = std::str::from_utf8(s).ok()?;
            match number::str_to_number(text)? {
                number::LuaNumeral::Int(i) => Some(Num::Int(i)),
                number::LuaNumeral::Float(f) => Some(Num::Float(f)),
            }
        }
        _ => None,
    }
}

fn numeric(op: ArithOp, a: Num, b: Num) -> LuaValue {
    // Div and Pow always produce floats (spec §4.6); every other op stays
    // integer when both operands are integers.
    match (op, a, b) {
        (ArithOp::Div, _, _) => LuaValue::Float(as_f64(a) / as_f64(b)),
        (ArithOp::Pow, _, _) => LuaValue::Float(as_f64(a).powf(as_f64(b))),
        (ArithOp::Add, Num::Int(x), Num::Int(y)) => LuaValue::Int(x.wrapping_add(y)),
        (ArithOp::Sub, Num::Int(x), Num::Int(y)) => LuaValue::Int(x.wrapping_sub(y)),
        (ArithOp::Mul, Num::Int(x), Num::Int(y)) => LuaValue::Int(x.wrapping_mul(y)),
        (ArithOp::Unm, Num::Int(x), _) => LuaValue::Int(x.wrapping_neg()),
        (ArithOp::IDiv, Num::Int(x), Num::Int(y)) => match number::int_floor_div(x, y) {
            Some(q) => LuaValue::Int(q),
            None => LuaValue::Float(f64::NAN), // caller already excluded div-by-zero error path via float fallback below
        },
        (ArithOp::Mod, Num::Int(x), Num::Int(y)) => match number::int_mod(x, y) {
            Some(r) => LuaValue::Int(r),
            None => LuaValue::Float(f64::NAN),
        },
        (ArithOp::Add, _, _) => LuaValue::Float(as_f64(a) + as_f64(b)),
        (ArithOp::Sub, _, _) => LuaValue::Float(as_f64(a) - as_f64(b)),
        (ArithOp::Mul, _, _) => LuaValue::Float(as_f64(a) * as_f64(b)),
        (ArithOp::Unm, _, _) => LuaValue::Float(-as_f64(a)),
        (ArithOp::IDiv, _, _) => LuaValue::Float(number::float_floor_div(as_f64(a), as_f64(b))),
        (ArithOp::Mod, _, _) => LuaValue::Float(number::float_mod(as_f64(a), as_f64(b))),
        (ArithOp::BAnd | ArithOp::BOr | ArithOp::BXor | ArithOp::Shl | ArithOp::Shr | ArithOp::BNot, _, _) => {
            unreachable!("bitwise ops are routed through `bitwise`, not `numeric`")
        }
    }
}

fn as_f64(n: Num) -> f64 {
    match n {
        Num::Int(i) => i as f64,
        Num::Float(f) => f,
    }
}

/// Bitwise ops require both operands to convert to an exact integer (spec
/// §4.6): a float with a fractional part is a `number has no integer
/// representation` error, not a metamethod trigger by itself — but a
/// non-numeric operand still falls back to `__band`/etc.
fn bitwise(state: &mut LuaState, op: ArithOp, a: &LuaValue, b: &LuaValue) -> LuaResult<LuaValue> {
    let ai = to_bitwise_int(a);
    let bi = if op == ArithOp::BNot { ai } else { to_bitwise_int(b) };
    if let (Some(x), Some(y)) = (ai, bi) {
        let result = match op {
            ArithOp::BAnd => x & y,
            ArithOp::BOr => x | y,
            ArithOp::BXor => x ^ y,
            ArithOp::Shl => number::shift_left(x, y),
            ArithOp::Shr => number::shift_right(x, y),
            ArithOp::BNot => !x,
            _ => unreachable!(),
        };
        return Ok(LuaValue::Int(result));
    }

    if let Some(handler) = metamethod_of(state, a, op.metamethod_name()).or_else(|| metamethod_of(state, b, op.metamethod_name())) {
        return call_metamethod(state, handler, a.clone(), b.clone());
    }

    let offender = if ai.is_none() { a } else { b };
    if coerce_number(offender).is_some() {
        Err(LuaError::new(ErrorKind::ArithmeticError, "number has no integer representation"))
    } else {
        Err(LuaError::new(
            ErrorKind::ArithmeticError,
            format!("attempt to perform bitwise operation on a {} value", offender.type_name()),
        ))
    }
}

fn to_bitwise_int(v: &LuaValue) -> Option<i64> {
    match coerce_number(v)? {
        Num::Int(i) => Some(i),
        Num::Float(f) => number::float_to_exact_int(f),
    }
}

fn call_metamethod(state: &mut LuaState, handler: LuaValue, a: LuaValue, b: LuaValue) -> LuaResult<LuaValue> {
    state.push(handler);
    state.push(a);
    state.push(b);
    state.call(2, 1)?;
    let result = state.get(-1);
    state.pop(1);
    Ok(result)
}

/// §4.10 comparison, including `__eq`/`__lt`/`__le` fallback.
pub fn compare(state: &mut LuaState, a: &LuaValue, b: &LuaValue, op: CompareOp) -> LuaResult<bool> {
    match op {
        CompareOp::Eq => {
            if a.raw_equal(b) {
                return Ok(true);
            }
            if let (LuaValue::Table(_), LuaValue::Table(_)) = (a, b) {
                if let Some(handler) = metamethod_of(state, a, "__eq").or_else(|| metamethod_of(state, b, "__eq")) {
                    let result = call_metamethod(state, handler, a.clone(), b.clone())?;
                    return Ok(result.to_boolean());
                }
            }
            Ok(false)
        }
        CompareOp::Lt => order_compare(state, a, b, "__lt", |o| o == std::cmp::Ordering::Less),
        CompareOp::Le => order_compare(state, a, b, "__le", |o| o != std::cmp::Ordering::Greater),
    }
}

fn order_compare(
    state: &mut LuaState,
    a: &LuaValue,
    b: &LuaValue,
    mm_name: &str,
    accept: impl Fn(std::cmp::Ordering) -> bool,
) -> LuaResult<bool> {
    match (a, b) {
        (LuaValue::Int(x), LuaValue::Int(y)) => return Ok(accept(x.cmp(y))),
        (LuaValue::Str(x), LuaValue::Str(y)) => return Ok(accept(x.cmp(y))),
        _ => {
            if let (Some(x), Some(y)) = (numeric_f64(a), numeric_f64(b)) {
                if let Some(ord) = x.partial_cmp(&y) {
                    return Ok(accept(ord));
                }
                return Ok(false); // NaN: every ordered comparison is false
            }
        }
    }
    if let Some(handler) = metamethod_of(state, a, mm_name).or_else(|| metamethod_of(state, b, mm_name)) {
        let result = call_metamethod(state, handler, a.clone(), b.clone())?;
        return Ok(result.to_boolean());
    }
    Err(LuaError::new(
        ErrorKind::ComparisonError,
        format!("attempt to compare {} with {}", a.type_name(), b.type_name()),
    ))
}

fn numeric_f64(v: &LuaValue) -> Option<f64> {
    match v {
        LuaValue::Int(i) => Some(*i as f64),
        LuaValue::Float(f) => Some(*f),
        _ => None,
    }
}

/// §4.10 length: `#t` on a string is its byte length; on a table, `__len`
/// if present, else the array-part length.
pub fn lua_len(state: &mut LuaState, v: &LuaValue) -> LuaResult<LuaValue> {
    match v {
        LuaValue::Str(s) => Ok(LuaValue::Int(s.len() as i64)),
        LuaValue::Table(t) => {
            if let Some(handler) = t.borrow().metatable.as_ref().map(|mt| mt.borrow().get(&LuaValue::from_string("__len"))) {
                if !handler.is_nil() {
                    state.push(handler);
                    state.push(v.clone());
                    state.call(1, 1)?;
                    let result = state.get(-1);
                    state.pop(1);
                    return Ok(result);
                }
            }
            Ok(LuaValue::Int(t.borrow().len()))
        }
        _ => Err(LuaError::new(
            ErrorKind::ArithmeticError,
            format!("attempt to get length of a {} value", v.type_name()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> LuaState {
        LuaState::new()
    }

    #[test]
    fn integer_add_stays_integer() {
        let mut s = fresh();
        let r = arith_values(&mut s, ArithOp::Add, &LuaValue::Int(2), &LuaValue::Int(3)).unwrap();
        assert!(matches!(r, LuaValue::Int(5)));
    }

    #[test]
    fn division_always_floats() {
        let mut s = fresh();
        let r = arith_values(&mut s, ArithOp::Div, &LuaValue::Int(4), &LuaValue::Int(2)).unwrap();
        assert!(matches!(r, LuaValue::Float(f) if f == 2.0));
    }

    #[test]
    fn numeric_string_operand_coerces() {
        let mut s = fresh();
        let r = arith_values(&mut s, ArithOp::Add, &LuaValue::from_string("10"), &LuaValue::Int(5)).unwrap();
        assert!(matches!(r, LuaValue::Int(15)));
    }

    #[test]
    fn mismatched_types_error_without_metatable() {
        let mut s = fresh();
        let err = arith_values(&mut s, ArithOp::Add, &LuaValue::Nil, &LuaValue::Int(1)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ArithmeticError);
    }

    #[test]
    fn nan_is_never_less_than_or_equal_to_anything() {
        let mut s = fresh();
        assert!(!compare(&mut s, &LuaValue::Float(f64::NAN), &LuaValue::Float(1.0), CompareOp::Lt).unwrap());
        assert!(!compare(&mut s, &LuaValue::Float(f64::NAN), &LuaValue::Float(1.0), CompareOp::Le).unwrap());
    }

    #[test]
    fn registry_default_metatable_backs_arithmetic_on_non_table_values() {
        let mut s = fresh();
        s.push_boolean(true);
        s.new_table();
        s.push_native_function("__add", |state| {
            state.push_integer(99);
            Ok(1)
        });
        s.set_field(-1, "__add").unwrap();
        s.set_metatable(-1);

        let r = arith_values(&mut s, ArithOp::Add, &LuaValue::Bool(true), &LuaValue::Bool(false)).unwrap();
        assert!(matches!(r, LuaValue::Int(99)));
    }
}
