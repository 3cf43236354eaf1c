//! `LuaValue`: the tagged union at the heart of the data model (spec §3,
//! §4.3). Grounded on the teacher's `lua_value/lua_value.rs` type-tag table,
//! re-expressed as a plain Rust enum instead of a packed 16-byte union —
//! the packed-union trick exists in the teacher to minimize per-slot size
//! under a GC arena; without an arena the ergonomic enum is the right
//! choice (spec §9 design notes: "avoid a single dynamic Any: every
//! conversion is explicit").

use crate::number::{self, LuaNumeral};
use crate::value::{new_lua_string, Closure, LuaString, LuaTable};
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Clone)]
pub enum LuaValue {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(LuaString),
    Table(Rc<RefCell<LuaTable>>),
    Function(Rc<Closure>),
}

/// The seven observable type tags plus NONE (spec §4.3). THREAD and
/// USERDATA are declared for `type()`/`TypeName` completeness but nothing
/// constructs them (spec §1 Non-goals: no coroutines/userdata).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    None,
    Nil,
    Boolean,
    Number,
    String,
    Table,
    Function,
    Thread,
    Userdata,
}

impl TypeTag {
    pub fn name(self) -> &'static str {
        match self {
            TypeTag::None => "no value",
            TypeTag::Nil => "nil",
            TypeTag::Boolean => "boolean",
            TypeTag::Number => "number",
            TypeTag::String => "string",
            TypeTag::Table => "table",
            TypeTag::Function => "function",
            TypeTag::Thread => "thread",
            TypeTag::Userdata => "userdata",
        }
    }
}

impl LuaValue {
    pub fn from_string(s: impl Into<Vec<u8>>) -> LuaValue {
        LuaValue::Str(new_lua_string(s))
    }

    pub fn from_bytes(bytes: LuaString) -> LuaValue {
        LuaValue::Str(bytes)
    }

    pub fn new_table(t: LuaTable) -> LuaValue {
        LuaValue::Table(Rc::new(RefCell::new(t)))
    }

    pub fn tag(&self) -> TypeTag {
        match self {
            LuaValue::Nil => TypeTag::Nil,
            LuaValue::Bool(_) => TypeTag::Boolean,
            LuaValue::Int(_) | LuaValue::Float(_) => TypeTag::Number,
            LuaValue::Str(_) => TypeTag::String,
            LuaValue::Table(_) => TypeTag::Table,
            LuaValue::Function(_) => TypeTag::Function,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.tag().name()
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, LuaValue::Nil)
    }

    pub fn is_number(&self) -> bool {
        matches!(self, LuaValue::Int(_) | LuaValue::Float(_))
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, LuaValue::Int(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self, LuaValue::Str(_))
    }

    pub fn is_table(&self) -> bool {
        matches!(self, LuaValue::Table(_))
    }

    pub fn is_function(&self) -> bool {
        matches!(self, LuaValue::Function(_))
    }

    pub fn as_table(&self) -> Option<&Rc<RefCell<LuaTable>>> {
        match self {
            LuaValue::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Rc<Closure>> {
        match self {
            LuaValue::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_str_bytes(&self) -> Option<&[u8]> {
        match self {
            LuaValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// §4.3 To-boolean: nil and false are false, everything else is true.
    pub fn to_boolean(&self) -> bool {
        !matches!(self, LuaValue::Nil | LuaValue::Bool(false))
    }

    /// §4.3 To-integer.
    pub fn to_integer(&self) -> Option<i64> {
        match self {
            LuaValue::Int(i) => Some(*i),
            LuaValue::Float(f) => number::float_to_exact_int(*f),
            LuaValue::Str(s) => {
                let text = std::str::from_utf8(s).ok()?;
                match number::str_to_number(text)? {
                    LuaNumeral::Int(i) => Some(i),
                    LuaNumeral::Float(f) => number::float_to_exact_int(f),
                }
            }
            _ => None,
        }
    }

    /// §4.3 To-float.
    pub fn to_float(&self) -> Option<f64> {
        match self {
            LuaValue::Float(f) => Some(*f),
            LuaValue::Int(i) => Some(*i as f64),
            LuaValue::Str(s) => {
                let text = std::str::from_utf8(s).ok()?;
                match number::str_to_number(text)? {
                    LuaNumeral::Int(i) => Some(i as f64),
                    LuaNumeral::Float(f) => Some(f),
                }
            }
            _ => None,
        }
    }

    /// Non-raw to-string coercion (§4.3): numbers format canonically,
    /// strings pass through. Does not coerce tables/functions.
    pub fn to_lua_string(&self) -> Option<LuaString> {
        match self {
            LuaValue::Str(s) => Some(s.clone()),
            LuaValue::Int(_) | LuaValue::Float(_) => Some(new_lua_string(raw_tostring(self))),
            _ => None,
        }
    }

    /// Canonicalizes a table key: a float exactly equal to an integer
    /// becomes that integer (spec §3 Table invariants).
    pub fn canonical_key(&self) -> LuaValue {
        if let LuaValue::Float(f) = self {
            if let Some(i) = number::float_to_exact_int(*f) {
                return LuaValue::Int(i);
            }
        }
        self.clone()
    }

    pub fn is_valid_key(&self) -> bool {
        match self {
            LuaValue::Nil => false,
            LuaValue::Float(f) => !f.is_nan(),
            _ => true,
        }
    }

    /// Raw equality: no metamethods (used by table lookups and `rawequal`).
    pub fn raw_equal(&self, other: &LuaValue) -> bool {
        match (self, other) {
            (LuaValue::Nil, LuaValue::Nil) => true,
            (LuaValue::Bool(a), LuaValue::Bool(b)) => a == b,
            (LuaValue::Int(a), LuaValue::Int(b)) => a == b,
            (LuaValue::Float(a), LuaValue::Float(b)) => a == b,
            (LuaValue::Int(a), LuaValue::Float(b)) | (LuaValue::Float(b), LuaValue::Int(a)) => {
                (*a as f64) == *b
            }
            (LuaValue::Str(a), LuaValue::Str(b)) => a == b,
            (LuaValue::Table(a), LuaValue::Table(b)) => Rc::ptr_eq(a, b),
            (LuaValue::Function(a), LuaValue::Function(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Canonical numeral-to-string formatting used by §4.3 To-string and by
/// `tostring`/`print`/`..` operand coercion. `%d` for integers,
/// shortest-round-trip for floats, matching the teacher's use of
/// `itoa`/float formatting in its upvalue/string-coercion handlers.
pub fn raw_tostring(v: &LuaValue) -> String {
    match v {
        LuaValue::Nil => "nil".to_string(),
        LuaValue::Bool(true) => "true".to_string(),
        LuaValue::Bool(false) => "false".to_string(),
        LuaValue::Int(i) => {
            let mut buf = itoa::Buffer::new();
            buf.format(*i).to_string()
        }
        LuaValue::Float(f) => format_lua_float(*f),
        LuaValue::Str(s) => String::from_utf8_lossy(s).into_owned(),
        LuaValue::Table(t) => format!("table: {:p}", Rc::as_ptr(t)),
        LuaValue::Function(f) => format!("function: {:p}", Rc::as_ptr(f)),
    }
}

fn format_lua_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }
    if f == f.trunc() && f.abs() < 1e15 {
        // Lua prints integral floats with a trailing ".0".
        return format!("{f:.1}");
    }
    let mut buf = ryu::Buffer::new();
    buf.format(f).to_string()
}

impl std::fmt::Debug for LuaValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", raw_tostring(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_boolean_only_false_for_nil_and_false() {
        assert!(!LuaValue::Nil.to_boolean());
        assert!(!LuaValue::Bool(false).to_boolean());
        assert!(LuaValue::Bool(true).to_boolean());
        assert!(LuaValue::Int(0).to_boolean());
        assert!(LuaValue::from_string("").to_boolean());
    }

    #[test]
    fn canonical_key_folds_integral_floats() {
        let k = LuaValue::Float(3.0).canonical_key();
        assert!(matches!(k, LuaValue::Int(3)));
        let k2 = LuaValue::Float(3.5).canonical_key();
        assert!(matches!(k2, LuaValue::Float(f) if f == 3.5));
    }

    #[test]
    fn nan_is_not_a_valid_key() {
        assert!(!LuaValue::Float(f64::NAN).is_valid_key());
        assert!(!LuaValue::Nil.is_valid_key());
        assert!(LuaValue::Int(0).is_valid_key());
    }

    #[test]
    fn string_to_integer_coercion_parses_decimal_and_hex() {
        assert_eq!(LuaValue::from_string("10").to_integer(), Some(10));
        assert_eq!(LuaValue::from_string("0x10").to_integer(), Some(16));
        assert_eq!(LuaValue::from_string("not a number").to_integer(), None);
    }

    #[test]
    fn float_formatting_keeps_trailing_point_zero() {
        assert_eq!(raw_tostring(&LuaValue::Float(3.0)), "3.0");
    }
}
