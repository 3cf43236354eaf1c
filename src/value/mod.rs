//! The value model (spec §3, §4.3): tagged `LuaValue`, tables, closures and
//! upvalues, and function prototypes.
//!
//! Grounded on the teacher's `lua_value/` split (`lua_value.rs`,
//! `lua_table.rs`, `chunk_serializer.rs`), with the GC-arena identity model
//! (`gc::{TableId, FunctionId, ...}`) replaced by `Rc`/`RefCell` reference
//! counting per spec §9's design note — this crate has no tracing garbage
//! collector, matching spec §1's Non-goals.

mod closure;
mod proto;
mod table;
mod value;

pub use closure::{Closure, LuaClosure, NativeFn, RegisterWindow, Upvalue, UpvalueState};
pub use proto::{LocalVarInfo, Prototype, UpvalDesc};
pub use table::{InvalidKey, LuaTable};
pub use value::{raw_tostring, LuaValue, TypeTag};

use std::rc::Rc;

/// An immutable, reference-counted byte string. Lua strings are byte
/// sequences, not necessarily valid UTF-8 (spec §3) — escapes like `\xFF`
/// must round-trip, so this is not `Rc<str>`.
pub type LuaString = Rc<[u8]>;

pub fn new_lua_string(bytes: impl Into<Vec<u8>>) -> LuaString {
    Rc::from(bytes.into().into_boxed_slice())
}
