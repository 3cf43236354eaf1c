//! Function prototypes (spec §3 Prototype, §4.2 binary layout) — the
//! immutable compiled form shared by the binary chunk reader and the code
//! generator.
//!
//! Grounded on the teacher's `lua_value::Chunk` (the prototype type named
//! `Chunk` there) and on `original_source/src/luago/binary/binary_chunk.go`
//! for field order/naming.

use crate::opcode::Instruction;
use crate::value::value::LuaValue;
use std::rc::Rc;

/// An upvalue descriptor (spec §4.2 item 6): whether the child prototype's
/// i-th upvalue is captured from the enclosing function's registers
/// (`in_stack = true`) or inherited from the enclosing closure's own
/// upvalues (`in_stack = false`).
#[derive(Debug, Clone, Copy)]
pub struct UpvalDesc {
    pub in_stack: bool,
    pub index: u8,
}

/// Local-variable debug info (spec §4.2 item 9).
#[derive(Debug, Clone)]
pub struct LocalVarInfo {
    pub name: String,
    pub start_pc: u32,
    pub end_pc: u32,
}

/// A compiled function prototype, immutable after loading/compiling (spec
/// §3). Child prototypes are owned by their parent via `Rc` (closures
/// reference prototypes but never own them, per spec §9).
pub struct Prototype {
    pub source: String,
    pub line_defined: u32,
    pub last_line_defined: u32,
    pub num_params: u8,
    pub is_vararg: bool,
    pub max_stack_size: u8,

    pub code: Vec<Instruction>,
    pub constants: Vec<LuaValue>,
    pub upvalues: Vec<UpvalDesc>,
    pub protos: Vec<Rc<Prototype>>,

    pub line_info: Vec<u32>,
    pub local_vars: Vec<LocalVarInfo>,
    pub upvalue_names: Vec<String>,
}

impl Prototype {
    pub fn line_at(&self, pc: usize) -> u32 {
        self.line_info.get(pc).copied().unwrap_or(0)
    }
}
