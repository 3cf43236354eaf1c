//! Per-function compiler state: register allocator, scope/local tracking,
//! constant pool and upvalue resolution (spec §4.7 Code generator).
//!
//! Grounded on `original_source`'s `compiler/codegen.go` `funcInfo` /
//! `locVarInfo` / `upvalInfo`, restructured from Go's parent-pointer tree
//! into an explicit enclosing-function stack (`Vec<FuncState>`) so Rust's
//! borrow checker can see the (non-overlapping, one-index-at-a-time)
//! mutation pattern `indexOfUpvalue` needs when it walks outward to an
//! ancestor scope.

use crate::error::{ErrorKind, LuaError, LuaResult};
use crate::opcode::{Instruction, OpCode};
use crate::value::{LocalVarInfo, LuaValue, Prototype, UpvalDesc};
use std::collections::HashMap;
use std::rc::Rc;

/// Distinguishes `0` from `0.0` in the constant pool — `LuaValue`'s own
/// `Eq`/`Hash` treat those as the same *Lua* value (spec §3 raw equality),
/// which is correct for tables but wrong for constant-pool deduplication.
#[derive(PartialEq, Eq, Hash, Clone)]
enum ConstKey {
    Nil,
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(Vec<u8>),
}

fn const_key(v: &LuaValue) -> Option<ConstKey> {
    Some(match v {
        LuaValue::Nil => ConstKey::Nil,
        LuaValue::Bool(b) => ConstKey::Bool(*b),
        LuaValue::Int(i) => ConstKey::Int(*i),
        LuaValue::Float(f) => ConstKey::Float(f.to_bits()),
        LuaValue::Str(s) => ConstKey::Str(s.to_vec()),
        LuaValue::Table(_) | LuaValue::Function(_) => return None,
    })
}

struct ActiveLocal {
    name: String,
    scope_lv: i32,
    slot: usize,
    captured: bool,
    debug_idx: usize,
}

pub const LFIELDS_PER_FLUSH: usize = 50;

pub struct FuncState {
    pub num_params: u8,
    pub is_vararg: bool,
    pub line_defined: u32,
    pub last_line_defined: u32,

    used_regs: usize,
    max_regs: usize,
    scope_lv: i32,
    current_line: u32,

    code: Vec<Instruction>,
    line_info: Vec<u32>,

    const_values: Vec<LuaValue>,
    const_index: HashMap<ConstKey, usize>,

    loc_vars: Vec<LocalVarInfo>,
    active: Vec<ActiveLocal>,
    by_name: HashMap<String, Vec<usize>>,

    /// One entry per nested breakable scope; `Some` scopes collect pending
    /// JMP pcs to patch to the loop's exit point.
    breaks: Vec<Option<Vec<usize>>>,

    /// `goto`/`::label::` resolution (spec §4.7): a single flat,
    /// function-wide namespace rather than per-scope visibility — close
    /// enough for the common `goto continue`/error-unwind idioms without
    /// tracking Lua's full nested-scope label shadowing rules.
    labels: HashMap<String, usize>,
    pending_gotos: Vec<(String, usize, u32)>,

    pub upvalues: Vec<UpvalDesc>,
    pub upvalue_names: Vec<String>,
    upvalue_index: HashMap<String, usize>,

    pub children: Vec<Rc<Prototype>>,
}

impl FuncState {
    pub fn new(num_params: u8, is_vararg: bool, line_defined: u32) -> Self {
        FuncState {
            num_params,
            is_vararg,
            line_defined,
            last_line_defined: line_defined,
            used_regs: 0,
            max_regs: 0,
            scope_lv: 0,
            current_line: line_defined,
            code: Vec::new(),
            line_info: Vec::new(),
            const_values: Vec::new(),
            const_index: HashMap::new(),
            loc_vars: Vec::new(),
            active: Vec::new(),
            by_name: HashMap::new(),
            breaks: Vec::new(),
            labels: HashMap::new(),
            pending_gotos: Vec::new(),
            upvalues: Vec::new(),
            upvalue_names: Vec::new(),
            upvalue_index: HashMap::new(),
            children: Vec::new(),
        }
    }

    pub fn set_line(&mut self, line: u32) {
        self.current_line = line;
    }

    pub fn pc(&self) -> usize {
        self.code.len()
    }

    pub fn emit(&mut self, instr: Instruction) -> usize {
        self.code.push(instr);
        self.line_info.push(self.current_line);
        self.code.len() - 1
    }

    pub fn patch_sbx(&mut self, pc: usize, sbx: i32) {
        let old = self.code[pc];
        let op = old.opcode().expect("patched instruction keeps its opcode");
        self.code[pc] = Instruction::encode_asbx(op, old.get_a(), sbx);
    }

    pub fn patch_to_here(&mut self, pc: usize) {
        let sbx = (self.pc() as i32) - (pc as i32) - 1;
        self.patch_sbx(pc, sbx);
    }

    // -- Registers ----------------------------------------------------

    pub fn alloc_reg(&mut self) -> LuaResult<usize> {
        let r = self.used_regs;
        self.used_regs += 1;
        if self.used_regs > 250 {
            return Err(LuaError::new(
                ErrorKind::TooManyRegisters,
                "function or expression needs too many registers",
            ));
        }
        if self.used_regs > self.max_regs {
            self.max_regs = self.used_regs;
        }
        Ok(r)
    }

    pub fn alloc_regs(&mut self, n: usize) -> LuaResult<usize> {
        let base = self.used_regs;
        for _ in 0..n {
            self.alloc_reg()?;
        }
        Ok(base)
    }

    pub fn free_reg(&mut self) {
        if self.used_regs > 0 {
            self.used_regs -= 1;
        }
    }

    pub fn free_regs(&mut self, n: usize) {
        for _ in 0..n {
            self.free_reg();
        }
    }

    /// Resets the register counter back to a previously observed mark.
    /// Used to release temporaries (RK materializations, call args) without
    /// walking them off one at a time.
    pub fn free_to(&mut self, mark: usize) {
        if mark < self.used_regs {
            self.used_regs = mark;
        }
    }

    pub fn used_regs(&self) -> usize {
        self.used_regs
    }

    // -- Scopes and locals ---------------------------------------------

    pub fn enter_scope(&mut self, breakable: bool) {
        self.scope_lv += 1;
        self.breaks.push(if breakable { Some(Vec::new()) } else { None });
    }

    /// Leaves the innermost scope: closes any captured locals' upvalues,
    /// frees registers held by locals declared in it, records their debug
    /// `end_pc`, and patches any pending `break` jumps to land here.
    pub fn leave_scope(&mut self) {
        let arg_a = self.jmp_arg_a();
        if arg_a > 0 {
            self.emit(Instruction::encode_asbx(OpCode::Jmp, arg_a as i32, 0));
        }
        let level = self.scope_lv;
        while let Some(last) = self.active.last() {
            if last.scope_lv < level {
                break;
            }
            let local = self.active.pop().unwrap();
            self.loc_vars[local.debug_idx].end_pc = self.pc() as u32;
            if let Some(slots) = self.by_name.get_mut(&local.name) {
                slots.pop();
            }
            self.free_reg();
        }
        if let Some(Some(pcs)) = self.breaks.pop() {
            for pc in pcs {
                self.patch_to_here(pc);
            }
        }
        self.scope_lv -= 1;
    }

    pub fn add_local(&mut self, name: &str) -> LuaResult<usize> {
        let slot = self.alloc_reg()?;
        let debug_idx = self.loc_vars.len();
        self.loc_vars.push(LocalVarInfo {
            name: name.to_string(),
            start_pc: self.pc() as u32,
            end_pc: 0,
        });
        self.active.push(ActiveLocal {
            name: name.to_string(),
            scope_lv: self.scope_lv,
            slot,
            captured: false,
            debug_idx,
        });
        self.by_name.entry(name.to_string()).or_default().push(self.active.len() - 1);
        Ok(slot)
    }

    pub fn slot_of_local(&self, name: &str) -> Option<usize> {
        let idx = *self.by_name.get(name)?.last()?;
        Some(self.active[idx].slot)
    }

    fn mark_captured(&mut self, name: &str) {
        if let Some(idx) = self.by_name.get(name).and_then(|v| v.last().copied()) {
            self.active[idx].captured = true;
        }
    }

    pub fn add_break(&mut self, pc: usize) -> LuaResult<()> {
        for scope in self.breaks.iter_mut().rev() {
            if let Some(pcs) = scope {
                pcs.push(pc);
                return Ok(());
            }
        }
        Err(LuaError::new(ErrorKind::BreakOutsideLoop, "break outside a loop"))
    }

    /// Register to use as the JMP `A` argument when closing upvalues on
    /// scope exit (spec §4.8 JMP: "if `A != 0`, closes every open upvalue
    /// at register index >= `A - 1`"), mirroring the Go codegen's
    /// `getJmpArgA`: 0 unless some local of the current scope was
    /// captured, in which case it's one past the minimum slot among all of
    /// the current scope's locals (the whole range being freed must close
    /// together).
    pub fn jmp_arg_a(&self) -> usize {
        let mut has_captured = false;
        let mut min_slot = self.used_regs;
        for local in self.active.iter().rev() {
            if local.scope_lv < self.scope_lv {
                break;
            }
            if local.captured {
                has_captured = true;
            }
            min_slot = min_slot.min(local.slot);
        }
        if has_captured {
            min_slot + 1
        } else {
            0
        }
    }

    // -- Labels and gotos -------------------------------------------------

    /// Defines `::name::` at the current pc, patching any goto already
    /// pending on it.
    pub fn define_label(&mut self, name: &str) {
        let pc = self.pc();
        self.labels.insert(name.to_string(), pc);
        let mut to_patch = Vec::new();
        self.pending_gotos.retain(|(n, jmp_pc, _)| {
            if n == name {
                to_patch.push(*jmp_pc);
                false
            } else {
                true
            }
        });
        for jmp_pc in to_patch {
            self.patch_to_here_pc(jmp_pc, pc);
        }
    }

    fn patch_to_here_pc(&mut self, jmp_pc: usize, target: usize) {
        let sbx = (target as i32) - (jmp_pc as i32) - 1;
        self.patch_sbx(jmp_pc, sbx);
    }

    /// Emits a `goto name`: an immediate backward jump if the label is
    /// already defined, otherwise a placeholder patched when the label is
    /// later seen (or reported unresolved in [`check_pending_gotos`]).
    pub fn emit_goto(&mut self, name: &str) -> LuaResult<()> {
        let arg_a = self.jmp_arg_a();
        let pc = self.emit(Instruction::encode_asbx(OpCode::Jmp, arg_a as i32, 0));
        if let Some(&target) = self.labels.get(name) {
            self.patch_to_here_pc(pc, target);
        } else {
            self.pending_gotos.push((name.to_string(), pc, self.current_line));
        }
        Ok(())
    }

    pub fn check_pending_gotos(&self) -> LuaResult<()> {
        if let Some((name, _, line)) = self.pending_gotos.first() {
            return Err(LuaError::new(
                ErrorKind::SyntaxError,
                format!("no visible label '{name}' for goto at line {line}"),
            ));
        }
        Ok(())
    }

    // -- Constants ------------------------------------------------------

    pub fn index_of_constant(&mut self, v: LuaValue) -> usize {
        if let Some(key) = const_key(&v) {
            if let Some(&idx) = self.const_index.get(&key) {
                return idx;
            }
            let idx = self.const_values.len();
            self.const_values.push(v);
            self.const_index.insert(key, idx);
            idx
        } else {
            self.const_values.push(v);
            self.const_values.len() - 1
        }
    }

    // -- Upvalues ---------------------------------------------------------

    pub fn upvalue_index_if_resolved(&self, name: &str) -> Option<usize> {
        self.upvalue_index.get(name).copied()
    }

    /// Seeds the main chunk's implicit `_ENV` upvalue (spec §4.7): every
    /// chunk behaves as if it were a vararg function with a single upvalue
    /// named `_ENV` supplying the globals table, the way Lua 5.2+ desugars
    /// free names into `_ENV.name` lookups. `LuaState::push_lua_closure`
    /// wires the actual globals table in directly for the outermost
    /// closure, so this entry's `in_stack`/`index` are never read for it —
    /// it only needs to occupy upvalue slot 0 so nested closures that
    /// capture a global resolve `_ENV` to the right index.
    pub fn seed_env_upvalue(&mut self) {
        self.add_upvalue("_ENV", false, 0);
    }

    fn add_upvalue(&mut self, name: &str, in_stack: bool, index: usize) -> usize {
        let idx = self.upvalues.len();
        self.upvalues.push(UpvalDesc { in_stack, index: index as u8 });
        self.upvalue_names.push(name.to_string());
        self.upvalue_index.insert(name.to_string(), idx);
        idx
    }

    pub fn into_prototype(self, source: String) -> Prototype {
        Prototype {
            source,
            line_defined: self.line_defined,
            last_line_defined: self.last_line_defined,
            num_params: self.num_params,
            is_vararg: self.is_vararg,
            max_stack_size: (self.max_regs.max(2)) as u8,
            code: self.code,
            constants: self.const_values,
            upvalues: self.upvalues,
            protos: self.children,
            line_info: self.line_info,
            local_vars: self.loc_vars,
            upvalue_names: self.upvalue_names,
        }
    }
}

/// Resolves `name` as an upvalue of `stack[level]`, recursively capturing
/// it from an enclosing function's locals or upvalues as needed. Returns
/// `None` if no enclosing function has `name` as a local or upvalue at all
/// (the caller falls back to indexing `_ENV`).
pub fn resolve_upvalue(stack: &mut [FuncState], level: usize, name: &str) -> Option<usize> {
    if let Some(idx) = stack[level].upvalue_index_if_resolved(name) {
        return Some(idx);
    }
    if level == 0 {
        return None;
    }
    let parent = level - 1;

    let parent_slot = stack[parent].slot_of_local(name);
    if let Some(slot) = parent_slot {
        let idx = stack[level].add_upvalue(name, true, slot);
        stack[parent].mark_captured(name);
        return Some(idx);
    }

    let parent_upvalue = resolve_upvalue(stack, parent, name);
    if let Some(up_idx) = parent_upvalue {
        let idx = stack[level].add_upvalue(name, false, up_idx);
        return Some(idx);
    }

    None
}
