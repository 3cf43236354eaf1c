//! The per-call register window / frame (spec §3 Stack(frame), §4.5 Stack
//! frame and index discipline).
//!
//! Grounded on the teacher's `lua_vm::lua_call_frame::CallInfo`, adapted
//! to own its register window directly as a `RegisterWindow`
//! (`Rc<RefCell<Vec<LuaValue>>>`) rather than pointing into one shared
//! arena-backed stack, since each Lua call here gets its own register
//! window per spec §3 ("a contiguous register window... a link to the
//! caller frame").

use crate::value::{Closure, LuaValue, RegisterWindow, Upvalue};
use std::cell::RefCell;
use std::rc::Rc;

/// Slack appended to `max_stack_size` (spec §3: "a reserve, >= 20 slots").
pub const RESERVE: usize = 20;

pub struct Frame {
    pub registers: RegisterWindow,
    /// One-past-last active slot; positive API indices count from 0 up to
    /// `top`, negative from `top` down (spec §4.5).
    pub top: usize,
    pub closure: Rc<Closure>,
    pub varargs: Vec<LuaValue>,
    pub pc: usize,
    /// Open upvalues created from this frame's registers, keyed by the
    /// slot they alias. At most one open upvalue per slot (spec §3
    /// invariant) — looked up by slot via `aliases`.
    pub open_upvalues: Vec<Rc<RefCell<Upvalue>>>,
    /// True for a call into a closure whose result count was requested as
    /// "all" (nresults == -1); used by CALL/RETURN bookkeeping.
    pub want_all_results: bool,
}

impl Frame {
    pub fn new(closure: Rc<Closure>, max_stack_size: usize) -> Frame {
        let size = max_stack_size + RESERVE;
        Frame {
            registers: Rc::new(RefCell::new(vec![LuaValue::Nil; size])),
            top: 0,
            closure,
            varargs: Vec::new(),
            pc: 0,
            open_upvalues: Vec::new(),
            want_all_results: false,
        }
    }

    pub fn get(&self, i: usize) -> LuaValue {
        self.registers.borrow().get(i).cloned().unwrap_or(LuaValue::Nil)
    }

    pub fn set(&mut self, i: usize, v: LuaValue) {
        let mut regs = self.registers.borrow_mut();
        if i >= regs.len() {
            regs.resize(i + 1, LuaValue::Nil);
        }
        regs[i] = v;
    }

    pub fn check_stack(&mut self, extra: usize) {
        let mut regs = self.registers.borrow_mut();
        if self.top + extra > regs.len() {
            regs.resize(self.top + extra, LuaValue::Nil);
        }
    }

    /// Finds (creating if absent) the open upvalue aliasing register
    /// `slot` of this frame (spec §4.5 upvalue binding on CLOSURE).
    pub fn find_or_open_upvalue(&mut self, slot: usize) -> Rc<RefCell<Upvalue>> {
        if let Some(existing) = self.open_upvalues.iter().find(|u| u.borrow().aliases(&self.registers, slot)) {
            return existing.clone();
        }
        let up = Upvalue::open(self.registers.clone(), slot);
        self.open_upvalues.push(up.clone());
        up
    }

    /// Closes every open upvalue aliasing a slot >= `from_slot` (spec §4.5
    /// Upvalue closing — driven by JMP A>0 and by frame exit).
    pub fn close_upvalues_from(&mut self, from_slot: usize) {
        for up in &self.open_upvalues {
            let should_close = up
                .borrow()
                .slot()
                .map(|s| s >= from_slot)
                .unwrap_or(false);
            if should_close {
                up.borrow_mut().close();
            }
        }
        self.open_upvalues.retain(|u| u.borrow().is_open());
    }

    pub fn close_all_upvalues(&mut self) {
        self.close_upvalues_from(0);
    }
}
