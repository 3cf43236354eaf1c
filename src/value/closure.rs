//! Closures and upvalues (spec §3 Closure/Upvalue, §4.5 upvalue binding and
//! closing).
//!
//! Grounded on the teacher's `gc::gc_object` closure representation (a
//! prototype reference plus an upvalue list) and its `lua_vm::CFunction`
//! native-function contract, adapted to share open upvalues through a
//! `Rc<RefCell<Vec<LuaValue>>>` register window rather than a GC-tracked
//! stack pointer (spec §9 design note on resolving the
//! frame→closure→upvalue→frame ownership cycle with a two-state cell).

use crate::error::LuaResult;
use crate::value::proto::Prototype;
use crate::value::value::LuaValue;
use std::cell::RefCell;
use std::rc::Rc;

/// A native (host) function. Matches spec §6's host function contract: it
/// receives the state and returns the count of result values it left on
/// top of the current frame.
pub type NativeFn = fn(&mut crate::vm::LuaState) -> LuaResult<usize>;

/// Either a Lua closure (prototype + captured upvalues) or a host closure
/// (native function pointer + captured upvalues), per spec §3 Closure.
pub enum Closure {
    Lua(LuaClosure),
    Native {
        name: &'static str,
        func: NativeFn,
    },
}

pub struct LuaClosure {
    pub proto: Rc<Prototype>,
    pub upvalues: Vec<Rc<RefCell<Upvalue>>>,
}

impl Closure {
    pub fn new_lua(proto: Rc<Prototype>, upvalues: Vec<Rc<RefCell<Upvalue>>>) -> Closure {
        Closure::Lua(LuaClosure { proto, upvalues })
    }

    pub fn new_native(name: &'static str, func: NativeFn) -> Closure {
        Closure::Native { name, func }
    }

    pub fn as_lua(&self) -> Option<&LuaClosure> {
        match self {
            Closure::Lua(c) => Some(c),
            _ => None,
        }
    }
}

/// A shared register window: the storage a frame's locals live in while
/// the frame is active, and that open upvalues alias directly.
pub type RegisterWindow = Rc<RefCell<Vec<LuaValue>>>;

/// A holder for a single captured value (spec §3 Upvalue). While
/// [`UpvalueState::Open`] it aliases a slot of a still-live frame's
/// register window; [`close`](Upvalue::close) copies the current value out
/// and switches to [`UpvalueState::Closed`], after which the frame can be
/// dropped without invalidating the closure that captured it.
pub struct Upvalue {
    state: UpvalueState,
}

pub enum UpvalueState {
    Open { registers: RegisterWindow, slot: usize },
    Closed(LuaValue),
}

impl Upvalue {
    pub fn open(registers: RegisterWindow, slot: usize) -> Rc<RefCell<Upvalue>> {
        Rc::new(RefCell::new(Upvalue {
            state: UpvalueState::Open { registers, slot },
        }))
    }

    pub fn closed(value: LuaValue) -> Rc<RefCell<Upvalue>> {
        Rc::new(RefCell::new(Upvalue {
            state: UpvalueState::Closed(value),
        }))
    }

    pub fn get(&self) -> LuaValue {
        match &self.state {
            UpvalueState::Open { registers, slot } => registers.borrow()[*slot].clone(),
            UpvalueState::Closed(v) => v.clone(),
        }
    }

    pub fn set(&mut self, value: LuaValue) {
        match &mut self.state {
            UpvalueState::Open { registers, slot } => registers.borrow_mut()[*slot] = value,
            UpvalueState::Closed(v) => *v = value,
        }
    }

    /// True while this upvalue still aliases slot `slot` of `registers`
    /// (used by the frame's open-upvalue map to find upvalues to close).
    pub fn aliases(&self, registers: &RegisterWindow, slot: usize) -> bool {
        match &self.state {
            UpvalueState::Open { registers: r, slot: s } => Rc::ptr_eq(r, registers) && *s == slot,
            UpvalueState::Closed(_) => false,
        }
    }

    pub fn slot(&self) -> Option<usize> {
        match &self.state {
            UpvalueState::Open { slot, .. } => Some(*slot),
            UpvalueState::Closed(_) => None,
        }
    }

    /// Closes this upvalue: copies the current slot value into its own
    /// storage so it outlives the frame (spec §4.5 Upvalue closing).
    pub fn close(&mut self) {
        if let UpvalueState::Open { registers, slot } = &self.state {
            let value = registers.borrow()[*slot].clone();
            self.state = UpvalueState::Closed(value);
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, UpvalueState::Open { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_upvalue_reads_through_to_live_register() {
        let regs: RegisterWindow = Rc::new(RefCell::new(vec![LuaValue::Int(1), LuaValue::Int(2)]));
        let up = Upvalue::open(regs.clone(), 1);
        assert!(matches!(up.borrow().get(), LuaValue::Int(2)));
        regs.borrow_mut()[1] = LuaValue::Int(42);
        assert!(matches!(up.borrow().get(), LuaValue::Int(42)));
    }

    #[test]
    fn closing_detaches_from_the_register_window() {
        let regs: RegisterWindow = Rc::new(RefCell::new(vec![LuaValue::Int(7)]));
        let up = Upvalue::open(regs.clone(), 0);
        up.borrow_mut().close();
        regs.borrow_mut()[0] = LuaValue::Int(99);
        assert!(matches!(up.borrow().get(), LuaValue::Int(7)));
        assert!(!up.borrow().is_open());
    }

    #[test]
    fn two_closures_sharing_an_upvalue_see_each_others_writes() {
        let regs: RegisterWindow = Rc::new(RefCell::new(vec![LuaValue::Int(0)]));
        let shared = Upvalue::open(regs, 0);
        let a = shared.clone();
        let b = shared.clone();
        a.borrow_mut().set(LuaValue::Int(5));
        assert!(matches!(b.borrow().get(), LuaValue::Int(5)));
    }
}
