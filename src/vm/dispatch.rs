//! The fetch-decode-execute loop and `Call` (spec §4.8, §4.9).
//!
//! Grounded on the teacher's `lua_vm/dispatcher/mod.rs` match-over-`OpCode`
//! shape, but not its raw-pointer, non-recursive `FrameAction` call
//! convention (`lua_vm/execute/call.rs`) — that design exists to avoid
//! re-entering `execute_frame` on a GC-tracked stack under `unsafe`; our
//! frames are plain `Vec<Frame>` with `Rc`-owned register windows, so a
//! Lua-to-Lua call is just an ordinary recursive call into [`run`], guarded
//! by [`MAX_CALL_DEPTH`] the way the teacher's `LUAI_MAXCCALLS` guards its
//! own C call depth.

use crate::error::{ErrorKind, LuaError, LuaResult};
use crate::number;
use crate::opcode::{const_index, is_const, Instruction, OpCode};
use crate::value::{Closure, LuaTable, LuaValue, Prototype};
use crate::vm::arith::{arith_values, compare, lua_len, ArithOp, CompareOp};
use crate::vm::execute::concat::concat_values;
use crate::vm::frame::Frame;
use crate::vm::state::LuaState;
use std::rc::Rc;

/// Guards recursive Lua-to-Lua/native calls the way the teacher's
/// `LUAI_MAXCCALLS` guards C call recursion — without it a pathological
/// `function f() f() end` would blow the host stack instead of raising a
/// catchable Lua error.
const MAX_CALL_DEPTH: usize = 200;

/// Matches the code generator's `LFIELDS_PER_FLUSH` (`compiler::func_state`):
/// SETLIST batches array entries in groups of this size.
const SETLIST_BATCH_SIZE: usize = 50;

/// §4.9 `Call`: invokes the callable sitting `n_args` below the current
/// frame's top. Shared by the stack API (`LuaState::call`) and by the
/// CALL/TAILCALL opcodes, which first position `top` to match the register
/// layout they're calling from.
pub fn call(state: &mut LuaState, n_args: usize, n_results: i32) -> LuaResult<()> {
    let (func, func_slot) = {
        let frame = state.frames.last().expect("call with no active frame");
        let top = frame.top;
        let func_slot = top.checked_sub(n_args + 1).ok_or_else(|| {
            LuaError::new(ErrorKind::StackUnderflow, "not enough values on the stack to call")
        })?;
        (frame.get(func_slot), func_slot)
    };
    do_call(state, func, func_slot, n_args, n_results)
}

fn do_call(state: &mut LuaState, func: LuaValue, func_slot: usize, n_args: usize, n_results: i32) -> LuaResult<()> {
    match &func {
        LuaValue::Function(closure) => match closure.as_ref() {
            Closure::Native { .. } => call_native(state, closure.clone(), func_slot, n_args, n_results),
            Closure::Lua(_) => call_lua(state, closure.clone(), func_slot, n_args, n_results),
        },
        other => {
            // §4.9: a non-callable value with a `__call` metamethod gets
            // itself prepended as the first argument and is retried once.
            if let Some(handler) = call_metamethod_of(state, other) {
                let frame = state.frames.last_mut().expect("call with no active frame");
                frame.check_stack(1);
                for i in (0..n_args).rev() {
                    let v = frame.get(func_slot + 1 + i);
                    frame.set(func_slot + 2 + i, v);
                }
                frame.set(func_slot, handler.clone());
                frame.set(func_slot + 1, other.clone());
                frame.top += 1;
                do_call(state, handler, func_slot, n_args + 1, n_results)
            } else {
                Err(LuaError::new(
                    ErrorKind::CallNonFunction,
                    format!("attempt to call a {} value", other.type_name()),
                ))
            }
        }
    }
}

/// A table's own metatable, or (spec.md's registry-keyed-by-type default
/// metatables) the shared metatable for `v`'s type if it isn't a table —
/// lets a host expose e.g. a default string metatable with `__call`.
fn call_metamethod_of(state: &LuaState, v: &LuaValue) -> Option<LuaValue> {
    let mt = state.metatable_of_value(v)?;
    let handler = mt.borrow().get(&LuaValue::from_string("__call"));
    if handler.is_nil() {
        None
    } else {
        Some(handler)
    }
}

fn call_native(
    state: &mut LuaState,
    closure: Rc<Closure>,
    func_slot: usize,
    n_args: usize,
    n_results: i32,
) -> LuaResult<()> {
    if state.frames.len() >= MAX_CALL_DEPTH {
        return Err(LuaError::new(ErrorKind::StackOverflow, "stack overflow"));
    }
    let f = match closure.as_ref() {
        Closure::Native { func, .. } => *func,
        Closure::Lua(_) => unreachable!("call_native only ever given a native closure"),
    };
    let args: Vec<LuaValue> = {
        let caller = state.frames.last().expect("call with no active frame");
        (0..n_args).map(|i| caller.get(func_slot + 1 + i)).collect()
    };

    let mut frame = Frame::new(closure, 0);
    for (i, v) in args.into_iter().enumerate() {
        frame.set(i, v);
    }
    frame.top = n_args;
    state.frames.push(frame);

    // §6 host function contract: the native receives the state (which now
    // addresses its own frame) and returns the count of results it left on
    // top of that frame.
    let outcome = f(state);
    let frame = state.frames.last().expect("native frame still active");
    let results: Vec<LuaValue> = match &outcome {
        Ok(n) => {
            let top = frame.top;
            (top - n..top).map(|i| frame.get(i)).collect()
        }
        Err(_) => Vec::new(),
    };
    state.frames.pop();

    match outcome {
        Ok(_) => {
            place_results(state, func_slot, results, n_results);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn call_lua(
    state: &mut LuaState,
    closure: Rc<Closure>,
    func_slot: usize,
    n_args: usize,
    n_results: i32,
) -> LuaResult<()> {
    if state.frames.len() >= MAX_CALL_DEPTH {
        return Err(LuaError::new(ErrorKind::StackOverflow, "stack overflow"));
    }
    let proto = closure.as_lua().expect("call_lua only ever given a Lua closure").proto.clone();
    let num_params = proto.num_params as usize;
    let is_vararg = proto.is_vararg;

    let mut args: Vec<LuaValue> = {
        let caller = state.frames.last().expect("call with no active frame");
        (0..n_args).map(|i| caller.get(func_slot + 1 + i)).collect()
    };
    let mut varargs = Vec::new();
    if args.len() > num_params {
        if is_vararg {
            varargs = args.split_off(num_params);
        } else {
            args.truncate(num_params);
        }
    } else {
        args.resize(num_params, LuaValue::Nil);
    }

    let mut frame = Frame::new(closure, proto.max_stack_size as usize);
    for (i, v) in args.into_iter().enumerate() {
        frame.set(i, v);
    }
    frame.top = num_params;
    frame.varargs = varargs;
    state.frames.push(frame);

    let outcome = run(state);
    state.frames.last_mut().expect("lua frame still active").close_all_upvalues();
    state.frames.pop();

    match outcome {
        Ok(results) => {
            place_results(state, func_slot, results, n_results);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Writes `results` starting at `func_slot`, padding with nil or truncating
/// to match a concrete `n_results`, or keeping them all when `n_results < 0`
/// (spec §4.9 "−1 means all").
fn place_results(state: &mut LuaState, func_slot: usize, mut results: Vec<LuaValue>, n_results: i32) {
    let produced = results.len();
    let frame = state.frames.last_mut().expect("call with no active frame");
    if n_results < 0 {
        frame.check_stack(produced);
        for (i, v) in results.into_iter().enumerate() {
            frame.set(func_slot + i, v);
        }
        frame.top = func_slot + produced;
    } else {
        let n = n_results as usize;
        results.resize(n, LuaValue::Nil);
        frame.check_stack(n);
        for (i, v) in results.into_iter().enumerate() {
            frame.set(func_slot + i, v);
        }
        frame.top = func_slot + n;
    }
}

/// Pushes `func` and `args` above the current top, calls with a fixed
/// result count, and returns the results without disturbing the registers
/// below the saved top — used where a result needs to land somewhere other
/// than the function's own slot (TFORCALL), unlike CALL/TAILCALL's in-place
/// convention.
fn call_values(state: &mut LuaState, func: LuaValue, args: Vec<LuaValue>, n_results: i32) -> LuaResult<Vec<LuaValue>> {
    let saved_top = state.frames.last().expect("call with no active frame").top;
    let n_args = args.len();
    state.push(func);
    for v in args {
        state.push(v);
    }
    state.call(n_args as i32, n_results)?;
    let new_top = state.frames.last().expect("call with no active frame").top;
    let results: Vec<LuaValue> = {
        let frame = state.frames.last().unwrap();
        (saved_top..new_top).map(|i| frame.get(i)).collect()
    };
    state.frames.last_mut().unwrap().top = saved_top;
    Ok(results)
}

fn rk(frame: &Frame, proto: &Prototype, x: i32) -> LuaValue {
    if is_const(x) {
        proto.constants[const_index(x)].clone()
    } else {
        frame.get(x as usize)
    }
}

fn jump(state: &mut LuaState, sbx: i32) {
    let frame = state.frames.last_mut().expect("jump with no active frame");
    frame.pc = (frame.pc as i32 + sbx) as usize;
}

fn arith_op_of(op: OpCode) -> ArithOp {
    match op {
        OpCode::Add => ArithOp::Add,
        OpCode::Sub => ArithOp::Sub,
        OpCode::Mul => ArithOp::Mul,
        OpCode::Mod => ArithOp::Mod,
        OpCode::Pow => ArithOp::Pow,
        OpCode::Div => ArithOp::Div,
        OpCode::IDiv => ArithOp::IDiv,
        OpCode::BAnd => ArithOp::BAnd,
        OpCode::BOr => ArithOp::BOr,
        OpCode::BXor => ArithOp::BXor,
        OpCode::Shl => ArithOp::Shl,
        OpCode::Shr => ArithOp::Shr,
        OpCode::Unm => ArithOp::Unm,
        OpCode::BNot => ArithOp::BNot,
        _ => unreachable!("arith_op_of called with a non-arithmetic opcode"),
    }
}

fn compare_op_of(op: OpCode) -> CompareOp {
    match op {
        OpCode::Eq => CompareOp::Eq,
        OpCode::Lt => CompareOp::Lt,
        OpCode::Le => CompareOp::Le,
        _ => unreachable!("compare_op_of called with a non-comparison opcode"),
    }
}

/// Converts a `for` loop's limit to the integer bound an integer loop needs
/// (spec §4.8 FORPREP), clamping an out-of-range float limit to the bound
/// that still produces the correct zero-or-more-iterations behavior rather
/// than wrapping.
fn for_limit_int(limit: &LuaValue, step: i64) -> LuaResult<i64> {
    if let LuaValue::Int(i) = limit {
        return Ok(*i);
    }
    let f = limit
        .to_float()
        .ok_or_else(|| LuaError::new(ErrorKind::ArithmeticError, "'for' limit must be a number"))?;
    Ok(if f.is_nan() {
        if step > 0 {
            i64::MIN
        } else {
            i64::MAX
        }
    } else if step > 0 {
        if f >= i64::MAX as f64 {
            i64::MAX
        } else {
            f.floor() as i64
        }
    } else if f <= i64::MIN as f64 {
        i64::MIN
    } else {
        f.ceil() as i64
    })
}

fn for_prep(state: &mut LuaState, a: usize) -> LuaResult<()> {
    let (init, limit, step) = {
        let frame = state.frames.last().expect("for-prep with no active frame");
        (frame.get(a), frame.get(a + 1), frame.get(a + 2))
    };
    match (&init, &step) {
        (LuaValue::Int(i0), LuaValue::Int(s)) => {
            if *s == 0 {
                return Err(LuaError::new(ErrorKind::ArithmeticError, "'for' step is zero"));
            }
            let lim = for_limit_int(&limit, *s)?;
            let frame = state.frames.last_mut().unwrap();
            frame.set(a + 1, LuaValue::Int(lim));
            frame.set(a, LuaValue::Int(i0.wrapping_sub(*s)));
        }
        _ => {
            let i0 = init
                .to_float()
                .ok_or_else(|| LuaError::new(ErrorKind::ArithmeticError, "'for' initial value must be a number"))?;
            let lim = limit
                .to_float()
                .ok_or_else(|| LuaError::new(ErrorKind::ArithmeticError, "'for' limit must be a number"))?;
            let s = step
                .to_float()
                .ok_or_else(|| LuaError::new(ErrorKind::ArithmeticError, "'for' step must be a number"))?;
            if s == 0.0 {
                return Err(LuaError::new(ErrorKind::ArithmeticError, "'for' step is zero"));
            }
            let frame = state.frames.last_mut().unwrap();
            frame.set(a + 1, LuaValue::Float(lim));
            frame.set(a, LuaValue::Float(i0 - s));
        }
    }
    Ok(())
}

fn for_loop(state: &mut LuaState, a: usize, sbx: i32) {
    let frame = state.frames.last_mut().expect("for-loop with no active frame");
    match frame.get(a + 2) {
        LuaValue::Int(step) => {
            let i = match frame.get(a) {
                LuaValue::Int(i) => i,
                _ => unreachable!("integer for-loop index"),
            };
            let limit = match frame.get(a + 1) {
                LuaValue::Int(l) => l,
                _ => unreachable!("integer for-loop limit"),
            };
            let next = i.wrapping_add(step);
            let cont = if step > 0 { next <= limit } else { next >= limit };
            if cont {
                frame.set(a, LuaValue::Int(next));
                frame.set(a + 3, LuaValue::Int(next));
                frame.pc = (frame.pc as i32 + sbx) as usize;
            }
        }
        LuaValue::Float(step) => {
            let i = frame.get(a).to_float().expect("float for-loop index");
            let limit = frame.get(a + 1).to_float().expect("float for-loop limit");
            let next = i + step;
            let cont = if step > 0.0 { next <= limit } else { next >= limit };
            if cont {
                frame.set(a, LuaValue::Float(next));
                frame.set(a + 3, LuaValue::Float(next));
                frame.pc = (frame.pc as i32 + sbx) as usize;
            }
        }
        _ => unreachable!("for-loop step is always Int or Float after FORPREP"),
    }
}

/// Runs the current (just-pushed) frame until a RETURN or TAILCALL produces
/// its result list.
fn run(state: &mut LuaState) -> LuaResult<Vec<LuaValue>> {
    loop {
        let (instr, proto) = {
            let frame = state.frames.last().expect("run with no active frame");
            let proto = frame.closure.as_lua().expect("run on a native frame").proto.clone();
            let pc = frame.pc;
            (proto.code[pc], proto)
        };
        state.frames.last_mut().unwrap().pc += 1;
        let op = instr
            .opcode()
            .ok_or_else(|| LuaError::new(ErrorKind::MalformedChunk, "invalid opcode in prototype"))?;
        let a = instr.get_a() as usize;

        match op {
            OpCode::Move => {
                let frame = state.frames.last_mut().unwrap();
                let v = frame.get(instr.get_b() as usize);
                frame.set(a, v);
            }
            OpCode::LoadK => {
                let v = proto.constants[instr.get_bx() as usize].clone();
                state.frames.last_mut().unwrap().set(a, v);
            }
            OpCode::LoadKX => {
                let ax = {
                    let frame = state.frames.last().unwrap();
                    proto.code[frame.pc].get_ax()
                };
                state.frames.last_mut().unwrap().pc += 1;
                let v = proto.constants[ax as usize].clone();
                state.frames.last_mut().unwrap().set(a, v);
            }
            OpCode::LoadBool => {
                let frame = state.frames.last_mut().unwrap();
                frame.set(a, LuaValue::Bool(instr.get_b() != 0));
                if instr.get_c() != 0 {
                    frame.pc += 1;
                }
            }
            OpCode::LoadNil => {
                let frame = state.frames.last_mut().unwrap();
                for i in 0..=instr.get_b() as usize {
                    frame.set(a + i, LuaValue::Nil);
                }
            }
            OpCode::GetUpval => {
                let frame = state.frames.last().unwrap();
                let v = frame.closure.as_lua().unwrap().upvalues[instr.get_b() as usize].borrow().get();
                state.frames.last_mut().unwrap().set(a, v);
            }
            OpCode::GetTabUp => {
                let (table, key) = {
                    let frame = state.frames.last().unwrap();
                    let table = frame.closure.as_lua().unwrap().upvalues[instr.get_b() as usize].borrow().get();
                    (table, rk(frame, &proto, instr.get_c()))
                };
                let v = state.index_get(table, key)?;
                state.frames.last_mut().unwrap().set(a, v);
            }
            OpCode::GetTable => {
                let (table, key) = {
                    let frame = state.frames.last().unwrap();
                    (frame.get(instr.get_b() as usize), rk(frame, &proto, instr.get_c()))
                };
                let v = state.index_get(table, key)?;
                state.frames.last_mut().unwrap().set(a, v);
            }
            OpCode::SetTabUp => {
                let (up, key, value) = {
                    let frame = state.frames.last().unwrap();
                    let up = frame.closure.as_lua().unwrap().upvalues[a].clone();
                    (up, rk(frame, &proto, instr.get_b()), rk(frame, &proto, instr.get_c()))
                };
                let table = up.borrow().get();
                state.index_set(table, key, value)?;
            }
            OpCode::SetUpval => {
                let (v, up) = {
                    let frame = state.frames.last().unwrap();
                    (frame.get(a), frame.closure.as_lua().unwrap().upvalues[instr.get_b() as usize].clone())
                };
                up.borrow_mut().set(v);
            }
            OpCode::SetTable => {
                let (table, key, value) = {
                    let frame = state.frames.last().unwrap();
                    (frame.get(a), rk(frame, &proto, instr.get_b()), rk(frame, &proto, instr.get_c()))
                };
                state.index_set(table, key, value)?;
            }
            OpCode::NewTable => {
                let narr = number::fb_to_int(instr.get_b() as u8) as usize;
                let nrec = number::fb_to_int(instr.get_c() as u8) as usize;
                state
                    .frames
                    .last_mut()
                    .unwrap()
                    .set(a, LuaValue::new_table(LuaTable::with_capacity(narr, nrec)));
            }
            OpCode::Self_ => {
                let (obj, key) = {
                    let frame = state.frames.last().unwrap();
                    (frame.get(instr.get_b() as usize), rk(frame, &proto, instr.get_c()))
                };
                let method = state.index_get(obj.clone(), key)?;
                let frame = state.frames.last_mut().unwrap();
                frame.set(a + 1, obj);
                frame.set(a, method);
            }
            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Mod | OpCode::Pow | OpCode::Div
            | OpCode::IDiv | OpCode::BAnd | OpCode::BOr | OpCode::BXor | OpCode::Shl | OpCode::Shr => {
                let (x, y) = {
                    let frame = state.frames.last().unwrap();
                    (rk(frame, &proto, instr.get_b()), rk(frame, &proto, instr.get_c()))
                };
                let result = arith_values(state, arith_op_of(op), &x, &y)?;
                state.frames.last_mut().unwrap().set(a, result);
            }
            OpCode::Unm | OpCode::BNot => {
                let x = state.frames.last().unwrap().get(instr.get_b() as usize);
                let result = arith_values(state, arith_op_of(op), &x, &x)?;
                state.frames.last_mut().unwrap().set(a, result);
            }
            OpCode::Not => {
                let frame = state.frames.last_mut().unwrap();
                let v = frame.get(instr.get_b() as usize);
                frame.set(a, LuaValue::Bool(!v.to_boolean()));
            }
            OpCode::Len => {
                let v = state.frames.last().unwrap().get(instr.get_b() as usize);
                let result = lua_len(state, &v)?;
                state.frames.last_mut().unwrap().set(a, result);
            }
            OpCode::Concat => {
                let (b, c) = (instr.get_b() as usize, instr.get_c() as usize);
                let mut values: Vec<LuaValue> = {
                    let frame = state.frames.last().unwrap();
                    (b..=c).map(|i| frame.get(i)).collect()
                };
                let result = concat_values(state, &mut values)?;
                state.frames.last_mut().unwrap().set(a, result);
            }
            OpCode::Jmp => {
                if a > 0 {
                    state.frames.last_mut().unwrap().close_upvalues_from(a - 1);
                }
                jump(state, instr.get_sbx());
            }
            OpCode::Eq | OpCode::Lt | OpCode::Le => {
                let (x, y) = {
                    let frame = state.frames.last().unwrap();
                    (rk(frame, &proto, instr.get_b()), rk(frame, &proto, instr.get_c()))
                };
                let result = compare(state, &x, &y, compare_op_of(op))?;
                if result != (a != 0) {
                    state.frames.last_mut().unwrap().pc += 1;
                }
            }
            OpCode::Test => {
                let v = state.frames.last().unwrap().get(a);
                if v.to_boolean() != (instr.get_c() != 0) {
                    state.frames.last_mut().unwrap().pc += 1;
                }
            }
            OpCode::TestSet => {
                let v = state.frames.last().unwrap().get(instr.get_b() as usize);
                if v.to_boolean() == (instr.get_c() != 0) {
                    state.frames.last_mut().unwrap().set(a, v);
                } else {
                    state.frames.last_mut().unwrap().pc += 1;
                }
            }
            OpCode::Call => {
                let (b, c) = (instr.get_b(), instr.get_c());
                let n_args = if b == 0 {
                    state.frames.last().unwrap().top - a - 1
                } else {
                    (b - 1) as usize
                };
                state.frames.last_mut().unwrap().top = a + 1 + n_args;
                let n_results = if c == 0 { -1 } else { c - 1 };
                call(state, n_args, n_results)?;
            }
            OpCode::TailCall => {
                // Not a genuinely reused stack frame (spec §9 has no
                // stack-safety requirement tied to proper tail calls); an
                // ordinary call whose results are immediately returned
                // produces the same observable behavior.
                let b = instr.get_b();
                let n_args = if b == 0 {
                    state.frames.last().unwrap().top - a - 1
                } else {
                    (b - 1) as usize
                };
                state.frames.last_mut().unwrap().top = a + 1 + n_args;
                call(state, n_args, -1)?;
                let top = state.frames.last().unwrap().top;
                let results: Vec<LuaValue> = {
                    let frame = state.frames.last().unwrap();
                    (a..top).map(|i| frame.get(i)).collect()
                };
                state.frames.last_mut().unwrap().close_all_upvalues();
                return Ok(results);
            }
            OpCode::Return => {
                let b = instr.get_b();
                let top = state.frames.last().unwrap().top;
                let count = if b == 0 { top - a } else { (b - 1) as usize };
                let results: Vec<LuaValue> = {
                    let frame = state.frames.last().unwrap();
                    (a..a + count).map(|i| frame.get(i)).collect()
                };
                return Ok(results);
            }
            OpCode::ForPrep => {
                for_prep(state, a)?;
                jump(state, instr.get_sbx());
            }
            OpCode::ForLoop => {
                for_loop(state, a, instr.get_sbx());
            }
            OpCode::TForCall => {
                let c = instr.get_c() as usize;
                let (func, arg1, arg2) = {
                    let frame = state.frames.last().unwrap();
                    (frame.get(a), frame.get(a + 1), frame.get(a + 2))
                };
                let results = call_values(state, func, vec![arg1, arg2], c as i32)?;
                let frame = state.frames.last_mut().unwrap();
                for (i, v) in results.into_iter().enumerate() {
                    frame.set(a + 3 + i, v);
                }
            }
            OpCode::TForLoop => {
                let frame = state.frames.last_mut().unwrap();
                let control = frame.get(a + 1);
                if !control.is_nil() {
                    frame.set(a, control);
                    frame.pc = (frame.pc as i32 + instr.get_sbx()) as usize;
                }
            }
            OpCode::SetList => {
                let (b, c) = (instr.get_b(), instr.get_c());
                let n = if b == 0 {
                    state.frames.last().unwrap().top - a - 1
                } else {
                    b as usize
                };
                let batch = if c == 0 {
                    let ax = {
                        let frame = state.frames.last().unwrap();
                        proto.code[frame.pc].get_ax()
                    };
                    state.frames.last_mut().unwrap().pc += 1;
                    (ax - 1) as usize
                } else {
                    (c - 1) as usize
                };
                let table = state.frames.last().unwrap().get(a);
                let t = table
                    .as_table()
                    .cloned()
                    .ok_or_else(|| LuaError::new(ErrorKind::IndexError, "SETLIST target is not a table"))?;
                let values: Vec<LuaValue> = {
                    let frame = state.frames.last().unwrap();
                    (1..=n).map(|i| frame.get(a + i)).collect()
                };
                let mut tb = t.borrow_mut();
                for (i, v) in values.into_iter().enumerate() {
                    let idx = batch * SETLIST_BATCH_SIZE + i + 1;
                    tb.put(LuaValue::Int(idx as i64), v).map_err(|e| match e {
                        crate::value::InvalidKey::Nil => LuaError::new(ErrorKind::TableIndexNil, "table index is nil"),
                        crate::value::InvalidKey::Nan => LuaError::new(ErrorKind::TableIndexNaN, "table index is NaN"),
                    })?;
                }
            }
            OpCode::Closure => {
                let child = proto.protos[instr.get_bx() as usize].clone();
                let self_closure = state.frames.last().unwrap().closure.clone();
                let mut upvalues = Vec::with_capacity(child.upvalues.len());
                for desc in &child.upvalues {
                    let up = if desc.in_stack {
                        state.frames.last_mut().unwrap().find_or_open_upvalue(desc.index as usize)
                    } else {
                        self_closure.as_lua().unwrap().upvalues[desc.index as usize].clone()
                    };
                    upvalues.push(up);
                }
                let new_closure = Closure::new_lua(child, upvalues);
                state.frames.last_mut().unwrap().set(a, LuaValue::Function(Rc::new(new_closure)));
            }
            OpCode::Vararg => {
                let b = instr.get_b();
                let frame = state.frames.last_mut().unwrap();
                let n = if b == 0 { frame.varargs.len() } else { (b - 1) as usize };
                frame.check_stack(n);
                for i in 0..n {
                    let v = frame.varargs.get(i).cloned().unwrap_or(LuaValue::Nil);
                    frame.set(a + i, v);
                }
                if b == 0 {
                    frame.top = a + n;
                }
            }
            OpCode::ExtraArg => {
                return Err(LuaError::new(
                    ErrorKind::MalformedChunk,
                    "EXTRAARG reached outside LOADKX/SETLIST",
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Closure as ClosureValue, Upvalue};

    fn proto_with(code: Vec<Instruction>, constants: Vec<LuaValue>, num_params: u8, max_stack_size: u8) -> Rc<Prototype> {
        Rc::new(Prototype {
            source: "test".to_string(),
            line_defined: 0,
            last_line_defined: 0,
            num_params,
            is_vararg: false,
            max_stack_size,
            code,
            constants,
            upvalues: Vec::new(),
            protos: Vec::new(),
            line_info: Vec::new(),
            local_vars: Vec::new(),
            upvalue_names: Vec::new(),
        })
    }

    fn push_and_call(state: &mut LuaState, proto: Rc<Prototype>, args: Vec<LuaValue>) -> LuaResult<Vec<LuaValue>> {
        let env = Upvalue::closed(LuaValue::Nil);
        let closure = Rc::new(ClosureValue::new_lua(proto, vec![env]));
        state.push(LuaValue::Function(closure));
        for a in &args {
            state.push(a.clone());
        }
        state.call(args.len() as i32, -1)?;
        let count = state.get_top();
        let results = (1..=count).map(|i| state.get(i)).collect();
        Ok(results)
    }

    #[test]
    fn move_add_return_computes_sum() {
        // function(a, b) return a + b end
        let code = vec![
            Instruction::encode_abc(OpCode::Add, 2, 0, 1),
            Instruction::encode_abc(OpCode::Return, 2, 2, 0),
        ];
        let proto = proto_with(code, vec![], 2, 3);
        let mut state = LuaState::new();
        let results = push_and_call(&mut state, proto, vec![LuaValue::Int(2), LuaValue::Int(3)]).unwrap();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], LuaValue::Int(5)));
    }

    #[test]
    fn closure_captures_outer_local_and_survives_after_the_outer_frame_returns() {
        use crate::value::UpvalDesc;

        // Child: function() return upval end
        let child = Rc::new(Prototype {
            source: "test".to_string(),
            line_defined: 0,
            last_line_defined: 0,
            num_params: 0,
            is_vararg: false,
            max_stack_size: 2,
            code: vec![
                Instruction::encode_abc(OpCode::GetUpval, 0, 0, 0),
                Instruction::encode_abc(OpCode::Return, 0, 2, 0),
            ],
            constants: vec![],
            upvalues: vec![UpvalDesc { in_stack: true, index: 0 }],
            protos: vec![],
            line_info: vec![],
            local_vars: vec![],
            upvalue_names: vec!["x".to_string()],
        });

        // Outer: local x = 10; return function() return x end
        let outer = Rc::new(Prototype {
            source: "test".to_string(),
            line_defined: 0,
            last_line_defined: 0,
            num_params: 0,
            is_vararg: false,
            max_stack_size: 2,
            code: vec![
                Instruction::encode_abx(OpCode::LoadK, 0, 0),
                Instruction::encode_abx(OpCode::Closure, 1, 0),
                Instruction::encode_abc(OpCode::Return, 1, 2, 0),
            ],
            constants: vec![LuaValue::Int(10)],
            upvalues: vec![],
            protos: vec![child],
            line_info: vec![],
            local_vars: vec![],
            upvalue_names: vec![],
        });

        let mut state = LuaState::new();
        let results = push_and_call(&mut state, outer, vec![]).unwrap();
        assert_eq!(results.len(), 1);

        state.push(results[0].clone());
        state.call(0, -1).unwrap();
        assert!(matches!(state.get(1), LuaValue::Int(10)));
    }

    #[test]
    fn call_of_native_function_returns_its_pushed_results() {
        fn double_first_arg(state: &mut LuaState) -> LuaResult<usize> {
            let v = state.to_integer(1);
            state.push_integer(v * 2);
            Ok(1)
        }
        let code = vec![
            Instruction::encode_abc(OpCode::GetUpval, 1, 0, 0),
            Instruction::encode_abc(OpCode::Move, 2, 0, 0),
            Instruction::encode_abc(OpCode::Call, 1, 2, 2),
            Instruction::encode_abc(OpCode::Return, 1, 2, 0),
        ];
        let proto = proto_with(code, vec![], 1, 4);
        let mut state = LuaState::new();

        let native = Rc::new(ClosureValue::new_native("double", double_first_arg));
        let env = Upvalue::closed(LuaValue::Function(native));
        let closure = Rc::new(ClosureValue::new_lua(proto, vec![env]));
        state.push(LuaValue::Function(closure));
        state.push_integer(21);
        state.call(1, -1).unwrap();
        assert!(matches!(state.get(1), LuaValue::Int(42)));
    }
}
