//! AST -> bytecode code generator (spec §4.7 Code generator).
//!
//! Grounded on `original_source`'s `compiler/codegen.go`: a single-pass
//! statement/expression emitter driving a `FuncState` per activation record,
//! the same shape as the Go compiler's `cg_*` functions threading a
//! `*funcInfo`. Where the Go compiler defers an expression to an "expdesc"
//! and folds it into whichever instruction consumes it, this one always
//! compiles an expression straight into an explicit destination register
//! (`expr_to_reg`/`expr_to_next_reg`) and relies on `FuncState::free_to` to
//! release temporaries — simpler to keep correct without Go's closures, at
//! the cost of a few extra MOVEs a peephole pass would fold away.

use super::ast::*;
use super::func_state::{resolve_upvalue, FuncState};
use crate::error::{ErrorKind, LuaError, LuaResult};
use crate::number::int_to_fb;
use crate::opcode::{rk_const, Instruction, OpCode, MAXINDEXRK};
use crate::value::{LuaValue, Prototype};
use std::rc::Rc;

pub fn generate(block: &Block, source: &str) -> LuaResult<Prototype> {
    let mut top = FuncState::new(0, true, 0);
    top.seed_env_upvalue();
    let mut cg = Codegen { stack: vec![top], source: source.to_string() };
    cg.stats_and_ret(block)?;
    cg.fs().check_pending_gotos()?;
    if block.ret.is_none() {
        cg.fs().emit(Instruction::encode_abc(OpCode::Return, 0, 1, 0));
    }
    let fs = cg.stack.pop().expect("main chunk FuncState");
    Ok(fs.into_prototype(source.to_string()))
}

/// Resolved meaning of a bare name (spec §4.7 Name resolution).
enum NameRef {
    Local(usize),
    Upvalue(usize),
    Global(usize, String),
}

enum CallWant {
    Exact(usize),
    All,
}

struct Codegen {
    stack: Vec<FuncState>,
    source: String,
}

impl Codegen {
    fn fs(&mut self) -> &mut FuncState {
        self.stack.last_mut().unwrap()
    }

    fn level(&self) -> usize {
        self.stack.len() - 1
    }

    fn resolve_name(&mut self, name: &str) -> NameRef {
        if let Some(slot) = self.fs().slot_of_local(name) {
            return NameRef::Local(slot);
        }
        let level = self.level();
        if let Some(idx) = resolve_upvalue(&mut self.stack, level, name) {
            return NameRef::Upvalue(idx);
        }
        let env_idx = resolve_upvalue(&mut self.stack, level, "_ENV")
            .expect("_ENV is seeded as upvalue 0 of the main chunk");
        NameRef::Global(env_idx, name.to_string())
    }

    // -- Blocks / statements --------------------------------------------

    fn block(&mut self, b: &Block) -> LuaResult<()> {
        self.fs().enter_scope(false);
        self.stats_and_ret(b)?;
        self.fs().leave_scope();
        Ok(())
    }

    fn stats_and_ret(&mut self, b: &Block) -> LuaResult<()> {
        for s in &b.stats {
            self.stat(s)?;
        }
        if let Some((exprs, _)) = &b.ret {
            self.return_stat(exprs)?;
        }
        Ok(())
    }

    fn stat(&mut self, s: &Stat) -> LuaResult<()> {
        let line = stat_line(s);
        if line != 0 {
            self.fs().set_line(line);
        }
        match s {
            Stat::Empty => Ok(()),
            Stat::Break(_) => self.break_stat(),
            Stat::Label { name, .. } => {
                self.fs().define_label(name);
                Ok(())
            }
            Stat::Goto { name, .. } => self.fs().emit_goto(name),
            Stat::Do(body) => self.block(body),
            Stat::While { cond, body, .. } => self.while_stat(cond, body),
            Stat::Repeat { body, cond, .. } => self.repeat_stat(body, cond),
            Stat::If { conds, blocks, else_block } => self.if_stat(conds, blocks, else_block),
            Stat::ForNum { name, start, stop, step, body, .. } => {
                self.for_num(name, start, stop, step, body)
            }
            Stat::ForIn { names, exprs, body, .. } => self.for_in(names, exprs, body),
            Stat::FuncDecl { target, func, line, .. } => self.func_decl(target, func, *line),
            Stat::LocalFunc { name, func, .. } => self.local_func(name, func),
            Stat::LocalDecl { names, exprs, .. } => self.local_decl(names, exprs),
            Stat::Assign { targets, exprs, .. } => self.assign_stat(targets, exprs),
            Stat::Call(e) => self.compile_call(e, CallWant::Exact(0)),
        }
    }

    fn break_stat(&mut self) -> LuaResult<()> {
        let arg_a = self.fs().jmp_arg_a();
        let pc = self.fs().emit(Instruction::encode_asbx(OpCode::Jmp, arg_a as i32, 0));
        self.fs().add_break(pc)
    }

    /// Compiles a condition and returns the pcs of JMPs taken when `cond`'s
    /// truthiness equals `exit_when`. Temporaries used to evaluate `cond`
    /// are freed before returning.
    fn jumps_on(&mut self, cond: &Expr, exit_when: bool) -> LuaResult<Vec<usize>> {
        let mark = self.fs().used_regs();
        let reg = self.expr_to_next_reg(cond)?;
        let c = if exit_when { 1 } else { 0 };
        self.fs().emit(Instruction::encode_abc(OpCode::Test, reg as i32, 0, c));
        let pc = self.fs().emit(Instruction::encode_asbx(OpCode::Jmp, 0, 0));
        self.fs().free_to(mark);
        Ok(vec![pc])
    }

    fn while_stat(&mut self, cond: &Expr, body: &Block) -> LuaResult<()> {
        self.fs().enter_scope(true);
        let start_pc = self.fs().pc();
        let exit_jumps = self.jumps_on(cond, false)?;
        self.block(body)?;
        let back_pc = self.fs().pc();
        let sbx = start_pc as i32 - back_pc as i32 - 1;
        self.fs().emit(Instruction::encode_asbx(OpCode::Jmp, 0, sbx));
        for pc in exit_jumps {
            self.fs().patch_to_here(pc);
        }
        self.fs().leave_scope();
        Ok(())
    }

    fn repeat_stat(&mut self, body: &Block, cond: &Expr) -> LuaResult<()> {
        self.fs().enter_scope(true);
        let start_pc = self.fs().pc();
        self.stats_and_ret(body)?;
        let mark = self.fs().used_regs();
        let reg = self.expr_to_next_reg(cond)?;
        self.fs().emit(Instruction::encode_abc(OpCode::Test, reg as i32, 0, 1));
        let exit_pc = self.fs().emit(Instruction::encode_asbx(OpCode::Jmp, 0, 0));
        self.fs().free_to(mark);
        let back_pc = self.fs().pc();
        let sbx = start_pc as i32 - back_pc as i32 - 1;
        self.fs().emit(Instruction::encode_asbx(OpCode::Jmp, 0, sbx));
        self.fs().leave_scope();
        self.fs().patch_to_here(exit_pc);
        Ok(())
    }

    fn if_stat(&mut self, conds: &[Expr], blocks: &[Block], else_block: &Option<Block>) -> LuaResult<()> {
        let mut end_jumps = Vec::new();
        for (cond, body) in conds.iter().zip(blocks.iter()) {
            let exit_jumps = self.jumps_on(cond, false)?;
            self.block(body)?;
            let j = self.fs().emit(Instruction::encode_asbx(OpCode::Jmp, 0, 0));
            end_jumps.push(j);
            for pc in exit_jumps {
                self.fs().patch_to_here(pc);
            }
        }
        if let Some(eb) = else_block {
            self.block(eb)?;
        }
        for pc in end_jumps {
            self.fs().patch_to_here(pc);
        }
        Ok(())
    }

    fn for_num(
        &mut self,
        name: &str,
        start: &Expr,
        stop: &Expr,
        step: &Option<Expr>,
        body: &Block,
    ) -> LuaResult<()> {
        self.fs().enter_scope(true);
        let base = self.fs().used_regs();
        self.expr_to_next_reg(start)?;
        self.expr_to_next_reg(stop)?;
        match step {
            Some(s) => {
                self.expr_to_next_reg(s)?;
            }
            None => {
                let r = self.fs().alloc_reg()?;
                self.load_const(r, LuaValue::Int(1))?;
            }
        }
        let prep_pc = self.fs().emit(Instruction::encode_asbx(OpCode::ForPrep, base as i32, 0));
        let body_start = self.fs().pc();
        self.fs().enter_scope(false);
        self.fs().add_local(name)?;
        self.stats_and_ret(body)?;
        self.fs().leave_scope();
        self.fs().patch_to_here(prep_pc);
        let loop_pc = self.fs().emit(Instruction::encode_asbx(OpCode::ForLoop, base as i32, 0));
        let sbx_back = body_start as i32 - loop_pc as i32 - 1;
        self.fs().patch_sbx(loop_pc, sbx_back);
        self.fs().leave_scope();
        Ok(())
    }

    fn for_in(&mut self, names: &[String], exprs: &[Expr], body: &Block) -> LuaResult<()> {
        self.fs().enter_scope(true);
        let base = self.fs().used_regs();
        self.compile_expr_list_exact(exprs, 3)?;
        let jmp_to_test = self.fs().emit(Instruction::encode_asbx(OpCode::Jmp, 0, 0));
        let body_start = self.fs().pc();
        self.fs().enter_scope(false);
        for n in names {
            self.fs().add_local(n)?;
        }
        self.stats_and_ret(body)?;
        self.fs().leave_scope();
        self.fs().patch_to_here(jmp_to_test);
        self.fs().emit(Instruction::encode_abc(OpCode::TForCall, base as i32, 0, names.len() as i32));
        let loop_pc =
            self.fs().emit(Instruction::encode_asbx(OpCode::TForLoop, (base + 2) as i32, 0));
        let sbx_back = body_start as i32 - loop_pc as i32 - 1;
        self.fs().patch_sbx(loop_pc, sbx_back);
        self.fs().leave_scope();
        Ok(())
    }

    fn func_decl(&mut self, target: &[String], func: &FunctionBody, line: u32) -> LuaResult<()> {
        let target_expr = build_target_expr(target, line);
        let func_expr = Expr::Function(func.clone());
        self.assign_stat(std::slice::from_ref(&target_expr), std::slice::from_ref(&func_expr))
    }

    fn local_func(&mut self, name: &str, func: &FunctionBody) -> LuaResult<()> {
        let slot = self.fs().add_local(name)?;
        self.expr_function(func, slot)
    }

    fn local_decl(&mut self, names: &[String], exprs: &[Expr]) -> LuaResult<()> {
        self.compile_expr_list_exact(exprs, names.len())?;
        for name in names {
            self.fs().add_local(name)?;
        }
        Ok(())
    }

    fn return_stat(&mut self, exprs: &[Expr]) -> LuaResult<()> {
        if exprs.is_empty() {
            self.fs().emit(Instruction::encode_abc(OpCode::Return, 0, 1, 0));
            return Ok(());
        }
        let mark = self.fs().used_regs();
        let base = mark;
        let last_idx = exprs.len() - 1;
        let last_multret = exprs[last_idx].is_multret();
        for (i, e) in exprs.iter().enumerate() {
            if i == last_idx && last_multret {
                self.compile_multret_all(e)?;
            } else {
                self.expr_to_next_reg(e)?;
            }
        }
        let b = if last_multret { 0 } else { (exprs.len() + 1) as i32 };
        self.fs().emit(Instruction::encode_abc(OpCode::Return, base as i32, b, 0));
        self.fs().free_to(mark);
        Ok(())
    }

    /// Assignment, shared by plain `a, b = ...` and (after rewriting the
    /// target into an `Expr`) `function a.b.c() ... end` declarations.
    /// Index-target object/key prefixes are evaluated before the
    /// right-hand side, matching the order real Lua's own compiler picks
    /// (the manual leaves this unspecified).
    fn assign_stat(&mut self, targets: &[Expr], exprs: &[Expr]) -> LuaResult<()> {
        enum Target {
            Local(usize),
            Upvalue(usize),
            Global(usize, String),
            Index { obj_reg: usize, key_rk: i32 },
        }

        let mark = self.fs().used_regs();
        let mut resolved = Vec::with_capacity(targets.len());
        for t in targets {
            match t {
                Expr::Name(name, _) => match self.resolve_name(name) {
                    NameRef::Local(slot) => resolved.push(Target::Local(slot)),
                    NameRef::Upvalue(idx) => resolved.push(Target::Upvalue(idx)),
                    NameRef::Global(env_idx, gname) => resolved.push(Target::Global(env_idx, gname)),
                },
                Expr::Index { obj, key, .. } => {
                    let obj_reg = self.expr_to_any_reg(obj)?;
                    let key_rk = self.expr_to_rk(key)?;
                    resolved.push(Target::Index { obj_reg, key_rk });
                }
                _ => {
                    return Err(LuaError::new(
                        ErrorKind::SyntaxError,
                        "cannot assign to this expression",
                    ))
                }
            }
        }

        let base = self.compile_expr_list_exact(exprs, targets.len())?;
        for (i, tgt) in resolved.into_iter().enumerate() {
            let src = (base + i) as i32;
            match tgt {
                Target::Local(slot) => {
                    if slot as i32 != src {
                        self.fs().emit(Instruction::encode_abc(OpCode::Move, slot as i32, src, 0));
                    }
                }
                Target::Upvalue(idx) => {
                    self.fs().emit(Instruction::encode_abc(OpCode::SetUpval, src, idx as i32, 0));
                }
                Target::Global(env_idx, name) => {
                    let key_rk = self.const_rk(LuaValue::from_string(name))?;
                    self.fs().emit(Instruction::encode_abc(
                        OpCode::SetTabUp,
                        env_idx as i32,
                        key_rk,
                        src,
                    ));
                }
                Target::Index { obj_reg, key_rk } => {
                    self.fs().emit(Instruction::encode_abc(
                        OpCode::SetTable,
                        obj_reg as i32,
                        key_rk,
                        src,
                    ));
                }
            }
        }
        self.fs().free_to(mark);
        Ok(())
    }

    // -- Expression lists -------------------------------------------------

    /// Compiles `exprs` into exactly `n` freshly allocated, contiguous
    /// registers, expanding a trailing multi-result expression or
    /// nil-padding as needed, and discarding (but still evaluating, for
    /// side effects) any values beyond `n`. Returns the base register.
    fn compile_expr_list_exact(&mut self, exprs: &[Expr], n: usize) -> LuaResult<usize> {
        let base = self.fs().used_regs();
        if exprs.is_empty() {
            for _ in 0..n {
                let r = self.fs().alloc_reg()?;
                self.fs().emit(Instruction::encode_abc(OpCode::LoadNil, r as i32, 0, 0));
            }
            return Ok(base);
        }
        let last = exprs.len() - 1;
        for (i, e) in exprs.iter().enumerate() {
            if i == last && i < n {
                let need = n - i;
                if need > 1 && e.is_multret() {
                    self.compile_multret(e, need)?;
                    continue;
                }
            }
            let r = self.expr_to_next_reg(e)?;
            if i >= n {
                self.fs().free_reg();
                let _ = r;
            }
        }
        let produced = self.fs().used_regs() - base;
        for _ in produced..n {
            let r = self.fs().alloc_reg()?;
            self.fs().emit(Instruction::encode_abc(OpCode::LoadNil, r as i32, 0, 0));
        }
        Ok(base)
    }

    fn compile_multret(&mut self, e: &Expr, count: usize) -> LuaResult<()> {
        match e {
            Expr::Call { .. } => self.compile_call(e, CallWant::Exact(count)),
            Expr::Vararg(_) => {
                let base = self.fs().alloc_regs(count)?;
                self.fs().emit(Instruction::encode_abc(
                    OpCode::Vararg,
                    base as i32,
                    (count + 1) as i32,
                    0,
                ));
                Ok(())
            }
            _ => unreachable!("compile_multret called on a single-valued expression"),
        }
    }

    fn compile_multret_all(&mut self, e: &Expr) -> LuaResult<()> {
        match e {
            Expr::Call { .. } => self.compile_call(e, CallWant::All),
            Expr::Vararg(_) => {
                let base = self.fs().used_regs();
                self.fs().emit(Instruction::encode_abc(OpCode::Vararg, base as i32, 0, 0));
                Ok(())
            }
            _ => {
                self.expr_to_next_reg(e)?;
                Ok(())
            }
        }
    }

    fn compile_call(&mut self, e: &Expr, want: CallWant) -> LuaResult<()> {
        let (func, method, args) = match e {
            Expr::Call { func, method, args, .. } => (func.as_ref(), method.as_ref(), args),
            _ => unreachable!("compile_call on a non-call expression"),
        };
        let base = self.fs().used_regs();
        self.expr_to_next_reg(func)?;
        if let Some(m) = method {
            self.fs().alloc_reg()?;
            let key_rk = self.const_rk(LuaValue::from_string(m.clone()))?;
            self.fs().emit(Instruction::encode_abc(OpCode::Self_, base as i32, base as i32, key_rk));
        }

        let args_multret = args.last().map(|a| a.is_multret()).unwrap_or(false);
        for (i, a) in args.iter().enumerate() {
            if i == args.len() - 1 && args_multret {
                self.compile_multret_all(a)?;
            } else {
                self.expr_to_next_reg(a)?;
            }
        }

        let nargs_total = self.fs().used_regs() - base - 1;
        let b = if args_multret { 0 } else { (nargs_total + 1) as i32 };
        let c = match want {
            CallWant::Exact(n) => (n + 1) as i32,
            CallWant::All => 0,
        };
        self.fs().emit(Instruction::encode_abc(OpCode::Call, base as i32, b, c));

        if let CallWant::Exact(n) = want {
            let current = self.fs().used_regs();
            let target_regs = base + n;
            if target_regs > current {
                for _ in current..target_regs {
                    self.fs().alloc_reg()?;
                }
            } else {
                for _ in target_regs..current {
                    self.fs().free_reg();
                }
            }
        }
        Ok(())
    }

    // -- Expressions --------------------------------------------------

    fn expr_to_next_reg(&mut self, e: &Expr) -> LuaResult<usize> {
        let r = self.fs().alloc_reg()?;
        self.expr_to_reg(e, r)?;
        Ok(r)
    }

    /// Materializes `e` into an existing register when it's already one
    /// (a local variable, reused without a copy), else into a fresh one.
    fn expr_to_any_reg(&mut self, e: &Expr) -> LuaResult<usize> {
        if let Expr::Name(name, _) = e {
            if let Some(slot) = self.fs().slot_of_local(name) {
                return Ok(slot);
            }
        }
        self.expr_to_next_reg(e)
    }

    /// An RK operand: a constant-pool reference when `e` is a literal or
    /// already-resolved local, else a materialized register.
    fn expr_to_rk(&mut self, e: &Expr) -> LuaResult<i32> {
        match e {
            Expr::Nil(_) => self.const_rk(LuaValue::Nil),
            Expr::True(_) => self.const_rk(LuaValue::Bool(true)),
            Expr::False(_) => self.const_rk(LuaValue::Bool(false)),
            Expr::Int(i, _) => self.const_rk(LuaValue::Int(*i)),
            Expr::Float(f, _) => self.const_rk(LuaValue::Float(*f)),
            Expr::Str(s, _) => self.const_rk(LuaValue::from_string(s.clone())),
            Expr::Name(name, _) => {
                if let Some(slot) = self.fs().slot_of_local(name) {
                    return Ok(slot as i32);
                }
                Ok(self.expr_to_next_reg(e)? as i32)
            }
            _ => Ok(self.expr_to_next_reg(e)? as i32),
        }
    }

    fn const_rk(&mut self, v: LuaValue) -> LuaResult<i32> {
        let idx = self.fs().index_of_constant(v);
        if idx as u32 <= MAXINDEXRK {
            Ok(rk_const(idx as i32))
        } else {
            let r = self.fs().alloc_reg()?;
            self.fs().emit(Instruction::encode_abx(OpCode::LoadK, r as i32, idx as i32));
            Ok(r as i32)
        }
    }

    fn load_const(&mut self, target: usize, v: LuaValue) -> LuaResult<()> {
        let idx = self.fs().index_of_constant(v);
        self.fs().emit(Instruction::encode_abx(OpCode::LoadK, target as i32, idx as i32));
        Ok(())
    }

    fn expr_to_reg(&mut self, e: &Expr, target: usize) -> LuaResult<()> {
        match e {
            Expr::Nil(_) => {
                self.fs().emit(Instruction::encode_abc(OpCode::LoadNil, target as i32, 0, 0));
            }
            Expr::True(_) => {
                self.fs().emit(Instruction::encode_abc(OpCode::LoadBool, target as i32, 1, 0));
            }
            Expr::False(_) => {
                self.fs().emit(Instruction::encode_abc(OpCode::LoadBool, target as i32, 0, 0));
            }
            Expr::Int(i, _) => self.load_const(target, LuaValue::Int(*i))?,
            Expr::Float(f, _) => self.load_const(target, LuaValue::Float(*f))?,
            Expr::Str(s, _) => self.load_const(target, LuaValue::from_string(s.clone()))?,
            Expr::Vararg(_) => {
                self.fs().emit(Instruction::encode_abc(OpCode::Vararg, target as i32, 2, 0));
            }
            Expr::Name(name, _) => match self.resolve_name(name) {
                NameRef::Local(slot) => {
                    if slot != target {
                        self.fs().emit(Instruction::encode_abc(OpCode::Move, target as i32, slot as i32, 0));
                    }
                }
                NameRef::Upvalue(idx) => {
                    self.fs().emit(Instruction::encode_abc(OpCode::GetUpval, target as i32, idx as i32, 0));
                }
                NameRef::Global(env_idx, gname) => {
                    let mark = self.fs().used_regs();
                    let key_rk = self.const_rk(LuaValue::from_string(gname))?;
                    self.fs().emit(Instruction::encode_abc(
                        OpCode::GetTabUp,
                        target as i32,
                        env_idx as i32,
                        key_rk,
                    ));
                    self.fs().free_to(mark);
                }
            },
            Expr::Paren(inner) => self.expr_to_reg(inner, target)?,
            Expr::Unop { op, operand, .. } => {
                let mark = self.fs().used_regs();
                let r = self.expr_to_any_reg(operand)?;
                let opcode = match op {
                    UnOp::Not => OpCode::Not,
                    UnOp::Len => OpCode::Len,
                    UnOp::Neg => OpCode::Unm,
                    UnOp::BNot => OpCode::BNot,
                };
                self.fs().emit(Instruction::encode_abc(opcode, target as i32, r as i32, 0));
                self.fs().free_to(mark);
            }
            Expr::Binop { op, lhs, rhs, .. } => self.binop_to_reg(*op, lhs, rhs, target)?,
            Expr::Table { keys, vals, .. } => self.table_constructor(keys, vals, target)?,
            Expr::Function(func) => self.expr_function(func, target)?,
            Expr::Index { obj, key, .. } => {
                let mark = self.fs().used_regs();
                let obj_reg = self.expr_to_any_reg(obj)?;
                let key_rk = self.expr_to_rk(key)?;
                self.fs().emit(Instruction::encode_abc(
                    OpCode::GetTable,
                    target as i32,
                    obj_reg as i32,
                    key_rk,
                ));
                self.fs().free_to(mark);
            }
            Expr::Call { .. } => {
                // `target` is already reserved as the topmost register by
                // the caller (expr_to_next_reg); release it so compile_call
                // lays its own call-base out there instead of one past it.
                debug_assert_eq!(target, self.fs().used_regs() - 1);
                self.fs().free_reg();
                self.compile_call(e, CallWant::Exact(1))?;
            }
        }
        Ok(())
    }

    fn binop_to_reg(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr, target: usize) -> LuaResult<()> {
        match op {
            BinOp::And => {
                self.expr_to_reg(lhs, target)?;
                self.fs().emit(Instruction::encode_abc(OpCode::Test, target as i32, 0, 0));
                let j = self.fs().emit(Instruction::encode_asbx(OpCode::Jmp, 0, 0));
                self.expr_to_reg(rhs, target)?;
                self.fs().patch_to_here(j);
            }
            BinOp::Or => {
                self.expr_to_reg(lhs, target)?;
                self.fs().emit(Instruction::encode_abc(OpCode::Test, target as i32, 0, 1));
                let j = self.fs().emit(Instruction::encode_asbx(OpCode::Jmp, 0, 0));
                self.expr_to_reg(rhs, target)?;
                self.fs().patch_to_here(j);
            }
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                self.compile_compare(op, lhs, rhs, target)?;
            }
            BinOp::Concat => self.compile_concat(lhs, rhs, target)?,
            _ => {
                let mark = self.fs().used_regs();
                let b = self.expr_to_rk(lhs)?;
                let c = self.expr_to_rk(rhs)?;
                let opcode = arith_opcode_of(op);
                self.fs().emit(Instruction::encode_abc(opcode, target as i32, b, c));
                self.fs().free_to(mark);
            }
        }
        Ok(())
    }

    /// Relational operators don't produce a register value directly (spec
    /// §4.8 EQ/LT/LE: "if (...) ~= A then pc++") — materializing one takes
    /// the opcode followed by a pair of `LOADBOOL`s, the second reached
    /// only via the opcode's own pc-skip.
    fn compile_compare(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr, target: usize) -> LuaResult<()> {
        let mark = self.fs().used_regs();
        let (opcode, b, c, invert) = match op {
            BinOp::Eq => (OpCode::Eq, self.expr_to_rk(lhs)?, self.expr_to_rk(rhs)?, false),
            BinOp::Ne => (OpCode::Eq, self.expr_to_rk(lhs)?, self.expr_to_rk(rhs)?, true),
            BinOp::Lt => (OpCode::Lt, self.expr_to_rk(lhs)?, self.expr_to_rk(rhs)?, false),
            BinOp::Le => (OpCode::Le, self.expr_to_rk(lhs)?, self.expr_to_rk(rhs)?, false),
            BinOp::Gt => (OpCode::Lt, self.expr_to_rk(rhs)?, self.expr_to_rk(lhs)?, false),
            BinOp::Ge => (OpCode::Le, self.expr_to_rk(rhs)?, self.expr_to_rk(lhs)?, false),
            _ => unreachable!(),
        };
        let (false_val, true_val) = if invert { (1, 0) } else { (0, 1) };
        self.fs().emit(Instruction::encode_abc(opcode, 0, b, c));
        self.fs().emit(Instruction::encode_abc(OpCode::LoadBool, target as i32, false_val, 1));
        self.fs().emit(Instruction::encode_abc(OpCode::LoadBool, target as i32, true_val, 0));
        self.fs().free_to(mark);
        Ok(())
    }

    fn compile_concat(&mut self, lhs: &Expr, rhs: &Expr, target: usize) -> LuaResult<()> {
        let mark = self.fs().used_regs();
        let b = self.expr_to_next_reg(lhs)?;
        let c = self.expr_to_next_reg(rhs)?;
        self.fs().emit(Instruction::encode_abc(OpCode::Concat, target as i32, b as i32, c as i32));
        self.fs().free_to(mark);
        Ok(())
    }

    fn table_constructor(&mut self, keys: &[Option<Expr>], vals: &[Expr], target: usize) -> LuaResult<()> {
        let narr = keys.iter().filter(|k| k.is_none()).count();
        let nrec = keys.len() - narr;
        self.fs().emit(Instruction::encode_abc(
            OpCode::NewTable,
            target as i32,
            int_to_fb(narr as u32) as i32,
            int_to_fb(nrec as u32) as i32,
        ));

        let array_base = self.fs().used_regs();
        let mut array_count = 0usize;
        let last_idx = keys.len().checked_sub(1);

        for (i, (k, v)) in keys.iter().zip(vals.iter()).enumerate() {
            match k {
                Some(key_expr) => {
                    let mark = self.fs().used_regs();
                    let key_rk = self.expr_to_rk(key_expr)?;
                    let val_rk = self.expr_to_rk(v)?;
                    self.fs()
                        .emit(Instruction::encode_abc(OpCode::SetTable, target as i32, key_rk, val_rk));
                    self.fs().free_to(mark);
                }
                None => {
                    if Some(i) == last_idx && v.is_multret() {
                        self.compile_multret_all(v)?;
                        self.fs().emit(Instruction::encode_abc(OpCode::SetList, target as i32, 0, 1));
                        self.fs().free_to(array_base);
                        return Ok(());
                    }
                    self.expr_to_next_reg(v)?;
                    array_count += 1;
                }
            }
        }
        if array_count > 0 {
            self.fs().emit(Instruction::encode_abc(
                OpCode::SetList,
                target as i32,
                array_count as i32,
                1,
            ));
            self.fs().free_regs(array_count);
        }
        Ok(())
    }

    fn compile_function(&mut self, func: &FunctionBody) -> LuaResult<usize> {
        let mut child = FuncState::new(func.params.len() as u8, func.is_vararg, func.line);
        child.last_line_defined = func.last_line;
        self.stack.push(child);
        for p in &func.params {
            self.fs().add_local(p)?;
        }
        self.stats_and_ret(&func.body)?;
        self.fs().check_pending_gotos()?;
        if func.body.ret.is_none() {
            self.fs().emit(Instruction::encode_abc(OpCode::Return, 0, 1, 0));
        }
        let child = self.stack.pop().expect("pushed function FuncState");
        let proto = Rc::new(child.into_prototype(self.source.clone()));
        let idx = self.fs().children.len();
        self.fs().children.push(proto);
        Ok(idx)
    }

    fn expr_function(&mut self, func: &FunctionBody, target: usize) -> LuaResult<()> {
        let idx = self.compile_function(func)?;
        self.fs().emit(Instruction::encode_abx(OpCode::Closure, target as i32, idx as i32));
        Ok(())
    }
}

fn build_target_expr(path: &[String], line: u32) -> Expr {
    let mut e = Expr::Name(path[0].clone(), line);
    for seg in &path[1..] {
        e = Expr::Index {
            obj: Box::new(e),
            key: Box::new(Expr::Str(seg.clone().into_bytes(), line)),
            line,
        };
    }
    e
}

fn arith_opcode_of(op: BinOp) -> OpCode {
    match op {
        BinOp::Add => OpCode::Add,
        BinOp::Sub => OpCode::Sub,
        BinOp::Mul => OpCode::Mul,
        BinOp::Mod => OpCode::Mod,
        BinOp::Pow => OpCode::Pow,
        BinOp::Div => OpCode::Div,
        BinOp::IDiv => OpCode::IDiv,
        BinOp::BAnd => OpCode::BAnd,
        BinOp::BOr => OpCode::BOr,
        BinOp::BXor => OpCode::BXor,
        BinOp::Shl => OpCode::Shl,
        BinOp::Shr => OpCode::Shr,
        _ => unreachable!("non-arithmetic BinOp reached arith_opcode_of"),
    }
}

fn stat_line(s: &Stat) -> u32 {
    match s {
        Stat::Empty => 0,
        Stat::Break(l) => *l,
        Stat::Label { line, .. } => *line,
        Stat::Goto { line, .. } => *line,
        Stat::Do(_) => 0,
        Stat::While { line, .. } => *line,
        Stat::Repeat { line, .. } => *line,
        Stat::If { .. } => 0,
        Stat::ForNum { line, .. } => *line,
        Stat::ForIn { line, .. } => *line,
        Stat::FuncDecl { line, .. } => *line,
        Stat::LocalFunc { line, .. } => *line,
        Stat::LocalDecl { line, .. } => *line,
        Stat::Assign { line, .. } => *line,
        Stat::Call(e) => e.line(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::OpCode;

    fn compile(src: &str) -> Prototype {
        let block = super::super::parser::parse(src, "test").expect("parses");
        generate(&block, "test").expect("compiles")
    }

    fn opcodes(p: &Prototype) -> Vec<OpCode> {
        p.code.iter().map(|i| i.opcode().unwrap()).collect()
    }

    #[test]
    fn local_assignment_compiles_to_a_single_loadk() {
        let p = compile("local x = 1");
        assert!(matches!(opcodes(&p).as_slice(), [OpCode::LoadK, OpCode::Return]));
    }

    #[test]
    fn if_statement_produces_test_and_jmp() {
        let p = compile("if x then y = 1 end");
        assert!(opcodes(&p).contains(&OpCode::Test));
        assert!(opcodes(&p).contains(&OpCode::Jmp));
    }

    #[test]
    fn numeric_for_uses_forprep_and_forloop() {
        let p = compile("for i = 1, 10 do end");
        assert!(opcodes(&p).contains(&OpCode::ForPrep));
        assert!(opcodes(&p).contains(&OpCode::ForLoop));
    }

    #[test]
    fn generic_for_uses_tforcall_and_tforloop() {
        let p = compile("for k, v in pairs(t) do end");
        assert!(opcodes(&p).contains(&OpCode::TForCall));
        assert!(opcodes(&p).contains(&OpCode::TForLoop));
    }

    #[test]
    fn nested_function_becomes_a_child_prototype_closed_over() {
        let p = compile("local function f() return 1 end");
        assert_eq!(p.protos.len(), 1);
        assert!(opcodes(&p).contains(&OpCode::Closure));
    }

    #[test]
    fn comparison_expression_materializes_via_loadbool_pair() {
        let p = compile("local x = (1 < 2)");
        let ops = opcodes(&p);
        assert!(ops.contains(&OpCode::Lt));
        assert_eq!(ops.iter().filter(|o| **o == OpCode::LoadBool).count(), 2);
    }

    #[test]
    fn global_assignment_uses_settabup() {
        let p = compile("x = 1");
        assert!(opcodes(&p).contains(&OpCode::SetTabUp));
    }

    #[test]
    fn closure_over_global_resolves_env_through_nesting() {
        let p = compile("local function f() return g end");
        let child = &p.protos[0];
        assert!(child.code.iter().any(|i| i.opcode() == Some(OpCode::GetTabUp)));
    }
}
