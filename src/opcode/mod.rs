//! The Lua 5.3 opcode set (spec §4.8) and its format/argument-mode metadata.
//!
//! Grounded on the teacher's `lua_vm/opcode/mod.rs` (enum-with-metadata-
//! table shape), trimmed from the 83-opcode Lua 5.4/5.5 set down to the 47
//! opcodes Lua 5.3 actually has — no `AddI`/`AddK`/`MmBin*` immediate forms,
//! a single iABC `LOADBOOL`, and `FORLOOP`/`FORPREP` without the
//! integer/float split the later VM introduced.

mod instruction;
pub use instruction::*;

/// Instruction format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMode {
    IABC,
    IABx,
    IAsBx,
    IAx,
}

/// How the B (or C) argument of an iABC instruction is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpArgMode {
    /// Argument is not used.
    N,
    /// Argument is a register or a jump offset (small use cases).
    U,
    /// Argument is a register.
    R,
    /// Argument is a constant or a register (RK, high bit flags constant).
    K,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Move = 0,
    LoadK,
    LoadKX,
    LoadBool,
    LoadNil,
    GetUpval,
    GetTabUp,
    GetTable,
    SetTabUp,
    SetUpval,
    SetTable,
    NewTable,
    Self_,
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
    Not,
    Len,
    Concat,
    Jmp,
    Eq,
    Lt,
    Le,
    Test,
    TestSet,
    Call,
    TailCall,
    Return,
    ForLoop,
    ForPrep,
    TForCall,
    TForLoop,
    SetList,
    Closure,
    Vararg,
    ExtraArg,
}

pub const NUM_OPCODES: usize = 47;

impl OpCode {
    pub fn from_u8(v: u8) -> Option<OpCode> {
        if (v as usize) < NUM_OPCODES {
            // SAFETY: OpCode is repr(u8) and densely packed 0..NUM_OPCODES.
            Some(unsafe { std::mem::transmute::<u8, OpCode>(v) })
        } else {
            None
        }
    }

    pub fn mode(self) -> OpMode {
        use OpCode::*;
        match self {
            LoadK | Closure => OpMode::IABx,
            LoadKX | ExtraArg => OpMode::IAx,
            Jmp | ForLoop | ForPrep | TForLoop => OpMode::IAsBx,
            _ => OpMode::IABC,
        }
    }

    /// Argument mode of the B field (meaningless for IAx/non-IABC modes that
    /// don't have one, but harmless to query).
    pub fn b_mode(self) -> OpArgMode {
        use OpCode::*;
        match self {
            Move | LoadBool | LoadNil | GetUpval | SetUpval | Not | Len | TestSet | Test
            | Call | TailCall | Return | Vararg | TForCall => OpArgMode::U,
            GetTabUp | GetTable | SetTable | Self_ | Add | Sub | Mul | Mod | Pow | Div | IDiv
            | BAnd | BOr | BXor | Shl | Shr | Eq | Lt | Le | Concat | SetTabUp => OpArgMode::K,
            NewTable | SetList | Unm | BNot | Jmp => OpArgMode::R,
            _ => OpArgMode::N,
        }
    }

    pub fn c_mode(self) -> OpArgMode {
        use OpCode::*;
        match self {
            GetTabUp | GetTable | SetTabUp | SetTable | Self_ | Add | Sub | Mul | Mod | Pow
            | Div | IDiv | BAnd | BOr | BXor | Shl | Shr | Eq | Lt | Le | Concat => OpArgMode::K,
            Call | TailCall | Return | SetList | TForCall => OpArgMode::U,
            _ => OpArgMode::N,
        }
    }

    /// Whether this opcode's A field, when positive, triggers upvalue
    /// closing on JMP (spec §4.5/§4.8 JMP semantics) — only JMP itself.
    pub fn closes_upvalues(self) -> bool {
        matches!(self, OpCode::Jmp)
    }

    pub fn name(self) -> &'static str {
        use OpCode::*;
        match self {
            Move => "MOVE",
            LoadK => "LOADK",
            LoadKX => "LOADKX",
            LoadBool => "LOADBOOL",
            LoadNil => "LOADNIL",
            GetUpval => "GETUPVAL",
            GetTabUp => "GETTABUP",
            GetTable => "GETTABLE",
            SetTabUp => "SETTABUP",
            SetUpval => "SETUPVAL",
            SetTable => "SETTABLE",
            NewTable => "NEWTABLE",
            Self_ => "SELF",
            Add => "ADD",
            Sub => "SUB",
            Mul => "MUL",
            Mod => "MOD",
            Pow => "POW",
            Div => "DIV",
            IDiv => "IDIV",
            BAnd => "BAND",
            BOr => "BOR",
            BXor => "BXOR",
            Shl => "SHL",
            Shr => "SHR",
            Unm => "UNM",
            BNot => "BNOT",
            Not => "NOT",
            Len => "LEN",
            Concat => "CONCAT",
            Jmp => "JMP",
            Eq => "EQ",
            Lt => "LT",
            Le => "LE",
            Test => "TEST",
            TestSet => "TESTSET",
            Call => "CALL",
            TailCall => "TAILCALL",
            Return => "RETURN",
            ForLoop => "FORLOOP",
            ForPrep => "FORPREP",
            TForCall => "TFORCALL",
            TForLoop => "TFORLOOP",
            SetList => "SETLIST",
            Closure => "CLOSURE",
            Vararg => "VARARG",
            ExtraArg => "EXTRAARG",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_opcode_round_trips_through_from_u8() {
        for v in 0..NUM_OPCODES as u8 {
            let op = OpCode::from_u8(v).expect("valid opcode");
            assert_eq!(op as u8, v);
        }
        assert!(OpCode::from_u8(NUM_OPCODES as u8).is_none());
    }

    #[test]
    fn jmp_is_the_only_upvalue_closing_opcode() {
        assert!(OpCode::Jmp.closes_upvalues());
        assert!(!OpCode::Call.closes_upvalues());
    }
}
