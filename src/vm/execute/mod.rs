//! Opcode execution helpers shared between the dispatcher and the stack API
//! (spec §4.8, §4.6): the pieces that need more than a couple of lines get
//! their own file here, mirroring the teacher's `lua_vm/execute/` split,
//! just with far fewer files since Lua 5.3's opcode set is a third the size
//! of the teacher's Lua 5.4/5.5 one. Arithmetic/comparison/length already
//! live in `vm::arith` since the stack API needs them independently of any
//! instruction; concatenation is the one multi-operand fold worth factoring
//! out on its own.

pub mod concat;
