//! A self-contained Lua 5.3 implementation: binary chunk reader,
//! register-based bytecode VM, and source-to-bytecode compiler, embeddable
//! through a stack-based host API (spec §6).
//!
//! Grounded on the teacher's crate root (`luars/src/lib.rs`): a thin module
//! tree with the embedding surface (`LuaState`) as the one type re-exported
//! at the crate root, everything else reached through its owning module.

pub mod compiler;
pub mod error;
pub mod number;
pub mod opcode;
pub mod reader;
pub mod stdlib;
pub mod value;
pub mod vm;

pub use error::{ErrorKind, LuaError, LuaResult};
pub use vm::LuaState;
