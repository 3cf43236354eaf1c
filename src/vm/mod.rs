//! The register-based bytecode VM (spec §3 State/Stack frame, §4.5–§4.9).
//!
//! Grounded on the teacher's `lua_vm/` split into `lua_state.rs` (embedding
//! API), `lua_call_frame.rs` (per-call frame), `dispatcher/` + `execute/`
//! (fetch-decode-execute), scaled down from the teacher's Lua 5.4/5.5
//! superset to the Lua 5.3 opcode set and frame model this spec describes.

pub mod arith;
pub mod dispatch;
pub mod execute;
pub mod frame;
pub mod state;

pub use state::LuaState;

/// Pseudo-index naming the registry table (spec §4.5: "an address below
/// every real stack index"). The exact magnitude only needs to sit well
/// clear of any real frame size; unlike real Lua this crate doesn't need it
/// to double as `LUAI_MAXSTACK`, so a single generous constant is enough.
pub const REGISTRYINDEX: i32 = -1_001_000;
