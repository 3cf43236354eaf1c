//! Host-registered basic library (spec §6, "a handful of host-registered
//! primitives... shown as examples"): `print`, `pairs`, `ipairs`, `next`,
//! `getmetatable`, `setmetatable`, `error`, `pcall`.
//!
//! Grounded on the teacher's `stdlib/basic/mod.rs` registration shape, cut
//! down to exactly the eight names the spec scopes us to — the rest of the
//! teacher's basic library (`load`, `collectgarbage`, `xpcall`, `warn`, ...)
//! is out of scope (spec's stdlib Non-goal).

mod base;

use crate::vm::LuaState;

/// Registers the eight primitives into the globals table. Not called
/// automatically by [`LuaState::new`] — mirrors the teacher's own split
/// between opening a bare state and opening its libraries.
pub fn install(state: &mut LuaState) {
    base::install(state);
}
