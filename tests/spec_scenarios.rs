//! Integration tests for the concrete scenarios this crate is expected to
//! get right end to end: compiler, VM, and embedding API working together.

use lua53::vm::arith::{ArithOp, CompareOp};
use lua53::LuaState;

fn fresh() -> LuaState {
    let mut state = LuaState::new();
    lua53::stdlib::install(&mut state);
    state
}

fn run_return(state: &mut LuaState, source: &str, n_results: i32) {
    state.load_source(source, "test").expect("compiles");
    state.call(0, n_results).expect("runs");
}

#[test]
fn arithmetic_mixing_on_the_raw_stack() {
    let mut state = fresh();
    state.push_integer(1);
    state.push_string("2.0");
    state.push_string("3.0");
    state.push_number(4.0);

    state.arith(ArithOp::Add).unwrap(); // top two: "3.0" + 4.0 -> 7.0
    state.arith(ArithOp::BNot).unwrap(); // ~7 -> -8
    state.push_value(2);
    state.len().unwrap(); // #"2.0" -> 3
    state.concat(3).unwrap(); // "2.0" .. "-8" .. "3"

    assert_eq!(state.get_top(), 2);
    assert_eq!(state.to_integer(1), 1);
    assert_eq!(state.to_lua_string(2).unwrap(), b"2.0-83");
    assert!(!state.compare(1, 2, CompareOp::Eq).unwrap());
}

#[test]
fn for_loop_capture_produces_distinct_upvalues_per_iteration() {
    let mut state = fresh();
    run_return(
        &mut state,
        "local t = {} for i = 1, 3 do t[i] = function() return i end end return t[1](), t[2](), t[3]()",
        -1,
    );
    assert_eq!(state.get_top(), 3);
    assert_eq!(state.to_integer(1), 1);
    assert_eq!(state.to_integer(2), 2);
    assert_eq!(state.to_integer(3), 3);
}

#[test]
fn metatable_index_chain_through_a_function_handler() {
    let mut state = fresh();
    run_return(
        &mut state,
        "local a = setmetatable({}, {__index = function(_, k) return k .. '!' end}) return a.hello",
        1,
    );
    assert_eq!(state.to_lua_string(-1).unwrap(), b"hello!");
}

#[test]
fn pcall_recovers_from_a_raised_error() {
    let mut state = fresh();
    run_return(
        &mut state,
        "local ok, err = pcall(function() error('boom') end) return ok, err",
        2,
    );
    assert!(!state.to_boolean(1));
    assert_eq!(state.to_lua_string(2).unwrap(), b"boom");
}

#[test]
fn string_number_arithmetic_coercions() {
    let mut state = fresh();
    run_return(&mut state, "return '10' + 0.5", 1);
    assert_eq!(state.to_number(-1), 10.5);

    let mut state = fresh();
    run_return(&mut state, "return '10' // 3", 1);
    assert_eq!(state.to_integer(-1), 3);
    assert!(state.is_integer(-1));

    let mut state = fresh();
    run_return(&mut state, "return '0x10' & 0xF", 1);
    assert_eq!(state.to_integer(-1), 0);
}

#[test]
fn generic_for_over_pairs_visits_every_entry_once() {
    let mut state = fresh();
    run_return(
        &mut state,
        "local seen = 0 for k, v in pairs({a = 1, b = 2, c = 3}) do seen = seen + v end return seen",
        1,
    );
    assert_eq!(state.to_integer(-1), 6);
}

#[test]
fn upvalue_shared_between_closures_until_scope_closes() {
    let mut state = fresh();
    run_return(
        &mut state,
        "local function pair() \
            local x = 1 \
            local function get() return x end \
            local function set(v) x = v end \
            return get, set \
         end \
         local get, set = pair() \
         set(42) \
         return get()",
        1,
    );
    assert_eq!(state.to_integer(-1), 42);
}

#[test]
fn table_put_get_roundtrip_and_len() {
    let mut state = fresh();
    run_return(
        &mut state,
        "local t = {} t[1] = 'a' t[2] = 'b' t[3] = 'c' t[3] = nil return t[1], #t",
        2,
    );
    assert_eq!(state.to_lua_string(1).unwrap(), b"a");
    assert_eq!(state.to_integer(2), 2);
}
