mod common;

use common::*;
use moonglow::errors::LuaError;
use moonglow::interpreter::{
    Instruction, LuaState, OpCode, TableRef, Value, Varargs,
};
use pretty_assertions::assert_eq;

use Instruction as I;
use OpCode as Op;

#[test]
fn variable_arity_returns_are_preserved() -> Result<(), LuaError> {
    // return (function() return 1, 2, 3 end)()
    let inner = ProtoBuilder::function(0)
        .constants(vec![num(1.0), num(2.0), num(3.0)])
        .code(vec![
            I::abx(Op::LoadK, 0, 0),
            I::abx(Op::LoadK, 1, 1),
            I::abx(Op::LoadK, 2, 2),
            I::abc(Op::Return, 0, 4, 0),
        ])
        .build();

    let main = ProtoBuilder::main()
        .child(inner)
        .code(vec![
            I::abx(Op::Closure, 0, 0),
            I::abc(Op::Call, 0, 1, 0),
            I::abc(Op::Return, 0, 0, 0),
        ])
        .build();

    let mut state = LuaState::new();
    let ctx = &mut state.context();

    let function = load(ctx, main);
    let results: Varargs = function.call((), ctx)?;

    assert_eq!(
        results.to_vec(),
        vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)]
    );

    Ok(())
}

#[test]
fn numeric_for_fills_the_list_part() -> Result<(), LuaError> {
    // local t = {}; for i = 1, 1e6 do t[i] = i end; return #t
    const N: f64 = 1000000.0;

    let main = ProtoBuilder::main()
        .constants(vec![num(1.0), num(N)])
        .code(vec![
            I::abc(Op::NewTable, 0, 0, 0),
            I::abx(Op::LoadK, 1, 0),
            I::abx(Op::LoadK, 2, 1),
            I::abx(Op::LoadK, 3, 0),
            I::asbx(Op::ForPrep, 1, 1),
            I::abc(Op::SetTable, 0, 4, 4),
            I::asbx(Op::ForLoop, 1, -2),
            I::abc(Op::Len, 1, 0, 0),
            I::abc(Op::Return, 1, 2, 0),
        ])
        .build();

    let mut state = LuaState::new();
    let ctx = &mut state.context();

    let function = load(ctx, main);
    let length: f64 = function.call((), ctx)?;

    assert_eq!(length, N);
    Ok(())
}

#[test]
fn arithmetic_follows_lua_rules() -> Result<(), LuaError> {
    // return a % b, a / 0, a ^ b
    let main = ProtoBuilder::function(2)
        .constants(vec![num(0.0)])
        .code(vec![
            I::abc(Op::Mod, 2, 0, 1),
            I::abc(Op::Div, 3, 0, k(0)),
            I::abc(Op::Pow, 4, 0, 1),
            I::abc(Op::Return, 2, 4, 0),
        ])
        .build();

    let mut state = LuaState::new();
    let ctx = &mut state.context();
    let function = load(ctx, main);

    // Lua modulo keeps the divisor's sign, unlike C
    let (m, d, p): (f64, f64, f64) = function.call((-5.0f64, 3.0f64), ctx)?;
    assert_eq!(m, 1.0);
    assert_eq!(d, f64::NEG_INFINITY);
    assert_eq!(p, (-5.0f64).powf(3.0));

    Ok(())
}

#[test]
fn string_coercion_applies_in_arithmetic() -> Result<(), LuaError> {
    let main = ProtoBuilder::main()
        .constants(vec![text("10"), num(1.0)])
        .code(vec![
            I::abc(Op::Add, 0, k(0), k(1)),
            I::abc(Op::Return, 0, 2, 0),
        ])
        .build();

    let mut state = LuaState::new();
    let ctx = &mut state.context();
    let function = load(ctx, main);

    let result: f64 = function.call((), ctx)?;
    assert_eq!(result, 11.0);
    Ok(())
}

#[test]
fn upvalues_are_shared_and_written_through() -> Result<(), LuaError> {
    // local x = 0
    // local f = function() x = x + 1; return x end
    // return f(), f()
    let counter = ProtoBuilder::function(0)
        .up_values(vec![local_upvalue(0)])
        .constants(vec![num(1.0)])
        .code(vec![
            I::abc(Op::GetUpval, 0, 0, 0),
            I::abc(Op::Add, 0, 0, k(0)),
            I::abc(Op::SetUpval, 0, 0, 0),
            I::abc(Op::Return, 0, 2, 0),
        ])
        .build();

    let main = ProtoBuilder::main()
        .constants(vec![num(0.0)])
        .child(counter)
        .code(vec![
            I::abx(Op::LoadK, 0, 0),
            I::abx(Op::Closure, 1, 0),
            I::abc(Op::Move, 2, 1, 0),
            I::abc(Op::Call, 2, 1, 2),
            I::abc(Op::Move, 3, 1, 0),
            I::abc(Op::Call, 3, 1, 2),
            I::abc(Op::Return, 2, 3, 0),
        ])
        .build();

    let mut state = LuaState::new();
    let ctx = &mut state.context();
    let function = load(ctx, main);

    let (first, second): (f64, f64) = function.call((), ctx)?;
    assert_eq!((first, second), (1.0, 2.0));
    Ok(())
}

#[test]
fn close_gives_each_iteration_a_fresh_capture() -> Result<(), LuaError> {
    // local fs = {}
    // for i = 1, 3 do fs[i] = function() return i end end
    // return fs
    let capture = ProtoBuilder::function(0)
        .up_values(vec![local_upvalue(4)])
        .code(vec![
            I::abc(Op::GetUpval, 0, 0, 0),
            I::abc(Op::Return, 0, 2, 0),
        ])
        .build();

    let main = ProtoBuilder::main()
        .constants(vec![num(1.0), num(3.0)])
        .child(capture)
        .code(vec![
            I::abc(Op::NewTable, 0, 0, 0),
            I::abx(Op::LoadK, 1, 0),
            I::abx(Op::LoadK, 2, 1),
            I::abx(Op::LoadK, 3, 0),
            I::asbx(Op::ForPrep, 1, 3),
            I::abx(Op::Closure, 5, 0),
            I::abc(Op::SetTable, 0, 4, 5),
            I::abc(Op::Close, 4, 0, 0),
            I::asbx(Op::ForLoop, 1, -4),
            I::abc(Op::Return, 0, 2, 0),
        ])
        .build();

    let mut state = LuaState::new();
    let ctx = &mut state.context();
    let function = load(ctx, main);

    let table: TableRef = function.call((), ctx)?;

    for i in 1..=3 {
        let capture: Value = table.raw_get(i as f64, ctx)?;
        let Value::Function(capture) = capture else {
            panic!("expected a function at {i}");
        };

        let value: f64 = capture.call((), ctx)?;
        assert_eq!(value, i as f64);
    }

    Ok(())
}

#[test]
fn tail_recursion_runs_in_constant_stack() -> Result<(), LuaError> {
    // local function f(n) if n <= 0 then return 42 end return f(n - 1) end
    // return f(100000)
    let f = ProtoBuilder::function(1)
        .up_values(vec![local_upvalue(0)])
        .constants(vec![num(0.0), num(42.0), num(1.0)])
        .code(vec![
            I::abc(Op::Le, 0, 0, k(0)),
            I::asbx(Op::Jmp, 0, 2),
            I::abx(Op::LoadK, 1, 1),
            I::abc(Op::Return, 1, 2, 0),
            I::abc(Op::GetUpval, 1, 0, 0),
            I::abc(Op::Sub, 2, 0, k(2)),
            I::abc(Op::TailCall, 1, 2, 0),
            I::abc(Op::Return, 1, 0, 0),
        ])
        .build();

    let main = ProtoBuilder::main()
        .constants(vec![num(100000.0)])
        .child(f)
        .code(vec![
            I::abx(Op::Closure, 0, 0),
            I::abc(Op::Move, 1, 0, 0),
            I::abx(Op::LoadK, 2, 0),
            I::abc(Op::Call, 1, 2, 2),
            I::abc(Op::Return, 1, 2, 0),
        ])
        .build();

    let mut state = LuaState::new();
    let ctx = &mut state.context();
    let function = load(ctx, main);

    let result: f64 = function.call((), ctx)?;
    assert_eq!(result, 42.0);
    Ok(())
}

#[test]
fn varargs_flow_through_frames() -> Result<(), LuaError> {
    // local function f(...) return ... end
    // return f(1, 2, 3)
    let f = ProtoBuilder::function(0)
        .vararg()
        .code(vec![
            I::abc(Op::Vararg, 0, 0, 0),
            I::abc(Op::Return, 0, 0, 0),
        ])
        .build();

    let main = ProtoBuilder::main()
        .constants(vec![num(1.0), num(2.0), num(3.0)])
        .child(f)
        .code(vec![
            I::abx(Op::Closure, 0, 0),
            I::abx(Op::LoadK, 1, 0),
            I::abx(Op::LoadK, 2, 1),
            I::abx(Op::LoadK, 3, 2),
            I::abc(Op::Call, 0, 4, 0),
            I::abc(Op::Return, 0, 0, 0),
        ])
        .build();

    let mut state = LuaState::new();
    let ctx = &mut state.context();
    let function = load(ctx, main);

    let results: Varargs = function.call((), ctx)?;
    assert_eq!(results.count(), 3);
    assert_eq!(results.arg(2), Value::Number(2.0));
    Ok(())
}

#[test]
fn generic_for_drives_an_iterator() -> Result<(), LuaError> {
    // local s = 0; for _, v in next, t do s = s + v end; return s
    let body = ProtoBuilder::function(2)
        .max_stack(10)
        .constants(vec![num(0.0)])
        .code(vec![
            I::abx(Op::LoadK, 2, 0),
            I::abc(Op::Move, 3, 0, 0),
            I::abc(Op::Move, 4, 1, 0),
            I::abc(Op::LoadNil, 5, 0, 0),
            I::asbx(Op::Jmp, 0, 1),
            I::abc(Op::Add, 2, 2, 7),
            I::abc(Op::TForCall, 3, 0, 2),
            I::asbx(Op::TForLoop, 5, -3),
            I::abc(Op::Return, 2, 2, 0),
        ])
        .build();

    let mut state = LuaState::new();
    let ctx = &mut state.context();
    moonglow::stdlib::impl_base(ctx)?;

    let table = ctx.create_table()?;
    for (i, v) in [10.0, 20.0, 30.0].iter().enumerate() {
        table.raw_set((i + 1) as f64, *v, ctx)?;
    }

    let next: moonglow::interpreter::FunctionRef = ctx.globals().raw_get("next", ctx)?;

    let function = load(ctx, body);
    let sum: f64 = function.call((next, table), ctx)?;
    assert_eq!(sum, 60.0);

    Ok(())
}

#[test]
fn concat_handles_string_runs() -> Result<(), LuaError> {
    // return "a" .. 1 .. "b"
    let main = ProtoBuilder::main()
        .constants(vec![text("a"), num(1.0), text("b")])
        .code(vec![
            I::abx(Op::LoadK, 0, 0),
            I::abx(Op::LoadK, 1, 1),
            I::abx(Op::LoadK, 2, 2),
            I::abc(Op::Concat, 0, 0, 2),
            I::abc(Op::Return, 0, 2, 0),
        ])
        .build();

    let mut state = LuaState::new();
    let ctx = &mut state.context();
    let function = load(ctx, main);

    let result: String = function.call((), ctx)?;
    assert_eq!(result, "a1b");
    Ok(())
}

#[test]
fn index_metamethod_function_computes_fields() -> Result<(), LuaError> {
    // local t = setmetatable({}, { __index = function(_, key) return key .. "!" end })
    // return t.hi
    let mut state = LuaState::new();
    let ctx = &mut state.context();

    let table = ctx.create_table()?;
    let metatable = ctx.create_table()?;

    let index = ctx.create_function(|args, ctx| {
        let (_, key): (Value, String) = args.unpack_args(ctx)?;
        Varargs::pack(format!("{key}!"), ctx)
    })?;

    metatable.raw_set("__index", index, ctx)?;
    table.set_metatable(Some(&metatable), ctx)?;

    let value: String = table.get("hi", ctx)?;
    assert_eq!(value, "hi!");

    // the same lookup through bytecode
    let main = ProtoBuilder::main()
        .constants(vec![text("t"), text("hi")])
        .code(vec![
            I::abc(Op::GetTabUp, 0, 0, k(0)),
            I::abc(Op::GetTable, 1, 0, k(1)),
            I::abc(Op::Return, 1, 2, 0),
        ])
        .build();

    ctx.globals().raw_set("t", table, ctx)?;

    let function = load(ctx, main);
    let value: String = function.call((), ctx)?;
    assert_eq!(value, "hi!");

    Ok(())
}

#[test]
fn eq_metamethod_applies_to_same_type_operands() -> Result<(), LuaError> {
    // return a == b
    let eq = ProtoBuilder::function(2)
        .code(vec![
            I::abc(Op::Eq, 1, 0, 1),
            I::asbx(Op::Jmp, 0, 1),
            I::abc(Op::LoadBool, 2, 0, 1),
            I::abc(Op::LoadBool, 2, 1, 0),
            I::abc(Op::Return, 2, 2, 0),
        ])
        .build();

    let mut state = LuaState::new();
    let ctx = &mut state.context();
    let function = load(ctx, eq);

    let metatable = ctx.create_table()?;
    let always_equal = ctx.create_function(|_, ctx| Varargs::pack(true, ctx))?;
    metatable.raw_set("__eq", always_equal, ctx)?;

    let a = ctx.create_table()?;
    let b = ctx.create_table()?;
    a.set_metatable(Some(&metatable), ctx)?;

    // raw equality short-circuits the metamethod
    let same: bool = function.call((a.clone(), a.clone()), ctx)?;
    assert!(same);

    // one metatable on either side is enough
    let via_metamethod: bool = function.call((a.clone(), b.clone()), ctx)?;
    assert!(via_metamethod);

    // mixed types never consult __eq
    let mixed: bool = function.call((a, 1.0f64), ctx)?;
    assert!(!mixed);

    Ok(())
}

#[test]
fn self_dispatches_through_the_string_metatable() -> Result<(), LuaError> {
    // return s:double()
    let main = ProtoBuilder::function(1)
        .constants(vec![text("double")])
        .code(vec![
            I::abc(Op::SelfOp, 1, 0, k(0)),
            I::abc(Op::Call, 1, 2, 2),
            I::abc(Op::Return, 1, 2, 0),
        ])
        .build();

    let mut state = LuaState::new();
    let ctx = &mut state.context();

    let methods = ctx.create_table()?;
    let double = ctx.create_function(|args, ctx| {
        let s: String = args.unpack_args(ctx)?;
        Varargs::pack(format!("{s}{s}"), ctx)
    })?;
    methods.raw_set("double", double, ctx)?;
    ctx.string_metatable().raw_set("__index", methods, ctx)?;

    let function = load(ctx, main);
    let result: String = function.call("ab", ctx)?;
    assert_eq!(result, "abab");

    Ok(())
}
