mod common;

use common::*;
use moonglow::errors::LuaError;
use moonglow::interpreter::{
    FunctionRef, HookMask, Instruction, LuaState, OpCode, TableRef, Value, Varargs,
};
use moonglow::stdlib::{impl_base, impl_coroutine, impl_debug};
use pretty_assertions::assert_eq;
use std::cell::RefCell;
use std::rc::Rc;

use Instruction as I;
use OpCode as Op;

#[test]
fn select_counts_and_slices() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    let ctx = &mut state.context();
    impl_base(ctx)?;

    let globals = ctx.globals();
    let select: FunctionRef = globals.raw_get("select", ctx)?;

    let count: f64 = select.call(("#", 10.0f64, 20.0f64, 30.0f64), ctx)?;
    assert_eq!(count, 3.0);

    let tail: Varargs = select.call((2.0f64, 10.0f64, 20.0f64, 30.0f64), ctx)?;
    assert_eq!(
        tail.to_vec(),
        vec![Value::Number(20.0), Value::Number(30.0)]
    );

    // negative indices count from the end
    let last: f64 = select.call((-1.0f64, 10.0f64, 20.0f64, 30.0f64), ctx)?;
    assert_eq!(last, 30.0);

    Ok(())
}

#[test]
fn assert_passes_values_through_or_raises() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    let ctx = &mut state.context();
    impl_base(ctx)?;

    let globals = ctx.globals();
    let assert_fn: FunctionRef = globals.raw_get("assert", ctx)?;

    let (value, extra): (f64, String) = assert_fn.call((5.0f64, "note"), ctx)?;
    assert_eq!(value, 5.0);
    assert_eq!(extra, "note");

    let err = assert_fn.call::<_, Varargs>(false, ctx).unwrap_err();
    assert!(err.to_string().contains("assertion failed!"));

    let err = assert_fn
        .call::<_, Varargs>((Value::Nil, "custom reason"), ctx)
        .unwrap_err();
    assert!(err.to_string().contains("custom reason"));

    Ok(())
}

#[test]
fn ipairs_respects_a_late_index_metamethod() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    let ctx = &mut state.context();
    impl_base(ctx)?;

    let globals = ctx.globals();
    let ipairs: FunctionRef = globals.raw_get("ipairs", ctx)?;

    let table = ctx.create_table()?;
    table.raw_set(1.0f64, "a", ctx)?;

    let (iterator, _, start): (FunctionRef, TableRef, f64) = ipairs.call(table.clone(), ctx)?;

    // raw contents first
    let (i, v): (f64, String) = iterator.call((table.clone(), start), ctx)?;
    assert_eq!((i, v.as_str()), (1.0, "a"));

    let done: Value = iterator
        .call::<_, Varargs>((table.clone(), 1.0f64), ctx)?
        .first();
    assert!(done.is_nil());

    // a metatable added later reroutes the iterator through __index
    let backing = ctx.create_table()?;
    backing.raw_set(2.0f64, "b", ctx)?;

    let metatable = ctx.create_table()?;
    metatable.raw_set("__index", backing, ctx)?;
    table.set_metatable(Some(&metatable), ctx)?;

    let (i, v): (f64, String) = iterator.call((table, 1.0f64), ctx)?;
    assert_eq!((i, v.as_str()), (2.0, "b"));

    Ok(())
}

#[test]
fn count_hooks_fire_and_may_observe_state() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    let ctx = &mut state.context();
    impl_base(ctx)?;
    impl_debug(ctx)?;

    let fired = Rc::new(RefCell::new(0u32));
    let counter = fired.clone();

    let hook = ctx.create_function(move |args, ctx| {
        let event: String = args.unpack_args(ctx)?;
        assert_eq!(event, "count");
        *counter.borrow_mut() += 1;
        Ok(Varargs::default())
    })?;

    ctx.set_hook(Some(hook), HookMask::COUNT, 5)?;

    // a loop long enough to trip the counter several times
    let main = ProtoBuilder::main()
        .constants(vec![num(1.0), num(200.0)])
        .code(vec![
            I::abx(Op::LoadK, 1, 0),
            I::abx(Op::LoadK, 2, 1),
            I::abx(Op::LoadK, 3, 0),
            I::asbx(Op::ForPrep, 1, 0),
            I::asbx(Op::ForLoop, 1, -1),
            I::abc(Op::Return, 0, 1, 0),
        ])
        .build();

    let function = load(ctx, main);
    function.call::<_, ()>((), ctx)?;

    ctx.set_hook(None, HookMask::empty(), 0)?;

    assert!(*fired.borrow() >= 10, "hook fired {} times", fired.borrow());
    Ok(())
}

#[test]
fn call_and_return_hooks_see_events() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    let ctx = &mut state.context();
    impl_base(ctx)?;
    impl_debug(ctx)?;

    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();

    let hook = ctx.create_function(move |args, ctx| {
        let event: String = args.unpack_args(ctx)?;
        sink.borrow_mut().push(event);
        Ok(Varargs::default())
    })?;

    ctx.set_hook(Some(hook), HookMask::CALL | HookMask::RET, 0)?;

    let inner = ProtoBuilder::function(0)
        .constants(vec![num(7.0)])
        .code(vec![
            I::abx(Op::LoadK, 0, 0),
            I::abc(Op::Return, 0, 2, 0),
        ])
        .build();

    let main = ProtoBuilder::main()
        .child(inner)
        .code(vec![
            I::abx(Op::Closure, 0, 0),
            I::abc(Op::Call, 0, 1, 2),
            I::abc(Op::Return, 0, 2, 0),
        ])
        .build();

    let function = load(ctx, main);
    let result: f64 = function.call((), ctx)?;
    assert_eq!(result, 7.0);

    ctx.set_hook(None, HookMask::empty(), 0)?;

    let events = events.borrow();
    assert!(events.iter().any(|event| event == "call"));
    assert!(events.iter().any(|event| event == "return"));

    Ok(())
}

#[test]
fn line_hooks_follow_line_transitions() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    let ctx = &mut state.context();
    impl_base(ctx)?;
    impl_debug(ctx)?;

    let lines = Rc::new(RefCell::new(Vec::new()));
    let sink = lines.clone();

    let hook = ctx.create_function(move |args, ctx| {
        let (event, line): (String, f64) = args.unpack_args(ctx)?;
        assert_eq!(event, "line");
        sink.borrow_mut().push(line);
        Ok(Varargs::default())
    })?;

    ctx.set_hook(Some(hook), HookMask::LINE, 0)?;

    // three instructions across two source lines
    let mut main = ProtoBuilder::main()
        .constants(vec![num(1.0)])
        .code(vec![
            I::abx(Op::LoadK, 0, 0),
            I::abx(Op::LoadK, 1, 0),
            I::abc(Op::Return, 0, 1, 0),
        ])
        .build();
    main.line_info = vec![1, 2, 2];

    let function = load(ctx, main);
    function.call::<_, ()>((), ctx)?;

    ctx.set_hook(None, HookMask::empty(), 0)?;

    assert_eq!(&*lines.borrow(), &[1.0, 2.0]);
    Ok(())
}

#[test]
fn debug_surface_reads_locals_and_upvalues() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    let ctx = &mut state.context();
    impl_base(ctx)?;
    impl_debug(ctx)?;

    // a closure over one named upvalue
    let closure_proto = ProtoBuilder::function(0)
        .up_values(vec![moonglow::interpreter::UpValueDesc {
            name: Some("captured".into()),
            from_local: true,
            index: 0,
        }])
        .code(vec![
            I::abc(Op::GetUpval, 0, 0, 0),
            I::abc(Op::Return, 0, 2, 0),
        ])
        .build();

    let main = ProtoBuilder::main()
        .constants(vec![num(11.0)])
        .child(closure_proto)
        .code(vec![
            I::abx(Op::LoadK, 0, 0),
            I::abx(Op::Closure, 1, 0),
            I::abc(Op::Return, 1, 2, 0),
        ])
        .build();

    let main = load(ctx, main);
    let closure: FunctionRef = main.call((), ctx)?;

    let (name, value) = ctx.up_value(&closure, 1)?.expect("one upvalue");
    assert_eq!(name.as_ref().map(|name| name.as_bytes()), Some(&b"captured"[..]));
    assert_eq!(value, Value::Number(11.0));

    ctx.set_up_value(&closure, 1, Value::Number(99.0))?;
    let read_back: f64 = closure.call((), ctx)?;
    assert_eq!(read_back, 99.0);

    assert!(ctx.up_value(&closure, 2)?.is_none());

    Ok(())
}

#[test]
fn traceback_renders_live_frames() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    let ctx = &mut state.context();
    impl_base(ctx)?;
    impl_debug(ctx)?;

    let captured = Rc::new(RefCell::new(String::new()));
    let sink = captured.clone();

    let capture = ctx.create_function(move |_, ctx| {
        *sink.borrow_mut() = ctx.traceback(Some("probe"), 0);
        Ok(Varargs::default())
    })?;
    ctx.globals().raw_set("capture", capture, ctx)?;

    let main = ProtoBuilder::main()
        .constants(vec![text("capture")])
        .code(vec![
            I::abc(Op::GetTabUp, 0, 0, k(0)),
            I::abc(Op::Call, 0, 1, 1),
            I::abc(Op::Return, 0, 1, 0),
        ])
        .build();

    let function = load(ctx, main);
    function.call::<_, ()>((), ctx)?;

    let rendered = captured.borrow();
    assert!(rendered.starts_with("probe\nstack traceback:"), "{rendered}");
    assert!(rendered.contains("\ttest:1: in main chunk"), "{rendered}");

    Ok(())
}

#[test]
fn environment_surface_reads_and_writes_env() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    let ctx = &mut state.context();
    impl_base(ctx)?;
    impl_debug(ctx)?;

    // return value_from_env
    let main = ProtoBuilder::main()
        .constants(vec![text("value_from_env")])
        .code(vec![
            I::abc(Op::GetTabUp, 0, 0, k(0)),
            I::abc(Op::Return, 0, 2, 0),
        ])
        .build();

    let function = load(ctx, main);

    let env = ctx
        .function_environment(&function)?
        .expect("main chunks carry _ENV");
    assert_eq!(env, ctx.globals());

    let replacement = ctx.create_table()?;
    replacement.raw_set("value_from_env", "sandboxed", ctx)?;
    ctx.set_function_environment(&function, replacement)?;

    let value: String = function.call((), ctx)?;
    assert_eq!(value, "sandboxed");

    Ok(())
}

#[test]
fn coroutine_status_strings_match_the_lua_surface() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    let ctx = &mut state.context();
    impl_base(ctx)?;
    impl_coroutine(ctx)?;

    let globals = ctx.globals();
    let coroutine_table: TableRef = globals.raw_get("coroutine", ctx)?;
    let status: FunctionRef = coroutine_table.raw_get("status", ctx)?;

    let body = ctx.create_function(|args, _| Ok(args))?;
    let co = ctx.create_coroutine(body)?;

    let text: String = status.call(co.clone(), ctx)?;
    assert_eq!(text, "suspended");

    co.resume((), ctx)?;

    let text: String = status.call(co, ctx)?;
    assert_eq!(text, "dead");

    Ok(())
}
