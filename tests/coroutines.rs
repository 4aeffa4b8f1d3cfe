mod common;

use common::*;
use moonglow::errors::{ErrorData, LuaError};
use moonglow::interpreter::{
    CoroutineStatus, FunctionRef, Instruction, LuaState, OpCode, Value, Varargs,
};
use moonglow::stdlib::{impl_base, impl_coroutine};
use pretty_assertions::assert_eq;

use Instruction as I;
use OpCode as Op;

/// `function(x) return coroutine.yield(x + 1) + 1 end`, reaching
/// `coroutine.yield` through `_ENV`.
fn yielding_adder(ctx: &mut moonglow::interpreter::LuaContext) -> FunctionRef {
    let body = ProtoBuilder::function(1)
        .up_values(vec![inherited_env_upvalue()])
        .constants(vec![text("coroutine"), text("yield"), num(1.0)])
        .code(vec![
            I::abc(Op::GetTabUp, 1, 0, k(0)),
            I::abc(Op::GetTable, 2, 1, k(1)),
            I::abc(Op::Add, 3, 0, k(2)),
            I::abc(Op::Call, 2, 2, 2),
            I::abc(Op::Add, 2, 2, k(2)),
            I::abc(Op::Return, 2, 2, 0),
        ])
        .build();

    let main = ProtoBuilder::main()
        .child(body)
        .code(vec![
            I::abx(Op::Closure, 0, 0),
            I::abc(Op::Return, 0, 2, 0),
        ])
        .build();

    let main = load(ctx, main);
    main.call((), ctx).unwrap()
}

#[test]
fn yield_suspends_and_resume_delivers() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    let ctx = &mut state.context();
    impl_base(ctx)?;
    impl_coroutine(ctx)?;

    let function = yielding_adder(ctx);
    let co = ctx.create_coroutine(function)?;

    assert_eq!(co.status(ctx)?, CoroutineStatus::Initial);

    // the yield surfaces x + 1
    let yielded: f64 = co.resume(10.0f64, ctx)?.unpack(ctx)?;
    assert_eq!(yielded, 11.0);
    assert_eq!(co.status(ctx)?, CoroutineStatus::Suspended);

    // the resume value feeds the suspended call, which adds one
    let returned: f64 = co.resume(100.0f64, ctx)?.unpack(ctx)?;
    assert_eq!(returned, 101.0);
    assert_eq!(co.status(ctx)?, CoroutineStatus::Dead);

    Ok(())
}

#[test]
fn dead_and_running_coroutines_cannot_resume() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    let ctx = &mut state.context();
    impl_base(ctx)?;
    impl_coroutine(ctx)?;

    let function = ctx.create_function(|args, _| Ok(args))?;
    let co = ctx.create_coroutine(function)?;

    co.resume((), ctx)?;
    assert_eq!(co.status(ctx)?, CoroutineStatus::Dead);

    let err = co.resume((), ctx).unwrap_err();
    assert_eq!(err.to_string(), "cannot resume dead coroutine");

    Ok(())
}

#[test]
fn yield_outside_a_coroutine_is_an_error() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    let ctx = &mut state.context();
    impl_base(ctx)?;
    impl_coroutine(ctx)?;

    // calling the yielder directly from the host runs on the main thread
    let globals = ctx.globals();
    let coroutine_table: moonglow::interpreter::TableRef = globals.raw_get("coroutine", ctx)?;
    let yield_fn: FunctionRef = coroutine_table.raw_get("yield", ctx)?;

    let err = yield_fn.call::<_, Varargs>((), ctx).unwrap_err();
    assert_eq!(
        err.to_string(),
        "attempt to yield from outside a coroutine"
    );
    assert!(err.is_catchable());

    Ok(())
}

#[test]
fn resumable_host_functions_suspend_mid_loop() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    let ctx = &mut state.context();
    impl_base(ctx)?;
    impl_coroutine(ctx)?;

    // for_range(i, end, f): calls f(i) for i..end, surviving yields
    // inside f by storing its loop state
    let for_range = ctx.create_resumable_function(|(result, state), ctx| {
        let (i, end, f): (f64, f64, FunctionRef) = if state.is_empty() {
            result?.unpack_args(ctx)?
        } else {
            state.unpack(ctx)?
        };

        if i < end {
            ctx.resume_call_with_state((i + 1.0, end, f.clone()))?;
            f.call::<_, ()>(i, ctx)?;
        }

        Ok(Varargs::default())
    })?;

    // the driven function yields every even i
    let collected = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let sink = collected.clone();

    let observe = ctx.create_resumable_function(move |(result, state), ctx| {
        if state.is_empty() {
            let i: f64 = result?.unpack_args(ctx)?;
            sink.borrow_mut().push(i);

            if i % 2.0 == 0.0 {
                ctx.resume_call_with_state(true)?;
                return Err(ErrorData::Yield(Varargs::pack(i, ctx)?).into());
            }

            Ok(Varargs::default())
        } else {
            result
        }
    })?;

    // coroutine body: for_range(1, 6, observe)
    let body = ProtoBuilder::function(0)
        .up_values(vec![inherited_env_upvalue()])
        .constants(vec![text("for_range"), text("observe"), num(1.0), num(6.0)])
        .code(vec![
            I::abc(Op::GetTabUp, 0, 0, k(0)),
            I::abx(Op::LoadK, 1, 2),
            I::abx(Op::LoadK, 2, 3),
            I::abc(Op::GetTabUp, 3, 0, k(1)),
            I::abc(Op::Call, 0, 4, 1),
            I::abc(Op::Return, 0, 1, 0),
        ])
        .build();

    let main = ProtoBuilder::main()
        .child(body)
        .code(vec![I::abx(Op::Closure, 0, 0), I::abc(Op::Return, 0, 2, 0)])
        .build();

    let globals = ctx.globals();
    globals.raw_set("for_range", for_range, ctx)?;
    globals.raw_set("observe", observe, ctx)?;

    let main = load(ctx, main);
    let body: FunctionRef = main.call((), ctx)?;
    let co = ctx.create_coroutine(body)?;

    // even steps yield back out with their value
    let first: f64 = co.resume((), ctx)?.unpack(ctx)?;
    assert_eq!(first, 2.0);

    let second: f64 = co.resume((), ctx)?.unpack(ctx)?;
    assert_eq!(second, 4.0);

    let done = co.resume((), ctx)?;
    assert!(done.is_empty());
    assert_eq!(co.status(ctx)?, CoroutineStatus::Dead);

    assert_eq!(&*collected.borrow(), &[1.0, 2.0, 3.0, 4.0, 5.0]);

    Ok(())
}

#[test]
fn pcall_spans_a_yield() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    let ctx = &mut state.context();
    impl_base(ctx)?;
    impl_coroutine(ctx)?;

    // protected(): yields once, then returns what the resume sent in
    let protected = ctx.create_resumable_function(|(result, state), ctx| {
        if state.is_empty() {
            ctx.resume_call_with_state(true)?;
            Err(ErrorData::Yield(Varargs::default()).into())
        } else {
            result
        }
    })?;

    // coroutine body: return pcall(protected)
    let body = ProtoBuilder::function(0)
        .up_values(vec![inherited_env_upvalue()])
        .constants(vec![text("pcall"), text("protected")])
        .code(vec![
            I::abc(Op::GetTabUp, 0, 0, k(0)),
            I::abc(Op::GetTabUp, 1, 0, k(1)),
            I::abc(Op::TailCall, 0, 2, 0),
            I::abc(Op::Return, 0, 0, 0),
        ])
        .build();

    let main = ProtoBuilder::main()
        .child(body)
        .code(vec![I::abx(Op::Closure, 0, 0), I::abc(Op::Return, 0, 2, 0)])
        .build();

    ctx.globals().raw_set("protected", protected, ctx)?;

    let main = load(ctx, main);
    let body: FunctionRef = main.call((), ctx)?;
    let co = ctx.create_coroutine(body)?;

    // first resume reaches the yield inside the protected call
    let paused = co.resume((), ctx)?;
    assert!(paused.is_empty());

    // resume-with-value flows back through pcall as (true, value)
    let results = co.resume(7.0f64, ctx)?;
    assert_eq!(
        results.to_vec(),
        vec![Value::Bool(true), Value::Number(7.0)]
    );

    Ok(())
}

#[test]
fn pcall_catches_an_error_after_a_yield() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    let ctx = &mut state.context();
    impl_base(ctx)?;
    impl_coroutine(ctx)?;

    // yields once, then raises
    let trouble = ctx.create_resumable_function(|(result, state), ctx| {
        if state.is_empty() {
            ctx.resume_call_with_state(true)?;
            Err(ErrorData::Yield(Varargs::default()).into())
        } else {
            result?;
            Err(LuaError::new_static_string("deferred failure"))
        }
    })?;

    let body = ProtoBuilder::function(0)
        .up_values(vec![inherited_env_upvalue()])
        .constants(vec![text("pcall"), text("trouble")])
        .code(vec![
            I::abc(Op::GetTabUp, 0, 0, k(0)),
            I::abc(Op::GetTabUp, 1, 0, k(1)),
            I::abc(Op::TailCall, 0, 2, 0),
            I::abc(Op::Return, 0, 0, 0),
        ])
        .build();

    let main = ProtoBuilder::main()
        .child(body)
        .code(vec![I::abx(Op::Closure, 0, 0), I::abc(Op::Return, 0, 2, 0)])
        .build();

    ctx.globals().raw_set("trouble", trouble, ctx)?;

    let main = load(ctx, main);
    let body: FunctionRef = main.call((), ctx)?;
    let co = ctx.create_coroutine(body)?;

    co.resume((), ctx)?;
    let results = co.resume((), ctx)?;

    assert_eq!(results.arg(1), Value::Bool(false));

    let Value::String(message) = results.arg(2) else {
        panic!("expected an error message");
    };

    assert!(message
        .fetch(ctx)?
        .to_string_lossy()
        .contains("deferred failure"));

    Ok(())
}

#[test]
fn nested_coroutines_report_normal_status() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    let ctx = &mut state.context();
    impl_base(ctx)?;
    impl_coroutine(ctx)?;

    let statuses = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let sink = statuses.clone();

    let outer_probe = ctx.create_function(move |args, ctx| {
        let outer: moonglow::interpreter::CoroutineRef = args.unpack_args(ctx)?;

        // from inside the inner coroutine, the outer one is "normal"
        let status = outer.status(ctx)?;
        let running = ctx.top_coroutine();
        sink.borrow_mut()
            .push((status, running.is_some()));

        Ok(Varargs::default())
    })?;
    ctx.globals().raw_set("probe", outer_probe, ctx)?;

    let inner_body = ctx.create_function(|args, ctx| {
        let outer: Value = args.first();
        let probe: FunctionRef = ctx.globals().raw_get("probe", ctx)?;
        probe.call::<_, ()>(outer, ctx)?;
        Ok(Varargs::default())
    })?;
    ctx.globals().raw_set("inner_body", inner_body, ctx)?;

    let outer_body = ctx.create_function(|args, ctx| {
        let this: Value = args.first();
        let inner_body: FunctionRef = ctx.globals().raw_get("inner_body", ctx)?;
        let inner = ctx.create_coroutine(inner_body)?;
        inner.resume(this, ctx)?;
        Ok(Varargs::default())
    })?;

    let outer = ctx.create_coroutine(outer_body)?;
    outer.resume(Value::Coroutine(outer.clone()), ctx)?;

    let observed = statuses.borrow();
    assert_eq!(observed.len(), 1);
    assert_eq!(observed[0].0, CoroutineStatus::Normal);
    assert!(observed[0].1);

    Ok(())
}
