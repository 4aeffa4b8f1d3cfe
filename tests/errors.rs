mod common;

use common::*;
use moonglow::errors::{ErrorData, LuaError};
use moonglow::interpreter::{
    BudgetTracker, FunctionRef, Instruction, LuaState, OpCode, RuntimeLimits, TableRef, Value,
    Varargs,
};
use moonglow::stdlib::{impl_base, impl_coroutine};
use pretty_assertions::assert_eq;
use std::rc::Rc;

use Instruction as I;
use OpCode as Op;

#[test]
fn pcall_preserves_the_error_value() -> Result<(), LuaError> {
    // pcall(function() error({ code = 42 }) end)
    let mut state = LuaState::new();
    let ctx = &mut state.context();
    impl_base(ctx)?;

    let raiser = ctx.create_function(|_, ctx| {
        let payload = ctx.create_table()?;
        payload.raw_set("code", 42.0f64, ctx)?;
        Err(ErrorData::LuaValue(Value::Table(payload)).into())
    })?;

    let globals = ctx.globals();
    let pcall: FunctionRef = globals.raw_get("pcall", ctx)?;

    let (ok, err_value): (bool, Value) = pcall.call(raiser, ctx)?;

    assert!(!ok);

    let Value::Table(payload) = err_value else {
        panic!("expected the error table back");
    };

    let code: f64 = payload.raw_get("code", ctx)?;
    assert_eq!(code, 42.0);

    Ok(())
}

#[test]
fn error_applies_a_location_prefix_to_strings() -> Result<(), LuaError> {
    // function() error("boom") end
    let mut state = LuaState::new();
    let ctx = &mut state.context();
    impl_base(ctx)?;

    let body = ProtoBuilder::function(0)
        .up_values(vec![inherited_env_upvalue()])
        .constants(vec![text("error"), text("boom")])
        .code(vec![
            I::abc(Op::GetTabUp, 0, 0, k(0)),
            I::abx(Op::LoadK, 1, 1),
            I::abc(Op::Call, 0, 2, 1),
            I::abc(Op::Return, 0, 1, 0),
        ])
        .build();

    let main = ProtoBuilder::main()
        .child(body)
        .code(vec![I::abx(Op::Closure, 0, 0), I::abc(Op::Return, 0, 2, 0)])
        .build();

    let main = load(ctx, main);
    let body: FunctionRef = main.call((), ctx)?;

    let err = body.call::<_, Varargs>((), ctx).unwrap_err();

    let ErrorData::LuaValue(Value::String(message)) = &err.data else {
        panic!("expected a string error value");
    };

    let message = message.fetch(ctx)?.to_string_lossy().into_owned();
    assert_eq!(message, "test:1: boom");

    Ok(())
}

#[test]
fn xpcall_runs_the_handler_and_survives_handler_errors() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    let ctx = &mut state.context();
    impl_base(ctx)?;

    let globals = ctx.globals();
    let xpcall: FunctionRef = globals.raw_get("xpcall", ctx)?;

    let raiser = ctx.create_function(|_, _| {
        Err(LuaError::new_static_string("original"))
    })?;

    // a well behaved handler transforms the error
    let tagger = ctx.create_function(|args, ctx| {
        let message: String = args.unpack_args(ctx)?;
        Varargs::pack(format!("handled: {message}"), ctx)
    })?;

    let (ok, message): (bool, String) = xpcall.call((raiser.clone(), tagger), ctx)?;
    assert!(!ok);
    assert!(message.contains("handled:"));
    assert!(message.contains("original"));

    // a failing handler reports its own error instead
    let failing = ctx.create_function(|_, _| {
        Err(LuaError::new_static_string("handler exploded"))
    })?;

    let (ok, message): (bool, String) = xpcall.call((raiser, failing), ctx)?;
    assert!(!ok);
    assert!(message.contains("handler exploded"));

    Ok(())
}

#[test]
fn xpcall_handler_runs_before_the_raising_frames_unwind() -> Result<(), LuaError> {
    use std::cell::RefCell;

    let mut state = LuaState::new();
    let ctx = &mut state.context();
    impl_base(ctx)?;

    // the handler records what the stack looks like while it runs
    let seen = Rc::new(RefCell::new(String::new()));
    let sink = seen.clone();

    let handler = ctx.create_function(move |args, ctx| {
        let message: String = args.unpack_args(ctx)?;
        *sink.borrow_mut() = ctx.traceback(Some(&message), 0);
        Varargs::pack("handled", ctx)
    })?;

    // a chunk-level raiser, so there is a real interpreted frame to see
    let body = ProtoBuilder::function(0)
        .up_values(vec![inherited_env_upvalue()])
        .constants(vec![text("error"), text("boom")])
        .code(vec![
            I::abc(Op::GetTabUp, 0, 0, k(0)),
            I::abx(Op::LoadK, 1, 1),
            I::abc(Op::Call, 0, 2, 1),
            I::abc(Op::Return, 0, 1, 0),
        ])
        .build();

    let main = ProtoBuilder::main()
        .child(body)
        .code(vec![I::abx(Op::Closure, 0, 0), I::abc(Op::Return, 0, 2, 0)])
        .build();

    let main = load(ctx, main);
    let raiser: FunctionRef = main.call((), ctx)?;

    let globals = ctx.globals();
    let xpcall: FunctionRef = globals.raw_get("xpcall", ctx)?;

    let (ok, value): (bool, String) = xpcall.call((raiser, handler), ctx)?;
    assert!(!ok);
    assert_eq!(value, "handled");

    // the raiser's frame was still live when the handler looked
    let trace = seen.borrow();
    assert!(trace.starts_with("test:1: boom\n"), "{trace}");
    assert!(trace.contains("\ttest:1:"), "{trace}");

    Ok(())
}

#[test]
fn index_chains_are_bounded() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    let ctx = &mut state.context();

    // t's metatable routes __index and __newindex back to t itself
    let table = ctx.create_table()?;
    let metatable = ctx.create_table()?;
    metatable.raw_set("__index", table.clone(), ctx)?;
    metatable.raw_set("__newindex", table.clone(), ctx)?;
    table.set_metatable(Some(&metatable), ctx)?;

    let err = table.get::<_, Value>("missing", ctx).unwrap_err();
    assert_eq!(err.data, ErrorData::IndexChainTooLong);
    assert!(err.to_string().contains("loop in gettable"));

    let err = table.set("missing", 1.0f64, ctx).unwrap_err();
    assert_eq!(err.data, ErrorData::NewIndexChainTooLong);
    assert!(err.to_string().contains("loop in settable"));

    Ok(())
}

#[test]
fn deep_recursion_overflows_uncatchably() -> Result<(), LuaError> {
    // local function g(n) return g(n) + 0 end -- never a tail call
    let g = ProtoBuilder::function(1)
        .up_values(vec![local_upvalue(0)])
        .constants(vec![num(0.0)])
        .code(vec![
            I::abc(Op::GetUpval, 1, 0, 0),
            I::abc(Op::Move, 2, 0, 0),
            I::abc(Op::Call, 1, 2, 2),
            I::abc(Op::Add, 1, 1, k(0)),
            I::abc(Op::Return, 1, 2, 0),
        ])
        .build();

    // pcall must not observe the overflow
    let main = ProtoBuilder::main()
        .constants(vec![text("pcall"), num(1.0)])
        .child(g)
        .code(vec![
            I::abc(Op::GetTabUp, 0, 0, k(0)),
            I::abx(Op::Closure, 1, 0),
            I::abx(Op::LoadK, 2, 1),
            I::abc(Op::Call, 0, 3, 0),
            I::abc(Op::Return, 0, 0, 0),
        ])
        .build();

    let mut state = LuaState::new();
    state.set_limits(RuntimeLimits {
        stack_size: 10000,
        ..Default::default()
    });

    let ctx = &mut state.context();
    impl_base(ctx)?;

    let main = load(ctx, main);
    let err = main.call::<_, Varargs>((), ctx).unwrap_err();

    assert_eq!(err.data, ErrorData::StackOverflow);
    assert!(!err.is_catchable());

    Ok(())
}

#[test]
fn allocation_refusal_passes_through_pcall_and_coroutines() -> Result<(), LuaError> {
    // an unbounded allocator: while true do t = {} end, under pcall,
    // inside a coroutine
    let allocate = ProtoBuilder::function(0)
        .code(vec![
            I::abc(Op::NewTable, 0, 0, 0),
            I::asbx(Op::Jmp, 0, -2),
        ])
        .build();

    let body = ProtoBuilder::function(0)
        .up_values(vec![inherited_env_upvalue()])
        .constants(vec![text("pcall")])
        .child(allocate)
        .code(vec![
            I::abc(Op::GetTabUp, 0, 0, k(0)),
            I::abx(Op::Closure, 1, 0),
            I::abc(Op::TailCall, 0, 2, 0),
            I::abc(Op::Return, 0, 0, 0),
        ])
        .build();

    let main = ProtoBuilder::main()
        .child(body)
        .code(vec![I::abx(Op::Closure, 0, 0), I::abc(Op::Return, 0, 2, 0)])
        .build();

    let tracker = Rc::new(BudgetTracker::new(512 * 1024));
    let mut state = LuaState::with_tracker(tracker)?;
    let ctx = &mut state.context();
    impl_base(ctx)?;
    impl_coroutine(ctx)?;

    let main = load(ctx, main);
    let body: FunctionRef = main.call((), ctx)?;
    let co = ctx.create_coroutine(body)?;

    // neither the pcall nor the coroutine boundary converts the refusal
    let err = co.resume((), ctx).unwrap_err();
    assert_eq!(err.data, ErrorData::AllocationRefused);
    assert!(!err.is_catchable());

    Ok(())
}

#[test]
fn argument_errors_name_positions_and_types() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    let ctx = &mut state.context();
    impl_base(ctx)?;

    let globals = ctx.globals();
    let rawget: FunctionRef = globals.raw_get("rawget", ctx)?;

    let err = rawget
        .call::<_, Varargs>((1.0f64, 2.0f64), ctx)
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        "bad argument #1 (table expected, got number)"
    );

    Ok(())
}

#[test]
fn named_tables_substitute_their_type_name() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    let ctx = &mut state.context();

    let actor = ctx.create_table()?;
    let metatable = ctx.create_table()?;
    metatable.raw_set("__name", "Actor", ctx)?;
    actor.set_metatable(Some(&metatable), ctx)?;

    let wants_string = ctx.create_function(|args, ctx| {
        let text: String = args.unpack_args(ctx)?;
        Varargs::pack(text, ctx)
    })?;

    let err = wants_string.call::<_, Varargs>(actor, ctx).unwrap_err();
    assert_eq!(err.to_string(), "bad argument #1 (string expected, got Actor)");

    Ok(())
}

#[test]
fn errors_carry_a_traceback() -> Result<(), LuaError> {
    // two interpreted frames deep, then a raise
    let inner = ProtoBuilder::function(0)
        .up_values(vec![inherited_env_upvalue()])
        .constants(vec![text("error"), text("deep")])
        .code(vec![
            I::abc(Op::GetTabUp, 0, 0, k(0)),
            I::abx(Op::LoadK, 1, 1),
            I::abc(Op::Call, 0, 2, 1),
            I::abc(Op::Return, 0, 1, 0),
        ])
        .build();

    let main = ProtoBuilder::main()
        .child(inner)
        .code(vec![
            I::abx(Op::Closure, 0, 0),
            I::abc(Op::Call, 0, 1, 1),
            I::abc(Op::Return, 0, 1, 0),
        ])
        .build();

    let mut state = LuaState::new();
    let ctx = &mut state.context();
    impl_base(ctx)?;

    let main = load(ctx, main);
    let err = main.call::<_, Varargs>((), ctx).unwrap_err();

    let frames = err.traceback.frames();
    assert!(frames.len() >= 2, "traceback: {}", err.traceback);
    assert_eq!(frames[0].source(), "test");

    let rendered = err.traceback.to_string();
    assert!(rendered.starts_with("stack traceback:"));
    assert!(rendered.contains("\ttest:1:"));

    Ok(())
}

#[test]
fn protected_metatables_resist_setmetatable() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    let ctx = &mut state.context();
    impl_base(ctx)?;

    let table = ctx.create_table()?;
    let metatable = ctx.create_table()?;
    metatable.raw_set("__metatable", "locked", ctx)?;
    table.set_metatable(Some(&metatable), ctx)?;

    let globals = ctx.globals();

    // getmetatable reports the mask, not the real table
    let getmetatable: FunctionRef = globals.raw_get("getmetatable", ctx)?;
    let observed: String = getmetatable.call(table.clone(), ctx)?;
    assert_eq!(observed, "locked");

    // setmetatable refuses
    let setmetatable: FunctionRef = globals.raw_get("setmetatable", ctx)?;
    let replacement = ctx.create_table()?;
    let err = setmetatable
        .call::<_, Varargs>((table, replacement), ctx)
        .unwrap_err();
    assert!(err.to_string().contains("protected metatable"));

    Ok(())
}
