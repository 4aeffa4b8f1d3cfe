use crate::errors::{ErrorData, LuaError};
use crate::interpreter::{CoroutineRef, CoroutineStatus, LuaContext, Value, Varargs};

pub fn impl_coroutine(ctx: &mut LuaContext) -> Result<(), LuaError> {
    // create
    let create = ctx.create_function(|args, ctx| {
        let function = args.unpack_args(ctx)?;
        let co = ctx.create_coroutine(function)?;
        Varargs::pack(co, ctx)
    })?;

    // resume
    let resume = ctx.create_function(|args, ctx| {
        let (co, args): (CoroutineRef, Varargs) = args.unpack_args(ctx)?;

        match co.resume(args, ctx) {
            Ok(mut values) => {
                values.push_front(Value::Bool(true));
                Ok(values)
            }
            Err(err) => {
                if !err.is_catchable() {
                    return Err(err);
                }

                let message = match err.data {
                    ErrorData::LuaValue(value) => value,
                    _ => Value::String(ctx.intern_string(err.to_string().as_bytes())?),
                };

                Varargs::pack((false, message), ctx)
            }
        }
    })?;

    // yield
    let r#yield = ctx.create_resumable_function(|(result, state), ctx| {
        if state.is_empty() {
            ctx.resume_call_with_state(true)?;
            Err(ErrorData::Yield(result?).into())
        } else {
            // resumed: the values passed to resume are our results
            result
        }
    })?;

    // status
    let status = ctx.create_function(|args, ctx| {
        let co: CoroutineRef = args.unpack_args(ctx)?;
        let status = co.status(ctx)?;

        let text = match status {
            CoroutineStatus::Running => {
                if ctx.top_coroutine().as_ref() == Some(&co) {
                    "running"
                } else {
                    "normal"
                }
            }
            status => status.as_str(),
        };

        Varargs::pack(text, ctx)
    })?;

    // running
    let running = ctx.create_function(|_, ctx| {
        let co = ctx.top_coroutine();
        let is_main = co.is_none();

        let co_value = match co {
            Some(co) => Value::Coroutine(co),
            None => Value::Nil,
        };

        Varargs::pack((co_value, is_main), ctx)
    })?;

    // isyieldable
    let isyieldable = ctx.create_function(|_, ctx| {
        let yieldable = ctx.is_yieldable() && ctx.top_coroutine().is_some();
        Varargs::pack(yieldable, ctx)
    })?;

    // wrap
    let wrap = ctx.create_function(|args, ctx| {
        let function = args.unpack_args(ctx)?;
        let co = ctx.create_coroutine(function)?;

        let f = ctx.create_function(move |args, ctx| co.resume(args, ctx))?;

        Varargs::pack(f, ctx)
    })?;

    let coroutine = ctx.create_table()?;
    coroutine.raw_set("create", create, ctx)?;
    coroutine.raw_set("resume", resume, ctx)?;
    coroutine.raw_set("yield", r#yield, ctx)?;
    coroutine.raw_set("status", status, ctx)?;
    coroutine.raw_set("running", running, ctx)?;
    coroutine.raw_set("isyieldable", isyieldable, ctx)?;
    coroutine.raw_set("wrap", wrap, ctx)?;

    let env = ctx.globals();
    env.raw_set("coroutine", coroutine, ctx)?;

    Ok(())
}
