use crate::errors::LuaError;
use crate::interpreter::{
    ByteString, FunctionRef, HookMask, LuaContext, TableRef, Value, Varargs,
};

fn parse_hook_mask(text: &ByteString, count: u32) -> HookMask {
    let mut mask = HookMask::empty();

    for byte in text.as_bytes() {
        match byte {
            b'c' => mask |= HookMask::CALL,
            b'r' => mask |= HookMask::RET,
            b'l' => mask |= HookMask::LINE,
            _ => {}
        }
    }

    if count > 0 {
        mask |= HookMask::COUNT;
    }

    mask
}

pub fn impl_debug(ctx: &mut LuaContext) -> Result<(), LuaError> {
    // traceback
    let traceback = ctx.create_function(|args, ctx| {
        let (message, level): (Option<ByteString>, Option<f64>) = args.unpack_args(ctx)?;
        let level = level.unwrap_or(1.0).max(0.0) as usize;

        let message = message.map(|message| message.to_string_lossy().into_owned());
        let text = ctx.traceback(message.as_deref(), level);

        Varargs::pack(text, ctx)
    })?;

    // sethook
    let sethook = ctx.create_function(|args, ctx| {
        let (function, mask, count): (Option<FunctionRef>, Option<ByteString>, Option<f64>) =
            args.unpack_args(ctx)?;

        let Some(function) = function else {
            ctx.set_hook(None, HookMask::empty(), 0)?;
            return Ok(Varargs::default());
        };

        let count = count.unwrap_or_default() as u32;
        let mask = mask
            .map(|mask| parse_hook_mask(&mask, count))
            .unwrap_or_default();

        ctx.set_hook(Some(function), mask, count)?;
        Ok(Varargs::default())
    })?;

    // gethook
    let gethook = ctx.create_function(|_, ctx| {
        let Some((function, mask, count)) = ctx.hook() else {
            return Varargs::pack(Value::Nil, ctx);
        };

        let mut text = String::new();

        if mask.contains(HookMask::CALL) {
            text.push('c');
        }
        if mask.contains(HookMask::RET) {
            text.push('r');
        }
        if mask.contains(HookMask::LINE) {
            text.push('l');
        }

        Varargs::pack((function, text, count as f64), ctx)
    })?;

    // getinfo
    let getinfo = ctx.create_function(|args, ctx| {
        let level: f64 = args.unpack_args(ctx)?;

        let Some(info) = ctx.frame(level as usize) else {
            return Varargs::pack(Value::Nil, ctx);
        };

        let result = ctx.create_table()?;
        result.raw_set("short_src", &*info.source, ctx)?;
        result.raw_set("currentline", info.current_line as f64, ctx)?;
        result.raw_set("linedefined", info.line_defined as f64, ctx)?;
        result.raw_set("istailcall", info.tail_call, ctx)?;

        let what = match info.kind {
            crate::errors::FrameKind::Main => "main",
            _ => "Lua",
        };
        result.raw_set("what", what, ctx)?;

        Varargs::pack(result, ctx)
    })?;

    // getlocal
    let getlocal = ctx.create_function(|args, ctx| {
        let (level, index): (f64, f64) = args.unpack_args(ctx)?;
        let level = level as usize;
        let index = index as usize;

        let Some(name) = ctx.local_name(level, index) else {
            return Varargs::pack(Value::Nil, ctx);
        };

        let value = ctx.frame_local(level, index)?;
        Varargs::pack((name, value), ctx)
    })?;

    // setlocal
    let setlocal = ctx.create_function(|args, ctx| {
        let (level, index, value): (f64, f64, Value) = args.unpack_args(ctx)?;
        let level = level as usize;
        let index = index as usize;

        let Some(name) = ctx.local_name(level, index) else {
            return Varargs::pack(Value::Nil, ctx);
        };

        ctx.set_frame_local(level, index, value)?;
        Varargs::pack(name, ctx)
    })?;

    // getupvalue
    let getupvalue = ctx.create_function(|args, ctx| {
        let (function, index): (FunctionRef, f64) = args.unpack_args(ctx)?;

        match ctx.up_value(&function, index as usize)? {
            Some((name, value)) => {
                let name = name.unwrap_or_else(|| ByteString::from(""));
                Varargs::pack((name, value), ctx)
            }
            None => Varargs::pack(Value::Nil, ctx),
        }
    })?;

    // setupvalue
    let setupvalue = ctx.create_function(|args, ctx| {
        let (function, index, value): (FunctionRef, f64, Value) = args.unpack_args(ctx)?;
        let index = index as usize;

        if !ctx.set_up_value(&function, index, value)? {
            return Varargs::pack(Value::Nil, ctx);
        }

        match ctx.up_value(&function, index)? {
            Some((name, _)) => {
                let name = name.unwrap_or_else(|| ByteString::from(""));
                Varargs::pack(name, ctx)
            }
            None => Varargs::pack(Value::Nil, ctx),
        }
    })?;

    // getfenv
    let getfenv = ctx.create_function(|args, ctx| {
        let function: FunctionRef = args.unpack_args(ctx)?;

        match ctx.function_environment(&function)? {
            Some(env) => Varargs::pack(env, ctx),
            None => Varargs::pack(Value::Nil, ctx),
        }
    })?;

    // setfenv
    let setfenv = ctx.create_function(|args, ctx| {
        let (function, env): (FunctionRef, TableRef) = args.unpack_args(ctx)?;
        let replaced = ctx.set_function_environment(&function, env)?;
        Varargs::pack(replaced, ctx)
    })?;

    let debug = ctx.create_table()?;
    debug.raw_set("traceback", traceback, ctx)?;
    debug.raw_set("sethook", sethook, ctx)?;
    debug.raw_set("gethook", gethook, ctx)?;
    debug.raw_set("getinfo", getinfo, ctx)?;
    debug.raw_set("getlocal", getlocal, ctx)?;
    debug.raw_set("setlocal", setlocal, ctx)?;
    debug.raw_set("getupvalue", getupvalue, ctx)?;
    debug.raw_set("setupvalue", setupvalue, ctx)?;
    debug.raw_set("getfenv", getfenv, ctx)?;
    debug.raw_set("setfenv", setfenv, ctx)?;

    let env = ctx.globals();
    env.raw_set("debug", debug, ctx)?;

    Ok(())
}
