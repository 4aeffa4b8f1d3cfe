use crate::errors::{ErrorData, LuaError};
use crate::interpreter::{
    parse_number, ByteString, ChunkMode, FromArg, LuaContext, StackValue, TableRef, Value, Varargs,
};
use std::io::Write;

/// Turns a caught error into the value `pcall` reports: raised values
/// come back untouched, message errors render with their location
/// prefix.
fn error_to_value(err: LuaError, ctx: &mut LuaContext) -> Result<Value, LuaError> {
    match err.data {
        ErrorData::LuaValue(value) => Ok(value),
        _ => {
            let text = err.to_string();
            Ok(Value::String(ctx.intern_string(text.as_bytes())?))
        }
    }
}

/// The message prefix `error` applies at a given level: the short
/// source and current line of the frame raising the error.
fn location_prefix(ctx: &LuaContext, level: usize) -> Option<String> {
    let frame = ctx.frame(level)?;
    Some(format!("{}:{}: ", frame.source, frame.current_line))
}

pub fn impl_base(ctx: &mut LuaContext) -> Result<(), LuaError> {
    let env = ctx.globals();

    // print
    let print = ctx.create_function(|args, ctx| {
        let mut out = std::io::stdout().lock();
        let count = args.count();

        for (i, value) in args.iter().enumerate() {
            let text = ctx.stringify(value)?;
            let _ = out.write_all(text.as_bytes());

            if i + 1 < count {
                let _ = out.write_all(b"\t");
            }
        }

        let _ = out.write_all(b"\n");

        Ok(Varargs::default())
    })?;

    // type
    let type_name = ctx.create_function(|args, ctx| {
        let value: Value = args.unpack_args(ctx)?;
        Varargs::pack(value.type_name().as_str(), ctx)
    })?;

    // tostring
    let tostring = ctx.create_function(|args, ctx| {
        let value: Value = args.unpack_args(ctx)?;
        let text = ctx.stringify(value)?;
        Varargs::pack(text, ctx)
    })?;

    // tonumber
    let tonumber = ctx.create_function(|args, ctx| {
        let (value, base): (Value, Option<f64>) = args.unpack_args(ctx)?;

        let Some(base) = base else {
            let result = match &value {
                Value::Number(n) => Some(*n),
                Value::String(string_ref) => {
                    let bytes = string_ref.fetch(ctx)?;
                    parse_number(bytes.as_bytes())
                }
                _ => None,
            };

            return match result {
                Some(n) => Varargs::pack(n, ctx),
                None => Varargs::pack(Value::Nil, ctx),
            };
        };

        let base = base as u32;

        if !(2..=36).contains(&base) {
            return Err(LuaError::new_bad_argument(
                2,
                LuaError::new_static_string("base out of range"),
            ));
        }

        let text = ByteString::from_arg(value, 1, ctx)?;
        let text = text.to_string_lossy();
        let text = text.trim();

        let (negative, digits) = match text.as_bytes().first() {
            Some(b'-') => (true, &text[1..]),
            Some(b'+') => (false, &text[1..]),
            _ => (false, text),
        };

        if digits.is_empty() {
            return Varargs::pack(Value::Nil, ctx);
        }

        let mut n = 0f64;

        for c in digits.chars() {
            let Some(digit) = c.to_digit(base) else {
                return Varargs::pack(Value::Nil, ctx);
            };

            n = n * base as f64 + digit as f64;
        }

        if negative {
            n = -n;
        }

        Varargs::pack(n, ctx)
    })?;

    // rawget
    let rawget = ctx.create_function(|args, ctx| {
        let (table, key): (TableRef, Value) = args.unpack_args(ctx)?;
        let value: Value = table.raw_get(key, ctx)?;
        Varargs::pack(value, ctx)
    })?;

    // rawset
    let rawset = ctx.create_function(|args, ctx| {
        let (table, key, value): (TableRef, Value, Value) = args.unpack_args(ctx)?;
        table.raw_set(key, value, ctx)?;
        Varargs::pack(table, ctx)
    })?;

    // rawequal
    let rawequal = ctx.create_function(|args, ctx| {
        let (a, b): (Value, Value) = args.unpack_args(ctx)?;
        Varargs::pack(a == b, ctx)
    })?;

    // rawlen
    let rawlen = ctx.create_function(|args, ctx| {
        let value: Value = args.unpack_args(ctx)?;

        let len = match &value {
            Value::Table(table_ref) => table_ref.raw_len(ctx)? as f64,
            Value::String(string_ref) => string_ref.fetch(ctx)?.len() as f64,
            _ => {
                return Err(LuaError::new_bad_argument(
                    1,
                    LuaError::new_static_string("table or string expected"),
                ));
            }
        };

        Varargs::pack(len, ctx)
    })?;

    // next
    let next = ctx.create_function(|args, ctx| {
        let (table, key): (TableRef, Value) = args.unpack_args(ctx)?;

        match table.next(key, ctx)? {
            Some((next_key, value)) => Varargs::pack((next_key, value), ctx),
            None => Varargs::pack(Value::Nil, ctx),
        }
    })?;

    // pairs
    let next_for_pairs = next.clone();
    let pairs = ctx.create_function(move |args, ctx| {
        let value: Value = args.unpack_args(ctx)?;

        // __pairs overrides the raw traversal
        let pairs_key = ctx.metatable_keys().pairs.0.key();
        let heap = &ctx.state.execution_data.heap;

        if let Some(mm) = heap.get_metamethod(value.to_stack_value(), pairs_key) {
            let results: Varargs = ctx.call_stack_value(mm, value)?;

            return Varargs::pack(
                (results.arg(1), results.arg(2), results.arg(3)),
                ctx,
            );
        }

        let table = TableRef::from_arg(value, 1, ctx)?;

        Varargs::pack((next_for_pairs.clone(), table, Value::Nil), ctx)
    })?;

    // the ipairs iterator: reads raw on plain tables, through the index
    // protocol once a metatable is present
    let inext = ctx.create_function(|args, ctx| {
        let (table, i): (TableRef, f64) = args.unpack_args(ctx)?;
        let i = i + 1.0;

        let value: Value = if table.metatable(ctx)?.is_none() {
            table.raw_get(i, ctx)?
        } else {
            table.get(i, ctx)?
        };

        if value.is_nil() {
            return Varargs::pack(Value::Nil, ctx);
        }

        Varargs::pack((i, value), ctx)
    })?;

    // ipairs
    let ipairs = ctx.create_function(move |args, ctx| {
        let table: TableRef = args.unpack_args(ctx)?;
        Varargs::pack((inext.clone(), table, 0f64), ctx)
    })?;

    // select
    let select = ctx.create_function(|args, ctx| {
        let selector: Value = args.first();
        let rest = args.subargs(2);

        if let Value::String(string_ref) = &selector {
            if string_ref.fetch(ctx)?.as_bytes() == b"#" {
                return Varargs::pack(rest.count() as f64, ctx);
            }
        }

        let Value::Number(n) = selector else {
            return Err(LuaError::new_bad_argument(
                1,
                LuaError::new_static_string("number expected"),
            ));
        };

        if n < 0.0 {
            let start = rest.count() as f64 + n + 1.0;

            if start < 1.0 {
                return Err(LuaError::new_bad_argument(
                    1,
                    LuaError::new_static_string("index out of range"),
                ));
            }

            return Ok(rest.subargs(start as usize));
        }

        if n < 1.0 {
            return Err(LuaError::new_bad_argument(
                1,
                LuaError::new_static_string("index out of range"),
            ));
        }

        Ok(rest.subargs(n as usize))
    })?;

    // error
    let error = ctx.create_function(|args, ctx| {
        let (value, level): (Value, Option<f64>) = args.unpack_args(ctx)?;
        let level = level.unwrap_or(1.0) as usize;

        let value = match (&value, level) {
            (Value::String(string_ref), level) if level > 0 => {
                let mut message = location_prefix(ctx, level - 1).unwrap_or_default();
                message.push_str(&string_ref.fetch(ctx)?.to_string_lossy());
                Value::String(ctx.intern_string(message.as_bytes())?)
            }
            _ => value,
        };

        Err(ErrorData::LuaValue(value).into())
    })?;

    // assert
    let assert = ctx.create_function(|args, ctx| {
        if args.first().is_truthy() {
            return Ok(args);
        }

        let message = args.arg(2);

        if message.is_nil() {
            return Err(ErrorData::LuaValue(Value::String(
                ctx.intern_string(b"assertion failed!")?,
            ))
            .into());
        }

        Err(ErrorData::LuaValue(message).into())
    })?;

    // setmetatable
    let setmetatable = ctx.create_function(|args, ctx| {
        let (table, metatable): (TableRef, Option<TableRef>) = args.unpack_args(ctx)?;

        // __metatable protects against replacement
        let guard_key = ctx.metatable_keys().metatable.0.key();
        let heap = &ctx.state.execution_data.heap;
        let guarded = heap.get_metavalue(StackValue::Table(table.0.key()), guard_key);

        if guarded != StackValue::Nil {
            return Err(LuaError::new_static_string(
                "cannot change a protected metatable",
            ));
        }

        table.set_metatable(metatable.as_ref(), ctx)?;
        Varargs::pack(table, ctx)
    })?;

    // getmetatable
    let getmetatable = ctx.create_function(|args, ctx| {
        let value: Value = args.unpack_args(ctx)?;

        match ctx.observed_metatable(&value)? {
            Some(metatable) => Varargs::pack(metatable, ctx),
            None => Varargs::pack(Value::Nil, ctx),
        }
    })?;

    // load
    let load = ctx.create_function(|args, ctx| {
        let (chunk, chunk_name, mode, env): (
            ByteString,
            Option<ByteString>,
            Option<ByteString>,
            Option<TableRef>,
        ) = args.unpack_args(ctx)?;

        let chunk_name = chunk_name
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "=(load)".to_string());

        let mode = match mode.as_ref().map(|mode| mode.as_bytes()) {
            None | Some(b"bt") => ChunkMode::Both,
            Some(b"t") => ChunkMode::Text,
            Some(b"b") => ChunkMode::Binary,
            Some(_) => {
                return Err(LuaError::new_bad_argument(
                    3,
                    LuaError::new_static_string("invalid mode"),
                ));
            }
        };

        match ctx.load(chunk.as_bytes(), &chunk_name, mode, env)? {
            Ok(function) => Varargs::pack(function, ctx),
            Err(err) => Varargs::pack((Value::Nil, err.to_string()), ctx),
        }
    })?;

    // pcall
    let pcall = ctx.create_resumable_function(|(result, state), ctx| {
        if state.is_empty() {
            let (function, args): (Value, Varargs) = result?.unpack_args(ctx)?;

            ctx.open_protected(None)?;
            ctx.resume_call_with_state(true)?;

            function.call::<_, Varargs>(args, ctx)
        } else {
            // the protected extent is finished either way; suspensions
            // never land here, they park the barrier with the thread
            ctx.close_protected();

            match result {
                Ok(mut values) => {
                    values.push_front(Value::Bool(true));
                    Ok(values)
                }
                Err(err) => {
                    if !err.is_catchable() {
                        return Err(err);
                    }

                    let value = error_to_value(err, ctx)?;
                    Varargs::pack((false, value), ctx)
                }
            }
        }
    })?;

    // xpcall
    let xpcall = ctx.create_resumable_function(|(result, state), ctx| {
        if state.is_empty() {
            let (function, handler, args): (Value, Value, Varargs) = result?.unpack_args(ctx)?;

            // the handler waits at the barrier: on failure it runs at
            // the raise site, while the raising frames are still live
            ctx.open_protected(Some(handler))?;
            ctx.resume_call_with_state(true)?;

            function.call::<_, Varargs>(args, ctx)
        } else {
            ctx.close_protected();

            match result {
                Ok(mut values) => {
                    values.push_front(Value::Bool(true));
                    Ok(values)
                }
                Err(err) => {
                    if !err.is_catchable() {
                        return Err(err);
                    }

                    // the handler already ran where the error was
                    // raised; its result is the error value now
                    let value = error_to_value(err, ctx)?;
                    Varargs::pack((false, value), ctx)
                }
            }
        }
    })?;

    env.raw_set("_G", env.clone(), ctx)?;
    env.raw_set("_VERSION", "Lua 5.2", ctx)?;
    env.raw_set("print", print, ctx)?;
    env.raw_set("type", type_name, ctx)?;
    env.raw_set("tostring", tostring, ctx)?;
    env.raw_set("tonumber", tonumber, ctx)?;
    env.raw_set("rawget", rawget, ctx)?;
    env.raw_set("rawset", rawset, ctx)?;
    env.raw_set("rawequal", rawequal, ctx)?;
    env.raw_set("rawlen", rawlen, ctx)?;
    env.raw_set("next", next, ctx)?;
    env.raw_set("pairs", pairs, ctx)?;
    env.raw_set("ipairs", ipairs, ctx)?;
    env.raw_set("select", select, ctx)?;
    env.raw_set("error", error, ctx)?;
    env.raw_set("assert", assert, ctx)?;
    env.raw_set("setmetatable", setmetatable, ctx)?;
    env.raw_set("getmetatable", getmetatable, ctx)?;
    env.raw_set("load", load, ctx)?;
    env.raw_set("pcall", pcall, ctx)?;
    env.raw_set("xpcall", xpcall, ctx)?;

    Ok(())
}
