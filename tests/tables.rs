use moonglow::errors::{ErrorData, LuaError};
use moonglow::interpreter::{LuaState, Value, Varargs};
use moonglow::stdlib::impl_base;
use pretty_assertions::assert_eq;

#[test]
fn raw_access_round_trips_values() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    let ctx = &mut state.context();

    let table = ctx.create_table()?;

    table.raw_set(1.0f64, "one", ctx)?;
    table.raw_set("key", 2.0f64, ctx)?;
    table.raw_set(true, 3.0f64, ctx)?;

    let one: String = table.raw_get(1.0f64, ctx)?;
    assert_eq!(one, "one");

    let two: f64 = table.raw_get("key", ctx)?;
    assert_eq!(two, 2.0);

    let three: f64 = table.raw_get(true, ctx)?;
    assert_eq!(three, 3.0);

    let missing: Value = table.raw_get("absent", ctx)?;
    assert!(missing.is_nil());

    Ok(())
}

#[test]
fn integral_float_keys_share_a_slot() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    let ctx = &mut state.context();

    let table = ctx.create_table()?;
    table.raw_set(16.0f64, "a", ctx)?;

    // 16.0 and 16 are the same key; 16.5 is not
    let hit: String = table.raw_get(16.0f64, ctx)?;
    assert_eq!(hit, "a");

    let miss: Value = table.raw_get(16.5f64, ctx)?;
    assert!(miss.is_nil());

    Ok(())
}

#[test]
fn nil_and_nan_keys_error_on_raw_set() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    let ctx = &mut state.context();

    let table = ctx.create_table()?;

    let err = table.raw_set(Value::Nil, 1.0f64, ctx).unwrap_err();
    assert_eq!(err.data, ErrorData::NilIndex);
    assert_eq!(err.to_string(), "table index is nil");

    let err = table.raw_set(f64::NAN, 1.0f64, ctx).unwrap_err();
    assert_eq!(err.data, ErrorData::NaNIndex);
    assert_eq!(err.to_string(), "table index is NaN");

    // reading with those keys is fine and finds nothing
    let value: Value = table.raw_get(Value::Nil, ctx)?;
    assert!(value.is_nil());

    Ok(())
}

#[test]
fn border_satisfies_the_length_contract() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    let ctx = &mut state.context();

    let table = ctx.create_table()?;

    for i in 1..=10 {
        table.raw_set(i as f64, i as f64, ctx)?;
    }

    assert_eq!(table.raw_len(ctx)?, 10);

    // deleting the tail moves the border back
    table.raw_set(10.0f64, Value::Nil, ctx)?;
    assert_eq!(table.raw_len(ctx)?, 9);

    // a sequence continued through the hash part is still found
    let sparse = ctx.create_table()?;
    sparse.raw_set(2.0f64, true, ctx)?;
    sparse.raw_set(1.0f64, true, ctx)?;
    sparse.raw_set(3.0f64, true, ctx)?;
    assert_eq!(sparse.raw_len(ctx)?, 3);

    // with a gap, any border is legal
    let gappy = ctx.create_table()?;
    gappy.raw_set(1.0f64, true, ctx)?;
    gappy.raw_set(8.0f64, true, ctx)?;

    let border = gappy.raw_len(ctx)? as f64;
    let at: Value = gappy.raw_get(border, ctx)?;
    let after: Value = gappy.raw_get(border + 1.0, ctx)?;
    assert!(!at.is_nil());
    assert!(after.is_nil());

    Ok(())
}

#[test]
fn next_visits_every_entry_exactly_once() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    let ctx = &mut state.context();

    let table = ctx.create_table()?;

    for i in 1..=4 {
        table.raw_set(i as f64, i as f64 * 10.0, ctx)?;
    }
    table.raw_set("alpha", 1.0f64, ctx)?;
    table.raw_set("beta", 2.0f64, ctx)?;

    let mut seen = Vec::new();
    let mut key = Value::Nil;

    while let Some((next_key, value)) = table.next(key.clone(), ctx)? {
        seen.push((next_key.clone(), value));
        key = next_key;
    }

    assert_eq!(seen.len(), 6);

    // the array part comes first, in index order
    for (i, (key, value)) in seen.iter().take(4).enumerate() {
        assert_eq!(*key, Value::Number((i + 1) as f64));
        assert_eq!(*value, Value::Number((i + 1) as f64 * 10.0));
    }

    // updating an existing key mid-iteration is well defined
    let mut key = Value::Nil;
    let mut count = 0;

    while let Some((next_key, _)) = table.next(key, ctx)? {
        table.raw_set(next_key.clone(), 0.0f64, ctx)?;
        key = next_key;
        count += 1;
    }

    assert_eq!(count, 6);

    Ok(())
}

#[test]
fn weak_values_disappear_after_a_sweep() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    let ctx = &mut state.context();

    let cache = ctx.create_table()?;
    let metatable = ctx.create_table()?;
    metatable.raw_set("__mode", "v", ctx)?;
    cache.set_metatable(Some(&metatable), ctx)?;

    // kept: the host holds a reference; dropped: nothing else does
    let kept = ctx.create_table()?;
    cache.raw_set("kept", kept.clone(), ctx)?;

    {
        let dropped = ctx.create_table()?;
        cache.raw_set("dropped", dropped, ctx)?;
    }

    ctx.sweep();

    let still_there: Value = cache.raw_get("kept", ctx)?;
    assert!(!still_there.is_nil());

    let gone: Value = cache.raw_get("dropped", ctx)?;
    assert!(gone.is_nil());

    // strong tables keep everything
    let strong = ctx.create_table()?;
    {
        let held_only_here = ctx.create_table()?;
        strong.raw_set(1.0f64, held_only_here, ctx)?;
    }

    ctx.sweep();

    let kept_strongly: Value = strong.raw_get(1.0f64, ctx)?;
    assert!(!kept_strongly.is_nil());

    Ok(())
}

#[test]
fn weak_keys_clear_their_entries() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    let ctx = &mut state.context();

    let registry = ctx.create_table()?;
    let metatable = ctx.create_table()?;
    metatable.raw_set("__mode", "k", ctx)?;
    registry.set_metatable(Some(&metatable), ctx)?;

    let live_key = ctx.create_table()?;
    registry.raw_set(live_key.clone(), "live", ctx)?;

    {
        let dead_key = ctx.create_table()?;
        registry.raw_set(dead_key, "dead", ctx)?;
    }

    ctx.sweep();

    let live: Value = registry.raw_get(live_key, ctx)?;
    assert_eq!(live, Value::String(ctx.intern_string(b"live")?));

    // only the surviving entry remains
    let mut count = 0;
    let mut key = Value::Nil;

    while let Some((next_key, _)) = registry.next(key, ctx)? {
        key = next_key;
        count += 1;
    }

    assert_eq!(count, 1);

    Ok(())
}

#[test]
fn sweep_keeps_interned_strings_reachable_from_lua() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    let ctx = &mut state.context();
    impl_base(ctx)?;

    let globals = ctx.globals();
    globals.raw_set("stash", "still here", ctx)?;

    let before = ctx.used_memory();
    ctx.sweep();

    let value: String = globals.raw_get("stash", ctx)?;
    assert_eq!(value, "still here");

    // dropping garbage must not grow memory
    assert!(ctx.used_memory() <= before);

    Ok(())
}

#[test]
fn pairs_honours_the_metamethod() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    let ctx = &mut state.context();
    impl_base(ctx)?;

    let table = ctx.create_table()?;
    let metatable = ctx.create_table()?;

    let fake_iterator = ctx.create_function(|args, ctx| {
        let table: Value = args.unpack_args(ctx)?;
        Varargs::pack(("iterator", table, "start"), ctx)
    })?;

    metatable.raw_set("__pairs", fake_iterator, ctx)?;
    table.set_metatable(Some(&metatable), ctx)?;

    let globals = ctx.globals();
    let pairs: moonglow::interpreter::FunctionRef = globals.raw_get("pairs", ctx)?;

    let (a, _, c): (String, Value, String) = pairs.call(table, ctx)?;
    assert_eq!(a, "iterator");
    assert_eq!(c, "start");

    Ok(())
}
