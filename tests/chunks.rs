mod common;

use common::*;
use moonglow::errors::{LoadError, LuaError};
use moonglow::interpreter::{
    Chunk, ChunkMode, Compiler, Instruction, LuaState, OpCode, Prototype, Varargs,
};
use pretty_assertions::assert_eq;
use std::rc::Rc;

use Instruction as I;
use OpCode as Op;

fn sample_chunk() -> Chunk {
    // return 1, "two"
    let main = ProtoBuilder::main()
        .constants(vec![num(1.0), text("two")])
        .code(vec![
            I::abx(Op::LoadK, 0, 0),
            I::abx(Op::LoadK, 1, 1),
            I::abc(Op::Return, 0, 3, 0),
        ])
        .build();

    Chunk::new(main)
}

#[test]
fn dumped_chunks_execute_after_reloading() -> Result<(), LuaError> {
    let chunk = sample_chunk();
    let bytes = chunk.dump();

    let mut state = LuaState::new();
    let ctx = &mut state.context();

    let function = ctx
        .load(&bytes, "=sample", ChunkMode::Binary, None)?
        .unwrap();

    let (a, b): (f64, String) = function.call((), ctx)?;
    assert_eq!(a, 1.0);
    assert_eq!(b, "two");

    Ok(())
}

#[test]
fn dump_is_stable_across_a_round_trip() {
    let chunk = sample_chunk();
    let bytes = chunk.dump();

    let reloaded = Chunk::load(&bytes).unwrap();
    assert_eq!(reloaded, chunk);
    assert_eq!(reloaded.dump(), bytes);
}

#[test]
fn load_modes_gate_chunk_kinds() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    let ctx = &mut state.context();

    let binary = sample_chunk().dump();

    let err = ctx
        .load(&binary, "=sample", ChunkMode::Text, None)?
        .unwrap_err();
    assert_eq!(err, LoadError::BinaryChunkForbidden);

    let err = ctx
        .load(b"return 1", "=sample", ChunkMode::Binary, None)?
        .unwrap_err();
    assert_eq!(err, LoadError::TextChunkForbidden);

    // no compiler installed: text chunks have nowhere to go
    let err = ctx
        .load(b"return 1", "=sample", ChunkMode::Both, None)?
        .unwrap_err();
    assert_eq!(err, LoadError::MissingCompiler);

    Ok(())
}

struct FixedCompiler {
    chunk: Chunk,
}

impl Compiler for FixedCompiler {
    fn compile(&self, source: &[u8], _chunk_name: &str) -> Result<Chunk, LoadError> {
        if source.starts_with(b"--fail") {
            return Err(LoadError::Compile("synthetic syntax error".into()));
        }

        Ok(self.chunk.clone())
    }
}

#[test]
fn the_compiler_seam_feeds_load() -> Result<(), LuaError> {
    let mut state = LuaState::new();
    state.set_compiler(Rc::new(FixedCompiler {
        chunk: sample_chunk(),
    }));

    let ctx = &mut state.context();

    let function = ctx
        .load(b"anything", "=input", ChunkMode::Both, None)?
        .unwrap();

    let (a, _): (f64, String) = function.call((), ctx)?;
    assert_eq!(a, 1.0);

    // a compile failure is reported, not raised
    let err = ctx
        .load(b"--fail", "=input", ChunkMode::Both, None)?
        .unwrap_err();
    assert_eq!(err.to_string(), "synthetic syntax error");

    Ok(())
}

#[test]
fn custom_environments_replace_the_globals() -> Result<(), LuaError> {
    // return marker
    let main = ProtoBuilder::main()
        .constants(vec![text("marker")])
        .code(vec![
            I::abc(Op::GetTabUp, 0, 0, k(0)),
            I::abc(Op::Return, 0, 2, 0),
        ])
        .build();

    let mut state = LuaState::new();
    let ctx = &mut state.context();

    ctx.globals().raw_set("marker", "from globals", ctx)?;

    let sandbox = ctx.create_table()?;
    sandbox.raw_set("marker", "from sandbox", ctx)?;

    let chunk = Chunk::new(main);

    let plain = ctx.load_chunk(&chunk, None)?;
    let value: String = plain.call((), ctx)?;
    assert_eq!(value, "from globals");

    let sandboxed = ctx.load_chunk(&chunk, Some(sandbox))?;
    let value: String = sandboxed.call((), ctx)?;
    assert_eq!(value, "from sandbox");

    Ok(())
}

#[test]
fn stripped_chunks_still_execute() -> Result<(), LuaError> {
    // a chunk with no line info or local names
    let mut proto = sample_chunk().main.as_ref().clone();
    proto.line_info.clear();
    proto.locals.clear();

    let bytes = Chunk::new(proto).dump();
    let reloaded = Chunk::load(&bytes).unwrap();

    let mut state = LuaState::new();
    let ctx = &mut state.context();

    let function = ctx.load_chunk(&reloaded, None)?;
    let (a, _): (f64, String) = function.call((), ctx)?;
    assert_eq!(a, 1.0);

    Ok(())
}

#[test]
fn corrupt_chunks_are_rejected() {
    let bytes = sample_chunk().dump();

    // truncation anywhere in the body
    for cut in [10, bytes.len() / 2, bytes.len() - 1] {
        let err = Chunk::load(&bytes[..cut]).unwrap_err();
        assert!(
            matches!(err, LoadError::Truncated | LoadError::Corrupt | LoadError::BadTail),
            "cut {cut}: {err:?}"
        );
    }

    // an absurd element count
    let mut oversized = bytes.clone();
    let count_offset = 18 + 4 + 4 + 3;
    oversized[count_offset..count_offset + 4].copy_from_slice(&u32::MAX.to_le_bytes());
    assert_eq!(Chunk::load(&oversized), Err(LoadError::Corrupt));

    let mut proto = Prototype::default();
    proto.source = "=x".into();
    let valid = Chunk::new(proto).dump();
    assert!(Chunk::load(&valid).is_ok());
}
