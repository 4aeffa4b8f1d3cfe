//! An embeddable Lua 5.2 runtime core.
//!
//! The crate provides the three subsystems a sandboxing host needs:
//! the value model and hybrid table engine, a register based bytecode
//! interpreter for the Lua 5.2 instruction set, and coroutines built as
//! reified continuations so a yield can cross interpreter and host frames
//! without a native stack per thread.
//!
//! Compilation from source is a seam, not a feature: a host installs a
//! [`Compiler`](interpreter::Compiler) on the state, while precompiled
//! binary chunks load through [`interpreter::Chunk`] directly.

pub mod errors;
pub mod interpreter;
pub mod stdlib;

type BuildFastHasher = rustc_hash::FxBuildHasher;
type FastHashMap<K, V> = std::collections::HashMap<K, V, BuildFastHasher>;
type FastHashSet<K> = std::collections::HashSet<K, BuildFastHasher>;

macro_rules! debug_unreachable {
    ($($arg:tt)*) => {
        #[cfg(debug_assertions)]
        unreachable!($($arg)*)
    };
}

pub(crate) use debug_unreachable;
