mod byte_string;
mod cache_pools;
mod chunk;
mod closure;
mod coroutine;
mod coroutine_ref;
mod debug;
mod execution;
mod function_ref;
mod heap;
mod host_fn;
mod instruction;
mod metatable_keys;
mod number;
mod prototype;
mod state;
mod string_ref;
mod table;
mod table_ref;
mod tracker;
mod value;
mod value_stack;
mod vararg;

pub use byte_string::ByteString;
pub use chunk::{is_binary, Chunk, Compiler};
pub use coroutine::CoroutineStatus;
pub use coroutine_ref::CoroutineRef;
pub use debug::{FrameInfo, HookEvent, HookMask};
pub use function_ref::FunctionRef;
pub use instruction::{
    fb2int, int2fb, Instruction, OpCode, Register, MAX_ARG_AX, MAX_ARG_BX, MAX_ARG_SBX,
};
pub use metatable_keys::MetatableKeys;
pub use prototype::{Constant, LocalVariable, Prototype, UpValueDesc, SHORT_SOURCE_MAX};
pub use state::{ChunkMode, LuaContext, LuaState, RuntimeLimits};
pub use string_ref::StringRef;
pub use table_ref::TableRef;
pub use tracker::{AllocationTracker, BudgetTracker, UnlimitedTracker};
pub use value::{FromValue, IntoValue, TypeName, Value};
pub use vararg::{FromArg, FromArgs, FromVarargs, IntoArgs, Varargs};

pub(crate) use number::parse_number;
pub(crate) use value_stack::StackValue;
