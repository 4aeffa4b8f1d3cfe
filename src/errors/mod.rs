mod error_data;
mod illegal_bytecode;
mod load_error;
mod lua_error;
mod traceback;

pub use error_data::ErrorData;
pub use illegal_bytecode::IllegalBytecode;
pub use load_error::LoadError;
pub use lua_error::LuaError;
pub use traceback::{FrameKind, Traceback, TracebackFrame};
