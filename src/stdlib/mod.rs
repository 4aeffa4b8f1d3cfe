//! The library surface the interpreter hooks rely on: the base
//! functions, the coroutine interface, and the debug interface. The
//! remaining standard libraries are the host's business.

mod base;
mod coroutine;
mod debug;

pub use base::impl_base;
pub use coroutine::impl_coroutine;
pub use debug::impl_debug;
