use super::coroutine::Coroutine;
use super::heap::{CoroutineObjectKey, HeapRef, Storage};
use super::{CoroutineStatus, IntoArgs, LuaContext, Varargs};
use crate::errors::{ErrorData, LuaError};
use slotmap::Key;

/// A counted reference to a coroutine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoroutineRef(pub(crate) HeapRef<CoroutineObjectKey>);

impl CoroutineRef {
    #[inline]
    pub fn id(&self) -> u64 {
        Storage::key_to_id(self.0.key().data(), Storage::COROUTINES_TAG)
    }

    pub fn status(&self, ctx: &LuaContext) -> Result<CoroutineStatus, LuaError> {
        let key = self.0.key();
        let Some(coroutine) = ctx.state.execution_data.heap.get_coroutine(key) else {
            return Err(ErrorData::InvalidRef.into());
        };

        Ok(coroutine.status)
    }

    /// Runs the coroutine until it yields, returns, or fails.
    ///
    /// Yielded or returned values come back as `Ok`; a Lua error that
    /// killed the coroutine comes back as `Err` with `is_catchable()`
    /// true, while uncatchable errors pass through unchanged.
    pub fn resume<A: IntoArgs>(
        &self,
        args: A,
        ctx: &mut LuaContext,
    ) -> Result<Varargs, LuaError> {
        let args = args.into_args(ctx)?;
        Coroutine::resume(self.0.key(), args, ctx)
    }
}
