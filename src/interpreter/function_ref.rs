use super::heap::{Heap, HeapRef, Storage, StorageKey};
use super::{FromVarargs, IntoArgs, LuaContext};
use crate::errors::{ErrorData, LuaError};
use slotmap::Key;

/// A counted reference to a function value, interpreted or native.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionRef(pub(crate) HeapRef<StorageKey>);

impl FunctionRef {
    #[inline]
    pub fn id(&self) -> u64 {
        match self.0.key() {
            StorageKey::NativeFunction(key) => {
                Storage::key_to_id(key.data(), Storage::NATIVE_FUNCTIONS_TAG)
            }
            StorageKey::Function(key) => Storage::key_to_id(key.data(), Storage::FUNCTIONS_TAG),
            _ => unreachable!(),
        }
    }

    pub(crate) fn test_validity(&self, heap: &Heap) -> Result<(), ErrorData> {
        let valid = match self.0.key() {
            StorageKey::Function(key) => heap.get_closure(key).is_some(),
            StorageKey::NativeFunction(key) => heap.get_host_fn(key).is_some(),
            _ => false,
        };

        if valid {
            Ok(())
        } else {
            Err(ErrorData::InvalidRef)
        }
    }

    /// Calls the function. A yield inside suspends the whole calling
    /// context; a Lua error propagates with its traceback.
    pub fn call<A: IntoArgs, R: FromVarargs>(
        &self,
        args: A,
        ctx: &mut LuaContext,
    ) -> Result<R, LuaError> {
        ctx.call_stack_value(self.0.key().into(), args)
    }
}
