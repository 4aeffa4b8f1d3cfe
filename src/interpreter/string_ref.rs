use super::byte_string::ByteString;
use super::heap::{BytesObjectKey, HeapRef, Storage};
use super::LuaContext;
use crate::errors::{ErrorData, LuaError};
use slotmap::Key;

/// A counted reference to an interned string, keeping it alive across
/// sweeps.
///
/// Interning makes identity value-based: two refs compare equal exactly
/// when their bytes do.
#[derive(Debug, Hash, Clone, PartialEq, Eq)]
pub struct StringRef(pub(crate) HeapRef<BytesObjectKey>);

impl StringRef {
    #[inline]
    pub fn id(&self) -> u64 {
        Storage::key_to_id(self.0.key().data(), Storage::BYTE_STRINGS_TAG)
    }

    pub fn fetch<'state>(&self, ctx: &'state LuaContext) -> Result<&'state ByteString, LuaError> {
        let heap = &ctx.state.execution_data.heap;
        let Some(bytes) = heap.get_bytes(self.0.key()) else {
            return Err(ErrorData::InvalidRef.into());
        };

        Ok(bytes)
    }

    /// Byte length, without borrowing the contents out.
    pub fn len(&self, ctx: &LuaContext) -> Result<usize, LuaError> {
        Ok(self.fetch(ctx)?.len())
    }

    pub fn is_empty(&self, ctx: &LuaContext) -> Result<bool, LuaError> {
        Ok(self.fetch(ctx)?.is_empty())
    }

    /// Interns the `start..end` window of this string (0-based byte
    /// indices, clamped to its bounds). A window spanning most of the
    /// string shares its backing bytes rather than copying them.
    pub fn slice(
        &self,
        start: usize,
        end: usize,
        ctx: &mut LuaContext,
    ) -> Result<StringRef, LuaError> {
        let heap = &ctx.state.execution_data.heap;

        let Some(bytes) = heap.get_bytes(self.0.key()) else {
            return Err(ErrorData::InvalidRef.into());
        };

        let window = bytes.sub(start, end);

        let heap = &mut ctx.state.execution_data.heap;
        let key = heap.intern_byte_string(window)?;
        Ok(StringRef(heap.create_ref(key)))
    }
}
