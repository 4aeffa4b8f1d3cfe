use super::byte_string::ByteString;
use super::heap::{HeapRef, Storage, TableObjectKey};
use super::table::Table;
use super::value::{FromValue, IntoValue, Value};
use super::value_stack::StackValue;
use super::LuaContext;
use crate::errors::{ErrorData, LuaError};
use slotmap::Key;

/// A counted reference to a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef(pub(crate) HeapRef<TableObjectKey>);

impl TableRef {
    #[inline]
    pub fn id(&self) -> u64 {
        Storage::key_to_id(self.0.key().data(), Storage::TABLES_TAG)
    }

    /// The real metatable, ignoring `__metatable` protection.
    pub fn metatable(&self, ctx: &mut LuaContext) -> Result<Option<TableRef>, LuaError> {
        let heap = &mut ctx.state.execution_data.heap;

        if heap.get_table(self.0.key()).is_none() {
            return Err(ErrorData::InvalidRef.into());
        }

        let metatable_ref = heap
            .get_table_metatable(self.0.key())
            .map(|key| TableRef(heap.create_ref(key)));

        Ok(metatable_ref)
    }

    pub fn set_metatable(
        &self,
        metatable_ref: Option<&TableRef>,
        ctx: &mut LuaContext,
    ) -> Result<(), LuaError> {
        let heap = &mut ctx.state.execution_data.heap;
        let metatable_key = metatable_ref
            .map(|metatable_ref| {
                let key = metatable_ref.0.key();

                if heap.get_table(key).is_some() {
                    Ok(key)
                } else {
                    Err(ErrorData::InvalidRef)
                }
            })
            .transpose()?;

        if heap.get_table(self.0.key()).is_none() {
            return Err(ErrorData::InvalidRef.into());
        }

        heap.set_table_metatable(self.0.key(), metatable_key);

        Ok(())
    }

    /// The table's `__name` metafield, when it is a string.
    pub(crate) fn metamethod_name(&self, ctx: &LuaContext) -> Option<ByteString> {
        let heap = &ctx.state.execution_data.heap;
        let name_key = ctx.state.execution_data.metatable_keys.name.0.key();

        match heap.get_metavalue(StackValue::Table(self.0.key()), name_key) {
            StackValue::Bytes(key) => heap.get_bytes(key).cloned(),
            _ => None,
        }
    }

    /// Gets a value without invoking the `__index` metamethod.
    pub fn raw_get<K: IntoValue, V: FromValue>(
        &self,
        key: K,
        ctx: &mut LuaContext,
    ) -> Result<V, LuaError> {
        let key = key.into_value(ctx)?.to_stack_value();
        let heap = &mut ctx.state.execution_data.heap;

        let Some(table) = heap.get_table(self.0.key()) else {
            return Err(ErrorData::InvalidRef.into());
        };

        let value = table.get(key);
        let value = Value::from_stack_value(heap, value);

        V::from_value(value, ctx)
    }

    /// Sets a value without invoking the `__newindex` metamethod.
    pub fn raw_set<K: IntoValue, V: IntoValue>(
        &self,
        key: K,
        value: V,
        ctx: &mut LuaContext,
    ) -> Result<(), LuaError> {
        let key = key.into_value(ctx)?;
        let value = value.into_value(ctx)?;

        // invalid refs must not get stored in the heap
        let heap = &mut ctx.state.execution_data.heap;
        key.test_validity(heap)?;
        value.test_validity(heap)?;

        let key = key.to_stack_value();
        Table::check_key(key)?;

        let Some(table) = heap.get_table_mut(self.0.key()) else {
            return Err(ErrorData::InvalidRef.into());
        };

        let original_size = table.heap_size();

        table.set(key, value.to_stack_value());

        let new_size = table.heap_size();
        heap.settle(original_size, new_size)?;

        Ok(())
    }

    /// The `#` border without invoking the `__len` metamethod.
    pub fn raw_len(&self, ctx: &LuaContext) -> Result<usize, LuaError> {
        let heap = &ctx.state.execution_data.heap;
        let Some(table) = heap.get_table(self.0.key()) else {
            return Err(ErrorData::InvalidRef.into());
        };

        Ok(table.length() as usize)
    }

    /// The key/value pair following `key` in iteration order, nil key for
    /// the start. `Ok(None)` ends the traversal.
    pub fn next(
        &self,
        key: Value,
        ctx: &mut LuaContext,
    ) -> Result<Option<(Value, Value)>, LuaError> {
        let key = key.to_stack_value();
        let heap = &mut ctx.state.execution_data.heap;

        let Some(table) = heap.get_table(self.0.key()) else {
            return Err(ErrorData::InvalidRef.into());
        };

        let Some((next_key, next_value)) = table.next(key)? else {
            return Ok(None);
        };

        Ok(Some((
            Value::from_stack_value(heap, next_key),
            Value::from_stack_value(heap, next_value),
        )))
    }

    /// Gets a value, following the `__index` chain.
    pub fn get<K: IntoValue, V: FromValue>(
        &self,
        key: K,
        ctx: &mut LuaContext,
    ) -> Result<V, LuaError> {
        let key = key.into_value(ctx)?.to_stack_value();
        let value = ctx.table_get(StackValue::Table(self.0.key()), key)?;
        V::from_value(value, ctx)
    }

    /// Sets a value, following the `__newindex` chain.
    pub fn set<K: IntoValue, V: IntoValue>(
        &self,
        key: K,
        value: V,
        ctx: &mut LuaContext,
    ) -> Result<(), LuaError> {
        let key = key.into_value(ctx)?;
        let value = value.into_value(ctx)?;

        let heap = &ctx.state.execution_data.heap;
        key.test_validity(heap)?;
        value.test_validity(heap)?;

        ctx.table_set(
            StackValue::Table(self.0.key()),
            key.to_stack_value(),
            value.to_stack_value(),
        )
    }

    /// Removes every entry, keeping the metatable and capacity.
    pub fn clear(&self, ctx: &mut LuaContext) -> Result<(), LuaError> {
        let heap = &mut ctx.state.execution_data.heap;

        let Some(table) = heap.get_table_mut(self.0.key()) else {
            return Err(ErrorData::InvalidRef.into());
        };

        let original_size = table.heap_size();
        table.clear();
        heap.settle(original_size, 0)?;

        Ok(())
    }
}
