use super::heap::{
    BytesObjectKey, CellObjectKey, CoroutineObjectKey, FnObjectKey, Heap, NativeFnObjectKey,
    StorageKey, TableObjectKey,
};
use super::TypeName;
use std::ops::Range;

/// The copyable, key based form a value takes in registers, table slots,
/// and upvalue cells. Heap values are typed slot keys; numbers are always
/// `f64`.
///
/// `Pointer` never escapes to Lua: it marks a register that has been
/// promoted to a shared upvalue cell, and every read path dereferences it.
#[derive(Default, Debug, Clone, Copy, PartialEq)]
pub(crate) enum StackValue {
    #[default]
    Nil,
    Bool(bool),
    Number(f64),
    Bytes(BytesObjectKey),
    Table(TableObjectKey),
    NativeFunction(NativeFnObjectKey),
    Function(FnObjectKey),
    Coroutine(CoroutineObjectKey),
    Pointer(CellObjectKey),
}

impl Eq for StackValue {}

impl std::hash::Hash for StackValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            StackValue::Nil => core::mem::discriminant(self).hash(state),
            StackValue::Bool(b) => b.hash(state),
            StackValue::Number(n) => n.to_bits().hash(state),
            StackValue::Bytes(key) => key.hash(state),
            StackValue::Table(key) => key.hash(state),
            StackValue::NativeFunction(key) => key.hash(state),
            StackValue::Function(key) => key.hash(state),
            StackValue::Coroutine(key) => key.hash(state),
            StackValue::Pointer(key) => key.hash(state),
        }
    }
}

impl StackValue {
    #[inline]
    pub(crate) fn get_deref(self, heap: &Heap) -> Self {
        let StackValue::Pointer(key) = self else {
            return self;
        };

        if let Some(value) = heap.get_cell(key) {
            *value
        } else {
            crate::debug_unreachable!();
            #[cfg(not(debug_assertions))]
            StackValue::Nil
        }
    }

    pub(crate) fn type_name(self, heap: &Heap) -> TypeName {
        match self {
            StackValue::Nil => TypeName::Nil,
            StackValue::Bool(_) => TypeName::Bool,
            StackValue::Number(_) => TypeName::Number,
            StackValue::Bytes(_) => TypeName::String,
            StackValue::Table(_) => TypeName::Table,
            StackValue::NativeFunction(_) | StackValue::Function(_) => TypeName::Function,
            StackValue::Coroutine(_) => TypeName::Thread,
            StackValue::Pointer(key) => heap
                .get_cell(key)
                .map(|value| {
                    if matches!(value, StackValue::Pointer(_)) {
                        crate::debug_unreachable!();
                        #[cfg(not(debug_assertions))]
                        return TypeName::Nil;
                    }

                    value.type_name(heap)
                })
                .unwrap_or(TypeName::Nil),
        }
    }

    pub(crate) fn as_storage_key(self) -> Option<StorageKey> {
        match self {
            StackValue::Nil | StackValue::Bool(_) | StackValue::Number(_) => None,
            StackValue::Bytes(key) => Some(StorageKey::Bytes(key)),
            StackValue::Table(key) => Some(StorageKey::Table(key)),
            StackValue::NativeFunction(key) => Some(StorageKey::NativeFunction(key)),
            StackValue::Function(key) => Some(StorageKey::Function(key)),
            StackValue::Coroutine(key) => Some(StorageKey::Coroutine(key)),
            StackValue::Pointer(key) => Some(StorageKey::Cell(key)),
        }
    }

    #[inline]
    pub(crate) fn is_truthy(self) -> bool {
        !matches!(self, StackValue::Nil | StackValue::Bool(false))
    }

    pub(crate) fn lives_in_heap(&self) -> bool {
        !matches!(
            self,
            StackValue::Nil | StackValue::Bool(_) | StackValue::Number(_)
        )
    }
}

impl From<StorageKey> for StackValue {
    fn from(value: StorageKey) -> Self {
        match value {
            StorageKey::Cell(key) => StackValue::Pointer(key),
            StorageKey::Bytes(key) => StackValue::Bytes(key),
            StorageKey::Table(key) => StackValue::Table(key),
            StorageKey::NativeFunction(key) => StackValue::NativeFunction(key),
            StorageKey::Function(key) => StackValue::Function(key),
            StorageKey::Coroutine(key) => StackValue::Coroutine(key),
        }
    }
}

/// The register file of one execution context. Frames overlay windows of
/// this stack; reads past the live end produce nil.
#[derive(Default)]
pub(crate) struct RegisterStack {
    values: Vec<StackValue>,
}

impl Clone for RegisterStack {
    fn clone(&self) -> Self {
        Self {
            values: self.values.clone(),
        }
    }

    fn clone_from(&mut self, source: &Self) {
        self.values.clone_from(&source.values);
    }
}

impl RegisterStack {
    pub(crate) fn len(&self) -> usize {
        self.values.len()
    }

    pub(crate) fn push(&mut self, value: StackValue) {
        self.values.push(value)
    }

    pub(crate) fn get(&self, index: usize) -> StackValue {
        if let Some(value) = self.values.get(index) {
            *value
        } else {
            StackValue::Nil
        }
    }

    pub(crate) fn get_deref(&self, heap: &Heap, index: usize) -> StackValue {
        self.get(index).get_deref(heap)
    }

    pub(crate) fn get_slice(&mut self, range: Range<usize>) -> &[StackValue] {
        if range.end > self.values.len() {
            self.values.resize_with(range.end, Default::default);
        }

        &self.values[range]
    }

    pub(crate) fn set(&mut self, index: usize, value: StackValue) {
        if self.values.len() <= index {
            self.values.resize(index + 1, Default::default());
        }

        self.values[index] = value;
    }

    pub(crate) fn extend(&mut self, iter: impl IntoIterator<Item = StackValue>) {
        self.values.extend(iter);
    }

    pub(crate) fn insert(&mut self, index: usize, value: StackValue) {
        if self.values.len() < index {
            self.values.resize(index, Default::default());
        }

        self.values.insert(index, value);
    }

    /// Removes `start..len - keep`, sliding the kept tail down to `start`.
    pub(crate) fn chip(&mut self, start: usize, keep: usize) {
        let end = self.len().saturating_sub(keep).max(start);

        if start >= self.values.len() {
            return;
        }

        self.values.drain(start..end);

        debug_assert_eq!(self.len(), start + keep)
    }

    pub(crate) fn copy_within(&mut self, src: Range<usize>, dest: usize) {
        let min_len = if src.start > dest {
            src.end
        } else {
            dest + src.len()
        };

        if self.values.len() < min_len {
            self.values.resize(min_len, Default::default());
        }

        self.values.copy_within(src, dest);
    }

    pub(crate) fn resize(&mut self, len: usize) {
        self.values.resize(len, StackValue::Nil);
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.values.truncate(len);
    }

    pub(crate) fn clear(&mut self) {
        self.values.clear();
    }

    pub(crate) fn iter(&self) -> impl DoubleEndedIterator<Item = &StackValue> {
        self.values.iter()
    }
}

impl std::fmt::Debug for RegisterStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "RegisterStack [")?;

        for value in &self.values {
            writeln!(f, "  {value:?}")?;
        }

        writeln!(f, "]")
    }
}
