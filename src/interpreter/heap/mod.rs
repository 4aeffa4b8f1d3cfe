mod root;
mod sweep;

pub(crate) use root::{HeapRef, RootWatch};
pub(crate) use sweep::sweep;

use super::byte_string::ByteString;
use super::closure::Closure;
use super::coroutine::Coroutine;
use super::host_fn::HostFn;
use super::table::{AbsentMetamethods, Table};
use super::tracker::AllocationTracker;
use super::value_stack::StackValue;
use super::TypeName;
use crate::errors::ErrorData;
use crate::{BuildFastHasher, FastHashMap};
use indexmap::IndexMap;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Default)]
pub(crate) struct Storage {
    pub(super) cells: slotmap::SlotMap<CellObjectKey, StackValue>,
    pub(super) byte_strings: slotmap::SlotMap<BytesObjectKey, ByteString>,
    pub(super) tables: slotmap::SlotMap<TableObjectKey, Table>,
    pub(super) metatables: slotmap::SecondaryMap<TableObjectKey, TableObjectKey>,
    pub(super) native_functions: slotmap::SlotMap<NativeFnObjectKey, HostFn>,
    pub(super) functions: slotmap::SlotMap<FnObjectKey, Closure>,
    pub(super) coroutines: slotmap::SlotMap<CoroutineObjectKey, Coroutine>,
}

impl Storage {
    pub(crate) const BYTE_STRINGS_TAG: u64 = 0;
    pub(crate) const TABLES_TAG: u64 = 1;
    pub(crate) const NATIVE_FUNCTIONS_TAG: u64 = 2;
    pub(crate) const FUNCTIONS_TAG: u64 = 3;
    pub(crate) const COROUTINES_TAG: u64 = 4;

    pub(crate) fn key_to_id(key: slotmap::KeyData, tag: u64) -> u64 {
        let mask = u32::MAX as u64;
        (key.as_ffi() & mask) | (tag << 32)
    }
}

macro_rules! object_key_struct {
    ($name:ident, $storage_variant:ident, $stack_variant:ident) => {
        slotmap::new_key_type! {
            pub(crate) struct $name;
        }

        impl $name {
            pub(crate) fn as_ffi(self) -> u64 {
                self.0.as_ffi()
            }

            pub(crate) fn from_ffi(n: u64) -> Self {
                Self(slotmap::KeyData::from_ffi(n))
            }
        }

        impl From<$name> for StorageKey {
            fn from(key: $name) -> StorageKey {
                StorageKey::$storage_variant(key)
            }
        }

        impl From<&$name> for StorageKey {
            fn from(key: &$name) -> StorageKey {
                StorageKey::$storage_variant(*key)
            }
        }

        impl From<$name> for StackValue {
            fn from(key: $name) -> StackValue {
                StackValue::$stack_variant(key)
            }
        }
    };
}

object_key_struct!(CellObjectKey, Cell, Pointer);
object_key_struct!(TableObjectKey, Table, Table);
object_key_struct!(BytesObjectKey, Bytes, Bytes);
object_key_struct!(NativeFnObjectKey, NativeFunction, NativeFunction);
object_key_struct!(FnObjectKey, Function, Function);
object_key_struct!(CoroutineObjectKey, Coroutine, Coroutine);

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub(crate) enum StorageKey {
    Cell(CellObjectKey),
    Bytes(BytesObjectKey),
    Table(TableObjectKey),
    NativeFunction(NativeFnObjectKey),
    Function(FnObjectKey),
    Coroutine(CoroutineObjectKey),
}

pub(crate) struct Heap {
    pub(crate) storage: Storage,
    pub(crate) byte_strings: FastHashMap<ByteString, BytesObjectKey>,
    pub(crate) ref_roots: IndexMap<StorageKey, RootWatch, BuildFastHasher>,
    pub(crate) recycled_tables: RefCell<Vec<Table>>,
    string_metatable_ref: HeapRef<TableObjectKey>,
    type_metatables: [Option<HeapRef<TableObjectKey>>; TypeName::COUNT],
    tracker: Rc<dyn AllocationTracker>,
    used_memory: usize,
}

impl Heap {
    pub(crate) fn new(tracker: Rc<dyn AllocationTracker>) -> Self {
        let mut storage = Storage::default();

        let string_metatable: Table = Default::default();
        let string_metatable_key = storage.tables.insert(string_metatable);

        let mut ref_roots = IndexMap::<StorageKey, RootWatch, BuildFastHasher>::default();
        let (string_metatable_ref, watch) = root::new_root(string_metatable_key);
        ref_roots.insert(StorageKey::Table(string_metatable_key), watch);

        Self {
            storage,
            byte_strings: Default::default(),
            ref_roots,
            recycled_tables: Default::default(),
            string_metatable_ref,
            type_metatables: Default::default(),
            tracker,
            used_memory: 0,
        }
    }

    /// Consults the allocation tracker. Refusal is uncatchable.
    pub(crate) fn charge(&mut self, bytes: usize) -> Result<(), ErrorData> {
        if !self.tracker.track(bytes) {
            return Err(ErrorData::AllocationRefused);
        }

        self.used_memory += bytes;
        Ok(())
    }

    pub(crate) fn release(&mut self, bytes: usize) {
        self.tracker.release(bytes);
        self.used_memory = self.used_memory.saturating_sub(bytes);
    }

    /// Settles a size delta after mutating an object in place.
    pub(crate) fn settle(&mut self, original: usize, new: usize) -> Result<(), ErrorData> {
        if new > original {
            self.charge(new - original)
        } else {
            self.release(original - new);
            Ok(())
        }
    }

    pub(crate) fn used_memory(&self) -> usize {
        self.used_memory
    }

    pub(crate) fn string_metatable_ref(&self) -> &HeapRef<TableObjectKey> {
        &self.string_metatable_ref
    }

    pub(crate) fn type_metatable(&self, type_name: TypeName) -> Option<TableObjectKey> {
        if type_name == TypeName::String {
            return Some(self.string_metatable_ref.key());
        }

        self.type_metatables[type_name as usize]
            .as_ref()
            .map(|heap_ref| heap_ref.key())
    }

    pub(crate) fn set_type_metatable(
        &mut self,
        type_name: TypeName,
        table_key: Option<TableObjectKey>,
    ) {
        let heap_ref = table_key.map(|key| self.create_ref(key));
        self.type_metatables[type_name as usize] = heap_ref;
    }

    pub(crate) fn store_cell(&mut self, value: StackValue) -> Result<CellObjectKey, ErrorData> {
        self.charge(std::mem::size_of_val(&value))?;
        Ok(self.storage.cells.insert(value))
    }

    pub(crate) fn create_table(
        &mut self,
        list: usize,
        map: usize,
    ) -> Result<TableObjectKey, ErrorData> {
        let mut table = self.recycled_tables.borrow_mut().pop().unwrap_or_default();

        table.reserve_list(list);
        table.reserve_map(map);

        self.charge(table.heap_size() + std::mem::size_of_val(&table))?;

        Ok(self.storage.tables.insert(table))
    }

    pub(crate) fn store_closure(&mut self, closure: Closure) -> Result<FnObjectKey, ErrorData> {
        self.charge(std::mem::size_of_val(&closure) + closure.heap_size())?;
        Ok(self.storage.functions.insert(closure))
    }

    pub(crate) fn store_host_fn(&mut self, host_fn: HostFn) -> Result<NativeFnObjectKey, ErrorData> {
        self.charge(std::mem::size_of::<HostFn>())?;
        Ok(self.storage.native_functions.insert(host_fn))
    }

    pub(crate) fn store_coroutine(
        &mut self,
        coroutine: Coroutine,
    ) -> Result<CoroutineObjectKey, ErrorData> {
        self.charge(std::mem::size_of_val(&coroutine) + coroutine.heap_size())?;
        Ok(self.storage.coroutines.insert(coroutine))
    }

    pub(crate) fn create_ref<K: Copy + Into<StorageKey>>(&mut self, key: K) -> HeapRef<K> {
        let storage_key = key.into();

        match self.ref_roots.entry(storage_key) {
            indexmap::map::Entry::Occupied(mut entry) => {
                if let Some(heap_ref) = root::join_root(key, entry.get()) {
                    return heap_ref;
                }

                // every earlier handle dropped; watch a fresh guard
                let (heap_ref, watch) = root::new_root(key);
                entry.insert(watch);
                heap_ref
            }
            indexmap::map::Entry::Vacant(entry) => {
                let (heap_ref, watch) = root::new_root(key);
                entry.insert(watch);
                heap_ref
            }
        }
    }

    /// Creates a new string in the heap if it doesn't already exist,
    /// otherwise returns a key to the existing string.
    pub(crate) fn intern_bytes(&mut self, bytes: &[u8]) -> Result<BytesObjectKey, ErrorData> {
        if let Some(&key) = self.byte_strings.get(bytes) {
            return Ok(key);
        }

        let string = ByteString::from(bytes);
        self.charge(string.heap_size() + std::mem::size_of_val(&string))?;

        let key = self.storage.byte_strings.insert(string.clone());
        self.byte_strings.insert(string, key);
        Ok(key)
    }

    pub(crate) fn intern_byte_string(
        &mut self,
        string: ByteString,
    ) -> Result<BytesObjectKey, ErrorData> {
        if let Some(&key) = self.byte_strings.get(string.as_bytes()) {
            return Ok(key);
        }

        self.charge(string.heap_size() + std::mem::size_of_val(&string))?;

        let key = self.storage.byte_strings.insert(string.clone());
        self.byte_strings.insert(string, key);
        Ok(key)
    }

    pub(crate) fn intern_bytes_to_ref(
        &mut self,
        bytes: &[u8],
    ) -> Result<HeapRef<BytesObjectKey>, ErrorData> {
        let key = self.intern_bytes(bytes)?;
        Ok(self.create_ref(key))
    }

    pub(crate) fn get_bytes(&self, key: BytesObjectKey) -> Option<&ByteString> {
        self.storage.byte_strings.get(key)
    }

    pub(crate) fn get_cell(&self, key: CellObjectKey) -> Option<&StackValue> {
        self.storage.cells.get(key)
    }

    pub(crate) fn get_cell_mut(&mut self, key: CellObjectKey) -> Option<&mut StackValue> {
        self.storage.cells.get_mut(key)
    }

    pub(crate) fn get_table(&self, key: TableObjectKey) -> Option<&Table> {
        self.storage.tables.get(key)
    }

    pub(crate) fn get_table_mut(&mut self, key: TableObjectKey) -> Option<&mut Table> {
        self.storage.tables.get_mut(key)
    }

    pub(crate) fn get_closure(&self, key: FnObjectKey) -> Option<&Closure> {
        self.storage.functions.get(key)
    }

    pub(crate) fn get_host_fn(&self, key: NativeFnObjectKey) -> Option<&HostFn> {
        self.storage.native_functions.get(key)
    }

    pub(crate) fn get_coroutine(&self, key: CoroutineObjectKey) -> Option<&Coroutine> {
        self.storage.coroutines.get(key)
    }

    pub(crate) fn get_coroutine_mut(&mut self, key: CoroutineObjectKey) -> Option<&mut Coroutine> {
        self.storage.coroutines.get_mut(key)
    }

    pub(crate) fn get_table_metatable(&self, key: TableObjectKey) -> Option<TableObjectKey> {
        self.storage.metatables.get(key).cloned()
    }

    pub(crate) fn set_table_metatable(
        &mut self,
        table_key: TableObjectKey,
        metatable_key: Option<TableObjectKey>,
    ) {
        // the previous metatable's absence cache may describe this table
        if let Some(metatable_key) = self.storage.metatables.get(table_key) {
            if let Some(metatable) = self.storage.tables.get(*metatable_key) {
                metatable.flags.set(Default::default());
            }
        }

        match metatable_key {
            Some(metatable_key) => {
                self.storage.metatables.insert(table_key, metatable_key);
            }
            None => {
                self.storage.metatables.remove(table_key);
            }
        }
    }

    fn metatable_key_for(&self, value: StackValue) -> Option<TableObjectKey> {
        match value {
            StackValue::Table(key) => self.storage.metatables.get(key).cloned(),
            StackValue::Bytes(_) => Some(self.string_metatable_ref.key()),
            _ => self.type_metatable(value.type_name(self)),
        }
    }

    pub(crate) fn get_metavalue(&self, value: StackValue, name: BytesObjectKey) -> StackValue {
        let Some(metatable_key) = self.metatable_key_for(value) else {
            return StackValue::Nil;
        };

        let Some(metatable) = self.storage.tables.get(metatable_key) else {
            crate::debug_unreachable!();
            #[cfg(not(debug_assertions))]
            return StackValue::Nil;
        };

        metatable.get_from_map(StackValue::Bytes(name))
    }

    /// [`Heap::get_metavalue`] with the metatable's absence cache
    /// consulted and updated for the given flag.
    pub(crate) fn get_metavalue_fast(
        &self,
        value: StackValue,
        name: BytesObjectKey,
        flag: AbsentMetamethods,
    ) -> StackValue {
        let Some(metatable_key) = self.metatable_key_for(value) else {
            return StackValue::Nil;
        };

        let Some(metatable) = self.storage.tables.get(metatable_key) else {
            crate::debug_unreachable!();
            #[cfg(not(debug_assertions))]
            return StackValue::Nil;
        };

        if metatable.flags.get().contains(flag) {
            return StackValue::Nil;
        }

        let metavalue = metatable.get_from_map(StackValue::Bytes(name));

        if metavalue == StackValue::Nil {
            metatable.flags.set(metatable.flags.get() | flag);
        }

        metavalue
    }

    pub(crate) fn get_metamethod(
        &self,
        value: StackValue,
        name: BytesObjectKey,
    ) -> Option<StackValue> {
        filter_callable(self.get_metavalue(value, name))
    }

    pub(crate) fn get_metamethod_fast(
        &self,
        value: StackValue,
        name: BytesObjectKey,
        flag: AbsentMetamethods,
    ) -> Option<StackValue> {
        filter_callable(self.get_metavalue_fast(value, name, flag))
    }
}

fn filter_callable(value: StackValue) -> Option<StackValue> {
    if !matches!(
        value,
        StackValue::Function(_) | StackValue::NativeFunction(_)
    ) {
        return None;
    }

    Some(value)
}
