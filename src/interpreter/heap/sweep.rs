//! Reachability collection, run from [`LuaContext::sweep`]: a full
//! mark starting at the host's refs and the live threads, an ephemeron
//! pass for weak-keyed tables, entry clearing per `__mode`, then a sweep
//! of every storage class.
//!
//! [`LuaContext::sweep`]: crate::interpreter::LuaContext::sweep

use super::{BytesObjectKey, Heap, StorageKey, TableObjectKey};
use crate::interpreter::closure::ProtoDef;
use crate::interpreter::coroutine::Continuation;
use crate::interpreter::execution::ExecutionContext;
use crate::interpreter::state::LuaState;
use crate::interpreter::table::Table;
use crate::interpreter::value_stack::StackValue;
use crate::FastHashSet;

#[derive(Default)]
struct Marker {
    marked: FastHashSet<StorageKey>,
    queue: Vec<StorageKey>,
    visited_defs: FastHashSet<usize>,
    /// (table, weak keys, weak values)
    weak_tables: Vec<(TableObjectKey, bool, bool)>,
}

impl Marker {
    fn mark(&mut self, key: StorageKey) {
        if self.marked.insert(key) {
            self.queue.push(key);
        }
    }

    fn mark_value(&mut self, value: StackValue) {
        if let Some(key) = value.as_storage_key() {
            self.mark(key);
        }
    }

    fn is_live(&self, value: StackValue) -> bool {
        match value.as_storage_key() {
            Some(key) => self.marked.contains(&key),
            None => true,
        }
    }
}

pub(crate) fn sweep(state: &mut LuaState) {
    let exec_data = &mut state.execution_data;
    let heap = &mut exec_data.heap;

    // host handles dropped on the Rust side stop being roots here
    heap.ref_roots.retain(|_, watch| watch.is_held());

    let mut marker = Marker::default();
    let mode_key = exec_data.metatable_keys.mode.0.key();

    for key in heap.ref_roots.keys() {
        marker.mark(*key);
    }

    marker.mark(StorageKey::Table(heap.string_metatable_ref().key()));

    for execution in &state.execution_stack {
        trace_execution(&mut marker, execution);
    }

    let pause = &exec_data.coroutine_data;

    for parked in &pause.unwinding_yield {
        trace_continuation(&mut marker, &parked.continuation);
    }

    for varargs in &pause.armed_states {
        for value in varargs.iter() {
            marker.mark_value(value.to_stack_value());
        }
    }

    for barrier in pause.protected_stack.iter().flatten() {
        marker.mark_value(*barrier);
    }

    for key in &pause.active_coroutines {
        marker.mark(StorageKey::Coroutine(*key));
    }

    if let Some(hook) = &exec_data.debug.hook {
        marker.mark_value(hook.function);

        for key in hook.event_names {
            marker.mark(StorageKey::Bytes(key));
        }
    }

    propagate(&mut marker, heap, mode_key);

    // ephemeron pass: a weak-keyed entry's value lives only while its
    // key does, and marking a value can resurrect further keys
    loop {
        let mut changed = false;

        for i in 0..marker.weak_tables.len() {
            let (table_key, weak_keys, weak_values) = marker.weak_tables[i];

            if !weak_keys || weak_values {
                continue;
            }

            let Some(table) = heap.get_table(table_key) else {
                continue;
            };

            for (map_key, value) in table.map.iter() {
                let key_value = StackValue::from(map_key);

                if marker.is_live(key_value) && !marker.is_live(*value) {
                    marker.mark_value(*value);
                    changed = true;
                }
            }
        }

        if !changed {
            break;
        }

        propagate(&mut marker, heap, mode_key);
    }

    clear_weak_entries(&marker, heap);
    drop_dead(&marker, heap);
}

fn trace_execution(marker: &mut Marker, execution: &ExecutionContext) {
    for value in execution.value_stack.iter() {
        marker.mark_value(*value);
    }

    for call in &execution.call_stack {
        marker.mark(StorageKey::Function(call.closure_key));

        for cell_key in call.closure.up_values.iter() {
            marker.mark(StorageKey::Cell(*cell_key));
        }

        trace_def(marker, &call.closure.def);
    }
}

fn trace_continuation(marker: &mut Marker, continuation: &Continuation) {
    match continuation {
        Continuation::Start(key) => marker.mark(*key),
        Continuation::Host { function, saved } => {
            marker.mark(StorageKey::NativeFunction(*function));

            for value in saved.iter() {
                marker.mark_value(value.to_stack_value());
            }
        }
        Continuation::Frames { execution, .. } => trace_execution(marker, execution),
    }
}

fn trace_def(marker: &mut Marker, def: &ProtoDef) {
    if !marker.visited_defs.insert(std::ptr::from_ref(def) as usize) {
        return;
    }

    for constant in def.constants.iter() {
        marker.mark_value(*constant);
    }

    for child in def.children.iter() {
        trace_def(marker, child);
    }
}

fn propagate(marker: &mut Marker, heap: &Heap, mode_key: BytesObjectKey) {
    while let Some(key) = marker.queue.pop() {
        match key {
            StorageKey::Table(table_key) => {
                let Some(table) = heap.get_table(table_key) else {
                    continue;
                };

                if let Some(metatable_key) = heap.get_table_metatable(table_key) {
                    marker.mark(StorageKey::Table(metatable_key));
                }

                let (weak_keys, weak_values) = weak_mode(heap, table_key, mode_key);

                if weak_keys || weak_values {
                    marker.weak_tables.push((table_key, weak_keys, weak_values));
                }

                if !weak_values {
                    // list keys are integers, so these values are held
                    // regardless of key weakness
                    for value in &table.list {
                        marker.mark_value(*value);
                    }
                }

                for (map_key, value) in table.map.iter() {
                    if !weak_keys {
                        marker.mark_value(StackValue::from(map_key));
                    }

                    // under weak keys the ephemeron pass marks a value
                    // only once its key proves live
                    if !weak_values && !weak_keys {
                        marker.mark_value(*value);
                    }
                }
            }
            StorageKey::Function(function_key) => {
                let Some(closure) = heap.get_closure(function_key) else {
                    continue;
                };

                for cell_key in closure.up_values.iter() {
                    marker.mark(StorageKey::Cell(*cell_key));
                }

                trace_def(marker, &closure.def);
            }
            StorageKey::Coroutine(coroutine_key) => {
                let Some(coroutine) = heap.get_coroutine(coroutine_key) else {
                    continue;
                };

                for parked in &coroutine.suspended {
                    trace_continuation(marker, &parked.continuation);
                }

                for barrier in coroutine.parked_barriers.iter().flatten() {
                    marker.mark_value(*barrier);
                }
            }
            StorageKey::Cell(cell_key) => {
                if let Some(value) = heap.get_cell(cell_key) {
                    marker.mark_value(*value);
                }
            }
            StorageKey::Bytes(_) | StorageKey::NativeFunction(_) => {}
        }
    }
}

fn weak_mode(heap: &Heap, table_key: TableObjectKey, mode_key: BytesObjectKey) -> (bool, bool) {
    let mode = heap.get_metavalue(StackValue::Table(table_key), mode_key);

    let StackValue::Bytes(bytes_key) = mode else {
        return (false, false);
    };

    let Some(bytes) = heap.get_bytes(bytes_key) else {
        return (false, false);
    };

    let bytes = bytes.as_bytes();
    (bytes.contains(&b'k'), bytes.contains(&b'v'))
}

/// Removes entries whose weak half died, from the tables that survive.
fn clear_weak_entries(marker: &Marker, heap: &mut Heap) {
    let mut freed = 0usize;

    for &(table_key, weak_keys, weak_values) in &marker.weak_tables {
        if !marker.marked.contains(&StorageKey::Table(table_key)) {
            continue;
        }

        let Some(table) = heap.storage.tables.get_mut(table_key) else {
            continue;
        };

        let original_size = table.heap_size();

        if weak_values {
            for value in table.list.iter_mut() {
                if !marker.is_live(*value) {
                    *value = StackValue::Nil;
                }
            }

            while table.list.last() == Some(&StackValue::Nil) {
                table.list.pop();
            }
        }

        table.map.retain(|map_key, value| {
            let key_live = !weak_keys || marker.is_live(StackValue::from(&*map_key));
            let value_live = !weak_values || marker.is_live(*value);
            key_live && value_live
        });

        freed += original_size.saturating_sub(table.heap_size());
    }

    heap.release(freed);
}

fn drop_dead(marker: &Marker, heap: &mut Heap) {
    let marked = &marker.marked;
    let mut freed = 0usize;

    let dead_tables: Vec<_> = heap
        .storage
        .tables
        .keys()
        .filter(|key| !marked.contains(&StorageKey::Table(*key)))
        .collect();

    for key in dead_tables {
        if let Some(mut table) = heap.storage.tables.remove(key) {
            freed += table.heap_size() + std::mem::size_of::<Table>();
            table.clear();
            heap.recycled_tables.borrow_mut().push(table);
        }

        heap.storage.metatables.remove(key);
    }

    heap.storage.metatables.retain(|key, metatable_key| {
        marked.contains(&StorageKey::Table(key))
            && marked.contains(&StorageKey::Table(*metatable_key))
    });

    heap.storage.byte_strings.retain(|key, bytes| {
        let keep = marked.contains(&StorageKey::Bytes(key));

        if !keep {
            freed += bytes.heap_size() + std::mem::size_of_val(bytes);
        }

        keep
    });

    heap.byte_strings
        .retain(|_, key| marked.contains(&StorageKey::Bytes(*key)));

    heap.storage.cells.retain(|key, value| {
        let keep = marked.contains(&StorageKey::Cell(key));

        if !keep {
            freed += std::mem::size_of_val(value);
        }

        keep
    });

    heap.storage.functions.retain(|key, closure| {
        let keep = marked.contains(&StorageKey::Function(key));

        if !keep {
            freed += closure.heap_size() + std::mem::size_of::<crate::interpreter::closure::Closure>();
        }

        keep
    });

    heap.storage.native_functions.retain(|key, function| {
        let keep = marked.contains(&StorageKey::NativeFunction(key));

        if !keep {
            freed += std::mem::size_of_val(function);
        }

        keep
    });

    heap.storage.coroutines.retain(|key, coroutine| {
        let keep = marked.contains(&StorageKey::Coroutine(key));

        if !keep {
            freed += coroutine.heap_size() + std::mem::size_of_val(coroutine);
        }

        keep
    });

    heap.release(freed);
}
