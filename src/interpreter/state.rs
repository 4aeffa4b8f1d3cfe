use super::cache_pools::CachePools;
use super::chunk::{is_binary, Chunk, Compiler};
use super::closure::{Closure, ProtoDef};
use super::coroutine::{Coroutine, ParkedFrame};
use super::debug::{DebugState, HookMask, HookRegistration};
use super::execution::{apply_protection, CallTargetResolved, ExecutionContext};
use super::heap::{CoroutineObjectKey, Heap, StorageKey};
use super::host_fn::{HostFn, HostFrame};
use super::metatable_keys::MetatableKeys;
use super::prototype::{Constant, Prototype};
use super::table::AbsentMetamethods;
use super::tracker::{AllocationTracker, UnlimitedTracker};
use super::value::Value;
use super::value_stack::StackValue;
use super::{
    ByteString, CoroutineRef, FromVarargs, FunctionRef, IntoArgs, StringRef, TableRef, TypeName,
    Varargs,
};
use crate::errors::{ErrorData, LoadError, LuaError};
use crate::FastHashMap;
use downcast::{downcast, Any};
use std::any::TypeId;
use std::rc::Rc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Hard ceilings on runtime growth.
#[derive(Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RuntimeLimits {
    /// Combined register stack budget across nested execution contexts.
    pub stack_size: usize,
    /// Metamethod chain hops before "loop in gettable" and friends.
    pub metatable_chain_depth: usize,
    /// Host re-entries (native code calling back into Lua) at once.
    pub execution_depth: usize,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self {
            stack_size: 1000000,
            metatable_chain_depth: 2000,
            execution_depth: 200,
        }
    }
}

trait AppData: Any {
    fn clone_box(&self) -> Box<dyn AppData>;
}

impl<T: Clone + 'static> AppData for T {
    fn clone_box(&self) -> Box<dyn AppData> {
        Box::new(self.clone())
    }
}

impl Clone for Box<dyn AppData> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

downcast!(dyn AppData);

/// Whether code may park a continuation instead of failing when a
/// yield passes through: `current` answers for the scope running right
/// now, `enclosing` for the one that called it (what the current frame
/// would need for its own suspension to be resumable).
#[derive(Default, Clone, Copy)]
pub(crate) struct SuspendPolicy {
    pub(crate) enclosing: bool,
    pub(crate) current: bool,
}

/// Suspension bookkeeping shared by every thread of a state.
#[derive(Default)]
pub(crate) struct CoroutineData {
    pub(crate) suspend_policy: SuspendPolicy,
    /// Whether the running pausable frame stored state for its next
    /// wake-up; the state itself sits on top of `armed_states`.
    pub(crate) resume_armed: bool,
    pub(crate) armed_states: Vec<Varargs>,
    /// Threads currently on the resume path, outermost first.
    pub(crate) active_coroutines: Vec<CoroutineObjectKey>,
    /// Frames collected while a yield unwinds toward the resume site.
    pub(crate) unwinding_yield: Vec<ParkedFrame>,
    /// One entry per live protected extent, innermost last: `None` for
    /// a plain `pcall`, the handler for an `xpcall`. The innermost
    /// entry decides what happens to an error at its raise site.
    pub(crate) protected_stack: Vec<Option<StackValue>>,
    /// Entries at or below this depth are invisible to raise-site
    /// processing: they belong to scopes beyond the running coroutine
    /// (whose `resume` reports the error itself) or outside the running
    /// error handler (which must not re-enter).
    pub(crate) barrier_floor: usize,
}

/// Everything the interpreter loop reaches through one borrow.
pub(crate) struct ExecutionAccessibleData {
    pub(crate) limits: RuntimeLimits,
    pub(crate) heap: Heap,
    pub(crate) coroutine_data: CoroutineData,
    pub(crate) metatable_keys: Rc<MetatableKeys>,
    pub(crate) cache_pools: Rc<CachePools>,
    pub(crate) tracked_stack_size: usize,
    pub(crate) debug: DebugState,
}

/// One embedded runtime: globals, registry, heap, and the thread
/// machinery. Single threaded and cooperative: at most one Lua thread
/// runs at any instant, and two OS threads must never share a state.
pub struct LuaState {
    pub(crate) execution_data: ExecutionAccessibleData,
    pub(crate) execution_stack: Vec<ExecutionContext>,
    globals: TableRef,
    registry: TableRef,
    compiler: Option<Rc<dyn Compiler>>,
    app_data: FastHashMap<TypeId, Box<dyn AppData>>,
}

impl Default for LuaState {
    fn default() -> Self {
        Self::new()
    }
}

impl LuaState {
    pub fn new() -> Self {
        match Self::with_tracker(Rc::new(UnlimitedTracker)) {
            Ok(state) => state,
            // the unlimited tracker refuses nothing
            Err(_) => unreachable!(),
        }
    }

    /// Builds a state whose allocations are charged to `tracker`. The
    /// only failure is the tracker refusing the state's own bootstrap.
    pub fn with_tracker(tracker: Rc<dyn AllocationTracker>) -> Result<Self, LuaError> {
        let mut heap = Heap::new(tracker);

        let registry_key = heap.create_table(0, 0)?;
        let registry = TableRef(heap.create_ref(registry_key));
        let globals_key = heap.create_table(0, 0)?;
        let globals = TableRef(heap.create_ref(globals_key));

        let metatable_keys = MetatableKeys::new(&mut heap)?;

        Ok(Self {
            execution_data: ExecutionAccessibleData {
                limits: Default::default(),
                heap,
                coroutine_data: Default::default(),
                metatable_keys: Rc::new(metatable_keys),
                cache_pools: Default::default(),
                tracked_stack_size: 0,
                debug: Default::default(),
            },
            execution_stack: Default::default(),
            globals,
            registry,
            compiler: None,
            app_data: Default::default(),
        })
    }

    #[inline]
    pub fn limits(&self) -> &RuntimeLimits {
        &self.execution_data.limits
    }

    #[inline]
    pub fn set_limits(&mut self, limits: RuntimeLimits) {
        self.execution_data.limits = limits;
    }

    /// The `_G` table.
    #[inline]
    pub fn globals(&self) -> TableRef {
        self.globals.clone()
    }

    /// Host-keyed storage, invisible to Lua code.
    #[inline]
    pub fn registry(&self) -> TableRef {
        self.registry.clone()
    }

    #[inline]
    pub fn string_metatable(&self) -> TableRef {
        let heap = &self.execution_data.heap;
        TableRef(heap.string_metatable_ref().clone())
    }

    #[inline]
    pub fn metatable_keys(&self) -> &MetatableKeys {
        &self.execution_data.metatable_keys
    }

    /// Installs the source compiler; without one only binary chunks
    /// load.
    pub fn set_compiler(&mut self, compiler: Rc<dyn Compiler>) {
        self.compiler = Some(compiler);
    }

    pub fn set_app_data<T: Clone + 'static>(&mut self, value: T) -> Option<T> {
        self.app_data
            .insert(TypeId::of::<T>(), Box::new(value))
            .map(|b| *b.downcast::<T>().unwrap())
    }

    pub fn app_data<T: 'static>(&self) -> Option<&T> {
        self.app_data
            .get(&TypeId::of::<T>())
            .map(|b| b.downcast_ref::<T>().unwrap())
    }

    pub fn app_data_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.app_data
            .get_mut(&TypeId::of::<T>())
            .map(|b| b.downcast_mut::<T>().unwrap())
    }

    pub fn remove_app_data<T: 'static>(&mut self) -> Option<T> {
        self.app_data
            .remove(&TypeId::of::<T>())
            .map(|b| *b.downcast::<T>().unwrap())
    }

    #[inline]
    pub fn used_memory(&self) -> usize {
        self.execution_data.heap.used_memory()
    }

    #[inline]
    pub fn context(&mut self) -> LuaContext<'_> {
        LuaContext { state: self }
    }
}

/// How `load` may interpret the bytes it is given, mirroring the
/// `"t"`/`"b"`/`"bt"` mode strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkMode {
    Text,
    Binary,
    #[default]
    Both,
}

/// A borrow of the state that the host and native functions operate
/// through.
pub struct LuaContext<'state> {
    pub(crate) state: &'state mut LuaState,
}

impl LuaContext<'_> {
    #[inline]
    pub fn limits(&self) -> &RuntimeLimits {
        self.state.limits()
    }

    #[inline]
    pub fn set_limits(&mut self, limits: RuntimeLimits) {
        self.state.set_limits(limits);
    }

    #[inline]
    pub fn globals(&self) -> TableRef {
        self.state.globals()
    }

    #[inline]
    pub fn registry(&self) -> TableRef {
        self.state.registry()
    }

    #[inline]
    pub fn string_metatable(&self) -> TableRef {
        self.state.string_metatable()
    }

    #[inline]
    pub fn metatable_keys(&self) -> &MetatableKeys {
        self.state.metatable_keys()
    }

    pub fn type_metatable(&mut self, type_name: TypeName) -> Option<TableRef> {
        let heap = &mut self.state.execution_data.heap;
        let key = heap.type_metatable(type_name)?;
        Some(TableRef(heap.create_ref(key)))
    }

    pub fn set_type_metatable(&mut self, type_name: TypeName, metatable: Option<&TableRef>) {
        let heap = &mut self.state.execution_data.heap;
        heap.set_type_metatable(type_name, metatable.map(|table_ref| table_ref.0.key()));
    }

    #[inline]
    pub fn set_app_data<T: Clone + 'static>(&mut self, value: T) -> Option<T> {
        self.state.set_app_data(value)
    }

    #[inline]
    pub fn app_data<T: 'static>(&self) -> Option<&T> {
        self.state.app_data()
    }

    #[inline]
    pub fn app_data_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.state.app_data_mut()
    }

    #[inline]
    pub fn remove_app_data<T: 'static>(&mut self) -> Option<T> {
        self.state.remove_app_data()
    }

    #[inline]
    pub fn used_memory(&self) -> usize {
        self.state.used_memory()
    }

    pub fn intern_string(&mut self, bytes: &[u8]) -> Result<StringRef, LuaError> {
        let heap = &mut self.state.execution_data.heap;
        let heap_key = heap.intern_bytes(bytes)?;
        Ok(StringRef(heap.create_ref(heap_key)))
    }

    pub fn intern_byte_string(&mut self, bytes: ByteString) -> Result<StringRef, LuaError> {
        let heap = &mut self.state.execution_data.heap;
        let heap_key = heap.intern_byte_string(bytes)?;
        Ok(StringRef(heap.create_ref(heap_key)))
    }

    pub fn create_table(&mut self) -> Result<TableRef, LuaError> {
        self.create_table_with_capacity(0, 0)
    }

    pub fn create_table_with_capacity(
        &mut self,
        list: usize,
        map: usize,
    ) -> Result<TableRef, LuaError> {
        let heap = &mut self.state.execution_data.heap;
        let heap_key = heap.create_table(list, map)?;
        Ok(TableRef(heap.create_ref(heap_key)))
    }

    pub fn create_function(
        &mut self,
        callback: impl Fn(Varargs, &mut LuaContext<'_>) -> Result<Varargs, LuaError>
            + Clone
            + 'static,
    ) -> Result<FunctionRef, LuaError> {
        let heap = &mut self.state.execution_data.heap;
        let key = heap.store_host_fn(HostFn::Plain(Rc::new(callback)))?;

        let heap_ref = heap.create_ref(StorageKey::NativeFunction(key));
        Ok(FunctionRef(heap_ref))
    }

    /// Creates a function that can be resumed if a yield occurs,
    /// allowing coroutine yields within the scope of its calls.
    ///
    /// On a fresh call the arguments arrive as the first tuple value and
    /// the state is empty. After
    /// [`LuaContext::resume_call_with_state`] the function is re-entered
    /// with the result of the call that suspended (or its own completed
    /// result), and the state it stored.
    pub fn create_resumable_function(
        &mut self,
        callback: impl Fn(
                (Result<Varargs, LuaError>, Varargs),
                &mut LuaContext<'_>,
            ) -> Result<Varargs, LuaError>
            + Clone
            + 'static,
    ) -> Result<FunctionRef, LuaError> {
        // the body runs under a small driver loop: as long as it keeps
        // arming resume points but completing its calls without a real
        // suspension, it is fed its own outcome back in
        let body = move |frame: HostFrame, ctx: &mut LuaContext<'_>| {
            let HostFrame {
                mut outcome,
                mut saved,
            } = frame;

            loop {
                let result = callback((outcome, saved), ctx);

                let pause = &mut ctx.state.execution_data.coroutine_data;

                if !pause.resume_armed {
                    return result;
                }

                if let Err(err) = &result {
                    if matches!(err.data, ErrorData::Yield(_)) {
                        // suspending for real: the armed state rides
                        // out in the parked frame, unless nothing above
                        // could ever wake it
                        if !pause.suspend_policy.enclosing {
                            pause.armed_states.pop();
                            pause.resume_armed = false;
                        }

                        return result;
                    }
                }

                pause.resume_armed = false;
                pause.suspend_policy.current = false;

                let Some(next) = pause.armed_states.pop() else {
                    return Err(ErrorData::InvalidInternalState.into());
                };

                outcome = result;
                saved = next;
            }
        };

        let heap = &mut self.state.execution_data.heap;
        let key = heap.store_host_fn(HostFn::Pausable(Rc::new(body)))?;

        let heap_ref = heap.create_ref(StorageKey::NativeFunction(key));
        Ok(FunctionRef(heap_ref))
    }

    /// Whether the calling context can suspend (a coroutine or resumable
    /// function encloses it).
    #[inline]
    pub fn is_yieldable(&self) -> bool {
        self.state.execution_data.coroutine_data.suspend_policy.enclosing
    }

    /// The coroutine currently running, if any.
    #[inline]
    pub fn top_coroutine(&mut self) -> Option<CoroutineRef> {
        let pause = &self.state.execution_data.coroutine_data;
        let key = *pause.active_coroutines.last()?;

        Some(CoroutineRef(self.state.execution_data.heap.create_ref(key)))
    }

    pub fn create_coroutine(&mut self, function: FunctionRef) -> Result<CoroutineRef, LuaError> {
        let function_key = function.0.key();

        let heap = &self.state.execution_data.heap;
        function.test_validity(heap)?;

        let coroutine = Coroutine::new(function_key);

        let heap = &mut self.state.execution_data.heap;
        let heap_key = heap.store_coroutine(coroutine)?;
        let heap_ref = heap.create_ref(heap_key);

        Ok(CoroutineRef(heap_ref))
    }

    /// Stores the values carried to the next wake-up of a function
    /// created by [`LuaContext::create_resumable_function`], and allows
    /// the function to yield when [`LuaContext::is_yieldable`] holds.
    pub fn resume_call_with_state<S: IntoArgs>(&mut self, state: S) -> Result<(), LuaError> {
        let saved = state.into_args(self)?;

        let pause = &mut self.state.execution_data.coroutine_data;

        if pause.resume_armed {
            let Some(slot) = pause.armed_states.last_mut() else {
                return Err(ErrorData::InvalidInternalState.into());
            };

            *slot = saved;
        } else {
            pause.armed_states.push(saved);
            pause.resume_armed = true;
            pause.suspend_policy.current = pause.suspend_policy.enclosing;
        }

        Ok(())
    }

    /// Opens a protected extent: `None` for a plain `pcall`, the error
    /// handler for an `xpcall`. The matching
    /// [`LuaContext::close_protected`] runs when the extent finishes,
    /// on success and failure alike; a suspension parks the entry with
    /// its thread instead.
    pub(crate) fn open_protected(&mut self, handler: Option<Value>) -> Result<(), LuaError> {
        let handler = match handler {
            Some(handler) => {
                handler.test_validity(&self.state.execution_data.heap)?;
                Some(handler.to_stack_value())
            }
            None => None,
        };

        self.state
            .execution_data
            .coroutine_data
            .protected_stack
            .push(handler);

        Ok(())
    }

    pub(crate) fn close_protected(&mut self) {
        self.state
            .execution_data
            .coroutine_data
            .protected_stack
            .pop();
    }

    /// Registers (or clears) the debug hook. The hook function receives
    /// the event name and, for line events, the line number. It may
    /// yield like any other callee.
    pub fn set_hook(
        &mut self,
        function: Option<FunctionRef>,
        mask: HookMask,
        count: u32,
    ) -> Result<(), LuaError> {
        let Some(function) = function else {
            self.state.execution_data.debug.hook = None;
            return Ok(());
        };

        function.test_validity(&self.state.execution_data.heap)?;

        let registration = HookRegistration::new(self, function, mask, count)?;
        self.state.execution_data.debug.hook = Some(registration);
        Ok(())
    }

    pub fn hook(&self) -> Option<(FunctionRef, HookMask, u32)> {
        let hook = self.state.execution_data.debug.hook.as_ref()?;
        Some((hook.root.clone(), hook.mask, hook.count))
    }

    /// Loads a chunk's prototype tree, interning constants and binding
    /// the first upvalue of the main function (`_ENV`) to `env`, or to
    /// the globals table when no environment is given.
    pub fn load_chunk(
        &mut self,
        chunk: &Chunk,
        env: Option<TableRef>,
    ) -> Result<FunctionRef, LuaError> {
        let env_key = env
            .map(|table| table.0.key())
            .unwrap_or_else(|| self.state.globals.0.key());

        let heap = &mut self.state.execution_data.heap;
        let def = load_proto(heap, &chunk.main)?;

        let mut up_values = Vec::with_capacity(chunk.main.up_values.len());

        for (i, _descriptor) in chunk.main.up_values.iter().enumerate() {
            let initial = if i == 0 {
                StackValue::Table(env_key)
            } else {
                StackValue::Nil
            };

            up_values.push(heap.store_cell(initial)?);
        }

        let closure = Closure {
            up_values: up_values.into(),
            def,
        };

        let key = heap.store_closure(closure)?;
        let heap_ref = heap.create_ref(StorageKey::Function(key));

        Ok(FunctionRef(heap_ref))
    }

    /// The `load` entry point: binary chunks undump, text chunks go to
    /// the installed compiler. The outer error is reserved for
    /// uncatchable conditions (an allocation refusal while interning);
    /// the inner one is the `(nil, message)` a script-level `load`
    /// reports.
    pub fn load(
        &mut self,
        source: &[u8],
        chunk_name: &str,
        mode: ChunkMode,
        env: Option<TableRef>,
    ) -> Result<Result<FunctionRef, LoadError>, LuaError> {
        let chunk = if is_binary(source) {
            if mode == ChunkMode::Text {
                return Ok(Err(LoadError::BinaryChunkForbidden));
            }

            match Chunk::load(source) {
                Ok(chunk) => chunk,
                Err(err) => return Ok(Err(err)),
            }
        } else {
            if mode == ChunkMode::Binary {
                return Ok(Err(LoadError::TextChunkForbidden));
            }

            let Some(compiler) = self.state.compiler.clone() else {
                return Ok(Err(LoadError::MissingCompiler));
            };

            match compiler.compile(source, chunk_name) {
                Ok(chunk) => chunk,
                Err(err) => return Ok(Err(err)),
            }
        };

        Ok(Ok(self.load_chunk(&chunk, env)?))
    }

    /// Calls any callable value from the host side.
    pub fn call<A: IntoArgs, R: FromVarargs>(
        &mut self,
        function: &FunctionRef,
        args: A,
    ) -> Result<R, LuaError> {
        self.call_stack_value(function.0.key().into(), args)
    }

    pub(crate) fn call_stack_value<A: IntoArgs, R: FromVarargs>(
        &mut self,
        function_value: StackValue,
        args: A,
    ) -> Result<R, LuaError> {
        let args = args.into_args(self)?;

        // invalid keys stored into the vm would corrupt it
        let heap = &self.state.execution_data.heap;

        for value in args.iter() {
            value.test_validity(heap)?;
        }

        if self.state.execution_stack.len() >= self.state.execution_data.limits.execution_depth {
            return Err(ErrorData::StackOverflow.into());
        }

        let result = match function_value {
            StackValue::NativeFunction(key) => {
                let Some(host_fn) = heap.get_host_fn(key) else {
                    return Err(ErrorData::InvalidRef.into());
                };

                host_fn.clone().invoke(key, args, self)
            }
            StackValue::Function(key) => {
                ExecutionContext::new_function_call(key, args, self.state).and_then(|execution| {
                    self.state.execution_stack.push(execution);
                    ExecutionContext::resume(self.state)
                })
            }
            _ => match ExecutionContext::new_value_call(function_value, args, self.state)? {
                CallTargetResolved::Native(key, args) => {
                    let Some(host_fn) = self.state.execution_data.heap.get_host_fn(key) else {
                        return Err(ErrorData::InvalidRef.into());
                    };

                    host_fn.clone().invoke(key, args, self)
                }
                CallTargetResolved::Execution(execution) => {
                    self.state.execution_stack.push(execution);
                    ExecutionContext::resume(self.state)
                }
            },
        };

        let values = match result {
            Ok(values) => values,
            Err(mut err) => {
                // errors raised without ever entering the interpreter
                // still owe their raise-site barrier a visit
                apply_protection(self.state, &mut err);
                return Err(err);
            }
        };

        R::from_varargs(values, self)
    }

    /// `base[key]` with the full `__index` protocol, from the host side.
    pub(crate) fn table_get(
        &mut self,
        base: StackValue,
        key: StackValue,
    ) -> Result<Value, LuaError> {
        let index_key = self.state.execution_data.metatable_keys.index.0.key();
        let max_chain_depth = self.state.execution_data.limits.metatable_chain_depth;

        let mut current = base;

        for _ in 0..=max_chain_depth {
            let heap = &mut self.state.execution_data.heap;

            let metavalue = match current {
                StackValue::Table(table_key) => {
                    let Some(table) = heap.get_table(table_key) else {
                        return Err(ErrorData::InvalidRef.into());
                    };

                    let value = table.get(key);

                    if value != StackValue::Nil {
                        return Ok(Value::from_stack_value(heap, value));
                    }

                    heap.get_metavalue_fast(current, index_key, AbsentMetamethods::INDEX)
                }
                _ => heap.get_metavalue(current, index_key),
            };

            match metavalue {
                StackValue::Nil => {
                    if matches!(current, StackValue::Table(_)) {
                        return Ok(Value::Nil);
                    }

                    let heap = &self.state.execution_data.heap;
                    return Err(ErrorData::AttemptToIndex(current.type_name(heap)).into());
                }
                StackValue::Function(_) | StackValue::NativeFunction(_) => {
                    let heap = &mut self.state.execution_data.heap;
                    let table_value = Value::from_stack_value(heap, current);
                    let key_value = Value::from_stack_value(heap, key);

                    let result: Varargs =
                        self.call_stack_value(metavalue, (table_value, key_value))?;
                    return Ok(result.first());
                }
                next => current = next,
            }
        }

        Err(ErrorData::IndexChainTooLong.into())
    }

    /// `base[key] = value` with the full `__newindex` protocol, from the
    /// host side.
    pub(crate) fn table_set(
        &mut self,
        base: StackValue,
        key: StackValue,
        value: StackValue,
    ) -> Result<(), LuaError> {
        let newindex_key = self.state.execution_data.metatable_keys.newindex.0.key();
        let max_chain_depth = self.state.execution_data.limits.metatable_chain_depth;

        let mut current = base;

        for _ in 0..=max_chain_depth {
            let heap = &mut self.state.execution_data.heap;

            let metavalue = match current {
                StackValue::Table(table_key) => {
                    let Some(table) = heap.get_table(table_key) else {
                        return Err(ErrorData::InvalidRef.into());
                    };

                    let metavalue = if table.get(key) == StackValue::Nil {
                        heap.get_metavalue_fast(current, newindex_key, AbsentMetamethods::NEWINDEX)
                    } else {
                        StackValue::Nil
                    };

                    if metavalue == StackValue::Nil {
                        super::table::Table::check_key(key)?;

                        let Some(table) = heap.get_table_mut(table_key) else {
                            return Err(ErrorData::InvalidRef.into());
                        };

                        let original_size = table.heap_size();
                        table.set(key, value);
                        let new_size = table.heap_size();
                        heap.settle(original_size, new_size)?;

                        return Ok(());
                    }

                    metavalue
                }
                _ => {
                    let metavalue = heap.get_metavalue(current, newindex_key);

                    if metavalue == StackValue::Nil {
                        return Err(ErrorData::AttemptToIndex(current.type_name(heap)).into());
                    }

                    metavalue
                }
            };

            match metavalue {
                StackValue::Function(_) | StackValue::NativeFunction(_) => {
                    let heap = &mut self.state.execution_data.heap;
                    let table_value = Value::from_stack_value(heap, current);
                    let key_value = Value::from_stack_value(heap, key);
                    let new_value = Value::from_stack_value(heap, value);

                    self.call_stack_value::<_, ()>(
                        metavalue,
                        (table_value, key_value, new_value),
                    )?;
                    return Ok(());
                }
                next => current = next,
            }
        }

        Err(ErrorData::NewIndexChainTooLong.into())
    }

    /// The metatable as Lua observes it: `__metatable` masks the real
    /// one.
    pub fn observed_metatable(&mut self, value: &Value) -> Result<Option<Value>, LuaError> {
        let metatable_key = self.state.execution_data.metatable_keys.metatable.0.key();
        let heap = &mut self.state.execution_data.heap;
        let stack_value = value.to_stack_value();

        let masked = heap.get_metavalue(stack_value, metatable_key);

        if masked != StackValue::Nil {
            return Ok(Some(Value::from_stack_value(heap, masked)));
        }

        let table_key = match stack_value {
            StackValue::Table(key) => heap.get_table_metatable(key),
            _ => heap.type_metatable(value.type_name()),
        };

        Ok(table_key.map(|key| Value::Table(TableRef(heap.create_ref(key)))))
    }

    /// Converts a value the way `tostring` does, honouring `__tostring`
    /// and `__name`.
    pub fn stringify(&mut self, value: Value) -> Result<ByteString, LuaError> {
        let tostring_key = self.state.execution_data.metatable_keys.tostring.0.key();
        let name_key = self.state.execution_data.metatable_keys.name.0.key();
        let heap = &self.state.execution_data.heap;
        let stack_value = value.to_stack_value();

        if let Some(mm) = heap.get_metamethod(stack_value, tostring_key) {
            let result: Value = self.call_stack_value(mm, value)?;

            return match result {
                Value::String(string_ref) => Ok(string_ref.fetch(self)?.clone()),
                other => self.stringify_plain(other),
            };
        }

        // `__name` personalises the fallback rendering
        if let StackValue::Table(_) = stack_value {
            let heap = &self.state.execution_data.heap;

            if let StackValue::Bytes(key) = heap.get_metavalue(stack_value, name_key) {
                let Some(name) = heap.get_bytes(key) else {
                    return Err(ErrorData::InvalidInternalState.into());
                };

                let text = format!("{}: {:#x}", name.to_string_lossy(), id_of(&value));
                return Ok(text.as_str().into());
            }
        }

        self.stringify_plain(value)
    }

    fn stringify_plain(&mut self, value: Value) -> Result<ByteString, LuaError> {
        let text = match &value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => super::number::float_to_string(*n),
            Value::String(string_ref) => {
                return Ok(string_ref.fetch(self)?.clone());
            }
            Value::Table(_) => format!("table: {:#x}", id_of(&value)),
            Value::Function(_) => format!("function: {:#x}", id_of(&value)),
            Value::Coroutine(_) => format!("thread: {:#x}", id_of(&value)),
        };

        Ok(text.as_str().into())
    }

    /// Drops every heap object unreachable from the host's refs, the
    /// registry, the globals, and the live threads. Weak table entries
    /// whose referents died disappear here.
    pub fn sweep(&mut self) {
        super::heap::sweep(self.state);
    }
}

fn id_of(value: &Value) -> u64 {
    match value {
        Value::String(string_ref) => string_ref.id(),
        Value::Table(table_ref) => table_ref.id(),
        Value::Function(function_ref) => function_ref.id(),
        Value::Coroutine(coroutine_ref) => coroutine_ref.id(),
        _ => 0,
    }
}

fn load_proto(heap: &mut Heap, proto: &Rc<Prototype>) -> Result<Rc<ProtoDef>, LuaError> {
    let mut constants = Vec::with_capacity(proto.constants.len());

    for constant in &proto.constants {
        constants.push(match constant {
            Constant::Nil => StackValue::Nil,
            Constant::Bool(b) => StackValue::Bool(*b),
            Constant::Number(n) => StackValue::Number(*n),
            Constant::Bytes(bytes) => StackValue::Bytes(heap.intern_byte_string(bytes.clone())?),
        });
    }

    let mut children = Vec::with_capacity(proto.children.len());

    for child in &proto.children {
        children.push(load_proto(heap, child)?);
    }

    let def = ProtoDef {
        proto: proto.clone(),
        constants: constants.into(),
        children: children.into(),
        short_source: proto.short_source().into(),
    };

    heap.charge(def.heap_size())?;

    Ok(Rc::new(def))
}
