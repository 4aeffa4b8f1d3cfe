use super::byte_string::ByteString;
use super::heap::{BytesObjectKey, StorageKey};
use super::value::Value;
use super::value_stack::StackValue;
use super::{FunctionRef, LuaContext, TableRef};
use crate::errors::{ErrorData, FrameKind, LuaError, Traceback, TracebackFrame};
use bitflags::bitflags;
use std::rc::Rc;

bitflags! {
    /// Which events fire the registered hook.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HookMask: u8 {
        const CALL = 1;
        const RET = 1 << 1;
        const LINE = 1 << 2;
        const COUNT = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    Call,
    TailCall,
    Return,
    Line,
    Count,
}

pub(crate) struct HookRegistration {
    /// The hook as a callable stack value, for cheap dispatch.
    pub(crate) function: StackValue,
    /// The same function, rooted so sweeps keep it alive.
    pub(crate) root: FunctionRef,
    pub(crate) mask: HookMask,
    pub(crate) count: u32,
    pub(crate) counter: u32,
    pub(crate) event_names: [BytesObjectKey; 5],
}

impl HookRegistration {
    pub(crate) fn new(
        ctx: &mut LuaContext,
        function: FunctionRef,
        mask: HookMask,
        count: u32,
    ) -> Result<Self, LuaError> {
        let heap = &mut ctx.state.execution_data.heap;

        let event_names = [
            heap.intern_bytes(b"call")?,
            heap.intern_bytes(b"tail call")?,
            heap.intern_bytes(b"return")?,
            heap.intern_bytes(b"line")?,
            heap.intern_bytes(b"count")?,
        ];

        Ok(Self {
            function: function.0.key().into(),
            root: function,
            mask,
            count: count.max(1),
            counter: 0,
            event_names,
        })
    }

    pub(crate) fn event_name(&self, event: HookEvent) -> BytesObjectKey {
        let index = match event {
            HookEvent::Call => 0,
            HookEvent::TailCall => 1,
            HookEvent::Return => 2,
            HookEvent::Line => 3,
            HookEvent::Count => 4,
        };

        self.event_names[index]
    }
}

#[derive(Default)]
pub(crate) struct DebugState {
    pub(crate) hook: Option<HookRegistration>,
    /// Hooks never fire while a hook runs.
    pub(crate) in_hook: bool,
}

/// What the debug surface reports about one live frame.
#[derive(Debug, Clone)]
pub struct FrameInfo {
    pub source: Rc<str>,
    pub current_line: u32,
    pub line_defined: u32,
    pub tail_call: bool,
    pub kind: FrameKind,
}

impl LuaContext<'_> {
    /// Live interpreted frames, innermost first across nested host
    /// re-entries.
    pub fn frame_count(&self) -> usize {
        self.state
            .execution_stack
            .iter()
            .map(|execution| execution.call_stack.len())
            .sum()
    }

    /// The frame `level` steps below the innermost one.
    pub fn frame(&self, level: usize) -> Option<FrameInfo> {
        let call = self.find_frame(level)?;
        let proto = &call.closure.def.proto;

        Some(FrameInfo {
            source: call.closure.def.short_source.clone(),
            current_line: proto.line_at(call.pc.saturating_sub(1)),
            line_defined: proto.line_defined,
            tail_call: call.flags.contains(super::execution::FrameFlags::TAIL),
            kind: call.trace_frame().kind().clone(),
        })
    }

    fn find_frame(&self, level: usize) -> Option<&super::execution::CallContext> {
        self.state
            .execution_stack
            .iter()
            .rev()
            .flat_map(|execution| execution.call_stack.iter().rev())
            .nth(level)
    }

    /// The name the chunk's debug info gives to the local in slot
    /// `index` (1-based) of the frame at `level`.
    pub fn local_name(&self, level: usize, index: usize) -> Option<ByteString> {
        let call = self.find_frame(level)?;
        let proto = &call.closure.def.proto;

        proto
            .local_name(index, call.pc.saturating_sub(1))
            .cloned()
    }

    /// Reads a stack slot of a live frame by 1-based index.
    pub fn frame_local(&mut self, level: usize, index: usize) -> Result<Value, LuaError> {
        if index == 0 {
            return Err(ErrorData::InvalidRef.into());
        }

        let mut located = None;

        for (execution_index, execution) in self.state.execution_stack.iter().enumerate().rev() {
            let from_top = self
                .state
                .execution_stack
                .iter()
                .skip(execution_index + 1)
                .map(|execution| execution.call_stack.len())
                .sum::<usize>();

            let inner_count = execution.call_stack.len();

            if level < from_top + inner_count {
                let call = &execution.call_stack[inner_count - 1 - (level - from_top)];
                located = Some((execution_index, call.register_base + index - 1));
                break;
            }
        }

        let Some((execution_index, slot)) = located else {
            return Err(ErrorData::InvalidRef.into());
        };

        let execution = &self.state.execution_stack[execution_index];
        let value = execution
            .value_stack
            .get_deref(&self.state.execution_data.heap, slot);

        let heap = &mut self.state.execution_data.heap;
        Ok(Value::from_stack_value(heap, value))
    }

    /// Writes a stack slot of a live frame by 1-based index, through a
    /// promoted cell when the slot is captured.
    pub fn set_frame_local(
        &mut self,
        level: usize,
        index: usize,
        value: Value,
    ) -> Result<(), LuaError> {
        if index == 0 {
            return Err(ErrorData::InvalidRef.into());
        }

        value.test_validity(&self.state.execution_data.heap)?;
        let stack_value = value.to_stack_value();

        let mut located = None;

        for (execution_index, execution) in self.state.execution_stack.iter().enumerate().rev() {
            let from_top = self
                .state
                .execution_stack
                .iter()
                .skip(execution_index + 1)
                .map(|execution| execution.call_stack.len())
                .sum::<usize>();

            let inner_count = execution.call_stack.len();

            if level < from_top + inner_count {
                let call = &execution.call_stack[inner_count - 1 - (level - from_top)];
                located = Some((execution_index, call.register_base + index - 1));
                break;
            }
        }

        let Some((execution_index, slot)) = located else {
            return Err(ErrorData::InvalidRef.into());
        };

        let execution = &mut self.state.execution_stack[execution_index];
        let heap = &mut self.state.execution_data.heap;

        if let StackValue::Pointer(cell_key) = execution.value_stack.get(slot) {
            let Some(stored) = heap.get_cell_mut(cell_key) else {
                return Err(ErrorData::InvalidInternalState.into());
            };

            *stored = stack_value;
        } else {
            execution.value_stack.set(slot, stack_value);
        }

        Ok(())
    }

    /// The name and value of a closure's upvalue, 1-based. Native
    /// functions have none.
    pub fn up_value(
        &mut self,
        function: &FunctionRef,
        index: usize,
    ) -> Result<Option<(Option<ByteString>, Value)>, LuaError> {
        if index == 0 {
            return Ok(None);
        }

        let StorageKey::Function(function_key) = function.0.key() else {
            return Ok(None);
        };

        let heap = &mut self.state.execution_data.heap;

        let Some(closure) = heap.get_closure(function_key) else {
            return Err(ErrorData::InvalidRef.into());
        };

        let (name, cell_key) = {
            let proto = &closure.def.proto;

            let Some(cell_key) = closure.up_values.get(index - 1) else {
                return Ok(None);
            };

            let name = proto
                .up_values
                .get(index - 1)
                .and_then(|descriptor| descriptor.name.clone());

            (name, cell_key)
        };

        let Some(value) = heap.get_cell(cell_key).copied() else {
            return Err(ErrorData::InvalidInternalState.into());
        };

        let value = Value::from_stack_value(heap, value);
        Ok(Some((name, value)))
    }

    /// Writes a closure's upvalue cell, 1-based.
    pub fn set_up_value(
        &mut self,
        function: &FunctionRef,
        index: usize,
        value: Value,
    ) -> Result<bool, LuaError> {
        if index == 0 {
            return Ok(false);
        }

        value.test_validity(&self.state.execution_data.heap)?;

        let StorageKey::Function(function_key) = function.0.key() else {
            return Ok(false);
        };

        let heap = &mut self.state.execution_data.heap;

        let Some(closure) = heap.get_closure(function_key) else {
            return Err(ErrorData::InvalidRef.into());
        };

        let Some(cell_key) = closure.up_values.get(index - 1) else {
            return Ok(false);
        };

        let Some(stored) = heap.get_cell_mut(cell_key) else {
            return Err(ErrorData::InvalidInternalState.into());
        };

        *stored = value.to_stack_value();
        Ok(true)
    }

    /// The closure's environment: its first upvalue when the chunk names
    /// it `_ENV`.
    pub fn function_environment(
        &mut self,
        function: &FunctionRef,
    ) -> Result<Option<TableRef>, LuaError> {
        let index = self.env_up_value_index(function)?;

        let Some(index) = index else {
            return Ok(None);
        };

        match self.up_value(function, index)? {
            Some((_, Value::Table(table_ref))) => Ok(Some(table_ref)),
            _ => Ok(None),
        }
    }

    /// Replaces the closure's `_ENV` upvalue.
    pub fn set_function_environment(
        &mut self,
        function: &FunctionRef,
        environment: TableRef,
    ) -> Result<bool, LuaError> {
        let index = self.env_up_value_index(function)?;

        let Some(index) = index else {
            return Ok(false);
        };

        self.set_up_value(function, index, Value::Table(environment))
    }

    fn env_up_value_index(&self, function: &FunctionRef) -> Result<Option<usize>, LuaError> {
        let StorageKey::Function(function_key) = function.0.key() else {
            return Ok(None);
        };

        let heap = &self.state.execution_data.heap;

        let Some(closure) = heap.get_closure(function_key) else {
            return Err(ErrorData::InvalidRef.into());
        };

        let descriptors = &closure.def.proto.up_values;

        for (i, descriptor) in descriptors.iter().enumerate() {
            if let Some(name) = &descriptor.name {
                if name.as_bytes() == b"_ENV" {
                    return Ok(Some(i + 1));
                }
            }
        }

        // chunks stripped of names keep the convention of slot one
        if descriptors.len() == 1 && closure.up_values.len() == 1 {
            return Ok(Some(1));
        }

        Ok(None)
    }

    /// The current live stack as a [`Traceback`], innermost frame
    /// first, skipping `level` frames.
    pub fn capture_traceback(&self, level: usize) -> Traceback {
        let mut traceback = Traceback::default();

        let frames = self
            .state
            .execution_stack
            .iter()
            .rev()
            .flat_map(|execution| execution.call_stack.iter().rev());

        for call in frames.skip(level) {
            traceback.push_frame(call.trace_frame());

            if call.flags.contains(super::execution::FrameFlags::TAIL) {
                traceback.push_frame(TracebackFrame {
                    source: call.closure.def.short_source.clone(),
                    line: 0,
                    kind: FrameKind::Tail,
                });
            }
        }

        traceback
    }

    /// Renders a traceback the way error reports do, with an optional
    /// leading message.
    pub fn traceback(&self, message: Option<&str>, level: usize) -> String {
        let traceback = self.capture_traceback(level);

        match message {
            Some(message) => format!("{message}\n{traceback}"),
            None => traceback.to_string(),
        }
    }
}
