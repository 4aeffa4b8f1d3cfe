use super::closure::Closure;
use super::coroutine::{Continuation, ParkedFrame};
use super::debug::{HookEvent, HookMask};
use super::heap::{BytesObjectKey, FnObjectKey, Heap, NativeFnObjectKey};
use super::instruction::{fb2int, Instruction, OpCode};
use super::number::{float_to_string, parse_number};
use super::state::{ExecutionAccessibleData, LuaState, SuspendPolicy};
use super::table::{AbsentMetamethods, Table};
use super::value::Value;
use super::value_stack::{RegisterStack, StackValue};
use super::vararg::Varargs;
use super::TypeName;
use crate::errors::{ErrorData, FrameKind, IllegalBytecode, LuaError, TracebackFrame};
use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct FrameFlags: u8 {
        /// The frame was reused by a tail call; the original caller is
        /// gone from the stack.
        const TAIL = 1;
        /// No instruction has run yet; the call hook is still owed.
        const FRESH = 1 << 1;
        /// A hook already fired for the current pc; a resume landing on
        /// the same instruction must not fire it again.
        const HOOKED = 1 << 2;
    }
}

/// Where a callee's results land when it finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetTarget {
    /// Out of the execution context, to the host or resume site.
    Entry,
    /// A CALL window: results land at the caller's R(a).
    Call { a: u32, expected: Option<u8> },
    /// One result into the caller's R(dest) (metamethod reads).
    Dest { dest: u32 },
    /// The result drives a comparison skip in the caller.
    CmpSkip { expected: bool, negate: bool },
    /// The result continues a concat fold: land in R(dest), keep folding
    /// down to R(b), final value to R(a).
    Concat { a: u32, b: u32, dest: u32 },
    /// Results are dropped (`__newindex`, for one).
    Discard,
    /// Results are dropped and the hook guard is released.
    Hook,
}

/// A callee window prepared on the stack: the function value at
/// `stack_start`, arguments following it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingCall {
    pub(crate) stack_start: usize,
    pub(crate) arg_count: usize,
    pub(crate) target: RetTarget,
    pub(crate) tail: bool,
}

enum CallResult {
    Call(PendingCall),
    Return { first: usize, count: Option<usize> },
}

/// The frames and registers of one entry into the interpreter. A state
/// usually has one; each host re-entry (a native function calling back
/// into Lua) pushes another.
pub(crate) struct ExecutionContext {
    pub(crate) call_stack: Vec<CallContext>,
    pub(crate) value_stack: RegisterStack,
}

/// One interpreted activation: a window of the value stack plus the
/// position inside the function's code.
pub(crate) struct CallContext {
    pub(crate) closure: Closure,
    pub(crate) closure_key: FnObjectKey,
    pub(crate) pc: usize,
    /// Absolute index of the function slot; arguments follow it.
    pub(crate) stack_start: usize,
    /// Absolute index of register zero.
    pub(crate) register_base: usize,
    pub(crate) target: RetTarget,
    pub(crate) flags: FrameFlags,
    /// One past the last live register, for instructions that operate
    /// "to the top".
    pub(crate) top: usize,
    pub(crate) last_line: u32,
    /// A call produced outside the fetch loop (concat continuations).
    pub(crate) pending: Option<PendingCall>,
}

/// Batch size of one SETLIST flush.
const SET_LIST_BATCH: usize = 50;

enum CompareOp {
    Lt,
    Le,
}

#[derive(Clone, Copy)]
enum ArithEvent {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

impl ArithEvent {
    fn key(self, exec_data: &ExecutionAccessibleData) -> BytesObjectKey {
        let keys = &exec_data.metatable_keys;

        match self {
            ArithEvent::Add => keys.add.0.key(),
            ArithEvent::Sub => keys.sub.0.key(),
            ArithEvent::Mul => keys.mul.0.key(),
            ArithEvent::Div => keys.div.0.key(),
            ArithEvent::Mod => keys.modulus.0.key(),
            ArithEvent::Pow => keys.pow.0.key(),
        }
    }
}

impl CallContext {
    /// Lays out a frame for `closure` over a window whose function slot
    /// is `stack_start`, with `arg_count` arguments after it.
    fn enter(
        closure: Closure,
        closure_key: FnObjectKey,
        stack_start: usize,
        arg_count: usize,
        target: RetTarget,
        flags: FrameFlags,
        stack: &mut RegisterStack,
    ) -> Self {
        let proto = &closure.def.proto;
        let param_count = proto.param_count as usize;
        let max_stack = proto.max_stack_size as usize;

        // leftovers above the arguments must not read as registers
        stack.truncate(stack_start + 1 + arg_count);

        let register_base = if proto.is_vararg {
            // fixed parameters move above the vararg section
            let register_base = stack_start + 1 + arg_count;

            for i in 0..param_count {
                let arg_index = stack_start + 1 + i;
                let value = if i < arg_count {
                    let value = stack.get(arg_index);
                    stack.set(arg_index, StackValue::Nil);
                    value
                } else {
                    StackValue::Nil
                };

                stack.set(register_base + i, value);
            }

            register_base
        } else {
            let register_base = stack_start + 1;

            for i in arg_count..param_count {
                stack.set(register_base + i, StackValue::Nil);
            }

            register_base
        };

        Self {
            closure,
            closure_key,
            pc: 0,
            stack_start,
            register_base,
            target,
            flags: flags | FrameFlags::FRESH,
            top: register_base + max_stack,
            last_line: 0,
            pending: None,
        }
    }

    pub(crate) fn vararg_window(&self) -> (usize, usize) {
        let proto = &self.closure.def.proto;
        let start = self.stack_start + 1 + proto.param_count as usize;
        (start, self.register_base.saturating_sub(start))
    }

    #[inline]
    fn rget(&self, stack: &RegisterStack, heap: &Heap, r: u32) -> StackValue {
        stack.get_deref(heap, self.register_base + r as usize)
    }

    /// Register writes go through promoted cells, so closures observe
    /// assignments to the locals they captured.
    fn rset(&self, stack: &mut RegisterStack, heap: &mut Heap, r: u32, value: StackValue) {
        let index = self.register_base + r as usize;

        if let StackValue::Pointer(key) = stack.get(index) {
            if let Some(stored) = heap.get_cell_mut(key) {
                *stored = value;
                return;
            }

            crate::debug_unreachable!();
        }

        stack.set(index, value);
    }

    fn kst(&self, index: u32) -> Result<StackValue, IllegalBytecode> {
        self.closure
            .def
            .constant(index as usize)
            .ok_or(IllegalBytecode::MissingConstant(index))
    }

    /// An RK operand: a constant when the high bit is set, a register
    /// otherwise.
    fn rk(
        &self,
        stack: &RegisterStack,
        heap: &Heap,
        operand: u32,
    ) -> Result<StackValue, IllegalBytecode> {
        if operand & Instruction::BIT_RK != 0 {
            self.kst(operand & Instruction::MAX_INDEX_RK)
        } else {
            Ok(self.rget(stack, heap, operand))
        }
    }

    /// Un-promotes every captured register at or above `from`
    /// (frame-relative). The cell keeps the value for the closures
    /// holding it; the register becomes a plain value again, so the next
    /// capture starts a fresh cell.
    fn close_up_values(&self, stack: &mut RegisterStack, heap: &Heap, from: u32) {
        let start = self.register_base + from as usize;

        for index in start..stack.len() {
            if let StackValue::Pointer(key) = stack.get(index) {
                let value = heap.get_cell(key).copied().unwrap_or_default();
                stack.set(index, value);
            }
        }
    }

    fn line_at(&self, pc: usize) -> u32 {
        self.closure.def.proto.line_at(pc)
    }

    pub(crate) fn trace_frame(&self) -> TracebackFrame {
        let def = &self.closure.def;
        let pc = self.pc.saturating_sub(1);

        let kind = if def.proto.line_defined == 0 {
            FrameKind::Main
        } else {
            FrameKind::Lua {
                line_defined: def.proto.line_defined,
            }
        };

        TracebackFrame {
            source: def.short_source.clone(),
            line: self.line_at(pc),
            kind,
        }
    }

    /// Builds a pending call above the live registers.
    fn push_call(
        &self,
        stack: &mut RegisterStack,
        function: StackValue,
        args: &[StackValue],
        target: RetTarget,
    ) -> PendingCall {
        let stack_start = stack.len().max(self.top);

        stack.set(stack_start, function);
        for (i, value) in args.iter().enumerate() {
            stack.set(stack_start + 1 + i, *value);
        }

        PendingCall {
            stack_start,
            arg_count: args.len(),
            target,
            tail: false,
        }
    }

    fn jump(&mut self, sbx: i32) -> Result<(), ErrorData> {
        let target = self.pc as i64 + sbx as i64;
        let code_len = self.closure.def.proto.code.len() as i64;

        if target < 0 || target > code_len {
            return Err(IllegalBytecode::PcOutOfBounds(target.max(0) as u32).into());
        }

        self.pc = target as usize;
        Ok(())
    }

    fn take_extra_arg(&mut self) -> Result<u32, ErrorData> {
        let code = &self.closure.def.proto.code;

        let Some(extra) = code.get(self.pc) else {
            return Err(IllegalBytecode::MissingExtraArg.into());
        };

        if extra.opcode()? != OpCode::ExtraArg {
            return Err(IllegalBytecode::MissingExtraArg.into());
        }

        self.pc += 1;
        Ok(extra.ax())
    }

    fn up_value_get(&self, heap: &Heap, index: u32) -> Result<StackValue, ErrorData> {
        let Some(cell_key) = self.closure.up_values.get(index as usize) else {
            return Err(IllegalBytecode::MissingUpValue(index as u8).into());
        };

        let Some(value) = heap.get_cell(cell_key) else {
            return Err(ErrorData::InvalidInternalState);
        };

        Ok(*value)
    }

    fn up_value_set(
        &self,
        heap: &mut Heap,
        index: u32,
        value: StackValue,
    ) -> Result<(), ErrorData> {
        let Some(cell_key) = self.closure.up_values.get(index as usize) else {
            return Err(IllegalBytecode::MissingUpValue(index as u8).into());
        };

        let Some(stored) = heap.get_cell_mut(cell_key) else {
            return Err(ErrorData::InvalidInternalState);
        };

        *stored = value;
        Ok(())
    }

    fn for_number(
        &self,
        stack: &RegisterStack,
        heap: &Heap,
        r: u32,
        make_error: fn(TypeName) -> ErrorData,
    ) -> Result<f64, ErrorData> {
        let value = self.rget(stack, heap, r);

        coerce_number(heap, value).ok_or_else(|| make_error(value.type_name(heap)))
    }

    /// Picks the hook owed before the instruction at `pc`, if any. One
    /// hook fires per instruction; a count hit takes precedence over a
    /// line transition.
    fn hook_event(
        &mut self,
        exec_data: &mut ExecutionAccessibleData,
    ) -> Option<HookEvent> {
        let debug = &mut exec_data.debug;

        if debug.in_hook || self.flags.contains(FrameFlags::HOOKED) {
            return None;
        }

        let hook = debug.hook.as_mut()?;

        if self.flags.contains(FrameFlags::FRESH) && hook.mask.contains(HookMask::CALL) {
            return Some(if self.flags.contains(FrameFlags::TAIL) {
                HookEvent::TailCall
            } else {
                HookEvent::Call
            });
        }

        let at_return = self
            .closure
            .def
            .proto
            .code
            .get(self.pc)
            .map(|instruction| {
                matches!(instruction.opcode(), Ok(OpCode::Return | OpCode::TailCall))
            })
            .unwrap_or_default();

        if at_return && hook.mask.contains(HookMask::RET) {
            return Some(HookEvent::Return);
        }

        if hook.mask.contains(HookMask::COUNT) {
            hook.counter += 1;

            if hook.counter >= hook.count {
                hook.counter = 0;
                return Some(HookEvent::Count);
            }
        }

        if hook.mask.contains(HookMask::LINE) {
            let line = self.line_at(self.pc);

            if line != self.last_line {
                self.last_line = line;
                return Some(HookEvent::Line);
            }
        }

        None
    }

    fn step(
        &mut self,
        stack: &mut RegisterStack,
        exec_data: &mut ExecutionAccessibleData,
    ) -> Result<CallResult, ErrorData> {
        if let Some(pending) = self.pending.take() {
            return Ok(CallResult::Call(pending));
        }

        loop {
            if exec_data.tracked_stack_size + stack.len() > exec_data.limits.stack_size {
                return Err(ErrorData::StackOverflow);
            }

            let Some(&instruction) = self.closure.def.proto.code.get(self.pc) else {
                // chunks normally end on RETURN; running off the end
                // returns nothing
                return Ok(CallResult::Return {
                    first: self.register_base,
                    count: Some(0),
                });
            };

            if let Some(event) = self.hook_event(exec_data) {
                let Some(hook) = &exec_data.debug.hook else {
                    crate::debug_unreachable!();
                    #[cfg(not(debug_assertions))]
                    continue;
                };

                let function = hook.function;
                let name = StackValue::Bytes(hook.event_name(event));
                let line = match event {
                    HookEvent::Line => StackValue::Number(self.line_at(self.pc) as f64),
                    _ => StackValue::Nil,
                };

                self.flags.insert(FrameFlags::HOOKED);
                exec_data.debug.in_hook = true;

                let pending = self.push_call(stack, function, &[name, line], RetTarget::Hook);
                return Ok(CallResult::Call(pending));
            }

            self.flags.remove(FrameFlags::HOOKED | FrameFlags::FRESH);
            self.pc += 1;

            let op = instruction.opcode()?;
            let a = instruction.a() as u32;

            match op {
                OpCode::Move => {
                    let heap = &mut exec_data.heap;
                    let value = self.rget(stack, heap, instruction.b());
                    self.rset(stack, heap, a, value);
                }
                OpCode::LoadK => {
                    let value = self.kst(instruction.bx())?;
                    self.rset(stack, &mut exec_data.heap, a, value);
                }
                OpCode::LoadKx => {
                    let extra = self.take_extra_arg()?;
                    let value = self.kst(extra)?;
                    self.rset(stack, &mut exec_data.heap, a, value);
                }
                OpCode::LoadBool => {
                    let value = StackValue::Bool(instruction.b() != 0);
                    self.rset(stack, &mut exec_data.heap, a, value);

                    if instruction.c() != 0 {
                        self.pc += 1;
                    }
                }
                OpCode::LoadNil => {
                    let heap = &mut exec_data.heap;

                    for i in 0..=instruction.b() {
                        self.rset(stack, heap, a + i, StackValue::Nil);
                    }
                }
                OpCode::GetUpval => {
                    let heap = &mut exec_data.heap;
                    let value = self.up_value_get(heap, instruction.b())?;
                    self.rset(stack, heap, a, value);
                }
                OpCode::SetUpval => {
                    let heap = &mut exec_data.heap;
                    let value = self.rget(stack, heap, a);
                    self.up_value_set(heap, instruction.b(), value)?;
                }
                OpCode::GetTabUp => {
                    let base = self.up_value_get(&exec_data.heap, instruction.b())?;
                    let key = self.rk(stack, &exec_data.heap, instruction.c())?;

                    if let Some(pending) = self.table_read(stack, exec_data, a, base, key)? {
                        return Ok(CallResult::Call(pending));
                    }
                }
                OpCode::GetTable => {
                    let base = self.rget(stack, &exec_data.heap, instruction.b());
                    let key = self.rk(stack, &exec_data.heap, instruction.c())?;

                    if let Some(pending) = self.table_read(stack, exec_data, a, base, key)? {
                        return Ok(CallResult::Call(pending));
                    }
                }
                OpCode::SetTabUp => {
                    let base = self.up_value_get(&exec_data.heap, a)?;
                    let key = self.rk(stack, &exec_data.heap, instruction.b())?;
                    let value = self.rk(stack, &exec_data.heap, instruction.c())?;

                    if let Some(pending) = self.table_write(stack, exec_data, base, key, value)? {
                        return Ok(CallResult::Call(pending));
                    }
                }
                OpCode::SetTable => {
                    let base = self.rget(stack, &exec_data.heap, a);
                    let key = self.rk(stack, &exec_data.heap, instruction.b())?;
                    let value = self.rk(stack, &exec_data.heap, instruction.c())?;

                    if let Some(pending) = self.table_write(stack, exec_data, base, key, value)? {
                        return Ok(CallResult::Call(pending));
                    }
                }
                OpCode::NewTable => {
                    let heap = &mut exec_data.heap;
                    let list_hint = fb2int(instruction.b());
                    let map_hint = fb2int(instruction.c());
                    let table_key = heap.create_table(list_hint, map_hint)?;
                    self.rset(stack, heap, a, StackValue::Table(table_key));
                }
                OpCode::SelfOp => {
                    let base = self.rget(stack, &exec_data.heap, instruction.b());
                    let key = self.rk(stack, &exec_data.heap, instruction.c())?;

                    self.rset(stack, &mut exec_data.heap, a + 1, base);

                    if let Some(pending) = self.table_read(stack, exec_data, a, base, key)? {
                        return Ok(CallResult::Call(pending));
                    }
                }
                OpCode::Add => {
                    if let Some(pending) =
                        self.arith(stack, exec_data, instruction, |x, y| x + y, ArithEvent::Add)?
                    {
                        return Ok(CallResult::Call(pending));
                    }
                }
                OpCode::Sub => {
                    if let Some(pending) =
                        self.arith(stack, exec_data, instruction, |x, y| x - y, ArithEvent::Sub)?
                    {
                        return Ok(CallResult::Call(pending));
                    }
                }
                OpCode::Mul => {
                    if let Some(pending) =
                        self.arith(stack, exec_data, instruction, |x, y| x * y, ArithEvent::Mul)?
                    {
                        return Ok(CallResult::Call(pending));
                    }
                }
                OpCode::Div => {
                    // IEEE semantics: zero divisors produce inf or nan
                    if let Some(pending) =
                        self.arith(stack, exec_data, instruction, |x, y| x / y, ArithEvent::Div)?
                    {
                        return Ok(CallResult::Call(pending));
                    }
                }
                OpCode::Mod => {
                    // the Lua definition, not the C one
                    if let Some(pending) = self.arith(
                        stack,
                        exec_data,
                        instruction,
                        |x, y| x - (x / y).floor() * y,
                        ArithEvent::Mod,
                    )? {
                        return Ok(CallResult::Call(pending));
                    }
                }
                OpCode::Pow => {
                    if let Some(pending) = self.arith(
                        stack,
                        exec_data,
                        instruction,
                        |x, y| x.powf(y),
                        ArithEvent::Pow,
                    )? {
                        return Ok(CallResult::Call(pending));
                    }
                }
                OpCode::Unm => {
                    let unm_key = exec_data.metatable_keys.unm.0.key();
                    let heap = &mut exec_data.heap;
                    let value = self.rget(stack, heap, instruction.b());

                    if let Some(n) = coerce_number(heap, value) {
                        self.rset(stack, heap, a, StackValue::Number(-n));
                    } else {
                        let Some(mm) = heap.get_metamethod(value, unm_key) else {
                            return Err(ErrorData::AttemptToArith(value.type_name(heap)));
                        };

                        let pending =
                            self.push_call(stack, mm, &[value, value], RetTarget::Dest { dest: a });
                        return Ok(CallResult::Call(pending));
                    }
                }
                OpCode::Not => {
                    let heap = &mut exec_data.heap;
                    let value = self.rget(stack, heap, instruction.b());
                    self.rset(stack, heap, a, StackValue::Bool(!value.is_truthy()));
                }
                OpCode::Len => {
                    if let Some(pending) = self.resolve_len(stack, exec_data, a, instruction.b())? {
                        return Ok(CallResult::Call(pending));
                    }
                }
                OpCode::Concat => {
                    if let Some(pending) =
                        self.concat_step(stack, exec_data, a, instruction.b(), instruction.c())?
                    {
                        return Ok(CallResult::Call(pending));
                    }
                }
                OpCode::Jmp => {
                    if a > 0 {
                        self.close_up_values(stack, &exec_data.heap, a - 1);
                    }

                    self.jump(instruction.sbx())?;
                }
                OpCode::Close => {
                    self.close_up_values(stack, &exec_data.heap, a);
                }
                OpCode::Eq => {
                    let heap = &exec_data.heap;
                    let lhs = self.rk(stack, heap, instruction.b())?;
                    let rhs = self.rk(stack, heap, instruction.c())?;
                    let expected = a != 0;

                    if raw_equal(lhs, rhs) {
                        if !expected {
                            self.pc += 1;
                        }
                    } else if let (StackValue::Table(_), StackValue::Table(_)) = (lhs, rhs) {
                        // __eq only applies to two values of the same type
                        let eq_key = exec_data.metatable_keys.eq.0.key();
                        let heap = &exec_data.heap;

                        let mm = heap
                            .get_metamethod_fast(lhs, eq_key, AbsentMetamethods::EQ)
                            .or_else(|| {
                                heap.get_metamethod_fast(rhs, eq_key, AbsentMetamethods::EQ)
                            });

                        match mm {
                            Some(mm) => {
                                let pending = self.push_call(
                                    stack,
                                    mm,
                                    &[lhs, rhs],
                                    RetTarget::CmpSkip {
                                        expected,
                                        negate: false,
                                    },
                                );
                                return Ok(CallResult::Call(pending));
                            }
                            None => {
                                if expected {
                                    self.pc += 1;
                                }
                            }
                        }
                    } else if expected {
                        self.pc += 1;
                    }
                }
                OpCode::Lt => {
                    if let Some(pending) =
                        self.compare(stack, exec_data, instruction, CompareOp::Lt)?
                    {
                        return Ok(CallResult::Call(pending));
                    }
                }
                OpCode::Le => {
                    if let Some(pending) =
                        self.compare(stack, exec_data, instruction, CompareOp::Le)?
                    {
                        return Ok(CallResult::Call(pending));
                    }
                }
                OpCode::Test => {
                    let value = self.rget(stack, &exec_data.heap, a);

                    if value.is_truthy() != (instruction.c() != 0) {
                        self.pc += 1;
                    }
                }
                OpCode::TestSet => {
                    let heap = &mut exec_data.heap;
                    let value = self.rget(stack, heap, instruction.b());

                    if value.is_truthy() == (instruction.c() != 0) {
                        self.rset(stack, heap, a, value);
                    } else {
                        self.pc += 1;
                    }
                }
                OpCode::Call => {
                    let b = instruction.b();
                    let c = instruction.c();
                    let stack_start = self.register_base + a as usize;

                    let arg_count = if b == 0 {
                        self.top.saturating_sub(stack_start + 1)
                    } else {
                        b as usize - 1
                    };

                    let expected = match c {
                        0 => None,
                        c => Some((c - 1) as u8),
                    };

                    return Ok(CallResult::Call(PendingCall {
                        stack_start,
                        arg_count,
                        target: RetTarget::Call { a, expected },
                        tail: false,
                    }));
                }
                OpCode::TailCall => {
                    let b = instruction.b();
                    let stack_start = self.register_base + a as usize;

                    let arg_count = if b == 0 {
                        self.top.saturating_sub(stack_start + 1)
                    } else {
                        b as usize - 1
                    };

                    return Ok(CallResult::Call(PendingCall {
                        stack_start,
                        arg_count,
                        // the target is resolved at dispatch: the frame
                        // being replaced donates its own
                        target: RetTarget::Discard,
                        tail: true,
                    }));
                }
                OpCode::Return => {
                    let b = instruction.b();
                    let first = self.register_base + a as usize;

                    let count = match b {
                        0 => None,
                        b => Some(b as usize - 1),
                    };

                    return Ok(CallResult::Return { first, count });
                }
                OpCode::ForPrep => {
                    let heap = &exec_data.heap;
                    let init = self.for_number(stack, heap, a, ErrorData::ForInitialValue)?;
                    self.for_number(stack, heap, a + 1, ErrorData::ForLimit)?;
                    let step = self.for_number(stack, heap, a + 2, ErrorData::ForStep)?;

                    self.rset(
                        stack,
                        &mut exec_data.heap,
                        a,
                        StackValue::Number(init - step),
                    );
                    self.jump(instruction.sbx())?;
                }
                OpCode::ForLoop => {
                    let heap = &exec_data.heap;
                    let index = self.for_number(stack, heap, a, ErrorData::ForInitialValue)?;
                    let limit = self.for_number(stack, heap, a + 1, ErrorData::ForLimit)?;
                    let step = self.for_number(stack, heap, a + 2, ErrorData::ForStep)?;

                    let index = index + step;
                    let keep_going = if step > 0.0 {
                        index <= limit
                    } else {
                        index >= limit
                    };

                    if keep_going {
                        let heap = &mut exec_data.heap;
                        self.rset(stack, heap, a, StackValue::Number(index));
                        self.rset(stack, heap, a + 3, StackValue::Number(index));
                        self.jump(instruction.sbx())?;
                    }
                }
                OpCode::TForCall => {
                    let heap = &exec_data.heap;
                    let function = self.rget(stack, heap, a);
                    let control = [self.rget(stack, heap, a + 1), self.rget(stack, heap, a + 2)];

                    let expected = instruction.c() as u8;
                    let pending = self.push_call(
                        stack,
                        function,
                        &control,
                        RetTarget::Call {
                            a: a + 3,
                            expected: Some(expected),
                        },
                    );

                    return Ok(CallResult::Call(pending));
                }
                OpCode::TForLoop => {
                    let heap = &mut exec_data.heap;
                    let value = self.rget(stack, heap, a + 1);

                    if value != StackValue::Nil {
                        // preserve the control variable
                        self.rset(stack, heap, a, value);
                        self.jump(instruction.sbx())?;
                    }
                }
                OpCode::SetList => {
                    let b = instruction.b();
                    let c = match instruction.c() {
                        0 => self.take_extra_arg()?,
                        c => c,
                    };

                    if c == 0 {
                        return Err(IllegalBytecode::MissingExtraArg.into());
                    }

                    let first = self.register_base + a as usize + 1;
                    let count = if b == 0 {
                        self.top.saturating_sub(first)
                    } else {
                        b as usize
                    };

                    let heap = &mut exec_data.heap;

                    let StackValue::Table(table_key) = self.rget(stack, heap, a) else {
                        return Err(ErrorData::InvalidInternalState);
                    };

                    let mut values = Vec::with_capacity(count);
                    for i in 0..count {
                        values.push(stack.get_deref(heap, first + i));
                    }

                    let Some(table) = heap.get_table_mut(table_key) else {
                        return Err(ErrorData::InvalidInternalState);
                    };

                    let original_size = table.heap_size();
                    let index_offset = (c as usize - 1) * SET_LIST_BATCH;

                    table.reserve_list(count);
                    table.flush(index_offset, &values);

                    let new_size = table.heap_size();
                    heap.settle(original_size, new_size)?;

                    // the window is spent
                    self.top = self.register_base + self.closure.def.proto.max_stack_size as usize;
                }
                OpCode::Closure => {
                    self.create_closure(stack, &mut exec_data.heap, a, instruction.bx())?;
                }
                OpCode::Vararg => {
                    let b = instruction.b();
                    let (window_start, available) = self.vararg_window();
                    let dest = self.register_base + a as usize;
                    let heap = &exec_data.heap;

                    let wanted = if b == 0 { available } else { b as usize - 1 };

                    for i in 0..wanted {
                        let value = if i < available {
                            stack.get_deref(heap, window_start + i)
                        } else {
                            StackValue::Nil
                        };

                        stack.set(dest + i, value);
                    }

                    if b == 0 {
                        self.top = dest + wanted;
                        stack.truncate(self.top);
                    }
                }
                OpCode::ExtraArg => {
                    return Err(IllegalBytecode::MissingExtraArg.into());
                }
            }
        }
    }

    fn arith(
        &mut self,
        stack: &mut RegisterStack,
        exec_data: &mut ExecutionAccessibleData,
        instruction: Instruction,
        operation: fn(f64, f64) -> f64,
        event: ArithEvent,
    ) -> Result<Option<PendingCall>, ErrorData> {
        let a = instruction.a() as u32;

        let heap = &exec_data.heap;
        let lhs = self.rk(stack, heap, instruction.b())?;
        let rhs = self.rk(stack, heap, instruction.c())?;

        if let (Some(x), Some(y)) = (coerce_number(heap, lhs), coerce_number(heap, rhs)) {
            let value = StackValue::Number(operation(x, y));
            self.rset(stack, &mut exec_data.heap, a, value);
            return Ok(None);
        }

        let key = event.key(exec_data);
        let heap = &exec_data.heap;

        let mm = heap
            .get_metamethod(lhs, key)
            .or_else(|| heap.get_metamethod(rhs, key));

        let Some(mm) = mm else {
            // report the operand that refused to be a number
            let offender = if coerce_number(heap, lhs).is_none() {
                lhs
            } else {
                rhs
            };

            return Err(ErrorData::AttemptToArith(offender.type_name(heap)));
        };

        Ok(Some(self.push_call(
            stack,
            mm,
            &[lhs, rhs],
            RetTarget::Dest { dest: a },
        )))
    }

    fn compare(
        &mut self,
        stack: &mut RegisterStack,
        exec_data: &mut ExecutionAccessibleData,
        instruction: Instruction,
        op: CompareOp,
    ) -> Result<Option<PendingCall>, ErrorData> {
        let expected = instruction.a() != 0;

        let heap = &exec_data.heap;
        let lhs = self.rk(stack, heap, instruction.b())?;
        let rhs = self.rk(stack, heap, instruction.c())?;

        let direct = match (lhs, rhs) {
            (StackValue::Number(x), StackValue::Number(y)) => Some(match op {
                CompareOp::Lt => x < y,
                CompareOp::Le => x <= y,
            }),
            (StackValue::Bytes(x), StackValue::Bytes(y)) => {
                let (Some(x), Some(y)) = (heap.get_bytes(x), heap.get_bytes(y)) else {
                    return Err(ErrorData::InvalidInternalState);
                };

                Some(match op {
                    CompareOp::Lt => x < y,
                    CompareOp::Le => x <= y,
                })
            }
            _ => None,
        };

        if let Some(result) = direct {
            if result != expected {
                self.pc += 1;
            }

            return Ok(None);
        }

        let keys = &exec_data.metatable_keys;
        let (event_key, fallback_key) = match op {
            CompareOp::Lt => (keys.lt.0.key(), None),
            CompareOp::Le => (keys.le.0.key(), Some(keys.lt.0.key())),
        };

        if let Some(mm) = heap
            .get_metamethod(lhs, event_key)
            .or_else(|| heap.get_metamethod(rhs, event_key))
        {
            return Ok(Some(self.push_call(
                stack,
                mm,
                &[lhs, rhs],
                RetTarget::CmpSkip {
                    expected,
                    negate: false,
                },
            )));
        }

        // a <= b can fall back to not (b < a)
        if let Some(fallback_key) = fallback_key {
            if let Some(mm) = heap
                .get_metamethod(lhs, fallback_key)
                .or_else(|| heap.get_metamethod(rhs, fallback_key))
            {
                return Ok(Some(self.push_call(
                    stack,
                    mm,
                    &[rhs, lhs],
                    RetTarget::CmpSkip {
                        expected,
                        negate: true,
                    },
                )));
            }
        }

        Err(ErrorData::AttemptToCompare(
            lhs.type_name(heap),
            rhs.type_name(heap),
        ))
    }

    fn resolve_len(
        &mut self,
        stack: &mut RegisterStack,
        exec_data: &mut ExecutionAccessibleData,
        a: u32,
        b: u32,
    ) -> Result<Option<PendingCall>, ErrorData> {
        let len_key = exec_data.metatable_keys.len.0.key();
        let heap = &mut exec_data.heap;
        let value = self.rget(stack, heap, b);

        match value {
            StackValue::Bytes(key) => {
                let Some(bytes) = heap.get_bytes(key) else {
                    return Err(ErrorData::InvalidInternalState);
                };

                let len = bytes.len() as f64;
                self.rset(stack, heap, a, StackValue::Number(len));
                Ok(None)
            }
            StackValue::Table(key) => {
                if let Some(mm) = heap.get_metamethod_fast(value, len_key, AbsentMetamethods::LEN) {
                    return Ok(Some(self.push_call(
                        stack,
                        mm,
                        &[value],
                        RetTarget::Dest { dest: a },
                    )));
                }

                let Some(table) = heap.get_table(key) else {
                    return Err(ErrorData::InvalidInternalState);
                };

                let len = table.length() as f64;
                self.rset(stack, heap, a, StackValue::Number(len));
                Ok(None)
            }
            _ => {
                if let Some(mm) = heap.get_metamethod(value, len_key) {
                    return Ok(Some(self.push_call(
                        stack,
                        mm,
                        &[value],
                        RetTarget::Dest { dest: a },
                    )));
                }

                Err(ErrorData::NoLength(value.type_name(heap)))
            }
        }
    }

    /// One round of the right-to-left concat fold over `R(b..=top_reg)`,
    /// with the final value landing in `R(a)`. String runs collapse
    /// through a byte buffer; anything else defers to `__concat`.
    fn concat_step(
        &self,
        stack: &mut RegisterStack,
        exec_data: &mut ExecutionAccessibleData,
        a: u32,
        b: u32,
        mut top_reg: u32,
    ) -> Result<Option<PendingCall>, ErrorData> {
        loop {
            if top_reg == b {
                let heap = &mut exec_data.heap;
                let value = self.rget(stack, heap, b);
                self.rset(stack, heap, a, value);
                return Ok(None);
            }

            let heap = &exec_data.heap;
            let last = self.rget(stack, heap, top_reg);
            let prev = self.rget(stack, heap, top_reg - 1);

            if stringable(prev) && stringable(last) {
                // extend the run as far left as it goes
                let mut run_start = top_reg - 1;

                while run_start > b && stringable(self.rget(stack, heap, run_start - 1)) {
                    run_start -= 1;
                }

                let mut buffer = exec_data.cache_pools.create_byte_buffer();

                for r in run_start..=top_reg {
                    let value = self.rget(stack, &exec_data.heap, r);
                    append_string_bytes(&exec_data.heap, &mut buffer, value)?;
                }

                let heap = &mut exec_data.heap;
                let bytes_key = heap.intern_bytes(&buffer)?;
                exec_data.cache_pools.store_byte_buffer(buffer);

                let heap = &mut exec_data.heap;
                self.rset(stack, heap, run_start, StackValue::Bytes(bytes_key));
                top_reg = run_start;
                continue;
            }

            let concat_key = exec_data.metatable_keys.concat.0.key();
            let heap = &exec_data.heap;

            let mm = heap
                .get_metamethod_fast(prev, concat_key, AbsentMetamethods::CONCAT)
                .or_else(|| heap.get_metamethod_fast(last, concat_key, AbsentMetamethods::CONCAT));

            let Some(mm) = mm else {
                let offender = if stringable(prev) { last } else { prev };
                return Err(ErrorData::AttemptToConcat(offender.type_name(heap)));
            };

            return Ok(Some(self.push_call(
                stack,
                mm,
                &[prev, last],
                RetTarget::Concat {
                    a,
                    b,
                    dest: top_reg - 1,
                },
            )));
        }
    }

    /// Reads `base[key]`, walking the `__index` chain. A function
    /// metamethod turns into a pending call targeting `dest`.
    fn table_read(
        &mut self,
        stack: &mut RegisterStack,
        exec_data: &mut ExecutionAccessibleData,
        dest: u32,
        base: StackValue,
        key: StackValue,
    ) -> Result<Option<PendingCall>, ErrorData> {
        let index_key = exec_data.metatable_keys.index.0.key();
        let max_chain_depth = exec_data.limits.metatable_chain_depth;
        let heap = &mut exec_data.heap;

        let mut current = base;

        for _ in 0..=max_chain_depth {
            let metavalue = match current {
                StackValue::Table(table_key) => {
                    let Some(table) = heap.get_table(table_key) else {
                        return Err(ErrorData::InvalidInternalState);
                    };

                    let value = table.get(key);

                    if value != StackValue::Nil {
                        self.rset(stack, heap, dest, value);
                        return Ok(None);
                    }

                    let metavalue =
                        heap.get_metavalue_fast(current, index_key, AbsentMetamethods::INDEX);

                    if metavalue == StackValue::Nil {
                        self.rset(stack, heap, dest, StackValue::Nil);
                        return Ok(None);
                    }

                    metavalue
                }
                _ => {
                    let metavalue = heap.get_metavalue(current, index_key);

                    if metavalue == StackValue::Nil {
                        return Err(ErrorData::AttemptToIndex(current.type_name(heap)));
                    }

                    metavalue
                }
            };

            match metavalue {
                StackValue::Function(_) | StackValue::NativeFunction(_) => {
                    return Ok(Some(self.push_call(
                        stack,
                        metavalue,
                        &[current, key],
                        RetTarget::Dest { dest },
                    )));
                }
                next => current = next,
            }
        }

        Err(ErrorData::IndexChainTooLong)
    }

    /// Writes `base[key] = value`, walking the `__newindex` chain.
    fn table_write(
        &mut self,
        stack: &mut RegisterStack,
        exec_data: &mut ExecutionAccessibleData,
        base: StackValue,
        key: StackValue,
        value: StackValue,
    ) -> Result<Option<PendingCall>, ErrorData> {
        let newindex_key = exec_data.metatable_keys.newindex.0.key();
        let max_chain_depth = exec_data.limits.metatable_chain_depth;
        let heap = &mut exec_data.heap;

        let mut current = base;

        for _ in 0..=max_chain_depth {
            let metavalue = match current {
                StackValue::Table(table_key) => {
                    let Some(table) = heap.get_table(table_key) else {
                        return Err(ErrorData::InvalidInternalState);
                    };

                    // an existing key is overwritten without consulting
                    // the metatable
                    let metavalue = if table.get(key) == StackValue::Nil {
                        heap.get_metavalue_fast(current, newindex_key, AbsentMetamethods::NEWINDEX)
                    } else {
                        StackValue::Nil
                    };

                    if metavalue == StackValue::Nil {
                        Table::check_key(key)?;

                        let Some(table) = heap.get_table_mut(table_key) else {
                            return Err(ErrorData::InvalidInternalState);
                        };

                        let original_size = table.heap_size();
                        table.set(key, value);
                        let new_size = table.heap_size();
                        heap.settle(original_size, new_size)?;

                        return Ok(None);
                    }

                    metavalue
                }
                _ => {
                    let metavalue = heap.get_metavalue(current, newindex_key);

                    if metavalue == StackValue::Nil {
                        return Err(ErrorData::AttemptToIndex(current.type_name(heap)));
                    }

                    metavalue
                }
            };

            match metavalue {
                StackValue::Function(_) | StackValue::NativeFunction(_) => {
                    return Ok(Some(self.push_call(
                        stack,
                        metavalue,
                        &[current, key, value],
                        RetTarget::Discard,
                    )));
                }
                next => current = next,
            }
        }

        Err(ErrorData::NewIndexChainTooLong)
    }

    fn create_closure(
        &mut self,
        stack: &mut RegisterStack,
        heap: &mut Heap,
        a: u32,
        index: u32,
    ) -> Result<(), ErrorData> {
        let Some(child_def) = self.closure.def.children.get(index as usize).cloned() else {
            return Err(IllegalBytecode::MissingChild(index).into());
        };

        let mut up_values = Vec::with_capacity(child_def.proto.up_values.len());

        for descriptor in &child_def.proto.up_values {
            let cell_key = if descriptor.from_local {
                // promote the captured register to a shared cell
                let slot_index = self.register_base + descriptor.index as usize;
                let slot = stack.get(slot_index);

                if let StackValue::Pointer(cell_key) = slot {
                    cell_key
                } else {
                    let cell_key = heap.store_cell(slot)?;
                    stack.set(slot_index, StackValue::Pointer(cell_key));
                    cell_key
                }
            } else {
                let Some(cell_key) = self.closure.up_values.get(descriptor.index as usize) else {
                    return Err(IllegalBytecode::MissingUpValue(descriptor.index).into());
                };

                cell_key
            };

            up_values.push(cell_key);
        }

        let closure = Closure {
            up_values: up_values.into(),
            def: child_def,
        };

        let closure_key = heap.store_closure(closure)?;
        self.rset(stack, heap, a, StackValue::Function(closure_key));

        Ok(())
    }
}

/// Arithmetic coercion: numbers as themselves, strings that parse.
fn coerce_number(heap: &Heap, value: StackValue) -> Option<f64> {
    match value {
        StackValue::Number(n) => Some(n),
        StackValue::Bytes(key) => parse_number(heap.get_bytes(key)?.as_bytes()),
        _ => None,
    }
}

fn stringable(value: StackValue) -> bool {
    matches!(value, StackValue::Number(_) | StackValue::Bytes(_))
}

fn append_string_bytes(
    heap: &Heap,
    buffer: &mut Vec<u8>,
    value: StackValue,
) -> Result<(), ErrorData> {
    match value {
        StackValue::Number(n) => buffer.extend_from_slice(float_to_string(n).as_bytes()),
        StackValue::Bytes(key) => {
            let Some(bytes) = heap.get_bytes(key) else {
                return Err(ErrorData::InvalidInternalState);
            };

            buffer.extend_from_slice(bytes.as_bytes());
        }
        _ => return Err(ErrorData::InvalidInternalState),
    }

    Ok(())
}

fn raw_equal(lhs: StackValue, rhs: StackValue) -> bool {
    // interning makes string equality a key comparison; numbers compare
    // by value, so nan never equals itself
    lhs == rhs
}

/// Resolves `__call` chains: each hop prepends the callable-in-waiting
/// as the first argument.
fn resolve_call(
    exec_data: &mut ExecutionAccessibleData,
    mut value: StackValue,
    mut prepend_arg: impl FnMut(StackValue),
) -> Result<StackValue, ErrorData> {
    let call_key = exec_data.metatable_keys.call.0.key();
    let max_chain_depth = exec_data.limits.metatable_chain_depth;
    let mut chain_depth = 0;

    loop {
        match value {
            StackValue::Function(_) | StackValue::NativeFunction(_) => return Ok(value),
            StackValue::Table(_) | StackValue::Bytes(_) => {}
            _ => {
                return Err(ErrorData::AttemptToCall(value.type_name(&exec_data.heap)));
            }
        };

        let next_value = exec_data
            .heap
            .get_metavalue_fast(value, call_key, AbsentMetamethods::CALL);

        if next_value == StackValue::Nil {
            return Err(ErrorData::AttemptToCall(value.type_name(&exec_data.heap)));
        }

        prepend_arg(value);
        value = next_value;

        chain_depth += 1;

        if chain_depth > max_chain_depth {
            return Err(ErrorData::CallChainTooLong);
        }
    }
}

pub(crate) enum CallTargetResolved {
    Native(NativeFnObjectKey, Varargs),
    Execution(ExecutionContext),
}

/// Runs the innermost visible protection barrier for an error at its
/// raise site, exactly once per error. A `pcall` barrier only notes
/// that the error met its protection; an `xpcall` barrier runs the
/// handler right here — the raising frames are still on the execution
/// stack, so the handler can walk them — and the handler's result
/// becomes the value the protected call reports.
pub(crate) fn apply_protection(state: &mut LuaState, err: &mut LuaError) {
    if err.handled || !err.data.is_catchable() {
        return;
    }

    let pause = &state.execution_data.coroutine_data;

    if pause.protected_stack.len() <= pause.barrier_floor {
        return;
    }

    let Some(barrier) = pause.protected_stack.last() else {
        return;
    };

    err.handled = true;

    let Some(handler) = *barrier else {
        return;
    };

    // the handler sees the error the way the protected call would
    // report it: raised values as they are, messages with the raising
    // frame's location
    let value = match &err.data {
        ErrorData::LuaValue(value) => value.clone(),
        data => {
            let mut message = String::new();

            if let Some(frame) = state.context().frame(0) {
                message = format!("{}:{}: ", frame.source, frame.current_line);
            }

            message.push_str(&data.to_string());

            match state.context().intern_string(message.as_bytes()) {
                Ok(string_ref) => Value::String(string_ref),
                Err(fatal) => {
                    *err = fatal;
                    return;
                }
            }
        }
    };

    // handlers run with suspension off and their own barrier floor:
    // they can neither yield away nor fire themselves again
    let pause = &mut state.execution_data.coroutine_data;
    let outer_policy = pause.suspend_policy;
    let outer_floor = pause.barrier_floor;
    pause.suspend_policy = SuspendPolicy::default();
    pause.barrier_floor = pause.protected_stack.len();

    let result = state
        .context()
        .call_stack_value::<_, Varargs>(handler, value);

    let pause = &mut state.execution_data.coroutine_data;
    pause.suspend_policy = outer_policy;
    pause.barrier_floor = outer_floor;

    match result {
        Ok(values) => err.data = ErrorData::LuaValue(values.first()),
        Err(handler_err) => {
            if !handler_err.data.is_catchable() {
                *err = handler_err;
                return;
            }

            // a failing handler reports its own error instead
            err.data = match handler_err.data {
                ErrorData::LuaValue(value) => ErrorData::LuaValue(value),
                _ => {
                    let message = handler_err.to_string();

                    match state.context().intern_string(message.as_bytes()) {
                        Ok(string_ref) => ErrorData::LuaValue(Value::String(string_ref)),
                        Err(fatal) => {
                            *err = fatal;
                            return;
                        }
                    }
                }
            };
        }
    }
}

impl ExecutionContext {
    pub(crate) fn new_function_call(
        function_key: FnObjectKey,
        args: Varargs,
        state: &mut LuaState,
    ) -> Result<Self, LuaError> {
        let exec_data = &mut state.execution_data;
        let mut value_stack = exec_data.cache_pools.create_register_stack();

        let Some(closure) = exec_data.heap.get_closure(function_key) else {
            return Err(ErrorData::InvalidInternalState.into());
        };

        let closure = closure.clone();

        value_stack.push(StackValue::Function(function_key));
        for value in args.iter() {
            value_stack.push(value.to_stack_value());
        }

        let call = CallContext::enter(
            closure,
            function_key,
            0,
            args.count(),
            RetTarget::Entry,
            FrameFlags::empty(),
            &mut value_stack,
        );

        Ok(Self {
            call_stack: vec![call],
            value_stack,
        })
    }

    /// Entry for calling an arbitrary value from the host: `__call`
    /// chains resolve here; native functions bounce back to the caller,
    /// which invokes them without an execution context.
    pub(crate) fn new_value_call(
        value: StackValue,
        mut args: Varargs,
        state: &mut LuaState,
    ) -> Result<CallTargetResolved, LuaError> {
        let exec_data = &mut state.execution_data;

        let mut prepended = Vec::new();
        let function_value = resolve_call(exec_data, value, |value| {
            prepended.push(value);
        })?;

        for value in prepended.into_iter().rev() {
            let value = Value::from_stack_value(&mut exec_data.heap, value);
            args.push_front(value);
        }

        match function_value {
            StackValue::NativeFunction(key) => Ok(CallTargetResolved::Native(key, args)),
            StackValue::Function(key) => {
                let execution = Self::new_function_call(key, args, state)?;
                Ok(CallTargetResolved::Execution(execution))
            }
            _ => Err(ErrorData::InvalidInternalState.into()),
        }
    }

    /// Drives the top execution context until it produces values, parks
    /// for a yield, or unwinds with an error.
    pub(crate) fn resume(state: &mut LuaState) -> Result<Varargs, LuaError> {
        let pause = &state.execution_data.coroutine_data;
        if !pause.unwinding_yield.is_empty() {
            return Err(ErrorData::UnhandledYield.into());
        }

        'drive: loop {
            let exec_data = &mut state.execution_data;
            let Some(execution) = state.execution_stack.last_mut() else {
                return Err(ErrorData::InvalidInternalState.into());
            };

            let Some(call) = execution.call_stack.last_mut() else {
                return Err(ErrorData::InvalidInternalState.into());
            };

            let result = match call.step(&mut execution.value_stack, exec_data) {
                Ok(result) => result,
                Err(err) => return Err(Self::unwind_error(state, err)),
            };

            match result {
                CallResult::Return { first, count } => {
                    let call = execution.call_stack.pop().unwrap();
                    let count = count.unwrap_or_else(|| call.top.saturating_sub(first));

                    match execution.place_results(
                        exec_data,
                        call.target,
                        call.stack_start,
                        first,
                        count,
                    ) {
                        Ok(Some(values)) => {
                            let context = state.execution_stack.pop().unwrap();
                            exec_data
                                .cache_pools
                                .store_register_stack(context.value_stack);
                            return Ok(values);
                        }
                        Ok(None) => {}
                        Err(err) => {
                            // restore for an accurate traceback
                            execution.call_stack.push(call);
                            return Err(Self::unwind_error(state, err));
                        }
                    }
                }
                CallResult::Call(mut pending) => {
                    // a tail call replaces its own frame and adopts its
                    // placement; the frame stack must not grow
                    if pending.tail {
                        let call = execution.call_stack.pop().unwrap();

                        execution
                            .value_stack
                            .truncate(pending.stack_start + 1 + pending.arg_count);
                        execution
                            .value_stack
                            .chip(call.stack_start, 1 + pending.arg_count);

                        pending.stack_start = call.stack_start;
                        pending.target = call.target;
                    }

                    let function_value = execution
                        .value_stack
                        .get_deref(&exec_data.heap, pending.stack_start);

                    let resolved = {
                        let value_stack = &mut execution.value_stack;
                        resolve_call(exec_data, function_value, |value| {
                            value_stack.insert(pending.stack_start + 1, value);
                            pending.arg_count += 1;
                        })
                    };

                    let function_value = match resolved {
                        Ok(value) => value,
                        Err(err) => return Err(Self::unwind_error(state, err)),
                    };

                    match function_value {
                        StackValue::Function(key) => {
                            let Some(closure) = exec_data.heap.get_closure(key) else {
                                return Err(Self::unwind_error(
                                    state,
                                    ErrorData::InvalidInternalState,
                                ));
                            };

                            let closure = closure.clone();

                            let flags = if pending.tail {
                                FrameFlags::TAIL
                            } else {
                                FrameFlags::empty()
                            };

                            let call = CallContext::enter(
                                closure,
                                key,
                                pending.stack_start,
                                pending.arg_count,
                                pending.target,
                                flags,
                                &mut execution.value_stack,
                            );

                            execution.call_stack.push(call);
                        }
                        StackValue::NativeFunction(key) => {
                            let Some(host_fn) = exec_data.heap.get_host_fn(key) else {
                                return Err(Self::unwind_error(
                                    state,
                                    ErrorData::InvalidInternalState,
                                ));
                            };

                            let host_fn = host_fn.clone();

                            // load args
                            let mut arg_values = Vec::with_capacity(pending.arg_count);

                            for i in 0..pending.arg_count {
                                let value = execution
                                    .value_stack
                                    .get_deref(&exec_data.heap, pending.stack_start + 1 + i);
                                arg_values.push(Value::from_stack_value(&mut exec_data.heap, value));
                            }

                            let args = Varargs::from(arg_values);
                            let target = pending.target;
                            let stack_start = pending.stack_start;

                            // account for this context while the native
                            // code possibly re-enters the interpreter
                            let old_stack_size = exec_data.tracked_stack_size;
                            exec_data.tracked_stack_size =
                                old_stack_size + execution.value_stack.len();

                            let result = host_fn.invoke(key, args, &mut state.context());

                            state.execution_data.tracked_stack_size = old_stack_size;

                            let return_values = match result {
                                Ok(values) => values,
                                Err(mut err) => {
                                    if let ErrorData::Yield(_) = &err.data {
                                        let pause = &mut state.execution_data.coroutine_data;

                                        if !pause.suspend_policy.current {
                                            err.data = ErrorData::YieldOutsideCoroutine;
                                            return Err(Self::continue_unwind(state, err));
                                        }

                                        // park this context; the next
                                        // resume delivers its values at
                                        // this exact call site
                                        let execution = state.execution_stack.pop().unwrap();

                                        pause.unwinding_yield.push(ParkedFrame {
                                            continuation: Continuation::Frames {
                                                execution,
                                                landing: target,
                                                call_site: stack_start,
                                            },
                                            enclosing_may_suspend: true,
                                        });

                                        return Err(err);
                                    }

                                    return Err(Self::continue_unwind(state, err));
                                }
                            };

                            let exec_data = &mut state.execution_data;
                            let Some(execution) = state.execution_stack.last_mut() else {
                                return Err(ErrorData::InvalidInternalState.into());
                            };

                            match execution.handle_external_return(
                                exec_data,
                                target,
                                stack_start,
                                return_values,
                            ) {
                                Ok(Some(values)) => {
                                    let context = state.execution_stack.pop().unwrap();
                                    exec_data
                                        .cache_pools
                                        .store_register_stack(context.value_stack);
                                    return Ok(values);
                                }
                                Ok(None) => continue 'drive,
                                Err(err) => return Err(Self::unwind_error(state, err)),
                            }
                        }
                        _ => {
                            let type_name = function_value.type_name(&exec_data.heap);

                            return Err(Self::unwind_error(
                                state,
                                ErrorData::AttemptToCall(type_name),
                            ));
                        }
                    }
                }
            }
        }
    }

    /// Places a finished callee's results per `target`. Returns
    /// `Some(values)` when the results leave this execution context.
    fn place_results(
        &mut self,
        exec_data: &mut ExecutionAccessibleData,
        target: RetTarget,
        callee_start: usize,
        first: usize,
        count: usize,
    ) -> Result<Option<Varargs>, ErrorData> {
        let stack = &mut self.value_stack;

        match target {
            RetTarget::Entry => {
                let heap = &mut exec_data.heap;
                let mut values = Vec::with_capacity(count);

                for i in 0..count {
                    let value = stack.get_deref(heap, first + i);
                    values.push(Value::from_stack_value(heap, value));
                }

                Ok(Some(Varargs::from(values)))
            }
            RetTarget::Call { a, expected } => {
                let heap = &mut exec_data.heap;

                let Some(caller) = self.call_stack.last_mut() else {
                    return Err(ErrorData::InvalidInternalState);
                };

                let dest = caller.register_base + a as usize;
                let provided = count;

                let count = match expected {
                    Some(expected) => expected as usize,
                    None => count,
                };

                for i in 0..count {
                    let value = if i < provided {
                        stack.get_deref(heap, first + i)
                    } else {
                        StackValue::Nil
                    };

                    // results may land in captured locals
                    caller.rset(stack, heap, a + i as u32, value);
                }

                stack.truncate(dest + count);

                caller.top = match expected {
                    Some(_) => {
                        caller.register_base + caller.closure.def.proto.max_stack_size as usize
                    }
                    None => dest + count,
                };

                Ok(None)
            }
            RetTarget::Dest { dest } => {
                let heap = &mut exec_data.heap;

                let value = if count > 0 {
                    stack.get_deref(heap, first)
                } else {
                    StackValue::Nil
                };

                stack.truncate(callee_start);

                let Some(caller) = self.call_stack.last() else {
                    return Err(ErrorData::InvalidInternalState);
                };

                caller.rset(stack, heap, dest, value);
                Ok(None)
            }
            RetTarget::CmpSkip { expected, negate } => {
                let value = if count > 0 {
                    stack.get_deref(&exec_data.heap, first)
                } else {
                    StackValue::Nil
                };

                stack.truncate(callee_start);

                let Some(caller) = self.call_stack.last_mut() else {
                    return Err(ErrorData::InvalidInternalState);
                };

                let mut result = value.is_truthy();

                if negate {
                    result = !result;
                }

                if result != expected {
                    caller.pc += 1;
                }

                Ok(None)
            }
            RetTarget::Concat { a, b, dest } => {
                let heap = &mut exec_data.heap;

                let value = if count > 0 {
                    stack.get_deref(heap, first)
                } else {
                    StackValue::Nil
                };

                stack.truncate(callee_start);

                let Some(caller) = self.call_stack.last_mut() else {
                    return Err(ErrorData::InvalidInternalState);
                };

                caller.rset(stack, heap, dest, value);

                if dest > b {
                    let pending = caller.concat_step(stack, exec_data, a, b, dest)?;
                    caller.pending = pending;
                } else if a != b {
                    let heap = &mut exec_data.heap;
                    let value = caller.rget(stack, heap, b);
                    caller.rset(stack, heap, a, value);
                }

                Ok(None)
            }
            RetTarget::Discard => {
                stack.truncate(callee_start);
                Ok(None)
            }
            RetTarget::Hook => {
                stack.truncate(callee_start);
                exec_data.debug.in_hook = false;
                Ok(None)
            }
        }
    }

    /// The resume path for a context parked at a native call site: the
    /// resumed values stand in for the native function's return values.
    /// Returns `Some(values)` when the whole context completed.
    pub(crate) fn handle_external_return(
        &mut self,
        exec_data: &mut ExecutionAccessibleData,
        target: RetTarget,
        stack_start: usize,
        values: Varargs,
    ) -> Result<Option<Varargs>, ErrorData> {
        if target == RetTarget::Entry {
            return Ok(Some(values));
        }

        let stack = &mut self.value_stack;
        stack.truncate(stack_start);

        let count = values.count();

        for value in values.iter() {
            stack.push(value.to_stack_value());
        }

        self.place_results(exec_data, target, stack_start, stack_start, count)
    }

    pub(crate) fn unwind_error(state: &mut LuaState, data: ErrorData) -> LuaError {
        Self::continue_unwind(state, data.into())
    }

    /// Pops the top execution context, accumulating its frames into the
    /// error's traceback and recycling its stack. The error meets its
    /// protection barrier first, while those frames are still live.
    pub(crate) fn continue_unwind(state: &mut LuaState, mut err: LuaError) -> LuaError {
        apply_protection(state, &mut err);

        let Some(execution) = state.execution_stack.pop() else {
            crate::debug_unreachable!();
            #[cfg(not(debug_assertions))]
            return ErrorData::InvalidInternalState.into();
        };

        let exec_data = &mut state.execution_data;

        for call in execution.call_stack.iter().rev() {
            err.traceback.push_frame(call.trace_frame());

            if call.flags.contains(FrameFlags::TAIL) {
                err.traceback.push_frame(TracebackFrame {
                    source: call.closure.def.short_source.clone(),
                    line: 0,
                    kind: FrameKind::Tail,
                });
            }

            // an abandoned hook invocation must release the guard
            if call.flags.contains(FrameFlags::HOOKED) {
                exec_data.debug.in_hook = false;
            }
        }

        exec_data
            .cache_pools
            .store_register_stack(execution.value_stack);

        err
    }
}
