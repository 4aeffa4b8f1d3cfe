use super::execution::{apply_protection, ExecutionContext, RetTarget};
use super::heap::{CoroutineObjectKey, NativeFnObjectKey, StorageKey};
use super::value_stack::StackValue;
use super::{LuaContext, LuaState, Varargs};
use crate::errors::{ErrorData, LuaError};
use std::rc::Rc;

/// One frame of a suspended thread, reified: how to re-enter it, and
/// whether the scope that held it could itself suspend (restored when
/// the frame wakes, so a second yield from the same depth still knows
/// where it stands).
pub(crate) struct ParkedFrame {
    pub(crate) continuation: Continuation,
    pub(crate) enclosing_may_suspend: bool,
}

/// How a parked frame re-enters.
pub(crate) enum Continuation {
    /// The thread's entry function, not yet started.
    Start(StorageKey),
    /// A pausable host frame: its wake-up entry re-derives the locals
    /// from the state it saved before suspending.
    Host {
        function: NativeFnObjectKey,
        saved: Varargs,
    },
    /// An interpreter frame chain, parked at the native call site that
    /// suspended. The pc and registers inside are the whole state; the
    /// resumed values land at `call_site` and flow per `landing`.
    Frames {
        execution: ExecutionContext,
        landing: RetTarget,
        call_site: usize,
    },
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CoroutineStatus {
    /// Created, never resumed.
    Initial,
    Running,
    Suspended,
    /// Resumed a child coroutine and is waiting for it.
    Normal,
    Dead,
}

impl CoroutineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            // a fresh thread reports as resumable, like a suspended one
            CoroutineStatus::Initial => "suspended",
            CoroutineStatus::Suspended => "suspended",
            CoroutineStatus::Running => "running",
            CoroutineStatus::Normal => "normal",
            CoroutineStatus::Dead => "dead",
        }
    }
}

pub(crate) struct Coroutine {
    pub(crate) status: CoroutineStatus,
    /// The reified stack, outermost frame first: resuming pops the
    /// innermost suspension point off the back and works outward as
    /// each frame completes.
    pub(crate) suspended: Vec<ParkedFrame>,
    /// Protection barriers belonging to this thread's parked frames,
    /// re-established for the next resume.
    pub(crate) parked_barriers: Vec<Option<StackValue>>,
    pub(crate) err: Option<Rc<LuaError>>,
}

impl Coroutine {
    pub(crate) fn heap_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.suspended.len() * std::mem::size_of::<ParkedFrame>()
            + self.parked_barriers.len() * std::mem::size_of::<Option<StackValue>>()
    }

    pub(crate) fn new(entry: StorageKey) -> Self {
        Self {
            status: CoroutineStatus::Initial,
            suspended: vec![ParkedFrame {
                continuation: Continuation::Start(entry),
                enclosing_may_suspend: true,
            }],
            parked_barriers: Vec::new(),
            err: None,
        }
    }

    pub(crate) fn resume(
        co_key: CoroutineObjectKey,
        args: Varargs,
        ctx: &mut LuaContext,
    ) -> Result<Varargs, LuaError> {
        let state = &mut *ctx.state;
        let heap = &mut state.execution_data.heap;

        // invalid keys stored into the heap would corrupt the state
        for value in args.iter() {
            value.test_validity(heap)?;
        }

        let Some(coroutine) = heap.get_coroutine_mut(co_key) else {
            return Err(ErrorData::InvalidRef.into());
        };

        if !matches!(
            coroutine.status,
            CoroutineStatus::Initial | CoroutineStatus::Suspended
        ) {
            return Err(ErrorData::CannotResume(coroutine.status).into());
        }

        coroutine.status = CoroutineStatus::Running;
        let original_size = coroutine.heap_size();
        let revived_barriers = std::mem::take(&mut coroutine.parked_barriers);

        let pause = &mut state.execution_data.coroutine_data;

        // the parent steps aside while the child runs
        if let Some(&parent_key) = pause.active_coroutines.last() {
            if let Some(parent) = state.execution_data.heap.get_coroutine_mut(parent_key) {
                parent.status = CoroutineStatus::Normal;
            }
        }

        let pause = &mut state.execution_data.coroutine_data;
        pause.active_coroutines.push(co_key);
        let previous_policy = pause.suspend_policy;

        // this thread's protection barriers come back to life with it;
        // anything beneath them belongs to the resumer and must not
        // fire for errors raised in here
        let barrier_floor = pause.protected_stack.len();
        let previous_floor = pause.barrier_floor;
        pause.barrier_floor = barrier_floor;
        pause.protected_stack.extend(revived_barriers);

        let result = Self::drive(co_key, args, ctx, barrier_floor);

        let state = &mut *ctx.state;
        let heap = &mut state.execution_data.heap;

        let new_size = heap
            .get_coroutine(co_key)
            .map(Coroutine::heap_size)
            .unwrap_or_default();
        heap.settle(original_size, new_size)?;

        let pause = &mut state.execution_data.coroutine_data;
        pause.active_coroutines.pop();
        pause.suspend_policy = previous_policy;
        pause.barrier_floor = previous_floor;

        // a suspension already moved its barriers back into the thread;
        // completion and death leave stale ones to drop here
        pause.protected_stack.truncate(barrier_floor);

        if let Some(&parent_key) = pause.active_coroutines.last() {
            if let Some(parent) = state.execution_data.heap.get_coroutine_mut(parent_key) {
                parent.status = CoroutineStatus::Running;
            }
        }

        result
    }

    /// Wakes parked frames innermost-first until the thread yields
    /// again, finishes, or dies.
    fn drive(
        co_key: CoroutineObjectKey,
        mut args: Varargs,
        ctx: &mut LuaContext,
        barrier_floor: usize,
    ) -> Result<Varargs, LuaError> {
        loop {
            let state = &mut *ctx.state;
            let heap = &mut state.execution_data.heap;

            let Some(coroutine) = heap.get_coroutine_mut(co_key) else {
                return Err(ErrorData::InvalidInternalState.into());
            };

            let Some(parked) = coroutine.suspended.pop() else {
                coroutine.status = CoroutineStatus::Dead;
                return Ok(args);
            };

            let pause = &mut state.execution_data.coroutine_data;
            pause.suspend_policy.current = parked.enclosing_may_suspend;

            let result = match parked.continuation {
                Continuation::Start(entry) => match entry {
                    StorageKey::Function(key) => {
                        ExecutionContext::new_function_call(key, args, state).and_then(
                            |execution| {
                                state.execution_stack.push(execution);
                                ExecutionContext::resume(state)
                            },
                        )
                    }
                    StorageKey::NativeFunction(key) => {
                        let Some(host_fn) = state.execution_data.heap.get_host_fn(key) else {
                            return Err(ErrorData::InvalidInternalState.into());
                        };

                        host_fn.clone().invoke(key, args, ctx)
                    }
                    _ => return Err(ErrorData::InvalidInternalState.into()),
                },
                Continuation::Host { function, saved } => {
                    let Some(host_fn) = state.execution_data.heap.get_host_fn(function) else {
                        return Err(ErrorData::InvalidInternalState.into());
                    };

                    host_fn.clone().wake(function, Ok(args), saved, ctx)
                }
                Continuation::Frames {
                    mut execution,
                    landing,
                    call_site,
                } => {
                    match execution.handle_external_return(
                        &mut state.execution_data,
                        landing,
                        call_site,
                        args,
                    ) {
                        Ok(Some(values)) => {
                            // the parked frame was the whole context
                            state
                                .execution_data
                                .cache_pools
                                .store_register_stack(execution.value_stack);
                            Ok(values)
                        }
                        Ok(None) => {
                            state.execution_stack.push(execution);
                            ExecutionContext::resume(state)
                        }
                        Err(err) => {
                            state.execution_stack.push(execution);
                            Err(ExecutionContext::unwind_error(state, err))
                        }
                    }
                }
            };

            match result {
                Ok(values) => args = values,
                Err(mut err) => {
                    if let ErrorData::Yield(args) = err.data {
                        Self::handle_yield(co_key, ctx.state, barrier_floor)?;
                        return Ok(args);
                    }

                    // errors born in a woken host frame haven't met
                    // their protection barrier yet
                    apply_protection(ctx.state, &mut err);

                    match Self::unwind_error(co_key, err, ctx) {
                        // a protected frame converted the error
                        Ok(value) => args = value,
                        Err(err) => {
                            if let ErrorData::Yield(args) = err.data {
                                // a parked frame yielded again while
                                // handling the error
                                Self::handle_yield(co_key, ctx.state, barrier_floor)?;
                                return Ok(args);
                            }

                            let state = &mut *ctx.state;
                            let heap = &mut state.execution_data.heap;

                            let Some(coroutine) = heap.get_coroutine_mut(co_key) else {
                                return Err(ErrorData::InvalidInternalState.into());
                            };

                            coroutine.status = CoroutineStatus::Dead;
                            coroutine.suspended.clear();
                            coroutine.err = Some(err.clone().into());
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    fn handle_yield(
        co_key: CoroutineObjectKey,
        state: &mut LuaState,
        barrier_floor: usize,
    ) -> Result<(), ErrorData> {
        let pause = &mut state.execution_data.coroutine_data;

        // everything unwound since the resume parks with the thread:
        // frames innermost-first onto the back of the stack, barriers
        // lifted off the live stack wholesale
        let frames: Vec<_> = pause.unwinding_yield.drain(..).rev().collect();
        let barriers = pause.protected_stack.split_off(barrier_floor);

        let heap = &mut state.execution_data.heap;

        let Some(coroutine) = heap.get_coroutine_mut(co_key) else {
            return Err(ErrorData::InvalidInternalState);
        };

        coroutine.status = CoroutineStatus::Suspended;
        coroutine.suspended.extend(frames);
        coroutine.parked_barriers = barriers;

        Ok(())
    }

    /// Walks the parked frames delivering `err` inward. A `Host` frame
    /// may convert the error into values (protected calls); a `Frames`
    /// entry only contributes traceback lines.
    fn unwind_error(
        co_key: CoroutineObjectKey,
        mut err: LuaError,
        ctx: &mut LuaContext,
    ) -> Result<Varargs, LuaError> {
        loop {
            let pause = &mut ctx.state.execution_data.coroutine_data;
            pause.unwinding_yield.clear();

            let state = &mut *ctx.state;
            let heap = &mut state.execution_data.heap;
            let Some(coroutine) = heap.get_coroutine_mut(co_key) else {
                return Err(ErrorData::InvalidInternalState.into());
            };

            if !err.is_catchable() {
                // nothing on the way out may observe it
                break;
            }

            let Some(parked) = coroutine.suspended.pop() else {
                break;
            };

            match parked.continuation {
                Continuation::Host { function, saved } => {
                    let pause = &mut state.execution_data.coroutine_data;
                    pause.suspend_policy.current = parked.enclosing_may_suspend;

                    let Some(host_fn) = state.execution_data.heap.get_host_fn(function) else {
                        return Err(ErrorData::InvalidInternalState.into());
                    };

                    match host_fn.clone().wake(function, Err(err), saved, ctx) {
                        Ok(values) => {
                            // converted, the way a protected call does
                            return Ok(values);
                        }
                        Err(new_err) => {
                            err = new_err;

                            if matches!(err.data, ErrorData::Yield(_)) {
                                // parked frames may yield mid-unwind
                                return Err(err);
                            }
                        }
                    }
                }
                Continuation::Frames { execution, .. } => {
                    let state = &mut *ctx.state;
                    state.execution_stack.push(execution);
                    err = ExecutionContext::continue_unwind(state, err);
                }
                Continuation::Start(_) => {}
            }
        }

        Err(err)
    }
}
