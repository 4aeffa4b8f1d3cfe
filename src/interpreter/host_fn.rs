use super::coroutine::{Continuation, ParkedFrame};
use super::heap::NativeFnObjectKey;
use super::state::SuspendPolicy;
use super::{LuaContext, Varargs};
use crate::errors::{ErrorData, LuaError};
use std::rc::Rc;

/// What a pausable host function wakes up to.
///
/// On a fresh call, `outcome` carries the call arguments and `saved` is
/// empty. After a suspension, `outcome` is the result of whatever ran
/// below this frame (the resume values, or the error unwinding past it)
/// and `saved` is whatever the function stored through
/// [`LuaContext::resume_call_with_state`](super::LuaContext::resume_call_with_state)
/// before it went down.
pub(crate) struct HostFrame {
    pub(crate) outcome: Result<Varargs, LuaError>,
    pub(crate) saved: Varargs,
}

impl HostFrame {
    fn fresh(args: Varargs) -> Self {
        Self {
            outcome: Ok(args),
            saved: Varargs::default(),
        }
    }
}

type PlainBody = dyn Fn(Varargs, &mut LuaContext) -> Result<Varargs, LuaError>;
type PausableBody = dyn Fn(HostFrame, &mut LuaContext) -> Result<Varargs, LuaError>;

/// A host function value.
///
/// Plain functions are straight-line Rust with no way back in: a yield
/// crossing one has nowhere to store a continuation, so it decays to an
/// error. Pausable functions carry their own wake-up entry: when a
/// yield passes through, the armed state is parked as a
/// [`Continuation::Host`] frame and the function is re-entered from it
/// on resume.
#[derive(Clone)]
pub(crate) enum HostFn {
    Plain(Rc<PlainBody>),
    Pausable(Rc<PausableBody>),
}

impl HostFn {
    fn can_pause(&self) -> bool {
        matches!(self, HostFn::Pausable(_))
    }

    fn run(&self, frame: HostFrame, ctx: &mut LuaContext) -> Result<Varargs, LuaError> {
        match self {
            HostFn::Plain(body) => body(frame.outcome?, ctx),
            HostFn::Pausable(body) => body(frame, ctx),
        }
    }

    /// A fresh call.
    pub(crate) fn invoke(
        &self,
        key: NativeFnObjectKey,
        args: Varargs,
        ctx: &mut LuaContext,
    ) -> Result<Varargs, LuaError> {
        self.enter(key, HostFrame::fresh(args), ctx)
    }

    /// Re-entry of a parked frame: `outcome` stands in for the result of
    /// the call that suspended it.
    pub(crate) fn wake(
        &self,
        key: NativeFnObjectKey,
        outcome: Result<Varargs, LuaError>,
        saved: Varargs,
        ctx: &mut LuaContext,
    ) -> Result<Varargs, LuaError> {
        if !self.can_pause() {
            return Err(ErrorData::InvalidInternalState.into());
        }

        self.enter(key, HostFrame { outcome, saved }, ctx)
    }

    /// Runs the body inside its own suspension scope, and settles what a
    /// yield escaping it means: parked (the body armed a resume point),
    /// decayed to an error (nothing around here can bring it back), or
    /// flagged as unhandled (it crossed a frame that never armed).
    fn enter(
        &self,
        key: NativeFnObjectKey,
        frame: HostFrame,
        ctx: &mut LuaContext,
    ) -> Result<Varargs, LuaError> {
        let pause = &mut ctx.state.execution_data.coroutine_data;

        if !pause.suspend_policy.current {
            let mut result = self.run(frame, ctx);

            if let Err(err) = &mut result {
                if matches!(err.data, ErrorData::Yield(_)) {
                    err.data = ErrorData::YieldOutsideCoroutine;
                }
            }

            return self.check_returns(result, ctx);
        }

        if !pause.unwinding_yield.is_empty() {
            return Err(ErrorData::UnhandledYield.into());
        }

        let outer_policy = pause.suspend_policy;
        let outer_armed = pause.resume_armed;

        pause.suspend_policy = SuspendPolicy {
            enclosing: outer_policy.current,
            current: self.can_pause(),
        };
        pause.resume_armed = false;

        let mut result = self.run(frame, ctx);

        let pause = &mut ctx.state.execution_data.coroutine_data;
        let mut stray_yield = false;

        match &mut result {
            Ok(_) => {
                stray_yield = !pause.unwinding_yield.is_empty();
            }
            Err(err) if matches!(err.data, ErrorData::Yield(_)) => {
                if pause.resume_armed {
                    let Some(saved) = pause.armed_states.pop() else {
                        return Err(ErrorData::InvalidInternalState.into());
                    };

                    pause.unwinding_yield.push(ParkedFrame {
                        continuation: Continuation::Host {
                            function: key,
                            saved,
                        },
                        enclosing_may_suspend: pause.suspend_policy.enclosing,
                    });
                } else {
                    err.data = ErrorData::UnhandledYield;
                }
            }
            Err(_) => {}
        }

        if stray_yield {
            result = Err(ErrorData::UnhandledYield.into());
        }

        let pause = &mut ctx.state.execution_data.coroutine_data;
        pause.suspend_policy = outer_policy;
        pause.resume_armed = outer_armed;

        self.check_returns(result, ctx)
    }

    /// Stale refs must not leak into the heap through return values.
    fn check_returns(
        &self,
        result: Result<Varargs, LuaError>,
        ctx: &mut LuaContext,
    ) -> Result<Varargs, LuaError> {
        if let Ok(return_values) = &result {
            let heap = &ctx.state.execution_data.heap;

            for value in return_values.iter() {
                value.test_validity(heap)?;
            }
        }

        result
    }
}
