use super::IllegalBytecode;
use crate::interpreter::{ByteString, CoroutineStatus, TypeName, Value, Varargs};

/// The payload of a [`LuaError`](super::LuaError).
///
/// Most variants are ordinary Lua errors: `pcall` observes them and converts
/// them into `(false, value)`. Two groups are special:
///
/// - [`ErrorData::Yield`] is the coroutine unwind signal. It is not an error
///   at all, only a distinguished control transfer that every frame between
///   the yield and the resume boundary propagates upward.
/// - the uncatchable variants ([`ErrorData::StackOverflow`],
///   [`ErrorData::AllocationRefused`], [`ErrorData::Interrupted`] and
///   [`ErrorData::InvalidInternalState`]) pass through protected calls and
///   coroutine boundaries alike; only the host observes them.
#[derive(Clone, Debug, PartialEq)]
pub enum ErrorData {
    /// An arbitrary value raised by `error`, preserved as-is.
    LuaValue(Value),
    /// A message error, usually already carrying a `source:line:` prefix.
    ByteString(ByteString),
    BadArgument {
        position: u8,
        reason: Box<ErrorData>,
    },
    ExpectedType {
        expected: TypeName,
        received: TypeName,
    },
    /// Like [`ErrorData::ExpectedType`], with the operand's `__name`
    /// standing in for the raw type name.
    ExpectedTypeNamed {
        expected: TypeName,
        received: ByteString,
    },
    AttemptToIndex(TypeName),
    AttemptToCall(TypeName),
    AttemptToArith(TypeName),
    AttemptToCompare(TypeName, TypeName),
    AttemptToConcat(TypeName),
    NoLength(TypeName),
    NilIndex,
    NaNIndex,
    IndexChainTooLong,
    NewIndexChainTooLong,
    CallChainTooLong,
    ForInitialValue(TypeName),
    ForLimit(TypeName),
    ForStep(TypeName),
    CannotResume(CoroutineStatus),
    YieldOutsideCoroutine,
    /// A yield escaped a frame that never stored resumable state.
    UnhandledYield,
    IllegalBytecode(IllegalBytecode),
    /// A heap reference from another state, or to a swept object.
    InvalidRef,

    /// The coroutine unwind signal, carrying the yielded values.
    Yield(Varargs),

    StackOverflow,
    /// The allocation tracker refused a charge.
    AllocationRefused,
    /// The host interrupted execution through the tracker.
    Interrupted,
    InvalidInternalState,
}

impl ErrorData {
    /// Whether `pcall` and the coroutine boundary may observe this error.
    pub fn is_catchable(&self) -> bool {
        !matches!(
            self,
            ErrorData::Yield(_)
                | ErrorData::UnhandledYield
                | ErrorData::StackOverflow
                | ErrorData::AllocationRefused
                | ErrorData::Interrupted
                | ErrorData::InvalidInternalState
        )
    }
}

impl From<IllegalBytecode> for ErrorData {
    fn from(value: IllegalBytecode) -> Self {
        ErrorData::IllegalBytecode(value)
    }
}

impl std::fmt::Display for ErrorData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorData::LuaValue(value) => match value {
                Value::String(_) => write!(f, "(string error value)"),
                _ => write!(f, "(error object is a {} value)", value.type_name()),
            },
            ErrorData::ByteString(bytes) => write!(f, "{bytes}"),
            ErrorData::BadArgument { position, reason } => match reason.as_ref() {
                ErrorData::ExpectedType { expected, received } => {
                    write!(f, "bad argument #{position} ({expected} expected, got {received})")
                }
                ErrorData::ExpectedTypeNamed { expected, received } => {
                    write!(f, "bad argument #{position} ({expected} expected, got {received})")
                }
                reason => write!(f, "bad argument #{position} ({reason})"),
            },
            ErrorData::ExpectedType { expected, received } => {
                write!(f, "{expected} expected, got {received}")
            }
            ErrorData::ExpectedTypeNamed { expected, received } => {
                write!(f, "{expected} expected, got {received}")
            }
            ErrorData::AttemptToIndex(type_name) => {
                write!(f, "attempt to index a {type_name} value")
            }
            ErrorData::AttemptToCall(type_name) => {
                write!(f, "attempt to call a {type_name} value")
            }
            ErrorData::AttemptToArith(type_name) => {
                write!(f, "attempt to perform arithmetic on a {type_name} value")
            }
            ErrorData::AttemptToCompare(a, b) => {
                if a == b {
                    write!(f, "attempt to compare two {a} values")
                } else {
                    write!(f, "attempt to compare {a} with {b}")
                }
            }
            ErrorData::AttemptToConcat(type_name) => {
                write!(f, "attempt to concatenate a {type_name} value")
            }
            ErrorData::NoLength(type_name) => {
                write!(f, "attempt to get length of a {type_name} value")
            }
            ErrorData::NilIndex => write!(f, "table index is nil"),
            ErrorData::NaNIndex => write!(f, "table index is NaN"),
            ErrorData::IndexChainTooLong => write!(f, "loop in gettable"),
            ErrorData::NewIndexChainTooLong => write!(f, "loop in settable"),
            ErrorData::CallChainTooLong => write!(f, "loop in call"),
            ErrorData::ForInitialValue(type_name) => {
                write!(f, "'for' initial value must be a number, got {type_name}")
            }
            ErrorData::ForLimit(type_name) => {
                write!(f, "'for' limit must be a number, got {type_name}")
            }
            ErrorData::ForStep(type_name) => {
                write!(f, "'for' step must be a number, got {type_name}")
            }
            ErrorData::CannotResume(status) => {
                let status = match status {
                    CoroutineStatus::Initial | CoroutineStatus::Suspended => "suspended",
                    CoroutineStatus::Running => "running",
                    CoroutineStatus::Normal => "non-suspended",
                    CoroutineStatus::Dead => "dead",
                };
                write!(f, "cannot resume {status} coroutine")
            }
            ErrorData::YieldOutsideCoroutine => {
                write!(f, "attempt to yield from outside a coroutine")
            }
            ErrorData::UnhandledYield => write!(f, "attempt to yield across an unpausable frame"),
            ErrorData::IllegalBytecode(data) => write!(f, "illegal bytecode: {data}"),
            ErrorData::InvalidRef => write!(f, "reference does not belong to this state"),
            ErrorData::Yield(_) => write!(f, "unhandled yield signal"),
            ErrorData::StackOverflow => write!(f, "stack overflow"),
            ErrorData::AllocationRefused => write!(f, "allocation limit reached"),
            ErrorData::Interrupted => write!(f, "interrupted"),
            ErrorData::InvalidInternalState => write!(f, "invalid internal state"),
        }
    }
}
