use super::{ErrorData, Traceback};
use crate::interpreter::ByteString;

/// An error unwinding through the interpreter: [`ErrorData`] plus the
/// traceback accumulated while frames were popped.
#[derive(Clone, Debug)]
pub struct LuaError {
    pub traceback: Traceback,
    pub data: ErrorData,
    /// Whether the innermost protection barrier already processed this
    /// error at its raise site (an `xpcall` handler runs exactly once,
    /// while the raising frames are still live).
    pub(crate) handled: bool,
}

impl LuaError {
    pub fn new_bad_argument(position: usize, mut error: LuaError) -> Self {
        error.data = ErrorData::BadArgument {
            position: position as _,
            reason: error.data.into(),
        };

        error
    }

    pub fn new_string(message: String) -> Self {
        LuaError::from(ErrorData::ByteString(message.as_str().into()))
    }

    pub fn new_static_string(message: &'static str) -> Self {
        LuaError::from(ErrorData::ByteString(message.into()))
    }

    pub fn new_byte_string(message: ByteString) -> LuaError {
        LuaError::from(ErrorData::ByteString(message))
    }

    /// Whether a protected call may observe this error.
    #[inline]
    pub fn is_catchable(&self) -> bool {
        self.data.is_catchable()
    }
}

impl<T: Into<ErrorData>> From<T> for LuaError {
    #[inline]
    fn from(data: T) -> Self {
        Self {
            traceback: Default::default(),
            data: data.into(),
            handled: false,
        }
    }
}

impl std::error::Error for LuaError {}

impl std::fmt::Display for LuaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // the innermost frame supplies the conventional location prefix
        if let Some(frame) = self.traceback.frames().first() {
            write!(f, "{}:{}: ", frame.source(), frame.line())?;
        }

        write!(f, "{}", self.data)
    }
}
