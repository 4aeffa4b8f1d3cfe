use std::rc::Rc;
use thin_vec::ThinVec;

/// What kind of activation a traceback line describes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// The top level function of a chunk.
    Main,
    /// A Lua function, identified by the line its definition starts on.
    Lua { line_defined: u32 },
    /// A host function.
    Native,
    /// A tail call that replaced a frame which is no longer on the stack.
    Tail,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TracebackFrame {
    pub(crate) source: Rc<str>,
    pub(crate) line: u32,
    pub(crate) kind: FrameKind,
}

impl TracebackFrame {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn kind(&self) -> &FrameKind {
        &self.kind
    }
}

impl std::fmt::Display for TracebackFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            FrameKind::Main => write!(f, "\t{}:{}: in main chunk", self.source, self.line),
            FrameKind::Lua { line_defined } => write!(
                f,
                "\t{}:{}: in function <{}:{}>",
                self.source, self.line, self.source, line_defined
            ),
            FrameKind::Native => write!(f, "\t[C]: in ?"),
            FrameKind::Tail => write!(f, "\t(...tail calls...)"),
        }
    }
}

/// Frames accumulated while an error unwinds the call stack,
/// ordered innermost first.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Traceback {
    frames: ThinVec<TracebackFrame>,
}

impl Traceback {
    pub fn push_frame(&mut self, frame: TracebackFrame) {
        self.frames.push(frame);
    }

    pub fn frames(&self) -> &[TracebackFrame] {
        &self.frames
    }
}

impl std::fmt::Display for Traceback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stack traceback:")?;

        for frame in &self.frames {
            write!(f, "\n{frame}")?;
        }

        Ok(())
    }
}
