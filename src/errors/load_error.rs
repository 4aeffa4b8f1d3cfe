use crate::interpreter::ByteString;

/// A chunk that could not be turned into a prototype.
///
/// These are compile errors in the sense of `load`: they are delivered to
/// the caller as `(nil, message)` and never raised as Lua errors.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum LoadError {
    /// The chunk is binary but the mode string excludes binary chunks.
    BinaryChunkForbidden,
    /// The chunk is text but the mode string excludes text chunks.
    TextChunkForbidden,
    /// The chunk is text and no compiler is installed on the state.
    MissingCompiler,
    /// The installed compiler rejected the chunk.
    Compile(ByteString),
    BadSignature,
    UnsupportedVersion(u8),
    UnsupportedFormat(u8),
    /// The chunk was dumped on a machine with a different endianness,
    /// type width, or number format.
    IncompatibleLayout,
    BadTail,
    Truncated,
    /// A size or count field exceeds what the chunk could possibly hold.
    Corrupt,
}

impl std::error::Error for LoadError {}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::BinaryChunkForbidden => write!(f, "attempt to load a binary chunk"),
            LoadError::TextChunkForbidden => write!(f, "attempt to load a text chunk"),
            LoadError::MissingCompiler => write!(f, "no compiler installed for text chunks"),
            LoadError::Compile(message) => write!(f, "{message}"),
            LoadError::BadSignature => write!(f, "not a precompiled chunk"),
            LoadError::UnsupportedVersion(version) => {
                write!(f, "version mismatch in precompiled chunk ({version:#04x})")
            }
            LoadError::UnsupportedFormat(format) => {
                write!(f, "format mismatch in precompiled chunk ({format})")
            }
            LoadError::IncompatibleLayout => {
                write!(f, "incompatible layout in precompiled chunk")
            }
            LoadError::BadTail => write!(f, "corrupted precompiled chunk"),
            LoadError::Truncated => write!(f, "truncated precompiled chunk"),
            LoadError::Corrupt => write!(f, "corrupted precompiled chunk"),
        }
    }
}
