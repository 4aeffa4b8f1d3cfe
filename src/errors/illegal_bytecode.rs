#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Structural problems in a prototype's code, caught while executing.
///
/// A well formed chunk never produces these; they guard against hosts
/// assembling prototypes by hand.
#[derive(Debug, PartialEq, Eq, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum IllegalBytecode {
    BadOpCode(u8),
    MissingConstant(u32),
    MissingUpValue(u8),
    MissingChild(u32),
    MissingExtraArg,
    PcOutOfBounds(u32),
    NonStringConstant(u32),
}

impl std::fmt::Display for IllegalBytecode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IllegalBytecode::BadOpCode(op) => write!(f, "bad opcode {op}"),
            IllegalBytecode::MissingConstant(index) => write!(f, "missing constant {index}"),
            IllegalBytecode::MissingUpValue(index) => write!(f, "missing upvalue {index}"),
            IllegalBytecode::MissingChild(index) => {
                write!(f, "missing child prototype {index}")
            }
            IllegalBytecode::MissingExtraArg => write!(f, "expecting EXTRAARG"),
            IllegalBytecode::PcOutOfBounds(pc) => write!(f, "jump out of bounds to {pc}"),
            IllegalBytecode::NonStringConstant(index) => {
                write!(f, "constant {index} is not a string")
            }
        }
    }
}
