use super::byte_string::ByteString;
use super::instruction::Instruction;
use std::rc::Rc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Longest rendering of a source name in messages and tracebacks.
pub const SHORT_SOURCE_MAX: usize = 60;

/// An entry in a prototype's constant pool.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Constant {
    Nil,
    Bool(bool),
    Number(f64),
    Bytes(ByteString),
}

/// Where a closure finds one of its upvalues when it is instantiated:
/// a register of the enclosing frame, or an upvalue of the enclosing
/// closure.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UpValueDesc {
    pub name: Option<ByteString>,
    pub from_local: bool,
    pub index: u8,
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LocalVariable {
    pub name: ByteString,
    /// First instruction where the variable is live.
    pub start_pc: u32,
    /// First instruction where the variable is dead.
    pub end_pc: u32,
}

/// The immutable compiled form of one function body.
///
/// A prototype is plain data: constants are values, children are nested
/// prototypes, and nothing references a particular state. Loading one
/// into a state interns its string constants and produces a callable
/// closure.
#[derive(Clone, Debug, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Prototype {
    /// `=text` means literal text, `@path` means a file, anything else is
    /// the chunk itself.
    pub source: Rc<str>,
    pub line_defined: u32,
    pub last_line_defined: u32,
    pub param_count: u8,
    pub is_vararg: bool,
    pub max_stack_size: u8,
    pub code: Vec<Instruction>,
    pub constants: Vec<Constant>,
    pub children: Vec<Rc<Prototype>>,
    pub up_values: Vec<UpValueDesc>,
    /// Source line per instruction; may be empty when debug info was
    /// stripped.
    pub line_info: Vec<u32>,
    /// Source column per instruction; optional the same way.
    pub column_info: Vec<u32>,
    pub locals: Vec<LocalVariable>,
}

impl Prototype {
    pub fn line_at(&self, pc: usize) -> u32 {
        self.line_info.get(pc).copied().unwrap_or(0)
    }

    pub fn column_at(&self, pc: usize) -> u32 {
        self.column_info.get(pc).copied().unwrap_or(0)
    }

    /// The name of the local at 1-based `index` visible at `pc`, if the
    /// chunk kept its debug info.
    pub fn local_name(&self, index: usize, pc: usize) -> Option<&ByteString> {
        let pc = pc as u32;
        let mut seen = 0;

        for local in &self.locals {
            if local.start_pc <= pc && pc < local.end_pc {
                seen += 1;

                if seen == index {
                    return Some(&local.name);
                }
            }
        }

        None
    }

    /// The source name shortened for messages: at most
    /// [`SHORT_SOURCE_MAX`] bytes, with an ellipsis marking the cut.
    pub fn short_source(&self) -> String {
        short_source_of(&self.source)
    }
}

pub(crate) fn short_source_of(source: &str) -> String {
    match source.as_bytes().first() {
        Some(b'=') => {
            // literal rendering, just clipped
            let text = &source[1..];

            if text.len() <= SHORT_SOURCE_MAX {
                return text.to_string();
            }

            let mut cut = SHORT_SOURCE_MAX - 3;

            while !text.is_char_boundary(cut) {
                cut -= 1;
            }

            format!("{}...", &text[..cut])
        }
        Some(b'@') => {
            // a file path keeps its tail, the interesting part
            let path = &source[1..];

            if path.len() <= SHORT_SOURCE_MAX {
                return path.to_string();
            }

            let tail_len = SHORT_SOURCE_MAX - 3;
            let mut cut = path.len() - tail_len;

            while !path.is_char_boundary(cut) {
                cut += 1;
            }

            format!("...{}", &path[cut..])
        }
        _ => {
            // the chunk is the source itself; show its first line
            let first_line = source.lines().next().unwrap_or_default();
            let truncated = source.len() > first_line.len();

            const PREFIX: &str = "[string \"";
            const BUDGET: usize = SHORT_SOURCE_MAX - PREFIX.len() - "\"]".len() - 3;

            if first_line.len() > BUDGET || truncated {
                let mut cut = first_line.len().min(BUDGET);

                while !first_line.is_char_boundary(cut) {
                    cut -= 1;
                }

                format!("{PREFIX}{}...\"]", &first_line[..cut])
            } else {
                format!("{PREFIX}{first_line}\"]")
            }
        }
    }
}
