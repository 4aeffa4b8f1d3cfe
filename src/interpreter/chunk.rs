use super::byte_string::ByteString;
use super::instruction::Instruction;
use super::prototype::{Constant, LocalVariable, Prototype, UpValueDesc};
use crate::errors::LoadError;
use std::rc::Rc;

const SIGNATURE: &[u8; 4] = b"\x1bLua";
const VERSION: u8 = 0x52;
const FORMAT: u8 = 0;
const ENDIANNESS_LITTLE: u8 = 1;
const INT_SIZE: u8 = 4;
const SIZE_T_SIZE: u8 = 8;
const INSTRUCTION_SIZE: u8 = 4;
const NUMBER_SIZE: u8 = 8;
const NUMBER_IS_INTEGRAL: u8 = 0;
const TAIL: &[u8; 6] = b"\x19\x93\r\n\x1a\n";

const TYPE_NIL: u8 = 0;
const TYPE_BOOLEAN: u8 = 1;
const TYPE_NUMBER: u8 = 3;
const TYPE_STRING: u8 = 4;

/// A precompiled chunk: the binary round-trip format plus the seam the
/// compiler black box plugs into.
#[derive(Clone, Debug, PartialEq)]
pub struct Chunk {
    pub main: Rc<Prototype>,
}

/// The source-to-prototype seam. The runtime treats compilation as a
/// black box: bytes and a chunk name go in, a prototype comes out. A
/// compiler that reports failure sees its message delivered to `load`'s
/// caller as `(nil, message)`, never raised as a Lua error.
pub trait Compiler {
    fn compile(&self, source: &[u8], chunk_name: &str) -> Result<Chunk, LoadError>;
}

/// Whether `load` should treat the bytes as a precompiled chunk.
pub fn is_binary(bytes: &[u8]) -> bool {
    bytes.first() == Some(&SIGNATURE[0])
}

impl Chunk {
    pub fn new(main: Prototype) -> Self {
        Self {
            main: Rc::new(main),
        }
    }

    /// Parses the binary chunk format, validating the header.
    pub fn load(bytes: &[u8]) -> Result<Self, LoadError> {
        let mut reader = Reader { bytes, offset: 0 };

        if reader.take(4)? != SIGNATURE {
            return Err(LoadError::BadSignature);
        }

        let version = reader.byte()?;
        if version != VERSION {
            return Err(LoadError::UnsupportedVersion(version));
        }

        let format = reader.byte()?;
        if format != FORMAT {
            return Err(LoadError::UnsupportedFormat(format));
        }

        let layout = reader.take(6)?;
        if layout
            != [
                ENDIANNESS_LITTLE,
                INT_SIZE,
                SIZE_T_SIZE,
                INSTRUCTION_SIZE,
                NUMBER_SIZE,
                NUMBER_IS_INTEGRAL,
            ]
        {
            return Err(LoadError::IncompatibleLayout);
        }

        if reader.take(6)? != TAIL {
            return Err(LoadError::BadTail);
        }

        let main = reader.prototype()?;

        Ok(Self {
            main: Rc::new(main),
        })
    }

    /// Produces bytes [`Chunk::load`] accepts back, byte for byte.
    pub fn dump(&self) -> Vec<u8> {
        let mut writer = Writer { bytes: Vec::new() };

        writer.bytes.extend_from_slice(SIGNATURE);
        writer.bytes.extend_from_slice(&[
            VERSION,
            FORMAT,
            ENDIANNESS_LITTLE,
            INT_SIZE,
            SIZE_T_SIZE,
            INSTRUCTION_SIZE,
            NUMBER_SIZE,
            NUMBER_IS_INTEGRAL,
        ]);
        writer.bytes.extend_from_slice(TAIL);

        writer.prototype(&self.main);
        writer.bytes
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl Reader<'_> {
    fn take(&mut self, count: usize) -> Result<&[u8], LoadError> {
        let end = self
            .offset
            .checked_add(count)
            .ok_or(LoadError::Truncated)?;

        if end > self.bytes.len() {
            return Err(LoadError::Truncated);
        }

        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8, LoadError> {
        Ok(self.take(1)?[0])
    }

    fn int(&mut self) -> Result<u32, LoadError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn count(&mut self) -> Result<usize, LoadError> {
        let count = self.int()? as usize;

        // an element takes at least a byte; reject counts the input
        // could not possibly satisfy
        if count > self.bytes.len() - self.offset {
            return Err(LoadError::Corrupt);
        }

        Ok(count)
    }

    fn number(&mut self) -> Result<f64, LoadError> {
        let bytes = self.take(8)?;
        Ok(f64::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<Option<ByteString>, LoadError> {
        let bytes = self.take(8)?;
        let len = u64::from_le_bytes(bytes.try_into().unwrap()) as usize;

        if len == 0 {
            return Ok(None);
        }

        // the dumped length includes a trailing NUL
        let bytes = self.take(len)?;
        Ok(Some(ByteString::from(&bytes[..len - 1])))
    }

    fn prototype(&mut self) -> Result<Prototype, LoadError> {
        let line_defined = self.int()?;
        let last_line_defined = self.int()?;
        let param_count = self.byte()?;
        let is_vararg = self.byte()? != 0;
        let max_stack_size = self.byte()?;

        let code_len = self.count()?;
        let mut code = Vec::with_capacity(code_len);
        for _ in 0..code_len {
            code.push(Instruction(self.int()?));
        }

        let constant_count = self.count()?;
        let mut constants = Vec::with_capacity(constant_count);
        for _ in 0..constant_count {
            let constant = match self.byte()? {
                TYPE_NIL => Constant::Nil,
                TYPE_BOOLEAN => Constant::Bool(self.byte()? != 0),
                TYPE_NUMBER => Constant::Number(self.number()?),
                TYPE_STRING => {
                    Constant::Bytes(self.string()?.unwrap_or_else(|| ByteString::from("")))
                }
                _ => return Err(LoadError::Corrupt),
            };
            constants.push(constant);
        }

        let child_count = self.count()?;
        let mut children = Vec::with_capacity(child_count);
        for _ in 0..child_count {
            children.push(Rc::new(self.prototype()?));
        }

        let up_value_count = self.count()?;
        let mut up_values = Vec::with_capacity(up_value_count);
        for _ in 0..up_value_count {
            up_values.push(UpValueDesc {
                name: None,
                from_local: self.byte()? != 0,
                index: self.byte()?,
            });
        }

        let source: Rc<str> = match self.string()? {
            Some(name) => name.to_string_lossy().into_owned().into(),
            None => "=?".into(),
        };

        let line_count = self.count()?;
        let mut line_info = Vec::with_capacity(line_count);
        for _ in 0..line_count {
            line_info.push(self.int()?);
        }

        let local_count = self.count()?;
        let mut locals = Vec::with_capacity(local_count);
        for _ in 0..local_count {
            let Some(name) = self.string()? else {
                return Err(LoadError::Corrupt);
            };

            locals.push(LocalVariable {
                name,
                start_pc: self.int()?,
                end_pc: self.int()?,
            });
        }

        let up_value_name_count = self.count()?;
        for i in 0..up_value_name_count {
            let name = self.string()?;

            if let Some(desc) = up_values.get_mut(i) {
                desc.name = name;
            }
        }

        Ok(Prototype {
            source,
            line_defined,
            last_line_defined,
            param_count,
            is_vararg,
            max_stack_size,
            code,
            constants,
            children,
            up_values,
            line_info,
            column_info: Vec::new(),
            locals,
        })
    }
}

struct Writer {
    bytes: Vec<u8>,
}

impl Writer {
    fn byte(&mut self, value: u8) {
        self.bytes.push(value);
    }

    fn int(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn number(&mut self, value: f64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn string(&mut self, value: Option<&[u8]>) {
        match value {
            None => self.bytes.extend_from_slice(&0u64.to_le_bytes()),
            Some(bytes) => {
                self.bytes
                    .extend_from_slice(&(bytes.len() as u64 + 1).to_le_bytes());
                self.bytes.extend_from_slice(bytes);
                self.byte(0);
            }
        }
    }

    fn prototype(&mut self, proto: &Prototype) {
        self.int(proto.line_defined);
        self.int(proto.last_line_defined);
        self.byte(proto.param_count);
        self.byte(proto.is_vararg as u8);
        self.byte(proto.max_stack_size);

        self.int(proto.code.len() as u32);
        for instruction in &proto.code {
            self.int(instruction.0);
        }

        self.int(proto.constants.len() as u32);
        for constant in &proto.constants {
            match constant {
                Constant::Nil => self.byte(TYPE_NIL),
                Constant::Bool(b) => {
                    self.byte(TYPE_BOOLEAN);
                    self.byte(*b as u8);
                }
                Constant::Number(n) => {
                    self.byte(TYPE_NUMBER);
                    self.number(*n);
                }
                Constant::Bytes(bytes) => {
                    self.byte(TYPE_STRING);
                    self.string(Some(bytes.as_bytes()));
                }
            }
        }

        self.int(proto.children.len() as u32);
        for child in &proto.children {
            self.prototype(child);
        }

        self.int(proto.up_values.len() as u32);
        for desc in &proto.up_values {
            self.byte(desc.from_local as u8);
            self.byte(desc.index);
        }

        self.string(Some(proto.source.as_bytes()));

        self.int(proto.line_info.len() as u32);
        for line in &proto.line_info {
            self.int(*line);
        }

        self.int(proto.locals.len() as u32);
        for local in &proto.locals {
            self.string(Some(local.name.as_bytes()));
            self.int(local.start_pc);
            self.int(local.end_pc);
        }

        self.int(proto.up_values.len() as u32);
        for desc in &proto.up_values {
            self.string(desc.name.as_ref().map(|name| name.as_bytes()));
        }
    }
}
