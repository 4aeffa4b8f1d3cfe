use super::heap::CellObjectKey;
use super::prototype::Prototype;
use super::value_stack::StackValue;
use std::rc::Rc;

/// A prototype loaded into a particular state: string constants interned,
/// children resolved, debug names precomputed.
pub(crate) struct ProtoDef {
    pub(crate) proto: Rc<Prototype>,
    /// The constant pool with strings as heap keys, indexable by RK
    /// operands without re-interning.
    pub(crate) constants: Box<[StackValue]>,
    pub(crate) children: Box<[Rc<ProtoDef>]>,
    pub(crate) short_source: Rc<str>,
}

impl ProtoDef {
    pub(crate) fn heap_size(&self) -> usize {
        let mut size = 0;
        size += std::mem::size_of::<usize>() * 2 + self.short_source.len();
        size += self.constants.len() * std::mem::size_of::<StackValue>();
        size += self.children.len() * std::mem::size_of::<Rc<ProtoDef>>();
        size += self.proto.code.len() * std::mem::size_of::<u32>();
        size
    }

    pub(crate) fn constant(&self, index: usize) -> Option<StackValue> {
        self.constants.get(index).copied()
    }
}

/// The ordered upvalue cells a closure captured, shared between copies.
#[derive(Clone, Default)]
pub(crate) struct UpValues {
    keys: Rc<[CellObjectKey]>,
}

impl UpValues {
    pub(crate) fn heap_size(&self) -> usize {
        // weak count + strong count + data
        std::mem::size_of::<usize>() * 2 + std::mem::size_of_val(&*self.keys)
    }

    pub(crate) fn get(&self, index: usize) -> Option<CellObjectKey> {
        self.keys.get(index).copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &CellObjectKey> {
        self.keys.iter()
    }
}

impl From<Vec<CellObjectKey>> for UpValues {
    fn from(value: Vec<CellObjectKey>) -> Self {
        Self { keys: value.into() }
    }
}

/// A function value: a loaded prototype bound to captured upvalues.
#[derive(Clone)]
pub(crate) struct Closure {
    pub(crate) up_values: UpValues,
    pub(crate) def: Rc<ProtoDef>,
}

impl Closure {
    pub(crate) fn heap_size(&self) -> usize {
        // the definition is shared; count only our handle to it
        self.up_values.heap_size() + std::mem::size_of::<usize>() * 2
    }
}
