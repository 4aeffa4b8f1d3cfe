use super::heap::Heap;
use super::StringRef;
use crate::errors::ErrorData;

/// Every metamethod name, interned once per state so dispatch never
/// re-hashes the event strings.
pub struct MetatableKeys {
    /// Length `#`
    pub len: StringRef,
    /// Unary minus `-`
    pub unm: StringRef,
    /// Add `+`
    pub add: StringRef,
    /// Subtract `-`
    pub sub: StringRef,
    /// Multiply `*`
    pub mul: StringRef,
    /// Division `/`
    pub div: StringRef,
    /// Modulo `%`
    pub modulus: StringRef,
    /// Power `^`
    pub pow: StringRef,
    /// Equal `==`
    pub eq: StringRef,
    /// Less than `<`
    pub lt: StringRef,
    /// Less than or equal `<=`
    pub le: StringRef,
    /// Concat `..`
    pub concat: StringRef,
    /// Index `table[key]`
    pub index: StringRef,
    /// Table assignment `table[key] =`
    pub newindex: StringRef,
    /// Call `value(...)`
    pub call: StringRef,
    /// Weakness mode: "k", "v", or "kv"
    pub mode: StringRef,
    /// Hides the real metatable and blocks `setmetatable`
    pub metatable: StringRef,
    /// A display name for tables in messages
    pub name: StringRef,
    /// Overrides `tostring`
    pub tostring: StringRef,
    /// Overrides `pairs`
    pub pairs: StringRef,
}

impl MetatableKeys {
    pub(crate) fn new(heap: &mut Heap) -> Result<Self, ErrorData> {
        Ok(Self {
            len: StringRef(heap.intern_bytes_to_ref(b"__len")?),
            unm: StringRef(heap.intern_bytes_to_ref(b"__unm")?),
            add: StringRef(heap.intern_bytes_to_ref(b"__add")?),
            sub: StringRef(heap.intern_bytes_to_ref(b"__sub")?),
            mul: StringRef(heap.intern_bytes_to_ref(b"__mul")?),
            div: StringRef(heap.intern_bytes_to_ref(b"__div")?),
            modulus: StringRef(heap.intern_bytes_to_ref(b"__mod")?),
            pow: StringRef(heap.intern_bytes_to_ref(b"__pow")?),
            eq: StringRef(heap.intern_bytes_to_ref(b"__eq")?),
            lt: StringRef(heap.intern_bytes_to_ref(b"__lt")?),
            le: StringRef(heap.intern_bytes_to_ref(b"__le")?),
            concat: StringRef(heap.intern_bytes_to_ref(b"__concat")?),
            index: StringRef(heap.intern_bytes_to_ref(b"__index")?),
            newindex: StringRef(heap.intern_bytes_to_ref(b"__newindex")?),
            call: StringRef(heap.intern_bytes_to_ref(b"__call")?),
            mode: StringRef(heap.intern_bytes_to_ref(b"__mode")?),
            metatable: StringRef(heap.intern_bytes_to_ref(b"__metatable")?),
            name: StringRef(heap.intern_bytes_to_ref(b"__name")?),
            tostring: StringRef(heap.intern_bytes_to_ref(b"__tostring")?),
            pairs: StringRef(heap.intern_bytes_to_ref(b"__pairs")?),
        })
    }
}
