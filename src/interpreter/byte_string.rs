use slice_dst::SliceWithHeader;
use std::cell::RefCell;
use std::rc::Rc;

/// Recently created short strings, indexed by hash. One cache per OS
/// thread; states on the same thread share it.
const RECENT_STRINGS_CACHE_SIZE: usize = 128;

/// Strings at or above this length never enter the recent strings cache,
/// bounding the memory the cache can pin.
const RECENT_STRINGS_MAX_LENGTH: usize = 32;

thread_local! {
    static RECENT_STRINGS: RefCell<[Option<ByteString>; RECENT_STRINGS_CACHE_SIZE]> =
        RefCell::new([const { None }; RECENT_STRINGS_CACHE_SIZE]);
}

/// An immutable byte sequence with a cached hash.
///
/// Lua strings are byte sequences, not unicode text. Multiple values may
/// share one backing allocation: a substring aliases its parent's bytes
/// when the visible window covers more than half of them.
#[derive(Clone, Eq)]
pub struct ByteString {
    backing: Rc<SliceWithHeader<(), u8>>,
    start: u32,
    len: u32,
    hash: u32,
}

fn hash_bytes(bytes: &[u8]) -> u32 {
    // sampled multiplicative hash over at most 32 bytes, long strings
    // included, in the style of luaS_hash
    let mut h = bytes.len() as u32;
    let step = (bytes.len() >> 5) + 1;

    let mut i = bytes.len();
    while i >= step {
        h ^= h
            .wrapping_shl(5)
            .wrapping_add(h >> 2)
            .wrapping_add(bytes[i - 1] as u32);
        i -= step;
    }

    h
}

impl ByteString {
    fn from_bytes_uncached(bytes: &[u8]) -> Self {
        let backing = SliceWithHeader::new::<Rc<_>, _>((), bytes.iter().cloned());

        Self {
            start: 0,
            len: bytes.len() as u32,
            hash: hash_bytes(bytes),
            backing,
        }
    }

    pub(crate) fn heap_size(&self) -> usize {
        // weak count + strong count + data
        std::mem::size_of::<usize>() * 2 + self.backing.slice.len()
    }

    #[inline]
    pub fn hash(&self) -> u32 {
        self.hash
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        let start = self.start as usize;
        &self.backing.slice[start..start + self.len as usize]
    }

    #[inline]
    pub fn to_string_lossy(&self) -> std::borrow::Cow<str> {
        String::from_utf8_lossy(self.as_bytes())
    }

    /// A window into this string, clamped to its bounds.
    ///
    /// Aliases the backing bytes when the window spans more than half of
    /// them, copies otherwise so a tiny substring can't pin a large
    /// allocation.
    pub fn sub(&self, start: usize, end: usize) -> ByteString {
        let end = end.min(self.len as usize);
        let start = start.min(end);
        let len = end - start;

        if len * 2 > self.backing.slice.len() {
            let abs_start = self.start as usize + start;
            let window = &self.backing.slice[abs_start..abs_start + len];

            return Self {
                backing: self.backing.clone(),
                start: abs_start as u32,
                len: len as u32,
                hash: hash_bytes(window),
            };
        }

        ByteString::from(&self.as_bytes()[start..end])
    }
}

impl From<&[u8]> for ByteString {
    fn from(value: &[u8]) -> Self {
        if value.len() >= RECENT_STRINGS_MAX_LENGTH {
            return Self::from_bytes_uncached(value);
        }

        RECENT_STRINGS.with_borrow_mut(|cache| {
            let hash = hash_bytes(value);
            let slot = &mut cache[hash as usize & (RECENT_STRINGS_CACHE_SIZE - 1)];

            if let Some(cached) = slot {
                if cached.as_bytes() == value {
                    return cached.clone();
                }
            }

            let string = Self::from_bytes_uncached(value);
            *slot = Some(string.clone());
            string
        })
    }
}

impl From<&str> for ByteString {
    fn from(value: &str) -> Self {
        value.as_bytes().into()
    }
}

impl std::hash::Hash for ByteString {
    #[inline]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl PartialEq for ByteString {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.as_bytes() == other.as_bytes()
    }
}

impl std::cmp::PartialOrd for ByteString {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::cmp::Ord for ByteString {
    #[inline]
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}

impl std::borrow::Borrow<[u8]> for ByteString {
    #[inline]
    fn borrow(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl std::fmt::Display for ByteString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.to_string_lossy(), f)
    }
}

impl std::fmt::Debug for ByteString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.to_string_lossy())
    }
}

#[cfg(feature = "serde")]
mod serde_impl {
    use super::ByteString;
    use serde::de::Visitor;

    impl serde::Serialize for ByteString {
        fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_bytes(self.as_bytes())
        }
    }

    struct BytesVisitor;

    impl<'de> Visitor<'de> for BytesVisitor {
        type Value = ByteString;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(f, "bytes")
        }

        fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
            Ok(ByteString::from(v))
        }

        fn visit_seq<A: serde::de::SeqAccess<'de>>(
            self,
            mut seq: A,
        ) -> Result<Self::Value, A::Error> {
            let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or_default());

            while let Some(byte) = seq.next_element()? {
                bytes.push(byte);
            }

            Ok(ByteString::from(bytes.as_slice()))
        }
    }

    impl<'de> serde::Deserialize<'de> for ByteString {
        fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            deserializer.deserialize_bytes(BytesVisitor)
        }
    }
}
