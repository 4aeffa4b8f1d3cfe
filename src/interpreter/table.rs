use super::heap::{
    BytesObjectKey, CellObjectKey, CoroutineObjectKey, FnObjectKey, NativeFnObjectKey,
    TableObjectKey,
};
use super::number::coerce_integer;
use super::value_stack::StackValue;
use crate::errors::ErrorData;
use crate::BuildFastHasher;
use bitflags::bitflags;
use indexmap::IndexMap;
use std::cell::Cell;

bitflags! {
    /// Metamethods confirmed absent on a metatable, so the dispatch fast
    /// path can skip the lookup. Cleared whenever the table is written to.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct AbsentMetamethods: u8 {
        const INDEX = 1;
        const NEWINDEX = 1 << 1;
        const EQ = 1 << 2;
        const LEN = 1 << 3;
        const CALL = 1 << 4;
        const CONCAT = 1 << 5;
        const MODE = 1 << 6;
        const TOSTRING = 1 << 7;
    }
}

/// A hash part key. Integral float keys are canonicalised to the integer
/// variant, so `t[1]` and `t[1.0]` collide to the same slot.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MapKey {
    variant: u8,
    value: u64,
}

impl MapKey {
    const VARIANT_BOOL: u8 = 0;
    const VARIANT_INT: u8 = 1;
    const VARIANT_FLOAT: u8 = 2;
    const VARIANT_BYTES: u8 = 3;
    const VARIANT_TABLE: u8 = 4;
    const VARIANT_NATIVE_FN: u8 = 5;
    const VARIANT_FN: u8 = 6;
    const VARIANT_COROUTINE: u8 = 7;
    const VARIANT_CELL: u8 = 8;

    fn int(value: i64) -> Self {
        Self {
            variant: Self::VARIANT_INT,
            value: value as _,
        }
    }
}

impl PartialEq for MapKey {
    fn eq(&self, other: &Self) -> bool {
        if self.variant != other.variant {
            return false;
        }

        if self.variant == Self::VARIANT_FLOAT {
            return f64::from_bits(self.value) == f64::from_bits(other.value);
        }

        self.value == other.value
    }
}

impl Eq for MapKey {}

impl std::hash::Hash for MapKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.variant.hash(state);
        self.value.hash(state);
    }
}

impl From<StackValue> for MapKey {
    fn from(value: StackValue) -> MapKey {
        fn from_pair(variant: u8, value: u64) -> MapKey {
            MapKey { variant, value }
        }

        match value {
            StackValue::Nil => from_pair(MapKey::VARIANT_BOOL, 2),
            StackValue::Bool(b) => from_pair(MapKey::VARIANT_BOOL, b as _),
            StackValue::Number(n) => match coerce_integer(n) {
                Some(i) => MapKey::int(i),
                None => from_pair(MapKey::VARIANT_FLOAT, n.to_bits()),
            },
            StackValue::Bytes(key) => from_pair(MapKey::VARIANT_BYTES, key.as_ffi()),
            StackValue::Table(key) => from_pair(MapKey::VARIANT_TABLE, key.as_ffi()),
            StackValue::NativeFunction(key) => from_pair(MapKey::VARIANT_NATIVE_FN, key.as_ffi()),
            StackValue::Function(key) => from_pair(MapKey::VARIANT_FN, key.as_ffi()),
            StackValue::Coroutine(key) => from_pair(MapKey::VARIANT_COROUTINE, key.as_ffi()),
            StackValue::Pointer(key) => from_pair(MapKey::VARIANT_CELL, key.as_ffi()),
        }
    }
}

impl From<&MapKey> for StackValue {
    fn from(key: &MapKey) -> StackValue {
        match key.variant {
            MapKey::VARIANT_BOOL => StackValue::Bool(key.value != 0),
            MapKey::VARIANT_INT => StackValue::Number(key.value as i64 as f64),
            MapKey::VARIANT_FLOAT => StackValue::Number(f64::from_bits(key.value)),
            MapKey::VARIANT_BYTES => StackValue::Bytes(BytesObjectKey::from_ffi(key.value)),
            MapKey::VARIANT_TABLE => StackValue::Table(TableObjectKey::from_ffi(key.value)),
            MapKey::VARIANT_NATIVE_FN => {
                StackValue::NativeFunction(NativeFnObjectKey::from_ffi(key.value))
            }
            MapKey::VARIANT_FN => StackValue::Function(FnObjectKey::from_ffi(key.value)),
            MapKey::VARIANT_COROUTINE => {
                StackValue::Coroutine(CoroutineObjectKey::from_ffi(key.value))
            }
            MapKey::VARIANT_CELL => StackValue::Pointer(CellObjectKey::from_ffi(key.value)),
            _ => StackValue::Nil,
        }
    }
}

/// The hybrid table: a dense list part for `1..=n` and an insertion
/// ordered hash part for everything else. Iteration order within one
/// configuration is stable; the hash part only reorders on removal.
#[derive(Default, Clone)]
pub(crate) struct Table {
    pub(crate) list: Vec<StackValue>,
    pub(crate) map: IndexMap<MapKey, StackValue, BuildFastHasher>,
    pub(crate) flags: Cell<AbsentMetamethods>,
}

const BUCKET_SIZE: usize = std::mem::size_of::<usize>() + std::mem::size_of::<StackValue>() * 2;

impl Table {
    pub(crate) const LIST_ELEMENT_SIZE: usize = std::mem::size_of::<StackValue>();
    pub(crate) const MAP_ELEMENT_SIZE: usize = std::mem::size_of::<usize>() + BUCKET_SIZE;

    pub(crate) fn heap_size(&self) -> usize {
        self.map.len() * Self::MAP_ELEMENT_SIZE + self.list.len() * Self::LIST_ELEMENT_SIZE
    }

    pub(crate) fn reserve_list(&mut self, additional: usize) {
        self.list.reserve(additional);
    }

    pub(crate) fn reserve_map(&mut self, additional: usize) {
        self.map.reserve(additional);
    }

    pub(crate) fn list_len(&self) -> usize {
        self.list.len()
    }

    /// Rejects the keys `rawset` forbids.
    pub(crate) fn check_key(key: StackValue) -> Result<(), ErrorData> {
        match key {
            StackValue::Nil => Err(ErrorData::NilIndex),
            StackValue::Number(n) if n.is_nan() => Err(ErrorData::NaNIndex),
            _ => Ok(()),
        }
    }

    pub(crate) fn get(&self, key: StackValue) -> StackValue {
        if let StackValue::Number(n) = key {
            if let Some(i) = coerce_integer(n) {
                if i > 0 {
                    if let Some(value) = self.list.get(i as usize - 1) {
                        return *value;
                    }
                }
            }
        }

        self.get_from_map(key)
    }

    pub(crate) fn get_from_map(&self, key: StackValue) -> StackValue {
        let key = MapKey::from(key);

        if let Some(value) = self.map.get(&key) {
            *value
        } else {
            StackValue::Nil
        }
    }

    pub(crate) fn set(&mut self, key: StackValue, value: StackValue) {
        self.flags.set(AbsentMetamethods::empty());

        if let StackValue::Number(n) = key {
            if let Some(i) = coerce_integer(n) {
                if i > 0 && self.set_in_list(i as usize - 1, value) {
                    return;
                }
            }
        }

        self.set_in_map(key, value);
    }

    pub(crate) fn set_in_map(&mut self, key: StackValue, value: StackValue) {
        self.flags.set(AbsentMetamethods::empty());

        let key = MapKey::from(key);

        if value == StackValue::Nil {
            self.map.shift_remove(&key);
        } else {
            self.map.insert(key, value);
        }
    }

    fn set_in_list(&mut self, index: usize, value: StackValue) -> bool {
        match index.cmp(&self.list.len()) {
            std::cmp::Ordering::Less => {
                if value == StackValue::Nil && index + 1 == self.list.len() {
                    // drop the trailing run of nils with it
                    let reverse_iter = self.list.iter().rev();
                    let nil_count = reverse_iter
                        .skip(1)
                        .take_while(|v| **v == StackValue::Nil)
                        .count()
                        + 1;

                    let new_len = self.list.len() - nil_count;
                    self.list.truncate(new_len);
                } else {
                    self.list[index] = value;
                }
            }
            std::cmp::Ordering::Equal => {
                if value == StackValue::Nil {
                    return false;
                }

                self.list.push(value);

                // keys the hash part was holding may now continue the list
                self.merge_from_map_into_list();
            }
            std::cmp::Ordering::Greater => return false,
        }

        true
    }

    fn merge_from_map_into_list(&mut self) {
        let mut map_key = MapKey::int(self.list.len() as i64 + 1);

        while let Some(value) = self.map.swap_remove(&map_key) {
            self.list.push(value);
            map_key.value += 1;
        }
    }

    /// Writes `values` at list indices starting after `index_offset`,
    /// claiming any hash part entries they displace.
    pub(crate) fn flush(&mut self, index_offset: usize, values: &[StackValue]) {
        for i in 1..=values.len() {
            let map_key = MapKey::int((index_offset + i) as i64);
            self.map.swap_remove(&map_key);
        }

        let index_end = (index_offset + values.len()).min(self.list.len());
        self.list
            .splice(index_offset..index_end, values.iter().cloned());

        // a flush may leave trailing nils, which the list part never keeps
        while self.list.last() == Some(&StackValue::Nil) {
            self.list.pop();
        }

        self.merge_from_map_into_list();
        self.flags.set(AbsentMetamethods::empty());
    }

    /// A border: an `i` with `t[i] ~= nil` and `t[i + 1] == nil`.
    pub(crate) fn length(&self) -> i64 {
        let mut i = self.list.len() as i64;

        if i > 0 && !self.map.contains_key(&MapKey::int(i + 1)) {
            return i;
        }

        if i == 0 && self.map.is_empty() {
            return 0;
        }

        // the sequence continues into the hash part: double upward until a
        // nil appears, then binary search the gap
        let mut j = i + 1;

        while self.get(StackValue::Number(j as f64)) != StackValue::Nil {
            i = j;

            if j > i64::MAX / 2 {
                // malformed "sequence", fall back to a linear scan
                let mut n = i + 1;
                while self.get(StackValue::Number(n as f64)) != StackValue::Nil {
                    n += 1;
                }
                return n - 1;
            }

            j *= 2;
        }

        while j - i > 1 {
            let m = (i + j) / 2;

            if self.get(StackValue::Number(m as f64)) == StackValue::Nil {
                j = m;
            } else {
                i = m;
            }
        }

        i
    }

    /// Clears all values from the table, preserves the metatable.
    pub(crate) fn clear(&mut self) {
        self.list.clear();
        self.map.clear();
        self.flags.set(AbsentMetamethods::empty());
    }

    /// The iteration protocol behind `next`: all non-nil list slots in
    /// index order, then the hash part in slot order. Stable as long as no
    /// new key is inserted mid-iteration.
    pub(crate) fn next(&self, previous: StackValue) -> Result<Option<(StackValue, StackValue)>, ErrorData> {
        let list_resume = match previous {
            StackValue::Nil => Some(0),
            StackValue::Number(n) => match coerce_integer(n) {
                Some(i) if i >= 1 && (i as usize) <= self.list.len() => Some(i as usize),
                _ => None,
            },
            _ => None,
        };

        if let Some(start) = list_resume {
            for (offset, value) in self.list[start..].iter().enumerate() {
                if *value != StackValue::Nil {
                    let index = start + offset;
                    return Ok(Some((StackValue::Number((index + 1) as f64), *value)));
                }
            }

            return Ok(self.map.first().map(|(k, v)| (k.into(), *v)));
        }

        let Some(index) = self.map.get_index_of(&MapKey::from(previous)) else {
            return Err(ErrorData::InvalidRef);
        };

        Ok(self.map.get_index(index + 1).map(|(k, v)| (k.into(), *v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(value: f64) -> StackValue {
        StackValue::Number(value)
    }

    #[test]
    fn integral_float_keys_collide_with_integer_form() {
        let mut table = Table::default();

        table.set(n(1.0), StackValue::Bool(true));
        assert_eq!(table.get(n(1.0)), StackValue::Bool(true));
        assert_eq!(table.list_len(), 1);

        table.set(n(16.0), StackValue::Bool(false));
        assert_eq!(table.get_from_map(n(16.0)), StackValue::Bool(false));
        assert_eq!(MapKey::from(n(16.0)), MapKey::int(16));
    }

    #[test]
    fn appending_claims_hash_part_successors() {
        let mut table = Table::default();

        table.set(n(2.0), n(20.0));
        table.set(n(3.0), n(30.0));
        assert_eq!(table.list_len(), 0);

        table.set(n(1.0), n(10.0));
        assert_eq!(table.list_len(), 3);
        assert!(table.map.is_empty());
    }

    #[test]
    fn border_reported_for_sequences_and_gaps() {
        let mut table = Table::default();

        for i in 1..=5 {
            table.set(n(i as f64), n(i as f64));
        }
        assert_eq!(table.length(), 5);

        // removing the tail shrinks the border
        table.set(n(5.0), StackValue::Nil);
        assert_eq!(table.length(), 4);

        // a gap makes any border valid; ours must still satisfy the contract
        table.set(n(10.0), n(10.0));
        let border = table.length();
        assert!(table.get(n(border as f64)) != StackValue::Nil);
        assert_eq!(table.get(n(border as f64 + 1.0)), StackValue::Nil);
    }

    #[test]
    fn next_visits_every_entry_once() {
        let mut table = Table::default();

        table.set(n(1.0), n(10.0));
        table.set(n(2.0), n(20.0));
        table.set(StackValue::Bool(true), n(30.0));
        table.set(n(0.5), n(40.0));

        let mut seen = Vec::new();
        let mut previous = StackValue::Nil;

        while let Some((key, value)) = table.next(previous).unwrap() {
            seen.push((key, value));
            previous = key;
        }

        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0], (n(1.0), n(10.0)));
        assert_eq!(seen[1], (n(2.0), n(20.0)));
    }

    #[test]
    fn next_rejects_unknown_keys() {
        let table = Table::default();
        assert!(table.next(n(7.0)).is_err());
    }

    #[test]
    fn nil_and_nan_keys_rejected() {
        assert_eq!(Table::check_key(StackValue::Nil), Err(ErrorData::NilIndex));
        assert_eq!(
            Table::check_key(n(f64::NAN)),
            Err(ErrorData::NaNIndex)
        );
        assert!(Table::check_key(n(1.0)).is_ok());
    }
}
