// Table iteration.
//
// `TableObjectIterator` packs into a single 8-byte word so the KV-loop
// bytecode can park it in a stack slot: { phase, ordinal }. The encoded
// word keeps its high 16 bits zero, so a stale slot read as a TValue is a
// harmless small double and inert to anything scanning the stack.
//
// Visit order is array part (ascending index), then sparse map (ascending
// numeric key), then named properties (slot order). Hidden slots (the
// polymetatable sentinel) are skipped; boolean sentinel keys decode back
// to true/false. `table_next` re-derives the same sequence from a previous
// key, which is the `next(t, k)` library contract.

use crate::gc::{GeneralHeapPtr, UserHeapPtr};
use crate::lua_value::butterfly::{Butterfly, X_ARRAY_BASE_ORD};
use crate::lua_value::heap_string::HeapString;
use crate::lua_value::table_object::{HiddenClassKind, TableObject};
use crate::lua_value::tvalue::TValue;

const PHASE_ARRAY: u64 = 0;
const PHASE_SPARSE: u64 = 1;
const PHASE_NAMED: u64 = 2;
const PHASE_DONE: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct TableObjectIterator(u64);

pub struct KeyValuePair {
    pub key: TValue,
    pub value: TValue,
}

/// Identity of the hidden boolean/metatable sentinel keys, resolved by the
/// caller (the VM owns the interner).
#[derive(Clone, Copy)]
pub struct IterationSentinels {
    pub metatable_slot: GeneralHeapPtr<HeapString>,
    pub boolean_false: GeneralHeapPtr<HeapString>,
    pub boolean_true: GeneralHeapPtr<HeapString>,
}

impl IterationSentinels {
    fn decode_key(&self, name: GeneralHeapPtr<HeapString>) -> Option<TValue> {
        if name == self.metatable_slot {
            None
        } else if name == self.boolean_false {
            Some(TValue::create_false())
        } else if name == self.boolean_true {
            Some(TValue::create_true())
        } else {
            Some(TValue::pointer(name.to_user()))
        }
    }
}

impl TableObjectIterator {
    #[inline(always)]
    pub fn new() -> TableObjectIterator {
        TableObjectIterator(PHASE_ARRAY << 48)
    }

    #[inline(always)]
    pub fn from_raw(raw: u64) -> TableObjectIterator {
        TableObjectIterator(raw)
    }

    #[inline(always)]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    fn phase(self) -> u64 {
        self.0 >> 48
    }

    #[inline(always)]
    fn ordinal(self) -> u64 {
        self.0 & 0xFFFF_FFFF_FFFF
    }

    #[inline(always)]
    fn pack(phase: u64, ordinal: u64) -> TableObjectIterator {
        TableObjectIterator((phase << 48) | ordinal)
    }

    /// Advances past the current position, returning the next pair and
    /// mutating self. Key nil means exhausted.
    pub fn advance(
        &mut self,
        table: UserHeapPtr<TableObject>,
        sentinels: IterationSentinels,
    ) -> KeyValuePair {
        let t = unsafe { table.as_ref() };
        let mut phase = self.phase();
        let mut ord = self.ordinal();

        if phase == PHASE_ARRAY {
            if !t.butterfly.is_null() {
                let cap = unsafe { Butterfly::array_capacity(t.butterfly) } as u64;
                let mut i = ord + X_ARRAY_BASE_ORD as u64;
                while i <= cap {
                    let v = unsafe { *Butterfly::array_elem_ptr(t.butterfly, i as i64) };
                    if !v.is_nil() {
                        *self = Self::pack(PHASE_ARRAY, i);
                        return KeyValuePair { key: TValue::double(i as f64), value: v };
                    }
                    i += 1;
                }
            }
            phase = PHASE_SPARSE;
            ord = 0;
        }

        if phase == PHASE_SPARSE {
            if TableObject::array_type(table).has_sparse_map() && !t.butterfly.is_null() {
                let map = unsafe { Butterfly::sparse_map(t.butterfly) };
                if !map.is_null() {
                    if let Some((k, v)) = unsafe { map.as_ref() }.nth(ord as usize) {
                        *self = Self::pack(PHASE_SPARSE, ord + 1);
                        return KeyValuePair { key: TValue::double(k), value: v };
                    }
                }
            }
            phase = PHASE_NAMED;
            ord = 0;
        }

        if phase == PHASE_NAMED {
            loop {
                let (name, slot) = match Self::named_property_at(table, ord as u32) {
                    Some(pair) => pair,
                    None => break,
                };
                ord += 1;
                let value = TableObject::get_value_at_slot(table, slot);
                if value.is_nil() {
                    continue;
                }
                if let Some(key) = sentinels.decode_key(name) {
                    *self = Self::pack(PHASE_NAMED, ord);
                    return KeyValuePair { key, value };
                }
            }
        }

        *self = Self::pack(PHASE_DONE, 0);
        KeyValuePair { key: TValue::nil(), value: TValue::nil() }
    }

    fn named_property_at(
        table: UserHeapPtr<TableObject>,
        ord: u32,
    ) -> Option<(GeneralHeapPtr<HeapString>, u32)> {
        match TableObject::hidden_class_kind(table) {
            HiddenClassKind::Structure(s) => {
                let sr = unsafe { s.as_ref() };
                if ord >= sr.num_slots as u32 {
                    return None;
                }
                sr.name_of_slot(ord as u8).map(|n| (n, ord))
            }
            HiddenClassKind::Dictionary(d) => {
                let dr = unsafe { d.as_ref() };
                if ord >= dr.num_slots {
                    return None;
                }
                dr.name_of_slot(ord).map(|n| (n, ord))
            }
        }
    }
}

impl Default for TableObjectIterator {
    fn default() -> Self {
        Self::new()
    }
}

pub enum TableNextResult {
    Pair(KeyValuePair),
    /// The supplied key does not exist in the table.
    InvalidKey,
}

/// `next(t, key)`: re-derives the iterator position from the previous key.
pub fn table_next(
    table: UserHeapPtr<TableObject>,
    key: TValue,
    sentinels: IterationSentinels,
) -> TableNextResult {
    let t = unsafe { table.as_ref() };

    let mut iter = if key.is_nil() {
        TableObjectIterator::new()
    } else if key.is_double() || key.is_int32() {
        let d = key.as_number().unwrap();
        let as_int = d as i64;
        let array_cap = if t.butterfly.is_null() {
            0
        } else {
            unsafe { Butterfly::array_capacity(t.butterfly) as i64 }
        };
        if as_int as f64 == d && (X_ARRAY_BASE_ORD..=array_cap).contains(&as_int) {
            TableObjectIterator::from_raw((PHASE_ARRAY << 48) | as_int as u64)
        } else {
            // A numeric key outside the vector must be in the sparse map.
            let map = if TableObject::array_type(table).has_sparse_map() && !t.butterfly.is_null()
            {
                unsafe { Butterfly::sparse_map(t.butterfly) }
            } else {
                UserHeapPtr::null()
            };
            if map.is_null() {
                return TableNextResult::InvalidKey;
            }
            match unsafe { map.as_ref() }.ordinal_of(d) {
                Some(ord) => {
                    TableObjectIterator::from_raw((PHASE_SPARSE << 48) | (ord as u64 + 1))
                }
                None => return TableNextResult::InvalidKey,
            }
        }
    } else {
        // String or boolean key: resume inside the named phase.
        let name = if key.is_boolean() {
            if key.as_boolean() { sentinels.boolean_true } else { sentinels.boolean_false }
        } else if key.is_string() {
            key.as_general_pointer()
        } else {
            return TableNextResult::InvalidKey;
        };
        let slot = match TableObject::hidden_class_kind(table) {
            HiddenClassKind::Structure(s) => {
                unsafe { s.as_ref() }.lookup_property(name).map(|s| s as u32)
            }
            HiddenClassKind::Dictionary(d) => unsafe { d.as_ref() }.lookup_property(name),
        };
        match slot {
            Some(s) => TableObjectIterator::from_raw((PHASE_NAMED << 48) | (s as u64 + 1)),
            None => return TableNextResult::InvalidKey,
        }
    };

    TableNextResult::Pair(iter.advance(table, sentinels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::{StringInterner, VmLayout};
    use crate::hidden_class::structure::Structure;

    struct Env {
        layout: Box<VmLayout>,
        interner: StringInterner,
    }

    fn setup() -> Env {
        let mut layout = VmLayout::reserve();
        let interner = StringInterner::new(&mut layout);
        Env { layout, interner }
    }

    fn sentinels(env: &StringInterner) -> IterationSentinels {
        IterationSentinels {
            metatable_slot: GeneralHeapPtr::from_user(env.special_key_for_metatable_slot()),
            boolean_false: GeneralHeapPtr::from_user(env.special_key_for_boolean(false)),
            boolean_true: GeneralHeapPtr::from_user(env.special_key_for_boolean(true)),
        }
    }

    #[test]
    fn test_iterates_all_parts_once() {
        let mut env = setup();
        let root = Structure::create_initial(&mut env.layout, 2);
        let t = TableObject::create_empty(&mut env.layout, root, 4);
        for i in 1..=3i64 {
            TableObject::raw_put_by_integer_index(t, &mut env.layout, i, TValue::double(i as f64));
        }
        TableObject::raw_put_by_double_index(t, &mut env.layout, 0.5, TValue::double(99.0));
        let k = env.interner.intern(&mut env.layout, b"name");
        TableObject::put_by_id(t, &mut env.layout, k, TValue::double(42.0));

        let s = sentinels(&env.interner);
        let mut iter = TableObjectIterator::new();
        let mut seen = Vec::new();
        loop {
            let kv = iter.advance(t, s);
            if kv.key.is_nil() {
                break;
            }
            seen.push((kv.key, kv.value));
        }
        assert_eq!(seen.len(), 5);
        // Array ascending first, then sparse, then named.
        assert_eq!(seen[0].0.as_double(), 1.0);
        assert_eq!(seen[1].0.as_double(), 2.0);
        assert_eq!(seen[2].0.as_double(), 3.0);
        assert_eq!(seen[3].0.as_double(), 0.5);
        assert!(seen[4].0.is_string());
    }

    #[test]
    fn test_table_next_resumes_by_key() {
        let mut env = setup();
        let root = Structure::create_initial(&mut env.layout, 2);
        let t = TableObject::create_empty(&mut env.layout, root, 4);
        for i in 1..=2i64 {
            TableObject::raw_put_by_integer_index(t, &mut env.layout, i, TValue::double(i as f64));
        }
        let s = sentinels(&env.interner);

        let first = match table_next(t, TValue::nil(), s) {
            TableNextResult::Pair(kv) => kv,
            _ => panic!(),
        };
        assert_eq!(first.key.as_double(), 1.0);
        let second = match table_next(t, first.key, s) {
            TableNextResult::Pair(kv) => kv,
            _ => panic!(),
        };
        assert_eq!(second.key.as_double(), 2.0);
        let done = match table_next(t, second.key, s) {
            TableNextResult::Pair(kv) => kv,
            _ => panic!(),
        };
        assert!(done.key.is_nil());

        assert!(matches!(
            table_next(t, TValue::double(77.0), s),
            TableNextResult::InvalidKey
        ));
    }

    #[test]
    fn test_boolean_keys_decode() {
        let mut env = setup();
        let root = Structure::create_initial(&mut env.layout, 2);
        let t = TableObject::create_empty(&mut env.layout, root, 0);
        let false_key = env.interner.special_key_for_boolean(false);
        TableObject::put_by_id(t, &mut env.layout, false_key, TValue::double(1.0));
        let s = sentinels(&env.interner);
        let mut iter = TableObjectIterator::new();
        let kv = iter.advance(t, s);
        assert!(kv.key.is_false());
        assert_eq!(kv.value.as_double(), 1.0);
    }

    #[test]
    fn test_hidden_metatable_slot_skipped() {
        let mut env = setup();
        let root = Structure::create_initial(&mut env.layout, 2);
        let a = TableObject::create_empty(&mut env.layout, root, 0);
        let b = TableObject::create_empty(&mut env.layout, root, 0);
        let mt1 = TableObject::create_empty(&mut env.layout, root, 0);
        let mt2 = TableObject::create_empty(&mut env.layout, root, 0);
        let sent = GeneralHeapPtr::from_user(env.interner.special_key_for_metatable_slot());
        // Force b into polymetatable mode so the hidden slot exists.
        TableObject::set_metatable(a, &mut env.layout, sent, mt1);
        TableObject::set_metatable(b, &mut env.layout, sent, mt2);
        TableObject::set_metatable(b, &mut env.layout, sent, mt1);

        let s = sentinels(&env.interner);
        let mut iter = TableObjectIterator::new();
        let kv = iter.advance(b, s);
        assert!(kv.key.is_nil(), "hidden metatable slot must not be visible");
    }
}
