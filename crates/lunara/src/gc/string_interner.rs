// Global string conser.
//
// All strings are interned: equality on strings is pointer equality. The
// table is open-addressed with linear probing over 4-byte
// GeneralHeapPtr<HeapString> entries; load factor is kept at or below 1/2.
// Entry value 0 marks a never-used slot, 4 a tombstone (both are invalid
// object offsets, so neither can collide with a real string).
//
// Multi-piece constructors first materialize the content into a scratch
// buffer, then hash once; the incremental hasher is not stable across
// write boundaries, so hashing the assembled bytes is the only way to make
// piecewise and whole-string construction agree.

use ahash::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};

use crate::gc::heap_ptr::GeneralHeapPtr;
use crate::gc::{UserHeapPtr, VmLayout};
use crate::lua_value::heap_string::HeapString;
use crate::lua_value::TValue;

const X_NONEXISTENT: i32 = 0;
const X_DELETED: i32 = 4;

const X_INITIAL_SIZE: u32 = 1024;

// max load factor = numerator / 2^shift
const X_LOADFACTOR_NUMERATOR: u32 = 1;
const X_LOADFACTOR_DENOMINATOR_SHIFT: u32 = 1;

pub struct StringInterner {
    table: Vec<GeneralHeapPtr<HeapString>>,
    size_mask: u32,
    element_count: u32,
    hash_builder: RandomState,
    scratch: Vec<u8>,

    // In PolyMetatable mode the metatable is stored in a property slot
    // keyed by this string. Never inserted into the table; carries a fake
    // hash so it cannot collide with a real string of the same content in
    // any structure hash table.
    special_key_for_metatable_slot: UserHeapPtr<HeapString>,
    // Keys standing in for boolean table indices, same treatment.
    special_key_for_boolean_index: [UserHeapPtr<HeapString>; 2],
}

#[inline]
fn is_nonexistent_or_deleted(e: GeneralHeapPtr<HeapString>) -> bool {
    e.raw() >= 0
}

impl StringInterner {
    pub fn new(layout: &mut VmLayout) -> Self {
        let mut interner = StringInterner {
            table: vec![GeneralHeapPtr::null(); X_INITIAL_SIZE as usize],
            size_mask: X_INITIAL_SIZE - 1,
            element_count: 0,
            hash_builder: RandomState::new(),
            scratch: Vec::with_capacity(256),
            special_key_for_metatable_slot: UserHeapPtr::null(),
            special_key_for_boolean_index: [UserHeapPtr::null(); 2],
        };

        // Content is for debugging only; the fake hashes keep these keys
        // clear of real strings sharing the same bytes.
        interner.special_key_for_metatable_slot =
            Self::create_special_key(layout, b"(hidden_mt_tbl)", 0x01F2_E3D4_C5B6_A798);
        interner.special_key_for_boolean_index[0] =
            Self::create_special_key(layout, b"(hidden_false)", 0x0897_A6B5_C4D3_E2F1);
        interner.special_key_for_boolean_index[1] =
            Self::create_special_key(layout, b"(hidden_true)", 0x0C5B_4D6A_3E79_2F81);
        interner
    }

    fn create_special_key(layout: &mut VmLayout, name: &[u8], fake_hash: u64) -> UserHeapPtr<HeapString> {
        HeapString::materialize(layout, &[name], name.len(), fake_hash)
    }

    #[inline(always)]
    pub fn special_key_for_metatable_slot(&self) -> UserHeapPtr<HeapString> {
        self.special_key_for_metatable_slot
    }

    #[inline(always)]
    pub fn special_key_for_boolean(&self, v: bool) -> UserHeapPtr<HeapString> {
        self.special_key_for_boolean_index[v as usize]
    }

    #[inline]
    fn hash_bytes(&self, bytes: &[u8]) -> u64 {
        let mut hasher = self.hash_builder.build_hasher();
        bytes.hash(&mut hasher);
        hasher.finish()
    }

    /// Interns raw bytes. Zero length and embedded NULs are fine.
    pub fn intern(&mut self, layout: &mut VmLayout, bytes: &[u8]) -> UserHeapPtr<HeapString> {
        let hash = self.hash_bytes(bytes);
        self.insert_hashed(layout, bytes as *const [u8], hash)
    }

    /// Interns the concatenation of `values`, every element of which must be
    /// a string TValue.
    pub fn intern_concatenation(
        &mut self,
        layout: &mut VmLayout,
        values: &[TValue],
    ) -> UserHeapPtr<HeapString> {
        self.scratch.clear();
        for v in values {
            debug_assert!(v.is_string());
            let s = unsafe { v.as_pointer::<HeapString>().as_ref() };
            self.scratch.extend_from_slice(s.as_bytes());
        }
        let hash = self.hash_bytes(&self.scratch);
        self.insert_hashed(layout, &self.scratch[..] as *const [u8], hash)
    }

    /// Interns `prefix .. values[0] .. values[1] ..`, same contract.
    pub fn intern_prefixed_concatenation(
        &mut self,
        layout: &mut VmLayout,
        prefix: UserHeapPtr<HeapString>,
        values: &[TValue],
    ) -> UserHeapPtr<HeapString> {
        self.scratch.clear();
        self.scratch.extend_from_slice(unsafe { prefix.as_ref() }.as_bytes());
        for v in values {
            debug_assert!(v.is_string());
            let s = unsafe { v.as_pointer::<HeapString>().as_ref() };
            self.scratch.extend_from_slice(s.as_bytes());
        }
        let hash = self.hash_bytes(&self.scratch);
        self.insert_hashed(layout, &self.scratch[..] as *const [u8], hash)
    }

    // `bytes` is a raw slice pointer so callers may pass self.scratch; the
    // probe loop never mutates the scratch buffer.
    fn insert_hashed(
        &mut self,
        layout: &mut VmLayout,
        bytes: *const [u8],
        hash: u64,
    ) -> UserHeapPtr<HeapString> {
        let bytes: &[u8] = unsafe { &*bytes };
        let expected_high = (hash >> 48) as u16;
        let expected_low = hash as u32;

        let mut slot_for_insertion: Option<u32> = None;
        let mut slot = (hash as u32) & self.size_mask;
        loop {
            let e = self.table[slot as usize];
            if is_nonexistent_or_deleted(e) {
                if slot_for_insertion.is_none() {
                    slot_for_insertion = Some(slot);
                }
                if e.raw() == X_NONEXISTENT {
                    break;
                }
            } else {
                let s = unsafe { e.to_user().as_ref() };
                if s.hash_high == expected_high
                    && s.hash_low == expected_low
                    && s.length as usize == bytes.len()
                    && s.as_bytes() == bytes
                {
                    return e.to_user();
                }
            }
            slot = (slot + 1) & self.size_mask;
        }

        let slot = slot_for_insertion.unwrap();
        self.element_count += 1;
        let new_string = HeapString::materialize(layout, &[bytes], bytes.len(), hash);
        self.table[slot as usize] = GeneralHeapPtr::from_user(new_string);
        self.expand_if_needed();
        new_string
    }

    fn expand_if_needed(&mut self) {
        if self.element_count
            <= (self.size_mask >> X_LOADFACTOR_DENOMINATOR_SHIFT) * X_LOADFACTOR_NUMERATOR
        {
            return;
        }
        assert!(self.size_mask < (1u32 << 29), "global string table over 2^30 slots");
        let new_size = (self.size_mask + 1) * 2;
        let new_mask = new_size - 1;
        let mut new_table = vec![GeneralHeapPtr::null(); new_size as usize];
        for &e in &self.table {
            if !is_nonexistent_or_deleted(e) {
                let mut slot = unsafe { e.to_user().as_ref() }.hash_low & new_mask;
                while new_table[slot as usize].raw() != X_NONEXISTENT {
                    slot = (slot + 1) & new_mask;
                }
                new_table[slot as usize] = e;
            }
        }
        self.table = new_table;
        self.size_mask = new_mask;
    }

    /// Drops a swept string's slot to a tombstone (collector hook).
    pub fn remove_dead(&mut self, dead: UserHeapPtr<HeapString>) {
        let g = GeneralHeapPtr::from_user(dead);
        let hash_low = unsafe { dead.as_ref() }.hash_low;
        let mut slot = hash_low & self.size_mask;
        loop {
            let e = self.table[slot as usize];
            if e.raw() == X_NONEXISTENT {
                return;
            }
            if e == g {
                self.table[slot as usize] = GeneralHeapPtr::from_raw(X_DELETED);
                self.element_count -= 1;
                return;
            }
            slot = (slot + 1) & self.size_mask;
        }
    }

    pub fn current_table_size(&self) -> u32 {
        self.size_mask + 1
    }

    pub fn current_element_count(&self) -> u32 {
        self.element_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::VmLayout;

    #[test]
    fn test_intern_uniqueness() {
        let mut layout = VmLayout::reserve();
        let mut interner = StringInterner::new(&mut layout);
        let a = interner.intern(&mut layout, b"hello");
        let b = interner.intern(&mut layout, b"hello");
        let c = interner.intern(&mut layout, b"hellx");
        assert_eq!(a, b);
        assert!(a != c);
        assert_eq!(interner.current_element_count(), 2);
    }

    #[test]
    fn test_empty_and_embedded_nul() {
        let mut layout = VmLayout::reserve();
        let mut interner = StringInterner::new(&mut layout);
        let empty = interner.intern(&mut layout, b"");
        assert_eq!(unsafe { empty.as_ref() }.length, 0);
        let a = interner.intern(&mut layout, b"a\0b");
        let b = interner.intern(&mut layout, b"a\0b");
        assert_eq!(a, b);
        assert_eq!(unsafe { a.as_ref() }.as_bytes(), b"a\0b");
    }

    #[test]
    fn test_concatenation_matches_raw() {
        let mut layout = VmLayout::reserve();
        let mut interner = StringInterner::new(&mut layout);
        let ab = interner.intern(&mut layout, b"ab");
        let c = interner.intern(&mut layout, b"c");
        let joined = interner
            .intern_concatenation(&mut layout, &[TValue::pointer(ab), TValue::pointer(c)]);
        let whole = interner.intern(&mut layout, b"abc");
        // Pointer equality: an interned concatenation IS the literal.
        assert_eq!(joined, whole);
    }

    #[test]
    fn test_prefixed_concatenation() {
        let mut layout = VmLayout::reserve();
        let mut interner = StringInterner::new(&mut layout);
        let pre = interner.intern(&mut layout, b"foo");
        let bar = interner.intern(&mut layout, b"bar");
        let joined =
            interner.intern_prefixed_concatenation(&mut layout, pre, &[TValue::pointer(bar)]);
        assert_eq!(joined, interner.intern(&mut layout, b"foobar"));
    }

    #[test]
    fn test_growth_keeps_uniqueness() {
        let mut layout = VmLayout::reserve();
        let mut interner = StringInterner::new(&mut layout);
        let mut firsts = Vec::new();
        for i in 0..2000 {
            let s = format!("key_{}", i);
            firsts.push(interner.intern(&mut layout, s.as_bytes()));
        }
        assert!(interner.current_table_size() >= 4096);
        for (i, &p) in firsts.iter().enumerate() {
            let s = format!("key_{}", i);
            assert_eq!(interner.intern(&mut layout, s.as_bytes()), p);
        }
    }

    #[test]
    fn test_special_keys_not_interned() {
        let mut layout = VmLayout::reserve();
        let mut interner = StringInterner::new(&mut layout);
        let hidden = interner.special_key_for_metatable_slot();
        let normal = interner.intern(&mut layout, b"(hidden_mt_tbl)");
        assert!(hidden != normal);
        assert!(interner.special_key_for_boolean(false) != interner.special_key_for_boolean(true));
    }
}
