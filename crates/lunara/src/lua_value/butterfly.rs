// The butterfly: one allocation addressed from a middle pointer.
//
// Word layout, relative to the butterfly pointer bp (in 8-byte words):
//
//   bp[-(2+cap)]  sparse-map pointer      (present only when HasSparseMap)
//   bp[-(1+cap)]  array element cap       (ordinal `cap`)
//      ...
//   bp[-2]        array element 1
//   bp[-1]        { array_length_if_continuous: i32, array_storage_capacity: u32 }
//   bp[0]         outlined named slot 0
//      ...
//   bp[named-1]   outlined named slot named-1
//
// `array_length_if_continuous` stores the first nil index: an empty
// continuous array stores 1, `{1,2,3}` stores 4 and `#t` is that minus one.
// When the array is not continuous the field holds -1 and length queries
// binary-search for a border.

use crate::lua_value::sparse_map::ArraySparseMap;
use crate::lua_value::tvalue::TValue;
use crate::gc::{UserHeapPtr, VmLayout};

#[derive(Clone, Copy)]
#[repr(C)]
pub struct ButterflyHeader {
    pub array_length_if_continuous: i32,
    pub array_storage_capacity: u32,
}

/// Opaque marker type: a butterfly is only ever touched through
/// `UserHeapPtr<Butterfly>` and the accessors below.
pub struct Butterfly {
    _opaque: [u8; 0],
}

pub const X_ARRAY_BASE_ORD: i64 = 1;

impl Butterfly {
    /// Allocates a butterfly with the given capacities, every slot nil,
    /// empty-continuous array header.
    pub fn allocate(
        layout: &mut VmLayout,
        array_capacity: u32,
        named_capacity: u32,
        with_sparse_word: bool,
    ) -> UserHeapPtr<Butterfly> {
        let lead_words = (with_sparse_word as usize) + array_capacity as usize + 1;
        let total_words = lead_words + named_capacity as usize;
        let addr = layout.alloc_from_user_heap(total_words * 8);
        let bp = addr + lead_words * 8;
        let result: UserHeapPtr<Butterfly> = UserHeapPtr::from_addr(bp);
        unsafe {
            let base = addr as *mut u64;
            for i in 0..total_words {
                *base.add(i) = TValue::nil().raw();
            }
            if with_sparse_word {
                *base = 0;
            }
            *Self::header_ptr(result) = ButterflyHeader {
                array_length_if_continuous: X_ARRAY_BASE_ORD as i32,
                array_storage_capacity: array_capacity,
            };
        }
        result
    }

    #[inline(always)]
    pub fn header_ptr(bp: UserHeapPtr<Butterfly>) -> *mut ButterflyHeader {
        unsafe { (bp.as_ptr() as *mut u64).offset(-1) as *mut ButterflyHeader }
    }

    #[inline(always)]
    pub unsafe fn header(bp: UserHeapPtr<Butterfly>) -> ButterflyHeader {
        *Self::header_ptr(bp)
    }

    #[inline(always)]
    pub unsafe fn array_capacity(bp: UserHeapPtr<Butterfly>) -> u32 {
        (*Self::header_ptr(bp)).array_storage_capacity
    }

    #[inline(always)]
    pub fn named_slot_ptr(bp: UserHeapPtr<Butterfly>, outlined_index: u32) -> *mut TValue {
        unsafe { (bp.as_ptr() as *mut TValue).add(outlined_index as usize) }
    }

    /// Address of array element `ord` (1-based).
    #[inline(always)]
    pub fn array_elem_ptr(bp: UserHeapPtr<Butterfly>, ord: i64) -> *mut TValue {
        debug_assert!(ord >= X_ARRAY_BASE_ORD);
        unsafe { (bp.as_ptr() as *mut TValue).offset(-(1 + ord) as isize) }
    }

    #[inline(always)]
    pub unsafe fn sparse_map_word_ptr(bp: UserHeapPtr<Butterfly>) -> *mut u64 {
        let cap = Self::array_capacity(bp);
        (bp.as_ptr() as *mut u64).offset(-(2 + cap as i64) as isize)
    }

    /// The attached sparse map, if the object's array type says one exists.
    #[inline]
    pub unsafe fn sparse_map(bp: UserHeapPtr<Butterfly>) -> UserHeapPtr<ArraySparseMap> {
        let raw = *Self::sparse_map_word_ptr(bp);
        UserHeapPtr::from_raw(raw as i64)
    }

    pub unsafe fn set_sparse_map(bp: UserHeapPtr<Butterfly>, map: UserHeapPtr<ArraySparseMap>) {
        *Self::sparse_map_word_ptr(bp) = map.raw() as u64;
    }

    /// Reallocates to the new capacities, copying the array part, named
    /// part and sparse word. The old allocation becomes collector garbage.
    ///
    /// # Safety
    /// `bp` must be a live butterfly; `old_named_capacity` and
    /// `old_has_sparse_word` must match the owning object's previous shape
    /// (the block itself cannot tell; the object's array-type flag is
    /// authoritative); the new capacities must not shrink below live data.
    pub unsafe fn grow(
        layout: &mut VmLayout,
        bp: UserHeapPtr<Butterfly>,
        old_named_capacity: u32,
        old_has_sparse_word: bool,
        new_array_capacity: u32,
        new_named_capacity: u32,
        new_has_sparse_word: bool,
    ) -> UserHeapPtr<Butterfly> {
        let old_hdr = Self::header(bp);
        let old_array_cap = old_hdr.array_storage_capacity;
        debug_assert!(new_array_capacity >= old_array_cap);
        debug_assert!(new_named_capacity >= old_named_capacity);

        let fresh = Self::allocate(layout, new_array_capacity, new_named_capacity, new_has_sparse_word);
        *Self::header_ptr(fresh) = ButterflyHeader {
            array_length_if_continuous: old_hdr.array_length_if_continuous,
            array_storage_capacity: new_array_capacity,
        };
        for ord in X_ARRAY_BASE_ORD..(X_ARRAY_BASE_ORD + old_array_cap as i64) {
            *Self::array_elem_ptr(fresh, ord) = *Self::array_elem_ptr(bp, ord);
        }
        for s in 0..old_named_capacity {
            *Self::named_slot_ptr(fresh, s) = *Self::named_slot_ptr(bp, s);
        }
        if new_has_sparse_word {
            let old_map = if old_has_sparse_word { *Self::sparse_map_word_ptr(bp) } else { 0 };
            *Self::sparse_map_word_ptr(fresh) = old_map;
        }
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_layout() {
        let mut layout = VmLayout::reserve();
        let bp = Butterfly::allocate(&mut layout, 4, 2, false);
        unsafe {
            let hdr = Butterfly::header(bp);
            assert_eq!(hdr.array_storage_capacity, 4);
            assert_eq!(hdr.array_length_if_continuous, 1);
            for ord in 1..=4 {
                assert!((*Butterfly::array_elem_ptr(bp, ord)).is_nil());
            }
            for s in 0..2 {
                assert!((*Butterfly::named_slot_ptr(bp, s)).is_nil());
            }
        }
    }

    #[test]
    fn test_grow_preserves_contents() {
        let mut layout = VmLayout::reserve();
        let bp = Butterfly::allocate(&mut layout, 2, 1, false);
        unsafe {
            *Butterfly::array_elem_ptr(bp, 1) = TValue::double(10.0);
            *Butterfly::array_elem_ptr(bp, 2) = TValue::double(20.0);
            *Butterfly::named_slot_ptr(bp, 0) = TValue::double(30.0);
            (*Butterfly::header_ptr(bp)).array_length_if_continuous = 3;

            let grown = Butterfly::grow(&mut layout, bp, 1, false, 8, 4, false);
            assert_eq!(Butterfly::header(grown).array_storage_capacity, 8);
            assert_eq!(Butterfly::header(grown).array_length_if_continuous, 3);
            assert_eq!((*Butterfly::array_elem_ptr(grown, 1)).as_double(), 10.0);
            assert_eq!((*Butterfly::array_elem_ptr(grown, 2)).as_double(), 20.0);
            assert!((*Butterfly::array_elem_ptr(grown, 3)).is_nil());
            assert_eq!((*Butterfly::named_slot_ptr(grown, 0)).as_double(), 30.0);
        }
    }
}
