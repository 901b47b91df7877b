// Shared anchor hash tables for large structures.
//
// Property lookup on a small structure is a linear scan of its inline name
// window (at most 8 entries). Once a lineage accumulates a full window, the
// window is flushed into an anchor table shared by every structure
// descending from that point: an open-addressed (name -> slot ordinal)
// table covering slots [0, num_properties). A descendant's lookup is then
// "probe the anchor, else scan the window".
//
// Anchors are immutable once built; extending a lineage past the next
// multiple-of-8 threshold builds a fresh anchor inheriting the previous
// one's entries (the shared name pointers are what make this cheap).

use crate::gc::gc_header::HeapEntityType;
use crate::gc::{GeneralHeapPtr, SystemHeapGcHeader, SystemHeapPtr, VmLayout};
use crate::lua_value::heap_string::HeapString;

#[repr(C)]
pub struct StructureAnchorHashTable {
    pub hdr: SystemHeapGcHeader,
    // 2 bytes padding
    pub num_properties: u32,
    pub size_mask: u32,
    // trailing: AnchorEntry x (size_mask + 1)
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct AnchorEntry {
    pub prop: GeneralHeapPtr<HeapString>, // 0 = empty
    pub ordinal: u32,
}

const X_TRAILING_OFFSET: usize = std::mem::size_of::<StructureAnchorHashTable>();

impl StructureAnchorHashTable {
    #[inline(always)]
    fn entries_ptr(&self) -> *mut AnchorEntry {
        unsafe { (self as *const _ as *mut u8).add(X_TRAILING_OFFSET) as *mut AnchorEntry }
    }

    #[inline(always)]
    fn entry(&self, slot: u32) -> AnchorEntry {
        debug_assert!(slot <= self.size_mask);
        unsafe { *self.entries_ptr().add(slot as usize) }
    }

    /// Slot ordinal of `prop`, if covered by this anchor.
    pub fn lookup(&self, prop: GeneralHeapPtr<HeapString>) -> Option<u32> {
        let hash_low = unsafe { prop.to_user().as_ref() }.hash_low;
        let mut slot = hash_low & self.size_mask;
        loop {
            let e = self.entry(slot);
            if e.prop.is_null() {
                return None;
            }
            if e.prop == prop {
                return Some(e.ordinal);
            }
            slot = (slot + 1) & self.size_mask;
        }
    }

    /// Name of property ordinal `ord` (linear scan; iteration path only).
    pub fn name_of_ordinal(&self, ord: u32) -> Option<GeneralHeapPtr<HeapString>> {
        debug_assert!(ord < self.num_properties);
        for slot in 0..=self.size_mask {
            let e = self.entry(slot);
            if !e.prop.is_null() && e.ordinal == ord {
                return Some(e.prop);
            }
        }
        None
    }

    /// Builds an anchor covering `prev`'s properties plus `new_block`
    /// (the flushed window, ordinals starting at the previous coverage).
    pub fn build(
        layout: &mut VmLayout,
        prev: Option<SystemHeapPtr<StructureAnchorHashTable>>,
        new_block: &[GeneralHeapPtr<HeapString>],
    ) -> SystemHeapPtr<StructureAnchorHashTable> {
        let prev_count = prev.map_or(0, |p| unsafe { p.as_ref() }.num_properties);
        let num_properties = prev_count + new_block.len() as u32;

        // Capacity = next power of two with load <= 1/2.
        let mut capacity = 16u32;
        while capacity < num_properties * 2 {
            capacity *= 2;
        }
        let size_mask = capacity - 1;

        let alloc_size = X_TRAILING_OFFSET + capacity as usize * std::mem::size_of::<AnchorEntry>();
        let addr = layout.alloc_from_system_heap(alloc_size);
        let result: SystemHeapPtr<StructureAnchorHashTable> = SystemHeapPtr::from_addr(addr);
        unsafe {
            let t = result.as_mut();
            t.hdr = SystemHeapGcHeader::new(HeapEntityType::StructureAnchorHashTable);
            t.num_properties = num_properties;
            t.size_mask = size_mask;
            std::ptr::write_bytes(t.entries_ptr() as *mut u8, 0,
                capacity as usize * std::mem::size_of::<AnchorEntry>());

            unsafe fn insert(
                t: &StructureAnchorHashTable,
                prop: GeneralHeapPtr<HeapString>,
                ordinal: u32,
            ) {
                let hash_low = prop.to_user().as_ref().hash_low;
                let mut slot = hash_low & t.size_mask;
                loop {
                    let e = t.entries_ptr().add(slot as usize);
                    if (*e).prop.is_null() {
                        *e = AnchorEntry { prop, ordinal };
                        return;
                    }
                    slot = (slot + 1) & t.size_mask;
                }
            }

            if let Some(p) = prev {
                let prev_t = p.as_ref();
                for slot in 0..=prev_t.size_mask {
                    let e = prev_t.entry(slot);
                    if !e.prop.is_null() {
                        insert(t, e.prop, e.ordinal);
                    }
                }
            }
            for (i, &prop) in new_block.iter().enumerate() {
                insert(t, prop, prev_count + i as u32);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::StringInterner;

    #[test]
    fn test_build_and_lookup() {
        let mut layout = VmLayout::reserve();
        let mut interner = StringInterner::new(&mut layout);
        let props: Vec<GeneralHeapPtr<HeapString>> = (0..8)
            .map(|i| {
                GeneralHeapPtr::from_user(interner.intern(&mut layout, format!("p{}", i).as_bytes()))
            })
            .collect();
        let anchor = StructureAnchorHashTable::build(&mut layout, None, &props);
        let a = unsafe { anchor.as_ref() };
        assert_eq!(a.num_properties, 8);
        for (i, &p) in props.iter().enumerate() {
            assert_eq!(a.lookup(p), Some(i as u32));
        }
        let absent = GeneralHeapPtr::from_user(interner.intern(&mut layout, b"absent"));
        assert_eq!(a.lookup(absent), None);
    }

    #[test]
    fn test_inheritance_chain() {
        let mut layout = VmLayout::reserve();
        let mut interner = StringInterner::new(&mut layout);
        let mk = |interner: &mut StringInterner, layout: &mut VmLayout, name: String| {
            GeneralHeapPtr::from_user(interner.intern(layout, name.as_bytes()))
        };
        let block1: Vec<_> = (0..8).map(|i| mk(&mut interner, &mut layout, format!("a{}", i))).collect();
        let block2: Vec<_> = (0..8).map(|i| mk(&mut interner, &mut layout, format!("b{}", i))).collect();
        let first = StructureAnchorHashTable::build(&mut layout, None, &block1);
        let second = StructureAnchorHashTable::build(&mut layout, Some(first), &block2);
        let s = unsafe { second.as_ref() };
        assert_eq!(s.num_properties, 16);
        assert_eq!(s.lookup(block1[3]), Some(3));
        assert_eq!(s.lookup(block2[5]), Some(13));
        // The older anchor is untouched.
        assert_eq!(unsafe { first.as_ref() }.num_properties, 8);
    }
}
