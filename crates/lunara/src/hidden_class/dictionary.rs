// Dictionary hidden classes.
//
// When a table outgrows the structure slot cap its shape stops being
// shareable: the object gets a private dictionary hidden class mapping
// property names to slots directly. A CacheableDictionary is still a valid
// inline-cache key (it is unique to one object and its slots never move);
// found slots are cacheable, absent results are not (a later add would
// invalidate them silently). Mutating the metatable of a cacheable
// dictionary would likewise invalidate dictionary-keyed caches in place,
// so that converts the object to an UncacheableDictionary, where no IC may
// cache anything.

use std::mem::ManuallyDrop;

use crate::gc::gc_header::HeapEntityType;
use crate::gc::{GeneralHeapPtr, SystemHeapGcHeader, SystemHeapPtr, UserHeapPtr, VmLayout};
use crate::lua_value::heap_string::HeapString;
use crate::lua_value::table_object::TableObject;

use super::array_type::ArrayType;
use super::structure::Structure;

type PropMap = hashbrown::HashMap<i32, u32, ahash::RandomState>;

#[repr(C)]
pub struct DictionaryHiddenClass {
    pub hdr: SystemHeapGcHeader,
    pub inline_named_storage_capacity: u8,
    _pad: u8,
    pub array_type: ArrayType,
    _pad2: [u8; 3],
    pub butterfly_named_storage_capacity: u32,
    pub num_slots: u32,
    pub metatable: UserHeapPtr<TableObject>,
    pub known_absent_metamethod_mask: u32,
    // Lives in raw system-heap storage for the VM's lifetime; never dropped
    // (the collector reclaims the whole class object).
    map: ManuallyDrop<PropMap>,
}

impl DictionaryHiddenClass {
    #[inline(always)]
    pub fn is_cacheable(&self) -> bool {
        self.hdr.ty == HeapEntityType::CacheableDictionary
    }

    /// Builds a dictionary class from a saturated structure, appending one
    /// new property. Returns (class, slot of the new property).
    pub fn create_from_structure(
        layout: &mut VmLayout,
        structure: &Structure,
        new_prop: GeneralHeapPtr<HeapString>,
    ) -> (SystemHeapPtr<DictionaryHiddenClass>, u32) {
        let addr = layout.alloc_from_system_heap(std::mem::size_of::<DictionaryHiddenClass>());
        let ptr: SystemHeapPtr<DictionaryHiddenClass> = SystemHeapPtr::from_addr(addr);

        let mut map = PropMap::with_capacity_and_hasher(
            structure.num_slots as usize + 1,
            ahash::RandomState::new(),
        );
        for (name, ord) in structure.enumerate_properties() {
            map.insert(name.raw(), ord as u32);
        }
        let new_slot = structure.num_slots as u32;
        map.insert(new_prop.raw(), new_slot);

        let mut mask = structure.known_absent_metamethod_mask;
        if let Some(ord) = unsafe { new_prop.to_user().as_ref() }.metamethod_ordinal() {
            mask &= !(1u32 << ord);
        }

        // Reserve headroom for the slot we just appended.
        let needed_outlined = (new_slot + 1)
            .saturating_sub(structure.inline_named_storage_capacity as u32);
        let butterfly_cap = core::cmp::max(
            structure.butterfly_named_storage_capacity as u32,
            needed_outlined.next_power_of_two().max(4),
        );

        unsafe {
            let d = ptr.as_mut();
            std::ptr::write(
                d as *mut DictionaryHiddenClass,
                DictionaryHiddenClass {
                    hdr: SystemHeapGcHeader::new(HeapEntityType::CacheableDictionary),
                    inline_named_storage_capacity: structure.inline_named_storage_capacity,
                    _pad: 0,
                    array_type: structure.array_type,
                    _pad2: [0; 3],
                    butterfly_named_storage_capacity: butterfly_cap,
                    num_slots: new_slot + 1,
                    metatable: match structure.metatable_kind {
                        super::structure::StructureMetatableKind::Unique => structure.metatable,
                        _ => UserHeapPtr::null(),
                    },
                    known_absent_metamethod_mask: mask,
                    map: ManuallyDrop::new(map),
                },
            );
        }
        (ptr, new_slot)
    }

    #[inline]
    pub fn lookup_property(&self, prop: GeneralHeapPtr<HeapString>) -> Option<u32> {
        self.map.get(&prop.raw()).copied()
    }

    /// Appends a property in place (the class is per-object so no fork is
    /// needed). Returns (slot, new butterfly capacity when storage must
    /// grow).
    pub fn add_property(&mut self, prop: GeneralHeapPtr<HeapString>) -> (u32, Option<u32>) {
        debug_assert!(self.lookup_property(prop).is_none());
        let slot = self.num_slots;
        self.map.insert(prop.raw(), slot);
        self.num_slots += 1;
        if let Some(ord) = unsafe { prop.to_user().as_ref() }.metamethod_ordinal() {
            self.known_absent_metamethod_mask &= !(1u32 << ord);
        }
        let mut grow = None;
        if slot >= self.inline_named_storage_capacity as u32 {
            let outlined = slot - self.inline_named_storage_capacity as u32;
            if outlined >= self.butterfly_named_storage_capacity {
                let new_cap = (self.butterfly_named_storage_capacity * 2).max(outlined + 1).max(4);
                self.butterfly_named_storage_capacity = new_cap;
                grow = Some(new_cap);
            }
        }
        (slot, grow)
    }

    /// Metatable mutation on a cacheable dictionary demotes it: in-place
    /// shape edits must not keep feeding dictionary-keyed caches.
    pub fn set_metatable_demoting(&mut self, mt: UserHeapPtr<TableObject>) {
        self.metatable = mt;
        self.array_type.set_may_have_metatable(!mt.is_null());
        self.hdr.ty = HeapEntityType::UncacheableDictionary;
    }

    /// All (name, slot) pairs, iteration path.
    pub fn enumerate_properties(&self) -> Vec<(GeneralHeapPtr<HeapString>, u32)> {
        let mut v: Vec<(GeneralHeapPtr<HeapString>, u32)> = self
            .map
            .iter()
            .map(|(&raw, &slot)| (GeneralHeapPtr::from_raw(raw), slot))
            .collect();
        v.sort_by_key(|&(_, slot)| slot);
        v
    }

    pub fn name_of_slot(&self, slot: u32) -> Option<GeneralHeapPtr<HeapString>> {
        self.map
            .iter()
            .find(|&(_, &s)| s == slot)
            .map(|(&raw, _)| GeneralHeapPtr::from_raw(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::StringInterner;

    #[test]
    fn test_create_from_structure_and_grow() {
        let mut layout = VmLayout::reserve();
        let mut interner = StringInterner::new(&mut layout);
        let mut cur = Structure::create_initial(&mut layout, 2);
        let mut names = Vec::new();
        for i in 0..5 {
            let p = GeneralHeapPtr::from_user(
                interner.intern(&mut layout, format!("d{}", i).as_bytes()),
            );
            names.push(p);
            cur = Structure::add_property(cur, &mut layout, p).new_structure;
        }
        let extra = GeneralHeapPtr::from_user(interner.intern(&mut layout, b"extra"));
        let (dict, slot) =
            DictionaryHiddenClass::create_from_structure(&mut layout, unsafe { cur.as_ref() }, extra);
        let d = unsafe { dict.as_mut() };
        assert_eq!(slot, 5);
        assert!(d.is_cacheable());
        for (i, &p) in names.iter().enumerate() {
            assert_eq!(d.lookup_property(p), Some(i as u32));
        }
        assert_eq!(d.lookup_property(extra), Some(5));

        let more = GeneralHeapPtr::from_user(interner.intern(&mut layout, b"more"));
        let (slot2, _) = d.add_property(more);
        assert_eq!(slot2, 6);

        d.set_metatable_demoting(UserHeapPtr::null());
        assert!(!d.is_cacheable());
    }
}
