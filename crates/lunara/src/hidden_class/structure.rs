// Structure: the hidden class of table objects.
//
// A Structure describes the exact shape of every table that evolved through
// the same sequence of add-property / metatable / array-type transitions.
// Structures form a DAG rooted at "empty with inline capacity K"; edges are
// cached in the parent (inline for one child, an open-addressed table past
// that). Parent pointers are strong, children are reached only through the
// transition store.
//
// Property slots are assigned in insertion order and never move: a slot
// returned by lookup stays valid for every object of this structure, which
// is what makes it a legal inline-cache effect.
//
// The `known_absent_metamethod_mask` has bit k set when no property of this
// shape is the k-th metamethod name. Since a table's named-property set is
// exactly its structure's property list, a set bit proves "if a table of
// this shape is used as a metatable, metamethod k is absent". The empty
// structure starts all-ones; add_property clears the added name's bit (the
// name strings are startup-pinned and tagged in their header byte, so this
// is one byte compare).

use crate::gc::gc_header::HeapEntityType;
use crate::gc::{GeneralHeapPtr, SystemHeapGcHeader, SystemHeapPtr, UserHeapPtr, VmLayout};
use crate::lua_value::heap_string::HeapString;
use crate::lua_value::table_object::TableObject;

use super::anchor_table::StructureAnchorHashTable;
use super::array_type::ArrayType;

/// Linear-search window size; also the anchor flush block size.
pub const X_INLINE_PROP_LIST_LEN: usize = 8;

/// Named-slot count beyond which the object falls back to dictionary mode.
pub const X_MAX_STRUCTURE_SLOTS: u8 = 253;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StructureMetatableKind {
    NoMetatable = 0,
    Unique = 1,
    PolyMetatable = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransitionKind {
    AddProperty = 0,
    SetMetatable = 1,
    RemoveMetatable = 2,
    TransitionArrayType = 3,
    EnablePolyMetatable = 4,
}

/// (kind, 32-bit payload) packed; 0 never encodes a real edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct TransitionKey(pub u64);

impl TransitionKey {
    #[inline(always)]
    pub fn new(kind: TransitionKind, payload: u32) -> TransitionKey {
        TransitionKey((kind as u64) | ((payload as u64) << 8))
    }

    #[inline(always)]
    pub fn add_property(prop: GeneralHeapPtr<HeapString>) -> TransitionKey {
        TransitionKey::new(TransitionKind::AddProperty, prop.raw() as u32)
    }

    #[inline(always)]
    pub fn set_metatable(mt: UserHeapPtr<TableObject>) -> TransitionKey {
        TransitionKey::new(TransitionKind::SetMetatable, GeneralHeapPtr::from_user(mt).raw() as u32)
    }
}

const TRANSITION_MODE_NONE: u8 = 0;
const TRANSITION_MODE_SINGLE: u8 = 1;
const TRANSITION_MODE_HASH: u8 = 2;

#[repr(C)]
pub struct Structure {
    pub hdr: SystemHeapGcHeader,
    pub inline_named_storage_capacity: u8,
    pub butterfly_named_storage_capacity: u8,
    pub num_slots: u8,
    /// Property ordinals below this are resolved through the anchor.
    pub anchored_ordinal: u8,
    pub array_type: ArrayType,
    pub metatable_kind: StructureMetatableKind,
    pub known_absent_metamethod_mask: u32,
    pub parent: SystemHeapPtr<Structure>,
    pub metatable: UserHeapPtr<TableObject>,
    pub anchor: SystemHeapPtr<StructureAnchorHashTable>,
    pub poly_metatable_slot: u8,
    transition_mode: u8,
    _pad: u16,
    transition_single_key: TransitionKey,
    transition_single_child: SystemHeapPtr<Structure>,
    transition_hash: SystemHeapPtr<TransitionHashTable>,
    /// Window of the most recently added names, ordinals
    /// [anchored_ordinal, num_slots).
    pub prop_window: [GeneralHeapPtr<HeapString>; X_INLINE_PROP_LIST_LEN],
}

// ============ transition hash table ============

#[repr(C)]
struct TransitionHashTable {
    size_mask: u32,
    count: u32,
    // trailing: TransitionHashEntry x (size_mask + 1)
}

#[derive(Clone, Copy)]
#[repr(C)]
struct TransitionHashEntry {
    key: TransitionKey,
    child: SystemHeapPtr<Structure>,
    _pad: u32,
}

impl TransitionHashTable {
    unsafe fn entries(&self) -> *mut TransitionHashEntry {
        (self as *const _ as *mut u8).add(std::mem::size_of::<TransitionHashTable>())
            as *mut TransitionHashEntry
    }

    fn alloc(layout: &mut VmLayout, capacity: u32) -> SystemHeapPtr<TransitionHashTable> {
        debug_assert!(capacity.is_power_of_two());
        let size = std::mem::size_of::<TransitionHashTable>()
            + capacity as usize * std::mem::size_of::<TransitionHashEntry>();
        let addr = layout.alloc_from_system_heap(size);
        let ptr: SystemHeapPtr<TransitionHashTable> = SystemHeapPtr::from_addr(addr);
        unsafe {
            let t = ptr.as_mut();
            t.size_mask = capacity - 1;
            t.count = 0;
            std::ptr::write_bytes(
                t.entries() as *mut u8,
                0,
                capacity as usize * std::mem::size_of::<TransitionHashEntry>(),
            );
        }
        ptr
    }

    #[inline]
    fn hash_key(key: TransitionKey) -> u32 {
        // Multiplicative fold of the packed key.
        let h = key.0.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        (h >> 32) as u32
    }

    unsafe fn find(&self, key: TransitionKey) -> Option<SystemHeapPtr<Structure>> {
        let mut slot = Self::hash_key(key) & self.size_mask;
        loop {
            let e = *self.entries().add(slot as usize);
            if e.key.0 == 0 {
                return None;
            }
            if e.key == key {
                return Some(e.child);
            }
            slot = (slot + 1) & self.size_mask;
        }
    }

    unsafe fn insert_nogrow(&mut self, key: TransitionKey, child: SystemHeapPtr<Structure>) {
        let mut slot = Self::hash_key(key) & self.size_mask;
        loop {
            let e = self.entries().add(slot as usize);
            if (*e).key.0 == 0 {
                *e = TransitionHashEntry { key, child, _pad: 0 };
                self.count += 1;
                return;
            }
            slot = (slot + 1) & self.size_mask;
        }
    }
}

// ============ structure ============

pub struct AddPropertyResult {
    pub new_structure: SystemHeapPtr<Structure>,
    pub slot: u8,
    /// New butterfly named capacity, when the caller must grow storage.
    pub grow_butterfly_to: Option<u8>,
    /// Slot cap exceeded: the object must fall back to dictionary mode.
    pub transitioned_to_dictionary: bool,
}

impl Structure {
    /// Root structure with the given inline capacity: no properties, no
    /// metatable, empty array part.
    pub fn create_initial(layout: &mut VmLayout, inline_capacity: u8) -> SystemHeapPtr<Structure> {
        let addr = layout.alloc_from_system_heap(std::mem::size_of::<Structure>());
        let ptr: SystemHeapPtr<Structure> = SystemHeapPtr::from_addr(addr);
        unsafe {
            let s = ptr.as_mut();
            s.hdr = SystemHeapGcHeader::new(HeapEntityType::Structure);
            s.inline_named_storage_capacity = inline_capacity;
            s.butterfly_named_storage_capacity = 0;
            s.num_slots = 0;
            s.anchored_ordinal = 0;
            s.array_type = ArrayType::default_for_table();
            s.metatable_kind = StructureMetatableKind::NoMetatable;
            s.known_absent_metamethod_mask = u32::MAX;
            s.parent = SystemHeapPtr::null();
            s.metatable = UserHeapPtr::null();
            s.anchor = SystemHeapPtr::null();
            s.poly_metatable_slot = 0;
            s.transition_mode = TRANSITION_MODE_NONE;
            s._pad = 0;
            s.transition_single_key = TransitionKey(0);
            s.transition_single_child = SystemHeapPtr::null();
            s.transition_hash = SystemHeapPtr::null();
            s.prop_window = [GeneralHeapPtr::null(); X_INLINE_PROP_LIST_LEN];
        }
        ptr
    }

    #[inline(always)]
    pub fn may_have_metatable(&self) -> bool {
        self.metatable_kind != StructureMetatableKind::NoMetatable
    }

    #[inline(always)]
    pub fn total_named_capacity(&self) -> u16 {
        self.inline_named_storage_capacity as u16 + self.butterfly_named_storage_capacity as u16
    }

    /// O(1)-average slot lookup: window scan, then the shared anchor.
    pub fn lookup_property(&self, prop: GeneralHeapPtr<HeapString>) -> Option<u8> {
        let window_len = (self.num_slots - self.anchored_ordinal) as usize;
        for i in 0..window_len {
            if self.prop_window[i] == prop {
                return Some(self.anchored_ordinal + i as u8);
            }
        }
        if !self.anchor.is_null() {
            let anchor = unsafe { self.anchor.as_ref() };
            if let Some(ord) = anchor.lookup(prop) {
                debug_assert!(ord < self.anchored_ordinal as u32);
                return Some(ord as u8);
            }
        }
        None
    }

    /// Name of slot `ord` (iteration path).
    pub fn name_of_slot(&self, ord: u8) -> Option<GeneralHeapPtr<HeapString>> {
        debug_assert!(ord < self.num_slots);
        if ord >= self.anchored_ordinal {
            return Some(self.prop_window[(ord - self.anchored_ordinal) as usize]);
        }
        unsafe { self.anchor.as_ref() }.name_of_ordinal(ord as u32)
    }

    /// All (name, ordinal) pairs, for dictionary conversion.
    pub fn enumerate_properties(&self) -> Vec<(GeneralHeapPtr<HeapString>, u8)> {
        let mut result = Vec::with_capacity(self.num_slots as usize);
        for ord in 0..self.num_slots {
            if let Some(name) = self.name_of_slot(ord) {
                result.push((name, ord));
            }
        }
        result
    }

    // ---- transition store ----

    fn find_transition(&self, key: TransitionKey) -> Option<SystemHeapPtr<Structure>> {
        match self.transition_mode {
            TRANSITION_MODE_NONE => None,
            TRANSITION_MODE_SINGLE => {
                if self.transition_single_key == key {
                    Some(self.transition_single_child)
                } else {
                    None
                }
            }
            _ => unsafe { self.transition_hash.as_ref().find(key) },
        }
    }

    fn install_transition(
        &mut self,
        layout: &mut VmLayout,
        key: TransitionKey,
        child: SystemHeapPtr<Structure>,
    ) {
        // Installing a child stores a heap pointer into this object.
        unsafe { crate::gc::write_barrier_system(self as *const Structure as usize) };
        match self.transition_mode {
            TRANSITION_MODE_NONE => {
                self.transition_single_key = key;
                self.transition_single_child = child;
                self.transition_mode = TRANSITION_MODE_SINGLE;
            }
            TRANSITION_MODE_SINGLE => {
                let table = TransitionHashTable::alloc(layout, 4);
                unsafe {
                    let t = table.as_mut();
                    t.insert_nogrow(self.transition_single_key, self.transition_single_child);
                    t.insert_nogrow(key, child);
                }
                self.transition_hash = table;
                self.transition_mode = TRANSITION_MODE_HASH;
            }
            _ => unsafe {
                let t = self.transition_hash.as_mut();
                if (t.count + 1) * 2 > t.size_mask + 1 {
                    // Dense repack into a table twice the size; the old
                    // allocation becomes garbage for the collector.
                    let bigger = TransitionHashTable::alloc(layout, (t.size_mask + 1) * 2);
                    let b = bigger.as_mut();
                    for slot in 0..=t.size_mask {
                        let e = *t.entries().add(slot as usize);
                        if e.key.0 != 0 {
                            b.insert_nogrow(e.key, e.child);
                        }
                    }
                    self.transition_hash = bigger;
                }
                self.transition_hash.as_mut().insert_nogrow(key, child);
            },
        }
    }

    /// Clones `self` into a fresh child with `parent = self`; the caller
    /// patches the differing fields before the child is published.
    fn fork(this: SystemHeapPtr<Structure>, layout: &mut VmLayout) -> SystemHeapPtr<Structure> {
        let addr = layout.alloc_from_system_heap(std::mem::size_of::<Structure>());
        let child: SystemHeapPtr<Structure> = SystemHeapPtr::from_addr(addr);
        unsafe {
            std::ptr::copy_nonoverlapping(this.as_ptr(), child.as_ptr(), 1);
            let c = child.as_mut();
            c.parent = this;
            c.transition_mode = TRANSITION_MODE_NONE;
            c.transition_single_key = TransitionKey(0);
            c.transition_single_child = SystemHeapPtr::null();
            c.transition_hash = SystemHeapPtr::null();
        }
        child
    }

    // ---- AddProperty ----

    pub fn add_property(
        this: SystemHeapPtr<Structure>,
        layout: &mut VmLayout,
        prop: GeneralHeapPtr<HeapString>,
    ) -> AddPropertyResult {
        let s = unsafe { this.as_ref() };
        debug_assert!(s.lookup_property(prop).is_none());

        if s.num_slots >= X_MAX_STRUCTURE_SLOTS {
            return AddPropertyResult {
                new_structure: SystemHeapPtr::null(),
                slot: 0,
                grow_butterfly_to: None,
                transitioned_to_dictionary: true,
            };
        }

        let key = TransitionKey::add_property(prop);
        if let Some(child) = s.find_transition(key) {
            let c = unsafe { child.as_ref() };
            let grow = if c.butterfly_named_storage_capacity != s.butterfly_named_storage_capacity {
                Some(c.butterfly_named_storage_capacity)
            } else {
                None
            };
            return AddPropertyResult {
                new_structure: child,
                slot: s.num_slots,
                grow_butterfly_to: grow,
                transitioned_to_dictionary: false,
            };
        }

        let slot = s.num_slots;
        let child = Self::fork(this, layout);
        let mut grow_to = None;
        unsafe {
            let c = child.as_mut();
            c.num_slots = slot + 1;

            // Outlined slots may force butterfly growth.
            if slot >= c.inline_named_storage_capacity {
                let outlined_index = slot - c.inline_named_storage_capacity;
                if outlined_index >= c.butterfly_named_storage_capacity {
                    let new_cap = core::cmp::max(
                        4,
                        core::cmp::min(
                            255,
                            (c.butterfly_named_storage_capacity as u16) * 2 + 1,
                        ) as u8,
                    );
                    let new_cap = core::cmp::max(new_cap, outlined_index + 1);
                    c.butterfly_named_storage_capacity = new_cap;
                    grow_to = Some(new_cap);
                }
            }

            // Window roll-over flushes into a (possibly new) anchor.
            let s = this.as_ref();
            if (s.num_slots - s.anchored_ordinal) as usize == X_INLINE_PROP_LIST_LEN {
                let prev = if s.anchor.is_null() { None } else { Some(s.anchor) };
                c.anchor = StructureAnchorHashTable::build(layout, prev, &s.prop_window);
                c.anchored_ordinal = s.num_slots;
                c.prop_window = [GeneralHeapPtr::null(); X_INLINE_PROP_LIST_LEN];
                c.prop_window[0] = prop;
            } else {
                c.prop_window[(slot - s.anchored_ordinal) as usize] = prop;
            }

            // Metamethod-name bookkeeping for the negative-lookup mask.
            let name = prop.to_user().as_ref();
            if let Some(ord) = name.metamethod_ordinal() {
                c.known_absent_metamethod_mask &= !(1u32 << ord);
            }

            this.as_mut().install_transition(layout, key, child);
        }
        AddPropertyResult {
            new_structure: child,
            slot,
            grow_butterfly_to: grow_to,
            transitioned_to_dictionary: false,
        }
    }

}

/// Result of a set-metatable transition.
pub enum SetMetatableResult {
    /// Hidden class changed; object keeps metatable through the structure.
    NewStructure(SystemHeapPtr<Structure>),
    /// Hidden class changed to polymetatable mode; the caller must store
    /// the metatable value into the named slot (growing storage as told).
    Poly {
        new_structure: SystemHeapPtr<Structure>,
        slot: u8,
        grow_butterfly_to: Option<u8>,
    },
    /// Already in polymetatable mode: store into the existing slot.
    StoreToPolySlot(u8),
    /// Metatable is unchanged.
    NoChange,
}

impl Structure {
    pub fn set_metatable(
        this: SystemHeapPtr<Structure>,
        layout: &mut VmLayout,
        interner_sentinel: GeneralHeapPtr<HeapString>,
        mt: UserHeapPtr<TableObject>,
    ) -> SetMetatableResult {
        let s = unsafe { this.as_ref() };
        match s.metatable_kind {
            StructureMetatableKind::PolyMetatable => {
                SetMetatableResult::StoreToPolySlot(s.poly_metatable_slot)
            }
            StructureMetatableKind::Unique if s.metatable == mt => SetMetatableResult::NoChange,
            StructureMetatableKind::NoMetatable => {
                let key = TransitionKey::set_metatable(mt);
                if let Some(child) = s.find_transition(key) {
                    return SetMetatableResult::NewStructure(child);
                }
                let child = Self::fork(this, layout);
                unsafe {
                    let c = child.as_mut();
                    c.metatable_kind = StructureMetatableKind::Unique;
                    c.metatable = mt;
                    c.array_type.set_may_have_metatable(true);
                    this.as_mut().install_transition(layout, key, child);
                }
                SetMetatableResult::NewStructure(child)
            }
            StructureMetatableKind::Unique => {
                // A second, different metatable on the same shape: fork to
                // polymetatable mode, where the metatable lives in a hidden
                // slot keyed by the interner sentinel.
                let key = TransitionKey::new(TransitionKind::EnablePolyMetatable, 0);
                if let Some(child) = s.find_transition(key) {
                    let c = unsafe { child.as_ref() };
                    let grow =
                        if c.butterfly_named_storage_capacity != s.butterfly_named_storage_capacity {
                            Some(c.butterfly_named_storage_capacity)
                        } else {
                            None
                        };
                    return SetMetatableResult::Poly {
                        new_structure: child,
                        slot: unsafe { child.as_ref() }.poly_metatable_slot,
                        grow_butterfly_to: grow,
                    };
                }
                // The hidden slot is appended like a normal property.
                let add = Self::add_property_for_poly_slot(this, layout, interner_sentinel);
                unsafe {
                    let c = add.new_structure.as_mut();
                    c.metatable_kind = StructureMetatableKind::PolyMetatable;
                    c.metatable = UserHeapPtr::null();
                    c.poly_metatable_slot = add.slot;
                    c.array_type.set_may_have_metatable(true);
                    // Re-key the edge: this fork is reached by the
                    // EnablePolyMetatable event, not by AddProperty.
                    let parent = this.as_mut();
                    parent.remove_last_installed_transition(TransitionKey::add_property(
                        interner_sentinel,
                    ));
                    parent.install_transition(layout, key, add.new_structure);
                }
                SetMetatableResult::Poly {
                    new_structure: add.new_structure,
                    slot: add.slot,
                    grow_butterfly_to: add.grow_butterfly_to,
                }
            }
        }
    }

    pub fn remove_metatable(
        this: SystemHeapPtr<Structure>,
        layout: &mut VmLayout,
    ) -> SetMetatableResult {
        let s = unsafe { this.as_ref() };
        match s.metatable_kind {
            StructureMetatableKind::NoMetatable => SetMetatableResult::NoChange,
            StructureMetatableKind::PolyMetatable => {
                SetMetatableResult::StoreToPolySlot(s.poly_metatable_slot)
            }
            StructureMetatableKind::Unique => {
                let key = TransitionKey::new(TransitionKind::RemoveMetatable, 0);
                if let Some(child) = s.find_transition(key) {
                    return SetMetatableResult::NewStructure(child);
                }
                let child = Self::fork(this, layout);
                unsafe {
                    let c = child.as_mut();
                    c.metatable_kind = StructureMetatableKind::NoMetatable;
                    c.metatable = UserHeapPtr::null();
                    c.array_type.set_may_have_metatable(false);
                    this.as_mut().install_transition(layout, key, child);
                }
                SetMetatableResult::NewStructure(child)
            }
        }
    }

    // The poly-slot append reuses the add-property machinery but must not
    // leave the AddProperty edge behind (the sentinel can never be looked
    // up as a user key, but the edge keying must match the event).
    fn add_property_for_poly_slot(
        this: SystemHeapPtr<Structure>,
        layout: &mut VmLayout,
        sentinel: GeneralHeapPtr<HeapString>,
    ) -> AddPropertyResult {
        let r = Self::add_property(this, layout, sentinel);
        assert!(!r.transitioned_to_dictionary, "poly-metatable fork on saturated structure");
        r
    }

    fn remove_last_installed_transition(&mut self, key: TransitionKey) {
        match self.transition_mode {
            TRANSITION_MODE_SINGLE => {
                if self.transition_single_key == key {
                    self.transition_mode = TRANSITION_MODE_NONE;
                    self.transition_single_key = TransitionKey(0);
                    self.transition_single_child = SystemHeapPtr::null();
                }
            }
            TRANSITION_MODE_HASH => unsafe {
                let t = self.transition_hash.as_mut();
                let mut slot = TransitionHashTable::hash_key(key) & t.size_mask;
                loop {
                    let e = t.entries().add(slot as usize);
                    if (*e).key.0 == 0 {
                        return;
                    }
                    if (*e).key == key {
                        // Tombstone-free removal is wrong for open
                        // addressing in general; keying is unique per edge
                        // and this entry was installed last, so emptying it
                        // cannot break another probe chain that formed
                        // before it existed. Re-insert any displaced run.
                        (*e).key = TransitionKey(0);
                        t.count -= 1;
                        let mut probe = (slot + 1) & t.size_mask;
                        loop {
                            let f = t.entries().add(probe as usize);
                            if (*f).key.0 == 0 {
                                break;
                            }
                            let moved = *f;
                            (*f).key = TransitionKey(0);
                            t.count -= 1;
                            t.insert_nogrow(moved.key, moved.child);
                            probe = (probe + 1) & t.size_mask;
                        }
                        return;
                    }
                    slot = (slot + 1) & t.size_mask;
                }
            },
            _ => {}
        }
    }

    // ---- array type transitions ----

    pub fn transition_array_type(
        this: SystemHeapPtr<Structure>,
        layout: &mut VmLayout,
        new_array_type: ArrayType,
    ) -> SystemHeapPtr<Structure> {
        let s = unsafe { this.as_ref() };
        if s.array_type == new_array_type {
            return this;
        }
        let key = TransitionKey::new(TransitionKind::TransitionArrayType, new_array_type.0 as u32);
        if let Some(child) = s.find_transition(key) {
            return child;
        }
        let child = Self::fork(this, layout);
        unsafe {
            child.as_mut().array_type = new_array_type;
            this.as_mut().install_transition(layout, key, child);
        }
        child
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::StringInterner;

    fn setup() -> (Box<VmLayout>, StringInterner) {
        let mut layout = VmLayout::reserve();
        let interner = StringInterner::new(&mut layout);
        (layout, interner)
    }

    #[test]
    fn test_add_property_assigns_stable_slots() {
        let (mut layout, mut interner) = setup();
        let root = Structure::create_initial(&mut layout, 4);
        let a = GeneralHeapPtr::from_user(interner.intern(&mut layout, b"a"));
        let b = GeneralHeapPtr::from_user(interner.intern(&mut layout, b"b"));

        let r1 = Structure::add_property(root, &mut layout, a);
        assert_eq!(r1.slot, 0);
        let r2 = Structure::add_property(r1.new_structure, &mut layout, b);
        assert_eq!(r2.slot, 1);

        let s2 = unsafe { r2.new_structure.as_ref() };
        assert_eq!(s2.lookup_property(a), Some(0));
        assert_eq!(s2.lookup_property(b), Some(1));
        assert_eq!(unsafe { r1.new_structure.as_ref() }.lookup_property(b), None);
    }

    #[test]
    fn test_transition_edges_are_shared() {
        let (mut layout, mut interner) = setup();
        let root = Structure::create_initial(&mut layout, 4);
        let a = GeneralHeapPtr::from_user(interner.intern(&mut layout, b"a"));
        let first = Structure::add_property(root, &mut layout, a);
        let second = Structure::add_property(root, &mut layout, a);
        assert_eq!(first.new_structure, second.new_structure);
    }

    #[test]
    fn test_many_children_move_to_hash_mode() {
        let (mut layout, mut interner) = setup();
        let root = Structure::create_initial(&mut layout, 4);
        let mut children = Vec::new();
        for i in 0..10 {
            let p = GeneralHeapPtr::from_user(
                interner.intern(&mut layout, format!("p{}", i).as_bytes()),
            );
            children.push((p, Structure::add_property(root, &mut layout, p).new_structure));
        }
        for (p, c) in children {
            assert_eq!(Structure::add_property(root, &mut layout, p).new_structure, c);
        }
    }

    #[test]
    fn test_window_flush_builds_anchor() {
        let (mut layout, mut interner) = setup();
        let mut cur = Structure::create_initial(&mut layout, 2);
        let mut props = Vec::new();
        for i in 0..20 {
            let p = GeneralHeapPtr::from_user(
                interner.intern(&mut layout, format!("k{}", i).as_bytes()),
            );
            props.push(p);
            let r = Structure::add_property(cur, &mut layout, p);
            assert_eq!(r.slot as usize, i);
            cur = r.new_structure;
        }
        let s = unsafe { cur.as_ref() };
        assert!(!s.anchor.is_null());
        assert_eq!(s.anchored_ordinal, 16);
        for (i, &p) in props.iter().enumerate() {
            assert_eq!(s.lookup_property(p), Some(i as u8), "prop {}", i);
        }
    }

    #[test]
    fn test_butterfly_growth_reported() {
        let (mut layout, mut interner) = setup();
        let mut cur = Structure::create_initial(&mut layout, 1);
        let a = GeneralHeapPtr::from_user(interner.intern(&mut layout, b"a"));
        let b = GeneralHeapPtr::from_user(interner.intern(&mut layout, b"b"));
        let r1 = Structure::add_property(cur, &mut layout, a);
        assert!(r1.grow_butterfly_to.is_none()); // fits inline
        cur = r1.new_structure;
        let r2 = Structure::add_property(cur, &mut layout, b);
        assert_eq!(r2.grow_butterfly_to, Some(4)); // first outlined slot
    }

    #[test]
    fn test_metamethod_mask_tracking() {
        let (mut layout, mut interner) = setup();
        let root = Structure::create_initial(&mut layout, 4);
        // Simulate the VM pinning "__index" with its ordinal in the header.
        let index_name = interner.intern(&mut layout, b"__index");
        unsafe {
            index_name.as_mut().hdr.opaque =
                super::super::metamethod_kind::LuaMetamethodKind::Index as u8 + 1;
        }
        let r = Structure::add_property(root, &mut layout, GeneralHeapPtr::from_user(index_name));
        let s = unsafe { r.new_structure.as_ref() };
        assert_eq!(s.known_absent_metamethod_mask & 1, 0);
        assert_ne!(unsafe { root.as_ref() }.known_absent_metamethod_mask & 1, 0);
    }

    #[test]
    fn test_unique_then_conflicting_metatable_goes_poly() {
        let (mut layout, interner) = setup();
        let root = Structure::create_initial(&mut layout, 2);
        let sentinel = GeneralHeapPtr::from_user(interner.special_key_for_metatable_slot());
        // Fake table pointers: any user-heap allocation works for identity.
        let mt1: UserHeapPtr<TableObject> =
            UserHeapPtr::<()>::from_addr(layout.alloc_from_user_heap(16)).cast();
        let mt2: UserHeapPtr<TableObject> =
            UserHeapPtr::<()>::from_addr(layout.alloc_from_user_heap(16)).cast();

        let r1 = Structure::set_metatable(root, &mut layout, sentinel, mt1);
        let with_mt = match r1 {
            SetMetatableResult::NewStructure(s) => s,
            _ => panic!("expected unique metatable structure"),
        };
        assert_eq!(unsafe { with_mt.as_ref() }.metatable_kind, StructureMetatableKind::Unique);

        match Structure::set_metatable(with_mt, &mut layout, sentinel, mt2) {
            SetMetatableResult::Poly { new_structure, slot, .. } => {
                let s = unsafe { new_structure.as_ref() };
                assert_eq!(s.metatable_kind, StructureMetatableKind::PolyMetatable);
                assert_eq!(s.poly_metatable_slot, slot);
                assert_eq!(s.num_slots, 1);
            }
            _ => panic!("expected poly fork"),
        }
    }

    #[test]
    fn test_array_type_transition_shared() {
        let (mut layout, _) = setup();
        let root = Structure::create_initial(&mut layout, 2);
        let mut at = unsafe { root.as_ref() }.array_type;
        at.set_element_kind(super::super::array_type::ArrayElementKind::Int32);
        let c1 = Structure::transition_array_type(root, &mut layout, at);
        let c2 = Structure::transition_array_type(root, &mut layout, at);
        assert_eq!(c1, c2);
        assert!(c1 != root);
    }
}
