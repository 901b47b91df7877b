// The table object: hybrid array + named-property storage.
//
// Layout: 8-byte header, butterfly pointer, then the inline named slots
// (count fixed by the hidden class's inline capacity). Named slots beyond
// inline capacity live in the butterfly's non-negative half; the array part
// lives in its negative half; out-of-policy indices divert to the sparse
// map hung off the butterfly block front.
//
// Every operation comes as a prepare/execute pair: `prepare_*` consults the
// hidden class and returns an ICInfo that both the interpreter's inline
// caches and the direct execution path consume. Slots returned for a given
// hidden class are stable, which is the whole caching contract.

use crate::gc::gc_header::HeapEntityType;
use crate::gc::{
    write_barrier_user, GeneralHeapPtr, SystemHeapPtr, UserHeapGcHeader, UserHeapPtr, VmLayout,
};
use crate::hidden_class::array_type::{ArrayElementKind, ArrayType};
use crate::hidden_class::dictionary::DictionaryHiddenClass;
use crate::hidden_class::metamethod_kind::LuaMetamethodKind;
use crate::hidden_class::structure::{SetMetatableResult, Structure, StructureMetatableKind};
use crate::lua_value::butterfly::{Butterfly, X_ARRAY_BASE_ORD};
use crate::lua_value::heap_string::HeapString;
use crate::lua_value::sparse_map::ArraySparseMap;
use crate::lua_value::tvalue::TValue;

/// Indices above this only grow the vector while they stay within 4x of
/// the current capacity; otherwise they divert to the sparse map.
pub const X_ALWAYS_VECTOR_CUTOFF: i64 = 1000;

#[repr(C)]
pub struct TableObject {
    pub hdr: UserHeapGcHeader,
    pub butterfly: UserHeapPtr<Butterfly>,
    // inline named slots follow: [TValue; inline_capacity]
}

pub const X_TABLE_OBJECT_TRAILING_OFFSET: usize = 16;

#[derive(Clone, Copy)]
pub enum HiddenClassKind {
    Structure(SystemHeapPtr<Structure>),
    Dictionary(SystemHeapPtr<DictionaryHiddenClass>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetByIdIcKind {
    /// Read `object.inline[slot]`.
    InlinedStorage(u32),
    /// Read `butterfly.named[slot]`.
    OutlinedStorage(u32),
    /// Known absent, cacheable.
    MustBeNil,
    /// Known absent, but the shape can gain the property without a hidden
    /// class change (dictionary): not cacheable.
    MustBeNilButUncacheable,
    /// Full probe required on every access.
    UncachableDictionary,
}

#[derive(Clone, Copy)]
pub struct GetByIdICInfo {
    pub kind: GetByIdIcKind,
    pub may_have_metatable: bool,
}

#[derive(Clone, Copy)]
pub enum PutByIdIcKind {
    InlinedStorage(u32),
    OutlinedStorage(u32),
    /// Structure transition adding the property; cacheable as
    /// (old structure -> new structure, slot, optional storage growth).
    AddProperty {
        new_structure: SystemHeapPtr<Structure>,
        slot: u32,
        grow_butterfly_to: Option<u8>,
    },
    /// The structure is saturated: the slow path converts to dictionary.
    TransitionToDictionary,
    /// Dictionary shape mutation; executed by the slow path, uncacheable.
    DictionaryAdd,
    UncachableDictionary,
}

#[derive(Clone, Copy)]
pub struct PutByIdICInfo {
    pub kind: PutByIdIcKind,
    pub may_have_metatable: bool,
}

/// A resolved AddProperty transition, the payload a put IC caches.
#[derive(Clone, Copy)]
pub struct CachedAddProperty {
    pub new_structure: u32,
    pub slot: u32,
    pub grow_butterfly_to: Option<u8>,
}

impl TableObject {
    // ============ creation ============

    pub fn create_empty(
        layout: &mut VmLayout,
        structure: SystemHeapPtr<Structure>,
        initial_array_capacity: u32,
    ) -> UserHeapPtr<TableObject> {
        let s = unsafe { structure.as_ref() };
        let inline_cap = s.inline_named_storage_capacity as usize;
        let size = X_TABLE_OBJECT_TRAILING_OFFSET + inline_cap * 8;
        let addr = layout.alloc_from_user_heap(size);
        let this: UserHeapPtr<TableObject> = UserHeapPtr::from_addr(addr);
        unsafe {
            let t = this.as_mut();
            t.hdr = UserHeapGcHeader::new(structure.raw(), HeapEntityType::Table);
            let mut at = s.array_type;
            at.set_continuous(true);
            t.hdr.array_type = at.0;
            t.butterfly = if initial_array_capacity > 0 {
                Butterfly::allocate(layout, initial_array_capacity, 0, false)
            } else {
                UserHeapPtr::null()
            };
            for i in 0..inline_cap {
                *Self::inline_slot_ptr(this, i as u32) = TValue::nil();
            }
        }
        this
    }

    // ============ hidden class plumbing ============

    #[inline(always)]
    pub fn hidden_class_kind(this: UserHeapPtr<TableObject>) -> HiddenClassKind {
        let raw = unsafe { this.as_ref() }.hdr.hidden_class;
        let sys: SystemHeapPtr<crate::gc::SystemHeapGcHeader> = SystemHeapPtr::from_raw(raw);
        match unsafe { sys.as_ref() }.ty {
            HeapEntityType::Structure => HiddenClassKind::Structure(sys.cast()),
            _ => HiddenClassKind::Dictionary(sys.cast()),
        }
    }

    #[inline(always)]
    pub fn array_type(this: UserHeapPtr<TableObject>) -> ArrayType {
        ArrayType(unsafe { this.as_ref() }.hdr.array_type)
    }

    #[inline(always)]
    fn inline_capacity(this: UserHeapPtr<TableObject>) -> u32 {
        match Self::hidden_class_kind(this) {
            HiddenClassKind::Structure(s) => {
                unsafe { s.as_ref() }.inline_named_storage_capacity as u32
            }
            HiddenClassKind::Dictionary(d) => {
                unsafe { d.as_ref() }.inline_named_storage_capacity as u32
            }
        }
    }

    #[inline(always)]
    fn inline_slot_ptr(this: UserHeapPtr<TableObject>, i: u32) -> *mut TValue {
        unsafe {
            (this.as_ptr() as *mut u8).add(X_TABLE_OBJECT_TRAILING_OFFSET + i as usize * 8)
                as *mut TValue
        }
    }

    /// Reads slot `slot` of the named-property storage (inline or
    /// outlined, decided by the hidden class's inline capacity).
    #[inline]
    pub fn get_value_at_slot(this: UserHeapPtr<TableObject>, slot: u32) -> TValue {
        let inline_cap = Self::inline_capacity(this);
        unsafe {
            if slot < inline_cap {
                *Self::inline_slot_ptr(this, slot)
            } else {
                let bf = this.as_ref().butterfly;
                *Butterfly::named_slot_ptr(bf, slot - inline_cap)
            }
        }
    }

    #[inline]
    pub fn put_value_at_slot(this: UserHeapPtr<TableObject>, slot: u32, value: TValue) {
        let inline_cap = Self::inline_capacity(this);
        unsafe {
            if slot < inline_cap {
                *Self::inline_slot_ptr(this, slot) = value;
            } else {
                let bf = this.as_ref().butterfly;
                *Butterfly::named_slot_ptr(bf, slot - inline_cap) = value;
            }
            if value.is_pointer() {
                write_barrier_user(this.as_ptr() as usize);
            }
        }
    }

    // ============ GetById ============

    pub fn prepare_get_by_id(
        this: UserHeapPtr<TableObject>,
        prop: UserHeapPtr<HeapString>,
    ) -> GetByIdICInfo {
        let gp = GeneralHeapPtr::from_user(prop);
        match Self::hidden_class_kind(this) {
            HiddenClassKind::Structure(s) => {
                let sr = unsafe { s.as_ref() };
                let inline_cap = sr.inline_named_storage_capacity as u32;
                let kind = match sr.lookup_property(gp) {
                    Some(slot) if (slot as u32) < inline_cap => {
                        GetByIdIcKind::InlinedStorage(slot as u32)
                    }
                    Some(slot) => GetByIdIcKind::OutlinedStorage(slot as u32 - inline_cap),
                    None => GetByIdIcKind::MustBeNil,
                };
                GetByIdICInfo { kind, may_have_metatable: sr.may_have_metatable() }
            }
            HiddenClassKind::Dictionary(d) => {
                let dr = unsafe { d.as_ref() };
                let may_have_metatable = !dr.metatable.is_null();
                if !dr.is_cacheable() {
                    return GetByIdICInfo {
                        kind: GetByIdIcKind::UncachableDictionary,
                        may_have_metatable,
                    };
                }
                let inline_cap = dr.inline_named_storage_capacity as u32;
                let kind = match dr.lookup_property(gp) {
                    Some(slot) if slot < inline_cap => GetByIdIcKind::InlinedStorage(slot),
                    Some(slot) => GetByIdIcKind::OutlinedStorage(slot - inline_cap),
                    None => GetByIdIcKind::MustBeNilButUncacheable,
                };
                GetByIdICInfo { kind, may_have_metatable }
            }
        }
    }

    pub fn get_by_id_with_info(
        this: UserHeapPtr<TableObject>,
        prop: UserHeapPtr<HeapString>,
        info: GetByIdICInfo,
    ) -> TValue {
        let inline_cap = Self::inline_capacity(this);
        match info.kind {
            GetByIdIcKind::InlinedStorage(slot) => unsafe { *Self::inline_slot_ptr(this, slot) },
            GetByIdIcKind::OutlinedStorage(outlined) => unsafe {
                *Butterfly::named_slot_ptr(this.as_ref().butterfly, outlined)
            },
            GetByIdIcKind::MustBeNil | GetByIdIcKind::MustBeNilButUncacheable => TValue::nil(),
            GetByIdIcKind::UncachableDictionary => match Self::hidden_class_kind(this) {
                HiddenClassKind::Dictionary(d) => {
                    match unsafe { d.as_ref() }.lookup_property(GeneralHeapPtr::from_user(prop)) {
                        Some(slot) if slot < inline_cap => unsafe {
                            *Self::inline_slot_ptr(this, slot)
                        },
                        Some(slot) => unsafe {
                            *Butterfly::named_slot_ptr(this.as_ref().butterfly, slot - inline_cap)
                        },
                        None => TValue::nil(),
                    }
                }
                HiddenClassKind::Structure(_) => unreachable!("uncacheable info on structure"),
            },
        }
    }

    /// Raw named-property read (no metatable consult).
    pub fn get_by_id(this: UserHeapPtr<TableObject>, prop: UserHeapPtr<HeapString>) -> TValue {
        let info = Self::prepare_get_by_id(this, prop);
        Self::get_by_id_with_info(this, prop, info)
    }

    // ============ PutById ============

    pub fn prepare_put_by_id(
        this: UserHeapPtr<TableObject>,
        prop: UserHeapPtr<HeapString>,
    ) -> PutByIdICInfo {
        let gp = GeneralHeapPtr::from_user(prop);
        match Self::hidden_class_kind(this) {
            HiddenClassKind::Structure(s) => {
                let sr = unsafe { s.as_ref() };
                let inline_cap = sr.inline_named_storage_capacity as u32;
                let may_have_metatable = sr.may_have_metatable();
                match sr.lookup_property(gp) {
                    Some(slot) if (slot as u32) < inline_cap => PutByIdICInfo {
                        kind: PutByIdIcKind::InlinedStorage(slot as u32),
                        may_have_metatable,
                    },
                    Some(slot) => PutByIdICInfo {
                        kind: PutByIdIcKind::OutlinedStorage(slot as u32 - inline_cap),
                        may_have_metatable,
                    },
                    None => {
                        if sr.num_slots >= crate::hidden_class::X_MAX_STRUCTURE_SLOTS {
                            PutByIdICInfo {
                                kind: PutByIdIcKind::TransitionToDictionary,
                                may_have_metatable,
                            }
                        } else {
                            // The transition is resolved (and the edge
                            // installed) by the execute path, which has
                            // allocator access.
                            PutByIdICInfo {
                                kind: PutByIdIcKind::AddProperty {
                                    new_structure: SystemHeapPtr::null(),
                                    slot: sr.num_slots as u32,
                                    grow_butterfly_to: None,
                                },
                                may_have_metatable,
                            }
                        }
                    }
                }
            }
            HiddenClassKind::Dictionary(d) => {
                let dr = unsafe { d.as_ref() };
                let may_have_metatable = !dr.metatable.is_null();
                if !dr.is_cacheable() {
                    return PutByIdICInfo {
                        kind: PutByIdIcKind::UncachableDictionary,
                        may_have_metatable,
                    };
                }
                let inline_cap = dr.inline_named_storage_capacity as u32;
                match dr.lookup_property(gp) {
                    Some(slot) if slot < inline_cap => PutByIdICInfo {
                        kind: PutByIdIcKind::InlinedStorage(slot),
                        may_have_metatable,
                    },
                    Some(slot) => PutByIdICInfo {
                        kind: PutByIdIcKind::OutlinedStorage(slot - inline_cap),
                        may_have_metatable,
                    },
                    None => PutByIdICInfo { kind: PutByIdIcKind::DictionaryAdd, may_have_metatable },
                }
            }
        }
    }

    /// Raw named-property write: performs whatever transition the shape
    /// needs. Writing nil to an absent property still claims the slot
    /// (slots are never removed; a nil slot reads back as absent).
    pub fn put_by_id(
        this: UserHeapPtr<TableObject>,
        layout: &mut VmLayout,
        prop: UserHeapPtr<HeapString>,
        value: TValue,
    ) {
        let gp = GeneralHeapPtr::from_user(prop);
        match Self::hidden_class_kind(this) {
            HiddenClassKind::Structure(s) => {
                let sr = unsafe { s.as_ref() };
                if let Some(slot) = sr.lookup_property(gp) {
                    Self::put_value_at_slot(this, slot as u32, value);
                    return;
                }
                let old_named_cap = sr.butterfly_named_storage_capacity as u32;
                let r = Structure::add_property(s, layout, gp);
                if r.transitioned_to_dictionary {
                    let (dict, slot) =
                        DictionaryHiddenClass::create_from_structure(layout, sr, gp);
                    let new_cap = unsafe { dict.as_ref() }.butterfly_named_storage_capacity;
                    Self::grow_butterfly_named(this, layout, old_named_cap, new_cap);
                    unsafe { this.as_mut() }.hdr.hidden_class = dict.raw();
                    Self::put_value_at_slot(this, slot, value);
                    return;
                }
                if let Some(new_cap) = r.grow_butterfly_to {
                    Self::grow_butterfly_named(this, layout, old_named_cap, new_cap as u32);
                }
                unsafe { this.as_mut() }.hdr.hidden_class = r.new_structure.raw();
                Self::put_value_at_slot(this, r.slot as u32, value);
            }
            HiddenClassKind::Dictionary(d) => {
                let dr = unsafe { d.as_mut() };
                if let Some(slot) = dr.lookup_property(gp) {
                    Self::put_value_at_slot(this, slot, value);
                    return;
                }
                let old_named_cap = dr.butterfly_named_storage_capacity;
                let (slot, grow) = dr.add_property(gp);
                if let Some(new_cap) = grow {
                    Self::grow_butterfly_named(this, layout, old_named_cap, new_cap);
                }
                Self::put_value_at_slot(this, slot, value);
            }
        }
    }

    /// Resolved AddProperty transition, as cached by put inline caches.
    pub fn put_by_id_resolving_transition(
        this: UserHeapPtr<TableObject>,
        layout: &mut VmLayout,
        prop: UserHeapPtr<HeapString>,
        value: TValue,
    ) -> Option<CachedAddProperty> {
        let gp = GeneralHeapPtr::from_user(prop);
        match Self::hidden_class_kind(this) {
            HiddenClassKind::Structure(s) => {
                let sr = unsafe { s.as_ref() };
                debug_assert!(sr.lookup_property(gp).is_none());
                let old_named_cap = sr.butterfly_named_storage_capacity as u32;
                let r = Structure::add_property(s, layout, gp);
                if r.transitioned_to_dictionary {
                    Self::put_by_id(this, layout, prop, value);
                    return None;
                }
                if let Some(new_cap) = r.grow_butterfly_to {
                    Self::grow_butterfly_named(this, layout, old_named_cap, new_cap as u32);
                }
                unsafe { this.as_mut() }.hdr.hidden_class = r.new_structure.raw();
                Self::put_value_at_slot(this, r.slot as u32, value);
                Some(CachedAddProperty {
                    new_structure: r.new_structure.raw(),
                    slot: r.slot as u32,
                    grow_butterfly_to: r.grow_butterfly_to,
                })
            }
            HiddenClassKind::Dictionary(_) => {
                Self::put_by_id(this, layout, prop, value);
                None
            }
        }
    }

    /// Replays a cached AddProperty effect: the object's hidden class was
    /// verified equal to the cache key by the caller.
    pub fn replay_add_property_transition(
        this: UserHeapPtr<TableObject>,
        layout: &mut VmLayout,
        new_structure_raw: u32,
        slot: u32,
        grow_butterfly_to: Option<u32>,
        value: TValue,
    ) {
        if let Some(new_cap) = grow_butterfly_to {
            let old_named_cap = Self::butterfly_named_capacity(this);
            Self::grow_butterfly_named(this, layout, old_named_cap, new_cap);
        }
        unsafe { this.as_mut() }.hdr.hidden_class = new_structure_raw;
        Self::put_value_at_slot(this, slot, value);
    }

    // `old_named_cap` is the capacity before the triggering shape change:
    // hidden classes mutate before storage catches up, so the caller must
    // capture it.
    fn grow_butterfly_named(
        this: UserHeapPtr<TableObject>,
        layout: &mut VmLayout,
        old_named_cap: u32,
        new_named_cap: u32,
    ) {
        let t = unsafe { this.as_mut() };
        let at = ArrayType(t.hdr.array_type);
        unsafe {
            if t.butterfly.is_null() {
                t.butterfly = Butterfly::allocate(layout, 0, new_named_cap, at.has_sparse_map());
            } else {
                let old_array_cap = Butterfly::array_capacity(t.butterfly);
                t.butterfly = Butterfly::grow(
                    layout,
                    t.butterfly,
                    old_named_cap,
                    at.has_sparse_map(),
                    old_array_cap,
                    new_named_cap,
                    at.has_sparse_map(),
                );
            }
        }
    }

    // ============ array part ============

    #[inline]
    pub fn get_by_integer_index(this: UserHeapPtr<TableObject>, idx: i64) -> TValue {
        let t = unsafe { this.as_ref() };
        let bf = t.butterfly;
        if bf.is_null() {
            return TValue::nil();
        }
        let at = ArrayType(t.hdr.array_type);
        unsafe {
            let cap = Butterfly::array_capacity(bf) as i64;
            if (X_ARRAY_BASE_ORD..=cap).contains(&idx) {
                return *Butterfly::array_elem_ptr(bf, idx);
            }
            if at.has_sparse_map() {
                let map = Butterfly::sparse_map(bf);
                if !map.is_null() {
                    return map.as_ref().get(idx as f64);
                }
            }
        }
        TValue::nil()
    }

    #[inline]
    pub fn get_by_double_index(this: UserHeapPtr<TableObject>, d: f64) -> TValue {
        if d.is_nan() {
            return TValue::nil();
        }
        let as_int = d as i64;
        if as_int as f64 == d {
            return Self::get_by_integer_index(this, as_int);
        }
        let t = unsafe { this.as_ref() };
        let at = ArrayType(t.hdr.array_type);
        if at.has_sparse_map() && !t.butterfly.is_null() {
            let map = unsafe { Butterfly::sparse_map(t.butterfly) };
            if !map.is_null() {
                return unsafe { map.as_ref() }.get(d);
            }
        }
        TValue::nil()
    }

    /// Raw integer-index write with the full growth / widening / sparse
    /// policy. No metatable consult (that is the bytecode's job).
    pub fn raw_put_by_integer_index(
        this: UserHeapPtr<TableObject>,
        layout: &mut VmLayout,
        idx: i64,
        value: TValue,
    ) {
        if idx < X_ARRAY_BASE_ORD {
            Self::raw_put_to_sparse(this, layout, idx as f64, value);
            return;
        }
        let t = unsafe { this.as_mut() };
        unsafe {
            if t.butterfly.is_null() || Butterfly::array_capacity(t.butterfly) == 0 {
                if value.is_nil() {
                    // Erasing an index that may only live in the sparse map.
                    if ArrayType(t.hdr.array_type).has_sparse_map() {
                        Self::raw_put_to_sparse(this, layout, idx as f64, value);
                    }
                    return;
                }
                if idx <= X_ALWAYS_VECTOR_CUTOFF {
                    let cap = (idx as u32).next_power_of_two().max(4);
                    Self::ensure_array_capacity(this, layout, cap);
                    let bf = this.as_ref().butterfly;
                    *Butterfly::array_elem_ptr(bf, idx) = value;
                    let hdr = Butterfly::header_ptr(bf);
                    if idx == X_ARRAY_BASE_ORD {
                        (*hdr).array_length_if_continuous = (idx + 1) as i32;
                    } else {
                        Self::mark_non_continuous(this);
                    }
                    Self::widen_array_kind(this, layout, value);
                    Self::barrier_for(this, value);
                } else {
                    Self::raw_put_to_sparse(this, layout, idx as f64, value);
                }
                return;
            }

            let bf = t.butterfly;
            let cap = Butterfly::array_capacity(bf) as i64;
            if idx <= cap {
                *Butterfly::array_elem_ptr(bf, idx) = value;
                Self::update_continuity_after_store(this, idx, value);
                if !value.is_nil() {
                    Self::widen_array_kind(this, layout, value);
                }
                Self::barrier_for(this, value);
                return;
            }

            // Beyond the vector.
            if value.is_nil() {
                if ArrayType(t.hdr.array_type).has_sparse_map() {
                    Self::raw_put_to_sparse(this, layout, idx as f64, value);
                }
                return;
            }
            if idx <= X_ALWAYS_VECTOR_CUTOFF || idx < cap * 4 {
                let new_cap = (idx as u32).max(cap as u32 * 2).next_power_of_two();
                Self::ensure_array_capacity(this, layout, new_cap);
                let bf = this.as_ref().butterfly;
                *Butterfly::array_elem_ptr(bf, idx) = value;
                Self::update_continuity_after_store(this, idx, value);
                Self::widen_array_kind(this, layout, value);
                Self::barrier_for(this, value);
            } else {
                Self::raw_put_to_sparse(this, layout, idx as f64, value);
            }
        }
    }

    pub fn raw_put_by_double_index(
        this: UserHeapPtr<TableObject>,
        layout: &mut VmLayout,
        d: f64,
        value: TValue,
    ) {
        debug_assert!(!d.is_nan());
        let d = if d == 0.0 { 0.0 } else { d }; // normalizes -0.0
        let as_int = d as i64;
        if as_int as f64 == d {
            Self::raw_put_by_integer_index(this, layout, as_int, value);
        } else {
            Self::raw_put_to_sparse(this, layout, d, value);
        }
    }

    fn raw_put_to_sparse(
        this: UserHeapPtr<TableObject>,
        layout: &mut VmLayout,
        key: f64,
        value: TValue,
    ) {
        if value.is_nil() && !Self::array_type(this).has_sparse_map() {
            return;
        }
        let map = Self::ensure_sparse_map(this, layout);
        unsafe { map.as_mut() }.put(key, value);
        Self::barrier_for(this, value);
    }

    fn ensure_sparse_map(
        this: UserHeapPtr<TableObject>,
        layout: &mut VmLayout,
    ) -> UserHeapPtr<ArraySparseMap> {
        let t = unsafe { this.as_mut() };
        let mut at = ArrayType(t.hdr.array_type);
        unsafe {
            if !at.has_sparse_map() {
                // The sparse word lives at the block front: reallocate.
                if t.butterfly.is_null() {
                    t.butterfly = Butterfly::allocate(layout, 0, 0, true);
                } else {
                    let old_named = Self::butterfly_named_capacity(this);
                    let old_array = Butterfly::array_capacity(t.butterfly);
                    t.butterfly = Butterfly::grow(
                        layout, t.butterfly, old_named, false, old_array, old_named, true,
                    );
                }
                at.set_has_sparse_map();
                t.hdr.array_type = at.0;
                Self::sync_structure_array_type(this, layout, at);
                let map = ArraySparseMap::create(layout);
                Butterfly::set_sparse_map(t.butterfly, map);
                return map;
            }
            let existing = Butterfly::sparse_map(t.butterfly);
            if existing.is_null() {
                let map = ArraySparseMap::create(layout);
                Butterfly::set_sparse_map(t.butterfly, map);
                map
            } else {
                existing
            }
        }
    }

    fn butterfly_named_capacity(this: UserHeapPtr<TableObject>) -> u32 {
        match Self::hidden_class_kind(this) {
            HiddenClassKind::Structure(s) => {
                unsafe { s.as_ref() }.butterfly_named_storage_capacity as u32
            }
            HiddenClassKind::Dictionary(d) => {
                unsafe { d.as_ref() }.butterfly_named_storage_capacity
            }
        }
    }

    fn ensure_array_capacity(this: UserHeapPtr<TableObject>, layout: &mut VmLayout, cap: u32) {
        let t = unsafe { this.as_mut() };
        let at = ArrayType(t.hdr.array_type);
        unsafe {
            if t.butterfly.is_null() {
                t.butterfly = Butterfly::allocate(layout, cap, 0, at.has_sparse_map());
                return;
            }
            let old_cap = Butterfly::array_capacity(t.butterfly);
            if old_cap >= cap {
                return;
            }
            let named = Self::butterfly_named_capacity(this);
            t.butterfly = Butterfly::grow(
                layout,
                t.butterfly,
                named,
                at.has_sparse_map(),
                cap,
                named,
                at.has_sparse_map(),
            );
        }
    }

    #[inline]
    unsafe fn update_continuity_after_store(
        this: UserHeapPtr<TableObject>,
        idx: i64,
        value: TValue,
    ) {
        let t = this.as_mut();
        if !ArrayType(t.hdr.array_type).is_continuous() {
            return;
        }
        let hdr = Butterfly::header_ptr(t.butterfly);
        let first_nil = (*hdr).array_length_if_continuous as i64;
        if !value.is_nil() {
            if idx == first_nil {
                (*hdr).array_length_if_continuous = (first_nil + 1) as i32;
            } else if idx > first_nil {
                Self::mark_non_continuous(this);
            }
        } else if idx == first_nil - 1 {
            (*hdr).array_length_if_continuous = (first_nil - 1) as i32;
        } else if idx < first_nil - 1 {
            Self::mark_non_continuous(this);
        }
    }

    unsafe fn mark_non_continuous(this: UserHeapPtr<TableObject>) {
        let t = this.as_mut();
        let mut at = ArrayType(t.hdr.array_type);
        if at.is_continuous() {
            at.set_continuous(false);
            t.hdr.array_type = at.0;
            (*Butterfly::header_ptr(t.butterfly)).array_length_if_continuous = -1;
        }
    }

    fn widen_array_kind(this: UserHeapPtr<TableObject>, layout: &mut VmLayout, value: TValue) {
        let kind_of_value = if value.is_int32() {
            ArrayElementKind::Int32
        } else if value.is_double() {
            ArrayElementKind::Double
        } else if value.is_nil() {
            return;
        } else {
            ArrayElementKind::Any
        };
        let t = unsafe { this.as_mut() };
        let mut at = ArrayType(t.hdr.array_type);
        let merged = match at.element_kind() {
            ArrayElementKind::NoArrayPart => kind_of_value,
            cur if cur == kind_of_value => return,
            _ => ArrayElementKind::Any,
        };
        if merged == at.element_kind() {
            return;
        }
        at.set_element_kind(merged);
        t.hdr.array_type = at.0;
        Self::sync_structure_array_type(this, layout, at);
    }

    // Array-kind and sparse-map bits are shape: they transition the hidden
    // class so future same-path tables share it. Continuity is per-object
    // and excluded from the transition key.
    fn sync_structure_array_type(
        this: UserHeapPtr<TableObject>,
        layout: &mut VmLayout,
        object_at: ArrayType,
    ) {
        match Self::hidden_class_kind(this) {
            HiddenClassKind::Structure(s) => {
                let mut structure_at = object_at;
                structure_at.set_continuous(true);
                let new_s = Structure::transition_array_type(s, layout, structure_at);
                unsafe { this.as_mut() }.hdr.hidden_class = new_s.raw();
            }
            HiddenClassKind::Dictionary(d) => {
                unsafe { d.as_mut() }.array_type = object_at;
            }
        }
    }

    #[inline]
    fn barrier_for(this: UserHeapPtr<TableObject>, value: TValue) {
        if value.is_pointer() {
            unsafe { write_barrier_user(this.as_ptr() as usize) };
        }
    }

    // ============ length ============

    /// The `#` operator: O(1) when continuous, border binary search
    /// otherwise (any border is a valid answer for a table with holes).
    pub fn table_length(this: UserHeapPtr<TableObject>) -> i64 {
        let t = unsafe { this.as_ref() };
        if t.butterfly.is_null() {
            return 0;
        }
        unsafe {
            let bf = t.butterfly;
            let at = ArrayType(t.hdr.array_type);
            if at.is_continuous() {
                return (*Butterfly::header_ptr(bf)).array_length_if_continuous as i64 - 1;
            }
            let cap = Butterfly::array_capacity(bf) as i64;
            if cap == 0 || (*Butterfly::array_elem_ptr(bf, 1)).is_nil() {
                return 0;
            }
            if !(*Butterfly::array_elem_ptr(bf, cap)).is_nil() {
                return cap;
            }
            let mut lo = 1i64;
            let mut hi = cap;
            // elem(lo) non-nil, elem(hi) nil
            while hi - lo > 1 {
                let mid = (lo + hi) / 2;
                if (*Butterfly::array_elem_ptr(bf, mid)).is_nil() {
                    hi = mid;
                } else {
                    lo = mid;
                }
            }
            lo
        }
    }

    // ============ metatable ============

    pub fn get_metatable(this: UserHeapPtr<TableObject>) -> UserHeapPtr<TableObject> {
        match Self::hidden_class_kind(this) {
            HiddenClassKind::Structure(s) => {
                let sr = unsafe { s.as_ref() };
                match sr.metatable_kind {
                    StructureMetatableKind::NoMetatable => UserHeapPtr::null(),
                    StructureMetatableKind::Unique => sr.metatable,
                    StructureMetatableKind::PolyMetatable => {
                        let v = Self::get_value_at_slot(this, sr.poly_metatable_slot as u32);
                        if v.is_nil() {
                            UserHeapPtr::null()
                        } else {
                            v.as_pointer()
                        }
                    }
                }
            }
            HiddenClassKind::Dictionary(d) => unsafe { d.as_ref() }.metatable,
        }
    }

    /// Sets (or, with null, removes) the metatable, transitioning the
    /// hidden class as required.
    pub fn set_metatable(
        this: UserHeapPtr<TableObject>,
        layout: &mut VmLayout,
        poly_slot_sentinel: GeneralHeapPtr<HeapString>,
        mt: UserHeapPtr<TableObject>,
    ) {
        match Self::hidden_class_kind(this) {
            HiddenClassKind::Structure(s) => {
                let old_named_cap =
                    unsafe { s.as_ref() }.butterfly_named_storage_capacity as u32;
                let result = if mt.is_null() {
                    Structure::remove_metatable(s, layout)
                } else {
                    Structure::set_metatable(s, layout, poly_slot_sentinel, mt)
                };
                match result {
                    SetMetatableResult::NoChange => {}
                    SetMetatableResult::NewStructure(new_s) => {
                        let t = unsafe { this.as_mut() };
                        t.hdr.hidden_class = new_s.raw();
                        let mut at = ArrayType(t.hdr.array_type);
                        at.set_may_have_metatable(!mt.is_null());
                        t.hdr.array_type = at.0;
                    }
                    SetMetatableResult::Poly { new_structure, slot, grow_butterfly_to } => {
                        if let Some(new_cap) = grow_butterfly_to {
                            Self::grow_butterfly_named(this, layout, old_named_cap, new_cap as u32);
                        }
                        let t = unsafe { this.as_mut() };
                        t.hdr.hidden_class = new_structure.raw();
                        let mut at = ArrayType(t.hdr.array_type);
                        at.set_may_have_metatable(true);
                        t.hdr.array_type = at.0;
                        let v = if mt.is_null() { TValue::nil() } else { TValue::pointer(mt) };
                        Self::put_value_at_slot(this, slot as u32, v);
                    }
                    SetMetatableResult::StoreToPolySlot(slot) => {
                        let v = if mt.is_null() { TValue::nil() } else { TValue::pointer(mt) };
                        Self::put_value_at_slot(this, slot as u32, v);
                    }
                }
            }
            HiddenClassKind::Dictionary(d) => {
                unsafe { d.as_mut() }.set_metatable_demoting(mt);
                let t = unsafe { this.as_mut() };
                let mut at = ArrayType(t.hdr.array_type);
                at.set_may_have_metatable(!mt.is_null());
                t.hdr.array_type = at.0;
            }
        }
        if !mt.is_null() {
            unsafe { write_barrier_user(this.as_ptr() as usize) };
        }
    }

    /// Fast negative metamethod lookup: true means "this table, used as a
    /// metatable, definitely lacks the metamethod".
    #[inline]
    pub fn try_quickly_rule_out_metamethod(
        metatable: UserHeapPtr<TableObject>,
        kind: LuaMetamethodKind,
    ) -> bool {
        let mask = match Self::hidden_class_kind(metatable) {
            HiddenClassKind::Structure(s) => unsafe { s.as_ref() }.known_absent_metamethod_mask,
            HiddenClassKind::Dictionary(d) => {
                unsafe { d.as_ref() }.known_absent_metamethod_mask
            }
        };
        mask & kind.mask_bit() != 0
    }

    // ============ cloning (table literal templates) ============

    /// Shallow-clones a template table: shares the hidden class, copies
    /// inline slots, butterfly contents and the sparse map.
    pub fn shallow_clone(
        this: UserHeapPtr<TableObject>,
        layout: &mut VmLayout,
    ) -> UserHeapPtr<TableObject> {
        let src = unsafe { this.as_ref() };
        let inline_cap = Self::inline_capacity(this);
        let size = X_TABLE_OBJECT_TRAILING_OFFSET + inline_cap as usize * 8;
        let addr = layout.alloc_from_user_heap(size);
        let fresh: UserHeapPtr<TableObject> = UserHeapPtr::from_addr(addr);
        unsafe {
            let dst = fresh.as_mut();
            dst.hdr = src.hdr;
            dst.butterfly = UserHeapPtr::null();
            for i in 0..inline_cap {
                *Self::inline_slot_ptr(fresh, i) = *Self::inline_slot_ptr(this, i);
            }
            if !src.butterfly.is_null() {
                let at = ArrayType(src.hdr.array_type);
                let array_cap = Butterfly::array_capacity(src.butterfly);
                let named_cap = Self::butterfly_named_capacity(this);
                let bf =
                    Butterfly::allocate(layout, array_cap, named_cap, at.has_sparse_map());
                *Butterfly::header_ptr(bf) = Butterfly::header(src.butterfly);
                for ord in X_ARRAY_BASE_ORD..=(array_cap as i64) {
                    *Butterfly::array_elem_ptr(bf, ord) =
                        *Butterfly::array_elem_ptr(src.butterfly, ord);
                }
                for s in 0..named_cap {
                    *Butterfly::named_slot_ptr(bf, s) =
                        *Butterfly::named_slot_ptr(src.butterfly, s);
                }
                if at.has_sparse_map() {
                    let src_map = Butterfly::sparse_map(src.butterfly);
                    if !src_map.is_null() {
                        let cloned = src_map.as_ref().clone_contents_into(layout);
                        Butterfly::set_sparse_map(bf, cloned);
                    }
                }
                fresh.as_mut().butterfly = bf;
            }
        }
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::StringInterner;

    struct Env {
        layout: Box<VmLayout>,
        interner: StringInterner,
    }

    fn setup() -> Env {
        let mut layout = VmLayout::reserve();
        let interner = StringInterner::new(&mut layout);
        Env { layout, interner }
    }

    fn new_table(env: &mut Env, inline_cap: u8, array_cap: u32) -> UserHeapPtr<TableObject> {
        let s = Structure::create_initial(&mut env.layout, inline_cap);
        TableObject::create_empty(&mut env.layout, s, array_cap)
    }

    #[test]
    fn test_named_property_roundtrip() {
        let mut env = setup();
        let t = new_table(&mut env, 2, 0);
        let x = env.interner.intern(&mut env.layout, b"x");
        let y = env.interner.intern(&mut env.layout, b"y");
        let z = env.interner.intern(&mut env.layout, b"z");

        assert!(TableObject::get_by_id(t, x).is_nil());
        TableObject::put_by_id(t, &mut env.layout, x, TValue::double(1.0));
        TableObject::put_by_id(t, &mut env.layout, y, TValue::double(2.0));
        // Third property spills to the butterfly.
        TableObject::put_by_id(t, &mut env.layout, z, TValue::double(3.0));
        assert_eq!(TableObject::get_by_id(t, x).as_double(), 1.0);
        assert_eq!(TableObject::get_by_id(t, y).as_double(), 2.0);
        assert_eq!(TableObject::get_by_id(t, z).as_double(), 3.0);

        let info = TableObject::prepare_get_by_id(t, z);
        assert!(matches!(info.kind, GetByIdIcKind::OutlinedStorage(0)));
    }

    #[test]
    fn test_same_insertion_path_shares_structure() {
        let mut env = setup();
        let root = Structure::create_initial(&mut env.layout, 4);
        let a = TableObject::create_empty(&mut env.layout, root, 0);
        let b = TableObject::create_empty(&mut env.layout, root, 0);
        let k1 = env.interner.intern(&mut env.layout, b"k1");
        let k2 = env.interner.intern(&mut env.layout, b"k2");
        for t in [a, b] {
            TableObject::put_by_id(t, &mut env.layout, k1, TValue::double(1.0));
            TableObject::put_by_id(t, &mut env.layout, k2, TValue::double(2.0));
        }
        assert_eq!(
            unsafe { a.as_ref() }.hdr.hidden_class,
            unsafe { b.as_ref() }.hdr.hidden_class
        );
    }

    #[test]
    fn test_array_continuity_invariant() {
        let mut env = setup();
        let t = new_table(&mut env, 0, 4);
        for i in 1..=3 {
            TableObject::raw_put_by_integer_index(t, &mut env.layout, i, TValue::double(i as f64));
        }
        assert!(TableObject::array_type(t).is_continuous());
        assert_eq!(TableObject::table_length(t), 3);
        unsafe {
            let bf = t.as_ref().butterfly;
            let first_nil = (*Butterfly::header_ptr(bf)).array_length_if_continuous as i64;
            assert_eq!(first_nil, 4);
            for i in 1..first_nil {
                assert!(!(*Butterfly::array_elem_ptr(bf, i)).is_nil());
            }
        }

        // Punching a hole drops continuity; length becomes a border.
        TableObject::raw_put_by_integer_index(t, &mut env.layout, 2, TValue::nil());
        assert!(!TableObject::array_type(t).is_continuous());
        let len = TableObject::table_length(t);
        assert!(len == 1 || len == 3, "border may be either side of the hole, got {}", len);
    }

    #[test]
    fn test_array_growth_and_kind_widening() {
        let mut env = setup();
        let t = new_table(&mut env, 0, 2);
        TableObject::raw_put_by_integer_index(t, &mut env.layout, 1, TValue::double(1.5));
        assert_eq!(TableObject::array_type(t).element_kind(), ArrayElementKind::Double);
        for i in 2..=40 {
            TableObject::raw_put_by_integer_index(t, &mut env.layout, i, TValue::double(i as f64));
        }
        assert_eq!(TableObject::table_length(t), 40);
        // Widening to Any on a non-number element.
        let s = env.interner.intern(&mut env.layout, b"str");
        TableObject::raw_put_by_integer_index(t, &mut env.layout, 5, TValue::pointer(s));
        assert_eq!(TableObject::array_type(t).element_kind(), ArrayElementKind::Any);
        assert!(TableObject::get_by_integer_index(t, 5).is_string());
    }

    #[test]
    fn test_sparse_map_overflow() {
        let mut env = setup();
        let t = new_table(&mut env, 0, 0);
        TableObject::raw_put_by_integer_index(t, &mut env.layout, 1_000_000, TValue::double(7.0));
        assert!(TableObject::array_type(t).has_sparse_map());
        assert_eq!(TableObject::get_by_integer_index(t, 1_000_000).as_double(), 7.0);
        assert!(TableObject::get_by_integer_index(t, 999_999).is_nil());

        TableObject::raw_put_by_double_index(t, &mut env.layout, 2.5, TValue::double(9.0));
        assert_eq!(TableObject::get_by_double_index(t, 2.5).as_double(), 9.0);
        // Integral double routes to the array path.
        TableObject::raw_put_by_double_index(t, &mut env.layout, 3.0, TValue::double(30.0));
        assert_eq!(TableObject::get_by_integer_index(t, 3).as_double(), 30.0);
    }

    #[test]
    fn test_negative_index_goes_sparse() {
        let mut env = setup();
        let t = new_table(&mut env, 0, 0);
        TableObject::raw_put_by_integer_index(t, &mut env.layout, -5, TValue::double(1.0));
        assert_eq!(TableObject::get_by_integer_index(t, -5).as_double(), 1.0);
        assert_eq!(TableObject::table_length(t), 0);
    }

    #[test]
    fn test_metatable_unique_and_poly() {
        let mut env = setup();
        let root = Structure::create_initial(&mut env.layout, 2);
        let a = TableObject::create_empty(&mut env.layout, root, 0);
        let b = TableObject::create_empty(&mut env.layout, root, 0);
        let mt1 = new_table(&mut env, 0, 0);
        let mt2 = new_table(&mut env, 0, 0);
        let sentinel = GeneralHeapPtr::from_user(env.interner.special_key_for_metatable_slot());

        TableObject::set_metatable(a, &mut env.layout, sentinel, mt1);
        assert_eq!(TableObject::get_metatable(a), mt1);
        assert!(TableObject::get_metatable(b).is_null());

        // b takes the same unique-metatable edge.
        TableObject::set_metatable(b, &mut env.layout, sentinel, mt1);
        assert_eq!(
            unsafe { a.as_ref() }.hdr.hidden_class,
            unsafe { b.as_ref() }.hdr.hidden_class
        );

        // A conflicting metatable forces b into polymetatable mode.
        TableObject::set_metatable(b, &mut env.layout, sentinel, mt2);
        assert_eq!(TableObject::get_metatable(b), mt2);
        assert_eq!(TableObject::get_metatable(a), mt1);
        assert!(TableObject::array_type(b).may_have_metatable());
    }

    #[test]
    fn test_dictionary_fallback() {
        let mut env = setup();
        let t = new_table(&mut env, 4, 0);
        let mut names = Vec::new();
        for i in 0..=crate::hidden_class::X_MAX_STRUCTURE_SLOTS as u32 {
            let name = env.interner.intern(&mut env.layout, format!("prop{}", i).as_bytes());
            names.push(name);
            TableObject::put_by_id(t, &mut env.layout, name, TValue::double(i as f64));
        }
        assert!(matches!(
            TableObject::hidden_class_kind(t),
            HiddenClassKind::Dictionary(_)
        ));
        for (i, &name) in names.iter().enumerate() {
            assert_eq!(TableObject::get_by_id(t, name).as_double(), i as f64, "prop{}", i);
        }
        // Dictionary absent lookups must not claim cacheability.
        let absent = env.interner.intern(&mut env.layout, b"nothere");
        let info = TableObject::prepare_get_by_id(t, absent);
        assert!(matches!(info.kind, GetByIdIcKind::MustBeNilButUncacheable));
    }

    #[test]
    fn test_shallow_clone_independent() {
        let mut env = setup();
        let t = new_table(&mut env, 2, 4);
        let k = env.interner.intern(&mut env.layout, b"k");
        TableObject::put_by_id(t, &mut env.layout, k, TValue::double(1.0));
        TableObject::raw_put_by_integer_index(t, &mut env.layout, 1, TValue::double(10.0));

        let c = TableObject::shallow_clone(t, &mut env.layout);
        assert_eq!(TableObject::get_by_id(c, k).as_double(), 1.0);
        assert_eq!(TableObject::get_by_integer_index(c, 1).as_double(), 10.0);

        TableObject::raw_put_by_integer_index(c, &mut env.layout, 1, TValue::double(99.0));
        assert_eq!(TableObject::get_by_integer_index(t, 1).as_double(), 10.0);
    }

    #[test]
    fn test_rule_out_metamethod_mask() {
        let mut env = setup();
        let mt = new_table(&mut env, 2, 0);
        assert!(TableObject::try_quickly_rule_out_metamethod(mt, LuaMetamethodKind::Index));
        // Pin "__index" the way the VM does at startup.
        let name = env.interner.intern(&mut env.layout, b"__index");
        unsafe { name.as_mut() }.hdr.opaque = LuaMetamethodKind::Index as u8 + 1;
        TableObject::put_by_id(mt, &mut env.layout, name, TValue::double(1.0));
        assert!(!TableObject::try_quickly_rule_out_metamethod(mt, LuaMetamethodKind::Index));
        assert!(TableObject::try_quickly_rule_out_metamethod(mt, LuaMetamethodKind::Add));
    }
}
