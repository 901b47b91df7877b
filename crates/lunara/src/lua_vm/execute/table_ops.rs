// Table-access bytecode semantics: the prepare/execute/fallback protocol,
// inline-cache integration and the __index/__newindex chains.

use crate::gc::{SystemHeapPtr, UserHeapPtr};
use crate::hidden_class::metamethod_kind::LuaMetamethodKind;
use crate::lua_value::heap_string::HeapString;
use crate::lua_value::table_object::{
    GetByIdIcKind, PutByIdIcKind, TableObject,
};
use crate::lua_value::TValue;

use super::{ExecState, Interpreter, ReturnContinuation, StepOutcome, X_INDEX_CHAIN_LIMIT};
use crate::lua_vm::inline_cache::{
    GetByIdIcEntry, GetByIdIcSite, PutByIdIcEntry, PutByIdIcSite, IC_EFFECT_ADD_PROPERTY,
    IC_EFFECT_INLINE, IC_EFFECT_MUST_BE_NIL, IC_EFFECT_OUTLINED,
};
use crate::lua_vm::{Vm, VmResult};

// ============ metatable plumbing ============

/// The metatable of an arbitrary value: tables carry their own, strings
/// share the VM-wide string metatable, everything else has none (5.1).
pub fn get_metatable_for_value(vm: &Vm, v: TValue) -> UserHeapPtr<TableObject> {
    if v.is_table() {
        return TableObject::get_metatable(v.as_pointer());
    }
    if v.is_string() {
        return vm.string_metatable;
    }
    UserHeapPtr::null()
}

pub fn get_metamethod_from_metatable(
    vm: &Vm,
    metatable: UserHeapPtr<TableObject>,
    kind: LuaMetamethodKind,
) -> TValue {
    let name = vm.metamethod_name_string(kind);
    TableObject::get_by_id(metatable, name)
}

pub fn get_metamethod_for_value(vm: &Vm, v: TValue, kind: LuaMetamethodKind) -> TValue {
    let mt = get_metatable_for_value(vm, v);
    if mt.is_null() {
        return TValue::nil();
    }
    if TableObject::try_quickly_rule_out_metamethod(mt, kind) {
        return TValue::nil();
    }
    get_metamethod_from_metatable(vm, mt, kind)
}

// ============ raw keyed access (shared by bytecodes and rawget/rawset) ===

/// Raw read with a runtime key. Exotic key types read as absent: nothing
/// can have been stored under them.
pub fn raw_get_by_tvalue_key(vm: &Vm, table: UserHeapPtr<TableObject>, key: TValue) -> TValue {
    if key.is_string() {
        return TableObject::get_by_id(table, key.as_pointer());
    }
    if key.is_double() {
        return TableObject::get_by_double_index(table, key.as_double());
    }
    if key.is_int32() {
        return TableObject::get_by_integer_index(table, key.as_int32() as i64);
    }
    if key.is_boolean() {
        let sentinel = vm.interner.special_key_for_boolean(key.as_boolean());
        return TableObject::get_by_id(table, sentinel);
    }
    TValue::nil()
}

/// Raw write with a runtime key, enforcing the key-domain errors.
pub fn raw_put_by_tvalue_key(
    vm: &mut Vm,
    table: UserHeapPtr<TableObject>,
    key: TValue,
    value: TValue,
) -> VmResult<()> {
    if key.is_string() {
        TableObject::put_by_id(table, &mut vm.layout, key.as_pointer(), value);
        return Ok(());
    }
    if key.is_double() {
        let d = key.as_double();
        if d.is_nan() {
            return Err(vm.throw_str("table index is NaN"));
        }
        TableObject::raw_put_by_double_index(table, &mut vm.layout, d, value);
        return Ok(());
    }
    if key.is_int32() {
        TableObject::raw_put_by_integer_index(table, &mut vm.layout, key.as_int32() as i64, value);
        return Ok(());
    }
    if key.is_boolean() {
        let sentinel = vm.interner.special_key_for_boolean(key.as_boolean());
        TableObject::put_by_id(table, &mut vm.layout, sentinel, value);
        return Ok(());
    }
    if key.is_nil() {
        return Err(vm.throw_str("table index is nil"));
    }
    Err(vm.throw_str("unsupported key type for table assignment"))
}

// ============ GetById with inline cache ============

/// Executes a by-name read, `site` being the bytecode's IC state. When
/// `fuse_at` names the opcode byte's offset, a first cacheable hit patches
/// the opcode to its specialized variant.
pub unsafe fn execute_get_by_id(
    interp: &mut Interpreter,
    st: &mut ExecState,
    base_v: TValue,
    prop: UserHeapPtr<HeapString>,
    dst: usize,
    site: *mut GetByIdIcSite,
    fuse_at: Option<usize>,
    advance_len: usize,
) -> VmResult<StepOutcome> {
    if base_v.is_pointer() {
        let hidden_class =
            (*base_v.as_pointer::<crate::gc::UserHeapGcHeader>().as_ptr()).hidden_class;
        if let Some(entry) = (*site).lookup(hidden_class) {
            let table: UserHeapPtr<TableObject> = base_v.as_pointer();
            let result = match entry.effect {
                IC_EFFECT_INLINE | IC_EFFECT_OUTLINED => {
                    read_slot_by_effect(table, entry.effect, entry.slot as u32)
                }
                _ => TValue::nil(),
            };
            if entry.may_have_metatable != 0 && result.is_nil() {
                return get_index_chain(interp, st, base_v, TValue::pointer(prop), dst, advance_len);
            }
            *st.base.add(dst) = result;
            st.pc += advance_len;
            return Ok(StepOutcome::Continue);
        }

        if base_v.is_table() {
            let table: UserHeapPtr<TableObject> = base_v.as_pointer();
            let info = TableObject::prepare_get_by_id(table, prop);
            let result = TableObject::get_by_id_with_info(table, prop, info);

            let cacheable_effect = match info.kind {
                GetByIdIcKind::InlinedStorage(slot) => Some((IC_EFFECT_INLINE, slot)),
                GetByIdIcKind::OutlinedStorage(slot) => Some((IC_EFFECT_OUTLINED, slot)),
                GetByIdIcKind::MustBeNil => Some((IC_EFFECT_MUST_BE_NIL, 0)),
                GetByIdIcKind::MustBeNilButUncacheable
                | GetByIdIcKind::UncachableDictionary => None,
            };
            if let Some((effect, slot)) = cacheable_effect {
                if slot <= u16::MAX as u32 {
                    let way = (*site).install(
                        hidden_class,
                        GetByIdIcEntry {
                            effect,
                            may_have_metatable: info.may_have_metatable as u8,
                            slot: slot as u16,
                        },
                    );
                    // Fuse the dispatch: the opcode byte is patched to the
                    // handler specialized for this entry's storage kind.
                    if way == 0 && (*site).fused == 0 {
                        if let Some(opcode_off) = fuse_at {
                            let bc = st.cb.as_ref().bytecode_ptr();
                            let fused_op = match effect {
                                IC_EFFECT_INLINE => {
                                    Some(crate::lua_vm::Opcode::TableGetByIdIcHitInline)
                                }
                                IC_EFFECT_OUTLINED => {
                                    Some(crate::lua_vm::Opcode::TableGetByIdIcHitOutlined)
                                }
                                _ => None,
                            };
                            if let Some(op) = fused_op {
                                *bc.add(opcode_off) = op as u8;
                                (*site).fused = 1;
                            }
                        }
                    }
                }
            }

            if info.may_have_metatable && result.is_nil() {
                return get_index_chain(interp, st, base_v, TValue::pointer(prop), dst, advance_len);
            }
            *st.base.add(dst) = result;
            st.pc += advance_len;
            return Ok(StepOutcome::Continue);
        }
    }
    get_index_chain(interp, st, base_v, TValue::pointer(prop), dst, advance_len)
}

#[inline(always)]
unsafe fn read_slot_by_effect(table: UserHeapPtr<TableObject>, effect: u8, slot: u32) -> TValue {
    if effect == IC_EFFECT_INLINE {
        *((table.as_ptr() as *mut u8)
            .add(crate::lua_value::table_object::X_TABLE_OBJECT_TRAILING_OFFSET)
            as *mut TValue)
            .add(slot as usize)
    } else {
        *crate::lua_value::butterfly::Butterfly::named_slot_ptr(table.as_ref().butterfly, slot)
    }
}

/// Specialized handlers installed by fusing: validate way 0 and fall back
/// to the generic path on miss.
pub unsafe fn execute_get_by_id_fused(
    interp: &mut Interpreter,
    st: &mut ExecState,
    base_v: TValue,
    prop: UserHeapPtr<HeapString>,
    dst: usize,
    site: *mut GetByIdIcSite,
    expect_effect: u8,
    advance_len: usize,
) -> VmResult<StepOutcome> {
    if base_v.is_pointer() {
        let hidden_class =
            (*base_v.as_pointer::<crate::gc::UserHeapGcHeader>().as_ptr()).hidden_class;
        if (*site).keys[0] == hidden_class && (*site).entries[0].effect == expect_effect {
            let entry = (*site).entries[0];
            let table: UserHeapPtr<TableObject> = base_v.as_pointer();
            let result = read_slot_by_effect(table, expect_effect, entry.slot as u32);
            if !(entry.may_have_metatable != 0 && result.is_nil()) {
                *st.base.add(dst) = result;
                st.pc += advance_len;
                return Ok(StepOutcome::Continue);
            }
        }
    }
    execute_get_by_id(interp, st, base_v, prop, dst, site, None, advance_len)
}

// ============ PutById with inline cache ============

pub unsafe fn execute_put_by_id(
    interp: &mut Interpreter,
    st: &mut ExecState,
    base_v: TValue,
    prop: UserHeapPtr<HeapString>,
    value: TValue,
    site: *mut PutByIdIcSite,
    fuse_at: Option<usize>,
    advance_len: usize,
) -> VmResult<StepOutcome> {
    if base_v.is_pointer() {
        let hidden_class =
            (*base_v.as_pointer::<crate::gc::UserHeapGcHeader>().as_ptr()).hidden_class;
        if let Some(entry) = (*site).lookup(hidden_class) {
            let table: UserHeapPtr<TableObject> = base_v.as_pointer();
            match entry.effect {
                IC_EFFECT_INLINE | IC_EFFECT_OUTLINED => {
                    if entry.may_have_metatable != 0 {
                        let cur = read_slot_by_effect(table, entry.effect, entry.slot as u32);
                        if cur.is_nil() {
                            return put_index_chain(
                                interp,
                                st,
                                base_v,
                                TValue::pointer(prop),
                                value,
                                advance_len,
                            );
                        }
                    }
                    write_slot_by_effect(table, entry.effect, entry.slot as u32, value);
                    st.pc += advance_len;
                    return Ok(StepOutcome::Continue);
                }
                IC_EFFECT_ADD_PROPERTY => {
                    if entry.may_have_metatable != 0 {
                        return put_index_chain(
                            interp,
                            st,
                            base_v,
                            TValue::pointer(prop),
                            value,
                            advance_len,
                        );
                    }
                    let grow = if entry.grow_butterfly_to != 0 {
                        Some(entry.grow_butterfly_to as u32)
                    } else {
                        None
                    };
                    TableObject::replay_add_property_transition(
                        table,
                        &mut interp.vm.layout,
                        entry.new_structure,
                        entry.slot as u32,
                        grow,
                        value,
                    );
                    st.pc += advance_len;
                    return Ok(StepOutcome::Continue);
                }
                _ => {}
            }
        }

        if base_v.is_table() {
            let table: UserHeapPtr<TableObject> = base_v.as_pointer();
            let info = TableObject::prepare_put_by_id(table, prop);

            // A write that does not overwrite a live slot consults
            // __newindex first.
            if info.may_have_metatable {
                let present_and_non_nil = match info.kind {
                    PutByIdIcKind::InlinedStorage(slot) => {
                        !TableObject::get_value_at_slot(table, slot).is_nil()
                    }
                    PutByIdIcKind::OutlinedStorage(slot) => {
                        let inline_cap = inline_capacity_of(table);
                        !TableObject::get_value_at_slot(table, slot + inline_cap).is_nil()
                    }
                    PutByIdIcKind::UncachableDictionary => {
                        !TableObject::get_by_id(table, prop).is_nil()
                    }
                    _ => false,
                };
                if !present_and_non_nil {
                    return put_index_chain(
                        interp,
                        st,
                        base_v,
                        TValue::pointer(prop),
                        value,
                        advance_len,
                    );
                }
            }

            match info.kind {
                PutByIdIcKind::InlinedStorage(slot) => {
                    if slot <= u16::MAX as u32 {
                        let way = (*site).install(
                            hidden_class,
                            PutByIdIcEntry {
                                effect: IC_EFFECT_INLINE,
                                may_have_metatable: info.may_have_metatable as u8,
                                slot: slot as u16,
                                new_structure: 0,
                                grow_butterfly_to: 0,
                                _pad: [0; 3],
                            },
                        );
                        maybe_fuse_put(st, site, way, fuse_at, IC_EFFECT_INLINE);
                    }
                    TableObject::put_value_at_slot(table, slot, value);
                }
                PutByIdIcKind::OutlinedStorage(slot) => {
                    let inline_cap = inline_capacity_of(table);
                    if slot <= u16::MAX as u32 {
                        let way = (*site).install(
                            hidden_class,
                            PutByIdIcEntry {
                                effect: IC_EFFECT_OUTLINED,
                                may_have_metatable: info.may_have_metatable as u8,
                                slot: slot as u16,
                                new_structure: 0,
                                grow_butterfly_to: 0,
                                _pad: [0; 3],
                            },
                        );
                        maybe_fuse_put(st, site, way, fuse_at, IC_EFFECT_OUTLINED);
                    }
                    TableObject::put_value_at_slot(table, slot + inline_cap, value);
                }
                PutByIdIcKind::AddProperty { .. } => {
                    // Resolve the transition now (the prepare phase has no
                    // allocator); cache the resolved edge.
                    if let Some(cached) = TableObject::put_by_id_resolving_transition(
                        table,
                        &mut interp.vm.layout,
                        prop,
                        value,
                    ) {
                        if cached.slot <= u16::MAX as u32 {
                            (*site).install(
                                hidden_class,
                                PutByIdIcEntry {
                                    effect: IC_EFFECT_ADD_PROPERTY,
                                    may_have_metatable: info.may_have_metatable as u8,
                                    slot: cached.slot as u16,
                                    new_structure: cached.new_structure,
                                    grow_butterfly_to: cached.grow_butterfly_to.unwrap_or(0),
                                    _pad: [0; 3],
                                },
                            );
                        }
                    }
                }
                PutByIdIcKind::TransitionToDictionary
                | PutByIdIcKind::DictionaryAdd
                | PutByIdIcKind::UncachableDictionary => {
                    TableObject::put_by_id(table, &mut interp.vm.layout, prop, value);
                }
            }
            st.pc += advance_len;
            return Ok(StepOutcome::Continue);
        }
    }
    put_index_chain(interp, st, base_v, TValue::pointer(prop), value, advance_len)
}

#[inline(always)]
unsafe fn write_slot_by_effect(
    table: UserHeapPtr<TableObject>,
    effect: u8,
    slot: u32,
    value: TValue,
) {
    if effect == IC_EFFECT_INLINE {
        *((table.as_ptr() as *mut u8)
            .add(crate::lua_value::table_object::X_TABLE_OBJECT_TRAILING_OFFSET)
            as *mut TValue)
            .add(slot as usize) = value;
    } else {
        *crate::lua_value::butterfly::Butterfly::named_slot_ptr(table.as_ref().butterfly, slot) =
            value;
    }
    if value.is_pointer() {
        crate::gc::write_barrier_user(table.as_ptr() as usize);
    }
}

fn inline_capacity_of(table: UserHeapPtr<TableObject>) -> u32 {
    use crate::lua_value::table_object::HiddenClassKind;
    match TableObject::hidden_class_kind(table) {
        HiddenClassKind::Structure(s) => {
            unsafe { s.as_ref() }.inline_named_storage_capacity as u32
        }
        HiddenClassKind::Dictionary(d) => {
            unsafe { d.as_ref() }.inline_named_storage_capacity as u32
        }
    }
}

unsafe fn maybe_fuse_put(
    st: &ExecState,
    site: *mut PutByIdIcSite,
    way: usize,
    fuse_at: Option<usize>,
    effect: u8,
) {
    if way != 0 || (*site).fused != 0 {
        return;
    }
    let Some(opcode_off) = fuse_at else { return };
    let bc = st.cb.as_ref().bytecode_ptr();
    let fused = match effect {
        IC_EFFECT_INLINE => crate::lua_vm::Opcode::TablePutByIdIcHitInline,
        _ => crate::lua_vm::Opcode::TablePutByIdIcHitOutlined,
    };
    *bc.add(opcode_off) = fused as u8;
    (*site).fused = 1;
}

pub unsafe fn execute_put_by_id_fused(
    interp: &mut Interpreter,
    st: &mut ExecState,
    base_v: TValue,
    prop: UserHeapPtr<HeapString>,
    value: TValue,
    site: *mut PutByIdIcSite,
    expect_effect: u8,
    advance_len: usize,
) -> VmResult<StepOutcome> {
    if base_v.is_pointer() {
        let hidden_class =
            (*base_v.as_pointer::<crate::gc::UserHeapGcHeader>().as_ptr()).hidden_class;
        if (*site).keys[0] == hidden_class && (*site).entries[0].effect == expect_effect {
            let entry = (*site).entries[0];
            let table: UserHeapPtr<TableObject> = base_v.as_pointer();
            let blocked = entry.may_have_metatable != 0
                && read_slot_by_effect(table, expect_effect, entry.slot as u32).is_nil();
            if !blocked {
                write_slot_by_effect(table, expect_effect, entry.slot as u32, value);
                st.pc += advance_len;
                return Ok(StepOutcome::Continue);
            }
        }
    }
    execute_put_by_id(interp, st, base_v, prop, value, site, None, advance_len)
}

// ============ generic (non-id) access ============

pub unsafe fn execute_get_generic(
    interp: &mut Interpreter,
    st: &mut ExecState,
    base_v: TValue,
    key: TValue,
    dst: usize,
    advance_len: usize,
) -> VmResult<StepOutcome> {
    get_index_chain(interp, st, base_v, key, dst, advance_len)
}

pub unsafe fn execute_put_generic(
    interp: &mut Interpreter,
    st: &mut ExecState,
    base_v: TValue,
    key: TValue,
    value: TValue,
    advance_len: usize,
) -> VmResult<StepOutcome> {
    put_index_chain(interp, st, base_v, key, value, advance_len)
}

// ============ the metatable chains ============

unsafe fn get_index_chain(
    interp: &mut Interpreter,
    st: &mut ExecState,
    mut base: TValue,
    key: TValue,
    dst: usize,
    advance_len: usize,
) -> VmResult<StepOutcome> {
    for _ in 0..X_INDEX_CHAIN_LIMIT {
        if base.is_table() {
            let table: UserHeapPtr<TableObject> = base.as_pointer();
            let result = raw_get_by_tvalue_key(interp.vm, table, key);
            if !result.is_nil() {
                *st.base.add(dst) = result;
                st.pc += advance_len;
                return Ok(StepOutcome::Continue);
            }
            let mt = TableObject::get_metatable(table);
            if mt.is_null()
                || TableObject::try_quickly_rule_out_metamethod(mt, LuaMetamethodKind::Index)
            {
                *st.base.add(dst) = TValue::nil();
                st.pc += advance_len;
                return Ok(StepOutcome::Continue);
            }
            let mm = get_metamethod_from_metatable(interp.vm, mt, LuaMetamethodKind::Index);
            if mm.is_nil() {
                *st.base.add(dst) = TValue::nil();
                st.pc += advance_len;
                return Ok(StepOutcome::Continue);
            }
            if mm.is_function() {
                return interp.call_from_bytecode(
                    st,
                    mm,
                    &[base, key],
                    ReturnContinuation::StoreResultAndAdvance,
                );
            }
            base = mm;
        } else {
            let mm = get_metamethod_for_value(interp.vm, base, LuaMetamethodKind::Index);
            if mm.is_nil() {
                let msg = format!("attempt to index a {} value", base.type_name());
                return Err(interp.vm.throw_fmt(msg));
            }
            if mm.is_function() {
                return interp.call_from_bytecode(
                    st,
                    mm,
                    &[base, key],
                    ReturnContinuation::StoreResultAndAdvance,
                );
            }
            base = mm;
        }
    }
    Err(interp.vm.throw_str("'__index' chain too long; possible loop"))
}

unsafe fn put_index_chain(
    interp: &mut Interpreter,
    st: &mut ExecState,
    mut base: TValue,
    key: TValue,
    value: TValue,
    advance_len: usize,
) -> VmResult<StepOutcome> {
    for _ in 0..X_INDEX_CHAIN_LIMIT {
        if base.is_table() {
            let table: UserHeapPtr<TableObject> = base.as_pointer();
            let current = raw_get_by_tvalue_key(interp.vm, table, key);
            if !current.is_nil() {
                raw_put_by_tvalue_key(interp.vm, table, key, value)?;
                st.pc += advance_len;
                return Ok(StepOutcome::Continue);
            }
            let mt = TableObject::get_metatable(table);
            let mm = if mt.is_null()
                || TableObject::try_quickly_rule_out_metamethod(mt, LuaMetamethodKind::NewIndex)
            {
                TValue::nil()
            } else {
                get_metamethod_from_metatable(interp.vm, mt, LuaMetamethodKind::NewIndex)
            };
            if mm.is_nil() {
                raw_put_by_tvalue_key(interp.vm, table, key, value)?;
                st.pc += advance_len;
                return Ok(StepOutcome::Continue);
            }
            if mm.is_function() {
                return interp.call_from_bytecode(
                    st,
                    mm,
                    &[base, key, value],
                    ReturnContinuation::PutMM,
                );
            }
            base = mm;
        } else {
            let mm = get_metamethod_for_value(interp.vm, base, LuaMetamethodKind::NewIndex);
            if mm.is_nil() {
                let msg = format!("attempt to index a {} value", base.type_name());
                return Err(interp.vm.throw_fmt(msg));
            }
            if mm.is_function() {
                return interp.call_from_bytecode(
                    st,
                    mm,
                    &[base, key, value],
                    ReturnContinuation::PutMM,
                );
            }
            base = mm;
        }
    }
    Err(interp.vm.throw_str("'__newindex' chain too long; possible loop"))
}
