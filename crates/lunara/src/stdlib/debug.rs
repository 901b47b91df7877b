// debug library: only the metatable accessors are implemented (they are
// object-model operations); hooks and introspection are outside the core.
// debug.setmetatable returns true, the 5.1 behavior.

use crate::define_lib_func;
use crate::gc::UserHeapPtr;
use crate::lua_value::table_object::TableObject;
use crate::lua_value::TValue;
use crate::lua_vm::execute::{get_metatable_for_value, LibFnAction};
use crate::lua_vm::Vm;

use super::install_module;

pub fn install(vm: &mut Vm) {
    install_module(
        vm,
        "debug",
        &[
            ("debug", debug_debug),
            ("getinfo", debug_getinfo),
            ("getlocal", debug_getlocal),
            ("getmetatable", debug_getmetatable),
            ("gethook", debug_gethook),
            ("setmetatable", debug_setmetatable),
            ("sethook", debug_sethook),
            ("traceback", debug_traceback),
        ],
    );
}

define_lib_func!(debug_getmetatable, (vm, ctx) {
    let mt = get_metatable_for_value(vm, ctx.arg(0));
    unsafe {
        *ctx.slot(0) = if mt.is_null() { TValue::nil() } else { TValue::pointer(mt) };
    }
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(debug_setmetatable, (vm, ctx) {
    let target = ctx.arg(0);
    let mt = ctx.arg(1);
    if !mt.is_nil() && !mt.is_table() {
        return Err(vm.throw_str("bad argument #2 to 'setmetatable' (nil or table expected)"));
    }
    if target.is_table() {
        let sentinel = crate::gc::GeneralHeapPtr::from_user(
            vm.interner.special_key_for_metatable_slot(),
        );
        let new_mt: UserHeapPtr<TableObject> =
            if mt.is_nil() { UserHeapPtr::null() } else { mt.as_pointer() };
        TableObject::set_metatable(target.as_pointer(), &mut vm.layout, sentinel, new_mt);
    }
    // Lua 5.1: returns true (5.2+ returns the object instead).
    unsafe { *ctx.slot(0) = TValue::create_true() };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(debug_traceback, (vm, ctx) {
    // No source-level debug info in the core: hand back the message.
    let v = ctx.arg(0);
    unsafe {
        *ctx.slot(0) = if v.is_nil() { vm.const_strings.str_empty } else { v };
    }
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(debug_debug, (vm, _ctx) {
    Err(super::not_implemented(vm, "debug.debug"))
});

define_lib_func!(debug_getinfo, (vm, _ctx) {
    Err(super::not_implemented(vm, "debug.getinfo"))
});

define_lib_func!(debug_getlocal, (vm, _ctx) {
    Err(super::not_implemented(vm, "debug.getlocal"))
});

define_lib_func!(debug_gethook, (vm, _ctx) {
    Err(super::not_implemented(vm, "debug.gethook"))
});

define_lib_func!(debug_sethook, (vm, _ctx) {
    Err(super::not_implemented(vm, "debug.sethook"))
});
