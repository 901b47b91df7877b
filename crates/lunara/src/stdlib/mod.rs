// Standard library: Lua 5.1 surface, registered onto the global object at
// VM startup. Functions interleaved with the object model (string
// hash-consing, print's fast path, next/ipairs iterators, pcall/xpcall)
// are implemented in full; surfaces the runtime does not carry (pattern
// matching, file handles, package loading) raise "not implemented".

pub mod basic;
pub mod coroutine;
pub mod debug;
pub mod io;
pub mod math;
pub mod os;
pub mod string;
pub mod table;

use crate::lua_value::heap_string::HeapString;
use crate::lua_value::table_object::TableObject;
use crate::lua_value::TValue;
use crate::lua_vm::execute::{run_nested_call, LibCallCtx};
use crate::lua_vm::numeric::try_convert_string_to_double_with_lua_semantics;
use crate::lua_vm::{Vm, VmResult};
use crate::gc::UserHeapPtr;
use crate::hidden_class::metamethod_kind::LuaMetamethodKind;

pub fn install_all(vm: &mut Vm) {
    basic::install(vm);
    math::install(vm);
    string::install(vm);
    table::install(vm);
    coroutine::install(vm);
    os::install(vm);
    io::install(vm);
    debug::install(vm);
}

// ---- shared argument helpers ----

pub(crate) fn check_number(vm: &mut Vm, ctx: &LibCallCtx, i: usize, fname: &str) -> VmResult<f64> {
    let v = ctx.arg(i);
    if let Some(d) = v.as_number() {
        return Ok(d);
    }
    if v.is_string() {
        let s = unsafe { v.as_pointer::<HeapString>().as_ref() };
        if let Some(d) = try_convert_string_to_double_with_lua_semantics(s.as_bytes()) {
            return Ok(d);
        }
    }
    let msg = format!(
        "bad argument #{} to '{}' (number expected, got {})",
        i + 1,
        fname,
        v.type_name()
    );
    Err(vm.throw_fmt(msg))
}

pub(crate) fn opt_number(
    vm: &mut Vm,
    ctx: &LibCallCtx,
    i: usize,
    fname: &str,
    default: f64,
) -> VmResult<f64> {
    if ctx.arg(i).is_nil() {
        Ok(default)
    } else {
        check_number(vm, ctx, i, fname)
    }
}

pub(crate) fn check_table(
    vm: &mut Vm,
    ctx: &LibCallCtx,
    i: usize,
    fname: &str,
) -> VmResult<UserHeapPtr<TableObject>> {
    let v = ctx.arg(i);
    if v.is_table() {
        return Ok(v.as_pointer());
    }
    let msg = format!(
        "bad argument #{} to '{}' (table expected, got {})",
        i + 1,
        fname,
        v.type_name()
    );
    Err(vm.throw_fmt(msg))
}

/// Bytes of a string argument, with the silent number-to-string cast every
/// Lua library performs.
pub(crate) fn check_string_bytes(
    vm: &mut Vm,
    ctx: &LibCallCtx,
    i: usize,
    fname: &str,
) -> VmResult<Vec<u8>> {
    let v = ctx.arg(i);
    if v.is_string() {
        let s = unsafe { v.as_pointer::<HeapString>().as_ref() };
        return Ok(s.as_bytes().to_vec());
    }
    if v.is_double() {
        return Ok(crate::lua_vm::numeric::stringify_double_to_string(v.as_double()).into_bytes());
    }
    if v.is_int32() {
        return Ok(v.as_int32().to_string().into_bytes());
    }
    let msg = format!(
        "bad argument #{} to '{}' (string expected, got {})",
        i + 1,
        fname,
        v.type_name()
    );
    Err(vm.throw_fmt(msg))
}

/// tostring semantics honoring __tostring; runs the metamethod to
/// completion in a nested loop (library-driven call).
pub(crate) fn tostring_with_metamethods(
    vm: &mut Vm,
    ctx: &LibCallCtx,
    v: TValue,
) -> VmResult<String> {
    let mm = crate::lua_vm::execute::get_metamethod_for_value(vm, v, LuaMetamethodKind::Tostring);
    if mm.is_nil() {
        return Ok(crate::lua_vm::execute::display_value(v));
    }
    let cfb = unsafe { ctx.slot(ctx.num_args + 16) };
    let results = run_nested_call(vm, cfb, mm, &[v])?;
    match results.first() {
        Some(r) if r.is_string() => {
            let s = unsafe { r.as_pointer::<HeapString>().as_ref() };
            Ok(String::from_utf8_lossy(s.as_bytes()).into_owned())
        }
        _ => Err(vm.throw_str("'__tostring' must return a string")),
    }
}

/// Error with the standard "not implemented" wording.
pub(crate) fn not_implemented(vm: &mut Vm, name: &str) -> crate::lua_vm::VmError {
    vm.throw_fmt(format!("Library function '{}' is not implemented yet!", name))
}

/// Populates a library table and publishes it as a global.
pub(crate) fn install_module(
    vm: &mut Vm,
    module_name: &str,
    fns: &[(&'static str, crate::lib_registry::LibFn)],
) -> TValue {
    let table = vm.create_table(fns.len().min(32) as u32, 0);
    for &(name, func) in fns {
        let f = vm.register_lib_function(name, func);
        let key = vm.interner.intern(&mut vm.layout, name.as_bytes());
        TableObject::put_by_id(table.as_pointer(), &mut vm.layout, key, f);
    }
    vm.set_global(module_name, table);
    table
}
