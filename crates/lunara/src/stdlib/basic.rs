// The base library. print's string/number fast path, the true `next`
// (recognized by the KV-loop bytecodes), ipairs and its iterator, and the
// pcall/xpcall pair whose frame markers drive error propagation.

use std::io::Write;

use crate::define_lib_func;
use crate::gc::UserHeapPtr;
use crate::hidden_class::metamethod_kind::LuaMetamethodKind;
use crate::lua_value::heap_string::HeapString;
use crate::lua_value::table_iterator::{table_next, TableNextResult};
use crate::lua_value::table_object::TableObject;
use crate::lua_value::TValue;
use crate::lua_vm::execute::{
    get_metamethod_for_value, get_metatable_for_value, LibFnAction, ReturnContinuation,
};
use crate::lua_vm::numeric::try_convert_string_to_double_with_lua_semantics;
use crate::lua_vm::{Vm, X_NUM_SLOTS_FOR_STACK_FRAME_HEADER};

use super::{check_number, check_table, tostring_with_metamethods};

pub fn install(vm: &mut Vm) {
    let fns: &[(&'static str, crate::lib_registry::LibFn)] = &[
        ("assert", base_assert),
        ("collectgarbage", base_collectgarbage),
        ("dofile", base_dofile),
        ("error", base_error),
        ("gcinfo", base_gcinfo),
        ("getmetatable", base_getmetatable),
        ("ipairs", base_ipairs),
        ("load", base_load),
        ("loadfile", base_loadfile),
        ("loadstring", base_loadstring),
        ("module", base_module),
        ("next", base_next),
        ("pairs", base_pairs),
        ("pcall", base_pcall),
        ("print", base_print),
        ("rawequal", base_rawequal),
        ("rawget", base_rawget),
        ("rawset", base_rawset),
        ("require", base_require),
        ("select", base_select),
        ("setmetatable", base_setmetatable),
        ("tonumber", base_tonumber),
        ("tostring", base_tostring),
        ("type", base_type),
        ("unpack", base_unpack),
        ("xpcall", base_xpcall),
    ];
    for &(name, func) in fns {
        let f = vm.register_lib_function(name, func);
        vm.set_global(name, f);
        if name == "next" {
            vm.true_base_next_function = f;
        } else if name == "error" {
            vm.base_error_function = f;
        }
    }

    // The ipairs iterator is not a global; ipairs hands it out directly.
    vm.ipairs_iterator_function =
        vm.register_lib_function("ipairs_iterator", base_ipairs_iterator);

    let g = TValue::pointer(vm.global_object);
    vm.set_global("_G", g);
    let version = vm.create_string(b"Lua 5.1");
    vm.set_global("_VERSION", version);
}

define_lib_func!(base_print, (vm, ctx) {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for i in 0..ctx.num_args {
        if i > 0 {
            let _ = out.write_all(b"\t");
        }
        let v = ctx.arg(i);
        // Fast path: strings print their bytes directly, numbers go
        // through the default formatting; only exotic values pay for the
        // __tostring lookup.
        if v.is_string() {
            let s = unsafe { v.as_pointer::<HeapString>().as_ref() };
            let _ = out.write_all(s.as_bytes());
        } else if v.is_double() || v.is_int32() || v.is_nil() || v.is_boolean() {
            let _ = out.write_all(crate::lua_vm::execute::display_value(v).as_bytes());
        } else {
            let s = tostring_with_metamethods(vm, &ctx, v)?;
            let _ = out.write_all(s.as_bytes());
        }
    }
    let _ = out.write_all(b"\n");
    let _ = out.flush();
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 0 })
});

define_lib_func!(base_type, (vm, ctx) {
    let v = ctx.arg(0);
    if ctx.num_args == 0 {
        return Err(vm.throw_str("bad argument #1 to 'type' (value expected)"));
    }
    let name = match v.type_name() {
        "nil" => vm.const_strings.str_nil,
        "boolean" => vm.const_strings.str_boolean,
        "number" => vm.const_strings.str_number,
        "string" => vm.const_strings.str_string,
        "table" => vm.const_strings.str_table,
        "function" => vm.const_strings.str_function,
        "thread" => vm.const_strings.str_thread,
        _ => vm.const_strings.str_userdata,
    };
    unsafe { *ctx.slot(0) = name };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(base_tostring, (vm, ctx) {
    let v = ctx.arg(0);
    let rendered = if v.is_string() {
        v
    } else {
        let s = tostring_with_metamethods(vm, &ctx, v)?;
        vm.create_string(s.as_bytes())
    };
    unsafe { *ctx.slot(0) = rendered };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(base_tonumber, (vm, ctx) {
    let v = ctx.arg(0);
    let base_arg = ctx.arg(1);
    let result = if base_arg.is_nil() {
        if let Some(d) = v.as_number() {
            Some(d)
        } else if v.is_string() {
            let s = unsafe { v.as_pointer::<HeapString>().as_ref() };
            try_convert_string_to_double_with_lua_semantics(s.as_bytes())
        } else {
            None
        }
    } else {
        let radix = check_number(vm, &ctx, 1, "tonumber")? as i64;
        if !(2..=36).contains(&radix) {
            return Err(vm.throw_str("bad argument #2 to 'tonumber' (base out of range)"));
        }
        if !v.is_string() {
            return Err(vm.throw_str("bad argument #1 to 'tonumber' (string expected)"));
        }
        let s = unsafe { v.as_pointer::<HeapString>().as_ref() };
        parse_in_radix(s.as_bytes(), radix as u32)
    };
    unsafe {
        *ctx.slot(0) = match result {
            Some(d) => TValue::double(d),
            None => TValue::nil(),
        };
    }
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

fn parse_in_radix(bytes: &[u8], radix: u32) -> Option<f64> {
    let s = std::str::from_utf8(bytes).ok()?.trim();
    if s.is_empty() {
        return None;
    }
    let (neg, digits) = match s.as_bytes()[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };
    if digits.is_empty() {
        return None;
    }
    let mut acc: f64 = 0.0;
    for c in digits.chars() {
        let d = c.to_digit(radix)?;
        acc = acc * radix as f64 + d as f64;
    }
    Some(if neg { -acc } else { acc })
}

define_lib_func!(base_next, (vm, ctx) {
    let table = check_table(vm, &ctx, 0, "next")?;
    let key = ctx.arg(1);
    let sentinels = vm.iteration_sentinels();
    match table_next(table, key, sentinels) {
        TableNextResult::Pair(kv) => unsafe {
            if kv.key.is_nil() {
                *ctx.slot(0) = TValue::nil();
                Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
            } else {
                *ctx.slot(0) = kv.key;
                *ctx.slot(1) = kv.value;
                Ok(LibFnAction::ReturnRange { start: ctx.base, num: 2 })
            }
        },
        TableNextResult::InvalidKey => Err(vm.throw_str("invalid key to 'next'")),
    }
});

define_lib_func!(base_pairs, (vm, ctx) {
    if !ctx.arg(0).is_table() {
        let msg = format!(
            "bad argument #1 to 'pairs' (table expected, got {})",
            ctx.arg(0).type_name()
        );
        return Err(vm.throw_fmt(msg));
    }
    unsafe {
        let t = ctx.arg(0);
        *ctx.slot(0) = vm.true_base_next_function;
        *ctx.slot(1) = t;
        *ctx.slot(2) = TValue::nil();
    }
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 3 })
});

define_lib_func!(base_ipairs, (vm, ctx) {
    if !ctx.arg(0).is_table() {
        let msg = format!(
            "bad argument #1 to 'ipairs' (table expected, got {})",
            ctx.arg(0).type_name()
        );
        return Err(vm.throw_fmt(msg));
    }
    unsafe {
        let t = ctx.arg(0);
        *ctx.slot(0) = vm.ipairs_iterator_function;
        *ctx.slot(1) = t;
        *ctx.slot(2) = TValue::double(0.0);
    }
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 3 })
});

define_lib_func!(base_ipairs_iterator, (vm, ctx) {
    let table = check_table(vm, &ctx, 0, "ipairs")?;
    let i = check_number(vm, &ctx, 1, "ipairs")? as i64 + 1;
    let v = TableObject::get_by_integer_index(table, i);
    unsafe {
        if v.is_nil() {
            // Terminates at the first nil.
            *ctx.slot(0) = TValue::nil();
            Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
        } else {
            *ctx.slot(0) = TValue::double(i as f64);
            *ctx.slot(1) = v;
            Ok(LibFnAction::ReturnRange { start: ctx.base, num: 2 })
        }
    }
});

define_lib_func!(base_select, (vm, ctx) {
    let n = ctx.arg(0);
    if n.is_string() {
        let s = unsafe { n.as_pointer::<HeapString>().as_ref() };
        if s.as_bytes() == b"#" {
            unsafe { *ctx.slot(0) = TValue::double((ctx.num_args - 1) as f64) };
            return Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 });
        }
    }
    let i = check_number(vm, &ctx, 0, "select")? as i64;
    if i < 1 {
        return Err(vm.throw_str("bad argument #1 to 'select' (index out of range)"));
    }
    let skip = i as usize;
    let count = ctx.num_args.saturating_sub(skip);
    unsafe {
        for j in 0..count {
            *ctx.slot(j) = ctx.arg(skip + j);
        }
    }
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: count })
});

define_lib_func!(base_unpack, (vm, ctx) {
    let table = check_table(vm, &ctx, 0, "unpack")?;
    let i = super::opt_number(vm, &ctx, 1, "unpack", 1.0)? as i64;
    let j = if ctx.arg(2).is_nil() {
        TableObject::table_length(table)
    } else {
        check_number(vm, &ctx, 2, "unpack")? as i64
    };
    let mut count = 0usize;
    unsafe {
        let mut idx = i;
        while idx <= j {
            *ctx.slot(count) = TableObject::get_by_integer_index(table, idx);
            count += 1;
            idx += 1;
        }
    }
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: count })
});

define_lib_func!(base_rawget, (vm, ctx) {
    let table = check_table(vm, &ctx, 0, "rawget")?;
    let key = ctx.arg(1);
    let v = crate::lua_vm::execute::table_raw_get(vm, table, key);
    unsafe { *ctx.slot(0) = v };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(base_rawset, (vm, ctx) {
    let table = check_table(vm, &ctx, 0, "rawset")?;
    let key = ctx.arg(1);
    let value = ctx.arg(2);
    crate::lua_vm::execute::table_raw_put(vm, table, key, value)?;
    unsafe { *ctx.slot(0) = ctx.arg(0) };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(base_rawequal, (vm, ctx) {
    let a = ctx.arg(0);
    let b = ctx.arg(1);
    let eq = if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        x == y
    } else {
        a.raw() == b.raw()
    };
    let _ = vm;
    unsafe { *ctx.slot(0) = TValue::boolean(eq) };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(base_assert, (vm, ctx) {
    if ctx.num_args == 0 || !ctx.arg(0).is_truthy() {
        if ctx.num_args >= 2 {
            return Err(vm.throw_value(ctx.arg(1)));
        }
        return Err(vm.throw_str("assertion failed!"));
    }
    // Returns all arguments on success.
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: ctx.num_args })
});

// The 'level' argument is accepted and ignored: no stack-position
// annotation is prepended.
define_lib_func!(base_error, (vm, ctx) {
    let _ = vm;
    Ok(LibFnAction::ThrowError(ctx.arg(0)))
});

define_lib_func!(base_setmetatable, (vm, ctx) {
    let table = check_table(vm, &ctx, 0, "setmetatable")?;
    let mt = ctx.arg(1);
    if !mt.is_nil() && !mt.is_table() {
        return Err(vm.throw_str("bad argument #2 to 'setmetatable' (nil or table expected)"));
    }
    let existing = TableObject::get_metatable(table);
    if !existing.is_null() {
        let protection = get_metamethod_for_value(
            vm,
            ctx.arg(0),
            LuaMetamethodKind::Metatable,
        );
        if !protection.is_nil() {
            return Err(vm.throw_str("cannot change a protected metatable"));
        }
    }
    let sentinel = crate::gc::GeneralHeapPtr::from_user(
        vm.interner.special_key_for_metatable_slot(),
    );
    let new_mt: UserHeapPtr<TableObject> =
        if mt.is_nil() { UserHeapPtr::null() } else { mt.as_pointer() };
    TableObject::set_metatable(table, &mut vm.layout, sentinel, new_mt);
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(base_getmetatable, (vm, ctx) {
    let v = ctx.arg(0);
    let mt = get_metatable_for_value(vm, v);
    unsafe {
        if mt.is_null() {
            *ctx.slot(0) = TValue::nil();
        } else {
            let protection = get_metamethod_for_value(vm, v, LuaMetamethodKind::Metatable);
            *ctx.slot(0) = if protection.is_nil() { TValue::pointer(mt) } else { protection };
        }
    }
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

// ---- protected calls ----
//
// pcall/xpcall reserve local slot 0 for the discriminator boolean the
// stack walker reads (false = pcall, true = xpcall); xpcall's handler
// conveniently already sits in slot 1.

define_lib_func!(base_pcall, (vm, ctx) {
    if ctx.num_args == 0 {
        // Not protected by this pcall itself.
        return Err(vm.throw_str("bad argument #1 to 'pcall' (value expected)"));
    }
    unsafe {
        let callee = ctx.arg(0);
        let mut num_callee_args = ctx.num_args - 1;
        let cfb = ctx.slot(1);
        if callee.is_function() {
            std::ptr::copy(
                ctx.slot(1),
                cfb.add(X_NUM_SLOTS_FOR_STACK_FRAME_HEADER),
                num_callee_args,
            );
            *cfb = callee;
        } else {
            let target = get_metamethod_for_value(vm, callee, LuaMetamethodKind::Call);
            if !target.is_function() {
                let msg = format!("attempt to call a {} value", callee.type_name());
                *ctx.slot(0) = TValue::create_false();
                *ctx.slot(1) = vm.create_string(msg.as_bytes());
                return Ok(LibFnAction::ReturnRange { start: ctx.base, num: 2 });
            }
            std::ptr::copy(
                ctx.slot(1),
                cfb.add(X_NUM_SLOTS_FOR_STACK_FRAME_HEADER + 1),
                num_callee_args,
            );
            *cfb.add(X_NUM_SLOTS_FOR_STACK_FRAME_HEADER) = callee;
            *cfb = target;
            num_callee_args += 1;
        }
        // The discriminator is written after the argument shuffle.
        *ctx.slot(0) = TValue::create_false();
        Ok(LibFnAction::MakeInPlaceCall {
            frame_start: cfb,
            num_args: num_callee_args,
            continuation: ReturnContinuation::LibProtectedCallSuccess,
        })
    }
});

define_lib_func!(base_xpcall, (vm, ctx) {
    if ctx.num_args < 2 {
        // Lua always complains about argument #2, unprotected.
        return Err(vm.throw_str("bad argument #2 to 'xpcall' (value expected)"));
    }
    unsafe {
        let callee = ctx.arg(0);
        let handler = ctx.arg(1);
        *ctx.slot(0) = TValue::create_true();

        let cfb = ctx.slot(2);
        if callee.is_function() {
            *cfb = callee;
            return Ok(LibFnAction::MakeInPlaceCall {
                frame_start: cfb,
                num_args: 0,
                continuation: ReturnContinuation::LibProtectedCallSuccess,
            });
        }
        let target = get_metamethod_for_value(vm, callee, LuaMetamethodKind::Call);
        if target.is_function() {
            *cfb = target;
            *cfb.add(X_NUM_SLOTS_FOR_STACK_FRAME_HEADER) = callee;
            return Ok(LibFnAction::MakeInPlaceCall {
                frame_start: cfb,
                num_args: 1,
                continuation: ReturnContinuation::LibProtectedCallSuccess,
            });
        }
        if handler.is_function() {
            // The callee is not callable. The error must be *thrown* so
            // the handler runs under the protected frame: route it
            // through base.error, which throws on our behalf.
            let msg = format!("attempt to call a {} value", callee.type_name());
            let err_obj = vm.create_string(msg.as_bytes());
            *cfb = vm.base_error_function;
            *cfb.add(X_NUM_SLOTS_FOR_STACK_FRAME_HEADER) = err_obj;
            return Ok(LibFnAction::MakeInPlaceCall {
                frame_start: cfb,
                num_args: 1,
                continuation: ReturnContinuation::LibProtectedCallSuccess,
            });
        }
        // Non-callable handler: calling it would recurse forever.
        *ctx.slot(0) = TValue::create_false();
        *ctx.slot(1) = vm.create_string(b"error in error handling");
        Ok(LibFnAction::ReturnRange { start: ctx.base, num: 2 })
    }
});

// ---- stubs ----

define_lib_func!(base_collectgarbage, (vm, ctx) {
    let _ = vm;
    unsafe { *ctx.slot(0) = TValue::double(0.0) };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(base_gcinfo, (vm, ctx) {
    let _ = vm;
    unsafe { *ctx.slot(0) = TValue::double(0.0) };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(base_load, (vm, _ctx) {
    Err(super::not_implemented(vm, "load"))
});

define_lib_func!(base_loadstring, (vm, _ctx) {
    Err(super::not_implemented(vm, "loadstring"))
});

define_lib_func!(base_loadfile, (vm, _ctx) {
    Err(super::not_implemented(vm, "loadfile"))
});

define_lib_func!(base_dofile, (vm, _ctx) {
    Err(super::not_implemented(vm, "dofile"))
});

define_lib_func!(base_require, (vm, _ctx) {
    Err(super::not_implemented(vm, "require"))
});

define_lib_func!(base_module, (vm, _ctx) {
    Err(super::not_implemented(vm, "module"))
});
