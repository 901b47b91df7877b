// table library. sort runs user comparators to completion through the
// nested dispatch loop; everything else works directly on the array part
// through the raw access family.

use crate::define_lib_func;
use crate::lua_value::heap_string::HeapString;
use crate::lua_value::table_object::TableObject;
use crate::lua_value::TValue;
use crate::lua_vm::execute::{run_nested_call, LibFnAction};
use crate::lua_vm::Vm;

use super::{check_number, check_string_bytes, check_table, install_module, opt_number};

pub fn install(vm: &mut Vm) {
    install_module(
        vm,
        "table",
        &[
            ("concat", table_concat),
            ("insert", table_insert),
            ("maxn", table_maxn),
            ("remove", table_remove),
            ("sort", table_sort),
        ],
    );
}

define_lib_func!(table_insert, (vm, ctx) {
    let table = check_table(vm, &ctx, 0, "insert")?;
    let len = TableObject::table_length(table);
    match ctx.num_args {
        2 => {
            TableObject::raw_put_by_integer_index(table, &mut vm.layout, len + 1, ctx.arg(1));
        }
        3 => {
            let pos = check_number(vm, &ctx, 1, "insert")? as i64;
            if pos < 1 || pos > len + 1 {
                return Err(vm.throw_str("bad argument #2 to 'insert' (position out of bounds)"));
            }
            // Shift the tail up one slot.
            let mut i = len;
            while i >= pos {
                let v = TableObject::get_by_integer_index(table, i);
                TableObject::raw_put_by_integer_index(table, &mut vm.layout, i + 1, v);
                i -= 1;
            }
            TableObject::raw_put_by_integer_index(table, &mut vm.layout, pos, ctx.arg(2));
        }
        _ => {
            return Err(vm.throw_str("wrong number of arguments to 'insert'"));
        }
    }
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 0 })
});

define_lib_func!(table_remove, (vm, ctx) {
    let table = check_table(vm, &ctx, 0, "remove")?;
    let len = TableObject::table_length(table);
    let pos = if ctx.num_args >= 2 {
        check_number(vm, &ctx, 1, "remove")? as i64
    } else {
        len
    };
    if len == 0 {
        unsafe { *ctx.slot(0) = TValue::nil() };
        return Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 });
    }
    if pos < 1 || pos > len {
        return Err(vm.throw_str("bad argument #2 to 'remove' (position out of bounds)"));
    }
    let removed = TableObject::get_by_integer_index(table, pos);
    let mut i = pos;
    while i < len {
        let v = TableObject::get_by_integer_index(table, i + 1);
        TableObject::raw_put_by_integer_index(table, &mut vm.layout, i, v);
        i += 1;
    }
    TableObject::raw_put_by_integer_index(table, &mut vm.layout, len, TValue::nil());
    unsafe { *ctx.slot(0) = removed };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(table_concat, (vm, ctx) {
    let table = check_table(vm, &ctx, 0, "concat")?;
    let sep = if ctx.arg(1).is_nil() {
        Vec::new()
    } else {
        check_string_bytes(vm, &ctx, 1, "concat")?
    };
    let i = opt_number(vm, &ctx, 2, "concat", 1.0)? as i64;
    let j = if ctx.arg(3).is_nil() {
        TableObject::table_length(table)
    } else {
        check_number(vm, &ctx, 3, "concat")? as i64
    };
    let mut out: Vec<u8> = Vec::new();
    let mut idx = i;
    while idx <= j {
        let v = TableObject::get_by_integer_index(table, idx);
        if v.is_string() {
            out.extend_from_slice(unsafe { v.as_pointer::<HeapString>().as_ref() }.as_bytes());
        } else if v.is_double() {
            out.extend_from_slice(
                crate::lua_vm::numeric::stringify_double_to_string(v.as_double()).as_bytes(),
            );
        } else if v.is_int32() {
            out.extend_from_slice(v.as_int32().to_string().as_bytes());
        } else {
            let msg = format!(
                "invalid value (at index {}) in table for 'concat'",
                idx
            );
            return Err(vm.throw_fmt(msg));
        }
        if idx != j {
            out.extend_from_slice(&sep);
        }
        idx += 1;
    }
    let result = vm.create_string(&out);
    unsafe { *ctx.slot(0) = result };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(table_maxn, (vm, ctx) {
    let table = check_table(vm, &ctx, 0, "maxn")?;
    let sentinels = vm.iteration_sentinels();
    let mut iter = crate::lua_value::table_iterator::TableObjectIterator::new();
    let mut maxn = 0.0f64;
    loop {
        let kv = iter.advance(table, sentinels);
        if kv.key.is_nil() {
            break;
        }
        if let Some(k) = kv.key.as_number() {
            if k > maxn {
                maxn = k;
            }
        }
    }
    unsafe { *ctx.slot(0) = TValue::double(maxn) };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(table_sort, (vm, ctx) {
    let table = check_table(vm, &ctx, 0, "sort")?;
    let comparator = ctx.arg(1);
    let len = TableObject::table_length(table);

    let mut values: Vec<TValue> = Vec::with_capacity(len as usize);
    for i in 1..=len {
        values.push(TableObject::get_by_integer_index(table, i));
    }

    // Binary insertion sort: a bounded, allocation-free ordering that
    // tolerates comparator errors mid-way (the table stays a permutation).
    let call_base = unsafe { ctx.slot(ctx.num_args + 16) };
    let mut less_than = |vm: &mut Vm, a: TValue, b: TValue| -> crate::lua_vm::VmResult<bool> {
        if comparator.is_nil() {
            default_less_than(vm, a, b)
        } else {
            let results = run_nested_call(vm, call_base, comparator, &[a, b])?;
            Ok(results.first().map(|v| v.is_truthy()).unwrap_or(false))
        }
    };

    for i in 1..values.len() {
        let v = values[i];
        let mut lo = 0usize;
        let mut hi = i;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if less_than(vm, v, values[mid])? {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        if lo < i {
            let moved = values.remove(i);
            values.insert(lo, moved);
        }
    }

    for (i, v) in values.iter().enumerate() {
        TableObject::raw_put_by_integer_index(table, &mut vm.layout, i as i64 + 1, *v);
    }
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 0 })
});

fn default_less_than(vm: &mut Vm, a: TValue, b: TValue) -> crate::lua_vm::VmResult<bool> {
    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        return Ok(x < y);
    }
    if a.is_string() && b.is_string() {
        let x = unsafe { a.as_pointer::<HeapString>().as_ref() };
        let y = unsafe { b.as_pointer::<HeapString>().as_ref() };
        return Ok(x.compare(y) == std::cmp::Ordering::Less);
    }
    let msg = format!(
        "attempt to compare {} with {}",
        a.type_name(),
        b.type_name()
    );
    Err(vm.throw_fmt(msg))
}
