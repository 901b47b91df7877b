// io library: the write/read console surface; file handles are outside
// the core.

use std::io::{BufRead, Write};

use crate::define_lib_func;
use crate::lua_value::heap_string::HeapString;
use crate::lua_value::TValue;
use crate::lua_vm::execute::LibFnAction;
use crate::lua_vm::Vm;

use super::install_module;

pub fn install(vm: &mut Vm) {
    install_module(
        vm,
        "io",
        &[
            ("close", io_close),
            ("flush", io_flush),
            ("lines", io_lines),
            ("open", io_open),
            ("read", io_read),
            ("type", io_type),
            ("write", io_write),
        ],
    );
}

define_lib_func!(io_write, (vm, ctx) {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for i in 0..ctx.num_args {
        let v = ctx.arg(i);
        if v.is_string() {
            let s = unsafe { v.as_pointer::<HeapString>().as_ref() };
            let _ = out.write_all(s.as_bytes());
        } else if v.is_double() || v.is_int32() {
            let _ = out.write_all(crate::lua_vm::execute::display_value(v).as_bytes());
        } else {
            let msg = format!(
                "bad argument #{} to 'write' (string expected, got {})",
                i + 1,
                v.type_name()
            );
            return Err(vm.throw_fmt(msg));
        }
    }
    let _ = out.flush();
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 0 })
});

define_lib_func!(io_read, (vm, ctx) {
    // Only the line formats of the default input are part of the core.
    let fmt = if ctx.arg(0).is_nil() {
        b"*l".to_vec()
    } else {
        super::check_string_bytes(vm, &ctx, 0, "read")?
    };
    match fmt.as_slice() {
        b"*l" | b"*L" | b"l" | b"L" => {
            let mut line = String::new();
            let n = std::io::stdin().lock().read_line(&mut line).unwrap_or(0);
            unsafe {
                if n == 0 {
                    *ctx.slot(0) = TValue::nil();
                } else {
                    if fmt[fmt.len() - 1] != b'L' && line.ends_with('\n') {
                        line.pop();
                        if line.ends_with('\r') {
                            line.pop();
                        }
                    }
                    *ctx.slot(0) = vm.create_string(line.as_bytes());
                }
            }
            Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
        }
        b"*n" | b"n" => {
            let mut line = String::new();
            let _ = std::io::stdin().lock().read_line(&mut line);
            let parsed = crate::lua_vm::numeric::try_convert_string_to_double_with_lua_semantics(
                line.trim().as_bytes(),
            );
            unsafe {
                *ctx.slot(0) = match parsed {
                    Some(d) => TValue::double(d),
                    None => TValue::nil(),
                };
            }
            Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
        }
        _ => Err(super::not_implemented(vm, "io.read (format)")),
    }
});

define_lib_func!(io_flush, (vm, ctx) {
    let _ = vm;
    let _ = std::io::stdout().flush();
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 0 })
});

define_lib_func!(io_close, (vm, _ctx) {
    Err(super::not_implemented(vm, "io.close"))
});

define_lib_func!(io_lines, (vm, _ctx) {
    Err(super::not_implemented(vm, "io.lines"))
});

define_lib_func!(io_open, (vm, _ctx) {
    Err(super::not_implemented(vm, "io.open"))
});

define_lib_func!(io_type, (vm, ctx) {
    let _ = vm;
    unsafe { *ctx.slot(0) = TValue::nil() };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});
