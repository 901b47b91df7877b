// string library. All produced strings go through the conser. The pattern
// engine (find/match/gmatch/gsub) is outside the runtime core and raises
// "not implemented". Installing the library also creates the shared
// metatable of all string values with __index pointing here, so
// s:upper() works.

use crate::define_lib_func;
use crate::hidden_class::metamethod_kind::LuaMetamethodKind;
use crate::lua_value::table_object::TableObject;
use crate::lua_value::TValue;
use crate::lua_vm::execute::LibFnAction;
use crate::lua_vm::Vm;

use super::{check_number, check_string_bytes, install_module, opt_number, tostring_with_metamethods};

pub fn install(vm: &mut Vm) {
    let table = install_module(
        vm,
        "string",
        &[
            ("byte", string_byte),
            ("char", string_char),
            ("dump", string_dump),
            ("find", string_find),
            ("format", string_format),
            ("gmatch", string_gmatch),
            ("gsub", string_gsub),
            ("len", string_len),
            ("lower", string_lower),
            ("match", string_match),
            ("rep", string_rep),
            ("reverse", string_reverse),
            ("sub", string_sub),
            ("upper", string_upper),
        ],
    );

    // The shared string metatable: indexing a string resolves through the
    // string library.
    let mt = vm.create_table(1, 0);
    let index_key = vm
        .metamethod_name_string(LuaMetamethodKind::Index);
    TableObject::put_by_id(mt.as_pointer(), &mut vm.layout, index_key, table);
    vm.string_metatable = mt.as_pointer();
}

/// Lua string index normalization: negative counts from the end, both
/// bounds clamped (string.sub rules).
fn str_range(len: usize, i: f64, j: f64) -> (usize, usize) {
    let len = len as i64;
    let mut i = i as i64;
    let mut j = j as i64;
    if i < 0 {
        i = (len + i + 1).max(1);
    } else if i == 0 {
        i = 1;
    }
    if j < 0 {
        j = len + j + 1;
    } else if j > len {
        j = len;
    }
    if i > j {
        return (1, 0);
    }
    (i as usize, j as usize)
}

define_lib_func!(string_len, (vm, ctx) {
    let s = check_string_bytes(vm, &ctx, 0, "len")?;
    unsafe { *ctx.slot(0) = TValue::double(s.len() as f64) };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(string_sub, (vm, ctx) {
    let s = check_string_bytes(vm, &ctx, 0, "sub")?;
    let i = opt_number(vm, &ctx, 1, "sub", 1.0)?;
    let j = opt_number(vm, &ctx, 2, "sub", -1.0)?;
    let (lo, hi) = str_range(s.len(), i, j);
    let result = if lo > hi { vm.create_string(b"") } else { vm.create_string(&s[lo - 1..hi]) };
    unsafe { *ctx.slot(0) = result };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(string_upper, (vm, ctx) {
    let mut s = check_string_bytes(vm, &ctx, 0, "upper")?;
    s.make_ascii_uppercase();
    let result = vm.create_string(&s);
    unsafe { *ctx.slot(0) = result };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(string_lower, (vm, ctx) {
    let mut s = check_string_bytes(vm, &ctx, 0, "lower")?;
    s.make_ascii_lowercase();
    let result = vm.create_string(&s);
    unsafe { *ctx.slot(0) = result };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(string_rep, (vm, ctx) {
    let s = check_string_bytes(vm, &ctx, 0, "rep")?;
    let n = check_number(vm, &ctx, 1, "rep")? as i64;
    let mut out = Vec::new();
    for _ in 0..n.max(0) {
        out.extend_from_slice(&s);
    }
    let result = vm.create_string(&out);
    unsafe { *ctx.slot(0) = result };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(string_reverse, (vm, ctx) {
    let mut s = check_string_bytes(vm, &ctx, 0, "reverse")?;
    s.reverse();
    let result = vm.create_string(&s);
    unsafe { *ctx.slot(0) = result };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(string_byte, (vm, ctx) {
    let s = check_string_bytes(vm, &ctx, 0, "byte")?;
    let i = opt_number(vm, &ctx, 1, "byte", 1.0)?;
    let j = opt_number(vm, &ctx, 2, "byte", i)?;
    let (lo, hi) = str_range(s.len(), i, j);
    let mut count = 0usize;
    unsafe {
        if lo <= hi {
            for idx in lo..=hi {
                *ctx.slot(count) = TValue::double(s[idx - 1] as f64);
                count += 1;
            }
        }
    }
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: count })
});

define_lib_func!(string_char, (vm, ctx) {
    let mut out = Vec::with_capacity(ctx.num_args);
    for i in 0..ctx.num_args {
        let c = check_number(vm, &ctx, i, "char")? as i64;
        if !(0..=255).contains(&c) {
            let msg = format!("bad argument #{} to 'char' (invalid value)", i + 1);
            return Err(vm.throw_fmt(msg));
        }
        out.push(c as u8);
    }
    let result = vm.create_string(&out);
    unsafe { *ctx.slot(0) = result };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(string_format, (vm, ctx) {
    let fmt = check_string_bytes(vm, &ctx, 0, "format")?;
    let mut out: Vec<u8> = Vec::with_capacity(fmt.len());
    let mut arg_index = 1usize;
    let mut i = 0usize;
    while i < fmt.len() {
        let b = fmt[i];
        if b != b'%' {
            out.push(b);
            i += 1;
            continue;
        }
        i += 1;
        if i >= fmt.len() {
            return Err(vm.throw_str("invalid format string to 'format'"));
        }
        // Optional flags / width / precision (forwarded to the host
        // formatter for the numeric directives).
        let spec_start = i;
        while i < fmt.len() && (fmt[i].is_ascii_digit() || matches!(fmt[i], b'-' | b'+' | b' ' | b'#' | b'0' | b'.')) {
            i += 1;
        }
        if i >= fmt.len() {
            return Err(vm.throw_str("invalid format string to 'format'"));
        }
        let spec = std::str::from_utf8(&fmt[spec_start..i]).unwrap_or("").to_string();
        let directive = fmt[i];
        i += 1;
        match directive {
            b'%' => out.push(b'%'),
            b'd' | b'i' => {
                let x = check_number(vm, &ctx, arg_index, "format")? as i64;
                arg_index += 1;
                push_formatted_int(&mut out, &spec, x, 10, false, false);
            }
            b'u' => {
                let x = check_number(vm, &ctx, arg_index, "format")? as i64 as u64;
                arg_index += 1;
                out.extend_from_slice(x.to_string().as_bytes());
            }
            b'x' => {
                let x = check_number(vm, &ctx, arg_index, "format")? as i64 as u64;
                arg_index += 1;
                push_formatted_uint_radix(&mut out, &spec, x, false);
            }
            b'X' => {
                let x = check_number(vm, &ctx, arg_index, "format")? as i64 as u64;
                arg_index += 1;
                push_formatted_uint_radix(&mut out, &spec, x, true);
            }
            b'o' => {
                let x = check_number(vm, &ctx, arg_index, "format")? as i64 as u64;
                arg_index += 1;
                out.extend_from_slice(format!("{:o}", x).as_bytes());
            }
            b'c' => {
                let x = check_number(vm, &ctx, arg_index, "format")? as i64;
                arg_index += 1;
                out.push((x & 0xFF) as u8);
            }
            b'f' | b'F' | b'e' | b'E' | b'g' | b'G' => {
                let x = check_number(vm, &ctx, arg_index, "format")?;
                arg_index += 1;
                push_formatted_float(&mut out, &spec, directive, x);
            }
            b's' => {
                let v = ctx.arg(arg_index);
                arg_index += 1;
                let s = tostring_with_metamethods(vm, &ctx, v)?;
                push_formatted_str(&mut out, &spec, s.as_bytes());
            }
            b'q' => {
                let s = check_string_bytes(vm, &ctx, arg_index, "format")?;
                arg_index += 1;
                out.push(b'"');
                for &c in &s {
                    match c {
                        b'"' => out.extend_from_slice(b"\\\""),
                        b'\\' => out.extend_from_slice(b"\\\\"),
                        b'\n' => out.extend_from_slice(b"\\n"),
                        b'\r' => out.extend_from_slice(b"\\r"),
                        0 => out.extend_from_slice(b"\\0"),
                        _ => out.push(c),
                    }
                }
                out.push(b'"');
            }
            _ => {
                let msg = format!(
                    "invalid option '%{}' to 'format'",
                    directive as char
                );
                return Err(vm.throw_fmt(msg));
            }
        }
    }
    let result = vm.create_string(&out);
    unsafe { *ctx.slot(0) = result };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

fn parse_width_precision(spec: &str) -> (Option<usize>, Option<usize>, bool) {
    let zero_pad = spec.starts_with('0');
    let (w, p) = match spec.split_once('.') {
        Some((w, p)) => (w, Some(p)),
        None => (spec, None),
    };
    let width = w.trim_start_matches(['-', '+', ' ', '#', '0']).parse::<usize>().ok();
    let precision = p.and_then(|p| p.parse::<usize>().ok());
    (width, precision, zero_pad)
}

fn push_formatted_int(out: &mut Vec<u8>, spec: &str, x: i64, _radix: u32, _upper: bool, _unsigned: bool) {
    let (width, _, zero_pad) = parse_width_precision(spec);
    let s = x.to_string();
    match width {
        Some(w) if s.len() < w => {
            if zero_pad {
                let (sign, digits) = if let Some(d) = s.strip_prefix('-') {
                    ("-", d)
                } else {
                    ("", s.as_str())
                };
                out.extend_from_slice(sign.as_bytes());
                for _ in 0..w - s.len() {
                    out.push(b'0');
                }
                out.extend_from_slice(digits.as_bytes());
            } else {
                for _ in 0..w - s.len() {
                    out.push(b' ');
                }
                out.extend_from_slice(s.as_bytes());
            }
        }
        _ => out.extend_from_slice(s.as_bytes()),
    }
}

fn push_formatted_uint_radix(out: &mut Vec<u8>, spec: &str, x: u64, upper: bool) {
    let (width, _, zero_pad) = parse_width_precision(spec);
    let s = if upper { format!("{:X}", x) } else { format!("{:x}", x) };
    if let Some(w) = width {
        if s.len() < w {
            let pad = if zero_pad { b'0' } else { b' ' };
            for _ in 0..w - s.len() {
                out.push(pad);
            }
        }
    }
    out.extend_from_slice(s.as_bytes());
}

fn push_formatted_float(out: &mut Vec<u8>, spec: &str, directive: u8, x: f64) {
    let (width, precision, _) = parse_width_precision(spec);
    let p = precision.unwrap_or(6);
    let s = match directive {
        b'f' | b'F' => format!("{:.*}", p, x),
        b'e' => format!("{:.*e}", p, x),
        b'E' => format!("{:.*E}", p, x),
        _ => {
            // %g: the default Lua tostring formatting with explicit
            // precision approximated by the 14-digit default.
            crate::lua_vm::numeric::stringify_double_to_string(x)
        }
    };
    if let Some(w) = width {
        if s.len() < w {
            for _ in 0..w - s.len() {
                out.push(b' ');
            }
        }
    }
    out.extend_from_slice(s.as_bytes());
}

fn push_formatted_str(out: &mut Vec<u8>, spec: &str, s: &[u8]) {
    let (width, precision, _) = parse_width_precision(spec);
    let truncated = match precision {
        Some(p) if p < s.len() => &s[..p],
        _ => s,
    };
    let left_align = spec.starts_with('-');
    if let Some(w) = width {
        if truncated.len() < w && !left_align {
            for _ in 0..w - truncated.len() {
                out.push(b' ');
            }
        }
        out.extend_from_slice(truncated);
        if truncated.len() < w && left_align {
            for _ in 0..w - truncated.len() {
                out.push(b' ');
            }
        }
    } else {
        out.extend_from_slice(truncated);
    }
}

define_lib_func!(string_dump, (vm, _ctx) {
    Err(super::not_implemented(vm, "string.dump"))
});

define_lib_func!(string_find, (vm, _ctx) {
    Err(super::not_implemented(vm, "string.find"))
});

define_lib_func!(string_match, (vm, _ctx) {
    Err(super::not_implemented(vm, "string.match"))
});

define_lib_func!(string_gmatch, (vm, _ctx) {
    Err(super::not_implemented(vm, "string.gmatch"))
});

define_lib_func!(string_gsub, (vm, _ctx) {
    Err(super::not_implemented(vm, "string.gsub"))
});
