// os library: the clock/time/date surface backed by chrono; process and
// filesystem operations are outside the core and stubbed.

use std::time::Instant;

use chrono::{Datelike, Local, TimeZone, Timelike, Utc};

use crate::define_lib_func;
use crate::lua_value::table_object::TableObject;
use crate::lua_value::TValue;
use crate::lua_vm::execute::LibFnAction;
use crate::lua_vm::Vm;

use super::{check_number, check_table, install_module, opt_number};

static PROCESS_START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

pub fn install(vm: &mut Vm) {
    PROCESS_START.get_or_init(Instant::now);
    install_module(
        vm,
        "os",
        &[
            ("clock", os_clock),
            ("date", os_date),
            ("difftime", os_difftime),
            ("execute", os_execute),
            ("exit", os_exit),
            ("getenv", os_getenv),
            ("remove", os_remove),
            ("rename", os_rename),
            ("setlocale", os_setlocale),
            ("time", os_time),
            ("tmpname", os_tmpname),
        ],
    );
}

define_lib_func!(os_clock, (vm, ctx) {
    let _ = vm;
    let start = PROCESS_START.get_or_init(Instant::now);
    let secs = start.elapsed().as_secs_f64();
    unsafe { *ctx.slot(0) = TValue::double(secs) };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(os_time, (vm, ctx) {
    let t = if ctx.arg(0).is_table() {
        let table = check_table(vm, &ctx, 0, "time")?;
        let get = |vm: &mut Vm, name: &[u8], default: Option<i64>| -> crate::lua_vm::VmResult<i64> {
            let key = vm.interner.intern(&mut vm.layout, name);
            let v = TableObject::get_by_id(table, key);
            match v.as_number() {
                Some(d) => Ok(d as i64),
                None => default.ok_or_else(|| {
                    vm.throw_fmt(format!(
                        "field '{}' missing in date table",
                        String::from_utf8_lossy(name)
                    ))
                }),
            }
        };
        let year = get(vm, b"year", None)?;
        let month = get(vm, b"month", None)?;
        let day = get(vm, b"day", None)?;
        let hour = get(vm, b"hour", Some(12))?;
        let min = get(vm, b"min", Some(0))?;
        let sec = get(vm, b"sec", Some(0))?;
        match Local
            .with_ymd_and_hms(year as i32, month as u32, day as u32, hour as u32, min as u32, sec as u32)
            .single()
        {
            Some(dt) => dt.timestamp() as f64,
            None => return Err(vm.throw_str("time result cannot be represented")),
        }
    } else {
        Utc::now().timestamp() as f64
    };
    unsafe { *ctx.slot(0) = TValue::double(t) };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(os_difftime, (vm, ctx) {
    let t2 = check_number(vm, &ctx, 0, "difftime")?;
    let t1 = opt_number(vm, &ctx, 1, "difftime", 0.0)?;
    unsafe { *ctx.slot(0) = TValue::double(t2 - t1) };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(os_date, (vm, ctx) {
    let fmt_bytes = if ctx.arg(0).is_nil() {
        b"%c".to_vec()
    } else {
        super::check_string_bytes(vm, &ctx, 0, "date")?
    };
    let fmt = String::from_utf8_lossy(&fmt_bytes).into_owned();
    let when = if ctx.arg(1).is_nil() {
        Utc::now().timestamp()
    } else {
        check_number(vm, &ctx, 1, "date")? as i64
    };

    let (utc, fmt) = match fmt.strip_prefix('!') {
        Some(rest) => (true, rest.to_string()),
        None => (false, fmt),
    };

    if fmt.starts_with("*t") {
        // The broken-down-time table.
        let dt = match Local.timestamp_opt(when, 0).single() {
            Some(d) => d,
            None => return Err(vm.throw_str("time result cannot be represented")),
        };
        let result = vm.create_table(8, 0);
        let t = result.as_pointer::<TableObject>();
        let mut put = |vm: &mut Vm, name: &[u8], v: f64| {
            let key = vm.interner.intern(&mut vm.layout, name);
            TableObject::put_by_id(t, &mut vm.layout, key, TValue::double(v));
        };
        put(vm, b"year", dt.year() as f64);
        put(vm, b"month", dt.month() as f64);
        put(vm, b"day", dt.day() as f64);
        put(vm, b"hour", dt.hour() as f64);
        put(vm, b"min", dt.minute() as f64);
        put(vm, b"sec", dt.second() as f64);
        put(vm, b"wday", dt.weekday().number_from_sunday() as f64);
        put(vm, b"yday", dt.ordinal() as f64);
        let isdst_key = vm.interner.intern(&mut vm.layout, b"isdst");
        TableObject::put_by_id(t, &mut vm.layout, isdst_key, TValue::create_false());
        unsafe { *ctx.slot(0) = result };
        return Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 });
    }

    // strftime-style formatting (chrono shares the directive set).
    let rendered = if utc {
        match Utc.timestamp_opt(when, 0).single() {
            Some(dt) => dt.format(&fmt).to_string(),
            None => return Err(vm.throw_str("time result cannot be represented")),
        }
    } else {
        match Local.timestamp_opt(when, 0).single() {
            Some(dt) => dt.format(&fmt).to_string(),
            None => return Err(vm.throw_str("time result cannot be represented")),
        }
    };
    let s = vm.create_string(rendered.as_bytes());
    unsafe { *ctx.slot(0) = s };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(os_getenv, (vm, ctx) {
    let name = super::check_string_bytes(vm, &ctx, 0, "getenv")?;
    let value = std::str::from_utf8(&name)
        .ok()
        .and_then(|n| std::env::var(n).ok());
    unsafe {
        *ctx.slot(0) = match value {
            Some(v) => vm.create_string(v.as_bytes()),
            None => TValue::nil(),
        };
    }
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(os_exit, (vm, ctx) {
    let code = opt_number(vm, &ctx, 0, "exit", 0.0)? as i32;
    std::process::exit(code);
});

define_lib_func!(os_execute, (vm, _ctx) {
    Err(super::not_implemented(vm, "os.execute"))
});

define_lib_func!(os_remove, (vm, _ctx) {
    Err(super::not_implemented(vm, "os.remove"))
});

define_lib_func!(os_rename, (vm, _ctx) {
    Err(super::not_implemented(vm, "os.rename"))
});

define_lib_func!(os_setlocale, (vm, _ctx) {
    Err(super::not_implemented(vm, "os.setlocale"))
});

define_lib_func!(os_tmpname, (vm, _ctx) {
    Err(super::not_implemented(vm, "os.tmpname"))
});
