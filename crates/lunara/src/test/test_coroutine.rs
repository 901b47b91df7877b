// Coroutine transfer: create/resume/yield/status/wrap and the
// death-propagation protocol.

use super::{assert_double, build_function, run, run_err, str_of};
use crate::lua_value::TValue;
use crate::lua_vm::bytecode::Operand;
use crate::lua_vm::Vm;

/// function(a) local x = coroutine.yield(a + 1); return x * 2 end
fn yielding_body(vm: &mut Vm) -> TValue {
    let coroutine_name = vm.create_string(b"coroutine");
    let yield_name = vm.create_string(b"yield");
    build_function(vm, 1, false, 16, move |bw| {
        let co = bw.add_constant_value(coroutine_name);
        let y = bw.add_constant_value(yield_name);
        bw.create_global_get(co, 2);
        bw.create_table_get_by_id(2, y, 2);
        bw.create_add(Operand::Slot(0), Operand::Slot(0), 6);
        bw.create_set_const_int16(1, 7);
        bw.create_add(Operand::Slot(6), Operand::Slot(7), 6);
        // yield(a + 1): call at slot 2, arg at slot 6.
        bw.create_call(2, 1, 1); // x lands in slot 2
        bw.create_add(Operand::Slot(2), Operand::Slot(2), 3);
        bw.create_ret(3, 1);
    })
}

fn lib(vm: &mut Vm, module: &str, name: &str) -> TValue {
    let m = vm.get_global(module);
    let key = vm.create_string(name.as_bytes());
    crate::lua_vm::execute::table_raw_get(vm, m.as_pointer(), key)
}

#[test]
fn test_create_resume_yield_resume() {
    let mut vm = Vm::new();
    let body = yielding_body(&mut vm);
    let create = lib(&mut vm, "coroutine", "create");
    let resume = lib(&mut vm, "coroutine", "resume");
    let status = lib(&mut vm, "coroutine", "status");

    let co = run(&mut vm, create, &[body])[0];
    assert!(co.is_thread());
    assert_eq!(str_of(run(&mut vm, status, &[co])[0]), "suspended");

    // First resume runs to the yield: (true, a + 1 + 1)... the body
    // computes a+a then +1, so resume(co, 5) yields 11.
    let r = run(&mut vm, resume, &[co, TValue::double(5.0)]);
    assert!(r[0].is_true());
    assert_double(r[1], 11.0);
    assert_eq!(str_of(run(&mut vm, status, &[co])[0]), "suspended");

    // Second resume delivers x = 10, the body returns x * 2 = x + x.
    let r = run(&mut vm, resume, &[co, TValue::double(10.0)]);
    assert!(r[0].is_true());
    assert_double(r[1], 20.0);
    assert_eq!(str_of(run(&mut vm, status, &[co])[0]), "dead");

    // Resuming a dead coroutine reports, not raises.
    let r = run(&mut vm, resume, &[co]);
    assert!(r[0].is_false());
    assert_eq!(str_of(r[1]), "cannot resume dead coroutine");
}

#[test]
fn test_resume_error_propagates_as_false() {
    let mut vm = Vm::new();
    let err_name = vm.create_string(b"error");
    let msg = vm.create_string(b"inside");
    let body = build_function(&mut vm, 0, false, 16, move |bw| {
        let e = bw.add_constant_value(err_name);
        let m = bw.add_constant_value(msg);
        bw.create_global_get(e, 0);
        bw.create_mov(Operand::Cst(m), 4);
        bw.create_call(0, 1, 0);
        bw.create_ret0();
    });
    let create = lib(&mut vm, "coroutine", "create");
    let resume = lib(&mut vm, "coroutine", "resume");
    let status = lib(&mut vm, "coroutine", "status");

    let co = run(&mut vm, create, &[body])[0];
    let r = run(&mut vm, resume, &[co]);
    assert!(r[0].is_false());
    assert_eq!(str_of(r[1]), "inside");
    assert_eq!(str_of(run(&mut vm, status, &[co])[0]), "dead");
}

#[test]
fn test_wrap_returns_values_without_prefix() {
    let mut vm = Vm::new();
    let body = yielding_body(&mut vm);
    let wrap = lib(&mut vm, "coroutine", "wrap");
    let f = run(&mut vm, wrap, &[body])[0];
    assert!(f.is_function());

    let r = run(&mut vm, f, &[TValue::double(5.0)]);
    assert_double(r[0], 11.0);
    let r = run(&mut vm, f, &[TValue::double(4.0)]);
    assert_double(r[0], 8.0);

    // A wrap error re-throws out of the wrapper.
    let msg = run_err(&mut vm, f, &[]);
    assert_eq!(msg, "cannot resume dead coroutine");
}

#[test]
fn test_wrap_error_rethrows_and_pcall_catches() {
    let mut vm = Vm::new();
    let err_name = vm.create_string(b"error");
    let msg = vm.create_string(b"wrapped-err");
    let body = build_function(&mut vm, 0, false, 16, move |bw| {
        let e = bw.add_constant_value(err_name);
        let m = bw.add_constant_value(msg);
        bw.create_global_get(e, 0);
        bw.create_mov(Operand::Cst(m), 4);
        bw.create_call(0, 1, 0);
        bw.create_ret0();
    });
    let wrap = lib(&mut vm, "coroutine", "wrap");
    let pcall = vm.get_global("pcall");
    let f = run(&mut vm, wrap, &[body])[0];
    let r = run(&mut vm, pcall, &[f]);
    assert!(r[0].is_false());
    assert_eq!(str_of(r[1]), "wrapped-err");
}

#[test]
fn test_yield_outside_coroutine_errors() {
    let mut vm = Vm::new();
    let y = lib(&mut vm, "coroutine", "yield");
    let msg = run_err(&mut vm, y, &[]);
    assert!(msg.contains("attempt to yield from outside a coroutine"), "{}", msg);
}

#[test]
fn test_running_and_status_of_root() {
    let mut vm = Vm::new();
    let running = lib(&mut vm, "coroutine", "running");
    let r = run(&mut vm, running, &[]);
    assert!(r[0].is_nil(), "the root coroutine reports nil");
}
