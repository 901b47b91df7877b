// Call/return ABI: argument passing, multiple returns, varargs, tail
// calls and the __call metamethod.

use super::{assert_double, build_function, run, run_err};
use crate::gc::GeneralHeapPtr;
use crate::lua_value::table_object::TableObject;
use crate::lua_value::TValue;
use crate::lua_vm::bytecode::Operand;
use crate::lua_vm::Vm;

#[test]
fn test_call_fixed_args_and_rets() {
    let mut vm = Vm::new();
    // callee(a, b) -> a - b
    let callee = build_function(&mut vm, 2, false, 4, |bw| {
        bw.create_sub(Operand::Slot(0), Operand::Slot(1), 2);
        bw.create_ret(2, 1);
    });
    // caller(f, a, b): r = f(a, b); return r
    let caller = build_function(&mut vm, 3, false, 16, |bw| {
        bw.create_mov(Operand::Slot(0), 4); // callee value
        bw.create_mov(Operand::Slot(1), 8); // args at call base + header
        bw.create_mov(Operand::Slot(2), 9);
        bw.create_call(4, 2, 1);
        bw.create_ret(4, 1);
    });
    let r = run(&mut vm, caller, &[callee, TValue::double(10.0), TValue::double(4.0)]);
    assert_double(r[0], 6.0);
}

#[test]
fn test_missing_args_fill_nil_and_extra_rets_dropped() {
    let mut vm = Vm::new();
    // callee(a, b) -> (a, b)
    let callee = build_function(&mut vm, 2, false, 4, |bw| {
        bw.create_ret(0, 2);
    });
    // caller(f, a): x, y = f(a); return y  (y must be nil)
    let caller = build_function(&mut vm, 2, false, 16, |bw| {
        bw.create_mov(Operand::Slot(0), 4);
        bw.create_mov(Operand::Slot(1), 8);
        bw.create_call(4, 1, 2);
        bw.create_ret(5, 1);
    });
    let r = run(&mut vm, caller, &[callee, TValue::double(1.0)]);
    assert!(r[0].is_nil());
}

#[test]
fn test_varargs_and_multret() {
    let mut vm = Vm::new();
    // vararg callee: return ...
    let callee = build_function(&mut vm, 0, true, 4, |bw| {
        bw.create_store_varargs_as_variadic_results();
        bw.create_ret_m(0, 0);
    });
    // caller(f, a, b, c): return f(a, b, c)  (multret forwarding)
    let caller = build_function(&mut vm, 4, true, 16, |bw| {
        bw.create_mov(Operand::Slot(0), 4);
        bw.create_mov(Operand::Slot(1), 8);
        bw.create_mov(Operand::Slot(2), 9);
        bw.create_mov(Operand::Slot(3), 10);
        bw.create_call(4, 3, -1); // results become variadic results
        bw.create_ret_m(4, 0); // forward them
    });
    let r = run(
        &mut vm,
        caller,
        &[callee, TValue::double(1.0), TValue::double(2.0), TValue::double(3.0)],
    );
    assert_eq!(r.len(), 3);
    assert_double(r[2], 3.0);
}

#[test]
fn test_get_varargs_prefix() {
    let mut vm = Vm::new();
    // function(...) local a, b = ...; return b end
    let f = build_function(&mut vm, 0, true, 8, |bw| {
        bw.create_get_varargs_prefix(0, 2);
        bw.create_ret(1, 1);
    });
    let r = run(&mut vm, f, &[TValue::double(5.0), TValue::double(6.0), TValue::double(7.0)]);
    assert_double(r[0], 6.0);
    let r = run(&mut vm, f, &[TValue::double(5.0)]);
    assert!(r[0].is_nil());
}

#[test]
fn test_tail_call() {
    let mut vm = Vm::new();
    let callee = build_function(&mut vm, 1, false, 4, |bw| {
        bw.create_add(Operand::Slot(0), Operand::Slot(0), 1);
        bw.create_ret(1, 1);
    });
    // caller(f, a): return f(a)  as a tail call
    let caller = build_function(&mut vm, 2, false, 16, |bw| {
        bw.create_mov(Operand::Slot(0), 4);
        bw.create_mov(Operand::Slot(1), 8);
        bw.create_call_t(4, 1);
    });
    let r = run(&mut vm, caller, &[callee, TValue::double(21.0)]);
    assert_double(r[0], 42.0);
}

#[test]
fn test_call_metamethod() {
    let mut vm = Vm::new();
    // mm(self, a) -> a * 2; t(...) routes through __call.
    let mm = build_function(&mut vm, 2, false, 4, |bw| {
        bw.create_add(Operand::Slot(1), Operand::Slot(1), 2);
        bw.create_ret(2, 1);
    });
    let mt = vm.create_table(2, 0);
    let call_name = vm.metamethod_name_string(crate::hidden_class::LuaMetamethodKind::Call);
    TableObject::put_by_id(mt.as_pointer(), &mut vm.layout, call_name, mm);
    let t = vm.create_table(0, 0);
    let sentinel = GeneralHeapPtr::from_user(vm.interner.special_key_for_metatable_slot());
    TableObject::set_metatable(t.as_pointer(), &mut vm.layout, sentinel, mt.as_pointer());

    let caller = build_function(&mut vm, 2, false, 16, |bw| {
        bw.create_mov(Operand::Slot(0), 4);
        bw.create_mov(Operand::Slot(1), 8);
        bw.create_call(4, 1, 1);
        bw.create_ret(4, 1);
    });
    let r = run(&mut vm, caller, &[t, TValue::double(4.0)]);
    assert_double(r[0], 8.0);
}

#[test]
fn test_call_non_callable_errors() {
    let mut vm = Vm::new();
    let caller = build_function(&mut vm, 1, false, 16, |bw| {
        bw.create_mov(Operand::Slot(0), 4);
        bw.create_call(4, 0, 0);
        bw.create_ret0();
    });
    let msg = run_err(&mut vm, caller, &[TValue::nil()]);
    assert!(msg.contains("attempt to call a nil value"), "{}", msg);
    let msg = run_err(&mut vm, caller, &[TValue::double(1.0)]);
    assert!(msg.contains("attempt to call a number value"), "{}", msg);
}
