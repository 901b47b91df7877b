// Numeric for loops, the ipairs fast path and the table-kv iteration
// specialization.

use super::{assert_double, build_function, run, run_err};
use crate::lua_value::table_object::TableObject;
use crate::lua_value::TValue;
use crate::lua_vm::bytecode::Operand;
use crate::lua_vm::Vm;

/// sum = 0; for i = a, b, c do sum = sum + i end; return sum
fn numeric_for_sum(vm: &mut Vm) -> TValue {
    build_function(vm, 3, false, 12, |bw| {
        bw.create_set_const_int16(0, 4); // sum
        let init = bw.cur_length();
        bw.create_for_loop_init(0);
        let body = bw.cur_length();
        bw.create_add(Operand::Slot(4), Operand::Slot(3), 4);
        let step = bw.cur_length();
        bw.create_for_loop_step(0);
        let exit = bw.cur_length();
        bw.create_ret(4, 1);
        assert!(bw.set_branch_target(init, exit));
        assert!(bw.set_branch_target(step, body));
    })
}

#[test]
fn test_numeric_for() {
    let mut vm = Vm::new();
    let f = numeric_for_sum(&mut vm);
    let r = run(
        &mut vm,
        f,
        &[TValue::double(1.0), TValue::double(10.0), TValue::double(1.0)],
    );
    assert_double(r[0], 55.0);

    // Downward loop.
    let r = run(
        &mut vm,
        f,
        &[TValue::double(3.0), TValue::double(1.0), TValue::double(-1.0)],
    );
    assert_double(r[0], 6.0);

    // Zero-trip loop.
    let r = run(
        &mut vm,
        f,
        &[TValue::double(5.0), TValue::double(1.0), TValue::double(1.0)],
    );
    assert_double(r[0], 0.0);

    // String coercion on the loop registers.
    let one = vm.create_string(b"1");
    let r = run(&mut vm, f, &[one, TValue::double(3.0), TValue::double(1.0)]);
    assert_double(r[0], 6.0);
}

#[test]
fn test_numeric_for_bad_initial_value() {
    let mut vm = Vm::new();
    let f = numeric_for_sum(&mut vm);
    let bad = vm.create_string(b"zzz");
    let msg = run_err(&mut vm, f, &[bad, TValue::double(3.0), TValue::double(1.0)]);
    assert!(msg.contains("'for' initial value must be a number"), "{}", msg);
}

/// sum = 0; for i, v in ipairs(t) do sum = sum + i * 0 + v end; return sum
fn ipairs_sum(vm: &mut Vm) -> TValue {
    let ipairs_name = vm.create_string(b"ipairs");
    build_function(vm, 1, false, 24, move |bw| {
        let k = bw.add_constant_value(ipairs_name);
        // Loop base 1: f, s, ctrl in slots 1..4; k, v arrive in 4, 5.
        bw.create_set_const_int16(0, 6); // sum = 0 (slot 6)
        // iter, state, ctrl = ipairs(t)
        bw.create_global_get(k, 7);
        bw.create_mov(Operand::Slot(0), 11);
        bw.create_call(7, 1, 3);
        bw.create_mov(Operand::Slot(7), 1);
        bw.create_mov(Operand::Slot(8), 2);
        bw.create_mov(Operand::Slot(9), 3);
        // The loop skeleton: jump to the iterator, body sits between.
        let entry_jump = bw.cur_length();
        bw.create_branch();
        let body = bw.cur_length();
        bw.create_add(Operand::Slot(6), Operand::Slot(5), 6); // sum += v
        let iter = bw.cur_length();
        bw.create_for_loop_iter(1, 2);
        bw.create_ret(6, 1);
        assert!(bw.set_branch_target(entry_jump, iter));
        assert!(bw.set_branch_target(iter, body));
    })
}

#[test]
fn test_ipairs_iteration_terminates_at_first_nil() {
    let mut vm = Vm::new();
    let t = vm.create_table(0, 8);
    for (i, v) in [10.0, 20.0, 30.0].iter().enumerate() {
        TableObject::raw_put_by_integer_index(
            t.as_pointer(),
            &mut vm.layout,
            i as i64 + 1,
            TValue::double(*v),
        );
    }
    // A value beyond a hole must not be visited.
    TableObject::raw_put_by_integer_index(t.as_pointer(), &mut vm.layout, 5, TValue::double(500.0));

    let f = ipairs_sum(&mut vm);
    let r = run(&mut vm, f, &[t]);
    // 10 + 20 + 30; the value at index 5 is beyond the hole and unseen.
    assert_double(r[0], 60.0);
}

/// count = 0; for k, v in pairs(t) do count = count + 1 end; return count
fn pairs_count(vm: &mut Vm) -> TValue {
    let pairs_name = vm.create_string(b"pairs");
    build_function(vm, 1, false, 24, move |bw| {
        let k = bw.add_constant_value(pairs_name);
        bw.create_set_const_int16(0, 6); // count (slot 6)
        bw.create_global_get(k, 7);
        bw.create_mov(Operand::Slot(0), 11);
        bw.create_call(7, 1, 3);
        bw.create_mov(Operand::Slot(7), 1);
        bw.create_mov(Operand::Slot(8), 2);
        bw.create_mov(Operand::Slot(9), 3);
        let is_next = bw.cur_length();
        bw.create_validate_is_next_and_branch(1);
        let body = bw.cur_length();
        bw.create_set_const_int16(1, 10);
        bw.create_add(Operand::Slot(6), Operand::Slot(10), 6);
        let iter = bw.cur_length();
        bw.create_kv_loop_iter(1, 2);
        bw.create_ret(6, 1);
        assert!(bw.set_branch_target(is_next, iter));
        assert!(bw.set_branch_target(iter, body));
    })
}

#[test]
fn test_pairs_kv_fast_path_counts_all_parts() {
    let mut vm = Vm::new();
    let t = vm.create_table(4, 4);
    for i in 1..=3 {
        TableObject::raw_put_by_integer_index(t.as_pointer(), &mut vm.layout, i, TValue::double(1.0));
    }
    let name = vm.create_string(b"name");
    TableObject::put_by_id(t.as_pointer(), &mut vm.layout, name.as_pointer(), TValue::double(2.0));
    TableObject::raw_put_by_double_index(t.as_pointer(), &mut vm.layout, 0.5, TValue::double(3.0));

    let f = pairs_count(&mut vm);
    assert_double(run(&mut vm, f, &[t])[0], 5.0);

    // Nil-valued slots are skipped.
    TableObject::put_by_id(t.as_pointer(), &mut vm.layout, name.as_pointer(), TValue::nil());
    assert_double(run(&mut vm, f, &[t])[0], 4.0);
}

#[test]
fn test_kv_loop_generic_fallback() {
    let mut vm = Vm::new();
    // A custom stateless iterator: function(s, c) if c < 3 then return
    // c + 1 end  (counts 1, 2, 3 from c = 0)
    let iter = build_function(&mut vm, 2, false, 8, |bw| {
        let lt = bw.cur_length();
        bw.create_set_const_int16(3, 2);
        // c < 3 ?
        let cmp = bw.cur_length();
        bw.create_branch_if_lt(1, 2);
        bw.create_ret0();
        let yes = bw.cur_length();
        bw.create_set_const_int16(1, 3);
        bw.create_add(Operand::Slot(1), Operand::Slot(3), 4);
        bw.create_ret(4, 1);
        let _ = lt;
        assert!(bw.set_branch_target(cmp, yes));
    });

    // for x in iter, nil, 0 do sum = sum + x end
    let sum_fn = build_function(&mut vm, 1, false, 24, |bw| {
        bw.create_set_const_int16(0, 6);
        bw.create_mov(Operand::Slot(0), 1); // iterator fn
        bw.create_mov(Operand::Slot(6), 2); // state = 0 (reuse sum slot value 0)
        bw.create_set_const_int16(0, 3); // ctrl = 0
        let entry = bw.cur_length();
        bw.create_branch();
        let body = bw.cur_length();
        bw.create_add(Operand::Slot(6), Operand::Slot(4), 6);
        let iter_pos = bw.cur_length();
        bw.create_kv_loop_iter(1, 1);
        bw.create_ret(6, 1);
        assert!(bw.set_branch_target(entry, iter_pos));
        assert!(bw.set_branch_target(iter_pos, body));
    });
    let r = run(&mut vm, sum_fn, &[iter]);
    assert_double(r[0], 6.0);
}
