// Library surface driven end-to-end through the interpreter.

use super::{assert_double, build_function, run, run_err, str_of};
use crate::lua_value::table_object::TableObject;
use crate::lua_value::TValue;
use crate::lua_vm::Vm;

fn lib(vm: &mut Vm, module: &str, name: &str) -> TValue {
    let m = vm.get_global(module);
    assert!(m.is_table(), "library table '{}' missing", module);
    let key = vm.create_string(name.as_bytes());
    crate::lua_vm::execute::table_raw_get(vm, m.as_pointer(), key)
}

#[test]
fn test_assert_semantics() {
    let mut vm = Vm::new();
    let assert_fn = vm.get_global("assert");

    // assert(3.14, "x") returns both arguments.
    let x = vm.create_string(b"x");
    let r = run(&mut vm, assert_fn, &[TValue::double(3.14), x]);
    assert_double(r[0], 3.14);
    assert_eq!(str_of(r[1]), "x");

    // assert(false, "msg") raises "msg".
    let msg = vm.create_string(b"msg");
    assert_eq!(run_err(&mut vm, assert_fn, &[TValue::create_false(), msg]), "msg");

    // assert(nil) raises the canonical message.
    assert_eq!(run_err(&mut vm, assert_fn, &[TValue::nil()]), "assertion failed!");
}

#[test]
fn test_type_names() {
    let mut vm = Vm::new();
    let type_fn = vm.get_global("type");
    let s = vm.create_string(b"s");
    let t = vm.create_table(0, 0);
    let cases = [
        (TValue::nil(), "nil"),
        (TValue::create_true(), "boolean"),
        (TValue::double(42.0), "number"),
        (s, "string"),
        (t, "table"),
        (type_fn, "function"),
    ];
    for (v, want) in cases {
        assert_eq!(str_of(run(&mut vm, type_fn, &[v])[0]), want);
    }
}

#[test]
fn test_tostring_tonumber() {
    let mut vm = Vm::new();
    let tostring = vm.get_global("tostring");
    let tonumber = vm.get_global("tonumber");

    assert_eq!(str_of(run(&mut vm, tostring, &[TValue::double(123.0)])[0]), "123");
    assert_eq!(str_of(run(&mut vm, tostring, &[TValue::double(0.5)])[0]), "0.5");
    assert_eq!(str_of(run(&mut vm, tostring, &[TValue::nil()])[0]), "nil");
    assert_eq!(str_of(run(&mut vm, tostring, &[TValue::create_true()])[0]), "true");

    let s = vm.create_string(b"3.5");
    assert_double(run(&mut vm, tonumber, &[s])[0], 3.5);
    let hex = vm.create_string(b"ff");
    assert_double(run(&mut vm, tonumber, &[hex, TValue::double(16.0)])[0], 255.0);
    let junk = vm.create_string(b"zebra");
    assert!(run(&mut vm, tonumber, &[junk])[0].is_nil());
    assert_double(run(&mut vm, tonumber, &[TValue::double(9.0)])[0], 9.0);
}

#[test]
fn test_tostring_metamethod() {
    let mut vm = Vm::new();
    let marker = vm.create_string(b"<obj>");
    let mm = build_function(&mut vm, 1, false, 8, move |bw| {
        let m = bw.add_constant_value(marker);
        bw.create_mov(crate::lua_vm::bytecode::Operand::Cst(m), 1);
        bw.create_ret(1, 1);
    });
    let mt = vm.create_table(2, 0);
    let name = vm.metamethod_name_string(crate::hidden_class::LuaMetamethodKind::Tostring);
    TableObject::put_by_id(mt.as_pointer(), &mut vm.layout, name, mm);
    let t = vm.create_table(0, 0);
    let sentinel =
        crate::gc::GeneralHeapPtr::from_user(vm.interner.special_key_for_metatable_slot());
    TableObject::set_metatable(t.as_pointer(), &mut vm.layout, sentinel, mt.as_pointer());

    let tostring = vm.get_global("tostring");
    assert_eq!(str_of(run(&mut vm, tostring, &[t])[0]), "<obj>");
}

#[test]
fn test_select_and_unpack() {
    let mut vm = Vm::new();
    let select = vm.get_global("select");
    let hash = vm.create_string(b"#");
    let r = run(&mut vm, select, &[hash, TValue::double(1.0), TValue::double(2.0)]);
    assert_double(r[0], 2.0);
    let r = run(
        &mut vm,
        select,
        &[TValue::double(2.0), TValue::double(10.0), TValue::double(20.0), TValue::double(30.0)],
    );
    assert_eq!(r.len(), 2);
    assert_double(r[0], 20.0);

    let unpack = vm.get_global("unpack");
    let t = vm.create_table(0, 4);
    for i in 1..=3 {
        TableObject::raw_put_by_integer_index(
            t.as_pointer(),
            &mut vm.layout,
            i,
            TValue::double(i as f64),
        );
    }
    let r = run(&mut vm, unpack, &[t]);
    assert_eq!(r.len(), 3);
    assert_double(r[2], 3.0);
}

#[test]
fn test_setmetatable_getmetatable_protection() {
    let mut vm = Vm::new();
    let setmetatable = vm.get_global("setmetatable");
    let getmetatable = vm.get_global("getmetatable");

    let t = vm.create_table(0, 0);
    let mt = vm.create_table(2, 0);
    let r = run(&mut vm, setmetatable, &[t, mt]);
    assert_eq!(r[0].raw(), t.raw());
    assert_eq!(run(&mut vm, getmetatable, &[t])[0].raw(), mt.raw());

    // __metatable protection.
    let guard = vm.create_string(b"locked");
    let mm_name =
        vm.metamethod_name_string(crate::hidden_class::LuaMetamethodKind::Metatable);
    TableObject::put_by_id(mt.as_pointer(), &mut vm.layout, mm_name, guard);
    assert_eq!(str_of(run(&mut vm, getmetatable, &[t])[0]), "locked");
    let other = vm.create_table(0, 0);
    let msg = run_err(&mut vm, setmetatable, &[t, other]);
    assert!(msg.contains("cannot change a protected metatable"), "{}", msg);
}

#[test]
fn test_string_library() {
    let mut vm = Vm::new();
    let s = vm.create_string(b"Hello");

    let len = lib(&mut vm, "string", "len");
    assert_double(run(&mut vm, len, &[s])[0], 5.0);

    let upper = lib(&mut vm, "string", "upper");
    assert_eq!(str_of(run(&mut vm, upper, &[s])[0]), "HELLO");

    let sub = lib(&mut vm, "string", "sub");
    assert_eq!(
        str_of(run(&mut vm, sub, &[s, TValue::double(2.0), TValue::double(4.0)])[0]),
        "ell"
    );
    assert_eq!(str_of(run(&mut vm, sub, &[s, TValue::double(-3.0)])[0]), "llo");

    let rep = lib(&mut vm, "string", "rep");
    let ab = vm.create_string(b"ab");
    assert_eq!(str_of(run(&mut vm, rep, &[ab, TValue::double(3.0)])[0]), "ababab");

    let byte = lib(&mut vm, "string", "byte");
    assert_double(run(&mut vm, byte, &[s])[0], 'H' as u32 as f64);

    let char_fn = lib(&mut vm, "string", "char");
    assert_eq!(
        str_of(run(&mut vm, char_fn, &[TValue::double(72.0), TValue::double(105.0)])[0]),
        "Hi"
    );

    let reverse = lib(&mut vm, "string", "reverse");
    assert_eq!(str_of(run(&mut vm, reverse, &[s])[0]), "olleH");

    let format = lib(&mut vm, "string", "format");
    let fmt = vm.create_string(b"%d/%s/%.2f");
    let world = vm.create_string(b"w");
    let r = run(&mut vm, format, &[fmt, TValue::double(7.0), world, TValue::double(1.5)]);
    assert_eq!(str_of(r[0]), "7/w/1.50");

    // Pattern matching is outside the core.
    let find = lib(&mut vm, "string", "find");
    let msg = run_err(&mut vm, find, &[s, s]);
    assert!(msg.contains("not implemented"), "{}", msg);
}

#[test]
fn test_string_methods_via_metatable() {
    let mut vm = Vm::new();
    // ("x"):upper() through the shared string metatable: s.upper resolves
    // via __index on the string value.
    let x = vm.create_string(b"upper");
    let s = vm.create_string(b"abc");
    let getter = build_function(&mut vm, 1, false, 16, move |bw| {
        let k = bw.add_constant_value(x);
        bw.create_table_get_by_id(0, k, 1); // s.upper
        bw.create_mov(crate::lua_vm::bytecode::Operand::Slot(1), 2);
        bw.create_mov(crate::lua_vm::bytecode::Operand::Slot(0), 6);
        bw.create_call(2, 1, 1);
        bw.create_ret(2, 1);
    });
    assert_eq!(str_of(run(&mut vm, getter, &[s])[0]), "ABC");
}

#[test]
fn test_table_library() {
    let mut vm = Vm::new();
    let t = vm.create_table(0, 8);
    for (i, v) in [3.0, 1.0, 2.0].iter().enumerate() {
        TableObject::raw_put_by_integer_index(
            t.as_pointer(),
            &mut vm.layout,
            i as i64 + 1,
            TValue::double(*v),
        );
    }

    let insert = lib(&mut vm, "table", "insert");
    run(&mut vm, insert, &[t, TValue::double(4.0)]);
    assert_double(TableObject::get_by_integer_index(t.as_pointer(), 4), 4.0);

    let sort = lib(&mut vm, "table", "sort");
    run(&mut vm, sort, &[t]);
    for i in 1..=4 {
        assert_double(TableObject::get_by_integer_index(t.as_pointer(), i), i as f64);
    }

    // Sort with a Lua comparator (descending: less(a, b) = b < a).
    let cmp = build_function(&mut vm, 2, false, 8, |bw| {
        let f = bw.add_constant_value(TValue::create_false());
        let tr = bw.add_constant_value(TValue::create_true());
        let pos = bw.cur_length();
        bw.create_branch_if_lt(1, 0);
        bw.create_mov(crate::lua_vm::bytecode::Operand::Cst(f), 2);
        bw.create_ret(2, 1);
        let yes = bw.cur_length();
        bw.create_mov(crate::lua_vm::bytecode::Operand::Cst(tr), 2);
        bw.create_ret(2, 1);
        assert!(bw.set_branch_target(pos, yes));
    });
    run(&mut vm, sort, &[t, cmp]);
    for i in 1..=4 {
        assert_double(
            TableObject::get_by_integer_index(t.as_pointer(), i),
            (5 - i) as f64,
        );
    }

    let remove = lib(&mut vm, "table", "remove");
    let r = run(&mut vm, remove, &[t, TValue::double(1.0)]);
    assert_double(r[0], 4.0);
    assert_double(TableObject::get_by_integer_index(t.as_pointer(), 1), 3.0);

    let concat = lib(&mut vm, "table", "concat");
    let sep = vm.create_string(b"-");
    let r = run(&mut vm, concat, &[t, sep]);
    assert_eq!(str_of(r[0]), "3-2-1");
}

#[test]
fn test_math_library() {
    let mut vm = Vm::new();
    let floor = lib(&mut vm, "math", "floor");
    assert_double(run(&mut vm, floor, &[TValue::double(3.7)])[0], 3.0);
    let mx = lib(&mut vm, "math", "max");
    assert_double(
        run(&mut vm, mx, &[TValue::double(1.0), TValue::double(9.0), TValue::double(4.0)])[0],
        9.0,
    );
    let sqrt = lib(&mut vm, "math", "sqrt");
    assert_double(run(&mut vm, sqrt, &[TValue::double(16.0)])[0], 4.0);

    let random = lib(&mut vm, "math", "random");
    for _ in 0..100 {
        let r = run(&mut vm, random, &[TValue::double(10.0)])[0].as_double();
        assert!((1.0..=10.0).contains(&r));
        assert_eq!(r.fract(), 0.0);
    }

    let m = vm.get_global("math");
    let pi_key = vm.create_string(b"pi");
    let pi = crate::lua_vm::execute::table_raw_get(&mut vm, m.as_pointer(), pi_key);
    assert_double(pi, std::f64::consts::PI);
}

#[test]
fn test_rawequal_and_interning() {
    let mut vm = Vm::new();
    let rawequal = vm.get_global("rawequal");
    let a = vm.create_string(b"same");
    let b = vm.create_string(b"same");
    assert!(run(&mut vm, rawequal, &[a, b])[0].is_true());
    let t1 = vm.create_table(0, 0);
    let t2 = vm.create_table(0, 0);
    assert!(run(&mut vm, rawequal, &[t1, t2])[0].is_false());
    assert!(run(&mut vm, rawequal, &[t1, t1])[0].is_true());
}
