// Integration suite: drives the interpreter end-to-end through
// builder-constructed functions and hand-written bytecode-JSON modules.

pub mod test_calls;
pub mod test_coroutine;
pub mod test_loader;
pub mod test_loops;
pub mod test_stdlib;
pub mod test_table_access;

use crate::lua_value::function_object::FunctionObject;
use crate::lua_value::heap_string::HeapString;
use crate::lua_value::TValue;
use crate::lua_vm::bytecode::code_block::{UnlinkedCodeBlock, UnlinkedCodeBlockDesc};
use crate::lua_vm::bytecode::BytecodeBuilder;
use crate::lua_vm::execute::run_function;
use crate::lua_vm::Vm;

/// Builds a FunctionObject from raw bytecode emitted by `emit`.
pub(crate) fn build_function(
    vm: &mut Vm,
    num_fixed: u32,
    takes_vararg: bool,
    frame_slots: u32,
    emit: impl FnOnce(&mut BytecodeBuilder),
) -> TValue {
    let mut bw = BytecodeBuilder::new();
    emit(&mut bw);
    let ucb = UnlinkedCodeBlock::create(
        &mut vm.layout,
        UnlinkedCodeBlockDesc {
            built: bw.finish(),
            upvalues: vec![],
            num_fixed_arguments: num_fixed,
            has_variadic_arguments: takes_vararg,
            stack_frame_num_slots: frame_slots,
        },
        vm.global_object,
    );
    let cb = UnlinkedCodeBlock::get_code_block(ucb, &mut vm.layout, vm.global_object);
    TValue::pointer(FunctionObject::create(&mut vm.layout, cb.cast(), 0))
}

pub(crate) fn run(vm: &mut Vm, func: TValue, args: &[TValue]) -> Vec<TValue> {
    match run_function(vm, func, args) {
        Ok(values) => values,
        Err(_) => panic!("unexpected error: {}", vm.error_message()),
    }
}

pub(crate) fn run_err(vm: &mut Vm, func: TValue, args: &[TValue]) -> String {
    match run_function(vm, func, args) {
        Ok(values) => panic!("expected an error, got {:?}", values),
        Err(_) => vm.error_message(),
    }
}

pub(crate) fn str_of(v: TValue) -> String {
    assert!(v.is_string(), "{:?} is not a string", v);
    let s = unsafe { v.as_pointer::<HeapString>().as_ref() };
    String::from_utf8_lossy(s.as_bytes()).into_owned()
}

pub(crate) fn assert_double(v: TValue, expected: f64) {
    assert!(v.is_double(), "{:?} is not a number", v);
    assert_eq!(v.as_double(), expected);
}
