// Library-function registration.
//
// A library function is a Rust fn invoked by the dispatcher with the call
// frame context; it finishes by returning an action (return a value range,
// make an in-place call with a chosen continuation, throw, or transfer
// between coroutines). Each registered function gets an ExecutableCode
// whose negated-ordinal `bytecode` tag routes dispatch back here.

use crate::gc::GeneralHeapPtr;
use crate::lua_value::function_object::{ExecutableCode, FunctionObject};
use crate::lua_value::upvalue::Upvalue;
use crate::lua_value::TValue;
use crate::lua_vm::execute::{LibCallCtx, LibFnAction};
use crate::lua_vm::{Vm, VmResult};

pub type LibFn = fn(&mut Vm, LibCallCtx) -> VmResult<LibFnAction>;

pub struct LibFnRecord {
    pub name: &'static str,
    pub func: LibFn,
}

/// Declares a library function with the harness signature.
#[macro_export]
macro_rules! define_lib_func {
    ($name:ident, ($vm:ident, $ctx:ident) $body:block) => {
        pub fn $name(
            $vm: &mut $crate::lua_vm::Vm,
            $ctx: $crate::lua_vm::execute::LibCallCtx,
        ) -> $crate::lua_vm::VmResult<$crate::lua_vm::execute::LibFnAction> {
            $body
        }
    };
}

impl Vm {
    /// Registers a library function and wraps it in a FunctionObject.
    pub fn register_lib_function(&mut self, name: &'static str, func: LibFn) -> TValue {
        let ordinal = self.lib_registry.len() as u32;
        self.lib_registry.push(LibFnRecord { name, func });
        let exec = ExecutableCode::create_library_function(&mut self.layout, ordinal);
        let f = FunctionObject::create(&mut self.layout, exec, 0);
        TValue::pointer(f)
    }

    /// Registers a library closure carrying closed upvalues.
    pub fn register_lib_closure(
        &mut self,
        name: &'static str,
        func: LibFn,
        upvalues: &[TValue],
    ) -> TValue {
        let ordinal = self.lib_registry.len() as u32;
        self.lib_registry.push(LibFnRecord { name, func });
        let exec = ExecutableCode::create_library_function(&mut self.layout, ordinal);
        let f = FunctionObject::create(&mut self.layout, exec, upvalues.len() as u16);
        for (i, &v) in upvalues.iter().enumerate() {
            let cell = Upvalue::create_closed(&mut self.layout, v);
            FunctionObject::set_upvalue(f, i as u16, GeneralHeapPtr::from_user(cell));
        }
        TValue::pointer(f)
    }
}
