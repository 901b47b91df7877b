// Lua 5.1 runtime core: NaN-boxed values, a segmented heap with 32-bit
// offset pointers, hash-consed strings, hidden classes with inline-cached
// property access, and a bytecode interpreter with explicit return
// continuations.

#[cfg(test)]
mod test;

pub mod gc;
pub mod hidden_class;
pub mod lib_registry;
pub mod lua_value;
pub mod lua_vm;
pub mod stdlib;

pub use lua_value::{HeapString, TValue, TableObject};
pub use lua_vm::bytecode::loader::{parse_module_from_json, ScriptModule};
pub use lua_vm::{ModuleLoadError, Vm, VmError, VmResult};

/// Loads a bytecode-JSON module against the VM's global object.
pub fn load_module(vm: &mut Vm, json: &str) -> Result<ScriptModule, ModuleLoadError> {
    parse_module_from_json(vm, json)
}

/// Calls a function value with arguments on the root coroutine.
pub fn call_function(vm: &mut Vm, func: TValue, args: &[TValue]) -> VmResult<Vec<TValue>> {
    lua_vm::execute::run_function(vm, func, args)
}

/// One-shot convenience: fresh VM, load, run the chunk entry.
pub fn execute_module(json: &str) -> Result<Vec<TValue>, String> {
    let mut vm = Vm::new();
    let module = load_module(&mut vm, json).map_err(|e| e.to_string())?;
    call_function(&mut vm, module.entry_function, &[]).map_err(|e| match e {
        VmError::UncaughtError | VmError::Raised => {
            format!("Uncaught error: {}", vm.error_message())
        }
    })
}
