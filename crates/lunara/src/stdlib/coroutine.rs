// coroutine library. The dispatcher owns the transfer primitive; these
// functions do the status bookkeeping and argument plumbing. wrap hands
// out a library closure whose single upvalue is the coroutine; its calls
// resume with the wrap marker so errors re-throw instead of returning
// (false, err).

use crate::define_lib_func;
use crate::gc::UserHeapPtr;
use crate::lua_value::function_object::FunctionObject;
use crate::lua_value::TValue;
use crate::lua_vm::coroutine::{CoroutineRuntimeContext, CoroutineStatus};
use crate::lua_vm::execute::LibFnAction;
use crate::lua_vm::Vm;

use super::install_module;

pub fn install(vm: &mut Vm) {
    install_module(
        vm,
        "coroutine",
        &[
            ("create", coroutine_create),
            ("resume", coroutine_resume),
            ("running", coroutine_running),
            ("status", coroutine_status),
            ("wrap", coroutine_wrap),
            ("yield", coroutine_yield),
        ],
    );
    // Registered once; every wrapper shares the executable and carries its
    // coroutine in upvalue 0.
    vm.coroutine_wrap_invoke_function =
        vm.register_lib_function("coroutine.wrap.invoke", coroutine_wrap_invoke);
}

fn create_coroutine_for(vm: &mut Vm, body: TValue) -> crate::lua_vm::VmResult<TValue> {
    if !body.is_function() {
        return Err(vm.throw_str("bad argument #1 to 'create' (function expected)"));
    }
    let global = unsafe { vm.current_coroutine.as_ref() }.global_object;
    let ctx = CoroutineRuntimeContext::create(&mut vm.layout, global);
    unsafe {
        ctx.as_mut().unstarted_function = body.as_pointer();
    }
    Ok(TValue::pointer(ctx))
}

define_lib_func!(coroutine_create, (vm, ctx) {
    let co = create_coroutine_for(vm, ctx.arg(0))?;
    unsafe { *ctx.slot(0) = co };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(coroutine_resume, (vm, ctx) {
    let co = ctx.arg(0);
    if !co.is_thread() {
        return Err(vm.throw_str("bad argument #1 to 'resume' (coroutine expected)"));
    }
    let _ = vm;
    let target: UserHeapPtr<CoroutineRuntimeContext> = co.as_pointer();
    Ok(LibFnAction::CoroResume {
        target,
        args_start: unsafe { ctx.slot(1) },
        num_args: ctx.num_args.saturating_sub(1),
        wrap_marker: false,
    })
});

define_lib_func!(coroutine_yield, (vm, ctx) {
    let _ = vm;
    Ok(LibFnAction::CoroYield {
        values_start: ctx.base,
        num_values: ctx.num_args,
    })
});

define_lib_func!(coroutine_status, (vm, ctx) {
    let co = ctx.arg(0);
    if !co.is_thread() {
        return Err(vm.throw_str("bad argument #1 to 'status' (coroutine expected)"));
    }
    let target: UserHeapPtr<CoroutineRuntimeContext> = co.as_pointer();
    let s = if target == vm.current_coroutine {
        vm.const_strings.str_running
    } else {
        match unsafe { target.as_ref() }.status() {
            CoroutineStatus::Resumable => vm.const_strings.str_suspended,
            CoroutineStatus::Active => vm.const_strings.str_normal,
            CoroutineStatus::Dead => vm.const_strings.str_dead,
        }
    };
    unsafe { *ctx.slot(0) = s };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(coroutine_running, (vm, ctx) {
    unsafe {
        *ctx.slot(0) = if vm.current_coroutine == vm.root_coroutine {
            TValue::nil()
        } else {
            TValue::pointer(vm.current_coroutine)
        };
    }
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(coroutine_wrap, (vm, ctx) {
    let co = create_coroutine_for(vm, ctx.arg(0))?;
    let proto: UserHeapPtr<FunctionObject> =
        vm.coroutine_wrap_invoke_function.as_pointer();
    let exec = unsafe { proto.as_ref() }.executable;
    let wrapper = FunctionObject::create(&mut vm.layout, exec, 1);
    let cell = crate::lua_value::upvalue::Upvalue::create_closed(&mut vm.layout, co);
    FunctionObject::set_upvalue(wrapper, 0, crate::gc::GeneralHeapPtr::from_user(cell));
    unsafe { *ctx.slot(0) = TValue::pointer(wrapper) };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(coroutine_wrap_invoke, (vm, ctx) {
    let _ = vm;
    let cell = FunctionObject::get_upvalue(ctx.func, 0);
    let co = unsafe { cell.to_user().as_ref() }.get();
    debug_assert!(co.is_thread());
    let target: UserHeapPtr<CoroutineRuntimeContext> = co.as_pointer();
    Ok(LibFnAction::CoroResume {
        target,
        args_start: ctx.base,
        num_args: ctx.num_args,
        wrap_marker: true,
    })
});
