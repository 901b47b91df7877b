// Error propagation: exception-style unwinding without host unwinding.
//
// A raise walks the frame headers of the current coroutine looking for the
// nearest protected-call success continuation (the marker pcall/xpcall
// install on their callee). Crossing error-handler frames are counted
// against the nested-error cap. pcall long-jumps to its caller with
// (false, err); xpcall first runs its handler under the error
// continuation. With no protected frame the coroutine dies and the error
// transfers to the parent's resume point; at the root it surfaces to the
// embedder.

use crate::lua_value::TValue;

use super::{
    ExecState, Interpreter, ReturnContinuation, StepOutcome, X_LUA_MAX_NESTED_ERROR_COUNT,
};
use crate::gc::SystemHeapPtr;
use crate::lua_vm::coroutine::{CoroutineStatus, StackFrameHeader};
use crate::lua_vm::{VmError, VmResult};

pub fn unwind_on_raise(interp: &mut Interpreter, st: &mut ExecState) -> VmResult<StepOutcome> {
    unsafe {
        if st.base.is_null() {
            return Err(VmError::UncaughtError);
        }

        let mut error_object = interp.vm.error_object;
        let mut nested_error_count = 0usize;
        let mut frame_base = st.base;
        let protected_callee = loop {
            let hdr = StackFrameHeader::from_base(frame_base);
            match ReturnContinuation::from_u64(hdr.ret_cont) {
                ReturnContinuation::LibProtectedCallSuccess => break frame_base,
                ReturnContinuation::LibProtectedCallError => nested_error_count += 1,
                ReturnContinuation::RootExit => {
                    // Loop-entry boundary. A nested loop must not unwind
                    // frames it does not own; the outer loop picks up the
                    // same raise.
                    if interp.is_nested() {
                        return Err(VmError::Raised);
                    }
                    debug_assert!(st.coro == interp.vm.root_coroutine);
                    return Err(VmError::UncaughtError);
                }
                ReturnContinuation::CoroBodyExit => {
                    return coroutine_death(interp, st, error_object);
                }
                _ => {}
            }
            let caller = hdr.caller_base;
            if caller.is_null() {
                // Defensive: an entry frame always carries RootExit or
                // CoroBodyExit, so this is unreachable in a consistent
                // stack.
                return Err(VmError::UncaughtError);
            }
            frame_base = caller;
        };

        // The frame below the protected callee is the pcall/xpcall itself.
        let pcall_base = StackFrameHeader::from_base(protected_callee).caller_base;

        // Every upvalue at or above the protected frame closes now.
        st.coro.as_mut().close_upvalues(pcall_base);

        // Local 0 of the protected frame discriminates pcall from xpcall.
        let is_xpcall = (*pcall_base).is_truthy();

        if nested_error_count > X_LUA_MAX_NESTED_ERROR_COUNT {
            error_object = interp.vm.create_string_from_str("error in error handling");
            return pcall_longjump(interp, st, pcall_base, error_object);
        }

        if is_xpcall {
            let handler = *pcall_base.add(1);
            if !handler.is_function() {
                // A non-callable handler would recurse forever.
                error_object = interp.vm.create_string_from_str("error in error handling");
                return pcall_longjump(interp, st, pcall_base, error_object);
            }
            // Call the handler above the throwing frame. A library frame
            // gets extent zero: it will never resume, clobbering its
            // locals is fine.
            let frame_extent = if st.cb.is_null() {
                0
            } else {
                st.cb.as_ref().stack_frame_num_slots as usize
            };
            let cfb = st.base.add(frame_extent);
            *cfb = handler;
            *cfb.add(crate::lua_vm::X_NUM_SLOTS_FOR_STACK_FRAME_HEADER) = error_object;
            let caller_base = st.base;
            let caller_pc = st.pc;
            return interp.setup_call_frame(
                st,
                cfb,
                1,
                ReturnContinuation::LibProtectedCallError,
                caller_base,
                caller_pc,
            );
        }

        pcall_longjump(interp, st, pcall_base, error_object)
    }
}

/// pcall behavior: return (false, err) from the protected frame directly
/// to its caller.
unsafe fn pcall_longjump(
    interp: &mut Interpreter,
    st: &mut ExecState,
    pcall_base: *mut TValue,
    error_object: TValue,
) -> VmResult<StepOutcome> {
    *pcall_base = TValue::create_false();
    *pcall_base.add(1) = error_object;
    st.base = pcall_base;
    st.cb = SystemHeapPtr::null();
    interp.do_return(st, pcall_base, 2)
}

/// No protected frame in a coroutine body: the coroutine dies and the
/// error transfers to the parent's resume point.
unsafe fn coroutine_death(
    interp: &mut Interpreter,
    st: &mut ExecState,
    error_object: TValue,
) -> VmResult<StepOutcome> {
    let cur = st.coro;
    let stack_begin = cur.as_ref().stack_begin;
    cur.as_mut().close_upvalues(stack_begin);
    cur.as_mut().set_status(CoroutineStatus::Dead);

    let parent = cur.as_ref().parent;
    debug_assert!(!parent.is_null(), "a coroutine body always has a resuming parent");
    let resume_base = parent.as_ref().suspend_point_stack_base;
    let wrap_marker = StackFrameHeader::from_base(resume_base).num_variadic_arguments == 1;

    interp.vm.current_coroutine = parent;
    st.coro = parent;
    st.cb = SystemHeapPtr::null();
    st.base = resume_base;

    if wrap_marker {
        // coroutine.wrap: the error propagates out of the wrapper itself.
        // Re-raise in the parent's context (the trampoline of the
        // original design, without the extra frame).
        interp.vm.error_object = error_object;
        unwind_on_raise(interp, st)
    } else {
        // coroutine.resume reports (false, err).
        *resume_base = TValue::create_false();
        *resume_base.add(1) = error_object;
        interp.do_return(st, resume_base, 2)
    }
}

/// The LibProtectedCallError continuation: the xpcall error handler
/// returned; produce (false, firstResult) and long-jump from the
/// protected frame to its caller.
pub fn return_from_error_handler(
    interp: &mut Interpreter,
    st: &mut ExecState,
    thrower_base: *mut TValue,
    ret_start: *mut TValue,
    num_rets: usize,
) -> VmResult<StepOutcome> {
    unsafe {
        // Lua keeps only the handler's first result, nil when absent.
        let value = if num_rets == 0 { TValue::nil() } else { *ret_start };
        *thrower_base = TValue::create_false();
        *thrower_base.add(1) = value;

        // The protected frame is still on the stack: locate it again.
        let mut frame_base = thrower_base;
        let protected_callee = loop {
            let hdr = StackFrameHeader::from_base(frame_base);
            if ReturnContinuation::from_u64(hdr.ret_cont)
                == ReturnContinuation::LibProtectedCallSuccess
            {
                break frame_base;
            }
            frame_base = hdr.caller_base;
            debug_assert!(!frame_base.is_null());
        };
        let pcall_base = StackFrameHeader::from_base(protected_callee).caller_base;

        st.base = pcall_base;
        st.cb = SystemHeapPtr::null();
        interp.do_return(st, thrower_base, 2)
    }
}
