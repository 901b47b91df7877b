/*----------------------------------------------------------------------
  Bytecode dispatch engine.

  Design:
  1. Pointer-based: frame base, bytecode pointer and pc live in locals;
     stack slots are raw TValue loads/stores.
  2. Flat control flow: calls push a frame and re-enter the dispatch loop;
     returns dispatch on an explicit ReturnContinuation enum stored in the
     frame header. A metamethod call resumes the triggering operation
     through its continuation, never through host-language recursion.
  3. The only host recursion is library code that must run a callee to
     completion (table.sort comparators, __tostring): it re-enters the
     loop, and a yield of the entry coroutine may not cross that boundary.

  Key invariants:
  - The stack never reallocates: frame pointers and open-upvalue pointers
    stay valid for the coroutine's lifetime.
  - Returns nil-fill at least X_MIN_NIL_FILL_RETURN_VALUES slots.
  - vm.error_object is set iff a VmError::Raised is in flight.
----------------------------------------------------------------------*/

mod arith_ops;
mod compare_ops;
mod concat_ops;
mod dispatch;
mod table_ops;
mod unwind;

pub use arith_ops::pow_with_lua_semantics;
pub use table_ops::{
    get_metamethod_for_value, get_metatable_for_value,
    raw_get_by_tvalue_key as table_raw_get, raw_put_by_tvalue_key as table_raw_put,
};

use crate::gc::{SystemHeapPtr, UserHeapPtr};
use crate::hidden_class::metamethod_kind::LuaMetamethodKind;
use crate::lua_value::function_object::FunctionObject;
use crate::lua_value::heap_string::HeapString;
use crate::lua_value::table_iterator::TableObjectIterator;
use crate::lua_value::TValue;

use super::bytecode::{CodeBlock, Opcode, UnlinkedCodeBlock};
use super::coroutine::{
    CoroutineRuntimeContext, CoroutineStatus, StackFrameHeader, X_MIN_NIL_FILL_RETURN_VALUES,
    X_NUM_SLOTS_FOR_STACK_FRAME_HEADER,
};
use super::{Vm, VmError, VmResult};

pub const X_LUA_MAX_NESTED_ERROR_COUNT: usize = 50;
pub(crate) const X_INDEX_CHAIN_LIMIT: usize = 100;
const X_STACK_MARGIN_SLOTS: usize = 64;

// ============ return continuations ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReturnContinuation {
    /// Entry frame of an interpreter loop: returning from it exits the
    /// loop with the values.
    RootExit = 0,
    /// Root frame of a resumed coroutine body: finishing it transfers
    /// control back to the parent's resume point.
    CoroBodyExit,
    /// Call/CallM: store results per the call bytecode's operands.
    CallOp,
    /// Store the first result into the triggering bytecode's destination
    /// and advance (arithmetic, unary, table-get metamethods).
    StoreResultAndAdvance,
    /// Branch on the truthiness of the first result per the triggering
    /// comparison bytecode.
    CompareMM,
    /// Resume the concat right-to-left scan.
    ConcatMM,
    /// __newindex function returned: nothing to store.
    PutMM,
    /// Generic for-loop iterator call.
    IterCall,
    /// KV-loop fallback iterator call.
    KVIterCall,
    /// pcall/xpcall success path: prepend true, return from the protected
    /// frame.
    LibProtectedCallSuccess,
    /// xpcall error-handler return: build (false, result) and long-jump.
    LibProtectedCallError,
}

impl ReturnContinuation {
    #[inline(always)]
    pub fn to_u64(self) -> u64 {
        self as u64
    }

    #[inline(always)]
    pub fn from_u64(raw: u64) -> ReturnContinuation {
        debug_assert!(raw <= ReturnContinuation::LibProtectedCallError as u64);
        unsafe { std::mem::transmute(raw as u8) }
    }
}

// ============ library-function protocol ============

pub struct LibCallCtx {
    /// First argument slot; the frame header sits right below.
    pub base: *mut TValue,
    pub num_args: usize,
    /// The invoked FunctionObject (upvalue access for closures).
    pub func: UserHeapPtr<FunctionObject>,
}

impl LibCallCtx {
    #[inline(always)]
    pub fn arg(&self, i: usize) -> TValue {
        if i < self.num_args {
            unsafe { *self.base.add(i) }
        } else {
            TValue::nil()
        }
    }

    #[inline(always)]
    pub unsafe fn slot(&self, i: usize) -> *mut TValue {
        self.base.add(i)
    }
}

pub enum LibFnAction {
    /// Return `num` values starting at `start` (must be frame-reachable).
    ReturnRange { start: *mut TValue, num: usize },
    /// Invoke the callee laid out at `frame_start` (callee value in slot 0,
    /// args after the header) with the given continuation.
    MakeInPlaceCall {
        frame_start: *mut TValue,
        num_args: usize,
        continuation: ReturnContinuation,
    },
    /// Raise with the given error object.
    ThrowError(TValue),
    /// Start or continue `target`; `args_start..+num_args` are the resume
    /// arguments (located in the resuming frame). `wrap_marker` selects
    /// the wrap protocol (no boolean prefix, errors re-thrown).
    CoroResume {
        target: UserHeapPtr<CoroutineRuntimeContext>,
        args_start: *mut TValue,
        num_args: usize,
        wrap_marker: bool,
    },
    /// Suspend the current coroutine, transferring the values to the
    /// parent's resume point.
    CoroYield { values_start: *mut TValue, num_values: usize },
}

// ============ execution state ============

#[derive(Clone, Copy)]
pub struct ExecState {
    pub coro: UserHeapPtr<CoroutineRuntimeContext>,
    pub base: *mut TValue,
    /// Null while positioned in a library frame.
    pub cb: SystemHeapPtr<CodeBlock>,
    pub pc: usize,
}

pub enum StepOutcome {
    /// Stay in the current frame; pc already updated.
    Continue,
    /// A frame was pushed, replaced or returned from; reload context.
    FrameChanged,
    /// The loop's entry frame returned these values.
    Exit(Vec<TValue>),
}

/// Outcome of slow paths that may need a metamethod call.
pub enum MmCall {
    Done,
    Call {
        mm: TValue,
        args: [TValue; 3],
        num_args: usize,
        continuation: ReturnContinuation,
    },
}

// ============ operand decoding ============

#[inline(always)]
pub unsafe fn read_u8(bc: *const u8, off: usize) -> u8 {
    *bc.add(off)
}

#[inline(always)]
pub unsafe fn read_u16(bc: *const u8, off: usize) -> u16 {
    u16::from_le_bytes([*bc.add(off), *bc.add(off + 1)])
}

#[inline(always)]
pub unsafe fn read_i16(bc: *const u8, off: usize) -> i16 {
    read_u16(bc, off) as i16
}

#[inline(always)]
pub unsafe fn read_u32(bc: *const u8, off: usize) -> u32 {
    u32::from_le_bytes([
        *bc.add(off),
        *bc.add(off + 1),
        *bc.add(off + 2),
        *bc.add(off + 3),
    ])
}

/// Destination slot of a result-producing bytecode, for the
/// StoreResultAndAdvance continuation.
unsafe fn result_dst_slot(bc: *const u8, pc: usize) -> u16 {
    let op = Opcode::from_u8(*bc.add(pc));
    use Opcode::*;
    match op {
        UnaryMinus | LogicalNot | LengthOf => read_u16(bc, pc + 3),
        AddVV | AddVC | AddCV | SubVV | SubVC | SubCV | MulVV | MulVC | MulCV | DivVV | DivVC
        | DivCV | ModVV | ModVC | ModCV | PowVV | PowVC | PowCV => read_u16(bc, pc + 5),
        TableGetById | TableGetByIdIcHitInline | TableGetByIdIcHitOutlined | TableGetByImm
        | TableGetByVal => read_u16(bc, pc + 5),
        GlobalGet => read_u16(bc, pc + 3),
        Concat => read_u16(bc, pc + 5),
        _ => unreachable!("{:?} does not produce a continuation result", op),
    }
}

// ============ interpreter ============

pub struct Interpreter<'vm> {
    pub vm: &'vm mut Vm,
    /// Coroutine this loop was entered on when nested inside library code;
    /// yields of that coroutine may not cross the loop boundary.
    nested_entry: Option<UserHeapPtr<CoroutineRuntimeContext>>,
}

/// Runs `func(args...)` on the VM's current coroutine from its stack
/// bottom (root entry point).
pub fn run_function(vm: &mut Vm, func: TValue, args: &[TValue]) -> VmResult<Vec<TValue>> {
    let coro = vm.current_coroutine;
    let cfb = unsafe { coro.as_ref() }.stack_begin;
    let result = run_call_at(vm, None, cfb, func, args);
    // The run is over: anything still open against this stack region is
    // dead and must be promoted before the region is reused.
    unsafe {
        let c = vm.current_coroutine;
        let stack_begin = c.as_ref().stack_begin;
        c.as_mut().close_upvalues(stack_begin);
        c.as_mut().num_variadic_rets = 0;
    }
    result
}

/// Runs a call to completion from inside library code (nested loop).
/// `cfb` must point above every live slot of the calling frame.
pub fn run_nested_call(
    vm: &mut Vm,
    cfb: *mut TValue,
    func: TValue,
    args: &[TValue],
) -> VmResult<Vec<TValue>> {
    let nested = Some(vm.current_coroutine);
    run_call_at(vm, nested, cfb, func, args)
}

fn run_call_at(
    vm: &mut Vm,
    nested_entry: Option<UserHeapPtr<CoroutineRuntimeContext>>,
    cfb: *mut TValue,
    func: TValue,
    args: &[TValue],
) -> VmResult<Vec<TValue>> {
    let coro = vm.current_coroutine;
    unsafe {
        *cfb = func;
        for (i, &a) in args.iter().enumerate() {
            *cfb.add(X_NUM_SLOTS_FOR_STACK_FRAME_HEADER + i) = a;
        }
    }
    let is_nested = nested_entry.is_some();
    let mut interp = Interpreter { vm, nested_entry };
    let mut st = ExecState { coro, base: std::ptr::null_mut(), cb: SystemHeapPtr::null(), pc: 0 };
    let first = interp.setup_call_frame(
        &mut st,
        cfb,
        args.len(),
        ReturnContinuation::RootExit,
        std::ptr::null_mut(),
        0,
    );
    match first {
        Ok(StepOutcome::Exit(values)) => return Ok(values),
        Ok(_) => {}
        Err(VmError::Raised) if is_nested => return Err(VmError::Raised),
        Err(VmError::Raised) => {
            // Even the entry call is subject to unwinding (the callee may
            // have pushed protected frames before failing).
            match unwind::unwind_on_raise(&mut interp, &mut st)? {
                StepOutcome::Exit(values) => return Ok(values),
                _ => {}
            }
        }
        Err(e) => return Err(e),
    }
    interp.dispatch_loop(&mut st)
}

impl<'vm> Interpreter<'vm> {
    #[inline(always)]
    pub fn is_nested(&self) -> bool {
        self.nested_entry.is_some()
    }

    #[inline(always)]
    pub fn nested_entry(&self) -> Option<UserHeapPtr<CoroutineRuntimeContext>> {
        self.nested_entry
    }

    // ---- frame construction ----

    /// Lays out and enters a call frame. `cfb[0]` holds the callee; the
    /// arguments start at `cfb + 4`. A library callee runs immediately and
    /// its action is applied.
    pub fn setup_call_frame(
        &mut self,
        st: &mut ExecState,
        cfb: *mut TValue,
        mut num_args: usize,
        continuation: ReturnContinuation,
        caller_base: *mut TValue,
        caller_pc: usize,
    ) -> VmResult<StepOutcome> {
        unsafe {
            let mut callee = *cfb;
            if !callee.is_function() {
                // __call: the original callee becomes the first argument.
                let mm = get_metamethod_for_value(self.vm, callee, LuaMetamethodKind::Call);
                if !mm.is_function() {
                    let msg = format!("attempt to call a {} value", callee.type_name());
                    return Err(self.vm.throw_fmt(msg));
                }
                let args_begin = cfb.add(X_NUM_SLOTS_FOR_STACK_FRAME_HEADER);
                std::ptr::copy(args_begin, args_begin.add(1), num_args);
                *args_begin = callee;
                num_args += 1;
                *cfb = mm;
                callee = mm;
            }

            let func_ptr: UserHeapPtr<FunctionObject> = callee.as_pointer();
            let exec = FunctionObject::executable_ref(func_ptr);

            if exec.is_bytecode_function() {
                let cb: SystemHeapPtr<CodeBlock> = func_ptr.as_ref().executable.cast();
                let num_fixed = exec.num_fixed_arguments as usize;
                let mut extra = 0usize;
                if exec.has_variadic_arguments && num_args > num_fixed {
                    extra = num_args - num_fixed;
                    // Reorder to [extras][header][fixed]: the extras move
                    // below the header.
                    let args_begin = cfb.add(X_NUM_SLOTS_FOR_STACK_FRAME_HEADER);
                    let mut scratch: Vec<TValue> = Vec::with_capacity(num_args);
                    for i in 0..num_args {
                        scratch.push(*args_begin.add(i));
                    }
                    for (i, v) in scratch[num_fixed..].iter().enumerate() {
                        *cfb.add(i) = *v;
                    }
                    let new_base = cfb.add(extra + X_NUM_SLOTS_FOR_STACK_FRAME_HEADER);
                    for (i, v) in scratch[..num_fixed].iter().enumerate() {
                        *new_base.add(i) = *v;
                    }
                }

                let base = cfb.add(extra + X_NUM_SLOTS_FOR_STACK_FRAME_HEADER);
                let frame_slots = cb.as_ref().stack_frame_num_slots as usize;
                if base.add(frame_slots + X_STACK_MARGIN_SLOTS) > st.coro.as_ref().stack_end() {
                    return Err(self.vm.throw_str("stack overflow"));
                }

                // Nil-fill missing fixed args and the rest of the frame.
                let filled = (num_args - extra).min(num_fixed);
                for i in filled..frame_slots {
                    *base.add(i) = TValue::nil();
                }

                let hdr = StackFrameHeader::from_base(base);
                hdr.func = func_ptr;
                hdr.caller_base = caller_base;
                hdr.ret_cont = continuation.to_u64();
                hdr.caller_bytecode_offset = caller_pc as u32;
                hdr.num_variadic_arguments = extra as u32;

                st.base = base;
                st.cb = cb;
                st.pc = 0;
                Ok(StepOutcome::FrameChanged)
            } else {
                debug_assert!(exec.is_library_function());
                let base = cfb.add(X_NUM_SLOTS_FOR_STACK_FRAME_HEADER);
                if base.add(num_args + X_STACK_MARGIN_SLOTS) > st.coro.as_ref().stack_end() {
                    return Err(self.vm.throw_str("stack overflow"));
                }
                let hdr = StackFrameHeader::from_base(base);
                hdr.func = func_ptr;
                hdr.caller_base = caller_base;
                hdr.ret_cont = continuation.to_u64();
                hdr.caller_bytecode_offset = caller_pc as u32;
                hdr.num_variadic_arguments = 0;

                st.base = base;
                st.cb = SystemHeapPtr::null();
                st.pc = 0;

                let ordinal = exec.library_fn_ordinal() as usize;
                let lib_fn = self.vm.lib_registry[ordinal].func;
                let ctx = LibCallCtx { base, num_args, func: func_ptr };
                let action = lib_fn(self.vm, ctx)?;
                self.apply_lib_action(st, action)
            }
        }
    }

    fn apply_lib_action(&mut self, st: &mut ExecState, action: LibFnAction) -> VmResult<StepOutcome> {
        match action {
            LibFnAction::ReturnRange { start, num } => self.do_return(st, start, num),
            LibFnAction::MakeInPlaceCall { frame_start, num_args, continuation } => {
                let caller_base = st.base;
                self.setup_call_frame(st, frame_start, num_args, continuation, caller_base, 0)
            }
            LibFnAction::ThrowError(v) => Err(self.vm.throw_value(v)),
            LibFnAction::CoroResume { target, args_start, num_args, wrap_marker } => {
                self.coro_resume(st, target, args_start, num_args, wrap_marker)
            }
            LibFnAction::CoroYield { values_start, num_values } => {
                self.coro_yield(st, values_start, num_values)
            }
        }
    }

    // ---- returning ----

    /// Returns from the frame at `st.base` with the given value range,
    /// dispatching the frame's return continuation.
    pub fn do_return(
        &mut self,
        st: &mut ExecState,
        ret_start: *mut TValue,
        num_rets: usize,
    ) -> VmResult<StepOutcome> {
        unsafe {
            // Minimum-fill ABI: the first slots past the range are readable.
            for i in num_rets..X_MIN_NIL_FILL_RETURN_VALUES.max(num_rets) {
                *ret_start.add(i) = TValue::nil();
            }

            let hdr = StackFrameHeader::from_base(st.base);
            let cont = ReturnContinuation::from_u64(hdr.ret_cont);
            let caller_base = hdr.caller_base;

            match cont {
                ReturnContinuation::RootExit => {
                    let mut values = Vec::with_capacity(num_rets);
                    for i in 0..num_rets {
                        values.push(*ret_start.add(i));
                    }
                    Ok(StepOutcome::Exit(values))
                }
                ReturnContinuation::CoroBodyExit => self.coro_finish(st, ret_start, num_rets),
                ReturnContinuation::LibProtectedCallSuccess => {
                    // ret_start sits above the protected lib frame's base
                    // (its slot 0 holds the pcall discriminator), so the
                    // slot before the range is safely clobberable.
                    *ret_start.sub(1) = TValue::create_true();
                    st.base = caller_base;
                    st.cb = SystemHeapPtr::null();
                    self.do_return(st, ret_start.sub(1), num_rets + 1)
                }
                ReturnContinuation::LibProtectedCallError => {
                    unwind::return_from_error_handler(self, st, caller_base, ret_start, num_rets)
                }
                _ => {
                    // Bytecode continuation: reload the caller frame.
                    let caller_pc = hdr.caller_bytecode_offset as usize;
                    let caller_hdr = StackFrameHeader::from_base(caller_base);
                    let caller_cb: SystemHeapPtr<CodeBlock> =
                        caller_hdr.func.as_ref().executable.cast();
                    st.base = caller_base;
                    st.cb = caller_cb;
                    st.pc = caller_pc;
                    self.apply_bytecode_continuation(st, cont, ret_start, num_rets)
                }
            }
        }
    }

    unsafe fn apply_bytecode_continuation(
        &mut self,
        st: &mut ExecState,
        cont: ReturnContinuation,
        ret_start: *mut TValue,
        num_rets: usize,
    ) -> VmResult<StepOutcome> {
        let bc = st.cb.as_ref().bytecode_ptr();
        let op = Opcode::from_u8(*bc.add(st.pc));
        match cont {
            ReturnContinuation::CallOp => {
                let base_slot = read_u16(bc, st.pc + 1) as usize;
                let wanted = read_i16(bc, st.pc + 5);
                let cfb = st.base.add(base_slot);
                if wanted < 0 {
                    st.coro.as_mut().set_variadic_rets(ret_start, num_rets);
                } else {
                    let wanted = wanted as usize;
                    for i in 0..wanted {
                        *cfb.add(i) =
                            if i < num_rets { *ret_start.add(i) } else { TValue::nil() };
                    }
                }
                st.pc += op.encoded_length();
                Ok(StepOutcome::FrameChanged)
            }
            ReturnContinuation::StoreResultAndAdvance => {
                let dst = result_dst_slot(bc, st.pc) as usize;
                *st.base.add(dst) = *ret_start;
                st.pc += op.encoded_length();
                Ok(StepOutcome::FrameChanged)
            }
            ReturnContinuation::CompareMM => {
                let truthy = (*ret_start).is_truthy();
                let take = compare_ops::branch_polarity(op, truthy);
                if take {
                    let (off, _) = op.branch_operand().unwrap();
                    st.pc = (st.pc as i64 + read_i16(bc, st.pc + off) as i64) as usize;
                } else {
                    st.pc += op.encoded_length();
                }
                Ok(StepOutcome::FrameChanged)
            }
            ReturnContinuation::ConcatMM => {
                concat_ops::resume_concat_after_metamethod(self, st, *ret_start)
            }
            ReturnContinuation::PutMM => {
                st.pc += op.encoded_length();
                Ok(StepOutcome::FrameChanged)
            }
            ReturnContinuation::IterCall => {
                let base_slot = read_u16(bc, st.pc + 1) as usize;
                let wanted = (read_u16(bc, st.pc + 3) as usize).max(1);
                let base = st.base.add(base_slot);
                for i in 0..wanted {
                    *base.add(3 + i) = if i < num_rets { *ret_start.add(i) } else { TValue::nil() };
                }
                if !(*base.add(3)).is_nil() {
                    *base.add(2) = *base.add(3);
                    let (off, _) = op.branch_operand().unwrap();
                    st.pc = (st.pc as i64 + read_i16(bc, st.pc + off) as i64) as usize;
                } else {
                    st.pc += op.encoded_length();
                }
                Ok(StepOutcome::FrameChanged)
            }
            ReturnContinuation::KVIterCall => {
                let base_slot = read_u16(bc, st.pc + 1) as usize;
                let wanted = (read_u8(bc, st.pc + 3) as usize).max(1);
                let base = st.base.add(base_slot);
                for i in 0..wanted {
                    *base.add(3 + i) = if i < num_rets { *ret_start.add(i) } else { TValue::nil() };
                }
                if !(*base.add(3)).is_nil() {
                    *base.add(2) = *base.add(3);
                    let (off, _) = op.branch_operand().unwrap();
                    st.pc = (st.pc as i64 + read_i16(bc, st.pc + off) as i64) as usize;
                } else {
                    st.pc += op.encoded_length();
                }
                Ok(StepOutcome::FrameChanged)
            }
            _ => unreachable!(),
        }
    }

    /// Starts a metamethod (or other internal) call above the live extent
    /// of the current bytecode frame.
    pub fn call_from_bytecode(
        &mut self,
        st: &mut ExecState,
        mm: TValue,
        args: &[TValue],
        continuation: ReturnContinuation,
    ) -> VmResult<StepOutcome> {
        unsafe {
            let frame_slots = st.cb.as_ref().stack_frame_num_slots as usize;
            let cfb = st.base.add(frame_slots);
            *cfb = mm;
            for (i, &a) in args.iter().enumerate() {
                *cfb.add(X_NUM_SLOTS_FOR_STACK_FRAME_HEADER + i) = a;
            }
            let caller_base = st.base;
            let caller_pc = st.pc;
            self.setup_call_frame(st, cfb, args.len(), continuation, caller_base, caller_pc)
        }
    }

    pub fn apply_mm_call(&mut self, st: &mut ExecState, call: MmCall) -> VmResult<StepOutcome> {
        match call {
            MmCall::Done => Ok(StepOutcome::Continue),
            MmCall::Call { mm, args, num_args, continuation } => {
                self.call_from_bytecode(st, mm, &args[..num_args], continuation)
            }
        }
    }

    // ---- coroutine transfer ----

    /// The sole transfer primitive: switch the coroutine of record. The
    /// caller is responsible for status and suspend-point bookkeeping.
    fn coro_switch(&mut self, st: &mut ExecState, target: UserHeapPtr<CoroutineRuntimeContext>) {
        self.vm.current_coroutine = target;
        st.coro = target;
        st.cb = SystemHeapPtr::null();
    }

    fn coro_resume(
        &mut self,
        st: &mut ExecState,
        target: UserHeapPtr<CoroutineRuntimeContext>,
        args_start: *mut TValue,
        num_args: usize,
        wrap_marker: bool,
    ) -> VmResult<StepOutcome> {
        unsafe {
            let t = target.as_mut();
            match t.status() {
                CoroutineStatus::Resumable => {}
                CoroutineStatus::Dead => {
                    return self.resume_error(st, "cannot resume dead coroutine", wrap_marker);
                }
                CoroutineStatus::Active => {
                    return self.resume_error(
                        st,
                        "cannot resume non-suspended coroutine",
                        wrap_marker,
                    );
                }
            }

            // The resume frame is the parent-side suspend point; its
            // variadic-argument word doubles as the resume/wrap marker for
            // the error-propagation path.
            let resume_base = st.base;
            StackFrameHeader::from_base(resume_base).num_variadic_arguments = wrap_marker as u32;
            let cur = st.coro;
            cur.as_mut().suspend_point_stack_base = resume_base;
            t.parent = cur;
            t.set_status(CoroutineStatus::Active);

            if !t.unstarted_function.is_null() {
                // First resume: build the body's root frame on the fresh
                // stack.
                let body = t.unstarted_function;
                t.unstarted_function = UserHeapPtr::null();
                let cfb = t.stack_begin;
                *cfb = TValue::pointer(body);
                for i in 0..num_args {
                    *cfb.add(X_NUM_SLOTS_FOR_STACK_FRAME_HEADER + i) = *args_start.add(i);
                }
                self.coro_switch(st, target);
                self.setup_call_frame(
                    st,
                    cfb,
                    num_args,
                    ReturnContinuation::CoroBodyExit,
                    std::ptr::null_mut(),
                    0,
                )
            } else {
                // Deliver the arguments as the yield frame's return values.
                let yield_base = t.suspend_point_stack_base;
                for i in 0..num_args {
                    *yield_base.add(i) = *args_start.add(i);
                }
                self.coro_switch(st, target);
                st.base = yield_base;
                self.do_return(st, yield_base, num_args)
            }
        }
    }

    fn resume_error(
        &mut self,
        st: &mut ExecState,
        msg: &str,
        wrap_marker: bool,
    ) -> VmResult<StepOutcome> {
        if wrap_marker {
            return Err(self.vm.throw_str(msg));
        }
        unsafe {
            let base = st.base;
            *base = TValue::create_false();
            *base.add(1) = self.vm.create_string_from_str(msg);
            self.do_return(st, base, 2)
        }
    }

    fn coro_yield(
        &mut self,
        st: &mut ExecState,
        values_start: *mut TValue,
        num_values: usize,
    ) -> VmResult<StepOutcome> {
        unsafe {
            let cur = st.coro;
            let parent = cur.as_ref().parent;
            if parent.is_null() {
                return Err(self.vm.throw_str("attempt to yield from outside a coroutine"));
            }
            if self.nested_entry == Some(cur) {
                return Err(self
                    .vm
                    .throw_str("attempt to yield across metamethod/C-call boundary"));
            }

            // Suspend at the yield frame: the next resume returns into it.
            cur.as_mut().suspend_point_stack_base = st.base;
            cur.as_mut().set_status(CoroutineStatus::Resumable);

            let resume_base = parent.as_ref().suspend_point_stack_base;
            let wrap_marker = StackFrameHeader::from_base(resume_base).num_variadic_arguments == 1;

            let num_rets = if wrap_marker {
                for i in 0..num_values {
                    *resume_base.add(i) = *values_start.add(i);
                }
                num_values
            } else {
                *resume_base = TValue::create_true();
                for i in 0..num_values {
                    *resume_base.add(1 + i) = *values_start.add(i);
                }
                num_values + 1
            };

            self.coro_switch(st, parent);
            st.base = resume_base;
            self.do_return(st, resume_base, num_rets)
        }
    }

    /// A coroutine body returned: mark it dead and hand the values to the
    /// parent's resume point (with the `true` prefix for resume).
    fn coro_finish(
        &mut self,
        st: &mut ExecState,
        ret_start: *mut TValue,
        num_rets: usize,
    ) -> VmResult<StepOutcome> {
        unsafe {
            let cur = st.coro;
            let parent = cur.as_ref().parent;
            debug_assert!(!parent.is_null(), "loop entry frames use RootExit, not CoroBodyExit");
            cur.as_mut().set_status(CoroutineStatus::Dead);
            let stack_begin = cur.as_ref().stack_begin;
            cur.as_mut().close_upvalues(stack_begin);

            let resume_base = parent.as_ref().suspend_point_stack_base;
            let wrap_marker = StackFrameHeader::from_base(resume_base).num_variadic_arguments == 1;
            let num = if wrap_marker {
                for i in 0..num_rets {
                    *resume_base.add(i) = *ret_start.add(i);
                }
                num_rets
            } else {
                *resume_base = TValue::create_true();
                for i in 0..num_rets {
                    *resume_base.add(1 + i) = *ret_start.add(i);
                }
                num_rets + 1
            };

            self.coro_switch(st, parent);
            st.base = resume_base;
            self.do_return(st, resume_base, num)
        }
    }

    // ---- the dispatch loop proper ----

    fn dispatch_loop(&mut self, st: &mut ExecState) -> VmResult<Vec<TValue>> {
        loop {
            match self.dispatch_until_exit(st) {
                Ok(values) => return Ok(values),
                Err(VmError::Raised) => match unwind::unwind_on_raise(self, st)? {
                    StepOutcome::Exit(values) => return Ok(values),
                    _ => continue,
                },
                Err(e) => return Err(e),
            }
        }
    }

    fn dispatch_until_exit(&mut self, st: &mut ExecState) -> VmResult<Vec<TValue>> {
        loop {
            match dispatch::run_frame(self, st)? {
                StepOutcome::Exit(values) => return Ok(values),
                StepOutcome::Continue | StepOutcome::FrameChanged => continue,
            }
        }
    }
}

// ============ value display (print / error formatting) ============

/// Human-readable rendering with the default Lua formatting options.
pub fn display_value(v: TValue) -> String {
    if v.is_double() {
        return super::numeric::stringify_double_to_string(v.as_double());
    }
    if v.is_int32() {
        return v.as_int32().to_string();
    }
    if v.is_nil() {
        return "nil".to_string();
    }
    if v.is_boolean() {
        return if v.as_boolean() { "true" } else { "false" }.to_string();
    }
    match v.heap_entity_type() {
        Some(crate::gc::HeapEntityType::String) => {
            let s = unsafe { v.as_pointer::<HeapString>().as_ref() };
            String::from_utf8_lossy(s.as_bytes()).into_owned()
        }
        Some(crate::gc::HeapEntityType::Table) => {
            format!("table: 0x{:012x}", v.raw() & 0xFFFF_FFFF_FFFF)
        }
        Some(crate::gc::HeapEntityType::Function) => {
            format!("function: 0x{:012x}", v.raw() & 0xFFFF_FFFF_FFFF)
        }
        Some(crate::gc::HeapEntityType::Thread) => {
            format!("thread: 0x{:012x}", v.raw() & 0xFFFF_FFFF_FFFF)
        }
        _ => format!("userdata: 0x{:012x}", v.raw() & 0xFFFF_FFFF_FFFF),
    }
}

/// Creates a closure for NewClosure: resolves each upvalue from the parent
/// frame per the child prototype's upvalue metadata.
pub fn create_and_fill_upvalues(
    vm: &mut Vm,
    child_ucb: SystemHeapPtr<UnlinkedCodeBlock>,
    st: &ExecState,
) -> VmResult<TValue> {
    unsafe {
        let parent_hdr = StackFrameHeader::from_base(st.base);
        let parent_func = parent_hdr.func;
        let global_object = st.cb.as_ref().global_object;
        let cb = UnlinkedCodeBlock::get_code_block(child_ucb, &mut vm.layout, global_object);
        let num_upvalues = child_ucb.as_ref().num_upvalues;
        let func = FunctionObject::create(&mut vm.layout, cb.cast(), num_upvalues as u16);
        for ord in 0..num_upvalues {
            let meta = child_ucb.as_ref().upvalue_metadata(ord);
            let uv = if meta.is_parent_local {
                let slot_ptr = st.base.add(meta.slot as usize);
                if meta.is_immutable {
                    crate::gc::GeneralHeapPtr::from_user(
                        crate::lua_value::upvalue::Upvalue::create_closed(&mut vm.layout, *slot_ptr),
                    )
                } else {
                    let coro = st.coro.as_mut();
                    crate::gc::GeneralHeapPtr::from_user(
                        crate::lua_value::upvalue::Upvalue::find_or_create_open(
                            &mut vm.layout,
                            &mut coro.upvalue_list,
                            slot_ptr,
                            false,
                        ),
                    )
                }
            } else {
                FunctionObject::get_upvalue(parent_func, meta.slot as u16)
            };
            FunctionObject::set_upvalue(func, ord as u16, uv);
        }
        Ok(TValue::pointer(func))
    }
}

/// KV-loop fast-path identity test and iterator slot packing.
pub fn is_true_base_next(vm: &Vm, v: TValue) -> bool {
    v == vm.true_base_next_function
}

pub fn pack_iterator_into_slot(iter: TableObjectIterator) -> TValue {
    TValue::from_raw(iter.raw())
}

pub fn unpack_iterator_from_slot(v: TValue) -> TableObjectIterator {
    TableObjectIterator::from_raw(v.raw())
}
