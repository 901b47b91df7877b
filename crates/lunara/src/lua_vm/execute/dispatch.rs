// The opcode dispatch loop: executes bytecodes of the current frame until
// control leaves it (call, return, coroutine switch, loop exit).

use crate::lua_value::heap_string::HeapString;
use crate::lua_value::table_iterator::TableObjectIterator;
use crate::lua_value::table_object::TableObject;
use crate::lua_value::TValue;

use super::arith_ops::{self, ArithOp, ArithSlowResult};
use super::compare_ops::{self, CompareOutcome};
use super::concat_ops;
use super::table_ops;
use super::{
    read_i16, read_u16, read_u32, read_u8, ExecState, Interpreter, ReturnContinuation,
    StepOutcome,
};
use crate::gc::{SystemHeapPtr, UserHeapPtr};
use crate::lua_vm::bytecode::{CodeBlock, Opcode, UnlinkedCodeBlock};
use crate::lua_vm::coroutine::StackFrameHeader;
use crate::lua_vm::inline_cache::{
    GetByIdIcSite, PutByIdIcSite, IC_EFFECT_INLINE, IC_EFFECT_OUTLINED,
};
use crate::lua_vm::numeric::try_convert_string_to_double_with_lua_semantics;
use crate::lua_vm::{VmResult, X_NUM_SLOTS_FOR_STACK_FRAME_HEADER};

pub fn run_frame(interp: &mut Interpreter, st: &mut ExecState) -> VmResult<StepOutcome> {
    debug_assert!(!st.cb.is_null(), "run_frame requires a bytecode frame");
    unsafe {
        let cb = st.cb.as_ref();
        let bc = cb.bytecode_ptr() as *const u8;
        let base = st.base;

        macro_rules! slot {
            ($i:expr) => {
                *base.add($i as usize)
            };
        }
        macro_rules! cst {
            ($ord:expr) => {
                TValue::from_raw(cb.constant($ord))
            };
        }
        macro_rules! take_branch {
            ($op:expr, $pc:expr) => {{
                let (off, _) = $op.branch_operand().unwrap();
                st.pc = ($pc as i64 + read_i16(bc, $pc + off) as i64) as usize;
            }};
        }

        loop {
            let pc = st.pc;
            let op = Opcode::from_u8(*bc.add(pc));
            match op {
                Opcode::Nop => {
                    st.pc = pc + 1;
                }
                Opcode::Mov => {
                    let src = read_u16(bc, pc + 1);
                    let dst = read_u16(bc, pc + 3);
                    slot!(dst) = slot!(src);
                    st.pc = pc + 5;
                }
                Opcode::LoadConstant => {
                    let ord = read_u16(bc, pc + 1);
                    let dst = read_u16(bc, pc + 3);
                    slot!(dst) = cst!(ord);
                    st.pc = pc + 5;
                }
                Opcode::SetConstInt16 => {
                    let imm = read_i16(bc, pc + 1);
                    let dst = read_u16(bc, pc + 3);
                    slot!(dst) = TValue::double(imm as f64);
                    st.pc = pc + 5;
                }
                Opcode::RangeFillNils => {
                    let fill_base = read_u16(bc, pc + 1) as usize;
                    let num = read_u16(bc, pc + 3) as usize;
                    for i in 0..num {
                        *base.add(fill_base + i) = TValue::nil();
                    }
                    st.pc = pc + 5;
                }

                // ---- arithmetic ----
                Opcode::AddVV | Opcode::AddVC | Opcode::AddCV | Opcode::SubVV | Opcode::SubVC
                | Opcode::SubCV | Opcode::MulVV | Opcode::MulVC | Opcode::MulCV
                | Opcode::DivVV | Opcode::DivVC | Opcode::DivCV | Opcode::ModVV
                | Opcode::ModVC | Opcode::ModCV | Opcode::PowVV | Opcode::PowVC
                | Opcode::PowCV => {
                    let (arith, lhs, rhs) = decode_arith(bc, pc, base, cb);
                    let dst = read_u16(bc, pc + 5);
                    if lhs.is_double() && rhs.is_double() {
                        slot!(dst) = TValue::double(arith_ops::do_arith(
                            arith,
                            lhs.as_double(),
                            rhs.as_double(),
                        ));
                        st.pc = pc + 7;
                    } else {
                        match arith_ops::arith_slow_path(interp.vm, arith, lhs, rhs)? {
                            ArithSlowResult::Value(d) => {
                                slot!(dst) = TValue::double(d);
                                st.pc = pc + 7;
                            }
                            ArithSlowResult::Metamethod(call) => {
                                return interp.apply_mm_call(st, call);
                            }
                        }
                    }
                }
                Opcode::UnaryMinus => {
                    let src = read_u16(bc, pc + 1);
                    let dst = read_u16(bc, pc + 3);
                    let v = slot!(src);
                    if v.is_double() {
                        slot!(dst) = TValue::double(-v.as_double());
                        st.pc = pc + 5;
                    } else if v.is_int32() {
                        slot!(dst) = TValue::double(-(v.as_int32() as f64));
                        st.pc = pc + 5;
                    } else {
                        match arith_ops::unary_minus_slow_path(interp.vm, v)? {
                            ArithSlowResult::Value(d) => {
                                slot!(dst) = TValue::double(d);
                                st.pc = pc + 5;
                            }
                            ArithSlowResult::Metamethod(call) => {
                                return interp.apply_mm_call(st, call);
                            }
                        }
                    }
                }
                Opcode::LogicalNot => {
                    let src = read_u16(bc, pc + 1);
                    let dst = read_u16(bc, pc + 3);
                    slot!(dst) = TValue::boolean(!slot!(src).is_truthy());
                    st.pc = pc + 5;
                }
                Opcode::LengthOf => {
                    let src = read_u16(bc, pc + 1);
                    let dst = read_u16(bc, pc + 3);
                    let v = slot!(src);
                    if v.is_string() {
                        let len = v.as_pointer::<HeapString>().as_ref().length;
                        slot!(dst) = TValue::double(len as f64);
                        st.pc = pc + 5;
                    } else if v.is_table() {
                        let len = TableObject::table_length(v.as_pointer());
                        slot!(dst) = TValue::double(len as f64);
                        st.pc = pc + 5;
                    } else {
                        let msg =
                            format!("attempt to get length of a {} value", v.type_name());
                        return Err(interp.vm.throw_fmt(msg));
                    }
                }
                Opcode::Concat => {
                    let concat_base = read_u16(bc, pc + 1) as usize;
                    let num = read_u16(bc, pc + 3) as usize;
                    let dst = read_u16(bc, pc + 5) as usize;
                    match concat_ops::concat_operation(interp, st, concat_base, num, dst)? {
                        StepOutcome::Continue => {}
                        other => return Ok(other),
                    }
                }

                // ---- comparison branches ----
                Opcode::BrIfLT | Opcode::BrIfNotLT | Opcode::BrIfLE | Opcode::BrIfNotLE => {
                    let lhs = slot!(read_u16(bc, pc + 1));
                    let rhs = slot!(read_u16(bc, pc + 3));
                    let is_le = matches!(op, Opcode::BrIfLE | Opcode::BrIfNotLE);
                    match compare_ops::do_ordered_compare(interp.vm, lhs, rhs, is_le)? {
                        CompareOutcome::Decided(truth) => {
                            if compare_ops::branch_polarity(op, truth) {
                                take_branch!(op, pc);
                            } else {
                                st.pc = pc + 7;
                            }
                        }
                        CompareOutcome::Metamethod(call) => {
                            return interp.apply_mm_call(st, call);
                        }
                    }
                }
                Opcode::BrIfEqVV | Opcode::BrIfNotEqVV | Opcode::BrIfEqVC
                | Opcode::BrIfNotEqVC => {
                    let lhs = slot!(read_u16(bc, pc + 1));
                    let rhs = if matches!(op, Opcode::BrIfEqVC | Opcode::BrIfNotEqVC) {
                        cst!(read_u16(bc, pc + 3))
                    } else {
                        slot!(read_u16(bc, pc + 3))
                    };
                    match compare_ops::do_equality(interp.vm, lhs, rhs)? {
                        CompareOutcome::Decided(truth) => {
                            if compare_ops::branch_polarity(op, truth) {
                                take_branch!(op, pc);
                            } else {
                                st.pc = pc + 7;
                            }
                        }
                        CompareOutcome::Metamethod(call) => {
                            return interp.apply_mm_call(st, call);
                        }
                    }
                }

                // ---- tests ----
                Opcode::BrIfTruthy | Opcode::BrIfFalsy => {
                    let v = slot!(read_u16(bc, pc + 1));
                    let want = matches!(op, Opcode::BrIfTruthy);
                    if v.is_truthy() == want {
                        take_branch!(op, pc);
                    } else {
                        st.pc = pc + 5;
                    }
                }
                Opcode::SelectAndBrIfTruthy | Opcode::SelectAndBrIfFalsy => {
                    let v = slot!(read_u16(bc, pc + 1));
                    let dst = read_u16(bc, pc + 3);
                    let want = matches!(op, Opcode::SelectAndBrIfTruthy);
                    if v.is_truthy() == want {
                        slot!(dst) = v;
                        take_branch!(op, pc);
                    } else {
                        st.pc = pc + 7;
                    }
                }
                Opcode::Branch => {
                    st.pc = (pc as i64 + read_i16(bc, pc + 1) as i64) as usize;
                }
                Opcode::BranchFar => {
                    st.pc = (pc as i64 + read_u32(bc, pc + 1) as i32 as i64) as usize;
                }

                // ---- tables ----
                Opcode::TableNew => {
                    let inline_cap = read_u8(bc, pc + 1) as u32;
                    let array_hint = read_u16(bc, pc + 2) as u32;
                    let dst = read_u16(bc, pc + 4);
                    slot!(dst) = interp.vm.create_table(inline_cap, array_hint);
                    st.pc = pc + 6;
                }
                Opcode::TableDup => {
                    let template = cst!(read_u16(bc, pc + 1));
                    let dst = read_u16(bc, pc + 3);
                    debug_assert!(template.is_table());
                    let cloned =
                        TableObject::shallow_clone(template.as_pointer(), &mut interp.vm.layout);
                    slot!(dst) = TValue::pointer(cloned);
                    st.pc = pc + 5;
                }
                Opcode::TableGetById
                | Opcode::TableGetByIdIcHitInline
                | Opcode::TableGetByIdIcHitOutlined => {
                    let base_v = slot!(read_u16(bc, pc + 1));
                    let prop_v = cst!(read_u16(bc, pc + 3));
                    let dst = read_u16(bc, pc + 5) as usize;
                    let ic_off = read_u32(bc, pc + 7);
                    let site: *mut GetByIdIcSite = CodeBlock::metadata_ptr(st.cb, ic_off);
                    let prop: UserHeapPtr<HeapString> = prop_v.as_pointer();
                    let len = op.encoded_length();
                    let outcome = match op {
                        Opcode::TableGetById => table_ops::execute_get_by_id(
                            interp, st, base_v, prop, dst, site, Some(pc), len,
                        )?,
                        Opcode::TableGetByIdIcHitInline => table_ops::execute_get_by_id_fused(
                            interp, st, base_v, prop, dst, site, IC_EFFECT_INLINE, len,
                        )?,
                        _ => table_ops::execute_get_by_id_fused(
                            interp, st, base_v, prop, dst, site, IC_EFFECT_OUTLINED, len,
                        )?,
                    };
                    match outcome {
                        StepOutcome::Continue => {}
                        other => return Ok(other),
                    }
                }
                Opcode::TablePutById
                | Opcode::TablePutByIdIcHitInline
                | Opcode::TablePutByIdIcHitOutlined => {
                    let base_v = slot!(read_u16(bc, pc + 1));
                    let prop_v = cst!(read_u16(bc, pc + 3));
                    let value = slot!(read_u16(bc, pc + 5));
                    let ic_off = read_u32(bc, pc + 7);
                    let site: *mut PutByIdIcSite = CodeBlock::metadata_ptr(st.cb, ic_off);
                    let prop: UserHeapPtr<HeapString> = prop_v.as_pointer();
                    let len = op.encoded_length();
                    let outcome = match op {
                        Opcode::TablePutById => table_ops::execute_put_by_id(
                            interp, st, base_v, prop, value, site, Some(pc), len,
                        )?,
                        Opcode::TablePutByIdIcHitInline => table_ops::execute_put_by_id_fused(
                            interp, st, base_v, prop, value, site, IC_EFFECT_INLINE, len,
                        )?,
                        _ => table_ops::execute_put_by_id_fused(
                            interp, st, base_v, prop, value, site, IC_EFFECT_OUTLINED, len,
                        )?,
                    };
                    match outcome {
                        StepOutcome::Continue => {}
                        other => return Ok(other),
                    }
                }
                Opcode::TableGetByImm => {
                    let base_v = slot!(read_u16(bc, pc + 1));
                    let imm = read_i16(bc, pc + 3) as i64;
                    let dst = read_u16(bc, pc + 5) as usize;
                    if base_v.is_table() {
                        let table = base_v.as_pointer();
                        let result = TableObject::get_by_integer_index(table, imm);
                        if !result.is_nil()
                            || !TableObject::array_type(table).may_have_metatable()
                        {
                            *base.add(dst) = result;
                            st.pc = pc + 7;
                            continue;
                        }
                    }
                    match table_ops::execute_get_generic(
                        interp,
                        st,
                        base_v,
                        TValue::double(imm as f64),
                        dst,
                        7,
                    )? {
                        StepOutcome::Continue => {}
                        other => return Ok(other),
                    }
                }
                Opcode::TablePutByImm => {
                    let base_v = slot!(read_u16(bc, pc + 1));
                    let imm = read_i16(bc, pc + 3) as i64;
                    let value = slot!(read_u16(bc, pc + 5));
                    if base_v.is_table() {
                        let table = base_v.as_pointer();
                        let at = TableObject::array_type(table);
                        if !at.may_have_metatable()
                            || !TableObject::get_by_integer_index(table, imm).is_nil()
                        {
                            TableObject::raw_put_by_integer_index(
                                table,
                                &mut interp.vm.layout,
                                imm,
                                value,
                            );
                            st.pc = pc + 7;
                            continue;
                        }
                    }
                    match table_ops::execute_put_generic(
                        interp,
                        st,
                        base_v,
                        TValue::double(imm as f64),
                        value,
                        7,
                    )? {
                        StepOutcome::Continue => {}
                        other => return Ok(other),
                    }
                }
                Opcode::TableGetByVal => {
                    let base_v = slot!(read_u16(bc, pc + 1));
                    let key = slot!(read_u16(bc, pc + 3));
                    let dst = read_u16(bc, pc + 5) as usize;
                    match table_ops::execute_get_generic(interp, st, base_v, key, dst, 7)? {
                        StepOutcome::Continue => {}
                        other => return Ok(other),
                    }
                }
                Opcode::TablePutByVal => {
                    let base_v = slot!(read_u16(bc, pc + 1));
                    let key = slot!(read_u16(bc, pc + 3));
                    let value = slot!(read_u16(bc, pc + 5));
                    match table_ops::execute_put_generic(interp, st, base_v, key, value, 7)? {
                        StepOutcome::Continue => {}
                        other => return Ok(other),
                    }
                }
                Opcode::TableVariadicPutBySeq => {
                    let table_v = slot!(read_u16(bc, pc + 1));
                    let idx_cst = cst!(read_u16(bc, pc + 3));
                    debug_assert!(table_v.is_table());
                    let start_idx = if idx_cst.is_int32() {
                        idx_cst.as_int32() as i64
                    } else {
                        idx_cst.as_double() as i64
                    };
                    let (vstart, vnum) = st.coro.as_ref().variadic_rets();
                    let table = table_v.as_pointer();
                    for i in 0..vnum {
                        TableObject::raw_put_by_integer_index(
                            table,
                            &mut interp.vm.layout,
                            start_idx + i as i64,
                            *vstart.add(i),
                        );
                    }
                    st.pc = pc + 5;
                }
                Opcode::GlobalGet => {
                    let prop_v = cst!(read_u16(bc, pc + 1));
                    let dst = read_u16(bc, pc + 3) as usize;
                    let ic_off = read_u32(bc, pc + 5);
                    let site: *mut GetByIdIcSite = CodeBlock::metadata_ptr(st.cb, ic_off);
                    let global = TValue::pointer(cb.global_object);
                    match table_ops::execute_get_by_id(
                        interp,
                        st,
                        global,
                        prop_v.as_pointer(),
                        dst,
                        site,
                        None,
                        9,
                    )? {
                        StepOutcome::Continue => {}
                        other => return Ok(other),
                    }
                }
                Opcode::GlobalPut => {
                    let prop_v = cst!(read_u16(bc, pc + 1));
                    let value = slot!(read_u16(bc, pc + 3));
                    let ic_off = read_u32(bc, pc + 5);
                    let site: *mut PutByIdIcSite = CodeBlock::metadata_ptr(st.cb, ic_off);
                    let global = TValue::pointer(cb.global_object);
                    match table_ops::execute_put_by_id(
                        interp,
                        st,
                        global,
                        prop_v.as_pointer(),
                        value,
                        site,
                        None,
                        9,
                    )? {
                        StepOutcome::Continue => {}
                        other => return Ok(other),
                    }
                }

                // ---- upvalues ----
                Opcode::UpvalueGet => {
                    let ord = read_u16(bc, pc + 1);
                    let dst = read_u16(bc, pc + 3);
                    let func = StackFrameHeader::from_base(base).func;
                    let uv = crate::lua_value::function_object::FunctionObject::get_upvalue(
                        func, ord,
                    );
                    slot!(dst) = uv.to_user().as_ref().get();
                    st.pc = pc + 5;
                }
                Opcode::UpvaluePut => {
                    let ord = read_u16(bc, pc + 1);
                    let src = read_u16(bc, pc + 3);
                    let func = StackFrameHeader::from_base(base).func;
                    let uv = crate::lua_value::function_object::FunctionObject::get_upvalue(
                        func, ord,
                    );
                    uv.to_user().as_mut().set(slot!(src));
                    st.pc = pc + 5;
                }
                Opcode::UpvalueClose => {
                    let close_base = read_u16(bc, pc + 1) as usize;
                    st.coro.as_mut().close_upvalues(base.add(close_base));
                    take_branch!(op, pc);
                }

                Opcode::NewClosure => {
                    let ord = read_u16(bc, pc + 1);
                    let dst = read_u16(bc, pc + 3);
                    let child_raw = cb.constant(ord);
                    let child: SystemHeapPtr<UnlinkedCodeBlock> =
                        SystemHeapPtr::from_raw(child_raw as u32);
                    let closure = super::create_and_fill_upvalues(interp.vm, child, st)?;
                    slot!(dst) = closure;
                    st.pc = pc + 5;
                }

                // ---- varargs ----
                Opcode::StoreVarArgsAsVariadicResults => {
                    let hdr = StackFrameHeader::from_base(base);
                    let num = hdr.num_variadic_arguments as usize;
                    let start = StackFrameHeader::variadic_args_start(base);
                    st.coro.as_mut().set_variadic_rets(start, num);
                    st.pc = pc + 1;
                }
                Opcode::GetVarArgsPrefix => {
                    let dst_base = read_u16(bc, pc + 1) as usize;
                    let num = read_u16(bc, pc + 3) as usize;
                    let hdr = StackFrameHeader::from_base(base);
                    let available = hdr.num_variadic_arguments as usize;
                    let start = StackFrameHeader::variadic_args_start(base);
                    for i in 0..num {
                        *base.add(dst_base + i) =
                            if i < available { *start.add(i) } else { TValue::nil() };
                    }
                    st.pc = pc + 5;
                }

                // ---- calls ----
                Opcode::Call | Opcode::CallM => {
                    let call_base = read_u16(bc, pc + 1) as usize;
                    let mut num_args = read_u16(bc, pc + 3) as usize;
                    let cfb = base.add(call_base);
                    if op == Opcode::CallM {
                        num_args = append_variadic_results(st, cfb, num_args);
                    }
                    return interp.setup_call_frame(
                        st,
                        cfb,
                        num_args,
                        ReturnContinuation::CallOp,
                        base,
                        pc,
                    );
                }
                Opcode::CallT | Opcode::CallMT => {
                    let call_base = read_u16(bc, pc + 1) as usize;
                    let mut num_args = read_u16(bc, pc + 3) as usize;
                    let cfb = base.add(call_base);
                    if op == Opcode::CallMT {
                        num_args = append_variadic_results(st, cfb, num_args);
                    }
                    // Reuse this frame's storage: the callee slides down to
                    // the lowest slot we own and inherits our continuation.
                    let hdr = StackFrameHeader::from_base(base);
                    let inherited_cont = ReturnContinuation::from_u64(hdr.ret_cont);
                    let inherited_caller = hdr.caller_base;
                    let inherited_pc = hdr.caller_bytecode_offset as usize;
                    let new_cfb = StackFrameHeader::variadic_args_start(base);

                    let mut scratch: Vec<TValue> = Vec::with_capacity(num_args + 1);
                    scratch.push(*cfb);
                    for i in 0..num_args {
                        scratch.push(*cfb.add(X_NUM_SLOTS_FOR_STACK_FRAME_HEADER + i));
                    }
                    *new_cfb = scratch[0];
                    for (i, v) in scratch[1..].iter().enumerate() {
                        *new_cfb.add(X_NUM_SLOTS_FOR_STACK_FRAME_HEADER + i) = *v;
                    }
                    return interp.setup_call_frame(
                        st,
                        new_cfb,
                        num_args,
                        inherited_cont,
                        inherited_caller,
                        inherited_pc,
                    );
                }

                // ---- returns ----
                Opcode::Ret0 => {
                    return interp.do_return(st, base, 0);
                }
                Opcode::Ret => {
                    let ret_base = read_u16(bc, pc + 1) as usize;
                    let num = read_u16(bc, pc + 3) as usize;
                    return interp.do_return(st, base.add(ret_base), num);
                }
                Opcode::RetM => {
                    let ret_base = read_u16(bc, pc + 1) as usize;
                    let num = read_u16(bc, pc + 3) as usize;
                    let start = base.add(ret_base);
                    let (vstart, vnum) = st.coro.as_ref().variadic_rets();
                    // The variadic block follows the fixed values; memmove
                    // semantics because the ranges may already overlap.
                    std::ptr::copy(vstart, start.add(num), vnum);
                    return interp.do_return(st, start, num + vnum);
                }

                // ---- numeric for ----
                Opcode::ForLoopInit => {
                    let loop_base = read_u16(bc, pc + 1) as usize;
                    coerce_for_slot(interp, base.add(loop_base), "'for' initial value")?;
                    coerce_for_slot(interp, base.add(loop_base + 1), "'for' limit")?;
                    coerce_for_slot(interp, base.add(loop_base + 2), "'for' step")?;
                    let start = (*base.add(loop_base)).as_double();
                    let limit = (*base.add(loop_base + 1)).as_double();
                    let step = (*base.add(loop_base + 2)).as_double();
                    let entered = if step > 0.0 { start <= limit } else { start >= limit };
                    if entered {
                        *base.add(loop_base + 3) = TValue::double(start);
                        st.pc = pc + 5;
                    } else {
                        take_branch!(op, pc);
                    }
                }
                Opcode::ForLoopStep => {
                    let loop_base = read_u16(bc, pc + 1) as usize;
                    let i = (*base.add(loop_base)).as_double()
                        + (*base.add(loop_base + 2)).as_double();
                    let limit = (*base.add(loop_base + 1)).as_double();
                    let step = (*base.add(loop_base + 2)).as_double();
                    *base.add(loop_base) = TValue::double(i);
                    let continues = if step > 0.0 { i <= limit } else { i >= limit };
                    if continues {
                        *base.add(loop_base + 3) = TValue::double(i);
                        take_branch!(op, pc);
                    } else {
                        st.pc = pc + 5;
                    }
                }

                // ---- generic for ----
                Opcode::ForLoopIter => {
                    let loop_base = read_u16(bc, pc + 1) as usize;
                    let lb = base.add(loop_base);
                    let cfb = lb.add(3);
                    *cfb = *lb;
                    *cfb.add(X_NUM_SLOTS_FOR_STACK_FRAME_HEADER) = *lb.add(1);
                    *cfb.add(X_NUM_SLOTS_FOR_STACK_FRAME_HEADER + 1) = *lb.add(2);
                    return interp.setup_call_frame(
                        st,
                        cfb,
                        2,
                        ReturnContinuation::IterCall,
                        base,
                        pc,
                    );
                }
                Opcode::KVLoopIter => {
                    let loop_base = read_u16(bc, pc + 1) as usize;
                    let num_rets = read_u8(bc, pc + 3) as usize;
                    let lb = base.add(loop_base);
                    if super::is_true_base_next(interp.vm, *lb) {
                        let mut iter = super::unpack_iterator_from_slot(*lb.add(2));
                        debug_assert!((*lb.add(1)).is_table());
                        let table = (*lb.add(1)).as_pointer();
                        let sentinels = interp.vm.iteration_sentinels();
                        let kv = iter.advance(table, sentinels);
                        *lb.add(2) = super::pack_iterator_into_slot(iter);
                        *lb.add(3) = kv.key;
                        if num_rets >= 2 {
                            *lb.add(4) = kv.value;
                        }
                        if kv.key.is_nil() {
                            st.pc = pc + 6;
                        } else {
                            take_branch!(op, pc);
                        }
                    } else {
                        // Not actually a table-kv loop: normal iterator call.
                        let callee = *lb;
                        let cfb = lb.add(3);
                        *cfb = callee;
                        *cfb.add(X_NUM_SLOTS_FOR_STACK_FRAME_HEADER) = *lb.add(1);
                        *cfb.add(X_NUM_SLOTS_FOR_STACK_FRAME_HEADER + 1) = *lb.add(2);
                        return interp.setup_call_frame(
                            st,
                            cfb,
                            2,
                            ReturnContinuation::KVIterCall,
                            base,
                            pc,
                        );
                    }
                }
                Opcode::ValidateIsNextAndBranch => {
                    let loop_base = read_u16(bc, pc + 1) as usize;
                    let lb = base.add(loop_base);
                    if super::is_true_base_next(interp.vm, *lb)
                        && (*lb.add(1)).is_table()
                        && (*lb.add(2)).is_nil()
                    {
                        *lb.add(2) = super::pack_iterator_into_slot(TableObjectIterator::new());
                    }
                    take_branch!(op, pc);
                }
            }
        }
    }
}

/// Decodes an arithmetic bytecode's operation and operand values.
unsafe fn decode_arith(
    bc: *const u8,
    pc: usize,
    base: *mut TValue,
    cb: &CodeBlock,
) -> (ArithOp, TValue, TValue) {
    let op = Opcode::from_u8(*bc.add(pc));
    use Opcode::*;
    let arith = match op {
        AddVV | AddVC | AddCV => ArithOp::Add,
        SubVV | SubVC | SubCV => ArithOp::Sub,
        MulVV | MulVC | MulCV => ArithOp::Mul,
        DivVV | DivVC | DivCV => ArithOp::Div,
        ModVV | ModVC | ModCV => ArithOp::Mod,
        _ => ArithOp::Pow,
    };
    let a = read_u16(bc, pc + 1);
    let b = read_u16(bc, pc + 3);
    let (lhs, rhs) = match op {
        AddVV | SubVV | MulVV | DivVV | ModVV | PowVV => {
            (*base.add(a as usize), *base.add(b as usize))
        }
        AddVC | SubVC | MulVC | DivVC | ModVC | PowVC => {
            (*base.add(a as usize), TValue::from_raw(cb.constant(b)))
        }
        _ => (TValue::from_raw(cb.constant(a)), *base.add(b as usize)),
    };
    (arith, lhs, rhs)
}

/// Appends the current variadic-results block after the laid-out call
/// arguments; returns the new argument count.
unsafe fn append_variadic_results(st: &ExecState, cfb: *mut TValue, num_args: usize) -> usize {
    let (vstart, vnum) = st.coro.as_ref().variadic_rets();
    if vnum == 0 {
        return num_args;
    }
    let dst = cfb.add(X_NUM_SLOTS_FOR_STACK_FRAME_HEADER + num_args);
    std::ptr::copy(vstart, dst, vnum);
    num_args + vnum
}

unsafe fn coerce_for_slot(
    interp: &mut Interpreter,
    slot: *mut TValue,
    what: &str,
) -> VmResult<()> {
    let v = *slot;
    if v.is_double() {
        return Ok(());
    }
    if v.is_int32() {
        *slot = TValue::double(v.as_int32() as f64);
        return Ok(());
    }
    if v.is_string() {
        let s = v.as_pointer::<HeapString>();
        if let Some(d) = try_convert_string_to_double_with_lua_semantics(s.as_ref().as_bytes()) {
            *slot = TValue::double(d);
            return Ok(());
        }
    }
    let msg = format!("{} must be a number", what);
    Err(interp.vm.throw_fmt(msg))
}
