// Concat (`..`), multi-operand.
//
// Fast path: when every operand in [base, base+num) is a string or a
// number, numbers are coerced to strings in place and the conser is
// called once over the whole slice. Slow path: scan right to left,
// folding string/number prefixes, until an operand needs __concat; the
// resume position is parked in slot base+num-1 (already consumed, safely
// clobberable) before the metamethod call, and the continuation picks the
// scan back up with the metamethod's result.

use crate::hidden_class::metamethod_kind::LuaMetamethodKind;
use crate::lua_value::TValue;

use super::arith_ops::get_metamethod_for_binary_arith;
use super::{read_u16, ExecState, Interpreter, MmCall, ReturnContinuation, StepOutcome};
use crate::lua_vm::bytecode::Opcode;
use crate::lua_vm::{Vm, VmResult};

/// String, or number coerced to a fresh string; None otherwise.
fn try_get_string_or_coerce(vm: &mut Vm, v: TValue) -> Option<TValue> {
    if v.is_string() {
        return Some(v);
    }
    if v.is_double() {
        return Some(vm.stringify_double_value(v.as_double()));
    }
    if v.is_int32() {
        return Some(vm.stringify_int32_value(v.as_int32()));
    }
    None
}

pub fn concat_operation(
    interp: &mut Interpreter,
    st: &mut ExecState,
    base_slot: usize,
    num: usize,
    dst: usize,
) -> VmResult<StepOutcome> {
    unsafe {
        let base = st.base.add(base_slot);
        debug_assert!(num >= 2);

        // Fast path: all operands concatenable without metamethods.
        let mut all_simple = true;
        for i in 0..num {
            let v = *base.add(i);
            if !(v.is_string() || v.is_double() || v.is_int32()) {
                all_simple = false;
                break;
            }
        }
        if all_simple {
            for i in 0..num {
                let v = *base.add(i);
                if !v.is_string() {
                    *base.add(i) = try_get_string_or_coerce(interp.vm, v).unwrap();
                }
            }
            let slice = std::slice::from_raw_parts(base, num);
            let s = interp
                .vm
                .interner
                .intern_concatenation(&mut interp.vm.layout, slice);
            *st.base.add(dst) = TValue::pointer(s);
            st.pc += Opcode::Concat.encoded_length();
            return Ok(StepOutcome::Continue);
        }

        let cur = *base.add(num - 1);
        scan_for_metamethod_call(interp, st, base, num, dst, num as i64 - 2, cur)
    }
}

/// Folds base[start_offset] .. cur_value leftward until exhausted or a
/// metamethod is required.
unsafe fn scan_for_metamethod_call(
    interp: &mut Interpreter,
    st: &mut ExecState,
    base: *mut TValue,
    num: usize,
    dst: usize,
    mut offset: i64,
    mut cur_value: TValue,
) -> VmResult<StepOutcome> {
    // The scan keeps cur_string (coerced) and cur_value (original) in
    // sync: a metamethod must see the original right operand when no fold
    // happened yet.
    let mut cur_string = try_get_string_or_coerce(interp.vm, cur_value);
    while offset >= 0 {
        let lhs = *base.add(offset as usize);
        let (Some(cs), Some(ls)) = (cur_string, try_get_string_or_coerce(interp.vm, lhs)) else {
            // Metamethod needed between lhs and cur_value.
            let mm = get_metamethod_for_binary_arith(
                interp.vm,
                lhs,
                cur_value,
                LuaMetamethodKind::Concat,
            );
            if mm.is_nil() {
                let offender = if try_get_string_or_coerce(interp.vm, lhs).is_none() {
                    lhs
                } else {
                    cur_value
                };
                let msg =
                    format!("attempt to concatenate a {} value", offender.type_name());
                return Err(interp.vm.throw_fmt(msg));
            }
            // Park the resume position; the slot is safely clobberable.
            *base.add(num - 1) = TValue::int32(offset as i32);
            return interp.apply_mm_call(
                st,
                MmCall::Call {
                    mm,
                    args: [lhs, cur_value, TValue::nil()],
                    num_args: 2,
                    continuation: ReturnContinuation::ConcatMM,
                },
            );
        };
        let pieces = [ls, cs];
        let joined = interp
            .vm
            .interner
            .intern_concatenation(&mut interp.vm.layout, &pieces);
        cur_value = TValue::pointer(joined);
        cur_string = Some(cur_value);
        offset -= 1;
    }

    *st.base.add(dst) = cur_value;
    st.pc += Opcode::Concat.encoded_length();
    Ok(StepOutcome::Continue)
}

/// ConcatMM continuation: st is positioned at the Concat bytecode.
pub fn resume_concat_after_metamethod(
    interp: &mut Interpreter,
    st: &mut ExecState,
    result: TValue,
) -> VmResult<StepOutcome> {
    unsafe {
        let bc = st.cb.as_ref().bytecode_ptr();
        debug_assert_eq!(Opcode::from_u8(*bc.add(st.pc)), Opcode::Concat);
        let base_slot = read_u16(bc, st.pc + 1) as usize;
        let num = read_u16(bc, st.pc + 3) as usize;
        let dst = read_u16(bc, st.pc + 5) as usize;
        let base = st.base.add(base_slot);
        let parked = *base.add(num - 1);
        debug_assert!(parked.is_int32());
        let offset = parked.as_int32() as i64 - 1;
        match scan_for_metamethod_call(interp, st, base, num, dst, offset, result)? {
            StepOutcome::Continue => Ok(StepOutcome::FrameChanged),
            other => Ok(other),
        }
    }
}
