// Comparison and equality semantics.
//
// The bytecode set keeps distinct NotLT/NotLE opcodes because !(a<b) is
// not a>=b under NaN. Lua 5.1 ordered-comparison metamethods require both
// operands to be the same type and to share the same metamethod object;
// for `eq` the cheap negative-lookup mask is consulted first, since "no
// metamethod" just means false there rather than an error.

use crate::gc::UserHeapPtr;
use crate::hidden_class::metamethod_kind::LuaMetamethodKind;
use crate::lua_value::heap_string::HeapString;
use crate::lua_value::table_object::TableObject;
use crate::lua_value::TValue;

use super::table_ops::{get_metamethod_from_metatable, get_metatable_for_value};
use super::{MmCall, ReturnContinuation};
use crate::lua_vm::bytecode::Opcode;
use crate::lua_vm::{Vm, VmResult};

/// Whether the branch is taken given the (possibly metamethod-produced)
/// comparison truth value.
#[inline]
pub fn branch_polarity(op: Opcode, truthy: bool) -> bool {
    use Opcode::*;
    match op {
        BrIfLT | BrIfLE | BrIfEqVV | BrIfEqVC => truthy,
        BrIfNotLT | BrIfNotLE | BrIfNotEqVV | BrIfNotEqVC => !truthy,
        _ => unreachable!("{:?} is not a comparison branch", op),
    }
}

pub enum CompareOutcome {
    /// The raw comparison result (before branch polarity).
    Decided(bool),
    Metamethod(MmCall),
}

/// Lua 5.1: both operands must be tables (or both full userdata) sharing
/// the same metamethod object; otherwise the metamethod is not used.
fn get_metamethod_for_comparison(
    vm: &mut Vm,
    lhs_metatable: UserHeapPtr<TableObject>,
    rhs_metatable: UserHeapPtr<TableObject>,
    kind: LuaMetamethodKind,
    quickly_rule_out: bool,
) -> TValue {
    if quickly_rule_out {
        if TableObject::try_quickly_rule_out_metamethod(lhs_metatable, kind)
            || TableObject::try_quickly_rule_out_metamethod(rhs_metatable, kind)
        {
            return TValue::nil();
        }
    }
    let lhs_mm = get_metamethod_from_metatable(vm, lhs_metatable, kind);
    if lhs_mm.is_nil() {
        return TValue::nil();
    }
    let rhs_mm = get_metamethod_from_metatable(vm, rhs_metatable, kind);

    // Primitive comparison of the two metamethod values: floats by value
    // (negative zero, NaN), everything else by bits. No coercions apply.
    let same = if lhs_mm.is_double() {
        rhs_mm.is_double() && lhs_mm.as_double() == rhs_mm.as_double()
    } else {
        lhs_mm.raw() == rhs_mm.raw()
    };
    if same {
        lhs_mm
    } else {
        TValue::nil()
    }
}

/// Ordered comparison lhs < rhs (or <=). `is_le` picks the operator.
pub fn do_ordered_compare(
    vm: &mut Vm,
    lhs: TValue,
    rhs: TValue,
    is_le: bool,
) -> VmResult<CompareOutcome> {
    if let (Some(a), Some(b)) = (lhs.as_number(), rhs.as_number()) {
        return Ok(CompareOutcome::Decided(if is_le { a <= b } else { a < b }));
    }
    if lhs.is_string() && rhs.is_string() {
        let a = unsafe { lhs.as_pointer::<HeapString>().as_ref() };
        let b = unsafe { rhs.as_pointer::<HeapString>().as_ref() };
        let ord = a.compare(b);
        return Ok(CompareOutcome::Decided(if is_le {
            ord != std::cmp::Ordering::Greater
        } else {
            ord == std::cmp::Ordering::Less
        }));
    }
    if lhs.is_table() && rhs.is_table() {
        let lmt = get_metatable_for_value(vm, lhs);
        let rmt = get_metatable_for_value(vm, rhs);
        if !lmt.is_null() && !rmt.is_null() {
            let kind = if is_le { LuaMetamethodKind::Le } else { LuaMetamethodKind::Lt };
            let mm = get_metamethod_for_comparison(vm, lmt, rmt, kind, false);
            if !mm.is_nil() {
                return Ok(CompareOutcome::Metamethod(MmCall::Call {
                    mm,
                    args: [lhs, rhs, TValue::nil()],
                    num_args: 2,
                    continuation: ReturnContinuation::CompareMM,
                }));
            }
        }
    }
    let msg = format!(
        "attempt to compare {} with {}",
        lhs.type_name(),
        rhs.type_name()
    );
    Err(vm.throw_fmt(msg))
}

pub fn do_equality(vm: &mut Vm, lhs: TValue, rhs: TValue) -> VmResult<CompareOutcome> {
    // Numbers first: canonical NaN bits are equal, NaN values are not.
    if let (Some(a), Some(b)) = (lhs.as_number(), rhs.as_number()) {
        return Ok(CompareOutcome::Decided(a == b));
    }
    if lhs.raw() == rhs.raw() {
        return Ok(CompareOutcome::Decided(true));
    }
    if lhs.is_table() && rhs.is_table() {
        let lmt = get_metatable_for_value(vm, lhs);
        let rmt = get_metatable_for_value(vm, rhs);
        if !lmt.is_null() && !rmt.is_null() {
            let mm =
                get_metamethod_for_comparison(vm, lmt, rmt, LuaMetamethodKind::Eq, true);
            if !mm.is_nil() {
                return Ok(CompareOutcome::Metamethod(MmCall::Call {
                    mm,
                    args: [lhs, rhs, TValue::nil()],
                    num_args: 2,
                    continuation: ReturnContinuation::CompareMM,
                }));
            }
        }
    }
    Ok(CompareOutcome::Decided(false))
}
