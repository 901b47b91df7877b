// Arithmetic semantics.
//
// Fast path is double/double IEEE. Mod is Lua's a - floor(a/b)*b realized
// as fmod with sign correction; Pow takes the doubling-algorithm fast path
// for integral exponents with |e| < 128 and falls back to libm. The slow
// path consults the __add-family metamethod on the left then the right
// operand, then attempts string-to-number coercion on both (Lua accepts
// "1 " + " 0xf "), and only then errors.

use crate::hidden_class::metamethod_kind::LuaMetamethodKind;
use crate::lua_value::heap_string::HeapString;
use crate::lua_value::TValue;

use super::table_ops::{get_metamethod_from_metatable, get_metatable_for_value};
use super::{MmCall, ReturnContinuation};
use crate::lua_vm::numeric::try_convert_string_to_double_with_lua_semantics;
use crate::lua_vm::{Vm, VmResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

impl ArithOp {
    pub fn metamethod_kind(self) -> LuaMetamethodKind {
        match self {
            ArithOp::Add => LuaMetamethodKind::Add,
            ArithOp::Sub => LuaMetamethodKind::Sub,
            ArithOp::Mul => LuaMetamethodKind::Mul,
            ArithOp::Div => LuaMetamethodKind::Div,
            ArithOp::Mod => LuaMetamethodKind::Mod,
            ArithOp::Pow => LuaMetamethodKind::Pow,
        }
    }
}

/// Quoted from PUC Lua: modulo is defined as a - floor(a/b)*b; fmod gives
/// a - trunc(a/b)*b and must be corrected when the result and b have
/// different signs.
#[inline]
pub fn modulus_with_lua_semantics(a: f64, b: f64) -> f64 {
    let m = a % b;
    if (m > 0.0 && b < 0.0) || (m < 0.0 && b > 0.0) {
        m + b
    } else {
        m
    }
}

/// Doubling algorithm for integral exponents; only profitable (and only
/// used) for |e| < 128.
#[inline]
pub fn math_fast_pow_int(base: f64, e: i32) -> f64 {
    debug_assert!(e.unsigned_abs() < 128);
    let mut result = 1.0f64;
    let mut b = base;
    let mut n = e.unsigned_abs();
    while n != 0 {
        if n & 1 != 0 {
            result *= b;
        }
        b *= b;
        n >>= 1;
    }
    if e < 0 {
        1.0 / result
    } else {
        result
    }
}

#[inline]
pub fn pow_with_lua_semantics(a: f64, b: f64) -> f64 {
    let as_int = b as i32;
    if as_int as f64 == b && as_int.unsigned_abs() < 128 {
        math_fast_pow_int(a, as_int)
    } else {
        a.powf(b)
    }
}

#[inline(always)]
pub fn do_arith(op: ArithOp, a: f64, b: f64) -> f64 {
    match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Mod => modulus_with_lua_semantics(a, b),
        ArithOp::Pow => pow_with_lua_semantics(a, b),
    }
}

pub enum ArithSlowResult {
    Value(f64),
    Metamethod(MmCall),
}

fn coerce_operand_to_number(v: TValue) -> Option<f64> {
    if let Some(d) = v.as_number() {
        return Some(d);
    }
    if v.is_string() {
        let s = unsafe { v.as_pointer::<HeapString>().as_ref() };
        return try_convert_string_to_double_with_lua_semantics(s.as_bytes());
    }
    None
}

/// The metamethod for a binary arithmetic operation: left operand's
/// metatable first, then the right operand's.
pub fn get_metamethod_for_binary_arith(
    vm: &mut Vm,
    lhs: TValue,
    rhs: TValue,
    kind: LuaMetamethodKind,
) -> TValue {
    let lhs_mt = get_metatable_for_value(vm, lhs);
    if !lhs_mt.is_null() {
        let mm = get_metamethod_from_metatable(vm, lhs_mt, kind);
        if !mm.is_nil() {
            return mm;
        }
    }
    let rhs_mt = get_metatable_for_value(vm, rhs);
    if !rhs_mt.is_null() {
        return get_metamethod_from_metatable(vm, rhs_mt, kind);
    }
    TValue::nil()
}

pub fn arith_slow_path(
    vm: &mut Vm,
    op: ArithOp,
    lhs: TValue,
    rhs: TValue,
) -> VmResult<ArithSlowResult> {
    let mm = get_metamethod_for_binary_arith(vm, lhs, rhs, op.metamethod_kind());
    if !mm.is_nil() {
        return Ok(ArithSlowResult::Metamethod(MmCall::Call {
            mm,
            args: [lhs, rhs, TValue::nil()],
            num_args: 2,
            continuation: ReturnContinuation::StoreResultAndAdvance,
        }));
    }
    if let (Some(a), Some(b)) = (coerce_operand_to_number(lhs), coerce_operand_to_number(rhs)) {
        return Ok(ArithSlowResult::Value(do_arith(op, a, b)));
    }
    Err(vm.throw_str("invalid types for arithmetic"))
}

/// Unary minus: number fast path done by the dispatcher; here string
/// coercion, then __unm with (v, v).
pub fn unary_minus_slow_path(vm: &mut Vm, v: TValue) -> VmResult<ArithSlowResult> {
    if v.is_string() {
        let s = unsafe { v.as_pointer::<HeapString>().as_ref() };
        if let Some(d) = try_convert_string_to_double_with_lua_semantics(s.as_bytes()) {
            return Ok(ArithSlowResult::Value(-d));
        }
    }
    let mt = get_metatable_for_value(vm, v);
    if !mt.is_null() {
        let mm = get_metamethod_from_metatable(vm, mt, LuaMetamethodKind::Unm);
        if !mm.is_nil() {
            return Ok(ArithSlowResult::Metamethod(MmCall::Call {
                mm,
                args: [v, v, TValue::nil()],
                num_args: 2,
                continuation: ReturnContinuation::StoreResultAndAdvance,
            }));
        }
    }
    let msg = format!("attempt to perform arithmetic on a {} value", v.type_name());
    Err(vm.throw_fmt(msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lua_modulo_sign_correction() {
        assert_eq!(do_arith(ArithOp::Mod, 5.0, 3.0), 2.0);
        assert_eq!(do_arith(ArithOp::Mod, -5.0, 3.0), 1.0);
        assert_eq!(do_arith(ArithOp::Mod, 5.0, -3.0), -1.0);
        assert_eq!(do_arith(ArithOp::Mod, -5.0, -3.0), -2.0);
        assert_eq!(do_arith(ArithOp::Mod, 5.5, 2.0), 1.5);
    }

    #[test]
    fn test_fast_pow_matches_libm() {
        for e in [-127, -3, -1, 0, 1, 2, 3, 10, 31, 127] {
            let got = math_fast_pow_int(1.5, e);
            let want = 1.5f64.powi(e);
            assert!((got - want).abs() <= want.abs() * 1e-12, "e={}", e);
        }
        assert_eq!(pow_with_lua_semantics(2.0, 10.0), 1024.0);
        assert_eq!(pow_with_lua_semantics(2.0, 0.5), 2.0f64.sqrt());
        assert_eq!(pow_with_lua_semantics(2.0, 1000.0), 2.0f64.powf(1000.0));
    }
}
