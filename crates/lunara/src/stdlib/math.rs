// math library. random is the xorshift64* generator seeded through
// randomseed, matching the PUC surface rather than importing an RNG crate
// for one function.

use crate::define_lib_func;
use crate::lua_value::table_object::TableObject;
use crate::lua_value::TValue;
use crate::lua_vm::execute::LibFnAction;
use crate::lua_vm::Vm;

use super::{check_number, install_module};

pub fn install(vm: &mut Vm) {
    let table = install_module(
        vm,
        "math",
        &[
            ("abs", math_abs),
            ("acos", math_acos),
            ("asin", math_asin),
            ("atan", math_atan),
            ("atan2", math_atan2),
            ("ceil", math_ceil),
            ("cos", math_cos),
            ("deg", math_deg),
            ("exp", math_exp),
            ("floor", math_floor),
            ("fmod", math_fmod),
            ("log", math_log),
            ("log10", math_log10),
            ("max", math_max),
            ("min", math_min),
            ("modf", math_modf),
            ("pow", math_pow),
            ("rad", math_rad),
            ("random", math_random),
            ("randomseed", math_randomseed),
            ("sin", math_sin),
            ("sqrt", math_sqrt),
            ("tan", math_tan),
        ],
    );
    let t = table.as_pointer::<TableObject>();
    let huge = vm.interner.intern(&mut vm.layout, b"huge");
    TableObject::put_by_id(t, &mut vm.layout, huge, TValue::double(f64::INFINITY));
    let pi = vm.interner.intern(&mut vm.layout, b"pi");
    TableObject::put_by_id(t, &mut vm.layout, pi, TValue::double(std::f64::consts::PI));
}

macro_rules! unary_math_fn {
    ($name:ident, $fname:literal, $apply:expr) => {
        define_lib_func!($name, (vm, ctx) {
            let x = check_number(vm, &ctx, 0, $fname)?;
            let f: fn(f64) -> f64 = $apply;
            unsafe { *ctx.slot(0) = TValue::double(f(x)) };
            Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
        });
    };
}

unary_math_fn!(math_abs, "abs", f64::abs);
unary_math_fn!(math_acos, "acos", f64::acos);
unary_math_fn!(math_asin, "asin", f64::asin);
unary_math_fn!(math_atan, "atan", f64::atan);
unary_math_fn!(math_ceil, "ceil", f64::ceil);
unary_math_fn!(math_cos, "cos", f64::cos);
unary_math_fn!(math_deg, "deg", f64::to_degrees);
unary_math_fn!(math_exp, "exp", f64::exp);
unary_math_fn!(math_floor, "floor", f64::floor);
unary_math_fn!(math_log10, "log10", f64::log10);
unary_math_fn!(math_rad, "rad", f64::to_radians);
unary_math_fn!(math_sin, "sin", f64::sin);
unary_math_fn!(math_sqrt, "sqrt", f64::sqrt);
unary_math_fn!(math_tan, "tan", f64::tan);

define_lib_func!(math_log, (vm, ctx) {
    let x = check_number(vm, &ctx, 0, "log")?;
    unsafe { *ctx.slot(0) = TValue::double(x.ln()) };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(math_atan2, (vm, ctx) {
    let y = check_number(vm, &ctx, 0, "atan2")?;
    let x = check_number(vm, &ctx, 1, "atan2")?;
    unsafe { *ctx.slot(0) = TValue::double(y.atan2(x)) };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(math_fmod, (vm, ctx) {
    let a = check_number(vm, &ctx, 0, "fmod")?;
    let b = check_number(vm, &ctx, 1, "fmod")?;
    unsafe { *ctx.slot(0) = TValue::double(a % b) };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(math_pow, (vm, ctx) {
    let a = check_number(vm, &ctx, 0, "pow")?;
    let b = check_number(vm, &ctx, 1, "pow")?;
    let r = crate::lua_vm::execute::pow_with_lua_semantics(a, b);
    unsafe { *ctx.slot(0) = TValue::double(r) };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(math_max, (vm, ctx) {
    let mut best = check_number(vm, &ctx, 0, "max")?;
    for i in 1..ctx.num_args {
        let x = check_number(vm, &ctx, i, "max")?;
        if x > best {
            best = x;
        }
    }
    unsafe { *ctx.slot(0) = TValue::double(best) };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(math_min, (vm, ctx) {
    let mut best = check_number(vm, &ctx, 0, "min")?;
    for i in 1..ctx.num_args {
        let x = check_number(vm, &ctx, i, "min")?;
        if x < best {
            best = x;
        }
    }
    unsafe { *ctx.slot(0) = TValue::double(best) };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(math_modf, (vm, ctx) {
    let x = check_number(vm, &ctx, 0, "modf")?;
    let int_part = x.trunc();
    unsafe {
        *ctx.slot(0) = TValue::double(int_part);
        *ctx.slot(1) = TValue::double(x - int_part);
    }
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 2 })
});

#[inline]
fn next_random(state: &mut u64) -> f64 {
    // xorshift64*, high 53 bits scaled into [0, 1).
    let mut x = *state;
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    *state = x;
    let bits = x.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 11;
    bits as f64 / (1u64 << 53) as f64
}

define_lib_func!(math_random, (vm, ctx) {
    let r = next_random(&mut vm.random_state);
    let result = match ctx.num_args {
        0 => r,
        1 => {
            let m = check_number(vm, &ctx, 0, "random")?;
            if m < 1.0 {
                return Err(vm.throw_str("bad argument #1 to 'random' (interval is empty)"));
            }
            (r * m).floor() + 1.0
        }
        _ => {
            let lo = check_number(vm, &ctx, 0, "random")?;
            let hi = check_number(vm, &ctx, 1, "random")?;
            if lo > hi {
                return Err(vm.throw_str("bad argument #2 to 'random' (interval is empty)"));
            }
            lo + (r * (hi - lo + 1.0)).floor()
        }
    };
    unsafe { *ctx.slot(0) = TValue::double(result) };
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 1 })
});

define_lib_func!(math_randomseed, (vm, ctx) {
    let seed = check_number(vm, &ctx, 0, "randomseed")?;
    let bits = seed.to_bits() | 1; // the generator state must be non-zero
    vm.random_state = bits;
    Ok(LibFnAction::ReturnRange { start: ctx.base, num: 0 })
});
