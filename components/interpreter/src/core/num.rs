//! `Num` primitives.
//!
//! Arithmetic and comparison operators require a numeric right operand;
//! bitwise operators work on the 32-bit unsigned truncation of the value.

use builtins::{num_bits_to_u32, num_to_string};
use core_types::Value;

use crate::config::PrimitiveResult;
use crate::core::{bind_primitive, metaclass_of, validate_num};
use crate::vm::Vm;

pub(super) fn bind(vm: &mut Vm) {
    let num = vm.core.num.unwrap();

    bind_primitive(vm, num, "+(_)", num_plus);
    bind_primitive(vm, num, "-(_)", num_minus);
    bind_primitive(vm, num, "*(_)", num_times);
    bind_primitive(vm, num, "/(_)", num_divide);
    bind_primitive(vm, num, "%(_)", num_mod);
    bind_primitive(vm, num, "-", num_negate);
    bind_primitive(vm, num, "<(_)", num_lt);
    bind_primitive(vm, num, ">(_)", num_gt);
    bind_primitive(vm, num, "<=(_)", num_le);
    bind_primitive(vm, num, ">=(_)", num_ge);
    bind_primitive(vm, num, "==(_)", num_eqeq);
    bind_primitive(vm, num, "!=(_)", num_bangeq);
    bind_primitive(vm, num, "&(_)", num_bit_and);
    bind_primitive(vm, num, "|(_)", num_bit_or);
    bind_primitive(vm, num, "^(_)", num_bit_xor);
    bind_primitive(vm, num, "~", num_bit_not);
    bind_primitive(vm, num, "<<(_)", num_shl);
    bind_primitive(vm, num, ">>(_)", num_shr);
    bind_primitive(vm, num, "..(_)", num_range_inclusive);
    bind_primitive(vm, num, "...(_)", num_range_exclusive);

    bind_primitive(vm, num, "abs", num_abs);
    bind_primitive(vm, num, "acos", num_acos);
    bind_primitive(vm, num, "asin", num_asin);
    bind_primitive(vm, num, "atan", num_atan);
    bind_primitive(vm, num, "atan(_)", num_atan2);
    bind_primitive(vm, num, "cbrt", num_cbrt);
    bind_primitive(vm, num, "ceil", num_ceil);
    bind_primitive(vm, num, "cos", num_cos);
    bind_primitive(vm, num, "exp", num_exp);
    bind_primitive(vm, num, "floor", num_floor);
    bind_primitive(vm, num, "fraction", num_fraction);
    bind_primitive(vm, num, "isInfinity", num_is_infinity);
    bind_primitive(vm, num, "isNan", num_is_nan);
    bind_primitive(vm, num, "log", num_log);
    bind_primitive(vm, num, "log2", num_log2);
    bind_primitive(vm, num, "pow(_)", num_pow);
    bind_primitive(vm, num, "round", num_round);
    bind_primitive(vm, num, "sign", num_sign);
    bind_primitive(vm, num, "sin", num_sin);
    bind_primitive(vm, num, "sqrt", num_sqrt);
    bind_primitive(vm, num, "tan", num_tan);
    bind_primitive(vm, num, "truncate", num_truncate);
    bind_primitive(vm, num, "min(_)", num_min);
    bind_primitive(vm, num, "max(_)", num_max);
    bind_primitive(vm, num, "clamp(_,_)", num_clamp);
    bind_primitive(vm, num, "toString", num_to_string_prim);

    let statics = metaclass_of(vm, num);
    bind_primitive(vm, statics, "infinity", num_infinity);
    bind_primitive(vm, statics, "nan", num_nan);
    bind_primitive(vm, statics, "pi", num_pi);
    bind_primitive(vm, statics, "tau", num_tau);
    bind_primitive(vm, statics, "largest", num_largest);
    bind_primitive(vm, statics, "smallest", num_smallest);
    bind_primitive(vm, statics, "maxSafeInteger", num_max_safe);
    bind_primitive(vm, statics, "minSafeInteger", num_min_safe);
}

fn receiver(vm: &Vm, args: usize) -> f64 {
    vm.parg(args, 0).as_num()
}

macro_rules! arith {
    ($name:ident, $op:tt) => {
        fn $name(vm: &mut Vm, args: usize) -> PrimitiveResult {
            let rhs = validate_num!(vm, args, 1, "Right operand");
            PrimitiveResult::Value(Value::num(receiver(vm, args) $op rhs))
        }
    };
}

arith!(num_plus, +);
arith!(num_minus, -);
arith!(num_times, *);
arith!(num_divide, /);

fn num_mod(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let rhs = validate_num!(vm, args, 1, "Right operand");
    PrimitiveResult::Value(Value::num(receiver(vm, args) % rhs))
}

fn num_negate(vm: &mut Vm, args: usize) -> PrimitiveResult {
    PrimitiveResult::Value(Value::num(-receiver(vm, args)))
}

macro_rules! compare {
    ($name:ident, $op:tt) => {
        fn $name(vm: &mut Vm, args: usize) -> PrimitiveResult {
            let rhs = validate_num!(vm, args, 1, "Right operand");
            PrimitiveResult::Value(Value::from_bool(receiver(vm, args) $op rhs))
        }
    };
}

compare!(num_lt, <);
compare!(num_gt, >);
compare!(num_le, <=);
compare!(num_ge, >=);

fn num_eqeq(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let equal = match vm.parg(args, 1).try_num() {
        Some(rhs) => receiver(vm, args) == rhs,
        None => false,
    };
    PrimitiveResult::Value(Value::from_bool(equal))
}

fn num_bangeq(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let equal = match vm.parg(args, 1).try_num() {
        Some(rhs) => receiver(vm, args) == rhs,
        None => false,
    };
    PrimitiveResult::Value(Value::from_bool(!equal))
}

macro_rules! bitwise {
    ($name:ident, $op:tt) => {
        fn $name(vm: &mut Vm, args: usize) -> PrimitiveResult {
            let rhs = validate_num!(vm, args, 1, "Right operand");
            let result = num_bits_to_u32(receiver(vm, args)) $op num_bits_to_u32(rhs);
            PrimitiveResult::Value(Value::num(result as f64))
        }
    };
}

bitwise!(num_bit_and, &);
bitwise!(num_bit_or, |);
bitwise!(num_bit_xor, ^);

fn num_bit_not(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let result = !num_bits_to_u32(receiver(vm, args));
    PrimitiveResult::Value(Value::num(result as f64))
}

fn num_shl(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let rhs = validate_num!(vm, args, 1, "Right operand");
    let result = num_bits_to_u32(receiver(vm, args)).wrapping_shl(num_bits_to_u32(rhs));
    PrimitiveResult::Value(Value::num(result as f64))
}

fn num_shr(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let rhs = validate_num!(vm, args, 1, "Right operand");
    let result = num_bits_to_u32(receiver(vm, args)).wrapping_shr(num_bits_to_u32(rhs));
    PrimitiveResult::Value(Value::num(result as f64))
}

fn num_range_inclusive(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let to = match vm.parg(args, 1).try_num() {
        Some(n) => n,
        None => {
            vm.set_error_str("Right hand side of range must be a number.");
            return PrimitiveResult::Error;
        }
    };
    let range = vm.new_range(receiver(vm, args), to, true);
    PrimitiveResult::Value(Value::obj(range))
}

fn num_range_exclusive(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let to = match vm.parg(args, 1).try_num() {
        Some(n) => n,
        None => {
            vm.set_error_str("Right hand side of range must be a number.");
            return PrimitiveResult::Error;
        }
    };
    let range = vm.new_range(receiver(vm, args), to, false);
    PrimitiveResult::Value(Value::obj(range))
}

macro_rules! math_fn {
    ($name:ident, $method:ident) => {
        fn $name(vm: &mut Vm, args: usize) -> PrimitiveResult {
            PrimitiveResult::Value(Value::num(receiver(vm, args).$method()))
        }
    };
}

math_fn!(num_abs, abs);
math_fn!(num_acos, acos);
math_fn!(num_asin, asin);
math_fn!(num_atan, atan);
math_fn!(num_cbrt, cbrt);
math_fn!(num_ceil, ceil);
math_fn!(num_cos, cos);
math_fn!(num_exp, exp);
math_fn!(num_floor, floor);
math_fn!(num_log, ln);
math_fn!(num_log2, log2);
math_fn!(num_round, round);
math_fn!(num_sin, sin);
math_fn!(num_sqrt, sqrt);
math_fn!(num_tan, tan);
math_fn!(num_truncate, trunc);
math_fn!(num_fraction, fract);

fn num_atan2(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let divisor = validate_num!(vm, args, 1, "x value");
    PrimitiveResult::Value(Value::num(receiver(vm, args).atan2(divisor)))
}

fn num_pow(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let power = validate_num!(vm, args, 1, "Power value");
    PrimitiveResult::Value(Value::num(receiver(vm, args).powf(power)))
}

fn num_is_infinity(vm: &mut Vm, args: usize) -> PrimitiveResult {
    PrimitiveResult::Value(Value::from_bool(receiver(vm, args).is_infinite()))
}

fn num_is_nan(vm: &mut Vm, args: usize) -> PrimitiveResult {
    PrimitiveResult::Value(Value::from_bool(receiver(vm, args).is_nan()))
}

fn num_sign(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let value = receiver(vm, args);
    let sign = if value > 0.0 {
        1.0
    } else if value < 0.0 {
        -1.0
    } else {
        0.0
    };
    PrimitiveResult::Value(Value::num(sign))
}

fn num_min(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let other = validate_num!(vm, args, 1, "Other value");
    let value = receiver(vm, args);
    PrimitiveResult::Value(Value::num(if other < value { other } else { value }))
}

fn num_max(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let other = validate_num!(vm, args, 1, "Other value");
    let value = receiver(vm, args);
    PrimitiveResult::Value(Value::num(if other > value { other } else { value }))
}

fn num_clamp(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let min = validate_num!(vm, args, 1, "Min value");
    let max = validate_num!(vm, args, 2, "Max value");
    let value = receiver(vm, args);
    let clamped = if value < min {
        min
    } else if value > max {
        max
    } else {
        value
    };
    PrimitiveResult::Value(Value::num(clamped))
}

fn num_to_string_prim(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let text = num_to_string(receiver(vm, args));
    let value = vm.string_value(&text);
    PrimitiveResult::Value(value)
}

fn num_infinity(_vm: &mut Vm, _args: usize) -> PrimitiveResult {
    PrimitiveResult::Value(Value::num(f64::INFINITY))
}

fn num_nan(_vm: &mut Vm, _args: usize) -> PrimitiveResult {
    PrimitiveResult::Value(Value::num(f64::NAN))
}

fn num_pi(_vm: &mut Vm, _args: usize) -> PrimitiveResult {
    PrimitiveResult::Value(Value::num(std::f64::consts::PI))
}

fn num_tau(_vm: &mut Vm, _args: usize) -> PrimitiveResult {
    PrimitiveResult::Value(Value::num(std::f64::consts::TAU))
}

fn num_largest(_vm: &mut Vm, _args: usize) -> PrimitiveResult {
    PrimitiveResult::Value(Value::num(f64::MAX))
}

fn num_smallest(_vm: &mut Vm, _args: usize) -> PrimitiveResult {
    PrimitiveResult::Value(Value::num(f64::MIN_POSITIVE))
}

fn num_max_safe(_vm: &mut Vm, _args: usize) -> PrimitiveResult {
    PrimitiveResult::Value(Value::num(9007199254740991.0))
}

fn num_min_safe(_vm: &mut Vm, _args: usize) -> PrimitiveResult {
    PrimitiveResult::Value(Value::num(-9007199254740991.0))
}
