//! `String` primitives.
//!
//! Strings are byte arrays. Subscripting is byte-indexed: an index that
//! lands on a UTF-8 sequence start yields the whole code point as a
//! string, while one that lands mid-sequence yields the single byte.

use builtins::{find_bytes, range_extent, utf8};
use core_types::Value;

use crate::config::PrimitiveResult;
use crate::core::{bind_primitive, metaclass_of, prim_error, validate_int, validate_string};
use crate::heap::ObjKind;
use crate::vm::Vm;

pub(super) fn bind(vm: &mut Vm) {
    let string = vm.core.string.unwrap();

    bind_primitive(vm, string, "+(_)", string_plus);
    bind_primitive(vm, string, "[_]", string_subscript);
    bind_primitive(vm, string, "byteAt(_)", string_byte_at);
    bind_primitive(vm, string, "byteCount", string_byte_count);
    bind_primitive(vm, string, "codePointAt(_)", string_code_point_at);
    bind_primitive(vm, string, "contains(_)", string_contains);
    bind_primitive(vm, string, "endsWith(_)", string_ends_with);
    bind_primitive(vm, string, "indexOf(_)", string_index_of1);
    bind_primitive(vm, string, "indexOf(_,_)", string_index_of2);
    bind_primitive(vm, string, "iterate(_)", string_iterate);
    bind_primitive(vm, string, "iterateByte(_)", string_iterate_byte);
    bind_primitive(vm, string, "iteratorValue(_)", string_iterator_value);
    bind_primitive(vm, string, "toString", string_to_string);
    bind_primitive(vm, string, "$", string_dollar);

    let statics = metaclass_of(vm, string);
    bind_primitive(vm, statics, "fromCodePoint(_)", string_from_code_point);
    bind_primitive(vm, statics, "fromByte(_)", string_from_byte);
}

fn receiver_bytes(vm: &Vm, args: usize) -> Vec<u8> {
    vm.heap.string(vm.parg(args, 0).as_obj()).bytes.to_vec()
}

fn string_plus(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let rhs = validate_string!(vm, args, 1, "Right operand");
    let mut bytes = receiver_bytes(vm, args);
    bytes.extend_from_slice(&vm.heap.string(rhs).bytes);
    let id = vm.new_string(bytes);
    PrimitiveResult::Value(Value::obj(id))
}

/// The code-point-sized string starting at byte `index`, or the single
/// byte when `index` is inside a sequence.
fn code_point_string(vm: &mut Vm, bytes: &[u8], index: usize) -> Value {
    let width = match utf8::decode(&bytes[index..]) {
        Some((_, width)) => width,
        None => 1,
    };
    let id = vm.new_string(bytes[index..index + width].to_vec());
    Value::obj(id)
}

fn string_subscript(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let bytes = receiver_bytes(vm, args);
    let argument = vm.parg(args, 1);

    if argument.is_num() {
        let index = argument.as_num();
        if index.trunc() != index || !index.is_finite() {
            prim_error!(vm, "Subscript must be an integer.");
        }
        let index = if index < 0.0 { index + bytes.len() as f64 } else { index };
        if index < 0.0 || index >= bytes.len() as f64 {
            prim_error!(vm, "Subscript out of bounds.");
        }
        return PrimitiveResult::Value(code_point_string(vm, &bytes, index as usize));
    }

    let range = match argument.try_obj() {
        Some(id) => match &vm.heap.get(id).kind {
            ObjKind::Range(range) => *range,
            _ => prim_error!(vm, "Subscript must be a number or a range."),
        },
        None => prim_error!(vm, "Subscript must be a number or a range."),
    };

    let extent = match range_extent(range.from, range.to, range.is_inclusive, bytes.len()) {
        Ok(extent) => extent,
        Err(message) => prim_error!(vm, "{message}"),
    };

    // Copy code points walking byte indices in range order.
    let mut result = Vec::new();
    for i in 0..extent.length {
        let index = (extent.start as isize + i as isize * extent.step as isize) as usize;
        match utf8::decode(&bytes[index..]) {
            Some((code_point, _)) => {
                utf8::encode(code_point, &mut result);
            }
            None => result.push(bytes[index]),
        }
    }
    let id = vm.new_string(result);
    PrimitiveResult::Value(Value::obj(id))
}

fn string_byte_at(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let bytes = receiver_bytes(vm, args);
    let Ok(index) = validate_index(vm, args, 1, bytes.len()) else {
        return PrimitiveResult::Error;
    };
    PrimitiveResult::Value(Value::num(bytes[index] as f64))
}

/// Validate an index argument against `length`, allowing negatives to
/// count back from the end. The error is reported before returning.
pub(super) fn validate_index(
    vm: &mut Vm,
    args: usize,
    i: usize,
    length: usize,
) -> Result<usize, ()> {
    let value = match vm.parg(args, i).try_num() {
        Some(n) => n,
        None => {
            vm.set_error_str("Index must be a number.");
            return Err(());
        }
    };
    if value.trunc() != value || !value.is_finite() {
        vm.set_error_str("Index must be an integer.");
        return Err(());
    }
    let adjusted = if value < 0.0 { value + length as f64 } else { value };
    if adjusted < 0.0 || adjusted >= length as f64 {
        vm.set_error_str("Index out of bounds.");
        return Err(());
    }
    Ok(adjusted as usize)
}

fn string_byte_count(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let count = vm.heap.string(vm.parg(args, 0).as_obj()).bytes.len();
    PrimitiveResult::Value(Value::num(count as f64))
}

fn string_code_point_at(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let bytes = receiver_bytes(vm, args);
    let Ok(index) = validate_index(vm, args, 1, bytes.len()) else {
        return PrimitiveResult::Error;
    };
    let code_point = match utf8::decode(&bytes[index..]) {
        Some((code_point, _)) => code_point as f64,
        None => -1.0,
    };
    PrimitiveResult::Value(Value::num(code_point))
}

fn string_contains(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let needle = validate_string!(vm, args, 1, "Argument");
    let haystack = receiver_bytes(vm, args);
    let needle = vm.heap.string(needle).bytes.to_vec();
    let found = find_bytes(&haystack, &needle, 0).is_some();
    PrimitiveResult::Value(Value::from_bool(found))
}

fn string_ends_with(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let suffix = validate_string!(vm, args, 1, "Argument");
    let bytes = receiver_bytes(vm, args);
    let suffix = vm.heap.string(suffix).bytes.to_vec();
    PrimitiveResult::Value(Value::from_bool(bytes.ends_with(&suffix)))
}

fn string_index_of1(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let needle = validate_string!(vm, args, 1, "Argument");
    let haystack = receiver_bytes(vm, args);
    let needle = vm.heap.string(needle).bytes.to_vec();
    let index = find_bytes(&haystack, &needle, 0).map(|i| i as f64).unwrap_or(-1.0);
    PrimitiveResult::Value(Value::num(index))
}

fn string_index_of2(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let needle = validate_string!(vm, args, 1, "Argument");
    let haystack = receiver_bytes(vm, args);
    let Ok(start) = validate_index(vm, args, 2, haystack.len() + 1) else {
        return PrimitiveResult::Error;
    };
    let needle = vm.heap.string(needle).bytes.to_vec();
    let index = find_bytes(&haystack, &needle, start).map(|i| i as f64).unwrap_or(-1.0);
    PrimitiveResult::Value(Value::num(index))
}

fn string_iterate(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let bytes = receiver_bytes(vm, args);
    let argument = vm.parg(args, 1);

    if argument.is_null() {
        if bytes.is_empty() {
            return PrimitiveResult::Value(Value::FALSE);
        }
        return PrimitiveResult::Value(Value::num(0.0));
    }

    let iterator = validate_int!(vm, args, 1, "Iterator");
    if iterator < 0.0 {
        return PrimitiveResult::Value(Value::FALSE);
    }
    // Advance to the start of the next code point.
    let mut index = iterator as usize + 1;
    while index < bytes.len() && bytes[index] & 0xc0 == 0x80 {
        index += 1;
    }
    if index >= bytes.len() {
        return PrimitiveResult::Value(Value::FALSE);
    }
    PrimitiveResult::Value(Value::num(index as f64))
}

fn string_iterate_byte(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let bytes = receiver_bytes(vm, args);
    let argument = vm.parg(args, 1);

    if argument.is_null() {
        if bytes.is_empty() {
            return PrimitiveResult::Value(Value::FALSE);
        }
        return PrimitiveResult::Value(Value::num(0.0));
    }

    let iterator = validate_int!(vm, args, 1, "Iterator");
    if iterator < 0.0 || iterator as usize + 1 >= bytes.len() {
        return PrimitiveResult::Value(Value::FALSE);
    }
    PrimitiveResult::Value(Value::num(iterator + 1.0))
}

fn string_iterator_value(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let bytes = receiver_bytes(vm, args);
    let Ok(index) = validate_index(vm, args, 1, bytes.len()) else {
        return PrimitiveResult::Error;
    };
    PrimitiveResult::Value(code_point_string(vm, &bytes, index))
}

fn string_to_string(vm: &mut Vm, args: usize) -> PrimitiveResult {
    PrimitiveResult::Value(vm.parg(args, 0))
}

/// The `$` host hook: hands the string to the configured callback through
/// the slot API, or yields null when no hook is installed.
fn string_dollar(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let Some(hook) = vm.config.dollar_operator_fn else {
        return PrimitiveResult::Value(Value::NULL);
    };
    let fiber = vm.current_fiber();
    let previous = vm.api_stack;
    vm.api_stack = Some(crate::vm::ApiStack { fiber, start: args });
    hook(vm);
    let result = vm.parg(args, 0);
    vm.api_stack = previous;
    if vm.heap.fiber(fiber).has_error() {
        return PrimitiveResult::Error;
    }
    PrimitiveResult::Value(result)
}

fn string_from_code_point(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let code_point = validate_int!(vm, args, 1, "Code point");
    if code_point < 0.0 {
        prim_error!(vm, "Code point cannot be negative.");
    }
    if code_point > 0x10ffff as f64 {
        prim_error!(vm, "Code point out of bounds.");
    }
    let mut bytes = Vec::new();
    if utf8::encode(code_point as u32, &mut bytes) == 0 {
        prim_error!(vm, "Code point out of bounds.");
    }
    let id = vm.new_string(bytes);
    PrimitiveResult::Value(Value::obj(id))
}

fn string_from_byte(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let byte = validate_int!(vm, args, 1, "Byte");
    if byte < 0.0 {
        prim_error!(vm, "Byte cannot be negative.");
    }
    if byte > 255.0 {
        prim_error!(vm, "Byte out of bounds.");
    }
    let id = vm.new_string(vec![byte as u8]);
    PrimitiveResult::Value(Value::obj(id))
}
