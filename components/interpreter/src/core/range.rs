//! `Range` primitives.

use builtins::num_to_string;
use core_types::Value;

use crate::config::PrimitiveResult;
use crate::core::{bind_primitive, validate_num};
use crate::heap::ObjRange;
use crate::vm::Vm;

pub(super) fn bind(vm: &mut Vm) {
    let range = vm.core.range.unwrap();

    bind_primitive(vm, range, "from", range_from);
    bind_primitive(vm, range, "to", range_to);
    bind_primitive(vm, range, "min", range_min);
    bind_primitive(vm, range, "max", range_max);
    bind_primitive(vm, range, "isInclusive", range_is_inclusive);
    bind_primitive(vm, range, "iterate(_)", range_iterate);
    bind_primitive(vm, range, "iteratorValue(_)", range_iterator_value);
    bind_primitive(vm, range, "toString", range_to_string);
}

fn receiver(vm: &Vm, args: usize) -> ObjRange {
    vm.heap.range(vm.parg(args, 0).as_obj())
}

fn range_from(vm: &mut Vm, args: usize) -> PrimitiveResult {
    PrimitiveResult::Value(Value::num(receiver(vm, args).from))
}

fn range_to(vm: &mut Vm, args: usize) -> PrimitiveResult {
    PrimitiveResult::Value(Value::num(receiver(vm, args).to))
}

fn range_min(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let range = receiver(vm, args);
    PrimitiveResult::Value(Value::num(range.from.min(range.to)))
}

fn range_max(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let range = receiver(vm, args);
    PrimitiveResult::Value(Value::num(range.from.max(range.to)))
}

fn range_is_inclusive(vm: &mut Vm, args: usize) -> PrimitiveResult {
    PrimitiveResult::Value(Value::from_bool(receiver(vm, args).is_inclusive))
}

fn range_iterate(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let range = receiver(vm, args);

    // An empty exclusive range iterates nothing.
    if range.from == range.to && !range.is_inclusive {
        return PrimitiveResult::Value(Value::FALSE);
    }

    if vm.parg(args, 1).is_null() {
        return PrimitiveResult::Value(Value::num(range.from));
    }

    let mut iterator = validate_num!(vm, args, 1, "Iterator");
    if range.from < range.to {
        iterator += 1.0;
        if iterator > range.to {
            return PrimitiveResult::Value(Value::FALSE);
        }
    } else {
        iterator -= 1.0;
        if iterator < range.to {
            return PrimitiveResult::Value(Value::FALSE);
        }
    }
    if !range.is_inclusive && iterator == range.to {
        return PrimitiveResult::Value(Value::FALSE);
    }
    PrimitiveResult::Value(Value::num(iterator))
}

fn range_iterator_value(vm: &mut Vm, args: usize) -> PrimitiveResult {
    PrimitiveResult::Value(vm.parg(args, 1))
}

fn range_to_string(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let range = receiver(vm, args);
    let separator = if range.is_inclusive { ".." } else { "..." };
    let text = format!(
        "{}{}{}",
        num_to_string(range.from),
        separator,
        num_to_string(range.to)
    );
    let value = vm.string_value(&text);
    PrimitiveResult::Value(value)
}
