//! `List` primitives.

use builtins::range_extent;
use core_types::Value;

use crate::config::PrimitiveResult;
use crate::core::string::validate_index;
use crate::core::{bind_primitive, metaclass_of, prim_error, validate_int};
use crate::heap::ObjKind;
use crate::vm::Vm;

pub(super) fn bind(vm: &mut Vm) {
    let list = vm.core.list.unwrap();

    bind_primitive(vm, list, "[_]", list_subscript);
    bind_primitive(vm, list, "[_]=(_)", list_subscript_setter);
    bind_primitive(vm, list, "add(_)", list_add);
    bind_primitive(vm, list, "addCore_(_)", list_add_core);
    bind_primitive(vm, list, "clear()", list_clear);
    bind_primitive(vm, list, "count", list_count);
    bind_primitive(vm, list, "insert(_,_)", list_insert);
    bind_primitive(vm, list, "iterate(_)", list_iterate);
    bind_primitive(vm, list, "iteratorValue(_)", list_iterator_value);
    bind_primitive(vm, list, "removeAt(_)", list_remove_at);
    bind_primitive(vm, list, "remove(_)", list_remove_value);
    bind_primitive(vm, list, "indexOf(_)", list_index_of);
    bind_primitive(vm, list, "swap(_,_)", list_swap);

    let statics = metaclass_of(vm, list);
    bind_primitive(vm, statics, "filled(_,_)", list_filled);
    bind_primitive(vm, statics, "new()", list_new);
}

fn receiver(vm: &Vm, args: usize) -> core_types::ObjId {
    vm.parg(args, 0).as_obj()
}

fn list_new(vm: &mut Vm, _args: usize) -> PrimitiveResult {
    let id = vm.new_list(Vec::new());
    PrimitiveResult::Value(Value::obj(id))
}

fn list_filled(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let size = validate_int!(vm, args, 1, "Size");
    if size < 0.0 {
        prim_error!(vm, "Size cannot be negative.");
    }
    let element = vm.parg(args, 2);
    let id = vm.new_list(vec![element; size as usize]);
    PrimitiveResult::Value(Value::obj(id))
}

fn list_subscript(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let list = receiver(vm, args);
    let argument = vm.parg(args, 1);
    let count = vm.heap.list(list).elements.len();

    if argument.is_num() {
        let Ok(index) = validate_index(vm, args, 1, count) else {
            return PrimitiveResult::Error;
        };
        return PrimitiveResult::Value(vm.heap.list(list).elements[index]);
    }

    let range = match argument.try_obj() {
        Some(id) => match &vm.heap.get(id).kind {
            ObjKind::Range(range) => *range,
            _ => prim_error!(vm, "Subscript must be a number or a range."),
        },
        None => prim_error!(vm, "Subscript must be a number or a range."),
    };

    let extent = match range_extent(range.from, range.to, range.is_inclusive, count) {
        Ok(extent) => extent,
        Err(message) => prim_error!(vm, "{message}"),
    };

    let mut elements = Vec::with_capacity(extent.length);
    for i in 0..extent.length {
        let index = (extent.start as isize + i as isize * extent.step as isize) as usize;
        elements.push(vm.heap.list(list).elements[index]);
    }
    let id = vm.new_list(elements);
    PrimitiveResult::Value(Value::obj(id))
}

fn list_subscript_setter(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let list = receiver(vm, args);
    let count = vm.heap.list(list).elements.len();
    let Ok(index) = validate_index(vm, args, 1, count) else {
        return PrimitiveResult::Error;
    };
    let value = vm.parg(args, 2);
    vm.heap.list_mut(list).elements[index] = value;
    PrimitiveResult::Value(value)
}

fn list_add(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let list = receiver(vm, args);
    let value = vm.parg(args, 1);
    vm.heap.list_mut(list).elements.push(value);
    vm.heap.add_bytes(std::mem::size_of::<Value>());
    PrimitiveResult::Value(value)
}

/// Like `add` but returns the list, so literal construction can chain.
fn list_add_core(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let list = receiver(vm, args);
    let value = vm.parg(args, 1);
    vm.heap.list_mut(list).elements.push(value);
    vm.heap.add_bytes(std::mem::size_of::<Value>());
    PrimitiveResult::Value(vm.parg(args, 0))
}

fn list_clear(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let list = receiver(vm, args);
    vm.heap.list_mut(list).elements.clear();
    PrimitiveResult::Value(Value::NULL)
}

fn list_count(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let count = vm.heap.list(receiver(vm, args)).elements.len();
    PrimitiveResult::Value(Value::num(count as f64))
}

fn list_insert(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let list = receiver(vm, args);
    let count = vm.heap.list(list).elements.len();
    // count is a valid index here: it appends.
    let Ok(index) = validate_index(vm, args, 1, count + 1) else {
        return PrimitiveResult::Error;
    };
    let value = vm.parg(args, 2);
    vm.heap.list_mut(list).elements.insert(index, value);
    vm.heap.add_bytes(std::mem::size_of::<Value>());
    PrimitiveResult::Value(value)
}

fn list_iterate(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let count = vm.heap.list(receiver(vm, args)).elements.len();
    let argument = vm.parg(args, 1);

    if argument.is_null() {
        if count == 0 {
            return PrimitiveResult::Value(Value::FALSE);
        }
        return PrimitiveResult::Value(Value::num(0.0));
    }

    let index = validate_int!(vm, args, 1, "Iterator");
    // Stop when the iterator reaches the last element.
    if index < 0.0 || index >= count as f64 - 1.0 {
        return PrimitiveResult::Value(Value::FALSE);
    }
    PrimitiveResult::Value(Value::num(index + 1.0))
}

fn list_iterator_value(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let list = receiver(vm, args);
    let count = vm.heap.list(list).elements.len();
    let Ok(index) = validate_index(vm, args, 1, count) else {
        return PrimitiveResult::Error;
    };
    PrimitiveResult::Value(vm.heap.list(list).elements[index])
}

fn list_remove_at(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let list = receiver(vm, args);
    let count = vm.heap.list(list).elements.len();
    let Ok(index) = validate_index(vm, args, 1, count) else {
        return PrimitiveResult::Error;
    };
    let removed = vm.heap.list_mut(list).elements.remove(index);
    PrimitiveResult::Value(removed)
}

fn list_remove_value(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let list = receiver(vm, args);
    let target = vm.parg(args, 1);
    let position = {
        let elements = &vm.heap.list(list).elements;
        elements.iter().position(|e| vm.heap.values_equal(*e, target))
    };
    match position {
        Some(index) => {
            let removed = vm.heap.list_mut(list).elements.remove(index);
            PrimitiveResult::Value(removed)
        }
        None => PrimitiveResult::Value(Value::NULL),
    }
}

fn list_index_of(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let list = receiver(vm, args);
    let target = vm.parg(args, 1);
    let position = {
        let elements = &vm.heap.list(list).elements;
        elements.iter().position(|e| vm.heap.values_equal(*e, target))
    };
    let index = position.map(|i| i as f64).unwrap_or(-1.0);
    PrimitiveResult::Value(Value::num(index))
}

fn list_swap(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let list = receiver(vm, args);
    let count = vm.heap.list(list).elements.len();
    let Ok(a) = validate_index(vm, args, 1, count) else {
        return PrimitiveResult::Error;
    };
    let Ok(b) = validate_index(vm, args, 2, count) else {
        return PrimitiveResult::Error;
    };
    vm.heap.list_mut(list).elements.swap(a, b);
    PrimitiveResult::Value(Value::NULL)
}
