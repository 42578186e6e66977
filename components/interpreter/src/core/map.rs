//! `Map` primitives.

use core_types::Value;

use crate::config::PrimitiveResult;
use crate::core::{bind_primitive, metaclass_of, validate_int};
use crate::map::ObjMap;
use crate::vm::Vm;

pub(super) fn bind(vm: &mut Vm) {
    let map = vm.core.map.unwrap();

    bind_primitive(vm, map, "[_]", map_subscript);
    bind_primitive(vm, map, "[_]=(_)", map_subscript_setter);
    bind_primitive(vm, map, "addCore_(_,_)", map_add_core);
    bind_primitive(vm, map, "clear()", map_clear);
    bind_primitive(vm, map, "containsKey(_)", map_contains_key);
    bind_primitive(vm, map, "count", map_count);
    bind_primitive(vm, map, "iterate(_)", map_iterate);
    bind_primitive(vm, map, "keyIteratorValue_(_)", map_key_iterator_value);
    bind_primitive(vm, map, "valueIteratorValue_(_)", map_value_iterator_value);
    bind_primitive(vm, map, "remove(_)", map_remove);

    let statics = metaclass_of(vm, map);
    bind_primitive(vm, statics, "new()", map_new);
}

fn receiver(vm: &Vm, args: usize) -> core_types::ObjId {
    vm.parg(args, 0).as_obj()
}

fn validate_key(vm: &mut Vm, args: usize) -> Result<Value, ()> {
    let key = vm.parg(args, 1);
    if ObjMap::is_valid_key(&vm.heap, key) {
        Ok(key)
    } else {
        vm.set_error_str("Key must be a value type.");
        Err(())
    }
}

fn map_new(vm: &mut Vm, _args: usize) -> PrimitiveResult {
    let id = vm.new_map();
    PrimitiveResult::Value(Value::obj(id))
}

fn map_subscript(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let map = receiver(vm, args);
    let Ok(key) = validate_key(vm, args) else {
        return PrimitiveResult::Error;
    };
    let value = vm.map_get(map, key).unwrap_or(Value::NULL);
    PrimitiveResult::Value(value)
}

fn map_subscript_setter(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let map = receiver(vm, args);
    let Ok(key) = validate_key(vm, args) else {
        return PrimitiveResult::Error;
    };
    let value = vm.parg(args, 2);
    vm.map_set(map, key, value);
    PrimitiveResult::Value(value)
}

/// Like the subscript setter but returns the map, so literal construction
/// can chain.
fn map_add_core(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let map = receiver(vm, args);
    let Ok(key) = validate_key(vm, args) else {
        return PrimitiveResult::Error;
    };
    let value = vm.parg(args, 2);
    vm.map_set(map, key, value);
    PrimitiveResult::Value(vm.parg(args, 0))
}

fn map_clear(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let map = receiver(vm, args);
    vm.map_clear(map);
    PrimitiveResult::Value(Value::NULL)
}

fn map_contains_key(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let map = receiver(vm, args);
    let Ok(key) = validate_key(vm, args) else {
        return PrimitiveResult::Error;
    };
    let contains = vm.map_ref(map).contains_key(&vm.heap, key);
    PrimitiveResult::Value(Value::from_bool(contains))
}

fn map_count(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let count = vm.map_ref(receiver(vm, args)).len();
    PrimitiveResult::Value(Value::num(count as f64))
}

fn map_iterate(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let map = receiver(vm, args);
    let capacity = vm.map_ref(map).capacity();
    if capacity == 0 {
        return PrimitiveResult::Value(Value::FALSE);
    }

    let mut index = 0;
    let argument = vm.parg(args, 1);
    if !argument.is_null() {
        let iterator = validate_int!(vm, args, 1, "Iterator");
        if iterator < 0.0 {
            return PrimitiveResult::Value(Value::FALSE);
        }
        index = iterator as usize;
        if index >= capacity {
            return PrimitiveResult::Value(Value::FALSE);
        }
        index += 1;
    }

    let entries = vm.map_ref(map).entries();
    for (position, entry) in entries.iter().enumerate().skip(index) {
        if entry.is_used() {
            return PrimitiveResult::Value(Value::num(position as f64));
        }
    }
    PrimitiveResult::Value(Value::FALSE)
}

fn map_entry(vm: &mut Vm, args: usize) -> Result<(Value, Value), ()> {
    let map = receiver(vm, args);
    let capacity = vm.map_ref(map).capacity();
    let index = crate::core::string::validate_index(vm, args, 1, capacity)?;
    let entry = vm.map_ref(map).entries()[index];
    if !entry.is_used() {
        vm.set_error_str("Invalid map iterator.");
        return Err(());
    }
    Ok((entry.key, entry.value))
}

fn map_key_iterator_value(vm: &mut Vm, args: usize) -> PrimitiveResult {
    match map_entry(vm, args) {
        Ok((key, _)) => PrimitiveResult::Value(key),
        Err(()) => PrimitiveResult::Error,
    }
}

fn map_value_iterator_value(vm: &mut Vm, args: usize) -> PrimitiveResult {
    match map_entry(vm, args) {
        Ok((_, value)) => PrimitiveResult::Value(value),
        Err(()) => PrimitiveResult::Error,
    }
}

fn map_remove(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let map = receiver(vm, args);
    let Ok(key) = validate_key(vm, args) else {
        return PrimitiveResult::Error;
    };
    let removed = vm.map_remove(map, key).unwrap_or(Value::NULL);
    PrimitiveResult::Value(removed)
}
