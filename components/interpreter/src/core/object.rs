//! `Object`, `Class`, `Bool`, and `Null` primitives.

use core_types::{ObjId, Value};

use crate::config::PrimitiveResult;
use crate::core::{bind_primitive, prim_error};
use crate::vm::Vm;

pub(super) fn bind_object(vm: &mut Vm, object: ObjId) {
    bind_primitive(vm, object, "!", object_not);
    bind_primitive(vm, object, "==(_)", object_eqeq);
    bind_primitive(vm, object, "!=(_)", object_bangeq);
    bind_primitive(vm, object, "is(_)", object_is);
    bind_primitive(vm, object, "toString", object_to_string);
    bind_primitive(vm, object, "type", object_type);
}

pub(super) fn bind_class(vm: &mut Vm, class: ObjId) {
    bind_primitive(vm, class, "name", class_name);
    bind_primitive(vm, class, "supertype", class_supertype);
    bind_primitive(vm, class, "toString", class_name);
    bind_primitive(vm, class, "attributes", class_attributes);
    // Metaclasses inherit from Class, so every class without an explicit
    // constructor gets this default zero-argument one.
    bind_primitive(vm, class, "new()", class_default_new);
}

pub(super) fn bind_bool_and_null(vm: &mut Vm) {
    let bool_class = vm.core.bool_.unwrap();
    bind_primitive(vm, bool_class, "!", bool_not);
    bind_primitive(vm, bool_class, "toString", bool_to_string);

    let null_class = vm.core.null.unwrap();
    bind_primitive(vm, null_class, "!", null_not);
    bind_primitive(vm, null_class, "toString", null_to_string);
}

fn object_not(_vm: &mut Vm, _args: usize) -> PrimitiveResult {
    PrimitiveResult::Value(Value::FALSE)
}

fn object_eqeq(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let equal = vm.heap.values_equal(vm.parg(args, 0), vm.parg(args, 1));
    PrimitiveResult::Value(Value::from_bool(equal))
}

fn object_bangeq(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let equal = vm.heap.values_equal(vm.parg(args, 0), vm.parg(args, 1));
    PrimitiveResult::Value(Value::from_bool(!equal))
}

fn object_is(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let target = vm.parg(args, 1);
    let is_class = target
        .try_obj()
        .is_some_and(|id| matches!(vm.heap.get(id).kind, crate::heap::ObjKind::Class(_)));
    if !is_class {
        prim_error!(vm, "Right operand must be a class.");
    }
    let target = target.as_obj();

    let mut class = Some(vm.class_of(vm.parg(args, 0)));
    while let Some(current) = class {
        if current == target {
            return PrimitiveResult::Value(Value::TRUE);
        }
        class = vm.heap.class(current).superclass;
    }
    PrimitiveResult::Value(Value::FALSE)
}

fn object_to_string(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let class = vm.class_of(vm.parg(args, 0));
    let name = vm.heap.class(class).name.clone();
    let text = vm.string_value(&format!("instance of {name}"));
    PrimitiveResult::Value(text)
}

fn object_type(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let class = vm.class_of(vm.parg(args, 0));
    PrimitiveResult::Value(Value::obj(class))
}

/// `Object.same(_,_)`, bound on Object's metaclass: identity comparison
/// that ignores any user-defined `==`.
pub(super) fn object_same(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let equal = vm.heap.values_equal(vm.parg(args, 1), vm.parg(args, 2));
    PrimitiveResult::Value(Value::from_bool(equal))
}

fn class_name(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let class = vm.parg(args, 0).as_obj();
    let name = vm.heap.class(class).name.clone();
    let text = vm.string_value(&name);
    PrimitiveResult::Value(text)
}

fn class_supertype(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let class = vm.parg(args, 0).as_obj();
    let supertype = match vm.heap.class(class).superclass {
        Some(superclass) => Value::obj(superclass),
        None => Value::NULL,
    };
    PrimitiveResult::Value(supertype)
}

fn class_attributes(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let class = vm.parg(args, 0).as_obj();
    PrimitiveResult::Value(vm.heap.class(class).attributes)
}

/// Default `new()`: allocate an instance with null fields. Built-in and
/// foreign classes are excluded; the latter need their allocator run by a
/// declared constructor.
fn class_default_new(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let receiver = vm.parg(args, 0);
    let class = match receiver.try_obj() {
        Some(id) if matches!(vm.heap.get(id).kind, crate::heap::ObjKind::Class(_)) => id,
        _ => prim_error!(vm, "Must provide a class to construct."),
    };
    let core = &vm.core;
    let builtin = [
        core.object, core.class, core.bool_, core.null, core.num, core.string, core.list,
        core.map, core.range, core.fiber, core.fn_,
    ]
    .contains(&Some(class));
    if builtin || vm.heap.class(class).num_fields.is_none() {
        let name = vm.heap.class(class).name.clone();
        prim_error!(vm, "{name} metaclass does not implement 'new()'.");
    }
    let instance = vm.new_instance(class);
    PrimitiveResult::Value(Value::obj(instance))
}

fn bool_not(vm: &mut Vm, args: usize) -> PrimitiveResult {
    PrimitiveResult::Value(Value::from_bool(!vm.parg(args, 0).is_true()))
}

fn bool_to_string(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let text = if vm.parg(args, 0).is_true() { "true" } else { "false" };
    let value = vm.string_value(text);
    PrimitiveResult::Value(value)
}

fn null_not(_vm: &mut Vm, _args: usize) -> PrimitiveResult {
    PrimitiveResult::Value(Value::TRUE)
}

fn null_to_string(vm: &mut Vm, _args: usize) -> PrimitiveResult {
    let value = vm.string_value("null");
    PrimitiveResult::Value(value)
}
