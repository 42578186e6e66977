//! `Fn` primitives.
//!
//! The `call` family is bound as direct closure invocation: the dispatch
//! loop pushes a frame for the receiver itself after checking arity.

use core_types::Value;

use crate::config::PrimitiveResult;
use crate::core::{bind_fn_call, bind_primitive, metaclass_of, prim_error};
use crate::vm::Vm;

pub(super) fn bind(vm: &mut Vm) {
    let fn_class = vm.core.fn_.unwrap();

    bind_primitive(vm, fn_class, "arity", fn_arity);
    bind_primitive(vm, fn_class, "toString", fn_to_string);

    // call() through call(_,…,_) with up to 16 parameters.
    let mut signature = "call(".to_string();
    bind_fn_call(vm, fn_class, "call()");
    for i in 0..16 {
        if i > 0 {
            signature.push(',');
        }
        signature.push('_');
        bind_fn_call(vm, fn_class, &format!("{signature})"));
    }

    let statics = metaclass_of(vm, fn_class);
    bind_primitive(vm, statics, "new(_)", fn_new);
}

fn fn_new(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let argument = vm.parg(args, 1);
    if !vm.heap.value_is_closure(argument) {
        prim_error!(vm, "Argument must be a function.");
    }
    PrimitiveResult::Value(argument)
}

fn fn_arity(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let closure = vm.parg(args, 0).as_obj();
    let arity = {
        let fn_obj = vm.heap.closure(closure).fn_obj;
        vm.heap.fn_data(fn_obj).arity
    };
    PrimitiveResult::Value(Value::num(arity as f64))
}

fn fn_to_string(vm: &mut Vm, _args: usize) -> PrimitiveResult {
    let value = vm.string_value("<fn>");
    PrimitiveResult::Value(value)
}
