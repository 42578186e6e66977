//! `System` primitives.

use std::time::{SystemTime, UNIX_EPOCH};

use core_types::{ObjId, Value};

use crate::config::PrimitiveResult;
use crate::core::{bind_primitive, metaclass_of};
use crate::vm::Vm;

pub(super) fn bind(vm: &mut Vm, system: ObjId) {
    let statics = metaclass_of(vm, system);
    bind_primitive(vm, statics, "clock", system_clock);
    bind_primitive(vm, statics, "gc()", system_gc);
    bind_primitive(vm, statics, "writeString_(_)", system_write_string);
    bind_primitive(vm, statics, "isDebugBuild", system_is_debug_build);
}

fn system_clock(_vm: &mut Vm, _args: usize) -> PrimitiveResult {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    PrimitiveResult::Value(Value::num(seconds))
}

fn system_gc(vm: &mut Vm, _args: usize) -> PrimitiveResult {
    vm.collect_garbage();
    PrimitiveResult::Value(Value::NULL)
}

fn system_write_string(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let argument = vm.parg(args, 1);
    if let Some(id) = argument.try_obj() {
        if vm.heap.is_string(id) {
            let text = vm.heap.string(id).as_text().into_owned();
            vm.write(&text);
        }
    }
    PrimitiveResult::Value(argument)
}

fn system_is_debug_build(_vm: &mut Vm, _args: usize) -> PrimitiveResult {
    PrimitiveResult::Value(Value::from_bool(cfg!(debug_assertions)))
}
