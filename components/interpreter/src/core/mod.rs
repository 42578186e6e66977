//! The core library.
//!
//! At VM start, `Object`, `Class`, and Object's metaclass are created by
//! hand and wired into the circular metaclass diagram. The script preamble
//! below is then compiled into the core module, declaring the remaining
//! classes and their script-level conveniences, after which the primitive
//! methods are attached by symbol. Objects allocated before their class
//! existed get their class pointers patched in a final pass.

mod fiber;
mod fn_;
mod list;
mod map;
mod num;
mod object;
mod range;
mod string;
mod system;

use core_types::{InterpretResult, ObjId, Value};

use crate::config::PrimitiveFn;
use crate::fiber::FiberState;
use crate::heap::{Method, ObjClass, ObjKind};
use crate::vm::Vm;

/// The script preamble compiled into the core module at startup.
const CORE_SRC: &str = r#"
class Bool {}
class Fiber {}
class Fn {}
class Null {}
class Num {}

class String {}

class List {
  addAll(other) {
    for (element in other) {
      add(element)
    }
    return other
  }

  join() { join("") }

  join(sep) {
    var first = true
    var result = ""
    for (element in this) {
      if (!first) result = result + sep
      first = false
      result = result + element.toString
    }
    return result
  }

  toString { "[%(join(", "))]" }

  map(transformation) {
    var result = []
    for (element in this) {
      result.add(transformation.call(element))
    }
    return result
  }

  where(predicate) {
    var result = []
    for (element in this) {
      if (predicate.call(element)) result.add(element)
    }
    return result
  }

  reduce(acc, f) {
    for (element in this) {
      acc = f.call(acc, element)
    }
    return acc
  }

  contains(element) {
    for (item in this) {
      if (element == item) return true
    }
    return false
  }

  isEmpty { count == 0 }
}

class Map {
  toString {
    var result = "{"
    var first = true
    var i = iterate(null)
    while (i) {
      if (!first) result = result + ", "
      first = false
      result = result + keyIteratorValue_(i).toString
      result = result + ": "
      result = result + valueIteratorValue_(i).toString
      i = iterate(i)
    }
    return result + "}"
  }

  isEmpty { count == 0 }
}

class Range {
  toList {
    var result = []
    for (element in this) {
      result.add(element)
    }
    return result
  }
}

class System {
  static print() {
    writeString_("\n")
  }

  static print(obj) {
    writeObject_(obj)
    writeString_("\n")
    return obj
  }

  static printAll(sequence) {
    for (object in sequence) writeObject_(object)
    writeString_("\n")
  }

  static write(obj) {
    writeObject_(obj)
    return obj
  }

  static writeAll(sequence) {
    for (object in sequence) writeObject_(object)
  }

  static writeObject_(obj) {
    var string = obj.toString
    if (string is String) {
      writeString_(string)
    } else {
      writeString_("[invalid toString]")
    }
  }
}
"#;

/// Build the core library into a freshly created VM.
pub(crate) fn initialize(vm: &mut Vm) {
    // Object, Class, and Object's metaclass are created by hand: their
    // relationships are circular, so all three exist before any edge is
    // wired.
    let object = define_bare_class(vm, "Object");
    vm.core.object = Some(object);
    object::bind_object(vm, object);

    let class_class = define_bare_class(vm, "Class");
    vm.core.class = Some(class_class);
    vm.bind_superclass(class_class, object);
    object::bind_class(vm, class_class);

    let object_metaclass = define_bare_class(vm, "Object metaclass");

    vm.heap.get_mut(object).header.class = Some(object_metaclass);
    vm.heap.get_mut(object_metaclass).header.class = Some(class_class);
    vm.heap.get_mut(class_class).header.class = Some(class_class);
    vm.bind_superclass(object_metaclass, class_class);
    bind_primitive(vm, object_metaclass, "same(_,_)", object::object_same);

    // The script preamble declares the remaining classes.
    run_core_source(vm);

    vm.core.bool_ = Some(core_class(vm, "Bool"));
    vm.core.fiber = Some(core_class(vm, "Fiber"));
    vm.core.fn_ = Some(core_class(vm, "Fn"));
    vm.core.null = Some(core_class(vm, "Null"));
    vm.core.num = Some(core_class(vm, "Num"));
    vm.core.string = Some(core_class(vm, "String"));
    vm.core.list = Some(core_class(vm, "List"));
    vm.core.map = Some(core_class(vm, "Map"));
    vm.core.range = Some(core_class(vm, "Range"));

    object::bind_bool_and_null(vm);
    num::bind(vm);
    string::bind(vm);
    list::bind(vm);
    map::bind(vm);
    range::bind(vm);
    fiber::bind(vm);
    fn_::bind(vm);
    let system = core_class(vm, "System");
    system::bind(vm, system);

    patch_classes(vm);
}

fn run_core_source(vm: &mut Vm) {
    let core_module = vm.core_module;
    let closure = vm
        .compile_in_module(core_module, CORE_SRC, false, true)
        .expect("core module failed to compile");
    let fiber = vm.new_fiber(closure);
    vm.heap.pop_temp_root();
    vm.heap.fiber_mut(fiber).state = FiberState::Root;
    let result = vm.run_interpreter(fiber);
    assert_eq!(
        result,
        InterpretResult::Success,
        "core module failed to run"
    );
    vm.fiber = None;
    vm.api_stack = None;
}

fn define_bare_class(vm: &mut Vm, name: &str) -> ObjId {
    let class = vm.alloc_obj(ObjKind::Class(Box::new(ObjClass::bare(name, Some(0)))), None);
    vm.heap.push_temp_root(class);
    vm.heap
        .module_mut(vm.core_module)
        .vars
        .define(name, Value::obj(class))
        .expect("core class is defined once");
    vm.heap.pop_temp_root();
    class
}

fn core_class(vm: &Vm, name: &str) -> ObjId {
    let vars = &vm.heap.module(vm.core_module).vars;
    let slot = vars.lookup(name).expect("core class declared");
    vars.value(slot).as_obj()
}

/// Attach a primitive to a class under its signature.
pub(crate) fn bind_primitive(vm: &mut Vm, class: ObjId, signature: &str, f: PrimitiveFn) {
    let symbol = vm.method_names.ensure(signature);
    vm.heap.class_mut(class).bind_method(symbol, Method::Primitive(f));
}

/// Attach a direct closure-call method (the `Fn.call` family).
pub(crate) fn bind_fn_call(vm: &mut Vm, class: ObjId, signature: &str) {
    let symbol = vm.method_names.ensure(signature);
    vm.heap.class_mut(class).bind_method(symbol, Method::FunctionCall);
}

/// The metaclass of a class, for binding statics.
pub(crate) fn metaclass_of(vm: &Vm, class: ObjId) -> ObjId {
    vm.heap.get(class).header.class.expect("class has metaclass")
}

/// Give a class pointer to every object allocated before its class
/// existed.
fn patch_classes(vm: &mut Vm) {
    let ids: Vec<ObjId> = vm.heap.iter_ids().collect();
    for id in ids {
        if vm.heap.get(id).header.class.is_some() {
            continue;
        }
        let class = match &vm.heap.get(id).kind {
            ObjKind::Str(_) => vm.core.string,
            ObjKind::List(_) => vm.core.list,
            ObjKind::Map(_) => vm.core.map,
            ObjKind::Range(_) => vm.core.range,
            ObjKind::Fn(_) | ObjKind::Closure(_) => vm.core.fn_,
            ObjKind::Fiber(_) => vm.core.fiber,
            // Modules and upvalues are never dispatch receivers.
            ObjKind::Module(_) | ObjKind::Upvalue(_) => None,
            ObjKind::Class(_) | ObjKind::Instance(_) | ObjKind::Foreign(_) => None,
        };
        if let Some(class) = class {
            vm.heap.get_mut(id).header.class = Some(class);
        }
    }
}

// -- shared primitive helpers -----------------------------------------------

/// Read a validated number argument or abort the primitive.
macro_rules! validate_num {
    ($vm:expr, $args:expr, $i:expr, $label:expr) => {{
        match $vm.parg($args, $i).try_num() {
            Some(n) => n,
            None => {
                $vm.set_error_str(concat!($label, " must be a number."));
                return crate::config::PrimitiveResult::Error;
            }
        }
    }};
}

/// Read a validated integral number argument or abort the primitive.
macro_rules! validate_int {
    ($vm:expr, $args:expr, $i:expr, $label:expr) => {{
        let n = crate::core::validate_num!($vm, $args, $i, $label);
        if n.trunc() != n || !n.is_finite() {
            $vm.set_error_str(concat!($label, " must be an integer."));
            return crate::config::PrimitiveResult::Error;
        }
        n
    }};
}

/// Read a string-object argument or abort the primitive.
macro_rules! validate_string {
    ($vm:expr, $args:expr, $i:expr, $label:expr) => {{
        match $vm.parg($args, $i).try_obj() {
            Some(id) if $vm.heap.is_string(id) => id,
            _ => {
                $vm.set_error_str(concat!($label, " must be a string."));
                return crate::config::PrimitiveResult::Error;
            }
        }
    }};
}

/// Abort the primitive with a formatted error.
macro_rules! prim_error {
    ($vm:expr, $($arg:tt)*) => {{
        let message = format!($($arg)*);
        $vm.set_error_str(&message);
        return crate::config::PrimitiveResult::Error;
    }};
}

pub(crate) use prim_error;
pub(crate) use validate_int;
pub(crate) use validate_num;
pub(crate) use validate_string;

impl Vm {
    /// Read argument `i` of the running primitive's window (0 is the
    /// receiver).
    pub(crate) fn parg(&self, args: usize, i: usize) -> Value {
        self.heap.fiber(self.current_fiber()).stack[args + i]
    }
}
