//! Tests of the host boundary: slots, handles, call handles, foreign
//! classes and methods, and the `$` hook.

use std::sync::atomic::{AtomicUsize, Ordering};

use integration_tests::capturing_vm;
use interpreter::{ForeignClassMethods, InterpretResult, SlotType, Vm};

static FINALIZED: AtomicUsize = AtomicUsize::new(0);

fn counter_allocate(vm: &mut Vm) {
    vm.set_slot_new_foreign(0, 0, 8);
}

fn counter_finalize(_data: &mut [u8]) {
    FINALIZED.fetch_add(1, Ordering::SeqCst);
}

fn counter_increment(vm: &mut Vm) {
    let bytes = vm.get_slot_foreign_mut(0);
    let mut value = u64::from_le_bytes(bytes[..8].try_into().unwrap());
    value += 1;
    bytes[..8].copy_from_slice(&value.to_le_bytes());
    vm.set_slot_double(0, value as f64);
}

fn with_counter_class() -> (Vm, std::rc::Rc<std::cell::RefCell<String>>) {
    let (mut vm, output, _errors) = capturing_vm();
    vm.config_mut().bind_foreign_class_fn = Some(Box::new(|_module, class| {
        if class == "Counter" {
            Some(ForeignClassMethods {
                allocate: counter_allocate,
                finalize: Some(counter_finalize),
            })
        } else {
            None
        }
    }));
    vm.config_mut().bind_foreign_method_fn =
        Some(Box::new(|_module, class, _is_static, signature| {
            if class == "Counter" && signature == "increment()" {
                Some(counter_increment as interpreter::ForeignMethodFn)
            } else {
                None
            }
        }));
    (vm, output)
}

const COUNTER_CLASS: &str = "foreign class Counter {\n  construct new() {}\n  foreign increment()\n}\n";

#[test]
fn foreign_class_allocates_and_methods_run() {
    let (mut vm, output) = with_counter_class();
    let source = format!(
        "{COUNTER_CLASS}var c = Counter.new()\nSystem.print(c.increment())\nSystem.print(c.increment())"
    );
    let result = vm.interpret("main", &source);
    assert_eq!(result, InterpretResult::Success);
    assert_eq!(output.borrow().as_str(), "1\n2\n");
}

#[test]
fn foreign_finalizer_runs_on_collection() {
    let (mut vm, _output) = with_counter_class();
    let source = format!("{COUNTER_CLASS}var c = Counter.new()");
    assert_eq!(vm.interpret("main", &source), InterpretResult::Success);

    let before = FINALIZED.load(Ordering::SeqCst);
    assert_eq!(vm.interpret("main", "c = null"), InterpretResult::Success);
    vm.collect_garbage();
    assert!(FINALIZED.load(Ordering::SeqCst) > before);
}

#[test]
fn unbound_foreign_method_is_an_error() {
    let (mut vm, _output, errors) = capturing_vm();
    let result = vm.interpret(
        "main",
        "class Gate {\n  foreign open()\n}",
    );
    assert_eq!(result, InterpretResult::RuntimeError);
    assert!(
        errors.borrow().contains("Could not find foreign method 'open()'"),
        "{}",
        errors.borrow()
    );
}

#[test]
fn call_handle_invokes_script_method() {
    let (mut vm, output, _errors) = capturing_vm();
    let source = "class Greeter {\n  construct new() {}\n  greet(name) { \"hi %(name)\" }\n}\nvar greeter = Greeter.new()";
    assert_eq!(vm.interpret("main", source), InterpretResult::Success);

    let greet = vm.make_call_handle("greet(_)");
    vm.ensure_slots(2);
    vm.get_variable("main", "greeter", 0);
    vm.set_slot_string(1, "host");
    let result = vm.call(&greet);
    assert_eq!(result, InterpretResult::Success);
    assert_eq!(vm.get_slot_type(0), SlotType::String);
    assert_eq!(vm.get_slot_string(0), "hi host");
    vm.release_handle(greet);
    assert_eq!(output.borrow().as_str(), "");
}

#[test]
fn call_handle_reaches_static_methods() {
    let (mut vm, _output, _errors) = capturing_vm();
    assert_eq!(vm.interpret("main", "var x = 1"), InterpretResult::Success);

    // Call System.clock through the ABI: receiver is the class itself.
    let clock = vm.make_call_handle("clock");
    vm.ensure_slots(1);
    vm.get_variable("main", "System", 0);
    assert_eq!(vm.call(&clock), InterpretResult::Success);
    assert_eq!(vm.get_slot_type(0), SlotType::Num);
    vm.release_handle(clock);
}

#[test]
fn abort_from_host_propagates() {
    fn explode(vm: &mut Vm) {
        vm.ensure_slots(1);
        vm.set_slot_string(0, "host says no");
        vm.abort_fiber(0);
    }

    let (mut vm, _output, errors) = capturing_vm();
    vm.config_mut().bind_foreign_method_fn = Some(Box::new(|_m, _c, _s, signature| {
        if signature == "explode()" {
            Some(explode as interpreter::ForeignMethodFn)
        } else {
            None
        }
    }));
    let result = vm.interpret(
        "main",
        "class Host {\n  foreign static explode()\n}\nHost.explode()",
    );
    assert_eq!(result, InterpretResult::RuntimeError);
    assert!(errors.borrow().contains("host says no"), "{}", errors.borrow());
}

#[test]
fn dollar_hook_receives_the_string() {
    fn shout(vm: &mut Vm) {
        let text = vm.get_slot_string(0).to_uppercase();
        vm.set_slot_string(0, &text);
    }

    let (mut vm, output, _errors) = capturing_vm();
    vm.config_mut().dollar_operator_fn = Some(shout);
    let result = vm.interpret("main", "System.print($\"quiet words\")");
    assert_eq!(result, InterpretResult::Success);
    assert_eq!(output.borrow().as_str(), "QUIET WORDS\n");
}

#[test]
fn dollar_without_hook_yields_null() {
    let (mut vm, output, _errors) = capturing_vm();
    let result = vm.interpret("main", "System.print($\"ignored\")");
    assert_eq!(result, InterpretResult::Success);
    assert_eq!(output.borrow().as_str(), "null\n");
}

#[test]
fn resolve_module_rewrites_names() {
    let (mut vm, output, _errors) = capturing_vm();
    vm.config_mut().resolve_module_fn = Some(Box::new(|importer, name| {
        Some(format!("{importer}/{name}"))
    }));
    vm.config_mut().load_module_fn = Some(Box::new(|name| {
        if name == "main/sibling" {
            Some("var place = \"nested\"".to_string())
        } else {
            None
        }
    }));
    let result = vm.interpret(
        "main",
        "import \"sibling\" for place\nSystem.print(place)",
    );
    assert_eq!(result, InterpretResult::Success);
    assert_eq!(output.borrow().as_str(), "nested\n");
}

#[test]
fn slot_zero_holds_module_result() {
    let (mut vm, _output, _errors) = capturing_vm();
    // The empty module completes with null on top of the stack.
    assert_eq!(vm.interpret("main", ""), InterpretResult::Success);
    assert_eq!(vm.get_slot_type(0), SlotType::Null);
}
