//! `Fiber` primitives: the cooperative scheduling surface.
//!
//! The switching primitives return `FiberAction` after repointing the
//! VM's current fiber; the dispatch loop re-materializes its state from
//! whatever fiber is then selected.

use core_types::{ObjId, Value};

use crate::config::PrimitiveResult;
use crate::core::{bind_primitive, metaclass_of, prim_error};
use crate::fiber::FiberState;
use crate::vm::Vm;

pub(super) fn bind(vm: &mut Vm) {
    let fiber = vm.core.fiber.unwrap();

    bind_primitive(vm, fiber, "call()", fiber_call);
    bind_primitive(vm, fiber, "call(_)", fiber_call1);
    bind_primitive(vm, fiber, "transfer()", fiber_transfer);
    bind_primitive(vm, fiber, "transfer(_)", fiber_transfer1);
    bind_primitive(vm, fiber, "try()", fiber_try);
    bind_primitive(vm, fiber, "try(_)", fiber_try1);
    bind_primitive(vm, fiber, "error", fiber_error);
    bind_primitive(vm, fiber, "isDone", fiber_is_done);

    let statics = metaclass_of(vm, fiber);
    bind_primitive(vm, statics, "new(_)", fiber_new);
    bind_primitive(vm, statics, "abort(_)", fiber_abort);
    bind_primitive(vm, statics, "current", fiber_current);
    bind_primitive(vm, statics, "suspend()", fiber_suspend);
    bind_primitive(vm, statics, "yield()", fiber_yield);
    bind_primitive(vm, statics, "yield(_)", fiber_yield1);
}

fn fiber_new(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let argument = vm.parg(args, 1);
    if !vm.heap.value_is_closure(argument) {
        prim_error!(vm, "Argument must be a function.");
    }
    let closure = argument.as_obj();
    let arity = {
        let fn_obj = vm.heap.closure(closure).fn_obj;
        vm.heap.fn_data(fn_obj).arity
    };
    if arity > 1 {
        prim_error!(vm, "Function cannot take more than one parameter.");
    }
    let fiber = vm.new_fiber(closure);
    PrimitiveResult::Value(Value::obj(fiber))
}

/// Shared run logic for `call`, `transfer`, and `try`.
fn run_fiber(
    vm: &mut Vm,
    target: ObjId,
    args: usize,
    is_call: bool,
    has_value: bool,
    verb: &str,
) -> PrimitiveResult {
    if vm.heap.fiber(target).has_error() {
        prim_error!(vm, "Cannot {verb} an aborted fiber.");
    }
    if is_call {
        // A called fiber remembers who ran it; transfers do not, which is
        // what lets transfer chains avoid growing the caller chain.
        if vm.heap.fiber(target).caller.is_some() {
            prim_error!(vm, "Fiber has already been called.");
        }
        if vm.heap.fiber(target).state == FiberState::Root {
            prim_error!(vm, "Cannot call root fiber.");
        }
        let current = vm.current_fiber();
        vm.heap.fiber_mut(target).caller = Some(current);
    }
    if vm.heap.fiber(target).is_done() {
        prim_error!(vm, "Cannot {verb} a finished fiber.");
    }

    // The current fiber keeps one slot where the result of this switch
    // will appear when it resumes.
    let value = if has_value { Some(vm.parg(args, 1)) } else { None };
    if has_value {
        let current = vm.current_fiber();
        vm.heap.fiber_mut(current).stack.pop();
    }

    if vm.heap.fiber(target).is_fresh() {
        // Starting for the first time: bind the parameter, if declared.
        let arity = {
            let closure = vm.heap.fiber(target).frames[0].closure;
            let fn_obj = vm.heap.closure(closure).fn_obj;
            vm.heap.fn_data(fn_obj).arity
        };
        if arity == 1 {
            let bound = value.unwrap_or(Value::NULL);
            vm.heap.fiber_mut(target).stack.push(bound);
        }
    } else {
        // Resuming: the pending yield or transfer evaluates to the value.
        let resumed = value.unwrap_or(Value::NULL);
        let stack = &mut vm.heap.fiber_mut(target).stack;
        let top = stack.len() - 1;
        stack[top] = resumed;
    }

    vm.fiber = Some(target);
    PrimitiveResult::FiberAction
}

fn target(vm: &Vm, args: usize) -> ObjId {
    vm.parg(args, 0).as_obj()
}

fn fiber_call(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let fiber = target(vm, args);
    run_fiber(vm, fiber, args, true, false, "call")
}

fn fiber_call1(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let fiber = target(vm, args);
    run_fiber(vm, fiber, args, true, true, "call")
}

fn fiber_transfer(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let fiber = target(vm, args);
    run_fiber(vm, fiber, args, false, false, "transfer to")
}

fn fiber_transfer1(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let fiber = target(vm, args);
    run_fiber(vm, fiber, args, false, true, "transfer to")
}

fn fiber_try(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let fiber = target(vm, args);
    let result = run_fiber(vm, fiber, args, true, false, "try");
    if matches!(result, PrimitiveResult::FiberAction) {
        vm.heap.fiber_mut(fiber).state = FiberState::Try;
    }
    result
}

fn fiber_try1(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let fiber = target(vm, args);
    let result = run_fiber(vm, fiber, args, true, true, "try");
    if matches!(result, PrimitiveResult::FiberAction) {
        vm.heap.fiber_mut(fiber).state = FiberState::Try;
    }
    result
}

fn fiber_error(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let fiber = target(vm, args);
    PrimitiveResult::Value(vm.heap.fiber(fiber).error)
}

fn fiber_is_done(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let fiber = target(vm, args);
    let done = vm.heap.fiber(fiber).is_done() || vm.heap.fiber(fiber).has_error();
    PrimitiveResult::Value(Value::from_bool(done))
}

fn fiber_abort(vm: &mut Vm, args: usize) -> PrimitiveResult {
    let error = vm.parg(args, 1);
    let current = vm.current_fiber();
    vm.heap.fiber_mut(current).error = error;
    // Aborting with null is a no-op.
    if error.is_null() {
        PrimitiveResult::Value(vm.parg(args, 0))
    } else {
        PrimitiveResult::Error
    }
}

fn fiber_current(vm: &mut Vm, _args: usize) -> PrimitiveResult {
    let current = vm.current_fiber();
    PrimitiveResult::Value(Value::obj(current))
}

fn fiber_suspend(vm: &mut Vm, _args: usize) -> PrimitiveResult {
    // Stops the interpreter; the host regains control with the VM intact.
    vm.fiber = None;
    PrimitiveResult::FiberAction
}

fn yield_impl(vm: &mut Vm, args: usize, has_value: bool) -> PrimitiveResult {
    let current = vm.current_fiber();
    let caller = vm.heap.fiber(current).caller;
    vm.fiber = caller;
    vm.heap.fiber_mut(current).caller = None;
    vm.heap.fiber_mut(current).state = FiberState::Other;

    if let Some(caller) = caller {
        // The caller's call evaluates to the yielded value.
        let value = if has_value { vm.parg(args, 1) } else { Value::NULL };
        let stack = &mut vm.heap.fiber_mut(caller).stack;
        let top = stack.len() - 1;
        stack[top] = value;

        // Leave one slot behind to receive the resume value.
        if has_value {
            vm.heap.fiber_mut(current).stack.pop();
        }
    }
    PrimitiveResult::FiberAction
}

fn fiber_yield(vm: &mut Vm, args: usize) -> PrimitiveResult {
    yield_impl(vm, args, false)
}

fn fiber_yield1(vm: &mut Vm, args: usize) -> PrimitiveResult {
    yield_impl(vm, args, true)
}
