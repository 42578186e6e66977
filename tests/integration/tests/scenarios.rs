//! End-to-end scenarios: source text in, printed output out.

use integration_tests::{expect_output, run_source};
use interpreter::InterpretResult;

#[test]
fn arithmetic_precedence() {
    expect_output("System.print(1 + 2 * 3)", "7\n");
}

#[test]
fn for_loop_over_range_builds_list() {
    expect_output(
        "var a = []\nfor (i in 1..3) a.add(i * i)\nSystem.print(a)",
        "[1, 4, 9]\n",
    );
}

#[test]
fn function_block_argument_and_call() {
    expect_output(
        "var f = Fn.new { |x| x + 1 }\nSystem.print(f.call(41))",
        "42\n",
    );
}

#[test]
fn fiber_yield_and_resume() {
    expect_output(
        "var fib = Fiber.new { |x|\n  Fiber.yield(x + 1)\n  return x + 10\n}\nSystem.print(fib.call(1))\nSystem.print(fib.call())",
        "2\n11\n",
    );
}

#[test]
fn super_dispatch() {
    expect_output(
        "class A {\n  foo { \"A\" }\n}\nclass B is A {\n  foo { super.foo + \"B\" }\n}\nSystem.print(B.new().foo)",
        "AB\n",
    );
}

#[test]
fn map_remove_and_contains() {
    expect_output(
        "var m = {\"a\": 1, \"b\": 2}\nm.remove(\"a\")\nSystem.print(m.count)\nSystem.print(m.containsKey(\"b\"))",
        "1\ntrue\n",
    );
}

#[test]
fn try_catches_abort() {
    expect_output(
        "var e = Fiber.new { Fiber.abort(\"boom\") }\nSystem.print(e.try())",
        "boom\n",
    );
}

// -- language surface --------------------------------------------------------

#[test]
fn string_interpolation() {
    expect_output("var x = 6\nSystem.print(\"got %(x * 7)!\")", "got 42!\n");
}

#[test]
fn nested_interpolation() {
    expect_output(
        "var a = [1, 2]\nSystem.print(\"outer %(\"inner %(a.count)\") end\")",
        "outer inner 2 end\n",
    );
}

#[test]
fn while_loop_with_break_and_continue() {
    expect_output(
        "var total = 0\nvar i = 0\nwhile (true) {\n  i = i + 1\n  if (i > 10) break\n  if (i % 2 == 0) continue\n  total = total + i\n}\nSystem.print(total)",
        "25\n",
    );
}

#[test]
fn conditional_operator() {
    expect_output("System.print(1 < 2 ? \"yes\" : \"no\")", "yes\n");
}

#[test]
fn logical_operators_short_circuit() {
    expect_output(
        "System.print(false && Fiber.abort(\"nope\"))\nSystem.print(true || Fiber.abort(\"nope\"))",
        "false\ntrue\n",
    );
}

#[test]
fn closures_share_upvalues() {
    expect_output(
        "var make = Fn.new {\n  var count = 0\n  var inc = Fn.new { count = count + 1 }\n  var get = Fn.new { count }\n  return [inc, get]\n}\nvar pair = make.call()\npair[0].call()\npair[0].call()\nSystem.print(pair[1].call())",
        "2\n",
    );
}

#[test]
fn instance_fields_and_methods() {
    expect_output(
        "class Point {\n  construct new(x, y) {\n    _x = x\n    _y = y\n  }\n  x { _x }\n  y { _y }\n  sum { _x + _y }\n}\nvar p = Point.new(3, 4)\nSystem.print(p.sum)",
        "7\n",
    );
}

#[test]
fn inherited_fields_do_not_collide() {
    expect_output(
        "class A {\n  construct new() { _a = 1 }\n  a { _a }\n}\nclass B is A {\n  construct new() {\n    super()\n    _b = 2\n  }\n  b { _b }\n}\nvar b = B.new()\nSystem.print(b.a)\nSystem.print(b.b)",
        "1\n2\n",
    );
}

#[test]
fn static_fields_are_shared() {
    expect_output(
        "class Counter {\n  static increment() {\n    __count = (__count == null) ? 1 : __count + 1\n    return __count\n  }\n}\nCounter.increment()\nCounter.increment()\nSystem.print(Counter.increment())",
        "3\n",
    );
}

#[test]
fn setters_and_getters() {
    expect_output(
        "class Box {\n  construct new() { _value = null }\n  value { _value }\n  value=(v) { _value = v }\n}\nvar b = Box.new()\nb.value = 9\nSystem.print(b.value)",
        "9\n",
    );
}

#[test]
fn subscript_operators_on_classes() {
    expect_output(
        "class Grid {\n  construct new() { _cells = {} }\n  [x, y] { _cells[\"%(x):%(y)\"] }\n  [x, y]=(v) { _cells[\"%(x):%(y)\"] = v }\n}\nvar g = Grid.new()\ng[1, 2] = \"here\"\nSystem.print(g[1, 2])",
        "here\n",
    );
}

#[test]
fn operator_overloading() {
    expect_output(
        "class Vec {\n  construct new(x) { _x = x }\n  x { _x }\n  +(other) { Vec.new(_x + other.x) }\n  toString { \"Vec(%(_x))\" }\n}\nSystem.print(Vec.new(1) + Vec.new(2))",
        "Vec(3)\n",
    );
}

#[test]
fn is_operator_walks_the_hierarchy() {
    expect_output(
        "class A {}\nclass B is A {}\nvar b = B.new()\nSystem.print(b is B)\nSystem.print(b is A)\nSystem.print(b is Object)\nSystem.print(b is Num)",
        "true\ntrue\ntrue\nfalse\n",
    );
}

#[test]
fn type_and_class_name() {
    expect_output("System.print(1.type.name)\nSystem.print(\"s\".type.name)", "Num\nString\n");
}

#[test]
fn attributes_are_queryable() {
    expect_output(
        "#!version = 2\nclass Tagged {}\nvar attrs = Tagged.attributes\nSystem.print(attrs is Map)",
        "true\n",
    );
}

#[test]
fn fiber_transfer_does_not_set_caller() {
    // Transferred-to fibers do not resume the transferrer on return; the
    // program just ends when the main-module fiber is never resumed.
    expect_output(
        "var other = Fiber.new {\n  System.print(\"in other\")\n}\nSystem.print(\"before\")\nother.transfer()\nSystem.print(\"unreached\")",
        "before\nin other\n",
    );
}

#[test]
fn fiber_error_is_inspectable() {
    expect_output(
        "var f = Fiber.new { Fiber.abort(\"bad\") }\nf.try()\nSystem.print(f.error)\nSystem.print(f.isDone)",
        "bad\ntrue\n",
    );
}

#[test]
fn fiber_abort_null_is_noop() {
    expect_output("Fiber.abort(null)\nSystem.print(\"still here\")", "still here\n");
}

#[test]
fn range_to_string_and_accessors() {
    expect_output(
        "var r = 1..4\nSystem.print(r)\nSystem.print(r.min)\nSystem.print(r.max)\nSystem.print((1...4).isInclusive)",
        "1..4\n1\n4\nfalse\n",
    );
}

#[test]
fn num_formatting() {
    expect_output(
        "System.print(3.14)\nSystem.print(10 / 4)\nSystem.print(0/0)\nSystem.print(1/0)\nSystem.print(-1/0)",
        "3.14\n2.5\nnan\ninfinity\n-infinity\n",
    );
}

#[test]
fn num_methods() {
    expect_output(
        "System.print((-3).abs)\nSystem.print(9.sqrt)\nSystem.print(2.pow(10))\nSystem.print(7.min(3))\nSystem.print(5.clamp(1, 4))",
        "3\n3\n1024\n3\n4\n",
    );
}

#[test]
fn bitwise_on_u32() {
    expect_output(
        "System.print(6 & 3)\nSystem.print(6 | 3)\nSystem.print(6 ^ 3)\nSystem.print(1 << 4)\nSystem.print(~0)",
        "2\n7\n5\n16\n4294967295\n",
    );
}

#[test]
fn string_methods() {
    expect_output(
        "var s = \"hello world\"\nSystem.print(s.byteCount)\nSystem.print(s.contains(\"world\"))\nSystem.print(s.indexOf(\"o\"))\nSystem.print(s.indexOf(\"o\", 5))\nSystem.print(s.endsWith(\"rld\"))",
        "11\ntrue\n4\n7\ntrue\n",
    );
}

#[test]
fn string_iteration_is_by_code_point() {
    expect_output(
        "var out = []\nfor (c in \"héllo\") out.add(c)\nSystem.print(out.count)",
        "5\n",
    );
}

#[test]
fn list_operations() {
    expect_output(
        "var l = [1, 2, 3]\nl.insert(1, 9)\nSystem.print(l)\nSystem.print(l.removeAt(0))\nSystem.print(l.indexOf(9))\nl.swap(0, 1)\nSystem.print(l)",
        "[1, 9, 2, 3]\n1\n0\n[2, 9, 3]\n",
    );
}

#[test]
fn list_helpers_from_core_script() {
    expect_output(
        "var l = [1, 2, 3, 4]\nSystem.print(l.map { |x| x * 2 })\nSystem.print(l.where { |x| x % 2 == 0 })\nSystem.print(l.reduce(0) { |a, b| a + b })\nSystem.print(l.contains(3))\nSystem.print([].isEmpty)",
        "[2, 4, 6, 8]\n[2, 4]\n10\ntrue\ntrue\n",
    );
}

#[test]
fn imports_load_modules_once() {
    use integration_tests::capturing_vm;
    use std::cell::RefCell;
    use std::rc::Rc;

    let (mut vm, output, _errors) = capturing_vm();
    let loads = Rc::new(RefCell::new(0));
    let counter = Rc::clone(&loads);
    vm.config_mut().load_module_fn = Some(Box::new(move |name| {
        *counter.borrow_mut() += 1;
        match name {
            "util" => Some("var helper = 99\nSystem.print(\"loading util\")".to_string()),
            _ => None,
        }
    }));

    let result = vm.interpret(
        "main",
        "import \"util\" for helper\nimport \"util\"\nSystem.print(helper)",
    );
    assert_eq!(result, InterpretResult::Success);
    assert_eq!(output.borrow().as_str(), "loading util\n99\n");
    assert_eq!(*loads.borrow(), 1);
}

#[test]
fn missing_import_is_a_runtime_error() {
    let run = run_source("import \"nowhere\"");
    assert_eq!(run.result, InterpretResult::RuntimeError);
    assert!(run.errors.contains("Could not load module 'nowhere'."));
}

// -- error reporting ---------------------------------------------------------

#[test]
fn undefined_method_reports_class_and_signature() {
    let run = run_source("System.print(1.frobnicate)");
    assert_eq!(run.result, InterpretResult::RuntimeError);
    assert!(run.errors.contains("Num does not implement 'frobnicate'."), "{}", run.errors);
}

#[test]
fn undefined_variable_is_a_compile_error() {
    let run = run_source("System.print(missing)");
    assert_eq!(run.result, InterpretResult::CompileError);
    assert!(run.errors.contains("Variable 'missing' is used but not defined."));
}

#[test]
fn stack_trace_lists_frames() {
    let run = run_source(
        "class T {\n  construct new() {}\n  inner { Fiber.abort(\"deep\") }\n  outer { inner }\n}\nT.new().outer",
    );
    assert_eq!(run.result, InterpretResult::RuntimeError);
    assert!(run.errors.contains("deep"));
    assert!(run.errors.contains("inner"), "{}", run.errors);
    assert!(run.errors.contains("outer"), "{}", run.errors);
}

#[test]
fn type_errors_from_primitives() {
    let run = run_source("System.print(1 + \"s\")");
    assert_eq!(run.result, InterpretResult::RuntimeError);
    assert!(run.errors.contains("Right operand must be a number."));
}

#[test]
fn deep_recursion_overflows_cleanly() {
    let run = run_source("class R {\n  construct new() {}\n  spin { spin }\n}\nR.new().spin");
    assert_eq!(run.result, InterpretResult::RuntimeError);
    assert!(run.errors.contains("Stack overflow."), "{}", run.errors);
}
