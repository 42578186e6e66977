//! Limit and edge-case behavior.

use integration_tests::{expect_output, run_source};
use interpreter::InterpretResult;
use std::fmt::Write;

#[test]
fn sixteen_parameters_compile_seventeen_do_not() {
    let params = |n: usize| {
        (0..n).map(|i| format!("p{i}")).collect::<Vec<_>>().join(", ")
    };

    let ok = format!("class W {{\n  m({}) {{ }}\n}}", params(16));
    assert_eq!(run_source(&ok).result, InterpretResult::Success);

    let too_many = format!("class W {{\n  m({}) {{ }}\n}}", params(17));
    let run = run_source(&too_many);
    assert_eq!(run.result, InterpretResult::CompileError);
    assert!(run.errors.contains("more than 16 parameters"));
}

#[test]
fn module_variable_limit_is_enforced() {
    // Every module starts with the core names; filling the rest of the
    // 65536 budget works, one more does not.
    let mut source = String::new();
    for i in 0..65536 {
        let _ = writeln!(source, "var v{i} = 0");
    }
    let run = run_source(&source);
    assert_eq!(run.result, InterpretResult::CompileError);
    assert!(
        run.errors.contains("Too many module variables defined."),
        "{}",
        &run.errors[..run.errors.len().min(500)]
    );

    let mut small = String::new();
    for i in 0..1000 {
        let _ = writeln!(small, "var v{i} = 0");
    }
    assert_eq!(run_source(&small).result, InterpretResult::Success);
}

#[test]
fn list_range_slicing_table() {
    // Full copies, empty slices, and descending ranges.
    expect_output(
        "var a = [1, 2, 3, 4]\nSystem.print(a[0..-1])\nSystem.print(a[0...4])\nSystem.print(a[1..1])\nSystem.print(a[1...1])\nSystem.print(a[3..0])",
        "[1, 2, 3, 4]\n[1, 2, 3, 4]\n[2]\n[]\n[4, 3, 2, 1]\n",
    );
}

#[test]
fn list_subscript_bounds() {
    expect_output(
        "var a = [10, 20, 30]\nSystem.print(a[2])\nSystem.print(a[-1])",
        "30\n30\n",
    );

    let run = run_source("var a = [1]\nSystem.print(a[1])");
    assert_eq!(run.result, InterpretResult::RuntimeError);
    assert!(run.errors.contains("Index out of bounds."));
}

#[test]
fn string_subscript_mid_sequence() {
    // "é" is two bytes at offsets 1-2; offset 2 is a continuation byte.
    expect_output(
        "var s = \"héllo\"\nSystem.print(s.codePointAt(1))\nSystem.print(s.codePointAt(2))\nSystem.print(s[2].byteCount)\nSystem.print(s[1])",
        "233\n-1\n1\né\n",
    );
}

#[test]
fn iterate_on_one_element_list_stops() {
    expect_output(
        "var l = [7]\nSystem.print(l.iterate(null))\nSystem.print(l.iterate(0))",
        "0\nfalse\n",
    );
}

#[test]
fn empty_module_yields_success() {
    let run = run_source("");
    assert_eq!(run.result, InterpretResult::Success);
    assert_eq!(run.output, "");
}

#[test]
fn interpolation_nests_to_eight_levels_only() {
    // Nine nested interpolations overflow the lexer's level stack.
    let mut source = String::from("System.print(");
    let mut literal = String::from("\"%(");
    for _ in 0..8 {
        literal.push_str("\"%(");
    }
    literal.push('1');
    for _ in 0..8 {
        literal.push_str(")\"");
    }
    literal.push_str(")\"");
    source.push_str(&literal);
    source.push(')');

    let run = run_source(&source);
    assert_eq!(run.result, InterpretResult::CompileError);
    assert!(run.errors.contains("Interpolation may only nest 8 levels deep."));
}

#[test]
fn gc_under_allocation_pressure() {
    expect_output(
        "var keep = []\nfor (i in 1..100) {\n  var junk = []\n  for (j in 1..50) junk.add(\"tmp %(j)\")\n  keep.add(i)\n}\nSystem.gc()\nSystem.print(keep.count)",
        "100\n",
    );
}

#[test]
fn fields_cap_at_255() {
    // 256 distinct fields in one class is a compile error.
    let mut body = String::new();
    for i in 0..256 {
        let _ = writeln!(body, "    _f{i} = {i}");
    }
    let source = format!("class Wide {{\n  construct new() {{\n{body}  }}\n}}");
    let run = run_source(&source);
    assert_eq!(run.result, InterpretResult::CompileError);
    assert!(run.errors.contains("A class can only have 255 fields."));
}
