//! Helpers for driving the full pipeline in tests.

use std::cell::RefCell;
use std::rc::Rc;

use interpreter::{Configuration, InterpretResult, Vm};

/// Captured output of a test run.
pub struct Run {
    /// The interpreter result.
    pub result: InterpretResult,
    /// Everything the script printed.
    pub output: String,
    /// Everything the error callback received, one line per report.
    pub errors: String,
}

/// Build a VM whose output and diagnostics are captured.
pub fn capturing_vm() -> (Vm, Rc<RefCell<String>>, Rc<RefCell<String>>) {
    let output = Rc::new(RefCell::new(String::new()));
    let errors = Rc::new(RefCell::new(String::new()));

    let output_sink = Rc::clone(&output);
    let error_sink = Rc::clone(&errors);
    let config = Configuration {
        write_fn: Some(Box::new(move |text| {
            output_sink.borrow_mut().push_str(text);
        })),
        error_fn: Some(Box::new(move |_kind, module, line, message| {
            error_sink
                .borrow_mut()
                .push_str(&format!("[{module} line {line}] {message}\n"));
        })),
        ..Configuration::default()
    };
    (Vm::new(config), output, errors)
}

/// Compile and run `source` as the `main` module, capturing output.
pub fn run_source(source: &str) -> Run {
    let (mut vm, output, errors) = capturing_vm();
    let result = vm.interpret("main", source);
    let run = Run {
        result,
        output: output.borrow().clone(),
        errors: errors.borrow().clone(),
    };
    run
}

/// Assert that `source` runs successfully and prints exactly `expected`.
pub fn expect_output(source: &str, expected: &str) {
    let run = run_source(source);
    assert_eq!(
        run.result,
        InterpretResult::Success,
        "run failed; errors:\n{}",
        run.errors
    );
    assert_eq!(run.output, expected);
}
