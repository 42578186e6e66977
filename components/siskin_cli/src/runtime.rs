//! The CLI's wrapper around a VM instance.

use std::fs;

use builtins::num_to_string;
use interpreter::{Configuration, InterpretResult, SlotType, Vm};

use crate::error::{CliError, CliResult};

/// Owns the VM and routes its output to the terminal.
pub struct Runtime {
    vm: Vm,
    print_bytecode: bool,
}

impl Runtime {
    /// Create a runtime printing to stdout/stderr.
    pub fn new(print_bytecode: bool, trailing_semicolons: bool) -> Runtime {
        let config = Configuration {
            write_fn: Some(Box::new(|text| print!("{text}"))),
            error_fn: Some(Box::new(|kind, module, line, message| match kind {
                interpreter::ErrorKind::Compile => {
                    eprintln!("[{module} line {line}] [Error] {message}")
                }
                interpreter::ErrorKind::Runtime => eprintln!("{message}"),
                interpreter::ErrorKind::StackTrace => {
                    eprintln!("[{module} line {line}] in {message}")
                }
            })),
            accepts_trailing_semicolons: trailing_semicolons,
            ..Configuration::default()
        };
        Runtime {
            vm: Vm::new(config),
            print_bytecode,
        }
    }

    /// Run a script file as the `main` module.
    pub fn execute_file(&mut self, path: &str) -> CliResult<()> {
        let source = fs::read_to_string(path)?;
        self.execute_source("main", &source)
    }

    /// Run source text as the body of a module.
    pub fn execute_source(&mut self, module: &str, source: &str) -> CliResult<()> {
        if self.print_bytecode {
            match self.vm.compile_only(module, source) {
                Some(listing) => println!("{listing}"),
                None => return Err(CliError::Compile),
            }
        }
        match self.vm.interpret(module, source) {
            InterpretResult::Success => Ok(()),
            InterpretResult::CompileError => Err(CliError::Compile),
            InterpretResult::RuntimeError => Err(CliError::Runtime),
        }
    }

    /// Evaluate one REPL line: expressions echo their result, statements
    /// run as-is.
    pub fn execute_repl_line(&mut self, source: &str) -> CliResult<Option<String>> {
        // Try it as an expression first, quietly; fall back to statements.
        match self.vm.interpret_expression("repl", source, false) {
            InterpretResult::Success => Ok(Some(self.render_result())),
            InterpretResult::RuntimeError => Err(CliError::Runtime),
            InterpretResult::CompileError => match self.vm.interpret("repl", source) {
                InterpretResult::Success => Ok(None),
                InterpretResult::CompileError => Err(CliError::Compile),
                InterpretResult::RuntimeError => Err(CliError::Runtime),
            },
        }
    }

    /// Render the value in slot 0 for REPL display.
    fn render_result(&mut self) -> String {
        match self.vm.get_slot_type(0) {
            SlotType::Null => "null".to_string(),
            SlotType::Bool => self.vm.get_slot_bool(0).to_string(),
            SlotType::Num => num_to_string(self.vm.get_slot_double(0)),
            SlotType::String => format!("\"{}\"", self.vm.get_slot_string(0)),
            _ => {
                // Everything else renders through its own toString.
                let to_string = self.vm.make_call_handle("toString");
                let result = self.vm.call(&to_string);
                self.vm.release_handle(to_string);
                match result {
                    InterpretResult::Success if self.vm.get_slot_type(0) == SlotType::String => {
                        self.vm.get_slot_string(0)
                    }
                    _ => "<object>".to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_source_success() {
        let mut runtime = Runtime::new(false, false);
        assert!(runtime.execute_source("main", "var x = 1 + 2").is_ok());
    }

    #[test]
    fn test_execute_source_compile_error() {
        let mut runtime = Runtime::new(false, false);
        let result = runtime.execute_source("main", "var = ");
        assert!(matches!(result, Err(CliError::Compile)));
    }

    #[test]
    fn test_execute_source_runtime_error() {
        let mut runtime = Runtime::new(false, false);
        let result = runtime.execute_source("main", "Fiber.abort(\"boom\")");
        assert!(matches!(result, Err(CliError::Runtime)));
    }

    #[test]
    fn test_repl_expression_echo() {
        let mut runtime = Runtime::new(false, false);
        let echoed = runtime.execute_repl_line("1 + 2").unwrap();
        assert_eq!(echoed.as_deref(), Some("3"));
    }

    #[test]
    fn test_repl_statement_returns_nothing() {
        let mut runtime = Runtime::new(false, false);
        let echoed = runtime.execute_repl_line("var q = 5").unwrap();
        assert_eq!(echoed, None);
    }

    #[test]
    fn test_repl_string_quoted() {
        let mut runtime = Runtime::new(false, false);
        let echoed = runtime.execute_repl_line("\"hi\"").unwrap();
        assert_eq!(echoed.as_deref(), Some("\"hi\""));
    }

    #[test]
    fn test_repl_list_renders_via_to_string() {
        let mut runtime = Runtime::new(false, false);
        let echoed = runtime.execute_repl_line("[1, 2, 3]").unwrap();
        assert_eq!(echoed.as_deref(), Some("[1, 2, 3]"));
    }
}
