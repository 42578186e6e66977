//! Error types reported by the compiler and the virtual machine.

use std::fmt;

/// The channel an error message is delivered on.
///
/// These correspond to the variants the host's error callback receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A compile-time error: syntax, name resolution, or limit violation.
    Compile,
    /// A runtime error raised by a fiber that no `try` caught.
    Runtime,
    /// One frame of the stack trace following a runtime error.
    StackTrace,
}

/// The result of handing source text or a call handle to the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    /// Execution completed and the result is in slot 0.
    Success,
    /// Compilation failed; the error callback received the details.
    CompileError,
    /// A fiber aborted with an uncaught error.
    RuntimeError,
}

/// A single compile-time diagnostic.
///
/// Compilation keeps going after the first error so that one pass reports
/// as much as possible; the collected list is forwarded to the host's error
/// callback.
#[derive(Debug, Clone)]
pub struct CompileError {
    /// Name of the module being compiled.
    pub module: String,
    /// 1-based source line the error was detected on.
    pub line: u32,
    /// Human-readable description.
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} line {}] {}", self.module, self.line, self.message)
    }
}

impl std::error::Error for CompileError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_error_display() {
        let err = CompileError {
            module: "main".to_string(),
            line: 3,
            message: "Expect expression.".to_string(),
        };
        assert_eq!(err.to_string(), "[main line 3] Expect expression.");
    }

    #[test]
    fn test_interpret_result_equality() {
        assert_eq!(InterpretResult::Success, InterpretResult::Success);
        assert_ne!(InterpretResult::Success, InterpretResult::RuntimeError);
    }
}
