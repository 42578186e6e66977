//! Error types for the CLI.

use std::fmt;

/// CLI-specific errors.
#[derive(Debug)]
pub enum CliError {
    /// File I/O error.
    Io(std::io::Error),

    /// The script failed to compile.
    Compile,

    /// The script aborted with a runtime error.
    Runtime,

    /// REPL failure.
    Repl(String),
}

impl CliError {
    /// The conventional process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Io(_) => 66,
            CliError::Compile => 65,
            CliError::Runtime => 70,
            CliError::Repl(_) => 74,
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Io(e) => write!(f, "File error: {e}"),
            CliError::Compile => write!(f, "Compile error"),
            CliError::Runtime => write!(f, "Runtime error"),
            CliError::Repl(s) => write!(f, "REPL error: {s}"),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        CliError::Io(err)
    }
}

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(CliError::Compile.exit_code(), 65);
        assert_eq!(CliError::Runtime.exit_code(), 70);
    }

    #[test]
    fn test_display() {
        assert_eq!(CliError::Compile.to_string(), "Compile error");
        assert!(CliError::Repl("boom".to_string()).to_string().contains("boom"));
    }
}
