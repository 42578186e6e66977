//! Siskin CLI library.
//!
//! Provides the `Runtime` wrapper around a VM instance plus the REPL and
//! error types used by the `siskin` binary.

#![warn(missing_docs)]

pub mod cli;
pub mod error;
pub mod repl;
pub mod runtime;

pub use cli::Cli;
pub use error::{CliError, CliResult};
pub use runtime::Runtime;
