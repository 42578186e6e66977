//! The Siskin compiler: a lexer and a single-pass bytecode compiler.
//!
//! There is no AST. The compiler parses recursively (Pratt-style for
//! expressions) and writes bytecode bytes and a parallel source-line buffer
//! directly into a function prototype as it goes. On error it marks the
//! compilation failed but keeps parsing to report as much as it can.

#![warn(missing_docs)]

pub mod compiler;
pub mod lexer;
pub mod signature;
pub mod token;

pub use compiler::{compile, CompilerOptions};
pub use lexer::Lexer;
pub use signature::{SigKind, Signature};
pub use token::{Token, TokenKind, TokenValue};
