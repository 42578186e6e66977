//! The Siskin bytecode instruction set and compiled code containers.
//!
//! Bytecode is a flat byte stream: each instruction is a one-byte opcode
//! followed by zero or more inline operands (unsigned, big-endian for
//! two-byte operands). The compiler emits directly into this form; the
//! interpreter decodes it with a single read per operand. The format is
//! internal and not a stable serialization format.

#![warn(missing_docs)]

pub mod dump;
pub mod opcode;
pub mod proto;

pub use dump::dump_proto;
pub use opcode::{Op, Operands};
pub use proto::{Constant, FnDebug, FnProto};
