//! Error taxonomy (spec section 7).
//!
//! `CompileError` and `RuntimeFault` are plain `thiserror` enums rather than a
//! single catch-all error type, matching the boundary the spec draws between
//! a failed compile and a fault raised by a running fiber.

use crate::value::Value;

#[derive(Debug, Clone, thiserror::Error)]
#[error("{file}:{line}: {message}")]
pub struct CompileError {
    pub file: String,
    pub line: u32,
    pub message: String,
}

/// A mask of exception "kinds" a `try`/`catch` or `throw` can match (spec
/// section 4.7). Plain bitflags-shaped `u32`, matching the original engine's
/// representation rather than a closed Rust enum, since scripts can define
/// their own throw masks.
pub type ExceptionMask = u32;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeFault {
    #[error("stack overflow")]
    StackOverflow,
    #[error("stack imbalance on return: expected depth {expected}, got {actual}")]
    StackImbalance { expected: u32, actual: u32 },
    #[error("{0}: method not found")]
    MethodNotFound(String),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("bad opcode {0:#x}")]
    BadOpcode(u8),
    #[error("bad codeblock: {0}")]
    BadCodeblock(String),
    /// A script-level `throw` that no `catch` matched (spec section 7).
    #[error("unhandled throw (mask {mask:#x})")]
    UserThrow { mask: ExceptionMask, value: Box<Value> },
    #[error("cancelled")]
    Cancelled,
}

/// The tagged outcome of `run`/`resume`/`exec_codeblock` (spec sections 4.7, 7).
#[derive(Debug)]
pub enum Outcome {
    Return(Value),
    Yielded(Value),
    Faulted(RuntimeFault),
}
