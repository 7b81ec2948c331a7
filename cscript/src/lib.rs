//! An embeddable bytecode scripting engine for a C-family, object-oriented
//! game scripting language modeled on Torque Game Engine's Console/
//! TorqueScript system: AST-to-bytecode compiler, stack-based VM, cooperative
//! fibers, namespace/package dispatch, and a host object bridge.
//!
//! Lexing and parsing a textual script into an AST is out of scope — callers
//! (or a separate front-end crate) build an [`compiler::AstArena`] and hand
//! it to [`compiler::compile`]. Everything downstream of that — constant
//! pools, bytecode emission, the [`vm::Vm`] interpreter, namespace dispatch,
//! the object bridge, and `.dso` (de)serialization — lives here.

pub mod codeblock;
pub mod compiler;
pub mod dict;
pub mod dispatch;
pub mod error;
pub mod fiber;
pub mod format;
pub mod frame;
pub mod host;
pub mod intern;
pub mod object;
pub mod resource;
pub mod serialize;
pub mod types;
pub mod value;
pub mod vm;

pub use codeblock::CodeBlock;
pub use compiler::{compile, AstArena};
pub use error::{CompileError, Outcome, RuntimeFault};
pub use fiber::{Fiber, FiberId};
pub use object::{ClassDescriptor, ClassId, HeapId, ObjectBridge, ObjectFinder};
pub use value::Value;
pub use vm::{Vm, VmConfig};
