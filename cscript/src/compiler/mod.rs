//! The compiler: AST in, bytecode [`crate::codeblock::CodeBlock`] out (spec
//! section 4, components C/D/E).
//!
//! Lexing and parsing are out of scope — a host or an external front end
//! builds the [`ast::AstArena`] this module consumes. This mirrors how
//! `monty`'s own compiler module separates "build a tree" from "walk a tree
//! into bytecode": the tree-building half simply doesn't exist here.

pub mod ast;
pub mod emit;
pub mod pool;

pub use ast::{AstArena, BinOp, CallTarget, CmpOp, Node, NodeId, TypeReq, UnOp};
pub use emit::Compiler;

use crate::codeblock::CodeBlock;
use crate::error::CompileError;

/// Compiles `root` (a top-level block) from `arena` into a finished
/// [`CodeBlock`], named for error messages as `file_name`.
pub fn compile(arena: &AstArena, root: NodeId, file_name: impl Into<String>) -> Result<CodeBlock, CompileError> {
    Compiler::new(arena, file_name).compile(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_function_entry_point_round_trips_a_trivial_script() {
        let mut arena = AstArena::new();
        let lit = arena.alloc(Node::IntLiteral(5));
        let assign = arena.alloc(Node::VarAssign { name: "$x".into(), value: lit });
        let block = arena.alloc(Node::Block(vec![assign]));
        let cb = compile(&arena, block, "script.cs").unwrap();
        assert_eq!(&*cb.file_name, "script.cs");
    }
}
