//! Integration tests compiling small ASTs and running them to completion,
//! exercising the compiler/VM boundary the way `os_tests.rs` exercises
//! `monty`'s bytecode builder against its interpreter.

use cscript::compiler::ast::{BinOp, Node, TypeReq};
use cscript::compiler::AstArena;
use cscript::{compile, Outcome, Value, Vm, VmConfig};

fn run_block(arena: &AstArena, block: cscript::compiler::ast::NodeId, name: &str) -> Outcome {
    let codeblock = compile(arena, block, name).unwrap();
    let mut vm = Vm::new(VmConfig::default());
    let fiber = vm.spawn_fiber();
    let scope_name = vm.interns.intern(name, true);
    let ns = vm.dispatch.find(scope_name.clone(), None);
    vm.exec_codeblock(fiber, std::rc::Rc::new(codeblock), 0, scope_name, ns, &[])
}

#[test]
fn integer_addition_returns_the_sum() {
    let mut arena = AstArena::new();
    let a = arena.alloc(Node::IntLiteral(17));
    let b = arena.alloc(Node::IntLiteral(25));
    let sum = arena.alloc(Node::Binary { op: BinOp::Add, lhs: a, rhs: b, req: TypeReq::Int });
    let ret = arena.alloc(Node::Return(Some(sum)));
    let block = arena.alloc(Node::Block(vec![ret]));

    match run_block(&arena, block, "add.cs") {
        Outcome::Return(Value::Uint(n)) => assert_eq!(n, 42),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn divide_by_zero_yields_zero_rather_than_faulting() {
    let mut arena = AstArena::new();
    let a = arena.alloc(Node::IntLiteral(10));
    let zero = arena.alloc(Node::IntLiteral(0));
    let div = arena.alloc(Node::Binary { op: BinOp::Div, lhs: a, rhs: zero, req: TypeReq::Int });
    let ret = arena.alloc(Node::Return(Some(div)));
    let block = arena.alloc(Node::Block(vec![ret]));

    match run_block(&arena, block, "div.cs") {
        Outcome::Return(Value::Uint(n)) => assert_eq!(n, 0),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn local_variable_assignment_and_read_round_trips() {
    let mut arena = AstArena::new();
    let lit = arena.alloc(Node::IntLiteral(9));
    let assign = arena.alloc(Node::VarAssign { name: "%x".into(), value: lit });
    let read = arena.alloc(Node::VarRead("%x".into()));
    let ret = arena.alloc(Node::Return(Some(read)));
    let block = arena.alloc(Node::Block(vec![assign, ret]));

    match run_block(&arena, block, "locals.cs") {
        Outcome::Return(Value::Uint(n)) => assert_eq!(n, 9),
        other => panic!("unexpected outcome: {other:?}"),
    }
}
