//! Namespace/dispatch integration tests: native functions registered via
//! [`cscript::host`] are callable from compiled script bytecode through the
//! same `CallFunc`/`CallFuncResolve` path a script-defined function uses.

use std::rc::Rc;

use cscript::compiler::ast::{CallTarget, Node};
use cscript::compiler::AstArena;
use cscript::{compile, Outcome, Value, Vm, VmConfig};

#[test]
fn script_calls_a_registered_native_function() {
    let mut vm = Vm::new(VmConfig::default());

    // An unqualified call resolves against the *calling* frame's own
    // namespace (spec section 3.10), so the native function is registered
    // into the same namespace the script itself will execute in.
    let scope_name = vm.interns.intern("ns.cs", true);
    let ns = vm.dispatch.find(scope_name.clone(), None);

    // Call arguments are always marshalled through the string stack before
    // `CallFunc` builds argv (spec section 3.10's "argv is always text"
    // convention), so a native callback reached through compiled bytecode
    // sees heap-backed string values; this one ignores its args entirely to
    // stay within what a zero-arg native hook can portably do.
    let answer: Rc<dyn Fn(&[Value]) -> Result<Value, cscript::RuntimeFault>> = Rc::new(|_| Ok(Value::Uint(42)));
    vm.add_namespace_function(ns, "answer", answer, "answer()", 0, 0);

    let mut arena = AstArena::new();
    let call = arena.alloc(Node::Call { target: CallTarget::FreeFunction { namespace: None, name: "answer".into() }, args: vec![] });
    let ret = arena.alloc(Node::Return(Some(call)));
    let block = arena.alloc(Node::Block(vec![ret]));

    let codeblock = compile(&arena, block, "ns.cs").unwrap();
    let fiber = vm.spawn_fiber();
    match vm.exec_codeblock(fiber, Rc::new(codeblock), 0, scope_name, ns, &[]) {
        Outcome::Return(Value::Uint(n)) => assert_eq!(n, 42),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn package_activation_shadows_the_base_namespace() {
    let mut vm = Vm::new(VmConfig::default());
    let name = vm.interns.intern("greet", true);
    let pkg = vm.interns.intern("Overrides", true);

    let base_ns = vm.dispatch.find(name.clone(), None);
    let base: Rc<dyn Fn(&[Value]) -> Result<Value, cscript::RuntimeFault>> = Rc::new(|_| Ok(Value::Uint(1)));
    vm.add_namespace_function(base_ns, "greet", base, "", 0, 0);

    let pkg_ns = vm.dispatch.find(name.clone(), Some(pkg.clone()));
    let overridden: Rc<dyn Fn(&[Value]) -> Result<Value, cscript::RuntimeFault>> = Rc::new(|_| Ok(Value::Uint(2)));
    vm.add_namespace_function(pkg_ns, "greet", overridden, "", 0, 0);

    assert!(matches!(vm.call_function(base_ns, &name, &[]), Ok(Value::Uint(1))));
    vm.dispatch.activate_package(&pkg).unwrap();
    assert!(matches!(vm.call_function(base_ns, &name, &[]), Ok(Value::Uint(2))));
    vm.dispatch.deactivate_package(&pkg).unwrap();
    assert!(matches!(vm.call_function(base_ns, &name, &[]), Ok(Value::Uint(1))));
}
