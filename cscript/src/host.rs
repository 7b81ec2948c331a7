//! Host-callable VM API and host-supplied callback traits (spec sections 6.1,
//! 6.2).
//!
//! Most of the host-callable surface is already exposed directly as inherent
//! methods on [`Vm`] (`spawn_fiber`, `call_function`, `call_method`,
//! `register_class`, `exec_codeblock`, `cancel`, ...); this module adds the
//! handful of conveniences that don't already live there — dictionary
//! get/set, native function registration, object field access by name, and
//! an `evalCode`-style one-shot helper — plus the callback traits a host
//! plugs in (spec section 6.2).

use crate::dict::DictEntry;
use crate::dispatch::{NamespaceEntry, NamespaceId, NativeEntry, NativeFn};
use crate::error::{Outcome, RuntimeFault};
use crate::object::{ClassId, HeapId, ObjectFinder};
use crate::types::TypeId;
use crate::value::Value;
use crate::vm::Vm;

/// Severity for the host log callback (spec section 6.2, "Log consumer
/// `(level, line, userPtr)`" — the `userPtr` half of that signature is just
/// `&mut self` here).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Warn,
    Error,
}

pub trait LogSink {
    fn log(&mut self, level: LogLevel, line: &str);
}

/// Optional telnet transport interface (spec section 6.2). The socket/thread
/// platform layer that would back a real implementation is out of scope
/// (spec section 1, "Host platform layer") — this trait exists only as the
/// seam an embedding host can plug a transport into; nothing in this crate
/// implements it.
pub trait TelnetTransport {
    fn open(&mut self, port: u16) -> Result<(), RuntimeFault>;
    fn close(&mut self);
    fn accept(&mut self) -> Option<u32>;
    fn recv(&mut self, connection: u32) -> Option<Vec<u8>>;
    fn send(&mut self, connection: u32, data: &[u8]);
    fn queue_eval(&mut self, connection: u32, source: String);
}

/// The callback bundle a host may assemble and hold alongside a [`Vm`] (spec
/// section 6.2). Not threaded through [`crate::vm::VmConfig`] itself: the
/// allocator callback is Rust's global allocator, and the per-type/per-class
/// interfaces are registered directly via
/// [`crate::types::TypeRegistry::register_type`]/[`Vm::register_class`]
/// rather than bundled here.
#[derive(Default)]
pub struct HostCallbacks {
    pub log: Option<Box<dyn LogSink>>,
    pub objects: Option<Box<dyn ObjectFinder>>,
    pub telnet: Option<Box<dyn TelnetTransport>>,
}

impl Vm {
    /// `setGlobal(vm, name, value)` (spec section 6.1).
    pub fn set_global(&mut self, name: &str, value: Value) {
        let interned = self.interns.intern(name, true);
        self.globals.get_or_create_mut(&interned).value = value;
    }

    /// `getGlobal(vm, name) -> value` (spec section 6.1).
    #[must_use]
    pub fn get_global(&self, name: &str) -> Option<Value> {
        let interned = self.interns.lookup(name, true)?;
        self.globals.get(&interned).map(|entry| entry.value.clone())
    }

    /// `registerGlobal(vm, name, type_id, host_ptr)` (spec section 6.1):
    /// marks the entry host-registered, so it is understood to alias a host
    /// variable rather than own its storage (spec section 3.7).
    pub fn register_global(&mut self, name: &str, type_id: TypeId, initial: Value) {
        let interned = self.interns.intern(name, true);
        let mut entry = DictEntry::new(interned, initial);
        entry.is_host_registered = true;
        entry.enforced_type = Some(type_id);
        self.globals.set(entry);
    }

    /// `addNamespaceFunction(vm, ns, name, callback, usage, minArgs, maxArgs)`
    /// (spec section 6.1), taking the collapsed single-signature callback
    /// form (spec section 9, "Native callback zoo").
    pub fn add_namespace_function(
        &mut self,
        ns: NamespaceId,
        name: &str,
        callback: NativeFn,
        usage: impl Into<String>,
        min_args: u32,
        max_args: u32,
    ) {
        let interned = self.interns.intern(name, true);
        self.dispatch.add_entry(
            ns,
            interned,
            NamespaceEntry::Native(NativeEntry { callback, usage: usage.into(), min_args, max_args }),
        );
    }

    /// `createObject(vm, class_id, name, argv) -> obj` (spec section 6.1),
    /// running `Create`/`ProcessArgs` but not `AddObject` — mirroring the
    /// `OP_CREATEOBJECT`/`OP_ADD_OBJECT` split the bytecode itself uses.
    pub fn create_object(
        &mut self,
        class_id: ClassId,
        name: Option<&str>,
        is_datablock: bool,
        argv: &[Value],
    ) -> Result<HeapId, RuntimeFault> {
        self.objects.create_object(class_id, name, is_datablock, false, argv)
    }

    /// `setObjectField(vm, obj, name, value, array_index)` (spec section 6.1).
    pub fn set_object_field(
        &mut self,
        obj: HeapId,
        name: &str,
        array_index: Option<u32>,
        value: Value,
    ) -> Result<bool, RuntimeFault> {
        self.objects.set_field(obj, name, array_index, value)
    }

    /// `getObjectField(vm, obj, name, array_index) -> value` (spec section 6.1).
    pub fn get_object_field(&self, obj: HeapId, name: &str, array_index: Option<u32>) -> Result<Option<Value>, RuntimeFault> {
        self.objects.get_field(obj, name, array_index)
    }

    /// Renders a value as text for host-side display (spec section 6.1), the
    /// same textual coercion `OP_UINT_TO_STR`/`OP_FLT_TO_STR` use, without
    /// requiring the caller to hold the originating fiber.
    #[must_use]
    pub fn display_value(&self, value: &Value) -> String {
        match value {
            Value::Str(sv) => self.resolve_string_any(sv),
            Value::Uint(n) => n.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Custom(_) => self.types.as_uint(value, None).map(|n| n.to_string()).unwrap_or_default(),
        }
    }

    pub fn inc_vm_ref(&mut self, obj: HeapId) {
        self.objects.inc_vm_ref(obj);
    }

    pub fn dec_vm_ref(&mut self, obj: HeapId) {
        self.objects.dec_vm_ref(obj);
    }

    /// `evalCode(vm, source, filename) -> value` (spec section 6.1):
    /// compiles an already-built AST to a codeblock and runs it to
    /// completion on a fresh fiber in one step. Lexing/parsing `source` into
    /// that AST is out of scope (spec section 1) — the caller hands in the
    /// arena/root it already built.
    pub fn eval_code(
        &mut self,
        arena: &crate::compiler::AstArena,
        root: crate::compiler::NodeId,
        file_name: impl Into<String>,
    ) -> Result<Value, RuntimeFault> {
        let file_name = file_name.into();
        let codeblock = crate::compiler::compile(arena, root, file_name.clone())
            .map_err(|err| RuntimeFault::BadCodeblock(err.to_string()))?;
        let fiber = self.spawn_fiber();
        let scope_name = self.interns.intern(&file_name, true);
        let ns = self.dispatch.find(scope_name.clone(), None);
        match self.exec_codeblock(fiber, std::rc::Rc::new(codeblock), 0, scope_name, ns, &[]) {
            Outcome::Return(v) => Ok(v),
            Outcome::Yielded(_) => Err(RuntimeFault::BadCodeblock("evalCode: top-level script yielded".into())),
            Outcome::Faulted(fault) => Err(fault),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{AstArena, Node};
    use crate::vm::VmConfig;

    #[test]
    fn set_and_get_global_round_trip() {
        let mut vm = Vm::new(VmConfig::default());
        vm.set_global("$foo", Value::Uint(42));
        assert!(matches!(vm.get_global("$foo"), Some(Value::Uint(42))));
    }

    #[test]
    fn get_global_on_unknown_name_is_none() {
        let vm = Vm::new(VmConfig::default());
        assert!(vm.get_global("$never-set").is_none());
    }

    #[test]
    fn eval_code_runs_a_trivial_script_to_completion() {
        let mut vm = Vm::new(VmConfig::default());
        let mut arena = AstArena::new();
        let lit = arena.alloc(Node::IntLiteral(7));
        let block = arena.alloc(Node::Block(vec![lit]));
        let result = vm.eval_code(&arena, block, "inline.cs");
        assert!(result.is_ok());
    }
}
