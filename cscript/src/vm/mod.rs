//! The stack-based bytecode interpreter (spec section 4.6, component G).
//!
//! One fiber runs at a time inside [`Vm::run`]/[`Vm::resume`]; the dispatch
//! loop returns to the host on return, yield, or fault (spec section 4.6,
//! 4.7). Nested script calls are modeled by pushing another [`CallFrame`] and
//! continuing the same loop rather than recursing into Rust — the call stack
//! *is* `fiber.frames`.

pub mod opcode;
pub mod stacks;

use std::rc::Rc;

use ahash::AHashMap;
use tracing::{trace, warn};

use crate::codeblock::CodeBlock;
use crate::dict::{DictEntry, Dictionary};
use crate::dispatch::{Dispatch, NamespaceEntry, NamespaceId, MAX_ACTIVE_PACKAGES};
use crate::error::{Outcome, RuntimeFault};
use crate::fiber::{Fiber, FiberId, FiberIdAllocator, FiberState};
use crate::frame::CallFrame;
use crate::intern::{Interned, InternTable};
use crate::object::{ClassDescriptor, ClassId, HeapId, ObjectBridge};
use crate::resource::{LimitedTracker, NoLimitTracker, ResourceLimits, ResourceTracker};
use crate::types::{Op, TypeRegistry};
use crate::value::{str_to_float, str_to_uint, StringValue, Value};
use opcode::Opcode;
use stacks::{IterData, IterFrame, Separator, TryRecord};

/// Configuration accepted by [`Vm::new`] (spec section 6.1, `createVM`).
#[derive(Debug, Clone, Copy, Default)]
pub struct VmConfig {
    pub trace: bool,
    /// Step/frame budget enforced via a [`LimitedTracker`]; `None` keeps the
    /// default [`NoLimitTracker`] (spec section 5, "resource ownership").
    pub limits: Option<ResourceLimits>,
    /// Caps simultaneously active packages (spec section 4.8); `None` keeps
    /// [`crate::dispatch::MAX_ACTIVE_PACKAGES`].
    pub max_active_packages: Option<usize>,
}

/// Owns every shared VM subsystem: interns, types, namespaces, objects, the
/// global dictionary, and the set of live fibers (spec section 5,
/// "Fibers... share only: the intern table, the type registry, the namespace
/// set, the global dictionary, and object handles").
pub struct Vm {
    pub interns: InternTable,
    pub types: TypeRegistry,
    pub dispatch: Dispatch,
    pub objects: ObjectBridge,
    pub globals: Dictionary,
    fibers: AHashMap<FiberId, Fiber>,
    fiber_alloc: FiberIdAllocator,
    string_heap: AHashMap<HeapId, Box<str>>,
    next_heap_slot: u32,
    class_by_name: AHashMap<Interned, ClassId>,
    tracker: Box<dyn ResourceTracker>,
    trace: bool,

    // "Current ___" registers (spec section 4.6, "Dispatch invariants"),
    // invalidated on frame pop.
    current_var: Option<Interned>,
    current_object: Option<HeapId>,
    current_field: Option<(Interned, Option<u32>)>,
    pending_call: Option<(NamespaceId, Interned)>,
}

impl Vm {
    #[must_use]
    pub fn new(config: VmConfig) -> Self {
        let tracker: Box<dyn ResourceTracker> = match config.limits {
            Some(limits) => Box::new(LimitedTracker::new(limits)),
            None => Box::new(NoLimitTracker),
        };
        Self {
            interns: InternTable::new(),
            types: TypeRegistry::new(),
            dispatch: Dispatch::with_max_active_packages(config.max_active_packages.unwrap_or(MAX_ACTIVE_PACKAGES)),
            objects: ObjectBridge::new(),
            globals: Dictionary::new(),
            fibers: AHashMap::new(),
            fiber_alloc: FiberIdAllocator::new(),
            string_heap: AHashMap::new(),
            next_heap_slot: 0,
            class_by_name: AHashMap::new(),
            tracker,
            trace: config.trace,
            current_var: None,
            current_object: None,
            current_field: None,
            pending_call: None,
        }
    }

    pub fn set_tracker(&mut self, tracker: impl ResourceTracker + 'static) {
        self.tracker = Box::new(tracker);
    }

    pub fn register_class(&mut self, descriptor: Box<dyn ClassDescriptor>) -> ClassId {
        let name = self.interns.intern(descriptor.name(), true);
        let id = self.objects.register_class(descriptor);
        self.class_by_name.insert(name, id);
        id
    }

    #[must_use]
    pub fn spawn_fiber(&mut self) -> FiberId {
        let id = self.fiber_alloc.alloc();
        self.fibers.insert(id, Fiber::new(id));
        id
    }

    /// Sets the cooperative cancellation flag (spec section 4.7); observed at
    /// the fiber's next safepoint.
    pub fn cancel(&mut self, fiber: FiberId) {
        if let Some(f) = self.fibers.get_mut(&fiber) {
            f.should_cancel = true;
        }
    }

    fn alloc_string(&mut self, text: &str) -> HeapId {
        let id = HeapId(self.next_heap_slot);
        self.next_heap_slot += 1;
        self.string_heap.insert(id, Box::from(text));
        id
    }

    /// Resolves a [`StringValue`] to text, given the fiber whose string
    /// accumulator backs `Return`/`Fiber` zones (spec section 3.2).
    fn resolve_string<'a>(&'a self, sv: &'a StringValue, fiber: &'a Fiber) -> &'a str {
        match sv {
            StringValue::Empty => "",
            StringValue::Interned(s) => s.as_str(),
            StringValue::Heap(id) => self.string_heap.get(id).map_or("", |s| &**s),
            StringValue::Return(offset) => fiber.string_stack.slice(*offset as usize, fiber.string_stack.current_offset()),
            StringValue::Fiber(_, offset) => {
                fiber.string_stack.slice(*offset as usize, fiber.string_stack.current_offset())
            }
        }
    }

    fn value_as_text(&self, v: &Value, fiber: &Fiber) -> String {
        match v {
            Value::Str(sv) => self.resolve_string(sv, fiber).to_owned(),
            Value::Uint(n) => n.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Custom(_) => self.types.as_uint(v, None).map(|n| n.to_string()).unwrap_or_default(),
        }
    }

    /// Pushes `codeblock`/`offset` as a fresh frame on `fiber` and runs it to
    /// completion or suspension (spec section 4.7, `exec_codeblock`).
    pub fn exec_codeblock(
        &mut self,
        fiber: FiberId,
        codeblock: Rc<CodeBlock>,
        offset: u32,
        scope_name: Interned,
        scope_namespace: NamespaceId,
        argv: &[Value],
    ) -> Outcome {
        let mut new_frame = {
            let f = match self.fibers.get_mut(&fiber) {
                Some(f) => f,
                None => return Outcome::Faulted(RuntimeFault::BadCodeblock("unknown fiber".into())),
            };
            f.string_stack.push_frame();
            let marker = f.string_stack.current_offset();
            let try_marker = f.try_stack.len();
            let int_depth = f.int_stack.depth();
            let float_depth = f.float_stack.depth();
            CallFrame::new(codeblock, offset, scope_name, scope_namespace, None, marker, try_marker, int_depth, float_depth)
        };
        for (i, arg) in argv.iter().enumerate() {
            let slot_name = self.interns.intern(&format!("%{i}"), true);
            new_frame.locals.set(DictEntry::new(slot_name, arg.clone()));
        }
        if let Some(f) = self.fibers.get_mut(&fiber) {
            f.frames.push(new_frame);
        }
        self.drive(fiber, None)
    }

    /// `call_function(ns, name, argv)` (spec section 4.7): resolves `name` in
    /// `ns` and invokes it synchronously, returning its value directly
    /// (native callbacks run inline; script functions run a nested fiber).
    pub fn call_function(&mut self, ns: NamespaceId, name: &Interned, argv: &[Value]) -> Result<Value, RuntimeFault> {
        let entry = self
            .dispatch
            .resolve(ns, name)
            .ok_or_else(|| RuntimeFault::MethodNotFound(name.to_string()))?;
        match entry {
            NamespaceEntry::Native(native) => (native.callback)(argv),
            NamespaceEntry::Script { codeblock, offset } => {
                let codeblock = codeblock.clone();
                let offset = *offset;
                let fiber = self.spawn_fiber();
                match self.exec_codeblock(fiber, codeblock, offset, name.clone(), ns, argv) {
                    Outcome::Return(v) => Ok(v),
                    Outcome::Yielded(_) => Err(RuntimeFault::BadCodeblock(
                        "call_function: callee yielded without a resumable handle".into(),
                    )),
                    Outcome::Faulted(fault) => Err(fault),
                }
            }
            NamespaceEntry::Grouping(_) => Err(RuntimeFault::MethodNotFound(name.to_string())),
        }
    }

    /// `call_method(object, name, argv)` (spec section 4.7, 4.9): dispatches
    /// through the object's class namespace (falling back to its
    /// `namespace_override`), with the object bound as the call's implicit
    /// receiver via `current_object`.
    pub fn call_method(&mut self, obj: HeapId, name: &Interned, argv: &[Value]) -> Result<Value, RuntimeFault> {
        let handle = self
            .objects
            .get(obj)
            .ok_or_else(|| RuntimeFault::BadCodeblock("stale object handle".into()))?;
        let class_name = self
            .objects
            .class(handle.class_id)
            .ok_or_else(|| RuntimeFault::BadCodeblock("unknown class id".into()))?
            .name()
            .to_owned();
        let ns_name = handle.namespace_override.clone().unwrap_or_else(|| self.interns.intern(&class_name, true));
        let ns = self.dispatch.find(ns_name, None);
        self.current_object = Some(obj);
        self.call_function(ns, name, argv)
    }

    /// Looks up a live fiber by id (spec section 4.10, serializer walk).
    #[must_use]
    pub fn fiber(&self, id: FiberId) -> Option<&Fiber> {
        self.fibers.get(&id)
    }

    /// Installs reconstructed state into an already-spawned fiber slot (spec
    /// section 4.10, snapshot load path). [`crate::serialize`] owns
    /// reconstructing frames/locals; this just reaches past the private
    /// `fibers` map to install the result.
    pub(crate) fn install_fiber(&mut self, id: FiberId, state: FiberState, frames: Vec<CallFrame>, last_yielded: Option<Value>) {
        if let Some(fiber) = self.fibers.get_mut(&id) {
            fiber.state = state;
            fiber.frames = frames;
            fiber.last_yielded = last_yielded;
        }
    }

    /// Resolves a [`StringValue`] without requiring the caller to already
    /// hold the one fiber it names (spec section 4.10: a dictionary entry
    /// being snapshotted isn't known to belong to any particular fiber's call
    /// stack). `Return`-zone values have no meaning outside an active frame
    /// and resolve to empty.
    pub(crate) fn resolve_string_any(&self, sv: &StringValue) -> String {
        match sv {
            StringValue::Empty => String::new(),
            StringValue::Interned(s) => s.as_str().to_owned(),
            StringValue::Heap(id) => self.string_heap.get(id).map_or_else(String::new, |s| s.to_string()),
            StringValue::Return(_) => String::new(),
            StringValue::Fiber(fid, offset) => self
                .fiber(*fid)
                .map(|f| f.string_stack.slice(*offset as usize, f.string_stack.current_offset()).to_owned())
                .unwrap_or_default(),
        }
    }

    /// Drives `fiber`'s dispatch loop until return, yield, or fault (spec
    /// section 4.6). `inject` is the value a `resume` call delivers at a
    /// prior `OP_YIELD` site.
    fn drive(&mut self, fiber_id: FiberId, inject: Option<Value>) -> Outcome {
        let mut fiber = match self.fibers.remove(&fiber_id) {
            Some(f) => f,
            None => return Outcome::Faulted(RuntimeFault::BadCodeblock("unknown fiber".into())),
        };
        fiber.state = FiberState::Running;
        let span = tracing::trace_span!("fiber_run", fiber = fiber_id.allocation());
        let _enter = span.enter();

        if let Some(v) = inject {
            self.push_value(&mut fiber, v);
        }

        let result = self.run_loop(&mut fiber);

        fiber.state = match &result {
            Ok(Outcome::Return(_)) => FiberState::Finished,
            Ok(Outcome::Yielded(_)) => FiberState::Suspended,
            Ok(Outcome::Faulted(_)) | Err(_) => FiberState::Faulted,
        };
        let outcome = result.unwrap_or_else(Outcome::Faulted);
        if let Outcome::Faulted(fault) = &outcome {
            warn!(fiber = fiber_id.allocation(), %fault, "fiber faulted");
        }
        self.fibers.insert(fiber_id, fiber);
        outcome
    }

    pub fn run(&mut self, fiber: FiberId) -> Outcome {
        self.drive(fiber, None)
    }

    pub fn resume(&mut self, fiber: FiberId, value: Value) -> Outcome {
        self.drive(fiber, Some(value))
    }

    /// Pushes a value onto the stack matching its tag — used both for
    /// `resume`'s injection and for native callback return values.
    fn push_value(&mut self, fiber: &mut Fiber, v: Value) {
        match v {
            Value::Uint(n) => {
                let _ = fiber.int_stack.push(n as i64);
            }
            Value::Float(f) => {
                let _ = fiber.float_stack.push(f);
            }
            Value::Str(sv) => {
                let text = self.resolve_string(&sv, fiber).to_owned();
                fiber.string_stack.advance(Separator::None, &text);
            }
            Value::Custom(_) => {
                let _ = fiber.int_stack.push(0);
            }
        }
    }

    fn run_loop(&mut self, fiber: &mut Fiber) -> Result<Outcome, RuntimeFault> {
        loop {
            self.tracker.consume_step()?;
            if fiber.check_cancel() {
                return Err(RuntimeFault::Cancelled);
            }

            let Some(frame) = fiber.frames.last() else {
                return Ok(Outcome::Return(Value::empty_string()));
            };
            let codeblock = frame.codeblock.clone();
            let mut ip = frame.ip;

            let Some(&opbyte) = codeblock.code.get(ip as usize) else {
                return Err(RuntimeFault::BadCodeblock("ip past end of code".into()));
            };
            let Some(op) = Opcode::from_byte(opbyte) else {
                return Err(RuntimeFault::BadOpcode(opbyte));
            };
            ip += 1;

            if self.trace {
                trace!(ns_fn = %frame.scope_name, ip = frame.ip, op = %op, "dispatch");
            }

            match self.exec_one(fiber, &codeblock, op, &mut ip)? {
                Step::Continue => {
                    if let Some(f) = fiber.frames.last_mut() {
                        f.ip = ip;
                    }
                }
                Step::Return(v) => {
                    self.pop_frame_return(fiber)?;
                    if fiber.frames.is_empty() {
                        return Ok(Outcome::Return(v));
                    }
                    self.push_value(fiber, v);
                }
                Step::Yield(v) => {
                    if let Some(f) = fiber.frames.last_mut() {
                        f.ip = ip;
                    }
                    fiber.last_yielded = Some(v.clone());
                    return Ok(Outcome::Yielded(v));
                }
            }
        }
    }

    /// Unwinds one frame on `OP_RETURN`, checking stack balance and
    /// propagating the operand-stack markers (spec section 8, "Stack
    /// balance").
    fn pop_frame_return(&mut self, fiber: &mut Fiber) -> Result<(), RuntimeFault> {
        let frame = fiber.frames.pop().expect("pop_frame_return called with no frame");
        fiber.string_stack.pop_frame();
        fiber.try_stack.truncate(frame.try_stack_marker);
        if fiber.int_stack.depth() < frame.int_depth_at_entry || fiber.float_stack.depth() < frame.float_depth_at_entry {
            return Err(RuntimeFault::StackImbalance {
                expected: frame.int_depth_at_entry as u32,
                actual: fiber.int_stack.depth() as u32,
            });
        }
        self.current_var = None;
        self.current_object = None;
        self.current_field = None;
        Ok(())
    }

    /// Resolves the dictionary currently addressed by `name`: `$`-prefixed
    /// names are globals, everything else is the innermost frame's locals
    /// (the original engine's sigil-based scoping rule).
    fn dict_for<'a>(&'a mut self, fiber: &'a mut Fiber, name: &Interned) -> &'a mut Dictionary {
        if name.starts_with('$') {
            &mut self.globals
        } else {
            &mut fiber.frames.last_mut().expect("dict_for with no active frame").locals
        }
    }

    #[allow(clippy::too_many_lines)]
    fn exec_one(&mut self, fiber: &mut Fiber, cb: &Rc<CodeBlock>, op: Opcode, ip: &mut u32) -> Result<Step, RuntimeFault> {
        match op {
            Opcode::Jmp => {
                *ip = read_u32(&cb.code, ip)?;
            }
            Opcode::JmpIf | Opcode::JmpIfNp => {
                let target = read_u32(&cb.code, ip)?;
                let cond = fiber.int_stack.last().copied().unwrap_or(0) != 0;
                if op == Opcode::JmpIf {
                    fiber.int_stack.pop();
                }
                if cond {
                    *ip = target;
                }
            }
            Opcode::JmpIfNot | Opcode::JmpIfNotNp => {
                let target = read_u32(&cb.code, ip)?;
                let cond = fiber.int_stack.last().copied().unwrap_or(0) != 0;
                if op == Opcode::JmpIfNot {
                    fiber.int_stack.pop();
                }
                if !cond {
                    *ip = target;
                }
            }
            Opcode::JmpIfF => {
                let target = read_u32(&cb.code, ip)?;
                if fiber.float_stack.pop().unwrap_or(0.0) != 0.0 {
                    *ip = target;
                }
            }
            Opcode::JmpIfFNot => {
                let target = read_u32(&cb.code, ip)?;
                if fiber.float_stack.pop().unwrap_or(0.0) == 0.0 {
                    *ip = target;
                }
            }

            Opcode::Return => {
                let kind = read_u32(&cb.code, ip)?;
                let v = match kind {
                    1 => Value::Float(fiber.float_stack.pop().unwrap_or(0.0)),
                    2 => {
                        let start = fiber.string_stack.frame_start();
                        let text = fiber.string_stack.slice(start, fiber.string_stack.current_offset()).to_owned();
                        fiber.string_stack.pop_frame();
                        Value::Str(StringValue::Heap(self.alloc_string(&text)))
                    }
                    _ => Value::Uint(fiber.int_stack.pop().unwrap_or(0) as u64),
                };
                return Ok(Step::Return(v));
            }

            Opcode::ReturnVar => {
                let idx = read_u32(&cb.code, ip)?;
                let name = cb.identifier(idx, &mut self.interns);
                let value = self.dict_for(fiber, &name).get(&name).map(|e| e.value.clone()).unwrap_or_else(Value::empty_string);
                return Ok(Step::Return(value));
            }

            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod | Opcode::BitAnd | Opcode::BitOr
            | Opcode::Xor | Opcode::Shl | Opcode::Shr | Opcode::CmpEq | Opcode::CmpNe | Opcode::CmpLt | Opcode::CmpLe
            | Opcode::CmpGr | Opcode::CmpGe => {
                let b = fiber.int_stack.pop().unwrap_or(0);
                let a = fiber.int_stack.pop().unwrap_or(0);
                let result = self.types.perform_op(to_op(op), &Value::Uint(a as u64), Some(&Value::Uint(b as u64)))?;
                fiber.int_stack.push(as_uint(&result) as i64)?;
            }
            Opcode::And => {
                let b = fiber.int_stack.pop().unwrap_or(0) != 0;
                let a = fiber.int_stack.pop().unwrap_or(0) != 0;
                fiber.int_stack.push(i64::from(a && b))?;
            }
            Opcode::Or => {
                let b = fiber.int_stack.pop().unwrap_or(0) != 0;
                let a = fiber.int_stack.pop().unwrap_or(0) != 0;
                fiber.int_stack.push(i64::from(a || b))?;
            }
            Opcode::Neg | Opcode::OnesComplement | Opcode::Not | Opcode::NotF => {
                let a = fiber.int_stack.pop().unwrap_or(0);
                let result = self.types.perform_op(to_op(op), &Value::Uint(a as u64), None)?;
                fiber.int_stack.push(as_uint(&result) as i64)?;
            }

            Opcode::LoadImmedUint => {
                let v = read_u32(&cb.code, ip)?;
                fiber.int_stack.push(i64::from(v as i32))?;
            }
            Opcode::LoadImmedFlt => {
                let idx = read_u32(&cb.code, ip)?;
                fiber.float_stack.push(cb.pool_float(idx))?;
            }
            Opcode::LoadImmedStr | Opcode::TagToStr => {
                let idx = read_u32(&cb.code, ip)?;
                let text = cb.pool_string(idx).to_owned();
                fiber.string_stack.advance(Separator::None, &text);
            }
            Opcode::LoadImmedIdent => {
                let idx = read_u32(&cb.code, ip)?;
                let ident = cb.identifier(idx, &mut self.interns);
                fiber.string_stack.advance(Separator::None, ident.as_str());
            }

            Opcode::SetCurVar | Opcode::SetCurVarCreate => {
                let idx = read_u32(&cb.code, ip)?;
                let name = cb.identifier(idx, &mut self.interns);
                if op == Opcode::SetCurVarCreate {
                    self.dict_for(fiber, &name).get_or_create_mut(&name);
                }
                self.current_var = Some(name);
            }
            Opcode::SetCurVarArray | Opcode::SetCurVarArrayCreate => {
                let idx = read_u32(&cb.code, ip)?;
                let base = cb.identifier(idx, &mut self.interns);
                let array_index = fiber.int_stack.pop().unwrap_or(0);
                let full = format!("{base}{array_index}");
                let name = self.interns.intern(&full, true);
                if op == Opcode::SetCurVarArrayCreate {
                    self.dict_for(fiber, &name).get_or_create_mut(&name);
                }
                self.current_var = Some(name);
            }

            Opcode::LoadVarUint | Opcode::LoadVarFlt | Opcode::LoadVarStr => {
                let name = self.current_var.clone().ok_or_else(|| {
                    RuntimeFault::BadCodeblock("LOADVAR with no current variable".into())
                })?;
                let value = self.dict_for(fiber, &name).get(&name).map(|e| e.value.clone());
                let resolved = value.as_ref().and_then(|v| match v {
                    Value::Str(sv) => Some(self.resolve_string(sv, fiber).to_owned()),
                    _ => None,
                });
                match (op, value) {
                    (Opcode::LoadVarUint, Some(v)) => fiber.int_stack.push(self.types.as_uint(&v, resolved.as_deref())? as i64)?,
                    (Opcode::LoadVarUint, None) => fiber.int_stack.push(0)?,
                    (Opcode::LoadVarFlt, Some(v)) => fiber.float_stack.push(self.types.as_float(&v, resolved.as_deref())?)?,
                    (Opcode::LoadVarFlt, None) => fiber.float_stack.push(0.0)?,
                    (Opcode::LoadVarStr, Some(v)) => {
                        let text = self.value_as_text(&v, fiber);
                        fiber.string_stack.advance(Separator::None, &text);
                    }
                    (Opcode::LoadVarStr, None) => {}
                    _ => unreachable!(),
                }
            }
            Opcode::SaveVarUint | Opcode::SaveVarFlt | Opcode::SaveVarStr => {
                let name = self.current_var.clone().ok_or_else(|| {
                    RuntimeFault::BadCodeblock("SAVEVAR with no current variable".into())
                })?;
                let value = match op {
                    Opcode::SaveVarUint => Value::Uint(fiber.int_stack.pop().unwrap_or(0) as u64),
                    Opcode::SaveVarFlt => Value::Float(fiber.float_stack.pop().unwrap_or(0.0)),
                    Opcode::SaveVarStr => {
                        let start = fiber.string_stack.frame_start();
                        let text = fiber
                            .string_stack
                            .slice(start, fiber.string_stack.current_offset())
                            .to_owned();
                        fiber.string_stack.pop_frame();
                        Value::Str(StringValue::Heap(self.alloc_string(&text)))
                    }
                    _ => unreachable!(),
                };
                let dict = self.dict_for(fiber, &name);
                dict.get_or_create_mut(&name).value = value;
            }

            Opcode::SetCurObject => {
                let id = fiber.int_stack.pop().unwrap_or(-1);
                self.current_object = if id >= 0 { Some(HeapId(id as u32)) } else { None };
            }
            Opcode::SetCurObjectNew => {
                self.current_object = fiber.object_stack.last().copied();
            }
            Opcode::SetCurField => {
                let idx = read_u32(&cb.code, ip)?;
                let name = cb.identifier(idx, &mut self.interns);
                self.current_field = Some((name, None));
            }
            Opcode::SetCurFieldArray => {
                let idx = read_u32(&cb.code, ip)?;
                let name = cb.identifier(idx, &mut self.interns);
                let array_index = fiber.int_stack.pop().unwrap_or(0) as u32;
                self.current_field = Some((name, Some(array_index)));
            }

            Opcode::LoadFieldUint | Opcode::LoadFieldFlt | Opcode::LoadFieldStr => {
                let (obj, name, idx) = self.field_target()?;
                let value = self.objects.get_field(obj, name.as_str(), idx)?;
                let resolved = value.as_ref().and_then(|v| match v {
                    Value::Str(sv) => Some(self.resolve_string(sv, fiber).to_owned()),
                    _ => None,
                });
                match (op, value) {
                    (Opcode::LoadFieldUint, Some(v)) => fiber.int_stack.push(self.types.as_uint(&v, resolved.as_deref())? as i64)?,
                    (Opcode::LoadFieldFlt, Some(v)) => fiber.float_stack.push(self.types.as_float(&v, resolved.as_deref())?)?,
                    (Opcode::LoadFieldStr, Some(v)) => {
                        let text = self.value_as_text(&v, fiber);
                        fiber.string_stack.advance(Separator::None, &text);
                    }
                    (Opcode::LoadFieldUint, None) => fiber.int_stack.push(0)?,
                    (Opcode::LoadFieldFlt, None) => fiber.float_stack.push(0.0)?,
                    _ => {}
                }
            }
            Opcode::SaveFieldUint | Opcode::SaveFieldFlt | Opcode::SaveFieldStr => {
                let (obj, name, idx) = self.field_target()?;
                let value = match op {
                    Opcode::SaveFieldUint => Value::Uint(fiber.int_stack.pop().unwrap_or(0) as u64),
                    Opcode::SaveFieldFlt => Value::Float(fiber.float_stack.pop().unwrap_or(0.0)),
                    Opcode::SaveFieldStr => {
                        let start = fiber.string_stack.frame_start();
                        let text = fiber
                            .string_stack
                            .slice(start, fiber.string_stack.current_offset())
                            .to_owned();
                        fiber.string_stack.pop_frame();
                        Value::Str(StringValue::Heap(self.alloc_string(&text)))
                    }
                    _ => unreachable!(),
                };
                self.objects.set_field(obj, name.as_str(), idx, value)?;
            }

            Opcode::CreateObject => {
                let class_idx = read_u32(&cb.code, ip)?;
                let name_idx = read_u32(&cb.code, ip)?;
                let is_datablock = read_u32(&cb.code, ip)? != 0;
                let class_name = cb.pool_string(class_idx).to_owned();
                let object_name = cb.pool_string(name_idx);
                let object_name = (!object_name.is_empty()).then_some(object_name);
                let class_interned = self.interns.intern(&class_name, true);
                let class_id = *self
                    .class_by_name
                    .get(&class_interned)
                    .ok_or_else(|| RuntimeFault::BadCodeblock(format!("unknown class {class_name}")))?;
                let argv: Vec<Value> = fiber
                    .string_stack
                    .current_frame_args()
                    .into_iter()
                    .map(|s| Value::Str(StringValue::Heap(self.alloc_string(&s))))
                    .collect();
                let id = self.objects.create_object(class_id, object_name, is_datablock, false, &argv)?;
                fiber.object_stack.push(id)?;
                self.current_object = Some(id);
            }
            Opcode::AddObject => {
                if let Some(&id) = fiber.object_stack.last() {
                    self.objects.add_object(id)?;
                }
            }
            Opcode::EndObject => {
                fiber.object_stack.pop();
                self.current_object = fiber.object_stack.last().copied();
            }

            Opcode::Push => {
                let v = Value::Uint(fiber.int_stack.pop().unwrap_or(0) as u64);
                self.push_value(fiber, v);
            }
            Opcode::PushFrame => {
                fiber.string_stack.push_frame();
            }

            Opcode::AdvanceStr => {
                let idx = read_u32(&cb.code, ip)?;
                let text = cb.pool_string(idx).to_owned();
                fiber.string_stack.advance(Separator::Space, &text);
            }
            Opcode::AdvanceStrComma => {
                let idx = read_u32(&cb.code, ip)?;
                let text = cb.pool_string(idx).to_owned();
                fiber.string_stack.advance(Separator::Comma, &text);
            }
            Opcode::AdvanceStrNul => {
                let idx = read_u32(&cb.code, ip)?;
                let text = cb.pool_string(idx).to_owned();
                fiber.string_stack.advance(Separator::Nul, &text);
            }
            Opcode::AdvanceStrAppendChar => {
                let ch = read_u32(&cb.code, ip)? as u8;
                fiber.string_stack.append_char(ch);
            }
            Opcode::RewindStr => {
                // Closes the isolated frame an `emit_expr` call opened
                // around a sub-expression that turned out not to be a
                // string, so the next sibling never sees its bytes.
                fiber.string_stack.pop_frame();
            }
            Opcode::TerminateRewindStr => {
                let offset = read_u32(&cb.code, ip)? as usize;
                fiber.string_stack.append_char(0);
                fiber.string_stack.rewind(offset);
            }
            Opcode::CompareStr => {
                let start = fiber.string_stack.frame_start();
                let a = fiber.string_stack.slice(start, fiber.string_stack.current_offset()).to_owned();
                fiber.string_stack.pop_frame();
                let b = read_u32(&cb.code, ip)?;
                let result = crate::types::string_cmp_eq(&a, cb.pool_string(b));
                fiber.int_stack.push(i64::from(result))?;
            }

            Opcode::CallFuncResolve => {
                let name_idx = read_u32(&cb.code, ip)?;
                let ns_idx = read_u32(&cb.code, ip)?;
                let name = cb.identifier(name_idx, &mut self.interns);
                let ns_name = cb.pool_string(ns_idx).to_owned();
                let ns = if ns_name.is_empty() {
                    fiber.frames.last().map_or_else(|| self.dispatch.find(name.clone(), None), |f| f.scope_namespace)
                } else {
                    let interned = self.interns.intern(&ns_name, true);
                    self.dispatch.find(interned, None)
                };
                self.pending_call = Some((ns, name));
            }
            Opcode::CallFunc => {
                let (ns, name) = self.pending_call.take().ok_or_else(|| {
                    RuntimeFault::BadCodeblock("CALLFUNC without CALLFUNC_RESOLVE".into())
                })?;
                let argv: Vec<Value> = fiber
                    .string_stack
                    .current_frame_args()
                    .into_iter()
                    .map(|s| Value::Str(StringValue::Heap(self.alloc_string(&s))))
                    .collect();
                fiber.string_stack.pop_frame();
                let entry = self.dispatch.resolve(ns, &name).ok_or_else(|| RuntimeFault::MethodNotFound(name.to_string()))?;
                match entry {
                    NamespaceEntry::Native(native) => {
                        let result = (native.callback)(&argv)?;
                        self.push_value(fiber, result);
                    }
                    NamespaceEntry::Script { codeblock, offset } => {
                        let codeblock = codeblock.clone();
                        let offset = *offset;
                        self.tracker.consume_frame()?;
                        fiber.string_stack.push_frame();
                        let marker = fiber.string_stack.current_offset();
                        let try_marker = fiber.try_stack.len();
                        let int_depth = fiber.int_stack.depth();
                        let float_depth = fiber.float_stack.depth();
                        let mut new_frame =
                            CallFrame::new(codeblock, offset, name.clone(), ns, None, marker, try_marker, int_depth, float_depth);
                        for (i, arg) in argv.into_iter().enumerate() {
                            let slot_name = self.interns.intern(&format!("%{i}"), true);
                            new_frame.locals.set(DictEntry::new(slot_name, arg));
                        }
                        fiber.frames.push(new_frame);
                    }
                    NamespaceEntry::Grouping(_) => return Err(RuntimeFault::MethodNotFound(name.to_string())),
                }
            }

            Opcode::IterBegin => {
                let name_idx = read_u32(&cb.code, ip)?;
                let _end_target = read_u32(&cb.code, ip)?;
                let var_name = cb.identifier(name_idx, &mut self.interns);
                // The collection was evaluated un-isolated (it shares the
                // ambient statement-level buffer, not a pushed sub-frame),
                // so this rewinds bytes without popping a frame marker.
                let start = fiber.string_stack.frame_start();
                let text = fiber.string_stack.slice(start, fiber.string_stack.current_offset()).to_owned();
                fiber.string_stack.rewind(start);
                let words: Vec<String> = text.split_whitespace().map(str::to_owned).collect();
                fiber.iterator_stack.push(IterFrame { var_name, index: 0, data: IterData::Words(words) })?;
            }
            Opcode::Iter => {
                let end_target = read_u32(&cb.code, ip)?;
                let done = {
                    let Some(top) = fiber.iterator_stack.last() else {
                        return Err(RuntimeFault::BadCodeblock("ITER with no active iterator".into()));
                    };
                    match &top.data {
                        IterData::Words(words) => top.index >= words.len(),
                        IterData::Heap(_) => true,
                    }
                };
                if done {
                    *ip = end_target;
                } else {
                    let (var_name, word) = {
                        let top = fiber.iterator_stack.last().unwrap();
                        let IterData::Words(words) = &top.data else { unreachable!() };
                        (top.var_name.clone(), words[top.index].clone())
                    };
                    if let Some(top) = fiber.iterator_stack.pop() {
                        let IterData::Words(words) = top.data else { unreachable!() };
                        let _ = fiber.iterator_stack.push(IterFrame {
                            var_name: top.var_name,
                            index: top.index + 1,
                            data: IterData::Words(words),
                        });
                    }
                    let value = Value::Str(StringValue::Heap(self.alloc_string(&word)));
                    self.dict_for(fiber, &var_name).get_or_create_mut(&var_name).value = value;
                }
            }
            Opcode::IterEnd => {
                fiber.iterator_stack.pop();
            }

            Opcode::TryBegin => {
                let mask = read_u32(&cb.code, ip)?;
                let catch_ip = read_u32(&cb.code, ip)?;
                let catch_var_idx = read_u32(&cb.code, ip)?;
                // Resolved now, against the codeblock that actually owns the
                // try/catch statement — a throw may unwind out of a callee
                // running a different codeblock, whose string pool wouldn't
                // agree with this index.
                let catch_var = (catch_var_idx != u32::MAX).then(|| cb.identifier(catch_var_idx, &mut self.interns));
                fiber.try_stack.push(TryRecord {
                    catch_ip,
                    mask,
                    catch_var,
                    frame_depth: fiber.frames.len() as u32,
                    int_depth: fiber.int_stack.depth(),
                    float_depth: fiber.float_stack.depth(),
                    string_offset: fiber.string_stack.current_offset(),
                });
            }
            Opcode::TryEnd => {
                fiber.try_stack.pop();
            }
            Opcode::Throw => {
                let mask = read_u32(&cb.code, ip)?;
                let value = Value::Uint(fiber.int_stack.pop().unwrap_or(0) as u64);
                let handler = fiber
                    .try_stack
                    .iter()
                    .rposition(|t| t.mask & mask != 0 || t.mask == 0)
                    .ok_or(RuntimeFault::UserThrow { mask, value: Box::new(value.clone()) })?;
                let record = fiber.try_stack[handler].clone();
                fiber.try_stack.truncate(handler);
                fiber.frames.truncate(record.frame_depth as usize);
                fiber.int_stack.truncate(record.int_depth);
                fiber.float_stack.truncate(record.float_depth);
                fiber.string_stack.rewind(record.string_offset);
                match &record.catch_var {
                    Some(name) => {
                        let name = name.clone();
                        self.dict_for(fiber, &name).get_or_create_mut(&name).value = value;
                    }
                    None => self.push_value(fiber, value),
                }
                if let Some(f) = fiber.frames.last_mut() {
                    f.ip = record.catch_ip;
                }
                *ip = record.catch_ip;
            }

            Opcode::Assert => {
                let message_idx = read_u32(&cb.code, ip)?;
                if fiber.int_stack.pop().unwrap_or(0) == 0 {
                    return Err(RuntimeFault::BadCodeblock(format!("assertion failed: {}", cb.pool_string(message_idx))));
                }
            }
            Opcode::Yield => {
                let v = Value::Uint(fiber.int_stack.pop().unwrap_or(0) as u64);
                return Ok(Step::Yield(v));
            }
            Opcode::BreakDebug => {}

            Opcode::FuncDecl => {
                let name_idx = read_u32(&cb.code, ip)?;
                let body_start = read_u32(&cb.code, ip)?;
                let end_skip = read_u32(&cb.code, ip)?;
                let name = cb.identifier(name_idx, &mut self.interns);
                let ns = fiber.frames.last().map(|f| f.scope_namespace).unwrap_or_else(|| self.dispatch.find(name.clone(), None));
                self.dispatch.add_entry(ns, name, NamespaceEntry::Script { codeblock: cb.clone(), offset: body_start });
                *ip = end_skip;
            }

            Opcode::StrToUint | Opcode::FltToUint | Opcode::UintToFlt | Opcode::StrToFlt | Opcode::UintToStr
            | Opcode::FltToStr | Opcode::StrToNone | Opcode::FltToNone | Opcode::UintToNone => {
                self.exec_coercion(fiber, op)?;
            }
        }
        Ok(Step::Continue)
    }

    fn exec_coercion(&mut self, fiber: &mut Fiber, op: Opcode) -> Result<(), RuntimeFault> {
        match op {
            // The isolated frame these read from is closed by the
            // `RewindStr` `emit_expr` emits right after the coercion, not
            // here, so a caller chaining another coercion off the same
            // frame (e.g. a nested numeric sub-expression) still sees it.
            Opcode::StrToUint => {
                let start = fiber.string_stack.frame_start();
                let text = fiber.string_stack.slice(start, fiber.string_stack.current_offset()).to_owned();
                fiber.int_stack.push(str_to_uint(&text) as i64)?;
            }
            Opcode::StrToFlt => {
                let start = fiber.string_stack.frame_start();
                let text = fiber.string_stack.slice(start, fiber.string_stack.current_offset()).to_owned();
                fiber.float_stack.push(str_to_float(&text))?;
            }
            Opcode::FltToUint => {
                let f = fiber.float_stack.pop().unwrap_or(0.0);
                fiber.int_stack.push(f as i64)?;
            }
            Opcode::UintToFlt => {
                let n = fiber.int_stack.pop().unwrap_or(0);
                fiber.float_stack.push(n as f64)?;
            }
            Opcode::UintToStr => {
                let n = fiber.int_stack.pop().unwrap_or(0);
                fiber.string_stack.advance(Separator::None, &n.to_string());
            }
            Opcode::FltToStr => {
                let f = fiber.float_stack.pop().unwrap_or(0.0);
                fiber.string_stack.advance(Separator::None, &f.to_string());
            }
            // A discarded string result is the other terminal consumer of
            // an isolated frame `emit_expr` left open (alongside `Return`,
            // `SaveVarStr`, `SaveFieldStr`), so it closes it here.
            Opcode::StrToNone => fiber.string_stack.pop_frame(),
            Opcode::FltToNone | Opcode::UintToNone => {}
            _ => unreachable!(),
        }
        Ok(())
    }

    fn field_target(&self) -> Result<(HeapId, Interned, Option<u32>), RuntimeFault> {
        let obj = self
            .current_object
            .ok_or_else(|| RuntimeFault::BadCodeblock("field access with no current object".into()))?;
        let (name, idx) = self
            .current_field
            .clone()
            .ok_or_else(|| RuntimeFault::BadCodeblock("field access with no current field".into()))?;
        Ok((obj, name, idx))
    }
}

enum Step {
    Continue,
    Return(Value),
    Yield(Value),
}

fn read_u32(code: &[u8], ip: &mut u32) -> Result<u32, RuntimeFault> {
    let start = *ip as usize;
    let bytes = code
        .get(start..start + 4)
        .ok_or_else(|| RuntimeFault::BadCodeblock("operand past end of code".into()))?;
    *ip += 4;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn as_uint(v: &Value) -> u64 {
    match v {
        Value::Uint(n) => *n,
        Value::Float(f) => *f as i64 as u64,
        _ => 0,
    }
}

fn to_op(op: Opcode) -> Op {
    match op {
        Opcode::Add => Op::Add,
        Opcode::Sub => Op::Sub,
        Opcode::Mul => Op::Mul,
        Opcode::Div => Op::Div,
        Opcode::Mod => Op::Mod,
        Opcode::BitAnd => Op::BitAnd,
        Opcode::BitOr => Op::BitOr,
        Opcode::Xor => Op::Xor,
        Opcode::Shl => Op::Shl,
        Opcode::Shr => Op::Shr,
        Opcode::Neg => Op::Neg,
        Opcode::OnesComplement => Op::OnesComplement,
        Opcode::Not => Op::Not,
        Opcode::NotF => Op::NotFloat,
        Opcode::CmpEq => Op::CmpEq,
        Opcode::CmpNe => Op::CmpNe,
        Opcode::CmpLt => Op::CmpLt,
        Opcode::CmpLe => Op::CmpLe,
        Opcode::CmpGr => Op::CmpGr,
        Opcode::CmpGe => Op::CmpGe,
        _ => unreachable!("to_op called with a non-operator opcode"),
    }
}
