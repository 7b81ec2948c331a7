//! Execution-state snapshotting (spec sections 4.10, 6.3, component F).
//!
//! A snapshot captures the global dictionary plus a chosen set of fibers —
//! their call stacks, locals, and the value a suspended fiber last yielded —
//! and re-hydrates them into a freshly constructed [`Vm`] later. The operand
//! stacks themselves (int/float/string/try/iterator/object) are *not*
//! persisted: a fiber is only meaningfully snapshotted between statements,
//! the same boundary `OP_YIELD` already treats as the resumption point, so a
//! restored frame resumes with empty operand stacks exactly as a freshly
//! pushed frame would. A fiber cancelled or snapshotted mid-expression would
//! not round-trip its partial operand stack; nothing in this crate drives a
//! save at such a point.
//!
//! Codeblocks are written once per distinct allocation (matched by `Rc`
//! pointer identity) and referenced by index from each frame, rather than
//! duplicated per frame — frames routinely share one codeblock across many
//! call sites. [`SnapshotRef`] borrows those codeblocks for writing;
//! [`Snapshot`] owns them for reading back, since at that point nothing else
//! holds them yet.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::rc::Rc;

use crate::codeblock::CodeBlock;
use crate::dict::{DictEntry, Dictionary};
use crate::error::RuntimeFault;
use crate::fiber::{FiberId, FiberState};
use crate::format::{frame_payload, read_framed_payload};
use crate::frame::CallFrame;
use crate::types::TypeId;
use crate::value::{CustomValue, StringValue, Value, Zone};
use crate::vm::Vm;

const MAGIC_SNAP: [u8; 4] = *b"SNAP";
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
enum ZoneSnap {
    External,
    Packed,
    VmHeap,
    Return,
    /// A fiber-stack zone, remapped to its position in the snapshot's fiber
    /// list rather than the raw allocation number it held at save time —
    /// that number has no meaning once fibers are respawned on load.
    FiberSlot(u32),
}

#[derive(Debug, Serialize, Deserialize)]
enum ValueSnap {
    Str(String),
    Uint(u64),
    Float(f64),
    Custom { type_id: u16, zone: ZoneSnap, bits: u64 },
}

#[derive(Debug, Serialize, Deserialize)]
struct DictEntrySnap {
    name: String,
    value: ValueSnap,
    is_constant: bool,
    is_host_registered: bool,
    enforced_type: Option<u16>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DictSnap {
    entries: Vec<DictEntrySnap>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FrameSnap {
    codeblock_index: u32,
    ip: u32,
    scope_name: String,
    package_name: Option<String>,
    locals: DictSnap,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
enum FiberStateSnap {
    Ready,
    Running,
    Suspended,
    Finished,
    Faulted,
}

impl From<FiberState> for FiberStateSnap {
    fn from(state: FiberState) -> Self {
        match state {
            FiberState::Ready => FiberStateSnap::Ready,
            FiberState::Running => FiberStateSnap::Running,
            FiberState::Suspended => FiberStateSnap::Suspended,
            FiberState::Finished => FiberStateSnap::Finished,
            FiberState::Faulted => FiberStateSnap::Faulted,
        }
    }
}

impl From<FiberStateSnap> for FiberState {
    fn from(snap: FiberStateSnap) -> Self {
        match snap {
            FiberStateSnap::Ready => FiberState::Ready,
            FiberStateSnap::Running => FiberState::Running,
            FiberStateSnap::Suspended => FiberState::Suspended,
            FiberStateSnap::Finished => FiberState::Finished,
            FiberStateSnap::Faulted => FiberState::Faulted,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FiberSnap {
    state: FiberStateSnap,
    frames: Vec<FrameSnap>,
    last_yielded: Option<ValueSnap>,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    codeblocks: Vec<&'a CodeBlock>,
    globals: DictSnap,
    fibers: Vec<FiberSnap>,
}

#[derive(Deserialize)]
struct Snapshot {
    version: u32,
    codeblocks: Vec<CodeBlock>,
    globals: DictSnap,
    fibers: Vec<FiberSnap>,
}

fn zone_to_snap(zone: Zone, alloc_to_slot: &AHashMap<u16, u32>) -> ZoneSnap {
    match zone {
        Zone::External => ZoneSnap::External,
        Zone::Packed => ZoneSnap::Packed,
        Zone::VmHeap => ZoneSnap::VmHeap,
        Zone::Return => ZoneSnap::Return,
        Zone::Fiber(alloc) => ZoneSnap::FiberSlot(alloc_to_slot.get(&alloc).copied().unwrap_or(0)),
    }
}

fn zone_from_snap(snap: &ZoneSnap, slot_to_alloc: &AHashMap<u32, u16>) -> Zone {
    match snap {
        ZoneSnap::External => Zone::External,
        ZoneSnap::Packed => Zone::Packed,
        ZoneSnap::VmHeap => Zone::VmHeap,
        ZoneSnap::Return => Zone::Return,
        ZoneSnap::FiberSlot(slot) => Zone::Fiber(slot_to_alloc.get(slot).copied().unwrap_or(0)),
    }
}

fn value_to_snap(vm: &Vm, value: &Value, alloc_to_slot: &AHashMap<u16, u32>) -> ValueSnap {
    match value {
        Value::Str(sv) => ValueSnap::Str(vm.resolve_string_any(sv)),
        Value::Uint(v) => ValueSnap::Uint(*v),
        Value::Float(v) => ValueSnap::Float(*v),
        Value::Custom(c) => ValueSnap::Custom {
            type_id: c.type_id.raw(),
            zone: zone_to_snap(c.zone, alloc_to_slot),
            bits: c.bits,
        },
    }
}

fn value_from_snap(vm: &mut Vm, snap: &ValueSnap, slot_to_alloc: &AHashMap<u32, u16>) -> Value {
    match snap {
        ValueSnap::Str(s) => {
            if s.is_empty() {
                Value::Str(StringValue::Empty)
            } else {
                Value::Str(StringValue::Interned(vm.interns.intern(s, true)))
            }
        }
        ValueSnap::Uint(v) => Value::Uint(*v),
        ValueSnap::Float(v) => Value::Float(*v),
        ValueSnap::Custom { type_id, zone, bits } => Value::Custom(CustomValue {
            type_id: TypeId::from_raw(*type_id),
            zone: zone_from_snap(zone, slot_to_alloc),
            bits: *bits,
        }),
    }
}

fn dict_to_snap(vm: &Vm, dict: &Dictionary, alloc_to_slot: &AHashMap<u16, u32>) -> DictSnap {
    let entries = dict
        .iter()
        .map(|entry| DictEntrySnap {
            name: entry.name.as_str().to_owned(),
            value: value_to_snap(vm, &entry.value, alloc_to_slot),
            is_constant: entry.is_constant,
            is_host_registered: entry.is_host_registered,
            enforced_type: entry.enforced_type.map(TypeId::raw),
        })
        .collect();
    DictSnap { entries }
}

fn dict_from_snap(vm: &mut Vm, snap: &DictSnap, slot_to_alloc: &AHashMap<u32, u16>) -> Dictionary {
    let mut dict = Dictionary::new();
    for entry in &snap.entries {
        let name = vm.interns.intern(&entry.name, true);
        let value = value_from_snap(vm, &entry.value, slot_to_alloc);
        let mut restored = DictEntry::new(name, value);
        restored.is_constant = entry.is_constant;
        restored.is_host_registered = entry.is_host_registered;
        restored.enforced_type = entry.enforced_type.map(TypeId::from_raw);
        dict.set(restored);
    }
    dict
}

fn codeblock_index(codeblock: &Rc<CodeBlock>, seen: &mut AHashMap<usize, u32>, ordered: &mut Vec<Rc<CodeBlock>>) -> u32 {
    let key = Rc::as_ptr(codeblock) as usize;
    if let Some(&index) = seen.get(&key) {
        return index;
    }
    let index = ordered.len() as u32;
    seen.insert(key, index);
    ordered.push(codeblock.clone());
    index
}

/// Snapshots `root_fibers` and the global dictionary into a versioned,
/// framed byte buffer (spec section 4.10). Fibers not named in
/// `root_fibers` are left running and are not captured.
pub fn snapshot(vm: &Vm, root_fibers: &[FiberId]) -> Result<Vec<u8>, RuntimeFault> {
    let mut alloc_to_slot = AHashMap::new();
    for (slot, id) in root_fibers.iter().enumerate() {
        alloc_to_slot.insert(id.allocation(), slot as u32);
    }

    let mut seen_codeblocks = AHashMap::new();
    let mut ordered_codeblocks: Vec<Rc<CodeBlock>> = Vec::new();
    let mut fibers = Vec::with_capacity(root_fibers.len());

    for id in root_fibers {
        let fiber = vm
            .fiber(*id)
            .ok_or_else(|| RuntimeFault::BadCodeblock("snapshot: unknown fiber id".into()))?;
        let mut frames = Vec::with_capacity(fiber.frames.len());
        for frame in &fiber.frames {
            let index = codeblock_index(&frame.codeblock, &mut seen_codeblocks, &mut ordered_codeblocks);
            frames.push(FrameSnap {
                codeblock_index: index,
                ip: frame.ip,
                scope_name: frame.scope_name.as_str().to_owned(),
                package_name: frame.package_name.as_ref().map(|p| p.as_str().to_owned()),
                locals: dict_to_snap(vm, &frame.locals, &alloc_to_slot),
            });
        }
        let last_yielded = fiber.last_yielded.as_ref().map(|v| value_to_snap(vm, v, &alloc_to_slot));
        fibers.push(FiberSnap { state: fiber.state.into(), frames, last_yielded });
    }

    let globals = dict_to_snap(vm, &vm.globals, &alloc_to_slot);
    let codeblocks: Vec<&CodeBlock> = ordered_codeblocks.iter().map(|rc| rc.as_ref()).collect();
    let snap = SnapshotRef { version: SNAPSHOT_VERSION, codeblocks, globals, fibers };

    let payload = postcard::to_allocvec(&snap)
        .map_err(|err| RuntimeFault::BadCodeblock(format!("malformed snapshot: {err}")))?;
    Ok(frame_payload(MAGIC_SNAP, &payload))
}

/// Restores a snapshot previously produced by [`snapshot`], spawning a fresh
/// fiber per captured fiber and returning their new ids in the same order
/// the originals were passed to `snapshot` (spec section 4.10).
pub fn restore(vm: &mut Vm, bytes: &[u8]) -> Result<Vec<FiberId>, RuntimeFault> {
    let payload = read_framed_payload(MAGIC_SNAP, bytes)?;
    let snap: Snapshot =
        postcard::from_bytes(payload).map_err(|err| RuntimeFault::BadCodeblock(format!("malformed snapshot: {err}")))?;
    if snap.version != SNAPSHOT_VERSION {
        return Err(RuntimeFault::BadCodeblock(format!("unsupported snapshot version {}", snap.version)));
    }

    let codeblocks: Vec<Rc<CodeBlock>> = snap.codeblocks.into_iter().map(Rc::new).collect();

    let mut new_ids = Vec::with_capacity(snap.fibers.len());
    for _ in &snap.fibers {
        new_ids.push(vm.spawn_fiber());
    }
    let slot_to_alloc: AHashMap<u32, u16> = new_ids.iter().enumerate().map(|(slot, id)| (slot as u32, id.allocation())).collect();

    for (fiber_snap, new_id) in snap.fibers.into_iter().zip(new_ids.iter().copied()) {
        let mut frames = Vec::with_capacity(fiber_snap.frames.len());
        for frame_snap in fiber_snap.frames {
            let codeblock = codeblocks
                .get(frame_snap.codeblock_index as usize)
                .ok_or_else(|| RuntimeFault::BadCodeblock("snapshot: dangling codeblock index".into()))?
                .clone();
            let scope_name = vm.interns.intern(&frame_snap.scope_name, true);
            let package_name = frame_snap.package_name.as_deref().map(|p| vm.interns.intern(p, true));
            let scope_namespace = vm.dispatch.find(scope_name.clone(), package_name.clone());
            let locals = dict_from_snap(vm, &frame_snap.locals, &slot_to_alloc);
            let mut frame = CallFrame::new(codeblock, frame_snap.ip, scope_name, scope_namespace, package_name, 0, 0, 0, 0);
            frame.locals = locals;
            frames.push(frame);
        }
        let last_yielded = fiber_snap.last_yielded.as_ref().map(|v| value_from_snap(vm, v, &slot_to_alloc));
        vm.install_fiber(new_id, fiber_snap.state.into(), frames, last_yielded);
    }

    let globals = dict_from_snap(vm, &snap.globals, &slot_to_alloc);
    vm.globals = globals;

    Ok(new_ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile, AstArena, Node};
    use crate::vm::VmConfig;

    #[test]
    fn globals_round_trip_through_snapshot_and_restore() {
        let mut vm = Vm::new(VmConfig::default());
        vm.set_global("$score", Value::Uint(99));

        let bytes = snapshot(&vm, &[]).unwrap();
        let mut restored = Vm::new(VmConfig::default());
        restore(&mut restored, &bytes).unwrap();

        assert!(matches!(restored.get_global("$score"), Some(Value::Uint(99))));
    }

    #[test]
    fn a_suspended_fiber_round_trips_its_call_stack() {
        let mut vm = Vm::new(VmConfig::default());
        let mut arena = AstArena::new();
        let lit = arena.alloc(Node::IntLiteral(3));
        let assign = arena.alloc(Node::VarAssign { name: "%x".into(), value: lit });
        let block = arena.alloc(Node::Block(vec![assign]));
        let codeblock = Rc::new(compile(&arena, block, "suspend.cs").unwrap());

        let fiber = vm.spawn_fiber();
        let scope_name = vm.interns.intern("suspend.cs", true);
        let ns = vm.dispatch.find(scope_name.clone(), None);
        let mut frame = CallFrame::new(codeblock, 0, scope_name, ns, None, 0, 0, 0, 0);
        frame.locals.set(DictEntry::new(vm.interns.intern("%x", true), Value::Uint(3)));
        vm.install_fiber(fiber, FiberState::Suspended, vec![frame], Some(Value::Uint(3)));

        let bytes = snapshot(&vm, &[fiber]).unwrap();
        let mut restored = Vm::new(VmConfig::default());
        let new_ids = restore(&mut restored, &bytes).unwrap();
        assert_eq!(new_ids.len(), 1);
        let restored_fiber = restored.fiber(new_ids[0]).unwrap();
        assert_eq!(restored_fiber.frames.len(), 1);
        assert!(matches!(restored_fiber.last_yielded, Some(Value::Uint(3))));
    }
}
