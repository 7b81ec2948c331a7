//! The namespace/dispatch system (spec sections 3.10 and 4.8, component I).
//!
//! Namespaces live in an arena and are referenced by 32-bit indices (spec
//! section 9, "Cyclic parent references") rather than by raw pointer, so
//! moves are cheap and a generation counter catches dangling handles the same
//! way [`crate::fiber::FiberId`] does.

use std::cell::RefCell;
use std::rc::Rc;

use ahash::AHashMap;

use crate::codeblock::CodeBlock;
use crate::error::RuntimeFault;
use crate::intern::Interned;
use crate::value::Value;

pub const MAX_ACTIVE_PACKAGES: usize = 32;

/// 32-bit index into the namespace arena, with a generation guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NamespaceId {
    index: u32,
    generation: u32,
}

impl NamespaceId {
    fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

/// A native callback, collapsed to a single signature taking a typed argument
/// view and returning a value (spec section 9, "Native callback zoo") —
/// rather than the original six string/int/float/bool/void/value-specific
/// shapes, host code gets thin adapter shims (see [`crate::host`]) on top of
/// this one signature.
pub type NativeFn = Rc<dyn Fn(&[Value]) -> Result<Value, RuntimeFault>>;

pub struct NativeEntry {
    pub callback: NativeFn,
    pub usage: String,
    pub min_args: u32,
    pub max_args: u32,
}

/// One entry in a namespace's function table (spec section 3.10).
pub enum NamespaceEntry {
    Script { codeblock: Rc<CodeBlock>, offset: u32 },
    Native(NativeEntry),
    /// A grouping marker used only by the (out-of-scope) documentation
    /// dumper; carried here only so namespace entries round-trip.
    Grouping(String),
}

struct Namespace {
    name: Interned,
    parent: Option<NamespaceId>,
    package: Option<Interned>,
    entries: AHashMap<Interned, NamespaceEntry>,
    generation: u32,
}

/// Per-namespace memoized resolution cache: function name -> the namespace id
/// that actually owns the matching entry. Invalidated wholesale whenever the
/// dispatch system's `cache_sequence` advances (spec section 3.10: "a
/// per-namespace open-addressed hash is rebuilt lazily when a 'cache
/// sequence' counter changes").
#[derive(Default)]
struct Cache {
    sequence: u64,
    resolved: AHashMap<Interned, Option<NamespaceId>>,
}

/// Owns every namespace, the active-package stack, and the monotonic cache
/// sequence counter (spec sections 3.10, 4.8).
pub struct Dispatch {
    arena: Vec<Namespace>,
    cache: RefCell<Vec<Cache>>,
    by_name_and_package: AHashMap<(Interned, Option<Interned>), NamespaceId>,
    cache_sequence: u64,
    active_packages: Vec<Interned>,
    max_active_packages: usize,
}

impl Dispatch {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_active_packages(MAX_ACTIVE_PACKAGES)
    }

    /// Builds a dispatch system with a host-configured active-package limit
    /// (spec section 4.8; wired from [`crate::vm::VmConfig::max_active_packages`]).
    #[must_use]
    pub fn with_max_active_packages(max_active_packages: usize) -> Self {
        Self {
            arena: Vec::new(),
            cache: RefCell::new(Vec::new()),
            by_name_and_package: AHashMap::new(),
            cache_sequence: 0,
            active_packages: Vec::new(),
            max_active_packages,
        }
    }

    /// `find(name, package) -> namespace`, creating on first use (spec
    /// section 4.8).
    pub fn find(&mut self, name: Interned, package: Option<Interned>) -> NamespaceId {
        let key = (name.clone(), package.clone());
        if let Some(&id) = self.by_name_and_package.get(&key) {
            return id;
        }
        let index = u32::try_from(self.arena.len()).expect("namespace arena overflow");
        let generation = 0;
        self.arena.push(Namespace {
            name,
            parent: None,
            package,
            entries: AHashMap::new(),
            generation,
        });
        self.cache.borrow_mut().push(Cache::default());
        let id = NamespaceId::new(index, generation);
        self.by_name_and_package.insert(key, id);
        id
    }

    fn get(&self, id: NamespaceId) -> &Namespace {
        let ns = &self.arena[id.index as usize];
        debug_assert_eq!(ns.generation, id.generation, "stale NamespaceId");
        ns
    }

    fn get_mut(&mut self, id: NamespaceId) -> &mut Namespace {
        let ns = &mut self.arena[id.index as usize];
        debug_assert_eq!(ns.generation, id.generation, "stale NamespaceId");
        ns
    }

    /// `link(child, parent) -> bool` (spec section 4.8). Refuses if it would
    /// create a cycle.
    pub fn link(&mut self, child: NamespaceId, parent: NamespaceId) -> bool {
        if child == parent || self.is_ancestor(child, parent) {
            return false;
        }
        self.get_mut(child).parent = Some(parent);
        self.bump_cache_sequence();
        true
    }

    pub fn unlink(&mut self, child: NamespaceId) {
        self.get_mut(child).parent = None;
        self.bump_cache_sequence();
    }

    fn is_ancestor(&self, candidate: NamespaceId, start: NamespaceId) -> bool {
        let mut cur = Some(start);
        while let Some(id) = cur {
            if id == candidate {
                return true;
            }
            cur = self.get(id).parent;
        }
        false
    }

    /// Adds or replaces a function entry by name (spec section 3.10
    /// invariant: at most one entry per name per namespace; redefinition
    /// replaces in place).
    pub fn add_entry(&mut self, ns: NamespaceId, name: Interned, entry: NamespaceEntry) {
        self.get_mut(ns).entries.insert(name, entry);
        self.bump_cache_sequence();
    }

    fn bump_cache_sequence(&mut self) {
        self.cache_sequence += 1;
    }

    /// Method/function dispatch: resolves `name` by consulting this
    /// namespace's cache, walking parents on a miss and memoizing the result
    /// (spec section 4.8, "Dispatch algorithm").
    pub fn resolve(&self, ns: NamespaceId, name: &Interned) -> Option<&NamespaceEntry> {
        {
            let mut caches = self.cache.borrow_mut();
            let cache = &mut caches[ns.index as usize];
            if cache.sequence != self.cache_sequence {
                cache.resolved.clear();
                cache.sequence = self.cache_sequence;
            }
            if let Some(&owner) = cache.resolved.get(name) {
                drop(caches);
                return owner.and_then(|owner_id| self.get(owner_id).entries.get(name));
            }
        }

        let mut cur = Some(ns);
        let mut owner = None;
        while let Some(id) = cur {
            if self.get(id).entries.contains_key(name) {
                owner = Some(id);
                break;
            }
            cur = self.get(id).parent;
        }

        let mut caches = self.cache.borrow_mut();
        caches[ns.index as usize].resolved.insert(name.clone(), owner);
        drop(caches);
        owner.and_then(|owner_id| self.get(owner_id).entries.get(name))
    }

    /// `activate_package(P)` (spec section 4.8). Interposes every namespace
    /// tagged `package == P` ahead of its un-packaged counterpart and swaps
    /// their entry tables, exactly as `consoleNamespace.cc::activatePackage`
    /// does: `walk->mParent = parent->mParent; parent->mParent = walk;` then
    /// the entry-list pointers are exchanged.
    pub fn activate_package(&mut self, package: &Interned) -> Result<(), RuntimeFault> {
        if self.active_packages.iter().any(|p| p == package) {
            return Ok(());
        }
        if self.active_packages.len() >= self.max_active_packages {
            return Err(RuntimeFault::BadCodeblock(format!(
                "activatePackage({package}) failed - max package limit reached: {}",
                self.max_active_packages
            )));
        }

        let package_namespaces: Vec<NamespaceId> = (0..self.arena.len())
            .map(|i| NamespaceId::new(i as u32, self.arena[i].generation))
            .filter(|&id| self.get(id).package.as_ref() == Some(package))
            .collect();

        for walk in package_namespaces {
            let name = self.get(walk).name.clone();
            let base = self.find(name, None);
            if base == walk {
                continue;
            }
            let base_parent = self.get(base).parent;
            self.get_mut(walk).parent = base_parent;
            self.get_mut(base).parent = Some(walk);

            let walk_entries = std::mem::take(&mut self.get_mut(walk).entries);
            let base_entries = std::mem::take(&mut self.get_mut(base).entries);
            self.get_mut(walk).entries = base_entries;
            self.get_mut(base).entries = walk_entries;
        }

        self.active_packages.push(package.clone());
        self.bump_cache_sequence();
        Ok(())
    }

    /// `deactivate_package(P)` (spec section 4.8). Must undo the most
    /// recently activated package still on the stack — activation/
    /// deactivation is LIFO, so `P` is required to be the top entry.
    pub fn deactivate_package(&mut self, package: &Interned) -> Result<(), RuntimeFault> {
        match self.active_packages.last() {
            Some(top) if top == package => {}
            Some(_) | None => {
                return Err(RuntimeFault::BadCodeblock(format!(
                    "deactivatePackage({package}) failed - not the innermost active package"
                )))
            }
        }

        // Reversing activation is symmetric: re-run the same splice, which
        // swaps the entries back and restores each base's original parent.
        let package_namespaces: Vec<NamespaceId> = (0..self.arena.len())
            .map(|i| NamespaceId::new(i as u32, self.arena[i].generation))
            .filter(|&id| self.get(id).package.as_ref() == Some(package))
            .collect();

        for walk in package_namespaces {
            let name = self.get(walk).name.clone();
            let base = self.find(name, None);
            if base == walk {
                continue;
            }
            let walk_parent = self.get(walk).parent;
            self.get_mut(base).parent = walk_parent;
            self.get_mut(walk).parent = None;

            let walk_entries = std::mem::take(&mut self.get_mut(walk).entries);
            let base_entries = std::mem::take(&mut self.get_mut(base).entries);
            self.get_mut(walk).entries = base_entries;
            self.get_mut(base).entries = walk_entries;
        }

        self.active_packages.pop();
        self.bump_cache_sequence();
        Ok(())
    }
}

impl Default for Dispatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::InternTable;

    fn native(v: u64) -> NamespaceEntry {
        NamespaceEntry::Native(NativeEntry {
            callback: Rc::new(move |_| Ok(Value::Uint(v))),
            usage: String::new(),
            min_args: 0,
            max_args: 0,
        })
    }

    #[test]
    fn package_activation_and_deactivation_are_symmetric() {
        let mut interns = InternTable::new();
        let mut dispatch = Dispatch::new();
        let foo = interns.intern("foo", true);
        let pkg = interns.intern("P", true);

        let base_ns = dispatch.find(foo.clone(), None);
        dispatch.add_entry(base_ns, foo.clone(), native(1));

        let pkg_ns = dispatch.find(foo.clone(), Some(pkg.clone()));
        dispatch.add_entry(pkg_ns, foo.clone(), native(2));

        assert!(matches!(
            dispatch.resolve(base_ns, &foo),
            Some(NamespaceEntry::Native(n)) if (n.callback)(&[]).unwrap().type_id() == crate::types::TypeId::UINT
        ));

        dispatch.activate_package(&pkg).unwrap();
        let resolved = dispatch.resolve(base_ns, &foo).unwrap();
        let NamespaceEntry::Native(n) = resolved else { panic!() };
        assert!(matches!((n.callback)(&[]).unwrap(), Value::Uint(2)));

        dispatch.deactivate_package(&pkg).unwrap();
        let resolved = dispatch.resolve(base_ns, &foo).unwrap();
        let NamespaceEntry::Native(n) = resolved else { panic!() };
        assert!(matches!((n.callback)(&[]).unwrap(), Value::Uint(1)));
    }

    #[test]
    fn link_refuses_cycle() {
        let mut interns = InternTable::new();
        let mut dispatch = Dispatch::new();
        let a = dispatch.find(interns.intern("A", true), None);
        let b = dispatch.find(interns.intern("B", true), None);
        assert!(dispatch.link(b, a));
        assert!(!dispatch.link(a, b));
    }
}
