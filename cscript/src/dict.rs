//! Variable dictionaries (spec section 3.7).
//!
//! The global dictionary is owned by the VM; each call frame owns its own
//! local dictionary (spec section 3.8). Both are the same [`Dictionary`] type.

use ahash::AHashMap;

use crate::intern::Interned;
use crate::object::HeapId;
use crate::types::TypeId;
use crate::value::Value;

/// One variable entry (spec section 3.7).
pub struct DictEntry {
    pub name: Interned,
    pub value: Value,
    /// For string/large-custom values, the VM-heap allocation backing this
    /// entry's payload, if any.
    pub heap_alloc: Option<HeapId>,
    pub is_constant: bool,
    /// `true` if this entry is a registered host variable (points at a host
    /// variable rather than owning its own storage).
    pub is_host_registered: bool,
    /// If set, assignments are coerced to this type via the type registry.
    pub enforced_type: Option<TypeId>,
}

impl DictEntry {
    #[must_use]
    pub fn new(name: Interned, value: Value) -> Self {
        Self {
            name,
            value,
            heap_alloc: None,
            is_constant: false,
            is_host_registered: false,
            enforced_type: None,
        }
    }
}

/// A hash table of variable entries (spec section 3.7), keyed by the
/// variable's interned name. Lookup is by pointer identity of the `Interned`
/// key (consistent with the intern table's canonical-pointer guarantee).
#[derive(Default)]
pub struct Dictionary {
    entries: AHashMap<Interned, DictEntry>,
}

impl Dictionary {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, name: &Interned) -> Option<&DictEntry> {
        self.entries.get(name)
    }

    pub fn get_mut(&mut self, name: &Interned) -> Option<&mut DictEntry> {
        self.entries.get_mut(name)
    }

    /// Inserts or overwrites an entry, returning the previous one if present.
    pub fn set(&mut self, entry: DictEntry) -> Option<DictEntry> {
        self.entries.insert(entry.name.clone(), entry)
    }

    /// Creates an entry on first write (`OP_SETCURVAR_CREATE` semantics).
    pub fn get_or_create_mut(&mut self, name: &Interned) -> &mut DictEntry {
        self.entries
            .entry(name.clone())
            .or_insert_with(|| DictEntry::new(name.clone(), Value::empty_string()))
    }

    pub fn remove(&mut self, name: &Interned) -> Option<DictEntry> {
        self.entries.remove(name)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DictEntry> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::InternTable;

    #[test]
    fn create_on_first_write_then_overwrite() {
        let mut interns = InternTable::new();
        let mut dict = Dictionary::new();
        let name = interns.intern("a", true);

        dict.get_or_create_mut(&name).value = Value::Uint(1);
        assert!(matches!(dict.get(&name).unwrap().value, Value::Uint(1)));

        dict.get_or_create_mut(&name).value = Value::Uint(2);
        assert_eq!(dict.len(), 1);
        assert!(matches!(dict.get(&name).unwrap().value, Value::Uint(2)));
    }
}
