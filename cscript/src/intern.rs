//! String interning with canonical pointer identity.
//!
//! Unlike an index-based interner, [`Interned`] wraps an `Rc<str>` and compares
//! by pointer (`Rc::ptr_eq`), matching the value model's requirement that two
//! interned strings for the same content are the *same* allocation (spec
//! section 3.1: "two interned strings for the same content compare equal by
//! address"). Interned strings never move and live as long as any handle to
//! them is held; the table itself is owned by the VM.
//!
//! Case-sensitive and case-insensitive interning are tracked in separate
//! tables, since the same bytes can have two different canonical instances
//! depending on which comparison mode the caller asked for.

use std::hash::{Hash, Hasher};
use std::rc::Rc;

use ahash::AHashMap;

/// A canonically-interned, immutable string.
///
/// Cloning is a refcount bump, not a copy of the bytes. Equality and hashing
/// are by pointer, not content — two `Interned` values with equal content but
/// produced by different interners (or with mismatched case-sensitivity) are
/// *not* equal.
#[derive(Clone, Debug)]
pub struct Interned(Rc<str>);

impl Interned {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for Interned {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Interned {}

impl Hash for Interned {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Hash the allocation's address, consistent with pointer equality.
        (Rc::as_ptr(&self.0) as *const () as usize).hash(state);
    }
}

impl std::ops::Deref for Interned {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Interned {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Owns the canonical string storage for a VM.
///
/// Two separate maps back the case-sensitive and case-insensitive namespaces:
/// `intern("Foo", true)` and `intern("foo", true)` are distinct entries, while
/// `intern("Foo", false)` and `intern("foo", false)` canonicalize to the same
/// entry (keyed by the lowercased content).
#[derive(Default)]
pub struct InternTable {
    sensitive: AHashMap<Box<str>, Interned>,
    insensitive: AHashMap<Box<str>, Interned>,
}

impl InternTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns `bytes`, returning the canonical instance.
    ///
    /// Insertion and lookup are the same operation: if the content (under the
    /// requested case-sensitivity) was already interned, the existing
    /// instance is returned; otherwise a new one is allocated and stored.
    pub fn intern(&mut self, bytes: &str, case_sensitive: bool) -> Interned {
        if case_sensitive {
            if let Some(existing) = self.sensitive.get(bytes) {
                return existing.clone();
            }
            let interned = Interned(Rc::from(bytes));
            self.sensitive.insert(Box::from(bytes), interned.clone());
            interned
        } else {
            let key = bytes.to_ascii_lowercase();
            if let Some(existing) = self.insensitive.get(key.as_str()) {
                return existing.clone();
            }
            // The canonical payload preserves the first-seen casing; only the
            // lookup key is folded.
            let interned = Interned(Rc::from(bytes));
            self.insensitive.insert(key.into_boxed_str(), interned.clone());
            interned
        }
    }

    /// Looks up `bytes` without inserting, for parser/serializer use where a
    /// miss should not grow the table.
    #[must_use]
    pub fn lookup(&self, bytes: &str, case_sensitive: bool) -> Option<Interned> {
        if case_sensitive {
            self.sensitive.get(bytes).cloned()
        } else {
            let key = bytes.to_ascii_lowercase();
            self.insensitive.get(key.as_str()).cloned()
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sensitive.len() + self.insensitive.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_identity_for_repeated_content() {
        let mut table = InternTable::new();
        let a = table.intern("foo", true);
        let b = table.intern("foo", true);
        assert_eq!(a, b);
        assert!(Rc::ptr_eq(&a.0, &b.0));
    }

    #[test]
    fn case_sensitive_and_insensitive_tables_are_distinct() {
        let mut table = InternTable::new();
        let sensitive_foo = table.intern("Foo", true);
        let sensitive_foo_lower = table.intern("foo", true);
        assert_ne!(sensitive_foo, sensitive_foo_lower);

        let insensitive_foo = table.intern("Foo", false);
        let insensitive_foo_lower = table.intern("foo", false);
        assert_eq!(insensitive_foo, insensitive_foo_lower);
    }

    #[test]
    fn lookup_without_insert_misses_cleanly() {
        let table = InternTable::new();
        assert!(table.lookup("never-interned", true).is_none());
    }
}
