//! Constant pools (spec section 3.5, component C).
//!
//! A [`StringPool`] backs both string literals and identifiers — an
//! identifier is just a string that [`crate::codeblock::CodeBlock::identifier`]
//! interns lazily at first use, so the compiler dedups both through the same
//! table. Each codeblock has two pools, global and function-local (spec
//! section 3.6); the compiler keeps one [`StringPool`]/[`FloatPool`] pair per
//! scope and switches which one it writes into when entering a function body.

use ahash::AHashMap;

/// Deduplicates string constants by exact byte content, matching the
/// compiler's requirement that two literals with the same text (and the same
/// case-sensitivity flag) share one pool slot (spec section 3.5).
#[derive(Default)]
pub struct StringPool {
    entries: Vec<Box<str>>,
    index: AHashMap<Box<str>, u32>,
}

impl StringPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns `text`, returning its pool index. Identical text always
    /// returns the same index.
    pub fn intern(&mut self, text: &str) -> u32 {
        if let Some(&idx) = self.index.get(text) {
            return idx;
        }
        let idx = u32::try_from(self.entries.len()).expect("string pool overflow");
        self.entries.push(text.into());
        self.index.insert(text.into(), idx);
        idx
    }

    /// Reserves a slot for a tagged string (spec section 3.5: "tagged strings
    /// reserve a decimal tag-id space" — distinct storage from plain literals
    /// even when the text happens to match one, since a tag carries a numeric
    /// id that plain string dedup must not collapse).
    pub fn intern_tagged(&mut self, tag: u32, text: &str) -> u32 {
        let keyed = format!("\0tag:{tag}:{text}");
        self.intern(&keyed)
    }

    #[must_use]
    pub fn into_entries(self) -> Vec<Box<str>> {
        self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Deduplicates `f64` constants by bit pattern (spec section 3.5: "unique
/// float pool, index equals the operand"). Keyed by bits rather than value
/// since `f64` has no total order (`NaN`), and two `NaN` payloads from the
/// same literal text should still collapse to one slot.
#[derive(Default)]
pub struct FloatPool {
    entries: Vec<f64>,
    index: AHashMap<u64, u32>,
}

impl FloatPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, value: f64) -> u32 {
        let bits = value.to_bits();
        if let Some(&idx) = self.index.get(&bits) {
            return idx;
        }
        let idx = u32::try_from(self.entries.len()).expect("float pool overflow");
        self.entries.push(value);
        self.index.insert(bits, idx);
        idx
    }

    #[must_use]
    pub fn into_entries(self) -> Vec<f64> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_pool_dedups_identical_text() {
        let mut pool = StringPool::new();
        let a = pool.intern("hello");
        let b = pool.intern("hello");
        let c = pool.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn tagged_strings_reserve_distinct_slots() {
        let mut pool = StringPool::new();
        let plain = pool.intern("hello");
        let tagged = pool.intern_tagged(7, "hello");
        assert_ne!(plain, tagged);
    }

    #[test]
    fn float_pool_dedups_by_bits() {
        let mut pool = FloatPool::new();
        let a = pool.intern(1.5);
        let b = pool.intern(1.5);
        assert_eq!(a, b);
        assert_eq!(pool.into_entries(), vec![1.5]);
    }
}
