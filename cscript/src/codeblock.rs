//! Compiled bytecode units (spec sections 3.6 and 4.5, component F).
//!
//! A `CodeBlock` is the output of the compiler and the persisted unit in a
//! `.dso` file (see [`crate::format`]): bytecode, a float table, and two
//! string tables (global-scope and function-local), plus a line-break table
//! for error reporting. Identifier resolution against the live intern table
//! is deliberately kept out of the serialized shape — see `identifiers`
//! below.

use std::cell::RefCell;

use serde::{Deserialize, Serialize};

use crate::intern::{Interned, InternTable};

/// Maps a bytecode offset to the source line that produced it, so runtime
/// faults can report a line number (spec section 4.5, "line-number table").
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LineEntry {
    pub ip: u32,
    pub line: u32,
}

/// One compiled function or top-level script body (spec section 3.6).
///
/// String literals are split into a global-scope table and a function-local
/// table, mirroring the compiler's two constant pools (spec section 3.5):
/// top-level code and each function body intern separately so a function's
/// string constants can be dropped together when the function is discarded.
#[derive(Debug, Serialize, Deserialize)]
pub struct CodeBlock {
    pub file_name: Box<str>,
    pub code: Vec<u8>,
    pub global_floats: Vec<f64>,
    pub function_floats: Vec<f64>,
    pub global_strings: Vec<Box<str>>,
    pub function_strings: Vec<Box<str>>,
    pub line_breaks: Vec<LineEntry>,
    pub num_locals_hint: u16,

    /// Identifier fixup cache: `global_strings[i]` interned against a live
    /// [`InternTable`] on first use, so opcodes that name a variable or
    /// function compare by pointer identity rather than re-interning on
    /// every execution (spec section 9, "identifier fixup table"). A
    /// codeblock loaded into a fresh process starts with this empty; it is
    /// never persisted since `Interned` handles are only valid within one
    /// process's intern table.
    #[serde(skip)]
    identifiers: RefCell<Vec<Option<Interned>>>,
}

impl CodeBlock {
    #[must_use]
    pub fn new(
        file_name: Box<str>,
        code: Vec<u8>,
        global_floats: Vec<f64>,
        function_floats: Vec<f64>,
        global_strings: Vec<Box<str>>,
        function_strings: Vec<Box<str>>,
        line_breaks: Vec<LineEntry>,
        num_locals_hint: u16,
    ) -> Self {
        let identifiers = RefCell::new(vec![None; global_strings.len()]);
        Self {
            file_name,
            code,
            global_floats,
            function_floats,
            global_strings,
            function_strings,
            line_breaks,
            num_locals_hint,
            identifiers,
        }
    }

    #[must_use]
    pub fn global_float(&self, index: u32) -> f64 {
        self.global_floats.get(index as usize).copied().unwrap_or(0.0)
    }

    #[must_use]
    pub fn function_float(&self, index: u32) -> f64 {
        self.function_floats.get(index as usize).copied().unwrap_or(0.0)
    }

    #[must_use]
    pub fn global_string(&self, index: u32) -> &str {
        self.global_strings.get(index as usize).map_or("", |s| &**s)
    }

    #[must_use]
    pub fn function_string(&self, index: u32) -> &str {
        self.function_strings.get(index as usize).map_or("", |s| &**s)
    }

    /// High bit of a pool operand selects the function-local pool over the
    /// global one (spec section 9, resolving the open question of mixed
    /// 32-bit code words vs 64-bit operands by committing to 32-bit pool
    /// indices with a one-bit pool selector).
    const FUNCTION_POOL_BIT: u32 = 1 << 31;

    #[must_use]
    pub fn pool_float(&self, operand: u32) -> f64 {
        if operand & Self::FUNCTION_POOL_BIT != 0 {
            self.function_float(operand & !Self::FUNCTION_POOL_BIT)
        } else {
            self.global_float(operand)
        }
    }

    #[must_use]
    pub fn pool_string(&self, operand: u32) -> &str {
        if operand & Self::FUNCTION_POOL_BIT != 0 {
            self.function_string(operand & !Self::FUNCTION_POOL_BIT)
        } else {
            self.global_string(operand)
        }
    }

    /// Resolves `global_strings[index]` to a process-wide canonical
    /// `Interned`, caching the result for subsequent lookups.
    pub fn identifier(&self, index: u32, interns: &mut InternTable) -> Interned {
        let idx = index as usize;
        {
            let cache = self.identifiers.borrow();
            if let Some(Some(id)) = cache.get(idx) {
                return id.clone();
            }
        }
        let text = self.global_string(index);
        let resolved = interns.intern(text, true);
        let mut cache = self.identifiers.borrow_mut();
        if cache.len() <= idx {
            cache.resize(idx + 1, None);
        }
        cache[idx] = Some(resolved.clone());
        resolved
    }

    /// Finds the source line containing `ip`, by the last line-break entry at
    /// or before it (spec section 4.5).
    #[must_use]
    pub fn line_for_ip(&self, ip: u32) -> Option<u32> {
        self.line_breaks
            .iter()
            .rev()
            .find(|entry| entry.ip <= ip)
            .map(|entry| entry.line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CodeBlock {
        CodeBlock::new(
            "test.cs".into(),
            vec![0x01, 0x02, 0x03],
            vec![1.5],
            vec![],
            vec!["foo".into(), "bar".into()],
            vec![],
            vec![LineEntry { ip: 0, line: 1 }, LineEntry { ip: 2, line: 2 }],
            0,
        )
    }

    #[test]
    fn identifier_lookup_is_cached_and_pointer_stable() {
        let mut interns = InternTable::new();
        let block = sample();
        let first = block.identifier(0, &mut interns);
        let second = block.identifier(0, &mut interns);
        assert_eq!(first, second);
    }

    #[test]
    fn line_for_ip_finds_enclosing_entry() {
        let block = sample();
        assert_eq!(block.line_for_ip(0), Some(1));
        assert_eq!(block.line_for_ip(1), Some(1));
        assert_eq!(block.line_for_ip(2), Some(2));
    }
}
