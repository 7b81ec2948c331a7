//! The bounded per-fiber operand stacks (spec section 4.6).
//!
//! Every stack here is capacity-bounded; overflow is a hard
//! [`RuntimeFault::StackOverflow`], matching "All stacks are bounded; overflow
//! is a hard fault" (spec section 4.6).

use crate::error::RuntimeFault;
use crate::intern::Interned;
use crate::object::HeapId;

pub const INT_STACK_CAPACITY: usize = 64;
pub const FLOAT_STACK_CAPACITY: usize = 64;
pub const VM_STACK_CAPACITY: usize = 32;
pub const ITERATOR_STACK_CAPACITY: usize = 64;
pub const OBJECT_STACK_CAPACITY: usize = 32;

/// A fixed-capacity stack that faults instead of reallocating past its limit.
#[derive(Debug, Default)]
pub struct BoundedStack<T> {
    items: Vec<T>,
    capacity: usize,
}

impl<T> BoundedStack<T> {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: T) -> Result<(), RuntimeFault> {
        if self.items.len() >= self.capacity {
            return Err(RuntimeFault::StackOverflow);
        }
        self.items.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop()
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.items.len()
    }

    pub fn truncate(&mut self, depth: usize) {
        self.items.truncate(depth);
    }

    #[must_use]
    pub fn last(&self) -> Option<&T> {
        self.items.last()
    }
}

/// One nested `foreach` frame (spec section 4.6): the loop variable's
/// namespace slot, the current index, and the data being iterated.
#[derive(Debug, Clone)]
pub struct IterFrame {
    pub var_name: Interned,
    pub index: usize,
    pub data: IterData,
}

#[derive(Debug, Clone)]
pub enum IterData {
    Words(Vec<String>),
    Heap(HeapId),
}

/// A `try`/`catch` record (spec section 4.7): the catch target, the exception
/// mask it handles, and the frame depth to unwind to on a matching throw.
#[derive(Debug, Clone)]
pub struct TryRecord {
    pub catch_ip: u32,
    pub mask: u32,
    /// Name to bind the thrown value under, resolved against the
    /// try-containing codeblock at `OP_TRY_BEGIN` time (not lazily at throw
    /// time, since the throwing frame may belong to a different codeblock's
    /// string pool). `None` for a mask-only catch with no bound variable.
    pub catch_var: Option<Interned>,
    pub frame_depth: u32,
    /// Operand stack depths to restore when unwinding to this handler.
    pub int_depth: usize,
    pub float_depth: usize,
    pub string_offset: usize,
}

/// Separator used by `OP_ADVANCE_STR*` when appending to the string
/// accumulation stack (spec section 9, "String accumulation stack"; grounded
/// on `stringStack.cc`'s advance-with-separator opcodes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Separator {
    None,
    Space,
    Comma,
    Nul,
    Tab,
    Newline,
}

impl Separator {
    #[must_use]
    pub fn as_byte(self) -> Option<u8> {
        match self {
            Separator::None => None,
            Separator::Space => Some(b' '),
            Separator::Comma => Some(b','),
            Separator::Nul => Some(0),
            Separator::Tab => Some(b'\t'),
            Separator::Newline => Some(b'\n'),
        }
    }
}

/// The per-fiber byte buffer that opcodes implicitly extend, plus a stack of
/// frame-start offsets for `OP_REWIND_STR`/`OP_TERMINATE_REWIND_STR` (spec
/// section 9, "String accumulation stack").
///
/// Every opcode's effect on this buffer is explicit; string pointers into it
/// are never aliased into code, so truncation (`rewind`) can never leave a
/// dangling reference.
#[derive(Debug, Default)]
pub struct StringStack {
    bytes: Vec<u8>,
    frame_offsets: Vec<usize>,
}

impl StringStack {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a new function-call scope frame, recording the current offset.
    pub fn push_frame(&mut self) {
        self.frame_offsets.push(self.bytes.len());
    }

    pub fn pop_frame(&mut self) {
        if let Some(offset) = self.frame_offsets.pop() {
            self.bytes.truncate(offset);
        }
    }

    #[must_use]
    pub fn current_offset(&self) -> usize {
        self.bytes.len()
    }

    /// Start offset of the innermost open frame, or 0 if none is open.
    /// String-consuming opcodes slice from here, not from 0, so that bytes
    /// appended by an earlier sibling statement never leak into the next
    /// one's read.
    #[must_use]
    pub fn frame_start(&self) -> usize {
        self.frame_offsets.last().copied().unwrap_or(0)
    }

    /// Appends `text`, optionally preceded by a separator byte (`OP_ADVANCE_STR*`).
    pub fn advance(&mut self, separator: Separator, text: &str) {
        if let Some(byte) = separator.as_byte() {
            if !self.bytes.is_empty() {
                self.bytes.push(byte);
            }
        }
        self.bytes.extend_from_slice(text.as_bytes());
    }

    pub fn append_char(&mut self, ch: u8) {
        self.bytes.push(ch);
    }

    /// Truncates back to `offset` (`OP_REWIND_STR`).
    pub fn rewind(&mut self, offset: usize) {
        self.bytes.truncate(offset);
    }

    /// Extracts argv from the current frame's bytes by NUL separators,
    /// matching the original engine's argument-passing convention.
    #[must_use]
    pub fn current_frame_args(&self) -> Vec<String> {
        let start = self.frame_offsets.last().copied().unwrap_or(0);
        self.bytes[start..]
            .split(|&b| b == 0)
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect()
    }

    #[must_use]
    pub fn slice(&self, start: usize, end: usize) -> &str {
        std::str::from_utf8(&self.bytes[start..end]).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_stack_faults_on_overflow() {
        let mut stack = BoundedStack::with_capacity(2);
        stack.push(1).unwrap();
        stack.push(2).unwrap();
        assert!(matches!(stack.push(3), Err(RuntimeFault::StackOverflow)));
    }

    #[test]
    fn string_stack_rewind_truncates() {
        let mut s = StringStack::new();
        s.push_frame();
        s.advance(Separator::None, "hello");
        let mark = s.current_offset();
        s.advance(Separator::Space, "world");
        assert_eq!(s.slice(0, s.current_offset()), "hello world");
        s.rewind(mark);
        assert_eq!(s.slice(0, s.current_offset()), "hello");
    }

    #[test]
    fn frame_pop_truncates_to_frame_start() {
        let mut s = StringStack::new();
        s.advance(Separator::None, "outer");
        s.push_frame();
        s.advance(Separator::None, "inner");
        s.pop_frame();
        assert_eq!(s.slice(0, s.current_offset()), "outer");
    }

    #[test]
    fn frame_start_tracks_innermost_open_frame() {
        let mut s = StringStack::new();
        assert_eq!(s.frame_start(), 0);
        s.advance(Separator::None, "outer");
        s.push_frame();
        assert_eq!(s.frame_start(), 5);
        s.advance(Separator::None, "inner");
        assert_eq!(s.slice(s.frame_start(), s.current_offset()), "inner");
    }
}
