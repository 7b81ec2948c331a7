//! Call frames (spec section 3.8).

use std::rc::Rc;

use crate::codeblock::CodeBlock;
use crate::dict::Dictionary;
use crate::dispatch::NamespaceId;
use crate::intern::Interned;

/// Maximum nested call depth; also bounds the try-stack capacity (spec
/// section 4.6: "up to 2x frame limit").
pub const MAX_FRAME_DEPTH: usize = 1024;
pub const MAX_TRY_DEPTH: usize = MAX_FRAME_DEPTH * 2;

/// One call on a fiber's call stack (spec section 3.8).
pub struct CallFrame {
    pub codeblock: Rc<CodeBlock>,
    pub ip: u32,
    pub scope_name: Interned,
    pub scope_namespace: NamespaceId,
    pub package_name: Option<Interned>,
    pub locals: Dictionary,
    /// String-accumulation-stack offset to restore on frame pop.
    pub string_stack_marker: usize,
    /// Try-stack depth to restore on frame pop.
    pub try_stack_marker: usize,
    /// Operand stack depths recorded at entry, checked for balance at return
    /// (spec section 4.6, "Dispatch invariants").
    pub int_depth_at_entry: usize,
    pub float_depth_at_entry: usize,
}

impl CallFrame {
    #[must_use]
    pub fn new(
        codeblock: Rc<CodeBlock>,
        ip: u32,
        scope_name: Interned,
        scope_namespace: NamespaceId,
        package_name: Option<Interned>,
        string_stack_marker: usize,
        try_stack_marker: usize,
        int_depth_at_entry: usize,
        float_depth_at_entry: usize,
    ) -> Self {
        Self {
            codeblock,
            ip,
            scope_name,
            scope_namespace,
            package_name,
            locals: Dictionary::new(),
            string_stack_marker,
            try_stack_marker,
            int_depth_at_entry,
            float_depth_at_entry,
        }
    }

    /// A cheap, read-only snapshot for debugging/tracing (spec section 3.8,
    /// "basic frame").
    #[must_use]
    pub fn to_basic(&self) -> BasicFrame {
        BasicFrame {
            scope_name: self.scope_name.clone(),
            ip: self.ip,
        }
    }
}

#[derive(Clone)]
pub struct BasicFrame {
    pub scope_name: Interned,
    pub ip: u32,
}
