//! The single-pass AST-to-bytecode emitter (spec section 4.4, component E).
//!
//! Grounded on `monty`'s bytecode builder idiom (growable code buffer,
//! forward-jump patch list, loop fixup scopes) generalized from a generic
//! VM's opcode set to this engine's Console-style opcodes. There is no
//! separate optimization pass: the type requirement threaded through
//! [`Compiler::emit_expr`] picks the cheapest opcode family (`_UINT`/`_FLT`/
//! `_STR`) as each node is visited, the way the original compiler folds type
//! selection into code generation itself.
//!
//! `arena: &'a AstArena` is a plain reference, so it is `Copy` — nodes
//! borrowed from it live independently of `&mut self`, letting `emit_expr`
//! hold a `&'a Node` across calls that mutate the rest of the compiler's
//! state (code buffer, pools, fix stack) without any cloning.

use crate::codeblock::{CodeBlock, LineEntry};
use crate::compiler::ast::{AstArena, BinOp, CallTarget, CmpOp, Node, NodeId, TypeReq, UnOp};
use crate::compiler::pool::{FloatPool, StringPool};
use crate::error::CompileError;
use crate::vm::opcode::Opcode;

/// What representation an expression's result currently occupies once
/// emitted — the int stack, the float stack, or the string accumulation
/// buffer. Drives whether [`Compiler::coerce`] needs to emit a conversion
/// opcode before the value can be consumed by its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Int,
    Float,
    Str,
}

/// One loop's break/continue exits awaiting resolution (spec section 4.4,
/// "fix stack"), LIFO by construction since loops nest lexically.
struct FixScope {
    break_patches: Vec<u32>,
    continue_patches: Vec<u32>,
}

/// Emits one top-level codeblock (a script body, or a single function body
/// compiled on its own — spec section 3.6 treats each as independent).
pub struct Compiler<'a> {
    arena: &'a AstArena,
    file_name: String,
    code: Vec<u8>,
    global_strings: StringPool,
    global_floats: FloatPool,
    function_strings: StringPool,
    function_floats: FloatPool,
    in_function: bool,
    line_breaks: Vec<LineEntry>,
    current_line: u32,
    fix_stack: Vec<FixScope>,
    locals_seen: u16,
}

const FUNCTION_POOL_BIT: u32 = 1 << 31;

impl<'a> Compiler<'a> {
    #[must_use]
    pub fn new(arena: &'a AstArena, file_name: impl Into<String>) -> Self {
        Self {
            arena,
            file_name: file_name.into(),
            code: Vec::new(),
            global_strings: StringPool::new(),
            global_floats: FloatPool::new(),
            function_strings: StringPool::new(),
            function_floats: FloatPool::new(),
            in_function: false,
            line_breaks: Vec::new(),
            current_line: 1,
            fix_stack: Vec::new(),
            locals_seen: 0,
        }
    }

    /// Compiles `root` (typically a top-level `Block`) into a finished
    /// [`CodeBlock`], consuming `self`.
    pub fn compile(mut self, root: NodeId) -> Result<CodeBlock, CompileError> {
        self.mark_line(self.current_line);
        self.emit_stmt(root)?;
        self.emit_op(Opcode::LoadImmedUint);
        self.emit_u32(0);
        self.emit_op(Opcode::Return);
        self.emit_u32(0);

        if !self.fix_stack.is_empty() {
            return Err(self.err("unresolved loop fixup scope at end of compile"));
        }

        Ok(CodeBlock::new(
            self.file_name.into_boxed_str(),
            self.code,
            self.global_floats.into_entries(),
            self.function_floats.into_entries(),
            self.global_strings.into_entries(),
            self.function_strings.into_entries(),
            self.line_breaks,
            self.locals_seen,
        ))
    }

    fn err(&self, message: impl Into<String>) -> CompileError {
        CompileError { file: self.file_name.clone(), line: self.current_line, message: message.into() }
    }

    // --- code buffer primitives ---

    fn emit_op(&mut self, op: Opcode) {
        self.code.push(op.as_byte());
    }

    fn emit_u32(&mut self, v: u32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    /// Emits a placeholder operand, returning its address for later patching.
    fn reserve_u32(&mut self) -> u32 {
        let addr = u32::try_from(self.code.len()).expect("code buffer overflow");
        self.emit_u32(0xFFFF_FFFF);
        addr
    }

    fn patch_u32(&mut self, addr: u32, value: u32) {
        let idx = addr as usize;
        self.code[idx..idx + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn here(&self) -> u32 {
        u32::try_from(self.code.len()).expect("code buffer overflow")
    }

    fn mark_line(&mut self, line: u32) {
        if self.line_breaks.last().map(|e| e.line) != Some(line) {
            self.line_breaks.push(LineEntry { ip: self.here(), line });
        }
    }

    // --- pools ---

    fn intern_string(&mut self, text: &str) -> u32 {
        if self.in_function {
            self.function_strings.intern(text) | FUNCTION_POOL_BIT
        } else {
            self.global_strings.intern(text)
        }
    }

    /// Identifiers always live in the global pool: `CodeBlock::identifier`
    /// only ever resolves `global_strings` (spec section 9, identifier
    /// fixup table), so function-local identifiers still dedup globally.
    fn intern_identifier(&mut self, name: &str) -> u32 {
        self.global_strings.intern(name)
    }

    fn intern_float(&mut self, v: f64) -> u32 {
        if self.in_function {
            self.function_floats.intern(v) | FUNCTION_POOL_BIT
        } else {
            self.global_floats.intern(v)
        }
    }

    // --- statements ---

    fn emit_stmt(&mut self, id: NodeId) -> Result<(), CompileError> {
        let node = self.arena.get(id);
        match node {
            Node::Block(items) => {
                for &item in items {
                    self.emit_stmt(item)?;
                }
                Ok(())
            }
            Node::Break => {
                if self.fix_stack.is_empty() {
                    return Err(self.err("break outside loop"));
                }
                self.emit_op(Opcode::Jmp);
                let patch = self.reserve_u32();
                self.fix_stack.last_mut().unwrap().break_patches.push(patch);
                Ok(())
            }
            Node::Continue => {
                if self.fix_stack.is_empty() {
                    return Err(self.err("continue outside loop"));
                }
                self.emit_op(Opcode::Jmp);
                let patch = self.reserve_u32();
                self.fix_stack.last_mut().unwrap().continue_patches.push(patch);
                Ok(())
            }
            &Node::Return(value) => {
                // A bare `return %var;` returns the variable's live value
                // straight out of the dictionary instead of through
                // `LoadVarStr`, which would lose its numeric tag.
                if let Some(v) = value {
                    if let Node::VarRead(name) = self.arena.get(v) {
                        let idx = self.intern_identifier(name);
                        self.emit_op(Opcode::ReturnVar);
                        self.emit_u32(idx);
                        return Ok(());
                    }
                }
                let kind = match value {
                    Some(v) => self.emit_expr(v, TypeReq::None)?,
                    None => {
                        self.emit_op(Opcode::LoadImmedUint);
                        self.emit_u32(0);
                        Kind::Int
                    }
                };
                self.emit_op(Opcode::Return);
                self.emit_u32(return_kind_code(kind));
                Ok(())
            }
            &Node::If { cond, then_branch, else_branch } => {
                self.emit_bool_expr(cond)?;
                self.emit_op(Opcode::JmpIfNot);
                let else_patch = self.reserve_u32();
                self.emit_stmt(then_branch)?;
                if let Some(else_branch) = else_branch {
                    self.emit_op(Opcode::Jmp);
                    let end_patch = self.reserve_u32();
                    self.patch_u32(else_patch, self.here());
                    self.emit_stmt(else_branch)?;
                    self.patch_u32(end_patch, self.here());
                } else {
                    self.patch_u32(else_patch, self.here());
                }
                Ok(())
            }
            &Node::Loop { init, cond, step, body, test_before_body } => {
                self.emit_loop(init, cond, step, body, test_before_body)
            }
            Node::ForeachLoop { var_name, collection, body, .. } => {
                self.emit_foreach(var_name.clone(), *collection, *body)
            }
            &Node::TryCatch { body, mask, ref catch_var, catch_body } => {
                self.emit_op(Opcode::TryBegin);
                self.emit_u32(mask);
                let catch_patch = self.reserve_u32();
                let catch_var_idx = catch_var.as_ref().map_or(u32::MAX, |name| self.intern_identifier(name));
                self.emit_u32(catch_var_idx);
                self.emit_stmt(body)?;
                self.emit_op(Opcode::TryEnd);
                self.emit_op(Opcode::Jmp);
                let end_patch = self.reserve_u32();
                self.patch_u32(catch_patch, self.here());
                self.emit_stmt(catch_body)?;
                self.patch_u32(end_patch, self.here());
                Ok(())
            }
            Node::FuncDecl { namespace: _, name, params, body } => {
                self.emit_func_decl(name.clone(), params.len(), *body)
            }
            Node::ObjectDecl { class_name, object_name, is_datablock, args, slot_assigns, children, .. } => {
                self.emit_object_decl(*class_name, *object_name, *is_datablock, args.clone(), slot_assigns.clone(), children.clone())
            }
            Node::SlotAssign { field, index, value } => {
                let field = field.clone();
                let index = *index;
                let value = *value;
                let field_idx = self.intern_identifier(&field);
                if let Some(index) = index {
                    self.emit_expr(index, TypeReq::Int)?;
                    self.emit_op(Opcode::SetCurFieldArray);
                    self.emit_u32(field_idx);
                } else {
                    self.emit_op(Opcode::SetCurField);
                    self.emit_u32(field_idx);
                }
                let kind = self.emit_expr(value, TypeReq::None)?;
                match kind {
                    Kind::Int => self.emit_op(Opcode::SaveFieldUint),
                    Kind::Float => self.emit_op(Opcode::SaveFieldFlt),
                    Kind::Str => self.emit_op(Opcode::SaveFieldStr),
                }
                Ok(())
            }
            // Anything else is an expression used in statement position
            // (e.g. a bare call or assignment); evaluate and discard.
            _ => self.emit_expr_discard(id),
        }
    }

    fn emit_loop(
        &mut self,
        init: Option<NodeId>,
        cond: Option<NodeId>,
        step: Option<NodeId>,
        body: NodeId,
        test_before_body: bool,
    ) -> Result<(), CompileError> {
        if let Some(init) = init {
            self.emit_expr_discard(init)?;
        }
        self.fix_stack.push(FixScope { break_patches: Vec::new(), continue_patches: Vec::new() });
        let cond_check = self.here();
        let mut exit_patch = None;
        if test_before_body {
            if let Some(cond) = cond {
                self.emit_bool_expr(cond)?;
                self.emit_op(Opcode::JmpIfNot);
                exit_patch = Some(self.reserve_u32());
            }
        }
        self.emit_stmt(body)?;
        let continue_target = self.here();
        if let Some(step) = step {
            self.emit_expr_discard(step)?;
        }
        if test_before_body {
            self.emit_op(Opcode::Jmp);
            self.emit_u32(cond_check);
        } else if let Some(cond) = cond {
            self.emit_bool_expr(cond)?;
            self.emit_op(Opcode::JmpIf);
            self.emit_u32(cond_check);
        } else {
            self.emit_op(Opcode::Jmp);
            self.emit_u32(cond_check);
        }
        let end = self.here();
        if let Some(patch) = exit_patch {
            self.patch_u32(patch, end);
        }
        let scope = self.fix_stack.pop().unwrap();
        for patch in scope.break_patches {
            self.patch_u32(patch, end);
        }
        for patch in scope.continue_patches {
            self.patch_u32(patch, continue_target);
        }
        Ok(())
    }

    fn emit_foreach(&mut self, var_name: String, collection: NodeId, body: NodeId) -> Result<(), CompileError> {
        self.emit_str_expr(collection)?;
        let name_idx = self.intern_identifier(&var_name);
        self.emit_op(Opcode::IterBegin);
        self.emit_u32(name_idx);
        let iter_begin_end_patch = self.reserve_u32();
        self.fix_stack.push(FixScope { break_patches: Vec::new(), continue_patches: Vec::new() });
        let loop_top = self.here();
        self.emit_op(Opcode::Iter);
        let iter_end_patch = self.reserve_u32();
        self.emit_stmt(body)?;
        self.emit_op(Opcode::Jmp);
        self.emit_u32(loop_top);
        let end = self.here();
        self.patch_u32(iter_end_patch, end);
        self.patch_u32(iter_begin_end_patch, end);
        self.emit_op(Opcode::IterEnd);
        let scope = self.fix_stack.pop().unwrap();
        for patch in scope.break_patches {
            self.patch_u32(patch, end);
        }
        for patch in scope.continue_patches {
            self.patch_u32(patch, loop_top);
        }
        Ok(())
    }

    fn emit_func_decl(&mut self, name: String, param_count: usize, body: NodeId) -> Result<(), CompileError> {
        let name_idx = self.intern_identifier(&name);
        self.emit_op(Opcode::FuncDecl);
        self.emit_u32(name_idx);
        let body_start_patch = self.reserve_u32();
        let end_skip_patch = self.reserve_u32();
        self.patch_u32(body_start_patch, self.here());

        let was_in_function = self.in_function;
        self.in_function = true;
        self.locals_seen = self.locals_seen.max(u16::try_from(param_count).unwrap_or(u16::MAX));
        self.emit_stmt(body)?;
        self.emit_op(Opcode::LoadImmedUint);
        self.emit_u32(0);
        self.emit_op(Opcode::Return);
        self.emit_u32(0);
        self.in_function = was_in_function;

        self.patch_u32(end_skip_patch, self.here());
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_object_decl(
        &mut self,
        class_name: NodeId,
        object_name: Option<NodeId>,
        is_datablock: bool,
        args: Vec<NodeId>,
        slot_assigns: Vec<NodeId>,
        children: Vec<NodeId>,
    ) -> Result<(), CompileError> {
        let class_text = literal_text(self.arena, class_name).unwrap_or_default();
        let name_text = object_name.and_then(|n| literal_text(self.arena, n)).unwrap_or_default();
        let class_idx = self.intern_string(&class_text);
        let name_idx = self.intern_string(&name_text);

        self.emit_op(Opcode::PushFrame);
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                self.emit_op(Opcode::AdvanceStrAppendChar);
                self.emit_u32(0);
            }
            self.emit_str_expr(*arg)?;
        }
        self.emit_op(Opcode::CreateObject);
        self.emit_u32(class_idx);
        self.emit_u32(name_idx);
        self.emit_u32(u32::from(is_datablock));

        for slot in slot_assigns {
            self.emit_stmt(slot)?;
        }
        for child in children {
            self.emit_stmt(child)?;
        }
        self.emit_op(Opcode::AddObject);
        self.emit_op(Opcode::EndObject);
        Ok(())
    }

    fn emit_expr_discard(&mut self, id: NodeId) -> Result<(), CompileError> {
        let kind = self.emit_expr(id, TypeReq::None)?;
        match kind {
            Kind::Int => self.emit_op(Opcode::UintToNone),
            Kind::Float => self.emit_op(Opcode::FltToNone),
            Kind::Str => self.emit_op(Opcode::StrToNone),
        }
        Ok(())
    }

    /// Emits `id` and coerces the result onto the int stack as a 0/1 flag,
    /// for use by `If`/`Loop` conditions.
    fn emit_bool_expr(&mut self, id: NodeId) -> Result<(), CompileError> {
        self.emit_expr(id, TypeReq::Int)?;
        Ok(())
    }

    fn emit_str_expr(&mut self, id: NodeId) -> Result<(), CompileError> {
        self.emit_expr(id, TypeReq::String)?;
        Ok(())
    }

    // --- expressions ---

    /// Emits `id`, coercing its result toward `req`.
    ///
    /// Every call here that isn't itself building up a shared concatenation
    /// (`req != TypeReq::String`) opens its own string-accumulation frame
    /// first and closes it again once the result is anything other than a
    /// string — so sibling statements, and nested sub-expressions within one
    /// statement, never read each other's leftover bytes. A `TypeReq::String`
    /// request (a `StringConcat`/`CommaCat` part) is left open on purpose:
    /// those parts share one accumulation region, and whichever terminal
    /// opcode finally consumes it (`Return`, `SaveVarStr`, `SaveFieldStr`,
    /// `CompareStr`, `StrToUint`/`StrToFlt`, `StrToNone`) is responsible for
    /// popping the frame this call pushed.
    fn emit_expr(&mut self, id: NodeId, req: TypeReq) -> Result<Kind, CompileError> {
        let isolate = req != TypeReq::String;
        if isolate {
            self.emit_op(Opcode::PushFrame);
        }
        let produced = self.emit_expr_raw(id)?;
        let kind = self.coerce(produced, req);
        if isolate && kind != Kind::Str {
            self.emit_op(Opcode::RewindStr);
        }
        Ok(kind)
    }

    fn coerce(&mut self, from: Kind, req: TypeReq) -> Kind {
        match (from, req) {
            (Kind::Int, TypeReq::Float) => {
                self.emit_op(Opcode::UintToFlt);
                Kind::Float
            }
            (Kind::Int, TypeReq::String) => {
                self.emit_op(Opcode::UintToStr);
                Kind::Str
            }
            (Kind::Float, TypeReq::Int) => {
                self.emit_op(Opcode::FltToUint);
                Kind::Int
            }
            (Kind::Float, TypeReq::String) => {
                self.emit_op(Opcode::FltToStr);
                Kind::Str
            }
            (Kind::Str, TypeReq::Int) => {
                self.emit_op(Opcode::StrToUint);
                Kind::Int
            }
            (Kind::Str, TypeReq::Float) => {
                self.emit_op(Opcode::StrToFlt);
                Kind::Float
            }
            _ => from,
        }
    }

    #[allow(clippy::too_many_lines)]
    fn emit_expr_raw(&mut self, id: NodeId) -> Result<Kind, CompileError> {
        let node = self.arena.get(id);
        match node {
            &Node::IntLiteral(v) => {
                self.emit_op(Opcode::LoadImmedUint);
                self.emit_u32(v as u32);
                Ok(Kind::Int)
            }
            &Node::FloatLiteral(v) => {
                let idx = self.intern_float(v);
                self.emit_op(Opcode::LoadImmedFlt);
                self.emit_u32(idx);
                Ok(Kind::Float)
            }
            Node::StringLiteral(text) => {
                let idx = self.intern_string(text);
                self.emit_op(Opcode::LoadImmedStr);
                self.emit_u32(idx);
                Ok(Kind::Str)
            }
            &Node::TaggedStringLiteral { tag, ref text } => {
                let idx = if self.in_function {
                    self.function_strings.intern_tagged(tag, text) | FUNCTION_POOL_BIT
                } else {
                    self.global_strings.intern_tagged(tag, text)
                };
                self.emit_op(Opcode::TagToStr);
                self.emit_u32(idx);
                Ok(Kind::Str)
            }
            Node::VarRead(name) => {
                self.emit_set_cur_var(&name.clone(), false);
                // Default to string representation; callers coerce as needed.
                self.emit_op(Opcode::LoadVarStr);
                Ok(Kind::Str)
            }
            &Node::VarAssign { ref name, value } => {
                let name = name.clone();
                self.emit_set_cur_var(&name, true);
                let kind = self.emit_expr(value, TypeReq::None)?;
                match kind {
                    Kind::Int => self.emit_op(Opcode::SaveVarUint),
                    Kind::Float => self.emit_op(Opcode::SaveVarFlt),
                    Kind::Str => self.emit_op(Opcode::SaveVarStr),
                }
                // Leave the assigned value available for `a = b = c;` chains
                // and for expression-statement discard.
                self.emit_set_cur_var(&name, false);
                self.load_var_as(kind);
                Ok(kind)
            }
            &Node::OpAssign { ref name, op, value } => {
                let name = name.clone();
                self.emit_set_cur_var(&name, false);
                self.emit_op(Opcode::LoadVarUint);
                self.emit_expr(value, TypeReq::Int)?;
                self.emit_binop(op);
                self.emit_set_cur_var(&name, false);
                self.emit_op(Opcode::SaveVarUint);
                self.emit_set_cur_var(&name, false);
                self.emit_op(Opcode::LoadVarUint);
                Ok(Kind::Int)
            }
            &Node::Binary { op, lhs, rhs, .. } => {
                self.emit_expr(lhs, TypeReq::Int)?;
                self.emit_expr(rhs, TypeReq::Int)?;
                self.emit_binop(op);
                Ok(Kind::Int)
            }
            &Node::Unary { op, operand } => {
                self.emit_expr(operand, TypeReq::Int)?;
                match op {
                    UnOp::Neg => self.emit_op(Opcode::Neg),
                    UnOp::OnesComplement => self.emit_op(Opcode::OnesComplement),
                    UnOp::Not => self.emit_op(Opcode::Not),
                }
                Ok(Kind::Int)
            }
            &Node::Comparison { op, lhs, rhs } => {
                self.emit_expr(lhs, TypeReq::Int)?;
                self.emit_expr(rhs, TypeReq::Int)?;
                self.emit_op(cmp_opcode(op));
                Ok(Kind::Int)
            }
            Node::StringConcat { parts } => {
                let parts = parts.clone();
                for part in parts {
                    self.emit_expr(part, TypeReq::String)?;
                }
                Ok(Kind::Str)
            }
            Node::CommaCat { parts } => {
                let parts = parts.clone();
                for (i, part) in parts.into_iter().enumerate() {
                    if i > 0 {
                        self.emit_op(Opcode::AdvanceStrAppendChar);
                        self.emit_u32(u32::from(b','));
                    }
                    self.emit_expr(part, TypeReq::String)?;
                }
                Ok(Kind::Str)
            }
            &Node::StringEquality { lhs, rhs, negate } => {
                let rhs_text = literal_text(self.arena, rhs).unwrap_or_default();
                self.emit_op(Opcode::PushFrame);
                self.emit_expr(lhs, TypeReq::String)?;
                let rhs_idx = self.intern_string(&rhs_text);
                self.emit_op(Opcode::CompareStr);
                self.emit_u32(rhs_idx);
                if negate {
                    self.emit_op(Opcode::Not);
                }
                Ok(Kind::Int)
            }
            &Node::Conditional { cond, then_value, else_value } => {
                self.emit_bool_expr(cond)?;
                self.emit_op(Opcode::JmpIfNot);
                let else_patch = self.reserve_u32();
                self.emit_expr(then_value, TypeReq::Int)?;
                self.emit_op(Opcode::Jmp);
                let end_patch = self.reserve_u32();
                self.patch_u32(else_patch, self.here());
                self.emit_expr(else_value, TypeReq::Int)?;
                self.patch_u32(end_patch, self.here());
                Ok(Kind::Int)
            }
            Node::Call { target, args } => {
                let target = target.clone();
                let args = args.clone();
                self.emit_call(target, args)
            }
            &Node::SlotAccess { object, ref field, index } => {
                let field = field.clone();
                if let Some(object) = object {
                    self.emit_expr(object, TypeReq::Int)?;
                    self.emit_op(Opcode::SetCurObject);
                }
                let field_idx = self.intern_identifier(&field);
                if let Some(index) = index {
                    self.emit_expr(index, TypeReq::Int)?;
                    self.emit_op(Opcode::SetCurFieldArray);
                    self.emit_u32(field_idx);
                } else {
                    self.emit_op(Opcode::SetCurField);
                    self.emit_u32(field_idx);
                }
                self.emit_op(Opcode::LoadFieldStr);
                Ok(Kind::Str)
            }
            &Node::TaggedStringAccess(inner) => {
                self.emit_expr(inner, TypeReq::String)?;
                Ok(Kind::Str)
            }
            &Node::Assert { cond, ref message } => {
                let message = message.clone();
                self.emit_expr(cond, TypeReq::Int)?;
                let idx = self.intern_string(&message);
                self.emit_op(Opcode::Assert);
                self.emit_u32(idx);
                self.emit_op(Opcode::LoadImmedUint);
                self.emit_u32(1);
                Ok(Kind::Int)
            }
            other => Err(self.err(format!("{other:?} is not valid in expression position"))),
        }
    }

    fn load_var_as(&mut self, kind: Kind) {
        match kind {
            Kind::Int => self.emit_op(Opcode::LoadVarUint),
            Kind::Float => self.emit_op(Opcode::LoadVarFlt),
            Kind::Str => self.emit_op(Opcode::LoadVarStr),
        }
    }

    fn emit_set_cur_var(&mut self, name: &str, create: bool) {
        let idx = self.intern_identifier(name);
        self.emit_op(if create { Opcode::SetCurVarCreate } else { Opcode::SetCurVar });
        self.emit_u32(idx);
    }

    fn emit_binop(&mut self, op: BinOp) {
        match op {
            BinOp::Add => self.emit_op(Opcode::Add),
            BinOp::Sub => self.emit_op(Opcode::Sub),
            BinOp::Mul => self.emit_op(Opcode::Mul),
            BinOp::Div => self.emit_op(Opcode::Div),
            BinOp::Mod => self.emit_op(Opcode::Mod),
            BinOp::BitAnd => self.emit_op(Opcode::BitAnd),
            BinOp::BitOr => self.emit_op(Opcode::BitOr),
            BinOp::Xor => self.emit_op(Opcode::Xor),
            BinOp::Shl => self.emit_op(Opcode::Shl),
            BinOp::Shr => self.emit_op(Opcode::Shr),
            BinOp::And => self.emit_op(Opcode::And),
            BinOp::Or => self.emit_op(Opcode::Or),
        }
    }

    fn emit_call(&mut self, target: CallTarget, args: Vec<NodeId>) -> Result<Kind, CompileError> {
        self.emit_op(Opcode::PushFrame);
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                self.emit_op(Opcode::AdvanceStrAppendChar);
                self.emit_u32(0);
            }
            self.emit_str_expr(*arg)?;
        }
        match target {
            CallTarget::FreeFunction { namespace, name } => {
                let name_idx = self.intern_identifier(&name);
                let ns_idx = self.intern_string(namespace.as_deref().unwrap_or(""));
                self.emit_op(Opcode::CallFuncResolve);
                self.emit_u32(name_idx);
                self.emit_u32(ns_idx);
            }
            CallTarget::Method { object, name } => {
                self.emit_expr(object, TypeReq::Int)?;
                self.emit_op(Opcode::SetCurObject);
                let name_idx = self.intern_identifier(&name);
                let ns_idx = self.intern_string("");
                self.emit_op(Opcode::CallFuncResolve);
                self.emit_u32(name_idx);
                self.emit_u32(ns_idx);
            }
            CallTarget::Parent { name } => {
                let name_idx = self.intern_identifier(&name);
                let ns_idx = self.intern_string("parent");
                self.emit_op(Opcode::CallFuncResolve);
                self.emit_u32(name_idx);
                self.emit_u32(ns_idx);
            }
        }
        self.emit_op(Opcode::CallFunc);
        Ok(Kind::Int)
    }
}

fn return_kind_code(kind: Kind) -> u32 {
    match kind {
        Kind::Int => 0,
        Kind::Float => 1,
        Kind::Str => 2,
    }
}

fn cmp_opcode(op: CmpOp) -> Opcode {
    match op {
        CmpOp::Eq => Opcode::CmpEq,
        CmpOp::Ne => Opcode::CmpNe,
        CmpOp::Lt => Opcode::CmpLt,
        CmpOp::Le => Opcode::CmpLe,
        CmpOp::Gr => Opcode::CmpGr,
        CmpOp::Ge => Opcode::CmpGe,
    }
}

/// Pulls the literal text out of a node known (by grammar construction) to be
/// a string/int/float literal, for contexts that need a compile-time name
/// (object class names, `CompareStr`'s constant right-hand side).
fn literal_text(arena: &AstArena, id: NodeId) -> Option<String> {
    match arena.get(id) {
        Node::StringLiteral(s) => Some(s.clone()),
        &Node::IntLiteral(n) => Some(n.to_string()),
        &Node::FloatLiteral(f) => Some(f.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ast::Node;
    use crate::vm::opcode::Opcode;

    #[test]
    fn compiles_integer_return() {
        let mut arena = AstArena::new();
        let lit = arena.alloc(Node::IntLiteral(42));
        let ret = arena.alloc(Node::Return(Some(lit)));
        let block = arena.alloc(Node::Block(vec![ret]));
        let cb = Compiler::new(&arena, "test.cs").compile(block).unwrap();
        assert!(cb.code.iter().any(|&b| b == Opcode::LoadImmedUint.as_byte()));
        assert!(cb.code.iter().any(|&b| b == Opcode::Return.as_byte()));
    }

    #[test]
    fn compiles_var_assign_and_read() {
        let mut arena = AstArena::new();
        let lit = arena.alloc(Node::IntLiteral(7));
        let assign = arena.alloc(Node::VarAssign { name: "%x".into(), value: lit });
        let block = arena.alloc(Node::Block(vec![assign]));
        let cb = Compiler::new(&arena, "test.cs").compile(block).unwrap();
        assert!(cb.global_strings.len() >= 1);
    }

    #[test]
    fn break_outside_loop_is_a_compile_error() {
        let mut arena = AstArena::new();
        let brk = arena.alloc(Node::Break);
        let block = arena.alloc(Node::Block(vec![brk]));
        assert!(Compiler::new(&arena, "test.cs").compile(block).is_err());
    }

    #[test]
    fn while_loop_round_trips_through_fix_stack() {
        let mut arena = AstArena::new();
        let cond = arena.alloc(Node::IntLiteral(0));
        let body = arena.alloc(Node::Block(vec![]));
        let loop_node =
            arena.alloc(Node::Loop { init: None, cond: Some(cond), step: None, body, test_before_body: true });
        let block = arena.alloc(Node::Block(vec![loop_node]));
        let cb = Compiler::new(&arena, "test.cs").compile(block).unwrap();
        assert!(!cb.code.is_empty());
    }

    #[test]
    fn bare_var_return_emits_return_var_not_return() {
        let mut arena = AstArena::new();
        let lit = arena.alloc(Node::IntLiteral(9));
        let assign = arena.alloc(Node::VarAssign { name: "%x".into(), value: lit });
        let read = arena.alloc(Node::VarRead("%x".into()));
        let ret = arena.alloc(Node::Return(Some(read)));
        let block = arena.alloc(Node::Block(vec![assign, ret]));
        let cb = Compiler::new(&arena, "test.cs").compile(block).unwrap();
        assert!(cb.code.iter().any(|&b| b == Opcode::ReturnVar.as_byte()));
        // The trailing bare-return-0 the compiler appends after the body
        // still uses the plain opcode, so `Return` legitimately appears too;
        // what matters is that the `%x` read itself went through `ReturnVar`.
    }

    #[test]
    fn try_catch_carries_catch_var_into_try_begin() {
        let mut arena = AstArena::new();
        let throw_body = arena.alloc(Node::Block(vec![]));
        let catch_body = arena.alloc(Node::Block(vec![]));
        let try_node = arena.alloc(Node::TryCatch {
            body: throw_body,
            mask: 0,
            catch_var: Some("%e".into()),
            catch_body,
        });
        let block = arena.alloc(Node::Block(vec![try_node]));
        let cb = Compiler::new(&arena, "test.cs").compile(block).unwrap();
        assert!(cb.code.iter().any(|&b| b == Opcode::TryBegin.as_byte()));
        // catch_var's identifier text made it into the global pool, rather
        // than being silently dropped.
        assert!(cb.global_strings.iter().any(|s| &**s == "%e"));
    }

    #[test]
    fn function_decl_skips_its_own_body_when_falling_through() {
        let mut arena = AstArena::new();
        let lit = arena.alloc(Node::IntLiteral(1));
        let ret = arena.alloc(Node::Return(Some(lit)));
        let body = arena.alloc(Node::Block(vec![ret]));
        let decl = arena.alloc(Node::FuncDecl {
            namespace: None,
            name: "doThing".into(),
            params: vec!["%a".into()],
            body,
        });
        let block = arena.alloc(Node::Block(vec![decl]));
        let cb = Compiler::new(&arena, "test.cs").compile(block).unwrap();
        // FuncDecl's own end-skip must land past its body, not inside it.
        assert_eq!(cb.code[0], Opcode::FuncDecl.as_byte());
    }
}
