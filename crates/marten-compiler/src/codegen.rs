//! Single-pass bytecode generation.

use marten_bytecode::{
    Constant, ConstantIndex, FeedbackIndex, Function, FunctionFlags, FunctionIndex, Instruction,
    JumpOffset, LivenessEntry, LocalIndex, Module, Register, SourceMap, UpvalueCapture,
};

use crate::ast::{
    AssignTarget, BinaryOp, BindingDecl, BindingKind, Expr, FunctionLiteral, LogicalOp, MemberKey,
    Program, Span, Stmt, UnaryOp,
};
use crate::constant_fold::fold_expr;
use crate::error::CompileError;
use crate::scope::{ResolvedBinding, ScopeChain};

/// Compile a program into a module.
pub fn compile_program(program: &Program, source_url: &str) -> Result<Module, CompileError> {
    Compiler::new(source_url).compile(program)
}

struct LoopCtx {
    /// Break statements to patch to the loop end.
    break_jumps: Vec<usize>,
    /// Continue statements to patch to the continue target.
    continue_jumps: Vec<usize>,
    /// Switch frames accept break but not continue.
    allow_continue: bool,
    /// finally nesting at loop entry; break/continue inline deeper finallys.
    finally_depth: usize,
}

/// Per-function emission state.
struct FunctionCtx {
    name: Option<String>,
    param_count: u8,
    flags: FunctionFlags,
    instructions: Vec<Instruction>,
    next_register: u8,
    max_register: u8,
    /// (source name, capture) pairs; position is the upvalue slot.
    upvalues: Vec<(String, UpvalueCapture)>,
    feedback_count: u16,
    source_map: SourceMap,
    current_span: Option<Span>,
    last_mapped_span: Option<Span>,
    liveness: Vec<LivenessEntry>,
    loops: Vec<LoopCtx>,
    /// Finally bodies to inline ahead of return/break/continue.
    finally_stack: Vec<Vec<Stmt>>,
    lexical_locals: Vec<u16>,
    local_names: Vec<String>,
    /// Entry-function completion register, if this is the entry function.
    completion: Option<Register>,
}

impl FunctionCtx {
    fn new(name: Option<String>, flags: FunctionFlags) -> Self {
        Self {
            name,
            param_count: 0,
            flags,
            instructions: Vec::new(),
            next_register: 0,
            max_register: 0,
            upvalues: Vec::new(),
            feedback_count: 0,
            source_map: SourceMap::new(),
            current_span: None,
            last_mapped_span: None,
            liveness: Vec::new(),
            loops: Vec::new(),
            finally_stack: Vec::new(),
            lexical_locals: Vec::new(),
            local_names: Vec::new(),
            completion: None,
        }
    }
}

/// AST → bytecode compiler.
pub struct Compiler {
    scopes: ScopeChain,
    funcs: Vec<FunctionCtx>,
    module: marten_bytecode::ModuleBuilder,
}

impl Compiler {
    /// Create a compiler for one compilation unit.
    pub fn new(source_url: &str) -> Self {
        Self {
            scopes: ScopeChain::new(),
            funcs: Vec::new(),
            module: Module::builder(source_url),
        }
    }

    /// Compile a whole program; the entry function returns the completion
    /// value (the value of the last top-level expression statement).
    pub fn compile(mut self, program: &Program) -> Result<Module, CompileError> {
        let mut flags = FunctionFlags::default();
        flags.is_strict = program.strict;
        self.funcs.push(FunctionCtx::new(None, flags));
        self.scopes.enter(true);

        self.declare_all(&program.declared)?;

        let completion = self.alloc_register()?;
        self.emit(Instruction::LoadUndefined { dst: completion });
        self.f().completion = Some(completion);

        self.compile_stmts(&program.body)?;

        self.emit(Instruction::Return { src: completion });

        let local_count = self.scopes.local_count();
        self.scopes.exit();
        let ctx = self.funcs.pop().expect("entry function context");
        let entry = self.finish_function(ctx, local_count);
        let idx = self.module.add_function(entry);
        self.module.entry_point(idx);
        Ok(self.module.build())
    }

    // ------------------------------------------------------------------
    // Context plumbing
    // ------------------------------------------------------------------

    fn f(&mut self) -> &mut FunctionCtx {
        self.funcs.last_mut().expect("function context")
    }

    fn emit(&mut self, instruction: Instruction) -> usize {
        let span = self.f().current_span;
        let pc = self.f().instructions.len();
        if let Some(span) = span
            && self.f().last_mapped_span != Some(span)
        {
            self.f().source_map.add(pc as u32, span.line, span.column);
            self.f().last_mapped_span = Some(span);
        }
        self.f().instructions.push(instruction);
        pc
    }

    fn here(&mut self) -> usize {
        self.f().instructions.len()
    }

    fn alloc_register(&mut self) -> Result<Register, CompileError> {
        let ctx = self.f();
        if ctx.next_register == u8::MAX {
            let name = ctx.name.clone().unwrap_or_default();
            return Err(CompileError::TooManyRegisters(name));
        }
        let reg = Register(ctx.next_register);
        ctx.next_register += 1;
        ctx.max_register = ctx.max_register.max(ctx.next_register);
        Ok(reg)
    }

    fn register_mark(&mut self) -> u8 {
        self.f().next_register
    }

    fn reset_registers(&mut self, mark: u8) {
        self.f().next_register = mark;
    }

    fn next_feedback(&mut self) -> FeedbackIndex {
        let ctx = self.f();
        let idx = ctx.feedback_count;
        ctx.feedback_count += 1;
        FeedbackIndex(idx)
    }

    fn string_const(&mut self, s: &str) -> ConstantIndex {
        self.module.constants_mut().add_string(s)
    }

    /// Patch a placeholder jump at `pc` to land on `target`.
    fn patch_jump(&mut self, pc: usize, target: usize) {
        let offset = JumpOffset(target as i32 - pc as i32);
        match &mut self.f().instructions[pc] {
            Instruction::Jump { offset: o }
            | Instruction::JumpIfTrue { offset: o, .. }
            | Instruction::JumpIfFalse { offset: o, .. }
            | Instruction::JumpIfNullish { offset: o, .. } => *o = offset,
            Instruction::TryStart { catch_offset } => *catch_offset = offset,
            other => unreachable!("patching non-jump instruction {other:?}"),
        }
    }

    /// Record interpreter-visible state for deopt at the current pc.
    fn record_liveness(&mut self, pc: usize) {
        let live_locals: Vec<u16> = (0..self.scopes.local_count()).collect();
        let ctx = self.f();
        if ctx.liveness.last().is_some_and(|e| e.pc == pc as u32) {
            return;
        }
        let live_registers: Vec<u8> = (0..ctx.next_register).collect();
        ctx.liveness.push(LivenessEntry {
            pc: pc as u32,
            live_locals,
            live_registers,
        });
    }

    fn finish_function(&mut self, ctx: FunctionCtx, local_count: u16) -> Function {
        let mut builder = Function::builder()
            .param_count(ctx.param_count)
            .local_count(local_count)
            .register_count(ctx.max_register)
            .flags(ctx.flags)
            .instructions(ctx.instructions)
            .feedback_len(ctx.feedback_count)
            .source_map(ctx.source_map)
            .liveness(ctx.liveness)
            .lexical_locals(ctx.lexical_locals);
        if let Some(name) = ctx.name {
            builder = builder.name(name);
        }
        for (_, capture) in ctx.upvalues {
            builder = builder.upvalue(capture);
        }
        for name in ctx.local_names {
            builder = builder.local_name(name);
        }
        builder.build()
    }

    // ------------------------------------------------------------------
    // Declarations
    // ------------------------------------------------------------------

    fn declare_all(&mut self, decls: &[BindingDecl]) -> Result<(), CompileError> {
        for decl in decls {
            self.declare_one(decl)?;
        }
        Ok(())
    }

    fn declare_one(&mut self, decl: &BindingDecl) -> Result<u16, CompileError> {
        let index = self
            .scopes
            .declare(&decl.name, decl.kind, decl.captured)
            .ok_or_else(|| CompileError::DuplicateBinding(decl.name.clone()))?;
        if index as usize >= u16::MAX as usize {
            let name = self.f().name.clone().unwrap_or_default();
            return Err(CompileError::TooManyLocals(name));
        }
        let ctx = self.f();
        if ctx.local_names.len() <= index as usize {
            ctx.local_names.resize(index as usize + 1, String::new());
        }
        ctx.local_names[index as usize] = decl.name.clone();
        if decl.kind.is_lexical() {
            ctx.lexical_locals.push(index);
        }
        Ok(index)
    }

    // ------------------------------------------------------------------
    // Functions
    // ------------------------------------------------------------------

    fn compile_function(&mut self, lit: &FunctionLiteral) -> Result<FunctionIndex, CompileError> {
        let mut flags = FunctionFlags::default();
        flags.is_async = lit.is_async;
        flags.is_generator = lit.is_generator;
        flags.is_arrow = lit.is_arrow;
        flags.is_strict = lit.strict || self.f().flags.is_strict;
        flags.is_constructor = !lit.is_arrow && !lit.is_async && !lit.is_generator;

        self.funcs.push(FunctionCtx::new(lit.name.clone(), flags));
        self.scopes.enter(true);

        // Parameters first: they occupy the leading local slots.
        for param in &lit.params {
            let captured = lit
                .declared
                .iter()
                .any(|d| &d.name == param && d.captured);
            self.declare_one(&BindingDecl {
                name: param.clone(),
                kind: BindingKind::Var,
                captured,
            })?;
        }
        self.f().param_count = lit.params.len() as u8;

        // Then the body-scope declarations the parser collected.
        for decl in &lit.declared {
            if lit.params.contains(&decl.name) {
                continue;
            }
            self.declare_one(decl)?;
        }

        self.compile_stmts(&lit.body)?;

        if !matches!(
            self.f().instructions.last(),
            Some(Instruction::Return { .. }) | Some(Instruction::ReturnUndefined)
        ) {
            self.emit(Instruction::ReturnUndefined);
        }

        let local_count = self.scopes.local_count();
        self.scopes.exit();
        let ctx = self.funcs.pop().expect("function context");
        let function = self.finish_function(ctx, local_count);
        Ok(self.module.add_function(function))
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn compile_stmts(&mut self, stmts: &[Stmt]) -> Result<(), CompileError> {
        // Function declarations are hoisted: their closures exist before any
        // other statement in the scope runs.
        for stmt in stmts {
            if let Stmt::FunctionDecl { name, func } = unwrap_at(stmt) {
                self.hoist_function_decl(name, func)?;
            }
        }
        for stmt in stmts {
            if matches!(unwrap_at(stmt), Stmt::FunctionDecl { .. }) {
                continue;
            }
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    fn hoist_function_decl(
        &mut self,
        name: &str,
        func: &FunctionLiteral,
    ) -> Result<(), CompileError> {
        let mark = self.register_mark();
        let idx = self.compile_function(func)?;
        let dst = self.alloc_register()?;
        self.emit(Instruction::Closure { dst, func: idx });
        self.store_ident(name, dst)?;
        self.reset_registers(mark);
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        let mark = self.register_mark();
        match stmt {
            Stmt::At { span, stmt } => {
                self.f().current_span = Some(*span);
                self.compile_stmt(stmt)?;
            }
            Stmt::Expr(expr) => {
                let r = self.compile_expr(expr)?;
                if let Some(completion) = self.f().completion
                    && self.funcs.len() == 1
                {
                    self.emit(Instruction::Move {
                        dst: completion,
                        src: r,
                    });
                }
            }
            Stmt::VarDecl { kind, declarations } => {
                for (name, init) in declarations {
                    self.compile_var_declarator(*kind, name, init.as_ref())?;
                }
            }
            Stmt::FunctionDecl { .. } => {
                // Hoisted by compile_stmts.
            }
            Stmt::Return(value) => self.compile_return(value.as_ref())?,
            Stmt::If {
                cond,
                then,
                otherwise,
            } => self.compile_if(cond, then, otherwise.as_deref())?,
            Stmt::While { cond, body } => self.compile_while(cond, body)?,
            Stmt::For {
                init,
                cond,
                update,
                body,
            } => self.compile_for(init.as_deref(), cond.as_ref(), update.as_ref(), body)?,
            Stmt::ForOf {
                binding,
                iterable,
                body,
            } => self.compile_for_of(binding, iterable, body)?,
            Stmt::Block { declared, body } => self.compile_block(declared, body)?,
            Stmt::Switch { disc, cases } => self.compile_switch(disc, cases)?,
            Stmt::Break => self.compile_break()?,
            Stmt::Continue => self.compile_continue()?,
            Stmt::Throw(expr) => {
                let r = self.compile_expr(expr)?;
                self.emit(Instruction::Throw { src: r });
            }
            Stmt::Try {
                block,
                catch,
                finally,
            } => self.compile_try(block, catch.as_ref(), finally.as_deref())?,
            Stmt::Empty => {}
        }
        self.reset_registers(mark);
        Ok(())
    }

    fn compile_var_declarator(
        &mut self,
        kind: BindingKind,
        name: &str,
        init: Option<&Expr>,
    ) -> Result<(), CompileError> {
        // The binding itself was declared when its scope was entered; this
        // statement only runs the initializer.
        let value = match init {
            Some(expr) => self.compile_expr(expr)?,
            None => {
                if kind == BindingKind::Var {
                    return Ok(()); // already undefined
                }
                let r = self.alloc_register()?;
                self.emit(Instruction::LoadUndefined { dst: r });
                r
            }
        };
        match self.scopes.resolve(name) {
            ResolvedBinding::Local { index, .. } => {
                self.emit(Instruction::SetLocal {
                    idx: LocalIndex(index),
                    src: value,
                });
            }
            ResolvedBinding::Upvalue { .. } => {
                return Err(CompileError::Internal(format!(
                    "declarator for '{name}' resolved as upvalue"
                )));
            }
            ResolvedBinding::Global(name) => {
                // Top-level `var` outside any declared scope entry.
                let name_idx = self.string_const(&name);
                let ic = self.next_feedback();
                self.emit(Instruction::SetGlobal {
                    name: name_idx,
                    src: value,
                    ic,
                });
            }
        }
        self.scopes.mark_initialized(name);
        Ok(())
    }

    fn compile_return(&mut self, value: Option<&Expr>) -> Result<(), CompileError> {
        let result = match value {
            Some(expr) => Some(self.compile_expr(expr)?),
            None => None,
        };
        // Inline pending finally bodies, innermost first.
        let pending = self.f().finally_stack.clone();
        for body in pending.iter().rev() {
            self.compile_stmts(body)?;
        }
        match result {
            Some(src) => self.emit(Instruction::Return { src }),
            None => self.emit(Instruction::ReturnUndefined),
        };
        Ok(())
    }

    fn compile_if(
        &mut self,
        cond: &Expr,
        then: &[Stmt],
        otherwise: Option<&[Stmt]>,
    ) -> Result<(), CompileError> {
        let cond_reg = self.compile_expr(cond)?;
        let to_else = self.emit(Instruction::JumpIfFalse {
            cond: cond_reg,
            offset: JumpOffset(0),
        });
        self.compile_stmts(then)?;
        match otherwise {
            Some(else_body) => {
                let to_end = self.emit(Instruction::Jump {
                    offset: JumpOffset(0),
                });
                let else_pc = self.here();
                self.patch_jump(to_else, else_pc);
                self.compile_stmts(else_body)?;
                let end = self.here();
                self.patch_jump(to_end, end);
            }
            None => {
                let end = self.here();
                self.patch_jump(to_else, end);
            }
        }
        Ok(())
    }

    fn compile_while(&mut self, cond: &Expr, body: &[Stmt]) -> Result<(), CompileError> {
        let head = self.here();
        self.record_liveness(head);
        let cond_reg = self.compile_expr(cond)?;
        let to_end = self.emit(Instruction::JumpIfFalse {
            cond: cond_reg,
            offset: JumpOffset(0),
        });
        let finally_depth = self.f().finally_stack.len();
        self.f().loops.push(LoopCtx {
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
            allow_continue: true,
            finally_depth,
        });
        self.compile_stmts(body)?;
        let back = self.emit(Instruction::Jump {
            offset: JumpOffset(0),
        });
        self.patch_jump(back, head);
        let end = self.here();
        self.patch_jump(to_end, end);
        let ctx = self.f().loops.pop().expect("loop context");
        for pc in ctx.break_jumps {
            self.patch_jump(pc, end);
        }
        for pc in ctx.continue_jumps {
            self.patch_jump(pc, head);
        }
        Ok(())
    }

    fn compile_for(
        &mut self,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        update: Option<&Expr>,
        body: &[Stmt],
    ) -> Result<(), CompileError> {
        if let Some(init) = init {
            self.compile_stmt(init)?;
        }
        let head = self.here();
        self.record_liveness(head);
        let to_end = match cond {
            Some(cond) => {
                let cond_reg = self.compile_expr(cond)?;
                Some(self.emit(Instruction::JumpIfFalse {
                    cond: cond_reg,
                    offset: JumpOffset(0),
                }))
            }
            None => None,
        };
        let finally_depth = self.f().finally_stack.len();
        self.f().loops.push(LoopCtx {
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
            allow_continue: true,
            finally_depth,
        });
        self.compile_stmts(body)?;
        let update_pc = self.here();
        if let Some(update) = update {
            let mark = self.register_mark();
            self.compile_expr(update)?;
            self.reset_registers(mark);
        }
        let back = self.emit(Instruction::Jump {
            offset: JumpOffset(0),
        });
        self.patch_jump(back, head);
        let end = self.here();
        if let Some(pc) = to_end {
            self.patch_jump(pc, end);
        }
        let ctx = self.f().loops.pop().expect("loop context");
        for pc in ctx.break_jumps {
            self.patch_jump(pc, end);
        }
        for pc in ctx.continue_jumps {
            self.patch_jump(pc, update_pc);
        }
        Ok(())
    }

    fn compile_for_of(
        &mut self,
        binding: &str,
        iterable: &Expr,
        body: &[Stmt],
    ) -> Result<(), CompileError> {
        let iterable_reg = self.compile_expr(iterable)?;
        let iter = self.alloc_register()?;
        self.emit(Instruction::GetIterator {
            dst: iter,
            src: iterable_reg,
        });
        let value = self.alloc_register()?;
        let done = self.alloc_register()?;

        self.scopes.enter(false);
        let index = self
            .scopes
            .declare(binding, BindingKind::Let, false)
            .ok_or_else(|| CompileError::DuplicateBinding(binding.to_string()))?;
        self.scopes.mark_initialized(binding);

        let head = self.here();
        self.record_liveness(head);
        self.emit(Instruction::IteratorNext {
            dst: value,
            done,
            iter,
        });
        let to_end = self.emit(Instruction::JumpIfTrue {
            cond: done,
            offset: JumpOffset(0),
        });
        self.emit(Instruction::SetLocal {
            idx: LocalIndex(index),
            src: value,
        });
        let finally_depth = self.f().finally_stack.len();
        self.f().loops.push(LoopCtx {
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
            allow_continue: true,
            finally_depth,
        });
        self.compile_stmts(body)?;
        let back = self.emit(Instruction::Jump {
            offset: JumpOffset(0),
        });
        self.patch_jump(back, head);
        let end = self.here();
        self.patch_jump(to_end, end);
        let ctx = self.f().loops.pop().expect("loop context");
        for pc in ctx.break_jumps {
            self.patch_jump(pc, end);
        }
        for pc in ctx.continue_jumps {
            self.patch_jump(pc, head);
        }
        self.scopes.exit();
        Ok(())
    }

    fn compile_block(&mut self, declared: &[BindingDecl], body: &[Stmt]) -> Result<(), CompileError> {
        self.scopes.enter(false);
        self.emit(Instruction::PushContext);
        let first_local = self.scopes.local_count();
        self.declare_all(declared)?;
        // Re-arm TDZ for lexical slots: blocks inside loops are re-entered.
        let mark = self.register_mark();
        for decl in declared {
            if decl.kind.is_lexical()
                && let ResolvedBinding::Local { index, .. } = self.scopes.resolve(&decl.name)
            {
                let hole = self.alloc_register()?;
                self.emit(Instruction::LoadHole { dst: hole });
                self.emit(Instruction::SetLocal {
                    idx: LocalIndex(index),
                    src: hole,
                });
                self.reset_registers(mark);
            }
        }
        self.compile_stmts(body)?;
        self.emit(Instruction::PopContext {
            first_local: LocalIndex(first_local),
        });
        self.scopes.exit();
        Ok(())
    }

    fn compile_switch(
        &mut self,
        disc: &Expr,
        cases: &[(Option<Expr>, Vec<Stmt>)],
    ) -> Result<(), CompileError> {
        let disc_reg = self.compile_expr(disc)?;
        let finally_depth = self.f().finally_stack.len();
        self.f().loops.push(LoopCtx {
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
            allow_continue: false,
            finally_depth,
        });

        // Tests first, bodies after; fallthrough between bodies is natural.
        let mut case_jumps: Vec<(usize, usize)> = Vec::new(); // (jump pc, case idx)
        for (idx, (test, _)) in cases.iter().enumerate() {
            if let Some(test) = test {
                let mark = self.register_mark();
                let test_reg = self.compile_expr(test)?;
                let matched = self.alloc_register()?;
                let ic = self.next_feedback();
                self.emit(Instruction::StrictEq {
                    dst: matched,
                    lhs: disc_reg,
                    rhs: test_reg,
                    ic,
                });
                let pc = self.emit(Instruction::JumpIfTrue {
                    cond: matched,
                    offset: JumpOffset(0),
                });
                case_jumps.push((pc, idx));
                self.reset_registers(mark);
            }
        }
        let default_jump = self.emit(Instruction::Jump {
            offset: JumpOffset(0),
        });
        let default_idx = cases.iter().position(|(test, _)| test.is_none());

        let mut body_pcs = Vec::with_capacity(cases.len());
        for (_, body) in cases {
            body_pcs.push(self.here());
            self.compile_stmts(body)?;
        }
        let end = self.here();

        for (pc, idx) in case_jumps {
            self.patch_jump(pc, body_pcs[idx]);
        }
        match default_idx {
            Some(idx) => self.patch_jump(default_jump, body_pcs[idx]),
            None => self.patch_jump(default_jump, end),
        }
        let ctx = self.f().loops.pop().expect("switch context");
        for pc in ctx.break_jumps {
            self.patch_jump(pc, end);
        }
        debug_assert!(ctx.continue_jumps.is_empty());
        Ok(())
    }

    fn compile_break(&mut self) -> Result<(), CompileError> {
        let Some(target_depth) = self.f().loops.last().map(|l| l.finally_depth) else {
            return Err(CompileError::JumpOutsideLoop("break"));
        };
        self.inline_finallys_down_to(target_depth)?;
        let pc = self.emit(Instruction::Jump {
            offset: JumpOffset(0),
        });
        self.f()
            .loops
            .last_mut()
            .expect("loop context")
            .break_jumps
            .push(pc);
        Ok(())
    }

    fn compile_continue(&mut self) -> Result<(), CompileError> {
        let Some(pos) = self.f().loops.iter().rposition(|l| l.allow_continue) else {
            return Err(CompileError::JumpOutsideLoop("continue"));
        };
        let target_depth = self.f().loops[pos].finally_depth;
        self.inline_finallys_down_to(target_depth)?;
        let pc = self.emit(Instruction::Jump {
            offset: JumpOffset(0),
        });
        self.f().loops[pos].continue_jumps.push(pc);
        Ok(())
    }

    fn inline_finallys_down_to(&mut self, depth: usize) -> Result<(), CompileError> {
        let pending: Vec<Vec<Stmt>> = self.f().finally_stack[depth..].to_vec();
        for body in pending.iter().rev() {
            self.compile_stmts(body)?;
        }
        Ok(())
    }

    fn compile_try(
        &mut self,
        block: &[Stmt],
        catch: Option<&(Option<String>, Vec<Stmt>)>,
        finally: Option<&[Stmt]>,
    ) -> Result<(), CompileError> {
        // finally lowers to a catch-all handler plus inlined duplicates on
        // every normal exit path (fallthrough, return, break, continue).
        let outer_try = finally.map(|_| {
            self.emit(Instruction::TryStart {
                catch_offset: JumpOffset(0),
            })
        });
        if let Some(finally_body) = finally {
            self.f().finally_stack.push(finally_body.to_vec());
        }

        let inner_try = catch.map(|_| {
            self.emit(Instruction::TryStart {
                catch_offset: JumpOffset(0),
            })
        });

        self.compile_stmts(block)?;

        let mut after_catch_jump = None;
        if let Some((binding, catch_body)) = catch {
            self.emit(Instruction::TryEnd);
            after_catch_jump = Some(self.emit(Instruction::Jump {
                offset: JumpOffset(0),
            }));
            let catch_pc = self.here();
            self.patch_jump(inner_try.expect("inner try"), catch_pc);

            let mark = self.register_mark();
            let exception = self.alloc_register()?;
            self.emit(Instruction::Catch { dst: exception });
            self.scopes.enter(false);
            if let Some(name) = binding {
                let index = self
                    .scopes
                    .declare(name, BindingKind::Let, false)
                    .ok_or_else(|| CompileError::DuplicateBinding(name.clone()))?;
                self.emit(Instruction::SetLocal {
                    idx: LocalIndex(index),
                    src: exception,
                });
                self.scopes.mark_initialized(name);
            }
            self.compile_stmts(catch_body)?;
            self.scopes.exit();
            self.reset_registers(mark);
        }
        if let Some(pc) = after_catch_jump {
            let after = self.here();
            self.patch_jump(pc, after);
        }

        if let Some(finally_body) = finally {
            self.f().finally_stack.pop();
            self.emit(Instruction::TryEnd);
            // Normal path.
            self.compile_stmts(finally_body)?;
            let skip_exceptional = self.emit(Instruction::Jump {
                offset: JumpOffset(0),
            });
            // Exceptional path: run finally, rethrow.
            let handler_pc = self.here();
            self.patch_jump(outer_try.expect("outer try"), handler_pc);
            let mark = self.register_mark();
            let exception = self.alloc_register()?;
            self.emit(Instruction::Catch { dst: exception });
            self.compile_stmts(finally_body)?;
            self.emit(Instruction::Throw { src: exception });
            self.reset_registers(mark);
            let end = self.here();
            self.patch_jump(skip_exceptional, end);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn compile_expr(&mut self, expr: &Expr) -> Result<Register, CompileError> {
        if let Some(folded) = fold_expr(expr) {
            return self.compile_expr(&folded);
        }
        match expr {
            Expr::Number(n) => self.compile_number(*n),
            Expr::String(s) => {
                let idx = self.string_const(s);
                let dst = self.alloc_register()?;
                self.emit(Instruction::LoadConst { dst, idx });
                Ok(dst)
            }
            Expr::Boolean(b) => {
                let dst = self.alloc_register()?;
                self.emit(if *b {
                    Instruction::LoadTrue { dst }
                } else {
                    Instruction::LoadFalse { dst }
                });
                Ok(dst)
            }
            Expr::Null => {
                let dst = self.alloc_register()?;
                self.emit(Instruction::LoadNull { dst });
                Ok(dst)
            }
            Expr::Undefined => {
                let dst = self.alloc_register()?;
                self.emit(Instruction::LoadUndefined { dst });
                Ok(dst)
            }
            Expr::This => {
                let dst = self.alloc_register()?;
                self.emit(Instruction::LoadThis { dst });
                Ok(dst)
            }
            Expr::NewTarget => {
                let dst = self.alloc_register()?;
                self.emit(Instruction::NewTarget { dst });
                Ok(dst)
            }
            Expr::Ident(name) => self.load_ident(name),
            Expr::Assign { target, value } => self.compile_assign(target, value),
            Expr::Binary { op, lhs, rhs } => self.compile_binary(*op, lhs, rhs),
            Expr::Unary { op, operand } => self.compile_unary(*op, operand),
            Expr::Logical { op, lhs, rhs } => self.compile_logical(*op, lhs, rhs),
            Expr::Update {
                increment,
                prefix,
                target,
            } => self.compile_update(*increment, *prefix, target),
            Expr::Conditional {
                cond,
                then,
                otherwise,
            } => self.compile_conditional(cond, then, otherwise),
            Expr::Call { callee, args } => self.compile_call(callee, args),
            Expr::New { callee, args } => self.compile_new(callee, args),
            Expr::Member { obj, key } => self.compile_member(obj, key),
            Expr::Delete { obj, key } => self.compile_delete(obj, key),
            Expr::Object(props) => self.compile_object_literal(props),
            Expr::Array(elements) => self.compile_array_literal(elements),
            Expr::Function(lit) => {
                let idx = self.compile_function(lit)?;
                let dst = self.alloc_register()?;
                self.emit(Instruction::Closure { dst, func: idx });
                Ok(dst)
            }
            Expr::Await(operand) => {
                if !self.f().flags.is_async {
                    return Err(CompileError::AwaitOutsideAsync);
                }
                let src = self.compile_expr(operand)?;
                let dst = self.alloc_register()?;
                let pc = self.here();
                self.record_liveness(pc);
                self.emit(Instruction::Await { dst, src });
                Ok(dst)
            }
            Expr::Yield(operand) => {
                if !self.f().flags.is_generator {
                    return Err(CompileError::YieldOutsideGenerator);
                }
                let src = match operand {
                    Some(operand) => self.compile_expr(operand)?,
                    None => {
                        let r = self.alloc_register()?;
                        self.emit(Instruction::LoadUndefined { dst: r });
                        r
                    }
                };
                let dst = self.alloc_register()?;
                let pc = self.here();
                self.record_liveness(pc);
                self.emit(Instruction::Yield { dst, src });
                Ok(dst)
            }
        }
    }

    fn compile_number(&mut self, n: f64) -> Result<Register, CompileError> {
        let dst = self.alloc_register()?;
        if n.fract() == 0.0 && !n.is_infinite() && (i32::MIN as f64..=i32::MAX as f64).contains(&n)
        {
            // Negative zero must stay a double.
            if !(n == 0.0 && n.is_sign_negative()) {
                let value = n as i32;
                if let Ok(value8) = i8::try_from(value) {
                    self.emit(Instruction::LoadInt8 { dst, value: value8 });
                } else {
                    self.emit(Instruction::LoadInt32 { dst, value });
                }
                return Ok(dst);
            }
        }
        let idx = self.module.constants_mut().add_number(n);
        self.emit(Instruction::LoadConst { dst, idx });
        Ok(dst)
    }

    fn load_ident(&mut self, name: &str) -> Result<Register, CompileError> {
        match self.scopes.resolve(name) {
            ResolvedBinding::Local {
                index,
                needs_tdz_check,
                ..
            } => {
                if needs_tdz_check {
                    let name_idx = self.string_const(name);
                    self.emit(Instruction::CheckTdz {
                        idx: LocalIndex(index),
                        name: name_idx,
                    });
                }
                let dst = self.alloc_register()?;
                self.emit(Instruction::GetLocal {
                    dst,
                    idx: LocalIndex(index),
                });
                Ok(dst)
            }
            ResolvedBinding::Upvalue { index, depth, .. } => {
                let slot = self.resolve_upvalue(name, index, depth)?;
                let dst = self.alloc_register()?;
                self.emit(Instruction::GetUpvalue {
                    dst,
                    idx: LocalIndex(slot),
                });
                Ok(dst)
            }
            ResolvedBinding::Global(name) => {
                let name_idx = self.string_const(&name);
                let ic = self.next_feedback();
                let dst = self.alloc_register()?;
                self.emit(Instruction::GetGlobal {
                    dst,
                    name: name_idx,
                    ic,
                });
                Ok(dst)
            }
        }
    }

    fn store_ident(&mut self, name: &str, src: Register) -> Result<(), CompileError> {
        match self.scopes.resolve(name) {
            ResolvedBinding::Local {
                index, is_const, ..
            } => {
                if is_const {
                    return Err(CompileError::AssignToConst(name.to_string()));
                }
                self.emit(Instruction::SetLocal {
                    idx: LocalIndex(index),
                    src,
                });
            }
            ResolvedBinding::Upvalue {
                index,
                depth,
                is_const,
            } => {
                if is_const {
                    return Err(CompileError::AssignToConst(name.to_string()));
                }
                let slot = self.resolve_upvalue(name, index, depth)?;
                self.emit(Instruction::SetUpvalue {
                    idx: LocalIndex(slot),
                    src,
                });
            }
            ResolvedBinding::Global(name) => {
                let name_idx = self.string_const(&name);
                let ic = self.next_feedback();
                self.emit(Instruction::SetGlobal {
                    name: name_idx,
                    src,
                    ic,
                });
            }
        }
        Ok(())
    }

    /// Thread an upvalue capture through every function between the use and
    /// the declaration, returning the slot in the current function.
    fn resolve_upvalue(
        &mut self,
        name: &str,
        local_index: u16,
        depth: usize,
    ) -> Result<u16, CompileError> {
        let current = self.funcs.len() - 1;
        let declaring = current - depth;
        let mut slot = 0u16;
        for level in (declaring + 1)..=current {
            let capture = if level == declaring + 1 {
                UpvalueCapture::Local(LocalIndex(local_index))
            } else {
                UpvalueCapture::Upvalue(LocalIndex(slot))
            };
            let ctx = &mut self.funcs[level];
            slot = match ctx.upvalues.iter().position(|(n, _)| n == name) {
                Some(existing) => existing as u16,
                None => {
                    ctx.upvalues.push((name.to_string(), capture));
                    (ctx.upvalues.len() - 1) as u16
                }
            };
        }
        Ok(slot)
    }

    fn compile_assign(
        &mut self,
        target: &AssignTarget,
        value: &Expr,
    ) -> Result<Register, CompileError> {
        match target {
            AssignTarget::Ident(name) => {
                let r = self.compile_expr(value)?;
                self.store_ident(name, r)?;
                Ok(r)
            }
            AssignTarget::Member { obj, key } => {
                let obj_reg = self.compile_expr(obj)?;
                match key {
                    MemberKey::Named(name) => {
                        let r = self.compile_expr(value)?;
                        let name_idx = self.string_const(name);
                        let ic = self.next_feedback();
                        self.emit(Instruction::SetProp {
                            obj: obj_reg,
                            name: name_idx,
                            src: r,
                            ic,
                        });
                        Ok(r)
                    }
                    MemberKey::Computed(key_expr) => {
                        let key_reg = self.compile_expr(key_expr)?;
                        let r = self.compile_expr(value)?;
                        let ic = self.next_feedback();
                        self.emit(Instruction::SetElem {
                            obj: obj_reg,
                            key: key_reg,
                            src: r,
                            ic,
                        });
                        Ok(r)
                    }
                }
            }
        }
    }

    fn compile_binary(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<Register, CompileError> {
        let lhs_reg = self.compile_expr(lhs)?;
        let rhs_reg = self.compile_expr(rhs)?;
        let dst = self.alloc_register()?;
        let instruction = match op {
            BinaryOp::Add => Instruction::Add {
                dst,
                lhs: lhs_reg,
                rhs: rhs_reg,
                ic: self.next_feedback(),
            },
            BinaryOp::Sub => Instruction::Sub {
                dst,
                lhs: lhs_reg,
                rhs: rhs_reg,
                ic: self.next_feedback(),
            },
            BinaryOp::Mul => Instruction::Mul {
                dst,
                lhs: lhs_reg,
                rhs: rhs_reg,
                ic: self.next_feedback(),
            },
            BinaryOp::Div => Instruction::Div {
                dst,
                lhs: lhs_reg,
                rhs: rhs_reg,
                ic: self.next_feedback(),
            },
            BinaryOp::Mod => Instruction::Mod {
                dst,
                lhs: lhs_reg,
                rhs: rhs_reg,
                ic: self.next_feedback(),
            },
            BinaryOp::Pow => Instruction::Pow {
                dst,
                lhs: lhs_reg,
                rhs: rhs_reg,
                ic: self.next_feedback(),
            },
            BinaryOp::BitAnd => Instruction::BitAnd {
                dst,
                lhs: lhs_reg,
                rhs: rhs_reg,
            },
            BinaryOp::BitOr => Instruction::BitOr {
                dst,
                lhs: lhs_reg,
                rhs: rhs_reg,
            },
            BinaryOp::BitXor => Instruction::BitXor {
                dst,
                lhs: lhs_reg,
                rhs: rhs_reg,
            },
            BinaryOp::Shl => Instruction::Shl {
                dst,
                lhs: lhs_reg,
                rhs: rhs_reg,
            },
            BinaryOp::Shr => Instruction::Shr {
                dst,
                lhs: lhs_reg,
                rhs: rhs_reg,
            },
            BinaryOp::Ushr => Instruction::Ushr {
                dst,
                lhs: lhs_reg,
                rhs: rhs_reg,
            },
            BinaryOp::Eq => Instruction::Eq {
                dst,
                lhs: lhs_reg,
                rhs: rhs_reg,
                ic: self.next_feedback(),
            },
            BinaryOp::StrictEq => Instruction::StrictEq {
                dst,
                lhs: lhs_reg,
                rhs: rhs_reg,
                ic: self.next_feedback(),
            },
            BinaryOp::Ne => Instruction::Ne {
                dst,
                lhs: lhs_reg,
                rhs: rhs_reg,
                ic: self.next_feedback(),
            },
            BinaryOp::StrictNe => Instruction::StrictNe {
                dst,
                lhs: lhs_reg,
                rhs: rhs_reg,
                ic: self.next_feedback(),
            },
            BinaryOp::Lt => Instruction::Lt {
                dst,
                lhs: lhs_reg,
                rhs: rhs_reg,
                ic: self.next_feedback(),
            },
            BinaryOp::Le => Instruction::Le {
                dst,
                lhs: lhs_reg,
                rhs: rhs_reg,
                ic: self.next_feedback(),
            },
            BinaryOp::Gt => Instruction::Gt {
                dst,
                lhs: lhs_reg,
                rhs: rhs_reg,
                ic: self.next_feedback(),
            },
            BinaryOp::Ge => Instruction::Ge {
                dst,
                lhs: lhs_reg,
                rhs: rhs_reg,
                ic: self.next_feedback(),
            },
            BinaryOp::InstanceOf => Instruction::InstanceOf {
                dst,
                lhs: lhs_reg,
                rhs: rhs_reg,
            },
            BinaryOp::In => Instruction::In {
                dst,
                lhs: lhs_reg,
                rhs: rhs_reg,
            },
        };
        self.emit(instruction);
        Ok(dst)
    }

    fn compile_unary(&mut self, op: UnaryOp, operand: &Expr) -> Result<Register, CompileError> {
        let src = self.compile_expr(operand)?;
        let dst = self.alloc_register()?;
        let instruction = match op {
            UnaryOp::Neg => Instruction::Neg { dst, src },
            UnaryOp::Not => Instruction::Not { dst, src },
            UnaryOp::BitNot => Instruction::BitNot { dst, src },
            UnaryOp::TypeOf => Instruction::TypeOf { dst, src },
        };
        self.emit(instruction);
        Ok(dst)
    }

    fn compile_logical(
        &mut self,
        op: LogicalOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<Register, CompileError> {
        let dst = self.alloc_register()?;
        let lhs_reg = self.compile_expr(lhs)?;
        self.emit(Instruction::Move { dst, src: lhs_reg });
        let short_circuit = match op {
            LogicalOp::And => self.emit(Instruction::JumpIfFalse {
                cond: dst,
                offset: JumpOffset(0),
            }),
            LogicalOp::Or => self.emit(Instruction::JumpIfTrue {
                cond: dst,
                offset: JumpOffset(0),
            }),
            LogicalOp::Nullish => {
                // Evaluate rhs only when lhs is nullish.
                let to_rhs = self.emit(Instruction::JumpIfNullish {
                    cond: dst,
                    offset: JumpOffset(0),
                });
                let to_end = self.emit(Instruction::Jump {
                    offset: JumpOffset(0),
                });
                let rhs_pc = self.here();
                self.patch_jump(to_rhs, rhs_pc);
                let rhs_reg = self.compile_expr(rhs)?;
                self.emit(Instruction::Move { dst, src: rhs_reg });
                let end = self.here();
                self.patch_jump(to_end, end);
                return Ok(dst);
            }
        };
        let rhs_reg = self.compile_expr(rhs)?;
        self.emit(Instruction::Move { dst, src: rhs_reg });
        let end = self.here();
        self.patch_jump(short_circuit, end);
        Ok(dst)
    }

    fn compile_update(
        &mut self,
        increment: bool,
        prefix: bool,
        target: &str,
    ) -> Result<Register, CompileError> {
        let old = self.load_ident(target)?;
        let new = self.alloc_register()?;
        self.emit(if increment {
            Instruction::Inc { dst: new, src: old }
        } else {
            Instruction::Dec { dst: new, src: old }
        });
        self.store_ident(target, new)?;
        Ok(if prefix { new } else { old })
    }

    fn compile_conditional(
        &mut self,
        cond: &Expr,
        then: &Expr,
        otherwise: &Expr,
    ) -> Result<Register, CompileError> {
        let dst = self.alloc_register()?;
        let cond_reg = self.compile_expr(cond)?;
        let to_else = self.emit(Instruction::JumpIfFalse {
            cond: cond_reg,
            offset: JumpOffset(0),
        });
        let mark = self.register_mark();
        let then_reg = self.compile_expr(then)?;
        self.emit(Instruction::Move { dst, src: then_reg });
        self.reset_registers(mark);
        let to_end = self.emit(Instruction::Jump {
            offset: JumpOffset(0),
        });
        let else_pc = self.here();
        self.patch_jump(to_else, else_pc);
        let else_reg = self.compile_expr(otherwise)?;
        self.emit(Instruction::Move { dst, src: else_reg });
        self.reset_registers(mark);
        let end = self.here();
        self.patch_jump(to_end, end);
        Ok(dst)
    }

    fn compile_call(&mut self, callee: &Expr, args: &[Expr]) -> Result<Register, CompileError> {
        // `obj.m(...)` keeps the receiver for `this` binding.
        if let Expr::Member {
            obj,
            key: MemberKey::Named(name),
        } = callee
        {
            let obj_reg = self.compile_expr(obj)?;
            let arg_regs = self.compile_args(args)?;
            let name_idx = self.string_const(name);
            let ic = self.next_feedback();
            let dst = self.alloc_register()?;
            let pc = self.here();
            self.record_liveness(pc);
            self.emit(Instruction::CallMethod {
                dst,
                obj: obj_reg,
                name: name_idx,
                args: arg_regs,
                ic,
            });
            return Ok(dst);
        }
        let callee_reg = self.compile_expr(callee)?;
        let arg_regs = self.compile_args(args)?;
        let ic = self.next_feedback();
        let dst = self.alloc_register()?;
        let pc = self.here();
        self.record_liveness(pc);
        self.emit(Instruction::Call {
            dst,
            callee: callee_reg,
            args: arg_regs,
            ic,
        });
        Ok(dst)
    }

    fn compile_new(&mut self, callee: &Expr, args: &[Expr]) -> Result<Register, CompileError> {
        let callee_reg = self.compile_expr(callee)?;
        let arg_regs = self.compile_args(args)?;
        let ic = self.next_feedback();
        let dst = self.alloc_register()?;
        let pc = self.here();
        self.record_liveness(pc);
        self.emit(Instruction::Construct {
            dst,
            callee: callee_reg,
            args: arg_regs,
            ic,
        });
        Ok(dst)
    }

    fn compile_args(&mut self, args: &[Expr]) -> Result<Vec<Register>, CompileError> {
        let mut regs = Vec::with_capacity(args.len());
        for arg in args {
            regs.push(self.compile_expr(arg)?);
        }
        Ok(regs)
    }

    fn compile_member(&mut self, obj: &Expr, key: &MemberKey) -> Result<Register, CompileError> {
        let obj_reg = self.compile_expr(obj)?;
        match key {
            MemberKey::Named(name) => {
                let name_idx = self.string_const(name);
                let ic = self.next_feedback();
                let dst = self.alloc_register()?;
                self.emit(Instruction::GetProp {
                    dst,
                    obj: obj_reg,
                    name: name_idx,
                    ic,
                });
                Ok(dst)
            }
            MemberKey::Computed(key_expr) => {
                let key_reg = self.compile_expr(key_expr)?;
                let ic = self.next_feedback();
                let dst = self.alloc_register()?;
                self.emit(Instruction::GetElem {
                    dst,
                    obj: obj_reg,
                    key: key_reg,
                    ic,
                });
                Ok(dst)
            }
        }
    }

    fn compile_delete(&mut self, obj: &Expr, key: &MemberKey) -> Result<Register, CompileError> {
        let obj_reg = self.compile_expr(obj)?;
        let key_reg = match key {
            MemberKey::Named(name) => {
                let idx = self.string_const(name);
                let r = self.alloc_register()?;
                self.emit(Instruction::LoadConst { dst: r, idx });
                r
            }
            MemberKey::Computed(expr) => self.compile_expr(expr)?,
        };
        let dst = self.alloc_register()?;
        self.emit(Instruction::DeleteProp {
            dst,
            obj: obj_reg,
            key: key_reg,
        });
        Ok(dst)
    }

    fn compile_object_literal(
        &mut self,
        props: &[(String, Expr)],
    ) -> Result<Register, CompileError> {
        let dst = self.alloc_register()?;
        if props.is_empty() {
            self.emit(Instruction::NewObject { dst });
            return Ok(dst);
        }
        // Shape seed: the property names in definition order, so every
        // literal with this layout lands on one shape without transitions.
        let keys: Vec<String> = props.iter().map(|(k, _)| k.clone()).collect();
        let seed = self.module.constants_mut().add(Constant::PropertyList(keys));
        self.emit(Instruction::NewObjectSeeded { dst, seed });
        for (name, value) in props {
            let mark = self.register_mark();
            let value_reg = self.compile_expr(value)?;
            let name_idx = self.string_const(name);
            self.emit(Instruction::DefineDataProp {
                obj: dst,
                name: name_idx,
                src: value_reg,
            });
            self.reset_registers(mark);
        }
        Ok(dst)
    }

    fn compile_array_literal(&mut self, elements: &[Expr]) -> Result<Register, CompileError> {
        let dst = self.alloc_register()?;
        self.emit(Instruction::NewArray {
            dst,
            capacity: elements.len() as u32,
        });
        let ic = self.next_feedback();
        for (i, element) in elements.iter().enumerate() {
            let mark = self.register_mark();
            let value_reg = self.compile_expr(element)?;
            let key = self.alloc_register()?;
            self.emit(Instruction::LoadInt32 {
                dst: key,
                value: i as i32,
            });
            self.emit(Instruction::SetElem {
                obj: dst,
                key,
                src: value_reg,
                ic,
            });
            self.reset_registers(mark);
        }
        Ok(dst)
    }
}

fn unwrap_at(stmt: &Stmt) -> &Stmt {
    match stmt {
        Stmt::At { stmt, .. } => unwrap_at(stmt),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build::*;

    #[test]
    fn sum_loop_compiles() {
        // var s = 0; for (var i = 1; i <= 10; i++) s = s + i; s
        let program = program(
            vec![decl("s", BindingKind::Var), decl("i", BindingKind::Var)],
            vec![
                var("s", num(0.0)),
                Stmt::For {
                    init: Some(Box::new(var("i", num(1.0)))),
                    cond: Some(binary(BinaryOp::Le, ident("i"), num(10.0))),
                    update: Some(Expr::Update {
                        increment: true,
                        prefix: false,
                        target: "i".to_string(),
                    }),
                    body: vec![expr(assign(
                        "s",
                        binary(BinaryOp::Add, ident("s"), ident("i")),
                    ))],
                },
                expr(ident("s")),
            ],
        );
        let module = compile_program(&program, "s1.js").unwrap();
        let entry = module.entry_function().unwrap();
        assert!(entry.instructions.len() > 5);
        // Entry returns the completion value, not undefined.
        assert!(matches!(
            entry.instructions.last(),
            Some(Instruction::Return { .. })
        ));
        // The loop head carries a liveness record for OSR/deopt.
        assert!(!entry.liveness.is_empty());
    }

    #[test]
    fn closure_captures_thread_through() {
        // function mk(x) { return function (y) { return x + y; }; }
        let inner = function(
            None,
            &["y"],
            vec![],
            vec![ret(binary(BinaryOp::Add, ident("x"), ident("y")))],
        );
        let mk = function(
            Some("mk"),
            &["x"],
            vec![captured_decl("x", BindingKind::Var)],
            vec![ret(Expr::Function(Box::new(inner)))],
        );
        let program = program(
            vec![decl("mk", BindingKind::Function)],
            vec![Stmt::FunctionDecl {
                name: "mk".to_string(),
                func: Box::new(mk),
            }],
        );
        let module = compile_program(&program, "s2.js").unwrap();
        // Three functions: entry, mk, inner.
        assert_eq!(module.functions.len(), 3);
        let inner_fn = module
            .functions
            .iter()
            .find(|f| f.name.is_none() && f.param_count == 1)
            .unwrap();
        assert_eq!(
            inner_fn.upvalues,
            vec![UpvalueCapture::Local(LocalIndex(0))]
        );
    }

    #[test]
    fn tdz_guard_emitted_for_use_before_init() {
        // { f(); let a = 1; } where reading `a` inside f's body is runtime TDZ,
        // but a direct read before the declaration gets a static guard.
        let program = program(
            vec![],
            vec![Stmt::Block {
                declared: vec![decl("a", BindingKind::Let)],
                body: vec![
                    expr(ident("a")), // read before initialization
                    let_("a", num(1.0)),
                ],
            }],
        );
        let module = compile_program(&program, "tdz.js").unwrap();
        let entry = module.entry_function().unwrap();
        assert!(
            entry
                .instructions
                .iter()
                .any(|i| matches!(i, Instruction::CheckTdz { .. }))
        );
        assert_eq!(entry.lexical_locals, vec![0]);
    }

    #[test]
    fn const_assignment_is_rejected() {
        let program = program(
            vec![decl("c", BindingKind::Const)],
            vec![
                Stmt::VarDecl {
                    kind: BindingKind::Const,
                    declarations: vec![("c".to_string(), Some(num(1.0)))],
                },
                expr(assign("c", num(2.0))),
            ],
        );
        let err = compile_program(&program, "const.js").unwrap_err();
        assert_eq!(err, CompileError::AssignToConst("c".to_string()));
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let program = program(vec![], vec![Stmt::Break]);
        let err = compile_program(&program, "break.js").unwrap_err();
        assert_eq!(err, CompileError::JumpOutsideLoop("break"));
    }

    #[test]
    fn method_call_uses_call_method() {
        let program = program(
            vec![],
            vec![expr(call(member(ident("o"), "m"), vec![num(1.0)]))],
        );
        let module = compile_program(&program, "call.js").unwrap();
        let entry = module.entry_function().unwrap();
        assert!(
            entry
                .instructions
                .iter()
                .any(|i| matches!(i, Instruction::CallMethod { .. }))
        );
    }

    #[test]
    fn object_literal_gets_shape_seed() {
        let program = program(
            vec![],
            vec![expr(Expr::Object(vec![
                ("a".to_string(), num(1.0)),
                ("b".to_string(), num(2.0)),
            ]))],
        );
        let module = compile_program(&program, "obj.js").unwrap();
        let entry = module.entry_function().unwrap();
        let seed = entry.instructions.iter().find_map(|i| match i {
            Instruction::NewObjectSeeded { seed, .. } => Some(*seed),
            _ => None,
        });
        let seed = seed.expect("literal must be seeded");
        match module.constants.get(seed) {
            Some(Constant::PropertyList(keys)) => {
                assert_eq!(keys, &vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected property list, got {other:?}"),
        }
    }

    #[test]
    fn feedback_slots_are_unique_per_site() {
        let program = program(
            vec![],
            vec![
                expr(member(ident("o"), "x")),
                expr(member(ident("o"), "x")),
            ],
        );
        let module = compile_program(&program, "fb.js").unwrap();
        let entry = module.entry_function().unwrap();
        let ics: Vec<u16> = entry
            .instructions
            .iter()
            .filter_map(|i| i.feedback_index())
            .map(|f| f.index())
            .collect();
        let mut deduped = ics.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(ics.len(), deduped.len(), "feedback slots must not repeat");
        assert_eq!(entry.feedback_len as usize, ics.len());
    }

    #[test]
    fn try_finally_duplicates_finally_on_return() {
        // try { return 1; } finally { g(); }
        let f = function(
            Some("f"),
            &[],
            vec![],
            vec![Stmt::Try {
                block: vec![ret(num(1.0))],
                catch: None,
                finally: Some(vec![expr(call(ident("g"), vec![]))]),
            }],
        );
        let program = program(
            vec![decl("f", BindingKind::Function)],
            vec![Stmt::FunctionDecl {
                name: "f".to_string(),
                func: Box::new(f),
            }],
        );
        let module = compile_program(&program, "fin.js").unwrap();
        let f_fn = module
            .functions
            .iter()
            .find(|f| f.name.as_deref() == Some("f"))
            .unwrap();
        // The call to g appears twice: once inlined before the return, once
        // on the normal/exceptional paths.
        let call_count = f_fn
            .instructions
            .iter()
            .filter(|i| matches!(i, Instruction::Call { .. }))
            .count();
        assert!(call_count >= 2, "finally body must be duplicated");
    }
}
