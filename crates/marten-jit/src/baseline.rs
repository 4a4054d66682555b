//! Baseline tier: one linear pass, one template per opcode.
//!
//! Frame state (locals, registers) stays in the memory arrays the caller
//! supplies through [`JitContext`], in exactly the interpreter's layout,
//! which makes OSR from the interpreter a pointer handoff and keeps deopt
//! trivial (state is always committed). Fast paths are inlined for SMI
//! arithmetic and comparisons; everything else calls the runtime-helper
//! table. Helper results are checked for control sentinels and propagated.
//!
//! Functions containing exception handlers or suspension points are not
//! compiled; they stay in the interpreter.

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::instructions::BlockArg;
use cranelift_codegen::ir::{Block, FuncRef, InstBuilder, MemFlags, UserFuncName, Value, types};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext, Variable};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module};
use rustc_hash::FxHashMap;
use std::mem::offset_of;

use marten_bytecode::instruction::Instruction;
use marten_bytecode::{Function, Opcode, Register};

use crate::bailout::BAILOUT_SENTINEL;
use crate::code::CodeArtifact;
use crate::error::JitError;
use crate::helpers::{HelperKind, JitContext, RuntimeHelpers, entry_signature, helper_signature};
use crate::tiering::Tier;
use crate::type_guards;

/// Compile one function at the baseline tier.
pub fn compile(function: &Function, helpers: &RuntimeHelpers) -> Result<CodeArtifact, JitError> {
    reject_unsupported(function)?;

    let mut flag_builder = settings::builder();
    flag_builder
        .set("opt_level", "speed")
        .map_err(|e| JitError::Builder(e.to_string()))?;
    let isa = cranelift_native::builder()
        .map_err(|e| JitError::Builder(e.to_string()))?
        .finish(settings::Flags::new(flag_builder))
        .map_err(|e| JitError::Builder(e.to_string()))?;
    let mut jit_builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
    helpers.register_symbols(&mut jit_builder);
    let mut module = JITModule::new(jit_builder);

    let call_conv = module.isa().default_call_conv();
    let helper_sig = helper_signature(call_conv);
    let entry_sig = entry_signature(call_conv);

    let mut helper_ids = FxHashMap::default();
    for &kind in HelperKind::ALL {
        let id = module.declare_function(kind.symbol(), Linkage::Import, &helper_sig)?;
        helper_ids.insert(kind, id);
    }

    let name = format!("mbl_{}", function.display_name().replace(['<', '>'], "_"));
    let func_id = module.declare_function(&name, Linkage::Local, &entry_sig)?;

    let mut codegen_ctx = module.make_context();
    codegen_ctx.func = cranelift_codegen::ir::Function::with_name_signature(
        UserFuncName::user(0, func_id.as_u32()),
        entry_sig,
    );

    let osr_entries;
    {
        let mut fb_ctx = FunctionBuilderContext::new();
        let mut builder = FunctionBuilder::new(&mut codegen_ctx.func, &mut fb_ctx);
        let mut translator = Translator::new(&mut builder, &mut module, &helper_ids, function);
        osr_entries = translator.translate()?;
        builder.finalize();
    }

    module.define_function(func_id, &mut codegen_ctx)?;
    module.clear_context(&mut codegen_ctx);
    module
        .finalize_definitions()
        .map_err(|e| JitError::Builder(e.to_string()))?;

    let entry_ptr = module.get_finalized_function(func_id);
    // SAFETY: declared and defined with `entry_signature` above.
    let entry: crate::code::EntryFn = unsafe { std::mem::transmute(entry_ptr) };
    let mut artifact = CodeArtifact::new(Tier::Baseline, entry, module);
    artifact.osr_entries = osr_entries;
    #[cfg(feature = "jit_logging")]
    tracing::debug!(
        function = function.display_name(),
        osr_entries = artifact.osr_entries.len(),
        "baseline compile finished"
    );
    Ok(artifact)
}

/// Baseline never compiles handlers or suspension points.
fn reject_unsupported(function: &Function) -> Result<(), JitError> {
    for (pc, instruction) in function.instructions.iter().enumerate() {
        let opcode = instruction.opcode();
        if matches!(
            opcode,
            Opcode::TryStart | Opcode::TryEnd | Opcode::Catch | Opcode::Await | Opcode::Yield
        ) {
            return Err(JitError::UnsupportedInstruction {
                pc,
                opcode: opcode.name(),
            });
        }
    }
    Ok(())
}

struct Translator<'a, 'b> {
    builder: &'a mut FunctionBuilder<'b>,
    module: &'a mut JITModule,
    helper_ids: &'a FxHashMap<HelperKind, cranelift_module::FuncId>,
    helper_refs: FxHashMap<HelperKind, FuncRef>,
    function: &'a Function,
    blocks: Vec<Block>,
    /// Shared exit that returns a sentinel or value carried as a param.
    propagate: Block,
    /// Falling off the end of the bytecode returns undefined.
    end_block: Block,
    ctx_var: Variable,
    registers_var: Variable,
    locals_var: Variable,
    scratch_var: Variable,
    /// Locals must round-trip through helpers when closures may alias them.
    locals_via_helper: bool,
}

impl<'a, 'b> Translator<'a, 'b> {
    fn new(
        builder: &'a mut FunctionBuilder<'b>,
        module: &'a mut JITModule,
        helper_ids: &'a FxHashMap<HelperKind, cranelift_module::FuncId>,
        function: &'a Function,
    ) -> Self {
        let locals_via_helper = function
            .instructions
            .iter()
            .any(|i| i.opcode() == Opcode::Closure);
        let propagate = builder.create_block();
        let end_block = builder.create_block();
        Self {
            builder,
            module,
            helper_ids,
            helper_refs: FxHashMap::default(),
            function,
            blocks: Vec::new(),
            propagate,
            end_block,
            ctx_var: Variable::from_u32(0),
            registers_var: Variable::from_u32(1),
            locals_var: Variable::from_u32(2),
            scratch_var: Variable::from_u32(3),
            locals_via_helper,
        }
    }

    fn translate(&mut self) -> Result<Vec<u32>, JitError> {
        let instruction_count = self.function.instructions.len();
        for _ in 0..instruction_count.max(1) {
            let block = self.builder.create_block();
            self.blocks.push(block);
        }

        self.builder.append_block_param(self.propagate, types::I64);

        let entry = self.builder.create_block();
        self.builder.append_block_params_for_function_params(entry);
        self.builder.switch_to_block(entry);

        self.ctx_var = self.builder.declare_var(types::I64);
        self.registers_var = self.builder.declare_var(types::I64);
        self.locals_var = self.builder.declare_var(types::I64);
        self.scratch_var = self.builder.declare_var(types::I64);
        let ctx = self.builder.block_params(entry)[0];
        self.builder.def_var(self.ctx_var, ctx);
        let registers = self.load_ctx_field(ctx, offset_of!(JitContext, registers));
        self.builder.def_var(self.registers_var, registers);
        let locals = self.load_ctx_field(ctx, offset_of!(JitContext, locals));
        self.builder.def_var(self.locals_var, locals);
        let scratch = self.load_ctx_field(ctx, offset_of!(JitContext, scratch));
        self.builder.def_var(self.scratch_var, scratch);

        // OSR dispatch: a nonzero osr_pc enters at the matching loop head.
        let osr_entries = self.back_edge_targets();
        let osr_pc = self.load_ctx_field_u32(ctx, offset_of!(JitContext, osr_pc));
        let mut next = self.builder.create_block();
        let zero_check = self.builder.ins().icmp_imm(IntCC::Equal, osr_pc, 0);
        self.builder
            .ins()
            .brif(zero_check, self.blocks[0], &[], next, &[]);
        for &target in &osr_entries {
            self.builder.switch_to_block(next);
            next = self.builder.create_block();
            let here = self.builder.ins().icmp_imm(IntCC::Equal, osr_pc, target as i64);
            self.builder
                .ins()
                .brif(here, self.blocks[target as usize], &[], next, &[]);
        }
        // Unknown OSR target: hand back to the interpreter.
        self.builder.switch_to_block(next);
        let bailout = self.builder.ins().iconst(types::I64, BAILOUT_SENTINEL);
        self.builder.ins().return_(&[bailout]);

        // Propagate block: return whatever sentinel/value it was handed.
        self.builder.switch_to_block(self.propagate);
        let carried = self.builder.block_params(self.propagate)[0];
        self.builder.ins().return_(&[carried]);

        // Falling past the last instruction returns undefined.
        self.builder.switch_to_block(self.end_block);
        let undef = self
            .builder
            .ins()
            .iconst(types::I64, type_guards::TAG_UNDEFINED);
        self.builder.ins().return_(&[undef]);

        for pc in 0..instruction_count {
            let instruction = &self.function.instructions[pc];
            self.builder.switch_to_block(self.blocks[pc]);
            let fallthrough = self.emit_instruction(pc, instruction)?;
            if fallthrough {
                if pc + 1 < instruction_count {
                    let target = self.blocks[pc + 1];
                    self.builder.ins().jump(target, &[]);
                } else {
                    let undef = self
                        .builder
                        .ins()
                        .iconst(types::I64, type_guards::TAG_UNDEFINED);
                    self.builder.ins().return_(&[undef]);
                }
            }
        }
        if instruction_count == 0 {
            self.builder.switch_to_block(self.blocks[0]);
            let undef = self
                .builder
                .ins()
                .iconst(types::I64, type_guards::TAG_UNDEFINED);
            self.builder.ins().return_(&[undef]);
        }

        self.builder.seal_all_blocks();
        Ok(osr_entries)
    }

    fn back_edge_targets(&self) -> Vec<u32> {
        let mut targets = Vec::new();
        for (pc, instruction) in self.function.instructions.iter().enumerate() {
            let offset = match instruction {
                Instruction::Jump { offset }
                | Instruction::JumpIfTrue { offset, .. }
                | Instruction::JumpIfFalse { offset, .. }
                | Instruction::JumpIfNullish { offset, .. } => offset.offset(),
                _ => continue,
            };
            if offset < 0 {
                let target = (pc as i64 + offset as i64) as u32;
                if !targets.contains(&target) {
                    targets.push(target);
                }
            }
        }
        targets
    }

    // --- small emission helpers ---------------------------------------

    fn load_ctx_field(&mut self, ctx: Value, offset: usize) -> Value {
        self.builder
            .ins()
            .load(types::I64, MemFlags::trusted(), ctx, offset as i32)
    }

    fn load_ctx_field_u32(&mut self, ctx: Value, offset: usize) -> Value {
        let narrow = self
            .builder
            .ins()
            .load(types::I32, MemFlags::trusted(), ctx, offset as i32);
        self.builder.ins().uextend(types::I64, narrow)
    }

    fn ctx(&mut self) -> Value {
        self.builder.use_var(self.ctx_var)
    }

    fn read_reg(&mut self, reg: Register) -> Value {
        let base = self.builder.use_var(self.registers_var);
        self.builder.ins().load(
            types::I64,
            MemFlags::trusted(),
            base,
            (reg.index() as i32) * 8,
        )
    }

    fn write_reg(&mut self, reg: Register, value: Value) {
        let base = self.builder.use_var(self.registers_var);
        self.builder.ins().store(
            MemFlags::trusted(),
            value,
            base,
            (reg.index() as i32) * 8,
        );
    }

    fn read_local(&mut self, idx: u16) -> Value {
        let base = self.builder.use_var(self.locals_var);
        self.builder
            .ins()
            .load(types::I64, MemFlags::trusted(), base, (idx as i32) * 8)
    }

    fn write_local(&mut self, idx: u16, value: Value) {
        let base = self.builder.use_var(self.locals_var);
        self.builder
            .ins()
            .store(MemFlags::trusted(), value, base, (idx as i32) * 8);
    }

    fn helper_ref(&mut self, kind: HelperKind) -> FuncRef {
        if let Some(&existing) = self.helper_refs.get(&kind) {
            return existing;
        }
        let id = self.helper_ids[&kind];
        let func_ref = self.module.declare_func_in_func(id, self.builder.func);
        self.helper_refs.insert(kind, func_ref);
        func_ref
    }

    /// Call a helper and branch to the propagate block on any control
    /// sentinel (throw/bailout/deopt all unwind identically here).
    fn call_helper(&mut self, kind: HelperKind, a: Value, b: Value, c: Value) -> Value {
        let func_ref = self.helper_ref(kind);
        let ctx = self.ctx();
        let call = self.builder.ins().call(func_ref, &[ctx, a, b, c]);
        let result = self.builder.inst_results(call)[0];

        let high = self.builder.ins().ushr_imm(result, 48);
        let is_sentinel = self.builder.ins().icmp_imm(IntCC::Equal, high, 0x7FFD);
        let ok_block = self.builder.create_block();
        self.builder.ins().brif(
            is_sentinel,
            self.propagate,
            &[BlockArg::Value(result)],
            ok_block,
            &[],
        );
        self.builder.seal_block(ok_block);
        self.builder.switch_to_block(ok_block);
        result
    }

    fn iconst(&mut self, value: i64) -> Value {
        self.builder.ins().iconst(types::I64, value)
    }

    /// Spill call arguments into the scratch area.
    fn spill_args(&mut self, args: &[Register]) {
        let base = self.builder.use_var(self.scratch_var);
        for (i, reg) in args.iter().enumerate() {
            let value = self.read_reg(*reg);
            self.builder
                .ins()
                .store(MemFlags::trusted(), value, base, (i as i32) * 8);
        }
    }

    /// Truthiness: fast paths for `true`/`false`, helper otherwise.
    fn to_boolean_flag(&mut self, value: Value) -> Value {
        let flag_block = self.builder.create_block();
        self.builder.append_block_param(flag_block, types::I8);

        let is_true = self
            .builder
            .ins()
            .icmp_imm(IntCC::Equal, value, type_guards::TAG_TRUE);
        let not_true = self.builder.create_block();
        let one = self.builder.ins().iconst(types::I8, 1);
        self.builder
            .ins()
            .brif(is_true, flag_block, &[BlockArg::Value(one)], not_true, &[]);

        self.builder.seal_block(not_true);
        self.builder.switch_to_block(not_true);
        let is_false = self
            .builder
            .ins()
            .icmp_imm(IntCC::Equal, value, type_guards::TAG_FALSE);
        let slow = self.builder.create_block();
        let zero = self.builder.ins().iconst(types::I8, 0);
        self.builder
            .ins()
            .brif(is_false, flag_block, &[BlockArg::Value(zero)], slow, &[]);

        self.builder.seal_block(slow);
        self.builder.switch_to_block(slow);
        let z = self.iconst(0);
        let truthy = self.call_helper(HelperKind::ToBoolean, value, z, z);
        let flag = self.builder.ins().ireduce(types::I8, truthy);
        self.builder
            .ins()
            .jump(flag_block, &[BlockArg::Value(flag)]);

        self.builder.seal_block(flag_block);
        self.builder.switch_to_block(flag_block);
        self.builder.block_params(flag_block)[0]
    }

    fn jump_target(&self, pc: usize, offset: i32) -> Result<Block, JitError> {
        let count = self.function.instructions.len();
        let target = pc as i64 + offset as i64;
        if target == count as i64 {
            return Ok(self.end_block);
        }
        if !(0..count as i64).contains(&target) {
            return Err(JitError::InvalidJumpTarget {
                pc,
                offset,
                instruction_count: count,
            });
        }
        Ok(self.blocks[target as usize])
    }

    /// Inline `int32 (+|-|*) int32` with an overflow check, falling back to
    /// the generic helper for everything else.
    fn arith_template(
        &mut self,
        dst: Register,
        lhs: Register,
        rhs: Register,
        ic: u16,
        helper: HelperKind,
        emit_fast: impl Fn(&mut FunctionBuilder, Value, Value) -> Value,
    ) {
        let l = self.read_reg(lhs);
        let r = self.read_reg(rhs);

        let merge = self.builder.create_block();
        self.builder.append_block_param(merge, types::I64);
        let slow = self.builder.create_block();
        let fast = self.builder.create_block();

        let both = type_guards::emit_both_int32(self.builder, l, r);
        self.builder.ins().brif(both, fast, &[], slow, &[]);

        self.builder.seal_block(fast);
        self.builder.switch_to_block(fast);
        let li = type_guards::emit_unbox_int32(self.builder, l);
        let ri = type_guards::emit_unbox_int32(self.builder, r);
        let raw = emit_fast(self.builder, li, ri);
        // Overflow check: the 64-bit result must fit back into int32.
        let narrowed = self.builder.ins().ireduce(types::I32, raw);
        let widened = self.builder.ins().sextend(types::I64, narrowed);
        let fits = self.builder.ins().icmp(IntCC::Equal, raw, widened);
        let boxed_block = self.builder.create_block();
        self.builder.ins().brif(fits, boxed_block, &[], slow, &[]);
        self.builder.seal_block(boxed_block);
        self.builder.switch_to_block(boxed_block);
        let boxed = type_guards::emit_box_int32(self.builder, raw);
        self.builder
            .ins()
            .jump(merge, &[BlockArg::Value(boxed)]);

        self.builder.seal_block(slow);
        self.builder.switch_to_block(slow);
        let ic_val = self.iconst(ic as i64);
        let result = self.call_helper(helper, l, r, ic_val);
        self.builder
            .ins()
            .jump(merge, &[BlockArg::Value(result)]);

        self.builder.seal_block(merge);
        self.builder.switch_to_block(merge);
        let merged = self.builder.block_params(merge)[0];
        self.write_reg(dst, merged);
    }

    /// Inline int32 comparison, helper fallback.
    fn compare_template(
        &mut self,
        dst: Register,
        lhs: Register,
        rhs: Register,
        ic: u16,
        helper: HelperKind,
        cc: IntCC,
    ) {
        let l = self.read_reg(lhs);
        let r = self.read_reg(rhs);

        let merge = self.builder.create_block();
        self.builder.append_block_param(merge, types::I64);
        let slow = self.builder.create_block();
        let fast = self.builder.create_block();

        let both = type_guards::emit_both_int32(self.builder, l, r);
        self.builder.ins().brif(both, fast, &[], slow, &[]);

        self.builder.seal_block(fast);
        self.builder.switch_to_block(fast);
        let li = type_guards::emit_unbox_int32(self.builder, l);
        let ri = type_guards::emit_unbox_int32(self.builder, r);
        let flag = self.builder.ins().icmp(cc, li, ri);
        let t = self.iconst(type_guards::TAG_TRUE);
        let f = self.iconst(type_guards::TAG_FALSE);
        let boxed = self.builder.ins().select(flag, t, f);
        self.builder
            .ins()
            .jump(merge, &[BlockArg::Value(boxed)]);

        self.builder.seal_block(slow);
        self.builder.switch_to_block(slow);
        let ic_val = self.iconst(ic as i64);
        let result = self.call_helper(helper, l, r, ic_val);
        self.builder
            .ins()
            .jump(merge, &[BlockArg::Value(result)]);

        self.builder.seal_block(merge);
        self.builder.switch_to_block(merge);
        let merged = self.builder.block_params(merge)[0];
        self.write_reg(dst, merged);
    }

    /// Emit one instruction; returns true when control falls through.
    fn emit_instruction(&mut self, pc: usize, instruction: &Instruction) -> Result<bool, JitError> {
        match instruction {
            Instruction::LoadUndefined { dst } => {
                let v = self.iconst(type_guards::TAG_UNDEFINED);
                self.write_reg(*dst, v);
            }
            Instruction::LoadNull { dst } => {
                let v = self.iconst(type_guards::TAG_UNDEFINED + 1);
                self.write_reg(*dst, v);
            }
            Instruction::LoadTrue { dst } => {
                let v = self.iconst(type_guards::TAG_TRUE);
                self.write_reg(*dst, v);
            }
            Instruction::LoadFalse { dst } => {
                let v = self.iconst(type_guards::TAG_FALSE);
                self.write_reg(*dst, v);
            }
            Instruction::LoadHole { dst } => {
                let v = self.iconst(type_guards::TAG_UNDEFINED + 4);
                self.write_reg(*dst, v);
            }
            Instruction::LoadInt8 { dst, value } => {
                let v = self.iconst(type_guards::TAG_INT32 | (*value as i32 as u32 as i64));
                self.write_reg(*dst, v);
            }
            Instruction::LoadInt32 { dst, value } => {
                let v = self.iconst(type_guards::TAG_INT32 | (*value as u32 as i64));
                self.write_reg(*dst, v);
            }
            Instruction::LoadConst { dst, idx } => {
                let idx_val = self.iconst(idx.index() as i64);
                let z = self.iconst(0);
                let v = self.call_helper(HelperKind::LoadConst, idx_val, z, z);
                self.write_reg(*dst, v);
            }

            Instruction::GetLocal { dst, idx } => {
                if self.locals_via_helper {
                    let idx_val = self.iconst(idx.index() as i64);
                    let z = self.iconst(0);
                    let v = self.call_helper(HelperKind::GetLocalCell, idx_val, z, z);
                    self.write_reg(*dst, v);
                } else {
                    let v = self.read_local(idx.index());
                    self.write_reg(*dst, v);
                }
            }
            Instruction::SetLocal { idx, src } => {
                let value = self.read_reg(*src);
                if self.locals_via_helper {
                    let idx_val = self.iconst(idx.index() as i64);
                    let z = self.iconst(0);
                    self.call_helper(HelperKind::SetLocalCell, idx_val, value, z);
                } else {
                    self.write_local(idx.index(), value);
                }
            }
            Instruction::GetUpvalue { dst, idx } => {
                let idx_val = self.iconst(idx.index() as i64);
                let z = self.iconst(0);
                let v = self.call_helper(HelperKind::GetUpvalue, idx_val, z, z);
                self.write_reg(*dst, v);
            }
            Instruction::SetUpvalue { idx, src } => {
                let value = self.read_reg(*src);
                let idx_val = self.iconst(idx.index() as i64);
                let z = self.iconst(0);
                self.call_helper(HelperKind::SetUpvalue, idx_val, value, z);
            }
            Instruction::GetGlobal { dst, name, ic } => {
                let name_val = self.iconst(name.index() as i64);
                let ic_val = self.iconst(ic.index() as i64);
                let z = self.iconst(0);
                let v = self.call_helper(HelperKind::GetGlobal, name_val, ic_val, z);
                self.write_reg(*dst, v);
            }
            Instruction::SetGlobal { name, src, ic } => {
                let value = self.read_reg(*src);
                let name_val = self.iconst(name.index() as i64);
                let ic_val = self.iconst(ic.index() as i64);
                self.call_helper(HelperKind::SetGlobal, name_val, value, ic_val);
            }
            Instruction::LoadThis { dst } => {
                let ctx = self.ctx();
                let v = self.load_ctx_field(ctx, offset_of!(JitContext, this_value));
                self.write_reg(*dst, v);
            }
            Instruction::NewTarget { dst } => {
                let ctx = self.ctx();
                let v = self.load_ctx_field(ctx, offset_of!(JitContext, new_target));
                self.write_reg(*dst, v);
            }
            Instruction::CheckTdz { idx, name } => {
                let idx_val = self.iconst(idx.index() as i64);
                let name_val = self.iconst(name.index() as i64);
                let z = self.iconst(0);
                self.call_helper(HelperKind::CheckTdz, idx_val, name_val, z);
            }
            Instruction::CloseUpvalue { idx } => {
                let idx_val = self.iconst(idx.index() as i64);
                let z = self.iconst(0);
                self.call_helper(HelperKind::CloseUpvalue, idx_val, z, z);
            }
            Instruction::PushContext => {
                // Context watermarks only matter to the interpreter's
                // unwinder; compiled frames have no handlers.
            }
            Instruction::PopContext { first_local } => {
                let idx_val = self.iconst(first_local.index() as i64);
                let z = self.iconst(0);
                self.call_helper(HelperKind::PopContext, idx_val, z, z);
            }

            Instruction::Add { dst, lhs, rhs, ic } => {
                self.arith_template(*dst, *lhs, *rhs, ic.index(), HelperKind::GenericAdd, |b, l, r| {
                    b.ins().iadd(l, r)
                });
            }
            Instruction::Sub { dst, lhs, rhs, ic } => {
                self.arith_template(*dst, *lhs, *rhs, ic.index(), HelperKind::GenericSub, |b, l, r| {
                    b.ins().isub(l, r)
                });
            }
            Instruction::Mul { dst, lhs, rhs, ic } => {
                self.arith_template(*dst, *lhs, *rhs, ic.index(), HelperKind::GenericMul, |b, l, r| {
                    b.ins().imul(l, r)
                });
            }
            Instruction::Div { dst, lhs, rhs, ic } => {
                let l = self.read_reg(*lhs);
                let r = self.read_reg(*rhs);
                let ic_val = self.iconst(ic.index() as i64);
                let v = self.call_helper(HelperKind::GenericDiv, l, r, ic_val);
                self.write_reg(*dst, v);
            }
            Instruction::Mod { dst, lhs, rhs, ic } => {
                let l = self.read_reg(*lhs);
                let r = self.read_reg(*rhs);
                let ic_val = self.iconst(ic.index() as i64);
                let v = self.call_helper(HelperKind::GenericMod, l, r, ic_val);
                self.write_reg(*dst, v);
            }
            Instruction::Pow { dst, lhs, rhs, ic } => {
                let l = self.read_reg(*lhs);
                let r = self.read_reg(*rhs);
                let ic_val = self.iconst(ic.index() as i64);
                let v = self.call_helper(HelperKind::GenericPow, l, r, ic_val);
                self.write_reg(*dst, v);
            }
            Instruction::Neg { dst, src } => {
                let s = self.read_reg(*src);
                let z = self.iconst(0);
                let v = self.call_helper(HelperKind::GenericNeg, s, z, z);
                self.write_reg(*dst, v);
            }
            Instruction::Inc { dst, src } => {
                let s = self.read_reg(*src);
                let z = self.iconst(0);
                let v = self.call_helper(HelperKind::GenericInc, s, z, z);
                self.write_reg(*dst, v);
            }
            Instruction::Dec { dst, src } => {
                let s = self.read_reg(*src);
                let z = self.iconst(0);
                let v = self.call_helper(HelperKind::GenericDec, s, z, z);
                self.write_reg(*dst, v);
            }

            Instruction::BitAnd { dst, lhs, rhs } => self.bit_op(*dst, *lhs, *rhs, 0),
            Instruction::BitOr { dst, lhs, rhs } => self.bit_op(*dst, *lhs, *rhs, 1),
            Instruction::BitXor { dst, lhs, rhs } => self.bit_op(*dst, *lhs, *rhs, 2),
            Instruction::Shl { dst, lhs, rhs } => self.bit_op(*dst, *lhs, *rhs, 3),
            Instruction::Shr { dst, lhs, rhs } => self.bit_op(*dst, *lhs, *rhs, 4),
            Instruction::Ushr { dst, lhs, rhs } => self.bit_op(*dst, *lhs, *rhs, 5),
            Instruction::BitNot { dst, src } => {
                let s = self.read_reg(*src);
                let z = self.iconst(0);
                let v = self.call_helper(HelperKind::BitNot, s, z, z);
                self.write_reg(*dst, v);
            }

            Instruction::Eq { dst, lhs, rhs, ic } => {
                let l = self.read_reg(*lhs);
                let r = self.read_reg(*rhs);
                let ic_val = self.iconst(ic.index() as i64);
                let v = self.call_helper(HelperKind::Eq, l, r, ic_val);
                self.write_reg(*dst, v);
            }
            Instruction::Ne { dst, lhs, rhs, ic } => {
                let l = self.read_reg(*lhs);
                let r = self.read_reg(*rhs);
                let ic_val = self.iconst(ic.index() as i64);
                let v = self.call_helper(HelperKind::Eq, l, r, ic_val);
                let t = self.iconst(type_guards::TAG_TRUE);
                let f = self.iconst(type_guards::TAG_FALSE);
                let was_true = self.builder.ins().icmp(IntCC::Equal, v, t);
                let negated = self.builder.ins().select(was_true, f, t);
                self.write_reg(*dst, negated);
            }
            Instruction::StrictEq { dst, lhs, rhs, ic } => {
                let l = self.read_reg(*lhs);
                let r = self.read_reg(*rhs);
                let ic_val = self.iconst(ic.index() as i64);
                let v = self.call_helper(HelperKind::StrictEq, l, r, ic_val);
                self.write_reg(*dst, v);
            }
            Instruction::StrictNe { dst, lhs, rhs, ic } => {
                let l = self.read_reg(*lhs);
                let r = self.read_reg(*rhs);
                let ic_val = self.iconst(ic.index() as i64);
                let v = self.call_helper(HelperKind::StrictEq, l, r, ic_val);
                let t = self.iconst(type_guards::TAG_TRUE);
                let f = self.iconst(type_guards::TAG_FALSE);
                let was_true = self.builder.ins().icmp(IntCC::Equal, v, t);
                let negated = self.builder.ins().select(was_true, f, t);
                self.write_reg(*dst, negated);
            }
            Instruction::Lt { dst, lhs, rhs, ic } => {
                self.compare_template(*dst, *lhs, *rhs, ic.index(), HelperKind::Lt, IntCC::SignedLessThan);
            }
            Instruction::Le { dst, lhs, rhs, ic } => {
                self.compare_template(
                    *dst,
                    *lhs,
                    *rhs,
                    ic.index(),
                    HelperKind::Le,
                    IntCC::SignedLessThanOrEqual,
                );
            }
            Instruction::Gt { dst, lhs, rhs, ic } => {
                self.compare_template(
                    *dst,
                    *lhs,
                    *rhs,
                    ic.index(),
                    HelperKind::Gt,
                    IntCC::SignedGreaterThan,
                );
            }
            Instruction::Ge { dst, lhs, rhs, ic } => {
                self.compare_template(
                    *dst,
                    *lhs,
                    *rhs,
                    ic.index(),
                    HelperKind::Ge,
                    IntCC::SignedGreaterThanOrEqual,
                );
            }

            Instruction::Not { dst, src } => {
                let s = self.read_reg(*src);
                let z = self.iconst(0);
                let v = self.call_helper(HelperKind::Not, s, z, z);
                self.write_reg(*dst, v);
            }
            Instruction::TypeOf { dst, src } => {
                let s = self.read_reg(*src);
                let z = self.iconst(0);
                let v = self.call_helper(HelperKind::TypeOf, s, z, z);
                self.write_reg(*dst, v);
            }
            Instruction::InstanceOf { dst, lhs, rhs } => {
                let l = self.read_reg(*lhs);
                let r = self.read_reg(*rhs);
                let z = self.iconst(0);
                let v = self.call_helper(HelperKind::InstanceOf, l, r, z);
                self.write_reg(*dst, v);
            }
            Instruction::In { dst, lhs, rhs } => {
                let l = self.read_reg(*lhs);
                let r = self.read_reg(*rhs);
                let z = self.iconst(0);
                let v = self.call_helper(HelperKind::In, l, r, z);
                self.write_reg(*dst, v);
            }

            Instruction::GetProp { dst, obj, name, ic } => {
                let o = self.read_reg(*obj);
                let name_val = self.iconst(name.index() as i64);
                let ic_val = self.iconst(ic.index() as i64);
                let v = self.call_helper(HelperKind::GetProp, o, name_val, ic_val);
                self.write_reg(*dst, v);
            }
            Instruction::SetProp { obj, name, src, ic } => {
                let o = self.read_reg(*obj);
                let value = self.read_reg(*src);
                let packed =
                    self.iconst(((name.index() as i64) << 16) | ic.index() as i64);
                self.call_helper(HelperKind::SetProp, o, packed, value);
            }
            Instruction::GetElem { dst, obj, key, ic: _ } => {
                let o = self.read_reg(*obj);
                let k = self.read_reg(*key);
                let z = self.iconst(0);
                let v = self.call_helper(HelperKind::GetElem, o, k, z);
                self.write_reg(*dst, v);
            }
            Instruction::SetElem { obj, key, src, ic: _ } => {
                let o = self.read_reg(*obj);
                let k = self.read_reg(*key);
                let value = self.read_reg(*src);
                self.call_helper(HelperKind::SetElem, o, k, value);
            }
            Instruction::DeleteProp { dst, obj, key } => {
                let o = self.read_reg(*obj);
                let k = self.read_reg(*key);
                let z = self.iconst(0);
                let v = self.call_helper(HelperKind::DeleteProp, o, k, z);
                self.write_reg(*dst, v);
            }
            Instruction::NewObject { dst } => {
                let minus_one = self.iconst(-1);
                let z = self.iconst(0);
                let v = self.call_helper(HelperKind::NewObject, minus_one, z, z);
                self.write_reg(*dst, v);
            }
            Instruction::NewObjectSeeded { dst, seed } => {
                let seed_val = self.iconst(seed.index() as i64);
                let z = self.iconst(0);
                let v = self.call_helper(HelperKind::NewObject, seed_val, z, z);
                self.write_reg(*dst, v);
            }
            Instruction::DefineDataProp { obj, name, src } => {
                let o = self.read_reg(*obj);
                let name_val = self.iconst(name.index() as i64);
                let value = self.read_reg(*src);
                self.call_helper(HelperKind::DefineDataProp, o, name_val, value);
            }
            Instruction::NewArray { dst, capacity } => {
                let cap = self.iconst(*capacity as i64);
                let z = self.iconst(0);
                let v = self.call_helper(HelperKind::NewArray, cap, z, z);
                self.write_reg(*dst, v);
            }

            Instruction::Closure { dst, func } => {
                let idx_val = self.iconst(func.index() as i64);
                let z = self.iconst(0);
                let v = self.call_helper(HelperKind::Closure, idx_val, z, z);
                self.write_reg(*dst, v);
            }
            Instruction::Call { dst, callee, args, ic } => {
                self.spill_args(args);
                let callee_val = self.read_reg(*callee);
                let argc = self.iconst(args.len() as i64);
                let ic_val = self.iconst(ic.index() as i64);
                let v = self.call_helper(HelperKind::Call, callee_val, argc, ic_val);
                self.write_reg(*dst, v);
            }
            Instruction::CallMethod {
                dst,
                obj,
                name,
                args,
                ic,
            } => {
                self.spill_args(args);
                let o = self.read_reg(*obj);
                let packed =
                    self.iconst(((name.index() as i64) << 16) | ic.index() as i64);
                let argc = self.iconst(args.len() as i64);
                let v = self.call_helper(HelperKind::CallMethod, o, packed, argc);
                self.write_reg(*dst, v);
            }
            Instruction::Construct {
                dst,
                callee,
                args,
                ic,
            } => {
                self.spill_args(args);
                let callee_val = self.read_reg(*callee);
                let argc = self.iconst(args.len() as i64);
                let ic_val = self.iconst(ic.index() as i64);
                let v = self.call_helper(HelperKind::Construct, callee_val, argc, ic_val);
                self.write_reg(*dst, v);
            }
            Instruction::Return { src } => {
                let v = self.read_reg(*src);
                self.builder.ins().return_(&[v]);
                return Ok(false);
            }
            Instruction::ReturnUndefined => {
                let v = self.iconst(type_guards::TAG_UNDEFINED);
                self.builder.ins().return_(&[v]);
                return Ok(false);
            }

            Instruction::Jump { offset } => {
                let target = self.jump_target(pc, offset.offset())?;
                self.builder.ins().jump(target, &[]);
                return Ok(false);
            }
            Instruction::JumpIfTrue { cond, offset } => {
                let value = self.read_reg(*cond);
                let flag = self.to_boolean_flag(value);
                let target = self.jump_target(pc, offset.offset())?;
                let fallthrough = self.jump_target(pc, 1)?;
                self.builder.ins().brif(flag, target, &[], fallthrough, &[]);
                return Ok(false);
            }
            Instruction::JumpIfFalse { cond, offset } => {
                let value = self.read_reg(*cond);
                let flag = self.to_boolean_flag(value);
                let target = self.jump_target(pc, offset.offset())?;
                let fallthrough = self.jump_target(pc, 1)?;
                self.builder.ins().brif(flag, fallthrough, &[], target, &[]);
                return Ok(false);
            }
            Instruction::JumpIfNullish { cond, offset } => {
                let value = self.read_reg(*cond);
                let is_undef = self.builder.ins().icmp_imm(
                    IntCC::Equal,
                    value,
                    type_guards::TAG_UNDEFINED,
                );
                let is_null = self.builder.ins().icmp_imm(
                    IntCC::Equal,
                    value,
                    type_guards::TAG_UNDEFINED + 1,
                );
                let nullish = self.builder.ins().bor(is_undef, is_null);
                let target = self.jump_target(pc, offset.offset())?;
                let fallthrough = self.jump_target(pc, 1)?;
                self.builder.ins().brif(nullish, target, &[], fallthrough, &[]);
                return Ok(false);
            }

            Instruction::Throw { src } => {
                let value = self.read_reg(*src);
                let z = self.iconst(0);
                let sentinel = self.call_helper(HelperKind::ThrowValue, value, z, z);
                // ThrowValue always returns the throw sentinel; the check in
                // call_helper already routed it, but keep the return for
                // completeness when a helper is stubbed in tests.
                self.builder.ins().return_(&[sentinel]);
                return Ok(false);
            }

            Instruction::GetIterator { dst, src } => {
                let s = self.read_reg(*src);
                let z = self.iconst(0);
                let v = self.call_helper(HelperKind::GetIterator, s, z, z);
                self.write_reg(*dst, v);
            }
            Instruction::IteratorNext { dst, done, iter } => {
                let it = self.read_reg(*iter);
                let done_idx = self.iconst(done.index() as i64);
                let z = self.iconst(0);
                let v = self.call_helper(HelperKind::IteratorNext, it, done_idx, z);
                self.write_reg(*dst, v);
            }

            Instruction::Move { dst, src } => {
                let v = self.read_reg(*src);
                self.write_reg(*dst, v);
            }
            Instruction::Nop => {}

            Instruction::TryStart { .. }
            | Instruction::TryEnd
            | Instruction::Catch { .. }
            | Instruction::Await { .. }
            | Instruction::Yield { .. } => {
                unreachable!("rejected before translation")
            }
        }
        Ok(true)
    }

    fn bit_op(&mut self, dst: Register, lhs: Register, rhs: Register, op: i64) {
        let l = self.read_reg(lhs);
        let r = self.read_reg(rhs);
        let op_val = self.iconst(op);
        let v = self.call_helper(HelperKind::BitOp, l, r, op_val);
        self.write_reg(dst, v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marten_bytecode::{FeedbackIndex, JumpOffset};

    extern "C" fn stub(_ctx: *mut JitContext, _a: i64, _b: i64, _c: i64) -> i64 {
        0
    }

    fn stub_helpers() -> RuntimeHelpers {
        let mut helpers = RuntimeHelpers::new();
        for &kind in HelperKind::ALL {
            helpers.set(kind, stub);
        }
        helpers
    }

    fn run_entry(artifact: &CodeArtifact, register_count: usize) -> i64 {
        let mut locals = vec![type_guards::TAG_UNDEFINED; 4];
        let mut registers = vec![type_guards::TAG_UNDEFINED; register_count.max(1)];
        let mut scratch = vec![0i64; 8];
        let mut ctx = JitContext {
            engine: std::ptr::null_mut(),
            vm: std::ptr::null_mut(),
            module: std::ptr::null(),
            function: std::ptr::null(),
            locals: locals.as_mut_ptr(),
            registers: registers.as_mut_ptr(),
            scratch: scratch.as_mut_ptr(),
            this_value: type_guards::TAG_UNDEFINED,
            new_target: type_guards::TAG_UNDEFINED,
            proto_epoch: 1,
            deopt_index: 0,
            osr_pc: 0,
            local_count: locals.len() as u32,
            register_count: registers.len() as u32,
            scratch_len: scratch.len() as u32,
            _pad: 0,
        };
        (artifact.entry())(&mut ctx)
    }

    #[test]
    fn compiles_and_runs_smi_arithmetic() {
        // r2 = 20 + 22 on the inline int32 fast path; no helper fires.
        let function = Function::builder()
            .register_count(3)
            .feedback_len(1)
            .instruction(Instruction::LoadInt8 {
                dst: Register(0),
                value: 20,
            })
            .instruction(Instruction::LoadInt8 {
                dst: Register(1),
                value: 22,
            })
            .instruction(Instruction::Add {
                dst: Register(2),
                lhs: Register(0),
                rhs: Register(1),
                ic: FeedbackIndex(0),
            })
            .instruction(Instruction::Return { src: Register(2) })
            .build();
        let artifact = compile(&function, &stub_helpers()).unwrap();
        assert_eq!(artifact.tier(), Tier::Baseline);
        let result = run_entry(&artifact, 3);
        assert_eq!(result, type_guards::TAG_INT32 | 42);
    }

    #[test]
    fn compiles_loops_with_backward_jumps_and_records_osr_entries() {
        // r0 = 0; loop: r0 = r0 + 1; if (r0 < 10) goto loop; return r0
        let function = Function::builder()
            .register_count(4)
            .feedback_len(2)
            .instruction(Instruction::LoadInt8 {
                dst: Register(0),
                value: 0,
            })
            .instruction(Instruction::LoadInt8 {
                dst: Register(1),
                value: 1,
            })
            .instruction(Instruction::Add {
                dst: Register(0),
                lhs: Register(0),
                rhs: Register(1),
                ic: FeedbackIndex(0),
            })
            .instruction(Instruction::LoadInt8 {
                dst: Register(2),
                value: 10,
            })
            .instruction(Instruction::Lt {
                dst: Register(3),
                lhs: Register(0),
                rhs: Register(2),
                ic: FeedbackIndex(1),
            })
            .instruction(Instruction::JumpIfTrue {
                cond: Register(3),
                offset: JumpOffset(-4),
            })
            .instruction(Instruction::Return { src: Register(0) })
            .build();
        let artifact = compile(&function, &stub_helpers()).unwrap();
        assert_eq!(artifact.osr_entries, vec![1]);
        let result = run_entry(&artifact, 4);
        assert_eq!(result, type_guards::TAG_INT32 | 10);
    }

    #[test]
    fn rejects_exception_handlers_and_suspension() {
        let try_fn = Function::builder()
            .register_count(1)
            .instruction(Instruction::TryStart {
                catch_offset: JumpOffset(2),
            })
            .instruction(Instruction::ReturnUndefined)
            .build();
        assert!(matches!(
            compile(&try_fn, &stub_helpers()),
            Err(JitError::UnsupportedInstruction { .. })
        ));

        let await_fn = Function::builder()
            .register_count(2)
            .instruction(Instruction::Await {
                dst: Register(0),
                src: Register(1),
            })
            .build();
        assert!(matches!(
            compile(&await_fn, &stub_helpers()),
            Err(JitError::UnsupportedInstruction { .. })
        ));
    }

    #[test]
    fn conditional_truthiness_uses_boolean_fast_paths() {
        // r0 = true; if (r0) return 1; return 2; no ToBoolean helper hit
        // because the stub returns 0 (falsy), which would flip the result.
        let function = Function::builder()
            .register_count(2)
            .instruction(Instruction::LoadTrue { dst: Register(0) })
            .instruction(Instruction::JumpIfTrue {
                cond: Register(0),
                offset: JumpOffset(3),
            })
            .instruction(Instruction::LoadInt8 {
                dst: Register(1),
                value: 2,
            })
            .instruction(Instruction::Return { src: Register(1) })
            .instruction(Instruction::LoadInt8 {
                dst: Register(1),
                value: 1,
            })
            .instruction(Instruction::Return { src: Register(1) })
            .build();
        let artifact = compile(&function, &stub_helpers()).unwrap();
        let result = run_entry(&artifact, 2);
        assert_eq!(result, type_guards::TAG_INT32 | 1);
    }

    #[test]
    fn osr_enters_at_the_requested_loop_head() {
        // Same loop as above; enter at pc 1 with r0 = 7 pre-seeded.
        let function = Function::builder()
            .register_count(4)
            .feedback_len(2)
            .instruction(Instruction::LoadInt8 {
                dst: Register(0),
                value: 0,
            })
            .instruction(Instruction::LoadInt8 {
                dst: Register(1),
                value: 1,
            })
            .instruction(Instruction::Add {
                dst: Register(0),
                lhs: Register(0),
                rhs: Register(1),
                ic: FeedbackIndex(0),
            })
            .instruction(Instruction::LoadInt8 {
                dst: Register(2),
                value: 10,
            })
            .instruction(Instruction::Lt {
                dst: Register(3),
                lhs: Register(0),
                rhs: Register(2),
                ic: FeedbackIndex(1),
            })
            .instruction(Instruction::JumpIfTrue {
                cond: Register(3),
                offset: JumpOffset(-4),
            })
            .instruction(Instruction::Return { src: Register(0) })
            .build();
        let artifact = compile(&function, &stub_helpers()).unwrap();

        let mut locals = vec![type_guards::TAG_UNDEFINED; 1];
        let mut registers = vec![type_guards::TAG_UNDEFINED; 4];
        registers[0] = type_guards::TAG_INT32 | 7;
        let mut scratch = vec![0i64; 8];
        let mut ctx = JitContext {
            engine: std::ptr::null_mut(),
            vm: std::ptr::null_mut(),
            module: std::ptr::null(),
            function: std::ptr::null(),
            locals: locals.as_mut_ptr(),
            registers: registers.as_mut_ptr(),
            scratch: scratch.as_mut_ptr(),
            this_value: type_guards::TAG_UNDEFINED,
            new_target: type_guards::TAG_UNDEFINED,
            proto_epoch: 1,
            deopt_index: 0,
            osr_pc: 1,
            local_count: 1,
            register_count: 4,
            scratch_len: 8,
            _pad: 0,
        };
        let result = (artifact.entry())(&mut ctx);
        assert_eq!(result, type_guards::TAG_INT32 | 10);
    }
}
