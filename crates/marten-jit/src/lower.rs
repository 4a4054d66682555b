//! IR → Cranelift lowering for the optimizing tier.
//!
//! Guards compile to a dense on-success path plus an out-of-line deopt exit
//! per guard: the exit spills the frame state into the caller-supplied
//! arrays, records the deopt-table index in the context, and returns the
//! deopt sentinel. Helper calls spill the frame state first so a reentrant
//! collection sees every live value through the rooted frame arrays.
//! Register allocation happens inside Cranelift after this lowering.

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::instructions::BlockArg;
use cranelift_codegen::ir::{Block, FuncRef, InstBuilder, MemFlags, UserFuncName, Value, types};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext, Variable};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module};
use rustc_hash::FxHashMap;
use std::mem::offset_of;

use marten_bytecode::Function;

use crate::bailout::DEOPT_SENTINEL;
use crate::code::CodeArtifact;
use crate::deopt::{DeoptPoint, DeoptTable, SlotLocation};
use crate::error::JitError;
use crate::helpers::{HelperKind, JitContext, RuntimeHelpers, entry_signature, helper_signature};
use crate::ir::{FrameState, IrFunction, IrOp, NodeId, Terminator};
use crate::ir_builder::BuildOutput;
use crate::tiering::Tier;
use crate::type_guards;

/// Lower optimized IR into a code artifact.
pub fn lower(
    function: &Function,
    build: BuildOutput,
    helpers: &RuntimeHelpers,
) -> Result<CodeArtifact, JitError> {
    let BuildOutput { ir, assumptions } = build;

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
    let name = format!("mopt_{}", function.display_name().replace(['<', '>'], "_"));
    let func_id = module.declare_function(&name, Linkage::Local, &entry_sig)?;

    let mut codegen_ctx = module.make_context();
    codegen_ctx.func = cranelift_codegen::ir::Function::with_name_signature(
        UserFuncName::user(0, func_id.as_u32()),
        entry_sig,
    );

    let mut deopt_table = DeoptTable {
        points: Vec::new(),
        materializations: ir.materializations.clone(),
    };
    {
        let mut fb_ctx = FunctionBuilderContext::new();
        let mut builder = FunctionBuilder::new(&mut codegen_ctx.func, &mut fb_ctx);
        let mut lowering = Lowering::new(&mut builder, &mut module, &helper_ids, &ir, &mut deopt_table);
        lowering.run()?;
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
    let mut artifact = CodeArtifact::new(Tier::Optimized, entry, module);
    artifact.source_positions = deopt_table
        .points
        .iter()
        .enumerate()
        .map(|(i, p)| (i as u32, p.bytecode_pc))
        .collect();
    artifact.deopt = deopt_table;
    artifact.assumptions = assumptions;
    #[cfg(feature = "jit_logging")]
    tracing::debug!(
        function = function.display_name(),
        deopt_points = artifact.deopt.points.len(),
        assumptions = artifact.assumptions.len(),
        "optimizing compile finished"
    );
    Ok(artifact)
}

struct Lowering<'a, 'b> {
    builder: &'a mut FunctionBuilder<'b>,
    module: &'a mut JITModule,
    helper_ids: &'a FxHashMap<HelperKind, cranelift_module::FuncId>,
    helper_refs: FxHashMap<HelperKind, FuncRef>,
    ir: &'a IrFunction,
    deopt_table: &'a mut DeoptTable,
    blocks: Vec<Block>,
    values: Vec<Option<Value>>,
    propagate: Block,
    ctx_var: Variable,
    registers_var: Variable,
    locals_var: Variable,
    scratch_var: Variable,
    /// Scratch slots claimed by materialization descriptors.
    scratch_cursor: u32,
}

impl<'a, 'b> Lowering<'a, 'b> {
    fn new(
        builder: &'a mut FunctionBuilder<'b>,
        module: &'a mut JITModule,
        helper_ids: &'a FxHashMap<HelperKind, cranelift_module::FuncId>,
        ir: &'a IrFunction,
        deopt_table: &'a mut DeoptTable,
    ) -> Self {
        let propagate = builder.create_block();
        let values = vec![None; ir.nodes.len()];
        Self {
            builder,
            module,
            helper_ids,
            helper_refs: FxHashMap::default(),
            ir,
            deopt_table,
            blocks: Vec::new(),
            values,
            propagate,
            ctx_var: Variable::from_u32(0),
            registers_var: Variable::from_u32(1),
            locals_var: Variable::from_u32(2),
            scratch_var: Variable::from_u32(3),
            scratch_cursor: 0,
        }
    }

    fn run(&mut self) -> Result<(), JitError> {
        for block in &self.ir.blocks {
            let cl_block = self.builder.create_block();
            for _ in 0..block.param_count {
                self.builder.append_block_param(cl_block, types::I64);
            }
            self.blocks.push(cl_block);
        }
        self.builder.append_block_param(self.propagate, types::I64);

        // Entry prologue: stash the context and frame pointers.
        let entry = self.builder.create_block();
        self.builder.append_block_params_for_function_params(entry);
        self.builder.switch_to_block(entry);
        self.ctx_var = self.builder.declare_var(types::I64);
        self.registers_var = self.builder.declare_var(types::I64);
        self.locals_var = self.builder.declare_var(types::I64);
        self.scratch_var = self.builder.declare_var(types::I64);
        let ctx = self.builder.block_params(entry)[0];
        self.builder.def_var(self.ctx_var, ctx);
        let registers = self.load_ctx(ctx, offset_of!(JitContext, registers));
        self.builder.def_var(self.registers_var, registers);
        let locals = self.load_ctx(ctx, offset_of!(JitContext, locals));
        self.builder.def_var(self.locals_var, locals);
        let scratch = self.load_ctx(ctx, offset_of!(JitContext, scratch));
        self.builder.def_var(self.scratch_var, scratch);
        self.builder.ins().jump(self.blocks[0], &[]);

        // Propagate: return the carried sentinel.
        self.builder.switch_to_block(self.propagate);
        let carried = self.builder.block_params(self.propagate)[0];
        self.builder.ins().return_(&[carried]);

        for block_idx in 0..self.ir.blocks.len() {
            self.lower_block(block_idx)?;
        }
        self.builder.seal_all_blocks();
        Ok(())
    }

    fn lower_block(&mut self, block_idx: usize) -> Result<(), JitError> {
        let cl_block = self.blocks[block_idx];
        self.builder.switch_to_block(cl_block);
        let block = &self.ir.blocks[block_idx];

        // Bind block params.
        let params: Vec<Value> = self.builder.block_params(cl_block).to_vec();
        let mut param_cursor = 0;
        for &id in &block.nodes {
            if let IrOp::BlockParam(_) = self.ir.node(id).op {
                self.values[id.0 as usize] = Some(params[param_cursor]);
                param_cursor += 1;
            }
        }

        for &id in &block.nodes {
            self.lower_node(id)?;
        }

        match block.terminator.as_ref().expect("terminated block") {
            Terminator::Jump { target, args } => {
                let mapped: Vec<BlockArg> = args
                    .iter()
                    .map(|&a| BlockArg::Value(self.value(a)))
                    .collect();
                let target_block = self.blocks[target.0 as usize];
                self.builder.ins().jump(target_block, &mapped);
            }
            Terminator::Branch {
                cond,
                nullish,
                then_target,
                then_args,
                else_target,
                else_args,
            } => {
                let cond_val = self.value(*cond);
                let flag = if *nullish {
                    let is_undef = self.builder.ins().icmp_imm(
                        IntCC::Equal,
                        cond_val,
                        type_guards::TAG_UNDEFINED,
                    );
                    let is_null = self.builder.ins().icmp_imm(
                        IntCC::Equal,
                        cond_val,
                        type_guards::TAG_UNDEFINED + 1,
                    );
                    self.builder.ins().bor(is_undef, is_null)
                } else {
                    self.truthy_flag(cond_val)
                };
                let then_mapped: Vec<BlockArg> = then_args
                    .iter()
                    .map(|&a| BlockArg::Value(self.value(a)))
                    .collect();
                let else_mapped: Vec<BlockArg> = else_args
                    .iter()
                    .map(|&a| BlockArg::Value(self.value(a)))
                    .collect();
                let then_block = self.blocks[then_target.0 as usize];
                let else_block = self.blocks[else_target.0 as usize];
                self.builder
                    .ins()
                    .brif(flag, then_block, &then_mapped, else_block, &else_mapped);
            }
            Terminator::Return(value) => {
                let v = self.value(*value);
                self.builder.ins().return_(&[v]);
            }
        }
        Ok(())
    }

    fn lower_node(&mut self, id: NodeId) -> Result<(), JitError> {
        let node = self.ir.node(id).clone();
        let value = match &node.op {
            IrOp::BlockParam(_) => return Ok(()), // bound in lower_block
            IrOp::Const(bits) => Some(self.iconst(*bits)),
            IrOp::Int32Const(v) => Some(self.iconst(*v as i64)),
            IrOp::EntryLocal(idx) => {
                let base = self.builder.use_var(self.locals_var);
                Some(self.builder.ins().load(
                    types::I64,
                    MemFlags::trusted(),
                    base,
                    (*idx as i32) * 8,
                ))
            }
            IrOp::BoxInt32 => {
                let input = self.value(node.inputs[0]);
                Some(type_guards::emit_box_int32(self.builder, input))
            }
            IrOp::UnboxInt32 => {
                let input = self.value(node.inputs[0]);
                Some(type_guards::emit_unbox_int32(self.builder, input))
            }
            IrOp::I32Add | IrOp::I32Sub | IrOp::I32Mul => {
                let l = self.value(node.inputs[0]);
                let r = self.value(node.inputs[1]);
                let raw = match node.op {
                    IrOp::I32Add => self.builder.ins().iadd(l, r),
                    IrOp::I32Sub => self.builder.ins().isub(l, r),
                    _ => self.builder.ins().imul(l, r),
                };
                self.overflow_guard(id, raw);
                Some(raw)
            }
            IrOp::I32ShlConst(amount) => {
                let input = self.value(node.inputs[0]);
                let raw = self.builder.ins().ishl_imm(input, *amount as i64);
                self.overflow_guard(id, raw);
                Some(raw)
            }
            IrOp::I32Cmp(kind) => {
                let l = self.value(node.inputs[0]);
                let r = self.value(node.inputs[1]);
                use crate::ir::CmpKind::*;
                let cc = match kind {
                    Lt => IntCC::SignedLessThan,
                    Le => IntCC::SignedLessThanOrEqual,
                    Gt => IntCC::SignedGreaterThan,
                    Ge => IntCC::SignedGreaterThanOrEqual,
                    Eq => IntCC::Equal,
                };
                let flag = self.builder.ins().icmp(cc, l, r);
                let t = self.iconst(type_guards::TAG_TRUE);
                let f = self.iconst(type_guards::TAG_FALSE);
                Some(self.builder.ins().select(flag, t, f))
            }
            IrOp::GuardInt32 => {
                let input = self.value(node.inputs[0]);
                let ok = type_guards::emit_is_int32(self.builder, input);
                self.guard_branch(id, ok);
                Some(input)
            }
            IrOp::GuardShape(shape) => {
                let input = self.value(node.inputs[0]);
                let z = self.iconst(0);
                let actual = self.call_helper_raw(HelperKind::ShapeOf, input, z, z);
                let ok = self
                    .builder
                    .ins()
                    .icmp_imm(IntCC::Equal, actual, *shape as i64);
                self.guard_branch(id, ok);
                Some(input)
            }
            IrOp::GuardArray => {
                let input = self.value(node.inputs[0]);
                let z = self.iconst(0);
                let flag = self.call_helper_raw(HelperKind::IsArray, input, z, z);
                let ok = self.builder.ins().icmp_imm(IntCC::NotEqual, flag, 0);
                self.guard_branch(id, ok);
                Some(input)
            }
            IrOp::GuardBounds => {
                let idx = self.value(node.inputs[0]);
                let len = self.value(node.inputs[1]);
                let nonneg = self
                    .builder
                    .ins()
                    .icmp_imm(IntCC::SignedGreaterThanOrEqual, idx, 0);
                let below = self.builder.ins().icmp(IntCC::SignedLessThan, idx, len);
                let ok = self.builder.ins().band(nonneg, below);
                self.guard_branch(id, ok);
                None
            }
            IrOp::LoadSlot(offset) => {
                let obj = self.value(node.inputs[0]);
                let off = self.iconst(*offset as i64);
                let z = self.iconst(0);
                Some(self.call_helper_raw(HelperKind::LoadSlotFast, obj, off, z))
            }
            IrOp::StoreSlot(offset) => {
                let obj = self.value(node.inputs[0]);
                let value = self.value(node.inputs[1]);
                let off = self.iconst(*offset as i64);
                self.call_helper_raw(HelperKind::StoreSlotFast, obj, off, value);
                None
            }
            IrOp::ArrayLength => {
                let obj = self.value(node.inputs[0]);
                let z = self.iconst(0);
                Some(self.call_helper_raw(HelperKind::ArrayLength, obj, z, z))
            }
            IrOp::LoadElement => {
                let obj = self.value(node.inputs[0]);
                let idx = self.value(node.inputs[1]);
                let z = self.iconst(0);
                Some(self.call_helper_raw(HelperKind::LoadElementFast, obj, idx, z))
            }
            IrOp::ScalarObject { .. } => return Ok(()), // deopt-exit only
            IrOp::Helper { kind, imm } => {
                self.spill_frame_state(id);
                let (a, b, c) = self.helper_args(*kind, &node.inputs, *imm);
                Some(self.call_helper_checked(*kind, a, b, c))
            }
            IrOp::HelperCall { kind, imm } => {
                self.spill_frame_state(id);
                // Arguments after the target go to the scratch area.
                let scratch = self.builder.use_var(self.scratch_var);
                for (i, &arg) in node.inputs[1..].iter().enumerate() {
                    let v = self.value(arg);
                    self.builder
                        .ins()
                        .store(MemFlags::trusted(), v, scratch, (i as i32) * 8);
                }
                let target = self.value(node.inputs[0]);
                let argc = self.iconst((node.inputs.len() - 1) as i64);
                let imm_val = self.iconst(*imm);
                let (b, c) = match kind {
                    HelperKind::CallMethod => (imm_val, argc),
                    _ => (argc, imm_val),
                };
                Some(self.call_helper_checked(*kind, target, b, c))
            }
        };
        self.values[id.0 as usize] = value;
        Ok(())
    }

    /// Map (inputs, immediates) onto the helper's (a, b, c) convention.
    fn helper_args(
        &mut self,
        kind: HelperKind,
        inputs: &smallvec::SmallVec<[NodeId; 2]>,
        imm: [i64; 2],
    ) -> (Value, Value, Value) {
        let input = |lowering: &mut Self, i: usize| lowering.value(inputs[i]);
        match kind {
            // (imm0, imm1, _)
            HelperKind::LoadConst
            | HelperKind::CheckTdz
            | HelperKind::GetGlobal
            | HelperKind::GetUpvalue
            | HelperKind::GetLocalCell
            | HelperKind::CloseUpvalue
            | HelperKind::PopContext
            | HelperKind::NewObject
            | HelperKind::NewArray
            | HelperKind::Closure => {
                let a = self.iconst(imm[0]);
                let b = self.iconst(imm[1]);
                let z = self.iconst(0);
                (a, b, z)
            }
            // (imm0, in0, imm1)
            HelperKind::SetGlobal | HelperKind::SetUpvalue | HelperKind::SetLocalCell => {
                let a = self.iconst(imm[0]);
                let b = input(self, 0);
                let c = self.iconst(imm[1]);
                (a, b, c)
            }
            // (in0, imm0, imm1)
            HelperKind::GetProp | HelperKind::DefineDataProp | HelperKind::IteratorNext => {
                let a = input(self, 0);
                let b = self.iconst(imm[0]);
                let c = if inputs.len() > 1 {
                    input(self, 1)
                } else {
                    self.iconst(imm[1])
                };
                (a, b, c)
            }
            // (in0, imm0(packed), in1)
            HelperKind::SetProp => {
                let a = input(self, 0);
                let b = self.iconst(imm[0]);
                let c = input(self, 1);
                (a, b, c)
            }
            // (in0, in1, in2?) with trailing immediate
            HelperKind::SetElem => {
                let a = input(self, 0);
                let b = input(self, 1);
                let c = input(self, 2);
                (a, b, c)
            }
            // (in0, in1?, imm0)
            _ => {
                let a = if inputs.is_empty() {
                    self.iconst(0)
                } else {
                    input(self, 0)
                };
                let b = if inputs.len() > 1 {
                    input(self, 1)
                } else {
                    self.iconst(imm[0])
                };
                let c = if inputs.len() > 1 {
                    self.iconst(imm[0])
                } else {
                    self.iconst(imm[1])
                };
                (a, b, c)
            }
        }
    }

    fn value(&self, id: NodeId) -> Value {
        self.values[id.0 as usize].expect("node lowered before use")
    }

    fn iconst(&mut self, bits: i64) -> Value {
        self.builder.ins().iconst(types::I64, bits)
    }

    fn load_ctx(&mut self, ctx: Value, offset: usize) -> Value {
        self.builder
            .ins()
            .load(types::I64, MemFlags::trusted(), ctx, offset as i32)
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

    /// Helper call with no sentinel check (pure fast-path helpers).
    fn call_helper_raw(&mut self, kind: HelperKind, a: Value, b: Value, c: Value) -> Value {
        let func_ref = self.helper_ref(kind);
        let ctx = self.builder.use_var(self.ctx_var);
        let call = self.builder.ins().call(func_ref, &[ctx, a, b, c]);
        self.builder.inst_results(call)[0]
    }

    /// Helper call that may throw: sentinel results unwind via propagate.
    fn call_helper_checked(&mut self, kind: HelperKind, a: Value, b: Value, c: Value) -> Value {
        let result = self.call_helper_raw(kind, a, b, c);
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

    fn truthy_flag(&mut self, value: Value) -> Value {
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
        let truthy = self.call_helper_raw(HelperKind::ToBoolean, value, z, z);
        let flag = self.builder.ins().ireduce(types::I8, truthy);
        self.builder.ins().jump(flag_block, &[BlockArg::Value(flag)]);

        self.builder.seal_block(flag_block);
        self.builder.switch_to_block(flag_block);
        self.builder.block_params(flag_block)[0]
    }

    /// Overflow check for int32 arithmetic: the 64-bit result must fit.
    fn overflow_guard(&mut self, id: NodeId, raw: Value) {
        let narrowed = self.builder.ins().ireduce(types::I32, raw);
        let widened = self.builder.ins().sextend(types::I64, narrowed);
        let ok = self.builder.ins().icmp(IntCC::Equal, raw, widened);
        self.guard_branch(id, ok);
    }

    /// Branch to this guard's deopt exit when `ok` is false.
    fn guard_branch(&mut self, id: NodeId, ok: Value) {
        let exit = self.build_deopt_exit(id);
        let cont = self.builder.create_block();
        self.builder.ins().brif(ok, cont, &[], exit, &[]);
        self.builder.seal_block(cont);
        self.builder.switch_to_block(cont);
    }

    /// Out-of-line exit: spill the frame state, record the deopt index,
    /// return the sentinel.
    fn build_deopt_exit(&mut self, id: NodeId) -> Block {
        let node = self.ir.node(id);
        let state = self
            .ir
            .frame_states
            .get(&id)
            .cloned()
            .unwrap_or_default();
        let exit = self.builder.create_block();
        self.builder.set_cold_block(exit);
        let current = self.builder.current_block().expect("in a block");

        self.builder.switch_to_block(exit);
        let (locals_meta, registers_meta) = self.spill_state(&state);
        let index = self.deopt_table.push(DeoptPoint {
            bytecode_pc: node.bc_pc,
            ic: node.ic,
            speculation: node.speculation.unwrap_or("guard"),
            locals: locals_meta,
            registers: registers_meta,
        });
        let ctx = self.builder.use_var(self.ctx_var);
        let index_val = self.builder.ins().iconst(types::I32, index as i64);
        self.builder.ins().store(
            MemFlags::trusted(),
            index_val,
            ctx,
            offset_of!(JitContext, deopt_index) as i32,
        );
        let sentinel = self.iconst(DEOPT_SENTINEL);
        self.builder.ins().return_(&[sentinel]);
        self.builder.seal_block(exit);

        self.builder.switch_to_block(current);
        exit
    }

    /// Spill a frame state into the locals/registers arrays, producing the
    /// metadata that tells the deoptimizer where everything landed.
    fn spill_state(
        &mut self,
        state: &FrameState,
    ) -> (Vec<(u16, SlotLocation)>, Vec<(u8, SlotLocation)>) {
        let mut locals_meta = Vec::new();
        for (idx, entry) in state.locals.iter().enumerate() {
            match entry {
                None => locals_meta.push((idx as u16, SlotLocation::FrameLocal(idx as u16))),
                Some(node) => {
                    let location = self.spill_value(*node, SpillTarget::Local(idx as u16));
                    locals_meta.push((idx as u16, location));
                }
            }
        }
        let mut registers_meta = Vec::new();
        for &(reg, node) in &state.registers {
            let location = self.spill_value(node, SpillTarget::Register(reg));
            registers_meta.push((reg, location));
        }
        (locals_meta, registers_meta)
    }

    fn spill_value(&mut self, node: NodeId, target: SpillTarget) -> SlotLocation {
        match &self.ir.node(node).op {
            // Compile-time constants rematerialize in the deoptimizer.
            IrOp::Const(bits) => SlotLocation::Constant(*bits),
            IrOp::ScalarObject { descriptor } => {
                // Spill the fields into claimed scratch slots once.
                let descriptor = *descriptor;
                let fields: Vec<NodeId> =
                    self.ir.node(node).inputs.iter().copied().collect();
                if self.deopt_table.materializations[descriptor as usize]
                    .field_scratch
                    .is_empty()
                {
                    let mut slots = Vec::new();
                    for _ in &fields {
                        slots.push(self.scratch_cursor);
                        self.scratch_cursor += 1;
                    }
                    self.deopt_table.materializations[descriptor as usize].field_scratch =
                        slots;
                }
                let slots = self.deopt_table.materializations[descriptor as usize]
                    .field_scratch
                    .clone();
                let scratch = self.builder.use_var(self.scratch_var);
                for (field, slot) in fields.iter().zip(&slots) {
                    let v = self.value(*field);
                    self.builder
                        .ins()
                        .store(MemFlags::trusted(), v, scratch, (*slot as i32) * 8);
                }
                SlotLocation::Materialized { descriptor }
            }
            _ => {
                let v = self.value(node);
                match target {
                    SpillTarget::Local(idx) => {
                        let base = self.builder.use_var(self.locals_var);
                        self.builder
                            .ins()
                            .store(MemFlags::trusted(), v, base, (idx as i32) * 8);
                        SlotLocation::FrameLocal(idx)
                    }
                    SpillTarget::Register(reg) => {
                        let base = self.builder.use_var(self.registers_var);
                        self.builder
                            .ins()
                            .store(MemFlags::trusted(), v, base, (reg as i32) * 8);
                        SlotLocation::FrameRegister(reg)
                    }
                }
            }
        }
    }

    /// Commit live values to the frame arrays before a reentrant helper.
    fn spill_frame_state(&mut self, id: NodeId) {
        let Some(state) = self.ir.frame_states.get(&id).cloned() else {
            return;
        };
        for (idx, entry) in state.locals.iter().enumerate() {
            if let Some(node) = entry
                && !matches!(self.ir.node(*node).op, IrOp::ScalarObject { .. })
            {
                let v = self.value(*node);
                let base = self.builder.use_var(self.locals_var);
                self.builder
                    .ins()
                    .store(MemFlags::trusted(), v, base, (idx as i32) * 8);
            }
        }
        for &(reg, node) in &state.registers {
            if matches!(self.ir.node(node).op, IrOp::ScalarObject { .. }) {
                continue;
            }
            let v = self.value(node);
            let base = self.builder.use_var(self.registers_var);
            self.builder
                .ins()
                .store(MemFlags::trusted(), v, base, (reg as i32) * 8);
        }
    }
}

enum SpillTarget {
    Local(u16),
    Register(u8),
}
