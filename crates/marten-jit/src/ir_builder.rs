//! Bytecode → IR translation using a feedback snapshot.
//!
//! Walks the bytecode in layout order, keeping an abstract frame (SSA node
//! per local and register). Sites whose feedback grounds a speculation emit
//! guard nodes plus specialized operations; everything else lowers to the
//! same helper calls the baseline uses. Each guard captures the frame state
//! needed to re-enter the interpreter at its bytecode pc.

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::{SmallVec, smallvec};

use marten_bytecode::instruction::Instruction;
use marten_bytecode::{FeedbackIndex, FeedbackSlot, Function, InlineCacheState, Opcode};

use crate::code::Assumption;
use crate::error::JitError;
use crate::helpers::HelperKind;
use crate::ir::{BlockId, CmpKind, FrameState, IrFunction, IrNode, IrOp, NodeId, Terminator};
use crate::type_guards;

/// Everything the builder needs, snapshotted at compilation start.
pub struct BuildInput<'a> {
    /// The function to compile.
    pub function: &'a Function,
    /// Feedback vector snapshot (the compiler thread reads no live slots).
    pub feedback: Vec<FeedbackSlot>,
    /// Prototype epoch the feedback was valid under.
    pub proto_epoch: u64,
    /// Shape-seed property lists by constant index.
    pub seed_tables: rustc_hash::FxHashMap<u32, Vec<String>>,
    /// String constants by index.
    pub constant_strings: rustc_hash::FxHashMap<u32, String>,
}

/// Build result: the IR plus the assumptions it speculated on.
pub struct BuildOutput {
    /// The IR function.
    pub ir: IrFunction,
    /// Assumption list for the code object.
    pub assumptions: Vec<Assumption>,
}

/// Translate bytecode into IR.
pub fn build(input: &BuildInput<'_>) -> Result<BuildOutput, JitError> {
    Builder::new(input).run()
}

struct Builder<'a> {
    input: &'a BuildInput<'a>,
    ir: IrFunction,
    /// pc → block, for every block head.
    block_at: FxHashMap<u32, BlockId>,
    /// Locals that are ever written; only these travel as block params.
    written_locals: Vec<u16>,
    /// Per-block parameter node ids (created up front).
    block_params: Vec<Vec<NodeId>>,
    /// Entry definitions for never-written locals.
    entry_locals: Vec<NodeId>,
    assumptions: Vec<Assumption>,
    current: BlockId,
    locals: Vec<NodeId>,
    registers: Vec<NodeId>,
    /// Functions that create closures keep locals in frame memory (cells
    /// may alias them); SSA tracking would go stale.
    locals_in_memory: bool,
}

impl<'a> Builder<'a> {
    fn new(input: &'a BuildInput<'a>) -> Self {
        Self {
            input,
            ir: IrFunction::default(),
            block_at: FxHashMap::default(),
            written_locals: Vec::new(),
            block_params: Vec::new(),
            entry_locals: Vec::new(),
            assumptions: Vec::new(),
            current: BlockId(0),
            locals: Vec::new(),
            registers: Vec::new(),
            locals_in_memory: input
                .function
                .instructions
                .iter()
                .any(|i| i.opcode() == Opcode::Closure),
        }
    }

    fn run(mut self) -> Result<BuildOutput, JitError> {
        let function = self.input.function;
        reject_unsupported(function)?;
        self.ir.local_count = function.local_count;
        self.ir.register_count = function.register_count;

        self.written_locals = if self.locals_in_memory {
            Vec::new()
        } else {
            written_locals(function)
        };
        let block_starts = block_starts(function);

        // Entry block plus one block per boundary; non-entry blocks carry
        // the mutable frame (written locals, then registers) as params.
        let entry = self.ir.new_block(0);
        debug_assert_eq!(entry, BlockId(0));
        self.block_params.push(Vec::new());
        for &start in &block_starts {
            let block = self.ir.new_block(start);
            self.block_at.insert(start, block);
            let mut params = Vec::new();
            let param_count = self.written_locals.len() + function.register_count as usize;
            for i in 0..param_count {
                let param = self.ir.push(
                    block,
                    IrNode {
                        op: IrOp::BlockParam(i as u16),
                        inputs: smallvec![],
                        bc_pc: start,
                        speculation: None,
                        ic: None,
                    },
                );
                params.push(param);
            }
            self.ir.blocks[block.0 as usize].param_count = param_count as u16;
            self.block_params.push(params);
        }
        self.mark_loop_headers(function);

        // Entry definitions.
        self.current = entry;
        if !self.locals_in_memory {
            for idx in 0..function.local_count {
                let node = self.push_node(IrOp::EntryLocal(idx), smallvec![], 0);
                self.entry_locals.push(node);
            }
        }
        self.locals = self.entry_locals.clone();
        let undefined = self.push_node(IrOp::Const(type_guards::TAG_UNDEFINED), smallvec![], 0);
        self.registers = vec![undefined; function.register_count as usize];

        // Entry falls into the block at pc 0 (which is always a boundary).
        let first = self.block_at[&0];
        let args = self.edge_args();
        self.ir.blocks[entry.0 as usize].terminator = Some(Terminator::Jump {
            target: first,
            args,
        });

        let mut pc = 0u32;
        let count = function.instructions.len() as u32;
        while pc < count {
            if let Some(&block) = self.block_at.get(&pc) {
                // Close the previous block with a fallthrough edge if open.
                if self.ir.blocks[self.current.0 as usize].terminator.is_none()
                    && self.current != block
                {
                    let args = self.edge_args();
                    self.ir.blocks[self.current.0 as usize].terminator =
                        Some(Terminator::Jump {
                            target: block,
                            args,
                        });
                }
                self.enter_block(block);
            }
            self.translate(pc, &function.instructions[pc as usize])?;
            pc += 1;
        }
        if self.ir.blocks[self.current.0 as usize].terminator.is_none() {
            let undef = self.push_node(
                IrOp::Const(type_guards::TAG_UNDEFINED),
                smallvec![],
                count.saturating_sub(1),
            );
            self.ir.blocks[self.current.0 as usize].terminator =
                Some(Terminator::Return(undef));
        }

        self.assumptions.push(Assumption::ProtoEpoch(self.input.proto_epoch));
        self.assumptions.dedup();
        self.ir.written_locals = self.written_locals.clone();
        self.ir.seed_tables = self.input.seed_tables.clone();
        self.ir.constant_strings = self.input.constant_strings.clone();
        Ok(BuildOutput {
            ir: self.ir,
            assumptions: self.assumptions,
        })
    }

    fn mark_loop_headers(&mut self, function: &Function) {
        for (pc, instruction) in function.instructions.iter().enumerate() {
            if let Some(offset) = jump_offset(instruction)
                && offset < 0
            {
                let target = (pc as i64 + offset as i64) as u32;
                if let Some(&block) = self.block_at.get(&target) {
                    self.ir.blocks[block.0 as usize].is_loop_header = true;
                }
            }
        }
    }

    fn enter_block(&mut self, block: BlockId) {
        self.current = block;
        let params = &self.block_params[block.0 as usize];
        let mut cursor = 0;
        for (slot, &local) in self.written_locals.iter().enumerate() {
            let _ = slot;
            self.locals[local as usize] = params[cursor];
            cursor += 1;
        }
        for reg in 0..self.registers.len() {
            self.registers[reg] = params[cursor];
            cursor += 1;
        }
    }

    /// Edge arguments in the canonical order (written locals, registers).
    fn edge_args(&self) -> Vec<NodeId> {
        let mut args = Vec::with_capacity(self.written_locals.len() + self.registers.len());
        for &local in &self.written_locals {
            args.push(self.locals[local as usize]);
        }
        args.extend(self.registers.iter().copied());
        args
    }

    fn push_node(&mut self, op: IrOp, inputs: SmallVec<[NodeId; 2]>, bc_pc: u32) -> NodeId {
        self.ir.push(
            self.current,
            IrNode {
                op,
                inputs,
                bc_pc,
                speculation: None,
                ic: None,
            },
        )
    }

    fn push_guard(
        &mut self,
        op: IrOp,
        inputs: SmallVec<[NodeId; 2]>,
        bc_pc: u32,
        speculation: &'static str,
        ic: Option<FeedbackIndex>,
    ) -> NodeId {
        let id = self.ir.push(
            self.current,
            IrNode {
                op,
                inputs,
                bc_pc,
                speculation: Some(speculation),
                ic,
            },
        );
        self.ir.frame_states.insert(id, self.frame_state());
        id
    }

    fn frame_state(&self) -> FrameState {
        let locals = if self.locals_in_memory {
            vec![None; self.input.function.local_count as usize]
        } else {
            self.locals.iter().map(|&n| Some(n)).collect()
        };
        FrameState {
            locals,
            registers: self
                .registers
                .iter()
                .enumerate()
                .map(|(i, &node)| (i as u8, node))
                .collect(),
        }
    }

    fn slot(&self, ic: FeedbackIndex) -> Option<&FeedbackSlot> {
        self.input.feedback.get(ic.index() as usize)
    }

    fn smi_speculation(&self, ic: FeedbackIndex) -> bool {
        self.slot(ic)
            .is_some_and(|s| s.operand_types.is_smi_only() && !s.speculation_forbidden)
    }

    fn mono_property(&self, ic: FeedbackIndex) -> Option<(u32, u32)> {
        let slot = self.slot(ic)?;
        if slot.speculation_forbidden || !slot.ic.epoch_matches(self.input.proto_epoch) {
            return None;
        }
        match slot.ic.state {
            InlineCacheState::Monomorphic { shape, offset } => Some((shape, offset)),
            _ => None,
        }
    }

    fn helper(
        &mut self,
        kind: HelperKind,
        inputs: SmallVec<[NodeId; 2]>,
        imm: [i64; 2],
        bc_pc: u32,
    ) -> NodeId {
        let id = self.push_node(IrOp::Helper { kind, imm }, inputs, bc_pc);
        // Helpers may re-enter the interpreter (getters, valueOf, calls),
        // whose safepoints collect: everything live in SSA registers is
        // spilled to the rooted frame arrays first. The GC never moves
        // cells, so nothing needs reloading afterwards.
        self.ir.frame_states.insert(id, self.frame_state());
        id
    }

    fn helper_call(
        &mut self,
        kind: HelperKind,
        imm: i64,
        inputs: SmallVec<[NodeId; 2]>,
        bc_pc: u32,
    ) -> NodeId {
        let id = self.push_node(IrOp::HelperCall { kind, imm }, inputs, bc_pc);
        self.ir.frame_states.insert(id, self.frame_state());
        id
    }

    /// Speculative int32 binary arithmetic.
    fn speculative_arith(
        &mut self,
        pc: u32,
        dst: u8,
        lhs: u8,
        rhs: u8,
        ic: FeedbackIndex,
        op: IrOp,
        generic: HelperKind,
    ) {
        let l = self.registers[lhs as usize];
        let r = self.registers[rhs as usize];
        if self.smi_speculation(ic) {
            let gl = self.push_guard(IrOp::GuardInt32, smallvec![l], pc, "smi-operands", Some(ic));
            let gr = self.push_guard(IrOp::GuardInt32, smallvec![r], pc, "smi-operands", Some(ic));
            let ul = self.push_node(IrOp::UnboxInt32, smallvec![gl], pc);
            let ur = self.push_node(IrOp::UnboxInt32, smallvec![gr], pc);
            let raw = self.push_guard(op, smallvec![ul, ur], pc, "no-overflow", Some(ic));
            let boxed = self.push_node(IrOp::BoxInt32, smallvec![raw], pc);
            self.registers[dst as usize] = boxed;
        } else {
            let result = self.helper(generic, smallvec![l, r], [ic.index() as i64, 0], pc);
            self.registers[dst as usize] = result;
        }
    }

    fn speculative_compare(
        &mut self,
        pc: u32,
        dst: u8,
        lhs: u8,
        rhs: u8,
        ic: FeedbackIndex,
        kind: CmpKind,
        generic: HelperKind,
    ) {
        let l = self.registers[lhs as usize];
        let r = self.registers[rhs as usize];
        if self.smi_speculation(ic) {
            let gl = self.push_guard(IrOp::GuardInt32, smallvec![l], pc, "smi-operands", Some(ic));
            let gr = self.push_guard(IrOp::GuardInt32, smallvec![r], pc, "smi-operands", Some(ic));
            let ul = self.push_node(IrOp::UnboxInt32, smallvec![gl], pc);
            let ur = self.push_node(IrOp::UnboxInt32, smallvec![gr], pc);
            let result = self.push_node(IrOp::I32Cmp(kind), smallvec![ul, ur], pc);
            self.registers[dst as usize] = result;
        } else {
            let result = self.helper(generic, smallvec![l, r], [ic.index() as i64, 0], pc);
            self.registers[dst as usize] = result;
        }
    }

    fn branch(
        &mut self,
        pc: u32,
        cond: NodeId,
        nullish: bool,
        invert: bool,
        offset: i32,
    ) -> Result<(), JitError> {
        let count = self.input.function.instructions.len();
        let taken_pc = target_pc(pc, offset, count)?;
        let fall_pc = pc + 1;
        let taken = self.block_for(taken_pc, count);
        let fall = self.block_for(fall_pc as i64 as u32, count);
        let args = self.edge_args();
        let (then_target, else_target) = if invert { (fall, taken) } else { (taken, fall) };
        self.ir.blocks[self.current.0 as usize].terminator = Some(Terminator::Branch {
            cond,
            nullish,
            then_target,
            then_args: args.clone(),
            else_target,
            else_args: args,
        });
        Ok(())
    }

    /// Block for a pc; past-the-end jumps get a synthetic return block.
    fn block_for(&mut self, pc: u32, count: usize) -> BlockId {
        if let Some(&block) = self.block_at.get(&pc) {
            return block;
        }
        debug_assert!(pc as usize >= count, "non-boundary jump target {pc}");
        // Shared synthetic end block.
        if let Some(&block) = self.block_at.get(&(count as u32)) {
            return block;
        }
        let block = self.ir.new_block(count as u32);
        self.block_params.push(Vec::new());
        // Give it the uniform parameter list so edges stay consistent.
        let param_count = self.written_locals.len() + self.registers.len();
        let mut params = Vec::new();
        for i in 0..param_count {
            let param = self.ir.push(
                block,
                IrNode {
                    op: IrOp::BlockParam(i as u16),
                    inputs: smallvec![],
                    bc_pc: count as u32,
                    speculation: None,
                    ic: None,
                },
            );
            params.push(param);
        }
        self.ir.blocks[block.0 as usize].param_count = param_count as u16;
        *self.block_params.last_mut().expect("params pushed") = params;
        let undef = self.ir.push(
            block,
            IrNode {
                op: IrOp::Const(type_guards::TAG_UNDEFINED),
                inputs: smallvec![],
                bc_pc: count as u32,
                speculation: None,
                ic: None,
            },
        );
        self.ir.blocks[block.0 as usize].terminator = Some(Terminator::Return(undef));
        self.block_at.insert(count as u32, block);
        block
    }

    fn translate(&mut self, pc: u32, instruction: &Instruction) -> Result<(), JitError> {
        use Instruction as I;
        match instruction {
            I::LoadUndefined { dst } => {
                self.registers[dst.index() as usize] =
                    self.push_node(IrOp::Const(type_guards::TAG_UNDEFINED), smallvec![], pc);
            }
            I::LoadNull { dst } => {
                self.registers[dst.index() as usize] =
                    self.push_node(IrOp::Const(type_guards::TAG_UNDEFINED + 1), smallvec![], pc);
            }
            I::LoadTrue { dst } => {
                self.registers[dst.index() as usize] =
                    self.push_node(IrOp::Const(type_guards::TAG_TRUE), smallvec![], pc);
            }
            I::LoadFalse { dst } => {
                self.registers[dst.index() as usize] =
                    self.push_node(IrOp::Const(type_guards::TAG_FALSE), smallvec![], pc);
            }
            I::LoadHole { dst } => {
                self.registers[dst.index() as usize] =
                    self.push_node(IrOp::Const(type_guards::TAG_UNDEFINED + 4), smallvec![], pc);
            }
            I::LoadInt8 { dst, value } => {
                let bits = type_guards::TAG_INT32 | (*value as i32 as u32 as i64);
                self.registers[dst.index() as usize] =
                    self.push_node(IrOp::Const(bits), smallvec![], pc);
            }
            I::LoadInt32 { dst, value } => {
                let bits = type_guards::TAG_INT32 | (*value as u32 as i64);
                self.registers[dst.index() as usize] =
                    self.push_node(IrOp::Const(bits), smallvec![], pc);
            }
            I::LoadConst { dst, idx } => {
                let node = self.helper(
                    HelperKind::LoadConst,
                    smallvec![],
                    [idx.index() as i64, 0],
                    pc,
                );
                self.registers[dst.index() as usize] = node;
            }

            I::GetLocal { dst, idx } => {
                if self.locals_in_memory {
                    let node = self.helper(
                        HelperKind::GetLocalCell,
                        smallvec![],
                        [idx.index() as i64, 0],
                        pc,
                    );
                    self.registers[dst.index() as usize] = node;
                } else {
                    self.registers[dst.index() as usize] = self.locals[idx.index() as usize];
                }
            }
            I::SetLocal { idx, src } => {
                if self.locals_in_memory {
                    let value = self.registers[src.index() as usize];
                    self.helper(
                        HelperKind::SetLocalCell,
                        smallvec![value],
                        [idx.index() as i64, 0],
                        pc,
                    );
                } else {
                    self.locals[idx.index() as usize] = self.registers[src.index() as usize];
                }
            }
            I::Move { dst, src } => {
                self.registers[dst.index() as usize] = self.registers[src.index() as usize];
            }
            I::Nop | I::PushContext => {}
            I::PopContext { first_local } => {
                let node = self.helper(
                    HelperKind::PopContext,
                    smallvec![],
                    [first_local.index() as i64, 0],
                    pc,
                );
                let _ = node;
            }
            I::CloseUpvalue { idx } => {
                self.helper(
                    HelperKind::CloseUpvalue,
                    smallvec![],
                    [idx.index() as i64, 0],
                    pc,
                );
            }
            I::GetUpvalue { dst, idx } => {
                let node = self.helper(
                    HelperKind::GetUpvalue,
                    smallvec![],
                    [idx.index() as i64, 0],
                    pc,
                );
                self.registers[dst.index() as usize] = node;
            }
            I::SetUpvalue { idx, src } => {
                let value = self.registers[src.index() as usize];
                self.helper(
                    HelperKind::SetUpvalue,
                    smallvec![value],
                    [idx.index() as i64, 0],
                    pc,
                );
            }
            I::CheckTdz { idx, name } => {
                self.helper(
                    HelperKind::CheckTdz,
                    smallvec![],
                    [idx.index() as i64, name.index() as i64],
                    pc,
                );
            }
            I::GetGlobal { dst, name, ic } => {
                let node = self.helper(
                    HelperKind::GetGlobal,
                    smallvec![],
                    [name.index() as i64, ic.index() as i64],
                    pc,
                );
                self.registers[dst.index() as usize] = node;
            }
            I::SetGlobal { name, src, ic } => {
                let value = self.registers[src.index() as usize];
                self.helper(
                    HelperKind::SetGlobal,
                    smallvec![value],
                    [name.index() as i64, ic.index() as i64],
                    pc,
                );
            }
            I::LoadThis { dst } => {
                // this/new.target never change within a frame; model them as
                // entry-invariant helper reads.
                let node = self.helper(HelperKind::LoadConst, smallvec![], [-1, 0], pc);
                self.registers[dst.index() as usize] = node;
            }
            I::NewTarget { dst } => {
                let node = self.helper(HelperKind::LoadConst, smallvec![], [-2, 0], pc);
                self.registers[dst.index() as usize] = node;
            }

            I::Add { dst, lhs, rhs, ic } => self.speculative_arith(
                pc,
                dst.index(),
                lhs.index(),
                rhs.index(),
                *ic,
                IrOp::I32Add,
                HelperKind::GenericAdd,
            ),
            I::Sub { dst, lhs, rhs, ic } => self.speculative_arith(
                pc,
                dst.index(),
                lhs.index(),
                rhs.index(),
                *ic,
                IrOp::I32Sub,
                HelperKind::GenericSub,
            ),
            I::Mul { dst, lhs, rhs, ic } => self.speculative_arith(
                pc,
                dst.index(),
                lhs.index(),
                rhs.index(),
                *ic,
                IrOp::I32Mul,
                HelperKind::GenericMul,
            ),
            I::Div { dst, lhs, rhs, ic } => {
                let l = self.registers[lhs.index() as usize];
                let r = self.registers[rhs.index() as usize];
                let node = self.helper(
                    HelperKind::GenericDiv,
                    smallvec![l, r],
                    [ic.index() as i64, 0],
                    pc,
                );
                self.registers[dst.index() as usize] = node;
            }
            I::Mod { dst, lhs, rhs, ic } => {
                let l = self.registers[lhs.index() as usize];
                let r = self.registers[rhs.index() as usize];
                let node = self.helper(
                    HelperKind::GenericMod,
                    smallvec![l, r],
                    [ic.index() as i64, 0],
                    pc,
                );
                self.registers[dst.index() as usize] = node;
            }
            I::Pow { dst, lhs, rhs, ic } => {
                let l = self.registers[lhs.index() as usize];
                let r = self.registers[rhs.index() as usize];
                let node = self.helper(
                    HelperKind::GenericPow,
                    smallvec![l, r],
                    [ic.index() as i64, 0],
                    pc,
                );
                self.registers[dst.index() as usize] = node;
            }
            I::Neg { dst, src } => {
                let s = self.registers[src.index() as usize];
                let node = self.helper(HelperKind::GenericNeg, smallvec![s], [0, 0], pc);
                self.registers[dst.index() as usize] = node;
            }
            I::Inc { dst, src } => {
                let s = self.registers[src.index() as usize];
                let node = self.helper(HelperKind::GenericInc, smallvec![s], [0, 0], pc);
                self.registers[dst.index() as usize] = node;
            }
            I::Dec { dst, src } => {
                let s = self.registers[src.index() as usize];
                let node = self.helper(HelperKind::GenericDec, smallvec![s], [0, 0], pc);
                self.registers[dst.index() as usize] = node;
            }

            I::BitAnd { dst, lhs, rhs } => self.bit_op(pc, dst.index(), lhs.index(), rhs.index(), 0),
            I::BitOr { dst, lhs, rhs } => self.bit_op(pc, dst.index(), lhs.index(), rhs.index(), 1),
            I::BitXor { dst, lhs, rhs } => self.bit_op(pc, dst.index(), lhs.index(), rhs.index(), 2),
            I::Shl { dst, lhs, rhs } => self.bit_op(pc, dst.index(), lhs.index(), rhs.index(), 3),
            I::Shr { dst, lhs, rhs } => self.bit_op(pc, dst.index(), lhs.index(), rhs.index(), 4),
            I::Ushr { dst, lhs, rhs } => self.bit_op(pc, dst.index(), lhs.index(), rhs.index(), 5),
            I::BitNot { dst, src } => {
                let s = self.registers[src.index() as usize];
                let node = self.helper(HelperKind::BitNot, smallvec![s], [0, 0], pc);
                self.registers[dst.index() as usize] = node;
            }

            I::Lt { dst, lhs, rhs, ic } => self.speculative_compare(
                pc,
                dst.index(),
                lhs.index(),
                rhs.index(),
                *ic,
                CmpKind::Lt,
                HelperKind::Lt,
            ),
            I::Le { dst, lhs, rhs, ic } => self.speculative_compare(
                pc,
                dst.index(),
                lhs.index(),
                rhs.index(),
                *ic,
                CmpKind::Le,
                HelperKind::Le,
            ),
            I::Gt { dst, lhs, rhs, ic } => self.speculative_compare(
                pc,
                dst.index(),
                lhs.index(),
                rhs.index(),
                *ic,
                CmpKind::Gt,
                HelperKind::Gt,
            ),
            I::Ge { dst, lhs, rhs, ic } => self.speculative_compare(
                pc,
                dst.index(),
                lhs.index(),
                rhs.index(),
                *ic,
                CmpKind::Ge,
                HelperKind::Ge,
            ),
            I::StrictEq { dst, lhs, rhs, ic } => self.speculative_compare(
                pc,
                dst.index(),
                lhs.index(),
                rhs.index(),
                *ic,
                CmpKind::Eq,
                HelperKind::StrictEq,
            ),
            I::Eq { dst, lhs, rhs, ic } => {
                let l = self.registers[lhs.index() as usize];
                let r = self.registers[rhs.index() as usize];
                let node =
                    self.helper(HelperKind::Eq, smallvec![l, r], [ic.index() as i64, 0], pc);
                self.registers[dst.index() as usize] = node;
            }
            I::Ne { dst, lhs, rhs, ic } => {
                let l = self.registers[lhs.index() as usize];
                let r = self.registers[rhs.index() as usize];
                let eq =
                    self.helper(HelperKind::Eq, smallvec![l, r], [ic.index() as i64, 0], pc);
                let node = self.helper(HelperKind::Not, smallvec![eq], [0, 0], pc);
                self.registers[dst.index() as usize] = node;
            }
            I::StrictNe { dst, lhs, rhs, ic } => {
                let l = self.registers[lhs.index() as usize];
                let r = self.registers[rhs.index() as usize];
                let eq = self.helper(
                    HelperKind::StrictEq,
                    smallvec![l, r],
                    [ic.index() as i64, 0],
                    pc,
                );
                let node = self.helper(HelperKind::Not, smallvec![eq], [0, 0], pc);
                self.registers[dst.index() as usize] = node;
            }

            I::Not { dst, src } => {
                let s = self.registers[src.index() as usize];
                let node = self.helper(HelperKind::Not, smallvec![s], [0, 0], pc);
                self.registers[dst.index() as usize] = node;
            }
            I::TypeOf { dst, src } => {
                let s = self.registers[src.index() as usize];
                let node = self.helper(HelperKind::TypeOf, smallvec![s], [0, 0], pc);
                self.registers[dst.index() as usize] = node;
            }
            I::InstanceOf { dst, lhs, rhs } => {
                let l = self.registers[lhs.index() as usize];
                let r = self.registers[rhs.index() as usize];
                let node = self.helper(HelperKind::InstanceOf, smallvec![l, r], [0, 0], pc);
                self.registers[dst.index() as usize] = node;
            }
            I::In { dst, lhs, rhs } => {
                let l = self.registers[lhs.index() as usize];
                let r = self.registers[rhs.index() as usize];
                let node = self.helper(HelperKind::In, smallvec![l, r], [0, 0], pc);
                self.registers[dst.index() as usize] = node;
            }

            I::GetProp { dst, obj, name, ic } => {
                let receiver = self.registers[obj.index() as usize];
                if let Some((shape, offset)) = self.mono_property(*ic) {
                    let guarded = self.push_guard(
                        IrOp::GuardShape(shape),
                        smallvec![receiver],
                        pc,
                        "receiver-shape",
                        Some(*ic),
                    );
                    self.assumptions.push(Assumption::ShapeStable(shape));
                    let value = self.push_node(IrOp::LoadSlot(offset), smallvec![guarded], pc);
                    self.registers[dst.index() as usize] = value;
                } else {
                    let node = self.helper(
                        HelperKind::GetProp,
                        smallvec![receiver],
                        [name.index() as i64, ic.index() as i64],
                        pc,
                    );
                    self.registers[dst.index() as usize] = node;
                }
            }
            I::SetProp { obj, name, src, ic } => {
                let receiver = self.registers[obj.index() as usize];
                let value = self.registers[src.index() as usize];
                if let Some((shape, offset)) = self.mono_property(*ic) {
                    let guarded = self.push_guard(
                        IrOp::GuardShape(shape),
                        smallvec![receiver],
                        pc,
                        "receiver-shape",
                        Some(*ic),
                    );
                    self.assumptions.push(Assumption::ShapeStable(shape));
                    self.push_node(IrOp::StoreSlot(offset), smallvec![guarded, value], pc);
                } else {
                    let packed = ((name.index() as i64) << 16) | ic.index() as i64;
                    self.helper(HelperKind::SetProp, smallvec![receiver, value], [packed, 0], pc);
                }
            }
            I::GetElem { dst, obj, key, ic } => {
                let receiver = self.registers[obj.index() as usize];
                let key_node = self.registers[key.index() as usize];
                if self.smi_speculation(*ic) {
                    let garr = self.push_guard(
                        IrOp::GuardArray,
                        smallvec![receiver],
                        pc,
                        "array-receiver",
                        Some(*ic),
                    );
                    let gkey = self.push_guard(
                        IrOp::GuardInt32,
                        smallvec![key_node],
                        pc,
                        "smi-index",
                        Some(*ic),
                    );
                    let idx = self.push_node(IrOp::UnboxInt32, smallvec![gkey], pc);
                    let len = self.push_node(IrOp::ArrayLength, smallvec![garr], pc);
                    self.push_guard(
                        IrOp::GuardBounds,
                        smallvec![idx, len],
                        pc,
                        "in-bounds",
                        Some(*ic),
                    );
                    let value = self.push_node(IrOp::LoadElement, smallvec![garr, idx], pc);
                    self.registers[dst.index() as usize] = value;
                } else {
                    let node = self.helper(
                        HelperKind::GetElem,
                        smallvec![receiver, key_node],
                        [0, 0],
                        pc,
                    );
                    self.registers[dst.index() as usize] = node;
                }
            }
            I::SetElem { obj, key, src, ic: _ } => {
                let receiver = self.registers[obj.index() as usize];
                let key_node = self.registers[key.index() as usize];
                let value = self.registers[src.index() as usize];
                self.helper(
                    HelperKind::SetElem,
                    smallvec![receiver, key_node, value],
                    [0, 0],
                    pc,
                );
            }
            I::DeleteProp { dst, obj, key } => {
                let receiver = self.registers[obj.index() as usize];
                let key_node = self.registers[key.index() as usize];
                let node = self.helper(HelperKind::DeleteProp, smallvec![receiver, key_node], [0, 0], pc);
                self.registers[dst.index() as usize] = node;
            }
            I::NewObject { dst } => {
                let node = self.helper(HelperKind::NewObject, smallvec![], [-1, 0], pc);
                self.registers[dst.index() as usize] = node;
            }
            I::NewObjectSeeded { dst, seed } => {
                let node = self.helper(
                    HelperKind::NewObject,
                    smallvec![],
                    [seed.index() as i64, 0],
                    pc,
                );
                self.registers[dst.index() as usize] = node;
            }
            I::DefineDataProp { obj, name, src } => {
                let receiver = self.registers[obj.index() as usize];
                let value = self.registers[src.index() as usize];
                self.helper(
                    HelperKind::DefineDataProp,
                    smallvec![receiver, value],
                    [name.index() as i64, 0],
                    pc,
                );
            }
            I::NewArray { dst, capacity } => {
                let node = self.helper(
                    HelperKind::NewArray,
                    smallvec![],
                    [*capacity as i64, 0],
                    pc,
                );
                self.registers[dst.index() as usize] = node;
            }
            I::Closure { dst, func } => {
                let node = self.helper(
                    HelperKind::Closure,
                    smallvec![],
                    [func.index() as i64, 0],
                    pc,
                );
                self.registers[dst.index() as usize] = node;
            }

            I::Call { dst, callee, args, ic } => {
                let mut inputs: SmallVec<[NodeId; 2]> =
                    smallvec![self.registers[callee.index() as usize]];
                for arg in args {
                    inputs.push(self.registers[arg.index() as usize]);
                }
                let node = self.helper_call(HelperKind::Call, ic.index() as i64, inputs, pc);
                self.registers[dst.index() as usize] = node;
            }
            I::CallMethod {
                dst,
                obj,
                name,
                args,
                ic,
            } => {
                let mut inputs: SmallVec<[NodeId; 2]> =
                    smallvec![self.registers[obj.index() as usize]];
                for arg in args {
                    inputs.push(self.registers[arg.index() as usize]);
                }
                let packed = ((name.index() as i64) << 16) | ic.index() as i64;
                let node = self.helper_call(HelperKind::CallMethod, packed, inputs, pc);
                self.registers[dst.index() as usize] = node;
            }
            I::Construct {
                dst,
                callee,
                args,
                ic,
            } => {
                let mut inputs: SmallVec<[NodeId; 2]> =
                    smallvec![self.registers[callee.index() as usize]];
                for arg in args {
                    inputs.push(self.registers[arg.index() as usize]);
                }
                let node = self.helper_call(HelperKind::Construct, ic.index() as i64, inputs, pc);
                self.registers[dst.index() as usize] = node;
            }

            I::Return { src } => {
                let value = self.registers[src.index() as usize];
                self.ir.blocks[self.current.0 as usize].terminator =
                    Some(Terminator::Return(value));
            }
            I::ReturnUndefined => {
                let undef =
                    self.push_node(IrOp::Const(type_guards::TAG_UNDEFINED), smallvec![], pc);
                self.ir.blocks[self.current.0 as usize].terminator =
                    Some(Terminator::Return(undef));
            }
            I::Throw { src } => {
                let value = self.registers[src.index() as usize];
                let sentinel = self.helper(HelperKind::ThrowValue, smallvec![value], [0, 0], pc);
                self.ir.blocks[self.current.0 as usize].terminator =
                    Some(Terminator::Return(sentinel));
            }

            I::Jump { offset } => {
                let count = self.input.function.instructions.len();
                let target = target_pc(pc, offset.offset(), count)?;
                let block = self.block_for(target, count);
                let args = self.edge_args();
                self.ir.blocks[self.current.0 as usize].terminator =
                    Some(Terminator::Jump {
                        target: block,
                        args,
                    });
            }
            I::JumpIfTrue { cond, offset } => {
                let c = self.registers[cond.index() as usize];
                self.branch(pc, c, false, false, offset.offset())?;
            }
            I::JumpIfFalse { cond, offset } => {
                let c = self.registers[cond.index() as usize];
                self.branch(pc, c, false, true, offset.offset())?;
            }
            I::JumpIfNullish { cond, offset } => {
                let c = self.registers[cond.index() as usize];
                self.branch(pc, c, true, false, offset.offset())?;
            }

            I::GetIterator { dst, src } => {
                let s = self.registers[src.index() as usize];
                let node = self.helper(HelperKind::GetIterator, smallvec![s], [0, 0], pc);
                self.registers[dst.index() as usize] = node;
            }
            I::IteratorNext { dst, done, iter } => {
                let it = self.registers[iter.index() as usize];
                let node = self.helper(
                    HelperKind::IteratorNext,
                    smallvec![it],
                    [done.index() as i64, 0],
                    pc,
                );
                self.registers[dst.index() as usize] = node;
                // The helper writes the done flag straight into the frame
                // register; reload it into the abstract state.
                let done_node = self.helper(
                    HelperKind::LoadConst,
                    smallvec![],
                    [-3, done.index() as i64],
                    pc,
                );
                self.registers[done.index() as usize] = done_node;
            }

            I::TryStart { .. } | I::TryEnd | I::Catch { .. } | I::Await { .. } | I::Yield { .. } => {
                return Err(JitError::UnsupportedInstruction {
                    pc: pc as usize,
                    opcode: instruction.opcode().name(),
                });
            }
        }
        Ok(())
    }

    fn bit_op(&mut self, pc: u32, dst: u8, lhs: u8, rhs: u8, op: i64) {
        let l = self.registers[lhs as usize];
        let r = self.registers[rhs as usize];
        let node = self.helper(HelperKind::BitOp, smallvec![l, r], [op, 0], pc);
        self.registers[dst as usize] = node;
    }
}

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

fn written_locals(function: &Function) -> Vec<u16> {
    let mut written = FxHashSet::default();
    for instruction in &function.instructions {
        if let Instruction::SetLocal { idx, .. } = instruction {
            written.insert(idx.index());
        }
    }
    let mut out: Vec<u16> = written.into_iter().collect();
    out.sort_unstable();
    out
}

fn jump_offset(instruction: &Instruction) -> Option<i32> {
    match instruction {
        Instruction::Jump { offset }
        | Instruction::JumpIfTrue { offset, .. }
        | Instruction::JumpIfFalse { offset, .. }
        | Instruction::JumpIfNullish { offset, .. } => Some(offset.offset()),
        _ => None,
    }
}

/// Block heads: pc 0, every jump target, every post-terminator pc.
fn block_starts(function: &Function) -> Vec<u32> {
    let mut starts = FxHashSet::default();
    starts.insert(0u32);
    for (pc, instruction) in function.instructions.iter().enumerate() {
        if let Some(offset) = jump_offset(instruction) {
            let target = pc as i64 + offset as i64;
            if (0..function.instructions.len() as i64).contains(&target) {
                starts.insert(target as u32);
            }
        }
        if instruction.is_terminator() && pc + 1 < function.instructions.len() {
            starts.insert(pc as u32 + 1);
        }
    }
    let mut out: Vec<u32> = starts.into_iter().collect();
    out.sort_unstable();
    out
}

fn target_pc(pc: u32, offset: i32, count: usize) -> Result<u32, JitError> {
    let target = pc as i64 + offset as i64;
    if !(0..=count as i64).contains(&target) {
        return Err(JitError::InvalidJumpTarget {
            pc: pc as usize,
            offset,
            instruction_count: count,
        });
    }
    Ok(target as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use marten_bytecode::{FeedbackSlot, Function, Register, TypeFlags};

    fn add_function() -> Function {
        Function::builder()
            .register_count(3)
            .feedback_len(1)
            .instruction(Instruction::LoadInt8 {
                dst: Register(0),
                value: 1,
            })
            .instruction(Instruction::LoadInt8 {
                dst: Register(1),
                value: 2,
            })
            .instruction(Instruction::Add {
                dst: Register(2),
                lhs: Register(0),
                rhs: Register(1),
                ic: FeedbackIndex(0),
            })
            .instruction(Instruction::Return { src: Register(2) })
            .build()
    }

    fn smi_feedback() -> Vec<FeedbackSlot> {
        let mut slot = FeedbackSlot::default();
        slot.operand_types.insert(TypeFlags::SMI);
        vec![slot]
    }

    fn build_with(function: &Function, feedback: Vec<FeedbackSlot>) -> BuildOutput {
        build(&BuildInput {
            function,
            feedback,
            proto_epoch: 1,
            seed_tables: rustc_hash::FxHashMap::default(),
            constant_strings: rustc_hash::FxHashMap::default(),
        })
        .unwrap()
    }

    #[test]
    fn smi_feedback_produces_guarded_int_arithmetic() {
        let function = add_function();
        let output = build_with(&function, smi_feedback());
        let guards = output
            .ir
            .nodes
            .iter()
            .filter(|n| n.op == IrOp::GuardInt32)
            .count();
        assert_eq!(guards, 2, "one guard per operand");
        assert!(output.ir.nodes.iter().any(|n| n.op == IrOp::I32Add));
        // Each guard carries a frame state for its deopt point.
        for (id, node) in output.ir.nodes.iter().enumerate() {
            if node.op == IrOp::GuardInt32 {
                assert!(
                    output.ir.frame_states.contains_key(&NodeId(id as u32)),
                    "guard without frame state"
                );
                assert_eq!(node.speculation, Some("smi-operands"));
            }
        }
    }

    #[test]
    fn cold_feedback_stays_generic() {
        let function = add_function();
        let output = build_with(&function, vec![FeedbackSlot::default()]);
        assert!(!output.ir.nodes.iter().any(|n| n.op == IrOp::I32Add));
        assert!(output.ir.nodes.iter().any(|n| matches!(
            n.op,
            IrOp::Helper {
                kind: HelperKind::GenericAdd,
                ..
            }
        )));
    }

    #[test]
    fn forbidden_site_compiles_generic_despite_feedback() {
        let function = add_function();
        let mut feedback = smi_feedback();
        feedback[0].speculation_forbidden = true;
        let output = build_with(&function, feedback);
        assert!(!output.ir.nodes.iter().any(|n| n.op == IrOp::I32Add));
    }

    #[test]
    fn monomorphic_property_load_is_shape_checked() {
        let function = Function::builder()
            .register_count(2)
            .feedback_len(1)
            .instruction(Instruction::GetProp {
                dst: Register(1),
                obj: Register(0),
                name: marten_bytecode::ConstantIndex(0),
                ic: FeedbackIndex(0),
            })
            .instruction(Instruction::Return { src: Register(1) })
            .build();
        let mut slot = FeedbackSlot::default();
        slot.ic.state = InlineCacheState::Monomorphic { shape: 7, offset: 3 };
        slot.ic.proto_epoch = 1;
        let output = build_with(&function, vec![slot]);
        assert!(
            output
                .ir
                .nodes
                .iter()
                .any(|n| n.op == IrOp::GuardShape(7))
        );
        assert!(output.ir.nodes.iter().any(|n| n.op == IrOp::LoadSlot(3)));
        assert!(
            output
                .assumptions
                .contains(&Assumption::ShapeStable(7))
        );
    }

    #[test]
    fn suspension_points_are_rejected() {
        let function = Function::builder()
            .register_count(2)
            .instruction(Instruction::Yield {
                dst: Register(0),
                src: Register(1),
            })
            .build();
        let result = build(&BuildInput {
            function: &function,
            feedback: vec![],
            proto_epoch: 1,
            seed_tables: rustc_hash::FxHashMap::default(),
            constant_strings: rustc_hash::FxHashMap::default(),
        });
        assert!(matches!(
            result,
            Err(JitError::UnsupportedInstruction { .. })
        ));
    }
}
