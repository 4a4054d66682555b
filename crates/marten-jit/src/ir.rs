//! Optimizing-tier IR: CFG of basic blocks in SSA form.
//!
//! Nodes are single-assignment and referenced by [`NodeId`]; control joins
//! carry the full abstract frame (locals then registers) as block
//! parameters, except that provably never-written slots bind to their entry
//! definition globally, which keeps them loop-invariant for LICM. Guard
//! nodes carry a speculation label and a frame-state snapshot for their
//! deopt point.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use marten_bytecode::FeedbackIndex;

use crate::helpers::HelperKind;

/// Index of an IR node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct NodeId(pub u32);

/// Index of a basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct BlockId(pub u32);

/// Comparison kinds for unboxed int32 compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpKind {
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `===` on int32s
    Eq,
}

/// Node operations.
///
/// "boxed" operands/results are NaN-boxed bits; "unboxed" are raw i64
/// holding an int32. Guards deopt through their attached frame state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IrOp {
    /// Boxed constant bits.
    Const(i64),
    /// Unboxed int32 constant.
    Int32Const(i32),
    /// Block parameter `n` of the owning block.
    BlockParam(u16),
    /// Initial value of local `n` on function entry.
    EntryLocal(u16),
    /// Box an unboxed int32.
    BoxInt32,
    /// Unbox a boxed int32 (input must be guarded).
    UnboxInt32,
    /// Unboxed add; deopts on overflow.
    I32Add,
    /// Unboxed subtract; deopts on overflow.
    I32Sub,
    /// Unboxed multiply; deopts on overflow.
    I32Mul,
    /// Unboxed shift-left by a constant (strength-reduced multiply).
    I32ShlConst(u8),
    /// Unboxed compare producing a boxed boolean.
    I32Cmp(CmpKind),
    /// Deopt unless the input is int32-tagged; passes the value through.
    GuardInt32,
    /// Deopt unless the input object has the given shape id.
    GuardShape(u32),
    /// Deopt unless the input is an array object.
    GuardArray,
    /// Deopt unless `0 <= index < length` (both unboxed).
    GuardBounds,
    /// Shape-checked in-object slot load (boxed result).
    LoadSlot(u32),
    /// Shape-checked in-object slot store; inputs `[obj, value]`.
    StoreSlot(u32),
    /// Array length as unboxed int32; input `[obj]`.
    ArrayLength,
    /// In-bounds element load; inputs `[obj, index(unboxed)]`.
    LoadElement,
    /// Generic helper call; inputs are boxed values, immediates follow.
    Helper {
        /// Which helper.
        kind: HelperKind,
        /// Up to two immediate operands (constant indices, feedback slots).
        imm: [i64; 2],
    },
    /// Call-shaped helper; inputs `[target, args...]`, spilled to scratch.
    HelperCall {
        /// Which helper (Call / CallMethod / Construct).
        kind: HelperKind,
        /// Immediate operand (packed name/ic or ic).
        imm: i64,
    },
    /// Placeholder for a scalar-replaced allocation; inputs are its field
    /// values in key order. Never lowered; only deopt exits look at it.
    ScalarObject {
        /// Materialization descriptor index.
        descriptor: u32,
    },
}

impl IrOp {
    /// Pure nodes are eligible for CSE and dead-code elimination.
    pub fn is_pure(&self) -> bool {
        matches!(
            self,
            Self::Const(_)
                | Self::Int32Const(_)
                | Self::BlockParam(_)
                | Self::EntryLocal(_)
                | Self::BoxInt32
                | Self::UnboxInt32
                | Self::I32Cmp(_)
                | Self::ScalarObject { .. }
        )
    }

    /// Guards and effectful operations must not be removed by DCE.
    pub fn is_guard(&self) -> bool {
        matches!(
            self,
            Self::GuardInt32 | Self::GuardShape(_) | Self::GuardArray | Self::GuardBounds
        ) || matches!(
            self,
            Self::I32Add | Self::I32Sub | Self::I32Mul | Self::I32ShlConst(_)
        )
        // Overflowing int ops deopt, so they are guards too.
    }
}

/// Frame state captured at a guard: how to rebuild the interpreter frame if
/// the guard fails (resume re-executes the guarded instruction).
///
/// `None` local entries are already memory-resident (cell-mediated locals
/// commit on every write), so the deopt exit has nothing to spill for them.
#[derive(Debug, Clone, Default)]
pub struct FrameState {
    /// Value of every local slot; `None` when live in the frame array.
    pub locals: Vec<Option<NodeId>>,
    /// Registers with known values at this point.
    pub registers: Vec<(u8, NodeId)>,
}

/// One IR node.
#[derive(Debug, Clone)]
pub struct IrNode {
    /// Operation.
    pub op: IrOp,
    /// Value inputs.
    pub inputs: SmallVec<[NodeId; 2]>,
    /// Bytecode pc this node derives from.
    pub bc_pc: u32,
    /// Speculation label for guards ("smi-operands", "receiver-shape", ...).
    pub speculation: Option<&'static str>,
    /// Feedback slot backing the speculation (per-site exit counters).
    pub ic: Option<FeedbackIndex>,
}

/// Block terminator.
#[derive(Debug, Clone)]
pub enum Terminator {
    /// Unconditional edge.
    Jump {
        /// Target block.
        target: BlockId,
        /// Frame-state arguments.
        args: Vec<NodeId>,
    },
    /// Two-way branch on a boxed condition.
    Branch {
        /// Condition node (boxed value).
        cond: NodeId,
        /// Truthiness (JumpIfTrue/False) or nullish test.
        nullish: bool,
        /// Taken when the test is true.
        then_target: BlockId,
        /// Arguments for the taken edge.
        then_args: Vec<NodeId>,
        /// Fallthrough.
        else_target: BlockId,
        /// Arguments for the fallthrough edge.
        else_args: Vec<NodeId>,
    },
    /// Return a boxed value.
    Return(NodeId),
}

/// One basic block.
#[derive(Debug, Clone)]
pub struct IrBlock {
    /// Number of block parameters (mutable frame slots).
    pub param_count: u16,
    /// Nodes in execution order.
    pub nodes: Vec<NodeId>,
    /// Terminator; `None` only during construction.
    pub terminator: Option<Terminator>,
    /// Bytecode pc of the block head.
    pub bc_start: u32,
    /// Targets of backward jumps are loop headers (LICM, OSR).
    pub is_loop_header: bool,
}

/// A function in IR form.
#[derive(Debug, Default)]
pub struct IrFunction {
    /// Node arena.
    pub nodes: Vec<IrNode>,
    /// Blocks in layout order; block 0 is the entry.
    pub blocks: Vec<IrBlock>,
    /// Frame states for guard nodes.
    pub frame_states: FxHashMap<NodeId, FrameState>,
    /// Scalar-replacement recipes referenced by `ScalarObject`.
    pub materializations: Vec<crate::deopt::MaterializeDescriptor>,
    /// Local slots (frame layout).
    pub local_count: u16,
    /// Register slots (frame layout).
    pub register_count: u8,
    /// Locals carried as block params, in canonical edge-argument order.
    pub written_locals: Vec<u16>,
    /// Shape-seed property lists by constant index (scalar replacement).
    pub seed_tables: FxHashMap<u32, Vec<String>>,
    /// String constants by index (scalar replacement key matching).
    pub constant_strings: FxHashMap<u32, String>,
}

impl IrFunction {
    /// Append a node to a block, returning its id.
    pub fn push(&mut self, block: BlockId, node: IrNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        self.blocks[block.0 as usize].nodes.push(id);
        id
    }

    /// The node behind an id.
    pub fn node(&self, id: NodeId) -> &IrNode {
        &self.nodes[id.0 as usize]
    }

    /// Mutable node access.
    pub fn node_mut(&mut self, id: NodeId) -> &mut IrNode {
        &mut self.nodes[id.0 as usize]
    }

    /// Allocate an empty block.
    pub fn new_block(&mut self, bc_start: u32) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(IrBlock {
            param_count: 0,
            nodes: Vec::new(),
            terminator: None,
            bc_start,
            is_loop_header: false,
        });
        id
    }

    /// Count uses of every node (terminators included).
    pub fn use_counts(&self) -> Vec<u32> {
        let mut counts = vec![0u32; self.nodes.len()];
        for node in &self.nodes {
            for input in &node.inputs {
                counts[input.0 as usize] += 1;
            }
        }
        for block in &self.blocks {
            match &block.terminator {
                Some(Terminator::Jump { args, .. }) => {
                    for arg in args {
                        counts[arg.0 as usize] += 1;
                    }
                }
                Some(Terminator::Branch {
                    cond,
                    then_args,
                    else_args,
                    ..
                }) => {
                    counts[cond.0 as usize] += 1;
                    for arg in then_args.iter().chain(else_args.iter()) {
                        counts[arg.0 as usize] += 1;
                    }
                }
                Some(Terminator::Return(value)) => counts[value.0 as usize] += 1,
                None => {}
            }
        }
        for state in self.frame_states.values() {
            for local in state.locals.iter().flatten() {
                counts[local.0 as usize] += 1;
            }
            for (_, reg) in &state.registers {
                counts[reg.0 as usize] += 1;
            }
        }
        counts
    }
}
