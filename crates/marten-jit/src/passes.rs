//! Optimizing-tier pass pipeline.
//!
//! Order matters: folding exposes CSE opportunities, CSE (which subsumes
//! redundant-guard elimination) exposes dead code, LICM runs before DCE so
//! hoisted chains keep their uses. All passes preserve guard/deopt
//! semantics: a guard is only removed when an equivalent dominating guard
//! remains or its condition is proven at compile time.

use rustc_hash::FxHashMap;

use crate::deopt::MaterializeDescriptor;
use crate::helpers::HelperKind;
use crate::ir::{BlockId, FrameState, IrFunction, IrOp, NodeId, Terminator};
use crate::type_guards;

/// Run the full pipeline.
pub fn run(ir: &mut IrFunction) {
    fold_constants(ir);
    value_numbering(ir);
    strength_reduce(ir);
    licm(ir);
    simplify_branches(ir);
    scalar_replace(ir);
    eliminate_bounds_checks(ir);
    dce(ir);
}

/// Rewrite every node input, terminator and frame state through `map`.
fn apply_replacements(ir: &mut IrFunction, map: &FxHashMap<NodeId, NodeId>) {
    if map.is_empty() {
        return;
    }
    let resolve = |mut id: NodeId| {
        while let Some(&next) = map.get(&id) {
            id = next;
        }
        id
    };
    for node in &mut ir.nodes {
        for input in &mut node.inputs {
            *input = resolve(*input);
        }
    }
    for block in &mut ir.blocks {
        match &mut block.terminator {
            Some(Terminator::Jump { args, .. }) => {
                for arg in args {
                    *arg = resolve(*arg);
                }
            }
            Some(Terminator::Branch {
                cond,
                then_args,
                else_args,
                ..
            }) => {
                *cond = resolve(*cond);
                for arg in then_args.iter_mut().chain(else_args.iter_mut()) {
                    *arg = resolve(*arg);
                }
            }
            Some(Terminator::Return(value)) => *value = resolve(*value),
            None => {}
        }
        block.nodes.retain(|id| !map.contains_key(id));
    }
    for state in ir.frame_states.values_mut() {
        for local in state.locals.iter_mut().flatten() {
            *local = resolve(*local);
        }
        for (_, reg) in state.registers.iter_mut() {
            *reg = resolve(*reg);
        }
    }
}

fn int32_const_of(ir: &IrFunction, id: NodeId) -> Option<i32> {
    match ir.node(id).op {
        IrOp::Int32Const(v) => Some(v),
        IrOp::Const(bits) => {
            if bits & type_guards::INT32_TAG_MASK == type_guards::TAG_INT32 {
                Some(bits as u32 as i32)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Constant folding: boxed/unboxed conversions and int arithmetic over
/// known operands; proven guards collapse to their input.
fn fold_constants(ir: &mut IrFunction) {
    let mut replacements: FxHashMap<NodeId, NodeId> = FxHashMap::default();
    for idx in 0..ir.nodes.len() {
        let id = NodeId(idx as u32);
        let node = ir.node(id);
        let folded = match &node.op {
            IrOp::UnboxInt32 => int32_const_of(ir, node.inputs[0]).map(IrOp::Int32Const),
            IrOp::BoxInt32 => int32_const_of(ir, node.inputs[0])
                .map(|v| IrOp::Const(type_guards::TAG_INT32 | (v as u32 as i64))),
            IrOp::GuardInt32 => {
                // Statically int32-tagged: the guard can never fail.
                if int32_const_of(ir, node.inputs[0]).is_some() {
                    replacements.insert(id, node.inputs[0]);
                    ir.frame_states.remove(&id);
                    continue;
                }
                None
            }
            IrOp::I32Add => {
                match (
                    int32_const_of(ir, node.inputs[0]),
                    int32_const_of(ir, node.inputs[1]),
                ) {
                    (Some(a), Some(b)) => a.checked_add(b).map(IrOp::Int32Const),
                    _ => None,
                }
            }
            IrOp::I32Sub => {
                match (
                    int32_const_of(ir, node.inputs[0]),
                    int32_const_of(ir, node.inputs[1]),
                ) {
                    (Some(a), Some(b)) => a.checked_sub(b).map(IrOp::Int32Const),
                    _ => None,
                }
            }
            IrOp::I32Mul => {
                match (
                    int32_const_of(ir, node.inputs[0]),
                    int32_const_of(ir, node.inputs[1]),
                ) {
                    (Some(a), Some(b)) => a.checked_mul(b).map(IrOp::Int32Const),
                    _ => None,
                }
            }
            IrOp::I32Cmp(kind) => {
                match (
                    int32_const_of(ir, node.inputs[0]),
                    int32_const_of(ir, node.inputs[1]),
                ) {
                    (Some(a), Some(b)) => {
                        use crate::ir::CmpKind::*;
                        let result = match kind {
                            Lt => a < b,
                            Le => a <= b,
                            Gt => a > b,
                            Ge => a >= b,
                            Eq => a == b,
                        };
                        Some(IrOp::Const(if result {
                            type_guards::TAG_TRUE
                        } else {
                            type_guards::TAG_FALSE
                        }))
                    }
                    _ => None,
                }
            }
            _ => None,
        };
        if let Some(op) = folded {
            let node = ir.node_mut(id);
            node.op = op;
            node.inputs.clear();
            node.speculation = None;
            ir.frame_states.remove(&id);
        }
    }
    apply_replacements(ir, &replacements);
}

/// Block-local value numbering over pure nodes and guards.
///
/// Reusing an earlier identical guard is redundant-guard elimination. The
/// guard table resets at effectful nodes: a helper can mutate shapes.
fn value_numbering(ir: &mut IrFunction) {
    let mut replacements: FxHashMap<NodeId, NodeId> = FxHashMap::default();
    for block_idx in 0..ir.blocks.len() {
        let node_ids = ir.blocks[block_idx].nodes.clone();
        let mut pure_table: FxHashMap<(IrOp, Vec<NodeId>), NodeId> = FxHashMap::default();
        let mut guard_table: FxHashMap<(IrOp, Vec<NodeId>), NodeId> = FxHashMap::default();
        for id in node_ids {
            if replacements.contains_key(&id) {
                continue;
            }
            let node = ir.node(id);
            let resolve = |nid: NodeId| *replacements.get(&nid).unwrap_or(&nid);
            let inputs: Vec<NodeId> = node.inputs.iter().map(|&i| resolve(i)).collect();
            let key = (node.op.clone(), inputs);
            if node.op.is_pure() && !matches!(node.op, IrOp::BlockParam(_) | IrOp::ScalarObject { .. })
            {
                if let Some(&existing) = pure_table.get(&key) {
                    replacements.insert(id, existing);
                } else {
                    pure_table.insert(key, id);
                }
            } else if matches!(
                node.op,
                IrOp::GuardInt32 | IrOp::GuardShape(_) | IrOp::GuardArray | IrOp::GuardBounds
            ) {
                if let Some(&existing) = guard_table.get(&key) {
                    replacements.insert(id, existing);
                    ir.frame_states.remove(&id);
                } else {
                    guard_table.insert(key, id);
                }
            } else if matches!(
                node.op,
                IrOp::Helper { .. } | IrOp::HelperCall { .. } | IrOp::StoreSlot(_)
            ) {
                // Shapes may have changed under us.
                guard_table.clear();
            }
        }
    }
    apply_replacements(ir, &replacements);
}

/// `x * 2^k` becomes a checked shift.
fn strength_reduce(ir: &mut IrFunction) {
    for idx in 0..ir.nodes.len() {
        let id = NodeId(idx as u32);
        let node = ir.node(id);
        if node.op != IrOp::I32Mul {
            continue;
        }
        let (value, constant) = (node.inputs[0], node.inputs[1]);
        let by = int32_const_of(ir, constant)
            .or_else(|| int32_const_of(ir, value))
            .filter(|v| *v > 0 && (*v as u32).is_power_of_two());
        if let Some(by) = by {
            let shift = (by as u32).trailing_zeros() as u8;
            let kept = if int32_const_of(ir, constant) == Some(by) {
                value
            } else {
                constant
            };
            let node = ir.node_mut(id);
            node.op = IrOp::I32ShlConst(shift);
            node.inputs.clear();
            node.inputs.push(kept);
        }
    }
}

/// Hoist loop-invariant guards (and their pure input chains) from loop
/// headers into the preheader.
fn licm(ir: &mut IrFunction) {
    let block_of = node_blocks(ir);
    for header_idx in 0..ir.blocks.len() {
        if !ir.blocks[header_idx].is_loop_header {
            continue;
        }
        let header = BlockId(header_idx as u32);
        // Preheader: the unique forward predecessor; loop body: the blocks
        // between header and the farthest back edge (layout is structured).
        let mut preheader = None;
        let mut loop_end = header_idx;
        for (pred_idx, block) in ir.blocks.iter().enumerate() {
            let targets = terminator_targets(block.terminator.as_ref());
            if targets.contains(&header) {
                if pred_idx < header_idx {
                    if preheader.is_some() {
                        preheader = None; // multiple entries: give up
                        break;
                    }
                    preheader = Some(BlockId(pred_idx as u32));
                } else {
                    loop_end = loop_end.max(pred_idx);
                }
            }
        }
        let Some(preheader) = preheader else { continue };
        if loop_end == header_idx {
            continue;
        }

        let in_loop = |id: NodeId| {
            let b = block_of[id.0 as usize];
            (header_idx..=loop_end).contains(&(b.0 as usize))
        };
        let invariant = |ir: &IrFunction, id: NodeId| {
            !in_loop(id)
                || matches!(ir.node(id).op, IrOp::Const(_) | IrOp::Int32Const(_) | IrOp::EntryLocal(_))
        };

        let header_nodes = ir.blocks[header_idx].nodes.clone();
        let mut hoisted = Vec::new();
        for id in header_nodes {
            let node = ir.node(id);
            let hoistable = matches!(
                node.op,
                IrOp::GuardInt32 | IrOp::GuardShape(_) | IrOp::GuardArray
            ) && node.inputs.iter().all(|&input| invariant(ir, input));
            if hoistable {
                hoisted.push(id);
            }
        }
        if hoisted.is_empty() {
            continue;
        }
        // Rebuild the hoisted guards' frame states from the preheader's
        // outgoing edge: those values dominate the new location. A
        // preheader ending in a branch gives no clean state; skip then.
        let Some(preheader_state) = edge_frame_state(ir, preheader) else {
            continue;
        };
        for &id in &hoisted {
            // In-loop constant inputs move along so uses stay dominated.
            let inputs: Vec<NodeId> = ir.node(id).inputs.to_vec();
            for input in inputs {
                if in_loop(input)
                    && matches!(ir.node(input).op, IrOp::Const(_) | IrOp::Int32Const(_))
                    && ir.blocks[header_idx].nodes.contains(&input)
                {
                    ir.blocks[header_idx].nodes.retain(|n| *n != input);
                    ir.blocks[preheader.0 as usize].nodes.push(input);
                }
            }
            ir.blocks[header_idx].nodes.retain(|n| *n != id);
            ir.blocks[preheader.0 as usize].nodes.push(id);
            ir.frame_states.insert(id, preheader_state.clone());
        }
    }
}

/// Frame state equivalent to a block's outgoing jump arguments.
fn edge_frame_state(ir: &IrFunction, block: BlockId) -> Option<FrameState> {
    let Some(Terminator::Jump { args, .. }) = &ir.blocks[block.0 as usize].terminator else {
        return None;
    };
    let written = &ir.written_locals;
    let mut locals = vec![None; ir.local_count as usize];
    for (slot, &local) in written.iter().enumerate() {
        locals[local as usize] = Some(args[slot]);
    }
    let registers = (0..ir.register_count as usize)
        .map(|r| (r as u8, args[written.len() + r]))
        .collect();
    Some(FrameState { locals, registers })
}

fn node_blocks(ir: &IrFunction) -> Vec<BlockId> {
    let mut map = vec![BlockId(0); ir.nodes.len()];
    for (block_idx, block) in ir.blocks.iter().enumerate() {
        for &id in &block.nodes {
            map[id.0 as usize] = BlockId(block_idx as u32);
        }
    }
    map
}

fn terminator_targets(terminator: Option<&Terminator>) -> Vec<BlockId> {
    match terminator {
        Some(Terminator::Jump { target, .. }) => vec![*target],
        Some(Terminator::Branch {
            then_target,
            else_target,
            ..
        }) => vec![*then_target, *else_target],
        _ => Vec::new(),
    }
}

/// Branches on compile-time constants become jumps.
fn simplify_branches(ir: &mut IrFunction) {
    for block in &mut ir.blocks {
        let Some(Terminator::Branch {
            cond,
            nullish,
            then_target,
            then_args,
            else_target,
            else_args,
        }) = block.terminator.clone()
        else {
            continue;
        };
        let decided = match ir.nodes[cond.0 as usize].op {
            IrOp::Const(bits) if bits == type_guards::TAG_TRUE => Some(!nullish),
            IrOp::Const(bits) if bits == type_guards::TAG_FALSE => Some(nullish && false),
            IrOp::Const(bits)
                if bits == type_guards::TAG_UNDEFINED
                    || bits == type_guards::TAG_UNDEFINED + 1 =>
            {
                Some(nullish)
            }
            _ => None,
        };
        if let Some(taken) = decided {
            block.terminator = Some(if taken {
                Terminator::Jump {
                    target: then_target,
                    args: then_args,
                }
            } else {
                Terminator::Jump {
                    target: else_target,
                    args: else_args,
                }
            });
        }
    }
}

/// Escape analysis + scalar replacement for single-block object literals.
///
/// A seeded literal whose only uses are data-property definitions, shape-
/// checked slot loads, and frame states never materializes: loads become
/// the stored values, and frame states get a `ScalarObject` placeholder
/// with a materialization recipe for the deoptimizer.
fn scalar_replace(ir: &mut IrFunction) {
    let block_of = node_blocks(ir);
    let use_sites = collect_use_sites(ir);

    for idx in 0..ir.nodes.len() {
        let alloc_id = NodeId(idx as u32);
        let IrOp::Helper {
            kind: HelperKind::NewObject,
            imm,
        } = ir.node(alloc_id).op
        else {
            continue;
        };
        if imm[0] < 0 {
            continue; // unseeded literal: field order unknown
        }
        let Some(keys) = ir.seed_tables.get(&(imm[0] as u32)).cloned() else {
            continue;
        };
        let home = block_of[alloc_id.0 as usize];

        // Classify uses: defines, guards-feeding-loads, frame states only.
        let Some(users) = use_sites.get(&alloc_id) else {
            continue;
        };
        let mut defines = Vec::new();
        let mut guards = Vec::new();
        let mut sound = true;
        for &user in users {
            let node = ir.node(user);
            match &node.op {
                IrOp::Helper {
                    kind: HelperKind::DefineDataProp,
                    ..
                } if node.inputs[0] == alloc_id && block_of[user.0 as usize] == home => {
                    defines.push(user);
                }
                IrOp::GuardShape(_) if block_of[user.0 as usize] == home => {
                    let loads_only = use_sites
                        .get(&user)
                        .is_some_and(|us| us.iter().all(|&u| matches!(ir.node(u).op, IrOp::LoadSlot(_))));
                    if loads_only {
                        guards.push(user);
                    } else {
                        sound = false;
                    }
                }
                _ => sound = false,
            }
        }
        if !sound || escapes_via_edges(ir, alloc_id) {
            continue;
        }

        // Walk the home block in order, tracking field values.
        let descriptor = ir.materializations.len() as u32;
        ir.materializations.push(MaterializeDescriptor {
            keys: keys.clone(),
            field_scratch: Vec::new(), // assigned at lowering
        });
        let undefined_node = ir.push(
            home,
            crate::ir::IrNode {
                op: IrOp::Const(type_guards::TAG_UNDEFINED),
                inputs: smallvec::smallvec![],
                bc_pc: ir.node(alloc_id).bc_pc,
                speculation: None,
                ic: None,
            },
        );
        // Keep the synthetic constant ahead of every use.
        let home_block = &mut ir.blocks[home.0 as usize];
        let popped = home_block.nodes.pop();
        debug_assert_eq!(popped, Some(undefined_node));
        let alloc_pos = home_block
            .nodes
            .iter()
            .position(|&n| n == alloc_id)
            .expect("alloc in home block");
        home_block.nodes.insert(alloc_pos, undefined_node);

        let mut fields: Vec<NodeId> = vec![undefined_node; keys.len()];
        let mut replacements: FxHashMap<NodeId, NodeId> = FxHashMap::default();
        let order = ir.blocks[home.0 as usize].nodes.clone();
        let mut scalar_at: FxHashMap<NodeId, Vec<NodeId>> = FxHashMap::default();
        for id in order {
            let node = ir.node(id);
            if defines.contains(&id) {
                let name_idx = match node.op {
                    IrOp::Helper { imm, .. } => imm[0] as u32,
                    _ => unreachable!(),
                };
                let key = ir.constant_strings.get(&name_idx).cloned().unwrap_or_default();
                if let Some(offset) = keys.iter().position(|k| *k == key) {
                    fields[offset] = node.inputs[1];
                }
            } else if guards.contains(&id) {
                replacements.insert(id, alloc_id); // loads re-point below
            } else if let IrOp::LoadSlot(offset) = node.op {
                if guards.contains(&node.inputs[0])
                    && (offset as usize) < fields.len()
                {
                    replacements.insert(id, fields[offset as usize]);
                }
            }
            if ir.frame_states.contains_key(&id) {
                scalar_at.insert(id, fields.clone());
            }
        }

        // Frame states that carried the allocation now carry a scalar
        // placeholder snapshotting the fields at that point.
        for (at, snapshot) in scalar_at {
            let state_mentions = ir
                .frame_states
                .get(&at)
                .is_some_and(|s| {
                    s.locals.iter().flatten().any(|&n| n == alloc_id)
                        || s.registers.iter().any(|(_, n)| *n == alloc_id)
                });
            if !state_mentions {
                continue;
            }
            let scalar = ir.push(
                home,
                crate::ir::IrNode {
                    op: IrOp::ScalarObject { descriptor },
                    inputs: snapshot.into_iter().collect(),
                    bc_pc: ir.node(at).bc_pc,
                    speculation: None,
                    ic: None,
                },
            );
            // Order the placeholder right before its frame-state owner.
            let home_block = &mut ir.blocks[home.0 as usize];
            home_block.nodes.pop();
            let at_pos = home_block
                .nodes
                .iter()
                .position(|&n| n == at)
                .expect("owner in home block");
            home_block.nodes.insert(at_pos, scalar);
            let state = ir.frame_states.get_mut(&at).expect("checked above");
            for local in state.locals.iter_mut().flatten() {
                if *local == alloc_id {
                    *local = scalar;
                }
            }
            for (_, reg) in state.registers.iter_mut() {
                if *reg == alloc_id {
                    *reg = scalar;
                }
            }
        }

        // Drop the allocation, its defines and guards from the block.
        let home_block = &mut ir.blocks[home.0 as usize];
        home_block
            .nodes
            .retain(|n| *n != alloc_id && !defines.contains(n) && !guards.contains(n));
        for guard in &guards {
            ir.frame_states.remove(guard);
            replacements.remove(guard);
        }
        apply_replacements(ir, &replacements);
    }
}

/// True when the allocation flows into any control-flow edge or remaining
/// frame state we cannot rewrite (conservative escape test).
fn escapes_via_edges(ir: &IrFunction, id: NodeId) -> bool {
    for block in &ir.blocks {
        match &block.terminator {
            Some(Terminator::Jump { args, .. }) => {
                if args.contains(&id) {
                    return true;
                }
            }
            Some(Terminator::Branch {
                cond,
                then_args,
                else_args,
                ..
            }) => {
                if *cond == id || then_args.contains(&id) || else_args.contains(&id) {
                    return true;
                }
            }
            Some(Terminator::Return(value)) => {
                if *value == id {
                    return true;
                }
            }
            None => {}
        }
    }
    false
}

fn collect_use_sites(ir: &IrFunction) -> FxHashMap<NodeId, Vec<NodeId>> {
    let mut sites: FxHashMap<NodeId, Vec<NodeId>> = FxHashMap::default();
    for (idx, node) in ir.nodes.iter().enumerate() {
        for &input in &node.inputs {
            sites.entry(input).or_default().push(NodeId(idx as u32));
        }
    }
    sites
}

/// Range analysis over unboxed int nodes plus single-predecessor branch
/// refinement; bounds guards whose index is proven in `[0, len)` go away.
fn eliminate_bounds_checks(ir: &mut IrFunction) {
    #[derive(Clone, Copy)]
    struct Range {
        min: i64,
        max: i64,
    }
    let mut ranges: FxHashMap<NodeId, Range> = FxHashMap::default();
    for (idx, node) in ir.nodes.iter().enumerate() {
        let id = NodeId(idx as u32);
        match node.op {
            IrOp::Int32Const(v) => {
                ranges.insert(
                    id,
                    Range {
                        min: v as i64,
                        max: v as i64,
                    },
                );
            }
            IrOp::I32Add => {
                if let (Some(a), Some(b)) = (
                    ranges.get(&node.inputs[0]).copied(),
                    ranges.get(&node.inputs[1]).copied(),
                ) {
                    ranges.insert(
                        id,
                        Range {
                            min: a.min + b.min,
                            max: a.max + b.max,
                        },
                    );
                }
            }
            _ => {}
        }
    }

    // Per-block facts: `idx < len` on the true edge of a dominating compare
    // when that edge is the block's only entry.
    let mut proven: Vec<(NodeId, NodeId)> = Vec::new(); // (idx, len) pairs
    for (block_idx, block) in ir.blocks.iter().enumerate() {
        let mut preds = Vec::new();
        for other in &ir.blocks {
            if terminator_targets(other.terminator.as_ref())
                .contains(&BlockId(block_idx as u32))
            {
                preds.push(other);
            }
        }
        if preds.len() != 1 {
            continue;
        }
        if let Some(Terminator::Branch {
            cond, then_target, ..
        }) = &preds[0].terminator
            && then_target.0 as usize == block_idx
            && let IrOp::I32Cmp(crate::ir::CmpKind::Lt) = ir.node(*cond).op
        {
            let cmp = ir.node(*cond);
            for &guard_id in &block.nodes {
                let guard = ir.node(guard_id);
                if guard.op == IrOp::GuardBounds
                    && guard.inputs[0] == cmp.inputs[0]
                    && guard.inputs[1] == cmp.inputs[1]
                {
                    let nonneg = ranges
                        .get(&guard.inputs[0])
                        .is_some_and(|r| r.min >= 0);
                    if nonneg {
                        proven.push((guard.inputs[0], guard.inputs[1]));
                    }
                }
            }
        }
    }
    if proven.is_empty() {
        return;
    }
    let mut removed = Vec::new();
    for (idx, node) in ir.nodes.iter().enumerate() {
        if node.op == IrOp::GuardBounds
            && proven
                .iter()
                .any(|(i, l)| *i == node.inputs[0] && *l == node.inputs[1])
        {
            removed.push(NodeId(idx as u32));
        }
    }
    for block in &mut ir.blocks {
        block.nodes.retain(|n| !removed.contains(n));
    }
    for id in removed {
        ir.frame_states.remove(&id);
    }
}

/// Remove unused pure nodes (guards and effectful nodes always stay).
fn dce(ir: &mut IrFunction) {
    loop {
        let counts = ir.use_counts();
        let dead: Vec<bool> = ir
            .nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| {
                node.op.is_pure()
                    && !matches!(node.op, IrOp::BlockParam(_))
                    && counts[idx] == 0
            })
            .collect();
        let mut any = false;
        for block in &mut ir.blocks {
            let before = block.nodes.len();
            block.nodes.retain(|&id| !dead[id.0 as usize]);
            any |= block.nodes.len() != before;
        }
        if !any {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CmpKind, IrNode};
    use smallvec::smallvec;

    fn node(op: IrOp, inputs: &[NodeId]) -> IrNode {
        IrNode {
            op,
            inputs: inputs.iter().copied().collect(),
            bc_pc: 0,
            speculation: None,
            ic: None,
        }
    }

    fn single_block_ir() -> (IrFunction, BlockId) {
        let mut ir = IrFunction::default();
        let block = ir.new_block(0);
        (ir, block)
    }

    #[test]
    fn folds_int_arithmetic() {
        let (mut ir, b) = single_block_ir();
        let two = ir.push(b, node(IrOp::Int32Const(2), &[]));
        let three = ir.push(b, node(IrOp::Int32Const(3), &[]));
        let sum = ir.push(b, node(IrOp::I32Add, &[two, three]));
        let boxed = ir.push(b, node(IrOp::BoxInt32, &[sum]));
        ir.blocks[b.0 as usize].terminator = Some(Terminator::Return(boxed));

        fold_constants(&mut ir);
        assert_eq!(ir.node(sum).op, IrOp::Int32Const(5));
        assert_eq!(
            ir.node(boxed).op,
            IrOp::Const(type_guards::TAG_INT32 | 5)
        );
    }

    #[test]
    fn folds_comparisons_and_simplifies_branch() {
        let (mut ir, b) = single_block_ir();
        let then_block = ir.new_block(1);
        let else_block = ir.new_block(2);
        let one = ir.push(b, node(IrOp::Int32Const(1), &[]));
        let two = ir.push(b, node(IrOp::Int32Const(2), &[]));
        let cmp = ir.push(b, node(IrOp::I32Cmp(CmpKind::Lt), &[one, two]));
        ir.blocks[b.0 as usize].terminator = Some(Terminator::Branch {
            cond: cmp,
            nullish: false,
            then_target: then_block,
            then_args: vec![],
            else_target: else_block,
            else_args: vec![],
        });

        fold_constants(&mut ir);
        simplify_branches(&mut ir);
        match &ir.blocks[b.0 as usize].terminator {
            Some(Terminator::Jump { target, .. }) => assert_eq!(*target, then_block),
            other => panic!("expected simplified jump, got {other:?}"),
        }
    }

    #[test]
    fn value_numbering_dedups_guards() {
        let (mut ir, b) = single_block_ir();
        let param = ir.push(b, node(IrOp::BlockParam(0), &[]));
        let g1 = ir.push(b, node(IrOp::GuardInt32, &[param]));
        let g2 = ir.push(b, node(IrOp::GuardInt32, &[param]));
        ir.frame_states.insert(g1, FrameState::default());
        ir.frame_states.insert(g2, FrameState::default());
        let boxed = ir.push(b, node(IrOp::BoxInt32, &[g2]));
        ir.blocks[b.0 as usize].terminator = Some(Terminator::Return(boxed));

        value_numbering(&mut ir);
        // The second guard collapsed onto the first.
        assert!(!ir.blocks[b.0 as usize].nodes.contains(&g2));
        assert_eq!(ir.node(boxed).inputs[0], g1);
    }

    #[test]
    fn strength_reduces_power_of_two_multiply() {
        let (mut ir, b) = single_block_ir();
        let param = ir.push(b, node(IrOp::BlockParam(0), &[]));
        let x = ir.push(b, node(IrOp::UnboxInt32, &[param]));
        let eight = ir.push(b, node(IrOp::Int32Const(8), &[]));
        let mul = ir.push(b, node(IrOp::I32Mul, &[x, eight]));
        let boxed = ir.push(b, node(IrOp::BoxInt32, &[mul]));
        ir.blocks[b.0 as usize].terminator = Some(Terminator::Return(boxed));

        strength_reduce(&mut ir);
        assert_eq!(ir.node(mul).op, IrOp::I32ShlConst(3));
        assert_eq!(ir.node(mul).inputs.as_slice(), &[x]);
    }

    #[test]
    fn dce_removes_unused_pure_nodes_only() {
        let (mut ir, b) = single_block_ir();
        let unused = ir.push(b, node(IrOp::Int32Const(9), &[]));
        let param = ir.push(b, node(IrOp::BlockParam(0), &[]));
        let guard = ir.push(b, node(IrOp::GuardInt32, &[param]));
        ir.frame_states.insert(guard, FrameState::default());
        let ret = ir.push(b, node(IrOp::Const(type_guards::TAG_UNDEFINED), &[]));
        ir.blocks[b.0 as usize].terminator = Some(Terminator::Return(ret));

        dce(&mut ir);
        let nodes = &ir.blocks[b.0 as usize].nodes;
        assert!(!nodes.contains(&unused));
        assert!(nodes.contains(&guard), "guards survive DCE");
        assert!(nodes.contains(&ret));
    }
}
