//! Deoptimization metadata.
//!
//! Every guard in optimizing code owns a deopt point. The on-success path
//! stays dense: exits live in out-of-line blocks that spill live values
//! into the frame arrays, store the point's index into the context, and
//! return the deopt sentinel. The VM core then rebuilds an interpreter
//! frame from this table and resumes at the recorded bytecode pc.

use marten_bytecode::FeedbackIndex;

/// Where one interpreter-visible value lives at a deopt point.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotLocation {
    /// The exit spilled it into the frame locals array at this index.
    FrameLocal(u16),
    /// The exit spilled it into the frame registers array at this index.
    FrameRegister(u8),
    /// Known at compile time; the reconstructor materializes it directly.
    Constant(i64),
    /// Field of a scalar-replaced allocation: the exit spilled the fields
    /// into scratch slots; `descriptor` names the materialization recipe.
    Materialized {
        /// Index into [`DeoptTable::materializations`].
        descriptor: u32,
    },
}

/// Recipe for rebuilding a scalar-replaced object on the heap.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterializeDescriptor {
    /// Property names in definition order.
    pub keys: Vec<String>,
    /// Scratch slot holding each field's bits at the exit.
    pub field_scratch: Vec<u32>,
}

/// One bailout point.
#[derive(Debug, Clone)]
pub struct DeoptPoint {
    /// Bytecode pc execution resumes at.
    pub bytecode_pc: u32,
    /// The feedback slot whose speculation failed (per-site exit counter).
    pub ic: Option<FeedbackIndex>,
    /// What was speculated ("smi-operands", "receiver-shape", ...).
    pub speculation: &'static str,
    /// Live locals and where they are.
    pub locals: Vec<(u16, SlotLocation)>,
    /// Live registers and where they are.
    pub registers: Vec<(u8, SlotLocation)>,
}

/// Per-code-object deopt side table.
#[derive(Debug, Clone, Default)]
pub struct DeoptTable {
    /// Points indexed by the id compiled into the exit stubs.
    pub points: Vec<DeoptPoint>,
    /// Materialization recipes referenced by [`SlotLocation::Materialized`].
    pub materializations: Vec<MaterializeDescriptor>,
}

impl DeoptTable {
    /// Register a point, returning the index the exit stub stores.
    pub fn push(&mut self, point: DeoptPoint) -> u32 {
        self.points.push(point);
        (self.points.len() - 1) as u32
    }

    /// Look up a point by the index a deopt exit reported.
    pub fn point(&self, index: u32) -> Option<&DeoptPoint> {
        self.points.get(index as usize)
    }

    /// Register a materialization recipe.
    pub fn push_materialization(&mut self, descriptor: MaterializeDescriptor) -> u32 {
        self.materializations.push(descriptor);
        (self.materializations.len() - 1) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_roundtrip() {
        let mut table = DeoptTable::default();
        let idx = table.push(DeoptPoint {
            bytecode_pc: 12,
            ic: Some(FeedbackIndex(3)),
            speculation: "smi-operands",
            locals: vec![(0, SlotLocation::FrameLocal(0))],
            registers: vec![(1, SlotLocation::Constant(42))],
        });
        let point = table.point(idx).unwrap();
        assert_eq!(point.bytecode_pc, 12);
        assert_eq!(point.speculation, "smi-operands");
        assert!(table.point(99).is_none());
    }
}
