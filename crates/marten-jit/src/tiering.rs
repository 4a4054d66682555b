//! Tier-up thresholds and deopt penalties.
//!
//! All values are tunables; they were picked by running the numeric-loop
//! and IC benchmarks in `marten-core` rather than derived from anything
//! principled, and can be adjusted freely.

/// Invocations before a function is queued for baseline compilation.
pub const BASELINE_CALL_THRESHOLD: u32 = 16;

/// Invocations before a baseline function is queued for the optimizing
/// tier, provided its feedback vector has warmed up.
pub const OPTIMIZE_CALL_THRESHOLD: u32 = 512;

/// Loop back-edges before an on-stack replacement is attempted.
pub const OSR_BACK_EDGE_THRESHOLD: u32 = 1024;

/// Failed speculations at one site before that site is compiled
/// generically on the next tier-up.
pub const SITE_SPECULATION_LIMIT: u32 = 8;

/// Recompilations after deopt before a function is banned from the
/// optimizing tier for good.
pub const FUNCTION_DEOPT_LIMIT: u32 = 3;

/// A function's current code tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    /// Bytecode interpreter.
    Interpreter,
    /// Baseline template code.
    Baseline,
    /// Optimizing-tier code.
    Optimized,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_are_ordered() {
        assert!(BASELINE_CALL_THRESHOLD < OPTIMIZE_CALL_THRESHOLD);
        assert!(Tier::Interpreter < Tier::Baseline);
        assert!(Tier::Baseline < Tier::Optimized);
    }
}
