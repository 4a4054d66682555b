//! Bytecode instructions (opcodes).

use serde::{Deserialize, Serialize};

use crate::operand::{ConstantIndex, FeedbackIndex, FunctionIndex, JumpOffset, LocalIndex, Register};

/// Bytecode opcodes.
///
/// Register-based instruction set. Most instructions take a destination
/// register and one or more source registers/operands. `Opcode` is the
/// payload-free discriminant, used for disassembly and JIT diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    // Constants
    /// dst = undefined
    LoadUndefined,
    /// dst = null
    LoadNull,
    /// dst = true
    LoadTrue,
    /// dst = false
    LoadFalse,
    /// dst = imm8
    LoadInt8,
    /// dst = imm32
    LoadInt32,
    /// dst = constants\[idx\]
    LoadConst,
    /// dst = the TDZ hole sentinel (compiler-internal; re-arms TDZ slots)
    LoadHole,

    // Variables
    /// dst = locals\[idx\]
    GetLocal,
    /// locals\[idx\] = src
    SetLocal,
    /// dst = upvalues\[idx\]
    GetUpvalue,
    /// upvalues\[idx\] = src
    SetUpvalue,
    /// dst = globals\[name\] (IC)
    GetGlobal,
    /// globals\[name\] = src (IC)
    SetGlobal,
    /// dst = this
    LoadThis,
    /// dst = new.target
    NewTarget,
    /// Throw ReferenceError if locals\[idx\] is still the TDZ hole
    CheckTdz,
    /// Move local into a heap cell when leaving its scope
    CloseUpvalue,
    /// Begin a block scope (records the open-upvalue watermark)
    PushContext,
    /// End a block scope (closes cells for locals at or above the watermark)
    PopContext,

    // Arithmetic (feedback-profiled)
    /// dst = lhs + rhs
    Add,
    /// dst = lhs - rhs
    Sub,
    /// dst = lhs * rhs
    Mul,
    /// dst = lhs / rhs
    Div,
    /// dst = lhs % rhs
    Mod,
    /// dst = lhs ** rhs
    Pow,
    /// dst = -src
    Neg,
    /// dst = src + 1
    Inc,
    /// dst = src - 1
    Dec,

    // Bitwise
    /// dst = lhs & rhs
    BitAnd,
    /// dst = lhs | rhs
    BitOr,
    /// dst = lhs ^ rhs
    BitXor,
    /// dst = ~src
    BitNot,
    /// dst = lhs << rhs
    Shl,
    /// dst = lhs >> rhs
    Shr,
    /// dst = lhs >>> rhs
    Ushr,

    // Comparison (feedback-profiled)
    /// dst = lhs == rhs
    Eq,
    /// dst = lhs === rhs
    StrictEq,
    /// dst = lhs != rhs
    Ne,
    /// dst = lhs !== rhs
    StrictNe,
    /// dst = lhs < rhs
    Lt,
    /// dst = lhs <= rhs
    Le,
    /// dst = lhs > rhs
    Gt,
    /// dst = lhs >= rhs
    Ge,

    // Logical / type operations
    /// dst = !src
    Not,
    /// dst = typeof src
    TypeOf,
    /// dst = lhs instanceof rhs
    InstanceOf,
    /// dst = lhs in rhs
    In,

    // Objects (IC)
    /// dst = obj.name
    GetProp,
    /// obj.name = src
    SetProp,
    /// dst = obj\[key\]
    GetElem,
    /// obj\[key\] = src
    SetElem,
    /// dst = delete obj\[key\]
    DeleteProp,
    /// dst = {}
    NewObject,
    /// dst = {} pre-shaped by a constant-pool property list
    NewObjectSeeded,
    /// Define data property during literal construction (no IC)
    DefineDataProp,
    /// dst = \[\] with capacity hint
    NewArray,

    // Functions
    /// dst = closure over functions\[idx\]
    Closure,
    /// dst = callee(args...) (IC)
    Call,
    /// dst = obj.name(args...) (IC)
    CallMethod,
    /// dst = new callee(args...) (IC)
    Construct,
    /// return src
    Return,
    /// return undefined
    ReturnUndefined,

    // Control flow
    /// Unconditional jump
    Jump,
    /// Jump when truthy
    JumpIfTrue,
    /// Jump when falsy
    JumpIfFalse,
    /// Jump when null or undefined
    JumpIfNullish,

    // Exception handling
    /// Install exception handler (finally blocks lower to catch handlers)
    TryStart,
    /// Uninstall innermost handler
    TryEnd,
    /// Throw src
    Throw,
    /// dst = caught exception
    Catch,

    // Iteration
    /// dst = src\[Symbol.iterator\]()
    GetIterator,
    /// dst, done = iter.next()
    IteratorNext,

    // Suspension
    /// Suspend awaiting src; resumes with dst = resolved value
    Await,
    /// Suspend yielding src; resumes with dst = sent value
    Yield,

    // Misc
    /// dst = src
    Move,
    /// No operation
    Nop,
}

/// A decoded instruction with its operands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Instruction {
    // Constants
    LoadUndefined { dst: Register },
    LoadNull { dst: Register },
    LoadTrue { dst: Register },
    LoadFalse { dst: Register },
    LoadInt8 { dst: Register, value: i8 },
    LoadInt32 { dst: Register, value: i32 },
    LoadConst { dst: Register, idx: ConstantIndex },
    LoadHole { dst: Register },

    // Variables
    GetLocal { dst: Register, idx: LocalIndex },
    SetLocal { idx: LocalIndex, src: Register },
    GetUpvalue { dst: Register, idx: LocalIndex },
    SetUpvalue { idx: LocalIndex, src: Register },
    GetGlobal { dst: Register, name: ConstantIndex, ic: FeedbackIndex },
    SetGlobal { name: ConstantIndex, src: Register, ic: FeedbackIndex },
    LoadThis { dst: Register },
    NewTarget { dst: Register },
    CheckTdz { idx: LocalIndex, name: ConstantIndex },
    CloseUpvalue { idx: LocalIndex },
    PushContext,
    PopContext { first_local: LocalIndex },

    // Arithmetic
    Add { dst: Register, lhs: Register, rhs: Register, ic: FeedbackIndex },
    Sub { dst: Register, lhs: Register, rhs: Register, ic: FeedbackIndex },
    Mul { dst: Register, lhs: Register, rhs: Register, ic: FeedbackIndex },
    Div { dst: Register, lhs: Register, rhs: Register, ic: FeedbackIndex },
    Mod { dst: Register, lhs: Register, rhs: Register, ic: FeedbackIndex },
    Pow { dst: Register, lhs: Register, rhs: Register, ic: FeedbackIndex },
    Neg { dst: Register, src: Register },
    Inc { dst: Register, src: Register },
    Dec { dst: Register, src: Register },

    // Bitwise
    BitAnd { dst: Register, lhs: Register, rhs: Register },
    BitOr { dst: Register, lhs: Register, rhs: Register },
    BitXor { dst: Register, lhs: Register, rhs: Register },
    BitNot { dst: Register, src: Register },
    Shl { dst: Register, lhs: Register, rhs: Register },
    Shr { dst: Register, lhs: Register, rhs: Register },
    Ushr { dst: Register, lhs: Register, rhs: Register },

    // Comparison
    Eq { dst: Register, lhs: Register, rhs: Register, ic: FeedbackIndex },
    StrictEq { dst: Register, lhs: Register, rhs: Register, ic: FeedbackIndex },
    Ne { dst: Register, lhs: Register, rhs: Register, ic: FeedbackIndex },
    StrictNe { dst: Register, lhs: Register, rhs: Register, ic: FeedbackIndex },
    Lt { dst: Register, lhs: Register, rhs: Register, ic: FeedbackIndex },
    Le { dst: Register, lhs: Register, rhs: Register, ic: FeedbackIndex },
    Gt { dst: Register, lhs: Register, rhs: Register, ic: FeedbackIndex },
    Ge { dst: Register, lhs: Register, rhs: Register, ic: FeedbackIndex },

    // Logical / type operations
    Not { dst: Register, src: Register },
    TypeOf { dst: Register, src: Register },
    InstanceOf { dst: Register, lhs: Register, rhs: Register },
    In { dst: Register, lhs: Register, rhs: Register },

    // Objects
    GetProp { dst: Register, obj: Register, name: ConstantIndex, ic: FeedbackIndex },
    SetProp { obj: Register, name: ConstantIndex, src: Register, ic: FeedbackIndex },
    GetElem { dst: Register, obj: Register, key: Register, ic: FeedbackIndex },
    SetElem { obj: Register, key: Register, src: Register, ic: FeedbackIndex },
    DeleteProp { dst: Register, obj: Register, key: Register },
    NewObject { dst: Register },
    NewObjectSeeded { dst: Register, seed: ConstantIndex },
    DefineDataProp { obj: Register, name: ConstantIndex, src: Register },
    NewArray { dst: Register, capacity: u32 },

    // Functions
    Closure { dst: Register, func: FunctionIndex },
    Call { dst: Register, callee: Register, args: Vec<Register>, ic: FeedbackIndex },
    CallMethod {
        dst: Register,
        obj: Register,
        name: ConstantIndex,
        args: Vec<Register>,
        ic: FeedbackIndex,
    },
    Construct { dst: Register, callee: Register, args: Vec<Register>, ic: FeedbackIndex },
    Return { src: Register },
    ReturnUndefined,

    // Control flow
    Jump { offset: JumpOffset },
    JumpIfTrue { cond: Register, offset: JumpOffset },
    JumpIfFalse { cond: Register, offset: JumpOffset },
    JumpIfNullish { cond: Register, offset: JumpOffset },

    // Exception handling
    TryStart { catch_offset: JumpOffset },
    TryEnd,
    Throw { src: Register },
    Catch { dst: Register },

    // Iteration
    GetIterator { dst: Register, src: Register },
    IteratorNext { dst: Register, done: Register, iter: Register },

    // Suspension
    Await { dst: Register, src: Register },
    Yield { dst: Register, src: Register },

    // Misc
    Move { dst: Register, src: Register },
    Nop,
}

impl Instruction {
    /// Payload-free discriminant of this instruction.
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::LoadUndefined { .. } => Opcode::LoadUndefined,
            Self::LoadNull { .. } => Opcode::LoadNull,
            Self::LoadTrue { .. } => Opcode::LoadTrue,
            Self::LoadFalse { .. } => Opcode::LoadFalse,
            Self::LoadInt8 { .. } => Opcode::LoadInt8,
            Self::LoadInt32 { .. } => Opcode::LoadInt32,
            Self::LoadConst { .. } => Opcode::LoadConst,
            Self::LoadHole { .. } => Opcode::LoadHole,
            Self::GetLocal { .. } => Opcode::GetLocal,
            Self::SetLocal { .. } => Opcode::SetLocal,
            Self::GetUpvalue { .. } => Opcode::GetUpvalue,
            Self::SetUpvalue { .. } => Opcode::SetUpvalue,
            Self::GetGlobal { .. } => Opcode::GetGlobal,
            Self::SetGlobal { .. } => Opcode::SetGlobal,
            Self::LoadThis { .. } => Opcode::LoadThis,
            Self::NewTarget { .. } => Opcode::NewTarget,
            Self::CheckTdz { .. } => Opcode::CheckTdz,
            Self::CloseUpvalue { .. } => Opcode::CloseUpvalue,
            Self::PushContext => Opcode::PushContext,
            Self::PopContext { .. } => Opcode::PopContext,
            Self::Add { .. } => Opcode::Add,
            Self::Sub { .. } => Opcode::Sub,
            Self::Mul { .. } => Opcode::Mul,
            Self::Div { .. } => Opcode::Div,
            Self::Mod { .. } => Opcode::Mod,
            Self::Pow { .. } => Opcode::Pow,
            Self::Neg { .. } => Opcode::Neg,
            Self::Inc { .. } => Opcode::Inc,
            Self::Dec { .. } => Opcode::Dec,
            Self::BitAnd { .. } => Opcode::BitAnd,
            Self::BitOr { .. } => Opcode::BitOr,
            Self::BitXor { .. } => Opcode::BitXor,
            Self::BitNot { .. } => Opcode::BitNot,
            Self::Shl { .. } => Opcode::Shl,
            Self::Shr { .. } => Opcode::Shr,
            Self::Ushr { .. } => Opcode::Ushr,
            Self::Eq { .. } => Opcode::Eq,
            Self::StrictEq { .. } => Opcode::StrictEq,
            Self::Ne { .. } => Opcode::Ne,
            Self::StrictNe { .. } => Opcode::StrictNe,
            Self::Lt { .. } => Opcode::Lt,
            Self::Le { .. } => Opcode::Le,
            Self::Gt { .. } => Opcode::Gt,
            Self::Ge { .. } => Opcode::Ge,
            Self::Not { .. } => Opcode::Not,
            Self::TypeOf { .. } => Opcode::TypeOf,
            Self::InstanceOf { .. } => Opcode::InstanceOf,
            Self::In { .. } => Opcode::In,
            Self::GetProp { .. } => Opcode::GetProp,
            Self::SetProp { .. } => Opcode::SetProp,
            Self::GetElem { .. } => Opcode::GetElem,
            Self::SetElem { .. } => Opcode::SetElem,
            Self::DeleteProp { .. } => Opcode::DeleteProp,
            Self::NewObject { .. } => Opcode::NewObject,
            Self::NewObjectSeeded { .. } => Opcode::NewObjectSeeded,
            Self::DefineDataProp { .. } => Opcode::DefineDataProp,
            Self::NewArray { .. } => Opcode::NewArray,
            Self::Closure { .. } => Opcode::Closure,
            Self::Call { .. } => Opcode::Call,
            Self::CallMethod { .. } => Opcode::CallMethod,
            Self::Construct { .. } => Opcode::Construct,
            Self::Return { .. } => Opcode::Return,
            Self::ReturnUndefined => Opcode::ReturnUndefined,
            Self::Jump { .. } => Opcode::Jump,
            Self::JumpIfTrue { .. } => Opcode::JumpIfTrue,
            Self::JumpIfFalse { .. } => Opcode::JumpIfFalse,
            Self::JumpIfNullish { .. } => Opcode::JumpIfNullish,
            Self::TryStart { .. } => Opcode::TryStart,
            Self::TryEnd => Opcode::TryEnd,
            Self::Throw { .. } => Opcode::Throw,
            Self::Catch { .. } => Opcode::Catch,
            Self::GetIterator { .. } => Opcode::GetIterator,
            Self::IteratorNext { .. } => Opcode::IteratorNext,
            Self::Await { .. } => Opcode::Await,
            Self::Yield { .. } => Opcode::Yield,
            Self::Move { .. } => Opcode::Move,
            Self::Nop => Opcode::Nop,
        }
    }

    /// Feedback slot used by this instruction, if it has one.
    pub fn feedback_index(&self) -> Option<FeedbackIndex> {
        match self {
            Self::GetGlobal { ic, .. }
            | Self::SetGlobal { ic, .. }
            | Self::Add { ic, .. }
            | Self::Sub { ic, .. }
            | Self::Mul { ic, .. }
            | Self::Div { ic, .. }
            | Self::Mod { ic, .. }
            | Self::Pow { ic, .. }
            | Self::Eq { ic, .. }
            | Self::StrictEq { ic, .. }
            | Self::Ne { ic, .. }
            | Self::StrictNe { ic, .. }
            | Self::Lt { ic, .. }
            | Self::Le { ic, .. }
            | Self::Gt { ic, .. }
            | Self::Ge { ic, .. }
            | Self::GetProp { ic, .. }
            | Self::SetProp { ic, .. }
            | Self::GetElem { ic, .. }
            | Self::SetElem { ic, .. }
            | Self::Call { ic, .. }
            | Self::CallMethod { ic, .. }
            | Self::Construct { ic, .. } => Some(*ic),
            _ => None,
        }
    }

    /// True for instructions that may transfer control non-sequentially.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Self::Jump { .. }
                | Self::JumpIfTrue { .. }
                | Self::JumpIfFalse { .. }
                | Self::JumpIfNullish { .. }
                | Self::Return { .. }
                | Self::ReturnUndefined
                | Self::Throw { .. }
        )
    }
}

impl Opcode {
    /// Mnemonic for disassembly and diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            Self::LoadUndefined => "LoadUndefined",
            Self::LoadNull => "LoadNull",
            Self::LoadTrue => "LoadTrue",
            Self::LoadFalse => "LoadFalse",
            Self::LoadInt8 => "LoadInt8",
            Self::LoadInt32 => "LoadInt32",
            Self::LoadConst => "LoadConst",
            Self::LoadHole => "LoadHole",
            Self::GetLocal => "GetLocal",
            Self::SetLocal => "SetLocal",
            Self::GetUpvalue => "GetUpvalue",
            Self::SetUpvalue => "SetUpvalue",
            Self::GetGlobal => "GetGlobal",
            Self::SetGlobal => "SetGlobal",
            Self::LoadThis => "LoadThis",
            Self::NewTarget => "NewTarget",
            Self::CheckTdz => "CheckTdz",
            Self::CloseUpvalue => "CloseUpvalue",
            Self::PushContext => "PushContext",
            Self::PopContext => "PopContext",
            Self::Add => "Add",
            Self::Sub => "Sub",
            Self::Mul => "Mul",
            Self::Div => "Div",
            Self::Mod => "Mod",
            Self::Pow => "Pow",
            Self::Neg => "Neg",
            Self::Inc => "Inc",
            Self::Dec => "Dec",
            Self::BitAnd => "BitAnd",
            Self::BitOr => "BitOr",
            Self::BitXor => "BitXor",
            Self::BitNot => "BitNot",
            Self::Shl => "Shl",
            Self::Shr => "Shr",
            Self::Ushr => "Ushr",
            Self::Eq => "Eq",
            Self::StrictEq => "StrictEq",
            Self::Ne => "Ne",
            Self::StrictNe => "StrictNe",
            Self::Lt => "Lt",
            Self::Le => "Le",
            Self::Gt => "Gt",
            Self::Ge => "Ge",
            Self::Not => "Not",
            Self::TypeOf => "TypeOf",
            Self::InstanceOf => "InstanceOf",
            Self::In => "In",
            Self::GetProp => "GetProp",
            Self::SetProp => "SetProp",
            Self::GetElem => "GetElem",
            Self::SetElem => "SetElem",
            Self::DeleteProp => "DeleteProp",
            Self::NewObject => "NewObject",
            Self::NewObjectSeeded => "NewObjectSeeded",
            Self::DefineDataProp => "DefineDataProp",
            Self::NewArray => "NewArray",
            Self::Closure => "Closure",
            Self::Call => "Call",
            Self::CallMethod => "CallMethod",
            Self::Construct => "Construct",
            Self::Return => "Return",
            Self::ReturnUndefined => "ReturnUndefined",
            Self::Jump => "Jump",
            Self::JumpIfTrue => "JumpIfTrue",
            Self::JumpIfFalse => "JumpIfFalse",
            Self::JumpIfNullish => "JumpIfNullish",
            Self::TryStart => "TryStart",
            Self::TryEnd => "TryEnd",
            Self::Throw => "Throw",
            Self::Catch => "Catch",
            Self::GetIterator => "GetIterator",
            Self::IteratorNext => "IteratorNext",
            Self::Await => "Await",
            Self::Yield => "Yield",
            Self::Move => "Move",
            Self::Nop => "Nop",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_discriminant_and_name() {
        let add = Instruction::Add {
            dst: Register(0),
            lhs: Register(1),
            rhs: Register(2),
            ic: FeedbackIndex(0),
        };
        assert_eq!(add.opcode(), Opcode::Add);
        assert_eq!(add.opcode().name(), "Add");
        assert_eq!(add.feedback_index(), Some(FeedbackIndex(0)));
    }

    #[test]
    fn terminators() {
        assert!(Instruction::ReturnUndefined.is_terminator());
        assert!(
            Instruction::Jump {
                offset: JumpOffset(3)
            }
            .is_terminator()
        );
        assert!(!Instruction::Nop.is_terminator());
    }

    #[test]
    fn serde_roundtrip() {
        let instr = Instruction::Call {
            dst: Register(0),
            callee: Register(1),
            args: vec![Register(2), Register(3)],
            ic: FeedbackIndex(4),
        };
        let json = serde_json::to_string(&instr).unwrap();
        let back: Instruction = serde_json::from_str(&json).unwrap();
        assert_eq!(instr, back);
    }
}
