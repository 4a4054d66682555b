//! Compilation unit: functions plus their shared constant pool.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::constant::ConstantPool;
use crate::function::Function;
use crate::operand::FunctionIndex;

static NEXT_MODULE_ID: AtomicU64 = AtomicU64::new(1);

/// A compiled script or module body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    /// Process-unique id, used to key tier state and compile queues.
    /// Reassigned on deserialization.
    pub module_id: u64,
    /// Where the source came from (diagnostics only).
    pub source_url: String,
    /// All functions; index 0-based, referenced by `FunctionIndex`.
    pub functions: Vec<Arc<Function>>,
    /// Shared constant pool.
    pub constants: ConstantPool,
    /// Index of the top-level function.
    pub entry_point: u32,
}

impl Module {
    /// Start building a module.
    pub fn builder(source_url: impl Into<String>) -> ModuleBuilder {
        ModuleBuilder {
            source_url: source_url.into(),
            functions: Vec::new(),
            constants: ConstantPool::new(),
            entry_point: 0,
        }
    }

    /// Look up a function by index.
    pub fn function(&self, index: u32) -> Option<&Arc<Function>> {
        self.functions.get(index as usize)
    }

    /// The top-level function.
    pub fn entry_function(&self) -> Option<&Arc<Function>> {
        self.function(self.entry_point)
    }

    pub(crate) fn fresh_id() -> u64 {
        NEXT_MODULE_ID.fetch_add(1, Ordering::Relaxed)
    }
}

/// Builder for [`Module`].
#[derive(Debug)]
pub struct ModuleBuilder {
    source_url: String,
    functions: Vec<Arc<Function>>,
    constants: ConstantPool,
    entry_point: u32,
}

impl ModuleBuilder {
    /// Add a function, returning its index.
    pub fn add_function(&mut self, function: Function) -> FunctionIndex {
        let idx = self.functions.len() as u32;
        self.functions.push(Arc::new(function));
        FunctionIndex(idx)
    }

    /// Mutable access to the constant pool.
    pub fn constants_mut(&mut self) -> &mut ConstantPool {
        &mut self.constants
    }

    /// Set the entry function index (defaults to 0).
    pub fn entry_point(&mut self, index: FunctionIndex) -> &mut Self {
        self.entry_point = index.index();
        self
    }

    /// Finish the module.
    pub fn build(self) -> Module {
        Module {
            module_id: Module::fresh_id(),
            source_url: self.source_url,
            functions: self.functions,
            constants: self.constants,
            entry_point: self.entry_point,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Instruction;
    use crate::operand::Register;

    #[test]
    fn build_and_lookup() {
        let mut builder = Module::builder("test.js");
        let idx = builder.add_function(
            Function::builder()
                .name("main")
                .instruction(Instruction::ReturnUndefined)
                .build(),
        );
        builder.entry_point(idx);
        let module = builder.build();

        assert_eq!(module.entry_function().unwrap().display_name(), "main");
        assert!(module.function(1).is_none());
        assert!(module.module_id > 0);
    }

    #[test]
    fn module_ids_are_unique() {
        let a = Module::builder("a.js").build();
        let b = Module::builder("b.js").build();
        assert_ne!(a.module_id, b.module_id);
    }

    #[test]
    fn clone_shares_functions() {
        let mut builder = Module::builder("test.js");
        builder.add_function(Function::builder().build());
        let module = builder.build();
        let cloned = module.clone();
        assert!(Arc::ptr_eq(&module.functions[0], &cloned.functions[0]));
    }

    #[test]
    fn register_newtype() {
        // Register debug formatting is stable across the crate.
        assert_eq!(format!("{:?}", Register(3)), "Register(3)");
    }
}
