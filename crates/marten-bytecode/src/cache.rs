//! Bytecode cache: versioned serialization of a compiled module.
//!
//! The cache persists only the static parts of a module: instructions,
//! constants, metadata. Feedback vectors, counters and anything tier-related
//! never round-trip; a loaded module starts cold in the interpreter.

use serde::{Deserialize, Serialize};

use crate::error::BytecodeError;
use crate::module::Module;

/// Magic bytes at the head of every cache blob.
const CACHE_MAGIC: &[u8; 4] = b"MTNB";

/// Bump on any incompatible change to the serialized layout.
pub const CACHE_FORMAT_VERSION: u32 = 2;

#[derive(Serialize, Deserialize)]
struct CacheEnvelope {
    version: u32,
    module: Module,
}

/// Serialize a module for later reload.
///
/// Fails if the constant pool contains anything non-serializable (it cannot
/// today, but the check pins the contract for future constant kinds).
pub fn save_module(module: &Module) -> Result<Vec<u8>, BytecodeError> {
    for (idx, constant) in module.constants.iter().enumerate() {
        if !constant.is_serializable() {
            return Err(BytecodeError::UnserializableConstant(idx as u32));
        }
    }
    let envelope = CacheEnvelope {
        version: CACHE_FORMAT_VERSION,
        module: module.clone(),
    };
    let mut blob = CACHE_MAGIC.to_vec();
    blob.extend(serde_json::to_vec(&envelope)?);
    Ok(blob)
}

/// Load a module from a cache blob.
///
/// The module gets a fresh id and fully reset runtime state.
pub fn load_module(blob: &[u8]) -> Result<Module, BytecodeError> {
    let Some(payload) = blob.strip_prefix(CACHE_MAGIC.as_slice()) else {
        return Err(BytecodeError::BadCacheMagic);
    };
    let envelope: CacheEnvelope = serde_json::from_slice(payload)?;
    if envelope.version != CACHE_FORMAT_VERSION {
        return Err(BytecodeError::CacheVersionMismatch {
            found: envelope.version,
            expected: CACHE_FORMAT_VERSION,
        });
    }
    let mut module = envelope.module;
    module.module_id = Module::fresh_id();
    module.constants.rebuild_index();
    for function in &module.functions {
        function.reset_runtime_state();
    }
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::Function;
    use crate::instruction::Instruction;
    use crate::operand::Register;

    fn sample_module() -> Module {
        let mut builder = Module::builder("cache-test.js");
        let name = builder.constants_mut().add_string("x");
        builder.add_function(
            Function::builder()
                .name("main")
                .register_count(1)
                .feedback_len(1)
                .instruction(Instruction::LoadConst {
                    dst: Register(0),
                    idx: name,
                })
                .instruction(Instruction::Return { src: Register(0) })
                .build(),
        );
        builder.build()
    }

    #[test]
    fn roundtrip_preserves_code_and_constants() {
        let module = sample_module();
        let blob = save_module(&module).unwrap();
        let loaded = load_module(&blob).unwrap();

        assert_eq!(loaded.source_url, module.source_url);
        assert_eq!(loaded.functions.len(), 1);
        assert_eq!(
            loaded.functions[0].instructions,
            module.functions[0].instructions
        );
        assert_eq!(loaded.constants.len(), module.constants.len());
        // Fresh identity, cold runtime state.
        assert_ne!(loaded.module_id, module.module_id);
        assert_eq!(loaded.functions[0].call_count(), 0);
    }

    #[test]
    fn rejects_bad_magic() {
        let err = load_module(b"XXXX{}").unwrap_err();
        assert!(matches!(err, BytecodeError::BadCacheMagic));
    }

    #[test]
    fn rejects_version_mismatch() {
        let module = sample_module();
        let mut blob = save_module(&module).unwrap();
        // Corrupt the version field in the JSON payload.
        let json = String::from_utf8(blob.split_off(4)).unwrap();
        let json = json.replacen(
            &format!("\"version\":{CACHE_FORMAT_VERSION}"),
            "\"version\":1",
            1,
        );
        blob.extend(json.into_bytes());
        let err = load_module(&blob).unwrap_err();
        assert!(matches!(err, BytecodeError::CacheVersionMismatch { .. }));
    }
}
