//! Top-level UDF engine: owns the JIT module and the table of compiled
//! functions.
//!
//! The engine compiles definitions into a single shared module and makes the
//! resulting callables resolvable by name. It never invokes the code it
//! produces; after [`UdfEngine::finalize`], the execution layer takes raw
//! code pointers and calls them through the declared C-ABI signatures.
//!
//! Compilation is synchronous and single-writer: the engine owns the module
//! for the whole session, so callers compiling from multiple threads must
//! serialize access externally.

use cranelift_codegen::settings::{self, Configurable};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::Module;
use rustc_hash::FxHashMap;
use target_lexicon::Architecture;
use tracing::debug;

use crate::ast::{FnDef, FnHeader};
use crate::codegen::function::{native_name_for, FnBuilder};
use crate::codegen::types::TypeMapper;
use crate::codegen::{CodegenError, CompiledFn};

/// Target architecture the engine generates code for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetArch {
    /// x86-64
    X86_64,
    /// AArch64
    AArch64,
    /// Anything else Cranelift supports on this host
    Other,
}

/// Compiles UDF definitions to native code and resolves them by name.
pub struct UdfEngine {
    module: JITModule,
    functions: FxHashMap<String, CompiledFn>,
    finalized: bool,
}

impl UdfEngine {
    /// Create an engine targeting the host machine.
    pub fn new() -> Result<Self, CodegenError> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", "speed")
            .map_err(|e| CodegenError::Backend(format!("failed to set opt_level: {e}")))?;
        flag_builder
            .set("is_pic", "false")
            .map_err(|e| CodegenError::Backend(format!("failed to set is_pic: {e}")))?;
        let flags = settings::Flags::new(flag_builder);

        let isa = cranelift_native::builder()
            .map_err(|msg| CodegenError::Backend(format!("host machine not supported: {msg}")))?
            .finish(flags)
            .map_err(|e| CodegenError::Backend(format!("failed to finish ISA: {e}")))?;

        let builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        Ok(UdfEngine {
            module: JITModule::new(builder),
            functions: FxHashMap::default(),
            finalized: false,
        })
    }

    /// Compile a definition into the engine's module.
    ///
    /// Compiling a definition whose (rewritten) signature is already present
    /// returns the existing callable instead of re-declaring it.
    pub fn compile(&mut self, def: &FnDef) -> Result<CompiledFn, CodegenError> {
        let mapper = TypeMapper::new(self.module.isa().pointer_type());
        if let Ok(name) = native_name_for(&def.header, &mapper) {
            if let Some(existing) = self.functions.get(&name) {
                debug!(function = %name, "already compiled, reusing");
                return Ok(existing.clone());
            }
        }

        let compiled = FnBuilder::new(&mut self.module).build(def)?;
        self.functions.insert(compiled.name.clone(), compiled.clone());
        Ok(compiled)
    }

    /// Resolve a compiled callable by its native name.
    pub fn lookup(&self, name: &str) -> Option<&CompiledFn> {
        self.functions.get(name)
    }

    /// Resolve a compiled callable from a source-level header, applying the
    /// same aggregate-return rewrite the declaration applied.
    pub fn lookup_header(&self, header: &FnHeader) -> Result<Option<&CompiledFn>, CodegenError> {
        let mapper = TypeMapper::new(self.module.isa().pointer_type());
        let name = native_name_for(header, &mapper)?;
        Ok(self.functions.get(&name))
    }

    /// Number of compiled functions.
    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    /// Architecture the engine targets.
    pub fn target_arch(&self) -> TargetArch {
        match self.module.isa().triple().architecture {
            Architecture::X86_64 => TargetArch::X86_64,
            Architecture::Aarch64(_) => TargetArch::AArch64,
            _ => TargetArch::Other,
        }
    }

    /// Pointer width of the target in bytes.
    pub fn pointer_bytes(&self) -> usize {
        self.module.isa().pointer_bytes() as usize
    }

    /// Finalize all definitions, making their code executable.
    pub fn finalize(&mut self) -> Result<(), CodegenError> {
        self.module.finalize_definitions()?;
        self.finalized = true;
        Ok(())
    }

    /// Raw code pointer for a compiled function. The engine must have been
    /// finalized first.
    pub fn finalized_code(&self, f: &CompiledFn) -> *const u8 {
        assert!(self.finalized, "finalize() must be called before taking code pointers");
        self.module.get_finalized_function(f.id)
    }
}
