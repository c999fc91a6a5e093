//! UDF code generation
//!
//! Lowers a typed [`FnDef`](crate::ast::FnDef) into a native function
//! declared inside a shared Cranelift module. Split into:
//! - **Type mapping** ([`types`]): source types → native machine types,
//!   scalar/aggregate classification, struct layout.
//! - **Scope table** ([`scope`]): nested name → value-handle bindings.
//! - **Function building** ([`function`]): signature derivation including the
//!   aggregate-return rewrite, idempotent declaration, parameter binding,
//!   entry/exit block orchestration.
//! - **Block building** ([`block`]): statement-sequence lowering, with every
//!   control-flow path converging on the exit block.
//!
//! The backend module is supplied by the caller and outlives the builders;
//! compilation of one function is synchronous and single-threaded.

pub mod block;
pub mod function;
pub mod scope;
pub mod types;

pub use function::{CompiledFn, FnBuilder, RET_STRUCT_NAME};
pub use scope::ScopeTable;
pub use types::{NativeType, StructLayout, TypeMapper};

use thiserror::Error;

/// Errors produced while lowering a function definition.
///
/// Every level returns these by value and forwards its callee's failures
/// unchanged; a failed compile is deterministic for a given AST, so there is
/// no retry machinery.
#[derive(Debug, Error)]
pub enum CodegenError {
    /// The definition itself is malformed (empty name, reserved parameter
    /// name, missing body)
    #[error("invalid function definition: {0}")]
    InvalidArgument(String),

    /// A source type has no native representation
    #[error("no native representation for type '{ty}' ({context})")]
    TypeMapping {
        /// Offending source type
        ty: String,
        /// Where the type appeared (parameter name, return type, field)
        context: String,
    },

    /// A name was bound twice in the same scope
    #[error("duplicate binding '{name}' in scope '{scope}'")]
    DuplicateBinding {
        /// The colliding name
        name: String,
        /// Qualified path of the scope holding the original binding
        scope: String,
    },

    /// An expression referenced a name with no binding in any enclosing scope
    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),

    /// Operand or assignment types do not agree
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Expected type description
        expected: String,
        /// Actual type description
        actual: String,
    },

    /// Control flow can fall off the end of the function body
    #[error("missing return in function '{0}'")]
    MissingReturn(String),

    /// A construct outside the supported UDF subset
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Declaration or definition failed in the backend module
    #[error("backend module error: {0}")]
    Module(#[from] cranelift_module::ModuleError),

    /// The native backend could not be configured
    #[error("backend error: {0}")]
    Backend(String),
}
