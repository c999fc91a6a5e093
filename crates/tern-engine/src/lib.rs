//! Tern UDF compilation engine
//!
//! This crate lowers typed user-defined function definitions into native
//! code through Cranelift:
//! - **AST** (`ast` module): the typed function definition produced by the
//!   upstream parser and analyzer.
//! - **Codegen** (`codegen` module): type mapping, scope management, and
//!   function/block lowering, including the aggregate-return rewrite at the
//!   native ABI boundary.
//! - **Engine** (`engine` module): owns the JIT module, compiles
//!   definitions, and resolves compiled callables by name for the execution
//!   layer.
//!
//! # Example
//!
//! ```rust,ignore
//! use tern_engine::{Expr, FnDef, FnHeader, FnParam, SqlType, Stmt, UdfEngine};
//!
//! let def = FnDef {
//!     header: FnHeader::new(
//!         "inc",
//!         vec![FnParam::new("x", SqlType::Int32)],
//!         SqlType::Int32,
//!     ),
//!     body: vec![Stmt::Return(Expr::Ident("x".to_string()))],
//! };
//!
//! let mut engine = UdfEngine::new()?;
//! let compiled = engine.compile(&def)?;
//! engine.finalize()?;
//! let code = engine.finalized_code(&compiled);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// AST module: typed function definitions and the source type system
pub mod ast;

/// Codegen module: type mapping, scopes, and function lowering
pub mod codegen;

/// Engine module: JIT module ownership and compiled-function resolution
pub mod engine;

pub use ast::{BinaryOp, Expr, FnDef, FnHeader, FnParam, Literal, SqlType, Stmt, StructType, UnaryOp};
pub use codegen::{CodegenError, CompiledFn, FnBuilder, ScopeTable, TypeMapper};
pub use engine::{TargetArch, UdfEngine};
