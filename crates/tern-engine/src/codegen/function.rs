//! Function declaration and compilation.
//!
//! [`FnBuilder`] turns a typed [`FnDef`] into a native function defined in
//! the backend module. The header path derives the native signature from the
//! source header, applying the aggregate-return rewrite where the declared
//! return type maps to an aggregate: such a function is never declared with
//! its literal signature. Instead it returns a boolean status and takes one
//! extra trailing pointer parameter, the caller-allocated return slot, which
//! the callee fills in place. Call sites must apply the identical rewrite.
//!
//! Native symbol names are derived deterministically from the (possibly
//! rewritten) header, so re-declaring an identical signature is idempotent
//! and distinct signatures never collide.

use cranelift_codegen::ir::{types, AbiParam, InstBuilder, Signature, UserFuncName};
use cranelift_codegen::Context;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_module::{FuncId, Linkage, Module};
use tracing::{debug, warn};

use crate::ast::{FnDef, FnHeader, FnParam, SqlType};

use super::block::{BlockBuilder, ReturnSlot};
use super::scope::{ScopeTable, ScopeValue};
use super::types::{NativeType, StructLayout, TypeMapper};
use super::CodegenError;

/// Reserved name of the synthetic trailing parameter carrying the return
/// slot of an aggregate-returning function. Source parameter names may not
/// start with `@`.
pub const RET_STRUCT_NAME: &str = "@ret_struct";

/// A native callable declared in the backend module.
#[derive(Debug, Clone)]
pub struct CompiledFn {
    /// Mangled symbol name, resolvable in the module
    pub name: String,
    /// Backend function id
    pub id: FuncId,
    /// Native signature (post-rewrite for aggregate returns)
    pub signature: Signature,
    /// Layout of the returned aggregate when the rewrite applied; the
    /// execution layer allocates `sret.size` bytes and passes the pointer as
    /// the trailing argument
    pub sret: Option<StructLayout>,
}

/// A declared function header, before its body is defined.
#[derive(Debug)]
struct DeclaredFn {
    id: FuncId,
    name: String,
    signature: Signature,
    /// The header the signature was derived from (rewritten when `sret`)
    header: FnHeader,
    sret: Option<StructLayout>,
}

/// Builds native functions into a shared backend module.
///
/// The module is supplied by the caller and outlives the builder; building
/// one function is synchronous, and concurrent builds into one module must
/// be serialized externally.
pub struct FnBuilder<'a, M: Module> {
    module: &'a mut M,
    mapper: TypeMapper,
}

impl<'a, M: Module> FnBuilder<'a, M> {
    /// Create a builder targeting `module`.
    pub fn new(module: &'a mut M) -> Self {
        let mapper = TypeMapper::new(module.isa().pointer_type());
        Self { module, mapper }
    }

    /// Compile a function definition: declare the header, lower the body,
    /// and define the result in the module.
    pub fn build(&mut self, def: &FnDef) -> Result<CompiledFn, CodegenError> {
        validate_header(&def.header)?;

        let mut scope = ScopeTable::new();
        scope.enter("module");

        let declared = self.declare_head(&def.header)?;

        let mut ctx = Context::new();
        ctx.func.signature = declared.signature.clone();
        ctx.func.name = UserFuncName::user(0, declared.id.as_u32());
        let mut fn_builder_ctx = FunctionBuilderContext::new();

        {
            let mut builder = FunctionBuilder::new(&mut ctx.func, &mut fn_builder_ctx);

            let entry = builder.create_block();
            builder.append_block_params_for_function_params(entry);
            builder.switch_to_block(entry);

            let path = scope.enter(&declared.name);
            bind_params(&declared.header, &self.mapper, &mut scope, &mut builder, entry)?;
            debug!(function = %path, "function header ready");

            // Detached until the body jumps to it; the single return point.
            let exit = builder.create_block();

            let ret = match &declared.sret {
                Some(layout) => ReturnSlot::Sret { layout: layout.clone() },
                None => {
                    let NativeType::Scalar(ret_ty) = self.mapper.map(&declared.header.ret_type)?
                    else {
                        unreachable!("non-sret return type must map to a scalar")
                    };
                    ReturnSlot::Scalar { ty: ret_ty, slot: builder.declare_var(ret_ty) }
                }
            };

            let mut blocks = BlockBuilder::new(&mut scope, &self.mapper, &ret);
            if let Err(e) = blocks.build_block(&def.body, &mut builder, entry, exit) {
                warn!(function = %declared.name, error = %e, "body lowering failed");
                return Err(e);
            }

            builder.switch_to_block(exit);
            match &ret {
                ReturnSlot::Scalar { slot, .. } => {
                    let value = builder.use_var(*slot);
                    builder.ins().return_(&[value]);
                }
                ReturnSlot::Sret { .. } => {
                    // The slot was filled in place; report success.
                    let ok = builder.ins().iconst(types::I8, 1);
                    builder.ins().return_(&[ok]);
                }
            }

            builder.seal_all_blocks();
            builder.finalize();
        }

        self.module.define_function(declared.id, &mut ctx)?;
        debug!(function = %declared.name, "function compiled");

        Ok(CompiledFn {
            name: declared.name,
            id: declared.id,
            signature: declared.signature,
            sret: declared.sret,
        })
    }

    /// Derive the native signature from `header` and declare the callable.
    ///
    /// If the declared return type maps to an aggregate, the header is
    /// rewritten once and the rewritten header is declared instead. The
    /// recursion terminates after one step: the rewritten return type is
    /// boolean, which never classifies as aggregate.
    fn declare_head(&mut self, header: &FnHeader) -> Result<DeclaredFn, CodegenError> {
        let ret_ty = match self.mapper.map(&header.ret_type).map_err(|e| {
            warn!(function = %header.name, error = %e, "return type has no native representation");
            e
        })? {
            NativeType::Aggregate(layout) => {
                let rewritten = sret_rewrite(header);
                let mut declared = self.declare_head(&rewritten)?;
                declared.sret = Some(layout);
                return Ok(declared);
            }
            NativeType::Scalar(ty) => ty,
        };

        let mut sig = self.module.make_signature();
        for param in &header.params {
            let native = self.mapper.map(&param.ty).map_err(|e| {
                let e = with_param_context(e, &param.name);
                warn!(function = %header.name, error = %e, "parameter type has no native representation");
                e
            })?;
            sig.params.push(AbiParam::new(self.mapper.abi_type(&native)));
        }
        sig.returns.push(AbiParam::new(ret_ty));

        // Get-or-declare: an identical signature yields the existing id,
        // an incompatible one fails in the module.
        let name = native_fn_name(header);
        let id = self.module.declare_function(&name, Linkage::Export, &sig)?;

        Ok(DeclaredFn { id, name, signature: sig, header: header.clone(), sret: None })
    }
}

/// Rewrite an aggregate-returning header: same name, same parameters plus a
/// trailing return-slot pointer typed as the original return type, and a
/// boolean return carrying call success.
pub fn sret_rewrite(header: &FnHeader) -> FnHeader {
    let mut params = header.params.clone();
    params.push(FnParam::new(RET_STRUCT_NAME, header.ret_type.clone()));
    FnHeader::new(header.name.clone(), params, SqlType::Bool)
}

/// Deterministic native symbol name for a header: the function name plus the
/// source type of every parameter and of the return value. Identical headers
/// always produce the same name; any difference in name or parameter types
/// produces a different one, which is what makes signature-based overloading
/// work.
pub fn native_fn_name(header: &FnHeader) -> String {
    let mut name = String::from("udf.");
    name.push_str(&header.name);
    for param in &header.params {
        name.push('.');
        name.push_str(param.ty.type_name());
    }
    name.push_str(".r_");
    name.push_str(header.ret_type.type_name());
    name
}

/// The symbol name `header` resolves to once declared, with the
/// aggregate-return rewrite applied. Call sites use this to look up a
/// callable for a source-level signature.
pub fn native_name_for(header: &FnHeader, mapper: &TypeMapper) -> Result<String, CodegenError> {
    if mapper.map(&header.ret_type)?.is_aggregate() {
        Ok(native_fn_name(&sret_rewrite(header)))
    } else {
        Ok(native_fn_name(header))
    }
}

/// Bind each formal parameter, in declared order, to the corresponding
/// native argument of the entry block.
fn bind_params(
    header: &FnHeader,
    mapper: &TypeMapper,
    scope: &mut ScopeTable,
    builder: &mut FunctionBuilder<'_>,
    entry: cranelift_codegen::ir::Block,
) -> Result<(), CodegenError> {
    let args = builder.block_params(entry).to_vec();
    // Both counts derive from the same header; a mismatch is an internal
    // invariant violation, not a user error.
    assert_eq!(
        args.len(),
        header.params.len(),
        "native argument count does not match header parameter count for '{}'",
        header.name
    );

    for (param, arg) in header.params.iter().zip(args) {
        let native = mapper.map(&param.ty)?;
        let ty = mapper.abi_type(&native);
        let var = builder.declare_var(ty);
        builder.def_var(var, arg);
        if !scope.add_var(&param.name, ScopeValue { var, ty }) {
            let err = CodegenError::DuplicateBinding {
                name: param.name.clone(),
                scope: scope.qualified_path(),
            };
            warn!(function = %header.name, error = %err, "parameter binding failed");
            return Err(err);
        }
    }
    Ok(())
}

fn validate_header(header: &FnHeader) -> Result<(), CodegenError> {
    if header.name.is_empty() {
        return Err(CodegenError::InvalidArgument("function name is empty".to_string()));
    }
    for param in &header.params {
        if param.name.is_empty() {
            return Err(CodegenError::InvalidArgument(format!(
                "parameter of '{}' has an empty name",
                header.name
            )));
        }
        if param.name.starts_with('@') {
            return Err(CodegenError::InvalidArgument(format!(
                "parameter name '{}' uses the reserved '@' prefix",
                param.name
            )));
        }
    }
    Ok(())
}

fn with_param_context(err: CodegenError, param: &str) -> CodegenError {
    match err {
        CodegenError::TypeMapping { ty, context } => CodegenError::TypeMapping {
            ty,
            context: format!("parameter '{param}': {context}"),
        },
        other => other,
    }
}
