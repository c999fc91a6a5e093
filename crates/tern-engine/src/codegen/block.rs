//! Statement-sequence lowering.
//!
//! Lowers a function body into Cranelift IR starting at the entry block.
//! Every control-flow path converges on the exit block, which is the
//! function's single return point: scalar functions carry the returned value
//! in a dedicated return-slot variable defined by each `return` statement
//! before jumping to the exit; aggregate-returning functions store the
//! result through the `@ret_struct` pointer and the exit block reports
//! success.
//!
//! Merged values rely on Cranelift's variable-based SSA construction:
//! predecessors `def_var`, the join block `use_var`, and block parameters
//! are introduced automatically when blocks are sealed.

use cranelift_codegen::ir::{condcodes, types, Block, InstBuilder, MemFlags, Type, Value};
use cranelift_frontend::FunctionBuilder;

use crate::ast::{BinaryOp, Expr, Literal, Stmt, UnaryOp};

use super::function::RET_STRUCT_NAME;
use super::scope::{ScopeTable, ScopeValue};
use super::types::{NativeType, StructLayout, TypeMapper};
use super::CodegenError;

/// How the function under construction returns.
#[derive(Debug)]
pub(crate) enum ReturnSlot {
    /// Scalar return: `slot` holds the value when control reaches the exit
    Scalar {
        /// Native return type
        ty: Type,
        /// Return-slot variable, defined by every `return`
        slot: cranelift_frontend::Variable,
    },
    /// Aggregate return: the callee fills `@ret_struct` in place
    Sret {
        /// Layout of the returned aggregate
        layout: StructLayout,
    },
}

/// Lowers statement sequences for one function.
pub struct BlockBuilder<'a> {
    scope: &'a mut ScopeTable,
    mapper: &'a TypeMapper,
    ret: &'a ReturnSlot,
}

impl<'a> BlockBuilder<'a> {
    pub(crate) fn new(
        scope: &'a mut ScopeTable,
        mapper: &'a TypeMapper,
        ret: &'a ReturnSlot,
    ) -> Self {
        Self { scope, mapper, ret }
    }

    /// Lower `stmts` into `entry`, converging every path on `exit`.
    ///
    /// The builder must be positioned at `entry`. Fails with `MissingReturn`
    /// if control can fall off the end of the sequence.
    pub fn build_block(
        &mut self,
        stmts: &[Stmt],
        builder: &mut FunctionBuilder<'_>,
        entry: Block,
        exit: Block,
    ) -> Result<(), CodegenError> {
        debug_assert_eq!(builder.current_block(), Some(entry));
        let terminated = self.lower_stmts(stmts, builder, exit)?;
        if !terminated {
            return Err(CodegenError::MissingReturn(self.scope.qualified_path()));
        }
        Ok(())
    }

    /// Lower a statement list; returns whether it terminated (every path
    /// reached a `return`).
    fn lower_stmts(
        &mut self,
        stmts: &[Stmt],
        builder: &mut FunctionBuilder<'_>,
        exit: Block,
    ) -> Result<bool, CodegenError> {
        let mut iter = stmts.iter();
        while let Some(stmt) = iter.next() {
            if self.lower_stmt(stmt, builder, exit)? {
                if iter.next().is_some() {
                    return Err(CodegenError::Unsupported(
                        "unreachable statement after return".to_string(),
                    ));
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn lower_stmt(
        &mut self,
        stmt: &Stmt,
        builder: &mut FunctionBuilder<'_>,
        exit: Block,
    ) -> Result<bool, CodegenError> {
        match stmt {
            Stmt::Let { name, ty, value } => {
                let declared = match self.mapper.map(ty)? {
                    NativeType::Scalar(t) => t,
                    NativeType::Aggregate(_) => {
                        return Err(CodegenError::Unsupported(format!(
                            "struct-typed local '{name}'"
                        )));
                    }
                };
                let (val, val_ty) = self.eval_expr(value, builder)?;
                check_type(declared, val_ty)?;
                let var = builder.declare_var(declared);
                builder.def_var(var, val);
                if !self.scope.add_var(name, ScopeValue { var, ty: declared }) {
                    return Err(CodegenError::DuplicateBinding {
                        name: name.clone(),
                        scope: self.scope.qualified_path(),
                    });
                }
                Ok(false)
            }

            Stmt::Assign { name, value } => {
                let target = self
                    .scope
                    .resolve(name)
                    .ok_or_else(|| CodegenError::UndefinedVariable(name.clone()))?;
                let (val, val_ty) = self.eval_expr(value, builder)?;
                check_type(target.ty, val_ty)?;
                builder.def_var(target.var, val);
                Ok(false)
            }

            Stmt::If { cond, then_block, else_block } => {
                self.lower_if(cond, then_block, else_block.as_deref(), builder, exit)
            }

            Stmt::Return(expr) => {
                self.lower_return(expr, builder, exit)?;
                Ok(true)
            }
        }
    }

    fn lower_if(
        &mut self,
        cond: &Expr,
        then_stmts: &[Stmt],
        else_stmts: Option<&[Stmt]>,
        builder: &mut FunctionBuilder<'_>,
        exit: Block,
    ) -> Result<bool, CodegenError> {
        let (cond_val, cond_ty) = self.eval_expr(cond, builder)?;
        if cond_ty != types::I8 {
            return Err(CodegenError::TypeMismatch {
                expected: "bool condition".to_string(),
                actual: format!("{cond_ty}"),
            });
        }

        let then_b = builder.create_block();
        // Without an else branch the false edge falls through to the merge.
        let (else_b, mut merge) = match else_stmts {
            Some(_) => (builder.create_block(), None),
            None => {
                let m = builder.create_block();
                (m, Some(m))
            }
        };
        builder.ins().brif(cond_val, then_b, &[], else_b, &[]);

        builder.switch_to_block(then_b);
        self.scope.enter("then");
        let then_terminated = self.lower_stmts(then_stmts, builder, exit)?;
        self.scope.exit();
        if !then_terminated {
            let m = *merge.get_or_insert_with(|| builder.create_block());
            builder.ins().jump(m, &[]);
        }

        if let Some(else_stmts) = else_stmts {
            builder.switch_to_block(else_b);
            self.scope.enter("else");
            let else_terminated = self.lower_stmts(else_stmts, builder, exit)?;
            self.scope.exit();
            if !else_terminated {
                let m = *merge.get_or_insert_with(|| builder.create_block());
                builder.ins().jump(m, &[]);
            }
        }

        match merge {
            Some(m) => {
                builder.switch_to_block(m);
                Ok(false)
            }
            // Both branches returned; nothing merges.
            None => Ok(true),
        }
    }

    fn lower_return(
        &mut self,
        expr: &Expr,
        builder: &mut FunctionBuilder<'_>,
        exit: Block,
    ) -> Result<(), CodegenError> {
        match self.ret {
            ReturnSlot::Scalar { ty, slot } => {
                let (val, val_ty) = self.eval_expr(expr, builder)?;
                check_type(*ty, val_ty)?;
                builder.def_var(*slot, val);
            }
            ReturnSlot::Sret { layout } => {
                let Expr::Struct(fields) = expr else {
                    return Err(CodegenError::Unsupported(format!(
                        "returning struct {} requires a struct literal",
                        layout.name
                    )));
                };
                self.store_struct_literal(fields, layout, builder)?;
            }
        }
        builder.ins().jump(exit, &[]);
        Ok(())
    }

    /// Evaluate a struct literal field by field and store it through the
    /// return-slot pointer bound as `@ret_struct`.
    fn store_struct_literal(
        &mut self,
        fields: &[(String, Expr)],
        layout: &StructLayout,
        builder: &mut FunctionBuilder<'_>,
    ) -> Result<(), CodegenError> {
        let slot = self
            .scope
            .resolve(RET_STRUCT_NAME)
            .ok_or_else(|| CodegenError::UndefinedVariable(RET_STRUCT_NAME.to_string()))?;
        let base = builder.use_var(slot.var);

        for (name, _) in fields {
            if layout.field(name).is_none() {
                return Err(CodegenError::TypeMismatch {
                    expected: format!("fields of struct {}", layout.name),
                    actual: format!("unknown field '{name}'"),
                });
            }
        }

        for field in &layout.fields {
            let mut values = fields.iter().filter(|(name, _)| *name == field.name);
            let Some((_, expr)) = values.next() else {
                return Err(CodegenError::TypeMismatch {
                    expected: format!("struct {} with field '{}'", layout.name, field.name),
                    actual: format!("literal missing '{}'", field.name),
                });
            };
            if values.next().is_some() {
                return Err(CodegenError::DuplicateBinding {
                    name: field.name.clone(),
                    scope: format!("struct {}", layout.name),
                });
            }
            let (val, val_ty) = self.eval_expr(expr, builder)?;
            check_type(field.ty, val_ty)?;
            builder.ins().store(MemFlags::trusted(), val, base, field.offset as i32);
        }
        Ok(())
    }

    fn eval_expr(
        &mut self,
        expr: &Expr,
        builder: &mut FunctionBuilder<'_>,
    ) -> Result<(Value, Type), CodegenError> {
        match expr {
            Expr::Literal(lit) => Ok(eval_literal(lit, builder)),

            Expr::Ident(name) => {
                let bound = self
                    .scope
                    .resolve(name)
                    .ok_or_else(|| CodegenError::UndefinedVariable(name.clone()))?;
                Ok((builder.use_var(bound.var), bound.ty))
            }

            Expr::Unary { op, operand } => {
                let (val, ty) = self.eval_expr(operand, builder)?;
                match op {
                    UnaryOp::Neg if ty.is_float() => Ok((builder.ins().fneg(val), ty)),
                    UnaryOp::Neg if ty.is_int() && ty != types::I8 => {
                        Ok((builder.ins().ineg(val), ty))
                    }
                    UnaryOp::Neg => Err(CodegenError::TypeMismatch {
                        expected: "numeric operand".to_string(),
                        actual: format!("{ty}"),
                    }),
                    UnaryOp::Not if ty == types::I8 => {
                        let one = builder.ins().iconst(types::I8, 1);
                        Ok((builder.ins().bxor(val, one), types::I8))
                    }
                    UnaryOp::Not => Err(CodegenError::TypeMismatch {
                        expected: "bool operand".to_string(),
                        actual: format!("{ty}"),
                    }),
                }
            }

            Expr::Binary { op, lhs, rhs } => {
                let (l, l_ty) = self.eval_expr(lhs, builder)?;
                let (r, r_ty) = self.eval_expr(rhs, builder)?;
                check_type(l_ty, r_ty)?;
                self.eval_binary(*op, l, r, l_ty, builder)
            }

            Expr::Struct(_) => Err(CodegenError::Unsupported(
                "struct literal outside a return statement".to_string(),
            )),
        }
    }

    fn eval_binary(
        &mut self,
        op: BinaryOp,
        l: Value,
        r: Value,
        ty: Type,
        builder: &mut FunctionBuilder<'_>,
    ) -> Result<(Value, Type), CodegenError> {
        use BinaryOp::*;

        if op.is_comparison() {
            let result = if ty.is_float() {
                let cc = match op {
                    Eq => condcodes::FloatCC::Equal,
                    Ne => condcodes::FloatCC::NotEqual,
                    Lt => condcodes::FloatCC::LessThan,
                    Le => condcodes::FloatCC::LessThanOrEqual,
                    Gt => condcodes::FloatCC::GreaterThan,
                    Ge => condcodes::FloatCC::GreaterThanOrEqual,
                    _ => unreachable!(),
                };
                builder.ins().fcmp(cc, l, r)
            } else {
                let cc = match op {
                    Eq => condcodes::IntCC::Equal,
                    Ne => condcodes::IntCC::NotEqual,
                    Lt => condcodes::IntCC::SignedLessThan,
                    Le => condcodes::IntCC::SignedLessThanOrEqual,
                    Gt => condcodes::IntCC::SignedGreaterThan,
                    Ge => condcodes::IntCC::SignedGreaterThanOrEqual,
                    _ => unreachable!(),
                };
                builder.ins().icmp(cc, l, r)
            };
            return Ok((result, types::I8));
        }

        match op {
            And | Or if ty == types::I8 => {
                let result = match op {
                    And => builder.ins().band(l, r),
                    Or => builder.ins().bor(l, r),
                    _ => unreachable!(),
                };
                Ok((result, types::I8))
            }
            And | Or => Err(CodegenError::TypeMismatch {
                expected: "bool operands".to_string(),
                actual: format!("{ty}"),
            }),

            Add | Sub | Mul | Div if ty.is_float() => {
                let result = match op {
                    Add => builder.ins().fadd(l, r),
                    Sub => builder.ins().fsub(l, r),
                    Mul => builder.ins().fmul(l, r),
                    Div => builder.ins().fdiv(l, r),
                    _ => unreachable!(),
                };
                Ok((result, ty))
            }
            Add | Sub | Mul | Div if is_arith_int(ty) => {
                let result = match op {
                    Add => builder.ins().iadd(l, r),
                    Sub => builder.ins().isub(l, r),
                    Mul => builder.ins().imul(l, r),
                    Div => builder.ins().sdiv(l, r),
                    _ => unreachable!(),
                };
                Ok((result, ty))
            }
            Mod if is_arith_int(ty) => Ok((builder.ins().srem(l, r), ty)),
            Mod if ty.is_float() => Err(CodegenError::Unsupported(
                "modulo on floating-point operands".to_string(),
            )),
            _ => Err(CodegenError::TypeMismatch {
                expected: "numeric operands".to_string(),
                actual: format!("{ty}"),
            }),
        }
    }
}

fn eval_literal(lit: &Literal, builder: &mut FunctionBuilder<'_>) -> (Value, Type) {
    match lit {
        Literal::Bool(b) => (builder.ins().iconst(types::I8, *b as i64), types::I8),
        Literal::Int32(v) => (builder.ins().iconst(types::I32, *v as i64), types::I32),
        Literal::Int64(v) => (builder.ins().iconst(types::I64, *v), types::I64),
        Literal::Float(v) => (builder.ins().f32const(*v), types::F32),
        Literal::Double(v) => (builder.ins().f64const(*v), types::F64),
    }
}

/// Integer types that support arithmetic; I8 is the boolean carrier.
fn is_arith_int(ty: Type) -> bool {
    ty.is_int() && ty != types::I8
}

fn check_type(expected: Type, actual: Type) -> Result<(), CodegenError> {
    if expected != actual {
        return Err(CodegenError::TypeMismatch {
            expected: format!("{expected}"),
            actual: format!("{actual}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{FnDef, FnHeader, FnParam, SqlType};
    use crate::codegen::function::FnBuilder;
    use cranelift_codegen::settings::{self, Configurable};
    use cranelift_jit::{JITBuilder, JITModule};

    fn test_module() -> JITModule {
        let mut flag_builder = settings::builder();
        flag_builder.set("opt_level", "speed").unwrap();
        flag_builder.set("is_pic", "false").unwrap();
        let isa = cranelift_native::builder()
            .unwrap()
            .finish(settings::Flags::new(flag_builder))
            .unwrap();
        let builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        JITModule::new(builder)
    }

    fn build(def: &FnDef) -> Result<(), CodegenError> {
        let mut module = test_module();
        FnBuilder::new(&mut module).build(def).map(|_| ())
    }

    fn int_header(name: &str) -> FnHeader {
        FnHeader::new(name, vec![FnParam::new("x", SqlType::Int32)], SqlType::Int32)
    }

    fn lit(v: i32) -> Expr {
        Expr::Literal(Literal::Int32(v))
    }

    #[test]
    fn test_straight_line_body() {
        let def = FnDef {
            header: int_header("inc"),
            body: vec![
                Stmt::Let {
                    name: "y".to_string(),
                    ty: SqlType::Int32,
                    value: Expr::Binary {
                        op: BinaryOp::Add,
                        lhs: Box::new(Expr::Ident("x".to_string())),
                        rhs: Box::new(lit(1)),
                    },
                },
                Stmt::Return(Expr::Ident("y".to_string())),
            ],
        };
        build(&def).unwrap();
    }

    #[test]
    fn test_branches_converge_on_exit() {
        // if x < 0 { return -x } return x
        let def = FnDef {
            header: int_header("abs"),
            body: vec![
                Stmt::If {
                    cond: Expr::Binary {
                        op: BinaryOp::Lt,
                        lhs: Box::new(Expr::Ident("x".to_string())),
                        rhs: Box::new(lit(0)),
                    },
                    then_block: vec![Stmt::Return(Expr::Unary {
                        op: UnaryOp::Neg,
                        operand: Box::new(Expr::Ident("x".to_string())),
                    })],
                    else_block: None,
                },
                Stmt::Return(Expr::Ident("x".to_string())),
            ],
        };
        build(&def).unwrap();
    }

    #[test]
    fn test_both_branches_returning_is_terminated() {
        let def = FnDef {
            header: int_header("sign"),
            body: vec![Stmt::If {
                cond: Expr::Binary {
                    op: BinaryOp::Lt,
                    lhs: Box::new(Expr::Ident("x".to_string())),
                    rhs: Box::new(lit(0)),
                },
                then_block: vec![Stmt::Return(lit(-1))],
                else_block: Some(vec![Stmt::Return(lit(1))]),
            }],
        };
        build(&def).unwrap();
    }

    #[test]
    fn test_missing_return_rejected() {
        let def = FnDef {
            header: int_header("f"),
            body: vec![Stmt::Let {
                name: "y".to_string(),
                ty: SqlType::Int32,
                value: lit(1),
            }],
        };
        assert!(matches!(build(&def).unwrap_err(), CodegenError::MissingReturn(_)));
    }

    #[test]
    fn test_branch_missing_return_rejected() {
        // else branch falls through and nothing follows the if
        let def = FnDef {
            header: int_header("f"),
            body: vec![Stmt::If {
                cond: Expr::Literal(Literal::Bool(true)),
                then_block: vec![Stmt::Return(lit(1))],
                else_block: Some(vec![Stmt::Assign {
                    name: "x".to_string(),
                    value: lit(2),
                }]),
            }],
        };
        assert!(matches!(build(&def).unwrap_err(), CodegenError::MissingReturn(_)));
    }

    #[test]
    fn test_undefined_variable() {
        let def = FnDef {
            header: int_header("f"),
            body: vec![Stmt::Return(Expr::Ident("nope".to_string()))],
        };
        assert!(matches!(
            build(&def).unwrap_err(),
            CodegenError::UndefinedVariable(name) if name == "nope"
        ));
    }

    #[test]
    fn test_duplicate_local_rejected() {
        let def = FnDef {
            header: int_header("f"),
            body: vec![
                Stmt::Let { name: "y".to_string(), ty: SqlType::Int32, value: lit(1) },
                Stmt::Let { name: "y".to_string(), ty: SqlType::Int32, value: lit(2) },
                Stmt::Return(lit(0)),
            ],
        };
        assert!(matches!(build(&def).unwrap_err(), CodegenError::DuplicateBinding { .. }));
    }

    #[test]
    fn test_local_may_shadow_in_branch_scope() {
        // A then-branch scope is distinct from the function scope.
        let def = FnDef {
            header: int_header("f"),
            body: vec![
                Stmt::Let { name: "y".to_string(), ty: SqlType::Int32, value: lit(1) },
                Stmt::If {
                    cond: Expr::Literal(Literal::Bool(true)),
                    then_block: vec![
                        Stmt::Let { name: "y".to_string(), ty: SqlType::Int32, value: lit(2) },
                        Stmt::Return(Expr::Ident("y".to_string())),
                    ],
                    else_block: None,
                },
                Stmt::Return(Expr::Ident("y".to_string())),
            ],
        };
        build(&def).unwrap();
    }

    #[test]
    fn test_type_mismatch_on_return() {
        let def = FnDef {
            header: int_header("f"),
            body: vec![Stmt::Return(Expr::Literal(Literal::Int64(1)))],
        };
        assert!(matches!(build(&def).unwrap_err(), CodegenError::TypeMismatch { .. }));
    }

    #[test]
    fn test_non_bool_condition_rejected() {
        let def = FnDef {
            header: int_header("f"),
            body: vec![Stmt::If {
                cond: Expr::Ident("x".to_string()),
                then_block: vec![Stmt::Return(lit(1))],
                else_block: Some(vec![Stmt::Return(lit(0))]),
            }],
        };
        assert!(matches!(build(&def).unwrap_err(), CodegenError::TypeMismatch { .. }));
    }

    #[test]
    fn test_float_modulo_rejected() {
        let def = FnDef {
            header: FnHeader::new(
                "f",
                vec![FnParam::new("x", SqlType::Double)],
                SqlType::Double,
            ),
            body: vec![Stmt::Return(Expr::Binary {
                op: BinaryOp::Mod,
                lhs: Box::new(Expr::Ident("x".to_string())),
                rhs: Box::new(Expr::Literal(Literal::Double(2.0))),
            })],
        };
        assert!(matches!(build(&def).unwrap_err(), CodegenError::Unsupported(_)));
    }

    #[test]
    fn test_unreachable_statement_rejected() {
        let def = FnDef {
            header: int_header("f"),
            body: vec![Stmt::Return(lit(1)), Stmt::Return(lit(2))],
        };
        assert!(matches!(build(&def).unwrap_err(), CodegenError::Unsupported(_)));
    }

    #[test]
    fn test_struct_literal_outside_return_rejected() {
        let def = FnDef {
            header: int_header("f"),
            body: vec![
                Stmt::Let {
                    name: "y".to_string(),
                    ty: SqlType::Int32,
                    value: Expr::Struct(vec![("a".to_string(), lit(1))]),
                },
                Stmt::Return(lit(0)),
            ],
        };
        assert!(matches!(build(&def).unwrap_err(), CodegenError::Unsupported(_)));
    }
}
