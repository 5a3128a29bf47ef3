use crate::code::Opcode;
use crate::emit::Emitter;
use crate::expr::{Ast, AstKind, BinaryOp, CallArg, UnaryOp};
use crate::symtab::{ids, ClassFlags, VarId, VarKind};
use crate::types::{TypeFlags, TypeRef};
use crate::vm::LilyResult;

/// Result of lowering one subtree: the register holding the value, its
/// type, and whether the register is a freshly built temporary (which lets
/// an assignment use the fast form).
#[derive(Debug, Clone)]
pub struct EvalOut {
    pub reg: u16,
    pub ty: TypeRef,
    pub is_temp: bool,
}

enum CallTarget {
    Readonly { spot: u16, foreign: bool },
    Register(u16),
}

impl Emitter {
    pub(crate) fn eval_tree(
        &mut self,
        ast: &Ast,
        expect: Option<&TypeRef>,
    ) -> LilyResult<EvalOut> {
        self.line = ast.line;

        match &ast.kind {
            AstKind::Integer(value) => self.eval_integer(*value),
            AstKind::Double(value) => {
                let ty = self.pool.double();
                let reg = self.get_storage(&ty);
                let spot = self.symtab.readonly_double(*value);
                self.code.write_4(Opcode::LoadReadonly.into(), spot, reg, self.line);
                Ok(EvalOut { reg, ty, is_temp: true })
            }
            AstKind::String(value) => {
                let ty = self.pool.string();
                let reg = self.get_storage(&ty);
                let spot = self.symtab.readonly_string(value);
                self.code.write_4(Opcode::LoadReadonly.into(), spot, reg, self.line);
                Ok(EvalOut { reg, ty, is_temp: true })
            }
            AstKind::Boolean(value) => {
                let ty = self.pool.boolean();
                let reg = self.get_storage(&ty);
                self.code.write_4(Opcode::LoadBoolean.into(), *value as u16, reg, self.line);
                Ok(EvalOut { reg, ty, is_temp: true })
            }
            AstKind::Byte(value) => {
                let ty = self.pool.integer();
                let reg = self.get_storage(&ty);
                self.code.write_4(Opcode::LoadByte.into(), *value as u16, reg, self.line);
                Ok(EvalOut { reg, ty, is_temp: true })
            }
            AstKind::Var(id) => self.eval_var(*id),
            AstKind::SelfVar => self.eval_self(),
            AstKind::Binary { op: BinaryOp::Assign, left, right } => {
                self.eval_assign(left, right)
            }
            AstKind::Binary { op: BinaryOp::And, left, right } => {
                self.eval_logical(true, left, right)
            }
            AstKind::Binary { op: BinaryOp::Or, left, right } => {
                self.eval_logical(false, left, right)
            }
            AstKind::Binary { op, left, right } => self.eval_binary(*op, left, right),
            AstKind::Unary { op, value } => self.eval_unary(*op, value),
            AstKind::Call { target, args } => self.eval_call(target, args, expect),
            AstKind::SuperCall { parent_class, args } => {
                self.eval_super_call(*parent_class, args)
            }
            AstKind::Variant { variant_class, args } => {
                self.eval_variant(*variant_class, args, expect)
            }
            AstKind::Subscript { source, index } => self.eval_subscript(source, index),
            AstKind::Property { source, index } => self.eval_property(source, *index),
            AstKind::BuildList(items) => self.eval_build_list(items, expect),
            AstKind::BuildTuple(items) => self.eval_build_tuple(items),
            AstKind::BuildHash(pairs) => self.eval_build_hash(pairs, expect),
            AstKind::Interpolation(items) => self.eval_interpolation(items),
            AstKind::DynamicCast { source, class_id } => {
                self.eval_dynamic_cast(source, *class_id)
            }
        }
    }

    fn eval_integer(&mut self, value: i64) -> LilyResult<EvalOut> {
        let ty = self.pool.integer();
        let reg = self.get_storage(&ty);

        // Small values ride in the instruction; the rest are interned.
        if (i16::MIN as i64..=i16::MAX as i64).contains(&value) {
            self.code.write_4(
                Opcode::LoadInteger.into(),
                value as i16 as u16,
                reg,
                self.line,
            );
        } else {
            let spot = self.symtab.readonly_integer(value);
            self.code.write_4(Opcode::LoadReadonly.into(), spot, reg, self.line);
        }

        Ok(EvalOut { reg, ty, is_temp: true })
    }

    fn eval_self(&mut self) -> LilyResult<EvalOut> {
        let fb_class = self
            .current_class()
            .ok_or_else(|| self.error("'self' used outside of a class."))?;

        let reg = self.self_reg().unwrap_or(0);
        let ty = self.pool.default_type(fb_class);
        Ok(EvalOut { reg, ty, is_temp: false })
    }

    fn current_class(&self) -> Option<u16> {
        // Walk up: the nearest function block with a class id.
        self.function_class_id()
    }

    /// Read a var: local, global, upvalue, or function reference.
    fn eval_var(&mut self, id: VarId) -> LilyResult<EvalOut> {
        let var = self.symtab.var(id).clone();

        match var.kind {
            VarKind::Local { reg, depth } => {
                if depth == self.function_depth {
                    Ok(EvalOut { reg, ty: var.ty, is_temp: false })
                } else {
                    // An enclosing function's local: route it through the
                    // closure.
                    let spot = self.close_over_var(id)?;
                    let out = self.get_storage(&var.ty);
                    self.code.write_4(Opcode::ClosureGet.into(), spot, out, self.line);
                    Ok(EvalOut { reg: out, ty: var.ty, is_temp: false })
                }
            }
            VarKind::Global { spot } => {
                let out = self.get_storage(&var.ty);
                self.code.write_4(Opcode::GlobalGet.into(), spot, out, self.line);
                Ok(EvalOut { reg: out, ty: var.ty, is_temp: false })
            }
            VarKind::ReadonlyFunc { spot, .. } => {
                let out = self.get_storage(&var.ty);
                if var.needs_closure {
                    self.code.write_4(Opcode::ClosureFunction.into(), spot, out, self.line);
                    self.mark_make_closure();
                } else {
                    self.code.write_4(Opcode::LoadReadonly.into(), spot, out, self.line);
                }
                Ok(EvalOut { reg: out, ty: var.ty, is_temp: true })
            }
        }
    }

    fn eval_binary(&mut self, op: BinaryOp, left: &Ast, right: &Ast) -> LilyResult<EvalOut> {
        let left_out = self.eval_tree(left, None)?;
        let right_out = self.eval_tree(right, None)?;
        self.line = right.line;

        let l_cls = left_out.ty.cls;
        let r_cls = right_out.ty.cls;
        let both_int = l_cls == ids::INTEGER && r_cls == ids::INTEGER;
        let numeric = (l_cls == ids::INTEGER || l_cls == ids::DOUBLE)
            && (r_cls == ids::INTEGER || r_cls == ids::DOUBLE);

        let (opcode, result_ty, lhs, rhs) = match op {
            BinaryOp::Plus | BinaryOp::Minus | BinaryOp::Multiply | BinaryOp::Divide => {
                if both_int {
                    let oc = match op {
                        BinaryOp::Plus => Opcode::IntAdd,
                        BinaryOp::Minus => Opcode::IntMinus,
                        BinaryOp::Multiply => Opcode::IntMul,
                        _ => Opcode::IntDiv,
                    };
                    (oc, self.pool.integer(), left_out.reg, right_out.reg)
                } else if numeric {
                    let oc = match op {
                        BinaryOp::Plus => Opcode::NumberAdd,
                        BinaryOp::Minus => Opcode::NumberMinus,
                        BinaryOp::Multiply => Opcode::NumberMul,
                        _ => Opcode::NumberDiv,
                    };
                    (oc, self.pool.double(), left_out.reg, right_out.reg)
                } else {
                    return Err(self.bad_binary_op(op, &left_out.ty, &right_out.ty));
                }
            }
            BinaryOp::Modulo
            | BinaryOp::LeftShift
            | BinaryOp::RightShift
            | BinaryOp::BitAnd
            | BinaryOp::BitOr
            | BinaryOp::BitXor => {
                if !both_int {
                    return Err(self.bad_binary_op(op, &left_out.ty, &right_out.ty));
                }
                let oc = match op {
                    BinaryOp::Modulo => Opcode::IntModulo,
                    BinaryOp::LeftShift => Opcode::IntLeftShift,
                    BinaryOp::RightShift => Opcode::IntRightShift,
                    BinaryOp::BitAnd => Opcode::IntBitAnd,
                    BinaryOp::BitOr => Opcode::IntBitOr,
                    _ => Opcode::IntBitXor,
                };
                (oc, self.pool.integer(), left_out.reg, right_out.reg)
            }
            BinaryOp::Eq | BinaryOp::NotEq => {
                if l_cls != r_cls {
                    return Err(self.bad_binary_op(op, &left_out.ty, &right_out.ty));
                }
                let oc = if op == BinaryOp::Eq {
                    Opcode::CompareEq
                } else {
                    Opcode::CompareNotEq
                };
                (oc, self.pool.boolean(), left_out.reg, right_out.reg)
            }
            BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
                let ordered = matches!(
                    l_cls,
                    ids::INTEGER | ids::DOUBLE | ids::STRING | ids::BYTESTRING
                );
                if !ordered || l_cls != r_cls {
                    return Err(self.bad_binary_op(op, &left_out.ty, &right_out.ty));
                }

                // Only the greater forms exist; less-than swaps operands.
                let (oc, swap) = match op {
                    BinaryOp::Gt => (Opcode::CompareGreater, false),
                    BinaryOp::GtEq => (Opcode::CompareGreaterEq, false),
                    BinaryOp::Lt => (Opcode::CompareGreater, true),
                    _ => (Opcode::CompareGreaterEq, true),
                };

                let (lhs, rhs) = if swap {
                    (right_out.reg, left_out.reg)
                } else {
                    (left_out.reg, right_out.reg)
                };
                (oc, self.pool.boolean(), lhs, rhs)
            }
            BinaryOp::And | BinaryOp::Or | BinaryOp::Assign => unreachable!(),
        };

        let out = self.get_storage(&result_ty);
        self.code.write_5(opcode.into(), lhs, rhs, out, self.line);
        Ok(EvalOut { reg: out, ty: result_ty, is_temp: true })
    }

    fn bad_binary_op(
        &self,
        op: BinaryOp,
        left: &TypeRef,
        right: &TypeRef,
    ) -> crate::vm::LilyError {
        self.error(format!(
            "Invalid operation: {} {:?} {}.",
            self.type_name(left),
            op,
            self.type_name(right)
        ))
    }

    fn eval_unary(&mut self, op: UnaryOp, value: &Ast) -> LilyResult<EvalOut> {
        let out = self.eval_tree(value, None)?;

        let (opcode, ok) = match op {
            UnaryOp::Not => (Opcode::UnaryNot, out.ty.cls == ids::BOOLEAN),
            UnaryOp::Minus => (
                Opcode::UnaryMinus,
                out.ty.cls == ids::INTEGER || out.ty.cls == ids::DOUBLE,
            ),
            UnaryOp::BitNot => (Opcode::UnaryBitNot, out.ty.cls == ids::INTEGER),
        };

        if !ok {
            return Err(self.error(format!(
                "Invalid operation: {:?} on type '{}'.",
                op,
                self.type_name(&out.ty)
            )));
        }

        let result = self.get_storage(&out.ty.clone());
        self.code.write_4(opcode.into(), out.reg, result, self.line);
        Ok(EvalOut { reg: result, ty: out.ty, is_temp: true })
    }

    /// Short-circuit && and ||, lowered to conditional jumps around two
    /// boolean loads.
    fn eval_logical(&mut self, is_and: bool, left: &Ast, right: &Ast) -> LilyResult<EvalOut> {
        let boolean = self.pool.boolean();
        let result = self.get_storage(&boolean);
        let jump_on = if is_and { 0 } else { 1 };

        let left_out = self.eval_tree(left, None)?;
        self.require_truthy(&left_out.ty)?;
        self.emit_jump_if(jump_on, left_out.reg);

        let right_out = self.eval_tree(right, None)?;
        self.require_truthy(&right_out.ty)?;
        self.emit_jump_if(jump_on, right_out.reg);

        // Fell through every test: success value, then hop the failure
        // load. The jump distance is fixed: one load is four words.
        self.code.write_4(
            Opcode::LoadBoolean.into(),
            is_and as u16,
            result,
            self.line,
        );
        self.code.write_2(Opcode::Jump.into(), 5);

        let patch_a = self.patches.pop();
        let patch_b = self.patches.pop();
        self.patch_here(patch_a);
        self.patch_here(patch_b);

        self.code.write_4(
            Opcode::LoadBoolean.into(),
            !is_and as u16,
            result,
            self.line,
        );

        Ok(EvalOut { reg: result, ty: boolean, is_temp: true })
    }

    fn require_truthy(&self, ty: &TypeRef) -> LilyResult<()> {
        match ty.cls {
            ids::BOOLEAN | ids::INTEGER => Ok(()),
            _ => Err(self.error(format!(
                "Condition expression is not truthy (type '{}').",
                self.type_name(ty)
            ))),
        }
    }

    /* ---------------- assignment ---------------- */

    fn eval_assign(&mut self, target: &Ast, source: &Ast) -> LilyResult<EvalOut> {
        match &target.kind {
            AstKind::Var(id) => self.eval_assign_var(*id, source),
            AstKind::Subscript { source: sub_source, index } => {
                self.eval_assign_subscript(sub_source, index, source)
            }
            AstKind::Property { source: prop_source, index } => {
                self.eval_assign_property(prop_source, *index, source)
            }
            _ => Err(self.error("Left side of = is not assignable.")),
        }
    }

    fn eval_assign_var(&mut self, id: VarId, source: &Ast) -> LilyResult<EvalOut> {
        let var = self.symtab.var(id).clone();
        let out = self.eval_tree(source, Some(&var.ty))?;

        let ok = if var.ty.flags.contains(TypeFlags::IS_UNRESOLVED) {
            self.ts.check(&mut self.pool, &self.symtab, &var.ty, &out.ty)
        } else {
            self.ts
                .type_greater_eq(&mut self.pool, &self.symtab, &var.ty, &out.ty)
        };
        if !ok {
            return Err(self.error(format!(
                "Cannot assign type '{}' to type '{}'.",
                self.type_name(&out.ty),
                self.type_name(&var.ty)
            )));
        }

        match var.kind {
            VarKind::Local { reg, depth } => {
                if depth == self.function_depth {
                    let opcode = if out.is_temp {
                        Opcode::FastAssign
                    } else {
                        Opcode::Assign
                    };
                    self.code.write_4(opcode.into(), out.reg, reg, self.line);
                } else {
                    let spot = self.close_over_var(id)?;
                    self.code.write_4(Opcode::ClosureSet.into(), spot, out.reg, self.line);
                }
            }
            VarKind::Global { spot } => {
                self.code.write_4(Opcode::GlobalSet.into(), spot, out.reg, self.line);
            }
            VarKind::ReadonlyFunc { .. } => {
                return Err(self.error("Cannot assign to a function."));
            }
        }

        Ok(out)
    }

    fn eval_assign_subscript(
        &mut self,
        source: &Ast,
        index: &Ast,
        value: &Ast,
    ) -> LilyResult<EvalOut> {
        let src = self.eval_tree(source, None)?;
        let idx = self.eval_tree(index, None)?;
        let elem_ty = self.subscript_result_type(&src.ty, &idx, index)?;

        let val = self.eval_tree(value, Some(&elem_ty))?;
        if !self
            .ts
            .type_greater_eq(&mut self.pool, &self.symtab, &elem_ty, &val.ty)
        {
            return Err(self.error(format!(
                "Cannot assign type '{}' to element type '{}'.",
                self.type_name(&val.ty),
                self.type_name(&elem_ty)
            )));
        }

        self.code
            .write_5(Opcode::SubscriptSet.into(), src.reg, idx.reg, val.reg, self.line);
        Ok(val)
    }

    fn eval_assign_property(
        &mut self,
        source: &Ast,
        index: u16,
        value: &Ast,
    ) -> LilyResult<EvalOut> {
        let src = self.eval_tree(source, None)?;
        let prop_ty = self.property_type(&src.ty, index)?;

        let val = self.eval_tree(value, Some(&prop_ty))?;
        if !self
            .ts
            .type_greater_eq(&mut self.pool, &self.symtab, &prop_ty, &val.ty)
        {
            return Err(self.error(format!(
                "Cannot assign type '{}' to property of type '{}'.",
                self.type_name(&val.ty),
                self.type_name(&prop_ty)
            )));
        }

        self.code
            .write_5(Opcode::PropertySet.into(), index, src.reg, val.reg, self.line);
        Ok(val)
    }

    /* ---------------- subscripts and properties ---------------- */

    fn subscript_result_type(
        &mut self,
        source_ty: &TypeRef,
        index_out: &EvalOut,
        index_ast: &Ast,
    ) -> LilyResult<TypeRef> {
        match source_ty.cls {
            ids::LIST => {
                if index_out.ty.cls != ids::INTEGER {
                    return Err(self.error("List index is not an Integer."));
                }
                Ok(source_ty.subtypes[0].clone())
            }
            ids::BYTESTRING => {
                if index_out.ty.cls != ids::INTEGER {
                    return Err(self.error("ByteString index is not an Integer."));
                }
                Ok(self.pool.integer())
            }
            ids::HASH => {
                let key_ty = &source_ty.subtypes[0];
                if !self
                    .ts
                    .type_greater_eq(&mut self.pool, &self.symtab, &key_ty.clone(), &index_out.ty)
                {
                    return Err(self.error("Hash subscript has the wrong key type."));
                }
                Ok(source_ty.subtypes[1].clone())
            }
            ids::TUPLE => {
                // Tuples need a literal index so the member type is known
                // at emit time.
                let index = match index_ast.kind {
                    AstKind::Integer(i) => i,
                    _ => {
                        return Err(self.error("Tuple subscript must be a literal Integer."))
                    }
                };
                if index < 0 || index as usize >= source_ty.subtypes.len() {
                    return Err(self.error(format!(
                        "Index {} is out of range for {}.",
                        index,
                        self.type_name(source_ty)
                    )));
                }
                Ok(source_ty.subtypes[index as usize].clone())
            }
            _ => Err(self.error(format!(
                "Cannot subscript type '{}'.",
                self.type_name(source_ty)
            ))),
        }
    }

    fn eval_subscript(&mut self, source: &Ast, index: &Ast) -> LilyResult<EvalOut> {
        let src = self.eval_tree(source, None)?;
        let idx = self.eval_tree(index, None)?;
        let elem_ty = self.subscript_result_type(&src.ty, &idx, index)?;

        let out = self.get_storage(&elem_ty);
        self.code
            .write_5(Opcode::SubscriptGet.into(), src.reg, idx.reg, out, self.line);
        Ok(EvalOut { reg: out, ty: elem_ty, is_temp: true })
    }

    fn property_type(&mut self, source_ty: &TypeRef, index: u16) -> LilyResult<TypeRef> {
        let prop = self
            .symtab
            .find_property(source_ty.cls, index)
            .ok_or_else(|| {
                self.error(format!(
                    "Type '{}' has no property {}.",
                    self.type_name(source_ty),
                    index
                ))
            })?
            .ty
            .clone();

        // Generic properties read through the source's own subtypes.
        if prop.flags.contains(TypeFlags::IS_UNRESOLVED) {
            Ok(self
                .ts
                .resolve_by_second(&mut self.pool, source_ty, &prop))
        } else {
            Ok(prop)
        }
    }

    fn eval_property(&mut self, source: &Ast, index: u16) -> LilyResult<EvalOut> {
        let src = self.eval_tree(source, None)?;
        let prop_ty = self.property_type(&src.ty, index)?;

        let out = self.get_storage(&prop_ty);
        self.code
            .write_5(Opcode::PropertyGet.into(), index, src.reg, out, self.line);
        Ok(EvalOut { reg: out, ty: prop_ty, is_temp: true })
    }

    /* ---------------- container builds ---------------- */

    fn eval_build_list(
        &mut self,
        items: &[Ast],
        expect: Option<&TypeRef>,
    ) -> LilyResult<EvalOut> {
        let expect_elem = expect
            .filter(|t| t.cls == ids::LIST)
            .map(|t| t.subtypes[0].clone());

        let mut elem_ty: Option<TypeRef> = expect_elem.clone().filter(|_| items.is_empty());
        let mut regs = Vec::with_capacity(items.len());

        for item in items {
            let out = self.eval_tree(item, expect_elem.as_ref())?;
            regs.push(out.reg);

            elem_ty = Some(match elem_ty {
                None => out.ty,
                Some(prev) => self
                    .ts
                    .unify(&mut self.pool, &self.symtab, &prev, &out.ty)
                    .ok_or_else(|| {
                        self.error("List elements do not have a consistent type.")
                    })?,
            });
        }

        let elem_ty = match elem_ty {
            Some(t) => t,
            None => self.pool.dynamic(),
        };

        let list_ty = self.pool.list_of(elem_ty);
        let out = self.get_storage(&list_ty);

        self.code
            .write_2(Opcode::BuildList.into(), regs.len() as u16);
        for reg in regs {
            self.code.write(reg);
        }
        self.code.write_2(out, self.line);

        Ok(EvalOut { reg: out, ty: list_ty, is_temp: true })
    }

    fn eval_build_tuple(&mut self, items: &[Ast]) -> LilyResult<EvalOut> {
        if items.is_empty() {
            return Err(self.error("Cannot create an empty Tuple."));
        }

        let mut types = Vec::with_capacity(items.len());
        let mut regs = Vec::with_capacity(items.len());

        for item in items {
            let out = self.eval_tree(item, None)?;
            types.push(out.ty);
            regs.push(out.reg);
        }

        let tuple_ty = self.pool.tuple_of(types);
        let out = self.get_storage(&tuple_ty);

        self.code
            .write_2(Opcode::BuildTuple.into(), regs.len() as u16);
        for reg in regs {
            self.code.write(reg);
        }
        self.code.write_2(out, self.line);

        Ok(EvalOut { reg: out, ty: tuple_ty, is_temp: true })
    }

    fn eval_build_hash(
        &mut self,
        pairs: &[(Ast, Ast)],
        expect: Option<&TypeRef>,
    ) -> LilyResult<EvalOut> {
        let (expect_key, expect_value) = match expect.filter(|t| t.cls == ids::HASH) {
            Some(t) => (Some(t.subtypes[0].clone()), Some(t.subtypes[1].clone())),
            None => (None, None),
        };

        let mut key_ty: Option<TypeRef> = expect_key.clone().filter(|_| pairs.is_empty());
        let mut value_ty: Option<TypeRef> = expect_value.clone().filter(|_| pairs.is_empty());
        let mut regs = Vec::with_capacity(pairs.len() * 2);

        for (key, value) in pairs {
            let key_out = self.eval_tree(key, expect_key.as_ref())?;
            if !self
                .symtab
                .class(key_out.ty.cls)
                .flags
                .contains(ClassFlags::VALID_HASH_KEY)
            {
                return Err(self.error(format!(
                    "Type '{}' is not a valid hash key.",
                    self.type_name(&key_out.ty)
                )));
            }

            let value_out = self.eval_tree(value, expect_value.as_ref())?;
            regs.push(key_out.reg);
            regs.push(value_out.reg);

            key_ty = Some(match key_ty {
                None => key_out.ty,
                Some(prev) => self
                    .ts
                    .unify(&mut self.pool, &self.symtab, &prev, &key_out.ty)
                    .ok_or_else(|| self.error("Hash keys do not have a consistent type."))?,
            });
            value_ty = Some(match value_ty {
                None => value_out.ty,
                Some(prev) => self
                    .ts
                    .unify(&mut self.pool, &self.symtab, &prev, &value_out.ty)
                    .ok_or_else(|| {
                        self.error("Hash values do not have a consistent type.")
                    })?,
            });
        }

        let key_ty = key_ty.unwrap_or_else(|| self.pool.integer());
        let value_ty = value_ty.unwrap_or_else(|| self.pool.dynamic());

        let hash_ty = self.pool.hash_of(key_ty, value_ty);
        let out = self.get_storage(&hash_ty);

        self.code
            .write_2(Opcode::BuildHash.into(), regs.len() as u16);
        for reg in regs {
            self.code.write(reg);
        }
        self.code.write_2(out, self.line);

        Ok(EvalOut { reg: out, ty: hash_ty, is_temp: true })
    }

    fn eval_interpolation(&mut self, items: &[Ast]) -> LilyResult<EvalOut> {
        let mut regs = Vec::with_capacity(items.len());
        for item in items {
            let out = self.eval_tree(item, None)?;
            regs.push(out.reg);
        }

        let string_ty = self.pool.string();
        let out = self.get_storage(&string_ty);

        self.code
            .write_2(Opcode::Interpolation.into(), regs.len() as u16);
        for reg in regs {
            self.code.write(reg);
        }
        self.code.write_2(out, self.line);

        Ok(EvalOut { reg: out, ty: string_ty, is_temp: true })
    }

    fn eval_dynamic_cast(&mut self, source: &Ast, class_id: u16) -> LilyResult<EvalOut> {
        let src = self.eval_tree(source, None)?;
        if src.ty.cls != ids::DYNAMIC {
            return Err(self.error("Cast source is not a Dynamic."));
        }

        let target = self.symtab.class(class_id).clone();
        if target.generic_count != 0 || target.flags.contains(ClassFlags::IS_ENUM) {
            return Err(self.error(format!(
                "Cannot cast a Dynamic to type '{}'.",
                target.name
            )));
        }

        let inner = self.pool.default_type(class_id);
        let option_ty = self.pool.option_of(inner);
        let out = self.get_storage(&option_ty);

        self.code
            .write_5(Opcode::DynamicCast.into(), class_id, src.reg, out, self.line);
        Ok(EvalOut { reg: out, ty: option_ty, is_temp: true })
    }

    /* ---------------- variants ---------------- */

    fn eval_variant(
        &mut self,
        variant_class: u16,
        args: &[Ast],
        expect: Option<&TypeRef>,
    ) -> LilyResult<EvalOut> {
        let cls = self.symtab.class(variant_class).clone();
        let enum_id = cls
            .parent
            .ok_or_else(|| self.error("Variant has no enum parent."))?;
        let enum_cls = self.symtab.class(enum_id).clone();

        self.ts.generics_seen(enum_cls.generic_count as usize);
        let save_ceiling = self.ts.raise_ceiling();

        let generics: Vec<TypeRef> = (0..enum_cls.generic_count)
            .map(|i| self.pool.generic(i))
            .collect();
        let self_type = self.pool.make(TypeFlags::empty(), enum_id, generics);

        // Inference can pin the enum's generics from the surrounding
        // context before the arguments are seen.
        if let Some(expect_ty) = expect {
            if expect_ty.cls == enum_id {
                self.ts
                    .check(&mut self.pool, &self.symtab, &self_type, expect_ty);
            }
        }

        let result = if cls.flags.contains(ClassFlags::EMPTY_VARIANT) {
            if !args.is_empty() {
                self.ts.lower_ceiling(save_ceiling);
                return Err(self.error(format!("Variant {} takes no values.", cls.name)));
            }

            // The canonical value is interned in the readonly table even
            // though the load goes through the class id.
            self.symtab.readonly_empty_variant(variant_class);

            let ty = self.ts.resolve(&mut self.pool, &self_type);
            let out = self.get_storage(&ty);
            self.code
                .write_4(Opcode::LoadEmptyVariant.into(), variant_class, out, self.line);
            EvalOut { reg: out, ty, is_temp: true }
        } else {
            if args.len() != cls.variant_args.len() {
                self.ts.lower_ceiling(save_ceiling);
                return Err(self.error(format!(
                    "Variant {} expects {} values, but got {}.",
                    cls.name,
                    cls.variant_args.len(),
                    args.len()
                )));
            }

            let mut regs = Vec::with_capacity(args.len());
            for (arg, want) in args.iter().zip(cls.variant_args.iter()) {
                let question = self.pool.question();
                let eval_expect = if want.flags.contains(TypeFlags::IS_UNRESOLVED) {
                    self.ts.resolve_with(&mut self.pool, want, &question)
                } else {
                    want.clone()
                };

                let out = self.eval_tree(arg, Some(&eval_expect))?;
                if !self.ts.check(&mut self.pool, &self.symtab, want, &out.ty) {
                    self.ts.lower_ceiling(save_ceiling);
                    return Err(self.error(format!(
                        "Variant {} argument has the wrong type.",
                        cls.name
                    )));
                }
                regs.push(out.reg);
            }

            let ty = self.ts.resolve(&mut self.pool, &self_type);
            let out = self.get_storage(&ty);

            self.code
                .write_3(Opcode::BuildVariant.into(), variant_class, regs.len() as u16);
            for reg in regs {
                self.code.write(reg);
            }
            self.code.write_2(out, self.line);

            EvalOut { reg: out, ty, is_temp: true }
        };

        self.ts.lower_ceiling(save_ceiling);
        Ok(result)
    }

    /* ---------------- calls ---------------- */

    fn eval_call(
        &mut self,
        target: &Ast,
        args: &[CallArg],
        _expect: Option<&TypeRef>,
    ) -> LilyResult<EvalOut> {
        // Variant application looks like a call but never is one.
        if let AstKind::Variant { variant_class, args: variant_args } = &target.kind {
            if args.is_empty() {
                return self.eval_variant(*variant_class, variant_args, _expect);
            }
        }

        let (call_ty, call_target) = self.begin_call(target)?;

        if call_ty.cls != ids::FUNCTION {
            return Err(self.error(format!(
                "Cannot anonymously call resulting type '{}'.",
                self.type_name(&call_ty)
            )));
        }

        self.ts.generics_seen(max_generics(&call_ty));
        let save_ceiling = self.ts.raise_ceiling();

        let result = self.run_call(&call_ty, call_target, args);
        self.ts.lower_ceiling(save_ceiling);
        result
    }

    fn begin_call(&mut self, target: &Ast) -> LilyResult<(TypeRef, CallTarget)> {
        if let AstKind::Var(id) = &target.kind {
            let var = self.symtab.var(*id).clone();
            if let VarKind::ReadonlyFunc { spot, foreign } = var.kind {
                if var.needs_closure {
                    // A nested function has to be called through a copy
                    // that carries the current cells.
                    let out = self.get_storage(&var.ty);
                    self.code
                        .write_4(Opcode::ClosureFunction.into(), spot, out, self.line);
                    self.mark_make_closure();
                    return Ok((var.ty, CallTarget::Register(out)));
                }
                return Ok((var.ty, CallTarget::Readonly { spot, foreign }));
            }
        }

        let out = self.eval_tree(target, None)?;
        Ok((out.ty, CallTarget::Register(out.reg)))
    }

    fn func_min_max(&self, call_ty: &TypeRef) -> (usize, usize) {
        let param_count = call_ty.subtypes.len() - 1;
        let mut min = param_count;
        let mut max = param_count;

        if call_ty.flags.contains(TypeFlags::HAS_OPTARGS) {
            min = call_ty.subtypes[1..]
                .iter()
                .position(|t| t.cls == ids::OPTARG)
                .unwrap_or(param_count);
        }

        if call_ty.flags.contains(TypeFlags::IS_VARARGS) {
            max = usize::MAX;
            if !call_ty.flags.contains(TypeFlags::HAS_OPTARGS) {
                min -= 1;
            }
        }

        (min, max)
    }

    /// Evaluate one argument against the type the callee wants at that
    /// position. Generic positions solve; concrete positions need a
    /// subtype match.
    fn eval_call_arg(&mut self, arg: &Ast, want: &TypeRef) -> LilyResult<EvalOut> {
        let want = if want.cls == ids::OPTARG {
            want.subtypes[0].clone()
        } else {
            want.clone()
        };

        let question = self.pool.question();
        let eval_expect = if want.flags.contains(TypeFlags::IS_UNRESOLVED) {
            self.ts.resolve_with(&mut self.pool, &want, &question)
        } else {
            want.clone()
        };

        let out = self.eval_tree(arg, Some(&eval_expect))?;
        let mut result_type = out.ty.clone();

        // A generic function passed by name keeps its own quantification:
        // solve it against the solved expectation in a scope of its own so
        // its generics cannot mix with the caller's.
        let named_func = matches!(
            &arg.kind,
            AstKind::Var(id)
                if matches!(self.symtab.var(*id).kind, VarKind::ReadonlyFunc { .. })
        );
        if result_type.flags.contains(TypeFlags::IS_UNRESOLVED) && named_func {
            let solved_want = self.ts.resolve(&mut self.pool, &want);

            let save = self.ts.scope_save();
            self.ts
                .check(&mut self.pool, &self.symtab, &result_type, &solved_want);
            let solved_result = self.ts.resolve(&mut self.pool, &result_type);
            self.ts.scope_restore(save);

            if crate::types::type_eq(&solved_result, &solved_want)
                || self.ts.type_greater_eq(
                    &mut self.pool,
                    &self.symtab,
                    &solved_want,
                    &solved_result,
                )
            {
                result_type = solved_result;
            }
        }

        let ok = if want.flags.contains(TypeFlags::IS_UNRESOLVED) {
            self.ts.check(&mut self.pool, &self.symtab, &want, &result_type)
        } else {
            self.ts
                .type_greater_eq(&mut self.pool, &self.symtab, &want, &result_type)
        };

        if !ok {
            return Err(self.error(format!(
                "Argument of type '{}' where type '{}' is wanted.",
                self.type_name(&result_type),
                self.type_name(&want)
            )));
        }

        Ok(out)
    }

    fn run_call(
        &mut self,
        call_ty: &TypeRef,
        target: CallTarget,
        args: &[CallArg],
    ) -> LilyResult<EvalOut> {
        let (min, max) = self.func_min_max(call_ty);
        let keyed = args.iter().any(|a| a.keyword_pos.is_some());

        if args.len() < min || args.len() > max {
            return Err(self.error(format!(
                "Wrong number of arguments (expected {}{}, got {}).",
                min,
                if max == usize::MAX {
                    "+".to_string()
                } else if max != min {
                    format!("..{}", max)
                } else {
                    String::new()
                },
                args.len()
            )));
        }

        if keyed {
            return self.run_call_keyed(call_ty, target, args);
        }

        let param_count = call_ty.subtypes.len() - 1;
        let is_varargs = call_ty.flags.contains(TypeFlags::IS_VARARGS);

        let stop = if !is_varargs || param_count > args.len() {
            args.len()
        } else {
            param_count - 1
        };

        let mut arg_regs = Vec::with_capacity(args.len());
        for (i, arg) in args[..stop].iter().enumerate() {
            let want = call_ty.subtypes[i + 1].clone();
            let out = self.eval_call_arg(&arg.expr, &want)?;
            arg_regs.push(out.reg);
        }

        // Excess arguments become the vararg list. Zero excess still
        // means an empty list, so the callee always sees one.
        let mut vararg_reg = None;
        if is_varargs && args.len() + 1 >= param_count {
            let vararg_list_ty = call_ty.subtypes[param_count].clone();
            let vararg_list_ty = if vararg_list_ty.cls == ids::OPTARG {
                vararg_list_ty.subtypes[0].clone()
            } else {
                vararg_list_ty
            };
            let inner_ty = vararg_list_ty.subtypes[0].clone();

            let mut tail_regs = Vec::new();
            for arg in args[stop..].iter() {
                let out = self.eval_call_arg(&arg.expr, &inner_ty)?;
                tail_regs.push(out.reg);
            }

            let resolved_inner = self.ts.resolve(&mut self.pool, &inner_ty);
            let list_ty = self.pool.list_of(resolved_inner);
            let list_reg = self.get_storage(&list_ty);

            self.code
                .write_2(Opcode::BuildList.into(), tail_regs.len() as u16);
            for reg in tail_regs {
                self.code.write(reg);
            }
            self.code.write_2(list_reg, self.line);

            vararg_reg = Some(list_reg);
        }

        let result_ty = self.setup_call_result(call_ty);
        let result_reg = self.get_storage(&result_ty);

        let (opcode, target_word) = call_words(&target);
        let argc = arg_regs.len() + vararg_reg.is_some() as usize;

        self.code.write_3(opcode.into(), target_word, argc as u16);
        for reg in arg_regs {
            self.code.write(reg);
        }
        if let Some(reg) = vararg_reg {
            self.code.write(reg);
        }
        self.code.write_2(result_reg, self.line);

        Ok(EvalOut { reg: result_reg, ty: result_ty, is_temp: true })
    }

    /// Keyword arguments are evaluated in source order, then re-linked
    /// into declaration order. Holes left by unpassed optional arguments
    /// are padded with the unset register so optarg dispatch can count the
    /// set prefix.
    fn run_call_keyed(
        &mut self,
        call_ty: &TypeRef,
        target: CallTarget,
        args: &[CallArg],
    ) -> LilyResult<EvalOut> {
        let param_count = call_ty.subtypes.len() - 1;
        let mut by_pos: Vec<Option<u16>> = vec![None; param_count];

        let mut next_positional = 0u16;
        for arg in args {
            let pos = match arg.keyword_pos {
                Some(pos) => pos,
                None => next_positional,
            } as usize;

            if pos >= param_count {
                return Err(self.error("Keyword argument position is out of range."));
            }
            if by_pos[pos].is_some() {
                return Err(self.error("Argument given twice."));
            }

            let want = call_ty.subtypes[pos + 1].clone();
            let out = self.eval_call_arg(&arg.expr, &want)?;
            by_pos[pos] = Some(out.reg);
            next_positional = (pos + 1) as u16;
        }

        // Verify that every required parameter was provided.
        let (min, _) = self.func_min_max(call_ty);
        for (i, slot) in by_pos[..min].iter().enumerate() {
            if slot.is_none() {
                return Err(self.error(format!("Call is missing argument {}.", i)));
            }
        }

        // Trim trailing holes; interior holes get the unset sentinel.
        let written = by_pos
            .iter()
            .rposition(|slot| slot.is_some())
            .map(|i| i + 1)
            .unwrap_or(0);

        let unset_reg = self.unset_reg();
        let result_ty = self.setup_call_result(call_ty);
        let result_reg = self.get_storage(&result_ty);

        let (opcode, target_word) = call_words(&target);
        self.code.write_3(opcode.into(), target_word, written as u16);
        for slot in by_pos[..written].iter() {
            self.code.write(slot.unwrap_or(unset_reg));
        }
        self.code.write_2(result_reg, self.line);

        Ok(EvalOut { reg: result_reg, ty: result_ty, is_temp: true })
    }

    fn setup_call_result(&mut self, call_ty: &TypeRef) -> TypeRef {
        let ret = call_ty.subtypes[0].clone();
        if ret.flags.contains(TypeFlags::IS_UNRESOLVED) {
            self.ts.resolve(&mut self.pool, &ret)
        } else {
            ret
        }
    }

    /// A super constructor call: lowered as a native call whose result is
    /// the current self register, so the instance being built threads up
    /// the frame chain.
    fn eval_super_call(&mut self, parent_class: u16, args: &[Ast]) -> LilyResult<EvalOut> {
        let self_reg = self
            .self_reg()
            .ok_or_else(|| self.error("Super call outside of a constructor."))?;

        let ctor_name = format!("{}.new", self.symtab.class_name(parent_class));
        let ctor_var = self
            .symtab
            .find_var(&ctor_name)
            .ok_or_else(|| self.error("Parent class has no constructor."))?;

        let var = self.symtab.var(ctor_var).clone();
        let spot = match var.kind {
            VarKind::ReadonlyFunc { spot, .. } => spot,
            _ => return Err(self.error("Parent constructor is not a function.")),
        };

        self.ts.generics_seen(max_generics(&var.ty));
        let save_ceiling = self.ts.raise_ceiling();

        let mut arg_regs = Vec::with_capacity(args.len());
        for (i, arg) in args.iter().enumerate() {
            if i + 1 >= var.ty.subtypes.len() {
                self.ts.lower_ceiling(save_ceiling);
                return Err(self.error("Too many arguments to super constructor."));
            }
            let want = var.ty.subtypes[i + 1].clone();
            let out = self.eval_call_arg(arg, &want)?;
            arg_regs.push(out.reg);
        }

        self.ts.lower_ceiling(save_ceiling);

        self.code
            .write_3(Opcode::CallNative.into(), spot, arg_regs.len() as u16);
        for reg in arg_regs {
            self.code.write(reg);
        }
        self.code.write_2(self_reg, self.line);

        let ty = self.pool.default_type(self.function_class_id().unwrap_or(parent_class));
        Ok(EvalOut { reg: self_reg, ty, is_temp: false })
    }
}

fn call_words(target: &CallTarget) -> (Opcode, u16) {
    match target {
        CallTarget::Readonly { spot, foreign: true } => (Opcode::CallForeign, *spot),
        CallTarget::Readonly { spot, foreign: false } => (Opcode::CallNative, *spot),
        CallTarget::Register(reg) => (Opcode::CallRegister, *reg),
    }
}

/// How many distinct generics a type mentions (the highest position plus
/// one).
fn max_generics(ty: &TypeRef) -> usize {
    fn walk(ty: &TypeRef, best: &mut usize) {
        if ty.cls == ids::GENERIC {
            let need = ty.generic_pos as usize + 1;
            if need > *best {
                *best = need;
            }
        }
        for sub in &ty.subtypes {
            walk(sub, best);
        }
    }

    let mut best = 0;
    walk(ty, &mut best);
    best
}
