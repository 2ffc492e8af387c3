//! Expression lowering.
//!
//! Every expression is lowered into a short IR sequence leaving its value in
//! a fresh numbered local. Lvalues are lowered to *places*: either a plain
//! memory address, or a bit field described by its storage unit address and
//! bit range. Aggregate values (records, `va_list`) are represented by their
//! address; scalar values are held directly.
//!
//! The usual arithmetic conversions are applied before binary operators,
//! widening with `sgnext`/`zrext` according to the source signedness.
//! Short-circuit `&&` and `||` lower to branches and joins, never to
//! arithmetic. Assignment evaluates the address of its left-hand side
//! exactly once.

use super::{expr_pos, CodeGen, ExprValue};
use crate::error::{CodegenError, CodegenResult};
use crate::ir::{self, Op, Operand, Width};
use crate::records::RecordRef;
use crate::scope::{MemberKind, ScopeMember};
use crate::types::{CGType, IntKind, Signedness};
use zcc_front::ast::{self, BinOp, Expr};
use zcc_front::srcpos::Pos;

/// An lvalue.
pub(crate) enum Place {
    /// A plain object at an address.
    Mem {
        /// Address operand (a 16-bit pointer value).
        addr: Operand,
        /// The object's type.
        ty: CGType,
    },
    /// A bit field within a storage unit.
    BitField {
        /// Address of the storage unit.
        unit_addr: Operand,
        /// Type of the storage unit.
        unit_ty: CGType,
        /// First bit of the field within the unit.
        bit_pos: u32,
        /// Width of the field in bits.
        bit_width: u32,
        /// The field's declared type.
        ty: CGType,
    },
}

impl<'a> CodeGen<'a> {
    // ------------------------------------------------------------------
    // Value lowering

    pub(crate) fn gen_expr(&mut self, e: &Expr) -> CodegenResult<ExprValue> {
        let pos = expr_pos(self.toks, e);
        match e {
            Expr::IntLit(id) => {
                let (value, ty) = self.parse_int_lit(*id)?;
                Ok(self.gen_imm(value, ty))
            }
            Expr::CharLit(id) => {
                let value = self.parse_char_lit(*id)?;
                Ok(self.gen_imm(value, CGType::int()))
            }
            Expr::StrLit(s) => {
                let sym = self.intern_string(s)?;
                Ok(ExprValue {
                    op: Operand::sym(sym),
                    ty: CGType::ptr_to(CGType::char()),
                })
            }
            Expr::Ident(id) => self.gen_ident(*id),
            Expr::Paren { inner, .. } => self.gen_expr(inner),
            Expr::Binop(b) => self.gen_binop(b, pos),
            Expr::Ternary(t) => self.gen_ternary(t, pos),
            Expr::Comma { lhs, rhs, .. } => {
                self.gen_expr(lhs)?;
                self.gen_expr(rhs)
            }
            Expr::Call(c) => self.gen_call(c, pos),
            Expr::Index(_) | Expr::Deref { .. } | Expr::Member { .. } | Expr::IndMember { .. } => {
                let place = self.gen_place(e)?;
                self.gen_load(place, pos)
            }
            Expr::AddrOf { arg, .. } => {
                let place = self.gen_place(arg)?;
                match place {
                    Place::Mem { addr, ty } => Ok(ExprValue {
                        op: addr,
                        ty: CGType::ptr_to(ty),
                    }),
                    Place::BitField { .. } => Err(CodegenError::InvalidInput(
                        pos,
                        "cannot take the address of a bit-field".to_string(),
                    )),
                }
            }
            Expr::Sizeof(_) => {
                let value = self.const_eval(e)?;
                Ok(self.gen_imm(
                    value,
                    CGType::Basic {
                        kind: IntKind::Int,
                        sign: Signedness::Unsigned,
                    },
                ))
            }
            Expr::Cast(c) => {
                let to = self.eval_type_name(&c.tname)?;
                let v = self.gen_expr(&c.arg)?;
                self.convert(v, &to, pos)
            }
            Expr::CompoundLit(c) => self.gen_compound_lit(c, pos),
            Expr::USign { negative, arg, .. } => {
                let v = self.gen_expr(arg)?;
                let ty = v.ty.promoted();
                let v = self.convert(v, &ty, pos)?;
                if !*negative {
                    return Ok(v);
                }
                let width = self.width_of(&ty, pos)?;
                let dest = self.new_tmp(&ty, pos)?;
                self.emit(ir::Instr {
                    op: Op::Neg,
                    width: Some(width),
                    dest: Some(dest.clone()),
                    op1: Some(v.op),
                    op2: None,
                    texpr: None,
                });
                Ok(ExprValue { op: dest, ty })
            }
            Expr::BitNot { arg, .. } => {
                let v = self.gen_expr(arg)?;
                let ty = v.ty.promoted();
                let v = self.convert(v, &ty, pos)?;
                let width = self.width_of(&ty, pos)?;
                let dest = self.new_tmp(&ty, pos)?;
                self.emit(ir::Instr {
                    op: Op::Bnot,
                    width: Some(width),
                    dest: Some(dest.clone()),
                    op1: Some(v.op),
                    op2: None,
                    texpr: None,
                });
                Ok(ExprValue { op: dest, ty })
            }
            Expr::LogNot { arg, .. } => {
                let v = self.gen_expr(arg)?;
                self.check_scalar(&v, pos)?;
                let width = self.width_of(&v.ty.decayed(), pos)?;
                let dest = self.new_tmp(&CGType::int(), pos)?;
                self.emit(ir::Instr {
                    op: Op::Eq,
                    width: Some(width),
                    dest: Some(dest.clone()),
                    op1: Some(v.op),
                    op2: Some(Operand::imm(0)),
                    texpr: None,
                });
                Ok(ExprValue {
                    op: dest,
                    ty: CGType::int(),
                })
            }
            Expr::PreAdjust { inc, arg, .. } => self.gen_adjust(arg, *inc, false, pos),
            Expr::PostAdjust { arg, inc, .. } => self.gen_adjust(arg, *inc, true, pos),
            Expr::VaArg(v) => {
                let ty = self.eval_type_name(&v.tname)?;
                let ap = self.gen_expr(&v.ap)?;
                if ap.ty != CGType::VaList {
                    return Err(CodegenError::InvalidInput(
                        pos,
                        "first operand of __va_arg must be a va_list".to_string(),
                    ));
                }
                let width = self.width_of(&ty, pos)?;
                let texpr = self.type_expr(&ty, pos)?;
                let dest = self.new_tmp(&ty, pos)?;
                self.emit(ir::Instr {
                    op: Op::Vaarg,
                    width: Some(width),
                    dest: Some(dest.clone()),
                    op1: Some(ap.op),
                    op2: None,
                    texpr: Some(texpr),
                });
                Ok(ExprValue { op: dest, ty })
            }
            Expr::VaOp(v) => self.gen_va_op(v, pos),
        }
    }

    /// A literal value. Constants ride along as immediate operands; the
    /// instruction selector prefers immediate forms over register forms.
    fn gen_imm(&mut self, value: i64, ty: CGType) -> ExprValue {
        ExprValue {
            op: Operand::imm(value),
            ty,
        }
    }

    fn gen_ident(&mut self, id: zcc_front::token::TokenId) -> CodegenResult<ExprValue> {
        let name = self.text(id).to_string();
        let pos = self.pos(id);
        let member = self
            .scopes
            .lookup(&name)
            .cloned()
            .ok_or_else(|| CodegenError::NotFound(pos, name.clone()))?;
        match member.kind {
            MemberKind::EnumElem(en, value) => {
                let v = self.gen_imm(value, CGType::int());
                Ok(ExprValue {
                    op: v.op,
                    ty: CGType::Enum(en),
                })
            }
            MemberKind::Typedef => Err(CodegenError::InvalidInput(
                pos,
                format!("'{}' is a type name", name),
            )),
            MemberKind::GlobalSym(ref irname)
                if matches!(member.cgtype, Some(CGType::Function(_))) =>
            {
                Ok(ExprValue {
                    op: Operand::sym(irname.clone()),
                    ty: member.cgtype.clone().expect("function member has a type"),
                })
            }
            _ => {
                let place = self.place_of_member(&member, pos)?;
                self.gen_load(place, pos)
            }
        }
    }

    // ------------------------------------------------------------------
    // Places

    fn place_of_member(&mut self, member: &ScopeMember, pos: Pos) -> CodegenResult<Place> {
        let ty = member.cgtype.clone().ok_or_else(|| {
            CodegenError::InvalidInput(pos, format!("'{}' has no object type", member.ident))
        })?;
        let (op, irop) = match &member.kind {
            MemberKind::LocalVar(ir) | MemberKind::Arg(ir) => (Op::Lvarptr, ir.clone()),
            MemberKind::GlobalSym(ir) => (Op::Varptr, ir.clone()),
            _ => {
                return Err(CodegenError::InvalidInput(
                    pos,
                    format!("'{}' is not an object", member.ident),
                ));
            }
        };
        let addr = self.new_tmp(&CGType::ptr_to(ty.clone()), pos)?;
        self.emit(ir::Instr {
            op,
            width: Some(Width::W16),
            dest: Some(addr.clone()),
            op1: Some(Operand::var(irop)),
            op2: None,
            texpr: None,
        });
        Ok(Place::Mem { addr, ty })
    }

    pub(crate) fn gen_place(&mut self, e: &Expr) -> CodegenResult<Place> {
        let pos = expr_pos(self.toks, e);
        match e {
            Expr::Ident(id) => {
                let name = self.text(*id).to_string();
                let member = self
                    .scopes
                    .lookup(&name)
                    .cloned()
                    .ok_or_else(|| CodegenError::NotFound(pos, name.clone()))?;
                self.place_of_member(&member, pos)
            }
            Expr::Paren { inner, .. } => self.gen_place(inner),
            Expr::Deref { arg, .. } => {
                let v = self.gen_expr(arg)?;
                match v.ty.decayed() {
                    CGType::Pointer { pointee, .. } => Ok(Place::Mem {
                        addr: v.op,
                        ty: *pointee,
                    }),
                    other => Err(CodegenError::InvalidInput(
                        pos,
                        format!("cannot dereference a value of type '{}'", other),
                    )),
                }
            }
            Expr::Index(ix) => {
                let base = self.gen_expr(&ix.base)?;
                let (elem, base_op) = match base.ty.decayed() {
                    CGType::Pointer { pointee, .. } => (*pointee, base.op),
                    other => {
                        return Err(CodegenError::InvalidInput(
                            pos,
                            format!("cannot index a value of type '{}'", other),
                        ));
                    }
                };
                let index = self.gen_expr(&ix.index)?;
                let index = self.convert(index, &CGType::int(), pos)?;
                let addr = self.gen_ptridx(base_op, index.op, &elem, pos)?;
                Ok(Place::Mem { addr, ty: elem })
            }
            Expr::Member {
                base,
                ident,
                period,
            } => {
                let place = self.gen_place(base)?;
                let addr = match place {
                    Place::Mem { addr, ty: CGType::Record(rec) } => (addr, rec),
                    Place::Mem { ty, .. } => {
                        return Err(CodegenError::InvalidInput(
                            self.pos(*period),
                            format!("member access on non-record type '{}'", ty),
                        ));
                    }
                    Place::BitField { .. } => {
                        return Err(CodegenError::InvalidInput(
                            self.pos(*period),
                            "member access on a bit-field".to_string(),
                        ));
                    }
                };
                self.member_place(addr.0, addr.1, *ident)
            }
            Expr::IndMember { base, ident, arrow } => {
                let v = self.gen_expr(base)?;
                let rec = match v.ty.decayed() {
                    CGType::Pointer { pointee, .. } => match *pointee {
                        CGType::Record(rec) => rec,
                        other => {
                            return Err(CodegenError::InvalidInput(
                                self.pos(*arrow),
                                format!("'->' on pointer to non-record type '{}'", other),
                            ));
                        }
                    },
                    other => {
                        return Err(CodegenError::InvalidInput(
                            self.pos(*arrow),
                            format!("'->' on non-pointer type '{}'", other),
                        ));
                    }
                };
                self.member_place(v.op, rec, *ident)
            }
            Expr::CompoundLit(_) => {
                // A compound literal is an unnamed object; materialise it.
                let v = self.gen_expr(e)?;
                if matches!(v.ty, CGType::Record(_) | CGType::VaList) {
                    Ok(Place::Mem {
                        addr: v.op,
                        ty: v.ty,
                    })
                } else {
                    self.gen_spill(v, pos)
                }
            }
            _ => Err(CodegenError::InvalidInput(
                pos,
                "expression is not a modifiable lvalue".to_string(),
            )),
        }
    }

    /// Store a scalar value into a fresh temporary object so it has an
    /// address.
    fn gen_spill(&mut self, v: ExprValue, pos: Pos) -> CodegenResult<Place> {
        let ty = v.ty.clone();
        let width = self.width_of(&ty, pos)?;
        let slot = self.new_tmp(&ty, pos)?;
        let slot_name = match &slot {
            Operand::Var(n) => n.clone(),
            _ => unreachable!("new_tmp returns a variable"),
        };
        let addr = self.new_tmp(&CGType::ptr_to(ty.clone()), pos)?;
        self.emit(ir::Instr {
            op: Op::Lvarptr,
            width: Some(Width::W16),
            dest: Some(addr.clone()),
            op1: Some(Operand::var(slot_name)),
            op2: None,
            texpr: None,
        });
        self.emit(ir::Instr {
            op: Op::Write,
            width: Some(width),
            dest: None,
            op1: Some(addr.clone()),
            op2: Some(v.op),
            texpr: None,
        });
        Ok(Place::Mem { addr, ty })
    }

    fn member_place(
        &mut self,
        base_addr: Operand,
        rec: RecordRef,
        ident: zcc_front::token::TokenId,
    ) -> CodegenResult<Place> {
        let name = self.text(ident).to_string();
        let pos = self.pos(ident);
        let def = &self.records.recs[rec];
        if !def.complete {
            return Err(CodegenError::InvalidInput(
                pos,
                format!("'{}' is incomplete", def.irident),
            ));
        }
        let elem = def
            .element(&name)
            .cloned()
            .ok_or_else(|| CodegenError::NotFound(pos, name.clone()))?;
        let irident = def.irident.clone();
        let offset = self.records.unit_offset(rec, elem.unit);
        let unit_ty = self.records.recs[rec].units[elem.unit].ty.clone();

        let addr = self.new_tmp(&CGType::ptr_to(unit_ty.clone()), pos)?;
        self.emit(ir::Instr {
            op: Op::Recmbr,
            width: None,
            dest: Some(addr.clone()),
            op1: Some(base_addr),
            op2: Some(Operand::imm(offset as i64)),
            texpr: Some(ir::TypeExpr::Ident(irident)),
        });
        if elem.is_bitfield() {
            Ok(Place::BitField {
                unit_addr: addr,
                unit_ty,
                bit_pos: elem.bit_pos,
                bit_width: elem.bit_width,
                ty: elem.ty,
            })
        } else {
            Ok(Place::Mem { addr, ty: elem.ty })
        }
    }

    // ------------------------------------------------------------------
    // Loads, stores, conversions

    /// Load the value of a place.
    pub(crate) fn gen_load(&mut self, place: Place, pos: Pos) -> CodegenResult<ExprValue> {
        match place {
            Place::Mem { addr, ty } => match &ty {
                // Aggregates are represented by their address.
                CGType::Record(_) | CGType::VaList => Ok(ExprValue { op: addr, ty }),
                // An array lvalue decays into a pointer to its first
                // element.
                CGType::Array { elem, .. } => Ok(ExprValue {
                    op: addr,
                    ty: CGType::ptr_to((**elem).clone()),
                }),
                _ => {
                    let width = self.width_of(&ty, pos)?;
                    let dest = self.new_tmp(&ty, pos)?;
                    self.emit(ir::Instr {
                        op: Op::Read,
                        width: Some(width),
                        dest: Some(dest.clone()),
                        op1: Some(addr),
                        op2: None,
                        texpr: None,
                    });
                    Ok(ExprValue { op: dest, ty })
                }
            },
            Place::BitField {
                unit_addr,
                unit_ty,
                bit_pos,
                bit_width,
                ty,
            } => {
                let width = self.width_of(&unit_ty, pos)?;
                let raw = self.new_tmp(&unit_ty, pos)?;
                self.emit(ir::Instr {
                    op: Op::Read,
                    width: Some(width),
                    dest: Some(raw.clone()),
                    op1: Some(unit_addr),
                    op2: None,
                    texpr: None,
                });
                let shifted = if bit_pos > 0 {
                    let t = self.new_tmp(&unit_ty, pos)?;
                    self.emit(ir::Instr {
                        op: Op::Shrl,
                        width: Some(width),
                        dest: Some(t.clone()),
                        op1: Some(raw),
                        op2: Some(Operand::imm(bit_pos as i64)),
                        texpr: None,
                    });
                    t
                } else {
                    raw
                };
                let mask = (1i64 << bit_width) - 1;
                let dest = self.new_tmp(&unit_ty, pos)?;
                self.emit(ir::Instr {
                    op: Op::And,
                    width: Some(width),
                    dest: Some(dest.clone()),
                    op1: Some(shifted),
                    op2: Some(Operand::imm(mask)),
                    texpr: None,
                });
                let v = ExprValue {
                    op: dest,
                    ty: unit_ty,
                };
                self.convert(v, &ty, pos)
            }
        }
    }

    /// Store `value` into `place`, converting to the place's type. Returns
    /// the stored value.
    pub(crate) fn gen_store(
        &mut self,
        place: Place,
        value: ExprValue,
        pos: Pos,
    ) -> CodegenResult<ExprValue> {
        match place {
            Place::Mem { addr, ty } => {
                if let CGType::Record(_) = &ty {
                    if !value.ty.compatible(&ty) {
                        return Err(CodegenError::InvalidInput(
                            pos,
                            format!("cannot assign '{}' to '{}'", value.ty, ty),
                        ));
                    }
                    let texpr = self.type_expr(&ty, pos)?;
                    self.emit(ir::Instr {
                        op: Op::Reccopy,
                        width: None,
                        dest: None,
                        op1: Some(addr.clone()),
                        op2: Some(value.op),
                        texpr: Some(texpr),
                    });
                    return Ok(ExprValue { op: addr, ty });
                }
                let value = self.convert_for_assign(value, &ty, pos)?;
                let width = self.width_of(&ty, pos)?;
                self.emit(ir::Instr {
                    op: Op::Write,
                    width: Some(width),
                    dest: None,
                    op1: Some(addr),
                    op2: Some(value.op.clone()),
                    texpr: None,
                });
                Ok(value)
            }
            Place::BitField {
                unit_addr,
                unit_ty,
                bit_pos,
                bit_width,
                ty,
            } => {
                let width = self.width_of(&unit_ty, pos)?;
                let value = self.convert_for_assign(value, &ty, pos)?;
                let uval = self.convert(value.clone(), &unit_ty, pos)?;
                let mask = (1i64 << bit_width) - 1;

                // new = (unit & ~(mask << pos)) | ((value & mask) << pos)
                let raw = self.new_tmp(&unit_ty, pos)?;
                self.emit(ir::Instr {
                    op: Op::Read,
                    width: Some(width),
                    dest: Some(raw.clone()),
                    op1: Some(unit_addr.clone()),
                    op2: None,
                    texpr: None,
                });
                let cleared = self.new_tmp(&unit_ty, pos)?;
                self.emit(ir::Instr {
                    op: Op::And,
                    width: Some(width),
                    dest: Some(cleared.clone()),
                    op1: Some(raw),
                    op2: Some(Operand::imm(!(mask << bit_pos))),
                    texpr: None,
                });
                let masked = self.new_tmp(&unit_ty, pos)?;
                self.emit(ir::Instr {
                    op: Op::And,
                    width: Some(width),
                    dest: Some(masked.clone()),
                    op1: Some(uval.op),
                    op2: Some(Operand::imm(mask)),
                    texpr: None,
                });
                let shifted = if bit_pos > 0 {
                    let t = self.new_tmp(&unit_ty, pos)?;
                    self.emit(ir::Instr {
                        op: Op::Shl,
                        width: Some(width),
                        dest: Some(t.clone()),
                        op1: Some(masked),
                        op2: Some(Operand::imm(bit_pos as i64)),
                        texpr: None,
                    });
                    t
                } else {
                    masked
                };
                let merged = self.new_tmp(&unit_ty, pos)?;
                self.emit(ir::Instr {
                    op: Op::Or,
                    width: Some(width),
                    dest: Some(merged.clone()),
                    op1: Some(cleared),
                    op2: Some(shifted),
                    texpr: None,
                });
                self.emit(ir::Instr {
                    op: Op::Write,
                    width: Some(width),
                    dest: None,
                    op1: Some(unit_addr),
                    op2: Some(merged),
                    texpr: None,
                });
                Ok(value)
            }
        }
    }

    /// Check assignment compatibility and convert.
    fn convert_for_assign(
        &mut self,
        value: ExprValue,
        to: &CGType,
        pos: Pos,
    ) -> CodegenResult<ExprValue> {
        let from = value.ty.decayed();
        let ok = to.compatible(&from)
            || (to.is_integer() && from.is_integer())
            // A literal zero converts to any pointer.
            || (to.is_pointer() && from.is_integer());
        if !ok {
            return Err(CodegenError::InvalidInput(
                pos,
                format!("cannot assign a value of type '{}' to '{}'", from, to),
            ));
        }
        self.convert(value, to, pos)
    }

    /// Convert a value to another scalar type.
    pub(crate) fn convert(
        &mut self,
        value: ExprValue,
        to: &CGType,
        pos: Pos,
    ) -> CodegenResult<ExprValue> {
        if *to == CGType::Void {
            return Ok(ExprValue {
                op: Operand::imm(0),
                ty: CGType::Void,
            });
        }
        let from = value.ty.decayed();
        if from == *to {
            return Ok(ExprValue { op: value.op, ty: from });
        }
        // Aggregates only convert to themselves.
        if !from.is_scalar() || !to.is_scalar() {
            if from.compatible(to) {
                return Ok(ExprValue {
                    op: value.op,
                    ty: to.clone(),
                });
            }
            return Err(CodegenError::InvalidInput(
                pos,
                format!("cannot convert '{}' to '{}'", from, to),
            ));
        }
        let from_w = self.width_of(&from, pos)?;
        let to_w = self.width_of(to, pos)?;

        // `_Bool` conversion normalises to 0 or 1.
        if matches!(
            to,
            CGType::Basic {
                kind: IntKind::Logical,
                ..
            }
        ) {
            let dest = self.new_tmp(to, pos)?;
            self.emit(ir::Instr {
                op: Op::Neq,
                width: Some(from_w),
                dest: Some(dest.clone()),
                op1: Some(value.op),
                op2: Some(Operand::imm(0)),
                texpr: None,
            });
            return Ok(ExprValue {
                op: dest,
                ty: to.clone(),
            });
        }

        if from_w == to_w {
            // Same width: a pure reinterpretation.
            return Ok(ExprValue {
                op: value.op,
                ty: to.clone(),
            });
        }
        let dest = self.new_tmp(to, pos)?;
        let op = if to_w.bits() < from_w.bits() {
            Op::Trunc
        } else if from.signedness() == Signedness::Signed {
            Op::Sgnext
        } else {
            Op::Zrext
        };
        // The width tag is the destination width; the source width rides in
        // the type operand.
        let texpr = self.type_expr(&from, pos).ok();
        self.emit(ir::Instr {
            op,
            width: Some(to_w),
            dest: Some(dest.clone()),
            op1: Some(value.op),
            op2: None,
            texpr,
        });
        Ok(ExprValue {
            op: dest,
            ty: to.clone(),
        })
    }

    fn check_scalar(&self, v: &ExprValue, pos: Pos) -> CodegenResult<()> {
        if v.ty.decayed().is_scalar() {
            Ok(())
        } else {
            Err(CodegenError::InvalidInput(
                pos,
                format!("expected a scalar value, got '{}'", v.ty),
            ))
        }
    }

    // ------------------------------------------------------------------
    // Operators

    /// `ptridx`: scale an index by the element size and add it to a
    /// pointer.
    fn gen_ptridx(
        &mut self,
        base: Operand,
        index: Operand,
        elem: &CGType,
        pos: Pos,
    ) -> CodegenResult<Operand> {
        let texpr = self.type_expr(elem, pos)?;
        let dest = self.new_tmp(&CGType::ptr_to(elem.clone()), pos)?;
        self.emit(ir::Instr {
            op: Op::Ptridx,
            width: Some(Width::W16),
            dest: Some(dest.clone()),
            op1: Some(base),
            op2: Some(index),
            texpr: Some(texpr),
        });
        Ok(dest)
    }

    fn gen_binop(&mut self, b: &ast::BinopExpr, pos: Pos) -> CodegenResult<ExprValue> {
        if b.op.is_assign() {
            return self.gen_assign(b, pos);
        }
        match b.op {
            BinOp::LAnd | BinOp::LOr => self.gen_short_circuit(b, pos),
            _ => {
                let lhs = self.gen_expr(&b.lhs)?;
                let rhs = self.gen_expr(&b.rhs)?;
                self.gen_arith(b.op, lhs, rhs, pos)
            }
        }
    }

    /// A non-assigning binary operator over already-lowered operands.
    fn gen_arith(
        &mut self,
        op: BinOp,
        lhs: ExprValue,
        rhs: ExprValue,
        pos: Pos,
    ) -> CodegenResult<ExprValue> {
        self.check_scalar(&lhs, pos)?;
        self.check_scalar(&rhs, pos)?;
        let lty = lhs.ty.decayed();
        let rty = rhs.ty.decayed();

        // Pointer arithmetic.
        if matches!(op, BinOp::Add | BinOp::Sub) {
            match (&lty, &rty) {
                (CGType::Pointer { pointee, .. }, r) if r.is_integer() => {
                    let idx = self.convert(rhs, &CGType::int(), pos)?;
                    let idx = if op == BinOp::Sub {
                        let neg = self.new_tmp(&CGType::int(), pos)?;
                        self.emit(ir::Instr {
                            op: Op::Neg,
                            width: Some(Width::W16),
                            dest: Some(neg.clone()),
                            op1: Some(idx.op),
                            op2: None,
                            texpr: None,
                        });
                        neg
                    } else {
                        idx.op
                    };
                    let elem = (**pointee).clone();
                    let addr = self.gen_ptridx(lhs.op, idx, &elem, pos)?;
                    return Ok(ExprValue {
                        op: addr,
                        ty: lty.clone(),
                    });
                }
                (l, CGType::Pointer { pointee, .. }) if l.is_integer() && op == BinOp::Add => {
                    let idx = self.convert(lhs, &CGType::int(), pos)?;
                    let elem = (**pointee).clone();
                    let addr = self.gen_ptridx(rhs.op, idx.op, &elem, pos)?;
                    return Ok(ExprValue {
                        op: addr,
                        ty: rty.clone(),
                    });
                }
                (CGType::Pointer { pointee, .. }, CGType::Pointer { .. })
                    if op == BinOp::Sub =>
                {
                    let texpr = self.type_expr(pointee, pos)?;
                    let dest = self.new_tmp(&CGType::int(), pos)?;
                    self.emit(ir::Instr {
                        op: Op::Ptrdiff,
                        width: Some(Width::W16),
                        dest: Some(dest.clone()),
                        op1: Some(lhs.op),
                        op2: Some(rhs.op),
                        texpr: Some(texpr),
                    });
                    return Ok(ExprValue {
                        op: dest,
                        ty: CGType::int(),
                    });
                }
                _ => {}
            }
        }

        // Comparisons: choose the signed or unsigned opcode variant by the
        // promoted operand type; pointers compare unsigned.
        if let Some(cmp) = comparison_ops(op) {
            let common = if lty.is_pointer() || rty.is_pointer() {
                lty.clone()
            } else {
                lty.usual_arith(&rty)
            };
            let unsigned =
                common.is_pointer() || common.signedness() == Signedness::Unsigned;
            let (lhs, rhs, width) = if common.is_pointer() {
                (lhs, rhs, Width::W16)
            } else {
                let l = self.convert(lhs, &common, pos)?;
                let r = self.convert(rhs, &common, pos)?;
                let w = self.width_of(&common, pos)?;
                (l, r, w)
            };
            let opcode = if unsigned { cmp.1 } else { cmp.0 };
            let dest = self.new_tmp(&CGType::int(), pos)?;
            self.emit(ir::Instr {
                op: opcode,
                width: Some(width),
                dest: Some(dest.clone()),
                op1: Some(lhs.op),
                op2: Some(rhs.op),
                texpr: None,
            });
            return Ok(ExprValue {
                op: dest,
                ty: CGType::int(),
            });
        }

        // Shifts promote each operand separately; the result has the type
        // of the promoted left operand.
        if matches!(op, BinOp::Shl | BinOp::Shr) {
            let ty = lty.promoted();
            let lhs = self.convert(lhs, &ty, pos)?;
            let rhs = self.convert(rhs, &ty, pos)?;
            let width = self.width_of(&ty, pos)?;
            let opcode = match op {
                BinOp::Shl => Op::Shl,
                _ if ty.signedness() == Signedness::Signed => Op::Shra,
                _ => Op::Shrl,
            };
            let dest = self.new_tmp(&ty, pos)?;
            self.emit(ir::Instr {
                op: opcode,
                width: Some(width),
                dest: Some(dest.clone()),
                op1: Some(lhs.op),
                op2: Some(rhs.op),
                texpr: None,
            });
            return Ok(ExprValue { op: dest, ty });
        }

        // Plain arithmetic under the usual conversions.
        let common = lty.usual_arith(&rty);
        let lhs = self.convert(lhs, &common, pos)?;
        let rhs = self.convert(rhs, &common, pos)?;
        let width = self.width_of(&common, pos)?;
        let unsigned = common.signedness() == Signedness::Unsigned;
        let opcode = match op {
            BinOp::Add => Op::Add,
            BinOp::Sub => Op::Sub,
            BinOp::Mul => Op::Mul,
            BinOp::Div => {
                if unsigned {
                    Op::Udiv
                } else {
                    Op::Sdiv
                }
            }
            BinOp::Mod => {
                if unsigned {
                    Op::Umod
                } else {
                    Op::Smod
                }
            }
            BinOp::BAnd => Op::And,
            BinOp::BOr => Op::Or,
            BinOp::BXor => Op::Xor,
            other => {
                return Err(CodegenError::InvalidInput(
                    pos,
                    format!("operator {:?} is not arithmetic", other),
                ));
            }
        };
        let dest = self.new_tmp(&common, pos)?;
        self.emit(ir::Instr {
            op: opcode,
            width: Some(width),
            dest: Some(dest.clone()),
            op1: Some(lhs.op),
            op2: Some(rhs.op),
            texpr: None,
        });
        Ok(ExprValue {
            op: dest,
            ty: common,
        })
    }

    fn gen_assign(&mut self, b: &ast::BinopExpr, pos: Pos) -> CodegenResult<ExprValue> {
        // The address is evaluated exactly once.
        let place = self.gen_place(&b.lhs)?;
        match b.op.without_assign() {
            None => {
                let rhs = self.gen_expr(&b.rhs)?;
                self.gen_store(place, rhs, pos)
            }
            Some(arith) => {
                let current = self.load_place_again(&place, pos)?;
                let rhs = self.gen_expr(&b.rhs)?;
                let result = self.gen_arith(arith, current, rhs, pos)?;
                self.gen_store(place, result, pos)
            }
        }
    }

    /// Load from a place without consuming it.
    fn load_place_again(&mut self, place: &Place, pos: Pos) -> CodegenResult<ExprValue> {
        let copy = match place {
            Place::Mem { addr, ty } => Place::Mem {
                addr: addr.clone(),
                ty: ty.clone(),
            },
            Place::BitField {
                unit_addr,
                unit_ty,
                bit_pos,
                bit_width,
                ty,
            } => Place::BitField {
                unit_addr: unit_addr.clone(),
                unit_ty: unit_ty.clone(),
                bit_pos: *bit_pos,
                bit_width: *bit_width,
                ty: ty.clone(),
            },
        };
        self.gen_load(copy, pos)
    }

    fn gen_adjust(
        &mut self,
        arg: &Expr,
        inc: bool,
        post: bool,
        pos: Pos,
    ) -> CodegenResult<ExprValue> {
        let place = self.gen_place(arg)?;
        let old = self.load_place_again(&place, pos)?;
        let ty = old.ty.clone();
        let new = if ty.is_pointer() {
            let elem = match ty.decayed() {
                CGType::Pointer { pointee, .. } => *pointee,
                _ => unreachable!(),
            };
            let one = self.gen_imm(if inc { 1 } else { -1 }, CGType::int());
            let addr = self.gen_ptridx(old.op.clone(), one.op, &elem, pos)?;
            ExprValue {
                op: addr,
                ty: ty.clone(),
            }
        } else {
            let width = self.width_of(&ty.promoted(), pos)?;
            let promoted = self.convert(old.clone(), &ty.promoted(), pos)?;
            let dest = self.new_tmp(&ty.promoted(), pos)?;
            self.emit(ir::Instr {
                op: if inc { Op::Add } else { Op::Sub },
                width: Some(width),
                dest: Some(dest.clone()),
                op1: Some(promoted.op),
                op2: Some(Operand::imm(1)),
                texpr: None,
            });
            ExprValue {
                op: dest,
                ty: ty.promoted(),
            }
        };
        let stored = self.gen_store(place, new, pos)?;
        Ok(if post { old } else { stored })
    }

    fn gen_short_circuit(&mut self, b: &ast::BinopExpr, pos: Pos) -> CodegenResult<ExprValue> {
        let is_and = b.op == BinOp::LAnd;
        let short = self.new_label(if is_and { "false" } else { "true" });
        let end = self.new_label("sc_end");
        let dest = self.new_tmp(&CGType::int(), pos)?;

        let lhs = self.gen_expr(&b.lhs)?;
        self.check_scalar(&lhs, pos)?;
        let lw = self.width_of(&lhs.ty.decayed(), pos)?;
        self.emit(ir::Instr {
            op: if is_and { Op::Jz } else { Op::Jnz },
            width: Some(lw),
            dest: Some(Operand::var(short.clone())),
            op1: Some(lhs.op),
            op2: None,
            texpr: None,
        });
        let rhs = self.gen_expr(&b.rhs)?;
        self.check_scalar(&rhs, pos)?;
        let rw = self.width_of(&rhs.ty.decayed(), pos)?;
        self.emit(ir::Instr {
            op: if is_and { Op::Jz } else { Op::Jnz },
            width: Some(rw),
            dest: Some(Operand::var(short.clone())),
            op1: Some(rhs.op),
            op2: None,
            texpr: None,
        });
        // Both operands fell through.
        self.emit(ir::Instr {
            op: Op::Imm,
            width: Some(Width::W16),
            dest: Some(dest.clone()),
            op1: Some(Operand::imm(if is_and { 1 } else { 0 })),
            op2: None,
            texpr: None,
        });
        self.emit(ir::Instr {
            op: Op::Jmp,
            width: None,
            dest: Some(Operand::var(end.clone())),
            op1: None,
            op2: None,
            texpr: None,
        });
        self.emit_label(&short);
        self.emit(ir::Instr {
            op: Op::Imm,
            width: Some(Width::W16),
            dest: Some(dest.clone()),
            op1: Some(Operand::imm(if is_and { 0 } else { 1 })),
            op2: None,
            texpr: None,
        });
        self.emit_label(&end);
        Ok(ExprValue {
            op: dest,
            ty: CGType::int(),
        })
    }

    fn gen_ternary(&mut self, t: &ast::TernaryExpr, pos: Pos) -> CodegenResult<ExprValue> {
        let cond = self.gen_expr(&t.cond)?;
        self.check_scalar(&cond, pos)?;
        let cw = self.width_of(&cond.ty.decayed(), pos)?;
        let els_label = self.new_label("tern_else");
        let end_label = self.new_label("tern_end");
        self.emit(ir::Instr {
            op: Op::Jz,
            width: Some(cw),
            dest: Some(Operand::var(els_label.clone())),
            op1: Some(cond.op),
            op2: None,
            texpr: None,
        });

        // The common type cannot be known before lowering one arm; use the
        // then-arm's converted type as the result type.
        let then = self.gen_expr(&t.then)?;
        let then_ty = then.ty.decayed();
        let result_ty = if then_ty.is_integer() {
            then_ty.promoted()
        } else {
            then_ty.clone()
        };
        let dest = self.new_tmp(&result_ty, pos)?;
        let then = self.convert(then, &result_ty, pos)?;
        let width = self.width_of(&result_ty, pos)?;
        self.emit(ir::Instr {
            op: Op::Copy,
            width: Some(width),
            dest: Some(dest.clone()),
            op1: Some(then.op),
            op2: None,
            texpr: None,
        });
        self.emit(ir::Instr {
            op: Op::Jmp,
            width: None,
            dest: Some(Operand::var(end_label.clone())),
            op1: None,
            op2: None,
            texpr: None,
        });
        self.emit_label(&els_label);
        let els = self.gen_expr(&t.els)?;
        let els = self.convert(els, &result_ty, pos)?;
        self.emit(ir::Instr {
            op: Op::Copy,
            width: Some(width),
            dest: Some(dest.clone()),
            op1: Some(els.op),
            op2: None,
            texpr: None,
        });
        self.emit_label(&end_label);
        Ok(ExprValue {
            op: dest,
            ty: result_ty,
        })
    }

    // ------------------------------------------------------------------
    // Calls

    fn gen_call(&mut self, c: &ast::CallExpr, pos: Pos) -> CodegenResult<ExprValue> {
        let callee = self.gen_expr(&c.callee)?;
        let (ft, callee_op, direct) = match callee.ty.clone() {
            CGType::Function(ft) => (ft, callee.op, true),
            CGType::Pointer { pointee, .. } => match *pointee {
                CGType::Function(ft) => (ft, callee.op, false),
                other => {
                    return Err(CodegenError::InvalidInput(
                        pos,
                        format!("called value of type '{}' is not a function", other),
                    ));
                }
            },
            other => {
                return Err(CodegenError::InvalidInput(
                    pos,
                    format!("called value of type '{}' is not a function", other),
                ));
            }
        };

        if c.args.len() < ft.args.len() || (!ft.variadic && c.args.len() > ft.args.len()) {
            return Err(CodegenError::InvalidInput(
                pos,
                format!(
                    "wrong number of arguments: expected {}{}, got {}",
                    ft.args.len(),
                    if ft.variadic { " or more" } else { "" },
                    c.args.len()
                ),
            ));
        }

        let mut lowered = Vec::with_capacity(c.args.len());
        for (i, (_, arg)) in c.args.iter().enumerate() {
            let v = self.gen_expr(arg)?;
            let v = match ft.args.get(i) {
                Some(want) => self.convert_for_assign(v, want, pos)?,
                // Extra variadic arguments undergo the default promotions.
                None => {
                    let ty = v.ty.decayed().promoted();
                    self.convert(v, &ty, pos)?
                }
            };
            lowered.push(v.op);
        }

        let (dest, width, ret_ty) = match &ft.ret {
            CGType::Void => (None, None, CGType::Void),
            ty @ CGType::Record(_) => {
                return Err(CodegenError::Unsupported(
                    pos,
                    format!("returning '{}' by value", ty),
                ));
            }
            ty => {
                let w = self.width_of(ty, pos)?;
                (Some(self.new_tmp(ty, pos)?), Some(w), ty.clone())
            }
        };

        if direct {
            self.emit(ir::Instr {
                op: Op::Call,
                width,
                dest: dest.clone(),
                op1: Some(callee_op),
                op2: Some(Operand::List(lowered)),
                texpr: None,
            });
        } else {
            let texpr = self.type_expr(&CGType::Function(ft.clone()), pos)?;
            self.emit(ir::Instr {
                op: Op::Calli,
                width,
                dest: dest.clone(),
                op1: Some(callee_op),
                op2: Some(Operand::List(lowered)),
                texpr: Some(texpr),
            });
        }
        Ok(ExprValue {
            op: dest.unwrap_or(Operand::imm(0)),
            ty: ret_ty,
        })
    }

    fn gen_compound_lit(&mut self, c: &ast::CompoundLitExpr, pos: Pos) -> CodegenResult<ExprValue> {
        let ty = self.eval_type_name(&c.tname)?;
        // The literal is an unnamed local object initialised field by
        // field.
        let slot = self.new_tmp(&ty, pos)?;
        let slot_name = match &slot {
            Operand::Var(n) => n.clone(),
            _ => unreachable!("new_tmp returns a variable"),
        };
        let addr = self.new_tmp(&CGType::ptr_to(ty.clone()), pos)?;
        self.emit(ir::Instr {
            op: Op::Lvarptr,
            width: Some(Width::W16),
            dest: Some(addr.clone()),
            op1: Some(Operand::var(slot_name)),
            op2: None,
            texpr: None,
        });
        self.gen_compound_into(addr.clone(), &ty, &c.init, pos)?;
        match &ty {
            CGType::Record(_) | CGType::VaList => Ok(ExprValue { op: addr, ty }),
            CGType::Array { elem, .. } => Ok(ExprValue {
                op: addr,
                ty: CGType::ptr_to((**elem).clone()),
            }),
            _ => {
                let place = Place::Mem { addr, ty };
                self.gen_load(place, pos)
            }
        }
    }

    // ------------------------------------------------------------------
    // Local initialisation

    /// Initialise the object at `addr` of type `ty` from an initialiser.
    pub(crate) fn gen_init_into(
        &mut self,
        addr: Operand,
        ty: &CGType,
        init: &ast::Init,
        pos: Pos,
    ) -> CodegenResult<()> {
        match init {
            ast::Init::Expr(e) => {
                // A char array may be initialised from a string literal.
                if let (CGType::Array { elem, size }, Expr::StrLit(s)) = (ty, e.as_ref()) {
                    if elem.size(&self.records) == Some(1) {
                        let mut bytes = self.string_bytes(s)?;
                        bytes.push(0);
                        if let Some(n) = size {
                            bytes.truncate(*n as usize);
                        }
                        for (i, b) in bytes.iter().enumerate() {
                            let v = self.gen_imm(*b as i64, CGType::char());
                            let slot =
                                self.gen_ptridx(addr.clone(), Operand::imm(i as i64), elem, pos)?;
                            self.emit(ir::Instr {
                                op: Op::Write,
                                width: Some(Width::W8),
                                dest: None,
                                op1: Some(slot),
                                op2: Some(v.op),
                                texpr: None,
                            });
                        }
                        return Ok(());
                    }
                }
                let v = self.gen_expr(e)?;
                let place = Place::Mem {
                    addr,
                    ty: ty.clone(),
                };
                self.gen_store(place, v, pos)?;
                Ok(())
            }
            ast::Init::Compound(c) => self.gen_compound_into(addr, ty, c, pos),
        }
    }

    /// Initialise the object at `addr` from a braced initialiser.
    fn gen_compound_into(
        &mut self,
        addr: Operand,
        ty: &CGType,
        c: &ast::CompoundInit,
        pos: Pos,
    ) -> CodegenResult<()> {
        match ty {
                CGType::Array { size, elem } => {
                    let mut index = 0i64;
                    for entry in &c.entries {
                        for d in &entry.designators {
                            match d {
                                ast::Designator::Index { index: e, .. } => {
                                    index = self.const_eval(e)?;
                                }
                                ast::Designator::Member { period, .. } => {
                                    return Err(CodegenError::InvalidInput(
                                        self.pos(*period),
                                        "member designator in array initialiser".to_string(),
                                    ));
                                }
                            }
                        }
                        if let Some(n) = size {
                            if index as u64 >= *n {
                                return Err(CodegenError::InvalidInput(
                                    self.pos(c.lbrace),
                                    format!("array index {} out of bounds", index),
                                ));
                            }
                        }
                        let slot =
                            self.gen_ptridx(addr.clone(), Operand::imm(index), elem, pos)?;
                        self.gen_init_into(slot, elem, &entry.init, pos)?;
                        index += 1;
                    }
                    Ok(())
                }
                CGType::Record(rec) => {
                    let elems: Vec<_> = self.records.recs[*rec].elements.clone();
                    let irident = self.records.recs[*rec].irident.clone();
                    let mut index = 0usize;
                    for entry in &c.entries {
                        for d in &entry.designators {
                            match d {
                                ast::Designator::Member { ident, .. } => {
                                    let name = self.text(*ident);
                                    index = elems
                                        .iter()
                                        .position(|e| e.name == name)
                                        .ok_or_else(|| {
                                            CodegenError::NotFound(
                                                self.pos(*ident),
                                                name.to_string(),
                                            )
                                        })?;
                                }
                                ast::Designator::Index { lbracket, .. } => {
                                    return Err(CodegenError::InvalidInput(
                                        self.pos(*lbracket),
                                        "index designator in record initialiser".to_string(),
                                    ));
                                }
                            }
                        }
                        let elem = elems.get(index).ok_or_else(|| {
                            CodegenError::InvalidInput(
                                self.pos(c.lbrace),
                                "too many initialisers".to_string(),
                            )
                        })?;
                        let offset = self.records.unit_offset(*rec, elem.unit);
                        let unit_ty = self.records.recs[*rec].units[elem.unit].ty.clone();
                        let eaddr = self.new_tmp(&CGType::ptr_to(unit_ty), pos)?;
                        self.emit(ir::Instr {
                            op: Op::Recmbr,
                            width: None,
                            dest: Some(eaddr.clone()),
                            op1: Some(addr.clone()),
                            op2: Some(Operand::imm(offset as i64)),
                            texpr: Some(ir::TypeExpr::Ident(irident.clone())),
                        });
                        if elem.is_bitfield() {
                            let place = Place::BitField {
                                unit_addr: eaddr,
                                unit_ty: self.records.recs[*rec].units[elem.unit].ty.clone(),
                                bit_pos: elem.bit_pos,
                                bit_width: elem.bit_width,
                                ty: elem.ty.clone(),
                            };
                            match &entry.init {
                                ast::Init::Expr(e) => {
                                    let v = self.gen_expr(e)?;
                                    self.gen_store(place, v, pos)?;
                                }
                                ast::Init::Compound(inner) => {
                                    return Err(CodegenError::InvalidInput(
                                        self.pos(inner.lbrace),
                                        "braced initialiser for a bit-field".to_string(),
                                    ));
                                }
                            }
                        } else {
                            self.gen_init_into(eaddr, &elem.ty, &entry.init, pos)?;
                        }
                        index += 1;
                    }
                    Ok(())
                }
                _ => match c.entries.first() {
                    Some(entry) if entry.designators.is_empty() => {
                        self.gen_init_into(addr, ty, &entry.init, pos)
                    }
                    _ => Err(CodegenError::InvalidInput(
                        self.pos(c.lbrace),
                        "invalid initialiser".to_string(),
                    )),
                },
        }
    }

    // ------------------------------------------------------------------
    // Variable arguments

    fn gen_va_op(&mut self, v: &ast::VaOpExpr, pos: Pos) -> CodegenResult<ExprValue> {
        let void = ExprValue {
            op: Operand::imm(0),
            ty: CGType::Void,
        };
        match v.kind {
            ast::VaOpKind::Start => {
                let (ap, last) = match v.args.as_slice() {
                    [(_, ap), (_, last)] => (ap, last),
                    _ => {
                        return Err(CodegenError::InvalidInput(
                            pos,
                            "__va_start takes a va_list and the last fixed argument".to_string(),
                        ));
                    }
                };
                let apv = self.gen_expr(ap)?;
                if apv.ty != CGType::VaList {
                    return Err(CodegenError::InvalidInput(
                        pos,
                        "first operand of __va_start must be a va_list".to_string(),
                    ));
                }
                let last_index = match last {
                    Expr::Ident(id) => {
                        let name = self.text(*id).to_string();
                        self.param_index(&name).ok_or_else(|| {
                            CodegenError::InvalidInput(
                                self.pos(*id),
                                format!("'{}' is not a parameter", name),
                            )
                        })?
                    }
                    other => {
                        return Err(CodegenError::InvalidInput(
                            expr_pos(self.toks, other),
                            "second operand of __va_start must name a parameter".to_string(),
                        ));
                    }
                };
                self.emit(ir::Instr {
                    op: Op::Vastart,
                    width: None,
                    dest: None,
                    op1: Some(apv.op),
                    op2: Some(Operand::var(format!("%{}", last_index))),
                    texpr: None,
                });
                Ok(void)
            }
            ast::VaOpKind::End => {
                let ap = match v.args.as_slice() {
                    [(_, ap)] => ap,
                    _ => {
                        return Err(CodegenError::InvalidInput(
                            pos,
                            "__va_end takes a single va_list".to_string(),
                        ));
                    }
                };
                let apv = self.gen_expr(ap)?;
                self.emit(ir::Instr {
                    op: Op::Vaend,
                    width: None,
                    dest: None,
                    op1: Some(apv.op),
                    op2: None,
                    texpr: None,
                });
                Ok(void)
            }
            ast::VaOpKind::Copy => {
                let (dst, src) = match v.args.as_slice() {
                    [(_, d), (_, s)] => (d, s),
                    _ => {
                        return Err(CodegenError::InvalidInput(
                            pos,
                            "__va_copy takes two va_lists".to_string(),
                        ));
                    }
                };
                let dv = self.gen_expr(dst)?;
                let sv = self.gen_expr(src)?;
                self.emit(ir::Instr {
                    op: Op::Vacopy,
                    width: None,
                    dest: None,
                    op1: Some(dv.op),
                    op2: Some(sv.op),
                    texpr: None,
                });
                Ok(void)
            }
        }
    }

    // ------------------------------------------------------------------
    // Structural typing (for sizeof on expressions)

    /// The type of an expression without lowering it. `sizeof` must not
    /// evaluate its operand.
    pub(crate) fn type_of_expr(&mut self, e: &Expr) -> CodegenResult<CGType> {
        let pos = expr_pos(self.toks, e);
        match e {
            Expr::IntLit(id) => Ok(self.parse_int_lit(*id)?.1),
            Expr::CharLit(_) => Ok(CGType::int()),
            Expr::StrLit(s) => {
                let n = self.string_bytes(s)?.len() as u64 + 1;
                Ok(CGType::Array {
                    size: Some(n),
                    elem: Box::new(CGType::char()),
                })
            }
            Expr::Ident(id) => {
                let name = self.text(*id).to_string();
                let member = self
                    .scopes
                    .lookup(&name)
                    .ok_or_else(|| CodegenError::NotFound(pos, name.clone()))?;
                match &member.kind {
                    MemberKind::EnumElem(..) => Ok(CGType::int()),
                    _ => member.cgtype.clone().ok_or_else(|| {
                        CodegenError::InvalidInput(pos, format!("'{}' has no type", name))
                    }),
                }
            }
            Expr::Paren { inner, .. } => self.type_of_expr(inner),
            Expr::Binop(b) => {
                if b.op.is_assign() {
                    return self.type_of_expr(&b.lhs);
                }
                match b.op {
                    BinOp::LAnd
                    | BinOp::LOr
                    | BinOp::Lt
                    | BinOp::LtEq
                    | BinOp::Gt
                    | BinOp::GtEq
                    | BinOp::Eq
                    | BinOp::NotEq => Ok(CGType::int()),
                    BinOp::Shl | BinOp::Shr => Ok(self.type_of_expr(&b.lhs)?.decayed().promoted()),
                    _ => {
                        let l = self.type_of_expr(&b.lhs)?.decayed();
                        let r = self.type_of_expr(&b.rhs)?.decayed();
                        if l.is_pointer() {
                            if r.is_pointer() {
                                return Ok(CGType::int());
                            }
                            return Ok(l);
                        }
                        if r.is_pointer() {
                            return Ok(r);
                        }
                        Ok(l.usual_arith(&r))
                    }
                }
            }
            Expr::Ternary(t) => {
                let ty = self.type_of_expr(&t.then)?.decayed();
                Ok(if ty.is_integer() { ty.promoted() } else { ty })
            }
            Expr::Comma { rhs, .. } => self.type_of_expr(rhs),
            Expr::Call(c) => {
                let cty = self.type_of_expr(&c.callee)?.decayed();
                match cty {
                    CGType::Function(ft) => Ok(ft.ret.clone()),
                    CGType::Pointer { pointee, .. } => match *pointee {
                        CGType::Function(ft) => Ok(ft.ret.clone()),
                        _ => Err(CodegenError::InvalidInput(
                            pos,
                            "called value is not a function".to_string(),
                        )),
                    },
                    _ => Err(CodegenError::InvalidInput(
                        pos,
                        "called value is not a function".to_string(),
                    )),
                }
            }
            Expr::Index(ix) => {
                let base = self.type_of_expr(&ix.base)?.decayed();
                match base {
                    CGType::Pointer { pointee, .. } => Ok(*pointee),
                    other => Err(CodegenError::InvalidInput(
                        pos,
                        format!("cannot index '{}'", other),
                    )),
                }
            }
            Expr::Deref { arg, .. } => {
                let base = self.type_of_expr(arg)?.decayed();
                match base {
                    CGType::Pointer { pointee, .. } => Ok(*pointee),
                    other => Err(CodegenError::InvalidInput(
                        pos,
                        format!("cannot dereference '{}'", other),
                    )),
                }
            }
            Expr::AddrOf { arg, .. } => Ok(CGType::ptr_to(self.type_of_expr(arg)?)),
            Expr::Sizeof(_) => Ok(CGType::Basic {
                kind: IntKind::Int,
                sign: Signedness::Unsigned,
            }),
            Expr::Cast(c) => self.eval_type_name(&c.tname),
            Expr::CompoundLit(c) => self.eval_type_name(&c.tname),
            Expr::Member { base, ident, .. } => {
                let bty = self.type_of_expr(base)?;
                self.member_type(&bty, *ident)
            }
            Expr::IndMember { base, ident, .. } => {
                let bty = self.type_of_expr(base)?.decayed();
                match bty {
                    CGType::Pointer { pointee, .. } => self.member_type(&pointee, *ident),
                    other => Err(CodegenError::InvalidInput(
                        pos,
                        format!("'->' on non-pointer type '{}'", other),
                    )),
                }
            }
            Expr::USign { arg, .. } | Expr::BitNot { arg, .. } => {
                Ok(self.type_of_expr(arg)?.decayed().promoted())
            }
            Expr::LogNot { .. } => Ok(CGType::int()),
            Expr::PreAdjust { arg, .. } | Expr::PostAdjust { arg, .. } => self.type_of_expr(arg),
            Expr::VaArg(v) => self.eval_type_name(&v.tname),
            Expr::VaOp(_) => Ok(CGType::Void),
        }
    }

    fn member_type(
        &mut self,
        base: &CGType,
        ident: zcc_front::token::TokenId,
    ) -> CodegenResult<CGType> {
        let pos = self.pos(ident);
        let name = self.text(ident).to_string();
        match base {
            CGType::Record(rec) => self.records.recs[*rec]
                .element(&name)
                .map(|e| e.ty.clone())
                .ok_or_else(|| CodegenError::NotFound(pos, name)),
            other => Err(CodegenError::InvalidInput(
                pos,
                format!("member access on non-record type '{}'", other),
            )),
        }
    }
}

/// The (signed, unsigned) IR opcode pair of a comparison operator.
fn comparison_ops(op: BinOp) -> Option<(Op, Op)> {
    Some(match op {
        BinOp::Eq => (Op::Eq, Op::Eq),
        BinOp::NotEq => (Op::Neq, Op::Neq),
        BinOp::Lt => (Op::Lt, Op::Ltu),
        BinOp::LtEq => (Op::Lteq, Op::Lteu),
        BinOp::Gt => (Op::Gt, Op::Gtu),
        BinOp::GtEq => (Op::Gteq, Op::Gteu),
        _ => return None,
    })
}
