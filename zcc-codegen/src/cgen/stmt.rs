//! Statement lowering.
//!
//! Control flow lowers to conditional and unconditional jumps over labels in
//! the flat labelled block. Loops keep a stack of break/continue targets;
//! `switch` collects its case values up front and emits a compare-and-jump
//! chain in source order; `goto` resolves through the function-wide label
//! table built before the body is lowered.

use super::{expr_pos, CodeGen};
use crate::error::{CodegenError, CodegenResult};
use crate::ir::{self, Op, Operand, Width};
use crate::scope::{MemberKind, ScopeMember};
use crate::types::CGType;
use zcc_front::ast::{self, Expr, Stmt};
use zcc_front::srcpos::Pos;

/// The compare-and-jump plan of one `switch` statement.
pub(crate) struct SwitchPlan {
    /// `(value, label)` in source order.
    cases: Vec<(i64, String)>,
    /// Label of `default:`, when present.
    default: Option<String>,
    /// Queue of labels consumed by case/default statements during body
    /// lowering; mirrors the order the pre-scan discovered them in.
    queue: Vec<String>,
    next: usize,
}

impl<'a> CodeGen<'a> {
    pub(crate) fn gen_block(&mut self, block: &ast::Block) -> CodegenResult<()> {
        self.scopes.push();
        let result = self.gen_stmts(&block.stmts);
        self.scopes.pop();
        result
    }

    fn gen_stmts(&mut self, stmts: &[Stmt]) -> CodegenResult<()> {
        for s in stmts {
            self.gen_stmt(s)?;
        }
        Ok(())
    }

    pub(crate) fn gen_stmt(&mut self, s: &Stmt) -> CodegenResult<()> {
        match s {
            Stmt::Null { .. } => Ok(()),
            Stmt::Expr { expr, .. } => {
                self.gen_expr(expr)?;
                Ok(())
            }
            Stmt::Block(b) => self.gen_block(b),
            Stmt::Decl(d) => self.gen_local_decl(d),
            Stmt::Return {
                return_tok, value, ..
            } => self.gen_return(*return_tok, value.as_deref()),
            Stmt::Break { break_tok, .. } => {
                let pos = self.pos(*break_tok);
                let label = self.break_label(pos)?;
                self.gen_jmp(&label);
                Ok(())
            }
            Stmt::Continue { continue_tok, .. } => {
                let pos = self.pos(*continue_tok);
                let label = self.continue_label(pos)?;
                self.gen_jmp(&label);
                Ok(())
            }
            Stmt::Goto {
                goto_tok, target, ..
            } => {
                let name = self.text(*target).to_string();
                let pos = self.pos(*goto_tok);
                let label = self.goto_label(&name, pos)?;
                self.gen_jmp(&label);
                Ok(())
            }
            Stmt::Label { ident, .. } => {
                let name = self.text(*ident).to_string();
                let pos = self.pos(*ident);
                let label = self.goto_label(&name, pos)?;
                self.emit_label(&label);
                Ok(())
            }
            Stmt::If(i) => self.gen_if(i),
            Stmt::While(w) => self.gen_while(w),
            Stmt::Do(d) => self.gen_do(d),
            Stmt::For(f) => self.gen_for(f),
            Stmt::Switch(sw) => self.gen_switch(sw),
            Stmt::CaseLabel { case_tok, .. } | Stmt::DefaultLabel {
                default_tok: case_tok,
                ..
            } => {
                let pos = self.pos(*case_tok);
                let label = self.take_switch_label(pos)?;
                self.emit_label(&label);
                Ok(())
            }
            Stmt::Asm(a) => self.gen_asm(a),
            Stmt::LoopMacro(l) => Err(CodegenError::Unsupported(
                self.pos(l.name),
                format!("loop macro '{}'", self.text(l.name)),
            )),
        }
    }

    fn gen_jmp(&mut self, label: &str) {
        self.emit(ir::Instr {
            op: Op::Jmp,
            width: None,
            dest: Some(Operand::var(label.to_string())),
            op1: None,
            op2: None,
            texpr: None,
        });
    }

    /// Evaluate a controlling expression and jump to `label` when it is
    /// zero (or nonzero, with `jump_if_true`).
    fn gen_cond_jump(
        &mut self,
        cond: &Expr,
        label: &str,
        jump_if_true: bool,
    ) -> CodegenResult<()> {
        let pos = expr_pos(self.toks, cond);
        let v = self.gen_expr(cond)?;
        let ty = v.ty.decayed();
        if !ty.is_scalar() {
            return Err(CodegenError::InvalidInput(
                pos,
                format!("condition of type '{}' is not scalar", ty),
            ));
        }
        let width = self.width_of(&ty, pos)?;
        self.emit(ir::Instr {
            op: if jump_if_true { Op::Jnz } else { Op::Jz },
            width: Some(width),
            dest: Some(Operand::var(label.to_string())),
            op1: Some(v.op),
            op2: None,
            texpr: None,
        });
        Ok(())
    }

    fn gen_return(&mut self, tok: zcc_front::token::TokenId, value: Option<&Expr>) -> CodegenResult<()> {
        let pos = self.pos(tok);
        let ret_ty = self.ret_ty();
        match (value, &ret_ty) {
            (None, CGType::Void) => {
                self.emit(ir::Instr {
                    op: Op::Ret,
                    width: None,
                    dest: None,
                    op1: None,
                    op2: None,
                    texpr: None,
                });
                Ok(())
            }
            (None, ty) => Err(CodegenError::InvalidInput(
                pos,
                format!("return without a value in a function returning '{}'", ty),
            )),
            (Some(_), CGType::Void) => Err(CodegenError::InvalidInput(
                pos,
                "return with a value in a void function".to_string(),
            )),
            (Some(e), ty) => {
                let v = self.gen_expr(e)?;
                let v = self.convert(v, ty, pos)?;
                let width = self.width_of(ty, pos)?;
                self.emit(ir::Instr {
                    op: Op::Retv,
                    width: Some(width),
                    dest: None,
                    op1: Some(v.op),
                    op2: None,
                    texpr: None,
                });
                Ok(())
            }
        }
    }

    fn gen_if(&mut self, i: &ast::IfStmt) -> CodegenResult<()> {
        let end = self.new_label("if_end");
        // Each arm jumps to the next test on a false condition.
        let mut next = self.new_label("if_else");
        self.gen_cond_jump(&i.cond, &next, false)?;
        self.gen_stmt(&i.tbranch)?;
        self.gen_jmp(&end);
        self.emit_label(&next);
        for ei in &i.elseifs {
            next = self.new_label("if_else");
            self.gen_cond_jump(&ei.cond, &next, false)?;
            self.gen_stmt(&ei.branch)?;
            self.gen_jmp(&end);
            self.emit_label(&next);
        }
        if let Some((_, branch)) = &i.ebranch {
            self.gen_stmt(branch)?;
        }
        self.emit_label(&end);
        Ok(())
    }

    fn gen_while(&mut self, w: &ast::WhileStmt) -> CodegenResult<()> {
        let top = self.new_label("while_top");
        let end = self.new_label("while_end");
        self.emit_label(&top);
        self.gen_cond_jump(&w.cond, &end, false)?;
        self.push_loop(end.clone(), Some(top.clone()));
        let result = self.gen_stmt(&w.body);
        self.pop_loop(true);
        result?;
        self.gen_jmp(&top);
        self.emit_label(&end);
        Ok(())
    }

    fn gen_do(&mut self, d: &ast::DoStmt) -> CodegenResult<()> {
        let top = self.new_label("do_top");
        let cont = self.new_label("do_cont");
        let end = self.new_label("do_end");
        self.emit_label(&top);
        self.push_loop(end.clone(), Some(cont.clone()));
        let result = self.gen_stmt(&d.body);
        self.pop_loop(true);
        result?;
        self.emit_label(&cont);
        self.gen_cond_jump(&d.cond, &top, true)?;
        self.emit_label(&end);
        Ok(())
    }

    fn gen_for(&mut self, f: &ast::ForStmt) -> CodegenResult<()> {
        // The loop header declaration lives in a scope of its own.
        self.scopes.push();
        let result = self.gen_for_inner(f);
        self.scopes.pop();
        result
    }

    fn gen_for_inner(&mut self, f: &ast::ForStmt) -> CodegenResult<()> {
        match &f.init {
            ast::ForInit::Decl(d) => self.gen_local_decl(d)?,
            ast::ForInit::Expr(e, _) => {
                self.gen_expr(e)?;
            }
            ast::ForInit::Empty(_) => {}
        }
        let top = self.new_label("for_top");
        let cont = self.new_label("for_cont");
        let end = self.new_label("for_end");
        self.emit_label(&top);
        if let Some(cond) = &f.cond {
            self.gen_cond_jump(cond, &end, false)?;
        }
        self.push_loop(end.clone(), Some(cont.clone()));
        let result = self.gen_stmt(&f.body);
        self.pop_loop(true);
        result?;
        self.emit_label(&cont);
        if let Some(next) = &f.next {
            self.gen_expr(next)?;
        }
        self.gen_jmp(&top);
        self.emit_label(&end);
        Ok(())
    }

    // ------------------------------------------------------------------
    // switch

    fn gen_switch(&mut self, sw: &ast::SwitchStmt) -> CodegenResult<()> {
        let pos = self.pos(sw.switch_tok);
        let v = self.gen_expr(&sw.expr)?;
        let ty = v.ty.decayed();
        if !ty.is_integer() {
            return Err(CodegenError::InvalidInput(
                pos,
                format!("switch on non-integer type '{}'", ty),
            ));
        }
        let ty = ty.promoted();
        let v = self.convert(v, &ty, pos)?;
        let width = self.width_of(&ty, pos)?;
        let end = self.new_label("switch_end");

        // Pre-scan the body for case and default labels, in source order.
        let mut plan = SwitchPlan {
            cases: Vec::new(),
            default: None,
            queue: Vec::new(),
            next: 0,
        };
        self.scan_switch_body(&sw.body, &mut plan)?;

        // The compare-and-jump chain, in source order.
        for (value, label) in &plan.cases {
            let hit = self.new_tmp(&CGType::int(), pos)?;
            self.emit(ir::Instr {
                op: Op::Eq,
                width: Some(width),
                dest: Some(hit.clone()),
                op1: Some(v.op.clone()),
                op2: Some(Operand::imm(*value)),
                texpr: None,
            });
            self.emit(ir::Instr {
                op: Op::Jnz,
                width: Some(Width::W16),
                dest: Some(Operand::var(label.clone())),
                op1: Some(hit),
                op2: None,
                texpr: None,
            });
        }
        match &plan.default {
            Some(d) => self.gen_jmp(&d.clone()),
            None => self.gen_jmp(&end),
        }

        self.push_switch(plan);
        self.push_loop(end.clone(), None);
        let result = self.gen_stmt(&sw.body);
        self.pop_loop(false);
        self.pop_switch();
        result?;
        self.emit_label(&end);
        Ok(())
    }

    /// Collect case/default labels of one switch body. Statements nested in
    /// an inner switch belong to that switch and are not visited.
    fn scan_switch_body(&mut self, s: &Stmt, plan: &mut SwitchPlan) -> CodegenResult<()> {
        match s {
            Stmt::CaseLabel { value, case_tok, .. } => {
                let v = self.const_eval(value)?;
                let pos = self.pos(*case_tok);
                if plan.cases.iter().any(|(cv, _)| *cv == v) {
                    return Err(CodegenError::AlreadyExists(pos, format!("case {}", v)));
                }
                let label = self.new_label("case");
                plan.cases.push((v, label.clone()));
                plan.queue.push(label);
                Ok(())
            }
            Stmt::DefaultLabel { default_tok, .. } => {
                let pos = self.pos(*default_tok);
                if plan.default.is_some() {
                    return Err(CodegenError::AlreadyExists(pos, "default".to_string()));
                }
                let label = self.new_label("default");
                plan.default = Some(label.clone());
                plan.queue.push(label);
                Ok(())
            }
            Stmt::Block(b) => {
                for s in &b.stmts {
                    self.scan_switch_body(s, plan)?;
                }
                Ok(())
            }
            Stmt::If(i) => {
                self.scan_switch_body(&i.tbranch, plan)?;
                for ei in &i.elseifs {
                    self.scan_switch_body(&ei.branch, plan)?;
                }
                if let Some((_, b)) = &i.ebranch {
                    self.scan_switch_body(b, plan)?;
                }
                Ok(())
            }
            Stmt::While(w) => self.scan_switch_body(&w.body, plan),
            Stmt::Do(d) => self.scan_switch_body(&d.body, plan),
            Stmt::For(f) => self.scan_switch_body(&f.body, plan),
            // An inner switch owns its labels.
            Stmt::Switch(_) => Ok(()),
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Local declarations

    fn gen_local_decl(&mut self, d: &ast::Declaration) -> CodegenResult<()> {
        let info = self.eval_specs(&d.specs)?;
        if d.entries.is_empty() {
            return Ok(());
        }
        for entry in &d.entries {
            let (ident, ty) = self.fold_declarator(&info.ty, &entry.decl)?;
            let id = match ident {
                Some(id) => id,
                None => continue,
            };
            let name = self.text(id).to_string();
            let pos = self.pos(id);

            if info.storage == Some(ast::Storage::Typedef) {
                self.scopes
                    .insert(ScopeMember {
                        ident: name.clone(),
                        cgtype: Some(ty),
                        kind: MemberKind::Typedef,
                    })
                    .map_err(|_| CodegenError::AlreadyExists(pos, name.clone()))?;
                continue;
            }

            // Block-scope extern declares a global.
            if info.storage == Some(ast::Storage::Extern) {
                let irname = format!("@{}", name);
                self.scopes
                    .insert(ScopeMember {
                        ident: name.clone(),
                        cgtype: Some(ty.clone()),
                        kind: MemberKind::GlobalSym(irname.clone()),
                    })
                    .map_err(|_| CodegenError::AlreadyExists(pos, name.clone()))?;
                if self.module.find_var(&irname).is_none() {
                    let texpr = self.type_expr(&ty, pos)?;
                    self.module.decls.push(ir::Decl::Var(ir::Var {
                        name: irname,
                        linkage: ir::Linkage::Extern,
                        ty: texpr,
                        data: None,
                    }));
                }
                continue;
            }

            // A static local is a module-level variable with a synthesised
            // name, visible only through this scope member.
            if info.storage == Some(ast::Storage::Static) {
                let irname = format!("@{}.{}", self.fn_name(), name);
                self.scopes
                    .insert(ScopeMember {
                        ident: name.clone(),
                        cgtype: Some(ty.clone()),
                        kind: MemberKind::GlobalSym(irname.clone()),
                    })
                    .map_err(|_| CodegenError::AlreadyExists(pos, name.clone()))?;
                let size = self.sizeof(&ty, pos)?;
                let texpr = self.type_expr(&ty, pos)?;
                let mut data = ir::DataBlock::default();
                match &entry.init {
                    Some((_, ast::Init::Expr(e))) => {
                        let width = self.width_of(&ty, pos)?;
                        let value = self.const_eval(e)?;
                        data.entries.push(ir::DataEntry::Value {
                            width,
                            value,
                            symbol: None,
                        });
                    }
                    _ => data.entries.push(ir::DataEntry::Space(size)),
                }
                self.module.decls.push(ir::Decl::Var(ir::Var {
                    name: irname,
                    linkage: ir::Linkage::Internal,
                    ty: texpr,
                    data: Some(data),
                }));
                continue;
            }

            // A char array takes its size from a string initialiser.
            let mut ty = ty;
            if let (
                CGType::Array { size: size @ None, .. },
                Some((_, ast::Init::Expr(e))),
            ) = (&mut ty, &entry.init)
            {
                if let Expr::StrLit(s) = e.as_ref() {
                    let n = self.string_bytes(s)?.len() as u64 + 1;
                    *size = Some(n);
                }
            }
            if let (
                CGType::Array { size: size @ None, .. },
                Some((_, ast::Init::Compound(c))),
            ) = (&mut ty, &entry.init)
            {
                *size = Some(c.entries.len() as u64);
            }
            self.sizeof(&ty, pos)?;

            let irname = self.declare_local(&name, &ty, pos)?;
            if let Some((_, init)) = &entry.init {
                let addr = self.new_tmp(&CGType::ptr_to(ty.clone()), pos)?;
                self.emit(ir::Instr {
                    op: Op::Lvarptr,
                    width: Some(Width::W16),
                    dest: Some(addr.clone()),
                    op1: Some(Operand::var(irname)),
                    op2: None,
                    texpr: None,
                });
                self.gen_init_into(addr, &ty, init, pos)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inline assembly

    fn gen_asm(&mut self, a: &ast::AsmStmt) -> CodegenResult<()> {
        let pos = self.pos(a.asm_tok);
        if a.outputs.as_ref().is_some_and(|l| !l.ops.is_empty())
            || a.inputs.as_ref().is_some_and(|l| !l.ops.is_empty())
        {
            return Err(CodegenError::Unsupported(
                pos,
                "asm operand constraints".to_string(),
            ));
        }
        // The template passes through to the assembly output verbatim.
        let text = String::from_utf8(self.string_bytes(&a.template)?).map_err(|_| {
            CodegenError::InvalidInput(pos, "asm template is not valid text".to_string())
        })?;
        self.emit(ir::Instr {
            op: Op::Asm,
            width: None,
            dest: None,
            op1: Some(Operand::Imm {
                value: 0,
                symbol: Some(text),
            }),
            op2: None,
            texpr: None,
        });
        Ok(())
    }
}

/// Switch bookkeeping lives beside the loop stacks in the function state;
/// the stack discipline is the same.
impl<'a> CodeGen<'a> {
    fn push_switch(&mut self, plan: SwitchPlan) {
        self.switches.push(plan);
    }

    fn pop_switch(&mut self) {
        self.switches.pop();
    }

    fn take_switch_label(&mut self, pos: Pos) -> CodegenResult<String> {
        let plan = self.switches.last_mut().ok_or_else(|| {
            CodegenError::InvalidInput(pos, "case label outside of a switch".to_string())
        })?;
        let label = plan.queue.get(plan.next).cloned().ok_or_else(|| {
            CodegenError::InvalidInput(pos, "case label outside of a switch".to_string())
        })?;
        plan.next += 1;
        Ok(label)
    }
}
