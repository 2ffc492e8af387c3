//! IR validity checking.
//!
//! `verify_module` asserts the structural invariants of the IR: every
//! operand name resolves to a declared local variable, procedure argument or
//! top-level declaration; width-parametric opcodes carry a width; and every
//! branch targets a label defined in the same labelled block. The driver
//! runs it in the debug dump modes and the tests run it on everything the
//! generator produces.

use crate::ir::{Instr, Module, Operand, Proc};
use thiserror::Error;

/// A verifier finding.
#[derive(Debug, Error)]
#[error("{proc}: {message}")]
pub struct VerifyError {
    /// The procedure the problem was found in.
    pub proc: String,
    /// Description of the violated invariant.
    pub message: String,
}

/// Verify a whole module.
pub fn verify_module(module: &Module) -> Result<(), VerifyError> {
    for decl in &module.decls {
        if let crate::ir::Decl::Proc(p) = decl {
            verify_proc(module, p)?;
        }
    }
    Ok(())
}

fn err(proc: &Proc, message: String) -> VerifyError {
    VerifyError {
        proc: proc.name.clone(),
        message,
    }
}

fn verify_proc(module: &Module, proc: &Proc) -> Result<(), VerifyError> {
    for instr in proc.body.instrs() {
        if instr.op.has_width() && instr.width.is_none() {
            return Err(err(
                proc,
                format!("'{}' requires a width tag: {}", instr.op, instr),
            ));
        }
        if instr.op.is_branch() {
            // The destination is a label, not a variable.
            verify_branch(proc, instr)?;
            for operand in [&instr.op1, &instr.op2].into_iter().flatten() {
                verify_operand(module, proc, instr, operand)?;
            }
            continue;
        }
        for operand in [&instr.dest, &instr.op1, &instr.op2].into_iter().flatten() {
            verify_operand(module, proc, instr, operand)?;
        }
    }
    Ok(())
}

fn verify_branch(proc: &Proc, instr: &Instr) -> Result<(), VerifyError> {
    let target = match &instr.dest {
        Some(Operand::Var(name)) => name,
        other => {
            return Err(err(
                proc,
                format!("branch target must be a label reference, got {:?}", other),
            ));
        }
    };
    if !proc.body.defines_label(target) {
        return Err(err(proc, format!("undefined branch target '{}'", target)));
    }
    Ok(())
}

fn verify_operand(
    module: &Module,
    proc: &Proc,
    instr: &Instr,
    operand: &Operand,
) -> Result<(), VerifyError> {
    match operand {
        Operand::Imm { .. } => Ok(()),
        Operand::List(ops) => {
            for op in ops {
                verify_operand(module, proc, instr, op)?;
            }
            Ok(())
        }
        Operand::Var(name) => {
            let resolved = if name.starts_with('%') {
                proc.lvar(name).is_some() || proc.arg(name).is_some()
            } else {
                module.find_var(name).is_some() || module.find_proc(name).is_some()
            };
            if resolved {
                Ok(())
            } else {
                Err(err(
                    proc,
                    format!("operand '{}' does not resolve: {}", name, instr),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::*;

    fn proc_with(body: LabeledBlock, lvars: Vec<LocalVar>) -> Module {
        let mut module = Module::new();
        module.decls.push(Decl::Proc(Proc {
            name: "@t".to_string(),
            linkage: Linkage::Global,
            args: vec![],
            ret: None,
            variadic: false,
            decl_only: false,
            lvars,
            body,
        }));
        module
    }

    #[test]
    fn accepts_well_formed() {
        let mut body = LabeledBlock::default();
        body.push_label("%top");
        body.push(Instr::new(
            Op::Add,
            Width::W16,
            Operand::var("%x"),
            Operand::var("%x"),
            Operand::imm(1),
        ));
        body.push(Instr {
            op: Op::Jmp,
            width: None,
            dest: Some(Operand::var("%top")),
            op1: None,
            op2: None,
            texpr: None,
        });
        let module = proc_with(
            body,
            vec![LocalVar {
                name: "%x".to_string(),
                ty: TypeExpr::Int(Width::W16),
            }],
        );
        verify_module(&module).unwrap();
    }

    #[test]
    fn rejects_unresolved_operand() {
        let mut body = LabeledBlock::default();
        body.push(Instr::new(
            Op::Add,
            Width::W16,
            Operand::var("%x"),
            Operand::var("%ghost"),
            Operand::imm(1),
        ));
        let module = proc_with(
            body,
            vec![LocalVar {
                name: "%x".to_string(),
                ty: TypeExpr::Int(Width::W16),
            }],
        );
        let e = verify_module(&module).unwrap_err();
        assert!(e.message.contains("%ghost"), "{}", e);
    }

    #[test]
    fn rejects_undefined_branch_target() {
        let mut body = LabeledBlock::default();
        body.push(Instr {
            op: Op::Jmp,
            width: None,
            dest: Some(Operand::var("%nowhere")),
            op1: None,
            op2: None,
            texpr: None,
        });
        let module = proc_with(body, vec![]);
        let e = verify_module(&module).unwrap_err();
        assert!(e.message.contains("%nowhere"), "{}", e);
    }

    #[test]
    fn rejects_missing_width() {
        let mut body = LabeledBlock::default();
        body.push(Instr {
            op: Op::Add,
            width: None,
            dest: Some(Operand::var("%x")),
            op1: Some(Operand::imm(1)),
            op2: Some(Operand::imm(2)),
            texpr: None,
        });
        let module = proc_with(
            body,
            vec![LocalVar {
                name: "%x".to_string(),
                ty: TypeExpr::Int(Width::W16),
            }],
        );
        verify_module(&module).unwrap_err();
    }
}
