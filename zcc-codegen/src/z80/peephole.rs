//! Trivial peephole cleanup of allocated Z80-IC.
//!
//! Two rewrites only: self-moves (`ld r, r`) disappear, and a jump whose
//! target is the label that directly follows it (with only other labels in
//! between) disappears. Anything cleverer is out of scope.

use super::ic::{Decl, Instr, Module, Proc};

/// Clean every procedure of a module.
pub fn peephole_module(module: &mut Module) {
    for decl in &mut module.decls {
        if let Decl::Proc(p) = decl {
            peephole_proc(p);
        }
    }
}

fn peephole_proc(proc: &mut Proc) {
    let mut out: Vec<Instr> = Vec::with_capacity(proc.body.len());
    for (i, instr) in proc.body.iter().enumerate() {
        match instr {
            Instr::LdRR { dst, src } if dst == src => continue,
            Instr::JpNn { addr } => {
                if let Some(target) = &addr.symbol {
                    if jump_is_redundant(&proc.body[i + 1..], target) {
                        continue;
                    }
                }
            }
            _ => {}
        }
        out.push(instr.clone());
    }
    // The prologue contains neither self-moves nor jumps, so the
    // frame-setup index is unaffected by the removals.
    proc.body = out;
}

/// Does the label come next, with only other labels in between?
fn jump_is_redundant(rest: &[Instr], target: &str) -> bool {
    for instr in rest {
        match instr {
            Instr::Label(l) if l == target => return true,
            Instr::Label(_) => continue,
            _ => return false,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::z80::ic::{Imm16, Reg, Reg16};

    fn body(instrs: Vec<Instr>) -> Proc {
        Proc {
            name: "_t".to_string(),
            global: true,
            lvars: Vec::new(),
            local_size: 0,
            frame_setup: None,
            body: instrs,
            used_vregs: 0,
            pinned: Vec::new(),
            no_alloc: false,
        }
    }

    #[test]
    fn drops_self_moves() {
        let mut p = body(vec![
            Instr::LdRR {
                dst: Reg::A,
                src: Reg::A,
            },
            Instr::LdRR {
                dst: Reg::A,
                src: Reg::B,
            },
        ]);
        peephole_proc(&mut p);
        assert_eq!(p.body.len(), 1);
    }

    #[test]
    fn drops_jump_to_next_label() {
        let mut p = body(vec![
            Instr::JpNn {
                addr: Imm16::sym("l1"),
            },
            Instr::Label("l1".to_string()),
            Instr::Ret,
        ]);
        peephole_proc(&mut p);
        assert_eq!(p.body.len(), 2);
    }

    #[test]
    fn keeps_meaningful_jumps() {
        let mut p = body(vec![
            Instr::JpNn {
                addr: Imm16::sym("l1"),
            },
            Instr::LdDdNn {
                dst: Reg16::HL,
                imm: Imm16::num(0),
            },
            Instr::Label("l1".to_string()),
        ]);
        peephole_proc(&mut p);
        assert_eq!(p.body.len(), 3);
    }

    #[test]
    fn jump_past_several_labels() {
        let mut p = body(vec![
            Instr::JpNn {
                addr: Imm16::sym("l2"),
            },
            Instr::Label("l1".to_string()),
            Instr::Label("l2".to_string()),
            Instr::Ret,
        ]);
        peephole_proc(&mut p);
        assert_eq!(p.body.len(), 3);
    }
}
