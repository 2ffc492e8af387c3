//! The assembly emitter.
//!
//! Walks an allocated Z80-IC module and prints textual Z80 assembly in the
//! Zilog style: mnemonic and comma-separated operands, indirect operands in
//! parentheses, labels at column zero, and the `extern`, `global`, `db`,
//! `dw`, `dd`, `dq` and `defs` directives for symbols and data. The output
//! is deterministic: the same module always prints the same text.

use super::ic::{Data, Decl, Instr, Module};
use core::fmt::Write;

/// Render a whole module as assembly text.
pub fn emit_module(module: &Module) -> String {
    let mut out = String::new();
    for decl in &module.decls {
        match decl {
            Decl::Extern(name) => {
                writeln!(out, "\textern {}", name).expect("string write");
            }
            Decl::Var(v) => {
                if v.global {
                    writeln!(out, "\tglobal {}", v.name).expect("string write");
                }
                writeln!(out, "{}:", v.name).expect("string write");
                for d in &v.data {
                    let line = match d {
                        Data::Byte(b) => format!("\tdb {}", b),
                        Data::Word(w) => format!("\tdw {}", w),
                        Data::DWord(d) => format!("\tdd {}", d),
                        Data::QWord(q) => format!("\tdq {}", q),
                        Data::Space(n) => format!("\tdefs {}", n),
                    };
                    writeln!(out, "{}", line).expect("string write");
                }
            }
            Decl::Proc(p) => {
                if p.global {
                    writeln!(out, "\tglobal {}", p.name).expect("string write");
                }
                writeln!(out, "{}:", p.name).expect("string write");
                for instr in &p.body {
                    debug_assert!(!instr.is_virtual(), "unallocated instruction {}", instr);
                    match instr {
                        Instr::Label(l) => writeln!(out, "{}:", l).expect("string write"),
                        _ => writeln!(out, "\t{}", instr).expect("string write"),
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::z80::ic::{self, Imm16, Reg16};

    #[test]
    fn extern_and_data() {
        let module = Module {
            decls: vec![
                Decl::Extern("_y".to_string()),
                Decl::Var(ic::Var {
                    name: "_x".to_string(),
                    global: true,
                    data: vec![Data::Word(Imm16::num(7)), Data::Space(4)],
                }),
            ],
        };
        let text = emit_module(&module);
        assert_eq!(
            text,
            "\textern _y\n\tglobal _x\n_x:\n\tdw 7\n\tdefs 4\n"
        );
    }

    #[test]
    fn proc_with_label() {
        let module = Module {
            decls: vec![Decl::Proc(ic::Proc {
                name: "_f".to_string(),
                global: true,
                lvars: Vec::new(),
                local_size: 0,
                frame_setup: None,
                body: vec![
                    Instr::LdDdNn {
                        dst: Reg16::HL,
                        imm: Imm16::num(1),
                    },
                    Instr::Label("_f_end".to_string()),
                    Instr::Ret,
                ],
                used_vregs: 0,
                pinned: Vec::new(),
                no_alloc: false,
            })],
        };
        let text = emit_module(&module);
        assert!(text.starts_with("\tglobal _f\n_f:\n"), "{}", text);
        assert!(text.contains("\tld hl, 1\n"), "{}", text);
        assert!(text.contains("\n_f_end:\n"), "{}", text);
        assert!(text.ends_with("\tret\n"), "{}", text);
    }

    #[test]
    fn deterministic() {
        let module = Module {
            decls: vec![Decl::Extern("_a".to_string())],
        };
        assert_eq!(emit_module(&module), emit_module(&module));
    }
}
