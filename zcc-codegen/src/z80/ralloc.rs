//! Register allocation: Z80-IC virtual registers to physical locations.
//!
//! A linear scan over live ranges computed by a single pass over the
//! instruction list: a virtual register is live from its first to its last
//! mention, and any range crossing a backward jump is extended to the jump
//! so loop-carried values stay allocated across the join.
//!
//! HL, DE and A are the instruction selector's scratch registers, so the
//! assignable pairs are BC and IY; IY only takes values that are never
//! accessed as 8-bit halves (its halves are not addressable), and values
//! the selector pinned stay in memory outright. Everything else spills to
//! a slot in the enlarged local-variable area and is rewritten to direct
//! `(IX+d)` accesses. After the rewrite no Tier B instruction remains.

use super::ic::{
    self, Alu8, Imm16, Instr, Module, Proc, Reg, Reg16, VPart, VReg, Vr,
};
use crate::error::{CodegenError, CodegenResult};
use log::debug;
use std::collections::HashMap;
use zcc_front::srcpos::Pos;

/// Allocate every procedure of a module.
pub fn allocate_module(module: &mut Module) -> CodegenResult<()> {
    for decl in &mut module.decls {
        if let ic::Decl::Proc(p) = decl {
            if p.has_virtual() {
                allocate_proc(p)?;
            }
        }
    }
    Ok(())
}

/// Where a virtual register ends up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Loc {
    /// A physical register pair.
    Pair(Reg16),
    /// A frame slot at `(IX+off)` (low byte; the high byte at `off+1`).
    Frame(i16),
}

#[derive(Clone, Copy, Debug, Default)]
struct RangeInfo {
    start: usize,
    end: usize,
    /// Mentioned as an 8-bit half anywhere?
    needs_8bit: bool,
    /// Mentioned as a pair, or through a half part tag?
    is_pair: bool,
    seen: bool,
}

fn allocate_proc(proc: &mut Proc) -> CodegenResult<()> {
    let mut info: HashMap<VReg, RangeInfo> = HashMap::new();

    // Live ranges in one pass.
    for (i, instr) in proc.body.iter().enumerate() {
        for (vreg, byte_access) in instr.vregs() {
            let e = info.entry(vreg).or_default();
            if !e.seen {
                e.seen = true;
                e.start = i;
            }
            e.end = i;
            if byte_access {
                e.needs_8bit = true;
            } else {
                e.is_pair = true;
            }
        }
        for vr in vr_parts(instr) {
            if vr.part != VPart::Whole {
                info.entry(vr.reg).or_default().is_pair = true;
            }
        }
    }

    // Labels and backward jumps extend ranges to the join.
    let labels: HashMap<&str, usize> = proc
        .body
        .iter()
        .enumerate()
        .filter_map(|(i, instr)| match instr {
            Instr::Label(l) => Some((l.as_str(), i)),
            _ => None,
        })
        .collect();
    let mut changed = true;
    while changed {
        changed = false;
        for (i, instr) in proc.body.iter().enumerate() {
            let target = match instr {
                Instr::JpNn { addr } | Instr::JpCcNn { addr, .. } | Instr::Djnz { addr } => {
                    addr.symbol.as_deref().and_then(|s| labels.get(s).copied())
                }
                _ => None,
            };
            if let Some(j) = target {
                if j < i {
                    for e in info.values_mut() {
                        if e.start < i && e.end > j && e.end < i {
                            e.end = i;
                            changed = true;
                        }
                    }
                }
            }
        }
    }

    // Linear scan over the ranges in start order.
    let mut order: Vec<(VReg, RangeInfo)> = info.iter().map(|(v, e)| (*v, *e)).collect();
    order.sort_by_key(|(v, e)| (e.start, *v));

    let mut assignment: HashMap<VReg, Loc> = HashMap::new();
    let mut active: Vec<(VReg, Reg16, usize)> = Vec::new();
    for (vreg, e) in &order {
        if proc.no_alloc {
            break;
        }
        active.retain(|(_, _, end)| *end >= e.start);
        if proc.pinned.contains(vreg) {
            continue;
        }
        let iy_ok = !e.needs_8bit;
        let bc_free = !active.iter().any(|(_, r, _)| *r == Reg16::BC);
        let iy_free = !active.iter().any(|(_, r, _)| *r == Reg16::IY);
        let pick = if iy_ok && iy_free {
            Some(Reg16::IY)
        } else if bc_free {
            Some(Reg16::BC)
        } else {
            None
        };
        match pick {
            Some(reg) => {
                assignment.insert(*vreg, Loc::Pair(reg));
                active.push((*vreg, reg, e.end));
            }
            None => {
                // Spill the range that ends last; keep the shorter ones in
                // registers.
                let steal = active
                    .iter()
                    .enumerate()
                    .filter(|(_, (_, r, _))| *r == Reg16::BC || (*r == Reg16::IY && iy_ok))
                    .max_by_key(|(_, (_, _, end))| *end)
                    .map(|(idx, (v, r, end))| (idx, *v, *r, *end));
                if let Some((idx, victim, reg, end)) = steal {
                    if end > e.end {
                        assignment.remove(&victim);
                        active.remove(idx);
                        assignment.insert(*vreg, Loc::Pair(reg));
                        active.push((*vreg, reg, e.end));
                    }
                }
            }
        }
    }

    // Frame slots for everything that did not get a pair.
    let mut spill_off = -(proc.local_size as i16);
    let mut spill_bytes: u16 = 0;
    for (vreg, e) in &order {
        if assignment.contains_key(vreg) {
            continue;
        }
        let bytes = if e.is_pair { 2 } else { 1 };
        spill_off -= bytes;
        spill_bytes += bytes as u16;
        assignment.insert(*vreg, Loc::Frame(spill_off));
    }
    // The spill area is kept an even number of bytes.
    if spill_bytes % 2 == 1 {
        spill_bytes += 1;
        spill_off -= 1;
    }
    if spill_off < -120 {
        return Err(CodegenError::Unsupported(
            Pos::start(),
            format!("{}: spill area exceeds the IX displacement range", proc.name),
        ));
    }
    debug!(
        "{}: {} vregs, {} spill bytes",
        proc.name,
        proc.used_vregs,
        spill_bytes
    );

    // Enlarge the frame reservation before rewriting shifts the indices.
    if let Some(ix) = proc.frame_setup {
        let total = proc.local_size + spill_bytes;
        proc.body[ix] = Instr::LdDdNn {
            dst: Reg16::HL,
            imm: Imm16::num(-(total as i64)),
        };
        proc.local_size = total;
    }

    // Rewrite Tier B away.
    let old = std::mem::take(&mut proc.body);
    let mut out = Vec::with_capacity(old.len());
    for instr in old {
        rewrite(&assignment, instr, &mut out)?;
    }
    proc.body = out;
    debug_assert!(!proc.has_virtual());

    // BC and IY are callee-saved: preserve them right after the frame is
    // set up and restore them before every epilogue.
    let used_bc = assignment.values().any(|l| *l == Loc::Pair(Reg16::BC));
    let used_iy = assignment.values().any(|l| *l == Loc::Pair(Reg16::IY));
    if used_bc || used_iy {
        let setup_end = proc.frame_setup.map(|i| i + 3).unwrap_or(0);
        let mut saved = Vec::with_capacity(proc.body.len() + 8);
        for (i, instr) in std::mem::take(&mut proc.body).into_iter().enumerate() {
            if matches!(instr, Instr::LdSpIx) {
                if used_iy {
                    saved.push(Instr::Pop { dst: Reg16::IY });
                }
                if used_bc {
                    saved.push(Instr::Pop { dst: Reg16::BC });
                }
            }
            saved.push(instr);
            if i + 1 == setup_end {
                if used_bc {
                    saved.push(Instr::Push { src: Reg16::BC });
                }
                if used_iy {
                    saved.push(Instr::Push { src: Reg16::IY });
                }
            }
        }
        proc.body = saved;
    }
    Ok(())
}

/// The 8-bit cell operands of an instruction.
fn vr_parts(instr: &Instr) -> Vec<Vr> {
    match instr {
        Instr::LdVrVr { dst, src } => vec![*dst, *src],
        Instr::LdVrN { dst, .. } => vec![*dst],
        Instr::LdVrIhl { dst } => vec![*dst],
        Instr::LdIhlVr { src } => vec![*src],
        Instr::LdVrIixd { dst, .. } => vec![*dst],
        Instr::LdIixdVr { src, .. } => vec![*src],
        Instr::LdRVr { src, .. } => vec![*src],
        Instr::LdVrR { dst, .. } => vec![*dst],
        Instr::AluVr { src, .. } => vec![*src],
        Instr::IncVr { vr } | Instr::DecVr { vr } => vec![*vr],
        Instr::ShiftVr { vr, .. } => vec![*vr],
        Instr::BitBVr { vr, .. } => vec![*vr],
        _ => Vec::new(),
    }
}

fn loc_of(assignment: &HashMap<VReg, Loc>, v: VReg) -> CodegenResult<Loc> {
    assignment.get(&v).copied().ok_or_else(|| {
        CodegenError::Unsupported(Pos::start(), format!("{} has no location", v))
    })
}

/// The physical realisation of one 8-bit cell.
enum Cell {
    R(Reg),
    Ix(i16),
}

fn cell(assignment: &HashMap<VReg, Loc>, vr: Vr) -> CodegenResult<Cell> {
    Ok(match loc_of(assignment, vr.reg)? {
        Loc::Pair(p) => {
            let (hi, lo) = p.halves().ok_or_else(|| {
                CodegenError::Unsupported(
                    Pos::start(),
                    format!("{} half of an index pair is not addressable", vr),
                )
            })?;
            match vr.part {
                VPart::Upper => Cell::R(hi),
                _ => Cell::R(lo),
            }
        }
        Loc::Frame(off) => {
            let delta = if vr.part == VPart::Upper { 1 } else { 0 };
            Cell::Ix(off + delta)
        }
    })
}

fn disp(off: i16) -> i8 {
    debug_assert!((-128..=127).contains(&off));
    off as i8
}

/// Move a physical pair into another physical pair.
fn move_pair(out: &mut Vec<Instr>, dst: Reg16, src: Reg16) {
    if dst == src {
        return;
    }
    match (dst.halves(), src.halves()) {
        (Some((dh, dl)), Some((sh, sl))) => {
            out.push(Instr::LdRR { dst: dh, src: sh });
            out.push(Instr::LdRR { dst: dl, src: sl });
        }
        _ => {
            out.push(Instr::Push { src });
            out.push(Instr::Pop { dst });
        }
    }
}

fn rewrite(
    assignment: &HashMap<VReg, Loc>,
    instr: Instr,
    out: &mut Vec<Instr>,
) -> CodegenResult<()> {
    match instr {
        Instr::LdVrVr { dst, src } => {
            match (cell(assignment, dst)?, cell(assignment, src)?) {
                (Cell::R(d), Cell::R(s)) => {
                    if d != s {
                        out.push(Instr::LdRR { dst: d, src: s });
                    }
                }
                (Cell::R(d), Cell::Ix(o)) => out.push(Instr::LdRIixd {
                    dst: d,
                    disp: disp(o),
                }),
                (Cell::Ix(o), Cell::R(s)) => out.push(Instr::LdIixdR {
                    disp: disp(o),
                    src: s,
                }),
                (Cell::Ix(d), Cell::Ix(s)) => {
                    out.push(Instr::LdRIixd {
                        dst: Reg::A,
                        disp: disp(s),
                    });
                    out.push(Instr::LdIixdR {
                        disp: disp(d),
                        src: Reg::A,
                    });
                }
            }
        }
        Instr::LdVrN { dst, imm } => match cell(assignment, dst)? {
            Cell::R(d) => out.push(Instr::LdRN { dst: d, imm }),
            Cell::Ix(o) => out.push(Instr::LdIixdN {
                disp: disp(o),
                imm,
            }),
        },
        Instr::LdVrrNn { dst, imm } => match loc_of(assignment, dst)? {
            Loc::Pair(p) => out.push(Instr::LdDdNn { dst: p, imm }),
            Loc::Frame(off) => {
                if imm.symbol.is_some() {
                    // A symbol cannot be split into bytes; stage it through
                    // HL, which no pattern keeps live across this
                    // instruction.
                    out.push(Instr::LdDdNn {
                        dst: Reg16::HL,
                        imm,
                    });
                    out.push(Instr::LdIixdR {
                        disp: disp(off),
                        src: Reg::L,
                    });
                    out.push(Instr::LdIixdR {
                        disp: disp(off + 1),
                        src: Reg::H,
                    });
                } else {
                    out.push(Instr::LdIixdN {
                        disp: disp(off),
                        imm: (imm.value & 0xff) as u8,
                    });
                    out.push(Instr::LdIixdN {
                        disp: disp(off + 1),
                        imm: ((imm.value >> 8) & 0xff) as u8,
                    });
                }
            }
        },
        Instr::LdVrIhl { dst } => match cell(assignment, dst)? {
            Cell::R(d) => out.push(Instr::LdRIhl { dst: d }),
            Cell::Ix(o) => {
                out.push(Instr::LdRIhl { dst: Reg::A });
                out.push(Instr::LdIixdR {
                    disp: disp(o),
                    src: Reg::A,
                });
            }
        },
        Instr::LdIhlVr { src } => match cell(assignment, src)? {
            Cell::R(s) => out.push(Instr::LdIhlR { src: s }),
            Cell::Ix(o) => {
                out.push(Instr::LdRIixd {
                    dst: Reg::A,
                    disp: disp(o),
                });
                out.push(Instr::LdIhlR { src: Reg::A });
            }
        },
        Instr::LdVrIixd { dst, disp: d0 } => match cell(assignment, dst)? {
            Cell::R(d) => out.push(Instr::LdRIixd { dst: d, disp: d0 }),
            Cell::Ix(o) => {
                out.push(Instr::LdRIixd {
                    dst: Reg::A,
                    disp: d0,
                });
                out.push(Instr::LdIixdR {
                    disp: disp(o),
                    src: Reg::A,
                });
            }
        },
        Instr::LdIixdVr { disp: d0, src } => match cell(assignment, src)? {
            Cell::R(s) => out.push(Instr::LdIixdR { disp: d0, src: s }),
            Cell::Ix(o) => {
                out.push(Instr::LdRIixd {
                    dst: Reg::A,
                    disp: disp(o),
                });
                out.push(Instr::LdIixdR {
                    disp: d0,
                    src: Reg::A,
                });
            }
        },
        Instr::LdRVr { dst, src } => match cell(assignment, src)? {
            Cell::R(s) => {
                if dst != s {
                    out.push(Instr::LdRR { dst, src: s });
                }
            }
            Cell::Ix(o) => out.push(Instr::LdRIixd {
                dst,
                disp: disp(o),
            }),
        },
        Instr::LdVrR { dst, src } => match cell(assignment, dst)? {
            Cell::R(d) => {
                if d != src {
                    out.push(Instr::LdRR { dst: d, src });
                }
            }
            Cell::Ix(o) => out.push(Instr::LdIixdR {
                disp: disp(o),
                src,
            }),
        },
        Instr::LdR16Vrr { dst, src } => match loc_of(assignment, src)? {
            Loc::Pair(p) => move_pair(out, dst, p),
            Loc::Frame(off) => {
                let (hi, lo) = dst.halves().ok_or_else(|| {
                    CodegenError::Unsupported(
                        Pos::start(),
                        "pair bridge into an index register from the frame".to_string(),
                    )
                })?;
                out.push(Instr::LdRIixd {
                    dst: lo,
                    disp: disp(off),
                });
                out.push(Instr::LdRIixd {
                    dst: hi,
                    disp: disp(off + 1),
                });
            }
        },
        Instr::LdVrrR16 { dst, src } => match loc_of(assignment, dst)? {
            Loc::Pair(p) => move_pair(out, p, src),
            Loc::Frame(off) => {
                let (hi, lo) = src.halves().ok_or_else(|| {
                    CodegenError::Unsupported(
                        Pos::start(),
                        "pair bridge from an index register into the frame".to_string(),
                    )
                })?;
                out.push(Instr::LdIixdR {
                    disp: disp(off),
                    src: lo,
                });
                out.push(Instr::LdIixdR {
                    disp: disp(off + 1),
                    src: hi,
                });
            }
        },
        Instr::AluVr { op, src } => match cell(assignment, src)? {
            Cell::R(s) => out.push(Instr::Alu {
                op,
                src: Alu8::Reg(s),
            }),
            Cell::Ix(o) => out.push(Instr::Alu {
                op,
                src: Alu8::IndIx(disp(o)),
            }),
        },
        Instr::IncVr { vr } => match cell(assignment, vr)? {
            Cell::R(r) => out.push(Instr::IncR { r }),
            Cell::Ix(o) => out.push(Instr::IncIixd { disp: disp(o) }),
        },
        Instr::DecVr { vr } => match cell(assignment, vr)? {
            Cell::R(r) => out.push(Instr::DecR { r }),
            Cell::Ix(o) => out.push(Instr::DecIixd { disp: disp(o) }),
        },
        Instr::ShiftVr { op, vr } => match cell(assignment, vr)? {
            Cell::R(r) => out.push(Instr::ShiftR { op, r }),
            Cell::Ix(o) => out.push(Instr::ShiftIixd { op, disp: disp(o) }),
        },
        Instr::BitBVr { b, vr } => match cell(assignment, vr)? {
            Cell::R(r) => out.push(Instr::BitBR { b, r }),
            Cell::Ix(o) => {
                out.push(Instr::LdRIixd {
                    dst: Reg::A,
                    disp: disp(o),
                });
                out.push(Instr::BitBR { b, r: Reg::A });
            }
        },
        Instr::AddVrrVrr { dst, src } => {
            // Bring both sides into the scratch pair, add, store back.
            rewrite(assignment, Instr::LdR16Vrr { dst: Reg16::HL, src: dst }, out)?;
            rewrite(assignment, Instr::LdR16Vrr { dst: Reg16::DE, src }, out)?;
            out.push(Instr::AddHlSs { src: Reg16::DE });
            rewrite(assignment, Instr::LdVrrR16 { dst, src: Reg16::HL }, out)?;
        }
        Instr::IncVrr { vr } => match loc_of(assignment, vr)? {
            Loc::Pair(p) => out.push(Instr::IncSs { r: p }),
            Loc::Frame(_) => {
                rewrite(assignment, Instr::LdR16Vrr { dst: Reg16::HL, src: vr }, out)?;
                out.push(Instr::IncSs { r: Reg16::HL });
                rewrite(assignment, Instr::LdVrrR16 { dst: vr, src: Reg16::HL }, out)?;
            }
        },
        Instr::DecVrr { vr } => match loc_of(assignment, vr)? {
            Loc::Pair(p) => out.push(Instr::DecSs { r: p }),
            Loc::Frame(_) => {
                rewrite(assignment, Instr::LdR16Vrr { dst: Reg16::HL, src: vr }, out)?;
                out.push(Instr::DecSs { r: Reg16::HL });
                rewrite(assignment, Instr::LdVrrR16 { dst: vr, src: Reg16::HL }, out)?;
            }
        },
        Instr::PushVrr { src } => match loc_of(assignment, src)? {
            Loc::Pair(p) => out.push(Instr::Push { src: p }),
            Loc::Frame(_) => {
                rewrite(assignment, Instr::LdR16Vrr { dst: Reg16::HL, src }, out)?;
                out.push(Instr::Push { src: Reg16::HL });
            }
        },
        Instr::PopVrr { dst } => match loc_of(assignment, dst)? {
            Loc::Pair(p) => out.push(Instr::Pop { dst: p }),
            Loc::Frame(_) => {
                out.push(Instr::Pop { dst: Reg16::HL });
                rewrite(assignment, Instr::LdVrrR16 { dst, src: Reg16::HL }, out)?;
            }
        },
        Instr::JpVrr { src } => {
            rewrite(assignment, Instr::LdR16Vrr { dst: Reg16::HL, src }, out)?;
            out.push(Instr::JpIhl);
        }
        other => out.push(other),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgen;
    use crate::z80::isel::select_module;
    use zcc_front::{lexer, parser};

    fn allocate(src: &str) -> Module {
        let toks = lexer::lex(src, "t.c");
        let ast = parser::parse_module(&toks).expect("parse");
        let (ir_mod, _) = cgen::generate(&toks, &ast).expect("generate");
        let mut m = select_module(&ir_mod).expect("select");
        allocate_module(&mut m).expect("allocate");
        m
    }

    fn proc<'m>(m: &'m Module, name: &str) -> &'m Proc {
        m.decls
            .iter()
            .find_map(|d| match d {
                ic::Decl::Proc(p) if p.name == name => Some(p),
                _ => None,
            })
            .expect("procedure")
    }

    #[test]
    fn no_virtuals_remain() {
        let m = allocate("int add(int a, int b) { return a + b; }");
        for d in &m.decls {
            if let ic::Decl::Proc(p) = d {
                assert!(!p.has_virtual(), "{}", p.name);
            }
        }
    }

    #[test]
    fn no_virtuals_remain_in_larger_functions() {
        let src = "int f(int n) {\n\tint s = 0;\n\tint i;\n\tfor (i = 0; i < n; i++)\n\t\ts += i * 2;\n\treturn s;\n}";
        let m = allocate(src);
        let p = proc(&m, "_f");
        assert!(!p.has_virtual());
        // The loop-carried values survive in registers or the frame.
        assert!(p.local_size % 2 == 0);
    }

    #[test]
    fn spill_area_is_even_and_patched() {
        let src = "long g;\nlong f(long a, long b) { return a + b + g; }";
        let m = allocate(src);
        let p = proc(&m, "_f");
        assert_eq!(p.local_size % 2, 0);
        // The frame reservation matches the patched size.
        let setup = p.frame_setup.expect("frame setup");
        match &p.body[setup] {
            Instr::LdDdNn { dst: Reg16::HL, imm } => {
                assert_eq!(imm.value, -(p.local_size as i64));
            }
            other => panic!("unexpected frame setup {}", other),
        }
    }

    #[test]
    fn scratch_pairs_are_never_assigned() {
        let src = "int f(int a, int b, int c) { return a * b + c; }";
        let m = allocate(src);
        let p = proc(&m, "_f");
        // After rewriting, HL and DE appear only in Tier A instructions;
        // the mere absence of Tier B suffices here.
        assert!(!p.has_virtual());
    }

    #[test]
    fn pinned_values_live_in_the_frame() {
        let src = "int f(int a, int n) { return a << n; }";
        let m = allocate(src);
        let p = proc(&m, "_f");
        assert!(!p.pinned.is_empty());
        assert!(!p.has_virtual());
        // The pinned pair accounts for at least two spill bytes.
        assert!(p.local_size >= 2);
    }
}
