//! Instruction selection: typed IR to Z80-IC.
//!
//! Each procedure is lowered in three steps. First the argument allocator
//! decides where the incoming arguments live. Then the prologue is emitted:
//! the frame pointer is established in IX, the local-variable area is
//! reserved, register-carried arguments are read into fresh virtual
//! registers and stack-carried ones are loaded from their frame offsets.
//! Finally the IR instructions are walked in order, each producing a short
//! Z80-IC sequence.
//!
//! Every IR value is realised as virtual registers, one 16-bit pair per
//! word of its width (a single cell for byte values); IR locals whose
//! address is taken live in the frame instead. HL, DE and A are the
//! selector's scratch registers: lowering patterns move operands through
//! them with bridge instructions, so the register allocator never assigns
//! them to virtual registers. When several patterns would do, the one that
//! avoids spilling HL wins, and immediate operands use immediate-form
//! opcodes.
//!
//! Multiplication, division and remainder lower to calls into the runtime
//! support routines (`__mul16` and friends), which take their operands in
//! HL and DE and return in HL. Indirect calls go through a small emitted
//! thunk that preserves every argument register.

use super::argloc::{allocate_args, ArgLocMap, SlotPart};
use super::ic::{
    self, Alu8, AluOp, Cond, Data, Imm16, Instr, Reg, Reg16, ShiftOp, VReg, Vr,
};
use crate::error::{CodegenError, CodegenResult};
use crate::ir::{self, Op, Operand, TypeExpr, Width};
use log::trace;
use std::collections::{BTreeSet, HashMap};
use zcc_front::srcpos::Pos;

/// Offset from IX of the first stack-carried argument byte: saved IX plus
/// the return address.
const ARG_BASE: i16 = 4;

/// Lower a whole IR module.
pub fn select_module(ir_mod: &ir::Module) -> CodegenResult<ic::Module> {
    let mut out = ic::Module::default();
    let mut helpers: BTreeSet<&'static str> = BTreeSet::new();
    let mut need_calli = false;

    for decl in &ir_mod.decls {
        match decl {
            ir::Decl::Record(_) => {}
            ir::Decl::Var(v) => out.decls.push(lower_var(v)),
            ir::Decl::Proc(p) if p.decl_only => {
                out.decls.push(ic::Decl::Extern(mangle(&p.name)));
            }
            ir::Decl::Proc(p) => {
                let proc = Selector::run(ir_mod, p, &mut helpers, &mut need_calli)?;
                out.decls.push(ic::Decl::Proc(proc));
            }
        }
    }

    for h in helpers {
        out.decls.push(ic::Decl::Extern(h.to_string()));
    }
    if need_calli {
        out.decls.push(calli_thunk());
    }
    Ok(out)
}

/// The indirect-call thunk: jumps to the address stored in `__calli_tgt`
/// while preserving every register.
fn calli_thunk() -> ic::Decl {
    ic::Decl::Proc(ic::Proc {
        name: "__calli".to_string(),
        global: false,
        lvars: Vec::new(),
        local_size: 0,
        frame_setup: None,
        body: vec![
            Instr::Push { src: Reg16::HL },
            Instr::LdDdInn {
                dst: Reg16::HL,
                addr: Imm16::sym("__calli_tgt"),
            },
            Instr::AsmText("ex (sp), hl".to_string()),
            Instr::Ret,
            Instr::Label("__calli_tgt".to_string()),
            Instr::AsmText("defs 2".to_string()),
        ],
        used_vregs: 0,
        pinned: Vec::new(),
        no_alloc: false,
    })
}

/// `@name` to the assembly symbol `_name`.
fn mangle(irname: &str) -> String {
    format!("_{}", irname.trim_start_matches('@'))
}

fn lower_var(v: &ir::Var) -> ic::Decl {
    let data = match &v.data {
        None => return ic::Decl::Extern(mangle(&v.name)),
        Some(d) => d,
    };
    let mut entries = Vec::with_capacity(data.entries.len());
    for e in &data.entries {
        match e {
            ir::DataEntry::Value {
                width,
                value,
                symbol,
            } => match width {
                Width::W8 => entries.push(Data::Byte(*value)),
                Width::W16 => entries.push(Data::Word(Imm16 {
                    value: *value,
                    symbol: symbol.as_deref().map(mangle),
                })),
                Width::W32 => entries.push(Data::DWord(*value)),
                Width::W64 => entries.push(Data::QWord(*value)),
            },
            ir::DataEntry::Space(n) => entries.push(Data::Space(*n)),
        }
    }
    ic::Decl::Var(ic::Var {
        name: mangle(&v.name),
        global: v.linkage == ir::Linkage::Global,
        data: entries,
    })
}

/// Where an IR value lives during selection.
#[derive(Clone, Debug)]
enum Val {
    /// An addressable object in the frame.
    Frame { off: i16, size: u64 },
    /// A value held in virtual registers, one pair per 16-bit word.
    Vregs { regs: Vec<VReg>, size: u64 },
}

impl Val {
    fn size(&self) -> u64 {
        match self {
            Self::Frame { size, .. } | Self::Vregs { size, .. } => *size,
        }
    }
}

struct Selector<'a> {
    ir: &'a ir::Module,
    proc: &'a ir::Proc,
    sym: String,
    body: Vec<Instr>,
    vals: HashMap<String, Val>,
    next_vreg: u32,
    next_label: u32,
    local_off: i16,
    frame_setup: usize,
    lvar_table: Vec<(String, i16)>,
    pinned: Vec<VReg>,
    no_alloc: bool,
    helpers: &'a mut BTreeSet<&'static str>,
    need_calli: &'a mut bool,
}

impl<'a> Selector<'a> {
    fn run(
        ir_mod: &'a ir::Module,
        proc: &'a ir::Proc,
        helpers: &'a mut BTreeSet<&'static str>,
        need_calli: &'a mut bool,
    ) -> CodegenResult<ic::Proc> {
        let mut sel = Selector {
            ir: ir_mod,
            proc,
            sym: mangle(&proc.name),
            body: Vec::new(),
            vals: HashMap::new(),
            next_vreg: 0,
            next_label: 0,
            local_off: 0,
            frame_setup: 0,
            lvar_table: Vec::new(),
            pinned: Vec::new(),
            no_alloc: false,
            helpers,
            need_calli,
        };
        // A return value wider than 32 bits travels through BC and IY,
        // which then cannot double as allocatable pairs.
        if let Some(ret) = &proc.ret {
            if ret.byte_size(ir_mod) > 4 {
                sel.no_alloc = true;
            }
        }
        sel.select()?;
        Ok(ic::Proc {
            name: sel.sym,
            global: proc.linkage == ir::Linkage::Global,
            lvars: sel.lvar_table,
            local_size: (-sel.local_off) as u16,
            frame_setup: Some(sel.frame_setup),
            body: sel.body,
            used_vregs: sel.next_vreg,
            pinned: sel.pinned,
            no_alloc: sel.no_alloc,
        })
    }

    fn err(&self, msg: impl Into<String>) -> CodegenError {
        CodegenError::Unsupported(Pos::start(), format!("{}: {}", self.sym, msg.into()))
    }

    fn emit(&mut self, i: Instr) {
        self.body.push(i);
    }

    fn new_vreg(&mut self) -> VReg {
        let v = VReg::from_u32(self.next_vreg);
        self.next_vreg += 1;
        v
    }

    fn new_label(&mut self, hint: &str) -> String {
        self.next_label += 1;
        format!("{}_{}{}", self.sym, hint, self.next_label)
    }

    /// The assembly label of an IR label of this procedure.
    fn lbl(&self, ir_label: &str) -> String {
        format!("{}_{}", self.sym, ir_label.trim_start_matches('%'))
    }

    fn alloc_frame(&mut self, size: u64) -> CodegenResult<i16> {
        self.local_off -= size as i16;
        if self.local_off < -120 {
            return Err(self.err("stack frame exceeds the IX displacement range"));
        }
        Ok(self.local_off)
    }

    fn fresh_vregs(&mut self, size: u64) -> Val {
        let words = if size <= 1 { 1 } else { (size as usize + 1) / 2 };
        let regs = (0..words).map(|_| self.new_vreg()).collect();
        Val::Vregs { regs, size }
    }

    // ------------------------------------------------------------------
    // Procedure skeleton

    fn select(&mut self) -> CodegenResult<()> {
        // Which locals are address-taken?
        let mut addressable: BTreeSet<&str> = BTreeSet::new();
        for instr in self.proc.body.instrs() {
            if instr.op == Op::Lvarptr {
                if let Some(Operand::Var(name)) = &instr.op1 {
                    addressable.insert(name.as_str());
                }
            }
        }

        // Give every local its home: a frame slot when its address is taken
        // or it is not a machine-word size, virtual registers otherwise.
        for lv in &self.proc.lvars {
            let size = lv.ty.byte_size(self.ir);
            let val = if addressable.contains(lv.name.as_str())
                || !matches!(size, 1 | 2 | 4 | 8)
            {
                let off = self.alloc_frame(size)?;
                self.lvar_table.push((lv.name.clone(), off));
                Val::Frame { off, size }
            } else {
                self.fresh_vregs(size)
            };
            self.vals.insert(lv.name.clone(), val);
        }

        let args: Vec<(String, u64)> = self
            .proc
            .args
            .iter()
            .map(|a| (a.name.clone(), a.ty.byte_size(self.ir)))
            .collect();
        for (name, size) in &args {
            if !matches!(size, 1 | 2 | 4 | 8) {
                return Err(self.err(format!("argument '{}' is not scalar-sized", name)));
            }
        }
        let argmap = allocate_args(&args, self.proc.variadic.then_some(args.len()));

        self.prologue(&argmap)?;

        for entry in &self.proc.body.entries {
            if let Some(label) = &entry.label {
                let l = self.lbl(label);
                self.emit(Instr::Label(l));
            }
            if let Some(instr) = &entry.instr {
                trace!("select {}", instr);
                self.select_instr(instr, &argmap)?;
            }
        }
        Ok(())
    }

    fn prologue(&mut self, argmap: &ArgLocMap) -> CodegenResult<()> {
        // Establish the frame pointer and reserve the local area. The
        // immediate of the reservation is patched by the register allocator
        // once the spill slots are known.
        self.emit(Instr::Push { src: Reg16::IX });
        self.emit(Instr::LdDdNn {
            dst: Reg16::IX,
            imm: Imm16::num(0),
        });
        self.emit(Instr::AddIxPp { src: Reg16::SP });
        self.frame_setup = self.body.len();
        self.emit(Instr::LdDdNn {
            dst: Reg16::HL,
            imm: Imm16::num(-(self.local_off.unsigned_abs() as i64)),
        });
        self.emit(Instr::AddHlSs { src: Reg16::SP });
        self.emit(Instr::LdSpHl);

        // First every register-carried slot, then the stack-carried bytes
        // (whose copies may scratch A).
        let mut arg_vals: Vec<(String, Val)> = Vec::new();
        for (arg, entry) in self.proc.args.iter().zip(&argmap.entries) {
            let size = arg.ty.byte_size(self.ir);
            let val = self.fresh_vregs(size);
            let regs = match &val {
                Val::Vregs { regs, .. } => regs.clone(),
                Val::Frame { .. } => unreachable!("arguments live in virtual registers"),
            };
            let mut byte = 0usize;
            for slot in &entry.reg_slots {
                match slot.part {
                    SlotPart::Whole => {
                        self.emit(Instr::LdVrrR16 {
                            dst: regs[byte / 2],
                            src: slot.reg,
                        });
                        byte += 2;
                    }
                    _ => {
                        let r = slot.half_reg().expect("half slot");
                        let dst = byte_of(&regs, size, byte);
                        self.emit(Instr::LdVrR { dst, src: r });
                        byte += 1;
                    }
                }
            }
            arg_vals.push((arg.name.clone(), val));
        }
        for (arg, entry) in self.proc.args.iter().zip(&argmap.entries) {
            if entry.stack_bytes == 0 {
                continue;
            }
            let size = arg.ty.byte_size(self.ir);
            let regs = match &arg_vals
                .iter()
                .find(|(n, _)| *n == arg.name)
                .expect("argument value")
                .1
            {
                Val::Vregs { regs, .. } => regs.clone(),
                Val::Frame { .. } => unreachable!(),
            };
            let reg_bytes = (size as u16 - entry.stack_bytes) as usize;
            for k in 0..entry.stack_bytes as usize {
                let disp = ARG_BASE + entry.stack_off as i16 + k as i16;
                let dst = byte_of(&regs, size, reg_bytes + k);
                self.emit(Instr::LdVrIixd {
                    dst,
                    disp: disp as i8,
                });
            }
        }
        for (name, val) in arg_vals {
            self.vals.insert(name, val);
        }
        Ok(())
    }

    fn epilogue(&mut self) {
        self.emit(Instr::LdSpIx);
        self.emit(Instr::Pop { dst: Reg16::IX });
        self.emit(Instr::Ret);
    }

    // ------------------------------------------------------------------
    // Operand access helpers

    fn val_of(&self, op: &Operand) -> CodegenResult<Option<Val>> {
        match op {
            Operand::Var(name) => match self.vals.get(name) {
                Some(v) => Ok(Some(v.clone())),
                None => Err(CodegenError::NotFound(Pos::start(), name.clone())),
            },
            _ => Ok(None),
        }
    }

    /// Byte size of a value operand.
    fn op_size(&self, op: &Operand, width: Option<Width>) -> CodegenResult<u64> {
        if let Operand::Var(name) = op {
            if let Some(v) = self.vals.get(name) {
                return Ok(v.size());
            }
        }
        Ok(width.map(|w| w.bytes()).unwrap_or(2))
    }

    /// Word `w` of an immediate operand.
    fn word_imm(op: &Operand, w: usize) -> Option<Imm16> {
        match op {
            Operand::Imm {
                value,
                symbol: Some(s),
            } => (w == 0).then(|| Imm16 {
                value: *value,
                symbol: Some(mangle(s)),
            }),
            Operand::Imm {
                value,
                symbol: None,
            } => Some(Imm16::num((*value >> (16 * w as u32)) & 0xffff)),
            _ => None,
        }
    }

    /// Byte `b` of an immediate operand.
    fn byte_imm(op: &Operand, b: usize) -> Option<u8> {
        match op {
            Operand::Imm {
                value,
                symbol: None,
            } => Some(((*value >> (8 * b as u32)) & 0xff) as u8),
            _ => None,
        }
    }

    /// The virtual-register cell of byte `b` of a value.
    fn byte_vr(&self, op: &Operand, b: usize) -> CodegenResult<Vr> {
        match self.val_of(op)? {
            Some(Val::Vregs { regs, size }) => Ok(byte_of(&regs, size, b)),
            Some(Val::Frame { .. }) => {
                Err(self.err("value operand resolves to an addressable object"))
            }
            None => Err(self.err(format!("expected a variable operand, got {}", op))),
        }
    }

    /// Load word `w` of a value operand into a physical pair.
    fn load_pair(&mut self, dst: Reg16, op: &Operand, w: usize) -> CodegenResult<()> {
        if let Some(imm) = Self::word_imm(op, w) {
            self.emit(Instr::LdDdNn { dst, imm });
            return Ok(());
        }
        match self.val_of(op)? {
            Some(Val::Vregs { regs, size }) => {
                if size == 1 {
                    // A byte value widens with a zero upper half.
                    let (hi, lo) = dst.halves().expect("main pair");
                    self.emit(Instr::LdRVr {
                        dst: lo,
                        src: Vr::whole(regs[0]),
                    });
                    self.emit(Instr::LdRN { dst: hi, imm: 0 });
                } else {
                    self.emit(Instr::LdR16Vrr { dst, src: regs[w] });
                }
                Ok(())
            }
            _ => Err(self.err(format!("cannot load operand {}", op))),
        }
    }

    /// Store a physical pair into word `w` of a destination value.
    fn store_pair(&mut self, dst: &Operand, w: usize, src: Reg16) -> CodegenResult<()> {
        match self.val_of(dst)? {
            Some(Val::Vregs { regs, size }) => {
                if size == 1 {
                    let (_, lo) = src.halves().expect("main pair");
                    self.emit(Instr::LdVrR {
                        dst: Vr::whole(regs[0]),
                        src: lo,
                    });
                } else {
                    self.emit(Instr::LdVrrR16 { dst: regs[w], src });
                }
                Ok(())
            }
            _ => Err(self.err(format!("cannot store to operand {}", dst))),
        }
    }

    /// Load byte `b` of a value operand into A.
    fn load_a(&mut self, op: &Operand, b: usize) -> CodegenResult<()> {
        if let Some(imm) = Self::byte_imm(op, b) {
            self.emit(Instr::LdRN { dst: Reg::A, imm });
            return Ok(());
        }
        let vr = self.byte_vr(op, b)?;
        self.emit(Instr::LdRVr { dst: Reg::A, src: vr });
        Ok(())
    }

    /// Store A into byte `b` of a destination value.
    fn store_a(&mut self, dst: &Operand, b: usize) -> CodegenResult<()> {
        let vr = self.byte_vr(dst, b)?;
        self.emit(Instr::LdVrR { dst: vr, src: Reg::A });
        Ok(())
    }

    /// An 8-bit ALU operation of A with byte `b` of an operand.
    fn alu(&mut self, op: AluOp, src: &Operand, b: usize) -> CodegenResult<()> {
        if let Some(imm) = Self::byte_imm(src, b) {
            self.emit(Instr::Alu {
                op,
                src: Alu8::Imm(imm),
            });
            return Ok(());
        }
        let vr = self.byte_vr(src, b)?;
        self.emit(Instr::AluVr { op, src: vr });
        Ok(())
    }

    /// Set a 16-bit destination to 1 when `cc` holds, else 0. The loads do
    /// not disturb the flags.
    fn set_bool(&mut self, dst: &Operand, cc: Cond) -> CodegenResult<()> {
        let done = self.new_label("bool");
        self.store_bool(dst, 1)?;
        self.emit(Instr::JpCcNn {
            cc,
            addr: Imm16::sym(done.clone()),
        });
        self.store_bool(dst, 0)?;
        self.emit(Instr::Label(done));
        Ok(())
    }

    fn store_bool(&mut self, dst: &Operand, v: u8) -> CodegenResult<()> {
        match self.val_of(dst)? {
            Some(Val::Vregs { regs, size }) => {
                if size == 1 {
                    self.emit(Instr::LdVrN {
                        dst: Vr::whole(regs[0]),
                        imm: v,
                    });
                } else {
                    self.emit(Instr::LdVrrNn {
                        dst: regs[0],
                        imm: Imm16::num(v as i64),
                    });
                    for r in &regs[1..] {
                        self.emit(Instr::LdVrrNn {
                            dst: *r,
                            imm: Imm16::num(0),
                        });
                    }
                }
                Ok(())
            }
            _ => Err(self.err("comparison destination must be a value")),
        }
    }

    // ------------------------------------------------------------------
    // Instruction dispatch

    fn select_instr(&mut self, instr: &ir::Instr, own_args: &ArgLocMap) -> CodegenResult<()> {
        let dest = instr.dest.as_ref();
        let op1 = instr.op1.as_ref();
        let op2 = instr.op2.as_ref();
        match instr.op {
            Op::Nop => self.emit(Instr::Nop),
            Op::Asm => {
                if let Some(Operand::Imm {
                    symbol: Some(text), ..
                }) = op1
                {
                    self.emit(Instr::AsmText(text.clone()));
                }
            }
            Op::Imm => {
                let dst = req(dest)?;
                let src = req(op1)?;
                let size = self.op_size(dst, instr.width)?;
                self.gen_imm(dst, src, size)?;
            }
            Op::Copy => {
                let dst = req(dest)?;
                let src = req(op1)?;
                let size = self.op_size(dst, instr.width)?;
                self.gen_copy(dst, src, size)?;
            }
            Op::Add | Op::Sub => {
                self.gen_addsub(req(dest)?, req(op1)?, req(op2)?, instr, instr.op == Op::Sub)?;
            }
            Op::And | Op::Or | Op::Xor => {
                let alu = match instr.op {
                    Op::And => AluOp::And,
                    Op::Or => AluOp::Or,
                    _ => AluOp::Xor,
                };
                self.gen_bytewise(req(dest)?, req(op1)?, req(op2)?, instr, alu)?;
            }
            Op::Bnot => self.gen_bnot(req(dest)?, req(op1)?, instr)?,
            Op::Neg => self.gen_neg(req(dest)?, req(op1)?, instr)?,
            Op::Mul | Op::Sdiv | Op::Udiv | Op::Smod | Op::Umod => {
                self.gen_muldiv(req(dest)?, req(op1)?, req(op2)?, instr)?;
            }
            Op::Shl | Op::Shra | Op::Shrl => {
                self.gen_shift(req(dest)?, req(op1)?, req(op2)?, instr)?;
            }
            Op::Eq | Op::Neq => {
                self.gen_eq(req(dest)?, req(op1)?, req(op2)?, instr, instr.op == Op::Neq)?;
            }
            Op::Lt | Op::Ltu | Op::Lteq | Op::Lteu | Op::Gt | Op::Gtu | Op::Gteq | Op::Gteu => {
                self.gen_order(req(dest)?, req(op1)?, req(op2)?, instr)?;
            }
            Op::Read => self.gen_read(req(dest)?, req(op1)?, instr)?,
            Op::Write => self.gen_write(req(op1)?, req(op2)?, instr)?,
            Op::Varptr => {
                let dst = req(dest)?;
                let name = var_name(req(op1)?)?;
                let sym = mangle(name);
                self.gen_imm16_into(dst, Imm16::sym(sym))?;
            }
            Op::Lvarptr => {
                let dst = req(dest)?;
                let name = var_name(req(op1)?)?;
                let off = self
                    .lvar_table
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, off)| *off)
                    .ok_or_else(|| self.err(format!("'{}' has no frame slot", name)))?;
                self.emit(Instr::Push { src: Reg16::IX });
                self.emit(Instr::Pop { dst: Reg16::HL });
                self.emit(Instr::LdDdNn {
                    dst: Reg16::DE,
                    imm: Imm16::num(off as i64),
                });
                self.emit(Instr::AddHlSs { src: Reg16::DE });
                self.store_pair(dst, 0, Reg16::HL)?;
            }
            Op::Recmbr => {
                let dst = req(dest)?;
                let base = req(op1)?;
                let off = match req(op2)? {
                    Operand::Imm { value, .. } => *value,
                    other => return Err(self.err(format!("bad member offset {}", other))),
                };
                self.load_pair(Reg16::HL, base, 0)?;
                if off != 0 {
                    self.emit(Instr::LdDdNn {
                        dst: Reg16::DE,
                        imm: Imm16::num(off),
                    });
                    self.emit(Instr::AddHlSs { src: Reg16::DE });
                }
                self.store_pair(dst, 0, Reg16::HL)?;
            }
            Op::Ptridx => self.gen_ptridx(req(dest)?, req(op1)?, req(op2)?, instr)?,
            Op::Ptrdiff => self.gen_ptrdiff(req(dest)?, req(op1)?, req(op2)?, instr)?,
            Op::Sgnext | Op::Zrext | Op::Trunc => {
                self.gen_resize(req(dest)?, req(op1)?, instr)?;
            }
            Op::Reccopy => self.gen_reccopy(req(op1)?, req(op2)?, instr)?,
            Op::Call => self.gen_call(dest, req(op1)?, req(op2)?, instr)?,
            Op::Calli => self.gen_calli(dest, req(op1)?, req(op2)?, instr)?,
            Op::Ret => self.epilogue(),
            Op::Retv => self.gen_retv(req(op1)?, instr)?,
            Op::Jmp => {
                let target = self.lbl(var_name(req(dest)?)?);
                self.emit(Instr::JpNn {
                    addr: Imm16::sym(target),
                });
            }
            Op::Jz | Op::Jnz => {
                let target = self.lbl(var_name(req(dest)?)?);
                let v = req(op1)?;
                let size = self.op_size(v, instr.width)?;
                self.gen_test(v, size)?;
                self.emit(Instr::JpCcNn {
                    cc: if instr.op == Op::Jz { Cond::Z } else { Cond::NZ },
                    addr: Imm16::sym(target),
                });
            }
            Op::Vastart => self.gen_vastart(req(op1)?, own_args)?,
            Op::Vaarg => self.gen_vaarg(req(dest)?, req(op1)?, instr)?,
            Op::Vaend => {}
            Op::Vacopy => self.gen_vacopy(req(op1)?, req(op2)?)?,
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Simple data movement

    fn gen_imm(&mut self, dst: &Operand, src: &Operand, size: u64) -> CodegenResult<()> {
        if size == 1 {
            let imm = Self::byte_imm(src, 0).ok_or_else(|| self.err("imm without a value"))?;
            let vr = self.byte_vr(dst, 0)?;
            self.emit(Instr::LdVrN { dst: vr, imm });
            return Ok(());
        }
        let words = (size as usize + 1) / 2;
        for w in 0..words {
            let imm = Self::word_imm(src, w).ok_or_else(|| self.err("imm without a value"))?;
            match self.val_of(dst)? {
                Some(Val::Vregs { regs, .. }) => {
                    self.emit(Instr::LdVrrNn { dst: regs[w], imm });
                }
                _ => return Err(self.err("imm destination must be a value")),
            }
        }
        Ok(())
    }

    fn gen_imm16_into(&mut self, dst: &Operand, imm: Imm16) -> CodegenResult<()> {
        match self.val_of(dst)? {
            Some(Val::Vregs { regs, .. }) => {
                self.emit(Instr::LdVrrNn { dst: regs[0], imm });
                Ok(())
            }
            _ => Err(self.err("address destination must be a value")),
        }
    }

    fn gen_copy(&mut self, dst: &Operand, src: &Operand, size: u64) -> CodegenResult<()> {
        if matches!(src, Operand::Imm { .. }) {
            return self.gen_imm(dst, src, size);
        }
        for b in 0..size as usize {
            let s = self.byte_vr(src, b)?;
            let d = self.byte_vr(dst, b)?;
            self.emit(Instr::LdVrVr { dst: d, src: s });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Arithmetic

    fn gen_addsub(
        &mut self,
        dst: &Operand,
        a: &Operand,
        b: &Operand,
        instr: &ir::Instr,
        is_sub: bool,
    ) -> CodegenResult<()> {
        let size = self.op_size(dst, instr.width)?;
        if size == 1 {
            self.load_a(a, 0)?;
            self.alu(if is_sub { AluOp::Sub } else { AluOp::Add }, b, 0)?;
            return self.store_a(dst, 0);
        }
        let words = (size as usize + 1) / 2;
        for w in 0..words {
            self.load_pair(Reg16::HL, a, w)?;
            self.load_pair(Reg16::DE, b, w)?;
            if is_sub {
                if w == 0 {
                    // Clear the carry before the first subtract.
                    self.emit(Instr::Alu {
                        op: AluOp::Or,
                        src: Alu8::Reg(Reg::A),
                    });
                }
                self.emit(Instr::SbcHlSs { src: Reg16::DE });
            } else if w == 0 {
                self.emit(Instr::AddHlSs { src: Reg16::DE });
            } else {
                self.emit(Instr::AdcHlSs { src: Reg16::DE });
            }
            self.store_pair(dst, w, Reg16::HL)?;
        }
        Ok(())
    }

    fn gen_bytewise(
        &mut self,
        dst: &Operand,
        a: &Operand,
        b: &Operand,
        instr: &ir::Instr,
        op: AluOp,
    ) -> CodegenResult<()> {
        let size = self.op_size(dst, instr.width)?;
        for byte in 0..size as usize {
            self.load_a(a, byte)?;
            self.alu(op, b, byte)?;
            self.store_a(dst, byte)?;
        }
        Ok(())
    }

    fn gen_bnot(&mut self, dst: &Operand, src: &Operand, instr: &ir::Instr) -> CodegenResult<()> {
        let size = self.op_size(dst, instr.width)?;
        for byte in 0..size as usize {
            self.load_a(src, byte)?;
            self.emit(Instr::Cpl);
            self.store_a(dst, byte)?;
        }
        Ok(())
    }

    fn gen_neg(&mut self, dst: &Operand, src: &Operand, instr: &ir::Instr) -> CodegenResult<()> {
        let size = self.op_size(dst, instr.width)?;
        if size == 1 {
            self.load_a(src, 0)?;
            self.emit(Instr::Neg);
            return self.store_a(dst, 0);
        }
        let words = (size as usize + 1) / 2;
        for w in 0..words {
            self.emit(Instr::LdDdNn {
                dst: Reg16::HL,
                imm: Imm16::num(0),
            });
            if w == 0 {
                self.emit(Instr::Alu {
                    op: AluOp::Or,
                    src: Alu8::Reg(Reg::A),
                });
            }
            self.load_pair(Reg16::DE, src, w)?;
            self.emit(Instr::SbcHlSs { src: Reg16::DE });
            self.store_pair(dst, w, Reg16::HL)?;
        }
        Ok(())
    }

    fn gen_muldiv(
        &mut self,
        dst: &Operand,
        a: &Operand,
        b: &Operand,
        instr: &ir::Instr,
    ) -> CodegenResult<()> {
        let size = self.op_size(dst, instr.width)?;
        if size > 2 {
            return Err(self.err(format!(
                "{}-bit multiply/divide is not supported",
                size * 8
            )));
        }
        let helper: &'static str = match instr.op {
            Op::Mul => "__mul16",
            Op::Sdiv => "__sdiv16",
            Op::Udiv => "__udiv16",
            Op::Smod => "__smod16",
            _ => "__umod16",
        };
        self.helpers.insert(helper);
        self.load_pair(Reg16::HL, a, 0)?;
        self.load_pair(Reg16::DE, b, 0)?;
        self.emit(Instr::CallNn {
            addr: Imm16::sym(helper),
        });
        if size == 1 {
            self.emit(Instr::LdRR {
                dst: Reg::A,
                src: Reg::L,
            });
            self.store_a(dst, 0)?;
        } else {
            self.store_pair(dst, 0, Reg16::HL)?;
        }
        Ok(())
    }

    /// One shift step over all bytes of a value held in virtual registers.
    fn shift_step(&mut self, regs: &[VReg], size: u64, op: Op) -> CodegenResult<()> {
        let bytes = size as usize;
        match op {
            Op::Shl => {
                for b in 0..bytes {
                    let vr = byte_of(regs, size, b);
                    let sop = if b == 0 { ShiftOp::Sla } else { ShiftOp::Rl };
                    self.emit(Instr::ShiftVr { op: sop, vr });
                }
            }
            _ => {
                for b in (0..bytes).rev() {
                    let vr = byte_of(regs, size, b);
                    let sop = if b + 1 == bytes {
                        if op == Op::Shra {
                            ShiftOp::Sra
                        } else {
                            ShiftOp::Srl
                        }
                    } else {
                        ShiftOp::Rr
                    };
                    self.emit(Instr::ShiftVr { op: sop, vr });
                }
            }
        }
        Ok(())
    }

    fn gen_shift(
        &mut self,
        dst: &Operand,
        a: &Operand,
        b: &Operand,
        instr: &ir::Instr,
    ) -> CodegenResult<()> {
        let size = self.op_size(dst, instr.width)?;
        self.gen_copy_or_move(dst, a, size)?;
        let regs = match self.val_of(dst)? {
            Some(Val::Vregs { regs, .. }) => regs,
            _ => return Err(self.err("shift destination must be a value")),
        };

        if let Operand::Imm {
            value,
            symbol: None,
        } = b
        {
            let count = *value;
            if count as u64 >= size * 8 {
                return self.gen_imm(dst, &Operand::imm(0), size);
            }
            for _ in 0..count {
                self.shift_step(&regs, size, instr.op)?;
            }
            return Ok(());
        }

        // A variable count: a loop with the count in A. The shifted value
        // is pinned to the frame so the loop body cannot disturb an
        // allocation.
        self.pinned.extend(regs.iter().copied());
        let top = self.new_label("shift");
        let end = self.new_label("shift_end");
        self.load_a(b, 0)?;
        self.emit(Instr::Alu {
            op: AluOp::Or,
            src: Alu8::Reg(Reg::A),
        });
        self.emit(Instr::JpCcNn {
            cc: Cond::Z,
            addr: Imm16::sym(end.clone()),
        });
        self.emit(Instr::Label(top.clone()));
        self.shift_step(&regs, size, instr.op)?;
        self.emit(Instr::DecR { r: Reg::A });
        self.emit(Instr::JpCcNn {
            cc: Cond::NZ,
            addr: Imm16::sym(top),
        });
        self.emit(Instr::Label(end));
        Ok(())
    }

    /// Copy `src` into `dst` unless they already name the same value.
    fn gen_copy_or_move(&mut self, dst: &Operand, src: &Operand, size: u64) -> CodegenResult<()> {
        if let (Operand::Var(a), Operand::Var(b)) = (dst, src) {
            if a == b {
                return Ok(());
            }
        }
        self.gen_copy(dst, src, size)
    }

    // ------------------------------------------------------------------
    // Comparisons

    fn gen_eq(
        &mut self,
        dst: &Operand,
        a: &Operand,
        b: &Operand,
        instr: &ir::Instr,
        negate: bool,
    ) -> CodegenResult<()> {
        let size = self.op_size(a, instr.width)?;
        if size == 1 {
            self.load_a(a, 0)?;
            self.alu(AluOp::Cp, b, 0)?;
            return self.set_bool(dst, if negate { Cond::NZ } else { Cond::Z });
        }
        let words = (size as usize + 1) / 2;
        if words == 1 {
            self.load_pair(Reg16::HL, a, 0)?;
            self.load_pair(Reg16::DE, b, 0)?;
            self.emit(Instr::Alu {
                op: AluOp::Or,
                src: Alu8::Reg(Reg::A),
            });
            self.emit(Instr::SbcHlSs { src: Reg16::DE });
            return self.set_bool(dst, if negate { Cond::NZ } else { Cond::Z });
        }
        // Wider: any differing word decides.
        let diff = self.new_label("ne");
        let done = self.new_label("eq_end");
        for w in 0..words {
            self.load_pair(Reg16::HL, a, w)?;
            self.load_pair(Reg16::DE, b, w)?;
            self.emit(Instr::Alu {
                op: AluOp::Or,
                src: Alu8::Reg(Reg::A),
            });
            self.emit(Instr::SbcHlSs { src: Reg16::DE });
            self.emit(Instr::JpCcNn {
                cc: Cond::NZ,
                addr: Imm16::sym(diff.clone()),
            });
        }
        self.store_bool(dst, if negate { 0 } else { 1 })?;
        self.emit(Instr::JpNn {
            addr: Imm16::sym(done.clone()),
        });
        self.emit(Instr::Label(diff));
        self.store_bool(dst, if negate { 1 } else { 0 })?;
        self.emit(Instr::Label(done));
        Ok(())
    }

    fn gen_order(
        &mut self,
        dst: &Operand,
        a: &Operand,
        b: &Operand,
        instr: &ir::Instr,
    ) -> CodegenResult<()> {
        // Everything reduces to a single less-than chain: `a > b` is
        // `b < a`, and the non-strict forms are the negated swaps.
        let (x, y, signed, invert) = match instr.op {
            Op::Lt => (a, b, true, false),
            Op::Ltu => (a, b, false, false),
            Op::Gt => (b, a, true, false),
            Op::Gtu => (b, a, false, false),
            Op::Lteq => (b, a, true, true),
            Op::Lteu => (b, a, false, true),
            Op::Gteq => (a, b, true, true),
            _ => (a, b, false, true),
        };
        let size = self.op_size(a, instr.width)?;
        let (t, f) = if invert { (0, 1) } else { (1, 0) };

        if size == 1 {
            self.load_a(x, 0)?;
            self.alu(AluOp::Cp, y, 0)?;
        } else {
            let words = (size as usize + 1) / 2;
            for w in 0..words {
                self.load_pair(Reg16::HL, x, w)?;
                self.load_pair(Reg16::DE, y, w)?;
                if w == 0 {
                    self.emit(Instr::Alu {
                        op: AluOp::Or,
                        src: Alu8::Reg(Reg::A),
                    });
                }
                self.emit(Instr::SbcHlSs { src: Reg16::DE });
            }
        }

        if !signed {
            // Borrow set means x < y.
            return self.set_bool(dst, if invert { Cond::NC } else { Cond::C });
        }

        // Signed: sign and overflow of the final subtract decide.
        let ovf = self.new_label("cmp_ovf");
        let no = self.new_label("cmp_no");
        let done = self.new_label("cmp_end");
        self.store_bool(dst, t)?;
        self.emit(Instr::JpCcNn {
            cc: Cond::PE,
            addr: Imm16::sym(ovf.clone()),
        });
        self.emit(Instr::JpCcNn {
            cc: Cond::M,
            addr: Imm16::sym(done.clone()),
        });
        self.emit(Instr::JpNn {
            addr: Imm16::sym(no.clone()),
        });
        self.emit(Instr::Label(ovf));
        self.emit(Instr::JpCcNn {
            cc: Cond::P,
            addr: Imm16::sym(done.clone()),
        });
        self.emit(Instr::Label(no));
        self.store_bool(dst, f)?;
        self.emit(Instr::Label(done));
        Ok(())
    }

    /// Establish the Z flag from a value: Z set exactly when it is zero.
    fn gen_test(&mut self, v: &Operand, size: u64) -> CodegenResult<()> {
        if size == 1 {
            self.load_a(v, 0)?;
            self.emit(Instr::Alu {
                op: AluOp::Or,
                src: Alu8::Reg(Reg::A),
            });
            return Ok(());
        }
        if size == 2 {
            self.load_pair(Reg16::HL, v, 0)?;
            self.emit(Instr::LdRR {
                dst: Reg::A,
                src: Reg::H,
            });
            self.emit(Instr::Alu {
                op: AluOp::Or,
                src: Alu8::Reg(Reg::L),
            });
            return Ok(());
        }
        self.load_a(v, 0)?;
        for b in 1..size as usize {
            self.alu(AluOp::Or, v, b)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Memory access

    fn gen_read(&mut self, dst: &Operand, ptr: &Operand, instr: &ir::Instr) -> CodegenResult<()> {
        let size = self.op_size(dst, instr.width)?;
        self.load_pair(Reg16::HL, ptr, 0)?;
        for b in 0..size as usize {
            let vr = self.byte_vr(dst, b)?;
            self.emit(Instr::LdVrIhl { dst: vr });
            if b + 1 < size as usize {
                self.emit(Instr::IncSs { r: Reg16::HL });
            }
        }
        Ok(())
    }

    fn gen_write(&mut self, ptr: &Operand, v: &Operand, instr: &ir::Instr) -> CodegenResult<()> {
        let size = self.op_size(v, instr.width)?;
        // A symbol address cannot be split into immediate bytes; stage it
        // through DE.
        if matches!(v, Operand::Imm { symbol: Some(_), .. }) {
            self.load_pair(Reg16::DE, v, 0)?;
            self.load_pair(Reg16::HL, ptr, 0)?;
            self.emit(Instr::LdIhlR { src: Reg::E });
            self.emit(Instr::IncSs { r: Reg16::HL });
            self.emit(Instr::LdIhlR { src: Reg::D });
            return Ok(());
        }
        self.load_pair(Reg16::HL, ptr, 0)?;
        for b in 0..size as usize {
            if let Some(imm) = Self::byte_imm(v, b) {
                self.emit(Instr::LdIhlN { imm });
            } else {
                let vr = self.byte_vr(v, b)?;
                self.emit(Instr::LdIhlVr { src: vr });
            }
            if b + 1 < size as usize {
                self.emit(Instr::IncSs { r: Reg16::HL });
            }
        }
        Ok(())
    }

    fn gen_reccopy(&mut self, dst: &Operand, src: &Operand, instr: &ir::Instr) -> CodegenResult<()> {
        let n = instr
            .texpr
            .as_ref()
            .map(|t| t.byte_size(self.ir))
            .unwrap_or(0);
        if n == 0 {
            return Ok(());
        }
        self.emit(Instr::Push { src: Reg16::BC });
        self.load_pair(Reg16::HL, src, 0)?;
        self.load_pair(Reg16::DE, dst, 0)?;
        self.emit(Instr::LdDdNn {
            dst: Reg16::BC,
            imm: Imm16::num(n as i64),
        });
        self.emit(Instr::Ldir);
        self.emit(Instr::Pop { dst: Reg16::BC });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Address arithmetic

    fn gen_ptridx(
        &mut self,
        dst: &Operand,
        base: &Operand,
        idx: &Operand,
        instr: &ir::Instr,
    ) -> CodegenResult<()> {
        let esize = instr
            .texpr
            .as_ref()
            .map(|t| t.byte_size(self.ir))
            .unwrap_or(1)
            .max(1);
        if let Operand::Imm {
            value,
            symbol: None,
        } = idx
        {
            self.load_pair(Reg16::HL, base, 0)?;
            let off = value.wrapping_mul(esize as i64) & 0xffff;
            if off != 0 {
                self.emit(Instr::LdDdNn {
                    dst: Reg16::DE,
                    imm: Imm16::num(off),
                });
                self.emit(Instr::AddHlSs { src: Reg16::DE });
            }
            return self.store_pair(dst, 0, Reg16::HL);
        }
        // Scale the index.
        self.load_pair(Reg16::HL, idx, 0)?;
        if esize.is_power_of_two() {
            for _ in 0..esize.trailing_zeros() {
                self.emit(Instr::AddHlSs { src: Reg16::HL });
            }
        } else {
            self.helpers.insert("__mul16");
            self.emit(Instr::LdDdNn {
                dst: Reg16::DE,
                imm: Imm16::num(esize as i64),
            });
            self.emit(Instr::CallNn {
                addr: Imm16::sym("__mul16"),
            });
        }
        self.load_pair(Reg16::DE, base, 0)?;
        self.emit(Instr::AddHlSs { src: Reg16::DE });
        self.store_pair(dst, 0, Reg16::HL)
    }

    fn gen_ptrdiff(
        &mut self,
        dst: &Operand,
        a: &Operand,
        b: &Operand,
        instr: &ir::Instr,
    ) -> CodegenResult<()> {
        let esize = instr
            .texpr
            .as_ref()
            .map(|t| t.byte_size(self.ir))
            .unwrap_or(1)
            .max(1);
        self.load_pair(Reg16::HL, a, 0)?;
        self.load_pair(Reg16::DE, b, 0)?;
        self.emit(Instr::Alu {
            op: AluOp::Or,
            src: Alu8::Reg(Reg::A),
        });
        self.emit(Instr::SbcHlSs { src: Reg16::DE });
        if esize > 1 {
            if esize.is_power_of_two() {
                for _ in 0..esize.trailing_zeros() {
                    self.emit(Instr::ShiftR {
                        op: ShiftOp::Sra,
                        r: Reg::H,
                    });
                    self.emit(Instr::ShiftR {
                        op: ShiftOp::Rr,
                        r: Reg::L,
                    });
                }
            } else {
                self.helpers.insert("__sdiv16");
                self.emit(Instr::LdDdNn {
                    dst: Reg16::DE,
                    imm: Imm16::num(esize as i64),
                });
                self.emit(Instr::CallNn {
                    addr: Imm16::sym("__sdiv16"),
                });
            }
        }
        self.store_pair(dst, 0, Reg16::HL)
    }

    // ------------------------------------------------------------------
    // Width changes

    fn gen_resize(&mut self, dst: &Operand, src: &Operand, instr: &ir::Instr) -> CodegenResult<()> {
        let dsize = self.op_size(dst, instr.width)?;
        if matches!(src, Operand::Imm { .. }) {
            return self.gen_imm(dst, src, dsize);
        }
        let ssize = self.op_size(src, None)?;
        let keep = dsize.min(ssize) as usize;
        for b in 0..keep {
            let s = self.byte_vr(src, b)?;
            let d = self.byte_vr(dst, b)?;
            self.emit(Instr::LdVrVr { dst: d, src: s });
        }
        if dsize as usize > keep {
            match instr.op {
                Op::Zrext => {
                    for b in keep..dsize as usize {
                        let d = self.byte_vr(dst, b)?;
                        self.emit(Instr::LdVrN { dst: d, imm: 0 });
                    }
                }
                Op::Sgnext => {
                    // A becomes 0x00 or 0xff depending on the source sign.
                    let top = self.byte_vr(src, keep - 1)?;
                    self.emit(Instr::LdRVr {
                        dst: Reg::A,
                        src: top,
                    });
                    self.emit(Instr::RotA { op: ShiftOp::Rl });
                    self.emit(Instr::Alu {
                        op: AluOp::Sbc,
                        src: Alu8::Reg(Reg::A),
                    });
                    for b in keep..dsize as usize {
                        let d = self.byte_vr(dst, b)?;
                        self.emit(Instr::LdVrR { dst: d, src: Reg::A });
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Calls and returns

    /// Byte size of a call argument operand.
    fn arg_size(&self, op: &Operand) -> u64 {
        match op {
            Operand::Var(name) => self.vals.get(name).map(|v| v.size()).unwrap_or(2),
            _ => 2,
        }
    }

    fn gen_call(
        &mut self,
        dest: Option<&Operand>,
        callee: &Operand,
        args: &Operand,
        instr: &ir::Instr,
    ) -> CodegenResult<()> {
        let (sym, fixed, variadic) = match callee {
            Operand::Imm {
                symbol: Some(s), ..
            }
            | Operand::Var(s) => {
                let p = self
                    .ir
                    .find_proc(s)
                    .ok_or_else(|| self.err(format!("call to unknown procedure {}", s)))?;
                (mangle(s), p.args.len(), p.variadic)
            }
            other => return Err(self.err(format!("bad call target {}", other))),
        };
        self.gen_call_common(dest, args, instr, CallTarget::Direct(sym), fixed, variadic)
    }

    fn gen_calli(
        &mut self,
        dest: Option<&Operand>,
        callee: &Operand,
        args: &Operand,
        instr: &ir::Instr,
    ) -> CodegenResult<()> {
        // A constant function address is a direct call after all.
        if let Operand::Imm {
            symbol: Some(s), ..
        } = callee
        {
            if let Some(p) = self.ir.find_proc(s) {
                return self.gen_call_common(
                    dest,
                    args,
                    instr,
                    CallTarget::Direct(mangle(s)),
                    p.args.len(),
                    p.variadic,
                );
            }
        }
        let (fixed, variadic) = match &instr.texpr {
            Some(TypeExpr::Func(ft)) => (ft.args.len(), ft.variadic),
            _ => {
                let n = match args {
                    Operand::List(l) => l.len(),
                    _ => 0,
                };
                (n, false)
            }
        };
        // Park the target in the thunk's cell before any argument register
        // is live.
        *self.need_calli = true;
        self.load_pair(Reg16::HL, callee, 0)?;
        self.emit(Instr::LdInnDd {
            addr: Imm16::sym("__calli_tgt"),
            src: Reg16::HL,
        });
        self.gen_call_common(dest, args, instr, CallTarget::Thunk, fixed, variadic)
    }

    fn gen_call_common(
        &mut self,
        dest: Option<&Operand>,
        args: &Operand,
        instr: &ir::Instr,
        target: CallTarget,
        fixed: usize,
        variadic: bool,
    ) -> CodegenResult<()> {
        let args = match args {
            Operand::List(l) => l.clone(),
            other => return Err(self.err(format!("bad argument list {}", other))),
        };
        let sizes: Vec<(String, u64)> = args
            .iter()
            .enumerate()
            .map(|(i, a)| (format!("%{}", i), self.arg_size(a)))
            .collect();
        let map = allocate_args(&sizes, variadic.then_some(fixed));

        // Reserve the stack argument area and fill it byte by byte, the
        // cursor riding in HL.
        if map.stack_size > 0 {
            self.emit(Instr::LdDdNn {
                dst: Reg16::HL,
                imm: Imm16::num(-(map.stack_size as i64)),
            });
            self.emit(Instr::AddHlSs { src: Reg16::SP });
            self.emit(Instr::LdSpHl);
            for (arg, entry) in args.iter().zip(&map.entries) {
                if entry.stack_bytes == 0 {
                    continue;
                }
                let size = self.arg_size(arg);
                let reg_bytes = (size as u16 - entry.stack_bytes) as usize;
                for k in 0..entry.stack_bytes as usize {
                    if let Some(imm) = Self::byte_imm(arg, reg_bytes + k) {
                        self.emit(Instr::LdIhlN { imm });
                    } else if matches!(arg, Operand::Imm { symbol: Some(_), .. }) {
                        return Err(self.err("symbol address in a stack argument"));
                    } else {
                        let vr = self.byte_vr(arg, reg_bytes + k)?;
                        self.emit(Instr::LdIhlVr { src: vr });
                    }
                    let last = std::ptr::eq(arg, args.last().expect("nonempty"))
                        && k + 1 == entry.stack_bytes as usize;
                    if !last {
                        self.emit(Instr::IncSs { r: Reg16::HL });
                    }
                }
            }
        }

        // Register-carried slots, in argument order.
        for (arg, entry) in args.iter().zip(&map.entries) {
            let mut byte = 0usize;
            for slot in &entry.reg_slots {
                match slot.part {
                    SlotPart::Whole => {
                        self.load_pair(slot.reg, arg, byte / 2)?;
                        byte += 2;
                    }
                    _ => {
                        let r = slot.half_reg().expect("half slot");
                        if let Some(imm) = Self::byte_imm(arg, byte) {
                            self.emit(Instr::LdRN { dst: r, imm });
                        } else {
                            let vr = self.byte_vr(arg, byte)?;
                            self.emit(Instr::LdRVr { dst: r, src: vr });
                        }
                        byte += 1;
                    }
                }
            }
        }

        match target {
            CallTarget::Direct(sym) => self.emit(Instr::CallNn {
                addr: Imm16::sym(sym),
            }),
            CallTarget::Thunk => self.emit(Instr::CallNn {
                addr: Imm16::sym("__calli"),
            }),
        }

        // Read the return value out, widest word first so a BC-resident
        // destination cannot clobber an unread word.
        if let Some(dst) = dest {
            let size = self.op_size(dst, instr.width)?;
            if size > 4 {
                // The callee hands words through BC and IY, which the
                // allocator must then leave alone in this procedure.
                self.no_alloc = true;
            }
            if size == 1 {
                self.store_a(dst, 0)?;
            } else {
                let words = (size as usize + 1) / 2;
                for w in (0..words).rev() {
                    let src = ret_reg(w);
                    self.store_pair(dst, w, src)?;
                }
            }
        }

        // Release the stack argument area.
        if map.stack_size > 0 {
            self.emit(Instr::LdDdNn {
                dst: Reg16::HL,
                imm: Imm16::num(map.stack_size as i64),
            });
            self.emit(Instr::AddHlSs { src: Reg16::SP });
            self.emit(Instr::LdSpHl);
        }
        Ok(())
    }

    fn gen_retv(&mut self, v: &Operand, instr: &ir::Instr) -> CodegenResult<()> {
        let size = self.op_size(v, instr.width)?;
        if size == 1 {
            self.load_a(v, 0)?;
        } else if size == 2 {
            self.load_pair(Reg16::HL, v, 0)?;
        } else {
            // Stage every word on the stack, then pop into the return
            // registers from the top down.
            let words = (size as usize + 1) / 2;
            for w in 0..words {
                self.load_pair(Reg16::HL, v, w)?;
                self.emit(Instr::Push { src: Reg16::HL });
            }
            for w in (0..words).rev() {
                self.emit(Instr::Pop { dst: ret_reg(w) });
            }
        }
        self.epilogue();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Variable arguments

    fn gen_vastart(&mut self, ap: &Operand, own_args: &ArgLocMap) -> CodegenResult<()> {
        // The variadic area begins after the fixed arguments' stack bytes.
        let off = ARG_BASE as i64 + own_args.stack_size as i64;
        self.emit(Instr::Push { src: Reg16::IX });
        self.emit(Instr::Pop { dst: Reg16::HL });
        self.emit(Instr::LdDdNn {
            dst: Reg16::DE,
            imm: Imm16::num(off),
        });
        self.emit(Instr::AddHlSs { src: Reg16::DE });
        self.emit(Instr::ExDeHl);
        self.load_pair(Reg16::HL, ap, 0)?;
        self.emit(Instr::LdIhlR { src: Reg::E });
        self.emit(Instr::IncSs { r: Reg16::HL });
        self.emit(Instr::LdIhlR { src: Reg::D });
        Ok(())
    }

    fn gen_vaarg(&mut self, dst: &Operand, ap: &Operand, instr: &ir::Instr) -> CodegenResult<()> {
        let size = self.op_size(dst, instr.width)?;
        // HL walks the packed variadic bytes; DE remembers where the
        // cursor is stored.
        self.load_pair(Reg16::HL, ap, 0)?;
        self.emit(Instr::LdRIhl { dst: Reg::E });
        self.emit(Instr::IncSs { r: Reg16::HL });
        self.emit(Instr::LdRIhl { dst: Reg::D });
        self.emit(Instr::ExDeHl);
        for b in 0..size as usize {
            let vr = self.byte_vr(dst, b)?;
            self.emit(Instr::LdVrIhl { dst: vr });
            self.emit(Instr::IncSs { r: Reg16::HL });
        }
        self.emit(Instr::ExDeHl);
        // HL is back at ap+1: store the advanced cursor.
        self.emit(Instr::LdIhlR { src: Reg::D });
        self.emit(Instr::DecSs { r: Reg16::HL });
        self.emit(Instr::LdIhlR { src: Reg::E });
        Ok(())
    }

    fn gen_vacopy(&mut self, dst: &Operand, src: &Operand) -> CodegenResult<()> {
        self.load_pair(Reg16::HL, src, 0)?;
        self.emit(Instr::LdRIhl { dst: Reg::E });
        self.emit(Instr::IncSs { r: Reg16::HL });
        self.emit(Instr::LdRIhl { dst: Reg::D });
        self.load_pair(Reg16::HL, dst, 0)?;
        self.emit(Instr::LdIhlR { src: Reg::E });
        self.emit(Instr::IncSs { r: Reg16::HL });
        self.emit(Instr::LdIhlR { src: Reg::D });
        Ok(())
    }
}

/// Which physical register carries return word `w`.
fn ret_reg(w: usize) -> Reg16 {
    match w {
        0 => Reg16::HL,
        1 => Reg16::DE,
        2 => Reg16::BC,
        _ => Reg16::IY,
    }
}

enum CallTarget {
    Direct(String),
    Thunk,
}

/// The cell holding byte `b` of a value of `size` bytes.
fn byte_of(regs: &[VReg], size: u64, b: usize) -> Vr {
    if size == 1 {
        Vr::whole(regs[0])
    } else if b % 2 == 0 {
        Vr::lower(regs[b / 2])
    } else {
        Vr::upper(regs[b / 2])
    }
}

fn req<'o>(op: Option<&'o Operand>) -> CodegenResult<&'o Operand> {
    op.ok_or_else(|| {
        CodegenError::InvalidInput(Pos::start(), "missing instruction operand".to_string())
    })
}

fn var_name(op: &Operand) -> CodegenResult<&str> {
    match op {
        Operand::Var(name) => Ok(name),
        other => Err(CodegenError::InvalidInput(
            Pos::start(),
            format!("expected a name operand, got {}", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgen;
    use zcc_front::{lexer, parser};

    fn select(src: &str) -> ic::Module {
        let toks = lexer::lex(src, "t.c");
        let ast = parser::parse_module(&toks).expect("parse");
        let (ir_mod, _) = cgen::generate(&toks, &ast).expect("generate");
        match select_module(&ir_mod) {
            Ok(m) => m,
            Err(e) => panic!("selection failed on {:?}: {}", src, e),
        }
    }

    fn proc_text(m: &ic::Module, name: &str) -> String {
        for d in &m.decls {
            if let ic::Decl::Proc(p) = d {
                if p.name == name {
                    return p
                        .body
                        .iter()
                        .map(|i| i.to_string())
                        .collect::<Vec<_>>()
                        .join("\n");
                }
            }
        }
        panic!("no procedure {}", name);
    }

    #[test]
    fn return_one_uses_hl() {
        let m = select("int f(void) { return 1; }");
        let text = proc_text(&m, "_f");
        assert!(text.contains("ld hl,"), "{}", text);
        assert!(text.contains("ret"), "{}", text);
        // Frame setup and teardown.
        assert!(text.contains("push ix"), "{}", text);
        assert!(text.contains("ld sp, ix"), "{}", text);
    }

    #[test]
    fn add_uses_hl_de() {
        let m = select("int add(int a, int b) { return a + b; }");
        let text = proc_text(&m, "_add");
        assert!(text.contains("add hl, de"), "{}", text);
    }

    #[test]
    fn wide_add_uses_adc() {
        let m = select("long l;\nvoid f(void) { l = l + 1; }");
        let text = proc_text(&m, "_f");
        assert!(text.contains("add hl, de"), "{}", text);
        assert!(text.contains("adc hl, de"), "{}", text);
    }

    #[test]
    fn bit_field_extract_masks() {
        let m = select(
            "struct S { int x : 3; int y : 5; };\nstruct S s;\nint f(void) { return s.x; }",
        );
        let text = proc_text(&m, "_f");
        assert!(text.contains("and 7"), "{}", text);
    }

    #[test]
    fn comparison_sets_bool() {
        let m = select("int f(int a, int b) { return a < b; }");
        let text = proc_text(&m, "_f");
        assert!(text.contains("sbc hl, de"), "{}", text);
        // The signed pattern consults overflow and sign.
        assert!(text.contains("jp pe,"), "{}", text);
    }

    #[test]
    fn unsigned_comparison_uses_carry() {
        let m = select("int f(unsigned a, unsigned b) { return a < b; }");
        let text = proc_text(&m, "_f");
        assert!(text.contains("jp c,"), "{}", text);
    }

    #[test]
    fn global_data_and_externs() {
        let m = select("int x = 7;\nextern int y;\nint get(void) { return x + y; }");
        let has_extern = m
            .decls
            .iter()
            .any(|d| matches!(d, ic::Decl::Extern(n) if n == "_y"));
        assert!(has_extern);
        let has_var = m.decls.iter().any(|d| match d {
            ic::Decl::Var(v) => v.name == "_x" && v.data == vec![Data::Word(Imm16::num(7))],
            _ => false,
        });
        assert!(has_var);
    }

    #[test]
    fn multiply_calls_helper() {
        let m = select("int f(int a, int b) { return a * b; }");
        let text = proc_text(&m, "_f");
        assert!(text.contains("call __mul16"), "{}", text);
        assert!(m
            .decls
            .iter()
            .any(|d| matches!(d, ic::Decl::Extern(n) if n == "__mul16")));
    }

    #[test]
    fn constant_shift_unrolls() {
        let m = select("int f(int a) { return a << 2; }");
        let text = proc_text(&m, "_f");
        assert!(text.contains("sla"), "{}", text);
        assert!(text.contains("rl "), "{}", text);
    }

    #[test]
    fn variable_shift_loops() {
        let m = select("int f(int a, int n) { return a >> n; }");
        let text = proc_text(&m, "_f");
        assert!(text.contains("dec a"), "{}", text);
        assert!(text.contains("jp nz,"), "{}", text);
    }

    #[test]
    fn call_marshals_into_pairs() {
        let m = select("int g(int a, int b);\nint f(void) { return g(1, 2); }");
        let text = proc_text(&m, "_f");
        assert!(text.contains("call _g"), "{}", text);
        // The two int arguments ride in HL and DE.
        assert!(text.contains("ld hl, "), "{}", text);
        assert!(text.contains("ld de, "), "{}", text);
    }

    #[test]
    fn variadic_call_pushes_stack_area() {
        let m = select(
            "int sum(int n, ...);\nint f(void) { return sum(2, 10, 20); }",
        );
        let text = proc_text(&m, "_f");
        // The two variadic ints live in a 4-byte stack area.
        assert!(text.contains("ld hl, -4"), "{}", text);
        assert!(text.contains("ld sp, hl"), "{}", text);
    }

    #[test]
    fn vastart_points_past_fixed_args() {
        let m = select(
            "int sum(int n, ...) {\n\t__va_list ap;\n\t__va_start(ap, n);\n\tint v = __va_arg(ap, int);\n\t__va_end(ap);\n\treturn v;\n}",
        );
        let text = proc_text(&m, "_sum");
        // n is in HL, so the variadic area starts right past the frame
        // linkage.
        assert!(text.contains("ld de, 4"), "{}", text);
    }

    #[test]
    fn labels_are_mangled_per_proc() {
        let m = select("int f(int a) { if (a) return 1; return 0; }");
        let text = proc_text(&m, "_f");
        assert!(text.contains("_f_if_"), "{}", text);
    }

    #[test]
    fn no_value_below_machine_support_is_accepted() {
        let m = select("char c;\nchar f(char x) { return x; }");
        let text = proc_text(&m, "_f");
        assert!(text.contains("ld a,"), "{}", text);
    }

    #[test]
    fn struct_assign_copies_bytes() {
        let m = select(
            "struct P { int x; int y; };\nvoid f(struct P *a, struct P *b) { *a = *b; }",
        );
        let text = proc_text(&m, "_f");
        assert!(text.contains("ldir"), "{}", text);
        assert!(text.contains("ld bc, 4"), "{}", text);
    }
}
