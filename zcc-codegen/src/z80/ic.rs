//! The Z80-IC data model.
//!
//! Instructions come in two tiers. Tier A is one enum variant per physical
//! Z80 instruction form, with operands restricted to the register classes
//! the Zilog manual defines: `r` (A,B,C,D,E,H,L), `dd`/`ss` (BC,DE,HL,SP),
//! `qq` (BC,DE,HL,AF) and `pp` (BC,DE,IX,SP). Tier B mirrors Tier A over
//! *virtual registers*: 8-bit cells identified by a number and a part tag
//! that records whether the cell stands alone or is the lower or upper half
//! of a 16-bit pair.
//!
//! Tier B instructions may appear freely during instruction selection;
//! after register allocation only Tier A remains, plus the frame accesses
//! that realise spilled virtual registers.

use core::fmt;
use cranelift_entity::entity_impl;
use smallvec::{smallvec, SmallVec};

/// An 8-bit physical register (the `r` class).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Reg {
    A,
    B,
    C,
    D,
    E,
    H,
    L,
}

impl Reg {
    /// The register's name in assembly.
    pub fn name(self) -> &'static str {
        match self {
            Self::A => "a",
            Self::B => "b",
            Self::C => "c",
            Self::D => "d",
            Self::E => "e",
            Self::H => "h",
            Self::L => "l",
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A 16-bit physical register or register pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Reg16 {
    AF,
    BC,
    DE,
    HL,
    IX,
    IY,
    SP,
}

impl Reg16 {
    /// The register's name in assembly.
    pub fn name(self) -> &'static str {
        match self {
            Self::AF => "af",
            Self::BC => "bc",
            Self::DE => "de",
            Self::HL => "hl",
            Self::IX => "ix",
            Self::IY => "iy",
            Self::SP => "sp",
        }
    }

    /// The high and low halves of a main register pair.
    pub fn halves(self) -> Option<(Reg, Reg)> {
        match self {
            Self::BC => Some((Reg::B, Reg::C)),
            Self::DE => Some((Reg::D, Reg::E)),
            Self::HL => Some((Reg::H, Reg::L)),
            _ => None,
        }
    }
}

impl fmt::Display for Reg16 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A condition code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Cond {
    NZ,
    Z,
    NC,
    C,
    PO,
    PE,
    P,
    M,
}

impl Cond {
    /// The condition's name in assembly.
    pub fn name(self) -> &'static str {
        match self {
            Self::NZ => "nz",
            Self::Z => "z",
            Self::NC => "nc",
            Self::C => "c",
            Self::PO => "po",
            Self::PE => "pe",
            Self::P => "p",
            Self::M => "m",
        }
    }
}

impl fmt::Display for Cond {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An opaque reference to a virtual register (pair-capable cell number).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VReg(u32);
entity_impl!(VReg, "vr");

/// Which part of a virtual register an 8-bit operand uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VPart {
    /// The cell stands alone as a plain 8-bit value.
    Whole,
    /// The lower half of a 16-bit pair.
    Lower,
    /// The upper half of a 16-bit pair.
    Upper,
}

/// An 8-bit virtual register operand: a cell number plus its part tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Vr {
    /// The cell number.
    pub reg: VReg,
    /// Which part of the cell.
    pub part: VPart,
}

impl Vr {
    /// A stand-alone 8-bit cell.
    pub fn whole(reg: VReg) -> Self {
        Self {
            reg,
            part: VPart::Whole,
        }
    }

    /// The lower half of a pair.
    pub fn lower(reg: VReg) -> Self {
        Self {
            reg,
            part: VPart::Lower,
        }
    }

    /// The upper half of a pair.
    pub fn upper(reg: VReg) -> Self {
        Self {
            reg,
            part: VPart::Upper,
        }
    }
}

impl fmt::Display for Vr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.part {
            VPart::Whole => write!(f, "{}", self.reg),
            VPart::Lower => write!(f, "{}.l", self.reg),
            VPart::Upper => write!(f, "{}.h", self.reg),
        }
    }
}

/// A 16-bit immediate: a value or a symbol plus offset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Imm16 {
    /// The immediate value, or the offset from `symbol`.
    pub value: i64,
    /// Referenced symbol (a label or a global), when present.
    pub symbol: Option<String>,
}

impl Imm16 {
    /// A plain numeric immediate.
    pub fn num(value: i64) -> Self {
        Self {
            value,
            symbol: None,
        }
    }

    /// A symbol reference.
    pub fn sym(name: impl Into<String>) -> Self {
        Self {
            value: 0,
            symbol: Some(name.into()),
        }
    }
}

impl fmt::Display for Imm16 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.symbol {
            None => write!(f, "{}", self.value),
            Some(s) => {
                if self.value == 0 {
                    write!(f, "{}", s)
                } else {
                    write!(f, "{}+{}", s, self.value)
                }
            }
        }
    }
}

/// The source operand of an 8-bit ALU operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Alu8 {
    /// A register.
    Reg(Reg),
    /// An immediate.
    Imm(u8),
    /// The byte at `(HL)`.
    IndHl,
    /// The byte at `(IX+d)`.
    IndIx(i8),
}

impl fmt::Display for Alu8 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Reg(r) => write!(f, "{}", r),
            Self::Imm(n) => write!(f, "{}", n),
            Self::IndHl => write!(f, "(hl)"),
            Self::IndIx(d) => write!(f, "(ix{:+})", d),
        }
    }
}

/// An 8-bit ALU operation selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum AluOp {
    Add,
    Adc,
    Sub,
    Sbc,
    And,
    Or,
    Xor,
    Cp,
}

impl AluOp {
    /// The mnemonic, with the `a` destination where the manual writes one.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Add => "add a,",
            Self::Adc => "adc a,",
            Self::Sub => "sub",
            Self::Sbc => "sbc a,",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
            Self::Cp => "cp",
        }
    }
}

/// A shift or rotate operation selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ShiftOp {
    Rlc,
    Rrc,
    Rl,
    Rr,
    Sla,
    Sra,
    Srl,
}

impl ShiftOp {
    /// The mnemonic.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Rlc => "rlc",
            Self::Rrc => "rrc",
            Self::Rl => "rl",
            Self::Rr => "rr",
            Self::Sla => "sla",
            Self::Sra => "sra",
            Self::Srl => "srl",
        }
    }
}

/// One Z80-IC instruction.
///
/// Variants up to `Halt` are Tier A (physical); the `..Vr`/`..Vrr`
/// variants are Tier B (virtual). `Label` is a pseudo-entry marking a jump
/// target, and `AsmText` passes inline assembly through verbatim.
#[derive(Clone, Debug, PartialEq)]
pub enum Instr {
    // ---- Tier A: 8-bit loads
    /// `ld r, r'`
    LdRR {
        /// Destination register.
        dst: Reg,
        /// Source register.
        src: Reg,
    },
    /// `ld r, n`
    LdRN {
        /// Destination register.
        dst: Reg,
        /// Immediate value.
        imm: u8,
    },
    /// `ld r, (hl)`
    LdRIhl {
        /// Destination register.
        dst: Reg,
    },
    /// `ld (hl), r`
    LdIhlR {
        /// Source register.
        src: Reg,
    },
    /// `ld (hl), n`
    LdIhlN {
        /// Immediate value.
        imm: u8,
    },
    /// `ld r, (ix+d)`
    LdRIixd {
        /// Destination register.
        dst: Reg,
        /// Frame displacement.
        disp: i8,
    },
    /// `ld (ix+d), r`
    LdIixdR {
        /// Frame displacement.
        disp: i8,
        /// Source register.
        src: Reg,
    },
    /// `ld (ix+d), n`
    LdIixdN {
        /// Frame displacement.
        disp: i8,
        /// Immediate value.
        imm: u8,
    },

    // ---- Tier A: 16-bit loads
    /// `ld dd, nn` (BC, DE, HL, SP, IX, IY)
    LdDdNn {
        /// Destination register pair.
        dst: Reg16,
        /// Immediate.
        imm: Imm16,
    },
    /// `ld dd, (nn)`
    LdDdInn {
        /// Destination register pair.
        dst: Reg16,
        /// Source address.
        addr: Imm16,
    },
    /// `ld (nn), dd`
    LdInnDd {
        /// Destination address.
        addr: Imm16,
        /// Source register pair.
        src: Reg16,
    },
    /// `ld sp, hl`
    LdSpHl,
    /// `ld sp, ix`
    LdSpIx,
    /// `ex de, hl`
    ExDeHl,
    /// `ldir` (block copy from `(HL)` to `(DE)`, `BC` bytes)
    Ldir,
    /// `push qq`
    Push {
        /// Pushed register pair (BC, DE, HL, AF, IX, IY).
        src: Reg16,
    },
    /// `pop qq`
    Pop {
        /// Popped register pair.
        dst: Reg16,
    },

    // ---- Tier A: 8-bit arithmetic and logic
    /// An 8-bit ALU operation on the accumulator.
    Alu {
        /// The operation.
        op: AluOp,
        /// The source operand.
        src: Alu8,
    },
    /// `inc r`
    IncR {
        /// The register.
        r: Reg,
    },
    /// `dec r`
    DecR {
        /// The register.
        r: Reg,
    },
    /// `inc (ix+d)`
    IncIixd {
        /// Frame displacement.
        disp: i8,
    },
    /// `dec (ix+d)`
    DecIixd {
        /// Frame displacement.
        disp: i8,
    },

    // ---- Tier A: 16-bit arithmetic
    /// `add hl, ss`
    AddHlSs {
        /// The added pair (BC, DE, HL, SP).
        src: Reg16,
    },
    /// `adc hl, ss`
    AdcHlSs {
        /// The added pair.
        src: Reg16,
    },
    /// `sbc hl, ss`
    SbcHlSs {
        /// The subtracted pair.
        src: Reg16,
    },
    /// `add ix, pp`
    AddIxPp {
        /// The added pair (BC, DE, IX, SP).
        src: Reg16,
    },
    /// `inc ss`
    IncSs {
        /// The register pair.
        r: Reg16,
    },
    /// `dec ss`
    DecSs {
        /// The register pair.
        r: Reg16,
    },

    // ---- Tier A: rotate, shift, bit
    /// `rlca` / `rrca` / `rla` / `rra` on the accumulator.
    RotA {
        /// Which rotate (only `Rlc`, `Rrc`, `Rl`, `Rr` occur).
        op: ShiftOp,
    },
    /// A shift or rotate of a register.
    ShiftR {
        /// The operation.
        op: ShiftOp,
        /// The register.
        r: Reg,
    },
    /// A shift or rotate of `(ix+d)`.
    ShiftIixd {
        /// The operation.
        op: ShiftOp,
        /// Frame displacement.
        disp: i8,
    },
    /// `bit b, r`
    BitBR {
        /// Bit number.
        b: u8,
        /// The register.
        r: Reg,
    },
    /// `set b, r`
    SetBR {
        /// Bit number.
        b: u8,
        /// The register.
        r: Reg,
    },
    /// `res b, r`
    ResBR {
        /// Bit number.
        b: u8,
        /// The register.
        r: Reg,
    },

    // ---- Tier A: control transfer
    /// `jp nn`
    JpNn {
        /// Target address or label.
        addr: Imm16,
    },
    /// `jp cc, nn`
    JpCcNn {
        /// The condition.
        cc: Cond,
        /// Target address or label.
        addr: Imm16,
    },
    /// `jp (hl)`
    JpIhl,
    /// `djnz e`
    Djnz {
        /// Target label.
        addr: Imm16,
    },
    /// `call nn`
    CallNn {
        /// Target address or symbol.
        addr: Imm16,
    },
    /// `call cc, nn`
    CallCcNn {
        /// The condition.
        cc: Cond,
        /// Target address or symbol.
        addr: Imm16,
    },
    /// `ret`
    Ret,
    /// `ret cc`
    RetCc {
        /// The condition.
        cc: Cond,
    },

    // ---- Tier A: miscellaneous
    /// `cpl`
    Cpl,
    /// `neg`
    Neg,
    /// `scf`
    Scf,
    /// `ccf`
    Ccf,
    /// `nop`
    Nop,
    /// `halt`
    Halt,

    // ---- Tier B: virtual-register pseudo-instructions
    /// `ld vr, vr'`
    LdVrVr {
        /// Destination cell.
        dst: Vr,
        /// Source cell.
        src: Vr,
    },
    /// `ld vr, n`
    LdVrN {
        /// Destination cell.
        dst: Vr,
        /// Immediate value.
        imm: u8,
    },
    /// `ld vrr, nn`
    LdVrrNn {
        /// Destination pair.
        dst: VReg,
        /// Immediate.
        imm: Imm16,
    },
    /// `ld vr, (hl)`
    LdVrIhl {
        /// Destination cell.
        dst: Vr,
    },
    /// `ld (hl), vr`
    LdIhlVr {
        /// Source cell.
        src: Vr,
    },
    /// `ld vr, (ix+d)`
    LdVrIixd {
        /// Destination cell.
        dst: Vr,
        /// Frame displacement.
        disp: i8,
    },
    /// `ld (ix+d), vr`
    LdIixdVr {
        /// Frame displacement.
        disp: i8,
        /// Source cell.
        src: Vr,
    },
    /// `ld r, vr` (bridge into a physical register)
    LdRVr {
        /// Destination register.
        dst: Reg,
        /// Source cell.
        src: Vr,
    },
    /// `ld vr, r` (bridge out of a physical register)
    LdVrR {
        /// Destination cell.
        dst: Vr,
        /// Source register.
        src: Reg,
    },
    /// `ld r16, vrr` (bridge a pair into a physical pair)
    LdR16Vrr {
        /// Destination register pair.
        dst: Reg16,
        /// Source pair.
        src: VReg,
    },
    /// `ld vrr, r16` (bridge a physical pair into a pair)
    LdVrrR16 {
        /// Destination pair.
        dst: VReg,
        /// Source register pair.
        src: Reg16,
    },
    /// An 8-bit ALU operation on the accumulator with a virtual source.
    AluVr {
        /// The operation.
        op: AluOp,
        /// The source cell.
        src: Vr,
    },
    /// `inc vr`
    IncVr {
        /// The cell.
        vr: Vr,
    },
    /// `dec vr`
    DecVr {
        /// The cell.
        vr: Vr,
    },
    /// `add vrr, vrr'` (16-bit add of two pairs)
    AddVrrVrr {
        /// Destination pair.
        dst: VReg,
        /// Source pair.
        src: VReg,
    },
    /// `inc vrr`
    IncVrr {
        /// The pair.
        vr: VReg,
    },
    /// `dec vrr`
    DecVrr {
        /// The pair.
        vr: VReg,
    },
    /// `push vrr`
    PushVrr {
        /// The pushed pair.
        src: VReg,
    },
    /// `pop vrr`
    PopVrr {
        /// The popped pair.
        dst: VReg,
    },
    /// A shift or rotate of a virtual cell.
    ShiftVr {
        /// The operation.
        op: ShiftOp,
        /// The cell.
        vr: Vr,
    },
    /// `bit b, vr`
    BitBVr {
        /// Bit number.
        b: u8,
        /// The cell.
        vr: Vr,
    },
    /// `jp (vrr)`
    JpVrr {
        /// The pair holding the target.
        src: VReg,
    },

    // ---- pseudo-entries
    /// A jump-target label.
    Label(String),
    /// Verbatim inline assembly.
    AsmText(String),
}

impl Instr {
    /// Is this a Tier B (virtual-register) instruction?
    pub fn is_virtual(&self) -> bool {
        matches!(
            self,
            Self::LdVrVr { .. }
                | Self::LdVrN { .. }
                | Self::LdVrrNn { .. }
                | Self::LdVrIhl { .. }
                | Self::LdIhlVr { .. }
                | Self::LdVrIixd { .. }
                | Self::LdIixdVr { .. }
                | Self::LdRVr { .. }
                | Self::LdVrR { .. }
                | Self::LdR16Vrr { .. }
                | Self::LdVrrR16 { .. }
                | Self::AluVr { .. }
                | Self::IncVr { .. }
                | Self::DecVr { .. }
                | Self::AddVrrVrr { .. }
                | Self::IncVrr { .. }
                | Self::DecVrr { .. }
                | Self::PushVrr { .. }
                | Self::PopVrr { .. }
                | Self::ShiftVr { .. }
                | Self::BitBVr { .. }
                | Self::JpVrr { .. }
        )
    }

    /// The virtual registers this instruction mentions, with whether the
    /// mention requires 8-bit half access.
    pub fn vregs(&self) -> SmallVec<[(VReg, bool); 2]> {
        match self {
            Self::LdVrVr { dst, src } => smallvec![(dst.reg, true), (src.reg, true)],
            Self::LdVrN { dst, .. } => smallvec![(dst.reg, true)],
            Self::LdVrrNn { dst, .. } => smallvec![(*dst, false)],
            Self::LdVrIhl { dst } => smallvec![(dst.reg, true)],
            Self::LdIhlVr { src } => smallvec![(src.reg, true)],
            Self::LdVrIixd { dst, .. } => smallvec![(dst.reg, true)],
            Self::LdIixdVr { src, .. } => smallvec![(src.reg, true)],
            Self::LdRVr { src, .. } => smallvec![(src.reg, true)],
            Self::LdVrR { dst, .. } => smallvec![(dst.reg, true)],
            Self::LdR16Vrr { src, .. } => smallvec![(*src, false)],
            Self::LdVrrR16 { dst, .. } => smallvec![(*dst, false)],
            Self::AluVr { src, .. } => smallvec![(src.reg, true)],
            Self::IncVr { vr } | Self::DecVr { vr } => smallvec![(vr.reg, true)],
            Self::AddVrrVrr { dst, src } => smallvec![(*dst, false), (*src, false)],
            Self::IncVrr { vr } | Self::DecVrr { vr } => smallvec![(*vr, false)],
            Self::PushVrr { src } => smallvec![(*src, false)],
            Self::PopVrr { dst } => smallvec![(*dst, false)],
            Self::ShiftVr { vr, .. } => smallvec![(vr.reg, true)],
            Self::BitBVr { vr, .. } => smallvec![(vr.reg, true)],
            Self::JpVrr { src } => smallvec![(*src, false)],
            _ => SmallVec::new(),
        }
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::LdRR { dst, src } => write!(f, "ld {}, {}", dst, src),
            Self::LdRN { dst, imm } => write!(f, "ld {}, {}", dst, imm),
            Self::LdRIhl { dst } => write!(f, "ld {}, (hl)", dst),
            Self::LdIhlR { src } => write!(f, "ld (hl), {}", src),
            Self::LdIhlN { imm } => write!(f, "ld (hl), {}", imm),
            Self::LdRIixd { dst, disp } => write!(f, "ld {}, (ix{:+})", dst, disp),
            Self::LdIixdR { disp, src } => write!(f, "ld (ix{:+}), {}", disp, src),
            Self::LdIixdN { disp, imm } => write!(f, "ld (ix{:+}), {}", disp, imm),
            Self::LdDdNn { dst, imm } => write!(f, "ld {}, {}", dst, imm),
            Self::LdDdInn { dst, addr } => write!(f, "ld {}, ({})", dst, addr),
            Self::LdInnDd { addr, src } => write!(f, "ld ({}), {}", addr, src),
            Self::LdSpHl => write!(f, "ld sp, hl"),
            Self::LdSpIx => write!(f, "ld sp, ix"),
            Self::ExDeHl => write!(f, "ex de, hl"),
            Self::Ldir => write!(f, "ldir"),
            Self::Push { src } => write!(f, "push {}", src),
            Self::Pop { dst } => write!(f, "pop {}", dst),
            Self::Alu { op, src } => write!(f, "{} {}", op.mnemonic(), src),
            Self::IncR { r } => write!(f, "inc {}", r),
            Self::DecR { r } => write!(f, "dec {}", r),
            Self::IncIixd { disp } => write!(f, "inc (ix{:+})", disp),
            Self::DecIixd { disp } => write!(f, "dec (ix{:+})", disp),
            Self::AddHlSs { src } => write!(f, "add hl, {}", src),
            Self::AdcHlSs { src } => write!(f, "adc hl, {}", src),
            Self::SbcHlSs { src } => write!(f, "sbc hl, {}", src),
            Self::AddIxPp { src } => write!(f, "add ix, {}", src),
            Self::IncSs { r } => write!(f, "inc {}", r),
            Self::DecSs { r } => write!(f, "dec {}", r),
            Self::RotA { op } => match op {
                ShiftOp::Rlc => write!(f, "rlca"),
                ShiftOp::Rrc => write!(f, "rrca"),
                ShiftOp::Rl => write!(f, "rla"),
                _ => write!(f, "rra"),
            },
            Self::ShiftR { op, r } => write!(f, "{} {}", op.mnemonic(), r),
            Self::ShiftIixd { op, disp } => write!(f, "{} (ix{:+})", op.mnemonic(), disp),
            Self::BitBR { b, r } => write!(f, "bit {}, {}", b, r),
            Self::SetBR { b, r } => write!(f, "set {}, {}", b, r),
            Self::ResBR { b, r } => write!(f, "res {}, {}", b, r),
            Self::JpNn { addr } => write!(f, "jp {}", addr),
            Self::JpCcNn { cc, addr } => write!(f, "jp {}, {}", cc, addr),
            Self::JpIhl => write!(f, "jp (hl)"),
            Self::Djnz { addr } => write!(f, "djnz {}", addr),
            Self::CallNn { addr } => write!(f, "call {}", addr),
            Self::CallCcNn { cc, addr } => write!(f, "call {}, {}", cc, addr),
            Self::Ret => write!(f, "ret"),
            Self::RetCc { cc } => write!(f, "ret {}", cc),
            Self::Cpl => write!(f, "cpl"),
            Self::Neg => write!(f, "neg"),
            Self::Scf => write!(f, "scf"),
            Self::Ccf => write!(f, "ccf"),
            Self::Nop => write!(f, "nop"),
            Self::Halt => write!(f, "halt"),
            Self::LdVrVr { dst, src } => write!(f, "ld {}, {}", dst, src),
            Self::LdVrN { dst, imm } => write!(f, "ld {}, {}", dst, imm),
            Self::LdVrrNn { dst, imm } => write!(f, "ld {}, {}", dst, imm),
            Self::LdVrIhl { dst } => write!(f, "ld {}, (hl)", dst),
            Self::LdIhlVr { src } => write!(f, "ld (hl), {}", src),
            Self::LdVrIixd { dst, disp } => write!(f, "ld {}, (ix{:+})", dst, disp),
            Self::LdIixdVr { disp, src } => write!(f, "ld (ix{:+}), {}", disp, src),
            Self::LdRVr { dst, src } => write!(f, "ld {}, {}", dst, src),
            Self::LdVrR { dst, src } => write!(f, "ld {}, {}", dst, src),
            Self::LdR16Vrr { dst, src } => write!(f, "ld {}, {}", dst, src),
            Self::LdVrrR16 { dst, src } => write!(f, "ld {}, {}", dst, src),
            Self::AluVr { op, src } => write!(f, "{} {}", op.mnemonic(), src),
            Self::IncVr { vr } => write!(f, "inc {}", vr),
            Self::DecVr { vr } => write!(f, "dec {}", vr),
            Self::AddVrrVrr { dst, src } => write!(f, "add {}, {}", dst, src),
            Self::IncVrr { vr } => write!(f, "inc {}", vr),
            Self::DecVrr { vr } => write!(f, "dec {}", vr),
            Self::PushVrr { src } => write!(f, "push {}", src),
            Self::PopVrr { dst } => write!(f, "pop {}", dst),
            Self::ShiftVr { op, vr } => write!(f, "{} {}", op.mnemonic(), vr),
            Self::BitBVr { b, vr } => write!(f, "bit {}, {}", b, vr),
            Self::JpVrr { src } => write!(f, "jp ({})", src),
            Self::Label(name) => write!(f, "{}:", name),
            Self::AsmText(text) => write!(f, "{}", text),
        }
    }
}

/// One entry of a variable's data block.
#[derive(Clone, Debug, PartialEq)]
pub enum Data {
    /// `db`
    Byte(i64),
    /// `dw`, possibly a symbol address.
    Word(Imm16),
    /// `dd`
    DWord(i64),
    /// `dq`
    QWord(i64),
    /// `defs` (zero-filled space).
    Space(u64),
}

/// A Z80-IC variable declaration.
#[derive(Clone, Debug)]
pub struct Var {
    /// The symbol name.
    pub name: String,
    /// True when the symbol is exported.
    pub global: bool,
    /// Initialiser entries.
    pub data: Vec<Data>,
}

/// A Z80-IC procedure.
#[derive(Clone, Debug)]
pub struct Proc {
    /// The symbol name.
    pub name: String,
    /// True when the symbol is exported.
    pub global: bool,
    /// Local-variable table: IR name to frame offset (relative to IX).
    pub lvars: Vec<(String, i16)>,
    /// Size of the local-variable area in bytes.
    pub local_size: u16,
    /// Index into `body` of the frame-allocation instruction whose
    /// immediate the register allocator enlarges for spills.
    pub frame_setup: Option<usize>,
    /// The instruction sequence (labels are pseudo-entries).
    pub body: Vec<Instr>,
    /// Number of virtual registers used.
    pub used_vregs: u32,
    /// Virtual registers that must live in the frame (they are touched
    /// inside sequences that save and restore physical pairs around them).
    pub pinned: Vec<VReg>,
    /// When set, no virtual register may take a physical pair: the
    /// procedure returns or receives a value wide enough that BC and IY
    /// carry return words and cannot be preserved.
    pub no_alloc: bool,
}

impl Proc {
    /// Does any Tier B instruction remain?
    pub fn has_virtual(&self) -> bool {
        self.body.iter().any(|i| i.is_virtual())
    }
}

/// A top-level Z80-IC declaration.
#[derive(Clone, Debug)]
pub enum Decl {
    /// A reference to an external symbol.
    Extern(String),
    /// A variable with its data.
    Var(Var),
    /// A procedure.
    Proc(Proc),
}

/// A whole Z80-IC module.
#[derive(Clone, Debug, Default)]
pub struct Module {
    /// Declarations in order.
    pub decls: Vec<Decl>,
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for decl in &self.decls {
            match decl {
                Decl::Extern(name) => writeln!(f, "extern {}", name)?,
                Decl::Var(v) => {
                    writeln!(f, "{}:", v.name)?;
                    for d in &v.data {
                        match d {
                            Data::Byte(b) => writeln!(f, "\tdb {}", b)?,
                            Data::Word(w) => writeln!(f, "\tdw {}", w)?,
                            Data::DWord(d) => writeln!(f, "\tdd {}", d)?,
                            Data::QWord(q) => writeln!(f, "\tdq {}", q)?,
                            Data::Space(n) => writeln!(f, "\tdefs {}", n)?,
                        }
                    }
                }
                Decl::Proc(p) => {
                    writeln!(f, "{}:", p.name)?;
                    for i in &p.body {
                        match i {
                            Instr::Label(_) => writeln!(f, "{}", i)?,
                            _ => writeln!(f, "\t{}", i)?,
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_display() {
        assert_eq!(Reg::A.to_string(), "a");
        assert_eq!(Reg16::HL.to_string(), "hl");
        assert_eq!(Cond::NZ.to_string(), "nz");
        assert_eq!(Reg16::BC.halves(), Some((Reg::B, Reg::C)));
        assert_eq!(Reg16::IX.halves(), None);
    }

    #[test]
    fn vr_display() {
        let v = VReg::from_u32(3);
        assert_eq!(Vr::whole(v).to_string(), "vr3");
        assert_eq!(Vr::lower(v).to_string(), "vr3.l");
        assert_eq!(Vr::upper(v).to_string(), "vr3.h");
    }

    #[test]
    fn instr_display() {
        assert_eq!(
            Instr::LdRR {
                dst: Reg::A,
                src: Reg::B
            }
            .to_string(),
            "ld a, b"
        );
        assert_eq!(
            Instr::AddHlSs { src: Reg16::DE }.to_string(),
            "add hl, de"
        );
        assert_eq!(
            Instr::Alu {
                op: AluOp::And,
                src: Alu8::Imm(7)
            }
            .to_string(),
            "and 7"
        );
        assert_eq!(
            Instr::LdRIixd {
                dst: Reg::C,
                disp: -4
            }
            .to_string(),
            "ld c, (ix-4)"
        );
        assert_eq!(
            Instr::JpCcNn {
                cc: Cond::Z,
                addr: Imm16::sym("end")
            }
            .to_string(),
            "jp z, end"
        );
    }

    #[test]
    fn virtual_tier_is_flagged() {
        let v = VReg::from_u32(0);
        assert!(Instr::LdVrrNn {
            dst: v,
            imm: Imm16::num(1)
        }
        .is_virtual());
        assert!(!Instr::Ret.is_virtual());
        assert!(!Instr::Label("x".to_string()).is_virtual());
    }

    #[test]
    fn vreg_mentions() {
        let v0 = VReg::from_u32(0);
        let v1 = VReg::from_u32(1);
        let i = Instr::LdVrVr {
            dst: Vr::whole(v0),
            src: Vr::lower(v1),
        };
        assert_eq!(i.vregs().as_slice(), &[(v0, true), (v1, true)]);
        let j = Instr::LdR16Vrr {
            dst: Reg16::HL,
            src: v0,
        };
        assert_eq!(j.vregs().as_slice(), &[(v0, false)]);
    }
}
