//! The typed intermediate representation.
//!
//! An IR module owns an ordered list of declarations: records, variables and
//! procedures. A procedure body is a *labelled block*: a flat list of
//! entries, each an optional label plus an optional instruction. There are
//! deliberately no basic blocks; jumps target symbolic labels within the
//! same block, and later passes are free to group entries internally.
//!
//! Instructions are an opcode from a closed set, a bit width where the
//! opcode is width-parametric, a destination operand, up to two value
//! operands and an optional type-expression operand. Operands reference
//! variables by name: `%name` for locals and arguments, `@name` for
//! globals; the references are weak and resolved by lookup.
//!
//! The whole module is dumpable to a stable text format (`Display`), used
//! by the driver's debug mode and by the tests.

use core::fmt;

/// Operation bit widths.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Width {
    W8,
    W16,
    W32,
    W64,
}

impl Width {
    /// Width in bits.
    pub fn bits(self) -> u32 {
        match self {
            Self::W8 => 8,
            Self::W16 => 16,
            Self::W32 => 32,
            Self::W64 => 64,
        }
    }

    /// Width in bytes.
    pub fn bytes(self) -> u64 {
        self.bits() as u64 / 8
    }

    /// The width for a bit count.
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            8 => Some(Self::W8),
            16 => Some(Self::W16),
            32 => Some(Self::W32),
            64 => Some(Self::W64),
            _ => None,
        }
    }

    /// The narrowest width that holds `bytes` bytes.
    pub fn for_bytes(bytes: u64) -> Option<Self> {
        match bytes {
            1 => Some(Self::W8),
            2 => Some(Self::W16),
            3 | 4 => Some(Self::W32),
            5..=8 => Some(Self::W64),
            _ => None,
        }
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.bits())
    }
}

/// An IR type expression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeExpr {
    /// An integer of the given width.
    Int(Width),
    /// A pointer; the width is the address width of the target.
    Ptr(Width),
    /// An array: element count and element type.
    Array(u64, Box<TypeExpr>),
    /// A named type, resolving to a record declaration.
    Ident(String),
    /// The variable-argument list type.
    VaList,
    /// A function signature, used as the type operand of indirect calls.
    Func(Box<FuncTypeExpr>),
}

/// The signature carried by a `TypeExpr::Func`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FuncTypeExpr {
    /// Argument types in order.
    pub args: Vec<TypeExpr>,
    /// Return type; `None` for no return value.
    pub ret: Option<TypeExpr>,
    /// Does the function take variable arguments?
    pub variadic: bool,
}

impl TypeExpr {
    /// A 16-bit pointer, the address width of the target.
    pub fn ptr16() -> Self {
        Self::Ptr(Width::W16)
    }

    /// Size of the type in bytes. Named types are resolved against
    /// `module`.
    pub fn byte_size(&self, module: &Module) -> u64 {
        match self {
            Self::Int(w) | Self::Ptr(w) => w.bytes(),
            Self::Array(n, elem) => n * elem.byte_size(module),
            Self::Ident(name) => module
                .find_record(name)
                .map(|r| r.byte_size(module))
                .unwrap_or(0),
            Self::VaList => 2,
            Self::Func(_) => 0,
        }
    }
}

impl fmt::Display for TypeExpr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Int(w) => write!(f, "int.{}", w),
            Self::Ptr(w) => write!(f, "ptr.{}", w),
            Self::Array(n, elem) => write!(f, "[{}] {}", n, elem),
            Self::Ident(name) => write!(f, "{}", name),
            Self::VaList => write!(f, "va_list"),
            Self::Func(ft) => {
                write!(f, "proc(")?;
                for (i, a) in ft.args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                if ft.variadic {
                    if !ft.args.is_empty() {
                        write!(f, ", ")?;
                    }
                    write!(f, "...")?;
                }
                write!(f, ")")?;
                if let Some(ret) = &ft.ret {
                    write!(f, " : {}", ret)?;
                }
                Ok(())
            }
        }
    }
}

/// An instruction operand.
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    /// An immediate: a 64-bit value plus an optional symbol reference the
    /// value is an offset from.
    Imm {
        /// The immediate value (or symbol offset).
        value: i64,
        /// Referenced symbol, when the operand is an address.
        symbol: Option<String>,
    },
    /// A variable reference by name (`%local` or `@global`).
    Var(String),
    /// A list of operands (call argument lists).
    List(Vec<Operand>),
}

impl Operand {
    /// A plain integer immediate.
    pub fn imm(value: i64) -> Self {
        Self::Imm {
            value,
            symbol: None,
        }
    }

    /// A symbol-reference immediate.
    pub fn sym(name: impl Into<String>) -> Self {
        Self::Imm {
            value: 0,
            symbol: Some(name.into()),
        }
    }

    /// A variable reference.
    pub fn var(name: impl Into<String>) -> Self {
        Self::Var(name.into())
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Imm {
                value,
                symbol: None,
            } => write!(f, "{}", value),
            Self::Imm {
                value,
                symbol: Some(s),
            } => {
                if *value == 0 {
                    write!(f, "{}", s)
                } else {
                    write!(f, "{}+{}", s, value)
                }
            }
            Self::Var(name) => write!(f, "{}", name),
            Self::List(ops) => {
                write!(f, "(")?;
                for (i, op) in ops.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", op)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// The IR opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Op {
    Add,
    Sub,
    Mul,
    Sdiv,
    Udiv,
    Smod,
    Umod,
    And,
    Or,
    Xor,
    Bnot,
    Neg,
    Shl,
    Shra,
    Shrl,
    Eq,
    Neq,
    Lt,
    Ltu,
    Lteq,
    Lteu,
    Gt,
    Gtu,
    Gteq,
    Gteu,
    Imm,
    Copy,
    Read,
    Write,
    Varptr,
    Lvarptr,
    Recmbr,
    Ptrdiff,
    Ptridx,
    Sgnext,
    Zrext,
    Trunc,
    Reccopy,
    Call,
    Calli,
    Ret,
    Retv,
    Jmp,
    Jz,
    Jnz,
    Vastart,
    Vaarg,
    Vaend,
    Vacopy,
    Nop,
    /// Verbatim inline-assembly pass-through; the template text rides in the
    /// symbol field of the first operand.
    Asm,
}

impl Op {
    /// The textual mnemonic.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Sdiv => "sdiv",
            Self::Udiv => "udiv",
            Self::Smod => "smod",
            Self::Umod => "umod",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
            Self::Bnot => "bnot",
            Self::Neg => "neg",
            Self::Shl => "shl",
            Self::Shra => "shra",
            Self::Shrl => "shrl",
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Lt => "lt",
            Self::Ltu => "ltu",
            Self::Lteq => "lteq",
            Self::Lteu => "lteu",
            Self::Gt => "gt",
            Self::Gtu => "gtu",
            Self::Gteq => "gteq",
            Self::Gteu => "gteu",
            Self::Imm => "imm",
            Self::Copy => "copy",
            Self::Read => "read",
            Self::Write => "write",
            Self::Varptr => "varptr",
            Self::Lvarptr => "lvarptr",
            Self::Recmbr => "recmbr",
            Self::Ptrdiff => "ptrdiff",
            Self::Ptridx => "ptridx",
            Self::Sgnext => "sgnext",
            Self::Zrext => "zrext",
            Self::Trunc => "trunc",
            Self::Reccopy => "reccopy",
            Self::Call => "call",
            Self::Calli => "calli",
            Self::Ret => "ret",
            Self::Retv => "retv",
            Self::Jmp => "jmp",
            Self::Jz => "jz",
            Self::Jnz => "jnz",
            Self::Vastart => "vastart",
            Self::Vaarg => "vaarg",
            Self::Vaend => "vaend",
            Self::Vacopy => "vacopy",
            Self::Nop => "nop",
            Self::Asm => "asm",
        }
    }

    /// Is this a branch (conditional or not)?
    pub fn is_branch(self) -> bool {
        matches!(self, Self::Jmp | Self::Jz | Self::Jnz)
    }

    /// Does this opcode require a width tag?
    pub fn has_width(self) -> bool {
        !matches!(
            self,
            Self::Jmp
                | Self::Jz
                | Self::Jnz
                | Self::Ret
                | Self::Call
                | Self::Calli
                | Self::Reccopy
                | Self::Vastart
                | Self::Vaend
                | Self::Vacopy
                | Self::Nop
                | Self::Recmbr
                | Self::Asm
        )
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// One IR instruction.
#[derive(Clone, Debug, PartialEq)]
pub struct Instr {
    /// The opcode.
    pub op: Op,
    /// Width tag, for width-parametric opcodes.
    pub width: Option<Width>,
    /// Destination operand.
    pub dest: Option<Operand>,
    /// First value operand.
    pub op1: Option<Operand>,
    /// Second value operand.
    pub op2: Option<Operand>,
    /// Type-expression operand (`vaarg`, `recmbr`, casts).
    pub texpr: Option<TypeExpr>,
}

impl Instr {
    /// A width-tagged three-address instruction.
    pub fn new(op: Op, width: Width, dest: Operand, op1: Operand, op2: Operand) -> Self {
        Self {
            op,
            width: Some(width),
            dest: Some(dest),
            op1: Some(op1),
            op2: Some(op2),
            texpr: None,
        }
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.op)?;
        if let Some(w) = self.width {
            write!(f, ".{}", w)?;
        }
        let mut sep = " ";
        for op in [&self.dest, &self.op1, &self.op2].into_iter().flatten() {
            write!(f, "{}{}", sep, op)?;
            sep = ", ";
        }
        if let Some(te) = &self.texpr {
            write!(f, "{}{}", sep, te)?;
        }
        write!(f, ";")
    }
}

/// One entry of a labelled block.
#[derive(Clone, Debug, Default)]
pub struct BlockEntry {
    /// Optional label defined at this entry.
    pub label: Option<String>,
    /// Optional instruction.
    pub instr: Option<Instr>,
}

/// A flat labelled block.
#[derive(Clone, Debug, Default)]
pub struct LabeledBlock {
    /// Entries in order.
    pub entries: Vec<BlockEntry>,
}

impl LabeledBlock {
    /// Append an instruction without a label.
    pub fn push(&mut self, instr: Instr) {
        self.entries.push(BlockEntry {
            label: None,
            instr: Some(instr),
        });
    }

    /// Append a label without an instruction.
    pub fn push_label(&mut self, label: impl Into<String>) {
        self.entries.push(BlockEntry {
            label: Some(label.into()),
            instr: None,
        });
    }

    /// Iterate over the instructions, ignoring labels.
    pub fn instrs(&self) -> impl Iterator<Item = &Instr> {
        self.entries.iter().filter_map(|e| e.instr.as_ref())
    }

    /// Is the label defined in this block?
    pub fn defines_label(&self, label: &str) -> bool {
        self.entries.iter().any(|e| e.label.as_deref() == Some(label))
    }
}

/// Linkage of a top-level declaration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Linkage {
    /// Defined here and visible to the linker.
    Global,
    /// Defined here with internal linkage.
    Internal,
    /// Declared here, defined elsewhere.
    Extern,
}

/// One entry of a variable's initialiser data block.
#[derive(Clone, Debug, PartialEq)]
pub enum DataEntry {
    /// An integer of the given width, possibly a symbol address.
    Value {
        /// Entry width.
        width: Width,
        /// The value (or offset from `symbol`).
        value: i64,
        /// Referenced symbol, for address entries.
        symbol: Option<String>,
    },
    /// `count` bytes of zero space.
    Space(u64),
}

/// A variable initialiser.
#[derive(Clone, Debug, Default)]
pub struct DataBlock {
    /// Entries in layout order.
    pub entries: Vec<DataEntry>,
}

/// An IR record declaration: the storage units of a struct or union.
#[derive(Clone, Debug)]
pub struct Record {
    /// The record's stable name.
    pub name: String,
    /// True for a union (units overlap at offset zero).
    pub union: bool,
    /// Storage units: name and type.
    pub fields: Vec<(String, TypeExpr)>,
}

impl Record {
    /// Size of the record in bytes.
    pub fn byte_size(&self, module: &Module) -> u64 {
        let sizes = self.fields.iter().map(|(_, t)| t.byte_size(module));
        if self.union {
            sizes.max().unwrap_or(0)
        } else {
            sizes.sum()
        }
    }

    /// Byte offset of the named field.
    pub fn field_offset(&self, module: &Module, field: &str) -> Option<u64> {
        if self.union {
            return self.fields.iter().any(|(n, _)| n == field).then_some(0);
        }
        let mut off = 0;
        for (n, t) in &self.fields {
            if n == field {
                return Some(off);
            }
            off += t.byte_size(module);
        }
        None
    }
}

/// An IR variable declaration.
#[derive(Clone, Debug)]
pub struct Var {
    /// The variable's name (`@name`).
    pub name: String,
    /// Linkage.
    pub linkage: Linkage,
    /// The variable's type.
    pub ty: TypeExpr,
    /// Initialiser; `None` for extern declarations.
    pub data: Option<DataBlock>,
}

/// One procedure argument.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcArg {
    /// The argument's IR identifier (`%0`, `%1`, ...).
    pub name: String,
    /// The argument's type.
    pub ty: TypeExpr,
}

/// One declared local variable of a procedure.
#[derive(Clone, Debug)]
pub struct LocalVar {
    /// The local's IR identifier (`%name`).
    pub name: String,
    /// The local's type.
    pub ty: TypeExpr,
}

/// An IR procedure.
#[derive(Clone, Debug)]
pub struct Proc {
    /// The procedure's name (`@name`).
    pub name: String,
    /// Linkage.
    pub linkage: Linkage,
    /// Arguments in order.
    pub args: Vec<ProcArg>,
    /// Return type; `None` for `void`.
    pub ret: Option<TypeExpr>,
    /// Does the procedure take variable arguments?
    pub variadic: bool,
    /// True when only the signature is known (extern declaration).
    pub decl_only: bool,
    /// Declared local variables.
    pub lvars: Vec<LocalVar>,
    /// The body.
    pub body: LabeledBlock,
}

impl Proc {
    /// Find a local variable by name.
    pub fn lvar(&self, name: &str) -> Option<&LocalVar> {
        self.lvars.iter().find(|v| v.name == name)
    }

    /// Find an argument by name.
    pub fn arg(&self, name: &str) -> Option<&ProcArg> {
        self.args.iter().find(|a| a.name == name)
    }
}

/// A top-level IR declaration.
#[derive(Clone, Debug)]
pub enum Decl {
    /// A record declaration.
    Record(Record),
    /// A variable declaration.
    Var(Var),
    /// A procedure.
    Proc(Proc),
}

/// A whole IR module.
#[derive(Clone, Debug, Default)]
pub struct Module {
    /// Declarations in order.
    pub decls: Vec<Decl>,
}

impl Module {
    /// Create an empty module.
    pub fn new() -> Self {
        Self::default()
    }

    /// Find a procedure by name.
    pub fn find_proc(&self, name: &str) -> Option<&Proc> {
        self.decls.iter().find_map(|d| match d {
            Decl::Proc(p) if p.name == name => Some(p),
            _ => None,
        })
    }

    /// Find a variable by name.
    pub fn find_var(&self, name: &str) -> Option<&Var> {
        self.decls.iter().find_map(|d| match d {
            Decl::Var(v) if v.name == name => Some(v),
            _ => None,
        })
    }

    /// Find a record by name.
    pub fn find_record(&self, name: &str) -> Option<&Record> {
        self.decls.iter().find_map(|d| match d {
            Decl::Record(r) if r.name == name => Some(r),
            _ => None,
        })
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, decl) in self.decls.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            match decl {
                Decl::Record(r) => {
                    writeln!(f, "record {} begin", r.name)?;
                    for (name, ty) in &r.fields {
                        writeln!(f, "\t{} : {};", name, ty)?;
                    }
                    writeln!(f, "end;")?;
                }
                Decl::Var(v) => {
                    write!(f, "var {} : {}", v.name, v.ty)?;
                    match &v.data {
                        None => writeln!(f, ";")?,
                        Some(data) => {
                            writeln!(f, " begin")?;
                            for e in &data.entries {
                                match e {
                                    DataEntry::Value {
                                        width,
                                        value,
                                        symbol,
                                    } => {
                                        let op = Operand::Imm {
                                            value: *value,
                                            symbol: symbol.clone(),
                                        };
                                        writeln!(f, "\tint.{} {};", width, op)?;
                                    }
                                    DataEntry::Space(n) => writeln!(f, "\tspace {};", n)?,
                                }
                            }
                            writeln!(f, "end;")?;
                        }
                    }
                }
                Decl::Proc(p) => {
                    write!(f, "proc {}(", p.name)?;
                    for (i, a) in p.args.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{} : {}", a.name, a.ty)?;
                    }
                    if p.variadic {
                        if !p.args.is_empty() {
                            write!(f, ", ")?;
                        }
                        write!(f, "...")?;
                    }
                    write!(f, ")")?;
                    if let Some(ret) = &p.ret {
                        write!(f, " : {}", ret)?;
                    }
                    if p.decl_only {
                        writeln!(f, ";")?;
                        continue;
                    }
                    writeln!(f)?;
                    if !p.lvars.is_empty() {
                        writeln!(f, "lvar")?;
                        for v in &p.lvars {
                            writeln!(f, "\t{} : {};", v.name, v.ty)?;
                        }
                    }
                    writeln!(f, "begin")?;
                    for e in &p.body.entries {
                        if let Some(l) = &e.label {
                            writeln!(f, "{}:", l)?;
                        }
                        if let Some(i) = &e.instr {
                            writeln!(f, "\t{}", i)?;
                        }
                    }
                    writeln!(f, "end;")?;
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
    fn instr_display() {
        let i = Instr::new(
            Op::Add,
            Width::W16,
            Operand::var("%1"),
            Operand::var("%a"),
            Operand::imm(1),
        );
        assert_eq!(i.to_string(), "add.16 %1, %a, 1;");

        let j = Instr {
            op: Op::Jmp,
            width: None,
            dest: Some(Operand::var("%l_top")),
            op1: None,
            op2: None,
            texpr: None,
        };
        assert_eq!(j.to_string(), "jmp %l_top;");

        let v = Instr {
            op: Op::Vaarg,
            width: Some(Width::W16),
            dest: Some(Operand::var("%2")),
            op1: Some(Operand::var("%ap")),
            op2: None,
            texpr: Some(TypeExpr::Int(Width::W16)),
        };
        assert_eq!(v.to_string(), "vaarg.16 %2, %ap, int.16;");
    }

    #[test]
    fn operand_display() {
        assert_eq!(Operand::imm(-3).to_string(), "-3");
        assert_eq!(Operand::sym("@g").to_string(), "@g");
        assert_eq!(
            Operand::Imm {
                value: 4,
                symbol: Some("@g".to_string())
            }
            .to_string(),
            "@g+4"
        );
        assert_eq!(
            Operand::List(vec![Operand::var("%a"), Operand::imm(2)]).to_string(),
            "(%a, 2)"
        );
    }

    #[test]
    fn type_expr_display_and_size() {
        let module = Module::new();
        assert_eq!(TypeExpr::Int(Width::W32).to_string(), "int.32");
        assert_eq!(TypeExpr::ptr16().to_string(), "ptr.16");
        let arr = TypeExpr::Array(3, Box::new(TypeExpr::Int(Width::W16)));
        assert_eq!(arr.to_string(), "[3] int.16");
        assert_eq!(arr.byte_size(&module), 6);
    }

    #[test]
    fn record_sizes_and_offsets() {
        let mut module = Module::new();
        module.decls.push(Decl::Record(Record {
            name: "struct.s".to_string(),
            union: false,
            fields: vec![
                ("0".to_string(), TypeExpr::Int(Width::W8)),
                ("1".to_string(), TypeExpr::Int(Width::W32)),
            ],
        }));
        let r = module.find_record("struct.s").unwrap();
        assert_eq!(r.byte_size(&module), 5);
        assert_eq!(r.field_offset(&module, "1"), Some(1));
        assert_eq!(
            TypeExpr::Ident("struct.s".to_string()).byte_size(&module),
            5
        );
    }

    #[test]
    fn module_display() {
        let mut module = Module::new();
        let mut body = LabeledBlock::default();
        body.push(Instr {
            op: Op::Retv,
            width: Some(Width::W16),
            dest: None,
            op1: Some(Operand::imm(1)),
            op2: None,
            texpr: None,
        });
        module.decls.push(Decl::Proc(Proc {
            name: "@f".to_string(),
            linkage: Linkage::Global,
            args: vec![],
            ret: Some(TypeExpr::Int(Width::W16)),
            variadic: false,
            decl_only: false,
            lvars: vec![],
            body,
        }));
        let text = module.to_string();
        assert!(text.contains("proc @f() : int.16"), "{}", text);
        assert!(text.contains("retv.16 1;"), "{}", text);
        assert!(text.ends_with("end;\n"), "{}", text);
    }

    #[test]
    fn labeled_block_queries() {
        let mut b = LabeledBlock::default();
        b.push_label("%top");
        b.push(Instr {
            op: Op::Nop,
            width: None,
            dest: None,
            op1: None,
            op2: None,
            texpr: None,
        });
        assert!(b.defines_label("%top"));
        assert!(!b.defines_label("%end"));
        assert_eq!(b.instrs().count(), 1);
    }
}
