//! The semantic analyser and IR generator.
//!
//! `generate` walks a parsed translation unit and produces a typed IR
//! module together with the interned record table. Types are computed by
//! folding declaration specifiers with the declarator chain, names are
//! resolved through the scope stack, and every expression is lowered into a
//! short instruction sequence leaving its value in a freshly numbered IR
//! local.
//!
//! Generation stops at the first error; every diagnostic carries the source
//! position of the token that triggered it.

mod expr;
mod stmt;

use crate::error::{CodegenError, CodegenResult};
use crate::ir;
use crate::records::{RecKind, RecordRef, Records};
use crate::scope::{MemberKind, ScopeMember, ScopeStack};
use crate::types::{CGType, FuncType, IntKind, Quals, Signedness};
use log::debug;
use std::collections::HashMap;
use zcc_front::ast;
use zcc_front::srcpos::Pos;
use zcc_front::token::{TokenId, Tokens};

/// The value of a lowered expression: an IR operand plus its C type.
#[derive(Clone, Debug)]
pub(crate) struct ExprValue {
    /// The operand holding the value.
    pub op: ir::Operand,
    /// The value's type.
    pub ty: CGType,
}

/// Per-function lowering state.
struct FnState {
    name: String,
    body: ir::LabeledBlock,
    lvars: Vec<ir::LocalVar>,
    next_tmp: u32,
    next_label: u32,
    ret_ty: CGType,
    /// C names of the declared parameters, in argument order.
    param_names: Vec<String>,
    break_labels: Vec<String>,
    continue_labels: Vec<String>,
    goto_labels: HashMap<String, String>,
}

/// The code generator for one translation unit.
pub struct CodeGen<'a> {
    toks: &'a Tokens,
    pub(crate) records: Records,
    pub(crate) scopes: ScopeStack,
    pub(crate) module: ir::Module,
    cur: Option<FnState>,
    /// Stack of switch statements being lowered.
    switches: Vec<stmt::SwitchPlan>,
    str_count: u32,
}

/// Generate IR for a parsed module.
pub fn generate(
    toks: &Tokens,
    module: &ast::Module,
) -> CodegenResult<(ir::Module, Records)> {
    let mut cgen = CodeGen {
        toks,
        records: Records::new(),
        scopes: ScopeStack::new(),
        module: ir::Module::new(),
        cur: None,
        switches: Vec::new(),
        str_count: 0,
    };
    for decl in &module.decls {
        cgen.gen_global(decl)?;
    }
    Ok((cgen.module, cgen.records))
}

impl<'a> CodeGen<'a> {
    // ------------------------------------------------------------------
    // Small helpers

    pub(crate) fn text(&self, id: TokenId) -> &str {
        &self.toks.get(id).text
    }

    pub(crate) fn pos(&self, id: TokenId) -> Pos {
        self.toks.get(id).pos()
    }

    /// Token text with line continuations removed.
    fn clean_text(&self, id: TokenId) -> String {
        let text = self.text(id);
        if !text.contains('\\') {
            return text.to_string();
        }
        let mut out = String::with_capacity(text.len());
        let mut it = text.chars().peekable();
        while let Some(c) = it.next() {
            if c == '\\' && matches!(it.peek(), Some('\n') | Some('\r')) {
                if it.next() == Some('\r') {
                    it.next();
                }
                continue;
            }
            out.push(c);
        }
        out
    }

    fn fstate(&mut self) -> &mut FnState {
        self.cur.as_mut().expect("not inside a function")
    }

    pub(crate) fn emit(&mut self, instr: ir::Instr) {
        self.fstate().body.push(instr);
    }

    pub(crate) fn emit_label(&mut self, label: &str) {
        let label = label.to_string();
        self.fstate().body.push_label(label);
    }

    /// A fresh IR label with a naming hint.
    pub(crate) fn new_label(&mut self, hint: &str) -> String {
        let f = self.fstate();
        f.next_label += 1;
        format!("%{}{}", hint, f.next_label)
    }

    /// A fresh numbered IR local of the given type.
    pub(crate) fn new_tmp(&mut self, ty: &CGType, pos: Pos) -> CodegenResult<ir::Operand> {
        let texpr = self.type_expr(ty, pos)?;
        let f = self.fstate();
        let name = format!("%{}", f.next_tmp);
        f.next_tmp += 1;
        f.lvars.push(ir::LocalVar {
            name: name.clone(),
            ty: texpr,
        });
        Ok(ir::Operand::var(name))
    }

    /// The IR width of a scalar type.
    pub(crate) fn width_of(&self, ty: &CGType, pos: Pos) -> CodegenResult<ir::Width> {
        ty.width_bits(&self.records)
            .and_then(ir::Width::from_bits)
            .ok_or_else(|| {
                CodegenError::InvalidInput(pos, format!("type '{}' has no scalar width", ty))
            })
    }

    /// The IR type expression for a type.
    pub(crate) fn type_expr(&self, ty: &CGType, pos: Pos) -> CodegenResult<ir::TypeExpr> {
        match ty {
            CGType::Void => Err(CodegenError::InvalidInput(
                pos,
                "void is not an object type".to_string(),
            )),
            CGType::Basic { kind, .. } => Ok(ir::TypeExpr::Int(
                ir::Width::from_bits(kind.size() as u32 * 8).expect("integer width"),
            )),
            CGType::Pointer { .. } => Ok(ir::TypeExpr::ptr16()),
            CGType::Array { size, elem } => {
                let n = size.ok_or_else(|| {
                    CodegenError::InvalidInput(pos, "array size is not known".to_string())
                })?;
                Ok(ir::TypeExpr::Array(n, Box::new(self.type_expr(elem, pos)?)))
            }
            CGType::Function(ft) => {
                let mut args = Vec::with_capacity(ft.args.len());
                for a in &ft.args {
                    args.push(self.type_expr(a, pos)?);
                }
                let ret = match &ft.ret {
                    CGType::Void => None,
                    other => Some(self.type_expr(other, pos)?),
                };
                Ok(ir::TypeExpr::Func(Box::new(ir::FuncTypeExpr {
                    args,
                    ret,
                    variadic: ft.variadic,
                })))
            }
            CGType::Record(r) => {
                let def = &self.records.recs[*r];
                if !def.complete {
                    return Err(CodegenError::InvalidInput(
                        pos,
                        format!("'{}' is incomplete", def.irident),
                    ));
                }
                Ok(ir::TypeExpr::Ident(def.irident.clone()))
            }
            CGType::Enum(_) => Ok(ir::TypeExpr::Int(ir::Width::W16)),
            CGType::VaList => Ok(ir::TypeExpr::VaList),
        }
    }

    /// Size of a type, with an error for incomplete types.
    pub(crate) fn sizeof(&self, ty: &CGType, pos: Pos) -> CodegenResult<u64> {
        ty.size(&self.records).ok_or_else(|| {
            CodegenError::InvalidInput(pos, format!("type '{}' has no size", ty))
        })
    }

    // ------------------------------------------------------------------
    // Literal parsing

    /// Parse an integer literal token into its value and type.
    pub(crate) fn parse_int_lit(&self, id: TokenId) -> CodegenResult<(i64, CGType)> {
        let pos = self.pos(id);
        let text = self.clean_text(id);
        let lower = text.to_ascii_lowercase();
        let mut digits = lower.as_str();
        let mut unsigned = false;
        let mut lcount = 0u32;
        loop {
            if let Some(rest) = digits.strip_suffix('u') {
                unsigned = true;
                digits = rest;
            } else if let Some(rest) = digits.strip_suffix("ll") {
                lcount = 2;
                digits = rest;
            } else if let Some(rest) = digits.strip_suffix('l') {
                lcount += 1;
                digits = rest;
            } else {
                break;
            }
        }
        let (radix, digits) = if let Some(rest) = digits.strip_prefix("0x") {
            (16, rest)
        } else if digits.len() > 1 && digits.starts_with('0') {
            (8, &digits[1..])
        } else {
            (10, digits)
        };
        let value = u64::from_str_radix(digits, radix).map_err(|_| {
            CodegenError::InvalidInput(pos, format!("invalid integer literal '{}'", text))
        })?;
        let sign = if unsigned {
            Signedness::Unsigned
        } else {
            Signedness::Signed
        };
        // The literal's kind: the suffix sets the floor, the value may widen
        // it.
        let mut kind = match lcount {
            2 => IntKind::LongLong,
            1 => IntKind::Long,
            _ => IntKind::Int,
        };
        loop {
            let bits = kind.size() as u32 * 8;
            let fits = if unsigned {
                bits >= 64 || value < (1u64 << bits)
            } else {
                bits >= 64 || value < (1u64 << (bits - 1))
            };
            if fits {
                break;
            }
            kind = match kind {
                IntKind::Int => IntKind::Long,
                IntKind::Long => IntKind::LongLong,
                _ => break,
            };
        }
        Ok((value as i64, CGType::Basic { kind, sign }))
    }

    /// Decode the escape sequences of a quoted literal body.
    fn unescape(&self, body: &str, pos: Pos) -> CodegenResult<Vec<u8>> {
        let mut out = Vec::with_capacity(body.len());
        let b = body.as_bytes();
        let mut i = 0;
        while i < b.len() {
            if b[i] != b'\\' {
                out.push(b[i]);
                i += 1;
                continue;
            }
            i += 1;
            let c = *b.get(i).ok_or_else(|| {
                CodegenError::InvalidInput(pos, "truncated escape sequence".to_string())
            })?;
            i += 1;
            let decoded = match c {
                b'n' => b'\n',
                b't' => b'\t',
                b'r' => b'\r',
                b'a' => 0x07,
                b'b' => 0x08,
                b'f' => 0x0c,
                b'v' => 0x0b,
                b'\\' => b'\\',
                b'\'' => b'\'',
                b'"' => b'"',
                b'?' => b'?',
                b'x' => {
                    let mut v = 0u32;
                    let mut any = false;
                    while i < b.len() && (b[i] as char).is_ascii_hexdigit() {
                        v = v * 16 + (b[i] as char).to_digit(16).expect("hex digit");
                        i += 1;
                        any = true;
                    }
                    if !any {
                        return Err(CodegenError::InvalidInput(
                            pos,
                            "\\x with no hex digits".to_string(),
                        ));
                    }
                    (v & 0xff) as u8
                }
                b'0'..=b'7' => {
                    let mut v = (c - b'0') as u32;
                    let mut n = 1;
                    while n < 3 && i < b.len() && (b'0'..=b'7').contains(&b[i]) {
                        v = v * 8 + (b[i] - b'0') as u32;
                        i += 1;
                        n += 1;
                    }
                    (v & 0xff) as u8
                }
                other => {
                    return Err(CodegenError::InvalidInput(
                        pos,
                        format!("unknown escape sequence '\\{}'", other as char),
                    ));
                }
            };
            out.push(decoded);
        }
        Ok(out)
    }

    /// Parse a character constant into its value.
    pub(crate) fn parse_char_lit(&self, id: TokenId) -> CodegenResult<i64> {
        let pos = self.pos(id);
        let text = self.clean_text(id);
        let body = text
            .strip_prefix('\'')
            .and_then(|t| t.strip_suffix('\''))
            .ok_or_else(|| {
                CodegenError::InvalidInput(pos, format!("malformed character constant {}", text))
            })?;
        let bytes = self.unescape(body, pos)?;
        match bytes.as_slice() {
            [b] => Ok(*b as i64),
            _ => Err(CodegenError::InvalidInput(
                pos,
                format!("character constant {} is not a single byte", text),
            )),
        }
    }

    /// Decode a string literal expression into its bytes, NUL excluded.
    pub(crate) fn string_bytes(&self, s: &ast::StrLitExpr) -> CodegenResult<Vec<u8>> {
        let mut out = Vec::new();
        for &lit in &s.lits {
            let pos = self.pos(lit);
            let text = self.clean_text(lit);
            let body = text
                .trim_start_matches('L')
                .strip_prefix('"')
                .and_then(|t| t.strip_suffix('"'))
                .ok_or_else(|| {
                    CodegenError::InvalidInput(pos, format!("malformed string literal {}", text))
                })?;
            out.extend(self.unescape(body, pos)?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Constant expressions

    /// Evaluate an integer constant expression.
    pub(crate) fn const_eval(&mut self, e: &ast::Expr) -> CodegenResult<i64> {
        use ast::Expr as E;
        match e {
            E::IntLit(id) => Ok(self.parse_int_lit(*id)?.0),
            E::CharLit(id) => self.parse_char_lit(*id),
            E::Paren { inner, .. } => self.const_eval(inner),
            E::Ident(id) => {
                let name = self.text(*id).to_string();
                match self.scopes.lookup(&name) {
                    Some(ScopeMember {
                        kind: MemberKind::EnumElem(_, value),
                        ..
                    }) => Ok(*value),
                    Some(_) => Err(CodegenError::InvalidInput(
                        self.pos(*id),
                        format!("'{}' is not a constant", name),
                    )),
                    None => Err(CodegenError::NotFound(self.pos(*id), name)),
                }
            }
            E::USign { negative, arg, .. } => {
                let v = self.const_eval(arg)?;
                Ok(if *negative { v.wrapping_neg() } else { v })
            }
            E::BitNot { arg, .. } => Ok(!self.const_eval(arg)?),
            E::LogNot { arg, .. } => Ok((self.const_eval(arg)? == 0) as i64),
            E::Binop(b) => {
                let l = self.const_eval(&b.lhs)?;
                let r = self.const_eval(&b.rhs)?;
                let pos = self.pos(b.op_tok);
                use ast::BinOp::*;
                Ok(match b.op {
                    Add => l.wrapping_add(r),
                    Sub => l.wrapping_sub(r),
                    Mul => l.wrapping_mul(r),
                    Div => {
                        if r == 0 {
                            return Err(CodegenError::InvalidInput(
                                pos,
                                "division by zero in constant expression".to_string(),
                            ));
                        }
                        l.wrapping_div(r)
                    }
                    Mod => {
                        if r == 0 {
                            return Err(CodegenError::InvalidInput(
                                pos,
                                "division by zero in constant expression".to_string(),
                            ));
                        }
                        l.wrapping_rem(r)
                    }
                    Shl => l.wrapping_shl(r as u32),
                    Shr => l.wrapping_shr(r as u32),
                    BAnd => l & r,
                    BOr => l | r,
                    BXor => l ^ r,
                    LAnd => ((l != 0) && (r != 0)) as i64,
                    LOr => ((l != 0) || (r != 0)) as i64,
                    Lt => (l < r) as i64,
                    LtEq => (l <= r) as i64,
                    Gt => (l > r) as i64,
                    GtEq => (l >= r) as i64,
                    Eq => (l == r) as i64,
                    NotEq => (l != r) as i64,
                    _ => {
                        return Err(CodegenError::InvalidInput(
                            pos,
                            "assignment in constant expression".to_string(),
                        ));
                    }
                })
            }
            E::Ternary(t) => {
                let c = self.const_eval(&t.cond)?;
                if c != 0 {
                    self.const_eval(&t.then)
                } else {
                    self.const_eval(&t.els)
                }
            }
            E::Sizeof(s) => {
                let (ty, pos) = match &s.arg {
                    ast::SizeofArg::Type { tname, lparen, .. } => {
                        (self.eval_type_name(tname)?, self.pos(*lparen))
                    }
                    ast::SizeofArg::Expr(inner) => {
                        let ty = self.type_of_expr(inner)?;
                        (ty, self.pos(s.sizeof_tok))
                    }
                };
                Ok(self.sizeof(&ty, pos)? as i64)
            }
            E::Cast(c) => {
                let ty = self.eval_type_name(&c.tname)?;
                let v = self.const_eval(&c.arg)?;
                let pos = self.pos(c.lparen);
                let bits = ty
                    .width_bits(&self.records)
                    .ok_or_else(|| {
                        CodegenError::InvalidInput(pos, "cast to non-scalar type".to_string())
                    })?;
                if bits >= 64 {
                    return Ok(v);
                }
                let mask = (1i64 << bits) - 1;
                let t = v & mask;
                Ok(if ty.signedness() == Signedness::Signed && t & (1 << (bits - 1)) != 0 {
                    t | !mask
                } else {
                    t
                })
            }
            other => Err(CodegenError::InvalidInput(
                expr_pos(self.toks, other),
                "expected a constant expression".to_string(),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Declaration specifiers and declarators

    /// The type denoted by a type name.
    pub(crate) fn eval_type_name(&mut self, tname: &ast::TypeName) -> CodegenResult<CGType> {
        let info = self.eval_specs(&tname.specs)?;
        let (_, ty) = self.fold_declarator(&info.ty, &tname.decl)?;
        Ok(ty)
    }

    /// The result of folding declaration specifiers.
    pub(crate) fn eval_specs(&mut self, specs: &ast::DeclSpecs) -> CodegenResult<SpecInfo> {
        let mut storage = None;
        let mut base: Option<CGType> = None;
        let mut quals = Quals::default();
        // Counters for the basic keyword soup.
        let mut signed = None::<Signedness>;
        let mut longs = 0;
        let mut short = false;
        let mut kind: Option<IntKind> = None;
        let mut void = false;
        let mut pos = Pos::start();

        for entry in &specs.entries {
            match entry {
                ast::SpecEntry::Storage(s) => {
                    pos = self.pos(s.tok);
                    if storage.is_some() {
                        return Err(CodegenError::InvalidInput(
                            pos,
                            "multiple storage class specifiers".to_string(),
                        ));
                    }
                    storage = Some(s.kind);
                }
                ast::SpecEntry::FunSpec(_) => {}
                ast::SpecEntry::Attr(_) => {}
                ast::SpecEntry::Qual(q) => {
                    match q.kind {
                        ast::Tqual::Const => quals.constant = true,
                        ast::Tqual::Volatile => quals.volatile = true,
                        ast::Tqual::Restrict => quals.restrict = true,
                        ast::Tqual::Atomic => quals.atomic = true,
                    }
                }
                ast::SpecEntry::Tspec(t) => match t {
                    ast::Tspec::Basic(b) => {
                        pos = self.pos(b.tok);
                        match b.kind {
                            ast::BasicKind::Void => void = true,
                            ast::BasicKind::Char => kind = Some(IntKind::Char),
                            ast::BasicKind::Short => short = true,
                            ast::BasicKind::Int => kind = kind.or(Some(IntKind::Int)),
                            ast::BasicKind::Long => longs += 1,
                            ast::BasicKind::Signed => signed = Some(Signedness::Signed),
                            ast::BasicKind::Unsigned => signed = Some(Signedness::Unsigned),
                            ast::BasicKind::Bool => kind = Some(IntKind::Logical),
                            ast::BasicKind::Float | ast::BasicKind::Double => {
                                return Err(CodegenError::Unsupported(
                                    pos,
                                    "floating point types".to_string(),
                                ));
                            }
                        }
                    }
                    ast::Tspec::Record(r) => {
                        base = Some(self.eval_record_spec(r)?);
                    }
                    ast::Tspec::Enum(e) => {
                        base = Some(self.eval_enum_spec(e)?);
                    }
                    ast::Tspec::TypedefName(id) => {
                        let name = self.text(*id).to_string();
                        match self.scopes.lookup(&name) {
                            Some(ScopeMember {
                                kind: MemberKind::Typedef,
                                cgtype: Some(ty),
                                ..
                            }) => base = Some(ty.clone()),
                            _ => {
                                return Err(CodegenError::NotFound(self.pos(*id), name));
                            }
                        }
                    }
                    ast::Tspec::Atomic(a) => {
                        base = Some(self.eval_type_name(&a.tname)?);
                    }
                    ast::Tspec::VaList(_) => {
                        base = Some(CGType::VaList);
                    }
                },
            }
        }

        let ty = if let Some(base) = base {
            base
        } else if void {
            CGType::Void
        } else if kind.is_some() || short || longs > 0 || signed.is_some() {
            let kind = if short {
                IntKind::Short
            } else if longs >= 2 {
                IntKind::LongLong
            } else if longs == 1 {
                IntKind::Long
            } else {
                kind.unwrap_or(IntKind::Int)
            };
            // Plain char is signed on this target.
            let sign = signed.unwrap_or(Signedness::Signed);
            CGType::Basic { kind, sign }
        } else {
            return Err(CodegenError::InvalidInput(
                pos,
                "declaration has no type specifier".to_string(),
            ));
        };

        Ok(SpecInfo { ty, storage, quals })
    }

    fn eval_record_spec(&mut self, spec: &ast::RecordSpec) -> CodegenResult<CGType> {
        let kind = match spec.kind {
            ast::RecordKind::Struct => RecKind::Struct,
            ast::RecordKind::Union => RecKind::Union,
        };
        let tag = spec.ident.map(|id| self.text(id).to_string());
        let pos = self.pos(spec.kind_tok);

        let rec = match (&tag, &spec.body) {
            (Some(name), None) => {
                // A use or forward declaration: find the tag anywhere, or
                // create an incomplete record in the current scope.
                match self.scopes.lookup_tag(name) {
                    Some(ScopeMember {
                        kind: MemberKind::RecordTag(r),
                        ..
                    }) => *r,
                    Some(_) => {
                        return Err(CodegenError::InvalidInput(
                            pos,
                            format!("'{}' is not a {} tag", name, kind_name(kind)),
                        ));
                    }
                    None => {
                        let r = self.records.declare_record(kind, Some(name));
                        self.insert_tag(name, MemberKind::RecordTag(r), pos)?;
                        r
                    }
                }
            }
            (tag, Some(_)) => {
                // A definition: reuse an incomplete tag of the current
                // scope, otherwise declare a fresh record.
                let existing = tag.as_ref().and_then(|name| {
                    match self.scopes.lookup_tag_local(name) {
                        Some(ScopeMember {
                            kind: MemberKind::RecordTag(r),
                            ..
                        }) => Some(*r),
                        _ => None,
                    }
                });
                match existing {
                    Some(r) if self.records.recs[r].complete => {
                        return Err(CodegenError::AlreadyExists(
                            pos,
                            tag.clone().unwrap_or_default(),
                        ));
                    }
                    Some(r) => r,
                    None => {
                        let r = self.records.declare_record(kind, tag.as_deref());
                        if let Some(name) = tag {
                            self.insert_tag(name, MemberKind::RecordTag(r), pos)?;
                        }
                        r
                    }
                }
            }
            (None, None) => unreachable!("parser requires a tag or a body"),
        };

        if let Some(body) = &spec.body {
            // Member declarations see a scope of their own.
            self.scopes.push();
            let result = self.fill_record_body(rec, body);
            self.scopes.pop();
            result?;
        }
        Ok(CGType::Record(rec))
    }

    fn fill_record_body(&mut self, rec: RecordRef, body: &ast::RecordBody) -> CodegenResult<()> {
        for member in &body.members {
            let info = self.eval_specs(&member.specs)?;
            for md in &member.decls {
                let (ident, ty) = self.fold_declarator(&info.ty, &md.decl)?;
                match &md.bitwidth {
                    Some((colon, width_expr)) => {
                        let width = self.const_eval(width_expr)?;
                        let pos = self.pos(*colon);
                        if !(0..=64).contains(&width) {
                            return Err(CodegenError::InvalidInput(
                                pos,
                                format!("bit-field width {} out of range", width),
                            ));
                        }
                        if !ty.is_integer() {
                            return Err(CodegenError::InvalidInput(
                                pos,
                                "bit-field must have integer type".to_string(),
                            ));
                        }
                        let name = ident.map(|id| self.text(id).to_string()).unwrap_or_default();
                        self.records.append_bitfield(rec, &name, ty, width as u32);
                    }
                    None => {
                        let id = match ident {
                            Some(id) => id,
                            // An unnamed member (typically a nested record
                            // definition) declares the type only.
                            None => continue,
                        };
                        let name = self.text(id).to_string();
                        let pos = self.pos(id);
                        if self.records.recs[rec].element(&name).is_some() {
                            return Err(CodegenError::AlreadyExists(pos, name));
                        }
                        self.sizeof(&ty, pos)?;
                        self.records.append_plain(rec, &name, ty);
                    }
                }
            }
        }
        self.records.recs[rec].complete = true;

        // Register the record's storage units as an IR declaration.
        let def = &self.records.recs[rec];
        let mut fields = Vec::with_capacity(def.units.len());
        let unit_tys: Vec<_> = def
            .units
            .iter()
            .map(|u| (u.irident.clone(), u.ty.clone()))
            .collect();
        let irident = def.irident.clone();
        let is_union = def.kind == RecKind::Union;
        for (name, ty) in unit_tys {
            fields.push((name, self.type_expr(&ty, Pos::start())?));
        }
        self.module.decls.push(ir::Decl::Record(ir::Record {
            name: irident,
            union: is_union,
            fields,
        }));
        Ok(())
    }

    fn eval_enum_spec(&mut self, spec: &ast::EnumSpec) -> CodegenResult<CGType> {
        let tag = spec.ident.map(|id| self.text(id).to_string());
        let pos = self.pos(spec.enum_tok);

        let en = match (&tag, &spec.body) {
            (Some(name), None) => match self.scopes.lookup_tag(name) {
                Some(ScopeMember {
                    kind: MemberKind::EnumTag(e),
                    ..
                }) => *e,
                Some(_) => {
                    return Err(CodegenError::InvalidInput(
                        pos,
                        format!("'{}' is not an enum tag", name),
                    ));
                }
                None => {
                    let e = self.records.declare_enum(Some(name));
                    self.insert_tag(name, MemberKind::EnumTag(e), pos)?;
                    e
                }
            },
            (tag, Some(_)) => {
                let existing = tag.as_ref().and_then(|name| {
                    match self.scopes.lookup_tag_local(name) {
                        Some(ScopeMember {
                            kind: MemberKind::EnumTag(e),
                            ..
                        }) => Some(*e),
                        _ => None,
                    }
                });
                match existing {
                    Some(e) if self.records.enums[e].complete => {
                        return Err(CodegenError::AlreadyExists(
                            pos,
                            tag.clone().unwrap_or_default(),
                        ));
                    }
                    Some(e) => e,
                    None => {
                        let e = self.records.declare_enum(tag.as_deref());
                        if let Some(name) = tag {
                            self.insert_tag(name, MemberKind::EnumTag(e), pos)?;
                        }
                        e
                    }
                }
            }
            (None, None) => unreachable!("parser requires a tag or a body"),
        };

        if let Some(body) = &spec.body {
            let mut next = 0i64;
            for elem in &body.elems {
                if let Some((_, value_expr)) = &elem.init {
                    next = self.const_eval(value_expr)?;
                }
                let name = self.text(elem.ident).to_string();
                let pos = self.pos(elem.ident);
                self.records.enums[en].elems.push((name.clone(), next));
                self.scopes
                    .insert(ScopeMember {
                        ident: name.clone(),
                        cgtype: Some(CGType::Enum(en)),
                        kind: MemberKind::EnumElem(en, next),
                    })
                    .map_err(|_| CodegenError::AlreadyExists(pos, name))?;
                next = next.wrapping_add(1);
            }
            self.records.enums[en].complete = true;
        }
        Ok(CGType::Enum(en))
    }

    fn insert_tag(&mut self, name: &str, kind: MemberKind, pos: Pos) -> CodegenResult<()> {
        self.scopes
            .insert(ScopeMember {
                ident: name.to_string(),
                cgtype: None,
                kind,
            })
            .map_err(|_| CodegenError::AlreadyExists(pos, name.to_string()))
    }

    /// Fold a declarator chain around a base type, yielding the declared
    /// identifier (if any) and the complete type.
    pub(crate) fn fold_declarator(
        &mut self,
        base: &CGType,
        d: &ast::Declarator,
    ) -> CodegenResult<(Option<TokenId>, CGType)> {
        match d {
            ast::Declarator::Ident(id) => Ok((Some(*id), base.clone())),
            ast::Declarator::Anon => Ok((None, base.clone())),
            ast::Declarator::Paren { inner, .. } => self.fold_declarator(base, inner),
            ast::Declarator::Ptr { quals, inner, .. } => {
                let mut q = Quals::default();
                for e in quals {
                    match e.kind {
                        ast::Tqual::Const => q.constant = true,
                        ast::Tqual::Volatile => q.volatile = true,
                        ast::Tqual::Restrict => q.restrict = true,
                        ast::Tqual::Atomic => q.atomic = true,
                    }
                }
                let ptr = CGType::Pointer {
                    pointee: Box::new(base.clone()),
                    quals: q,
                };
                self.fold_declarator(&ptr, inner)
            }
            ast::Declarator::Fun(f) => {
                let ft = self.fold_fun_params(base, f)?;
                self.fold_declarator(&CGType::Function(Box::new(ft)), &f.inner)
            }
            ast::Declarator::Arr(a) => {
                let size = match &a.size {
                    Some(e) => {
                        let n = self.const_eval(e)?;
                        if n < 0 {
                            return Err(CodegenError::InvalidInput(
                                self.pos(a.lbracket),
                                format!("negative array size {}", n),
                            ));
                        }
                        Some(n as u64)
                    }
                    None => None,
                };
                let arr = CGType::Array {
                    size,
                    elem: Box::new(base.clone()),
                };
                self.fold_declarator(&arr, &a.inner)
            }
        }
    }

    /// The function type of a function declarator applied to return type
    /// `ret`.
    fn fold_fun_params(
        &mut self,
        ret: &CGType,
        f: &ast::FunDeclarator,
    ) -> CodegenResult<FuncType> {
        let mut args = Vec::new();
        for p in &f.params {
            let info = self.eval_specs(&p.specs)?;
            let (_, ty) = self.fold_declarator(&info.ty, &p.decl)?;
            if ty == CGType::Void && f.params.len() == 1 {
                // `(void)`: no parameters.
                break;
            }
            // Parameters of array or function type adjust to pointers.
            args.push(ty.decayed());
        }
        Ok(FuncType {
            ret: ret.clone(),
            args,
            variadic: f.variadic.is_some(),
        })
    }

    /// The parameter name tokens of a function definition's declarator.
    fn param_idents(d: &ast::Declarator) -> Option<&ast::FunDeclarator> {
        match d {
            ast::Declarator::Fun(f) => Some(f),
            ast::Declarator::Ptr { inner, .. } | ast::Declarator::Paren { inner, .. } => {
                Self::param_idents(inner)
            }
            ast::Declarator::Arr(a) => Self::param_idents(&a.inner),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Global declarations

    fn gen_global(&mut self, decl: &ast::GlobalDecl) -> CodegenResult<()> {
        match decl {
            ast::GlobalDecl::Ordinary(d) => self.gen_ordinary_global(d),
            ast::GlobalDecl::ExternC(e) => {
                for d in &e.decls {
                    self.gen_global(d)?;
                }
                Ok(())
            }
            ast::GlobalDecl::MacroBased(m) => {
                // There is nothing to generate for a declaration macro; it
                // only matters to the style checker.
                debug!("skipping macro-based declaration '{}'", self.text(m.name));
                Ok(())
            }
        }
    }

    fn gen_ordinary_global(&mut self, d: &ast::Declaration) -> CodegenResult<()> {
        let info = self.eval_specs(&d.specs)?;

        if d.entries.is_empty() {
            // A bare specifier: a record/enum definition or forward
            // declaration; evaluating the specifiers did all the work.
            return Ok(());
        }

        if let Some(body) = &d.body {
            return self.gen_function(d, &info, body);
        }

        for entry in &d.entries {
            let (ident, ty) = self.fold_declarator(&info.ty, &entry.decl)?;
            let id = ident.ok_or_else(|| {
                CodegenError::InvalidInput(
                    expr_pos_fallback(self.toks, d),
                    "declarator has no identifier".to_string(),
                )
            })?;
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

            let irname = format!("@{}", name);
            match &ty {
                CGType::Function(ft) => {
                    if self.scopes.lookup_local(&name).is_none() {
                        self.scopes
                            .insert(ScopeMember {
                                ident: name.clone(),
                                cgtype: Some(ty.clone()),
                                kind: MemberKind::GlobalSym(irname.clone()),
                            })
                            .map_err(|_| CodegenError::AlreadyExists(pos, name.clone()))?;
                    }
                    if self.module.find_proc(&irname).is_none() {
                        let proc = self.make_proc_decl(&irname, ft, pos)?;
                        self.module.decls.push(ir::Decl::Proc(proc));
                    }
                }
                _ => {
                    self.gen_global_var(&name, &irname, &ty, info.storage, entry, pos)?;
                }
            }
        }
        Ok(())
    }

    /// A signature-only procedure declaration.
    fn make_proc_decl(&self, irname: &str, ft: &FuncType, pos: Pos) -> CodegenResult<ir::Proc> {
        let mut args = Vec::with_capacity(ft.args.len());
        for (i, a) in ft.args.iter().enumerate() {
            args.push(ir::ProcArg {
                name: format!("%{}", i),
                ty: self.type_expr(a, pos)?,
            });
        }
        let ret = match &ft.ret {
            CGType::Void => None,
            other => Some(self.type_expr(other, pos)?),
        };
        Ok(ir::Proc {
            name: irname.to_string(),
            linkage: ir::Linkage::Extern,
            args,
            ret,
            variadic: ft.variadic,
            decl_only: true,
            lvars: Vec::new(),
            body: ir::LabeledBlock::default(),
        })
    }

    fn gen_global_var(
        &mut self,
        name: &str,
        irname: &str,
        ty: &CGType,
        storage: Option<ast::Storage>,
        entry: &ast::InitDeclEntry,
        pos: Pos,
    ) -> CodegenResult<()> {
        // Declared extern without an initialiser: an import.
        let is_extern = storage == Some(ast::Storage::Extern) && entry.init.is_none();
        let linkage = if is_extern {
            ir::Linkage::Extern
        } else if storage == Some(ast::Storage::Static) {
            ir::Linkage::Internal
        } else {
            ir::Linkage::Global
        };

        if self.scopes.lookup_local(name).is_none() {
            self.scopes
                .insert(ScopeMember {
                    ident: name.to_string(),
                    cgtype: Some(ty.clone()),
                    kind: MemberKind::GlobalSym(irname.to_string()),
                })
                .map_err(|_| CodegenError::AlreadyExists(pos, name.to_string()))?;
        } else if !is_extern {
            return Err(CodegenError::AlreadyExists(pos, name.to_string()));
        }

        // A char array takes its size from a string initialiser.
        let mut ty = ty.clone();
        if let (
            CGType::Array { size: size @ None, .. },
            Some((_, ast::Init::Expr(e))),
        ) = (&mut ty, &entry.init)
        {
            if let ast::Expr::StrLit(s) = e.as_ref() {
                let n = self.string_bytes(s)?.len() as u64 + 1;
                *size = Some(n);
            }
        }
        if let (CGType::Array { size: size @ None, .. }, Some((_, ast::Init::Compound(c)))) =
            (&mut ty, &entry.init)
        {
            *size = Some(c.entries.len() as u64);
        }

        let data = if is_extern {
            None
        } else {
            Some(self.gen_data_block(&ty, entry.init.as_ref().map(|(_, i)| i), pos)?)
        };
        let texpr = self.type_expr(&ty, pos)?;
        self.module.decls.push(ir::Decl::Var(ir::Var {
            name: irname.to_string(),
            linkage,
            ty: texpr,
            data,
        }));
        Ok(())
    }

    /// The initialiser data block for a global of type `ty`.
    fn gen_data_block(
        &mut self,
        ty: &CGType,
        init: Option<&ast::Init>,
        pos: Pos,
    ) -> CodegenResult<ir::DataBlock> {
        let size = self.sizeof(ty, pos)?;
        let mut block = ir::DataBlock::default();
        match init {
            None => block.entries.push(ir::DataEntry::Space(size)),
            Some(ast::Init::Expr(e)) => match (ty, e.as_ref()) {
                (CGType::Array { .. }, ast::Expr::StrLit(s)) => {
                    let mut bytes = self.string_bytes(s)?;
                    bytes.push(0);
                    let pad = size.saturating_sub(bytes.len() as u64);
                    for b in bytes.iter().take(size as usize) {
                        block.entries.push(ir::DataEntry::Value {
                            width: ir::Width::W8,
                            value: *b as i64,
                            symbol: None,
                        });
                    }
                    if pad > 0 {
                        block.entries.push(ir::DataEntry::Space(pad));
                    }
                }
                _ => {
                    let width = self.width_of(ty, pos)?;
                    let value = self.const_eval(e)?;
                    block.entries.push(ir::DataEntry::Value {
                        width,
                        value,
                        symbol: None,
                    });
                }
            },
            Some(ast::Init::Compound(c)) => {
                self.gen_compound_data(ty, c, &mut block, pos)?;
            }
        }
        Ok(block)
    }

    fn gen_compound_data(
        &mut self,
        ty: &CGType,
        c: &ast::CompoundInit,
        block: &mut ir::DataBlock,
        pos: Pos,
    ) -> CodegenResult<()> {
        match ty {
            CGType::Array { size, elem } => {
                let n = size.ok_or_else(|| {
                    CodegenError::InvalidInput(pos, "array size is not known".to_string())
                })?;
                let esize = self.sizeof(elem, pos)?;
                let mut filled = 0;
                for entry in &c.entries {
                    if !entry.designators.is_empty() {
                        return Err(CodegenError::Unsupported(
                            self.pos(c.lbrace),
                            "designators in static initialisers".to_string(),
                        ));
                    }
                    match &entry.init {
                        ast::Init::Expr(e) => {
                            let width = self.width_of(elem, pos)?;
                            let value = self.const_eval(e)?;
                            block.entries.push(ir::DataEntry::Value {
                                width,
                                value,
                                symbol: None,
                            });
                        }
                        ast::Init::Compound(inner) => {
                            self.gen_compound_data(elem, inner, block, pos)?;
                        }
                    }
                    filled += 1;
                }
                if filled < n {
                    block
                        .entries
                        .push(ir::DataEntry::Space((n - filled) * esize));
                }
            }
            CGType::Record(rec) => {
                let units: Vec<_> = self.records.recs[*rec]
                    .units
                    .iter()
                    .map(|u| u.ty.clone())
                    .collect();
                let mut it = c.entries.iter();
                for uty in &units {
                    match it.next() {
                        Some(entry) if entry.designators.is_empty() => match &entry.init {
                            ast::Init::Expr(e) => {
                                let width = self.width_of(uty, pos)?;
                                let value = self.const_eval(e)?;
                                block.entries.push(ir::DataEntry::Value {
                                    width,
                                    value,
                                    symbol: None,
                                });
                            }
                            ast::Init::Compound(inner) => {
                                self.gen_compound_data(uty, inner, block, pos)?;
                            }
                        },
                        Some(_) => {
                            return Err(CodegenError::Unsupported(
                                self.pos(c.lbrace),
                                "designators in static initialisers".to_string(),
                            ));
                        }
                        None => {
                            block
                                .entries
                                .push(ir::DataEntry::Space(self.sizeof(uty, pos)?));
                        }
                    }
                }
            }
            _ => {
                // A scalar wrapped in braces.
                match c.entries.first().map(|e| &e.init) {
                    Some(ast::Init::Expr(e)) => {
                        let width = self.width_of(ty, pos)?;
                        let value = self.const_eval(e)?;
                        block.entries.push(ir::DataEntry::Value {
                            width,
                            value,
                            symbol: None,
                        });
                    }
                    _ => {
                        return Err(CodegenError::InvalidInput(
                            self.pos(c.lbrace),
                            "invalid initialiser".to_string(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Functions

    fn gen_function(
        &mut self,
        d: &ast::Declaration,
        info: &SpecInfo,
        body: &ast::Block,
    ) -> CodegenResult<()> {
        let entry = &d.entries[0];
        let (ident, ty) = self.fold_declarator(&info.ty, &entry.decl)?;
        let id = ident.ok_or_else(|| {
            CodegenError::InvalidInput(
                expr_pos_fallback(self.toks, d),
                "function definition has no name".to_string(),
            )
        })?;
        let name = self.text(id).to_string();
        let pos = self.pos(id);
        let ft = match &ty {
            CGType::Function(ft) => (**ft).clone(),
            _ => {
                return Err(CodegenError::InvalidInput(
                    pos,
                    format!("'{}' is not a function", name),
                ));
            }
        };
        let irname = format!("@{}", name);
        debug!("generating procedure {}", irname);

        if let Some(existing) = self.module.find_proc(&irname) {
            if !existing.decl_only {
                return Err(CodegenError::AlreadyExists(pos, name));
            }
            // Replace the signature-only declaration with the definition.
            self.module.decls.retain(|d| match d {
                ir::Decl::Proc(p) => p.name != irname,
                _ => true,
            });
        }
        if self.scopes.lookup_local(&name).is_none() {
            self.scopes
                .insert(ScopeMember {
                    ident: name.clone(),
                    cgtype: Some(ty.clone()),
                    kind: MemberKind::GlobalSym(irname.clone()),
                })
                .map_err(|_| CodegenError::AlreadyExists(pos, name.clone()))?;
        }

        let linkage = if info.storage == Some(ast::Storage::Static) {
            ir::Linkage::Internal
        } else {
            ir::Linkage::Global
        };

        let mut args = Vec::with_capacity(ft.args.len());
        for (i, a) in ft.args.iter().enumerate() {
            args.push(ir::ProcArg {
                name: format!("%{}", i),
                ty: self.type_expr(a, pos)?,
            });
        }
        let ret = match &ft.ret {
            CGType::Void => None,
            other => Some(self.type_expr(other, pos)?),
        };

        self.cur = Some(FnState {
            name: name.clone(),
            body: ir::LabeledBlock::default(),
            lvars: Vec::new(),
            next_tmp: ft.args.len() as u32,
            next_label: 0,
            ret_ty: ft.ret.clone(),
            param_names: Vec::new(),
            break_labels: Vec::new(),
            continue_labels: Vec::new(),
            goto_labels: HashMap::new(),
        });

        // Function scope: arguments are copied into addressable locals.
        self.scopes.push();
        let result = self.gen_function_inner(&ft, entry, body);
        self.scopes.pop();
        let state = self.cur.take().expect("function state");
        result?;

        self.module.decls.push(ir::Decl::Proc(ir::Proc {
            name: irname,
            linkage,
            args,
            ret,
            variadic: ft.variadic,
            decl_only: false,
            lvars: state.lvars,
            body: state.body,
        }));
        Ok(())
    }

    fn gen_function_inner(
        &mut self,
        ft: &FuncType,
        entry: &ast::InitDeclEntry,
        body: &ast::Block,
    ) -> CodegenResult<()> {
        // Bind named parameters: each becomes an addressable local seeded
        // from the incoming argument.
        if let Some(fd) = Self::param_idents(&entry.decl) {
            for (i, (p, aty)) in fd.params.iter().zip(&ft.args).enumerate() {
                let id = match p.decl.ident() {
                    Some(id) => id,
                    None => continue,
                };
                let pname = self.text(id).to_string();
                let pos = self.pos(id);
                self.fstate().param_names.push(pname.clone());
                let irname = format!("%{}", pname);
                let texpr = self.type_expr(aty, pos)?;
                self.fstate().lvars.push(ir::LocalVar {
                    name: irname.clone(),
                    ty: texpr,
                });
                self.scopes
                    .insert(ScopeMember {
                        ident: pname.clone(),
                        cgtype: Some(aty.clone()),
                        kind: MemberKind::LocalVar(irname.clone()),
                    })
                    .map_err(|_| CodegenError::AlreadyExists(pos, pname))?;
                let width = self.width_of(aty, pos)?;
                let ptr = self.new_tmp(&CGType::ptr_to(aty.clone()), pos)?;
                self.emit(ir::Instr {
                    op: ir::Op::Lvarptr,
                    width: Some(ir::Width::W16),
                    dest: Some(ptr.clone()),
                    op1: Some(ir::Operand::var(irname)),
                    op2: None,
                    texpr: None,
                });
                self.emit(ir::Instr {
                    op: ir::Op::Write,
                    width: Some(width),
                    dest: None,
                    op1: Some(ptr),
                    op2: Some(ir::Operand::var(format!("%{}", i))),
                    texpr: None,
                });
            }
        }

        // First pass: collect goto labels so forward jumps resolve.
        self.collect_labels(body)?;

        self.gen_block(body)?;

        // Fall off the end: return without a value.
        self.emit(ir::Instr {
            op: ir::Op::Ret,
            width: None,
            dest: None,
            op1: None,
            op2: None,
            texpr: None,
        });
        Ok(())
    }

    /// Record every goto label of the function body.
    fn collect_labels(&mut self, block: &ast::Block) -> CodegenResult<()> {
        fn walk(cg: &mut CodeGen, stmts: &[ast::Stmt]) -> CodegenResult<()> {
            for s in stmts {
                walk_stmt(cg, s)?;
            }
            Ok(())
        }
        fn walk_stmt(cg: &mut CodeGen, s: &ast::Stmt) -> CodegenResult<()> {
            match s {
                ast::Stmt::Label { ident, .. } => {
                    let name = cg.text(*ident).to_string();
                    let pos = cg.pos(*ident);
                    let ir_label = format!("%_{}", name);
                    if cg
                        .fstate()
                        .goto_labels
                        .insert(name.clone(), ir_label)
                        .is_some()
                    {
                        return Err(CodegenError::AlreadyExists(pos, name));
                    }
                    Ok(())
                }
                ast::Stmt::If(i) => {
                    walk_stmt(cg, &i.tbranch)?;
                    for ei in &i.elseifs {
                        walk_stmt(cg, &ei.branch)?;
                    }
                    if let Some((_, b)) = &i.ebranch {
                        walk_stmt(cg, b)?;
                    }
                    Ok(())
                }
                ast::Stmt::While(w) => walk_stmt(cg, &w.body),
                ast::Stmt::Do(d) => walk_stmt(cg, &d.body),
                ast::Stmt::For(f) => walk_stmt(cg, &f.body),
                ast::Stmt::Switch(sw) => walk_stmt(cg, &sw.body),
                ast::Stmt::Block(b) => walk(cg, &b.stmts),
                ast::Stmt::LoopMacro(l) => walk(cg, &l.body.stmts),
                _ => Ok(()),
            }
        }
        walk(self, &block.stmts)
    }

    /// Look up the IR label of a C goto label.
    pub(crate) fn goto_label(&mut self, name: &str, pos: Pos) -> CodegenResult<String> {
        self.fstate()
            .goto_labels
            .get(name)
            .cloned()
            .ok_or_else(|| CodegenError::NotFound(pos, name.to_string()))
    }

    pub(crate) fn ret_ty(&mut self) -> CGType {
        self.fstate().ret_ty.clone()
    }

    /// The argument index of a declared parameter, for `vastart`.
    pub(crate) fn param_index(&mut self, name: &str) -> Option<usize> {
        self.fstate().param_names.iter().position(|p| p == name)
    }

    /// The name of the function being generated.
    pub(crate) fn fn_name(&mut self) -> String {
        self.fstate().name.clone()
    }

    pub(crate) fn push_loop(&mut self, break_label: String, continue_label: Option<String>) {
        let f = self.fstate();
        f.break_labels.push(break_label);
        if let Some(c) = continue_label {
            f.continue_labels.push(c);
        }
    }

    pub(crate) fn pop_loop(&mut self, had_continue: bool) {
        let f = self.fstate();
        f.break_labels.pop();
        if had_continue {
            f.continue_labels.pop();
        }
    }

    pub(crate) fn break_label(&mut self, pos: Pos) -> CodegenResult<String> {
        self.fstate().break_labels.last().cloned().ok_or_else(|| {
            CodegenError::InvalidInput(pos, "break outside of a loop or switch".to_string())
        })
    }

    pub(crate) fn continue_label(&mut self, pos: Pos) -> CodegenResult<String> {
        self.fstate().continue_labels.last().cloned().ok_or_else(|| {
            CodegenError::InvalidInput(pos, "continue outside of a loop".to_string())
        })
    }

    /// Create an anonymous global for a string literal and return its
    /// symbol.
    pub(crate) fn intern_string(&mut self, s: &ast::StrLitExpr) -> CodegenResult<String> {
        let mut bytes = self.string_bytes(s)?;
        bytes.push(0);
        self.str_count += 1;
        let name = format!("@.str.{}", self.str_count);
        let mut block = ir::DataBlock::default();
        for b in &bytes {
            block.entries.push(ir::DataEntry::Value {
                width: ir::Width::W8,
                value: *b as i64,
                symbol: None,
            });
        }
        self.module.decls.push(ir::Decl::Var(ir::Var {
            name: name.clone(),
            linkage: ir::Linkage::Internal,
            ty: ir::TypeExpr::Array(bytes.len() as u64, Box::new(ir::TypeExpr::Int(ir::Width::W8))),
            data: Some(block),
        }));
        Ok(name)
    }

    /// Declare a local variable in the current function, handling shadowing
    /// by suffixing the IR name.
    pub(crate) fn declare_local(
        &mut self,
        name: &str,
        ty: &CGType,
        pos: Pos,
    ) -> CodegenResult<String> {
        let shadow = self.scopes.count_named(name);
        let irname = if shadow == 0 {
            format!("%{}", name)
        } else {
            format!("%{}.{}", name, shadow)
        };
        let texpr = self.type_expr(ty, pos)?;
        self.fstate().lvars.push(ir::LocalVar {
            name: irname.clone(),
            ty: texpr,
        });
        self.scopes
            .insert(ScopeMember {
                ident: name.to_string(),
                cgtype: Some(ty.clone()),
                kind: MemberKind::LocalVar(irname.clone()),
            })
            .map_err(|_| CodegenError::AlreadyExists(pos, name.to_string()))?;
        Ok(irname)
    }
}

/// The folded result of declaration specifiers.
pub(crate) struct SpecInfo {
    /// The base type.
    pub ty: CGType,
    /// Storage class, when given.
    pub storage: Option<ast::Storage>,
    /// Qualifiers (informational).
    #[allow(dead_code)]
    pub quals: Quals,
}

fn kind_name(kind: RecKind) -> &'static str {
    match kind {
        RecKind::Struct => "struct",
        RecKind::Union => "union",
    }
}

/// Best-effort position of an expression, for diagnostics.
pub(crate) fn expr_pos(toks: &Tokens, e: &ast::Expr) -> Pos {
    let mut ids = Vec::new();
    collect_expr_tokens(e, &mut ids);
    ids.first()
        .map(|id| toks.get(*id).pos())
        .unwrap_or_default()
}

fn collect_expr_tokens(e: &ast::Expr, out: &mut Vec<TokenId>) {
    use ast::Expr as E;
    match e {
        E::IntLit(t) | E::CharLit(t) | E::Ident(t) => out.push(*t),
        E::StrLit(s) => out.extend(s.lits.first().copied()),
        E::Paren { lparen, .. } => out.push(*lparen),
        E::Binop(b) => collect_expr_tokens(&b.lhs, out),
        E::Ternary(t) => collect_expr_tokens(&t.cond, out),
        E::Comma { lhs, .. } => collect_expr_tokens(lhs, out),
        E::Call(c) => collect_expr_tokens(&c.callee, out),
        E::Index(i) => collect_expr_tokens(&i.base, out),
        E::Deref { star, .. } => out.push(*star),
        E::AddrOf { amp, .. } => out.push(*amp),
        E::Sizeof(s) => out.push(s.sizeof_tok),
        E::Cast(c) => out.push(c.lparen),
        E::CompoundLit(c) => out.push(c.lparen),
        E::Member { base, .. } | E::IndMember { base, .. } => collect_expr_tokens(base, out),
        E::USign { tok, .. }
        | E::LogNot { tok, .. }
        | E::BitNot { tok, .. }
        | E::PreAdjust { tok, .. } => out.push(*tok),
        E::PostAdjust { arg, .. } => collect_expr_tokens(arg, out),
        E::VaArg(v) => out.push(v.va_tok),
        E::VaOp(v) => out.push(v.tok),
    }
}

/// The position of a declaration's first basic type specifier, for
/// diagnostics without a better anchor.
fn expr_pos_fallback(toks: &Tokens, d: &ast::Declaration) -> Pos {
    for e in &d.specs.entries {
        if let ast::SpecEntry::Tspec(ast::Tspec::Basic(b)) = e {
            return toks.get(b.tok).pos();
        }
    }
    Pos::start()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::verify_module;
    use zcc_front::{lexer, parser};

    fn gen(src: &str) -> (ir::Module, Records) {
        let toks = lexer::lex(src, "t.c");
        let ast = parser::parse_module(&toks).expect("parse");
        match generate(&toks, &ast) {
            Ok(out) => out,
            Err(e) => panic!("generation failed on {:?}: {}", src, e),
        }
    }

    fn gen_err(src: &str) -> CodegenError {
        let toks = lexer::lex(src, "t.c");
        let ast = parser::parse_module(&toks).expect("parse");
        generate(&toks, &ast).err().expect("expected an error")
    }

    #[test]
    fn return_constant() {
        let (module, _) = gen("int f(void) { return 1; }");
        verify_module(&module).unwrap();
        let p = module.find_proc("@f").expect("proc @f");
        assert_eq!(p.ret, Some(ir::TypeExpr::Int(ir::Width::W16)));
        let text = module.to_string();
        assert!(text.contains("retv.16"), "{}", text);
    }

    #[test]
    fn argument_addition() {
        let (module, _) = gen("int add(int a, int b) { return a + b; }");
        verify_module(&module).unwrap();
        let p = module.find_proc("@add").expect("proc");
        assert_eq!(p.args.len(), 2);
        assert_eq!(p.args[0].name, "%0");
        let text = module.to_string();
        assert!(text.contains("add.16"), "{}", text);
    }

    #[test]
    fn wide_global_increment() {
        let (module, _) = gen("long l;\nvoid f(void) { l = l + 1; }");
        verify_module(&module).unwrap();
        let v = module.find_var("@l").expect("var @l");
        assert_eq!(v.ty, ir::TypeExpr::Int(ir::Width::W32));
        let text = module.to_string();
        assert!(text.contains("add.32"), "{}", text);
    }

    #[test]
    fn bit_field_read_masks() {
        let src = "struct S { int x : 3; int y : 5; };\nstruct S s;\nint f(void) { return s.x; }";
        let (module, records) = gen(src);
        verify_module(&module).unwrap();
        // Both fields share one storage unit.
        let (_, def) = records.recs.iter().next().expect("one record");
        assert_eq!(def.units.len(), 1);
        let text = module.to_string();
        assert!(text.contains("and.16"), "{}", text);
        assert!(text.contains(", 7;"), "{}", text);
    }

    #[test]
    fn short_circuit_uses_branches() {
        let (module, _) = gen("int f(int a, int b) { return a && b; }");
        verify_module(&module).unwrap();
        let text = module.to_string();
        assert!(text.contains("jz"), "{}", text);
        // No arithmetic `and` for the logical operator.
        assert!(!text.contains("and.16"), "{}", text);
    }

    #[test]
    fn loops_and_break() {
        let src = "int f(int n) {\n\tint s = 0;\n\tfor (int i = 0; i < n; i++) {\n\t\tif (i == 3)\n\t\t\tbreak;\n\t\ts += i;\n\t}\n\twhile (n > 0)\n\t\tn--;\n\tdo { n++; } while (n < 2);\n\treturn s;\n}";
        let (module, _) = gen(src);
        verify_module(&module).unwrap();
    }

    #[test]
    fn switch_chain() {
        let src = "int f(int x) {\n\tswitch (x) {\n\tcase 1:\n\t\treturn 10;\n\tcase 2:\n\t\tbreak;\n\tdefault:\n\t\treturn 0;\n\t}\n\treturn 2;\n}";
        let (module, _) = gen(src);
        verify_module(&module).unwrap();
        let text = module.to_string();
        assert!(text.contains("eq.16"), "{}", text);
        assert!(text.contains("jnz"), "{}", text);
    }

    #[test]
    fn goto_and_labels() {
        let src = "int f(void) {\n\tgoto out;\nout:\n\treturn 1;\n}";
        let (module, _) = gen(src);
        verify_module(&module).unwrap();
        let text = module.to_string();
        assert!(text.contains("%_out:"), "{}", text);
    }

    #[test]
    fn pointers_and_strings() {
        let src = "const char *greet(void) { return \"hi\"; }";
        let (module, _) = gen(src);
        verify_module(&module).unwrap();
        let text = module.to_string();
        assert!(text.contains("@.str.1"), "{}", text);
    }

    #[test]
    fn variadic_function() {
        let src = "int sum(int n, ...) {\n\t__va_list ap;\n\tint v;\n\t__va_start(ap, n);\n\tv = __va_arg(ap, int);\n\t__va_end(ap);\n\treturn v;\n}";
        let (module, _) = gen(src);
        verify_module(&module).unwrap();
        let p = module.find_proc("@sum").expect("proc");
        assert!(p.variadic);
        let text = module.to_string();
        assert!(text.contains("vastart"), "{}", text);
        assert!(text.contains("vaarg.16"), "{}", text);
        assert!(text.contains("vaend"), "{}", text);
    }

    #[test]
    fn call_with_conversion() {
        let src = "int g(long v);\nint f(void) { return g(1); }";
        let (module, _) = gen(src);
        verify_module(&module).unwrap();
        let text = module.to_string();
        assert!(text.contains("call"), "{}", text);
        assert!(text.contains("sgnext.32"), "{}", text);
    }

    #[test]
    fn enum_values() {
        let src = "enum e { A, B = 5, C };\nint f(void) { return C; }";
        let (module, records) = gen(src);
        verify_module(&module).unwrap();
        let (_, def) = records.enums.iter().next().expect("one enum");
        assert_eq!(def.elems, vec![
            ("A".to_string(), 0),
            ("B".to_string(), 5),
            ("C".to_string(), 6),
        ]);
        let text = module.to_string();
        assert!(text.contains("retv.16 6;"), "{}", text);
    }

    #[test]
    fn duplicate_local_is_an_error() {
        let e = gen_err("void f(void) { int x; int x; }");
        assert!(matches!(e, CodegenError::AlreadyExists(..)), "{}", e);
    }

    #[test]
    fn undeclared_name_is_an_error() {
        let e = gen_err("void f(void) { x = 1; }");
        assert!(matches!(e, CodegenError::NotFound(..)), "{}", e);
    }

    #[test]
    fn wrong_argument_count_is_an_error() {
        let e = gen_err("int g(int a);\nvoid f(void) { g(1, 2); }");
        assert!(matches!(e, CodegenError::InvalidInput(..)), "{}", e);
    }

    #[test]
    fn shadowing_gets_distinct_ir_names() {
        let src = "int f(void) {\n\tint x = 1;\n\t{\n\t\tint x = 2;\n\t}\n\treturn x;\n}";
        let (module, _) = gen(src);
        verify_module(&module).unwrap();
        let p = module.find_proc("@f").expect("proc");
        assert!(p.lvar("%x").is_some());
        assert!(p.lvar("%x.1").is_some());
    }

    #[test]
    fn sizeof_folds() {
        let (module, _) = gen("int f(void) { return sizeof (long) + sizeof (char *); }");
        verify_module(&module).unwrap();
        let text = module.to_string();
        // Both operands fold to immediates.
        assert!(text.contains("4, 2;"), "{}", text);
    }

    #[test]
    fn typedef_resolution() {
        let src = "typedef unsigned short word_t;\nword_t w;\nword_t get(void) { return w; }";
        let (module, _) = gen(src);
        verify_module(&module).unwrap();
        let v = module.find_var("@w").expect("var");
        assert_eq!(v.ty, ir::TypeExpr::Int(ir::Width::W16));
    }

    #[test]
    fn record_copy() {
        let src = "struct P { int x; int y; };\nvoid f(struct P *a, struct P *b) { *a = *b; }";
        let (module, _) = gen(src);
        verify_module(&module).unwrap();
        let text = module.to_string();
        assert!(text.contains("reccopy"), "{}", text);
    }

    #[test]
    fn global_initialisers() {
        let src = "int a = 3;\nchar msg[] = \"ok\";\nint arr[4] = { 1, 2 };";
        let (module, _) = gen(src);
        verify_module(&module).unwrap();
        let text = module.to_string();
        assert!(text.contains("var @a"), "{}", text);
        assert!(text.contains("var @msg"), "{}", text);
        // The partially initialised array ends in zero space.
        assert!(text.contains("space 4;"), "{}", text);
    }
}
