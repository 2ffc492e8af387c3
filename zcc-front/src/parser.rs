//! The C parser.
//!
//! A hand-written recursive-descent parser over the token stream. The parser
//! peeks past whitespace, comments and leftover preprocessor lines using the
//! stream's ignore predicate, but never removes them: they stay in the
//! stream for the style checker. Every construct records the index of every
//! significant token it consumed, so the resulting tree satisfies the
//! token-coverage invariant checked by `ast::walk_tokens`.
//!
//! Declarations and expressions are split with the usual typedef-name
//! heuristic: the parser keeps a scope stack of names declared with
//! `typedef` and treats any other identifier in specifier position as the
//! start of a macro-based declaration (at file scope) or of an expression
//! (in statement position).
//!
//! On a hard mismatch the parser reports the position and what it expected,
//! and gives up on the translation unit. No recovery is attempted.

use crate::ast::*;
use crate::srcpos::Pos;
use crate::token::{Kw, Punct, Token, TokenId, TokenKind, Tokens};
use std::collections::HashSet;
use thiserror::Error;

/// A parse error: position plus message.
#[derive(Debug, Error)]
#[error("{pos}: {message}")]
pub struct ParseError {
    /// Position of the offending token.
    pub pos: Pos,
    /// Human-readable description of what was expected.
    pub message: String,
}

/// Result of a parser operation.
pub type ParseResult<T> = Result<T, ParseError>;

/// Parse a whole translation unit.
pub fn parse_module(toks: &Tokens) -> ParseResult<Module> {
    Parser::new(toks).module()
}

struct Parser<'a> {
    toks: &'a Tokens,
    /// Index of the next significant token.
    cur: usize,
    /// Scope stack of typedef names.
    typedefs: Vec<HashSet<String>>,
}

impl<'a> Parser<'a> {
    fn new(toks: &'a Tokens) -> Self {
        let mut p = Self {
            toks,
            cur: 0,
            typedefs: vec![HashSet::new()],
        };
        p.skip_ignorable();
        p
    }

    // ------------------------------------------------------------------
    // Cursor

    fn skip_ignorable(&mut self) {
        while self.cur < self.toks.len() {
            let t = self.toks.get(TokenId::new(self.cur));
            if t.kind.is_ignorable() {
                self.cur += 1;
            } else {
                break;
            }
        }
    }

    fn peek(&self) -> &'a Token {
        self.toks.get(TokenId::new(self.cur))
    }

    /// The next significant token after the current one.
    fn peek2(&self) -> &'a Token {
        let mut i = self.cur + 1;
        while i < self.toks.len() {
            let t = self.toks.get(TokenId::new(i));
            if !t.kind.is_ignorable() {
                return t;
            }
            i += 1;
        }
        self.toks.get(TokenId::new(self.toks.len() - 1))
    }

    fn bump(&mut self) -> TokenId {
        let id = TokenId::new(self.cur);
        if self.cur + 1 < self.toks.len() {
            self.cur += 1;
            self.skip_ignorable();
        }
        id
    }

    fn at_punct(&self, p: Punct) -> bool {
        self.peek().kind == TokenKind::Punct(p)
    }

    fn at_kw(&self, kw: Kw) -> bool {
        self.peek().kind == TokenKind::Keyword(kw)
    }

    fn eat_punct(&mut self, p: Punct) -> Option<TokenId> {
        if self.at_punct(p) {
            Some(self.bump())
        } else {
            None
        }
    }

    fn err<T>(&self, expected: &str) -> ParseResult<T> {
        let t = self.peek();
        let got = match t.kind {
            TokenKind::Eof => "end of input".to_string(),
            _ => format!("'{}'", t.text),
        };
        Err(ParseError {
            pos: t.pos(),
            message: format!("expected {}, got {}", expected, got),
        })
    }

    fn expect_punct(&mut self, p: Punct) -> ParseResult<TokenId> {
        if self.at_punct(p) {
            Ok(self.bump())
        } else {
            self.err(&format!("'{}'", p.as_str()))
        }
    }

    fn expect_kw(&mut self, kw: Kw) -> ParseResult<TokenId> {
        if self.at_kw(kw) {
            Ok(self.bump())
        } else {
            self.err(&format!("'{}'", kw.as_str()))
        }
    }

    fn expect_ident(&mut self) -> ParseResult<TokenId> {
        if self.peek().kind == TokenKind::Ident {
            Ok(self.bump())
        } else {
            self.err("identifier")
        }
    }

    fn expect_strlit(&mut self) -> ParseResult<TokenId> {
        match self.peek().kind {
            TokenKind::StrLit | TokenKind::WideStrLit => Ok(self.bump()),
            _ => self.err("string literal"),
        }
    }

    // ------------------------------------------------------------------
    // Typedef bookkeeping

    fn push_scope(&mut self) {
        self.typedefs.push(HashSet::new());
    }

    fn pop_scope(&mut self) {
        self.typedefs.pop();
    }

    fn is_typedef_name(&self, name: &str) -> bool {
        self.typedefs.iter().rev().any(|s| s.contains(name))
    }

    fn declare_typedef(&mut self, name: &str) {
        if let Some(top) = self.typedefs.last_mut() {
            top.insert(name.to_string());
        }
    }

    /// Does `t` start a type name (specifiers of a cast, parameter, sizeof
    /// operand or declaration)?
    fn token_starts_type(&self, t: &Token) -> bool {
        match t.kind {
            TokenKind::Keyword(kw) => matches!(
                kw,
                Kw::Void
                    | Kw::Char
                    | Kw::Short
                    | Kw::Int
                    | Kw::Long
                    | Kw::Signed
                    | Kw::Unsigned
                    | Kw::Float
                    | Kw::Double
                    | Kw::Bool
                    | Kw::Struct
                    | Kw::Union
                    | Kw::Enum
                    | Kw::Const
                    | Kw::Volatile
                    | Kw::Restrict
                    | Kw::Atomic
                    | Kw::VaList
                    | Kw::Attribute
            ),
            TokenKind::Ident => self.is_typedef_name(&t.text),
            _ => false,
        }
    }

    /// Does `t` start a declaration (type start, storage class or function
    /// specifier)?
    fn token_starts_decl(&self, t: &Token) -> bool {
        if self.token_starts_type(t) {
            return true;
        }
        matches!(
            t.kind,
            TokenKind::Keyword(
                Kw::Typedef | Kw::Extern | Kw::Static | Kw::Auto | Kw::Register | Kw::Inline
            )
        )
    }

    fn at_decl_start(&self) -> bool {
        self.token_starts_decl(self.peek())
    }

    // ------------------------------------------------------------------
    // Module level

    fn module(&mut self) -> ParseResult<Module> {
        let mut module = Module::default();
        while self.peek().kind != TokenKind::Eof {
            module.decls.push(self.global_decl()?);
        }
        Ok(module)
    }

    fn global_decl(&mut self) -> ParseResult<GlobalDecl> {
        // extern "C" { ... }
        if self.at_kw(Kw::Extern)
            && matches!(self.peek2().kind, TokenKind::StrLit | TokenKind::WideStrLit)
        {
            return self.extern_c();
        }
        // A leading identifier that was never declared as a type is a
        // macro-based declaration.
        if self.peek().kind == TokenKind::Ident && !self.is_typedef_name(&self.peek().text) {
            return self.macro_decl();
        }
        Ok(GlobalDecl::Ordinary(self.declaration()?))
    }

    fn extern_c(&mut self) -> ParseResult<GlobalDecl> {
        let extern_tok = self.expect_kw(Kw::Extern)?;
        let lang = self.expect_strlit()?;
        if self.at_punct(Punct::LBrace) {
            let lbrace = self.bump();
            let mut decls = Vec::new();
            while !self.at_punct(Punct::RBrace) {
                if self.peek().kind == TokenKind::Eof {
                    return self.err("'}'");
                }
                decls.push(self.global_decl()?);
            }
            let rbrace = self.bump();
            Ok(GlobalDecl::ExternC(ExternCDecl {
                extern_tok,
                lang,
                lbrace: Some(lbrace),
                decls,
                rbrace: Some(rbrace),
            }))
        } else {
            let decl = self.global_decl()?;
            Ok(GlobalDecl::ExternC(ExternCDecl {
                extern_tok,
                lang,
                lbrace: None,
                decls: vec![decl],
                rbrace: None,
            }))
        }
    }

    fn macro_decl(&mut self) -> ParseResult<GlobalDecl> {
        let name = self.expect_ident()?;
        let params = self.macro_params()?;
        let semi = self.eat_punct(Punct::Semicolon);
        Ok(GlobalDecl::MacroBased(MacroDecl { name, params, semi }))
    }

    fn macro_params(&mut self) -> ParseResult<MacroParams> {
        let lparen = self.expect_punct(Punct::LParen)?;
        let mut args = Vec::new();
        if !self.at_punct(Punct::RParen) {
            let first = self.assign_expr()?;
            args.push((None, first));
            while self.at_punct(Punct::Comma) {
                let comma = self.bump();
                let e = self.assign_expr()?;
                args.push((Some(comma), e));
            }
        }
        let rparen = self.expect_punct(Punct::RParen)?;
        Ok(MacroParams {
            lparen,
            args,
            rparen,
        })
    }

    // ------------------------------------------------------------------
    // Declarations

    fn declaration(&mut self) -> ParseResult<Declaration> {
        let specs = self.decl_specs()?;
        let is_typedef = specs
            .entries
            .iter()
            .any(|e| matches!(e, SpecEntry::Storage(s) if s.kind == Storage::Typedef));

        if let Some(semi) = self.eat_punct(Punct::Semicolon) {
            return Ok(Declaration {
                specs,
                entries: Vec::new(),
                semi: Some(semi),
                body: None,
            });
        }

        let mut entries = Vec::new();
        let first = self.init_decl_entry(None)?;
        if is_typedef {
            if let Some(id) = first.decl.ident() {
                let name = self.toks.get(id).text.clone();
                self.declare_typedef(&name);
            }
        }
        entries.push(first);

        // A function definition has exactly one declarator and a body.
        if self.at_punct(Punct::LBrace) {
            let body = self.block()?;
            return Ok(Declaration {
                specs,
                entries,
                semi: None,
                body: Some(body),
            });
        }

        while self.at_punct(Punct::Comma) {
            let comma = self.bump();
            let entry = self.init_decl_entry(Some(comma))?;
            if is_typedef {
                if let Some(id) = entry.decl.ident() {
                    let name = self.toks.get(id).text.clone();
                    self.declare_typedef(&name);
                }
            }
            entries.push(entry);
        }
        let semi = self.expect_punct(Punct::Semicolon)?;
        Ok(Declaration {
            specs,
            entries,
            semi: Some(semi),
            body: None,
        })
    }

    fn init_decl_entry(&mut self, comma: Option<TokenId>) -> ParseResult<InitDeclEntry> {
        let decl = self.declarator(false)?;
        let mut attrs = Vec::new();
        while self.at_kw(Kw::Attribute) {
            attrs.push(self.attr_spec()?);
        }
        let init = if self.at_punct(Punct::Assign) {
            let eq = self.bump();
            let init = self.initializer()?;
            Some((eq, init))
        } else {
            None
        };
        Ok(InitDeclEntry {
            comma,
            decl,
            attrs,
            init,
        })
    }

    fn initializer(&mut self) -> ParseResult<Init> {
        if self.at_punct(Punct::LBrace) {
            Ok(Init::Compound(self.compound_init()?))
        } else {
            Ok(Init::Expr(Box::new(self.assign_expr()?)))
        }
    }

    fn compound_init(&mut self) -> ParseResult<CompoundInit> {
        let lbrace = self.expect_punct(Punct::LBrace)?;
        let mut entries = Vec::new();
        let mut trailing_comma = None;
        while !self.at_punct(Punct::RBrace) {
            let comma = if entries.is_empty() {
                None
            } else {
                let c = self.expect_punct(Punct::Comma)?;
                if self.at_punct(Punct::RBrace) {
                    trailing_comma = Some(c);
                    break;
                }
                Some(c)
            };
            let mut designators = Vec::new();
            loop {
                if self.at_punct(Punct::Period) {
                    let period = self.bump();
                    let ident = self.expect_ident()?;
                    designators.push(Designator::Member { period, ident });
                } else if self.at_punct(Punct::LBracket) {
                    let lbracket = self.bump();
                    let index = Box::new(self.cond_expr()?);
                    let rbracket = self.expect_punct(Punct::RBracket)?;
                    designators.push(Designator::Index {
                        lbracket,
                        index,
                        rbracket,
                    });
                } else {
                    break;
                }
            }
            let assign = if designators.is_empty() {
                None
            } else {
                Some(self.expect_punct(Punct::Assign)?)
            };
            let init = self.initializer()?;
            entries.push(InitEntry {
                comma,
                designators,
                assign,
                init,
            });
        }
        let rbrace = self.expect_punct(Punct::RBrace)?;
        Ok(CompoundInit {
            lbrace,
            entries,
            trailing_comma,
            rbrace,
        })
    }

    fn decl_specs(&mut self) -> ParseResult<DeclSpecs> {
        let mut specs = DeclSpecs::default();
        let mut have_tspec = false;
        loop {
            let entry = match self.peek().kind {
                TokenKind::Keyword(kw) => match kw {
                    Kw::Typedef => SpecEntry::Storage(self.storage(Storage::Typedef)),
                    Kw::Extern => SpecEntry::Storage(self.storage(Storage::Extern)),
                    Kw::Static => SpecEntry::Storage(self.storage(Storage::Static)),
                    Kw::Auto => SpecEntry::Storage(self.storage(Storage::Auto)),
                    Kw::Register => SpecEntry::Storage(self.storage(Storage::Register)),
                    Kw::Inline => SpecEntry::FunSpec(FunSpecEntry {
                        kind: FunSpec::Inline,
                        tok: self.bump(),
                    }),
                    Kw::Const => SpecEntry::Qual(self.qual(Tqual::Const)),
                    Kw::Volatile => SpecEntry::Qual(self.qual(Tqual::Volatile)),
                    Kw::Restrict => SpecEntry::Qual(self.qual(Tqual::Restrict)),
                    Kw::Atomic => {
                        if self.peek2().kind == TokenKind::Punct(Punct::LParen) {
                            have_tspec = true;
                            let atomic_tok = self.bump();
                            let lparen = self.expect_punct(Punct::LParen)?;
                            let tname = Box::new(self.type_name()?);
                            let rparen = self.expect_punct(Punct::RParen)?;
                            SpecEntry::Tspec(Tspec::Atomic(AtomicSpec {
                                atomic_tok,
                                lparen,
                                tname,
                                rparen,
                            }))
                        } else {
                            SpecEntry::Qual(self.qual(Tqual::Atomic))
                        }
                    }
                    Kw::Void => self.basic(BasicKind::Void, &mut have_tspec),
                    Kw::Char => self.basic(BasicKind::Char, &mut have_tspec),
                    Kw::Short => self.basic(BasicKind::Short, &mut have_tspec),
                    Kw::Int => self.basic(BasicKind::Int, &mut have_tspec),
                    Kw::Long => self.basic(BasicKind::Long, &mut have_tspec),
                    Kw::Signed => self.basic(BasicKind::Signed, &mut have_tspec),
                    Kw::Unsigned => self.basic(BasicKind::Unsigned, &mut have_tspec),
                    Kw::Float => self.basic(BasicKind::Float, &mut have_tspec),
                    Kw::Double => self.basic(BasicKind::Double, &mut have_tspec),
                    Kw::Bool => self.basic(BasicKind::Bool, &mut have_tspec),
                    Kw::Struct | Kw::Union => {
                        have_tspec = true;
                        SpecEntry::Tspec(Tspec::Record(self.record_spec()?))
                    }
                    Kw::Enum => {
                        have_tspec = true;
                        SpecEntry::Tspec(Tspec::Enum(self.enum_spec()?))
                    }
                    Kw::VaList => {
                        have_tspec = true;
                        SpecEntry::Tspec(Tspec::VaList(self.bump()))
                    }
                    Kw::Attribute => SpecEntry::Attr(self.attr_spec()?),
                    _ => break,
                },
                TokenKind::Ident
                    if !have_tspec && self.is_typedef_name(&self.peek().text) =>
                {
                    have_tspec = true;
                    SpecEntry::Tspec(Tspec::TypedefName(self.bump()))
                }
                _ => break,
            };
            specs.entries.push(entry);
        }
        if specs.entries.is_empty() {
            return self.err("declaration specifier");
        }
        Ok(specs)
    }

    fn storage(&mut self, kind: Storage) -> StorageEntry {
        StorageEntry {
            kind,
            tok: self.bump(),
        }
    }

    fn qual(&mut self, kind: Tqual) -> TqualEntry {
        TqualEntry {
            kind,
            tok: self.bump(),
        }
    }

    fn basic(&mut self, kind: BasicKind, have_tspec: &mut bool) -> SpecEntry {
        *have_tspec = true;
        SpecEntry::Tspec(Tspec::Basic(BasicTspec {
            kind,
            tok: self.bump(),
        }))
    }

    fn record_spec(&mut self) -> ParseResult<RecordSpec> {
        let (kind, kind_tok) = if self.at_kw(Kw::Struct) {
            (RecordKind::Struct, self.bump())
        } else {
            (RecordKind::Union, self.expect_kw(Kw::Union)?)
        };
        let mut attrs = Vec::new();
        while self.at_kw(Kw::Attribute) {
            attrs.push(self.attr_spec()?);
        }
        let ident = if self.peek().kind == TokenKind::Ident {
            Some(self.bump())
        } else {
            None
        };
        let body = if self.at_punct(Punct::LBrace) {
            let lbrace = self.bump();
            let mut members = Vec::new();
            while !self.at_punct(Punct::RBrace) {
                if self.peek().kind == TokenKind::Eof {
                    return self.err("'}'");
                }
                members.push(self.record_member()?);
            }
            let rbrace = self.bump();
            Some(RecordBody {
                lbrace,
                members,
                rbrace,
            })
        } else {
            None
        };
        if ident.is_none() && body.is_none() {
            return self.err("struct tag or member list");
        }
        Ok(RecordSpec {
            kind,
            kind_tok,
            attrs,
            ident,
            body,
        })
    }

    fn record_member(&mut self) -> ParseResult<RecordMember> {
        let specs = self.decl_specs()?;
        let mut decls = Vec::new();
        if !self.at_punct(Punct::Semicolon) {
            let first = self.member_decl(None)?;
            decls.push(first);
            while self.at_punct(Punct::Comma) {
                let comma = self.bump();
                let d = self.member_decl(Some(comma))?;
                decls.push(d);
            }
        }
        let semi = self.expect_punct(Punct::Semicolon)?;
        Ok(RecordMember { specs, decls, semi })
    }

    fn member_decl(&mut self, comma: Option<TokenId>) -> ParseResult<MemberDecl> {
        // An anonymous bit field has no declarator at all.
        let decl = if self.at_punct(Punct::Colon) {
            Declarator::Anon
        } else {
            self.declarator(false)?
        };
        let bitwidth = if self.at_punct(Punct::Colon) {
            let colon = self.bump();
            let width = Box::new(self.cond_expr()?);
            Some((colon, width))
        } else {
            None
        };
        Ok(MemberDecl {
            comma,
            decl,
            bitwidth,
        })
    }

    fn enum_spec(&mut self) -> ParseResult<EnumSpec> {
        let enum_tok = self.expect_kw(Kw::Enum)?;
        let ident = if self.peek().kind == TokenKind::Ident {
            Some(self.bump())
        } else {
            None
        };
        let body = if self.at_punct(Punct::LBrace) {
            let lbrace = self.bump();
            let mut elems = Vec::new();
            let mut trailing_comma = None;
            while !self.at_punct(Punct::RBrace) {
                let comma = if elems.is_empty() {
                    None
                } else {
                    let c = self.expect_punct(Punct::Comma)?;
                    if self.at_punct(Punct::RBrace) {
                        trailing_comma = Some(c);
                        break;
                    }
                    Some(c)
                };
                let ident = self.expect_ident()?;
                let init = if self.at_punct(Punct::Assign) {
                    let eq = self.bump();
                    let v = Box::new(self.cond_expr()?);
                    Some((eq, v))
                } else {
                    None
                };
                elems.push(EnumElem { comma, ident, init });
            }
            let rbrace = self.expect_punct(Punct::RBrace)?;
            Some(EnumBody {
                lbrace,
                elems,
                trailing_comma,
                rbrace,
            })
        } else {
            None
        };
        if ident.is_none() && body.is_none() {
            return self.err("enum tag or enumerator list");
        }
        Ok(EnumSpec {
            enum_tok,
            ident,
            body,
        })
    }

    fn attr_spec(&mut self) -> ParseResult<AttrSpec> {
        let attr_tok = self.expect_kw(Kw::Attribute)?;
        let lparen1 = self.expect_punct(Punct::LParen)?;
        let lparen2 = self.expect_punct(Punct::LParen)?;
        let mut attrs = Vec::new();
        if !self.at_punct(Punct::RParen) {
            let first = self.attr(None)?;
            attrs.push(first);
            while self.at_punct(Punct::Comma) {
                let comma = self.bump();
                let a = self.attr(Some(comma))?;
                attrs.push(a);
            }
        }
        let rparen1 = self.expect_punct(Punct::RParen)?;
        let rparen2 = self.expect_punct(Punct::RParen)?;
        Ok(AttrSpec {
            attr_tok,
            lparen1,
            lparen2,
            attrs,
            rparen1,
            rparen2,
        })
    }

    fn attr(&mut self, comma: Option<TokenId>) -> ParseResult<Attr> {
        // Attribute names may be keywords too (e.g. `const`).
        let name = match self.peek().kind {
            TokenKind::Ident | TokenKind::Keyword(_) => self.bump(),
            _ => return self.err("attribute name"),
        };
        let params = if self.at_punct(Punct::LParen) {
            Some(self.macro_params()?)
        } else {
            None
        };
        Ok(Attr {
            comma,
            name,
            params,
        })
    }

    // ------------------------------------------------------------------
    // Declarators

    fn declarator(&mut self, abstract_only: bool) -> ParseResult<Declarator> {
        if self.at_punct(Punct::Star) {
            let star = self.bump();
            let mut quals = Vec::new();
            loop {
                if self.at_kw(Kw::Const) {
                    quals.push(self.qual(Tqual::Const));
                } else if self.at_kw(Kw::Volatile) {
                    quals.push(self.qual(Tqual::Volatile));
                } else if self.at_kw(Kw::Restrict) {
                    quals.push(self.qual(Tqual::Restrict));
                } else if self.at_kw(Kw::Atomic) {
                    quals.push(self.qual(Tqual::Atomic));
                } else {
                    break;
                }
            }
            let inner = Box::new(self.declarator(abstract_only)?);
            return Ok(Declarator::Ptr { star, quals, inner });
        }
        let mut d = self.direct_declarator(abstract_only)?;
        loop {
            if self.at_punct(Punct::LParen) {
                d = Declarator::Fun(Box::new(self.fun_declarator(d)?));
            } else if self.at_punct(Punct::LBracket) {
                let lbracket = self.bump();
                let size = if self.at_punct(Punct::RBracket) {
                    None
                } else {
                    Some(Box::new(self.cond_expr()?))
                };
                let rbracket = self.expect_punct(Punct::RBracket)?;
                d = Declarator::Arr(Box::new(ArrDeclarator {
                    inner: d,
                    lbracket,
                    size,
                    rbracket,
                }));
            } else {
                break;
            }
        }
        Ok(d)
    }

    fn direct_declarator(&mut self, _abstract_only: bool) -> ParseResult<Declarator> {
        match self.peek().kind {
            TokenKind::Ident => Ok(Declarator::Ident(self.bump())),
            TokenKind::Punct(Punct::LParen) => {
                // `(` here is a parenthesised declarator only when it does
                // not open a parameter list of an abstract function
                // declarator.
                let inner_is_params = self.peek2().kind == TokenKind::Punct(Punct::RParen)
                    || self.token_starts_decl(self.peek2());
                if inner_is_params {
                    return Ok(Declarator::Anon);
                }
                let lparen = self.bump();
                let inner = Box::new(self.declarator(_abstract_only)?);
                let rparen = self.expect_punct(Punct::RParen)?;
                Ok(Declarator::Paren {
                    lparen,
                    inner,
                    rparen,
                })
            }
            _ => Ok(Declarator::Anon),
        }
    }

    fn fun_declarator(&mut self, inner: Declarator) -> ParseResult<FunDeclarator> {
        let lparen = self.expect_punct(Punct::LParen)?;
        let mut params = Vec::new();
        let mut variadic = None;
        if !self.at_punct(Punct::RParen) {
            let first = self.param(None)?;
            params.push(first);
            while self.at_punct(Punct::Comma) {
                let comma = self.bump();
                if self.at_punct(Punct::Ellipsis) {
                    let ellipsis = self.bump();
                    variadic = Some((comma, ellipsis));
                    break;
                }
                let p = self.param(Some(comma))?;
                params.push(p);
            }
        }
        let rparen = self.expect_punct(Punct::RParen)?;
        Ok(FunDeclarator {
            inner,
            lparen,
            params,
            variadic,
            rparen,
        })
    }

    fn param(&mut self, comma: Option<TokenId>) -> ParseResult<Param> {
        let specs = self.decl_specs()?;
        let decl = self.declarator(true)?;
        Ok(Param { comma, specs, decl })
    }

    fn type_name(&mut self) -> ParseResult<TypeName> {
        let specs = self.decl_specs()?;
        let decl = self.declarator(true)?;
        Ok(TypeName { specs, decl })
    }

    // ------------------------------------------------------------------
    // Expressions

    fn expr(&mut self) -> ParseResult<Expr> {
        let mut e = self.assign_expr()?;
        while self.at_punct(Punct::Comma) {
            let comma = self.bump();
            let rhs = self.assign_expr()?;
            e = Expr::Comma {
                lhs: Box::new(e),
                comma,
                rhs: Box::new(rhs),
            };
        }
        Ok(e)
    }

    fn assign_expr(&mut self) -> ParseResult<Expr> {
        let lhs = self.cond_expr()?;
        let op = match self.peek().kind {
            TokenKind::Punct(Punct::Assign) => BinOp::Assign,
            TokenKind::Punct(Punct::PlusAssign) => BinOp::AddAssign,
            TokenKind::Punct(Punct::MinusAssign) => BinOp::SubAssign,
            TokenKind::Punct(Punct::StarAssign) => BinOp::MulAssign,
            TokenKind::Punct(Punct::SlashAssign) => BinOp::DivAssign,
            TokenKind::Punct(Punct::PercentAssign) => BinOp::ModAssign,
            TokenKind::Punct(Punct::ShlAssign) => BinOp::ShlAssign,
            TokenKind::Punct(Punct::ShrAssign) => BinOp::ShrAssign,
            TokenKind::Punct(Punct::AmpAssign) => BinOp::BAndAssign,
            TokenKind::Punct(Punct::CaretAssign) => BinOp::BXorAssign,
            TokenKind::Punct(Punct::PipeAssign) => BinOp::BOrAssign,
            _ => return Ok(lhs),
        };
        let op_tok = self.bump();
        let rhs = self.assign_expr()?;
        Ok(Expr::Binop(BinopExpr {
            op,
            op_tok,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }))
    }

    fn cond_expr(&mut self) -> ParseResult<Expr> {
        let cond = self.binary_expr(0)?;
        if !self.at_punct(Punct::Question) {
            return Ok(cond);
        }
        let qmark = self.bump();
        let then = self.expr()?;
        let colon = self.expect_punct(Punct::Colon)?;
        let els = self.cond_expr()?;
        Ok(Expr::Ternary(TernaryExpr {
            cond: Box::new(cond),
            qmark,
            then: Box::new(then),
            colon,
            els: Box::new(els),
        }))
    }

    /// Binary operator precedence, lowest first.
    fn binop_at(&self, level: u8) -> Option<BinOp> {
        let p = match self.peek().kind {
            TokenKind::Punct(p) => p,
            _ => return None,
        };
        let (op, l) = match p {
            Punct::PipePipe => (BinOp::LOr, 0),
            Punct::AmpAmp => (BinOp::LAnd, 1),
            Punct::Pipe => (BinOp::BOr, 2),
            Punct::Caret => (BinOp::BXor, 3),
            Punct::Amp => (BinOp::BAnd, 4),
            Punct::EqEq => (BinOp::Eq, 5),
            Punct::NotEq => (BinOp::NotEq, 5),
            Punct::Lt => (BinOp::Lt, 6),
            Punct::Gt => (BinOp::Gt, 6),
            Punct::LtEq => (BinOp::LtEq, 6),
            Punct::GtEq => (BinOp::GtEq, 6),
            Punct::Shl => (BinOp::Shl, 7),
            Punct::Shr => (BinOp::Shr, 7),
            Punct::Plus => (BinOp::Add, 8),
            Punct::Minus => (BinOp::Sub, 8),
            Punct::Star => (BinOp::Mul, 9),
            Punct::Slash => (BinOp::Div, 9),
            Punct::Percent => (BinOp::Mod, 9),
            _ => return None,
        };
        if l == level {
            Some(op)
        } else {
            None
        }
    }

    fn binary_expr(&mut self, level: u8) -> ParseResult<Expr> {
        if level > 9 {
            return self.cast_expr();
        }
        let mut lhs = self.binary_expr(level + 1)?;
        while let Some(op) = self.binop_at(level) {
            let op_tok = self.bump();
            let rhs = self.binary_expr(level + 1)?;
            lhs = Expr::Binop(BinopExpr {
                op,
                op_tok,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            });
        }
        Ok(lhs)
    }

    fn cast_expr(&mut self) -> ParseResult<Expr> {
        if self.at_punct(Punct::LParen) {
            // A parenthesised type name is a cast or a compound literal.
            let is_type = self.token_starts_type(self.peek2());
            if is_type {
                let lparen = self.bump();
                let tname = Box::new(self.type_name()?);
                let rparen = self.expect_punct(Punct::RParen)?;
                if self.at_punct(Punct::LBrace) {
                    let init = self.compound_init()?;
                    let lit = Expr::CompoundLit(CompoundLitExpr {
                        lparen,
                        tname,
                        rparen,
                        init,
                    });
                    return self.postfix_tail(lit);
                }
                let arg = Box::new(self.cast_expr()?);
                return Ok(Expr::Cast(CastExpr {
                    lparen,
                    tname,
                    rparen,
                    arg,
                }));
            }
        }
        self.unary_expr()
    }

    fn unary_expr(&mut self) -> ParseResult<Expr> {
        match self.peek().kind {
            TokenKind::Punct(Punct::Star) => {
                let star = self.bump();
                let arg = Box::new(self.cast_expr()?);
                Ok(Expr::Deref { star, arg })
            }
            TokenKind::Punct(Punct::Amp) => {
                let amp = self.bump();
                let arg = Box::new(self.cast_expr()?);
                Ok(Expr::AddrOf { amp, arg })
            }
            TokenKind::Punct(Punct::Plus) => {
                let tok = self.bump();
                let arg = Box::new(self.cast_expr()?);
                Ok(Expr::USign {
                    tok,
                    negative: false,
                    arg,
                })
            }
            TokenKind::Punct(Punct::Minus) => {
                let tok = self.bump();
                let arg = Box::new(self.cast_expr()?);
                Ok(Expr::USign {
                    tok,
                    negative: true,
                    arg,
                })
            }
            TokenKind::Punct(Punct::Not) => {
                let tok = self.bump();
                let arg = Box::new(self.cast_expr()?);
                Ok(Expr::LogNot { tok, arg })
            }
            TokenKind::Punct(Punct::Tilde) => {
                let tok = self.bump();
                let arg = Box::new(self.cast_expr()?);
                Ok(Expr::BitNot { tok, arg })
            }
            TokenKind::Punct(Punct::Inc) => {
                let tok = self.bump();
                let arg = Box::new(self.unary_expr()?);
                Ok(Expr::PreAdjust {
                    tok,
                    inc: true,
                    arg,
                })
            }
            TokenKind::Punct(Punct::Dec) => {
                let tok = self.bump();
                let arg = Box::new(self.unary_expr()?);
                Ok(Expr::PreAdjust {
                    tok,
                    inc: false,
                    arg,
                })
            }
            TokenKind::Keyword(Kw::Sizeof) => {
                let sizeof_tok = self.bump();
                if self.at_punct(Punct::LParen) {
                    let is_type = self.token_starts_type(self.peek2());
                    if is_type {
                        let lparen = self.bump();
                        let tname = Box::new(self.type_name()?);
                        let rparen = self.expect_punct(Punct::RParen)?;
                        return Ok(Expr::Sizeof(SizeofExpr {
                            sizeof_tok,
                            arg: SizeofArg::Type {
                                lparen,
                                tname,
                                rparen,
                            },
                        }));
                    }
                }
                let arg = Box::new(self.unary_expr()?);
                Ok(Expr::Sizeof(SizeofExpr {
                    sizeof_tok,
                    arg: SizeofArg::Expr(arg),
                }))
            }
            TokenKind::Keyword(Kw::VaStart)
            | TokenKind::Keyword(Kw::VaEnd)
            | TokenKind::Keyword(Kw::VaCopy) => {
                let kind = match self.peek().kind {
                    TokenKind::Keyword(Kw::VaStart) => VaOpKind::Start,
                    TokenKind::Keyword(Kw::VaEnd) => VaOpKind::End,
                    _ => VaOpKind::Copy,
                };
                let tok = self.bump();
                let lparen = self.expect_punct(Punct::LParen)?;
                let mut args = Vec::new();
                if !self.at_punct(Punct::RParen) {
                    let first = self.assign_expr()?;
                    args.push((None, first));
                    while self.at_punct(Punct::Comma) {
                        let comma = self.bump();
                        let a = self.assign_expr()?;
                        args.push((Some(comma), a));
                    }
                }
                let rparen = self.expect_punct(Punct::RParen)?;
                Ok(Expr::VaOp(VaOpExpr {
                    kind,
                    tok,
                    lparen,
                    args,
                    rparen,
                }))
            }
            TokenKind::Keyword(Kw::VaArg) => {
                let va_tok = self.bump();
                let lparen = self.expect_punct(Punct::LParen)?;
                let ap = Box::new(self.assign_expr()?);
                let comma = self.expect_punct(Punct::Comma)?;
                let tname = Box::new(self.type_name()?);
                let rparen = self.expect_punct(Punct::RParen)?;
                Ok(Expr::VaArg(VaArgExpr {
                    va_tok,
                    lparen,
                    ap,
                    comma,
                    tname,
                    rparen,
                }))
            }
            _ => self.postfix_expr(),
        }
    }

    fn postfix_expr(&mut self) -> ParseResult<Expr> {
        let e = self.primary_expr()?;
        self.postfix_tail(e)
    }

    fn postfix_tail(&mut self, mut e: Expr) -> ParseResult<Expr> {
        loop {
            match self.peek().kind {
                TokenKind::Punct(Punct::LParen) => {
                    let lparen = self.bump();
                    let mut args = Vec::new();
                    if !self.at_punct(Punct::RParen) {
                        let first = self.assign_expr()?;
                        args.push((None, first));
                        while self.at_punct(Punct::Comma) {
                            let comma = self.bump();
                            let a = self.assign_expr()?;
                            args.push((Some(comma), a));
                        }
                    }
                    let rparen = self.expect_punct(Punct::RParen)?;
                    e = Expr::Call(CallExpr {
                        callee: Box::new(e),
                        lparen,
                        args,
                        rparen,
                    });
                }
                TokenKind::Punct(Punct::LBracket) => {
                    let lbracket = self.bump();
                    let index = Box::new(self.expr()?);
                    let rbracket = self.expect_punct(Punct::RBracket)?;
                    e = Expr::Index(IndexExpr {
                        base: Box::new(e),
                        lbracket,
                        index,
                        rbracket,
                    });
                }
                TokenKind::Punct(Punct::Period) => {
                    let period = self.bump();
                    let ident = self.expect_ident()?;
                    e = Expr::Member {
                        base: Box::new(e),
                        period,
                        ident,
                    };
                }
                TokenKind::Punct(Punct::Arrow) => {
                    let arrow = self.bump();
                    let ident = self.expect_ident()?;
                    e = Expr::IndMember {
                        base: Box::new(e),
                        arrow,
                        ident,
                    };
                }
                TokenKind::Punct(Punct::Inc) => {
                    let tok = self.bump();
                    e = Expr::PostAdjust {
                        arg: Box::new(e),
                        tok,
                        inc: true,
                    };
                }
                TokenKind::Punct(Punct::Dec) => {
                    let tok = self.bump();
                    e = Expr::PostAdjust {
                        arg: Box::new(e),
                        tok,
                        inc: false,
                    };
                }
                _ => break,
            }
        }
        Ok(e)
    }

    fn primary_expr(&mut self) -> ParseResult<Expr> {
        match self.peek().kind {
            TokenKind::IntLit => Ok(Expr::IntLit(self.bump())),
            TokenKind::CharLit => Ok(Expr::CharLit(self.bump())),
            TokenKind::StrLit | TokenKind::WideStrLit => Ok(Expr::StrLit(self.strlit()?)),
            TokenKind::Ident => Ok(Expr::Ident(self.bump())),
            TokenKind::Punct(Punct::LParen) => {
                let lparen = self.bump();
                let inner = Box::new(self.expr()?);
                let rparen = self.expect_punct(Punct::RParen)?;
                Ok(Expr::Paren {
                    lparen,
                    inner,
                    rparen,
                })
            }
            _ => self.err("expression"),
        }
    }

    /// One or more adjacent string literals.
    fn strlit(&mut self) -> ParseResult<StrLitExpr> {
        let mut lits = Vec::new();
        let mut wide = false;
        loop {
            match self.peek().kind {
                TokenKind::StrLit => lits.push(self.bump()),
                TokenKind::WideStrLit => {
                    wide = true;
                    lits.push(self.bump());
                }
                _ => break,
            }
        }
        if lits.is_empty() {
            return self.err("string literal");
        }
        Ok(StrLitExpr { lits, wide })
    }

    // ------------------------------------------------------------------
    // Statements

    fn block(&mut self) -> ParseResult<Block> {
        let lbrace = self.expect_punct(Punct::LBrace)?;
        self.push_scope();
        let mut stmts = Vec::new();
        while !self.at_punct(Punct::RBrace) {
            if self.peek().kind == TokenKind::Eof {
                self.pop_scope();
                return self.err("'}'");
            }
            stmts.push(self.stmt()?);
        }
        self.pop_scope();
        let rbrace = self.bump();
        Ok(Block {
            lbrace,
            stmts,
            rbrace,
        })
    }

    fn stmt(&mut self) -> ParseResult<Stmt> {
        match self.peek().kind {
            TokenKind::Punct(Punct::LBrace) => Ok(Stmt::Block(self.block()?)),
            TokenKind::Punct(Punct::Semicolon) => Ok(Stmt::Null { semi: self.bump() }),
            TokenKind::Keyword(Kw::Break) => {
                let break_tok = self.bump();
                let semi = self.expect_punct(Punct::Semicolon)?;
                Ok(Stmt::Break { break_tok, semi })
            }
            TokenKind::Keyword(Kw::Continue) => {
                let continue_tok = self.bump();
                let semi = self.expect_punct(Punct::Semicolon)?;
                Ok(Stmt::Continue { continue_tok, semi })
            }
            TokenKind::Keyword(Kw::Goto) => {
                let goto_tok = self.bump();
                let target = self.expect_ident()?;
                let semi = self.expect_punct(Punct::Semicolon)?;
                Ok(Stmt::Goto {
                    goto_tok,
                    target,
                    semi,
                })
            }
            TokenKind::Keyword(Kw::Return) => {
                let return_tok = self.bump();
                let value = if self.at_punct(Punct::Semicolon) {
                    None
                } else {
                    Some(Box::new(self.expr()?))
                };
                let semi = self.expect_punct(Punct::Semicolon)?;
                Ok(Stmt::Return {
                    return_tok,
                    value,
                    semi,
                })
            }
            TokenKind::Keyword(Kw::If) => self.if_stmt(),
            TokenKind::Keyword(Kw::While) => {
                let while_tok = self.bump();
                let lparen = self.expect_punct(Punct::LParen)?;
                let cond = Box::new(self.expr()?);
                let rparen = self.expect_punct(Punct::RParen)?;
                let body = Box::new(self.stmt()?);
                Ok(Stmt::While(WhileStmt {
                    while_tok,
                    lparen,
                    cond,
                    rparen,
                    body,
                }))
            }
            TokenKind::Keyword(Kw::Do) => {
                let do_tok = self.bump();
                let body = Box::new(self.stmt()?);
                let while_tok = self.expect_kw(Kw::While)?;
                let lparen = self.expect_punct(Punct::LParen)?;
                let cond = Box::new(self.expr()?);
                let rparen = self.expect_punct(Punct::RParen)?;
                let semi = self.expect_punct(Punct::Semicolon)?;
                Ok(Stmt::Do(DoStmt {
                    do_tok,
                    body,
                    while_tok,
                    lparen,
                    cond,
                    rparen,
                    semi,
                }))
            }
            TokenKind::Keyword(Kw::For) => self.for_stmt(),
            TokenKind::Keyword(Kw::Switch) => {
                let switch_tok = self.bump();
                let lparen = self.expect_punct(Punct::LParen)?;
                let expr = Box::new(self.expr()?);
                let rparen = self.expect_punct(Punct::RParen)?;
                let body = Box::new(self.stmt()?);
                Ok(Stmt::Switch(SwitchStmt {
                    switch_tok,
                    lparen,
                    expr,
                    rparen,
                    body,
                }))
            }
            TokenKind::Keyword(Kw::Case) => {
                let case_tok = self.bump();
                let value = Box::new(self.cond_expr()?);
                let colon = self.expect_punct(Punct::Colon)?;
                Ok(Stmt::CaseLabel {
                    case_tok,
                    value,
                    colon,
                })
            }
            TokenKind::Keyword(Kw::Default) => {
                let default_tok = self.bump();
                let colon = self.expect_punct(Punct::Colon)?;
                Ok(Stmt::DefaultLabel { default_tok, colon })
            }
            TokenKind::Keyword(Kw::Asm) => self.asm_stmt(),
            TokenKind::Ident
                if self.peek2().kind == TokenKind::Punct(Punct::Colon)
                    && !self.is_typedef_name(&self.peek().text) =>
            {
                let ident = self.bump();
                let colon = self.bump();
                Ok(Stmt::Label { ident, colon })
            }
            _ if self.at_decl_start() => {
                let decl = self.declaration()?;
                if decl.body.is_some() {
                    return self.err("';'");
                }
                Ok(Stmt::Decl(decl))
            }
            _ => {
                let expr = self.expr()?;
                // A call-shaped expression directly followed by a block is a
                // loop macro.
                if self.at_punct(Punct::LBrace) {
                    if let Expr::Call(call) = expr {
                        if let Expr::Ident(name) = *call.callee {
                            let body = self.block()?;
                            return Ok(Stmt::LoopMacro(LoopMacroStmt {
                                name,
                                params: MacroParams {
                                    lparen: call.lparen,
                                    args: call.args,
                                    rparen: call.rparen,
                                },
                                body,
                            }));
                        }
                        return self.err("';'");
                    }
                    return self.err("';'");
                }
                let semi = self.expect_punct(Punct::Semicolon)?;
                Ok(Stmt::Expr {
                    expr: Box::new(expr),
                    semi,
                })
            }
        }
    }

    fn if_stmt(&mut self) -> ParseResult<Stmt> {
        let if_tok = self.expect_kw(Kw::If)?;
        let lparen = self.expect_punct(Punct::LParen)?;
        let cond = Box::new(self.expr()?);
        let rparen = self.expect_punct(Punct::RParen)?;
        let tbranch = Box::new(self.stmt()?);
        let mut elseifs = Vec::new();
        let mut ebranch = None;
        while self.at_kw(Kw::Else) {
            let else_tok = self.bump();
            if self.at_kw(Kw::If) {
                let if_tok = self.bump();
                let lparen = self.expect_punct(Punct::LParen)?;
                let cond = Box::new(self.expr()?);
                let rparen = self.expect_punct(Punct::RParen)?;
                let branch = Box::new(self.stmt()?);
                elseifs.push(ElseIf {
                    else_tok,
                    if_tok,
                    lparen,
                    cond,
                    rparen,
                    branch,
                });
            } else {
                let branch = Box::new(self.stmt()?);
                ebranch = Some((else_tok, branch));
                break;
            }
        }
        Ok(Stmt::If(IfStmt {
            if_tok,
            lparen,
            cond,
            rparen,
            tbranch,
            elseifs,
            ebranch,
        }))
    }

    fn for_stmt(&mut self) -> ParseResult<Stmt> {
        let for_tok = self.expect_kw(Kw::For)?;
        let lparen = self.expect_punct(Punct::LParen)?;
        // The loop header opens a scope so a declared loop variable is
        // visible only inside the loop.
        self.push_scope();
        let init = if self.at_punct(Punct::Semicolon) {
            ForInit::Empty(self.bump())
        } else if self.at_decl_start() {
            let d = self.declaration()?;
            if d.semi.is_none() {
                self.pop_scope();
                return self.err("';'");
            }
            ForInit::Decl(d)
        } else {
            let e = Box::new(self.expr()?);
            let semi = match self.expect_punct(Punct::Semicolon) {
                Ok(s) => s,
                Err(e) => {
                    self.pop_scope();
                    return Err(e);
                }
            };
            ForInit::Expr(e, semi)
        };
        let result = (|| {
            let cond = if self.at_punct(Punct::Semicolon) {
                None
            } else {
                Some(Box::new(self.expr()?))
            };
            let semi2 = self.expect_punct(Punct::Semicolon)?;
            let next = if self.at_punct(Punct::RParen) {
                None
            } else {
                Some(Box::new(self.expr()?))
            };
            let rparen = self.expect_punct(Punct::RParen)?;
            let body = Box::new(self.stmt()?);
            Ok(Stmt::For(ForStmt {
                for_tok,
                lparen,
                init,
                cond,
                semi2,
                next,
                rparen,
                body,
            }))
        })();
        self.pop_scope();
        result
    }

    fn asm_stmt(&mut self) -> ParseResult<Stmt> {
        let asm_tok = self.expect_kw(Kw::Asm)?;
        let mut quals = Vec::new();
        loop {
            if self.at_kw(Kw::Volatile) || self.at_kw(Kw::Inline) || self.at_kw(Kw::Goto) {
                quals.push(self.bump());
            } else {
                break;
            }
        }
        let lparen = self.expect_punct(Punct::LParen)?;
        let template = self.strlit()?;
        let outputs = self.asm_operand_list()?;
        let inputs = self.asm_operand_list()?;
        let clobbers = if self.at_punct(Punct::Colon) {
            let colon = self.bump();
            let mut clobbers = Vec::new();
            if matches!(self.peek().kind, TokenKind::StrLit | TokenKind::WideStrLit) {
                clobbers.push((None, self.bump()));
                while self.at_punct(Punct::Comma) {
                    let comma = self.bump();
                    let c = self.expect_strlit()?;
                    clobbers.push((Some(comma), c));
                }
            }
            Some(AsmClobberList { colon, clobbers })
        } else {
            None
        };
        let labels = if self.at_punct(Punct::Colon) {
            let colon = self.bump();
            let mut labels = Vec::new();
            if self.peek().kind == TokenKind::Ident {
                labels.push((None, self.bump()));
                while self.at_punct(Punct::Comma) {
                    let comma = self.bump();
                    let l = self.expect_ident()?;
                    labels.push((Some(comma), l));
                }
            }
            Some(AsmLabelList { colon, labels })
        } else {
            None
        };
        let rparen = self.expect_punct(Punct::RParen)?;
        let semi = self.expect_punct(Punct::Semicolon)?;
        Ok(Stmt::Asm(AsmStmt {
            asm_tok,
            quals,
            lparen,
            template,
            outputs,
            inputs,
            clobbers,
            labels,
            rparen,
            semi,
        }))
    }

    fn asm_operand_list(&mut self) -> ParseResult<Option<AsmOperandList>> {
        if !self.at_punct(Punct::Colon) {
            return Ok(None);
        }
        // A section introduced by `:` may still be empty; a following `:`
        // or `)` ends it immediately.
        let colon = self.bump();
        let mut ops = Vec::new();
        if !self.at_punct(Punct::Colon) && !self.at_punct(Punct::RParen) {
            let first = self.asm_operand(None)?;
            ops.push(first);
            while self.at_punct(Punct::Comma) {
                let comma = self.bump();
                let op = self.asm_operand(Some(comma))?;
                ops.push(op);
            }
        }
        Ok(Some(AsmOperandList { colon, ops }))
    }

    fn asm_operand(&mut self, comma: Option<TokenId>) -> ParseResult<AsmOperand> {
        let sym = if self.at_punct(Punct::LBracket) {
            let lb = self.bump();
            let id = self.expect_ident()?;
            let rb = self.expect_punct(Punct::RBracket)?;
            Some((lb, id, rb))
        } else {
            None
        };
        let constraint = self.expect_strlit()?;
        let lparen = self.expect_punct(Punct::LParen)?;
        let expr = self.expr()?;
        let rparen = self.expect_punct(Punct::RParen)?;
        Ok(AsmOperand {
            comma,
            sym,
            constraint,
            lparen,
            expr,
            rparen,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer;

    fn parse(src: &str) -> Module {
        let toks = lexer::lex(src, "t.c");
        match parse_module(&toks) {
            Ok(m) => m,
            Err(e) => panic!("parse failed on {:?}: {}", src, e),
        }
    }

    fn parse_err(src: &str) -> ParseError {
        let toks = lexer::lex(src, "t.c");
        parse_module(&toks).expect_err("expected a parse error")
    }

    /// Every non-ignorable token except Eof must be referenced exactly once,
    /// in source order.
    fn check_coverage(src: &str) {
        let toks = lexer::lex(src, "t.c");
        let module = parse_module(&toks).unwrap();
        let mut seen = Vec::new();
        walk_tokens(&module, &mut seen);
        let expected: Vec<_> = toks
            .iter()
            .filter(|(_, t)| !t.kind.is_ignorable() && t.kind != TokenKind::Eof)
            .map(|(id, _)| id)
            .collect();
        assert_eq!(seen, expected, "token coverage mismatch for {:?}", src);
    }

    #[test]
    fn empty_module() {
        let m = parse("");
        assert!(m.decls.is_empty());
    }

    #[test]
    fn simple_function() {
        let m = parse("int f(void) { return 1; }");
        assert_eq!(m.decls.len(), 1);
        match &m.decls[0] {
            GlobalDecl::Ordinary(d) => {
                assert!(d.body.is_some());
                assert_eq!(d.entries.len(), 1);
            }
            _ => panic!("expected ordinary declaration"),
        }
        check_coverage("int f(void) { return 1; }");
    }

    #[test]
    fn globals_and_typedefs() {
        check_coverage("typedef unsigned long ulong_t;\nulong_t x;\nstatic int y = 2;");
        let m = parse("typedef int myint;\nmyint z;");
        assert_eq!(m.decls.len(), 2);
    }

    #[test]
    fn struct_with_bit_fields() {
        let src = "struct S { int x : 3; int y : 5; unsigned : 0; char *name; };";
        let m = parse(src);
        match &m.decls[0] {
            GlobalDecl::Ordinary(d) => match &d.specs.entries[0] {
                SpecEntry::Tspec(Tspec::Record(r)) => {
                    let body = r.body.as_ref().unwrap();
                    assert_eq!(body.members.len(), 4);
                    assert!(body.members[0].decls[0].bitwidth.is_some());
                    // The anonymous zero-width field has no declarator.
                    assert!(matches!(body.members[2].decls[0].decl, Declarator::Anon));
                }
                _ => panic!("expected record specifier"),
            },
            _ => panic!("expected ordinary declaration"),
        }
        check_coverage(src);
    }

    #[test]
    fn enums() {
        check_coverage("enum e { A, B = 2, C, };");
        check_coverage("enum { X } v;");
    }

    #[test]
    fn expressions() {
        check_coverage("int x = 1 + 2 * 3 - (4 >> 1) % 5;");
        check_coverage("int y = a ? b : c;");
        check_coverage("int z = f(1, 2)[3].m->n++;");
        check_coverage("int w = sizeof (int) + sizeof x;");
        check_coverage("char *s = \"a\" \"b\";");
        check_coverage("int c = (int)'x' + (unsigned char)255;");
    }

    #[test]
    fn statements() {
        let src = "void f(int n)\n{\n\tint i;\n\tfor (i = 0; i < n; i++) {\n\t\tif (i == 2)\n\t\t\tcontinue;\n\t\telse if (i == 3)\n\t\t\tbreak;\n\t}\n\twhile (n > 0)\n\t\tn--;\n\tdo {\n\t\tn++;\n\t} while (n < 4);\n}\n";
        parse(src);
        check_coverage(src);
    }

    #[test]
    fn switch_and_goto() {
        let src = "int f(int x)\n{\n\tswitch (x) {\n\tcase 1:\n\t\treturn 1;\n\tcase 2:\n\tdefault:\n\t\tgoto out;\n\t}\nout:\n\treturn 0;\n}\n";
        parse(src);
        check_coverage(src);
    }

    #[test]
    fn for_loop_declaration_scope() {
        check_coverage("void f(void) { for (int i = 0; i < 8; ++i) { } }");
    }

    #[test]
    fn pointers_and_arrays() {
        check_coverage("int *p, **q, a[10], m[2][3];");
        check_coverage("int (*fp)(int, char *);");
        check_coverage("void g(int (*cb)(void), int n);");
    }

    #[test]
    fn variadic_and_va_arg() {
        let src = "int sum(int n, ...)\n{\n\t__va_list ap;\n\t__va_start(ap, n);\n\tint v = __va_arg(ap, int);\n\t__va_end(ap);\n\treturn v;\n}\n";
        parse(src);
        check_coverage(src);
    }

    #[test]
    fn attributes() {
        check_coverage("int x __attribute__((unused));");
        check_coverage("struct __attribute__((packed)) P { char c; };");
        check_coverage("void f(void) __attribute__((noreturn, aligned(2)));");
    }

    #[test]
    fn designated_initializers() {
        check_coverage("struct P { int x; int y; };\nstruct P p = { .x = 1, .y = 2 };");
        check_coverage("int a[4] = { [0] = 1, [2] = 3, };");
    }

    #[test]
    fn compound_literal() {
        check_coverage("struct P { int x; };\nvoid f(void) { g((struct P){ .x = 1 }); }");
    }

    #[test]
    fn extern_c_group() {
        let src = "extern \"C\" {\nint f(void);\n}\n";
        let m = parse(src);
        assert!(matches!(m.decls[0], GlobalDecl::ExternC(_)));
        check_coverage(src);
    }

    #[test]
    fn macro_based_declaration() {
        let src = "DEFINE_SPINLOCK(my_lock);\nint x;";
        let m = parse(src);
        assert!(matches!(m.decls[0], GlobalDecl::MacroBased(_)));
        check_coverage(src);
    }

    #[test]
    fn loop_macro_statement() {
        let src = "void f(void)\n{\n\tlist_foreach(list, link) {\n\t\tg(link);\n\t}\n}\n";
        let m = parse(src);
        match &m.decls[0] {
            GlobalDecl::Ordinary(d) => {
                let body = d.body.as_ref().unwrap();
                assert!(matches!(body.stmts[0], Stmt::LoopMacro(_)));
            }
            _ => panic!(),
        }
        check_coverage(src);
    }

    #[test]
    fn extended_asm() {
        let src = "void f(void)\n{\n\tasm volatile (\"di\" : : : \"memory\");\n\tasm (\"ld a, %0\" : \"=r\" (x) : \"r\" (y));\n}\n";
        parse(src);
        check_coverage(src);
    }

    #[test]
    fn error_reports_position_and_expectation() {
        let e = parse_err("int f(void) { return 1 }");
        assert!(e.message.contains("expected"), "{}", e.message);
        assert!(e.to_string().contains(':'), "{}", e);
        let e = parse_err("int x = ;");
        assert!(e.message.contains("expression"), "{}", e.message);
    }

    #[test]
    fn error_on_unterminated_block() {
        parse_err("int f(void) {");
    }
}
