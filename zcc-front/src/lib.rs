//! C front end for the zcc compiler.
//!
//! This crate turns preprocessed C source text into an abstract syntax tree in
//! two stages. The lexer produces a lossless stream of classified tokens:
//! whitespace, comments and preprocessor lines are tokens in their own right,
//! and concatenating the text of every token reproduces the input byte for
//! byte. The parser consumes that stream and builds a tree of tagged nodes,
//! each of which records the index of every token it fixed in place, so a
//! pre-order walk of the tree visits the significant tokens in source order.
//!
//! Nothing in this crate knows about types or code generation; semantic
//! analysis lives in `zcc-codegen`, and the whitespace style checker that
//! shares this front end lives in `zcc-check`.

#![deny(trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces, missing_docs)]

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod srcpos;
pub mod token;

pub use crate::lexer::Lexer;
pub use crate::parser::{parse_module, ParseError, ParseResult};
pub use crate::srcpos::{Pos, Span};
pub use crate::token::{Token, TokenId, TokenKind, Tokens};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
