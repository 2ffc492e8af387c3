//! Code generator for the zcc C-to-Z80 compiler.
//!
//! This crate contains everything between the parsed syntax tree and the
//! emitted assembly text:
//!
//! - the semantic type system (`types`, `records`, `scope`) and the
//!   AST-to-IR generator (`cgen`);
//! - the typed intermediate representation (`ir`) with its text format and
//!   validity checker (`verify`);
//! - the Z80 backend (`z80`): the Z80-IC instruction model, the
//!   argument-location allocator, instruction selection, linear-scan
//!   register allocation, a trivial peephole pass and the assembly writer.
//!
//! The pipeline is strictly staged: each stage consumes the artefact of the
//! previous one and either completes or fails with a positioned error.

#![deny(trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces, missing_docs)]

pub mod cgen;
pub mod error;
pub mod ir;
pub mod records;
pub mod scope;
pub mod types;
pub mod verify;
pub mod z80;

pub use crate::cgen::generate;
pub use crate::error::{CodegenError, CodegenResult};
pub use crate::verify::verify_module;

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
