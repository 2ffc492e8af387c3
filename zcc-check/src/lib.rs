//! Whitespace and indentation style checker for C sources.
//!
//! The checker reuses the `zcc-front` lexer and parser: a recursive walk of
//! the syntax tree decides, for every significant token, whether it must
//! begin a physical line and at which indentation level, and a linear pass
//! over the lossless token stream then either reports violations (check
//! mode) or rewrites the whitespace between tokens (fix mode). Non-
//! whitespace tokens are preserved byte for byte, fixing is idempotent, and
//! a fixed file checks clean.

#![deny(trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces, missing_docs)]

mod style;

pub use crate::style::{check, fix, Violation};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
