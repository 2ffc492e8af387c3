//! Library support for the `zcc` command-line driver.
//!
//! The pipeline plumbing lives here so both the binary and the end-to-end
//! tests can run it: read a preprocessed C source, lex, parse, generate IR
//! and run the Z80 backend, stopping at whichever stage the chosen mode
//! asks for. The real work happens in `zcc-front`, `zcc-codegen` and
//! `zcc-check`; this crate only wires them together.

#![deny(trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

use anyhow::{bail, Context, Result};
use zcc_codegen::z80;
use zcc_front::token::TokenKind;

/// What a single invocation should produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Dump the token stream.
    Lex,
    /// Parse and report success.
    Parse,
    /// Print the typed IR.
    Ir,
    /// Print the Z80-IC before register allocation.
    Ic,
    /// Emit assembly (the default).
    Asm,
    /// Report style violations.
    Check,
    /// Rewrite whitespace in place of reporting.
    Fix,
}

/// Run one translation unit through the pipeline and return the output
/// text for the mode.
pub fn run(mode: Mode, file: &str, source: &str) -> Result<String> {
    let toks = zcc_front::lexer::lex(source, file);

    if mode == Mode::Lex {
        let mut out = String::new();
        for (_, tok) in toks.iter() {
            out.push_str(&format!("{}: {:?} {:?}\n", tok.pos(), tok.kind, tok.text));
        }
        return Ok(out);
    }

    // Invalid tokens abort before the parser trips over them.
    for (_, tok) in toks.iter() {
        if tok.kind == TokenKind::Invalid {
            bail!("{}:{}: unexpected character {:?}", file, tok.pos(), tok.text);
        }
    }

    let module = zcc_front::parser::parse_module(&toks)
        .map_err(|e| anyhow::anyhow!("{}:{}", file, e))?;

    match mode {
        Mode::Parse => return Ok(String::new()),
        Mode::Check => {
            let violations = zcc_check::check(&toks, &module);
            let mut out = String::new();
            for v in &violations {
                out.push_str(&format!("{}:{}\n", file, v));
            }
            if !violations.is_empty() {
                // The caller prints the report and exits nonzero.
                bail!("{}", out.trim_end());
            }
            return Ok(out);
        }
        Mode::Fix => return Ok(zcc_check::fix(&toks, &module)),
        _ => {}
    }

    let (ir, _records) = zcc_codegen::generate(&toks, &module)
        .map_err(|e| anyhow::anyhow!("{}:{}", file, e))?;
    zcc_codegen::verify_module(&ir).context("internal error: generated IR is invalid")?;

    match mode {
        Mode::Ir => Ok(ir.to_string()),
        Mode::Ic => {
            let ic = z80::select_module(&ir).map_err(|e| anyhow::anyhow!("{}:{}", file, e))?;
            Ok(ic.to_string())
        }
        _ => z80::compile(&ir).map_err(|e| anyhow::anyhow!("{}:{}", file, e)),
    }
}
