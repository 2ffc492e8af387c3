//! The `zcc` command-line driver.
//!
//! One mode per invocation: lex, parse, IR dump, Z80-IC dump, assembly
//! output (the default), or the style checker's check and fix modes. Input
//! comes from a file or standard input; output goes to standard output or
//! `-o`. Exit code 0 on success, nonzero on any error.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::Read;
use std::path::PathBuf;
use zcc_cli::{run, Mode};

#[derive(Parser)]
#[command(name = "zcc", version, about = "C compiler for the Z80 and style checker")]
struct Args {
    /// Input file; `-` reads standard input.
    input: PathBuf,

    /// Output file; standard output when absent.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Dump the token stream and stop.
    #[arg(long, conflicts_with_all = ["parse", "ir", "ic", "check", "fix"])]
    lex: bool,

    /// Parse only; report syntax errors and stop.
    #[arg(long, conflicts_with_all = ["ir", "ic", "check", "fix"])]
    parse: bool,

    /// Print the typed intermediate representation.
    #[arg(long, conflicts_with_all = ["ic", "check", "fix"])]
    ir: bool,

    /// Print the Z80 instruction code before register allocation.
    #[arg(long, conflicts_with_all = ["check", "fix"])]
    ic: bool,

    /// Report style violations.
    #[arg(long, conflicts_with = "fix")]
    check: bool,

    /// Rewrite whitespace style violations.
    #[arg(long)]
    fix: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let (file, source) = if args.input.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("reading standard input")?;
        ("<stdin>".to_string(), buf)
    } else {
        let name = args.input.display().to_string();
        let text = std::fs::read_to_string(&args.input)
            .with_context(|| format!("reading {}", name))?;
        (name, text)
    };

    let mode = if args.lex {
        Mode::Lex
    } else if args.parse {
        Mode::Parse
    } else if args.ir {
        Mode::Ir
    } else if args.ic {
        Mode::Ic
    } else if args.check {
        Mode::Check
    } else if args.fix {
        Mode::Fix
    } else {
        Mode::Asm
    };

    let out = run(mode, &file, &source)?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, out).with_context(|| format!("writing {}", path.display()))?
        }
        None => print!("{}", out),
    }
    Ok(())
}
