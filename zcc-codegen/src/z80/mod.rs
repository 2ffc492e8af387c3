//! The Z80 backend.
//!
//! The backend lowers the typed IR into Z80-IC, a representation holding
//! both concrete Z80 instructions over physical registers and
//! pseudo-instructions over virtual registers, then assigns virtual
//! registers to physical register pairs or stack-frame slots, runs a
//! trivial peephole pass and prints Zilog-style assembly.
//!
//! The stages mirror the pipeline: `argloc` decides where procedure
//! arguments live, `isel` selects instructions, `ralloc` eliminates the
//! virtual-register tier, `peephole` tidies the result and `emit` renders
//! the text.

pub mod argloc;
pub mod emit;
pub mod ic;
pub mod isel;
pub mod peephole;
pub mod ralloc;

pub use self::argloc::{allocate_args, ArgEntry, ArgLocMap, RegSlot, SlotPart};
pub use self::emit::emit_module;
pub use self::ic::{Cond, Instr, Module as IcModule, Proc as IcProc, Reg, Reg16};
pub use self::isel::select_module;
pub use self::peephole::peephole_module;
pub use self::ralloc::allocate_module;

use crate::error::CodegenResult;

/// Run the whole backend: instruction selection, register allocation,
/// peephole cleanup and assembly output.
pub fn compile(ir: &crate::ir::Module) -> CodegenResult<String> {
    let mut ic = select_module(ir)?;
    allocate_module(&mut ic)?;
    peephole_module(&mut ic);
    Ok(emit_module(&ic))
}
