//! Code generation errors.
//!
//! Every fallible operation of this crate returns one of a small closed set
//! of error kinds. All kinds except out-of-memory (which is left to the
//! allocator) carry the source position the problem was detected at, so the
//! driver can print a `file:line:col` diagnostic. Generation stops at the
//! first hard error; there is no recovery.

use thiserror::Error;
use zcc_front::srcpos::Pos;

/// A code generation error.
#[derive(Debug, Error)]
pub enum CodegenError {
    /// An I/O failure while writing output.
    #[error("{0}: I/O failure: {1}")]
    Io(Pos, String),

    /// A name lookup failed.
    #[error("{0}: '{1}' is not declared")]
    NotFound(Pos, String),

    /// A name is already declared in the same scope and namespace.
    #[error("{0}: '{1}' is already declared")]
    AlreadyExists(Pos, String),

    /// Malformed input: a semantic rule is violated.
    #[error("{0}: {1}")]
    InvalidInput(Pos, String),

    /// A construct beyond the supported subset.
    #[error("{0}: unsupported: {1}")]
    Unsupported(Pos, String),
}

impl CodegenError {
    /// The position the error is attached to.
    pub fn pos(&self) -> Pos {
        match self {
            Self::Io(p, _)
            | Self::NotFound(p, _)
            | Self::AlreadyExists(p, _)
            | Self::InvalidInput(p, _)
            | Self::Unsupported(p, _) => *p,
        }
    }
}

/// A convenient alias for `Result` with `CodegenError`.
pub type CodegenResult<T> = Result<T, CodegenError>;
