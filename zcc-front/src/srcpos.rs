//! Source position bookkeeping.
//!
//! Every token carries the position where it begins and the position just
//! past its last character. Positions are line and column numbers only; the
//! file name belongs to the token stream as a whole, since a translation
//! unit is always lexed from a single preprocessed input.

use core::fmt;

/// A position in the source text.
///
/// Lines and columns are 1-based, matching the `file:line:col` convention
/// diagnostics are printed in. Columns count characters, with a tab counting
/// as a single character.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pos {
    /// 1-based line number.
    pub line: u32,
    /// 1-based column number.
    pub col: u32,
}

impl Pos {
    /// Create a position from explicit line and column numbers.
    pub fn new(line: u32, col: u32) -> Self {
        Self { line, col }
    }

    /// The position of the first character of the input.
    pub fn start() -> Self {
        Self { line: 1, col: 1 }
    }
}

impl Default for Pos {
    fn default() -> Self {
        Self::start()
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// A contiguous region of the source text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Hash)]
pub struct Span {
    /// Position of the first character.
    pub begin: Pos,
    /// Position just past the last character.
    pub end: Pos,
}

impl Span {
    /// Create a span from its begin and end positions.
    pub fn new(begin: Pos, end: Pos) -> Self {
        Self { begin, end }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.begin.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(Pos::new(3, 14).to_string(), "3:14");
        assert_eq!(Pos::start().to_string(), "1:1");
        let span = Span::new(Pos::new(2, 1), Pos::new(2, 8));
        assert_eq!(span.to_string(), "2:1");
    }

    #[test]
    fn ordering() {
        assert!(Pos::new(1, 9) < Pos::new(2, 1));
        assert!(Pos::new(4, 2) < Pos::new(4, 3));
    }
}
