//! Token definitions and the token stream.
//!
//! Tokens are classified by a closed set of kind tags and keep the exact
//! source text they were lexed from, so the stream can losslessly re-emit
//! the input. The stream owns its tokens in a dense vector; everything
//! downstream refers to a token by its `TokenId` index. The index plays the
//! role a doubly linked list would otherwise play: neighbours are the
//! adjacent indices, and the style checker walks the stream linearly.

use crate::srcpos::Span;
use core::fmt;

/// A C keyword, including the GCC-style extensions the parser accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Kw {
    Asm,
    Atomic,
    Attribute,
    Auto,
    Bool,
    Break,
    Case,
    Char,
    Const,
    Continue,
    Default,
    Do,
    Double,
    Else,
    Enum,
    Extern,
    Float,
    For,
    Goto,
    If,
    Inline,
    Int,
    Long,
    Register,
    Restrict,
    Return,
    Short,
    Signed,
    Sizeof,
    Static,
    Struct,
    Switch,
    Typedef,
    Union,
    Unsigned,
    VaArg,
    VaCopy,
    VaEnd,
    VaStart,
    VaList,
    Void,
    Volatile,
    While,
}

impl Kw {
    /// Classify an identifier spelling as a keyword.
    pub fn from_str(s: &str) -> Option<Self> {
        let kw = match s {
            "asm" | "__asm__" => Self::Asm,
            "_Atomic" => Self::Atomic,
            "__attribute__" => Self::Attribute,
            "auto" => Self::Auto,
            "_Bool" => Self::Bool,
            "break" => Self::Break,
            "case" => Self::Case,
            "char" => Self::Char,
            "const" | "__const" => Self::Const,
            "continue" => Self::Continue,
            "default" => Self::Default,
            "do" => Self::Do,
            "double" => Self::Double,
            "else" => Self::Else,
            "enum" => Self::Enum,
            "extern" => Self::Extern,
            "float" => Self::Float,
            "for" => Self::For,
            "goto" => Self::Goto,
            "if" => Self::If,
            "inline" | "__inline" => Self::Inline,
            "int" => Self::Int,
            "long" => Self::Long,
            "register" => Self::Register,
            "restrict" | "__restrict" | "__restrict__" => Self::Restrict,
            "return" => Self::Return,
            "short" => Self::Short,
            "signed" | "__signed__" => Self::Signed,
            "sizeof" => Self::Sizeof,
            "static" => Self::Static,
            "struct" => Self::Struct,
            "switch" => Self::Switch,
            "typedef" => Self::Typedef,
            "union" => Self::Union,
            "unsigned" => Self::Unsigned,
            "__va_arg" => Self::VaArg,
            "__va_copy" => Self::VaCopy,
            "__va_end" => Self::VaEnd,
            "__va_start" => Self::VaStart,
            "__va_list" => Self::VaList,
            "void" => Self::Void,
            "volatile" => Self::Volatile,
            "while" => Self::While,
            _ => return None,
        };
        Some(kw)
    }

    /// The canonical spelling of the keyword.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asm => "asm",
            Self::Atomic => "_Atomic",
            Self::Attribute => "__attribute__",
            Self::Auto => "auto",
            Self::Bool => "_Bool",
            Self::Break => "break",
            Self::Case => "case",
            Self::Char => "char",
            Self::Const => "const",
            Self::Continue => "continue",
            Self::Default => "default",
            Self::Do => "do",
            Self::Double => "double",
            Self::Else => "else",
            Self::Enum => "enum",
            Self::Extern => "extern",
            Self::Float => "float",
            Self::For => "for",
            Self::Goto => "goto",
            Self::If => "if",
            Self::Inline => "inline",
            Self::Int => "int",
            Self::Long => "long",
            Self::Register => "register",
            Self::Restrict => "restrict",
            Self::Return => "return",
            Self::Short => "short",
            Self::Signed => "signed",
            Self::Sizeof => "sizeof",
            Self::Static => "static",
            Self::Struct => "struct",
            Self::Switch => "switch",
            Self::Typedef => "typedef",
            Self::Union => "union",
            Self::Unsigned => "unsigned",
            Self::VaArg => "__va_arg",
            Self::VaCopy => "__va_copy",
            Self::VaEnd => "__va_end",
            Self::VaStart => "__va_start",
            Self::VaList => "__va_list",
            Self::Void => "void",
            Self::Volatile => "volatile",
            Self::While => "while",
        }
    }
}

impl fmt::Display for Kw {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A punctuator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Punct {
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Semicolon,
    Comma,
    Colon,
    Question,
    Ellipsis,
    Period,
    Arrow,
    Inc,
    Dec,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Not,
    Shl,
    Shr,
    Lt,
    Gt,
    LtEq,
    GtEq,
    EqEq,
    NotEq,
    AmpAmp,
    PipePipe,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    PercentAssign,
    AmpAssign,
    PipeAssign,
    CaretAssign,
    ShlAssign,
    ShrAssign,
}

impl Punct {
    /// The spelling of the punctuator.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LParen => "(",
            Self::RParen => ")",
            Self::LBrace => "{",
            Self::RBrace => "}",
            Self::LBracket => "[",
            Self::RBracket => "]",
            Self::Semicolon => ";",
            Self::Comma => ",",
            Self::Colon => ":",
            Self::Question => "?",
            Self::Ellipsis => "...",
            Self::Period => ".",
            Self::Arrow => "->",
            Self::Inc => "++",
            Self::Dec => "--",
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Star => "*",
            Self::Slash => "/",
            Self::Percent => "%",
            Self::Amp => "&",
            Self::Pipe => "|",
            Self::Caret => "^",
            Self::Tilde => "~",
            Self::Not => "!",
            Self::Shl => "<<",
            Self::Shr => ">>",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::LtEq => "<=",
            Self::GtEq => ">=",
            Self::EqEq => "==",
            Self::NotEq => "!=",
            Self::AmpAmp => "&&",
            Self::PipePipe => "||",
            Self::Assign => "=",
            Self::PlusAssign => "+=",
            Self::MinusAssign => "-=",
            Self::StarAssign => "*=",
            Self::SlashAssign => "/=",
            Self::PercentAssign => "%=",
            Self::AmpAssign => "&=",
            Self::PipeAssign => "|=",
            Self::CaretAssign => "^=",
            Self::ShlAssign => "<<=",
            Self::ShrAssign => ">>=",
        }
    }
}

impl fmt::Display for Punct {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind tag of a token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// An identifier that is not a keyword.
    Ident,
    /// A keyword.
    Keyword(Kw),
    /// An integer literal, suffixes included.
    IntLit,
    /// A character constant, quotes included.
    CharLit,
    /// A string literal, quotes included. Escapes are not decoded.
    StrLit,
    /// A wide string literal (`L"..."`).
    WideStrLit,
    /// A punctuator.
    Punct(Punct),
    /// A run of space characters.
    Space,
    /// A run of tab characters.
    Tab,
    /// A single line break (`\n` or `\r\n`).
    Newline,
    /// A `/* ... */` comment.
    BlockComment,
    /// A `// ...` comment, line break not included.
    LineComment,
    /// A preprocessor line (`#...`), line break not included.
    Preproc,
    /// A run of characters the lexer could not classify.
    Invalid,
    /// End of input. Always the last token of a stream; its text is empty.
    Eof,
}

impl TokenKind {
    /// Is this one of the whitespace kinds?
    pub fn is_whitespace(self) -> bool {
        matches!(self, Self::Space | Self::Tab | Self::Newline)
    }

    /// Is this a token the parser skips over: whitespace, a comment or a
    /// leftover preprocessor line?
    pub fn is_ignorable(self) -> bool {
        matches!(
            self,
            Self::Space
                | Self::Tab
                | Self::Newline
                | Self::BlockComment
                | Self::LineComment
                | Self::Preproc
        )
    }
}

/// A single token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    /// Kind tag.
    pub kind: TokenKind,
    /// The exact source text of the token, continuations included.
    pub text: String,
    /// Where the token begins and ends.
    pub span: Span,
}

impl Token {
    /// Shorthand for the begin position of the token.
    pub fn pos(&self) -> crate::srcpos::Pos {
        self.span.begin
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// An index of a token in its stream.
///
/// AST nodes store these instead of references so that the tree and the
/// stream can be owned independently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TokenId(u32);

impl TokenId {
    /// Create a token index from a raw vector index.
    pub fn new(index: usize) -> Self {
        debug_assert!(index < u32::MAX as usize);
        Self(index as u32)
    }

    /// The raw vector index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// A lexed translation unit: the file name and the complete token sequence,
/// terminated by an `Eof` token.
#[derive(Clone, Debug, Default)]
pub struct Tokens {
    /// Name of the file the stream was lexed from, for diagnostics.
    pub file: String,
    toks: Vec<Token>,
}

impl Tokens {
    /// Create an empty stream for the named file.
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            toks: Vec::new(),
        }
    }

    /// Append a token, returning its index.
    pub fn push(&mut self, tok: Token) -> TokenId {
        let id = TokenId::new(self.toks.len());
        self.toks.push(tok);
        id
    }

    /// Number of tokens, the final `Eof` included.
    pub fn len(&self) -> usize {
        self.toks.len()
    }

    /// Is the stream empty?
    pub fn is_empty(&self) -> bool {
        self.toks.is_empty()
    }

    /// Look a token up by index.
    pub fn get(&self, id: TokenId) -> &Token {
        &self.toks[id.index()]
    }

    /// Mutable access to a token; used by the style checker's fix mode to
    /// rewrite whitespace.
    pub fn get_mut(&mut self, id: TokenId) -> &mut Token {
        &mut self.toks[id.index()]
    }

    /// Iterate over `(id, token)` pairs in stream order.
    pub fn iter(&self) -> impl Iterator<Item = (TokenId, &Token)> {
        self.toks
            .iter()
            .enumerate()
            .map(|(i, t)| (TokenId::new(i), t))
    }

    /// Reconstruct the source text by concatenating every token's text.
    pub fn source(&self) -> String {
        let mut out = String::new();
        for tok in &self.toks {
            out.push_str(&tok.text);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::srcpos::{Pos, Span};

    #[test]
    fn keyword_classification() {
        assert_eq!(Kw::from_str("while"), Some(Kw::While));
        assert_eq!(Kw::from_str("__attribute__"), Some(Kw::Attribute));
        assert_eq!(Kw::from_str("__va_arg"), Some(Kw::VaArg));
        assert_eq!(Kw::from_str("whilex"), None);
        assert_eq!(Kw::from_str(""), None);
        assert_eq!(Kw::While.as_str(), "while");
    }

    #[test]
    fn ignorable_kinds() {
        assert!(TokenKind::Space.is_ignorable());
        assert!(TokenKind::BlockComment.is_ignorable());
        assert!(TokenKind::Preproc.is_ignorable());
        assert!(!TokenKind::Ident.is_ignorable());
        assert!(!TokenKind::Eof.is_ignorable());
        assert!(TokenKind::Tab.is_whitespace());
        assert!(!TokenKind::LineComment.is_whitespace());
    }

    #[test]
    fn stream_roundtrip() {
        let mut toks = Tokens::new("t.c");
        let span = Span::new(Pos::start(), Pos::new(1, 4));
        toks.push(Token {
            kind: TokenKind::Keyword(Kw::Int),
            text: "int".to_string(),
            span,
        });
        toks.push(Token {
            kind: TokenKind::Space,
            text: " ".to_string(),
            span,
        });
        toks.push(Token {
            kind: TokenKind::Ident,
            text: "x".to_string(),
            span,
        });
        assert_eq!(toks.source(), "int x");
        assert_eq!(toks.len(), 3);
        assert_eq!(toks.get(TokenId::new(2)).text, "x");
    }
}
