//! The C lexer.
//!
//! The lexer turns preprocessed source text into a finite stream of tokens
//! terminated by an `Eof` token. It is lossless: whitespace, comments and
//! leftover preprocessor lines become tokens of their own kind, and every
//! token keeps the exact source text it was read from, so concatenating the
//! stream reproduces the input byte for byte.
//!
//! Backslash-newline continuations are collapsed at the lowest level of the
//! scanner: the two (or three, for CRLF) bytes are absorbed into the text of
//! whatever token is being scanned, and the logical character stream simply
//! never sees them. Errors do not abort lexing; an invalid character or an
//! unterminated literal yields an `Invalid` token carrying the offending run,
//! and it is the caller's decision to stop.

use crate::srcpos::{Pos, Span};
use crate::token::{Kw, Punct, Token, TokenKind, Tokens};

/// Lexer state over a complete source text.
pub struct Lexer<'a> {
    src: &'a str,
    off: usize,
    pos: Pos,
    line_has_content: bool,
    eof_emitted: bool,
}

/// Lex a whole translation unit into a token stream.
pub fn lex(src: &str, file: impl Into<String>) -> Tokens {
    let mut toks = Tokens::new(file);
    for tok in Lexer::new(src) {
        toks.push(tok);
    }
    toks
}

impl<'a> Lexer<'a> {
    /// Create a lexer over `src`.
    pub fn new(src: &'a str) -> Self {
        Self {
            src,
            off: 0,
            pos: Pos::start(),
            line_has_content: false,
            eof_emitted: false,
        }
    }

    fn bytes(&self) -> &'a [u8] {
        self.src.as_bytes()
    }

    /// Length in bytes of the backslash-newline continuation at `off`, or 0.
    fn splice_len(&self, off: usize) -> usize {
        let b = self.bytes();
        if b.get(off) != Some(&b'\\') {
            return 0;
        }
        match b.get(off + 1) {
            Some(b'\n') => 2,
            Some(b'\r') if b.get(off + 2) == Some(&b'\n') => 3,
            _ => 0,
        }
    }

    /// The next logical byte, looking through continuations, without
    /// consuming anything.
    fn peek(&self) -> Option<u8> {
        self.peek_at(0)
    }

    /// The logical byte `n` positions ahead.
    fn peek_at(&self, n: usize) -> Option<u8> {
        let mut off = self.off;
        let mut left = n;
        loop {
            let sp = self.splice_len(off);
            if sp > 0 {
                off += sp;
                continue;
            }
            let b = *self.bytes().get(off)?;
            if left == 0 {
                return Some(b);
            }
            left -= 1;
            off += 1;
        }
    }

    /// Consume and return the next logical byte, updating the position.
    fn bump(&mut self) -> Option<u8> {
        loop {
            let sp = self.splice_len(self.off);
            if sp == 0 {
                break;
            }
            self.off += sp;
            self.pos.line += 1;
            self.pos.col = 1;
        }
        let b = *self.bytes().get(self.off)?;
        self.off += 1;
        if b == b'\n' {
            self.pos.line += 1;
            self.pos.col = 1;
        } else {
            self.pos.col += 1;
        }
        Some(b)
    }

    /// Consume the next byte if it equals `want`.
    fn eat(&mut self, want: u8) -> bool {
        if self.peek() == Some(want) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn make(&self, kind: TokenKind, start_off: usize, begin: Pos) -> Token {
        Token {
            kind,
            text: self.src[start_off..self.off].to_string(),
            span: Span::new(begin, self.pos),
        }
    }

    /// Scan the next token. Returns `None` once the `Eof` token has been
    /// produced.
    fn scan(&mut self) -> Option<Token> {
        if self.eof_emitted {
            return None;
        }
        let start_off = self.off;
        let begin = self.pos;

        let first = match self.peek() {
            Some(b) => b,
            None => {
                // A trailing continuation can leave raw bytes before the end
                // of input; keep them on the Eof token so round-trip holds.
                self.off = self.src.len();
                self.eof_emitted = true;
                return Some(self.make(TokenKind::Eof, start_off, begin));
            }
        };

        let tok = match first {
            b' ' => {
                while self.eat(b' ') {}
                self.make(TokenKind::Space, start_off, begin)
            }
            b'\t' => {
                while self.eat(b'\t') {}
                self.make(TokenKind::Tab, start_off, begin)
            }
            b'\n' => {
                self.bump();
                self.make(TokenKind::Newline, start_off, begin)
            }
            b'\r' => {
                self.bump();
                self.eat(b'\n');
                self.make(TokenKind::Newline, start_off, begin)
            }
            b'/' if self.peek_at(1) == Some(b'*') => self.scan_block_comment(start_off, begin),
            b'/' if self.peek_at(1) == Some(b'/') => {
                while let Some(b) = self.peek() {
                    if b == b'\n' || b == b'\r' {
                        break;
                    }
                    self.bump();
                }
                self.make(TokenKind::LineComment, start_off, begin)
            }
            b'#' if !self.line_has_content => {
                while let Some(b) = self.peek() {
                    if b == b'\n' || b == b'\r' {
                        break;
                    }
                    self.bump();
                }
                self.make(TokenKind::Preproc, start_off, begin)
            }
            b'L' if self.peek_at(1) == Some(b'"') => {
                self.bump();
                self.scan_quoted(b'"', TokenKind::WideStrLit, start_off, begin)
            }
            b'A'..=b'Z' | b'a'..=b'z' | b'_' => {
                while let Some(b) = self.peek() {
                    if b.is_ascii_alphanumeric() || b == b'_' {
                        self.bump();
                    } else {
                        break;
                    }
                }
                let text = &self.src[start_off..self.off];
                let kind = match Kw::from_str(&strip_splices(text)) {
                    Some(kw) => TokenKind::Keyword(kw),
                    None => TokenKind::Ident,
                };
                self.make(kind, start_off, begin)
            }
            b'0'..=b'9' => {
                // Integer literals: decimal, hex and octal forms with any
                // u/l/ll suffix combination. The run is cut like a
                // preprocessing number; bad spellings are caught during
                // semantic analysis.
                while let Some(b) = self.peek() {
                    if b.is_ascii_alphanumeric() || b == b'_' {
                        self.bump();
                    } else {
                        break;
                    }
                }
                self.make(TokenKind::IntLit, start_off, begin)
            }
            b'\'' => self.scan_quoted(b'\'', TokenKind::CharLit, start_off, begin),
            b'"' => self.scan_quoted(b'"', TokenKind::StrLit, start_off, begin),
            _ => match self.scan_punct() {
                Some(p) => self.make(TokenKind::Punct(p), start_off, begin),
                None => {
                    self.bump();
                    self.make(TokenKind::Invalid, start_off, begin)
                }
            },
        };

        match tok.kind {
            TokenKind::Newline => self.line_has_content = false,
            TokenKind::Space | TokenKind::Tab => {}
            _ => self.line_has_content = true,
        }
        Some(tok)
    }

    fn scan_block_comment(&mut self, start_off: usize, begin: Pos) -> Token {
        self.bump();
        self.bump();
        loop {
            match self.bump() {
                Some(b'*') if self.peek() == Some(b'/') => {
                    self.bump();
                    return self.make(TokenKind::BlockComment, start_off, begin);
                }
                Some(_) => {}
                None => return self.make(TokenKind::Invalid, start_off, begin),
            }
        }
    }

    /// Scan a character constant or string literal. The closing quote must
    /// appear on the same logical line; escape sequences are skipped over but
    /// not decoded.
    fn scan_quoted(&mut self, quote: u8, kind: TokenKind, start_off: usize, begin: Pos) -> Token {
        self.bump();
        loop {
            match self.peek() {
                Some(b) if b == quote => {
                    self.bump();
                    return self.make(kind, start_off, begin);
                }
                Some(b'\n') | Some(b'\r') | None => {
                    return self.make(TokenKind::Invalid, start_off, begin);
                }
                Some(b'\\') => {
                    self.bump();
                    self.bump();
                }
                Some(_) => {
                    self.bump();
                }
            }
        }
    }

    /// Greedy longest-match punctuator scan. Consumes nothing on failure.
    fn scan_punct(&mut self) -> Option<Punct> {
        let p = match self.peek()? {
            b'(' => Punct::LParen,
            b')' => Punct::RParen,
            b'{' => Punct::LBrace,
            b'}' => Punct::RBrace,
            b'[' => Punct::LBracket,
            b']' => Punct::RBracket,
            b';' => Punct::Semicolon,
            b',' => Punct::Comma,
            b'?' => Punct::Question,
            b'~' => Punct::Tilde,
            b':' => Punct::Colon,
            b'.' => {
                if self.peek_at(1) == Some(b'.') && self.peek_at(2) == Some(b'.') {
                    self.bump();
                    self.bump();
                    Punct::Ellipsis
                } else {
                    Punct::Period
                }
            }
            b'+' => {
                self.bump();
                return Some(if self.eat(b'+') {
                    Punct::Inc
                } else if self.eat(b'=') {
                    Punct::PlusAssign
                } else {
                    Punct::Plus
                });
            }
            b'-' => {
                self.bump();
                return Some(if self.eat(b'-') {
                    Punct::Dec
                } else if self.eat(b'=') {
                    Punct::MinusAssign
                } else if self.eat(b'>') {
                    Punct::Arrow
                } else {
                    Punct::Minus
                });
            }
            b'*' => {
                self.bump();
                return Some(if self.eat(b'=') {
                    Punct::StarAssign
                } else {
                    Punct::Star
                });
            }
            b'/' => {
                self.bump();
                return Some(if self.eat(b'=') {
                    Punct::SlashAssign
                } else {
                    Punct::Slash
                });
            }
            b'%' => {
                self.bump();
                return Some(if self.eat(b'=') {
                    Punct::PercentAssign
                } else {
                    Punct::Percent
                });
            }
            b'&' => {
                self.bump();
                return Some(if self.eat(b'&') {
                    Punct::AmpAmp
                } else if self.eat(b'=') {
                    Punct::AmpAssign
                } else {
                    Punct::Amp
                });
            }
            b'|' => {
                self.bump();
                return Some(if self.eat(b'|') {
                    Punct::PipePipe
                } else if self.eat(b'=') {
                    Punct::PipeAssign
                } else {
                    Punct::Pipe
                });
            }
            b'^' => {
                self.bump();
                return Some(if self.eat(b'=') {
                    Punct::CaretAssign
                } else {
                    Punct::Caret
                });
            }
            b'!' => {
                self.bump();
                return Some(if self.eat(b'=') {
                    Punct::NotEq
                } else {
                    Punct::Not
                });
            }
            b'=' => {
                self.bump();
                return Some(if self.eat(b'=') {
                    Punct::EqEq
                } else {
                    Punct::Assign
                });
            }
            b'<' => {
                self.bump();
                return Some(if self.eat(b'<') {
                    if self.eat(b'=') {
                        Punct::ShlAssign
                    } else {
                        Punct::Shl
                    }
                } else if self.eat(b'=') {
                    Punct::LtEq
                } else {
                    Punct::Lt
                });
            }
            b'>' => {
                self.bump();
                return Some(if self.eat(b'>') {
                    if self.eat(b'=') {
                        Punct::ShrAssign
                    } else {
                        Punct::Shr
                    }
                } else if self.eat(b'=') {
                    Punct::GtEq
                } else {
                    Punct::Gt
                });
            }
            _ => return None,
        };
        self.bump();
        Some(p)
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        self.scan()
    }
}

/// Remove backslash-newline continuations from a token spelling.
fn strip_splices(text: &str) -> std::borrow::Cow<'_, str> {
    if !text.contains('\\') {
        return std::borrow::Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len());
    let b = text.as_bytes();
    let mut i = 0;
    while i < b.len() {
        if b[i] == b'\\' && b.get(i + 1) == Some(&b'\n') {
            i += 2;
        } else if b[i] == b'\\' && b.get(i + 1) == Some(&b'\r') && b.get(i + 2) == Some(&b'\n') {
            i += 3;
        } else {
            out.push(b[i] as char);
            i += 1;
        }
    }
    std::borrow::Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new(src).map(|t| t.kind).collect()
    }

    fn roundtrip(src: &str) {
        let toks = lex(src, "t.c");
        assert_eq!(toks.source(), src, "token stream must re-emit the input");
    }

    #[test]
    fn empty_input() {
        let toks: Vec<_> = Lexer::new("").collect();
        assert_eq!(toks.len(), 1);
        assert_eq!(toks[0].kind, TokenKind::Eof);
        assert_eq!(toks[0].text, "");
    }

    #[test]
    fn simple_declaration() {
        assert_eq!(
            kinds("int x;"),
            vec![
                TokenKind::Keyword(Kw::Int),
                TokenKind::Space,
                TokenKind::Ident,
                TokenKind::Punct(Punct::Semicolon),
                TokenKind::Eof,
            ]
        );
        roundtrip("int x;");
    }

    #[test]
    fn whitespace_varieties() {
        assert_eq!(
            kinds("  \t\t\n"),
            vec![
                TokenKind::Space,
                TokenKind::Tab,
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
        roundtrip(" \t \t\r\n\n");
    }

    #[test]
    fn comments() {
        assert_eq!(
            kinds("/* a\nb */// c\n"),
            vec![
                TokenKind::BlockComment,
                TokenKind::LineComment,
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
        roundtrip("x /* mid */ y // tail");
    }

    #[test]
    fn unterminated_comment_is_invalid() {
        let toks: Vec<_> = Lexer::new("/* open").collect();
        assert_eq!(toks[0].kind, TokenKind::Invalid);
        assert_eq!(toks[0].text, "/* open");
    }

    #[test]
    fn integer_literals() {
        for lit in ["0", "42", "0x1F", "017", "42u", "42UL", "0x10ll", "1uLL"] {
            let toks: Vec<_> = Lexer::new(lit).collect();
            assert_eq!(toks[0].kind, TokenKind::IntLit, "{}", lit);
            assert_eq!(toks[0].text, lit);
        }
    }

    #[test]
    fn string_and_char_literals() {
        let toks: Vec<_> = Lexer::new(r#""ab\"c" 'x' L"wide""#).collect();
        assert_eq!(toks[0].kind, TokenKind::StrLit);
        assert_eq!(toks[0].text, r#""ab\"c""#);
        assert_eq!(toks[2].kind, TokenKind::CharLit);
        assert_eq!(toks[4].kind, TokenKind::WideStrLit);
        assert_eq!(toks[4].text, r#"L"wide""#);
    }

    #[test]
    fn unterminated_string_is_invalid() {
        let toks: Vec<_> = Lexer::new("\"open\nint").collect();
        assert_eq!(toks[0].kind, TokenKind::Invalid);
        assert_eq!(toks[0].text, "\"open");
        roundtrip("\"open\nint");
    }

    #[test]
    fn punctuator_longest_match() {
        assert_eq!(
            kinds("a<<=b>>=c...d"),
            vec![
                TokenKind::Ident,
                TokenKind::Punct(Punct::ShlAssign),
                TokenKind::Ident,
                TokenKind::Punct(Punct::ShrAssign),
                TokenKind::Ident,
                TokenKind::Punct(Punct::Ellipsis),
                TokenKind::Ident,
                TokenKind::Eof,
            ]
        );
        assert_eq!(
            kinds("p->q++"),
            vec![
                TokenKind::Ident,
                TokenKind::Punct(Punct::Arrow),
                TokenKind::Ident,
                TokenKind::Punct(Punct::Inc),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn line_continuation_in_identifier() {
        // The continuation is collapsed but the raw bytes stay in the token.
        let toks: Vec<_> = Lexer::new("ab\\\ncd = 1").collect();
        assert_eq!(toks[0].kind, TokenKind::Ident);
        assert_eq!(toks[0].text, "ab\\\ncd");
        roundtrip("ab\\\ncd = 1");
    }

    #[test]
    fn spliced_keyword() {
        let toks: Vec<_> = Lexer::new("whi\\\nle (1)").collect();
        assert_eq!(toks[0].kind, TokenKind::Keyword(Kw::While));
    }

    #[test]
    fn preprocessor_line() {
        let toks: Vec<_> = Lexer::new("#pragma once\nint a; # no\n").collect();
        assert_eq!(toks[0].kind, TokenKind::Preproc);
        assert_eq!(toks[0].text, "#pragma once");
        // A `#` after content on the line is not a preprocessor line.
        let hash = toks.iter().filter(|t| t.kind == TokenKind::Invalid).count();
        assert_eq!(hash, 1);
        roundtrip("#pragma once\nint a; # no\n");
    }

    #[test]
    fn positions() {
        let toks: Vec<_> = Lexer::new("int\n  x;").collect();
        assert_eq!(toks[0].span.begin, Pos::new(1, 1));
        assert_eq!(toks[0].span.end, Pos::new(1, 4));
        // `x` is on line 2 after two spaces.
        let x = toks.iter().find(|t| t.text == "x").unwrap();
        assert_eq!(x.span.begin, Pos::new(2, 3));
    }

    #[test]
    fn invalid_character() {
        let toks: Vec<_> = Lexer::new("a @ b").collect();
        assert_eq!(toks[2].kind, TokenKind::Invalid);
        assert_eq!(toks[2].text, "@");
        roundtrip("a @ b");
    }

    #[test]
    fn roundtrip_torture() {
        roundtrip("struct S { int x : 3; };\n\tchar *p = \"a\\nb\";\n");
        roundtrip("/* c1 */int/**/main(void)\n{\n\treturn 0;\n}\n");
        roundtrip("#define X 1\\\n+2\nint y = X;\n");
    }
}
