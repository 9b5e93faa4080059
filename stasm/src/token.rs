//! Hand-rolled tokenizer (spec §4.5, REDESIGN FLAG #3).
//!
//! The original implementation drove its token stream off a
//! `std::vector::const_iterator`, matching the C++ idiom of an external
//! cursor threaded through recursive-descent calls. This replaces that
//! with a [`Cursor`] that owns its own one-token lookahead, so callers
//! never juggle iterator invalidation across pushback/peek.

use std::fmt;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Token {
    /// `.DATA`, `.CODE`, `.IF`, ... — the leading dot is not included.
    Directive(String),
    /// `:name` — the leading colon is not included.
    Label(String),
    Ident(String),
    Number(i64),
    Str(String),
    Char(u8),
    /// Single-character punctuation: `( ) [ ] , #`
    Punct(char),
    /// Multi-character operators tokenized as a unit: `== != >= <= << >>`.
    Op(&'static str),
    /// A single-character operator that also stands alone:
    /// `+ - * / % & | ^ > < !`.
    OpChar(char),
    Eol,
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Token::Directive(s) => write!(f, ".{}", s),
            Token::Label(s) => write!(f, ":{}", s),
            Token::Ident(s) => write!(f, "{}", s),
            Token::Number(n) => write!(f, "{}", n),
            Token::Str(s) => write!(f, "{:?}", s),
            Token::Char(c) => write!(f, "'{}'", *c as char),
            Token::Punct(c) => write!(f, "{}", c),
            Token::Op(s) => write!(f, "{}", s),
            Token::OpChar(c) => write!(f, "{}", c),
            Token::Eol => write!(f, "<eol>"),
            Token::Eof => write!(f, "<eof>"),
        }
    }
}

#[derive(Debug)]
pub struct LexError {
    pub message: String,
    pub line: u32,
}

/// Owns the source text and a one-token lookahead buffer. `line` tracks
/// the 1-based line of the token that would be returned by the next
/// [`Cursor::bump`] call, so callers can attach diagnostics without a
/// separate line-counting pass.
pub struct Cursor<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
    lookahead: Option<(Token, u32)>,
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_continue(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

impl<'a> Cursor<'a> {
    pub fn new(src: &'a str) -> Self {
        Cursor {
            src: src.as_bytes(),
            pos: 0,
            line: 1,
            lookahead: None,
        }
    }

    pub fn line(&self) -> u32 {
        self.lookahead.as_ref().map(|(_, l)| *l).unwrap_or(self.line)
    }

    /// Returns the next token without consuming it.
    pub fn peek(&mut self) -> Result<&Token, LexError> {
        if self.lookahead.is_none() {
            let tok = self.lex_one()?;
            let line = self.line;
            self.lookahead = Some((tok, line));
        }
        Ok(&self.lookahead.as_ref().unwrap().0)
    }

    /// Consumes and returns the next token.
    pub fn bump(&mut self) -> Result<Token, LexError> {
        if let Some((tok, _line)) = self.lookahead.take() {
            return Ok(tok);
        }
        self.lex_one()
    }

    fn peek_byte(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_byte_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let b = self.peek_byte()?;
        self.pos += 1;
        Some(b)
    }

    fn skip_inline_whitespace_and_comments(&mut self) {
        loop {
            match self.peek_byte() {
                Some(b' ') | Some(b'\t') | Some(b'\r') => {
                    self.pos += 1;
                }
                Some(b';') => {
                    while let Some(b) = self.peek_byte() {
                        if b == b'\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }

    fn lex_one(&mut self) -> Result<Token, LexError> {
        self.skip_inline_whitespace_and_comments();
        let b = match self.peek_byte() {
            None => return Ok(Token::Eof),
            Some(b) => b,
        };

        if b == b'\n' {
            self.pos += 1;
            self.line += 1;
            return Ok(Token::Eol);
        }

        if b == b'.' {
            self.pos += 1;
            let start = self.pos;
            while self
                .peek_byte()
                .map(is_ident_continue)
                .unwrap_or(false)
            {
                self.pos += 1;
            }
            let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
            return Ok(Token::Directive(text.to_ascii_uppercase()));
        }

        if b == b':' {
            self.pos += 1;
            let start = self.pos;
            while self
                .peek_byte()
                .map(is_ident_continue)
                .unwrap_or(false)
            {
                self.pos += 1;
            }
            let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
            return Ok(Token::Label(text.to_string()));
        }

        if is_ident_start(b) {
            let start = self.pos;
            while self
                .peek_byte()
                .map(is_ident_continue)
                .unwrap_or(false)
            {
                self.pos += 1;
            }
            let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
            return Ok(Token::Ident(text.to_string()));
        }

        if b.is_ascii_digit() {
            return self.lex_number();
        }

        if b == b'"' {
            return self.lex_string();
        }

        if b == b'\'' {
            return self.lex_char();
        }

        // multi-character operators first
        let two = (b, self.peek_byte_at(1));
        let op2: Option<&'static str> = match two {
            (b'=', Some(b'=')) => Some("=="),
            (b'!', Some(b'=')) => Some("!="),
            (b'>', Some(b'=')) => Some(">="),
            (b'<', Some(b'=')) => Some("<="),
            (b'<', Some(b'<')) => Some("<<"),
            (b'>', Some(b'>')) => Some(">>"),
            _ => None,
        };
        if let Some(op) = op2 {
            self.pos += 2;
            return Ok(Token::Op(op));
        }

        self.pos += 1;
        match b {
            b'(' | b')' | b'[' | b']' | b',' | b'#' => Ok(Token::Punct(b as char)),
            b'+' | b'-' | b'*' | b'/' | b'%' | b'&' | b'|' | b'^' | b'>' | b'<' | b'!' => {
                Ok(Token::OpChar(b as char))
            }
            other => Err(LexError {
                message: format!("unexpected character '{}'", other as char),
                line: self.line,
            }),
        }
    }

    fn lex_number(&mut self) -> Result<Token, LexError> {
        let start = self.pos;
        if self.peek_byte() == Some(b'0')
            && matches!(
                self.peek_byte_at(1),
                Some(b'x') | Some(b'X') | Some(b'o') | Some(b'O') | Some(b'b') | Some(b'B')
            )
        {
            let radix_char = self.peek_byte_at(1).unwrap();
            self.pos += 2;
            let digit_start = self.pos;
            let radix = match radix_char.to_ascii_lowercase() {
                b'x' => 16,
                b'o' => 8,
                b'b' => 2,
                _ => unreachable!(),
            };
            while self
                .peek_byte()
                .map(|c| (c as char).is_digit(radix) || c == b'_')
                .unwrap_or(false)
            {
                self.pos += 1;
            }
            let digits: String = std::str::from_utf8(&self.src[digit_start..self.pos])
                .unwrap()
                .chars()
                .filter(|c| *c != '_')
                .collect();
            let value = i64::from_str_radix(&digits, radix).map_err(|_| LexError {
                message: format!("invalid numeric literal at line {}", self.line),
                line: self.line,
            })?;
            return Ok(Token::Number(value));
        }

        while self.peek_byte().map(|c| c.is_ascii_digit()).unwrap_or(false) {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
        let value: i64 = text.parse().map_err(|_| LexError {
            message: format!("invalid numeric literal at line {}", self.line),
            line: self.line,
        })?;
        Ok(Token::Number(value))
    }

    fn lex_string(&mut self) -> Result<Token, LexError> {
        self.pos += 1; // opening quote
        let mut out = String::new();
        loop {
            match self.advance() {
                None => {
                    return Err(LexError {
                        message: "unterminated string literal".into(),
                        line: self.line,
                    })
                }
                Some(b'"') => {
                    if self.peek_byte() == Some(b'"') {
                        // `""` quote-escape
                        self.pos += 1;
                        out.push('"');
                        continue;
                    }
                    break;
                }
                Some(b'\\') => match self.advance() {
                    Some(b'n') => out.push('\n'),
                    Some(b't') => out.push('\t'),
                    Some(b'r') => out.push('\r'),
                    Some(b'\\') => out.push('\\'),
                    Some(b'"') => out.push('"'),
                    Some(other) => out.push(other as char),
                    None => {
                        return Err(LexError {
                            message: "unterminated string literal".into(),
                            line: self.line,
                        })
                    }
                },
                Some(other) => out.push(other as char),
            }
        }
        Ok(Token::Str(out))
    }

    fn lex_char(&mut self) -> Result<Token, LexError> {
        self.pos += 1;
        let value = match self.advance() {
            Some(b'\\') => match self.advance() {
                Some(b'n') => b'\n',
                Some(b't') => b'\t',
                Some(b'r') => b'\r',
                Some(b'\\') => b'\\',
                Some(b'\'') => b'\'',
                Some(other) => other,
                None => {
                    return Err(LexError {
                        message: "unterminated character literal".into(),
                        line: self.line,
                    })
                }
            },
            Some(b) => b,
            None => {
                return Err(LexError {
                    message: "unterminated character literal".into(),
                    line: self.line,
                })
            }
        };
        match self.advance() {
            Some(b'\'') => Ok(Token::Char(value)),
            _ => Err(LexError {
                message: "unterminated character literal".into(),
                line: self.line,
            }),
        }
    }

    /// Skips the rest of the current line without lexing it — used by
    /// conditional compilation to step over an untaken `.IF`/`.ELIF`
    /// branch without parsing its contents (spec §4.5).
    pub fn skip_line(&mut self) {
        self.lookahead = None;
        while let Some(b) = self.peek_byte() {
            if b == b'\n' {
                self.pos += 1;
                self.line += 1;
                return;
            }
            self.pos += 1;
        }
    }

    pub fn at_eof(&mut self) -> bool {
        matches!(self.peek(), Ok(Token::Eof))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn collect(src: &str) -> Vec<Token> {
        let mut c = Cursor::new(src);
        let mut out = Vec::new();
        loop {
            let t = c.bump().unwrap();
            let is_eof = t == Token::Eof;
            out.push(t);
            if is_eof {
                break;
            }
        }
        out
    }

    #[test]
    fn tokenizes_directive_and_label() {
        let toks = collect(".DATA\n:start");
        assert_eq!(toks[0], Token::Directive("DATA".into()));
        assert_eq!(toks[1], Token::Eol);
        assert_eq!(toks[2], Token::Label("start".into()));
    }

    #[test]
    fn hex_octal_binary_and_decimal_literals() {
        let toks = collect("0x1F 0o17 0b101 42");
        assert_eq!(toks[0], Token::Number(0x1F));
        assert_eq!(toks[1], Token::Number(0o17));
        assert_eq!(toks[2], Token::Number(0b101));
        assert_eq!(toks[3], Token::Number(42));
    }

    #[test]
    fn string_with_escaped_and_doubled_quotes() {
        let toks = collect("\"a\\nb\" \"x\"\"y\"");
        assert_eq!(toks[0], Token::Str("a\nb".into()));
        assert_eq!(toks[1], Token::Str("x\"y".into()));
    }

    #[test]
    fn semicolon_starts_a_line_comment() {
        let toks = collect("LD A, B ; load a from b\nLD A, C");
        assert!(toks.iter().any(|t| *t == Token::Ident("C".into())));
        assert!(!toks.iter().any(|t| matches!(t, Token::Ident(s) if s == "load")));
    }

    #[test]
    fn hash_marks_an_immediate_operand() {
        let toks = collect("LD A, #0x10");
        assert!(toks.iter().any(|t| *t == Token::Punct('#')));
        assert!(toks.iter().any(|t| *t == Token::Number(0x10)));
    }

    #[test]
    fn multi_char_operators_tokenize_as_one() {
        let toks = collect("a << 2 == b");
        assert_eq!(toks[1], Token::Op("<<"));
        assert_eq!(toks[3], Token::Op("=="));
    }
}
