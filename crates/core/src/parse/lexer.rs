//! COS syntax tokenizer.
//!
//! One token stream serves both the file reader and the content
//! interpreter; the caller decides what a keyword means. Anything the
//! lexer cannot make sense of comes back as a keyword so tolerant callers
//! can skip it.

use smol_str::SmolStr;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Int(i64),
    Real(f64),
    Name(SmolStr),
    Str(Vec<u8>),
    ArrayOpen,
    ArrayClose,
    DictOpen,
    DictClose,
    Keyword(SmolStr),
    Eof,
}

impl Token {
    pub(crate) fn is_keyword(&self, kw: &str) -> bool {
        matches!(self, Token::Keyword(k) if k == kw)
    }
}

pub(crate) fn is_whitespace(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n' | b'\x00' | b'\x0c')
}

pub(crate) fn is_delimiter(b: u8) -> bool {
    matches!(
        b,
        b'(' | b')' | b'<' | b'>' | b'[' | b']' | b'{' | b'}' | b'/' | b'%'
    )
}

fn is_regular(b: u8) -> bool {
    !is_whitespace(b) && !is_delimiter(b)
}

fn hex_nibble(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

pub(crate) struct Lexer<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Lexer<'a> {
        Lexer { data, pos: 0 }
    }

    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    pub(crate) fn seek(&mut self, pos: usize) {
        self.pos = pos.min(self.data.len());
    }

    pub(crate) fn data(&self) -> &'a [u8] {
        self.data
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.data.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    /// Skips whitespace and `%` comments.
    pub(crate) fn skip_ws(&mut self) {
        while let Some(b) = self.peek() {
            if b == b'%' {
                while let Some(c) = self.peek() {
                    if c == b'\r' || c == b'\n' {
                        break;
                    }
                    self.pos += 1;
                }
                continue;
            }
            if !is_whitespace(b) {
                return;
            }
            self.pos += 1;
        }
    }

    /// Positions just past a `stream` keyword's end-of-line marker, where
    /// the raw stream bytes start.
    pub(crate) fn skip_stream_eol(&mut self) {
        if self.peek() == Some(b'\r') {
            self.pos += 1;
        }
        if self.peek() == Some(b'\n') {
            self.pos += 1;
        }
    }

    fn lex_name(&mut self) -> Result<Token> {
        self.advance(); // the '/'
        let mut name = Vec::new();
        while let Some(b) = self.peek() {
            if !is_regular(b) {
                break;
            }
            if b == b'#' {
                if let (Some(h1), Some(h2)) = (
                    self.peek_at(1).and_then(hex_nibble),
                    self.peek_at(2).and_then(hex_nibble),
                ) {
                    self.pos += 3;
                    name.push((h1 << 4) | h2);
                    continue;
                }
                // Stray '#' without two hex digits is dropped.
                self.pos += 1;
            } else {
                name.push(b);
                self.pos += 1;
            }
        }
        Ok(Token::Name(SmolStr::new(String::from_utf8_lossy(&name))))
    }

    fn lex_number(&mut self) -> Result<Token> {
        let start = self.pos;
        let mut has_dot = false;
        if matches!(self.peek(), Some(b'+') | Some(b'-')) {
            self.pos += 1;
        }
        while let Some(b) = self.peek() {
            if b.is_ascii_digit() {
                self.pos += 1;
            } else if b == b'.' && !has_dot {
                has_dot = true;
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(&self.data[start..self.pos]).map_err(|_| Error::Syntax {
            pos: start,
            msg: "number is not ascii".into(),
        })?;
        if has_dot {
            let v: f64 = text.parse().map_err(|_| Error::Syntax {
                pos: start,
                msg: format!("bad real {text:?}"),
            })?;
            Ok(Token::Real(v))
        } else {
            let v: i64 = text.parse().map_err(|_| Error::Syntax {
                pos: start,
                msg: format!("bad integer {text:?}"),
            })?;
            Ok(Token::Int(v))
        }
    }

    fn lex_string(&mut self) -> Result<Token> {
        self.advance(); // the '('
        let mut out = Vec::new();
        let mut depth = 1u32;
        loop {
            match self.advance() {
                Some(b'(') => {
                    depth += 1;
                    out.push(b'(');
                }
                Some(b')') => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                    out.push(b')');
                }
                Some(b'\\') => match self.advance() {
                    Some(b'n') => out.push(b'\n'),
                    Some(b'r') => out.push(b'\r'),
                    Some(b't') => out.push(b'\t'),
                    Some(b'b') => out.push(0x08),
                    Some(b'f') => out.push(0x0c),
                    Some(b'(') => out.push(b'('),
                    Some(b')') => out.push(b')'),
                    Some(b'\\') => out.push(b'\\'),
                    Some(b'\r') => {
                        // Line continuation, with optional following LF.
                        if self.peek() == Some(b'\n') {
                            self.pos += 1;
                        }
                    }
                    Some(b'\n') => {}
                    Some(c) if (b'0'..b'8').contains(&c) => {
                        let mut v = (c - b'0') as u32;
                        for _ in 0..2 {
                            match self.peek() {
                                Some(d) if (b'0'..b'8').contains(&d) => {
                                    self.pos += 1;
                                    v = v * 8 + (d - b'0') as u32;
                                }
                                _ => break,
                            }
                        }
                        out.push((v & 0xFF) as u8);
                    }
                    Some(c) => out.push(c),
                    None => return Err(Error::UnexpectedEof),
                },
                Some(c) => out.push(c),
                None => return Err(Error::UnexpectedEof),
            }
        }
        Ok(Token::Str(out))
    }

    fn lex_hex_string(&mut self) -> Result<Token> {
        self.advance(); // the '<'
        let mut out = Vec::new();
        let mut pending: Option<u8> = None;
        loop {
            match self.peek() {
                Some(b'>') => {
                    self.pos += 1;
                    break;
                }
                Some(c) => {
                    self.pos += 1;
                    if let Some(n) = hex_nibble(c) {
                        match pending.take() {
                            Some(high) => out.push((high << 4) | n),
                            None => pending = Some(n),
                        }
                    } else if !is_whitespace(c) {
                        // Junk ends the string early.
                        break;
                    }
                }
                None => return Err(Error::UnexpectedEof),
            }
        }
        if let Some(high) = pending {
            // Odd digit count: the final nibble is padded with zero.
            out.push(high << 4);
        }
        Ok(Token::Str(out))
    }

    fn lex_keyword(&mut self) -> Result<Token> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if !is_regular(b) {
                break;
            }
            self.pos += 1;
        }
        let bytes = &self.data[start..self.pos];
        Ok(Token::Keyword(SmolStr::new(String::from_utf8_lossy(bytes))))
    }

    pub(crate) fn next(&mut self) -> Result<Token> {
        self.skip_ws();
        let Some(b) = self.peek() else {
            return Ok(Token::Eof);
        };
        match b {
            b'/' => self.lex_name(),
            b'(' => self.lex_string(),
            b'<' => {
                if self.peek_at(1) == Some(b'<') {
                    self.pos += 2;
                    Ok(Token::DictOpen)
                } else {
                    self.lex_hex_string()
                }
            }
            b'>' => {
                if self.peek_at(1) == Some(b'>') {
                    self.pos += 2;
                    Ok(Token::DictClose)
                } else {
                    self.pos += 1;
                    Ok(Token::Keyword(SmolStr::new(">")))
                }
            }
            b'[' => {
                self.pos += 1;
                Ok(Token::ArrayOpen)
            }
            b']' => {
                self.pos += 1;
                Ok(Token::ArrayClose)
            }
            b'{' => {
                self.pos += 1;
                Ok(Token::Keyword(SmolStr::new("{")))
            }
            b'}' => {
                self.pos += 1;
                Ok(Token::Keyword(SmolStr::new("}")))
            }
            b'+' | b'-' => {
                if matches!(self.peek_at(1), Some(c) if c.is_ascii_digit() || c == b'.') {
                    self.lex_number()
                } else {
                    self.lex_keyword()
                }
            }
            b'.' => {
                if matches!(self.peek_at(1), Some(c) if c.is_ascii_digit()) {
                    self.lex_number()
                } else {
                    self.lex_keyword()
                }
            }
            c if c.is_ascii_digit() => self.lex_number(),
            b')' => {
                // Unbalanced close; swallow it so callers can continue.
                self.pos += 1;
                Ok(Token::Keyword(SmolStr::new(")")))
            }
            _ => self.lex_keyword(),
        }
    }
}
