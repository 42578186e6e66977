//! The lexer.
//!
//! Scans raw bytes: identifiers and operators are ASCII, and string
//! literals pass arbitrary bytes through (escapes like `\x` can produce
//! content that is not valid UTF-8). Newlines are significant and lexed as
//! `Line` tokens. Interpolated strings are lexed as a sequence of
//! `Interpolation` fragments, the embedded expression tokens, and a closing
//! `String` fragment; a counter of unmatched `(` per nesting level decides
//! when an expression ends.

use crate::token::{Token, TokenKind, TokenValue};
use builtins::utf8;
use core_types::MAX_INTERPOLATION_NESTING;

/// Converts source text to a stream of tokens.
pub struct Lexer<'a> {
    source: &'a [u8],
    start: usize,
    current: usize,
    line: u32,
    /// One counter of unmatched `(` per active interpolation level.
    parens: Vec<u32>,
    allow_semicolons: bool,
}

impl<'a> Lexer<'a> {
    /// Create a lexer over `source`.
    ///
    /// `allow_semicolons` mirrors the host configuration flag; when off, a
    /// `;` is reported as an invalid character.
    pub fn new(source: &'a str, allow_semicolons: bool) -> Lexer<'a> {
        let mut lexer = Lexer {
            source: source.as_bytes(),
            start: 0,
            current: 0,
            line: 1,
            parens: Vec::new(),
            allow_semicolons,
        };
        lexer.skip_hashbang();
        lexer
    }

    /// Skip a `#!` interpreter line at the very start of the source.
    fn skip_hashbang(&mut self) {
        if self.source.starts_with(b"#!") {
            while !self.is_at_end() && self.peek() != b'\n' {
                self.current += 1;
            }
        }
    }

    /// Lex the next token.
    pub fn next_token(&mut self) -> Token {
        self.skip_whitespace();

        self.start = self.current;
        if self.is_at_end() {
            return self.make_token(TokenKind::Eof);
        }

        let c = self.advance();
        match c {
            b'(' => {
                // Inside an interpolated expression, count the delimiter so
                // the matching ')' goes back to string lexing.
                if let Some(depth) = self.parens.last_mut() {
                    *depth += 1;
                }
                self.make_token(TokenKind::LeftParen)
            }
            b')' => {
                if let Some(depth) = self.parens.last_mut() {
                    *depth -= 1;
                    if *depth == 0 {
                        self.parens.pop();
                        return self.read_string(false);
                    }
                }
                self.make_token(TokenKind::RightParen)
            }
            b'[' => self.make_token(TokenKind::LeftBracket),
            b']' => self.make_token(TokenKind::RightBracket),
            b'{' => self.make_token(TokenKind::LeftBrace),
            b'}' => self.make_token(TokenKind::RightBrace),
            b':' => self.make_token(TokenKind::Colon),
            b',' => self.make_token(TokenKind::Comma),
            b'*' => self.make_token(TokenKind::Star),
            b'%' => self.make_token(TokenKind::Percent),
            b'#' => self.make_token(TokenKind::Hash),
            b'^' => self.make_token(TokenKind::Caret),
            b'+' => self.make_token(TokenKind::Plus),
            b'-' => self.make_token(TokenKind::Minus),
            b'~' => self.make_token(TokenKind::Tilde),
            b'?' => self.make_token(TokenKind::Question),
            b';' => {
                if self.allow_semicolons {
                    self.make_token(TokenKind::Semicolon)
                } else {
                    self.error_token("Invalid character ';'.")
                }
            }
            b'|' => self.two_char(b'|', TokenKind::PipePipe, TokenKind::Pipe),
            b'&' => self.two_char(b'&', TokenKind::AmpAmp, TokenKind::Amp),
            b'=' => self.two_char(b'=', TokenKind::EqEq, TokenKind::Eq),
            b'!' => self.two_char(b'=', TokenKind::BangEq, TokenKind::Bang),
            b'.' => {
                if self.match_byte(b'.') {
                    self.two_char(b'.', TokenKind::DotDotDot, TokenKind::DotDot)
                } else {
                    self.make_token(TokenKind::Dot)
                }
            }
            b'/' => self.make_token(TokenKind::Slash),
            b'<' => {
                if self.match_byte(b'<') {
                    self.make_token(TokenKind::LtLt)
                } else {
                    self.two_char(b'=', TokenKind::LtEq, TokenKind::Lt)
                }
            }
            b'>' => {
                if self.match_byte(b'>') {
                    self.make_token(TokenKind::GtGt)
                } else {
                    self.two_char(b'=', TokenKind::GtEq, TokenKind::Gt)
                }
            }
            b'\n' => {
                let token = self.make_token(TokenKind::Line);
                self.line += 1;
                token
            }
            b'"' => self.read_string(false),
            b'$' => {
                if self.match_byte(b'"') {
                    self.read_string(true)
                } else {
                    self.error_token("Invalid character '$'.")
                }
            }
            b'_' => self.read_name(),
            c if c.is_ascii_digit() => self.read_number(c),
            c if c.is_ascii_alphabetic() => self.read_name(),
            c => {
                if c.is_ascii() {
                    self.error_token(&format!("Invalid character '{}'.", c as char))
                } else {
                    self.error_token(&format!("Invalid byte 0x{c:x}."))
                }
            }
        }
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\t' | b'\r' => {
                    self.current += 1;
                }
                b'/' if self.peek_next() == b'/' => {
                    while !self.is_at_end() && self.peek() != b'\n' {
                        self.current += 1;
                    }
                }
                b'/' if self.peek_next() == b'*' => {
                    self.current += 2;
                    // Block comments nest.
                    let mut depth = 1;
                    while depth > 0 && !self.is_at_end() {
                        match self.peek() {
                            b'/' if self.peek_next() == b'*' => {
                                self.current += 2;
                                depth += 1;
                            }
                            b'*' if self.peek_next() == b'/' => {
                                self.current += 2;
                                depth -= 1;
                            }
                            b'\n' => {
                                self.line += 1;
                                self.current += 1;
                            }
                            _ => self.current += 1,
                        }
                    }
                }
                _ => break,
            }
            if self.is_at_end() {
                break;
            }
        }
    }

    fn read_string(&mut self, is_dollar: bool) -> Token {
        let mut bytes = Vec::new();
        let mut kind = if is_dollar {
            TokenKind::DollarString
        } else {
            TokenKind::String
        };

        loop {
            if self.is_at_end() {
                return self.error_token("Unterminated string.");
            }
            let c = self.advance();
            match c {
                b'"' => break,
                b'\n' => {
                    self.line += 1;
                    bytes.push(c);
                }
                b'%' if !is_dollar => {
                    if self.parens.len() >= MAX_INTERPOLATION_NESTING {
                        return self.error_token(&format!(
                            "Interpolation may only nest {MAX_INTERPOLATION_NESTING} levels deep."
                        ));
                    }
                    if !self.match_byte(b'(') {
                        return self.error_token("Expect '(' after '%'.");
                    }
                    self.parens.push(1);
                    kind = TokenKind::Interpolation;
                    break;
                }
                b'\\' => match self.read_escape(&mut bytes) {
                    Ok(()) => {}
                    Err(message) => return self.error_token(&message),
                },
                _ => bytes.push(c),
            }
        }

        let mut token = self.make_token(kind);
        token.value = TokenValue::Str(bytes);
        token
    }

    fn read_escape(&mut self, bytes: &mut Vec<u8>) -> Result<(), String> {
        if self.is_at_end() {
            return Err("Unterminated string.".to_string());
        }
        match self.advance() {
            b'"' => bytes.push(b'"'),
            b'\\' => bytes.push(b'\\'),
            b'%' => bytes.push(b'%'),
            b'0' => bytes.push(0),
            b'a' => bytes.push(7),
            b'b' => bytes.push(8),
            b'e' => bytes.push(27),
            b'f' => bytes.push(12),
            b'n' => bytes.push(b'\n'),
            b'r' => bytes.push(b'\r'),
            b't' => bytes.push(b'\t'),
            b'v' => bytes.push(11),
            b'x' => bytes.push(self.read_hex_escape(2, "byte")? as u8),
            b'u' => {
                let code_point = self.read_hex_escape(4, "Unicode")?;
                utf8::encode(code_point, bytes);
            }
            b'U' => {
                let code_point = self.read_hex_escape(8, "Unicode")?;
                if utf8::encode(code_point, bytes) == 0 {
                    return Err("Invalid Unicode code point.".to_string());
                }
            }
            _ => return Err("Invalid escape character.".to_string()),
        }
        Ok(())
    }

    fn read_hex_escape(&mut self, digits: usize, description: &str) -> Result<u32, String> {
        let mut value = 0u32;
        for _ in 0..digits {
            if self.is_at_end() || !self.peek().is_ascii_hexdigit() {
                return Err(format!("Incomplete {description} escape sequence."));
            }
            value = value * 16 + hex_digit(self.advance()) as u32;
        }
        Ok(value)
    }

    fn read_number(&mut self, first: u8) -> Token {
        if first == b'0' && (self.peek() == b'x' || self.peek() == b'X') {
            self.current += 1;
            return self.read_hex_number();
        }

        while self.peek().is_ascii_digit() {
            self.current += 1;
        }
        if self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            self.current += 1;
            while self.peek().is_ascii_digit() {
                self.current += 1;
            }
        }
        if self.peek() == b'e' || self.peek() == b'E' {
            self.current += 1;
            if self.peek() == b'+' || self.peek() == b'-' {
                self.current += 1;
            }
            if !self.peek().is_ascii_digit() {
                return self.error_token("Unterminated scientific notation.");
            }
            while self.peek().is_ascii_digit() {
                self.current += 1;
            }
        }

        let lexeme_end = self.current;

        // A single trailing type-marker letter is consumed and ignored.
        if matches!(self.peek(), b'l' | b'L' | b'f' | b'F') {
            self.current += 1;
        }

        let text = std::str::from_utf8(&self.source[self.start..lexeme_end])
            .expect("number lexemes are ASCII");
        match text.parse::<f64>() {
            Ok(value) if value.is_finite() => {
                let mut token = self.make_token(TokenKind::Number);
                token.value = TokenValue::Num(value);
                token
            }
            _ => self.error_token("Number literal is too large."),
        }
    }

    fn read_hex_number(&mut self) -> Token {
        let digits_start = self.current;
        while self.peek().is_ascii_hexdigit() {
            self.current += 1;
        }
        if self.current == digits_start {
            return self.error_token("Expect hex digits after '0x'.");
        }

        let lexeme_end = self.current;
        // 'f' and 'F' are hex digits, so only 'l'/'L' can mark a hex literal.
        if matches!(self.peek(), b'l' | b'L') {
            self.current += 1;
        }

        let text = std::str::from_utf8(&self.source[digits_start..lexeme_end])
            .expect("hex lexemes are ASCII");
        match u64::from_str_radix(text, 16) {
            Ok(value) => {
                let mut token = self.make_token(TokenKind::Number);
                token.value = TokenValue::Num(value as f64);
                token
            }
            Err(_) => self.error_token("Number literal is too large."),
        }
    }

    fn read_name(&mut self) -> Token {
        while self.peek().is_ascii_alphanumeric() || self.peek() == b'_' {
            self.current += 1;
        }

        let text = std::str::from_utf8(&self.source[self.start..self.current])
            .expect("identifiers are ASCII");

        let kind = if text.starts_with("__") {
            TokenKind::StaticField
        } else if text.starts_with('_') {
            TokenKind::Field
        } else {
            keyword_kind(text).unwrap_or(TokenKind::Name)
        };
        self.make_token(kind)
    }

    fn two_char(&mut self, second: u8, matched: TokenKind, single: TokenKind) -> Token {
        if self.match_byte(second) {
            self.make_token(matched)
        } else {
            self.make_token(single)
        }
    }

    fn make_token(&self, kind: TokenKind) -> Token {
        Token {
            kind,
            text: String::from_utf8_lossy(&self.source[self.start..self.current]).into_owned(),
            value: TokenValue::None,
            line: self.line,
        }
    }

    fn error_token(&self, message: &str) -> Token {
        Token {
            kind: TokenKind::Error,
            text: message.to_string(),
            value: TokenValue::None,
            line: self.line,
        }
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn peek(&self) -> u8 {
        if self.is_at_end() {
            0
        } else {
            self.source[self.current]
        }
    }

    fn peek_next(&self) -> u8 {
        if self.current + 1 >= self.source.len() {
            0
        } else {
            self.source[self.current + 1]
        }
    }

    fn advance(&mut self) -> u8 {
        let c = self.source[self.current];
        self.current += 1;
        c
    }

    fn match_byte(&mut self, expected: u8) -> bool {
        if self.is_at_end() || self.source[self.current] != expected {
            false
        } else {
            self.current += 1;
            true
        }
    }
}

fn hex_digit(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        b'A'..=b'F' => c - b'A' + 10,
        _ => unreachable!("caller checked is_ascii_hexdigit"),
    }
}

fn keyword_kind(text: &str) -> Option<TokenKind> {
    Some(match text {
        "break" => TokenKind::Break,
        "continue" => TokenKind::Continue,
        "class" => TokenKind::Class,
        "construct" => TokenKind::Construct,
        "else" => TokenKind::Else,
        "false" => TokenKind::False,
        "for" => TokenKind::For,
        "foreign" => TokenKind::Foreign,
        "if" => TokenKind::If,
        "import" => TokenKind::Import,
        "as" => TokenKind::As,
        "in" => TokenKind::In,
        "is" => TokenKind::Is,
        "null" => TokenKind::Null,
        "return" => TokenKind::Return,
        "static" => TokenKind::Static,
        "super" => TokenKind::Super,
        "this" => TokenKind::This,
        "true" => TokenKind::True,
        "var" => TokenKind::Var,
        "while" => TokenKind::While,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_kinds(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(source, false);
        let mut kinds = Vec::new();
        loop {
            let token = lexer.next_token();
            let kind = token.kind;
            kinds.push(kind);
            if kind == TokenKind::Eof {
                break;
            }
        }
        kinds
    }

    #[test]
    fn test_empty_source() {
        assert_eq!(lex_kinds(""), vec![TokenKind::Eof]);
    }

    #[test]
    fn test_punctuation() {
        assert_eq!(
            lex_kinds(".. ... << >> && || == != <= >="),
            vec![
                TokenKind::DotDot,
                TokenKind::DotDotDot,
                TokenKind::LtLt,
                TokenKind::GtGt,
                TokenKind::AmpAmp,
                TokenKind::PipePipe,
                TokenKind::EqEq,
                TokenKind::BangEq,
                TokenKind::LtEq,
                TokenKind::GtEq,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_keywords_and_names() {
        assert_eq!(
            lex_kinds("class construct foo"),
            vec![
                TokenKind::Class,
                TokenKind::Construct,
                TokenKind::Name,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_fields() {
        assert_eq!(
            lex_kinds("_x __y"),
            vec![TokenKind::Field, TokenKind::StaticField, TokenKind::Eof]
        );
    }

    #[test]
    fn test_numbers() {
        let mut lexer = Lexer::new("12 3.25 0x1f 1e3", false);
        assert_eq!(lexer.next_token().num(), 12.0);
        assert_eq!(lexer.next_token().num(), 3.25);
        assert_eq!(lexer.next_token().num(), 31.0);
        assert_eq!(lexer.next_token().num(), 1000.0);
    }

    #[test]
    fn test_number_type_markers_ignored() {
        let mut lexer = Lexer::new("10L 2.5f 7l 0x10L", false);
        assert_eq!(lexer.next_token().num(), 10.0);
        assert_eq!(lexer.next_token().num(), 2.5);
        assert_eq!(lexer.next_token().num(), 7.0);
        assert_eq!(lexer.next_token().num(), 16.0);
        assert_eq!(lexer.next_token().kind, TokenKind::Eof);
    }

    #[test]
    fn test_string_escapes() {
        let mut lexer = Lexer::new(r#""a\n\t\x41B""#, false);
        let token = lexer.next_token();
        assert_eq!(token.kind, TokenKind::String);
        assert_eq!(token.str_bytes(), b"a\n\tAB");
    }

    #[test]
    fn test_interpolation_fragments() {
        let mut lexer = Lexer::new(r#""a %(b) c""#, false);
        let first = lexer.next_token();
        assert_eq!(first.kind, TokenKind::Interpolation);
        assert_eq!(first.str_bytes(), b"a ");
        assert_eq!(lexer.next_token().kind, TokenKind::Name);
        let rest = lexer.next_token();
        assert_eq!(rest.kind, TokenKind::String);
        assert_eq!(rest.str_bytes(), b" c");
    }

    #[test]
    fn test_interpolation_nested_parens() {
        let mut lexer = Lexer::new(r#""%(f(1))!""#, false);
        assert_eq!(lexer.next_token().kind, TokenKind::Interpolation);
        assert_eq!(lexer.next_token().kind, TokenKind::Name);
        assert_eq!(lexer.next_token().kind, TokenKind::LeftParen);
        assert_eq!(lexer.next_token().kind, TokenKind::Number);
        assert_eq!(lexer.next_token().kind, TokenKind::RightParen);
        let rest = lexer.next_token();
        assert_eq!(rest.kind, TokenKind::String);
        assert_eq!(rest.str_bytes(), b"!");
    }

    #[test]
    fn test_dollar_string() {
        let mut lexer = Lexer::new(r#"$"90%(ok)""#, false);
        let token = lexer.next_token();
        assert_eq!(token.kind, TokenKind::DollarString);
        assert_eq!(token.str_bytes(), b"90%(ok)");
    }

    #[test]
    fn test_newline_token() {
        assert_eq!(
            lex_kinds("a\nb"),
            vec![
                TokenKind::Name,
                TokenKind::Line,
                TokenKind::Name,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_line_numbers_advance() {
        let mut lexer = Lexer::new("a\nb", false);
        assert_eq!(lexer.next_token().line, 1);
        assert_eq!(lexer.next_token().line, 1);
        assert_eq!(lexer.next_token().line, 2);
    }

    #[test]
    fn test_comments() {
        assert_eq!(
            lex_kinds("a // comment\nb /* x /* nested */ y */ c"),
            vec![
                TokenKind::Name,
                TokenKind::Line,
                TokenKind::Name,
                TokenKind::Name,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_semicolon_flag() {
        assert_eq!(lex_kinds(";")[0], TokenKind::Error);
        let mut lexer = Lexer::new(";", true);
        assert_eq!(lexer.next_token().kind, TokenKind::Semicolon);
    }

    #[test]
    fn test_hashbang_skipped() {
        assert_eq!(
            lex_kinds("#!/usr/bin/env siskin\na"),
            vec![TokenKind::Line, TokenKind::Name, TokenKind::Eof]
        );
    }

    #[test]
    fn test_unterminated_string() {
        assert_eq!(lex_kinds("\"abc")[0], TokenKind::Error);
    }
}
