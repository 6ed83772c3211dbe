//! Hand-written lexer for the guard and action language.
//!
//! Produces a flat token stream including trivia; the parser filters
//! trivia out. Lexing never fails: malformed input becomes
//! [`TokenKind::Error`] tokens that surface as parse errors.

use std::str::Chars;

use crate::token::{Span, Token, TokenKind};

pub struct Lexer<'a> {
    source: &'a str,
    chars: Chars<'a>,
    pos: usize,
    line: usize,
    column: usize,
    token_start: usize,
    token_start_line: usize,
    token_start_column: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Lexer {
            source,
            chars: source.chars(),
            pos: 0,
            line: 1,
            column: 1,
            token_start: 0,
            token_start_line: 1,
            token_start_column: 1,
        }
    }

    /// Lex the entire source, ending with an `Eof` token.
    pub fn tokenize(&mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token();
            let done = matches!(token.kind, TokenKind::Eof);
            tokens.push(token);
            if done {
                break;
            }
        }
        tokens
    }

    pub fn next_token(&mut self) -> Token {
        self.start_token();
        let Some(c) = self.peek() else {
            return self.make_token(TokenKind::Eof);
        };
        if c.is_whitespace() {
            return self.lex_whitespace();
        }
        if c.is_ascii_digit() {
            return self.lex_number();
        }
        if c.is_alphabetic() || c == '_' {
            return self.lex_identifier();
        }
        if c == '"' {
            return self.lex_string();
        }
        self.lex_operator()
    }

    fn peek(&self) -> Option<char> {
        self.chars.clone().next()
    }

    fn peek_ahead(&self, n: usize) -> Option<char> {
        self.chars.clone().nth(n)
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn start_token(&mut self) {
        self.token_start = self.pos;
        self.token_start_line = self.line;
        self.token_start_column = self.column;
    }

    fn make_token(&self, kind: TokenKind) -> Token {
        Token::new(
            kind,
            Span::new(
                self.token_start,
                self.pos,
                self.token_start_line,
                self.token_start_column,
            ),
        )
    }

    fn lex_whitespace(&mut self) -> Token {
        while self.peek().is_some_and(|c| c.is_whitespace()) {
            self.advance();
        }
        self.make_token(TokenKind::Whitespace)
    }

    fn lex_number(&mut self) -> Token {
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
        }
        let mut is_float = false;
        if self.peek() == Some('.') && self.peek_ahead(1).is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            self.advance();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
            }
        }
        let text = &self.source[self.token_start..self.pos];
        let kind = if is_float {
            match text.parse::<f64>() {
                Ok(x) => TokenKind::Float(x),
                Err(_) => TokenKind::Error(format!("invalid float literal `{text}`")),
            }
        } else {
            match text.parse::<i64>() {
                Ok(n) => TokenKind::Int(n),
                Err(_) => TokenKind::Error(format!("integer literal `{text}` out of range")),
            }
        };
        self.make_token(kind)
    }

    fn lex_identifier(&mut self) -> Token {
        while self.peek().is_some_and(|c| c.is_alphanumeric() || c == '_') {
            self.advance();
        }
        let text = &self.source[self.token_start..self.pos];
        let kind = TokenKind::keyword(text).unwrap_or_else(|| TokenKind::Ident(text.to_string()));
        self.make_token(kind)
    }

    fn lex_string(&mut self) -> Token {
        self.advance(); // opening quote
        let mut value = String::new();
        loop {
            match self.advance() {
                None => {
                    return self.make_token(TokenKind::Error(
                        "unterminated string literal".to_string(),
                    ));
                }
                Some('"') => break,
                Some('\\') => match self.advance() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some('r') => value.push('\r'),
                    Some('"') => value.push('"'),
                    Some('\\') => value.push('\\'),
                    Some(c) => {
                        return self.make_token(TokenKind::Error(format!(
                            "invalid escape sequence `\\{c}`"
                        )));
                    }
                    None => {
                        return self.make_token(TokenKind::Error(
                            "unterminated string literal".to_string(),
                        ));
                    }
                },
                Some(c) => value.push(c),
            }
        }
        self.make_token(TokenKind::Str(value))
    }

    fn lex_operator(&mut self) -> Token {
        let c = match self.advance() {
            Some(c) => c,
            None => return self.make_token(TokenKind::Eof),
        };
        let kind = match c {
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            '?' => TokenKind::Question,
            ':' => TokenKind::Colon,
            '.' => TokenKind::Dot,
            ',' => TokenKind::Comma,
            ';' => TokenKind::Semicolon,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            '!' => {
                if self.peek() == Some('=') {
                    self.advance();
                    TokenKind::Neq
                } else {
                    TokenKind::Bang
                }
            }
            '=' => {
                if self.peek() == Some('=') {
                    self.advance();
                    TokenKind::EqEq
                } else {
                    TokenKind::Assign
                }
            }
            '<' => {
                if self.peek() == Some('=') {
                    self.advance();
                    TokenKind::Le
                } else {
                    TokenKind::Lt
                }
            }
            '>' => {
                if self.peek() == Some('=') {
                    self.advance();
                    TokenKind::Ge
                } else {
                    TokenKind::Gt
                }
            }
            '&' => {
                if self.peek() == Some('&') {
                    self.advance();
                    TokenKind::AndAnd
                } else {
                    TokenKind::Error("expected `&&`".to_string())
                }
            }
            '|' => {
                if self.peek() == Some('|') {
                    self.advance();
                    TokenKind::OrOr
                } else {
                    TokenKind::Error("expected `||`".to_string())
                }
            }
            _ => TokenKind::Error(format!("unexpected character `{c}`")),
        };
        self.make_token(kind)
    }
}

impl Iterator for Lexer<'_> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        let token = self.next_token();
        if matches!(token.kind, TokenKind::Eof) {
            None
        } else {
            Some(token)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(source: &str) -> Vec<TokenKind> {
        Lexer::new(source)
            .filter(|t| !t.kind.is_trivia())
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_integers() {
        assert_eq!(lex("0 42 1000"), vec![
            TokenKind::Int(0),
            TokenKind::Int(42),
            TokenKind::Int(1000),
        ]);
    }

    #[test]
    fn test_floats() {
        assert_eq!(lex("1.5 0.25"), vec![
            TokenKind::Float(1.5),
            TokenKind::Float(0.25),
        ]);
        // A dot not followed by a digit is not part of the number.
        assert_eq!(lex("1.x"), vec![
            TokenKind::Int(1),
            TokenKind::Dot,
            TokenKind::Ident("x".to_string()),
        ]);
    }

    #[test]
    fn test_integer_out_of_range() {
        let kinds = lex("99999999999999999999");
        assert!(matches!(kinds[0], TokenKind::Error(_)));
    }

    #[test]
    fn test_identifiers_and_keywords() {
        assert_eq!(lex("count true false _tmp x_0_isPresent"), vec![
            TokenKind::Ident("count".to_string()),
            TokenKind::True,
            TokenKind::False,
            TokenKind::Ident("_tmp".to_string()),
            TokenKind::Ident("x_0_isPresent".to_string()),
        ]);
    }

    #[test]
    fn test_operators() {
        assert_eq!(lex("a<=b && c != d || !e"), vec![
            TokenKind::Ident("a".to_string()),
            TokenKind::Le,
            TokenKind::Ident("b".to_string()),
            TokenKind::AndAnd,
            TokenKind::Ident("c".to_string()),
            TokenKind::Neq,
            TokenKind::Ident("d".to_string()),
            TokenKind::OrOr,
            TokenKind::Bang,
            TokenKind::Ident("e".to_string()),
        ]);
        assert_eq!(lex("= =="), vec![TokenKind::Assign, TokenKind::EqEq]);
    }

    #[test]
    fn test_strings() {
        assert_eq!(lex(r#""hello""#), vec![TokenKind::Str("hello".to_string())]);
        assert_eq!(lex(r#""a\n\"b\"""#), vec![TokenKind::Str(
            "a\n\"b\"".to_string()
        )]);
    }

    #[test]
    fn test_unterminated_string() {
        let kinds = lex("\"oops");
        assert!(matches!(kinds[0], TokenKind::Error(_)));
    }

    #[test]
    fn test_lone_ampersand() {
        let kinds = lex("a & b");
        assert!(matches!(kinds[1], TokenKind::Error(_)));
    }

    #[test]
    fn test_spans_track_lines() {
        let tokens: Vec<Token> = Lexer::new("a\n  b").collect();
        let b = tokens
            .iter()
            .find(|t| t.kind == TokenKind::Ident("b".to_string()))
            .unwrap();
        assert_eq!(b.span.line, 2);
        assert_eq!(b.span.column, 3);
        assert_eq!(b.span.start, 4);
        assert_eq!(b.span.end, 5);
    }

    #[test]
    fn test_action_script() {
        assert_eq!(lex("out = x + 1; v = 2"), vec![
            TokenKind::Ident("out".to_string()),
            TokenKind::Assign,
            TokenKind::Ident("x".to_string()),
            TokenKind::Plus,
            TokenKind::Int(1),
            TokenKind::Semicolon,
            TokenKind::Ident("v".to_string()),
            TokenKind::Assign,
            TokenKind::Int(2),
        ]);
    }
}
