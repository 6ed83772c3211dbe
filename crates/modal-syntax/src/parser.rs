//! Recursive descent parser for guard expressions and action scripts.

use thiserror::Error;

use crate::ast::{ActionClause, BinOp, Destination, Expr, ExprKind, UnaryOp};
use crate::lexer::Lexer;
use crate::token::{Span, Token, TokenKind};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("expected {expected}, found {found} at {span}")]
    UnexpectedToken {
        expected: String,
        found: String,
        span: Span,
    },

    #[error("unexpected end of input at {span}")]
    UnexpectedEof { span: Span },

    #[error("{message} at {span}")]
    InvalidSyntax { message: String, span: Span },
}

impl ParseError {
    pub fn span(&self) -> Span {
        match self {
            ParseError::UnexpectedToken { span, .. }
            | ParseError::UnexpectedEof { span }
            | ParseError::InvalidSyntax { span, .. } => *span,
        }
    }
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Parse a guard expression. The whole input must be consumed.
pub fn parse_expression(source: &str) -> ParseResult<Expr> {
    let tokens = Lexer::new(source).tokenize();
    let mut parser = Parser::new(tokens);
    let expr = parser.parse_expr()?;
    parser.expect_eof()?;
    Ok(expr)
}

/// Parse an action script: semicolon-separated `dest = expr` clauses.
/// Blank input is an empty script.
pub fn parse_actions(source: &str) -> ParseResult<Vec<ActionClause>> {
    let tokens = Lexer::new(source).tokenize();
    let mut parser = Parser::new(tokens);
    let clauses = parser.parse_action_script()?;
    parser.expect_eof()?;
    Ok(clauses)
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        let tokens = tokens.into_iter().filter(|t| !t.kind.is_trivia()).collect();
        Parser { tokens, pos: 0 }
    }

    pub fn parse_expr(&mut self) -> ParseResult<Expr> {
        let cond = self.parse_binary_expr(1)?;
        if !self.match_token(&TokenKind::Question) {
            return Ok(cond);
        }
        let then_branch = self.parse_expr()?;
        self.expect(TokenKind::Colon)?;
        // Right-associative through the recursive call.
        let else_branch = self.parse_expr()?;
        let span = cond.span.merge(else_branch.span);
        Ok(Expr {
            kind: ExprKind::Ternary {
                cond: Box::new(cond),
                then_branch: Box::new(then_branch),
                else_branch: Box::new(else_branch),
            },
            span,
        })
    }

    /// Precedence climbing over the binary operator table.
    fn parse_binary_expr(&mut self, min_prec: u8) -> ParseResult<Expr> {
        let mut left = self.parse_unary_expr()?;
        while let Some(op) = self.peek_binop() {
            let prec = op.precedence();
            if prec < min_prec {
                break;
            }
            self.advance();
            let right = self.parse_binary_expr(prec + 1)?;
            let span = left.span.merge(right.span);
            left = Expr {
                kind: ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            };
        }
        Ok(left)
    }

    fn peek_binop(&self) -> Option<BinOp> {
        match self.peek_kind() {
            TokenKind::OrOr => Some(BinOp::Or),
            TokenKind::AndAnd => Some(BinOp::And),
            TokenKind::EqEq => Some(BinOp::Eq),
            TokenKind::Neq => Some(BinOp::Neq),
            TokenKind::Lt => Some(BinOp::Lt),
            TokenKind::Le => Some(BinOp::Le),
            TokenKind::Gt => Some(BinOp::Gt),
            TokenKind::Ge => Some(BinOp::Ge),
            TokenKind::Plus => Some(BinOp::Add),
            TokenKind::Minus => Some(BinOp::Sub),
            TokenKind::Star => Some(BinOp::Mul),
            TokenKind::Slash => Some(BinOp::Div),
            TokenKind::Percent => Some(BinOp::Mod),
            _ => None,
        }
    }

    fn parse_unary_expr(&mut self) -> ParseResult<Expr> {
        let op = match self.peek_kind() {
            TokenKind::Bang => Some(UnaryOp::Not),
            TokenKind::Minus => Some(UnaryOp::Neg),
            _ => None,
        };
        let Some(op) = op else {
            return self.parse_postfix_expr();
        };
        let start = self.current_span();
        self.advance();
        let operand = self.parse_unary_expr()?;
        let span = start.merge(operand.span);
        Ok(Expr {
            kind: ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            span,
        })
    }

    fn parse_postfix_expr(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_primary_expr()?;
        while self.match_token(&TokenKind::LBracket) {
            let index = self.parse_expr()?;
            self.expect(TokenKind::RBracket)?;
            let span = expr.span.merge(self.prev_span());
            expr = Expr {
                kind: ExprKind::Index {
                    base: Box::new(expr),
                    index: Box::new(index),
                },
                span,
            };
        }
        Ok(expr)
    }

    fn parse_primary_expr(&mut self) -> ParseResult<Expr> {
        let span = self.current_span();
        match self.peek_kind().clone() {
            TokenKind::Int(n) => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::Int(n),
                    span,
                })
            }
            TokenKind::Float(x) => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::Float(x),
                    span,
                })
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::Str(s),
                    span,
                })
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::Bool(true),
                    span,
                })
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::Bool(false),
                    span,
                })
            }
            TokenKind::Ident(name) => {
                self.advance();
                if self.match_token(&TokenKind::LParen) {
                    let args = self.parse_call_args()?;
                    let span = span.merge(self.prev_span());
                    Ok(Expr {
                        kind: ExprKind::Call { name, args },
                        span,
                    })
                } else {
                    Ok(Expr {
                        kind: ExprKind::Ident(name),
                        span,
                    })
                }
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::Eof => Err(ParseError::UnexpectedEof { span }),
            TokenKind::Error(message) => {
                self.advance();
                Err(ParseError::InvalidSyntax { message, span })
            }
            other => Err(ParseError::UnexpectedToken {
                expected: "an expression".to_string(),
                found: format!("`{other}`"),
                span,
            }),
        }
    }

    fn parse_call_args(&mut self) -> ParseResult<Vec<Expr>> {
        let mut args = Vec::new();
        if self.match_token(&TokenKind::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            if !self.match_token(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(args)
    }

    fn parse_action_script(&mut self) -> ParseResult<Vec<ActionClause>> {
        let mut clauses = Vec::new();
        while !self.is_at_end() {
            clauses.push(self.parse_action_clause()?);
            if !self.match_token(&TokenKind::Semicolon) {
                break;
            }
        }
        Ok(clauses)
    }

    fn parse_action_clause(&mut self) -> ParseResult<ActionClause> {
        let dest = self.parse_destination()?;
        self.expect(TokenKind::Assign)?;
        let expr = self.parse_expr()?;
        let span = dest.span.merge(expr.span);
        Ok(ActionClause { dest, expr, span })
    }

    fn parse_destination(&mut self) -> ParseResult<Destination> {
        let (name, span) = self.parse_ident()?;
        let mut dest = Destination {
            qualifier: None,
            name,
            channel: None,
            span,
        };
        if self.match_token(&TokenKind::Dot) {
            let (field, field_span) = self.parse_ident()?;
            dest.qualifier = Some(std::mem::replace(&mut dest.name, field));
            dest.span = span.merge(field_span);
        } else if self.match_token(&TokenKind::LParen) {
            let channel_span = self.current_span();
            let TokenKind::Int(n) = *self.peek_kind() else {
                return Err(ParseError::UnexpectedToken {
                    expected: "a channel index".to_string(),
                    found: format!("`{}`", self.peek_kind()),
                    span: channel_span,
                });
            };
            self.advance();
            self.expect(TokenKind::RParen)?;
            dest.channel = Some(n as usize);
            dest.span = span.merge(self.prev_span());
        }
        Ok(dest)
    }

    fn parse_ident(&mut self) -> ParseResult<(String, Span)> {
        let span = self.current_span();
        match self.peek_kind().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok((name, span))
            }
            TokenKind::Eof => Err(ParseError::UnexpectedEof { span }),
            other => Err(ParseError::UnexpectedToken {
                expected: "an identifier".to_string(),
                found: format!("`{other}`"),
                span,
            }),
        }
    }

    fn expect_eof(&self) -> ParseResult<()> {
        if self.is_at_end() {
            Ok(())
        } else {
            Err(ParseError::UnexpectedToken {
                expected: "end of input".to_string(),
                found: format!("`{}`", self.peek_kind()),
                span: self.current_span(),
            })
        }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn current_span(&self) -> Span {
        self.peek().span
    }

    fn prev_span(&self) -> Span {
        if self.pos == 0 {
            Span::dummy()
        } else {
            self.tokens[self.pos - 1].span
        }
    }

    fn is_at_end(&self) -> bool {
        matches!(self.peek_kind(), TokenKind::Eof)
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(self.peek_kind()) == std::mem::discriminant(kind)
    }

    fn match_token(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn advance(&mut self) -> &Token {
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        &self.tokens[self.pos - 1]
    }

    fn expect(&mut self, kind: TokenKind) -> ParseResult<&Token> {
        if self.check(&kind) {
            Ok(self.advance())
        } else {
            Err(ParseError::UnexpectedToken {
                expected: format!("`{kind}`"),
                found: format!("`{}`", self.peek_kind()),
                span: self.current_span(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expr(source: &str) -> Expr {
        parse_expression(source).unwrap()
    }

    #[test]
    fn test_precedence() {
        let e = expr("1 + 2 * 3");
        let ExprKind::Binary { op, right, .. } = &e.kind else {
            panic!("expected binary, got {e:?}");
        };
        assert_eq!(*op, BinOp::Add);
        assert!(matches!(
            right.kind,
            ExprKind::Binary { op: BinOp::Mul, .. }
        ));
    }

    #[test]
    fn test_or_binds_loosest() {
        let e = expr("a || b && c == d");
        let ExprKind::Binary { op, right, .. } = &e.kind else {
            panic!("expected binary, got {e:?}");
        };
        assert_eq!(*op, BinOp::Or);
        assert!(matches!(
            right.kind,
            ExprKind::Binary { op: BinOp::And, .. }
        ));
    }

    #[test]
    fn test_left_associative() {
        let e = expr("10 - 4 - 3");
        let ExprKind::Binary { op, left, .. } = &e.kind else {
            panic!("expected binary, got {e:?}");
        };
        assert_eq!(*op, BinOp::Sub);
        assert!(matches!(
            left.kind,
            ExprKind::Binary { op: BinOp::Sub, .. }
        ));
    }

    #[test]
    fn test_parens_override() {
        let e = expr("(1 + 2) * 3");
        let ExprKind::Binary { op, left, .. } = &e.kind else {
            panic!("expected binary, got {e:?}");
        };
        assert_eq!(*op, BinOp::Mul);
        assert!(matches!(
            left.kind,
            ExprKind::Binary { op: BinOp::Add, .. }
        ));
    }

    #[test]
    fn test_unary() {
        let e = expr("!a && -b < 0");
        let ExprKind::Binary { op, left, .. } = &e.kind else {
            panic!("expected binary, got {e:?}");
        };
        assert_eq!(*op, BinOp::And);
        assert!(matches!(
            left.kind,
            ExprKind::Unary {
                op: UnaryOp::Not,
                ..
            }
        ));
    }

    #[test]
    fn test_ternary_right_associative() {
        let e = expr("a ? 1 : b ? 2 : 3");
        let ExprKind::Ternary { else_branch, .. } = &e.kind else {
            panic!("expected ternary, got {e:?}");
        };
        assert!(matches!(else_branch.kind, ExprKind::Ternary { .. }));
    }

    #[test]
    fn test_call_and_index() {
        let e = expr("min(a, b + 1)");
        let ExprKind::Call { name, args } = &e.kind else {
            panic!("expected call, got {e:?}");
        };
        assert_eq!(name, "min");
        assert_eq!(args.len(), 2);

        let e = expr("xArray[i + 1]");
        assert!(matches!(e.kind, ExprKind::Index { .. }));
    }

    #[test]
    fn test_span_covers_expression() {
        let e = expr("ab + cd");
        assert_eq!(e.span.start, 0);
        assert_eq!(e.span.end, 7);
    }

    #[test]
    fn test_trailing_input_rejected() {
        let err = parse_expression("1 2").unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedToken { .. }));
    }

    #[test]
    fn test_empty_expression_rejected() {
        let err = parse_expression("").unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedEof { .. }));
        let err = parse_expression("1 +").unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedEof { .. }));
    }

    #[test]
    fn test_lex_error_surfaces() {
        let err = parse_expression("a $ b").unwrap_err();
        assert!(matches!(err, ParseError::InvalidSyntax { .. }));
    }

    #[test]
    fn test_action_script() {
        let clauses = parse_actions("out = x + 1; count = count + 1").unwrap();
        assert_eq!(clauses.len(), 2);
        assert_eq!(clauses[0].dest.name, "out");
        assert_eq!(clauses[1].dest.name, "count");
        assert!(clauses[0].dest.qualifier.is_none());
        assert!(clauses[0].dest.channel.is_none());
    }

    #[test]
    fn test_action_script_empty() {
        assert_eq!(parse_actions("").unwrap(), vec![]);
        assert_eq!(parse_actions("   ").unwrap(), vec![]);
    }

    #[test]
    fn test_action_script_trailing_semicolon() {
        let clauses = parse_actions("out = 1;").unwrap();
        assert_eq!(clauses.len(), 1);
    }

    #[test]
    fn test_destination_forms() {
        let clauses = parse_actions("out(1) = 2; sub.gain = 3").unwrap();
        assert_eq!(clauses[0].dest.name, "out");
        assert_eq!(clauses[0].dest.channel, Some(1));
        assert_eq!(clauses[1].dest.qualifier.as_deref(), Some("sub"));
        assert_eq!(clauses[1].dest.name, "gain");
    }

    #[test]
    fn test_action_script_malformed() {
        assert!(parse_actions("out").is_err());
        assert!(parse_actions("out =").is_err());
        assert!(parse_actions("out = 1 extra").is_err());
        assert!(parse_actions("out(x) = 1").is_err());
        assert!(parse_actions("1 = 2").is_err());
    }
}
