//! Syntax for the guard and action language of modal state machines.
//!
//! Guards are boolean expressions over ports and variables; action
//! scripts are semicolon-separated `destination = expression` clauses.
//! Both share one expression grammar, lexed by [`Lexer`] and parsed
//! with [`parse_expression`] and [`parse_actions`].

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod token;

pub use ast::*;
pub use lexer::Lexer;
pub use parser::{parse_actions, parse_expression, ParseError, ParseResult, Parser};
pub use token::{Span, Token, TokenKind};
