//! Tokenizer for the query language
//!
//! Whitespace-insensitive. Keywords are recognised later, by the parser,
//! case-insensitively; the lexer only distinguishes identifiers, literals
//! and punctuation. Relationship arrows are lexed with maximal munch so
//! `<--` never splits into `<` `--`.

use crate::error::{ParseError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Identifier or keyword (`MATCH`, `d`, `Deployment`, `kind-context`).
    Ident(String),
    /// Double-quoted string literal, unescaped.
    Str(String),
    /// Integer literal.
    Int(i64),
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Colon,
    Comma,
    Semicolon,
    Dot,
    /// `->` or `-->`
    RightArrow,
    /// `<-` or `<--`
    LeftArrow,
    /// `--`
    Undirected,
    /// Bare `-`, used by bracketed relationships and negative numbers.
    Dash,
    Eq,
    NotEq,
    Gt,
    Lt,
    Ge,
    Le,
    /// `=~`
    RegexMatch,
}

/// Tokenize a statement.
pub fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '{' => {
                tokens.push(Token::LBrace);
                i += 1;
            }
            '}' => {
                tokens.push(Token::RBrace);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            ';' => {
                tokens.push(Token::Semicolon);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '<' => {
                if input[i..].starts_with("<--") {
                    tokens.push(Token::LeftArrow);
                    i += 3;
                } else if input[i..].starts_with("<-") {
                    tokens.push(Token::LeftArrow);
                    i += 2;
                } else if input[i..].starts_with("<=") {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if input[i..].starts_with(">=") {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '-' => {
                if input[i..].starts_with("-->") {
                    tokens.push(Token::RightArrow);
                    i += 3;
                } else if input[i..].starts_with("->") {
                    tokens.push(Token::RightArrow);
                    i += 2;
                } else if input[i..].starts_with("--") {
                    tokens.push(Token::Undirected);
                    i += 2;
                } else {
                    tokens.push(Token::Dash);
                    i += 1;
                }
            }
            '=' => {
                if input[i..].starts_with("=~") {
                    tokens.push(Token::RegexMatch);
                    i += 2;
                } else {
                    tokens.push(Token::Eq);
                    i += 1;
                }
            }
            '!' => {
                if input[i..].starts_with("!=") {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    return Err(ParseError::UnexpectedCharacter { ch: '!', offset: i });
                }
            }
            '"' => {
                let (literal, consumed) = lex_string(&input[i..], i)?;
                tokens.push(Token::Str(literal));
                i += consumed;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < bytes.len() && (bytes[i] as char).is_ascii_digit() {
                    i += 1;
                }
                let text = &input[start..i];
                let value = text.parse().map_err(|_| ParseError::InvalidNumber(text.to_string()))?;
                tokens.push(Token::Int(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len() {
                    let c = bytes[i] as char;
                    if c.is_alphanumeric() || c == '_' {
                        i += 1;
                    } else if c == '-' && !matches!(input[i..].as_bytes().get(1), Some(b'-' | b'>') | None) {
                        // A dash inside an identifier (context and resource
                        // names allow it), but never the start of an arrow.
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(input[start..i].to_string()));
            }
            other => return Err(ParseError::UnexpectedCharacter { ch: other, offset: i }),
        }
    }
    Ok(tokens)
}

fn lex_string(rest: &str, offset: usize) -> Result<(String, usize)> {
    debug_assert!(rest.starts_with('"'));
    let mut out = String::new();
    let mut chars = rest.char_indices().skip(1).peekable();
    while let Some((idx, c)) = chars.next() {
        match c {
            '"' => return Ok((out, idx + 1)),
            '\\' => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, '"')) => out.push('"'),
                Some((_, '\\')) => out.push('\\'),
                Some((_, other)) => {
                    out.push('\\');
                    out.push(other);
                }
                None => return Err(ParseError::UnterminatedString { offset }),
            },
            other => out.push(other),
        }
    }
    Err(ParseError::UnterminatedString { offset })
}
