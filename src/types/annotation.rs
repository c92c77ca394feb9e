//! Parser for Python annotation expressions as they appear in source text.
//!
//! Covers the subset used in signatures and class bodies: dotted names, subscripts,
//! PEP 604 unions, `None`, `...`, nested lists (`Callable[[int], str]`) and string
//! forward references.

use crate::error::{CodespeakError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Annotation {
    /// Dotted name, e.g. `int` or `datetime.datetime`.
    Name(String),
    Subscript {
        base: String,
        args: Vec<Annotation>,
    },
    /// Bracketed argument list, e.g. the parameter list of `Callable[[int], str]`.
    List(Vec<Annotation>),
    /// `A | B | ...`
    Union(Vec<Annotation>),
    None,
    Ellipsis,
    /// Quoted text: a forward reference in type position, a value inside `Literal[...]`.
    Str(String),
    /// Numeric or other bare literal, only meaningful inside `Literal[...]`.
    Literal(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Name(String),
    Str(String),
    Number(String),
    Ellipsis,
    LBracket,
    RBracket,
    Comma,
    Pipe,
}

pub fn parse(text: &str) -> Result<Annotation> {
    let tokens = tokenize(text)?;
    let mut parser = Parser { tokens, pos: 0 };
    let annotation = parser.union()?;
    if parser.pos != parser.tokens.len() {
        return Err(syntax_error(text, "trailing input"));
    }
    Ok(annotation)
}

fn syntax_error(text: &str, reason: &str) -> CodespeakError {
    CodespeakError::Classification(format!("unsupported annotation `{}` ({})", text, reason))
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() || c == '\\' => i += 1,
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '.' if chars[i..].starts_with(&['.', '.', '.']) => {
                tokens.push(Token::Ellipsis);
                i += 3;
            }
            '"' | '\'' => {
                let quote = c;
                let triple = chars[i..].starts_with(&[quote, quote, quote]);
                let open = if triple { 3 } else { 1 };
                let start = i + open;
                let mut end = start;
                loop {
                    if end >= chars.len() {
                        return Err(syntax_error(text, "unterminated string"));
                    }
                    let closes = if triple {
                        chars[end..].starts_with(&[quote, quote, quote])
                    } else {
                        chars[end] == quote
                    };
                    if closes {
                        break;
                    }
                    end += 1;
                }
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + open;
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                    i += 1;
                }
                tokens.push(Token::Number(chars[start..i].iter().collect()));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let name: String = chars[start..i].iter().collect();
                if name.ends_with('.') || name.contains("..") {
                    return Err(syntax_error(text, "malformed dotted name"));
                }
                tokens.push(Token::Name(name));
            }
            other => {
                return Err(syntax_error(text, &format!("unexpected character '{}'", other)));
            }
        }
    }

    if tokens.is_empty() {
        return Err(syntax_error(text, "empty"));
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn error(&self, reason: &str) -> CodespeakError {
        CodespeakError::Classification(format!(
            "unsupported annotation ({} at token {})",
            reason, self.pos
        ))
    }

    fn union(&mut self) -> Result<Annotation> {
        let first = self.primary()?;
        if self.peek() != Some(&Token::Pipe) {
            return Ok(first);
        }
        let mut members = vec![first];
        while self.peek() == Some(&Token::Pipe) {
            self.pos += 1;
            members.push(self.primary()?);
        }
        Ok(Annotation::Union(members))
    }

    fn primary(&mut self) -> Result<Annotation> {
        match self.next() {
            Some(Token::Name(name)) if name == "None" => Ok(Annotation::None),
            Some(Token::Name(name)) => {
                if self.peek() == Some(&Token::LBracket) {
                    self.pos += 1;
                    let args = self.sequence()?;
                    Ok(Annotation::Subscript { base: name, args })
                } else {
                    Ok(Annotation::Name(name))
                }
            }
            Some(Token::LBracket) => Ok(Annotation::List(self.sequence()?)),
            Some(Token::Str(text)) => Ok(Annotation::Str(text)),
            Some(Token::Number(text)) => Ok(Annotation::Literal(text)),
            Some(Token::Ellipsis) => Ok(Annotation::Ellipsis),
            Some(_) => Err(self.error("unexpected token")),
            None => Err(self.error("unexpected end")),
        }
    }

    /// Comma separated items up to the closing bracket (already past the opening one).
    fn sequence(&mut self) -> Result<Vec<Annotation>> {
        let mut items = Vec::new();
        loop {
            if self.peek() == Some(&Token::RBracket) {
                self.pos += 1;
                return Ok(items);
            }
            items.push(self.union()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RBracket) => return Ok(items),
                _ => return Err(self.error("expected ',' or ']'")),
            }
        }
    }
}
