//! The secondary-dispatch expression language.
//!
//! A dispatch expression is a small predicate over a dispatch request that
//! yields an ordered list of secondary names to hedge against:
//!
//! ```text
//! expr    := list | cond
//! cond    := bexpr '?' list ':' list
//! list    := '[' (STRING (',' STRING)*)? ']'
//! bexpr   := field ('==' | '!=') STRING
//! field   := 'request' ('.' IDENT)+
//! STRING  := single-quoted
//! ```
//!
//! Expressions are typed against a [`RequestKind`] at parse time: field
//! paths are validated against that kind's schema, so evaluation is pure
//! and cannot fail at runtime.

use std::fmt;

use thiserror::Error;

use crate::types::{
    CheckRequest, ExpandRequest, LookupResourcesRequest, LookupSubjectsRequest,
};

/// The operation shape an expression is typed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Check,
    Expand,
    LookupResources,
    LookupSubjects,
}

impl RequestKind {
    /// Parses the lowercase kind names used in configuration.
    pub fn parse(value: &str) -> Result<Self, ExpressionError> {
        match value {
            "check" => Ok(Self::Check),
            "expand" => Ok(Self::Expand),
            "lookupresources" => Ok(Self::LookupResources),
            "lookupsubjects" => Ok(Self::LookupSubjects),
            other => Err(ExpressionError::UnknownKind(other.to_string())),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Check => "check",
            Self::Expand => "expand",
            Self::LookupResources => "lookupresources",
            Self::LookupSubjects => "lookupsubjects",
        }
    }

    /// Dotted field paths addressable from expressions of this kind.
    fn fields(&self) -> &'static [&'static str] {
        match self {
            Self::Check => &[
                "resource_relation.namespace",
                "resource_relation.relation",
                "subject.namespace",
                "subject.object_id",
                "subject.relation",
            ],
            Self::Expand => &[
                "resource_and_relation.namespace",
                "resource_and_relation.object_id",
                "resource_and_relation.relation",
            ],
            Self::LookupResources => &[
                "resource_relation.namespace",
                "resource_relation.relation",
                "subject_relation.namespace",
                "subject_relation.relation",
                "terminal_subject.namespace",
                "terminal_subject.object_id",
                "terminal_subject.relation",
            ],
            Self::LookupSubjects => &[
                "resource_relation.namespace",
                "resource_relation.relation",
                "subject_relation.namespace",
                "subject_relation.relation",
            ],
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced while parsing an expression. Evaluation never fails.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("unknown request kind `{0}`")]
    UnknownKind(String),

    #[error("unexpected character `{found}` at offset {offset}")]
    UnexpectedCharacter { found: char, offset: usize },

    #[error("unterminated string literal starting at offset {offset}")]
    UnterminatedString { offset: usize },

    #[error("expected {expected}, found `{found}`")]
    UnexpectedToken { expected: &'static str, found: String },

    #[error("unexpected end of expression; expected {expected}")]
    UnexpectedEnd { expected: &'static str },

    #[error("field `{field}` is not addressable from `{kind}` expressions")]
    UnknownField { field: String, kind: RequestKind },

    #[error("trailing input after expression: `{0}`")]
    TrailingInput(String),
}

/// Provides expression-visible string fields of a request.
pub trait ExpressionRequest {
    /// Resolves a dotted field path (without the `request.` prefix).
    /// Paths validated at parse time always resolve.
    fn field(&self, path: &str) -> Option<&str>;
}

impl ExpressionRequest for CheckRequest {
    fn field(&self, path: &str) -> Option<&str> {
        match path {
            "resource_relation.namespace" => Some(&self.resource_relation.namespace),
            "resource_relation.relation" => Some(&self.resource_relation.relation),
            "subject.namespace" => Some(&self.subject.namespace),
            "subject.object_id" => Some(&self.subject.object_id),
            "subject.relation" => Some(&self.subject.relation),
            _ => None,
        }
    }
}

impl ExpressionRequest for ExpandRequest {
    fn field(&self, path: &str) -> Option<&str> {
        match path {
            "resource_and_relation.namespace" => Some(&self.resource_and_relation.namespace),
            "resource_and_relation.object_id" => Some(&self.resource_and_relation.object_id),
            "resource_and_relation.relation" => Some(&self.resource_and_relation.relation),
            _ => None,
        }
    }
}

impl ExpressionRequest for LookupResourcesRequest {
    fn field(&self, path: &str) -> Option<&str> {
        match path {
            "resource_relation.namespace" => Some(&self.resource_relation.namespace),
            "resource_relation.relation" => Some(&self.resource_relation.relation),
            "subject_relation.namespace" => Some(&self.subject_relation.namespace),
            "subject_relation.relation" => Some(&self.subject_relation.relation),
            "terminal_subject.namespace" => Some(&self.terminal_subject.namespace),
            "terminal_subject.object_id" => Some(&self.terminal_subject.object_id),
            "terminal_subject.relation" => Some(&self.terminal_subject.relation),
            _ => None,
        }
    }
}

impl ExpressionRequest for LookupSubjectsRequest {
    fn field(&self, path: &str) -> Option<&str> {
        match path {
            "resource_relation.namespace" => Some(&self.resource_relation.namespace),
            "resource_relation.relation" => Some(&self.resource_relation.relation),
            "subject_relation.namespace" => Some(&self.subject_relation.namespace),
            "subject_relation.relation" => Some(&self.subject_relation.relation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ExprNode {
    List(Vec<String>),
    Conditional {
        field: String,
        op: CompareOp,
        literal: String,
        when_true: Vec<String>,
        when_false: Vec<String>,
    },
}

/// A compiled dispatch expression, typed against one request kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchExpr {
    kind: RequestKind,
    node: ExprNode,
}

impl DispatchExpr {
    #[must_use]
    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Evaluates the expression against a request, yielding the ordered
    /// list of secondary names to hedge against. Pure and infallible.
    #[must_use]
    pub fn evaluate<R: ExpressionRequest>(&self, request: &R) -> Vec<String> {
        match &self.node {
            ExprNode::List(names) => names.clone(),
            ExprNode::Conditional { field, op, literal, when_true, when_false } => {
                let value = request.field(field).unwrap_or_default();
                let matched = match op {
                    CompareOp::Eq => value == literal,
                    CompareOp::Ne => value != literal,
                };
                if matched { when_true.clone() } else { when_false.clone() }
            }
        }
    }
}

/// Parses and type-checks an expression against the given request kind.
pub fn parse_dispatch_expression(
    kind: RequestKind,
    source: &str,
) -> Result<DispatchExpr, ExpressionError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, position: 0, kind };
    let node = parser.parse_expression()?;

    if let Some(token) = parser.peek() {
        return Err(ExpressionError::TrailingInput(token.describe()));
    }
    Ok(DispatchExpr { kind, node })
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    LBracket,
    RBracket,
    Comma,
    Question,
    Colon,
    Dot,
    EqEq,
    NotEq,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Self::Ident(name) => name.clone(),
            Self::Str(value) => format!("'{value}'"),
            Self::LBracket => "[".into(),
            Self::RBracket => "]".into(),
            Self::Comma => ",".into(),
            Self::Question => "?".into(),
            Self::Colon => ":".into(),
            Self::Dot => ".".into(),
            Self::EqEq => "==".into(),
            Self::NotEq => "!=".into(),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, ExpressionError> {
    let mut tokens = Vec::new();
    let bytes = source.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let ch = bytes[i] as char;
        match ch {
            ' ' | '\t' | '\n' | '\r' => i += 1,
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
            '?' => {
                tokens.push(Token::Question);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err(ExpressionError::UnexpectedCharacter { found: '=', offset: i });
                }
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    return Err(ExpressionError::UnexpectedCharacter { found: '!', offset: i });
                }
            }
            '\'' => {
                let start = i;
                i += 1;
                let literal_start = i;
                while i < bytes.len() && bytes[i] != b'\'' {
                    i += 1;
                }
                if i >= bytes.len() {
                    return Err(ExpressionError::UnterminatedString { offset: start });
                }
                tokens.push(Token::Str(source[literal_start..i].to_string()));
                i += 1;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(source[start..i].to_string()));
            }
            other => {
                return Err(ExpressionError::UnexpectedCharacter { found: other, offset: i });
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
    kind: RequestKind,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self, expected: &'static str) -> Result<Token, ExpressionError> {
        let token = self
            .tokens
            .get(self.position)
            .cloned()
            .ok_or(ExpressionError::UnexpectedEnd { expected })?;
        self.position += 1;
        Ok(token)
    }

    fn expect(&mut self, want: &Token, expected: &'static str) -> Result<(), ExpressionError> {
        let token = self.next(expected)?;
        if &token != want {
            return Err(ExpressionError::UnexpectedToken { expected, found: token.describe() });
        }
        Ok(())
    }

    fn parse_expression(&mut self) -> Result<ExprNode, ExpressionError> {
        if matches!(self.peek(), Some(Token::LBracket)) {
            return Ok(ExprNode::List(self.parse_list()?));
        }

        let field = self.parse_field()?;
        let op = match self.next("`==` or `!=`")? {
            Token::EqEq => CompareOp::Eq,
            Token::NotEq => CompareOp::Ne,
            other => {
                return Err(ExpressionError::UnexpectedToken {
                    expected: "`==` or `!=`",
                    found: other.describe(),
                })
            }
        };
        let literal = match self.next("string literal")? {
            Token::Str(value) => value,
            other => {
                return Err(ExpressionError::UnexpectedToken {
                    expected: "string literal",
                    found: other.describe(),
                })
            }
        };

        self.expect(&Token::Question, "`?`")?;
        let when_true = self.parse_list()?;
        self.expect(&Token::Colon, "`:`")?;
        let when_false = self.parse_list()?;

        Ok(ExprNode::Conditional { field, op, literal, when_true, when_false })
    }

    fn parse_list(&mut self) -> Result<Vec<String>, ExpressionError> {
        self.expect(&Token::LBracket, "`[`")?;

        let mut names = Vec::new();
        if matches!(self.peek(), Some(Token::RBracket)) {
            self.position += 1;
            return Ok(names);
        }

        loop {
            match self.next("string literal")? {
                Token::Str(value) => names.push(value),
                other => {
                    return Err(ExpressionError::UnexpectedToken {
                        expected: "string literal",
                        found: other.describe(),
                    })
                }
            }
            match self.next("`,` or `]`")? {
                Token::Comma => {}
                Token::RBracket => break,
                other => {
                    return Err(ExpressionError::UnexpectedToken {
                        expected: "`,` or `]`",
                        found: other.describe(),
                    })
                }
            }
        }

        Ok(names)
    }

    fn parse_field(&mut self) -> Result<String, ExpressionError> {
        match self.next("`request`")? {
            Token::Ident(name) if name == "request" => {}
            other => {
                return Err(ExpressionError::UnexpectedToken {
                    expected: "`request`",
                    found: other.describe(),
                })
            }
        }

        let mut path = String::new();
        while matches!(self.peek(), Some(Token::Dot)) {
            self.position += 1;
            match self.next("field name")? {
                Token::Ident(segment) => {
                    if !path.is_empty() {
                        path.push('.');
                    }
                    path.push_str(&segment);
                }
                other => {
                    return Err(ExpressionError::UnexpectedToken {
                        expected: "field name",
                        found: other.describe(),
                    })
                }
            }
        }

        if path.is_empty() {
            return Err(ExpressionError::UnexpectedEnd { expected: "`.` after `request`" });
        }

        if !self.kind.fields().iter().any(|field| *field == path) {
            return Err(ExpressionError::UnknownField { field: path, kind: self.kind });
        }
        Ok(path)
    }
}
