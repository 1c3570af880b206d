//! Truth-selection expressions.
//!
//! Each truth class is defined by a boolean expression over per-event flag
//! columns, e.g. `jetorigin_isB||jetorigin_isBB||jetorigin_isGBB`. Supported
//! syntax: identifiers, `||`, `&&`, `!` and parentheses. A flag is considered
//! set when its value is `> 0.5`.

use thiserror::Error;

/// Threshold above which a flag column counts as true.
pub const FLAG_THRESHOLD: f32 = 0.5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("empty selection expression")]
    Empty,

    #[error("unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),

    #[error("unexpected token {0} in '{1}'")]
    UnexpectedToken(String, String),

    #[error("unbalanced parentheses in '{0}'")]
    Unbalanced(String),
}

// ============================================================================
// AST
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Flag(usize), // index into `columns`
    Not(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
}

/// A compiled selection expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    source: String,
    ast: Node,
    /// Flag columns referenced by this expression, ordered by first occurrence.
    columns: Vec<String>,
}

impl Selection {
    /// Parse and compile a selection expression.
    pub fn compile(text: &str) -> Result<Self, SelectionError> {
        let tokens = tokenize(text)?;
        if tokens.is_empty() {
            return Err(SelectionError::Empty);
        }
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            columns: Vec::new(),
            source: text,
        };
        let ast = parser.parse_or()?;
        if let Some(tok) = parser.tokens.get(parser.pos) {
            return Err(match tok {
                Token::RParen => SelectionError::Unbalanced(text.to_string()),
                other => SelectionError::UnexpectedToken(format!("{other:?}"), text.to_string()),
            });
        }
        Ok(Self {
            source: text.to_string(),
            ast,
            columns: parser.columns,
        })
    }

    /// The expression text this selection was compiled from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Flag columns this expression reads, in the order `eval` expects them.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Evaluate for one event. `values` must line up with [`Self::columns`].
    pub fn eval(&self, values: &[f32]) -> bool {
        eval_node(&self.ast, values)
    }
}

fn eval_node(node: &Node, values: &[f32]) -> bool {
    match node {
        Node::Flag(i) => values[*i] > FLAG_THRESHOLD,
        Node::Not(a) => !eval_node(a, values),
        Node::And(a, b) => eval_node(a, values) && eval_node(b, values),
        Node::Or(a, b) => eval_node(a, values) || eval_node(b, values),
    }
}

// ============================================================================
// Tokenizer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Or,
    And,
    Not,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, SelectionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
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
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            c if c.is_ascii_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(SelectionError::UnexpectedChar(other, i)),
        }
    }
    Ok(tokens)
}

// ============================================================================
// Recursive-descent parser
// ============================================================================

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    columns: Vec<String>,
    source: &'a str,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn parse_or(&mut self) -> Result<Node, SelectionError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = Node::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Node, SelectionError> {
        let mut lhs = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Node::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Node, SelectionError> {
        match self.peek().cloned() {
            Some(Token::Not) => {
                self.pos += 1;
                Ok(Node::Not(Box::new(self.parse_unary()?)))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.parse_or()?;
                if self.peek() != Some(&Token::RParen) {
                    return Err(SelectionError::Unbalanced(self.source.to_string()));
                }
                self.pos += 1;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                self.pos += 1;
                let idx = match self.columns.iter().position(|c| *c == name) {
                    Some(idx) => idx,
                    None => {
                        self.columns.push(name);
                        self.columns.len() - 1
                    }
                };
                Ok(Node::Flag(idx))
            }
            Some(other) => Err(SelectionError::UnexpectedToken(
                format!("{other:?}"),
                self.source.to_string(),
            )),
            None => Err(SelectionError::UnexpectedToken(
                "end of input".to_string(),
                self.source.to_string(),
            )),
        }
    }
}
