//! Restricted boolean expressions for condition nodes.
//!
//! Source text is parsed into an [`Expr`] tree and evaluated against the
//! trigger input. The only thing that varies between evaluations is the
//! value of named inputs; there are no function calls, attribute access on
//! anything but the input map, or any other way to run code.
//!
//! Supported:
//! - input references, dotted for nested objects: `amount`, `order.total`
//! - literals: numbers, single/double quoted strings, `true`/`false`
//!   (also `True`/`False`), `null` (also `None`)
//! - comparisons: `==`, `!=`, `>`, `<`, `>=`, `<=`
//! - connectives: `&&`/`and`, `||`/`or`, `!`/`not`, parentheses
//!
//! Numbers compare numerically, and a string input that parses as a number
//! compares as one (form inputs usually arrive as text).
//!
//! Sources longer than [`MAX_SOURCE_LEN`] characters or nesting deeper than
//! [`MAX_DEPTH`] (parentheses, `not`, and chained connectives all count) are
//! rejected as parse errors, so evaluation never recurses without bound.

use serde_json::{Map, Value};
use thiserror::Error;

/// Longest accepted source, in characters.
pub const MAX_SOURCE_LEN: usize = 4096;

/// Deepest accepted expression tree.
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("undefined input '{0}'")]
    UndefinedInput(String),
    #[error("cannot order {0}")]
    TypeMismatch(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Num(f64),
    Str(String),
    Bool(bool),
    Null,
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    /// Dotted path into the input map.
    Input(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

impl Expr {
    /// Parse source text into a tree.
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        if source.chars().count() > MAX_SOURCE_LEN {
            return Err(ExpressionError::Parse(format!(
                "expression longer than {MAX_SOURCE_LEN} characters"
            )));
        }
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(ExpressionError::Parse("empty expression".into()));
        }
        let mut parser = Parser { tokens: &tokens, pos: 0, depth: 0 };
        let expr = parser.or_expr()?;
        if let Some(tok) = parser.peek() {
            return Err(ExpressionError::Parse(format!("unexpected token {tok:?}")));
        }
        Ok(expr)
    }

    /// Evaluate to a boolean using truthiness for non-boolean results.
    pub fn evaluate(&self, inputs: &Map<String, Value>) -> Result<bool, ExpressionError> {
        Ok(self.operand(inputs)?.truthy())
    }

    fn operand(&self, inputs: &Map<String, Value>) -> Result<Operand, ExpressionError> {
        match self {
            Expr::Literal(lit) => Ok(Operand::from(lit)),
            Expr::Input(path) => lookup(inputs, path)
                .map(Operand::from)
                .ok_or_else(|| ExpressionError::UndefinedInput(path.clone())),
            Expr::Not(inner) => Ok(Operand::Bool(!inner.evaluate(inputs)?)),
            Expr::And(l, r) => Ok(Operand::Bool(l.evaluate(inputs)? && r.evaluate(inputs)?)),
            Expr::Or(l, r) => Ok(Operand::Bool(l.evaluate(inputs)? || r.evaluate(inputs)?)),
            Expr::Compare { op, left, right } => {
                let l = left.operand(inputs)?;
                let r = right.operand(inputs)?;
                compare(*op, &l, &r).map(Operand::Bool)
            }
        }
    }
}

/// Parse and evaluate in one go.
pub fn evaluate(source: &str, inputs: &Map<String, Value>) -> Result<bool, ExpressionError> {
    Expr::parse(source)?.evaluate(inputs)
}

fn lookup<'a>(inputs: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = inputs.get(segments.next()?)?;
    for segment in segments {
        current = current.get(segment)?;
    }
    Some(current)
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Num(f64),
    Str(String),
    Bool(bool),
    Null,
    /// An array or object input; only its emptiness matters.
    Composite(bool),
}

impl Operand {
    fn truthy(&self) -> bool {
        match self {
            Self::Num(n) => *n != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::Bool(b) => *b,
            Self::Null => false,
            Self::Composite(non_empty) => *non_empty,
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Self::Num(n) => Some(*n),
            Self::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Num(_) => "number",
            Self::Str(_) => "string",
            Self::Bool(_) => "bool",
            Self::Null => "null",
            Self::Composite(_) => "array/object",
        }
    }
}

impl From<&Literal> for Operand {
    fn from(lit: &Literal) -> Self {
        match lit {
            Literal::Num(n) => Self::Num(*n),
            Literal::Str(s) => Self::Str(s.clone()),
            Literal::Bool(b) => Self::Bool(*b),
            Literal::Null => Self::Null,
        }
    }
}

impl From<&Value> for Operand {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => n.as_f64().map_or(Self::Null, Self::Num),
            Value::String(s) => Self::Str(s.clone()),
            Value::Array(a) => Self::Composite(!a.is_empty()),
            Value::Object(o) => Self::Composite(!o.is_empty()),
        }
    }
}

fn compare(op: CompareOp, l: &Operand, r: &Operand) -> Result<bool, ExpressionError> {
    // At least one side must be a real number before text is coerced, so
    // `"10" == "10.0"` stays a string comparison.
    let numeric = matches!(l, Operand::Num(_)) || matches!(r, Operand::Num(_));
    if numeric {
        if let (Some(a), Some(b)) = (l.as_number(), r.as_number()) {
            return Ok(match op {
                CompareOp::Eq => a == b,
                CompareOp::Ne => a != b,
                CompareOp::Gt => a > b,
                CompareOp::Lt => a < b,
                CompareOp::Ge => a >= b,
                CompareOp::Le => a <= b,
            });
        }
    }

    match op {
        CompareOp::Eq => Ok(l == r),
        CompareOp::Ne => Ok(l != r),
        _ => match (l, r) {
            (Operand::Str(a), Operand::Str(b)) => Ok(match op {
                CompareOp::Gt => a > b,
                CompareOp::Lt => a < b,
                CompareOp::Ge => a >= b,
                _ => a <= b,
            }),
            _ => Err(ExpressionError::TypeMismatch(format!("{} and {}", l.kind(), r.kind()))),
        },
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
    Op(CompareOp),
    And,
    Or,
    Not,
    Minus,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let next_is = |i: usize, c: char| chars.get(i + 1) == Some(&c);

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
            '=' if next_is(i, '=') => {
                tokens.push(Token::Op(CompareOp::Eq));
                i += 2;
            }
            '!' if next_is(i, '=') => {
                tokens.push(Token::Op(CompareOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' | '<' => {
                let (strict, inclusive) = if c == '>' {
                    (CompareOp::Gt, CompareOp::Ge)
                } else {
                    (CompareOp::Lt, CompareOp::Le)
                };
                if next_is(i, '=') {
                    tokens.push(Token::Op(inclusive));
                    i += 2;
                } else {
                    tokens.push(Token::Op(strict));
                    i += 1;
                }
            }
            '&' if next_is(i, '&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next_is(i, '|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '"' | '\'' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&ch| ch == c)
                    .ok_or_else(|| ExpressionError::Parse("unterminated string literal".into()))?;
                tokens.push(Token::Str(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse()
                    .map_err(|_| ExpressionError::Parse(format!("invalid number '{text}'")))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" | "True" => Token::Bool(true),
                    "false" | "False" => Token::Bool(false),
                    "null" | "None" => Token::Null,
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(ExpressionError::Parse(format!("unexpected character '{other}'")));
            }
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser. Precedence: not > comparison > and > or
// ---------------------------------------------------------------------------

struct Parser<'t> {
    tokens: &'t [Token],
    pos: usize,
    /// Depth of the tree being built above the current position.
    depth: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos);
        self.pos += 1;
        tok
    }

    fn descend(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExpressionError::Parse(format!("expression nested deeper than {MAX_DEPTH}")));
        }
        Ok(())
    }

    fn or_expr(&mut self) -> Result<Expr, ExpressionError> {
        let base = self.depth;
        let result = self.or_chain();
        self.depth = base;
        result
    }

    // Chains are left-deep, so every link adds a level.
    fn or_chain(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            self.descend()?;
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, ExpressionError> {
        let base = self.depth;
        let result = self.and_chain();
        self.depth = base;
        result
    }

    fn and_chain(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.not_expr()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            self.descend()?;
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, ExpressionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            self.descend()?;
            let inner = self.not_expr();
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.primary()?;
        if let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.primary()?;
            return Ok(Expr::Compare { op, left: Box::new(left), right: Box::new(right) });
        }
        Ok(left)
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.advance().cloned() {
            Some(Token::Num(n)) => Ok(Expr::Literal(Literal::Num(n))),
            Some(Token::Minus) => match self.advance() {
                Some(Token::Num(n)) => Ok(Expr::Literal(Literal::Num(-n))),
                other => Err(ExpressionError::Parse(format!("expected number after '-', got {other:?}"))),
            },
            Some(Token::Str(s)) => Ok(Expr::Literal(Literal::Str(s))),
            Some(Token::Bool(b)) => Ok(Expr::Literal(Literal::Bool(b))),
            Some(Token::Null) => Ok(Expr::Literal(Literal::Null)),
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    return Err(ExpressionError::Parse(format!("function calls are not allowed ('{name}')")));
                }
                Ok(Expr::Input(name))
            }
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.or_expr();
                self.depth -= 1;
                let inner = inner?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ExpressionError::Parse("missing ')'".into())),
                }
            }
            Some(other) => Err(ExpressionError::Parse(format!("expected a value, got {other:?}"))),
            None => Err(ExpressionError::Parse("unexpected end of expression".into())),
        }
    }
}
