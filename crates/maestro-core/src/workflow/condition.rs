//! Condition expressions for step gating and feedback edges.
//!
//! Expressions are evaluated against a JSON scope with three roots:
//!
//! - `variables` - the run's shared variables (also reachable as bare names)
//! - `input` - the run's input
//! - `steps` - per-step outcomes: `steps.<id>.success`, `steps.<id>.state`,
//!   `steps.<id>.output[.field]`, `steps.<id>.error`, `steps.<id>.attempts`
//!
//! Supported syntax:
//!
//! ```text
//! expr    := or
//! or      := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | compare
//! compare := primary ( ("==" | "!=" | "<" | "<=" | ">" | ">=") primary )?
//! primary := literal | path | "(" expr ")"
//! literal := true | false | null | number | 'text' | "text"
//! path    := ident ( "." ident | "[" integer "]" )*
//! ```
//!
//! Paths that do not resolve evaluate to `null`. A bare value is true when
//! it is not null, not false, not zero and not empty.

use serde_json::Value;
use std::cmp::Ordering;
use thiserror::Error;

/// Errors that can occur while parsing a condition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    /// Empty expression.
    #[error("condition is empty")]
    Empty,

    /// A character that cannot start any token.
    #[error("unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),

    /// A string literal without its closing quote.
    #[error("unterminated string starting at offset {0}")]
    UnterminatedString(usize),

    /// A token in the wrong place.
    #[error("unexpected {0}")]
    UnexpectedToken(String),

    /// Input ended too early.
    #[error("unexpected end of condition")]
    UnexpectedEnd,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Not,
    And,
    Or,
    Op(CompareOp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(Vec<Segment>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
}

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// Parses `source`.
    ///
    /// # Errors
    /// Returns `ConditionError` if the expression is empty or malformed.
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(ConditionError::Empty);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if let Some(token) = parser.peek() {
            return Err(ConditionError::UnexpectedToken(format!("{:?}", token)));
        }
        Ok(Self { source: source.to_string(), expr })
    }

    /// The original expression text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates the condition against `scope`.
    #[must_use]
    pub fn evaluate(&self, scope: &Value) -> bool {
        truthy(&eval(&self.expr, scope))
    }
}

/// Parses and evaluates `source` in one go.
///
/// # Errors
/// Returns `ConditionError` if the expression does not parse.
pub fn evaluate(source: &str, scope: &Value) -> Result<bool, ConditionError> {
    Ok(Condition::parse(source)?.evaluate(scope))
}

fn tokenize(source: &str) -> Result<Vec<Token>, ConditionError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '.' => {
                tokens.push(Token::Dot);
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
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CompareOp::Eq));
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CompareOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' | '>' => {
                let with_eq = chars.get(i + 1) == Some(&'=');
                let op = match (c, with_eq) {
                    ('<', false) => CompareOp::Lt,
                    ('<', true) => CompareOp::Le,
                    ('>', false) => CompareOp::Gt,
                    _ => CompareOp::Ge,
                };
                tokens.push(Token::Op(op));
                i += if with_eq { 2 } else { 1 };
            }
            '\'' | '"' => {
                let start = i;
                i += 1;
                let mut text = String::new();
                loop {
                    match chars.get(i) {
                        None => return Err(ConditionError::UnterminatedString(start)),
                        Some(&ch) if ch == c => {
                            i += 1;
                            break;
                        }
                        Some('\\') if chars.get(i + 1).is_some() => {
                            text.push(chars[i + 1]);
                            i += 2;
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    // A dot not followed by a digit belongs to a path.
                    if chars[i] == '.' && !chars.get(i + 1).is_some_and(char::is_ascii_digit) {
                        break;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text.parse::<f64>().map_err(|_| ConditionError::UnexpectedChar(c, start))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '-')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(ConditionError::UnexpectedChar(other, i)),
        }
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

    fn parse_or(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr, ConditionError> {
        let left = self.parse_primary()?;
        if let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.parse_primary()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, ConditionError> {
        match self.next() {
            None => Err(ConditionError::UnexpectedEnd),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    Some(other) => Err(ConditionError::UnexpectedToken(format!("{:?}", other))),
                    None => Err(ConditionError::UnexpectedEnd),
                }
            }
            Some(Token::Number(n)) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number),
            )),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ => self.parse_path(name),
            },
            Some(other) => Err(ConditionError::UnexpectedToken(format!("{:?}", other))),
        }
    }

    fn parse_path(&mut self, first: String) -> Result<Expr, ConditionError> {
        let mut segments = vec![Segment::Key(first)];
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Ident(key)) => segments.push(Segment::Key(key)),
                        Some(Token::Number(n)) if n >= 0.0 && n.fract() == 0.0 => {
                            segments.push(Segment::Index(n as usize));
                        }
                        Some(other) => {
                            return Err(ConditionError::UnexpectedToken(format!("{:?}", other)));
                        }
                        None => return Err(ConditionError::UnexpectedEnd),
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let segment = match self.next() {
                        Some(Token::Number(n)) if n >= 0.0 && n.fract() == 0.0 => {
                            Segment::Index(n as usize)
                        }
                        Some(Token::Str(key)) => Segment::Key(key),
                        Some(other) => {
                            return Err(ConditionError::UnexpectedToken(format!("{:?}", other)));
                        }
                        None => return Err(ConditionError::UnexpectedEnd),
                    };
                    match self.next() {
                        Some(Token::RBracket) => segments.push(segment),
                        Some(other) => {
                            return Err(ConditionError::UnexpectedToken(format!("{:?}", other)));
                        }
                        None => return Err(ConditionError::UnexpectedEnd),
                    }
                }
                _ => break,
            }
        }
        Ok(Expr::Path(segments))
    }
}

fn eval(expr: &Expr, scope: &Value) -> Value {
    match expr {
        Expr::Literal(value) => value.clone(),
        Expr::Path(segments) => resolve(segments, scope),
        Expr::Not(inner) => Value::Bool(!truthy(&eval(inner, scope))),
        Expr::And(l, r) => Value::Bool(truthy(&eval(l, scope)) && truthy(&eval(r, scope))),
        Expr::Or(l, r) => Value::Bool(truthy(&eval(l, scope)) || truthy(&eval(r, scope))),
        Expr::Compare(op, l, r) => Value::Bool(compare(*op, &eval(l, scope), &eval(r, scope))),
    }
}

fn resolve(segments: &[Segment], scope: &Value) -> Value {
    let rooted = matches!(
        segments.first(),
        Some(Segment::Key(root)) if root == "variables" || root == "input" || root == "steps"
    );

    let mut current = if rooted { scope } else { scope.get("variables").unwrap_or(&Value::Null) };
    for segment in segments {
        let next = match segment {
            Segment::Key(key) => current.get(key.as_str()),
            Segment::Index(index) => current.get(*index),
        };
        match next {
            Some(value) => current = value,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn ordering(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> bool {
    match op {
        CompareOp::Eq => loosely_equal(left, right),
        CompareOp::Ne => !loosely_equal(left, right),
        CompareOp::Lt => ordering(left, right) == Some(Ordering::Less),
        CompareOp::Le => matches!(ordering(left, right), Some(Ordering::Less | Ordering::Equal)),
        CompareOp::Gt => ordering(left, right) == Some(Ordering::Greater),
        CompareOp::Ge => matches!(ordering(left, right), Some(Ordering::Greater | Ordering::Equal)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Value {
        json!({
            "variables": {"score": 7, "mode": "fast", "flags": {"beta": true}, "items": [1, 2]},
            "input": {"city": "Oslo"},
            "steps": {
                "fetch-data": {"success": true, "state": "completed", "output": {"count": 3}},
                "review": {"success": false, "state": "failed", "output": null}
            }
        })
    }

    fn check(expr: &str) -> bool {
        evaluate(expr, &scope()).unwrap()
    }

    #[test]
    fn test_comparisons() {
        assert!(check("score > 5"));
        assert!(check("variables.score >= 7"));
        assert!(!check("score < 7"));
        assert!(check("score <= 7.0"));
        assert!(check("score == 7.0"));
        assert!(check("mode == 'fast'"));
        assert!(check("mode != \"slow\""));
        assert!(check("input.city == 'Oslo'"));
    }

    #[test]
    fn test_step_paths() {
        assert!(check("steps.fetch-data.success"));
        assert!(check("steps.fetch-data.output.count == 3"));
        assert!(check("steps.review.state == 'failed'"));
        assert!(!check("steps.review.success"));
    }

    #[test]
    fn test_boolean_logic_and_grouping() {
        assert!(check("score > 5 && mode == 'fast'"));
        assert!(check("score > 100 || flags.beta"));
        assert!(!check("!(score > 5)"));
        assert!(check("!steps.review.success && (score == 7 || false)"));
    }

    #[test]
    fn test_indexing_and_truthiness() {
        assert!(check("items[1] == 2"));
        assert!(check("items"));
        assert!(!check("missing"));
        assert!(!check("missing.deeper.still"));
        assert!(check("missing == null"));
    }

    #[test]
    fn test_mixed_type_ordering_is_false() {
        assert!(!check("mode > 3"));
        assert!(!check("mode < 3"));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Condition::parse("   "), Err(ConditionError::Empty));
        assert!(matches!(Condition::parse("score >"), Err(ConditionError::UnexpectedEnd)));
        assert!(matches!(Condition::parse("(score > 1"), Err(ConditionError::UnexpectedEnd)));
        assert!(matches!(Condition::parse("'open"), Err(ConditionError::UnterminatedString(0))));
        assert!(matches!(Condition::parse("score # 1"), Err(ConditionError::UnexpectedChar('#', 6))));
        assert!(matches!(Condition::parse("a b"), Err(ConditionError::UnexpectedToken(_))));
    }

    #[test]
    fn test_source_is_kept() {
        let condition = Condition::parse("score > 1").unwrap();
        assert_eq!(condition.source(), "score > 1");
    }
}
