//! Safety checker and evaluator for conditional-edge expressions.
//!
//! Conditions are parsed into a closed AST that can only express
//! side-effect-free boolean logic over already-materialized values:
//! literals, allowed names, attribute/subscript access, arithmetic,
//! comparisons (including `in` and `is`), and `and`/`or`/`not`.
//! Call syntax is unrepresentable — a `(` following a value position
//! is a parse error — so no expression can ever invoke code.

use std::collections::HashSet;
use std::fmt;

use gantry_core::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ExprError {
    #[error("empty expression")]
    Empty,
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },
    #[error("name '{0}' is not in the allowed symbol set")]
    DisallowedName(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Is,
    IsNot,
    In,
    NotIn,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Is => "is",
            CompareOp::IsNot => "is not",
            CompareOp::In => "in",
            CompareOp::NotIn => "not in",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Name(String),
    Attribute { base: Box<Expr>, attr: String },
    Index { base: Box<Expr>, index: Box<Expr> },
    Not(Box<Expr>),
    Neg(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Arith { op: ArithOp, lhs: Box<Expr>, rhs: Box<Expr> },
    Compare { op: CompareOp, lhs: Box<Expr>, rhs: Box<Expr> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Name(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    In,
    Is,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let start = i;
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                i += 1;
            }
            '(' => {
                tokens.push((start, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((start, Token::RParen));
                i += 1;
            }
            '[' => {
                tokens.push((start, Token::LBracket));
                i += 1;
            }
            ']' => {
                tokens.push((start, Token::RBracket));
                i += 1;
            }
            '.' => {
                tokens.push((start, Token::Dot));
                i += 1;
            }
            '+' => {
                tokens.push((start, Token::Plus));
                i += 1;
            }
            '-' => {
                tokens.push((start, Token::Minus));
                i += 1;
            }
            '*' => {
                tokens.push((start, Token::Star));
                i += 1;
            }
            '/' => {
                tokens.push((start, Token::Slash));
                i += 1;
            }
            '%' => {
                tokens.push((start, Token::Percent));
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push((start, Token::Eq));
                    i += 2;
                } else {
                    return Err(ExprError::Syntax {
                        offset: start,
                        message: "assignment is not permitted".to_string(),
                    });
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push((start, Token::Ne));
                    i += 2;
                } else {
                    return Err(ExprError::Syntax {
                        offset: start,
                        message: "unexpected '!'".to_string(),
                    });
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push((start, Token::Le));
                    i += 2;
                } else {
                    tokens.push((start, Token::Lt));
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push((start, Token::Ge));
                    i += 2;
                } else {
                    tokens.push((start, Token::Gt));
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                i += 1;
                let mut text = String::new();
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some(&escaped) => text.push(escaped),
                                None => {
                                    return Err(ExprError::Syntax {
                                        offset: start,
                                        message: "unterminated string literal".to_string(),
                                    })
                                }
                            }
                            i += 2;
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                        None => {
                            return Err(ExprError::Syntax {
                                offset: start,
                                message: "unterminated string literal".to_string(),
                            })
                        }
                    }
                }
                tokens.push((start, Token::Str(text)));
            }
            '0'..='9' => {
                let mut end = i;
                while end < chars.len() && (chars[end].is_ascii_digit() || chars[end] == '.') {
                    end += 1;
                }
                let text: String = chars[i..end].iter().collect();
                let number = text.parse::<f64>().map_err(|_| ExprError::Syntax {
                    offset: start,
                    message: format!("invalid number literal '{text}'"),
                })?;
                tokens.push((start, Token::Number(number)));
                i = end;
            }
            _ if c.is_alphabetic() || c == '_' => {
                let mut end = i;
                while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
                    end += 1;
                }
                let word: String = chars[i..end].iter().collect();
                let token = match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    "is" => Token::Is,
                    "true" | "True" => Token::True,
                    "false" | "False" => Token::False,
                    "none" | "None" | "null" => Token::Null,
                    "lambda" => {
                        return Err(ExprError::Syntax {
                            offset: start,
                            message: "lambda expressions are not permitted".to_string(),
                        })
                    }
                    _ => Token::Name(word),
                };
                tokens.push((start, token));
                i = end;
            }
            _ => {
                return Err(ExprError::Syntax {
                    offset: start,
                    message: format!("unexpected character '{c}'"),
                })
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    input_len: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, token)| token)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(offset, _)| *offset)
            .unwrap_or(self.input_len)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, token)| token.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ExprError> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    fn error(&self, message: String) -> ExprError {
        ExprError::Syntax {
            offset: self.offset(),
            message,
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_and()?;
        while self.eat(&Token::Or) {
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_not()?;
        while self.eat(&Token::And) {
            let rhs = self.parse_not()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Token::Not) {
            // `not in` handled in parse_comparison; a leading `not`
            // here is logical negation.
            let operand = self.parse_not()?;
            return Ok(Expr::Not(Box::new(operand)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.parse_sum()?;
        let op = match self.peek() {
            Some(Token::Eq) => Some(CompareOp::Eq),
            Some(Token::Ne) => Some(CompareOp::Ne),
            Some(Token::Lt) => Some(CompareOp::Lt),
            Some(Token::Le) => Some(CompareOp::Le),
            Some(Token::Gt) => Some(CompareOp::Gt),
            Some(Token::Ge) => Some(CompareOp::Ge),
            Some(Token::In) => Some(CompareOp::In),
            Some(Token::Is) => Some(CompareOp::Is),
            Some(Token::Not) => Some(CompareOp::NotIn),
            _ => None,
        };
        let Some(mut op) = op else {
            return Ok(lhs);
        };
        self.advance();
        match op {
            CompareOp::Is => {
                if self.eat(&Token::Not) {
                    op = CompareOp::IsNot;
                }
            }
            CompareOp::NotIn => {
                // Only `not in` is a valid infix use of `not`.
                self.expect(Token::In, "'in' after 'not'")?;
            }
            _ => {}
        }
        let rhs = self.parse_sum()?;
        Ok(Expr::Compare {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn parse_sum(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => ArithOp::Add,
                Some(Token::Minus) => ArithOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_term()?;
            lhs = Expr::Arith {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_term(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => ArithOp::Mul,
                Some(Token::Slash) => ArithOp::Div,
                Some(Token::Percent) => ArithOp::Mod,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::Arith {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Token::Minus) {
            let operand = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(operand)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let attr = match self.advance() {
                    Some(Token::Name(name)) => name,
                    _ => return Err(self.error("expected attribute name after '.'".to_string())),
                };
                expr = Expr::Attribute {
                    base: Box::new(expr),
                    attr,
                };
            } else if self.eat(&Token::LBracket) {
                let index = self.parse_or()?;
                self.expect(Token::RBracket, "']'")?;
                expr = Expr::Index {
                    base: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.peek() == Some(&Token::LParen) {
                return Err(self.error("function calls are not permitted".to_string()));
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        match self.advance() {
            Some(Token::Number(number)) => {
                let value = serde_json::Number::from_f64(number)
                    .map(Value::Number)
                    .unwrap_or(Value::Null);
                Ok(Expr::Literal(value))
            }
            Some(Token::Str(text)) => Ok(Expr::Literal(Value::String(text))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Name(name)) => Ok(Expr::Name(name)),
            Some(Token::LParen) => {
                let expr = self.parse_or()?;
                self.expect(Token::RParen, "')'")?;
                Ok(expr)
            }
            Some(token) => Err(ExprError::Syntax {
                offset: self.tokens[self.pos - 1].0,
                message: format!("unexpected token {token:?}"),
            }),
            None => Err(self.error("unexpected end of expression".to_string())),
        }
    }
}

fn check_names(expr: &Expr, allowed: &HashSet<String>) -> Result<(), ExprError> {
    match expr {
        Expr::Literal(_) => Ok(()),
        Expr::Name(name) => {
            if allowed.contains(name) {
                Ok(())
            } else {
                Err(ExprError::DisallowedName(name.clone()))
            }
        }
        Expr::Attribute { base, .. } => check_names(base, allowed),
        Expr::Index { base, index } => {
            check_names(base, allowed)?;
            check_names(index, allowed)
        }
        Expr::Not(operand) | Expr::Neg(operand) => check_names(operand, allowed),
        Expr::And(lhs, rhs) | Expr::Or(lhs, rhs) => {
            check_names(lhs, allowed)?;
            check_names(rhs, allowed)
        }
        Expr::Arith { lhs, rhs, .. } | Expr::Compare { lhs, rhs, .. } => {
            check_names(lhs, allowed)?;
            check_names(rhs, allowed)
        }
    }
}

/// Parses a single evaluable expression and verifies every bare name
/// against the allowed-symbol set.
pub fn parse_expression(input: &str, allowed: &HashSet<String>) -> Result<Expr, ExprError> {
    if input.trim().is_empty() {
        return Err(ExprError::Empty);
    }
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        input_len: input.len(),
    };
    let expr = parser.parse_or()?;
    if parser.peek().is_some() {
        return Err(parser.error("trailing input after expression".to_string()));
    }
    check_names(&expr, allowed)?;
    Ok(expr)
}

/// The `(is_safe, reason)` contract form. The reason is empty for safe
/// expressions and the verbatim parse/check error otherwise.
pub fn check_expression(input: &str, allowed: &HashSet<String>) -> (bool, String) {
    match parse_expression(input, allowed) {
        Ok(_) => (true, String::new()),
        Err(err) => (false, err.to_string()),
    }
}

/// JSON truthiness: `null`, `false`, `0`, `""`, `[]`, and `{}` are
/// falsy, everything else truthy.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn numbers(lhs: &Value, rhs: &Value) -> Option<(f64, f64)> {
    Some((lhs.as_f64()?, rhs.as_f64()?))
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    if let Some((l, r)) = numbers(lhs, rhs) {
        return l == r;
    }
    lhs == rhs
}

fn contains(needle: &Value, haystack: &Value) -> bool {
    match haystack {
        Value::String(s) => needle.as_str().map_or(false, |n| s.contains(n)),
        Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        Value::Object(map) => needle.as_str().map_or(false, |n| map.contains_key(n)),
        _ => false,
    }
}

fn index_value(base: &Value, key: &Value) -> Value {
    match (base, key) {
        (Value::Object(map), Value::String(k)) => map.get(k).cloned().unwrap_or(Value::Null),
        (Value::Array(items), _) => key
            .as_f64()
            .and_then(|f| {
                let idx = f as i64;
                if idx >= 0 {
                    items.get(idx as usize).cloned()
                } else {
                    let back = items.len() as i64 + idx;
                    usize::try_from(back).ok().and_then(|i| items.get(i).cloned())
                }
            })
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

/// Evaluates a checked expression against a scope of name bindings.
/// Missing names and out-of-range accesses evaluate to `null` rather
/// than failing; conditions over absent data are simply false.
pub fn evaluate(expr: &Expr, scope: &std::collections::HashMap<String, Value>) -> Value {
    match expr {
        Expr::Literal(value) => value.clone(),
        Expr::Name(name) => scope.get(name).cloned().unwrap_or(Value::Null),
        Expr::Attribute { base, attr } => {
            let base = evaluate(base, scope);
            index_value(&base, &Value::String(attr.clone()))
        }
        Expr::Index { base, index } => {
            let base = evaluate(base, scope);
            let key = evaluate(index, scope);
            index_value(&base, &key)
        }
        Expr::Not(operand) => Value::Bool(!truthy(&evaluate(operand, scope))),
        Expr::Neg(operand) => evaluate(operand, scope)
            .as_f64()
            .and_then(|f| serde_json::Number::from_f64(-f))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Expr::And(lhs, rhs) => {
            let left = evaluate(lhs, scope);
            if truthy(&left) {
                evaluate(rhs, scope)
            } else {
                left
            }
        }
        Expr::Or(lhs, rhs) => {
            let left = evaluate(lhs, scope);
            if truthy(&left) {
                left
            } else {
                evaluate(rhs, scope)
            }
        }
        Expr::Arith { op, lhs, rhs } => {
            let left = evaluate(lhs, scope);
            let right = evaluate(rhs, scope);
            if let (ArithOp::Add, Value::String(l), Value::String(r)) = (op, &left, &right) {
                return Value::String(format!("{l}{r}"));
            }
            let Some((l, r)) = numbers(&left, &right) else {
                return Value::Null;
            };
            let result = match op {
                ArithOp::Add => l + r,
                ArithOp::Sub => l - r,
                ArithOp::Mul => l * r,
                ArithOp::Div => {
                    if r == 0.0 {
                        return Value::Null;
                    }
                    l / r
                }
                ArithOp::Mod => {
                    if r == 0.0 {
                        return Value::Null;
                    }
                    l % r
                }
            };
            serde_json::Number::from_f64(result)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
        Expr::Compare { op, lhs, rhs } => {
            let left = evaluate(lhs, scope);
            let right = evaluate(rhs, scope);
            let outcome = match op {
                CompareOp::Eq | CompareOp::Is => values_equal(&left, &right),
                CompareOp::Ne | CompareOp::IsNot => !values_equal(&left, &right),
                CompareOp::In => contains(&left, &right),
                CompareOp::NotIn => !contains(&left, &right),
                CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
                    let ordering = match (&left, &right) {
                        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
                        _ => numbers(&left, &right).map(|(l, r)| {
                            l.partial_cmp(&r).unwrap_or(std::cmp::Ordering::Equal)
                        }),
                    };
                    match (op, ordering) {
                        (_, None) => false,
                        (CompareOp::Lt, Some(ord)) => ord.is_lt(),
                        (CompareOp::Le, Some(ord)) => ord.is_le(),
                        (CompareOp::Gt, Some(ord)) => ord.is_gt(),
                        (CompareOp::Ge, Some(ord)) => ord.is_ge(),
                        _ => false,
                    }
                }
            };
            Value::Bool(outcome)
        }
    }
}
