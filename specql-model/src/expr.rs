//! Expression language used in conditions, assignments and payloads.
//!
//! Expressions are written as text inside spec documents:
//!
//! ```text
//! status IN ('active', 'pending') AND $input.quantity > 0
//! NOT EXISTS(Contact WHERE email = $input.email)
//! item.price * item.quantity
//! ```
//!
//! Parsing is done by a small recursive-descent parser; [`Expr`]'s `Display`
//! prints the canonical text back, parenthesizing only where precedence
//! requires it, so printing and re-parsing yields the same tree.

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Literal {
    pub fn to_json(&self) -> Value {
        match self {
            Literal::Null => Value::Null,
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Int(i) => Value::from(*i),
            Literal::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Literal::Text(s) => Value::String(s.clone()),
        }
    }
}

/// Runtime variables available to every action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContextVar {
    AuthUserId,
    AuthTenantId,
    /// External id of the row the action operates on.
    EntityId,
    Now,
}

impl ContextVar {
    pub const ALL: [ContextVar; 4] = [
        ContextVar::AuthUserId,
        ContextVar::AuthTenantId,
        ContextVar::EntityId,
        ContextVar::Now,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ContextVar::AuthUserId => "auth_user_id",
            ContextVar::AuthTenantId => "auth_tenant_id",
            ContextVar::EntityId => "entity_id",
            ContextVar::Now => "now",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.name() == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

impl LogicalOp {
    pub fn keyword(&self) -> &'static str {
        match self {
            LogicalOp::And => "AND",
            LogicalOp::Or => "OR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl ArithOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            ArithOp::Add | ArithOp::Sub => 5,
            ArithOp::Mul | ArithOp::Div => 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    /// Dotted reference: a field of the current entity (`status`), a field of
    /// a loop item or stored alias (`item.price`, `contact.id`).
    Path(Vec<String>),
    /// `$input.<name>`
    Input(String),
    Context(ContextVar),
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        operands: Vec<Expr>,
    },
    Not(Box<Expr>),
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    In {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    Arith {
        op: ArithOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Exists {
        entity: String,
        condition: Option<Box<Expr>>,
        negated: bool,
    },
    Count {
        entity: String,
        condition: Option<Box<Expr>>,
    },
    /// Row set used as a `foreach` collection.
    Rows {
        entity: String,
        condition: Option<Box<Expr>>,
    },
}

impl Expr {
    pub fn input(name: impl Into<String>) -> Self {
        Expr::Input(name.into())
    }

    /// `"item.price"` -> `Path(["item", "price"])`
    pub fn path(dotted: &str) -> Self {
        Expr::Path(dotted.split('.').map(str::to_string).collect())
    }

    pub fn text(s: impl Into<String>) -> Self {
        Expr::Literal(Literal::Text(s.into()))
    }

    pub fn compare(op: CompareOp, left: Expr, right: Expr) -> Self {
        Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn eq(left: Expr, right: Expr) -> Self {
        Self::compare(CompareOp::Eq, left, right)
    }

    pub fn in_list(expr: Expr, list: Vec<Expr>) -> Self {
        Expr::In {
            expr: Box::new(expr),
            list,
            negated: false,
        }
    }

    /// Conjunction of `operands`, flattening nested ANDs. A single operand is
    /// returned unchanged.
    pub fn and(operands: Vec<Expr>) -> Self {
        let mut flat = Vec::with_capacity(operands.len());
        for operand in operands {
            match operand {
                Expr::Logical {
                    op: LogicalOp::And,
                    operands,
                } => flat.extend(operands),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            flat.remove(0)
        } else {
            Expr::Logical {
                op: LogicalOp::And,
                operands: flat,
            }
        }
    }

    /// Visit this expression and every sub-expression, pre-order, left to right.
    /// Conditions nested in built-ins are visited too.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Literal(_) | Expr::Path(_) | Expr::Input(_) | Expr::Context(_) => {}
            Expr::Compare { left, right, .. } | Expr::Arith { left, right, .. } => {
                left.walk(f);
                right.walk(f);
            }
            Expr::Logical { operands, .. } => operands.iter().for_each(|e| e.walk(f)),
            Expr::Not(inner) => inner.walk(f),
            Expr::IsNull { expr, .. } => expr.walk(f),
            Expr::In { expr, list, .. } => {
                expr.walk(f);
                list.iter().for_each(|e| e.walk(f));
            }
            Expr::Exists { condition, .. }
            | Expr::Count { condition, .. }
            | Expr::Rows { condition, .. } => {
                if let Some(c) = condition {
                    c.walk(f);
                }
            }
        }
    }

    /// Names read through `$input.*`, in first-appearance order.
    pub fn input_refs(&self) -> Vec<&str> {
        let mut refs: Vec<&str> = Vec::new();
        self.walk(&mut |e| {
            if let Expr::Input(name) = e {
                if !refs.contains(&name.as_str()) {
                    refs.push(name);
                }
            }
        });
        refs
    }

    fn precedence(&self) -> u8 {
        match self {
            Expr::Logical {
                op: LogicalOp::Or, ..
            } => 1,
            Expr::Logical {
                op: LogicalOp::And,
                ..
            } => 2,
            Expr::Not(_) | Expr::Exists { negated: true, .. } => 3,
            Expr::Compare { .. } | Expr::IsNull { .. } | Expr::In { .. } => 4,
            Expr::Arith { op, .. } => op.precedence(),
            _ => 7,
        }
    }

    fn fmt_prec(&self, f: &mut fmt::Formatter<'_>, min: u8) -> fmt::Result {
        if self.precedence() < min {
            write!(f, "(")?;
            self.fmt_bare(f)?;
            write!(f, ")")
        } else {
            self.fmt_bare(f)
        }
    }

    fn fmt_bare(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(lit) => fmt_literal(lit, f),
            Expr::Path(parts) => write!(f, "{}", parts.join(".")),
            Expr::Input(name) => write!(f, "$input.{}", name),
            Expr::Context(var) => write!(f, "${}", var.name()),
            Expr::Compare { op, left, right } => {
                left.fmt_prec(f, 5)?;
                write!(f, " {} ", op.symbol())?;
                right.fmt_prec(f, 5)
            }
            Expr::Logical { op, operands } => {
                let min = self.precedence() + 1;
                for (i, operand) in operands.iter().enumerate() {
                    if i > 0 {
                        write!(f, " {} ", op.keyword())?;
                    }
                    operand.fmt_prec(f, min)?;
                }
                Ok(())
            }
            Expr::Not(inner) => {
                write!(f, "NOT ")?;
                inner.fmt_prec(f, 3)
            }
            Expr::IsNull { expr, negated } => {
                expr.fmt_prec(f, 5)?;
                write!(f, "{}", if *negated { " IS NOT NULL" } else { " IS NULL" })
            }
            Expr::In {
                expr,
                list,
                negated,
            } => {
                expr.fmt_prec(f, 5)?;
                write!(f, "{}", if *negated { " NOT IN (" } else { " IN (" })?;
                for (i, item) in list.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    item.fmt_prec(f, 1)?;
                }
                write!(f, ")")
            }
            Expr::Arith { op, left, right } => {
                left.fmt_prec(f, op.precedence())?;
                write!(f, " {} ", op.symbol())?;
                right.fmt_prec(f, op.precedence() + 1)
            }
            Expr::Exists {
                entity,
                condition,
                negated,
            } => {
                if *negated {
                    write!(f, "NOT ")?;
                }
                fmt_builtin(f, "EXISTS", entity, condition.as_deref())
            }
            Expr::Count { entity, condition } => {
                fmt_builtin(f, "COUNT", entity, condition.as_deref())
            }
            Expr::Rows { entity, condition } => {
                fmt_builtin(f, "ROWS", entity, condition.as_deref())
            }
        }
    }
}

fn fmt_literal(lit: &Literal, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match lit {
        Literal::Null => write!(f, "NULL"),
        Literal::Bool(true) => write!(f, "TRUE"),
        Literal::Bool(false) => write!(f, "FALSE"),
        Literal::Int(i) => write!(f, "{}", i),
        Literal::Float(x) => write!(f, "{:?}", x),
        Literal::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
    }
}

fn fmt_builtin(
    f: &mut fmt::Formatter<'_>,
    keyword: &str,
    entity: &str,
    condition: Option<&Expr>,
) -> fmt::Result {
    write!(f, "{}({}", keyword, entity)?;
    if let Some(c) = condition {
        write!(f, " WHERE ")?;
        c.fmt_prec(f, 1)?;
    }
    write!(f, ")")
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_bare(f)
    }
}

impl From<Literal> for Expr {
    fn from(lit: Literal) -> Self {
        Expr::Literal(lit)
    }
}

/// Error produced when expression text cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExprParseError {
    pub input: String,
    pub position: usize,
    pub message: String,
}

impl fmt::Display for ExprParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "malformed expression `{}` at offset {}: {}",
            self.input, self.position, self.message
        )
    }
}

impl std::error::Error for ExprParseError {}

impl FromStr for Expr {
    type Err = ExprParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens = tokenize(s)?;
        let mut parser = Parser {
            source: s,
            tokens,
            pos: 0,
        };
        let expr = parser.parse_or()?;
        if parser.pos < parser.tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(expr)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Input(String),
    Var(String),
    Str(String),
    Int(i64),
    Float(f64),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
    Dot,
}

fn tokenize(src: &str) -> Result<Vec<(Token, usize)>, ExprParseError> {
    let err = |position: usize, message: &str| ExprParseError {
        input: src.to_string(),
        position,
        message: message.to_string(),
    };
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let read_ident = |start: usize| -> (String, usize) {
        let mut j = start;
        let mut s = String::new();
        while j < chars.len() && (chars[j].1.is_ascii_alphanumeric() || chars[j].1 == '_') {
            s.push(chars[j].1);
            j += 1;
        }
        (s, j)
    };

    while i < chars.len() {
        let (offset, c) = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push((Token::LParen, offset));
                i += 1;
            }
            ')' => {
                tokens.push((Token::RParen, offset));
                i += 1;
            }
            ',' => {
                tokens.push((Token::Comma, offset));
                i += 1;
            }
            '.' => {
                tokens.push((Token::Dot, offset));
                i += 1;
            }
            '\'' => {
                let mut s = String::new();
                let mut j = i + 1;
                loop {
                    match chars.get(j) {
                        None => return Err(err(offset, "unterminated string literal")),
                        Some((_, '\'')) if chars.get(j + 1).map(|c| c.1) == Some('\'') => {
                            s.push('\'');
                            j += 2;
                        }
                        Some((_, '\'')) => break,
                        Some((_, ch)) => {
                            s.push(*ch);
                            j += 1;
                        }
                    }
                }
                tokens.push((Token::Str(s), offset));
                i = j + 1;
            }
            '$' => {
                let (name, j) = read_ident(i + 1);
                if name.is_empty() {
                    return Err(err(offset, "expected variable name after '$'"));
                }
                if name == "input" {
                    if chars.get(j).map(|c| c.1) != Some('.') {
                        return Err(err(offset, "expected '.' after $input"));
                    }
                    let (field, k) = read_ident(j + 1);
                    if field.is_empty() {
                        return Err(err(offset, "expected field name after $input."));
                    }
                    tokens.push((Token::Input(field), offset));
                    i = k;
                } else {
                    tokens.push((Token::Var(name), offset));
                    i = j;
                }
            }
            c if c.is_ascii_digit() => {
                let mut j = i;
                let mut text = String::new();
                let mut is_float = false;
                while j < chars.len() && chars[j].1.is_ascii_digit() {
                    text.push(chars[j].1);
                    j += 1;
                }
                if j + 1 < chars.len() && chars[j].1 == '.' && chars[j + 1].1.is_ascii_digit() {
                    is_float = true;
                    text.push('.');
                    j += 1;
                    while j < chars.len() && chars[j].1.is_ascii_digit() {
                        text.push(chars[j].1);
                        j += 1;
                    }
                }
                if j < chars.len() && (chars[j].1 == 'e' || chars[j].1 == 'E') {
                    let mut k = j + 1;
                    let mut exp = String::from("e");
                    if k < chars.len() && (chars[k].1 == '+' || chars[k].1 == '-') {
                        exp.push(chars[k].1);
                        k += 1;
                    }
                    if k < chars.len() && chars[k].1.is_ascii_digit() {
                        while k < chars.len() && chars[k].1.is_ascii_digit() {
                            exp.push(chars[k].1);
                            k += 1;
                        }
                        is_float = true;
                        text.push_str(&exp);
                        j = k;
                    }
                }
                let token = if is_float {
                    Token::Float(text.parse().map_err(|_| err(offset, "invalid number"))?)
                } else {
                    Token::Int(text.parse().map_err(|_| err(offset, "integer out of range"))?)
                };
                tokens.push((token, offset));
                i = j;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let (name, j) = read_ident(i);
                tokens.push((Token::Ident(name), offset));
                i = j;
            }
            _ => {
                let next = chars.get(i + 1).map(|c| c.1);
                let (op, width) = match (c, next) {
                    ('=', Some('=')) => ("=", 2),
                    ('=', _) => ("=", 1),
                    ('!', Some('=')) => ("!=", 2),
                    ('<', Some('>')) => ("!=", 2),
                    ('<', Some('=')) => ("<=", 2),
                    ('<', _) => ("<", 1),
                    ('>', Some('=')) => (">=", 2),
                    ('>', _) => (">", 1),
                    ('+', _) => ("+", 1),
                    ('-', _) => ("-", 1),
                    ('*', _) => ("*", 1),
                    ('/', _) => ("/", 1),
                    _ => return Err(err(offset, &format!("unexpected character '{}'", c))),
                };
                tokens.push((Token::Op(op), offset));
                i += width;
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, message: &str) -> ExprParseError {
        let position = self
            .tokens
            .get(self.pos)
            .map(|(_, offset)| *offset)
            .unwrap_or(self.source.len());
        ExprParseError {
            input: self.source.to_string(),
            position,
            message: message.to_string(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Token> {
        self.tokens.get(self.pos + ahead).map(|(t, _)| t)
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        self.peek_keyword_at(0, keyword)
    }

    fn peek_keyword_at(&self, ahead: usize, keyword: &str) -> bool {
        matches!(self.peek_at(ahead), Some(Token::Ident(name)) if name.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Some(Token::Op(o)) if *o == op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<(), ExprParseError> {
        if self.peek() == Some(&token) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected {}", what)))
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExprParseError> {
        let mut operands = vec![self.parse_and()?];
        while self.eat_keyword("OR") {
            operands.push(self.parse_and()?);
        }
        Ok(fold_logical(LogicalOp::Or, operands))
    }

    fn parse_and(&mut self) -> Result<Expr, ExprParseError> {
        let mut operands = vec![self.parse_not()?];
        while self.eat_keyword("AND") {
            operands.push(self.parse_not()?);
        }
        Ok(fold_logical(LogicalOp::And, operands))
    }

    fn parse_not(&mut self) -> Result<Expr, ExprParseError> {
        if self.peek_keyword("NOT") {
            if self.peek_keyword_at(1, "EXISTS") && self.peek_at(2) == Some(&Token::LParen) {
                self.pos += 2;
                let (entity, condition) = self.parse_builtin_body()?;
                return Ok(Expr::Exists {
                    entity,
                    condition,
                    negated: true,
                });
            }
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprParseError> {
        let left = self.parse_additive()?;

        if self.eat_keyword("IS") {
            let negated = self.eat_keyword("NOT");
            if !self.eat_keyword("NULL") {
                return Err(self.error("expected NULL after IS"));
            }
            return Ok(Expr::IsNull {
                expr: Box::new(left),
                negated,
            });
        }

        let negated_in = self.peek_keyword("NOT") && self.peek_keyword_at(1, "IN");
        if negated_in || self.peek_keyword("IN") {
            self.pos += if negated_in { 2 } else { 1 };
            self.expect(Token::LParen, "'(' after IN")?;
            let mut list = Vec::new();
            if self.peek() != Some(&Token::RParen) {
                loop {
                    list.push(self.parse_or()?);
                    if self.peek() == Some(&Token::Comma) {
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
            }
            self.expect(Token::RParen, "')' to close IN list")?;
            return Ok(Expr::In {
                expr: Box::new(left),
                list,
                negated: negated_in,
            });
        }

        let op = match self.peek() {
            Some(Token::Op("=")) => CompareOp::Eq,
            Some(Token::Op("!=")) => CompareOp::Ne,
            Some(Token::Op("<")) => CompareOp::Lt,
            Some(Token::Op("<=")) => CompareOp::Le,
            Some(Token::Op(">")) => CompareOp::Gt,
            Some(Token::Op(">=")) => CompareOp::Ge,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_additive()?;
        Ok(Expr::compare(op, left, right))
    }

    fn parse_additive(&mut self) -> Result<Expr, ExprParseError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = if self.eat_op("+") {
                ArithOp::Add
            } else if self.eat_op("-") {
                ArithOp::Sub
            } else {
                return Ok(left);
            };
            let right = self.parse_multiplicative()?;
            left = Expr::Arith {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ExprParseError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = if self.eat_op("*") {
                ArithOp::Mul
            } else if self.eat_op("/") {
                ArithOp::Div
            } else {
                return Ok(left);
            };
            let right = self.parse_unary()?;
            left = Expr::Arith {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprParseError> {
        if self.eat_op("-") {
            return match self.peek().cloned() {
                Some(Token::Int(i)) => {
                    self.pos += 1;
                    Ok(Expr::Literal(Literal::Int(-i)))
                }
                Some(Token::Float(x)) => {
                    self.pos += 1;
                    Ok(Expr::Literal(Literal::Float(-x)))
                }
                _ => {
                    let operand = self.parse_unary()?;
                    Ok(Expr::Arith {
                        op: ArithOp::Sub,
                        left: Box::new(Expr::Literal(Literal::Int(0))),
                        right: Box::new(operand),
                    })
                }
            };
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprParseError> {
        let token = match self.peek().cloned() {
            Some(t) => t,
            None => return Err(self.error("unexpected end of expression")),
        };
        match token {
            Token::LParen => {
                self.pos += 1;
                let inner = self.parse_or()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::Str(s) => {
                self.pos += 1;
                Ok(Expr::Literal(Literal::Text(s)))
            }
            Token::Int(i) => {
                self.pos += 1;
                Ok(Expr::Literal(Literal::Int(i)))
            }
            Token::Float(x) => {
                self.pos += 1;
                Ok(Expr::Literal(Literal::Float(x)))
            }
            Token::Input(name) => {
                self.pos += 1;
                Ok(Expr::Input(name))
            }
            Token::Var(name) => match ContextVar::from_name(&name) {
                Some(var) => {
                    self.pos += 1;
                    Ok(Expr::Context(var))
                }
                None => Err(self.error(&format!("unknown variable ${}", name))),
            },
            Token::Ident(name) => {
                let upper = name.to_ascii_uppercase();
                let is_call = self.peek_at(1) == Some(&Token::LParen);
                match upper.as_str() {
                    "NULL" => {
                        self.pos += 1;
                        Ok(Expr::Literal(Literal::Null))
                    }
                    "TRUE" | "FALSE" => {
                        self.pos += 1;
                        Ok(Expr::Literal(Literal::Bool(upper == "TRUE")))
                    }
                    "EXISTS" | "COUNT" | "ROWS" if is_call => {
                        self.pos += 1;
                        let (entity, condition) = self.parse_builtin_body()?;
                        Ok(match upper.as_str() {
                            "EXISTS" => Expr::Exists {
                                entity,
                                condition,
                                negated: false,
                            },
                            "COUNT" => Expr::Count { entity, condition },
                            _ => Expr::Rows { entity, condition },
                        })
                    }
                    _ => self.parse_path(),
                }
            }
            _ => Err(self.error("expected a value")),
        }
    }

    /// `'(' Entity [WHERE condition] ')'`
    fn parse_builtin_body(&mut self) -> Result<(String, Option<Box<Expr>>), ExprParseError> {
        self.expect(Token::LParen, "'('")?;
        let entity = match self.peek().cloned() {
            Some(Token::Ident(name)) => {
                self.pos += 1;
                name
            }
            _ => return Err(self.error("expected entity name")),
        };
        let condition = if self.eat_keyword("WHERE") {
            Some(Box::new(self.parse_or()?))
        } else {
            None
        };
        self.expect(Token::RParen, "')'")?;
        Ok((entity, condition))
    }

    fn parse_path(&mut self) -> Result<Expr, ExprParseError> {
        let mut parts = Vec::new();
        loop {
            match self.peek().cloned() {
                Some(Token::Ident(name)) => {
                    self.pos += 1;
                    parts.push(name);
                }
                _ => return Err(self.error("expected identifier")),
            }
            if self.peek() == Some(&Token::Dot) {
                self.pos += 1;
            } else {
                return Ok(Expr::Path(parts));
            }
        }
    }
}

fn fold_logical(op: LogicalOp, mut operands: Vec<Expr>) -> Expr {
    if operands.len() == 1 {
        operands.remove(0)
    } else {
        Expr::Logical { op, operands }
    }
}

impl Serialize for Expr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Accepts expression text as well as bare JSON scalars, so `"qty": 1` and
/// `"qty": "1"` both deserialize to the integer literal.
impl<'de> Deserialize<'de> for Expr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ExprVisitor;

        impl<'de> Visitor<'de> for ExprVisitor {
            type Value = Expr;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an expression string or a JSON scalar")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Expr, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Expr, E> {
                Ok(Expr::Literal(Literal::Bool(v)))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Expr, E> {
                Ok(Expr::Literal(Literal::Int(v)))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Expr, E> {
                i64::try_from(v)
                    .map(|i| Expr::Literal(Literal::Int(i)))
                    .map_err(|_| E::custom("integer literal out of range"))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Expr, E> {
                Ok(Expr::Literal(Literal::Float(v)))
            }

            fn visit_unit<E: de::Error>(self) -> Result<Expr, E> {
                Ok(Expr::Literal(Literal::Null))
            }

            fn visit_none<E: de::Error>(self) -> Result<Expr, E> {
                Ok(Expr::Literal(Literal::Null))
            }
        }

        deserializer.deserialize_any(ExprVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Expr {
        s.parse().unwrap_or_else(|e| panic!("{}: {}", s, e))
    }

    #[test]
    fn test_precedence_and_or() {
        let expr = parse("a = 1 OR b = 2 AND c = 3");
        match &expr {
            Expr::Logical {
                op: LogicalOp::Or,
                operands,
            } => {
                assert_eq!(operands.len(), 2);
                assert!(matches!(
                    operands[1],
                    Expr::Logical {
                        op: LogicalOp::And,
                        ..
                    }
                ));
            }
            other => panic!("expected OR, got {:?}", other),
        }
    }

    #[test]
    fn test_input_and_context_variables() {
        let expr = parse("owner = $auth_user_id AND qty > $input.min_qty");
        assert_eq!(expr.input_refs(), vec!["min_qty"]);
        assert!("$bogus = 1".parse::<Expr>().is_err());
    }

    #[test]
    fn test_builtins() {
        let expr = parse("NOT EXISTS(Contact WHERE email = $input.email)");
        assert!(matches!(expr, Expr::Exists { negated: true, .. }));

        let expr = parse("COUNT(Order WHERE customer = $entity_id) < 5");
        match expr {
            Expr::Compare { op, left, .. } => {
                assert_eq!(op, CompareOp::Lt);
                assert!(matches!(*left, Expr::Count { .. }));
            }
            other => panic!("expected comparison, got {:?}", other),
        }

        let expr = parse("ROWS(OrderLine)");
        assert!(matches!(expr, Expr::Rows { condition: None, .. }));
    }

    #[test]
    fn test_is_null_and_in() {
        let expr = parse("deleted_at IS NOT NULL");
        assert!(matches!(expr, Expr::IsNull { negated: true, .. }));

        let expr = parse("status NOT IN ('draft', 'archived')");
        match expr {
            Expr::In { list, negated, .. } => {
                assert!(negated);
                assert_eq!(list.len(), 2);
            }
            other => panic!("expected IN, got {:?}", other),
        }
    }

    #[test]
    fn test_display_reparses_to_same_tree() {
        let sources = [
            "status IN ('active', 'pending') AND $input.quantity > 0",
            "(a = 1 OR b = 2) AND NOT c = 3",
            "item.price * (item.quantity - 1) >= 10.5",
            "name = 'O''Brien'",
            "NOT EXISTS(Contact WHERE email = $input.email AND id != $entity_id)",
            "a - (b - c) = -4",
        ];
        for src in sources {
            let expr = parse(src);
            let printed = expr.to_string();
            assert_eq!(parse(&printed), expr, "round trip of {}", src);
        }
    }

    #[test]
    fn test_display_minimal_parens() {
        assert_eq!(
            parse("(a = 1 OR b = 2) AND c = 3").to_string(),
            "(a = 1 OR b = 2) AND c = 3"
        );
        assert_eq!(parse("((a = 1))").to_string(), "a = 1");
    }

    #[test]
    fn test_parse_errors_report_offset() {
        let err = "status = ".parse::<Expr>().unwrap_err();
        assert_eq!(err.position, 9);
        let err = "name = 'open".parse::<Expr>().unwrap_err();
        assert!(err.message.contains("unterminated"));
        assert!("a = 1 b".parse::<Expr>().is_err());
    }

    #[test]
    fn test_deserialize_json_scalars() {
        let expr: Expr = serde_json::from_value(serde_json::json!(5)).unwrap();
        assert_eq!(expr, Expr::Literal(Literal::Int(5)));
        let expr: Expr = serde_json::from_value(serde_json::json!(true)).unwrap();
        assert_eq!(expr, Expr::Literal(Literal::Bool(true)));
        let expr: Expr = serde_json::from_value(serde_json::json!("$input.email")).unwrap();
        assert_eq!(expr, Expr::input("email"));
        assert_eq!(
            serde_json::to_value(Expr::path("item.id")).unwrap(),
            serde_json::json!("item.id")
        );
    }
}
