// SerialCollect - core/expr.rs
//
// Sandboxed expression language for the `custom` parser type.
//
// A program is a list of statements separated by `;` or newlines:
//
//   let parts = split(line, ";")     # local binding, not exported
//   temp = num(parts[0])             # field assignment
//   require(temp > -40)              # reject the line when false
//   status = if(temp > 30, "hot", "ok")
//
// Programs are compiled once when the parser is configured (syntax errors,
// unknown functions, wrong arity and undefined names are reported then) and
// evaluated against each line. There are no loops or user-defined
// functions, so evaluation always terminates; string growth is capped.

use crate::core::model::{FieldMap, FieldValue};
use crate::util::constants::{
    MAX_EXPRESSION_DEPTH, MAX_EXPRESSION_SOURCE_LENGTH, MAX_EXPRESSION_STRING_BYTES,
};
use crate::util::error::ParserError;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::fmt;

// =============================================================================
// Values
// =============================================================================

/// Runtime value of an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
}

impl Value {
    fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::List(l) => serde_json::Value::Array(l.iter().map(Value::to_json).collect()),
        }
    }

    /// Convert to a stored field value. Null means "omit the field".
    fn into_field(self) -> Option<FieldValue> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(FieldValue::Bool(b)),
            Value::Int(i) => Some(FieldValue::Int(i)),
            Value::Float(f) if f.is_finite() => Some(FieldValue::Float(f)),
            Value::Float(f) => Some(FieldValue::Text(f.to_string())),
            Value::Str(s) => Some(FieldValue::Text(s)),
            list @ Value::List(_) => Some(FieldValue::Text(list.to_json().to_string())),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => f.write_str(s),
            Value::List(_) => write!(f, "{}", self.to_json()),
        }
    }
}

/// Number from a float, as an integer when it has no fractional part.
fn number_value(v: f64) -> Value {
    const SAFE: f64 = 9_007_199_254_740_992.0; // 2^53
    if v.fract() == 0.0 && v.abs() <= SAFE {
        Value::Int(v as i64)
    } else {
        Value::Float(v)
    }
}

/// A runtime failure while evaluating a program against a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalError {
    pub message: String,
}

impl EvalError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for EvalError {}

// =============================================================================
// Lexer
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Separator,
    Assign,
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
    Bang,
    AndAnd,
    OrOr,
    Eof,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: usize,
    column: usize,
}

fn syntax_error(line: usize, column: usize, reason: impl Into<String>) -> ParserError {
    ParserError::InvalidExpression {
        line,
        column,
        reason: reason.into(),
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, ParserError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let mut line = 1;
    let mut col = 1;
    // Newlines only separate statements outside of parentheses/brackets.
    let mut depth: usize = 0;

    while i < chars.len() {
        let c = chars[i];
        let (tl, tc) = (line, col);
        let push = |tok: Tok, tokens: &mut Vec<Token>| {
            tokens.push(Token {
                tok,
                line: tl,
                column: tc,
            })
        };

        match c {
            '\n' => {
                if depth == 0 {
                    push(Tok::Separator, &mut tokens);
                }
                i += 1;
                line += 1;
                col = 1;
                continue;
            }
            c if c.is_whitespace() => {}
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                    col += 1;
                }
                continue;
            }
            ';' => push(Tok::Separator, &mut tokens),
            '(' => {
                depth += 1;
                push(Tok::LParen, &mut tokens);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                push(Tok::RParen, &mut tokens);
            }
            '[' => {
                depth += 1;
                push(Tok::LBracket, &mut tokens);
            }
            ']' => {
                depth = depth.saturating_sub(1);
                push(Tok::RBracket, &mut tokens);
            }
            ',' => push(Tok::Comma, &mut tokens),
            '+' => push(Tok::Plus, &mut tokens),
            '-' => push(Tok::Minus, &mut tokens),
            '*' => push(Tok::Star, &mut tokens),
            '/' => push(Tok::Slash, &mut tokens),
            '%' => push(Tok::Percent, &mut tokens),
            '=' | '!' | '<' | '>' => {
                let next_eq = chars.get(i + 1) == Some(&'=');
                let tok = match (c, next_eq) {
                    ('=', true) => Tok::Eq,
                    ('=', false) => Tok::Assign,
                    ('!', true) => Tok::Ne,
                    ('!', false) => Tok::Bang,
                    ('<', true) => Tok::Le,
                    ('<', false) => Tok::Lt,
                    ('>', true) => Tok::Ge,
                    _ => Tok::Gt,
                };
                push(tok, &mut tokens);
                if next_eq {
                    i += 1;
                    col += 1;
                }
            }
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(syntax_error(tl, tc, format!("expected '{c}{c}'")));
                }
                push(
                    if c == '&' { Tok::AndAnd } else { Tok::OrOr },
                    &mut tokens,
                );
                i += 1;
                col += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                col += 1;
                loop {
                    let Some(&ch) = chars.get(i) else {
                        return Err(syntax_error(tl, tc, "unterminated string literal"));
                    };
                    if ch == quote {
                        break;
                    }
                    if ch == '\n' {
                        return Err(syntax_error(tl, tc, "unterminated string literal"));
                    }
                    if ch == '\\' {
                        i += 1;
                        col += 1;
                        let esc = chars
                            .get(i)
                            .ok_or_else(|| syntax_error(tl, tc, "unterminated string literal"))?;
                        match esc {
                            'n' => s.push('\n'),
                            't' => s.push('\t'),
                            'r' => s.push('\r'),
                            '\\' | '\'' | '"' => s.push(*esc),
                            // Regex escapes such as `\d` pass through untouched.
                            other => {
                                s.push('\\');
                                s.push(*other);
                            }
                        }
                    } else {
                        s.push(ch);
                    }
                    i += 1;
                    col += 1;
                }
                push(Tok::Str(s), &mut tokens);
            }
            c if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                let mut is_float = false;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                if i < chars.len() && chars[i] == '.' {
                    is_float = true;
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        is_float = true;
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().collect();
                col += i - start;
                let tok = if is_float {
                    Tok::Float(
                        text.parse()
                            .map_err(|_| syntax_error(tl, tc, format!("bad number '{text}'")))?,
                    )
                } else {
                    match text.parse::<i64>() {
                        Ok(v) => Tok::Int(v),
                        Err(_) => Tok::Float(
                            text.parse()
                                .map_err(|_| syntax_error(tl, tc, format!("bad number '{text}'")))?,
                        ),
                    }
                };
                push(tok, &mut tokens);
                continue;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                col += i - start;
                push(Tok::Ident(ident), &mut tokens);
                continue;
            }
            other => return Err(syntax_error(tl, tc, format!("unexpected character '{other}'"))),
        }
        i += 1;
        col += 1;
    }

    tokens.push(Token {
        tok: Tok::Eof,
        line,
        column: col,
    });
    Ok(tokens)
}

// =============================================================================
// AST
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Builtin {
    Split,
    Join,
    Trim,
    Upper,
    Lower,
    Len,
    Substr,
    Replace,
    Contains,
    StartsWith,
    EndsWith,
    Num,
    Int,
    Str,
    Bool,
    Round,
    Abs,
    Min,
    Max,
    If,
    Coalesce,
    Require,
}

impl Builtin {
    /// Resolve a function name with its (min, max) arity.
    fn lookup(name: &str) -> Option<(Builtin, usize, usize)> {
        let entry = match name {
            "split" => (Builtin::Split, 2, 2),
            "join" => (Builtin::Join, 2, 2),
            "trim" => (Builtin::Trim, 1, 1),
            "upper" => (Builtin::Upper, 1, 1),
            "lower" => (Builtin::Lower, 1, 1),
            "len" => (Builtin::Len, 1, 1),
            "substr" => (Builtin::Substr, 2, 3),
            "replace" => (Builtin::Replace, 3, 3),
            "contains" => (Builtin::Contains, 2, 2),
            "starts_with" => (Builtin::StartsWith, 2, 2),
            "ends_with" => (Builtin::EndsWith, 2, 2),
            "num" => (Builtin::Num, 1, 1),
            "int" => (Builtin::Int, 1, 1),
            "str" => (Builtin::Str, 1, 1),
            "bool" => (Builtin::Bool, 1, 1),
            "round" => (Builtin::Round, 1, 2),
            "abs" => (Builtin::Abs, 1, 1),
            "min" => (Builtin::Min, 1, usize::MAX),
            "max" => (Builtin::Max, 1, usize::MAX),
            "if" => (Builtin::If, 3, 3),
            "coalesce" => (Builtin::Coalesce, 1, usize::MAX),
            "require" => (Builtin::Require, 1, 1),
            _ => return None,
        };
        Some(entry)
    }
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Var(String),
    Index(Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Call(Builtin, Vec<Expr>),
    /// `match(input, 'pattern'[, group])`; the pattern is compiled up front.
    Match {
        input: Box<Expr>,
        regex: Regex,
        group: Option<Box<Expr>>,
    },
}

#[derive(Debug, Clone)]
enum Stmt {
    Let(String, Expr),
    Assign(String, Expr),
    Reject,
    Eval(Expr),
}

const RESERVED: &[&str] = &["let", "reject", "line", "true", "false", "null"];

// =============================================================================
// Parser
// =============================================================================

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    defined: HashSet<String>,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)].tok
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn error_here(&self, reason: impl Into<String>) -> ParserError {
        let t = self.peek();
        syntax_error(t.line, t.column, reason)
    }

    fn expect(&mut self, tok: Tok, what: &str) -> Result<(), ParserError> {
        if self.peek().tok == tok {
            self.advance();
            Ok(())
        } else {
            Err(self.error_here(format!("expected {what}")))
        }
    }

    fn program(&mut self) -> Result<Vec<Stmt>, ParserError> {
        let mut stmts = Vec::new();
        loop {
            while self.peek().tok == Tok::Separator {
                self.advance();
            }
            if self.peek().tok == Tok::Eof {
                break;
            }
            stmts.push(self.statement()?);
            match self.peek().tok {
                Tok::Separator | Tok::Eof => {}
                _ => return Err(self.error_here("expected ';' or end of line")),
            }
        }
        Ok(stmts)
    }

    fn binding_name(&mut self) -> Result<String, ParserError> {
        match self.advance().tok {
            Tok::Ident(name) if !RESERVED.contains(&name.as_str()) => Ok(name),
            Tok::Ident(name) => Err(self.error_here(format!("'{name}' is a reserved name"))),
            _ => Err(self.error_here("expected a name")),
        }
    }

    fn statement(&mut self) -> Result<Stmt, ParserError> {
        if let Tok::Ident(word) = self.peek().tok.clone() {
            match word.as_str() {
                "let" => {
                    self.advance();
                    let name = self.binding_name()?;
                    self.expect(Tok::Assign, "'='")?;
                    let value = self.expr()?;
                    self.defined.insert(name.clone());
                    return Ok(Stmt::Let(name, value));
                }
                "reject" => {
                    self.advance();
                    return Ok(Stmt::Reject);
                }
                _ if *self.peek_at(1) == Tok::Assign => {
                    let name = self.binding_name()?;
                    self.advance();
                    let value = self.expr()?;
                    self.defined.insert(name.clone());
                    return Ok(Stmt::Assign(name, value));
                }
                _ => {}
            }
        }
        Ok(Stmt::Eval(self.expr()?))
    }

    fn expr(&mut self) -> Result<Expr, ParserError> {
        self.depth += 1;
        if self.depth > MAX_EXPRESSION_DEPTH {
            return Err(self.error_here("expression nested too deeply"));
        }
        let result = self.or();
        self.depth -= 1;
        result
    }

    fn or(&mut self) -> Result<Expr, ParserError> {
        let mut lhs = self.and()?;
        while self.peek().tok == Tok::OrOr {
            self.advance();
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, ParserError> {
        let mut lhs = self.equality()?;
        while self.peek().tok == Tok::AndAnd {
            self.advance();
            let rhs = self.equality()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn binary_level(
        &mut self,
        ops: &[(Tok, BinaryOp)],
        next: fn(&mut Self) -> Result<Expr, ParserError>,
    ) -> Result<Expr, ParserError> {
        let mut lhs = next(self)?;
        while let Some((_, op)) = ops.iter().find(|(t, _)| *t == self.peek().tok) {
            let op = *op;
            self.advance();
            let rhs = next(self)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr, ParserError> {
        self.binary_level(
            &[(Tok::Eq, BinaryOp::Eq), (Tok::Ne, BinaryOp::Ne)],
            Self::comparison,
        )
    }

    fn comparison(&mut self) -> Result<Expr, ParserError> {
        self.binary_level(
            &[
                (Tok::Lt, BinaryOp::Lt),
                (Tok::Le, BinaryOp::Le),
                (Tok::Gt, BinaryOp::Gt),
                (Tok::Ge, BinaryOp::Ge),
            ],
            Self::additive,
        )
    }

    fn additive(&mut self) -> Result<Expr, ParserError> {
        self.binary_level(
            &[(Tok::Plus, BinaryOp::Add), (Tok::Minus, BinaryOp::Sub)],
            Self::multiplicative,
        )
    }

    fn multiplicative(&mut self) -> Result<Expr, ParserError> {
        self.binary_level(
            &[
                (Tok::Star, BinaryOp::Mul),
                (Tok::Slash, BinaryOp::Div),
                (Tok::Percent, BinaryOp::Rem),
            ],
            Self::unary,
        )
    }

    fn unary(&mut self) -> Result<Expr, ParserError> {
        match self.peek().tok {
            Tok::Minus => {
                self.advance();
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Tok::Bang => {
                self.advance();
                Ok(Expr::Not(Box::new(self.unary()?)))
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<Expr, ParserError> {
        let mut expr = self.primary()?;
        while self.peek().tok == Tok::LBracket {
            self.advance();
            let index = self.expr()?;
            self.expect(Tok::RBracket, "']'")?;
            expr = Expr::Index(Box::new(expr), Box::new(index));
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, ParserError> {
        let Token { tok, line, column } = self.advance();
        match tok {
            Tok::Int(i) => Ok(Expr::Literal(Value::Int(i))),
            Tok::Float(f) => Ok(Expr::Literal(Value::Float(f))),
            Tok::Str(s) => Ok(Expr::Literal(Value::Str(s))),
            Tok::LParen => {
                let inner = self.expr()?;
                self.expect(Tok::RParen, "')'")?;
                Ok(inner)
            }
            Tok::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ if self.peek().tok == Tok::LParen => self.call(&name, (line, column)),
                "line" => Ok(Expr::Var(name)),
                _ if self.defined.contains(&name) => Ok(Expr::Var(name)),
                _ => Err(syntax_error(line, column, format!("'{name}' is not defined"))),
            },
            _ => Err(syntax_error(line, column, "expected a value")),
        }
    }

    fn call(&mut self, name: &str, at: (usize, usize)) -> Result<Expr, ParserError> {
        self.expect(Tok::LParen, "'('")?;
        let mut args = Vec::new();
        if self.peek().tok != Tok::RParen {
            loop {
                args.push(self.expr()?);
                if self.peek().tok == Tok::Comma {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(Tok::RParen, "')'")?;

        if name == "match" {
            return self.match_call(args, at);
        }

        let (builtin, min, max) = Builtin::lookup(name).ok_or_else(|| {
            syntax_error(at.0, at.1, format!("unknown function '{name}'"))
        })?;
        if args.len() < min || args.len() > max {
            let expected = if min == max {
                format!("{min}")
            } else if max == usize::MAX {
                format!("at least {min}")
            } else {
                format!("{min} to {max}")
            };
            return Err(syntax_error(
                at.0,
                at.1,
                format!("'{name}' takes {expected} argument(s), got {}", args.len()),
            ));
        }
        Ok(Expr::Call(builtin, args))
    }

    fn match_call(&self, mut args: Vec<Expr>, at: (usize, usize)) -> Result<Expr, ParserError> {
        if !(2..=3).contains(&args.len()) {
            return Err(syntax_error(
                at.0,
                at.1,
                format!("'match' takes 2 to 3 argument(s), got {}", args.len()),
            ));
        }
        let group = if args.len() == 3 {
            args.pop().map(Box::new)
        } else {
            None
        };
        let pattern = match args.pop() {
            Some(Expr::Literal(Value::Str(p))) => p,
            _ => {
                return Err(syntax_error(
                    at.0,
                    at.1,
                    "'match' pattern must be a string literal",
                ))
            }
        };
        let regex = Regex::new(&pattern).map_err(|e| {
            syntax_error(at.0, at.1, format!("invalid regex '{pattern}': {e}"))
        })?;
        let input = args
            .pop()
            .map(Box::new)
            .ok_or_else(|| syntax_error(at.0, at.1, "'match' needs an input"))?;
        Ok(Expr::Match {
            input,
            regex,
            group,
        })
    }
}

// =============================================================================
// Program
// =============================================================================

/// Why evaluation stopped early.
enum Halt {
    Reject,
    Error(EvalError),
}

impl From<EvalError> for Halt {
    fn from(e: EvalError) -> Self {
        Halt::Error(e)
    }
}

type EvalResult = Result<Value, Halt>;

fn fail(message: impl Into<String>) -> Halt {
    Halt::Error(EvalError::new(message))
}

/// A compiled custom parser program.
#[derive(Debug, Clone)]
pub struct Program {
    statements: Vec<Stmt>,
}

/// Compile a program, reporting syntax errors with line/column positions.
pub fn compile(source: &str) -> Result<Program, ParserError> {
    if source.len() > MAX_EXPRESSION_SOURCE_LENGTH {
        return Err(ParserError::ExpressionTooLong {
            length: source.len(),
            max_length: MAX_EXPRESSION_SOURCE_LENGTH,
        });
    }
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
        defined: HashSet::new(),
    };
    let statements = parser.program()?;
    Ok(Program { statements })
}

impl Program {
    /// Run the program against one line.
    ///
    /// Returns `Ok(None)` when the program rejected the line and `Err` on a
    /// runtime failure (type error, division by zero, oversized string).
    pub fn evaluate(&self, line: &str) -> Result<Option<FieldMap>, EvalError> {
        let mut env = Env {
            line,
            vars: HashMap::new(),
        };
        let mut fields = FieldMap::new();

        for stmt in &self.statements {
            let outcome = match stmt {
                Stmt::Let(name, expr) => env.eval(expr).map(|v| {
                    env.vars.insert(name.clone(), v);
                }),
                Stmt::Assign(name, expr) => env.eval(expr).map(|v| {
                    env.vars.insert(name.clone(), v.clone());
                    match v.into_field() {
                        Some(field) => {
                            fields.insert(name.clone(), field);
                        }
                        None => {
                            fields.remove(name);
                        }
                    }
                }),
                Stmt::Reject => Err(Halt::Reject),
                Stmt::Eval(expr) => env.eval(expr).map(|_| ()),
            };
            match outcome {
                Ok(()) => {}
                Err(Halt::Reject) => return Ok(None),
                Err(Halt::Error(e)) => return Err(e),
            }
        }
        Ok(Some(fields))
    }
}

struct Env<'a> {
    line: &'a str,
    vars: HashMap<String, Value>,
}

fn check_len(s: String) -> EvalResult {
    if s.len() > MAX_EXPRESSION_STRING_BYTES {
        Err(fail(format!(
            "string of {} bytes exceeds the {MAX_EXPRESSION_STRING_BYTES}-byte limit",
            s.len()
        )))
    } else {
        Ok(Value::Str(s))
    }
}

fn expect_str<'v>(v: &'v Value, func: &str) -> Result<&'v str, Halt> {
    match v {
        Value::Str(s) => Ok(s),
        other => Err(fail(format!(
            "{func}() expects a string, got {}",
            other.type_name()
        ))),
    }
}

fn expect_int(v: &Value, func: &str) -> Result<i64, Halt> {
    match v {
        Value::Int(i) => Ok(*i),
        Value::Float(f) if f.fract() == 0.0 => Ok(*f as i64),
        other => Err(fail(format!(
            "{func}() expects an integer, got {}",
            other.type_name()
        ))),
    }
}

fn expect_number(v: &Value, func: &str) -> Result<f64, Halt> {
    v.as_number().ok_or_else(|| {
        fail(format!(
            "{func}() expects a number, got {}",
            v.type_name()
        ))
    })
}

/// Resolve a possibly negative index against a length.
fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let idx = if index < 0 {
        len as i64 + index
    } else {
        index
    };
    (0..len as i64).contains(&idx).then_some(idx as usize)
}

impl Env<'_> {
    fn eval(&mut self, expr: &Expr) -> EvalResult {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Var(name) if name == "line" => Ok(Value::Str(self.line.to_string())),
            Expr::Var(name) => Ok(self.vars.get(name).cloned().unwrap_or(Value::Null)),
            Expr::Index(target, index) => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                let i = expect_int(&index, "index")?;
                match target {
                    Value::List(items) => Ok(resolve_index(i, items.len())
                        .map(|idx| items[idx].clone())
                        .unwrap_or(Value::Null)),
                    Value::Str(s) => {
                        let chars: Vec<char> = s.chars().collect();
                        Ok(resolve_index(i, chars.len())
                            .map(|idx| Value::Str(chars[idx].to_string()))
                            .unwrap_or(Value::Null))
                    }
                    Value::Null => Ok(Value::Null),
                    other => Err(fail(format!("cannot index a {}", other.type_name()))),
                }
            }
            Expr::Neg(inner) => match self.eval(inner)? {
                Value::Int(i) => i
                    .checked_neg()
                    .map(Value::Int)
                    .ok_or_else(|| fail("integer overflow")),
                Value::Float(f) => Ok(Value::Float(-f)),
                Value::Null => Ok(Value::Null),
                other => Err(fail(format!("cannot negate a {}", other.type_name()))),
            },
            Expr::Not(inner) => Ok(Value::Bool(!self.eval(inner)?.truthy())),
            Expr::And(lhs, rhs) => {
                if !self.eval(lhs)?.truthy() {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(self.eval(rhs)?.truthy()))
            }
            Expr::Or(lhs, rhs) => {
                if self.eval(lhs)?.truthy() {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(self.eval(rhs)?.truthy()))
            }
            Expr::Binary(op, lhs, rhs) => {
                let l = self.eval(lhs)?;
                let r = self.eval(rhs)?;
                binary(*op, l, r)
            }
            Expr::Match {
                input,
                regex,
                group,
            } => {
                let input = self.eval(input)?;
                let text = match &input {
                    Value::Null => return Ok(Value::Null),
                    Value::Str(s) => s.as_str(),
                    other => {
                        return Err(fail(format!(
                            "match() expects a string, got {}",
                            other.type_name()
                        )))
                    }
                };
                let group = match group {
                    Some(g) => {
                        let g = self.eval(g)?;
                        expect_int(&g, "match")?.max(0) as usize
                    }
                    None if regex.captures_len() > 1 => 1,
                    None => 0,
                };
                Ok(regex
                    .captures(text)
                    .and_then(|caps| caps.get(group))
                    .map(|m| Value::Str(m.as_str().to_string()))
                    .unwrap_or(Value::Null))
            }
            Expr::Call(builtin, args) => self.call(*builtin, args),
        }
    }

    fn call(&mut self, builtin: Builtin, args: &[Expr]) -> EvalResult {
        // Lazily evaluated built-ins first.
        match builtin {
            Builtin::If => {
                return if self.eval(&args[0])?.truthy() {
                    self.eval(&args[1])
                } else {
                    self.eval(&args[2])
                };
            }
            Builtin::Coalesce => {
                for arg in args {
                    let v = self.eval(arg)?;
                    if v != Value::Null {
                        return Ok(v);
                    }
                }
                return Ok(Value::Null);
            }
            _ => {}
        }

        let values = args
            .iter()
            .map(|a| self.eval(a))
            .collect::<Result<Vec<_>, _>>()?;

        // Null propagates through the single-argument conversions and
        // string helpers so a missing column yields a missing field.
        let null_propagates = !matches!(
            builtin,
            Builtin::Str | Builtin::Bool | Builtin::Require | Builtin::Min | Builtin::Max
        );
        if null_propagates && values.first() == Some(&Value::Null) {
            return Ok(Value::Null);
        }

        match builtin {
            Builtin::Split => {
                let s = expect_str(&values[0], "split")?;
                let sep = expect_str(&values[1], "split")?;
                let parts: Vec<Value> = if sep.is_empty() {
                    s.chars().map(|c| Value::Str(c.to_string())).collect()
                } else {
                    s.split(sep).map(|p| Value::Str(p.to_string())).collect()
                };
                Ok(Value::List(parts))
            }
            Builtin::Join => {
                let Value::List(items) = &values[0] else {
                    return Err(fail(format!(
                        "join() expects a list, got {}",
                        values[0].type_name()
                    )));
                };
                let sep = expect_str(&values[1], "join")?;
                check_len(
                    items
                        .iter()
                        .map(|v| v.to_string())
                        .collect::<Vec<_>>()
                        .join(sep),
                )
            }
            Builtin::Trim => Ok(Value::Str(expect_str(&values[0], "trim")?.trim().to_string())),
            Builtin::Upper => Ok(Value::Str(expect_str(&values[0], "upper")?.to_uppercase())),
            Builtin::Lower => Ok(Value::Str(expect_str(&values[0], "lower")?.to_lowercase())),
            Builtin::Len => match &values[0] {
                Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
                Value::List(l) => Ok(Value::Int(l.len() as i64)),
                other => Err(fail(format!("len() of a {}", other.type_name()))),
            },
            Builtin::Substr => {
                let chars: Vec<char> = expect_str(&values[0], "substr")?.chars().collect();
                let start = expect_int(&values[1], "substr")?;
                let start = if start < 0 {
                    (chars.len() as i64 + start).max(0) as usize
                } else {
                    (start as usize).min(chars.len())
                };
                let end = match values.get(2) {
                    Some(v) => start.saturating_add(expect_int(v, "substr")?.max(0) as usize),
                    None => chars.len(),
                }
                .min(chars.len());
                Ok(Value::Str(chars[start..end].iter().collect()))
            }
            Builtin::Replace => {
                let s = expect_str(&values[0], "replace")?;
                let from = expect_str(&values[1], "replace")?;
                let to = expect_str(&values[2], "replace")?;
                if from.is_empty() {
                    return Ok(Value::Str(s.to_string()));
                }
                let grown = s.len() + s.matches(from).count() * to.len();
                if grown > MAX_EXPRESSION_STRING_BYTES {
                    return Err(fail(format!(
                        "replace() result of {grown} bytes exceeds the {MAX_EXPRESSION_STRING_BYTES}-byte limit"
                    )));
                }
                check_len(s.replace(from, to))
            }
            Builtin::Contains => match &values[0] {
                Value::List(items) => Ok(Value::Bool(items.contains(&values[1]))),
                v => Ok(Value::Bool(
                    expect_str(v, "contains")?.contains(expect_str(&values[1], "contains")?),
                )),
            },
            Builtin::StartsWith => Ok(Value::Bool(
                expect_str(&values[0], "starts_with")?
                    .starts_with(expect_str(&values[1], "starts_with")?),
            )),
            Builtin::EndsWith => Ok(Value::Bool(
                expect_str(&values[0], "ends_with")?
                    .ends_with(expect_str(&values[1], "ends_with")?),
            )),
            Builtin::Num => Ok(match &values[0] {
                Value::Int(i) => Value::Int(*i),
                Value::Float(f) => number_value(*f),
                Value::Bool(b) => Value::Int(i64::from(*b)),
                Value::Str(s) => crate::core::model::parse_number(s)
                    .map(number_value)
                    .unwrap_or(Value::Null),
                _ => Value::Null,
            }),
            Builtin::Int => Ok(match &values[0] {
                Value::Int(i) => Value::Int(*i),
                Value::Float(f) if f.is_finite() => Value::Int(f.trunc() as i64),
                Value::Bool(b) => Value::Int(i64::from(*b)),
                Value::Str(s) => crate::core::model::parse_number(s)
                    .map(|v| Value::Int(v.trunc() as i64))
                    .unwrap_or(Value::Null),
                _ => Value::Null,
            }),
            Builtin::Str => match &values[0] {
                Value::Null => Ok(Value::Str(String::new())),
                v => check_len(v.to_string()),
            },
            Builtin::Bool => Ok(Value::Bool(match &values[0] {
                Value::Str(s) if s.eq_ignore_ascii_case("false") => false,
                Value::Str(s) if s.eq_ignore_ascii_case("true") => true,
                v => v.truthy(),
            })),
            Builtin::Round => {
                let v = expect_number(&values[0], "round")?;
                let digits = match values.get(1) {
                    Some(d) => expect_int(d, "round")?.clamp(0, 15),
                    None => 0,
                };
                let factor = 10f64.powi(digits as i32);
                Ok(number_value((v * factor).round() / factor))
            }
            Builtin::Abs => match &values[0] {
                Value::Int(i) => i
                    .checked_abs()
                    .map(Value::Int)
                    .ok_or_else(|| fail("integer overflow")),
                v => Ok(Value::Float(expect_number(v, "abs")?.abs())),
            },
            Builtin::Min | Builtin::Max => {
                let candidates: Vec<&Value> = match values.as_slice() {
                    [Value::List(items)] => items.iter().collect(),
                    _ => values.iter().collect(),
                };
                let mut best: Option<&Value> = None;
                for v in candidates.into_iter().filter(|v| **v != Value::Null) {
                    let n = expect_number(v, if builtin == Builtin::Min { "min" } else { "max" })?;
                    let better = match best {
                        None => true,
                        Some(b) => {
                            let bn = b.as_number().unwrap_or(n);
                            if builtin == Builtin::Min {
                                n < bn
                            } else {
                                n > bn
                            }
                        }
                    };
                    if better {
                        best = Some(v);
                    }
                }
                Ok(best.cloned().unwrap_or(Value::Null))
            }
            Builtin::Require => {
                if values[0].truthy() {
                    Ok(Value::Null)
                } else {
                    Err(Halt::Reject)
                }
            }
            Builtin::If | Builtin::Coalesce => Ok(Value::Null),
        }
    }
}

fn binary(op: BinaryOp, l: Value, r: Value) -> EvalResult {
    use BinaryOp::*;
    match op {
        Eq => Ok(Value::Bool(values_equal(&l, &r))),
        Ne => Ok(Value::Bool(!values_equal(&l, &r))),
        Lt | Le | Gt | Ge => {
            let ordering = match (&l, &r) {
                (Value::Str(a), Value::Str(b)) => a.cmp(b),
                _ => match (l.as_number(), r.as_number()) {
                    (Some(a), Some(b)) => a
                        .partial_cmp(&b)
                        .ok_or_else(|| fail("cannot compare NaN"))?,
                    _ => {
                        return Err(fail(format!(
                            "cannot compare {} with {}",
                            l.type_name(),
                            r.type_name()
                        )))
                    }
                },
            };
            Ok(Value::Bool(match op {
                Lt => ordering.is_lt(),
                Le => ordering.is_le(),
                Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        Add => match (l, r) {
            (Value::Int(a), Value::Int(b)) => Ok(a
                .checked_add(b)
                .map(Value::Int)
                .unwrap_or(Value::Float(a as f64 + b as f64))),
            (Value::List(mut a), Value::List(b)) => {
                a.extend(b);
                Ok(Value::List(a))
            }
            (a @ Value::Str(_), b) | (a, b @ Value::Str(_)) => check_len(format!("{a}{b}")),
            (a, b) => match (a.as_number(), b.as_number()) {
                (Some(x), Some(y)) => Ok(Value::Float(x + y)),
                _ => Err(fail(format!(
                    "cannot add {} and {}",
                    a.type_name(),
                    b.type_name()
                ))),
            },
        },
        Sub | Mul | Div | Rem => {
            if let (Value::Int(a), Value::Int(b)) = (&l, &r) {
                let (a, b) = (*a, *b);
                let exact = match op {
                    Sub => a.checked_sub(b).map(Value::Int),
                    Mul => a.checked_mul(b).map(Value::Int),
                    Div if b == 0 => return Err(fail("division by zero")),
                    // i64::MIN / -1 overflows: checked_rem is None and the
                    // quotient falls through to a float.
                    Div if a.checked_rem(b) == Some(0) => a.checked_div(b).map(Value::Int),
                    Div => Some(Value::Float(a as f64 / b as f64)),
                    _ if b == 0 => return Err(fail("division by zero")),
                    _ => Some(Value::Int(a.wrapping_rem(b))),
                };
                if let Some(v) = exact {
                    return Ok(v);
                }
            }
            let (Some(a), Some(b)) = (l.as_number(), r.as_number()) else {
                return Err(fail(format!(
                    "arithmetic on {} and {}",
                    l.type_name(),
                    r.type_name()
                )));
            };
            if matches!(op, Div | Rem) && b == 0.0 {
                return Err(fail("division by zero"));
            }
            Ok(Value::Float(match op {
                Sub => a - b,
                Mul => a * b,
                Div => a / b,
                _ => a % b,
            }))
        }
    }
}

fn values_equal(l: &Value, r: &Value) -> bool {
    match (l.as_number(), r.as_number()) {
        (Some(a), Some(b)) => a == b,
        _ => l == r,
    }
}
