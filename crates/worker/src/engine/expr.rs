//! The built-in `expr` script flavor.
//!
//! A deliberately small imperative expression language: integer and float
//! arithmetic, strings, variables, `while` loops, and three builtins
//! (`sleep`, `update`, `out`). Statements are separated by newlines or
//! semicolons; `#` starts a line comment. The value of the last
//! evaluated expression is the script result.
//!
//! Example:
//!
//! ```text
//! total = 0
//! i = 0
//! while i < n {
//!     total = total + i
//!     update("summing", i, n)
//!     i = i + 1
//! }
//! total
//! ```

use serde_json::{json, Value};

use super::{Outcome, ScriptEngine, ScriptError};
use crate::context::TaskContext;
use tandem_core::Args;

pub struct ExprEngine;

impl ScriptEngine for ExprEngine {
    fn name(&self) -> &'static str {
        "expr"
    }

    fn run(&self, script: &str, inputs: &Args, ctx: &TaskContext) -> Result<Outcome, ScriptError> {
        let tokens = lex(script)?;
        let program = Parser::new(tokens).parse_program()?;
        let mut interp = Interp::new(inputs, ctx);
        match interp.run(&program) {
            Ok(value) => Ok(Outcome::Complete(value)),
            Err(Stop::Canceled) => Ok(Outcome::Canceled),
            Err(Stop::Error(err)) => Err(err),
        }
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    While,
    True,
    False,
    Null,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Assign,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Sep,
}

fn lex(source: &str) -> Result<Vec<Token>, ScriptError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' => {
                chars.next();
            }
            '\n' | ';' => {
                chars.next();
                // Collapse runs of separators into one.
                if !matches!(tokens.last(), Some(Token::Sep) | None) {
                    tokens.push(Token::Sep);
                }
            }
            '#' => {
                while let Some(&c) = chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '0'..='9' => {
                let mut text = String::new();
                let mut is_float = false;
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() {
                        text.push(c);
                        chars.next();
                    } else if c == '.' && !is_float {
                        is_float = true;
                        text.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if is_float {
                    let n = text
                        .parse::<f64>()
                        .map_err(|_| ScriptError::new(format!("bad number literal: {text}")))?;
                    tokens.push(Token::Float(n));
                } else {
                    let n = text
                        .parse::<i64>()
                        .map_err(|_| ScriptError::new(format!("bad number literal: {text}")))?;
                    tokens.push(Token::Int(n));
                }
            }
            '"' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => text.push('\n'),
                            Some('t') => text.push('\t'),
                            Some('\\') => text.push('\\'),
                            Some('"') => text.push('"'),
                            other => {
                                return Err(ScriptError::new(format!(
                                    "bad escape in string literal: \\{}",
                                    other.map(String::from).unwrap_or_default()
                                )))
                            }
                        },
                        Some(c) => text.push(c),
                        None => return Err(ScriptError::new("unterminated string literal")),
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(match name.as_str() {
                    "while" => Token::While,
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(name),
                });
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '%' => {
                chars.next();
                tokens.push(Token::Percent);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '{' => {
                chars.next();
                tokens.push(Token::LBrace);
            }
            '}' => {
                chars.next();
                tokens.push(Token::RBrace);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Eq);
                } else {
                    tokens.push(Token::Assign);
                }
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ne);
                } else {
                    return Err(ScriptError::new("unexpected character: !"));
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            other => {
                return Err(ScriptError::new(format!("unexpected character: {other}")));
            }
        }
    }
    // Trailing separators carry no information.
    while tokens.last() == Some(&Token::Sep) {
        tokens.pop();
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Stmt {
    Assign(String, Expr),
    While(Expr, Vec<Stmt>),
    Expr(Expr),
}

#[derive(Debug, Clone)]
enum Expr {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Null,
    Var(String),
    Call(String, Vec<Expr>),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy)]
enum UnOp {
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
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

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), ScriptError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(ScriptError::new(format!(
                "expected {token:?}, found {:?}",
                self.peek()
            )))
        }
    }

    fn skip_seps(&mut self) {
        while self.eat(&Token::Sep) {}
    }

    fn parse_program(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        let stmts = self.parse_stmts(None)?;
        if let Some(extra) = self.peek() {
            return Err(ScriptError::new(format!("unexpected token: {extra:?}")));
        }
        Ok(stmts)
    }

    fn parse_stmts(&mut self, until: Option<&Token>) -> Result<Vec<Stmt>, ScriptError> {
        let mut stmts = Vec::new();
        loop {
            self.skip_seps();
            match self.peek() {
                None => break,
                Some(t) if Some(t) == until => break,
                _ => {}
            }
            stmts.push(self.parse_stmt()?);
            // Statements end at a separator, a closing brace, or EOF.
            match self.peek() {
                None => break,
                Some(Token::Sep) => {}
                Some(t) if Some(t) == until => break,
                Some(t) => {
                    return Err(ScriptError::new(format!(
                        "expected end of statement, found {t:?}"
                    )))
                }
            }
        }
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> Result<Stmt, ScriptError> {
        if self.eat(&Token::While) {
            let cond = self.parse_expr()?;
            self.expect(Token::LBrace)?;
            let body = self.parse_stmts(Some(&Token::RBrace))?;
            self.expect(Token::RBrace)?;
            return Ok(Stmt::While(cond, body));
        }
        // Lookahead for `name = expr` (but not `name == expr`).
        if let (Some(Token::Ident(name)), Some(Token::Assign)) =
            (self.tokens.get(self.pos), self.tokens.get(self.pos + 1))
        {
            let name = name.clone();
            self.pos += 2;
            let value = self.parse_expr()?;
            return Ok(Stmt::Assign(name, value));
        }
        Ok(Stmt::Expr(self.parse_expr()?))
    }

    fn parse_expr(&mut self) -> Result<Expr, ScriptError> {
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinOp::Eq,
                Some(Token::Ne) => BinOp::Ne,
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ScriptError> {
        if self.eat(&Token::Minus) {
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary(UnOp::Neg, Box::new(operand)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ScriptError> {
        match self.next() {
            Some(Token::Int(n)) => Ok(Expr::Int(n)),
            Some(Token::Float(n)) => Ok(Expr::Float(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::True) => Ok(Expr::Bool(true)),
            Some(Token::False) => Ok(Expr::Bool(false)),
            Some(Token::Null) => Ok(Expr::Null),
            Some(Token::Ident(name)) => {
                if self.eat(&Token::LParen) {
                    let mut args = Vec::new();
                    if !self.eat(&Token::RParen) {
                        loop {
                            args.push(self.parse_expr()?);
                            if self.eat(&Token::Comma) {
                                continue;
                            }
                            self.expect(Token::RParen)?;
                            break;
                        }
                    }
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Var(name))
                }
            }
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            other => Err(ScriptError::new(format!(
                "expected expression, found {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

enum Stop {
    Canceled,
    Error(ScriptError),
}

impl From<ScriptError> for Stop {
    fn from(err: ScriptError) -> Self {
        Stop::Error(err)
    }
}

fn err(message: impl Into<String>) -> Stop {
    Stop::Error(ScriptError::new(message))
}

struct Interp<'a> {
    vars: std::collections::HashMap<String, Value>,
    ctx: &'a TaskContext,
}

impl<'a> Interp<'a> {
    fn new(inputs: &Args, ctx: &'a TaskContext) -> Self {
        let vars = inputs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self { vars, ctx }
    }

    /// Run the program; the value of the last expression statement is the
    /// script result.
    fn run(&mut self, program: &[Stmt]) -> Result<Option<Value>, Stop> {
        let mut last = None;
        for stmt in program {
            if let Some(value) = self.exec(stmt)? {
                last = Some(value);
            }
        }
        Ok(last)
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<Option<Value>, Stop> {
        if self.ctx.cancelled() {
            return Err(Stop::Canceled);
        }
        match stmt {
            Stmt::Assign(name, expr) => {
                let value = self.eval(expr)?;
                self.vars.insert(name.clone(), value);
                Ok(None)
            }
            Stmt::While(cond, body) => {
                loop {
                    if self.ctx.cancelled() {
                        return Err(Stop::Canceled);
                    }
                    if !truthy(&self.eval(cond)?) {
                        break;
                    }
                    for stmt in body {
                        self.exec(stmt)?;
                    }
                }
                Ok(None)
            }
            Stmt::Expr(expr) => Ok(Some(self.eval(expr)?)),
        }
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, Stop> {
        match expr {
            Expr::Int(n) => Ok(json!(n)),
            Expr::Float(n) => Ok(json!(n)),
            Expr::Str(s) => Ok(json!(s)),
            Expr::Bool(b) => Ok(json!(b)),
            Expr::Null => Ok(Value::Null),
            Expr::Var(name) => self
                .vars
                .get(name)
                .cloned()
                .ok_or_else(|| err(format!("unknown variable: {name}"))),
            Expr::Call(name, args) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg)?);
                }
                self.call(name, values)
            }
            Expr::Unary(UnOp::Neg, operand) => match self.eval(operand)? {
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        i.checked_neg()
                            .map(|i| json!(i))
                            .ok_or_else(|| err("integer overflow in negation"))
                    } else if let Some(f) = n.as_f64() {
                        Ok(json!(-f))
                    } else {
                        Err(err("cannot negate this number"))
                    }
                }
                other => Err(err(format!("cannot negate {}", type_name(&other)))),
            },
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                binary(*op, &lhs, &rhs)
            }
        }
    }

    fn call(&mut self, name: &str, args: Vec<Value>) -> Result<Value, Stop> {
        match name {
            "sleep" => {
                let ms = match args.as_slice() {
                    [Value::Number(n)] => n.as_i64().filter(|&n| n >= 0),
                    _ => None,
                }
                .ok_or_else(|| err("sleep expects one non-negative integer (milliseconds)"))?;
                // Sleep in short slices so cancellation is observed promptly.
                let deadline =
                    std::time::Instant::now() + std::time::Duration::from_millis(ms as u64);
                loop {
                    if self.ctx.cancelled() {
                        return Err(Stop::Canceled);
                    }
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        break;
                    }
                    let remaining = deadline - now;
                    std::thread::sleep(remaining.min(std::time::Duration::from_millis(10)));
                }
                Ok(Value::Null)
            }
            "update" => {
                if args.len() > 3 {
                    return Err(err("update expects (message, current, maximum)"));
                }
                let mut args = args.into_iter();
                let message = match args.next() {
                    None | Some(Value::Null) => None,
                    Some(Value::String(s)) => Some(s),
                    Some(other) => {
                        return Err(err(format!(
                            "update message must be a string, not {}",
                            type_name(&other)
                        )))
                    }
                };
                let current = opt_int(args.next(), "update current")?;
                let maximum = opt_int(args.next(), "update maximum")?;
                self.ctx.update(message, current, maximum);
                Ok(Value::Null)
            }
            "out" => {
                let mut args = args.into_iter();
                match (args.next(), args.next(), args.next()) {
                    (Some(Value::String(key)), Some(value), None) => {
                        self.ctx.set_output(key, value);
                        Ok(Value::Null)
                    }
                    _ => Err(err("out expects (key, value) with a string key")),
                }
            }
            _ => Err(err(format!("unknown function: {name}"))),
        }
    }
}

fn opt_int(value: Option<Value>, what: &str) -> Result<Option<i64>, Stop> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| err(format!("{what} must be an integer"))),
        Some(other) => Err(err(format!(
            "{what} must be an integer, not {}",
            type_name(&other)
        ))),
    }
}

fn binary(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value, Stop> {
    use BinOp::*;

    // Equality works on any pair of values.
    match op {
        Eq => return Ok(json!(lhs == rhs)),
        Ne => return Ok(json!(lhs != rhs)),
        _ => {}
    }

    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                return int_binary(op, a, b);
            }
            let (a, b) = match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => (a, b),
                _ => return Err(err("numbers out of range")),
            };
            Ok(match op {
                Add => json!(a + b),
                Sub => json!(a - b),
                Mul => json!(a * b),
                Div => json!(a / b),
                Rem => json!(a % b),
                Lt => json!(a < b),
                Le => json!(a <= b),
                Gt => json!(a > b),
                Ge => json!(a >= b),
                Eq | Ne => unreachable!(),
            })
        }
        (Value::String(a), Value::String(b)) => match op {
            Add => Ok(json!(format!("{a}{b}"))),
            Lt => Ok(json!(a < b)),
            Le => Ok(json!(a <= b)),
            Gt => Ok(json!(a > b)),
            Ge => Ok(json!(a >= b)),
            _ => Err(err(format!("unsupported operation on strings: {op:?}"))),
        },
        _ => Err(err(format!(
            "type mismatch: {} {op:?} {}",
            type_name(lhs),
            type_name(rhs)
        ))),
    }
}

fn int_binary(op: BinOp, a: i64, b: i64) -> Result<Value, Stop> {
    use BinOp::*;
    Ok(match op {
        Add => json!(a.checked_add(b).ok_or_else(|| err("integer overflow"))?),
        Sub => json!(a.checked_sub(b).ok_or_else(|| err("integer overflow"))?),
        Mul => json!(a.checked_mul(b).ok_or_else(|| err("integer overflow"))?),
        Div => {
            if b == 0 {
                return Err(err("division by zero"));
            }
            json!(a.checked_div(b).ok_or_else(|| err("integer overflow"))?)
        }
        Rem => {
            if b == 0 {
                return Err(err("division by zero"));
            }
            json!(a.checked_rem(b).ok_or_else(|| err("integer overflow"))?)
        }
        Lt => json!(a < b),
        Le => json!(a <= b),
        Gt => json!(a > b),
        Ge => json!(a >= b),
        Eq | Ne => unreachable!(),
    })
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tandem_core::Response;

    fn run_script(script: &str, inputs: Args) -> Result<Outcome, ScriptError> {
        let (tx, _rx) = unbounded();
        let ctx = TaskContext::new("test".to_string(), Arc::new(AtomicBool::new(false)), tx);
        ExprEngine.run(script, &inputs, &ctx)
    }

    fn result_of(script: &str, inputs: Args) -> Value {
        match run_script(script, inputs).unwrap() {
            Outcome::Complete(Some(value)) => value,
            other => panic!("expected a result, got {other:?}"),
        }
    }

    #[test]
    fn arithmetic() {
        assert_eq!(result_of("2 + 2", Args::new()), json!(4));
        assert_eq!(result_of("2 + 3 * 4", Args::new()), json!(14));
        assert_eq!(result_of("(2 + 3) * 4", Args::new()), json!(20));
        assert_eq!(result_of("7 % 3", Args::new()), json!(1));
        assert_eq!(result_of("-5 + 2", Args::new()), json!(-3));
    }

    #[test]
    fn float_arithmetic() {
        assert_eq!(result_of("1.5 + 2.5", Args::new()), json!(4.0));
        assert_eq!(result_of("1 / 2.0", Args::new()), json!(0.5));
    }

    #[test]
    fn string_concat() {
        assert_eq!(
            result_of("\"foo\" + \"bar\"", Args::new()),
            json!("foobar")
        );
    }

    #[test]
    fn inputs_become_variables() {
        let mut inputs = Args::new();
        inputs.insert("age".to_string(), json!(7));
        assert_eq!(result_of("age * age", inputs), json!(49));
    }

    #[test]
    fn assignment_and_sequencing() {
        let script = "x = 3\ny = x + 1\nx * y";
        assert_eq!(result_of(script, Args::new()), json!(12));
    }

    #[test]
    fn semicolons_separate_statements() {
        assert_eq!(result_of("a = 2; b = 5; a * b", Args::new()), json!(10));
    }

    #[test]
    fn while_loop_sums() {
        let script = "total = 0\ni = 1\nwhile i <= 10 {\n  total = total + i\n  i = i + 1\n}\ntotal";
        assert_eq!(result_of(script, Args::new()), json!(55));
    }

    #[test]
    fn comments_ignored() {
        let script = "# greeting\nx = 1 # one\nx + 1";
        assert_eq!(result_of(script, Args::new()), json!(2));
    }

    #[test]
    fn update_reports_progress() {
        let (tx, rx) = unbounded();
        let ctx = TaskContext::new("test".to_string(), Arc::new(AtomicBool::new(false)), tx);
        let outcome = ExprEngine
            .run("update(\"halfway\", 5, 10)", &Args::new(), &ctx)
            .unwrap();
        assert!(matches!(outcome, Outcome::Complete(_)));

        match rx.try_recv().unwrap() {
            Response::Update {
                message,
                current,
                maximum,
                ..
            } => {
                assert_eq!(message.as_deref(), Some("halfway"));
                assert_eq!(current, Some(5));
                assert_eq!(maximum, Some(10));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn out_records_named_outputs() {
        let (tx, _rx) = unbounded();
        let ctx = TaskContext::new("test".to_string(), Arc::new(AtomicBool::new(false)), tx);
        ExprEngine
            .run("out(\"answer\", 6 * 7)", &Args::new(), &ctx)
            .unwrap();
        let outputs = ctx.take_outputs();
        assert_eq!(outputs.get("answer"), Some(&json!(42)));
    }

    #[test]
    fn cancel_stops_loop() {
        let (tx, _rx) = unbounded();
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = TaskContext::new("test".to_string(), flag.clone(), tx);
        flag.store(true, Ordering::Relaxed);
        let outcome = ExprEngine
            .run("while true { sleep(1) }", &Args::new(), &ctx)
            .unwrap();
        assert!(matches!(outcome, Outcome::Canceled));
    }

    #[test]
    fn division_by_zero_fails() {
        let err = run_script("1 / 0", Args::new()).unwrap_err();
        assert!(err.to_string().contains("division by zero"));
    }

    #[test]
    fn unknown_variable_fails() {
        let err = run_script("nope + 1", Args::new()).unwrap_err();
        assert!(err.to_string().contains("unknown variable"));
    }

    #[test]
    fn parse_error_reported() {
        assert!(run_script("while { }", Args::new()).is_err());
        assert!(run_script("1 +", Args::new()).is_err());
        assert!(run_script("\"open", Args::new()).is_err());
    }

    #[test]
    fn empty_script_yields_no_result() {
        match run_script("", Args::new()).unwrap() {
            Outcome::Complete(None) => {}
            other => panic!("expected no result, got {other:?}"),
        }
    }
}
