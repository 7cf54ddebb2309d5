//! 内置 `simple` 语言：声明式 map。
//!
//! ```text
//! program := stmt (';' stmt)* [';']
//! stmt    := ['if' '(' expr ')'] 'emit' '(' expr ',' expr ')'
//! expr    := atom [('==' | '!=') atom]
//! atom    := 'doc' path* | 'null' | 'true' | 'false' | number | string | '[' [expr (',' expr)*] ']'
//! path    := '.' ident | '[' string ']' | '[' integer ']'
//! ```
//!
//! 缺失字段求值为 null；对非对象取属性（含 null）是求值错误。
//! 守卫的真值：null / false / 0 / "" 为假。

use std::sync::Arc;

use serde_json::Value;

use super::function::{Emitter, MapFunction, ViewCompiler};
use crate::core::{Result, ViewError};

pub const SIMPLE_LANGUAGE: &str = "simple";

static NULL: Value = Value::Null;

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Num(Value),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Semi,
    Dot,
    EqEq,
    NotEq,
}

fn err(msg: impl Into<String>) -> ViewError {
    ViewError::compile(SIMPLE_LANGUAGE, msg)
}

fn tokenize(src: &str) -> Result<Vec<Tok>> {
    let bytes = src.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b' ' | b'\t' | b'\r' | b'\n' => i += 1,
            b'(' => {
                out.push(Tok::LParen);
                i += 1;
            }
            b')' => {
                out.push(Tok::RParen);
                i += 1;
            }
            b'[' => {
                out.push(Tok::LBracket);
                i += 1;
            }
            b']' => {
                out.push(Tok::RBracket);
                i += 1;
            }
            b',' => {
                out.push(Tok::Comma);
                i += 1;
            }
            b';' => {
                out.push(Tok::Semi);
                i += 1;
            }
            b'.' => {
                out.push(Tok::Dot);
                i += 1;
            }
            b'=' | b'!' => {
                if bytes.get(i + 1) != Some(&b'=') {
                    return Err(err(format!("unexpected {:?} at offset {}", c as char, i)));
                }
                out.push(if c == b'=' { Tok::EqEq } else { Tok::NotEq });
                i += 2;
            }
            b'"' => {
                let start = i;
                i += 1;
                loop {
                    match bytes.get(i) {
                        None => return Err(err(format!("unterminated string at offset {}", start))),
                        Some(b'\\') => i += 2,
                        Some(b'"') => {
                            i += 1;
                            break;
                        }
                        Some(_) => i += 1,
                    }
                }
                let lit = &src[start..i];
                let s: String = serde_json::from_str(lit)
                    .map_err(|e| err(format!("bad string literal {}: {}", lit, e)))?;
                out.push(Tok::Str(s));
            }
            b'-' | b'0'..=b'9' => {
                let start = i;
                i += 1;
                while i < bytes.len()
                    && matches!(bytes[i], b'0'..=b'9' | b'.' | b'e' | b'E' | b'+' | b'-')
                {
                    i += 1;
                }
                let lit = &src[start..i];
                let n: Value = serde_json::from_str(lit)
                    .map_err(|_| err(format!("bad number literal {:?}", lit)))?;
                if !n.is_number() {
                    return Err(err(format!("bad number literal {:?}", lit)));
                }
                out.push(Tok::Num(n));
            }
            c if c.is_ascii_alphabetic() || c == b'_' || c == b'$' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'$')
                {
                    i += 1;
                }
                out.push(Tok::Ident(src[start..i].to_string()));
            }
            _ => {
                let ch = src[i..].chars().next().unwrap_or('?');
                return Err(err(format!("unexpected character {:?} at offset {}", ch, i)));
            }
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq)]
enum Seg {
    Field(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Doc(Vec<Seg>),
    Literal(Value),
    Array(Vec<Expr>),
    Compare {
        left: Box<Expr>,
        right: Box<Expr>,
        negate: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct Stmt {
    guard: Option<Expr>,
    key: Expr,
    value: Expr,
}

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, want: Tok) -> Result<()> {
        match self.next() {
            Some(t) if t == want => Ok(()),
            Some(t) => Err(err(format!("expected {:?}, found {:?}", want, t))),
            None => Err(err(format!("expected {:?}, found end of input", want))),
        }
    }

    fn program(&mut self) -> Result<Vec<Stmt>> {
        let mut stmts = Vec::new();
        while self.peek().is_some() {
            if self.peek() == Some(&Tok::Semi) {
                self.pos += 1;
                continue;
            }
            stmts.push(self.stmt()?);
            match self.peek() {
                None | Some(Tok::Semi) => {}
                Some(t) => return Err(err(format!("expected ';', found {:?}", t))),
            }
        }
        if stmts.is_empty() {
            return Err(err("map source has no emit statement"));
        }
        Ok(stmts)
    }

    fn stmt(&mut self) -> Result<Stmt> {
        let mut guard = None;
        if self.peek() == Some(&Tok::Ident("if".into())) {
            self.pos += 1;
            self.expect(Tok::LParen)?;
            guard = Some(self.expr()?);
            self.expect(Tok::RParen)?;
        }
        match self.next() {
            Some(Tok::Ident(name)) if name == "emit" => {}
            Some(t) => return Err(err(format!("expected emit, found {:?}", t))),
            None => return Err(err("expected emit, found end of input")),
        }
        self.expect(Tok::LParen)?;
        let key = self.expr()?;
        self.expect(Tok::Comma)?;
        let value = self.expr()?;
        self.expect(Tok::RParen)?;
        Ok(Stmt { guard, key, value })
    }

    fn expr(&mut self) -> Result<Expr> {
        let left = self.atom()?;
        let negate = match self.peek() {
            Some(Tok::EqEq) => false,
            Some(Tok::NotEq) => true,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.atom()?;
        Ok(Expr::Compare {
            left: Box::new(left),
            right: Box::new(right),
            negate,
        })
    }

    fn atom(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Tok::Ident(name)) => match name.as_str() {
                "doc" => Ok(Expr::Doc(self.path()?)),
                "null" => Ok(Expr::Literal(Value::Null)),
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                other => Err(err(format!("unknown identifier {:?}", other))),
            },
            Some(Tok::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Tok::Num(n)) => Ok(Expr::Literal(n)),
            Some(Tok::LBracket) => {
                let mut items = Vec::new();
                if self.peek() == Some(&Tok::RBracket) {
                    self.pos += 1;
                    return Ok(Expr::Array(items));
                }
                loop {
                    items.push(self.expr()?);
                    match self.next() {
                        Some(Tok::Comma) => continue,
                        Some(Tok::RBracket) => break,
                        Some(t) => return Err(err(format!("expected ',' or ']', found {:?}", t))),
                        None => return Err(err("unterminated array")),
                    }
                }
                Ok(Expr::Array(items))
            }
            Some(t) => Err(err(format!("unexpected {:?}", t))),
            None => Err(err("unexpected end of input")),
        }
    }

    fn path(&mut self) -> Result<Vec<Seg>> {
        let mut segs = Vec::new();
        loop {
            match self.peek() {
                Some(Tok::Dot) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Tok::Ident(f)) => segs.push(Seg::Field(f)),
                        other => return Err(err(format!("expected field name, found {:?}", other))),
                    }
                }
                Some(Tok::LBracket) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Tok::Str(f)) => segs.push(Seg::Field(f)),
                        Some(Tok::Num(n)) => {
                            let idx = n
                                .as_u64()
                                .ok_or_else(|| err(format!("bad array index {}", n)))?;
                            segs.push(Seg::Index(idx as usize));
                        }
                        other => return Err(err(format!("expected index, found {:?}", other))),
                    }
                    self.expect(Tok::RBracket)?;
                }
                _ => return Ok(segs),
            }
        }
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |x| x != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn eval(expr: &Expr, doc: &Value) -> std::result::Result<Value, String> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Array(items) => items
            .iter()
            .map(|e| eval(e, doc))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Compare {
            left,
            right,
            negate,
        } => {
            let eq = eval(left, doc)? == eval(right, doc)?;
            Ok(Value::Bool(eq != *negate))
        }
        Expr::Doc(segs) => {
            let mut cur = doc;
            for seg in segs {
                cur = match (seg, cur) {
                    (Seg::Field(f), Value::Object(m)) => m.get(f).unwrap_or(&NULL),
                    (Seg::Index(i), Value::Array(a)) => a.get(*i).unwrap_or(&NULL),
                    (Seg::Field(f), other) => {
                        return Err(format!("cannot read property {:?} of {}", f, type_name(other)))
                    }
                    (Seg::Index(i), other) => {
                        return Err(format!("cannot read index {} of {}", i, type_name(other)))
                    }
                };
            }
            Ok(cur.clone())
        }
    }
}

/// 编译后的 `simple` map
#[derive(Debug)]
pub struct SimpleMap {
    stmts: Vec<Stmt>,
}

impl SimpleMap {
    pub fn compile(source: &str) -> Result<Self> {
        let toks = tokenize(source)?;
        let stmts = Parser { toks, pos: 0 }.program()?;
        Ok(Self { stmts })
    }
}

impl MapFunction for SimpleMap {
    fn map(&self, doc: &Value, emitter: &mut Emitter) -> Result<()> {
        let fail = |msg: String| {
            let id = doc.get("_id").and_then(Value::as_str).unwrap_or("");
            ViewError::map_failed(id, msg)
        };
        for s in &self.stmts {
            if let Some(g) = &s.guard {
                if !truthy(&eval(g, doc).map_err(fail)?) {
                    continue;
                }
            }
            let key = eval(&s.key, doc).map_err(fail)?;
            let value = eval(&s.value, doc).map_err(fail)?;
            emitter.emit(key, value);
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleCompiler;

impl ViewCompiler for SimpleCompiler {
    fn language(&self) -> &str {
        SIMPLE_LANGUAGE
    }

    fn compile_map(&self, source: &str) -> Result<Arc<dyn MapFunction>> {
        Ok(Arc::new(SimpleMap::compile(source)?))
    }
}
