//! Step-function syntax: grammar, tree and canonical printer.
//!
//! Step functions are written in a small brace-delimited language:
//!
//! ```text
//! @jit
//! def update(self, t, dt=0.1) {
//!     for i in range(len(self.V.value)) {
//!         self.V.value[i] += dt * (-self.V.value[i] + self.sub.w.value[i]) / self.tau
//!     }
//! }
//! ```
//!
//! `FunctionDef` implements `Display`; printing and re-parsing yields the
//! same tree.

use crate::{JitError, Result};
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use std::collections::BTreeSet;
use std::fmt;

#[derive(Parser)]
#[grammar_inline = r##"
WHITESPACE = _{ " " | "\t" | "\r" | "\n" }
COMMENT = _{ "#" ~ (!"\n" ~ ANY)* }

ident_char = _{ ASCII_ALPHANUMERIC | "_" }
reserved = _{ ("def" | "for" | "in" | "if" | "else" | "return" | "and" | "or" | "not" | "True" | "False" | "None") ~ !ident_char }
ident = @{ !reserved ~ (ASCII_ALPHA | "_") ~ ident_char* }

kw_def = @{ "def" ~ !ident_char }
kw_for = @{ "for" ~ !ident_char }
kw_in = @{ "in" ~ !ident_char }
kw_if = @{ "if" ~ !ident_char }
kw_else = @{ "else" ~ !ident_char }
kw_return = @{ "return" ~ !ident_char }

exponent = _{ ("e" | "E") ~ ("+" | "-")? ~ ASCII_DIGIT+ }
float = @{ ASCII_DIGIT+ ~ "." ~ ASCII_DIGIT* ~ exponent? | ASCII_DIGIT+ ~ exponent | "." ~ ASCII_DIGIT+ ~ exponent? }
int = @{ ASCII_DIGIT+ }
true_lit = @{ "True" ~ !ident_char }
false_lit = @{ "False" ~ !ident_char }
none_lit = @{ "None" ~ !ident_char }

program = { SOI ~ decorator* ~ function ~ EOI }
decorator = { "@" ~ postfix }
function = { kw_def ~ ident ~ "(" ~ params? ~ ")" ~ block }
params = { param ~ ("," ~ param)* ~ ","? }
param = { ident ~ ("=" ~ expr)? }
block = { "{" ~ stmt* ~ "}" }

stmt = _{ (for_stmt | if_stmt | return_stmt | assign_stmt | expr_stmt) ~ ";"? }
for_stmt = { kw_for ~ ident ~ kw_in ~ expr ~ block }
if_stmt = { kw_if ~ expr ~ block ~ (kw_else ~ (if_stmt | block))? }
return_stmt = { kw_return ~ expr? }
assign_stmt = { postfix ~ assign_op ~ expr }
assign_op = @{ "+=" | "-=" | "*=" | "/=" | "=" ~ !"=" }
expr_stmt = { expr }

expr = { or_expr }
or_expr = { and_expr ~ (or_op ~ and_expr)* }
or_op = @{ "or" ~ !ident_char }
and_expr = { not_expr ~ (and_op ~ not_expr)* }
and_op = @{ "and" ~ !ident_char }
not_expr = { not_op ~ not_expr | comparison }
not_op = @{ "not" ~ !ident_char }
comparison = { sum ~ (cmp_op ~ sum)* }
cmp_op = @{ "==" | "!=" | "<=" | ">=" | "<" | ">" }
sum = { term ~ (add_op ~ term)* }
add_op = @{ "+" | "-" }
term = { unary ~ (mul_op ~ unary)* }
mul_op = @{ "*" ~ !"*" | "/" | "%" }
unary = { neg_op ~ unary | power }
neg_op = @{ "-" }
power = { postfix ~ (pow_op ~ unary)? }
pow_op = @{ "**" }

postfix = { atom ~ (attr | index | call)* }
attr = { "." ~ ident }
index = { "[" ~ expr ~ ("," ~ expr)* ~ "]" }
call = { "(" ~ (arg ~ ("," ~ arg)* ~ ","?)? ~ ")" }
arg = _{ double_star_arg | star_arg | kw_arg | pos_arg }
double_star_arg = { "**" ~ expr }
star_arg = { "*" ~ expr }
kw_arg = { ident ~ "=" ~ !"=" ~ expr }
pos_arg = { expr }
atom = _{ float | int | true_lit | false_lit | none_lit | ident | "(" ~ expr ~ ")" }
"##]
struct StepParser;

// ============================================================================
// TREE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    fn from_symbol(symbol: &str) -> Result<Self> {
        Ok(match symbol {
            "+" => BinOp::Add,
            "-" => BinOp::Sub,
            "*" => BinOp::Mul,
            "/" => BinOp::Div,
            "%" => BinOp::Mod,
            "**" => BinOp::Pow,
            "==" => BinOp::Eq,
            "!=" => BinOp::Ne,
            "<" => BinOp::Lt,
            "<=" => BinOp::Le,
            ">" => BinOp::Gt,
            ">=" => BinOp::Ge,
            "and" => BinOp::And,
            "or" => BinOp::Or,
            other => return Err(JitError::Parse(format!("unknown operator {other}"))),
        })
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Pow => "**",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "and",
            BinOp::Or => "or",
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            BinOp::Or => 1,
            BinOp::And => 2,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => 4,
            BinOp::Add | BinOp::Sub => 5,
            BinOp::Mul | BinOp::Div | BinOp::Mod => 6,
            BinOp::Pow => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
}

impl AssignOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            AssignOp::Assign => "=",
            AssignOp::Add => "+=",
            AssignOp::Sub => "-=",
            AssignOp::Mul => "*=",
            AssignOp::Div => "/=",
        }
    }

    /// Operator applied by an augmented assignment
    pub fn binary(&self) -> Option<BinOp> {
        match self {
            AssignOp::Assign => None,
            AssignOp::Add => Some(BinOp::Add),
            AssignOp::Sub => Some(BinOp::Sub),
            AssignOp::Mul => Some(BinOp::Mul),
            AssignOp::Div => Some(BinOp::Div),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Float(f64),
    Int(i64),
    Bool(bool),
    None,
    Name(String),
    Attribute { value: Box<Expr>, attr: String },
    Index { value: Box<Expr>, indices: Vec<Expr> },
    Call { func: Box<Expr>, args: Vec<Arg> },
    Binary { op: BinOp, left: Box<Expr>, right: Box<Expr> },
    Unary { op: UnaryOp, operand: Box<Expr> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Positional(Expr),
    Keyword(String, Expr),
    /// `*args`
    Star(Expr),
    /// `**kwargs`
    DoubleStar(Expr),
}

impl Arg {
    pub fn is_variadic(&self) -> bool {
        matches!(self, Arg::Star(_) | Arg::DoubleStar(_))
    }

    fn expr_mut(&mut self) -> &mut Expr {
        match self {
            Arg::Positional(e) | Arg::Keyword(_, e) | Arg::Star(e) | Arg::DoubleStar(e) => e,
        }
    }

    fn expr(&self) -> &Expr {
        match self {
            Arg::Positional(e) | Arg::Keyword(_, e) | Arg::Star(e) | Arg::DoubleStar(e) => e,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Assign { target: Expr, op: AssignOp, value: Expr },
    For { var: String, iter: Expr, body: Vec<Stmt> },
    If { test: Expr, body: Vec<Stmt>, orelse: Vec<Stmt> },
    Return(Option<Expr>),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
}

impl Param {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            default: None,
        }
    }

    pub fn with_default(name: &str, default: Expr) -> Self {
        Self {
            name: name.to_string(),
            default: Some(default),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    /// Compilation markers (`@jit`, ...)
    pub decorators: Vec<Expr>,
}

// ============================================================================
// TREE WALKS
// ============================================================================

impl Expr {
    pub fn name(name: &str) -> Self {
        Expr::Name(name.to_string())
    }

    /// `a.b.c` as `["a", "b", "c"]`; None for anything but a name/attribute chain
    pub fn chain(&self) -> Option<Vec<String>> {
        match self {
            Expr::Name(name) => Some(vec![name.clone()]),
            Expr::Attribute { value, attr } => {
                let mut chain = value.chain()?;
                chain.push(attr.clone());
                Some(chain)
            }
            _ => None,
        }
    }

    /// `a.b.c` as text
    pub fn dotted(&self) -> Option<String> {
        self.chain().map(|chain| chain.join("."))
    }

    /// Pre-order walk; `f` returns false to skip the children of a node
    pub fn visit<F: FnMut(&Expr) -> bool>(&self, f: &mut F) {
        if !f(self) {
            return;
        }
        match self {
            Expr::Attribute { value, .. } => value.visit(f),
            Expr::Index { value, indices } => {
                value.visit(f);
                indices.iter().for_each(|e| e.visit(f));
            }
            Expr::Call { func, args } => {
                func.visit(f);
                args.iter().for_each(|a| a.expr().visit(f));
            }
            Expr::Binary { left, right, .. } => {
                left.visit(f);
                right.visit(f);
            }
            Expr::Unary { operand, .. } => operand.visit(f),
            _ => {}
        }
    }

    /// Mutable pre-order walk; `f` returns false to skip the children of a node
    pub fn try_visit_mut<E, F>(&mut self, f: &mut F) -> std::result::Result<(), E>
    where
        F: FnMut(&mut Expr) -> std::result::Result<bool, E>,
    {
        if !f(self)? {
            return Ok(());
        }
        match self {
            Expr::Attribute { value, .. } => value.try_visit_mut(f),
            Expr::Index { value, indices } => {
                value.try_visit_mut(f)?;
                for e in indices {
                    e.try_visit_mut(f)?;
                }
                Ok(())
            }
            Expr::Call { func, args } => {
                func.try_visit_mut(f)?;
                for a in args {
                    a.expr_mut().try_visit_mut(f)?;
                }
                Ok(())
            }
            Expr::Binary { left, right, .. } => {
                left.try_visit_mut(f)?;
                right.try_visit_mut(f)
            }
            Expr::Unary { operand, .. } => operand.try_visit_mut(f),
            _ => Ok(()),
        }
    }
}

impl Stmt {
    fn visit<F: FnMut(&Expr) -> bool>(&self, f: &mut F) {
        match self {
            Stmt::Assign { target, value, .. } => {
                target.visit(f);
                value.visit(f);
            }
            Stmt::For { iter, body, .. } => {
                iter.visit(f);
                body.iter().for_each(|s| s.visit(f));
            }
            Stmt::If { test, body, orelse } => {
                test.visit(f);
                body.iter().for_each(|s| s.visit(f));
                orelse.iter().for_each(|s| s.visit(f));
            }
            Stmt::Return(Some(e)) | Stmt::Expr(e) => e.visit(f),
            Stmt::Return(None) => {}
        }
    }

    fn try_visit_mut<E, F>(&mut self, f: &mut F) -> std::result::Result<(), E>
    where
        F: FnMut(&mut Expr) -> std::result::Result<bool, E>,
    {
        match self {
            Stmt::Assign { target, value, .. } => {
                target.try_visit_mut(f)?;
                value.try_visit_mut(f)
            }
            Stmt::For { iter, body, .. } => {
                iter.try_visit_mut(f)?;
                body.iter_mut().try_for_each(|s| s.try_visit_mut(f))
            }
            Stmt::If { test, body, orelse } => {
                test.try_visit_mut(f)?;
                body.iter_mut().try_for_each(|s| s.try_visit_mut(f))?;
                orelse.iter_mut().try_for_each(|s| s.try_visit_mut(f))
            }
            Stmt::Return(Some(e)) | Stmt::Expr(e) => e.try_visit_mut(f),
            Stmt::Return(None) => Ok(()),
        }
    }

    fn collect_bound(&self, names: &mut BTreeSet<String>) {
        match self {
            Stmt::Assign {
                target: Expr::Name(name),
                ..
            } => {
                names.insert(name.clone());
            }
            Stmt::For { var, body, .. } => {
                names.insert(var.clone());
                body.iter().for_each(|s| s.collect_bound(names));
            }
            Stmt::If { body, orelse, .. } => {
                body.iter().for_each(|s| s.collect_bound(names));
                orelse.iter().for_each(|s| s.collect_bound(names));
            }
            _ => {}
        }
    }
}

impl FunctionDef {
    /// Every expression of the body and the parameter defaults
    pub fn visit_exprs<F: FnMut(&Expr) -> bool>(&self, f: &mut F) {
        for param in &self.params {
            if let Some(default) = &param.default {
                default.visit(f);
            }
        }
        self.body.iter().for_each(|s| s.visit(f));
    }

    pub fn try_visit_exprs_mut<E, F>(&mut self, f: &mut F) -> std::result::Result<(), E>
    where
        F: FnMut(&mut Expr) -> std::result::Result<bool, E>,
    {
        for param in &mut self.params {
            if let Some(default) = &mut param.default {
                default.try_visit_mut(f)?;
            }
        }
        self.body.iter_mut().try_for_each(|s| s.try_visit_mut(f))
    }

    /// Parameters, assigned names and loop variables
    pub fn bound_names(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = self.params.iter().map(|p| p.name.clone()).collect();
        self.body.iter().for_each(|s| s.collect_bound(&mut names));
        names
    }

    pub fn param_names(&self) -> Vec<String> {
        self.params.iter().map(|p| p.name.clone()).collect()
    }
}

// ============================================================================
// PARSING
// ============================================================================

/// Parse one (optionally decorated) function definition
pub fn parse_function(source: &str) -> Result<FunctionDef> {
    let program = StepParser::parse(Rule::program, source)
        .map_err(|e| JitError::Parse(e.to_string()))?
        .next()
        .ok_or_else(|| JitError::Parse("empty source".to_string()))?;

    let mut decorators = Vec::new();
    for pair in program.into_inner() {
        match pair.as_rule() {
            Rule::decorator => decorators.push(build_expr(first(pair)?)?),
            Rule::function => {
                let mut def = build_function(pair)?;
                def.decorators = decorators;
                return Ok(def);
            }
            _ => {}
        }
    }
    Err(JitError::Parse("no function definition found".to_string()))
}

fn is_keyword(rule: Rule) -> bool {
    matches!(
        rule,
        Rule::kw_def | Rule::kw_for | Rule::kw_in | Rule::kw_if | Rule::kw_else | Rule::kw_return
    )
}

/// Children without keyword tokens
fn children(pair: Pair<'_, Rule>) -> Vec<Pair<'_, Rule>> {
    pair.into_inner().filter(|p| !is_keyword(p.as_rule())).collect()
}

fn first(pair: Pair<'_, Rule>) -> Result<Pair<'_, Rule>> {
    let text = pair.as_str().to_string();
    pair.into_inner()
        .next()
        .ok_or_else(|| JitError::Parse(format!("incomplete syntax near `{text}`")))
}

fn build_function(pair: Pair<'_, Rule>) -> Result<FunctionDef> {
    let mut name = String::new();
    let mut params = Vec::new();
    let mut body = Vec::new();
    for part in children(pair) {
        match part.as_rule() {
            Rule::ident => name = part.as_str().to_string(),
            Rule::params => {
                for param in part.into_inner() {
                    let mut inner = param.into_inner();
                    let param_name = inner.next().map(|p| p.as_str().to_string()).unwrap_or_default();
                    let default = inner.next().map(build_expr).transpose()?;
                    params.push(Param {
                        name: param_name,
                        default,
                    });
                }
            }
            Rule::block => body = build_block(part)?,
            _ => {}
        }
    }
    Ok(FunctionDef {
        name,
        params,
        body,
        decorators: Vec::new(),
    })
}

fn build_block(pair: Pair<'_, Rule>) -> Result<Vec<Stmt>> {
    pair.into_inner().map(build_stmt).collect()
}

fn build_stmt(pair: Pair<'_, Rule>) -> Result<Stmt> {
    let rule = pair.as_rule();
    let text = pair.as_str().to_string();
    let mut parts = children(pair).into_iter();
    let mut next = || {
        parts
            .next()
            .ok_or_else(|| JitError::Parse(format!("incomplete statement `{text}`")))
    };

    match rule {
        Rule::for_stmt => {
            let var = next()?.as_str().to_string();
            let iter = build_expr(next()?)?;
            let body = build_block(next()?)?;
            Ok(Stmt::For { var, iter, body })
        }
        Rule::if_stmt => {
            let test = build_expr(next()?)?;
            let body = build_block(next()?)?;
            let orelse = match next() {
                Err(_) => Vec::new(),
                Ok(tail) if tail.as_rule() == Rule::if_stmt => vec![build_stmt(tail)?],
                Ok(tail) => build_block(tail)?,
            };
            Ok(Stmt::If { test, body, orelse })
        }
        Rule::return_stmt => Ok(Stmt::Return(next().ok().map(build_expr).transpose()?)),
        Rule::assign_stmt => {
            let target = build_expr(next()?)?;
            if !matches!(
                target,
                Expr::Name(_) | Expr::Attribute { .. } | Expr::Index { .. }
            ) {
                return Err(JitError::Parse(format!("cannot assign to `{target}`")));
            }
            let op = match next()?.as_str() {
                "+=" => AssignOp::Add,
                "-=" => AssignOp::Sub,
                "*=" => AssignOp::Mul,
                "/=" => AssignOp::Div,
                _ => AssignOp::Assign,
            };
            let value = build_expr(next()?)?;
            Ok(Stmt::Assign { target, op, value })
        }
        Rule::expr_stmt => Ok(Stmt::Expr(build_expr(next()?)?)),
        other => Err(JitError::Parse(format!("unexpected {other:?} in block"))),
    }
}

fn build_expr(pair: Pair<'_, Rule>) -> Result<Expr> {
    match pair.as_rule() {
        Rule::expr | Rule::pos_arg => build_expr(first(pair)?),
        Rule::or_expr | Rule::and_expr | Rule::comparison | Rule::sum | Rule::term => {
            let mut inner = pair.into_inner();
            let mut left = match inner.next() {
                Some(operand) => build_expr(operand)?,
                None => return Err(JitError::Parse("missing operand".to_string())),
            };
            while let (Some(op), Some(right)) = (inner.next(), inner.next()) {
                left = Expr::Binary {
                    op: BinOp::from_symbol(op.as_str())?,
                    left: Box::new(left),
                    right: Box::new(build_expr(right)?),
                };
            }
            Ok(left)
        }
        Rule::not_expr | Rule::unary => {
            let mut inner = pair.into_inner();
            let head = inner
                .next()
                .ok_or_else(|| JitError::Parse("missing operand".to_string()))?;
            let op = match head.as_rule() {
                Rule::not_op => UnaryOp::Not,
                Rule::neg_op => UnaryOp::Neg,
                _ => return build_expr(head),
            };
            let operand = inner
                .next()
                .ok_or_else(|| JitError::Parse("missing operand".to_string()))?;
            Ok(Expr::Unary {
                op,
                operand: Box::new(build_expr(operand)?),
            })
        }
        Rule::power => {
            let mut inner = pair.into_inner();
            let base = match inner.next() {
                Some(base) => build_expr(base)?,
                None => return Err(JitError::Parse("missing operand".to_string())),
            };
            match (inner.next(), inner.next()) {
                (Some(_), Some(exponent)) => Ok(Expr::Binary {
                    op: BinOp::Pow,
                    left: Box::new(base),
                    right: Box::new(build_expr(exponent)?),
                }),
                _ => Ok(base),
            }
        }
        Rule::postfix => {
            let mut inner = pair.into_inner();
            let mut expr = match inner.next() {
                Some(atom) => build_expr(atom)?,
                None => return Err(JitError::Parse("missing expression".to_string())),
            };
            for suffix in inner {
                expr = match suffix.as_rule() {
                    Rule::attr => Expr::Attribute {
                        value: Box::new(expr),
                        attr: first(suffix)?.as_str().to_string(),
                    },
                    Rule::index => Expr::Index {
                        value: Box::new(expr),
                        indices: suffix.into_inner().map(build_expr).collect::<Result<_>>()?,
                    },
                    Rule::call => Expr::Call {
                        func: Box::new(expr),
                        args: suffix.into_inner().map(build_arg).collect::<Result<_>>()?,
                    },
                    other => return Err(JitError::Parse(format!("unexpected {other:?}"))),
                };
            }
            Ok(expr)
        }
        Rule::float => pair
            .as_str()
            .parse()
            .map(Expr::Float)
            .map_err(|e| JitError::Parse(format!("bad float {}: {e}", pair.as_str()))),
        Rule::int => pair
            .as_str()
            .parse()
            .map(Expr::Int)
            .map_err(|e| JitError::Parse(format!("bad integer {}: {e}", pair.as_str()))),
        Rule::true_lit => Ok(Expr::Bool(true)),
        Rule::false_lit => Ok(Expr::Bool(false)),
        Rule::none_lit => Ok(Expr::None),
        Rule::ident => Ok(Expr::Name(pair.as_str().to_string())),
        other => Err(JitError::Parse(format!("unexpected {other:?} in expression"))),
    }
}

fn build_arg(pair: Pair<'_, Rule>) -> Result<Arg> {
    match pair.as_rule() {
        Rule::double_star_arg => Ok(Arg::DoubleStar(build_expr(first(pair)?)?)),
        Rule::star_arg => Ok(Arg::Star(build_expr(first(pair)?)?)),
        Rule::kw_arg => {
            let mut inner = pair.into_inner();
            match (inner.next(), inner.next()) {
                (Some(name), Some(value)) => {
                    Ok(Arg::Keyword(name.as_str().to_string(), build_expr(value)?))
                }
                _ => Err(JitError::Parse("incomplete keyword argument".to_string())),
            }
        }
        _ => Ok(Arg::Positional(build_expr(pair)?)),
    }
}

// ============================================================================
// PRINTING
// ============================================================================

const INDENT: &str = "    ";

impl Expr {
    fn precedence(&self) -> u8 {
        match self {
            Expr::Binary { op, .. } => op.precedence(),
            Expr::Unary {
                op: UnaryOp::Not, ..
            } => 3,
            Expr::Unary {
                op: UnaryOp::Neg, ..
            } => 7,
            Expr::Int(i) if *i < 0 => 7,
            Expr::Float(x) if x.is_sign_negative() => 7,
            Expr::Attribute { .. } | Expr::Index { .. } | Expr::Call { .. } => 9,
            _ => 10,
        }
    }

    fn write(&self, f: &mut fmt::Formatter<'_>, min: u8) -> fmt::Result {
        let wrap = self.precedence() < min;
        if wrap {
            write!(f, "(")?;
        }
        match self {
            Expr::Float(x) => write!(f, "{x:?}")?,
            Expr::Int(i) => write!(f, "{i}")?,
            Expr::Bool(true) => write!(f, "True")?,
            Expr::Bool(false) => write!(f, "False")?,
            Expr::None => write!(f, "None")?,
            Expr::Name(name) => write!(f, "{name}")?,
            Expr::Attribute { value, attr } => {
                value.write(f, 9)?;
                write!(f, ".{attr}")?;
            }
            Expr::Index { value, indices } => {
                value.write(f, 9)?;
                write!(f, "[")?;
                for (k, index) in indices.iter().enumerate() {
                    if k > 0 {
                        write!(f, ", ")?;
                    }
                    index.write(f, 0)?;
                }
                write!(f, "]")?;
            }
            Expr::Call { func, args } => {
                func.write(f, 9)?;
                write!(f, "(")?;
                for (k, arg) in args.iter().enumerate() {
                    if k > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")?;
            }
            Expr::Binary {
                op: BinOp::Pow,
                left,
                right,
            } => {
                left.write(f, 9)?;
                write!(f, " ** ")?;
                right.write(f, 7)?;
            }
            Expr::Binary { op, left, right } => {
                let p = op.precedence();
                left.write(f, p)?;
                write!(f, " {} ", op.symbol())?;
                right.write(f, p + 1)?;
            }
            Expr::Unary {
                op: UnaryOp::Neg,
                operand,
            } => {
                write!(f, "-")?;
                operand.write(f, 7)?;
            }
            Expr::Unary {
                op: UnaryOp::Not,
                operand,
            } => {
                write!(f, "not ")?;
                operand.write(f, 3)?;
            }
        }
        if wrap {
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write(f, 0)
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Positional(e) => write!(f, "{e}"),
            Arg::Keyword(name, e) => write!(f, "{name}={e}"),
            Arg::Star(e) => write!(f, "*{e}"),
            Arg::DoubleStar(e) => write!(f, "**{e}"),
        }
    }
}

fn write_block(f: &mut fmt::Formatter<'_>, body: &[Stmt], depth: usize) -> fmt::Result {
    for stmt in body {
        write_stmt(f, stmt, depth)?;
    }
    Ok(())
}

fn write_stmt(f: &mut fmt::Formatter<'_>, stmt: &Stmt, depth: usize) -> fmt::Result {
    let pad = INDENT.repeat(depth);
    match stmt {
        Stmt::Assign { target, op, value } => {
            writeln!(f, "{pad}{target} {} {value}", op.symbol())
        }
        Stmt::For { var, iter, body } => {
            writeln!(f, "{pad}for {var} in {iter} {{")?;
            write_block(f, body, depth + 1)?;
            writeln!(f, "{pad}}}")
        }
        Stmt::If { test, body, orelse } => {
            writeln!(f, "{pad}if {test} {{")?;
            write_block(f, body, depth + 1)?;
            write_else(f, orelse, depth)
        }
        Stmt::Return(Some(e)) => writeln!(f, "{pad}return {e}"),
        Stmt::Return(None) => writeln!(f, "{pad}return"),
        Stmt::Expr(e) => writeln!(f, "{pad}{e}"),
    }
}

fn write_else(f: &mut fmt::Formatter<'_>, orelse: &[Stmt], depth: usize) -> fmt::Result {
    let pad = INDENT.repeat(depth);
    match orelse {
        [] => writeln!(f, "{pad}}}"),
        [Stmt::If { test, body, orelse }] => {
            writeln!(f, "{pad}}} else if {test} {{")?;
            write_block(f, body, depth + 1)?;
            write_else(f, orelse, depth)
        }
        _ => {
            writeln!(f, "{pad}}} else {{")?;
            write_block(f, orelse, depth + 1)?;
            writeln!(f, "{pad}}}")
        }
    }
}

impl fmt::Display for FunctionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for decorator in &self.decorators {
            writeln!(f, "@{decorator}")?;
        }
        write!(f, "def {}(", self.name)?;
        for (k, param) in self.params.iter().enumerate() {
            if k > 0 {
                write!(f, ", ")?;
            }
            match &param.default {
                Some(default) => write!(f, "{}={default}", param.name)?,
                None => write!(f, "{}", param.name)?,
            }
        }
        writeln!(f, ") {{")?;
        write_block(f, &self.body, 1)?;
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"
@jit(nopython=True)
def update(self, t, dt=0.1) {
    # leak towards the input
    for i in range(len(self.V.value)) {
        self.V.value[i] += dt * (-self.V.value[i] + self.sub.w.value[i]) / self.tau
    }
    if t > 1.0 and not self.frozen {
        x = 2 ** -1
    } else if t == 0 {
        x = 0
    } else {
        x = (1 + 2) * 3
    }
    return self.f(t, key=dt)
}
"#;

    #[test]
    fn test_parse_function() {
        let def = parse_function(SOURCE).unwrap();
        assert_eq!(def.name, "update");
        assert_eq!(def.param_names(), vec!["self", "t", "dt"]);
        assert_eq!(def.params[2].default, Some(Expr::Float(0.1)));
        assert_eq!(def.decorators.len(), 1);
        assert_eq!(def.body.len(), 3);
        assert!(matches!(def.body[0], Stmt::For { .. }));
    }

    #[test]
    fn test_print_round_trip() {
        let def = parse_function(SOURCE).unwrap();
        let printed = def.to_string();
        let reparsed = parse_function(&printed).unwrap();
        assert_eq!(def, reparsed);
        assert_eq!(printed, reparsed.to_string());
    }

    #[test]
    fn test_precedence_printing() {
        let def = parse_function("def f(a, b) { return -(a + b) * 2 - a ** -b }").unwrap();
        let Stmt::Return(Some(e)) = &def.body[0] else {
            panic!("expected return");
        };
        assert_eq!(e.to_string(), "-(a + b) * 2 - a ** -b");
    }

    #[test]
    fn test_keywords_are_not_prefixes() {
        let def = parse_function("def f(self) { note = notice + None_ \n return note }").unwrap();
        assert!(def.bound_names().contains("note"));
    }

    #[test]
    fn test_variadic_arguments_parse() {
        let def = parse_function("def f(self, args) { self.g(*args, **args) }").unwrap();
        let Stmt::Expr(Expr::Call { args, .. }) = &def.body[0] else {
            panic!("expected call");
        };
        assert!(args.iter().all(Arg::is_variadic));
    }

    #[test]
    fn test_chain_and_dotted() {
        let def = parse_function("def f(self) { return self.sub.w.value }").unwrap();
        let Stmt::Return(Some(e)) = &def.body[0] else {
            panic!("expected return");
        };
        assert_eq!(e.dotted().as_deref(), Some("self.sub.w.value"));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse_function("def f( {"), Err(JitError::Parse(_))));
        assert!(matches!(
            parse_function("def f(a) { 1 + 2 = a }"),
            Err(JitError::Parse(_))
        ));
    }
}
