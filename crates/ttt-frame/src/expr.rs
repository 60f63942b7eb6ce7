//! Expression engine for cuts, region selections and graph values.
//!
//! Supports arithmetic (+, -, *, /), comparisons (==, !=, <, <=, >, >=),
//! boolean operators (&&, ||, !), the functions abs, sqrt, log, exp, pow,
//! min, max and `select(cond, a, b)`.
//!
//! Identifiers refer to the event frame:
//! - `HT` : scalar column (read at the active variation)
//! - `Jets.pt[0]` : field of the i-th selected particle, NaN when absent
//! - `TightLepton.n` : number of selected particles

use std::fmt;

use ttt_core::{Error, Result};

// ── AST ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Expr {
    Number(f64),
    Var(usize), // index into required_vars
    UnaryNeg(Box<Expr>),
    UnaryNot(Box<Expr>),
    BinOp(BinOp, Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy)]
enum Func {
    Abs,
    Sqrt,
    Log,
    Exp,
    Pow,
    Min,
    Max,
    Select,
}

impl Func {
    fn lookup(name: &str) -> Option<Func> {
        Some(match name {
            "abs" => Func::Abs,
            "sqrt" => Func::Sqrt,
            "log" => Func::Log,
            "exp" => Func::Exp,
            "pow" => Func::Pow,
            "min" => Func::Min,
            "max" => Func::Max,
            "select" => Func::Select,
            _ => return None,
        })
    }

    fn arity(self) -> usize {
        match self {
            Func::Abs | Func::Sqrt | Func::Log | Func::Exp => 1,
            Func::Pow | Func::Min | Func::Max => 2,
            Func::Select => 3,
        }
    }
}

// ── Frame references ───────────────────────────────────────────

/// A value an expression reads from the frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VarRef {
    /// Per-event scalar column.
    Column(String),
    /// Field of the `index`-th selected particle of a collection.
    Particle {
        /// Collection name.
        collection: String,
        /// Field name.
        field: String,
        /// Particle position after sorting.
        index: usize,
    },
    /// Number of selected particles in a collection.
    Count(String),
}

impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarRef::Column(c) => write!(f, "{c}"),
            VarRef::Particle { collection, field, index } => {
                write!(f, "{collection}.{field}[{index}]")
            }
            VarRef::Count(c) => write!(f, "{c}.n"),
        }
    }
}

// ── Compiled expression ────────────────────────────────────────

/// A compiled expression ready for evaluation.
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    ast: Expr,
    source: String,
    /// Frame values referenced by this expression (ordered by first occurrence).
    pub required_vars: Vec<VarRef>,
}

impl CompiledExpr {
    /// Parse an expression string and collect the frame values it reads.
    pub fn compile(input: &str) -> Result<Self> {
        let toks = lex(input)?;
        if toks.is_empty() {
            return Err(Error::Expression("empty expression".into()));
        }
        let mut parser = Parser::new(&toks);
        let ast = parser.expr(0)?;
        if let Some(extra) = parser.peek() {
            return Err(Error::Expression(format!("trailing {extra:?} in '{input}'")));
        }
        Ok(CompiledExpr { ast, source: input.to_string(), required_vars: parser.vars })
    }

    /// The text this expression was compiled from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate the expression for a single row.
    ///
    /// `values` must have the same length and order as `required_vars`.
    pub fn eval_row(&self, values: &[f64]) -> f64 {
        self.ast.eval(values)
    }

    /// Evaluate the expression for `n` rows (column-wise).
    ///
    /// `columns` must have the same length and order as `required_vars`;
    /// each column must have `n` entries.
    pub fn eval_bulk(&self, n: usize, columns: &[&[f64]]) -> Result<Vec<f64>> {
        if columns.len() != self.required_vars.len() {
            return Err(Error::Expression(format!(
                "'{}' needs {} inputs, got {}",
                self.source,
                self.required_vars.len(),
                columns.len()
            )));
        }
        if let Some(c) = columns.iter().find(|c| c.len() != n) {
            return Err(Error::Expression(format!(
                "'{}': input column has {} rows, expected {n}",
                self.source,
                c.len()
            )));
        }
        let mut scratch = vec![0.0; columns.len()];
        Ok((0..n)
            .map(|i| {
                scratch.iter_mut().zip(columns).for_each(|(v, col)| *v = col[i]);
                self.ast.eval(&scratch)
            })
            .collect())
    }
}

impl fmt::Display for CompiledExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

// ── Evaluation ─────────────────────────────────────────────────

fn truth(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

impl BinOp {
    fn apply(self, l: f64, r: f64) -> f64 {
        match self {
            BinOp::Add => l + r,
            BinOp::Sub => l - r,
            BinOp::Mul => l * r,
            BinOp::Div => l / r,
            BinOp::Eq => truth((l - r).abs() < f64::EPSILON),
            BinOp::Ne => truth((l - r).abs() >= f64::EPSILON),
            BinOp::Lt => truth(l < r),
            BinOp::Le => truth(l <= r),
            BinOp::Gt => truth(l > r),
            BinOp::Ge => truth(l >= r),
            BinOp::And => truth(l > 0.0 && r > 0.0),
            BinOp::Or => truth(l > 0.0 || r > 0.0),
        }
    }
}

impl Expr {
    /// NaN inputs propagate; every comparison against NaN is false.
    fn eval(&self, vals: &[f64]) -> f64 {
        match self {
            Expr::Number(n) => *n,
            Expr::Var(i) => vals[*i],
            Expr::UnaryNeg(a) => -a.eval(vals),
            Expr::UnaryNot(a) => truth(a.eval(vals).partial_cmp(&0.0) != Some(std::cmp::Ordering::Greater)),
            Expr::BinOp(op, a, b) => op.apply(a.eval(vals), b.eval(vals)),
            Expr::Call(f, args) => {
                let arg = |i: usize| args[i].eval(vals);
                match f {
                    Func::Abs => arg(0).abs(),
                    Func::Sqrt => arg(0).sqrt(),
                    Func::Log => arg(0).ln(),
                    Func::Exp => arg(0).exp(),
                    Func::Pow => arg(0).powf(arg(1)),
                    Func::Min => arg(0).min(arg(1)),
                    Func::Max => arg(0).max(arg(1)),
                    Func::Select if arg(0) > 0.0 => arg(1),
                    Func::Select => arg(2),
                }
            }
        }
    }
}

// ── Lexing ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Name(String),
    Op(BinOp),
    Bang,
    Open,
    Close,
    OpenIdx,
    CloseIdx,
    Comma,
}

impl BinOp {
    /// Binding power; higher binds tighter.
    fn power(self) -> u8 {
        match self {
            BinOp::Or => 1,
            BinOp::And => 2,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => 3,
            BinOp::Add | BinOp::Sub => 4,
            BinOp::Mul | BinOp::Div => 5,
        }
    }
}

fn lex(input: &str) -> Result<Vec<Tok>> {
    let mut out = Vec::new();
    let mut it = input.char_indices().peekable();

    while let Some((at, c)) = it.next() {
        let next = it.peek().map(|&(_, n)| n);
        let two = match (c, next) {
            ('&', Some('&')) => Some(BinOp::And),
            ('|', Some('|')) => Some(BinOp::Or),
            ('=', Some('=')) => Some(BinOp::Eq),
            ('!', Some('=')) => Some(BinOp::Ne),
            ('<', Some('=')) => Some(BinOp::Le),
            ('>', Some('=')) => Some(BinOp::Ge),
            _ => None,
        };
        if let Some(op) = two {
            it.next();
            out.push(Tok::Op(op));
            continue;
        }

        let tok = match c {
            c if c.is_whitespace() => continue,
            '+' => Tok::Op(BinOp::Add),
            '-' => Tok::Op(BinOp::Sub),
            '*' => Tok::Op(BinOp::Mul),
            '/' => Tok::Op(BinOp::Div),
            '<' => Tok::Op(BinOp::Lt),
            '>' => Tok::Op(BinOp::Gt),
            '!' => Tok::Bang,
            '(' => Tok::Open,
            ')' => Tok::Close,
            '[' => Tok::OpenIdx,
            ']' => Tok::CloseIdx,
            ',' => Tok::Comma,
            c if c.is_ascii_digit() || c == '.' => {
                let mut end = at + c.len_utf8();
                let mut prev = c;
                while let Some(&(i, d)) = it.peek() {
                    let exp_sign = (d == '+' || d == '-') && (prev == 'e' || prev == 'E');
                    if !(d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exp_sign) {
                        break;
                    }
                    prev = d;
                    end = i + d.len_utf8();
                    it.next();
                }
                let text = &input[at..end];
                Tok::Num(
                    text.parse()
                        .map_err(|_| Error::Expression(format!("invalid number: '{text}'")))?,
                )
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut end = at + c.len_utf8();
                while let Some(&(i, d)) = it.peek() {
                    if !(d.is_ascii_alphanumeric() || d == '_' || d == '.') {
                        break;
                    }
                    end = i + d.len_utf8();
                    it.next();
                }
                Tok::Name(input[at..end].to_string())
            }
            other => return Err(Error::Expression(format!("unexpected character: '{other}'"))),
        };
        out.push(tok);
    }

    Ok(out)
}

// ── Parsing (precedence climbing) ──────────────────────────────

struct Parser<'a> {
    toks: &'a [Tok],
    at: usize,
    vars: Vec<VarRef>,
}

impl<'a> Parser<'a> {
    fn new(toks: &'a [Tok]) -> Self {
        Self { toks, at: 0, vars: Vec::new() }
    }

    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.at)
    }

    fn bump(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.at).cloned();
        self.at += usize::from(t.is_some());
        t
    }

    fn eat(&mut self, want: &Tok) -> bool {
        if self.peek() == Some(want) {
            self.at += 1;
            true
        } else {
            false
        }
    }

    fn require(&mut self, want: Tok) -> Result<()> {
        match self.bump() {
            Some(t) if t == want => Ok(()),
            got => Err(Error::Expression(format!("expected {want:?}, got {got:?}"))),
        }
    }

    fn slot(&mut self, var: VarRef) -> usize {
        match self.vars.iter().position(|v| *v == var) {
            Some(i) => i,
            None => {
                self.vars.push(var);
                self.vars.len() - 1
            }
        }
    }

    /// Binary operators at or above `min` power, left-associative.
    fn expr(&mut self, min: u8) -> Result<Expr> {
        let mut lhs = self.prefix()?;
        while let Some(&Tok::Op(op)) = self.peek() {
            let power = op.power();
            if power < min {
                break;
            }
            self.at += 1;
            let rhs = self.expr(power + 1)?;
            lhs = Expr::BinOp(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn prefix(&mut self) -> Result<Expr> {
        if self.eat(&Tok::Op(BinOp::Sub)) {
            return Ok(Expr::UnaryNeg(Box::new(self.prefix()?)));
        }
        if self.eat(&Tok::Bang) {
            return Ok(Expr::UnaryNot(Box::new(self.prefix()?)));
        }
        match self.bump() {
            Some(Tok::Num(n)) => Ok(Expr::Number(n)),
            Some(Tok::Open) => {
                let inner = self.expr(0)?;
                self.require(Tok::Close)?;
                Ok(inner)
            }
            Some(Tok::Name(name)) if self.eat(&Tok::Open) => self.call(&name),
            Some(Tok::Name(name)) => {
                let var = self.reference(&name)?;
                Ok(Expr::Var(self.slot(var)))
            }
            got => Err(Error::Expression(format!(
                "expected number, identifier, or '(', got {got:?}"
            ))),
        }
    }

    /// Arguments of `name(`, up to and including the closing parenthesis.
    fn call(&mut self, name: &str) -> Result<Expr> {
        let func = Func::lookup(name)
            .ok_or_else(|| Error::Expression(format!("unknown function: '{name}'")))?;
        let mut args = vec![self.expr(0)?];
        while self.eat(&Tok::Comma) {
            args.push(self.expr(0)?);
        }
        self.require(Tok::Close)?;
        if args.len() != func.arity() {
            return Err(Error::Expression(format!(
                "{name}() takes {} argument(s), got {}",
                func.arity(),
                args.len()
            )));
        }
        Ok(Expr::Call(func, args))
    }

    /// Turn `Name`, `Coll.n` or `Coll.field` (+ optional `[i]`) into a reference.
    fn reference(&mut self, name: &str) -> Result<VarRef> {
        let Some((coll, field)) = name.split_once('.') else {
            return Ok(VarRef::Column(name.to_string()));
        };
        if coll.is_empty() || field.is_empty() || field.contains('.') {
            return Err(Error::Expression(format!("malformed reference '{name}'")));
        }
        if self.eat(&Tok::OpenIdx) {
            let index = match self.bump() {
                Some(Tok::Num(n)) if n >= 0.0 && n.fract() == 0.0 => n as usize,
                got => {
                    return Err(Error::Expression(format!(
                        "particle index in '{name}' must be a non-negative integer, got {got:?}"
                    )));
                }
            };
            self.require(Tok::CloseIdx)?;
            return Ok(VarRef::Particle {
                collection: coll.to_string(),
                field: field.to_string(),
                index,
            });
        }
        if field == "n" {
            return Ok(VarRef::Count(coll.to_string()));
        }
        Err(Error::Expression(format!(
            "'{name}' needs a particle index, e.g. '{name}[0]', or use '{coll}.n'"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(src: &str, vals: &[f64]) -> f64 {
        CompiledExpr::compile(src).unwrap().eval_row(vals)
    }

    #[test]
    fn arithmetic_and_precedence() {
        assert_eq!(eval("1 + 2 * 3", &[]), 7.0);
        assert_eq!(eval("(1 + 2) * 3", &[]), 9.0);
        assert_eq!(eval("-2 * -3", &[]), 6.0);
        assert_eq!(eval("pow(2, 10)", &[]), 1024.0);
        assert_eq!(eval("1.5e2", &[]), 150.0);
    }

    #[test]
    fn booleans_and_select() {
        assert_eq!(eval("1 < 2 && 3 >= 3", &[]), 1.0);
        assert_eq!(eval("!(1 == 1) || 0", &[]), 0.0);
        assert_eq!(eval("select(2 > 1, 10, 20)", &[]), 10.0);
        assert_eq!(eval("select(0, 10, 20)", &[]), 20.0);
    }

    #[test]
    fn frame_references() {
        let e = CompiledExpr::compile("HT > 300 && Jets.pt[1] > 30 && TightLepton.n == 2 && HT < 1000")
            .unwrap();
        assert_eq!(
            e.required_vars,
            vec![
                VarRef::Column("HT".into()),
                VarRef::Particle { collection: "Jets".into(), field: "pt".into(), index: 1 },
                VarRef::Count("TightLepton".into()),
            ]
        );
        assert_eq!(e.eval_row(&[350.0, 40.0, 2.0]), 1.0);
        assert_eq!(e.eval_row(&[350.0, f64::NAN, 2.0]), 0.0);
        assert_eq!(e.required_vars[1].to_string(), "Jets.pt[1]");
    }

    #[test]
    fn bulk_evaluation() {
        let e = CompiledExpr::compile("a + 2 * b").unwrap();
        let a = [1.0, 2.0];
        let b = [10.0, 20.0];
        assert_eq!(e.eval_bulk(2, &[&a, &b]).unwrap(), vec![21.0, 42.0]);
        assert!(e.eval_bulk(2, &[&a]).is_err());
        let c = CompiledExpr::compile("3").unwrap();
        assert_eq!(c.eval_bulk(3, &[]).unwrap(), vec![3.0, 3.0, 3.0]);
    }

    #[test]
    fn compile_errors() {
        assert!(CompiledExpr::compile("").is_err());
        assert!(CompiledExpr::compile("1 +").is_err());
        assert!(CompiledExpr::compile("foo(1)").is_err());
        assert!(CompiledExpr::compile("pow(1)").is_err());
        assert!(CompiledExpr::compile("Jets.pt").is_err());
        assert!(CompiledExpr::compile("Jets.pt[-1]").is_err());
        assert!(CompiledExpr::compile("a $ b").is_err());
    }
}
