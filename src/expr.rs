//! Size, condition and custom-codec expressions.
//!
//! The language is deliberately tiny: one operand, or two/three operands joined by
//! `% + - / > <`. Three operands group to the right, so `a - b - c` is `a - (b - c)`.
//! Comparisons yield `0` or `1`; division truncates toward zero.
//!
//! Operands are integer literals (`42`, `0x2A`) or variable references. A reference is
//! either `$name` or a scope path such as `len`, `../len` or `hdr/len`, where `..`
//! climbs to the parent scope and an identifier descends into a named child scope.

use pest::Parser;
use pest_derive::Parser as PestParser;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(PestParser)]
#[grammar = "expr.pest"]
struct ExprParser;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExprError {
    #[error("Syntax: {0}")]
    Syntax(String),
    #[error("Unbound variable: {0}")]
    Unbound(String),
    #[error("Division by zero")]
    DivisionByZero,
    #[error("Arithmetic overflow")]
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Rem,
    Add,
    Sub,
    Div,
    Gt,
    Lt,
}

impl Operator {
    fn from_symbol(s: &str) -> Result<Self, ExprError> {
        Ok(match s {
            "%" => Operator::Rem,
            "+" => Operator::Add,
            "-" => Operator::Sub,
            "/" => Operator::Div,
            ">" => Operator::Gt,
            "<" => Operator::Lt,
            other => return Err(ExprError::Syntax(format!("unknown operator {:?}", other))),
        })
    }

    pub fn apply(self, a: i64, b: i64) -> Result<i64, ExprError> {
        match self {
            Operator::Rem => {
                if b == 0 {
                    return Err(ExprError::DivisionByZero);
                }
                a.checked_rem(b).ok_or(ExprError::Overflow)
            }
            Operator::Add => a.checked_add(b).ok_or(ExprError::Overflow),
            Operator::Sub => a.checked_sub(b).ok_or(ExprError::Overflow),
            Operator::Div => {
                if b == 0 {
                    return Err(ExprError::DivisionByZero);
                }
                a.checked_div(b).ok_or(ExprError::Overflow)
            }
            Operator::Gt => Ok((a > b) as i64),
            Operator::Lt => Ok((a < b) as i64),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operator::Rem => "%",
            Operator::Add => "+",
            Operator::Sub => "-",
            Operator::Div => "/",
            Operator::Gt => ">",
            Operator::Lt => "<",
        })
    }
}

/// A variable reference as written in the expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VarRef {
    /// Reference text without the `$` sigil; also the binding key for [`Expression::compute`].
    pub name: String,
}

impl VarRef {
    /// Path segments, split on `/`.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.name.split('/')
    }

    pub fn is_local(&self) -> bool {
        !self.name.contains('/')
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(i64),
    Variable(VarRef),
}

/// A parsed expression. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    operands: Vec<Operand>,
    operators: Vec<Operator>,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let mut pairs = ExprParser::parse(Rule::expression_input, source)
            .map_err(|e| ExprError::Syntax(format!("{}", e)))?;
        let expr = pairs
            .next()
            .filter(|p| p.as_rule() == Rule::expression)
            .ok_or_else(|| ExprError::Syntax("empty expression".to_string()))?;

        let mut operands = Vec::new();
        let mut operators = Vec::new();
        for part in expr.into_inner() {
            match part.as_rule() {
                Rule::number => operands.push(Operand::Literal(parse_number(part.as_str())?)),
                Rule::variable => {
                    let name = part
                        .into_inner()
                        .next()
                        .map(|p| p.as_str().to_string())
                        .ok_or_else(|| ExprError::Syntax("empty variable".to_string()))?;
                    operands.push(Operand::Variable(VarRef { name }));
                }
                Rule::operator => operators.push(Operator::from_symbol(part.as_str())?),
                _ => {}
            }
        }
        if operands.len() != operators.len() + 1 || operands.len() > 3 {
            return Err(ExprError::Syntax(format!("malformed expression {:?}", source)));
        }
        Ok(Expression {
            source: source.trim().to_string(),
            operands,
            operators,
        })
    }

    /// A constant expression; used for literal sizes built by hosts.
    pub fn literal(value: i64) -> Self {
        Expression {
            source: value.to_string(),
            operands: vec![Operand::Literal(value)],
            operators: Vec::new(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Free variables in order of first appearance, without duplicates.
    pub fn variables(&self) -> Vec<&VarRef> {
        let mut out: Vec<&VarRef> = Vec::new();
        for op in &self.operands {
            if let Operand::Variable(v) = op {
                if !out.contains(&v) {
                    out.push(v);
                }
            }
        }
        out
    }

    /// Value of a variable-free expression.
    pub fn constant(&self) -> Option<i64> {
        if self.operands.iter().any(|o| matches!(o, Operand::Variable(_))) {
            return None;
        }
        self.compute(&HashMap::new()).ok()
    }

    pub fn compute(&self, bindings: &HashMap<String, i64>) -> Result<i64, ExprError> {
        let values = self
            .operands
            .iter()
            .map(|op| match op {
                Operand::Literal(n) => Ok(*n),
                Operand::Variable(v) => bindings
                    .get(&v.name)
                    .copied()
                    .ok_or_else(|| ExprError::Unbound(v.name.clone())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        match (values.as_slice(), self.operators.as_slice()) {
            ([a], []) => Ok(*a),
            ([a, b], [op]) => op.apply(*a, *b),
            ([a, b, c], [op1, op2]) => op1.apply(*a, op2.apply(*b, *c)?),
            _ => Err(ExprError::Syntax(self.source.clone())),
        }
    }
}

impl FromStr for Expression {
    type Err = ExprError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Expression::parse(s)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn parse_number(s: &str) -> Result<i64, ExprError> {
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16)
    } else {
        s.parse::<i64>()
    };
    parsed.map_err(|_| ExprError::Syntax(format!("integer out of range: {}", s)))
}
