//! This module contains the symbolic expressions that represent primitive
//! values during exploration.

use std::{
    collections::BTreeSet,
    fmt::{Display, Formatter},
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::program::{
    instruction::{BinaryOp, UnaryOp},
    types::{Constant, Primitive},
};

/// A shared, immutable symbolic expression.
pub type SymExpr = Arc<Expression>;

/// The sort (primitive type) of a symbol.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum Sort {
    Int,
    Bool,
}

/// A free variable of the path constraints.
///
/// Symbols are named deterministically from where they were introduced, so
/// that exploring the same path twice produces the same symbols.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub sort: Sort,
}

impl Symbol {
    #[must_use]
    pub fn new(name: impl Into<String>, sort: Sort) -> Self {
        let name = name.into();
        Self { name, sort }
    }
}

impl Display for Symbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A symbolic expression over primitive values.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    Const(Primitive),
    Symbol(Symbol),
    Binary {
        op:    BinaryOp,
        left:  SymExpr,
        right: SymExpr,
    },
    Unary {
        op:      UnaryOp,
        operand: SymExpr,
    },
}

impl Expression {
    #[must_use]
    pub fn int(value: i64) -> SymExpr {
        Arc::new(Self::Const(Primitive::Int(value)))
    }

    #[must_use]
    pub fn bool(value: bool) -> SymExpr {
        Arc::new(Self::Const(Primitive::Bool(value)))
    }

    #[must_use]
    pub fn symbol(symbol: Symbol) -> SymExpr {
        Arc::new(Self::Symbol(symbol))
    }

    /// Builds the expression for a primitive literal, returning [`None`] for
    /// `null`.
    #[must_use]
    pub fn constant(value: Constant) -> Option<SymExpr> {
        match value {
            Constant::Int(v) => Some(Self::int(v)),
            Constant::Bool(v) => Some(Self::bool(v)),
            Constant::Null => None,
        }
    }

    /// Builds `left op right`, folding it when both sides are constant.
    ///
    /// Divisions by a constant zero are never folded, as they do not have a
    /// value.
    #[must_use]
    pub fn binary(op: BinaryOp, left: SymExpr, right: SymExpr) -> SymExpr {
        if let (Some(l), Some(r)) = (left.as_constant(), right.as_constant()) {
            if let Ok(folded) = op.apply(l, r) {
                return Arc::new(Self::Const(folded));
            }
        }
        Arc::new(Self::Binary { op, left, right })
    }

    /// Builds `op operand`, folding constants and double negations.
    #[must_use]
    pub fn unary(op: UnaryOp, operand: SymExpr) -> SymExpr {
        if let Some(value) = operand.as_constant() {
            if let Ok(folded) = op.apply(value) {
                return Arc::new(Self::Const(folded));
            }
        }
        match (op, operand.as_ref()) {
            (UnaryOp::Not | UnaryOp::Neg, Self::Unary { op: inner, operand }) if *inner == op => {
                operand.clone()
            }
            (UnaryOp::Not, Self::Binary { op: cmp, left, right }) if cmp.negated().is_some() => {
                let negated = cmp.negated().unwrap_or(*cmp);
                Self::binary(negated, left.clone(), right.clone())
            }
            _ => Arc::new(Self::Unary { op, operand }),
        }
    }

    /// Builds the negation of the boolean `expression`.
    #[must_use]
    pub fn not(expression: SymExpr) -> SymExpr {
        Self::unary(UnaryOp::Not, expression)
    }

    /// Builds `left == right`.
    #[must_use]
    pub fn eq(left: SymExpr, right: SymExpr) -> SymExpr {
        Self::binary(BinaryOp::Eq, left, right)
    }

    /// Gets the value of the expression if it is a constant.
    #[must_use]
    pub fn as_constant(&self) -> Option<Primitive> {
        match self {
            Self::Const(value) => Some(*value),
            _ => None,
        }
    }

    /// Gets the symbol if the expression is exactly one symbol.
    #[must_use]
    pub fn as_symbol(&self) -> Option<&Symbol> {
        match self {
            Self::Symbol(symbol) => Some(symbol),
            _ => None,
        }
    }

    /// Gets the sort of the expression.
    #[must_use]
    pub fn sort(&self) -> Sort {
        match self {
            Self::Const(Primitive::Int(_)) => Sort::Int,
            Self::Const(Primitive::Bool(_)) => Sort::Bool,
            Self::Symbol(symbol) => symbol.sort,
            Self::Binary { op, left, .. } => {
                if op.is_comparison() {
                    Sort::Bool
                } else {
                    left.sort()
                }
            }
            Self::Unary { operand, .. } => operand.sort(),
        }
    }

    /// Collects every symbol occurring in the expression into `out`.
    pub fn collect_symbols(&self, out: &mut BTreeSet<Symbol>) {
        match self {
            Self::Const(_) => {}
            Self::Symbol(symbol) => {
                out.insert(symbol.clone());
            }
            Self::Binary { left, right, .. } => {
                left.collect_symbols(out);
                right.collect_symbols(out);
            }
            Self::Unary { operand, .. } => operand.collect_symbols(out),
        }
    }

    /// Collects every integer literal occurring in the expression into `out`.
    pub fn collect_int_constants(&self, out: &mut BTreeSet<i64>) {
        match self {
            Self::Const(Primitive::Int(value)) => {
                out.insert(*value);
            }
            Self::Const(_) | Self::Symbol(_) => {}
            Self::Binary { left, right, .. } => {
                left.collect_int_constants(out);
                right.collect_int_constants(out);
            }
            Self::Unary { operand, .. } => operand.collect_int_constants(out),
        }
    }

    /// Evaluates the expression with symbol values provided by `lookup`.
    ///
    /// Returns [`None`] if a symbol has no value or if evaluation faults.
    pub fn evaluate(&self, lookup: &impl Fn(&Symbol) -> Option<Primitive>) -> Option<Primitive> {
        match self {
            Self::Const(value) => Some(*value),
            Self::Symbol(symbol) => lookup(symbol),
            Self::Binary { op, left, right } => {
                let l = left.evaluate(lookup)?;
                let r = right.evaluate(lookup)?;
                op.apply(l, r).ok()
            }
            Self::Unary { op, operand } => op.apply(operand.evaluate(lookup)?).ok(),
        }
    }

    /// Gets the number of nodes in the expression tree.
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Self::Const(_) | Self::Symbol(_) => 1,
            Self::Binary { left, right, .. } => 1 + left.size() + right.size(),
            Self::Unary { operand, .. } => 1 + operand.size(),
        }
    }
}

impl Display for Expression {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Const(value) => write!(f, "{value}"),
            Self::Symbol(symbol) => write!(f, "{symbol}"),
            Self::Binary { op, left, right } => write!(f, "({left} {} {right})", op.symbol()),
            Self::Unary { op, operand } => write!(f, "{}{operand}", op.symbol()),
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;

    use crate::{
        program::{instruction::BinaryOp, types::Primitive},
        symbolic::expression::{Expression, Sort, Symbol},
    };

    #[test]
    fn constants_are_folded() {
        let sum = Expression::binary(BinaryOp::Add, Expression::int(2), Expression::int(3));
        assert_eq!(sum.as_constant(), Some(Primitive::Int(5)));
    }

    #[test]
    fn division_by_constant_zero_is_kept_symbolic() {
        let quotient = Expression::binary(BinaryOp::Div, Expression::int(2), Expression::int(0));
        assert!(quotient.as_constant().is_none());
        assert_eq!(quotient.evaluate(&|_| None), None);
    }

    #[test]
    fn negated_comparisons_are_flipped() {
        let x = Expression::symbol(Symbol::new("x", Sort::Int));
        let lt = Expression::binary(BinaryOp::Lt, x.clone(), Expression::int(4));
        let not_lt = Expression::not(lt.clone());

        assert_eq!(not_lt, Expression::binary(BinaryOp::Ge, x, Expression::int(4)));
        assert_eq!(not_lt.sort(), Sort::Bool);
        assert_eq!(Expression::not(Expression::not(lt.clone())), lt);
    }

    #[test]
    fn evaluation_uses_the_lookup() {
        let x = Symbol::new("x", Sort::Int);
        let expr = Expression::binary(
            BinaryOp::Mul,
            Expression::symbol(x.clone()),
            Expression::int(3),
        );
        let value = expr.evaluate(&|s| (s == &x).then_some(Primitive::Int(7)));
        assert_eq!(value, Some(Primitive::Int(21)));

        let mut symbols = BTreeSet::new();
        expr.collect_symbols(&mut symbols);
        assert_eq!(symbols.into_iter().collect::<Vec<_>>(), vec![x]);
    }
}
