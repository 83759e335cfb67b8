//! This module contains the interface to constraint solving, which turns the
//! path constraints of a state into concrete values for its symbols.
//!
//! The generator treats solving as an external concern: anything implementing
//! [`ConstraintSolver`] can be plugged in. [`bounded::BoundedSolver`] is the
//! built-in implementation.

pub mod bounded;

use std::{
    collections::BTreeMap,
    fmt::{Debug, Display, Formatter},
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::{
    constant::DEFAULT_SOLVER_NODE_LIMIT,
    program::types::{ConcreteValue, Primitive},
    symbolic::{
        expression::{Expression, Sort, Symbol},
        SymbolicState,
    },
};

/// A dynamically dispatched, shareable [`ConstraintSolver`].
pub type DynSolver = Arc<dyn ConstraintSolver>;

/// The interface to a constraint solver.
pub trait ConstraintSolver
where
    Self: Debug + Send + Sync,
{
    /// Searches for values of the symbols of `state` that satisfy all of its
    /// hard constraints, satisfying as many soft constraints as it can.
    fn solve(&self, state: &SymbolicState) -> SolverResult;

    /// Gets a name for the solver, used in logs.
    fn name(&self) -> &'static str;
}

/// The answer of a solver.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SolverResult {
    /// The constraints are satisfiable, by the provided assignment.
    Sat(Assignment),

    /// The constraints cannot be satisfied.
    Unsat,

    /// The solver could not decide.
    Unknown { reason: String },
}

impl SolverResult {
    #[must_use]
    pub fn is_unsat(&self) -> bool {
        matches!(self, Self::Unsat)
    }
}

/// Concrete values for symbols.
///
/// Symbols without an explicit value take the default value of their sort,
/// which is sound for symbols that no constraint mentions.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    values: BTreeMap<Symbol, Primitive>,
}

impl Assignment {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the value of `symbol`.
    pub fn insert(&mut self, symbol: Symbol, value: Primitive) {
        self.values.insert(symbol, value);
    }

    /// Gets the value explicitly assigned to `symbol`.
    #[must_use]
    pub fn get(&self, symbol: &Symbol) -> Option<Primitive> {
        self.values.get(symbol).copied()
    }

    /// Gets the value of `symbol`, defaulting by sort.
    #[must_use]
    pub fn value_of(&self, symbol: &Symbol) -> Primitive {
        self.get(symbol).unwrap_or(match symbol.sort {
            Sort::Int => Primitive::Int(0),
            Sort::Bool => Primitive::Bool(false),
        })
    }

    /// Evaluates `expression` under the assignment.
    ///
    /// Returns [`None`] if evaluation faults.
    #[must_use]
    pub fn evaluate(&self, expression: &Expression) -> Option<Primitive> {
        expression.evaluate(&|symbol| Some(self.value_of(symbol)))
    }

    /// Evaluates `expression` into a value as it crosses into the sandbox.
    #[must_use]
    pub fn concretize(&self, expression: &Expression) -> Option<ConcreteValue> {
        self.evaluate(expression).map(ConcreteValue::from)
    }

    /// Checks if every one of `constraints` holds under the assignment.
    #[must_use]
    pub fn satisfies<'a>(&self, constraints: impl IntoIterator<Item = &'a Arc<Expression>>) -> bool {
        constraints
            .into_iter()
            .all(|c| self.evaluate(c) == Some(Primitive::Bool(true)))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates the explicit values in symbol order.
    pub fn iter(&self) -> impl Iterator<Item = (&Symbol, &Primitive)> {
        self.values.iter()
    }
}

impl Display for Assignment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let rendered: Vec<String> = self.values.iter().map(|(s, v)| format!("{s}={v}")).collect();
        write!(f, "{{{}}}", rendered.join(", "))
    }
}

/// The configuration of the built-in solver.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// The maximum number of partial assignments the search visits before
    /// answering [`SolverResult::Unknown`].
    ///
    /// Defaults to [`DEFAULT_SOLVER_NODE_LIMIT`].
    pub node_limit: usize,

    /// The number of values in an integer range below which the range is
    /// enumerated exhaustively.
    pub exhaustive_range: i64,
}

impl Config {
    /// Sets the `node_limit` config parameter to `value`.
    #[must_use]
    pub fn with_node_limit(mut self, value: usize) -> Self {
        self.node_limit = value;
        self
    }

    /// Sets the `exhaustive_range` config parameter to `value`.
    #[must_use]
    pub fn with_exhaustive_range(mut self, value: i64) -> Self {
        self.exhaustive_range = value;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        let node_limit = DEFAULT_SOLVER_NODE_LIMIT;
        let exhaustive_range = 64;
        Self {
            node_limit,
            exhaustive_range,
        }
    }
}
