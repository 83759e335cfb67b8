//! This module contains the built-in bounded solver.
//!
//! It narrows every integer symbol to an interval using the constraints that
//! compare it against a literal, then searches candidate values with
//! backtracking. Answers of [`SolverResult::Unsat`] are only given when they
//! are certain: an empty interval, or a failed search over domains that were
//! enumerated in full.

use std::collections::{BTreeMap, BTreeSet};

use itertools::Itertools;
use tracing::trace;

use crate::{
    constant::{SOLVER_INT_MAX, SOLVER_INT_MIN},
    program::{
        instruction::{BinaryOp, UnaryOp},
        types::Primitive,
    },
    solver::{Assignment, Config, ConstraintSolver, SolverResult},
    symbolic::{
        expression::{Expression, Sort, SymExpr, Symbol},
        SymbolicState,
    },
};

/// The built-in interval and enumeration solver.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BoundedSolver {
    config: Config,
}

impl BoundedSolver {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Solves the conjunction of `constraints`.
    #[must_use]
    pub fn solve_constraints(&self, constraints: &[SymExpr]) -> SolverResult {
        let mut pending = Vec::new();
        for constraint in constraints {
            match constraint.as_constant() {
                Some(Primitive::Bool(true)) => {}
                Some(_) => return SolverResult::Unsat,
                None => pending.push(constraint.clone()),
            }
        }

        let mut symbols = BTreeSet::new();
        let mut literals = BTreeSet::new();
        for constraint in &pending {
            constraint.collect_symbols(&mut symbols);
            constraint.collect_int_constants(&mut literals);
        }

        let mut domains: BTreeMap<Symbol, Domain> = symbols
            .iter()
            .map(|s| (s.clone(), Domain::new(s.sort)))
            .collect();
        for constraint in &pending {
            narrow(constraint, &mut domains);
        }

        let mut candidates = Vec::with_capacity(domains.len());
        let mut exhaustive = true;
        for (symbol, domain) in &domains {
            let values = domain.candidates(&literals, self.config.exhaustive_range);
            if values.is_empty() && domain.is_empty() {
                trace!(symbol = %symbol, "empty domain");
                return SolverResult::Unsat;
            }
            exhaustive &= domain.is_exhaustive(self.config.exhaustive_range);
            candidates.push((symbol.clone(), values));
        }

        // Smallest domains first, so that failures are found early.
        candidates.sort_by(|(a, va), (b, vb)| va.len().cmp(&vb.len()).then_with(|| a.cmp(b)));

        // Each constraint is checked as soon as its last symbol is assigned.
        let position: BTreeMap<&Symbol, usize> = candidates
            .iter()
            .enumerate()
            .map(|(i, (s, _))| (s, i))
            .collect();
        let mut checks: Vec<Vec<SymExpr>> = vec![vec![]; candidates.len()];
        for constraint in &pending {
            let mut used = BTreeSet::new();
            constraint.collect_symbols(&mut used);
            if let Some(last) = used.iter().filter_map(|s| position.get(s)).max() {
                checks[*last].push(constraint.clone());
            }
        }

        let mut search = Search {
            candidates: &candidates,
            checks: &checks,
            assignment: Assignment::new(),
            nodes: 0,
            node_limit: self.config.node_limit,
        };
        match search.run(0) {
            Outcome::Found => SolverResult::Sat(search.assignment),
            Outcome::LimitReached => SolverResult::Unknown {
                reason: format!("search exceeded {} nodes", self.config.node_limit),
            },
            Outcome::Exhausted if exhaustive => SolverResult::Unsat,
            Outcome::Exhausted => SolverResult::Unknown {
                reason: "no candidate value satisfies the constraints".to_string(),
            },
        }
    }
}

impl ConstraintSolver for BoundedSolver {
    fn solve(&self, state: &SymbolicState) -> SolverResult {
        let hard: Vec<SymExpr> = state.hard_constraints().iter().cloned().collect();
        if state.soft_constraints().is_empty() {
            return self.solve_constraints(&hard);
        }

        let with_soft: Vec<SymExpr> = hard
            .iter()
            .chain(state.soft_constraints().iter())
            .cloned()
            .collect();
        match self.solve_constraints(&with_soft) {
            sat @ SolverResult::Sat(_) => sat,
            _ => self.solve_constraints(&hard),
        }
    }

    fn name(&self) -> &'static str {
        "bounded"
    }
}

/// The values a symbol may still take.
#[derive(Clone, Debug, Eq, PartialEq)]
struct Domain {
    sort:     Sort,
    lo:       i64,
    hi:       i64,
    excluded: BTreeSet<i64>,
}

impl Domain {
    fn new(sort: Sort) -> Self {
        let (lo, hi) = match sort {
            Sort::Int => (SOLVER_INT_MIN, SOLVER_INT_MAX),
            Sort::Bool => (0, 1),
        };
        Self {
            sort,
            lo,
            hi,
            excluded: BTreeSet::new(),
        }
    }

    fn restrict(&mut self, op: BinaryOp, value: i64) {
        match op {
            BinaryOp::Lt => self.hi = self.hi.min(value.saturating_sub(1)),
            BinaryOp::Le => self.hi = self.hi.min(value),
            BinaryOp::Gt => self.lo = self.lo.max(value.saturating_add(1)),
            BinaryOp::Ge => self.lo = self.lo.max(value),
            BinaryOp::Eq => {
                self.lo = self.lo.max(value);
                self.hi = self.hi.min(value);
            }
            BinaryOp::Ne => {
                self.excluded.insert(value);
            }
            _ => {}
        }
    }

    fn width(&self) -> i128 {
        i128::from(self.hi) - i128::from(self.lo) + 1
    }

    fn is_empty(&self) -> bool {
        let excluded = self
            .excluded
            .iter()
            .filter(|v| (self.lo..=self.hi).contains(*v))
            .count();
        self.width() <= i128::try_from(excluded).unwrap_or(i128::MAX)
    }

    fn is_exhaustive(&self, range: i64) -> bool {
        self.width() <= i128::from(range)
    }

    fn candidates(&self, literals: &BTreeSet<i64>, range: i64) -> Vec<Primitive> {
        if self.is_empty() {
            return vec![];
        }
        let values: Vec<i64> = if self.is_exhaustive(range) {
            (self.lo..=self.hi).collect()
        } else {
            let mut seeds: BTreeSet<i64> = [0, 1, -1, self.lo, self.hi].into_iter().collect();
            seeds.insert(self.lo.saturating_add(1));
            seeds.insert(self.hi.saturating_sub(1));
            seeds.insert(self.lo / 2 + self.hi / 2);
            for literal in literals {
                seeds.insert(literal.saturating_sub(1));
                seeds.insert(*literal);
                seeds.insert(literal.saturating_add(1));
            }
            seeds.into_iter().collect()
        };

        values
            .into_iter()
            .filter(|v| (self.lo..=self.hi).contains(v) && !self.excluded.contains(v))
            .sorted_by_key(|v| (v.unsigned_abs(), *v < 0))
            .map(|v| match self.sort {
                Sort::Int => Primitive::Int(v),
                Sort::Bool => Primitive::Bool(v != 0),
            })
            .collect()
    }
}

/// Narrows `domains` with a single constraint, if it has a recognised shape.
fn narrow(constraint: &Expression, domains: &mut BTreeMap<Symbol, Domain>) {
    match constraint {
        Expression::Symbol(symbol) if symbol.sort == Sort::Bool => {
            if let Some(domain) = domains.get_mut(symbol) {
                domain.restrict(BinaryOp::Eq, 1);
            }
        }
        Expression::Unary {
            op: UnaryOp::Not,
            operand,
        } => {
            if let Some(symbol) = operand.as_symbol() {
                if let Some(domain) = domains.get_mut(symbol) {
                    domain.restrict(BinaryOp::Eq, 0);
                }
            }
        }
        Expression::Binary { op, left, right } if op.is_comparison() => {
            let (symbol, op, value) = match (left.as_symbol(), right.as_constant()) {
                (Some(symbol), Some(value)) => (symbol, *op, value),
                _ => match (left.as_constant(), right.as_symbol(), op.mirrored()) {
                    (Some(value), Some(symbol), Some(mirrored)) => (symbol, mirrored, value),
                    _ => return,
                },
            };
            let value = match value {
                Primitive::Int(v) => v,
                Primitive::Bool(b) => i64::from(b),
            };
            if let Some(domain) = domains.get_mut(symbol) {
                domain.restrict(op, value);
            }
        }
        _ => {}
    }
}

enum Outcome {
    Found,
    Exhausted,
    LimitReached,
}

struct Search<'a> {
    candidates: &'a [(Symbol, Vec<Primitive>)],
    checks:     &'a [Vec<SymExpr>],
    assignment: Assignment,
    nodes:      usize,
    node_limit: usize,
}

impl<'a> Search<'a> {
    fn run(&mut self, depth: usize) -> Outcome {
        let Some((symbol, values)) = self.candidates.get(depth) else {
            return Outcome::Found;
        };
        for value in values {
            self.nodes += 1;
            if self.nodes > self.node_limit {
                return Outcome::LimitReached;
            }
            self.assignment.insert(symbol.clone(), *value);
            if self.assignment.satisfies(&self.checks[depth]) {
                match self.run(depth + 1) {
                    Outcome::Exhausted => {}
                    other => return other,
                }
            }
        }
        Outcome::Exhausted
    }
}

#[cfg(test)]
mod test {
    use crate::{
        program::{instruction::BinaryOp, types::Primitive},
        solver::{bounded::BoundedSolver, Config, ConstraintSolver, SolverResult},
        symbolic::{
            expression::{Expression, Sort, SymExpr, Symbol},
            update::SymbolicStateUpdate,
            SymbolicState,
        },
    };

    fn int(name: &str) -> (Symbol, SymExpr) {
        let symbol = Symbol::new(name, Sort::Int);
        (symbol.clone(), Expression::symbol(symbol))
    }

    #[test]
    fn finds_the_zero_divisor() {
        let (b, b_expr) = int("b");
        let constraint = Expression::eq(b_expr, Expression::int(0));
        let result = BoundedSolver::default().solve_constraints(&[constraint]);

        let SolverResult::Sat(assignment) = result else {
            panic!("expected a model, got {result:?}");
        };
        assert_eq!(assignment.get(&b), Some(Primitive::Int(0)));
    }

    #[test]
    fn excludes_values_and_prefers_small_magnitudes() {
        let (b, b_expr) = int("b");
        let constraint = Expression::binary(BinaryOp::Ne, b_expr, Expression::int(0));
        let result = BoundedSolver::default().solve_constraints(&[constraint]);

        assert_eq!(
            result,
            SolverResult::Sat({
                let mut expected = crate::solver::Assignment::new();
                expected.insert(b, Primitive::Int(1));
                expected
            })
        );
    }

    #[test]
    fn contradictory_bounds_are_unsat() {
        let (_, x) = int("x");
        let constraints = [
            Expression::binary(BinaryOp::Gt, x.clone(), Expression::int(10)),
            Expression::binary(BinaryOp::Lt, x, Expression::int(5)),
        ];
        let result = BoundedSolver::default().solve_constraints(&constraints);
        assert_eq!(result, SolverResult::Unsat);
    }

    #[test]
    fn relational_constraints_are_searched() {
        let (x, x_expr) = int("x");
        let (y, y_expr) = int("y");
        let sum = Expression::binary(BinaryOp::Add, x_expr.clone(), y_expr.clone());
        let constraints = [
            Expression::eq(sum, Expression::int(7)),
            Expression::binary(BinaryOp::Gt, x_expr, y_expr),
        ];
        let result = BoundedSolver::default().solve_constraints(&constraints);

        let SolverResult::Sat(assignment) = result else {
            panic!("expected a model, got {result:?}");
        };
        let x = assignment.value_of(&x).as_int().unwrap();
        let y = assignment.value_of(&y).as_int().unwrap();
        assert_eq!(x + y, 7);
        assert!(x > y);
    }

    #[test]
    fn soft_constraints_are_dropped_when_they_conflict() {
        let (x, x_expr) = int("x");
        let state = SymbolicState::new()
            + SymbolicStateUpdate::new()
                .with_hard(Expression::binary(
                    BinaryOp::Ge,
                    x_expr.clone(),
                    Expression::int(3),
                ))
                .with_soft(Expression::eq(x_expr, Expression::int(0)));
        let result = BoundedSolver::default().solve(&state);

        let SolverResult::Sat(assignment) = result else {
            panic!("expected a model, got {result:?}");
        };
        assert_eq!(assignment.get(&x), Some(Primitive::Int(3)));
    }

    #[test]
    fn node_limit_yields_unknown() {
        let (_, x) = int("x");
        let (_, y) = int("y");
        let product = Expression::binary(BinaryOp::Mul, x, y);
        let constraint = Expression::eq(product, Expression::int(1_000_003));
        let solver = BoundedSolver::new(Config::default().with_node_limit(10));

        let result = solver.solve_constraints(&[constraint]);
        assert!(matches!(result, SolverResult::Unknown { .. }));
    }
}
