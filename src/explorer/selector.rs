//! This module contains the strategies that decide which frontier state the
//! explorer expands next.
//!
//! A [`PathSelector`] assigns every state a priority when it enters the
//! frontier. The state with the highest priority is expanded first, and ties
//! are broken by insertion order.

use std::fmt::Debug;

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{constant::DEFAULT_SELECTOR_SEED, state::ExecutionState};

/// A strategy for ordering the frontier.
pub trait PathSelector
where
    Self: Debug + Send,
{
    /// Computes the priority of `state`, which is the `sequence`-th state to
    /// enter the frontier.
    fn priority(&mut self, state: &ExecutionState, sequence: u64) -> i64;

    /// Gets a name for the strategy, used in logs.
    fn name(&self) -> &'static str;
}

/// A boxed [`PathSelector`].
pub type DynSelector = Box<dyn PathSelector>;

/// Expands states in the order they were produced.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BreadthFirst;

impl PathSelector for BreadthFirst {
    fn priority(&mut self, _: &ExecutionState, _: u64) -> i64 {
        0
    }

    fn name(&self) -> &'static str {
        "breadth-first"
    }
}

/// Expands the most recently produced state first.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DepthFirst;

impl PathSelector for DepthFirst {
    fn priority(&mut self, _: &ExecutionState, sequence: u64) -> i64 {
        i64::try_from(sequence).unwrap_or(i64::MAX)
    }

    fn name(&self) -> &'static str {
        "depth-first"
    }
}

/// Expands the state with the shortest path first.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ShortestPath;

impl PathSelector for ShortestPath {
    fn priority(&mut self, state: &ExecutionState, _: u64) -> i64 {
        -i64::try_from(state.path_length()).unwrap_or(i64::MAX)
    }

    fn name(&self) -> &'static str {
        "shortest-path"
    }
}

/// Expands the state that went through the fewest forks first.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ForkDepth;

impl PathSelector for ForkDepth {
    fn priority(&mut self, state: &ExecutionState, _: u64) -> i64 {
        -i64::try_from(state.analytics().depth).unwrap_or(i64::MAX)
    }

    fn name(&self) -> &'static str {
        "fork-depth"
    }
}

/// Expands states that recently covered new instructions first.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CoveredNew;

impl PathSelector for CoveredNew {
    fn priority(&mut self, state: &ExecutionState, _: u64) -> i64 {
        let analytics = state.analytics();
        if analytics.is_visited_new {
            i64::MAX
        } else {
            -i64::try_from(analytics.steps_since_last_covered).unwrap_or(i64::MAX)
        }
    }

    fn name(&self) -> &'static str {
        "covered-new"
    }
}

/// Expands states in a pseudo-random order that is fixed by the seed.
#[derive(Clone, Debug)]
pub struct SeededRandom {
    rng: StdRng,
}

impl SeededRandom {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        let rng = StdRng::seed_from_u64(seed);
        Self { rng }
    }
}

impl PathSelector for SeededRandom {
    fn priority(&mut self, _: &ExecutionState, _: u64) -> i64 {
        self.rng.gen()
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// The bundled selectors, as configuration data.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum SelectorKind {
    BreadthFirst,
    DepthFirst,
    ShortestPath,
    ForkDepth,
    #[default]
    CoveredNew,
    Random { seed: u64 },
}

impl SelectorKind {
    /// Constructs a fresh selector of this kind.
    #[must_use]
    pub fn build(self) -> DynSelector {
        match self {
            Self::BreadthFirst => Box::new(BreadthFirst),
            Self::DepthFirst => Box::new(DepthFirst),
            Self::ShortestPath => Box::new(ShortestPath),
            Self::ForkDepth => Box::new(ForkDepth),
            Self::CoveredNew => Box::new(CoveredNew),
            Self::Random { seed } => Box::new(SeededRandom::new(seed)),
        }
    }

    /// The random selector with the default seed.
    #[must_use]
    pub fn random() -> Self {
        Self::Random {
            seed: DEFAULT_SELECTOR_SEED,
        }
    }
}

#[cfg(test)]
mod test {
    use crate::{
        explorer::selector::{PathSelector, SelectorKind},
        program::types::MethodId,
        state::{frame::CallArguments, ExecutionState},
        symbolic::SymbolicState,
    };

    fn state() -> ExecutionState {
        ExecutionState::initial(MethodId(0), CallArguments::default(), SymbolicState::new())
    }

    #[test]
    fn depth_first_prefers_newer_states() {
        let mut selector = SelectorKind::DepthFirst.build();
        let state = state();
        assert!(selector.priority(&state, 2) > selector.priority(&state, 1));
    }

    #[test]
    fn covered_new_prefers_states_covering_new_code() {
        let mut selector = SelectorKind::CoveredNew.build();
        let plain = state();
        let fresh = plain.marked_visited_new();
        assert!(selector.priority(&fresh, 0) > selector.priority(&plain, 1));
    }

    #[test]
    fn random_selection_is_reproducible() {
        let state = state();
        let mut first = SelectorKind::random().build();
        let mut second = SelectorKind::random().build();
        let a: Vec<i64> = (0..8).map(|i| first.priority(&state, i)).collect();
        let b: Vec<i64> = (0..8).map(|i| second.priority(&state, i)).collect();
        assert_eq!(a, b);
        assert_eq!(first.name(), "random");
    }
}
