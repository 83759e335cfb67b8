//! This module contains the per-state statistics that path selectors use to
//! rank states.

use serde::{Deserialize, Serialize};

/// A snapshot of statistics about the path leading to a state.
///
/// The snapshot of a successor is derived purely from its predecessor through
/// [`StateAnalytics::successor`].
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct StateAnalytics {
    /// The number of forks on the path.
    pub depth: usize,

    /// The number of newly covered instructions since the last fork.
    pub visited_after_last_fork: usize,

    /// The number of newly covered instructions before the last fork.
    pub visited_before_last_fork: usize,

    /// The number of steps since the path last covered a new instruction.
    pub steps_since_last_covered: usize,

    /// Whether the state was produced by a transition with siblings.
    pub is_fork: bool,

    /// Whether the state's transition covered a new instruction.
    pub is_visited_new: bool,
}

impl StateAnalytics {
    /// Gets the statistics of a method entry state.
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    /// Derives the statistics of a state following one with these
    /// statistics.
    #[must_use]
    pub fn successor(&self) -> Self {
        let newly_covered = usize::from(self.is_visited_new);
        let (depth, before, after) = if self.is_fork {
            (
                self.depth + 1,
                self.visited_before_last_fork + self.visited_after_last_fork,
                newly_covered,
            )
        } else {
            (
                self.depth,
                self.visited_before_last_fork,
                self.visited_after_last_fork + newly_covered,
            )
        };
        let steps_since_last_covered = if self.is_visited_new {
            0
        } else {
            self.steps_since_last_covered + 1
        };

        Self {
            depth,
            visited_after_last_fork: after,
            visited_before_last_fork: before,
            steps_since_last_covered,
            is_fork: false,
            is_visited_new: false,
        }
    }

    /// Marks the statistics as belonging to a forked state.
    #[must_use]
    pub fn marked_fork(self) -> Self {
        Self {
            is_fork: true,
            ..self
        }
    }

    /// Marks the statistics as belonging to a state that covered a new
    /// instruction.
    #[must_use]
    pub fn marked_visited_new(self) -> Self {
        Self {
            is_visited_new: true,
            ..self
        }
    }
}

#[cfg(test)]
mod test {
    use crate::state::analytics::StateAnalytics;

    #[test]
    fn forks_deepen_successors() {
        let root = StateAnalytics::root().marked_fork().marked_visited_new();
        let child = root.successor();

        assert_eq!(child.depth, 1);
        assert_eq!(child.visited_after_last_fork, 1);
        assert_eq!(child.steps_since_last_covered, 0);
        assert!(!child.is_fork);
    }

    #[test]
    fn uncovered_steps_accumulate() {
        let state = StateAnalytics::root().successor().successor();
        assert_eq!(state.steps_since_last_covered, 2);
        assert_eq!(state.depth, 0);
    }
}
