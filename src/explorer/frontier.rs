//! This module contains the frontier of states that are waiting to be
//! expanded.

use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
};

use crate::{explorer::selector::DynSelector, state::ExecutionState};

/// A state in the frontier along with its ranking.
#[derive(Debug)]
struct Entry {
    priority: i64,
    sequence: u64,
    state:    ExecutionState,
}

impl Entry {
    fn key(&self) -> (i64, Reverse<u64>) {
        (self.priority, Reverse(self.sequence))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// The multiset of live states, ordered by a [`crate::explorer::selector::PathSelector`].
#[derive(Debug)]
pub struct Frontier {
    heap:     BinaryHeap<Entry>,
    sequence: u64,
    selector: DynSelector,
}

impl Frontier {
    /// Constructs an empty frontier ranking states with `selector`.
    #[must_use]
    pub fn new(selector: DynSelector) -> Self {
        Self {
            heap: BinaryHeap::new(),
            sequence: 0,
            selector,
        }
    }

    /// Adds `state` to the frontier.
    pub fn push(&mut self, state: ExecutionState) {
        let sequence = self.sequence;
        self.sequence += 1;
        let priority = self.selector.priority(&state, sequence);
        self.heap.push(Entry {
            priority,
            sequence,
            state,
        });
    }

    /// Takes the highest-ranked state out of the frontier.
    pub fn pop(&mut self) -> Option<ExecutionState> {
        self.heap.pop().map(|entry| entry.state)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Gets the name of the selector ordering the frontier.
    #[must_use]
    pub fn selector_name(&self) -> &'static str {
        self.selector.name()
    }
}
