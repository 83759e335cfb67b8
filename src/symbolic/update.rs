//! This module contains the updates that transitions apply to the symbolic
//! state.

use std::ops::Add;

use serde::{Deserialize, Serialize};

use crate::{
    instrumentation::storage::{InstanceKey, NdTarget},
    program::types::{FieldRef, LocalId},
    symbolic::{
        expression::{SymExpr, Symbol},
        memory::{Address, ObjectKind, SymbolicValue},
    },
};

/// An assumption that the `occurrence`-th call to `signature` on `target`
/// produced the value of `symbol`.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct NdAssumption {
    pub target:     NdTarget,
    pub signature:  String,
    pub occurrence: u32,
    pub symbol:     Symbol,
}

/// An update to the global (non-local) part of symbolic memory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MemoryUpdate {
    Allocate {
        address: Address,
        kind:    ObjectKind,
    },
    StoreField {
        address: Address,
        field:   FieldRef,
        value:   SymbolicValue,
    },
    StoreCell {
        address: Address,
        index:   i64,
        value:   SymExpr,
    },
    StoreStatic {
        field: FieldRef,
        value: SymbolicValue,
    },
    /// Records that a static field's initial value is an input of the method.
    StaticInput {
        field:  FieldRef,
        symbol: Symbol,
    },
    RegisterNdInstance {
        key:     InstanceKey,
        address: Address,
    },
    AssumeNd(NdAssumption),
}

/// A batch of changes to the symbolic state and the top frame's locals.
///
/// Updates combine associatively with `+`, applying left then right.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SymbolicStateUpdate {
    pub hard:   Vec<SymExpr>,
    pub soft:   Vec<SymExpr>,
    pub locals: Vec<(LocalId, SymbolicValue)>,
    pub memory: Vec<MemoryUpdate>,
}

impl SymbolicStateUpdate {
    /// Creates an empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a hard path constraint.
    #[must_use]
    pub fn with_hard(mut self, constraint: SymExpr) -> Self {
        self.hard.push(constraint);
        self
    }

    /// Adds a soft constraint, which the solver tries but is not required to
    /// satisfy.
    #[must_use]
    pub fn with_soft(mut self, constraint: SymExpr) -> Self {
        self.soft.push(constraint);
        self
    }

    /// Adds an assignment to a local of the top frame.
    #[must_use]
    pub fn with_local(mut self, local: LocalId, value: SymbolicValue) -> Self {
        self.locals.push((local, value));
        self
    }

    /// Adds an update to global memory.
    #[must_use]
    pub fn with_memory(mut self, update: MemoryUpdate) -> Self {
        self.memory.push(update);
        self
    }

    /// Checks if the update changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hard.is_empty() && self.soft.is_empty() && self.locals.is_empty() && self.memory.is_empty()
    }
}

impl Add for SymbolicStateUpdate {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self::Output {
        self.hard.extend(rhs.hard);
        self.soft.extend(rhs.soft);
        self.locals.extend(rhs.locals);
        self.memory.extend(rhs.memory);
        self
    }
}
