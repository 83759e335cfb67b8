//! This module contains the symbolic memory model: the expressions that stand
//! for unknown primitive values, the values held in memory, and the
//! [`SymbolicState`] that accumulates path constraints and memory updates
//! along a path.

pub mod expression;
pub mod memory;
pub mod update;

use std::ops::Add;

use crate::{
    instrumentation::storage::{InstanceKey, NdTarget},
    program::types::{FieldRef, InstructionId, LocalId},
    symbolic::{
        expression::{SymExpr, Symbol},
        memory::{Address, ObjectKind, SymbolicValue},
        update::{MemoryUpdate, NdAssumption, SymbolicStateUpdate},
    },
};

/// The symbolic state of a path.
///
/// It is an append-only log of path constraints and memory updates, together
/// with materialised views of the heap for lookups. Every operation produces a
/// new state that shares structure with the old one.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SymbolicState {
    hard:          im::Vector<SymExpr>,
    soft:          im::Vector<SymExpr>,
    local_log:     im::Vector<(LocalId, SymbolicValue)>,
    memory_log:    im::Vector<MemoryUpdate>,
    objects:       im::OrdMap<Address, ObjectKind>,
    fields:        im::HashMap<(Address, FieldRef), SymbolicValue>,
    cells:         im::HashMap<(Address, i64), SymExpr>,
    statics:       im::OrdMap<FieldRef, SymbolicValue>,
    static_inputs: im::OrdMap<FieldRef, Symbol>,
    next_address:  u32,
    nd_instances:  im::HashMap<Address, InstanceKey>,
    nd_sites:      im::HashMap<InstructionId, u32>,
    nd_calls:      im::HashMap<(NdTarget, String), u32>,
    assumptions:   im::Vector<NdAssumption>,
}

impl SymbolicState {
    /// Creates an empty symbolic state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Produces the state with `update` applied.
    #[must_use]
    pub fn apply(&self, update: &SymbolicStateUpdate) -> Self {
        let mut state = self.clone();
        state.hard.extend(update.hard.iter().cloned());
        state.soft.extend(update.soft.iter().cloned());
        state.local_log.extend(update.locals.iter().cloned());
        for memory_update in &update.memory {
            state.apply_memory(memory_update);
        }
        state
    }

    fn apply_memory(&mut self, update: &MemoryUpdate) {
        match update {
            MemoryUpdate::Allocate { address, kind } => {
                self.objects.insert(*address, *kind);
                self.next_address = self.next_address.max(address.0 + 1);
            }
            MemoryUpdate::StoreField {
                address,
                field,
                value,
            } => {
                self.fields.insert((*address, field.clone()), value.clone());
            }
            MemoryUpdate::StoreCell {
                address,
                index,
                value,
            } => {
                self.cells.insert((*address, *index), value.clone());
            }
            MemoryUpdate::StoreStatic { field, value } => {
                self.statics.insert(field.clone(), value.clone());
            }
            MemoryUpdate::StaticInput { field, symbol } => {
                self.static_inputs.insert(field.clone(), symbol.clone());
            }
            MemoryUpdate::RegisterNdInstance { key, address } => {
                self.nd_instances.insert(*address, *key);
                let count = self.nd_sites.get(&key.site).copied().unwrap_or(0);
                self.nd_sites.insert(key.site, count.max(key.ordinal + 1));
            }
            MemoryUpdate::AssumeNd(assumption) => {
                let key = (assumption.target, assumption.signature.clone());
                let count = self.nd_calls.get(&key).copied().unwrap_or(0);
                self.nd_calls.insert(key, count.max(assumption.occurrence + 1));
                self.assumptions.push_back(assumption.clone());
            }
        }
        self.memory_log.push_back(update.clone());
    }

    /// Produces the state seen by a method called from the current one: local
    /// entries of the caller are dropped, while constraints and global memory
    /// are kept.
    #[must_use]
    pub fn for_nested_method(&self) -> Self {
        let mut state = self.clone();
        state.local_log = im::Vector::new();
        state
    }

    /// Gets the hard path constraints, in the order they were added.
    #[must_use]
    pub fn hard_constraints(&self) -> &im::Vector<SymExpr> {
        &self.hard
    }

    /// Gets the soft constraints, in the order they were added.
    #[must_use]
    pub fn soft_constraints(&self) -> &im::Vector<SymExpr> {
        &self.soft
    }

    /// Gets the log of local assignments made in the current method.
    #[must_use]
    pub fn local_log(&self) -> &im::Vector<(LocalId, SymbolicValue)> {
        &self.local_log
    }

    /// Gets the log of global memory updates.
    #[must_use]
    pub fn memory_log(&self) -> &im::Vector<MemoryUpdate> {
        &self.memory_log
    }

    /// Gets the kind of the object at `address`.
    #[must_use]
    pub fn object(&self, address: Address) -> Option<ObjectKind> {
        self.objects.get(&address).copied()
    }

    /// Gets the value of `field` of the object at `address`, if written.
    #[must_use]
    pub fn field(&self, address: Address, field: &FieldRef) -> Option<&SymbolicValue> {
        self.fields.get(&(address, field.clone()))
    }

    /// Gets the value of cell `index` of the array at `address`, if written.
    #[must_use]
    pub fn cell(&self, address: Address, index: i64) -> Option<&SymExpr> {
        self.cells.get(&(address, index))
    }

    /// Gets the current value of the static `field`, if it has been read or
    /// written on this path.
    #[must_use]
    pub fn static_value(&self, field: &FieldRef) -> Option<&SymbolicValue> {
        self.statics.get(field)
    }

    /// Gets the static fields whose initial values are inputs of the method.
    #[must_use]
    pub fn static_inputs(&self) -> &im::OrdMap<FieldRef, Symbol> {
        &self.static_inputs
    }

    /// Gets the address the next allocation will receive.
    #[must_use]
    pub fn next_address(&self) -> Address {
        Address(self.next_address)
    }

    /// Gets the registration of the non-deterministic object at `address`.
    #[must_use]
    pub fn nd_instance(&self, address: Address) -> Option<InstanceKey> {
        self.nd_instances.get(&address).copied()
    }

    /// Gets the number of non-deterministic objects registered at `site`.
    #[must_use]
    pub fn nd_site_count(&self, site: InstructionId) -> u32 {
        self.nd_sites.get(&site).copied().unwrap_or(0)
    }

    /// Gets the number of values assumed so far for `signature` on `target`.
    #[must_use]
    pub fn nd_call_count(&self, target: NdTarget, signature: &str) -> u32 {
        self.nd_calls
            .get(&(target, signature.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Gets the assumptions made about non-deterministic results.
    #[must_use]
    pub fn nd_assumptions(&self) -> &im::Vector<NdAssumption> {
        &self.assumptions
    }
}

impl Add<SymbolicStateUpdate> for SymbolicState {
    type Output = Self;

    fn add(self, rhs: SymbolicStateUpdate) -> Self::Output {
        self.apply(&rhs)
    }
}

impl Add<&SymbolicStateUpdate> for &SymbolicState {
    type Output = SymbolicState;

    fn add(self, rhs: &SymbolicStateUpdate) -> Self::Output {
        self.apply(rhs)
    }
}
