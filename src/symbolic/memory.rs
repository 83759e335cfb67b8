//! This module contains the values held in symbolic memory and the persistent
//! local-variable memory of a stack frame.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::{
    program::types::{ClassId, Constant, LocalId},
    symbolic::expression::{Expression, SymExpr},
};

/// The address of an object allocated during exploration.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Address(pub u32);

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// A reference value.
///
/// References are always concrete: every object seen during exploration was
/// allocated on the explored path.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum Reference {
    Null,
    Object(Address),
}

/// What kind of object lives at an address.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum ObjectKind {
    Instance(ClassId),
    IntArray { length: i64 },
}

/// A value held in a local, a field, or a static field.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum SymbolicValue {
    Primitive(SymExpr),
    Reference(Reference),
}

impl SymbolicValue {
    #[must_use]
    pub fn int(value: i64) -> Self {
        Self::Primitive(Expression::int(value))
    }

    #[must_use]
    pub fn bool(value: bool) -> Self {
        Self::Primitive(Expression::bool(value))
    }

    #[must_use]
    pub fn null() -> Self {
        Self::Reference(Reference::Null)
    }

    #[must_use]
    pub fn object(address: Address) -> Self {
        Self::Reference(Reference::Object(address))
    }

    /// Converts a literal into a value.
    #[must_use]
    pub fn from_constant(value: Constant) -> Self {
        Expression::constant(value).map_or(Self::null(), Self::Primitive)
    }

    /// Gets the expression if this is a primitive value.
    #[must_use]
    pub fn as_expr(&self) -> Option<&SymExpr> {
        match self {
            Self::Primitive(expr) => Some(expr),
            Self::Reference(_) => None,
        }
    }

    /// Gets the reference if this is a reference value.
    #[must_use]
    pub fn as_reference(&self) -> Option<Reference> {
        match self {
            Self::Reference(reference) => Some(*reference),
            Self::Primitive(_) => None,
        }
    }
}

impl Display for SymbolicValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primitive(expr) => write!(f, "{expr}"),
            Self::Reference(Reference::Null) => write!(f, "null"),
            Self::Reference(Reference::Object(address)) => write!(f, "{address}"),
        }
    }
}

/// The memory of the local variables of one stack frame.
///
/// Updating it produces a new version that shares structure with the old one,
/// which stays valid and unchanged.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LocalVariableMemory {
    locals: im::HashMap<LocalId, SymbolicValue>,
}

impl LocalVariableMemory {
    /// Creates a new, empty local memory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the value of `local`, if it has been assigned.
    #[must_use]
    pub fn get(&self, local: LocalId) -> Option<&SymbolicValue> {
        self.locals.get(&local)
    }

    /// Produces a new memory with the `updates` applied in order.
    #[must_use]
    pub fn update<'a>(&self, updates: impl IntoIterator<Item = &'a (LocalId, SymbolicValue)>) -> Self {
        let mut locals = self.locals.clone();
        for (local, value) in updates {
            locals.insert(*local, value.clone());
        }
        Self { locals }
    }

    /// Produces the empty memory of a method called from the frame owning
    /// this memory.
    #[must_use]
    pub fn for_nested_method(&self) -> Self {
        Self::new()
    }

    /// Gets the number of assigned locals.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locals.len()
    }

    /// Checks if no local has been assigned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locals.is_empty()
    }
}

#[cfg(test)]
mod test {
    use crate::{
        program::types::LocalId,
        symbolic::memory::{LocalVariableMemory, SymbolicValue},
    };

    #[test]
    fn updates_leave_the_original_untouched() {
        let original = LocalVariableMemory::new().update(&[(LocalId(0), SymbolicValue::int(1))]);
        let updated = original.update(&[
            (LocalId(0), SymbolicValue::int(2)),
            (LocalId(1), SymbolicValue::null()),
        ]);

        assert_eq!(original.get(LocalId(0)), Some(&SymbolicValue::int(1)));
        assert_eq!(original.len(), 1);
        assert_eq!(updated.get(LocalId(0)), Some(&SymbolicValue::int(2)));
        assert_eq!(updated.len(), 2);
    }

    #[test]
    fn nested_memory_starts_empty() {
        let caller = LocalVariableMemory::new().update(&[(LocalId(3), SymbolicValue::bool(true))]);
        let callee = caller.for_nested_method();

        assert!(callee.is_empty());
        assert_eq!(caller.len(), 1);
    }
}
