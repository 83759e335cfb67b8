//! This module contains the identifiers and primitive types that make up the
//! program representation.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// The identifier of a class within a [`super::Program`].
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
pub struct ClassId(pub u32);

/// The identifier of a method within a [`super::Program`].
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
pub struct MethodId(pub u32);

/// The identifier of a local variable slot within a single method body.
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
pub struct LocalId(pub u32);

impl Display for ClassId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "c{}", self.0)
    }
}

impl Display for MethodId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "m{}", self.0)
    }
}

impl Display for LocalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "l{}", self.0)
    }
}

/// A program point: the instruction at `index` in the body of `method`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct InstructionId {
    pub method: MethodId,
    pub index:  u32,
}

impl InstructionId {
    /// Constructs a new instruction identifier.
    #[must_use]
    pub fn new(method: MethodId, index: u32) -> Self {
        Self { method, index }
    }

    /// Gets the identifier of the first instruction of `method`.
    #[must_use]
    pub fn entry(method: MethodId) -> Self {
        Self::new(method, 0)
    }

    /// Gets the identifier of the instruction directly following this one in
    /// the same method.
    #[must_use]
    pub fn next(&self) -> Self {
        Self::new(self.method, self.index + 1)
    }

    /// Gets the identifier of the instruction at `index` in the same method.
    #[must_use]
    pub fn at(&self, index: u32) -> Self {
        Self::new(self.method, index)
    }
}

impl Display for InstructionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.method, self.index)
    }
}

/// A reference to a (static or instance) field declared by `class`.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct FieldRef {
    pub class: ClassId,
    pub name:  String,
}

impl FieldRef {
    #[must_use]
    pub fn new(class: ClassId, name: impl Into<String>) -> Self {
        let name = name.into();
        Self { class, name }
    }
}

impl Display for FieldRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.class, self.name)
    }
}

/// The types of values that the program manipulates.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Type {
    Void,
    Int,
    Bool,
    Object(ClassId),
    IntArray,
}

impl Type {
    /// Checks if values of this type are references into the heap.
    #[must_use]
    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Object(_) | Self::IntArray)
    }

    /// Checks if values of this type can be represented symbolically.
    #[must_use]
    pub fn is_primitive(&self) -> bool {
        matches!(self, Self::Int | Self::Bool)
    }

    /// Gets the value a field or array cell of this type starts out with.
    #[must_use]
    pub fn default_constant(&self) -> Constant {
        match self {
            Self::Int => Constant::Int(0),
            Self::Bool => Constant::Bool(false),
            Self::Void | Self::Object(_) | Self::IntArray => Constant::Null,
        }
    }
}

/// A literal value that can appear directly in the program.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Int(i64),
    Bool(bool),
    Null,
}

impl Display for Constant {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Null => write!(f, "null"),
        }
    }
}

/// A primitive runtime value, shared by the symbolic evaluator and the
/// concrete interpreter so that both agree on arithmetic.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum Primitive {
    Int(i64),
    Bool(bool),
}

impl Primitive {
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::Bool(_) => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            Self::Int(_) => None,
        }
    }
}

impl Display for Primitive {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Bool(value) => write!(f, "{value}"),
        }
    }
}

/// A value as it crosses the process boundary to and from the sandbox, and as
/// it is asserted on in a generated test case.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum ConcreteValue {
    Void,
    Int(i64),
    Bool(bool),
    Null,
    Object { class: String },
    Array { length: i64 },
}

impl From<Primitive> for ConcreteValue {
    fn from(value: Primitive) -> Self {
        match value {
            Primitive::Int(value) => Self::Int(value),
            Primitive::Bool(value) => Self::Bool(value),
        }
    }
}

impl From<Constant> for ConcreteValue {
    fn from(value: Constant) -> Self {
        match value {
            Constant::Int(value) => Self::Int(value),
            Constant::Bool(value) => Self::Bool(value),
            Constant::Null => Self::Null,
        }
    }
}

impl Display for ConcreteValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Void => write!(f, "void"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Null => write!(f, "null"),
            Self::Object { class } => write!(f, "{class}@"),
            Self::Array { length } => write!(f, "int[{length}]"),
        }
    }
}
