//! This module contains errors for lookups in the program representation.

use thiserror::Error;

use crate::{
    error::container,
    program::types::{ClassId, InstructionId, MethodId},
};

/// Errors raised when the program representation is asked about something it
/// does not contain.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    #[error("No class with id {class} exists")]
    NoSuchClass { class: ClassId },

    #[error("No class named {name:?} exists")]
    NoSuchClassName { name: String },

    #[error("No method with id {method} exists")]
    NoSuchMethod { method: MethodId },

    #[error("No method matching {signature:?} exists")]
    NoSuchSignature { signature: String },

    #[error("No instruction exists at {at}")]
    NoSuchInstruction { at: InstructionId },

    #[error("Method {method} has no code body")]
    NoCode { method: MethodId },

    #[error("Class {class} declares no field named {name:?}")]
    NoSuchField { class: ClassId, name: String },

    #[error("No implementation of {method} is reachable from class {class}")]
    UnresolvedVirtual { class: ClassId, method: MethodId },

    #[error("Jump target {target} is out of bounds in method {method}")]
    InvalidJumpTarget { method: MethodId, target: u32 },
}

/// A program error with an associated location in the program.
pub type LocatedError = container::Located<Error>;

/// A container of program errors.
pub type Errors = container::Errors<LocatedError>;

/// The result type for program lookups.
pub type Result<T> = std::result::Result<T, Error>;

/// Make it possible to attach locations to these errors.
impl container::Locatable for Error {
    type Located = LocatedError;

    fn locate(self, instruction: InstructionId) -> Self::Located {
        container::Located {
            location: instruction,
            payload:  self,
        }
    }
}
