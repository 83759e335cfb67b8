//! This module contains errors raised while rewriting the program to intercept
//! non-deterministic operations.

use thiserror::Error;

use crate::{
    error::{container, program},
    program::types::{ClassId, InstructionId, MethodId},
};

/// Errors that occur in the [`crate::instrumentation::Instrumenter`].
///
/// All of these are fatal, as an incompletely instrumented program cannot be
/// reconciled against its symbolic exploration.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    #[error("The owner class {class} of method {method} cannot be resolved")]
    UnresolvedOwner { method: MethodId, class: ClassId },

    #[error("The call target {method} cannot be resolved")]
    UnresolvedTarget { method: MethodId },

    #[error("The superclass {class} cannot be resolved while classifying non-determinism")]
    UnresolvedSuperclass { class: ClassId },

    #[error("The rewritten body has {instructions} instructions but {origins} origin entries")]
    InconsistentOrigins { instructions: usize, origins: usize },

    #[error(transparent)]
    Program(#[from] program::Error),
}

/// An instrumentation error with an associated location in the program.
pub type LocatedError = container::Located<Error>;

/// A container of instrumentation errors.
pub type Errors = container::Errors<LocatedError>;

/// The result type for methods that may have instrumentation errors.
pub type Result<T> = std::result::Result<T, LocatedError>;

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

/// Allow located program errors to be re-wrapped as instrumentation errors.
impl From<program::LocatedError> for LocatedError {
    fn from(value: program::LocatedError) -> Self {
        let location = value.location;
        let payload = Error::from(value.payload);
        Self { location, payload }
    }
}
