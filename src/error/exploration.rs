//! This module contains errors pertaining to the symbolic exploration of the
//! method under analysis.

use thiserror::Error;

use crate::{
    error::{container, program},
    program::types::{InstructionId, LocalId},
};

/// Errors that occur while exploring the method with the
/// [`crate::explorer::Explorer`].
///
/// Errors that violate the internal invariants of the execution state are
/// fatal and abort exploration of the method. All other errors describe a
/// malformed program: they kill the offending state and are buffered.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    #[error("Execution state has an empty call stack")]
    EmptyStack,

    #[error("Path bookkeeping is inconsistent: {path} path entries, {decisions} decisions, {edges} edges and length {length}")]
    InconsistentPath {
        path:      usize,
        decisions: usize,
        edges:     usize,
        length:    usize,
    },

    #[error("Tried to transition a terminal state")]
    TransitionFromTerminal,

    #[error("No pending exception to dispatch at {at}")]
    NoPendingException { at: InstructionId },

    #[error("Local {local} is read before it is assigned")]
    UnassignedLocal { local: LocalId },

    #[error("Parameter {index} is not available in the current frame")]
    NoSuchParameter { index: u32 },

    #[error("Expected a {expected} value but found {found}")]
    UnexpectedValue {
        expected: &'static str,
        found:    String,
    },

    #[error("The method under analysis cannot be entered: {reason}")]
    InvalidEntry { reason: String },

    #[error(transparent)]
    Program(#[from] program::Error),
}

impl Error {
    /// Checks if the error violates an invariant of the execution state, and
    /// hence must abort exploration.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::EmptyStack
                | Self::InconsistentPath { .. }
                | Self::TransitionFromTerminal
                | Self::NoPendingException { .. }
        )
    }
}

/// An exploration error with an associated location in the program.
pub type LocatedError = container::Located<Error>;

/// A container of exploration errors used for aggregation of errors during
/// exploration.
pub type Errors = container::Errors<LocatedError>;

/// The result type for methods that may have exploration errors.
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

/// Allow located program errors to be re-wrapped as exploration errors.
impl From<program::LocatedError> for LocatedError {
    fn from(value: program::LocatedError) -> Self {
        let location = value.location;
        let payload = Error::from(value.payload);
        Self { location, payload }
    }
}
