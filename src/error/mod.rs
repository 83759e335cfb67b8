//! This module contains the primary error type for the generator's interface.
//! It also re-exports the more specific error types that are
//! subsystem-specific.

pub mod container;
pub mod exploration;
pub mod instrumentation;
pub mod program;
pub mod sandbox;

use thiserror::Error;

use crate::program::types::InstructionId;

/// The interface result type for the library.
///
/// # Usage
///
/// Any function considered to be part of the public interface of the library
/// should return this result type. Subsystems should return the more-specific
/// child error types as appropriate.
pub type Result<T> = std::result::Result<T, Errors>;

/// The interface error type for the library.
///
/// All errors returned from the library interface (and hence encountered by the
/// clients of the library) should be members of this enum.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// Errors from looking things up in the program representation.
    #[error(transparent)]
    Program(#[from] program::Error),

    /// Errors from the symbolic exploration subsystem of the library.
    #[error(transparent)]
    Exploration(#[from] exploration::Error),

    /// Errors from the non-determinism instrumentation.
    #[error(transparent)]
    Instrumentation(#[from] instrumentation::Error),

    /// Errors from the concrete execution sandbox.
    #[error(transparent)]
    Sandbox(#[from] sandbox::Error),

    /// An unknown error, represented as a string.
    #[error("Unknown Error: {_0:?}")]
    Other(String),
}

impl Error {
    /// Constructs an unknown error with the provided `message`.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

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

/// A library error with an associated program location.
pub type LocatedError = container::Located<Error>;

/// A container of errors that may occur in the generator.
pub type Errors = container::Errors<LocatedError>;

/// Implements the conversions from a subsystem's located error and error
/// container into the interface error types.
macro_rules! rewrap_located {
    ($($subsystem:ident),* $(,)?) => {
        $(
            /// Allow simple conversions from the subsystem's located errors by
            /// re-wrapping the located error around the more general payload.
            impl From<$subsystem::LocatedError> for LocatedError {
                fn from(value: $subsystem::LocatedError) -> Self {
                    let location = value.location;
                    let payload = Error::from(value.payload);
                    Self { location, payload }
                }
            }

            /// Allow simple conversions from the subsystem's located errors
            /// into the general errors container.
            impl From<$subsystem::LocatedError> for Errors {
                fn from(value: $subsystem::LocatedError) -> Self {
                    let re_wrapped: LocatedError = value.into();
                    re_wrapped.into()
                }
            }

            /// Allow conversion from the subsystem's errors container to the
            /// general errors container.
            impl From<$subsystem::Errors> for Errors {
                fn from(value: $subsystem::Errors) -> Self {
                    let errs: Vec<$subsystem::LocatedError> = value.into();
                    let new_errs: Vec<LocatedError> =
                        errs.into_iter().map(std::convert::Into::into).collect();

                    new_errs.into()
                }
            }
        )*
    };
}

rewrap_located!(program, exploration, instrumentation, sandbox);
