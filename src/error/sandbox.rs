//! This module contains errors pertaining to the concrete execution sandbox.
//!
//! Note that timeouts and crashes of the sandboxed process are _outcomes_ of a
//! concrete invocation and not errors. The errors here describe failures of
//! the sandbox machinery itself.

use thiserror::Error;

use crate::{error::container, program::types::InstructionId};

/// Errors that occur when driving the [`crate::sandbox::Sandbox`].
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    #[error("Could not spawn sandbox executable {executable:?}: {reason}")]
    Spawn { executable: String, reason: String },

    #[error("I/O error talking to the sandbox: {reason}")]
    Io { reason: String },

    #[error("Malformed protocol message: {reason}")]
    Protocol { reason: String },

    #[error("Sandbox did not acknowledge the program within {timeout_ms}ms")]
    StartupTimeout { timeout_ms: u64 },

    #[error("Sandbox rejected the request: {message}")]
    Rejected { message: String },

    #[error("Response id {received} does not match request id {expected}")]
    MismatchedResponse { expected: u64, received: u64 },

    #[error("Sandbox pool is closed")]
    PoolClosed,

    #[error("No program has been loaded into the sandbox")]
    NotLoaded,

    #[error("Concrete execution failed at {at}: {reason}")]
    Fault { at: InstructionId, reason: String },
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io {
            reason: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Protocol {
            reason: value.to_string(),
        }
    }
}

/// A sandbox error with an associated location in the program.
pub type LocatedError = container::Located<Error>;

/// A container of sandbox errors.
pub type Errors = container::Errors<LocatedError>;

/// The result type for sandbox operations.
pub type Result<T> = std::result::Result<T, Error>;
