//! This module contains the messages exchanged between the generator and the
//! sandbox process.
//!
//! Every message is a single line of JSON. Requests are written to the
//! sandbox's standard input and responses are read from its standard output,
//! leaving standard error free for the sandbox's logs.

use std::{
    collections::BTreeSet,
    fmt::{Display, Formatter},
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::{
    instrumentation::storage::NdReplayLog,
    program::{
        types::{ConcreteValue, InstructionId},
        Program,
    },
    sandbox::interpreter,
};

/// A request from the generator to the sandbox.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// Loads the (instrumented) program that all later invocations run.
    Load {
        program: Arc<Program>,
        config:  interpreter::Config,
    },

    /// Prepares the loaded program for invocations without running any of
    /// its code.
    Warmup,

    /// Runs one method once.
    Invoke(InvocationRequest),

    /// Asks the sandbox to exit.
    Shutdown,
}

/// A response from the sandbox to the generator.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Loaded,
    WarmedUp,
    Invoked(InvocationResponse),

    /// The request could not be served, for example because it names a
    /// method that does not exist.
    Rejected { message: String },
}

/// One concrete invocation of a method.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    /// The signature of the method to run, as produced by
    /// [`crate::program::ProgramRepresentation::signature`].
    pub method: String,

    /// The receiver, for instance methods.
    pub receiver: Option<ConcreteValue>,

    /// The arguments, in declaration order.
    pub arguments: Vec<ConcreteValue>,

    /// Values assigned to static fields before the method runs.
    pub statics: Vec<StaticAssignment>,

    /// The wall-clock budget of the invocation.
    pub timeout_ms: u64,

    /// Values to return from non-deterministic calls instead of drawing fresh
    /// ones.
    pub replay: Option<NdReplayLog>,
}

/// An initial value for the static field `field` of the class called `class`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StaticAssignment {
    pub class: String,
    pub field: String,
    pub value: ConcreteValue,
}

/// An [`Invocation`] as sent over the wire.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub id: u64,

    #[serde(flatten)]
    pub invocation: Invocation,
}

/// The observations made while running an [`Invocation`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InvocationResponse {
    pub id:       u64,
    pub outcome:  Outcome,
    /// The instructions executed, in the coordinates of the program before
    /// instrumentation.
    pub coverage: BTreeSet<InstructionId>,
    pub nd_log:   NdReplayLog,
}

impl InvocationResponse {
    /// Constructs a response for an invocation that produced no observations.
    #[must_use]
    pub fn without_observations(id: u64, outcome: Outcome) -> Self {
        Self {
            id,
            outcome,
            coverage: BTreeSet::new(),
            nd_log: NdReplayLog::default(),
        }
    }
}

/// How a concrete invocation ended.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Outcome {
    /// The method returned `value`.
    Success { value: ConcreteValue },

    /// The method's code raised an exception of `class` with a throw.
    ExplicitlyThrown { class: String },

    /// The runtime raised an exception of `class`, for example on a null
    /// dereference.
    ImplicitlyThrown { class: String },

    /// The invocation did not finish within its budget.
    Timeout,

    /// The sandbox process died during the invocation.
    SandboxCrashed { exit_code: Option<i32> },
}

impl Outcome {
    /// Checks if the outcome says nothing about the method's behaviour.
    #[must_use]
    pub fn is_undetermined(&self) -> bool {
        matches!(self, Self::Timeout | Self::SandboxCrashed { .. })
    }
}

impl Display for Outcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success { value } => write!(f, "returned {value}"),
            Self::ExplicitlyThrown { class } => write!(f, "threw {class}"),
            Self::ImplicitlyThrown { class } => write!(f, "raised {class}"),
            Self::Timeout => write!(f, "timed out"),
            Self::SandboxCrashed {
                exit_code: Some(code),
            } => write!(f, "crashed with exit code {code}"),
            Self::SandboxCrashed { exit_code: None } => write!(f, "crashed"),
        }
    }
}
