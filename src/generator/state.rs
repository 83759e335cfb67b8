//! This module contains the state tracking functionality for the generator.

use std::{fmt::Debug, sync::Arc};

use crate::{
    explorer::ExplorationResult,
    generator::{Config, GenerationReport},
    program::Program,
    reconciler::{Candidate, DroppedPath},
    solver::DynSolver,
    watchdog::DynWatchdog,
};

/// A marker trait that says that the type implementing it is a generator
/// state.
///
/// Generator states can be transitioned between as part of the
/// [`crate::generator::Generator`] state machine, and are intended to enforce
/// that correct state transitions take place.
pub trait State
where
    Self: Debug + Sized,
{
}

/// The initial state for the generator.
#[derive(Debug)]
pub struct HasProgram {
    /// The generator configuration.
    pub config: Config,

    /// The solver that turns path constraints into inputs.
    pub solver: DynSolver,

    /// The watchdog that is monitoring the progress of the generator.
    pub watchdog: DynWatchdog,
}
impl State for HasProgram {}

/// The generator has rewritten the program so that its non-deterministic
/// calls are recorded when it runs in the sandbox.
#[derive(Debug)]
pub struct Instrumented {
    /// The program that runs in the sandbox.
    pub instrumented: Arc<Program>,

    pub config:   Config,
    pub solver:   DynSolver,
    pub watchdog: DynWatchdog,
}
impl State for Instrumented {}

/// The generator has explored the method under test symbolically.
#[derive(Debug)]
pub struct Explored {
    pub instrumented: Arc<Program>,

    /// The completed paths and everything learned while finding them.
    pub exploration: ExplorationResult,

    pub config:   Config,
    pub solver:   DynSolver,
    pub watchdog: DynWatchdog,
}
impl State for Explored {}

/// The generator has solved the completed paths into concrete invocations.
#[derive(Debug)]
pub struct Solved {
    pub instrumented: Arc<Program>,

    /// The paths with inputs, ready to be run concretely.
    pub candidates: Vec<Candidate>,

    /// The paths the solver could not decide.
    pub unsolved: Vec<DroppedPath>,

    /// The number of completed paths the solver proved infeasible.
    pub infeasible: usize,

    pub exploration: ExplorationResult,
    pub config:      Config,
    pub watchdog:    DynWatchdog,
}
impl State for Solved {}

/// The generator has run every candidate in the sandbox and reconciled the
/// outcomes.
#[derive(Debug)]
pub struct Reconciled {
    /// The result of test generation.
    pub report: GenerationReport,
}
impl State for Reconciled {}
