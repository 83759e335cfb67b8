//! This module contains the definition of the generator itself.

pub mod concretise;
pub mod state;

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    constant::DEFAULT_SANDBOX_POOL_SIZE,
    error,
    error::{container::Locatable, exploration},
    explorer,
    explorer::{ExplorationStats, Explorer},
    generator::state::State,
    instrumentation::{registry::NdRegistry, Instrumenter},
    program::{
        types::{InstructionId, MethodId},
        Program,
        ProgramRepresentation,
    },
    reconciler,
    reconciler::{Candidate, DroppedPath, Reconciler, TestCase, Verdict},
    sandbox,
    sandbox::{pool::SandboxPool, protocol::Outcome},
    solver,
    solver::{bounded::BoundedSolver, DynSolver, SolverResult},
    watchdog::{DeadlineWatchdog, DynWatchdog},
};

/// The configuration of every stage of test generation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The classes and static methods whose results are non-deterministic.
    pub registry: NdRegistry,

    pub explorer:   explorer::Config,
    pub solver:     solver::Config,
    pub sandbox:    sandbox::Config,
    pub reconciler: reconciler::Config,

    /// Whether the concrete run of a path that drew non-deterministic values
    /// is handed the values the solver picked for them, so that the run
    /// follows the path.
    ///
    /// Defaults to `true`.
    pub replay_assumptions: bool,

    /// The number of sandbox processes used by [`generate_all`].
    ///
    /// Defaults to [`DEFAULT_SANDBOX_POOL_SIZE`].
    pub pool_size: usize,

    /// The wall-clock budget for generating the tests of a method, counted
    /// from when its generator is created, in milliseconds.
    ///
    /// Candidates that have not been run when it expires are reported as
    /// undetermined. Defaults to no budget.
    pub budget_ms: Option<u64>,
}

impl Config {
    /// Sets the `registry` config parameter to `value`.
    #[must_use]
    pub fn with_registry(mut self, value: NdRegistry) -> Self {
        self.registry = value;
        self
    }

    /// Sets the `explorer` config parameter to `value`.
    #[must_use]
    pub fn with_explorer(mut self, value: explorer::Config) -> Self {
        self.explorer = value;
        self
    }

    /// Sets the `solver` config parameter to `value`.
    #[must_use]
    pub fn with_solver(mut self, value: solver::Config) -> Self {
        self.solver = value;
        self
    }

    /// Sets the `sandbox` config parameter to `value`.
    #[must_use]
    pub fn with_sandbox(mut self, value: sandbox::Config) -> Self {
        self.sandbox = value;
        self
    }

    /// Sets the `reconciler` config parameter to `value`.
    #[must_use]
    pub fn with_reconciler(mut self, value: reconciler::Config) -> Self {
        self.reconciler = value;
        self
    }

    /// Sets the `replay_assumptions` config parameter to `value`.
    #[must_use]
    pub fn with_replay_assumptions(mut self, value: bool) -> Self {
        self.replay_assumptions = value;
        self
    }

    /// Sets the `pool_size` config parameter to `value`.
    #[must_use]
    pub fn with_pool_size(mut self, value: usize) -> Self {
        self.pool_size = value;
        self
    }

    /// Sets the `budget_ms` config parameter to `value`.
    #[must_use]
    pub fn with_budget_ms(mut self, value: Option<u64>) -> Self {
        self.budget_ms = value;
        self
    }

    /// Bounds `watchdog` by the configured budget, if there is one.
    fn bounded(&self, watchdog: DynWatchdog) -> DynWatchdog {
        match self.budget_ms {
            Some(budget) => DeadlineWatchdog::new(Duration::from_millis(budget))
                .wrapping(watchdog)
                .in_arc(),
            None => watchdog,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry:           NdRegistry::default(),
            explorer:           explorer::Config::default(),
            solver:             solver::Config::default(),
            sandbox:            sandbox::Config::default(),
            reconciler:         reconciler::Config::default(),
            replay_assumptions: true,
            pool_size:          DEFAULT_SANDBOX_POOL_SIZE,
            budget_ms:          None,
        }
    }
}

/// Counters describing how test generation for one method went.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct GenerationStats {
    pub exploration: ExplorationStats,

    /// The number of completed paths the solver found inputs for.
    pub candidates: usize,

    /// The number of completed paths the solver proved infeasible.
    pub infeasible: usize,

    pub accepted:     usize,
    pub diverged:     usize,
    pub rejected:     usize,
    pub undetermined: usize,

    /// Whether the watchdog stopped reconciliation before every candidate
    /// was run.
    pub stopped_by_watchdog: bool,
}

/// The result of generating tests for one method.
#[derive(Clone, Debug)]
pub struct GenerationReport {
    /// The signature of the method under test.
    pub method: String,

    /// The accepted test cases, in the order their paths completed.
    pub test_cases: Vec<TestCase>,

    /// Paths whose concrete run contradicted them.
    pub rejected: Vec<DroppedPath>,

    /// Paths that could not be solved or whose concrete run said nothing
    /// about them.
    pub undetermined: Vec<DroppedPath>,

    /// The instructions of the original program covered by the test cases.
    pub coverage: BTreeSet<InstructionId>,

    pub stats: GenerationStats,

    /// The errors that killed individual paths during exploration.
    pub errors: exploration::Errors,
}

/// Creates a new generator for `method` of `program`, with the provided
/// `config`.
#[must_use]
pub fn new(
    program: Program,
    method: MethodId,
    config: Config,
    watchdog: DynWatchdog,
) -> Generator<state::HasProgram> {
    let solver = Arc::new(BoundedSolver::new(config.solver.clone()));
    let watchdog = config.bounded(watchdog);
    let state = state::HasProgram {
        config,
        solver,
        watchdog,
    };
    Generator {
        program: Arc::new(program),
        method,
        state,
    }
}

/// Generates tests for each of `methods` in parallel.
///
/// The program is instrumented once, and the concrete runs of every method go
/// through one pool of [`Config::pool_size`] sandboxes.
///
/// # Errors
///
/// Returns [`Err`] if instrumentation fails, or if generation fails for any
/// of the methods.
pub fn generate_all(
    program: Program,
    methods: &[MethodId],
    config: Config,
    watchdog: DynWatchdog,
) -> error::Result<Vec<GenerationReport>> {
    let program = Arc::new(program);
    let instrumented = Arc::new(Instrumenter::new(config.registry.clone()).instrument(&program)?);
    let solver: DynSolver = Arc::new(BoundedSolver::new(config.solver.clone()));
    let pool = SandboxPool::new(config.sandbox.clone(), instrumented.clone(), config.pool_size);
    info!(methods = methods.len(), pool = config.pool_size, "Generating tests");

    let reports = methods
        .par_iter()
        .map(|&method| -> error::Result<GenerationReport> {
            let generator = Generator {
                program: program.clone(),
                method,
                state: state::Instrumented {
                    instrumented: instrumented.clone(),
                    config:       config.clone(),
                    solver:       solver.clone(),
                    watchdog:     config.bounded(watchdog.clone()),
                },
            };
            Ok(generator.explore()?.solve()?.reconcile(&pool)?.report().clone())
        })
        .collect::<error::Result<Vec<_>>>();
    pool.close();

    reports
}

/// The driver of test generation for one method, the `Generator` takes a
/// program and produces the tests for one of its methods.
///
/// # Enforcing Valid State Transitions
///
/// The generator enforces that only correct state transitions can occur
/// through use of structs that implement the exact state required by it at any
/// given point.
///
/// There is the [`Self::state`] function that provides access to the state data
/// of whichever state the generator is currently in.
#[derive(Debug)]
pub struct Generator<S: State> {
    /// The program containing the method under test.
    program: Arc<Program>,

    /// The method under test.
    method: MethodId,

    /// The internal state of the generator.
    state: S,
}

/// The safe operations available in all states.
impl<S: State> Generator<S> {
    /// Gets a reference to the program being analyzed.
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Gets the method under test.
    pub fn method(&self) -> MethodId {
        self.method
    }

    /// Gets an immutable reference to the current state of the generator.
    pub fn state(&self) -> &S {
        &self.state
    }
}

/// Unsafe operations available in all states.
///
/// These operations are capable of **violating the state invariants** of the
/// generator, and must be used with the _utmost_ care.
impl<S: State> Generator<S> {
    /// Forces the generator into `new_state`, disregarding any safety with
    /// regards to state transitions.
    ///
    /// # Safety
    ///
    /// Do not force a state transition for the generator unless you totally
    /// understand the state that the generator is in, and the implications
    /// of doing so.
    pub unsafe fn set_state<NS: State>(self, new_state: NS) -> Generator<NS> {
        Generator {
            program: self.program,
            method:  self.method,
            state:   new_state,
        }
    }

    /// Forces the generator into the state `NS`, with the value of the state
    /// created by applying `transform` to the generator's current state and
    /// disregarding any safety with regard to state transitions.
    ///
    /// # Safety
    ///
    /// Do not force a state transition for the generator unless you totally
    /// understand the state that the generator is in, and the implications
    /// of doing so.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the provided `transform` returns [`Err`].
    pub unsafe fn transform_state<NS: State>(
        self,
        transform: impl FnOnce(S) -> error::Result<NS>,
    ) -> error::Result<Generator<NS>> {
        let state = transform(self.state)?;
        Ok(Generator {
            program: self.program,
            method: self.method,
            state,
        })
    }
}

/// A type that allows the user to easily name the initial state of the
/// generator.
pub type InitialGenerator = Generator<state::HasProgram>;

/// Operations available on a newly-created generator.
impl Generator<state::HasProgram> {
    /// Runs test generation from beginning to end, performing all the
    /// intermediate steps automatically with a sandbox of its own.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if any step in the process fails.
    pub fn generate(self) -> error::Result<GenerationReport> {
        let generator = self.instrument()?;
        let pool = SandboxPool::new(
            generator.state.config.sandbox.clone(),
            generator.state.instrumented.clone(),
            1,
        );
        let generator = generator.explore()?.solve()?.reconcile(&pool)?;
        pool.close();

        Ok(generator.report().clone())
    }

    /// Replaces the solver used to check forks and to solve completed paths.
    #[must_use]
    pub fn with_solver(mut self, solver: DynSolver) -> Self {
        self.state.solver = solver;
        self
    }

    /// Rewrites the program so that the non-deterministic calls it makes are
    /// recorded when it runs in the sandbox.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the program cannot be instrumented.
    pub fn instrument(self) -> error::Result<Generator<state::Instrumented>> {
        let instrumenter = Instrumenter::new(self.state.config.registry.clone());
        let instrumented = Arc::new(instrumenter.instrument(&self.program)?);
        unsafe {
            self.transform_state(|old_state| {
                Ok(state::Instrumented {
                    instrumented,
                    config: old_state.config,
                    solver: old_state.solver,
                    watchdog: old_state.watchdog,
                })
            })
        }
    }
}

/// Operations available on a generator that has an instrumented program.
impl Generator<state::Instrumented> {
    /// Explores the method under test symbolically.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if exploration hits a fatal error.
    pub fn explore(self) -> error::Result<Generator<state::Explored>> {
        let program: Arc<dyn ProgramRepresentation> = self.program.clone();
        let method = self.method;
        unsafe {
            self.transform_state(|old_state| {
                let exploration = Explorer::new(
                    program,
                    method,
                    old_state.config.registry.clone(),
                    old_state.config.explorer.clone(),
                    old_state.watchdog.clone(),
                )
                .with_solver(old_state.solver.clone())
                .explore()?;
                info!(
                    %method,
                    terminal = exploration.terminal_states.len(),
                    killed = exploration.stats.killed,
                    "Exploration complete"
                );
                Ok(state::Explored {
                    instrumented: old_state.instrumented,
                    exploration,
                    config: old_state.config,
                    solver: old_state.solver,
                    watchdog: old_state.watchdog,
                })
            })
        }
    }
}

/// Operations available on a generator that has explored the method.
impl Generator<state::Explored> {
    /// Solves the constraints of every completed path into the concrete
    /// invocation that follows it.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if a path refers to something that is not in the
    /// program.
    pub fn solve(self) -> error::Result<Generator<state::Solved>> {
        let entry = InstructionId::entry(self.method);
        let signature = self.program.signature(self.method).locate(entry)?;
        let program = self.program.clone();
        unsafe {
            self.transform_state(|old_state| {
                let config = old_state.config;
                let exploration = old_state.exploration;
                let timeout_ms = config.sandbox.default_timeout_ms;

                let mut candidates = Vec::new();
                let mut unsolved = Vec::new();
                let mut infeasible = 0;
                for path in &exploration.terminal_states {
                    match old_state.solver.solve(path.symbolic()) {
                        SolverResult::Sat(assignment) => candidates.push(
                            concretise::candidate(
                                &program,
                                &signature,
                                &exploration.arguments,
                                path,
                                &assignment,
                                timeout_ms,
                                config.replay_assumptions,
                            )
                            .locate(entry)?,
                        ),
                        SolverResult::Unsat => {
                            debug!(fingerprint = %path.fingerprint(), "Dropped infeasible path");
                            infeasible += 1;
                        }
                        SolverResult::Unknown { reason } => {
                            debug!(fingerprint = %path.fingerprint(), %reason, "Could not solve path");
                            unsolved.push(DroppedPath {
                                method: signature.clone(),
                                fingerprint: path.fingerprint(),
                                reason,
                                divergences: vec![],
                            });
                        }
                    }
                }
                info!(
                    method = %signature,
                    candidates = candidates.len(),
                    infeasible,
                    unsolved = unsolved.len(),
                    "Solved paths"
                );

                Ok(state::Solved {
                    instrumented: old_state.instrumented,
                    candidates,
                    unsolved,
                    infeasible,
                    exploration,
                    config,
                    watchdog: old_state.watchdog,
                })
            })
        }
    }
}

/// Operations available on a generator that has inputs for its paths.
impl Generator<state::Solved> {
    /// Replaces the watchdog that is polled between concrete runs.
    #[must_use]
    pub fn with_watchdog(mut self, watchdog: DynWatchdog) -> Self {
        self.state.watchdog = watchdog;
        self
    }

    /// Runs every candidate in a sandbox taken from `pool` and reconciles its
    /// outcome with the path it came from.
    ///
    /// Failures of a single run make its path undetermined rather than
    /// stopping generation. The watchdog is polled before each run, and once
    /// it asks to stop, the remaining candidates are undetermined without
    /// being run.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if no sandbox can be obtained from `pool`.
    pub fn reconcile(self, pool: &SandboxPool) -> error::Result<Generator<state::Reconciled>> {
        let entry = InstructionId::entry(self.method);
        let method = self.program.signature(self.method).locate(entry)?;
        unsafe {
            self.transform_state(|old_state| {
                let reconciler = Reconciler::new(old_state.config.reconciler.clone());
                let mut stats = GenerationStats {
                    exploration: old_state.exploration.stats.clone(),
                    candidates: old_state.candidates.len(),
                    infeasible: old_state.infeasible,
                    ..GenerationStats::default()
                };
                let mut test_cases = Vec::new();
                let mut rejected = Vec::new();
                let mut undetermined = old_state.unsolved;

                for candidate in &old_state.candidates {
                    if stats.stopped_by_watchdog || old_state.watchdog.should_stop() {
                        stats.stopped_by_watchdog = true;
                        undetermined.push(DroppedPath {
                            method:      candidate.method.clone(),
                            fingerprint: candidate.fingerprint.clone(),
                            reason:      "stopped by the watchdog before running".into(),
                            divergences: vec![],
                        });
                        continue;
                    }
                    let mut sandbox = pool.acquire().locate(entry)?;
                    let verdict = run(&reconciler, &mut sandbox, candidate);
                    match verdict {
                        Verdict::Accepted(test_case) => test_cases.push(test_case),
                        Verdict::Rejected(path) => rejected.push(path),
                        Verdict::Undetermined(path) => undetermined.push(path),
                    }
                }

                let coverage = test_cases
                    .iter()
                    .flat_map(|t: &TestCase| t.coverage.iter().copied())
                    .collect();
                stats.accepted = test_cases.len();
                stats.diverged = test_cases.iter().filter(|t| t.diverged).count();
                stats.rejected = rejected.len();
                stats.undetermined = undetermined.len();
                if stats.stopped_by_watchdog {
                    warn!(%method, "Watchdog stopped reconciliation early");
                }
                info!(
                    %method,
                    accepted = stats.accepted,
                    diverged = stats.diverged,
                    rejected = stats.rejected,
                    undetermined = stats.undetermined,
                    "Generated tests"
                );

                Ok(state::Reconciled {
                    report: GenerationReport {
                        method,
                        test_cases,
                        rejected,
                        undetermined,
                        coverage,
                        stats,
                        errors: old_state.exploration.errors,
                    },
                })
            })
        }
    }
}

/// Operations available on a generator that has finished.
impl Generator<state::Reconciled> {
    /// Gets the result of test generation.
    pub fn report(&self) -> &GenerationReport {
        &self.state.report
    }
}

/// Runs `candidate` in `sandbox`, confirming an accepted test case with a
/// replay run if the reconciler is configured to.
fn run(reconciler: &Reconciler, sandbox: &mut sandbox::Sandbox, candidate: &Candidate) -> Verdict {
    let undetermined = |reason: String| {
        Verdict::Undetermined(DroppedPath {
            method: candidate.method.clone(),
            fingerprint: candidate.fingerprint.clone(),
            reason,
            divergences: vec![],
        })
    };

    let expected = |outcome: &Outcome| candidate.prediction.agrees_with(outcome);
    let response = match sandbox.invoke_with_retry_unless(candidate.invocation.clone(), expected) {
        Ok(response) => response,
        Err(e) => {
            warn!(
                sandbox = %sandbox.id(),
                fingerprint = %candidate.fingerprint,
                error = %e,
                "Concrete run failed"
            );
            return undetermined(e.to_string());
        }
    };
    let verdict = reconciler.reconcile(candidate, &response);

    match verdict {
        Verdict::Accepted(test_case) if reconciler.config().confirm_with_replay => {
            let replay = test_case.replay_invocation(candidate.invocation.timeout_ms);
            match sandbox.invoke_with_retry_unless(replay, expected) {
                Ok(response) => reconciler.confirm(test_case, &response),
                Err(e) => {
                    warn!(
                        sandbox = %sandbox.id(),
                        fingerprint = %candidate.fingerprint,
                        error = %e,
                        "Replay run failed"
                    );
                    undetermined(e.to_string())
                }
            }
        }
        verdict => verdict,
    }
}
