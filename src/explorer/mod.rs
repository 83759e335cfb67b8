//! This module contains the path scheduler, which explores the executions of
//! a method symbolically and collects the states that completed.

pub mod frontier;
pub mod selector;
pub mod traverser;

use std::{
    collections::{BTreeSet, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::{
    constant::{
        DEFAULT_CONCRETISATION_WIDTH,
        DEFAULT_EXPLORATION_BUDGET_MS,
        DEFAULT_MAXIMUM_CALL_DEPTH,
        DEFAULT_MAXIMUM_PATH_LENGTH,
        DEFAULT_MAXIMUM_STATES,
        DEFAULT_VISITS_PER_INSTRUCTION,
        RUNTIME_PACKAGE,
    },
    error::exploration::{Errors, LocatedError},
    explorer::{frontier::Frontier, selector::SelectorKind, traverser::Traverser},
    instrumentation::registry::NdRegistry,
    program::{
        types::{InstructionId, MethodId},
        ProgramRepresentation,
    },
    solver::{bounded::BoundedSolver, DynSolver},
    state::{frame::CallArguments, ExecutionState, StateLabel},
    watchdog::DynWatchdog,
};

/// The symbolic explorer for a single method under analysis.
///
/// Exploration is sequential: states are taken from one frontier in the order
/// given by the configured [`selector::PathSelector`], and the successors of
/// each are computed by the [`Traverser`].
#[derive(Debug)]
pub struct Explorer {
    /// The program being explored.
    program: Arc<dyn ProgramRepresentation>,

    /// The method under analysis.
    entry: MethodId,

    /// The classification of non-deterministic calls.
    registry: NdRegistry,

    /// The configuration of the explorer.
    config: Config,

    /// The solver used to discard infeasible forks, if enabled.
    solver: DynSolver,

    /// A watchdog that gets polled at intervals to check whether the analysis
    /// needs to exit.
    watchdog: DynWatchdog,
}

impl Explorer {
    /// Constructs a new explorer for `entry`.
    #[must_use]
    pub fn new(
        program: Arc<dyn ProgramRepresentation>,
        entry: MethodId,
        registry: NdRegistry,
        config: Config,
        watchdog: DynWatchdog,
    ) -> Self {
        let solver = Arc::new(BoundedSolver::default());
        Self {
            program,
            entry,
            registry,
            config,
            solver,
            watchdog,
        }
    }

    /// Replaces the solver used for feasibility checks at forks.
    #[must_use]
    pub fn with_solver(mut self, solver: DynSolver) -> Self {
        self.solver = solver;
        self
    }

    /// Gets the configuration of the explorer.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Explores the method under analysis until the frontier is empty or a
    /// bound on the whole exploration is reached.
    ///
    /// Reaching a bound is not an error: the states completed up to that point
    /// are returned, and the bound is noted in the statistics.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the entry state cannot be built, or as soon as a
    /// fatal error occurs. Errors that only affect one state kill that state
    /// and are returned as part of the [`ExplorationResult`].
    pub fn explore(self) -> Result<ExplorationResult, Errors> {
        let traverser = Traverser::new(self.program.as_ref(), &self.registry, &self.config);
        let initial = traverser.entry_state(self.entry)?;
        let arguments = initial
            .frame()
            .map(|frame| frame.input_arguments.clone())
            .unwrap_or_default();

        let started = Instant::now();
        let budget = Duration::from_millis(self.config.budget_ms);
        let poll_interval = self.watchdog.poll_every().max(1);

        let mut frontier = Frontier::new(self.config.selector.build());
        let mut seen: HashSet<[u8; 32]> = HashSet::new();
        let mut coverage = BTreeSet::from([initial.stmt()]);
        let mut terminal_states = Vec::new();
        let mut errors = Errors::new();
        let mut stats = ExplorationStats::default();
        frontier.push(initial);

        info!(
            method = %self.entry,
            selector = frontier.selector_name(),
            "Starting exploration"
        );

        let mut counter = 0usize;
        while let Some(state) = frontier.pop() {
            if counter % poll_interval == 0 && self.watchdog.should_stop() {
                stats.stopped_by_watchdog = true;
                break;
            }
            if started.elapsed() >= budget {
                stats.budget_exhausted = true;
                break;
            }
            if stats.explored >= self.config.maximum_states {
                stats.state_limit_reached = true;
                break;
            }
            counter += 1;
            stats.explored += 1;
            trace!(at = %state.stmt(), depth = state.stack().len(), "Expanding state");

            let successors = match traverser.successors(&state) {
                Ok(successors) => successors,
                Err(error) if error.payload.is_fatal() => return Err(fatal(errors, error)),
                Err(error) => {
                    debug!(%error, "Killing state");
                    stats.killed += 1;
                    errors.add_located(error.location, error.payload);
                    continue;
                }
            };

            for child in successors {
                if let Err(error) = child.check_invariants() {
                    return Err(fatal(errors, error));
                }

                let child = if coverage.insert(child.stmt()) {
                    child.marked_visited_new()
                } else {
                    child
                };

                if child.is_terminal() {
                    stats.terminal += 1;
                    terminal_states.push(child);
                    continue;
                }
                if let Some(child) = self.admit(child, &mut seen, &mut stats) {
                    if child.label() == StateLabel::Concrete {
                        terminal_states.push(child);
                    } else {
                        frontier.push(child);
                    }
                }
            }
        }

        info!(
            method = %self.entry,
            explored = stats.explored,
            terminal = stats.terminal,
            killed = stats.killed,
            "Finished exploration"
        );

        Ok(ExplorationResult {
            arguments,
            terminal_states,
            coverage,
            errors,
            stats,
        })
    }

    /// Applies the per-state bounds to `state`, returning it if it should be
    /// explored further.
    ///
    /// States that are too deep in the call stack are kept, but labelled as
    /// states that can only be executed concretely.
    fn admit(
        &self,
        state: ExecutionState,
        seen: &mut HashSet<[u8; 32]>,
        stats: &mut ExplorationStats,
    ) -> Option<ExecutionState> {
        let at = state.stmt();
        if state.path_length() > self.config.maximum_path_length {
            debug!(%at, "Dropping state over the path length bound");
            stats.dropped_path_length += 1;
            return None;
        }
        if state.visit_count(at) >= self.config.visits_per_instruction {
            trace!(%at, "Dropping state over the visit bound");
            stats.dropped_visits += 1;
            return None;
        }
        if !seen.insert(state.decision_digest()) {
            stats.dropped_duplicates += 1;
            return None;
        }
        if self.config.check_feasibility
            && state.analytics().is_fork
            && self.solver.solve(state.symbolic()).is_unsat()
        {
            debug!(%at, "Dropping infeasible state");
            stats.dropped_infeasible += 1;
            return None;
        }
        if state.stack().len() > self.config.maximum_call_depth {
            debug!(%at, "Call depth bound reached, leaving the state to concrete execution");
            stats.concrete += 1;
            return Some(state.with_label(StateLabel::Concrete));
        }
        Some(state)
    }
}

/// Combines the buffered errors with the fatal `error` that ended exploration.
fn fatal(mut errors: Errors, error: LocatedError) -> Errors {
    errors.add_located(error.location, error.payload);
    errors
}

/// The outcome of exploring a method.
#[derive(Clone, Debug)]
pub struct ExplorationResult {
    /// The arguments the method under analysis was entered with, in terms of
    /// the symbols and objects that the terminal states constrain.
    pub arguments: CallArguments,

    /// The states that completed, along with those left to concrete
    /// execution.
    pub terminal_states: Vec<ExecutionState>,

    /// The instructions reached by any explored state.
    pub coverage: BTreeSet<InstructionId>,

    /// The errors that killed individual states.
    pub errors: Errors,

    /// Statistics about the exploration.
    pub stats: ExplorationStats,
}

/// Counters describing how exploration went.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExplorationStats {
    pub explored:            usize,
    pub terminal:            usize,
    pub concrete:            usize,
    pub dropped_path_length: usize,
    pub dropped_visits:      usize,
    pub dropped_duplicates:  usize,
    pub dropped_infeasible:  usize,
    pub killed:              usize,
    pub stopped_by_watchdog: bool,
    pub budget_exhausted:    bool,
    pub state_limit_reached: bool,
}

/// The configuration for the explorer.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The maximum number of edges on a single path.
    ///
    /// Defaults to [`DEFAULT_MAXIMUM_PATH_LENGTH`].
    pub maximum_path_length: usize,

    /// The maximum number of states expanded over the whole exploration.
    ///
    /// Defaults to [`DEFAULT_MAXIMUM_STATES`].
    pub maximum_states: usize,

    /// The number of times a single path may leave any one instruction,
    /// bounding loops and recursion.
    ///
    /// Defaults to [`DEFAULT_VISITS_PER_INSTRUCTION`].
    pub visits_per_instruction: u32,

    /// The call depth beyond which states are no longer explored
    /// symbolically.
    ///
    /// Defaults to [`DEFAULT_MAXIMUM_CALL_DEPTH`].
    pub maximum_call_depth: usize,

    /// The wall-clock budget for the whole exploration, in milliseconds.
    ///
    /// Defaults to [`DEFAULT_EXPLORATION_BUDGET_MS`].
    pub budget_ms: u64,

    /// The strategy used to pick the next state to expand.
    pub selector: SelectorKind,

    /// Whether forked states are checked for satisfiability before being
    /// scheduled.
    pub check_feasibility: bool,

    /// Package prefixes whose classes are trusted library code: their static
    /// fields keep their initial values and their methods are assumed not to
    /// raise runtime exceptions.
    pub trusted_packages: Vec<String>,

    /// The number of concrete values a symbolic array index or length is
    /// forked over, which is also the length of array arguments.
    ///
    /// Defaults to [`DEFAULT_CONCRETISATION_WIDTH`].
    pub concretisation_width: usize,
}

impl Config {
    /// Checks if the class called `class_name` belongs to a trusted package.
    #[must_use]
    pub fn is_trusted(&self, class_name: &str) -> bool {
        self.trusted_packages
            .iter()
            .any(|package| class_name.starts_with(package.as_str()))
    }

    /// Sets the `maximum_path_length` config parameter to `value`.
    #[must_use]
    pub fn with_maximum_path_length(mut self, value: usize) -> Self {
        self.maximum_path_length = value;
        self
    }

    /// Sets the `maximum_states` config parameter to `value`.
    #[must_use]
    pub fn with_maximum_states(mut self, value: usize) -> Self {
        self.maximum_states = value;
        self
    }

    /// Sets the `visits_per_instruction` config parameter to `value`.
    #[must_use]
    pub fn with_visits_per_instruction(mut self, value: u32) -> Self {
        self.visits_per_instruction = value;
        self
    }

    /// Sets the `maximum_call_depth` config parameter to `value`.
    #[must_use]
    pub fn with_maximum_call_depth(mut self, value: usize) -> Self {
        self.maximum_call_depth = value;
        self
    }

    /// Sets the `budget_ms` config parameter to `value`.
    #[must_use]
    pub fn with_budget_ms(mut self, value: u64) -> Self {
        self.budget_ms = value;
        self
    }

    /// Sets the `selector` config parameter to `value`.
    #[must_use]
    pub fn with_selector(mut self, value: SelectorKind) -> Self {
        self.selector = value;
        self
    }

    /// Sets the `check_feasibility` config parameter to `value`.
    #[must_use]
    pub fn with_feasibility_checks(mut self, value: bool) -> Self {
        self.check_feasibility = value;
        self
    }

    /// Sets the `trusted_packages` config parameter to `value`.
    #[must_use]
    pub fn with_trusted_packages(mut self, value: Vec<String>) -> Self {
        self.trusted_packages = value;
        self
    }

    /// Sets the `concretisation_width` config parameter to `value`.
    #[must_use]
    pub fn with_concretisation_width(mut self, value: usize) -> Self {
        self.concretisation_width = value;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            maximum_path_length:    DEFAULT_MAXIMUM_PATH_LENGTH,
            maximum_states:         DEFAULT_MAXIMUM_STATES,
            visits_per_instruction: DEFAULT_VISITS_PER_INSTRUCTION,
            maximum_call_depth:     DEFAULT_MAXIMUM_CALL_DEPTH,
            budget_ms:              DEFAULT_EXPLORATION_BUDGET_MS,
            selector:               SelectorKind::default(),
            check_feasibility:      true,
            trusted_packages:       vec![RUNTIME_PACKAGE.to_string()],
            concretisation_width:   DEFAULT_CONCRETISATION_WIDTH,
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use crate::{
        constant::ARITHMETIC_EXCEPTION_CLASS,
        explorer::{selector::SelectorKind, Config, ExplorationResult, Explorer},
        instrumentation::registry::NdRegistry,
        program::{
            builder::ProgramBuilder,
            instruction::BinaryOp,
            types::{MethodId, Type},
            Program,
            ProgramRepresentation,
        },
        state::{MethodResult, StateLabel},
        watchdog::{FlagWatchdog, LazyWatchdog},
    };

    fn explore(program: Program, method: MethodId, config: Config) -> anyhow::Result<ExplorationResult> {
        let explorer = Explorer::new(
            Arc::new(program),
            method,
            NdRegistry::default(),
            config,
            LazyWatchdog.in_arc(),
        );
        Ok(explorer.explore()?)
    }

    fn reciprocal() -> (Program, MethodId) {
        let mut builder = ProgramBuilder::new();
        let class = builder.class("demo.Maths");
        let method = builder
            .method(class, "reciprocal", &[Type::Int], Type::Int)
            .statik()
            .build(|code| {
                let x = code.parameter(0, Type::Int);
                let result = code.binary(BinaryOp::Div, 1, x, Type::Int);
                code.ret_value(result);
            });
        (builder.finish(), method)
    }

    #[test]
    fn division_forks_on_a_zero_divisor() -> anyhow::Result<()> {
        let (program, method) = reciprocal();
        let arithmetic = program.class_named(ARITHMETIC_EXCEPTION_CLASS).unwrap();
        let result = explore(program, method, Config::default())?;

        assert_eq!(result.terminal_states.len(), 2);
        let failures: Vec<_> = result
            .terminal_states
            .iter()
            .filter_map(|s| match s.method_result() {
                Some(MethodResult::Failure(failure)) => Some(failure.class),
                _ => None,
            })
            .collect();
        assert_eq!(failures, vec![arithmetic]);
        assert!(result.errors.is_empty());

        for state in &result.terminal_states {
            state.check_invariants()?;
            assert_eq!(state.path().len(), state.path_length());
        }

        Ok(())
    }

    #[test]
    fn exceptions_are_dispatched_to_matching_handlers() -> anyhow::Result<()> {
        let mut builder = ProgramBuilder::new();
        let arithmetic = builder.runtime().arithmetic_exception;
        let class = builder.class("demo.Safe");
        let method = builder
            .method(class, "safeDivide", &[Type::Int], Type::Int)
            .statik()
            .build(|code| {
                let start = code.label();
                let end = code.label();
                let catch = code.label();
                let x = code.parameter(0, Type::Int);
                code.bind(start);
                let result = code.binary(BinaryOp::Div, 10, x, Type::Int);
                code.bind(end);
                code.ret_value(result);
                code.bind(catch);
                code.ret_value(-1);
                code.handler(start, end, catch, Some(arithmetic), None);
            });
        let result = explore(builder.finish(), method, Config::default())?;

        assert_eq!(result.terminal_states.len(), 2);
        assert!(result
            .terminal_states
            .iter()
            .all(|s| matches!(s.method_result(), Some(MethodResult::Success(Some(_))))));

        Ok(())
    }

    #[test]
    fn replaying_a_decision_path_reproduces_the_state() -> anyhow::Result<()> {
        let (program, method) = reciprocal();
        let first = explore(program.clone(), method, Config::default())?;
        let second = explore(program, method, Config::default())?;

        let paths = |result: &ExplorationResult| {
            let mut paths: Vec<_> = result
                .terminal_states
                .iter()
                .map(|s| (s.decision_path().clone(), s.path().clone()))
                .collect();
            paths.sort();
            paths
        };
        assert_eq!(paths(&first), paths(&second));

        Ok(())
    }

    #[test]
    fn loops_are_bounded_by_the_visit_ceiling() -> anyhow::Result<()> {
        let mut builder = ProgramBuilder::new();
        let class = builder.class("demo.Loops");
        let method = builder
            .method(class, "spin", &[Type::Int], Type::Int)
            .statik()
            .build(|code| {
                let head = code.label();
                let exit = code.label();
                let n = code.parameter(0, Type::Int);
                let i = code.constant(0, Type::Int);
                code.bind(head);
                let done = code.binary(BinaryOp::Ge, i, n, Type::Bool);
                code.branch_if(done, exit);
                let next = code.binary(BinaryOp::Add, i, 1, Type::Int);
                code.set(i, next);
                code.goto(head);
                code.bind(exit);
                code.ret_value(i);
            });
        let config = Config::default()
            .with_visits_per_instruction(3)
            .with_feasibility_checks(false);
        let result = explore(builder.finish(), method, config)?;

        assert_eq!(result.terminal_states.len(), 3);
        assert!(result.stats.dropped_visits > 0);

        Ok(())
    }

    #[test]
    fn deep_recursion_is_left_to_concrete_execution() -> anyhow::Result<()> {
        let mut builder = ProgramBuilder::new();
        let class = builder.class("demo.Recursion");
        let method = builder
            .method(class, "forever", &[Type::Int], Type::Int)
            .statik()
            .declare();
        builder.define(method, |code| {
            let n = code.parameter(0, Type::Int);
            let result = code.invoke_static(method, &[n.into()]).unwrap_or_default();
            code.ret_value(result);
        });
        let config = Config::default()
            .with_maximum_call_depth(4)
            .with_selector(SelectorKind::DepthFirst);
        let result = explore(builder.finish(), method, config)?;

        assert_eq!(result.terminal_states.len(), 1);
        assert_eq!(result.terminal_states[0].label(), StateLabel::Concrete);
        assert_eq!(result.stats.concrete, 1);

        Ok(())
    }

    #[test]
    fn a_stopping_watchdog_ends_exploration_early() -> anyhow::Result<()> {
        let (program, method) = reciprocal();
        let flag = Arc::new(AtomicBool::new(false));
        flag.store(true, Ordering::SeqCst);
        let explorer = Explorer::new(
            Arc::new(program),
            method,
            NdRegistry::default(),
            Config::default(),
            FlagWatchdog::new(flag).polling_every(1).in_arc(),
        );
        let result = explorer.explore()?;

        assert!(result.stats.stopped_by_watchdog);
        assert!(result.terminal_states.is_empty());

        Ok(())
    }
}
