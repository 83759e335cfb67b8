//! This module contains the immutable, forkable [`ExecutionState`] and the
//! transitions that derive new states from existing ones.
//!
//! # Transitions
//!
//! Every transition ([`ExecutionState::push`], [`ExecutionState::update`],
//! [`ExecutionState::pop`] and [`ExecutionState::create_exception_state`])
//! takes the state by reference and returns a fresh one. The persistent
//! collections underneath share structure, so forking a state is cheap and
//! never affects the state it was forked from.
//!
//! Each transition appends exactly one entry to the path, the decision path
//! and the edge list, and increments the path length, so the four always
//! agree.

pub mod analytics;
pub mod edge;
pub mod frame;

use std::fmt::Write;

use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

use crate::{
    error::{
        container::Locatable,
        exploration::{Error, Result},
    },
    program::types::{ClassId, InstructionId, MethodId},
    state::{
        analytics::StateAnalytics,
        edge::{Decision, Edge},
        frame::{CallArguments, StackFrame},
    },
    symbolic::{
        memory::{Reference, SymbolicValue},
        update::SymbolicStateUpdate,
        SymbolicState,
    },
};

/// An exception raised on a path, which is data and not an error of the
/// generator.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SymbolicFailure {
    /// The class of the exception object.
    pub class:     ClassId,
    /// The exception object.
    pub object:    Reference,
    /// Whether the program threw it with a `throw`, as opposed to the runtime
    /// raising it.
    pub explicit:  bool,
    /// Where the exception was raised.
    pub raised_at: InstructionId,
}

/// How a method invocation ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MethodResult {
    /// The method returned, with a value unless it is `void`.
    Success(Option<SymbolicValue>),

    /// The method exited by an exception.
    Failure(SymbolicFailure),

    /// The method terminated the whole process with the status code.
    Exit(SymbolicValue),
}

/// The coarse lifecycle label of a state.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum StateLabel {
    /// The state still has instructions to explore.
    Intermediate,

    /// The root frame has been popped.
    Terminal,

    /// The state cannot be explored further symbolically but may still be
    /// executed concretely.
    Concrete,
}

/// The position of a state in its lifecycle.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum StateStatus {
    Running,
    PendingException,
    Terminal,
}

/// A step of the path annotated with the call depth it was taken at.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub instruction: InstructionId,
    pub depth:       usize,
    pub decision:    i32,
}

/// A snapshot of one symbolic path through the program.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecutionState {
    stmt:          InstructionId,
    stack:         im::Vector<StackFrame>,
    symbolic:      SymbolicState,
    path:          im::Vector<InstructionId>,
    decision_path: im::Vector<i32>,
    edges:         im::Vector<Edge>,
    depths:        im::Vector<usize>,
    visits:        im::HashMap<InstructionId, u32>,
    first_visits:  im::HashMap<InstructionId, usize>,
    path_length:   usize,
    last_edge:     Option<Edge>,
    last_method:   Option<MethodId>,
    method_result: Option<MethodResult>,
    exception:     Option<SymbolicFailure>,
    label:         StateLabel,
    analytics:     StateAnalytics,
}

impl ExecutionState {
    /// Creates the state at the entry of `method`, called with `arguments`
    /// and starting from `symbolic`.
    #[must_use]
    pub fn initial(method: MethodId, arguments: CallArguments, symbolic: SymbolicState) -> Self {
        let frame = StackFrame::new(None, Default::default(), arguments, method);
        Self {
            stmt: InstructionId::entry(method),
            stack: im::vector![frame],
            symbolic,
            path: im::Vector::new(),
            decision_path: im::Vector::new(),
            edges: im::Vector::new(),
            depths: im::Vector::new(),
            visits: im::HashMap::new(),
            first_visits: im::HashMap::new(),
            path_length: 0,
            last_edge: None,
            last_method: Some(method),
            method_result: None,
            exception: None,
            label: StateLabel::Intermediate,
            analytics: StateAnalytics::root(),
        }
    }

    /// Gets the top frame, failing if the stack is empty.
    fn top(&self) -> Result<&StackFrame> {
        self.stack.back().ok_or(Error::EmptyStack.locate(self.stmt))
    }

    /// Appends `edge` to the path bookkeeping, counting a visit of its
    /// source.
    fn record(&mut self, edge: Edge) {
        let source = edge.source;
        self.path.push_back(source);
        self.decision_path.push_back(edge.decision);
        self.edges.push_back(edge);
        self.depths.push_back(self.stack.len());
        let count = self.visits.get(&source).copied().unwrap_or(0);
        self.visits.insert(source, count + 1);
        if !self.first_visits.contains_key(&source) {
            self.first_visits.insert(source, self.path_length);
        }
        self.path_length += 1;
        self.last_edge = Some(edge);
        self.analytics = self.analytics.successor();
    }

    /// Enters the callee at `target` with `input_arguments`.
    ///
    /// The callee's locals are scoped fresh from the caller's and then
    /// updated with `update`. The callee inherits the caller's
    /// `does_not_throw` mark. The symbolic state is scoped for the nested
    /// method before `update` is merged into it.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the stack is empty.
    pub fn push(
        &self,
        target: InstructionId,
        input_arguments: CallArguments,
        update: &SymbolicStateUpdate,
        method: MethodId,
    ) -> Result<Self> {
        let caller = self.top()?;
        let locals = caller.locals.for_nested_method().update(&update.locals);
        let mut frame = StackFrame::new(Some(self.stmt), locals, input_arguments, method);
        frame.does_not_throw = caller.does_not_throw;

        let mut state = self.clone();
        state.stack.push_back(frame);
        state.symbolic = self.symbolic.for_nested_method().apply(update);
        state.record(Edge::new(self.stmt, target, Decision::Call));
        state.stmt = target;
        state.last_method = Some(method);
        state.method_result = None;
        state.exception = None;
        Ok(state)
    }

    /// Takes `edge` within the current method, merging `update` into the top
    /// frame and the symbolic state.
    ///
    /// `does_not_throw` is sticky: once a frame is marked, it stays marked.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the stack is empty.
    pub fn update(
        &self,
        edge: Edge,
        update: &SymbolicStateUpdate,
        does_not_throw: bool,
    ) -> Result<Self> {
        let top = self.top()?;
        let mut frame = top.clone();
        frame.locals = top.locals.update(&update.locals);
        frame.does_not_throw = top.does_not_throw || does_not_throw;

        let mut state = self.clone();
        state.stack.set(state.stack.len() - 1, frame);
        state.symbolic = self.symbolic.apply(update);
        state.record(edge);
        state.stmt = edge.destination;
        state.method_result = None;
        state.exception = None;
        Ok(state)
    }

    /// Leaves the current method with `result`, resuming at the call
    /// instruction of the caller.
    ///
    /// Popping the root frame produces a terminal state carrying the result.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the stack is empty.
    pub fn pop(&self, result: MethodResult) -> Result<Self> {
        let popped = self.top()?;
        let mut state = self.clone();
        state.stack.pop_back();

        match popped.caller {
            Some(caller) => {
                state.record(Edge::new(self.stmt, caller, Decision::Return));
                state.stmt = caller;
                state.last_method = state.stack.back().map(|f| f.method);
                state.label = StateLabel::Intermediate;
            }
            None => {
                state.record(Edge::new(self.stmt, self.stmt, Decision::Return));
                state.label = StateLabel::Terminal;
            }
        }
        state.method_result = Some(result);
        state.exception = None;
        Ok(state)
    }

    /// Raises `exception` at the current instruction without leaving the
    /// method, merging `update`.
    ///
    /// The decision code is derived from the exception class, so equal states
    /// raising equal exceptions always record equal decisions.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the stack is empty.
    pub fn create_exception_state(
        &self,
        exception: SymbolicFailure,
        update: &SymbolicStateUpdate,
    ) -> Result<Self> {
        let top = self.top()?;
        let mut frame = top.clone();
        frame.locals = top.locals.update(&update.locals);

        let mut state = self.clone();
        state.stack.set(state.stack.len() - 1, frame);
        state.symbolic = self.symbolic.apply(update);
        let decision = Decision::Exception(exception.class.0);
        state.record(Edge::new(self.stmt, self.stmt, decision));
        state.method_result = None;
        state.exception = Some(exception);
        Ok(state)
    }

    /// Produces a copy of the state with `label`.
    #[must_use]
    pub fn with_label(&self, label: StateLabel) -> Self {
        let mut state = self.clone();
        state.label = label;
        state
    }

    /// Produces a copy of the state marked as one of several successors.
    #[must_use]
    pub fn marked_fork(&self) -> Self {
        let mut state = self.clone();
        state.analytics = state.analytics.marked_fork();
        state
    }

    /// Produces a copy of the state marked as having covered a new
    /// instruction.
    #[must_use]
    pub fn marked_visited_new(&self) -> Self {
        let mut state = self.clone();
        state.analytics = state.analytics.marked_visited_new();
        state
    }

    /// Checks the path bookkeeping and stack invariants of the state.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the invariants do not hold.
    pub fn check_invariants(&self) -> Result<()> {
        let lengths = [self.path.len(), self.decision_path.len(), self.edges.len()];
        if lengths.iter().any(|len| *len != self.path_length) {
            return Err(Error::InconsistentPath {
                path:      self.path.len(),
                decisions: self.decision_path.len(),
                edges:     self.edges.len(),
                length:    self.path_length,
            }
            .locate(self.stmt));
        }
        if self.stack.is_empty() && self.label != StateLabel::Terminal {
            return Err(Error::EmptyStack.locate(self.stmt));
        }
        Ok(())
    }

    /// Gets where the state is in its lifecycle.
    #[must_use]
    pub fn status(&self) -> StateStatus {
        if self.label == StateLabel::Terminal {
            StateStatus::Terminal
        } else if self.exception.is_some() {
            StateStatus::PendingException
        } else {
            StateStatus::Running
        }
    }

    /// Checks if the root frame has been popped.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.label == StateLabel::Terminal
    }

    /// Gets the current instruction.
    #[must_use]
    pub fn stmt(&self) -> InstructionId {
        self.stmt
    }

    /// Gets the call stack, innermost frame last.
    #[must_use]
    pub fn stack(&self) -> &im::Vector<StackFrame> {
        &self.stack
    }

    /// Gets the innermost frame.
    #[must_use]
    pub fn frame(&self) -> Option<&StackFrame> {
        self.stack.back()
    }

    /// Gets the symbolic state.
    #[must_use]
    pub fn symbolic(&self) -> &SymbolicState {
        &self.symbolic
    }

    /// Gets the source instructions of the path's edges, in order.
    #[must_use]
    pub fn path(&self) -> &im::Vector<InstructionId> {
        &self.path
    }

    /// Gets the decision codes of the path's edges, in order.
    #[must_use]
    pub fn decision_path(&self) -> &im::Vector<i32> {
        &self.decision_path
    }

    /// Gets the edges of the path, in order.
    #[must_use]
    pub fn edges(&self) -> &im::Vector<Edge> {
        &self.edges
    }

    /// Gets the number of transitions on the path.
    #[must_use]
    pub fn path_length(&self) -> usize {
        self.path_length
    }

    /// Gets how many times the path left `instruction`.
    #[must_use]
    pub fn visit_count(&self, instruction: InstructionId) -> u32 {
        self.visits.get(&instruction).copied().unwrap_or(0)
    }

    /// Gets the position in the path at which `instruction` was first left.
    #[must_use]
    pub fn first_visit(&self, instruction: InstructionId) -> Option<usize> {
        self.first_visits.get(&instruction).copied()
    }

    /// Gets the last edge taken.
    #[must_use]
    pub fn last_edge(&self) -> Option<Edge> {
        self.last_edge
    }

    /// Gets the method most recently entered or returned to.
    #[must_use]
    pub fn last_method(&self) -> Option<MethodId> {
        self.last_method
    }

    /// Gets the result of the most recently popped frame, if the state was
    /// produced by a pop.
    #[must_use]
    pub fn method_result(&self) -> Option<&MethodResult> {
        self.method_result.as_ref()
    }

    /// Gets the pending exception.
    #[must_use]
    pub fn exception(&self) -> Option<&SymbolicFailure> {
        self.exception.as_ref()
    }

    /// Gets the lifecycle label.
    #[must_use]
    pub fn label(&self) -> StateLabel {
        self.label
    }

    /// Gets the statistics used for ranking the state.
    #[must_use]
    pub fn analytics(&self) -> &StateAnalytics {
        &self.analytics
    }

    /// Gets the path with the call depth of each step.
    #[must_use]
    pub fn full_path(&self) -> Vec<Step> {
        self.edges
            .iter()
            .zip(self.depths.iter())
            .map(|(edge, depth)| Step {
                instruction: edge.source,
                depth:       *depth,
                decision:    edge.decision,
            })
            .collect()
    }

    /// Renders the path one step per line, indented by call depth.
    #[must_use]
    pub fn prettified_path(&self) -> String {
        let mut out = String::new();
        for step in self.full_path() {
            let indent = "  ".repeat(step.depth.saturating_sub(1));
            let _ = writeln!(out, "{indent}{} [{}]", step.instruction, step.decision);
        }
        out
    }

    /// Gets a stable hex digest identifying the path.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let digest = Sha3_256::digest(self.prettified_path().as_bytes());
        hex::encode(digest)
    }

    /// Gets a digest of the decision path, equal for two states exactly when
    /// they took the same decisions.
    #[must_use]
    pub fn decision_digest(&self) -> [u8; 32] {
        let mut hasher = Sha3_256::new();
        for decision in &self.decision_path {
            hasher.update(decision.to_le_bytes());
        }
        let mut digest = [0; 32];
        digest.copy_from_slice(&hasher.finalize());
        digest
    }
}

#[cfg(test)]
mod test {
    use crate::{
        constant::{CALL_DECISION, RETURN_DECISION},
        error::exploration::Error,
        program::types::{ClassId, InstructionId, LocalId, MethodId},
        state::{
            edge::{Decision, Edge},
            frame::CallArguments,
            ExecutionState,
            MethodResult,
            StateLabel,
            StateStatus,
            SymbolicFailure,
        },
        symbolic::{
            memory::{Reference, SymbolicValue},
            update::SymbolicStateUpdate,
            SymbolicState,
        },
    };

    fn root() -> ExecutionState {
        ExecutionState::initial(
            MethodId(0),
            CallArguments::new(None, vec![SymbolicValue::int(1)]),
            SymbolicState::new(),
        )
    }

    fn step(state: &ExecutionState) -> anyhow::Result<ExecutionState> {
        let from = state.stmt();
        let edge = Edge::new(from, from.next(), Decision::Branch(0));
        Ok(state.update(edge, &SymbolicStateUpdate::new(), false)?)
    }

    #[test]
    fn path_bookkeeping_stays_consistent() -> anyhow::Result<()> {
        let state = root();
        let state = step(&state)?;
        let call_site = state.stmt();
        let callee = InstructionId::entry(MethodId(1));
        let state = state.push(
            callee,
            CallArguments::default(),
            &SymbolicStateUpdate::new(),
            MethodId(1),
        )?;
        let state = step(&state)?;
        let state = state.pop(MethodResult::Success(None))?;

        state.check_invariants()?;
        assert_eq!(state.path_length(), 4);
        assert_eq!(state.decision_path().len(), 4);
        assert_eq!(state.stmt(), call_site);
        assert_eq!(
            state.decision_path().iter().copied().collect::<Vec<_>>(),
            vec![0, CALL_DECISION, 0, RETURN_DECISION]
        );

        Ok(())
    }

    #[test]
    fn push_then_pop_restores_the_caller_frame() -> anyhow::Result<()> {
        let update = SymbolicStateUpdate::new().with_local(LocalId(0), SymbolicValue::int(5));
        let caller = root().update(
            Edge::new(
                InstructionId::entry(MethodId(0)),
                InstructionId::new(MethodId(0), 1),
                Decision::Branch(0),
            ),
            &update,
            false,
        )?;
        let callee_update = SymbolicStateUpdate::new().with_local(LocalId(0), SymbolicValue::int(9));
        let inside = caller.push(
            InstructionId::entry(MethodId(2)),
            CallArguments::default(),
            &callee_update,
            MethodId(2),
        )?;
        assert_eq!(inside.frame().unwrap().locals.get(LocalId(0)), Some(&SymbolicValue::int(9)));

        let returned = inside.pop(MethodResult::Success(Some(SymbolicValue::int(3))))?;
        assert_eq!(returned.stack(), caller.stack());
        assert_eq!(returned.stmt(), caller.stmt());
        assert_eq!(
            returned.method_result(),
            Some(&MethodResult::Success(Some(SymbolicValue::int(3))))
        );

        Ok(())
    }

    #[test]
    fn transitions_never_change_their_input() -> anyhow::Result<()> {
        let original = root();
        let snapshot = original.clone();
        let _ = step(&original)?;
        let _ = original.push(
            InstructionId::entry(MethodId(1)),
            CallArguments::default(),
            &SymbolicStateUpdate::new(),
            MethodId(1),
        )?;
        let _ = original.pop(MethodResult::Success(None))?;

        assert_eq!(original, snapshot);
        Ok(())
    }

    #[test]
    fn popping_the_root_frame_terminates() -> anyhow::Result<()> {
        let terminal = root().pop(MethodResult::Success(None))?;
        assert_eq!(terminal.status(), StateStatus::Terminal);
        assert_eq!(terminal.label(), StateLabel::Terminal);
        assert!(terminal.stack().is_empty());
        terminal.check_invariants()?;

        let error = terminal.pop(MethodResult::Success(None)).unwrap_err();
        assert_eq!(error.payload, Error::EmptyStack);
        let error = step(&terminal).unwrap_err();
        assert!(error.to_string().contains("empty call stack"));

        Ok(())
    }

    #[test]
    fn exception_states_are_deterministic() -> anyhow::Result<()> {
        let state = root();
        let failure = SymbolicFailure {
            class:     ClassId(4),
            object:    Reference::Null,
            explicit:  false,
            raised_at: state.stmt(),
        };
        let first = state.create_exception_state(failure.clone(), &SymbolicStateUpdate::new())?;
        let second = state.create_exception_state(failure, &SymbolicStateUpdate::new())?;

        assert_eq!(first, second);
        assert_eq!(first.status(), StateStatus::PendingException);
        assert_eq!(first.stack().len(), state.stack().len());
        let decision = *first.decision_path().back().unwrap();
        assert_eq!(decision, Decision::Exception(4).code());
        assert!(decision < CALL_DECISION);
        assert_eq!(first.fingerprint(), second.fingerprint());

        Ok(())
    }

    #[test]
    fn does_not_throw_is_sticky() -> anyhow::Result<()> {
        let state = root();
        let from = state.stmt();
        let marked = state.update(
            Edge::new(from, from.next(), Decision::Branch(0)),
            &SymbolicStateUpdate::new(),
            true,
        )?;
        let after = step(&marked)?;
        assert!(after.frame().unwrap().does_not_throw);

        Ok(())
    }

    #[test]
    fn decision_digests_identify_decision_paths() -> anyhow::Result<()> {
        let state = root();
        let from = state.stmt();
        let branch = |decision: u32| -> anyhow::Result<ExecutionState> {
            Ok(state.update(
                Edge::new(from, from.next(), Decision::Branch(decision)),
                &SymbolicStateUpdate::new(),
                false,
            )?)
        };

        assert_eq!(branch(0)?.decision_digest(), branch(0)?.decision_digest());
        assert_ne!(branch(0)?.decision_digest(), branch(1)?.decision_digest());
        assert_ne!(state.decision_digest(), branch(0)?.decision_digest());

        Ok(())
    }

    #[test]
    fn callees_inherit_does_not_throw() -> anyhow::Result<()> {
        let state = root();
        let from = state.stmt();
        let marked = state.update(
            Edge::new(from, from.next(), Decision::Branch(0)),
            &SymbolicStateUpdate::new(),
            true,
        )?;
        let callee = marked.push(
            InstructionId::entry(MethodId(1)),
            CallArguments::default(),
            &SymbolicStateUpdate::new(),
            MethodId(1),
        )?;
        assert!(callee.frame().unwrap().does_not_throw);

        let unmarked = root().push(
            InstructionId::entry(MethodId(1)),
            CallArguments::default(),
            &SymbolicStateUpdate::new(),
            MethodId(1),
        )?;
        assert!(!unmarked.frame().unwrap().does_not_throw);

        Ok(())
    }
}
