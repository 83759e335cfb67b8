//! This module contains the reconciler, which compares the outcome the
//! symbolic exploration predicted for a path with the outcome observed when
//! running the path's inputs in the sandbox, and turns the paths on which the
//! two can be reconciled into test cases.
//!
//! # Divergence
//!
//! The symbolic model of the program is an abstraction, so the observed run
//! may disagree with the prediction. Such a [`Divergence`] is never an error.
//! It is logged and, by default, resolved in favour of what was observed, with
//! the resulting test case marked as diverged.

use std::{
    collections::BTreeSet,
    fmt::{Display, Formatter},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    instrumentation::storage::{NdRecord, NdReplayLog, NdTarget},
    program::types::{ConcreteValue, InstructionId},
    sandbox::protocol::{Invocation, InvocationResponse, Outcome, StaticAssignment},
};

/// The configuration of the reconciler.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Rejects paths whose observed outcome differs from the predicted one
    /// when no non-deterministic value diverged to explain the difference.
    ///
    /// Defaults to `false`, keeping the observed outcome.
    pub reject_unexplained_divergence: bool,

    /// Runs every accepted test case a second time, replaying its
    /// non-deterministic values, and reports it as undetermined if the two
    /// runs disagree.
    ///
    /// Defaults to `false`.
    pub confirm_with_replay: bool,
}

impl Config {
    /// Sets the `reject_unexplained_divergence` config parameter to `value`.
    #[must_use]
    pub fn with_reject_unexplained_divergence(mut self, value: bool) -> Self {
        self.reject_unexplained_divergence = value;
        self
    }

    /// Sets the `confirm_with_replay` config parameter to `value`.
    #[must_use]
    pub fn with_confirm_with_replay(mut self, value: bool) -> Self {
        self.confirm_with_replay = value;
        self
    }
}

/// What the symbolic exploration predicts a path does.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Prediction {
    Returns { value: ConcreteValue },
    Throws { class: String, explicit: bool },
    Exits { code: i64 },

    /// The path was left to concrete execution, so any outcome is accepted.
    Unknown,
}

impl Prediction {
    /// Checks if `outcome` is the outcome the prediction describes.
    #[must_use]
    pub fn agrees_with(&self, outcome: &Outcome) -> bool {
        match (self, outcome) {
            (Self::Unknown, _) => !outcome.is_undetermined(),
            (Self::Returns { value }, Outcome::Success { value: observed }) => value == observed,
            (
                Self::Throws {
                    class,
                    explicit: true,
                },
                Outcome::ExplicitlyThrown { class: observed },
            )
            | (
                Self::Throws {
                    class,
                    explicit: false,
                },
                Outcome::ImplicitlyThrown { class: observed },
            ) => class == observed,
            (
                Self::Exits { code },
                Outcome::SandboxCrashed {
                    exit_code: Some(observed),
                },
            ) => exit_codes_match(*code, *observed),
            _ => false,
        }
    }
}

impl Display for Prediction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Returns { value } => write!(f, "returns {value}"),
            Self::Throws {
                class,
                explicit: true,
            } => write!(f, "throws {class}"),
            Self::Throws {
                class,
                explicit: false,
            } => write!(f, "raises {class}"),
            Self::Exits { code } => write!(f, "exits with {code}"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// The process exit status only keeps the low byte of the code on Unix.
fn exit_codes_match(predicted: i64, observed: i32) -> bool {
    if cfg!(unix) {
        predicted & 0xff == i64::from(observed) & 0xff
    } else {
        predicted == i64::from(observed)
    }
}

/// A completed path together with the concrete inputs solved for it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// The signature of the method under test.
    pub method:        String,
    pub fingerprint:   String,
    pub decision_path: Vec<i32>,
    pub invocation:    Invocation,
    pub prediction:    Prediction,

    /// The values the path assumes its non-deterministic calls produced.
    pub assumptions: Vec<NdRecord>,
}

/// A disagreement between a path's prediction and its concrete run.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Divergence {
    /// A non-deterministic call produced a value other than the one the path
    /// assumed, or was never made.
    NdValue {
        target:     NdTarget,
        signature:  String,
        occurrence: u32,
        assumed:    ConcreteValue,
        observed:   Option<ConcreteValue>,
    },

    /// The run ended differently than predicted.
    Outcome {
        predicted: Prediction,
        observed:  Outcome,
    },
}

impl Display for Divergence {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NdValue {
                signature,
                occurrence,
                assumed,
                observed: Some(observed),
                ..
            } => write!(
                f,
                "call {occurrence} to {signature} assumed {assumed} but produced {observed}"
            ),
            Self::NdValue {
                signature,
                occurrence,
                assumed,
                observed: None,
                ..
            } => write!(f, "call {occurrence} to {signature} assumed {assumed} but never happened"),
            Self::Outcome {
                predicted,
                observed,
            } => write!(f, "predicted {predicted} but {observed}"),
        }
    }
}

/// A generated test case: concrete inputs and the outcome they produce.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id:            Uuid,
    /// The signature of the method under test.
    pub method:        String,
    /// The fingerprint of the path the test case exercises.
    pub fingerprint:   String,
    pub decision_path: Vec<i32>,
    pub receiver:      Option<ConcreteValue>,
    pub arguments:     Vec<ConcreteValue>,
    pub statics:       Vec<StaticAssignment>,

    /// The observed outcome, which the test case asserts on.
    pub expected: Outcome,

    /// The values the non-deterministic calls produced in the run.
    pub nd_values: NdReplayLog,

    /// The instructions of the original program the run executed.
    pub coverage: BTreeSet<InstructionId>,

    pub divergences: Vec<Divergence>,
    pub diverged:    bool,
}

impl TestCase {
    /// Constructs the invocation that reruns the test case, replaying its
    /// non-deterministic values.
    #[must_use]
    pub fn replay_invocation(&self, timeout_ms: u64) -> Invocation {
        Invocation {
            method: self.method.clone(),
            receiver: self.receiver.clone(),
            arguments: self.arguments.clone(),
            statics: self.statics.clone(),
            timeout_ms,
            replay: Some(self.nd_values.clone()),
        }
    }
}

/// A path that did not produce a test case.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DroppedPath {
    pub method:      String,
    pub fingerprint: String,
    pub reason:      String,
    pub divergences: Vec<Divergence>,
}

/// The result of reconciling one path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Verdict {
    Accepted(TestCase),

    /// The observed run contradicts the path in a way the configuration does
    /// not allow to be resolved.
    Rejected(DroppedPath),

    /// The run says nothing about the path, because it timed out, crashed or
    /// was not reproducible.
    Undetermined(DroppedPath),
}

/// Compares predicted and observed outcomes.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Reconciler {
    config: Config,
}

impl Reconciler {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Reconciles the run of `candidate` that produced `response`.
    #[must_use]
    pub fn reconcile(&self, candidate: &Candidate, response: &InvocationResponse) -> Verdict {
        let observed = &response.outcome;
        let agrees = candidate.prediction.agrees_with(observed);

        if observed.is_undetermined() && !agrees {
            debug!(
                method = %candidate.method,
                fingerprint = %candidate.fingerprint,
                outcome = %observed,
                "Concrete run was undetermined"
            );
            return Verdict::Undetermined(dropped(candidate, observed.to_string(), vec![]));
        }

        let mut divergences = nd_divergences(&candidate.assumptions, &response.nd_log);
        let explained = !divergences.is_empty();
        if !agrees {
            divergences.push(Divergence::Outcome {
                predicted: candidate.prediction.clone(),
                observed:  observed.clone(),
            });
        }
        for divergence in &divergences {
            warn!(
                method = %candidate.method,
                fingerprint = %candidate.fingerprint,
                %divergence,
                "Concrete run diverged from the path"
            );
        }

        if !agrees && !explained && self.config.reject_unexplained_divergence {
            let reason = format!("predicted {} but {observed}", candidate.prediction);
            return Verdict::Rejected(dropped(candidate, reason, divergences));
        }

        debug!(
            method = %candidate.method,
            fingerprint = %candidate.fingerprint,
            outcome = %observed,
            "Accepted test case"
        );
        let Invocation {
            receiver,
            arguments,
            statics,
            ..
        } = candidate.invocation.clone();
        Verdict::Accepted(TestCase {
            id: Uuid::new_v4(),
            method: candidate.method.clone(),
            fingerprint: candidate.fingerprint.clone(),
            decision_path: candidate.decision_path.clone(),
            receiver,
            arguments,
            statics,
            expected: observed.clone(),
            nd_values: response.nd_log.clone(),
            coverage: response.coverage.clone(),
            diverged: !divergences.is_empty(),
            divergences,
        })
    }

    /// Checks that a rerun of `test_case`, which produced `response`, ends
    /// the same way as the run that produced it.
    #[must_use]
    pub fn confirm(&self, mut test_case: TestCase, response: &InvocationResponse) -> Verdict {
        if response.outcome != test_case.expected {
            warn!(
                method = %test_case.method,
                fingerprint = %test_case.fingerprint,
                first = %test_case.expected,
                second = %response.outcome,
                "Test case is not reproducible"
            );
            let reason = format!(
                "first run {} but replay {}",
                test_case.expected, response.outcome
            );
            return Verdict::Undetermined(DroppedPath {
                method: test_case.method,
                fingerprint: test_case.fingerprint,
                reason,
                divergences: test_case.divergences,
            });
        }
        test_case.coverage.extend(response.coverage.iter().copied());
        Verdict::Accepted(test_case)
    }
}

/// Finds the assumed non-deterministic values that the log contradicts.
fn nd_divergences(assumptions: &[NdRecord], log: &NdReplayLog) -> Vec<Divergence> {
    assumptions
        .iter()
        .filter_map(|assumed| {
            let observed = log.lookup(assumed.target, &assumed.signature, assumed.occurrence);
            (observed != Some(&assumed.value)).then(|| Divergence::NdValue {
                target:     assumed.target,
                signature:  assumed.signature.clone(),
                occurrence: assumed.occurrence,
                assumed:    assumed.value.clone(),
                observed:   observed.cloned(),
            })
        })
        .collect()
}

fn dropped(candidate: &Candidate, reason: String, divergences: Vec<Divergence>) -> DroppedPath {
    DroppedPath {
        method: candidate.method.clone(),
        fingerprint: candidate.fingerprint.clone(),
        reason,
        divergences,
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;

    use crate::{
        instrumentation::storage::{InstanceKey, NdRecord, NdReplayLog, NdTarget},
        program::types::{ConcreteValue, InstructionId, MethodId},
        reconciler::{Candidate, Config, Divergence, Prediction, Reconciler, Verdict},
        sandbox::protocol::{Invocation, InvocationResponse, Outcome},
    };

    const NEXT_INT: &str = "java.util.Random.nextInt(int)";

    fn draw(value: i64) -> NdRecord {
        NdRecord {
            target:     NdTarget::Instance(InstanceKey {
                site:    InstructionId::new(MethodId(20), 0),
                ordinal: 0,
            }),
            signature:  NEXT_INT.to_string(),
            occurrence: 0,
            value:      ConcreteValue::Int(value),
        }
    }

    fn candidate(prediction: Prediction, assumptions: Vec<NdRecord>) -> Candidate {
        Candidate {
            method: "demo.Maths.reciprocal(int)".to_string(),
            fingerprint: "abc".to_string(),
            decision_path: vec![0, 1],
            invocation: Invocation {
                method:     "demo.Maths.reciprocal(int)".to_string(),
                receiver:   None,
                arguments:  vec![ConcreteValue::Int(0)],
                statics:    vec![],
                timeout_ms: 1_000,
                replay:     None,
            },
            prediction,
            assumptions,
        }
    }

    fn response(outcome: Outcome, records: Vec<NdRecord>) -> InvocationResponse {
        InvocationResponse {
            id: 0,
            outcome,
            coverage: BTreeSet::from([InstructionId::new(MethodId(20), 0)]),
            nd_log: NdReplayLog { records },
        }
    }

    fn arithmetic() -> Outcome {
        Outcome::ImplicitlyThrown {
            class: "java.lang.ArithmeticException".to_string(),
        }
    }

    #[test]
    fn agreeing_outcomes_are_accepted() {
        let prediction = Prediction::Throws {
            class:    "java.lang.ArithmeticException".to_string(),
            explicit: false,
        };
        let verdict = Reconciler::default().reconcile(&candidate(prediction, vec![]), &response(arithmetic(), vec![]));

        let Verdict::Accepted(test_case) = verdict else {
            panic!("expected acceptance, found {verdict:?}");
        };
        assert_eq!(test_case.expected, arithmetic());
        assert_eq!(test_case.arguments, vec![ConcreteValue::Int(0)]);
        assert!(!test_case.diverged);
        assert_eq!(test_case.coverage.len(), 1);
    }

    #[test]
    fn mismatched_nd_values_prefer_the_observed_ones() {
        let prediction = Prediction::Returns {
            value: ConcreteValue::Int(1),
        };
        let observed = Outcome::Success {
            value: ConcreteValue::Int(0),
        };
        let verdict = Reconciler::new(Config::default().with_reject_unexplained_divergence(true))
            .reconcile(&candidate(prediction, vec![draw(6)]), &response(observed.clone(), vec![draw(2)]));

        let Verdict::Accepted(test_case) = verdict else {
            panic!("expected acceptance, found {verdict:?}");
        };
        assert!(test_case.diverged);
        assert_eq!(test_case.expected, observed);
        assert_eq!(test_case.nd_values.records, vec![draw(2)]);
        assert!(matches!(
            test_case.divergences[0],
            Divergence::NdValue {
                observed: Some(ConcreteValue::Int(2)),
                ..
            }
        ));
        assert!(matches!(test_case.divergences[1], Divergence::Outcome { .. }));
    }

    #[test]
    fn unexplained_divergence_can_be_rejected() {
        let prediction = Prediction::Returns {
            value: ConcreteValue::Int(1),
        };
        let candidate = candidate(prediction, vec![]);
        let observed = response(arithmetic(), vec![]);

        let lenient = Reconciler::default().reconcile(&candidate, &observed);
        assert!(matches!(lenient, Verdict::Accepted(ref t) if t.diverged));

        let strict = Reconciler::new(Config::default().with_reject_unexplained_divergence(true))
            .reconcile(&candidate, &observed);
        assert!(matches!(strict, Verdict::Rejected(_)));
    }

    #[test]
    fn timeouts_and_crashes_are_undetermined() {
        let prediction = Prediction::Returns {
            value: ConcreteValue::Void,
        };
        let reconciler = Reconciler::default();
        for outcome in [Outcome::Timeout, Outcome::SandboxCrashed { exit_code: None }] {
            let verdict = reconciler.reconcile(&candidate(prediction.clone(), vec![]), &response(outcome, vec![]));
            assert!(matches!(verdict, Verdict::Undetermined(_)));
        }
    }

    #[test]
    fn predicted_exits_match_crashes_with_the_same_code() {
        let verdict = Reconciler::default().reconcile(
            &candidate(Prediction::Exits { code: 3 }, vec![]),
            &response(Outcome::SandboxCrashed { exit_code: Some(3) }, vec![]),
        );

        assert!(matches!(verdict, Verdict::Accepted(ref t) if !t.diverged));
    }

    #[test]
    fn unreproducible_test_cases_are_undetermined() {
        let reconciler = Reconciler::default();
        let Verdict::Accepted(test_case) = reconciler.reconcile(
            &candidate(Prediction::Unknown, vec![]),
            &response(arithmetic(), vec![]),
        ) else {
            panic!("expected acceptance");
        };

        let replayed = reconciler.confirm(test_case.clone(), &response(arithmetic(), vec![]));
        assert!(matches!(replayed, Verdict::Accepted(_)));

        let flaky = reconciler.confirm(test_case, &response(Outcome::Timeout, vec![]));
        assert!(matches!(flaky, Verdict::Undetermined(_)));
    }
}
