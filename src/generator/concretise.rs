//! This module turns a completed symbolic path and a solution of its
//! constraints into the concrete invocation that should follow the same path.

use crate::{
    error::program::{Error, Result},
    instrumentation::storage::{NdRecord, NdReplayLog},
    program::{
        types::{ClassId, ConcreteValue},
        Program,
    },
    reconciler::{Candidate, Prediction},
    sandbox::protocol::{Invocation, StaticAssignment},
    solver::Assignment,
    state::{frame::CallArguments, ExecutionState, MethodResult, StateLabel},
    symbolic::{
        memory::{ObjectKind, Reference, SymbolicValue},
        SymbolicState,
    },
};

/// Builds the candidate for `state` under `assignment`.
///
/// `arguments` are the symbolic arguments the method under test was entered
/// with, `signature` its signature and `timeout_ms` the budget of the
/// concrete run. If `replay` is set, the invocation carries the assumed
/// non-deterministic values so that the run follows the path.
///
/// # Errors
///
/// Returns [`Err`] if a class named by the path does not exist.
pub fn candidate(
    program: &Program,
    signature: &str,
    arguments: &CallArguments,
    state: &ExecutionState,
    assignment: &Assignment,
    timeout_ms: u64,
    replay: bool,
) -> Result<Candidate> {
    let symbolic = state.symbolic();
    let receiver = arguments
        .receiver
        .map(|r| reference(program, symbolic, r))
        .transpose()?;
    let values = arguments
        .args
        .iter()
        .map(|a| value(program, symbolic, assignment, a))
        .collect::<Result<Vec<_>>>()?;
    let statics = symbolic
        .static_inputs()
        .iter()
        .map(|(field, symbol)| {
            Ok(StaticAssignment {
                class: class_name(program, field.class)?,
                field: field.name.clone(),
                value: assignment.value_of(symbol).into(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let assumptions: Vec<NdRecord> = symbolic
        .nd_assumptions()
        .iter()
        .map(|a| NdRecord {
            target:     a.target,
            signature:  a.signature.clone(),
            occurrence: a.occurrence,
            value:      assignment.value_of(&a.symbol).into(),
        })
        .collect();

    let replay = (replay && !assumptions.is_empty()).then(|| NdReplayLog {
        records: assumptions.clone(),
    });
    Ok(Candidate {
        method: signature.to_string(),
        fingerprint: state.fingerprint(),
        decision_path: state.decision_path().iter().copied().collect(),
        invocation: Invocation {
            method: signature.to_string(),
            receiver,
            arguments: values,
            statics,
            timeout_ms,
            replay,
        },
        prediction: prediction(program, state, assignment)?,
        assumptions,
    })
}

/// Works out what `state` predicts the method does.
fn prediction(program: &Program, state: &ExecutionState, assignment: &Assignment) -> Result<Prediction> {
    if state.label() != StateLabel::Terminal {
        return Ok(Prediction::Unknown);
    }
    let symbolic = state.symbolic();
    let prediction = match state.method_result() {
        Some(MethodResult::Success(None)) => Prediction::Returns {
            value: ConcreteValue::Void,
        },
        Some(MethodResult::Success(Some(result))) => Prediction::Returns {
            value: value(program, symbolic, assignment, result)?,
        },
        Some(MethodResult::Failure(failure)) => Prediction::Throws {
            class:    class_name(program, failure.class)?,
            explicit: failure.explicit,
        },
        Some(MethodResult::Exit(code)) => match value(program, symbolic, assignment, code)? {
            ConcreteValue::Int(code) => Prediction::Exits { code },
            _ => Prediction::Unknown,
        },
        None => Prediction::Unknown,
    };
    Ok(prediction)
}

fn value(
    program: &Program,
    symbolic: &SymbolicState,
    assignment: &Assignment,
    value: &SymbolicValue,
) -> Result<ConcreteValue> {
    match value {
        SymbolicValue::Primitive(expression) => {
            Ok(assignment.concretize(expression).unwrap_or(ConcreteValue::Void))
        }
        SymbolicValue::Reference(r) => reference(program, symbolic, *r),
    }
}

fn reference(program: &Program, symbolic: &SymbolicState, reference: Reference) -> Result<ConcreteValue> {
    let Reference::Object(address) = reference else {
        return Ok(ConcreteValue::Null);
    };
    let value = match symbolic.object(address) {
        Some(ObjectKind::Instance(class)) => ConcreteValue::Object {
            class: class_name(program, class)?,
        },
        Some(ObjectKind::IntArray { length }) => ConcreteValue::Array { length },
        None => ConcreteValue::Null,
    };
    Ok(value)
}

fn class_name(program: &Program, class: ClassId) -> Result<String> {
    program
        .class_name(class)
        .map(ToString::to_string)
        .ok_or(Error::NoSuchClass { class })
}
