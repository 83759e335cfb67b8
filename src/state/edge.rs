//! This module contains the edges that make up a path and the decision codes
//! that label them.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::{
    constant::{CALL_DECISION, RETURN_DECISION},
    program::types::InstructionId,
};

/// A taken control-flow transition.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source:      InstructionId,
    pub destination: InstructionId,
    pub decision:    i32,
}

impl Edge {
    #[must_use]
    pub fn new(source: InstructionId, destination: InstructionId, decision: Decision) -> Self {
        let decision = decision.code();
        Self {
            source,
            destination,
            decision,
        }
    }
}

impl Display for Edge {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -[{}]-> {}", self.source, self.decision, self.destination)
    }
}

/// The kind of choice an edge records.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Decision {
    /// The n-th normal-flow successor was taken.
    Branch(u32),

    /// A method was entered.
    Call,

    /// A method was left.
    Return,

    /// An exception of the given category was raised.
    Exception(u32),
}

impl Decision {
    /// Gets the integer code recorded in the decision path.
    ///
    /// Branches are non-negative, [`CALL_DECISION`] and [`RETURN_DECISION`]
    /// are reserved, and exception categories count down from below
    /// [`CALL_DECISION`].
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Branch(n) => i32::try_from(*n).unwrap_or(i32::MAX),
            Self::Call => CALL_DECISION,
            Self::Return => RETURN_DECISION,
            Self::Exception(category) => {
                CALL_DECISION - 1 - i32::try_from(*category).unwrap_or(i32::MAX - 3)
            }
        }
    }

    /// Recovers the decision from its integer code.
    #[must_use]
    pub fn from_code(code: i32) -> Self {
        match code {
            n if n >= 0 => Self::Branch(n.unsigned_abs()),
            RETURN_DECISION => Self::Return,
            CALL_DECISION => Self::Call,
            n => Self::Exception((CALL_DECISION - 1 - n).unsigned_abs()),
        }
    }
}

#[cfg(test)]
mod test {
    use crate::{
        constant::{CALL_DECISION, RETURN_DECISION},
        state::edge::Decision,
    };

    #[test]
    fn decision_codes_are_disjoint_and_invertible() {
        let decisions = [
            Decision::Branch(0),
            Decision::Branch(3),
            Decision::Call,
            Decision::Return,
            Decision::Exception(0),
            Decision::Exception(12),
        ];
        for decision in decisions {
            assert_eq!(Decision::from_code(decision.code()), decision);
        }

        assert_eq!(Decision::Call.code(), CALL_DECISION);
        assert_eq!(Decision::Return.code(), RETURN_DECISION);
        assert!(Decision::Exception(0).code() < CALL_DECISION);
        assert!(Decision::Branch(0).code() >= 0);
    }
}
