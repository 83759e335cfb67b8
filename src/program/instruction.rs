//! This module contains the statement-level instruction set of the program
//! representation, along with the arithmetic semantics shared by the symbolic
//! and the concrete executors.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::program::types::{
    ClassId,
    Constant,
    FieldRef,
    InstructionId,
    LocalId,
    MethodId,
    Primitive,
};

/// An operand of an instruction: either a local variable or a literal.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Local(LocalId),
    Const(Constant),
}

impl From<LocalId> for Operand {
    fn from(value: LocalId) -> Self {
        Self::Local(value)
    }
}

impl From<Constant> for Operand {
    fn from(value: Constant) -> Self {
        Self::Const(value)
    }
}

impl From<i64> for Operand {
    fn from(value: i64) -> Self {
        Self::Const(Constant::Int(value))
    }
}

impl From<i32> for Operand {
    fn from(value: i32) -> Self {
        Self::Const(Constant::Int(i64::from(value)))
    }
}

impl From<bool> for Operand {
    fn from(value: bool) -> Self {
        Self::Const(Constant::Bool(value))
    }
}

impl Display for Operand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(local) => write!(f, "{local}"),
            Self::Const(constant) => write!(f, "{constant}"),
        }
    }
}

/// Binary operators over primitive values.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Xor,
}

/// A fault raised while evaluating an operator on concrete primitives.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum EvaluationFault {
    #[error("Division by zero")]
    DivisionByZero,

    #[error("Operator {op:?} cannot be applied to the provided operands")]
    TypeMismatch { op: &'static str },
}

impl BinaryOp {
    /// Checks if the operator may raise an arithmetic exception for a zero
    /// right-hand operand.
    #[must_use]
    pub fn is_division(&self) -> bool {
        matches!(self, Self::Div | Self::Rem)
    }

    /// Checks if the operator always yields a boolean.
    #[must_use]
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge
        )
    }

    /// Gets the comparison that holds exactly when this one does not.
    #[must_use]
    pub fn negated(&self) -> Option<Self> {
        let op = match self {
            Self::Eq => Self::Ne,
            Self::Ne => Self::Eq,
            Self::Lt => Self::Ge,
            Self::Le => Self::Gt,
            Self::Gt => Self::Le,
            Self::Ge => Self::Lt,
            _ => return None,
        };
        Some(op)
    }

    /// Gets the comparison obtained by swapping the operands.
    #[must_use]
    pub fn mirrored(&self) -> Option<Self> {
        let op = match self {
            Self::Eq => Self::Eq,
            Self::Ne => Self::Ne,
            Self::Lt => Self::Gt,
            Self::Le => Self::Ge,
            Self::Gt => Self::Lt,
            Self::Ge => Self::Le,
            _ => return None,
        };
        Some(op)
    }

    /// Applies the operator to two concrete operands.
    ///
    /// Integer arithmetic wraps on overflow.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] on division by zero or on operands of the wrong kind.
    pub fn apply(&self, left: Primitive, right: Primitive) -> Result<Primitive, EvaluationFault> {
        use Primitive::{Bool, Int};
        let result = match (self, left, right) {
            (Self::Add, Int(l), Int(r)) => Int(l.wrapping_add(r)),
            (Self::Sub, Int(l), Int(r)) => Int(l.wrapping_sub(r)),
            (Self::Mul, Int(l), Int(r)) => Int(l.wrapping_mul(r)),
            (Self::Div | Self::Rem, Int(_), Int(0)) => return Err(EvaluationFault::DivisionByZero),
            (Self::Div, Int(l), Int(r)) => Int(l.wrapping_div(r)),
            (Self::Rem, Int(l), Int(r)) => Int(l.wrapping_rem(r)),
            (Self::Eq, l, r) if std::mem::discriminant(&l) == std::mem::discriminant(&r) => {
                Bool(l == r)
            }
            (Self::Ne, l, r) if std::mem::discriminant(&l) == std::mem::discriminant(&r) => {
                Bool(l != r)
            }
            (Self::Lt, Int(l), Int(r)) => Bool(l < r),
            (Self::Le, Int(l), Int(r)) => Bool(l <= r),
            (Self::Gt, Int(l), Int(r)) => Bool(l > r),
            (Self::Ge, Int(l), Int(r)) => Bool(l >= r),
            (Self::And, Bool(l), Bool(r)) => Bool(l && r),
            (Self::Or, Bool(l), Bool(r)) => Bool(l || r),
            (Self::Xor, Bool(l), Bool(r)) => Bool(l ^ r),
            (Self::And, Int(l), Int(r)) => Int(l & r),
            (Self::Or, Int(l), Int(r)) => Int(l | r),
            (Self::Xor, Int(l), Int(r)) => Int(l ^ r),
            _ => {
                return Err(EvaluationFault::TypeMismatch {
                    op: self.symbol(),
                })
            }
        };
        Ok(result)
    }

    /// Gets the textual symbol of the operator.
    #[must_use]
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::And => "&",
            Self::Or => "|",
            Self::Xor => "^",
        }
    }
}

/// Unary operators over primitive values.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

impl UnaryOp {
    /// Applies the operator to a concrete operand.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the operand is of the wrong kind.
    pub fn apply(&self, operand: Primitive) -> Result<Primitive, EvaluationFault> {
        match (self, operand) {
            (Self::Neg, Primitive::Int(value)) => Ok(Primitive::Int(value.wrapping_neg())),
            (Self::Not, Primitive::Bool(value)) => Ok(Primitive::Bool(!value)),
            _ => Err(EvaluationFault::TypeMismatch {
                op: self.symbol(),
            }),
        }
    }

    #[must_use]
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Neg => "-",
            Self::Not => "!",
        }
    }
}

/// The right-hand side of an assignment.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Rvalue {
    Use(Operand),
    Binary {
        op:    BinaryOp,
        left:  Operand,
        right: Operand,
    },
    Unary {
        op:      UnaryOp,
        operand: Operand,
    },
    Parameter(u32),
    This,
    GetField {
        object: Operand,
        field:  FieldRef,
    },
    GetStatic(FieldRef),
    New(ClassId),
    NewArray {
        length: Operand,
    },
    ArrayLoad {
        array: Operand,
        index: Operand,
    },
    ArrayLength {
        array: Operand,
    },
}

/// How the target of a call is selected.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Dispatch {
    /// The named method is called, without a receiver.
    Static,

    /// The named method is called on the receiver without dynamic lookup, as
    /// for constructors.
    Special,

    /// The method is looked up by name and parameters starting from the
    /// dynamic class of the receiver.
    Virtual,
}

/// A method call.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub method:   MethodId,
    pub dispatch: Dispatch,
    pub receiver: Option<Operand>,
    pub args:     Vec<Operand>,
}

/// Probes inserted by the non-determinism instrumentation.
///
/// Probes have no effect on the program's own state.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Probe {
    /// Pushes the receiver and arguments of the following non-deterministic
    /// call onto the invocation's bookkeeping stack.
    NdEnter {
        receiver: Option<Operand>,
        args:     Vec<Operand>,
    },

    /// Records the value produced by the preceding non-deterministic call.
    NdRecord {
        signature: String,
        result:    LocalId,
        is_static: bool,
    },

    /// Registers the object in `object` as the next instance constructed at
    /// `site`.
    NdRegisterInstance {
        site:   InstructionId,
        object: LocalId,
    },
}

/// A single instruction of a method body.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    Nop,
    Assign {
        target: LocalId,
        value:  Rvalue,
    },
    PutField {
        object: Operand,
        field:  FieldRef,
        value:  Operand,
    },
    PutStatic {
        field: FieldRef,
        value: Operand,
    },
    ArrayStore {
        array: Operand,
        index: Operand,
        value: Operand,
    },
    /// Jumps to `target` if `condition` holds, and falls through otherwise.
    If {
        condition: Operand,
        target:    u32,
    },
    Goto {
        target: u32,
    },
    Invoke {
        result: Option<LocalId>,
        call:   Call,
    },
    Return {
        value: Option<Operand>,
    },
    Throw {
        exception: Operand,
    },
    /// Terminates the whole process with the provided status code.
    Exit {
        code: Operand,
    },
    Probe(Probe),
}

impl Instruction {
    /// Checks if the instruction was inserted by instrumentation.
    #[must_use]
    pub fn is_probe(&self) -> bool {
        matches!(self, Self::Probe(_))
    }

    /// Gets the intra-method jump target of the instruction, if any.
    #[must_use]
    pub fn jump_target(&self) -> Option<u32> {
        match self {
            Self::If { target, .. } | Self::Goto { target } => Some(*target),
            _ => None,
        }
    }

    /// Rewrites the intra-method jump target of the instruction using `map`.
    #[must_use]
    pub fn with_remapped_target(&self, map: impl Fn(u32) -> u32) -> Self {
        match self {
            Self::If { condition, target } => Self::If {
                condition: *condition,
                target:    map(*target),
            },
            Self::Goto { target } => Self::Goto {
                target: map(*target),
            },
            other => other.clone(),
        }
    }

    /// Checks if control never falls through to the next instruction.
    #[must_use]
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Self::Goto { .. } | Self::Return { .. } | Self::Throw { .. } | Self::Exit { .. }
        )
    }
}

#[cfg(test)]
mod test {
    use crate::program::{
        instruction::{BinaryOp, EvaluationFault, UnaryOp},
        types::Primitive,
    };

    #[test]
    fn integer_division_by_zero_faults() {
        let result = BinaryOp::Div.apply(Primitive::Int(7), Primitive::Int(0));
        assert_eq!(result, Err(EvaluationFault::DivisionByZero));

        let result = BinaryOp::Rem.apply(Primitive::Int(7), Primitive::Int(0));
        assert_eq!(result, Err(EvaluationFault::DivisionByZero));
    }

    #[test]
    fn arithmetic_wraps_on_overflow() -> anyhow::Result<()> {
        let result = BinaryOp::Add.apply(Primitive::Int(i64::MAX), Primitive::Int(1))?;
        assert_eq!(result, Primitive::Int(i64::MIN));

        let result = BinaryOp::Div.apply(Primitive::Int(i64::MIN), Primitive::Int(-1))?;
        assert_eq!(result, Primitive::Int(i64::MIN));

        Ok(())
    }

    #[test]
    fn comparisons_negate_and_mirror() {
        assert_eq!(BinaryOp::Lt.negated(), Some(BinaryOp::Ge));
        assert_eq!(BinaryOp::Lt.mirrored(), Some(BinaryOp::Gt));
        assert_eq!(BinaryOp::Add.negated(), None);
    }

    #[test]
    fn mismatched_operands_are_rejected() {
        let result = BinaryOp::Lt.apply(Primitive::Bool(true), Primitive::Int(1));
        assert!(matches!(result, Err(EvaluationFault::TypeMismatch { .. })));
        assert!(UnaryOp::Neg.apply(Primitive::Bool(true)).is_err());
    }
}
