//! This module contains the frames of the symbolic call stack.

use crate::{
    program::types::{InstructionId, MethodId},
    symbolic::memory::{LocalVariableMemory, Reference, SymbolicValue},
};

/// The values a method is entered with.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CallArguments {
    pub receiver: Option<Reference>,
    pub args:     Vec<SymbolicValue>,
}

impl CallArguments {
    #[must_use]
    pub fn new(receiver: Option<Reference>, args: Vec<SymbolicValue>) -> Self {
        Self { receiver, args }
    }
}

/// A frame of the symbolic call stack.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StackFrame {
    /// The call instruction in the calling frame, or [`None`] for the method
    /// under analysis.
    pub caller: Option<InstructionId>,

    /// The local variables of the frame.
    pub locals: LocalVariableMemory,

    /// The formal parameters, by index.
    pub parameters: im::Vector<SymbolicValue>,

    /// The values the frame was entered with, in call order.
    pub input_arguments: CallArguments,

    /// The method executing in the frame.
    pub method: MethodId,

    /// Whether the method has been established not to throw. Once set, it
    /// stays set.
    pub does_not_throw: bool,
}

impl StackFrame {
    /// Creates the frame for `method`, entered from `caller` with
    /// `input_arguments`.
    #[must_use]
    pub fn new(
        caller: Option<InstructionId>,
        locals: LocalVariableMemory,
        input_arguments: CallArguments,
        method: MethodId,
    ) -> Self {
        let parameters = input_arguments.args.iter().cloned().collect();
        Self {
            caller,
            locals,
            parameters,
            input_arguments,
            method,
            does_not_throw: false,
        }
    }

    /// Gets the receiver the frame was entered with.
    #[must_use]
    pub fn receiver(&self) -> Option<Reference> {
        self.input_arguments.receiver
    }

    /// Gets the value of formal parameter `index`.
    #[must_use]
    pub fn parameter(&self, index: u32) -> Option<&SymbolicValue> {
        self.parameters.get(index as usize)
    }
}
