//! This module contains the [`Traverser`], which computes the successor
//! states of a single state by interpreting its current instruction
//! symbolically.
//!
//! # Effects
//!
//! Evaluating an instruction produces one or more effects, each guarded by the
//! constraints under which it happens. An effect either continues to the next
//! instruction, possibly with a value, or raises a runtime exception. When an
//! instruction has several effects, the state forks, and the n-th continuing
//! effect is recorded with branch decision `n` so that every successor has a
//! distinct decision path.

use crate::{
    constant::{
        ARITHMETIC_EXCEPTION_CLASS,
        ILLEGAL_ARGUMENT_CLASS,
        INDEX_OUT_OF_BOUNDS_CLASS,
        NEGATIVE_ARRAY_SIZE_CLASS,
        NULL_POINTER_EXCEPTION_CLASS,
    },
    error::{
        container::Locatable,
        exploration::{Error, Result},
        program,
    },
    explorer::Config,
    instrumentation::{registry::NdRegistry, storage::NdTarget},
    program::{
        instruction::{BinaryOp, Call, Dispatch, Instruction, Operand, Rvalue},
        types::{ClassId, FieldRef, InstructionId, LocalId, MethodId, Primitive, Type},
        MethodBody,
        Native,
        ProgramRepresentation,
    },
    state::{
        edge::{Decision, Edge},
        frame::CallArguments,
        ExecutionState,
        MethodResult,
        SymbolicFailure,
    },
    symbolic::{
        expression::{Expression, Sort, SymExpr, Symbol},
        memory::{Address, ObjectKind, Reference, SymbolicValue},
        update::{MemoryUpdate, NdAssumption, SymbolicStateUpdate},
        SymbolicState,
    },
};

/// One possible outcome of evaluating an instruction.
#[derive(Clone, Debug, Eq, PartialEq)]
enum Effect {
    /// Execution continues, producing the value if there is one.
    Continue(Option<SymbolicValue>, SymbolicStateUpdate),

    /// The runtime raises an exception of the class.
    Raise(ClassId, SymbolicStateUpdate),
}

impl Effect {
    fn value(value: SymbolicValue) -> Self {
        Self::Continue(Some(value), SymbolicStateUpdate::new())
    }

    fn unit(update: SymbolicStateUpdate) -> Self {
        Self::Continue(None, update)
    }

    fn raise(class: ClassId) -> Self {
        Self::Raise(class, SymbolicStateUpdate::new())
    }

    /// Adds `constraint` to the guard of the effect.
    fn guarded(self, constraint: SymExpr) -> Self {
        match self {
            Self::Continue(value, update) => Self::Continue(value, update.with_hard(constraint)),
            Self::Raise(class, update) => Self::Raise(class, update.with_hard(constraint)),
        }
    }
}

/// Computes the successors of states for one program.
#[derive(Debug)]
pub struct Traverser<'a> {
    program:  &'a dyn ProgramRepresentation,
    registry: &'a NdRegistry,
    config:   &'a Config,
}

impl<'a> Traverser<'a> {
    #[must_use]
    pub fn new(
        program: &'a dyn ProgramRepresentation,
        registry: &'a NdRegistry,
        config: &'a Config,
    ) -> Self {
        Self {
            program,
            registry,
            config,
        }
    }

    /// Builds the state at the entry of `method`.
    ///
    /// Primitive parameters become the symbols named by [`parameter_symbol`].
    /// The receiver and object parameters are fresh objects with default
    /// field values, and array parameters are fresh zeroed arrays of
    /// [`Config::concretisation_width`] elements.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the method does not exist or has no body.
    pub fn entry_state(&self, method: MethodId) -> Result<ExecutionState> {
        let at = InstructionId::entry(method);
        let declaration = self.program.method(method).locate(at)?;
        if declaration.code().is_none() {
            return Err(Error::InvalidEntry {
                reason: format!("{method} has no code body"),
            }
            .locate(at));
        }

        let mut update = SymbolicStateUpdate::new();
        let mut next_address = 0;
        let mut allocate = |kind: ObjectKind, update: &mut SymbolicStateUpdate| {
            let address = Address(next_address);
            next_address += 1;
            update.memory.push(MemoryUpdate::Allocate { address, kind });
            Reference::Object(address)
        };

        let receiver = (!declaration.is_static)
            .then(|| allocate(ObjectKind::Instance(declaration.class), &mut update));
        let width = i64::try_from(self.config.concretisation_width).unwrap_or(i64::MAX);
        let mut args = Vec::with_capacity(declaration.params.len());
        for (index, ty) in declaration.params.iter().enumerate() {
            let value = match *ty {
                Type::Object(class) => {
                    SymbolicValue::Reference(allocate(ObjectKind::Instance(class), &mut update))
                }
                Type::IntArray => SymbolicValue::Reference(allocate(
                    ObjectKind::IntArray { length: width },
                    &mut update,
                )),
                Type::Int | Type::Bool => match parameter_symbol(index, *ty) {
                    Some(symbol) => SymbolicValue::Primitive(Expression::symbol(symbol)),
                    None => continue,
                },
                Type::Void => {
                    return Err(Error::InvalidEntry {
                        reason: format!("parameter {index} of {method} is void"),
                    }
                    .locate(at))
                }
            };
            args.push(value);
        }

        let symbolic = SymbolicState::new().apply(&update);
        Ok(ExecutionState::initial(
            method,
            CallArguments::new(receiver, args),
            symbolic,
        ))
    }

    /// Computes the successors of `state`.
    ///
    /// An empty result means that every successor was pruned.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the state is terminal, if a transition violates an
    /// invariant of the state, or if the program is malformed at the current
    /// instruction.
    pub fn successors(&self, state: &ExecutionState) -> Result<Vec<ExecutionState>> {
        let at = state.stmt();
        if state.is_terminal() {
            return Err(Error::TransitionFromTerminal.locate(at));
        }
        if let Some(exception) = state.exception() {
            return self.dispatch_exception(state, exception).map(|s| vec![s]);
        }
        if let Some(result) = state.method_result() {
            return self.resume(state, result).map(|s| vec![s]);
        }

        let instruction = self.program.instruction(at).locate(at)?;
        self.step(state, instruction)
    }

    /// Interprets `instruction`, the current instruction of `state`.
    fn step(&self, state: &ExecutionState, instruction: &Instruction) -> Result<Vec<ExecutionState>> {
        let at = state.stmt();
        match instruction {
            Instruction::Nop | Instruction::Probe(_) => {
                self.proceed(state, vec![Effect::unit(SymbolicStateUpdate::new())], None)
            }
            Instruction::Assign { target, value } => {
                let effects = self.evaluate(state, value)?;
                self.proceed(state, effects, Some(*target))
            }
            Instruction::PutField {
                object,
                field,
                value,
            } => {
                let value = self.value(state, value)?;
                let effect = match self.reference(state, object)? {
                    Reference::Null => Effect::raise(self.runtime_class(NULL_POINTER_EXCEPTION_CLASS, at)?),
                    Reference::Object(address) => {
                        Effect::unit(SymbolicStateUpdate::new().with_memory(MemoryUpdate::StoreField {
                            address,
                            field: field.clone(),
                            value,
                        }))
                    }
                };
                self.proceed(state, vec![effect], None)
            }
            Instruction::PutStatic { field, value } => {
                let value = self.value(state, value)?;
                let update = SymbolicStateUpdate::new().with_memory(MemoryUpdate::StoreStatic {
                    field: field.clone(),
                    value,
                });
                self.proceed(state, vec![Effect::unit(update)], None)
            }
            Instruction::ArrayStore {
                array,
                index,
                value,
            } => {
                let value = self.primitive(state, value)?;
                let effects = self.with_array(state, array, |address, length| {
                    let index = self.primitive(state, index)?;
                    self.index_effects(at, length, &index, |cell| {
                        Effect::unit(SymbolicStateUpdate::new().with_memory(MemoryUpdate::StoreCell {
                            address,
                            index: cell,
                            value: value.clone(),
                        }))
                    })
                })?;
                self.proceed(state, effects, None)
            }
            Instruction::If { condition, .. } => self.branch(state, condition),
            Instruction::Goto { .. } => {
                let successors = self.program.successors(at).locate(at)?;
                let target = successors.first().copied().ok_or(
                    program::Error::NoSuchInstruction { at }.into_exploration(at),
                )?;
                let edge = Edge::new(at, target, Decision::Branch(0));
                Ok(vec![state.update(edge, &SymbolicStateUpdate::new(), self.does_not_throw(state)?)?])
            }
            Instruction::Invoke { result, call } => self.invoke(state, *result, call),
            Instruction::Return { value } => {
                let value = value.as_ref().map(|v| self.value(state, v)).transpose()?;
                Ok(vec![state.pop(MethodResult::Success(value))?])
            }
            Instruction::Throw { exception } => match self.reference(state, exception)? {
                Reference::Null => {
                    let class = self.runtime_class(NULL_POINTER_EXCEPTION_CLASS, at)?;
                    self.proceed(state, vec![Effect::raise(class)], None)
                }
                Reference::Object(address) => {
                    let class = self.instance_class(state, address, at)?;
                    let failure = SymbolicFailure {
                        class,
                        object: Reference::Object(address),
                        explicit: true,
                        raised_at: at,
                    };
                    Ok(vec![state.create_exception_state(failure, &SymbolicStateUpdate::new())?])
                }
            },
            Instruction::Exit { code } => {
                let code = self.value(state, code)?;
                Ok(vec![state.pop(MethodResult::Exit(code))?])
            }
        }
    }

    /// Evaluates the right-hand side of an assignment.
    fn evaluate(&self, state: &ExecutionState, rvalue: &Rvalue) -> Result<Vec<Effect>> {
        let at = state.stmt();
        let frame = state.frame().ok_or(Error::EmptyStack.locate(at))?;
        let effects = match rvalue {
            Rvalue::Use(operand) => vec![Effect::value(self.value(state, operand)?)],
            Rvalue::Binary { op, left, right } => {
                let left = self.value(state, left)?;
                let right = self.value(state, right)?;
                self.binary(at, *op, &left, &right)?
            }
            Rvalue::Unary { op, operand } => {
                let operand = self.primitive(state, operand)?;
                vec![Effect::value(SymbolicValue::Primitive(Expression::unary(*op, operand)))]
            }
            Rvalue::Parameter(index) => {
                let value = frame
                    .parameter(*index)
                    .cloned()
                    .ok_or(Error::NoSuchParameter { index: *index }.locate(at))?;
                vec![Effect::value(value)]
            }
            Rvalue::This => {
                let receiver = frame.receiver().ok_or(
                    Error::UnexpectedValue {
                        expected: "receiver",
                        found:    "static frame".to_string(),
                    }
                    .locate(at),
                )?;
                vec![Effect::value(SymbolicValue::Reference(receiver))]
            }
            Rvalue::GetField { object, field } => match self.reference(state, object)? {
                Reference::Null => vec![Effect::raise(self.runtime_class(NULL_POINTER_EXCEPTION_CLASS, at)?)],
                Reference::Object(address) => {
                    let value = match state.symbolic().field(address, field) {
                        Some(value) => value.clone(),
                        None => self.default_field_value(field, at)?,
                    };
                    vec![Effect::value(value)]
                }
            },
            Rvalue::GetStatic(field) => {
                let (value, update) = self.read_static(state, field)?;
                vec![Effect::Continue(Some(value), update)]
            }
            Rvalue::New(class) => {
                let address = state.symbolic().next_address();
                let mut update = SymbolicStateUpdate::new().with_memory(MemoryUpdate::Allocate {
                    address,
                    kind: ObjectKind::Instance(*class),
                });
                if self.registry.is_nd_class(self.program, *class).locate(at)? {
                    let key = crate::instrumentation::storage::InstanceKey {
                        site:    at,
                        ordinal: state.symbolic().nd_site_count(at),
                    };
                    update = update.with_memory(MemoryUpdate::RegisterNdInstance { key, address });
                }
                vec![Effect::Continue(Some(SymbolicValue::object(address)), update)]
            }
            Rvalue::NewArray { length } => {
                let length = self.primitive(state, length)?;
                self.new_array(state, &length)?
            }
            Rvalue::ArrayLoad { array, index } => self.with_array(state, array, |address, length| {
                let index = self.primitive(state, index)?;
                self.index_effects(at, length, &index, |cell| {
                    let value = state
                        .symbolic()
                        .cell(address, cell)
                        .cloned()
                        .unwrap_or_else(|| Expression::int(0));
                    Effect::value(SymbolicValue::Primitive(value))
                })
            })?,
            Rvalue::ArrayLength { array } => self.with_array(state, array, |_, length| {
                Ok(vec![Effect::value(SymbolicValue::int(length))])
            })?,
        };
        Ok(effects)
    }

    /// Evaluates a binary operation, forking on a symbolic divisor.
    fn binary(
        &self,
        at: InstructionId,
        op: BinaryOp,
        left: &SymbolicValue,
        right: &SymbolicValue,
    ) -> Result<Vec<Effect>> {
        if let (Some(l), Some(r)) = (left.as_reference(), right.as_reference()) {
            let equal = l == r;
            let result = match op {
                BinaryOp::Eq => equal,
                BinaryOp::Ne => !equal,
                _ => {
                    return Err(Error::UnexpectedValue {
                        expected: "primitive operands",
                        found:    format!("{left} {} {right}", op.symbol()),
                    }
                    .locate(at))
                }
            };
            return Ok(vec![Effect::value(SymbolicValue::bool(result))]);
        }

        let left = expect_primitive(left, at)?;
        let right = expect_primitive(right, at)?;
        let result = SymbolicValue::Primitive(Expression::binary(op, left.clone(), right.clone()));
        if !op.is_division() {
            return Ok(vec![Effect::value(result)]);
        }

        let arithmetic = self.runtime_class(ARITHMETIC_EXCEPTION_CLASS, at)?;
        let effects = match right.as_constant() {
            Some(Primitive::Int(0)) => vec![Effect::raise(arithmetic)],
            Some(_) => vec![Effect::value(result)],
            None => {
                let zero = Expression::eq(right.clone(), Expression::int(0));
                vec![
                    Effect::value(result).guarded(Expression::not(zero.clone())),
                    Effect::raise(arithmetic).guarded(zero),
                ]
            }
        };
        Ok(effects)
    }

    /// Allocates an array of `length` elements, forking over a bounded set of
    /// lengths when it is symbolic.
    fn new_array(&self, state: &ExecutionState, length: &SymExpr) -> Result<Vec<Effect>> {
        let at = state.stmt();
        let negative = self.runtime_class(NEGATIVE_ARRAY_SIZE_CLASS, at)?;
        let address = state.symbolic().next_address();
        let allocate = |length: i64| {
            Effect::Continue(
                Some(SymbolicValue::object(address)),
                SymbolicStateUpdate::new().with_memory(MemoryUpdate::Allocate {
                    address,
                    kind: ObjectKind::IntArray { length },
                }),
            )
        };

        let effects = match length.as_constant() {
            Some(Primitive::Int(n)) if n < 0 => vec![Effect::raise(negative)],
            Some(Primitive::Int(n)) => vec![allocate(n)],
            Some(Primitive::Bool(_)) => {
                return Err(Error::UnexpectedValue {
                    expected: "integer length",
                    found:    length.to_string(),
                }
                .locate(at))
            }
            None => {
                let width = i64::try_from(self.config.concretisation_width).unwrap_or(i64::MAX);
                let mut effects: Vec<Effect> = (0..width)
                    .map(|n| allocate(n).guarded(Expression::eq(length.clone(), Expression::int(n))))
                    .collect();
                effects.push(Effect::raise(negative).guarded(Expression::binary(
                    BinaryOp::Lt,
                    length.clone(),
                    Expression::int(0),
                )));
                effects
            }
        };
        Ok(effects)
    }

    /// Resolves `array` to an array object and continues with `body`, raising
    /// a null pointer exception for a null array.
    fn with_array(
        &self,
        state: &ExecutionState,
        array: &Operand,
        body: impl FnOnce(Address, i64) -> Result<Vec<Effect>>,
    ) -> Result<Vec<Effect>> {
        let at = state.stmt();
        match self.reference(state, array)? {
            Reference::Null => Ok(vec![Effect::raise(
                self.runtime_class(NULL_POINTER_EXCEPTION_CLASS, at)?,
            )]),
            Reference::Object(address) => match state.symbolic().object(address) {
                Some(ObjectKind::IntArray { length }) => body(address, length),
                other => Err(Error::UnexpectedValue {
                    expected: "array",
                    found:    format!("{other:?}"),
                }
                .locate(at)),
            },
        }
    }

    /// Produces the effects of accessing cell `index` of an array of
    /// `length` elements, concretising a symbolic index to a bounded set of
    /// in-bounds cells plus the out-of-bounds case.
    fn index_effects(
        &self,
        at: InstructionId,
        length: i64,
        index: &SymExpr,
        access: impl Fn(i64) -> Effect,
    ) -> Result<Vec<Effect>> {
        let out_of_bounds = self.runtime_class(INDEX_OUT_OF_BOUNDS_CLASS, at)?;
        let effects = match index.as_constant() {
            Some(Primitive::Int(i)) if (0..length).contains(&i) => vec![access(i)],
            Some(Primitive::Int(_)) => vec![Effect::raise(out_of_bounds)],
            Some(Primitive::Bool(_)) => {
                return Err(Error::UnexpectedValue {
                    expected: "integer index",
                    found:    index.to_string(),
                }
                .locate(at))
            }
            None => {
                let width = i64::try_from(self.config.concretisation_width).unwrap_or(i64::MAX);
                let mut effects: Vec<Effect> = (0..length.min(width))
                    .map(|i| access(i).guarded(Expression::eq(index.clone(), Expression::int(i))))
                    .collect();
                let below = Expression::binary(BinaryOp::Lt, index.clone(), Expression::int(0));
                let above = Expression::binary(BinaryOp::Ge, index.clone(), Expression::int(length));
                effects.push(
                    Effect::raise(out_of_bounds).guarded(Expression::binary(BinaryOp::Or, below, above)),
                );
                effects
            }
        };
        Ok(effects)
    }

    /// Takes the conditional jump that is the current instruction of `state`.
    fn branch(&self, state: &ExecutionState, condition: &Operand) -> Result<Vec<ExecutionState>> {
        let at = state.stmt();
        let condition = self.primitive(state, condition)?;
        let successors = self.program.successors(at).locate(at)?;
        let does_not_throw = self.does_not_throw(state)?;
        let take = |index: u32, constraint: Option<SymExpr>| -> Result<ExecutionState> {
            let destination = successors
                .get(index as usize)
                .copied()
                .ok_or(program::Error::NoSuchInstruction { at }.into_exploration(at))?;
            let mut update = SymbolicStateUpdate::new();
            if let Some(constraint) = constraint {
                update = update.with_hard(constraint);
            }
            state.update(Edge::new(at, destination, Decision::Branch(index)), &update, does_not_throw)
        };

        match condition.as_constant() {
            Some(Primitive::Bool(taken)) => Ok(vec![take(u32::from(taken), None)?]),
            Some(Primitive::Int(_)) => Err(Error::UnexpectedValue {
                expected: "boolean condition",
                found:    condition.to_string(),
            }
            .locate(at)),
            None => Ok(vec![
                take(0, Some(Expression::not(condition.clone())))?.marked_fork(),
                take(1, Some(condition))?.marked_fork(),
            ]),
        }
    }

    /// Performs the call that is the current instruction of `state`.
    fn invoke(
        &self,
        state: &ExecutionState,
        result: Option<LocalId>,
        call: &Call,
    ) -> Result<Vec<ExecutionState>> {
        let at = state.stmt();
        let receiver = call
            .receiver
            .as_ref()
            .map(|r| self.reference(state, r))
            .transpose()?;
        let args = call
            .args
            .iter()
            .map(|a| self.value(state, a))
            .collect::<Result<Vec<_>>>()?;

        let target = match (call.dispatch, receiver) {
            (_, Some(Reference::Null)) => {
                let class = self.runtime_class(NULL_POINTER_EXCEPTION_CLASS, at)?;
                return self.proceed(state, vec![Effect::raise(class)], None);
            }
            (Dispatch::Virtual, Some(Reference::Object(address))) => {
                let class = self.instance_class(state, address, at)?;
                self.program.resolve_virtual(class, call.method).locate(at)?
            }
            _ => call.method,
        };

        if self.registry.is_nd_call(self.program, call.method).locate(at)? {
            let effects = self.nondeterministic(state, call, target, receiver, &args, true)?;
            return self.proceed(state, effects, result);
        }

        match &self.program.method(target).locate(at)?.body {
            MethodBody::Native(Native::NoOp) => {
                self.proceed(state, vec![Effect::unit(SymbolicStateUpdate::new())], None)
            }
            MethodBody::Native(_) => {
                let effects = self.nondeterministic(state, call, target, receiver, &args, false)?;
                self.proceed(state, effects, result)
            }
            MethodBody::Code(_) => {
                let arguments = CallArguments::new(receiver, args);
                let entry = InstructionId::entry(target);
                Ok(vec![state.push(entry, arguments, &SymbolicStateUpdate::new(), target)?])
            }
        }
    }

    /// Models a call whose result cannot be known symbolically as a fresh
    /// symbol.
    ///
    /// When `recorded` is set, the call is one the instrumentation records,
    /// and the symbol is tied to the record it will produce through an
    /// [`NdAssumption`].
    fn nondeterministic(
        &self,
        state: &ExecutionState,
        call: &Call,
        target: MethodId,
        receiver: Option<Reference>,
        args: &[SymbolicValue],
        recorded: bool,
    ) -> Result<Vec<Effect>> {
        let at = state.stmt();
        let method = self.program.method(target).locate(at)?;
        let sort = match method.returns {
            Type::Void => return Ok(vec![Effect::unit(SymbolicStateUpdate::new())]),
            Type::Int => Sort::Int,
            Type::Bool => Sort::Bool,
            other => {
                return Err(Error::UnexpectedValue {
                    expected: "primitive result of a non-deterministic call",
                    found:    format!("{other:?}"),
                }
                .locate(at))
            }
        };

        let symbol = Symbol::new(format!("nd@{at}#{}", state.path_length()), sort);
        let value = Expression::symbol(symbol.clone());
        let mut update = SymbolicStateUpdate::new();
        if recorded {
            let nd_target = match receiver {
                None => NdTarget::Static,
                Some(Reference::Object(address)) => state
                    .symbolic()
                    .nd_instance(address)
                    .map_or(NdTarget::Unregistered, NdTarget::Instance),
                Some(Reference::Null) => NdTarget::Unregistered,
            };
            let signature = self.program.signature(call.method).locate(at)?;
            let occurrence = state.symbolic().nd_call_count(nd_target, &signature);
            update = update.with_memory(MemoryUpdate::AssumeNd(NdAssumption {
                target: nd_target,
                signature,
                occurrence,
                symbol,
            }));
        }
        let produced = Effect::Continue(Some(SymbolicValue::Primitive(value.clone())), update);

        let effects = match method.native() {
            Some(Native::RandomIntBounded) => {
                let bound = args
                    .first()
                    .ok_or(Error::NoSuchParameter { index: 0 }.locate(at))
                    .and_then(|b| expect_primitive(b, at))?;
                let illegal = self.runtime_class(ILLEGAL_ARGUMENT_CLASS, at)?;
                let within = |effect: Effect| {
                    effect
                        .guarded(Expression::binary(BinaryOp::Ge, value.clone(), Expression::int(0)))
                        .guarded(Expression::binary(BinaryOp::Lt, value.clone(), bound.clone()))
                };
                match bound.as_constant() {
                    Some(Primitive::Int(b)) if b <= 0 => vec![Effect::raise(illegal)],
                    Some(_) => vec![within(produced)],
                    None => {
                        let positive =
                            Expression::binary(BinaryOp::Gt, bound.clone(), Expression::int(0));
                        vec![
                            within(produced).guarded(positive.clone()),
                            Effect::raise(illegal).guarded(Expression::not(positive)),
                        ]
                    }
                }
            }
            Some(Native::CurrentTimeMillis) => vec![produced.guarded(Expression::binary(
                BinaryOp::Ge,
                value.clone(),
                Expression::int(0),
            ))],
            _ => vec![produced],
        };
        Ok(effects)
    }

    /// Continues `state` to the next instruction with each of `effects`,
    /// assigning produced values to `target`.
    fn proceed(
        &self,
        state: &ExecutionState,
        effects: Vec<Effect>,
        target: Option<LocalId>,
    ) -> Result<Vec<ExecutionState>> {
        let at = state.stmt();
        let does_not_throw = self.does_not_throw(state)?;
        let is_fork = effects.len() > 1;
        let mut successors = Vec::with_capacity(effects.len());
        let mut branch = 0;

        for effect in effects {
            let successor = match effect {
                Effect::Continue(value, mut update) => {
                    if let (Some(target), Some(value)) = (target, value) {
                        update = update.with_local(target, value);
                    }
                    let next = self.next(at)?;
                    let edge = Edge::new(at, next, Decision::Branch(branch));
                    branch += 1;
                    state.update(edge, &update, does_not_throw)?
                }
                // Frames that must not throw have their runtime exceptions
                // pruned.
                Effect::Raise(..) if does_not_throw => continue,
                Effect::Raise(class, update) => self.raise(state, class, update)?,
            };
            successors.push(if is_fork {
                successor.marked_fork()
            } else {
                successor
            });
        }
        Ok(successors)
    }

    /// Raises a runtime exception of `class` at the current instruction.
    fn raise(
        &self,
        state: &ExecutionState,
        class: ClassId,
        update: SymbolicStateUpdate,
    ) -> Result<ExecutionState> {
        let at = state.stmt();
        let allocated = update
            .memory
            .iter()
            .filter(|m| matches!(m, MemoryUpdate::Allocate { .. }))
            .count();
        let address = Address(
            state.symbolic().next_address().0 + u32::try_from(allocated).unwrap_or(u32::MAX),
        );
        let update = update.with_memory(MemoryUpdate::Allocate {
            address,
            kind: ObjectKind::Instance(class),
        });
        let failure = SymbolicFailure {
            class,
            object: Reference::Object(address),
            explicit: false,
            raised_at: at,
        };
        state.create_exception_state(failure, &update)
    }

    /// Sends the pending `exception` of `state` to the innermost handler that
    /// catches it, or out of the current method if none does.
    fn dispatch_exception(
        &self,
        state: &ExecutionState,
        exception: &SymbolicFailure,
    ) -> Result<ExecutionState> {
        let at = state.stmt();
        for handler in self.program.handlers_for(at).locate(at)? {
            let catches = match handler.class {
                None => true,
                Some(class) => self.program.is_subclass_of(exception.class, class).locate(at)?,
            };
            if !catches {
                continue;
            }

            let mut update = SymbolicStateUpdate::new();
            if let Some(binding) = handler.binding {
                update = update.with_local(binding, SymbolicValue::Reference(exception.object));
            }
            let edge = Edge::new(at, at.at(handler.target), Decision::Exception(exception.class.0));
            return state.update(edge, &update, false);
        }

        state.pop(MethodResult::Failure(exception.clone()))
    }

    /// Consumes the result of the callee that `state` just returned from.
    fn resume(&self, state: &ExecutionState, result: &MethodResult) -> Result<ExecutionState> {
        let at = state.stmt();
        match result {
            MethodResult::Success(value) => {
                let instruction = self.program.instruction(at).locate(at)?;
                let Instruction::Invoke { result: target, .. } = instruction else {
                    return Err(Error::UnexpectedValue {
                        expected: "call instruction",
                        found:    format!("{instruction:?}"),
                    }
                    .locate(at));
                };
                let mut update = SymbolicStateUpdate::new();
                if let (Some(target), Some(value)) = (target, value) {
                    update = update.with_local(*target, value.clone());
                }
                let edge = Edge::new(at, self.next(at)?, Decision::Branch(0));
                state.update(edge, &update, false)
            }
            MethodResult::Failure(failure) => {
                state.create_exception_state(failure.clone(), &SymbolicStateUpdate::new())
            }
            MethodResult::Exit(_) => state.pop(result.clone()),
        }
    }

    /// Reads the static `field`.
    ///
    /// The first read of a static field of a trusted class uses its declared
    /// initial value. The first read of any other primitive static field
    /// makes its value an input of the method.
    fn read_static(
        &self,
        state: &ExecutionState,
        field: &FieldRef,
    ) -> Result<(SymbolicValue, SymbolicStateUpdate)> {
        let at = state.stmt();
        if let Some(value) = state.symbolic().static_value(field) {
            return Ok((value.clone(), SymbolicStateUpdate::new()));
        }

        let class = self.program.class(field.class).locate(at)?;
        let declaration = class.static_field(&field.name).ok_or(
            program::Error::NoSuchField {
                class: field.class,
                name:  field.name.clone(),
            }
            .into_exploration(at),
        )?;

        let mut update = SymbolicStateUpdate::new();
        let value = match (self.config.is_trusted(&class.name), declaration.ty) {
            (false, ty @ (Type::Int | Type::Bool)) => {
                let sort = if ty == Type::Int { Sort::Int } else { Sort::Bool };
                let symbol = Symbol::new(format!("static:{}.{}", class.name, field.name), sort);
                update = update.with_memory(MemoryUpdate::StaticInput {
                    field:  field.clone(),
                    symbol: symbol.clone(),
                });
                SymbolicValue::Primitive(Expression::symbol(symbol))
            }
            _ => SymbolicValue::from_constant(declaration.initial),
        };
        let update = update.with_memory(MemoryUpdate::StoreStatic {
            field: field.clone(),
            value: value.clone(),
        });
        Ok((value, update))
    }

    fn default_field_value(&self, field: &FieldRef, at: InstructionId) -> Result<SymbolicValue> {
        let class = self.program.class(field.class).locate(at)?;
        let declaration = class.field(&field.name).ok_or(
            program::Error::NoSuchField {
                class: field.class,
                name:  field.name.clone(),
            }
            .into_exploration(at),
        )?;
        Ok(SymbolicValue::from_constant(declaration.ty.default_constant()))
    }

    /// Checks if the method executing in the top frame of `state` must not
    /// raise runtime exceptions, which holds for the methods of trusted
    /// classes.
    fn does_not_throw(&self, state: &ExecutionState) -> Result<bool> {
        let at = state.stmt();
        let frame = state.frame().ok_or(Error::EmptyStack.locate(at))?;
        if frame.does_not_throw {
            return Ok(true);
        }
        let method = self.program.method(frame.method).locate(at)?;
        let class = self.program.class(method.class).locate(at)?;
        Ok(self.config.is_trusted(&class.name))
    }

    /// Gets the fall-through successor of `at`.
    fn next(&self, at: InstructionId) -> Result<InstructionId> {
        let successors = self.program.successors(at).locate(at)?;
        successors
            .first()
            .copied()
            .ok_or(program::Error::NoSuchInstruction { at: at.next() }.into_exploration(at))
    }

    fn runtime_class(&self, name: &str, at: InstructionId) -> Result<ClassId> {
        self.program.class_named(name).ok_or(
            program::Error::NoSuchClassName {
                name: name.to_string(),
            }
            .into_exploration(at),
        )
    }

    fn instance_class(&self, state: &ExecutionState, address: Address, at: InstructionId) -> Result<ClassId> {
        match state.symbolic().object(address) {
            Some(ObjectKind::Instance(class)) => Ok(class),
            other => Err(Error::UnexpectedValue {
                expected: "object instance",
                found:    format!("{other:?}"),
            }
            .locate(at)),
        }
    }

    fn value(&self, state: &ExecutionState, operand: &Operand) -> Result<SymbolicValue> {
        let at = state.stmt();
        match operand {
            Operand::Const(constant) => Ok(SymbolicValue::from_constant(*constant)),
            Operand::Local(local) => {
                let frame = state.frame().ok_or(Error::EmptyStack.locate(at))?;
                frame
                    .locals
                    .get(*local)
                    .cloned()
                    .ok_or(Error::UnassignedLocal { local: *local }.locate(at))
            }
        }
    }

    fn primitive(&self, state: &ExecutionState, operand: &Operand) -> Result<SymExpr> {
        let value = self.value(state, operand)?;
        expect_primitive(&value, state.stmt())
    }

    fn reference(&self, state: &ExecutionState, operand: &Operand) -> Result<Reference> {
        let value = self.value(state, operand)?;
        value.as_reference().ok_or(
            Error::UnexpectedValue {
                expected: "reference",
                found:    value.to_string(),
            }
            .locate(state.stmt()),
        )
    }
}

/// Gets the name of the symbol standing for the primitive parameter `index`
/// of type `ty` of the method under analysis.
#[must_use]
pub fn parameter_symbol(index: usize, ty: Type) -> Option<Symbol> {
    let sort = match ty {
        Type::Int => Sort::Int,
        Type::Bool => Sort::Bool,
        _ => return None,
    };
    Some(Symbol::new(format!("p{index}"), sort))
}

fn expect_primitive(value: &SymbolicValue, at: InstructionId) -> Result<SymExpr> {
    value.as_expr().cloned().ok_or(
        Error::UnexpectedValue {
            expected: "primitive",
            found:    value.to_string(),
        }
        .locate(at),
    )
}

/// Lifts program lookup failures into located exploration errors.
trait IntoExploration {
    fn into_exploration(self, at: InstructionId) -> crate::error::exploration::LocatedError;
}

impl IntoExploration for program::Error {
    fn into_exploration(self, at: InstructionId) -> crate::error::exploration::LocatedError {
        Error::Program(self).locate(at)
    }
}

#[cfg(test)]
mod test {
    use crate::{
        constant::NULL_POINTER_EXCEPTION_CLASS,
        explorer::{traverser::Traverser, Config},
        instrumentation::{registry::NdRegistry, storage::NdTarget},
        program::{
            builder::ProgramBuilder,
            instruction::BinaryOp,
            types::{Constant, InstructionId, MethodId, Type},
            Program,
            ProgramRepresentation,
        },
        state::{ExecutionState, MethodResult},
    };

    /// Runs every path of `method` to completion, breadth first.
    fn run_all(program: &Program, method: MethodId) -> anyhow::Result<Vec<ExecutionState>> {
        let registry = NdRegistry::default();
        let config = Config::default();
        let traverser = Traverser::new(program, &registry, &config);
        let mut pending = vec![traverser.entry_state(method)?];
        let mut done = vec![];
        while let Some(state) = pending.pop() {
            for child in traverser.successors(&state)? {
                if child.is_terminal() {
                    done.push(child);
                } else {
                    pending.push(child);
                }
            }
        }
        Ok(done)
    }

    #[test]
    fn random_draws_become_assumed_symbols() -> anyhow::Result<()> {
        let mut builder = ProgramBuilder::new();
        let runtime = builder.runtime().clone();
        let class = builder.class("demo.Dice");
        let method = builder
            .method(class, "roll", &[], Type::Bool)
            .statik()
            .build(|code| {
                let random = code.construct(runtime.random, runtime.random_init, &[]);
                let draw = code
                    .invoke_virtual(runtime.random_next_int_bounded, random, &[6.into()])
                    .unwrap_or_default();
                let high = code.binary(BinaryOp::Gt, draw, 3, Type::Bool);
                code.ret_value(high);
            });
        let program = builder.finish();
        let states = run_all(&program, method)?;

        assert_eq!(states.len(), 1);
        let assumptions = states[0].symbolic().nd_assumptions();
        assert_eq!(assumptions.len(), 1);
        let assumption = &assumptions[0];
        assert_eq!(assumption.signature, "java.util.Random.nextInt(int)");
        assert_eq!(assumption.occurrence, 0);
        let NdTarget::Instance(key) = assumption.target else {
            panic!("expected an instance target, found {:?}", assumption.target);
        };
        assert_eq!(key.site, InstructionId::new(method, 0));
        assert_eq!(key.ordinal, 0);
        assert_eq!(states[0].symbolic().hard_constraints().len(), 2);

        Ok(())
    }

    #[test]
    fn untrusted_statics_become_inputs() -> anyhow::Result<()> {
        let mut builder = ProgramBuilder::new();
        let class = builder.class("demo.Settings");
        let limit = builder.static_field(class, "limit", Type::Int, Constant::Int(5));
        let method = builder
            .method(class, "overLimit", &[Type::Int], Type::Bool)
            .statik()
            .build(|code| {
                let x = code.parameter(0, Type::Int);
                let first = code.get_static(&limit, Type::Int);
                let second = code.get_static(&limit, Type::Int);
                let same = code.binary(BinaryOp::Eq, first, second, Type::Bool);
                let over = code.binary(BinaryOp::Gt, x, first, Type::Bool);
                let both = code.binary(BinaryOp::And, same, over, Type::Bool);
                code.ret_value(both);
            });
        let program = builder.finish();
        let states = run_all(&program, method)?;

        assert_eq!(states.len(), 1);
        let inputs = states[0].symbolic().static_inputs();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs.get(&limit).map(|s| s.name.as_str()), Some("static:demo.Settings.limit"));

        Ok(())
    }

    #[test]
    fn null_receivers_raise_null_pointer_exceptions() -> anyhow::Result<()> {
        let mut builder = ProgramBuilder::new();
        let class = builder.class("demo.Holder");
        let value = builder.field(class, "value", Type::Int);
        let method = builder
            .method(class, "read", &[], Type::Int)
            .statik()
            .build(|code| {
                let holder = code.constant(Constant::Null, Type::Object(class));
                let result = code.get_field(holder, &value, Type::Int);
                code.ret_value(result);
            });
        let program = builder.finish();
        let npe = program.class_named(NULL_POINTER_EXCEPTION_CLASS).unwrap();
        let states = run_all(&program, method)?;

        assert_eq!(states.len(), 1);
        let Some(MethodResult::Failure(failure)) = states[0].method_result() else {
            panic!("expected a failure, found {:?}", states[0].method_result());
        };
        assert_eq!(failure.class, npe);
        assert!(!failure.explicit);

        Ok(())
    }
}
