//! This module contains the concrete interpreter that runs inside the sandbox
//! process.
//!
//! The interpreter keeps its call stack as an explicit vector of frames, so
//! deep recursion in the program turns into an implicit stack overflow
//! exception instead of overflowing the native stack. Likewise, the heap is
//! bounded and exhausting it raises an implicit out of memory error.

use std::{
    collections::{BTreeSet, HashMap},
    fmt::Display,
    time::{SystemTime, UNIX_EPOCH},
};

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{
    constant::{
        ARITHMETIC_EXCEPTION_CLASS,
        DEFAULT_SANDBOX_MAXIMUM_FRAMES,
        DEFAULT_SANDBOX_MAXIMUM_HEAP_OBJECTS,
        FINALIZER_NAME,
        ILLEGAL_ARGUMENT_CLASS,
        INDEX_OUT_OF_BOUNDS_CLASS,
        NEGATIVE_ARRAY_SIZE_CLASS,
        NULL_POINTER_EXCEPTION_CLASS,
        OUT_OF_MEMORY_CLASS,
        STACK_OVERFLOW_CLASS,
    },
    error::sandbox::{Error, Result},
    instrumentation::storage::{NdReplayLog, NdResultStorage, ObjectId},
    program::{
        instruction::{BinaryOp, Call, Dispatch, EvaluationFault, Instruction, Operand, Probe, Rvalue},
        types::{ClassId, ConcreteValue, Constant, FieldRef, InstructionId, LocalId, MethodId, Primitive},
        MethodBody,
        Native,
        Program,
        ProgramRepresentation,
    },
    sandbox::protocol::Invocation,
};

/// The limits of the interpreter.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The depth of the call stack beyond which a stack overflow is raised.
    ///
    /// Defaults to [`DEFAULT_SANDBOX_MAXIMUM_FRAMES`].
    pub maximum_frames: usize,

    /// The number of live objects beyond which an out of memory error is
    /// raised. Array lengths are bounded by the same number.
    ///
    /// Defaults to [`DEFAULT_SANDBOX_MAXIMUM_HEAP_OBJECTS`].
    pub maximum_heap_objects: usize,
}

impl Config {
    /// Sets the `maximum_frames` config parameter to `value`.
    #[must_use]
    pub fn with_maximum_frames(mut self, value: usize) -> Self {
        self.maximum_frames = value;
        self
    }

    /// Sets the `maximum_heap_objects` config parameter to `value`.
    #[must_use]
    pub fn with_maximum_heap_objects(mut self, value: usize) -> Self {
        self.maximum_heap_objects = value;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            maximum_frames:       DEFAULT_SANDBOX_MAXIMUM_FRAMES,
            maximum_heap_objects: DEFAULT_SANDBOX_MAXIMUM_HEAP_OBJECTS,
        }
    }
}

/// A runtime value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Value {
    Primitive(Primitive),
    Null,
    Object(ObjectId),
}

impl From<Constant> for Value {
    fn from(value: Constant) -> Self {
        match value {
            Constant::Int(value) => Self::Primitive(Primitive::Int(value)),
            Constant::Bool(value) => Self::Primitive(Primitive::Bool(value)),
            Constant::Null => Self::Null,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum HeapObject {
    Instance {
        class:  ClassId,
        fields: HashMap<String, Value>,
    },
    Array(Vec<i64>),
}

#[derive(Clone, Debug)]
struct Frame {
    method:   MethodId,
    pc:       u32,
    locals:   Vec<Option<Value>>,
    receiver: Option<Value>,
    args:     Vec<Value>,
}

/// An exception on its way up the call stack.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Raised {
    object:   ObjectId,
    class:    ClassId,
    explicit: bool,
}

/// The result of evaluating something that may raise a runtime exception,
/// named by its class.
type Evaluated<T> = std::result::Result<T, &'static str>;

/// What to do after an instruction.
#[derive(Clone, Debug)]
enum Action {
    Next,
    Assign(LocalId, Value),
    Jump(u32),
    Call {
        method:   MethodId,
        receiver: Option<Value>,
        args:     Vec<Value>,
    },
    Return(Option<Value>),
    Raise(Raised),
    Exit(i64),
}

/// How a run of frames ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Flow {
    Returned(Option<Value>),
    Raised(Raised),
    Exit(i64),
}

/// How an invocation ended, from the point of view of its caller.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Completion {
    Returned(ConcreteValue),
    Threw { class: String, explicit: bool },
    /// The program asked for the process to exit with the code.
    Exit(i64),
}

/// Everything observed while running one invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Execution {
    pub completion: Completion,
    pub coverage:   BTreeSet<InstructionId>,
    pub nd_log:     NdReplayLog,
}

/// Runs a single invocation of a loaded program.
///
/// Each interpreter owns its heap, its static fields and its
/// non-determinism storage, so nothing carries over between invocations.
#[derive(Debug)]
pub struct Interpreter<'p> {
    program:  &'p Program,
    config:   Config,
    heap:     Vec<HeapObject>,
    statics:  HashMap<FieldRef, Value>,
    storage:  NdResultStorage,
    coverage: BTreeSet<InstructionId>,
    replay:   Option<NdReplayLog>,
    rng:      StdRng,

    /// The out of memory error raised once the heap is full.
    out_of_memory: Option<ObjectId>,
}

impl<'p> Interpreter<'p> {
    #[must_use]
    pub fn new(program: &'p Program, config: Config) -> Self {
        Self {
            program,
            config,
            heap: Vec::new(),
            statics: HashMap::new(),
            storage: NdResultStorage::new(),
            coverage: BTreeSet::new(),
            replay: None,
            rng: StdRng::from_entropy(),
            out_of_memory: None,
        }
    }

    /// Makes non-deterministic calls return the values in `log` where it has
    /// them.
    #[must_use]
    pub fn with_replay(mut self, log: Option<NdReplayLog>) -> Self {
        self.replay = log;
        self
    }

    /// Seeds the generator behind the random natives.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Runs `invocation` and then the finalizers of every object it
    /// allocated.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the invocation names something the program does not
    /// contain, or if the program is malformed.
    pub fn run(mut self, invocation: &Invocation) -> Result<Execution> {
        let method = self
            .program
            .method_by_signature(&invocation.method)
            .map_err(rejected)?;

        for assignment in &invocation.statics {
            let class = self.program.class_named(&assignment.class).ok_or(Error::Rejected {
                message: format!("no class named {:?}", assignment.class),
            })?;
            let value = self.materialise(&assignment.value)?;
            self.statics
                .insert(FieldRef::new(class, assignment.field.clone()), value);
        }
        let receiver = invocation
            .receiver
            .as_ref()
            .map(|r| self.materialise(r))
            .transpose()?;
        let args = invocation
            .arguments
            .iter()
            .map(|a| self.materialise(a))
            .collect::<Result<Vec<_>>>()?;

        let mut flow = self.call(method, receiver, args)?;
        if !matches!(flow, Flow::Exit(_)) {
            if let Some(finalizer_flow) = self.finalize()? {
                flow = finalizer_flow;
            }
        }

        let completion = match flow {
            Flow::Returned(value) => Completion::Returned(match value {
                Some(value) => self.concrete(value)?,
                None => ConcreteValue::Void,
            }),
            Flow::Raised(raised) => Completion::Threw {
                class:    self.class_name(raised.class)?,
                explicit: raised.explicit,
            },
            Flow::Exit(code) => Completion::Exit(code),
        };

        Ok(Execution {
            completion,
            coverage: self.coverage,
            nd_log: self.storage.into_log(),
        })
    }

    /// Runs the finalizers of the objects allocated so far, in allocation
    /// order.
    ///
    /// An exception escaping a finalizer is reported as a runtime exception
    /// and stops finalization.
    fn finalize(&mut self) -> Result<Option<Flow>> {
        let allocated = self.heap.len();
        for object in 0..allocated {
            let HeapObject::Instance { class, .. } = self.heap[object] else {
                continue;
            };
            let Some(finalizer) = self.finalizer_of(class)? else {
                continue;
            };
            match self.call(finalizer, Some(Value::Object(object)), vec![])? {
                Flow::Returned(_) => {}
                Flow::Raised(raised) => {
                    return Ok(Some(Flow::Raised(Raised {
                        explicit: false,
                        ..raised
                    })))
                }
                exit @ Flow::Exit(_) => return Ok(Some(exit)),
            }
        }
        Ok(None)
    }

    fn finalizer_of(&self, class: ClassId) -> Result<Option<MethodId>> {
        let mut current = Some(class);
        while let Some(id) = current {
            let declaration = self.program.class(id).map_err(rejected)?;
            for &method in &declaration.methods {
                let candidate = self.program.method(method).map_err(rejected)?;
                if candidate.name == FINALIZER_NAME
                    && candidate.params.is_empty()
                    && !candidate.is_static
                    && candidate.code().is_some()
                {
                    return Ok(Some(method));
                }
            }
            current = declaration.superclass;
        }
        Ok(None)
    }

    /// Runs `method` to completion on a fresh stack.
    fn call(&mut self, method: MethodId, receiver: Option<Value>, args: Vec<Value>) -> Result<Flow> {
        let program = self.program;
        let mut stack = vec![self.frame(method, receiver, args)?];
        loop {
            let Some(frame) = stack.last() else {
                return Err(Error::Fault {
                    at:     InstructionId::entry(method),
                    reason: "empty call stack".to_string(),
                });
            };
            let at = InstructionId::new(frame.method, frame.pc);
            let code = program.code(frame.method).map_err(|e| fault(at, e))?;
            let instruction = code
                .instructions
                .get(frame.pc as usize)
                .ok_or_else(|| fault(at, "fell off the end of the method"))?;
            if !instruction.is_probe() {
                self.coverage
                    .insert(InstructionId::new(frame.method, code.original_index(frame.pc)));
            }

            let action = self.execute(frame, instruction, at)?;
            if let Some(flow) = self.perform(&mut stack, action, at)? {
                return Ok(flow);
            }
        }
    }

    /// Applies `action` to the stack, producing the flow that ends the run if
    /// there is one.
    fn perform(&mut self, stack: &mut Vec<Frame>, action: Action, at: InstructionId) -> Result<Option<Flow>> {
        match action {
            Action::Next => advance(stack),
            Action::Assign(target, value) => {
                if let Some(frame) = stack.last_mut() {
                    set_local(frame, target, value);
                }
                advance(stack);
            }
            Action::Jump(target) => {
                if let Some(frame) = stack.last_mut() {
                    frame.pc = target;
                }
            }
            Action::Call {
                method,
                receiver,
                args,
            } => {
                if stack.len() >= self.config.maximum_frames {
                    let raised = self.raise(STACK_OVERFLOW_CLASS, at)?;
                    return self.unwind(stack, raised);
                }
                stack.push(self.frame(method, receiver, args)?);
            }
            Action::Return(value) => {
                stack.pop();
                let Some(caller) = stack.last_mut() else {
                    return Ok(Some(Flow::Returned(value)));
                };
                let caller_at = InstructionId::new(caller.method, caller.pc);
                if let Instruction::Invoke {
                    result: Some(target),
                    ..
                } = self.program.instruction(caller_at).map_err(|e| fault(caller_at, e))?
                {
                    if let Some(value) = value {
                        set_local(caller, *target, value);
                    }
                }
                caller.pc += 1;
            }
            Action::Raise(raised) => return self.unwind(stack, raised),
            Action::Exit(code) => return Ok(Some(Flow::Exit(code))),
        }
        Ok(None)
    }

    /// Pops frames until one has a handler for `raised`.
    fn unwind(&mut self, stack: &mut Vec<Frame>, raised: Raised) -> Result<Option<Flow>> {
        while let Some(frame) = stack.last_mut() {
            let at = InstructionId::new(frame.method, frame.pc);
            for handler in self.program.handlers_for(at).map_err(|e| fault(at, e))? {
                let catches = match handler.class {
                    None => true,
                    Some(class) => self
                        .program
                        .is_subclass_of(raised.class, class)
                        .map_err(|e| fault(at, e))?,
                };
                if catches {
                    if let Some(binding) = handler.binding {
                        set_local(frame, binding, Value::Object(raised.object));
                    }
                    frame.pc = handler.target;
                    return Ok(None);
                }
            }
            stack.pop();
        }
        Ok(Some(Flow::Raised(raised)))
    }

    /// Interprets `instruction`, the current instruction of the top frame.
    fn execute(&mut self, frame: &Frame, instruction: &Instruction, at: InstructionId) -> Result<Action> {
        let action = match instruction {
            Instruction::Nop => Action::Next,
            Instruction::Probe(probe) => {
                self.probe(frame, probe, at)?;
                Action::Next
            }
            Instruction::Assign { target, value } => match self.evaluate(frame, value, at)? {
                Ok(value) => Action::Assign(*target, value),
                Err(class) => Action::Raise(self.raise(class, at)?),
            },
            Instruction::PutField {
                object,
                field,
                value,
            } => {
                let value = operand(frame, value, at)?;
                match operand(frame, object, at)? {
                    Value::Object(id) => match self.heap.get_mut(id) {
                        Some(HeapObject::Instance { fields, .. }) => {
                            fields.insert(field.name.clone(), value);
                            Action::Next
                        }
                        _ => return Err(fault(at, "field store on a non-instance")),
                    },
                    Value::Null => Action::Raise(self.raise(NULL_POINTER_EXCEPTION_CLASS, at)?),
                    Value::Primitive(p) => return Err(fault(at, format!("field store on {p}"))),
                }
            }
            Instruction::PutStatic { field, value } => {
                let value = operand(frame, value, at)?;
                self.statics.insert(field.clone(), value);
                Action::Next
            }
            Instruction::ArrayStore {
                array,
                index,
                value,
            } => {
                let index = int(frame, index, at)?;
                let value = int(frame, value, at)?;
                match self.array_mut(frame, array, at)? {
                    Ok(cells) => match usize::try_from(index).ok().and_then(|i| cells.get_mut(i)) {
                        Some(cell) => {
                            *cell = value;
                            Action::Next
                        }
                        None => Action::Raise(self.raise(INDEX_OUT_OF_BOUNDS_CLASS, at)?),
                    },
                    Err(class) => Action::Raise(self.raise(class, at)?),
                }
            }
            Instruction::If { condition, target } => match operand(frame, condition, at)? {
                Value::Primitive(Primitive::Bool(true)) => Action::Jump(*target),
                Value::Primitive(Primitive::Bool(false)) => Action::Next,
                other => return Err(fault(at, format!("branch on {other:?}"))),
            },
            Instruction::Goto { target } => Action::Jump(*target),
            Instruction::Invoke { result, call } => self.invoke(frame, *result, call, at)?,
            Instruction::Return { value } => {
                Action::Return(value.as_ref().map(|v| operand(frame, v, at)).transpose()?)
            }
            Instruction::Throw { exception } => match operand(frame, exception, at)? {
                Value::Object(object) => Action::Raise(Raised {
                    object,
                    class: self.class_of(object, at)?,
                    explicit: true,
                }),
                Value::Null => Action::Raise(self.raise(NULL_POINTER_EXCEPTION_CLASS, at)?),
                Value::Primitive(p) => return Err(fault(at, format!("throw of {p}"))),
            },
            Instruction::Exit { code } => Action::Exit(int(frame, code, at)?),
        };
        Ok(action)
    }

    /// Performs the call that is the current instruction.
    fn invoke(&mut self, frame: &Frame, result: Option<LocalId>, call: &Call, at: InstructionId) -> Result<Action> {
        let receiver = call
            .receiver
            .as_ref()
            .map(|r| operand(frame, r, at))
            .transpose()?;
        let args = call
            .args
            .iter()
            .map(|a| operand(frame, a, at))
            .collect::<Result<Vec<_>>>()?;

        let target = match (call.dispatch, receiver) {
            (_, Some(Value::Null)) => {
                return Ok(Action::Raise(self.raise(NULL_POINTER_EXCEPTION_CLASS, at)?))
            }
            (Dispatch::Virtual, Some(Value::Object(object))) => {
                let class = self.class_of(object, at)?;
                self.program
                    .resolve_virtual(class, call.method)
                    .map_err(|e| fault(at, e))?
            }
            _ => call.method,
        };

        let native = match &self.program.method(target).map_err(|e| fault(at, e))?.body {
            MethodBody::Code(_) => {
                return Ok(Action::Call {
                    method: target,
                    receiver,
                    args,
                })
            }
            MethodBody::Native(native) => *native,
        };
        let action = match self.native(native, call, receiver, &args, at)? {
            Ok(Some(value)) => match result {
                Some(target) => Action::Assign(target, value),
                None => Action::Next,
            },
            Ok(None) => Action::Next,
            Err(class) => Action::Raise(self.raise(class, at)?),
        };
        Ok(action)
    }

    /// Runs a method implemented by the runtime.
    fn native(
        &mut self,
        native: Native,
        call: &Call,
        receiver: Option<Value>,
        args: &[Value],
        at: InstructionId,
    ) -> Result<Evaluated<Option<Value>>> {
        if native == Native::NoOp {
            return Ok(Ok(None));
        }
        if native == Native::RandomIntBounded {
            let bound = match args.first() {
                Some(Value::Primitive(Primitive::Int(bound))) => *bound,
                other => return Err(fault(at, format!("random bound {other:?}"))),
            };
            if bound <= 0 {
                return Ok(Err(ILLEGAL_ARGUMENT_CLASS));
            }
        }
        if let Some(value) = self.replayed(call, receiver, at)? {
            return Ok(Ok(Some(value)));
        }

        let value = match native {
            Native::RandomInt => Primitive::Int(i64::from(self.rng.gen::<i32>())),
            Native::RandomIntBounded => {
                let bound = args
                    .first()
                    .and_then(|v| match v {
                        Value::Primitive(Primitive::Int(bound)) => Some(*bound),
                        _ => None,
                    })
                    .unwrap_or(1);
                Primitive::Int(self.rng.gen_range(0..bound))
            }
            Native::RandomBool => Primitive::Bool(self.rng.gen()),
            Native::CurrentTimeMillis => {
                let millis = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis())
                    .unwrap_or_default();
                Primitive::Int(i64::try_from(millis).unwrap_or(i64::MAX))
            }
            Native::NoOp => return Ok(Ok(None)),
        };
        Ok(Ok(Some(Value::Primitive(value))))
    }

    /// Gets the value the replay log holds for the non-deterministic call
    /// about to be recorded, if there is one.
    fn replayed(&self, call: &Call, receiver: Option<Value>, at: InstructionId) -> Result<Option<Value>> {
        let Some(log) = &self.replay else {
            return Ok(None);
        };
        if self.storage.pending_args().is_none() {
            return Ok(None);
        }

        let receiver = match receiver {
            Some(Value::Object(object)) => Some(object),
            _ => None,
        };
        let target = self.storage.target_of(receiver);
        let signature = self.program.signature(call.method).map_err(|e| fault(at, e))?;
        let occurrence = self.storage.next_occurrence(target, &signature);
        let value = match log.lookup(target, &signature, occurrence) {
            Some(ConcreteValue::Int(value)) => Some(Value::Primitive(Primitive::Int(*value))),
            Some(ConcreteValue::Bool(value)) => Some(Value::Primitive(Primitive::Bool(*value))),
            _ => None,
        };
        Ok(value)
    }

    fn probe(&mut self, frame: &Frame, probe: &Probe, at: InstructionId) -> Result<()> {
        match probe {
            Probe::NdEnter { receiver, args } => {
                let receiver = match receiver.as_ref().map(|r| operand(frame, r, at)).transpose()? {
                    Some(Value::Object(object)) => Some(object),
                    _ => None,
                };
                let args = args
                    .iter()
                    .map(|a| operand(frame, a, at).and_then(|v| self.concrete(v)))
                    .collect::<Result<Vec<_>>>()?;
                self.storage.enter(receiver, args);
            }
            Probe::NdRecord {
                signature,
                result,
                is_static,
            } => {
                let value = local(frame, *result, at)?;
                let value = self.concrete(value)?;
                self.storage.record(signature, *is_static, value);
            }
            Probe::NdRegisterInstance { site, object } => {
                if let Value::Object(object) = local(frame, *object, at)? {
                    self.storage.register_instance(*site, object);
                }
            }
        }
        Ok(())
    }

    /// Evaluates the right-hand side of an assignment.
    fn evaluate(&mut self, frame: &Frame, rvalue: &Rvalue, at: InstructionId) -> Result<Evaluated<Value>> {
        let value = match rvalue {
            Rvalue::Use(value) => operand(frame, value, at)?,
            Rvalue::Binary { op, left, right } => {
                let left = operand(frame, left, at)?;
                let right = operand(frame, right, at)?;
                match (left, right) {
                    (Value::Primitive(l), Value::Primitive(r)) => match op.apply(l, r) {
                        Ok(value) => Value::Primitive(value),
                        Err(EvaluationFault::DivisionByZero) => return Ok(Err(ARITHMETIC_EXCEPTION_CLASS)),
                        Err(e) => return Err(fault(at, e)),
                    },
                    (l, r) if *op == BinaryOp::Eq => Value::Primitive(Primitive::Bool(l == r)),
                    (l, r) if *op == BinaryOp::Ne => Value::Primitive(Primitive::Bool(l != r)),
                    (l, r) => return Err(fault(at, format!("{l:?} {} {r:?}", op.symbol()))),
                }
            }
            Rvalue::Unary { op, operand: value } => match operand(frame, value, at)? {
                Value::Primitive(p) => Value::Primitive(op.apply(p).map_err(|e| fault(at, e))?),
                other => return Err(fault(at, format!("{}{other:?}", op.symbol()))),
            },
            Rvalue::Parameter(index) => *frame
                .args
                .get(*index as usize)
                .ok_or_else(|| fault(at, format!("no parameter {index}")))?,
            Rvalue::This => frame.receiver.ok_or_else(|| fault(at, "no receiver"))?,
            Rvalue::GetField { object, field } => match operand(frame, object, at)? {
                Value::Null => return Ok(Err(NULL_POINTER_EXCEPTION_CLASS)),
                Value::Object(id) => match self.heap.get(id) {
                    Some(HeapObject::Instance { fields, .. }) => match fields.get(&field.name) {
                        Some(value) => *value,
                        None => self.default_field(field, at)?,
                    },
                    _ => return Err(fault(at, "field load from a non-instance")),
                },
                Value::Primitive(p) => return Err(fault(at, format!("field load from {p}"))),
            },
            Rvalue::GetStatic(field) => self.static_value(field, at)?,
            Rvalue::New(class) => {
                let object = HeapObject::Instance {
                    class:  *class,
                    fields: HashMap::new(),
                };
                match self.allocate(object) {
                    Ok(id) => Value::Object(id),
                    Err(class) => return Ok(Err(class)),
                }
            }
            Rvalue::NewArray { length } => {
                let length = int(frame, length, at)?;
                let Ok(length) = usize::try_from(length) else {
                    return Ok(Err(NEGATIVE_ARRAY_SIZE_CLASS));
                };
                if length > self.config.maximum_heap_objects {
                    return Ok(Err(OUT_OF_MEMORY_CLASS));
                }
                match self.allocate(HeapObject::Array(vec![0; length])) {
                    Ok(id) => Value::Object(id),
                    Err(class) => return Ok(Err(class)),
                }
            }
            Rvalue::ArrayLoad { array, index } => {
                let index = int(frame, index, at)?;
                match self.array_mut(frame, array, at)? {
                    Ok(cells) => match usize::try_from(index).ok().and_then(|i| cells.get(i)) {
                        Some(cell) => Value::Primitive(Primitive::Int(*cell)),
                        None => return Ok(Err(INDEX_OUT_OF_BOUNDS_CLASS)),
                    },
                    Err(class) => return Ok(Err(class)),
                }
            }
            Rvalue::ArrayLength { array } => match self.array_mut(frame, array, at)? {
                Ok(cells) => Value::Primitive(Primitive::Int(i64::try_from(cells.len()).unwrap_or(i64::MAX))),
                Err(class) => return Ok(Err(class)),
            },
        };
        Ok(Ok(value))
    }

    /// Resolves `array` to the cells of an array object.
    fn array_mut(&mut self, frame: &Frame, array: &Operand, at: InstructionId) -> Result<Evaluated<&mut Vec<i64>>> {
        match operand(frame, array, at)? {
            Value::Null => Ok(Err(NULL_POINTER_EXCEPTION_CLASS)),
            Value::Object(id) => match self.heap.get_mut(id) {
                Some(HeapObject::Array(cells)) => Ok(Ok(cells)),
                _ => Err(fault(at, "array access on a non-array")),
            },
            Value::Primitive(p) => Err(fault(at, format!("array access on {p}"))),
        }
    }

    fn static_value(&mut self, field: &FieldRef, at: InstructionId) -> Result<Value> {
        if let Some(value) = self.statics.get(field) {
            return Ok(*value);
        }
        let class = self.program.class(field.class).map_err(|e| fault(at, e))?;
        let declaration = class
            .static_field(&field.name)
            .ok_or_else(|| fault(at, format!("no static field {field}")))?;
        let value = Value::from(declaration.initial);
        self.statics.insert(field.clone(), value);
        Ok(value)
    }

    fn default_field(&self, field: &FieldRef, at: InstructionId) -> Result<Value> {
        let class = self.program.class(field.class).map_err(|e| fault(at, e))?;
        let declaration = class
            .field(&field.name)
            .ok_or_else(|| fault(at, format!("no field {field}")))?;
        Ok(Value::from(declaration.ty.default_constant()))
    }

    /// Allocates `object`, raising an out of memory error when the heap is
    /// full.
    fn allocate(&mut self, object: HeapObject) -> Evaluated<ObjectId> {
        if self.heap.len() >= self.config.maximum_heap_objects {
            return Err(OUT_OF_MEMORY_CLASS);
        }
        self.heap.push(object);
        Ok(self.heap.len() - 1)
    }

    /// Allocates a runtime exception of the class called `class`.
    ///
    /// When the heap is full, an out of memory error is raised instead. All
    /// such errors share one object, so raising never grows the heap past one
    /// object over its limit.
    fn raise(&mut self, class: &str, at: InstructionId) -> Result<Raised> {
        let program = self.program;
        let lookup = |name: &str| {
            program
                .class_named(name)
                .ok_or_else(|| fault(at, format!("no runtime class {name}")))
        };
        let class = lookup(class)?;
        let object = HeapObject::Instance {
            class,
            fields: HashMap::new(),
        };
        if let Ok(object) = self.allocate(object) {
            return Ok(Raised {
                object,
                class,
                explicit: false,
            });
        }

        let class = lookup(OUT_OF_MEMORY_CLASS)?;
        let object = match self.out_of_memory {
            Some(object) => object,
            None => {
                self.heap.push(HeapObject::Instance {
                    class,
                    fields: HashMap::new(),
                });
                *self.out_of_memory.insert(self.heap.len() - 1)
            }
        };
        Ok(Raised {
            object,
            class,
            explicit: false,
        })
    }

    fn frame(&self, method: MethodId, receiver: Option<Value>, args: Vec<Value>) -> Result<Frame> {
        let at = InstructionId::entry(method);
        let code = self.program.code(method).map_err(|e| fault(at, e))?;
        Ok(Frame {
            method,
            pc: 0,
            locals: vec![None; code.locals.len()],
            receiver,
            args,
        })
    }

    /// Creates the runtime value for a value sent by the generator.
    fn materialise(&mut self, value: &ConcreteValue) -> Result<Value> {
        let value = match value {
            ConcreteValue::Int(value) => Value::Primitive(Primitive::Int(*value)),
            ConcreteValue::Bool(value) => Value::Primitive(Primitive::Bool(*value)),
            ConcreteValue::Null | ConcreteValue::Void => Value::Null,
            ConcreteValue::Object { class } => {
                let class = self.program.class_named(class).ok_or(Error::Rejected {
                    message: format!("no class named {class:?}"),
                })?;
                self.allocate_input(HeapObject::Instance {
                    class,
                    fields: HashMap::new(),
                })?
            }
            ConcreteValue::Array { length } => {
                let length = usize::try_from(*length).map_err(|_| Error::Rejected {
                    message: format!("negative array length {length}"),
                })?;
                if length > self.config.maximum_heap_objects {
                    return Err(heap_exhausted(self.config.maximum_heap_objects));
                }
                self.allocate_input(HeapObject::Array(vec![0; length]))?
            }
        };
        Ok(value)
    }

    /// Allocates an input object, rejecting the invocation if the heap has no
    /// room for it.
    fn allocate_input(&mut self, object: HeapObject) -> Result<Value> {
        self.allocate(object)
            .map(Value::Object)
            .map_err(|_| heap_exhausted(self.config.maximum_heap_objects))
    }

    /// Describes a runtime value for the generator.
    fn concrete(&self, value: Value) -> Result<ConcreteValue> {
        let value = match value {
            Value::Primitive(p) => ConcreteValue::from(p),
            Value::Null => ConcreteValue::Null,
            Value::Object(id) => match self.heap.get(id) {
                Some(HeapObject::Instance { class, .. }) => ConcreteValue::Object {
                    class: self.class_name(*class)?,
                },
                Some(HeapObject::Array(cells)) => ConcreteValue::Array {
                    length: i64::try_from(cells.len()).unwrap_or(i64::MAX),
                },
                None => ConcreteValue::Null,
            },
        };
        Ok(value)
    }

    fn class_name(&self, class: ClassId) -> Result<String> {
        Ok(self.program.class(class).map_err(rejected)?.name.clone())
    }

    fn class_of(&self, object: ObjectId, at: InstructionId) -> Result<ClassId> {
        match self.heap.get(object) {
            Some(HeapObject::Instance { class, .. }) => Ok(*class),
            _ => Err(fault(at, "expected an object instance")),
        }
    }
}

fn advance(stack: &mut [Frame]) {
    if let Some(frame) = stack.last_mut() {
        frame.pc += 1;
    }
}

fn set_local(frame: &mut Frame, local: LocalId, value: Value) {
    let index = local.0 as usize;
    if frame.locals.len() <= index {
        frame.locals.resize(index + 1, None);
    }
    frame.locals[index] = Some(value);
}

fn local(frame: &Frame, local: LocalId, at: InstructionId) -> Result<Value> {
    frame
        .locals
        .get(local.0 as usize)
        .copied()
        .flatten()
        .ok_or_else(|| fault(at, format!("local {local} is unassigned")))
}

fn operand(frame: &Frame, operand: &Operand, at: InstructionId) -> Result<Value> {
    match operand {
        Operand::Const(constant) => Ok(Value::from(*constant)),
        Operand::Local(id) => local(frame, *id, at),
    }
}

fn int(frame: &Frame, value: &Operand, at: InstructionId) -> Result<i64> {
    match operand(frame, value, at)? {
        Value::Primitive(Primitive::Int(value)) => Ok(value),
        other => Err(fault(at, format!("expected an integer, found {other:?}"))),
    }
}

fn fault(at: InstructionId, reason: impl Display) -> Error {
    Error::Fault {
        at,
        reason: reason.to_string(),
    }
}

fn rejected(error: impl Display) -> Error {
    Error::Rejected {
        message: error.to_string(),
    }
}

fn heap_exhausted(limit: usize) -> Error {
    Error::Rejected {
        message: format!("the inputs do not fit in a heap of {limit} objects"),
    }
}

#[cfg(test)]
mod test {
    use crate::{
        instrumentation::{
            storage::{NdRecord, NdReplayLog, NdTarget},
            Instrumenter,
        },
        program::{
            builder::ProgramBuilder,
            instruction::{BinaryOp, Dispatch},
            types::{ConcreteValue, InstructionId, MethodId, Type},
            Program,
            ProgramRepresentation,
        },
        sandbox::{
            interpreter::{Completion, Config, Execution, Interpreter},
            protocol::Invocation,
        },
    };

    fn invoke(program: &Program, method: MethodId, arguments: Vec<ConcreteValue>) -> anyhow::Result<Execution> {
        invoke_with(program, method, arguments, Config::default(), None)
    }

    fn invoke_with(
        program: &Program,
        method: MethodId,
        arguments: Vec<ConcreteValue>,
        config: Config,
        replay: Option<NdReplayLog>,
    ) -> anyhow::Result<Execution> {
        let invocation = Invocation {
            method: program.signature(method)?,
            receiver: None,
            arguments,
            statics: vec![],
            timeout_ms: 1_000,
            replay: None,
        };
        Ok(Interpreter::new(program, config)
            .with_seed(7)
            .with_replay(replay)
            .run(&invocation)?)
    }

    fn reciprocal() -> (Program, MethodId) {
        let mut builder = ProgramBuilder::new();
        let class = builder.class("demo.Maths");
        let method = builder
            .method(class, "reciprocal", &[Type::Int], Type::Int)
            .statik()
            .build(|code| {
                let x = code.parameter(0, Type::Int);
                let result = code.binary(BinaryOp::Div, 100, x, Type::Int);
                code.ret_value(result);
            });
        (builder.finish(), method)
    }

    #[test]
    fn division_by_zero_is_raised_by_the_runtime() -> anyhow::Result<()> {
        let (program, method) = reciprocal();

        let execution = invoke(&program, method, vec![ConcreteValue::Int(4)])?;
        assert_eq!(execution.completion, Completion::Returned(ConcreteValue::Int(25)));

        let execution = invoke(&program, method, vec![ConcreteValue::Int(0)])?;
        assert_eq!(execution.completion, Completion::Threw {
            class:    "java.lang.ArithmeticException".to_string(),
            explicit: false,
        });
        assert!(execution.coverage.contains(&InstructionId::new(method, 1)));
        assert!(!execution.coverage.contains(&InstructionId::new(method, 2)));

        Ok(())
    }

    #[test]
    fn unbounded_recursion_overflows_the_frame_stack() -> anyhow::Result<()> {
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
        let program = builder.finish();
        let config = Config::default().with_maximum_frames(64);
        let execution = invoke_with(&program, method, vec![ConcreteValue::Int(1)], config, None)?;

        assert_eq!(execution.completion, Completion::Threw {
            class:    "java.lang.StackOverflowError".to_string(),
            explicit: false,
        });

        Ok(())
    }

    #[test]
    fn catching_runtime_exceptions_in_a_loop_exhausts_the_heap() -> anyhow::Result<()> {
        let mut builder = ProgramBuilder::new();
        let arithmetic = builder.runtime().arithmetic_exception;
        let class = builder.class("demo.Stubborn");
        let method = builder
            .method(class, "retry", &[Type::Int], Type::Int)
            .statik()
            .build(|code| {
                let start = code.label();
                let end = code.label();
                let catch = code.label();
                let x = code.parameter(0, Type::Int);
                code.bind(start);
                let result = code.binary(BinaryOp::Div, 1, x, Type::Int);
                code.bind(end);
                code.ret_value(result);
                code.bind(catch);
                code.goto(start);
                code.handler(start, end, catch, Some(arithmetic), None);
            });
        let program = builder.finish();
        let config = Config::default().with_maximum_heap_objects(16);
        let execution = invoke_with(&program, method, vec![ConcreteValue::Int(0)], config, None)?;

        assert_eq!(execution.completion, Completion::Threw {
            class:    "java.lang.OutOfMemoryError".to_string(),
            explicit: false,
        });

        Ok(())
    }

    #[test]
    fn inputs_larger_than_the_heap_are_rejected() -> anyhow::Result<()> {
        let mut builder = ProgramBuilder::new();
        let class = builder.class("demo.Arrays");
        let method = builder
            .method(class, "length", &[Type::IntArray], Type::Int)
            .statik()
            .build(|code| {
                let array = code.parameter(0, Type::IntArray);
                let length = code.array_length(array);
                code.ret_value(length);
            });
        let program = builder.finish();
        let config = Config::default().with_maximum_heap_objects(16);

        let execution = invoke_with(
            &program,
            method,
            vec![ConcreteValue::Array { length: 4 }],
            config.clone(),
            None,
        )?;
        assert_eq!(execution.completion, Completion::Returned(ConcreteValue::Int(4)));

        let error = invoke_with(&program, method, vec![ConcreteValue::Array { length: 17 }], config, None)
            .unwrap_err();
        assert!(error.to_string().contains("do not fit"), "{error}");

        Ok(())
    }

    #[test]
    fn a_throwing_finalizer_is_an_implicit_exception() -> anyhow::Result<()> {
        let mut builder = ProgramBuilder::new();
        let runtime = builder.runtime().clone();
        let class = builder.class("demo.Resource");
        builder
            .method(class, "finalize", &[], Type::Void)
            .build(|code| {
                let error = code.construct(runtime.runtime_exception, runtime.throwable_init, &[]);
                code.throw(error);
            });
        let method = builder
            .method(class, "open", &[], Type::Int)
            .statik()
            .build(|code| {
                code.construct(class, runtime.object_init, &[]);
                code.ret_value(1);
            });
        let program = builder.finish();
        let execution = invoke(&program, method, vec![])?;

        assert_eq!(execution.completion, Completion::Threw {
            class:    "java.lang.RuntimeException".to_string(),
            explicit: false,
        });

        Ok(())
    }

    #[test]
    fn exits_are_reported_to_the_caller() -> anyhow::Result<()> {
        let mut builder = ProgramBuilder::new();
        let class = builder.class("demo.Quitter");
        let method = builder
            .method(class, "quit", &[], Type::Void)
            .statik()
            .build(|code| code.exit(3));
        let program = builder.finish();

        assert_eq!(invoke(&program, method, vec![])?.completion, Completion::Exit(3));

        Ok(())
    }

    #[test]
    fn non_deterministic_values_are_recorded_and_replayed() -> anyhow::Result<()> {
        let mut builder = ProgramBuilder::new();
        let runtime = builder.runtime().clone();
        let class = builder.class("demo.Dice");
        let method = builder
            .method(class, "roll", &[], Type::Int)
            .statik()
            .build(|code| {
                let random = code.construct(runtime.random, runtime.random_init, &[]);
                let draw = code
                    .invoke_virtual(runtime.random_next_int_bounded, random, &[6.into()])
                    .unwrap_or_default();
                code.call_discarding(runtime.random_next_int, Dispatch::Virtual, Some(random.into()), &[]);
                code.ret_value(draw);
            });
        let program = Instrumenter::default().instrument(&builder.finish())?;

        let recorded = invoke(&program, method, vec![])?;
        assert_eq!(recorded.nd_log.len(), 2);
        let Completion::Returned(ConcreteValue::Int(draw)) = recorded.completion else {
            panic!("expected a value, found {:?}", recorded.completion);
        };
        assert!((0..6).contains(&draw));
        let first = &recorded.nd_log.records[0];
        assert!(matches!(first.target, NdTarget::Instance(key) if key.site == InstructionId::new(method, 0)));
        assert_eq!(first.value, ConcreteValue::Int(draw));

        let replay = NdReplayLog {
            records: vec![NdRecord {
                value: ConcreteValue::Int(5),
                ..first.clone()
            }],
        };
        let replayed = invoke_with(&program, method, vec![], Config::default(), Some(replay))?;
        assert_eq!(replayed.completion, Completion::Returned(ConcreteValue::Int(5)));

        Ok(())
    }
}
