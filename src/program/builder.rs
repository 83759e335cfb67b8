//! This module contains a builder for assembling [`Program`]s by hand.
//!
//! Every program built this way contains the runtime classes that the
//! generator knows about (the exception hierarchy, the pseudo-random number
//! generator and the system clock), described by [`Runtime`].

use crate::{
    constant::{
        ARITHMETIC_EXCEPTION_CLASS,
        CONSTRUCTOR_NAME,
        ILLEGAL_ARGUMENT_CLASS,
        INDEX_OUT_OF_BOUNDS_CLASS,
        NEGATIVE_ARRAY_SIZE_CLASS,
        NULL_POINTER_EXCEPTION_CLASS,
        OBJECT_CLASS,
        OUT_OF_MEMORY_CLASS,
        RANDOM_CLASS,
        RUNTIME_EXCEPTION_CLASS,
        STACK_OVERFLOW_CLASS,
        SYSTEM_CLASS,
        THROWABLE_CLASS,
    },
    program::{
        instruction::{BinaryOp, Call, Dispatch, Instruction, Operand, Rvalue, UnaryOp},
        types::{ClassId, Constant, FieldRef, LocalId, MethodId, Type},
        Class,
        Code,
        FieldDecl,
        Handler,
        Method,
        MethodBody,
        Native,
        Program,
        StaticDecl,
    },
};

/// The identifiers of the runtime classes and methods present in every built
/// program.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Runtime {
    pub object:                  ClassId,
    pub throwable:               ClassId,
    pub runtime_exception:       ClassId,
    pub arithmetic_exception:    ClassId,
    pub null_pointer_exception:  ClassId,
    pub index_out_of_bounds:     ClassId,
    pub negative_array_size:     ClassId,
    pub illegal_argument:        ClassId,
    pub stack_overflow:          ClassId,
    pub out_of_memory:           ClassId,
    pub random:                  ClassId,
    pub system:                  ClassId,
    pub object_init:             MethodId,
    pub throwable_init:          MethodId,
    pub random_init:             MethodId,
    pub random_next_int:         MethodId,
    pub random_next_int_bounded: MethodId,
    pub random_next_boolean:     MethodId,
    pub current_time_millis:     MethodId,
}

/// A builder for [`Program`]s.
#[derive(Clone, Debug)]
pub struct ProgramBuilder {
    classes: Vec<Class>,
    methods: Vec<Method>,
    runtime: Runtime,
}

impl ProgramBuilder {
    /// Creates a new builder containing only the runtime classes.
    #[must_use]
    pub fn new() -> Self {
        let mut builder = Self {
            classes: vec![],
            methods: vec![],
            runtime: Runtime::default(),
        };

        let object = builder.add_class(OBJECT_CLASS, None);
        let throwable = builder.class_extending(THROWABLE_CLASS, object);
        let runtime_exception = builder.class_extending(RUNTIME_EXCEPTION_CLASS, throwable);
        let arithmetic_exception =
            builder.class_extending(ARITHMETIC_EXCEPTION_CLASS, runtime_exception);
        let null_pointer_exception =
            builder.class_extending(NULL_POINTER_EXCEPTION_CLASS, runtime_exception);
        let index_out_of_bounds =
            builder.class_extending(INDEX_OUT_OF_BOUNDS_CLASS, runtime_exception);
        let negative_array_size =
            builder.class_extending(NEGATIVE_ARRAY_SIZE_CLASS, runtime_exception);
        let illegal_argument = builder.class_extending(ILLEGAL_ARGUMENT_CLASS, runtime_exception);
        let stack_overflow = builder.class_extending(STACK_OVERFLOW_CLASS, throwable);
        let out_of_memory = builder.class_extending(OUT_OF_MEMORY_CLASS, throwable);
        let random = builder.class_extending(RANDOM_CLASS, object);
        let system = builder.class_extending(SYSTEM_CLASS, object);

        let object_init = builder
            .method(object, CONSTRUCTOR_NAME, &[], Type::Void)
            .native(Native::NoOp);
        let throwable_init = builder
            .method(throwable, CONSTRUCTOR_NAME, &[], Type::Void)
            .native(Native::NoOp);
        let random_init = builder
            .method(random, CONSTRUCTOR_NAME, &[], Type::Void)
            .native(Native::NoOp);
        let random_next_int = builder
            .method(random, "nextInt", &[], Type::Int)
            .native(Native::RandomInt);
        let random_next_int_bounded = builder
            .method(random, "nextInt", &[Type::Int], Type::Int)
            .native(Native::RandomIntBounded);
        let random_next_boolean = builder
            .method(random, "nextBoolean", &[], Type::Bool)
            .native(Native::RandomBool);
        let current_time_millis = builder
            .method(system, "currentTimeMillis", &[], Type::Int)
            .statik()
            .native(Native::CurrentTimeMillis);

        builder.runtime = Runtime {
            object,
            throwable,
            runtime_exception,
            arithmetic_exception,
            null_pointer_exception,
            index_out_of_bounds,
            negative_array_size,
            illegal_argument,
            stack_overflow,
            out_of_memory,
            random,
            system,
            object_init,
            throwable_init,
            random_init,
            random_next_int,
            random_next_int_bounded,
            random_next_boolean,
            current_time_millis,
        };
        builder
    }

    /// Gets the identifiers of the runtime classes and methods.
    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Adds a class called `name` that directly extends the root class.
    pub fn class(&mut self, name: impl Into<String>) -> ClassId {
        let object = self.runtime.object;
        self.class_extending(name, object)
    }

    /// Adds a class called `name` that extends `superclass`.
    pub fn class_extending(&mut self, name: impl Into<String>, superclass: ClassId) -> ClassId {
        self.add_class(name, Some(superclass))
    }

    fn add_class(&mut self, name: impl Into<String>, superclass: Option<ClassId>) -> ClassId {
        let id = ClassId(index_u32(self.classes.len()));
        self.classes.push(Class {
            id,
            name: name.into(),
            superclass,
            fields: vec![],
            statics: vec![],
            methods: vec![],
        });
        id
    }

    /// Declares an instance field `name` of type `ty` on `class`.
    ///
    /// # Panics
    ///
    /// Panics if `class` was not created by this builder.
    pub fn field(&mut self, class: ClassId, name: impl Into<String>, ty: Type) -> FieldRef {
        let name = name.into();
        self.classes[class.0 as usize].fields.push(FieldDecl {
            name: name.clone(),
            ty,
        });
        FieldRef::new(class, name)
    }

    /// Declares a static field `name` of type `ty` on `class`, whose static
    /// initializer assigns it `initial`.
    ///
    /// # Panics
    ///
    /// Panics if `class` was not created by this builder.
    pub fn static_field(
        &mut self,
        class: ClassId,
        name: impl Into<String>,
        ty: Type,
        initial: Constant,
    ) -> FieldRef {
        let name = name.into();
        self.classes[class.0 as usize].statics.push(StaticDecl {
            name: name.clone(),
            ty,
            initial,
        });
        FieldRef::new(class, name)
    }

    /// Starts building a method `name` on `class`.
    pub fn method(
        &mut self,
        class: ClassId,
        name: impl Into<String>,
        params: &[Type],
        returns: Type,
    ) -> MethodBuilder<'_> {
        MethodBuilder {
            builder: self,
            class,
            name: name.into(),
            params: params.to_vec(),
            returns,
            is_static: false,
        }
    }

    /// Provides the body of a method previously created with
    /// [`MethodBuilder::declare`].
    ///
    /// # Panics
    ///
    /// Panics if `method` was not created by this builder.
    pub fn define(&mut self, method: MethodId, body: impl FnOnce(&mut CodeBuilder)) {
        let code = self.assemble(method, body);
        self.methods[method.0 as usize].body = MethodBody::Code(code);
    }

    fn assemble(&self, method: MethodId, body: impl FnOnce(&mut CodeBuilder)) -> Code {
        let target = &self.methods[method.0 as usize];
        let mut code = CodeBuilder::new(
            target.returns,
            self.methods.iter().map(|m| m.returns).collect(),
        );
        body(&mut code);
        code.finish()
    }

    fn add_method(
        &mut self,
        class: ClassId,
        name: String,
        params: Vec<Type>,
        returns: Type,
        is_static: bool,
        body: MethodBody,
    ) -> MethodId {
        let id = MethodId(index_u32(self.methods.len()));
        self.methods.push(Method {
            id,
            class,
            name,
            params,
            returns,
            is_static,
            body,
        });
        self.classes[class.0 as usize].methods.push(id);
        id
    }

    /// Finishes building, producing the program.
    #[must_use]
    pub fn finish(self) -> Program {
        Program::new(self.classes, self.methods)
    }
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A builder for a single method, created by [`ProgramBuilder::method`].
#[derive(Debug)]
pub struct MethodBuilder<'a> {
    builder:   &'a mut ProgramBuilder,
    class:     ClassId,
    name:      String,
    params:    Vec<Type>,
    returns:   Type,
    is_static: bool,
}

impl<'a> MethodBuilder<'a> {
    /// Makes the method static.
    #[must_use]
    pub fn statik(mut self) -> Self {
        self.is_static = true;
        self
    }

    /// Finishes the method as one implemented by the runtime.
    pub fn native(self, native: Native) -> MethodId {
        self.builder.add_method(
            self.class,
            self.name,
            self.params,
            self.returns,
            self.is_static,
            MethodBody::Native(native),
        )
    }

    /// Finishes the method with an empty body that can later be provided with
    /// [`ProgramBuilder::define`], allowing (mutually) recursive methods.
    pub fn declare(self) -> MethodId {
        let empty = CodeBuilder::new(self.returns, vec![]).finish();
        self.builder.add_method(
            self.class,
            self.name,
            self.params,
            self.returns,
            self.is_static,
            MethodBody::Code(empty),
        )
    }

    /// Finishes the method with the body assembled by `body`.
    pub fn build(self, body: impl FnOnce(&mut CodeBuilder)) -> MethodId {
        let MethodBuilder {
            builder,
            class,
            name,
            params,
            returns,
            is_static,
        } = self;
        let empty = CodeBuilder::new(returns, vec![]).finish();
        let id = builder.add_method(class, name, params, returns, is_static, MethodBody::Code(empty));
        builder.define(id, body);
        id
    }
}

/// A forward-referenceable position in a method body.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Label(usize);

/// A builder for the body of a method.
///
/// Locals are allocated on demand by the instructions that produce values.
/// Bodies of `void` methods that do not end in a terminator get an implicit
/// `return`.
#[derive(Clone, Debug)]
pub struct CodeBuilder {
    returns:      Type,
    method_types: Vec<Type>,
    instructions: Vec<Instruction>,
    locals:       Vec<Type>,
    labels:       Vec<Option<u32>>,
    fixups:       Vec<(usize, Label)>,
    handlers:     Vec<(Label, Label, Label, Option<ClassId>, Option<LocalId>)>,
}

impl CodeBuilder {
    fn new(returns: Type, method_types: Vec<Type>) -> Self {
        Self {
            returns,
            method_types,
            instructions: vec![],
            locals: vec![],
            labels: vec![],
            fixups: vec![],
            handlers: vec![],
        }
    }

    /// Gets the index the next emitted instruction will have.
    #[must_use]
    pub fn position(&self) -> u32 {
        index_u32(self.instructions.len())
    }

    fn emit(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    /// Allocates a fresh local of type `ty`.
    pub fn local(&mut self, ty: Type) -> LocalId {
        let id = LocalId(index_u32(self.locals.len()));
        self.locals.push(ty);
        id
    }

    /// Emits `target = value`.
    pub fn assign(&mut self, target: LocalId, value: Rvalue) {
        self.emit(Instruction::Assign { target, value });
    }

    fn assign_fresh(&mut self, ty: Type, value: Rvalue) -> LocalId {
        let target = self.local(ty);
        self.assign(target, value);
        target
    }

    /// Copies parameter `index` into a fresh local.
    pub fn parameter(&mut self, index: u32, ty: Type) -> LocalId {
        self.assign_fresh(ty, Rvalue::Parameter(index))
    }

    /// Copies the receiver into a fresh local.
    pub fn this(&mut self, class: ClassId) -> LocalId {
        self.assign_fresh(Type::Object(class), Rvalue::This)
    }

    /// Copies `value` into a fresh local.
    pub fn constant(&mut self, value: impl Into<Operand>, ty: Type) -> LocalId {
        self.assign_fresh(ty, Rvalue::Use(value.into()))
    }

    /// Emits `target = value` for an existing local.
    pub fn set(&mut self, target: LocalId, value: impl Into<Operand>) {
        self.assign(target, Rvalue::Use(value.into()));
    }

    /// Evaluates `left op right` into a fresh local of type `ty`.
    pub fn binary(
        &mut self,
        op: BinaryOp,
        left: impl Into<Operand>,
        right: impl Into<Operand>,
        ty: Type,
    ) -> LocalId {
        self.assign_fresh(ty, Rvalue::Binary {
            op,
            left: left.into(),
            right: right.into(),
        })
    }

    /// Evaluates `op operand` into a fresh local of type `ty`.
    pub fn unary(&mut self, op: UnaryOp, operand: impl Into<Operand>, ty: Type) -> LocalId {
        self.assign_fresh(ty, Rvalue::Unary {
            op,
            operand: operand.into(),
        })
    }

    /// Creates a new, unbound label.
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds `label` to the position of the next emitted instruction.
    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.position());
    }

    /// Jumps to `label` if `condition` holds.
    pub fn branch_if(&mut self, condition: impl Into<Operand>, label: Label) {
        self.fixups.push((self.instructions.len(), label));
        self.emit(Instruction::If {
            condition: condition.into(),
            target:    u32::MAX,
        });
    }

    /// Jumps to `label` unconditionally.
    pub fn goto(&mut self, label: Label) {
        self.fixups.push((self.instructions.len(), label));
        self.emit(Instruction::Goto { target: u32::MAX });
    }

    fn invoke(
        &mut self,
        method: MethodId,
        dispatch: Dispatch,
        receiver: Option<Operand>,
        args: &[Operand],
    ) -> Option<LocalId> {
        let returns = self
            .method_types
            .get(method.0 as usize)
            .copied()
            .unwrap_or(Type::Void);
        let result = (returns != Type::Void).then(|| self.local(returns));
        self.emit(Instruction::Invoke {
            result,
            call: Call {
                method,
                dispatch,
                receiver,
                args: args.to_vec(),
            },
        });
        result
    }

    /// Calls the static `method`, returning the local holding its result if
    /// it has one.
    pub fn invoke_static(&mut self, method: MethodId, args: &[Operand]) -> Option<LocalId> {
        self.invoke(method, Dispatch::Static, None, args)
    }

    /// Calls `method` on `receiver` without dynamic dispatch.
    pub fn invoke_special(
        &mut self,
        method: MethodId,
        receiver: impl Into<Operand>,
        args: &[Operand],
    ) -> Option<LocalId> {
        self.invoke(method, Dispatch::Special, Some(receiver.into()), args)
    }

    /// Calls `method` on `receiver` with dynamic dispatch.
    pub fn invoke_virtual(
        &mut self,
        method: MethodId,
        receiver: impl Into<Operand>,
        args: &[Operand],
    ) -> Option<LocalId> {
        self.invoke(method, Dispatch::Virtual, Some(receiver.into()), args)
    }

    /// Calls `method` with the provided dispatch and discards its result.
    pub fn call_discarding(
        &mut self,
        method: MethodId,
        dispatch: Dispatch,
        receiver: Option<Operand>,
        args: &[Operand],
    ) {
        self.emit(Instruction::Invoke {
            result: None,
            call:   Call {
                method,
                dispatch,
                receiver,
                args: args.to_vec(),
            },
        });
    }

    /// Allocates an instance of `class` without running a constructor.
    pub fn new_object(&mut self, class: ClassId) -> LocalId {
        self.assign_fresh(Type::Object(class), Rvalue::New(class))
    }

    /// Allocates an instance of `class` and runs `constructor` on it.
    pub fn construct(&mut self, class: ClassId, constructor: MethodId, args: &[Operand]) -> LocalId {
        let object = self.new_object(class);
        self.invoke_special(constructor, object, args);
        object
    }

    /// Reads `field` of `object` into a fresh local of type `ty`.
    pub fn get_field(&mut self, object: impl Into<Operand>, field: &FieldRef, ty: Type) -> LocalId {
        self.assign_fresh(ty, Rvalue::GetField {
            object: object.into(),
            field:  field.clone(),
        })
    }

    /// Writes `value` to `field` of `object`.
    pub fn put_field(
        &mut self,
        object: impl Into<Operand>,
        field: &FieldRef,
        value: impl Into<Operand>,
    ) {
        self.emit(Instruction::PutField {
            object: object.into(),
            field:  field.clone(),
            value:  value.into(),
        });
    }

    /// Reads the static `field` into a fresh local of type `ty`.
    pub fn get_static(&mut self, field: &FieldRef, ty: Type) -> LocalId {
        self.assign_fresh(ty, Rvalue::GetStatic(field.clone()))
    }

    /// Writes `value` to the static `field`.
    pub fn put_static(&mut self, field: &FieldRef, value: impl Into<Operand>) {
        self.emit(Instruction::PutStatic {
            field: field.clone(),
            value: value.into(),
        });
    }

    /// Allocates an integer array of `length` cells.
    pub fn new_array(&mut self, length: impl Into<Operand>) -> LocalId {
        self.assign_fresh(Type::IntArray, Rvalue::NewArray {
            length: length.into(),
        })
    }

    /// Reads cell `index` of `array` into a fresh local.
    pub fn array_load(&mut self, array: impl Into<Operand>, index: impl Into<Operand>) -> LocalId {
        self.assign_fresh(Type::Int, Rvalue::ArrayLoad {
            array: array.into(),
            index: index.into(),
        })
    }

    /// Writes `value` into cell `index` of `array`.
    pub fn array_store(
        &mut self,
        array: impl Into<Operand>,
        index: impl Into<Operand>,
        value: impl Into<Operand>,
    ) {
        self.emit(Instruction::ArrayStore {
            array: array.into(),
            index: index.into(),
            value: value.into(),
        });
    }

    /// Reads the length of `array` into a fresh local.
    pub fn array_length(&mut self, array: impl Into<Operand>) -> LocalId {
        self.assign_fresh(Type::Int, Rvalue::ArrayLength {
            array: array.into(),
        })
    }

    /// Returns `value` from the method.
    pub fn ret(&mut self, value: Option<Operand>) {
        self.emit(Instruction::Return { value });
    }

    /// Returns `value` from the method.
    pub fn ret_value(&mut self, value: impl Into<Operand>) {
        self.ret(Some(value.into()));
    }

    /// Throws the exception object in `exception`.
    pub fn throw(&mut self, exception: impl Into<Operand>) {
        self.emit(Instruction::Throw {
            exception: exception.into(),
        });
    }

    /// Terminates the process with status `code`.
    pub fn exit(&mut self, code: impl Into<Operand>) {
        self.emit(Instruction::Exit { code: code.into() });
    }

    /// Emits an instruction that does nothing.
    pub fn nop(&mut self) {
        self.emit(Instruction::Nop);
    }

    /// Registers a handler for exceptions of `class` (or all exceptions, for
    /// [`None`]) thrown between `start` and `end`, entering at `target` with
    /// the exception bound to `binding`.
    pub fn handler(
        &mut self,
        start: Label,
        end: Label,
        target: Label,
        class: Option<ClassId>,
        binding: Option<LocalId>,
    ) {
        self.handlers.push((start, end, target, class, binding));
    }

    fn resolve(&self, label: Label) -> u32 {
        self.labels[label.0].unwrap_or(u32::MAX)
    }

    fn finish(mut self) -> Code {
        let needs_return = self
            .instructions
            .last()
            .map_or(true, |last| !last.is_terminator());
        if needs_return && self.returns == Type::Void {
            self.emit(Instruction::Return { value: None });
        }

        for (index, label) in std::mem::take(&mut self.fixups) {
            let target = self.resolve(label);
            let patched = self.instructions[index].with_remapped_target(|_| target);
            self.instructions[index] = patched;
        }
        let handlers = self
            .handlers
            .iter()
            .map(|&(start, end, target, class, binding)| Handler {
                start: self.resolve(start),
                end: self.resolve(end),
                target: self.resolve(target),
                class,
                binding,
            })
            .collect();

        Code {
            instructions: self.instructions,
            locals: self.locals,
            handlers,
            origins: None,
        }
    }
}

fn index_u32(index: usize) -> u32 {
    u32::try_from(index).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod test {
    use crate::program::{
        builder::ProgramBuilder,
        instruction::{Instruction, Operand},
        types::{Constant, Type},
        ProgramRepresentation,
    };

    #[test]
    fn labels_are_patched_into_jumps() -> anyhow::Result<()> {
        let mut builder = ProgramBuilder::new();
        let class = builder.class("demo.Loop");
        let method = builder
            .method(class, "spin", &[], Type::Void)
            .statik()
            .build(|code| {
                let top = code.label();
                code.bind(top);
                code.nop();
                code.goto(top);
            });
        let program = builder.finish();

        let code = program.code(method)?;
        assert_eq!(code.instructions[1], Instruction::Goto { target: 0 });
        Ok(())
    }

    #[test]
    fn void_bodies_get_an_implicit_return() -> anyhow::Result<()> {
        let mut builder = ProgramBuilder::new();
        let class = builder.class("demo.Empty");
        let method = builder
            .method(class, "nothing", &[], Type::Void)
            .statik()
            .build(|_| {});
        let program = builder.finish();

        let code = program.code(method)?;
        assert_eq!(code.instructions, vec![Instruction::Return { value: None }]);
        Ok(())
    }

    #[test]
    fn calls_allocate_result_locals() -> anyhow::Result<()> {
        let mut builder = ProgramBuilder::new();
        let next_int = builder.runtime().random_next_int;
        let random = builder.runtime().random;
        let init = builder.runtime().random_init;
        let class = builder.class("demo.Dice");
        let method = builder
            .method(class, "roll", &[], Type::Int)
            .statik()
            .build(|code| {
                let rng = code.construct(random, init, &[]);
                let value = code.invoke_virtual(next_int, rng, &[]).unwrap();
                code.ret_value(value);
            });
        let program = builder.finish();

        assert_eq!(program.declared_locals(method)?, &[Type::Object(random), Type::Int]);
        let code = program.code(method)?;
        assert!(matches!(
            code.instructions.last(),
            Some(Instruction::Return {
                value: Some(Operand::Local(_))
            })
        ));
        assert_ne!(Operand::from(Constant::Null), Operand::from(0));
        Ok(())
    }
}
