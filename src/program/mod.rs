//! This module contains the program representation that the generator
//! consumes: classes, methods and their statement-level bodies.
//!
//! The generator only ever consults the program through the
//! [`ProgramRepresentation`] trait. [`Program`] is the serializable
//! implementation of it that is also shipped to the sandbox process.

pub mod builder;
pub mod instruction;
pub mod types;

use std::fmt::Debug;

use bimap::BiMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    error::program::{Error, Result},
    program::{
        instruction::Instruction,
        types::{ClassId, Constant, FieldRef, InstructionId, LocalId, MethodId, Type},
    },
};

/// An instance field declared by a class.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FieldDecl {
    pub name: String,
    pub ty:   Type,
}

/// A static field declared by a class, with the value its static initializer
/// assigns to it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StaticDecl {
    pub name:    String,
    pub ty:      Type,
    pub initial: Constant,
}

/// A class of the program.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Class {
    pub id:         ClassId,
    pub name:       String,
    pub superclass: Option<ClassId>,
    pub fields:     Vec<FieldDecl>,
    pub statics:    Vec<StaticDecl>,
    pub methods:    Vec<MethodId>,
}

impl Class {
    /// Gets the package the class lives in, which is everything before the
    /// last `.` in its name.
    #[must_use]
    pub fn package(&self) -> &str {
        self.name.rsplit_once('.').map_or("", |(package, _)| package)
    }

    /// Gets the declaration of the static field `name`, if any.
    #[must_use]
    pub fn static_field(&self, name: &str) -> Option<&StaticDecl> {
        self.statics.iter().find(|s| s.name == name)
    }

    /// Gets the declaration of the instance field `name`, if any.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldDecl> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// An exception handler covering the instructions in `start..end`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Handler {
    pub start:   u32,
    pub end:     u32,
    pub target:  u32,
    /// The class of exceptions caught, where [`None`] catches everything.
    pub class:   Option<ClassId>,
    /// The local the caught exception is bound to on entry to the handler.
    pub binding: Option<LocalId>,
}

impl Handler {
    /// Checks if the handler's range covers the instruction at `index`.
    #[must_use]
    pub fn covers(&self, index: u32) -> bool {
        self.start <= index && index < self.end
    }
}

/// The statement-level body of a method.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Code {
    pub instructions: Vec<Instruction>,
    pub locals:       Vec<Type>,
    pub handlers:     Vec<Handler>,

    /// For instrumented bodies, the index in the original body that each
    /// instruction stems from.
    #[serde(default)]
    pub origins: Option<Vec<u32>>,
}

impl Code {
    /// Maps an instruction index of this body back to the index in the body
    /// before instrumentation.
    #[must_use]
    pub fn original_index(&self, index: u32) -> u32 {
        self.origins
            .as_ref()
            .and_then(|origins| origins.get(index as usize).copied())
            .unwrap_or(index)
    }
}

/// The behaviours of methods implemented by the runtime itself.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Native {
    /// Does nothing and returns nothing.
    NoOp,

    /// Draws an arbitrary integer.
    RandomInt,

    /// Draws an integer in `0..bound`, for the single integer argument.
    RandomIntBounded,

    /// Draws an arbitrary boolean.
    RandomBool,

    /// Reads the wall clock in milliseconds.
    CurrentTimeMillis,
}

/// How a method is implemented.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum MethodBody {
    Code(Code),
    Native(Native),
}

/// A method of the program.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Method {
    pub id:        MethodId,
    pub class:     ClassId,
    pub name:      String,
    pub params:    Vec<Type>,
    pub returns:   Type,
    pub is_static: bool,
    pub body:      MethodBody,
}

impl Method {
    /// Gets the code body of the method, if it has one.
    #[must_use]
    pub fn code(&self) -> Option<&Code> {
        match &self.body {
            MethodBody::Code(code) => Some(code),
            MethodBody::Native(_) => None,
        }
    }

    /// Gets the native implementation of the method, if it has one.
    #[must_use]
    pub fn native(&self) -> Option<Native> {
        match &self.body {
            MethodBody::Native(native) => Some(*native),
            MethodBody::Code(_) => None,
        }
    }

    /// Checks if `other` could override (or be overridden by) this method.
    #[must_use]
    pub fn same_shape(&self, other: &Method) -> bool {
        self.name == other.name && self.params == other.params && self.is_static == other.is_static
    }
}

/// The interface through which the generator consults the program under
/// analysis.
///
/// The required methods are primitive lookups, while the provided methods
/// build on top of them.
pub trait ProgramRepresentation
where
    Self: Debug + Send + Sync,
{
    /// Gets the method with identifier `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if no such method exists.
    fn method(&self, id: MethodId) -> Result<&Method>;

    /// Gets the class with identifier `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if no such class exists.
    fn class(&self, id: ClassId) -> Result<&Class>;

    /// Looks up a class by its fully qualified name.
    fn class_named(&self, name: &str) -> Option<ClassId>;

    /// Gets the instruction at `at`.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the method has no body or the index is out of range.
    fn instruction(&self, at: InstructionId) -> Result<&Instruction> {
        let code = self.code(at.method)?;
        code.instructions
            .get(at.index as usize)
            .ok_or(Error::NoSuchInstruction { at })
    }

    /// Gets the code body of `method`.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the method does not exist or is native.
    fn code(&self, method: MethodId) -> Result<&Code> {
        self.method(method)?.code().ok_or(Error::NoCode { method })
    }

    /// Gets the ordered normal-flow successors of the instruction at `at`.
    ///
    /// The position of a successor in the returned list is the decision code
    /// of the edge to it. For a conditional jump, the fall-through successor
    /// comes first and the jump target second.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the instruction or its jump target does not exist.
    fn successors(&self, at: InstructionId) -> Result<Vec<InstructionId>> {
        let code = self.code(at.method)?;
        let instruction = self.instruction(at)?;
        let len = u32::try_from(code.instructions.len()).unwrap_or(u32::MAX);
        let check = |target: u32| {
            if target < len {
                Ok(at.at(target))
            } else {
                Err(Error::InvalidJumpTarget {
                    method: at.method,
                    target,
                })
            }
        };

        let successors = match instruction {
            Instruction::Return { .. } | Instruction::Throw { .. } | Instruction::Exit { .. } => {
                vec![]
            }
            Instruction::Goto { target } => vec![check(*target)?],
            Instruction::If { target, .. } => vec![check(at.index + 1)?, check(*target)?],
            _ => vec![check(at.index + 1)?],
        };
        Ok(successors)
    }

    /// Gets the handlers whose range covers `at`, innermost first.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the method has no body.
    fn handlers_for(&self, at: InstructionId) -> Result<Vec<Handler>> {
        let code = self.code(at.method)?;
        Ok(code
            .handlers
            .iter()
            .filter(|h| h.covers(at.index))
            .cloned()
            .collect())
    }

    /// Gets the types of the locals declared by `method`.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the method does not exist or is native.
    fn declared_locals(&self, method: MethodId) -> Result<&[Type]> {
        Ok(self.code(method)?.locals.as_slice())
    }

    /// Gets the types of the parameters of `method`.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the method does not exist.
    fn params(&self, method: MethodId) -> Result<&[Type]> {
        Ok(self.method(method)?.params.as_slice())
    }

    /// Checks if `class` is `ancestor` or inherits from it, by walking the
    /// superclass chain explicitly.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if a class on the chain does not exist.
    fn is_subclass_of(&self, class: ClassId, ancestor: ClassId) -> Result<bool> {
        let mut current = Some(class);
        while let Some(id) = current {
            if id == ancestor {
                return Ok(true);
            }
            current = self.class(id)?.superclass;
        }
        Ok(false)
    }

    /// Finds the implementation of `method` that applies to a receiver of
    /// dynamic class `class`.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if no class on the chain implements the method.
    fn resolve_virtual(&self, class: ClassId, method: MethodId) -> Result<MethodId> {
        let declared = self.method(method)?;
        let mut current = Some(class);
        while let Some(id) = current {
            let candidate = self.class(id)?;
            for &candidate_method in &candidate.methods {
                if self.method(candidate_method)?.same_shape(declared) {
                    return Ok(candidate_method);
                }
            }
            current = candidate.superclass;
        }
        Err(Error::UnresolvedVirtual { class, method })
    }

    /// Gets a stable, human-readable signature for `method`, in the form
    /// `package.Class.name(type,type)`.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the method or a class it mentions does not exist.
    fn signature(&self, method: MethodId) -> Result<String> {
        let method = self.method(method)?;
        let owner = &self.class(method.class)?.name;
        let params = method
            .params
            .iter()
            .map(|ty| self.type_name(*ty))
            .collect::<Result<Vec<_>>>()?
            .join(",");
        Ok(format!("{owner}.{}({params})", method.name))
    }

    /// Gets the name of `ty` as it appears in signatures.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if `ty` names a class that does not exist.
    fn type_name(&self, ty: Type) -> Result<String> {
        let name = match ty {
            Type::Void => "void".to_string(),
            Type::Int => "int".to_string(),
            Type::Bool => "boolean".to_string(),
            Type::IntArray => "int[]".to_string(),
            Type::Object(class) => self.class(class)?.name.clone(),
        };
        Ok(name)
    }
}

/// A whole program: every class and method that can be reached from the
/// method under analysis.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Program {
    classes: Vec<Class>,
    methods: Vec<Method>,
    names:   BiMap<String, ClassId>,
}

impl Program {
    /// Constructs a program from its classes and methods.
    ///
    /// Identifiers must match the positions of the classes and methods in the
    /// provided vectors.
    #[must_use]
    pub fn new(classes: Vec<Class>, methods: Vec<Method>) -> Self {
        let names = classes.iter().map(|c| (c.name.clone(), c.id)).collect();
        Self {
            classes,
            methods,
            names,
        }
    }

    /// Gets all the classes in the program.
    #[must_use]
    pub fn classes(&self) -> &[Class] {
        &self.classes
    }

    /// Gets all the methods in the program.
    #[must_use]
    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    /// Gets the name of the class with identifier `id`.
    #[must_use]
    pub fn class_name(&self, id: ClassId) -> Option<&str> {
        self.names.get_by_right(&id).map(String::as_str)
    }

    /// Looks up a method by its signature, as produced by
    /// [`ProgramRepresentation::signature`].
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if no method has the signature.
    pub fn method_by_signature(&self, signature: &str) -> Result<MethodId> {
        for method in &self.methods {
            if self.signature(method.id)? == signature {
                return Ok(method.id);
            }
        }
        Err(Error::NoSuchSignature {
            signature: signature.to_string(),
        })
    }

    /// Looks up the method `name` declared directly on `class`.
    #[must_use]
    pub fn method_named(&self, class: ClassId, name: &str) -> Option<MethodId> {
        let class = self.classes.get(class.0 as usize)?;
        class
            .methods
            .iter()
            .copied()
            .find(|m| self.methods.get(m.0 as usize).is_some_and(|m| m.name == name))
    }

    /// Gets the static field declarations of every class, in class order.
    pub fn static_fields(&self) -> impl Iterator<Item = (FieldRef, &StaticDecl)> {
        self.classes.iter().flat_map(|class| {
            class
                .statics
                .iter()
                .map(move |decl| (FieldRef::new(class.id, decl.name.clone()), decl))
        })
    }

    /// Replaces the body of `method` with `body`.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the method does not exist.
    pub fn replace_body(&mut self, method: MethodId, body: MethodBody) -> Result<()> {
        let target = self
            .methods
            .get_mut(method.0 as usize)
            .ok_or(Error::NoSuchMethod { method })?;
        target.body = body;
        Ok(())
    }

    /// Gets the total number of instructions across all method bodies.
    #[must_use]
    pub fn instruction_count(&self) -> usize {
        self.methods
            .iter()
            .filter_map(Method::code)
            .map(|c| c.instructions.len())
            .sum()
    }

    /// Gets the classes whose names start with any of `prefixes`, sorted by
    /// name.
    #[must_use]
    pub fn classes_in(&self, prefixes: &[String]) -> Vec<ClassId> {
        self.classes
            .iter()
            .filter(|c| prefixes.iter().any(|p| c.name.starts_with(p.as_str())))
            .sorted_by(|a, b| a.name.cmp(&b.name))
            .map(|c| c.id)
            .collect()
    }
}

impl ProgramRepresentation for Program {
    fn method(&self, id: MethodId) -> Result<&Method> {
        self.methods
            .get(id.0 as usize)
            .ok_or(Error::NoSuchMethod { method: id })
    }

    fn class(&self, id: ClassId) -> Result<&Class> {
        self.classes
            .get(id.0 as usize)
            .ok_or(Error::NoSuchClass { class: id })
    }

    fn class_named(&self, name: &str) -> Option<ClassId> {
        self.names.get_by_left(name).copied()
    }
}

#[cfg(test)]
mod test {
    use crate::{
        constant::{ARITHMETIC_EXCEPTION_CLASS, RUNTIME_EXCEPTION_CLASS, THROWABLE_CLASS},
        program::{
            builder::ProgramBuilder,
            instruction::BinaryOp,
            types::{InstructionId, Type},
            ProgramRepresentation,
        },
    };

    #[test]
    fn conditional_successors_are_fall_through_then_target() -> anyhow::Result<()> {
        let mut builder = ProgramBuilder::new();
        let class = builder.class("demo.Branches");
        let method = builder
            .method(class, "sign", &[Type::Int], Type::Int)
            .statik()
            .build(|code| {
                let x = code.parameter(0, Type::Int);
                let negative = code.binary(BinaryOp::Lt, x, 0, Type::Bool);
                let else_label = code.label();
                code.branch_if(negative, else_label);
                code.ret_value(1);
                code.bind(else_label);
                code.ret_value(-1);
            });
        let program = builder.finish();

        let branch = InstructionId::new(method, 2);
        let successors = program.successors(branch)?;
        assert_eq!(successors, vec![branch.at(3), branch.at(4)]);
        assert!(program.successors(branch.at(3))?.is_empty());

        Ok(())
    }

    #[test]
    fn subclass_check_walks_the_ancestor_chain() -> anyhow::Result<()> {
        let program = ProgramBuilder::new().finish();
        let arithmetic = program.class_named(ARITHMETIC_EXCEPTION_CLASS).unwrap();
        let runtime = program.class_named(RUNTIME_EXCEPTION_CLASS).unwrap();
        let throwable = program.class_named(THROWABLE_CLASS).unwrap();

        assert!(program.is_subclass_of(arithmetic, throwable)?);
        assert!(program.is_subclass_of(arithmetic, runtime)?);
        assert!(!program.is_subclass_of(throwable, arithmetic)?);

        Ok(())
    }

    #[test]
    fn signatures_name_owner_and_parameters() -> anyhow::Result<()> {
        let mut builder = ProgramBuilder::new();
        let class = builder.class("demo.Sig");
        let method = builder
            .method(class, "f", &[Type::Int, Type::Bool], Type::Void)
            .statik()
            .build(|code| code.ret(None));
        let program = builder.finish();

        let signature = program.signature(method)?;
        assert_eq!(signature, "demo.Sig.f(int,boolean)");
        assert_eq!(program.method_by_signature(&signature)?, method);

        Ok(())
    }
}
