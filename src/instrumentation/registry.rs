//! This module contains the registry that decides which classes and methods
//! are sources of non-determinism.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{
    constant::{CONSTRUCTOR_NAME, CURRENT_TIME_SIGNATURE, RANDOM_CLASS},
    error::program::Result,
    program::{
        types::{ClassId, MethodId},
        ProgramRepresentation,
    },
};

/// The known sources of non-determinism.
///
/// A class is non-deterministic if it, or any class on its superclass chain,
/// is named in `classes`. The chain is walked explicitly against the
/// registry, so a class only qualifies through the registered roots and
/// never through an overridden method. A static method is non-deterministic
/// only if its signature is named in `static_methods`.
///
/// The registry is plain data, and can be loaded from JSON.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NdRegistry {
    /// The fully qualified names of the non-deterministic root classes.
    pub classes: BTreeSet<String>,

    /// The signatures of the non-deterministic static methods.
    pub static_methods: BTreeSet<String>,
}

impl NdRegistry {
    /// Constructs a registry with no entries.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            classes:        BTreeSet::new(),
            static_methods: BTreeSet::new(),
        }
    }

    /// Registers the class `name` as a non-deterministic root.
    #[must_use]
    pub fn with_class(mut self, name: impl Into<String>) -> Self {
        self.classes.insert(name.into());
        self
    }

    /// Registers the static method with `signature` as non-deterministic.
    #[must_use]
    pub fn with_static_method(mut self, signature: impl Into<String>) -> Self {
        self.static_methods.insert(signature.into());
        self
    }

    /// Checks if `class` is non-deterministic.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if a class on the superclass chain does not exist.
    pub fn is_nd_class(
        &self,
        program: &(impl ProgramRepresentation + ?Sized),
        class: ClassId,
    ) -> Result<bool> {
        let mut current = Some(class);
        while let Some(id) = current {
            let class = program.class(id)?;
            if self.classes.contains(&class.name) {
                return Ok(true);
            }
            current = class.superclass;
        }
        Ok(false)
    }

    /// Checks if a call to `method` is a non-deterministic call.
    ///
    /// Constructors are never non-deterministic calls, as the objects they
    /// initialise are tracked through their allocation instead.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the method or a class on its owner's superclass
    /// chain does not exist.
    pub fn is_nd_call(
        &self,
        program: &(impl ProgramRepresentation + ?Sized),
        method: MethodId,
    ) -> Result<bool> {
        let declaration = program.method(method)?;
        if declaration.is_static {
            let signature = program.signature(method)?;
            Ok(self.static_methods.contains(&signature))
        } else if declaration.name == CONSTRUCTOR_NAME {
            Ok(false)
        } else {
            self.is_nd_class(program, declaration.class)
        }
    }
}

impl Default for NdRegistry {
    fn default() -> Self {
        Self::empty()
            .with_class(RANDOM_CLASS)
            .with_static_method(CURRENT_TIME_SIGNATURE)
    }
}

#[cfg(test)]
mod test {
    use crate::{
        instrumentation::registry::NdRegistry,
        program::{builder::ProgramBuilder, types::Type},
    };

    #[test]
    fn subclasses_of_registered_roots_are_non_deterministic() -> anyhow::Result<()> {
        let mut builder = ProgramBuilder::new();
        let random = builder.runtime().random;
        let seeded = builder.class_extending("demo.SeededRandom", random);
        let plain = builder.class("demo.Plain");
        let program = builder.finish();

        let registry = NdRegistry::default();
        assert!(registry.is_nd_class(&program, random)?);
        assert!(registry.is_nd_class(&program, seeded)?);
        assert!(!registry.is_nd_class(&program, plain)?);

        Ok(())
    }

    #[test]
    fn static_methods_must_be_registered_explicitly() -> anyhow::Result<()> {
        let mut builder = ProgramBuilder::new();
        let runtime = builder.runtime().clone();
        let class = builder.class("demo.Clock");
        let own_clock = builder
            .method(class, "now", &[], Type::Int)
            .statik()
            .build(|code| code.ret_value(0));
        let program = builder.finish();

        let registry = NdRegistry::default();
        assert!(registry.is_nd_call(&program, runtime.current_time_millis)?);
        assert!(registry.is_nd_call(&program, runtime.random_next_int)?);
        assert!(!registry.is_nd_call(&program, runtime.random_init)?);
        assert!(!registry.is_nd_call(&program, own_clock)?);

        let registry = registry.with_static_method("demo.Clock.now()");
        assert!(registry.is_nd_call(&program, own_clock)?);

        Ok(())
    }

    #[test]
    fn registry_loads_from_json() -> anyhow::Result<()> {
        let json = r#"{"classes":["demo.Dice"],"static_methods":[]}"#;
        let registry: NdRegistry = serde_json::from_str(json)?;
        assert!(registry.classes.contains("demo.Dice"));
        assert!(registry.static_methods.is_empty());

        Ok(())
    }
}
