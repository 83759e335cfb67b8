//! This module contains the non-determinism interceptor: the rewriting pass
//! that inserts recording probes around every non-deterministic operation of
//! the program, the registry that decides what counts as non-deterministic,
//! and the storage the probes record into while the program runs in the
//! sandbox.
//!
//! # Probes
//!
//! The pass inserts three kinds of [`Probe`]:
//!
//! - [`Probe::NdEnter`] before every non-deterministic call, pushing the
//!   receiver and arguments to the invocation's bookkeeping stack.
//! - [`Probe::NdRecord`] after every non-deterministic call, recording the
//!   produced value under the signature of the called method.
//! - [`Probe::NdRegisterInstance`] after every allocation of a
//!   non-deterministic class, so that the n-th object constructed at a site
//!   can be matched with the symbolic object standing for it.
//!
//! Every rewritten body keeps the index of the original instruction each of
//! its instructions stems from, so that coverage and construction sites are
//! always reported in the coordinates of the original program.

pub mod registry;
pub mod storage;

use tracing::{debug, info};

use crate::{
    error::{
        container::Locatable,
        instrumentation::{Error, Result},
        program,
    },
    instrumentation::registry::NdRegistry,
    program::{
        instruction::{Instruction, Probe, Rvalue},
        types::{InstructionId, LocalId, MethodId, Type},
        Code,
        Handler,
        MethodBody,
        Program,
        ProgramRepresentation,
    },
};

/// The rewriting pass that makes non-deterministic operations observable.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Instrumenter {
    registry: NdRegistry,
}

impl Instrumenter {
    /// Constructs an instrumenter classifying non-determinism with
    /// `registry`.
    #[must_use]
    pub fn new(registry: NdRegistry) -> Self {
        Self { registry }
    }

    /// Gets the registry used by the instrumenter.
    #[must_use]
    pub fn registry(&self) -> &NdRegistry {
        &self.registry
    }

    /// Produces the instrumented version of `program`.
    ///
    /// Probes left by an earlier pass are removed before rewriting, so
    /// instrumenting an instrumented program yields the same program again.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the owner class or target of a call cannot be
    /// resolved. This means the pass itself is broken, and is fatal.
    pub fn instrument(&self, program: &Program) -> Result<Program> {
        let mut instrumented = program.clone();
        let mut probes = 0;

        for method in program.methods() {
            let MethodBody::Code(code) = &method.body else {
                continue;
            };
            program
                .class(method.class)
                .map_err(|_| {
                    Error::UnresolvedOwner {
                        method: method.id,
                        class:  method.class,
                    }
                    .locate(InstructionId::entry(method.id))
                })?;

            let stripped = strip(code);
            let rewritten = self.rewrite(program, method.id, &stripped)?;
            probes += rewritten.instructions.iter().filter(|i| i.is_probe()).count();
            instrumented
                .replace_body(method.id, MethodBody::Code(rewritten))
                .locate(InstructionId::entry(method.id))?;
        }

        info!(probes, "Instrumented program for non-determinism");
        Ok(instrumented)
    }

    /// Inserts the probes into `code`, which must contain none.
    fn rewrite(&self, program: &Program, method: MethodId, code: &Code) -> Result<Code> {
        let mut instructions = Vec::with_capacity(code.instructions.len());
        let mut origins = Vec::with_capacity(code.instructions.len());
        let mut locals = code.locals.clone();
        // The position in the rewritten body of the first instruction emitted
        // for each original instruction, plus one for the end of the body.
        let mut starts = Vec::with_capacity(code.instructions.len() + 1);

        for (index, instruction) in code.instructions.iter().enumerate() {
            let index = u32::try_from(index).unwrap_or(u32::MAX);
            let here = InstructionId::new(method, index);
            let origin = code.original_index(index);
            starts.push(position(&instructions));

            match (self.classify(program, instruction, here)?, instruction) {
                (Site::NdCall, Instruction::Invoke { result, call }) => {
                    let target = program
                        .method(call.method)
                        .map_err(|_| Error::UnresolvedTarget { method: call.method }.locate(here))?;
                    let signature = program.signature(call.method).locate(here)?;
                    let is_static = target.is_static;

                    // Discarded results still need to be recorded.
                    let result = match result {
                        Some(local) => Some(*local),
                        None if target.returns == Type::Void => None,
                        None => {
                            locals.push(target.returns);
                            Some(LocalId(position(&locals) - 1))
                        }
                    };

                    instructions.push(Instruction::Probe(Probe::NdEnter {
                        receiver: call.receiver,
                        args:     call.args.clone(),
                    }));
                    instructions.push(Instruction::Invoke {
                        result,
                        call: call.clone(),
                    });
                    origins.extend([origin, origin]);
                    if let Some(result) = result {
                        instructions.push(Instruction::Probe(Probe::NdRecord {
                            signature,
                            result,
                            is_static,
                        }));
                        origins.push(origin);
                    }
                    debug!(at = %here, method = %call.method, "Intercepted non-deterministic call");
                }
                (Site::NdAllocation, Instruction::Assign { target, .. }) => {
                    instructions.push(instruction.clone());
                    instructions.push(Instruction::Probe(Probe::NdRegisterInstance {
                        site:   InstructionId::new(method, origin),
                        object: *target,
                    }));
                    origins.extend([origin, origin]);
                }
                _ => {
                    instructions.push(instruction.clone());
                    origins.push(origin);
                }
            }
        }
        starts.push(position(&instructions));

        let map = |index: u32| starts.get(index as usize).copied().unwrap_or(u32::MAX);
        let instructions: Vec<Instruction> = instructions
            .into_iter()
            .map(|i| i.with_remapped_target(map))
            .collect();
        let handlers = remap_handlers(&code.handlers, map);

        if instructions.len() != origins.len() {
            return Err(Error::InconsistentOrigins {
                instructions: instructions.len(),
                origins:      origins.len(),
            }
            .locate(InstructionId::entry(method)));
        }

        Ok(Code {
            instructions,
            locals,
            handlers,
            origins: Some(origins),
        })
    }

    /// Decides whether `instruction` at `at` needs probes.
    fn classify(&self, program: &Program, instruction: &Instruction, at: InstructionId) -> Result<Site> {
        match instruction {
            Instruction::Invoke { call, .. } => {
                let declaration = program
                    .method(call.method)
                    .map_err(|_| Error::UnresolvedTarget { method: call.method }.locate(at))?;
                if program.class(declaration.class).is_err() {
                    return Err(Error::UnresolvedOwner {
                        method: call.method,
                        class:  declaration.class,
                    }
                    .locate(at));
                }
                let is_nd = self
                    .registry
                    .is_nd_call(program, call.method)
                    .map_err(|e| classification_error(e).locate(at))?;
                Ok(if is_nd { Site::NdCall } else { Site::Plain })
            }
            Instruction::Assign {
                value: Rvalue::New(class),
                ..
            } => {
                let is_nd = self
                    .registry
                    .is_nd_class(program, *class)
                    .map_err(|e| classification_error(e).locate(at))?;
                Ok(if is_nd { Site::NdAllocation } else { Site::Plain })
            }
            _ => Ok(Site::Plain),
        }
    }
}

/// What the instrumenter does with an instruction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Site {
    NdCall,
    NdAllocation,
    Plain,
}

/// Turns a failed lookup during classification into the instrumentation
/// error describing it.
fn classification_error(error: program::Error) -> Error {
    match error {
        program::Error::NoSuchClass { class } => Error::UnresolvedSuperclass { class },
        other => Error::Program(other),
    }
}

/// Removes every probe from `code`, mapping jumps, handlers and origins back
/// to the remaining instructions.
fn strip(code: &Code) -> Code {
    // The number of non-probe instructions before each index, which is where
    // a jump to that index lands once the probes are gone.
    let mut kept_before = Vec::with_capacity(code.instructions.len() + 1);
    let mut count = 0;
    for instruction in &code.instructions {
        kept_before.push(count);
        if !instruction.is_probe() {
            count += 1;
        }
    }
    kept_before.push(count);

    let map = |index: u32| kept_before.get(index as usize).copied().unwrap_or(u32::MAX);
    let mut instructions = Vec::with_capacity(code.instructions.len());
    let mut origins = Vec::with_capacity(code.instructions.len());
    for (index, instruction) in code.instructions.iter().enumerate() {
        if instruction.is_probe() {
            continue;
        }
        instructions.push(instruction.with_remapped_target(map));
        origins.push(code.original_index(u32::try_from(index).unwrap_or(u32::MAX)));
    }

    let is_identity = origins
        .iter()
        .enumerate()
        .all(|(i, o)| u32::try_from(i).is_ok_and(|i| i == *o));
    Code {
        instructions,
        locals: code.locals.clone(),
        handlers: remap_handlers(&code.handlers, map),
        origins: if is_identity { None } else { Some(origins) },
    }
}

fn remap_handlers(handlers: &[Handler], map: impl Fn(u32) -> u32) -> Vec<Handler> {
    handlers
        .iter()
        .map(|h| Handler {
            start: map(h.start),
            end: map(h.end),
            target: map(h.target),
            class: h.class,
            binding: h.binding,
        })
        .collect()
}

fn position<T>(items: &[T]) -> u32 {
    u32::try_from(items.len()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod test {
    use crate::{
        error::instrumentation::Error,
        instrumentation::Instrumenter,
        program::{
            builder::ProgramBuilder,
            instruction::{BinaryOp, Call, Dispatch, Instruction, Operand, Probe},
            types::{InstructionId, MethodId, Type},
            Code,
            MethodBody,
            Program,
            ProgramRepresentation,
        },
    };

    /// Builds `int roll()`, which draws twice from a fresh generator and
    /// branches on the first draw.
    fn dice() -> (Program, MethodId) {
        let mut builder = ProgramBuilder::new();
        let runtime = builder.runtime().clone();
        let class = builder.class("demo.Dice");
        let method = builder
            .method(class, "roll", &[], Type::Int)
            .statik()
            .build(|code| {
                let random = code.construct(runtime.random, runtime.random_init, &[]);
                let draw = code
                    .invoke_virtual(runtime.random_next_int, random, &[])
                    .unwrap_or_default();
                code.call_discarding(
                    runtime.random_next_int,
                    Dispatch::Virtual,
                    Some(random.into()),
                    &[],
                );
                let big = code.binary(BinaryOp::Gt, draw, 10, Type::Bool);
                let label = code.label();
                code.branch_if(big, label);
                code.ret_value(0);
                code.bind(label);
                code.ret_value(1);
            });
        (builder.finish(), method)
    }

    #[test]
    fn probes_surround_non_deterministic_calls() -> anyhow::Result<()> {
        let (program, method) = dice();
        let instrumented = Instrumenter::default().instrument(&program)?;
        let code = instrumented.code(method)?;

        let probes: Vec<&Probe> = code
            .instructions
            .iter()
            .filter_map(|i| match i {
                Instruction::Probe(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(probes.len(), 5);
        assert!(matches!(
            probes[0],
            Probe::NdRegisterInstance { site, .. } if *site == InstructionId::new(method, 0)
        ));
        assert!(matches!(probes[1], Probe::NdEnter { .. }));
        assert!(matches!(
            probes[2],
            Probe::NdRecord { signature, is_static: false, .. } if signature == "java.util.Random.nextInt()"
        ));

        // The discarded draw was given a local so that it can be recorded.
        let original_locals = program.code(method)?.locals.len();
        assert_eq!(code.locals.len(), original_locals + 1);

        Ok(())
    }

    #[test]
    fn jumps_and_origins_point_at_the_original_instructions() -> anyhow::Result<()> {
        let (program, method) = dice();
        let original = program.code(method)?;
        let instrumented = Instrumenter::default().instrument(&program)?;
        let code = instrumented.code(method)?;

        let original_target = original
            .instructions
            .iter()
            .find_map(Instruction::jump_target)
            .unwrap_or_default();
        let target = code
            .instructions
            .iter()
            .find_map(Instruction::jump_target)
            .unwrap_or_default();
        assert_eq!(code.original_index(target), original_target);
        assert_eq!(code.instructions[target as usize], original.instructions[original_target as usize]);

        let origins = code.origins.clone().unwrap_or_default();
        assert_eq!(origins.len(), code.instructions.len());
        assert!(origins.windows(2).all(|w| w[0] <= w[1]));

        Ok(())
    }

    #[test]
    fn instrumenting_twice_is_idempotent() -> anyhow::Result<()> {
        let (program, _) = dice();
        let instrumenter = Instrumenter::default();
        let once = instrumenter.instrument(&program)?;
        let twice = instrumenter.instrument(&once)?;
        assert_eq!(once, twice);

        Ok(())
    }

    #[test]
    fn unresolvable_call_targets_are_fatal() -> anyhow::Result<()> {
        let (mut program, method) = dice();
        let missing = MethodId(9_999);
        let code = Code {
            instructions: vec![
                Instruction::Invoke {
                    result: None,
                    call:   Call {
                        method:   missing,
                        dispatch: Dispatch::Static,
                        receiver: None,
                        args:     vec![Operand::from(1)],
                    },
                },
                Instruction::Return { value: None },
            ],
            locals:       vec![],
            handlers:     vec![],
            origins:      None,
        };
        program.replace_body(method, MethodBody::Code(code))?;

        let result = Instrumenter::default().instrument(&program);
        let Err(error) = result else {
            anyhow::bail!("instrumentation should have failed");
        };
        assert_eq!(error.payload, Error::UnresolvedTarget { method: missing });
        assert_eq!(error.location, InstructionId::new(method, 0));

        Ok(())
    }
}
