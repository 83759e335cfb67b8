//! This library generates test cases for a method by exploring its executions
//! symbolically and then confirming every candidate execution by running it
//! concretely in an isolated sandbox process.
//!
//! # How it Works
//!
//! From a very high level, test generation for a method proceeds as follows:
//!
//! 1. The [`program::Program`] under analysis is rewritten by the
//!    [`instrumentation::Instrumenter`], which inserts probes around every call
//!    whose result is non-deterministic (random draws, clocks).
//! 2. The [`explorer::Explorer`] walks the method symbolically. Each path is an
//!    immutable [`state::ExecutionState`], forked at every branch, call, return
//!    and exception edge, and scheduled by a pluggable
//!    [`explorer::selector::PathSelector`].
//! 3. Every completed path is handed to a [`solver::ConstraintSolver`], which
//!    turns its path constraints into concrete arguments.
//! 4. The concrete arguments are executed by a [`sandbox::Sandbox`] in a
//!    separate OS process, bounded by a timeout and isolated from crashes.
//! 5. The [`reconciler::Reconciler`] compares the observed outcome with the
//!    predicted one and emits a [`reconciler::TestCase`].
//!
//! # Basic Usage
//!
//! ```no_run
//! use symbolic_test_generator as stg;
//! use symbolic_test_generator::{
//!     generator::Config,
//!     program::{builder::ProgramBuilder, instruction::BinaryOp, types::Type},
//!     watchdog::LazyWatchdog,
//! };
//!
//! let mut builder = ProgramBuilder::new();
//! let class = builder.class("demo.Calculator");
//! let method = builder
//!     .method(class, "divide", &[Type::Int, Type::Int], Type::Int)
//!     .statik()
//!     .build(|code| {
//!         let a = code.parameter(0, Type::Int);
//!         let b = code.parameter(1, Type::Int);
//!         let result = code.binary(BinaryOp::Div, a, b, Type::Int);
//!         code.ret_value(result);
//!     });
//! let program = builder.finish();
//!
//! let report = stg::new(program, method, Config::default(), LazyWatchdog.in_arc())
//!     .generate()
//!     .unwrap();
//!
//! assert_eq!(report.test_cases.len(), 2);
//! ```

#![warn(clippy::all, clippy::cargo, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)] // Allows for better API naming
#![allow(clippy::multiple_crate_versions)] // Enforced by our dependencies

pub mod constant;
pub mod error;
pub mod explorer;
pub mod generator;
pub mod instrumentation;
pub mod program;
pub mod reconciler;
pub mod sandbox;
pub mod solver;
pub mod state;
pub mod symbolic;
pub mod watchdog;

// Re-exports to provide the library interface.
pub use generator::{generate_all, new};
pub use reconciler::TestCase;
