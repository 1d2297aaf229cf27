//! Guard-driven experiment workflow engine
//!
//! This crate executes declarative experiment workflows described by
//! WED-Makefiles: YAML documents naming an initial guard, a final guard,
//! and a set of tasks, each pairing a guard (an AND-conjunction of
//! single-variable clauses) with a Bash script. An experiment instance is
//! created from a Bash configuration script whose captured environment
//! becomes the initial state; worker threads then concurrently fire tasks
//! whose guards are satisfied, merging each task's captured variable
//! delta into the shared state, until the final guard holds, the
//! instance is stuck, or a fatal error occurs.
//!
//! - [`parser`]: the specification model and clause grammar
//! - [`state`]: valuations, the shared store, and the lock table
//! - [`shell`]: the Bash adapter and environment-capture protocol
//! - [`runner`]: single-task execution and delta validation
//! - [`instance`]: the experiment instance and worker scheduler

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod error;
pub mod instance;
pub mod parser;
pub mod runner;
pub mod shell;
pub mod state;

pub use error::{WedError, WedResult};
pub use instance::{ExperimentInstance, InstanceOptions};
pub use parser::{Dependency, Guard, Task, Variable, WedMakefile};
pub use state::{Binding, Permission, StateStore, Valuation};
