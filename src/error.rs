//! Error types for the experiment engine

use thiserror::Error;

/// Result type for experiment operations
pub type WedResult<T> = Result<T, WedError>;

/// Error kinds surfaced by the engine. All of them are fatal for the
/// experiment instance that records them; transient lock-acquisition
/// failures are retried and never reported through this type.
#[derive(Error, Debug)]
pub enum WedError {
    /// Invalid identifier, value, clause, or guard in a WED-Makefile
    #[error("SyntaxError: {0}")]
    Syntax(String),

    /// The configuration-derived state does not satisfy the initial guard
    #[error("UnsatisfiedInitialGuard: the initial state does not satisfy dependency {clause}")]
    UnsatisfiedInitialGuard {
        /// Canonical form of the unsatisfied clause
        clause: String,
    },

    /// The shell executor failed or returned unparsable output
    #[error("TaskExecutionError: error while executing task {task}")]
    TaskExecution {
        /// Name of the failed task
        task: String,
    },

    /// A task mutated a variable outside its guard's dependencies
    #[error("UndeclaredDependency: variable {variable} was not declared as a dependency of task {task}")]
    UndeclaredDependency {
        /// Identifier of the undeclared variable
        variable: String,
        /// Name of the offending task
        task: String,
    },

    /// A merge attempted to overwrite a read-only binding
    #[error("PermissionViolation: variable {variable} is read-only and cannot be overwritten by task {task}")]
    PermissionViolation {
        /// Identifier of the read-only variable
        variable: String,
        /// Name of the offending task
        task: String,
    },

    /// The instance reached a non-final state in which no task can fire
    #[error("InconsistentState: reached an inconsistent state")]
    InconsistentState,

    /// The configuration script failed or produced an invalid initial state
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem error while setting up the instance
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
