//! Error type shared by every layer of the orchestrator.
//!
//! Fatal conditions (OS failures, a process with nothing to run, a failing
//! child without `ALLOW_FAILURE`) are values of [`Error`] propagated with `?`
//! up to the program boundary, where [`exit_code`] turns them into the
//! process exit status.

use std::io;

use thiserror::Error;

use crate::task::Phase;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// An OS primitive (pipe, spawn, wait, signal, filesystem) failed.
    #[error("{what}, {source}")]
    Os {
        what: String,
        #[source]
        source: io::Error,
    },

    /// Neither a binary nor a raw command was given to a process.
    #[error("process: nothing to run")]
    NothingToRun,

    /// A child exited with a code outside of its success set.
    #[error("{name} returned {code}")]
    ProcessFailed { name: String, code: i32 },

    /// The run was interrupted; not a failure in itself.
    #[error("interrupted")]
    Interrupted,

    /// An environment variable cannot be handed to the OS (embedded nul).
    #[error("environment variable {name} contains a nul byte")]
    EnvEncoding { name: String },

    /// Writing to this process's environment failed.
    #[error("failed to set environment variable {name}, {source}")]
    EnvWrite {
        name: String,
        #[source]
        source: io::Error,
    },

    /// A variable expected in this process's environment is missing.
    #[error("environment variable {0} doesn't exist")]
    EnvMissing(String),

    #[error("task {0} not found")]
    UnknownTask(String),

    #[error("dependency cycle between tasks: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    #[error("task {task} failed during {phase}: {source}")]
    TaskFailed {
        task: String,
        phase: Phase,
        #[source]
        source: Box<Error>,
    },

    #[error("task {task} skipped, dependency {dependency} failed")]
    DependencyFailed { task: String, dependency: String },

    /// A task panicked on its worker thread.
    #[error("task {task} panicked: {message}")]
    Panicked { task: String, message: String },

    #[error("still failing after {attempts} attempts")]
    RetriesExhausted { attempts: usize },

    /// Summary error for a run where one or more tasks failed.
    #[error("{} task(s) failed: {}", .0.len(), .0.join(", "))]
    RunFailed(Vec<String>),
}

impl Error {
    /// Builds an [`Error::Os`] from the calling thread's last OS error.
    pub fn last_os(what: impl Into<String>) -> Self {
        Error::Os {
            what: what.into(),
            source: io::Error::last_os_error(),
        }
    }

    pub fn os(what: impl Into<String>, source: io::Error) -> Self {
        Error::Os {
            what: what.into(),
            source,
        }
    }

    /// Whether this error is the cooperative interruption unwind rather
    /// than a failure.
    pub fn is_interruption(&self) -> bool {
        match self {
            Error::Interrupted => true,
            Error::TaskFailed { source, .. } => source.is_interruption(),
            _ => false,
        }
    }
}

/// Converts the outcome of a whole run into a process exit code.
///
/// `0` on success, `130` when the run was interrupted, `1` otherwise.
pub fn exit_code(result: &Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) if e.is_interruption() => 130,
        Err(_) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&Ok(())), 0);
        assert_eq!(exit_code(&Err(Error::NothingToRun)), 1);
        assert_eq!(exit_code(&Err(Error::Interrupted)), 130);
    }

    #[test]
    fn test_wrapped_interruption_is_detected() {
        let err = Error::TaskFailed {
            task: "zlib".into(),
            phase: Phase::Fetch,
            source: Box::new(Error::Interrupted),
        };

        assert!(err.is_interruption());
    }
}
