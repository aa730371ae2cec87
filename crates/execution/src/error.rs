//! Scheduler error types.

use crate::diagnostics::{DebugReport, ScheduleMismatch};
use lazysched_core::{ConfigError, GraphError};

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors raised by an execution stream.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The stream stopped before the work item signalled completion
    #[error("execution stream shut down before the work completed")]
    Disconnected,

    /// The worker thread could not be started
    #[error("failed to start execution stream: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Errors that can occur while scheduling and executing segments.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// `wait_for_completion()` called before `schedule()`
    #[error("cannot wait for completion of segment `{segment}`: its handle has not been scheduled yet")]
    NotScheduled {
        /// Segment of the handle
        segment: String,
    },

    /// A handle was built with an absent argument
    #[error("argument {index} of segment `{segment}` is undefined")]
    UndefinedArgument {
        /// Segment of the handle
        segment: String,
        /// Position of the argument
        index: usize,
    },

    /// No compiler is registered for the segment's backend tag
    #[error("unsupported backend `{backend}` for segment `{segment}`")]
    UnsupportedBackend {
        /// Backend tag
        backend: String,
        /// Segment being compiled
        segment: String,
    },

    /// A forward-only backend was asked to compile a backward segment
    #[error("backend `{backend}` is forward-only and cannot compile backward segment `{segment}`")]
    BackwardUnsupported {
        /// Backend tag
        backend: String,
        /// Segment being compiled
        segment: String,
    },

    /// The backend failed to compile a segment graph
    #[error("backend `{backend}` failed to compile segment `{segment}`: {message}")]
    Compile {
        /// Backend tag
        backend: String,
        /// Segment being compiled
        segment: String,
        /// Failure description
        message: String,
    },

    /// Recorded execution differs from the schedule in segment set or count
    #[error("{0}")]
    ScheduleMismatch(Box<ScheduleMismatch>),

    /// Diagnostic report raised by `debug()`
    #[error("{0}")]
    Debug(Box<DebugReport>),

    /// A graph instance already has a handle, and the new call passes
    /// different arguments
    #[error("segment `{segment}` was called again with a different argument {index}; each graph instance runs once per scheduler")]
    ArgumentMismatch {
        /// Segment of the handle
        segment: String,
        /// Position of the first differing argument
        index: usize,
    },

    /// The compiled callable failed
    #[error("execution of segment `{segment}` failed: {message}")]
    Execution {
        /// Segment of the handle
        segment: String,
        /// Failure description
        message: String,
    },

    /// The scheduler owning a handle no longer exists
    #[error("the scheduler that created the handle for segment `{0}` has been dropped")]
    SchedulerDropped(String),

    /// The handle owning a placeholder no longer exists
    #[error("the handle owning this placeholder has been dropped")]
    HandleDropped,

    /// Graph replay or evaluation error
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    /// Segment configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Execution stream error
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),
}
