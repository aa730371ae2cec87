//! Error types for graphs and segment configuration.

/// Errors raised while replaying or evaluating a graph.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    /// Wrong number of graph inputs
    #[error("graph expects {expected} inputs, got {actual}")]
    InputCount {
        /// Declared input count
        expected: usize,
        /// Supplied input count
        actual: usize,
    },

    /// An operation received the wrong number of arguments
    #[error("node {node} ({op}) expects {expected} arguments, got {actual}")]
    Arity {
        /// Node index
        node: usize,
        /// Operation name
        op: String,
        /// Expected argument count
        expected: usize,
        /// Actual argument count
        actual: usize,
    },

    /// A value reference points at an input or node that does not exist yet
    #[error("dangling reference {reference} in {location}")]
    DanglingRef {
        /// The offending reference
        reference: String,
        /// Where it was found
        location: String,
    },

    /// Shapes are incompatible for an operation
    #[error("shape mismatch in {op}: {lhs:?} vs {rhs:?}")]
    ShapeMismatch {
        /// Operation name
        op: String,
        /// Left shape
        lhs: Vec<usize>,
        /// Right shape
        rhs: Vec<usize>,
    },

    /// Element types are incompatible for an operation
    #[error("dtype mismatch in {op}: {lhs} vs {rhs}")]
    DTypeMismatch {
        /// Operation name
        op: String,
        /// Left dtype
        lhs: String,
        /// Right dtype
        rhs: String,
    },

    /// Operation requires a specific rank
    #[error("{op} requires rank {expected}, got rank {actual}")]
    Rank {
        /// Operation name
        op: String,
        /// Required rank
        expected: usize,
        /// Actual rank
        actual: usize,
    },

    /// Referenced graph attribute is missing
    #[error("unknown graph attribute `{0}`")]
    UnknownAttribute(String),

    /// Tensor data does not match its shape
    #[error("tensor of shape {shape:?} needs {expected} elements, got {actual}")]
    DataLength {
        /// Tensor shape
        shape: Vec<usize>,
        /// Required element count
        expected: usize,
        /// Supplied element count
        actual: usize,
    },
}

/// Errors in the declared segments or schedule.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Segment name does not end with `_fwd` / `_bwd`
    #[error("segment name must end with '_fwd' or '_bwd': `{0}`")]
    InvalidSegmentName(String),

    /// Segment name uses a prefix reserved for generated segments
    #[error("segment name `{name}` must not start with the reserved prefix '{prefix}'")]
    ReservedPrefix {
        /// Offending name
        name: String,
        /// Reserved prefix
        prefix: String,
    },

    /// The same segment was declared twice
    #[error("segment `{0}` is declared more than once")]
    DuplicateSegment(String),

    /// The same name appears twice in the schedule
    #[error("segment `{0}` appears more than once in the schedule")]
    DuplicateScheduleEntry(String),

    /// Eager backend used for a backward segment or with a backward counterpart
    #[error("segment `{segment}` uses the 'eager' backend, which is forward-only: {reason}")]
    EagerBackward {
        /// Offending segment
        segment: String,
        /// Explanation
        reason: String,
    },

    /// Forward and backward segments of one prefix disagree on the backend
    #[error("segments `{fwd}` ({fwd_backend}) and `{bwd}` ({bwd_backend}) must use the same backend")]
    BackendConflict {
        /// Forward segment name
        fwd: String,
        /// Forward backend
        fwd_backend: String,
        /// Backward segment name
        bwd: String,
        /// Backward backend
        bwd_backend: String,
    },

    /// A method was registered under two different prefixes
    #[error("method `{method}` is already registered with segment prefix `{existing}`, cannot register it with `{requested}`")]
    MethodConflict {
        /// Method identifier
        method: String,
        /// Prefix already bound
        existing: String,
        /// Prefix requested now
        requested: String,
    },

    /// I/O error while reading a config file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while parsing a config
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
