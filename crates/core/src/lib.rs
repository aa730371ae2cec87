//! lazysched core data models.
//!
//! This crate defines the data shared by the scheduler and its
//! collaborators: tensors and their descriptors, the traced graph IR,
//! segment declarations and the run configuration.

#![warn(missing_docs)]

// Identities
mod id;

// Values and graphs
mod tensor;
mod graph;

// Segments and configuration
mod segment;
mod config;

mod error;

// Re-exports
pub use id::*;

pub use tensor::{DType, Tensor, TensorMeta};
pub use graph::{Graph, Node, OpKind, ValueRef};

pub use segment::{
    is_internal_segment_name, segment_name, split_segment_name, Segment, SegmentRole,
    AOT_EAGER_BACKEND, EAGER_BACKEND, UNNAMED_SEGMENT_PREFIX, UNREGISTERED_SEGMENT_PREFIX,
};
pub use config::{DebugConfig, SchedulerConfig, SegmentTable, StreamKind};

pub use error::{ConfigError, GraphError};
