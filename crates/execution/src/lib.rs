//! Execution layer - deferred segment handles, schedule-driven admission
//! and run diagnostics.

#![warn(missing_docs)]

pub mod stream;
pub mod placeholder;
pub mod handle;
pub mod context;
pub mod recorder;
pub mod registry;
pub mod compile;
pub mod entry;
pub mod scheduler;
pub mod diagnostics;
pub mod error;

pub use stream::{CompletionToken, ExecutionStream, InlineStream, ReadyToken, WorkerStream};
pub use placeholder::{AsyncTensor, Value};
pub use handle::AsyncFuncHandle;
pub use context::ExecutionContext;
pub use recorder::{ExecutionEntry, ExecutionRecorder};
pub use registry::{GraphInstance, SegmentRegistry};
pub use compile::{BackendRegistry, CompiledFn, InterpreterBackend, LazyGraphModule, SegmentBackend};
pub use entry::{MethodEntry, MethodInterceptor};
pub use scheduler::LazyScheduler;
pub use diagnostics::{find_delayed_segment_dependencies, DebugReport, DependencyWindow, ScheduleMismatch};
pub use error::{Result, SchedulerError, StreamError};
