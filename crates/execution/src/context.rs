//! Per-run execution context shared between the scheduler and its handles.

use crate::error::Result;
use crate::recorder::ExecutionRecorder;
use crate::stream::{ExecutionStream, InlineStream, WorkerStream};
use lazysched_core::StreamKind;
use std::sync::Arc;

/// Stream plus recorder for one scheduler run.
///
/// The scheduler owns the only strong reference; handles hold a `Weak`.
pub struct ExecutionContext {
    stream: Arc<dyn ExecutionStream>,
    recorder: ExecutionRecorder,
}

impl ExecutionContext {
    /// Context over an existing stream.
    pub fn new(stream: Arc<dyn ExecutionStream>) -> Self {
        Self {
            stream,
            recorder: ExecutionRecorder::new(),
        }
    }

    /// Context over the configured stream kind.
    pub fn for_stream_kind(kind: StreamKind) -> Result<Self> {
        let stream: Arc<dyn ExecutionStream> = match kind {
            StreamKind::Inline => Arc::new(InlineStream::new()),
            StreamKind::Worker => Arc::new(WorkerStream::new("segments")?),
        };
        Ok(Self::new(stream))
    }

    /// Execution stream.
    pub fn stream(&self) -> &dyn ExecutionStream {
        self.stream.as_ref()
    }

    /// Execution recorder.
    pub fn recorder(&self) -> &ExecutionRecorder {
        &self.recorder
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("stream", &self.stream.name())
            .field("recorder", &self.recorder)
            .finish()
    }
}
