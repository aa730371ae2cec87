//! Execution streams and completion tokens.
//!
//! A stream accepts work items and runs them in enqueue order. Each
//! enqueue returns a [`CompletionToken`] that can be polled or waited on.
//! Nothing here knows about segments or tensors.

use crate::error::StreamError;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

/// A unit of work submitted to a stream.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Completion of one enqueued work item.
pub trait CompletionToken: Send + Sync {
    /// Non-blocking poll.
    fn is_complete(&self) -> bool;

    /// Block until the work item has finished.
    ///
    /// Parks the calling thread. The [`WorkerStream`] token waits with
    /// tokio's `blocking_recv`, which panics when called from within an
    /// async runtime; call it from plain threads or `spawn_blocking`.
    fn wait(&self) -> Result<(), StreamError>;
}

/// Somewhere to run work.
pub trait ExecutionStream: Send + Sync {
    /// Enqueue work; items complete in enqueue order.
    fn enqueue(&self, work: Work) -> Arc<dyn CompletionToken>;

    /// Stream name for logs.
    fn name(&self) -> &str;
}

/// Token for work that already ran.
#[derive(Debug, Default)]
pub struct ReadyToken;

impl CompletionToken for ReadyToken {
    fn is_complete(&self) -> bool {
        true
    }

    fn wait(&self) -> Result<(), StreamError> {
        Ok(())
    }
}

/// Runs every work item on the calling thread during `enqueue`.
#[derive(Debug, Default)]
pub struct InlineStream;

impl InlineStream {
    /// Create an inline stream.
    pub fn new() -> Self {
        Self
    }
}

impl ExecutionStream for InlineStream {
    fn enqueue(&self, work: Work) -> Arc<dyn CompletionToken> {
        work();
        Arc::new(ReadyToken)
    }

    fn name(&self) -> &str {
        "inline"
    }
}

/// Token resolved by a [`WorkerStream`] once its work item has run.
pub struct StreamEvent {
    done: AtomicBool,
    failed: AtomicBool,
    receiver: Mutex<Option<oneshot::Receiver<()>>>,
}

impl StreamEvent {
    fn new(receiver: oneshot::Receiver<()>) -> Self {
        Self {
            done: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            receiver: Mutex::new(Some(receiver)),
        }
    }

    fn resolve(&self, ok: bool) {
        if !ok {
            self.failed.store(true, Ordering::Release);
        }
        self.done.store(true, Ordering::Release);
    }

    fn outcome(&self) -> Result<(), StreamError> {
        if self.failed.load(Ordering::Acquire) {
            Err(StreamError::Disconnected)
        } else {
            Ok(())
        }
    }
}

impl CompletionToken for StreamEvent {
    fn is_complete(&self) -> bool {
        if self.done.load(Ordering::Acquire) {
            return true;
        }
        // A concurrent `wait` holds the receiver until the work finishes.
        let Some(mut guard) = self.receiver.try_lock() else {
            return self.done.load(Ordering::Acquire);
        };
        let Some(receiver) = guard.as_mut() else {
            return self.done.load(Ordering::Acquire);
        };
        match receiver.try_recv() {
            Ok(()) => {
                guard.take();
                self.resolve(true);
                true
            }
            Err(oneshot::error::TryRecvError::Empty) => false,
            Err(oneshot::error::TryRecvError::Closed) => {
                guard.take();
                self.resolve(false);
                true
            }
        }
    }

    fn wait(&self) -> Result<(), StreamError> {
        let mut guard = self.receiver.lock();
        if let Some(receiver) = guard.take() {
            let ok = receiver.blocking_recv().is_ok();
            self.resolve(ok);
        }
        self.outcome()
    }
}

struct Job {
    work: Work,
    done: oneshot::Sender<()>,
}

/// One background thread draining a FIFO queue, so work completes in
/// enqueue order while the control thread keeps tracing.
pub struct WorkerStream {
    name: String,
    sender: Option<mpsc::UnboundedSender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl WorkerStream {
    /// Start the worker thread.
    pub fn new(name: impl Into<String>) -> Result<Self, StreamError> {
        let name = name.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let worker = std::thread::Builder::new()
            .name(format!("lazysched-{}", name))
            .spawn(move || {
                while let Some(job) = receiver.blocking_recv() {
                    let Job { work, done } = job;
                    match std::panic::catch_unwind(AssertUnwindSafe(work)) {
                        Ok(()) => {
                            let _ = done.send(());
                        }
                        // Dropping `done` resolves the token as disconnected.
                        Err(_) => error!("work item panicked on execution stream"),
                    }
                }
            })?;
        debug!("Started execution stream {}", name);
        Ok(Self {
            name,
            sender: Some(sender),
            worker: Some(worker),
        })
    }
}

impl ExecutionStream for WorkerStream {
    fn enqueue(&self, work: Work) -> Arc<dyn CompletionToken> {
        let (done, receiver) = oneshot::channel();
        let event = Arc::new(StreamEvent::new(receiver));
        match &self.sender {
            Some(sender) => {
                if sender.send(Job { work, done }).is_err() {
                    error!("execution stream {} is closed", self.name);
                }
            }
            None => error!("execution stream {} is closed", self.name),
        }
        event
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for WorkerStream {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("execution stream {} worker exited abnormally", self.name);
            }
        }
    }
}
