//! Deferred invocation of one compiled segment.

use crate::compile::CompiledFn;
use crate::context::ExecutionContext;
use crate::error::{Result, SchedulerError};
use crate::placeholder::{AsyncTensor, Value};
use crate::stream::CompletionToken;
use lazysched_core::{HandleId, Tensor, TensorMeta};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, debug_span, info, warn};

type Outcome = std::result::Result<Vec<Option<Tensor>>, String>;

enum HandleState {
    Pending,
    /// Arguments are being materialized
    Scheduling,
    Scheduled(Arc<dyn CompletionToken>),
}

/// A compiled segment plus its arguments and output placeholders.
///
/// Building a handle executes nothing. [`AsyncFuncHandle::schedule`]
/// resolves the arguments and enqueues the callable exactly once;
/// [`AsyncFuncHandle::wait_for_completion`] blocks and fills in the
/// placeholders.
pub struct AsyncFuncHandle {
    id: HandleId,
    segment_name: String,
    func: Arc<dyn CompiledFn>,
    args: Vec<Value>,
    outs: Vec<AsyncTensor>,
    context: Weak<ExecutionContext>,
    state: Mutex<HandleState>,
    outcome: Arc<Mutex<Option<Outcome>>>,
    materialized: Mutex<bool>,
}

impl AsyncFuncHandle {
    /// Build a handle with one placeholder per output descriptor.
    pub fn new(
        func: Arc<dyn CompiledFn>,
        segment_name: impl Into<String>,
        args: Vec<Value>,
        out_metas: Vec<TensorMeta>,
        context: &Arc<ExecutionContext>,
    ) -> Result<Arc<Self>> {
        let segment_name = segment_name.into();
        if let Some(index) = args.iter().position(|a| matches!(a, Value::Undefined)) {
            return Err(SchedulerError::UndefinedArgument {
                segment: segment_name,
                index,
            });
        }
        let context = Arc::downgrade(context);
        Ok(Arc::new_cyclic(|weak: &Weak<AsyncFuncHandle>| {
            let outs = out_metas
                .into_iter()
                .map(|meta| AsyncTensor::new(meta, weak.clone()))
                .collect();
            Self {
                id: HandleId::new(),
                segment_name,
                func,
                args,
                outs,
                context,
                state: Mutex::new(HandleState::Pending),
                outcome: Arc::new(Mutex::new(None)),
                materialized: Mutex::new(false),
            }
        }))
    }

    /// Handle ID.
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Segment this handle runs.
    pub fn segment_name(&self) -> &str {
        &self.segment_name
    }

    /// Output placeholders, in output order.
    pub fn outputs(&self) -> &[AsyncTensor] {
        &self.outs
    }

    /// Arguments as passed at construction.
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Whether the callable has been enqueued.
    pub fn is_scheduled(&self) -> bool {
        matches!(*self.state.lock(), HandleState::Scheduled(_))
    }

    /// Non-blocking poll; `false` until scheduled and finished.
    pub fn is_completed(&self) -> bool {
        match &*self.state.lock() {
            HandleState::Scheduled(token) => token.is_complete(),
            _ => false,
        }
    }

    /// Materialize the arguments, record the segment and enqueue the
    /// callable. Calling it again is a no-op.
    pub fn schedule(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match &*state {
                HandleState::Pending => *state = HandleState::Scheduling,
                HandleState::Scheduling | HandleState::Scheduled(_) => {
                    debug!("Handle is already scheduled, segment name: {}", self.segment_name);
                    return Ok(());
                }
            }
        }

        match self.launch() {
            Ok(token) => {
                *self.state.lock() = HandleState::Scheduled(token);
                Ok(())
            }
            Err(err) => {
                *self.state.lock() = HandleState::Pending;
                Err(err)
            }
        }
    }

    fn launch(&self) -> Result<Arc<dyn CompletionToken>> {
        let mut inputs = Vec::with_capacity(self.args.len());
        for (index, arg) in self.args.iter().enumerate() {
            match arg.materialize()? {
                Some(tensor) => inputs.push(tensor),
                None => {
                    return Err(SchedulerError::UndefinedArgument {
                        segment: self.segment_name.clone(),
                        index,
                    })
                }
            }
        }

        let context = self
            .context
            .upgrade()
            .ok_or_else(|| SchedulerError::SchedulerDropped(self.segment_name.clone()))?;

        info!("Scheduling segment {}", self.segment_name);
        context.recorder().record_execution(&self.segment_name);

        let func = Arc::clone(&self.func);
        let outcome = Arc::clone(&self.outcome);
        let segment = self.segment_name.clone();
        let token = context.stream().enqueue(Box::new(move || {
            let _span = debug_span!("segment", name = %segment).entered();
            let result = func.call(&inputs).map_err(|err| format!("{:#}", err));
            *outcome.lock() = Some(result);
        }));
        Ok(token)
    }

    /// Block until the callable has run, then fill in the placeholders.
    pub fn wait_for_completion(&self) -> Result<()> {
        let token = match &*self.state.lock() {
            HandleState::Scheduled(token) => Arc::clone(token),
            _ => {
                return Err(SchedulerError::NotScheduled {
                    segment: self.segment_name.clone(),
                })
            }
        };
        token.wait()?;

        let mut materialized = self.materialized.lock();
        if *materialized {
            return Ok(());
        }
        let outcome = self.outcome.lock();
        let values = match outcome.as_ref() {
            Some(Ok(values)) => values,
            Some(Err(message)) => {
                return Err(SchedulerError::Execution {
                    segment: self.segment_name.clone(),
                    message: message.clone(),
                })
            }
            None => {
                return Err(SchedulerError::Execution {
                    segment: self.segment_name.clone(),
                    message: "the work item finished without producing a result".to_string(),
                })
            }
        };
        if values.len() != self.outs.len() {
            return Err(SchedulerError::Execution {
                segment: self.segment_name.clone(),
                message: format!(
                    "produced {} outputs, expected {}",
                    values.len(),
                    self.outs.len()
                ),
            });
        }

        for (value, placeholder) in values.iter().zip(&self.outs) {
            let value = value.clone().unwrap_or_else(|| Tensor::scalar(0.0));
            if value.meta() != placeholder.meta() {
                warn!(
                    "Segment {} produced {} where {} was inferred",
                    self.segment_name,
                    value.meta(),
                    placeholder.meta()
                );
            }
            placeholder.materialize_with_value(value);
        }
        *materialized = true;
        debug!("Materialized {} outputs of segment {}", self.outs.len(), self.segment_name);
        Ok(())
    }
}

impl std::fmt::Debug for AsyncFuncHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncFuncHandle")
            .field("id", &self.id)
            .field("segment_name", &self.segment_name)
            .field("scheduled", &self.is_scheduled())
            .field("outputs", &self.outs)
            .finish()
    }
}
