//! Placeholder outputs and segment arguments.

use crate::error::{Result, SchedulerError};
use crate::handle::AsyncFuncHandle;
use lazysched_core::{Tensor, TensorMeta};
use std::sync::{Arc, OnceLock, Weak};

/// Stand-in for a tensor that a handle has not produced yet.
///
/// Before materialization it only knows its shape and dtype. Reading the
/// value through [`AsyncTensor::materialize`] forces the owning handle to
/// run, which is how real data dependencies override the requested order.
#[derive(Clone)]
pub struct AsyncTensor {
    inner: Arc<AsyncTensorInner>,
}

struct AsyncTensorInner {
    meta: TensorMeta,
    value: OnceLock<Tensor>,
    handle: Weak<AsyncFuncHandle>,
}

impl AsyncTensor {
    pub(crate) fn new(meta: TensorMeta, handle: Weak<AsyncFuncHandle>) -> Self {
        Self {
            inner: Arc::new(AsyncTensorInner {
                meta,
                value: OnceLock::new(),
                handle,
            }),
        }
    }

    /// Shape and dtype.
    pub fn meta(&self) -> &TensorMeta {
        &self.inner.meta
    }

    /// Whether the concrete value is available.
    pub fn is_materialized(&self) -> bool {
        self.inner.value.get().is_some()
    }

    /// Concrete value, if already materialized. Never blocks.
    pub fn try_get(&self) -> Option<Tensor> {
        self.inner.value.get().cloned()
    }

    /// Segment of the owning handle, if it is still alive.
    pub fn segment_name(&self) -> Option<String> {
        self.inner
            .handle
            .upgrade()
            .map(|h| h.segment_name().to_string())
    }

    /// Concrete value, scheduling and waiting on the owning handle first
    /// if needed.
    pub fn materialize(&self) -> Result<Tensor> {
        if let Some(value) = self.inner.value.get() {
            return Ok(value.clone());
        }
        let handle = self
            .inner
            .handle
            .upgrade()
            .ok_or(SchedulerError::HandleDropped)?;
        handle.schedule()?;
        handle.wait_for_completion()?;
        self.inner
            .value
            .get()
            .cloned()
            .ok_or_else(|| SchedulerError::Execution {
                segment: handle.segment_name().to_string(),
                message: "handle completed without materializing its outputs".to_string(),
            })
    }

    /// Set the concrete value. Returns `false` if it was already set.
    pub(crate) fn materialize_with_value(&self, value: Tensor) -> bool {
        self.inner.value.set(value).is_ok()
    }

    /// Whether two placeholders are the same object.
    pub fn ptr_eq(&self, other: &AsyncTensor) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for AsyncTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncTensor")
            .field("meta", &self.inner.meta)
            .field("materialized", &self.is_materialized())
            .finish()
    }
}

/// An argument passed to a segment.
#[derive(Debug, Clone)]
pub enum Value {
    /// Concrete tensor
    Tensor(Tensor),
    /// Output of another (possibly deferred) segment
    Async(AsyncTensor),
    /// Absent value; rejected when a handle is built
    Undefined,
}

impl Value {
    /// Descriptor of the value, `None` when undefined.
    pub fn meta(&self) -> Option<TensorMeta> {
        match self {
            Value::Tensor(t) => Some(t.meta().clone()),
            Value::Async(a) => Some(a.meta().clone()),
            Value::Undefined => None,
        }
    }

    /// Concrete tensor, materializing placeholders.
    pub fn materialize(&self) -> Result<Option<Tensor>> {
        match self {
            Value::Tensor(t) => Ok(Some(t.clone())),
            Value::Async(a) => a.materialize().map(Some),
            Value::Undefined => Ok(None),
        }
    }

    /// Whether two arguments are the same input: bitwise-equal tensors or
    /// the same placeholder object. Undefined never matches.
    pub fn same_as(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Tensor(a), Value::Tensor(b)) => a.bitwise_eq(b),
            (Value::Async(a), Value::Async(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl From<Tensor> for Value {
    fn from(tensor: Tensor) -> Self {
        Value::Tensor(tensor)
    }
}

impl From<AsyncTensor> for Value {
    fn from(tensor: AsyncTensor) -> Self {
        Value::Async(tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orphan_placeholder_reports_dropped_handle() {
        let placeholder = AsyncTensor::new(TensorMeta::scalar(), Weak::new());
        assert!(!placeholder.is_materialized());
        assert!(placeholder.try_get().is_none());
        assert!(placeholder.segment_name().is_none());
        assert!(matches!(
            placeholder.materialize(),
            Err(SchedulerError::HandleDropped)
        ));
    }

    #[test]
    fn test_materialize_with_value_only_once() {
        let placeholder = AsyncTensor::new(TensorMeta::scalar(), Weak::new());
        assert!(placeholder.materialize_with_value(Tensor::scalar(1.0)));
        assert!(!placeholder.materialize_with_value(Tensor::scalar(2.0)));
        assert_eq!(placeholder.materialize().unwrap().data(), &[1.0]);
    }

    #[test]
    fn test_value_meta() {
        let t = Tensor::from_vec([2], vec![1.0, 2.0]).unwrap();
        assert_eq!(Value::from(t.clone()).meta(), Some(t.meta().clone()));
        assert_eq!(Value::Undefined.meta(), None);
        assert!(Value::Undefined.materialize().unwrap().is_none());
    }
}
