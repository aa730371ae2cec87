//! Segment backends and lazily-run compiled modules.
//!
//! A backend turns one traced segment graph into a [`CompiledFn`]. The
//! result is never invoked directly: [`LazyGraphModule::call`] hands it to
//! the scheduler, which decides when it actually runs.

use crate::error::Result;
use crate::placeholder::{AsyncTensor, Value};
use crate::registry::GraphInstance;
use crate::scheduler::LazyScheduler;
use lazysched_core::{Graph, Tensor, AOT_EAGER_BACKEND, EAGER_BACKEND};
use std::collections::HashMap;
use std::sync::Arc;

/// A compiled segment, callable on concrete tensors.
///
/// An output of `None` stands for a value the segment does not produce;
/// the handle materializes it as a scalar zero.
pub trait CompiledFn: Send + Sync {
    /// Run the segment.
    fn call(&self, inputs: &[Tensor]) -> anyhow::Result<Vec<Option<Tensor>>>;
}

impl<F> CompiledFn for F
where
    F: Fn(&[Tensor]) -> anyhow::Result<Vec<Option<Tensor>>> + Send + Sync,
{
    fn call(&self, inputs: &[Tensor]) -> anyhow::Result<Vec<Option<Tensor>>> {
        self(inputs)
    }
}

/// Compiler for segment graphs, selected by backend tag.
pub trait SegmentBackend: Send + Sync {
    /// Backend tag used in segment declarations.
    fn name(&self) -> &str;

    /// Whether backward segments can be compiled.
    fn supports_backward(&self) -> bool;

    /// Compile a graph into a callable.
    fn compile(&self, graph: Arc<Graph>) -> anyhow::Result<Arc<dyn CompiledFn>>;
}

/// Backend that evaluates the graph op by op.
#[derive(Debug, Clone)]
pub struct InterpreterBackend {
    name: String,
    backward: bool,
}

impl InterpreterBackend {
    /// Forward-only interpreter, tag `eager`.
    pub fn eager() -> Self {
        Self {
            name: EAGER_BACKEND.to_string(),
            backward: false,
        }
    }

    /// Forward and backward interpreter, tag `aot_eager`.
    pub fn aot_eager() -> Self {
        Self {
            name: AOT_EAGER_BACKEND.to_string(),
            backward: true,
        }
    }
}

impl SegmentBackend for InterpreterBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_backward(&self) -> bool {
        self.backward
    }

    fn compile(&self, graph: Arc<Graph>) -> anyhow::Result<Arc<dyn CompiledFn>> {
        graph.validate()?;
        let run = move |inputs: &[Tensor]| -> anyhow::Result<Vec<Option<Tensor>>> {
            let outputs = graph.eval(inputs)?;
            Ok(outputs.into_iter().map(Some).collect())
        };
        Ok(Arc::new(run))
    }
}

/// Backends by tag.
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn SegmentBackend>>,
}

impl BackendRegistry {
    /// Registry without any backend.
    pub fn empty() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    /// Registry with the `eager` and `aot_eager` interpreters.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(InterpreterBackend::eager()));
        registry.register(Arc::new(InterpreterBackend::aot_eager()));
        registry
    }

    /// Add or replace a backend under its own tag.
    pub fn register(&mut self, backend: Arc<dyn SegmentBackend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    /// Backend for a tag.
    pub fn get(&self, name: &str) -> Option<Arc<dyn SegmentBackend>> {
        self.backends.get(name).cloned()
    }

    /// Registered tags, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// A compiled segment whose invocations go through the scheduler.
#[derive(Clone)]
pub struct LazyGraphModule {
    instance: Arc<GraphInstance>,
    compiled: Arc<dyn CompiledFn>,
}

impl LazyGraphModule {
    pub(crate) fn new(instance: Arc<GraphInstance>, compiled: Arc<dyn CompiledFn>) -> Self {
        Self { instance, compiled }
    }

    /// Segment this module belongs to.
    pub fn segment_name(&self) -> &str {
        &self.instance.segment_name
    }

    /// Registered graph instance.
    pub fn instance(&self) -> &Arc<GraphInstance> {
        &self.instance
    }

    /// Invoke the segment. Returns placeholders immediately; the work runs
    /// now or later depending on the schedule.
    pub fn call(&self, scheduler: &mut LazyScheduler, args: Vec<Value>) -> Result<Vec<AsyncTensor>> {
        scheduler.maybe_run(&self.instance, Arc::clone(&self.compiled), args)
    }
}

impl std::fmt::Debug for LazyGraphModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyGraphModule")
            .field("segment", &self.instance.segment_name)
            .field("fingerprint", &self.instance.fingerprint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lazysched_core::{OpKind, TensorMeta, ValueRef};

    fn double_graph() -> Arc<Graph> {
        let mut graph = Graph::new(vec![TensorMeta::new([2], Default::default())]);
        let x = ValueRef::Input(0);
        let y = graph.push(OpKind::Add, &[x, x]);
        Arc::new(graph.with_outputs(vec![y]))
    }

    #[test]
    fn test_builtins_are_registered() {
        let registry = BackendRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["aot_eager", "eager"]);
        assert!(!registry.get("eager").unwrap().supports_backward());
        assert!(registry.get("aot_eager").unwrap().supports_backward());
        assert!(registry.get("inductor").is_none());
    }

    #[test]
    fn test_interpreter_compiles_and_runs() {
        let backend = InterpreterBackend::aot_eager();
        let compiled = backend.compile(double_graph()).unwrap();
        let x = Tensor::from_vec([2], vec![1.5, -2.0]).unwrap();
        let out = compiled.call(&[x]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref().unwrap().data(), &[3.0, -4.0]);
    }

    #[test]
    fn test_interpreter_rejects_invalid_graph() {
        let mut graph = Graph::new(vec![TensorMeta::scalar()]);
        graph.push(OpKind::Neg, &[ValueRef::Node(5)]);
        let result = InterpreterBackend::eager().compile(Arc::new(graph));
        assert!(result.is_err());
    }

    #[test]
    fn test_closures_are_compiled_fns() {
        let f = |inputs: &[Tensor]| -> anyhow::Result<Vec<Option<Tensor>>> {
            Ok(vec![inputs.first().cloned(), None])
        };
        let out = CompiledFn::call(&f, &[Tensor::scalar(4.0)]).unwrap();
        assert_eq!(out[0].as_ref().unwrap().data(), &[4.0]);
        assert!(out[1].is_none());
    }

    struct Custom;

    impl SegmentBackend for Custom {
        fn name(&self) -> &str {
            "inductor"
        }

        fn supports_backward(&self) -> bool {
            true
        }

        fn compile(&self, _graph: Arc<Graph>) -> anyhow::Result<Arc<dyn CompiledFn>> {
            anyhow::bail!("not available in this build")
        }
    }

    #[test]
    fn test_register_custom_backend() {
        let mut registry = BackendRegistry::empty();
        registry.register(Arc::new(Custom));
        let backend = registry.get("inductor").unwrap();
        assert!(backend.compile(double_graph()).is_err());
    }
}
