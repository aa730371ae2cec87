//! Schedule-driven admission of segment invocations.
//!
//! Every compiled segment invocation reaches [`LazyScheduler::maybe_run`].
//! The scheduler builds (or reuses) a handle for the graph instance and then
//! walks the schedule from the start: the invocation is admitted only when
//! every instance scheduled before it already has a handle. Admitted
//! invocations schedule all of those handles first, then their own.
//! Everything else is deferred until a later admission or a read of one of
//! its placeholders forces it.

use crate::compile::{BackendRegistry, CompiledFn, LazyGraphModule, SegmentBackend};
use crate::context::ExecutionContext;
use crate::diagnostics::{find_delayed_segment_dependencies, DebugReport, ScheduleMismatch};
use crate::error::{Result, SchedulerError};
use crate::handle::AsyncFuncHandle;
use crate::placeholder::{AsyncTensor, Value};
use crate::recorder::ExecutionRecorder;
use crate::registry::{GraphInstance, SegmentRegistry};
use crate::stream::ExecutionStream;
use indexmap::IndexMap;
use lazysched_core::{
    is_internal_segment_name, segment_name, Graph, GraphId, SchedulerConfig, SegmentRole,
    SegmentTable, UNNAMED_SEGMENT_PREFIX, UNREGISTERED_SEGMENT_PREFIX,
};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// One scheduler per run. All hooks take it by `&mut`.
pub struct LazyScheduler {
    config: SchedulerConfig,
    table: SegmentTable,
    backends: BackendRegistry,
    context: Arc<ExecutionContext>,
    registry: SegmentRegistry,
    /// Handles by graph instance, in creation order
    handles: IndexMap<GraphId, Arc<AsyncFuncHandle>>,
    next_unnamed: usize,
}

impl LazyScheduler {
    /// Validate the configuration and start the configured stream.
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        let context = ExecutionContext::for_stream_kind(config.stream)?;
        Self::with_context(config, context)
    }

    /// Use an externally provided execution stream.
    pub fn with_stream(config: SchedulerConfig, stream: Arc<dyn ExecutionStream>) -> Result<Self> {
        Self::with_context(config, ExecutionContext::new(stream))
    }

    fn with_context(config: SchedulerConfig, context: ExecutionContext) -> Result<Self> {
        let table = config.validate()?;
        info!(
            "Scheduler ready: {} segments, schedule {:?}, stream {}",
            config.segments.len(),
            config.schedule,
            context.stream().name()
        );
        Ok(Self {
            config,
            table,
            backends: BackendRegistry::with_builtins(),
            context: Arc::new(context),
            registry: SegmentRegistry::new(),
            handles: IndexMap::new(),
            next_unnamed: 0,
        })
    }

    /// Add or replace a backend.
    pub fn register_backend(&mut self, backend: Arc<dyn SegmentBackend>) {
        self.backends.register(backend);
    }

    /// Run configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Validated segment declarations.
    pub fn segment_table(&self) -> &SegmentTable {
        &self.table
    }

    /// Registered graph instances.
    pub fn registry(&self) -> &SegmentRegistry {
        &self.registry
    }

    /// Execution recorder.
    pub fn recorder(&self) -> &ExecutionRecorder {
        self.context.recorder()
    }

    /// Handle created for a graph instance, if any.
    pub fn handle(&self, instance: &GraphInstance) -> Option<&Arc<AsyncFuncHandle>> {
        self.handles.get(&instance.id)
    }

    /// All handles in creation order.
    pub fn handles(&self) -> impl Iterator<Item = &Arc<AsyncFuncHandle>> {
        self.handles.values()
    }

    /// Fresh prefix for a region no segment was declared for.
    pub fn next_unnamed_prefix(&mut self) -> String {
        let prefix = format!("{}{}", UNNAMED_SEGMENT_PREFIX, self.next_unnamed);
        self.next_unnamed += 1;
        prefix
    }

    /// Segment name for a compiled role. A named prefix compiling a role the
    /// user did not declare is moved under the unregistered prefix.
    pub fn resolve_segment_name(&self, prefix: &str, role: SegmentRole) -> String {
        let name = segment_name(prefix, role);
        if is_internal_segment_name(prefix) || self.table.is_user_specified(&name) {
            return name;
        }
        segment_name(&format!("{}{}", UNREGISTERED_SEGMENT_PREFIX, prefix), role)
    }

    /// Compile one traced graph for a segment prefix and role and register
    /// it. The returned module routes every call through [`Self::maybe_run`].
    pub fn compile_segment(
        &mut self,
        graph: Graph,
        prefix: &str,
        role: SegmentRole,
    ) -> Result<LazyGraphModule> {
        let name = self.resolve_segment_name(prefix, role);
        let backend_tag = self.table.backend_for_prefix(prefix).to_string();
        let backend = self
            .backends
            .get(&backend_tag)
            .ok_or_else(|| SchedulerError::UnsupportedBackend {
                backend: backend_tag.clone(),
                segment: name.clone(),
            })?;
        if role == SegmentRole::Backward && !backend.supports_backward() {
            return Err(SchedulerError::BackwardUnsupported {
                backend: backend_tag,
                segment: name,
            });
        }

        graph.validate()?;
        if graph.has_inplace_ops() {
            self.recorder().mark_inplace(prefix);
        }
        if graph.accesses_shared_state() {
            self.recorder().mark_shared_state(prefix);
        }

        let graph = Arc::new(graph);
        let compiled = backend
            .compile(Arc::clone(&graph))
            .map_err(|err| SchedulerError::Compile {
                backend: backend_tag.clone(),
                segment: name.clone(),
                message: format!("{:#}", err),
            })?;
        let instance = self.registry.register(&name, graph);
        info!(
            "Compiled segment {} ({}) with backend {}",
            name, instance.fingerprint, backend_tag
        );
        Ok(LazyGraphModule::new(instance, compiled))
    }

    /// Handle one invocation of a compiled segment. Always returns the
    /// placeholders right away; the callable runs now only if admitted.
    pub fn maybe_run(
        &mut self,
        instance: &Arc<GraphInstance>,
        func: Arc<dyn CompiledFn>,
        args: Vec<Value>,
    ) -> Result<Vec<AsyncTensor>> {
        let instance = self.canonical_instance(instance);
        let mut metas = Vec::with_capacity(args.len());
        for (index, arg) in args.iter().enumerate() {
            let meta = arg.meta().ok_or_else(|| SchedulerError::UndefinedArgument {
                segment: instance.segment_name.clone(),
                index,
            })?;
            metas.push(meta);
        }
        let out_metas = instance.graph.infer(&metas)?;

        let handle = match self.handles.get(&instance.id) {
            Some(handle) => {
                let previous = handle.args();
                if let Some(index) = (0..args.len().max(previous.len())).find(|&i| {
                    match (args.get(i), previous.get(i)) {
                        (Some(a), Some(b)) => !a.same_as(b),
                        _ => true,
                    }
                }) {
                    return Err(SchedulerError::ArgumentMismatch {
                        segment: instance.segment_name.clone(),
                        index,
                    });
                }
                debug!("Reusing handle {} for segment {}", handle.id(), instance.segment_name);
                Arc::clone(handle)
            }
            None => {
                let handle = AsyncFuncHandle::new(
                    func,
                    instance.segment_name.clone(),
                    args,
                    out_metas,
                    &self.context,
                )?;
                self.registry.append_if_absent(&instance);
                self.handles.insert(instance.id, Arc::clone(&handle));
                handle
            }
        };

        match self.admit(&instance) {
            Some(preceding) => {
                for earlier in &preceding {
                    earlier.schedule()?;
                }
                handle.schedule()?;
            }
            None => {
                debug!("Segment {} is delayed", instance.segment_name);
                self.recorder().mark_delayed(&instance.segment_name);
            }
        }
        Ok(handle.outputs().to_vec())
    }

    fn canonical_instance(&self, instance: &Arc<GraphInstance>) -> Arc<GraphInstance> {
        self.registry
            .instances(&instance.segment_name)
            .and_then(|instances| {
                instances
                    .iter()
                    .find(|g| g.fingerprint == instance.fingerprint)
                    .cloned()
            })
            .unwrap_or_else(|| Arc::clone(instance))
    }

    /// Handles that must be scheduled before `current`, or `None` if some
    /// instance scheduled earlier does not exist yet.
    fn admit(&self, current: &GraphInstance) -> Option<Vec<Arc<AsyncFuncHandle>>> {
        let mut preceding = Vec::new();
        for name in &self.config.schedule {
            let instances = self.registry.instances(name)?;
            for g in instances {
                if g.segment_name == current.segment_name && g.fingerprint == current.fingerprint {
                    return Some(preceding);
                }
                preceding.push(Arc::clone(self.handles.get(&g.id)?));
            }
        }
        Some(preceding)
    }

    /// Record that a segment executed.
    pub fn record_execution(&self, segment_name: &str) {
        self.recorder().record_execution(segment_name);
    }

    /// Recorded execution order of user-declared segments.
    pub fn recorded_execution_order(&self) -> Vec<String> {
        self.recorder().recorded_execution_order()
    }

    /// Segments deferred at least once.
    pub fn delayed_segments(&self) -> Vec<String> {
        self.recorder().delayed_segments()
    }

    /// Compare the recorded order with the schedule.
    ///
    /// A different segment set or count fails with
    /// [`SchedulerError::ScheduleMismatch`]. Otherwise the report is
    /// returned as [`SchedulerError::Debug`] when the order differs or
    /// `always_raise` is set, and as `Ok` otherwise.
    pub fn debug(&self) -> Result<DebugReport> {
        let schedule = self.config.schedule.clone();
        let recorded = self.recorded_execution_order();

        let schedule_set: BTreeSet<&String> = schedule.iter().collect();
        let recorded_set: BTreeSet<&String> = recorded.iter().collect();
        if schedule.len() != recorded.len() || schedule_set != recorded_set {
            return Err(SchedulerError::ScheduleMismatch(Box::new(ScheduleMismatch {
                schedule,
                recorded,
            })));
        }

        let dependencies = if schedule != recorded {
            find_delayed_segment_dependencies(&schedule, &recorded)
        } else {
            Vec::new()
        };
        let report = DebugReport {
            schedule,
            recorded,
            dependencies,
            delayed_segments: self.recorder().delayed_segments(),
            inplace_segments: self.recorder().inplace_segments(),
            shared_state_segments: self.recorder().shared_state_segments(),
        };

        if self.config.debug.always_raise || report.has_order_violation() {
            return Err(SchedulerError::Debug(Box::new(report)));
        }
        Ok(report)
    }

    /// Schedule every handle that is still deferred, then wait for all of
    /// them. Deferred handles go in schedule order first, then in creation
    /// order.
    pub fn synchronize(&self) -> Result<()> {
        let mut ordered: Vec<Arc<AsyncFuncHandle>> = Vec::new();
        let mut seen: HashSet<GraphId> = HashSet::new();
        for name in &self.config.schedule {
            for g in self.registry.instances(name).unwrap_or_default() {
                if let Some(handle) = self.handles.get(&g.id) {
                    if seen.insert(g.id) {
                        ordered.push(Arc::clone(handle));
                    }
                }
            }
        }
        for (id, handle) in &self.handles {
            if seen.insert(*id) {
                ordered.push(Arc::clone(handle));
            }
        }

        let pending = ordered.iter().filter(|h| !h.is_scheduled()).count();
        if pending > 0 {
            info!("Synchronizing {} deferred segments", pending);
        }
        for handle in &ordered {
            handle.schedule()?;
        }
        for handle in &ordered {
            handle.wait_for_completion()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for LazyScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyScheduler")
            .field("schedule", &self.config.schedule)
            .field("registry", &self.registry)
            .field("handles", &self.handles.len())
            .finish()
    }
}
