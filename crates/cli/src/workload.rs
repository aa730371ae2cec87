//! Workload files: a scheduler configuration plus a scripted sequence of
//! method calls and reads, replayed against a [`LazyScheduler`].
//!
//! A call may carry `body` steps, which run while the method is open and
//! before its own graph. A registered method called from inside another
//! compiled method belongs to the enclosing segment's trace, so it runs
//! inline and never gets a segment of its own.

use anyhow::{anyhow, bail, Context, Result};
use lazysched_core::{Graph, SchedulerConfig, SegmentRole, Tensor};
use lazysched_execution::{
    DebugReport, LazyGraphModule, LazyScheduler, MethodEntry, MethodInterceptor, ScheduleMismatch,
    SchedulerError, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info};

/// A traced method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    /// Forward graph
    pub graph: Graph,
    /// Backward graph, for `backward` calls
    #[serde(default)]
    pub backward: Option<Graph>,
    /// Compile even when no segment is declared for the method
    #[serde(default)]
    pub compiled: bool,
}

/// One method invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallStep {
    /// Method name, matched against segment declarations
    pub method: String,
    /// Names of the argument values
    #[serde(default)]
    pub args: Vec<String>,
    /// Names bound to the results
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Which graph of the method to run
    #[serde(default)]
    pub role: SegmentRole,
    /// Calls and reads made from inside the method
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<Step>,
}

/// One workload step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Invoke a method
    Call(CallStep),
    /// Read a value right away, forcing its producer to run
    Read(String),
}

/// A complete workload file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workload {
    /// Scheduler configuration
    #[serde(default)]
    pub config: SchedulerConfig,
    /// Named input tensors
    #[serde(default)]
    pub inputs: BTreeMap<String, Tensor>,
    /// Traced methods
    #[serde(default)]
    pub functions: BTreeMap<String, FunctionDef>,
    /// Steps in program order
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Values to report; every bound value when empty
    #[serde(default)]
    pub outputs: Vec<String>,
}

impl Workload {
    /// Parse a workload from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a workload file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read workload {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("invalid workload {}", path.display()))
    }

    /// Traced method and the graph a call runs.
    fn graph_for(&self, call: &CallStep) -> Result<(&FunctionDef, &Graph)> {
        let function = self
            .functions
            .get(&call.method)
            .ok_or_else(|| anyhow!("method `{}` has no traced graph", call.method))?;
        let graph = match call.role {
            SegmentRole::Forward => &function.graph,
            SegmentRole::Backward => function
                .backward
                .as_ref()
                .ok_or_else(|| anyhow!("method `{}` has no backward graph", call.method))?,
        };
        Ok((function, graph))
    }

    /// Names reported after a run.
    fn reported(&self, bound: &[String]) -> Vec<String> {
        if self.outputs.is_empty() {
            bound.to_vec()
        } else {
            self.outputs.clone()
        }
    }
}

/// What `debug()` said about a run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Diagnostics {
    /// Segment set or count differs from the schedule
    Mismatch(ScheduleMismatch),
    /// Order report
    Report(DebugReport),
}

impl std::fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Diagnostics::Mismatch(m) => m.fmt(f),
            Diagnostics::Report(r) => r.fmt(f),
        }
    }
}

/// Result of replaying a workload.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    /// Recorded order of declared segments
    pub recorded: Vec<String>,
    /// Recorded order including generated segments
    pub raw_recorded: Vec<String>,
    /// Segments deferred at least once
    pub delayed: Vec<String>,
    /// Reported values
    pub outputs: BTreeMap<String, Tensor>,
    /// Diagnostics, when requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<Diagnostics>,
}

/// Options for [`run`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Replace the configured schedule
    pub schedule_override: Option<Vec<String>>,
    /// Collect diagnostics after the run
    pub debug: bool,
}

struct Runner<'w> {
    workload: &'w Workload,
    scheduler: LazyScheduler,
    interceptor: MethodInterceptor,
    values: HashMap<String, Value>,
    bound: Vec<String>,
    modules: HashMap<(String, SegmentRole), LazyGraphModule>,
    unnamed_prefixes: HashMap<String, String>,
}

impl<'w> Runner<'w> {
    fn new(workload: &'w Workload, options: &RunOptions) -> Result<Self> {
        let mut config = workload.config.clone();
        if let Some(schedule) = &options.schedule_override {
            config.schedule = schedule.clone();
        }
        let scheduler = LazyScheduler::new(config)?;
        let interceptor = MethodInterceptor::new(scheduler.segment_table().clone());
        let values = workload
            .inputs
            .iter()
            .map(|(name, tensor)| (name.clone(), Value::Tensor(tensor.clone())))
            .collect();
        Ok(Self {
            workload,
            scheduler,
            interceptor,
            values,
            bound: Vec::new(),
            modules: HashMap::new(),
            unnamed_prefixes: HashMap::new(),
        })
    }

    fn value(&self, name: &str) -> Result<&Value> {
        self.values
            .get(name)
            .ok_or_else(|| anyhow!("value `{}` is not defined", name))
    }

    fn bind(&mut self, name: &str, value: Value) {
        if self.values.insert(name.to_string(), value).is_none() {
            self.bound.push(name.to_string());
        }
    }

    fn step(&mut self, step: &Step) -> Result<()> {
        match step {
            Step::Call(call) => {
                let entry = self.interceptor.enter(&call.method);
                let result = call
                    .body
                    .iter()
                    .try_for_each(|inner| self.step(inner))
                    .and_then(|()| self.call(call, &entry));
                self.interceptor.exit(&entry);
                result
            }
            Step::Read(name) => {
                let value = self.value(name)?.clone();
                debug!("Reading {}", name);
                value
                    .materialize()
                    .with_context(|| format!("failed to read `{}`", name))?;
                Ok(())
            }
        }
    }

    fn call(&mut self, call: &CallStep, entry: &MethodEntry) -> Result<()> {
        let workload = self.workload;
        let (function, graph) = workload.graph_for(call)?;
        let inline = match entry {
            MethodEntry::Eager => !function.compiled,
            MethodEntry::CompiledNested { prefix } => {
                debug!(
                    "{} ({}) runs inside an open compiled region",
                    call.method, prefix
                );
                true
            }
            MethodEntry::CompiledEntryPoint { .. } => false,
        };
        let args = call
            .args
            .iter()
            .map(|name| self.value(name).cloned())
            .collect::<Result<Vec<_>>>()?;

        let results: Vec<Value> = if inline {
            debug!("Running {} eagerly", call.method);
            let mut inputs = Vec::with_capacity(args.len());
            for arg in &args {
                let tensor = arg
                    .materialize()?
                    .ok_or_else(|| anyhow!("undefined argument to `{}`", call.method))?;
                inputs.push(tensor);
            }
            graph.eval(&inputs)?.into_iter().map(Value::Tensor).collect()
        } else {
            let prefix = match entry.prefix() {
                Some(prefix) => prefix.to_string(),
                None => self.unnamed_prefix(&call.method),
            };
            let key = (call.method.clone(), call.role);
            let module = match self.modules.get(&key) {
                Some(module) => module.clone(),
                None => {
                    let module = self
                        .scheduler
                        .compile_segment(graph.clone(), &prefix, call.role)?;
                    self.modules.insert(key, module.clone());
                    module
                }
            };
            module
                .call(&mut self.scheduler, args)?
                .into_iter()
                .map(Value::Async)
                .collect()
        };

        if results.len() != call.outputs.len() {
            bail!(
                "method `{}` returns {} values but {} names were given",
                call.method,
                results.len(),
                call.outputs.len()
            );
        }
        for (name, value) in call.outputs.iter().zip(results) {
            self.bind(name, value);
        }
        Ok(())
    }

    fn unnamed_prefix(&mut self, method: &str) -> String {
        if let Some(prefix) = self.unnamed_prefixes.get(method) {
            return prefix.clone();
        }
        let prefix = self.scheduler.next_unnamed_prefix();
        self.unnamed_prefixes
            .insert(method.to_string(), prefix.clone());
        prefix
    }

    fn finish(self, options: &RunOptions) -> Result<RunOutcome> {
        self.scheduler.synchronize()?;

        let mut outputs = BTreeMap::new();
        for name in self.workload.reported(&self.bound) {
            let tensor = self
                .value(&name)?
                .materialize()?
                .ok_or_else(|| anyhow!("value `{}` is undefined", name))?;
            outputs.insert(name, tensor);
        }

        let diagnostics = if options.debug {
            match self.scheduler.debug() {
                Ok(report) => Some(Diagnostics::Report(report)),
                Err(SchedulerError::Debug(report)) => Some(Diagnostics::Report(*report)),
                Err(SchedulerError::ScheduleMismatch(mismatch)) => {
                    Some(Diagnostics::Mismatch(*mismatch))
                }
                Err(err) => return Err(err.into()),
            }
        } else {
            None
        };

        Ok(RunOutcome {
            recorded: self.scheduler.recorded_execution_order(),
            raw_recorded: self.scheduler.recorder().raw_execution_order(),
            delayed: self.scheduler.delayed_segments(),
            outputs,
            diagnostics,
        })
    }
}

/// Replay a workload.
pub fn run(workload: &Workload, options: &RunOptions) -> Result<RunOutcome> {
    let mut runner = Runner::new(workload, options)?;
    for (index, step) in workload.steps.iter().enumerate() {
        runner
            .step(step)
            .with_context(|| format!("step {} failed", index))?;
    }
    let outcome = runner.finish(options)?;
    info!(
        "Run finished: {} outputs, recorded order {:?}",
        outcome.outputs.len(),
        outcome.recorded
    );
    Ok(outcome)
}

/// Evaluate every call directly, in program order, without a scheduler.
pub fn reference_outputs(workload: &Workload) -> Result<BTreeMap<String, Tensor>> {
    let mut values: HashMap<String, Tensor> = workload.inputs.clone().into_iter().collect();
    let mut bound = Vec::new();
    for (index, step) in workload.steps.iter().enumerate() {
        eval_step(workload, step, &mut values, &mut bound)
            .with_context(|| format!("step {} failed", index))?;
    }

    let mut outputs = BTreeMap::new();
    for name in workload.reported(&bound) {
        let tensor = values
            .get(&name)
            .cloned()
            .ok_or_else(|| anyhow!("value `{}` is not defined", name))?;
        outputs.insert(name, tensor);
    }
    Ok(outputs)
}

fn eval_step(
    workload: &Workload,
    step: &Step,
    values: &mut HashMap<String, Tensor>,
    bound: &mut Vec<String>,
) -> Result<()> {
    match step {
        Step::Call(call) => {
            for inner in &call.body {
                eval_step(workload, inner, values, bound)?;
            }
            let (_, graph) = workload.graph_for(call)?;
            let inputs = call
                .args
                .iter()
                .map(|name| {
                    values
                        .get(name)
                        .cloned()
                        .ok_or_else(|| anyhow!("value `{}` is not defined", name))
                })
                .collect::<Result<Vec<_>>>()?;
            let results = graph.eval(&inputs)?;
            if results.len() != call.outputs.len() {
                bail!(
                    "method `{}` returns {} values but {} names were given",
                    call.method,
                    results.len(),
                    call.outputs.len()
                );
            }
            for (name, tensor) in call.outputs.iter().zip(results) {
                if values.insert(name.clone(), tensor).is_none() {
                    bound.push(name.clone());
                }
            }
            Ok(())
        }
        Step::Read(name) => {
            if !values.contains_key(name) {
                bail!("value `{}` is not defined", name);
            }
            Ok(())
        }
    }
}

/// Names of outputs in `outcome` whose values differ from direct
/// in-order evaluation of the workload.
pub fn verify(workload: &Workload, outcome: &RunOutcome) -> Result<Vec<String>> {
    let reference = reference_outputs(workload)?;
    let mismatched = outcome
        .outputs
        .iter()
        .filter(|(name, tensor)| {
            reference
                .get(*name)
                .map_or(true, |r| !r.bitwise_eq(tensor))
        })
        .map(|(name, _)| name.clone())
        .collect();
    Ok(mismatched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lazysched_core::Segment;
    use serde_json::json;

    fn workload(schedule: serde_json::Value, steps: serde_json::Value) -> Workload {
        serde_json::from_value(json!({
            "config": {
                "schedule": schedule,
                "segments": [
                    {"name": "a_fwd", "method": "Model.a"},
                    {"name": "b_fwd", "method": "Model.b"}
                ]
            },
            "inputs": {
                "x": {"shape": [2], "data": [1.0, -2.0]}
            },
            "functions": {
                "Model.a": {
                    "graph": {
                        "inputs": [{"shape": [2]}],
                        "nodes": [{"op": "neg", "args": [{"input": 0}]}],
                        "outputs": [{"node": 0}]
                    }
                },
                "Model.b": {
                    "graph": {
                        "inputs": [{"shape": [2]}],
                        "nodes": [{"op": "add", "args": [{"input": 0}, {"input": 0}]}],
                        "outputs": [{"node": 0}]
                    }
                },
                "Model.loss": {
                    "graph": {
                        "inputs": [{"shape": [2]}, {"shape": [2]}],
                        "nodes": [
                            {"op": "add", "args": [{"input": 0}, {"input": 1}]},
                            {"op": "sum", "args": [{"node": 0}]}
                        ],
                        "outputs": [{"node": 1}]
                    }
                }
            },
            "steps": steps
        }))
        .unwrap()
    }

    fn standard_steps() -> serde_json::Value {
        json!([
            {"call": {"method": "Model.a", "args": ["x"], "outputs": ["ya"]}},
            {"call": {"method": "Model.b", "args": ["x"], "outputs": ["yb"]}},
            {"call": {"method": "Model.loss", "args": ["ya", "yb"], "outputs": ["loss"]}}
        ])
    }

    #[test]
    fn test_run_follows_schedule() {
        let w = workload(json!(["b_fwd", "a_fwd"]), standard_steps());
        let outcome = run(&w, &RunOptions { debug: true, ..Default::default() }).unwrap();

        assert_eq!(outcome.recorded, vec!["b_fwd", "a_fwd"]);
        assert_eq!(outcome.delayed, vec!["a_fwd"]);
        assert_eq!(outcome.outputs["ya"].data(), &[-1.0, 2.0]);
        assert_eq!(outcome.outputs["yb"].data(), &[2.0, -4.0]);
        assert_eq!(outcome.outputs["loss"].data(), &[-1.0]);
        match outcome.diagnostics {
            Some(Diagnostics::Report(report)) => assert!(!report.has_order_violation()),
            other => panic!("unexpected diagnostics: {:?}", other),
        }
    }

    #[test]
    fn test_early_read_is_reported() {
        let steps = json!([
            {"call": {"method": "Model.a", "args": ["x"], "outputs": ["ya"]}},
            {"read": "ya"},
            {"call": {"method": "Model.b", "args": ["x"], "outputs": ["yb"]}}
        ]);
        let w = workload(json!(["b_fwd", "a_fwd"]), steps);
        let outcome = run(&w, &RunOptions { debug: true, ..Default::default() }).unwrap();

        assert_eq!(outcome.recorded, vec!["a_fwd", "b_fwd"]);
        let Some(Diagnostics::Report(report)) = outcome.diagnostics else {
            panic!("expected a report");
        };
        assert_eq!(report.dependencies.len(), 1);
        assert_eq!(report.dependencies[0].delayed, "a_fwd");
    }

    #[test]
    fn test_missing_segment_is_a_mismatch() {
        let steps = json!([
            {"call": {"method": "Model.a", "args": ["x"], "outputs": ["ya"]}}
        ]);
        let w = workload(json!(["a_fwd", "b_fwd"]), steps);
        let outcome = run(&w, &RunOptions { debug: true, ..Default::default() }).unwrap();
        assert!(matches!(outcome.diagnostics, Some(Diagnostics::Mismatch(_))));
    }

    #[test]
    fn test_verify_matches_in_order_execution() {
        let w = workload(json!(["b_fwd", "a_fwd"]), standard_steps());
        let outcome = run(&w, &RunOptions::default()).unwrap();
        assert!(verify(&w, &outcome).unwrap().is_empty());
    }

    #[test]
    fn test_second_call_on_new_input_fails_instead_of_reusing_outputs() {
        let steps = json!([
            {"call": {"method": "Model.a", "args": ["x1"], "outputs": ["y1"]}},
            {"call": {"method": "Model.a", "args": ["x2"], "outputs": ["y2"]}}
        ]);
        let mut w = workload(json!(["a_fwd"]), steps);
        w.inputs.insert("x1".to_string(), Tensor::from_vec([2], vec![1.0, 2.0]).unwrap());
        w.inputs.insert("x2".to_string(), Tensor::from_vec([2], vec![10.0, 20.0]).unwrap());

        let err = run(&w, &RunOptions::default()).unwrap_err();
        assert!(format!("{:#}", err).contains("called again with a different argument 0"));

        let reference = reference_outputs(&w).unwrap();
        assert_eq!(reference["y1"].data(), &[-1.0, -2.0]);
        assert_eq!(reference["y2"].data(), &[-10.0, -20.0]);
    }

    #[test]
    fn test_verify_flags_outputs_that_differ_from_direct_evaluation() {
        let w = workload(json!(["b_fwd", "a_fwd"]), standard_steps());
        let mut outcome = run(&w, &RunOptions::default()).unwrap();
        outcome
            .outputs
            .insert("ya".to_string(), Tensor::from_vec([2], vec![-1.0, -2.0]).unwrap());
        assert_eq!(verify(&w, &outcome).unwrap(), vec!["ya"]);
    }

    #[test]
    fn test_nested_registered_call_runs_inside_enclosing_segment() {
        let steps = json!([
            {"call": {
                "method": "Model.outer",
                "args": ["x"],
                "outputs": ["yo"],
                "body": [
                    {"call": {"method": "Model.a", "args": ["x"], "outputs": ["ya"]}}
                ]
            }}
        ]);
        let mut w = workload(json!(["outer_fwd"]), steps);
        w.config.segments.push(Segment::new("outer_fwd", "Model.outer"));
        let outer = w.functions["Model.b"].clone();
        w.functions.insert("Model.outer".to_string(), outer);

        let outcome = run(&w, &RunOptions::default()).unwrap();
        assert_eq!(outcome.raw_recorded, vec!["outer_fwd"]);
        assert_eq!(outcome.outputs["ya"].data(), &[-1.0, 2.0]);
        assert_eq!(outcome.outputs["yo"].data(), &[2.0, -4.0]);
        assert!(verify(&w, &outcome).unwrap().is_empty());

        // Called on its own, the same method opens its own segment.
        let alone = json!([
            {"call": {"method": "Model.a", "args": ["x"], "outputs": ["ya"]}}
        ]);
        w.steps = serde_json::from_value(alone).unwrap();
        w.config.schedule = vec!["a_fwd".to_string()];
        let outcome = run(&w, &RunOptions::default()).unwrap();
        assert_eq!(outcome.raw_recorded, vec!["a_fwd"]);
    }

    #[test]
    fn test_compiled_unregistered_method_gets_unnamed_segment() {
        let mut w = workload(json!(["a_fwd"]), json!([
            {"call": {"method": "Model.a", "args": ["x"], "outputs": ["ya"]}},
            {"call": {"method": "Model.loss", "args": ["ya", "x"], "outputs": ["loss"]}}
        ]));
        w.config.segments.retain(|s| s.name == "a_fwd");
        if let Some(f) = w.functions.get_mut("Model.loss") {
            f.compiled = true;
        }
        let outcome = run(&w, &RunOptions::default()).unwrap();
        assert_eq!(outcome.recorded, vec!["a_fwd"]);
        assert_eq!(outcome.raw_recorded, vec!["a_fwd", "__unnamed_0_fwd"]);
        assert_eq!(outcome.outputs["loss"].data(), &[0.0]);
    }

    #[test]
    fn test_undefined_value_fails_the_step() {
        let steps = json!([
            {"call": {"method": "Model.a", "args": ["nope"], "outputs": ["ya"]}}
        ]);
        let w = workload(json!([]), steps);
        let err = run(&w, &RunOptions::default()).unwrap_err();
        assert!(format!("{:#}", err).contains("`nope` is not defined"));
    }

    #[test]
    fn test_workload_file_roundtrip() {
        let w = workload(json!(["a_fwd", "b_fwd"]), standard_steps());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workload.json");
        std::fs::write(&path, serde_json::to_string_pretty(&w).unwrap()).unwrap();
        let loaded = Workload::from_path(&path).unwrap();
        assert_eq!(loaded.steps.len(), 3);
        assert_eq!(loaded.config.schedule, vec!["a_fwd", "b_fwd"]);
    }
}
