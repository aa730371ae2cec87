//! Traced graph IR.
//!
//! A [`Graph`] is what the capture layer hands to the scheduler for one
//! segment instance: an ordered list of operations over the graph inputs,
//! captured attributes and earlier nodes. The scheduler only needs three
//! things from it:
//! - descriptor-only replay ([`Graph::infer`]) to build placeholders,
//! - a structural [`GraphFingerprint`] to recognise equivalent captures,
//! - concrete evaluation ([`Graph::eval`]) for the built-in backends.

use crate::error::GraphError;
use crate::id::GraphFingerprint;
use crate::tensor::{Tensor, TensorMeta};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

/// Reference to a value inside a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueRef {
    /// Graph input by position
    Input(usize),
    /// Output of an earlier node
    Node(usize),
}

impl std::fmt::Display for ValueRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueRef::Input(i) => write!(f, "%in{}", i),
            ValueRef::Node(i) => write!(f, "%{}", i),
        }
    }
}

/// Operation kinds understood by the IR.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    /// Elementwise add (rhs may be a scalar)
    Add,
    /// Elementwise subtract (rhs may be a scalar)
    Sub,
    /// Elementwise multiply (rhs may be a scalar)
    Mul,
    /// Negation
    Neg,
    /// max(x, 0)
    Relu,
    /// 2-D matrix product
    Matmul,
    /// 2-D transpose
    Transpose,
    /// Sum of all elements to a scalar
    Sum,
    /// In-place add into the first argument
    #[serde(rename = "add_")]
    AddInplace,
    /// In-place multiply into the first argument
    #[serde(rename = "mul_")]
    MulInplace,
    /// Read a captured attribute (module attribute or global)
    GetAttr(String),
}

impl OpKind {
    /// Operator name as it appears in a trace.
    pub fn name(&self) -> &str {
        match self {
            OpKind::Add => "add",
            OpKind::Sub => "sub",
            OpKind::Mul => "mul",
            OpKind::Neg => "neg",
            OpKind::Relu => "relu",
            OpKind::Matmul => "matmul",
            OpKind::Transpose => "transpose",
            OpKind::Sum => "sum",
            OpKind::AddInplace => "add_",
            OpKind::MulInplace => "mul_",
            OpKind::GetAttr(_) => "get_attr",
        }
    }

    /// Whether the op mutates one of its arguments. Trailing underscore
    /// is the in-place naming convention.
    pub fn is_inplace(&self) -> bool {
        self.name().ends_with('_')
    }

    fn arity(&self) -> usize {
        match self {
            OpKind::Add
            | OpKind::Sub
            | OpKind::Mul
            | OpKind::Matmul
            | OpKind::AddInplace
            | OpKind::MulInplace => 2,
            OpKind::Neg | OpKind::Relu | OpKind::Transpose | OpKind::Sum => 1,
            OpKind::GetAttr(_) => 0,
        }
    }
}

/// One operation in a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Operation
    pub op: OpKind,
    /// Arguments
    #[serde(default)]
    pub args: Vec<ValueRef>,
}

impl Node {
    /// Create a node.
    pub fn new(op: OpKind, args: Vec<ValueRef>) -> Self {
        Self { op, args }
    }
}

/// A traced segment graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    /// Input descriptors observed at capture time
    pub inputs: Vec<TensorMeta>,
    /// Operations in capture order
    pub nodes: Vec<Node>,
    /// Returned values
    pub outputs: Vec<ValueRef>,
    /// Captured attributes read through `get_attr`
    #[serde(default)]
    pub attrs: BTreeMap<String, Tensor>,
}

impl Graph {
    /// Create an empty graph over the given inputs.
    pub fn new(inputs: impl Into<Vec<TensorMeta>>) -> Self {
        Self {
            inputs: inputs.into(),
            nodes: Vec::new(),
            outputs: Vec::new(),
            attrs: BTreeMap::new(),
        }
    }

    /// Append a node and return a reference to its result.
    pub fn push(&mut self, op: OpKind, args: &[ValueRef]) -> ValueRef {
        self.nodes.push(Node::new(op, args.to_vec()));
        ValueRef::Node(self.nodes.len() - 1)
    }

    /// Add a captured attribute.
    pub fn with_attr(mut self, name: impl Into<String>, value: Tensor) -> Self {
        self.attrs.insert(name.into(), value);
        self
    }

    /// Set the graph outputs.
    pub fn with_outputs(mut self, outputs: impl Into<Vec<ValueRef>>) -> Self {
        self.outputs = outputs.into();
        self
    }

    /// Whether any node mutates its arguments in place.
    pub fn has_inplace_ops(&self) -> bool {
        self.nodes.iter().any(|n| n.op.is_inplace())
    }

    /// Whether any node reads captured shared state.
    pub fn accesses_shared_state(&self) -> bool {
        self.nodes.iter().any(|n| matches!(n.op, OpKind::GetAttr(_)))
    }

    /// Structural fingerprint: op sequence, argument wiring, outputs and
    /// the shape/type signature of inputs and attributes.
    pub fn fingerprint(&self) -> GraphFingerprint {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.inputs.hash(&mut hasher);
        for node in &self.nodes {
            node.op.hash(&mut hasher);
            node.args.hash(&mut hasher);
        }
        self.outputs.hash(&mut hasher);
        for (name, value) in &self.attrs {
            name.hash(&mut hasher);
            value.meta().hash(&mut hasher);
            for x in value.data() {
                x.to_bits().hash(&mut hasher);
            }
        }
        GraphFingerprint::from_raw(hasher.finish())
    }

    /// Check wiring: every reference points backwards and arities match.
    pub fn validate(&self) -> Result<(), GraphError> {
        for (index, node) in self.nodes.iter().enumerate() {
            if node.args.len() != node.op.arity() {
                return Err(GraphError::Arity {
                    node: index,
                    op: node.op.name().to_string(),
                    expected: node.op.arity(),
                    actual: node.args.len(),
                });
            }
            for arg in &node.args {
                self.check_ref(*arg, index, &format!("node {}", index))?;
            }
            if let OpKind::GetAttr(name) = &node.op {
                if !self.attrs.contains_key(name) {
                    return Err(GraphError::UnknownAttribute(name.clone()));
                }
            }
        }
        for output in &self.outputs {
            self.check_ref(*output, self.nodes.len(), "outputs")?;
        }
        Ok(())
    }

    fn check_ref(&self, r: ValueRef, before: usize, location: &str) -> Result<(), GraphError> {
        let ok = match r {
            ValueRef::Input(i) => i < self.inputs.len(),
            ValueRef::Node(i) => i < before,
        };
        if ok {
            Ok(())
        } else {
            Err(GraphError::DanglingRef {
                reference: r.to_string(),
                location: location.to_string(),
            })
        }
    }

    /// Descriptor-only replay: output descriptors for the given input
    /// descriptors. Touches no data and has no side effects.
    pub fn infer(&self, inputs: &[TensorMeta]) -> Result<Vec<TensorMeta>, GraphError> {
        self.validate()?;
        self.check_input_count(inputs.len())?;
        let mut values: Vec<TensorMeta> = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let args: Vec<&TensorMeta> = node
                .args
                .iter()
                .map(|r| match r {
                    ValueRef::Input(i) => &inputs[*i],
                    ValueRef::Node(i) => &values[*i],
                })
                .collect();
            let meta = self.infer_node(&node.op, &args)?;
            values.push(meta);
        }
        Ok(self
            .outputs
            .iter()
            .map(|r| match r {
                ValueRef::Input(i) => inputs[*i].clone(),
                ValueRef::Node(i) => values[*i].clone(),
            })
            .collect())
    }

    fn infer_node(&self, op: &OpKind, args: &[&TensorMeta]) -> Result<TensorMeta, GraphError> {
        match op {
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::AddInplace | OpKind::MulInplace => {
                let (lhs, rhs) = (args[0], args[1]);
                check_dtype(op, lhs, rhs)?;
                if lhs.shape != rhs.shape && rhs.numel() != 1 {
                    return Err(GraphError::ShapeMismatch {
                        op: op.name().to_string(),
                        lhs: lhs.shape.clone(),
                        rhs: rhs.shape.clone(),
                    });
                }
                Ok(lhs.clone())
            }
            OpKind::Neg | OpKind::Relu => Ok(args[0].clone()),
            OpKind::Sum => Ok(TensorMeta::new(Vec::new(), args[0].dtype)),
            OpKind::Transpose => {
                let x = args[0];
                check_rank(op, x, 2)?;
                Ok(TensorMeta::new([x.shape[1], x.shape[0]], x.dtype))
            }
            OpKind::Matmul => {
                let (lhs, rhs) = (args[0], args[1]);
                check_dtype(op, lhs, rhs)?;
                check_rank(op, lhs, 2)?;
                check_rank(op, rhs, 2)?;
                if lhs.shape[1] != rhs.shape[0] {
                    return Err(GraphError::ShapeMismatch {
                        op: op.name().to_string(),
                        lhs: lhs.shape.clone(),
                        rhs: rhs.shape.clone(),
                    });
                }
                Ok(TensorMeta::new([lhs.shape[0], rhs.shape[1]], lhs.dtype))
            }
            OpKind::GetAttr(name) => self
                .attrs
                .get(name)
                .map(|t| t.meta().clone())
                .ok_or_else(|| GraphError::UnknownAttribute(name.clone())),
        }
    }

    /// Evaluate the graph on concrete inputs.
    pub fn eval(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>, GraphError> {
        self.validate()?;
        self.check_input_count(inputs.len())?;
        let mut values: Vec<Tensor> = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let args: Vec<&Tensor> = node
                .args
                .iter()
                .map(|r| match r {
                    ValueRef::Input(i) => &inputs[*i],
                    ValueRef::Node(i) => &values[*i],
                })
                .collect();
            let metas: Vec<&TensorMeta> = args.iter().map(|t| t.meta()).collect();
            let out_meta = self.infer_node(&node.op, &metas)?;
            let data = eval_node(&node.op, &args, &out_meta, &self.attrs)?;
            values.push(Tensor::new(out_meta, data)?);
        }
        Ok(self
            .outputs
            .iter()
            .map(|r| match r {
                ValueRef::Input(i) => inputs[*i].clone(),
                ValueRef::Node(i) => values[*i].clone(),
            })
            .collect())
    }

    fn check_input_count(&self, actual: usize) -> Result<(), GraphError> {
        if actual != self.inputs.len() {
            return Err(GraphError::InputCount {
                expected: self.inputs.len(),
                actual,
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inputs: Vec<String> = self.inputs.iter().map(|m| m.to_string()).collect();
        writeln!(f, "graph({})", inputs.join(", "))?;
        for (i, node) in self.nodes.iter().enumerate() {
            let args: Vec<String> = node.args.iter().map(|a| a.to_string()).collect();
            match &node.op {
                OpKind::GetAttr(name) => writeln!(f, "  %{} = get_attr[{}]", i, name)?,
                op => writeln!(f, "  %{} = {}({})", i, op.name(), args.join(", "))?,
            }
        }
        let outputs: Vec<String> = self.outputs.iter().map(|o| o.to_string()).collect();
        write!(f, "  return ({})", outputs.join(", "))
    }
}

fn check_dtype(op: &OpKind, lhs: &TensorMeta, rhs: &TensorMeta) -> Result<(), GraphError> {
    if lhs.dtype != rhs.dtype {
        return Err(GraphError::DTypeMismatch {
            op: op.name().to_string(),
            lhs: lhs.dtype.to_string(),
            rhs: rhs.dtype.to_string(),
        });
    }
    Ok(())
}

fn check_rank(op: &OpKind, meta: &TensorMeta, expected: usize) -> Result<(), GraphError> {
    if meta.rank() != expected {
        return Err(GraphError::Rank {
            op: op.name().to_string(),
            expected,
            actual: meta.rank(),
        });
    }
    Ok(())
}

fn eval_node(
    op: &OpKind,
    args: &[&Tensor],
    out: &TensorMeta,
    attrs: &BTreeMap<String, Tensor>,
) -> Result<Vec<f32>, GraphError> {
    let binary = |f: fn(f32, f32) -> f32| -> Vec<f32> {
        let (lhs, rhs) = (args[0].data(), args[1].data());
        if rhs.len() == lhs.len() {
            lhs.iter().zip(rhs).map(|(a, b)| f(*a, *b)).collect()
        } else {
            lhs.iter().map(|a| f(*a, rhs[0])).collect()
        }
    };
    let data = match op {
        OpKind::Add | OpKind::AddInplace => binary(|a, b| a + b),
        OpKind::Sub => binary(|a, b| a - b),
        OpKind::Mul | OpKind::MulInplace => binary(|a, b| a * b),
        OpKind::Neg => args[0].data().iter().map(|x| -x).collect(),
        OpKind::Relu => args[0].data().iter().map(|x| x.max(0.0)).collect(),
        OpKind::Sum => vec![args[0].data().iter().sum::<f32>()],
        OpKind::Transpose => {
            let (rows, cols) = (args[0].shape()[0], args[0].shape()[1]);
            let src = args[0].data();
            let mut dst = vec![0.0; src.len()];
            for r in 0..rows {
                for c in 0..cols {
                    dst[c * rows + r] = src[r * cols + c];
                }
            }
            dst
        }
        OpKind::Matmul => {
            let (m, k) = (args[0].shape()[0], args[0].shape()[1]);
            let n = args[1].shape()[1];
            let (a, b) = (args[0].data(), args[1].data());
            let mut dst = vec![0.0; m * n];
            for i in 0..m {
                for p in 0..k {
                    let lhs = a[i * k + p];
                    for j in 0..n {
                        dst[i * n + j] += lhs * b[p * n + j];
                    }
                }
            }
            dst
        }
        OpKind::GetAttr(name) => attrs
            .get(name)
            .map(|t| t.data().to_vec())
            .ok_or_else(|| GraphError::UnknownAttribute(name.clone()))?,
    };
    debug_assert_eq!(data.len(), out.numel());
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DType;

    fn affine_graph() -> Graph {
        let mut g = Graph::new([TensorMeta::new([2, 2], DType::F32)])
            .with_attr("w", Tensor::from_vec([2, 2], vec![1.0, 0.0, 0.0, 2.0]).unwrap());
        let w = g.push(OpKind::GetAttr("w".into()), &[]);
        let y = g.push(OpKind::Matmul, &[ValueRef::Input(0), w]);
        let z = g.push(OpKind::Relu, &[y]);
        g.with_outputs([z])
    }

    #[test]
    fn test_infer_matches_eval_shapes() {
        let g = affine_graph();
        let x = Tensor::from_vec([2, 2], vec![1.0, -2.0, 3.0, 4.0]).unwrap();
        let metas = g.infer(&[x.meta().clone()]).unwrap();
        let outs = g.eval(&[x]).unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(&metas[0], outs[0].meta());
        assert_eq!(outs[0].data(), &[1.0, 0.0, 3.0, 8.0]);
    }

    #[test]
    fn test_fingerprint_is_structural() {
        assert_eq!(affine_graph().fingerprint(), affine_graph().fingerprint());

        let mut other = affine_graph();
        other.nodes[2].op = OpKind::Neg;
        assert_ne!(affine_graph().fingerprint(), other.fingerprint());

        let mut reshaped = affine_graph();
        reshaped.inputs[0] = TensorMeta::new([2, 2], DType::F16);
        assert_ne!(affine_graph().fingerprint(), reshaped.fingerprint());
    }

    #[test]
    fn test_detects_inplace_and_shared_state() {
        let g = affine_graph();
        assert!(g.accesses_shared_state());
        assert!(!g.has_inplace_ops());

        let mut h = Graph::new([TensorMeta::new([3], DType::F32)]);
        let y = h.push(OpKind::AddInplace, &[ValueRef::Input(0), ValueRef::Input(0)]);
        let h = h.with_outputs([y]);
        assert!(h.has_inplace_ops());
        assert!(!h.accesses_shared_state());
    }

    #[test]
    fn test_validate_rejects_forward_reference() {
        let mut g = Graph::new([TensorMeta::new([1], DType::F32)]);
        g.nodes.push(Node::new(OpKind::Neg, vec![ValueRef::Node(0)]));
        assert!(matches!(g.validate(), Err(GraphError::DanglingRef { .. })));
    }

    #[test]
    fn test_infer_reports_shape_mismatch() {
        let mut g = Graph::new([
            TensorMeta::new([2], DType::F32),
            TensorMeta::new([3], DType::F32),
        ]);
        let y = g.push(OpKind::Add, &[ValueRef::Input(0), ValueRef::Input(1)]);
        let g = g.with_outputs([y]);
        let err = g.infer(&g.inputs.clone()).unwrap_err();
        assert!(matches!(err, GraphError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_scalar_broadcast_and_sum() {
        let mut g = Graph::new([TensorMeta::new([3], DType::F32), TensorMeta::scalar()]);
        let y = g.push(OpKind::Mul, &[ValueRef::Input(0), ValueRef::Input(1)]);
        let s = g.push(OpKind::Sum, &[y]);
        let g = g.with_outputs([y, s]);
        let outs = g
            .eval(&[
                Tensor::from_vec([3], vec![1.0, 2.0, 3.0]).unwrap(),
                Tensor::scalar(2.0),
            ])
            .unwrap();
        assert_eq!(outs[0].data(), &[2.0, 4.0, 6.0]);
        assert_eq!(outs[1].data(), &[12.0]);
    }

    #[test]
    fn test_graph_json_shape() {
        let g: Graph = serde_json::from_value(serde_json::json!({
            "inputs": [{"shape": [2]}],
            "nodes": [
                {"op": "add_", "args": [{"input": 0}, {"input": 0}]},
                {"op": {"get_attr": "bias"}},
                {"op": "add", "args": [{"node": 0}, {"node": 1}]}
            ],
            "outputs": [{"node": 2}],
            "attrs": {"bias": {"shape": [2], "data": [0.5, 0.5]}}
        }))
        .unwrap();
        let out = g.eval(&[Tensor::from_vec([2], vec![1.0, 2.0]).unwrap()]).unwrap();
        assert_eq!(out[0].data(), &[2.5, 4.5]);
        assert!(g.to_string().contains("add_(%in0, %in0)"));
    }
}
