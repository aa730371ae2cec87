//! Segment instance registry.

use indexmap::IndexMap;
use lazysched_core::{Graph, GraphFingerprint, GraphId};
use std::sync::Arc;
use tracing::debug;

/// One traced graph registered under a segment name.
#[derive(Debug)]
pub struct GraphInstance {
    /// Instance ID
    pub id: GraphId,
    /// Segment name (`{prefix}_fwd` / `{prefix}_bwd`)
    pub segment_name: String,
    /// The traced graph
    pub graph: Arc<Graph>,
    /// Structural fingerprint of `graph`
    pub fingerprint: GraphFingerprint,
}

impl GraphInstance {
    /// Wrap a graph, computing its fingerprint.
    pub fn new(segment_name: impl Into<String>, graph: Arc<Graph>) -> Self {
        let fingerprint = graph.fingerprint();
        Self {
            id: GraphId::new(),
            segment_name: segment_name.into(),
            graph,
            fingerprint,
        }
    }
}

/// Segment name to graph instances, both in registration order.
///
/// Within one segment name a fingerprint is registered at most once, so a
/// fingerprint identifies an instance.
#[derive(Debug, Default)]
pub struct SegmentRegistry {
    segments: IndexMap<String, Vec<Arc<GraphInstance>>>,
}

impl SegmentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a graph under a segment name, reusing the existing
    /// instance when an equivalent graph is already registered.
    pub fn register(&mut self, segment_name: &str, graph: Arc<Graph>) -> Arc<GraphInstance> {
        let fingerprint = graph.fingerprint();
        if let Some(existing) = self.find(segment_name, fingerprint) {
            debug!(
                "Graph {} already registered for segment {}",
                fingerprint, segment_name
            );
            return existing;
        }
        let instance = Arc::new(GraphInstance::new(segment_name, graph));
        self.append(Arc::clone(&instance));
        instance
    }

    /// Append an instance unless it is already present. Returns whether it
    /// was added.
    pub fn append_if_absent(&mut self, instance: &Arc<GraphInstance>) -> bool {
        if self
            .find(&instance.segment_name, instance.fingerprint)
            .is_some()
        {
            return false;
        }
        self.append(Arc::clone(instance));
        true
    }

    fn append(&mut self, instance: Arc<GraphInstance>) {
        debug!(
            "Registering graph {} for segment {}",
            instance.fingerprint, instance.segment_name
        );
        self.segments
            .entry(instance.segment_name.clone())
            .or_default()
            .push(instance);
    }

    fn find(&self, segment_name: &str, fingerprint: GraphFingerprint) -> Option<Arc<GraphInstance>> {
        self.segments
            .get(segment_name)?
            .iter()
            .find(|g| g.fingerprint == fingerprint)
            .cloned()
    }

    /// Instances registered under a segment name, or `None` if the name
    /// has never been registered.
    pub fn instances(&self, segment_name: &str) -> Option<&[Arc<GraphInstance>]> {
        self.segments.get(segment_name).map(Vec::as_slice)
    }

    /// Whether the name has any registered instance.
    pub fn contains(&self, segment_name: &str) -> bool {
        self.segments.contains_key(segment_name)
    }

    /// Segment names in first-registration order.
    pub fn segment_names(&self) -> impl Iterator<Item = &str> {
        self.segments.keys().map(String::as_str)
    }

    /// Total number of instances.
    pub fn len(&self) -> usize {
        self.segments.values().map(Vec::len).sum()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lazysched_core::{OpKind, TensorMeta, ValueRef};

    fn graph(op: OpKind) -> Arc<Graph> {
        let mut g = Graph::new(vec![TensorMeta::scalar()]);
        let y = g.push(op, &[ValueRef::Input(0)]);
        Arc::new(g.with_outputs(vec![y]))
    }

    #[test]
    fn test_register_preserves_order() {
        let mut registry = SegmentRegistry::new();
        let a = registry.register("b_fwd", graph(OpKind::Neg));
        let b = registry.register("a_fwd", graph(OpKind::Relu));
        let c = registry.register("b_fwd", graph(OpKind::Relu));

        assert_eq!(registry.segment_names().collect::<Vec<_>>(), vec!["b_fwd", "a_fwd"]);
        let b_instances = registry.instances("b_fwd").unwrap();
        assert_eq!(b_instances.len(), 2);
        assert_eq!(b_instances[0].id, a.id);
        assert_eq!(b_instances[1].id, c.id);
        assert_eq!(registry.instances("a_fwd").unwrap()[0].id, b.id);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_equivalent_graphs_share_an_instance() {
        let mut registry = SegmentRegistry::new();
        let first = registry.register("a_fwd", graph(OpKind::Neg));
        let second = registry.register("a_fwd", graph(OpKind::Neg));
        assert_eq!(first.id, second.id);
        assert_eq!(registry.len(), 1);

        // Same graph under another name is a separate instance.
        let other = registry.register("b_fwd", graph(OpKind::Neg));
        assert_ne!(first.id, other.id);
    }

    #[test]
    fn test_append_if_absent() {
        let mut registry = SegmentRegistry::new();
        let instance = Arc::new(GraphInstance::new("a_fwd", graph(OpKind::Neg)));
        assert!(registry.append_if_absent(&instance));
        assert!(!registry.append_if_absent(&instance));
        assert!(registry.contains("a_fwd"));
        assert!(registry.instances("c_fwd").is_none());
        assert!(!registry.is_empty());
    }
}
