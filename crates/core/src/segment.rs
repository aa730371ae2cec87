//! Segment declarations and naming rules.

use serde::{Deserialize, Serialize};

/// Prefix of segments generated for code outside any declared segment.
pub const UNNAMED_SEGMENT_PREFIX: &str = "__unnamed_";

/// Prefix of segments derived from a declared prefix but not themselves
/// declared (e.g. the backward of a declared forward segment).
pub const UNREGISTERED_SEGMENT_PREFIX: &str = "__unregistered_";

/// Forward-only backend that runs the traced graph as is.
pub const EAGER_BACKEND: &str = "eager";

/// Default backend; supports both forward and backward segments.
pub const AOT_EAGER_BACKEND: &str = "aot_eager";

/// Whether a segment runs in the forward or the backward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SegmentRole {
    /// Forward pass (also used for single-shot segments)
    #[default]
    Forward,
    /// Backward pass
    Backward,
}

impl SegmentRole {
    /// Name suffix for this role.
    pub fn suffix(self) -> &'static str {
        match self {
            SegmentRole::Forward => "_fwd",
            SegmentRole::Backward => "_bwd",
        }
    }
}

/// Full segment name for a prefix and role.
pub fn segment_name(prefix: &str, role: SegmentRole) -> String {
    format!("{}{}", prefix, role.suffix())
}

/// Split a segment name into its prefix and role.
pub fn split_segment_name(name: &str) -> Option<(&str, SegmentRole)> {
    if let Some(prefix) = name.strip_suffix(SegmentRole::Forward.suffix()) {
        return (!prefix.is_empty()).then_some((prefix, SegmentRole::Forward));
    }
    if let Some(prefix) = name.strip_suffix(SegmentRole::Backward.suffix()) {
        return (!prefix.is_empty()).then_some((prefix, SegmentRole::Backward));
    }
    None
}

/// Whether a name was generated internally rather than declared.
pub fn is_internal_segment_name(name: &str) -> bool {
    name.starts_with(UNNAMED_SEGMENT_PREFIX) || name.starts_with(UNREGISTERED_SEGMENT_PREFIX)
}

/// A user-declared segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Segment name, ending in `_fwd` or `_bwd`
    pub name: String,

    /// Identifier of the method whose work forms this segment
    pub method: String,

    /// Backend tag; `None` inherits the configured default
    #[serde(default)]
    pub backend: Option<String>,
}

impl Segment {
    /// Declare a segment.
    pub fn new(name: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            method: method.into(),
            backend: None,
        }
    }

    /// Set the backend tag.
    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    /// Prefix (name without the role suffix), if the name is well formed.
    pub fn prefix(&self) -> Option<&str> {
        split_segment_name(&self.name).map(|(prefix, _)| prefix)
    }

    /// Role, if the name is well formed.
    pub fn role(&self) -> Option<SegmentRole> {
        split_segment_name(&self.name).map(|(_, role)| role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_name_roundtrip() {
        let name = segment_name("block1", SegmentRole::Backward);
        assert_eq!(name, "block1_bwd");
        assert_eq!(split_segment_name(&name), Some(("block1", SegmentRole::Backward)));
    }

    #[test]
    fn test_split_rejects_bad_names() {
        assert_eq!(split_segment_name("block1"), None);
        assert_eq!(split_segment_name("_fwd"), None);
        assert_eq!(split_segment_name("a_fwd_x"), None);
    }

    #[test]
    fn test_internal_names() {
        assert!(is_internal_segment_name("__unnamed_3_fwd"));
        assert!(is_internal_segment_name("__unregistered_block_bwd"));
        assert!(!is_internal_segment_name("block_fwd"));
    }

    #[test]
    fn test_segment_accessors() {
        let seg = Segment::new("attn_fwd", "Layer.attention").with_backend("eager");
        assert_eq!(seg.prefix(), Some("attn"));
        assert_eq!(seg.role(), Some(SegmentRole::Forward));
        assert_eq!(seg.backend.as_deref(), Some("eager"));
    }
}
