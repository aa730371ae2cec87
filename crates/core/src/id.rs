//! Identifiers for graph instances and execution handles.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unique identifier for one traced graph instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GraphId(Ulid);

impl GraphId {
    /// Generate a new GraphId
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for GraphId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GraphId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for GraphId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Unique identifier for an execution handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleId(Ulid);

impl HandleId {
    /// Generate a new HandleId
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Structural fingerprint of a graph: ordered operation list plus the
/// shape/type signature of its inputs, attributes and outputs.
///
/// Two separately traced graphs doing the same work share a fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphFingerprint(u64);

impl GraphFingerprint {
    /// Wrap a raw hash value.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw hash value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for GraphFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
