//! Scheduler configuration and segment declaration checks.

use crate::error::ConfigError;
use crate::segment::{
    segment_name, Segment, SegmentRole, AOT_EAGER_BACKEND, EAGER_BACKEND,
    UNNAMED_SEGMENT_PREFIX, UNREGISTERED_SEGMENT_PREFIX,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

/// Where segment work is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Run work on the calling thread as soon as it is enqueued
    #[default]
    Inline,
    /// Run work on a dedicated background thread in enqueue order
    Worker,
}

/// Diagnostics behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugConfig {
    /// Raise the debug report even when execution matched the schedule
    #[serde(default = "default_always_raise")]
    pub always_raise: bool,
}

fn default_always_raise() -> bool {
    true
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            always_raise: default_always_raise(),
        }
    }
}

fn default_backend() -> String {
    AOT_EAGER_BACKEND.to_string()
}

/// Configuration of one scheduler run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Requested execution order of segment names
    #[serde(default)]
    pub schedule: Vec<String>,

    /// Declared segments
    #[serde(default)]
    pub segments: Vec<Segment>,

    /// Backend for segments that do not name one
    #[serde(default = "default_backend")]
    pub default_backend: String,

    /// Execution stream
    #[serde(default)]
    pub stream: StreamKind,

    /// Diagnostics
    #[serde(default)]
    pub debug: DebugConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            schedule: Vec::new(),
            segments: Vec::new(),
            default_backend: default_backend(),
            stream: StreamKind::default(),
            debug: DebugConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the schedule.
    pub fn with_schedule<I, S>(mut self, schedule: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.schedule = schedule.into_iter().map(Into::into).collect();
        self
    }

    /// Declare a segment.
    pub fn with_segment(mut self, segment: Segment) -> Self {
        self.segments.push(segment);
        self
    }

    /// Set the default backend.
    pub fn with_default_backend(mut self, backend: impl Into<String>) -> Self {
        self.default_backend = backend.into();
        self
    }

    /// Set the execution stream.
    pub fn with_stream(mut self, stream: StreamKind) -> Self {
        self.stream = stream;
        self
    }

    /// Set whether `debug()` raises even without violations.
    pub fn with_always_raise(mut self, always_raise: bool) -> Self {
        self.debug.always_raise = always_raise;
        self
    }

    /// Parse a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a JSON configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Check the segment declarations and build the lookup table.
    pub fn validate(&self) -> Result<SegmentTable, ConfigError> {
        let mut by_name: BTreeMap<String, Segment> = BTreeMap::new();
        for segment in &self.segments {
            let mut segment = segment.clone();
            if segment.backend.is_none() {
                segment.backend = Some(self.default_backend.clone());
            }
            if by_name.insert(segment.name.clone(), segment.clone()).is_some() {
                return Err(ConfigError::DuplicateSegment(segment.name));
            }
        }

        let mut table = SegmentTable {
            segments: BTreeMap::new(),
            method_to_prefix: HashMap::new(),
            prefix_to_backend: HashMap::new(),
            default_backend: self.default_backend.clone(),
        };

        for segment in self.segments.iter().filter_map(|s| by_name.get(&s.name)) {
            for reserved in [UNNAMED_SEGMENT_PREFIX, UNREGISTERED_SEGMENT_PREFIX] {
                if segment.name.starts_with(reserved) {
                    return Err(ConfigError::ReservedPrefix {
                        name: segment.name.clone(),
                        prefix: reserved.to_string(),
                    });
                }
            }
            let (Some(prefix), Some(role)) = (segment.prefix(), segment.role()) else {
                return Err(ConfigError::InvalidSegmentName(segment.name.clone()));
            };
            let backend = segment.backend.clone().unwrap_or_else(|| self.default_backend.clone());

            if backend == EAGER_BACKEND {
                if role == SegmentRole::Backward {
                    return Err(ConfigError::EagerBackward {
                        segment: segment.name.clone(),
                        reason: "only forward segments can use it".to_string(),
                    });
                }
                let bwd = segment_name(prefix, SegmentRole::Backward);
                if by_name.contains_key(&bwd) {
                    return Err(ConfigError::EagerBackward {
                        segment: segment.name.clone(),
                        reason: format!("found backward segment `{}` for it", bwd),
                    });
                }
            } else {
                let fwd = segment_name(prefix, SegmentRole::Forward);
                let bwd = segment_name(prefix, SegmentRole::Backward);
                if let (Some(f), Some(b)) = (by_name.get(&fwd), by_name.get(&bwd)) {
                    if f.backend != b.backend {
                        return Err(ConfigError::BackendConflict {
                            fwd,
                            fwd_backend: f.backend.clone().unwrap_or_default(),
                            bwd,
                            bwd_backend: b.backend.clone().unwrap_or_default(),
                        });
                    }
                }
            }

            match table.method_to_prefix.get(&segment.method) {
                Some(existing) if existing != prefix => {
                    return Err(ConfigError::MethodConflict {
                        method: segment.method.clone(),
                        existing: existing.clone(),
                        requested: prefix.to_string(),
                    });
                }
                Some(_) => {}
                None => {
                    table
                        .method_to_prefix
                        .insert(segment.method.clone(), prefix.to_string());
                }
            }
            table.prefix_to_backend.insert(prefix.to_string(), backend);
            table.segments.insert(segment.name.clone(), segment.clone());
        }

        let mut seen = HashSet::new();
        for name in &self.schedule {
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::DuplicateScheduleEntry(name.clone()));
            }
        }

        Ok(table)
    }
}

/// Validated segment declarations with lookup maps.
#[derive(Debug, Clone)]
pub struct SegmentTable {
    segments: BTreeMap<String, Segment>,
    method_to_prefix: HashMap<String, String>,
    prefix_to_backend: HashMap<String, String>,
    default_backend: String,
}

impl SegmentTable {
    /// Whether the user declared a segment with this exact name.
    pub fn is_user_specified(&self, name: &str) -> bool {
        self.segments.contains_key(name)
    }

    /// Declared segment by name.
    pub fn segment(&self, name: &str) -> Option<&Segment> {
        self.segments.get(name)
    }

    /// Declared segment names, sorted.
    pub fn segment_names(&self) -> impl Iterator<Item = &str> {
        self.segments.keys().map(String::as_str)
    }

    /// Segment prefix registered for a method.
    pub fn prefix_for_method(&self, method: &str) -> Option<&str> {
        self.method_to_prefix.get(method).map(String::as_str)
    }

    /// Backend tag for a prefix, falling back to the default backend.
    pub fn backend_for_prefix(&self, prefix: &str) -> &str {
        self.prefix_to_backend
            .get(prefix)
            .map(String::as_str)
            .unwrap_or(&self.default_backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> SchedulerConfig {
        SchedulerConfig::new()
            .with_segment(Segment::new("a_fwd", "M.a"))
            .with_segment(Segment::new("a_bwd", "M.a"))
            .with_segment(Segment::new("b_fwd", "M.b").with_backend("eager"))
            .with_schedule(["a_fwd", "b_fwd", "a_bwd"])
    }

    #[test]
    fn test_valid_config_builds_table() {
        let table = base().validate().unwrap();
        assert!(table.is_user_specified("a_bwd"));
        assert!(!table.is_user_specified("b_bwd"));
        assert_eq!(table.prefix_for_method("M.a"), Some("a"));
        assert_eq!(table.backend_for_prefix("a"), AOT_EAGER_BACKEND);
        assert_eq!(table.backend_for_prefix("b"), EAGER_BACKEND);
        assert_eq!(table.backend_for_prefix("unknown"), AOT_EAGER_BACKEND);
        assert_eq!(table.segment_names().count(), 3);
    }

    #[test]
    fn test_rejects_name_without_role_suffix() {
        let err = SchedulerConfig::new()
            .with_segment(Segment::new("a", "M.a"))
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSegmentName(_)));
    }

    #[test]
    fn test_rejects_reserved_prefix() {
        let err = SchedulerConfig::new()
            .with_segment(Segment::new("__unnamed_1_fwd", "M.a"))
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::ReservedPrefix { .. }));
    }

    #[test]
    fn test_rejects_eager_with_backward_counterpart() {
        let err = SchedulerConfig::new()
            .with_segment(Segment::new("a_fwd", "M.a").with_backend("eager"))
            .with_segment(Segment::new("a_bwd", "M.a").with_backend("eager"))
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::EagerBackward { .. }));
    }

    #[test]
    fn test_rejects_backend_conflict() {
        let err = SchedulerConfig::new()
            .with_segment(Segment::new("a_fwd", "M.a").with_backend("inductor"))
            .with_segment(Segment::new("a_bwd", "M.a"))
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::BackendConflict { .. }));
    }

    #[test]
    fn test_rejects_method_under_two_prefixes() {
        let err = SchedulerConfig::new()
            .with_segment(Segment::new("a_fwd", "M.a"))
            .with_segment(Segment::new("b_fwd", "M.a"))
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::MethodConflict { .. }));
    }

    #[test]
    fn test_rejects_duplicates() {
        let err = base().with_segment(Segment::new("a_fwd", "M.a")).validate().unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateSegment(_)));

        let err = base().with_schedule(["a_fwd", "a_fwd"]).validate().unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateScheduleEntry(_)));
    }

    #[test]
    fn test_json_defaults() {
        let config = SchedulerConfig::from_json(
            r#"{"schedule": ["a_fwd"], "segments": [{"name": "a_fwd", "method": "M.a"}]}"#,
        )
        .unwrap();
        assert_eq!(config.default_backend, AOT_EAGER_BACKEND);
        assert_eq!(config.stream, StreamKind::Inline);
        assert!(config.debug.always_raise);
    }

    #[test]
    fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"stream": "worker", "debug": {"always_raise": false}}"#,
        )
        .unwrap();
        let config = SchedulerConfig::from_path(&path).unwrap();
        assert_eq!(config.stream, StreamKind::Worker);
        assert!(!config.debug.always_raise);

        let missing = SchedulerConfig::from_path(dir.path().join("missing.json"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
