//! Execution recording.
//!
//! The recorder keeps the append-only list of segments that actually
//! executed, plus the facts the debug report needs: which segments were
//! deferred and which ones mutate in place or read shared state.

use chrono::{DateTime, Utc};
use lazysched_core::is_internal_segment_name;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::debug;

/// One executed segment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionEntry {
    /// Segment name
    pub segment: String,
    /// When it was handed to the execution stream
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct RecorderState {
    entries: Vec<ExecutionEntry>,
    delayed: BTreeSet<String>,
    inplace: BTreeSet<String>,
    shared_state: BTreeSet<String>,
}

/// Append-only record of actual execution order.
#[derive(Debug, Default)]
pub struct ExecutionRecorder {
    state: Mutex<RecorderState>,
}

impl ExecutionRecorder {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a segment executed. Consecutive executions of the same
    /// segment collapse into one entry; returns whether an entry was added.
    pub fn record_execution(&self, segment: &str) -> bool {
        let mut state = self.state.lock();
        if state.entries.last().map(|e| e.segment.as_str()) == Some(segment) {
            debug!("Segment {} repeats the last recorded entry, not recording", segment);
            return false;
        }
        debug!("Recording execution of segment {}", segment);
        state.entries.push(ExecutionEntry {
            segment: segment.to_string(),
            recorded_at: Utc::now(),
        });
        true
    }

    /// Recorded order of user-declared segments only.
    pub fn recorded_execution_order(&self) -> Vec<String> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|e| !is_internal_segment_name(&e.segment))
            .map(|e| e.segment.clone())
            .collect()
    }

    /// Recorded order including generated segments.
    pub fn raw_execution_order(&self) -> Vec<String> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|e| e.segment.clone())
            .collect()
    }

    /// Full entries with timestamps.
    pub fn entries(&self) -> Vec<ExecutionEntry> {
        self.state.lock().entries.clone()
    }

    /// Note that a segment invocation was deferred.
    pub fn mark_delayed(&self, segment: &str) {
        self.state.lock().delayed.insert(segment.to_string());
    }

    /// Note that a segment contains in-place mutation ops.
    pub fn mark_inplace(&self, segment_prefix: &str) {
        self.state.lock().inplace.insert(segment_prefix.to_string());
    }

    /// Note that a segment reads module attributes or globals.
    pub fn mark_shared_state(&self, segment_prefix: &str) {
        self.state.lock().shared_state.insert(segment_prefix.to_string());
    }

    /// Deferred segments, sorted.
    pub fn delayed_segments(&self) -> Vec<String> {
        self.state.lock().delayed.iter().cloned().collect()
    }

    /// Segment prefixes with in-place ops, sorted.
    pub fn inplace_segments(&self) -> Vec<String> {
        self.state.lock().inplace.iter().cloned().collect()
    }

    /// Segment prefixes touching shared state, sorted.
    pub fn shared_state_segments(&self) -> Vec<String> {
        self.state.lock().shared_state.iter().cloned().collect()
    }
}
