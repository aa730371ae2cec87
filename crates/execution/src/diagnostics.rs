//! Schedule diagnostics.
//!
//! After a run, the recorded execution order is compared with the
//! requested schedule. A differing segment set is a hard error
//! ([`ScheduleMismatch`]); a differing order produces a [`DebugReport`]
//! with best-effort guesses at which code forced a delayed segment early.

use serde::Serialize;
use std::fmt;

const RULE: &str =
    "-----------------------------------------------------------------------------------------------------------------------";

/// Schedule and recorded order disagree on which segments ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleMismatch {
    /// Requested order
    pub schedule: Vec<String>,
    /// Recorded order (user-declared segments only)
    pub recorded: Vec<String>,
}

impl fmt::Display for ScheduleMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "the actual execution order has a different number of segments or different segments compared to the schedule"
        )?;
        writeln!(f, "- Schedule: {:?}. Length: {}.", self.schedule, self.schedule.len())?;
        writeln!(
            f,
            "- Recorded execution order: {:?}. Length: {}.",
            self.recorded,
            self.recorded.len()
        )?;
        write!(
            f,
            "Please update the schedule to have the same segments as the recorded execution order."
        )
    }
}

/// A guess at code that consumed a delayed segment's output too early.
///
/// The code between the end of `window_start` (or of `delayed` when there
/// is no earlier segment) and the end of `dependent` reads an output of
/// `delayed`. This is a heuristic, not a proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyWindow {
    /// Segment that was scheduled later but ran earlier
    pub delayed: String,
    /// Segment recorded just before `delayed`, if any
    pub window_start: Option<String>,
    /// Segment recorded just after `delayed`
    pub dependent: String,
}

impl fmt::Display for DependencyWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let start = self.window_start.as_deref().unwrap_or(&self.delayed);
        write!(
            f,
            "The code starting from end of `{}` (exclusive) to end of `{}` (inclusive) depends on output of `{}`",
            start, self.dependent, self.delayed
        )
    }
}

/// Reverse-scan guess at the dependencies that broke the schedule.
///
/// Repeatedly takes the last scheduled segment that was recorded earlier
/// than its scheduled position, pairs it with the segment recorded right
/// after it, and removes both from both sequences. Expects sequences of
/// equal length over the same segment set.
pub fn find_delayed_segment_dependencies(
    schedule: &[String],
    recorded: &[String],
) -> Vec<DependencyWindow> {
    let mut schedule = schedule.to_vec();
    let mut recorded = recorded.to_vec();
    let mut windows: Vec<DependencyWindow> = Vec::new();

    while schedule != recorded {
        let found = schedule.iter().enumerate().rev().find_map(|(index, seg)| {
            let position = recorded.iter().position(|r| r == seg)?;
            if position < index && position + 1 < recorded.len() {
                Some((seg.clone(), position))
            } else {
                None
            }
        });
        let Some((delayed, position)) = found else {
            break;
        };
        let dependent = recorded[position + 1].clone();
        let window_start = position.checked_sub(1).map(|i| recorded[i].clone());

        for seq in [&mut schedule, &mut recorded] {
            remove_first(seq, &delayed);
            remove_first(seq, &dependent);
        }

        // A later find for the same segment replaces the earlier one.
        if let Some(existing) = windows.iter_mut().find(|w| w.delayed == delayed) {
            existing.window_start = window_start;
            existing.dependent = dependent;
        } else {
            windows.push(DependencyWindow {
                delayed,
                window_start,
                dependent,
            });
        }
    }
    windows
}

fn remove_first(seq: &mut Vec<String>, name: &str) {
    if let Some(index) = seq.iter().position(|s| s == name) {
        seq.remove(index);
    }
}

/// Diagnostic report produced by `debug()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebugReport {
    /// Requested order
    pub schedule: Vec<String>,
    /// Recorded order (user-declared segments only)
    pub recorded: Vec<String>,
    /// Best-effort dependency guesses, empty when the order matched
    pub dependencies: Vec<DependencyWindow>,
    /// Segments whose invocation was deferred at least once
    pub delayed_segments: Vec<String>,
    /// Segment prefixes containing in-place mutation ops
    pub inplace_segments: Vec<String>,
    /// Segment prefixes reading module attributes or globals
    pub shared_state_segments: Vec<String>,
}

impl DebugReport {
    /// Whether the recorded order differs from the schedule.
    pub fn has_order_violation(&self) -> bool {
        self.schedule != self.recorded
    }
}

impl fmt::Display for DebugReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Lazy scheduler debug report")?;
        writeln!(f, "{}", RULE)?;

        if self.has_order_violation() {
            writeln!(f, "Issue: the actual execution order is not the same as the schedule.")?;
            writeln!(f)?;
            writeln!(
                f,
                "This usually happens when a segment's output (or a tensor it mutates in place) is used by"
            )?;
            writeln!(
                f,
                "downstream code right away, so the segment cannot be delayed past that code."
            )?;
            writeln!(
                f,
                "For example, with schedule [B, C, A] and recorded order [B, A, C], some code after B"
            )?;
            writeln!(
                f,
                "(exclusive) and up to C (inclusive) uses A's output, so A could not be delayed after C."
            )?;
            writeln!(f)?;
            writeln!(f, "- Schedule: {:?}. Length: {}.", self.schedule, self.schedule.len())?;
            writeln!(
                f,
                "- Recorded execution order: {:?}. Length: {}.",
                self.recorded,
                self.recorded.len()
            )?;
            writeln!(f)?;
            writeln!(f, "Best guess on the potential dependencies causing the issue:")?;
            for window in &self.dependencies {
                writeln!(f, "- {}", window)?;
            }
            writeln!(f, "{}", RULE)?;
        }

        writeln!(f, "Numerical mismatch against strict in-order execution is usually caused by a")?;
        writeln!(
            f,
            "shared tensor (module attribute, global or input) written on one side of a delayed segment"
        )?;
        writeln!(f, "and read on the other.")?;
        writeln!(f)?;
        writeln!(f, "- Delayed segments: {:?}", self.delayed_segments)?;
        writeln!(
            f,
            "- Segments that contain in-place mutation ops: {:?}",
            self.inplace_segments
        )?;
        writeln!(
            f,
            "- Segments that access module attribute or global variable: {:?}",
            self.shared_state_segments
        )?;
        writeln!(f)?;
        writeln!(
            f,
            "If the cause is still unclear, remove segments from the schedule one at a time and re-run."
        )?;
        write!(f, "{}", RULE)
    }
}
