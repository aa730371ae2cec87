//! Method interception.
//!
//! Decides, per method call, whether it runs eagerly, opens a compiled
//! region, or runs inside one that is already open.

use lazysched_core::SegmentTable;
use tracing::debug;

/// How a method call should be executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodEntry {
    /// Not registered with any segment
    Eager,
    /// Registered, called outside any compiled region; opens one
    CompiledEntryPoint {
        /// Segment prefix the method belongs to
        prefix: String,
    },
    /// Registered, called from within an open compiled region
    CompiledNested {
        /// Segment prefix the method belongs to
        prefix: String,
    },
}

impl MethodEntry {
    /// Segment prefix, if the call is compiled.
    pub fn prefix(&self) -> Option<&str> {
        match self {
            MethodEntry::Eager => None,
            MethodEntry::CompiledEntryPoint { prefix } | MethodEntry::CompiledNested { prefix } => {
                Some(prefix.as_str())
            }
        }
    }
}

/// Tracks compiled-region nesting across method calls.
#[derive(Debug, Clone)]
pub struct MethodInterceptor {
    table: SegmentTable,
    depth: usize,
}

impl MethodInterceptor {
    /// Interceptor over validated segment declarations.
    pub fn new(table: SegmentTable) -> Self {
        Self { table, depth: 0 }
    }

    /// Classify a call to `method`. Every compiled entry must be paired
    /// with [`MethodInterceptor::exit`].
    pub fn enter(&mut self, method: &str) -> MethodEntry {
        let Some(prefix) = self.table.prefix_for_method(method) else {
            return MethodEntry::Eager;
        };
        let prefix = prefix.to_string();
        self.depth += 1;
        if self.depth == 1 {
            debug!("Entering compiled region {} via {}", prefix, method);
            MethodEntry::CompiledEntryPoint { prefix }
        } else {
            MethodEntry::CompiledNested { prefix }
        }
    }

    /// Close the call opened by the matching `enter`.
    pub fn exit(&mut self, entry: &MethodEntry) {
        if matches!(entry, MethodEntry::Eager) {
            return;
        }
        self.depth = self.depth.saturating_sub(1);
    }

    /// Whether a compiled entry point is currently open.
    pub fn in_compiled_region(&self) -> bool {
        self.depth > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lazysched_core::{SchedulerConfig, Segment};

    fn interceptor() -> MethodInterceptor {
        let table = SchedulerConfig::new()
            .with_segment(Segment::new("outer_fwd", "Model.outer"))
            .with_segment(Segment::new("inner_fwd", "Model.inner"))
            .validate()
            .unwrap();
        MethodInterceptor::new(table)
    }

    #[test]
    fn test_unregistered_method_is_eager() {
        let mut i = interceptor();
        let entry = i.enter("Model.helper");
        assert_eq!(entry, MethodEntry::Eager);
        assert!(entry.prefix().is_none());
        assert!(!i.in_compiled_region());
        i.exit(&entry);
        assert!(!i.in_compiled_region());
    }

    #[test]
    fn test_nested_registered_call() {
        let mut i = interceptor();
        let outer = i.enter("Model.outer");
        assert_eq!(
            outer,
            MethodEntry::CompiledEntryPoint {
                prefix: "outer".to_string()
            }
        );
        assert!(i.in_compiled_region());

        let inner = i.enter("Model.inner");
        assert_eq!(inner.prefix(), Some("inner"));
        assert!(matches!(inner, MethodEntry::CompiledNested { .. }));

        // Eager helpers inside a compiled region do not change nesting.
        let helper = i.enter("Model.helper");
        i.exit(&helper);

        i.exit(&inner);
        assert!(i.in_compiled_region());
        i.exit(&outer);
        assert!(!i.in_compiled_region());

        let again = i.enter("Model.inner");
        assert!(matches!(again, MethodEntry::CompiledEntryPoint { .. }));
    }
}
