//! Environment descriptors.
//!
//! An environment is a logical execution context with a stable id, a
//! declared kind, and an endpoint mode. Descriptors are configuration
//! handed to this system by the orchestration layer; routing itself only
//! ever looks at ids.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::identifiers::EnvironmentId;

// ============================================================================
// EnvironmentKind
// ============================================================================

/// The kind of execution context an environment runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvironmentKind {
    /// A top-level browser window.
    Window,
    /// An embedded iframe.
    Iframe,
    /// A web worker.
    WebWorker,
    /// A worker thread.
    WorkerThread,
    /// A long-lived server process.
    Node,
    /// A spawned child process.
    Process,
    /// A nested context simulated over an in-memory bus.
    Context,
}

// ============================================================================
// EndpointMode
// ============================================================================

/// Whether an environment has exactly one live instance or many
/// individually addressable ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointMode {
    /// Exactly one live instance.
    Single,
    /// Many instances, addressed individually (e.g. via namespaced ids).
    Multi,
}

// ============================================================================
// Environment
// ============================================================================

/// Descriptor of one logical participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    /// Stable environment id.
    pub id: EnvironmentId,
    /// Execution context kind.
    pub kind: EnvironmentKind,
    /// Endpoint mode.
    pub mode: EndpointMode,
}

impl Environment {
    /// Creates a descriptor.
    #[must_use]
    pub fn new(id: impl Into<EnvironmentId>, kind: EnvironmentKind, mode: EndpointMode) -> Self {
        Self {
            id: id.into(),
            kind,
            mode,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(
            serde_json::to_value(EnvironmentKind::WebWorker).expect("serialize"),
            "web-worker"
        );
        assert_eq!(
            serde_json::to_value(EnvironmentKind::Node).expect("serialize"),
            "node"
        );
    }

    #[test]
    fn test_descriptor_roundtrip() {
        let desc = Environment::new("processing", EnvironmentKind::Node, EndpointMode::Multi);
        let json = serde_json::to_string(&desc).expect("serialize");
        let back: Environment = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, desc);
    }
}
