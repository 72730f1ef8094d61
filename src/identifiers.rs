//! Type-safe identifiers for environments, services, and messages.
//!
//! Newtype wrappers prevent mixing incompatible IDs at compile time:
//!
//! | Type | Backing | Purpose |
//! |------|---------|---------|
//! | [`EnvironmentId`] | `String` | Logical execution context |
//! | [`ServiceId`] | `String` | Named service registration |
//! | [`RequestId`] | `Uuid` | Call/response correlation |
//! | [`ClientId`] | `String` | Stable client identity across reconnects |
//! | [`ListenerId`] | `u64` | Process-local remote-listener identity |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// EnvironmentId
// ============================================================================

/// Identifier of a logical execution context (tab, worker, process, server).
///
/// Assigned once per logical participant and never reused while a session
/// is open. The server host namespaces client-owned ids as
/// `stableClientId/envId`; [`EnvironmentId::split_namespace`] and
/// [`EnvironmentId::bare`] give access to the parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentId(String);

impl EnvironmentId {
    /// Creates an environment id from a string.
    #[inline]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a namespaced id of the form `clientId/envId`.
    #[inline]
    #[must_use]
    pub fn namespaced(client: &ClientId, env: &str) -> Self {
        Self(format!("{client}/{env}"))
    }

    /// Returns the raw string form.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits a namespaced id into `(clientId, envId)`.
    ///
    /// Returns `None` if the id carries no namespace prefix.
    #[inline]
    #[must_use]
    pub fn split_namespace(&self) -> Option<(&str, &str)> {
        self.0.split_once('/')
    }

    /// Returns the env-id part, stripping a namespace prefix if present.
    #[inline]
    #[must_use]
    pub fn bare(&self) -> &str {
        self.split_namespace().map_or(self.0.as_str(), |(_, env)| env)
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EnvironmentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for EnvironmentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ============================================================================
// ServiceId
// ============================================================================

/// Identifier of a named service exposed through a `Communication` instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    /// Creates a service id from a string.
    #[inline]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw string form.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

// ============================================================================
// RequestId
// ============================================================================

/// Unique identifier correlating `call`/`listen`/`unlisten` messages with
/// their `response`s.
///
/// Serializes as a UUID string on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generates a fresh random request id.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// ClientId
// ============================================================================

/// Stable client identifier, generated once by a client host and presented
/// on every physical reconnect within the same logical session.
///
/// Kept as an opaque string so that peers with foreign id schemes can still
/// connect; [`ClientId::generate`] produces a random UUID string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Generates a fresh random client id.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wraps an externally supplied client id.
    #[inline]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw string form.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// ListenerId
// ============================================================================

/// Process-local identity of one remote listener registration.
///
/// Service implementations store these to remove exactly the matching
/// registration on `unlisten`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListenerId(u64);

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

impl ListenerId {
    /// Allocates the next listener id.
    #[inline]
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_id_namespacing() {
        let client = ClientId::new("c1");
        let id = EnvironmentId::namespaced(&client, "worker");

        assert_eq!(id.as_str(), "c1/worker");
        assert_eq!(id.split_namespace(), Some(("c1", "worker")));
        assert_eq!(id.bare(), "worker");
    }

    #[test]
    fn test_environment_id_bare_without_namespace() {
        let id = EnvironmentId::new("main");
        assert_eq!(id.split_namespace(), None);
        assert_eq!(id.bare(), "main");
    }

    #[test]
    fn test_request_id_uniqueness() {
        let a = RequestId::generate();
        let b = RequestId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_request_id_serde_roundtrip() {
        let id = RequestId::generate();
        let json = serde_json::to_string(&id).expect("serialize");
        let back: RequestId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(id, back);
    }

    #[test]
    fn test_listener_id_monotonic() {
        let a = ListenerId::next();
        let b = ListenerId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_client_id_generate_is_unique() {
        assert_ne!(ClientId::generate(), ClientId::generate());
    }
}
