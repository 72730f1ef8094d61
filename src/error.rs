//! Error types for envbus.
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`].
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Call | [`Error::Call`], [`Error::CallTimeout`] |
//! | Protocol misuse | [`Error::ListenerNotConfigured`], [`Error::RemoveListenerNotConfigured`], [`Error::Protocol`] |
//! | Disposal | [`Error::EnvironmentDisposed`], [`Error::Disposed`], [`Error::HostClosed`] |
//! | Handshake | [`Error::EnvironmentNotReady`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionTimeout`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`], [`Error::ChannelClosed`] |
//!
//! Routing failures are deliberately *not* represented here: delivery is
//! decoupled from the sender, so unroutable messages are logged and dropped
//! rather than surfaced as errors (see `Communication::route_or_deliver`).

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::{EnvironmentId, RequestId, ServiceId};

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging. Timeout, disposal,
/// and remote-failure rejections are distinct variants so callers can tell
/// "no answer" from "answered with failure" from "peer went away".
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Call Errors
    // ========================================================================
    /// Remote method invocation failed.
    ///
    /// Carries the remote error's message verbatim.
    #[error("call to {service}.{method} failed: {message}")]
    Call {
        /// Target service.
        service: ServiceId,
        /// Invoked method.
        method: String,
        /// Error message reported by the remote implementation.
        message: String,
    },

    /// Call exceeded its configured hard deadline.
    ///
    /// Distinct from [`Error::Call`] so callers can distinguish "no answer"
    /// from "answered with failure".
    #[error("request {request_id} timed out after {timeout_ms}ms")]
    CallTimeout {
        /// The request that timed out.
        request_id: RequestId,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // Protocol Misuse Errors
    // ========================================================================
    /// A listener method was invoked without `listener: true` in the proxy
    /// configuration.
    #[error("cannot add listener to unconfigured method {service}.{method}")]
    ListenerNotConfigured {
        /// Service the method belongs to.
        service: ServiceId,
        /// Method invoked as a listener.
        method: String,
    },

    /// A method was used to remove listeners without a `remove_listener`
    /// (or `remove_all_listeners`) tag in the proxy configuration.
    #[error("method {service}.{method} is not configured to remove listeners")]
    RemoveListenerNotConfigured {
        /// Service the method belongs to.
        service: ServiceId,
        /// Method invoked for removal.
        method: String,
    },

    /// Protocol violation or malformed message.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the violation.
        message: String,
    },

    // ========================================================================
    // Disposal Errors
    // ========================================================================
    /// A call was in flight to (or attempted against) an environment that
    /// has been disposed.
    #[error("environment {env_id} was disposed")]
    EnvironmentDisposed {
        /// The disposed environment.
        env_id: EnvironmentId,
    },

    /// Operation attempted on a disposed `Communication` instance.
    #[error("communication instance is disposed")]
    Disposed,

    /// Send attempted on a closed host.
    #[error("host {host} is closed")]
    HostClosed {
        /// Id of the closed host.
        host: String,
    },

    // ========================================================================
    // Handshake Errors
    // ========================================================================
    /// Target environment never became ready within the bounded wait.
    #[error("environment {env_id} not ready after {timeout_ms}ms")]
    EnvironmentNotReady {
        /// The environment waited for.
        env_id: EnvironmentId,
        /// Milliseconds waited before giving up.
        timeout_ms: u64,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Transport connection failed.
    #[error("connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Transport connection not established within timeout.
    #[error("connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Channel receive error.
    #[error("channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a remote-call error.
    #[inline]
    pub fn call(service: &ServiceId, method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Call {
            service: service.clone(),
            method: method.into(),
            message: message.into(),
        }
    }

    /// Creates a call timeout error.
    #[inline]
    pub fn call_timeout(request_id: RequestId, timeout_ms: u64) -> Self {
        Self::CallTimeout {
            request_id,
            timeout_ms,
        }
    }

    /// Creates a listener-not-configured error.
    #[inline]
    pub fn listener_not_configured(service: &ServiceId, method: impl Into<String>) -> Self {
        Self::ListenerNotConfigured {
            service: service.clone(),
            method: method.into(),
        }
    }

    /// Creates a remove-listener-not-configured error.
    #[inline]
    pub fn remove_listener_not_configured(service: &ServiceId, method: impl Into<String>) -> Self {
        Self::RemoveListenerNotConfigured {
            service: service.clone(),
            method: method.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates an environment-disposed error.
    #[inline]
    pub fn environment_disposed(env_id: &EnvironmentId) -> Self {
        Self::EnvironmentDisposed {
            env_id: env_id.clone(),
        }
    }

    /// Creates a host-closed error.
    #[inline]
    pub fn host_closed(host: impl Into<String>) -> Self {
        Self::HostClosed { host: host.into() }
    }

    /// Creates an environment-not-ready error.
    #[inline]
    pub fn environment_not_ready(env_id: &EnvironmentId, timeout_ms: u64) -> Self {
        Self::EnvironmentNotReady {
            env_id: env_id.clone(),
            timeout_ms,
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::CallTimeout { .. }
                | Self::ConnectionTimeout { .. }
                | Self::EnvironmentNotReady { .. }
        )
    }

    /// Returns `true` if this is a disposal error.
    #[inline]
    #[must_use]
    pub fn is_disposal(&self) -> bool {
        matches!(
            self,
            Self::EnvironmentDisposed { .. } | Self::Disposed | Self::HostClosed { .. }
        )
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionTimeout { .. } | Self::WebSocket(_)
        )
    }

    /// Returns `true` if this is a protocol-misuse error.
    #[inline]
    #[must_use]
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Self::ListenerNotConfigured { .. }
                | Self::RemoveListenerNotConfigured { .. }
                | Self::Protocol { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_call_error_display() {
        let err = Error::call(&ServiceId::new("echoService"), "echo", "boom");
        assert_eq!(err.to_string(), "call to echoService.echo failed: boom");
    }

    #[test]
    fn test_listener_not_configured_display() {
        let err = Error::listener_not_configured(&ServiceId::new("myApi"), "listen");
        assert_eq!(
            err.to_string(),
            "cannot add listener to unconfigured method myApi.listen"
        );
    }

    #[test]
    fn test_is_timeout() {
        let timeout = Error::call_timeout(RequestId::generate(), 5000);
        let other = Error::connection("test");

        assert!(timeout.is_timeout());
        assert!(!other.is_timeout());
    }

    #[test]
    fn test_timeout_distinct_from_disposal() {
        let env = EnvironmentId::new("worker");
        let disposed = Error::environment_disposed(&env);
        let timeout = Error::call_timeout(RequestId::generate(), 100);

        assert!(disposed.is_disposal());
        assert!(!disposed.is_timeout());
        assert!(!timeout.is_disposal());
    }

    #[test]
    fn test_is_misuse() {
        let err = Error::remove_listener_not_configured(&ServiceId::new("myApi"), "unsubscribe");
        assert!(err.is_misuse());
        assert!(!err.is_disposal());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::NotFound, "not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
