//! Transport abstraction and concrete hosts.
//!
//! A [`Host`] moves opaque [`Message`] envelopes between environments. It
//! never interprets message semantics; `Communication` owns those. Each
//! concrete host independently manages its physical connection underneath
//! the same listen/send contract, so the routing layer never needs to know
//! which transport it is using.
//!
//! # Hosts
//!
//! | Host | Transport | Delivery |
//! |------|-----------|----------|
//! | [`BaseHost`] | in-memory | synchronous, caller's thread |
//! | [`WsClientHost`] | WebSocket client | async, read-task callback |
//! | [`WsServerHost`] | WebSocket server (multi-client) | async, per-socket tasks |
//! | [`IpcHost`] | process stdio, newline-delimited JSON | async, read-task callback |

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::Result;
use crate::protocol::Message;

// ============================================================================
// Submodules
// ============================================================================

/// In-memory bus host.
pub mod base;

/// Process-channel host over stdio.
pub mod ipc;

/// WebSocket client host.
pub mod ws_client;

/// Reconnection-tolerant WebSocket server host.
pub mod ws_server;

// ============================================================================
// Re-exports
// ============================================================================

pub use base::BaseHost;
pub use ipc::IpcHost;
pub use ws_client::{HostEvent, WsClientHost};
pub use ws_server::{WsServerHost, WsServerOptions};

// ============================================================================
// Types
// ============================================================================

/// Callback invoked for every message a host delivers.
pub type MessageListener = Arc<dyn Fn(Message) + Send + Sync>;

/// Handle identifying one registered listener, used for removal.
///
/// The Rust rendition of remove-by-function-identity: closures have no
/// stable identity, so registration hands back a token instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

// ============================================================================
// Host Trait
// ============================================================================

/// Transport-agnostic send/receive abstraction.
///
/// Implementations transport opaque envelopes and expose connectivity
/// events; they never act on message contents.
pub trait Host: Send + Sync {
    /// Stable id of this host, used in forwarding-chain guards.
    fn id(&self) -> &str;

    /// Registers a listener invoked for every delivered message.
    fn add_listener(&self, listener: MessageListener) -> ListenerToken;

    /// Removes a previously registered listener.
    fn remove_listener(&self, token: ListenerToken);

    /// Sends a message over this host's transport.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::HostClosed`] once the host is disposed.
    fn post_message(&self, message: Message) -> Result<()>;

    /// Upward link for nested in-memory hosts; `None` for transports.
    fn parent(&self) -> Option<Arc<dyn Host>> {
        None
    }

    /// Returns `true` once the host refuses further sends.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Compares two hosts by object identity.
#[must_use]
pub fn same_host(a: &Arc<dyn Host>, b: &Arc<dyn Host>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

// ============================================================================
// ListenerSet
// ============================================================================

/// Shared listener bookkeeping used by every concrete host.
#[derive(Default)]
pub(crate) struct ListenerSet {
    listeners: Mutex<Vec<(ListenerToken, MessageListener)>>,
    next_token: AtomicU64,
}

impl ListenerSet {
    /// Creates an empty set.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds a listener, returning its removal token.
    pub(crate) fn add(&self, listener: MessageListener) -> ListenerToken {
        let token = ListenerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((token, listener));
        token
    }

    /// Removes the listener registered under `token`.
    pub(crate) fn remove(&self, token: ListenerToken) {
        self.listeners.lock().retain(|(t, _)| *t != token);
    }

    /// Delivers `message` to every registered listener.
    ///
    /// Listeners run outside the lock so they may re-enter the host.
    pub(crate) fn emit(&self, message: &Message) {
        let snapshot: Vec<MessageListener> = {
            let listeners = self.listeners.lock();
            listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };

        for listener in snapshot {
            listener(message.clone());
        }
    }

    /// Returns the number of registered listeners.
    pub(crate) fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Removes every listener.
    pub(crate) fn clear(&self) {
        self.listeners.lock().clear();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex as PlMutex;

    use crate::identifiers::EnvironmentId;
    use crate::protocol::{MessageKind, Recipient};

    fn ready_message() -> Message {
        Message::lifecycle(
            &EnvironmentId::new("a"),
            Recipient::Broadcast,
            MessageKind::Ready,
        )
    }

    #[test]
    fn test_listener_set_add_remove() {
        let set = ListenerSet::new();
        let seen = Arc::new(PlMutex::new(0u32));

        let seen_clone = Arc::clone(&seen);
        let token = set.add(Arc::new(move |_| {
            *seen_clone.lock() += 1;
        }));

        set.emit(&ready_message());
        assert_eq!(*seen.lock(), 1);

        set.remove(token);
        set.emit(&ready_message());
        assert_eq!(*seen.lock(), 1);
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn test_listener_set_reentrant_emit() {
        let set = Arc::new(ListenerSet::new());
        let seen = Arc::new(PlMutex::new(0u32));

        let set_clone = Arc::clone(&set);
        let seen_clone = Arc::clone(&seen);
        set.add(Arc::new(move |_| {
            // First delivery registers another listener; must not deadlock.
            let inner_seen = Arc::clone(&seen_clone);
            if set_clone.len() == 1 {
                set_clone.add(Arc::new(move |_| {
                    *inner_seen.lock() += 10;
                }));
            }
            *seen_clone.lock() += 1;
        }));

        set.emit(&ready_message());
        set.emit(&ready_message());
        assert_eq!(*seen.lock(), 12);
    }
}
