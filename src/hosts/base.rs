//! In-memory bus host.
//!
//! [`BaseHost`] delivers synchronously to its own registered listeners in
//! the caller's thread of control. [`BaseHost::open_child`] returns a
//! nested host holding a parent reference: a child is a distinct endpoint
//! one peer can listen on, while the parent link lets the routing layer
//! reply upward through the endpoint it listens on itself.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::hosts::{Host, ListenerSet, ListenerToken, MessageListener};
use crate::protocol::Message;

// ============================================================================
// BaseHost
// ============================================================================

/// In-memory host used for same-process environments and for simulating
/// child execution contexts without a real transport.
pub struct BaseHost {
    name: String,
    parent: Option<Arc<BaseHost>>,
    listeners: ListenerSet,
    closed: AtomicBool,
    child_counter: AtomicU64,
}

impl BaseHost {
    /// Creates a root in-memory host.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::named("base-host")
    }

    /// Creates a root in-memory host with an explicit name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            parent: None,
            listeners: ListenerSet::new(),
            closed: AtomicBool::new(false),
            child_counter: AtomicU64::new(0),
        })
    }

    /// Opens a nested host sharing this host's bus through its parent link.
    #[must_use]
    pub fn open_child(self: &Arc<Self>) -> Arc<BaseHost> {
        let n = self.child_counter.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self {
            name: format!("{}/{n}", self.name),
            parent: Some(Arc::clone(self)),
            listeners: ListenerSet::new(),
            closed: AtomicBool::new(false),
            child_counter: AtomicU64::new(0),
        })
    }

    /// Returns the number of listeners registered on this endpoint.
    #[inline]
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Closes the host; subsequent sends fail with `HostClosed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.listeners.clear();
    }
}

impl Host for BaseHost {
    fn id(&self) -> &str {
        &self.name
    }

    fn add_listener(&self, listener: MessageListener) -> ListenerToken {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, token: ListenerToken) {
        self.listeners.remove(token);
    }

    fn post_message(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(Error::host_closed(&self.name));
        }
        self.listeners.emit(&message);
        Ok(())
    }

    fn parent(&self) -> Option<Arc<dyn Host>> {
        self.parent
            .as_ref()
            .map(|parent| Arc::clone(parent) as Arc<dyn Host>)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Tests
// ============================================================================
