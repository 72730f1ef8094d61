//! Service registration and proxy configuration.
//!
//! A [`Service`] is an explicit method table: each exposed function is
//! registered under its name with one of a small number of call shapes
//! (plain, multi-tenant, listener, remove-listener). This replaces the
//! reflective proxy construction of dynamic runtimes with a dispatcher
//! keyed by `(service, method)`.
//!
//! ```
//! use envbus::Service;
//! use serde_json::json;
//!
//! let service = Service::new("echoService")
//!     .method("echo", |args| Ok(args.into_iter().next().unwrap_or(json!(null))));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::error::Result;
use crate::identifiers::{EnvironmentId, ListenerId, ServiceId};

// ============================================================================
// Method Function Types
// ============================================================================

/// Plain method: arguments in, value out.
pub type PlainFn = Arc<dyn Fn(Vec<Value>) -> Result<Value> + Send + Sync>;

/// Multi-tenant method: the first parameter is injected with the identity
/// of whichever remote environment invoked it, so one singleton instance
/// serves many callers distinguishably.
pub type MultiTenantFn = Arc<dyn Fn(&EnvironmentId, Vec<Value>) -> Result<Value> + Send + Sync>;

/// Listener method: retains the supplied [`RemoteListener`] and may emit
/// through it zero-to-many times instead of returning a value.
pub type ListenerFn = Arc<dyn Fn(RemoteListener) -> Result<()> + Send + Sync>;

/// Remove-listener method: drops exactly the identified registration.
pub type RemoveListenerFn = Arc<dyn Fn(ListenerId) -> Result<()> + Send + Sync>;

/// Remove-all-listeners method: drops every identified registration.
pub type RemoveAllFn = Arc<dyn Fn(&[ListenerId]) -> Result<()> + Send + Sync>;

// ============================================================================
// RemoteListener
// ============================================================================

/// Handle to one remote subscriber, given to listener methods.
///
/// Emitting sends a multi-shot `response` back to the subscribing
/// environment; the handle stays valid until the matching `unlisten`
/// arrives or the subscriber disposes.
#[derive(Clone)]
pub struct RemoteListener {
    id: ListenerId,
    subscriber: EnvironmentId,
    emitter: Arc<dyn Fn(Value) + Send + Sync>,
}

impl RemoteListener {
    /// Creates a listener handle around an emit function.
    pub(crate) fn new(
        id: ListenerId,
        subscriber: EnvironmentId,
        emitter: Arc<dyn Fn(Value) + Send + Sync>,
    ) -> Self {
        Self {
            id,
            subscriber,
            emitter,
        }
    }

    /// Identity of this registration; store it to support removal.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Environment that subscribed.
    #[inline]
    #[must_use]
    pub fn subscriber(&self) -> &EnvironmentId {
        &self.subscriber
    }

    /// Emits one value to the subscriber.
    pub fn emit(&self, value: Value) {
        (self.emitter)(value);
    }
}

impl std::fmt::Debug for RemoteListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteListener")
            .field("id", &self.id)
            .field("subscriber", &self.subscriber)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// ServiceMethod
// ============================================================================

/// One registered method and its call shape.
#[derive(Clone)]
pub(crate) enum ServiceMethod {
    Plain(PlainFn),
    MultiTenant(MultiTenantFn),
    Listener(ListenerFn),
    RemoveListener { listens_to: String, f: RemoveListenerFn },
    RemoveAllListeners { listens_to: String, f: RemoveAllFn },
}

// ============================================================================
// Service
// ============================================================================

/// Builder-constructed method table exposed under a [`ServiceId`].
pub struct Service {
    id: ServiceId,
    methods: FxHashMap<String, ServiceMethod>,
}

impl Service {
    /// Starts an empty service.
    #[must_use]
    pub fn new(id: impl Into<ServiceId>) -> Self {
        Self {
            id: id.into(),
            methods: FxHashMap::default(),
        }
    }

    /// Returns the service id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> &ServiceId {
        &self.id
    }

    /// Registers a plain method.
    #[must_use]
    pub fn method(
        mut self,
        name: impl Into<String>,
        f: impl Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.methods
            .insert(name.into(), ServiceMethod::Plain(Arc::new(f)));
        self
    }

    /// Registers a multi-tenant method; the caller's environment id is
    /// injected as the first parameter.
    #[must_use]
    pub fn multi_tenant_method(
        mut self,
        name: impl Into<String>,
        f: impl Fn(&EnvironmentId, Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.methods
            .insert(name.into(), ServiceMethod::MultiTenant(Arc::new(f)));
        self
    }

    /// Registers a listener method, invoked once per `listen` with a fresh
    /// [`RemoteListener`].
    #[must_use]
    pub fn listener_method(
        mut self,
        name: impl Into<String>,
        f: impl Fn(RemoteListener) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.methods
            .insert(name.into(), ServiceMethod::Listener(Arc::new(f)));
        self
    }

    /// Registers the removal companion of `listens_to`.
    #[must_use]
    pub fn remove_listener_method(
        mut self,
        name: impl Into<String>,
        listens_to: impl Into<String>,
        f: impl Fn(ListenerId) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.methods.insert(
            name.into(),
            ServiceMethod::RemoveListener {
                listens_to: listens_to.into(),
                f: Arc::new(f),
            },
        );
        self
    }

    /// Registers the remove-all companion of `listens_to`.
    #[must_use]
    pub fn remove_all_listeners_method(
        mut self,
        name: impl Into<String>,
        listens_to: impl Into<String>,
        f: impl Fn(&[ListenerId]) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.methods.insert(
            name.into(),
            ServiceMethod::RemoveAllListeners {
                listens_to: listens_to.into(),
                f: Arc::new(f),
            },
        );
        self
    }

    /// Looks up a method by name.
    pub(crate) fn get(&self, name: &str) -> Option<&ServiceMethod> {
        self.methods.get(name)
    }

    /// Iterates the registered methods.
    pub(crate) fn methods(&self) -> impl Iterator<Item = (&String, &ServiceMethod)> {
        self.methods.iter()
    }
}

// ============================================================================
// MethodOptions
// ============================================================================

/// Per-method proxy configuration.
#[derive(Debug, Clone, Default)]
pub struct MethodOptions {
    /// Fire-and-forget: the call settles immediately, no response expected.
    pub emit_only: bool,
    /// Subscription method; must be invoked via `add_listener`.
    pub listener: bool,
    /// Names the listener method this one removes a registration of.
    pub remove_listener: Option<String>,
    /// Names the listener method this one removes all registrations of.
    pub remove_all_listeners: Option<String>,
}

impl MethodOptions {
    /// Options for a fire-and-forget method.
    #[must_use]
    pub fn emit_only() -> Self {
        Self {
            emit_only: true,
            ..Self::default()
        }
    }

    /// Options for a listener method.
    #[must_use]
    pub fn listener() -> Self {
        Self {
            listener: true,
            ..Self::default()
        }
    }

    /// Options for the removal companion of `listens_to`.
    #[must_use]
    pub fn remove_listener(listens_to: impl Into<String>) -> Self {
        Self {
            remove_listener: Some(listens_to.into()),
            ..Self::default()
        }
    }

    /// Options for the remove-all companion of `listens_to`.
    #[must_use]
    pub fn remove_all_listeners(listens_to: impl Into<String>) -> Self {
        Self {
            remove_all_listeners: Some(listens_to.into()),
            ..Self::default()
        }
    }
}

// ============================================================================
// ProxyConfig
// ============================================================================

/// Method options for one proxy, keyed by method name.
///
/// Methods without an entry use the default call shape.
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    methods: FxHashMap<String, MethodOptions>,
}

impl ProxyConfig {
    /// Starts an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds options for one method.
    #[must_use]
    pub fn method(mut self, name: impl Into<String>, options: MethodOptions) -> Self {
        self.methods.insert(name.into(), options);
        self
    }

    /// Looks up options for a method.
    pub(crate) fn get(&self, name: &str) -> Option<&MethodOptions> {
        self.methods.get(name)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn test_service_builder_shapes() {
        let service = Service::new("stats")
            .method("get", |_| Ok(json!(1)))
            .multi_tenant_method("whoami", |caller, _| Ok(json!(caller.as_str())))
            .listener_method("subscribe", |_| Ok(()))
            .remove_listener_method("unsubscribe", "subscribe", |_| Ok(()));

        assert!(matches!(service.get("get"), Some(ServiceMethod::Plain(_))));
        assert!(matches!(
            service.get("whoami"),
            Some(ServiceMethod::MultiTenant(_))
        ));
        assert!(matches!(
            service.get("subscribe"),
            Some(ServiceMethod::Listener(_))
        ));
        assert!(matches!(
            service.get("unsubscribe"),
            Some(ServiceMethod::RemoveListener { listens_to, .. }) if listens_to == "subscribe"
        ));
        assert!(service.get("missing").is_none());
    }

    #[test]
    fn test_remote_listener_emit() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let listener = RemoteListener::new(
            ListenerId::next(),
            EnvironmentId::new("sub"),
            Arc::new(move |value| seen_clone.lock().push(value)),
        );

        listener.emit(json!(1));
        listener.emit(json!("two"));

        assert_eq!(*seen.lock(), vec![json!(1), json!("two")]);
        assert_eq!(listener.subscriber().as_str(), "sub");
    }

    #[test]
    fn test_proxy_config_lookup() {
        let config = ProxyConfig::new()
            .method("notify", MethodOptions::emit_only())
            .method("listen", MethodOptions::listener())
            .method("unsubscribe", MethodOptions::remove_listener("listen"));

        assert!(config.get("notify").expect("options").emit_only);
        assert!(config.get("listen").expect("options").listener);
        assert_eq!(
            config
                .get("unsubscribe")
                .and_then(|o| o.remove_listener.as_deref()),
            Some("listen")
        );
        assert!(config.get("other").is_none());
    }
}
