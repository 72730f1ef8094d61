//! Remote-service proxy.
//!
//! [`ApiProxy`] is a generic dispatcher keyed by `(service, method)` with
//! three call shapes — default, emit-only, and listener — selected by the
//! proxy's [`ProxyConfig`]. Typed access is layered on top through serde
//! ([`ApiProxy::call_typed`]) rather than reflection.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::com::communication::Communication;
use crate::com::service::ProxyConfig;
use crate::error::{Error, Result};
use crate::identifiers::{EnvironmentId, RequestId, ServiceId};

// ============================================================================
// ListenerHandle
// ============================================================================

/// Identity of one remote listener registration, returned by
/// [`ApiProxy::add_listener`] and consumed by [`ApiProxy::remove_listener`].
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    method: String,
    listen_id: RequestId,
}

impl ListenerHandle {
    /// The listener method this registration belongs to.
    #[inline]
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The wire id of the registration.
    #[inline]
    #[must_use]
    pub fn listen_id(&self) -> RequestId {
        self.listen_id
    }
}

// ============================================================================
// ApiProxy
// ============================================================================

/// Proxy for one service on one target environment.
///
/// Every method settles as a deferred result: the returned future suspends
/// until the matching response arrives, a configured timeout fires, or the
/// target environment disposes — whichever happens first.
pub struct ApiProxy {
    com: Arc<Communication>,
    target: EnvironmentId,
    service: ServiceId,
    config: ProxyConfig,
}

impl ApiProxy {
    /// Creates a proxy; use [`Communication::api_proxy`].
    pub(crate) fn new(
        com: Arc<Communication>,
        target: EnvironmentId,
        service: ServiceId,
        config: ProxyConfig,
    ) -> Self {
        Self {
            com,
            target,
            service,
            config,
        }
    }

    /// Target environment id.
    #[inline]
    #[must_use]
    pub fn target(&self) -> &EnvironmentId {
        &self.target
    }

    /// Target service id.
    #[inline]
    #[must_use]
    pub fn service(&self) -> &ServiceId {
        &self.service
    }

    /// Invokes a remote method.
    ///
    /// A method configured `emit_only` settles immediately with `Null`; no
    /// response is awaited and no callback record is created.
    ///
    /// # Errors
    ///
    /// - [`Error::Call`] if the remote implementation failed
    /// - [`Error::CallTimeout`] if the configured hard deadline elapsed
    /// - [`Error::EnvironmentDisposed`] if the target disposed mid-flight
    /// - [`Error::EnvironmentNotReady`] if the target never became ready
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let options = self.config.get(method);

        if options.is_some_and(|o| o.listener) {
            return Err(Error::protocol(format!(
                "method {}.{method} is a listener; subscribe via add_listener",
                self.service
            )));
        }

        if options.is_some_and(|o| o.emit_only) {
            self.com
                .emit_method(&self.target, &self.service, method, args)
                .await?;
            return Ok(Value::Null);
        }

        self.com
            .call_method(&self.target, &self.service, method, args)
            .await
    }

    /// Invokes a remote method and deserializes the result.
    ///
    /// # Errors
    ///
    /// Same as [`ApiProxy::call`], plus [`Error::Json`] on shape mismatch.
    pub async fn call_typed<T: DeserializeOwned>(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<T> {
        let value = self.call(method, args).await?;
        serde_json::from_value(value).map_err(Error::Json)
    }

    /// Subscribes `callback` to a listener method.
    ///
    /// Each call creates an independent remote registration, even with an
    /// identical callback; subscriptions are not locally deduplicated.
    ///
    /// # Errors
    ///
    /// [`Error::ListenerNotConfigured`] unless the method carries
    /// `listener: true` in this proxy's configuration.
    pub async fn add_listener(
        &self,
        method: &str,
        callback: impl Fn(Value) + Send + Sync + 'static,
    ) -> Result<ListenerHandle> {
        if !self.config.get(method).is_some_and(|o| o.listener) {
            return Err(Error::listener_not_configured(&self.service, method));
        }

        let listen_id = self
            .com
            .listen_method(&self.target, &self.service, method, Arc::new(callback))
            .await?;

        Ok(ListenerHandle {
            method: method.to_string(),
            listen_id,
        })
    }

    /// Removes exactly the registration identified by `handle`, through the
    /// remove-tagged `method`.
    ///
    /// # Errors
    ///
    /// [`Error::RemoveListenerNotConfigured`] unless `method` carries a
    /// `remove_listener` tag naming the handle's listener method.
    pub async fn remove_listener(&self, method: &str, handle: &ListenerHandle) -> Result<()> {
        let listens_to = self
            .config
            .get(method)
            .and_then(|o| o.remove_listener.clone())
            .ok_or_else(|| Error::remove_listener_not_configured(&self.service, method))?;

        if listens_to != handle.method {
            return Err(Error::protocol(format!(
                "method {}.{method} removes '{listens_to}' registrations, not '{}'",
                self.service, handle.method
            )));
        }

        self.com
            .unlisten_method(
                &self.target,
                &self.service,
                method,
                &listens_to,
                Some(handle.listen_id),
            )
            .await
    }

    /// Removes every registration this proxy's instance holds for the
    /// listener method named by the remove-all-tagged `method`.
    ///
    /// # Errors
    ///
    /// [`Error::RemoveListenerNotConfigured`] unless `method` carries a
    /// `remove_all_listeners` tag.
    pub async fn remove_all_listeners(&self, method: &str) -> Result<()> {
        let listens_to = self
            .config
            .get(method)
            .and_then(|o| o.remove_all_listeners.clone())
            .ok_or_else(|| Error::remove_listener_not_configured(&self.service, method))?;

        self.com
            .unlisten_method(&self.target, &self.service, method, &listens_to, None)
            .await
    }
}

// ============================================================================
// Tests
// ============================================================================
