//! Per-environment coordinator.
//!
//! One `Communication` instance runs per environment. It owns that
//! environment's registries (known peers, exposed services, outstanding
//! calls), routes inbound messages, and forwards traffic it is not the
//! destination of.
//!
//! # Routing
//!
//! `route_or_deliver` implements one hop:
//!
//! 1. addressed to this environment → dispatch locally (service invocation,
//!    callback settlement, or lifecycle handling);
//! 2. addressed to a known environment → forward via its registered host,
//!    appending this instance's id to the forwarding chain. A message whose
//!    chain already contains this id is dropped (routing cycle); a message
//!    is never forwarded into the host whose id equals the chain's last
//!    entry;
//! 3. addressed to an unknown environment → broadcast to every directly
//!    registered host as a last resort, logged at debug, never thrown;
//! 4. broadcast marker → deliver locally and re-broadcast under the same
//!    chain guards.
//!
//! Replies always target a message's `origin`, never its `from`. Two rules
//! make the reverse path work without topology knowledge:
//!
//! - **source auto-registration** — when a message arrives bearing an
//!   unknown `from` or `origin`, that id is recorded against the host it
//!   arrived on;
//! - **reply-through-parent** — sending via a host this instance itself
//!   listens on delegates to that host's parent endpoint, so the reply
//!   surfaces on the bus the peer is listening to rather than echoing back.
//!
//! # Remote-environment lifecycle
//!
//! `unknown → registered → ready → disposed`, per instance.
//! `register_environment` marks the environment reachable (a locally
//! supplied host is live by construction); `ready` marks environments
//! learned from the wire and re-marks after `connection_disrupted`;
//! `dispose` is terminal until `clear_environment` restarts the cycle.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::com::callbacks::CallbackRegistry;
use crate::com::proxy::ApiProxy;
use crate::com::service::{ProxyConfig, RemoteListener, Service, ServiceMethod};
use crate::error::{Error, Result};
use crate::hosts::{Host, ListenerToken, same_host};
use crate::identifiers::{EnvironmentId, ListenerId, RequestId, ServiceId};
use crate::protocol::{Message, MessageKind, Recipient};

// ============================================================================
// Constants
// ============================================================================

/// Default bounded wait for an environment to become ready.
const DEFAULT_READY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Default slow-call warning threshold.
const DEFAULT_SLOW_THRESHOLD: std::time::Duration = std::time::Duration::from_secs(2);

// ============================================================================
// CommunicationOptions
// ============================================================================

/// Policy knobs for a `Communication` instance.
///
/// Timeouts are configuration, not constants: the right values depend on
/// the transports in play.
#[derive(Debug, Clone)]
pub struct CommunicationOptions {
    /// Log a warning when a call is outstanding past `slow_threshold`.
    pub warn_on_slow: bool,
    /// Threshold for the slow-call warning.
    pub slow_threshold: std::time::Duration,
    /// Hard deadline per call; `None` waits indefinitely (until disposal).
    pub call_timeout: Option<std::time::Duration>,
    /// Bounded wait for a not-yet-ready environment before a call fails
    /// with [`Error::EnvironmentNotReady`].
    pub ready_timeout: std::time::Duration,
}

impl Default for CommunicationOptions {
    fn default() -> Self {
        Self {
            warn_on_slow: false,
            slow_threshold: DEFAULT_SLOW_THRESHOLD,
            call_timeout: None,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

// ============================================================================
// Types
// ============================================================================

/// Mapping from a destination environment id to the host used to reach it.
#[derive(Clone)]
pub struct EnvironmentRecord {
    /// Destination environment.
    pub id: EnvironmentId,
    /// Host the destination is reachable through (directly or via an
    /// intermediary).
    pub host: Arc<dyn Host>,
}

/// Handler invoked when a remote environment disposes.
pub type DisposeHandler = Arc<dyn Fn(&EnvironmentId) + Send + Sync>;

/// Callee-side bookkeeping for one remote listener registration.
struct RemoteListenerEntry {
    listener_id: ListenerId,
    subscriber: EnvironmentId,
    service: ServiceId,
    method: String,
}

// ============================================================================
// Communication
// ============================================================================

/// Per-environment coordinator: registries, proxying, routing, lifecycle.
///
/// Constructed over a root host; additional hosts attach through
/// [`Communication::register_environment`] and
/// [`Communication::register_message_handler`].
pub struct Communication {
    id: EnvironmentId,
    options: CommunicationOptions,
    environments: RwLock<FxHashMap<EnvironmentId, EnvironmentRecord>>,
    attached: Mutex<Vec<(Arc<dyn Host>, ListenerToken)>>,
    reachable: Mutex<FxHashSet<EnvironmentId>>,
    disposed_envs: Mutex<FxHashSet<EnvironmentId>>,
    ready_waiters: Mutex<FxHashMap<EnvironmentId, Vec<oneshot::Sender<()>>>>,
    services: RwLock<FxHashMap<ServiceId, Service>>,
    callbacks: Arc<CallbackRegistry>,
    remote_listeners: Mutex<FxHashMap<RequestId, RemoteListenerEntry>>,
    dispose_subscribers: Mutex<Vec<DisposeHandler>>,
    disposed: AtomicBool,
}

// ============================================================================
// Communication - Construction
// ============================================================================

impl Communication {
    /// Creates a coordinator for environment `id` over `host`.
    pub fn new(host: Arc<dyn Host>, id: impl Into<EnvironmentId>) -> Arc<Self> {
        Self::with_options(host, id, CommunicationOptions::default())
    }

    /// Creates a coordinator with explicit options.
    pub fn with_options(
        host: Arc<dyn Host>,
        id: impl Into<EnvironmentId>,
        options: CommunicationOptions,
    ) -> Arc<Self> {
        let id = id.into();

        let com = Arc::new(Self {
            id: id.clone(),
            options,
            environments: RwLock::new(FxHashMap::default()),
            attached: Mutex::new(Vec::new()),
            reachable: Mutex::new(FxHashSet::default()),
            disposed_envs: Mutex::new(FxHashSet::default()),
            ready_waiters: Mutex::new(FxHashMap::default()),
            services: RwLock::new(FxHashMap::default()),
            callbacks: Arc::new(CallbackRegistry::new()),
            remote_listeners: Mutex::new(FxHashMap::default()),
            dispose_subscribers: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        });

        com.register_environment(id, host);
        com
    }
}

// ============================================================================
// Communication - Registration
// ============================================================================

impl Communication {
    /// Returns this instance's environment id.
    #[inline]
    #[must_use]
    pub fn env_id(&self) -> &EnvironmentId {
        &self.id
    }

    /// Registers `id` as reachable through `host` and attaches this
    /// instance's inbound handler to the host.
    ///
    /// Re-registering an id replaces the previous record; the handler is
    /// attached at most once per host, so no duplicate listeners pile up.
    /// A disposed id stays disposed until [`Communication::clear_environment`].
    pub fn register_environment(self: &Arc<Self>, id: impl Into<EnvironmentId>, host: Arc<dyn Host>) {
        let id = id.into();
        if self.disposed.load(Ordering::SeqCst) {
            warn!(env = %id, "register_environment on a disposed instance, ignoring");
            return;
        }
        if self.disposed_envs.lock().contains(&id) {
            warn!(env = %id, "environment is disposed; clear_environment must run first");
            return;
        }

        self.attach_handler(&host);
        self.environments.write().insert(
            id.clone(),
            EnvironmentRecord {
                id: id.clone(),
                host,
            },
        );
        self.reachable.lock().insert(id.clone());
        self.notify_ready_waiters(&id);

        debug!(env = %id, "Environment registered");
    }

    /// Attaches this instance's inbound handler to a host without creating
    /// an environment record (server-side wiring).
    pub fn register_message_handler(self: &Arc<Self>, host: Arc<dyn Host>) {
        self.attach_handler(&host);
    }

    /// Exposes a service to remote callers.
    pub fn register_service(&self, service: Service) {
        let id = service.id().clone();
        self.services.write().insert(id.clone(), service);
        debug!(service = %id, "Service registered");
    }

    /// Builds a proxy whose calls are routed to `target`'s `service`.
    pub fn api_proxy(
        self: &Arc<Self>,
        target: impl Into<EnvironmentId>,
        service: impl Into<ServiceId>,
        config: ProxyConfig,
    ) -> ApiProxy {
        ApiProxy::new(Arc::clone(self), target.into(), service.into(), config)
    }

    /// Returns the host a destination environment is registered through.
    #[must_use]
    pub fn environment_host(&self, id: &EnvironmentId) -> Option<Arc<dyn Host>> {
        self.environments.read().get(id).map(|r| Arc::clone(&r.host))
    }

    /// Subscribes to remote-environment disposal.
    pub fn subscribe_to_environment_dispose(&self, handler: DisposeHandler) {
        self.dispose_subscribers.lock().push(handler);
    }

    /// Returns the number of outstanding requests.
    #[must_use]
    pub fn pending_call_count(&self) -> usize {
        self.callbacks.len()
    }

    /// Broadcasts `ready` so peers release calls queued for this
    /// environment.
    pub fn announce_ready(self: &Arc<Self>) {
        let message = Message::lifecycle(&self.id, Recipient::Broadcast, MessageKind::Ready);
        self.route_or_deliver(message);
    }

    /// Attaches the inbound handler to `host` exactly once.
    fn attach_handler(self: &Arc<Self>, host: &Arc<dyn Host>) {
        let mut attached = self.attached.lock();
        if attached.iter().any(|(h, _)| same_host(h, host)) {
            return;
        }

        let weak_com = Arc::downgrade(self);
        let weak_host = Arc::downgrade(host);
        let token = host.add_listener(Arc::new(move |message| {
            let (Some(com), Some(source)) = (weak_com.upgrade(), weak_host.upgrade()) else {
                return;
            };
            com.handle_incoming(message, &source);
        }));
        attached.push((Arc::clone(host), token));
    }

    /// Returns `true` if this instance listens on `host`.
    fn is_attached(&self, host: &Arc<dyn Host>) -> bool {
        self.attached.lock().iter().any(|(h, _)| same_host(h, host))
    }
}

// ============================================================================
// Communication - Lifecycle
// ============================================================================

impl Communication {
    /// Forgets a remote environment, restarting its lifecycle.
    ///
    /// Clearing this instance's own id broadcasts `dispose` to all peers.
    pub fn clear_environment(self: &Arc<Self>, id: &EnvironmentId) {
        if *id == self.id {
            let message = Message::lifecycle(&self.id, Recipient::Broadcast, MessageKind::Dispose);
            self.route_or_deliver(message);
            return;
        }

        self.environments.write().remove(id);
        self.reachable.lock().remove(id);
        self.disposed_envs.lock().remove(id);
        debug!(env = %id, "Environment cleared");
    }

    /// Disposes this instance: cancels all timers, rejects all outstanding
    /// requests, and detaches every host listener. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let attached: Vec<(Arc<dyn Host>, ListenerToken)> =
            self.attached.lock().drain(..).collect();
        for (host, token) in attached {
            host.remove_listener(token);
        }

        self.callbacks.reject_all(|| Error::Disposed);
        self.remote_listeners.lock().clear();
        self.ready_waiters.lock().clear();
        self.dispose_subscribers.lock().clear();
        self.environments.write().clear();
        self.services.write().clear();

        debug!(env = %self.id, "Communication disposed");
    }

    /// Returns `true` once disposed.
    #[inline]
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_disposed() {
            Err(Error::Disposed)
        } else {
            Ok(())
        }
    }
}

// ============================================================================
// Communication - Call Paths
// ============================================================================

impl Communication {
    /// Sends a call and suspends until the response, a timeout, or target
    /// disposal.
    pub(crate) async fn call_method(
        self: &Arc<Self>,
        target: &EnvironmentId,
        service: &ServiceId,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.prepare_send(target).await?;

        let request_id = RequestId::generate();
        let (tx, rx) = oneshot::channel();
        self.callbacks
            .register_call(request_id, target.clone(), service.clone(), method, tx);
        self.arm_timers(request_id, service, method);

        let message = Message::call(
            &self.id,
            Recipient::Env(target.clone()),
            request_id,
            service.clone(),
            method,
            args,
            true,
        );
        self.route_or_deliver(message);

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Disposed),
        }
    }

    /// Sends a fire-and-forget call; settles immediately.
    pub(crate) async fn emit_method(
        self: &Arc<Self>,
        target: &EnvironmentId,
        service: &ServiceId,
        method: &str,
        args: Vec<Value>,
    ) -> Result<()> {
        self.prepare_send(target).await?;

        let message = Message::call(
            &self.id,
            Recipient::Env(target.clone()),
            RequestId::generate(),
            service.clone(),
            method,
            args,
            false,
        );
        self.route_or_deliver(message);
        Ok(())
    }

    /// Sends a `listen` and suspends until the registration ack.
    pub(crate) async fn listen_method(
        self: &Arc<Self>,
        target: &EnvironmentId,
        service: &ServiceId,
        method: &str,
        callback: Arc<dyn Fn(Value) + Send + Sync>,
    ) -> Result<RequestId> {
        self.prepare_send(target).await?;

        let request_id = RequestId::generate();
        let (ack_tx, ack_rx) = oneshot::channel();
        self.callbacks.register_listener(
            request_id,
            target.clone(),
            service.clone(),
            method,
            ack_tx,
            callback,
        );
        self.arm_timers(request_id, service, method);

        let message = Message::listen(
            &self.id,
            Recipient::Env(target.clone()),
            request_id,
            service.clone(),
            method,
        );
        self.route_or_deliver(message);

        match ack_rx.await {
            Ok(Ok(_)) => Ok(request_id),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Disposed),
        }
    }

    /// Sends an `unlisten` and drops the local registration(s) on ack.
    pub(crate) async fn unlisten_method(
        self: &Arc<Self>,
        target: &EnvironmentId,
        service: &ServiceId,
        method: &str,
        listens_to: &str,
        listen_id: Option<RequestId>,
    ) -> Result<()> {
        self.prepare_send(target).await?;

        let request_id = RequestId::generate();
        let (tx, rx) = oneshot::channel();
        self.callbacks
            .register_call(request_id, target.clone(), service.clone(), method, tx);
        self.arm_timers(request_id, service, method);

        let message = Message::unlisten(
            &self.id,
            Recipient::Env(target.clone()),
            request_id,
            service.clone(),
            method,
            listen_id,
        );
        self.route_or_deliver(message);

        match rx.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::Disposed),
        }

        match listen_id {
            Some(listen_id) => self.callbacks.remove(listen_id),
            None => self
                .callbacks
                .remove_listeners_matching(target, service, listens_to),
        }
        Ok(())
    }

    /// Shared preamble of every outbound request.
    async fn prepare_send(&self, target: &EnvironmentId) -> Result<()> {
        self.ensure_active()?;
        if self.disposed_envs.lock().contains(target) {
            return Err(Error::environment_disposed(target));
        }
        if *target != self.id {
            self.wait_until_ready(target).await?;
        }
        Ok(())
    }

    /// Queues until `target` is marked ready, bounded by `ready_timeout`.
    async fn wait_until_ready(&self, target: &EnvironmentId) -> Result<()> {
        if self.reachable.lock().contains(target) {
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        self.ready_waiters
            .lock()
            .entry(target.clone())
            .or_default()
            .push(tx);
        debug!(env = %target, "Queueing call until environment is ready");

        match timeout(self.options.ready_timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                if self.disposed_envs.lock().contains(target) {
                    Err(Error::environment_disposed(target))
                } else {
                    Err(Error::Disposed)
                }
            }
            Err(_) => Err(Error::environment_not_ready(
                target,
                self.options.ready_timeout.as_millis() as u64,
            )),
        }
    }

    /// Spawns the slow-warning and hard-timeout timers for a request.
    fn arm_timers(&self, request_id: RequestId, service: &ServiceId, method: &str) {
        let slow_timer = if self.options.warn_on_slow {
            let threshold = self.options.slow_threshold;
            let service = service.clone();
            let method = method.to_string();
            Some(tokio::spawn(async move {
                tokio::time::sleep(threshold).await;
                warn!(
                    request_id = %request_id,
                    service = %service,
                    method = %method,
                    threshold_ms = threshold.as_millis() as u64,
                    "Call still pending past slow threshold"
                );
            }))
        } else {
            None
        };

        let timeout_timer = self.options.call_timeout.map(|deadline| {
            let callbacks = Arc::clone(&self.callbacks);
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                callbacks.reject(
                    request_id,
                    Error::call_timeout(request_id, deadline.as_millis() as u64),
                );
            })
        });

        self.callbacks.arm_timers(request_id, slow_timer, timeout_timer);
    }

    fn notify_ready_waiters(&self, env: &EnvironmentId) {
        if let Some(waiters) = self.ready_waiters.lock().remove(env) {
            for tx in waiters {
                let _ = tx.send(());
            }
        }
    }
}

// ============================================================================
// Communication - Routing
// ============================================================================

impl Communication {
    /// Routes a message one hop: local dispatch, targeted forward, or
    /// broadcast.
    pub fn route_or_deliver(self: &Arc<Self>, message: Message) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        self.dispatch(message, None);
    }

    /// Routes one message by destination.
    fn dispatch(self: &Arc<Self>, message: Message, source: Option<&Arc<dyn Host>>) {
        let addressed_to_self =
            matches!(&message.to, Recipient::Env(id) if *id == self.id);

        if addressed_to_self {
            self.deliver_local(message, source);
        } else if message.to.is_broadcast() {
            self.deliver_local(message.clone(), source);
            self.forward_broadcast(message);
        } else {
            self.forward(message);
        }
    }

    /// Inbound handler attached to every registered host.
    fn handle_incoming(self: &Arc<Self>, message: Message, source: &Arc<dyn Host>) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        // Own sends echo back on shared buses.
        if message.from == self.id {
            return;
        }

        trace!(
            env = %self.id,
            kind = message.kind.name(),
            from = %message.from,
            origin = %message.origin,
            to = %message.to,
            "Inbound message"
        );

        self.auto_register(&message, source);
        self.dispatch(message, Some(source));
    }

    /// Records unknown `from`/`origin` ids against the host a message
    /// arrived on, so replies can retrace the path hop by hop.
    fn auto_register(&self, message: &Message, source: &Arc<dyn Host>) {
        if matches!(
            message.kind,
            MessageKind::Dispose | MessageKind::ConnectionDisrupted
        ) {
            // Lifecycle kinds about an environment going away must not
            // resurrect its records.
            return;
        }

        for id in [&message.from, &message.origin] {
            if *id == self.id || self.disposed_envs.lock().contains(id) {
                continue;
            }
            {
                let mut environments = self.environments.write();
                if !environments.contains_key(id) {
                    environments.insert(
                        id.clone(),
                        EnvironmentRecord {
                            id: id.clone(),
                            host: Arc::clone(source),
                        },
                    );
                    trace!(env = %id, host = source.id(), "Auto-registered message source");
                }
            }
            if self.reachable.lock().insert(id.clone()) {
                self.notify_ready_waiters(id);
            }
        }
    }

    /// Forwards a message addressed to another environment.
    fn forward(self: &Arc<Self>, mut message: Message) {
        let Some(target) = message.to.env_id().cloned() else {
            return;
        };

        if message.has_traversed(&self.id) {
            warn!(env = %self.id, to = %target, "Forwarding loop detected, dropping");
            return;
        }

        let host = self
            .environments
            .read()
            .get(&target)
            .map(|record| Arc::clone(&record.host));

        match host {
            Some(host) => {
                if message.forwarding_chain.last().map(EnvironmentId::as_str) == Some(host.id()) {
                    warn!(
                        to = %target,
                        host = host.id(),
                        "Refusing to forward back into the arrival host"
                    );
                    return;
                }

                message.prepare_forward(&self.id);
                let send_host = self.resolve_send_host(&host);
                if let Err(e) = send_host.post_message(message) {
                    warn!(to = %target, host = send_host.id(), error = %e, "Forward failed");
                }
            }
            None => {
                debug!(to = %target, "No environment record, broadcasting as last resort");
                self.forward_broadcast(message);
            }
        }
    }

    /// Re-broadcasts to every directly registered host, chain-guarded.
    fn forward_broadcast(self: &Arc<Self>, mut message: Message) {
        if message.has_traversed(&self.id) {
            trace!(env = %self.id, "Broadcast already traversed this environment, dropping");
            return;
        }

        let hosts: Vec<Arc<dyn Host>> = {
            let environments = self.environments.read();
            let mut hosts: Vec<Arc<dyn Host>> = Vec::new();
            for record in environments.values() {
                if message.forwarding_chain.last().map(EnvironmentId::as_str)
                    == Some(record.host.id())
                {
                    continue;
                }
                if !hosts.iter().any(|h| same_host(h, &record.host)) {
                    hosts.push(Arc::clone(&record.host));
                }
            }
            hosts
        };

        if hosts.is_empty() {
            return;
        }

        message.prepare_forward(&self.id);
        for host in hosts {
            let send_host = self.resolve_send_host(&host);
            if let Err(e) = send_host.post_message(message.clone()) {
                warn!(host = send_host.id(), error = %e, "Broadcast send failed");
            }
        }
    }

    /// Sending via a host this instance listens on would only echo back to
    /// itself; delegate to the parent endpoint instead, where the peer is
    /// listening.
    fn resolve_send_host(&self, host: &Arc<dyn Host>) -> Arc<dyn Host> {
        if self.is_attached(host)
            && let Some(parent) = host.parent()
        {
            return parent;
        }
        Arc::clone(host)
    }
}

// ============================================================================
// Communication - Local Dispatch
// ============================================================================

impl Communication {
    /// Dispatches a message addressed to this environment.
    fn deliver_local(self: &Arc<Self>, message: Message, source: Option<&Arc<dyn Host>>) {
        let Message { kind, origin, .. } = message;

        match kind {
            MessageKind::Call {
                request_id,
                service,
                method,
                args,
                expects_response,
            } => self.handle_call(origin, request_id, service, method, args, expects_response),

            MessageKind::Response {
                request_id,
                value,
                error,
            } => self.callbacks.settle_remote(request_id, value, error),

            MessageKind::Listen {
                request_id,
                service,
                method,
            } => self.handle_listen(origin, request_id, service, method),

            MessageKind::Unlisten {
                request_id,
                service,
                method,
                listen_id,
            } => self.handle_unlisten(origin, request_id, service, method, listen_id),

            MessageKind::Dispose => self.handle_dispose(&origin),

            MessageKind::Ready => self.handle_ready(&origin, source),

            MessageKind::ConnectionDisrupted => self.handle_disruption(&origin),

            MessageKind::ServerLostClientState | MessageKind::ServerConnectionRestored => {
                debug!(origin = %origin, "Host-level signal reached routing layer, ignoring");
            }
        }
    }

    /// Invokes a local service method and responds to the caller.
    fn handle_call(
        self: &Arc<Self>,
        caller: EnvironmentId,
        request_id: RequestId,
        service: ServiceId,
        method: String,
        args: Vec<Value>,
        expects_response: bool,
    ) {
        let outcome = self.invoke_service(&service, &method, &caller, args);

        if expects_response {
            let response =
                Message::response(&self.id, Recipient::Env(caller), request_id, outcome);
            self.route_or_deliver(response);
        } else if let Err(message) = outcome {
            warn!(service = %service, method = %method, error = %message, "Emit-only call failed");
        }
    }

    /// Looks up and invokes a service method; errors become strings so the
    /// routing loop never unwinds.
    fn invoke_service(
        &self,
        service: &ServiceId,
        method: &str,
        caller: &EnvironmentId,
        args: Vec<Value>,
    ) -> std::result::Result<Value, String> {
        let method_impl = self.lookup_method(service, method)?;

        match method_impl {
            ServiceMethod::Plain(f) => f(args).map_err(|e| e.to_string()),
            ServiceMethod::MultiTenant(f) => f(caller, args).map_err(|e| e.to_string()),
            ServiceMethod::Listener(_) => Err(format!(
                "method '{method}' of service '{service}' is a listener; subscribe via listen"
            )),
            ServiceMethod::RemoveListener { .. } | ServiceMethod::RemoveAllListeners { .. } => {
                Err(format!(
                    "method '{method}' of service '{service}' removes listeners; use unlisten"
                ))
            }
        }
    }

    /// Clones a method implementation out of the registry so user code
    /// never runs under the registry lock.
    fn lookup_method(
        &self,
        service: &ServiceId,
        method: &str,
    ) -> std::result::Result<ServiceMethod, String> {
        let services = self.services.read();
        match services.get(service) {
            None => Err(format!("unknown service '{service}'")),
            Some(s) => match s.get(method) {
                None => Err(format!("unknown method '{method}' of service '{service}'")),
                Some(m) => Ok(m.clone()),
            },
        }
    }

    /// Registers a remote listener and acks the registration.
    fn handle_listen(
        self: &Arc<Self>,
        subscriber: EnvironmentId,
        request_id: RequestId,
        service: ServiceId,
        method: String,
    ) {
        let outcome = self.register_remote_listener(&subscriber, request_id, &service, &method);
        let response = Message::response(&self.id, Recipient::Env(subscriber), request_id, outcome);
        self.route_or_deliver(response);
    }

    fn register_remote_listener(
        self: &Arc<Self>,
        subscriber: &EnvironmentId,
        request_id: RequestId,
        service: &ServiceId,
        method: &str,
    ) -> std::result::Result<Value, String> {
        // Shortcut topologies can deliver the same listen twice; the
        // registration is keyed by request id and stays single.
        if self.remote_listeners.lock().contains_key(&request_id) {
            return Ok(Value::Null);
        }

        let ServiceMethod::Listener(f) = self.lookup_method(service, method)? else {
            return Err(format!(
                "method '{method}' of service '{service}' is not a listener"
            ));
        };

        let listener_id = ListenerId::next();
        let weak = Arc::downgrade(self);
        let emit_target = subscriber.clone();
        let emitter: Arc<dyn Fn(Value) + Send + Sync> = Arc::new(move |value| {
            if let Some(com) = weak.upgrade() {
                let response = Message::response(
                    &com.id,
                    Recipient::Env(emit_target.clone()),
                    request_id,
                    Ok(value),
                );
                com.route_or_deliver(response);
            }
        });

        self.remote_listeners.lock().insert(
            request_id,
            RemoteListenerEntry {
                listener_id,
                subscriber: subscriber.clone(),
                service: service.clone(),
                method: method.to_string(),
            },
        );

        let listener = RemoteListener::new(listener_id, subscriber.clone(), emitter);
        match f(listener) {
            Ok(()) => Ok(Value::Null),
            Err(e) => {
                self.remote_listeners.lock().remove(&request_id);
                Err(e.to_string())
            }
        }
    }

    /// Removes remote listener registration(s) and acks.
    fn handle_unlisten(
        self: &Arc<Self>,
        requester: EnvironmentId,
        request_id: RequestId,
        service: ServiceId,
        method: String,
        listen_id: Option<RequestId>,
    ) {
        let outcome = self.remove_remote_listener(&requester, &service, &method, listen_id);
        let response = Message::response(&self.id, Recipient::Env(requester), request_id, outcome);
        self.route_or_deliver(response);
    }

    fn remove_remote_listener(
        &self,
        requester: &EnvironmentId,
        service: &ServiceId,
        method: &str,
        listen_id: Option<RequestId>,
    ) -> std::result::Result<Value, String> {
        match self.lookup_method(service, method)? {
            ServiceMethod::RemoveListener { listens_to, f } => {
                let Some(listen_id) = listen_id else {
                    return Err(format!(
                        "unlisten for '{method}' of service '{service}' requires a listen id"
                    ));
                };

                let entry = {
                    let mut listeners = self.remote_listeners.lock();
                    let valid = listeners.get(&listen_id).map(|entry| {
                        entry.subscriber == *requester
                            && entry.service == *service
                            && entry.method == listens_to
                    });
                    match valid {
                        Some(true) => listeners.remove(&listen_id).expect("entry present"),
                        Some(false) => {
                            return Err(format!(
                                "listen id {listen_id} does not belong to '{listens_to}'"
                            ));
                        }
                        None => return Err(format!("unknown listen id {listen_id}")),
                    }
                };

                f(entry.listener_id).map_err(|e| e.to_string())?;
                Ok(Value::Null)
            }

            ServiceMethod::RemoveAllListeners { listens_to, f } => {
                let ids: Vec<ListenerId> = {
                    let mut listeners = self.remote_listeners.lock();
                    let matching: Vec<RequestId> = listeners
                        .iter()
                        .filter(|(_, entry)| {
                            entry.subscriber == *requester
                                && entry.service == *service
                                && entry.method == listens_to
                        })
                        .map(|(id, _)| *id)
                        .collect();
                    matching
                        .into_iter()
                        .filter_map(|id| listeners.remove(&id))
                        .map(|entry| entry.listener_id)
                        .collect()
                };

                f(&ids).map_err(|e| e.to_string())?;
                Ok(Value::Null)
            }

            _ => Err(format!(
                "method '{method}' of service '{service}' does not remove listeners"
            )),
        }
    }

    /// Marks an environment reachable and releases queued calls.
    fn handle_ready(&self, origin: &EnvironmentId, source: Option<&Arc<dyn Host>>) {
        if *origin == self.id {
            return;
        }

        // A ready after dispose starts a fresh logical session.
        self.disposed_envs.lock().remove(origin);

        if let Some(source) = source {
            let mut environments = self.environments.write();
            environments.entry(origin.clone()).or_insert_with(|| EnvironmentRecord {
                id: origin.clone(),
                host: Arc::clone(source),
            });
        }

        if self.reachable.lock().insert(origin.clone()) {
            debug!(env = %origin, "Environment ready");
        }
        self.notify_ready_waiters(origin);
    }

    /// Marks an environment unreachable without discarding state.
    fn handle_disruption(&self, origin: &EnvironmentId) {
        if *origin == self.id {
            return;
        }
        if self.reachable.lock().remove(origin) {
            debug!(env = %origin, "Environment connection disrupted, keeping state");
        }
    }

    /// Fans out a remote environment's disposal.
    fn handle_dispose(&self, env: &EnvironmentId) {
        if *env == self.id {
            return;
        }
        if !self.disposed_envs.lock().insert(env.clone()) {
            // Broadcast gossip can deliver the same dispose twice.
            return;
        }

        self.environments.write().remove(env);
        self.reachable.lock().remove(env);
        self.ready_waiters.lock().remove(env);

        self.callbacks
            .reject_for_target(env, || Error::environment_disposed(env));
        self.drop_remote_listeners_of(env);

        let handlers: Vec<DisposeHandler> = self.dispose_subscribers.lock().clone();
        for handler in handlers {
            handler(env);
        }

        debug!(env = %env, "Environment disposed");
    }

    /// Drops callee-side registrations held for a disposed subscriber,
    /// handing them to the service's remove-all method where one exists.
    fn drop_remote_listeners_of(&self, env: &EnvironmentId) {
        let removed: Vec<RemoteListenerEntry> = {
            let mut listeners = self.remote_listeners.lock();
            let matching: Vec<RequestId> = listeners
                .iter()
                .filter(|(_, entry)| entry.subscriber == *env)
                .map(|(id, _)| *id)
                .collect();
            matching
                .into_iter()
                .filter_map(|id| listeners.remove(&id))
                .collect()
        };
        if removed.is_empty() {
            return;
        }

        let mut groups: FxHashMap<(ServiceId, String), Vec<ListenerId>> = FxHashMap::default();
        for entry in removed {
            groups
                .entry((entry.service, entry.method))
                .or_default()
                .push(entry.listener_id);
        }

        for ((service, method), ids) in groups {
            let remove_all = {
                let services = self.services.read();
                services.get(&service).and_then(|s| {
                    s.methods().find_map(|(_, m)| match m {
                        ServiceMethod::RemoveAllListeners { listens_to, f }
                            if *listens_to == method =>
                        {
                            Some(Arc::clone(f))
                        }
                        _ => None,
                    })
                })
            };

            if let Some(f) = remove_all
                && let Err(e) = f(&ids)
            {
                warn!(service = %service, method = %method, error = %e, "Listener cleanup failed");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use serde_json::json;

    use crate::hosts::BaseHost;
    use crate::com::service::MethodOptions;

    fn echo_service(id: &str) -> Service {
        Service::new(id).method("echo", |args| {
            Ok(args.into_iter().next().unwrap_or(Value::Null))
        })
    }

    fn env(id: &str) -> EnvironmentId {
        EnvironmentId::new(id)
    }

    #[tokio::test]
    async fn test_single_communication() {
        let host = BaseHost::new();
        let main = Communication::new(host, "main");

        main.register_service(echo_service("echoService"));

        let proxy = main.api_proxy("main", "echoService", ProxyConfig::new());
        let result = proxy.call("echo", vec![json!("Yoo!")]).await.expect("call");
        assert_eq!(result, json!("Yoo!"));
    }

    #[tokio::test]
    async fn test_multi_communication() {
        let host = BaseHost::new();
        let main = Communication::new(host.clone() as Arc<dyn Host>, "main");

        let host2 = host.open_child();
        let main2 = Communication::new(host2.clone() as Arc<dyn Host>, "main2");

        main.register_environment("main2", host2);
        main2.register_service(echo_service("echoService"));

        let proxy = main.api_proxy("main2", "echoService", ProxyConfig::new());
        let result = proxy.call("echo", vec![json!("Yoo!")]).await.expect("call");
        assert_eq!(result, json!("Yoo!"));
    }

    #[tokio::test]
    async fn test_multitenant_injects_original_caller() {
        // main routes between two children; the service runs on child2 and
        // must observe the original caller, not the forwarding hop.
        let root = BaseHost::new();
        let main = Communication::new(root.clone() as Arc<dyn Host>, "main");

        let c1 = root.open_child();
        let child = Communication::new(c1.clone() as Arc<dyn Host>, "child");
        let c2 = root.open_child();
        let child2 = Communication::new(c2.clone() as Arc<dyn Host>, "child2");

        main.register_environment("child", c1);
        main.register_environment("child2", c2);
        // child reaches child2 through main's bus.
        child.register_environment("child2", root.clone() as Arc<dyn Host>);

        child2.register_service(Service::new("echoService").multi_tenant_method(
            "echo",
            |caller, args| {
                let text = args.first().and_then(Value::as_str).unwrap_or_default();
                Ok(json!(format!("{caller} echo {text}")))
            },
        ));

        let proxy = child.api_proxy("child2", "echoService", ProxyConfig::new());
        let result = proxy.call("echo", vec![json!("Yoo!")]).await.expect("call");
        assert_eq!(result, json!("child echo Yoo!"));

        let direct = main.api_proxy("child2", "echoService", ProxyConfig::new());
        let result = direct.call("echo", vec![json!("Yoo!")]).await.expect("call");
        assert_eq!(result, json!("main echo Yoo!"));
    }

    #[tokio::test]
    async fn test_emit_only_sends_no_callback() {
        let host = BaseHost::new();
        let main = Communication::new(host.clone() as Arc<dyn Host>, "main");

        let host2 = host.open_child();
        let child = Communication::new(host2.clone() as Arc<dyn Host>, "child");
        main.register_environment("child", host2);

        let hits = Arc::new(Mutex::new(0u32));
        let hits_clone = Arc::clone(&hits);
        child.register_service(Service::new("echoService").method("echo", move |_| {
            *hits_clone.lock() += 1;
            Ok(Value::Null)
        }));

        let proxy = main.api_proxy(
            "child",
            "echoService",
            ProxyConfig::new().method("echo", MethodOptions::emit_only()),
        );
        let result = proxy.call("echo", vec![json!("Yo!")]).await.expect("emit");

        assert_eq!(result, Value::Null);
        assert_eq!(*hits.lock(), 1);
        // No CallbackRecord was allocated and no response is in flight.
        assert_eq!(main.pending_call_count(), 0);
    }

    #[tokio::test]
    async fn test_round_trip_across_three_forwarding_hops() {
        // e1 -> e2 -> e3 -> e4 -> e5, three intermediaries forwarding.
        let roots: Vec<Arc<BaseHost>> = (0..5).map(|_| BaseHost::new()).collect();
        let coms: Vec<Arc<Communication>> = roots
            .iter()
            .enumerate()
            .map(|(i, root)| {
                Communication::new(root.clone() as Arc<dyn Host>, format!("e{}", i + 1))
            })
            .collect();

        // Link i -> i+1 through a child endpoint of root i.
        for i in 0..4 {
            let link = roots[i].open_child();
            coms[i + 1].register_message_handler(link.clone() as Arc<dyn Host>);
            coms[i].register_environment("e5", link);
        }

        coms[4].register_service(echo_service("echoService"));

        let proxy = coms[0].api_proxy("e5", "echoService", ProxyConfig::new());
        let result = proxy.call("echo", vec![json!("deep")]).await.expect("call");
        assert_eq!(result, json!("deep"));
    }

    #[tokio::test]
    async fn test_forwarded_answer_from_forwarded_message() {
        // 1 talks to 2, 3 talks to 4, 1 talks to 3; a call from 2 to 4 is
        // forwarded twice out and twice back.
        let host1 = BaseHost::new();
        let host2 = BaseHost::new();
        let host3 = BaseHost::new();
        let host4 = BaseHost::new();

        let com1 = Communication::new(host1.clone() as Arc<dyn Host>, "com1");
        let com2 = Communication::new(host2.clone() as Arc<dyn Host>, "com2");
        let com3 = Communication::new(host3.clone() as Arc<dyn Host>, "com3");
        let com4 = Communication::new(host4.clone() as Arc<dyn Host>, "com4");

        // 1 to 2
        let com2_link = host1.open_child();
        com1.register_environment("com2", com2_link.clone());
        com2.register_message_handler(com2_link);

        // 3 to 4
        let com4_link = host3.open_child();
        com3.register_environment("com4", com4_link.clone());
        com4.register_message_handler(com4_link);

        // 1 to 3
        let com3_link = host1.open_child();
        com1.register_environment("com3", com3_link.clone());
        com3.register_message_handler(com3_link.clone());

        // 1 reaches 4 through 3.
        com1.register_environment("com4", com3_link);

        // 2 reaches 4 through 1.
        let com1_link = host1.open_child();
        com1.register_message_handler(com1_link.clone());
        com2.register_environment("com4", com1_link);

        com4.register_service(
            Service::new("service")
                .method("echo", |args| {
                    let text = args.first().and_then(Value::as_str).unwrap_or_default();
                    Ok(json!(format!("hello {text}")))
                })
                .method("fail", |_| Err(Error::protocol("fail"))),
        );

        let proxy = com2.api_proxy("com4", "service", ProxyConfig::new());
        assert_eq!(
            proxy.call("echo", vec![json!("name")]).await.expect("call"),
            json!("hello name")
        );

        let err = proxy.call("fail", vec![]).await.unwrap_err();
        assert!(err.to_string().contains("fail"));
    }

    #[tokio::test]
    async fn test_routing_cycle_is_rejected() {
        let root1 = BaseHost::new();
        let root2 = BaseHost::new();
        let com1 = Communication::with_options(
            root1.clone() as Arc<dyn Host>,
            "com1",
            CommunicationOptions {
                call_timeout: Some(Duration::from_millis(200)),
                ..CommunicationOptions::default()
            },
        );
        let com2 = Communication::new(root2.clone() as Arc<dyn Host>, "com2");

        // Each side believes the other knows "ghost": a routing cycle.
        let link12 = root1.open_child();
        com2.register_message_handler(link12.clone());
        com1.register_environment("ghost", link12);

        let link21 = root2.open_child();
        com1.register_message_handler(link21.clone());
        com2.register_environment("ghost", link21);

        let proxy = com1.api_proxy("ghost", "svc", ProxyConfig::new());
        let err = proxy.call("m", vec![]).await.unwrap_err();
        assert!(err.is_timeout(), "cycle must terminate in a timeout: {err}");
    }

    #[tokio::test]
    async fn test_service_isolation_by_id() {
        let host = BaseHost::new();
        let main = Communication::new(host, "main");

        main.register_service(Service::new("serviceA").method("name", |_| Ok(json!("A"))));
        main.register_service(Service::new("serviceB").method("name", |_| Ok(json!("B"))));

        let a = main.api_proxy("main", "serviceA", ProxyConfig::new());
        let b = main.api_proxy("main", "serviceB", ProxyConfig::new());

        assert_eq!(a.call("name", vec![]).await.expect("call"), json!("A"));
        assert_eq!(b.call("name", vec![]).await.expect("call"), json!("B"));
    }

    #[tokio::test]
    async fn test_unknown_service_rejects_with_remote_error() {
        let host = BaseHost::new();
        let main = Communication::new(host, "main");

        let proxy = main.api_proxy("main", "nope", ProxyConfig::new());
        let err = proxy.call("echo", vec![]).await.unwrap_err();
        assert!(err.to_string().contains("unknown service"));
    }

    #[tokio::test]
    async fn test_listener_round_trip_through_middleman() {
        let middle_host = BaseHost::new();
        let a_host = BaseHost::new();
        let b_host = BaseHost::new();

        let middle = Communication::new(middle_host.clone() as Arc<dyn Host>, "middle");
        let a_com = Communication::new(a_host.clone() as Arc<dyn Host>, "aEnv");
        let b_com = Communication::new(b_host.clone() as Arc<dyn Host>, "bEnv");

        a_com.register_environment("bEnv", middle_host.clone() as Arc<dyn Host>);
        middle.register_environment("aEnv", a_host.clone() as Arc<dyn Host>);
        middle.register_environment("bEnv", b_host.clone() as Arc<dyn Host>);

        // The mock service stores listeners and exposes invoke/count.
        let listeners: Arc<Mutex<Vec<RemoteListener>>> = Arc::new(Mutex::new(Vec::new()));
        let l1 = Arc::clone(&listeners);
        let l2 = Arc::clone(&listeners);
        let l3 = Arc::clone(&listeners);
        let l4 = Arc::clone(&listeners);
        b_com.register_service(
            Service::new("myApi")
                .listener_method("listen", move |listener| {
                    l1.lock().push(listener);
                    Ok(())
                })
                .remove_listener_method("unsubscribe", "listen", move |id| {
                    l2.lock().retain(|l| l.id() != id);
                    Ok(())
                })
                .method("invoke", move |_| {
                    for listener in l3.lock().iter() {
                        listener.emit(json!(1));
                    }
                    Ok(Value::Null)
                })
                .method("count", move |_| Ok(json!(l4.lock().len()))),
        );

        let config = ProxyConfig::new()
            .method("listen", MethodOptions::listener())
            .method("unsubscribe", MethodOptions::remove_listener("listen"));
        let proxy = a_com.api_proxy("bEnv", "myApi", config);

        let first_hits = Arc::new(Mutex::new(0u32));
        let second_hits = Arc::new(Mutex::new(0u32));

        let first_clone = Arc::clone(&first_hits);
        let first = proxy
            .add_listener("listen", move |_| *first_clone.lock() += 1)
            .await
            .expect("subscribe");

        let second_clone = Arc::clone(&second_hits);
        let second = proxy
            .add_listener("listen", move |_| *second_clone.lock() += 1)
            .await
            .expect("subscribe");

        // Two independent remote registrations.
        assert_eq!(proxy.call("count", vec![]).await.expect("count"), json!(2));

        proxy.call("invoke", vec![]).await.expect("invoke");
        assert_eq!(*first_hits.lock(), 1);
        assert_eq!(*second_hits.lock(), 1);

        // Removing one leaves exactly the other registered.
        proxy.remove_listener("unsubscribe", &first).await.expect("unsubscribe");
        assert_eq!(proxy.call("count", vec![]).await.expect("count"), json!(1));

        proxy.call("invoke", vec![]).await.expect("invoke");
        assert_eq!(*first_hits.lock(), 1);
        assert_eq!(*second_hits.lock(), 2);

        proxy.remove_listener("unsubscribe", &second).await.expect("unsubscribe");
        assert_eq!(proxy.call("count", vec![]).await.expect("count"), json!(0));
    }

    #[tokio::test]
    async fn test_listener_requires_configuration() {
        let host = BaseHost::new();
        let main = Communication::new(host.clone() as Arc<dyn Host>, "main");

        let host2 = host.open_child();
        let child = Communication::new(host2.clone() as Arc<dyn Host>, "child");
        main.register_environment("child", host2);

        child.register_service(Service::new("myApi").listener_method("listen", |_| Ok(())));

        // No listener flag in the proxy configuration.
        let proxy = main.api_proxy("child", "myApi", ProxyConfig::new());
        let err = proxy.add_listener("listen", |_| {}).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot add listener to unconfigured method myApi.listen"
        );
    }

    #[tokio::test]
    async fn test_remove_all_listeners() {
        let host = BaseHost::new();
        let main = Communication::new(host.clone() as Arc<dyn Host>, "main");

        let host2 = host.open_child();
        let child = Communication::new(host2.clone() as Arc<dyn Host>, "child");
        main.register_environment("child", host2);

        let listeners: Arc<Mutex<Vec<RemoteListener>>> = Arc::new(Mutex::new(Vec::new()));
        let l1 = Arc::clone(&listeners);
        let l2 = Arc::clone(&listeners);
        let l3 = Arc::clone(&listeners);
        child.register_service(
            Service::new("ticker")
                .listener_method("on_tick", move |listener| {
                    l1.lock().push(listener);
                    Ok(())
                })
                .remove_all_listeners_method("clear", "on_tick", move |ids| {
                    l2.lock().retain(|l| !ids.contains(&l.id()));
                    Ok(())
                })
                .method("count", move |_| Ok(json!(l3.lock().len()))),
        );

        let config = ProxyConfig::new()
            .method("on_tick", MethodOptions::listener())
            .method("clear", MethodOptions::remove_all_listeners("on_tick"));
        let proxy = main.api_proxy("child", "ticker", config);

        proxy.add_listener("on_tick", |_| {}).await.expect("subscribe");
        proxy.add_listener("on_tick", |_| {}).await.expect("subscribe");
        assert_eq!(proxy.call("count", vec![]).await.expect("count"), json!(2));
        assert_eq!(main.pending_call_count(), 2);

        proxy.remove_all_listeners("clear").await.expect("clear");
        assert_eq!(proxy.call("count", vec![]).await.expect("count"), json!(0));
        assert_eq!(main.pending_call_count(), 0);
    }

    #[tokio::test]
    async fn test_disruption_queues_until_ready_again() {
        let root = BaseHost::new();
        let a_com = Communication::new(root.clone() as Arc<dyn Host>, "aEnv");
        let b_com = Communication::new(root.clone() as Arc<dyn Host>, "bEnv");
        b_com.register_service(echo_service("echoService"));
        b_com.announce_ready();

        let proxy = a_com.api_proxy("bEnv", "echoService", ProxyConfig::new());
        assert_eq!(
            proxy.call("echo", vec![json!(1)]).await.expect("call"),
            json!(1)
        );

        // Disruption keeps records but gates new calls.
        root.post_message(Message::lifecycle(
            &env("bEnv"),
            Recipient::Broadcast,
            MessageKind::ConnectionDisrupted,
        ))
        .expect("post");

        let queued = tokio::spawn(async move { proxy.call("echo", vec![json!(2)]).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!queued.is_finished(), "call must queue while disrupted");

        b_com.announce_ready();
        let result = queued.await.expect("join").expect("call");
        assert_eq!(result, json!(2));
    }

    #[tokio::test]
    async fn test_dispose_fan_out() {
        let root = BaseHost::new();
        let a_com = Communication::new(root.clone() as Arc<dyn Host>, "aEnv");
        let b_com = Communication::new(root.clone() as Arc<dyn Host>, "bEnv");

        b_com.register_service(echo_service("myApi"));
        b_com.announce_ready();

        let disposed = Arc::new(Mutex::new(Vec::new()));
        let disposed_clone = Arc::clone(&disposed);
        b_com.subscribe_to_environment_dispose(Arc::new(move |env: &EnvironmentId| {
            disposed_clone.lock().push(env.clone());
        }));

        let proxy = a_com.api_proxy("bEnv", "myApi", ProxyConfig::new());
        assert_eq!(
            proxy.call("echo", vec![json!("x")]).await.expect("call"),
            json!("x")
        );

        a_com.clear_environment(&env("aEnv"));
        assert_eq!(*disposed.lock(), vec![env("aEnv")]);
    }

    #[tokio::test]
    async fn test_dispose_rejects_pending_calls() {
        let root = BaseHost::new();
        let a_com = Communication::new(root.clone() as Arc<dyn Host>, "aEnv");

        // "silent" is registered and reachable but nobody answers.
        a_com.register_environment("silent", root.clone() as Arc<dyn Host>);

        let proxy = a_com.api_proxy("silent", "svc", ProxyConfig::new());
        let pending = tokio::spawn(async move { proxy.call("m", vec![]).await });

        // Give the call a moment to become a pending record.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a_com.pending_call_count(), 1);

        root.post_message(Message::lifecycle(
            &env("silent"),
            Recipient::Broadcast,
            MessageKind::Dispose,
        ))
        .expect("post");

        let err = pending.await.expect("join").unwrap_err();
        assert!(matches!(err, Error::EnvironmentDisposed { .. }));
        assert_eq!(a_com.pending_call_count(), 0);
    }

    #[tokio::test]
    async fn test_ready_releases_queued_calls() {
        let root = BaseHost::new();
        let a_com = Communication::new(root.clone() as Arc<dyn Host>, "aEnv");

        let proxy = a_com.api_proxy("late", "echoService", ProxyConfig::new());
        let queued = tokio::spawn(async move { proxy.call("echo", vec![json!("hi")]).await });

        tokio::time::sleep(Duration::from_millis(50)).await;

        // "late" comes up on the same bus and announces itself.
        let late = Communication::new(root.clone() as Arc<dyn Host>, "late");
        late.register_service(echo_service("echoService"));
        late.announce_ready();

        let result = queued.await.expect("join").expect("call");
        assert_eq!(result, json!("hi"));
    }

    #[tokio::test]
    async fn test_bounded_ready_wait() {
        let root = BaseHost::new();
        let a_com = Communication::with_options(
            root as Arc<dyn Host>,
            "aEnv",
            CommunicationOptions {
                ready_timeout: Duration::from_millis(100),
                ..CommunicationOptions::default()
            },
        );

        let proxy = a_com.api_proxy("never", "svc", ProxyConfig::new());
        let err = proxy.call("m", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::EnvironmentNotReady { .. }));
    }

    #[tokio::test]
    async fn test_reregistering_attaches_no_duplicate_listener() {
        let root = BaseHost::new();
        let main = Communication::new(root.clone() as Arc<dyn Host>, "main");

        let child = root.open_child();
        main.register_environment("worker", child.clone());
        main.register_environment("worker", child.clone());

        // Root handler from construction is on the root, not the child; the
        // child carries exactly one handler for the two registrations.
        assert_eq!(child.listener_count(), 1);

        main.dispose();
        assert_eq!(child.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_disposed_instance_rejects_calls() {
        let root = BaseHost::new();
        let main = Communication::new(root, "main");
        main.register_service(echo_service("echoService"));

        let proxy = main.api_proxy("main", "echoService", ProxyConfig::new());
        main.dispose();

        let err = proxy.call("echo", vec![json!(1)]).await.unwrap_err();
        assert!(matches!(err, Error::Disposed));
    }
}
