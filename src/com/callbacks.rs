//! Outstanding-call bookkeeping.
//!
//! One [`CallbackRecord`] exists per in-flight request, from the moment a
//! `call`/`listen` message is sent until the matching `response` arrives or
//! the record is forcibly rejected (timeout, environment disposal, instance
//! disposal). Records are matched by request id, never by arrival order, so
//! out-of-order responses across concurrent calls settle correctly.
//!
//! Each record carries two independently cancellable timer tasks (slow
//! warning and hard timeout), both aborted atomically when the record
//! settles.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::identifiers::{EnvironmentId, RequestId, ServiceId};

// ============================================================================
// Types
// ============================================================================

/// Locally retained callback fed by listener emissions.
pub(crate) type ListenerSink = Arc<dyn Fn(Value) + Send + Sync>;

/// Resolution channel for a one-shot request.
type Settler = oneshot::Sender<Result<Value>>;

/// How a record settles.
pub(crate) enum CallbackKind {
    /// Ordinary call: settled exactly once, then removed.
    Call { tx: Option<Settler> },

    /// Listener registration: the first response acks the registration,
    /// every later one feeds the retained callback.
    Listener {
        /// Listener method this registration belongs to.
        method: String,
        /// Pending registration ack, if not yet confirmed.
        ack: Option<Settler>,
        /// Retained subscriber callback.
        callback: ListenerSink,
    },
}

/// One outstanding request.
pub(crate) struct CallbackRecord {
    /// Environment the request was addressed to.
    pub target: EnvironmentId,
    /// Service the request was addressed to.
    pub service: ServiceId,
    /// Invoked method (for diagnostics and error construction).
    pub method: String,
    /// Resolution state.
    pub kind: CallbackKind,
    /// Slow-warning timer task.
    pub slow_timer: Option<JoinHandle<()>>,
    /// Hard-timeout timer task.
    pub timeout_timer: Option<JoinHandle<()>>,
}

impl CallbackRecord {
    /// Aborts both timers. Idempotent.
    fn clear_timers(&mut self) {
        if let Some(timer) = self.slow_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.timeout_timer.take() {
            timer.abort();
        }
    }
}

// ============================================================================
// CallbackRegistry
// ============================================================================

/// Registry of outstanding requests, keyed by request id.
#[derive(Default)]
pub(crate) struct CallbackRegistry {
    records: Mutex<FxHashMap<RequestId, CallbackRecord>>,
}

impl CallbackRegistry {
    /// Creates an empty registry.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a one-shot call record.
    pub(crate) fn register_call(
        &self,
        request_id: RequestId,
        target: EnvironmentId,
        service: ServiceId,
        method: impl Into<String>,
        tx: Settler,
    ) {
        self.records.lock().insert(
            request_id,
            CallbackRecord {
                target,
                service,
                method: method.into(),
                kind: CallbackKind::Call { tx: Some(tx) },
                slow_timer: None,
                timeout_timer: None,
            },
        );
    }

    /// Registers a listener record awaiting its registration ack.
    pub(crate) fn register_listener(
        &self,
        request_id: RequestId,
        target: EnvironmentId,
        service: ServiceId,
        method: impl Into<String>,
        ack: Settler,
        callback: ListenerSink,
    ) {
        let method = method.into();
        self.records.lock().insert(
            request_id,
            CallbackRecord {
                target,
                service,
                method: method.clone(),
                kind: CallbackKind::Listener {
                    method,
                    ack: Some(ack),
                    callback,
                },
                slow_timer: None,
                timeout_timer: None,
            },
        );
    }

    /// Attaches timer tasks to an existing record.
    pub(crate) fn arm_timers(
        &self,
        request_id: RequestId,
        slow_timer: Option<JoinHandle<()>>,
        timeout_timer: Option<JoinHandle<()>>,
    ) {
        let mut records = self.records.lock();
        if let Some(record) = records.get_mut(&request_id) {
            record.slow_timer = slow_timer;
            record.timeout_timer = timeout_timer;
        } else {
            // Settled before the timers were armed; cancel them right away.
            if let Some(timer) = slow_timer {
                timer.abort();
            }
            if let Some(timer) = timeout_timer {
                timer.abort();
            }
        }
    }

    /// Settles a record with a remote outcome (`response` message fields).
    pub(crate) fn settle_remote(
        &self,
        request_id: RequestId,
        value: Option<Value>,
        error: Option<String>,
    ) {
        // Resolve under the lock, invoke callbacks outside it. The record is
        // removed up front and re-inserted only when it must persist (a
        // listener registration past its ack).
        let action = {
            let mut records = self.records.lock();
            let Some(mut record) = records.remove(&request_id) else {
                warn!(request_id = %request_id, "Response for unknown request");
                return;
            };

            match &mut record.kind {
                CallbackKind::Call { tx } => {
                    let result = match error {
                        Some(message) => Err(Error::call(&record.service, &record.method, message)),
                        None => Ok(value.unwrap_or(Value::Null)),
                    };
                    let tx = tx.take();
                    record.clear_timers();
                    SettleAction::Send(tx, result)
                }
                CallbackKind::Listener { ack, .. } if ack.is_some() => {
                    let tx = ack.take();
                    record.clear_timers();
                    match error {
                        Some(message) => {
                            // Registration failed; the record dies with it.
                            let err = Error::call(&record.service, &record.method, message);
                            SettleAction::Send(tx, Err(err))
                        }
                        None => {
                            records.insert(request_id, record);
                            SettleAction::Send(tx, Ok(value.unwrap_or(Value::Null)))
                        }
                    }
                }
                CallbackKind::Listener { callback, .. } => match error {
                    Some(message) => {
                        warn!(request_id = %request_id, error = %message, "Listener feed error");
                        records.insert(request_id, record);
                        return;
                    }
                    None => {
                        let callback = Arc::clone(callback);
                        records.insert(request_id, record);
                        SettleAction::Feed(callback, value.unwrap_or(Value::Null))
                    }
                },
            }
        };

        match action {
            SettleAction::Send(tx, result) => {
                if let Some(tx) = tx {
                    let _ = tx.send(result);
                }
            }
            SettleAction::Feed(callback, value) => callback(value),
        }
    }

    /// Rejects one record with `error`; no-op if already settled.
    pub(crate) fn reject(&self, request_id: RequestId, error: Error) {
        let tx = {
            let mut records = self.records.lock();
            let Some(mut record) = records.remove(&request_id) else {
                return;
            };
            record.clear_timers();
            match record.kind {
                CallbackKind::Call { tx } => tx,
                CallbackKind::Listener { ack, .. } => ack,
            }
        };

        if let Some(tx) = tx {
            let _ = tx.send(Err(error));
        }
    }

    /// Removes a record without settling it (listener teardown).
    pub(crate) fn remove(&self, request_id: RequestId) {
        if let Some(mut record) = self.records.lock().remove(&request_id) {
            record.clear_timers();
        }
    }

    /// Removes every listener record for `(target, service, method)`.
    pub(crate) fn remove_listeners_matching(
        &self,
        target: &EnvironmentId,
        service: &ServiceId,
        method: &str,
    ) {
        let mut records = self.records.lock();
        records.retain(|_, record| {
            let matches = record.target == *target
                && record.service == *service
                && matches!(&record.kind, CallbackKind::Listener { method: m, .. } if m == method);
            if matches {
                record.clear_timers();
            }
            !matches
        });
    }

    /// Rejects every record addressed to `target`.
    ///
    /// Listener records past their ack are silently dropped: their remote
    /// registration died with the environment.
    pub(crate) fn reject_for_target(
        &self,
        target: &EnvironmentId,
        mut make_error: impl FnMut() -> Error,
    ) {
        let settlers = self.drain_matching(|record| record.target == *target);
        let count = settlers.len();
        for tx in settlers {
            let _ = tx.send(Err(make_error()));
        }
        if count > 0 {
            debug!(target = %target, count, "Rejected pending requests for disposed environment");
        }
    }

    /// Rejects every record (instance disposal).
    pub(crate) fn reject_all(&self, mut make_error: impl FnMut() -> Error) {
        let settlers = self.drain_matching(|_| true);
        for tx in settlers {
            let _ = tx.send(Err(make_error()));
        }
    }

    /// Returns the number of outstanding records.
    pub(crate) fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Drains records matching `pred`, returning their pending settlers.
    fn drain_matching(&self, pred: impl Fn(&CallbackRecord) -> bool) -> Vec<Settler> {
        let mut settlers = Vec::new();
        let mut records = self.records.lock();
        records.retain(|_, record| {
            if !pred(record) {
                return true;
            }
            record.clear_timers();
            let tx = match &mut record.kind {
                CallbackKind::Call { tx } => tx.take(),
                CallbackKind::Listener { ack, .. } => ack.take(),
            };
            if let Some(tx) = tx {
                settlers.push(tx);
            }
            false
        });
        settlers
    }
}

/// Deferred settle work performed outside the registry lock.
enum SettleAction {
    Send(Option<Settler>, Result<Value>),
    Feed(ListenerSink, Value),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn env(id: &str) -> EnvironmentId {
        EnvironmentId::new(id)
    }

    fn svc(id: &str) -> ServiceId {
        ServiceId::new(id)
    }

    #[tokio::test]
    async fn test_call_settles_once() {
        let registry = CallbackRegistry::new();
        let id = RequestId::generate();
        let (tx, rx) = oneshot::channel();

        registry.register_call(id, env("worker"), svc("s"), "m", tx);
        registry.settle_remote(id, Some(json!(42)), None);

        let result = rx.await.expect("settled").expect("ok");
        assert_eq!(result, json!(42));
        assert_eq!(registry.len(), 0);

        // A late duplicate response is ignored.
        registry.settle_remote(id, Some(json!(43)), None);
    }

    #[tokio::test]
    async fn test_remote_error_becomes_call_error() {
        let registry = CallbackRegistry::new();
        let id = RequestId::generate();
        let (tx, rx) = oneshot::channel();

        registry.register_call(id, env("worker"), svc("echoService"), "echo", tx);
        registry.settle_remote(id, None, Some("boom".to_string()));

        let err = rx.await.expect("settled").unwrap_err();
        assert_eq!(err.to_string(), "call to echoService.echo failed: boom");
    }

    #[tokio::test]
    async fn test_listener_ack_then_feed() {
        let registry = CallbackRegistry::new();
        let id = RequestId::generate();
        let (ack_tx, ack_rx) = oneshot::channel();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = Arc::clone(&seen);
        registry.register_listener(
            id,
            env("worker"),
            svc("s"),
            "on_tick",
            ack_tx,
            Arc::new(move |value| seen_clone.lock().push(value)),
        );

        registry.settle_remote(id, Some(Value::Null), None);
        ack_rx.await.expect("acked").expect("ok");

        registry.settle_remote(id, Some(json!(1)), None);
        registry.settle_remote(id, Some(json!(2)), None);

        assert_eq!(*seen.lock(), vec![json!(1), json!(2)]);
        // Listener records persist after the ack.
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_reject_for_target_spares_others() {
        let registry = CallbackRegistry::new();
        let doomed = RequestId::generate();
        let spared = RequestId::generate();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();

        registry.register_call(doomed, env("worker"), svc("s"), "m", tx1);
        registry.register_call(spared, env("other"), svc("s"), "m", tx2);

        let target = env("worker");
        registry.reject_for_target(&target, || Error::environment_disposed(&target));

        let err = rx1.await.expect("settled").unwrap_err();
        assert!(err.is_disposal());
        assert!(rx2.try_recv().is_err());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_reject_with_timeout_error() {
        let registry = CallbackRegistry::new();
        let id = RequestId::generate();
        let (tx, rx) = oneshot::channel();

        registry.register_call(id, env("worker"), svc("s"), "m", tx);
        registry.reject(id, Error::call_timeout(id, 50));

        let err = rx.await.expect("settled").unwrap_err();
        assert!(err.is_timeout());
        assert!(!err.is_disposal());
    }
}
