//! Wire envelope and message kinds.
//!
//! Every transport carries the same JSON-serializable envelope:
//!
//! ```json
//! {
//!   "type": "call",
//!   "from": "main",
//!   "origin": "main",
//!   "to": "worker",
//!   "forwardingChain": [],
//!   "requestId": "uuid",
//!   "service": "echoService",
//!   "method": "echo",
//!   "args": ["Yoo!"],
//!   "expectsResponse": true
//! }
//! ```
//!
//! # Envelope Invariants
//!
//! - `origin` is set once at creation and never mutated afterwards; replies
//!   route back to `origin`, not `from`.
//! - `from` is the only field a forwarding hop may overwrite.
//! - `forwardingChain` records every hop already traversed and is the basis
//!   for loop rejection.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::identifiers::{EnvironmentId, RequestId, ServiceId};

// ============================================================================
// Recipient
// ============================================================================

/// Destination of a message: a single environment, or every locally known
/// peer (wire form `"*"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    /// A specific environment id.
    Env(EnvironmentId),
    /// All locally known peers.
    Broadcast,
}

/// Wire marker for [`Recipient::Broadcast`].
const BROADCAST_MARKER: &str = "*";

impl Recipient {
    /// Creates a recipient for a single environment.
    #[inline]
    pub fn env(id: impl Into<EnvironmentId>) -> Self {
        Self::Env(id.into())
    }

    /// Returns `true` for the broadcast marker.
    #[inline]
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Self::Broadcast)
    }

    /// Returns the target environment id, if any.
    #[inline]
    #[must_use]
    pub fn env_id(&self) -> Option<&EnvironmentId> {
        match self {
            Self::Env(id) => Some(id),
            Self::Broadcast => None,
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Env(id) => id.fmt(f),
            Self::Broadcast => f.write_str(BROADCAST_MARKER),
        }
    }
}

impl Serialize for Recipient {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Env(id) => id.serialize(serializer),
            Self::Broadcast => serializer.serialize_str(BROADCAST_MARKER),
        }
    }
}

impl<'de> Deserialize<'de> for Recipient {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RecipientVisitor;

        impl Visitor<'_> for RecipientVisitor {
            type Value = Recipient;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an environment id or \"*\"")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Recipient, E> {
                if v == BROADCAST_MARKER {
                    Ok(Recipient::Broadcast)
                } else {
                    Ok(Recipient::Env(EnvironmentId::new(v)))
                }
            }
        }

        deserializer.deserialize_str(RecipientVisitor)
    }
}

// ============================================================================
// MessageKind
// ============================================================================

/// Kind-specific payload of a message, tagged on the wire by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessageKind {
    /// Invoke a remote service method.
    #[serde(rename = "call")]
    Call {
        /// Correlation id for the eventual response.
        #[serde(rename = "requestId")]
        request_id: RequestId,
        /// Target service.
        service: ServiceId,
        /// Method name.
        method: String,
        /// Serialized arguments.
        args: Vec<Value>,
        /// `false` for emit-only calls: no response is produced.
        #[serde(rename = "expectsResponse")]
        expects_response: bool,
    },

    /// Settle (or feed, for listener registrations) an earlier request.
    #[serde(rename = "response")]
    Response {
        /// Matches the originating `call`/`listen`/`unlisten` id.
        #[serde(rename = "requestId")]
        request_id: RequestId,
        /// Result value on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        /// Error message on failure.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Register a remote listener; confirmed by an ack response, then fed
    /// by zero-to-many further responses under the same request id.
    #[serde(rename = "listen")]
    Listen {
        /// Identity of this registration; emissions reuse it.
        #[serde(rename = "requestId")]
        request_id: RequestId,
        /// Target service.
        service: ServiceId,
        /// Listener method name.
        method: String,
    },

    /// Remove one listener registration (or all for a method).
    #[serde(rename = "unlisten")]
    Unlisten {
        /// Correlation id for the removal ack.
        #[serde(rename = "requestId")]
        request_id: RequestId,
        /// Target service.
        service: ServiceId,
        /// The remove-tagged method to invoke.
        method: String,
        /// Original listen id; `None` removes every registration held by
        /// the requesting environment for the tagged method.
        #[serde(rename = "listenId", default, skip_serializing_if = "Option::is_none")]
        listen_id: Option<RequestId>,
    },

    /// The `origin` environment is gone; reject its pending work.
    #[serde(rename = "dispose")]
    Dispose,

    /// The `origin` environment is reachable and accepting calls.
    #[serde(rename = "ready")]
    Ready,

    /// The `origin` environment's connection dropped but may resume; do not
    /// discard state yet.
    #[serde(rename = "connection_disrupted")]
    ConnectionDisrupted,

    /// Server discarded this client's state during an outage; the client
    /// must re-initialize.
    #[serde(rename = "server-lost-client-state")]
    ServerLostClientState,

    /// Server preserved this client's state across a reconnect.
    #[serde(rename = "server-connection-restored")]
    ServerConnectionRestored,
}

impl MessageKind {
    /// Returns the wire name of this kind.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Call { .. } => "call",
            Self::Response { .. } => "response",
            Self::Listen { .. } => "listen",
            Self::Unlisten { .. } => "unlisten",
            Self::Dispose => "dispose",
            Self::Ready => "ready",
            Self::ConnectionDisrupted => "connection_disrupted",
            Self::ServerLostClientState => "server-lost-client-state",
            Self::ServerConnectionRestored => "server-connection-restored",
        }
    }
}

// ============================================================================
// Message
// ============================================================================

/// The wire envelope shared by all transports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Kind and kind-specific payload (flattened on the wire).
    #[serde(flatten)]
    pub kind: MessageKind,

    /// Id of the hop that most recently retransmitted this message.
    pub from: EnvironmentId,

    /// Id of the original author. Immutable after creation.
    pub origin: EnvironmentId,

    /// Destination environment, or the broadcast marker.
    pub to: Recipient,

    /// Environment ids already traversed, appended at each forward.
    #[serde(rename = "forwardingChain", default)]
    pub forwarding_chain: Vec<EnvironmentId>,
}

impl Message {
    /// Creates a message authored by `origin`, with an empty forwarding
    /// chain and `from` equal to `origin`.
    #[must_use]
    pub fn new(origin: &EnvironmentId, to: Recipient, kind: MessageKind) -> Self {
        Self {
            kind,
            from: origin.clone(),
            origin: origin.clone(),
            to,
            forwarding_chain: Vec::new(),
        }
    }

    /// Creates a `call` message.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn call(
        origin: &EnvironmentId,
        to: Recipient,
        request_id: RequestId,
        service: ServiceId,
        method: impl Into<String>,
        args: Vec<Value>,
        expects_response: bool,
    ) -> Self {
        Self::new(
            origin,
            to,
            MessageKind::Call {
                request_id,
                service,
                method: method.into(),
                args,
                expects_response,
            },
        )
    }

    /// Creates a `response` message from an invocation outcome.
    #[must_use]
    pub fn response(
        origin: &EnvironmentId,
        to: Recipient,
        request_id: RequestId,
        result: Result<Value, String>,
    ) -> Self {
        let (value, error) = match result {
            Ok(value) => (Some(value), None),
            Err(message) => (None, Some(message)),
        };
        Self::new(
            origin,
            to,
            MessageKind::Response {
                request_id,
                value,
                error,
            },
        )
    }

    /// Creates a `listen` message.
    #[must_use]
    pub fn listen(
        origin: &EnvironmentId,
        to: Recipient,
        request_id: RequestId,
        service: ServiceId,
        method: impl Into<String>,
    ) -> Self {
        Self::new(
            origin,
            to,
            MessageKind::Listen {
                request_id,
                service,
                method: method.into(),
            },
        )
    }

    /// Creates an `unlisten` message.
    #[must_use]
    pub fn unlisten(
        origin: &EnvironmentId,
        to: Recipient,
        request_id: RequestId,
        service: ServiceId,
        method: impl Into<String>,
        listen_id: Option<RequestId>,
    ) -> Self {
        Self::new(
            origin,
            to,
            MessageKind::Unlisten {
                request_id,
                service,
                method: method.into(),
                listen_id,
            },
        )
    }

    /// Creates a lifecycle message with no payload (`dispose`, `ready`,
    /// `connection_disrupted`, ...).
    #[must_use]
    pub fn lifecycle(origin: &EnvironmentId, to: Recipient, kind: MessageKind) -> Self {
        Self::new(origin, to, kind)
    }

    /// Returns the correlation id carried by this message, if any.
    #[must_use]
    pub fn request_id(&self) -> Option<RequestId> {
        match &self.kind {
            MessageKind::Call { request_id, .. }
            | MessageKind::Response { request_id, .. }
            | MessageKind::Listen { request_id, .. }
            | MessageKind::Unlisten { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    /// Marks one forwarding hop: appends `hop` to the chain and overwrites
    /// `from`. `origin` and `to` are left untouched.
    pub fn prepare_forward(&mut self, hop: &EnvironmentId) {
        self.forwarding_chain.push(hop.clone());
        self.from = hop.clone();
    }

    /// Returns `true` if `env` already appears in the forwarding chain.
    #[inline]
    #[must_use]
    pub fn has_traversed(&self, env: &EnvironmentId) -> bool {
        self.forwarding_chain.iter().any(|hop| hop == env)
    }
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

    #[test]
    fn test_call_wire_format() {
        let msg = Message::call(
            &env("main"),
            Recipient::env("worker"),
            RequestId::generate(),
            ServiceId::new("echoService"),
            "echo",
            vec![json!("Yoo!")],
            true,
        );

        let json = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(json["type"], "call");
        assert_eq!(json["from"], "main");
        assert_eq!(json["origin"], "main");
        assert_eq!(json["to"], "worker");
        assert_eq!(json["service"], "echoService");
        assert_eq!(json["expectsResponse"], true);
        assert!(json["forwardingChain"].as_array().expect("array").is_empty());
    }

    #[test]
    fn test_broadcast_marker() {
        let msg = Message::lifecycle(&env("a"), Recipient::Broadcast, MessageKind::Dispose);
        let json = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(json["to"], "*");

        let back: Message = serde_json::from_value(json).expect("deserialize");
        assert!(back.to.is_broadcast());
    }

    #[test]
    fn test_server_kind_wire_names() {
        let lost = Message::lifecycle(&env("s"), Recipient::Broadcast, MessageKind::ServerLostClientState);
        let restored =
            Message::lifecycle(&env("s"), Recipient::Broadcast, MessageKind::ServerConnectionRestored);
        let disrupted =
            Message::lifecycle(&env("s"), Recipient::Broadcast, MessageKind::ConnectionDisrupted);

        assert_eq!(
            serde_json::to_value(&lost).expect("serialize")["type"],
            "server-lost-client-state"
        );
        assert_eq!(
            serde_json::to_value(&restored).expect("serialize")["type"],
            "server-connection-restored"
        );
        assert_eq!(
            serde_json::to_value(&disrupted).expect("serialize")["type"],
            "connection_disrupted"
        );
    }

    #[test]
    fn test_forward_mutates_from_only() {
        let mut msg = Message::lifecycle(&env("a"), Recipient::env("d"), MessageKind::Ready);
        msg.prepare_forward(&env("b"));
        msg.prepare_forward(&env("c"));

        assert_eq!(msg.origin, env("a"));
        assert_eq!(msg.from, env("c"));
        assert_eq!(msg.to, Recipient::env("d"));
        assert_eq!(msg.forwarding_chain, vec![env("b"), env("c")]);
        assert!(msg.has_traversed(&env("b")));
        assert!(!msg.has_traversed(&env("d")));
    }

    #[test]
    fn test_response_carries_error() {
        let msg = Message::response(
            &env("worker"),
            Recipient::env("main"),
            RequestId::generate(),
            Err("fail".to_string()),
        );

        let json = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(json["error"], "fail");
        assert!(json.get("value").is_none());
    }

    #[test]
    fn test_roundtrip_preserves_chain() {
        let mut msg = Message::call(
            &env("a"),
            Recipient::env("z"),
            RequestId::generate(),
            ServiceId::new("svc"),
            "m",
            vec![json!(1)],
            true,
        );
        msg.prepare_forward(&env("hop1"));

        let text = serde_json::to_string(&msg).expect("serialize");
        let back: Message = serde_json::from_str(&text).expect("deserialize");

        assert_eq!(back.forwarding_chain, vec![env("hop1")]);
        assert_eq!(back.from, env("hop1"));
        assert_eq!(back.origin, env("a"));
        assert_eq!(back.request_id(), msg.request_id());
    }
}
