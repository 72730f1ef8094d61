//! envbus - transparent RPC between execution environments.
//!
//! This library lets independently-hosted execution contexts (a browser
//! tab, a worker, a forked process, a remote server) expose and consume
//! services from one another as if they were local objects, over arbitrary
//! transports.
//!
//! # Architecture
//!
//! Three layers:
//!
//! - **Protocol**: one JSON envelope shared by every transport, with an
//!   immutable `origin`, a per-hop `from`, and a forwarding chain for loop
//!   rejection.
//! - **Hosts**: transport adapters under one listen/send contract — an
//!   in-memory bus, a WebSocket client, a reconnection-tolerant multi-client
//!   WebSocket server, and a process-channel host. Each manages its own
//!   physical connection; the routing layer never knows which transport it
//!   is using.
//! - **Communication**: the per-environment coordinator that registers
//!   peers, proxies remote services, forwards messages across hops, and
//!   manages call/response/listener lifecycles.
//!
//! # Quick Start
//!
//! ```
//! use envbus::{BaseHost, Communication, ProxyConfig, Service};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> envbus::Result<()> {
//! let root = BaseHost::new();
//! let main = Communication::new(root.clone(), "main");
//!
//! // A second environment on a nested endpoint of the same bus.
//! let child_host = root.open_child();
//! let worker = Communication::new(child_host.clone(), "worker");
//! main.register_environment("worker", child_host);
//!
//! worker.register_service(Service::new("echoService").method("echo", |args| {
//!     Ok(args.into_iter().next().unwrap_or(json!(null)))
//! }));
//!
//! let proxy = main.api_proxy("worker", "echoService", ProxyConfig::new());
//! let reply = proxy.call("echo", vec![json!("Yoo!")]).await?;
//! assert_eq!(reply, json!("Yoo!"));
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`com`] | Communication engine: registries, proxies, routing |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`hosts`] | Transport hosts: in-memory, WebSocket, process channel |
//! | [`protocol`] | Wire envelope and environment descriptors |

// ============================================================================
// Modules
// ============================================================================

/// Communication engine: registries, proxies, routing, lifecycle.
pub mod com;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers for environments, services, and messages.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// Transport hosts.
///
/// Concrete [`Host`] implementations for in-memory buses, WebSocket
/// clients and servers, and process channels.
pub mod hosts;

/// Wire protocol message types.
pub mod protocol;

// ============================================================================
// Re-exports
// ============================================================================

// Communication types
pub use com::{
    ApiProxy, Communication, CommunicationOptions, DisposeHandler, EnvironmentRecord,
    ListenerHandle, MethodOptions, ProxyConfig, RemoteListener, Service,
};

// Error types
pub use error::{Error, Result};

// Host types
pub use hosts::{
    BaseHost, Host, HostEvent, IpcHost, ListenerToken, MessageListener, WsClientHost, WsServerHost,
    WsServerOptions,
};

// Identifier types
pub use identifiers::{ClientId, EnvironmentId, ListenerId, RequestId, ServiceId};

// Protocol types
pub use protocol::{EndpointMode, Environment, EnvironmentKind, Message, MessageKind, Recipient};
