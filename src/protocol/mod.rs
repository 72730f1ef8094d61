//! Wire protocol shared by all transports.
//!
//! Every host carries the same structured envelope; any transport that can
//! move this JSON shape qualifies as a backend.
//!
//! # Message Kinds
//!
//! | Kind | Direction | Purpose |
//! |------|-----------|---------|
//! | `call` | caller → callee | Invoke a service method |
//! | `response` | callee → caller | Settle a call, or feed a listener |
//! | `listen` / `unlisten` | caller → callee | Listener lifecycle |
//! | `dispose` | any → all | Environment permanently gone |
//! | `ready` | any → all | Environment reachable |
//! | `connection_disrupted` | server → all | Peer may resume shortly |
//! | `server-lost-client-state` | server → client | Re-initialize required |
//! | `server-connection-restored` | server → client | State preserved |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `message` | Envelope, kinds, recipient marker |
//! | `environment` | Environment descriptors |

// ============================================================================
// Submodules
// ============================================================================

/// Wire envelope and message kinds.
pub mod message;

/// Environment descriptors.
pub mod environment;

// ============================================================================
// Re-exports
// ============================================================================

pub use environment::{EndpointMode, Environment, EnvironmentKind};
pub use message::{Message, MessageKind, Recipient};
