//! Reconnection-tolerant WebSocket server host.
//!
//! Multiplexes many physical connections behind one logical [`Host`]. Each
//! connecting peer presents a stable client id (the `clientId` query
//! parameter of the upgrade request); the session it identifies survives
//! socket drops for a configurable grace period, so a brief network
//! interruption does not destroy in-flight RPC state.
//!
//! # Session State Machine
//!
//! ```text
//!            connect                disconnect
//! (none) ──────────────► connected ──────────► in grace
//!                           ▲   ▲                │   │
//!                reconnect  │   │  reconnect     │   │ grace timer
//!                + restored │   └────────────────┘   │ fires
//!                           │                        ▼
//!                           └──────────────────── disposed
//!                                 + lost-state
//! ```
//!
//! - reconnect within grace: socket replaced, timer cancelled, `ready`
//!   re-emitted for every env id owned by the session, and
//!   `server-connection-restored` sent to the new socket.
//! - grace expiry: `dispose` emitted for every owned env id — the only
//!   point at which peer-side pending calls for that client are
//!   permanently rejected.
//! - reconnect after expiry: `server-lost-client-state` sent to the new
//!   socket; the session restarts empty.
//!
//! # Namespacing
//!
//! Inbound `from`/`origin` are rewritten to `clientId/envId` before they
//! reach the shared handler set, so two physical clients can never collide
//! under the same bare env id. Outbound `to` addresses of that form select
//! the owning session's socket and are rewritten back to the bare id
//! before transmission.

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response as HandshakeResponse,
};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::hosts::{Host, ListenerSet, ListenerToken, MessageListener};
use crate::identifiers::{ClientId, EnvironmentId};
use crate::protocol::{Message, MessageKind, Recipient};

// ============================================================================
// Constants
// ============================================================================

/// Default bind address (localhost).
const DEFAULT_BIND_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Default grace period before a disconnected client's state is discarded.
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(120);

// ============================================================================
// WsServerOptions
// ============================================================================

/// Policy knobs for the server host.
#[derive(Debug, Clone)]
pub struct WsServerOptions {
    /// Window during which a disconnected client's state is preserved,
    /// pending reconnection.
    pub grace_period: Duration,
}

impl Default for WsServerOptions {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

// ============================================================================
// Types
// ============================================================================

/// Internal commands for a socket's writer half.
enum SocketCommand {
    /// Send one serialized frame.
    Send(String),
    /// Close the socket.
    Close,
}

/// Writer handle for one physical connection.
///
/// The `id` token lets disconnect handling tell whether a closing socket is
/// still the session's current one (rapid-reconnect race).
#[derive(Clone)]
struct SocketHandle {
    id: u64,
    tx: mpsc::UnboundedSender<SocketCommand>,
}

impl SocketHandle {
    fn send(&self, text: String) {
        let _ = self.tx.send(SocketCommand::Send(text));
    }

    fn close(&self) {
        let _ = self.tx.send(SocketCommand::Close);
    }
}

/// Per-client logical session.
struct ClientSession {
    /// Current socket; `None` while in the grace window.
    socket: Option<SocketHandle>,
    /// Bare env ids owned by this client.
    env_ids: FxHashSet<String>,
    /// Pending grace timer, if disconnected.
    dispose_timer: Option<JoinHandle<()>>,
    /// Set once the grace timer fired; terminal until the client returns.
    disposed: bool,
}

type SessionMap = FxHashMap<ClientId, ClientSession>;

// ============================================================================
// WsServerHost
// ============================================================================

/// Multi-client WebSocket server host with reconnection tolerance.
pub struct WsServerHost {
    name: String,
    port: u16,
    options: WsServerOptions,
    listeners: Arc<ListenerSet>,
    sessions: Arc<Mutex<SessionMap>>,
    shutdown: AtomicBool,
    next_socket_id: AtomicU64,
}

// ============================================================================
// WsServerHost - Constructor
// ============================================================================

impl WsServerHost {
    /// Binds to `localhost:port` (0 for random) with default options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn bind(port: u16) -> Result<Arc<Self>> {
        Self::with_options(DEFAULT_BIND_IP, port, WsServerOptions::default()).await
    }

    /// Binds with explicit address and options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn with_options(
        ip: IpAddr,
        port: u16,
        options: WsServerOptions,
    ) -> Result<Arc<Self>> {
        let addr = SocketAddr::new(ip, port);
        let listener = TcpListener::bind(addr).await?;
        let actual_port = listener.local_addr()?.port();

        let host = Arc::new(Self {
            name: "ws-server-host".to_string(),
            port: actual_port,
            options,
            listeners: Arc::new(ListenerSet::new()),
            sessions: Arc::new(Mutex::new(SessionMap::default())),
            shutdown: AtomicBool::new(false),
            next_socket_id: AtomicU64::new(1),
        });

        let host_clone = Arc::clone(&host);
        tokio::spawn(async move {
            host_clone.accept_loop(listener).await;
        });

        info!(port = actual_port, "WsServerHost started");
        Ok(host)
    }
}

// ============================================================================
// WsServerHost - Public API
// ============================================================================

impl WsServerHost {
    /// Returns the bound port.
    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the WebSocket URL of this server.
    #[inline]
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }

    /// Returns the number of live sessions (connected or in grace).
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.lock().values().filter(|s| !s.disposed).count()
    }

    /// Disposes the host: closes every socket, cancels every grace timer,
    /// and drops all listeners.
    pub fn dispose(&self) {
        self.shutdown.store(true, Ordering::SeqCst);

        let sessions: Vec<ClientSession> = {
            let mut map = self.sessions.lock();
            map.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            if let Some(timer) = session.dispose_timer {
                timer.abort();
            }
            if let Some(socket) = session.socket {
                socket.close();
            }
        }

        self.listeners.clear();
        info!("WsServerHost disposed");
    }
}

// ============================================================================
// WsServerHost - Accept Loop
// ============================================================================

impl WsServerHost {
    /// Background task accepting new connections.
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        debug!("Accept loop started");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            // Accept with timeout to allow checking the shutdown flag.
            match timeout(Duration::from_millis(100), listener.accept()).await {
                Ok(Ok((stream, addr))) => {
                    let host = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = host.handle_connection(stream, addr).await {
                            warn!(error = %e, ?addr, "Connection handling failed");
                        }
                    });
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Accept failed");
                }
                Err(_) => continue,
            }
        }

        debug!("Accept loop terminated");
    }

    /// Handles one physical connection for its whole lifetime.
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<()> {
        // The stable client id rides on the upgrade request's query string.
        let captured_id: Arc<Mutex<Option<ClientId>>> = Arc::new(Mutex::new(None));
        let capture = Arc::clone(&captured_id);
        let callback = move |request: &Request,
                             response: HandshakeResponse|
              -> std::result::Result<HandshakeResponse, ErrorResponse> {
            *capture.lock() = client_id_from_query(request.uri().query());
            Ok(response)
        };

        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .map_err(|e| Error::connection(format!("WebSocket upgrade failed: {e}")))?;

        let client_id = {
            let captured = captured_id.lock().take();
            // A peer without a stable id gets a fresh one per connection and
            // therefore no reconnection semantics.
            captured.unwrap_or_else(ClientId::generate)
        };

        let socket_id = self.next_socket_id.fetch_add(1, Ordering::Relaxed);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let handle = SocketHandle {
            id: socket_id,
            tx: command_tx,
        };

        info!(client_id = %client_id, socket_id, ?addr, "Client connected");
        self.attach_socket(&client_id, handle);

        self.run_socket_loop(ws_stream, command_rx, &client_id).await;

        self.detach_socket(&client_id, socket_id);
        Ok(())
    }

    /// Socket loop: pumps inbound frames and outbound commands until the
    /// connection drops.
    async fn run_socket_loop(
        &self,
        ws_stream: WebSocketStream<TcpStream>,
        mut command_rx: mpsc::UnboundedReceiver<SocketCommand>,
        client_id: &ClientId,
    ) {
        let (mut ws_write, mut ws_read) = ws_stream.split();

        loop {
            tokio::select! {
                frame = ws_read.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            self.handle_inbound(client_id, &text);
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            debug!(client_id = %client_id, "Socket closed");
                            break;
                        }
                        Some(Err(e)) => {
                            warn!(client_id = %client_id, error = %e, "Socket error");
                            break;
                        }
                        // Ignore Binary, Ping, Pong
                        _ => {}
                    }
                }

                command = command_rx.recv() => {
                    match command {
                        Some(SocketCommand::Send(text)) => {
                            if let Err(e) = ws_write.send(WsMessage::Text(text.into())).await {
                                warn!(client_id = %client_id, error = %e, "Socket send failed");
                                break;
                            }
                        }
                        Some(SocketCommand::Close) | None => {
                            let _ = ws_write.close().await;
                            break;
                        }
                    }
                }
            }
        }
    }
}

// ============================================================================
// WsServerHost - Session State Machine
// ============================================================================

impl WsServerHost {
    /// Installs a fresh socket for `client_id`, resolving reconnections.
    fn attach_socket(self: &Arc<Self>, client_id: &ClientId, handle: SocketHandle) {
        enum Outcome {
            Fresh,
            Restored { env_ids: Vec<String> },
            LostState,
        }

        let outcome = {
            let mut sessions = self.sessions.lock();
            if !sessions.contains_key(client_id) {
                sessions.insert(
                    client_id.clone(),
                    ClientSession {
                        socket: Some(handle.clone()),
                        env_ids: FxHashSet::default(),
                        dispose_timer: None,
                        disposed: false,
                    },
                );
                Outcome::Fresh
            } else {
                let session = sessions.get_mut(client_id).expect("session present");
                if session.disposed {
                    // State was discarded while the client was away.
                    session.disposed = false;
                    session.env_ids.clear();
                    session.dispose_timer = None;
                    session.socket = Some(handle.clone());
                    Outcome::LostState
                } else {
                    // Reconnection: replace the socket, keep everything else.
                    if let Some(previous) = session.socket.replace(handle.clone()) {
                        previous.close();
                    }
                    if let Some(timer) = session.dispose_timer.take() {
                        timer.abort();
                    }
                    Outcome::Restored {
                        env_ids: session.env_ids.iter().cloned().collect(),
                    }
                }
            }
        };

        // Emissions happen outside the session lock: handlers may re-enter.
        match outcome {
            Outcome::Fresh => {
                debug!(client_id = %client_id, "Session created");
            }
            Outcome::Restored { env_ids } => {
                debug!(client_id = %client_id, envs = env_ids.len(), "Session restored");
                self.send_to_handle(&handle, MessageKind::ServerConnectionRestored);
                for env in env_ids {
                    self.emit_lifecycle(client_id, &env, MessageKind::Ready);
                }
            }
            Outcome::LostState => {
                debug!(client_id = %client_id, "Session state was lost");
                self.send_to_handle(&handle, MessageKind::ServerLostClientState);
            }
        }
    }

    /// Handles the end of a physical connection.
    fn detach_socket(self: &Arc<Self>, client_id: &ClientId, socket_id: u64) {
        let env_ids = {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.get_mut(client_id) else {
                return;
            };

            // A disconnect racing behind a newer attach must be ignored.
            if session.socket.as_ref().map(|s| s.id) != Some(socket_id) {
                trace!(client_id = %client_id, socket_id, "Stale disconnect ignored");
                return;
            }

            session.socket = None;

            let host = Arc::clone(self);
            let timer_client = client_id.clone();
            session.dispose_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(host.options.grace_period).await;
                host.expire_session(&timer_client);
            }));

            session.env_ids.iter().cloned().collect::<Vec<_>>()
        };

        debug!(client_id = %client_id, envs = env_ids.len(), "Client disconnected, grace started");
        for env in env_ids {
            self.emit_lifecycle(client_id, &env, MessageKind::ConnectionDisrupted);
        }
    }

    /// Grace timer expiry: the client did not return in time.
    fn expire_session(self: &Arc<Self>, client_id: &ClientId) {
        let env_ids = {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.get_mut(client_id) else {
                return;
            };
            if session.socket.is_some() || session.disposed {
                return;
            }

            session.disposed = true;
            session.dispose_timer = None;
            session.env_ids.drain().collect::<Vec<_>>()
        };

        info!(client_id = %client_id, envs = env_ids.len(), "Grace period expired, disposing");
        for env in env_ids {
            self.emit_lifecycle(client_id, &env, MessageKind::Dispose);
        }
    }

    /// Processes one inbound frame from a client socket.
    fn handle_inbound(&self, client_id: &ClientId, text: &str) {
        let mut message = match serde_json::from_str::<Message>(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "Failed to parse inbound frame");
                return;
            }
        };

        // Record ownership and namespace the sender ids so two clients can
        // never collide under the same bare env id.
        {
            let mut sessions = self.sessions.lock();
            if let Some(session) = sessions.get_mut(client_id) {
                session.env_ids.insert(message.from.as_str().to_string());
                session.env_ids.insert(message.origin.as_str().to_string());
            }
        }

        message.from = EnvironmentId::namespaced(client_id, message.from.as_str());
        message.origin = EnvironmentId::namespaced(client_id, message.origin.as_str());

        trace!(client_id = %client_id, kind = message.kind.name(), "Inbound message");
        self.listeners.emit(&message);
    }

    /// Emits a lifecycle message for a client-owned env id into the shared
    /// handler set.
    fn emit_lifecycle(&self, client_id: &ClientId, env: &str, kind: MessageKind) {
        let namespaced = EnvironmentId::namespaced(client_id, env);
        let message = Message::lifecycle(&namespaced, Recipient::Broadcast, kind);
        self.listeners.emit(&message);
    }

    /// Sends a server-state signal to one socket.
    fn send_to_handle(&self, handle: &SocketHandle, kind: MessageKind) {
        let origin = EnvironmentId::new(&self.name);
        let message = Message::lifecycle(&origin, Recipient::Broadcast, kind);
        match serde_json::to_string(&message) {
            Ok(text) => handle.send(text),
            Err(e) => warn!(error = %e, "Failed to serialize server signal"),
        }
    }
}

// ============================================================================
// WsServerHost - Host Impl
// ============================================================================

impl Host for WsServerHost {
    fn id(&self) -> &str {
        &self.name
    }

    fn add_listener(&self, listener: MessageListener) -> ListenerToken {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, token: ListenerToken) {
        self.listeners.remove(token);
    }

    fn post_message(&self, mut message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(Error::host_closed(&self.name));
        }

        // A namespaced address selects the owning session's socket; the
        // prefix is stripped before transmission.
        let namespaced = match &message.to {
            Recipient::Env(id) => id
                .split_namespace()
                .map(|(client, bare)| (ClientId::new(client), bare.to_string())),
            Recipient::Broadcast => None,
        };

        if let Some((client, bare)) = namespaced {
            let socket = {
                let sessions = self.sessions.lock();
                sessions.get(&client).and_then(|s| s.socket.clone())
            };

            match socket {
                Some(socket) => {
                    message.to = Recipient::env(bare);
                    socket.send(serde_json::to_string(&message)?);
                    return Ok(());
                }
                None => {
                    // In-grace or unknown: the message cannot reach the
                    // client right now. Dropped; pending calls are settled
                    // by dispose if the grace period expires.
                    warn!(client = %client, env = %bare, "No live socket for addressed client, dropping");
                    return Ok(());
                }
            }
        }

        // Broadcast, or a bare address no session owns: every socket.
        let text = serde_json::to_string(&message)?;
        let sockets: Vec<SocketHandle> = {
            let sessions = self.sessions.lock();
            sessions.values().filter_map(|s| s.socket.clone()).collect()
        };
        for socket in sockets {
            socket.send(text.clone());
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Extracts the stable client id from an upgrade request's query string.
fn client_id_from_query(query: Option<&str>) -> Option<ClientId> {
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "clientId")
        .map(|(_, value)| ClientId::new(value.into_owned()))
}

// ============================================================================
// Tests
// ============================================================================
