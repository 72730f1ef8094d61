//! WebSocket client host.
//!
//! Connects to a [`super::WsServerHost`] and carries envelopes as JSON text
//! frames. The host generates a **stable client id** once and presents it
//! as the `clientId` query parameter on every dial, so the server can
//! recognize a reconnecting peer and preserve its logical state.
//!
//! The two `server-*` envelope kinds are intercepted here and surfaced as
//! [`HostEvent`]s instead of reaching message listeners: after
//! [`HostEvent::ServerLostClientState`] the supervisor must re-initialize
//! (re-announce readiness, re-subscribe listeners); after
//! [`HostEvent::ServerConnectionRestored`] nothing was lost and in-flight
//! calls simply resume.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::hosts::{Host, ListenerSet, ListenerToken, MessageListener};
use crate::identifiers::ClientId;
use crate::protocol::{Message, MessageKind};

// ============================================================================
// Constants
// ============================================================================

/// Timeout for establishing the WebSocket connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// HostEvent
// ============================================================================

/// Connectivity events surfaced by the client host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    /// Socket established (initial connect or manual reconnect).
    Connect,
    /// Socket dropped; the stable client id is retained.
    Disconnect,
    /// Server discarded this client's state; re-initialize.
    ServerLostClientState,
    /// Server preserved this client's state across a reconnect.
    ServerConnectionRestored,
}

/// Callback invoked for host connectivity events.
pub type HostEventListener = Arc<dyn Fn(HostEvent) + Send + Sync>;

/// Subscriber bookkeeping for [`HostEvent`]s.
#[derive(Default)]
struct EventSet {
    subscribers: Mutex<Vec<(ListenerToken, HostEventListener)>>,
    next_token: AtomicU64,
}

impl EventSet {
    fn new() -> Self {
        Self::default()
    }

    fn add(&self, subscriber: HostEventListener) -> ListenerToken {
        let token = ListenerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().push((token, subscriber));
        token
    }

    fn remove(&self, token: ListenerToken) {
        self.subscribers.lock().retain(|(t, _)| *t != token);
    }

    fn emit(&self, event: HostEvent) {
        let snapshot: Vec<HostEventListener> = {
            let subscribers = self.subscribers.lock();
            subscribers.iter().map(|(_, s)| Arc::clone(s)).collect()
        };
        for subscriber in snapshot {
            subscriber(event);
        }
    }

    fn clear(&self) {
        self.subscribers.lock().clear();
    }
}

// ============================================================================
// SocketCommand
// ============================================================================

/// Internal commands for the socket loop.
enum SocketCommand {
    /// Send one serialized frame.
    Send(String),
    /// Close the socket.
    Close,
}

/// Writer handle plus the dial generation it belongs to.
struct SocketState {
    writer: Option<mpsc::UnboundedSender<SocketCommand>>,
    generation: u64,
}

// ============================================================================
// WsClientHost
// ============================================================================

/// Socket-client host with a stable identity across physical reconnects.
pub struct WsClientHost {
    name: String,
    url: Url,
    client_id: ClientId,
    listeners: Arc<ListenerSet>,
    subscribers: Arc<EventSet>,
    state: Arc<Mutex<SocketState>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for WsClientHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsClientHost")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("client_id", &self.client_id)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl WsClientHost {
    /// Connects to a server and returns the host once the socket is open.
    ///
    /// # Errors
    ///
    /// - [`Error::Connection`] if the URL is invalid or the dial fails
    /// - [`Error::ConnectionTimeout`] if the server does not accept in time
    pub async fn connect(url: &str) -> Result<Arc<Self>> {
        let url = Url::parse(url).map_err(|e| Error::connection(format!("invalid url: {e}")))?;

        let host = Arc::new(Self {
            name: "ws-client-host".to_string(),
            url,
            client_id: ClientId::generate(),
            listeners: Arc::new(ListenerSet::new()),
            subscribers: Arc::new(EventSet::new()),
            state: Arc::new(Mutex::new(SocketState {
                writer: None,
                generation: 0,
            })),
            closed: AtomicBool::new(false),
        });

        host.dial().await?;
        host.subscribers.emit(HostEvent::Connect);
        Ok(host)
    }

    /// Returns this host's stable client id.
    #[inline]
    #[must_use]
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Returns `true` while the socket is open.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.lock().writer.is_some()
    }

    /// Subscribes to connectivity events.
    pub fn on_event(&self, subscriber: HostEventListener) -> ListenerToken {
        self.subscribers.add(subscriber)
    }

    /// Removes a connectivity-event subscriber.
    pub fn remove_event_listener(&self, token: ListenerToken) {
        self.subscribers.remove(token);
    }

    /// Closes the current socket without discarding the stable client id.
    pub fn disconnect_socket(&self) {
        let writer = self.state.lock().writer.take();
        if let Some(writer) = writer {
            let _ = writer.send(SocketCommand::Close);
        }
    }

    /// Re-dials the server with the same stable client id.
    ///
    /// No-op when already connected.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`WsClientHost::connect`], plus
    /// [`Error::HostClosed`] after disposal.
    pub async fn reconnect_socket(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::host_closed(&self.name));
        }
        if self.is_connected() {
            return Ok(());
        }

        self.dial().await?;
        self.subscribers.emit(HostEvent::Connect);
        Ok(())
    }

    /// Disposes the host: closes the socket and drops all listeners.
    pub fn dispose(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.disconnect_socket();
        self.listeners.clear();
        self.subscribers.clear();
    }

    /// Dials the server and installs a fresh socket loop.
    async fn dial(&self) -> Result<()> {
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair("clientId", self.client_id.as_str());

        let connect = tokio_tungstenite::connect_async(url.as_str());
        let (ws_stream, _) = timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| Error::connection_timeout(CONNECT_TIMEOUT.as_millis() as u64))?
            .map_err(|e| Error::connection(format!("failed to connect: {e}")))?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let generation = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.writer = Some(command_tx);
            state.generation
        };

        debug!(client_id = %self.client_id, generation, "WebSocket connected");

        tokio::spawn(Self::run_socket_loop(
            ws_stream,
            command_rx,
            Arc::clone(&self.listeners),
            Arc::clone(&self.subscribers),
            Arc::clone(&self.state),
            generation,
        ));

        Ok(())
    }

    /// Socket loop: pumps inbound frames and outbound commands.
    async fn run_socket_loop(
        ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        mut command_rx: mpsc::UnboundedReceiver<SocketCommand>,
        listeners: Arc<ListenerSet>,
        subscribers: Arc<EventSet>,
        state: Arc<Mutex<SocketState>>,
        generation: u64,
    ) {
        let (mut ws_write, mut ws_read) = ws_stream.split();

        loop {
            tokio::select! {
                frame = ws_read.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            Self::handle_frame(&text, &listeners, &subscribers);
                        }
                        Some(Ok(WsMessage::Close(_))) => {
                            debug!("WebSocket closed by server");
                            break;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "WebSocket error");
                            break;
                        }
                        None => {
                            debug!("WebSocket stream ended");
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
                                warn!(error = %e, "WebSocket send failed");
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

        // A newer dial may already own the writer slot; only clear our own.
        {
            let mut state = state.lock();
            if state.generation == generation {
                state.writer = None;
            }
        }

        subscribers.emit(HostEvent::Disconnect);
        debug!(generation, "Socket loop terminated");
    }

    /// Parses one inbound frame, intercepting server-state signals.
    fn handle_frame(text: &str, listeners: &ListenerSet, subscribers: &EventSet) {
        let message = match serde_json::from_str::<Message>(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Failed to parse inbound frame");
                return;
            }
        };

        match message.kind {
            MessageKind::ServerLostClientState => {
                debug!("Server lost client state");
                subscribers.emit(HostEvent::ServerLostClientState);
            }
            MessageKind::ServerConnectionRestored => {
                debug!("Server connection restored");
                subscribers.emit(HostEvent::ServerConnectionRestored);
            }
            _ => {
                trace!(kind = message.kind.name(), "Inbound message");
                listeners.emit(&message);
            }
        }
    }
}

impl Host for WsClientHost {
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
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::host_closed(&self.name));
        }

        let text = serde_json::to_string(&message)?;
        let state = self.state.lock();
        match &state.writer {
            Some(writer) => writer
                .send(SocketCommand::Send(text))
                .map_err(|_| Error::host_closed(&self.name)),
            None => Err(Error::connection("socket is not connected")),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Tests
// ============================================================================
