//! Process-channel host.
//!
//! Carries envelopes as newline-delimited JSON over a byte stream pair:
//! a spawned child's stdin/stdout on the parent side, or the process's own
//! stdio on the child side. One line, one message.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::hosts::{Host, ListenerSet, ListenerToken, MessageListener};
use crate::protocol::Message;

// ============================================================================
// IpcCommand
// ============================================================================

/// Internal commands for the writer task.
enum IpcCommand {
    /// Write one serialized message line.
    Send(String),
    /// Terminate the writer.
    Shutdown,
}

// ============================================================================
// IpcHost
// ============================================================================

/// Host over a process channel (stdio pipe pair).
pub struct IpcHost {
    name: String,
    listeners: Arc<ListenerSet>,
    command_tx: mpsc::UnboundedSender<IpcCommand>,
    closed: Arc<AtomicBool>,
}

impl IpcHost {
    /// Creates a host over a spawned child's stdio pipes.
    ///
    /// The child must have been spawned with piped stdin and stdout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if either pipe is missing.
    pub fn from_child(child: &mut Child) -> Result<Arc<Self>> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::connection("child process has no piped stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::connection("child process has no piped stdout"))?;

        Ok(Self::from_stream("ipc-host", stdout, stdin))
    }

    /// Creates a host over this process's own stdio.
    ///
    /// Used inside a spawned child to talk back to its parent.
    #[must_use]
    pub fn from_stdio() -> Arc<Self> {
        Self::from_stream("ipc-host", tokio::io::stdin(), tokio::io::stdout())
    }

    /// Creates a host over an arbitrary byte stream pair.
    pub fn from_stream<R, W>(name: impl Into<String>, reader: R, writer: W) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let name = name.into();
        let listeners = Arc::new(ListenerSet::new());
        let closed = Arc::new(AtomicBool::new(false));
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::run_reader(
            reader,
            Arc::clone(&listeners),
            Arc::clone(&closed),
        ));
        tokio::spawn(Self::run_writer(writer, command_rx));

        Arc::new(Self {
            name,
            listeners,
            command_tx,
            closed,
        })
    }

    /// Closes the channel; pending writes are flushed, further sends fail.
    pub fn dispose(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.command_tx.send(IpcCommand::Shutdown);
        self.listeners.clear();
    }

    /// Reader task: one JSON message per line.
    async fn run_reader<R>(reader: R, listeners: Arc<ListenerSet>, closed: Arc<AtomicBool>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut lines = BufReader::new(reader).lines();

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Message>(&line) {
                        Ok(message) => {
                            trace!(kind = message.kind.name(), "IPC message received");
                            listeners.emit(&message);
                        }
                        Err(e) => warn!(error = %e, "Failed to parse IPC message"),
                    }
                }
                Ok(None) => {
                    debug!("IPC stream ended");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "IPC read failed");
                    break;
                }
            }
        }

        closed.store(true, Ordering::SeqCst);
    }

    /// Writer task: serializes queued lines onto the channel.
    async fn run_writer<W>(mut writer: W, mut command_rx: mpsc::UnboundedReceiver<IpcCommand>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        while let Some(command) = command_rx.recv().await {
            match command {
                IpcCommand::Send(line) => {
                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                        warn!(error = %e, "IPC write failed");
                        break;
                    }
                    if let Err(e) = writer.write_all(b"\n").await {
                        warn!(error = %e, "IPC write failed");
                        break;
                    }
                    if let Err(e) = writer.flush().await {
                        warn!(error = %e, "IPC flush failed");
                        break;
                    }
                }
                IpcCommand::Shutdown => break,
            }
        }

        debug!("IPC writer terminated");
    }
}

impl Host for IpcHost {
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

        let line = serde_json::to_string(&message)?;
        self.command_tx
            .send(IpcCommand::Send(line))
            .map_err(|_| Error::host_closed(&self.name))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Tests
// ============================================================================
