//! Client side of the live channel.
//!
//! One logical duplex stream with an explicit state machine:
//!
//! ```text
//!              send()                     handshake ok
//! Disconnected ───────► Connecting ────────────────────► Connected
//!      ▲                    │                               │
//!      │   handshake failed │                               │ idle timeout,
//!      └────────────────────┴───────────────────────────────┘ close(), transport fault
//! ```
//!
//! All sends go through a single driver task, so they are serialized:
//! a send issued while a connection is being negotiated waits behind it
//! and never starts a second attempt. Every successful send re-arms the
//! idle deadline; teardown disarms it.
//!
//! Inbound frames are pushed onto an unbounded queue by a reader task and
//! consumed by one handler ([`LiveChannel::take_event_rx`] or
//! [`LiveChannel::spawn_handler`]), so a slow handler never stalls the socket.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::{ClientFrame, ProtocolError, ServerFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelConfig {
    /// `ws://host:port` of the live endpoint
    pub url: String,
    /// Idle period after which the connection is torn down
    pub idle_timeout_ms: u64,
    /// Upper bound on one connection handshake
    pub connect_timeout_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".to_string(),
            idle_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// No send within the idle timeout
    IdleTimeout,
    /// `close()` or the channel was dropped
    Closed,
    /// The server closed the stream
    RemoteClosed,
    /// The transport failed mid-flight
    TransportFault,
}

/// Events delivered to the registered handler, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected,
    Disconnected(DisconnectReason),
    Frame(ServerFrame),
    /// Negotiation or mid-flight failure; the next send reconnects
    TransportFault(String),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("connecting to {url} timed out")]
    ConnectTimeout { url: String },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("channel is shut down")]
    Shutdown,
}

enum Command {
    Send {
        frame: ClientFrame,
        reply: oneshot::Sender<Result<(), ChannelError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a live channel. Dropping it closes the connection.
pub struct LiveChannel {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ChannelState>,
    event_rx: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    config: ChannelConfig,
}

impl LiveChannel {
    /// Create a disconnected channel. Must be called inside a tokio runtime.
    pub fn new(config: ChannelConfig) -> Self {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(ChannelState::Disconnected);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            config: config.clone(),
            state: state_tx,
            events: event_tx,
            reader_exits: exit_tx,
            conn: None,
            idle_deadline: None,
            generation: 0,
        };
        tokio::spawn(driver.run(command_rx, exit_rx));

        Self {
            commands: command_tx,
            state: state_rx,
            event_rx: Some(event_rx),
            config,
        }
    }

    /// Send a frame, connecting first if needed.
    ///
    /// Resolves once the frame has been handed to the transport.
    pub async fn send(&self, frame: ClientFrame) -> Result<(), ChannelError> {
        let (reply, result) = oneshot::channel();
        self.commands
            .send(Command::Send { frame, reply })
            .await
            .map_err(|_| ChannelError::Shutdown)?;
        result.await.map_err(|_| ChannelError::Shutdown)?
    }

    pub async fn execute(&self, content: &str, classes: &str) -> Result<(), ChannelError> {
        self.send(ClientFrame::execute(content, classes)).await
    }

    /// Tear the connection down now. The next send reconnects.
    pub async fn close(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Close { reply }).await.is_ok() {
            let _ = done.await;
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.event_rx.take()
    }

    /// Register `handler` as the consumer of inbound events.
    ///
    /// Returns `None` if the receiver was already taken.
    pub fn spawn_handler<F>(&mut self, mut handler: F) -> Option<JoinHandle<()>>
    where
        F: FnMut(ChannelEvent) + Send + 'static,
    {
        let mut rx = self.take_event_rx()?;
        Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handler(event);
            }
        }))
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }
}

// ─── Driver ──────────────────────────────────────────────

struct Connection {
    sink: SplitSink<WsStream, Message>,
    reader: JoinHandle<()>,
}

struct ReaderExit {
    generation: u64,
    fault: Option<String>,
}

struct Driver {
    config: ChannelConfig,
    state: watch::Sender<ChannelState>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    reader_exits: mpsc::UnboundedSender<ReaderExit>,
    conn: Option<Connection>,
    idle_deadline: Option<Instant>,
    /// Bumped per connection; exits from older readers are ignored
    generation: u64,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut exits: mpsc::UnboundedReceiver<ReaderExit>,
    ) {
        loop {
            let deadline = self.idle_deadline;
            let idle = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Send { frame, reply }) => {
                        let result = self.send(frame).await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Close { reply }) => {
                        self.teardown(DisconnectReason::Closed).await;
                        let _ = reply.send(());
                    }
                    None => break,
                },
                Some(exit) = exits.recv() => self.on_reader_exit(exit),
                _ = idle => {
                    log::info!(
                        "Live channel idle for {} ms; disconnecting",
                        self.config.idle_timeout_ms
                    );
                    self.teardown(DisconnectReason::IdleTimeout).await;
                }
            }
        }

        self.teardown(DisconnectReason::Closed).await;
        log::debug!("Live channel driver stopped");
    }

    async fn send(&mut self, frame: ClientFrame) -> Result<(), ChannelError> {
        let text = frame.encode()?;
        if self.conn.is_none() {
            self.connect().await?;
        }
        let Some(conn) = self.conn.as_mut() else {
            return Err(ChannelError::Shutdown);
        };

        match conn.sink.send(Message::Text(text.into())).await {
            Ok(()) => {
                self.arm_idle();
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                log::warn!("Live channel send failed: {reason}");
                self.emit(ChannelEvent::TransportFault(reason.clone()));
                self.teardown(DisconnectReason::TransportFault).await;
                Err(ChannelError::Transport(reason))
            }
        }
    }

    async fn connect(&mut self) -> Result<(), ChannelError> {
        self.set_state(ChannelState::Connecting);
        let url = self.config.url.clone();
        let limit = Duration::from_millis(self.config.connect_timeout_ms);

        let attempt = tokio::time::timeout(limit, tokio_tungstenite::connect_async(&url)).await;
        let error = match attempt {
            Ok(Ok((ws, _response))) => {
                let (sink, stream) = ws.split();
                self.generation += 1;
                let reader = tokio::spawn(read_frames(
                    stream,
                    self.generation,
                    self.events.clone(),
                    self.reader_exits.clone(),
                ));
                self.conn = Some(Connection { sink, reader });
                self.set_state(ChannelState::Connected);
                self.emit(ChannelEvent::Connected);
                log::info!("Live channel connected to {url}");
                return Ok(());
            }
            Ok(Err(e)) => ChannelError::Connect {
                url,
                reason: e.to_string(),
            },
            Err(_) => ChannelError::ConnectTimeout { url },
        };

        log::warn!("{error}");
        self.set_state(ChannelState::Disconnected);
        self.emit(ChannelEvent::TransportFault(error.to_string()));
        Err(error)
    }

    async fn teardown(&mut self, reason: DisconnectReason) {
        self.idle_deadline = None;
        let Some(mut conn) = self.conn.take() else {
            return;
        };

        if reason != DisconnectReason::TransportFault {
            let _ = tokio::time::timeout(Duration::from_millis(500), conn.sink.close()).await;
        }
        conn.reader.abort();
        self.set_state(ChannelState::Disconnected);
        self.emit(ChannelEvent::Disconnected(reason));
        log::info!("Live channel disconnected ({reason:?})");
    }

    fn on_reader_exit(&mut self, exit: ReaderExit) {
        if exit.generation != self.generation || self.conn.is_none() {
            return;
        }
        self.conn = None;
        self.idle_deadline = None;
        self.set_state(ChannelState::Disconnected);

        let reason = match exit.fault {
            Some(fault) => {
                log::warn!("Live channel transport fault: {fault}");
                self.emit(ChannelEvent::TransportFault(fault));
                DisconnectReason::TransportFault
            }
            None => DisconnectReason::RemoteClosed,
        };
        self.emit(ChannelEvent::Disconnected(reason));
        log::info!("Live channel disconnected ({reason:?})");
    }

    fn arm_idle(&mut self) {
        self.idle_deadline =
            Some(Instant::now() + Duration::from_millis(self.config.idle_timeout_ms));
    }

    fn set_state(&self, state: ChannelState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }
}

/// Decode inbound frames until the stream ends, then report to the driver.
async fn read_frames(
    mut stream: SplitStream<WsStream>,
    generation: u64,
    events: mpsc::UnboundedSender<ChannelEvent>,
    exits: mpsc::UnboundedSender<ReaderExit>,
) {
    let fault = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match ServerFrame::decode(text.as_str()) {
                Ok(frame) => {
                    let _ = events.send(ChannelEvent::Frame(frame));
                }
                Err(e) => {
                    log::warn!("Dropping undecodable frame: {e}");
                    let _ = events.send(ChannelEvent::TransportFault(e.to_string()));
                }
            },
            Some(Ok(Message::Close(_))) | None => break None,
            Some(Ok(_)) => {}
            Some(Err(e)) => break Some(e.to_string()),
        }
    };
    let _ = exits.send(ReaderExit { generation, fault });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> ChannelConfig {
        // Port 9 (discard) is closed on any sane test host.
        ChannelConfig {
            url: "ws://127.0.0.1:9".to_string(),
            idle_timeout_ms: 200,
            connect_timeout_ms: 1_000,
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = ChannelConfig::default();
        assert_eq!(config.idle_timeout_ms, 30_000);
        assert_eq!(ChannelConfig::new("ws://x").url, "ws://x");
    }

    #[tokio::test]
    async fn test_initial_state() {
        let channel = LiveChannel::new(unreachable_config());
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_disconnected() {
        let mut channel = LiveChannel::new(unreachable_config());
        let mut events = channel.take_event_rx().unwrap();

        let err = channel.send(ClientFrame::Ping).await.unwrap_err();
        assert!(matches!(err, ChannelError::Connect { .. } | ChannelError::ConnectTimeout { .. }));
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert!(matches!(events.recv().await, Some(ChannelEvent::TransportFault(_))));

        // No automatic retry; the next send makes a fresh attempt.
        assert!(events.try_recv().is_err());
        assert!(channel.send(ClientFrame::Ping).await.is_err());
        assert!(matches!(events.recv().await, Some(ChannelEvent::TransportFault(_))));
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut channel = LiveChannel::new(unreachable_config());
        assert!(channel.take_event_rx().is_some());
        assert!(channel.take_event_rx().is_none());
        assert!(channel.spawn_handler(|_| {}).is_none());
    }

    #[tokio::test]
    async fn test_close_when_disconnected_is_noop() {
        let mut channel = LiveChannel::new(unreachable_config());
        let mut events = channel.take_event_rx().unwrap();
        channel.close().await;
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert!(events.try_recv().is_err());
    }
}
