//! Live endpoint: one WebSocket session per connected editor.
//!
//! ```text
//! TcpListener ──accept──► session (uuid) ──► SessionRegistry
//!                             │
//!               reader loop ──┼── execute  ──► spawn ─► EvaluationEngine::execute ─┐
//!                             ├── validate ──► spawn (supersedes previous) ────────┤
//!                             └── ping     ──► pong ───────────────────────────────┤
//!                                                                                  ▼
//!                                               outbound mpsc ──► writer task ──► socket
//! ```
//!
//! The reader never awaits an evaluation, so frame parsing keeps up while
//! results are pending. All pushes for a session go through one outbound
//! queue and therefore leave in the order they were produced.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use codepad_eval::EvaluationEngine;

use crate::protocol::{ClientFrame, ServerFrame, Status};

pub type SessionId = Uuid;

/// Live endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LiveServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Sessions with no inbound frame for this long are closed
    pub idle_timeout_ms: u64,
    /// Pending pushes per session before producers wait
    pub outbound_capacity: usize,
}

impl Default for LiveServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            idle_timeout_ms: 60_000,
            outbound_capacity: 64,
        }
    }
}

impl LiveServerConfig {
    pub fn for_testing(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            idle_timeout_ms: 5_000,
            outbound_capacity: 16,
        }
    }
}

/// What the registry knows about one session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub peer_addr: SocketAddr,
    pub connected_at: Instant,
    pub frames: u64,
    pub executions: u64,
    pub validations: u64,
}

/// Live sessions keyed by connection identity.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionInfo>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self, peer_addr: SocketAddr) -> SessionId {
        let id = Uuid::new_v4();
        let info = SessionInfo {
            id,
            peer_addr,
            connected_at: Instant::now(),
            frames: 0,
            executions: 0,
            validations: 0,
        };
        self.sessions.write().await.insert(id, info);
        id
    }

    async fn update(&self, id: SessionId, f: impl FnOnce(&mut SessionInfo)) {
        if let Some(info) = self.sessions.write().await.get_mut(&id) {
            f(info);
        }
    }

    async fn remove(&self, id: SessionId) -> Option<SessionInfo> {
        self.sessions.write().await.remove(&id)
    }

    pub async fn get(&self, id: SessionId) -> Option<SessionInfo> {
        self.sessions.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<SessionInfo> {
        self.sessions.read().await.values().cloned().collect()
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub decode_errors: u64,
    pub idle_closures: u64,
}

/// The live endpoint.
pub struct LiveServer {
    config: LiveServerConfig,
    engine: Arc<EvaluationEngine>,
    registry: Arc<SessionRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

/// Shared state handed to each connection task.
#[derive(Clone)]
struct Shared {
    config: LiveServerConfig,
    engine: Arc<EvaluationEngine>,
    registry: Arc<SessionRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl LiveServer {
    pub fn new(config: LiveServerConfig, engine: Arc<EvaluationEngine>) -> Self {
        Self {
            config,
            engine,
            registry: Arc::new(SessionRegistry::new()),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Live endpoint listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = Shared {
                config: self.config.clone(),
                engine: self.engine.clone(),
                registry: self.registry.clone(),
                stats: self.stats.clone(),
            };
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }
}

/// Drive one WebSocket session until it closes or idles out.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Shared,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let id = shared.registry.register(addr).await;
    {
        let mut s = shared.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }
    log::info!("Session {id} opened from {addr}");

    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(shared.config.outbound_capacity.max(1));
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let text = match frame.encode() {
                Ok(text) => text,
                Err(e) => {
                    log::error!("Failed to encode push: {e}");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let idle = Duration::from_millis(shared.config.idle_timeout_ms);
    let mut validation: Option<JoinHandle<()>> = None;

    loop {
        let message = match tokio::time::timeout(idle, ws_receiver.next()).await {
            Ok(message) => message,
            Err(_) => {
                log::info!("Session {id} idle for {idle:?}; closing");
                shared.stats.write().await.idle_closures += 1;
                break;
            }
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                shared.stats.write().await.total_frames += 1;
                shared.registry.update(id, |s| s.frames += 1).await;
                dispatch(text.as_str(), id, &shared, &out_tx, &mut validation).await;
            }
            Some(Ok(Message::Binary(_))) => {
                let _ = out_tx
                    .send(ServerFrame::Error {
                        message: "binary frames are not supported".to_string(),
                    })
                    .await;
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                log::warn!("Session {id} transport error: {e}");
                break;
            }
        }
    }

    // In-flight executions finish on their own timeout; validation is moot.
    if let Some(handle) = validation.take() {
        handle.abort();
    }
    drop(out_tx);
    drop(writer);

    shared.registry.remove(id).await;
    shared.stats.write().await.active_connections -= 1;
    log::info!("Session {id} closed");
    Ok(())
}

async fn dispatch(
    text: &str,
    id: SessionId,
    shared: &Shared,
    out_tx: &mpsc::Sender<ServerFrame>,
    validation: &mut Option<JoinHandle<()>>,
) {
    let frame = match ClientFrame::decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!("Session {id} sent an undecodable frame: {e}");
            shared.stats.write().await.decode_errors += 1;
            let _ = out_tx
                .send(ServerFrame::Error {
                    message: e.to_string(),
                })
                .await;
            return;
        }
    };

    match frame {
        ClientFrame::Ping => {
            let _ = out_tx.send(ServerFrame::Pong).await;
        }
        ClientFrame::Execute {
            content,
            classes,
            id: request_id,
        } => {
            if content.trim().is_empty() {
                let _ = out_tx
                    .send(ServerFrame::Error {
                        message: "command is empty".to_string(),
                    })
                    .await;
                return;
            }
            shared.registry.update(id, |s| s.executions += 1).await;
            let engine = shared.engine.clone();
            let out = out_tx.clone();
            tokio::spawn(async move {
                let result = engine.execute(&content, &classes).await;
                let _ = out.send(ServerFrame::execution(&result, request_id)).await;
            });
        }
        ClientFrame::Validate {
            command,
            classes,
            seq,
        } => {
            shared.registry.update(id, |s| s.validations += 1).await;
            // A newer validation makes the running one irrelevant.
            if let Some(previous) = validation.take() {
                previous.abort();
            }
            let engine = shared.engine.clone();
            let out = out_tx.clone();
            *validation = Some(tokio::spawn(async move {
                let diagnostics = engine.validate(&command, &classes).await;
                let _ = out
                    .send(ServerFrame::Validation {
                        seq,
                        status: Status::Ok,
                        diagnostics,
                    })
                    .await;
            }));
        }
    }
}
