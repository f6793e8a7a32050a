//! # codepad-live — the live channel between an editor and the service
//!
//! ```text
//!   editor                                        service
//! ┌──────────────────────┐                   ┌───────────────────────┐
//! │ SessionCoordinator   │                   │ LiveServer            │
//! │   edit ─► debounce ──┼─► Validator       │   SessionRegistry     │
//! │   execute ─┐         │                   │   per session:        │
//! │            ▼         │   WebSocket       │     reader ─► engine  │
//! │ LiveChannel ─────────┼───────────────────┼─►   writer ◄─ results │
//! │   state machine      │ ◄── pushed frames │                       │
//! └──────────────────────┘                   └───────────────────────┘
//! ```
//!
//! Frames are JSON text, tagged with `"type"`, decoded once at the edge
//! into [`protocol::ClientFrame`] / [`protocol::ServerFrame`].

pub mod channel;
pub mod protocol;
pub mod server;
pub mod session;

pub use channel::{ChannelConfig, ChannelError, ChannelEvent, ChannelState, DisconnectReason, LiveChannel};
pub use protocol::{ClientFrame, ProtocolError, ServerFrame, Status, ValidateRequest, ValidateResponse};
pub use server::{LiveServer, LiveServerConfig, ServerStats, SessionId, SessionInfo, SessionRegistry};
pub use session::{HttpValidator, SessionConfig, SessionCoordinator, SessionEvent, Validator};
