//! # codepad-server — HTTP front end and process wiring
//!
//! ```text
//!            ┌────────────── codepad ──────────────┐
//! HTTP ────► │ http (tiny_http workers) ─► Router  │──► ContentStore (RocksDB)
//!            │                               │     │
//! WebSocket ►│ LiveServer (tokio) ───────────┴─────│──► EvaluationEngine
//!            └─────────────────────────────────────┘
//! ```

pub mod app;
pub mod config;
pub mod http;
pub mod import;
pub mod routes;

pub use app::{App, AppError, Running};
pub use config::{AppConfig, ConfigError, HttpConfig, LogConfig};
pub use http::{HttpError, HttpHandle, HttpServer};
pub use import::{ImportConfig, ImportError, Importer};
pub use routes::{HttpRequest, Method, Reply, Router, SaveRequest};
