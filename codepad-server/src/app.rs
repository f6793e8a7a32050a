//! Process wiring: one store and one engine shared by both front ends.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use codepad_eval::{EvaluationEngine, ToolchainError};
use codepad_live::LiveServer;
use codepad_store::{ContentStore, MemoryStore, RocksStore, StoreError};

use crate::config::AppConfig;
use crate::http::{HttpError, HttpHandle, HttpServer};
use crate::import::{ImportError, Importer};
use crate::routes::Router;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("toolchain: {0}")]
    Toolchain(#[from] ToolchainError),
    #[error("importer: {0}")]
    Import(#[from] ImportError),
    #[error("http: {0}")]
    Http(#[from] HttpError),
    #[error("live endpoint on {addr}: {source}")]
    Live {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Configured but not yet listening.
pub struct App {
    config: AppConfig,
    store: Arc<dyn ContentStore>,
    engine: Arc<EvaluationEngine>,
}

impl App {
    /// Open the RocksDB store named by the config.
    pub fn open(config: AppConfig) -> Result<Self, AppError> {
        let store = RocksStore::open(config.store.clone())?;
        log::info!("Store opened at {}", store.path().display());
        Self::with_store(config, Arc::new(store))
    }

    /// Keep posts in memory only; they are lost on exit.
    pub fn in_memory(config: AppConfig) -> Result<Self, AppError> {
        log::warn!("Using in-memory store, posts will not survive a restart");
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(config: AppConfig, store: Arc<dyn ContentStore>) -> Result<Self, AppError> {
        let engine = Arc::new(EvaluationEngine::from_config(&config.engine)?);
        Ok(Self::with_parts(config, store, engine))
    }

    pub fn with_parts(
        config: AppConfig,
        store: Arc<dyn ContentStore>,
        engine: Arc<EvaluationEngine>,
    ) -> Self {
        Self {
            config,
            store,
            engine,
        }
    }

    pub fn router(&self) -> Result<Router, AppError> {
        Ok(Router::new(
            Arc::clone(&self.store),
            Arc::clone(&self.engine),
            Importer::new(self.config.import.clone())?,
            self.config.http.sample.clone(),
        ))
    }

    /// Bind both listeners and start serving. Must be called inside a tokio runtime.
    pub async fn start(self) -> Result<Running, AppError> {
        let router = Arc::new(self.router()?);

        let live_addr = self.config.live.bind_addr.clone();
        let listener = TcpListener::bind(&live_addr)
            .await
            .map_err(|source| AppError::Live {
                addr: live_addr.clone(),
                source,
            })?;
        let live_addr = listener.local_addr().map_err(|source| AppError::Live {
            addr: live_addr,
            source,
        })?;

        log::info!("Live endpoint listening on ws://{live_addr}");

        let live = Arc::new(LiveServer::new(self.config.live.clone(), Arc::clone(&self.engine)));
        let live_task = tokio::spawn(async move {
            if let Err(e) = live.serve(listener).await {
                log::error!("Live endpoint stopped: {e}");
            }
        });

        let http = HttpServer::bind(&self.config.http)
            .and_then(|server| server.spawn(router, Handle::current()));
        let http = match http {
            Ok(http) => http,
            Err(e) => {
                live_task.abort();
                return Err(e.into());
            }
        };

        Ok(Running {
            http,
            live_addr,
            live_task,
        })
    }
}

/// Both front ends, serving.
pub struct Running {
    http: HttpHandle,
    live_addr: SocketAddr,
    live_task: JoinHandle<()>,
}

impl Running {
    pub fn http_addr(&self) -> SocketAddr {
        self.http.addr()
    }

    pub fn live_addr(&self) -> SocketAddr {
        self.live_addr
    }

    pub async fn shutdown(self) {
        self.live_task.abort();
        let _ = self.live_task.await;
        // workers may be inside block_on; join them off the runtime
        let http = self.http;
        if tokio::task::spawn_blocking(move || http.shutdown()).await.is_err() {
            log::error!("HTTP shutdown panicked");
        }
    }
}
