//! Blocking HTTP front end.
//!
//! A fixed pool of threads pulls requests off one `tiny_http::Server` and
//! drives the async [`Router`] to completion on the shared tokio runtime.

use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

use thiserror::Error;
use tiny_http::{Header, Request, Response, Server, StatusCode};
use tokio::runtime::Handle;

use crate::config::HttpConfig;
use crate::routes::{HttpRequest, Method, Reply, Router};

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },
    #[error("failed to start worker: {0}")]
    Worker(#[from] std::io::Error),
}

/// Bound listener, not yet serving.
pub struct HttpServer {
    server: Arc<Server>,
    addr: SocketAddr,
    workers: usize,
    max_body_bytes: usize,
}

impl HttpServer {
    pub fn bind(config: &HttpConfig) -> Result<Self, HttpError> {
        let bind_error = |reason: String| HttpError::Bind {
            addr: config.bind_addr.clone(),
            reason,
        };
        let server = Server::http(config.bind_addr.as_str()).map_err(|e| bind_error(e.to_string()))?;
        let addr = server
            .server_addr()
            .to_ip()
            .ok_or_else(|| bind_error("not an IP listener".to_string()))?;

        Ok(Self {
            server: Arc::new(server),
            addr,
            workers: config.workers.max(1),
            max_body_bytes: config.max_body_bytes,
        })
    }

    /// Actual bound address; differs from the config when port 0 was requested.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Start the worker threads.
    pub fn spawn(self, router: Arc<Router>, runtime: Handle) -> Result<HttpHandle, HttpError> {
        log::info!("HTTP listening on http://{} ({} workers)", self.addr, self.workers);

        let mut threads = Vec::with_capacity(self.workers);
        for n in 0..self.workers {
            let server = Arc::clone(&self.server);
            let router = Arc::clone(&router);
            let runtime = runtime.clone();
            let max_body = self.max_body_bytes;
            let thread = std::thread::Builder::new()
                .name(format!("codepad-http-{n}"))
                .spawn(move || worker(&server, &router, &runtime, max_body))?;
            threads.push(thread);
        }

        Ok(HttpHandle {
            server: self.server,
            addr: self.addr,
            threads,
        })
    }
}

/// Running HTTP front end.
pub struct HttpHandle {
    server: Arc<Server>,
    addr: SocketAddr,
    threads: Vec<JoinHandle<()>>,
}

impl HttpHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and wait for in-flight requests to finish.
    pub fn shutdown(self) {
        // one unblock per worker parked in recv()
        for _ in &self.threads {
            self.server.unblock();
        }
        for thread in self.threads {
            if thread.join().is_err() {
                log::error!("HTTP worker panicked");
            }
        }
        log::info!("HTTP server on {} stopped", self.addr);
    }
}

fn worker(server: &Server, router: &Router, runtime: &Handle, max_body: usize) {
    // ends when unblock() wakes this thread
    for request in server.incoming_requests() {
        handle(request, router, runtime, max_body);
    }
}

fn handle(mut request: Request, router: &Router, runtime: &Handle, max_body: usize) {
    let method = match request.method() {
        tiny_http::Method::Get => Method::Get,
        tiny_http::Method::Post => Method::Post,
        _ => Method::Other,
    };
    let target = request.url().to_string();

    let reply = match read_body(&mut request, max_body) {
        Ok(body) => {
            let http_request = HttpRequest::new(method, &target, body);
            runtime.block_on(router.handle(&http_request))
        }
        Err(reply) => reply,
    };

    log::debug!("{:?} {} -> {}", method, target, reply.status);
    if let Err(e) = request.respond(into_response(reply)) {
        log::debug!("Client went away before the response: {e}");
    }
}

fn read_body(request: &mut Request, max_body: usize) -> Result<Vec<u8>, Reply> {
    if request.body_length().is_some_and(|len| len > max_body) {
        return Err(Reply::error(413, "request body too large"));
    }
    let mut body = Vec::new();
    request
        .as_reader()
        .take(max_body as u64 + 1)
        .read_to_end(&mut body)
        .map_err(|e| Reply::error(400, format!("failed to read request body: {e}")))?;
    if body.len() > max_body {
        return Err(Reply::error(413, "request body too large"));
    }
    Ok(body)
}

fn into_response(reply: Reply) -> Response<std::io::Cursor<Vec<u8>>> {
    let body = serde_json::to_vec(&reply.body).unwrap_or_default();
    let mut response = Response::from_data(body).with_status_code(StatusCode(reply.status));
    if let Ok(header) = Header::from_bytes("Content-Type", "application/json") {
        response = response.with_header(header);
    }
    if let Some(location) = reply.location {
        if let Ok(header) = Header::from_bytes("Location", location.as_bytes()) {
            response = response.with_header(header);
        }
    }
    response
}
