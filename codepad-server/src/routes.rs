//! HTTP routes, independent of the HTTP server that carries them.
//!
//! ```text
//! GET  /                      sample draft + diagnostics
//! GET  /import?address=<url>  draft seeded from remote text
//! POST /validate              {command, classes} → {status, diagnostics}
//! POST /save                  {slug?, content, classes} → 302 /<slug>[/<version>]
//! POST /<slug>                new version of <slug>
//! GET  /<slug>                version 1
//! GET  /<slug>/<version>      that version; ≤ 1 → 301 /<slug>
//! GET  /<slug>/latest         302 to the highest version
//! ```

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use codepad_core::{
    canonical_path, not_found_message, render_diagnostics, Diagnostic, Draft, Post, Slug,
};
use codepad_eval::EvaluationEngine;
use codepad_live::{ValidateRequest, ValidateResponse};
use codepad_store::{ContentStore, StoreError};

use crate::import::Importer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Other,
}

/// A request as the router sees it.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    /// Path without the query string
    pub path: String,
    /// Decoded query parameters
    pub query: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Build from a request target such as `/import?address=...`.
    pub fn new(method: Method, target: &str, body: Vec<u8>) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, parse_query(query)),
            None => (target, Vec::new()),
        };
        Self {
            method,
            path: path.to_string(),
            query,
            body,
        }
    }

    pub fn get(target: &str) -> Self {
        Self::new(Method::Get, target, Vec::new())
    }

    pub fn post_json<T: Serialize>(target: &str, body: &T) -> Self {
        Self::new(
            Method::Post,
            target,
            serde_json::to_vec(body).unwrap_or_default(),
        )
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    // Borrow the url crate's form decoding through reqwest.
    reqwest::Url::parse(&format!("http://localhost/?{query}"))
        .map(|url| url.query_pairs().into_owned().collect())
        .unwrap_or_default()
}

/// What to send back.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: u16,
    pub location: Option<String>,
    pub body: serde_json::Value,
}

impl Reply {
    pub fn json<T: Serialize>(status: u16, body: &T) -> Self {
        Self {
            status,
            location: None,
            body: serde_json::to_value(body).unwrap_or_default(),
        }
    }

    pub fn redirect(status: u16, location: String) -> Self {
        Self {
            status,
            body: json!({ "location": location }),
            location: Some(location),
        }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self::json(status, &json!({ "error": message.into() }))
    }
}

/// Body of `POST /save` and `POST /<slug>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveRequest {
    pub slug: Option<String>,
    pub content: String,
    pub classes: String,
}

/// A post or draft together with its compile diagnostics.
#[derive(Serialize)]
struct Rendered<'a, T: Serialize> {
    #[serde(flatten)]
    item: &'a T,
    diagnostics: &'a [Diagnostic],
    /// Diagnostics as display lines, or the success message
    messages: Vec<String>,
}

#[derive(Serialize)]
struct PostView<'a> {
    post: &'a Post,
}

#[derive(Serialize)]
struct DraftView<'a> {
    draft: &'a Draft,
}

/// Route table over the store, engine and importer.
pub struct Router {
    store: Arc<dyn ContentStore>,
    engine: Arc<EvaluationEngine>,
    importer: Importer,
    sample: Draft,
}

impl Router {
    pub fn new(
        store: Arc<dyn ContentStore>,
        engine: Arc<EvaluationEngine>,
        importer: Importer,
        sample: Draft,
    ) -> Self {
        Self {
            store,
            engine,
            importer,
            sample,
        }
    }

    pub async fn handle(&self, request: &HttpRequest) -> Reply {
        let segments: Vec<&str> = request
            .path
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();

        match (request.method, segments.as_slice()) {
            (Method::Get, []) => self.draft(&self.sample).await,
            (Method::Get | Method::Post, ["import"]) => self.import(request.param("address")).await,
            (Method::Post, ["validate"]) => self.validate(&request.body).await,
            (Method::Post, ["save"]) => self.save(None, &request.body),
            (Method::Post, [slug]) => self.save(Some(*slug), &request.body),
            (Method::Get, [slug]) => self.show(slug, 1).await,
            (Method::Get, [slug, "latest"]) => self.latest(slug),
            (Method::Get, [slug, version]) => match version.parse::<i64>() {
                // `/<slug>/1`, `/<slug>/0` and below are spelled `/<slug>`
                Ok(v) if v <= 1 => Reply::redirect(301, format!("/{slug}")),
                Ok(v) => self.show(slug, v as u64).await,
                Err(_) => Reply::error(404, "not found"),
            },
            (Method::Other, _) => Reply::error(405, "method not allowed"),
            _ => Reply::error(404, "not found"),
        }
    }

    async fn show(&self, raw_slug: &str, version: u64) -> Reply {
        let Ok(slug) = Slug::parse(raw_slug) else {
            return Reply::error(404, not_found_message(raw_slug, version));
        };
        match self.store.get(&slug, version) {
            Ok(post) => {
                let diagnostics = self.engine.validate(&post.content, &post.classes).await;
                Reply::json(200, &rendered(&PostView { post: &post }, &diagnostics))
            }
            Err(e @ StoreError::NotFound { .. }) => Reply::error(404, e.to_string()),
            Err(e) => internal(e),
        }
    }

    fn latest(&self, raw_slug: &str) -> Reply {
        let Ok(slug) = Slug::parse(raw_slug) else {
            return Reply::error(404, format!("code snippet of '{raw_slug}' was not found."));
        };
        match self.store.latest_version(&slug) {
            Ok(0) => Reply::error(404, format!("code snippet of '{slug}' was not found.")),
            Ok(latest) => Reply::redirect(302, canonical_path(&slug, latest)),
            Err(e) => internal(e),
        }
    }

    fn save(&self, path_slug: Option<&str>, body: &[u8]) -> Reply {
        let request: SaveRequest = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(e) => return Reply::error(400, format!("invalid save request: {e}")),
        };

        let raw_slug = path_slug
            .map(str::to_string)
            .or(request.slug)
            .filter(|s| !s.trim().is_empty());
        let saved = match raw_slug {
            Some(raw) => match Slug::parse(raw.trim()) {
                Ok(slug) => self.store.save(&slug, &request.content, &request.classes),
                Err(e) => return Reply::error(400, e.to_string()),
            },
            None => self.store.save_new(&request.content, &request.classes),
        };

        match saved {
            Ok(post) => {
                log::info!("Saved {} version {}", post.slug, post.version);
                let mut reply = Reply::redirect(302, post.path());
                reply.body = json!({ "slug": post.slug, "version": post.version });
                reply
            }
            Err(e) => internal(e),
        }
    }

    async fn validate(&self, body: &[u8]) -> Reply {
        let request: ValidateRequest = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(e) => return Reply::error(400, format!("invalid validate request: {e}")),
        };
        let diagnostics = self.engine.validate(&request.command, &request.classes).await;
        Reply::json(200, &ValidateResponse::ok(diagnostics))
    }

    async fn import(&self, address: Option<&str>) -> Reply {
        let url = match address.map(|a| self.importer.resolve(a)) {
            Some(Ok(url)) => url,
            Some(Err(e)) => {
                log::info!("Ignoring import: {e}");
                return self.draft(&self.sample).await;
            }
            None => return self.draft(&self.sample).await,
        };

        let draft = match self.importer.fetch(url.clone()).await {
            Ok(text) => Draft::with_classes(text),
            Err(e) => {
                log::warn!("Import from {url} failed: {e}");
                Draft::default()
            }
        };
        self.draft(&draft).await
    }

    async fn draft(&self, draft: &Draft) -> Reply {
        let diagnostics = self.engine.validate(&draft.content, &draft.classes).await;
        Reply::json(200, &rendered(&DraftView { draft }, &diagnostics))
    }
}

fn rendered<'a, T: Serialize>(item: &'a T, diagnostics: &'a [Diagnostic]) -> Rendered<'a, T> {
    Rendered {
        item,
        diagnostics,
        messages: render_diagnostics(diagnostics),
    }
}

fn internal(e: StoreError) -> Reply {
    log::error!("Store failure: {e}");
    Reply::error(500, "internal storage error")
}
