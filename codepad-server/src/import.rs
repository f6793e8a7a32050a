//! Import-from-URL: seed a draft's classes with remote text.
//!
//! Pastebin page links are rewritten to their raw endpoint:
//!
//! ```text
//! https://pastebin.com/Xy12Ab        ─┐
//! http://pastebin.com/raw.php?i=Xy12Ab ├─► https://pastebin.com/raw/Xy12Ab
//! pastebin.com/raw/Xy12Ab            ─┘
//! ```
//!
//! Any other `http(s)` address is fetched as-is, but only when its host is
//! listed in `allowed_hosts`. Redirects are never followed, so an allowed
//! host cannot bounce the request somewhere else.

use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImportConfig {
    /// Whole-request timeout
    pub timeout_ms: u64,
    /// Larger bodies are refused
    pub max_bytes: usize,
    /// Prefix a pastebin id is appended to
    pub pastebin_raw: String,
    /// Hosts that may be fetched, matched exactly and case-insensitively
    pub allowed_hosts: Vec<String>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_bytes: 512 * 1024,
            pastebin_raw: "https://pastebin.com/raw/".to_string(),
            allowed_hosts: vec![
                "pastebin.com".to_string(),
                "gist.githubusercontent.com".to_string(),
                "raw.githubusercontent.com".to_string(),
            ],
        }
    }
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("invalid import address '{0}'")]
    InvalidAddress(String),
    #[error("unsupported scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("host '{0}' is not in the import allowlist")]
    HostNotAllowed(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("remote answered with status {0}")]
    Status(u16),
    #[error("remote text exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

/// Fetches raw text for drafts.
pub struct Importer {
    client: reqwest::Client,
    config: ImportConfig,
}

impl Importer {
    pub fn new(config: ImportConfig) -> Result<Self, ImportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client, config })
    }

    /// Normalize a user-supplied address into the URL to fetch.
    pub fn resolve(&self, raw: &str) -> Result<Url, ImportError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ImportError::InvalidAddress(raw.to_string()));
        }
        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("https://{raw}")
        };
        let url =
            Url::parse(&with_scheme).map_err(|_| ImportError::InvalidAddress(raw.to_string()))?;

        match url.scheme() {
            "http" | "https" => {}
            other => return Err(ImportError::UnsupportedScheme(other.to_string())),
        }

        let is_pastebin = matches!(url.host_str(), Some("pastebin.com" | "www.pastebin.com"));
        let url = if is_pastebin {
            let id =
                pastebin_id(&url).ok_or_else(|| ImportError::InvalidAddress(raw.to_string()))?;
            Url::parse(&format!("{}{id}", self.config.pastebin_raw))
                .map_err(|_| ImportError::InvalidAddress(raw.to_string()))?
        } else {
            url
        };

        self.check_host(&url)?;
        Ok(url)
    }

    fn check_host(&self, url: &Url) -> Result<(), ImportError> {
        let host = url.host_str().unwrap_or_default();
        let allowed = self
            .config
            .allowed_hosts
            .iter()
            .any(|h| h.eq_ignore_ascii_case(host));
        if allowed {
            Ok(())
        } else {
            Err(ImportError::HostNotAllowed(host.to_string()))
        }
    }

    /// GET `url` and return its body as text, bounded by `max_bytes`.
    pub async fn fetch(&self, url: Url) -> Result<String, ImportError> {
        let limit = self.config.max_bytes;
        let mut response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ImportError::Status(status.as_u16()));
        }
        if response.content_length().is_some_and(|len| len > limit as u64) {
            return Err(ImportError::TooLarge { limit });
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            body.extend_from_slice(&chunk);
            if body.len() > limit {
                return Err(ImportError::TooLarge { limit });
            }
        }
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

/// Paste id from `/<id>`, `/raw/<id>` or `/raw.php?i=<id>`.
fn pastebin_id(url: &Url) -> Option<String> {
    let segments: Vec<&str> = url.path_segments()?.filter(|s| !s.is_empty()).collect();
    let id = match segments.as_slice() {
        ["raw.php"] => url
            .query_pairs()
            .find(|(k, _)| k == "i")
            .map(|(_, v)| v.into_owned())?,
        ["raw", id] | [id] => id.to_string(),
        _ => return None,
    };
    let valid = !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then_some(id)
}
