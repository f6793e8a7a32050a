//! `codepad.toml` loading.
//!
//! Every section is optional; an empty file yields the defaults.
//!
//! ```toml
//! [http]
//! bind_addr = "0.0.0.0:8080"
//!
//! [engine]
//! run_timeout_ms = 3000
//!
//! [engine.toolchain]
//! wrapper = ["prlimit", "--as=268435456", "--"]
//!
//! [log]
//! level = "debug"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use codepad_core::Draft;
use codepad_eval::EngineConfig;
use codepad_live::LiveServerConfig;
use codepad_store::StoreConfig;

use crate::import::ImportConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Whole-process configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub live: LiveServerConfig,
    pub store: StoreConfig,
    pub engine: EngineConfig,
    pub import: ImportConfig,
    pub log: LogConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// HTTP front end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    pub bind_addr: String,
    /// Request-handling threads
    pub workers: usize,
    /// Larger request bodies are rejected with 413
    pub max_body_bytes: usize,
    /// Draft served at `/`
    pub sample: Draft,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            workers: 4,
            max_body_bytes: 256 * 1024,
            sample: sample_draft(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// `env_logger` filter used when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn sample_draft() -> Draft {
    let classes = r#"public interface IPerson
{
    string Name { get; }

    string Greet();
}

class Person : IPerson
{
    public Person(string name)
    {
        Name = name;
    }

    public string Name { get; private set; }

    public string Greet()
    {
        if (Name == null)
            return "Hello, stranger!";

        return string.Format("Hello, {0}!", Name);
    }
}
"#;
    let content = "IPerson person = new Person(name: null);\n\nreturn person.Greet();\n";
    Draft::new(content, classes)
}
