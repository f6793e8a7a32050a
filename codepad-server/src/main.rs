use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use codepad_server::{App, AppConfig};

#[derive(Parser, Debug)]
#[command(version, about = "Compile, validate and run code snippets", long_about = None)]
struct Cli {
    /// Config file path; defaults apply when it does not exist
    #[arg(short, long, default_value = "codepad.toml", value_hint = clap::ValueHint::FilePath)]
    config: PathBuf,

    /// HTTP bind address (overrides [http] bind_addr)
    #[arg(long)]
    http: Option<String>,

    /// Live WebSocket bind address (overrides [live] bind_addr)
    #[arg(long)]
    live: Option<String>,

    /// Store directory (overrides [store] path)
    #[arg(long, value_hint = clap::ValueHint::DirPath)]
    data: Option<PathBuf>,

    /// Keep posts in memory instead of RocksDB
    #[arg(long)]
    memory: bool,
}

impl Cli {
    fn load_config(&self) -> Result<AppConfig> {
        let mut config = if self.config.exists() {
            AppConfig::load(&self.config)?
        } else {
            AppConfig::default()
        };
        if let Some(addr) = &self.http {
            config.http.bind_addr = addr.clone();
        }
        if let Some(addr) = &self.live {
            config.live.bind_addr = addr.clone();
        }
        if let Some(path) = &self.data {
            config.store.path = path.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log.level))
        .init();
    if !cli.config.exists() {
        log::info!("No config at {}, using defaults", cli.config.display());
    }

    let app = if cli.memory {
        App::in_memory(config)?
    } else {
        App::open(config).context("failed to open the post store")?
    };
    let running = app.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    log::info!("Shutting down");
    running.shutdown().await;
    Ok(())
}
