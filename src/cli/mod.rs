use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::clipboard::{ClipboardPort, ClipboardSnapshot, MemoryClipboard, SystemClipboard};
use crate::config::{Config, StoreBackend};
use crate::store::{ContentStore, DirectoryStore};
use crate::sync::{EngineSettings, SyncEngine};
use crate::transport::{RelayClient, RelayServer};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("TARGET"),
    ", built ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser)]
#[command(name = "clipmirror")]
#[command(about = "Mirror the clipboard between two machines")]
#[command(version, long_version = LONG_VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Run this endpoint until interrupted")]
    Run,

    #[command(about = "Run the relay both endpoints connect to")]
    Relay {
        /// Address to listen on (overrides relay.listen_addr)
        #[arg(short, long)]
        listen: Option<String>,
    },

    #[command(about = "Send text to the peer once, without touching the clipboard")]
    SendText { text: String },

    #[command(about = "Configuration management")]
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    #[command(about = "Show current configuration")]
    Show,

    #[command(about = "Generate example configuration")]
    Init {
        #[arg(long)]
        force: bool,
    },

    #[command(about = "Validate configuration")]
    Validate,
}

pub struct CliHandler {
    config_path: Option<PathBuf>,
    config: Option<Arc<Config>>,
}

impl CliHandler {
    pub fn new(config_path: Option<PathBuf>) -> Self {
        Self {
            config_path,
            config: None,
        }
    }

    /// Lazily load the configuration when needed
    fn ensure_config(&mut self) -> Result<Arc<Config>> {
        if let Some(config) = &self.config {
            return Ok(Arc::clone(config));
        }
        let config = Arc::new(
            Config::load_config(self.config_path.as_deref())
                .context("Failed to load configuration")?,
        );
        self.config = Some(Arc::clone(&config));
        Ok(config)
    }

    /// Configuration for commands that act as an endpoint
    fn endpoint_config(&mut self) -> Result<Arc<Config>> {
        let config = self.ensure_config()?;
        config.validate().context("Invalid endpoint configuration")?;
        Ok(config)
    }

    pub async fn handle_command(&mut self, command: Commands) -> Result<()> {
        match command {
            Commands::Run => self.run_endpoint().await,
            Commands::Relay { listen } => self.run_relay(listen).await,
            Commands::SendText { text } => self.send_text(text).await,
            Commands::Config { action } => self.handle_config_action(action),
        }
    }

    async fn connect_relay(config: &Config) -> crate::Result<Arc<RelayClient>> {
        let client = RelayClient::connect(config.relay_client_config()).await?;
        Ok(Arc::new(client))
    }

    async fn open_store(
        config: &Config,
        relay: &Arc<RelayClient>,
    ) -> crate::Result<Arc<dyn ContentStore>> {
        Ok(match config.store.backend {
            StoreBackend::Relay => Arc::clone(relay) as Arc<dyn ContentStore>,
            StoreBackend::Directory => {
                Arc::new(DirectoryStore::open(&config.store.directory).await?)
            }
        })
    }

    /// Relay connection and blob store for an endpoint command
    async fn open_endpoint(
        config: &Config,
    ) -> Result<(Arc<RelayClient>, Arc<dyn ContentStore>)> {
        let relay = Self::connect_relay(config)
            .await
            .with_context(|| format!("Failed to connect to relay at {}", config.relay.url))?;
        let store = Self::open_store(config, &relay)
            .await
            .with_context(|| format!("Failed to open {:?} store", config.store.backend))?;
        Ok((relay, store))
    }

    async fn run_endpoint(&mut self) -> Result<()> {
        let config = self.endpoint_config()?;
        info!(
            "Starting endpoint {} (peer {})",
            config.local_id, config.remote_id
        );

        let clipboard: Arc<dyn ClipboardPort> = Arc::new(
            SystemClipboard::new(config.poll_interval()).context("Failed to open clipboard")?,
        );
        let (relay, store) = Self::open_endpoint(&config).await?;

        let engine = SyncEngine::new(
            EngineSettings::from_config(&config),
            clipboard,
            relay,
            store,
        );

        tokio::select! {
            result = engine.run() => result?,
            _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
        }

        let status = engine.status();
        info!(
            "Published {}, applied {}, dropped {}, failed {}",
            status.published, status.applied, status.dropped, status.failed
        );
        if let Some(last) = status.last_error {
            warn!(
                "Last failure: {} {} at {}: {}",
                last.operation, last.kind, last.at, last.message
            );
        }
        Ok(())
    }

    async fn run_relay(&mut self, listen: Option<String>) -> Result<()> {
        let config = self.ensure_config()?;
        let addr = listen.unwrap_or_else(|| config.relay.listen_addr.clone());

        let server = RelayServer::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind relay to {}", addr))?
            .with_blob_capacity(config.blob_capacity());
        info!(
            "Relay keeps up to {} MiB of blobs",
            config.relay.blob_capacity_mb
        );

        tokio::select! {
            result = server.run() => result?,
            _ = tokio::signal::ctrl_c() => info!("Interrupted, stopping relay"),
        }
        Ok(())
    }

    async fn send_text(&mut self, text: String) -> Result<()> {
        let config = self.endpoint_config()?;
        let (relay, store) = Self::open_endpoint(&config).await?;

        let clipboard = Arc::new(MemoryClipboard::new());
        clipboard.copy(ClipboardSnapshot::text(text));

        let engine = SyncEngine::new(EngineSettings::from_config(&config), clipboard, relay, store);
        engine
            .publish()
            .await
            .with_context(|| format!("Failed to send text to {}", config.remote_id))?;

        println!("Text sent to {}", config.remote_id);
        Ok(())
    }

    fn handle_config_action(&mut self, action: ConfigAction) -> Result<()> {
        match action {
            ConfigAction::Show => {
                let config = self.ensure_config()?;
                println!("{}", toml::to_string_pretty(config.as_ref())?);
            }
            ConfigAction::Init { force } => {
                let path = match &self.config_path {
                    Some(path) => path.clone(),
                    None => Config::default_path().context("Could not find config directory")?,
                };
                Config::write_example(&path, force)?;
                println!("Example configuration written to {}", path.display());
            }
            ConfigAction::Validate => {
                self.endpoint_config()?;
                println!("Configuration is valid");
            }
        }
        Ok(())
    }
}
