//! Command-line interface for Nerva.
//!
//! Run `nerva` to keep the consolidation cache fresh until Ctrl-C, or use
//! `--once`, `--status` and `--check-config` for one-shot operations.

use crate::application::Application;
use crate::core::config::ConfigBuilder;
use crate::core::{Config, NervaError, Result, ValidationMode};
use clap::Parser;
use std::path::PathBuf;

/// Resilient telemetry collector and consolidation cache.
#[derive(Parser, Debug)]
#[command(name = "nerva")]
#[command(version, about, long_about = None)]
#[command(disable_version_flag = true)]
pub struct Cli {
    /// Configuration file path (default: ~/.config/nerva/config.yaml)
    #[arg(short, long, env = "NERVA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Durable cache file location
    #[arg(long, env = "NERVA_CACHE_PATH")]
    pub cache_path: Option<PathBuf>,

    /// Upstream API key
    #[arg(long, env = "NEW_RELIC_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Upstream account id
    #[arg(long, env = "NEW_RELIC_ACCOUNT_ID")]
    pub account_id: Option<String>,

    /// Entity validity policy: relaxed or rigorous
    #[arg(long, env = "NERVA_VALIDATION_MODE")]
    pub validation_mode: Option<ValidationMode>,

    /// Enable debug logging
    #[arg(short, long, env = "NERVA_DEBUG")]
    pub debug: bool,

    /// Run a single refresh and exit
    #[arg(long)]
    pub once: bool,

    /// Print the health report as JSON and exit
    #[arg(long)]
    pub status: bool,

    /// Validate configuration and exit
    #[arg(long)]
    pub check_config: bool,

    /// Show version information
    #[arg(short = 'V', long = "show-version")]
    pub version: bool,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Config file to read, and whether the user asked for it explicitly.
    fn config_path(&self) -> (PathBuf, bool) {
        match &self.config {
            Some(path) => (path.clone(), true),
            None => {
                let default_path = dirs::config_dir()
                    .map(|d| d.join("nerva").join("config.yaml"))
                    .unwrap_or_else(|| PathBuf::from("~/.config/nerva/config.yaml"));
                (default_path, false)
            },
        }
    }

    /// Load configuration with proper precedence:
    /// 1. CLI arguments and environment variables (highest priority)
    /// 2. Config file
    /// 3. Defaults (lowest priority)
    pub async fn load_config(&self) -> Result<Config> {
        let mut builder = ConfigBuilder::new();
        let (config_path, explicit) = self.config_path();

        match tokio::fs::read_to_string(&config_path).await {
            Ok(content) => {
                builder = builder.from_yaml(&content)?;
            },
            Err(e) if explicit => {
                return Err(NervaError::config(format!(
                    "Failed to read config file {:?}: {}",
                    config_path, e
                )));
            },
            Err(_) => {},
        }

        self.build_config_from_args(builder)
    }

    fn build_config_from_args(&self, mut builder: ConfigBuilder) -> Result<Config> {
        if let Some(path) = &self.cache_path {
            builder = builder.cache_path(path.clone());
        }
        if let Some(key) = &self.api_key {
            builder = builder.api_key(key.clone());
        }
        if let Some(account) = &self.account_id {
            builder = builder.account_id(account.clone());
        }
        if let Some(mode) = self.validation_mode {
            builder = builder.validation_mode(mode);
        }

        builder.debug(self.debug).build()
    }
}

/// Filter directive used when `RUST_LOG` is unset.
///
/// Debug mode wins, then `NERVA_LOG_LEVEL`, then the configured level.
fn default_log_level(config: &Config, env_level: Option<String>) -> String {
    if config.debug {
        return "debug".to_string();
    }
    env_level.unwrap_or_else(|| config.logging.level.as_str().to_string())
}

/// Initialize logging from the loaded configuration.
///
/// `RUST_LOG` overrides everything else.
pub fn init_logging(config: &Config) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let logging = &config.logging;
    let log_level = default_log_level(config, std::env::var("NERVA_LOG_LEVEL").ok());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));

    let fmt_layer = if logging.structured {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true)
            .compact()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).compact()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| NervaError::config(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// Execute the Nerva application.
pub async fn execute(cli: Cli) -> Result<()> {
    if cli.version {
        println!("nerva {}", env!("CARGO_PKG_VERSION"));
        println!("Resilient telemetry collector and consolidation cache");
        return Ok(());
    }

    let config = cli.load_config().await?;
    init_logging(&config)?;
    tracing::debug!("Configuration source: {:?}", cli.config_path().0);

    if cli.check_config {
        config.validate()?;
        let credentials = if config.upstream.credentials().is_ok() {
            "present"
        } else {
            "missing"
        };
        println!("Configuration is valid!");
        println!("  Endpoint: {}", config.upstream.endpoint);
        println!("  Credentials: {}", credentials);
        println!("  Domains: {:?}", config.domains());
        println!("  Validation mode: {:?}", config.validation.mode);
        println!("  Cache file: {}", config.cache.path.display());
        return Ok(());
    }

    let app = Application::new(config)?;

    if cli.status {
        app.restore().await;
        println!("{}", serde_json::to_string_pretty(&app.health())?);
        return Ok(());
    }

    if cli.once {
        app.restore().await;
        let outcome = app.refresh_once().await?;
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    app.run().await
}
