use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use crate::bus::{MessageBus, RdKafkaBus};
use crate::config::Config;
use crate::processor::{DownstreamProcessor, FilesystemSink, ImageThumbnailProcessor};
use crate::regulator::{CatalogClient, HttpCatalogClient, Regulator};
use crate::scheduler::Scheduler;
use crate::store::{CoordinationStore, RedisStore};
use crate::types::SCHEDULER_PERIOD;

#[derive(Parser)]
#[command(name = "crawl-control-plane")]
#[command(about = "Distributed image-crawl rate regulator, scheduler, and fetcher")]
#[command(version = "0.1.0")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Override MAX_TASKS for this invocation")]
    pub max_tasks: Option<usize>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the source splitter: demultiplex the unified inbound topic onto
    /// per-source topics and register newly seen sources.
    Splitter,

    /// Run the crawl host: rate regulator, fair scheduler, rate-limited
    /// fetcher pool, and structured logger, all in one process.
    CrawlHost {
        #[arg(long, help = "Override the catalog sources endpoint")]
        catalog_url: Option<String>,
    },

    /// Validate a configuration file (or the environment-derived default)
    /// and exit without starting any control loop.
    Validate,
}

/// Loads configuration by layering environment variables over compiled-in
/// defaults, then an optional config file, then CLI overrides, then
/// validates the result. Mirrors the precedence order in §10.1.
pub async fn load_config(args: &Cli) -> Result<Config, crate::error::CrawlError> {
    let mut config = Config::from_env();

    if let Some(path) = &args.config {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            crate::error::CrawlError::Configuration(format!("cannot read {path:?}: {e}"))
        })?;
        config = serde_json::from_str(&content)?;
    }

    if let Some(max_tasks) = args.max_tasks {
        config.max_tasks = max_tasks;
    }

    config.validate()?;
    Ok(config)
}

/// Holds the constructed coordination-store and message-bus clients plus
/// the loaded configuration, and dispatches to whichever mode the operator
/// selected. This is the one place the two process roles described in §5
/// ("splitter" and "crawl host") come together as modes of one binary.
pub struct CliRunner {
    pub config: Config,
    pub store: Arc<dyn CoordinationStore>,
    pub bus: Arc<dyn MessageBus>,
}

impl CliRunner {
    pub async fn new(config: Config) -> Result<Self, crate::error::CrawlError> {
        let store: Arc<dyn CoordinationStore> = Arc::new(RedisStore::connect(&config.redis_host).await?);
        let bus: Arc<dyn MessageBus> = Arc::new(RdKafkaBus::connect(&config.kafka_hosts)?);
        Ok(Self { config, store, bus })
    }

    pub async fn run(&self, command: Commands) -> Result<(), crate::error::CrawlError> {
        match command {
            Commands::Splitter => self.run_splitter().await,
            Commands::CrawlHost { catalog_url } => self.run_crawl_host(catalog_url).await,
            Commands::Validate => self.run_validate(),
        }
    }

    async fn run_splitter(&self) -> Result<(), crate::error::CrawlError> {
        info!("starting source splitter");
        crate::splitter::run(self.store.clone(), self.bus.clone()).await
    }

    async fn run_crawl_host(
        &self,
        catalog_url: Option<String>,
    ) -> Result<(), crate::error::CrawlError> {
        info!("starting crawl host (regulator + scheduler + fetcher + logger)");

        let catalog_url = catalog_url.unwrap_or_else(|| self.config.catalog_sources_url.clone());
        let catalog: Arc<dyn CatalogClient> = Arc::new(HttpCatalogClient::new(catalog_url));

        let rates: crate::logger::RateSnapshot =
            Arc::new(tokio::sync::RwLock::new(HashMap::new()));

        let mut regulator =
            Regulator::new(self.store.clone(), catalog).with_shared_rates(rates.clone());

        let sink = Arc::new(FilesystemSink::new(self.config.thumbnail_dir.clone()));
        let processor: Arc<dyn DownstreamProcessor> = Arc::new(ImageThumbnailProcessor::new(
            self.bus.clone(),
            "image_metadata",
            sink,
            self.config.target_resolution.width,
            self.config.target_resolution.height,
        ));
        let mut scheduler = Scheduler::new(
            self.store.clone(),
            self.bus.clone(),
            processor,
            self.config.max_tasks,
        );

        let mut logger = crate::logger::StructuredLogger::new(
            self.store.clone(),
            rates,
            std::time::Duration::from_secs(self.config.log_frequency_seconds),
        );

        tokio::try_join!(
            regulator.run(),
            scheduler.run(SCHEDULER_PERIOD),
            logger.run(),
        )?;
        Ok(())
    }

    fn run_validate(&self) -> Result<(), crate::error::CrawlError> {
        self.config.validate()?;
        println!("configuration is valid:");
        println!("  redis_host: {}", self.config.redis_host);
        println!("  kafka_hosts: {}", self.config.kafka_hosts);
        println!("  max_tasks: {}", self.config.max_tasks);
        println!("  schedule_size: {}", self.config.schedule_size);
        println!("  log_frequency_seconds: {}", self.config.log_frequency_seconds);
        println!(
            "  target_resolution: {}x{}",
            self.config.target_resolution.width, self.config.target_resolution.height
        );
        Ok(())
    }
}

pub fn setup_logging(verbose: bool) -> Result<(), crate::error::CrawlError> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    Ok(())
}
