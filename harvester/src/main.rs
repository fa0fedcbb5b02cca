mod clock;
mod cms;
mod config;
mod error;
mod media;
mod pipeline;
mod processor;
mod recognition;
mod refill;
mod retry;
mod scheduler;
mod state_store;
mod storage;
#[cfg(test)]
mod testing;

use anyhow::Context;
use clap::Parser;
use clock::SystemClock;
use cms::{CmsApi, CmsClient};
use config::HarvesterConfig;
use error::Result;
use media::FfmpegExtractor;
use processor::InterestProcessor;
use recognition::RecognitionClient;
use refill::RefillController;
use scheduler::HarvestScheduler;
use state_store::StateStore;
use std::sync::Arc;
use storage::{CloudStorage, WebDavStorage};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config/harvester.yaml")]
    config: String,

    /// Log level; RUST_LOG takes precedence
    #[arg(short, long)]
    log_level: Option<String>,

    /// Run a single harvest cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Secrets may come from a local .env
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load configuration
    let config = load_config(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config))?;

    // Initialize logging
    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    init_logging(level, config.logging.json)?;

    info!(
        cms = %config.cms.base_url(),
        storage = %config.storage.url,
        state = %config.state.path.display(),
        "Starting DVR harvester"
    );

    // Create application state
    let app_state = AppState::new(config).context("failed to initialize harvester")?;
    if app_state.config.recognition.enable_recognition {
        info!(url = %app_state.config.recognition.url, "Recognition enabled");
    }
    let shutdown = CancellationToken::new();

    if args.once {
        app_state.scheduler.clone().run_once(shutdown).await?;
        info!("Single cycle finished");
        return Ok(());
    }

    // Stop the loop on SIGINT/SIGTERM
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        signal_token.cancel();
    });

    app_state
        .scheduler
        .clone()
        .run(shutdown)
        .await
        .context("harvest loop stopped on a state file failure")?;

    info!("Shutting down DVR harvester");
    Ok(())
}

fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = FmtSubscriber::builder().with_env_filter(filter);

    let installed = if json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    installed.context("failed to install tracing subscriber")
}

fn load_config(path: &str) -> Result<HarvesterConfig> {
    let settings = ::config::Config::builder()
        .add_source(::config::File::with_name(path).required(false))
        .add_source(::config::Environment::with_prefix("HARVEST").separator("__"))
        .build()?;

    let mut config: HarvesterConfig = settings.try_deserialize()?;
    config.apply_env_secrets();
    config.validate()?;
    Ok(config)
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

// Application state shared across components
pub struct AppState {
    pub config: HarvesterConfig,
    pub scheduler: Arc<HarvestScheduler>,
}

impl AppState {
    pub fn new(config: HarvesterConfig) -> Result<Self> {
        let process = &config.process;
        let clock = Arc::new(SystemClock::new(config.cms.utc_offset_minutes));
        let offset = clock.offset();

        let state = Arc::new(StateStore::new(
            config.state.path.clone(),
            config.state.default_lookback_days,
            clock.clone(),
        ));

        // Upstream services
        let cms: Arc<dyn CmsApi> = Arc::new(CmsClient::new(
            config.cms.clone(),
            process.max_cms_concurrent,
            process.max_cms_per_device,
        )?);
        let storage: Arc<dyn CloudStorage> = Arc::new(WebDavStorage::new(&config.storage)?);
        let recognizer = Arc::new(RecognitionClient::new(&config.recognition)?);
        let extractor = Arc::new(FfmpegExtractor::new(&config.media, process.max_frame_extract));

        let processor = Arc::new(InterestProcessor::new(
            cms.clone(),
            storage,
            extractor,
            recognizer,
            state.clone(),
            &config,
        ));
        let refill = Arc::new(RefillController::new(
            cms.clone(),
            state.clone(),
            clock,
            config.interests.clone(),
            process,
            offset,
        ));
        let scheduler = Arc::new(HarvestScheduler::new(cms, state, refill, processor, process));

        Ok(Self { config, scheduler })
    }
}
