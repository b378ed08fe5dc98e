use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::filter::{Directive, EnvFilter, LevelFilter};

use glowd::config::{LogLevel, LoggingConfig};
use glowd::{api, Config, Engine, JsonFileStore, MemoryStore, Store};

#[derive(Parser)]
#[command(
    name = "glowd",
    about = "Auto-off countdown and motion automations for light entities"
)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "glowd.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    init_tracing(&config.logging);

    tracing::info!("glowd starting");
    tracing::info!("Loaded config from: {}", args.config.display());

    let store: Arc<dyn Store> = match &config.store.path {
        Some(path) => Arc::new(
            JsonFileStore::open(path)
                .with_context(|| format!("failed to open store at {}", path.display()))?,
        ),
        None => {
            tracing::warn!("no store path configured, countdowns will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let mut engine = Engine::new(&config, store);
    engine.register_gateways_from_config(&config);
    let handle = engine.handle();

    let engine_task = tokio::spawn(engine.run());

    let (api_shutdown_tx, api_shutdown_rx) = tokio::sync::oneshot::channel();
    let api_task = match &config.api {
        Some(api_config) if api_config.enabled => {
            let listen = api_config.listen.clone();
            let port = api_config.port;
            Some(tokio::spawn(async move {
                if let Err(e) = api::serve(listen, port, handle, api_shutdown_rx).await {
                    tracing::error!("HTTP API server failed: {}", e);
                }
            }))
        }
        _ => None,
    };

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received shutdown signal");
        }
        Err(e) => {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
    }

    let _ = api_shutdown_tx.send(());
    if let Some(task) = api_task {
        let _ = task.await;
    }
    engine_task.abort();

    tracing::info!("glowd shutdown complete");

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let mut filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from(logging.level).into())
        .parse_lossy("");

    for (module, level) in &logging.overrides {
        match format!("{}={}", module, level_name(*level)).parse::<Directive>() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("Ignoring invalid log override for '{}': {}", module, e),
        }
    }

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn level_name(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}
