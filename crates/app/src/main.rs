mod fallback;
mod rpc;
mod server;

use anyhow::{Context, Result};
use dexquote_builders::BuilderRegistry;
use dexquote_cache::PriceCache;
use dexquote_config::load_from_env_or_default;
use dexquote_ingestion::IngestionService;
use fallback::PriceFallback;
use rpc::RpcClient;
use server::{run_server, AppState};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "configs/dev.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let cli_config = parse_config_arg();
    let default_path = cli_config.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let (config, loaded_config_path) = load_from_env_or_default(&default_path)?;

    init_tracing(&config.system.log_level, config.system.log_json);
    info!(
        config_path = %loaded_config_path.display(),
        env = %config.system.env,
        provider = %config.source.provider,
        "configuration loaded"
    );

    let registry = Arc::new(BuilderRegistry::new());
    let cache = Arc::new(PriceCache::with_megabytes(
        config.cache.max_megabytes,
        config.cache.cleanup_threshold,
    ));

    let mut ingestion =
        IngestionService::build(&config.source, registry.supported_program_ids())
            .context("failed to initialize ingestion service")?;

    let state = Arc::new(AppState {
        cache: Arc::clone(&cache),
        registry: Arc::clone(&registry),
        fallback: PriceFallback::new(&config.fallback)
            .context("failed to initialize price fallback")?,
        rpc: RpcClient::new(&config.rpc).context("failed to initialize rpc client")?,
        started_at: Instant::now(),
    });

    let ingest_task: JoinHandle<()> = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move {
            loop {
                match ingestion.next_record().await {
                    Ok(Some(record)) => {
                        for observation in ingestion.process(&record) {
                            debug!(
                                mint = %observation.mint,
                                avg_price = observation.avg_price,
                                program_id = %observation.program_id,
                                slot = %observation.slot,
                                "price observation stored"
                            );
                            cache.put(observation);
                        }
                    }
                    Ok(None) => {
                        info!("transaction source closed; ingestion loop exiting");
                        return;
                    }
                    Err(error) => {
                        warn!(error = %error, "ingestion error; continuing");
                    }
                }
            }
        })
    };

    let server = run_server(Arc::clone(&state), &config.api);

    tokio::select! {
        result = server => {
            result.context("api server exited")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    // Orderly shutdown: stop the stream task, drop the volatile index, exit.
    ingest_task.abort();
    cache.clear();
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed installing SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn parse_config_arg() -> Option<PathBuf> {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(inline) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(inline));
        }
    }
    None
}

fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    if json {
        tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(filter)
            .compact()
            .init();
    }
}
