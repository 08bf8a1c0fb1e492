use anyhow::Context;
use clap::Parser;
use screenshot_service::{install_prometheus_recorder, setup_logging, Cli, CliRunner, Config, Metrics};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    setup_logging(args.verbose, args.log_level.as_deref())?;

    info!("Starting screenshot-service v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args)?;

    // The recorder must be installed before any metric handle is registered.
    let prometheus = match install_prometheus_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Metrics disabled: {}", e);
            None
        }
    };
    let metrics = Arc::new(Metrics::new());

    let cli_runner = CliRunner::new(config, metrics)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx);

    let result = cli_runner.run(args.command, shutdown_rx, prometheus).await;

    info!("Shutting down...");
    cli_runner.shutdown().await;

    if let Err(e) = &result {
        error!("Application error: {:#}", e);
    }
    result
}

fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };

    config.apply_env(|key| std::env::var(key).ok())?;

    if let Some(chrome_path) = &args.chrome_path {
        config.chrome_path = Some(chrome_path.clone());
    }

    config.validate()?;

    info!("Configuration loaded successfully");
    info!("Navigation timeout: {}s", config.navigation.timeout_secs);
    info!("Cache TTL: {}s", config.cache_ttl_secs);

    Ok(config)
}

fn setup_shutdown_handler(shutdown_tx: watch::Sender<bool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                let _ = signal::ctrl_c().await;
                info!("Received SIGINT");
                let _ = shutdown_tx.send(true);
                return;
            }
        };

        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }

        let _ = shutdown_tx.send(true);
    })
}
