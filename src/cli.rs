use crate::{
    AppState, ArtifactBackend, ArtifactStore, BrowserSession, CaptureCoordinator, CaptureOutcome,
    ChromiumRenderer, Config, HealthChecker, HttpArtifactStore, LocalArtifactStore, MemoryCache,
    Metrics, Persistence, RedisRestCache, ResultCache, ScreenshotQuery,
};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Margin added to the navigation timeout for individual CDP commands.
const CDP_TIMEOUT_MARGIN: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(name = "screenshot-service")]
#[command(about = "Web page screenshot service with a shared headless browser")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, global = true, env = "LOG_LEVEL", help = "Log filter, e.g. info or screenshot_service=debug")]
    pub log_level: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP service
    Serve {
        #[arg(short, long, help = "Server port")]
        port: Option<u16>,

        #[arg(long, help = "Bind address")]
        bind: Option<String>,
    },

    /// Take a single screenshot
    Capture {
        #[arg(short, long, help = "URL to screenshot")]
        url: String,

        #[arg(short, long, help = "Output file, required unless storage is configured")]
        output: Option<PathBuf>,

        #[arg(long, help = "Viewport width")]
        width: Option<u32>,

        #[arg(long, help = "Viewport height")]
        height: Option<u32>,

        #[arg(long, help = "CSS selector for element screenshot")]
        selector: Option<String>,

        #[arg(long)]
        clip_x: Option<u32>,

        #[arg(long)]
        clip_y: Option<u32>,

        #[arg(long)]
        clip_width: Option<u32>,

        #[arg(long)]
        clip_height: Option<u32>,
    },

    /// Validate configuration
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Default)]
pub struct CaptureOptions {
    pub url: String,
    pub output: Option<PathBuf>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub selector: Option<String>,
    pub clip_x: Option<u32>,
    pub clip_y: Option<u32>,
    pub clip_width: Option<u32>,
    pub clip_height: Option<u32>,
}

impl CaptureOptions {
    /// Route CLI flags through the same normalization as HTTP queries.
    pub fn to_query(&self) -> ScreenshotQuery {
        let text = |value: Option<u32>| value.map(|v| v.to_string());
        ScreenshotQuery {
            url: Some(self.url.clone()),
            width: text(self.width),
            height: text(self.height),
            selector: self.selector.clone(),
            clip_x: text(self.clip_x),
            clip_y: text(self.clip_y),
            clip_width: text(self.clip_width),
            clip_height: text(self.clip_height),
        }
    }
}

/// Build the artifact store and result cache described by `config`.
pub fn persistence_from_config(config: &Config) -> Option<Persistence> {
    let store: Arc<dyn ArtifactStore> = match config.storage.artifact.as_ref()? {
        ArtifactBackend::Http { endpoint, token } => {
            Arc::new(HttpArtifactStore::new(endpoint.clone(), token.clone()))
        }
        ArtifactBackend::Local {
            dir,
            public_base_url,
        } => Arc::new(LocalArtifactStore::new(dir.clone(), public_base_url.clone())),
    };

    let cache: Arc<dyn ResultCache> = match &config.storage.kv {
        Some(kv) => Arc::new(RedisRestCache::new(kv.url.clone(), kv.token.clone())),
        None => Arc::new(MemoryCache::new()),
    };

    Some(Persistence {
        store,
        cache,
        ttl: config.cache_ttl(),
    })
}

pub struct CliRunner {
    pub config: Config,
    pub coordinator: Arc<CaptureCoordinator>,
}

impl CliRunner {
    pub fn new(config: Config, metrics: Arc<Metrics>) -> anyhow::Result<Self> {
        let navigation = config.navigation.wait();
        let renderer = Arc::new(ChromiumRenderer::new(navigation.timeout + CDP_TIMEOUT_MARGIN));
        let session = Arc::new(BrowserSession::new(
            renderer,
            config.launch_options(),
            config.lifecycle,
            metrics.clone(),
        ));

        let mut coordinator = CaptureCoordinator::new(session, navigation, metrics);
        if let Some(persistence) = persistence_from_config(&config) {
            coordinator = coordinator.with_persistence(persistence);
        }

        info!(
            "Browser mode {:?}, lifecycle {:?}, output {}",
            config.mode,
            config.lifecycle,
            if coordinator.persists() { "artifact URL" } else { "raw bytes" }
        );

        Ok(Self {
            config,
            coordinator: Arc::new(coordinator),
        })
    }

    pub async fn run(
        &self,
        command: Commands,
        shutdown: watch::Receiver<bool>,
        prometheus: Option<PrometheusHandle>,
    ) -> anyhow::Result<()> {
        match command {
            Commands::Serve { port, bind } => {
                self.run_server(port, bind, shutdown, prometheus).await
            }
            Commands::Capture {
                url,
                output,
                width,
                height,
                selector,
                clip_x,
                clip_y,
                clip_width,
                clip_height,
            } => {
                self.run_capture(CaptureOptions {
                    url,
                    output,
                    width,
                    height,
                    selector,
                    clip_x,
                    clip_y,
                    clip_width,
                    clip_height,
                })
                .await
            }
            Commands::Validate { config } => validate_config_file(&config),
        }
    }

    pub async fn run_server(
        &self,
        port: Option<u16>,
        bind: Option<String>,
        shutdown: watch::Receiver<bool>,
        prometheus: Option<PrometheusHandle>,
    ) -> anyhow::Result<()> {
        let bind = bind.unwrap_or_else(|| self.config.server.bind.clone());
        let port = port.unwrap_or(self.config.server.port);
        let addr: SocketAddr = format!("{bind}:{port}")
            .parse()
            .with_context(|| format!("invalid bind address {bind}:{port}"))?;

        let state = Arc::new(AppState {
            coordinator: self.coordinator.clone(),
            default_viewport: self.config.viewport,
            health: HealthChecker::default(),
            prometheus,
        });

        crate::serve(addr, state, shutdown).await?;
        Ok(())
    }

    pub async fn run_capture(&self, options: CaptureOptions) -> anyhow::Result<()> {
        info!("Taking screenshot of: {}", options.url);

        let request = options.to_query().into_request(self.config.viewport)?;
        if !self.coordinator.persists() && options.output.is_none() {
            bail!("--output is required when no artifact storage is configured");
        }

        match self.coordinator.capture(&request).await? {
            CaptureOutcome::Bytes(bytes) => {
                let Some(output) = options.output else {
                    bail!("--output is required for raw captures");
                };
                if let Some(parent) = output.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::write(&output, &bytes).await?;

                println!("Screenshot captured successfully:");
                println!("  URL: {}", request.url);
                println!("  Output: {}", output.display());
                println!("  Size: {}", crate::format_bytes(bytes.len()));
            }
            CaptureOutcome::Artifact { url } => {
                println!("{url}");
            }
        }

        Ok(())
    }

    pub async fn shutdown(&self) {
        self.coordinator.session().shutdown().await;
    }
}

pub fn validate_config_file(path: &Path) -> anyhow::Result<()> {
    println!("Validating configuration: {}", path.display());

    let config = Config::from_file(path)?;
    config.validate()?;

    println!("Configuration is valid:");
    println!("  Mode: {:?}", config.mode);
    println!("  Lifecycle: {:?}", config.lifecycle);
    println!(
        "  Viewport: {}x{}",
        config.viewport.width, config.viewport.height
    );
    println!("  Navigation timeout: {}s", config.navigation.timeout_secs);
    println!(
        "  Storage: {}",
        match &config.storage.artifact {
            Some(ArtifactBackend::Http { endpoint, .. }) => format!("blob API at {endpoint}"),
            Some(ArtifactBackend::Local { dir, .. }) => format!("directory {}", dir.display()),
            None => "none (raw bytes)".to_string(),
        }
    );

    Ok(())
}

/// Install the global fmt subscriber.
///
/// An explicit `level` (from `--log-level` or `LOG_LEVEL`) wins over
/// `--verbose`.
pub fn setup_logging(verbose: bool, level: Option<&str>) -> anyhow::Result<()> {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_new(level.unwrap_or(default))
        .with_context(|| format!("invalid log filter {:?}", level.unwrap_or(default)))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install logger: {e}"))?;

    Ok(())
}
