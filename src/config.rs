//! Configuration management with serde serialization/deserialization
//!
//! Settings come from three layers, later ones winning: built-in defaults, an
//! optional JSON file, then environment variables (see [`Config::apply_env`]).

use crate::{LaunchOptions, NavigationWait, ScreenshotError, Viewport};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Main configuration structure for the screenshot service
///
/// # Examples
///
/// ```rust
/// use screenshot_service::{BrowserLifecycle, Config, DeploymentMode};
///
/// let config = Config::default();
/// assert_eq!(config.mode, DeploymentMode::Unconstrained);
/// assert_eq!(config.lifecycle, BrowserLifecycle::PerCapture);
///
/// let production = Config {
///     mode: DeploymentMode::Constrained,
///     lifecycle: BrowserLifecycle::Persistent,
///     ..Default::default()
/// };
/// assert!(production.headless());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Selects the browser launch flags (default: unconstrained)
    pub mode: DeploymentMode,

    /// Whether the browser outlives a capture (default: per-capture)
    pub lifecycle: BrowserLifecycle,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Force headless on or off. When unset, constrained mode runs headless
    /// and unconstrained mode runs headed.
    pub headless: Option<bool>,

    /// Viewport applied when a request does not specify one
    pub viewport: Viewport,

    pub navigation: NavigationConfig,

    /// Lifetime of cached artifact URLs in seconds (default: 7200)
    pub cache_ttl_secs: u64,

    pub storage: StorageConfig,

    pub server: ServerConfig,

    /// Custom User-Agent string passed to the browser
    pub user_agent: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: DeploymentMode::Unconstrained,
            lifecycle: BrowserLifecycle::PerCapture,
            chrome_path: None,
            headless: None,
            viewport: Viewport::default(),
            navigation: NavigationConfig::default(),
            cache_ttl_secs: 7200,
            storage: StorageConfig::default(),
            server: ServerConfig::default(),
            user_agent: None,
        }
    }
}

/// Where the renderer runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// Serverless or otherwise resource-limited hosts
    Constrained,
    /// Local development machines
    Unconstrained,
}

impl FromStr for DeploymentMode {
    type Err = ScreenshotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "constrained" | "serverless" => Ok(Self::Constrained),
            "unconstrained" | "local" => Ok(Self::Unconstrained),
            other => Err(ScreenshotError::ConfigurationError(format!(
                "unknown browser mode {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BrowserLifecycle {
    /// One browser shared by every request until it disconnects
    Persistent,
    /// The browser is closed once no capture is using it
    PerCapture,
}

impl FromStr for BrowserLifecycle {
    type Err = ScreenshotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "persistent" => Ok(Self::Persistent),
            "per-capture" | "per_capture" => Ok(Self::PerCapture),
            other => Err(ScreenshotError::ConfigurationError(format!(
                "unknown browser lifecycle {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct NavigationConfig {
    /// Hard limit for a navigation (default: 45)
    pub timeout_secs: u64,
    /// Quiet period required before capturing (default: 500)
    pub idle_ms: u64,
    /// Requests allowed to stay in flight during the quiet period (default: 2)
    pub max_inflight: usize,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        let wait = NavigationWait::default();
        Self {
            timeout_secs: wait.timeout.as_secs(),
            idle_ms: wait.idle_window.as_millis() as u64,
            max_inflight: wait.max_inflight,
        }
    }
}

impl NavigationConfig {
    pub fn wait(&self) -> NavigationWait {
        NavigationWait {
            timeout: Duration::from_secs(self.timeout_secs),
            idle_window: Duration::from_millis(self.idle_ms),
            max_inflight: self.max_inflight,
        }
    }
}

/// Durable storage settings. With no artifact backend the service answers
/// with raw image bytes and caches nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub artifact: Option<ArtifactBackend>,
    /// Redis REST endpoint; an in-process cache is used when absent
    pub kv: Option<KvConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ArtifactBackend {
    Http {
        endpoint: String,
        token: String,
    },
    Local {
        dir: PathBuf,
        public_base_url: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct KvConfig {
    pub url: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

impl Config {
    /// Read a JSON configuration file; missing fields take their defaults.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ScreenshotError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            ScreenshotError::ConfigurationError(format!("{}: {}", path.display(), e))
        })
    }

    /// Overlay environment variables onto this configuration.
    ///
    /// `lookup` is normally `|k| std::env::var(k).ok()`; tests pass a map.
    /// `APP_ENV` is applied first so that `BROWSER_MODE` and
    /// `BROWSER_LIFECYCLE` can refine it.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ScreenshotError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(env) = var("APP_ENV") {
            match env.trim().to_ascii_lowercase().as_str() {
                "production" => {
                    self.mode = DeploymentMode::Constrained;
                    self.lifecycle = BrowserLifecycle::Persistent;
                }
                "development" => {
                    self.mode = DeploymentMode::Unconstrained;
                    self.lifecycle = BrowserLifecycle::PerCapture;
                }
                other => {
                    return Err(ScreenshotError::ConfigurationError(format!(
                        "APP_ENV must be production or development, got {other:?}"
                    )))
                }
            }
        }

        if let Some(mode) = var("BROWSER_MODE") {
            self.mode = mode.parse()?;
        }
        if let Some(lifecycle) = var("BROWSER_LIFECYCLE") {
            self.lifecycle = lifecycle.parse()?;
        }
        if let Some(path) = var("CHROME_PATH") {
            self.chrome_path = Some(path);
        }
        if let Some(headless) = var("HEADLESS") {
            self.headless = Some(parse_env("HEADLESS", &headless)?);
        }
        if let Some(bind) = var("BIND") {
            self.server.bind = bind;
        }
        if let Some(port) = var("PORT") {
            self.server.port = parse_env("PORT", &port)?;
        }
        if let Some(timeout) = var("NAVIGATION_TIMEOUT_SECS") {
            self.navigation.timeout_secs = parse_env("NAVIGATION_TIMEOUT_SECS", &timeout)?;
        }
        if let Some(idle) = var("NETWORK_IDLE_MS") {
            self.navigation.idle_ms = parse_env("NETWORK_IDLE_MS", &idle)?;
        }
        if let Some(inflight) = var("NETWORK_IDLE_MAX_INFLIGHT") {
            self.navigation.max_inflight = parse_env("NETWORK_IDLE_MAX_INFLIGHT", &inflight)?;
        }
        if let Some(ttl) = var("CACHE_TTL_SECS") {
            self.cache_ttl_secs = parse_env("CACHE_TTL_SECS", &ttl)?;
        }
        if let Some(agent) = var("USER_AGENT") {
            self.user_agent = Some(agent);
        }

        match (var("BLOB_API_URL"), var("BLOB_TOKEN")) {
            (Some(endpoint), Some(token)) => {
                self.storage.artifact = Some(ArtifactBackend::Http { endpoint, token });
            }
            (None, None) => {}
            _ => {
                return Err(ScreenshotError::ConfigurationError(
                    "BLOB_API_URL and BLOB_TOKEN must be set together".to_string(),
                ))
            }
        }

        match (var("ARTIFACT_DIR"), var("ARTIFACT_PUBLIC_URL")) {
            (Some(dir), Some(public_base_url)) => {
                if matches!(self.storage.artifact, Some(ArtifactBackend::Http { .. })) {
                    return Err(ScreenshotError::ConfigurationError(
                        "configure either BLOB_API_URL or ARTIFACT_DIR, not both".to_string(),
                    ));
                }
                self.storage.artifact = Some(ArtifactBackend::Local {
                    dir: PathBuf::from(dir),
                    public_base_url,
                });
            }
            (None, None) => {}
            _ => {
                return Err(ScreenshotError::ConfigurationError(
                    "ARTIFACT_DIR and ARTIFACT_PUBLIC_URL must be set together".to_string(),
                ))
            }
        }

        match (var("KV_REST_API_URL"), var("KV_REST_API_TOKEN")) {
            (Some(url), Some(token)) => self.storage.kv = Some(KvConfig { url, token }),
            (None, None) => {}
            _ => {
                return Err(ScreenshotError::ConfigurationError(
                    "KV_REST_API_URL and KV_REST_API_TOKEN must be set together".to_string(),
                ))
            }
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ScreenshotError> {
        let fail = |msg: &str| Err(ScreenshotError::ConfigurationError(msg.to_string()));

        if self.viewport.width == 0 || self.viewport.height == 0 {
            return fail("viewport dimensions must be greater than 0");
        }
        if self.navigation.timeout_secs == 0 {
            return fail("navigation timeout must be greater than 0");
        }
        if self.navigation.idle_ms == 0 {
            return fail("network idle window must be greater than 0");
        }
        if self.cache_ttl_secs == 0 {
            return fail("cache TTL must be greater than 0");
        }

        match &self.storage.artifact {
            Some(ArtifactBackend::Http { endpoint, token }) => {
                if endpoint.trim().is_empty() || token.trim().is_empty() {
                    return fail("blob store needs both an endpoint and a token");
                }
            }
            Some(ArtifactBackend::Local {
                dir,
                public_base_url,
            }) => {
                if dir.as_os_str().is_empty() || public_base_url.trim().is_empty() {
                    return fail("local store needs both a directory and a public base URL");
                }
            }
            None => {}
        }

        if let Some(kv) = &self.storage.kv {
            if kv.url.trim().is_empty() || kv.token.trim().is_empty() {
                return fail("KV store needs both a URL and a token");
            }
            if self.storage.artifact.is_none() {
                return fail("a KV store is configured but no artifact store");
            }
        }

        Ok(())
    }

    pub fn headless(&self) -> bool {
        self.headless.unwrap_or(self.mode == DeploymentMode::Constrained)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn launch_options(&self) -> LaunchOptions {
        LaunchOptions {
            executable: self.chrome_path.clone(),
            headless: self.headless(),
            args: launch_args(self),
            default_viewport: self.viewport,
        }
    }
}

fn parse_env<T: FromStr>(key: &str, raw: &str) -> Result<T, ScreenshotError> {
    raw.trim().parse().map_err(|_| {
        ScreenshotError::ConfigurationError(format!("{key} has an invalid value {raw:?}"))
    })
}

/// Flag set for serverless hosts: single process, no sandbox, minimal
/// background work.
const CONSTRAINED_ARGS: &[&str] = &[
    "--disable-background-networking",
    "--disable-background-timer-throttling",
    "--disable-backgrounding-occluded-windows",
    "--disable-breakpad",
    "--disable-component-update",
    "--disable-default-apps",
    "--disable-dev-shm-usage",
    "--disable-extensions",
    "--disable-renderer-backgrounding",
    "--disable-sync",
    "--hide-scrollbars",
    "--mute-audio",
    "--no-default-browser-check",
    "--no-first-run",
    "--no-sandbox",
    "--no-zygote",
    "--single-process",
    "--use-gl=swiftshader",
];

const UNCONSTRAINED_ARGS: &[&str] = &[
    "--no-sandbox",
    "--disable-setuid-sandbox",
    "--disable-infobars",
    "--disable-gpu",
    "--window-position=0,0",
    "--ignore-certificate-errors",
    "--ignore-certificate-errors-spki-list",
];

/// Chrome command-line flags for the configured deployment mode
///
/// # Examples
///
/// ```rust
/// use screenshot_service::{launch_args, Config, DeploymentMode};
///
/// let config = Config {
///     mode: DeploymentMode::Unconstrained,
///     ..Default::default()
/// };
/// assert!(launch_args(&config).contains(&"--disable-setuid-sandbox".to_string()));
/// ```
pub fn launch_args(config: &Config) -> Vec<String> {
    let base = match config.mode {
        DeploymentMode::Constrained => CONSTRAINED_ARGS,
        DeploymentMode::Unconstrained => UNCONSTRAINED_ARGS,
    };

    let mut args: Vec<String> = base.iter().map(|flag| flag.to_string()).collect();

    if let Some(user_agent) = &config.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }

    args
}
