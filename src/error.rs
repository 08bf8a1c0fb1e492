use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ScreenshotError {
    #[error("URL is required")]
    MissingUrl,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Renderer unavailable: {0}")]
    RendererUnavailable(String),

    #[error("Navigation timed out after {0:?}")]
    NavigationTimeout(Duration),

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Selector not found: {0}")]
    SelectorNotFound(String),

    #[error("Screenshot capture failed: {0}")]
    CaptureFailed(String),

    #[error("Page error: {0}")]
    PageError(String),

    #[error("Artifact store error: {0}")]
    ArtifactStore(String),

    #[error("Cache store error: {0}")]
    CacheStore(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl ScreenshotError {
    /// Caller-side failures are expected traffic; everything else points at
    /// the renderer or one of the external stores.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ScreenshotError::MissingUrl
            | ScreenshotError::InvalidRequest(_)
            | ScreenshotError::SelectorNotFound(_) => ErrorSeverity::Low,
            ScreenshotError::NavigationTimeout(_)
            | ScreenshotError::NavigationFailed(_)
            | ScreenshotError::PageError(_)
            | ScreenshotError::CaptureFailed(_) => ErrorSeverity::Medium,
            ScreenshotError::ConfigurationError(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::High,
        }
    }

    /// HTTP status code reported for this failure.
    pub fn status(&self) -> u16 {
        match self {
            ScreenshotError::MissingUrl | ScreenshotError::InvalidRequest(_) => 400,
            ScreenshotError::SelectorNotFound(_) => 404,
            ScreenshotError::NavigationFailed(_) => 502,
            ScreenshotError::RendererUnavailable(_) => 503,
            ScreenshotError::NavigationTimeout(_) => 504,
            _ => 500,
        }
    }

    /// Body text sent to HTTP clients.
    pub fn public_message(&self) -> String {
        match self {
            ScreenshotError::SelectorNotFound(_) => "Selector not found".to_string(),
            ScreenshotError::ArtifactStore(_) | ScreenshotError::CacheStore(_) => {
                "Internal storage error".to_string()
            }
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl From<std::io::Error> for ScreenshotError {
    fn from(err: std::io::Error) -> Self {
        ScreenshotError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ScreenshotError {
    fn from(err: serde_json::Error) -> Self {
        ScreenshotError::SerializationError(err.to_string())
    }
}

impl From<reqwest::Error> for ScreenshotError {
    fn from(err: reqwest::Error) -> Self {
        ScreenshotError::IoError(err.to_string())
    }
}

impl From<chromiumoxide::error::CdpError> for ScreenshotError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        ScreenshotError::PageError(err.to_string())
    }
}
