//! Capture request model and query normalization
//!
//! Every entry point (HTTP query, CLI flags) funnels through
//! [`ScreenshotQuery::into_request`] so that cache keys are always built from
//! the same normalized shape.

use crate::{validate_url, ScreenshotError};
use serde::{Deserialize, Serialize};

/// Browser viewport used for a capture
///
/// # Examples
///
/// ```rust
/// use screenshot_service::Viewport;
///
/// let desktop = Viewport::default();
/// assert_eq!((desktop.width, desktop.height), (1920, 1080));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Viewport {
    /// Viewport width in CSS pixels (default: 1920)
    pub width: u32,
    /// Viewport height in CSS pixels (default: 1080)
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

/// Capture rectangle in CSS pixels.
///
/// For page captures the origin is the page's top-left corner; for element
/// captures it is the element's top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Clip {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// A fully normalized screenshot request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub url: String,
    pub viewport: Viewport,
    pub selector: Option<String>,
    pub clip: Option<Clip>,
}

impl CaptureRequest {
    /// Full-page capture of `url` at the default viewport.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            viewport: Viewport::default(),
            selector: None,
            clip: None,
        }
    }

    pub fn with_viewport(mut self, width: u32, height: u32) -> Self {
        self.viewport = Viewport { width, height };
        self
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn with_clip(mut self, clip: Clip) -> Self {
        self.clip = Some(clip);
        self
    }
}

/// Result of a capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Raw PNG bytes, returned when no durable storage is configured.
    Bytes(Vec<u8>),
    /// Public URL of the stored artifact.
    Artifact { url: String },
}

/// Raw, unvalidated request parameters as they arrive on `GET /screenshot`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScreenshotQuery {
    pub url: Option<String>,
    pub width: Option<String>,
    pub height: Option<String>,
    pub selector: Option<String>,
    pub clip_x: Option<String>,
    pub clip_y: Option<String>,
    pub clip_width: Option<String>,
    pub clip_height: Option<String>,
}

impl ScreenshotQuery {
    /// Validate the raw parameters and fill in defaults.
    ///
    /// A clip is present as soon as any `clip_*` parameter is given; the
    /// missing coordinates default to 0 and the missing extent to the
    /// viewport size.
    pub fn into_request(self, defaults: Viewport) -> Result<CaptureRequest, ScreenshotError> {
        let url = match self.url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => return Err(ScreenshotError::MissingUrl),
        };
        validate_url(&url)
            .map_err(|e| ScreenshotError::InvalidRequest(format!("invalid url {url:?}: {e}")))?;

        let viewport = Viewport {
            width: parse_positive("width", self.width.as_deref())?.unwrap_or(defaults.width),
            height: parse_positive("height", self.height.as_deref())?.unwrap_or(defaults.height),
        };

        let selector = match self.selector {
            Some(selector) if selector.trim().is_empty() => {
                return Err(ScreenshotError::InvalidRequest(
                    "selector must not be blank".to_string(),
                ))
            }
            other => other,
        };

        let clip_x = parse_non_negative("clip_x", self.clip_x.as_deref())?;
        let clip_y = parse_non_negative("clip_y", self.clip_y.as_deref())?;
        let clip_width = parse_positive("clip_width", self.clip_width.as_deref())?;
        let clip_height = parse_positive("clip_height", self.clip_height.as_deref())?;

        let clip = if clip_x.is_some()
            || clip_y.is_some()
            || clip_width.is_some()
            || clip_height.is_some()
        {
            Some(Clip {
                x: clip_x.unwrap_or(0),
                y: clip_y.unwrap_or(0),
                width: clip_width.unwrap_or(viewport.width),
                height: clip_height.unwrap_or(viewport.height),
            })
        } else {
            None
        };

        Ok(CaptureRequest {
            url,
            viewport,
            selector,
            clip,
        })
    }
}

fn parse_non_negative(name: &str, raw: Option<&str>) -> Result<Option<u32>, ScreenshotError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value.parse::<u32>().map(Some).map_err(|_| {
            ScreenshotError::InvalidRequest(format!(
                "{name} must be a non-negative integer, got {value:?}"
            ))
        }),
    }
}

fn parse_positive(name: &str, raw: Option<&str>) -> Result<Option<u32>, ScreenshotError> {
    match parse_non_negative(name, raw)? {
        Some(0) => Err(ScreenshotError::InvalidRequest(format!(
            "{name} must be greater than 0"
        ))),
        other => Ok(other),
    }
}
