//! Headless renderer capability
//!
//! The coordinator and the browser session only see these traits. The
//! production implementation lives in [`crate::chromium`]; tests drive an
//! in-process fake.

use crate::{Clip, ScreenshotError, Viewport};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Everything needed to start a renderer process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions {
    /// Browser executable, or `None` to auto-detect
    pub executable: Option<String>,
    pub headless: bool,
    /// Extra command-line flags
    pub args: Vec<String>,
    pub default_viewport: Viewport,
}

/// Bounded wait applied to every navigation.
///
/// Navigation is complete once no more than `max_inflight` requests have been
/// pending for `idle_window`; the whole navigation fails after `timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavigationWait {
    pub timeout: Duration,
    pub idle_window: Duration,
    pub max_inflight: usize,
}

impl Default for NavigationWait {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(45),
            idle_window: Duration::from_millis(500),
            max_inflight: 2,
        }
    }
}

/// Axis-aligned rectangle in CSS pixels with fractional coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl From<Clip> for Rect {
    fn from(clip: Clip) -> Self {
        Self {
            x: clip.x as f64,
            y: clip.y as f64,
            width: clip.width as f64,
            height: clip.height as f64,
        }
    }
}

/// Translate an element-relative clip into page coordinates, cropped to the
/// element's bounds.
pub fn element_clip(bounds: Rect, clip: Option<Clip>) -> Result<Rect, ScreenshotError> {
    let Some(clip) = clip else {
        return Ok(bounds);
    };

    let x = bounds.x + clip.x as f64;
    let y = bounds.y + clip.y as f64;
    let width = (clip.width as f64).min(bounds.width - clip.x as f64);
    let height = (clip.height as f64).min(bounds.height - clip.y as f64);

    if width <= 0.0 || height <= 0.0 {
        return Err(ScreenshotError::InvalidRequest(format!(
            "clip {},{} {}x{} lies outside the element ({}x{})",
            clip.x, clip.y, clip.width, clip.height, bounds.width, bounds.height
        )));
    }

    Ok(Rect {
        x,
        y,
        width,
        height,
    })
}

#[async_trait]
pub trait Renderer: Send + Sync {
    async fn launch(
        &self,
        options: &LaunchOptions,
    ) -> Result<Arc<dyn RendererHandle>, ScreenshotError>;
}

/// A running renderer process.
#[async_trait]
pub trait RendererHandle: Send + Sync {
    async fn new_page(&self) -> Result<Box<dyn RenderPage>, ScreenshotError>;

    /// Flips to `true` once the process is gone, whatever the cause.
    fn disconnected(&self) -> watch::Receiver<bool>;

    async fn close(&self);
}

/// A browsing context owned by one request.
#[async_trait]
pub trait RenderPage: Send + Sync {
    async fn set_viewport(&self, viewport: Viewport) -> Result<(), ScreenshotError>;

    async fn goto(&self, url: &str, wait: &NavigationWait) -> Result<(), ScreenshotError>;

    /// PNG capture of the visible page, or of `clip` in page coordinates.
    async fn screenshot(&self, clip: Option<Clip>) -> Result<Vec<u8>, ScreenshotError>;

    /// First element matching `selector`, if any.
    async fn query_selector(
        &self,
        selector: &str,
    ) -> Result<Option<Box<dyn RenderElement>>, ScreenshotError>;

    async fn close(&self) -> Result<(), ScreenshotError>;
}

#[async_trait]
pub trait RenderElement: Send + Sync {
    /// PNG capture of the element, or of `clip` relative to its top-left corner.
    async fn screenshot(&self, clip: Option<Clip>) -> Result<Vec<u8>, ScreenshotError>;
}
