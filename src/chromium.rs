//! Chrome DevTools Protocol renderer built on chromiumoxide

use crate::renderer::{element_clip, Rect};
use crate::{
    Clip, LaunchOptions, NavigationWait, RenderElement, RenderPage, Renderer, RendererHandle,
    ScreenshotError, Viewport,
};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::{
    EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent,
};
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, Viewport as CdpViewport};
use chromiumoxide::cdp::js_protocol::runtime::CallFunctionOnReturns;
use chromiumoxide::element::Element;
use chromiumoxide::error::CdpError;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

// Serialized to a string: callFunctionOn only returns primitives by value.
const ELEMENT_DOCUMENT_RECT: &str = "function() { \
    const r = this.getBoundingClientRect(); \
    return JSON.stringify([r.left + window.scrollX, r.top + window.scrollY, r.width, r.height]); \
}";

/// Launches Chromium processes through chromiumoxide.
pub struct ChromiumRenderer {
    request_timeout: Duration,
}

impl ChromiumRenderer {
    /// `request_timeout` bounds every individual CDP command and must exceed
    /// the navigation timeout.
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

#[async_trait]
impl Renderer for ChromiumRenderer {
    async fn launch(
        &self,
        options: &LaunchOptions,
    ) -> Result<Arc<dyn RendererHandle>, ScreenshotError> {
        let mut builder = BrowserConfig::builder()
            .window_size(options.default_viewport.width, options.default_viewport.height)
            .request_timeout(self.request_timeout)
            .args(options.args.clone());

        if !options.headless {
            builder = builder.with_head();
        }
        if let Some(executable) = &options.executable {
            builder = builder.chrome_executable(executable);
        }

        let config = builder.build().map_err(ScreenshotError::RendererUnavailable)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| ScreenshotError::RendererUnavailable(e.to_string()))?;

        // The handler drives all CDP traffic; once its stream ends the
        // browser is gone.
        let (disconnected_tx, disconnected_rx) = watch::channel(false);
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    warn!("Browser handler error: {}", e);
                    break;
                }
            }
            debug!("Browser handler stream ended");
            let _ = disconnected_tx.send(true);
        });

        info!(
            "Chromium launched (headless: {}, {} extra flags)",
            options.headless,
            options.args.len()
        );

        Ok(Arc::new(ChromiumHandle {
            browser: Mutex::new(browser),
            handler: handler_task,
            disconnected: disconnected_rx,
        }))
    }
}

pub struct ChromiumHandle {
    browser: Mutex<Browser>,
    handler: JoinHandle<()>,
    disconnected: watch::Receiver<bool>,
}

#[async_trait]
impl RendererHandle for ChromiumHandle {
    async fn new_page(&self) -> Result<Box<dyn RenderPage>, ScreenshotError> {
        let page = {
            let browser = self.browser.lock().await;
            browser
                .new_page("about:blank")
                .await
                .map_err(|e| ScreenshotError::PageError(e.to_string()))?
        };
        Ok(Box::new(ChromiumPage { page }))
    }

    fn disconnected(&self) -> watch::Receiver<bool> {
        self.disconnected.clone()
    }

    async fn close(&self) {
        if let Err(e) = self.browser.lock().await.close().await {
            debug!("Browser close returned: {}", e);
        }
        self.handler.abort();
    }
}

pub struct ChromiumPage {
    page: Page,
}

impl ChromiumPage {
    async fn capture(&self, rect: Option<Rect>) -> Result<Vec<u8>, ScreenshotError> {
        let mut params = ScreenshotParams::builder().format(CaptureScreenshotFormat::Png);
        if let Some(rect) = rect {
            params = params
                .clip(CdpViewport {
                    x: rect.x,
                    y: rect.y,
                    width: rect.width,
                    height: rect.height,
                    scale: 1.0,
                })
                .capture_beyond_viewport(true);
        }

        self.page
            .screenshot(params.build())
            .await
            .map_err(|e| ScreenshotError::CaptureFailed(e.to_string()))
    }

    async fn wait_for_network_quiet(
        &self,
        url: &str,
        wait: &NavigationWait,
    ) -> Result<(), ScreenshotError> {
        // Listeners go in before navigation so no request is missed.
        let mut started = self.page.event_listener::<EventRequestWillBeSent>().await?;
        let mut finished = self.page.event_listener::<EventLoadingFinished>().await?;
        let mut failed = self.page.event_listener::<EventLoadingFailed>().await?;

        self.page.goto(url).await.map_err(|e| match e {
            CdpError::Timeout => ScreenshotError::NavigationTimeout(wait.timeout),
            other => ScreenshotError::NavigationFailed(other.to_string()),
        })?;

        let mut inflight: HashSet<String> = HashSet::new();
        loop {
            tokio::select! {
                Some(event) = started.next() => {
                    inflight.insert(event.request_id.inner().clone());
                }
                Some(event) = finished.next() => {
                    inflight.remove(event.request_id.inner());
                }
                Some(event) = failed.next() => {
                    inflight.remove(event.request_id.inner());
                }
                _ = tokio::time::sleep(wait.idle_window), if inflight.len() <= wait.max_inflight => {
                    break;
                }
                else => break,
            }
        }

        debug!("Network quiet for {} ({} requests pending)", url, inflight.len());
        Ok(())
    }
}

#[async_trait]
impl RenderPage for ChromiumPage {
    async fn set_viewport(&self, viewport: Viewport) -> Result<(), ScreenshotError> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(viewport.width)
            .height(viewport.height)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(ScreenshotError::PageError)?;

        self.page.execute(params).await?;
        Ok(())
    }

    async fn goto(&self, url: &str, wait: &NavigationWait) -> Result<(), ScreenshotError> {
        match timeout(wait.timeout, self.wait_for_network_quiet(url, wait)).await {
            Ok(result) => result,
            Err(_) => Err(ScreenshotError::NavigationTimeout(wait.timeout)),
        }
    }

    async fn screenshot(&self, clip: Option<Clip>) -> Result<Vec<u8>, ScreenshotError> {
        self.capture(clip.map(Rect::from)).await
    }

    async fn query_selector(
        &self,
        selector: &str,
    ) -> Result<Option<Box<dyn RenderElement>>, ScreenshotError> {
        let mut elements = self
            .page
            .find_elements(selector)
            .await
            .map_err(|e| selector_error(selector, e))?;

        if elements.is_empty() {
            return Ok(None);
        }
        let element = elements.swap_remove(0);
        Ok(Some(Box::new(ChromiumElement {
            page: ChromiumPage {
                page: self.page.clone(),
            },
            element,
        })))
    }

    async fn close(&self) -> Result<(), ScreenshotError> {
        self.page.clone().close().await?;
        Ok(())
    }
}

pub struct ChromiumElement {
    page: ChromiumPage,
    element: Element,
}

impl ChromiumElement {
    async fn document_rect(&self) -> Result<Rect, ScreenshotError> {
        self.element.scroll_into_view().await?;
        let returns = self.element.call_js_fn(ELEMENT_DOCUMENT_RECT, false).await?;
        decode_document_rect(&returns)
    }
}

/// Chrome answers a malformed selector with a protocol error; anything else
/// from `DOM.querySelectorAll` is a renderer fault.
fn selector_error(selector: &str, err: CdpError) -> ScreenshotError {
    match err {
        CdpError::Chrome(e) => {
            ScreenshotError::InvalidRequest(format!("selector {selector:?} rejected: {e}"))
        }
        other => other.into(),
    }
}

/// Parse the `[x, y, width, height]` JSON string produced by
/// [`ELEMENT_DOCUMENT_RECT`].
fn decode_document_rect(returns: &CallFunctionOnReturns) -> Result<Rect, ScreenshotError> {
    if let Some(exception) = &returns.exception_details {
        return Err(ScreenshotError::CaptureFailed(format!(
            "bounding box script threw: {}",
            exception.text
        )));
    }

    let raw = returns
        .result
        .value
        .as_ref()
        .and_then(|v| v.as_str())
        .ok_or_else(|| ScreenshotError::CaptureFailed("element has no bounding box".to_string()))?;
    let values: Vec<f64> = serde_json::from_str(raw)?;

    match values.as_slice() {
        [x, y, width, height] => Ok(Rect {
            x: *x,
            y: *y,
            width: *width,
            height: *height,
        }),
        _ => Err(ScreenshotError::CaptureFailed(format!(
            "unexpected bounding box {values:?}"
        ))),
    }
}

#[async_trait]
impl RenderElement for ChromiumElement {
    async fn screenshot(&self, clip: Option<Clip>) -> Result<Vec<u8>, ScreenshotError> {
        let bounds = self.document_rect().await?;
        if bounds.width <= 0.0 || bounds.height <= 0.0 {
            return Err(ScreenshotError::CaptureFailed(
                "element has an empty bounding box".to_string(),
            ));
        }
        let rect = element_clip(bounds, clip)?;
        self.page.capture(Some(rect)).await
    }
}
