//! Request pipeline: cache lookup, render, persist
//!
//! [`CaptureCoordinator::capture`] is the single entry point used by both the
//! HTTP server and the CLI.

use crate::{
    artifact_path, extract_domain, format_bytes, format_duration, ArtifactStore, BrowserLease,
    BrowserSession, CacheKey, CachedResult, CaptureOutcome, CaptureRequest, Metrics,
    NavigationWait, RenderPage, ResultCache, ScreenshotError,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Durable storage for captures. Without it the coordinator answers with raw
/// bytes and never touches a cache.
#[derive(Clone)]
pub struct Persistence {
    pub store: Arc<dyn ArtifactStore>,
    pub cache: Arc<dyn ResultCache>,
    /// Lifetime of cache entries
    pub ttl: Duration,
}

pub struct CaptureCoordinator {
    session: Arc<BrowserSession>,
    persistence: Option<Persistence>,
    navigation: NavigationWait,
    metrics: Arc<Metrics>,
}

impl CaptureCoordinator {
    pub fn new(session: Arc<BrowserSession>, navigation: NavigationWait, metrics: Arc<Metrics>) -> Self {
        Self {
            session,
            persistence: None,
            navigation,
            metrics,
        }
    }

    pub fn with_persistence(mut self, persistence: Persistence) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn session(&self) -> &Arc<BrowserSession> {
        &self.session
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn persists(&self) -> bool {
        self.persistence.is_some()
    }

    pub async fn capture(&self, request: &CaptureRequest) -> Result<CaptureOutcome, ScreenshotError> {
        if request.url.trim().is_empty() {
            return Err(ScreenshotError::MissingUrl);
        }

        let key = CacheKey::build(request);

        if let Some(persistence) = &self.persistence {
            let cached = persistence.cache.get(&key).await?;
            self.metrics.record_cache_lookup(cached.is_some());
            if let Some(hit) = cached {
                debug!("Cache hit for {}", key);
                return Ok(CaptureOutcome::Artifact { url: hit.url });
            }
            debug!("Cache miss for {}", key);
        }

        let started = Instant::now();
        self.metrics.capture_started();
        let rendered = self.render(request).await;
        self.metrics.capture_finished();
        self.metrics.record_capture(started.elapsed(), rendered.is_ok());

        let bytes = rendered?;
        info!(
            "Captured {} ({}) in {}",
            extract_domain(&request.url).unwrap_or_else(|| request.url.clone()),
            format_bytes(bytes.len()),
            format_duration(started.elapsed())
        );

        match &self.persistence {
            Some(persistence) => self.persist(persistence, &key, bytes).await,
            None => Ok(CaptureOutcome::Bytes(bytes)),
        }
    }

    async fn render(&self, request: &CaptureRequest) -> Result<Vec<u8>, ScreenshotError> {
        let lease = self.session.ensure_ready().await?;
        let result = self.render_with(&lease, request).await;
        self.session.release(lease).await;
        result
    }

    async fn render_with(
        &self,
        lease: &BrowserLease,
        request: &CaptureRequest,
    ) -> Result<Vec<u8>, ScreenshotError> {
        let page = lease.new_page().await?;
        let result = self.capture_page(&*page, request).await;

        if let Err(e) = page.close().await {
            warn!("Failed to close page for {}: {}", request.url, e);
        }
        result
    }

    async fn capture_page(
        &self,
        page: &dyn RenderPage,
        request: &CaptureRequest,
    ) -> Result<Vec<u8>, ScreenshotError> {
        page.set_viewport(request.viewport).await?;

        debug!("Navigating to {}", request.url);
        page.goto(&request.url, &self.navigation).await?;

        let bytes = match &request.selector {
            Some(selector) => {
                let element = page
                    .query_selector(selector)
                    .await?
                    .ok_or_else(|| ScreenshotError::SelectorNotFound(selector.clone()))?;
                element.screenshot(request.clip).await?
            }
            None => page.screenshot(request.clip).await?,
        };

        if bytes.is_empty() {
            return Err(ScreenshotError::CaptureFailed(
                "renderer returned an empty image".to_string(),
            ));
        }
        Ok(bytes)
    }

    async fn persist(
        &self,
        persistence: &Persistence,
        key: &CacheKey,
        bytes: Vec<u8>,
    ) -> Result<CaptureOutcome, ScreenshotError> {
        let path = artifact_path(Utc::now());
        let artifact = persistence.store.put(&path, bytes, "image/png").await?;

        let entry = CachedResult::new(artifact.url.clone(), persistence.ttl);
        if persistence.cache.set_if_absent(key, &entry, persistence.ttl).await? {
            return Ok(CaptureOutcome::Artifact { url: artifact.url });
        }

        // Another request cached this key first; its URL stays authoritative.
        match persistence.cache.get(key).await? {
            Some(existing) => {
                info!(
                    "Lost cache race for {}, returning {} instead of {}",
                    key, existing.url, artifact.url
                );
                Ok(CaptureOutcome::Artifact { url: existing.url })
            }
            None => Ok(CaptureOutcome::Artifact { url: artifact.url }),
        }
    }
}
