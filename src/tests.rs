#[cfg(test)]
mod integration_tests {
    use crate::{
        router, AppState, BrowserLifecycle, BrowserSession, CacheKey, CachedResult,
        CaptureCoordinator, CaptureOutcome, CaptureRequest, Clip, HealthChecker, LaunchOptions,
        LocalArtifactStore, MemoryCache, Metrics, MockArtifactStore, MockResultCache,
        NavigationWait, Persistence, RenderElement, RenderPage, Renderer, RendererHandle,
        ResultCache, ScreenshotError, SessionState, StoredArtifact, Viewport,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::watch;
    use tokio_test::{assert_err, assert_ok};

    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
    const SETTLE: Duration = Duration::from_millis(50);

    #[derive(Default)]
    struct Counters {
        launches: AtomicUsize,
        pages_opened: AtomicUsize,
        pages_closed: AtomicUsize,
        browsers_closed: AtomicUsize,
        last_clip: Mutex<Option<Clip>>,
    }

    impl Counters {
        fn get(counter: &AtomicUsize) -> usize {
            counter.load(Ordering::SeqCst)
        }
    }

    /// In-process renderer. Pages know the selectors in `selectors`, and any
    /// navigation to `hang.test` times out.
    #[derive(Default)]
    struct FakeRenderer {
        counters: Arc<Counters>,
        selectors: Vec<String>,
        launch_delay: Duration,
        navigation_delay: Duration,
        fail_launches: AtomicUsize,
        handles: Mutex<Vec<Arc<FakeHandle>>>,
    }

    impl FakeRenderer {
        fn with_selectors(selectors: &[&str]) -> Self {
            Self {
                selectors: selectors.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }
        }

        fn launches(&self) -> usize {
            Counters::get(&self.counters.launches)
        }

        fn pages_opened(&self) -> usize {
            Counters::get(&self.counters.pages_opened)
        }

        fn pages_closed(&self) -> usize {
            Counters::get(&self.counters.pages_closed)
        }

        fn browsers_closed(&self) -> usize {
            Counters::get(&self.counters.browsers_closed)
        }

        fn disconnect(&self, index: usize) {
            let handle = self.handles.lock().unwrap()[index].clone();
            handle.disconnect.send_replace(true);
        }
    }

    #[async_trait]
    impl Renderer for FakeRenderer {
        async fn launch(
            &self,
            _options: &LaunchOptions,
        ) -> Result<Arc<dyn RendererHandle>, ScreenshotError> {
            tokio::time::sleep(self.launch_delay).await;

            let remaining_failures = self.fail_launches.load(Ordering::SeqCst);
            if remaining_failures > 0 {
                self.fail_launches.store(remaining_failures - 1, Ordering::SeqCst);
                return Err(ScreenshotError::RendererUnavailable(
                    "chrome not found".to_string(),
                ));
            }

            self.counters.launches.fetch_add(1, Ordering::SeqCst);
            let (disconnect, _) = watch::channel(false);
            let handle = Arc::new(FakeHandle {
                counters: self.counters.clone(),
                selectors: self.selectors.clone(),
                navigation_delay: self.navigation_delay,
                disconnect,
                closed: AtomicBool::new(false),
            });
            self.handles.lock().unwrap().push(handle.clone());
            Ok(handle)
        }
    }

    struct FakeHandle {
        counters: Arc<Counters>,
        selectors: Vec<String>,
        navigation_delay: Duration,
        disconnect: watch::Sender<bool>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl RendererHandle for FakeHandle {
        async fn new_page(&self) -> Result<Box<dyn RenderPage>, ScreenshotError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ScreenshotError::PageError("browser closed".to_string()));
            }
            self.counters.pages_opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakePage {
                counters: self.counters.clone(),
                selectors: self.selectors.clone(),
                navigation_delay: self.navigation_delay,
            }))
        }

        fn disconnected(&self) -> watch::Receiver<bool> {
            self.disconnect.subscribe()
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
            self.counters.browsers_closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakePage {
        counters: Arc<Counters>,
        selectors: Vec<String>,
        navigation_delay: Duration,
    }

    #[async_trait]
    impl RenderPage for FakePage {
        async fn set_viewport(&self, _viewport: Viewport) -> Result<(), ScreenshotError> {
            Ok(())
        }

        async fn goto(&self, url: &str, wait: &NavigationWait) -> Result<(), ScreenshotError> {
            if url.contains("hang.test") {
                return Err(ScreenshotError::NavigationTimeout(wait.timeout));
            }
            tokio::time::sleep(self.navigation_delay).await;
            Ok(())
        }

        async fn screenshot(&self, clip: Option<Clip>) -> Result<Vec<u8>, ScreenshotError> {
            *self.counters.last_clip.lock().unwrap() = clip;
            Ok(PNG.to_vec())
        }

        async fn query_selector(
            &self,
            selector: &str,
        ) -> Result<Option<Box<dyn RenderElement>>, ScreenshotError> {
            if self.selectors.iter().any(|s| s == selector) {
                Ok(Some(Box::new(FakeElement {
                    counters: self.counters.clone(),
                })))
            } else {
                Ok(None)
            }
        }

        async fn close(&self) -> Result<(), ScreenshotError> {
            self.counters.pages_closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeElement {
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl RenderElement for FakeElement {
        async fn screenshot(&self, clip: Option<Clip>) -> Result<Vec<u8>, ScreenshotError> {
            *self.counters.last_clip.lock().unwrap() = clip;
            Ok(PNG.to_vec())
        }
    }

    fn coordinator(
        renderer: Arc<FakeRenderer>,
        lifecycle: BrowserLifecycle,
        persistence: Option<Persistence>,
    ) -> Arc<CaptureCoordinator> {
        let metrics = Arc::new(Metrics::noop());
        let options = LaunchOptions {
            executable: None,
            headless: true,
            args: Vec::new(),
            default_viewport: Viewport::default(),
        };
        let session = Arc::new(BrowserSession::new(
            renderer,
            options,
            lifecycle,
            metrics.clone(),
        ));

        let mut coordinator = CaptureCoordinator::new(session, NavigationWait::default(), metrics);
        if let Some(persistence) = persistence {
            coordinator = coordinator.with_persistence(persistence);
        }
        Arc::new(coordinator)
    }

    fn local_persistence(dir: &std::path::Path, cache: Arc<MemoryCache>) -> Persistence {
        Persistence {
            store: Arc::new(LocalArtifactStore::new(dir, "https://cdn.test")),
            cache,
            ttl: Duration::from_secs(7200),
        }
    }

    async fn spawn_app(coordinator: Arc<CaptureCoordinator>) -> String {
        let state = Arc::new(AppState {
            coordinator,
            default_viewport: Viewport::default(),
            health: HealthChecker::default(),
            prometheus: None,
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_persistent_capture_is_cached_by_url() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = Arc::new(FakeRenderer::default());
        let cache = Arc::new(MemoryCache::new());
        let coordinator = coordinator(
            renderer.clone(),
            BrowserLifecycle::Persistent,
            Some(local_persistence(dir.path(), cache.clone())),
        );
        let base = spawn_app(coordinator.clone()).await;

        let first: serde_json::Value = reqwest::get(format!("{base}/screenshot?url=https://example.com"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let url = first["url"].as_str().unwrap().to_string();
        assert!(url.starts_with("https://cdn.test/screenshots/"));
        assert!(url.ends_with(".png"));

        let second: serde_json::Value = reqwest::get(format!("{base}/screenshot?url=https://example.com"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(second["url"], url.as_str());

        assert_eq!(renderer.launches(), 1);
        assert_eq!(renderer.pages_opened(), 1);
        assert_eq!(renderer.pages_closed(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(coordinator.session().state().await, SessionState::Ready);

        let relative = url.trim_start_matches("https://cdn.test/");
        let stored = tokio::fs::read(dir.path().join(relative)).await.unwrap();
        assert_eq!(stored, PNG);
    }

    #[tokio::test]
    async fn test_selector_miss_is_not_found_and_uncached() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = Arc::new(FakeRenderer::with_selectors(&["#hero"]));
        let cache = Arc::new(MemoryCache::new());
        let coordinator = coordinator(
            renderer.clone(),
            BrowserLifecycle::Persistent,
            Some(local_persistence(dir.path(), cache.clone())),
        );
        let base = spawn_app(coordinator).await;

        let response = reqwest::get(format!(
            "{base}/screenshot?url=https://example.com&selector=.missing"
        ))
        .await
        .unwrap();

        assert_eq!(response.status(), 404);
        assert_eq!(response.text().await.unwrap(), "Selector not found");
        assert_eq!(renderer.pages_opened(), 1);
        assert_eq!(renderer.pages_closed(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_missing_url_never_touches_renderer() {
        let renderer = Arc::new(FakeRenderer::default());
        let base = spawn_app(coordinator(
            renderer.clone(),
            BrowserLifecycle::Persistent,
            None,
        ))
        .await;

        for path in ["/screenshot?url=", "/screenshot"] {
            let response = reqwest::get(format!("{base}{path}")).await.unwrap();
            assert_eq!(response.status(), 400);
            assert_eq!(response.text().await.unwrap(), "URL is required");
        }

        let response = reqwest::get(format!("{base}/screenshot?url=https://example.com&width=abc"))
            .await
            .unwrap();
        assert_eq!(response.status(), 400);

        assert_eq!(renderer.launches(), 0);
    }

    #[tokio::test]
    async fn test_raw_mode_returns_png_bytes() {
        let renderer = Arc::new(FakeRenderer::default());
        let base = spawn_app(coordinator(
            renderer.clone(),
            BrowserLifecycle::PerCapture,
            None,
        ))
        .await;

        let response = reqwest::get(format!("{base}/screenshot?url=https://example.com"))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["content-type"], "image/png");
        assert_eq!(response.bytes().await.unwrap().as_ref(), PNG);
    }

    #[tokio::test]
    async fn test_concurrent_requests_launch_once() {
        let renderer = Arc::new(FakeRenderer {
            launch_delay: Duration::from_millis(50),
            ..Default::default()
        });
        let coordinator = coordinator(renderer.clone(), BrowserLifecycle::Persistent, None);

        let tasks: Vec<_> = (0..12)
            .map(|i| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    let request = CaptureRequest::new(format!("https://example.com/{i}"));
                    coordinator.capture(&request).await
                })
            })
            .collect();

        for task in tasks {
            assert_ok!(task.await.unwrap());
        }

        assert_eq!(renderer.launches(), 1);
        assert_eq!(renderer.pages_opened(), 12);
        assert_eq!(renderer.pages_closed(), 12);
        assert_eq!(coordinator.session().snapshot().await.active_leases, 0);
    }

    #[tokio::test]
    async fn test_per_capture_lifecycle_leaves_no_browser() {
        let renderer = Arc::new(FakeRenderer::default());
        let coordinator = coordinator(renderer.clone(), BrowserLifecycle::PerCapture, None);

        for _ in 0..2 {
            let outcome = coordinator
                .capture(&CaptureRequest::new("https://example.com"))
                .await
                .unwrap();
            assert_eq!(outcome, CaptureOutcome::Bytes(PNG.to_vec()));
            assert_eq!(
                coordinator.session().state().await,
                SessionState::Uninitialized
            );
        }

        assert_eq!(renderer.launches(), 2);
        assert_eq!(renderer.browsers_closed(), 2);
        assert_eq!(renderer.pages_opened(), renderer.pages_closed());
    }

    #[tokio::test]
    async fn test_navigation_timeout_closes_page() {
        let renderer = Arc::new(FakeRenderer::default());
        let coordinator = coordinator(renderer.clone(), BrowserLifecycle::PerCapture, None);
        let base = spawn_app(coordinator.clone()).await;

        let response = reqwest::get(format!("{base}/screenshot?url=https://hang.test/"))
            .await
            .unwrap();

        assert_eq!(response.status(), 504);
        assert_eq!(renderer.pages_opened(), 1);
        assert_eq!(renderer.pages_closed(), 1);
        assert_eq!(renderer.browsers_closed(), 1);
        assert_eq!(
            coordinator.session().state().await,
            SessionState::Uninitialized
        );
    }

    #[tokio::test]
    async fn test_disconnect_mid_flight_completes_then_relaunches() {
        let renderer = Arc::new(FakeRenderer {
            navigation_delay: Duration::from_millis(300),
            ..Default::default()
        });
        let coordinator = coordinator(renderer.clone(), BrowserLifecycle::Persistent, None);

        let in_flight = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .capture(&CaptureRequest::new("https://example.com"))
                    .await
            })
        };

        while renderer.pages_opened() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        renderer.disconnect(0);
        tokio::time::sleep(SETTLE).await;
        assert_eq!(
            coordinator.session().state().await,
            SessionState::Disconnected
        );

        let outcome = assert_ok!(in_flight.await.unwrap());
        assert_eq!(outcome, CaptureOutcome::Bytes(PNG.to_vec()));
        assert_eq!(
            coordinator.session().state().await,
            SessionState::Disconnected
        );

        assert_ok!(
            coordinator
                .capture(&CaptureRequest::new("https://example.com"))
                .await
        );
        assert_eq!(renderer.launches(), 2);
        assert_eq!(coordinator.session().snapshot().await.generation, 2);
    }

    #[tokio::test]
    async fn test_launch_failure_is_unavailable_then_recovers() {
        let renderer = Arc::new(FakeRenderer::default());
        renderer.fail_launches.store(1, Ordering::SeqCst);
        let coordinator = coordinator(renderer.clone(), BrowserLifecycle::Persistent, None);
        let base = spawn_app(coordinator.clone()).await;

        let response = reqwest::get(format!("{base}/screenshot?url=https://example.com"))
            .await
            .unwrap();
        assert_eq!(response.status(), 503);
        assert_eq!(
            coordinator.session().state().await,
            SessionState::Uninitialized
        );

        let response = reqwest::get(format!("{base}/screenshot?url=https://example.com"))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(renderer.launches(), 1);
    }

    #[tokio::test]
    async fn test_element_clip_reaches_renderer() {
        let renderer = Arc::new(FakeRenderer::with_selectors(&["#hero"]));
        let coordinator = coordinator(renderer.clone(), BrowserLifecycle::Persistent, None);
        let clip = Clip {
            x: 4,
            y: 8,
            width: 100,
            height: 50,
        };

        let request = CaptureRequest::new("https://example.com")
            .with_selector("#hero")
            .with_clip(clip);
        assert_ok!(coordinator.capture(&request).await);
        assert_eq!(*renderer.counters.last_clip.lock().unwrap(), Some(clip));
    }

    #[tokio::test]
    async fn test_store_failure_is_internal_error_without_cache_write() {
        let renderer = Arc::new(FakeRenderer::default());

        let mut store = MockArtifactStore::new();
        store
            .expect_put()
            .returning(|_, _, _| Err(ScreenshotError::ArtifactStore("quota exceeded".into())));

        let mut cache = MockResultCache::new();
        cache.expect_get().returning(|_| Ok(None));
        cache.expect_set_if_absent().never();

        let coordinator = coordinator(
            renderer.clone(),
            BrowserLifecycle::Persistent,
            Some(Persistence {
                store: Arc::new(store),
                cache: Arc::new(cache),
                ttl: Duration::from_secs(60),
            }),
        );
        let base = spawn_app(coordinator).await;

        let response = reqwest::get(format!("{base}/screenshot?url=https://example.com"))
            .await
            .unwrap();
        assert_eq!(response.status(), 500);
        assert_eq!(response.text().await.unwrap(), "Internal storage error");
        assert_eq!(renderer.pages_closed(), 1);
    }

    #[tokio::test]
    async fn test_cache_outage_fails_before_rendering() {
        let renderer = Arc::new(FakeRenderer::default());

        let mut store = MockArtifactStore::new();
        store.expect_put().never();
        let mut cache = MockResultCache::new();
        cache
            .expect_get()
            .returning(|_| Err(ScreenshotError::CacheStore("connection refused".into())));

        let coordinator = coordinator(
            renderer.clone(),
            BrowserLifecycle::Persistent,
            Some(Persistence {
                store: Arc::new(store),
                cache: Arc::new(cache),
                ttl: Duration::from_secs(60),
            }),
        );

        let result = coordinator
            .capture(&CaptureRequest::new("https://example.com"))
            .await;
        assert!(matches!(assert_err!(result), ScreenshotError::CacheStore(_)));
        assert_eq!(renderer.launches(), 0);
    }

    #[tokio::test]
    async fn test_lost_cache_race_returns_first_writer() {
        let renderer = Arc::new(FakeRenderer::default());

        let mut store = MockArtifactStore::new();
        store.expect_put().times(1).returning(|path, _, content_type| {
            assert_eq!(content_type, "image/png");
            Ok(StoredArtifact {
                url: format!("https://blob.test/{path}"),
            })
        });

        let lookups = Arc::new(AtomicUsize::new(0));
        let mut cache = MockResultCache::new();
        {
            let lookups = lookups.clone();
            cache.expect_get().returning(move |_| {
                if lookups.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(None)
                } else {
                    Ok(Some(CachedResult::new(
                        "https://blob.test/winner.png",
                        Duration::from_secs(60),
                    )))
                }
            });
        }
        cache
            .expect_set_if_absent()
            .times(1)
            .returning(|_, _, _| Ok(false));

        let coordinator = coordinator(
            renderer,
            BrowserLifecycle::Persistent,
            Some(Persistence {
                store: Arc::new(store),
                cache: Arc::new(cache),
                ttl: Duration::from_secs(60),
            }),
        );

        let outcome = coordinator
            .capture(&CaptureRequest::new("https://example.com"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CaptureOutcome::Artifact {
                url: "https://blob.test/winner.png".to_string()
            }
        );
        assert_eq!(lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_renderer() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = Arc::new(FakeRenderer::default());
        let cache = Arc::new(MemoryCache::new());

        let request = CaptureRequest::new("https://example.com").with_viewport(800, 600);
        let ttl = Duration::from_secs(60);
        let seeded = CachedResult::new("https://cdn.test/seeded.png", ttl);
        assert!(cache
            .set_if_absent(&CacheKey::build(&request), &seeded, ttl)
            .await
            .unwrap());

        let coordinator = coordinator(
            renderer.clone(),
            BrowserLifecycle::Persistent,
            Some(local_persistence(dir.path(), cache)),
        );

        let outcome = coordinator.capture(&request).await.unwrap();
        assert_eq!(
            outcome,
            CaptureOutcome::Artifact {
                url: "https://cdn.test/seeded.png".to_string()
            }
        );
        assert_eq!(renderer.launches(), 0);

        // A different viewport is a different key.
        coordinator
            .capture(&CaptureRequest::new("https://example.com"))
            .await
            .unwrap();
        assert_eq!(renderer.launches(), 1);
    }

    #[tokio::test]
    async fn test_health_and_metrics_endpoints() {
        let renderer = Arc::new(FakeRenderer::default());
        let coordinator = coordinator(renderer, BrowserLifecycle::Persistent, None);
        let base = spawn_app(coordinator.clone()).await;

        let health: serde_json::Value = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["browser"]["state"], "uninitialized");
        assert_eq!(health["output"], "bytes");

        coordinator
            .capture(&CaptureRequest::new("https://example.com"))
            .await
            .unwrap();
        let health: serde_json::Value = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["browser"]["state"], "ready");
        assert_eq!(health["browser"]["launches"], 1);

        let metrics = reqwest::get(format!("{base}/metrics")).await.unwrap();
        assert_eq!(metrics.status(), 404);
    }
}
