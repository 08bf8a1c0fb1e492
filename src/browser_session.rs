//! Lifecycle of the single shared renderer process
//!
//! The session is an explicit state machine:
//!
//! ```text
//! Uninitialized ──ensure_ready──▶ Launching ──ok──▶ Ready
//!       ▲                            │                 │
//!       └──────── launch error ──────┘                 │ disconnect
//!       ▲                                              ▼
//!       └──── invalidate / per-capture release ── Disconnected ──ensure_ready──▶ Launching
//! ```
//!
//! Launches are serialized behind an async mutex with a double-checked state
//! read, so any number of concurrent callers produce a single process. Every
//! launch gets a generation number; disconnect notifications and leases carry
//! it so that news about an old process never touches a newer one.

use crate::{BrowserLifecycle, LaunchOptions, Metrics, Renderer, RendererHandle, ScreenshotError};
use serde::Serialize;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

/// Observable session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No process and none being started
    Uninitialized,
    /// A launch is in progress
    Launching,
    /// A live process is available
    Ready,
    /// The last process went away; the next capture relaunches
    Disconnected,
}

struct LiveBrowser {
    handle: Arc<dyn RendererHandle>,
    generation: u64,
    /// Outstanding leases for this generation
    leases: usize,
    launched_at: Instant,
}

enum Slot {
    Uninitialized,
    Launching,
    Ready(LiveBrowser),
    Disconnected,
}

impl Slot {
    fn state(&self) -> SessionState {
        match self {
            Slot::Uninitialized => SessionState::Uninitialized,
            Slot::Launching => SessionState::Launching,
            Slot::Ready(_) => SessionState::Ready,
            Slot::Disconnected => SessionState::Disconnected,
        }
    }
}

/// Access to the live renderer for the duration of one capture.
///
/// Hand it back with [`BrowserSession::release`]. A lease keeps its handle
/// usable even if the session moves on to a newer process.
pub struct BrowserLease {
    handle: Arc<dyn RendererHandle>,
    generation: u64,
}

impl BrowserLease {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Deref for BrowserLease {
    type Target = dyn RendererHandle;

    fn deref(&self) -> &Self::Target {
        self.handle.as_ref()
    }
}

/// Point-in-time view used by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub generation: u64,
    pub active_leases: usize,
    pub launches: usize,
    pub disconnects: usize,
    /// Launch attempts that failed since the last successful one
    pub failed_launches: usize,
    /// Seconds since the current process was launched
    pub browser_uptime_secs: Option<u64>,
}

pub struct BrowserSession {
    renderer: Arc<dyn Renderer>,
    launch_options: LaunchOptions,
    lifecycle: BrowserLifecycle,
    slot: Arc<RwLock<Slot>>,
    launch_lock: Mutex<()>,
    generation: AtomicU64,
    launches: AtomicUsize,
    disconnects: Arc<AtomicUsize>,
    failed_launches: AtomicUsize,
    metrics: Arc<Metrics>,
}

impl BrowserSession {
    pub fn new(
        renderer: Arc<dyn Renderer>,
        launch_options: LaunchOptions,
        lifecycle: BrowserLifecycle,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            renderer,
            launch_options,
            lifecycle,
            slot: Arc::new(RwLock::new(Slot::Uninitialized)),
            launch_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            launches: AtomicUsize::new(0),
            disconnects: Arc::new(AtomicUsize::new(0)),
            failed_launches: AtomicUsize::new(0),
            metrics,
        }
    }

    pub fn lifecycle(&self) -> BrowserLifecycle {
        self.lifecycle
    }

    pub async fn state(&self) -> SessionState {
        self.slot.read().await.state()
    }

    /// Number of successful launches since the session was created.
    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let slot = self.slot.read().await;
        let (generation, active_leases, browser_uptime_secs) = match &*slot {
            Slot::Ready(live) => (
                live.generation,
                live.leases,
                Some(live.launched_at.elapsed().as_secs()),
            ),
            _ => (self.generation.load(Ordering::SeqCst), 0, None),
        };

        SessionSnapshot {
            state: slot.state(),
            generation,
            active_leases,
            launches: self.launch_count(),
            disconnects: self.disconnects.load(Ordering::SeqCst),
            failed_launches: self.failed_launches.load(Ordering::SeqCst),
            browser_uptime_secs,
        }
    }

    /// Lease the live renderer, launching one first if there is none.
    ///
    /// Launch failures surface as [`ScreenshotError::RendererUnavailable`]
    /// and leave the session in its previous idle state.
    pub async fn ensure_ready(&self) -> Result<BrowserLease, ScreenshotError> {
        if let Some(lease) = self.try_lease().await {
            return Ok(lease);
        }

        let _launching = self.launch_lock.lock().await;

        // Another caller may have finished a launch while we waited.
        if let Some(lease) = self.try_lease().await {
            return Ok(lease);
        }

        let previous = {
            let mut slot = self.slot.write().await;
            std::mem::replace(&mut *slot, Slot::Launching).state()
        };
        info!("Launching browser (previous state: {:?})", previous);
        let started = Instant::now();

        let handle = match self.renderer.launch(&self.launch_options).await {
            Ok(handle) => handle,
            Err(e) => {
                *self.slot.write().await = match previous {
                    SessionState::Disconnected => Slot::Disconnected,
                    _ => Slot::Uninitialized,
                };
                self.failed_launches.fetch_add(1, Ordering::SeqCst);
                error!("Browser launch failed: {}", e);
                return Err(match e {
                    ScreenshotError::RendererUnavailable(_) => e,
                    other => ScreenshotError::RendererUnavailable(other.to_string()),
                });
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.failed_launches.store(0, Ordering::SeqCst);
        self.metrics.record_browser_launch();

        *self.slot.write().await = Slot::Ready(LiveBrowser {
            handle: handle.clone(),
            generation,
            leases: 1,
            launched_at: Instant::now(),
        });

        // Registered after the slot is Ready: the watch channel keeps its
        // latest value, so a process that died during launch is still noticed.
        self.watch_disconnect(handle.as_ref(), generation);

        info!(
            "Browser ready (generation {}) in {}",
            generation,
            crate::format_duration(started.elapsed())
        );
        Ok(BrowserLease { handle, generation })
    }

    async fn try_lease(&self) -> Option<BrowserLease> {
        let mut slot = self.slot.write().await;
        match &mut *slot {
            Slot::Ready(live) => {
                live.leases += 1;
                Some(BrowserLease {
                    handle: live.handle.clone(),
                    generation: live.generation,
                })
            }
            _ => None,
        }
    }

    fn watch_disconnect(&self, handle: &dyn RendererHandle, generation: u64) {
        let mut disconnected = handle.disconnected();
        let slot = self.slot.clone();
        let disconnects = self.disconnects.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            // A dropped sender means the process is gone as well.
            let _ = disconnected.wait_for(|gone| *gone).await;

            let mut slot = slot.write().await;
            match &*slot {
                Slot::Ready(live) if live.generation == generation => {
                    warn!(
                        "Browser disconnected (generation {}, {} captures in flight)",
                        generation, live.leases
                    );
                    *slot = Slot::Disconnected;
                    disconnects.fetch_add(1, Ordering::SeqCst);
                    metrics.record_browser_disconnect();
                }
                _ => {
                    info!("Ignoring disconnect of retired browser generation {}", generation);
                }
            }
        });
    }

    /// Return a lease. In per-capture mode the browser is closed once the last
    /// lease of the current generation comes back.
    pub async fn release(&self, lease: BrowserLease) {
        let retired = {
            let mut slot = self.slot.write().await;
            let close_now = match &mut *slot {
                Slot::Ready(live) if live.generation == lease.generation => {
                    live.leases = live.leases.saturating_sub(1);
                    self.lifecycle == BrowserLifecycle::PerCapture && live.leases == 0
                }
                _ => false,
            };

            if close_now {
                match std::mem::replace(&mut *slot, Slot::Uninitialized) {
                    Slot::Ready(live) => Some(live),
                    other => {
                        *slot = other;
                        None
                    }
                }
            } else {
                None
            }
        };

        if let Some(live) = retired {
            live.handle.close().await;
            info!("Browser generation {} closed after capture", live.generation);
        }
    }

    /// Tear down the live browser, if any. In-flight captures keep their
    /// handles but the process behind them is closed.
    pub async fn invalidate(&self) {
        let retired = {
            let mut slot = self.slot.write().await;
            match &*slot {
                Slot::Ready(_) => match std::mem::replace(&mut *slot, Slot::Uninitialized) {
                    Slot::Ready(live) => Some(live),
                    _ => None,
                },
                Slot::Disconnected => {
                    *slot = Slot::Uninitialized;
                    None
                }
                _ => None,
            }
        };

        if let Some(live) = retired {
            info!("Closing browser generation {}", live.generation);
            live.handle.close().await;
        }
    }

    /// Close the browser and wait out any launch in progress.
    pub async fn shutdown(&self) {
        let _launching = self.launch_lock.lock().await;
        self.invalidate().await;
        info!("Browser session shut down");
    }
}
