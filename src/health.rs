use crate::{CaptureCoordinator, SessionSnapshot, SessionState};
use serde::Serialize;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    /// Consecutive launch failures before the service reports unhealthy
    pub max_failed_launches: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_failed_launches: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthLevel,
    pub version: &'static str,
    pub uptime_secs: u64,
    /// `artifact` when captures are persisted, `bytes` otherwise
    pub output: &'static str,
    pub browser: SessionSnapshot,
}

pub struct HealthChecker {
    thresholds: HealthThresholds,
}

impl HealthChecker {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self { thresholds }
    }

    pub async fn check(&self, coordinator: &CaptureCoordinator) -> HealthReport {
        let start_time = Instant::now();
        let browser = coordinator.session().snapshot().await;
        let status = self.assess(&browser);

        if status != HealthLevel::Healthy {
            warn!(
                "Health check: {:?} (browser {:?}, {} failed launches)",
                status, browser.state, browser.failed_launches
            );
        } else {
            info!("Health check completed in {:?}", start_time.elapsed());
        }

        HealthReport {
            status,
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs: coordinator.metrics().uptime().as_secs(),
            output: if coordinator.persists() {
                "artifact"
            } else {
                "bytes"
            },
            browser,
        }
    }

    /// The browser starts lazily, so an idle session is healthy. A lost
    /// browser is recovered on the next capture; repeated launch failures are
    /// not.
    pub fn assess(&self, browser: &SessionSnapshot) -> HealthLevel {
        if browser.failed_launches >= self.thresholds.max_failed_launches {
            return HealthLevel::Unhealthy;
        }

        match browser.state {
            SessionState::Disconnected => HealthLevel::Degraded,
            _ if browser.failed_launches > 0 => HealthLevel::Degraded,
            _ => HealthLevel::Healthy,
        }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new(HealthThresholds::default())
    }
}
