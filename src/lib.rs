//! # Screenshot Service
//!
//! An HTTP screenshot service backed by a single shared headless Chrome.
//! Identical requests are answered from a write-once result cache; misses are
//! rendered, optionally uploaded to durable storage, and cached by URL.
//!
//! ## Request flow
//!
//! ```text
//! GET /screenshot ─▶ ScreenshotQuery::into_request ─▶ CacheKey::build
//!        │                                               │
//!        │                                    ResultCache::get (hit ─▶ {"url"})
//!        ▼                                               │ miss
//! CaptureCoordinator ─▶ BrowserSession::ensure_ready ─▶ page ─▶ capture
//!        │
//!        ├─ storage configured: ArtifactStore::put ─▶ ResultCache::set_if_absent ─▶ {"url"}
//!        └─ otherwise: image/png bytes
//! ```
//!
//! ## Browser lifecycle
//!
//! | Mode | Lifecycle | Launch flags | Headless |
//! |------|-----------|--------------|----------|
//! | `APP_ENV=production` | persistent | serverless set | yes |
//! | `APP_ENV=development` | per-capture | local set, sandbox off | no |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use screenshot_service::{CaptureRequest, CliRunner, Config, Metrics};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runner = CliRunner::new(Config::default(), Arc::new(Metrics::noop()))?;
//!
//!     let request = CaptureRequest::new("https://example.com").with_viewport(1280, 720);
//!     let outcome = runner.coordinator.capture(&request).await?;
//!     println!("{outcome:?}");
//!
//!     runner.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! screenshot-service serve --port 3000
//! screenshot-service capture --url https://example.com --output example.png
//! screenshot-service validate --config service.json
//! ```

/// Configuration and settings for the service
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Capture request model and query normalization
pub mod request;

/// Deterministic cache keys
pub mod cache_key;

/// Write-once result cache backends
pub mod result_cache;

/// Durable artifact storage backends
pub mod artifact_store;

/// Renderer capability traits
pub mod renderer;

/// chromiumoxide-backed renderer
pub mod chromium;

/// Shared browser lifecycle state machine
pub mod browser_session;

/// Capture pipeline orchestration
pub mod coordinator;

/// HTTP endpoints
pub mod server;

/// Command-line interface implementation
pub mod cli;

/// Metrics collection and Prometheus export
pub mod metrics;

/// Health reporting for the browser session
pub mod health;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod tests;

pub use artifact_store::*;
pub use browser_session::*;
pub use cache_key::*;
pub use chromium::*;
pub use cli::*;
pub use config::*;
pub use coordinator::*;
pub use error::*;
pub use health::*;
pub use crate::metrics::*;
pub use renderer::*;
pub use request::*;
pub use result_cache::*;
pub use server::*;
pub use utils::*;
