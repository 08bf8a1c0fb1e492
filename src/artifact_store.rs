//! Durable storage for captured images
//!
//! An [`ArtifactStore`] takes raw bytes and hands back a public URL. The HTTP
//! store PUTs objects to a blob API; the local store writes files under a
//! directory served from a known base URL.

use crate::ScreenshotError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoredArtifact {
    pub url: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` at `path` with public read access.
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<StoredArtifact, ScreenshotError>;
}

/// Object path for a new PNG capture: `screenshots/YYYY/MM/DD/<uuid>.png`.
pub fn artifact_path(now: DateTime<Utc>) -> String {
    format!(
        "screenshots/{}/{}.png",
        now.format("%Y/%m/%d"),
        uuid::Uuid::new_v4()
    )
}

/// Blob API reached with an authenticated `PUT {endpoint}/{path}`.
///
/// The API is expected to answer with a JSON body carrying the public `url`.
pub struct HttpArtifactStore {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

impl HttpArtifactStore {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<StoredArtifact, ScreenshotError> {
        let size = bytes.len();
        let target = format!("{}/{}", self.endpoint, path.trim_start_matches('/'));

        let response = self
            .client
            .put(&target)
            .bearer_auth(&self.token)
            .header("x-content-type", content_type)
            .header("content-type", content_type)
            .header("x-access", "public")
            .body(bytes)
            .send()
            .await
            .map_err(|e| ScreenshotError::ArtifactStore(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ScreenshotError::ArtifactStore(format!(
                "upload of {path} failed with HTTP {status}: {body}"
            )));
        }

        let artifact: StoredArtifact = response
            .json()
            .await
            .map_err(|e| ScreenshotError::ArtifactStore(format!("unreadable reply: {e}")))?;

        info!("Uploaded {} ({}) to {}", path, crate::format_bytes(size), artifact.url);
        Ok(artifact)
    }
}

/// Filesystem store whose files are served from `public_base_url`.
pub struct LocalArtifactStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<StoredArtifact, ScreenshotError> {
        let relative = path.trim_start_matches('/');
        if relative.split('/').any(|segment| segment == "..") {
            return Err(ScreenshotError::ArtifactStore(format!(
                "refusing path outside store root: {path}"
            )));
        }

        let target = self.root.join(relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ScreenshotError::ArtifactStore(e.to_string()))?;
        }
        tokio::fs::write(&target, &bytes)
            .await
            .map_err(|e| ScreenshotError::ArtifactStore(e.to_string()))?;

        debug!("Wrote artifact {}", target.display());
        Ok(StoredArtifact {
            url: format!("{}/{}", self.public_base_url, relative),
        })
    }
}
