//! Deterministic cache keys for capture requests

use crate::CaptureRequest;
use std::fmt;

const KEY_PREFIX: &str = "screenshot:v1";
const ABSENT: &str = "-";

/// Key under which a capture result is cached.
///
/// Fields are written in a fixed order. Strings are length-prefixed so a `|`
/// inside a URL or selector cannot shift field boundaries, and absent
/// optional fields are written as `-`, which no present field can produce.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn build(request: &CaptureRequest) -> Self {
        let selector = match &request.selector {
            Some(selector) => format!("{}:{}", selector.len(), selector),
            None => ABSENT.to_string(),
        };
        let clip = match &request.clip {
            Some(clip) => format!("{},{},{},{}", clip.x, clip.y, clip.width, clip.height),
            None => ABSENT.to_string(),
        };

        Self(format!(
            "{KEY_PREFIX}|url={}:{}|w={}|h={}|sel={selector}|clip={clip}",
            request.url.len(),
            request.url,
            request.viewport.width,
            request.viewport.height,
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
