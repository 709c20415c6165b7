use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::catalog::write_json;

/// How long a refreshed catalog may be reused. Expiry is a hard cutover.
pub const VALIDITY_WINDOW_MINUTES: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
    pub last_refresh_time: DateTime<Utc>,
    pub quest_count: usize,
    pub unmatched_count: usize,
    pub wiki_only_count: usize,
    pub downloaded: usize,
    pub cached: usize,
    pub failed: usize,
    pub unmapped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheValidity {
    pub valid: bool,
    pub metadata: Option<CacheMetadata>,
    pub remaining: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct CacheLifecycle {
    path: PathBuf,
    window: Duration,
}

impl CacheLifecycle {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            window: Duration::minutes(VALIDITY_WINDOW_MINUTES),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn load(&self) -> Option<CacheMetadata> {
        let content = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&content) {
            Ok(metadata) => Some(metadata),
            Err(error) => {
                warn!(path = %self.path.display(), %error, "refresh metadata unreadable; cache treated as expired");
                None
            }
        }
    }

    pub fn is_valid(&self, now: DateTime<Utc>) -> CacheValidity {
        let Some(metadata) = self.load() else {
            return CacheValidity {
                valid: false,
                metadata: None,
                remaining: None,
            };
        };
        let elapsed = now - metadata.last_refresh_time;
        if elapsed < Duration::zero() {
            warn!(
                last_refresh = %metadata.last_refresh_time,
                "refresh metadata is stamped in the future; treating catalog as stale"
            );
        }
        if elapsed < Duration::zero() || elapsed >= self.window {
            return CacheValidity {
                valid: false,
                metadata: Some(metadata),
                remaining: None,
            };
        }
        let remaining = self.window - elapsed;
        CacheValidity {
            valid: true,
            metadata: Some(metadata),
            remaining: Some(remaining),
        }
    }

    pub fn record_refresh(&self, metadata: &CacheMetadata) -> Result<()> {
        write_json(&self.path, metadata)
    }
}
