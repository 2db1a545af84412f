use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use validator::{Validate, ValidationError};

/// Format version written with every crawl attempt.
pub const WATERMARK_VERSION: u32 = 2;

/// Persisted per-crawler progress.
///
/// `server_latest` is the resume point for since-watermark crawls and only
/// moves forward on runs that finish without errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_watermark"))]
pub struct CrawlWatermark {
    #[serde(default)]
    pub version: Option<u32>,

    #[serde(default)]
    pub last_attempted: Option<DateTime<Utc>>,

    #[serde(default)]
    pub last_processed: Option<DateTime<Utc>>,

    #[serde(default)]
    pub server_latest: Option<DateTime<Utc>>,
}

fn validate_watermark(watermark: &CrawlWatermark) -> std::result::Result<(), ValidationError> {
    if let Some(version) = watermark.version {
        if version == 0 || version > WATERMARK_VERSION {
            let mut err = ValidationError::new("version");
            err.message = Some(Cow::from(format!("unsupported watermark version {}", version)));
            return Err(err);
        }
    }

    if let (Some(processed), Some(latest)) = (watermark.last_processed, watermark.server_latest) {
        if processed > latest {
            let mut err = ValidationError::new("last_processed");
            err.message = Some(Cow::from(format!(
                "last_processed {} is after server_latest {}",
                processed, latest
            )));
            return Err(err);
        }
    }
    Ok(())
}

impl CrawlWatermark {
    pub fn attempted(mut self, version: u32, at: DateTime<Utc>) -> Self {
        self.version = Some(version);
        self.last_attempted = Some(at);
        self
    }

    /// Advances the resume markers, never moving `server_latest` backwards.
    pub fn processed(mut self, latest: DateTime<Utc>) -> Self {
        let server_latest = self.server_latest.map_or(latest, |current| current.max(latest));
        self.server_latest = Some(server_latest);
        self.last_processed = Some(latest.min(server_latest));
        self
    }
}

/// Keyed by crawler name. Writes for one name are serialized by the caller.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<CrawlWatermark>>;

    async fn all(&self) -> Result<Vec<(String, CrawlWatermark)>>;

    async fn put(&self, name: &str, watermark: &CrawlWatermark) -> Result<()>;

    /// Removes stored watermarks, for one crawler or all of them.
    async fn flush(&self, name: Option<&str>) -> Result<u64>;

    async fn record_attempt(&self, name: &str, version: u32, at: DateTime<Utc>) -> Result<CrawlWatermark> {
        let updated = self.get(name).await?.unwrap_or_default().attempted(version, at);
        self.put(name, &updated).await?;
        Ok(updated)
    }

    async fn record_success(&self, name: &str, latest: DateTime<Utc>) -> Result<CrawlWatermark> {
        let updated = self.get(name).await?.unwrap_or_default().processed(latest);
        self.put(name, &updated).await?;
        Ok(updated)
    }
}
