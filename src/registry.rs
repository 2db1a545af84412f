//! Crawler definitions merged with their stored watermarks.

use crate::config::{CrawlConfig, CrawlerConfig};
use crate::dirlisting::Selection;
use crate::error::{Error, Result};
use crate::parser::SchemaRegistry;
use crate::processor::Processor;
use crate::watermark::{CrawlWatermark, WatermarkStore};
use chrono_tz::Tz;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tokio::sync::RwLock;
use url::Url;
use validator::Validate;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionMode {
    /// Every file in the listing.
    #[default]
    Full,
    /// Only files modified after the stored `server_latest`.
    SinceWatermark,
    /// The `limit` newest files.
    MostRecent,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum CrawlerSchedule {
    Live,
    Frequent,
    QuarterHour,
    HalfHour,
    Hourly,
    FourTimesADay,
    Daily,
}

impl CrawlerSchedule {
    pub const ALL: [CrawlerSchedule; 7] = [
        CrawlerSchedule::Live,
        CrawlerSchedule::Frequent,
        CrawlerSchedule::QuarterHour,
        CrawlerSchedule::HalfHour,
        CrawlerSchedule::Hourly,
        CrawlerSchedule::FourTimesADay,
        CrawlerSchedule::Daily,
    ];

    /// Six-field cron expression, seconds first.
    pub fn cron(&self) -> &'static str {
        match self {
            CrawlerSchedule::Live => "0 * * * * *",
            CrawlerSchedule::Frequent => "0 */5 * * * *",
            CrawlerSchedule::QuarterHour => "0 */15 * * * *",
            CrawlerSchedule::HalfHour => "0 */30 * * * *",
            CrawlerSchedule::Hourly => "0 0 * * * *",
            CrawlerSchedule::FourTimesADay => "0 0 */6 * * *",
            CrawlerSchedule::Daily => "0 0 0 * * *",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlerSchedule::Live => "live",
            CrawlerSchedule::Frequent => "frequent",
            CrawlerSchedule::QuarterHour => "quarter_hour",
            CrawlerSchedule::HalfHour => "half_hour",
            CrawlerSchedule::Hourly => "hourly",
            CrawlerSchedule::FourTimesADay => "four_times_a_day",
            CrawlerSchedule::Daily => "daily",
        }
    }
}

impl fmt::Display for CrawlerSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct CrawlerDefinition {
    pub name: String,
    pub url: Option<Url>,
    pub timezone: Tz,
    pub mode: SelectionMode,
    pub limit: Option<usize>,
    pub filename_filter: Option<Regex>,
    pub processor: Processor,
    pub schedule: Option<CrawlerSchedule>,
    pub encoding: Option<String>,
    pub active: bool,
    pub watermark: CrawlWatermark,
}

impl CrawlerDefinition {
    pub fn from_config(config: &CrawlerConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::Config(format!("crawler {}: {}", config.name, e)))?;

        let url = config
            .url
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(|e| Error::Config(format!("crawler {}: {}", config.name, e)))?;

        let timezone = config
            .timezone
            .parse::<Tz>()
            .map_err(|e| Error::Config(format!("crawler {}: {}", config.name, e)))?;

        let filename_filter = config
            .filename_filter
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| Error::Config(format!("crawler {}: {}", config.name, e)))?;

        Ok(Self {
            name: config.name.clone(),
            url,
            timezone,
            mode: config.mode,
            limit: config.limit,
            filename_filter,
            processor: config.processor.clone(),
            schedule: config.schedule,
            encoding: config.encoding.clone(),
            active: config.active,
            watermark: CrawlWatermark::default(),
        })
    }

    /// Folds a stored watermark into this definition. A watermark that does
    /// not validate refuses the merge.
    pub fn merge_watermark(&self, stored: CrawlWatermark) -> Result<Self> {
        stored.validate().map_err(|e| {
            Error::Config(format!("crawler {}: stored watermark is invalid: {}", self.name, e))
        })?;

        Ok(Self {
            watermark: stored,
            ..self.clone()
        })
    }

    /// Which files the next run processes. With `use_watermark` off a
    /// since-watermark crawler falls back to its limit, or to everything.
    pub fn selection(&self, use_watermark: bool) -> Selection {
        let fallback = || match self.limit {
            Some(limit) => Selection::MostRecent(limit),
            None => Selection::All,
        };

        match self.mode {
            SelectionMode::Full => Selection::All,
            SelectionMode::MostRecent => fallback(),
            SelectionMode::SinceWatermark => match self.watermark.server_latest {
                Some(latest) if use_watermark => Selection::ModifiedSince(latest),
                _ => fallback(),
            },
        }
    }

    pub fn require_url(&self) -> Result<&Url> {
        self.url
            .as_ref()
            .ok_or_else(|| Error::Config(format!("crawler {} has no url", self.name)))
    }
}

/// Every crawler known to this process. Built once at startup and handed to
/// the orchestrator and scheduler.
#[derive(Debug, Default)]
pub struct CrawlerRegistry {
    crawlers: RwLock<Vec<CrawlerDefinition>>,
}

impl CrawlerRegistry {
    /// Builds definitions from `config` and merges the stored watermark of each.
    pub async fn initialize(
        config: &CrawlConfig,
        schemas: &SchemaRegistry,
        watermarks: &dyn WatermarkStore,
    ) -> Result<Self> {
        let mut definitions = Vec::with_capacity(config.crawlers.len());

        for crawler in &config.crawlers {
            let definition = CrawlerDefinition::from_config(crawler)?;

            if let Some(table) = definition.processor.target_table() {
                if !schemas.contains(table) {
                    return Err(Error::Config(format!(
                        "crawler {} writes to unregistered table {}",
                        definition.name, table
                    )));
                }
            }

            let definition = match watermarks.get(&definition.name).await? {
                Some(stored) => definition.merge_watermark(stored)?,
                None => definition,
            };
            definitions.push(definition);
        }

        let registry = Self::from_definitions(definitions)?;
        log::info!("Loaded {} crawlers", registry.len().await);
        Ok(registry)
    }

    pub fn from_definitions(definitions: Vec<CrawlerDefinition>) -> Result<Self> {
        let mut seen = HashSet::new();
        for definition in &definitions {
            if !seen.insert(definition.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate crawler name {}",
                    definition.name
                )));
            }
        }

        Ok(Self {
            crawlers: RwLock::new(definitions),
        })
    }

    pub async fn by_name(&self, name: &str) -> Option<CrawlerDefinition> {
        let crawlers = self.crawlers.read().await;
        crawlers.iter().find(|c| c.name == name).cloned()
    }

    pub async fn by_schedule(&self, schedule: CrawlerSchedule) -> Vec<CrawlerDefinition> {
        let crawlers = self.crawlers.read().await;
        crawlers
            .iter()
            .filter(|c| c.schedule == Some(schedule))
            .cloned()
            .collect()
    }

    pub async fn definitions(&self) -> Vec<CrawlerDefinition> {
        self.crawlers.read().await.clone()
    }

    pub async fn names(&self) -> Vec<String> {
        let crawlers = self.crawlers.read().await;
        crawlers.iter().map(|c| c.name.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.crawlers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.crawlers.read().await.is_empty()
    }

    /// Swaps in the definition produced by a finished run.
    pub async fn replace(&self, definition: CrawlerDefinition) {
        let mut crawlers = self.crawlers.write().await;
        match crawlers.iter_mut().find(|c| c.name == definition.name) {
            Some(existing) => *existing = definition,
            None => log::warn!("Ignoring update for unknown crawler {}", definition.name),
        }
    }
}
