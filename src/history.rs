//! Per-interval crawl history. Runs that finish cleanly record which source
//! intervals they stored, so gaps can be found and re-crawled later.

use crate::controller::ControllerReturn;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashSet;

/// Width of one market interval.
pub const HISTORY_INTERVAL_MINUTES: i64 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrawlHistoryEntry {
    pub interval: DateTime<Utc>,
    pub records: Option<u64>,
}

impl CrawlHistoryEntry {
    pub fn from_return(result: &ControllerReturn) -> Vec<Self> {
        result
            .intervals
            .iter()
            .map(|(interval, records)| Self {
                interval: *interval,
                records: Some(*records),
            })
            .collect()
    }
}

/// Rounds down to the start of the interval containing `at`.
pub fn floor_interval(at: DateTime<Utc>) -> DateTime<Utc> {
    let step = HISTORY_INTERVAL_MINUTES * 60;
    let secs = at.timestamp() - at.timestamp().rem_euclid(step);
    DateTime::from_timestamp(secs, 0).unwrap_or(at)
}

/// Keyed by crawler name and interval.
#[async_trait]
pub trait CrawlHistoryStore: Send + Sync {
    /// Adds entries whose interval is not recorded yet. Returns how many were added.
    async fn set_history(&self, name: &str, entries: &[CrawlHistoryEntry]) -> Result<u64>;

    /// Entries with `since <= interval <= until`, oldest first.
    async fn history(
        &self,
        name: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<CrawlHistoryEntry>>;

    /// Removes history for one crawler or all of them, optionally only the
    /// intervals of the last `days`.
    async fn flush_history(&self, name: Option<&str>, days: Option<u32>) -> Result<u64>;

    /// Intervals in the `days` before `until` with no stored records, newest first.
    async fn missing_intervals(
        &self,
        name: &str,
        until: DateTime<Utc>,
        days: u32,
    ) -> Result<Vec<DateTime<Utc>>> {
        let until = floor_interval(until);
        let since = until - Duration::days(i64::from(days));

        let seen: HashSet<DateTime<Utc>> = self
            .history(name, since, until)
            .await?
            .into_iter()
            .filter(|entry| entry.records.is_some())
            .map(|entry| entry.interval)
            .collect();

        let step = Duration::minutes(HISTORY_INTERVAL_MINUTES);
        let mut missing = Vec::new();
        let mut cursor = until;
        while cursor >= since {
            if !seen.contains(&cursor) {
                missing.push(cursor);
            }
            cursor -= step;
        }
        Ok(missing)
    }
}

/// Cut-off for a `days`-limited flush.
pub(crate) fn flush_cutoff(days: Option<u32>) -> Option<DateTime<Utc>> {
    days.map(|days| Utc::now() - Duration::days(i64::from(days)))
}
