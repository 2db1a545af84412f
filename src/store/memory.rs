use super::{DomainStore, UpsertOutcome};
use crate::error::Result;
use crate::history::{CrawlHistoryEntry, CrawlHistoryStore, flush_cutoff};
use crate::parser::{Record, TableSchema};
use crate::watermark::{CrawlWatermark, WatermarkStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

type KeyedRows = HashMap<Vec<String>, Record>;

/// Keeps rows in memory. Used by tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, KeyedRows>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts and updates applied so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    pub async fn records(&self, table: &str) -> Vec<Record> {
        let tables = self.tables.lock().await;
        tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DomainStore for MemoryStore {
    async fn prepare(&self, schema: &TableSchema) -> Result<()> {
        self.tables
            .lock()
            .await
            .entry(schema.name.clone())
            .or_default();
        Ok(())
    }

    async fn upsert(&self, schema: &TableSchema, record: &Record) -> Result<UpsertOutcome> {
        let key: Vec<String> = schema.key_of(record).iter().map(|v| v.to_string()).collect();

        let mut tables = self.tables.lock().await;
        let rows = tables.entry(schema.name.clone()).or_default();

        let outcome = match rows.get(&key) {
            None => UpsertOutcome::Inserted,
            Some(existing) if existing == record => UpsertOutcome::Unchanged,
            Some(_) => UpsertOutcome::Updated,
        };

        if outcome.changed() {
            rows.insert(key, record.clone());
            self.writes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(outcome)
    }

    async fn count(&self, table: &str) -> Result<u64> {
        let tables = self.tables.lock().await;
        Ok(tables.get(table).map_or(0, |rows| rows.len() as u64))
    }
}

/// Watermarks and crawl history in memory.
#[derive(Default)]
pub struct MemoryWatermarkStore {
    marks: Mutex<BTreeMap<String, CrawlWatermark>>,
    history: Mutex<BTreeMap<(String, DateTime<Utc>), Option<u64>>>,
    writes: AtomicUsize,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, watermark: CrawlWatermark) -> Self {
        self.marks.get_mut().insert(name.to_string(), watermark);
        self
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarkStore {
    async fn get(&self, name: &str) -> Result<Option<CrawlWatermark>> {
        Ok(self.marks.lock().await.get(name).cloned())
    }

    async fn all(&self) -> Result<Vec<(String, CrawlWatermark)>> {
        let marks = self.marks.lock().await;
        Ok(marks.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    async fn put(&self, name: &str, watermark: &CrawlWatermark) -> Result<()> {
        self.marks
            .lock()
            .await
            .insert(name.to_string(), watermark.clone());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn flush(&self, name: Option<&str>) -> Result<u64> {
        let mut marks = self.marks.lock().await;
        let removed = match name {
            Some(name) => marks.remove(name).map_or(0, |_| 1),
            None => {
                let count = marks.len() as u64;
                marks.clear();
                count
            }
        };
        Ok(removed)
    }
}

#[async_trait]
impl CrawlHistoryStore for MemoryWatermarkStore {
    async fn set_history(&self, name: &str, entries: &[CrawlHistoryEntry]) -> Result<u64> {
        let mut history = self.history.lock().await;
        let mut added = 0;
        for entry in entries {
            let key = (name.to_string(), entry.interval);
            if !history.contains_key(&key) {
                history.insert(key, entry.records);
                added += 1;
            }
        }
        Ok(added)
    }

    async fn history(
        &self,
        name: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<CrawlHistoryEntry>> {
        let history = self.history.lock().await;
        Ok(history
            .range((name.to_string(), since)..=(name.to_string(), until))
            .map(|((_, interval), records)| CrawlHistoryEntry {
                interval: *interval,
                records: *records,
            })
            .collect())
    }

    async fn flush_history(&self, name: Option<&str>, days: Option<u32>) -> Result<u64> {
        let cutoff = flush_cutoff(days);
        let mut history = self.history.lock().await;
        let before = history.len();
        history.retain(|(crawler, interval), _| {
            let named = name.is_none_or(|name| crawler.as_str() == name);
            let recent = cutoff.is_none_or(|cutoff| *interval >= cutoff);
            !(named && recent)
        });
        Ok((before - history.len()) as u64)
    }
}
