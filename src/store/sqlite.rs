use super::{DomainStore, UpsertOutcome};
use crate::error::{Error, Result};
use crate::history::{CrawlHistoryEntry, CrawlHistoryStore, flush_cutoff};
use crate::parser::{FieldValue, Record, TableSchema};
use crate::watermark::{CrawlWatermark, WatermarkStore};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteArguments, SqlitePool};
use sqlx::Sqlite;
use std::collections::HashSet;
use std::path::Path;
use tokio::sync::Mutex;

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Domain tables and crawl metadata in one SQLite database.
pub struct SqliteStore {
    pool: SqlitePool,
    prepared: Mutex<HashSet<String>>,
}

impl SqliteStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(url).await.map_err(Error::Database)?;

        let store = Self {
            pool,
            prepared: Mutex::new(HashSet::new()),
        };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn open(path: &Path) -> Result<Self> {
        Self::connect(&format!("sqlite:{}?mode=rwc", path.display())).await
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS crawl_meta (
                crawler_name TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS crawl_history (
                crawler_name TEXT NOT NULL,
                interval TEXT NOT NULL,
                inserted_records INTEGER,
                recorded_at TEXT NOT NULL,
                PRIMARY KEY (crawler_name, interval)
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn quoted(name: &str) -> String {
    format!("\"{}\"", name)
}

fn bind_value<'q>(query: SqliteQuery<'q>, value: &FieldValue) -> SqliteQuery<'q> {
    match value {
        FieldValue::Null => query.bind(None::<String>),
        FieldValue::Text(s) => query.bind(s.clone()),
        FieldValue::Integer(v) => query.bind(*v),
        FieldValue::Decimal(v) => query.bind(*v),
        FieldValue::Timestamp(_) => query.bind(value.to_string()),
    }
}

fn bind_record<'q>(mut query: SqliteQuery<'q>, record: &Record) -> SqliteQuery<'q> {
    for value in &record.values {
        query = bind_value(query, value);
    }
    query
}

#[async_trait]
impl DomainStore for SqliteStore {
    async fn prepare(&self, schema: &TableSchema) -> Result<()> {
        let mut prepared = self.prepared.lock().await;
        if prepared.contains(&schema.name) {
            return Ok(());
        }

        let columns: Vec<String> = schema
            .columns
            .iter()
            .map(|c| format!("{} {}", quoted(&c.name), c.kind.sql_type()))
            .collect();
        let keys: Vec<String> = schema.natural_key.iter().map(|k| quoted(k)).collect();

        let query = format!(
            "CREATE TABLE IF NOT EXISTS {} ({}, PRIMARY KEY ({}))",
            quoted(&schema.name),
            columns.join(", "),
            keys.join(", ")
        );
        sqlx::query(&query).execute(&self.pool).await?;

        prepared.insert(schema.name.clone());
        Ok(())
    }

    async fn upsert(&self, schema: &TableSchema, record: &Record) -> Result<UpsertOutcome> {
        if record.values.len() != schema.columns.len() {
            return Err(Error::Internal(format!(
                "record has {} values, {} expects {}",
                record.values.len(),
                schema.name,
                schema.columns.len()
            )));
        }

        let table = quoted(&schema.name);
        let columns: Vec<String> = schema.columns.iter().map(|c| quoted(&c.name)).collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
        let keys: Vec<String> = schema.natural_key.iter().map(|k| quoted(k)).collect();

        let insert = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO NOTHING",
            table,
            columns.join(", "),
            placeholders.join(", "),
            keys.join(", ")
        );

        let mut tx = self.pool.begin().await?;

        let inserted = bind_record(sqlx::query(&insert), record)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if inserted > 0 {
            tx.commit().await?;
            return Ok(UpsertOutcome::Inserted);
        }

        let mut assignments = Vec::new();
        let mut key_matches = Vec::new();
        let mut differences = Vec::new();
        for (i, column) in columns.iter().enumerate() {
            let param = format!("?{}", i + 1);
            if schema.is_key(&schema.columns[i].name) {
                key_matches.push(format!("{} = {}", column, param));
            } else {
                assignments.push(format!("{} = {}", column, param));
                differences.push(format!("{} IS NOT {}", column, param));
            }
        }

        if assignments.is_empty() {
            tx.commit().await?;
            return Ok(UpsertOutcome::Unchanged);
        }

        let update = format!(
            "UPDATE {} SET {} WHERE {} AND ({})",
            table,
            assignments.join(", "),
            key_matches.join(" AND "),
            differences.join(" OR ")
        );

        let updated = bind_record(sqlx::query(&update), record)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        Ok(if updated > 0 {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Unchanged
        })
    }

    async fn count(&self, table: &str) -> Result<u64> {
        let query = format!("SELECT COUNT(*) FROM {}", quoted(table));
        let count: i64 = sqlx::query_scalar(&query).fetch_one(&self.pool).await?;
        Ok(count as u64)
    }
}

fn decode_watermark(name: &str, data: &str) -> Result<CrawlWatermark> {
    serde_json::from_str(data)
        .map_err(|e| Error::Config(format!("stored watermark for {} is unreadable: {}", name, e)))
}

#[async_trait]
impl WatermarkStore for SqliteStore {
    async fn get(&self, name: &str) -> Result<Option<CrawlWatermark>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT data FROM crawl_meta WHERE crawler_name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(data,)| decode_watermark(name, &data)).transpose()
    }

    async fn all(&self) -> Result<Vec<(String, CrawlWatermark)>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT crawler_name, data FROM crawl_meta ORDER BY crawler_name")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(name, data)| decode_watermark(&name, &data).map(|w| (name, w)))
            .collect()
    }

    async fn put(&self, name: &str, watermark: &CrawlWatermark) -> Result<()> {
        let data = serde_json::to_string(watermark)?;
        sqlx::query(
            "INSERT INTO crawl_meta (crawler_name, data, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (crawler_name) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
        )
        .bind(name)
        .bind(data)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn flush(&self, name: Option<&str>) -> Result<u64> {
        let result = match name {
            Some(name) => {
                sqlx::query("DELETE FROM crawl_meta WHERE crawler_name = ?1")
                    .bind(name)
                    .execute(&self.pool)
                    .await?
            }
            None => sqlx::query("DELETE FROM crawl_meta").execute(&self.pool).await?,
        };
        Ok(result.rows_affected())
    }
}

/// Fixed-width UTC text so stored intervals compare in time order.
fn interval_text(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[async_trait]
impl CrawlHistoryStore for SqliteStore {
    async fn set_history(&self, name: &str, entries: &[CrawlHistoryEntry]) -> Result<u64> {
        let recorded_at = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        let mut added = 0;

        for entry in entries {
            added += sqlx::query(
                "INSERT INTO crawl_history (crawler_name, interval, inserted_records, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (crawler_name, interval) DO NOTHING",
            )
            .bind(name)
            .bind(interval_text(entry.interval))
            .bind(entry.records.map(|r| r as i64))
            .bind(recorded_at.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        tx.commit().await?;
        Ok(added)
    }

    async fn history(
        &self,
        name: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<CrawlHistoryEntry>> {
        let rows: Vec<(String, Option<i64>)> = sqlx::query_as(
            "SELECT interval, inserted_records FROM crawl_history
             WHERE crawler_name = ?1 AND interval >= ?2 AND interval <= ?3
             ORDER BY interval",
        )
        .bind(name)
        .bind(interval_text(since))
        .bind(interval_text(until))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(interval, records)| {
                let interval = DateTime::parse_from_rfc3339(&interval)
                    .map_err(|e| Error::Parse(format!("stored interval {:?}: {}", interval, e)))?;
                Ok(CrawlHistoryEntry {
                    interval: interval.with_timezone(&Utc),
                    records: records.map(|r| r as u64),
                })
            })
            .collect()
    }

    async fn flush_history(&self, name: Option<&str>, days: Option<u32>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM crawl_history
             WHERE (?1 IS NULL OR crawler_name = ?1) AND (?2 IS NULL OR interval >= ?2)",
        )
        .bind(name)
        .bind(flush_cutoff(days).map(interval_text))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::SchemaRegistry;
    use chrono::{TimeZone, Utc};

    fn scada_record(duid: &str, value: f64) -> Record {
        Record::new(vec![
            FieldValue::Timestamp(Utc.with_ymd_and_hms(2022, 6, 12, 0, 5, 0).unwrap()),
            FieldValue::Text(duid.to_string()),
            FieldValue::Decimal(value),
        ])
    }

    #[tokio::test]
    async fn upsert_is_keyed_and_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("grid.db")).await.unwrap();
        let registry = SchemaRegistry::builtin();
        let schema = registry.get("dispatch_unit_scada").unwrap();
        store.prepare(schema).await.unwrap();

        let first = scada_record("BW01", 512.3);
        assert_eq!(store.upsert(schema, &first).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert(schema, &first).await.unwrap(), UpsertOutcome::Unchanged);
        assert_eq!(
            store.upsert(schema, &scada_record("BW01", 500.0)).await.unwrap(),
            UpsertOutcome::Updated
        );
        assert_eq!(
            store.upsert(schema, &scada_record("BW01", 0.0)).await.unwrap(),
            UpsertOutcome::Updated
        );
        assert_eq!(store.count("dispatch_unit_scada").await.unwrap(), 1);

        store.upsert(schema, &scada_record("BW02", 1.0)).await.unwrap();
        assert_eq!(store.count("dispatch_unit_scada").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn null_values_compare_as_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("grid.db")).await.unwrap();
        let registry = SchemaRegistry::builtin();
        let schema = registry.get("dispatch_unit_scada").unwrap();
        store.prepare(schema).await.unwrap();

        let mut record = scada_record("BW01", 1.0);
        record.values[2] = FieldValue::Null;
        store.upsert(schema, &record).await.unwrap();
        assert_eq!(store.upsert(schema, &record).await.unwrap(), UpsertOutcome::Unchanged);
    }

    #[tokio::test]
    async fn watermarks_round_trip_and_flush() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("grid.db")).await.unwrap();
        let day = |d| Utc.with_ymd_and_hms(2022, 6, d, 0, 0, 0).unwrap();

        store.record_attempt("au.nemweb.dispatch_is", 2, day(15)).await.unwrap();
        store.record_success("au.nemweb.dispatch_is", day(14)).await.unwrap();
        store.record_success("au.nemweb.dispatch_is", day(13)).await.unwrap();
        store.record_attempt("au.nemweb.trading_is", 2, day(15)).await.unwrap();

        let mark = store.get("au.nemweb.dispatch_is").await.unwrap().unwrap();
        assert_eq!(mark.version, Some(2));
        assert_eq!(mark.last_attempted, Some(day(15)));
        assert_eq!(mark.server_latest, Some(day(14)));
        assert_eq!(store.all().await.unwrap().len(), 2);

        assert_eq!(store.flush(Some("au.nemweb.trading_is")).await.unwrap(), 1);
        assert!(store.get("au.nemweb.trading_is").await.unwrap().is_none());
        assert_eq!(store.flush(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unreadable_watermark_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("grid.db")).await.unwrap();
        sqlx::query("INSERT INTO crawl_meta (crawler_name, data, updated_at) VALUES ('x', '{\"server_latest\": 12}', '')")
            .execute(&store.pool)
            .await
            .unwrap();

        assert!(matches!(store.get("x").await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn history_skips_known_intervals_and_flushes_recent_days() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("grid.db")).await.unwrap();
        let recent = crate::history::floor_interval(Utc::now());
        let old = Utc.with_ymd_and_hms(2022, 6, 12, 0, 5, 0).unwrap();
        let entry = |interval, records| CrawlHistoryEntry {
            interval,
            records: Some(records),
        };

        let added = store
            .set_history("au.nemweb.dispatch_is", &[entry(old, 5), entry(recent, 3)])
            .await
            .unwrap();
        assert_eq!(added, 2);
        assert_eq!(
            store
                .set_history("au.nemweb.dispatch_is", &[entry(old, 9)])
                .await
                .unwrap(),
            0
        );

        let stored = store
            .history("au.nemweb.dispatch_is", old, recent)
            .await
            .unwrap();
        assert_eq!(stored, vec![entry(old, 5), entry(recent, 3)]);

        let missing = store
            .missing_intervals("au.nemweb.dispatch_is", recent, 1)
            .await
            .unwrap();
        assert_eq!(missing.len(), 288);
        assert!(!missing.contains(&recent));

        assert_eq!(
            store
                .flush_history(Some("au.nemweb.dispatch_is"), Some(2))
                .await
                .unwrap(),
            1
        );
        let left = store
            .history("au.nemweb.dispatch_is", old, recent)
            .await
            .unwrap();
        assert_eq!(left, vec![entry(old, 5)]);
        assert_eq!(store.flush_history(None, None).await.unwrap(), 1);
    }
}
