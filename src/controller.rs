use crate::error::{Error, Result};
use crate::parser::{ParseOutcome, Record, SchemaRegistry, TableSchema, TableSet};
use crate::store::DomainStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Counts from one ingest pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ControllerReturn {
    /// Rows attempted, including rows the parser rejected.
    pub total_records: usize,
    /// Rows that were inserted or actually changed.
    pub inserted_records: usize,
    pub errors: usize,
    pub error_detail: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    /// Stored records per source interval, for tables keyed by a timestamp.
    #[serde(skip)]
    pub intervals: BTreeMap<DateTime<Utc>, u64>,
}

impl ControllerReturn {
    pub fn is_clean(&self) -> bool {
        self.errors == 0
    }

    pub fn summary(&self) -> String {
        format!(
            "Inserted {} of {} records",
            self.inserted_records, self.total_records
        )
    }

    fn note_error(&mut self, detail: String) {
        self.errors += 1;
        if self.error_detail.is_none() {
            self.error_detail = Some(detail);
        }
    }
}

pub struct IngestController {
    store: Arc<dyn DomainStore>,
    schemas: Arc<SchemaRegistry>,
}

impl IngestController {
    pub fn new(store: Arc<dyn DomainStore>, schemas: Arc<SchemaRegistry>) -> Self {
        Self { store, schemas }
    }

    /// Upserts every record of `tables` by natural key.
    ///
    /// Single-record store failures are counted and skipped. Only an
    /// unregistered table or an unreachable store fails the call, and the
    /// former is detected before anything is written.
    pub async fn ingest(
        &self,
        tables: &TableSet,
        last_modified: Option<DateTime<Utc>>,
    ) -> Result<ControllerReturn> {
        let result = self.upsert_all(tables, last_modified).await?;
        log::info!("{}", result.summary());
        Ok(result)
    }

    /// Ingests a parse result, folding its rejected rows into the totals.
    pub async fn ingest_parsed(
        &self,
        parsed: &ParseOutcome,
        last_modified: Option<DateTime<Utc>>,
    ) -> Result<ControllerReturn> {
        let mut result = self.upsert_all(&parsed.tables, last_modified).await?;

        result.total_records += parsed.row_errors;
        result.errors += parsed.row_errors;
        result.error_detail = parsed.error_detail.clone().or(result.error_detail.take());

        log::info!("{}", result.summary());
        Ok(result)
    }

    async fn upsert_all(
        &self,
        tables: &TableSet,
        last_modified: Option<DateTime<Utc>>,
    ) -> Result<ControllerReturn> {
        let resolved = tables
            .iter()
            .map(|(name, records)| {
                self.schemas
                    .get(name)
                    .map(|schema| (schema, records))
                    .ok_or_else(|| Error::Schema(format!("table {} is not registered", name)))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut result = ControllerReturn {
            last_modified,
            ..Default::default()
        };

        for (schema, records) in resolved {
            self.store.prepare(schema).await?;
            self.ingest_table(schema, records, &mut result).await?;
        }
        Ok(result)
    }

    async fn ingest_table(
        &self,
        schema: &TableSchema,
        records: &[Record],
        result: &mut ControllerReturn,
    ) -> Result<()> {
        for record in records {
            result.total_records += 1;

            match self.store.upsert(schema, record).await {
                Ok(outcome) => {
                    if outcome.changed() {
                        result.inserted_records += 1;
                    }
                    if let Some(interval) = schema.interval_of(record) {
                        *result.intervals.entry(interval).or_default() += 1;
                    }
                }
                Err(e) if e.is_store_unavailable() => return Err(e),
                Err(e) => {
                    log::debug!("Upsert into {} failed: {}", schema.name, e);
                    result.note_error(format!("{}: {}", schema.name, e));
                }
            }
        }
        Ok(())
    }
}
