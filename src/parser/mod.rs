//! Decoding raw files and archives into typed table sets.

mod archive;
mod mms;
mod observations;
mod plain;
pub mod schema;
pub mod table;

pub use archive::is_known_encoding;
pub use schema::{ColumnDef, ColumnType, SchemaRegistry, TableSchema};
pub use table::{FieldValue, ParseOutcome, Record, RowError, RowOutcome, TableSet};

use crate::error::{Error, Result};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Layout of the files a crawler fetches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum SourceFormat {
    /// Multi-table `C`/`I`/`D` report files.
    Mms,
    /// Header-row CSV feeding a single table.
    Csv { table: String },
    /// JSON observation feed feeding a single table.
    Observations { table: String },
}

impl SourceFormat {
    /// The single table this format writes to, if it is fixed.
    pub fn target_table(&self) -> Option<&str> {
        match self {
            SourceFormat::Mms => None,
            SourceFormat::Csv { table } | SourceFormat::Observations { table } => Some(table),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TableParser {
    schemas: Arc<SchemaRegistry>,
    timezone: Tz,
    encoding: Option<String>,
}

impl TableParser {
    pub fn new(schemas: Arc<SchemaRegistry>, timezone: Tz) -> Self {
        Self {
            schemas,
            timezone,
            encoding: None,
        }
    }

    pub fn with_encoding(mut self, encoding: Option<String>) -> Self {
        self.encoding = encoding;
        self
    }

    /// Parses one fetched file. Archives are expanded and every member's rows
    /// are merged; members without a recognizable table are dropped.
    pub fn parse(&self, name: &str, bytes: &[u8], format: &SourceFormat) -> Result<ParseOutcome> {
        if !archive::is_zip(bytes) {
            return self.parse_file(name, bytes, format);
        }

        let members = archive::expand_zip(bytes)?;
        let mut outcome = ParseOutcome::default();

        for member in members {
            match self.parse_file(&member.name, &member.bytes, format) {
                Ok(parsed) => outcome.merge(parsed),
                Err(e) if e.is_file_level() => {
                    log::warn!("Dropping {} from {}: {}", member.name, name, e);
                    outcome.files_failed += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if outcome.files_parsed == 0 {
            return Err(Error::Parse(format!(
                "{}: no archive member contained a recognizable table",
                name
            )));
        }

        log::debug!(
            "Parsed {} ({} members, {} records, {} row errors)",
            name,
            outcome.files_parsed,
            outcome.tables.total_records(),
            outcome.row_errors
        );
        Ok(outcome)
    }

    fn parse_file(&self, name: &str, bytes: &[u8], format: &SourceFormat) -> Result<ParseOutcome> {
        let text = archive::decode_text(bytes, self.encoding.as_deref())?;

        let result = match format {
            SourceFormat::Mms => mms::parse_mms(&text, &self.schemas, self.timezone),
            SourceFormat::Csv { table } => {
                plain::parse_csv_table(&text, self.schema(table)?, self.timezone)
            }
            SourceFormat::Observations { table } => {
                observations::parse_observations(&text, self.schema(table)?, self.timezone)
            }
        };

        result.map_err(|e| match e {
            Error::Parse(reason) => Error::Parse(format!("{}: {}", name, reason)),
            other => other,
        })
    }

    fn schema(&self, table: &str) -> Result<&TableSchema> {
        self.schemas
            .get(table)
            .ok_or_else(|| Error::Schema(format!("table {} is not registered", table)))
    }
}
