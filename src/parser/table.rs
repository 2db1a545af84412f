use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Text(String),
    Integer(i64),
    Decimal(f64),
    Timestamp(DateTime<Utc>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => Ok(()),
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Integer(v) => write!(f, "{}", v),
            FieldValue::Decimal(v) => write!(f, "{}", v),
            FieldValue::Timestamp(ts) => f.write_str(&ts.to_rfc3339_opts(SecondsFormat::Secs, true)),
        }
    }
}

/// One parsed row, values in the order of its table schema's columns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub values: Vec<FieldValue>,
}

impl Record {
    pub fn new(values: Vec<FieldValue>) -> Self {
        Self { values }
    }

    pub fn get(&self, index: usize) -> Option<&FieldValue> {
        self.values.get(index)
    }
}

/// Parsed rows grouped by table name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableSet {
    tables: BTreeMap<String, Vec<Record>>,
}

impl TableSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, table: &str, record: Record) {
        self.tables.entry(table.to_string()).or_default().push(record);
    }

    pub fn extend(&mut self, other: TableSet) {
        for (table, records) in other.tables {
            self.tables.entry(table).or_default().extend(records);
        }
    }

    pub fn get(&self, table: &str) -> Option<&[Record]> {
        self.tables.get(table).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Record])> {
        self.tables.iter().map(|(name, records)| (name.as_str(), records.as_slice()))
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.keys().map(String::as_str).collect()
    }

    pub fn total_records(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_records() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowError {
    pub table: String,
    pub line: u64,
    pub reason: String,
}

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} line {}: {}", self.table, self.line, self.reason)
    }
}

pub type RowOutcome = std::result::Result<Record, RowError>;

/// A table set together with what went wrong while building it.
#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    pub tables: TableSet,
    pub row_errors: usize,
    pub error_detail: Option<String>,
    pub files_parsed: usize,
    pub files_failed: usize,
}

impl ParseOutcome {
    pub fn record(&mut self, table: &str, outcome: RowOutcome) {
        match outcome {
            Ok(record) => self.tables.push(table, record),
            Err(err) => {
                log::debug!("Skipping row: {}", err);
                self.row_errors += 1;
                if self.error_detail.is_none() {
                    self.error_detail = Some(err.to_string());
                }
            }
        }
    }

    pub fn merge(&mut self, other: ParseOutcome) {
        self.tables.extend(other.tables);
        self.row_errors += other.row_errors;
        if self.error_detail.is_none() {
            self.error_detail = other.error_detail;
        }
        self.files_parsed += other.files_parsed;
        self.files_failed += other.files_failed;
    }

    /// Rows seen, valid or not.
    pub fn rows_seen(&self) -> usize {
        self.tables.total_records() + self.row_errors
    }
}
