use crate::error::{Error, Result};
use crate::parser::table::{FieldValue, Record};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use validator::{Validate, ValidationError};

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Integer,
    Decimal,
    Timestamp,
}

impl ColumnType {
    /// Converts one raw cell. Blank cells become `Null`.
    pub fn coerce(&self, raw: &str, timezone: Tz) -> std::result::Result<FieldValue, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(FieldValue::Null);
        }

        match self {
            ColumnType::Text => Ok(FieldValue::Text(raw.to_string())),
            ColumnType::Integer => raw
                .parse::<i64>()
                .map(FieldValue::Integer)
                .map_err(|_| format!("{:?} is not an integer", raw)),
            ColumnType::Decimal => raw
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(FieldValue::Decimal)
                .ok_or_else(|| format!("{:?} is not a decimal", raw)),
            ColumnType::Timestamp => parse_timestamp(raw, timezone).map(FieldValue::Timestamp),
        }
    }

    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Text | ColumnType::Timestamp => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Decimal => "REAL",
        }
    }
}

fn parse_timestamp(raw: &str, timezone: Tz) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }

    // compact form used by weather feeds: 20220612143000
    let expanded;
    let raw = if raw.len() == 14 && raw.bytes().all(|b| b.is_ascii_digit()) {
        expanded = format!(
            "{}-{}-{} {}:{}:{}",
            &raw[0..4],
            &raw[4..6],
            &raw[6..8],
            &raw[8..10],
            &raw[10..12],
            &raw[12..14]
        );
        expanded.as_str()
    } else {
        raw
    };

    let naive = TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .ok_or_else(|| format!("{:?} is not a recognized timestamp", raw))?;

    timezone
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| format!("{} does not exist in {}", naive, timezone))
}

/// Lowercases and folds punctuation so `Price ($/MWh)` matches `price_mwh`.
pub fn normalize_header(header: &str) -> String {
    let mut out = String::with_capacity(header.len());
    for ch in header.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

pub fn validate_identifier(value: &str) -> std::result::Result<(), ValidationError> {
    let valid = !value.is_empty()
        && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !value.starts_with(|c: char| c.is_ascii_digit());

    if valid {
        Ok(())
    } else {
        let mut err = ValidationError::new("identifier");
        err.message = Some(Cow::from(format!("{:?} is not a valid identifier", value)));
        Err(err)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: ColumnType,

    /// Header or field name in the source when it differs from `name`.
    #[serde(default)]
    pub source: Option<String>,
}

impl ColumnDef {
    pub fn new(name: &str, kind: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            kind,
            source: None,
        }
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    pub fn source_name(&self) -> &str {
        self.source.as_deref().unwrap_or(&self.name)
    }
}

/// Where each schema column sits within a declared header.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMapping {
    positions: Vec<Option<usize>>,
    width: usize,
}

impl ColumnMapping {
    pub fn width(&self) -> usize {
        self.width
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_table_schema"))]
pub struct TableSchema {
    #[validate(custom = "validate_identifier")]
    pub name: String,

    pub columns: Vec<ColumnDef>,

    #[validate(length(min = 1))]
    pub natural_key: Vec<String>,
}

fn validate_table_schema(schema: &TableSchema) -> std::result::Result<(), ValidationError> {
    if schema.columns.is_empty() {
        return Err(ValidationError::new("columns"));
    }

    let mut seen = HashSet::new();
    for column in &schema.columns {
        validate_identifier(&column.name)?;
        if !seen.insert(column.name.to_ascii_lowercase()) {
            let mut err = ValidationError::new("columns");
            err.message = Some(Cow::from(format!("duplicate column {}", column.name)));
            return Err(err);
        }
    }

    for key in &schema.natural_key {
        if schema.column_index(key).is_none() {
            let mut err = ValidationError::new("natural_key");
            err.message = Some(Cow::from(format!("key column {} is not declared", key)));
            return Err(err);
        }
    }
    Ok(())
}

impl TableSchema {
    pub fn new(name: &str, columns: Vec<ColumnDef>, natural_key: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            columns,
            natural_key: natural_key.iter().map(|k| k.to_string()).collect(),
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn is_key(&self, name: &str) -> bool {
        self.natural_key.iter().any(|k| k.eq_ignore_ascii_case(name))
    }

    pub fn key_indexes(&self) -> Vec<usize> {
        self.natural_key
            .iter()
            .filter_map(|k| self.column_index(k))
            .collect()
    }

    pub fn key_of<'r>(&self, record: &'r Record) -> Vec<&'r FieldValue> {
        self.key_indexes()
            .into_iter()
            .filter_map(|i| record.values.get(i))
            .collect()
    }

    /// The source interval a record belongs to: its first timestamp key column.
    pub fn interval_of(&self, record: &Record) -> Option<DateTime<Utc>> {
        self.key_indexes()
            .into_iter()
            .filter(|&i| self.columns[i].kind == ColumnType::Timestamp)
            .find_map(|i| match record.values.get(i) {
                Some(FieldValue::Timestamp(ts)) => Some(*ts),
                _ => None,
            })
    }

    /// Locates every schema column in `header`. Key columns must be present;
    /// other missing columns are read as null.
    pub fn map_header<'h, I>(&self, header: I) -> std::result::Result<ColumnMapping, String>
    where
        I: IntoIterator<Item = &'h str>,
    {
        let header: Vec<String> = header.into_iter().map(normalize_header).collect();

        let positions: Vec<Option<usize>> = self
            .columns
            .iter()
            .map(|column| {
                let wanted = normalize_header(column.source_name());
                header.iter().position(|h| *h == wanted)
            })
            .collect();

        for (column, position) in self.columns.iter().zip(&positions) {
            if position.is_none() && self.is_key(&column.name) {
                return Err(format!(
                    "key column {} missing from header of {}",
                    column.source_name(),
                    self.name
                ));
            }
        }

        Ok(ColumnMapping {
            positions,
            width: header.len(),
        })
    }

    /// Validates one data row against its declared header and coerces each cell.
    pub fn coerce_row(
        &self,
        mapping: &ColumnMapping,
        fields: &[&str],
        timezone: Tz,
    ) -> std::result::Result<Record, String> {
        if fields.len() != mapping.width {
            return Err(format!(
                "expected {} columns, found {}",
                mapping.width,
                fields.len()
            ));
        }

        let mut values = Vec::with_capacity(self.columns.len());
        for (column, position) in self.columns.iter().zip(&mapping.positions) {
            let raw = position.map(|p| fields[p]).unwrap_or("");
            let value = column
                .kind
                .coerce(raw, timezone)
                .map_err(|e| format!("{}: {}", column.name, e))?;

            if value.is_null() && self.is_key(&column.name) {
                return Err(format!("{}: key column is empty", column.name));
            }
            values.push(value);
        }

        Ok(Record::new(values))
    }
}

/// Table schemas known to the parser and the ingest controller, by lowercase name.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    tables: HashMap<String, TableSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a schema, replacing any earlier schema with the same name.
    pub fn register(&mut self, schema: TableSchema) -> Result<()> {
        schema
            .validate()
            .map_err(|e| Error::Config(format!("table {}: {}", schema.name, e)))?;

        let key = schema.name.to_ascii_lowercase();
        if self.tables.insert(key, schema).is_some() {
            log::debug!("Replaced registered table schema");
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(&name.to_ascii_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tables.values().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Tables published by the grid operator, rooftop and weather feeds.
    pub fn builtin() -> Self {
        use ColumnType::*;

        let schemas = vec![
            TableSchema::new(
                "dispatch_unit_scada",
                vec![
                    ColumnDef::new("settlementdate", Timestamp),
                    ColumnDef::new("duid", Text),
                    ColumnDef::new("scadavalue", Decimal),
                ],
                &["settlementdate", "duid"],
            ),
            TableSchema::new(
                "dispatch_price",
                vec![
                    ColumnDef::new("settlementdate", Timestamp),
                    ColumnDef::new("regionid", Text),
                    ColumnDef::new("intervention", Integer),
                    ColumnDef::new("rrp", Decimal),
                ],
                &["settlementdate", "regionid", "intervention"],
            ),
            TableSchema::new(
                "dispatch_regionsum",
                vec![
                    ColumnDef::new("settlementdate", Timestamp),
                    ColumnDef::new("regionid", Text),
                    ColumnDef::new("intervention", Integer),
                    ColumnDef::new("totaldemand", Decimal),
                    ColumnDef::new("availablegeneration", Decimal),
                    ColumnDef::new("netinterchange", Decimal),
                ],
                &["settlementdate", "regionid", "intervention"],
            ),
            TableSchema::new(
                "dispatch_interconnectorres",
                vec![
                    ColumnDef::new("settlementdate", Timestamp),
                    ColumnDef::new("interconnectorid", Text),
                    ColumnDef::new("intervention", Integer),
                    ColumnDef::new("mwflow", Decimal),
                    ColumnDef::new("mwlosses", Decimal),
                ],
                &["settlementdate", "interconnectorid", "intervention"],
            ),
            TableSchema::new(
                "trading_price",
                vec![
                    ColumnDef::new("settlementdate", Timestamp),
                    ColumnDef::new("regionid", Text),
                    ColumnDef::new("rrp", Decimal),
                    ColumnDef::new("invalidflag", Text),
                ],
                &["settlementdate", "regionid"],
            ),
            TableSchema::new(
                "trading_interconnectorres",
                vec![
                    ColumnDef::new("settlementdate", Timestamp),
                    ColumnDef::new("interconnectorid", Text),
                    ColumnDef::new("meteredmwflow", Decimal),
                ],
                &["settlementdate", "interconnectorid"],
            ),
            TableSchema::new(
                "rooftop_actual",
                vec![
                    ColumnDef::new("interval_datetime", Timestamp),
                    ColumnDef::new("regionid", Text),
                    ColumnDef::new("power", Decimal),
                    ColumnDef::new("qi", Decimal),
                    ColumnDef::new("type", Text),
                ],
                &["interval_datetime", "regionid", "type"],
            ),
            TableSchema::new(
                "rooftop_forecast",
                vec![
                    ColumnDef::new("interval_datetime", Timestamp),
                    ColumnDef::new("regionid", Text),
                    ColumnDef::new("powermean", Decimal),
                ],
                &["interval_datetime", "regionid"],
            ),
            TableSchema::new(
                "wem_balancing_summary",
                vec![
                    ColumnDef::new("trading_interval", Timestamp).with_source("Trading Interval"),
                    ColumnDef::new("forecast_load", Decimal).with_source("Load Forecast (MW)"),
                    ColumnDef::new("price", Decimal).with_source("Price ($/MWh)"),
                    ColumnDef::new("generation_total", Decimal)
                        .with_source("Actual Total Generation (MW)"),
                ],
                &["trading_interval"],
            ),
            TableSchema::new(
                "wem_facility_scada",
                vec![
                    ColumnDef::new("trading_interval", Timestamp).with_source("Trading Interval"),
                    ColumnDef::new("facility_code", Text).with_source("Facility Code"),
                    ColumnDef::new("generated", Decimal)
                        .with_source("EOI Quantity (MW)"),
                ],
                &["trading_interval", "facility_code"],
            ),
            TableSchema::new(
                "bom_observation",
                vec![
                    ColumnDef::new("station_id", Text).with_source("wmo"),
                    ColumnDef::new("observation_time", Timestamp)
                        .with_source("local_date_time_full"),
                    ColumnDef::new("temp_air", Decimal).with_source("air_temp"),
                    ColumnDef::new("humidity", Decimal).with_source("rel_hum"),
                    ColumnDef::new("wind_speed", Decimal).with_source("wind_spd_kmh"),
                    ColumnDef::new("pressure", Decimal).with_source("press"),
                ],
                &["station_id", "observation_time"],
            ),
        ];

        let mut registry = Self::new();
        for schema in schemas {
            let key = schema.name.to_ascii_lowercase();
            registry.tables.insert(key, schema);
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Australia::Brisbane;

    fn scada() -> TableSchema {
        SchemaRegistry::builtin()
            .get("DISPATCH_UNIT_SCADA")
            .cloned()
            .unwrap()
    }

    #[test]
    fn builtin_schemas_are_valid() {
        let registry = SchemaRegistry::builtin();
        for name in registry.names() {
            registry.get(name).unwrap().validate().unwrap();
        }
        assert!(registry.contains("bom_observation"));
    }

    #[test]
    fn coerces_local_timestamps_to_utc() {
        let value = ColumnType::Timestamp
            .coerce("2022/06/12 10:05:00", Brisbane)
            .unwrap();
        assert_eq!(
            value,
            FieldValue::Timestamp(Utc.with_ymd_and_hms(2022, 6, 12, 0, 5, 0).unwrap())
        );

        let compact = ColumnType::Timestamp.coerce("20220612100500", Brisbane).unwrap();
        assert_eq!(compact, value);
    }

    #[test]
    fn blank_cells_are_null_and_bad_numbers_fail() {
        assert_eq!(ColumnType::Decimal.coerce("  ", Brisbane).unwrap(), FieldValue::Null);
        assert!(ColumnType::Decimal.coerce("abc", Brisbane).is_err());
        assert!(ColumnType::Integer.coerce("1.5", Brisbane).is_err());
    }

    #[test]
    fn header_mapping_requires_key_columns() {
        let schema = scada();
        let err = schema.map_header(["SETTLEMENTDATE", "SCADAVALUE"]).unwrap_err();
        assert!(err.contains("duid"));

        let mapping = schema
            .map_header(["SETTLEMENTDATE", "DUID", "SCADAVALUE", "LASTCHANGED"])
            .unwrap();
        assert_eq!(mapping.width(), 4);
    }

    #[test]
    fn coerce_row_rejects_wrong_width_and_empty_keys() {
        let schema = scada();
        let mapping = schema.map_header(["SETTLEMENTDATE", "DUID", "SCADAVALUE"]).unwrap();

        let short = schema.coerce_row(&mapping, &["2022/06/12 10:05:00", "BW01"], Brisbane);
        assert!(short.unwrap_err().contains("expected 3 columns"));

        let no_key = schema.coerce_row(&mapping, &["2022/06/12 10:05:00", "", "1.0"], Brisbane);
        assert!(no_key.unwrap_err().contains("duid"));

        let ok = schema
            .coerce_row(&mapping, &["2022/06/12 10:05:00", "BW01", "512.3"], Brisbane)
            .unwrap();
        assert_eq!(ok.values[2], FieldValue::Decimal(512.3));
    }

    #[test]
    fn header_normalization_folds_punctuation() {
        assert_eq!(normalize_header(" Price ($/MWh) "), "price_mwh");
        assert_eq!(normalize_header("SETTLEMENTDATE"), "settlementdate");
    }

    #[test]
    fn register_rejects_unknown_key_column() {
        let mut registry = SchemaRegistry::new();
        let bad = TableSchema::new(
            "broken",
            vec![ColumnDef::new("a", ColumnType::Text)],
            &["b"],
        );
        assert!(matches!(registry.register(bad), Err(Error::Config(_))));
        assert!(registry.is_empty());
    }
}
