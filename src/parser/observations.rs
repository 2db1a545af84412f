use crate::error::{Error, Result};
use crate::parser::schema::TableSchema;
use crate::parser::table::{ParseOutcome, Record, RowError};
use chrono_tz::Tz;
use serde_json::{Map, Value};

/// Reads a weather observation feed shaped `{"observations": {"data": [{...}, ...]}}`.
pub(crate) fn parse_observations(text: &str, schema: &TableSchema, timezone: Tz) -> Result<ParseOutcome> {
    let document: Value =
        serde_json::from_str(text).map_err(|e| Error::Parse(format!("invalid JSON: {}", e)))?;

    let rows = document
        .pointer("/observations/data")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Parse("missing observations.data".to_string()))?;

    let mut outcome = ParseOutcome::default();
    for (index, row) in rows.iter().enumerate() {
        let result = match row.as_object() {
            Some(fields) => observation_record(schema, fields, timezone),
            None => Err("observation is not an object".to_string()),
        };

        outcome.record(
            &schema.name,
            result.map_err(|reason| RowError {
                table: schema.name.clone(),
                line: index as u64 + 1,
                reason,
            }),
        );
    }

    outcome.files_parsed = 1;
    Ok(outcome)
}

fn observation_record(
    schema: &TableSchema,
    fields: &Map<String, Value>,
    timezone: Tz,
) -> std::result::Result<Record, String> {
    let values: Vec<String> = fields.values().map(scalar_text).collect();
    let cells: Vec<&str> = values.iter().map(String::as_str).collect();
    let mapping = schema.map_header(fields.keys().map(String::as_str))?;
    schema.coerce_row(&mapping, &cells, timezone)
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
