use crate::error::{Error, Result};
use crate::parser::schema::TableSchema;
use crate::parser::table::{ParseOutcome, RowError};
use chrono_tz::Tz;

/// Reads a single-table CSV file whose first row names the columns.
pub(crate) fn parse_csv_table(text: &str, schema: &TableSchema, timezone: Tz) -> Result<ParseOutcome> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers = reader.headers()?.clone();
    let mapping = schema
        .map_header(headers.iter())
        .map_err(Error::Parse)?;

    let mut outcome = ParseOutcome::default();
    for (index, row) in reader.records().enumerate() {
        let line = index as u64 + 2;
        let result = match row {
            Ok(row) => {
                let fields: Vec<&str> = row.iter().collect();
                schema.coerce_row(&mapping, &fields, timezone)
            }
            Err(e) => Err(e.to_string()),
        };

        outcome.record(
            &schema.name,
            result.map_err(|reason| RowError {
                table: schema.name.clone(),
                line,
                reason,
            }),
        );
    }

    outcome.files_parsed = 1;
    Ok(outcome)
}
