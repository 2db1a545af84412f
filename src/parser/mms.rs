//! Scanner for the grid operator's multi-table report format.
//!
//! ```text
//! C,NEMP.WORLD,DISPATCHIS,AEMO,PUBLIC,2022/06/12,10:05:14,0000000366159732,DISPATCHIS,0000000366159726
//! I,DISPATCH,PRICE,5,SETTLEMENTDATE,RUNNO,REGIONID,DISPATCHINTERVAL,INTERVENTION,RRP
//! D,DISPATCH,PRICE,5,"2022/06/12 10:05:00",1,NSW1,20220612001,0,212.4
//! C,"END OF REPORT",14
//! ```
//!
//! `I` rows declare a table and its column order, `D` rows carry data for the
//! most recently declared table and `C` rows are comments, headers or footers.

use crate::error::{Error, Result};
use crate::parser::schema::{ColumnMapping, SchemaRegistry, TableSchema};
use crate::parser::table::{ParseOutcome, RowError, RowOutcome};
use chrono_tz::Tz;
use csv::StringRecord;

const PREFIX_WIDTH: usize = 4;

struct ActiveTable<'r> {
    schema: &'r TableSchema,
    report: String,
    subtype: String,
    mapping: ColumnMapping,
}

impl ActiveTable<'_> {
    fn read_row(&self, row: &StringRecord, timezone: Tz, line: u64) -> RowOutcome {
        let error = |reason: String| RowError {
            table: self.schema.name.clone(),
            line,
            reason,
        };

        let report = row.get(1).unwrap_or_default().trim();
        let subtype = row.get(2).unwrap_or_default().trim();
        if !report.eq_ignore_ascii_case(&self.report) || !subtype.eq_ignore_ascii_case(&self.subtype) {
            return Err(error(format!(
                "data row for {}_{} inside {}",
                report, subtype, self.schema.name
            )));
        }

        let fields: Vec<&str> = row.iter().skip(PREFIX_WIDTH).collect();
        self.schema
            .coerce_row(&self.mapping, &fields, timezone)
            .map_err(error)
    }
}

fn declare_table<'r>(row: &StringRecord, registry: &'r SchemaRegistry, line: u64) -> Option<ActiveTable<'r>> {
    if row.len() <= PREFIX_WIDTH {
        log::warn!("Table declaration on line {} has no columns", line);
        return None;
    }

    let report = row.get(1).unwrap_or_default().trim().to_string();
    let subtype = row.get(2).unwrap_or_default().trim().to_string();
    let name = format!("{}_{}", report, subtype).to_lowercase();

    let Some(schema) = registry.get(&name) else {
        log::debug!("Skipping unregistered table {}", name);
        return None;
    };

    match schema.map_header(row.iter().skip(PREFIX_WIDTH)) {
        Ok(mapping) => Some(ActiveTable {
            schema,
            report,
            subtype,
            mapping,
        }),
        Err(reason) => {
            log::warn!("Ignoring table {} on line {}: {}", name, line, reason);
            None
        }
    }
}

pub(crate) fn parse_mms(text: &str, registry: &SchemaRegistry, timezone: Tz) -> Result<ParseOutcome> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut outcome = ParseOutcome::default();
    let mut current: Option<ActiveTable> = None;
    let mut recognized = 0usize;

    for (index, row) in reader.records().enumerate() {
        let line = index as u64 + 1;

        let row = match row {
            Ok(row) => row,
            Err(e) => {
                if let Some(active) = &current {
                    outcome.record(
                        &active.schema.name,
                        Err(RowError {
                            table: active.schema.name.clone(),
                            line,
                            reason: e.to_string(),
                        }),
                    );
                }
                continue;
            }
        };

        match row.get(0).map(str::trim) {
            Some("C") | Some("c") => {}
            Some("I") | Some("i") => {
                current = declare_table(&row, registry, line);
                if current.is_some() {
                    recognized += 1;
                }
            }
            Some("D") | Some("d") => {
                if let Some(active) = &current {
                    let result = active.read_row(&row, timezone, line);
                    outcome.record(&active.schema.name, result);
                }
            }
            other => log::trace!("Ignoring row type {:?} on line {}", other, line),
        }
    }

    if recognized == 0 {
        return Err(Error::Parse("no recognizable tables".to_string()));
    }

    outcome.files_parsed = 1;
    Ok(outcome)
}
