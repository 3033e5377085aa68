use std::str::FromStr;

use miette::Diagnostic;
use rocket::http::ContentType;
use thiserror::Error;

use sluice_model::Value;
use sluice_store::Table;

#[derive(Debug, Error, Diagnostic)]
pub enum FormatError {
    #[error("unsupported format: {0}")]
    Unsupported(String),

    #[error("malformed {0} payload")]
    Malformed(&'static str),

    #[error("no dataset to format")]
    Empty,
}

/// History output encodings. The binary columnar family (parquet, arrow,
/// feather, avro) is intentionally not served here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    JsonRow,
    JsonColumn,
    Csv,
    Tsv,
    Psv,
}

impl FromStr for DataFormat {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<DataFormat, FormatError> {
        Ok(match s {
            "json" | "row" | "json:row" => DataFormat::JsonRow,
            "column" | "json:column" => DataFormat::JsonColumn,
            "csv" => DataFormat::Csv,
            "tsv" => DataFormat::Tsv,
            "psv" => DataFormat::Psv,
            other => return Err(FormatError::Unsupported(other.to_string())),
        })
    }
}

impl DataFormat {
    pub fn content_type(self) -> ContentType {
        match self {
            DataFormat::JsonRow | DataFormat::JsonColumn => ContentType::JSON,
            DataFormat::Csv => ContentType::CSV,
            DataFormat::Tsv | DataFormat::Psv => ContentType::Plain,
        }
    }

    fn delimiter(self) -> Option<u8> {
        match self {
            DataFormat::Csv => Some(b','),
            DataFormat::Tsv => Some(b'\t'),
            DataFormat::Psv => Some(b'|'),
            _ => None,
        }
    }
}

/// Convert timestamp cells to epoch milliseconds so downstream consumers
/// (JS Date in particular) get numbers, matching the wire contract of the
/// history endpoints.
pub fn jsify_timestamps(mut table: Table) -> Table {
    for row in &mut table.rows {
        for cell in row.iter_mut() {
            if let Value::Timestamp(ts) = cell {
                *cell = Value::Int(ts.timestamp_millis());
            }
        }
    }
    table
}

pub fn format_table(table: &Table, format: DataFormat) -> Result<String, FormatError> {
    if table.columns.is_empty() {
        return Err(FormatError::Empty);
    }
    match format {
        DataFormat::JsonRow => {
            let data: Vec<Vec<serde_json::Value>> = table
                .rows
                .iter()
                .map(|row| row.iter().map(Value::to_json).collect())
                .collect();
            Ok(serde_json::json!({ "columns": table.columns, "data": data }).to_string())
        }
        DataFormat::JsonColumn => {
            let mut columns: Vec<Vec<serde_json::Value>> =
                vec![Vec::with_capacity(table.rows.len()); table.columns.len()];
            for row in &table.rows {
                for (idx, cell) in row.iter().enumerate() {
                    columns[idx].push(cell.to_json());
                }
            }
            Ok(serde_json::json!({ "columns": table.columns, "data": columns }).to_string())
        }
        delimited => {
            let delimiter = delimited.delimiter().expect("delimited format");
            let mut writer = csv::WriterBuilder::new()
                .delimiter(delimiter)
                .from_writer(Vec::new());
            writer
                .write_record(&table.columns)
                .map_err(|_| FormatError::Malformed("csv"))?;
            for row in &table.rows {
                let record: Vec<String> = row
                    .iter()
                    .map(|cell| match cell {
                        Value::Null => String::new(),
                        other => other.to_string(),
                    })
                    .collect();
                writer
                    .write_record(&record)
                    .map_err(|_| FormatError::Malformed("csv"))?;
            }
            let bytes = writer
                .into_inner()
                .map_err(|_| FormatError::Malformed("csv"))?;
            String::from_utf8(bytes).map_err(|_| FormatError::Malformed("csv"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test-only inverse of `format_table`, proving the round-trip
    /// property. Delimited cells come back as integers or floats where
    /// they parse, strings otherwise.
    fn parse_table(raw: &str, format: DataFormat) -> Result<Table, FormatError> {
        match format {
            DataFormat::JsonRow | DataFormat::JsonColumn => {
                let parsed: serde_json::Value =
                    serde_json::from_str(raw).map_err(|_| FormatError::Malformed("json"))?;
                let columns: Vec<String> = parsed
                    .get("columns")
                    .and_then(|c| c.as_array())
                    .ok_or(FormatError::Malformed("json"))?
                    .iter()
                    .filter_map(|c| c.as_str().map(str::to_string))
                    .collect();
                let data = parsed
                    .get("data")
                    .and_then(|d| d.as_array())
                    .ok_or(FormatError::Malformed("json"))?;
                let cells: Vec<Vec<Value>> = data
                    .iter()
                    .map(|row| {
                        row.as_array()
                            .map(|cells| cells.iter().cloned().map(Value::from_json).collect())
                            .ok_or(FormatError::Malformed("json"))
                    })
                    .collect::<Result<_, _>>()?;
                let rows = if format == DataFormat::JsonRow {
                    cells
                } else {
                    transpose(cells)
                };
                Ok(Table { columns, rows })
            }
            delimited => {
                let delimiter = delimited.delimiter().expect("delimited format");
                let mut reader = csv::ReaderBuilder::new()
                    .delimiter(delimiter)
                    .from_reader(raw.as_bytes());
                let columns: Vec<String> = reader
                    .headers()
                    .map_err(|_| FormatError::Malformed("csv"))?
                    .iter()
                    .map(str::to_string)
                    .collect();
                let mut rows = Vec::new();
                for record in reader.records() {
                    let record = record.map_err(|_| FormatError::Malformed("csv"))?;
                    rows.push(
                        record
                            .iter()
                            .map(|cell| {
                                if cell.is_empty() {
                                    Value::Null
                                } else if let Ok(i) = cell.parse::<i64>() {
                                    Value::Int(i)
                                } else if let Ok(f) = cell.parse::<f64>() {
                                    Value::Float(f)
                                } else {
                                    Value::String(cell.to_string())
                                }
                            })
                            .collect(),
                    );
                }
                Ok(Table { columns, rows })
            }
        }
    }

    fn transpose(columns: Vec<Vec<Value>>) -> Vec<Vec<Value>> {
        let Some(len) = columns.first().map(Vec::len) else {
            return Vec::new();
        };
        (0..len)
            .map(|i| columns.iter().map(|col| col[i].clone()).collect())
            .collect()
    }

    fn sample() -> Table {
        Table {
            columns: vec!["ts".into(), "price".into(), "sym".into()],
            rows: vec![
                vec![
                    Value::Int(1_709_294_400_000),
                    Value::Float(40000.5),
                    Value::String("BTCUSD".into()),
                ],
                vec![Value::Int(1_709_294_700_000), Value::Null, Value::String("BTCUSD".into())],
            ],
        }
    }

    #[test]
    fn every_supported_format_round_trips() {
        for format in [
            DataFormat::JsonRow,
            DataFormat::JsonColumn,
            DataFormat::Csv,
            DataFormat::Tsv,
            DataFormat::Psv,
        ] {
            let table = sample();
            let encoded = format_table(&table, format).unwrap();
            let decoded = parse_table(&encoded, format).unwrap();
            assert_eq!(decoded, table, "{format:?}");
        }
    }

    #[test]
    fn aliases_resolve_and_binary_formats_are_rejected() {
        assert_eq!("json".parse::<DataFormat>().unwrap(), DataFormat::JsonRow);
        assert_eq!("row".parse::<DataFormat>().unwrap(), DataFormat::JsonRow);
        assert_eq!(
            "json:column".parse::<DataFormat>().unwrap(),
            DataFormat::JsonColumn
        );
        for rejected in ["parquet", "arrow", "feather", "avro", "orc"] {
            assert!(rejected.parse::<DataFormat>().is_err());
        }
    }

    #[test]
    fn timestamps_become_epoch_millis() {
        let table = Table {
            columns: vec!["ts".into()],
            rows: vec![vec![Value::Timestamp(
                chrono::TimeZone::with_ymd_and_hms(&chrono::Utc, 2024, 3, 1, 12, 0, 0).unwrap(),
            )]],
        };
        let jsified = jsify_timestamps(table);
        assert_eq!(jsified.rows[0][0], Value::Int(1_709_294_400_000));
    }

    #[test]
    fn csv_renders_nulls_as_empty_cells() {
        let encoded = format_table(&sample(), DataFormat::Csv).unwrap();
        let lines: Vec<&str> = encoded.lines().collect();
        assert_eq!(lines[0], "ts,price,sym");
        assert!(lines[2].contains(",,"));
    }
}
