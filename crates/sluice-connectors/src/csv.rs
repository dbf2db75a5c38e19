//! CSV file source and sink.
//!
//! The first row is the header. Column types are inferred from the data:
//! a column whose non-empty fields all parse as integers is `INTEGER`, one
//! whose fields all parse as numbers is `REAL`, anything else is `TEXT`.
//! Empty fields load as NULL and NULLs export as empty fields.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use sluice_types::connector::{Sink, Source};
use sluice_types::schema::{ColumnDef, ColumnType};
use sluice_types::value::{Batch, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Inferred {
    Integer,
    Real,
    Text,
}

impl Inferred {
    /// Narrowest type that still holds `field`, given the type so far.
    fn widen(self, field: &str) -> Self {
        match self {
            Self::Integer if field.parse::<i64>().is_ok() => Self::Integer,
            Self::Integer | Self::Real if field.parse::<f64>().is_ok() => Self::Real,
            _ => Self::Text,
        }
    }

    fn column_type(self) -> ColumnType {
        match self {
            Self::Integer => ColumnType::Integer,
            Self::Real => ColumnType::Real,
            Self::Text => ColumnType::Text,
        }
    }

    fn coerce(self, field: &str) -> Value {
        if field.is_empty() {
            return Value::Null;
        }
        match self {
            Self::Integer => field.parse::<i64>().map_or_else(|_| Value::from(field), Value::Integer),
            Self::Real => field.parse::<f64>().map_or_else(|_| Value::from(field), Value::Real),
            Self::Text => Value::from(field),
        }
    }
}

/// Reads a whole CSV file into one batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvSource {
    delimiter: u8,
}

impl CsvSource {
    #[must_use]
    pub fn new() -> Self {
        Self { delimiter: b',' }
    }

    #[must_use]
    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    fn delimiter(self) -> u8 {
        if self.delimiter == 0 {
            b','
        } else {
            self.delimiter
        }
    }
}

impl Source for CsvSource {
    fn read(&self, location: &str) -> Result<Batch> {
        let path = Path::new(location);
        let mut reader = ::csv::ReaderBuilder::new()
            .has_headers(true)
            .delimiter(self.delimiter())
            .from_path(path)
            .with_context(|| format!("Failed to open CSV file: {}", path.display()))?;

        let headers: Vec<String> = reader
            .headers()
            .with_context(|| format!("Failed to read CSV header: {}", path.display()))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        if let Some(pos) = headers.iter().position(String::is_empty) {
            anyhow::bail!("CSV header column {} is empty in {}", pos + 1, path.display());
        }

        let mut records = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record.with_context(|| {
                format!("Failed to read CSV record {} of {}", line + 1, path.display())
            })?;
            if record.len() != headers.len() {
                anyhow::bail!(
                    "CSV record {} of {} has {} fields, header has {}",
                    line + 1,
                    path.display(),
                    record.len(),
                    headers.len()
                );
            }
            records.push(record);
        }

        let mut inferred = vec![Inferred::Integer; headers.len()];
        let mut seen = vec![false; headers.len()];
        for record in &records {
            for (i, field) in record.iter().enumerate() {
                if !field.is_empty() {
                    inferred[i] = inferred[i].widen(field);
                    seen[i] = true;
                }
            }
        }
        // All-empty columns carry no evidence.
        for (ty, seen) in inferred.iter_mut().zip(&seen) {
            if !seen {
                *ty = Inferred::Text;
            }
        }

        let columns = headers
            .iter()
            .zip(&inferred)
            .map(|(name, ty)| ColumnDef::new(name.as_str(), ty.column_type()))
            .collect();
        let mut batch = Batch::new(columns);
        batch.rows = records
            .iter()
            .map(|record| {
                record
                    .iter()
                    .zip(&inferred)
                    .map(|(field, ty)| ty.coerce(field))
                    .collect()
            })
            .collect();

        tracing::debug!(path = %path.display(), columns = headers.len(), rows = batch.len(), "Read CSV file");
        Ok(batch)
    }
}

/// Writes a batch as a CSV file with a header row, replacing any existing
/// file.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvSink;

impl CsvSink {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Sink for CsvSink {
    fn write(&self, location: &str, batch: &Batch) -> Result<u64> {
        let path = Path::new(location);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }
        let file = File::create(path)
            .with_context(|| format!("Failed to create CSV file: {}", path.display()))?;
        let mut writer = ::csv::Writer::from_writer(file);

        writer.write_record(batch.columns.iter().map(|c| c.name.as_str()))?;
        for row in &batch.rows {
            writer.write_record(row.iter().map(Value::to_text))?;
        }
        writer
            .flush()
            .with_context(|| format!("Failed to flush CSV file: {}", path.display()))?;

        tracing::debug!(path = %path.display(), rows = batch.len(), "Wrote CSV file");
        Ok(batch.len() as u64)
    }
}
