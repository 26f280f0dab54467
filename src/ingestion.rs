use std::fs;
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, StringRecord, Trim};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};

/// One data row of the source extract, with the header names it was read under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub position: usize,
    pub fields: Vec<(String, String)>,
}

impl RawRecord {
    pub fn new(position: usize, fields: Vec<(String, String)>) -> Self {
        Self { position, fields }
    }

    /// Case-insensitive column lookup; empty values read as absent.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, value)| value.trim())
            .filter(|value| !value.is_empty())
    }

    /// First non-empty value among the given column aliases.
    pub fn first_of(&self, columns: &[&str]) -> Option<&str> {
        columns.iter().find_map(|column| self.get(column))
    }
}

pub trait RecordSource: Send + Sync {
    fn load(&self) -> AppResult<Vec<RawRecord>>;

    fn describe(&self) -> String;
}

pub struct CsvFileSource {
    path: PathBuf,
}

impl CsvFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RecordSource for CsvFileSource {
    fn load(&self) -> AppResult<Vec<RawRecord>> {
        read_csv_file(&self.path)
    }

    fn describe(&self) -> String {
        format!("csv:{}", self.path.display())
    }
}

#[derive(Default)]
pub struct InMemorySource {
    records: Vec<RawRecord>,
}

impl InMemorySource {
    pub fn new(records: Vec<RawRecord>) -> Self {
        Self { records }
    }
}

impl RecordSource for InMemorySource {
    fn load(&self) -> AppResult<Vec<RawRecord>> {
        Ok(self.records.clone())
    }

    fn describe(&self) -> String {
        format!("memory:{} rows", self.records.len())
    }
}

pub fn read_csv_file(path: &Path) -> AppResult<Vec<RawRecord>> {
    let bytes = fs::read(path).map_err(|err| {
        AppError::Ingestion(format!("unable to read {}: {err}", path.display()))
    })?;
    parse_csv(&bytes)
}

pub fn parse_csv(bytes: &[u8]) -> AppResult<Vec<RawRecord>> {
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(AppError::Ingestion("source file is empty".into()));
    }

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(Trim::All)
        .flexible(true)
        .from_reader(bytes);

    let headers = reader
        .headers()
        .map_err(|err| AppError::Ingestion(format!("unreadable header row: {err}")))?
        .clone();
    let columns = header_names(&headers)?;

    let mut records = Vec::new();
    let mut skipped = 0_usize;
    for (index, result) in reader.records().enumerate() {
        let position = index + 1;
        let row = match result {
            Ok(row) => row,
            Err(err) => {
                warn!(?err, position, "skipping unparsable csv row");
                skipped += 1;
                continue;
            }
        };
        if row.len() != columns.len() {
            warn!(
                position,
                expected = columns.len(),
                found = row.len(),
                "skipping csv row with wrong column count"
            );
            skipped += 1;
            continue;
        }
        records.push(RawRecord::new(position, zip_row(&columns, &row)));
    }

    if records.is_empty() && skipped > 0 {
        return Err(AppError::Ingestion(format!(
            "none of the {skipped} data rows match the header layout"
        )));
    }

    debug!(rows = records.len(), skipped, "parsed csv extract");
    Ok(records)
}

fn header_names(headers: &StringRecord) -> AppResult<Vec<String>> {
    let columns: Vec<String> = headers
        .iter()
        .map(|name| name.trim_start_matches('\u{feff}').trim().to_string())
        .collect();
    if columns.iter().all(|name| name.is_empty()) {
        return Err(AppError::Ingestion("header row is empty".into()));
    }
    Ok(columns)
}

fn zip_row(columns: &[String], row: &StringRecord) -> Vec<(String, String)> {
    columns
        .iter()
        .cloned()
        .zip(row.iter().map(str::to_string))
        .collect()
}
