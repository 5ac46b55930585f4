//! Reading item ID lists
//!
//! IDs come either from one column of a CSV file with a header row or from a
//! plain list with one ID per line. Values are trimmed, blanks skipped,
//! invalid IDs logged and skipped, and duplicates dropped keeping the first
//! occurrence.

use regex::Regex;
use std::collections::HashSet;
use std::path::Path;

use crate::types::ItemId;
use crate::{Error, Result};

/// Layout of an ID list file
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdListFormat {
    /// CSV with a header row; IDs are read from the named column
    Csv {
        /// Header of the ID column
        column: String,
    },
    /// One ID per line; `#` starts a comment line
    Lines,
}

/// Parsed ID list
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdList {
    /// Valid unique IDs in input order
    pub ids: Vec<ItemId>,
    /// Values rejected by the ID pattern
    pub invalid: usize,
    /// Repeated values that were dropped
    pub duplicates: usize,
}

/// Read and parse an ID list file
pub async fn read_id_list(path: &Path, format: &IdListFormat, pattern: &Regex) -> Result<IdList> {
    let text = tokio::fs::read_to_string(path).await?;
    let list = parse_id_list(&text, format, pattern)?;
    tracing::info!(
        path = %path.display(),
        ids = list.ids.len(),
        invalid = list.invalid,
        duplicates = list.duplicates,
        "Read ID list"
    );
    Ok(list)
}

/// Parse ID list text
///
/// # Errors
///
/// [`Error::Config`] when a CSV input has no header or lacks the requested
/// column.
pub fn parse_id_list(text: &str, format: &IdListFormat, pattern: &Regex) -> Result<IdList> {
    let raw: Vec<String> = match format {
        IdListFormat::Lines => text
            .lines()
            .map(str::trim)
            .filter(|l| !l.starts_with('#'))
            .map(str::to_string)
            .collect(),
        IdListFormat::Csv { column } => csv_column(text, column)?,
    };

    let mut list = IdList::default();
    let mut seen = HashSet::new();

    for (index, value) in raw.into_iter().enumerate() {
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        if !pattern.is_match(value) {
            tracing::warn!(entry = index + 1, value, "Invalid item ID format, skipping");
            list.invalid += 1;
            continue;
        }
        let id = match ItemId::new(value) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(entry = index + 1, value, error = %e, "Invalid item ID, skipping");
                list.invalid += 1;
                continue;
            }
        };
        if seen.insert(id.clone()) {
            list.ids.push(id);
        } else {
            list.duplicates += 1;
        }
    }

    Ok(list)
}

/// Values of one CSV column, by header name
fn csv_column(text: &str, column: &str) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let header = reader.headers()?.clone();
    if header.is_empty() {
        return Err(Error::config("id_column", "input file is empty"));
    }
    let index = header
        .iter()
        .position(|h| h.trim().trim_start_matches('\u{feff}') == column)
        .ok_or_else(|| {
            Error::config(
                "id_column",
                format!("column '{}' not found in header {:?}", column, header),
            )
        })?;

    let mut values = Vec::new();
    for record in reader.records() {
        if let Some(value) = record?.get(index) {
            values.push(value.to_string());
        }
    }
    Ok(values)
}
